//! A conformance harness for the Prometheus remote-write protocol.
//!
//! The harness plays the receiver: it serves a scrape target, launches the
//! sender under test against it, records every write the sender makes while
//! answering from a scripted list of responses, and then checks what was
//! captured against the protocol's MUST/SHOULD/MAY rules.

pub mod config;
pub mod endpoint;
pub mod error;
pub mod exemplars;
pub mod exposition;
mod macros;
pub mod message;
pub mod proto;
pub mod retry;
pub mod scenario;
pub mod sender;
pub mod store;
pub mod symbols;
pub mod transport;
pub mod util;
pub mod validate;

#[cfg(test)]
mod testhelper;

pub use config::ScenarioConfig;
pub use endpoint::{MockEndpoint, ResponseScript, RunningServer, ScriptedResponse};
pub use error::ComplianceError;
pub use exposition::{Exposition, ExpositionFormat};
pub use message::{MessageBuilder, MetricType, Series, WireMessage};
pub use scenario::{Orchestrator, ProcessLauncher, Scenario, ScenarioOutcome};
pub use sender::{ReferenceSender, RemoteWriteClient, WriteOutcome};
pub use store::{CapturedRequest, RequestStore};
pub use transport::{ProtocolVersion, WrittenCounts};
pub use validate::{Expectations, Level, Report};

pub type Result<T> = std::result::Result<T, crate::error::ComplianceError>;
