use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ComplianceError;
use crate::store::DEFAULT_POLL_INTERVAL;
use crate::transport::ProtocolVersion;
use crate::Result;

pub const DEFAULT_WRITE_PATH: &str = "/api/v1/write";
pub const DEFAULT_SCRAPE_PATH: &str = "/metrics";
pub const DEFAULT_BIND_ADDRESS: &str = "127.0.0.1:0";

/// Settings for one scenario run. Every field has a default, so a partial JSON
/// document is enough.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScenarioConfig {
    /// Overall deadline. Reaching it ends the run without failing it.
    #[serde(with = "millis")]
    pub timeout: Duration,
    /// How often `wait_for_count` re-checks the store.
    #[serde(with = "millis")]
    pub poll_interval: Duration,
    pub write_path: String,
    pub scrape_path: String,
    pub bind_address: String,
    /// How long a stopped sender gets to exit before it is killed.
    #[serde(with = "millis")]
    pub stop_grace_period: Duration,
    pub protocol_version: ProtocolVersion,
}

impl Default for ScenarioConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            poll_interval: DEFAULT_POLL_INTERVAL,
            write_path: DEFAULT_WRITE_PATH.to_string(),
            scrape_path: DEFAULT_SCRAPE_PATH.to_string(),
            bind_address: DEFAULT_BIND_ADDRESS.to_string(),
            stop_grace_period: Duration::from_secs(5),
            protocol_version: ProtocolVersion::V2,
        }
    }
}

impl ScenarioConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| ComplianceError::Config(e.to_string()))
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_protocol_version(mut self, version: ProtocolVersion) -> Self {
        self.protocol_version = version;
        self
    }
}

/// `Duration` as whole milliseconds.
pub(crate) mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        // CAST: u128 millis of any sane timeout fit a u64.
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
