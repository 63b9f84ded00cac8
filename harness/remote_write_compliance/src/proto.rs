//! Protobuf schemas for both remote-write protocol versions.
//!
//! The types are written out with `prost` derives rather than generated at
//! build time, so building the crate doesn't need `protoc`.

pub mod v1;
pub mod v2;

/// Fully-qualified name of the legacy request message.
pub const V1_SCHEMA: &str = "prometheus.WriteRequest";

/// Fully-qualified name of the symbol-table request message.
pub const V2_SCHEMA: &str = "io.prometheus.write.v2.Request";
