use std::any;
use std::fmt::Display;
use std::io;
use thiserror::Error;

/// Errors returned within the crate.
///
/// Every variant owns its data as strings so that the error can be stored on a
/// `CapturedRequest`, cloned into snapshots, and compared in tests.
#[derive(PartialEq, Eq, Clone, Error, Debug)]
pub enum ComplianceError {
    /// A symbol index pointed past the end of the symbol table.
    #[error("symbol index {index} out of range of table len {len}")]
    IndexOutOfRange { index: u32, len: usize },
    /// A label reference list held an odd number of entries.
    #[error("label reference list has odd length {0}")]
    OddLength(usize),
    /// An element of a reference list pointed past the end of the symbol table.
    #[error("reference {reference} at position {position} is invalid for symbol table len {len}")]
    InvalidReference {
        position: usize,
        reference: u32,
        len: usize,
    },
    /// The body could not be decompressed as block-format snappy.
    #[error("snappy decompression failed: {0}")]
    Compression(String),
    /// The body carried the snappy stream-identifier, i.e. framed instead of block format.
    #[error("body uses framed snappy, the protocol requires block format")]
    FramedSnappy,
    /// `Content-Encoding` named something other than snappy.
    #[error("unsupported content encoding '{0}'")]
    UnsupportedEncoding(String),
    /// The decompressed bytes were not a valid protobuf message.
    #[error("malformed {schema} message: {err}")]
    MalformedMessage { schema: &'static str, err: String },
    /// A failed attempt to cast an integer from one type to another.
    #[error("failed to cast {object_name} {value} from {from} to {to}")]
    FailedCast {
        from: &'static str,
        to: &'static str,
        value: String,
        object_name: String,
    },
    /// An HTTP exchange failed below the status-code level.
    #[error("http: {0}")]
    Http(String),
    /// The external sender or receiver could not be started or stopped.
    #[error("launcher: {0}")]
    Launch(String),
    /// Scrape text the exposition reader couldn't make sense of.
    #[error("exposition line {line}: {err}")]
    Exposition { line: usize, err: String },
    /// Scenario settings failed to parse.
    #[error("invalid configuration: {0}")]
    Config(String),
    /// An io operation failed.
    #[error("failed to {operation}: {err}")]
    Io { operation: String, err: String },
    /// A miscellaneous error.
    #[error("{0}")]
    Other(String),
}

impl ComplianceError {
    pub fn out_of_range(index: u32, len: usize) -> Self {
        ComplianceError::IndexOutOfRange { index, len }
    }

    pub fn failed_cast<T: Display, U>(value: T, object_name: &str) -> Self {
        ComplianceError::FailedCast {
            from: any::type_name::<T>(),
            to: any::type_name::<U>(),
            value: value.to_string(),
            object_name: object_name.to_string(),
        }
    }

    pub fn io(operation: &str, err: io::Error) -> Self {
        ComplianceError::Io {
            operation: operation.to_string(),
            err: err.to_string(),
        }
    }

    pub fn malformed(schema: &'static str, err: prost::DecodeError) -> Self {
        ComplianceError::MalformedMessage {
            schema,
            err: err.to_string(),
        }
    }

    /// Errors produced while turning an HTTP body into a message. These are
    /// recorded on the captured request rather than failing the endpoint.
    pub fn is_decode_error(&self) -> bool {
        matches!(
            self,
            ComplianceError::Compression(_)
                | ComplianceError::FramedSnappy
                | ComplianceError::UnsupportedEncoding(_)
                | ComplianceError::MalformedMessage { .. }
        )
    }

    /// Errors caused by label or exemplar references that don't resolve.
    pub fn is_referential(&self) -> bool {
        matches!(
            self,
            ComplianceError::IndexOutOfRange { .. }
                | ComplianceError::OddLength(_)
                | ComplianceError::InvalidReference { .. }
        )
    }
}

impl From<snap::Error> for ComplianceError {
    fn from(err: snap::Error) -> Self {
        ComplianceError::Compression(err.to_string())
    }
}

impl From<reqwest::Error> for ComplianceError {
    fn from(err: reqwest::Error) -> Self {
        ComplianceError::Http(err.to_string())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_classification() {
        struct TestCase {
            name: &'static str,
            err: ComplianceError,
            decode: bool,
            referential: bool,
        }

        let tc = vec![
            TestCase {
                name: "framed snappy",
                err: ComplianceError::FramedSnappy,
                decode: true,
                referential: false,
            },
            TestCase {
                name: "malformed",
                err: ComplianceError::MalformedMessage {
                    schema: "prometheus.WriteRequest",
                    err: "buffer underflow".to_string(),
                },
                decode: true,
                referential: false,
            },
            TestCase {
                name: "odd length",
                err: ComplianceError::OddLength(3),
                decode: false,
                referential: true,
            },
            TestCase {
                name: "out of range",
                err: ComplianceError::out_of_range(4, 4),
                decode: false,
                referential: true,
            },
            TestCase {
                name: "launch",
                err: ComplianceError::Launch("no such file".to_string()),
                decode: false,
                referential: false,
            },
        ];

        for case in tc {
            let name = case.name;
            assert_eq!(case.decode, case.err.is_decode_error(), "test case: {name} - decode");
            assert_eq!(
                case.referential,
                case.err.is_referential(),
                "test case: {name} - referential"
            );
        }
    }

    #[test]
    fn test_failed_cast_message() {
        let err = ComplianceError::failed_cast::<usize, u32>(usize::MAX, "symbol index");
        assert!(err.to_string().starts_with("failed to cast symbol index"));
        assert!(err.to_string().contains("u32"));
    }
}
