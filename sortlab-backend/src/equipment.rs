use serde::Serialize;
use valuable::Valuable;

mod link;
pub mod sequencer;
pub mod xml_rpc;

pub use link::{EquipmentLink, XmlRpcLink};
pub use xml_rpc::RpcValue;

/// A failed call to the sorting line controller. Every variant names the remote method that was called.
#[derive(thiserror::Error, Debug, Serialize, Valuable, Clone, PartialEq)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum Error {
    #[error("failed to reach equipment while calling {method}: {message}")]
    Transport { method: String, message: String },
    #[error("equipment rejected {method} with fault {code}: {message}")]
    Fault {
        method: String,
        code: i64,
        message: String,
    },
    #[error("unreadable equipment reply to {method}: {message}")]
    Protocol { method: String, message: String },
    #[error("{method} timed out after {timeout_ms} ms")]
    Timeout { method: String, timeout_ms: u64 },
    #[error("{method} was cancelled")]
    Cancelled { method: String },
}

impl Error {
    #[must_use]
    pub fn method(&self) -> &str {
        use Error::{Cancelled, Fault, Protocol, Timeout, Transport};

        match self {
            Transport { method, .. }
            | Fault { method, .. }
            | Protocol { method, .. }
            | Timeout { method, .. }
            | Cancelled { method } => method,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
