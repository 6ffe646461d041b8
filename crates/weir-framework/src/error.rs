use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum Error {
    /// No call or signal registered under the requested name.
    #[error("no registered call named '{0}'")]
    CallNotFound(String),
    /// No converter for the requested dtype pair.
    #[error("no buffer converter from {from} to {to}")]
    BufferConvert { from: String, to: String },
    /// Aggregated failure from commit subscription, installation, or
    /// activation. The text lists each failing request and its reason.
    #[error("topology commit failed:\n{0}")]
    TopologyConnect(String),
    /// Malformed topology description.
    #[error("{0}")]
    DataFormat(String),
    /// Reference to a port that does not exist and cannot be allocated.
    #[error("no such port '{port}' on block '{block}'")]
    PortAccess { block: String, port: String },
    /// An opaque value did not hold the expected type.
    #[error("argument type mismatch: expected {expected}, found {found}")]
    ArgCast {
        expected: &'static str,
        found: &'static str,
    },
    /// Error propagated out of a block's work function or registered call.
    #[error("{0}")]
    Work(String),
}

impl Error {
    /// Convenience for block code reporting a work failure.
    pub fn work(message: impl Into<String>) -> Self {
        Self::Work(message.into())
    }
}
