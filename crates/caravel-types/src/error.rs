use thiserror::Error;

pub type Result<T> = std::result::Result<T, CaravelError>;

/// Closed error taxonomy of the transfer engine.
///
/// Recoverable conditions (an HTTP request failing within its retry
/// budget) are handled locally by the work queue and never surface as a
/// `CaravelError`; everything here is fatal to the operation at hand.
#[derive(Debug, Error)]
pub enum CaravelError {
    /// Malformed JSON body, missing key, or a non-numeric size/offset.
    #[error("bad file format: {0}")]
    BadFileFormat(String),

    /// A numeric argument or threshold outside its documented domain.
    #[error("parameter out of range: {0}")]
    ParameterOutOfRange(String),

    /// An instance, peer, resource or transaction that does not exist.
    #[error("unknown resource: {0}")]
    UnknownResource(String),

    /// An operation invoked from a state that forbids it.
    #[error("bad sequence of calls: {0}")]
    BadSequenceOfCalls(String),

    /// The remote node violated the transfer protocol.
    #[error("network protocol error: {0}")]
    NetworkProtocol(String),

    #[error("cannot write file: {0}")]
    CannotWriteFile(String),

    /// A reassembled instance whose digest does not match its descriptor,
    /// or an instance the destination archive refused to ingest.
    #[error("corrupted file: {0}")]
    CorruptedFile(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}
