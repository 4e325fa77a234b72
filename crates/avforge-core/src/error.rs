//! Error taxonomy (spec §7).
//!
//! `EndOfStream` and `TryAgain` are typed terminal/loop-condition values —
//! code that receives them from the native send/receive boundary treats them
//! as control flow, never as something to bubble up through `?`. Everything
//! else is fatal unless the caller has set `exit_on_error = false`, in which
//! case the Decoder and MuxedOutput skip the offending item instead of
//! propagating.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Unknown codec name, an audio channel-count change on a codec that
    /// can't handle parameter changes, a malformed option, etc.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A bounded buffer (pre-header packet queue, AsyncQueue) overflowed, or
    /// a native allocation failed.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// No codec/parser/format matching the requested id or name.
    #[error("not found: {0}")]
    NotFound(String),

    /// An operation was attempted in a lifecycle state that forbids it —
    /// write after close, add_stream after the header was written, etc.
    #[error("invalid pipeline state: {0}")]
    PipelineState(String),

    /// A frame carried `decode_error_flags` or the corruption flag. Dropped
    /// locally unless `exit_on_error` is set.
    #[error("corrupted input: {0}")]
    Corruption(String),

    /// The end-of-stream sentinel from the native layer. Surfaced as a typed
    /// terminal value, never thrown as an exception-style error.
    #[error("end of stream")]
    EndOfStream,

    /// The "temporarily unavailable" sentinel. Always a loop condition;
    /// never propagated out of a public API.
    #[error("temporarily unavailable")]
    TryAgain,

    /// Any other negative return from the native layer, tagged with the
    /// operation that produced it.
    #[error("{operation} failed with native error code {code}")]
    NativeError { operation: &'static str, code: i32 },
}

impl Error {
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Error::InvalidArgument(msg.into())
    }

    pub fn pipeline_state(msg: impl Into<String>) -> Self {
        Error::PipelineState(msg.into())
    }

    pub fn resource_exhausted(msg: impl Into<String>) -> Self {
        Error::ResourceExhausted(msg.into())
    }

    pub fn native(operation: &'static str, code: i32) -> Self {
        Error::NativeError { operation, code }
    }

    /// True for the two sentinels that must never be surfaced as a fatal
    /// error to a caller of the public async-iterator APIs.
    pub fn is_control_flow(&self) -> bool {
        matches!(self, Error::EndOfStream | Error::TryAgain)
    }
}
