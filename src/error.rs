//! Errors and recovery outcomes

use thiserror::Error;

/// Errors raised while writing or replaying a command list
#[derive(Error, Debug)]
pub enum ClistError {
    /// Decoder needed more bytes than the stream holds
    #[error("truncated command stream: {needed} more byte(s) needed at offset {offset}")]
    TruncatedInput { offset: usize, needed: usize },

    /// Opcode byte does not name any command
    #[error("unrecognized opcode 0x{op:02x} at offset {offset}")]
    UnrecognizedOpcode { op: u8, offset: usize },

    /// Writer could not obtain memory for a command
    #[error("out of memory: {requested} byte(s) requested, {available} available")]
    OutOfMemory { requested: usize, available: usize },

    /// Bitmap payload would not fit the reader's decode buffer
    #[error("bitmap too large for the command buffer: {size} > {limit}")]
    BitmapTooLarge { size: usize, limit: usize },

    /// A single command larger than the whole command buffer
    #[error("command of {size} bytes exceeds buffer capacity {limit}")]
    CommandTooLarge { size: usize, limit: usize },

    /// Failure reported by the target device, passed through untouched
    #[error("target device error: {0}")]
    TargetDevice(String),

    /// Writer was disabled by an earlier hard failure
    #[error("command list writer disabled by an earlier error")]
    PermanentError,

    /// Well-formed opcode carrying an impossible operand
    #[error("malformed command: {detail}")]
    Malformed { detail: String },

    /// High-level image commands are switched off in the configuration
    #[error("high-level images are disabled")]
    ImagesDisabled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ClistError>;

impl ClistError {
    pub fn malformed<S: Into<String>>(detail: S) -> Self {
        ClistError::Malformed { detail: detail.into() }
    }
    pub fn device<S: Into<String>>(detail: S) -> Self {
        ClistError::TargetDevice(detail.into())
    }
    /// Only memory exhaustion may be retried by the writer's caller
    pub fn is_retryable(&self) -> bool {
        match self {
            ClistError::OutOfMemory { .. } => true,
            _ => false,
        }
    }
    /// Structural decode failures abort the current page's replay
    pub fn is_fatal_for_page(&self) -> bool {
        match self {
            ClistError::TruncatedInput { .. } |
            ClistError::UnrecognizedOpcode { .. } |
            ClistError::Malformed { .. } => true,
            _ => false,
        }
    }
}

/// Next step of the low-memory protocol after a failed write
#[derive(Debug,Copy,Clone,PartialEq,Eq)]
pub enum Recovery {
    /// Free memory locally (wait for the renderer) and repeat the write
    Retry,
    /// Close the partial page, reset every band and repeat the write
    FlushAndRetry,
    /// Give up and propagate the error
    Fatal,
}

impl Default for Recovery {
    fn default() -> Recovery {
        Recovery::Fatal
    }
}
