use thiserror::Error;

/// Failure taxonomy for every host-side operation. Sequencer operations
/// resolve with structured result objects; these variants cover the command
/// pipeline and pre-flight rejections.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum HostError {
    #[error("connection failed: {0}")]
    ConnectionFailed(String),
    #[error("connection timed out")]
    ConnectionTimeout,
    #[error("command timed out: {0}")]
    CommandTimeout(String),
    #[error("machine not ready: {0}")]
    MachineNotReady(String),
    #[error("invalid g-code: {0}")]
    InvalidGCode(String),
    #[error("command queue full")]
    BufferOverflow,
    #[error("hardware error: {0}")]
    HardwareError(String),
    #[error("safety violation: {0}")]
    SafetyViolation(String),
    #[error("operation cancelled")]
    Cancelled,
}

impl HostError {
    /// Timeouts and transport drops are transient; the queue may retry them.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            HostError::CommandTimeout(_) | HostError::ConnectionTimeout | HostError::ConnectionFailed(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, HostError>;
