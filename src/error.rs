use thiserror::Error;

/// Crate-wide error taxonomy.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RigError {
    #[error("camera unreachable: {0}")]
    CameraUnreachable(String),

    #[error("LED hardware fault: {0}")]
    LedHardwareFault(String),

    #[error("configuration unreadable: {0}")]
    ConfigUnreadable(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("test timed out")]
    TestTimeout,

    #[error("test cancelled")]
    Cancelled,

    #[error("test aborted")]
    Aborted,

    /// A state-machine operation was requested from a state that does not allow it.
    #[error("cannot {action} while {state}")]
    InvalidTransition {
        action: &'static str,
        state: &'static str,
    },
}

/// Hardware or startup fault reported to the result sink.
///
/// Startup faults (`ConfigUnreadable`, `PermissionDenied`) block every test
/// cycle; runtime faults fail the current cycle only.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Fault {
    #[error("camera unreachable: {0}")]
    CameraUnreachable(String),

    #[error("LED hardware fault: {0}")]
    LedHardwareFault(String),

    #[error("configuration unreadable: {0}")]
    ConfigUnreadable(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),
}

impl Fault {
    /// Whether the fault prevents any test cycle from starting.
    #[inline]
    pub fn is_startup(&self) -> bool {
        matches!(self, Fault::ConfigUnreadable(_) | Fault::PermissionDenied(_))
    }
}

impl From<Fault> for RigError {
    fn from(fault: Fault) -> Self {
        match fault {
            Fault::CameraUnreachable(msg) => RigError::CameraUnreachable(msg),
            Fault::LedHardwareFault(msg) => RigError::LedHardwareFault(msg),
            Fault::ConfigUnreadable(msg) => RigError::ConfigUnreadable(msg),
            Fault::PermissionDenied(msg) => RigError::PermissionDenied(msg),
        }
    }
}

/// Coarse classification every hardware error type must provide.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HardwareErrorKind {
    /// The process lacks the privilege to access the device.
    PermissionDenied,
    /// The device is absent, disconnected or not responding.
    Unavailable,
    /// A single operation failed; retrying may succeed.
    Transient,
}

/// Error trait implemented by every hardware error type.
pub trait HardwareError: std::error::Error + Send + Sync + 'static {
    fn kind(&self) -> HardwareErrorKind;
}
