//! Error kinds surfaced by the command core.
//!
//! Every public entry point reports failures synchronously through
//! [`CoreError`]. Host-protocol front-ends translate errors into their own
//! replies via [`CoreError::code`], which yields the stable negative codes
//! the existing protocol layers expect.
//!
//! Decoder-level failures (no answer from a decoder) are *not* reported here;
//! they arrive asynchronously through the packet reply handler.

use thiserror::Error;

/// Errors returned by the command core.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum CoreError {
    /// Address outside the range permitted for the decoder type.
    #[error("address {0} out of range")]
    Address(u32),

    /// CV number outside the range permitted for the operation.
    #[error("CV {0} out of range")]
    Cv(u32),

    /// Byte value or payload length outside its range.
    #[error("value {0} out of range")]
    Value(u32),

    /// Bit position outside 0..=7.
    #[error("bit position {0} out of range")]
    Bit(u8),

    /// Booster key and parameter collide.
    #[error("booster vendor key equals parameter ({0})")]
    BoosterKey(u8),

    /// Packet or entry could not be allocated.
    #[error("out of memory")]
    NoMemory,

    /// A core mutex could not be acquired within its bounded wait.
    #[error("lock acquisition timed out")]
    LockTimeout,

    /// A bounded queue or mailbox is full.
    #[error("queue full")]
    QueueFull,

    /// Command refused in the current operating mode.
    #[error("track power off")]
    PowerOff,

    /// Resource already in use by another operation.
    #[error("busy")]
    Busy,

    /// Operation recognised but not supported.
    #[error("not implemented")]
    NotImplemented,

    /// A bounded wait on an external collaborator expired.
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    /// No loco descriptor for the address.
    #[error("unknown loco {0}")]
    UnknownLoco(u16),

    /// No accessory descriptor for the address.
    #[error("unknown turnout {0}")]
    UnknownTurnout(u16),
}

impl CoreError {
    /// Stable negative code for protocol replies.
    ///
    /// Range errors map to −1..−4 so callers can distinguish address, CV,
    /// value and bit problems.
    ///
    /// ```rust
    /// use rs_cmdstation::CoreError;
    ///
    /// assert_eq!(CoreError::Address(0).code(), -1);
    /// assert_eq!(CoreError::Bit(9).code(), -4);
    /// assert_eq!(CoreError::PowerOff.code(), -8);
    /// ```
    pub const fn code(&self) -> i32 {
        match self {
            Self::Address(_) => -1,
            Self::Cv(_) | Self::BoosterKey(_) => -2,
            Self::Value(_) => -3,
            Self::Bit(_) => -4,
            Self::NoMemory => -5,
            Self::LockTimeout => -6,
            Self::QueueFull => -7,
            Self::PowerOff => -8,
            Self::Busy => -9,
            Self::NotImplemented => -10,
            Self::Timeout(_) => -11,
            Self::UnknownLoco(_) => -12,
            Self::UnknownTurnout(_) => -13,
        }
    }

    /// True for range/validation failures (codes −1..−4).
    pub const fn is_range(&self) -> bool {
        matches!(
            self,
            Self::Address(_) | Self::Cv(_) | Self::Value(_) | Self::Bit(_) | Self::BoosterKey(_)
        )
    }
}

/// Result alias used throughout the core.
pub type Result<T> = core::result::Result<T, CoreError>;
