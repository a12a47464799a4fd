use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::device::{ChannelId, Unit};
use crate::diag::Diagnostic;

pub type Result<T> = std::result::Result<T, CoreError>;

/// API misuse and internal logic faults.
///
/// None of these describe a device failure; those are reported per request as
/// [`RequestFailure`].
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("{channel}: a completion handler is already armed")]
    HandlerAlreadyArmed { channel: ChannelId },

    #[error("{channel}: command builder reported CONTINUES without arming a handler")]
    NotArmed { channel: ChannelId },

    #[error("unknown channel {0}")]
    UnknownChannel(ChannelId),

    #[error("channel {0} is already registered")]
    DuplicateChannel(ChannelId),

    #[error("no device attached as {0}")]
    NoDevice(Unit),

    #[error("a device is already attached as {0}")]
    UnitOccupied(Unit),

    #[error("{0} is busy")]
    ChannelBusy(ChannelId),

    #[error("{channel}:{unit}: transfer mode change timed out")]
    ModeSetTimeout { channel: ChannelId, unit: Unit },

    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
}

/// Classified device error kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error, Serialize, Deserialize)]
pub enum ErrorKind {
    #[error("device not ready")]
    DeviceNotReady,

    #[error("recoverable data integrity error")]
    DataIntegrityRecoverable,

    #[error("unrecoverable data integrity error")]
    DataIntegrityFatal,

    #[error("protocol timeout")]
    ProtocolTimeout,

    #[error("bus fault")]
    BusFault,

    #[error("DMA fault")]
    DmaFault,

    #[error("configuration rejected")]
    ConfigurationRejected,
}

impl ErrorKind {
    /// Kinds that can only be recovered by resetting the bus.
    pub fn requires_reset(self) -> bool {
        matches!(self, ErrorKind::BusFault | ErrorKind::ProtocolTimeout)
    }
}

/// Terminal failure of a request, as seen by the block layer.
#[derive(Debug, Clone, Error)]
#[error("{kind}")]
pub struct RequestFailure {
    pub kind: ErrorKind,
    /// Register snapshot of the failure that ended the request, if one was taken.
    pub diagnostic: Option<Diagnostic>,
}
