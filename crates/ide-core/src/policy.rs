//! Failure classification and the recovery decision table.
//!
//! Mapping raw register values to an [`ErrorKind`] is product policy and lives behind
//! [`ErrorPolicy`]. What happens for each kind is fixed and lives in [`decide`].

use crate::config::DeviceConfig;
use crate::device::DeviceKind;
use crate::diag::FailureReason;
use crate::error::ErrorKind;
use crate::regs::{AtaError, AtaStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub kind: ErrorKind,
    /// The device lost its head position and should recalibrate before the next command.
    pub recalibrate: bool,
}

impl Classification {
    pub fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            recalibrate: false,
        }
    }
}

pub trait ErrorPolicy: Send + Sync {
    fn classify(
        &self,
        kind: DeviceKind,
        config: &DeviceConfig,
        reason: FailureReason,
        status: AtaStatus,
        error: AtaError,
    ) -> Classification;
}

/// Classification used when no product-specific policy is installed.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultErrorPolicy;

impl ErrorPolicy for DefaultErrorPolicy {
    fn classify(
        &self,
        kind: DeviceKind,
        config: &DeviceConfig,
        reason: FailureReason,
        status: AtaStatus,
        error: AtaError,
    ) -> Classification {
        match reason {
            FailureReason::Timeout => Classification::new(ErrorKind::ProtocolTimeout),
            FailureReason::DmaTimeout if status.contains(AtaStatus::BUSY) => {
                Classification::new(ErrorKind::ProtocolTimeout)
            }
            FailureReason::DmaTimeout => Classification::new(ErrorKind::DmaFault),
            FailureReason::Protocol => Classification::new(ErrorKind::BusFault),
            FailureReason::ModeSet => {
                if status.contains(AtaStatus::ERROR) && error.contains(AtaError::ABORTED) {
                    Classification::new(ErrorKind::ConfigurationRejected)
                } else if status.contains(AtaStatus::BUSY) {
                    Classification::new(ErrorKind::BusFault)
                } else {
                    Classification::new(ErrorKind::DeviceNotReady)
                }
            }
            FailureReason::Interrupt => classify_status(kind, config, status, error),
        }
    }
}

fn classify_status(
    kind: DeviceKind,
    config: &DeviceConfig,
    status: AtaStatus,
    error: AtaError,
) -> Classification {
    let write_fault =
        status.contains(AtaStatus::DEVICE_FAULT) && !config.ignore_write_fault;
    if status.contains(AtaStatus::BUSY) || write_fault {
        return Classification::new(ErrorKind::BusFault);
    }

    if status.contains(AtaStatus::ERROR) {
        if kind == DeviceKind::Atapi {
            // Sense data carries the detail; the command builder requests it on retry.
            return Classification::new(ErrorKind::DeviceNotReady);
        }
        if error.contains(AtaError::BAD_CRC) {
            return Classification::new(ErrorKind::DataIntegrityRecoverable);
        }
        if error.intersects(AtaError::INTERFACE_CRC | AtaError::UNCORRECTABLE) {
            return Classification::new(ErrorKind::DataIntegrityFatal);
        }
        if error.contains(AtaError::TRACK0_NOT_FOUND) {
            return Classification {
                kind: ErrorKind::DeviceNotReady,
                recalibrate: true,
            };
        }
        return Classification::new(ErrorKind::DeviceNotReady);
    }

    if status.contains(AtaStatus::DATA_REQUEST) {
        // Device still wants data: the transfer and the command disagree.
        return Classification::new(ErrorKind::BusFault);
    }
    Classification::new(ErrorKind::DeviceNotReady)
}

/// What the recovery engine does with a classified failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Decision {
    /// Run the reset protocol after the request has been requeued or failed.
    pub reset: bool,
    /// New retry count of the failing request.
    pub retries: Option<u8>,
    /// Complete the request with a failure instead of requeueing it.
    pub fail: bool,
    pub soft_error: bool,
}

/// The recovery decision table.
///
/// `request` is `(retries, max_retries)` of the failing request, if there is one.
/// `reset_every` escalates every n-th generic retry to a reset; `0` disables that.
pub fn decide(kind: ErrorKind, request: Option<(u8, u8)>, reset_every: u8) -> Decision {
    let bump = |(retries, max): (u8, u8)| {
        let next = retries.saturating_add(1);
        (next, next > max)
    };

    match kind {
        ErrorKind::BusFault | ErrorKind::ProtocolTimeout => {
            let (retries, fail) = request.map(bump).unzip();
            Decision {
                reset: true,
                retries,
                fail: fail.unwrap_or(false),
                soft_error: false,
            }
        }
        ErrorKind::DataIntegrityRecoverable => {
            let (retries, fail) = request.map(bump).unzip();
            Decision {
                reset: false,
                retries,
                fail: fail.unwrap_or(false),
                soft_error: true,
            }
        }
        ErrorKind::DataIntegrityFatal => Decision {
            reset: false,
            retries: request.map(|(_, max)| max),
            fail: request.is_some(),
            soft_error: false,
        },
        ErrorKind::DmaFault | ErrorKind::ConfigurationRejected => Decision {
            reset: false,
            retries: request.map(|(retries, _)| retries),
            fail: false,
            soft_error: false,
        },
        ErrorKind::DeviceNotReady => {
            let (retries, fail) = request.map(bump).unzip();
            let fail = fail.unwrap_or(false);
            let periodic = !fail
                && reset_every != 0
                && retries.is_some_and(|retries| retries % reset_every == 0);
            Decision {
                reset: periodic,
                retries,
                fail,
                soft_error: false,
            }
        }
    }
}
