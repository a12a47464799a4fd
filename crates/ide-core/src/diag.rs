//! Failure diagnostics.
//!
//! A [`Diagnostic`] is captured synchronously when a command fails, before any reset touches
//! the registers. It is logged and attached to the request's failure; the recovery state
//! machine itself never reads it back.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::device::DeviceId;
use crate::error::ErrorKind;
use crate::regs::{AtaError, AtaStatus};

/// Where a failure was detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailureReason {
    /// The completion handler saw an error status.
    Interrupt,
    /// No completion arrived before the handler's deadline.
    Timeout,
    /// As `Timeout`, with a DMA transfer in progress.
    DmaTimeout,
    /// The command builder broke the handler protocol.
    Protocol,
    /// SET FEATURES / set transfer mode failed.
    ModeSet,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub device: DeviceId,
    pub message: String,
    pub reason: FailureReason,
    pub opcode: Option<u8>,
    pub status: AtaStatus,
    /// Only meaningful when `status` has ERROR set.
    pub error: AtaError,
    pub kind: ErrorKind,
    pub lba: Option<u64>,
}

impl Diagnostic {
    pub(crate) fn emit(&self) {
        tracing::warn!(
            channel = %self.device.channel,
            unit = %self.device.unit,
            status = self.status.bits(),
            error = self.error.bits(),
            kind = ?self.kind,
            "{}",
            self
        );
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {}: status=0x{:02x} {{ {} }}",
            self.device,
            self.message,
            self.status.bits(),
            self.status.names()
        )?;
        if self.status.contains(AtaStatus::ERROR) {
            write!(
                f,
                ", error=0x{:02x} {{ {} }}",
                self.error.bits(),
                self.error.names()
            )?;
        }
        if let Some(lba) = self.lba {
            write!(f, ", LBAsect={lba}")?;
        }
        if let Some(opcode) = self.opcode {
            write!(f, ", command=0x{opcode:02x}")?;
        }
        write!(f, " ({})", self.kind)
    }
}

/// Decode the diagnostic code left in the error register after a bus reset.
pub fn describe_reset_diagnostic(code: u8) -> String {
    let master = match code & 0x7f {
        1 => "passed",
        2 => "formatter device error",
        3 => "sector buffer error",
        4 => "ECC circuitry error",
        5 => "controlling MPU error",
        _ => "unknown diagnostic code",
    };
    if code & 0x80 != 0 {
        format!("{master}; slave: failed")
    } else {
        master.to_string()
    }
}
