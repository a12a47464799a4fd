use crate::device::{DmaState, Unit};
use crate::diag::{Diagnostic, FailureReason};
use crate::error::{CoreError, ErrorKind, Result};
use crate::mode::TransferMode;
use crate::regs::{cmd, AtaError, AtaStatus, TaskFile};

use super::{Channel, Inner, ResetScope};

enum Attempt {
    Accepted,
    /// The chipset or the device refused the mode.
    Rejected,
    TimedOut,
}

impl Channel {
    /// Move `unit` to the fastest supported mode no faster than `requested`.
    ///
    /// Blocking; the channel must be idle. Each mode the device rejects is stepped down one
    /// rung until one is accepted. If even PIO0 is refused the device stays at PIO0.
    pub fn negotiate_mode(&self, unit: Unit, requested: TransferMode) -> Result<TransferMode> {
        self.with_inner(|inner| {
            if inner.busy {
                return Err(CoreError::ChannelBusy(self.id));
            }
            let device = inner.devices[unit.index()]
                .as_ref()
                .ok_or(CoreError::NoDevice(unit))?;
            let caps = device.identity.caps;
            let allow_dma = caps.dma && device.dma != DmaState::PioOnly;
            let mode = TransferMode::filter(requested, &caps, self.config.max_mode, allow_dma);

            let result = match self.program_mode(inner, unit, mode) {
                Some(mode) => Ok(mode),
                None => {
                    self.reset_locked(inner, unit, ResetScope::Bus);
                    Err(CoreError::ModeSetTimeout {
                        channel: self.id,
                        unit,
                    })
                }
            };

            self.schedule(inner);
            result
        })
    }

    /// Program `mode` into the chipset and the device, stepping down on every rejection.
    /// Returns the accepted mode, or `None` if the device hung on SET FEATURES.
    pub(super) fn program_mode(
        &self,
        inner: &mut Inner,
        unit: Unit,
        mut mode: TransferMode,
    ) -> Option<TransferMode> {
        loop {
            match self.try_mode(inner, unit, mode) {
                Attempt::Accepted => return Some(mode),
                Attempt::Rejected => match mode.reduce() {
                    Some(slower) => {
                        tracing::warn!(channel = %self.id, %unit, from = %mode, to = %slower, "mode rejected, stepping down");
                        mode = slower;
                    }
                    None => {
                        tracing::warn!(channel = %self.id, %unit, "every transfer mode rejected, staying at PIO0");
                        if let Some(device) = inner.devices[unit.index()].as_mut() {
                            device.mode = TransferMode::Pio0;
                        }
                        return Some(TransferMode::Pio0);
                    }
                },
                Attempt::TimedOut => return None,
            }
        }
    }

    fn try_mode(&self, inner: &mut Inner, unit: Unit, mode: TransferMode) -> Attempt {
        let Inner { devices, hw, .. } = inner;
        let Some(device) = devices[unit.index()].as_mut() else {
            return Attempt::Rejected;
        };

        if !self.timing.tune_chipset(device, mode) {
            tracing::debug!(device = %device.id, %mode, "chipset cannot run mode");
            return Attempt::Rejected;
        }
        if let Some(pio) = mode.pio_number() {
            self.timing.tune_drive(device, Some(pio));
        }

        hw.io.select(unit);
        hw.io.write_taskfile(&TaskFile::set_transfer_mode(mode.xfer_code()));
        hw.io.write_command(cmd::SET_FEATURES);
        hw.last_opcode = Some(cmd::SET_FEATURES);

        let ready = self.poll_not_busy(hw.io.as_mut(), self.config.command_timeout);
        let status = hw.io.status();
        if ready && !status.contains(AtaStatus::ERROR) {
            device.mode = mode;
            device.dma = match device.dma {
                DmaState::PioOnly => DmaState::PioOnly,
                // A pending PIO retry survives a mode change.
                DmaState::PioRetry if mode.is_dma() => DmaState::PioRetry,
                _ if mode.is_dma() => DmaState::On,
                _ => DmaState::Off,
            };
            tracing::debug!(device = %device.id, %mode, "transfer mode set");
            return Attempt::Accepted;
        }

        let error = if status.contains(AtaStatus::ERROR) {
            hw.io.error()
        } else {
            AtaError::empty()
        };
        let class = self.policy.classify(
            device.kind(),
            &device.config,
            FailureReason::ModeSet,
            status,
            error,
        );
        let kind = if ready {
            class.kind
        } else {
            ErrorKind::BusFault
        };
        Diagnostic {
            device: device.id,
            message: format!("set transfer mode {mode}"),
            reason: FailureReason::ModeSet,
            opcode: Some(cmd::SET_FEATURES),
            status,
            error,
            kind,
            lba: None,
        }
        .emit();

        if ready {
            Attempt::Rejected
        } else {
            Attempt::TimedOut
        }
    }
}
