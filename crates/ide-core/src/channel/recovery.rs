//! Error engine and reset protocol.
//!
//! A failed command goes through a fixed sequence: DMA teardown, register snapshot,
//! classification, diagnostic, decision table, and finally the reset protocol if the decision
//! asks for one. Resets are blocking: the protocol has no interrupt of its own, so it busy-polls
//! with a bounded number of iterations and gives up (logging) when the deadline passes.

use crate::backend::Failure;
use crate::device::{Device, DeviceKind, Unit};
use crate::diag::{describe_reset_diagnostic, Diagnostic, FailureReason};
use crate::error::{CoreError, ErrorKind, RequestFailure, Result};
use crate::io::ChannelIo;
use crate::policy::{decide, Classification};
use crate::regs::{cmd, AtaError, AtaStatus, DeviceControl};
use crate::request::Completion;
use crate::time::{Tick, WAIT_WORSTCASE};

use super::{Channel, Inner, ResetJob};

/// Which reset to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetScope {
    /// DEVICE RESET for an ATAPI device, falling back to a bus reset; bus reset otherwise.
    Device,
    Bus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetOutcome {
    /// The ATAPI soft reset completed; the sibling device was not touched.
    DeviceReset,
    /// The bus came back and diagnostics passed.
    BusReady,
    /// The bus came back with this diagnostic code.
    BusFailed(u8),
    /// The bus stayed busy past the reset deadline.
    TimedOut,
}

/// Clamp a voluntary sleep to something the scheduler can honour.
pub(super) fn stall_ticks(ticks: Tick) -> Tick {
    ticks.clamp(1, WAIT_WORSTCASE)
}

impl Channel {
    /// Route a failed command of `unit` through the decision table.
    pub(super) fn fail_command(&self, inner: &mut Inner, unit: Unit, failure: Failure) {
        // Stop, clear and unmap before anything reads status.
        let was_dma = inner.hw.used_dma;
        let dma_status = inner.hw.end_dma();
        inner.slot = None;
        inner.deadline = None;

        let status = match failure.status {
            Some(status) => status,
            None => inner.hw.io.status(),
        };
        let error = match failure.error {
            Some(error) => error,
            None if status.contains(AtaStatus::ERROR) => inner.hw.io.error(),
            None => AtaError::empty(),
        };
        let opcode = inner.hw.last_opcode;

        let Some(device) = inner.devices[unit.index()].as_mut() else {
            self.finish_command(inner);
            return;
        };

        let mut class = match failure.kind {
            Some(kind) => Classification::new(kind),
            None => self.policy.classify(
                device.kind(),
                &device.config,
                failure.reason,
                status,
                error,
            ),
        };
        if class.kind == ErrorKind::DmaFault && !was_dma {
            // Nothing to fall back from; count it as an ordinary retry.
            class.kind = ErrorKind::DeviceNotReady;
        }
        let downgraded = class.kind == ErrorKind::ConfigurationRejected && downgrade(device);
        if class.kind == ErrorKind::ConfigurationRejected && !downgraded {
            class.kind = ErrorKind::DeviceNotReady;
        }

        let diagnostic = Diagnostic {
            device: device.id,
            message: failure.message.into_owned(),
            reason: failure.reason,
            opcode,
            status,
            error,
            kind: class.kind,
            lba: device.queue.front().map(|rq| rq.lba),
        };
        diagnostic.emit();
        if !dma_status.is_empty() {
            tracing::debug!(device = %device.id, dma_status = dma_status.bits(), "DMA engine status");
        }

        if was_dma && (failure.reason == FailureReason::DmaTimeout || class.kind == ErrorKind::DmaFault) {
            device.note_dma_failure();
        }
        if class.recalibrate {
            device.recalibrate = true;
        }

        let decision = decide(
            class.kind,
            device.queue.front().map(|rq| (rq.retries, rq.max_retries)),
            self.config.reset_every,
        );
        if decision.soft_error {
            device.soft_errors += 1;
        }
        if decision.fail {
            if let Some(rq) = device.queue.pop_front() {
                tracing::warn!(device = %device.id, request = %rq.id, kind = %class.kind, "request failed");
                inner.completed.push(Completion {
                    request: rq.id,
                    device: device.id,
                    result: Err(RequestFailure {
                        kind: class.kind,
                        diagnostic: Some(diagnostic),
                    }),
                });
                inner.stats.failed += 1;
            }
        } else if let Some(rq) = device.queue.front_mut() {
            if let Some(retries) = decision.retries {
                rq.retries = retries;
            }
            rq.dispatched = false;
        }

        self.finish_command(inner);
        if downgraded {
            self.reprogram_mode(inner, unit);
        }
        if decision.reset {
            self.reset_locked(inner, unit, ResetScope::Device);
        }
    }

    /// Push the device's current mode to the chipset and the device after recovery lowered it.
    /// A hang here is only logged; the next failed command will reset the bus.
    fn reprogram_mode(&self, inner: &mut Inner, unit: Unit) {
        let Some(mode) = inner.devices[unit.index()].as_ref().map(|dev| dev.mode) else {
            return;
        };
        if self.program_mode(inner, unit, mode).is_none() {
            tracing::warn!(channel = %self.id, %unit, %mode, "device did not accept its reduced mode");
        }
    }

    /// Run the reset protocol. The channel must be idle.
    pub fn reset(&self, unit: Unit, scope: ResetScope) -> Result<ResetOutcome> {
        self.with_inner(|inner| {
            if inner.busy {
                return Err(CoreError::ChannelBusy(self.id));
            }
            if inner.devices[unit.index()].is_none() {
                return Err(CoreError::NoDevice(unit));
            }
            let outcome = self.reset_locked(inner, unit, scope);
            self.schedule(inner);
            Ok(outcome)
        })
    }

    pub(super) fn reset_locked(
        &self,
        inner: &mut Inner,
        unit: Unit,
        scope: ResetScope,
    ) -> ResetOutcome {
        inner.stats.resets += 1;
        inner.hw.end_dma();
        inner.slot = None;
        inner.deadline = None;

        let atapi = inner.devices[unit.index()]
            .as_ref()
            .is_some_and(|dev| dev.kind() == DeviceKind::Atapi);
        if scope == ResetScope::Device && atapi {
            self.begin_reset(inner, unit, true);
            let done = self.atapi_reset(inner, unit);
            inner.reset = None;
            if done {
                return ResetOutcome::DeviceReset;
            }
            tracing::warn!(channel = %self.id, %unit, "ATAPI reset timed out, resetting the bus");
        }

        self.begin_reset(inner, unit, false);
        let outcome = self.bus_reset(inner, unit);
        inner.reset = None;
        outcome
    }

    fn begin_reset(&self, inner: &mut Inner, trigger: Unit, atapi: bool) {
        let job = ResetJob {
            trigger,
            atapi,
            deadline: self.clock.now() + self.config.reset_deadline,
        };
        tracing::debug!(
            channel = %self.id,
            unit = %job.trigger,
            atapi = job.atapi,
            deadline = job.deadline,
            "reset"
        );
        inner.reset = Some(job);
    }

    /// DEVICE RESET for one ATAPI device. Returns `true` once BUSY clears.
    fn atapi_reset(&self, inner: &mut Inner, unit: Unit) -> bool {
        let Inner { devices, hw, .. } = inner;
        let Some(device) = devices[unit.index()].as_mut() else {
            return false;
        };
        device.resetting = true;
        hw.io.select(unit);
        hw.io.write_command(cmd::DEVICE_RESET);
        hw.last_opcode = Some(cmd::DEVICE_RESET);
        self.clock.delay(1);

        let done = self.poll_not_busy(hw.io.as_mut(), self.config.reset_deadline);
        device.resetting = false;
        if done {
            tracing::debug!(device = %device.id, "ATAPI reset complete");
            device.failures = 0;
        } else {
            device.failures += 1;
        }
        done
    }

    /// Pulse SRST and wait for the bus to come back. Devices whose mode was lowered on the way
    /// are told their new mode; the rest get their chipset timing restored.
    fn bus_reset(&self, inner: &mut Inner, trigger: Unit) -> ResetOutcome {
        let (outcome, lowered) = self.pulse_reset(inner, trigger);
        if outcome == ResetOutcome::BusReady {
            for unit in Unit::ALL {
                if lowered[unit.index()] {
                    self.reprogram_mode(inner, unit);
                }
            }
        }
        outcome
    }

    fn pulse_reset(&self, inner: &mut Inner, trigger: Unit) -> (ResetOutcome, [bool; 2]) {
        let Inner { devices, hw, .. } = inner;

        let mut lowered = [false; 2];
        for (slot, device) in devices.iter_mut().enumerate() {
            if let Some(device) = device {
                lowered[slot] = pre_reset(device);
                device.resetting = true;
            }
        }

        let io = hw.io.as_mut();
        io.write_control(DeviceControl::SRST | DeviceControl::NIEN);
        self.clock.delay(1);
        io.write_control(DeviceControl::NIEN);
        self.clock.delay(self.config.reset_settle);

        let ready = self.poll_not_busy(io, self.config.reset_deadline);
        io.write_control(DeviceControl::empty());

        let outcome = if ready {
            let code = io.error().bits();
            if code & 0x7f == 0x01 {
                ResetOutcome::BusReady
            } else {
                ResetOutcome::BusFailed(code)
            }
        } else {
            ResetOutcome::TimedOut
        };

        match outcome {
            ResetOutcome::BusReady => {
                tracing::info!(channel = %self.id, "reset: passed");
            }
            ResetOutcome::BusFailed(code) => {
                tracing::warn!(
                    channel = %self.id,
                    code,
                    "reset: {}",
                    describe_reset_diagnostic(code)
                );
            }
            _ => {
                let status = io.alt_status();
                tracing::warn!(channel = %self.id, status = status.bits(), "reset timed out");
            }
        }
        if let Some(device) = devices[trigger.index()].as_mut() {
            if outcome == ResetOutcome::BusReady {
                device.failures = 0;
            } else {
                device.failures += 1;
            }
        }

        for (slot, device) in devices.iter_mut().enumerate() {
            let Some(device) = device else {
                continue;
            };
            device.resetting = false;
            if lowered[slot] && outcome == ResetOutcome::BusReady {
                continue;
            }
            if !self.timing.tune_chipset(device, device.mode) {
                tracing::warn!(device = %device.id, mode = %device.mode, "chipset retune failed");
            }
            if let Some(pio) = device.mode.pio_number() {
                self.timing.tune_drive(device, Some(pio));
            }
        }
        (outcome, lowered)
    }

    /// Poll alternate status until BUSY clears or `timeout` passes.
    pub(super) fn poll_not_busy(&self, io: &mut dyn ChannelIo, timeout: Tick) -> bool {
        let interval = self.config.reset_poll_interval.max(1);
        let deadline = self.clock.now() + timeout;
        let max_polls = timeout / interval + 2;
        for _ in 0..max_polls {
            if !io.alt_status().contains(AtaStatus::BUSY) {
                return true;
            }
            if self.clock.now() >= deadline {
                break;
            }
            self.clock.delay(interval);
        }
        false
    }
}

/// Step a device one mode down after it rejected its current one.
fn downgrade(device: &mut Device) -> bool {
    let Some(slower) = device.mode.reduce() else {
        return false;
    };
    tracing::warn!(device = %device.id, from = %device.mode, to = %slower, "reducing transfer mode");
    device.mode = slower;
    true
}

/// Soft errors on a DMA device mean the current mode is marginal: drop one step before the
/// counter is cleared. Returns `true` if the mode was lowered.
fn pre_reset(device: &mut Device) -> bool {
    let mut lowered = false;
    if device.soft_errors > 0 && device.using_dma() {
        if let Some(slower) = device.mode.reduce() {
            tracing::warn!(
                device = %device.id,
                soft_errors = device.soft_errors,
                from = %device.mode,
                to = %slower,
                "reducing transfer mode before reset"
            );
            device.mode = slower;
            lowered = true;
        }
    }
    device.soft_errors = 0;
    lowered
}
