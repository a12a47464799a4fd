use crate::backend::{Armed, CommandContext, ExpiryAction, Failure, Step};
use crate::device::Unit;
use crate::diag::FailureReason;
use crate::error::CoreError;
use crate::request::Completion;
use crate::time::Tick;

use super::{Channel, Inner, IrqReturn, UNEXPECTED_IRQ_LOG_INTERVAL};

impl Channel {
    /// Build a [`CommandContext`] for the head request of `unit` and run `f` with it.
    fn with_context<R>(
        &self,
        inner: &mut Inner,
        unit: Unit,
        f: impl FnOnce(&mut CommandContext<'_>) -> R,
    ) -> Option<R> {
        let now = self.clock.now();
        let Inner {
            devices,
            hw,
            slot,
            deadline,
            ..
        } = inner;
        let device = devices[unit.index()].as_ref()?;
        let request = device.queue.front()?;
        let mut ctx = CommandContext {
            channel: self.id,
            unit,
            now,
            command_timeout: self.config.command_timeout,
            device,
            request,
            hw,
            slot,
            deadline,
        };
        Some(f(&mut ctx))
    }

    /// Hand the head request of `unit` to the command builder.
    pub(super) fn dispatch(&self, inner: &mut Inner, unit: Unit, now: Tick) {
        let Some(device) = inner.devices[unit.index()].as_mut() else {
            return;
        };
        let dma = device.using_dma();
        let Some(request) = device.queue.front_mut() else {
            return;
        };
        request.dispatched = true;
        tracing::debug!(
            device = %device.id,
            request = %request.id,
            retries = request.retries,
            dma,
            "dispatch"
        );
        device.sleep_until = None;
        device.service_start = now;

        inner.busy = true;
        inner.active = Some(unit);
        inner.hw.used_dma = false;
        inner.hw.last_opcode = None;
        inner.stats.dispatched += 1;

        let step = self.with_context(inner, unit, |ctx| self.backend.issue(ctx));
        if let Some(device) = inner.devices[unit.index()].as_mut() {
            device.recalibrate = false;
        }
        match step {
            Some(step) => self.after_step(inner, unit, step),
            None => self.finish_command(inner),
        }
    }

    /// Apply what a command builder returned.
    pub(super) fn after_step(&self, inner: &mut Inner, unit: Unit, step: Step) {
        match step {
            Step::Continues => {
                if inner.slot.is_none() {
                    let err = CoreError::NotArmed { channel: self.id };
                    tracing::error!(%unit, "{err}");
                    self.fail_command(inner, unit, Failure::protocol(err.to_string()));
                }
            }
            Step::Finished(outcome) => {
                self.drop_stale_handler(inner, "finished");
                match outcome {
                    Ok(()) => self.complete_head(inner, unit),
                    Err(failure) => self.fail_command(inner, unit, failure),
                }
            }
            Step::Stall(ticks) => {
                self.drop_stale_handler(inner, "stalled");
                self.requeue_stalled(inner, unit, ticks);
            }
        }
    }

    fn drop_stale_handler(&self, inner: &mut Inner, how: &str) {
        if let Some(armed) = inner.slot.take() {
            tracing::error!(
                channel = %self.id,
                phase = ?armed.phase,
                "command {how} with a handler still armed"
            );
            inner.deadline = None;
        }
    }

    fn complete_head(&self, inner: &mut Inner, unit: Unit) {
        let now = self.clock.now();
        // Builders normally end their own transfer; make sure nothing stays mapped.
        inner.hw.end_dma();
        let used_dma = inner.hw.used_dma;

        if let Some(device) = inner.devices[unit.index()].as_mut() {
            if let Some(rq) = device.queue.pop_front() {
                device.service_time = now.saturating_sub(device.service_start);
                device.note_transfer_success(used_dma);
                tracing::debug!(device = %device.id, request = %rq.id, "complete");
                inner.completed.push(Completion {
                    request: rq.id,
                    device: device.id,
                    result: Ok(()),
                });
                inner.stats.completed += 1;
            }
        }
        self.finish_command(inner);
    }

    fn requeue_stalled(&self, inner: &mut Inner, unit: Unit, ticks: Tick) {
        let now = self.clock.now();
        inner.hw.end_dma();
        if let Some(device) = inner.devices[unit.index()].as_mut() {
            if let Some(rq) = device.queue.front_mut() {
                rq.dispatched = false;
            }
            let until = now + super::recovery::stall_ticks(ticks);
            tracing::debug!(device = %device.id, until, "stall");
            device.sleep_until = Some(until);
        }
        self.finish_command(inner);
    }

    /// Interrupt entry point.
    pub fn handle_interrupt(&self) -> IrqReturn {
        self.with_inner(|inner| {
            if !inner.hw.io.irq_asserted() {
                return IrqReturn::None;
            }
            let Some(armed) = inner.slot else {
                self.unexpected_interrupt(inner);
                return IrqReturn::None;
            };
            if !inner.hw.drive_is_ready() {
                // Shared line, or the device raised INTRQ early.
                tracing::trace!(channel = %self.id, "interrupt before completion, ignored");
                return IrqReturn::None;
            }

            inner.slot = None;
            inner.deadline = None;
            self.run_handler(inner, armed);
            if !inner.busy {
                self.schedule(inner);
            }
            IrqReturn::Handled
        })
    }

    fn run_handler(&self, inner: &mut Inner, armed: Armed) {
        let step = self.with_context(inner, armed.unit, |ctx| {
            self.backend.on_interrupt(ctx, armed.phase)
        });
        match step {
            Some(step) => self.after_step(inner, armed.unit, step),
            None => {
                tracing::error!(channel = %self.id, "armed handler without an active request");
                self.finish_command(inner);
            }
        }
    }

    fn unexpected_interrupt(&self, inner: &mut Inner) {
        // Reading status clears a stale INTRQ latch.
        let status = inner.hw.io.status();
        inner.stats.spurious_interrupts += 1;

        let now = self.clock.now();
        let due = inner
            .last_unexpected_irq_log
            .map_or(true, |last| now.saturating_sub(last) >= UNEXPECTED_IRQ_LOG_INTERVAL);
        if due {
            inner.last_unexpected_irq_log = Some(now);
            tracing::warn!(
                channel = %self.id,
                status = status.bits(),
                count = inner.stats.spurious_interrupts,
                "unexpected interrupt"
            );
        } else {
            tracing::trace!(channel = %self.id, status = status.bits(), "unexpected interrupt");
        }
    }

    /// Timer entry point. Returns `false` if the channel timer was not due.
    pub fn handle_timer(&self) -> bool {
        self.with_inner(|inner| {
            let now = self.clock.now();
            match inner.deadline {
                Some(deadline) if deadline <= now => {}
                _ => return false,
            }
            inner.deadline = None;

            let Some(armed) = inner.slot else {
                // Idle wake, or the interrupt won the race with the timer.
                if inner.sleeping {
                    tracing::trace!(channel = %self.id, "idle wake");
                    inner.sleeping = false;
                }
                self.schedule(inner);
                return true;
            };

            if armed.expiry {
                let action = self.with_context(inner, armed.unit, |ctx| {
                    self.backend.on_expiry(ctx, armed.phase)
                });
                if let Some(ExpiryAction::Extend(ticks)) = action {
                    tracing::trace!(channel = %self.id, ticks, "handler extended its deadline");
                    inner.deadline = Some(now + ticks.max(1));
                    return true;
                }
            }

            self.expire(inner, armed);
            if !inner.busy {
                self.schedule(inner);
            }
            true
        })
    }

    /// The armed handler's deadline passed. Re-check the device with the interrupt masked,
    /// so a coalesced or lost interrupt is completed instead of timed out.
    fn expire(&self, inner: &mut Inner, armed: Armed) {
        inner.hw.io.mask_irq();
        inner.slot = None;

        if inner.hw.drive_is_ready() {
            inner.stats.lost_interrupts += 1;
            tracing::warn!(
                channel = %self.id,
                unit = %armed.unit,
                phase = ?armed.phase,
                "lost interrupt"
            );
            self.run_handler(inner, armed);
        } else {
            inner.stats.timeouts += 1;
            let reason = if inner.hw.dma_running {
                FailureReason::DmaTimeout
            } else {
                FailureReason::Timeout
            };
            self.fail_command(inner, armed.unit, Failure::timeout(reason));
        }

        inner.hw.io.unmask_irq();
    }
}
