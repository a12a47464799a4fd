use crate::device::{Device, Unit};
use crate::error::{ErrorKind, RequestFailure};
use crate::request::Completion;
use crate::time::Tick;

use super::{Channel, Inner};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Choice {
    Run(Unit),
    /// Nothing runnable; wake up at this tick.
    Sleep(Tick),
    Idle,
}

/// Pick the device to service next.
///
/// Devices without work or still asleep are skipped. Among the rest, a device without a sleep
/// deadline beats one whose deadline elapsed, an earlier deadline beats a later one, and then
/// the earlier estimated wake-up (`service_start + 2 * service_time`) wins. Ties go to the
/// master. With nothing runnable, any sleeper keeps the channel asleep until the earliest
/// wake-up, whether or not it has work queued.
pub(super) fn choose_device(devices: &[Option<Device>; 2], now: Tick) -> Choice {
    let mut best: Option<(Unit, (Option<Tick>, Tick))> = None;
    let mut earliest_sleep: Option<Tick> = None;

    for device in devices.iter().flatten() {
        if device.is_sleeping(now) {
            if let Some(until) = device.sleep_until {
                earliest_sleep = Some(earliest_sleep.map_or(until, |e| e.min(until)));
            }
            continue;
        }
        if device.queue.is_empty() {
            continue;
        }
        let wakeup = device
            .service_start
            .saturating_add(device.service_time.saturating_mul(2));
        let key = (device.sleep_until, wakeup);
        if best.map_or(true, |(_, best_key)| key < best_key) {
            best = Some((device.id.unit, key));
        }
    }

    match (best, earliest_sleep) {
        (Some((unit, _)), _) => Choice::Run(unit),
        (None, Some(until)) => Choice::Sleep(until),
        (None, None) => Choice::Idle,
    }
}

impl Channel {
    /// Dispatch queued work until the channel is busy, every device with work is asleep, or
    /// there is no work left.
    pub(super) fn schedule(&self, inner: &mut Inner) {
        while !inner.busy {
            let now = self.clock.now();
            match choose_device(&inner.devices, now) {
                Choice::Run(unit) => {
                    if self.kill_if_failed(inner, unit) {
                        continue;
                    }
                    if !self.acquire_group(inner) {
                        tracing::trace!(channel = %self.id, "serialized sibling owns the bus");
                        return;
                    }
                    inner.sleeping = false;
                    self.dispatch(inner, unit, now);
                }
                Choice::Sleep(until) => {
                    // A sleeping channel still owns the bus.
                    if !self.acquire_group(inner) {
                        tracing::trace!(channel = %self.id, "serialized sibling owns the bus");
                        return;
                    }
                    let wake = until.max(now + self.config.min_sleep);
                    tracing::debug!(channel = %self.id, wake, "devices asleep, arming idle wake");
                    inner.deadline = Some(wake);
                    inner.sleeping = true;
                    return;
                }
                Choice::Idle => {
                    inner.deadline = None;
                    inner.sleeping = false;
                    self.release_group(inner);
                    return;
                }
            }
        }
    }

    /// Fail the head request of a device that exceeded its failure limit. Returns `true` if a
    /// request was failed instead of dispatched.
    fn kill_if_failed(&self, inner: &mut Inner, unit: Unit) -> bool {
        let Some(device) = inner.devices[unit.index()].as_mut() else {
            return false;
        };
        if !device.failure_limit_exceeded() {
            return false;
        }
        let Some(rq) = device.queue.pop_front() else {
            return false;
        };
        tracing::warn!(
            device = %device.id,
            request = %rq.id,
            failures = device.failures,
            "device exceeded its failure limit, failing request"
        );
        inner.completed.push(Completion {
            request: rq.id,
            device: device.id,
            result: Err(RequestFailure {
                kind: ErrorKind::DeviceNotReady,
                diagnostic: None,
            }),
        });
        inner.stats.failed += 1;
        true
    }
}
