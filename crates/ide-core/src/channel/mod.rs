//! One ATA/IDE channel: two device slots, one register set, one DMA engine, one timer.
//!
//! All channel state lives in [`Inner`] behind a single mutex. The interrupt and timer entry
//! points both take that lock before touching the armed-handler slot or the busy flag, and
//! the slot is cleared before a handler runs, so a command is driven by exactly one of them.
//! Completions are staged in `Inner::completed` and handed to the [`CompletionSink`] after the
//! lock is released.

mod dispatch;
mod negotiate;
mod recovery;
mod scheduler;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;

pub use recovery::{ResetOutcome, ResetScope};

use crate::backend::{Armed, CommandBackend};
use crate::config::{ChannelConfig, DeviceConfig};
use crate::device::{ChannelId, Device, DeviceId, DeviceIdentity, DeviceStatus, Unit};
use crate::dma::{DmaEngine, ScatterList};
use crate::error::{CoreError, ErrorKind, RequestFailure, Result};
use crate::io::ChannelIo;
use crate::mode::{NullTiming, TimingBackend, TransferMode};
use crate::policy::{DefaultErrorPolicy, ErrorPolicy};
use crate::registry::SerializeGroup;
use crate::request::{Completion, CompletionSink, Request, RequestId};
use crate::time::{Clock, StdClock, Tick, HZ};

/// Minimum spacing between two "unexpected interrupt" warnings on one channel.
pub(crate) const UNEXPECTED_IRQ_LOG_INTERVAL: Tick = HZ;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrqReturn {
    /// Not ours, or not finished yet.
    None,
    Handled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Idle,
    /// A handler is armed for an outstanding command.
    CommandIssued,
    /// Idle, with an idle-wake timer armed for a sleeping device.
    Sleeping,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ChannelStats {
    pub dispatched: u64,
    pub completed: u64,
    pub failed: u64,
    pub timeouts: u64,
    pub lost_interrupts: u64,
    pub spurious_interrupts: u64,
    pub resets: u64,
}

/// Register set and DMA engine, plus the bookkeeping of the transfer currently using them.
pub(crate) struct Hw {
    pub(crate) io: Box<dyn ChannelIo>,
    pub(crate) dma: Option<Box<dyn DmaEngine>>,
    pub(crate) sg: Option<ScatterList>,
    pub(crate) dma_running: bool,
    /// DMA was started for the current command.
    pub(crate) used_dma: bool,
    pub(crate) last_opcode: Option<u8>,
}

/// In-progress reset, kept for the duration of the (blocking) reset protocol.
#[derive(Debug, Clone, Copy)]
struct ResetJob {
    trigger: Unit,
    atapi: bool,
    deadline: Tick,
}

struct Inner {
    devices: [Option<Device>; 2],
    hw: Hw,
    slot: Option<Armed>,
    /// Command deadline while a handler is armed; idle-wake time while sleeping.
    deadline: Option<Tick>,
    busy: bool,
    sleeping: bool,
    active: Option<Unit>,
    reset: Option<ResetJob>,
    group: Option<Arc<SerializeGroup>>,
    wake_peers: bool,
    completed: Vec<Completion>,
    stats: ChannelStats,
    next_request: u64,
    last_unexpected_irq_log: Option<Tick>,
}

pub struct Channel {
    id: ChannelId,
    config: ChannelConfig,
    clock: Arc<dyn Clock>,
    backend: Arc<dyn CommandBackend>,
    timing: Arc<dyn TimingBackend>,
    policy: Arc<dyn ErrorPolicy>,
    sink: Arc<dyn CompletionSink>,
    inner: Mutex<Inner>,
}

pub struct ChannelBuilder {
    id: ChannelId,
    config: ChannelConfig,
    io: Box<dyn ChannelIo>,
    backend: Arc<dyn CommandBackend>,
    dma: Option<Box<dyn DmaEngine>>,
    clock: Option<Arc<dyn Clock>>,
    timing: Option<Arc<dyn TimingBackend>>,
    policy: Option<Arc<dyn ErrorPolicy>>,
    sink: Option<Arc<dyn CompletionSink>>,
}

impl ChannelBuilder {
    pub fn new(
        id: ChannelId,
        io: impl ChannelIo + 'static,
        backend: Arc<dyn CommandBackend>,
    ) -> Self {
        Self {
            id,
            config: ChannelConfig::default(),
            io: Box::new(io),
            backend,
            dma: None,
            clock: None,
            timing: None,
            policy: None,
            sink: None,
        }
    }

    pub fn config(mut self, config: ChannelConfig) -> Self {
        self.config = config;
        self
    }

    pub fn dma(mut self, engine: impl DmaEngine + 'static) -> Self {
        self.dma = Some(Box::new(engine));
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn timing(mut self, timing: Arc<dyn TimingBackend>) -> Self {
        self.timing = Some(timing);
        self
    }

    pub fn policy(mut self, policy: Arc<dyn ErrorPolicy>) -> Self {
        self.policy = Some(policy);
        self
    }

    pub fn sink(mut self, sink: Arc<dyn CompletionSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn build(self) -> Result<Arc<Channel>> {
        self.config.validate()?;
        let sink = self.sink.unwrap_or_else(|| {
            Arc::new(|completion: Completion| {
                tracing::debug!(
                    request = %completion.request,
                    ok = completion.is_ok(),
                    "completion dropped: no sink installed"
                );
            })
        });
        Ok(Arc::new(Channel {
            id: self.id,
            config: self.config,
            clock: self.clock.unwrap_or_else(|| Arc::new(StdClock::new())),
            backend: self.backend,
            timing: self.timing.unwrap_or_else(|| Arc::new(NullTiming)),
            policy: self.policy.unwrap_or_else(|| Arc::new(DefaultErrorPolicy)),
            sink,
            inner: Mutex::new(Inner {
                devices: [None, None],
                hw: Hw {
                    io: self.io,
                    dma: self.dma,
                    sg: None,
                    dma_running: false,
                    used_dma: false,
                    last_opcode: None,
                },
                slot: None,
                deadline: None,
                busy: false,
                sleeping: false,
                active: None,
                reset: None,
                group: None,
                wake_peers: false,
                completed: Vec::new(),
                stats: ChannelStats::default(),
                next_request: 1,
                last_unexpected_irq_log: None,
            }),
        }))
    }
}

impl Channel {
    pub fn id(&self) -> ChannelId {
        self.id
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A panicking command builder must not wedge the channel for good.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `f` under the channel lock, then deliver staged completions and wake serialized
    /// peers with the lock released.
    fn with_inner<R>(&self, f: impl FnOnce(&mut Inner) -> R) -> R {
        let (ret, completed, wake) = {
            let mut inner = self.lock();
            let ret = f(&mut inner);
            let completed = std::mem::take(&mut inner.completed);
            let wake = if std::mem::take(&mut inner.wake_peers) {
                inner.group.clone()
            } else {
                None
            };
            (ret, completed, wake)
        };

        for completion in completed {
            self.sink.complete(completion);
        }
        if let Some(group) = wake {
            for peer in group.peers(self.id) {
                peer.run_queue();
            }
        }
        ret
    }

    /// Attach a device and negotiate its transfer mode.
    ///
    /// A device always leaves here programmed for its best PIO mode. DMA modes are only
    /// considered when [`ChannelConfig::dma_autonegotiate`] is set and the device supports DMA.
    pub fn attach_device(
        &self,
        unit: Unit,
        identity: DeviceIdentity,
        config: DeviceConfig,
    ) -> Result<()> {
        let caps = identity.caps;
        {
            let mut inner = self.lock();
            let slot = &mut inner.devices[unit.index()];
            if slot.is_some() {
                return Err(CoreError::UnitOccupied(unit));
            }
            let id = DeviceId {
                channel: self.id,
                unit,
            };
            tracing::debug!(device = %id, model = %identity.model, kind = ?identity.kind, "attached");
            *slot = Some(Device::new(id, identity, config));
        }

        let allow_dma = self.config.dma_autonegotiate && caps.dma;
        let target = TransferMode::best(&caps, self.config.max_mode, allow_dma);
        if let Err(err) = self.negotiate_mode(unit, target) {
            tracing::warn!(channel = %self.id, %unit, %err, "transfer mode negotiation failed");
        }
        Ok(())
    }

    /// Queue a request for `unit`. Safe to call while the channel is busy.
    pub fn submit(&self, unit: Unit, mut request: Request) -> Result<RequestId> {
        self.with_inner(|inner| {
            let Some(device) = inner.devices[unit.index()].as_mut() else {
                return Err(CoreError::NoDevice(unit));
            };
            let id = RequestId(inner.next_request);
            inner.next_request += 1;

            request.id = id;
            request.retries = 0;
            request.max_retries = device.config.max_retries;
            request.dispatched = false;
            tracing::trace!(device = %device.id, request = %id, lba = request.lba, "queued");
            device.queue.push_back(request);

            self.schedule(inner);
            Ok(id)
        })
    }

    /// Remove a request that has not been dispatched yet. No completion is delivered for it.
    pub fn cancel_if_queued(&self, id: RequestId) -> bool {
        self.with_inner(|inner| {
            for device in inner.devices.iter_mut().flatten() {
                let pos = device
                    .queue
                    .iter()
                    .position(|rq| rq.id == id && !rq.dispatched);
                if let Some(pos) = pos {
                    device.queue.remove(pos);
                    tracing::debug!(device = %device.id, request = %id, "cancelled");
                    return true;
                }
            }
            false
        })
    }

    /// Kick the scheduler, e.g. after a serialized sibling released the bus.
    pub fn run_queue(&self) {
        self.with_inner(|inner| self.schedule(inner));
    }

    /// Keep `unit` off the bus for `ticks`.
    pub fn stall(&self, unit: Unit, ticks: Tick) -> Result<()> {
        self.with_inner(|inner| {
            let now = self.clock.now();
            let device = inner.devices[unit.index()]
                .as_mut()
                .ok_or(CoreError::NoDevice(unit))?;
            device.sleep_until = Some(now + recovery::stall_ticks(ticks));
            if !inner.busy {
                self.schedule(inner);
            }
            Ok(())
        })
    }

    /// Fail every queued request and release the bus. The channel must be idle.
    pub fn shutdown(&self) -> Result<()> {
        self.with_inner(|inner| {
            if inner.busy {
                return Err(CoreError::ChannelBusy(self.id));
            }
            for device in inner.devices.iter_mut().flatten() {
                while let Some(rq) = device.queue.pop_front() {
                    inner.completed.push(Completion {
                        request: rq.id,
                        device: device.id,
                        result: Err(RequestFailure {
                            kind: ErrorKind::DeviceNotReady,
                            diagnostic: None,
                        }),
                    });
                    inner.stats.failed += 1;
                }
            }
            inner.sleeping = false;
            inner.deadline = None;
            self.release_group(inner);
            Ok(())
        })
    }

    pub fn device(&self, unit: Unit) -> Option<DeviceStatus> {
        self.lock().devices[unit.index()].as_ref().map(Device::status)
    }

    pub fn state(&self) -> ChannelState {
        let inner = self.lock();
        if inner.busy {
            ChannelState::CommandIssued
        } else if inner.sleeping {
            ChannelState::Sleeping
        } else {
            ChannelState::Idle
        }
    }

    pub fn is_busy(&self) -> bool {
        self.lock().busy
    }

    /// Device the outstanding command belongs to.
    pub fn active_unit(&self) -> Option<Unit> {
        self.lock().active
    }

    /// When [`Self::handle_timer`] next has work to do.
    pub fn next_deadline(&self) -> Option<Tick> {
        self.lock().deadline
    }

    pub fn stats(&self) -> ChannelStats {
        self.lock().stats
    }

    pub(crate) fn group_holder(&self) -> Option<ChannelId> {
        self.lock().group.as_ref().and_then(|group| group.holder())
    }

    pub(crate) fn join_group(&self, group: Arc<SerializeGroup>) {
        let mut inner = self.lock();
        if inner.busy || inner.sleeping {
            // Already owns the bus; make that visible to the new peer.
            group.try_acquire(self.id);
        }
        inner.group = Some(group);
    }

    pub(crate) fn leave_group(&self) {
        self.with_inner(|inner| {
            if let Some(group) = inner.group.as_ref() {
                inner.wake_peers = group.release(self.id);
                group.remove(self.id);
            }
        });
        self.lock().group = None;
    }

    fn release_group(&self, inner: &mut Inner) {
        if let Some(group) = inner.group.as_ref() {
            if group.release(self.id) {
                inner.wake_peers = true;
            }
        }
    }

    fn acquire_group(&self, inner: &mut Inner) -> bool {
        inner
            .group
            .as_ref()
            .map_or(true, |group| group.try_acquire(self.id))
    }

    /// Back to idle after a command: nothing armed, nothing selected.
    fn finish_command(&self, inner: &mut Inner) {
        inner.slot = None;
        inner.deadline = None;
        inner.busy = false;
        inner.active = None;
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
