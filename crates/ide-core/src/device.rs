use std::collections::VecDeque;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::config::DeviceConfig;
use crate::mode::TransferMode;
use crate::request::Request;
use crate::time::Tick;

/// Position of a device on its channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Unit {
    Master = 0,
    Slave = 1,
}

impl Unit {
    pub const ALL: [Unit; 2] = [Unit::Master, Unit::Slave];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn from_index(index: usize) -> Option<Self> {
        match index {
            0 => Some(Unit::Master),
            1 => Some(Unit::Slave),
            _ => None,
        }
    }

    pub fn sibling(self) -> Self {
        match self {
            Unit::Master => Unit::Slave,
            Unit::Slave => Unit::Master,
        }
    }
}

impl fmt::Display for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Unit::Master => f.write_str("master"),
            Unit::Slave => f.write_str("slave"),
        }
    }
}

/// Stable handle of a channel inside a [`crate::Registry`].
///
/// Channels `2n` and `2n + 1` are the primary and secondary channel of the same controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChannelId(pub u16);

impl ChannelId {
    /// The other channel of the same controller.
    pub fn sibling(self) -> Self {
        ChannelId(self.0 ^ 1)
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ide{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceId {
    pub channel: ChannelId,
    pub unit: Unit,
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.channel, self.unit)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceKind {
    Disk,
    Atapi,
}

/// Transfer capabilities reported by the device's IDENTIFY data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceCaps {
    pub dma: bool,
    pub max_pio: u8,
    pub max_mwdma: Option<u8>,
    pub max_udma: Option<u8>,
}

impl Default for DeviceCaps {
    fn default() -> Self {
        Self {
            dma: false,
            max_pio: 4,
            max_mwdma: None,
            max_udma: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub model: String,
    pub kind: DeviceKind,
    pub caps: DeviceCaps,
}

impl DeviceIdentity {
    pub fn disk(model: impl Into<String>, caps: DeviceCaps) -> Self {
        Self {
            model: model.into(),
            kind: DeviceKind::Disk,
            caps,
        }
    }

    pub fn atapi(model: impl Into<String>, caps: DeviceCaps) -> Self {
        Self {
            model: model.into(),
            kind: DeviceKind::Atapi,
            caps,
        }
    }
}

/// DMA lifecycle of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DmaState {
    /// No DMA mode negotiated.
    Off,
    On,
    /// The last DMA transfer failed; the next request runs in PIO.
    PioRetry,
    /// Too many consecutive DMA failures; PIO for the rest of the session.
    PioOnly,
}

/// One attached device and its request queue.
///
/// The head of `queue` is the request being serviced while the channel is busy with this
/// device. It stays owned by the queue until it completes, so failure and requeue never need
/// to reconstruct it.
#[derive(Debug)]
pub struct Device {
    pub(crate) id: DeviceId,
    pub(crate) identity: DeviceIdentity,
    pub(crate) config: DeviceConfig,
    pub(crate) mode: TransferMode,
    pub(crate) dma: DmaState,
    /// Failed resets since the last successful one.
    pub(crate) failures: u32,
    pub(crate) soft_errors: u32,
    pub(crate) dma_failures: u32,
    pub(crate) sleep_until: Option<Tick>,
    pub(crate) service_start: Tick,
    pub(crate) service_time: Tick,
    pub(crate) resetting: bool,
    pub(crate) recalibrate: bool,
    pub(crate) queue: VecDeque<Request>,
}

impl Device {
    pub(crate) fn new(id: DeviceId, identity: DeviceIdentity, config: DeviceConfig) -> Self {
        Self {
            id,
            identity,
            config,
            mode: TransferMode::Pio0,
            dma: DmaState::Off,
            failures: 0,
            soft_errors: 0,
            dma_failures: 0,
            sleep_until: None,
            service_start: 0,
            service_time: 0,
            resetting: false,
            recalibrate: false,
            queue: VecDeque::new(),
        }
    }

    pub fn id(&self) -> DeviceId {
        self.id
    }

    pub fn kind(&self) -> DeviceKind {
        self.identity.kind
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    pub fn mode(&self) -> TransferMode {
        self.mode
    }

    pub fn dma_state(&self) -> DmaState {
        self.dma
    }

    /// Whether the next request should be attempted with DMA.
    pub fn using_dma(&self) -> bool {
        self.dma == DmaState::On && self.mode.is_dma()
    }

    /// Set after a track-zero error; the next command should recalibrate first.
    pub fn recalibrate(&self) -> bool {
        self.recalibrate
    }

    pub fn soft_errors(&self) -> u32 {
        self.soft_errors
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub(crate) fn failure_limit_exceeded(&self) -> bool {
        self.config.max_failures != 0 && self.failures > self.config.max_failures
    }

    pub(crate) fn is_sleeping(&self, now: Tick) -> bool {
        matches!(self.sleep_until, Some(until) if until > now)
    }

    pub(crate) fn status(&self) -> DeviceStatus {
        DeviceStatus {
            id: self.id,
            kind: self.identity.kind,
            mode: self.mode,
            dma: self.dma,
            failures: self.failures,
            soft_errors: self.soft_errors,
            dma_failures: self.dma_failures,
            sleep_until: self.sleep_until,
            queued: self.queue.len(),
            in_flight: self.queue.front().is_some_and(|rq| rq.dispatched),
        }
    }
}

/// Point-in-time copy of a device's state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceStatus {
    pub id: DeviceId,
    pub kind: DeviceKind,
    pub mode: TransferMode,
    pub dma: DmaState,
    pub failures: u32,
    pub soft_errors: u32,
    pub dma_failures: u32,
    pub sleep_until: Option<Tick>,
    pub queued: usize,
    pub in_flight: bool,
}
