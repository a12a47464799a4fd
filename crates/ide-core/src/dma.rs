//! Bus-master DMA lifecycle.
//!
//! A transfer is mapped ([`DmaEngine::map`]), started, and always torn down through
//! [`Hw::end_dma`], which stops the engine, reads and clears its latch bits, and releases the
//! mapping in that order. The recovery engine runs the same teardown before it looks at the
//! registers of a failed command, so the next command never inherits stale engine state.

use bitflags::bitflags;

use crate::channel::Hw;
use crate::device::{Device, DeviceId, DmaState};
use crate::request::{Direction, Request};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SgEntry {
    pub addr: u64,
    pub len: u32,
}

/// Physical regions of one mapped request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScatterList {
    entries: Vec<SgEntry>,
}

impl ScatterList {
    pub fn new(entries: Vec<SgEntry>) -> Self {
        Self { entries }
    }

    pub fn entries(&self) -> &[SgEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn total_bytes(&self) -> u64 {
        self.entries.iter().map(|e| u64::from(e.len)).sum()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DmaSetup {
    Ok(ScatterList),
    /// The request or device cannot use DMA; fall back to PIO.
    Unsupported,
    /// No mapping resources right now; fall back to PIO.
    ResourceExhausted,
}

bitflags! {
    /// Bus-master status register.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct DmaStatus: u8 {
        const ACTIVE = 0x01;
        const ERROR = 0x02;
        const INTERRUPT = 0x04;
    }
}

/// One channel's bus-master engine.
pub trait DmaEngine: Send {
    fn map(&mut self, device: DeviceId, request: &Request) -> DmaSetup;

    fn start(&mut self, sg: &ScatterList, direction: Direction);

    fn stop(&mut self);

    /// Read the status register and clear its ERROR/INTERRUPT latch bits.
    fn take_status(&mut self) -> DmaStatus;

    /// Whether the engine has latched a completion interrupt, without clearing it.
    fn irq_pending(&mut self) -> bool;

    fn unmap(&mut self, sg: ScatterList);
}

impl Hw {
    pub(crate) fn try_setup_dma(&mut self, device: &Device, request: &Request) -> DmaSetup {
        if !device.using_dma() {
            return DmaSetup::Unsupported;
        }
        let Some(engine) = self.dma.as_mut() else {
            return DmaSetup::Unsupported;
        };
        if let Some(stale) = self.sg.take() {
            tracing::error!(device = %device.id(), "previous scatter list was never released");
            engine.unmap(stale);
        }
        let setup = engine.map(device.id(), request);
        if let DmaSetup::Ok(sg) = &setup {
            self.sg = Some(sg.clone());
        }
        setup
    }

    /// Start the mapped transfer. Returns `false` if nothing is mapped.
    pub(crate) fn start_dma(&mut self, direction: Direction) -> bool {
        match (self.dma.as_mut(), self.sg.as_ref()) {
            (Some(engine), Some(sg)) => {
                engine.start(sg, direction);
                self.dma_running = true;
                self.used_dma = true;
                true
            }
            _ => false,
        }
    }

    /// Stop the engine, read and clear its status, release the mapping.
    pub(crate) fn end_dma(&mut self) -> DmaStatus {
        let Some(engine) = self.dma.as_mut() else {
            return DmaStatus::empty();
        };
        if !self.dma_running && self.sg.is_none() {
            return DmaStatus::empty();
        }
        engine.stop();
        let status = engine.take_status();
        if let Some(sg) = self.sg.take() {
            engine.unmap(sg);
        }
        self.dma_running = false;
        status
    }

    /// Completion check used by both entry points: a running DMA transfer is done when the
    /// engine latched its interrupt, anything else when the device dropped BUSY.
    pub(crate) fn drive_is_ready(&mut self) -> bool {
        if self.dma_running {
            if let Some(engine) = self.dma.as_mut() {
                return engine.irq_pending();
            }
        }
        !self.io.alt_status().contains(crate::regs::AtaStatus::BUSY)
    }
}

impl Device {
    /// Record a failed DMA transfer and fall back to PIO.
    pub(crate) fn note_dma_failure(&mut self) {
        self.dma_failures += 1;
        self.soft_errors += 1;
        if self.dma_failures >= self.config.dma_failure_limit {
            tracing::warn!(
                device = %self.id,
                failures = self.dma_failures,
                "too many DMA failures, using PIO for the rest of the session"
            );
            self.dma = DmaState::PioOnly;
        } else if self.dma == DmaState::On {
            tracing::warn!(device = %self.id, "DMA failed, retrying in PIO");
            self.dma = DmaState::PioRetry;
        }
    }

    pub(crate) fn note_transfer_success(&mut self, used_dma: bool) {
        if used_dma {
            self.dma_failures = 0;
        } else if self.dma == DmaState::PioRetry {
            tracing::debug!(device = %self.id, "PIO retry succeeded, re-enabling DMA");
            self.dma = DmaState::On;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeviceConfig;
    use crate::device::{ChannelId, DeviceCaps, DeviceIdentity, Unit};
    use crate::mode::TransferMode;

    fn dma_disk() -> Device {
        let mut dev = Device::new(
            DeviceId {
                channel: ChannelId(0),
                unit: Unit::Master,
            },
            DeviceIdentity::disk("disk", DeviceCaps::default()),
            DeviceConfig::default(),
        );
        dev.mode = TransferMode::Udma2;
        dev.dma = DmaState::On;
        dev
    }

    #[test]
    fn pio_retry_then_recover() {
        let mut dev = dma_disk();
        dev.note_dma_failure();
        assert_eq!(dev.dma, DmaState::PioRetry);
        assert_eq!(dev.soft_errors, 1);
        assert!(!dev.using_dma());

        dev.note_transfer_success(false);
        assert_eq!(dev.dma, DmaState::On);
        assert_eq!(dev.dma_failures, 1);

        dev.note_transfer_success(true);
        assert_eq!(dev.dma_failures, 0);
    }

    #[test]
    fn consecutive_failures_disable_dma_for_good() {
        let mut dev = dma_disk();
        for _ in 0..3 {
            dev.note_dma_failure();
            dev.note_transfer_success(false);
        }
        assert_eq!(dev.dma, DmaState::PioOnly);
        dev.note_transfer_success(false);
        assert_eq!(dev.dma, DmaState::PioOnly);
    }

    #[test]
    fn scatter_list_totals() {
        let sg = ScatterList::new(vec![
            SgEntry { addr: 0x1000, len: 512 },
            SgEntry { addr: 0x8000, len: 1024 },
        ]);
        assert_eq!(sg.len(), 2);
        assert_eq!(sg.total_bytes(), 1536);
        assert!(ScatterList::default().is_empty());
    }
}
