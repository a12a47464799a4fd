use std::fmt;

use serde::{Deserialize, Serialize};

use crate::device::{Device, DeviceCaps};

/// Transfer modes, ordered slowest to fastest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TransferMode {
    Pio0,
    Pio1,
    Pio2,
    Pio3,
    Pio4,
    Mwdma0,
    Mwdma1,
    Mwdma2,
    Udma0,
    Udma1,
    Udma2,
    Udma3,
    Udma4,
    Udma5,
    Udma6,
}

impl TransferMode {
    pub const LADDER: [TransferMode; 15] = [
        TransferMode::Pio0,
        TransferMode::Pio1,
        TransferMode::Pio2,
        TransferMode::Pio3,
        TransferMode::Pio4,
        TransferMode::Mwdma0,
        TransferMode::Mwdma1,
        TransferMode::Mwdma2,
        TransferMode::Udma0,
        TransferMode::Udma1,
        TransferMode::Udma2,
        TransferMode::Udma3,
        TransferMode::Udma4,
        TransferMode::Udma5,
        TransferMode::Udma6,
    ];

    fn rung(self) -> usize {
        self as usize
    }

    /// Next slower mode, or `None` at PIO0.
    pub fn reduce(self) -> Option<Self> {
        self.rung()
            .checked_sub(1)
            .map(|rung| Self::LADDER[rung])
    }

    pub fn is_dma(self) -> bool {
        self >= TransferMode::Mwdma0
    }

    pub fn is_udma(self) -> bool {
        self >= TransferMode::Udma0
    }

    /// PIO mode number, for PIO modes.
    pub fn pio_number(self) -> Option<u8> {
        (!self.is_dma()).then_some(self.rung() as u8)
    }

    /// Mode number within its class (PIO, MWDMA or UDMA).
    pub fn number(self) -> u8 {
        match self {
            m if m.is_udma() => (m.rung() - TransferMode::Udma0.rung()) as u8,
            m if m.is_dma() => (m.rung() - TransferMode::Mwdma0.rung()) as u8,
            m => m.rung() as u8,
        }
    }

    /// Value written to the sector count register by SET FEATURES / set transfer mode.
    pub fn xfer_code(self) -> u8 {
        let base = if self.is_udma() {
            0x40
        } else if self.is_dma() {
            0x20
        } else {
            0x08
        };
        base | self.number()
    }

    fn supported_by(self, caps: &DeviceCaps, allow_dma: bool) -> bool {
        if self.is_udma() {
            allow_dma && caps.dma && caps.max_udma.is_some_and(|max| self.number() <= max)
        } else if self.is_dma() {
            allow_dma && caps.dma && caps.max_mwdma.is_some_and(|max| self.number() <= max)
        } else {
            self.number() <= caps.max_pio
        }
    }

    /// Fastest mode no faster than `requested` that both the device and the channel support.
    ///
    /// PIO0 is always supported.
    pub fn filter(
        requested: TransferMode,
        caps: &DeviceCaps,
        ceiling: Option<TransferMode>,
        allow_dma: bool,
    ) -> TransferMode {
        let limit = ceiling.map_or(requested, |ceiling| requested.min(ceiling));
        Self::LADDER[..=limit.rung()]
            .iter()
            .rev()
            .copied()
            .find(|mode| mode.supported_by(caps, allow_dma))
            .unwrap_or(TransferMode::Pio0)
    }

    /// Fastest mode the device supports under the channel ceiling.
    pub fn best(caps: &DeviceCaps, ceiling: Option<TransferMode>, allow_dma: bool) -> Self {
        Self::filter(TransferMode::Udma6, caps, ceiling, allow_dma)
    }
}

impl fmt::Display for TransferMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let class = if self.is_udma() {
            "UDMA"
        } else if self.is_dma() {
            "MWDMA"
        } else {
            "PIO"
        };
        write!(f, "{class}{}", self.number())
    }
}

/// Chipset timing programmer.
///
/// Implementations compute timing register values for a device and mode and write them to the
/// controller. They hold no scheduling state and are called with the channel lock held.
pub trait TimingBackend: Send + Sync {
    /// Program the controller for `mode`. Returns `false` if the chipset cannot run it.
    fn tune_chipset(&self, device: &Device, mode: TransferMode) -> bool;

    /// Program PIO timings, optionally for a specific PIO mode.
    fn tune_drive(&self, device: &Device, pio: Option<u8>) {
        let _ = (device, pio);
    }
}

/// Timing backend for controllers without programmable timings.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullTiming;

impl TimingBackend for NullTiming {
    fn tune_chipset(&self, _device: &Device, _mode: TransferMode) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn udma_disk() -> DeviceCaps {
        DeviceCaps {
            dma: true,
            max_pio: 4,
            max_mwdma: Some(2),
            max_udma: Some(5),
        }
    }

    #[test]
    fn reduce_walks_down_the_ladder() {
        assert_eq!(TransferMode::Udma0.reduce(), Some(TransferMode::Mwdma2));
        assert_eq!(TransferMode::Mwdma0.reduce(), Some(TransferMode::Pio4));
        assert_eq!(TransferMode::Pio1.reduce(), Some(TransferMode::Pio0));
        assert_eq!(TransferMode::Pio0.reduce(), None);

        let mut mode = TransferMode::Udma6;
        let mut steps = 0;
        while let Some(next) = mode.reduce() {
            assert!(next < mode);
            mode = next;
            steps += 1;
        }
        assert_eq!(steps, 14);
    }

    #[test]
    fn xfer_codes() {
        assert_eq!(TransferMode::Pio4.xfer_code(), 0x0C);
        assert_eq!(TransferMode::Mwdma2.xfer_code(), 0x22);
        assert_eq!(TransferMode::Udma5.xfer_code(), 0x45);
        assert_eq!(TransferMode::Udma5.to_string(), "UDMA5");
        assert_eq!(TransferMode::Pio3.pio_number(), Some(3));
        assert_eq!(TransferMode::Udma0.pio_number(), None);
    }

    #[test]
    fn filter_respects_device_and_channel_limits() {
        let caps = udma_disk();
        assert_eq!(
            TransferMode::best(&caps, None, true),
            TransferMode::Udma5
        );
        assert_eq!(
            TransferMode::best(&caps, Some(TransferMode::Udma2), true),
            TransferMode::Udma2
        );
        assert_eq!(
            TransferMode::filter(TransferMode::Udma1, &caps, None, true),
            TransferMode::Udma1
        );
        assert_eq!(TransferMode::best(&caps, None, false), TransferMode::Pio4);
    }

    #[test]
    fn filter_skips_unsupported_classes() {
        let caps = DeviceCaps {
            dma: true,
            max_pio: 3,
            max_mwdma: None,
            max_udma: Some(2),
        };
        assert_eq!(
            TransferMode::filter(TransferMode::Mwdma2, &caps, None, true),
            TransferMode::Pio3
        );
        let pio_only = DeviceCaps::default();
        assert_eq!(
            TransferMode::best(&pio_only, Some(TransferMode::Pio2), true),
            TransferMode::Pio2
        );
    }
}
