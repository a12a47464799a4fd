//! Task-file register values as seen by the channel core.
//!
//! Only the bits the scheduler and recovery engine reason about are named here; the exact
//! register layout of a controller stays behind [`crate::ChannelIo`].

use bitflags::bitflags;

bitflags! {
    /// ATA Status / Alternate Status register.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct AtaStatus: u8 {
        const BUSY = 0x80;
        const READY = 0x40;
        const DEVICE_FAULT = 0x20;
        const SEEK_COMPLETE = 0x10;
        const DATA_REQUEST = 0x08;
        const CORRECTED = 0x04;
        const INDEX = 0x02;
        const ERROR = 0x01;
    }
}

impl AtaStatus {
    /// Bits that must be clear for a read-type command to be considered complete.
    pub const BAD_READ: Self = Self::BUSY.union(Self::ERROR);
    /// Bits that must be clear for a write-type command to be considered complete.
    pub const BAD_WRITE: Self = Self::BAD_READ.union(Self::DEVICE_FAULT);
    /// Bits that must be clear for a non-data command to be considered complete.
    pub const BAD: Self = Self::BAD_READ.union(Self::DATA_REQUEST);
    pub const DRIVE_READY: Self = Self::READY.union(Self::SEEK_COMPLETE);

    pub(crate) fn names(self) -> String {
        join_names(self.iter_names().map(|(name, _)| name))
    }
}

bitflags! {
    /// ATA Error register (valid when [`AtaStatus::ERROR`] is set).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct AtaError: u8 {
        /// Interface CRC error on UDMA transfers; bad block mark on older devices.
        const INTERFACE_CRC = 0x80;
        const UNCORRECTABLE = 0x40;
        const MEDIA_CHANGED = 0x20;
        const ID_NOT_FOUND = 0x10;
        const MEDIA_CHANGE_REQUEST = 0x08;
        const ABORTED = 0x04;
        const TRACK0_NOT_FOUND = 0x02;
        const ADDR_MARK_NOT_FOUND = 0x01;
    }
}

impl AtaError {
    /// An aborted command that also reports an interface CRC error (UDMA CRC).
    pub const BAD_CRC: Self = Self::INTERFACE_CRC.union(Self::ABORTED);

    pub(crate) fn names(self) -> String {
        join_names(self.iter_names().map(|(name, _)| name))
    }
}

bitflags! {
    /// Device Control register.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct DeviceControl: u8 {
        /// Masks the device interrupt output.
        const NIEN = 0x02;
        /// Software reset of both devices on the channel.
        const SRST = 0x04;
        const HOB = 0x80;
    }
}

/// `(status & (good | bad)) == good`
pub fn ok_stat(status: AtaStatus, good: AtaStatus, bad: AtaStatus) -> bool {
    status.intersection(good.union(bad)) == good
}

/// Command opcodes the core issues itself, plus the common data commands command builders use.
pub mod cmd {
    pub const DEVICE_RESET: u8 = 0x08;
    pub const READ_SECTORS: u8 = 0x20;
    pub const WRITE_SECTORS: u8 = 0x30;
    pub const PACKET: u8 = 0xA0;
    pub const READ_DMA: u8 = 0xC8;
    pub const WRITE_DMA: u8 = 0xCA;
    pub const IDLE_IMMEDIATE: u8 = 0xE1;
    pub const SET_FEATURES: u8 = 0xEF;

    /// SET FEATURES subcommand: set transfer mode from the sector count register.
    pub const SETFEATURES_XFER: u8 = 0x03;
}

/// Register values written ahead of a command.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TaskFile {
    pub features: u8,
    pub sector_count: u16,
    pub lba: u64,
    pub lba48: bool,
}

impl TaskFile {
    pub fn set_transfer_mode(xfer_code: u8) -> Self {
        Self {
            features: cmd::SETFEATURES_XFER,
            sector_count: xfer_code as u16,
            ..Self::default()
        }
    }
}

fn join_names<'a>(names: impl Iterator<Item = &'a str>) -> String {
    let mut out = String::new();
    for name in names {
        if !out.is_empty() {
            out.push(' ');
        }
        out.push_str(name);
    }
    out
}
