use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};
use crate::mode::TransferMode;
use crate::time::{Tick, HZ, RESET_POLL_INTERVAL, WAIT_CMD, WAIT_MIN_SLEEP, WAIT_WORSTCASE};

/// Per-device recovery limits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Failed resets tolerated before the device's requests are failed without dispatch.
    ///
    /// `0` disables the check.
    pub max_failures: u32,
    /// Retry budget given to each request submitted to this device.
    pub max_retries: u8,
    /// Consecutive DMA failures after which the device stays in PIO for the session.
    pub dma_failure_limit: u32,
    /// Do not treat DEVICE FAULT in the status register as a bus fault.
    pub ignore_write_fault: bool,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            max_failures: 1,
            max_retries: 8,
            dma_failure_limit: 3,
            ignore_write_fault: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    pub irq: u8,
    /// Share one busy token with the sibling channel of the same controller.
    pub serialize_with_sibling: bool,
    /// Negotiate the best DMA mode when a DMA-capable device is attached. When off, attach
    /// still negotiates the best PIO mode.
    pub dma_autonegotiate: bool,
    /// Fastest mode the channel's chipset supports.
    pub max_mode: Option<TransferMode>,
    pub command_timeout: Tick,
    pub min_sleep: Tick,
    /// Time the reset line is left deasserted before the first ready poll.
    pub reset_settle: Tick,
    pub reset_poll_interval: Tick,
    pub reset_deadline: Tick,
    /// Every `reset_every`-th retry of a request escalates to a bus reset. `0` disables.
    pub reset_every: u8,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            irq: 14,
            serialize_with_sibling: false,
            dma_autonegotiate: true,
            max_mode: None,
            command_timeout: WAIT_CMD,
            min_sleep: WAIT_MIN_SLEEP,
            reset_settle: HZ / 20,
            reset_poll_interval: RESET_POLL_INTERVAL,
            reset_deadline: WAIT_WORSTCASE,
            reset_every: 4,
        }
    }
}

impl ChannelConfig {
    pub fn validate(&self) -> Result<()> {
        if self.command_timeout == 0 {
            return Err(CoreError::InvalidConfig("command_timeout must be non-zero"));
        }
        if self.reset_poll_interval == 0 {
            return Err(CoreError::InvalidConfig(
                "reset_poll_interval must be non-zero",
            ));
        }
        if self.reset_deadline < self.reset_poll_interval {
            return Err(CoreError::InvalidConfig(
                "reset_deadline must be at least one poll interval",
            ));
        }
        Ok(())
    }
}
