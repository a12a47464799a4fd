//! Command dispatch and error recovery for ATA/IDE channels.
//!
//! A [`Channel`] multiplexes up to two devices (master/slave) over one register set, one DMA
//! engine and one interrupt line. This crate owns the hard part of driving it:
//!
//! - [`Channel::submit`] queues a [`Request`] per device; the scheduler picks the next device
//!   to service, honouring voluntary sleeps and service-time fairness.
//! - The device-type command builder ([`CommandBackend`]) issues the command and arms a
//!   completion handler ([`Phase`]) through [`CommandContext`].
//! - [`Channel::handle_interrupt`] and [`Channel::handle_timer`] are the only two entry points
//!   that drive an armed handler, and they never both run it for the same command.
//! - Failed and timed-out commands go through a single recovery decision table: retry,
//!   mode downgrade, DMA to PIO fallback, or the (blocking, bounded) reset protocol.
//!
//! Chipset timing math, bus enumeration and register layouts live outside this crate and plug
//! in through [`ChannelIo`], [`DmaEngine`] and [`TimingBackend`].

#![forbid(unsafe_code)]

mod backend;
mod channel;
mod config;
mod device;
mod diag;
mod dma;
mod error;
mod io;
mod mode;
mod policy;
mod registry;
mod regs;
mod request;
mod time;

pub use backend::{CommandBackend, CommandContext, ExpiryAction, Failure, Outcome, Phase, Step};
pub use channel::{
    Channel, ChannelBuilder, ChannelState, ChannelStats, IrqReturn, ResetOutcome, ResetScope,
};
pub use config::{ChannelConfig, DeviceConfig};
pub use device::{
    ChannelId, Device, DeviceCaps, DeviceId, DeviceIdentity, DeviceKind, DeviceStatus, DmaState,
    Unit,
};
pub use diag::{describe_reset_diagnostic, Diagnostic, FailureReason};
pub use dma::{DmaEngine, DmaSetup, DmaStatus, ScatterList, SgEntry};
pub use error::{CoreError, ErrorKind, RequestFailure, Result};
pub use io::ChannelIo;
pub use mode::{NullTiming, TimingBackend, TransferMode};
pub use policy::{decide, Classification, Decision, DefaultErrorPolicy, ErrorPolicy};
pub use registry::Registry;
pub use regs::{cmd, ok_stat, AtaError, AtaStatus, DeviceControl, TaskFile};
pub use request::{Completion, CompletionSink, Direction, Request, RequestId, SECTOR_SIZE};
pub use time::{
    Clock, FakeClock, StdClock, Tick, HZ, RESET_POLL_INTERVAL, WAIT_CMD, WAIT_MIN_SLEEP,
    WAIT_WORSTCASE,
};
