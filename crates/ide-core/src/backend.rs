//! Contract between the channel core and the device-type command builders.
//!
//! A builder issues the command for a request and arms a completion handler, described by a
//! [`Phase`] tag rather than a callback, so multi-phase transfers (ATAPI packet, then data) are
//! a sequence of re-arms the core drives through [`CommandBackend::on_interrupt`].

use std::borrow::Cow;

use crate::channel::Hw;
use crate::device::{ChannelId, Device, Unit};
use crate::diag::FailureReason;
use crate::dma::{DmaSetup, DmaStatus};
use crate::error::{CoreError, ErrorKind, Result};
use crate::io::ChannelIo;
use crate::regs::{AtaError, AtaStatus, TaskFile};
use crate::request::Request;
use crate::time::Tick;

/// Continuation of an outstanding command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    NonData,
    PioIn,
    PioOut,
    Dma,
    AtapiPacket,
    AtapiData,
    /// Builder-specific phase.
    Custom(u16),
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct Armed {
    pub(crate) unit: Unit,
    pub(crate) phase: Phase,
    /// Consult [`CommandBackend::on_expiry`] before treating expiry as a timeout.
    pub(crate) expiry: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    pub reason: FailureReason,
    /// Status register as read by the builder. Read by the core when absent.
    pub status: Option<AtaStatus>,
    pub error: Option<AtaError>,
    /// Bypass the error policy with a known kind.
    pub kind: Option<ErrorKind>,
    pub message: Cow<'static, str>,
}

impl Failure {
    /// The device reported an error status.
    pub fn device(status: AtaStatus, error: AtaError) -> Self {
        Self {
            reason: FailureReason::Interrupt,
            status: Some(status),
            error: Some(error),
            kind: None,
            message: Cow::Borrowed("command failed"),
        }
    }

    /// The command builder and the device disagree about the command's progress.
    pub fn protocol(message: impl Into<Cow<'static, str>>) -> Self {
        Self {
            reason: FailureReason::Protocol,
            status: None,
            error: None,
            kind: None,
            message: message.into(),
        }
    }

    /// The DMA engine reported an error for an otherwise healthy device.
    pub fn dma(message: impl Into<Cow<'static, str>>) -> Self {
        Self {
            kind: Some(ErrorKind::DmaFault),
            ..Self::protocol(message)
        }
    }

    pub(crate) fn timeout(reason: FailureReason) -> Self {
        Self {
            reason,
            status: None,
            error: None,
            kind: None,
            message: Cow::Borrowed(match reason {
                FailureReason::DmaTimeout => "DMA timeout",
                _ => "command timeout",
            }),
        }
    }

    pub fn with_kind(mut self, kind: ErrorKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn with_message(mut self, message: impl Into<Cow<'static, str>>) -> Self {
        self.message = message.into();
        self
    }
}

pub type Outcome = std::result::Result<(), Failure>;

/// Result of one call into a command builder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// A handler was armed; wait for its interrupt or expiry.
    Continues,
    /// The command is over.
    Finished(Outcome),
    /// The device wants the bus left alone for a while. The request goes back to the head
    /// of its queue undispatched.
    Stall(Tick),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpiryAction {
    /// Push the deadline out by this many ticks.
    Extend(Tick),
    Expire,
}

/// Device-type command builder (disk, ATAPI, ...).
pub trait CommandBackend: Send + Sync {
    /// Issue the command for `ctx.request()`.
    ///
    /// Must arm a handler before returning [`Step::Continues`].
    fn issue(&self, ctx: &mut CommandContext<'_>) -> Step;

    /// The armed handler for `phase` fired. The handler slot is already clear.
    fn on_interrupt(&self, ctx: &mut CommandContext<'_>, phase: Phase) -> Step;

    /// The deadline of a handler armed with [`CommandContext::arm_with_expiry`] passed.
    fn on_expiry(&self, ctx: &mut CommandContext<'_>, phase: Phase) -> ExpiryAction {
        let _ = (ctx, phase);
        ExpiryAction::Expire
    }
}

/// What a command builder may touch while it runs.
pub struct CommandContext<'a> {
    pub(crate) channel: ChannelId,
    pub(crate) unit: Unit,
    pub(crate) now: Tick,
    pub(crate) command_timeout: Tick,
    pub(crate) device: &'a Device,
    pub(crate) request: &'a Request,
    pub(crate) hw: &'a mut Hw,
    pub(crate) slot: &'a mut Option<Armed>,
    pub(crate) deadline: &'a mut Option<Tick>,
}

impl CommandContext<'_> {
    pub fn channel(&self) -> ChannelId {
        self.channel
    }

    pub fn unit(&self) -> Unit {
        self.unit
    }

    pub fn now(&self) -> Tick {
        self.now
    }

    pub fn device(&self) -> &Device {
        self.device
    }

    pub fn request(&self) -> &Request {
        self.request
    }

    /// Timeout configured for the channel's commands.
    pub fn command_timeout(&self) -> Tick {
        self.command_timeout
    }

    pub fn io(&mut self) -> &mut dyn ChannelIo {
        self.hw.io.as_mut()
    }

    /// Select the device, load the task file and write the command register.
    pub fn command(&mut self, opcode: u8, tf: &TaskFile) {
        self.hw.io.select(self.unit);
        self.hw.io.write_taskfile(tf);
        self.hw.io.write_command(opcode);
        self.hw.last_opcode = Some(opcode);
    }

    /// Arm the completion handler for `phase` and (re)start the channel timer.
    pub fn arm(&mut self, phase: Phase, timeout: Tick) -> Result<()> {
        self.arm_inner(phase, timeout, false)
    }

    /// As [`Self::arm`], consulting [`CommandBackend::on_expiry`] when the timer fires.
    pub fn arm_with_expiry(&mut self, phase: Phase, timeout: Tick) -> Result<()> {
        self.arm_inner(phase, timeout, true)
    }

    fn arm_inner(&mut self, phase: Phase, timeout: Tick, expiry: bool) -> Result<()> {
        if let Some(armed) = *self.slot {
            tracing::error!(
                channel = %self.channel,
                armed = ?armed.phase,
                requested = ?phase,
                "completion handler is already armed"
            );
            return Err(CoreError::HandlerAlreadyArmed {
                channel: self.channel,
            });
        }
        *self.slot = Some(Armed {
            unit: self.unit,
            phase,
            expiry,
        });
        *self.deadline = Some(self.now + timeout);
        Ok(())
    }

    pub fn is_armed(&self) -> bool {
        self.slot.is_some()
    }

    /// Map the current request for DMA. Anything but [`DmaSetup::Ok`] means "use PIO".
    pub fn try_setup_dma(&mut self) -> DmaSetup {
        self.hw.try_setup_dma(self.device, self.request)
    }

    /// Start the transfer mapped by [`Self::try_setup_dma`]. Returns `false` if none is mapped.
    pub fn start_dma(&mut self) -> bool {
        self.hw.start_dma(self.request.direction)
    }

    /// Stop the engine and release the mapping. Returns the engine status read on the way.
    pub fn end_dma(&mut self) -> DmaStatus {
        self.hw.end_dma()
    }
}
