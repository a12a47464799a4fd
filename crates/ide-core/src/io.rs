use crate::device::Unit;
use crate::regs::{AtaError, AtaStatus, DeviceControl, TaskFile};

/// Register-level access to one channel's command and control blocks.
///
/// Implementations are owned by the channel and only touched while the channel lock is held,
/// so they never see concurrent calls.
pub trait ChannelIo: Send {
    /// Read the Status register. This acknowledges a pending device interrupt.
    fn status(&mut self) -> AtaStatus;

    /// Read the Alternate Status register without acknowledging anything.
    fn alt_status(&mut self) -> AtaStatus;

    fn error(&mut self) -> AtaError;

    fn select(&mut self, unit: Unit);

    fn write_taskfile(&mut self, tf: &TaskFile);

    fn write_command(&mut self, opcode: u8);

    fn write_control(&mut self, ctl: DeviceControl);

    /// Whether the interrupt line is currently asserted by this channel.
    ///
    /// Controllers that share one IRQ between channels override this to report ownership; the
    /// default claims every interrupt.
    fn irq_asserted(&mut self) -> bool {
        true
    }

    /// Disable delivery of this channel's interrupt line.
    fn mask_irq(&mut self) {}

    fn unmask_irq(&mut self) {}

    fn read_data(&mut self, buf: &mut [u8]);

    fn write_data(&mut self, buf: &[u8]);
}
