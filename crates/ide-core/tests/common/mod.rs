#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use ide_core::{
    cmd, AtaError, AtaStatus, Channel, ChannelBuilder, ChannelConfig, ChannelId, ChannelIo,
    CommandBackend, CommandContext, Completion, CompletionSink, DeviceCaps, DeviceConfig,
    DeviceControl, DeviceIdentity, Direction, DmaEngine, DmaSetup, DmaStatus, ErrorKind,
    ExpiryAction, Failure, FakeClock, IrqReturn, Phase, Request, RequestId, ScatterList, SgEntry,
    Step, TaskFile, Tick, TimingBackend, TransferMode, Unit,
};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

pub const READY: AtaStatus = AtaStatus::READY.union(AtaStatus::SEEK_COMPLETE);
pub const READY_ERR: AtaStatus = READY.union(AtaStatus::ERROR);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeSetReply {
    Accept,
    Abort,
    Hang,
}

#[derive(Debug)]
pub struct SimState {
    pub status: AtaStatus,
    pub error: AtaError,
    pub irq: bool,
    pub masked: bool,
    pub selected: Unit,
    pub taskfile: TaskFile,
    pub commands: Vec<(Unit, u8, TaskFile)>,
    pub controls: Vec<DeviceControl>,
    pub mode_set: VecDeque<ModeSetReply>,
    /// Alternate status reads that still see BUSY after SRST is released.
    pub reset_busy_polls: u32,
    pub reset_hangs: bool,
    pub reset_diag: u8,
    pub atapi_reset_hangs: bool,
    in_srst: bool,
    reset_remaining: Option<u32>,
}

impl Default for SimState {
    fn default() -> Self {
        Self {
            status: READY,
            error: AtaError::empty(),
            irq: false,
            masked: false,
            selected: Unit::Master,
            taskfile: TaskFile::default(),
            commands: Vec::new(),
            controls: Vec::new(),
            mode_set: VecDeque::new(),
            reset_busy_polls: 2,
            reset_hangs: false,
            reset_diag: 0x01,
            atapi_reset_hangs: false,
            in_srst: false,
            reset_remaining: None,
        }
    }
}

/// Test-side view of a [`SimBus`].
#[derive(Clone, Default)]
pub struct SimHandle(Arc<Mutex<SimState>>);

impl SimHandle {
    pub fn state(&self) -> MutexGuard<'_, SimState> {
        self.0.lock().unwrap()
    }

    pub fn bus(&self) -> SimBus {
        SimBus(self.clone())
    }

    /// The device finished its command and raised INTRQ.
    pub fn finish(&self, status: AtaStatus, error: AtaError) {
        let mut st = self.state();
        st.status = status;
        st.error = error;
        st.irq = true;
    }

    /// The device finished, but the interrupt never made it.
    pub fn finish_silently(&self) {
        let mut st = self.state();
        st.status = READY;
        st.error = AtaError::empty();
    }

    pub fn raise_irq(&self) {
        self.state().irq = true;
    }

    pub fn opcodes(&self) -> Vec<u8> {
        self.state().commands.iter().map(|(_, op, _)| *op).collect()
    }

    pub fn data_opcodes(&self) -> Vec<u8> {
        self.opcodes()
            .into_iter()
            .filter(|op| {
                matches!(
                    *op,
                    cmd::READ_SECTORS | cmd::WRITE_SECTORS | cmd::READ_DMA | cmd::WRITE_DMA
                )
            })
            .collect()
    }

    /// Transfer mode codes written by SET FEATURES, in order.
    pub fn mode_sets(&self) -> Vec<u8> {
        self.state()
            .commands
            .iter()
            .filter(|(_, op, _)| *op == cmd::SET_FEATURES)
            .map(|(_, _, tf)| tf.sector_count as u8)
            .collect()
    }

    pub fn bus_resets(&self) -> usize {
        self.state()
            .controls
            .iter()
            .filter(|ctl| ctl.contains(DeviceControl::SRST))
            .count()
    }

    pub fn queue_mode_set(&self, replies: &[ModeSetReply]) {
        self.state().mode_set.extend(replies.iter().copied());
    }
}

/// Register-level model of a channel with well-behaved devices.
pub struct SimBus(SimHandle);

impl ChannelIo for SimBus {
    fn status(&mut self) -> AtaStatus {
        let mut st = self.0.state();
        st.irq = false;
        st.status
    }

    fn alt_status(&mut self) -> AtaStatus {
        let mut st = self.0.state();
        if let Some(remaining) = st.reset_remaining {
            if remaining > 0 {
                st.reset_remaining = Some(remaining - 1);
                return AtaStatus::BUSY;
            }
            if st.reset_hangs {
                return AtaStatus::BUSY;
            }
            st.reset_remaining = None;
            st.status = READY;
            st.error = AtaError::from_bits_retain(st.reset_diag);
        }
        st.status
    }

    fn error(&mut self) -> AtaError {
        self.0.state().error
    }

    fn select(&mut self, unit: Unit) {
        self.0.state().selected = unit;
    }

    fn write_taskfile(&mut self, tf: &TaskFile) {
        self.0.state().taskfile = *tf;
    }

    fn write_command(&mut self, opcode: u8) {
        let mut st = self.0.state();
        let entry = (st.selected, opcode, st.taskfile);
        st.commands.push(entry);
        st.error = AtaError::empty();
        st.status = match opcode {
            cmd::SET_FEATURES => match st.mode_set.pop_front().unwrap_or(ModeSetReply::Accept) {
                ModeSetReply::Accept => READY,
                ModeSetReply::Abort => {
                    st.error = AtaError::ABORTED;
                    READY_ERR
                }
                ModeSetReply::Hang => AtaStatus::BUSY,
            },
            cmd::DEVICE_RESET if st.atapi_reset_hangs => AtaStatus::BUSY,
            cmd::DEVICE_RESET => READY,
            _ => AtaStatus::BUSY,
        };
    }

    fn write_control(&mut self, ctl: DeviceControl) {
        let mut st = self.0.state();
        st.controls.push(ctl);
        if ctl.contains(DeviceControl::SRST) {
            st.in_srst = true;
            st.status = AtaStatus::BUSY;
        } else if st.in_srst {
            st.in_srst = false;
            st.reset_remaining = Some(st.reset_busy_polls);
        }
    }

    fn irq_asserted(&mut self) -> bool {
        self.0.state().irq
    }

    fn mask_irq(&mut self) {
        self.0.state().masked = true;
    }

    fn unmask_irq(&mut self) {
        self.0.state().masked = false;
    }

    fn read_data(&mut self, buf: &mut [u8]) {
        buf.fill(0);
    }

    fn write_data(&mut self, _buf: &[u8]) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapResult {
    Ok,
    Unsupported,
    Exhausted,
}

#[derive(Debug)]
pub struct DmaLog {
    pub calls: Vec<&'static str>,
    pub map: MapResult,
    pub running: bool,
    pub irq: bool,
    pub status: DmaStatus,
    pub mapped: usize,
}

impl Default for DmaLog {
    fn default() -> Self {
        Self {
            calls: Vec::new(),
            map: MapResult::Ok,
            running: false,
            irq: false,
            status: DmaStatus::empty(),
            mapped: 0,
        }
    }
}

#[derive(Clone, Default)]
pub struct DmaHandle(Arc<Mutex<DmaLog>>);

impl DmaHandle {
    pub fn log(&self) -> MutexGuard<'_, DmaLog> {
        self.0.lock().unwrap()
    }

    pub fn engine(&self) -> SimDma {
        SimDma(self.clone())
    }

    /// Latch the completion interrupt of a running transfer.
    pub fn finish(&self, error: bool) {
        let mut log = self.log();
        if log.running {
            log.irq = true;
            log.status |= DmaStatus::INTERRUPT;
            if error {
                log.status |= DmaStatus::ERROR;
            }
        }
    }

    pub fn take_calls(&self) -> Vec<&'static str> {
        std::mem::take(&mut self.log().calls)
    }
}

pub struct SimDma(DmaHandle);

impl DmaEngine for SimDma {
    fn map(&mut self, _device: ide_core::DeviceId, request: &Request) -> DmaSetup {
        let mut log = self.0.log();
        log.calls.push("map");
        match log.map {
            MapResult::Ok => {
                log.mapped += 1;
                DmaSetup::Ok(ScatterList::new(vec![SgEntry {
                    addr: 0x0010_0000,
                    len: request.sectors * 512,
                }]))
            }
            MapResult::Unsupported => DmaSetup::Unsupported,
            MapResult::Exhausted => DmaSetup::ResourceExhausted,
        }
    }

    fn start(&mut self, _sg: &ScatterList, _direction: Direction) {
        let mut log = self.0.log();
        log.calls.push("start");
        log.running = true;
        log.status = DmaStatus::ACTIVE;
    }

    fn stop(&mut self) {
        let mut log = self.0.log();
        log.calls.push("stop");
        log.running = false;
        log.status.remove(DmaStatus::ACTIVE);
    }

    fn take_status(&mut self) -> DmaStatus {
        let mut log = self.0.log();
        log.calls.push("take_status");
        log.irq = false;
        std::mem::replace(&mut log.status, DmaStatus::empty())
    }

    fn irq_pending(&mut self) -> bool {
        self.0.log().irq
    }

    fn unmap(&mut self, _sg: ScatterList) {
        let mut log = self.0.log();
        log.calls.push("unmap");
        log.mapped -= 1;
    }
}

/// What the disk command builder does on its next `issue`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Script {
    Normal,
    /// Finish synchronously without touching the bus.
    Immediate,
    Stall(Tick),
    /// Return CONTINUES without arming anything.
    ForgetToArm,
    /// Try to arm twice.
    DoubleArm,
    /// ATAPI-style packet phase followed by a data phase.
    TwoPhase,
    /// Arm with an expiry hook that extends the deadline this many times.
    Extend(u32),
    /// PIO command whose error is reported as the device rejecting its transfer mode.
    RejectMode,
}

const REJECT_MODE: u16 = 1;

#[derive(Default)]
pub struct DiskBackend {
    script: Mutex<VecDeque<Script>>,
    extensions: AtomicUsize,
    pub issued: AtomicUsize,
    pub double_arm_rejected: AtomicBool,
    pub saw_recalibrate: AtomicBool,
}

impl DiskBackend {
    pub fn push(&self, steps: &[Script]) {
        self.script.lock().unwrap().extend(steps.iter().copied());
    }

    fn finish_pio(ctx: &mut CommandContext<'_>) -> Step {
        let bad = match ctx.request().direction {
            Direction::Read => AtaStatus::BAD_READ,
            Direction::Write => AtaStatus::BAD_WRITE,
        };
        let status = ctx.io().status();
        if ide_core::ok_stat(status, AtaStatus::READY, bad) {
            Step::Finished(Ok(()))
        } else {
            let error = ctx.io().error();
            Step::Finished(Err(Failure::device(status, error)))
        }
    }
}

impl CommandBackend for DiskBackend {
    fn issue(&self, ctx: &mut CommandContext<'_>) -> Step {
        self.issued.fetch_add(1, Ordering::SeqCst);
        if ctx.device().recalibrate() {
            self.saw_recalibrate.store(true, Ordering::SeqCst);
        }
        let script = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Script::Normal);
        let timeout = ctx.command_timeout();
        let rq = ctx.request().clone();
        let tf = TaskFile {
            sector_count: rq.sectors as u16,
            lba: rq.lba,
            ..TaskFile::default()
        };

        match script {
            Script::Immediate => return Step::Finished(Ok(())),
            Script::Stall(ticks) => return Step::Stall(ticks),
            Script::ForgetToArm => {
                ctx.command(cmd::READ_SECTORS, &tf);
                return Step::Continues;
            }
            Script::TwoPhase => {
                ctx.command(cmd::PACKET, &tf);
                ctx.arm(Phase::AtapiPacket, timeout).unwrap();
                return Step::Continues;
            }
            Script::Extend(times) => {
                self.extensions.store(times as usize, Ordering::SeqCst);
                ctx.command(cmd::READ_SECTORS, &tf);
                ctx.arm_with_expiry(Phase::PioIn, timeout).unwrap();
                return Step::Continues;
            }
            Script::RejectMode => {
                ctx.command(cmd::READ_SECTORS, &tf);
                ctx.arm(Phase::Custom(REJECT_MODE), timeout).unwrap();
                return Step::Continues;
            }
            Script::Normal | Script::DoubleArm => {}
        }

        if let DmaSetup::Ok(_) = ctx.try_setup_dma() {
            let opcode = match rq.direction {
                Direction::Read => cmd::READ_DMA,
                Direction::Write => cmd::WRITE_DMA,
            };
            ctx.command(opcode, &tf);
            assert!(ctx.start_dma());
            ctx.arm(Phase::Dma, timeout).unwrap();
        } else {
            let (opcode, phase) = match rq.direction {
                Direction::Read => (cmd::READ_SECTORS, Phase::PioIn),
                Direction::Write => (cmd::WRITE_SECTORS, Phase::PioOut),
            };
            ctx.command(opcode, &tf);
            ctx.arm(phase, timeout).unwrap();
        }

        if script == Script::DoubleArm {
            let again = ctx.arm(Phase::PioIn, timeout);
            if matches!(again, Err(ide_core::CoreError::HandlerAlreadyArmed { .. })) {
                self.double_arm_rejected.store(true, Ordering::SeqCst);
            }
        }
        Step::Continues
    }

    fn on_interrupt(&self, ctx: &mut CommandContext<'_>, phase: Phase) -> Step {
        match phase {
            Phase::Dma => {
                let dma = ctx.end_dma();
                if dma.contains(DmaStatus::ERROR) {
                    let _ = ctx.io().status();
                    return Step::Finished(Err(Failure::dma("bus master error")));
                }
                Self::finish_pio(ctx)
            }
            Phase::AtapiPacket => {
                let status = ctx.io().status();
                if status.contains(AtaStatus::ERROR) {
                    let error = ctx.io().error();
                    return Step::Finished(Err(Failure::device(status, error)));
                }
                ctx.io().write_command(cmd::READ_SECTORS);
                let timeout = ctx.command_timeout();
                ctx.arm(Phase::AtapiData, timeout).unwrap();
                Step::Continues
            }
            Phase::Custom(REJECT_MODE) => {
                let status = ctx.io().status();
                if status.contains(AtaStatus::ERROR) {
                    let error = ctx.io().error();
                    return Step::Finished(Err(Failure::device(status, error)
                        .with_kind(ErrorKind::ConfigurationRejected)));
                }
                Step::Finished(Ok(()))
            }
            _ => Self::finish_pio(ctx),
        }
    }

    fn on_expiry(&self, _ctx: &mut CommandContext<'_>, _phase: Phase) -> ExpiryAction {
        let left = self.extensions.load(Ordering::SeqCst);
        if left == 0 {
            return ExpiryAction::Expire;
        }
        self.extensions.store(left - 1, Ordering::SeqCst);
        ExpiryAction::Extend(1_000)
    }
}

/// Records every completion.
#[derive(Clone, Default)]
pub struct Collect(Arc<Mutex<Vec<Completion>>>);

impl Collect {
    pub fn all(&self) -> Vec<Completion> {
        self.0.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.0.lock().unwrap().len()
    }

    pub fn ids(&self) -> Vec<RequestId> {
        self.all().iter().map(|c| c.request).collect()
    }

    pub fn only(&self) -> Completion {
        let all = self.all();
        assert_eq!(all.len(), 1, "expected exactly one completion: {all:?}");
        all.into_iter().next().unwrap()
    }

    pub fn failure_kind(&self, id: RequestId) -> Option<ErrorKind> {
        self.all()
            .into_iter()
            .find(|c| c.request == id)
            .and_then(|c| c.result.err())
            .map(|f| f.kind)
    }
}

impl CompletionSink for Collect {
    fn complete(&self, completion: Completion) {
        self.0.lock().unwrap().push(completion);
    }
}

/// Timing backend that records what it was asked to program.
#[derive(Default)]
pub struct RecordingTiming {
    pub ceiling: Option<TransferMode>,
    pub chipset: Mutex<Vec<TransferMode>>,
    pub drive: Mutex<Vec<Option<u8>>>,
}

impl TimingBackend for RecordingTiming {
    fn tune_chipset(&self, _device: &ide_core::Device, mode: TransferMode) -> bool {
        self.chipset.lock().unwrap().push(mode);
        self.ceiling.map_or(true, |ceiling| mode <= ceiling)
    }

    fn tune_drive(&self, _device: &ide_core::Device, pio: Option<u8>) {
        self.drive.lock().unwrap().push(pio);
    }
}

pub fn pio_disk() -> DeviceIdentity {
    DeviceIdentity::disk("SIM PIO DISK", DeviceCaps::default())
}

pub fn dma_disk() -> DeviceIdentity {
    DeviceIdentity::disk(
        "SIM UDMA DISK",
        DeviceCaps {
            dma: true,
            max_pio: 4,
            max_mwdma: Some(2),
            max_udma: Some(5),
        },
    )
}

pub fn atapi_drive() -> DeviceIdentity {
    DeviceIdentity::atapi("SIM CDROM", DeviceCaps::default())
}

/// A channel wired to a simulated bus, DMA engine, disk command builder and fake clock.
pub struct Rig {
    pub channel: Arc<Channel>,
    pub sim: SimHandle,
    pub dma: DmaHandle,
    pub backend: Arc<DiskBackend>,
    pub sink: Collect,
    pub clock: Arc<FakeClock>,
}

pub struct RigBuilder {
    id: ChannelId,
    config: ChannelConfig,
    timing: Option<Arc<dyn TimingBackend>>,
    clock: Arc<FakeClock>,
}

impl RigBuilder {
    pub fn new() -> Self {
        Self {
            id: ChannelId(0),
            config: ChannelConfig::default(),
            timing: None,
            clock: Arc::new(FakeClock::new(1_000)),
        }
    }

    pub fn id(mut self, id: ChannelId) -> Self {
        self.id = id;
        self
    }

    pub fn config(mut self, config: ChannelConfig) -> Self {
        self.config = config;
        self
    }

    pub fn timing(mut self, timing: Arc<dyn TimingBackend>) -> Self {
        self.timing = Some(timing);
        self
    }

    pub fn clock(mut self, clock: Arc<FakeClock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn build(self) -> Rig {
        init_tracing();
        let sim = SimHandle::default();
        let dma = DmaHandle::default();
        let backend = Arc::new(DiskBackend::default());
        let sink = Collect::default();

        let mut builder = ChannelBuilder::new(self.id, sim.bus(), backend.clone())
            .config(self.config)
            .dma(dma.engine())
            .clock(self.clock.clone())
            .sink(Arc::new(sink.clone()));
        if let Some(timing) = self.timing {
            builder = builder.timing(timing);
        }
        let channel = builder.build().unwrap();

        Rig {
            channel,
            sim,
            dma,
            backend,
            sink,
            clock: self.clock,
        }
    }
}

pub fn rig() -> Rig {
    RigBuilder::new().build()
}

impl Rig {
    pub fn attach(&self, unit: Unit, identity: DeviceIdentity) {
        self.attach_with(unit, identity, DeviceConfig::default());
    }

    pub fn attach_with(&self, unit: Unit, identity: DeviceIdentity, config: DeviceConfig) {
        self.channel.attach_device(unit, identity, config).unwrap();
    }

    pub fn read(&self, unit: Unit, lba: u64) -> RequestId {
        self.channel.submit(unit, Request::read(lba, 8)).unwrap()
    }

    /// Successful completion with its interrupt.
    pub fn complete(&self) -> IrqReturn {
        self.dma.finish(false);
        self.sim.finish(READY, AtaError::empty());
        self.channel.handle_interrupt()
    }

    /// The device reports an error.
    pub fn fail(&self, error: AtaError) -> IrqReturn {
        self.dma.finish(false);
        self.sim.finish(READY_ERR, error);
        self.channel.handle_interrupt()
    }

    /// Let the armed deadline pass and fire the timer.
    pub fn expire(&self) -> bool {
        if let Some(deadline) = self.channel.next_deadline() {
            if deadline > ide_core::Clock::now(self.clock.as_ref()) {
                self.clock.set(deadline);
            }
        }
        self.channel.handle_timer()
    }

    /// Complete everything that is queued, waking sleepers as needed.
    pub fn drain(&self) {
        for _ in 0..1_000 {
            if self.channel.is_busy() {
                self.complete();
            } else if self.channel.next_deadline().is_some() {
                self.expire();
            } else {
                return;
            }
        }
        panic!("channel did not go idle");
    }
}
