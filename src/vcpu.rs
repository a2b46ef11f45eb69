use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use axerrno::{ax_err, AxResult};
use memory_addr::{align_down_4k, PAGE_SIZE_4K};
use parking_lot::{Mutex, MutexGuard};

use crate::cpu_state::{CpuState, CPUID_OFF};
use crate::exit::{ExitReason, SvmExit, VirtFlavor, VmxExit};
use crate::gate::Gate;
use crate::guest_memory::GuestMemory;
use crate::hal::{ExitHandler, GuestPhysAddr, VmSession};
use crate::mask::Mask;
use crate::message::{CpuExecutor, CpuMessage, CpuMessageType, DeviceBus};
use crate::transfer::{dump, read_vcpu_state, write_vcpu_state};
use crate::vcpu_state::VcpuState;

/// SVM intercept of RDTSC in the primary control word.
const SVM_CTRL_RDTSC: u32 = 1 << 14;
/// SVM intercept of CPUID in the primary control word.
const SVM_CTRL_CPUID: u32 = 1 << 18;
/// SVM intercept of VMRUN in the secondary control word.
const SVM_CTRL_VMRUN: u32 = 1 << 0;
/// VMX RDTSC exiting in the primary processor-based controls.
const VMX_CTRL_RDTSC: u32 = 1 << 12;

/// Valid bit of the injection / IDT-vectoring information.
const INJ_VALID: u32 = 1 << 31;
/// Blocking by STI and by MOV SS in the interruptibility state.
const INTR_STATE_BLOCKING: u32 = 3;
/// Reserved bit 1 of RFLAGS, which must always be set.
const RFLAGS_RESERVED: u64 = 1 << 1;

const PAGE_SHIFT: u64 = 12;

/// The state of a virtual CPU.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VcpuRunState {
    /// The vcpu is created, its startup exit waits for [`Vcpu::start`].
    Created,
    /// The vcpu may leave its startup exit.
    Started,
    /// The vcpu handles exits.
    Running,
    /// The vcpu waits in [`Vcpu::block`].
    Blocked,
    /// The vcpu is switched off for good.
    Off,
}

/// Static configuration of a vcpu.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VcpuConfig {
    /// Map a single page per memory fault instead of the whole region.
    pub map_small: bool,
    /// Let the guest exit on RDTSC.
    pub rdtsc_exit: bool,
}

/// The constant part of [`Vcpu`].
struct VcpuInnerConst {
    /// The id of the vcpu.
    id: usize,
    /// Hardware-virtualization flavor, selects the exit-reason numbering.
    flavor: VirtFlavor,
    config: VcpuConfig,
}

/// The mutable part of [`Vcpu`].
struct VcpuInnerMut {
    state: VcpuRunState,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Skip {
    Yes,
    No,
}

/// One virtual CPU of the VM.
///
/// The kernel calls [`ExitHandler::handle_exit`] on the vcpu's own execution
/// context for every VM exit. [`Vcpu::unblock`], [`Vcpu::recall`] and
/// [`Vcpu::off`] may be called from any other context.
pub struct Vcpu {
    inner_const: VcpuInnerConst,
    inner_mut: Mutex<VcpuInnerMut>,
    /// Mirrors `CpuState::cpuid`, readable while an exit is in progress.
    cpu_id: AtomicU32,
    cpu: Mutex<CpuState>,
    executor: Mutex<Box<dyn CpuExecutor>>,
    vm: Arc<dyn VmSession>,
    guest_memory: Arc<Mutex<GuestMemory>>,
    bus: Arc<dyn DeviceBus>,
    started: Gate,
    blocked: Gate,
}

impl Vcpu {
    /// Create a new [`Vcpu`]. Exits are dispatched to `executor`.
    pub fn new(
        id: usize,
        flavor: VirtFlavor,
        config: VcpuConfig,
        vm: Arc<dyn VmSession>,
        guest_memory: Arc<Mutex<GuestMemory>>,
        bus: Arc<dyn DeviceBus>,
        executor: Box<dyn CpuExecutor>,
    ) -> Self {
        Self {
            inner_const: VcpuInnerConst { id, flavor, config },
            inner_mut: Mutex::new(VcpuInnerMut {
                state: VcpuRunState::Created,
            }),
            cpu_id: AtomicU32::new(id as u32),
            cpu: Mutex::new(CpuState::new(id as u32)),
            executor: Mutex::new(executor),
            vm,
            guest_memory,
            bus,
            started: Gate::new(),
            blocked: Gate::new(),
        }
    }

    /// Get the id of the vcpu.
    pub const fn id(&self) -> usize {
        self.inner_const.id
    }

    pub const fn flavor(&self) -> VirtFlavor {
        self.inner_const.flavor
    }

    /// Get the state of the vcpu.
    pub fn state(&self) -> VcpuRunState {
        self.inner_mut.lock().state
    }

    /// The CPU id reported by the dense state, [`CPUID_OFF`] once off.
    pub fn cpu_id(&self) -> u32 {
        self.cpu_id.load(Ordering::Acquire)
    }

    pub fn is_off(&self) -> bool {
        self.cpu_id() == CPUID_OFF
    }

    /// A copy of the dense CPU state as left by the last exit.
    pub fn cpu_state(&self) -> CpuState {
        self.lock_cpu().clone()
    }

    /// Locks the dense state with its cpu id in sync with [`Vcpu::cpu_id`].
    fn lock_cpu(&self) -> MutexGuard<'_, CpuState> {
        let mut cpu = self.cpu.lock();
        cpu.cpuid = self.cpu_id();
        cpu
    }

    /// Execute a block with the state of the vcpu transitioned from `from` to `to`. If the current state is not `from`, return an error.
    ///
    /// The state is left untouched if the block fails.
    pub fn with_state_transition<F, T>(&self, from: VcpuRunState, to: VcpuRunState, f: F) -> AxResult<T>
    where
        F: FnOnce() -> AxResult<T>,
    {
        let mut inner_mut = self.inner_mut.lock();
        if inner_mut.state != from {
            ax_err!(
                BadState,
                format!("vcpu {} state is not {:?}, but {:?}", self.id(), from, inner_mut.state)
            )
        } else {
            let result = f();
            if result.is_ok() {
                inner_mut.state = to;
            }
            result
        }
    }

    /// Transition the state of the vcpu. If the current state is not `from`, return an error.
    pub fn transition_state(&self, from: VcpuRunState, to: VcpuRunState) -> AxResult {
        self.with_state_transition(from, to, || Ok(()))
    }

    /// Lets the startup exit of the vcpu proceed.
    pub fn start(&self) -> AxResult {
        self.with_state_transition(VcpuRunState::Created, VcpuRunState::Started, || {
            self.started.release();
            Ok(())
        })
    }

    /// Waits until [`Vcpu::unblock`] is called, or returns at once if an
    /// unblock is already pending.
    pub fn block(&self) {
        let previous = {
            let mut inner_mut = self.inner_mut.lock();
            if inner_mut.state == VcpuRunState::Off {
                return;
            }
            core::mem::replace(&mut inner_mut.state, VcpuRunState::Blocked)
        };

        self.blocked.wait();

        let mut inner_mut = self.inner_mut.lock();
        if inner_mut.state == VcpuRunState::Blocked {
            inner_mut.state = previous;
        }
    }

    pub fn unblock(&self) {
        self.blocked.release();
    }

    /// Forces the vcpu out of guest mode.
    pub fn recall(&self) {
        self.vm.recall(self.id());
    }

    /// Switches the vcpu off. Its next exit is not resumed and any context
    /// waiting on one of its gates returns.
    pub fn off(&self) {
        info!("vcpu {} off", self.id());
        self.cpu_id.store(CPUID_OFF, Ordering::Release);
        // held by an exit in progress, lock_cpu catches up
        if let Some(mut cpu) = self.cpu.try_lock() {
            cpu.cpuid = CPUID_OFF;
        }
        self.inner_mut.lock().state = VcpuRunState::Off;
        self.recall();
        self.started.release();
        self.blocked.release();
    }

    fn wait_for_start(&self) -> AxResult {
        self.started.wait();
        if self.is_off() {
            return ax_err!(BadState, format!("vcpu {} switched off before start", self.id()));
        }
        self.transition_state(VcpuRunState::Started, VcpuRunState::Running)
    }

    fn dispatch(&self, exit: ExitReason, state: &mut VcpuState) -> AxResult {
        match exit {
            ExitReason::Svm(exit) => self.handle_svm(exit, state),
            ExitReason::Vmx(exit) => self.handle_vmx(exit, state),
        }
    }

    fn rdtsc_ctrl(&self, bit: u32) -> u32 {
        if self.inner_const.config.rdtsc_exit {
            bit
        } else {
            0
        }
    }

    fn handle_svm(&self, exit: SvmExit, state: &mut VcpuState) -> AxResult {
        match exit {
            SvmExit::Cr(_) => self.handle_vcpu(state, Skip::No, CpuMessageType::SingleStep),
            SvmExit::Smi | SvmExit::Vintr | SvmExit::Recall => {
                self.handle_vcpu(state, Skip::No, CpuMessageType::CheckIrq)
            }
            SvmExit::Rdtsc => {
                state.ip_len.charge(2);
                self.handle_vcpu(state, Skip::Yes, CpuMessageType::Rdtsc)
            }
            SvmExit::Cpuid => {
                state.ip_len.charge(2);
                self.handle_vcpu(state, Skip::Yes, CpuMessageType::Cpuid)
            }
            SvmExit::Hlt => {
                state.ip_len.charge(1);
                self.handle_vcpu(state, Skip::Yes, CpuMessageType::Hlt)
            }
            SvmExit::Ioio => self.svm_ioio(state),
            SvmExit::Msr | SvmExit::Invalid => self.svm_invalid(state),
            SvmExit::Shutdown => self.handle_vcpu(state, Skip::No, CpuMessageType::Triple),
            SvmExit::Npt => {
                let need_unmap = state.qual_primary.value() & 1 != 0;
                if !self.handle_map_memory(state, need_unmap)? {
                    self.svm_invalid(state)?;
                }
                Ok(())
            }
            SvmExit::Startup => {
                self.wait_for_start()?;
                self.handle_vcpu(state, Skip::No, CpuMessageType::CheckIrq)?;
                state.ctrl_primary.charge(self.rdtsc_ctrl(SVM_CTRL_RDTSC));
                Ok(())
            }
        }
    }

    fn handle_vmx(&self, exit: VmxExit, state: &mut VcpuState) -> AxResult {
        match exit {
            VmxExit::TripleFault => self.handle_vcpu(state, Skip::No, CpuMessageType::Triple),
            VmxExit::Init => self.handle_vcpu(state, Skip::No, CpuMessageType::Init),
            VmxExit::IrqWindow | VmxExit::Recall => {
                self.handle_vcpu(state, Skip::No, CpuMessageType::CheckIrq)
            }
            VmxExit::Cpuid => self.handle_vcpu(state, Skip::Yes, CpuMessageType::Cpuid),
            VmxExit::Hlt => self.handle_vcpu(state, Skip::Yes, CpuMessageType::Hlt),
            VmxExit::Rdtsc => self.handle_vcpu(state, Skip::Yes, CpuMessageType::Rdtsc),
            VmxExit::MsrRead => self.handle_vcpu(state, Skip::Yes, CpuMessageType::Rdmsr),
            VmxExit::MsrWrite => self.handle_vcpu(state, Skip::Yes, CpuMessageType::Wrmsr),
            VmxExit::Vmcall => {
                state.discharge();
                state
                    .ip
                    .charge(state.ip.value().wrapping_add(state.ip_len.value()));
                Ok(())
            }
            VmxExit::MovCr => self.handle_vcpu(state, Skip::No, CpuMessageType::SingleStep),
            VmxExit::Ioio => self.vmx_ioio(state),
            VmxExit::Invalid => {
                state.flags.charge(state.flags.value() | RFLAGS_RESERVED);
                self.handle_vcpu(state, Skip::No, CpuMessageType::SingleStep)
            }
            VmxExit::Pause => self.vmx_pause(state),
            VmxExit::Ept => {
                let need_unmap = state.qual_primary.value() & 0x38 != 0;
                if !self.handle_map_memory(state, need_unmap)? {
                    // an access to MMIO
                    self.handle_vcpu(state, Skip::No, CpuMessageType::SingleStep)?;
                }
                Ok(())
            }
            VmxExit::Startup => {
                self.wait_for_start()?;
                self.handle_vcpu(state, Skip::No, CpuMessageType::Hlt)?;
                state.ctrl_primary.charge(self.rdtsc_ctrl(VMX_CTRL_RDTSC));
                state.ctrl_secondary.charge(0);
                Ok(())
            }
        }
    }

    fn svm_invalid(&self, state: &mut VcpuState) -> AxResult {
        self.handle_vcpu(state, Skip::No, CpuMessageType::SingleStep)?;
        state
            .ctrl_primary
            .charge(SVM_CTRL_CPUID | self.rdtsc_ctrl(SVM_CTRL_RDTSC));
        state.ctrl_secondary.charge(SVM_CTRL_VMRUN);
        Ok(())
    }

    fn svm_ioio(&self, state: &mut VcpuState) -> AxResult {
        let qual = state.qual_primary.value();
        if qual & 0x4 != 0 {
            info!("vcpu {}: invalid guest state, string I/O", self.id());
            state.discharge();
            state.ctrl_secondary.charge(0);
            return Ok(());
        }

        // one-hot operand size in bits 4..=6
        let order = (((qual >> 4) & 7) as u32).wrapping_sub(1).min(2);
        state
            .ip_len
            .charge(state.qual_secondary.value().wrapping_sub(state.ip.value()));

        self.handle_io(state, qual & 1 != 0, order, (qual >> 16) as u16)
    }

    fn vmx_ioio(&self, state: &mut VcpuState) -> AxResult {
        let qual = state.qual_primary.value();
        if qual & 0x10 != 0 {
            info!("vcpu {}: invalid guest state, string I/O", self.id());
            if !state.flags.charged() {
                return ax_err!(BadState, "string I/O exit without RFLAGS");
            }
            // clearing the reserved flag makes the next entry fail, the
            // instruction is then emulated on the invalid-state exit
            let flags = state.flags.value();
            state.discharge();
            state.flags.charge(flags & !RFLAGS_RESERVED);
            return Ok(());
        }

        // 0 is 8 bit, 1 is 16 bit, 3 is 32 bit
        let order = ((qual & 7) as u32).min(2);
        self.handle_io(state, qual & 8 != 0, order, (qual >> 16) as u16)
    }

    fn vmx_pause(&self, state: &mut VcpuState) -> AxResult {
        let mut cpu = self.lock_cpu();
        let mtd = read_vcpu_state(state, &mut cpu);

        let mut msg = CpuMessage::new(CpuMessageType::SingleStep, &mut cpu, mtd);
        skip_instruction(&mut msg)?;
        let mtr_out = msg.mtr_out;

        write_vcpu_state(&cpu, mtr_out, state);
        Ok(())
    }

    fn execute(&self, executor: &mut dyn CpuExecutor, msg: &mut CpuMessage<'_>) -> AxResult {
        if executor.execute(msg) {
            Ok(())
        } else {
            ax_err!(
                BadState,
                format!(
                    "vcpu {}: nobody to execute {:?} at {:#x}:{:#x}",
                    self.id(),
                    msg.ty,
                    msg.cpu.cs.sel,
                    msg.cpu.eip()
                )
            )
        }
    }

    /// Runs one exit through the executor: decode, optionally skip the
    /// instruction, send `ty`, recheck pending interrupts and encode what
    /// the executor changed.
    fn handle_vcpu(&self, state: &mut VcpuState, skip: Skip, ty: CpuMessageType) -> AxResult {
        let mut cpu = self.lock_cpu();
        let mtd = read_vcpu_state(state, &mut cpu);

        let mut msg = CpuMessage::new(ty, &mut cpu, mtd);
        if skip == Skip::Yes {
            skip_instruction(&mut msg)?;
        }

        let mut executor = self.executor.lock();
        self.execute(&mut **executor, &mut msg)?;

        if msg.mtr_in.contains(Mask::INJ) && msg.ty != CpuMessageType::CheckIrq {
            msg.ty = CpuMessageType::CheckIrq;
            self.execute(&mut **executor, &mut msg)?;
        }

        // an injection was set up, the interrupt window has to follow it
        if msg.mtr_out.contains(Mask::INJ) {
            msg.ty = CpuMessageType::CalcIrqWindow;
            self.execute(&mut **executor, &mut msg)?;
        }
        drop(executor);

        let mtr_out = msg.mtr_out;
        let unexpected = mtr_out - mtd;
        if !unexpected.is_empty() {
            error!(
                "mtd issue !? exit={:#x} {:#x}->{:#x} {:#x}",
                state.exit_reason,
                mtd.bits(),
                mtr_out.bits(),
                unexpected.bits()
            );
            dump(unexpected, state, msg.cpu);
        }

        write_vcpu_state(&cpu, mtr_out, state);
        Ok(())
    }

    fn handle_io(&self, state: &mut VcpuState, is_in: bool, order: u32, port: u16) -> AxResult {
        trace!(
            "vcpu {}: I/O is_in={} order={} port={:#x}",
            self.id(),
            is_in,
            order,
            port
        );

        let mut cpu = self.lock_cpu();
        let mtd = read_vcpu_state(state, &mut cpu);
        let ax = state.ax.value();

        let mut msg = CpuMessage::io(is_in, &mut cpu, order, port, ax, mtd);
        skip_instruction(&mut msg)?;

        let mut executor = self.executor.lock();
        self.execute(&mut **executor, &mut msg)?;
        drop(executor);

        if let Some(io) = msg.io {
            if io.value != msg.cpu.rax {
                msg.cpu.rax = io.value;
                msg.mtr_out |= Mask::GPR_ACDB;
            }
        }

        let mtr_out = msg.mtr_out;
        write_vcpu_state(&cpu, mtr_out, state);
        Ok(())
    }

    /// Resolves a nested page fault at `qual_secondary`.
    ///
    /// Returns `Ok(false)` if no device model backs the faulting page with
    /// memory, the access then has to be emulated.
    fn handle_map_memory(&self, state: &mut VcpuState, need_unmap: bool) -> AxResult<bool> {
        let fault = state.qual_secondary.value();
        trace!("vcpu {}: request mapping at {:#x}", self.id(), fault);

        if need_unmap {
            info!(
                "vcpu {}: need_unmap handled {:#x} cr0={:#x}",
                self.id(),
                fault,
                state.cr0.value()
            );
            self.guest_memory
                .lock()
                .detach(GuestPhysAddr::from(align_down_4k(fault as usize)), PAGE_SIZE_4K);
        }

        let region = match self.bus.mem_region(fault >> PAGE_SHIFT, state.cr0.value()) {
            Some(region) if region.ptr.is_some() => region,
            _ => return Ok(false),
        };

        trace!(
            "vcpu {}: VM page {:#x} in [{:#x}:{:#x}) {}",
            self.id(),
            region.page,
            region.start_page,
            region.start_page + region.count,
            if region.read_only { "readonly" } else { "writeable" }
        );

        if !state.inj_info.charged() {
            return ax_err!(BadState, "memory fault without injection state");
        }

        if state.inj_info.value() & INJ_VALID != 0 {
            let mut cpu = self.lock_cpu();
            let mtd = read_vcpu_state(state, &mut cpu);
            if !mtd.contains(Mask::INJ) {
                return ax_err!(BadState, "IDT vectoring without injection state");
            }

            info!("vcpu {}: EPT violation during IDT vectoring", self.id());

            let mut win = CpuMessage::new(CpuMessageType::CalcIrqWindow, &mut cpu, mtd);
            win.mtr_out = Mask::INJ;
            let mut executor = self.executor.lock();
            self.execute(&mut **executor, &mut win)?;
            drop(executor);

            let mtr_out = win.mtr_out;
            write_vcpu_state(&cpu, mtr_out, state);
            // the pending vector stays valid, no discharge here
        } else {
            state.discharge();
        }

        let writable = !region.read_only;
        let guest_memory = self.guest_memory.lock();
        if self.inner_const.config.map_small {
            guest_memory.attach_to_vm(
                GuestPhysAddr::from((region.page << PAGE_SHIFT) as usize),
                PAGE_SIZE_4K,
                writable,
            )?;
        } else {
            guest_memory.attach_to_vm(
                GuestPhysAddr::from((region.start_page << PAGE_SHIFT) as usize),
                (region.count << PAGE_SHIFT) as usize,
                writable,
            )?;
        }

        Ok(true)
    }
}

/// Advances the instruction pointer past the emulated instruction and lifts
/// STI / MOV SS blocking.
fn skip_instruction(msg: &mut CpuMessage<'_>) -> AxResult {
    if !msg.mtr_in.contains(Mask::RIP_LEN) {
        return ax_err!(BadState, "instruction skip without RIP_LEN");
    }
    msg.cpu.rip = msg.cpu.rip.wrapping_add(msg.cpu.inst_len);
    msg.mtr_out |= Mask::RIP_LEN;

    if !msg.mtr_in.contains(Mask::STATE) {
        return ax_err!(BadState, "instruction skip without STATE");
    }
    if msg.cpu.intr_state & INTR_STATE_BLOCKING != 0 {
        msg.cpu.intr_state &= !INTR_STATE_BLOCKING;
        msg.mtr_out |= Mask::STATE;
    }
    Ok(())
}

impl ExitHandler for Vcpu {
    fn handle_exit(&self, state: &mut VcpuState) -> bool {
        if self.is_off() {
            return false;
        }

        let exit_reason = state.exit_reason;
        let Some(exit) = ExitReason::decode(self.flavor(), exit_reason) else {
            error!("vcpu {}: unknown exit={:#x}", self.id(), exit_reason);
            return false;
        };

        trace!("vcpu {}: {:?}", self.id(), exit);
        match self.dispatch(exit, state) {
            Ok(()) => !self.is_off(),
            Err(err) => {
                error!(
                    "vcpu {}: {:?} (exit={:#x}) failed: {:?}",
                    self.id(),
                    exit,
                    exit_reason,
                    err
                );
                false
            }
        }
    }

    fn exit_config(&self, exit: u32, state: &mut VcpuState) {
        let mask = ExitReason::decode(self.flavor(), exit).map_or(Mask::empty(), ExitReason::mask);
        write_vcpu_state(&CpuState::default(), mask, state);
    }
}
