//! Contracts of the device-model bus.
//!
//! The VMM core is one participant of the bus: it sends [`CpuMessage`]s to the
//! per-vCPU executor, queries memory regions and reports timeouts, and it
//! serves [`HostOp`] and [`TimerOp`] requests issued by the device models.

use axerrno::AxResult;

use crate::cpu_state::CpuState;
use crate::hal::{GuestPhysAddr, HostVirtAddr};
use crate::mask::Mask;

/// What the executor is asked to emulate.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CpuMessageType {
    Cpuid,
    Rdtsc,
    Rdmsr,
    Wrmsr,
    IoIn,
    IoOut,
    Triple,
    Init,
    Hlt,
    /// Deliver a pending interrupt if the guest can take it.
    CheckIrq,
    /// Recompute whether the next entry needs an interrupt window.
    CalcIrqWindow,
    SingleStep,
}

/// Port I/O operand of an [`CpuMessageType::IoIn`]/[`CpuMessageType::IoOut`]
/// message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IoAccess {
    pub port: u16,
    /// log2 of the operand size in bytes, at most 2.
    pub order: u32,
    /// Value of rax on entry, the value read on return of an `IoIn`.
    pub value: u64,
}

/// A semantic CPU operation handed to the device model's executor.
///
/// `mtr_in` names the groups of `cpu` that hold current guest content,
/// the executor adds every group it modified to `mtr_out`.
#[derive(Debug)]
pub struct CpuMessage<'a> {
    pub ty: CpuMessageType,
    pub cpu: &'a mut CpuState,
    pub mtr_in: Mask,
    pub mtr_out: Mask,
    pub io: Option<IoAccess>,
}

impl<'a> CpuMessage<'a> {
    pub fn new(ty: CpuMessageType, cpu: &'a mut CpuState, mtr_in: Mask) -> Self {
        Self {
            ty,
            cpu,
            mtr_in,
            mtr_out: Mask::empty(),
            io: None,
        }
    }

    pub fn io(is_in: bool, cpu: &'a mut CpuState, order: u32, port: u16, value: u64, mtr_in: Mask) -> Self {
        let ty = if is_in {
            CpuMessageType::IoIn
        } else {
            CpuMessageType::IoOut
        };
        Self {
            ty,
            cpu,
            mtr_in,
            mtr_out: Mask::empty(),
            io: Some(IoAccess { port, order, value }),
        }
    }
}

/// The device model's per-vCPU instruction executor.
pub trait CpuExecutor: Send {
    /// Emulates `msg`. Returns `false` if no device model took the message.
    fn execute(&mut self, msg: &mut CpuMessage<'_>) -> bool;
}

/// Answer to a memory-region query: the guest pages `[start_page,
/// start_page + count)` containing `page` are backed by VMM-local memory at
/// `ptr`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemRegion {
    pub page: u64,
    pub start_page: u64,
    pub count: u64,
    pub ptr: Option<HostVirtAddr>,
    pub read_only: bool,
}

/// Console notifications raised on vCPU activity edges.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConsoleEvent {
    /// All vCPUs went idle.
    Pause,
    /// The first vCPU became active again.
    Resume,
}

/// The parts of the device-model bus the VMM core sends to.
pub trait DeviceBus: Send + Sync {
    /// Looks up the memory region owning guest page `page`.
    fn mem_region(&self, page: u64, cr0: u64) -> Option<MemRegion>;

    /// Timeout slot `nr` expired at `deadline`.
    fn timeout(&self, nr: usize, deadline: u64);

    fn console(&self, event: ConsoleEvent);

    /// Resets every device model before the first vCPU runs.
    fn legacy_reset(&self, cpuid_native: bool);
}

/// A network session opened on behalf of a network device model.
pub trait NetworkSession: Send {
    fn mac_address(&self) -> [u8; 6];

    fn transmit(&mut self, packet: &[u8]) -> bool;
}

/// Session-backed collaborators of the VMM.
pub trait HostServices: Send + Sync {
    /// Copies the data of boot module `index` to `dst`, returning its length.
    /// Zero marks the end of the module list.
    fn module_data(&self, index: usize, dst: &mut [u8]) -> AxResult<usize>;

    /// Copies the command line of boot module `index` to `dst`, returning
    /// its length.
    fn module_cmdline(&self, index: usize, dst: &mut [u8]) -> usize;

    fn open_network(&self) -> AxResult<Box<dyn NetworkSession>>;

    /// Wall-clock seconds since the epoch, `None` without a real-time clock.
    fn rtc_time(&self) -> Option<u64>;

    /// Terminates the VMM process.
    fn exit(&self, code: i32);
}

/// Host operations requested by device models.
pub enum HostOp<'a> {
    /// Allocate `len` bytes and register them at `guest_addr`.
    AllocIoMem { guest_addr: GuestPhysAddr, len: usize },
    /// Allocate `len` bytes, register only the first `len_short` of them.
    AllocIoMemSmall {
        guest_addr: GuestPhysAddr,
        len: usize,
        len_short: usize,
    },
    /// Query the locally mapped guest RAM starting at `offset`.
    GuestMem { offset: usize },
    /// Carve `size` bytes of guest-physical space out of the IO hole.
    ReserveIoRange { size: usize },
    DetachMem { guest_addr: GuestPhysAddr, len: usize },
    VcpuCreateBackend { executor: Box<dyn CpuExecutor> },
    /// Wake vCPU `id`: unblock it, or just recall it from guest mode.
    VcpuRelease { id: usize, unblock: bool },
    VcpuBlock { id: usize },
    /// Load boot module `module` (counting from 1) into `dst`.
    GetModule { module: usize, dst: &'a mut [u8] },
    GetMac,
    VmOff,
}

/// Successful answers to a [`HostOp`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HostOpReply {
    Done,
    /// The operation was refused, the device model may try otherwise.
    Declined,
    Memory { ptr: HostVirtAddr, len: usize },
    IoRange(GuestPhysAddr),
    Vcpu(usize),
    Module {
        size: usize,
        cmdline_offset: usize,
        cmdline_len: usize,
    },
    Mac(u64),
    PoweredOff,
}

/// Timer requests of device models.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimerOp {
    New,
    /// Program slot `nr` to expire at absolute clock time `abstime`.
    Request { nr: usize, abstime: u64 },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimerReply {
    Allocated(usize),
    Done,
}

/// Answer to a time query. Both values count in [`TimeReply::FREQUENCY`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TimeReply {
    pub wallclock: u64,
    pub timestamp: u64,
}

impl TimeReply {
    pub const FREQUENCY: u64 = 1_000_000;
}
