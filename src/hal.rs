use std::sync::Arc;

use axerrno::AxResult;
use memory_addr::{PhysAddr, VirtAddr};

use crate::vcpu_state::VcpuState;

/// Guest-physical address, as seen by the virtual machine.
pub type GuestPhysAddr = PhysAddr;
/// Host-local virtual address inside the VMM's own address space.
pub type HostVirtAddr = VirtAddr;

/// A host-backed memory object (RAM dataspace) handed out by the kernel.
///
/// The `cap` is an opaque capability handle, the `size` the number of bytes
/// backing it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Dataspace {
    pub cap: usize,
    pub size: usize,
}

/// Access rights and window for one second-level translation attachment.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AttachAttr {
    /// Offset into the dataspace.
    pub offset: usize,
    /// Number of bytes to attach.
    pub size: usize,
    pub executable: bool,
    pub writable: bool,
}

/// Hardware-virtualization extensions reported by the platform.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct VirtFeatures {
    pub svm: bool,
    pub vmx: bool,
}

/// The kernel's VM session: second-level address translation and vCPU
/// execution contexts.
pub trait VmSession: Send + Sync {
    /// Virtualization extensions available on this machine.
    fn features(&self) -> VirtFeatures;

    /// Attaches `attr.size` bytes of `ds` (starting at `attr.offset`) at
    /// `guest_addr` in the VM's second-level translation.
    fn attach(&self, ds: &Dataspace, guest_addr: GuestPhysAddr, attr: AttachAttr) -> AxResult;

    /// Removes `[guest_addr, guest_addr + size)` from the second-level
    /// translation. Backing memory is left untouched.
    fn detach(&self, guest_addr: GuestPhysAddr, size: usize);

    /// Creates the kernel vCPU `id` on host CPU `affinity`; every VM exit of
    /// it is delivered to `handler` on a dedicated execution context.
    fn create_vcpu(&self, id: usize, affinity: usize, handler: Arc<dyn ExitHandler>) -> AxResult;

    /// Forces vCPU `id` out of guest mode, producing a recall exit.
    fn recall(&self, id: usize);
}

/// Host RAM allocation and the VMM's local region map.
pub trait HostMemory: Send + Sync {
    /// Allocates a RAM dataspace of `size` bytes. May fail when the quota is
    /// exhausted, in which case callers usually retry with a smaller size.
    fn alloc(&self, size: usize) -> AxResult<Dataspace>;

    /// Reserves a contiguous, unpopulated window of `size` bytes in the local
    /// address space.
    fn reserve(&self, size: usize) -> AxResult<HostVirtAddr>;

    /// Maps `ds` at `local_addr` inside a previously reserved window.
    fn attach_at(&self, ds: &Dataspace, local_addr: HostVirtAddr) -> AxResult;

    /// Maps `ds` anywhere in the local address space.
    fn attach(&self, ds: &Dataspace) -> AxResult<HostVirtAddr>;
}

/// The single one-shot host timer backing all virtual timeouts.
pub trait HostTimer: Send + Sync {
    /// Arms the timer to fire once after `us` microseconds, replacing any
    /// earlier programming.
    fn trigger_once(&self, us: u64) -> AxResult;
}

/// The VMM's monotonic clock, counting in ticks of [`Clock::frequency`] Hz.
pub trait Clock: Send + Sync {
    /// Current time in ticks.
    fn now(&self) -> u64;

    /// Ticks per second.
    fn frequency(&self) -> u64;

    /// Time from now until `abstime`, converted to units of `1 / freq` seconds.
    /// Returns zero for deadlines already in the past.
    fn delta(&self, abstime: u64, freq: u64) -> u64 {
        let now = self.now();
        if abstime <= now {
            return 0;
        }
        ((abstime - now) as u128 * freq as u128 / self.frequency().max(1) as u128) as u64
    }

    /// Current time in units of `1 / freq` seconds.
    fn time_in(&self, freq: u64) -> u64 {
        (self.now() as u128 * freq as u128 / self.frequency().max(1) as u128) as u64
    }

    /// Absolute time `delta` units of `1 / freq` seconds from now.
    fn abstime(&self, delta: u64, freq: u64) -> u64 {
        let ticks = delta as u128 * self.frequency() as u128 / freq.max(1) as u128;
        self.now().saturating_add(ticks as u64)
    }
}

/// Callback interface the kernel invokes on a vCPU's execution context.
pub trait ExitHandler: Send + Sync {
    /// Handles one VM exit. `state` carries the charged register groups of
    /// the exit on entry and the groups to write back on return.
    ///
    /// Returns whether the vCPU shall be resumed.
    fn handle_exit(&self, state: &mut VcpuState) -> bool;

    /// Pre-charges `state` with the register groups the kernel must transfer
    /// on exit `exit`.
    fn exit_config(&self, exit: u32, state: &mut VcpuState);
}
