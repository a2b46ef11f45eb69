use std::collections::BTreeMap;
use std::sync::Arc;

use axerrno::{ax_err, AxResult};
use memory_addr::{align_down_4k, is_aligned_4k, PAGE_SIZE_4K};

use crate::hal::{AttachAttr, Dataspace, GuestPhysAddr, HostMemory, HostVirtAddr, VmSession};

/// First guest-physical byte of the IO-memory hole.
pub const IO_MEM_BASE: usize = 3 << 30;
/// Size of the IO-memory hole.
pub const IO_MEM_SIZE: usize = 1 << 30;

const PAGE_SIZE_1G: usize = 1 << 30;
const PAGE_SIZE_4M: usize = 1 << 22;

/// A host-backed window of the guest-physical address space.
#[derive(Debug)]
struct Region {
    guest_addr: usize,
    local_addr: HostVirtAddr,
    ds: Dataspace,
    size: usize,
    /// Insertion order, used for diagnostics only.
    seq: usize,
}

impl Region {
    fn end(&self) -> usize {
        self.guest_addr + self.size
    }

    fn contains(&self, addr: usize) -> bool {
        self.guest_addr <= addr && addr < self.end()
    }

    fn overlaps(&self, addr: usize, end: usize) -> bool {
        addr < self.end() && self.guest_addr < end
    }
}

/// The guest-physical address space of a VM.
///
/// Guest RAM is a set of host dataspaces mapped back to back into one local
/// window, so that the VMM-local address of guest RAM byte `g` is
/// `backing_store_local_base() + g`. Device models add further regions
/// (MMIO windows, framebuffers) at runtime. The kernel's second-level
/// translation is populated lazily through [`GuestMemory::attach_to_vm`].
pub struct GuestMemory {
    vm: Arc<dyn VmSession>,
    guest_size: usize,
    io_mem_alloc: usize,
    io_mem_gap: bool,
    local_base: HostVirtAddr,
    regions: BTreeMap<usize, Region>,
    next_seq: usize,
    verbose: bool,
}

impl GuestMemory {
    /// Allocates `guest_size` bytes of guest RAM from `host` and maps it into
    /// a fresh local window.
    ///
    /// Chunks are at most 1 GiB. A denied allocation is retried at half the
    /// size, down to a single page. RAM that would fall into the IO hole is
    /// moved above it.
    pub fn new(
        vm: Arc<dyn VmSession>,
        host: &dyn HostMemory,
        guest_size: usize,
        verbose: bool,
    ) -> AxResult<Self> {
        let mut mem = Self {
            vm,
            guest_size,
            io_mem_alloc: IO_MEM_BASE,
            io_mem_gap: false,
            local_base: HostVirtAddr::from(0),
            regions: BTreeMap::new(),
            next_seq: 0,
            verbose,
        };

        let mut max_offset = guest_size;
        let mut offset = 0;
        let mut ds_size = guest_size.min(PAGE_SIZE_1G);

        while offset < max_offset {
            if offset < IO_MEM_BASE + IO_MEM_SIZE {
                if offset >= IO_MEM_BASE {
                    offset = IO_MEM_BASE + IO_MEM_SIZE;
                    mem.io_mem_gap = true;
                    max_offset += IO_MEM_SIZE;
                    continue;
                }
                if offset + ds_size > IO_MEM_BASE {
                    ds_size = IO_MEM_BASE - offset;
                }
            }

            match host.alloc(ds_size) {
                Ok(ds) => {
                    mem.add_region(offset, HostVirtAddr::from(0), ds, ds_size)?;
                    offset += ds_size;
                    ds_size = (max_offset - offset).min(PAGE_SIZE_1G);
                }
                Err(err) => {
                    if verbose {
                        debug!("reduce ds_size {:#x}->{:#x} ({:?})", ds_size, ds_size >> 1, err);
                    }

                    ds_size >>= 1;
                    if ds_size > PAGE_SIZE_1G {
                        ds_size &= !(PAGE_SIZE_1G - 1);
                    } else if ds_size > PAGE_SIZE_4M {
                        ds_size &= !(PAGE_SIZE_4M - 1);
                    } else {
                        ds_size = align_down_4k(ds_size);
                    }

                    if ds_size < PAGE_SIZE_4K {
                        return ax_err!(
                            NoMemory,
                            format!("guest memory allocation failed at offset {:#x}", offset)
                        );
                    }
                }
            }
        }

        mem.local_base = host.reserve(mem.backing_store_size())?;
        for region in mem.regions.values_mut() {
            region.local_addr = mem.local_base + region.guest_addr;
            host.attach_at(&region.ds, region.local_addr)?;
        }

        info!(
            "guest memory: {:#x} bytes in {} chunks at {:#x}",
            guest_size,
            mem.regions.len(),
            mem.local_base.as_usize()
        );
        Ok(mem)
    }

    /// VMM-local address of guest-physical address zero.
    pub fn backing_store_local_base(&self) -> HostVirtAddr {
        self.local_base
    }

    /// Size of the local window, guest RAM plus the IO hole if RAM extends
    /// beyond it.
    pub fn backing_store_size(&self) -> usize {
        self.guest_size + if self.io_mem_gap { IO_MEM_SIZE } else { 0 }
    }

    /// Whether guest RAM was split around the IO hole.
    pub fn has_io_mem_gap(&self) -> bool {
        self.io_mem_gap
    }

    pub fn region_count(&self) -> usize {
        self.regions.len()
    }

    /// Registers `size` bytes of `ds`, mapped locally at `local_addr`, as the
    /// backing of guest-physical `[guest_addr, guest_addr + size)`.
    ///
    /// Returns `Ok(false)` for an empty region. A region overlapping an
    /// existing one or wrapping around the address space is an error.
    pub fn add_region(
        &mut self,
        guest_addr: usize,
        local_addr: HostVirtAddr,
        ds: Dataspace,
        size: usize,
    ) -> AxResult<bool> {
        if size == 0 {
            return Ok(false);
        }
        let Some(end) = guest_addr.checked_add(size) else {
            return ax_err!(
                InvalidInput,
                format!("guest region {:#x}+{:#x} wraps around", guest_addr, size)
            );
        };

        let mut conflicts: Vec<&Region> = self
            .regions
            .values()
            .filter(|region| region.overlaps(guest_addr, end))
            .collect();
        if !conflicts.is_empty() {
            conflicts.sort_by_key(|region| region.seq);
            for region in &conflicts {
                warn!(
                    "overlapping region added: {:#x}+{:#x} conflicts with {:#x}+{:#x}",
                    guest_addr, size, region.guest_addr, region.size
                );
            }
            return ax_err!(
                AlreadyExists,
                format!("guest region {:#x}+{:#x} overlaps", guest_addr, size)
            );
        }

        if self.verbose {
            debug!("guest_memory: add_region {:#x}+{:#x}", guest_addr, size);
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        self.regions.insert(
            guest_addr,
            Region {
                guest_addr,
                local_addr,
                ds,
                size,
                seq,
            },
        );
        Ok(true)
    }

    fn region_containing(&self, addr: usize) -> Option<&Region> {
        self.regions
            .range(..=addr)
            .next_back()
            .map(|(_, region)| region)
            .filter(|region| region.contains(addr))
    }

    /// Logs every region in the order it was added.
    pub fn dump_regions(&self) {
        let mut regions: Vec<&Region> = self.regions.values().collect();
        regions.sort_by_key(|region| region.seq);
        for region in regions {
            info!(
                "- vmm: [{:#x}, {:#x}) - vm: [{:#x}, {:#x}) - {}+{}",
                region.local_addr.as_usize(),
                region.local_addr.as_usize() + region.size,
                region.guest_addr,
                region.end(),
                region.guest_addr,
                region.size
            );
        }
    }

    /// Maps guest-physical `[guest_addr, guest_addr + size)` into the VM,
    /// splitting the range at region boundaries.
    ///
    /// Returns the number of bytes attached. A range not fully covered by
    /// regions is attached up to the first uncovered byte; `size` must be a
    /// multiple of the page size, otherwise nothing is attached.
    pub fn attach_to_vm(&self, guest_addr: GuestPhysAddr, size: usize, writable: bool) -> AxResult<usize> {
        let mut g_phys = guest_addr.as_usize();
        let mut left = size;

        if is_aligned_4k(size) {
            while left > 0 {
                let Some(region) = self.region_containing(g_phys) else {
                    break;
                };

                let ds_offset = g_phys - region.guest_addr;
                let attach_size = left.min(region.size - ds_offset);

                if self.verbose {
                    debug!(
                        "attach_to_vm [{:#x}, {:#x}) of region [{:#x}, {:#x})",
                        g_phys,
                        g_phys + attach_size,
                        region.guest_addr,
                        region.end()
                    );
                }

                self.vm.attach(
                    &region.ds,
                    GuestPhysAddr::from(g_phys),
                    AttachAttr {
                        offset: ds_offset,
                        size: attach_size,
                        executable: true,
                        writable,
                    },
                )?;

                left -= attach_size;
                g_phys += attach_size;
            }
        }

        if left != 0 {
            warn!("attach_to_vm: region not found {:#x}+{:#x}", g_phys, left);
        }
        Ok(size - left)
    }

    /// Unmaps the range from the VM. The backing memory stays registered.
    pub fn detach(&self, guest_addr: GuestPhysAddr, size: usize) {
        self.vm.detach(guest_addr, size);
    }

    /// Hands out `size` bytes of guest-physical space from the IO hole.
    pub fn alloc_io_memory(&mut self, size: usize) -> AxResult<GuestPhysAddr> {
        let io_mem = self.io_mem_alloc;
        match io_mem.checked_add(size) {
            Some(end) if end <= IO_MEM_BASE + IO_MEM_SIZE => {
                self.io_mem_alloc = end;
                Ok(GuestPhysAddr::from(io_mem))
            }
            _ => ax_err!(
                NoMemory,
                format!("IO memory hole exhausted, {:#x} bytes requested", size)
            ),
        }
    }
}
