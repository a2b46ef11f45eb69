use std::sync::Arc;

use axerrno::{ax_err, AxResult};
use memory_addr::{align_up_4k, is_aligned_4k};
use parking_lot::Mutex;

use crate::config::VmmConfig;
use crate::exit::VirtFlavor;
use crate::guest_memory::GuestMemory;
use crate::hal::{Clock, ExitHandler, HostMemory, HostTimer, VmSession};
use crate::message::{
    ConsoleEvent, CpuExecutor, DeviceBus, HostOp, HostOpReply, HostServices, NetworkSession,
    TimeReply, TimerOp, TimerReply,
};
use crate::timeout::Timeouts;
use crate::vcpu::{Vcpu, VcpuConfig};

/// Maximum number of vcpus of one VM.
pub const MAX_VCPUS: usize = 16;

/// Kernel and host services a [`Machine`] runs on.
pub struct Platform {
    pub vm: Arc<dyn VmSession>,
    pub host: Arc<dyn HostMemory>,
    pub timer: Arc<dyn HostTimer>,
    pub clock: Arc<dyn Clock>,
    pub bus: Arc<dyn DeviceBus>,
    pub services: Arc<dyn HostServices>,
}

/// The VM as seen from the device-model bus.
///
/// Device models reach the VMM core only through [`Machine::handle_host_op`],
/// [`Machine::handle_timer`] and the other receivers below.
pub struct Machine {
    config: VmmConfig,
    vm: Arc<dyn VmSession>,
    host: Arc<dyn HostMemory>,
    clock: Arc<dyn Clock>,
    bus: Arc<dyn DeviceBus>,
    services: Arc<dyn HostServices>,
    guest_memory: Arc<Mutex<GuestMemory>>,
    timeouts: Timeouts,
    vcpus: Mutex<Vec<Arc<Vcpu>>>,
    /// One bit per vcpu not waiting in [`HostOp::VcpuBlock`].
    active: Mutex<u64>,
    nic: Mutex<Option<Box<dyn NetworkSession>>>,
}

impl Machine {
    /// Sets up guest memory from the `avail` bytes of RAM the VMM may use
    /// and creates the machine.
    pub fn setup(config: VmmConfig, platform: Platform, avail: usize) -> AxResult<Self> {
        let guest_size = config.guest_ram_size(avail)?;
        config.log();

        let guest_memory = GuestMemory::new(
            platform.vm.clone(),
            platform.host.as_ref(),
            guest_size,
            config.verbose_mem,
        )?;
        if config.verbose_mem {
            guest_memory.dump_regions();
        }

        Ok(Self::new(config, platform, guest_memory))
    }

    pub fn new(config: VmmConfig, platform: Platform, guest_memory: GuestMemory) -> Self {
        Self {
            config,
            timeouts: Timeouts::new(platform.timer, platform.clock.clone()),
            vm: platform.vm,
            host: platform.host,
            clock: platform.clock,
            bus: platform.bus,
            services: platform.services,
            guest_memory: Arc::new(Mutex::new(guest_memory)),
            vcpus: Mutex::new(Vec::new()),
            active: Mutex::new(0),
            nic: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &VmmConfig {
        &self.config
    }

    pub fn guest_memory(&self) -> &Arc<Mutex<GuestMemory>> {
        &self.guest_memory
    }

    pub fn vcpu(&self, id: usize) -> Option<Arc<Vcpu>> {
        self.vcpus.lock().get(id).cloned()
    }

    pub fn vcpu_count(&self) -> usize {
        self.vcpus.lock().len()
    }

    /// Whether vcpu `id` is not blocked.
    pub fn is_active(&self, id: usize) -> bool {
        id < 64 && *self.active.lock() & (1 << id) != 0
    }

    /// Serves a host operation of a device model.
    ///
    /// Requests the VMM can refuse are answered with
    /// [`HostOpReply::Declined`], errors are fatal for the VM.
    pub fn handle_host_op(&self, op: HostOp<'_>) -> AxResult<HostOpReply> {
        match op {
            HostOp::AllocIoMem { guest_addr, len } => self.alloc_io_mem(guest_addr.as_usize(), len, len),
            HostOp::AllocIoMemSmall {
                guest_addr,
                len,
                len_short,
            } => self.alloc_io_mem(guest_addr.as_usize(), len, len_short),
            HostOp::GuestMem { offset } => {
                debug!("OP_GUEST_MEM offset={:#x}", offset);
                if offset != 0 {
                    return ax_err!(Unsupported, "legacy guest-mem mode not supported");
                }
                let guest_memory = self.guest_memory.lock();
                Ok(HostOpReply::Memory {
                    ptr: guest_memory.backing_store_local_base(),
                    len: guest_memory.backing_store_size(),
                })
            }
            HostOp::ReserveIoRange { size } => {
                let range = self.guest_memory.lock().alloc_io_memory(size)?;
                Ok(HostOpReply::IoRange(range))
            }
            HostOp::DetachMem { guest_addr, len } => {
                self.guest_memory.lock().detach(guest_addr, len);
                Ok(HostOpReply::Done)
            }
            HostOp::VcpuCreateBackend { executor } => self.create_vcpu(executor),
            HostOp::VcpuRelease { id, unblock } => {
                let Some(vcpu) = self.vcpu(id) else {
                    return Ok(HostOpReply::Declined);
                };
                if unblock {
                    vcpu.unblock();
                } else {
                    vcpu.recall();
                }
                Ok(HostOpReply::Done)
            }
            HostOp::VcpuBlock { id } => {
                let Some(vcpu) = self.vcpu(id) else {
                    return Ok(HostOpReply::Declined);
                };
                self.block_vcpu(&vcpu);
                Ok(HostOpReply::Done)
            }
            HostOp::GetModule { module, dst } => self.get_module(module, dst),
            HostOp::GetMac => self.get_mac(),
            HostOp::VmOff => {
                self.power_off();
                Ok(HostOpReply::PoweredOff)
            }
        }
    }

    fn alloc_io_mem(&self, guest_addr: usize, len: usize, register_len: usize) -> AxResult<HostOpReply> {
        if !is_aligned_4k(len) {
            return Ok(HostOpReply::Declined);
        }

        let ds = match self.host.alloc(len) {
            Ok(ds) => ds,
            Err(err) => {
                warn!("allocating {:#x} bytes of IO memory failed: {:?}", len, err);
                return Ok(HostOpReply::Declined);
            }
        };
        let local_addr = match self.host.attach(&ds) {
            Ok(local_addr) => local_addr,
            Err(err) => {
                warn!("attaching IO memory failed: {:?}", err);
                return Ok(HostOpReply::Declined);
            }
        };

        let added = self
            .guest_memory
            .lock()
            .add_region(guest_addr, local_addr, ds, register_len)?;
        Ok(if added {
            HostOpReply::Memory {
                ptr: local_addr,
                len,
            }
        } else {
            HostOpReply::Declined
        })
    }

    fn create_vcpu(&self, executor: Box<dyn CpuExecutor>) -> AxResult<HostOpReply> {
        let mut vcpus = self.vcpus.lock();
        let id = vcpus.len();
        if id >= MAX_VCPUS {
            return ax_err!(NoMemory, "too many vCPUs");
        }

        let features = self.vm.features();
        let flavor = if features.svm {
            VirtFlavor::Svm
        } else if features.vmx {
            VirtFlavor::Vmx
        } else {
            return ax_err!(Unsupported, "no VMX nor SVM virtualization support found");
        };

        let affinity = if self.config.vmm_vcpu_same_cpu { id } else { id + 1 };
        let vcpu = Arc::new(Vcpu::new(
            id,
            flavor,
            VcpuConfig {
                map_small: self.config.map_small,
                rdtsc_exit: self.config.exit_on_rdtsc,
            },
            self.vm.clone(),
            self.guest_memory.clone(),
            self.bus.clone(),
            executor,
        ));

        self.vm
            .create_vcpu(id, affinity, vcpu.clone() as Arc<dyn ExitHandler>)?;
        *self.active.lock() |= 1 << id;
        vcpus.push(vcpu);

        info!("create vcpu {} ({:?}) affinity {}", id, flavor, affinity);
        Ok(HostOpReply::Vcpu(id))
    }

    /// Blocks `vcpu` on behalf of its own exit handler. The console is paused
    /// while no vcpu is active.
    fn block_vcpu(&self, vcpu: &Vcpu) {
        let bit = 1u64 << vcpu.id();
        {
            let mut active = self.active.lock();
            *active &= !bit;
            if *active == 0 {
                self.bus.console(ConsoleEvent::Pause);
            }
        }

        vcpu.block();

        let mut active = self.active.lock();
        if *active == 0 {
            self.bus.console(ConsoleEvent::Resume);
        }
        *active |= bit;
    }

    fn get_module(&self, module: usize, dst: &mut [u8]) -> AxResult<HostOpReply> {
        // module indices start with 1
        if module == 0 {
            return Ok(HostOpReply::Declined);
        }
        let index = module - 1;

        let size = self.services.module_data(index, dst)?;
        if size == 0 {
            // end of the module list
            return Ok(HostOpReply::Declined);
        }

        // the command line follows the data on the next page boundary
        let cmdline_offset = align_up_4k(size);
        if cmdline_offset >= dst.len() {
            info!("destination buffer too small for command line");
            return Ok(HostOpReply::Declined);
        }
        let cmdline_len = self
            .services
            .module_cmdline(index, &mut dst[cmdline_offset..]);

        Ok(HostOpReply::Module {
            size,
            cmdline_offset,
            cmdline_len,
        })
    }

    fn get_mac(&self) -> AxResult<HostOpReply> {
        let mut nic = self.nic.lock();
        if nic.is_some() {
            info!("Solely one network connection supported");
            return Ok(HostOpReply::Declined);
        }

        let session = match self.services.open_network() {
            Ok(session) => session,
            Err(err) => {
                warn!("Creating network connection failed: {:?}", err);
                return Ok(HostOpReply::Declined);
            }
        };

        let mac = session.mac_address();
        info!(
            "Mac address: {:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            mac[0], mac[1], mac[2], mac[3], mac[4], mac[5]
        );
        *nic = Some(session);

        Ok(HostOpReply::Mac(
            mac.iter().fold(0u64, |acc, byte| acc << 8 | *byte as u64),
        ))
    }

    fn power_off(&self) {
        info!("VM off requested");
        let vcpus = self.vcpus.lock().clone();
        for vcpu in vcpus {
            vcpu.off();
        }
        self.services.exit(0);
    }

    /// Serves a timer request of a device model.
    pub fn handle_timer(&self, op: TimerOp) -> AxResult<TimerReply> {
        match op {
            TimerOp::New => {
                let nr = self.timeouts.alloc()?;
                debug!("TIMER_NEW {}", nr);
                Ok(TimerReply::Allocated(nr))
            }
            TimerOp::Request { nr, abstime } => {
                self.timeouts.request(nr, abstime)?;
                Ok(TimerReply::Done)
            }
        }
    }

    /// Host-timer callback, runs on the VMM's administrative context.
    pub fn check_timeouts(&self) -> AxResult {
        self.timeouts.check_timeouts(self.bus.as_ref())
    }

    /// Sends a network packet of the guest. Returns `false` without a
    /// network session.
    pub fn transmit(&self, packet: &[u8]) -> bool {
        match self.nic.lock().as_mut() {
            Some(nic) => nic.transmit(packet),
            None => false,
        }
    }

    /// Wall-clock and VMM time for the guest's RTC.
    pub fn time(&self) -> TimeReply {
        let Some(secs) = self.services.rtc_time() else {
            info!("No RTC present, returning dummy time.");
            return TimeReply::default();
        };

        let reply = TimeReply {
            wallclock: secs.saturating_mul(TimeReply::FREQUENCY),
            timestamp: self.clock.time_in(TimeReply::FREQUENCY),
        };
        debug!("Got time {:#x}", reply.wallclock);
        reply
    }

    /// Acknowledges a legacy reset request of a device model.
    pub fn legacy_reset(&self) -> bool {
        info!("legacy RESET requested");
        true
    }

    /// Resets all device models and lets every vcpu leave its startup exit.
    pub fn boot(&self) -> AxResult {
        let vcpus = self.vcpus.lock().clone();
        info!(
            "VM is starting with {} vCPU{}",
            vcpus.len(),
            if vcpus.len() > 1 { "s" } else { "" }
        );

        info!("RESET device state");
        self.bus.legacy_reset(self.config.cpuid_native);
        info!("INIT done");

        for vcpu in vcpus {
            vcpu.start()?;
        }
        Ok(())
    }
}
