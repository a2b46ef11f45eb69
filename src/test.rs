/// Mock platform shared by the unit tests of every module.
#[cfg(test)]
pub(crate) mod mock {
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
    use std::sync::Arc;

    use axerrno::{ax_err, AxResult};
    use parking_lot::Mutex;

    use crate::config::VmmConfig;
    use crate::exit::VirtFlavor;
    use crate::guest_memory::GuestMemory;
    use crate::hal::{
        AttachAttr, Clock, Dataspace, ExitHandler, GuestPhysAddr, HostMemory, HostTimer, HostVirtAddr,
        VirtFeatures, VmSession,
    };
    use crate::machine::{Machine, Platform};
    use crate::mask::Mask;
    use crate::message::{
        ConsoleEvent, CpuExecutor, CpuMessage, CpuMessageType, DeviceBus, HostServices, IoAccess,
        MemRegion, NetworkSession,
    };
    use crate::vcpu::{Vcpu, VcpuConfig};

    const INJ_VALID: u32 = 1 << 31;

    pub struct MockVmSession {
        features: Mutex<VirtFeatures>,
        attached: Mutex<Vec<(Dataspace, GuestPhysAddr, AttachAttr)>>,
        detached: Mutex<Vec<(GuestPhysAddr, usize)>>,
        created: Mutex<Vec<(usize, usize)>>,
        handlers: Mutex<Vec<Arc<dyn ExitHandler>>>,
        recalls: Mutex<Vec<usize>>,
    }

    impl Default for MockVmSession {
        fn default() -> Self {
            Self {
                features: Mutex::new(VirtFeatures {
                    svm: false,
                    vmx: true,
                }),
                attached: Mutex::new(Vec::new()),
                detached: Mutex::new(Vec::new()),
                created: Mutex::new(Vec::new()),
                handlers: Mutex::new(Vec::new()),
                recalls: Mutex::new(Vec::new()),
            }
        }
    }

    impl MockVmSession {
        pub fn set_features(&self, features: VirtFeatures) {
            *self.features.lock() = features;
        }

        pub fn attached(&self) -> Vec<(Dataspace, GuestPhysAddr, AttachAttr)> {
            self.attached.lock().clone()
        }

        pub fn detached(&self) -> Vec<(GuestPhysAddr, usize)> {
            self.detached.lock().clone()
        }

        /// `(id, affinity)` of every created vcpu.
        pub fn created(&self) -> Vec<(usize, usize)> {
            self.created.lock().clone()
        }

        /// The exit handler registered for vcpu `id`.
        pub fn handler(&self, id: usize) -> Option<Arc<dyn ExitHandler>> {
            self.handlers.lock().get(id).cloned()
        }

        pub fn recalls(&self) -> Vec<usize> {
            self.recalls.lock().clone()
        }
    }

    impl VmSession for MockVmSession {
        fn features(&self) -> VirtFeatures {
            *self.features.lock()
        }

        fn attach(&self, ds: &Dataspace, guest_addr: GuestPhysAddr, attr: AttachAttr) -> AxResult {
            self.attached.lock().push((*ds, guest_addr, attr));
            Ok(())
        }

        fn detach(&self, guest_addr: GuestPhysAddr, size: usize) {
            self.detached.lock().push((guest_addr, size));
        }

        fn create_vcpu(&self, id: usize, affinity: usize, handler: Arc<dyn ExitHandler>) -> AxResult {
            self.created.lock().push((id, affinity));
            self.handlers.lock().push(handler);
            Ok(())
        }

        fn recall(&self, id: usize) {
            self.recalls.lock().push(id);
        }
    }

    /// Hands out dataspaces up to `max_chunk` bytes and bump-allocates the
    /// local address space.
    pub struct MockHostMemory {
        max_chunk: usize,
        next_cap: AtomicUsize,
        next_local: AtomicUsize,
        reserved: Mutex<Vec<usize>>,
        attached_at: Mutex<Vec<(usize, HostVirtAddr)>>,
    }

    impl MockHostMemory {
        const LOCAL_BASE: usize = 0x4000_0000_0000;

        pub fn with_max_chunk(max_chunk: usize) -> Self {
            Self {
                max_chunk,
                next_cap: AtomicUsize::new(1),
                next_local: AtomicUsize::new(Self::LOCAL_BASE),
                reserved: Mutex::new(Vec::new()),
                attached_at: Mutex::new(Vec::new()),
            }
        }

        pub fn reserved(&self) -> Vec<usize> {
            self.reserved.lock().clone()
        }

        /// `(size, local address)` of every dataspace attached into a
        /// reserved window.
        pub fn attached_at(&self) -> Vec<(usize, HostVirtAddr)> {
            self.attached_at.lock().clone()
        }

        fn bump(&self, size: usize) -> HostVirtAddr {
            let size = memory_addr::align_up_4k(size.max(1));
            HostVirtAddr::from(self.next_local.fetch_add(size, Ordering::Relaxed))
        }
    }

    impl HostMemory for MockHostMemory {
        fn alloc(&self, size: usize) -> AxResult<Dataspace> {
            if size > self.max_chunk {
                return ax_err!(NoMemory, "quota exceeded");
            }
            Ok(Dataspace {
                cap: self.next_cap.fetch_add(1, Ordering::Relaxed),
                size,
            })
        }

        fn reserve(&self, size: usize) -> AxResult<HostVirtAddr> {
            self.reserved.lock().push(size);
            Ok(self.bump(size))
        }

        fn attach_at(&self, ds: &Dataspace, local_addr: HostVirtAddr) -> AxResult {
            self.attached_at.lock().push((ds.size, local_addr));
            Ok(())
        }

        fn attach(&self, ds: &Dataspace) -> AxResult<HostVirtAddr> {
            Ok(self.bump(ds.size))
        }
    }

    #[derive(Default)]
    pub struct MockHostTimer {
        programmed: Mutex<Vec<u64>>,
    }

    impl MockHostTimer {
        /// Every programmed delay in microseconds.
        pub fn programmed(&self) -> Vec<u64> {
            self.programmed.lock().clone()
        }
    }

    impl HostTimer for MockHostTimer {
        fn trigger_once(&self, us: u64) -> AxResult {
            self.programmed.lock().push(us);
            Ok(())
        }
    }

    pub struct MockClock {
        now: AtomicU64,
        frequency: u64,
    }

    impl MockClock {
        pub fn new(frequency: u64) -> Self {
            Self {
                now: AtomicU64::new(0),
                frequency,
            }
        }

        pub fn set(&self, now: u64) {
            self.now.store(now, Ordering::Relaxed);
        }
    }

    impl Clock for MockClock {
        fn now(&self) -> u64 {
            self.now.load(Ordering::Relaxed)
        }

        fn frequency(&self) -> u64 {
            self.frequency
        }
    }

    #[derive(Default)]
    pub struct MockBus {
        ram: Mutex<Vec<(u64, u64)>>,
        timeouts: Mutex<Vec<(usize, u64)>>,
        console: Mutex<Vec<ConsoleEvent>>,
        resets: Mutex<Vec<bool>>,
    }

    impl MockBus {
        const RAM_LOCAL_BASE: usize = 0x7000_0000_0000;

        /// Makes guest pages `[start_page, start_page + count)` writable RAM.
        pub fn back_ram(&self, start_page: u64, count: u64) {
            self.ram.lock().push((start_page, count));
        }

        pub fn timeouts(&self) -> Vec<(usize, u64)> {
            self.timeouts.lock().clone()
        }

        pub fn console_events(&self) -> Vec<ConsoleEvent> {
            self.console.lock().clone()
        }

        pub fn resets(&self) -> Vec<bool> {
            self.resets.lock().clone()
        }
    }

    impl DeviceBus for MockBus {
        fn mem_region(&self, page: u64, _cr0: u64) -> Option<MemRegion> {
            self.ram
                .lock()
                .iter()
                .find(|(start, count)| (*start..start + count).contains(&page))
                .map(|&(start_page, count)| MemRegion {
                    page,
                    start_page,
                    count,
                    ptr: Some(HostVirtAddr::from(
                        Self::RAM_LOCAL_BASE + ((start_page as usize) << 12),
                    )),
                    read_only: false,
                })
        }

        fn timeout(&self, nr: usize, deadline: u64) {
            self.timeouts.lock().push((nr, deadline));
        }

        fn console(&self, event: ConsoleEvent) {
            self.console.lock().push(event);
        }

        fn legacy_reset(&self, cpuid_native: bool) {
            self.resets.lock().push(cpuid_native);
        }
    }

    struct MockNetwork {
        sent: Arc<Mutex<Vec<Vec<u8>>>>,
    }

    impl NetworkSession for MockNetwork {
        fn mac_address(&self) -> [u8; 6] {
            [0x02, 0x02, 0x03, 0x04, 0x05, 0x06]
        }

        fn transmit(&mut self, packet: &[u8]) -> bool {
            self.sent.lock().push(packet.to_vec());
            true
        }
    }

    #[derive(Default)]
    pub struct MockServices {
        modules: Mutex<Vec<(Vec<u8>, String)>>,
        sent: Arc<Mutex<Vec<Vec<u8>>>>,
        rtc: Mutex<Option<u64>>,
        exit_code: Mutex<Option<i32>>,
    }

    impl MockServices {
        /// Appends a boot module. The first one added has index 0.
        pub fn add_module(&self, data: Vec<u8>, cmdline: &str) {
            self.modules.lock().push((data, cmdline.into()));
        }

        pub fn transmitted(&self) -> Vec<Vec<u8>> {
            self.sent.lock().clone()
        }

        pub fn set_rtc(&self, rtc: Option<u64>) {
            *self.rtc.lock() = rtc;
        }

        pub fn exit_code(&self) -> Option<i32> {
            *self.exit_code.lock()
        }
    }

    impl HostServices for MockServices {
        fn module_data(&self, index: usize, dst: &mut [u8]) -> AxResult<usize> {
            let modules = self.modules.lock();
            let Some((data, _)) = modules.get(index) else {
                return Ok(0);
            };
            if data.len() > dst.len() {
                return ax_err!(InvalidInput, "destination buffer too small");
            }
            dst[..data.len()].copy_from_slice(data);
            Ok(data.len())
        }

        fn module_cmdline(&self, index: usize, dst: &mut [u8]) -> usize {
            let modules = self.modules.lock();
            let Some((_, cmdline)) = modules.get(index) else {
                return 0;
            };
            let len = cmdline.len().min(dst.len());
            dst[..len].copy_from_slice(&cmdline.as_bytes()[..len]);
            len
        }

        fn open_network(&self) -> AxResult<Box<dyn NetworkSession>> {
            Ok(Box::new(MockNetwork {
                sent: self.sent.clone(),
            }))
        }

        fn rtc_time(&self) -> Option<u64> {
            *self.rtc.lock()
        }

        fn exit(&self, code: i32) {
            *self.exit_code.lock() = Some(code);
        }
    }

    /// Messages seen by a [`MockExecutor`].
    #[derive(Clone, Default)]
    pub struct ExecutorLog(Arc<Mutex<Vec<(CpuMessageType, Option<IoAccess>)>>>);

    impl ExecutorLog {
        pub fn types(&self) -> Vec<CpuMessageType> {
            self.0.lock().iter().map(|(ty, _)| *ty).collect()
        }

        /// `(port, order)` of every I/O message.
        pub fn io(&self) -> Vec<(u16, u32)> {
            self.0
                .lock()
                .iter()
                .filter_map(|(_, io)| io.map(|io| (io.port, io.order)))
                .collect()
        }
    }

    /// A device model answering CPUID, RDTSC and port reads with fixed values.
    #[derive(Default)]
    pub struct MockExecutor {
        pub log: ExecutorLog,
        /// Refuse every message.
        pub refuse: bool,
        /// Vector injected on [`CpuMessageType::CheckIrq`].
        pub inject: Option<u32>,
        /// Groups reported as modified on top of the real ones.
        pub touch: Mask,
    }

    impl MockExecutor {
        pub const IO_IN_VALUE: u64 = 0x5a;
        pub const CPUID: [u64; 4] = [0xd, 0x756e_6547, 0x6c65_746e, 0x4965_6e69];
        pub const TSC: u64 = 0x1234_5678;

        pub fn logged() -> (Self, ExecutorLog) {
            let executor = Self::default();
            let log = executor.log.clone();
            (executor, log)
        }
    }

    impl CpuExecutor for MockExecutor {
        fn execute(&mut self, msg: &mut CpuMessage<'_>) -> bool {
            self.log.0.lock().push((msg.ty, msg.io));
            if self.refuse {
                return false;
            }

            let cpu = &mut *msg.cpu;
            match msg.ty {
                CpuMessageType::Cpuid => {
                    [cpu.rax, cpu.rbx, cpu.rcx, cpu.rdx] = Self::CPUID;
                    msg.mtr_out |= Mask::GPR_ACDB;
                }
                CpuMessageType::Rdtsc => {
                    cpu.rax = Self::TSC & 0xffff_ffff;
                    cpu.rdx = Self::TSC >> 32;
                    msg.mtr_out |= Mask::GPR_ACDB;
                }
                CpuMessageType::IoIn => {
                    if let Some(io) = msg.io.as_mut() {
                        io.value = Self::IO_IN_VALUE;
                    }
                }
                CpuMessageType::CheckIrq => {
                    if let Some(vector) = self.inject {
                        if msg.mtr_in.contains(Mask::INJ) {
                            cpu.inj_info = INJ_VALID | vector;
                            msg.mtr_out |= Mask::INJ;
                        }
                    }
                }
                _ => {}
            }
            msg.mtr_out |= self.touch;
            true
        }
    }

    /// A complete mock platform with 64 MiB of guest RAM.
    pub struct Fixture {
        pub vm: Arc<MockVmSession>,
        pub host: Arc<MockHostMemory>,
        pub timer: Arc<MockHostTimer>,
        pub clock: Arc<MockClock>,
        pub bus: Arc<MockBus>,
        pub services: Arc<MockServices>,
        pub guest_memory: Arc<Mutex<GuestMemory>>,
    }

    impl Fixture {
        pub const GUEST_SIZE: usize = 64 << 20;

        pub fn new() -> Self {
            let vm = Arc::new(MockVmSession::default());
            let host = Arc::new(MockHostMemory::with_max_chunk(1 << 30));
            let guest_memory = Self::guest_memory(&vm, &host);
            Self {
                vm,
                host,
                timer: Arc::new(MockHostTimer::default()),
                clock: Arc::new(MockClock::new(1_000_000)),
                bus: Arc::new(MockBus::default()),
                services: Arc::new(MockServices::default()),
                guest_memory: Arc::new(Mutex::new(guest_memory)),
            }
        }

        fn guest_memory(vm: &Arc<MockVmSession>, host: &MockHostMemory) -> GuestMemory {
            GuestMemory::new(vm.clone(), host, Self::GUEST_SIZE, false).unwrap()
        }

        pub fn platform(&self) -> Platform {
            Platform {
                vm: self.vm.clone(),
                host: self.host.clone(),
                timer: self.timer.clone(),
                clock: self.clock.clone(),
                bus: self.bus.clone(),
                services: self.services.clone(),
            }
        }

        pub fn machine(&self, config: VmmConfig) -> Machine {
            Machine::new(config, self.platform(), Self::guest_memory(&self.vm, &self.host))
        }

        pub fn vcpu(&self, flavor: VirtFlavor, executor: MockExecutor) -> Arc<Vcpu> {
            self.vcpu_config(
                flavor,
                executor,
                VcpuConfig {
                    map_small: false,
                    rdtsc_exit: false,
                },
            )
        }

        pub fn vcpu_config(&self, flavor: VirtFlavor, executor: MockExecutor, config: VcpuConfig) -> Arc<Vcpu> {
            Arc::new(Vcpu::new(
                0,
                flavor,
                config,
                self.vm.clone(),
                self.guest_memory.clone(),
                self.bus.clone(),
                Box::new(executor),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use memory_addr::PAGE_SIZE_4K;

    use super::mock::{Fixture, MockExecutor, MockHostMemory, MockVmSession};
    use crate::config::VmmConfig;
    use crate::exit::VirtFlavor;
    use crate::guest_memory::{GuestMemory, IO_MEM_BASE};
    use crate::hal::{Dataspace, ExitHandler, GuestPhysAddr, HostVirtAddr};
    use crate::machine::Machine;
    use crate::message::{HostOp, HostOpReply};
    use crate::vcpu::VcpuRunState;
    use crate::vcpu_state::VcpuState;

    const MB: usize = 1 << 20;

    fn exit_state(handler: &dyn ExitHandler, exit: u32) -> VcpuState {
        let mut state = VcpuState::default();
        handler.exit_config(exit, &mut state);
        state.exit_reason = exit;
        state
    }

    fn wait_until(cond: impl Fn() -> bool) {
        for _ in 0..500 {
            if cond() {
                return;
            }
            thread::sleep(Duration::from_millis(2));
        }
        panic!("condition not reached");
    }

    #[test]
    fn setup_backs_guest_ram_contiguously() {
        let fixture = Fixture::new();
        let machine = Machine::setup(VmmConfig::default(), fixture.platform(), 76 * MB).unwrap();

        let guest_memory = machine.guest_memory().lock();
        assert_eq!(guest_memory.backing_store_size(), 64 * MB);
        assert!(!guest_memory.has_io_mem_gap());

        // the fixture's own guest memory reserved first
        let reserved = fixture.host.reserved();
        assert_eq!(reserved.last(), Some(&(64 * MB)));

        let base = guest_memory.backing_store_local_base();
        let (size, local) = *fixture.host.attached_at().last().unwrap();
        assert_eq!((size, local), (64 * MB, base));
    }

    #[test]
    fn setup_without_spare_memory_fails() {
        let fixture = Fixture::new();
        let err = Machine::setup(VmmConfig::default(), fixture.platform(), 8 * MB).err();
        assert_eq!(err, Some(axerrno::AxError::NoMemory));
    }

    #[test]
    fn startup_exit_waits_for_boot() {
        let fixture = Fixture::new();
        let machine = fixture.machine(VmmConfig::default());
        machine
            .handle_host_op(HostOp::VcpuCreateBackend {
                executor: Box::new(MockExecutor::default()),
            })
            .unwrap();

        let handler = fixture.vm.handler(0).unwrap();
        let resumed = Arc::new(AtomicBool::new(false));
        let vcpu_thread = {
            let resumed = resumed.clone();
            thread::spawn(move || {
                let mut state = exit_state(handler.as_ref(), 0xfe);
                resumed.store(handler.handle_exit(&mut state), Ordering::SeqCst);
            })
        };

        thread::sleep(Duration::from_millis(20));
        assert!(!resumed.load(Ordering::SeqCst));
        assert_eq!(machine.vcpu(0).unwrap().state(), VcpuRunState::Created);

        machine.boot().unwrap();
        vcpu_thread.join().unwrap();
        assert!(resumed.load(Ordering::SeqCst));
        assert_eq!(machine.vcpu(0).unwrap().state(), VcpuRunState::Running);
    }

    #[test]
    fn blocked_vcpu_waits_for_release() {
        let fixture = Fixture::new();
        let machine = Arc::new(fixture.machine(VmmConfig::default()));
        for _ in 0..2 {
            machine
                .handle_host_op(HostOp::VcpuCreateBackend {
                    executor: Box::new(MockExecutor::default()),
                })
                .unwrap();
        }

        let done = Arc::new(AtomicBool::new(false));
        let blocker = {
            let machine = machine.clone();
            let done = done.clone();
            thread::spawn(move || {
                machine.handle_host_op(HostOp::VcpuBlock { id: 0 }).unwrap();
                done.store(true, Ordering::SeqCst);
            })
        };

        wait_until(|| !machine.is_active(0));
        thread::sleep(Duration::from_millis(20));
        assert!(!done.load(Ordering::SeqCst));
        assert_eq!(machine.vcpu(0).unwrap().state(), VcpuRunState::Blocked);
        // vcpu 1 is still active, the console keeps running
        assert!(fixture.bus.console_events().is_empty());

        assert_eq!(
            machine.handle_host_op(HostOp::VcpuRelease { id: 0, unblock: true }),
            Ok(HostOpReply::Done)
        );
        blocker.join().unwrap();
        assert!(done.load(Ordering::SeqCst));
        assert!(machine.is_active(0));
        assert!(fixture.bus.console_events().is_empty());
    }

    #[test]
    fn cpuid_is_emulated_on_both_flavors() {
        // (flavor, exit, rip_len set by the kernel)
        for (flavor, exit, rip_len) in [(VirtFlavor::Svm, 0x72, None), (VirtFlavor::Vmx, 0x0a, Some(2))] {
            let fixture = Fixture::new();
            let vcpu = fixture.vcpu(flavor, MockExecutor::default());

            let mut state = exit_state(vcpu.as_ref(), exit);
            state.ip.charge(0x1000);
            if let Some(len) = rip_len {
                state.ip_len.charge(len);
            }

            assert!(vcpu.handle_exit(&mut state), "{:?}", flavor);
            assert!(state.ip.charged());
            assert_eq!(state.ip.value(), 0x1002, "{:?}", flavor);
            assert_eq!(vcpu.cpu_state().rip, 0x1002);

            let [ax, bx, cx, dx] = MockExecutor::CPUID;
            for (reg, value) in [(&state.ax, ax), (&state.bx, bx), (&state.cx, cx), (&state.dx, dx)] {
                assert!(reg.charged());
                assert_eq!(reg.value(), value);
            }
        }
    }

    #[test]
    fn attach_spans_adjacent_regions() {
        let vm = Arc::new(MockVmSession::default());
        let host = MockHostMemory::with_max_chunk(1 << 30);
        let mut mem = GuestMemory::new(vm.clone(), &host, 16 * MB, false).unwrap();

        let first = Dataspace { cap: 100, size: MB };
        let second = Dataspace { cap: 101, size: MB };
        assert_eq!(
            mem.add_region(IO_MEM_BASE, HostVirtAddr::from(0x1000_0000), first, MB),
            Ok(true)
        );
        assert_eq!(
            mem.add_region(IO_MEM_BASE + MB, HostVirtAddr::from(0x2000_0000), second, MB),
            Ok(true)
        );

        let start = IO_MEM_BASE + MB / 2;
        assert_eq!(mem.attach_to_vm(GuestPhysAddr::from(start), MB, true), Ok(MB));

        let calls = vm.attached();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].0, first);
        assert_eq!(calls[0].1, GuestPhysAddr::from(start));
        assert_eq!(calls[0].2.offset, MB / 2);
        assert_eq!(calls[1].0, second);
        assert_eq!(calls[1].1, GuestPhysAddr::from(IO_MEM_BASE + MB));
        assert_eq!(calls[1].2.offset, 0);
        assert_eq!(calls[0].2.size + calls[1].2.size, MB);
        assert!(calls.iter().all(|call| call.2.size % PAGE_SIZE_4K == 0));
    }
}
