/// A segment descriptor in the dense state.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Descriptor {
    pub sel: u16,
    pub ar: u16,
    pub limit: u32,
    pub base: u64,
}

/// A descriptor-table register (GDTR or IDTR).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DescriptorTable {
    pub limit: u32,
    pub base: u64,
}

/// CPU id marking a vCPU that was switched off.
pub const CPUID_OFF: u32 = u32::MAX;

/// Dense architectural state of one virtual CPU.
///
/// Every field is always present; which of them are meaningful for a given
/// exit is described by the accompanying [`Mask`](crate::Mask).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CpuState {
    /// Id of the owning vCPU, [`CPUID_OFF`] once it has been switched off.
    pub cpuid: u32,

    pub rax: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rbx: u64,
    pub rsp: u64,
    pub rbp: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,

    pub rip: u64,
    pub inst_len: u64,
    pub rfl: u64,

    pub cr0: u64,
    pub cr2: u64,
    pub cr3: u64,
    pub cr4: u64,
    pub dr7: u64,

    pub es: Descriptor,
    pub cs: Descriptor,
    pub ss: Descriptor,
    pub ds: Descriptor,
    pub fs: Descriptor,
    pub gs: Descriptor,
    pub ld: Descriptor,
    pub tr: Descriptor,
    pub gd: DescriptorTable,
    pub id: DescriptorTable,

    pub sysenter_cs: u64,
    pub sysenter_esp: u64,
    pub sysenter_eip: u64,

    pub qual: [u64; 2],
    pub ctrl: [u32; 2],

    pub inj_info: u32,
    pub inj_error: u32,
    pub intr_state: u32,
    pub actv_state: u32,

    pub tsc_value: u64,
    pub tsc_off: u64,

    pub efer: u64,
    pub star: u64,
    pub lstar: u64,
    pub cstar: u64,
    pub fmask: u64,
    pub kernel_gs: u64,

    pub xcr0: u64,
    pub xss: u64,

    pub pdpte: [u64; 4],
}

impl CpuState {
    /// A cleared state owned by vCPU `cpuid`.
    pub fn new(cpuid: u32) -> Self {
        Self {
            cpuid,
            ..Default::default()
        }
    }

    /// `eip` as used in diagnostics of 32-bit guests.
    pub fn eip(&self) -> u32 {
        self.rip as u32
    }
}
