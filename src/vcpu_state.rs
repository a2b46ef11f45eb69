/// One register of the kernel's vCPU state together with its charge bit.
///
/// A register is *charged* when one side of the transfer supplied valid
/// content for it. Discharging keeps the last value around; some handlers
/// derive new content from it after a reset.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Charged<T> {
    value: T,
    charged: bool,
}

impl<T: Copy> Charged<T> {
    pub fn charge(&mut self, value: T) {
        self.value = value;
        self.charged = true;
    }

    pub const fn charged(&self) -> bool {
        self.charged
    }

    pub fn value(&self) -> T {
        self.value
    }

    fn discharge(&mut self) {
        self.charged = false;
    }
}

/// Segment register layout used by the kernel.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Segment {
    pub sel: u16,
    pub ar: u16,
    pub limit: u32,
    pub base: u64,
}

/// Descriptor-table register layout used by the kernel.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Range {
    pub base: u64,
    pub limit: u32,
}

/// The kernel's per-exit register transfer object.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct VcpuState {
    /// Raw exit reason, meaningful only together with the virtualization
    /// flavor of the vCPU.
    pub exit_reason: u32,

    pub ax: Charged<u64>,
    pub cx: Charged<u64>,
    pub dx: Charged<u64>,
    pub bx: Charged<u64>,
    pub bp: Charged<u64>,
    pub si: Charged<u64>,
    pub di: Charged<u64>,
    pub sp: Charged<u64>,
    pub ip: Charged<u64>,
    pub ip_len: Charged<u64>,
    pub flags: Charged<u64>,

    pub es: Charged<Segment>,
    pub ds: Charged<Segment>,
    pub fs: Charged<Segment>,
    pub gs: Charged<Segment>,
    pub cs: Charged<Segment>,
    pub ss: Charged<Segment>,
    pub tr: Charged<Segment>,
    pub ldtr: Charged<Segment>,
    pub gdtr: Charged<Range>,
    pub idtr: Charged<Range>,

    pub cr0: Charged<u64>,
    pub cr2: Charged<u64>,
    pub cr3: Charged<u64>,
    pub cr4: Charged<u64>,
    pub dr7: Charged<u64>,

    pub sysenter_ip: Charged<u64>,
    pub sysenter_sp: Charged<u64>,
    pub sysenter_cs: Charged<u64>,

    pub qual_primary: Charged<u64>,
    pub qual_secondary: Charged<u64>,
    pub ctrl_primary: Charged<u32>,
    pub ctrl_secondary: Charged<u32>,

    pub inj_info: Charged<u32>,
    pub inj_error: Charged<u32>,
    pub intr_state: Charged<u32>,
    pub actv_state: Charged<u32>,

    pub tsc: Charged<u64>,
    pub tsc_offset: Charged<u64>,

    pub efer: Charged<u64>,

    pub pdpte_0: Charged<u64>,
    pub pdpte_1: Charged<u64>,
    pub pdpte_2: Charged<u64>,
    pub pdpte_3: Charged<u64>,

    pub r8: Charged<u64>,
    pub r9: Charged<u64>,
    pub r10: Charged<u64>,
    pub r11: Charged<u64>,
    pub r12: Charged<u64>,
    pub r13: Charged<u64>,
    pub r14: Charged<u64>,
    pub r15: Charged<u64>,

    pub star: Charged<u64>,
    pub lstar: Charged<u64>,
    pub cstar: Charged<u64>,
    pub fmask: Charged<u64>,
    pub kernel_gs_base: Charged<u64>,

    pub tpr: Charged<u32>,
    pub tpr_threshold: Charged<u32>,

    pub xcr0: Charged<u64>,
    pub xss: Charged<u64>,
}

impl VcpuState {
    /// Clears the charge bit of every register.
    pub fn discharge(&mut self) {
        for reg in [
            &mut self.ax,
            &mut self.cx,
            &mut self.dx,
            &mut self.bx,
            &mut self.bp,
            &mut self.si,
            &mut self.di,
            &mut self.sp,
            &mut self.ip,
            &mut self.ip_len,
            &mut self.flags,
            &mut self.cr0,
            &mut self.cr2,
            &mut self.cr3,
            &mut self.cr4,
            &mut self.dr7,
            &mut self.sysenter_ip,
            &mut self.sysenter_sp,
            &mut self.sysenter_cs,
            &mut self.qual_primary,
            &mut self.qual_secondary,
            &mut self.tsc,
            &mut self.tsc_offset,
            &mut self.efer,
            &mut self.pdpte_0,
            &mut self.pdpte_1,
            &mut self.pdpte_2,
            &mut self.pdpte_3,
            &mut self.r8,
            &mut self.r9,
            &mut self.r10,
            &mut self.r11,
            &mut self.r12,
            &mut self.r13,
            &mut self.r14,
            &mut self.r15,
            &mut self.star,
            &mut self.lstar,
            &mut self.cstar,
            &mut self.fmask,
            &mut self.kernel_gs_base,
            &mut self.xcr0,
            &mut self.xss,
        ] {
            reg.discharge();
        }

        for seg in [
            &mut self.es,
            &mut self.ds,
            &mut self.fs,
            &mut self.gs,
            &mut self.cs,
            &mut self.ss,
            &mut self.tr,
            &mut self.ldtr,
        ] {
            seg.discharge();
        }

        self.gdtr.discharge();
        self.idtr.discharge();

        for reg in [
            &mut self.ctrl_primary,
            &mut self.ctrl_secondary,
            &mut self.inj_info,
            &mut self.inj_error,
            &mut self.intr_state,
            &mut self.actv_state,
            &mut self.tpr,
            &mut self.tpr_threshold,
        ] {
            reg.discharge();
        }
    }

    /// Whether any register is charged.
    pub fn any_charged(&self) -> bool {
        *self != {
            let mut clean = self.clone();
            clean.discharge();
            clean
        }
    }
}
