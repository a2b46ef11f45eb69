//! Conversion between the kernel's sparse [`VcpuState`] and the dense
//! [`CpuState`] used by the device models.
//!
//! Both directions are driven by a [`Mask`]. Register groups always travel
//! as a unit; a segment is transferred as its (selector, access rights,
//! limit, base) tuple.

use crate::cpu_state::{CpuState, Descriptor, DescriptorTable};
use crate::mask::Mask;
use crate::vcpu_state::{Range, Segment, VcpuState};

impl From<&Descriptor> for Segment {
    fn from(d: &Descriptor) -> Self {
        Segment {
            sel: d.sel,
            ar: d.ar,
            limit: d.limit,
            base: d.base,
        }
    }
}

impl From<Segment> for Descriptor {
    fn from(s: Segment) -> Self {
        Descriptor {
            sel: s.sel,
            ar: s.ar,
            limit: s.limit,
            base: s.base,
        }
    }
}

impl From<&DescriptorTable> for Range {
    fn from(t: &DescriptorTable) -> Self {
        Range {
            base: t.base,
            limit: t.limit,
        }
    }
}

impl From<Range> for DescriptorTable {
    fn from(r: Range) -> Self {
        DescriptorTable {
            limit: r.limit,
            base: r.base,
        }
    }
}

/// Writes the groups named by `mask` from `cpu` into `state`.
///
/// `state` is discharged first, so afterwards exactly the masked groups are
/// charged. Bits of `mask` that name no known group are reported.
pub fn write_vcpu_state(cpu: &CpuState, mask: Mask, state: &mut VcpuState) {
    state.discharge();

    let mut mtr = mask;

    if mtr.contains(Mask::GPR_ACDB) {
        state.ax.charge(cpu.rax);
        state.cx.charge(cpu.rcx);
        state.dx.charge(cpu.rdx);
        state.bx.charge(cpu.rbx);
        mtr.remove(Mask::GPR_ACDB);
    }

    if mtr.contains(Mask::GPR_BSD) {
        state.di.charge(cpu.rdi);
        state.si.charge(cpu.rsi);
        state.bp.charge(cpu.rbp);
        mtr.remove(Mask::GPR_BSD);
    }

    if mtr.contains(Mask::RIP_LEN) {
        state.ip.charge(cpu.rip);
        state.ip_len.charge(cpu.inst_len);
        mtr.remove(Mask::RIP_LEN);
    }

    if mtr.contains(Mask::RSP) {
        state.sp.charge(cpu.rsp);
        mtr.remove(Mask::RSP);
    }

    if mtr.contains(Mask::RFLAGS) {
        state.flags.charge(cpu.rfl);
        mtr.remove(Mask::RFLAGS);
    }

    if mtr.contains(Mask::DR) {
        state.dr7.charge(cpu.dr7);
        mtr.remove(Mask::DR);
    }

    if mtr.contains(Mask::CR) {
        state.cr0.charge(cpu.cr0);
        state.cr2.charge(cpu.cr2);
        state.cr3.charge(cpu.cr3);
        state.cr4.charge(cpu.cr4);
        mtr.remove(Mask::CR);
    }

    if mtr.contains(Mask::CS_SS) {
        state.cs.charge((&cpu.cs).into());
        state.ss.charge((&cpu.ss).into());
        mtr.remove(Mask::CS_SS);
    }

    if mtr.contains(Mask::DS_ES) {
        state.es.charge((&cpu.es).into());
        state.ds.charge((&cpu.ds).into());
        mtr.remove(Mask::DS_ES);
    }

    if mtr.contains(Mask::FS_GS) {
        state.fs.charge((&cpu.fs).into());
        state.gs.charge((&cpu.gs).into());
        mtr.remove(Mask::FS_GS);
    }

    if mtr.contains(Mask::TR) {
        state.tr.charge((&cpu.tr).into());
        mtr.remove(Mask::TR);
    }

    if mtr.contains(Mask::LDTR) {
        state.ldtr.charge((&cpu.ld).into());
        mtr.remove(Mask::LDTR);
    }

    if mtr.contains(Mask::GDTR) {
        state.gdtr.charge((&cpu.gd).into());
        mtr.remove(Mask::GDTR);
    }

    if mtr.contains(Mask::IDTR) {
        state.idtr.charge((&cpu.id).into());
        mtr.remove(Mask::IDTR);
    }

    if mtr.contains(Mask::SYSENTER) {
        state.sysenter_cs.charge(cpu.sysenter_cs);
        state.sysenter_sp.charge(cpu.sysenter_esp);
        state.sysenter_ip.charge(cpu.sysenter_eip);
        mtr.remove(Mask::SYSENTER);
    }

    if mtr.contains(Mask::QUAL) {
        // not consumed by the kernel, kept for symmetry
        state.qual_primary.charge(cpu.qual[0]);
        state.qual_secondary.charge(cpu.qual[1]);
        mtr.remove(Mask::QUAL);
    }

    if mtr.contains(Mask::CTRL) {
        state.ctrl_primary.charge(cpu.ctrl[0]);
        state.ctrl_secondary.charge(cpu.ctrl[1]);
        mtr.remove(Mask::CTRL);
    }

    if mtr.contains(Mask::INJ) {
        state.inj_info.charge(cpu.inj_info);
        state.inj_error.charge(cpu.inj_error);
        mtr.remove(Mask::INJ);
    }

    if mtr.contains(Mask::STATE) {
        state.intr_state.charge(cpu.intr_state);
        state.actv_state.charge(cpu.actv_state);
        mtr.remove(Mask::STATE);
    }

    if mtr.contains(Mask::TSC) {
        state.tsc.charge(cpu.tsc_value);
        state.tsc_offset.charge(cpu.tsc_off);
        mtr.remove(Mask::TSC);
    }

    if mtr.contains(Mask::XSAVE) {
        state.xcr0.charge(cpu.xcr0);
        state.xss.charge(cpu.xss);
        mtr.remove(Mask::XSAVE);
    }

    if mtr.contains(Mask::EFER) {
        state.efer.charge(cpu.efer);
        mtr.remove(Mask::EFER);
    }

    if mtr.contains(Mask::R8_R15) {
        state.r8.charge(cpu.r8);
        state.r9.charge(cpu.r9);
        state.r10.charge(cpu.r10);
        state.r11.charge(cpu.r11);
        state.r12.charge(cpu.r12);
        state.r13.charge(cpu.r13);
        state.r14.charge(cpu.r14);
        state.r15.charge(cpu.r15);
        mtr.remove(Mask::R8_R15);
    }

    if mtr.contains(Mask::SYSCALL_SWAPGS) {
        state.star.charge(cpu.star);
        state.cstar.charge(cpu.cstar);
        state.lstar.charge(cpu.lstar);
        state.fmask.charge(cpu.fmask);
        state.kernel_gs_base.charge(cpu.kernel_gs);
        mtr.remove(Mask::SYSCALL_SWAPGS);
    }

    if mtr.contains(Mask::PDPTE) {
        // the dense state never tracks them, the kernel reloads from cr3
        state.pdpte_0.charge(0);
        state.pdpte_1.charge(0);
        state.pdpte_2.charge(0);
        state.pdpte_3.charge(0);
        mtr.remove(Mask::PDPTE);
    }

    if !mtr.is_empty() {
        error!("state transfer incomplete {:#x}", mtr.bits());
    }
}

/// Checks that a register group is charged as a whole.
///
/// Returns whether any member is charged and warns about a partially
/// charged group.
fn group_charged(name: &str, members: &[bool]) -> bool {
    let any = members.iter().any(|c| *c);
    if any && !members.iter().all(|c| *c) {
        warn!("missing state in group {}", name);
    }
    any
}

/// Copies every charged group of `state` into `cpu` and returns the mask of
/// the groups that were copied.
///
/// A partially charged group is copied as a whole and reported.
pub fn read_vcpu_state(state: &VcpuState, cpu: &mut CpuState) -> Mask {
    let mut mtr = Mask::empty();

    if group_charged(
        "gpr_acdb",
        &[
            state.ax.charged(),
            state.cx.charged(),
            state.dx.charged(),
            state.bx.charged(),
        ],
    ) {
        mtr |= Mask::GPR_ACDB;
        cpu.rax = state.ax.value();
        cpu.rcx = state.cx.value();
        cpu.rdx = state.dx.value();
        cpu.rbx = state.bx.value();
    }

    if group_charged(
        "gpr_bsd",
        &[state.bp.charged(), state.di.charged(), state.si.charged()],
    ) {
        mtr |= Mask::GPR_BSD;
        cpu.rdi = state.di.value();
        cpu.rsi = state.si.value();
        cpu.rbp = state.bp.value();
    }

    if state.flags.charged() {
        mtr |= Mask::RFLAGS;
        cpu.rfl = state.flags.value();
    }

    if state.sp.charged() {
        mtr |= Mask::RSP;
        cpu.rsp = state.sp.value();
    }

    if group_charged("rip_len", &[state.ip.charged(), state.ip_len.charged()]) {
        mtr |= Mask::RIP_LEN;
        cpu.rip = state.ip.value();
        cpu.inst_len = state.ip_len.value();
    }

    if state.dr7.charged() {
        mtr |= Mask::DR;
        cpu.dr7 = state.dr7.value();
    }

    if group_charged(
        "cr",
        &[
            state.cr0.charged(),
            state.cr2.charged(),
            state.cr3.charged(),
            state.cr4.charged(),
        ],
    ) {
        mtr |= Mask::CR;
        cpu.cr0 = state.cr0.value();
        cpu.cr2 = state.cr2.value();
        cpu.cr3 = state.cr3.value();
        cpu.cr4 = state.cr4.value();
    }

    if group_charged("cs_ss", &[state.cs.charged(), state.ss.charged()]) {
        mtr |= Mask::CS_SS;
        cpu.cs = state.cs.value().into();
        cpu.ss = state.ss.value().into();
    }

    if group_charged("ds_es", &[state.es.charged(), state.ds.charged()]) {
        mtr |= Mask::DS_ES;
        cpu.es = state.es.value().into();
        cpu.ds = state.ds.value().into();
    }

    if group_charged("fs_gs", &[state.fs.charged(), state.gs.charged()]) {
        mtr |= Mask::FS_GS;
        cpu.fs = state.fs.value().into();
        cpu.gs = state.gs.value().into();
    }

    if state.tr.charged() {
        mtr |= Mask::TR;
        cpu.tr = state.tr.value().into();
    }

    if state.ldtr.charged() {
        mtr |= Mask::LDTR;
        cpu.ld = state.ldtr.value().into();
    }

    if state.gdtr.charged() {
        mtr |= Mask::GDTR;
        cpu.gd = state.gdtr.value().into();
    }

    if state.idtr.charged() {
        mtr |= Mask::IDTR;
        cpu.id = state.idtr.value().into();
    }

    if group_charged(
        "sysenter",
        &[
            state.sysenter_cs.charged(),
            state.sysenter_sp.charged(),
            state.sysenter_ip.charged(),
        ],
    ) {
        mtr |= Mask::SYSENTER;
        cpu.sysenter_cs = state.sysenter_cs.value();
        cpu.sysenter_esp = state.sysenter_sp.value();
        cpu.sysenter_eip = state.sysenter_ip.value();
    }

    if group_charged(
        "ctrl",
        &[state.ctrl_primary.charged(), state.ctrl_secondary.charged()],
    ) {
        mtr |= Mask::CTRL;
        cpu.ctrl[0] = state.ctrl_primary.value();
        cpu.ctrl[1] = state.ctrl_secondary.value();
    }

    if group_charged("inj", &[state.inj_info.charged(), state.inj_error.charged()]) {
        mtr |= Mask::INJ;
        cpu.inj_info = state.inj_info.value();
        cpu.inj_error = state.inj_error.value();
    }

    if group_charged(
        "state",
        &[state.intr_state.charged(), state.actv_state.charged()],
    ) {
        mtr |= Mask::STATE;
        cpu.intr_state = state.intr_state.value();
        cpu.actv_state = state.actv_state.value();
    }

    if group_charged("tsc", &[state.tsc.charged(), state.tsc_offset.charged()]) {
        mtr |= Mask::TSC;
        cpu.tsc_value = state.tsc.value();
        cpu.tsc_off = state.tsc_offset.value();
    }

    if group_charged("xsave", &[state.xcr0.charged(), state.xss.charged()]) {
        mtr |= Mask::XSAVE;
        cpu.xcr0 = state.xcr0.value();
        cpu.xss = state.xss.value();
    }

    if group_charged(
        "qual",
        &[state.qual_primary.charged(), state.qual_secondary.charged()],
    ) {
        mtr |= Mask::QUAL;
        cpu.qual[0] = state.qual_primary.value();
        cpu.qual[1] = state.qual_secondary.value();
    }

    if state.efer.charged() {
        mtr |= Mask::EFER;
        cpu.efer = state.efer.value();
    }

    if group_charged(
        "r8_r15",
        &[
            state.r8.charged(),
            state.r9.charged(),
            state.r10.charged(),
            state.r11.charged(),
            state.r12.charged(),
            state.r13.charged(),
            state.r14.charged(),
            state.r15.charged(),
        ],
    ) {
        mtr |= Mask::R8_R15;
        cpu.r8 = state.r8.value();
        cpu.r9 = state.r9.value();
        cpu.r10 = state.r10.value();
        cpu.r11 = state.r11.value();
        cpu.r12 = state.r12.value();
        cpu.r13 = state.r13.value();
        cpu.r14 = state.r14.value();
        cpu.r15 = state.r15.value();
    }

    if group_charged(
        "syscall_swapgs",
        &[
            state.star.charged(),
            state.lstar.charged(),
            state.cstar.charged(),
            state.fmask.charged(),
            state.kernel_gs_base.charged(),
        ],
    ) {
        mtr |= Mask::SYSCALL_SWAPGS;
        cpu.star = state.star.value();
        cpu.cstar = state.cstar.value();
        cpu.lstar = state.lstar.value();
        cpu.fmask = state.fmask.value();
        cpu.kernel_gs = state.kernel_gs_base.value();
    }

    if state.pdpte_0.charged()
        || state.pdpte_1.charged()
        || state.pdpte_2.charged()
        || state.pdpte_3.charged()
    {
        warn!(
            "pdpte not supported {:#x} {:#x} {:#x} {:#x}",
            state.pdpte_0.value(),
            state.pdpte_1.value(),
            state.pdpte_2.value(),
            state.pdpte_3.value()
        );
    }

    if state.tpr.charged() || state.tpr_threshold.charged() {
        warn!("tpr not supported");
    }

    mtr
}

/// Logs every register of the groups in `mask` whose kernel and dense values
/// differ.
pub fn dump(mask: Mask, state: &VcpuState, cpu: &CpuState) {
    fn reg(name: &str, host: u64, dense: u64) {
        let diff = host ^ dense;
        if diff != 0 {
            info!("{} {:#018x} {:#018x} ^:{:#x}", name, host, dense, diff);
        }
    }

    fn seg(name: &str, host: Segment, dense: &Descriptor) {
        reg(&format!("{} sel", name), host.sel as u64, dense.sel as u64);
        reg(&format!("{} ar", name), host.ar as u64, dense.ar as u64);
        reg(&format!("{} limit", name), host.limit as u64, dense.limit as u64);
        reg(&format!("{} base", name), host.base, dense.base);
    }

    fn table(name: &str, host: Range, dense: &DescriptorTable) {
        reg(&format!("{} limit", name), host.limit as u64, dense.limit as u64);
        reg(&format!("{} base", name), host.base, dense.base);
    }

    let mut mtr = mask;

    if mtr.contains(Mask::GPR_ACDB) {
        reg("rax", state.ax.value(), cpu.rax);
        reg("rcx", state.cx.value(), cpu.rcx);
        reg("rdx", state.dx.value(), cpu.rdx);
        reg("rbx", state.bx.value(), cpu.rbx);
        mtr.remove(Mask::GPR_ACDB);
    }
    if mtr.contains(Mask::GPR_BSD) {
        reg("rdi", state.di.value(), cpu.rdi);
        reg("rsi", state.si.value(), cpu.rsi);
        reg("rbp", state.bp.value(), cpu.rbp);
        mtr.remove(Mask::GPR_BSD);
    }
    if mtr.contains(Mask::RIP_LEN) {
        reg("rip", state.ip.value(), cpu.rip);
        reg("ip_len", state.ip_len.value(), cpu.inst_len);
        mtr.remove(Mask::RIP_LEN);
    }
    if mtr.contains(Mask::RSP) {
        reg("rsp", state.sp.value(), cpu.rsp);
        mtr.remove(Mask::RSP);
    }
    if mtr.contains(Mask::RFLAGS) {
        reg("rfl", state.flags.value(), cpu.rfl);
        mtr.remove(Mask::RFLAGS);
    }
    if mtr.contains(Mask::DR) {
        reg("dr7", state.dr7.value(), cpu.dr7);
        mtr.remove(Mask::DR);
    }
    if mtr.contains(Mask::CR) {
        reg("cr0", state.cr0.value(), cpu.cr0);
        reg("cr2", state.cr2.value(), cpu.cr2);
        reg("cr3", state.cr3.value(), cpu.cr3);
        reg("cr4", state.cr4.value(), cpu.cr4);
        mtr.remove(Mask::CR);
    }
    if mtr.contains(Mask::CS_SS) {
        seg("cs", state.cs.value(), &cpu.cs);
        seg("ss", state.ss.value(), &cpu.ss);
        mtr.remove(Mask::CS_SS);
    }
    if mtr.contains(Mask::DS_ES) {
        seg("ds", state.ds.value(), &cpu.ds);
        seg("es", state.es.value(), &cpu.es);
        mtr.remove(Mask::DS_ES);
    }
    if mtr.contains(Mask::FS_GS) {
        seg("fs", state.fs.value(), &cpu.fs);
        seg("gs", state.gs.value(), &cpu.gs);
        mtr.remove(Mask::FS_GS);
    }
    if mtr.contains(Mask::TR) {
        seg("tr", state.tr.value(), &cpu.tr);
        mtr.remove(Mask::TR);
    }
    if mtr.contains(Mask::LDTR) {
        seg("ldtr", state.ldtr.value(), &cpu.ld);
        mtr.remove(Mask::LDTR);
    }
    if mtr.contains(Mask::GDTR) {
        table("gdtr", state.gdtr.value(), &cpu.gd);
        mtr.remove(Mask::GDTR);
    }
    if mtr.contains(Mask::IDTR) {
        table("idtr", state.idtr.value(), &cpu.id);
        mtr.remove(Mask::IDTR);
    }
    if mtr.contains(Mask::SYSENTER) {
        reg("sysenter_cs", state.sysenter_cs.value(), cpu.sysenter_cs);
        reg("sysenter_sp", state.sysenter_sp.value(), cpu.sysenter_esp);
        reg("sysenter_ip", state.sysenter_ip.value(), cpu.sysenter_eip);
        mtr.remove(Mask::SYSENTER);
    }
    if mtr.contains(Mask::QUAL) {
        reg("qual_primary", state.qual_primary.value(), cpu.qual[0]);
        reg("qual_secondary", state.qual_secondary.value(), cpu.qual[1]);
        mtr.remove(Mask::QUAL);
    }
    if mtr.contains(Mask::CTRL) {
        reg("ctrl_primary", state.ctrl_primary.value() as u64, cpu.ctrl[0] as u64);
        reg("ctrl_secondary", state.ctrl_secondary.value() as u64, cpu.ctrl[1] as u64);
        mtr.remove(Mask::CTRL);
    }
    if mtr.contains(Mask::INJ) {
        reg("inj_info", state.inj_info.value() as u64, cpu.inj_info as u64);
        reg("inj_error", state.inj_error.value() as u64, cpu.inj_error as u64);
        mtr.remove(Mask::INJ);
    }
    if mtr.contains(Mask::STATE) {
        reg("intr_state", state.intr_state.value() as u64, cpu.intr_state as u64);
        reg("actv_state", state.actv_state.value() as u64, cpu.actv_state as u64);
        mtr.remove(Mask::STATE);
    }
    if mtr.contains(Mask::TSC) {
        reg("tsc", state.tsc.value(), cpu.tsc_value);
        reg("tsc_off", state.tsc_offset.value(), cpu.tsc_off);
        mtr.remove(Mask::TSC);
    }
    if mtr.contains(Mask::XSAVE) {
        reg("xcr0", state.xcr0.value(), cpu.xcr0);
        reg("xss", state.xss.value(), cpu.xss);
        mtr.remove(Mask::XSAVE);
    }
    if mtr.contains(Mask::EFER) {
        reg("efer", state.efer.value(), cpu.efer);
        mtr.remove(Mask::EFER);
    }
    if mtr.contains(Mask::R8_R15) {
        reg("r8", state.r8.value(), cpu.r8);
        reg("r9", state.r9.value(), cpu.r9);
        reg("r10", state.r10.value(), cpu.r10);
        reg("r11", state.r11.value(), cpu.r11);
        reg("r12", state.r12.value(), cpu.r12);
        reg("r13", state.r13.value(), cpu.r13);
        reg("r14", state.r14.value(), cpu.r14);
        reg("r15", state.r15.value(), cpu.r15);
        mtr.remove(Mask::R8_R15);
    }
    if mtr.contains(Mask::SYSCALL_SWAPGS) {
        reg("star", state.star.value(), cpu.star);
        reg("cstar", state.cstar.value(), cpu.cstar);
        reg("lstar", state.lstar.value(), cpu.lstar);
        reg("fmask", state.fmask.value(), cpu.fmask);
        reg("kernel_gs_base", state.kernel_gs_base.value(), cpu.kernel_gs);
        mtr.remove(Mask::SYSCALL_SWAPGS);
    }
    if mtr.contains(Mask::PDPTE) {
        reg("pdpte_0", state.pdpte_0.value(), cpu.pdpte[0]);
        reg("pdpte_1", state.pdpte_1.value(), cpu.pdpte[1]);
        reg("pdpte_2", state.pdpte_2.value(), cpu.pdpte[2]);
        reg("pdpte_3", state.pdpte_3.value(), cpu.pdpte[3]);
        mtr.remove(Mask::PDPTE);
    }

    if !mtr.is_empty() {
        error!("unknown state to dump {:#x}", mtr.bits());
    }
}
