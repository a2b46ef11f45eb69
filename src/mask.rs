use bitflags::bitflags;

bitflags! {
    /// Register groups exchanged between the kernel's sparse vCPU state and
    /// the dense [`CpuState`](crate::CpuState).
    ///
    /// A mask is the whole contract between the exit handler and the state
    /// transfer: it names the groups to read on exit and to write on resume.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct Mask: u32 {
        /// rax, rcx, rdx, rbx
        const GPR_ACDB = 1 << 0;
        /// rbp, rsi, rdi
        const GPR_BSD = 1 << 1;
        const RSP = 1 << 2;
        /// rip and the length of the exiting instruction
        const RIP_LEN = 1 << 3;
        const RFLAGS = 1 << 4;
        const DS_ES = 1 << 5;
        const FS_GS = 1 << 6;
        const CS_SS = 1 << 7;
        const TR = 1 << 8;
        const LDTR = 1 << 9;
        const GDTR = 1 << 10;
        const IDTR = 1 << 11;
        /// cr0, cr2, cr3, cr4
        const CR = 1 << 12;
        /// dr7
        const DR = 1 << 13;
        const SYSENTER = 1 << 14;
        /// exit qualification
        const QUAL = 1 << 15;
        /// execution controls
        const CTRL = 1 << 16;
        /// event injection info and error code
        const INJ = 1 << 17;
        /// interruptibility and activity state
        const STATE = 1 << 18;
        const TSC = 1 << 19;
        const EFER = 1 << 20;
        /// PAE page-directory pointers, written only
        const PDPTE = 1 << 21;
        const R8_R15 = 1 << 22;
        /// star, lstar, cstar, fmask, kernel_gs_base
        const SYSCALL_SWAPGS = 1 << 23;
        /// xcr0, xss
        const XSAVE = 1 << 24;
    }
}

impl Mask {
    /// Groups needed to decide on and perform interrupt injection.
    pub const IRQ: Self = Self::RFLAGS
        .union(Self::STATE)
        .union(Self::INJ)
        .union(Self::TSC);

    /// Every group that round-trips through the state transfer.
    pub const ALL: Self = Self::all().difference(Self::PDPTE);
}

#[cfg(test)]
mod tests {
    use super::Mask;

    #[test]
    fn irq_is_a_subset_of_all() {
        assert!(Mask::ALL.contains(Mask::IRQ));
        assert!(!Mask::ALL.contains(Mask::PDPTE));
        assert_eq!(Mask::ALL.bits().count_ones(), 24);
    }
}
