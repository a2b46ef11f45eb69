use crate::mask::Mask;

/// The hardware-virtualization flavor of a vCPU. Each flavor numbers its
/// exit reasons independently in `0x00..=0xff`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VirtFlavor {
    /// AMD SVM.
    Svm,
    /// Intel VMX.
    Vmx,
}

/// Exit reasons of an SVM vCPU.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SvmExit {
    /// Read or write of a control register, `0x00..=0x1f`.
    Cr(u8),
    /// System management interrupt, `0x62`.
    Smi,
    /// Virtual interrupt window, `0x64`.
    Vintr,
    /// `0x6e`
    Rdtsc,
    /// `0x72`
    Cpuid,
    /// `0x78`
    Hlt,
    /// Port I/O, `0x7b`.
    Ioio,
    /// `0x7c`
    Msr,
    /// Triple fault, `0x7f`.
    Shutdown,
    /// Nested page fault, `0xfc`.
    Npt,
    /// Invalid guest state, `0xfd`.
    Invalid,
    /// The first exit of a freshly created vCPU, `0xfe`.
    Startup,
    /// Recall requested by the VMM, `0xff`.
    Recall,
}

/// Exit reasons of a VMX vCPU.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VmxExit {
    /// `0x02`
    TripleFault,
    /// INIT signal, `0x03`.
    Init,
    /// Interrupt window, `0x07`.
    IrqWindow,
    /// `0x0a`
    Cpuid,
    /// `0x0c`
    Hlt,
    /// `0x10`
    Rdtsc,
    /// `0x12`
    Vmcall,
    /// Control-register access, `0x1c`.
    MovCr,
    /// Port I/O, `0x1e`.
    Ioio,
    /// `0x1f`
    MsrRead,
    /// `0x20`
    MsrWrite,
    /// VM entry failed on invalid guest state, `0x21`.
    Invalid,
    /// `0x28`
    Pause,
    /// EPT violation, `0x30`.
    Ept,
    /// The first exit of a freshly created vCPU, `0xfe`.
    Startup,
    /// Recall requested by the VMM, `0xff`.
    Recall,
}

/// A decoded VM exit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExitReason {
    Svm(SvmExit),
    Vmx(VmxExit),
}

impl SvmExit {
    pub fn from_raw(raw: u32) -> Option<Self> {
        Some(match raw {
            0x00..=0x1f => Self::Cr(raw as u8),
            0x62 => Self::Smi,
            0x64 => Self::Vintr,
            0x6e => Self::Rdtsc,
            0x72 => Self::Cpuid,
            0x78 => Self::Hlt,
            0x7b => Self::Ioio,
            0x7c => Self::Msr,
            0x7f => Self::Shutdown,
            0xfc => Self::Npt,
            0xfd => Self::Invalid,
            0xfe => Self::Startup,
            0xff => Self::Recall,
            _ => return None,
        })
    }

    pub const fn raw(self) -> u32 {
        match self {
            Self::Cr(nr) => nr as u32,
            Self::Smi => 0x62,
            Self::Vintr => 0x64,
            Self::Rdtsc => 0x6e,
            Self::Cpuid => 0x72,
            Self::Hlt => 0x78,
            Self::Ioio => 0x7b,
            Self::Msr => 0x7c,
            Self::Shutdown => 0x7f,
            Self::Npt => 0xfc,
            Self::Invalid => 0xfd,
            Self::Startup => 0xfe,
            Self::Recall => 0xff,
        }
    }

    /// Register groups the kernel transfers on this exit.
    pub const fn mask(self) -> Mask {
        match self {
            Self::Cr(_) => Mask::RIP_LEN
                .union(Mask::CS_SS)
                .union(Mask::GPR_ACDB)
                .union(Mask::GPR_BSD)
                .union(Mask::CR)
                .union(Mask::IRQ),
            Self::Cpuid => Mask::RIP_LEN.union(Mask::GPR_ACDB).union(Mask::IRQ),
            Self::Hlt => Mask::RIP_LEN.union(Mask::IRQ),
            Self::Recall | Self::Smi | Self::Vintr => Mask::IRQ,
            Self::Rdtsc => Mask::RIP_LEN
                .union(Mask::GPR_ACDB)
                .union(Mask::TSC)
                .union(Mask::STATE),
            Self::Ioio => Mask::RIP_LEN
                .union(Mask::QUAL)
                .union(Mask::GPR_ACDB)
                .union(Mask::STATE),
            Self::Msr | Self::Shutdown | Self::Invalid | Self::Npt | Self::Startup => Mask::ALL,
        }
    }
}

impl VmxExit {
    pub fn from_raw(raw: u32) -> Option<Self> {
        Some(match raw {
            0x02 => Self::TripleFault,
            0x03 => Self::Init,
            0x07 => Self::IrqWindow,
            0x0a => Self::Cpuid,
            0x0c => Self::Hlt,
            0x10 => Self::Rdtsc,
            0x12 => Self::Vmcall,
            0x1c => Self::MovCr,
            0x1e => Self::Ioio,
            0x1f => Self::MsrRead,
            0x20 => Self::MsrWrite,
            0x21 => Self::Invalid,
            0x28 => Self::Pause,
            0x30 => Self::Ept,
            0xfe => Self::Startup,
            0xff => Self::Recall,
            _ => return None,
        })
    }

    pub const fn raw(self) -> u32 {
        match self {
            Self::TripleFault => 0x02,
            Self::Init => 0x03,
            Self::IrqWindow => 0x07,
            Self::Cpuid => 0x0a,
            Self::Hlt => 0x0c,
            Self::Rdtsc => 0x10,
            Self::Vmcall => 0x12,
            Self::MovCr => 0x1c,
            Self::Ioio => 0x1e,
            Self::MsrRead => 0x1f,
            Self::MsrWrite => 0x20,
            Self::Invalid => 0x21,
            Self::Pause => 0x28,
            Self::Ept => 0x30,
            Self::Startup => 0xfe,
            Self::Recall => 0xff,
        }
    }

    /// Register groups the kernel transfers on this exit.
    pub const fn mask(self) -> Mask {
        match self {
            Self::TripleFault
            | Self::Init
            | Self::MovCr
            | Self::Invalid
            | Self::Ept
            | Self::Startup => Mask::ALL,
            Self::IrqWindow => Mask::IRQ,
            Self::Cpuid => Mask::RIP_LEN.union(Mask::GPR_ACDB).union(Mask::STATE),
            Self::Hlt => Mask::RIP_LEN.union(Mask::IRQ),
            Self::Rdtsc => Mask::RIP_LEN
                .union(Mask::GPR_ACDB)
                .union(Mask::TSC)
                .union(Mask::STATE),
            Self::Vmcall => Mask::RIP_LEN.union(Mask::GPR_ACDB),
            Self::Ioio => Mask::RIP_LEN
                .union(Mask::QUAL)
                .union(Mask::GPR_ACDB)
                .union(Mask::STATE)
                .union(Mask::RFLAGS),
            Self::Pause => Mask::RIP_LEN.union(Mask::STATE),
            // 64-bit guests touch fs/gs, efer and the syscall MSRs as well
            Self::MsrRead | Self::MsrWrite => Mask::RIP_LEN
                .union(Mask::GPR_ACDB)
                .union(Mask::TSC)
                .union(Mask::SYSENTER)
                .union(Mask::STATE)
                .union(Mask::FS_GS)
                .union(Mask::EFER)
                .union(Mask::SYSCALL_SWAPGS)
                .union(Mask::INJ)
                .union(Mask::RFLAGS),
            Self::Recall => Mask::IRQ
                .union(Mask::RIP_LEN)
                .union(Mask::GPR_ACDB)
                .union(Mask::GPR_BSD),
        }
    }
}

impl ExitReason {
    /// Decodes a raw exit reason of a vCPU of the given flavor.
    pub fn decode(flavor: VirtFlavor, raw: u32) -> Option<Self> {
        match flavor {
            VirtFlavor::Svm => SvmExit::from_raw(raw).map(Self::Svm),
            VirtFlavor::Vmx => VmxExit::from_raw(raw).map(Self::Vmx),
        }
    }

    pub const fn raw(self) -> u32 {
        match self {
            Self::Svm(exit) => exit.raw(),
            Self::Vmx(exit) => exit.raw(),
        }
    }

    /// Register groups the kernel transfers on this exit.
    pub const fn mask(self) -> Mask {
        match self {
            Self::Svm(exit) => exit.mask(),
            Self::Vmx(exit) => exit.mask(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_is_flavor_specific() {
        assert_eq!(
            ExitReason::decode(VirtFlavor::Svm, 0x72),
            Some(ExitReason::Svm(SvmExit::Cpuid))
        );
        assert_eq!(
            ExitReason::decode(VirtFlavor::Vmx, 0x0a),
            Some(ExitReason::Vmx(VmxExit::Cpuid))
        );
        // 0x0a is a control-register write on SVM
        assert_eq!(
            ExitReason::decode(VirtFlavor::Svm, 0x0a),
            Some(ExitReason::Svm(SvmExit::Cr(0x0a)))
        );
        assert_eq!(ExitReason::decode(VirtFlavor::Vmx, 0x72), None);
        assert_eq!(ExitReason::decode(VirtFlavor::Svm, 0x20), None);
    }

    #[test]
    fn raw_values_survive_decoding() {
        for raw in 0..=0xffu32 {
            if let Some(exit) = ExitReason::decode(VirtFlavor::Svm, raw) {
                assert_eq!(exit.raw(), raw);
            }
            if let Some(exit) = ExitReason::decode(VirtFlavor::Vmx, raw) {
                assert_eq!(exit.raw(), raw);
            }
        }
    }

    #[test]
    fn instruction_skipping_exits_transfer_rip_and_state() {
        let skipping = [
            ExitReason::Svm(SvmExit::Cpuid),
            ExitReason::Svm(SvmExit::Hlt),
            ExitReason::Svm(SvmExit::Rdtsc),
            ExitReason::Svm(SvmExit::Ioio),
            ExitReason::Vmx(VmxExit::Cpuid),
            ExitReason::Vmx(VmxExit::Hlt),
            ExitReason::Vmx(VmxExit::Rdtsc),
            ExitReason::Vmx(VmxExit::Ioio),
            ExitReason::Vmx(VmxExit::Pause),
            ExitReason::Vmx(VmxExit::MsrRead),
            ExitReason::Vmx(VmxExit::MsrWrite),
        ];
        for exit in skipping {
            assert!(
                exit.mask().contains(Mask::RIP_LEN | Mask::STATE),
                "{:?}",
                exit
            );
        }
    }
}
