use axerrno::{ax_err, ax_err_type, AxResult};
use memory_addr::align_down_4k;
use serde::Deserialize;

/// A boot module handed to the guest through multiboot.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct BootModule {
    pub name: String,
    #[serde(default)]
    pub cmdline: String,
}

/// Startup configuration of the VMM.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct VmmConfig {
    /// RAM kept for the VMM itself, the rest goes to the guest.
    pub vmm_memory: usize,
    /// Resolve memory faults a page at a time.
    pub map_small: bool,
    pub exit_on_rdtsc: bool,
    /// Place vcpu `n` on host CPU `n` instead of `n + 1`.
    pub vmm_vcpu_same_cpu: bool,
    /// Report the host's CPUID vendor and brand strings to the guest.
    pub cpuid_native: bool,
    pub verbose_mem: bool,
    /// Framebuffer geometry.
    pub width: u32,
    pub height: u32,
    pub multiboot: Vec<BootModule>,
}

impl Default for VmmConfig {
    fn default() -> Self {
        Self {
            vmm_memory: 12 * 1024 * 1024,
            map_small: false,
            exit_on_rdtsc: false,
            vmm_vcpu_same_cpu: false,
            cpuid_native: false,
            verbose_mem: false,
            width: 1024,
            height: 768,
            multiboot: Vec::new(),
        }
    }
}

impl VmmConfig {
    pub fn from_toml(content: &str) -> AxResult<Self> {
        toml::from_str(content)
            .map_err(|err| ax_err_type!(InvalidInput, format!("invalid VMM configuration: {}", err)))
    }

    /// Guest RAM left over from `avail` bytes once the VMM's share is
    /// taken, rounded down to whole pages.
    pub fn guest_ram_size(&self, avail: usize) -> AxResult<usize> {
        match avail.checked_sub(self.vmm_memory).map(align_down_4k) {
            Some(size) if size > 0 => Ok(size),
            _ => ax_err!(
                NoMemory,
                format!("{:#x} bytes available, {:#x} kept for the VMM", avail, self.vmm_memory)
            ),
        }
    }

    pub fn log(&self) {
        info!(" VMM memory {:#x}", self.vmm_memory);
        info!(
            " using {} memory attachments for guest VM.",
            if self.map_small { "small" } else { "large" }
        );
        if self.exit_on_rdtsc {
            info!(" enabling VM exit on RDTSC.");
        }
        info!(" framebuffer {}x{}", self.width, self.height);
        for module in &self.multiboot {
            debug!(" module {} '{}'", module.name, module.cmdline);
        }
    }
}
