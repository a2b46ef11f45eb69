// Copyright 2025 The Axvisor Team
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! hostvmm - vCPU exit handling and guest memory of a hosted x86 VMM.
//!
//! The VMM runs as an ordinary process on top of a microkernel that provides
//! hardware-assisted virtualization (AMD SVM or Intel VMX). The kernel
//! delivers every VM exit to a per-vCPU handler together with a sparse
//! register state; this crate decodes the exit, moves the needed register
//! groups into a dense CPU model, lets the device model emulate the
//! instruction and writes the changed groups back for the next entry.
//!
//! # Features
//!
//! - Exit dispatch for both SVM and VMX exit numbering
//! - Mask-driven state transfer between kernel and device model
//! - Guest RAM backed by host dataspaces, with an IO hole below 4 GiB
//! - Lazy second-level mapping on nested page faults
//! - vCPU startup, block and power-off through single-slot gates
//! - One host timer multiplexed onto the timeouts of all device models

#[macro_use]
extern crate log;

// Core modules
mod config; // VMM startup configuration
mod cpu_state; // Dense CPU model shared with the device model
mod exit; // SVM and VMX exit reasons and their transfer masks
mod gate; // Single-slot wakeup gate
mod guest_memory; // Guest RAM regions and second-level attachment
mod hal; // Kernel and host interfaces
mod machine; // Host operations of the device-model bus
mod mask; // Register group masks
mod message; // Device-model bus contracts
mod timeout; // Timeout multiplexing onto the host timer
mod transfer; // Sparse <-> dense state transfer
mod vcpu; // Per-vCPU exit handler and lifecycle
mod vcpu_state; // Sparse kernel vCPU state
mod test; // Mock platform and end-to-end tests

// Public API exports
pub use config::{BootModule, VmmConfig};
pub use cpu_state::*;
pub use exit::{ExitReason, SvmExit, VirtFlavor, VmxExit};
pub use gate::Gate;
pub use guest_memory::{GuestMemory, IO_MEM_BASE, IO_MEM_SIZE};
pub use hal::*;
pub use machine::{Machine, Platform, MAX_VCPUS};
pub use mask::Mask;
pub use message::*;
pub use timeout::{LateTimeout, TimeoutList, Timeouts, LATE_WINDOW_MS, TIMEOUT_SLOTS};
pub use transfer::{dump, read_vcpu_state, write_vcpu_state};
pub use vcpu::{Vcpu, VcpuConfig, VcpuRunState};
pub use vcpu_state::*;
