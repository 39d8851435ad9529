//! A minimal Intel VT-x virtual-machine monitor.
//!
//! The crate brings a processor core into VMX root operation, builds an
//! extended page table for a small flat guest, launches the guest and
//! services VM-exits until the guest terminates, then tears everything
//! down again. One [`Hypervisor`] instance covers one enable → launch →
//! shutdown lifecycle.

#![cfg_attr(not(test), no_std)]
#![feature(allocator_api)]
#![feature(new_uninit)]

extern crate alloc;

use crate::{
    error::HypervisorError,
    intel::{
        paging::GUEST_IMAGE_SIZE,
        vcpu::Vcpu,
    },
    utils::{instructions::InterruptGuard, processor::ProcessorExecutor},
};

pub mod error;
pub mod intel;
pub mod utils;

/// The core every guest lifecycle is pinned to. VMX root state is per-core,
/// so enable, launch and teardown must all run on the same one.
pub const BOOTSTRAP_PROCESSOR: u32 = 0;

/// The per-lifecycle virtualization context.
///
/// Created by the control interface when virtualization is enabled and
/// destroyed at shutdown. The context is passed by reference everywhere so
/// independent lifecycles can coexist; nothing in this crate lives in
/// global storage.
pub struct Hypervisor {
    vcpu: Vcpu,
}

impl Hypervisor {
    /// Checks hardware support and creates an empty context.
    ///
    /// No hardware state is touched yet; that happens in [`Self::enable`].
    pub fn new() -> Result<Self, HypervisorError> {
        /* Intel® 64 and IA-32 Architectures Software Developer's Manual: 24.6 DISCOVERING SUPPORT FOR VMX */
        Self::has_intel_cpu()?;
        Self::has_vmx_support()?;
        log::info!("Virtual Machine Extension (VMX) technology is supported");

        Ok(Self { vcpu: Vcpu::new() })
    }

    /// Enters VMX root operation on the bootstrap processor.
    pub fn enable(&mut self) -> Result<(), HypervisorError> {
        let Some(executor) = ProcessorExecutor::switch_to_processor(BOOTSTRAP_PROCESSOR) else {
            return Err(HypervisorError::ProcessorSwitchFailed(BOOTSTRAP_PROCESSOR));
        };

        let result = self.vcpu.enable();

        core::mem::drop(executor);
        result
    }

    /// Runs one guest image to completion.
    ///
    /// Activates a fresh VMCS, builds the guest address space, initializes
    /// every control field, copies the image in and enters the guest. The
    /// call returns once the guest hits a terminal exit (or an entry
    /// fails). Guest-memory-related allocations are released before
    /// returning, successful or not.
    pub fn launch(&mut self, image: &[u8; GUEST_IMAGE_SIZE]) -> Result<(), HypervisorError> {
        let Some(executor) = ProcessorExecutor::switch_to_processor(BOOTSTRAP_PROCESSOR) else {
            return Err(HypervisorError::ProcessorSwitchFailed(BOOTSTRAP_PROCESSOR));
        };

        let result = self.launch_on_core(image);

        if let Err(ref error) = result {
            log::error!("Launch failed: {}", error);
            // A setup step bailed out early; whatever it had already
            // allocated must not outlive the attempt.
            self.vcpu.release_address_space();
        }

        core::mem::drop(executor);
        result
    }

    fn launch_on_core(&mut self, image: &[u8; GUEST_IMAGE_SIZE]) -> Result<(), HypervisorError> {
        self.vcpu.activate_vmcs()?;

        let eptp = self.vcpu.build_address_space()?;

        self.vcpu.initialize_control_fields(eptp)?;

        self.vcpu.load_guest_image(image);

        // No host interrupt may preempt the core between the register
        // snapshot and the first entry.
        let interrupt_guard = InterruptGuard::disable();
        let result = self.vcpu.run();
        self.vcpu.release_address_space();
        core::mem::drop(interrupt_guard);

        result
    }

    /// Tears the lifecycle down and leaves VMX root operation.
    ///
    /// Safe to call more than once: resources that are already gone are
    /// reported and skipped, and VMXOFF only executes while the core is
    /// still in root operation.
    pub fn shutdown(&mut self) -> Result<(), HypervisorError> {
        let Some(executor) = ProcessorExecutor::switch_to_processor(BOOTSTRAP_PROCESSOR) else {
            return Err(HypervisorError::ProcessorSwitchFailed(BOOTSTRAP_PROCESSOR));
        };

        let result = self.vcpu.shutdown();

        core::mem::drop(executor);
        result
    }

    /// Check to see if CPU is Intel (“GenuineIntel”).
    fn has_intel_cpu() -> Result<(), HypervisorError> {
        let cpuid = x86::cpuid::CpuId::new();
        if let Some(vi) = cpuid.get_vendor_info() {
            if vi.as_str() == "GenuineIntel" {
                return Ok(());
            }
        }
        Err(HypervisorError::CPUUnsupported)
    }

    /// Check processor support for Virtual Machine Extension (VMX) technology - CPUID.1:ECX.VMX\[bit 5] = 1
    fn has_vmx_support() -> Result<(), HypervisorError> {
        let cpuid = x86::cpuid::CpuId::new();
        if let Some(fi) = cpuid.get_feature_info() {
            if fi.has_vmx() {
                return Ok(());
            }
        }
        Err(HypervisorError::VMXUnsupported)
    }
}

impl Drop for Hypervisor {
    fn drop(&mut self) {
        match self.shutdown() {
            Ok(_) => log::info!("Hypervisor shut down"),
            Err(error) => log::error!("Failed to shut down hypervisor: {}", error),
        }
    }
}
