//! A module responsible for managing the VMXON region and entering VMX
//! root operation.

use {
    crate::{
        error::HypervisorError,
        intel::{support, vmcs::Vmcs},
        utils::{addresses::PhysicalAddress, alloc::PhysicalAllocator},
    },
    alloc::boxed::Box,
    bitfield::BitMut,
    static_assertions::const_assert_eq,
};

pub const PAGE_SIZE: usize = 0x1000;

/// A representation of the VMXON region in memory.
///
/// The region is handed to the processor when VMX operation is enabled and
/// stays allocated until the core leaves root operation again.
///
/// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: 25.11.5 VMXON Region
#[repr(C, align(4096))]
pub struct Vmxon {
    pub revision_id: u32,
    pub data: [u8; PAGE_SIZE - 4],
}
const_assert_eq!(core::mem::size_of::<Vmxon>(), PAGE_SIZE);

impl Vmxon {
    /// Sets up the VMXON region and enters VMX root operation.
    ///
    /// Enables VMX in CR4, takes care of the feature-control MSR and the
    /// fixed CR0/CR4 bits, then allocates the region into `slot`, stamps
    /// it with the revision identifier and executes VMXON on its physical
    /// address.
    pub fn setup(slot: &mut Option<Box<Vmxon, PhysicalAllocator>>) -> Result<(), HypervisorError> {
        log::info!("Setting up VMXON region");

        /* Intel® 64 and IA-32 Architectures Software Developer's Manual: 24.7 ENABLING AND ENTERING VMX OPERATION */
        Self::enable_vmx_operation()?;

        let mut vmxon_region: Box<Vmxon, PhysicalAllocator> = unsafe {
            Box::try_new_zeroed_in(PhysicalAllocator)
                .map_err(|_| HypervisorError::MemoryAllocationFailed("VMXON region"))?
                .assume_init()
        };

        let vmxon_region_pa = PhysicalAddress::pa_from_va(vmxon_region.as_ref() as *const _ as _);
        if vmxon_region_pa == 0 {
            return Err(HypervisorError::VirtualToPhysicalAddressFailed);
        }
        log::info!("VMXON region physical address: {:#x}", vmxon_region_pa);

        vmxon_region.revision_id = Vmcs::get_vmcs_revision_id();
        vmxon_region.as_mut().revision_id.set_bit(31, false);

        support::vmxon(vmxon_region_pa)?;
        log::info!("VMXON successful");

        *slot = Some(vmxon_region);

        Ok(())
    }

    /// Prepares the control registers and the feature-control MSR for VMXON.
    fn enable_vmx_operation() -> Result<(), HypervisorError> {
        let mut cr4 = unsafe { x86::controlregs::cr4() };
        cr4.set(x86::controlregs::Cr4::CR4_ENABLE_VMX, true);
        unsafe { x86::controlregs::cr4_write(cr4) };

        Self::set_lock_bit()?;

        /* Intel® 64 and IA-32 Architectures Software Developer's Manual: 24.8 RESTRICTIONS ON VMX OPERATION */
        Self::set_cr0_bits();
        Self::set_cr4_bits();

        Ok(())
    }

    /// Sets the lock bit in IA32_FEATURE_CONTROL if the BIOS left it clear.
    ///
    /// Once written the MSR stays locked until reboot. A locked MSR that
    /// forbids VMXON outside SMX is unrecoverable from here.
    fn set_lock_bit() -> Result<(), HypervisorError> {
        const VMX_LOCK_BIT: u64 = 1 << 0;
        const VMXON_OUTSIDE_SMX: u64 = 1 << 2;

        let ia32_feature_control = unsafe { x86::msr::rdmsr(x86::msr::IA32_FEATURE_CONTROL) };

        if (ia32_feature_control & VMX_LOCK_BIT) == 0 {
            unsafe {
                x86::msr::wrmsr(
                    x86::msr::IA32_FEATURE_CONTROL,
                    VMXON_OUTSIDE_SMX | VMX_LOCK_BIT | ia32_feature_control,
                )
            };
        } else if (ia32_feature_control & VMXON_OUTSIDE_SMX) == 0 {
            return Err(HypervisorError::VMXBIOSLock);
        }

        Ok(())
    }

    /// Normalizes CR0 against the hardware-reported fixed bits.
    fn set_cr0_bits() {
        let ia32_vmx_cr0_fixed0 = unsafe { x86::msr::rdmsr(x86::msr::IA32_VMX_CR0_FIXED0) };
        let ia32_vmx_cr0_fixed1 = unsafe { x86::msr::rdmsr(x86::msr::IA32_VMX_CR0_FIXED1) };

        let mut cr0 = unsafe { x86::controlregs::cr0() };

        cr0 |= x86::controlregs::Cr0::from_bits_truncate(ia32_vmx_cr0_fixed0 as usize);
        cr0 &= x86::controlregs::Cr0::from_bits_truncate(ia32_vmx_cr0_fixed1 as usize);

        unsafe { x86::controlregs::cr0_write(cr0) };
    }

    /// Normalizes CR4 against the hardware-reported fixed bits.
    fn set_cr4_bits() {
        let ia32_vmx_cr4_fixed0 = unsafe { x86::msr::rdmsr(x86::msr::IA32_VMX_CR4_FIXED0) };
        let ia32_vmx_cr4_fixed1 = unsafe { x86::msr::rdmsr(x86::msr::IA32_VMX_CR4_FIXED1) };

        let mut cr4 = unsafe { x86::controlregs::cr4() };

        cr4 |= x86::controlregs::Cr4::from_bits_truncate(ia32_vmx_cr4_fixed0 as usize);
        cr4 &= x86::controlregs::Cr4::from_bits_truncate(ia32_vmx_cr4_fixed1 as usize);

        unsafe { x86::controlregs::cr4_write(cr4) };
    }
}
