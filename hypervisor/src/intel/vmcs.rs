//! The per-guest control structure: region lifecycle and field setup.
//!
//! The region must be active and current before any field is written, so
//! [`Vmcs::activate`] always ends with VMPTRLD and every (re)activation
//! swaps in a freshly allocated region. Field initialization is a single
//! unconditional pass; any failed write aborts the launch attempt.

use {
    crate::{
        error::HypervisorError,
        intel::{
            controls::{adjusted_vmx_controls, VmxControl},
            paging::{GUEST_CR3, GUEST_RIP, GUEST_RSP},
            segmentation::SegmentDescriptor,
            support::{vmclear, vmptrld, vmread, vmwrite},
        },
        utils::{
            addresses::PhysicalAddress,
            alloc::PhysicalAllocator,
            instructions::{sgdt, sidt},
        },
    },
    alloc::boxed::Box,
    bitfield::BitMut,
    static_assertions::const_assert_eq,
    x86::{
        controlregs, msr,
        segmentation::{self},
        task,
        vmx::vmcs::{
            control,
            control::{EntryControls, ExitControls, PrimaryControls, SecondaryControls},
            guest, host,
        },
    },
};

pub const PAGE_SIZE: usize = 0x1000;

/// Only the architecturally fixed bit 1; interrupts start off in the guest.
const GUEST_INITIAL_RFLAGS: u64 = 2;

/// Masks off RPL/TI; host selector fields demand both clear.
const SELECTOR_MASK: u16 = 0xF8;

/// Represents the VMCS region in memory.
///
/// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: 25.2 FORMAT OF THE VMCS REGION
#[repr(C, align(4096))]
pub struct Vmcs {
    pub revision_id: u32,
    pub abort_indicator: u32,
    pub reserved: [u8; PAGE_SIZE - 8],
}
const_assert_eq!(core::mem::size_of::<Vmcs>(), PAGE_SIZE);

impl Vmcs {
    /// Allocates (or reallocates) the VMCS region and makes it current.
    ///
    /// Any prior region in `slot` is freed first, so repeated activation
    /// never leaks and a stale handle never stays reachable. The fresh
    /// region is stamped with the revision identifier, cleared with
    /// VMCLEAR and loaded with VMPTRLD before this returns.
    pub fn activate(slot: &mut Option<Box<Vmcs, PhysicalAllocator>>) -> Result<(), HypervisorError> {
        slot.take();

        let mut vmcs_region: Box<Vmcs, PhysicalAllocator> = unsafe {
            Box::try_new_zeroed_in(PhysicalAllocator)
                .map_err(|_| HypervisorError::MemoryAllocationFailed("VMCS region"))?
                .assume_init()
        };

        let vmcs_region_pa = PhysicalAddress::pa_from_va(vmcs_region.as_ref() as *const _ as _);
        if vmcs_region_pa == 0 {
            return Err(HypervisorError::VirtualToPhysicalAddressFailed);
        }
        log::info!("VMCS region physical address: {:#x}", vmcs_region_pa);

        vmcs_region.revision_id = Self::get_vmcs_revision_id();
        vmcs_region.as_mut().revision_id.set_bit(31, false);

        vmclear(vmcs_region_pa)?;
        vmptrld(vmcs_region_pa)?;
        log::info!("VMCS region active and current");

        *slot = Some(vmcs_region);

        Ok(())
    }

    /// Initialize the VMCS control fields for the currently loaded VMCS.
    ///
    /// Every value is derived from the hardware capability reports with the
    /// features this monitor relies on OR'd in: secondary controls + EPT on
    /// the processor-based pair, IA-32e guest on entry, 64-bit host on
    /// exit. The exception bitmap ignores everything.
    ///
    /// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual:
    /// - 25.6 VM-EXECUTION CONTROL FIELDS
    /// - 25.7 VM-EXIT CONTROL FIELDS
    /// - 25.8 VM-ENTRY CONTROL FIELDS
    #[rustfmt::skip]
    pub fn setup_control_fields(eptp: u64) -> Result<(), HypervisorError> {
        vmwrite(control::PINBASED_EXEC_CONTROLS, adjusted_vmx_controls(VmxControl::PinBased, 0))?;
        vmwrite(control::PRIMARY_PROCBASED_EXEC_CONTROLS, adjusted_vmx_controls(VmxControl::ProcessorBased, PrimaryControls::SECONDARY_CONTROLS.bits()))?;
        vmwrite(control::SECONDARY_PROCBASED_EXEC_CONTROLS, adjusted_vmx_controls(VmxControl::ProcessorBased2, SecondaryControls::ENABLE_EPT.bits()))?;
        vmwrite(control::VMEXIT_CONTROLS, adjusted_vmx_controls(VmxControl::VmExit, ExitControls::HOST_ADDRESS_SPACE_SIZE.bits()))?;
        vmwrite(control::VMENTRY_CONTROLS, adjusted_vmx_controls(VmxControl::VmEntry, EntryControls::IA32E_MODE_GUEST.bits()))?;

        // No exception ever reflects back to the host.
        vmwrite(control::EXCEPTION_BITMAP, 0u64)?;

        vmwrite(control::EPTP_FULL, eptp)?;

        Ok(())
    }

    /// Initialize the host-state area from the executing context.
    ///
    /// The running context becomes the handler that services every future
    /// exit. HOST_RSP and HOST_RIP are the entry stub's to write.
    ///
    /// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: 25.5 HOST-STATE AREA
    #[rustfmt::skip]
    pub fn setup_host_state() -> Result<(), HypervisorError> {
        unsafe {
            vmwrite(host::CR0, controlregs::cr0().bits() as u64)?;
            vmwrite(host::CR3, controlregs::cr3())?;
            vmwrite(host::CR4, controlregs::cr4().bits() as u64)?;
        }

        vmwrite(host::ES_SELECTOR, segmentation::es().bits() & SELECTOR_MASK)?;
        vmwrite(host::CS_SELECTOR, segmentation::cs().bits() & SELECTOR_MASK)?;
        vmwrite(host::SS_SELECTOR, segmentation::ss().bits() & SELECTOR_MASK)?;
        vmwrite(host::DS_SELECTOR, segmentation::ds().bits() & SELECTOR_MASK)?;
        vmwrite(host::FS_SELECTOR, segmentation::fs().bits() & SELECTOR_MASK)?;
        vmwrite(host::GS_SELECTOR, segmentation::gs().bits() & SELECTOR_MASK)?;
        unsafe { vmwrite(host::TR_SELECTOR, task::tr().bits() & SELECTOR_MASK)? };

        let gdtr = sgdt();
        let idtr = sidt();

        unsafe {
            vmwrite(host::FS_BASE, msr::rdmsr(msr::IA32_FS_BASE))?;
            vmwrite(host::GS_BASE, msr::rdmsr(msr::IA32_GS_BASE))?;
            vmwrite(host::TR_BASE, SegmentDescriptor::from_selector(task::tr(), &gdtr).base_address)?;
        }
        vmwrite(host::GDTR_BASE, gdtr.base as u64)?;
        vmwrite(host::IDTR_BASE, idtr.base as u64)?;

        unsafe {
            vmwrite(host::IA32_SYSENTER_CS, msr::rdmsr(msr::IA32_SYSENTER_CS))?;
            vmwrite(host::IA32_SYSENTER_ESP, msr::rdmsr(msr::IA32_SYSENTER_ESP))?;
            vmwrite(host::IA32_SYSENTER_EIP, msr::rdmsr(msr::IA32_SYSENTER_EIP))?;
        }

        Ok(())
    }

    /// Initialize the guest-state area.
    ///
    /// The guest starts with the host's flat ring-0 segment layout (copied
    /// from the freshly written host fields), unbounded limits and fixed
    /// access rights. CR3 points at the bootstrap tables inside guest
    /// memory; RIP/RSP are the fixed entry point and stack.
    ///
    /// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: 25.4 GUEST-STATE AREA
    #[rustfmt::skip]
    pub fn setup_guest_state() -> Result<(), HypervisorError> {
        vmwrite(guest::ES_SELECTOR, vmread(host::ES_SELECTOR))?;
        vmwrite(guest::CS_SELECTOR, vmread(host::CS_SELECTOR))?;
        vmwrite(guest::SS_SELECTOR, vmread(host::SS_SELECTOR))?;
        vmwrite(guest::DS_SELECTOR, vmread(host::DS_SELECTOR))?;
        vmwrite(guest::FS_SELECTOR, vmread(host::FS_SELECTOR))?;
        vmwrite(guest::GS_SELECTOR, vmread(host::GS_SELECTOR))?;
        vmwrite(guest::LDTR_SELECTOR, 0u64)?;
        vmwrite(guest::TR_SELECTOR, vmread(host::TR_SELECTOR))?;

        vmwrite(guest::ES_LIMIT, u32::MAX)?;
        vmwrite(guest::CS_LIMIT, u32::MAX)?;
        vmwrite(guest::SS_LIMIT, u32::MAX)?;
        vmwrite(guest::DS_LIMIT, u32::MAX)?;
        vmwrite(guest::FS_LIMIT, u32::MAX)?;
        vmwrite(guest::GS_LIMIT, u32::MAX)?;
        vmwrite(guest::LDTR_LIMIT, u32::MAX)?;
        vmwrite(guest::TR_LIMIT, 0x67u64)?;
        vmwrite(guest::GDTR_LIMIT, 0xffffu64)?;
        vmwrite(guest::IDTR_LIMIT, 0xffffu64)?;

        /* Table 25-2. Format of Access Rights: fixed 64-bit ring-0 encodings */
        vmwrite(guest::ES_ACCESS_RIGHTS, if vmread(guest::ES_SELECTOR) == 0 { 0x10000u64 } else { 0xc093 })?;
        vmwrite(guest::CS_ACCESS_RIGHTS, 0xa09bu64)?;
        vmwrite(guest::SS_ACCESS_RIGHTS, 0xc093u64)?;
        vmwrite(guest::DS_ACCESS_RIGHTS, if vmread(guest::DS_SELECTOR) == 0 { 0x10000u64 } else { 0xc093 })?;
        vmwrite(guest::FS_ACCESS_RIGHTS, if vmread(guest::FS_SELECTOR) == 0 { 0x10000u64 } else { 0xc093 })?;
        vmwrite(guest::GS_ACCESS_RIGHTS, if vmread(guest::GS_SELECTOR) == 0 { 0x10000u64 } else { 0xc093 })?;
        vmwrite(guest::LDTR_ACCESS_RIGHTS, 0x10000u64)?;
        vmwrite(guest::TR_ACCESS_RIGHTS, 0x8bu64)?;

        vmwrite(guest::ES_BASE, 0u64)?;
        vmwrite(guest::CS_BASE, 0u64)?;
        vmwrite(guest::SS_BASE, 0u64)?;
        vmwrite(guest::DS_BASE, 0u64)?;
        vmwrite(guest::FS_BASE, vmread(host::FS_BASE))?;
        vmwrite(guest::GS_BASE, vmread(host::GS_BASE))?;
        vmwrite(guest::LDTR_BASE, 0u64)?;
        vmwrite(guest::TR_BASE, vmread(host::TR_BASE))?;
        vmwrite(guest::GDTR_BASE, vmread(host::GDTR_BASE))?;
        vmwrite(guest::IDTR_BASE, vmread(host::IDTR_BASE))?;

        // The guest shares the host's CR0/CR4 but walks its own bootstrap
        // tables from the first instruction.
        vmwrite(guest::CR0, vmread(host::CR0))?;
        vmwrite(guest::CR3, GUEST_CR3)?;
        vmwrite(guest::CR4, vmread(host::CR4))?;

        vmwrite(guest::RSP, GUEST_RSP)?;
        vmwrite(guest::RIP, GUEST_RIP)?;
        vmwrite(guest::RFLAGS, GUEST_INITIAL_RFLAGS)?;

        vmwrite(guest::IA32_SYSENTER_CS, vmread(host::IA32_SYSENTER_CS))?;
        vmwrite(guest::IA32_SYSENTER_ESP, vmread(host::IA32_SYSENTER_ESP))?;
        vmwrite(guest::IA32_SYSENTER_EIP, vmread(host::IA32_SYSENTER_EIP))?;
        vmwrite(guest::IA32_DEBUGCTL_FULL, 0u64)?;

        // No pending events, and no shadow VMCS chained behind this one.
        vmwrite(guest::INTERRUPTIBILITY_STATE, 0u64)?;
        vmwrite(guest::ACTIVITY_STATE, 0u64)?;
        vmwrite(guest::LINK_PTR_FULL, u64::MAX)?;

        Ok(())
    }

    /// Get the Virtual Machine Control Structure revision identifier (VMCS revision ID)
    pub fn get_vmcs_revision_id() -> u32 {
        unsafe { (msr::rdmsr(msr::IA32_VMX_BASIC) as u32) & 0x7FFF_FFFF }
    }
}
