//! Thin wrappers around the VMX instructions.
//!
//! Every privileged VMX instruction the crate issues goes through exactly
//! one function here; the CF/ZF status convention the hardware reports
//! through RFLAGS is surfaced as a [`HypervisorError`] by the `x86` crate
//! underneath. Nothing else in the crate inlines instruction sequences.

use crate::error::HypervisorError;

/// Enable VMX operation on the region at the given physical address.
pub fn vmxon(vmxon_region_pa: u64) -> Result<(), HypervisorError> {
    unsafe { x86::bits64::vmx::vmxon(vmxon_region_pa) }.map_err(|_| HypervisorError::VMXONFailed)
}

/// Disable VMX operation.
pub fn vmxoff() -> Result<(), HypervisorError> {
    unsafe { x86::bits64::vmx::vmxoff() }.map_err(|_| HypervisorError::VMXOFFFailed)
}

/// Clear the VMCS region at the given physical address.
pub fn vmclear(vmcs_region_pa: u64) -> Result<(), HypervisorError> {
    unsafe { x86::bits64::vmx::vmclear(vmcs_region_pa) }.map_err(|_| HypervisorError::VMCLEARFailed)
}

/// Make the VMCS region at the given physical address active and current.
pub fn vmptrld(vmcs_region_pa: u64) -> Result<(), HypervisorError> {
    unsafe { x86::bits64::vmx::vmptrld(vmcs_region_pa) }.map_err(|_| HypervisorError::VMPTRLDFailed)
}

/// Read a field from the current VMCS.
///
/// A failed read yields 0. The readers are diagnostics and host-to-guest
/// field copies, neither of which can do anything better with the failure.
pub fn vmread(field: u32) -> u64 {
    unsafe { x86::bits64::vmx::vmread(field) }.unwrap_or(0)
}

/// Write a field of the current VMCS.
pub fn vmwrite<T: Into<u64>>(field: u32, value: T) -> Result<(), HypervisorError>
where
    u64: From<T>,
{
    unsafe { x86::bits64::vmx::vmwrite(field, u64::from(value)) }
        .map_err(|_| HypervisorError::VMWRITEFailed(field))
}
