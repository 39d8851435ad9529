//! Physical-address conversion.
//!
//! The hardware pointer fields (VMXON/VMCS pointers, the translation
//! levels, the EPTP) all take physical addresses; this is the one place
//! virtual addresses are converted.

use {
    wdk_sys::ntddk::MmGetPhysicalAddress,
    x86::bits64::paging::{PAddr, BASE_PAGE_SHIFT},
};

/// A physical address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhysicalAddress(PAddr);

impl PhysicalAddress {
    /// Constructs a `PhysicalAddress` from a given virtual address.
    pub fn from_va(va: u64) -> Self {
        Self(PAddr::from(Self::pa_from_va(va)))
    }

    /// Retrieves the page frame number of the physical address.
    pub fn pfn(&self) -> u64 {
        self.0.as_u64() >> BASE_PAGE_SHIFT
    }

    /// Retrieves the physical address.
    pub fn pa(&self) -> u64 {
        self.0.as_u64()
    }

    /// Converts a virtual address to its corresponding physical address.
    ///
    /// Returns 0 for an unmapped address; callers treat that as a
    /// conversion failure.
    pub fn pa_from_va(va: u64) -> u64 {
        unsafe { MmGetPhysicalAddress(va as _).QuadPart as u64 }
    }
}
