//! Kernel memory allocators.
//!
//! The hardware-facing regions (VMXON, VMCS, the translation levels, guest
//! memory) must be physically contiguous and physically addressable, so
//! they come from [`PhysicalAllocator`]. Everything else uses
//! [`KernelAlloc`], which the driver also installs as its global allocator.

use {
    core::alloc::{AllocError, Allocator, Layout},
    core::ptr::NonNull,
    wdk_sys::{
        ntddk::{
            ExAllocatePool, ExFreePool, MmAllocateContiguousMemorySpecifyCacheNode,
            MmFreeContiguousMemory,
        },
        MM_ANY_NODE_OK, PHYSICAL_ADDRESS,
        _MEMORY_CACHING_TYPE::MmCached,
        _POOL_TYPE::NonPagedPool,
    },
};

/// Allocates physically contiguous, cached memory anywhere in the physical
/// address space via `MmAllocateContiguousMemorySpecifyCacheNode`.
pub struct PhysicalAllocator;

unsafe impl Allocator for PhysicalAllocator {
    fn allocate(&self, layout: Layout) -> Result<NonNull<[u8]>, AllocError> {
        let mut boundary: PHYSICAL_ADDRESS = unsafe { core::mem::zeroed() };
        let mut lowest: PHYSICAL_ADDRESS = unsafe { core::mem::zeroed() };
        let mut highest: PHYSICAL_ADDRESS = unsafe { core::mem::zeroed() };

        boundary.QuadPart = 0;
        lowest.QuadPart = 0;
        highest.QuadPart = -1;

        let memory = unsafe {
            MmAllocateContiguousMemorySpecifyCacheNode(
                layout.size() as _,
                lowest,
                highest,
                boundary,
                MmCached,
                MM_ANY_NODE_OK,
            )
        } as *mut u8;

        if memory.is_null() {
            Err(AllocError)
        } else {
            let slice = unsafe { core::slice::from_raw_parts_mut(memory, layout.size()) };
            Ok(unsafe { NonNull::new_unchecked(slice) })
        }
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, _layout: Layout) {
        MmFreeContiguousMemory(ptr.as_ptr() as _);
    }
}

/// Allocates non-paged pool memory via `ExAllocatePool`.
pub struct KernelAlloc;

unsafe impl Allocator for KernelAlloc {
    fn allocate(&self, layout: Layout) -> Result<NonNull<[u8]>, AllocError> {
        let memory = unsafe { ExAllocatePool(NonPagedPool, layout.size() as _) } as *mut u8;

        if memory.is_null() {
            Err(AllocError)
        } else {
            let slice = unsafe { core::slice::from_raw_parts_mut(memory, layout.size()) };
            Ok(unsafe { NonNull::new_unchecked(slice) })
        }
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, _layout: Layout) {
        ExFreePool(ptr.as_ptr() as _);
    }
}

unsafe impl core::alloc::GlobalAlloc for KernelAlloc {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        ExAllocatePool(NonPagedPool, layout.size() as _) as _
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        ExFreePool(ptr as _);
    }
}
