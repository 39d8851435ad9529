//! Processor affinity control.
//!
//! VMX root state is per-core: enable, launch and teardown must all execute
//! on the same designated core, so every public entry point of the crate
//! pins itself with a [`ProcessorExecutor`] first.

use {
    core::mem::MaybeUninit,
    wdk_sys::{
        ntddk::{
            KeGetCurrentProcessorNumberEx, KeGetProcessorNumberFromIndex,
            KeQueryActiveProcessorCountEx, KeRevertToUserGroupAffinityThread,
            KeSetSystemGroupAffinityThread,
        },
        ALL_PROCESSOR_GROUPS, GROUP_AFFINITY, NTSTATUS, NT_SUCCESS, PROCESSOR_NUMBER,
    },
};

#[link(name = "ntoskrnl")]
extern "system" {
    ///undocumented
    fn ZwYieldExecution() -> NTSTATUS;
}

/// Returns the number of active logical processors in the system.
pub fn processor_count() -> u32 {
    unsafe { KeQueryActiveProcessorCountEx(ALL_PROCESSOR_GROUPS as _) }
}

/// Gets the processor number of the logical processor that the caller is running on.
pub fn current_processor_index() -> u32 {
    unsafe { KeGetCurrentProcessorNumberEx(core::ptr::null_mut()) }
}

/// Converts a systemwide processor index to a group number and a group-relative processor number.
fn processor_number_from_index(index: u32) -> Option<PROCESSOR_NUMBER> {
    let mut processor_number: MaybeUninit<PROCESSOR_NUMBER> = MaybeUninit::uninit();
    let status = unsafe { KeGetProcessorNumberFromIndex(index, processor_number.as_mut_ptr()) };

    if NT_SUCCESS(status) {
        Some(unsafe { processor_number.assume_init() })
    } else {
        None
    }
}

/// Pins the calling thread to a specific processor until dropped.
pub struct ProcessorExecutor {
    old_affinity: MaybeUninit<GROUP_AFFINITY>,
}

impl ProcessorExecutor {
    /// Switches the execution context to the processor with index `i`.
    pub fn switch_to_processor(i: u32) -> Option<Self> {
        if i > processor_count() {
            log::error!("Invalid processor index: {}", i);
            return None;
        }

        let processor_number = processor_number_from_index(i)?;

        let mut old_affinity: MaybeUninit<GROUP_AFFINITY> = MaybeUninit::uninit();
        let mut affinity: GROUP_AFFINITY = unsafe { core::mem::zeroed() };

        affinity.Group = processor_number.Group;
        affinity.Mask = 1 << processor_number.Number;
        affinity.Reserved[0] = 0;
        affinity.Reserved[1] = 0;
        affinity.Reserved[2] = 0;

        log::trace!("Switching execution to processor {}", i);
        unsafe { KeSetSystemGroupAffinityThread(&mut affinity, old_affinity.as_mut_ptr()) };

        if !NT_SUCCESS(unsafe { ZwYieldExecution() }) {
            return None;
        }

        Some(Self { old_affinity })
    }
}

impl Drop for ProcessorExecutor {
    /// Restores the calling thread's previous affinity.
    fn drop(&mut self) {
        log::trace!("Switching execution back to previous processor");
        unsafe {
            KeRevertToUserGroupAffinityThread(self.old_affinity.as_mut_ptr());
        }
    }
}
