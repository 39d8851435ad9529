//! Wrappers for the non-VMX instructions the crate relies on.

use x86::{
    bits64::rflags::{self, RFlags},
    dtables::DescriptorTablePointer,
};

/// Reads the GDTR.
pub fn sgdt() -> DescriptorTablePointer<u64> {
    let mut gdtr = DescriptorTablePointer::<u64>::default();
    unsafe { x86::dtables::sgdt(&mut gdtr) };
    gdtr
}

/// Reads the IDTR register.
pub fn sidt() -> DescriptorTablePointer<u64> {
    let mut idtr = DescriptorTablePointer::<u64>::default();
    unsafe { x86::dtables::sidt(&mut idtr) };
    idtr
}

/// Keeps maskable interrupts disabled while held.
///
/// The previous interrupt state is restored on drop, so nesting under a
/// caller that already disabled interrupts stays correct.
pub struct InterruptGuard {
    were_enabled: bool,
}

impl InterruptGuard {
    pub fn disable() -> Self {
        let were_enabled = rflags::read().contains(RFlags::FLAGS_IF);
        unsafe { x86::irq::disable() };
        Self { were_enabled }
    }
}

impl Drop for InterruptGuard {
    fn drop(&mut self) {
        if self.were_enabled {
            unsafe { x86::irq::enable() };
        }
    }
}
