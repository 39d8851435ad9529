//! The virtualization state of the designated core and the exit-service
//! loop that drives a guest from first entry to terminal exit.

use {
    crate::{
        error::HypervisorError,
        intel::{
            ept::{Ept, Eptp},
            paging::{write_bootstrap_tables, GuestMemory, GUEST_IMAGE_SIZE},
            registers::GeneralRegisters,
            support::{vmread, vmwrite, vmxoff},
            vmcs::Vmcs,
            vmexit::{log_exit_info, service_hypercall, ExitReason},
            vmlaunch::launch_vm,
            vmxon::Vmxon,
        },
        utils::{addresses::PhysicalAddress, alloc::PhysicalAllocator},
    },
    alloc::boxed::Box,
    x86::{
        current::rflags::RFlags,
        vmx::vmcs::{guest, ro},
    },
};

/// The unit of virtualization state.
///
/// Owns every hardware-facing region for one lifecycle. Each region sits in
/// an `Option` slot so releases are one-shot and teardown stays idempotent.
pub struct Vcpu {
    /// Register file captured from the guest at every exit. Only defined
    /// between an exit and the following resume.
    guest_registers: GeneralRegisters,

    /// Register file of the host context, captured at entry and restored
    /// when the guest is left for good.
    host_registers: GeneralRegisters,

    /// The VMXON region. Held exactly while the core is in root operation.
    vmxon_region: Option<Box<Vmxon, PhysicalAllocator>>,

    /// The active per-guest control structure.
    vmcs_region: Option<Box<Vmcs, PhysicalAllocator>>,

    /// The flat allocation backing all guest-physical memory.
    guest_memory: Option<Box<GuestMemory, PhysicalAllocator>>,

    /// The guest-physical → host-physical translation hierarchy.
    ept: Ept,
}

impl Vcpu {
    pub fn new() -> Self {
        Self {
            guest_registers: GeneralRegisters::default(),
            host_registers: GeneralRegisters::default(),
            vmxon_region: None,
            vmcs_region: None,
            guest_memory: None,
            ept: Ept::new(),
        }
    }

    /// Enters VMX root operation. See [`Vmxon::setup`].
    pub fn enable(&mut self) -> Result<(), HypervisorError> {
        Vmxon::setup(&mut self.vmxon_region)
    }

    /// Allocates (or reallocates) the control structure and makes it
    /// current. See [`Vmcs::activate`].
    pub fn activate_vmcs(&mut self) -> Result<(), HypervisorError> {
        Vmcs::activate(&mut self.vmcs_region)
    }

    /// Allocates guest memory, builds the translation hierarchy over it and
    /// writes the guest's bootstrap page tables.
    ///
    /// Returns the encoded translation pointer for the control structure.
    pub fn build_address_space(&mut self) -> Result<u64, HypervisorError> {
        let mut guest_memory: Box<GuestMemory, PhysicalAllocator> = unsafe {
            Box::try_new_zeroed_in(PhysicalAllocator)
                .map_err(|_| HypervisorError::MemoryAllocationFailed("guest memory"))?
                .assume_init()
        };

        let guest_memory_pa = PhysicalAddress::pa_from_va(guest_memory.as_ref() as *const _ as _);
        if guest_memory_pa == 0 {
            return Err(HypervisorError::VirtualToPhysicalAddressFailed);
        }
        log::info!("Guest memory physical address: {:#x}", guest_memory_pa);

        let pml4_pa = self.ept.build(guest_memory_pa)?;
        let eptp = Eptp::new(pml4_pa);
        log::info!("Translation pointer: {:#x}", eptp.raw());

        write_bootstrap_tables(&mut guest_memory);

        self.guest_memory = Some(guest_memory);

        Ok(eptp.raw())
    }

    /// Runs the single field-initialization pass over the current control
    /// structure.
    pub fn initialize_control_fields(&mut self, eptp: u64) -> Result<(), HypervisorError> {
        Vmcs::setup_control_fields(eptp)?;
        Vmcs::setup_host_state()?;
        Vmcs::setup_guest_state()?;
        log::info!("Control fields initialized");
        Ok(())
    }

    /// Copies the launch image to the bottom of guest memory.
    pub fn load_guest_image(&mut self, image: &[u8; GUEST_IMAGE_SIZE]) {
        if let Some(guest_memory) = self.guest_memory.as_mut() {
            guest_memory.load_image(image);
        }
    }

    /// Enters the guest and services exits until a terminal one.
    ///
    /// A hypercall exit is handled and resumed; anything else returns
    /// control to the host caller with the host register file restored by
    /// the exit stub. A resume that the hardware refuses is fatal to the
    /// guest lifecycle, never to the host.
    pub fn run(&mut self) -> Result<(), HypervisorError> {
        self.guest_registers = GeneralRegisters::default();
        let mut launched = false;

        log::info!("Entering the guest");

        loop {
            let flags = unsafe {
                launch_vm(
                    &mut self.guest_registers,
                    &mut self.host_registers,
                    u64::from(launched),
                )
            };
            Self::check_entry_flags(RFlags::from_raw(flags), launched)?;
            launched = true;

            // The entry instruction's save convention already captured the
            // integer file; RIP/RSP/RFLAGS live in the control structure.
            self.guest_registers.rip = vmread(guest::RIP);
            self.guest_registers.rsp = vmread(guest::RSP);
            self.guest_registers.rflags = vmread(guest::RFLAGS);

            let exit_reason = ExitReason::from_raw(vmread(ro::EXIT_REASON) as u32);
            log_exit_info(exit_reason, &self.guest_registers);

            match exit_reason {
                ExitReason::Vmcall => {
                    // Register A carries the opcode, register B the operand.
                    if let Some(operand) =
                        service_hypercall(self.guest_registers.rax, self.guest_registers.rbx)
                    {
                        log::info!("Guest reports: {:#x}", operand);
                    }
                    self.advance_guest_rip()?;
                }
                terminal => {
                    log::info!(
                        "Exit reason {:#x} is terminal, returning to the host",
                        terminal.basic()
                    );
                    break;
                }
            }
        }

        Ok(())
    }

    /// Frees guest memory and the four translation levels, each
    /// independently.
    pub fn release_address_space(&mut self) {
        release_slot(&mut self.guest_memory, "guest memory");
        self.ept.release();
    }

    /// Releases every resource and leaves root operation.
    ///
    /// Idempotent: already-released resources are reported and skipped, and
    /// VMXOFF only runs if this teardown is the one that took the core out
    /// of root operation.
    pub fn shutdown(&mut self) -> Result<(), HypervisorError> {
        let in_root_operation = self.vmxon_region.is_some();

        release_slot(&mut self.vmxon_region, "VMXON region");
        release_slot(&mut self.vmcs_region, "VMCS region");
        self.release_address_space();

        if in_root_operation {
            vmxoff()?;
            log::info!("Left VMX root operation");
        }

        Ok(())
    }

    /// Maps the entry instruction's CF/ZF convention onto the error
    /// taxonomy: a refused first entry and a refused resume are different
    /// failures.
    fn check_entry_flags(flags: RFlags, launched: bool) -> Result<(), HypervisorError> {
        if flags.contains(RFlags::FLAGS_ZF) || flags.contains(RFlags::FLAGS_CF) {
            log::error!(
                "VM entry failed with instruction error {}",
                vmread(ro::VM_INSTRUCTION_ERROR)
            );
            return Err(if launched {
                HypervisorError::FatalExit
            } else {
                HypervisorError::VMLAUNCHFailed
            });
        }
        Ok(())
    }

    /// Advances the guest past the instruction that forced the exit, by the
    /// length the hardware reported for it.
    fn advance_guest_rip(&mut self) -> Result<(), HypervisorError> {
        let instruction_length = vmread(ro::VMEXIT_INSTRUCTION_LEN);
        self.guest_registers.rip = vmread(guest::RIP) + instruction_length;
        vmwrite(guest::RIP, self.guest_registers.rip)
    }
}

/// Frees whatever `slot` still holds.
///
/// An empty slot is reported at low severity and skipped; releasing never
/// stops on a missing resource.
pub(crate) fn release_slot<T>(slot: &mut Option<T>, name: &'static str) -> bool {
    match slot.take() {
        Some(resource) => {
            core::mem::drop(resource);
            log::info!("Released {}", name);
            true
        }
        None => {
            log::debug!("{} was already released", name);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::release_slot;

    #[test]
    fn release_frees_exactly_once() {
        let mut slot = Some(alloc::boxed::Box::new(0u8));
        assert!(release_slot(&mut slot, "test resource"));
        assert!(slot.is_none());
        assert!(!release_slot(&mut slot, "test resource"));
    }

    #[test]
    fn releasing_an_empty_slot_is_a_noop() {
        let mut slot: Option<alloc::boxed::Box<u8>> = None;
        assert!(!release_slot(&mut slot, "test resource"));
        assert!(!release_slot(&mut slot, "test resource"));
    }
}
