//! VM-exit decoding, the hypercall convention and the per-exit diagnostics.

use {
    crate::intel::{registers::GeneralRegisters, support::vmread},
    bitflags::bitflags,
    x86::vmx::vmcs::{guest, ro},
};

/// The exits this monitor dispatches on, plus a catch-all.
///
/// Only a hypercall resumes the guest; every other reason is terminal. The
/// named non-hypercall reasons exist for the diagnostics.
///
/// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: Table C-1. Basic Exit Reasons
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    TripleFault,
    Vmcall,
    EptViolation,
    Other(u16),
}

impl ExitReason {
    const TRIPLE_FAULT: u16 = 2;
    const VMCALL: u16 = 18;
    const EPT_VIOLATION: u16 = 48;

    /// Decodes the raw exit-reason field.
    ///
    /// Only the low 16 bits name the reason; the high half carries
    /// entry-failure and enclave flags that must not leak into dispatch.
    ///
    /// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: 25.9.1 VM Exit Reason
    pub fn from_raw(value: u32) -> Self {
        match (value & 0xffff) as u16 {
            Self::TRIPLE_FAULT => Self::TripleFault,
            Self::VMCALL => Self::Vmcall,
            Self::EPT_VIOLATION => Self::EptViolation,
            other => Self::Other(other),
        }
    }

    /// The basic (low 16-bit) reason number.
    pub fn basic(self) -> u16 {
        match self {
            Self::TripleFault => Self::TRIPLE_FAULT,
            Self::Vmcall => Self::VMCALL,
            Self::EptViolation => Self::EPT_VIOLATION,
            Self::Other(reason) => reason,
        }
    }
}

bitflags! {
    /// Access bits of the EPT-violation exit qualification.
    ///
    /// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: Table 28-7. Exit Qualification for EPT Violations
    pub struct EptViolationQualification: u64 {
        const READ_ACCESS = 1 << 0;
        const WRITE_ACCESS = 1 << 1;
        const EXECUTE_ACCESS = 1 << 2;
    }
}

/// The opcode (register A) a guest uses to have the host log register B.
pub const HYPERCALL_LOG: u64 = 1;

/// Decodes the guest's hypercall register pair.
///
/// Returns the operand to log for the log opcode; every other opcode is a
/// defined no-op.
pub fn service_hypercall(opcode: u64, operand: u64) -> Option<u64> {
    match opcode {
        HYPERCALL_LOG => Some(operand),
        _ => None,
    }
}

/// Logs the decoded reason and the guest state relevant to it.
///
/// Side-effecting observability only; dispatch never depends on it.
pub fn log_exit_info(reason: ExitReason, registers: &GeneralRegisters) {
    log::info!("VM-exit reason {:#x} ({:?}) at guest RIP {:#x}", reason.basic(), reason, registers.rip);

    match reason {
        ExitReason::TripleFault => log::info!("Triple fault in guest"),
        ExitReason::EptViolation => {
            let guest_pa = vmread(ro::GUEST_PHYSICAL_ADDR_FULL);
            let qualification =
                EptViolationQualification::from_bits_truncate(vmread(ro::EXIT_QUALIFICATION));
            log::info!(
                "EPT violation: guest physical address {:#x}, read={} write={} execute={}",
                guest_pa,
                qualification.contains(EptViolationQualification::READ_ACCESS),
                qualification.contains(EptViolationQualification::WRITE_ACCESS),
                qualification.contains(EptViolationQualification::EXECUTE_ACCESS),
            );
        }
        _ => {}
    }

    log::info!(
        "Guest RSP: {:#x}, CR3: {:#x}, CR0: {:#x}",
        registers.rsp,
        vmread(guest::CR3),
        vmread(guest::CR0),
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_reason_masks_the_high_bits() {
        // An entry-failure flag in bit 16 must not change the decode.
        assert_eq!(ExitReason::from_raw(0x0001_0030), ExitReason::EptViolation);
        assert_eq!(ExitReason::from_raw(0x0000_0030), ExitReason::EptViolation);
        assert_eq!(ExitReason::from_raw(0x8000_0012), ExitReason::Vmcall);
    }

    #[test]
    fn unhandled_reasons_decode_as_other() {
        assert_eq!(ExitReason::from_raw(10), ExitReason::Other(10));
        assert_eq!(ExitReason::from_raw(0xffff_0000), ExitReason::Other(0));
        assert_eq!(ExitReason::Other(10).basic(), 10);
    }

    #[test]
    fn named_reasons_round_trip() {
        for reason in [ExitReason::TripleFault, ExitReason::Vmcall, ExitReason::EptViolation] {
            assert_eq!(ExitReason::from_raw(reason.basic() as u32), reason);
        }
    }

    #[test]
    fn log_hypercall_yields_its_operand() {
        assert_eq!(service_hypercall(HYPERCALL_LOG, 0x2a), Some(0x2a));
    }

    #[test]
    fn unknown_hypercalls_are_noops() {
        assert_eq!(service_hypercall(0, 0x2a), None);
        assert_eq!(service_hypercall(7, 0x2a), None);
    }
}
