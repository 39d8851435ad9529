//! VMX control-value adjustment against the hardware capability reports.

use x86::msr;

/// The VMX control families, each reported by its own capability MSR.
#[derive(Clone, Copy)]
pub enum VmxControl {
    PinBased,
    ProcessorBased,
    ProcessorBased2,
    VmExit,
    VmEntry,
}

impl VmxControl {
    const fn capability_msr(self) -> u32 {
        match self {
            VmxControl::PinBased => msr::IA32_VMX_PINBASED_CTLS,
            VmxControl::ProcessorBased => msr::IA32_VMX_PROCBASED_CTLS,
            VmxControl::ProcessorBased2 => msr::IA32_VMX_PROCBASED_CTLS2,
            VmxControl::VmExit => msr::IA32_VMX_EXIT_CTLS,
            VmxControl::VmEntry => msr::IA32_VMX_ENTRY_CTLS,
        }
    }
}

/// Returns the control value to program for the given family: the
/// capability MSR folded by [`adjust_control_value`] with the explicitly
/// requested feature flags on top.
pub fn adjusted_vmx_controls(control: VmxControl, requested: u32) -> u64 {
    let capability = unsafe { msr::rdmsr(control.capability_msr()) };
    u64::from(adjust_control_value(capability, requested))
}

/// Folds a capability MSR pair into a workable control value.
///
/// The low half reports the bits that must be 1, the high half the bits
/// that may be 1; AND-ing the halves keeps the mandatory settings inside
/// the allowed mask, and the requested flags are OR'd on top.
pub const fn adjust_control_value(capability: u64, requested: u32) -> u32 {
    ((capability as u32) & ((capability >> 32) as u32)) | requested
}

#[cfg(test)]
mod tests {
    use super::adjust_control_value;

    #[test]
    fn mandatory_bits_survive_the_fold() {
        // Low half: bits 0-3 mandatory. High half: bits 0-7 allowed.
        let capability = 0x0000_00ff_0000_000fu64;
        assert_eq!(adjust_control_value(capability, 0), 0xf);
    }

    #[test]
    fn requested_flags_are_ored_on_top() {
        let capability = 0x0000_00ff_0000_000fu64;
        assert_eq!(adjust_control_value(capability, 1 << 31), 0x8000_000f);
    }

    #[test]
    fn disallowed_mandatory_bits_drop_out() {
        // A mandatory bit outside the allowed mask never reaches the field.
        let capability = 0x0000_000f_0000_001fu64;
        assert_eq!(adjust_control_value(capability, 0), 0xf);
    }
}
