//! General-purpose register files shared with the entry/exit stubs.

use {core::fmt, static_assertions::const_assert_eq};

/// A snapshot of the 16 integer registers plus RFLAGS.
///
/// The `Vcpu` holds one of these for the guest and one for the host.
/// Exactly one of the two is live at any instant: the entry stub fills the
/// host file and loads the guest file, the exit stub does the reverse.
/// Outside those boundaries the guest file's contents are undefined.
///
/// The layout is fixed; the assembly in `vmlaunch.rs` addresses the fields
/// by the offsets below.
#[repr(C)]
#[derive(Clone, Copy, Default)]
pub struct GeneralRegisters {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rbp: u64,
    pub rsp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
    pub rflags: u64,
}
const_assert_eq!(core::mem::size_of::<GeneralRegisters>(), 0x90);
const_assert_eq!(core::mem::offset_of!(GeneralRegisters, rsp), 0x38);
const_assert_eq!(core::mem::offset_of!(GeneralRegisters, r15), 0x78);
const_assert_eq!(core::mem::offset_of!(GeneralRegisters, rflags), 0x88);

impl fmt::Debug for GeneralRegisters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("GeneralRegisters {\n")?;
        write!(
            f,
            "  rax: {:#018x}, rbx: {:#018x}, rcx: {:#018x}, rdx: {:#018x}\n",
            self.rax, self.rbx, self.rcx, self.rdx
        )?;
        write!(
            f,
            "  rdi: {:#018x}, rsi: {:#018x}, rbp: {:#018x}, rsp: {:#018x}\n",
            self.rdi, self.rsi, self.rbp, self.rsp
        )?;
        write!(
            f,
            "  r8:  {:#018x}, r9:  {:#018x}, r10: {:#018x}, r11: {:#018x}\n",
            self.r8, self.r9, self.r10, self.r11
        )?;
        write!(
            f,
            "  r12: {:#018x}, r13: {:#018x}, r14: {:#018x}, r15: {:#018x}\n",
            self.r12, self.r13, self.r14, self.r15
        )?;
        write!(
            f,
            "  rip: {:#018x}, rflags: {:#018x}\n",
            self.rip, self.rflags
        )?;
        f.write_str("}")
    }
}
