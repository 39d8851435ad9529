//! The VM-entry and VM-exit assembly stubs.
//!
//! `launch_vm` snapshots the host register file, programs HOST_RSP and
//! HOST_RIP in the current VMCS, loads the guest register file and enters
//! the guest with VMLAUNCH or VMRESUME. The exit stub runs when the
//! hardware forces a VM-exit: it captures the guest register file and
//! returns to the Rust caller with the host file restored, so all exit
//! dispatch happens in Rust.

use crate::intel::registers::GeneralRegisters;

extern "C" {
    /// Enters the guest until the next VM-exit.
    ///
    /// Saves the current register file into `host`, restores `guest`, and
    /// issues VMLAUNCH when `launched` is zero, VMRESUME otherwise. The
    /// returned value is an RFLAGS image: zero after a round trip through
    /// the guest, or the failing instruction's CF/ZF word when the entry
    /// itself failed. In both cases the host register file has been
    /// restored when the function returns.
    pub fn launch_vm(guest: &mut GeneralRegisters, host: &mut GeneralRegisters, launched: u64) -> u64;

    /// Assembly stub the hardware jumps to on VM-exit (HOST_RIP).
    pub fn vmexit_stub();
}

core::arch::global_asm!(
    r#"
.set registers_rax, 0x00
.set registers_rbx, 0x08
.set registers_rcx, 0x10
.set registers_rdx, 0x18
.set registers_rdi, 0x20
.set registers_rsi, 0x28
.set registers_rbp, 0x30
.set registers_rsp, 0x38
.set registers_r8,  0x40
.set registers_r9,  0x48
.set registers_r10, 0x50
.set registers_r11, 0x58
.set registers_r12, 0x60
.set registers_r13, 0x68
.set registers_r14, 0x70
.set registers_r15, 0x78
.set registers_rflags, 0x88

.global launch_vm
launch_vm:
    // Snapshot the host register file (rcx = guest, rdx = host, r8 = launched).
    mov     [rdx + registers_rax], rax
    mov     [rdx + registers_rbx], rbx
    mov     [rdx + registers_rcx], rcx
    mov     [rdx + registers_rdx], rdx
    mov     [rdx + registers_rdi], rdi
    mov     [rdx + registers_rsi], rsi
    mov     [rdx + registers_rbp], rbp
    mov     [rdx + registers_rsp], rsp
    mov     [rdx + registers_r8],  r8
    mov     [rdx + registers_r9],  r9
    mov     [rdx + registers_r10], r10
    mov     [rdx + registers_r11], r11
    mov     [rdx + registers_r12], r12
    mov     [rdx + registers_r13], r13
    mov     [rdx + registers_r14], r14
    mov     [rdx + registers_r15], r15
    pushfq
    pop     rax
    mov     [rdx + registers_rflags], rax

    // Park both register-file pointers where the exit stub can find them.
    push    rdx
    push    rcx

    // The next VM-exit lands in vmexit_stub on this exact stack.
    mov     r14, 0x6C14 // VMCS_HOST_RSP
    vmwrite r14, rsp
    lea     r13, [rip + vmexit_stub]
    mov     r14, 0x6C16 // VMCS_HOST_RIP
    vmwrite r14, r13

    // Load the guest register file. r8 still carries the launched flag, so
    // it and r15 (the base pointer) are loaded after the test.
    mov     r15, rcx
    mov     rax, [r15 + registers_rax]
    mov     rbx, [r15 + registers_rbx]
    mov     rcx, [r15 + registers_rcx]
    mov     rdx, [r15 + registers_rdx]
    mov     rdi, [r15 + registers_rdi]
    mov     rsi, [r15 + registers_rsi]
    mov     rbp, [r15 + registers_rbp]
    mov     r9,  [r15 + registers_r9]
    mov     r10, [r15 + registers_r10]
    mov     r11, [r15 + registers_r11]
    mov     r12, [r15 + registers_r12]
    mov     r13, [r15 + registers_r13]
    mov     r14, [r15 + registers_r14]
    test    r8, r8
    mov     r8,  [r15 + registers_r8]
    mov     r15, [r15 + registers_r15]
    jnz     resume_guest

    vmlaunch
    jmp     vmentry_failed

resume_guest:
    vmresume

vmentry_failed:
    // The entry instruction fell through; its CF/ZF word is the result.
    pushfq
    pop     rax
    add     rsp, 8
    pop     r15
    mov     rbx, [r15 + registers_rbx]
    mov     rcx, [r15 + registers_rcx]
    mov     rdx, [r15 + registers_rdx]
    mov     rdi, [r15 + registers_rdi]
    mov     rsi, [r15 + registers_rsi]
    mov     rbp, [r15 + registers_rbp]
    mov     r8,  [r15 + registers_r8]
    mov     r9,  [r15 + registers_r9]
    mov     r10, [r15 + registers_r10]
    mov     r11, [r15 + registers_r11]
    mov     r12, [r15 + registers_r12]
    mov     r13, [r15 + registers_r13]
    mov     r14, [r15 + registers_r14]
    mov     r15, [r15 + registers_r15]
    ret

.global vmexit_stub
vmexit_stub:
    // [rsp] holds the guest register-file pointer; swap it for r15 so the
    // guest's r15 value survives the capture.
    xchg    r15, [rsp]
    mov     [r15 + registers_rax], rax
    mov     [r15 + registers_rbx], rbx
    mov     [r15 + registers_rcx], rcx
    mov     [r15 + registers_rdx], rdx
    mov     [r15 + registers_rdi], rdi
    mov     [r15 + registers_rsi], rsi
    mov     [r15 + registers_rbp], rbp
    mov     [r15 + registers_r8],  r8
    mov     [r15 + registers_r9],  r9
    mov     [r15 + registers_r10], r10
    mov     [r15 + registers_r11], r11
    mov     [r15 + registers_r12], r12
    mov     [r15 + registers_r13], r13
    mov     [r15 + registers_r14], r14
    pop     rax
    mov     [r15 + registers_r15], rax

    // Back onto the host register file; rax carries the success flag word.
    pop     r15
    mov     rbx, [r15 + registers_rbx]
    mov     rcx, [r15 + registers_rcx]
    mov     rdx, [r15 + registers_rdx]
    mov     rdi, [r15 + registers_rdi]
    mov     rsi, [r15 + registers_rsi]
    mov     rbp, [r15 + registers_rbp]
    mov     r8,  [r15 + registers_r8]
    mov     r9,  [r15 + registers_r9]
    mov     r10, [r15 + registers_r10]
    mov     r11, [r15 + registers_r11]
    mov     r12, [r15 + registers_r12]
    mov     r13, [r15 + registers_r13]
    mov     r14, [r15 + registers_r14]
    mov     r15, [r15 + registers_r15]
    xor     rax, rax
    ret
"#
);
