//! Execution-context switching
//!
//! A suspended context is nothing more than a stack pointer: `switch` pushes
//! the callee-saved registers of the running context onto its own stack,
//! stores the resulting stack pointer, loads another one and pops that
//! context's registers back. Everything a suspended coroutine needs therefore
//! lives in `[sp, top)` of its stack, which is what lets the scheduler copy
//! a coroutine out of a shared stack slot and back in later.
//!
//! ## Frame layouts
//!
//! x86_64 (System V), lowest address first:
//!
//! ```text
//! sp+0   mxcsr (4 bytes) | x87 control word (2 bytes) | pad
//! sp+8   r15 r14 r13 r12 rbx rbp
//! sp+56  return address
//! ```
//!
//! aarch64 (AAPCS64), 0xb0 bytes:
//!
//! ```text
//! sp+0x00  d8..d15
//! sp+0x40  x19..x28
//! sp+0x90  x29 (fp), x30 (lr)
//! sp+0xa0  pad (keeps sp 16-byte aligned)
//! ```

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
compile_error!("coil supports x86_64 and aarch64 only");

use std::arch::naked_asm;

/// Entry point of a freshly seeded context. It must never return.
pub(crate) type Entry = extern "C" fn() -> !;

/// Suspend the running context and resume the one saved at `to`.
///
/// The running context's stack pointer is written to `*from` before the
/// switch; calling `switch` with that value later returns from this call.
///
/// # Safety
/// `to` must be a stack pointer produced by `switch` or `init` whose stack
/// memory is still intact, and `from` must be valid for a write.
#[cfg(target_arch = "x86_64")]
#[unsafe(naked)]
pub(crate) unsafe extern "C" fn switch(from: *mut *mut u8, to: *mut u8) {
    naked_asm!(
        "push rbp",
        "push rbx",
        "push r12",
        "push r13",
        "push r14",
        "push r15",
        "sub rsp, 8",
        "stmxcsr [rsp]",
        "fnstcw [rsp + 4]",
        "mov [rdi], rsp",
        "mov rsp, rsi",
        "ldmxcsr [rsp]",
        "fldcw [rsp + 4]",
        "add rsp, 8",
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop rbx",
        "pop rbp",
        "ret",
    )
}

/// Suspend the running context and resume the one saved at `to`.
///
/// # Safety
/// See the x86_64 variant.
#[cfg(target_arch = "aarch64")]
#[unsafe(naked)]
pub(crate) unsafe extern "C" fn switch(from: *mut *mut u8, to: *mut u8) {
    naked_asm!(
        "sub sp, sp, #0xb0",
        "stp d8, d9, [sp, #0x00]",
        "stp d10, d11, [sp, #0x10]",
        "stp d12, d13, [sp, #0x20]",
        "stp d14, d15, [sp, #0x30]",
        "stp x19, x20, [sp, #0x40]",
        "stp x21, x22, [sp, #0x50]",
        "stp x23, x24, [sp, #0x60]",
        "stp x25, x26, [sp, #0x70]",
        "stp x27, x28, [sp, #0x80]",
        "stp x29, x30, [sp, #0x90]",
        "mov x9, sp",
        "str x9, [x0]",
        "mov sp, x1",
        "ldp d8, d9, [sp, #0x00]",
        "ldp d10, d11, [sp, #0x10]",
        "ldp d12, d13, [sp, #0x20]",
        "ldp d14, d15, [sp, #0x30]",
        "ldp x19, x20, [sp, #0x40]",
        "ldp x21, x22, [sp, #0x50]",
        "ldp x23, x24, [sp, #0x60]",
        "ldp x25, x26, [sp, #0x70]",
        "ldp x27, x28, [sp, #0x80]",
        "ldp x29, x30, [sp, #0x90]",
        "add sp, sp, #0xb0",
        "ret",
    )
}

/// Seed a context at the top of a stack so that the first `switch` into it
/// starts executing `entry` with an ABI-aligned stack. Returns the stack
/// pointer to switch to.
///
/// # Safety
/// `top` must be the upper end of writable memory with room for the initial
/// frame below it.
#[cfg(target_arch = "x86_64")]
pub(crate) unsafe fn init(top: *mut u8, entry: Entry) -> *mut u8 {
    const MXCSR: u64 = 0x1F80;
    const FPU_CW: u64 = 0x037F;

    let top = (top as usize & !15) as *mut u64;
    unsafe {
        let sp = top.sub(9);
        // Fake return address for `entry`, which leaves rsp at top-8 on entry
        // exactly as a `call` would.
        sp.add(8).write(0);
        sp.add(7).write(entry as usize as u64);
        for reg in 1..=6 {
            sp.add(reg).write(0);
        }
        sp.write(MXCSR | (FPU_CW << 32));
        sp as *mut u8
    }
}

/// Seed a context at the top of a stack. See the x86_64 variant.
///
/// # Safety
/// `top` must be the upper end of writable memory with room for the initial
/// frame below it.
#[cfg(target_arch = "aarch64")]
pub(crate) unsafe fn init(top: *mut u8, entry: Entry) -> *mut u8 {
    const FRAME: usize = 0xb0;

    let top = (top as usize & !15) as *mut u8;
    unsafe {
        let sp = top.sub(FRAME);
        std::ptr::write_bytes(sp, 0, FRAME);
        // `ret` jumps to x30 with sp back at `top`.
        (sp.add(0x98) as *mut u64).write(entry as usize as u64);
        sp
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::ptr;

    const STACK_SIZE: usize = 64 * 1024;

    thread_local! {
        static MAIN_SP: Cell<*mut u8> = const { Cell::new(ptr::null_mut()) };
        static CO_SP: Cell<*mut u8> = const { Cell::new(ptr::null_mut()) };
        static TRACE: Cell<u32> = const { Cell::new(0) };
    }

    fn resume_co() {
        let main = MAIN_SP.with(|c| c.as_ptr());
        let to = CO_SP.with(|c| c.get());
        unsafe { switch(main, to) };
    }

    fn back_to_main() {
        let from = CO_SP.with(|c| c.as_ptr());
        let to = MAIN_SP.with(|c| c.get());
        unsafe { switch(from, to) };
    }

    extern "C" fn entry() -> ! {
        let mut local = 1.5f64;
        TRACE.with(|t| t.set(1));
        back_to_main();
        local *= 2.0;
        TRACE.with(|t| t.set(if local == 3.0 { 2 } else { 99 }));
        loop {
            back_to_main();
        }
    }

    #[test]
    fn test_switch_round_trip_preserves_locals() {
        let mut stack = vec![0u8; STACK_SIZE];
        let top = unsafe { stack.as_mut_ptr().add(STACK_SIZE) };
        CO_SP.with(|c| c.set(unsafe { init(top, entry) }));

        resume_co();
        assert_eq!(TRACE.with(|t| t.get()), 1);
        resume_co();
        assert_eq!(TRACE.with(|t| t.get()), 2);
    }

    #[test]
    fn test_init_aligns_frame() {
        let mut stack = vec![0u8; 4096];
        let top = unsafe { stack.as_mut_ptr().add(4096 - 3) };
        let sp = unsafe { init(top, entry) };
        assert_eq!(sp as usize % 8, 0);
        assert!((sp as usize) < top as usize);
        assert!((top as usize) - (sp as usize) <= 0xb0 + 16);
    }
}
