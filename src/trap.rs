//! Trap entry and dispatch.
//!
//! A single assembly vector serves both privilege levels. The convention:
//! while the hart runs user code, `sscratch` holds the current thread's
//! kernel stack top; while it runs kernel code, `sscratch` is zero. The
//! entry swaps `sscratch` and `sp` to find out where it came from, pushes
//! the full register set plus the four trap CSRs into a `TrapFrame`, and
//! calls the dispatcher. `scause` and `stval` are latched into the frame
//! right away; nothing is re-enabled in the entry path.
//!
//! The kernel half of every address space is shared, so the vector never
//! touches `satp`.

use crate::intr;
use crate::riscv::{
    scause_code, scause_is_interrupt, Sstatus, EXC_BREAKPOINT, EXC_ECALL_USER, EXC_ILLEGAL_INSTR,
    EXC_INSTR_ACCESS, EXC_INSTR_MISALIGNED, EXC_INSTR_PAGE_FAULT, EXC_LOAD_ACCESS,
    EXC_LOAD_MISALIGNED, EXC_LOAD_PAGE_FAULT, EXC_STORE_ACCESS, EXC_STORE_MISALIGNED,
    EXC_STORE_PAGE_FAULT,
};
use crate::{process, syscall, thread};

/// Saved register state at trap entry. The byte layout is shared with the
/// assembly below; the `const_assert`s pin it.
#[repr(C)]
#[derive(Clone)]
pub struct TrapFrame {
    pub ra: usize,
    pub sp: usize,
    pub gp: usize,
    pub tp: usize,
    pub t0: usize,
    pub t1: usize,
    pub t2: usize,
    pub s0: usize,
    pub s1: usize,
    pub a0: usize,
    pub a1: usize,
    pub a2: usize,
    pub a3: usize,
    pub a4: usize,
    pub a5: usize,
    pub a6: usize,
    pub a7: usize,
    pub s2: usize,
    pub s3: usize,
    pub s4: usize,
    pub s5: usize,
    pub s6: usize,
    pub s7: usize,
    pub s8: usize,
    pub s9: usize,
    pub s10: usize,
    pub s11: usize,
    pub t3: usize,
    pub t4: usize,
    pub t5: usize,
    pub t6: usize,
    pub sepc: usize,
    pub sstatus: usize,
    pub scause: usize,
    pub stval: usize,
    _pad: usize,
}

pub const TRAP_FRAME_SIZE: usize = core::mem::size_of::<TrapFrame>();

use core::mem::offset_of;
use static_assertions::const_assert_eq;

const_assert_eq!(TRAP_FRAME_SIZE, 288);
const_assert_eq!(TRAP_FRAME_SIZE % 16, 0);
const_assert_eq!(offset_of!(TrapFrame, ra), 0);
const_assert_eq!(offset_of!(TrapFrame, sp), 8);
const_assert_eq!(offset_of!(TrapFrame, a0), 72);
const_assert_eq!(offset_of!(TrapFrame, a7), 128);
const_assert_eq!(offset_of!(TrapFrame, t6), 240);
const_assert_eq!(offset_of!(TrapFrame, sepc), 248);
const_assert_eq!(offset_of!(TrapFrame, sstatus), 256);
const_assert_eq!(offset_of!(TrapFrame, scause), 264);
const_assert_eq!(offset_of!(TrapFrame, stval), 272);

impl TrapFrame {
    pub fn zeroed() -> Self {
        // SAFETY: TrapFrame is plain words; all-zero is a valid value.
        unsafe { core::mem::zeroed() }
    }

    /// Did this trap come from user mode?
    pub fn from_user(&self) -> bool {
        self.sstatus & Sstatus::SPP.bits() == 0
    }

    /// Syscall argument register a0..a5.
    pub fn arg(&self, n: usize) -> usize {
        match n {
            0 => self.a0,
            1 => self.a1,
            2 => self.a2,
            3 => self.a3,
            4 => self.a4,
            5 => self.a5,
            _ => panic!("TrapFrame::arg"),
        }
    }

    /// Syscall return value goes in a0.
    pub fn set_ret(&mut self, value: usize) {
        self.a0 = value;
    }
}

cfg_if::cfg_if! {
    if #[cfg(target_arch = "riscv64")] {
        core::arch::global_asm!(
            r#"
            .section .text
            .globl trap_vector
            .align 4
            trap_vector:
                # sscratch: kernel stack top in user mode, zero in the kernel.
                csrrw sp, sscratch, sp
                bnez sp, 1f
                # Supervisor-mode trap: the interrupted sp is in sscratch now.
                csrr sp, sscratch
            1:
                addi sp, sp, -288
                sd ra, 0(sp)
                sd gp, 16(sp)
                sd tp, 24(sp)
                sd t0, 32(sp)
                sd t1, 40(sp)
                sd t2, 48(sp)
                sd s0, 56(sp)
                sd s1, 64(sp)
                sd a0, 72(sp)
                sd a1, 80(sp)
                sd a2, 88(sp)
                sd a3, 96(sp)
                sd a4, 104(sp)
                sd a5, 112(sp)
                sd a6, 120(sp)
                sd a7, 128(sp)
                sd s2, 136(sp)
                sd s3, 144(sp)
                sd s4, 152(sp)
                sd s5, 160(sp)
                sd s6, 168(sp)
                sd s7, 176(sp)
                sd s8, 184(sp)
                sd s9, 192(sp)
                sd s10, 200(sp)
                sd s11, 208(sp)
                sd t3, 216(sp)
                sd t4, 224(sp)
                sd t5, 232(sp)
                sd t6, 240(sp)
                # The interrupted sp was parked in sscratch either way.
                csrr t0, sscratch
                sd t0, 8(sp)
                # Latch the trap CSRs before anything can retrigger them.
                csrr t1, sepc
                sd t1, 248(sp)
                csrr t2, sstatus
                sd t2, 256(sp)
                csrr t3, scause
                sd t3, 264(sp)
                csrr t4, stval
                sd t4, 272(sp)
                # We are in the kernel now.
                csrw sscratch, zero
                mv a0, sp
                call trap_dispatch

            .globl trap_restore
            trap_restore:
                ld t2, 256(sp)
                csrw sstatus, t2
                ld t1, 248(sp)
                csrw sepc, t1
                # Returning to user mode? Re-arm sscratch with the kernel
                # stack top for the next entry.
                andi t0, t2, 256
                bnez t0, 2f
                addi t3, sp, 288
                csrw sscratch, t3
            2:
                ld ra, 0(sp)
                ld gp, 16(sp)
                ld tp, 24(sp)
                ld t0, 32(sp)
                ld t1, 40(sp)
                ld t2, 48(sp)
                ld s0, 56(sp)
                ld s1, 64(sp)
                ld a0, 72(sp)
                ld a1, 80(sp)
                ld a2, 88(sp)
                ld a3, 96(sp)
                ld a4, 104(sp)
                ld a5, 112(sp)
                ld a6, 120(sp)
                ld a7, 128(sp)
                ld s2, 136(sp)
                ld s3, 144(sp)
                ld s4, 152(sp)
                ld s5, 160(sp)
                ld s6, 168(sp)
                ld s7, 176(sp)
                ld s8, 184(sp)
                ld s9, 192(sp)
                ld s10, 200(sp)
                ld s11, 208(sp)
                ld t3, 216(sp)
                ld t4, 224(sp)
                ld t5, 232(sp)
                ld t6, 240(sp)
                ld sp, 8(sp)
                sret

            # Leave the kernel for the first time: a0 points at a fabricated
            # trap frame at the top of the thread's kernel stack.
            .globl user_mode_enter
            user_mode_enter:
                mv sp, a0
                j trap_restore
            "#
        );

        extern "C" {
            fn trap_vector();
            fn user_mode_enter(frame: *mut TrapFrame) -> !;
        }

        /// Install the trap vector.
        pub fn init() {
            // SAFETY: trap_vector is a valid, 4-aligned vector.
            unsafe { crate::riscv::w_stvec(trap_vector as usize) };
        }

        /// Restore a fabricated frame and sret into user mode.
        ///
        /// # Safety
        ///
        /// `frame` must sit at the top of the current kernel stack and
        /// describe a valid user context; `satp` must already point at the
        /// process's page directory.
        pub unsafe fn enter_user(frame: *mut TrapFrame) -> ! {
            unsafe { user_mode_enter(frame) }
        }
    } else {
        pub fn init() {}

        pub unsafe fn enter_user(_frame: *mut TrapFrame) -> ! {
            unreachable!("user mode exists only on the target")
        }
    }
}

/// Handlers for interrupt causes (the high-bit-set side of scause).
pub type IrqHandler = fn();

const NIRQ: usize = 16;

static IRQ_HANDLERS: intr::IntrCell<[Option<IrqHandler>; NIRQ]> =
    intr::IntrCell::new([None; NIRQ]);

/// Register a handler for an interrupt cause code. Handlers run with
/// interrupts off and must not block.
pub fn register_irq(code: usize, handler: IrqHandler) {
    assert!(code < NIRQ);
    let mut held = intr::HeldInterrupts::new();
    IRQ_HANDLERS.borrow_mut(&mut held)[code] = Some(handler);
}

/// Default supervisor-software handler: nobody sends IPIs on one hart, so
/// just drop the pending bit.
pub fn software_intr() {
    let sip = crate::riscv::r_sip();
    // SAFETY: clearing SSIP acknowledges the interrupt.
    unsafe { crate::riscv::w_sip(sip & !(1 << crate::riscv::IRQ_S_SOFT)) };
}

/// C-level dispatcher, called by the assembly vector with the frame.
#[no_mangle]
pub extern "C" fn trap_dispatch(tf: &mut TrapFrame) {
    if scause_is_interrupt(tf.scause) {
        let code = scause_code(tf.scause);
        intr::enter_interrupt();
        let handler = {
            let mut held = intr::HeldInterrupts::new();
            IRQ_HANDLERS.borrow_mut(&mut held).get(code).copied().flatten()
        };
        match handler {
            Some(h) => h(),
            None => fatal(tf, "unexpected interrupt"),
        }
        intr::leave_interrupt();
    } else {
        match scause_code(tf.scause) {
            EXC_ECALL_USER => {
                // Return past the 4-byte ecall instruction.
                tf.sepc = tf.sepc.wrapping_add(4);
                // Interrupts stay live while a syscall runs; the latched
                // CSRs are already in the frame.
                // SAFETY: the trap entry finished saving state.
                unsafe { crate::riscv::intr_on() };
                syscall::dispatch(tf);
            }
            EXC_INSTR_PAGE_FAULT | EXC_LOAD_PAGE_FAULT | EXC_STORE_PAGE_FAULT => {
                process::page_fault(tf);
            }
            EXC_BREAKPOINT => {
                // Compressed ebreak.
                tf.sepc = tf.sepc.wrapping_add(2);
            }
            EXC_ILLEGAL_INSTR => fatal(tf, "illegal instruction"),
            EXC_INSTR_MISALIGNED => fatal(tf, "misaligned instruction fetch"),
            EXC_LOAD_MISALIGNED => fatal(tf, "misaligned load"),
            EXC_STORE_MISALIGNED => fatal(tf, "misaligned store"),
            EXC_INSTR_ACCESS => fatal(tf, "instruction access fault"),
            EXC_LOAD_ACCESS => fatal(tf, "load access fault"),
            EXC_STORE_ACCESS => fatal(tf, "store access fault"),
            _ => fatal(tf, "unknown trap"),
        }
    }

    // Make the register restore atomic; the frame's sstatus decides what
    // sret re-enables.
    crate::riscv::intr_off();

    // A timer tick may have asked for preemption. Critical sections never
    // see this: with interrupts off the tick cannot arrive.
    if !intr::in_interrupt_context() && thread::take_yield_request() {
        thread::yield_now();
    }
}

/// Architectural faults are always fatal: cause, epc, tval, register dump.
fn fatal(tf: &TrapFrame, what: &str) -> ! {
    println!("fatal trap: {}", what);
    println!(
        "scause={:#x} sepc={:#x} stval={:#x} sstatus={:#x}",
        tf.scause, tf.sepc, tf.stval, tf.sstatus
    );
    println!(
        "ra={:#x} sp={:#x} gp={:#x} tp={:#x}",
        tf.ra, tf.sp, tf.gp, tf.tp
    );
    println!(
        "a0={:#x} a1={:#x} a2={:#x} a3={:#x} a4={:#x} a5={:#x} a6={:#x} a7={:#x}",
        tf.a0, tf.a1, tf.a2, tf.a3, tf.a4, tf.a5, tf.a6, tf.a7
    );
    println!(
        "t0={:#x} t1={:#x} t2={:#x} t3={:#x} t4={:#x} t5={:#x} t6={:#x}",
        tf.t0, tf.t1, tf.t2, tf.t3, tf.t4, tf.t5, tf.t6
    );
    println!(
        "s0={:#x} s1={:#x} s2={:#x} s3={:#x} s4={:#x} s5={:#x} s6={:#x}",
        tf.s0, tf.s1, tf.s2, tf.s3, tf.s4, tf.s5, tf.s6
    );
    println!(
        "s7={:#x} s8={:#x} s9={:#x} s10={:#x} s11={:#x}",
        tf.s7, tf.s8, tf.s9, tf.s10, tf.s11
    );
    panic!("fatal trap");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_layout_matches_entry_code() {
        // The assembly stores the interrupted sp at offset 8 and the CSRs
        // at 248..280; the const asserts above enforce the rest.
        assert_eq!(TRAP_FRAME_SIZE, 288);
        let mut tf = TrapFrame::zeroed();
        tf.a0 = 1;
        tf.a5 = 6;
        assert_eq!(tf.arg(0), 1);
        assert_eq!(tf.arg(5), 6);
        tf.set_ret(99);
        assert_eq!(tf.a0, 99);
    }

    #[test]
    fn user_mode_detection() {
        let mut tf = TrapFrame::zeroed();
        assert!(tf.from_user());
        tf.sstatus = Sstatus::SPP.bits();
        assert!(!tf.from_user());
    }
}
