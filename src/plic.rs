//! The riscv Platform-Level Interrupt Controller (PLIC).
//!
//! Per-source priority registers, a per-hart supervisor enable bit-array, a
//! per-hart threshold, and a per-hart claim/complete register. All device
//! interrupts funnel through the supervisor-external cause; `external_intr`
//! claims the pending source, runs the registered handler, and completes it.

use crate::intr::{HeldInterrupts, IntrCell};
use crate::memlayout::PLIC_BASE;
use crate::riscv::Sie;
use crate::trap;

/// Interrupt sources on qemu -machine virt (virtio 1..8, uart 10).
pub const NSRC: usize = 64;

const fn priority_reg(src: u32) -> usize {
    PLIC_BASE + 4 * src as usize
}

/// Supervisor-context enable words for hart 0.
const fn senable_reg(src: u32) -> usize {
    PLIC_BASE + 0x2080 + 4 * (src as usize / 32)
}

const SPRIORITY_REG: usize = PLIC_BASE + 0x20_1000;
const SCLAIM_REG: usize = PLIC_BASE + 0x20_1004;

fn write_reg(addr: usize, value: u32) {
    // SAFETY: addr is a PLIC register inside the identity-mapped window.
    unsafe { core::ptr::write_volatile(addr as *mut u32, value) };
}

fn read_reg(addr: usize) -> u32 {
    // SAFETY: as above.
    unsafe { core::ptr::read_volatile(addr as *const u32) }
}

/// Per-source handlers. Handlers take no arguments and must not block.
static HANDLERS: IntrCell<[Option<fn()>; NSRC]> = IntrCell::new([None; NSRC]);

/// Clear every priority and enable bit, open the threshold, and turn on
/// supervisor external interrupts.
pub fn init() {
    for src in 1..NSRC as u32 {
        write_reg(priority_reg(src), 0);
    }
    for word in 0..(NSRC as u32 + 31) / 32 {
        write_reg(PLIC_BASE + 0x2080 + 4 * word as usize, 0);
    }
    write_reg(SPRIORITY_REG, 0);

    trap::register_irq(crate::riscv::IRQ_S_EXTERNAL, external_intr);
    // SAFETY: enabling a single sie bit; the handler above is installed.
    unsafe { (Sie::read() | Sie::SEIE).write() };
}

/// Route `src` to `handler` and enable it at priority 1.
pub fn register(src: u32, handler: fn()) {
    assert!((src as usize) < NSRC && src != 0);
    let mut held = HeldInterrupts::new();
    HANDLERS.borrow_mut(&mut held)[src as usize] = Some(handler);
    drop(held);
    set_priority(src, 1);
    enable(src);
}

/// Set the enable bit for `src` in this hart's supervisor context.
pub fn enable(src: u32) {
    let reg = senable_reg(src);
    write_reg(reg, read_reg(reg) | (1 << (src % 32)));
}

/// Source priorities clamp to 0..=7; 0 disables delivery.
pub fn set_priority(src: u32, priority: u32) {
    write_reg(priority_reg(src), priority.min(7));
}

/// Ask the PLIC which source to serve: the highest-priority pending one,
/// or 0 when the claim is spurious.
pub fn claim() -> u32 {
    read_reg(SCLAIM_REG)
}

/// Tell the PLIC the source has been served.
pub fn complete(src: u32) {
    write_reg(SCLAIM_REG, src);
}

/// The supervisor-external cause handler: claim, dispatch, complete.
fn external_intr() {
    let src = claim();
    if src == 0 {
        // Spurious claim; another hart or an earlier claim drained it.
        return;
    }
    let handler = {
        let mut held = HeldInterrupts::new();
        HANDLERS
            .borrow_mut(&mut held)
            .get(src as usize)
            .copied()
            .flatten()
    };
    match handler {
        Some(h) => h(),
        None => println!("plic: no handler for source {}", src),
    }
    complete(src);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_addresses() {
        assert_eq!(priority_reg(10), PLIC_BASE + 40);
        assert_eq!(senable_reg(10), PLIC_BASE + 0x2080);
        assert_eq!(senable_reg(40), PLIC_BASE + 0x2084);
    }
}
