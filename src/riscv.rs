//! Supervisor-level RISC-V state: CSR accessors, fences, and the Sv39
//! address-translation constants and arithmetic.
//!
//! Privileged instructions only exist on the target; on other architectures
//! the CSRs are emulated with plain statics so that the architecture-neutral
//! parts of the kernel can be exercised by host unit tests.

use bitflags::bitflags;

/// Bytes per page.
pub const PGSIZE: usize = 4096;
/// Bits of offset within a page.
pub const PGSHIFT: usize = 12;
/// Page-table entries per page-table page.
pub const PTE_PER_PT: usize = PGSIZE / 8;
/// Page-table levels in Sv39.
pub const PT_LEVELS: usize = 3;

/// One beyond the highest usable virtual address.
///
/// Sv39 virtual addresses are sign-extended from bit 38; the kernel half
/// occupies the negative (upper) canonical range, the user half the
/// non-negative one, so user addresses are below `1 << 38`.
pub const MAXVA: usize = 1 << (9 + 9 + 9 + PGSHIFT - 1);

/// Bytes spanned by a leaf at the given level (0 = 4 KiB, 1 = 2 MiB, 2 = 1 GiB).
pub const fn level_size(level: usize) -> usize {
    PGSIZE << (9 * level)
}

pub const fn pgroundup(addr: usize) -> usize {
    addr.wrapping_add(PGSIZE - 1) & !(PGSIZE - 1)
}

pub const fn pgrounddown(addr: usize) -> usize {
    addr & !(PGSIZE - 1)
}

/// 9-bit page-table index mask.
pub const PX_MASK: usize = 0x1ff;

pub const fn pxshift(level: usize) -> usize {
    PGSHIFT + 9 * level
}

/// Extract the page-table index for `level` from a virtual address.
pub const fn px(level: usize, va: usize) -> usize {
    (va >> pxshift(level)) & PX_MASK
}

bitflags! {
    /// Sv39 page-table entry flags.
    pub struct PteFlags: usize {
        /// Valid.
        const V = 1 << 0;
        /// Readable.
        const R = 1 << 1;
        /// Writable.
        const W = 1 << 2;
        /// Executable.
        const X = 1 << 3;
        /// User-accessible.
        const U = 1 << 4;
        /// Global mapping, present in all address spaces.
        const G = 1 << 5;
        /// Accessed.
        const A = 1 << 6;
        /// Dirty. The architecture forbids writes through a W=1, D=0 entry.
        const D = 1 << 7;
        /// Software bits.
        const RSW0 = 1 << 8;
        const RSW1 = 1 << 9;
    }
}

/// Shift a physical address into PPN position for a PTE.
pub const fn pa2pte(pa: usize) -> usize {
    (pa >> PGSHIFT) << 10
}

pub const fn pte2pa(pte: usize) -> usize {
    (pte >> 10) << PGSHIFT
}

/// Sv39 translation mode in satp.
pub const SATP_SV39: usize = 8 << 60;

/// Compose satp from a root-table physical address and an address-space id.
pub const fn make_satp(root_pa: usize, asid: u16) -> usize {
    SATP_SV39 | ((asid as usize) << 44) | (root_pa >> PGSHIFT)
}

pub const fn satp_asid(satp: usize) -> u16 {
    ((satp >> 44) & 0xffff) as u16
}

pub const fn satp_root(satp: usize) -> usize {
    (satp & ((1 << 44) - 1)) << PGSHIFT
}

bitflags! {
    /// Supervisor status register.
    pub struct Sstatus: usize {
        /// Supervisor interrupt enable.
        const SIE = 1 << 1;
        /// Value of SIE before the last trap; restored by sret.
        const SPIE = 1 << 5;
        /// Previous privilege: 1 = supervisor, 0 = user.
        const SPP = 1 << 8;
        /// Permit supervisor access to user-accessible pages.
        const SUM = 1 << 18;
    }
}

impl Sstatus {
    pub fn read() -> Self {
        Self::from_bits_truncate(r_sstatus())
    }

    pub unsafe fn write(self) {
        unsafe { w_sstatus(self.bits()) }
    }
}

bitflags! {
    /// Supervisor interrupt-enable register.
    pub struct Sie: usize {
        /// Software.
        const SSIE = 1 << 1;
        /// Timer.
        const STIE = 1 << 5;
        /// External.
        const SEIE = 1 << 9;
    }
}

impl Sie {
    pub fn read() -> Self {
        Self::from_bits_truncate(r_sie())
    }

    pub unsafe fn write(self) {
        unsafe { w_sie(self.bits()) }
    }
}

/// Interrupt bit of scause.
pub const SCAUSE_INTERRUPT: usize = 1 << 63;

/// Interrupt cause codes.
pub const IRQ_S_SOFT: usize = 1;
pub const IRQ_S_TIMER: usize = 5;
pub const IRQ_S_EXTERNAL: usize = 9;

/// Exception cause codes.
pub const EXC_INSTR_MISALIGNED: usize = 0;
pub const EXC_INSTR_ACCESS: usize = 1;
pub const EXC_ILLEGAL_INSTR: usize = 2;
pub const EXC_BREAKPOINT: usize = 3;
pub const EXC_LOAD_MISALIGNED: usize = 4;
pub const EXC_LOAD_ACCESS: usize = 5;
pub const EXC_STORE_MISALIGNED: usize = 6;
pub const EXC_STORE_ACCESS: usize = 7;
pub const EXC_ECALL_USER: usize = 8;
pub const EXC_INSTR_PAGE_FAULT: usize = 12;
pub const EXC_LOAD_PAGE_FAULT: usize = 13;
pub const EXC_STORE_PAGE_FAULT: usize = 15;

pub const fn scause_is_interrupt(scause: usize) -> bool {
    scause & SCAUSE_INTERRUPT != 0
}

pub const fn scause_code(scause: usize) -> usize {
    scause & !SCAUSE_INTERRUPT
}

cfg_if::cfg_if! {
    if #[cfg(target_arch = "riscv64")] {
        use core::arch::asm;

        #[inline]
        pub fn r_sstatus() -> usize {
            let x: usize;
            unsafe { asm!("csrr {}, sstatus", out(reg) x) };
            x
        }

        #[inline]
        pub unsafe fn w_sstatus(x: usize) {
            unsafe { asm!("csrw sstatus, {}", in(reg) x) };
        }

        #[inline]
        pub fn r_sie() -> usize {
            let x: usize;
            unsafe { asm!("csrr {}, sie", out(reg) x) };
            x
        }

        #[inline]
        pub unsafe fn w_sie(x: usize) {
            unsafe { asm!("csrw sie, {}", in(reg) x) };
        }

        #[inline]
        pub fn r_sip() -> usize {
            let x: usize;
            unsafe { asm!("csrr {}, sip", out(reg) x) };
            x
        }

        #[inline]
        pub unsafe fn w_sip(x: usize) {
            unsafe { asm!("csrw sip, {}", in(reg) x) };
        }

        #[inline]
        pub unsafe fn w_stvec(x: usize) {
            unsafe { asm!("csrw stvec, {}", in(reg) x) };
        }

        #[inline]
        pub fn r_satp() -> usize {
            let x: usize;
            unsafe { asm!("csrr {}, satp", out(reg) x) };
            x
        }

        #[inline]
        pub unsafe fn w_satp(x: usize) {
            unsafe { asm!("csrw satp, {}", in(reg) x) };
        }

        #[inline]
        pub fn r_sscratch() -> usize {
            let x: usize;
            unsafe { asm!("csrr {}, sscratch", out(reg) x) };
            x
        }

        #[inline]
        pub unsafe fn w_sscratch(x: usize) {
            unsafe { asm!("csrw sscratch, {}", in(reg) x) };
        }

        #[inline]
        pub fn r_sepc() -> usize {
            let x: usize;
            unsafe { asm!("csrr {}, sepc", out(reg) x) };
            x
        }

        #[inline]
        pub unsafe fn w_sepc(x: usize) {
            unsafe { asm!("csrw sepc, {}", in(reg) x) };
        }

        #[inline]
        pub fn r_scause() -> usize {
            let x: usize;
            unsafe { asm!("csrr {}, scause", out(reg) x) };
            x
        }

        #[inline]
        pub fn r_stval() -> usize {
            let x: usize;
            unsafe { asm!("csrr {}, stval", out(reg) x) };
            x
        }

        /// Read the platform time counter.
        #[inline]
        pub fn r_time() -> u64 {
            let x: u64;
            unsafe { asm!("rdtime {}", out(reg) x) };
            x
        }

        /// Flush the entire TLB.
        #[inline]
        pub fn sfence_vma_all() {
            unsafe { asm!("sfence.vma zero, zero") };
        }

        /// Flush TLB entries for a single virtual address, all address spaces.
        #[inline]
        pub fn sfence_vma_page(va: usize) {
            unsafe { asm!("sfence.vma {}, zero", in(reg) va) };
        }

        /// Synchronize the instruction stream after writing code pages.
        #[inline]
        pub fn fence_i() {
            unsafe { asm!("fence.i") };
        }

        /// Full memory fence.
        #[inline]
        pub fn fence_rw() {
            unsafe { asm!("fence rw, rw") };
        }

        /// Wait for an interrupt.
        #[inline]
        pub fn wfi() {
            unsafe { asm!("wfi") };
        }
    } else if #[cfg(test)] {
        // Host test shims. CSRs become thread-local cells so that
        // concurrently running unit tests each see their own machine state.
        use core::cell::Cell;

        std::thread_local! {
            static SSTATUS: Cell<usize> = const { Cell::new(0) };
            static SIE: Cell<usize> = const { Cell::new(0) };
            static SIP: Cell<usize> = const { Cell::new(0) };
            static SATP: Cell<usize> = const { Cell::new(0) };
            static SSCRATCH: Cell<usize> = const { Cell::new(0) };
            static SEPC: Cell<usize> = const { Cell::new(0) };
            static TIME: Cell<u64> = const { Cell::new(0) };
        }

        pub fn r_sstatus() -> usize {
            SSTATUS.with(Cell::get)
        }

        pub unsafe fn w_sstatus(x: usize) {
            SSTATUS.with(|c| c.set(x));
        }

        pub fn r_sie() -> usize {
            SIE.with(Cell::get)
        }

        pub unsafe fn w_sie(x: usize) {
            SIE.with(|c| c.set(x));
        }

        pub fn r_sip() -> usize {
            SIP.with(Cell::get)
        }

        pub unsafe fn w_sip(x: usize) {
            SIP.with(|c| c.set(x));
        }

        pub unsafe fn w_stvec(_x: usize) {}

        pub fn r_satp() -> usize {
            SATP.with(Cell::get)
        }

        pub unsafe fn w_satp(x: usize) {
            SATP.with(|c| c.set(x));
        }

        pub fn r_sscratch() -> usize {
            SSCRATCH.with(Cell::get)
        }

        pub unsafe fn w_sscratch(x: usize) {
            SSCRATCH.with(|c| c.set(x));
        }

        pub fn r_sepc() -> usize {
            SEPC.with(Cell::get)
        }

        pub unsafe fn w_sepc(x: usize) {
            SEPC.with(|c| c.set(x));
        }

        pub fn r_scause() -> usize {
            0
        }

        pub fn r_stval() -> usize {
            0
        }

        pub fn r_time() -> u64 {
            TIME.with(|c| {
                let t = c.get();
                c.set(t + 1);
                t
            })
        }

        pub fn sfence_vma_all() {}

        pub fn sfence_vma_page(_va: usize) {}

        pub fn fence_i() {}

        pub fn fence_rw() {
            core::sync::atomic::fence(core::sync::atomic::Ordering::SeqCst);
        }

        pub fn wfi() {}
    } else {
        // Non-test builds for a foreign architecture only need to link.
        pub fn r_sstatus() -> usize {
            0
        }

        pub unsafe fn w_sstatus(_x: usize) {}

        pub fn r_sie() -> usize {
            0
        }

        pub unsafe fn w_sie(_x: usize) {}

        pub fn r_sip() -> usize {
            0
        }

        pub unsafe fn w_sip(_x: usize) {}

        pub unsafe fn w_stvec(_x: usize) {}

        pub fn r_satp() -> usize {
            0
        }

        pub unsafe fn w_satp(_x: usize) {}

        pub fn r_sscratch() -> usize {
            0
        }

        pub unsafe fn w_sscratch(_x: usize) {}

        pub fn r_sepc() -> usize {
            0
        }

        pub unsafe fn w_sepc(_x: usize) {}

        pub fn r_scause() -> usize {
            0
        }

        pub fn r_stval() -> usize {
            0
        }

        pub fn r_time() -> u64 {
            0
        }

        pub fn sfence_vma_all() {}

        pub fn sfence_vma_page(_va: usize) {}

        pub fn fence_i() {}

        pub fn fence_rw() {
            core::sync::atomic::fence(core::sync::atomic::Ordering::SeqCst);
        }

        pub fn wfi() {}
    }
}

/// Enable device interrupts.
pub unsafe fn intr_on() {
    unsafe { w_sstatus(r_sstatus() | Sstatus::SIE.bits()) };
}

/// Disable device interrupts.
pub fn intr_off() {
    // Clearing SIE never creates a critical-section hazard.
    unsafe { w_sstatus(r_sstatus() & !Sstatus::SIE.bits()) };
}

/// Are device interrupts enabled?
pub fn intr_get() -> bool {
    r_sstatus() & Sstatus::SIE.bits() != 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_rounding() {
        assert_eq!(pgroundup(0), 0);
        assert_eq!(pgroundup(1), PGSIZE);
        assert_eq!(pgroundup(PGSIZE), PGSIZE);
        assert_eq!(pgroundup(PGSIZE + 1), 2 * PGSIZE);
        assert_eq!(pgrounddown(PGSIZE - 1), 0);
        assert_eq!(pgrounddown(PGSIZE + 5), PGSIZE);
    }

    #[test]
    fn page_table_indices() {
        let va = (3 << pxshift(2)) | (5 << pxshift(1)) | (7 << pxshift(0)) | 0x123;
        assert_eq!(px(2, va), 3);
        assert_eq!(px(1, va), 5);
        assert_eq!(px(0, va), 7);
    }

    #[test]
    fn pte_address_round_trip() {
        let pa = 0x8020_3000;
        assert_eq!(pte2pa(pa2pte(pa)), pa);
        assert_eq!(pa2pte(pa) & 0x3ff, 0);
    }

    #[test]
    fn satp_fields() {
        let satp = make_satp(0x8020_0000, 0x1234);
        assert_eq!(satp & SATP_SV39, SATP_SV39);
        assert_eq!(satp_asid(satp), 0x1234);
        assert_eq!(satp_root(satp), 0x8020_0000);
    }

    #[test]
    fn scause_decode() {
        assert!(scause_is_interrupt(SCAUSE_INTERRUPT | IRQ_S_TIMER));
        assert_eq!(scause_code(SCAUSE_INTERRUPT | IRQ_S_TIMER), IRQ_S_TIMER);
        assert!(!scause_is_interrupt(EXC_ECALL_USER));
    }

    #[test]
    fn leaf_sizes() {
        assert_eq!(level_size(0), 4096);
        assert_eq!(level_size(1), 2 * 1024 * 1024);
        assert_eq!(level_size(2), 1024 * 1024 * 1024);
    }
}
