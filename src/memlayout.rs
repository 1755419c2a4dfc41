//! Physical memory layout.
//!
//! qemu -machine virt is set up like this, based on qemu's hw/riscv/virt.c:
//!
//! 02000000 -- CLINT (machine mode only, owned by the firmware)
//! 0c000000 -- PLIC
//! 10000000 -- uart0 (owned by the firmware; console goes through SBI)
//! 10001000 -- virtio mmio slots, eight of them, 0x1000 apart
//! 80000000 -- DRAM; OpenSBI resident in the first 2 MiB
//! 80200000 -- kernel text and data
//! end      -- start of the page-allocation area
//!
//! The kernel keeps two views of physical memory: the identity window it was
//! booted on, and a direct-map window of all of RAM at `DIRECT_MAP_BASE` in
//! the upper canonical half. Both are built with gigapages and coexist; the
//! direct map is what `ptov` hands out for reaching arbitrary frames.

use crate::riscv::{pxshift, MAXVA, PX_MASK};

/// Start of DRAM.
pub const DRAM_BASE: usize = 0x8000_0000;

/// Where OpenSBI jumps into the kernel.
pub const KERNEL_BASE: usize = 0x8020_0000;

/// Platform-level interrupt controller.
pub const PLIC_BASE: usize = 0x0c00_0000;
pub const PLIC_SIZE: usize = 0x40_0000;

/// First virtio mmio slot; seven more follow at `VIRTIO_STRIDE` intervals.
pub const VIRTIO_BASE: usize = 0x1000_1000;
pub const VIRTIO_STRIDE: usize = 0x1000;
pub const VIRTIO_SLOTS: usize = 8;

/// Base of the kernel's direct map of physical memory. This is the lowest
/// canonical address of the upper half, so the direct map begins exactly at
/// root-table index 256: every entry from 256 up belongs to the kernel and is
/// shared into each process's page directory.
pub const DIRECT_MAP_BASE: usize = 0xffff_ffc0_0000_0000;

/// One beyond the highest user virtual address. User mappings live strictly
/// below this; the first page is never mapped so null dereferences fault.
pub const USER_TOP: usize = MAXVA;

/// Top of the user stack, which grows down from the top of the user half.
pub const USER_STACK_TOP: usize = USER_TOP;

/// Where the user heap starts growing up.
pub const USER_HEAP_BASE: usize = 0x1000_0000;

/// Root-table index where the kernel half begins.
pub const KERNEL_HALF_INDEX: usize = 256;

const _: () = assert!((DIRECT_MAP_BASE >> pxshift(2)) & PX_MASK == KERNEL_HALF_INDEX);

cfg_if::cfg_if! {
    if #[cfg(not(test))] {
        /// Translate a physical address into the direct-map window.
        pub const fn ptov(pa: usize) -> usize {
            pa + DIRECT_MAP_BASE
        }

        /// Translate a kernel virtual address back to physical. Identity
        /// addresses (the low window the kernel executes in) pass through.
        pub const fn vtop(va: usize) -> usize {
            if va >= DIRECT_MAP_BASE {
                va - DIRECT_MAP_BASE
            } else {
                va
            }
        }
    } else {
        // Host unit tests back "physical" frames with heap memory, so the
        // two views collapse to the identity.
        pub const fn ptov(pa: usize) -> usize {
            pa
        }

        pub const fn vtop(va: usize) -> usize {
            va
        }
    }
}

/// Does this address fall in the user half?
pub const fn is_user_vaddr(va: usize) -> bool {
    va < USER_TOP
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_boundary() {
        assert!(is_user_vaddr(0));
        assert!(is_user_vaddr(USER_TOP - 1));
        assert!(!is_user_vaddr(USER_TOP));
        assert!(!is_user_vaddr(DIRECT_MAP_BASE));
    }

    #[test]
    fn virtio_slots_do_not_overlap_plic() {
        let last = VIRTIO_BASE + (VIRTIO_SLOTS - 1) * VIRTIO_STRIDE;
        assert!(PLIC_BASE + PLIC_SIZE <= VIRTIO_BASE || last < PLIC_BASE);
    }
}
