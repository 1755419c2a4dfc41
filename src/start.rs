//! Machine entry.
//!
//! OpenSBI jumps here in supervisor mode with the boot hart id in a0 and a
//! pointer to the device-tree blob in a1, paging off and bss whatever the
//! loader left there. The entry parks the two arguments, zeroes bss, sets
//! up the boot stack, and calls into Rust.

cfg_if::cfg_if! {
    if #[cfg(target_arch = "riscv64")] {
        core::arch::global_asm!(
            r#"
            .section .text.entry
            .globl _entry
            _entry:
                # a0 = boot hart id, a1 = device-tree blob.
                mv s0, a0
                mv s1, a1
                la sp, boot_stack_top
                # Zero .bss (the boot stack lives there too; it holds
                # nothing yet).
                la t0, sbss
                la t1, ebss
            1:
                bgeu t0, t1, 2f
                sd zero, 0(t0)
                addi t0, t0, 8
                j 1b
            2:
                mv a0, s0
                mv a1, s1
                call kernel_main
            3:
                wfi
                j 3b

            .section .bss.stack
            .align 12
            .globl boot_stack
            boot_stack:
                .space 16384
            .globl boot_stack_top
            boot_stack_top:
            "#
        );

        extern "C" {
            // kernel.ld places this after the last loaded section.
            static end: u8;
        }

        /// First address after the kernel image; page allocation starts
        /// here.
        pub fn kernel_image_end() -> usize {
            // SAFETY: taking the address of a linker symbol.
            unsafe { &end as *const u8 as usize }
        }
    } else {
        pub fn kernel_image_end() -> usize {
            0
        }
    }
}
