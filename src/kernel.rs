//! Boot sequencing and the kernel-wide entry points.
//!
//! Global mutable state owned here (boot hart id, RAM bound, the saved
//! command line) follows the init-then-read-mostly lifecycle: written once
//! before the first action runs, read-only after.

use core::sync::atomic::{AtomicUsize, Ordering};

use arrayvec::ArrayString;

use crate::intr::IntrCell;
use crate::memlayout::DRAM_BASE;
use crate::param::{CMDLINE_MAX, DEFAULT_RAM};
use crate::{cmdline, fdt, kalloc, plic, sbi, start, thread, timer, trap, virtio_disk, vm};

static BOOT_HART: AtomicUsize = AtomicUsize::new(0);
static RAM_END: AtomicUsize = AtomicUsize::new(0);

/// The boot arguments, copied out of the device tree before anything else
/// can touch that memory.
static BOOTARGS: IntrCell<ArrayString<CMDLINE_MAX>> = IntrCell::new(ArrayString::new_const());

/// Parsed boot options, for collaborators that care about `-f` and the
/// disk role names. Written once during boot.
static OPTIONS: IntrCell<cmdline::BootOptions> = IntrCell::new(cmdline::BootOptions::new());

pub fn boot_options() -> &'static cmdline::BootOptions {
    // SAFETY: written once before the first action runs, read-only after.
    unsafe { &*OPTIONS.get_mut_raw() }
}

pub fn boot_hart() -> usize {
    BOOT_HART.load(Ordering::Relaxed)
}

pub fn ram_end() -> usize {
    RAM_END.load(Ordering::Relaxed)
}

/// Pull `/chosen/bootargs` and the RAM range out of the blob. Missing or
/// unparseable pieces fall back to the defaults ("-q", 128 MiB).
fn read_device_tree(dtb_pa: usize) -> usize {
    let mut ram_end = DRAM_BASE + DEFAULT_RAM;
    // SAFETY: single boot hart, before interrupts exist.
    let bootargs = unsafe { &mut *BOOTARGS.get_mut_raw() };

    if dtb_pa != 0 {
        // SAFETY: the firmware hands us a readable blob; trust its
        // self-reported size only within reason.
        let header = unsafe { core::slice::from_raw_parts(dtb_pa as *const u8, 8) };
        let total = u32::from_be_bytes(header[4..8].try_into().unwrap()) as usize;
        if (40..2 * 1024 * 1024).contains(&total) {
            // SAFETY: as above, now with the declared length.
            let blob = unsafe { core::slice::from_raw_parts(dtb_pa as *const u8, total) };
            if let Ok(tree) = fdt::Fdt::parse(blob) {
                if let Some((base, size)) = tree.memory_range() {
                    ram_end = (base + size) as usize;
                }
                if let Some(args) = tree.bootargs() {
                    for c in args.chars().take(CMDLINE_MAX - 1) {
                        let _ = bootargs.try_push(c);
                    }
                }
            }
        }
    }
    if bootargs.is_empty() {
        let _ = bootargs.try_push_str("-q");
    }
    ram_end
}

/// The boot path: firmware hands control to `_entry`, which lands here.
#[no_mangle]
pub extern "C" fn kernel_main(hartid: usize, dtb_pa: usize) -> ! {
    BOOT_HART.store(hartid, Ordering::Relaxed);
    let _ = sbi::init();

    let ram_end = read_device_tree(dtb_pa);
    RAM_END.store(ram_end, Ordering::Relaxed);

    println!("Pintos booting with {} kB RAM...", (ram_end - DRAM_BASE) / 1024);

    // Options steer the allocator split and the scheduler, so they are
    // consumed before either exists; the actions wait until the end.
    // SAFETY: BOOTARGS was filled above and is read-only from here on.
    let line: &str = unsafe { &*BOOTARGS.get_mut_raw() };
    let (options, actions) = cmdline::parse(line);
    let policy = options.policy;
    let user_limit = options.user_limit;
    // SAFETY: single boot hart; nothing reads the options yet.
    unsafe { *OPTIONS.get_mut_raw() = options };

    thread::init(policy);

    // SAFETY: the range above the image is unused RAM; called once.
    unsafe { kalloc::init(start::kernel_image_end(), ram_end, user_limit) };

    // SAFETY: allocator up, no user directories yet, called once.
    unsafe { vm::init(ram_end) }.expect("building the kernel page tables");

    trap::init();
    trap::register_irq(crate::riscv::IRQ_S_SOFT, trap::software_intr);
    plic::init();
    timer::init();

    thread::start().expect("starting the scheduler");

    virtio_disk::probe();

    println!("Boot complete.");

    cmdline::run_actions(&actions);

    shutdown()
}

/// The only way out: statistics, the farewell line, firmware power-off.
pub fn shutdown() -> ! {
    timer::print_stats();
    println!("Powering off...");
    sbi::shutdown()
}

/// Handles panic: flag the console, report, and halt the hart. The panic
/// path is the last line of defense, so it never returns to whatever went
/// wrong.
#[cfg(not(test))]
#[panic_handler]
fn panic_handler(info: &core::panic::PanicInfo<'_>) -> ! {
    crate::console::set_panicked();
    crate::riscv::intr_off();
    println!("kernel panic: {}", info);
    loop {
        crate::riscv::wfi();
    }
}
