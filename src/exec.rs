//! Loading user programs: ELF64 segments, the argument stack, and the
//! transition into user mode.

use core::cmp;
use core::ptr;

use zerocopy::AsBytes;

use crate::elf::{Elf64Ehdr, Elf64Phdr, ProgFlags, PT_LOAD};
use crate::error::{KernelError, Result};
use crate::fs::{FileHandle, FileSys};
use crate::kalloc::{self, PoolKind};
use crate::memlayout::{ptov, USER_STACK_TOP, USER_TOP};
use crate::param::MAXARG;
use crate::riscv::{pgrounddown, PteFlags, Sstatus, PGSIZE};
use crate::trap::{TrapFrame, TRAP_FRAME_SIZE};
use crate::vm::UserDir;
use crate::{thread, trap};

/// Leaf permissions from p_flags: readable always, the rest as flagged.
fn flags2perm(flags: ProgFlags) -> PteFlags {
    let mut perm = PteFlags::R;
    if flags.contains(ProgFlags::WRITE) {
        perm |= PteFlags::W;
    }
    if flags.contains(ProgFlags::EXEC) {
        perm |= PteFlags::X;
    }
    perm
}

fn read_exact(fs: &dyn FileSys, file: FileHandle, buf: &mut [u8]) -> Result<()> {
    if fs.read(file, buf)? != buf.len() {
        return Err(KernelError::BadExecutable);
    }
    Ok(())
}

/// Load every PT_LOAD segment of `file` into `dir`. Returns the entry
/// point. On failure the caller destroys the partially built directory;
/// pages already handed to it are freed by that destruction.
pub fn load(fs: &dyn FileSys, file: FileHandle, dir: &mut UserDir) -> Result<usize> {
    let mut ehdr = Elf64Ehdr::zeroed();
    fs.seek(file, 0)?;
    read_exact(fs, file, ehdr.as_bytes_mut())?;
    ehdr.validate()?;

    for i in 0..ehdr.phnum as u64 {
        let mut ph = Elf64Phdr::zeroed();
        fs.seek(file, ehdr.phoff + i * ehdr.phentsize as u64)?;
        read_exact(fs, file, ph.as_bytes_mut())?;
        // Zero-length LOAD segments occupy no memory.
        if ph.typ != PT_LOAD || ph.memsz == 0 {
            continue;
        }
        if ph.filesz > ph.memsz {
            return Err(KernelError::BadExecutable);
        }
        load_segment(fs, file, dir, &ph)?;
    }
    Ok(ehdr.entry as usize)
}

/// Bring in one segment: for every page overlapping [vaddr, vaddr+memsz),
/// allocate a zeroed frame, copy the intersection with the file-backed
/// prefix, and map it. The zeroed allocation is what makes bss work.
fn load_segment(
    fs: &dyn FileSys,
    file: FileHandle,
    dir: &mut UserDir,
    ph: &Elf64Phdr,
) -> Result<()> {
    let vaddr = ph.vaddr as usize;
    let memsz = ph.memsz as usize;
    let filesz = ph.filesz as usize;
    let end = vaddr.checked_add(memsz).ok_or(KernelError::BadExecutable)?;
    if end > USER_TOP {
        return Err(KernelError::BadVirtualAddress);
    }

    for page_va in num_iter::range_step(pgrounddown(vaddr), end, PGSIZE) {
        let page = kalloc::alloc_zeroed(PoolKind::User).ok_or(KernelError::OutOfMemory)?;
        // Until the directory owns it, a failed read must not strand the
        // frame.
        let mut page = scopeguard::guard(page, |page| kalloc::free(PoolKind::User, page));

        // The part of this page backed by file contents.
        let copy_from = cmp::max(page_va, vaddr);
        let copy_to = cmp::min(page_va + PGSIZE, vaddr + filesz);
        if copy_to > copy_from {
            fs.seek(file, ph.off + (copy_from - vaddr) as u64)?;
            let dst = &mut page.as_slice_mut()[copy_from - page_va..copy_to - page_va];
            read_exact(fs, file, dst)?;
        }

        let page = scopeguard::ScopeGuard::into_inner(page);
        let perm = flags2perm(ProgFlags::from_bits_truncate(ph.flags));
        dir.map_user_page(page_va, page, perm).map_err(|(e, page)| {
            kalloc::free(PoolKind::User, page);
            e
        })?;
    }
    Ok(())
}

/// Lay out the argument stack, descending from `top`:
/// the strings in reverse order (each null-terminated), a null sentinel
/// pointer, the argv pointers in forward order (so argv is a valid C
/// array), argv itself, argc, and a zero return-address slot. The returned
/// stack pointer is 16-byte aligned.
///
/// Writing goes through the callback so the layout is independent of where
/// the stack physically lives.
pub fn lay_out_args(
    top: usize,
    args: &[&str],
    write: &mut dyn FnMut(usize, &[u8]),
) -> Result<usize> {
    if args.len() > MAXARG {
        return Err(KernelError::InvalidArgument);
    }
    let mut sp = top;
    let mut addrs = [0usize; MAXARG];

    for (i, arg) in args.iter().enumerate().rev() {
        sp -= arg.len() + 1;
        addrs[i] = sp;
        write(sp, arg.as_bytes());
        write(sp + arg.len(), &[0]);
    }

    // Word-align, then pad so the final sp lands 16-aligned. Below the
    // strings go: the sentinel, argc pointers, argv, argc, and the fake
    // return address.
    sp &= !7;
    let words = args.len() + 4;
    if (sp - words * 8) % 16 != 0 {
        sp -= 8;
    }

    sp -= 8;
    write(sp, &0usize.to_le_bytes());
    for i in (0..args.len()).rev() {
        sp -= 8;
        write(sp, &addrs[i].to_le_bytes());
    }
    let argv = sp;
    sp -= 8;
    write(sp, &argv.to_le_bytes());
    sp -= 8;
    write(sp, &args.len().to_le_bytes());
    sp -= 8;
    write(sp, &0usize.to_le_bytes());

    debug_assert_eq!(sp % 16, 0);
    Ok(sp)
}

/// Map the user stack page and build the argument block on it. Returns the
/// initial user stack pointer.
pub fn setup_stack(dir: &mut UserDir, args: &[&str]) -> Result<usize> {
    let stack_base = USER_STACK_TOP - PGSIZE;

    // Strings plus the pointer block must fit the stack page.
    let bytes: usize =
        args.iter().map(|a| a.len() + 1).sum::<usize>() + (args.len() + 6) * 8;
    if bytes > PGSIZE {
        return Err(KernelError::InvalidArgument);
    }

    let page = kalloc::alloc_zeroed(PoolKind::User).ok_or(KernelError::OutOfMemory)?;
    let pa = page.pa();
    dir.map_user_page(stack_base, page, PteFlags::R | PteFlags::W)
        .map_err(|(e, page)| {
            kalloc::free(PoolKind::User, page);
            e
        })?;

    let frame = ptov(pa) as *mut u8;
    let mut write = |va: usize, bytes: &[u8]| {
        debug_assert!(va >= stack_base && va + bytes.len() <= USER_STACK_TOP);
        // SAFETY: va falls inside the single stack page mapped above.
        unsafe {
            ptr::copy_nonoverlapping(bytes.as_ptr(), frame.add(va - stack_base), bytes.len())
        };
    };
    lay_out_args(USER_STACK_TOP, args, &mut write)
}

/// Leave the kernel: compose a trap frame at the top of the current
/// thread's kernel stack, switch to the process page directory, and sret.
///
/// # Safety
///
/// The current thread must be a process main thread whose kernel stack is
/// the top of its thread page, and `entry`/`sp` must point into mappings
/// of `dir`.
pub unsafe fn start_user(entry: usize, sp: usize, dir: &UserDir) -> ! {
    let kstack_top = thread::current() as usize + PGSIZE;
    let frame = (kstack_top - TRAP_FRAME_SIZE) as *mut TrapFrame;
    // SAFETY: the frame slot is at the top of this thread's own stack.
    unsafe {
        ptr::write(frame, TrapFrame::zeroed());
        // Return to user (SPP clear), interrupts on after sret (SPIE), and
        // supervisor access to user pages for syscall copies (SUM).
        (*frame).sepc = entry;
        (*frame).sp = sp;
        (*frame).sstatus = (Sstatus::SPIE | Sstatus::SUM).bits();
    }

    dir.activate();
    // The instruction stream now includes freshly written code pages.
    crate::riscv::fence_i();

    // SAFETY: frame sits at the kernel stack top and satp is switched.
    unsafe { trap::enter_user(frame) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::test_support::RamFs;
    use crate::fs::FileSys;
    use crate::kalloc::test_support;
    use zerocopy::AsBytes;

    fn read_word(buf: &[u8], top: usize, va: usize) -> usize {
        let off = buf.len() - (top - va);
        usize::from_le_bytes(buf[off..off + 8].try_into().unwrap())
    }

    #[test]
    fn argument_stack_layout() {
        const TOP: usize = 0x4000_0000;
        let mut buf = vec![0u8; 512];
        let len = buf.len();
        let mut write = |va: usize, bytes: &[u8]| {
            let off = len - (TOP - va);
            buf[off..off + bytes.len()].copy_from_slice(bytes);
        };

        let args = ["echo", "hi", "xyzzy"];
        let sp = lay_out_args(TOP, &args, &mut write).unwrap();

        assert_eq!(sp % 16, 0);
        // [0 return slot][argc][argv][argv0..argv2][NULL]
        assert_eq!(read_word(&buf, TOP, sp), 0);
        assert_eq!(read_word(&buf, TOP, sp + 8), 3);
        let argv = read_word(&buf, TOP, sp + 16);
        assert_eq!(argv, sp + 24);
        let argv0 = read_word(&buf, TOP, argv);
        let argv1 = read_word(&buf, TOP, argv + 8);
        let argv2 = read_word(&buf, TOP, argv + 16);
        assert_eq!(read_word(&buf, TOP, argv + 24), 0, "argv sentinel");

        let str_at = |va: usize, want: &str| {
            let off = buf.len() - (TOP - va);
            assert_eq!(&buf[off..off + want.len()], want.as_bytes());
            assert_eq!(buf[off + want.len()], 0, "missing terminator");
        };
        str_at(argv0, "echo");
        str_at(argv1, "hi");
        str_at(argv2, "xyzzy");
        // Strings were pushed in reverse order: argv[0] is the lowest.
        assert!(argv0 < argv1 && argv1 < argv2);
    }

    #[test]
    fn argument_stack_rejects_too_many() {
        let mut sink = |_va: usize, _b: &[u8]| {};
        let many = ["x"; MAXARG + 1];
        assert_eq!(
            lay_out_args(0x1000_0000, &many, &mut sink),
            Err(KernelError::InvalidArgument)
        );
    }

    fn image_with_segment(vaddr: u64, body: &[u8], memsz: u64, flags: u32) -> Vec<u8> {
        let mut ehdr = crate::elf::test_support::valid_header();
        ehdr.phnum = 1;
        ehdr.phoff = 64;
        ehdr.entry = vaddr;
        let mut ph = Elf64Phdr::zeroed();
        ph.typ = PT_LOAD;
        ph.flags = flags;
        ph.off = 120;
        ph.vaddr = vaddr;
        ph.filesz = body.len() as u64;
        ph.memsz = memsz;
        let mut image = Vec::new();
        image.extend_from_slice(ehdr.as_bytes());
        image.extend_from_slice(ph.as_bytes());
        image.resize(120, 0);
        image.extend_from_slice(body);
        image
    }

    #[test]
    fn loads_a_segment_with_bss() {
        test_support::init_for_tests();
        let _mem = test_support::counting_guard();
        let body = b"user program text";
        // Two pages of memsz: the tail past filesz must read back zero.
        let image = image_with_segment(0x10000, body, 2 * PGSIZE as u64, 5);
        let fs = RamFs::with_file(&image);
        let file = fs.open("prog").unwrap();

        let mut dir = UserDir::new().unwrap();
        let entry = load(&fs, file, &mut dir).unwrap();
        assert_eq!(entry, 0x10000);

        let pa = dir.translate(0x10000).unwrap();
        let mapped = unsafe { core::slice::from_raw_parts(ptov(pa) as *const u8, PGSIZE) };
        assert_eq!(&mapped[..body.len()], body);
        assert!(mapped[body.len()..].iter().all(|&b| b == 0), "bss not zeroed");

        // R+X from p_flags = 5, and never writable without PF_W.
        let flags = dir.user_page_flags(0x10000).unwrap();
        assert!(flags.contains(PteFlags::X) && flags.contains(PteFlags::R));
        assert!(!flags.contains(PteFlags::W));
        assert!(dir.translate(0x10000 + PGSIZE).is_some(), "bss page missing");
    }

    #[test]
    fn zero_length_segments_occupy_nothing() {
        test_support::init_for_tests();
        let _mem = test_support::counting_guard();
        let image = image_with_segment(0x10000, b"", 0, 5);
        let fs = RamFs::with_file(&image);
        let file = fs.open("prog").unwrap();
        let mut dir = UserDir::new().unwrap();
        assert!(load(&fs, file, &mut dir).is_ok());
        assert!(dir.translate(0x10000).is_none());
    }

    #[test]
    fn rejects_filesz_beyond_memsz() {
        test_support::init_for_tests();
        let _mem = test_support::counting_guard();
        let image = image_with_segment(0x10000, b"0123456789", 4, 6);
        let fs = RamFs::with_file(&image);
        let file = fs.open("prog").unwrap();
        let mut dir = UserDir::new().unwrap();
        assert_eq!(load(&fs, file, &mut dir), Err(KernelError::BadExecutable));
    }

    #[test]
    fn stack_setup_fits_and_aligns() {
        test_support::init_for_tests();
        let _mem = test_support::counting_guard();
        let mut dir = UserDir::new().unwrap();
        let sp = setup_stack(&mut dir, &["prog", "a", "bb"]).unwrap();
        assert_eq!(sp % 16, 0);
        assert!(sp < USER_STACK_TOP && sp >= USER_STACK_TOP - PGSIZE);
        // argc sits one word above the return slot.
        let pa = dir.translate(sp + 8).unwrap();
        let argc = unsafe { *(ptov(pa) as *const usize) };
        assert_eq!(argc, 3);
    }
}
