//! System calls.
//!
//! ABI: number in a7, arguments in a0..a5, result in a0. The trap
//! dispatcher has already advanced sepc past the 4-byte ecall.
//!
//! Every user pointer is validated twice over: bounds-checked into user
//! space, then confirmed present with U+R (and +W for writes) by walking
//! the process page directory. A bad pointer kills the process with
//! exit(-1); an unknown number just returns -1 in a0.
//!
//! The file-backed calls delegate to the registered file-system
//! collaborator and forward its verdicts unchanged.

use crate::error::{KernelError, Result};
use crate::memlayout::USER_TOP;
use crate::param::{CMDLINE_MAX, NOFILE};
use crate::process::{self, Process};
use crate::riscv::{pgrounddown, PteFlags, PGSIZE};
use crate::trap::TrapFrame;
use crate::{console, fs, kernel, thread};

pub const SYS_HALT: usize = 0;
pub const SYS_EXIT: usize = 1;
pub const SYS_EXEC: usize = 2;
pub const SYS_WAIT: usize = 3;
pub const SYS_CREATE: usize = 4;
pub const SYS_REMOVE: usize = 5;
pub const SYS_OPEN: usize = 6;
pub const SYS_FILESIZE: usize = 7;
pub const SYS_READ: usize = 8;
pub const SYS_WRITE: usize = 9;
pub const SYS_SEEK: usize = 10;
pub const SYS_TELL: usize = 11;
pub const SYS_CLOSE: usize = 12;

/// Console descriptors; real files start above them.
const FD_STDIN: usize = 0;
const FD_STDOUT: usize = 1;
const FD_BASE: usize = 2;

fn current_process() -> &'static mut Process {
    let cur = thread::current();
    // SAFETY: syscalls arrive only from user mode, so the current thread
    // belongs to a process.
    unsafe {
        (*cur)
            .process
            .as_mut()
            .expect("syscall from a kernel thread")
    }
}

/// Bounds-only part of pointer validation: non-null, no overflow, and the
/// whole range below the user virtual top.
fn range_in_user_space(addr: usize, len: usize) -> Result<()> {
    if addr == 0 {
        return Err(KernelError::BadVirtualAddress);
    }
    let end = addr.checked_add(len).ok_or(KernelError::BadVirtualAddress)?;
    if end > USER_TOP {
        return Err(KernelError::BadVirtualAddress);
    }
    Ok(())
}

/// Full validation: bounds, then a page-directory walk demanding U+R and,
/// for writes, +W on every touched page.
fn check_user_range(addr: usize, len: usize, write: bool) -> Result<()> {
    range_in_user_space(addr, len)?;
    if len == 0 {
        return Ok(());
    }
    let proc = current_process();
    let mut need = PteFlags::U | PteFlags::R;
    if write {
        need |= PteFlags::W;
    }
    for page in num_iter::range_step(pgrounddown(addr), addr + len, PGSIZE) {
        let flags = proc
            .dir
            .user_page_flags(page)
            .ok_or(KernelError::BadVirtualAddress)?;
        if !flags.contains(need) {
            return Err(KernelError::BadVirtualAddress);
        }
    }
    Ok(())
}

/// A validated user buffer, readable through the current satp (SUM is on).
fn user_slice(addr: usize, len: usize) -> Result<&'static [u8]> {
    check_user_range(addr, len, false)?;
    // SAFETY: just validated under the live page directory.
    Ok(unsafe { core::slice::from_raw_parts(addr as *const u8, len) })
}

fn user_slice_mut(addr: usize, len: usize) -> Result<&'static mut [u8]> {
    check_user_range(addr, len, true)?;
    // SAFETY: as above, with W verified.
    Ok(unsafe { core::slice::from_raw_parts_mut(addr as *mut u8, len) })
}

/// Copy a null-terminated user string, validating page by page.
fn user_str(addr: usize, buf: &mut [u8]) -> Result<usize> {
    let mut len = 0;
    loop {
        if len == buf.len() {
            return Err(KernelError::InvalidArgument);
        }
        let va = addr.checked_add(len).ok_or(KernelError::BadVirtualAddress)?;
        check_user_range(va, 1, false)?;
        // SAFETY: the byte was just validated.
        let byte = unsafe { *(va as *const u8) };
        if byte == 0 {
            return Ok(len);
        }
        buf[len] = byte;
        len += 1;
    }
}

fn user_str_utf8<'a>(addr: usize, buf: &'a mut [u8]) -> Result<&'a str> {
    let len = user_str(addr, buf)?;
    core::str::from_utf8(&buf[..len]).map_err(|_| KernelError::InvalidArgument)
}

/// Dispatch. Pointer faults never come back from `kill_current`.
pub fn dispatch(tf: &mut TrapFrame) {
    let result = match tf.a7 {
        SYS_HALT => kernel::shutdown(),
        SYS_EXIT => process::exit(tf.arg(0) as i32),
        SYS_EXEC => sys_exec(tf),
        SYS_WAIT => Ok(process::wait(tf.arg(0)) as usize),
        SYS_CREATE => sys_create(tf),
        SYS_REMOVE => sys_remove(tf),
        SYS_OPEN => sys_open(tf),
        SYS_FILESIZE => sys_filesize(tf),
        SYS_READ => sys_read(tf),
        SYS_WRITE => sys_write(tf),
        SYS_SEEK => sys_seek(tf),
        SYS_TELL => sys_tell(tf),
        SYS_CLOSE => sys_close(tf),
        _ => Err(KernelError::InvalidArgument),
    };
    match result {
        Ok(v) => tf.set_ret(v),
        Err(KernelError::BadVirtualAddress) => process::kill_current(),
        Err(_) => tf.set_ret(usize::MAX),
    }
}

fn sys_exec(tf: &TrapFrame) -> Result<usize> {
    let mut buf = [0u8; CMDLINE_MAX];
    let cmd = user_str_utf8(tf.arg(0), &mut buf)?;
    process::execute(cmd)
}

fn sys_create(tf: &TrapFrame) -> Result<usize> {
    let mut buf = [0u8; CMDLINE_MAX];
    let path = user_str_utf8(tf.arg(0), &mut buf)?;
    fs::get()?.create(path, tf.arg(1) as u32)?;
    Ok(0)
}

fn sys_remove(tf: &TrapFrame) -> Result<usize> {
    let mut buf = [0u8; CMDLINE_MAX];
    let path = user_str_utf8(tf.arg(0), &mut buf)?;
    fs::get()?.remove(path)?;
    Ok(0)
}

fn sys_open(tf: &TrapFrame) -> Result<usize> {
    let mut buf = [0u8; CMDLINE_MAX];
    let path = user_str_utf8(tf.arg(0), &mut buf)?;
    let handle = fs::get()?.open(path)?;
    let proc = current_process();
    for (i, slot) in proc.files.iter_mut().enumerate() {
        if slot.is_none() {
            *slot = Some(handle);
            return Ok(FD_BASE + i);
        }
    }
    fs::get()?.close(handle);
    Err(KernelError::OutOfMemory)
}

fn file_of(fd: usize) -> Result<fs::FileHandle> {
    if fd < FD_BASE || fd >= FD_BASE + NOFILE {
        return Err(KernelError::InvalidArgument);
    }
    current_process().files[fd - FD_BASE].ok_or(KernelError::InvalidArgument)
}

fn sys_filesize(tf: &TrapFrame) -> Result<usize> {
    Ok(fs::get()?.file_size(file_of(tf.arg(0))?)? as usize)
}

fn sys_read(tf: &TrapFrame) -> Result<usize> {
    let fd = tf.arg(0);
    let buf = user_slice_mut(tf.arg(1), tf.arg(2))?;
    if fd == FD_STDIN {
        for (i, b) in buf.iter_mut().enumerate() {
            *b = loop {
                match console::read_byte() {
                    Some(byte) => break byte,
                    // No input pending; let somebody else run.
                    None => {
                        if i > 0 {
                            return Ok(i);
                        }
                        thread::yield_now();
                    }
                }
            };
        }
        return Ok(buf.len());
    }
    fs::get()?.read(file_of(fd)?, buf)
}

fn sys_write(tf: &TrapFrame) -> Result<usize> {
    let fd = tf.arg(0);
    let buf = user_slice(tf.arg(1), tf.arg(2))?;
    if fd == FD_STDOUT {
        console::write_bytes(buf);
        return Ok(buf.len());
    }
    fs::get()?.write(file_of(fd)?, buf)
}

fn sys_seek(tf: &TrapFrame) -> Result<usize> {
    fs::get()?.seek(file_of(tf.arg(0))?, tf.arg(1) as u64)?;
    Ok(0)
}

fn sys_tell(tf: &TrapFrame) -> Result<usize> {
    Ok(fs::get()?.tell(file_of(tf.arg(0))?)? as usize)
}

fn sys_close(tf: &TrapFrame) -> Result<usize> {
    let fd = tf.arg(0);
    if fd < FD_BASE || fd >= FD_BASE + NOFILE {
        return Err(KernelError::InvalidArgument);
    }
    let proc = current_process();
    let handle = proc.files[fd - FD_BASE]
        .take()
        .ok_or(KernelError::InvalidArgument)?;
    fs::get()?.close(handle);
    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bounds_checks() {
        assert!(range_in_user_space(0x1000, 0x1000).is_ok());
        assert!(range_in_user_space(USER_TOP - 8, 8).is_ok());
        // Null, kernel-half, overflow, and straddling pointers all fail.
        assert_eq!(
            range_in_user_space(0, 1),
            Err(KernelError::BadVirtualAddress)
        );
        assert_eq!(
            range_in_user_space(USER_TOP, 1),
            Err(KernelError::BadVirtualAddress)
        );
        assert_eq!(
            range_in_user_space(USER_TOP - 4, 8),
            Err(KernelError::BadVirtualAddress)
        );
        assert_eq!(
            range_in_user_space(usize::MAX, 2),
            Err(KernelError::BadVirtualAddress)
        );
    }

    #[test]
    fn zero_length_ranges_pass_bounds() {
        assert!(range_in_user_space(0x1000, 0).is_ok());
    }
}
