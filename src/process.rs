//! User processes: control blocks, execute/wait/exit, and the page-fault
//! policy.
//!
//! One `Process` is authoritative; the thread side carries only a raw
//! pointer to it. The control block lives at the bottom of its own kernel
//! page and is torn down by its main thread on exit.
//!
//! Parent and child share a refcounted `ChildStatus` drawn from a static
//! pool: the child stores its exit code and ups the wait semaphore, the
//! parent downs it in `wait`. Whoever drops the count to zero returns the
//! slot; the count reaches zero exactly once.

use core::ptr;
use core::sync::atomic::{AtomicU32, Ordering};

use arrayvec::ArrayString;
use array_macro::array;

use crate::error::{KernelError, Result};
use crate::fs::FileHandle;
use crate::intr::{HeldInterrupts, IntrCell};
use crate::kalloc::{self, Page, PoolKind};
use crate::list::{List, ListEntry};
use crate::memlayout::{ptov, vtop, USER_TOP};
use crate::param::{NAME_MAX, NOFILE, NSTATUS, PRI_DEFAULT};
use crate::sync::{Condvar, Lock, Semaphore};
use crate::thread::{self, Thread};
use crate::trap::TrapFrame;
use crate::vm::UserDir;
use crate::{container_of, exec, fs, vm};

/// Exit synchronization, kept under one monitor: a lock, a condition the
/// last thread signals, the live-thread count, and the recorded code.
pub struct ExitMonitor {
    pub lock: Lock,
    pub all_dead: Condvar,
    pub live_threads: usize,
    pub exit_code: i32,
    pub exiting: bool,
}

/// Process control block.
pub struct Process {
    /// Root user page directory (kernel half shared with the kernel).
    pub dir: UserDir,
    pub name: ArrayString<NAME_MAX>,
    pub main_thread: *mut Thread,
    /// `ChildStatus` records of children, linked by their `elem`.
    pub children: List,
    /// This process's own shared status record.
    pub my_status: *mut ChildStatus,
    /// Descriptor table; 0 and 1 are the console and never appear here.
    pub files: [Option<FileHandle>; NOFILE],
    /// The executable, write-denied for as long as the process runs.
    pub exec_file: Option<FileHandle>,
    pub exit: ExitMonitor,
}

impl Process {
    /// Switch translation to this process's directory.
    pub fn activate(&mut self) {
        self.dir.activate();
    }
}

/// Shared parent/child exit status.
pub struct ChildStatus {
    in_use: bool,
    pub child_tid: usize,
    pub exit_code: i32,
    pub wait_sema: Semaphore,
    /// Two at birth: one reference each for parent and child.
    refs: AtomicU32,
    pub waited: bool,
    pub elem: ListEntry,
}

impl ChildStatus {
    const fn empty() -> Self {
        Self {
            in_use: false,
            child_tid: 0,
            exit_code: 0,
            wait_sema: Semaphore::new(0),
            refs: AtomicU32::new(0),
            waited: false,
            elem: ListEntry::new(),
        }
    }
}

/// The status pool. The refcounts are atomics guarded, like the list
/// linkage, by interrupt disabling.
static STATUS_POOL: IntrCell<[ChildStatus; NSTATUS]> =
    IntrCell::new(array![_ => ChildStatus::empty(); NSTATUS]);

fn alloc_status() -> Result<*mut ChildStatus> {
    let mut held = HeldInterrupts::new();
    let pool = STATUS_POOL.borrow_mut(&mut held);
    for slot in pool.iter_mut() {
        if !slot.in_use {
            slot.in_use = true;
            slot.child_tid = 0;
            slot.exit_code = 0;
            slot.waited = false;
            slot.refs.store(2, Ordering::Relaxed);
            // Drain any stale count from a previous occupant.
            while slot.wait_sema.try_down() {}
            return Ok(slot as *mut ChildStatus);
        }
    }
    Err(KernelError::OutOfMemory)
}

/// Drop one reference; the zeroth release returns the slot to the pool.
fn release_status(status: *mut ChildStatus) {
    let _held = HeldInterrupts::new();
    // SAFETY: interrupts are off; status points into the pool.
    unsafe {
        let prev = (*status).refs.fetch_sub(1, Ordering::Relaxed);
        assert!(prev > 0, "child status over-released");
        if prev == 1 {
            (*status).in_use = false;
        }
    }
}

/// Children spawned by the boot thread, which has no process of its own.
static KERNEL_CHILDREN: IntrCell<List> = IntrCell::new(List::new());

fn current_children() -> *mut List {
    let cur = thread::current();
    // SAFETY: the current thread is live.
    let proc = unsafe { (*cur).process };
    if proc.is_null() {
        KERNEL_CHILDREN.get_mut_raw()
    } else {
        // SAFETY: a non-null process pointer is a live PCB.
        unsafe { &mut (*proc).children }
    }
}

/// Hand-off block passed from `execute` to `start_process` at the bottom
/// of a borrowed page; the command line text follows it in the same page.
/// The child reads it, the parent frees it after `loaded` is upped.
struct ExecInfo {
    status: *mut ChildStatus,
    loaded: Semaphore,
    success: bool,
    cmdline_len: usize,
}

/// Offset of the command line text within the hand-off page.
const EXEC_INFO_TEXT: usize = core::mem::size_of::<ExecInfo>();

/// Start a user program. `cmdline` is the program name followed by its
/// arguments. Returns the child's id once the load outcome is known, or
/// an error if it never got off the ground.
pub fn execute(cmdline: &str) -> Result<usize> {
    let name = cmdline.split_whitespace().next().ok_or(KernelError::InvalidArgument)?;
    if cmdline.len() > crate::riscv::PGSIZE - EXEC_INFO_TEXT {
        return Err(KernelError::InvalidArgument);
    }

    let status = alloc_status()?;
    let mut page = match kalloc::alloc_zeroed(PoolKind::Kernel) {
        Some(p) => p,
        None => {
            release_status(status);
            release_status(status);
            return Err(KernelError::OutOfMemory);
        }
    };

    let base = page.as_mut_ptr();
    // SAFETY: the page is fresh, large enough, and exclusively ours.
    unsafe {
        ptr::write(
            base as *mut ExecInfo,
            ExecInfo {
                status,
                loaded: Semaphore::new(0),
                success: false,
                cmdline_len: cmdline.len(),
            },
        );
        ptr::copy_nonoverlapping(cmdline.as_ptr(), base.add(EXEC_INFO_TEXT), cmdline.len());
    }
    let info_pa = page.into_pa();

    let tid = match thread::create(name, PRI_DEFAULT, start_process, info_pa) {
        Ok(tid) => tid,
        Err(e) => {
            release_status(status);
            release_status(status);
            // SAFETY: the page was ours and the child never saw it.
            kalloc::free(PoolKind::Kernel, unsafe { Page::from_pa(info_pa) });
            return Err(e);
        }
    };

    // Register the child before it can exit: everything below runs before
    // the wait semaphore matters.
    {
        let _held = HeldInterrupts::new();
        // SAFETY: interrupts off; status slot is ours until released.
        unsafe {
            (*status).child_tid = tid;
            (*current_children()).push_back(&mut (*status).elem);
        }
    }

    // Wait for the load verdict.
    let info_ref = unsafe { &mut *(ptov(info_pa) as *mut ExecInfo) };
    info_ref.loaded.down();
    let success = info_ref.success;
    // SAFETY: the child is done with the hand-off page.
    kalloc::free(PoolKind::Kernel, unsafe { Page::from_pa(info_pa) });

    if success {
        Ok(tid)
    } else {
        Err(KernelError::BadExecutable)
    }
}

/// Entry of every process main thread: build the PCB, load the image,
/// construct the stack, and drop to user mode. Any failure reports through
/// the status record and exits.
extern "C" fn start_process(info_pa: usize) {
    let info = unsafe { &mut *(ptov(info_pa) as *mut ExecInfo) };
    let status = info.status;

    match build_process(info) {
        Ok((entry, sp)) => {
            info.success = true;
            info.loaded.up();
            let cur = thread::current();
            // SAFETY: build_process installed the PCB on this thread.
            let proc = unsafe { &mut *(*cur).process };
            // SAFETY: entry and sp come from the freshly built image.
            unsafe { exec::start_user(entry, sp, &proc.dir) };
        }
        Err(_) => {
            // The parent learns the code through the status record.
            {
                let _held = HeldInterrupts::new();
                // SAFETY: interrupts off; the slot lives until released.
                unsafe { (*status).exit_code = -1 };
            }
            // SAFETY: status is live; up is the child's exit signal.
            unsafe { (*status).wait_sema.up() };
            info.success = false;
            info.loaded.up();
            release_status(status);
            thread::exit();
        }
    }
}

/// Everything that can fail while bringing a process up.
fn build_process(info: &mut ExecInfo) -> Result<(usize, usize)> {
    // SAFETY: execute wrote valid UTF-8 of this length after the header.
    let cmdline = unsafe {
        core::str::from_utf8_unchecked(core::slice::from_raw_parts(
            (info as *const ExecInfo as *const u8).add(EXEC_INFO_TEXT),
            info.cmdline_len,
        ))
    };
    let mut args = arrayvec::ArrayVec::<&str, { crate::param::MAXARG }>::new();
    for tok in cmdline.split_whitespace().take(crate::param::MAXARG) {
        args.push(tok);
    }
    let name = args.first().copied().ok_or(KernelError::InvalidArgument)?;

    let filesys = fs::get()?;
    let file = filesys.open(name)?;
    filesys.deny_write(file);
    // Undo the open and the write ban if anything below fails.
    let file = scopeguard::guard(file, |file| {
        filesys.allow_write(file);
        filesys.close(file);
    });

    let page = kalloc::alloc_zeroed(PoolKind::Kernel).ok_or(KernelError::OutOfMemory)?;
    let proc = ptov(page.pa()) as *mut Process;
    let pcb_page = scopeguard::guard(page, |page| kalloc::free(PoolKind::Kernel, page));

    // A failed load drops the partial directory, which frees whatever
    // pages made it in.
    let mut dir = UserDir::new()?;
    let entry = exec::load(filesys, *file, &mut dir)?;
    let sp = exec::setup_stack(&mut dir, &args)?;

    let cur = thread::current();
    let mut pname = ArrayString::new();
    for c in name.chars().take(NAME_MAX - 1) {
        let _ = pname.try_push(c);
    }
    // SAFETY: the PCB page is fresh and exclusively ours.
    unsafe {
        ptr::write(
            proc,
            Process {
                dir,
                name: pname,
                main_thread: cur,
                children: List::new(),
                my_status: info.status,
                files: [None; NOFILE],
                exec_file: Some(scopeguard::ScopeGuard::into_inner(file)),
                exit: ExitMonitor {
                    lock: Lock::new(),
                    all_dead: Condvar::new(),
                    live_threads: 1,
                    exit_code: 0,
                    exiting: false,
                },
            },
        );
        let _held = HeldInterrupts::new();
        (*cur).process = proc;
    }
    // The PCB now owns its page.
    let _ = scopeguard::ScopeGuard::into_inner(pcb_page).into_pa();
    Ok((entry, sp))
}

/// Wait for the child with id `tid`. Returns its exit code, or -1 if `tid`
/// is not an unwaited child of the caller.
pub fn wait(tid: usize) -> i32 {
    let status = {
        let _held = HeldInterrupts::new();
        // SAFETY: interrupts off; children lists are only touched so.
        let children = unsafe { &mut *current_children() };
        let mut found: *mut ChildStatus = ptr::null_mut();
        let mut e = children.front();
        while let Some(entry) = e {
            let st = container_of!(entry, ChildStatus, elem);
            // SAFETY: listed statuses are live pool slots.
            unsafe {
                if (*st).child_tid == tid && !(*st).waited {
                    (*st).waited = true;
                    found = st;
                    break;
                }
            }
            e = children.next_of(entry);
        }
        found
    };
    if status.is_null() {
        return -1;
    }

    // SAFETY: we hold a reference; the slot cannot be recycled under us.
    unsafe {
        (*status).wait_sema.down();
        let code = (*status).exit_code;
        {
            let _held = HeldInterrupts::new();
            List::remove(&mut (*status).elem);
        }
        release_status(status);
        code
    }
}

/// Terminate the current process with `code`. Prints the termination line,
/// signals the parent, releases every resource, and never returns.
pub fn exit(code: i32) -> ! {
    let cur = thread::current();
    // SAFETY: only called from a process thread.
    let proc = unsafe { &mut *(*cur).process };

    println!("{}: exit({})", proc.name, code);

    // Close the descriptor table and re-enable writes on the image.
    if let Ok(filesys) = fs::get() {
        for slot in proc.files.iter_mut() {
            if let Some(file) = slot.take() {
                filesys.close(file);
            }
        }
        if let Some(file) = proc.exec_file.take() {
            filesys.allow_write(file);
            filesys.close(file);
        }
    }

    // The monitor is bookkeeping for the day multi-threaded processes
    // appear; the main thread is the last one out today.
    proc.exit.lock.acquire();
    proc.exit.exiting = true;
    proc.exit.exit_code = code;
    proc.exit.live_threads -= 1;
    let last = proc.exit.live_threads == 0;
    if last {
        proc.exit.all_dead.broadcast(&proc.exit.lock);
    }
    proc.exit.lock.release();

    // Tell the parent.
    let status = proc.my_status;
    if !status.is_null() {
        let _held = HeldInterrupts::new();
        // SAFETY: parent holds the other reference; slot is live.
        unsafe { (*status).exit_code = code };
    }

    // Orphan cleanup: drop our reference on every child.
    loop {
        let child = {
            let _held = HeldInterrupts::new();
            proc.children.pop_front()
        };
        match child {
            Some(entry) => release_status(container_of!(entry, ChildStatus, elem)),
            None => break,
        }
    }

    // Leave the dying address space before tearing it down.
    vm::activate_kernel();
    {
        let _held = HeldInterrupts::new();
        // SAFETY: interrupts off; this thread owns the PCB pointer.
        unsafe { (*cur).process = ptr::null_mut() };
    }
    let proc_pa = vtop(proc as *mut Process as usize);
    // SAFETY: moving the directory out; the PCB page is freed right after
    // and never read again.
    unsafe {
        let dir = ptr::read(&(*proc).dir);
        drop(dir);
        kalloc::free(PoolKind::Kernel, Page::from_pa(proc_pa));
    }

    if !status.is_null() {
        // SAFETY: the slot is live until our release below.
        unsafe { (*status).wait_sema.up() };
        release_status(status);
    }

    thread::exit();
}

/// Kill the current process the way bad user input dies: print the
/// termination line with code -1.
pub fn kill_current() -> ! {
    exit(-1)
}

/// The page-fault policy. User-mode faults kill the process. A supervisor
/// fault on a user address means a syscall dereferenced a bad pointer:
/// kill the process too. Anything else is a kernel bug.
pub fn page_fault(tf: &mut TrapFrame) {
    let fault_addr = tf.stval;
    let cur = thread::current();
    // SAFETY: the current thread is live.
    let has_process = unsafe { !(*cur).process.is_null() };

    if tf.from_user() {
        if has_process {
            // Exiting may block on the collaborator; run it interruptible.
            // SAFETY: the trap entry finished saving state.
            unsafe { crate::riscv::intr_on() };
            kill_current();
        }
        panic!("user fault without a process");
    }

    if fault_addr < USER_TOP && has_process {
        // SAFETY: as above.
        unsafe { crate::riscv::intr_on() };
        kill_current();
    }

    println!(
        "kernel page fault at {:#x} (sepc={:#x} scause={:#x})",
        fault_addr, tf.sepc, tf.scause
    );
    panic!("kernel page fault");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Mutex, MutexGuard};

    // The status pool is one global; its tests take turns.
    static POOL_TESTS: Mutex<()> = Mutex::new(());

    fn pool_guard() -> MutexGuard<'static, ()> {
        POOL_TESTS.lock().unwrap_or_else(|e| e.into_inner())
    }

    #[test]
    fn status_pool_recycles_exactly_once() {
        let _serial = pool_guard();
        let status = alloc_status().unwrap();
        // SAFETY: the slot is ours until both references drop.
        unsafe {
            assert_eq!((*status).refs.load(Ordering::Relaxed), 2);
            (*status).exit_code = 42;
        }
        release_status(status);
        // SAFETY: one reference remains.
        unsafe {
            assert!((*status).in_use);
            assert_eq!((*status).exit_code, 42);
        }
        release_status(status);
        // SAFETY: the pool slot survives; only the flag matters.
        unsafe { assert!(!(*status).in_use) };
    }

    #[test]
    #[should_panic(expected = "over-released")]
    fn status_over_release_is_caught() {
        let _serial = pool_guard();
        let status = alloc_status().unwrap();
        release_status(status);
        release_status(status);
        release_status(status);
    }

    #[test]
    fn status_pool_exhausts_cleanly() {
        let _serial = pool_guard();
        let mut taken = Vec::new();
        while let Ok(s) = alloc_status() {
            taken.push(s);
            assert!(taken.len() <= NSTATUS);
        }
        for s in taken {
            release_status(s);
            release_status(s);
        }
    }
}
