//! Physical page allocator.
//!
//! Page-grained free lists over the RAM above the kernel image, split into a
//! kernel pool and a user pool. User frames (process images, user stacks)
//! come from the user pool, whose size the `-ul` boot option caps; page
//! tables, kernel stacks, and driver memory come from the kernel pool.
//! Allocation bookkeeping is exact so tests can check for leaks.

use core::mem;
use core::ptr;

use crate::memlayout::ptov;
use crate::riscv::{pgrounddown, pgroundup, PGSIZE};
use crate::spinlock::Spinlock;

/// An owned, unaliased physical page.
///
/// # Safety
///
/// `pa` is page-aligned, inside a pool's range, and no other `Page` for the
/// same frame exists.
pub struct Page {
    pa: usize,
}

impl Page {
    /// Assert ownership of the frame at `pa`.
    ///
    /// # Safety
    ///
    /// `pa` must be page-aligned and not owned by any live `Page`.
    pub unsafe fn from_pa(pa: usize) -> Self {
        debug_assert_eq!(pa % PGSIZE, 0);
        Self { pa }
    }

    pub fn pa(&self) -> usize {
        self.pa
    }

    /// Pointer to the frame through the kernel's working window.
    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        ptov(self.pa) as *mut u8
    }

    /// Fill the whole page with `byte`.
    pub fn write_bytes(&mut self, byte: u8) {
        // SAFETY: the page is owned and PGSIZE bytes long.
        unsafe { ptr::write_bytes(self.as_mut_ptr(), byte, PGSIZE) };
    }

    pub fn as_slice_mut(&mut self) -> &mut [u8] {
        // SAFETY: the page is owned and PGSIZE bytes long.
        unsafe { core::slice::from_raw_parts_mut(self.as_mut_ptr(), PGSIZE) }
    }

    /// Give up ownership, returning the bare physical address.
    pub fn into_pa(self) -> usize {
        let pa = self.pa;
        mem::forget(self);
        pa
    }
}

struct Run {
    next: *mut Run,
}

/// Which pool a page belongs to.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum PoolKind {
    Kernel,
    User,
}

/// # Safety
///
/// The free list has no cycle; every listed frame lies in `[start, end)`
/// and is not owned by any `Page`.
struct Pool {
    head: *mut Run,
    start: usize,
    end: usize,
    free: usize,
    total: usize,
}

// SAFETY: pools are only reached through the Kmem spinlock.
unsafe impl Send for Pool {}

impl Pool {
    const fn empty() -> Self {
        Self {
            head: ptr::null_mut(),
            start: 0,
            end: 0,
            free: 0,
            total: 0,
        }
    }

    /// Seed the pool with every page in `[start, end)`.
    ///
    /// # Safety
    ///
    /// The range must be unused RAM, page-aligned, and claimed only once.
    unsafe fn init(&mut self, start: usize, end: usize) {
        self.start = start;
        self.end = end;
        for pa in num_iter::range_step(start, end, PGSIZE) {
            self.total += 1;
            // SAFETY: pa is a page inside this pool's fresh range.
            self.free(unsafe { Page::from_pa(pa) });
        }
    }

    fn free(&mut self, page: Page) {
        let pa = page.into_pa();
        debug_assert!(
            pa % PGSIZE == 0 && (self.start..self.end).contains(&pa),
            "Pool::free"
        );
        let r = ptov(pa) as *mut Run;
        // SAFETY: the frame was owned, so it is not on the list already.
        unsafe { (*r).next = self.head };
        self.head = r;
        self.free += 1;
    }

    fn alloc(&mut self) -> Option<Page> {
        if self.head.is_null() {
            return None;
        }
        // SAFETY: head is a valid frame by the free-list invariant.
        let next = unsafe { (*self.head).next };
        let pa = crate::memlayout::vtop(mem::replace(&mut self.head, next) as usize);
        self.free -= 1;
        // SAFETY: the frame just left the free list, so it is unowned.
        Some(unsafe { Page::from_pa(pa) })
    }
}

pub struct Kmem {
    kernel: Pool,
    user: Pool,
}

impl Kmem {
    const fn new() -> Self {
        Self {
            kernel: Pool::empty(),
            user: Pool::empty(),
        }
    }

    fn pool(&mut self, kind: PoolKind) -> &mut Pool {
        match kind {
            PoolKind::Kernel => &mut self.kernel,
            PoolKind::User => &mut self.user,
        }
    }
}

static KMEM: Spinlock<Kmem> = Spinlock::new("kmem", Kmem::new());

/// Carve `[ram_start, ram_end)` into the two pools. `user_limit`, if given,
/// caps the user pool at that many pages; otherwise the split is even.
///
/// # Safety
///
/// The range must be unused RAM and this must be called exactly once.
pub unsafe fn init(ram_start: usize, ram_end: usize, user_limit: Option<usize>) {
    let start = pgroundup(ram_start);
    let end = pgrounddown(ram_end);
    let total_pages = (end - start) / PGSIZE;
    let mut user_pages = total_pages / 2;
    if let Some(limit) = user_limit {
        user_pages = user_pages.min(limit);
    }
    let split = end - user_pages * PGSIZE;

    let mut kmem = KMEM.lock();
    // SAFETY: disjoint halves of a once-claimed range.
    unsafe {
        kmem.kernel.init(start, split);
        kmem.user.init(split, end);
    }
}

/// Allocate a page, or `None` when the pool is exhausted. The caller decides
/// whether that is fatal.
pub fn alloc(kind: PoolKind) -> Option<Page> {
    KMEM.lock().pool(kind).alloc()
}

/// Allocate a zero-filled page.
pub fn alloc_zeroed(kind: PoolKind) -> Option<Page> {
    let mut page = alloc(kind)?;
    page.write_bytes(0);
    Some(page)
}

pub fn free(kind: PoolKind, page: Page) {
    KMEM.lock().pool(kind).free(page);
}

/// Pages currently free in a pool.
pub fn free_pages(kind: PoolKind) -> usize {
    KMEM.lock().pool(kind).free
}

/// Pages a pool was seeded with.
pub fn total_pages(kind: PoolKind) -> usize {
    KMEM.lock().pool(kind).total
}

#[cfg(test)]
pub mod test_support {
    //! Shared, once-initialized backing memory for host tests that need the
    //! global allocator (page tables, thread pages).

    use super::*;
    use std::sync::{Mutex, MutexGuard, Once};

    static INIT: Once = Once::new();
    static COUNTING: Mutex<()> = Mutex::new(());

    /// Make sure the global pools exist, backed by leaked host memory.
    pub fn init_for_tests() {
        INIT.call_once(|| {
            const BYTES: usize = 4 * 1024 * 1024;
            let buf = Box::leak(vec![0u8; BYTES + PGSIZE].into_boxed_slice());
            let start = pgroundup(buf.as_ptr() as usize);
            // SAFETY: leaked memory is unused and claimed exactly once.
            unsafe { init(start, start + BYTES, None) };
        });
    }

    /// Tests that assert on free-page counts serialize through this guard so
    /// concurrent allocations elsewhere cannot skew the numbers.
    pub fn counting_guard() -> MutexGuard<'static, ()> {
        COUNTING.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_free_round_trip() {
        test_support::init_for_tests();
        let _count = test_support::counting_guard();
        let before = free_pages(PoolKind::Kernel);
        let mut page = alloc(PoolKind::Kernel).expect("pool empty");
        page.write_bytes(0xab);
        assert!(page.as_slice_mut().iter().all(|&b| b == 0xab));
        assert_eq!(free_pages(PoolKind::Kernel), before - 1);
        free(PoolKind::Kernel, page);
        assert_eq!(free_pages(PoolKind::Kernel), before);
    }

    #[test]
    fn pools_are_disjoint() {
        test_support::init_for_tests();
        let _mem = test_support::counting_guard();
        let k = alloc(PoolKind::Kernel).unwrap();
        let u = alloc(PoolKind::User).unwrap();
        assert_ne!(k.pa(), u.pa());
        free(PoolKind::Kernel, k);
        free(PoolKind::User, u);
    }

    #[test]
    fn zeroed_alloc() {
        test_support::init_for_tests();
        let _mem = test_support::counting_guard();
        let mut page = alloc_zeroed(PoolKind::User).unwrap();
        assert!(page.as_slice_mut().iter().all(|&b| b == 0));
        free(PoolKind::User, page);
    }
}
