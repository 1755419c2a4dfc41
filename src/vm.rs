//! Sv39 page-table engine.
//!
//! Three levels of page-table pages, indexed by 9 bits each. A page-table
//! page contains 512 64-bit PTEs. A 64-bit virtual address is split into
//! five fields:
//!   39..63 -- must be a sign extension of bit 38.
//!   30..38 -- 9 bits of level-2 index.
//!   21..29 -- 9 bits of level-1 index.
//!   12..20 -- 9 bits of level-0 index.
//!    0..11 -- 12 bits of byte offset within the page.
//!
//! The kernel half of every process's root table is shared with the kernel's
//! root table, so the kernel keeps running across `satp` switches and traps
//! never change address spaces.

use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use crate::error::{KernelError, Result};
use crate::kalloc::{self, Page, PoolKind};
use crate::memlayout::{ptov, DRAM_BASE, KERNEL_HALF_INDEX, USER_TOP};
use crate::riscv::{
    self, level_size, make_satp, pa2pte, pgrounddown, pte2pa, px, sfence_vma_all, sfence_vma_page,
    PteFlags, MAXVA, PGSIZE, PTE_PER_PT, PT_LEVELS,
};

/// # Safety
///
/// If `is_table()` is true, the entry refers to a valid page-table page.
#[derive(Default)]
pub struct PageTableEntry {
    inner: usize,
}

impl PageTableEntry {
    pub fn flags(&self) -> PteFlags {
        PteFlags::from_bits_truncate(self.inner)
    }

    fn flag_intersects(&self, flag: PteFlags) -> bool {
        self.flags().intersects(flag)
    }

    pub fn pa(&self) -> usize {
        pte2pa(self.inner)
    }

    pub fn is_valid(&self) -> bool {
        self.flag_intersects(PteFlags::V)
    }

    pub fn is_user(&self) -> bool {
        self.is_valid() && self.flag_intersects(PteFlags::U)
    }

    /// A valid entry with none of R/W/X refers to the next-level table.
    fn is_table(&self) -> bool {
        self.is_valid() && !self.flag_intersects(PteFlags::R | PteFlags::W | PteFlags::X)
    }

    /// A valid entry with at least one of R/W/X is a leaf.
    fn is_leaf(&self) -> bool {
        self.is_valid() && self.flag_intersects(PteFlags::R | PteFlags::W | PteFlags::X)
    }

    /// Make the entry refer to a page-table page.
    fn set_table(&mut self, table_pa: usize) {
        self.inner = pa2pte(table_pa) | PteFlags::V.bits();
    }

    /// Make the entry a leaf for `pa` with the given permissions. The
    /// permissions must include at least one of R/W/X; valid is implied,
    /// and a writable leaf gets dirty pre-set because the architecture
    /// forbids writes through a W=1, D=0 entry.
    fn set_leaf(&mut self, pa: usize, perm: PteFlags) {
        assert!(perm.intersects(PteFlags::R | PteFlags::W | PteFlags::X));
        let mut perm = perm | PteFlags::V | PteFlags::A;
        if perm.contains(PteFlags::W) {
            perm |= PteFlags::D;
        }
        self.inner = pa2pte(pa) | perm.bits();
    }

    fn invalidate(&mut self) {
        self.inner = 0;
    }

    fn as_table_mut(&mut self) -> Option<&mut RawPageTable> {
        if self.is_table() {
            // SAFETY: the invariant says this refers to a page-table page.
            Some(unsafe { &mut *(ptov(self.pa()) as *mut RawPageTable) })
        } else {
            None
        }
    }
}

/// One page-table page.
#[repr(C, align(4096))]
struct RawPageTable {
    inner: [PageTableEntry; PTE_PER_PT],
}

impl RawPageTable {
    /// Allocate a new zeroed page-table page, returning its physical address.
    fn new_pa() -> Result<usize> {
        let page = kalloc::alloc_zeroed(PoolKind::Kernel).ok_or(KernelError::OutOfMemory)?;
        Ok(page.into_pa())
    }

    /// # Safety
    ///
    /// `pa` must be the physical address of a page-table page.
    unsafe fn from_pa<'a>(pa: usize) -> &'a mut RawPageTable {
        unsafe { &mut *(ptov(pa) as *mut RawPageTable) }
    }

    /// Next-level table under `index`, creating it when `alloc` is set.
    /// Fails with `Conflict` when a huge-page leaf already covers the slot,
    /// `NotFound` when absent and `alloc` is unset, `OutOfMemory` when the
    /// allocator runs dry.
    fn table_mut(&mut self, index: usize, alloc: bool) -> Result<&mut RawPageTable> {
        let pte = &mut self.inner[index];
        if pte.is_leaf() {
            return Err(KernelError::Conflict);
        }
        if !pte.is_valid() {
            if !alloc {
                return Err(KernelError::NotFound);
            }
            pte.set_table(Self::new_pa()?);
        }
        Ok(pte.as_table_mut().expect("table_mut"))
    }

    fn entry_mut(&mut self, index: usize) -> &mut PageTableEntry {
        &mut self.inner[index]
    }
}

/// # Safety
///
/// `root_pa` refers to a valid, uniquely owned Sv39 root table.
pub struct PageTable {
    root_pa: usize,
}

impl PageTable {
    pub fn new() -> Result<Self> {
        Ok(Self {
            root_pa: RawPageTable::new_pa()?,
        })
    }

    pub fn root_pa(&self) -> usize {
        self.root_pa
    }

    fn root(&mut self) -> &mut RawPageTable {
        // SAFETY: root_pa is a valid page-table page by the invariant.
        unsafe { RawPageTable::from_pa(self.root_pa) }
    }

    /// The level-0 PTE for `va`, creating intermediate tables when `alloc`
    /// is set.
    fn walk(&mut self, va: usize, alloc: bool) -> Result<&mut PageTableEntry> {
        assert!(va < MAXVA || va >= !(MAXVA - 1), "PageTable::walk");
        let mut table = self.root();
        for level in (1..PT_LEVELS).rev() {
            table = table.table_mut(px(level, va), alloc)?;
        }
        Ok(table.entry_mut(px(0, va)))
    }

    /// Map the 4 KiB page at `va` to `pa`. Fails with `Conflict` if any
    /// mapping (page or huge leaf) already covers `va`.
    pub fn map_page(&mut self, va: usize, pa: usize, perm: PteFlags) -> Result<()> {
        debug_assert_eq!(va % PGSIZE, 0);
        debug_assert_eq!(pa % PGSIZE, 0);
        let pte = self.walk(va, true)?;
        if pte.is_valid() {
            return Err(KernelError::Conflict);
        }
        pte.set_leaf(pa, perm);
        Ok(())
    }

    /// Map `size` bytes starting at `va` to physical addresses starting at
    /// `pa`. Neither needs to be page-aligned.
    pub fn map_range(&mut self, va: usize, size: usize, pa: usize, perm: PteFlags) -> Result<()> {
        assert!(size > 0);
        let start = pgrounddown(va);
        let end = pgrounddown(va + size - 1);
        for off in num_iter::range_step_inclusive(0, end - start, PGSIZE) {
            self.map_page(start + off, pgrounddown(pa) + off, perm)?;
        }
        Ok(())
    }

    /// Install a gigapage leaf directly in the root table. Used only for the
    /// boot windows.
    pub fn map_giga(&mut self, va: usize, pa: usize, perm: PteFlags) {
        debug_assert_eq!(pa % level_size(2), 0);
        let pte = self.root().entry_mut(px(2, va));
        assert!(!pte.is_valid(), "map_giga");
        pte.set_leaf(pa, perm);
    }

    /// Remove the mapping for the page at `va`, if present and valid, then
    /// flush that single virtual address from the TLB. Returns the physical
    /// frame that was mapped.
    pub fn unmap_page(&mut self, va: usize) -> Option<usize> {
        debug_assert_eq!(va % PGSIZE, 0);
        let pte = self.walk(va, false).ok()?;
        if !pte.is_valid() {
            return None;
        }
        let pa = pte.pa();
        pte.invalidate();
        sfence_vma_page(va);
        Some(pa)
    }

    /// Translate `va`, honoring huge-page leaves at level 2 (1 GiB) and
    /// level 1 (2 MiB). Returns the physical address and the leaf flags.
    pub fn lookup(&mut self, va: usize) -> Option<(usize, PteFlags)> {
        let mut table = self.root();
        for level in (0..PT_LEVELS).rev() {
            let pte = table.entry_mut(px(level, va));
            if !pte.is_valid() {
                return None;
            }
            if pte.is_leaf() {
                let offset = va & (level_size(level) - 1);
                return Some((pte.pa() + offset, pte.flags()));
            }
            table = pte.as_table_mut()?;
        }
        None
    }
}

/// Physical address of the kernel's root table, zero until `init`.
static KERNEL_ROOT: AtomicUsize = AtomicUsize::new(0);

pub fn kernel_root() -> Option<usize> {
    match KERNEL_ROOT.load(Ordering::Acquire) {
        0 => None,
        pa => Some(pa),
    }
}

/// satp value for the kernel address space. ASID 0 is reserved for it.
pub fn kernel_satp() -> usize {
    make_satp(KERNEL_ROOT.load(Ordering::Acquire), 0)
}

/// Build the kernel mappings and turn paging on.
///
/// Two windows, both gigapages: the identity map the boot code keeps
/// executing in across the satp switch (devices read/write, RAM
/// read/write/execute), and the direct map of physical memory at
/// `DIRECT_MAP_BASE`. Both stay in place afterwards.
///
/// # Safety
///
/// Must be called once, before any user directory is created, with the
/// page allocator initialized.
pub unsafe fn init(ram_end: usize) -> Result<()> {
    let mut pt = PageTable::new()?;
    let giga = level_size(2);

    // Identity: devices under the first gigabyte.
    pt.map_giga(0, 0, PteFlags::R | PteFlags::W | PteFlags::G);

    // Identity: every gigabyte of RAM, executable.
    let mut pa = DRAM_BASE;
    while pa < ram_end {
        pt.map_giga(pa, pa, PteFlags::R | PteFlags::W | PteFlags::X | PteFlags::G);
        pa += giga;
    }

    // The kernel's working window: a direct map of the same physical space
    // in the upper half.
    let direct_span = (ram_end + giga - 1) / giga;
    for i in 0..direct_span {
        let pa = i * giga;
        pt.map_giga(
            crate::memlayout::DIRECT_MAP_BASE + pa,
            pa,
            PteFlags::R | PteFlags::W | PteFlags::G,
        );
    }

    KERNEL_ROOT.store(pt.root_pa, Ordering::Release);
    core::mem::forget(pt);

    // SAFETY: the root table above maps the executing kernel.
    unsafe { riscv::w_satp(kernel_satp()) };
    // ASID tagging is advisory on many implementations: flush everything
    // after any satp write.
    sfence_vma_all();
    Ok(())
}

/// Switch back to the kernel address space.
pub fn activate_kernel() {
    // SAFETY: the kernel root is valid once init has run.
    unsafe { riscv::w_satp(kernel_satp()) };
    sfence_vma_all();
}

/// Address-space ids are handed out from a monotone counter that wraps past
/// 0xffff back to 1. 0 is reserved for the kernel.
static NEXT_ASID: AtomicU32 = AtomicU32::new(0);

pub fn alloc_asid() -> u16 {
    let n = NEXT_ASID.fetch_add(1, Ordering::Relaxed);
    (n % 0xffff) as u16 + 1
}

/// A process's page directory: a root table whose user half (indices
/// 0..256) is private and whose kernel half is shared with the kernel's
/// root table.
///
/// # Safety
///
/// Every leaf in the user half maps a frame owned by this directory and
/// drawn from the user pool.
pub struct UserDir {
    pt: PageTable,
    asid: u16,
}

impl UserDir {
    pub fn new() -> Result<Self> {
        let mut pt = PageTable::new()?;

        // Share the kernel half so kernel code and the direct map stay
        // reachable during traps taken in this address space.
        if let Some(kroot) = kernel_root() {
            // SAFETY: both roots are valid page-table pages.
            let (kernel, user) = unsafe {
                (RawPageTable::from_pa(kroot), pt.root())
            };
            for i in KERNEL_HALF_INDEX..PTE_PER_PT {
                user.inner[i].inner = kernel.inner[i].inner;
            }
        }

        Ok(Self {
            pt,
            asid: alloc_asid(),
        })
    }

    pub fn asid(&self) -> u16 {
        self.asid
    }

    pub fn satp(&self) -> usize {
        make_satp(self.pt.root_pa(), self.asid)
    }

    /// Switch translation to this directory.
    pub fn activate(&self) {
        // SAFETY: the directory is valid while self exists.
        unsafe { riscv::w_satp(self.satp()) };
        sfence_vma_all();
    }

    /// Map an owned frame at `va` with `perm | U`. On failure the frame is
    /// handed back so the caller can release it.
    pub fn map_user_page(
        &mut self,
        va: usize,
        page: Page,
        perm: PteFlags,
    ) -> core::result::Result<(), (KernelError, Page)> {
        if va % PGSIZE != 0 || va >= USER_TOP || va < PGSIZE {
            return Err((KernelError::BadVirtualAddress, page));
        }
        let pa = page.pa();
        match self.pt.map_page(va, pa, perm | PteFlags::U) {
            // The directory owns the frame now.
            Ok(()) => {
                let _ = page.into_pa();
                Ok(())
            }
            Err(e) => Err((e, page)),
        }
    }

    /// Leaf flags for the user page at `va`, if mapped.
    pub fn user_page_flags(&mut self, va: usize) -> Option<PteFlags> {
        if va >= USER_TOP {
            return None;
        }
        let (_, flags) = self.pt.lookup(va)?;
        Some(flags)
    }

    /// Physical address of the user page holding `va`.
    pub fn translate(&mut self, va: usize) -> Option<usize> {
        if va >= USER_TOP {
            return None;
        }
        let (pa, flags) = self.pt.lookup(va)?;
        if !flags.contains(PteFlags::U) {
            return None;
        }
        Some(pa)
    }
}

impl Drop for UserDir {
    /// Free every user-half leaf (to the user pool), every intermediate
    /// table, and the root. The shared kernel half is left alone.
    fn drop(&mut self) {
        let root = self.pt.root();
        for i2 in 0..KERNEL_HALF_INDEX {
            let l2 = &mut root.inner[i2];
            let Some(l1_table) = l2.as_table_mut() else {
                debug_assert!(!l2.is_leaf(), "huge leaf in user half");
                continue;
            };
            for i1 in 0..PTE_PER_PT {
                let l1 = &mut l1_table.inner[i1];
                let Some(l0_table) = l1.as_table_mut() else {
                    continue;
                };
                for i0 in 0..PTE_PER_PT {
                    let l0 = &mut l0_table.inner[i0];
                    if l0.is_leaf() {
                        // SAFETY: the invariant says this frame is owned
                        // by the directory.
                        kalloc::free(PoolKind::User, unsafe { Page::from_pa(l0.pa()) });
                        l0.invalidate();
                    }
                }
                // SAFETY: the level-0 table page came from the kernel pool
                // and is no longer referenced.
                kalloc::free(PoolKind::Kernel, unsafe { Page::from_pa(l1.pa()) });
                l1.invalidate();
            }
            // SAFETY: as above, for the level-1 table page.
            kalloc::free(PoolKind::Kernel, unsafe { Page::from_pa(l2.pa()) });
            l2.invalidate();
        }
        // SAFETY: the root page is no longer referenced by anything.
        kalloc::free(PoolKind::Kernel, unsafe { Page::from_pa(self.pt.root_pa) });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kalloc::test_support;

    fn fresh_frame() -> Page {
        kalloc::alloc_zeroed(PoolKind::User).expect("pool empty")
    }

    #[test]
    fn map_lookup_unmap_round_trip() {
        test_support::init_for_tests();
        let _mem = test_support::counting_guard();
        let mut pt = PageTable::new().unwrap();
        let frame = kalloc::alloc(PoolKind::Kernel).unwrap();
        let pa = frame.pa();
        let va = 0x4000_0000 - 0x10000;

        pt.map_page(va, pa, PteFlags::R | PteFlags::W).unwrap();
        let (found, flags) = pt.lookup(va + 0x123).unwrap();
        assert_eq!(found, pa + 0x123);
        assert!(flags.contains(PteFlags::R | PteFlags::W | PteFlags::V));

        assert_eq!(pt.unmap_page(va), Some(pa));
        assert!(pt.lookup(va).is_none());
        kalloc::free(PoolKind::Kernel, frame);
    }

    #[test]
    fn double_map_conflicts() {
        test_support::init_for_tests();
        let _mem = test_support::counting_guard();
        let mut pt = PageTable::new().unwrap();
        let frame = kalloc::alloc(PoolKind::Kernel).unwrap();
        let va = 0x1000;
        pt.map_page(va, frame.pa(), PteFlags::R).unwrap();
        assert_eq!(
            pt.map_page(va, frame.pa(), PteFlags::R),
            Err(KernelError::Conflict)
        );
        pt.unmap_page(va);
        kalloc::free(PoolKind::Kernel, frame);
    }

    #[test]
    fn writable_implies_dirty() {
        test_support::init_for_tests();
        let _mem = test_support::counting_guard();
        let mut pt = PageTable::new().unwrap();
        let frame = kalloc::alloc(PoolKind::Kernel).unwrap();
        pt.map_page(0x2000, frame.pa(), PteFlags::R | PteFlags::W)
            .unwrap();
        let (_, flags) = pt.lookup(0x2000).unwrap();
        assert!(flags.contains(PteFlags::D), "W=1 requires D=1");
        assert!(flags.contains(PteFlags::A));

        // Read-only leaves stay clean.
        let frame2 = kalloc::alloc(PoolKind::Kernel).unwrap();
        pt.map_page(0x3000, frame2.pa(), PteFlags::R).unwrap();
        let (_, flags) = pt.lookup(0x3000).unwrap();
        assert!(!flags.contains(PteFlags::D));

        pt.unmap_page(0x2000);
        pt.unmap_page(0x3000);
        kalloc::free(PoolKind::Kernel, frame);
        kalloc::free(PoolKind::Kernel, frame2);
    }

    #[test]
    fn giga_leaf_blocks_page_mapping() {
        test_support::init_for_tests();
        let _mem = test_support::counting_guard();
        let mut pt = PageTable::new().unwrap();
        pt.map_giga(0, 0, PteFlags::R | PteFlags::W);
        assert_eq!(
            pt.map_page(0x8000, 0x8000, PteFlags::R),
            Err(KernelError::Conflict)
        );
        let (pa, _) = pt.lookup(0x12345).unwrap();
        assert_eq!(pa, 0x12345);
    }

    #[test]
    fn user_dir_create_destroy_leaks_nothing() {
        test_support::init_for_tests();
        let _mem = test_support::counting_guard();
        let kernel_before = kalloc::free_pages(PoolKind::Kernel);
        let user_before = kalloc::free_pages(PoolKind::User);

        {
            let mut dir = UserDir::new().unwrap();
            for i in 0..5 {
                let frame = fresh_frame();
                dir.map_user_page(0x10000 + i * 0x1000, frame, PteFlags::R | PteFlags::W)
                    .map_err(|(e, _)| e)
                    .unwrap();
            }
            assert!(dir.user_page_flags(0x10000).unwrap().contains(PteFlags::U));
            assert!(dir.translate(0x12fff).is_some());
            assert!(dir.translate(USER_TOP).is_none());
        }

        assert_eq!(kalloc::free_pages(PoolKind::Kernel), kernel_before);
        assert_eq!(kalloc::free_pages(PoolKind::User), user_before);
    }

    #[test]
    fn user_dir_rejects_bad_addresses() {
        test_support::init_for_tests();
        let _mem = test_support::counting_guard();
        let mut dir = UserDir::new().unwrap();
        // Page zero stays unmapped so null dereferences fault.
        let frame = fresh_frame();
        let (e, frame) = dir.map_user_page(0, frame, PteFlags::R).unwrap_err();
        assert_eq!(e, KernelError::BadVirtualAddress);
        let (e, frame) = dir.map_user_page(USER_TOP, frame, PteFlags::R).unwrap_err();
        assert_eq!(e, KernelError::BadVirtualAddress);
        kalloc::free(PoolKind::User, frame);
    }

    #[test]
    fn asid_wraps_skipping_kernel() {
        let a = alloc_asid();
        assert_ne!(a, 0);
        for _ in 0..0x1_0000 {
            assert_ne!(alloc_asid(), 0);
        }
    }
}
