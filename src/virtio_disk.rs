//! virtio-mmio block driver.
//!
//! Probe walks the eight well-known slots; a device that fails any step of
//! the init sequence is abandoned, and finding no disk at all is not an
//! error. Requests are the legacy three-descriptor chain (header, data,
//! status byte) and completion is by polling the used ring. The virtqueue
//! is single-threaded by convention: the spinlock admits one request at a
//! time.
//!
//! The rings live in a static page-aligned area inside the kernel image;
//! every address handed to the device goes through `vtop` rather than
//! trusting the direct-map identity.

use core::ptr;
use core::sync::atomic::{fence, Ordering};

use crate::error::{KernelError, Result};
use crate::intr::IntrCell;
use crate::memlayout::{vtop, VIRTIO_BASE, VIRTIO_SLOTS, VIRTIO_STRIDE};
use crate::param::SECTOR_SIZE;
use crate::riscv::PGSIZE;
use crate::spinlock::Spinlock;
use crate::virtio::{
    BlkReqHeader, BlockFeatures, DescFlags, DeviceStatus, MmioReg, VirtqAvail, VirtqDesc,
    VirtqUsed, BLK_S_OK, BLK_T_IN, BLK_T_OUT, DEVICE_ID_BLOCK, MMIO_MAGIC, QUEUE_SIZE,
};

/// Queue memory: descriptor table and available ring share the first page,
/// the used ring gets the second, matching the legacy fixed layout. Must
/// be page-aligned and DMA-visible; a kernel bss page is both.
#[repr(C, align(4096))]
pub struct VirtqMemory {
    pages: [u8; 2 * PGSIZE],
}

impl VirtqMemory {
    pub const fn zeroed() -> Self {
        Self {
            pages: [0; 2 * PGSIZE],
        }
    }
}

static RING: IntrCell<VirtqMemory> = IntrCell::new(VirtqMemory::zeroed());

pub struct Disk {
    base: usize,
    version: u32,
    ring: *mut u8,
    /// Head of the free-descriptor list, linked through `next`.
    free_head: u16,
    free_count: u16,
    /// Trails the device's used.idx; the gap enumerates completions.
    last_used_idx: u16,
    capacity_sectors: u64,
}

// SAFETY: the Disk is only reached through the DISK spinlock.
unsafe impl Send for Disk {}

static DISK: Spinlock<Option<Disk>> = Spinlock::new("virtio_disk", None);

const DESC_TABLE_BYTES: usize = QUEUE_SIZE * core::mem::size_of::<VirtqDesc>();

impl Disk {
    fn desc(&self, i: u16) -> *mut VirtqDesc {
        debug_assert!((i as usize) < QUEUE_SIZE);
        // SAFETY: the ring area covers the descriptor table.
        unsafe { (self.ring as *mut VirtqDesc).add(i as usize) }
    }

    fn avail(&self) -> *mut VirtqAvail {
        // Available ring sits right after the descriptor table.
        // SAFETY: as above.
        unsafe { self.ring.add(DESC_TABLE_BYTES) as *mut VirtqAvail }
    }

    fn used(&self) -> *mut VirtqUsed {
        // SAFETY: the used ring owns the second page.
        unsafe { self.ring.add(PGSIZE) as *mut VirtqUsed }
    }

    /// Capacity in 512-byte sectors.
    pub fn capacity(&self) -> u64 {
        self.capacity_sectors
    }

    pub fn free_descriptors(&self) -> usize {
        self.free_count as usize
    }

    fn alloc_desc(&mut self) -> Option<u16> {
        if self.free_count == 0 {
            return None;
        }
        let head = self.free_head;
        // SAFETY: free-list members are inside the table.
        self.free_head = unsafe { (*self.desc(head)).next };
        self.free_count -= 1;
        Some(head)
    }

    /// Return a chain to the free list. Every chain is freed exactly once;
    /// the count can never exceed the ring size.
    fn free_chain(&mut self, head: u16) {
        let mut i = head;
        loop {
            // SAFETY: chain members are inside the table.
            let desc = unsafe { &mut *self.desc(i) };
            let has_next = DescFlags::from_bits_truncate(desc.flags).contains(DescFlags::NEXT);
            let next = desc.next;
            desc.addr = 0;
            desc.len = 0;
            desc.flags = 0;
            desc.next = self.free_head;
            self.free_head = i;
            self.free_count += 1;
            assert!(
                self.free_count as usize <= QUEUE_SIZE,
                "descriptor chain freed twice"
            );
            if !has_next {
                break;
            }
            i = next;
        }
    }

    /// Queue one request and notify the device. Returns the chain head to
    /// poll on. `header` and `status` must stay put until completion; the
    /// device owns the status byte until then.
    fn submit(
        &mut self,
        header: &BlkReqHeader,
        buf: &[u8],
        write: bool,
        status: &mut u8,
    ) -> Result<u16> {
        if (self.free_count as usize) < 3 {
            return Err(KernelError::OutOfMemory);
        }
        let d0 = self.alloc_desc().unwrap();
        let d1 = self.alloc_desc().unwrap();
        let d2 = self.alloc_desc().unwrap();

        // SAFETY: d0..d2 are allocated table slots.
        unsafe {
            *self.desc(d0) = VirtqDesc {
                addr: vtop(header as *const BlkReqHeader as usize) as u64,
                len: core::mem::size_of::<BlkReqHeader>() as u32,
                flags: DescFlags::NEXT.bits(),
                next: d1,
            };
            let data_flags = if write {
                // The device reads the data we are writing out.
                DescFlags::NEXT
            } else {
                DescFlags::NEXT | DescFlags::WRITE
            };
            *self.desc(d1) = VirtqDesc {
                addr: vtop(buf.as_ptr() as usize) as u64,
                len: buf.len() as u32,
                flags: data_flags.bits(),
                next: d2,
            };
            *self.desc(d2) = VirtqDesc {
                addr: vtop(status as *mut u8 as usize) as u64,
                len: 1,
                flags: DescFlags::WRITE.bits(),
                next: 0,
            };

            // Publish the head, then the index, with full fences between:
            // the device may observe the stores in any order otherwise.
            let avail = self.avail();
            let slot = ((*avail).idx as usize) % QUEUE_SIZE;
            ptr::write_volatile(&mut (*avail).ring[slot], d0);
            fence(Ordering::SeqCst);
            let idx = ptr::read_volatile(&(*avail).idx);
            ptr::write_volatile(&mut (*avail).idx, idx.wrapping_add(1));
            fence(Ordering::SeqCst);

            MmioReg::QueueNotify.write(self.base, 0);
        }
        Ok(d0)
    }

    /// Poll the used ring until the chain at `head` completes, then free
    /// it. The status byte decides success.
    fn wait_complete(&mut self, head: u16, status: &mut u8) -> Result<()> {
        loop {
            fence(Ordering::SeqCst);
            // SAFETY: the used ring is inside the ring area.
            let used_idx = unsafe { ptr::read_volatile(&(*self.used()).idx) };
            if used_idx != self.last_used_idx {
                break;
            }
            core::hint::spin_loop();
        }

        // SAFETY: as above.
        let elem = unsafe {
            ptr::read_volatile(&(*self.used()).ring[self.last_used_idx as usize % QUEUE_SIZE])
        };
        fence(Ordering::SeqCst);
        assert_eq!(elem.id as u16, head, "virtio completion out of order");
        self.last_used_idx = self.last_used_idx.wrapping_add(1);

        self.free_chain(head);

        // Acknowledge the interrupt line even though we poll; the device
        // keeps it asserted otherwise.
        // SAFETY: base is the probed device.
        unsafe {
            let isr = MmioReg::InterruptStatus.read(self.base);
            if isr != 0 {
                MmioReg::InterruptAck.write(self.base, isr & 0x3);
            }
        }

        // The device stored this byte by DMA; read it as such.
        // SAFETY: status is a live byte the chain pointed at.
        if unsafe { ptr::read_volatile(status as *const u8) } == BLK_S_OK {
            Ok(())
        } else {
            Err(KernelError::Io)
        }
    }

    fn rw(&mut self, sector: u64, buf: &mut [u8], write: bool) -> Result<()> {
        assert!(!buf.is_empty() && buf.len() % SECTOR_SIZE == 0);
        let header = BlkReqHeader {
            typ: if write { BLK_T_OUT } else { BLK_T_IN },
            reserved: 0,
            sector,
        };
        let mut status: u8 = 0xff;
        let head = self.submit(&header, buf, write, &mut status)?;
        self.wait_complete(head, &mut status)
    }
}

/// Bring up one device at `base`. Returns the ready disk or the reason it
/// was abandoned.
fn init_device(base: usize, version: u32, ring: *mut u8) -> Result<Disk> {
    // SAFETY: the caller probed `base`; ring points at zeroed, page-aligned
    // queue memory.
    unsafe {
        // Reset, then announce ourselves.
        MmioReg::Status.write(base, 0);
        let mut status = DeviceStatus::ACKNOWLEDGE;
        MmioReg::Status.write(base, status.bits());
        status |= DeviceStatus::DRIVER;
        MmioReg::Status.write(base, status.bits());

        // Feature negotiation: we require nothing and refuse the features
        // we do not handle.
        let mut features = BlockFeatures::from_bits_truncate(MmioReg::DeviceFeatures.read(base));
        features.remove(
            BlockFeatures::RO
                | BlockFeatures::SCSI
                | BlockFeatures::CONFIG_WCE
                | BlockFeatures::MQ
                | BlockFeatures::ANY_LAYOUT
                | BlockFeatures::RING_INDIRECT_DESC
                | BlockFeatures::RING_EVENT_IDX,
        );
        MmioReg::DriverFeatures.write(base, features.bits());

        if version >= 2 {
            // Modern devices must accept the negotiation before we go on.
            status |= DeviceStatus::FEATURES_OK;
            MmioReg::Status.write(base, status.bits());
            let readback = DeviceStatus::from_bits_truncate(MmioReg::Status.read(base));
            if !readback.contains(DeviceStatus::FEATURES_OK) {
                return Err(KernelError::DeviceRefused);
            }
        }

        // Queue 0 setup.
        MmioReg::QueueSel.write(base, 0);
        if version >= 2 && MmioReg::QueueReady.read(base) != 0 {
            return Err(KernelError::DeviceRefused);
        }
        let max = MmioReg::QueueNumMax.read(base);
        if (max as usize) < QUEUE_SIZE {
            return Err(KernelError::DeviceRefused);
        }
        MmioReg::QueueNum.write(base, QUEUE_SIZE as u32);

        ptr::write_bytes(ring, 0, 2 * PGSIZE);
        let ring_pa = vtop(ring as usize);
        if version == 1 {
            MmioReg::GuestPageSize.write(base, PGSIZE as u32);
            MmioReg::QueuePfn.write(base, (ring_pa / PGSIZE) as u32);
        } else {
            let desc_pa = ring_pa;
            let avail_pa = ring_pa + DESC_TABLE_BYTES;
            let used_pa = ring_pa + PGSIZE;
            MmioReg::QueueDescLow.write(base, desc_pa as u32);
            MmioReg::QueueDescHigh.write(base, (desc_pa >> 32) as u32);
            MmioReg::QueueDriverLow.write(base, avail_pa as u32);
            MmioReg::QueueDriverHigh.write(base, (avail_pa >> 32) as u32);
            MmioReg::QueueDeviceLow.write(base, used_pa as u32);
            MmioReg::QueueDeviceHigh.write(base, (used_pa >> 32) as u32);
            MmioReg::QueueReady.write(base, 1);
        }

        status |= DeviceStatus::DRIVER_OK;
        MmioReg::Status.write(base, status.bits());

        // 64-bit capacity from the config register pair.
        let cap_low = MmioReg::Config.read(base) as u64;
        let cap_high =
            ptr::read_volatile((base + MmioReg::Config as usize + 4) as *const u32) as u64;

        let mut disk = Disk {
            base,
            version,
            ring,
            free_head: 0,
            free_count: QUEUE_SIZE as u16,
            last_used_idx: 0,
            capacity_sectors: (cap_high << 32) | cap_low,
        };
        for i in 0..QUEUE_SIZE as u16 {
            (*disk.desc(i)).next = i.wrapping_add(1) % QUEUE_SIZE as u16;
        }
        Ok(disk)
    }
}

/// Walk the eight mmio slots looking for a block device. Finding none is
/// fine; the kernel just runs without one.
pub fn probe() {
    for slot in 0..VIRTIO_SLOTS {
        let base = VIRTIO_BASE + slot * VIRTIO_STRIDE;
        // SAFETY: the slots are identity-mapped device memory.
        let (magic, version, device) = unsafe {
            (
                MmioReg::MagicValue.read(base),
                MmioReg::Version.read(base),
                MmioReg::DeviceId.read(base),
            )
        };
        if magic != MMIO_MAGIC || !(1..=2).contains(&version) || device != DEVICE_ID_BLOCK {
            continue;
        }
        let ring = RING.get_mut_raw() as *mut u8;
        match init_device(base, version, ring) {
            Ok(disk) => {
                println!(
                    "virtio-blk: slot {} ({} sectors, version {})",
                    slot, disk.capacity_sectors, version
                );
                *DISK.lock() = Some(disk);
                return;
            }
            Err(e) => {
                println!("virtio-blk: slot {} abandoned: {}", slot, e);
            }
        }
    }
    println!("virtio-blk: no block device");
}

fn with_disk<R>(f: impl FnOnce(&mut Disk) -> Result<R>) -> Result<R> {
    let mut guard = DISK.lock();
    match guard.as_mut() {
        Some(disk) => f(disk),
        None => Err(KernelError::NotFound),
    }
}

/// Read whole sectors starting at `sector`. `buf` must be a multiple of
/// 512 bytes.
pub fn read_sectors(sector: u64, buf: &mut [u8]) -> Result<()> {
    with_disk(|disk| disk.rw(sector, buf, false))
}

/// Write whole sectors starting at `sector`.
pub fn write_sectors(sector: u64, buf: &mut [u8]) -> Result<()> {
    with_disk(|disk| disk.rw(sector, buf, true))
}

/// Capacity of the probed disk in sectors.
pub fn capacity() -> Result<u64> {
    with_disk(|disk| Ok(disk.capacity()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::virtio::VirtqUsedElem;

    /// Fake mmio registers plus a device model that consumes the available
    /// ring the way qemu's block device would.
    struct FakeDevice {
        regs: Box<[u8; 0x200]>,
        ring: Box<VirtqMemory>,
        sectors: Vec<u8>,
    }

    impl FakeDevice {
        fn new(nsectors: usize) -> Self {
            let mut dev = Self {
                regs: Box::new([0; 0x200]),
                ring: Box::new(VirtqMemory::zeroed()),
                sectors: vec![0; nsectors * SECTOR_SIZE],
            };
            let base = dev.base();
            // SAFETY: plain memory standing in for registers.
            unsafe {
                MmioReg::MagicValue.write(base, MMIO_MAGIC);
                MmioReg::Version.write(base, 2);
                MmioReg::DeviceId.write(base, DEVICE_ID_BLOCK);
                MmioReg::VendorId.write(base, crate::virtio::VENDOR_QEMU);
                MmioReg::QueueNumMax.write(base, 16);
                MmioReg::Config.write(base, nsectors as u32);
            }
            dev
        }

        fn base(&self) -> usize {
            self.regs.as_ptr() as usize
        }

        fn ring_ptr(&mut self) -> *mut u8 {
            self.ring.as_mut() as *mut VirtqMemory as *mut u8
        }

        fn init(&mut self) -> Disk {
            let ring = self.ring_ptr();
            init_device(self.base(), 2, ring).expect("init failed")
        }

        /// Process one pending request: walk the chain, move the data,
        /// write the status byte, publish a used element.
        fn complete_one(&mut self, disk: &Disk) {
            self.complete_one_with_status(disk, BLK_S_OK);
        }

        fn complete_one_with_status(&mut self, disk: &Disk, status: u8) {
            // SAFETY: the rings live in self.ring.
            unsafe {
                let avail = disk.avail();
                let used = disk.used();
                let taken = ptr::read_volatile(&(*used).idx);
                assert_ne!(ptr::read_volatile(&(*avail).idx), taken, "nothing queued");
                let head = (*avail).ring[taken as usize % QUEUE_SIZE];

                let hdr_desc = ptr::read(disk.desc(head));
                let hdr = &*(hdr_desc.addr as usize as *const BlkReqHeader);
                let data_desc = ptr::read(disk.desc(hdr_desc.next));
                let status_desc = ptr::read(disk.desc(data_desc.next));

                let offset = hdr.sector as usize * SECTOR_SIZE;
                let len = data_desc.len as usize;
                assert!(offset + len <= self.sectors.len(), "request past capacity");
                let data = data_desc.addr as usize as *mut u8;
                if hdr.typ == BLK_T_OUT {
                    self.sectors[offset..offset + len]
                        .copy_from_slice(core::slice::from_raw_parts(data, len));
                } else {
                    core::slice::from_raw_parts_mut(data, len)
                        .copy_from_slice(&self.sectors[offset..offset + len]);
                }
                *(status_desc.addr as usize as *mut u8) = status;

                let slot = taken as usize % QUEUE_SIZE;
                ptr::write_volatile(
                    &mut (*used).ring[slot],
                    VirtqUsedElem {
                        id: head as u32,
                        len: data_desc.len,
                    },
                );
                fence(Ordering::SeqCst);
                ptr::write_volatile(&mut (*used).idx, taken.wrapping_add(1));
            }
        }
    }

    #[test]
    fn init_negotiates_and_reads_capacity() {
        let mut dev = FakeDevice::new(64);
        let disk = dev.init();
        assert_eq!(disk.capacity(), 64);
        assert_eq!(disk.free_descriptors(), QUEUE_SIZE);
        // SAFETY: fake registers.
        let status = unsafe { MmioReg::Status.read(dev.base()) };
        let status = DeviceStatus::from_bits_truncate(status);
        assert!(status.contains(DeviceStatus::DRIVER_OK | DeviceStatus::FEATURES_OK));
        // SAFETY: fake registers.
        unsafe {
            assert_eq!(MmioReg::QueueReady.read(dev.base()), 1);
            assert_eq!(MmioReg::QueueNum.read(dev.base()), QUEUE_SIZE as u32);
        }
    }

    #[test]
    fn init_aborts_when_queue_too_small() {
        let mut dev = FakeDevice::new(8);
        let base = dev.base();
        // SAFETY: fake registers.
        unsafe { MmioReg::QueueNumMax.write(base, 4) };
        let ring = dev.ring_ptr();
        assert_eq!(
            init_device(base, 2, ring).err(),
            Some(KernelError::DeviceRefused)
        );
    }

    #[test]
    fn write_then_read_round_trip() {
        let mut dev = FakeDevice::new(16);
        let mut disk = dev.init();

        let mut out = vec![0xabu8; SECTOR_SIZE];
        let header = BlkReqHeader {
            typ: BLK_T_OUT,
            reserved: 0,
            sector: 3,
        };
        let mut status = 0xffu8;
        let head = disk.submit(&header, &out, true, &mut status).unwrap();
        assert_eq!(disk.free_descriptors(), QUEUE_SIZE - 3);
        dev.complete_one(&disk);
        disk.wait_complete(head, &mut status).unwrap();
        assert_eq!(disk.free_descriptors(), QUEUE_SIZE);
        assert_eq!(&dev.sectors[3 * SECTOR_SIZE..4 * SECTOR_SIZE], &out[..]);

        // Read it back through the driver.
        out.fill(0);
        let header = BlkReqHeader {
            typ: BLK_T_IN,
            reserved: 0,
            sector: 3,
        };
        let mut status = 0xffu8;
        let head = disk.submit(&header, &out, false, &mut status).unwrap();
        dev.complete_one(&disk);
        disk.wait_complete(head, &mut status).unwrap();
        assert!(out.iter().all(|&b| b == 0xab));
        assert_eq!(disk.free_descriptors(), QUEUE_SIZE);
    }

    #[test]
    fn submit_fails_when_descriptors_run_out() {
        let mut dev = FakeDevice::new(16);
        let mut disk = dev.init();
        let buf = vec![0u8; SECTOR_SIZE];
        let header = BlkReqHeader {
            typ: BLK_T_OUT,
            reserved: 0,
            sector: 0,
        };
        let mut s0 = 0xffu8;
        let mut s1 = 0xffu8;
        let mut s2 = 0xffu8;
        let h0 = disk.submit(&header, &buf, true, &mut s0).unwrap();
        let h1 = disk.submit(&header, &buf, true, &mut s1).unwrap();
        // Queue depth 8: two in-flight requests leave two descriptors.
        assert_eq!(disk.free_descriptors(), 2);
        assert_eq!(
            disk.submit(&header, &buf, true, &mut s2).err(),
            Some(KernelError::OutOfMemory)
        );
        // Drain in order and confirm the pool refills completely.
        dev.complete_one(&disk);
        disk.wait_complete(h0, &mut s0).unwrap();
        dev.complete_one(&disk);
        disk.wait_complete(h1, &mut s1).unwrap();
        assert_eq!(disk.free_descriptors(), QUEUE_SIZE);
    }

    #[test]
    fn nonzero_status_reports_io_error() {
        let mut dev = FakeDevice::new(16);
        let mut disk = dev.init();
        let buf = vec![0u8; SECTOR_SIZE];
        let header = BlkReqHeader {
            typ: BLK_T_OUT,
            reserved: 0,
            sector: 0,
        };
        let mut status = 0xffu8;
        let head = disk.submit(&header, &buf, true, &mut status).unwrap();
        // The model reports a device-side error this time.
        dev.complete_one_with_status(&disk, 2);
        assert_eq!(
            disk.wait_complete(head, &mut status).err(),
            Some(KernelError::Io)
        );
        assert_eq!(disk.free_descriptors(), QUEUE_SIZE);
    }
}
