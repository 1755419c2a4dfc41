//! virtio-mmio device definitions: the control-register map and the
//! virtqueue ring structures, for both the legacy (version 1) and modern
//! (version 2) flavors qemu exposes.

use bitflags::bitflags;

/// Register offsets from a device's mmio base.
#[derive(Clone, Copy)]
#[repr(usize)]
pub enum MmioReg {
    /// 0x74726976 ("virt")
    MagicValue = 0x000,
    /// 1 is legacy, 2 is modern
    Version = 0x004,
    /// 1 is net, 2 is block
    DeviceId = 0x008,
    /// 0x554d4551 ("QEMU")
    VendorId = 0x00c,
    DeviceFeatures = 0x010,
    DriverFeatures = 0x020,
    /// Legacy only: page size for the PFN register.
    GuestPageSize = 0x028,
    /// Select the queue the following registers refer to.
    QueueSel = 0x030,
    QueueNumMax = 0x034,
    QueueNum = 0x038,
    /// Legacy only: physical page number of the contiguous queue memory.
    QueuePfn = 0x040,
    /// Modern only.
    QueueReady = 0x044,
    QueueNotify = 0x050,
    InterruptStatus = 0x060,
    InterruptAck = 0x064,
    Status = 0x070,
    /// Modern only: the three ring addresses, split low/high.
    QueueDescLow = 0x080,
    QueueDescHigh = 0x084,
    QueueDriverLow = 0x090,
    QueueDriverHigh = 0x094,
    QueueDeviceLow = 0x0a0,
    QueueDeviceHigh = 0x0a4,
    /// Device-specific configuration; for block, the 64-bit capacity.
    Config = 0x100,
}

impl MmioReg {
    /// # Safety
    ///
    /// `base` must be the mmio base of a live device (or, in tests, memory
    /// standing in for one).
    pub unsafe fn read(self, base: usize) -> u32 {
        unsafe { core::ptr::read_volatile((base + self as usize) as *const u32) }
    }

    /// # Safety
    ///
    /// As for `read`.
    pub unsafe fn write(self, base: usize, value: u32) {
        unsafe { core::ptr::write_volatile((base + self as usize) as *mut u32, value) };
    }
}

pub const MMIO_MAGIC: u32 = 0x7472_6976;
pub const VENDOR_QEMU: u32 = 0x554d_4551;
pub const DEVICE_ID_BLOCK: u32 = 2;

bitflags! {
    /// Status register bits.
    pub struct DeviceStatus: u32 {
        const ACKNOWLEDGE = 1;
        const DRIVER = 2;
        const DRIVER_OK = 4;
        const FEATURES_OK = 8;
        const DEVICE_NEEDS_RESET = 0x40;
        const FAILED = 0x80;
    }
}

bitflags! {
    /// Block-device feature bits the driver knows enough to refuse.
    pub struct BlockFeatures: u32 {
        /// Disk is read-only.
        const RO = 1 << 5;
        /// SCSI command passthrough.
        const SCSI = 1 << 7;
        /// Writeback mode in config.
        const CONFIG_WCE = 1 << 11;
        /// More than one queue.
        const MQ = 1 << 12;
        const ANY_LAYOUT = 1 << 27;
        const RING_INDIRECT_DESC = 1 << 28;
        const RING_EVENT_IDX = 1 << 29;
    }
}

/// Ring depth. Must be a power of two.
pub const QUEUE_SIZE: usize = 8;

bitflags! {
    pub struct DescFlags: u16 {
        /// Chained to the descriptor in `next`.
        const NEXT = 1;
        /// Device writes this buffer (as opposed to reading it).
        const WRITE = 2;
    }
}

/// One descriptor: a buffer the device reads or writes.
#[derive(Clone, Copy)]
#[repr(C)]
pub struct VirtqDesc {
    pub addr: u64,
    pub len: u32,
    pub flags: u16,
    pub next: u16,
}

/// Driver-produced ring of descriptor-chain heads.
#[repr(C)]
pub struct VirtqAvail {
    pub flags: u16,
    /// Monotonically increasing; tells the device how far to look.
    pub idx: u16,
    pub ring: [u16; QUEUE_SIZE],
}

#[derive(Clone, Copy)]
#[repr(C)]
pub struct VirtqUsedElem {
    /// Head of the completed chain.
    pub id: u32,
    /// Bytes the device transferred.
    pub len: u32,
}

/// Device-produced ring of completions.
#[repr(C)]
pub struct VirtqUsed {
    pub flags: u16,
    /// Monotonically increasing; the driver's `last_used` chases it.
    pub idx: u16,
    pub ring: [VirtqUsedElem; QUEUE_SIZE],
}

/// Request types in the header descriptor.
pub const BLK_T_IN: u32 = 0;
pub const BLK_T_OUT: u32 = 1;

/// Status byte the device writes into the third descriptor.
pub const BLK_S_OK: u8 = 0;

/// First descriptor of every block request; device-read.
#[repr(C)]
pub struct BlkReqHeader {
    pub typ: u32,
    pub reserved: u32,
    pub sector: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_structs_match_the_wire() {
        assert_eq!(core::mem::size_of::<VirtqDesc>(), 16);
        assert_eq!(core::mem::size_of::<VirtqUsedElem>(), 8);
        assert_eq!(core::mem::size_of::<VirtqAvail>(), 4 + 2 * QUEUE_SIZE);
        assert_eq!(core::mem::size_of::<BlkReqHeader>(), 16);
    }

    #[test]
    fn mmio_offsets() {
        assert_eq!(MmioReg::MagicValue as usize, 0x000);
        assert_eq!(MmioReg::QueuePfn as usize, 0x040);
        assert_eq!(MmioReg::QueueReady as usize, 0x044);
        assert_eq!(MmioReg::QueueDeviceHigh as usize, 0x0a4);
        assert_eq!(MmioReg::Config as usize, 0x100);
    }
}
