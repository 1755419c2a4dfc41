//! Kernel-wide tunable constants.

/// Timer tick rate.
pub const TIMER_FREQ_HZ: u64 = 100;

/// Frequency of the platform `time` counter on qemu -machine virt.
pub const TIMEBASE_FREQ: u64 = 10_000_000;

/// Ticks a thread may run before the scheduler asks it to yield.
pub const TIME_SLICE: u64 = 4;

/// Thread and process names are at most 15 bytes plus a terminator.
pub const NAME_MAX: usize = 16;

/// Thread priorities. Higher value means higher priority.
pub const PRI_MIN: u32 = 0;
pub const PRI_DEFAULT: u32 = 31;
pub const PRI_MAX: u32 = 63;

/// Nested priority donation is propagated at most this far.
pub const DONATION_DEPTH_MAX: usize = 8;

/// Open files per process.
pub const NOFILE: usize = 16;

/// Slots in the shared child-status pool.
pub const NSTATUS: usize = 64;

/// Maximum kernel command line, including the terminator.
pub const CMDLINE_MAX: usize = 128;

/// Maximum tokens on the kernel command line.
pub const CMDLINE_TOKENS: usize = 32;

/// Maximum argv entries passed to a user program.
pub const MAXARG: usize = 32;

/// RAM assumed when the device tree does not describe memory.
pub const DEFAULT_RAM: usize = 128 * 1024 * 1024;

/// Disk sector size exposed by the block layer.
pub const SECTOR_SIZE: usize = 512;
