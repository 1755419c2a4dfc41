//! Supervisor-to-firmware interface.
//!
//! Everything the kernel wants from machine mode goes through one primitive:
//! an ecall carrying {extension id, function id, up to six arguments} that
//! returns {error, value}. Modern extensions (TIME, SRST, RFENCE, DBCN) are
//! probed once through the Base extension and preferred; each call falls back
//! to its legacy encoding when the probe came up empty.

use crate::error::{KernelError, Result};

/// Raw return pair of an SBI call.
#[derive(Debug, Clone, Copy)]
pub struct SbiRet {
    pub error: isize,
    pub value: isize,
}

impl SbiRet {
    /// Convert the firmware's {error, value} pair into a tagged result.
    pub fn into_result(self) -> Result<isize> {
        if self.error == 0 {
            Ok(self.value)
        } else {
            Err(KernelError::Firmware(self.error))
        }
    }
}

/// Extension ids.
pub mod eid {
    /// Legacy encodings: the function id is folded into the extension id.
    pub const LEGACY_SET_TIMER: usize = 0x00;
    pub const LEGACY_CONSOLE_PUTCHAR: usize = 0x01;
    pub const LEGACY_CONSOLE_GETCHAR: usize = 0x02;
    pub const LEGACY_REMOTE_FENCE_I: usize = 0x05;
    pub const LEGACY_REMOTE_SFENCE_VMA: usize = 0x06;
    pub const LEGACY_SHUTDOWN: usize = 0x08;

    pub const BASE: usize = 0x10;
    pub const TIME: usize = 0x5449_4d45;
    pub const RFENCE: usize = 0x5246_4e43;
    pub const SRST: usize = 0x5352_5354;
    pub const DBCN: usize = 0x4442_434e;
}

/// Function ids for the extensions the kernel uses.
pub mod fid {
    pub const BASE_PROBE_EXTENSION: usize = 3;

    pub const TIME_SET_TIMER: usize = 0;

    pub const RFENCE_FENCE_I: usize = 0;
    pub const RFENCE_SFENCE_VMA: usize = 1;

    pub const SRST_SYSTEM_RESET: usize = 0;

    pub const DBCN_WRITE: usize = 0;
    pub const DBCN_READ: usize = 1;
    pub const DBCN_WRITE_BYTE: usize = 2;
}

/// SRST reset types and reasons.
const SRST_TYPE_SHUTDOWN: usize = 0;
const SRST_REASON_NONE: usize = 0;

cfg_if::cfg_if! {
    if #[cfg(target_arch = "riscv64")] {
        /// The single firmware primitive.
        pub fn sbi_call(
            eid: usize,
            fid: usize,
            a0: usize,
            a1: usize,
            a2: usize,
            a3: usize,
            a4: usize,
            a5: usize,
        ) -> SbiRet {
            let (error, value): (isize, isize);
            unsafe {
                core::arch::asm!(
                    "ecall",
                    inlateout("a0") a0 => error,
                    inlateout("a1") a1 => value,
                    in("a2") a2,
                    in("a3") a3,
                    in("a4") a4,
                    in("a5") a5,
                    in("a6") fid,
                    in("a7") eid,
                );
            }
            SbiRet { error, value }
        }
    } else {
        /// Host shim: there is no firmware to call.
        pub fn sbi_call(
            _eid: usize,
            _fid: usize,
            _a0: usize,
            _a1: usize,
            _a2: usize,
            _a3: usize,
            _a4: usize,
            _a5: usize,
        ) -> SbiRet {
            SbiRet { error: -2, value: 0 }
        }
    }
}

fn call1(eid: usize, fid: usize, a0: usize) -> SbiRet {
    sbi_call(eid, fid, a0, 0, 0, 0, 0, 0)
}

/// Which modern extensions the firmware implements.
#[derive(Debug, Clone, Copy, Default)]
pub struct Extensions {
    pub time: bool,
    pub rfence: bool,
    pub srst: bool,
    pub dbcn: bool,
}

static EXTENSIONS: spin::Once<Extensions> = spin::Once::new();

/// Ask the Base extension whether `eid` is implemented.
pub fn probe_extension(eid: usize) -> bool {
    let ret = call1(self::eid::BASE, fid::BASE_PROBE_EXTENSION, eid);
    ret.error == 0 && ret.value != 0
}

/// Probe the modern extensions once. Safe to call again; later calls are
/// no-ops returning the cached result.
pub fn init() -> Extensions {
    *EXTENSIONS.call_once(|| Extensions {
        time: probe_extension(eid::TIME),
        rfence: probe_extension(eid::RFENCE),
        srst: probe_extension(eid::SRST),
        dbcn: probe_extension(eid::DBCN),
    })
}

fn extensions() -> Extensions {
    EXTENSIONS.get().copied().unwrap_or_default()
}

/// Write one byte to the firmware console.
pub fn console_putchar(byte: u8) {
    if extensions().dbcn {
        let _ = call1(eid::DBCN, fid::DBCN_WRITE_BYTE, byte as usize);
    } else {
        let _ = call1(eid::LEGACY_CONSOLE_PUTCHAR, 0, byte as usize);
    }
}

/// Read one byte from the firmware console without blocking.
/// Returns -1 when no input is pending.
pub fn console_getchar() -> i32 {
    // The legacy call returns the byte (or -1) directly in the error slot.
    let ret = call1(eid::LEGACY_CONSOLE_GETCHAR, 0, 0);
    ret.error as i32
}

/// Arm the timer to fire when the platform time counter reaches `deadline`.
pub fn set_timer(deadline: u64) {
    if extensions().time {
        let _ = call1(eid::TIME, fid::TIME_SET_TIMER, deadline as usize);
    } else {
        let _ = call1(eid::LEGACY_SET_TIMER, 0, deadline as usize);
    }
}

/// Instruction-cache fence on the harts in `hart_mask`.
pub fn remote_fence_i(hart_mask: usize) -> Result<()> {
    let ret = if extensions().rfence {
        sbi_call(eid::RFENCE, fid::RFENCE_FENCE_I, hart_mask, 0, 0, 0, 0, 0)
    } else {
        call1(eid::LEGACY_REMOTE_FENCE_I, 0, &hart_mask as *const _ as usize)
    };
    ret.into_result().map(|_| ())
}

/// TLB shoot-down over `[start, start + size)` on the harts in `hart_mask`.
pub fn remote_sfence_vma(hart_mask: usize, start: usize, size: usize) -> Result<()> {
    let ret = if extensions().rfence {
        sbi_call(
            eid::RFENCE,
            fid::RFENCE_SFENCE_VMA,
            hart_mask,
            0,
            start,
            size,
            0,
            0,
        )
    } else {
        sbi_call(
            eid::LEGACY_REMOTE_SFENCE_VMA,
            0,
            &hart_mask as *const _ as usize,
            start,
            size,
            0,
            0,
            0,
        )
    };
    ret.into_result().map(|_| ())
}

/// Power off. Never returns: if the firmware refuses both the modern and the
/// legacy call, spin in `wfi`.
pub fn shutdown() -> ! {
    if extensions().srst {
        let _ = sbi_call(
            eid::SRST,
            fid::SRST_SYSTEM_RESET,
            SRST_TYPE_SHUTDOWN,
            SRST_REASON_NONE,
            0,
            0,
            0,
            0,
        );
    }
    let _ = call1(eid::LEGACY_SHUTDOWN, 0, 0);
    loop {
        crate::riscv::wfi();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_conversion() {
        assert_eq!(SbiRet { error: 0, value: 7 }.into_result(), Ok(7));
        assert_eq!(
            SbiRet { error: -3, value: 0 }.into_result(),
            Err(KernelError::Firmware(-3))
        );
    }

    #[test]
    fn host_probe_is_empty() {
        let ext = init();
        assert!(!ext.time && !ext.srst && !ext.rfence && !ext.dbcn);
    }
}
