//! Format of an ELF64 executable file.

use bitflags::bitflags;
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::error::{KernelError, Result};

pub const ELF_MAGIC: [u8; 4] = [0x7f, b'E', b'L', b'F'];

/// e_ident indices and expected values.
pub const EI_CLASS: usize = 4;
pub const ELFCLASS64: u8 = 2;
pub const EI_DATA: usize = 5;
pub const ELFDATA2LSB: u8 = 1;

pub const ET_EXEC: u16 = 2;
pub const ET_DYN: u16 = 3;
pub const EM_RISCV: u16 = 243;

/// Program header types.
pub const PT_LOAD: u32 = 1;

/// File header.
#[derive(FromZeroes, FromBytes, AsBytes, Clone)]
#[repr(C)]
pub struct Elf64Ehdr {
    pub ident: [u8; 16],
    pub typ: u16,
    pub machine: u16,
    pub version: u32,
    pub entry: u64,
    pub phoff: u64,
    pub shoff: u64,
    pub flags: u32,
    pub ehsize: u16,
    pub phentsize: u16,
    pub phnum: u16,
    pub shentsize: u16,
    pub shnum: u16,
    pub shstrndx: u16,
}

/// Program header.
#[derive(FromZeroes, FromBytes, AsBytes, Clone)]
#[repr(C)]
pub struct Elf64Phdr {
    pub typ: u32,
    pub flags: u32,
    pub off: u64,
    pub vaddr: u64,
    pub paddr: u64,
    pub filesz: u64,
    pub memsz: u64,
    pub align: u64,
}

bitflags! {
    /// p_flags bits.
    pub struct ProgFlags: u32 {
        const EXEC = 1;
        const WRITE = 2;
        const READ = 4;
    }
}

impl Elf64Ehdr {
    pub fn zeroed() -> Self {
        Self::new_zeroed()
    }

    /// Accept only what the loader can run: 64-bit little-endian RISC-V,
    /// EXEC or DYN, with program headers of the size we understand.
    pub fn validate(&self) -> Result<()> {
        if self.ident[..4] != ELF_MAGIC {
            return Err(KernelError::BadExecutable);
        }
        if self.ident[EI_CLASS] != ELFCLASS64 || self.ident[EI_DATA] != ELFDATA2LSB {
            return Err(KernelError::BadExecutable);
        }
        if self.machine != EM_RISCV {
            return Err(KernelError::BadExecutable);
        }
        if self.typ != ET_EXEC && self.typ != ET_DYN {
            return Err(KernelError::BadExecutable);
        }
        if self.phentsize as usize != core::mem::size_of::<Elf64Phdr>() {
            return Err(KernelError::BadExecutable);
        }
        Ok(())
    }
}

impl Elf64Phdr {
    pub fn zeroed() -> Self {
        Self::new_zeroed()
    }
}

#[cfg(test)]
pub mod test_support {
    use super::*;

    /// A header the validator accepts, for loader tests to mutate.
    pub fn valid_header() -> Elf64Ehdr {
        let mut h = Elf64Ehdr::zeroed();
        h.ident[..4].copy_from_slice(&ELF_MAGIC);
        h.ident[EI_CLASS] = ELFCLASS64;
        h.ident[EI_DATA] = ELFDATA2LSB;
        h.typ = ET_EXEC;
        h.machine = EM_RISCV;
        h.phentsize = core::mem::size_of::<Elf64Phdr>() as u16;
        h
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::valid_header;
    use super::*;

    #[test]
    fn sizes_match_the_format() {
        assert_eq!(core::mem::size_of::<Elf64Ehdr>(), 64);
        assert_eq!(core::mem::size_of::<Elf64Phdr>(), 56);
    }

    #[test]
    fn accepts_a_wellformed_header() {
        assert!(valid_header().validate().is_ok());
        let mut dyn_hdr = valid_header();
        dyn_hdr.typ = ET_DYN;
        assert!(dyn_hdr.validate().is_ok());
    }

    #[test]
    fn rejects_the_wrong_everything() {
        let mut h = valid_header();
        h.ident[0] = 0;
        assert_eq!(h.validate(), Err(KernelError::BadExecutable));

        let mut h = valid_header();
        h.ident[EI_CLASS] = 1;
        assert_eq!(h.validate(), Err(KernelError::BadExecutable));

        let mut h = valid_header();
        h.ident[EI_DATA] = 2;
        assert_eq!(h.validate(), Err(KernelError::BadExecutable));

        let mut h = valid_header();
        h.machine = 62;
        assert_eq!(h.validate(), Err(KernelError::BadExecutable));

        let mut h = valid_header();
        h.typ = 1;
        assert_eq!(h.validate(), Err(KernelError::BadExecutable));

        let mut h = valid_header();
        h.phentsize = 32;
        assert_eq!(h.validate(), Err(KernelError::BadExecutable));
    }

    #[test]
    fn parses_from_bytes() {
        let h = valid_header();
        let bytes = h.as_bytes();
        let parsed = Elf64Ehdr::read_from_prefix(bytes).unwrap();
        assert!(parsed.validate().is_ok());
    }
}
