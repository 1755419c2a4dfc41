//! The file-system collaborator boundary.
//!
//! The core does not implement a file system. Whatever does (it lives above
//! the block layer) registers itself here once, and the syscall layer and
//! the ELF loader delegate through this trait. Errors — including whatever
//! the collaborator reports for symbolic-link resolution — are forwarded
//! untouched; the core interprets nothing.

use crate::error::{KernelError, Result};

/// Opaque per-open-file token minted by the collaborator. Positions
/// (seek/tell) belong to the handle.
pub type FileHandle = usize;

pub trait FileSys: Sync {
    fn create(&self, path: &str, initial_size: u32) -> Result<()>;
    fn remove(&self, path: &str) -> Result<()>;
    fn open(&self, path: &str) -> Result<FileHandle>;
    fn file_size(&self, file: FileHandle) -> Result<u64>;
    fn read(&self, file: FileHandle, buf: &mut [u8]) -> Result<usize>;
    fn write(&self, file: FileHandle, buf: &[u8]) -> Result<usize>;
    fn seek(&self, file: FileHandle, position: u64) -> Result<()>;
    fn tell(&self, file: FileHandle) -> Result<u64>;
    fn close(&self, file: FileHandle);
    /// Refuse writes to the backing file while an executable runs from it.
    fn deny_write(&self, file: FileHandle);
    fn allow_write(&self, file: FileHandle);
}

static FILESYS: spin::Once<&'static dyn FileSys> = spin::Once::new();

/// Register the collaborator. Later registrations are ignored.
pub fn install(fs: &'static dyn FileSys) {
    let _ = FILESYS.call_once(|| fs);
}

/// The registered collaborator, or `NotFound` when the kernel runs without
/// a file system.
pub fn get() -> Result<&'static dyn FileSys> {
    FILESYS.get().copied().ok_or(KernelError::NotFound)
}

#[cfg(test)]
pub mod test_support {
    //! A RAM-backed collaborator for exercising the loader and syscalls.

    use super::*;
    use std::sync::Mutex;

    struct OpenFile {
        data: Vec<u8>,
        pos: u64,
    }

    #[derive(Default)]
    pub struct RamFs {
        files: Mutex<Vec<Option<OpenFile>>>,
    }

    impl RamFs {
        pub fn with_file(content: &[u8]) -> Self {
            let fs = Self::default();
            fs.files.lock().unwrap().push(Some(OpenFile {
                data: content.to_vec(),
                pos: 0,
            }));
            fs
        }

        pub fn handle(&self) -> FileHandle {
            0
        }
    }

    impl FileSys for RamFs {
        fn create(&self, _path: &str, _initial_size: u32) -> Result<()> {
            Ok(())
        }

        fn remove(&self, _path: &str) -> Result<()> {
            Err(KernelError::NotFound)
        }

        fn open(&self, _path: &str) -> Result<FileHandle> {
            Ok(0)
        }

        fn file_size(&self, file: FileHandle) -> Result<u64> {
            let files = self.files.lock().unwrap();
            let f = files.get(file).and_then(|f| f.as_ref());
            f.map(|f| f.data.len() as u64).ok_or(KernelError::NotFound)
        }

        fn read(&self, file: FileHandle, buf: &mut [u8]) -> Result<usize> {
            let mut files = self.files.lock().unwrap();
            let f = files
                .get_mut(file)
                .and_then(|f| f.as_mut())
                .ok_or(KernelError::NotFound)?;
            let start = (f.pos as usize).min(f.data.len());
            let n = buf.len().min(f.data.len() - start);
            buf[..n].copy_from_slice(&f.data[start..start + n]);
            f.pos += n as u64;
            Ok(n)
        }

        fn write(&self, file: FileHandle, buf: &[u8]) -> Result<usize> {
            let mut files = self.files.lock().unwrap();
            let f = files
                .get_mut(file)
                .and_then(|f| f.as_mut())
                .ok_or(KernelError::NotFound)?;
            let pos = f.pos as usize;
            if f.data.len() < pos + buf.len() {
                f.data.resize(pos + buf.len(), 0);
            }
            f.data[pos..pos + buf.len()].copy_from_slice(buf);
            f.pos += buf.len() as u64;
            Ok(buf.len())
        }

        fn seek(&self, file: FileHandle, position: u64) -> Result<()> {
            let mut files = self.files.lock().unwrap();
            let f = files
                .get_mut(file)
                .and_then(|f| f.as_mut())
                .ok_or(KernelError::NotFound)?;
            f.pos = position;
            Ok(())
        }

        fn tell(&self, file: FileHandle) -> Result<u64> {
            let files = self.files.lock().unwrap();
            let f = files.get(file).and_then(|f| f.as_ref());
            f.map(|f| f.pos).ok_or(KernelError::NotFound)
        }

        fn close(&self, _file: FileHandle) {}

        fn deny_write(&self, _file: FileHandle) {}

        fn allow_write(&self, _file: FileHandle) {}
    }
}
