//! Page-granular disk I/O.
//!
//! The disk manager owns every open file and hands out small integer
//! descriptors. All reads and writes move whole pages at
//! `page_no * PAGE_SIZE` offsets. Reading a page that lies past the end
//! of the file yields zeroed bytes, which is what a freshly allocated
//! page looks like.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use marrow_common::constants::PAGE_SIZE;
use marrow_common::{MarrowError, MarrowResult};

struct OpenFile {
    file: File,
    path: PathBuf,
    /// Next page number to hand out from `allocate_page`.
    next_page_no: i32,
}

/// Owns open files and performs page-granular reads and writes.
pub struct DiskManager {
    inner: Mutex<DiskInner>,
}

struct DiskInner {
    next_fd: i32,
    files: HashMap<i32, OpenFile>,
    path2fd: HashMap<PathBuf, i32>,
}

impl DiskManager {
    /// Creates an empty disk manager.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(DiskInner {
                next_fd: 1,
                files: HashMap::new(),
                path2fd: HashMap::new(),
            }),
        }
    }

    /// Creates a new, empty file. Fails if the file already exists.
    pub fn create_file(&self, path: impl AsRef<Path>) -> MarrowResult<()> {
        OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path.as_ref())?;
        Ok(())
    }

    /// Removes a file from disk. The file must not be open.
    pub fn destroy_file(&self, path: impl AsRef<Path>) -> MarrowResult<()> {
        let path = path.as_ref();
        let inner = self.inner.lock();
        if inner.path2fd.contains_key(path) {
            return Err(MarrowError::internal(format!(
                "cannot destroy open file {}",
                path.display()
            )));
        }
        drop(inner);
        std::fs::remove_file(path)?;
        Ok(())
    }

    /// Whether a file exists on disk.
    pub fn file_exists(&self, path: impl AsRef<Path>) -> bool {
        path.as_ref().is_file()
    }

    /// Opens a file and returns its descriptor.
    ///
    /// Opening the same path twice without closing is rejected; handles
    /// above this layer each own their file.
    pub fn open_file(&self, path: impl AsRef<Path>) -> MarrowResult<i32> {
        let path = path.as_ref().to_path_buf();
        let mut inner = self.inner.lock();
        if inner.path2fd.contains_key(&path) {
            return Err(MarrowError::internal(format!(
                "file {} is already open",
                path.display()
            )));
        }
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        let pages = (file.metadata()?.len() as usize).div_ceil(PAGE_SIZE) as i32;
        let fd = inner.next_fd;
        inner.next_fd += 1;
        inner.files.insert(
            fd,
            OpenFile {
                file,
                path: path.clone(),
                next_page_no: pages,
            },
        );
        inner.path2fd.insert(path, fd);
        Ok(fd)
    }

    /// Closes an open file.
    pub fn close_file(&self, fd: i32) -> MarrowResult<()> {
        let mut inner = self.inner.lock();
        let entry = inner
            .files
            .remove(&fd)
            .ok_or_else(|| MarrowError::internal(format!("close of unknown fd {fd}")))?;
        inner.path2fd.remove(&entry.path);
        Ok(())
    }

    /// Reads one page into `buf`. Pages past the end of the file come
    /// back zeroed.
    pub fn read_page(&self, fd: i32, page_no: i32, buf: &mut [u8]) -> MarrowResult<()> {
        debug_assert!(buf.len() <= PAGE_SIZE);
        let mut inner = self.inner.lock();
        let entry = inner
            .files
            .get_mut(&fd)
            .ok_or_else(|| MarrowError::internal(format!("read on unknown fd {fd}")))?;
        let offset = page_no as u64 * PAGE_SIZE as u64;
        let len = entry.file.metadata()?.len();
        buf.fill(0);
        if offset >= len {
            return Ok(());
        }
        entry.file.seek(SeekFrom::Start(offset))?;
        let avail = ((len - offset) as usize).min(buf.len());
        entry.file.read_exact(&mut buf[..avail])?;
        Ok(())
    }

    /// Writes one page from `buf`.
    pub fn write_page(&self, fd: i32, page_no: i32, buf: &[u8]) -> MarrowResult<()> {
        debug_assert!(buf.len() <= PAGE_SIZE);
        let mut inner = self.inner.lock();
        let entry = inner
            .files
            .get_mut(&fd)
            .ok_or_else(|| MarrowError::internal(format!("write on unknown fd {fd}")))?;
        let offset = page_no as u64 * PAGE_SIZE as u64;
        entry.file.seek(SeekFrom::Start(offset))?;
        entry.file.write_all(buf)?;
        Ok(())
    }

    /// Hands out the next page number of a file.
    pub fn allocate_page(&self, fd: i32) -> MarrowResult<i32> {
        let mut inner = self.inner.lock();
        let entry = inner
            .files
            .get_mut(&fd)
            .ok_or_else(|| MarrowError::internal(format!("allocate on unknown fd {fd}")))?;
        let page_no = entry.next_page_no;
        entry.next_page_no += 1;
        Ok(page_no)
    }

    /// Re-seeds the allocation counter, used by handles that record the
    /// true page count in their file header.
    pub fn set_next_page_no(&self, fd: i32, page_no: i32) -> MarrowResult<()> {
        let mut inner = self.inner.lock();
        let entry = inner
            .files
            .get_mut(&fd)
            .ok_or_else(|| MarrowError::internal(format!("unknown fd {fd}")))?;
        entry.next_page_no = page_no;
        Ok(())
    }
}

impl Default for DiskManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn create_open_rw_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("t.dat");
        let disk = DiskManager::new();

        disk.create_file(&path).unwrap();
        assert!(disk.file_exists(&path));
        let fd = disk.open_file(&path).unwrap();

        let mut page = vec![0u8; PAGE_SIZE];
        page[0] = 0xAB;
        page[PAGE_SIZE - 1] = 0xCD;
        disk.write_page(fd, 3, &page).unwrap();

        let mut out = vec![0u8; PAGE_SIZE];
        disk.read_page(fd, 3, &mut out).unwrap();
        assert_eq!(out, page);

        disk.close_file(fd).unwrap();
        disk.destroy_file(&path).unwrap();
        assert!(!disk.file_exists(&path));
    }

    #[test]
    fn read_past_eof_is_zeroed() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("t.dat");
        let disk = DiskManager::new();
        disk.create_file(&path).unwrap();
        let fd = disk.open_file(&path).unwrap();

        let mut out = vec![0xFFu8; PAGE_SIZE];
        disk.read_page(fd, 10, &mut out).unwrap();
        assert!(out.iter().all(|&b| b == 0));
    }

    #[test]
    fn allocate_counts_from_file_size() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("t.dat");
        let disk = DiskManager::new();
        disk.create_file(&path).unwrap();
        let fd = disk.open_file(&path).unwrap();

        assert_eq!(disk.allocate_page(fd).unwrap(), 0);
        assert_eq!(disk.allocate_page(fd).unwrap(), 1);

        disk.write_page(fd, 1, &vec![0u8; PAGE_SIZE]).unwrap();
        disk.close_file(fd).unwrap();

        let fd = disk.open_file(&path).unwrap();
        assert_eq!(disk.allocate_page(fd).unwrap(), 2);
    }

    #[test]
    fn double_open_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("t.dat");
        let disk = DiskManager::new();
        disk.create_file(&path).unwrap();
        let _fd = disk.open_file(&path).unwrap();
        assert!(disk.open_file(&path).is_err());
    }
}
