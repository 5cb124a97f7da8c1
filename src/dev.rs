//! Kernel device communication.
//!
//! The character device delivers upcalls and accepts downcalls; the
//! two shared memory regions carry bulk I/O data and readdir trailers
//! so they never cross the device write path.  [`DeviceChannel`] is the
//! seam the dispatcher talks through, implemented here for the real
//! device and by the test harnesses for in-memory runs.

use std::io::{self, IoSlice};
use std::num::NonZeroUsize;
use std::os::fd::{AsFd, AsRawFd, OwnedFd};
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::time::Duration;

use log::error;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::mman::{mmap_anonymous, munmap, MapFlags, ProtFlags};

/// Where the kernel module surfaces the request stream.
pub const DEVICE_PATH: &str = "/dev/pvfs2-req";

/// Bulk I/O region defaults: five descriptors of 4 MiB.
pub const DEFAULT_IO_DESC_COUNT: usize = 5;
pub const DEFAULT_IO_DESC_SIZE: usize = 4 * 1024 * 1024;

/// Readdir region defaults.
pub const DEFAULT_READDIR_DESC_COUNT: usize = 5;
pub const DEFAULT_READDIR_DESC_SIZE: usize = 128 * 1024;

/// Raw communication channel for upcalls and downcalls.
pub trait DeviceChannel: Send + Sync {
    /// Read one upcall into `buf`.  `Ok(None)` when the wait expired
    /// (or the read would block) with nothing delivered.
    fn receive(&self, buf: &mut [u8], timeout: Option<Duration>) -> io::Result<Option<usize>>;

    /// Write one downcall, gather-style.
    fn send(&self, iov: &[IoSlice<'_>]) -> io::Result<()>;

    /// Ask the kernel to re-deliver mount upcalls for filesystems it
    /// already knows about (the remount path after a core restart).
    fn remount(&self) -> io::Result<()> {
        Ok(())
    }
}

nix::ioctl_none!(pvfs_dev_remount_all, b'k', 1);

/// The real request device.
#[derive(Debug)]
pub struct Device {
    fd: OwnedFd,
    path: PathBuf,
}

impl Device {
    pub fn open() -> io::Result<Device> {
        Self::open_path(Path::new(DEVICE_PATH))
    }

    pub fn open_path(path: &Path) -> io::Result<Device> {
        use std::fs::OpenOptions;
        use std::os::unix::fs::OpenOptionsExt;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_CLOEXEC | libc::O_NONBLOCK)
            .open(path)
            .map_err(|e| {
                if e.kind() == io::ErrorKind::NotFound {
                    error!("{} not found; is the pvfs2 kernel module loaded?", path.display());
                }
                e
            })?;
        Ok(Device {
            fd: file.into(),
            path: path.to_owned(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl DeviceChannel for Device {
    fn receive(&self, buf: &mut [u8], timeout: Option<Duration>) -> io::Result<Option<usize>> {
        let poll_timeout = match timeout {
            None => PollTimeout::NONE,
            Some(t) => PollTimeout::try_from(t.as_millis().min(i32::MAX as u128) as i32)
                .unwrap_or(PollTimeout::MAX),
        };
        let mut fds = [PollFd::new(self.fd.as_fd(), PollFlags::POLLIN)];
        let ready = poll(&mut fds, poll_timeout).map_err(io::Error::from)?;
        if ready == 0 {
            return Ok(None);
        }
        match nix::unistd::read(self.fd.as_fd(), buf) {
            Ok(0) => Err(io::Error::from_raw_os_error(libc::ENODEV)),
            Ok(n) => Ok(Some(n)),
            Err(nix::errno::Errno::EAGAIN) | Err(nix::errno::Errno::EINTR) => Ok(None),
            Err(e) => Err(io::Error::from(e)),
        }
    }

    fn send(&self, iov: &[IoSlice<'_>]) -> io::Result<()> {
        let expected: usize = iov.iter().map(|s| s.len()).sum();
        let written = nix::sys::uio::writev(self.fd.as_fd(), iov).map_err(io::Error::from)?;
        if written != expected {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                format!("short downcall write ({written} < {expected})"),
            ));
        }
        Ok(())
    }

    fn remount(&self) -> io::Result<()> {
        unsafe { pvfs_dev_remount_all(self.fd.as_raw_fd()) }
            .map_err(io::Error::from)
            .map(|_| ())
    }
}

/// Borrow an 8-aligned window of a byte buffer; upcall decoding reads
/// structs by reference and needs the header alignment.
pub fn aligned_sub_buf(buf: &mut [u8], alignment: usize) -> &mut [u8] {
    let off = alignment - (buf.as_ptr() as usize) % alignment;
    if off == alignment {
        buf
    } else {
        &mut buf[off..]
    }
}

/// One buffer inside a shared region.  The kernel owns the memory
/// across a call; userspace is a passthrough, so access is raw and
/// callers must not alias a descriptor across concurrent operations.
#[derive(Debug, Clone, Copy)]
pub struct RegionBuf {
    ptr: NonNull<u8>,
    len: usize,
}

unsafe impl Send for RegionBuf {}

impl RegionBuf {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The descriptor's bytes.
    ///
    /// # Safety
    /// The caller must be the only user of this buffer's byte range for
    /// the duration of the borrow.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn as_mut_slice(&self) -> &mut [u8] {
        std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len)
    }

    /// A sub-buffer, so concurrent operations can each own a disjoint
    /// range of one descriptor (the scatter/gather chunk case).
    pub fn slice(&self, offset: usize, len: usize) -> Option<RegionBuf> {
        if offset.checked_add(len)? > self.len {
            return None;
        }
        Some(RegionBuf {
            ptr: NonNull::new(unsafe { self.ptr.as_ptr().add(offset) })?,
            len,
        })
    }
}

/// A mapped shared memory region carved into equal descriptors,
/// addressed by index from upcalls.
#[derive(Debug)]
pub struct SharedRegion {
    map: NonNull<libc::c_void>,
    desc_count: usize,
    desc_size: usize,
    total: usize,
}

unsafe impl Send for SharedRegion {}
unsafe impl Sync for SharedRegion {}

impl SharedRegion {
    pub fn new(desc_count: usize, desc_size: usize) -> io::Result<SharedRegion> {
        let page = page_size::get();
        let desc_size = desc_size.div_ceil(page) * page;
        let total = desc_count
            .checked_mul(desc_size)
            .and_then(NonZeroUsize::new)
            .ok_or_else(|| io::Error::from_raw_os_error(libc::EINVAL))?;
        let map = unsafe {
            mmap_anonymous(
                None,
                total,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
            )
        }
        .map_err(io::Error::from)?;
        Ok(SharedRegion {
            map,
            desc_count,
            desc_size,
            total: total.get(),
        })
    }

    pub fn desc_count(&self) -> usize {
        self.desc_count
    }

    pub fn desc_size(&self) -> usize {
        self.desc_size
    }

    /// Resolve a descriptor index from an upcall.
    pub fn buffer(&self, index: usize) -> Option<RegionBuf> {
        if index >= self.desc_count {
            return None;
        }
        let ptr = unsafe { (self.map.as_ptr() as *mut u8).add(index * self.desc_size) };
        Some(RegionBuf {
            ptr: NonNull::new(ptr)?,
            len: self.desc_size,
        })
    }
}

impl Drop for SharedRegion {
    fn drop(&mut self) {
        if let Err(e) = unsafe { munmap(self.map, self.total) } {
            error!("failed to unmap shared region: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn region_descriptor_layout() {
        let region = SharedRegion::new(3, 8192).unwrap();
        assert_eq!(region.desc_count(), 3);
        assert!(region.desc_size() >= 8192);
        let a = region.buffer(0).unwrap();
        let b = region.buffer(2).unwrap();
        assert!(region.buffer(3).is_none());
        unsafe {
            a.as_mut_slice()[0] = 0xaa;
            b.as_mut_slice()[region.desc_size() - 1] = 0xbb;
            assert_eq!(a.as_mut_slice()[0], 0xaa);
        }
    }

    #[test]
    fn desc_size_rounds_to_page() {
        let region = SharedRegion::new(1, 100).unwrap();
        assert_eq!(region.desc_size() % page_size::get(), 0);
    }

    #[test]
    fn aligned_sub_buf_aligns() {
        let mut buf = vec![0u8; 64];
        let aligned = aligned_sub_buf(&mut buf, 8);
        assert_eq!(aligned.as_ptr() as usize % 8, 0);
    }
}
