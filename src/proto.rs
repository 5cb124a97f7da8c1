//! Device wire protocol.
//!
//! Types and layouts for the upcall/downcall stream between the kernel
//! VFS module and the client core.  An upcall is a fixed header (magic,
//! tag, opcode), a per-opcode body, and an optional variable trailer
//! (the iox extent list, an xattr value, a mount string).  Downcalls
//! mirror that shape with a status in place of the magic.  The protocol
//! version is bumped whenever any body layout changes; both sides
//! refuse to talk across versions.
//!
//! Bodies are `#[repr(C)]` with explicit padding so every field sits at
//! its natural alignment and the whole struct round-trips through
//! zerocopy without implicit padding bytes.

#![allow(non_camel_case_types)]
#![allow(missing_docs)]

use std::io::IoSlice;

use num_enum::TryFromPrimitive;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::error::PvfsError;
use crate::types::{Handle, ObjectRef};

/// First word of every upcall.
pub const PVFS_DEV_MAGIC: u32 = 0x5046_5332; // "PFS2"

/// Device protocol version; integral to compatibility.
pub const PVFS_DEV_PROTO_VERSION: u32 = 2;

/// Pre-posted unexpected-message slots.
pub const MAX_NUM_OPS: usize = 64;

/// Extents per posted I/O when a scatter/gather list is split.
pub const IOX_HINDEXED_COUNT: usize = 64;

/// Longest name segment carried in an upcall.
pub const PVFS_NAME_MAX: usize = 255;

/// Fixed portion (header + largest body) fits well under this.
pub const MAX_FIXED_SIZE: usize = 4096;
/// Variable trailer cap (iox extent lists, readdir responses).
pub const MAX_TRAILER_SIZE: usize = 192 * 1024;
/// Size of one unexpected-message slot buffer.
pub const SLOT_BUFFER_SIZE: usize = MAX_FIXED_SIZE + MAX_TRAILER_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive)]
#[repr(u32)]
pub enum Opcode {
    Lookup = 1,
    Create = 2,
    Symlink = 3,
    Getattr = 4,
    Setattr = 5,
    Remove = 6,
    Mkdir = 7,
    Readdir = 8,
    ReaddirPlus = 9,
    Rename = 10,
    Truncate = 11,
    Getxattr = 12,
    Setxattr = 13,
    Listxattr = 14,
    Removexattr = 15,
    Statfs = 16,
    FsMount = 17,
    FsUmount = 18,
    FileIo = 19,
    FileIox = 20,
    Fsync = 21,
    Cancel = 22,
    PerfCount = 23,
    Param = 24,
    Fskey = 25,
    MmapRaFlush = 26,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u32)]
pub enum IoType {
    Read = 1,
    Write = 2,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct pvfs_upcall_header {
    pub magic: u32,
    pub proto_version: u32,
    pub tag: u64,
    pub op: u32,
    /// Calling user, from the VFS.
    pub uid: u32,
    pub gid: u32,
    pub pid: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct pvfs_downcall_header {
    pub tag: u64,
    pub op: u32,
    /// Zero, or a negated PVFS error value.
    pub status: i32,
    pub trailer_size: u64,
}

/// Wire form of an object reference.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct pvfs_object_kref {
    pub handle_lo: u64,
    pub handle_hi: u64,
    pub fs_id: i32,
    pub pad: i32,
}

impl From<ObjectRef> for pvfs_object_kref {
    fn from(refn: ObjectRef) -> pvfs_object_kref {
        pvfs_object_kref {
            handle_lo: refn.handle.lo(),
            handle_hi: refn.handle.hi(),
            fs_id: refn.fs_id,
            pad: 0,
        }
    }
}

impl From<pvfs_object_kref> for ObjectRef {
    fn from(kref: pvfs_object_kref) -> ObjectRef {
        ObjectRef {
            handle: Handle::from_parts(kref.handle_lo, kref.handle_hi),
            fs_id: kref.fs_id,
        }
    }
}

/// Wire attributes, used by setattr upcalls and getattr downcalls.
/// `mask` names the meaningful fields.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct pvfs_wire_attr {
    pub owner: u32,
    pub group: u32,
    pub perms: u32,
    pub objtype: u32,
    pub atime: i64,
    pub mtime: i64,
    pub ctime: i64,
    pub size: i64,
    pub dirent_count: u64,
    pub dfile_count: u32,
    pub mask: u32,
}

// upcall bodies

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct pvfs_lookup_upcall {
    pub parent: pvfs_object_kref,
    pub sym_follow: i32,
    pub pad: i32,
    // name string follows
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct pvfs_create_upcall {
    pub parent: pvfs_object_kref,
    pub perms: u32,
    pub pad: u32,
    // name string follows
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct pvfs_symlink_upcall {
    pub parent: pvfs_object_kref,
    pub perms: u32,
    pub pad: u32,
    // name and target strings follow
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct pvfs_getattr_upcall {
    pub refn: pvfs_object_kref,
    pub mask: u32,
    pub pad: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct pvfs_setattr_upcall {
    pub refn: pvfs_object_kref,
    pub attr: pvfs_wire_attr,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct pvfs_remove_upcall {
    pub parent: pvfs_object_kref,
    // name string follows
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct pvfs_mkdir_upcall {
    pub parent: pvfs_object_kref,
    pub perms: u32,
    pub pad: u32,
    // name string follows
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct pvfs_readdir_upcall {
    pub refn: pvfs_object_kref,
    pub token: u64,
    pub count: u32,
    /// Index into the readdir shared region, or negative for inline.
    pub buf_index: i32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct pvfs_readdirplus_upcall {
    pub refn: pvfs_object_kref,
    pub token: u64,
    pub count: u32,
    pub mask: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct pvfs_rename_upcall {
    pub old_parent: pvfs_object_kref,
    pub new_parent: pvfs_object_kref,
    // old and new name strings follow
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct pvfs_truncate_upcall {
    pub refn: pvfs_object_kref,
    pub size: i64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct pvfs_getxattr_upcall {
    pub refn: pvfs_object_kref,
    // name string follows
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct pvfs_setxattr_upcall {
    pub refn: pvfs_object_kref,
    pub flags: i32,
    pub value_len: u32,
    // name string, then value bytes follow
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct pvfs_listxattr_upcall {
    pub refn: pvfs_object_kref,
    pub requested_count: u32,
    pub pad: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct pvfs_removexattr_upcall {
    pub refn: pvfs_object_kref,
    // name string follows
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct pvfs_statfs_upcall {
    pub fs_id: i32,
    pub pad: u32,
}

// fs_mount carries only the mount URI string
// fs_umount echoes the dynamic mount id handed out at mount time

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct pvfs_fs_umount_upcall {
    pub id: i32,
    pub fs_id: i32,
    // uri string follows
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct pvfs_io_upcall {
    pub refn: pvfs_object_kref,
    pub io_type: u32,
    /// Index into the bulk I/O shared region.
    pub buf_index: u32,
    pub count: u64,
    pub offset: i64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct pvfs_iox_upcall {
    pub refn: pvfs_object_kref,
    pub io_type: u32,
    pub buf_index: u32,
    pub extent_count: u32,
    pub pad: u32,
    // extent list follows as the trailer
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct pvfs_iox_extent {
    pub offset: i64,
    pub len: i64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct pvfs_fsync_upcall {
    pub refn: pvfs_object_kref,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct pvfs_cancel_upcall {
    /// Tag of the in-flight upcall to cancel.
    pub tag: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u32)]
pub enum PerfCountKind {
    Acache = 1,
    StaticAcache = 2,
    Ncache = 3,
    Rcache = 4,
    Capcache = 5,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct pvfs_perf_count_upcall {
    pub kind: u32,
    pub pad: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u32)]
pub enum ParamCmd {
    Get = 1,
    Set = 2,
}

/// Tunables addressable through the param upcall.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u32)]
pub enum ParamId {
    AcacheTimeoutMsecs = 1,
    AcacheSoftLimit = 2,
    AcacheHardLimit = 3,
    AcacheReclaimPercentage = 4,
    StaticAcacheTimeoutMsecs = 5,
    StaticAcacheSoftLimit = 6,
    StaticAcacheHardLimit = 7,
    StaticAcacheReclaimPercentage = 8,
    NcacheTimeoutMsecs = 9,
    NcacheSoftLimit = 10,
    NcacheHardLimit = 11,
    NcacheReclaimPercentage = 12,
    CapcacheTimeoutMsecs = 13,
    CapcacheSoftLimit = 14,
    CapcacheHardLimit = 15,
    CapcacheReclaimPercentage = 16,
    PerfTimeIntervalSecs = 17,
    PerfHistorySize = 18,
    PerfReset = 19,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct pvfs_param_upcall {
    pub cmd: u32,
    pub param: u32,
    pub value: i64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct pvfs_fskey_upcall {
    pub fs_id: i32,
    pub pad: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct pvfs_ra_flush_upcall {
    pub refn: pvfs_object_kref,
}

// downcall bodies

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct pvfs_ref_downcall {
    pub refn: pvfs_object_kref,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct pvfs_getattr_downcall {
    pub attr: pvfs_wire_attr,
    // symlink target string follows for symlinks
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct pvfs_readdir_downcall {
    pub token: u64,
    pub dirent_count: u32,
    /// Nonzero when the dirent stream went to the shared region rather
    /// than the trailer.
    pub shared_region: u32,
    // dirent stream follows (trailer or shared region)
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct pvfs_io_downcall {
    pub amt_complete: i64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct pvfs_statfs_downcall {
    pub block_size: i64,
    pub blocks_total: i64,
    pub blocks_avail: i64,
    pub files_total: i64,
    pub files_avail: i64,
    pub fs_id: i32,
    pub pad: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct pvfs_getxattr_downcall {
    pub value_len: u32,
    pub pad: u32,
    // value bytes follow
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct pvfs_listxattr_downcall {
    pub returned_count: u32,
    pub keylen: u32,
    // packed NUL-separated names follow
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct pvfs_fs_mount_downcall {
    pub fs_id: i32,
    /// The dynamic mount id the kernel echoes back at umount.
    pub id: i32,
    pub root: pvfs_object_kref,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct pvfs_fskey_downcall {
    pub key_len: u32,
    pub pad: u32,
    // key bytes follow
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct pvfs_param_downcall {
    pub value: i64,
}

/// A decoded directory entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dirent {
    pub refn: ObjectRef,
    pub name: String,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
struct pvfs_dirent_fixed {
    refn: pvfs_object_kref,
    name_len: u32,
    pad: u32,
}

/// Append a dirent stream: fixed part, name bytes, padding to an
/// 8-byte boundary so the next fixed part stays aligned.
pub fn encode_dirents(out: &mut Vec<u8>, dirents: &[Dirent]) {
    for dirent in dirents {
        let fixed = pvfs_dirent_fixed {
            refn: dirent.refn.into(),
            name_len: dirent.name.len() as u32,
            pad: 0,
        };
        out.extend_from_slice(fixed.as_bytes());
        out.extend_from_slice(dirent.name.as_bytes());
        let rem = dirent.name.len() % 8;
        if rem != 0 {
            out.extend_from_slice(&[0u8; 8][..8 - rem]);
        }
    }
}

/// Decode `count` dirents from a stream.
pub fn decode_dirents(mut data: &[u8], count: usize) -> Option<Vec<Dirent>> {
    let mut dirents = Vec::with_capacity(count);
    for _ in 0..count {
        let (fixed, rest) =
            zerocopy::Ref::<_, pvfs_dirent_fixed>::from_prefix(data).ok()?;
        let fixed = zerocopy::Ref::into_ref(fixed);
        let name_len = fixed.name_len as usize;
        if name_len > rest.len() {
            return None;
        }
        let name = std::str::from_utf8(&rest[..name_len]).ok()?.to_owned();
        let padded = name_len.div_ceil(8) * 8;
        dirents.push(Dirent {
            refn: fixed.refn.into(),
            name,
        });
        data = rest.get(padded.min(rest.len())..)?;
    }
    Some(dirents)
}

/// An encoded downcall ready to write to the device.
#[derive(Debug)]
pub struct Downcall {
    header: pvfs_downcall_header,
    body: Vec<u8>,
    trailer: Vec<u8>,
}

impl Downcall {
    pub fn ok(tag: u64, op: Opcode) -> Downcall {
        Downcall {
            header: pvfs_downcall_header {
                tag,
                op: op as u32,
                status: 0,
                trailer_size: 0,
            },
            body: Vec::new(),
            trailer: Vec::new(),
        }
    }

    pub fn error(tag: u64, op: Opcode, error: PvfsError) -> Downcall {
        let mut downcall = Downcall::ok(tag, op);
        downcall.header.status = error.to_wire_status();
        downcall
    }

    /// Error reply echoing a raw opcode number (for opcodes we could
    /// not decode but whose header was sound).
    pub fn error_raw(tag: u64, op: u32, error: PvfsError) -> Downcall {
        Downcall {
            header: pvfs_downcall_header {
                tag,
                op,
                status: error.to_wire_status(),
                trailer_size: 0,
            },
            body: Vec::new(),
            trailer: Vec::new(),
        }
    }

    pub fn with_body<T: IntoBytes + Immutable + ?Sized>(mut self, body: &T) -> Downcall {
        self.body.extend_from_slice(body.as_bytes());
        self
    }

    pub fn with_trailer(mut self, trailer: Vec<u8>) -> Downcall {
        self.header.trailer_size = trailer.len() as u64;
        self.trailer = trailer;
        self
    }

    pub fn tag(&self) -> u64 {
        self.header.tag
    }

    pub fn status(&self) -> i32 {
        self.header.status
    }

    /// Hand the encoded form to a writer as an iovec, fuse-style, so
    /// the common (small) case never copies into a single buffer.
    pub fn with_iovec<T, F: FnOnce(&[IoSlice<'_>]) -> T>(&self, f: F) -> T {
        let mut iov: smallvec::SmallVec<[IoSlice<'_>; 3]> =
            smallvec::smallvec![IoSlice::new(self.header.as_bytes())];
        if !self.body.is_empty() {
            iov.push(IoSlice::new(&self.body));
        }
        if !self.trailer.is_empty() {
            iov.push(IoSlice::new(&self.trailer));
        }
        f(&iov)
    }
}

/// Fetches typed pieces off a received upcall buffer.
pub struct DecodeIter<'a> {
    data: &'a [u8],
}

impl<'a> DecodeIter<'a> {
    pub fn new(data: &'a [u8]) -> DecodeIter<'a> {
        DecodeIter { data }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Fetch a typed argument; `None` on short data.  Alignment is the
    /// caller's responsibility (slot buffers are 8-aligned and every
    /// body keeps its fields naturally aligned).
    pub fn fetch<T: FromBytes + KnownLayout + Immutable>(&mut self) -> Option<&'a T> {
        let (value, rest) = zerocopy::Ref::<_, T>::from_prefix(self.data).ok()?;
        self.data = rest;
        Some(zerocopy::Ref::into_ref(value))
    }

    /// Fetch `count` contiguous typed elements.
    pub fn fetch_slice<T: FromBytes + Immutable>(&mut self, count: usize) -> Option<&'a [T]> {
        let (values, rest) =
            zerocopy::Ref::<_, [T]>::from_prefix_with_elems(self.data, count).ok()?;
        self.data = rest;
        Some(zerocopy::Ref::into_ref(values))
    }

    /// Fetch a NUL-terminated string.
    pub fn fetch_str(&mut self) -> Option<&'a str> {
        let len = memchr::memchr(0, self.data)?;
        let (raw, rest) = self.data.split_at(len);
        self.data = &rest[1..];
        std::str::from_utf8(raw).ok()
    }

    /// All remaining bytes.
    pub fn fetch_all(&mut self) -> &'a [u8] {
        std::mem::take(&mut self.data)
    }
}

/// Append a NUL-terminated string to an upcall/downcall image.
pub fn put_str(out: &mut Vec<u8>, s: &str) {
    out.extend_from_slice(s.as_bytes());
    out.push(0);
}
