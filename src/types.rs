//! Core PVFS2 data types.
//!
//! Handles, object references, the attribute union and its validity
//! masks, capabilities and credentials.  These are the types that move
//! between the caches, the dispatcher and the system interface; their
//! device wire forms live in [`crate::proto`].

use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bitflags::bitflags;

/// An opaque 128-bit object handle.  Handles are minted by the server's
/// allocator; clients only ever copy them around.  Zero is reserved as
/// the null handle.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle(pub u128);

impl Handle {
    /// The reserved null handle.
    pub const NULL: Handle = Handle(0);

    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Low 64 bits, as carried on the device wire.
    pub fn lo(self) -> u64 {
        self.0 as u64
    }

    /// High 64 bits, as carried on the device wire.
    pub fn hi(self) -> u64 {
        (self.0 >> 64) as u64
    }

    pub fn from_parts(lo: u64, hi: u64) -> Handle {
        Handle(((hi as u128) << 64) | lo as u128)
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handle({:#x})", self.0)
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}", self.0)
    }
}

/// A filesystem collection id.
pub type FsId = i32;

/// A durable object name: handle plus the filesystem it lives in.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct ObjectRef {
    pub handle: Handle,
    pub fs_id: FsId,
}

impl ObjectRef {
    pub fn new(handle: Handle, fs_id: FsId) -> ObjectRef {
        ObjectRef { handle, fs_id }
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.handle, self.fs_id)
    }
}

/// Discriminant of the attribute union.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
#[repr(u32)]
pub enum ObjectType {
    #[default]
    None = 0,
    Metafile = 1 << 0,
    Datafile = 1 << 1,
    Directory = 1 << 2,
    Symlink = 1 << 3,
    DirData = 1 << 4,
    Internal = 1 << 5,
}

impl ObjectType {
    pub fn from_bits(v: u32) -> ObjectType {
        match v {
            v if v == ObjectType::Metafile as u32 => ObjectType::Metafile,
            v if v == ObjectType::Datafile as u32 => ObjectType::Datafile,
            v if v == ObjectType::Directory as u32 => ObjectType::Directory,
            v if v == ObjectType::Symlink as u32 => ObjectType::Symlink,
            v if v == ObjectType::DirData as u32 => ObjectType::DirData,
            v if v == ObjectType::Internal as u32 => ObjectType::Internal,
            _ => ObjectType::None,
        }
    }
}

bitflags! {
    /// Which attribute fields are currently valid.  The static bits
    /// (type, distribution, datafile array) are cached on a much longer
    /// timeout than the dynamic ones (sizes, times); the attribute
    /// cache exploits the split.
    #[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
    pub struct AttrMask: u32 {
        const UID        = 1 << 0;
        const GID        = 1 << 1;
        const PERMS      = 1 << 2;
        const ATIME      = 1 << 3;
        const MTIME      = 1 << 4;
        const CTIME      = 1 << 5;
        const TYPE       = 1 << 6;
        const SIZE       = 1 << 7;
        const LINK_TARGET = 1 << 8;
        const DISTRIBUTION = 1 << 9;
        const DFILES     = 1 << 10;
        const DIRENT_COUNT = 1 << 11;
        const DIR_HINT   = 1 << 12;

        const COMMON = Self::UID.bits() | Self::GID.bits() | Self::PERMS.bits()
            | Self::ATIME.bits() | Self::MTIME.bits() | Self::CTIME.bits()
            | Self::TYPE.bits();
        /// The long-lived half.
        const STATIC = Self::TYPE.bits() | Self::DISTRIBUTION.bits() | Self::DFILES.bits();
        const ALL = Self::COMMON.bits() | Self::SIZE.bits() | Self::LINK_TARGET.bits()
            | Self::DISTRIBUTION.bits() | Self::DFILES.bits()
            | Self::DIRENT_COUNT.bits() | Self::DIR_HINT.bits();
    }
}

bitflags! {
    /// POSIX permission bits plus setuid/setgid, as stored on objects.
    #[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
    pub struct Permissions: u32 {
        const EXECUTE = 1 << 0;
        const WRITE   = 1 << 1;
        const READ    = 1 << 2;
        const GROUP_EXECUTE = 1 << 3;
        const GROUP_WRITE   = 1 << 4;
        const GROUP_READ    = 1 << 5;
        const OWNER_EXECUTE = 1 << 6;
        const OWNER_WRITE   = 1 << 7;
        const OWNER_READ    = 1 << 8;
        const SETGID = 1 << 10;
        const SETUID = 1 << 11;
    }
}

/// A distribution: the algorithm-plus-parameters mapping logical file
/// offsets onto datafiles.  The client treats it as an opaque named
/// blob; it is part of the static attributes of every metafile.
#[derive(Clone, PartialEq, Eq, Debug, Default)]
pub struct Distribution {
    pub name: String,
    pub params: Vec<u8>,
}

impl Distribution {
    /// Encoded size as reported by the server (name + params).
    pub fn size(&self) -> u32 {
        (self.name.len() + 1 + self.params.len()) as u32
    }
}

/// Directory hint: preferred distribution for new files created in the
/// directory.
#[derive(Clone, PartialEq, Eq, Debug, Default)]
pub struct DirHint {
    pub dist_name: String,
    pub dist_params: Vec<u8>,
    pub dfile_count: u32,
}

/// Per-variant attribute extension.
#[derive(Clone, PartialEq, Debug, Default)]
pub enum AttrObject {
    #[default]
    None,
    Metafile {
        dist: Option<Distribution>,
        dfiles: Vec<Handle>,
        dist_size: u32,
        /// Size hint for stuffed files (data inlined with the metafile).
        stuffed_size: i64,
        flags: u32,
    },
    Datafile {
        size: i64,
    },
    Directory {
        dirent_count: u64,
        hint: Option<DirHint>,
    },
    Symlink {
        target: String,
    },
    DirData,
    Internal,
}

impl AttrObject {
    pub fn object_type(&self) -> ObjectType {
        match self {
            AttrObject::None => ObjectType::None,
            AttrObject::Metafile { .. } => ObjectType::Metafile,
            AttrObject::Datafile { .. } => ObjectType::Datafile,
            AttrObject::Directory { .. } => ObjectType::Directory,
            AttrObject::Symlink { .. } => ObjectType::Symlink,
            AttrObject::DirData => ObjectType::DirData,
            AttrObject::Internal => ObjectType::Internal,
        }
    }
}

/// Object attributes: the common fields every object carries plus the
/// per-type extension, with a mask recording which fields are current.
#[derive(Clone, PartialEq, Debug, Default)]
pub struct ObjectAttr {
    pub owner: u32,
    pub group: u32,
    pub perms: Permissions,
    pub atime: i64,
    pub mtime: i64,
    pub ctime: i64,
    pub mask: AttrMask,
    pub object: AttrObject,
}

impl ObjectAttr {
    /// The static subset of this attribute set (type, distribution,
    /// datafile array), or `None` when no static bit is current.
    pub fn static_mask(&self) -> AttrMask {
        self.mask & AttrMask::STATIC
    }

    /// The dynamic subset.
    pub fn dynamic_mask(&self) -> AttrMask {
        self.mask - AttrMask::STATIC
    }

    /// Logical byte-stream size, when this is a datafile or a metafile
    /// with a stuffed size hint.
    pub fn size(&self) -> Option<i64> {
        match &self.object {
            AttrObject::Datafile { size } => Some(*size),
            AttrObject::Metafile { stuffed_size, .. } if self.mask.contains(AttrMask::SIZE) => {
                Some(*stuffed_size)
            }
            _ => None,
        }
    }
}

bitflags! {
    /// Operations a capability permits.
    #[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
    pub struct CapOpMask: u32 {
        const READ   = 1 << 0;
        const WRITE  = 1 << 1;
        const SETATTR = 1 << 2;
        const EXEC   = 1 << 3;
        const CREATE = 1 << 4;
        const REMOVE = 1 << 5;
        const ADMIN  = 1 << 6;
    }
}

/// A short-lived signed permission token issued by a server, valid for
/// a specific set of handles and operations.
#[derive(Clone, PartialEq, Debug)]
pub struct Capability {
    pub issuer: String,
    pub fs_id: FsId,
    pub op_mask: CapOpMask,
    pub handles: Vec<Handle>,
    /// Expiration, in seconds since the epoch.
    pub timeout: i64,
    pub signature: Vec<u8>,
}

impl Capability {
    /// A capability whose expiration has passed must never be presented
    /// to a server.
    pub fn is_expired(&self, now: i64) -> bool {
        now > self.timeout
    }
}

/// A signed per-user identity token presented to servers with every
/// request.
#[derive(Clone, PartialEq, Debug)]
pub struct Credential {
    pub userid: u32,
    pub groups: Vec<u32>,
    pub issuer: String,
    /// Expiration, in seconds since the epoch.
    pub timeout: i64,
    pub signature: Vec<u8>,
    /// Attached user certificate, when certificate security is in use.
    pub certificate: Vec<u8>,
}

impl Credential {
    pub fn is_expired(&self, now: i64) -> bool {
        now > self.timeout
    }
}

/// Wall-clock seconds since the epoch, the unit capability and
/// credential timeouts are expressed in.
pub fn epoch_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs() as i64
}

/// Millisecond wall clock, used by the perf counter sample headers.
pub fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handle_parts_round_trip() {
        let h = Handle(0x0123_4567_89ab_cdef_fedc_ba98_7654_3210);
        assert_eq!(Handle::from_parts(h.lo(), h.hi()), h);
        assert_eq!(h.lo(), 0xfedc_ba98_7654_3210);
        assert_eq!(h.hi(), 0x0123_4567_89ab_cdef);
        assert!(Handle::NULL.is_null());
    }

    #[test]
    fn mask_split() {
        let mask = AttrMask::COMMON | AttrMask::SIZE | AttrMask::DFILES;
        assert_eq!(mask & AttrMask::STATIC, AttrMask::TYPE | AttrMask::DFILES);
        assert!(!(mask - AttrMask::STATIC).contains(AttrMask::TYPE));
    }

    #[test]
    fn capability_expiry() {
        let cap = Capability {
            issuer: "alpha".into(),
            fs_id: 1,
            op_mask: CapOpMask::READ,
            handles: vec![Handle(7)],
            timeout: 100,
            signature: vec![1, 2, 3],
        };
        assert!(!cap.is_expired(100));
        assert!(cap.is_expired(101));
    }
}
