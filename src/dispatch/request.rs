//! Upcall decoding.
//!
//! Turns a raw device read into a typed request.  The fixed header is
//! validated (magic, protocol version), the opcode selects the body
//! layout, and trailing strings/extent lists come off the remainder.
//! Decoded requests own their data; the receive buffer is reused for
//! the next read.

use std::error;
use std::fmt;

use crate::proto::{
    self, DecodeIter, IoType, Opcode, ParamCmd, ParamId, PerfCountKind, pvfs_upcall_header,
};
use crate::sysint::Extent;
use crate::types::{AttrMask, FsId, ObjectAttr, ObjectRef, Permissions};

/// Why an upcall could not be decoded.
#[derive(Debug)]
pub enum DecodeError {
    /// Not enough data for the fixed header.
    ShortHeader(usize),
    /// Wrong magic; the stream cannot be trusted.
    BadMagic(u32),
    /// Kernel speaks a different protocol version.
    VersionMismatch(u32),
    /// Opcode with no known body layout.
    UnknownOpcode(u64, u32),
    /// Body or trailer shorter than the opcode demands.
    ShortBody(u64, Opcode),
}

impl DecodeError {
    /// The tag to echo in an error downcall, when the header was sound
    /// enough to trust it.
    pub fn tag(&self) -> Option<u64> {
        match self {
            DecodeError::UnknownOpcode(tag, _) | DecodeError::ShortBody(tag, _) => Some(*tag),
            _ => None,
        }
    }
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::ShortHeader(len) => {
                write!(f, "short read of upcall header ({} bytes)", len)
            }
            DecodeError::BadMagic(magic) => write!(f, "bad upcall magic {:#x}", magic),
            DecodeError::VersionMismatch(version) => write!(
                f,
                "kernel device protocol {} != {}",
                version,
                proto::PVFS_DEV_PROTO_VERSION
            ),
            DecodeError::UnknownOpcode(_, op) => write!(f, "unknown upcall opcode {}", op),
            DecodeError::ShortBody(_, op) => write!(f, "short upcall body for {:?}", op),
        }
    }
}

impl error::Error for DecodeError {}

/// A typed, owned upcall.
#[derive(Debug, Clone, PartialEq)]
pub enum VfsRequest {
    Lookup {
        parent: ObjectRef,
        name: String,
        follow: bool,
    },
    Create {
        parent: ObjectRef,
        name: String,
        perms: Permissions,
    },
    Symlink {
        parent: ObjectRef,
        name: String,
        target: String,
        perms: Permissions,
    },
    Getattr {
        refn: ObjectRef,
        mask: AttrMask,
    },
    Setattr {
        refn: ObjectRef,
        attr: ObjectAttr,
    },
    Remove {
        parent: ObjectRef,
        name: String,
    },
    Mkdir {
        parent: ObjectRef,
        name: String,
        perms: Permissions,
    },
    Readdir {
        refn: ObjectRef,
        token: u64,
        count: u32,
        buf_index: i32,
    },
    ReaddirPlus {
        refn: ObjectRef,
        token: u64,
        count: u32,
        mask: AttrMask,
    },
    Rename {
        old_parent: ObjectRef,
        old_name: String,
        new_parent: ObjectRef,
        new_name: String,
    },
    Truncate {
        refn: ObjectRef,
        size: i64,
    },
    Getxattr {
        refn: ObjectRef,
        name: String,
    },
    Setxattr {
        refn: ObjectRef,
        name: String,
        value: Vec<u8>,
        flags: i32,
    },
    Listxattr {
        refn: ObjectRef,
        count: u32,
    },
    Removexattr {
        refn: ObjectRef,
        name: String,
    },
    Statfs {
        fs_id: FsId,
    },
    FsMount {
        uri: String,
    },
    FsUmount {
        id: i32,
        fs_id: FsId,
    },
    Io {
        refn: ObjectRef,
        io_type: IoType,
        buf_index: u32,
        count: u64,
        offset: i64,
    },
    Iox {
        refn: ObjectRef,
        io_type: IoType,
        buf_index: u32,
        extents: Vec<Extent>,
    },
    Fsync {
        refn: ObjectRef,
    },
    Cancel {
        tag: u64,
    },
    PerfCount {
        kind: PerfCountKind,
    },
    Param {
        cmd: ParamCmd,
        id: ParamId,
        value: i64,
    },
    Fskey {
        fs_id: FsId,
    },
    RaFlush {
        refn: ObjectRef,
    },
}

/// Decode one upcall image.
pub fn decode(buf: &[u8]) -> Result<(pvfs_upcall_header, Opcode, VfsRequest), DecodeError> {
    let mut iter = DecodeIter::new(buf);
    let header = *iter
        .fetch::<pvfs_upcall_header>()
        .ok_or(DecodeError::ShortHeader(buf.len()))?;
    if header.magic != proto::PVFS_DEV_MAGIC {
        return Err(DecodeError::BadMagic(header.magic));
    }
    if header.proto_version != proto::PVFS_DEV_PROTO_VERSION {
        return Err(DecodeError::VersionMismatch(header.proto_version));
    }
    let op = Opcode::try_from(header.op)
        .map_err(|_| DecodeError::UnknownOpcode(header.tag, header.op))?;
    let short = || DecodeError::ShortBody(header.tag, op);

    let request = match op {
        Opcode::Lookup => {
            let body = iter.fetch::<proto::pvfs_lookup_upcall>().ok_or_else(short)?;
            VfsRequest::Lookup {
                parent: body.parent.into(),
                name: iter.fetch_str().ok_or_else(short)?.to_owned(),
                follow: body.sym_follow != 0,
            }
        }
        Opcode::Create => {
            let body = iter.fetch::<proto::pvfs_create_upcall>().ok_or_else(short)?;
            VfsRequest::Create {
                parent: body.parent.into(),
                name: iter.fetch_str().ok_or_else(short)?.to_owned(),
                perms: Permissions::from_bits_truncate(body.perms),
            }
        }
        Opcode::Symlink => {
            let body = iter.fetch::<proto::pvfs_symlink_upcall>().ok_or_else(short)?;
            VfsRequest::Symlink {
                parent: body.parent.into(),
                name: iter.fetch_str().ok_or_else(short)?.to_owned(),
                target: iter.fetch_str().ok_or_else(short)?.to_owned(),
                perms: Permissions::from_bits_truncate(body.perms),
            }
        }
        Opcode::Getattr => {
            let body = iter.fetch::<proto::pvfs_getattr_upcall>().ok_or_else(short)?;
            VfsRequest::Getattr {
                refn: body.refn.into(),
                mask: AttrMask::from_bits_truncate(body.mask),
            }
        }
        Opcode::Setattr => {
            let body = iter.fetch::<proto::pvfs_setattr_upcall>().ok_or_else(short)?;
            VfsRequest::Setattr {
                refn: body.refn.into(),
                attr: attr_from_wire(&body.attr),
            }
        }
        Opcode::Remove => {
            let body = iter.fetch::<proto::pvfs_remove_upcall>().ok_or_else(short)?;
            VfsRequest::Remove {
                parent: body.parent.into(),
                name: iter.fetch_str().ok_or_else(short)?.to_owned(),
            }
        }
        Opcode::Mkdir => {
            let body = iter.fetch::<proto::pvfs_mkdir_upcall>().ok_or_else(short)?;
            VfsRequest::Mkdir {
                parent: body.parent.into(),
                name: iter.fetch_str().ok_or_else(short)?.to_owned(),
                perms: Permissions::from_bits_truncate(body.perms),
            }
        }
        Opcode::Readdir => {
            let body = iter.fetch::<proto::pvfs_readdir_upcall>().ok_or_else(short)?;
            VfsRequest::Readdir {
                refn: body.refn.into(),
                token: body.token,
                count: body.count,
                buf_index: body.buf_index,
            }
        }
        Opcode::ReaddirPlus => {
            let body = iter
                .fetch::<proto::pvfs_readdirplus_upcall>()
                .ok_or_else(short)?;
            VfsRequest::ReaddirPlus {
                refn: body.refn.into(),
                token: body.token,
                count: body.count,
                mask: AttrMask::from_bits_truncate(body.mask),
            }
        }
        Opcode::Rename => {
            let body = iter.fetch::<proto::pvfs_rename_upcall>().ok_or_else(short)?;
            VfsRequest::Rename {
                old_parent: body.old_parent.into(),
                old_name: iter.fetch_str().ok_or_else(short)?.to_owned(),
                new_parent: body.new_parent.into(),
                new_name: iter.fetch_str().ok_or_else(short)?.to_owned(),
            }
        }
        Opcode::Truncate => {
            let body = iter
                .fetch::<proto::pvfs_truncate_upcall>()
                .ok_or_else(short)?;
            VfsRequest::Truncate {
                refn: body.refn.into(),
                size: body.size,
            }
        }
        Opcode::Getxattr => {
            let body = iter
                .fetch::<proto::pvfs_getxattr_upcall>()
                .ok_or_else(short)?;
            VfsRequest::Getxattr {
                refn: body.refn.into(),
                name: iter.fetch_str().ok_or_else(short)?.to_owned(),
            }
        }
        Opcode::Setxattr => {
            let body = iter
                .fetch::<proto::pvfs_setxattr_upcall>()
                .ok_or_else(short)?;
            let refn = body.refn.into();
            let flags = body.flags;
            let value_len = body.value_len as usize;
            let name = iter.fetch_str().ok_or_else(short)?.to_owned();
            let rest = iter.fetch_all();
            if rest.len() < value_len {
                return Err(short());
            }
            VfsRequest::Setxattr {
                refn,
                name,
                value: rest[..value_len].to_vec(),
                flags,
            }
        }
        Opcode::Listxattr => {
            let body = iter
                .fetch::<proto::pvfs_listxattr_upcall>()
                .ok_or_else(short)?;
            VfsRequest::Listxattr {
                refn: body.refn.into(),
                count: body.requested_count,
            }
        }
        Opcode::Removexattr => {
            let body = iter
                .fetch::<proto::pvfs_removexattr_upcall>()
                .ok_or_else(short)?;
            VfsRequest::Removexattr {
                refn: body.refn.into(),
                name: iter.fetch_str().ok_or_else(short)?.to_owned(),
            }
        }
        Opcode::Statfs => {
            let body = iter.fetch::<proto::pvfs_statfs_upcall>().ok_or_else(short)?;
            VfsRequest::Statfs { fs_id: body.fs_id }
        }
        Opcode::FsMount => VfsRequest::FsMount {
            uri: iter.fetch_str().ok_or_else(short)?.to_owned(),
        },
        Opcode::FsUmount => {
            let body = iter
                .fetch::<proto::pvfs_fs_umount_upcall>()
                .ok_or_else(short)?;
            VfsRequest::FsUmount {
                id: body.id,
                fs_id: body.fs_id,
            }
        }
        Opcode::FileIo => {
            let body = iter.fetch::<proto::pvfs_io_upcall>().ok_or_else(short)?;
            VfsRequest::Io {
                refn: body.refn.into(),
                io_type: IoType::try_from(body.io_type).map_err(|_| short())?,
                buf_index: body.buf_index,
                count: body.count,
                offset: body.offset,
            }
        }
        Opcode::FileIox => {
            let body = iter.fetch::<proto::pvfs_iox_upcall>().ok_or_else(short)?;
            let io_type = IoType::try_from(body.io_type).map_err(|_| short())?;
            let refn = body.refn.into();
            let buf_index = body.buf_index;
            let wire_extents = iter
                .fetch_slice::<proto::pvfs_iox_extent>(body.extent_count as usize)
                .ok_or_else(short)?;
            VfsRequest::Iox {
                refn,
                io_type,
                buf_index,
                extents: wire_extents
                    .iter()
                    .map(|e| Extent {
                        offset: e.offset,
                        len: e.len,
                    })
                    .collect(),
            }
        }
        Opcode::Fsync => {
            let body = iter.fetch::<proto::pvfs_fsync_upcall>().ok_or_else(short)?;
            VfsRequest::Fsync {
                refn: body.refn.into(),
            }
        }
        Opcode::Cancel => {
            let body = iter.fetch::<proto::pvfs_cancel_upcall>().ok_or_else(short)?;
            VfsRequest::Cancel { tag: body.tag }
        }
        Opcode::PerfCount => {
            let body = iter
                .fetch::<proto::pvfs_perf_count_upcall>()
                .ok_or_else(short)?;
            VfsRequest::PerfCount {
                kind: PerfCountKind::try_from(body.kind).map_err(|_| short())?,
            }
        }
        Opcode::Param => {
            let body = iter.fetch::<proto::pvfs_param_upcall>().ok_or_else(short)?;
            VfsRequest::Param {
                cmd: ParamCmd::try_from(body.cmd).map_err(|_| short())?,
                id: ParamId::try_from(body.param).map_err(|_| short())?,
                value: body.value,
            }
        }
        Opcode::Fskey => {
            let body = iter.fetch::<proto::pvfs_fskey_upcall>().ok_or_else(short)?;
            VfsRequest::Fskey { fs_id: body.fs_id }
        }
        Opcode::MmapRaFlush => {
            let body = iter
                .fetch::<proto::pvfs_ra_flush_upcall>()
                .ok_or_else(short)?;
            VfsRequest::RaFlush {
                refn: body.refn.into(),
            }
        }
    };
    Ok((header, op, request))
}

/// Rehydrate attributes from their wire form (setattr upcalls).
pub fn attr_from_wire(wire: &proto::pvfs_wire_attr) -> ObjectAttr {
    use crate::types::{AttrObject, ObjectType};
    let mask = AttrMask::from_bits_truncate(wire.mask);
    let object = match ObjectType::from_bits(wire.objtype) {
        ObjectType::Datafile => AttrObject::Datafile { size: wire.size },
        ObjectType::Directory => AttrObject::Directory {
            dirent_count: wire.dirent_count,
            hint: None,
        },
        ObjectType::Symlink => AttrObject::Symlink {
            target: String::new(),
        },
        ObjectType::Metafile => AttrObject::Metafile {
            dist: None,
            dfiles: Vec::new(),
            dist_size: 0,
            stuffed_size: wire.size,
            flags: 0,
        },
        ObjectType::DirData => AttrObject::DirData,
        ObjectType::Internal => AttrObject::Internal,
        ObjectType::None => AttrObject::None,
    };
    ObjectAttr {
        owner: wire.owner,
        group: wire.group,
        perms: Permissions::from_bits_truncate(wire.perms),
        atime: wire.atime,
        mtime: wire.mtime,
        ctime: wire.ctime,
        mask,
        object,
    }
}
