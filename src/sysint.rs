//! The system interface boundary.
//!
//! Everything the dispatcher needs from the servers is expressed as the
//! [`ServerOps`] trait; the on-wire RPC machinery lives behind it and
//! is linked in by the embedding binary.  Tests drive the dispatcher
//! against an in-memory implementation.
//!
//! All calls are blocking from the callee's point of view; the
//! dispatcher decides the threading by choosing the worker it posts
//! each call on.

use crate::error::{PvfsError, PvfsResult};
use crate::types::{AttrMask, Capability, Credential, FsId, ObjectAttr, ObjectRef, Permissions};

/// Result of a mount: the collection id and its root.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MountResult {
    pub fs_id: FsId,
    pub root: ObjectRef,
}

/// One returned directory entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirentResult {
    pub refn: ObjectRef,
    pub name: String,
}

/// A readdir batch.
#[derive(Debug, Clone, Default)]
pub struct ReaddirResult {
    pub dirents: Vec<DirentResult>,
    /// Continuation token for the next batch.
    pub token: u64,
    /// Which dirdata shard served this batch.
    pub dirdata_index: u32,
}

/// A readdirplus batch: entries plus their attributes (or the per-entry
/// error that stood in for them).
#[derive(Debug, Clone, Default)]
pub struct ReaddirPlusResult {
    pub base: ReaddirResult,
    pub attrs: Vec<PvfsResult<ObjectAttr>>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct StatfsResult {
    pub block_size: i64,
    pub blocks_total: i64,
    pub blocks_avail: i64,
    pub files_total: i64,
    pub files_avail: i64,
}

/// Direction of a file I/O call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoKind {
    Read,
    Write,
}

/// A contiguous file extent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extent {
    pub offset: i64,
    pub len: i64,
}

/// The operations the servers provide.  Mirrors the non-blocking
/// system-interface call set the dispatcher posts.
#[allow(clippy::too_many_arguments)]
pub trait ServerOps: Send + Sync + 'static {
    fn mount(&self, cred: &Credential, config_server: &str, fs_name: &str)
        -> PvfsResult<MountResult>;
    fn umount(&self, cred: &Credential, fs_id: FsId) -> PvfsResult<()>;

    fn lookup(
        &self,
        cred: &Credential,
        parent: ObjectRef,
        name: &str,
        follow_links: bool,
    ) -> PvfsResult<ObjectRef>;
    fn create(
        &self,
        cred: &Credential,
        parent: ObjectRef,
        name: &str,
        perms: Permissions,
    ) -> PvfsResult<ObjectRef>;
    fn symlink(
        &self,
        cred: &Credential,
        parent: ObjectRef,
        name: &str,
        target: &str,
        perms: Permissions,
    ) -> PvfsResult<ObjectRef>;
    fn mkdir(
        &self,
        cred: &Credential,
        parent: ObjectRef,
        name: &str,
        perms: Permissions,
    ) -> PvfsResult<ObjectRef>;
    fn remove(&self, cred: &Credential, parent: ObjectRef, name: &str) -> PvfsResult<()>;
    fn rename(
        &self,
        cred: &Credential,
        old_parent: ObjectRef,
        old_name: &str,
        new_parent: ObjectRef,
        new_name: &str,
    ) -> PvfsResult<()>;

    fn getattr(&self, cred: &Credential, refn: ObjectRef, mask: AttrMask)
        -> PvfsResult<ObjectAttr>;
    fn setattr(&self, cred: &Credential, refn: ObjectRef, attr: &ObjectAttr) -> PvfsResult<()>;
    fn truncate(&self, cred: &Credential, refn: ObjectRef, size: i64) -> PvfsResult<()>;

    fn readdir(
        &self,
        cred: &Credential,
        refn: ObjectRef,
        token: u64,
        count: u32,
        dirdata_hint: Option<u32>,
    ) -> PvfsResult<ReaddirResult>;
    fn readdirplus(
        &self,
        cred: &Credential,
        refn: ObjectRef,
        token: u64,
        count: u32,
        mask: AttrMask,
    ) -> PvfsResult<ReaddirPlusResult>;

    fn getxattr(&self, cred: &Credential, refn: ObjectRef, name: &str) -> PvfsResult<Vec<u8>>;
    fn setxattr(
        &self,
        cred: &Credential,
        refn: ObjectRef,
        name: &str,
        value: &[u8],
        flags: i32,
    ) -> PvfsResult<()>;
    fn listxattr(&self, cred: &Credential, refn: ObjectRef, count: u32)
        -> PvfsResult<Vec<String>>;
    fn removexattr(&self, cred: &Credential, refn: ObjectRef, name: &str) -> PvfsResult<()>;

    fn statfs(&self, cred: &Credential, fs_id: FsId) -> PvfsResult<StatfsResult>;

    /// Read or write one contiguous span through the given buffer,
    /// presenting a capability covering the object.  Returns the byte
    /// count actually moved.
    fn io(
        &self,
        cred: &Credential,
        cap: &Capability,
        refn: ObjectRef,
        kind: IoKind,
        extent: Extent,
        buf: &mut [u8],
    ) -> PvfsResult<i64>;
    fn fsync(&self, cred: &Credential, refn: ObjectRef) -> PvfsResult<()>;

    /// Fetch a capability covering `refn` for the credential's user.
    fn get_capability(&self, cred: &Credential, refn: ObjectRef) -> PvfsResult<Capability>;

    /// Put the transport into forceful-cancel mode so connection-level
    /// aborts surface promptly.  Called once per mount.
    fn enable_forceful_cancel(&self) {}
}

/// Placeholder server for builds without a linked transport: every
/// remote operation reports that no server could be reached.  The
/// dispatcher and caches behave exactly as they would against a dead
/// network.
pub struct UnroutedServer;

impl ServerOps for UnroutedServer {
    fn mount(&self, _: &Credential, _: &str, _: &str) -> PvfsResult<MountResult> {
        Err(PvfsError::EHOSTNTFD)
    }

    fn umount(&self, _: &Credential, _: FsId) -> PvfsResult<()> {
        Err(PvfsError::EHOSTNTFD)
    }

    fn lookup(&self, _: &Credential, _: ObjectRef, _: &str, _: bool) -> PvfsResult<ObjectRef> {
        Err(PvfsError::EHOSTNTFD)
    }

    fn create(
        &self,
        _: &Credential,
        _: ObjectRef,
        _: &str,
        _: Permissions,
    ) -> PvfsResult<ObjectRef> {
        Err(PvfsError::EHOSTNTFD)
    }

    fn symlink(
        &self,
        _: &Credential,
        _: ObjectRef,
        _: &str,
        _: &str,
        _: Permissions,
    ) -> PvfsResult<ObjectRef> {
        Err(PvfsError::EHOSTNTFD)
    }

    fn mkdir(
        &self,
        _: &Credential,
        _: ObjectRef,
        _: &str,
        _: Permissions,
    ) -> PvfsResult<ObjectRef> {
        Err(PvfsError::EHOSTNTFD)
    }

    fn remove(&self, _: &Credential, _: ObjectRef, _: &str) -> PvfsResult<()> {
        Err(PvfsError::EHOSTNTFD)
    }

    fn rename(
        &self,
        _: &Credential,
        _: ObjectRef,
        _: &str,
        _: ObjectRef,
        _: &str,
    ) -> PvfsResult<()> {
        Err(PvfsError::EHOSTNTFD)
    }

    fn getattr(&self, _: &Credential, _: ObjectRef, _: AttrMask) -> PvfsResult<ObjectAttr> {
        Err(PvfsError::EHOSTNTFD)
    }

    fn setattr(&self, _: &Credential, _: ObjectRef, _: &ObjectAttr) -> PvfsResult<()> {
        Err(PvfsError::EHOSTNTFD)
    }

    fn truncate(&self, _: &Credential, _: ObjectRef, _: i64) -> PvfsResult<()> {
        Err(PvfsError::EHOSTNTFD)
    }

    fn readdir(
        &self,
        _: &Credential,
        _: ObjectRef,
        _: u64,
        _: u32,
        _: Option<u32>,
    ) -> PvfsResult<ReaddirResult> {
        Err(PvfsError::EHOSTNTFD)
    }

    fn readdirplus(
        &self,
        _: &Credential,
        _: ObjectRef,
        _: u64,
        _: u32,
        _: AttrMask,
    ) -> PvfsResult<ReaddirPlusResult> {
        Err(PvfsError::EHOSTNTFD)
    }

    fn getxattr(&self, _: &Credential, _: ObjectRef, _: &str) -> PvfsResult<Vec<u8>> {
        Err(PvfsError::EHOSTNTFD)
    }

    fn setxattr(&self, _: &Credential, _: ObjectRef, _: &str, _: &[u8], _: i32) -> PvfsResult<()> {
        Err(PvfsError::EHOSTNTFD)
    }

    fn listxattr(&self, _: &Credential, _: ObjectRef, _: u32) -> PvfsResult<Vec<String>> {
        Err(PvfsError::EHOSTNTFD)
    }

    fn removexattr(&self, _: &Credential, _: ObjectRef, _: &str) -> PvfsResult<()> {
        Err(PvfsError::EHOSTNTFD)
    }

    fn statfs(&self, _: &Credential, _: FsId) -> PvfsResult<StatfsResult> {
        Err(PvfsError::EHOSTNTFD)
    }

    fn io(
        &self,
        _: &Credential,
        _: &Capability,
        _: ObjectRef,
        _: IoKind,
        _: Extent,
        _: &mut [u8],
    ) -> PvfsResult<i64> {
        Err(PvfsError::EHOSTNTFD)
    }

    fn fsync(&self, _: &Credential, _: ObjectRef) -> PvfsResult<()> {
        Err(PvfsError::EHOSTNTFD)
    }

    fn get_capability(&self, _: &Credential, _: ObjectRef) -> PvfsResult<Capability> {
        Err(PvfsError::EHOSTNTFD)
    }
}
