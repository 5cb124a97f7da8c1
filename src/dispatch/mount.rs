//! Dynamic mount bookkeeping.
//!
//! Each fs_mount upcall carries a `protocol://server[:port]/fs_name`
//! URI.  The dispatcher fabricates a synthetic mount-point string
//! `<DYNAMIC-N>` with a monotonically increasing N and returns N to the
//! kernel; the kernel echoes the same N at umount so the entry can be
//! released.

use log::{debug, error};

use crate::error::{PvfsError, PvfsResult};
use crate::types::{FsId, ObjectRef};

/// One mounted filesystem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mntent {
    /// The dynamic mount id echoed by the kernel at umount.
    pub mount_id: i32,
    pub mount_point: String,
    pub config_server: String,
    pub fs_name: String,
    pub fs_id: FsId,
    pub root: ObjectRef,
    /// Server-provided filesystem key, when key security is in use.
    pub fs_key: Vec<u8>,
}

/// Split a mount URI into `(config_server, fs_name)`.
///
/// Exactly one `/` separates host and fs name, and multi-home comma
/// lists are not accepted over the device protocol.
pub fn parse_mount_uri(uri: &str) -> PvfsResult<(String, String)> {
    if uri.contains(',') {
        error!("configuration server must be of the form protocol://address/fs_name");
        return Err(PvfsError::EINVAL);
    }
    let scheme_end = uri.find("://").ok_or_else(|| {
        error!("mount URI missing protocol: {:?}", uri);
        PvfsError::EINVAL
    })?;
    let rest = &uri[scheme_end + 3..];
    let slash = rest.rfind('/').ok_or_else(|| {
        error!("configuration server must be of the form protocol://address/fs_name");
        PvfsError::EINVAL
    })?;
    let (host, fs_name) = rest.split_at(slash);
    let fs_name = &fs_name[1..];
    if host.is_empty() || fs_name.is_empty() || host.contains('/') {
        return Err(PvfsError::EINVAL);
    }
    let config_server = format!("{}{}", &uri[..scheme_end + 3], host);
    Ok((config_server, fs_name.to_owned()))
}

/// The set of active mounts.
#[derive(Debug, Default)]
pub struct MountTable {
    entries: Vec<Mntent>,
    next_dynamic_id: i32,
}

impl MountTable {
    pub fn new() -> MountTable {
        MountTable::default()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Record a successful mount; returns the dynamic mount id.
    pub fn add(
        &mut self,
        config_server: String,
        fs_name: String,
        fs_id: FsId,
        root: ObjectRef,
    ) -> i32 {
        let mount_id = self.next_dynamic_id;
        self.next_dynamic_id += 1;
        let mount_point = format!("<DYNAMIC-{}>", mount_id);
        debug!("using mount point {} for fs {}", mount_point, fs_name);
        self.entries.push(Mntent {
            mount_id,
            mount_point,
            config_server,
            fs_name,
            fs_id,
            root,
            fs_key: Vec::new(),
        });
        mount_id
    }

    /// Release the mntent the kernel named by its dynamic id.
    pub fn remove(&mut self, mount_id: i32) -> Option<Mntent> {
        let pos = self.entries.iter().position(|m| m.mount_id == mount_id)?;
        Some(self.entries.remove(pos))
    }

    pub fn by_fs_id(&self, fs_id: FsId) -> Option<&Mntent> {
        self.entries.iter().find(|m| m.fs_id == fs_id)
    }

    pub fn by_mount_id(&self, mount_id: i32) -> Option<&Mntent> {
        self.entries.iter().find(|m| m.mount_id == mount_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Handle;

    #[test]
    fn uri_parsing() {
        let (server, fs) = parse_mount_uri("tcp://server1:3334/pvfs2-fs").unwrap();
        assert_eq!(server, "tcp://server1:3334");
        assert_eq!(fs, "pvfs2-fs");

        let (server, fs) = parse_mount_uri("ib://node/alpha").unwrap();
        assert_eq!(server, "ib://node");
        assert_eq!(fs, "alpha");
    }

    #[test]
    fn uri_rejects_malformed() {
        assert!(parse_mount_uri("tcp://server1:3334").is_err());
        assert!(parse_mount_uri("server1/fs").is_err());
        assert!(parse_mount_uri("tcp://a,b/fs").is_err());
        assert!(parse_mount_uri("tcp:///fs").is_err());
        assert!(parse_mount_uri("tcp://host/").is_err());
        assert!(parse_mount_uri("tcp://host/a/b").is_err());
    }

    #[test]
    fn dynamic_ids_are_monotonic() {
        let mut table = MountTable::new();
        let root = ObjectRef::new(Handle(1), 7);
        let a = table.add("tcp://x".into(), "one".into(), 7, root);
        let b = table.add("tcp://x".into(), "two".into(), 8, root);
        assert_eq!(b, a + 1);
        assert_eq!(table.by_mount_id(a).unwrap().mount_point, "<DYNAMIC-0>");
        let removed = table.remove(a).unwrap();
        assert_eq!(removed.fs_name, "one");
        assert!(table.remove(a).is_none());
        assert_eq!(table.by_fs_id(8).unwrap().mount_id, b);
        assert!(table.by_fs_id(7).is_none());
    }
}
