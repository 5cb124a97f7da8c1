//! End-to-end dispatcher runs over a fake request device and an
//! in-memory server.

use std::collections::{HashMap, VecDeque};
use std::io::{self, IoSlice};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use zerocopy::IntoBytes;

use pvfs2_client::dev::DeviceChannel;
use pvfs2_client::dispatch::{ClientCore, CoreConfig};
use pvfs2_client::error::{PvfsError, PvfsResult};
use pvfs2_client::proto::{
    self, decode_dirents, put_str, pvfs_upcall_header, Opcode, PVFS_DEV_MAGIC,
    PVFS_DEV_PROTO_VERSION,
};
use pvfs2_client::sysint::{
    DirentResult, Extent, IoKind, MountResult, ReaddirPlusResult, ReaddirResult, ServerOps,
    StatfsResult,
};
use pvfs2_client::types::{
    epoch_secs, AttrMask, AttrObject, CapOpMask, Capability, Credential, FsId, Handle, ObjectAttr,
    ObjectRef, Permissions,
};

const FS_ID: FsId = 42;

fn root() -> ObjectRef {
    ObjectRef::new(Handle(1), FS_ID)
}

// fake request device

#[derive(Debug, Clone)]
struct CapturedDowncall {
    tag: u64,
    op: u32,
    status: i32,
    body: Vec<u8>,
    trailer: Vec<u8>,
}

#[derive(Default)]
struct FakeDevice {
    upcalls: Mutex<VecDeque<Vec<u8>>>,
    ready: Condvar,
    downcalls: Mutex<Vec<CapturedDowncall>>,
}

impl FakeDevice {
    fn push_upcall(&self, image: Vec<u8>) {
        self.upcalls.lock().push_back(image);
        self.ready.notify_all();
    }

    fn downcalls(&self) -> Vec<CapturedDowncall> {
        self.downcalls.lock().clone()
    }

    fn downcall_for(&self, tag: u64) -> Option<CapturedDowncall> {
        self.downcalls.lock().iter().find(|d| d.tag == tag).cloned()
    }
}

impl DeviceChannel for FakeDevice {
    fn receive(&self, buf: &mut [u8], timeout: Option<Duration>) -> io::Result<Option<usize>> {
        let mut queue = self.upcalls.lock();
        if queue.is_empty() {
            match timeout {
                Some(t) if t > Duration::ZERO => {
                    self.ready.wait_for(&mut queue, t);
                }
                _ => return Ok(None),
            }
        }
        match queue.pop_front() {
            Some(image) => {
                buf[..image.len()].copy_from_slice(&image);
                Ok(Some(image.len()))
            }
            None => Ok(None),
        }
    }

    fn send(&self, iov: &[IoSlice<'_>]) -> io::Result<()> {
        let mut raw = Vec::new();
        for slice in iov {
            raw.extend_from_slice(slice);
        }
        assert!(raw.len() >= 24, "short downcall");
        let tag = u64::from_le_bytes(raw[0..8].try_into().unwrap());
        let op = u32::from_le_bytes(raw[8..12].try_into().unwrap());
        let status = i32::from_le_bytes(raw[12..16].try_into().unwrap());
        let trailer_size = u64::from_le_bytes(raw[16..24].try_into().unwrap()) as usize;
        let body_end = raw.len() - trailer_size;
        self.downcalls.lock().push(CapturedDowncall {
            tag,
            op,
            status,
            body: raw[24..body_end].to_vec(),
            trailer: raw[body_end..].to_vec(),
        });
        Ok(())
    }
}

// in-memory server

#[derive(Default)]
struct Namespace {
    entries: HashMap<(ObjectRef, String), ObjectRef>,
    attrs: HashMap<ObjectRef, ObjectAttr>,
    files: HashMap<ObjectRef, Vec<u8>>,
    dirents: HashMap<ObjectRef, Vec<DirentResult>>,
}

#[derive(Default)]
struct MemServer {
    ns: Mutex<Namespace>,
    lookup_calls: AtomicUsize,
    getattr_calls: AtomicUsize,
    io_calls: AtomicUsize,
    capability_fetches: AtomicUsize,
    io_delay: Option<Duration>,
}

impl MemServer {
    fn with_io_delay(delay: Duration) -> MemServer {
        MemServer {
            io_delay: Some(delay),
            ..MemServer::default()
        }
    }

    fn add_entry(&self, parent: ObjectRef, name: &str, refn: ObjectRef) {
        self.ns.lock().entries.insert((parent, name.into()), refn);
    }

    fn add_attr(&self, refn: ObjectRef, attr: ObjectAttr) {
        self.ns.lock().attrs.insert(refn, attr);
    }

    fn add_file(&self, refn: ObjectRef, content: Vec<u8>) {
        self.ns.lock().files.insert(refn, content);
    }

    fn file(&self, refn: ObjectRef) -> Vec<u8> {
        self.ns.lock().files.get(&refn).cloned().unwrap_or_default()
    }

    fn add_dirents(&self, refn: ObjectRef, dirents: Vec<DirentResult>) {
        self.ns.lock().dirents.insert(refn, dirents);
    }
}

impl ServerOps for MemServer {
    fn mount(&self, _: &Credential, _: &str, _: &str) -> PvfsResult<MountResult> {
        Ok(MountResult {
            fs_id: FS_ID,
            root: root(),
        })
    }

    fn umount(&self, _: &Credential, _: FsId) -> PvfsResult<()> {
        Ok(())
    }

    fn lookup(
        &self,
        _: &Credential,
        parent: ObjectRef,
        name: &str,
        _: bool,
    ) -> PvfsResult<ObjectRef> {
        self.lookup_calls.fetch_add(1, Ordering::SeqCst);
        self.ns
            .lock()
            .entries
            .get(&(parent, name.to_owned()))
            .copied()
            .ok_or(PvfsError::ENOENT)
    }

    fn create(
        &self,
        _: &Credential,
        parent: ObjectRef,
        name: &str,
        _: Permissions,
    ) -> PvfsResult<ObjectRef> {
        let refn = ObjectRef::new(Handle(1000 + name.len() as u128), FS_ID);
        self.add_entry(parent, name, refn);
        Ok(refn)
    }

    fn symlink(
        &self,
        _: &Credential,
        _: ObjectRef,
        _: &str,
        _: &str,
        _: Permissions,
    ) -> PvfsResult<ObjectRef> {
        Err(PvfsError::ENOSYS)
    }

    fn mkdir(
        &self,
        _: &Credential,
        _: ObjectRef,
        _: &str,
        _: Permissions,
    ) -> PvfsResult<ObjectRef> {
        Err(PvfsError::ENOSYS)
    }

    fn remove(&self, _: &Credential, parent: ObjectRef, name: &str) -> PvfsResult<()> {
        self.ns
            .lock()
            .entries
            .remove(&(parent, name.to_owned()))
            .map(|_| ())
            .ok_or(PvfsError::ENOENT)
    }

    fn rename(
        &self,
        _: &Credential,
        _: ObjectRef,
        _: &str,
        _: ObjectRef,
        _: &str,
    ) -> PvfsResult<()> {
        Err(PvfsError::ENOSYS)
    }

    fn getattr(&self, _: &Credential, refn: ObjectRef, _: AttrMask) -> PvfsResult<ObjectAttr> {
        self.getattr_calls.fetch_add(1, Ordering::SeqCst);
        self.ns
            .lock()
            .attrs
            .get(&refn)
            .cloned()
            .ok_or(PvfsError::ENOENT)
    }

    fn setattr(&self, _: &Credential, _: ObjectRef, _: &ObjectAttr) -> PvfsResult<()> {
        Ok(())
    }

    fn truncate(&self, _: &Credential, _: ObjectRef, _: i64) -> PvfsResult<()> {
        Ok(())
    }

    fn readdir(
        &self,
        _: &Credential,
        refn: ObjectRef,
        token: u64,
        count: u32,
        _: Option<u32>,
    ) -> PvfsResult<ReaddirResult> {
        let ns = self.ns.lock();
        let all = ns.dirents.get(&refn).ok_or(PvfsError::ENOTDIR)?;
        let start = if token == pvfs2_client::cache::rcache::ITERATE_START {
            0
        } else {
            token as usize
        };
        let dirents: Vec<DirentResult> =
            all.iter().skip(start).take(count as usize).cloned().collect();
        let next = start + dirents.len();
        Ok(ReaddirResult {
            dirents,
            token: if next >= all.len() {
                pvfs2_client::cache::rcache::ITERATE_END
            } else {
                next as u64
            },
            dirdata_index: 0,
        })
    }

    fn readdirplus(
        &self,
        _: &Credential,
        _: ObjectRef,
        _: u64,
        _: u32,
        _: AttrMask,
    ) -> PvfsResult<ReaddirPlusResult> {
        Err(PvfsError::ENOSYS)
    }

    fn getxattr(&self, _: &Credential, _: ObjectRef, _: &str) -> PvfsResult<Vec<u8>> {
        Err(PvfsError::ENODATA)
    }

    fn setxattr(&self, _: &Credential, _: ObjectRef, _: &str, _: &[u8], _: i32) -> PvfsResult<()> {
        Ok(())
    }

    fn listxattr(&self, _: &Credential, _: ObjectRef, _: u32) -> PvfsResult<Vec<String>> {
        Ok(vec![])
    }

    fn removexattr(&self, _: &Credential, _: ObjectRef, _: &str) -> PvfsResult<()> {
        Ok(())
    }

    fn statfs(&self, _: &Credential, _: FsId) -> PvfsResult<StatfsResult> {
        Ok(StatfsResult {
            block_size: 4096,
            blocks_total: 1_000_000,
            blocks_avail: 900_000,
            files_total: 1_000,
            files_avail: 900,
        })
    }

    fn io(
        &self,
        _: &Credential,
        cap: &Capability,
        refn: ObjectRef,
        kind: IoKind,
        extent: Extent,
        buf: &mut [u8],
    ) -> PvfsResult<i64> {
        assert!(
            epoch_secs() <= cap.timeout,
            "server presented an expired capability"
        );
        self.io_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.io_delay {
            std::thread::sleep(delay);
        }
        let mut ns = self.ns.lock();
        let file = ns.files.entry(refn).or_default();
        let offset = extent.offset as usize;
        let len = extent.len as usize;
        match kind {
            IoKind::Write => {
                if file.len() < offset + len {
                    file.resize(offset + len, 0);
                }
                file[offset..offset + len].copy_from_slice(&buf[..len]);
            }
            IoKind::Read => {
                let available = file.len().saturating_sub(offset).min(len);
                buf[..available].copy_from_slice(&file[offset..offset + available]);
                return Ok(available as i64);
            }
        }
        Ok(len as i64)
    }

    fn fsync(&self, _: &Credential, _: ObjectRef) -> PvfsResult<()> {
        Ok(())
    }

    fn get_capability(&self, cred: &Credential, refn: ObjectRef) -> PvfsResult<Capability> {
        self.capability_fetches.fetch_add(1, Ordering::SeqCst);
        Ok(Capability {
            issuer: "test-server".into(),
            fs_id: refn.fs_id,
            op_mask: CapOpMask::READ | CapOpMask::WRITE,
            handles: vec![refn.handle],
            timeout: epoch_secs() + 600,
            signature: vec![0x5a; 16],
        })
    }
}

// harness

struct Harness {
    core: ClientCore<MemServer>,
    dev: Arc<FakeDevice>,
    server: Arc<MemServer>,
    next_tag: u64,
}

impl Harness {
    fn new(server: MemServer) -> Harness {
        let dev = Arc::new(FakeDevice::default());
        let server = Arc::new(server);
        let mut core = ClientCore::new(
            CoreConfig::default(),
            server.clone(),
            dev.clone() as Arc<dyn DeviceChannel>,
        )
        .expect("core construction");
        core.start();
        Harness {
            core,
            dev,
            server,
            next_tag: 1,
        }
    }

    fn upcall(&mut self, op: Opcode, body: &[u8], strings: &[&str], extra: &[u8]) -> u64 {
        let tag = self.next_tag;
        self.next_tag += 1;
        let header = pvfs_upcall_header {
            magic: PVFS_DEV_MAGIC,
            proto_version: PVFS_DEV_PROTO_VERSION,
            tag,
            op: op as u32,
            uid: 1000,
            gid: 1000,
            pid: 4242,
        };
        let mut image = header.as_bytes().to_vec();
        image.extend_from_slice(body);
        for s in strings {
            put_str(&mut image, s);
        }
        image.extend_from_slice(extra);
        self.dev.push_upcall(image);
        tag
    }

    /// Pump the dispatcher until a downcall for `tag` lands.
    fn pump_until_downcall(&mut self, tag: u64) -> CapturedDowncall {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            if let Some(d) = self.dev.downcall_for(tag) {
                return d;
            }
            assert!(
                Instant::now() < deadline,
                "no downcall for tag {tag} within 10s"
            );
            self.core
                .run_once(Duration::from_millis(10))
                .expect("dispatcher cycle");
        }
    }

    /// Pump a few cycles without expecting anything.
    fn pump(&mut self, cycles: usize) {
        for _ in 0..cycles {
            self.core
                .run_once(Duration::from_millis(5))
                .expect("dispatcher cycle");
        }
    }

    fn mount(&mut self) {
        let tag = self.upcall(Opcode::FsMount, &[], &["tcp://server1:3334/pvfs2-fs"], &[]);
        let d = self.pump_until_downcall(tag);
        assert_eq!(d.status, 0, "mount failed: {}", d.status);
        assert_eq!(self.core.mounted_filesystems(), 1);
    }
}

fn file_attr(size: i64) -> ObjectAttr {
    ObjectAttr {
        owner: 1000,
        group: 1000,
        perms: Permissions::OWNER_READ | Permissions::OWNER_WRITE,
        atime: 1,
        mtime: 2,
        ctime: 3,
        mask: AttrMask::COMMON | AttrMask::SIZE,
        object: AttrObject::Datafile { size },
    }
}

#[test]
fn upcalls_before_mount_are_dropped() {
    let mut h = Harness::new(MemServer::default());
    let body = proto::pvfs_getattr_upcall {
        refn: root().into(),
        mask: AttrMask::COMMON.bits(),
        pad: 0,
    };
    let tag = h.upcall(Opcode::Getattr, body.as_bytes(), &[], &[]);
    h.pump(3);
    // no downcall: the kernel is expected to retry after the mount
    assert!(h.dev.downcall_for(tag).is_none());
    assert_eq!(h.core.ops_in_progress(), 0);
}

#[test]
fn mount_assigns_dynamic_id() {
    let mut h = Harness::new(MemServer::default());
    let tag = h.upcall(Opcode::FsMount, &[], &["tcp://server1:3334/pvfs2-fs"], &[]);
    let d = h.pump_until_downcall(tag);
    assert_eq!(d.status, 0);
    assert_eq!(d.op, Opcode::FsMount as u32);
    // fs_id, then the dynamic mount id the kernel echoes at umount
    let fs_id = i32::from_le_bytes(d.body[0..4].try_into().unwrap());
    let id = i32::from_le_bytes(d.body[4..8].try_into().unwrap());
    assert_eq!(fs_id, FS_ID);
    assert_eq!(id, 0);

    // umount with the echoed id is serviced inline
    let body = proto::pvfs_fs_umount_upcall { id, fs_id };
    let tag = h.upcall(Opcode::FsUmount, body.as_bytes(), &["tcp://server1:3334/pvfs2-fs"], &[]);
    let d = h.pump_until_downcall(tag);
    assert_eq!(d.status, 0);
    assert_eq!(h.core.mounted_filesystems(), 0);
}

#[test]
fn lookup_hits_ncache_on_second_try() {
    let server = MemServer::default();
    server.add_entry(root(), "alpha", ObjectRef::new(Handle(7), FS_ID));
    let mut h = Harness::new(server);
    h.mount();

    let body = proto::pvfs_lookup_upcall {
        parent: root().into(),
        sym_follow: 0,
        pad: 0,
    };
    let tag = h.upcall(Opcode::Lookup, body.as_bytes(), &["alpha"], &[]);
    let d = h.pump_until_downcall(tag);
    assert_eq!(d.status, 0);
    let lo = u64::from_le_bytes(d.body[0..8].try_into().unwrap());
    assert_eq!(lo, 7);
    assert_eq!(h.server.lookup_calls.load(Ordering::SeqCst), 1);

    // second lookup is satisfied by the name cache
    let tag = h.upcall(Opcode::Lookup, body.as_bytes(), &["alpha"], &[]);
    let d = h.pump_until_downcall(tag);
    assert_eq!(d.status, 0);
    assert_eq!(h.server.lookup_calls.load(Ordering::SeqCst), 1);
}

#[test]
fn failed_lookup_reports_enoent() {
    let mut h = Harness::new(MemServer::default());
    h.mount();
    let body = proto::pvfs_lookup_upcall {
        parent: root().into(),
        sym_follow: 0,
        pad: 0,
    };
    let tag = h.upcall(Opcode::Lookup, body.as_bytes(), &["missing"], &[]);
    let d = h.pump_until_downcall(tag);
    assert_eq!(PvfsError::from_wire_status(d.status), Some(PvfsError::ENOENT));
}

#[test]
fn getattr_served_from_acache() {
    let server = MemServer::default();
    let refn = ObjectRef::new(Handle(9), FS_ID);
    server.add_attr(refn, file_attr(1024));
    let mut h = Harness::new(server);
    h.mount();

    let body = proto::pvfs_getattr_upcall {
        refn: refn.into(),
        mask: (AttrMask::COMMON | AttrMask::SIZE).bits(),
        pad: 0,
    };
    let tag = h.upcall(Opcode::Getattr, body.as_bytes(), &[], &[]);
    let d = h.pump_until_downcall(tag);
    assert_eq!(d.status, 0);
    assert_eq!(h.server.getattr_calls.load(Ordering::SeqCst), 1);
    // wire attr: owner at 0, size at offset 40
    let owner = u32::from_le_bytes(d.body[0..4].try_into().unwrap());
    let size = i64::from_le_bytes(d.body[40..48].try_into().unwrap());
    assert_eq!(owner, 1000);
    assert_eq!(size, 1024);

    // second getattr: no server round-trip
    let tag = h.upcall(Opcode::Getattr, body.as_bytes(), &[], &[]);
    let d = h.pump_until_downcall(tag);
    assert_eq!(d.status, 0);
    assert_eq!(h.server.getattr_calls.load(Ordering::SeqCst), 1);
}

#[test]
fn file_read_passes_through_shared_region() {
    let server = MemServer::default();
    let refn = ObjectRef::new(Handle(11), FS_ID);
    server.add_file(refn, b"the quick brown fox".to_vec());
    let mut h = Harness::new(server);
    h.mount();

    let body = proto::pvfs_io_upcall {
        refn: refn.into(),
        io_type: proto::IoType::Read as u32,
        buf_index: 0,
        count: 19,
        offset: 0,
    };
    let tag = h.upcall(Opcode::FileIo, body.as_bytes(), &[], &[]);
    let d = h.pump_until_downcall(tag);
    assert_eq!(d.status, 0);
    let amt = i64::from_le_bytes(d.body[0..8].try_into().unwrap());
    assert_eq!(amt, 19);

    let buf = h.core.io_region().buffer(0).unwrap();
    let data = unsafe { buf.as_mut_slice() };
    assert_eq!(&data[..19], b"the quick brown fox");
    // the capability was fetched once and cached
    assert_eq!(h.server.capability_fetches.load(Ordering::SeqCst), 1);
}

#[test]
fn iox_split_emits_single_downcall() {
    let server = MemServer::default();
    let refn = ObjectRef::new(Handle(13), FS_ID);
    let mut h = Harness::new(server);
    h.mount();

    // 130 extents of 8 bytes: ceil(130/64) = 3 posted operations, one
    // downcall summing the per-op totals
    let extent_count = 130u32;
    let body = proto::pvfs_iox_upcall {
        refn: refn.into(),
        io_type: proto::IoType::Write as u32,
        buf_index: 0,
        extent_count,
        pad: 0,
    };
    let mut extents = Vec::new();
    for i in 0..extent_count as i64 {
        extents.extend_from_slice(
            proto::pvfs_iox_extent {
                offset: i * 8,
                len: 8,
            }
            .as_bytes(),
        );
    }
    // fill the shared descriptor with the outbound bytes
    {
        let buf = h.core.io_region().buffer(0).unwrap();
        let data = unsafe { buf.as_mut_slice() };
        for (i, b) in data[..extent_count as usize * 8].iter_mut().enumerate() {
            *b = (i % 251) as u8;
        }
    }

    let tag = h.upcall(Opcode::FileIox, body.as_bytes(), &[], &extents);
    let d = h.pump_until_downcall(tag);
    assert_eq!(d.status, 0);
    let amt = i64::from_le_bytes(d.body[0..8].try_into().unwrap());
    assert_eq!(amt, extent_count as i64 * 8);
    // exactly one downcall for the whole scatter list
    assert_eq!(
        h.dev.downcalls().iter().filter(|d| d.tag == tag).count(),
        1
    );
    assert_eq!(
        h.server.io_calls.load(Ordering::SeqCst),
        extent_count as usize
    );
    let file = h.server.file(refn);
    assert_eq!(file.len(), extent_count as usize * 8);
    for (i, b) in file.iter().enumerate() {
        assert_eq!(*b, (i % 251) as u8);
    }
}

#[test]
fn cancelled_io_skips_downcall() {
    let server = MemServer::with_io_delay(Duration::from_millis(150));
    let refn = ObjectRef::new(Handle(17), FS_ID);
    server.add_file(refn, vec![0u8; 64]);
    let mut h = Harness::new(server);
    h.mount();

    let body = proto::pvfs_io_upcall {
        refn: refn.into(),
        io_type: proto::IoType::Read as u32,
        buf_index: 0,
        count: 64,
        offset: 0,
    };
    let io_tag = h.upcall(Opcode::FileIo, body.as_bytes(), &[], &[]);
    h.pump(2);

    let cancel_body = proto::pvfs_cancel_upcall { tag: io_tag };
    let cancel_tag = h.upcall(Opcode::Cancel, cancel_body.as_bytes(), &[], &[]);
    let d = h.pump_until_downcall(cancel_tag);
    assert_eq!(d.status, 0);

    // drain: the io completion arrives but its downcall is suppressed
    let deadline = Instant::now() + Duration::from_secs(5);
    while h.core.ops_in_progress() > 0 && Instant::now() < deadline {
        h.pump(1);
    }
    assert_eq!(h.core.ops_in_progress(), 0);
    assert!(
        h.dev.downcall_for(io_tag).is_none(),
        "cancelled request must not produce a downcall"
    );
}

#[test]
fn duplicate_tags_are_suppressed() {
    let server = MemServer::with_io_delay(Duration::from_millis(100));
    let refn = ObjectRef::new(Handle(19), FS_ID);
    server.add_file(refn, vec![7u8; 32]);
    let mut h = Harness::new(server);
    h.mount();

    let body = proto::pvfs_io_upcall {
        refn: refn.into(),
        io_type: proto::IoType::Read as u32,
        buf_index: 0,
        count: 32,
        offset: 0,
    };
    let tag = h.upcall(Opcode::FileIo, body.as_bytes(), &[], &[]);
    // retransmit with the same tag while service is in progress
    let header = pvfs_upcall_header {
        magic: PVFS_DEV_MAGIC,
        proto_version: PVFS_DEV_PROTO_VERSION,
        tag,
        op: Opcode::FileIo as u32,
        uid: 1000,
        gid: 1000,
        pid: 4242,
    };
    let mut dup = header.as_bytes().to_vec();
    dup.extend_from_slice(body.as_bytes());
    h.dev.push_upcall(dup);

    let d = h.pump_until_downcall(tag);
    assert_eq!(d.status, 0);
    h.pump(3);
    assert_eq!(
        h.dev.downcalls().iter().filter(|d| d.tag == tag).count(),
        1,
        "retransmission must not produce a second downcall"
    );
    assert_eq!(h.server.io_calls.load(Ordering::SeqCst), 1);
}

#[test]
fn readdir_trailer_and_rcache() {
    let server = MemServer::default();
    let dir = ObjectRef::new(Handle(23), FS_ID);
    server.add_dirents(
        dir,
        vec![
            DirentResult {
                refn: ObjectRef::new(Handle(31), FS_ID),
                name: "a".into(),
            },
            DirentResult {
                refn: ObjectRef::new(Handle(32), FS_ID),
                name: "bb".into(),
            },
            DirentResult {
                refn: ObjectRef::new(Handle(33), FS_ID),
                name: "ccc".into(),
            },
        ],
    );
    let mut h = Harness::new(server);
    h.mount();

    let body = proto::pvfs_readdir_upcall {
        refn: dir.into(),
        token: pvfs2_client::cache::rcache::ITERATE_START,
        count: 2,
        buf_index: -1,
    };
    let tag = h.upcall(Opcode::Readdir, body.as_bytes(), &[], &[]);
    let d = h.pump_until_downcall(tag);
    assert_eq!(d.status, 0);
    let token = u64::from_le_bytes(d.body[0..8].try_into().unwrap());
    let count = u32::from_le_bytes(d.body[8..12].try_into().unwrap());
    assert_eq!(count, 2);
    assert_eq!(token, 2);

    let mut words = vec![0u64; d.trailer.len().div_ceil(8)];
    words.as_mut_slice().as_mut_bytes()[..d.trailer.len()].copy_from_slice(&d.trailer);
    let dirents =
        decode_dirents(&words.as_slice().as_bytes()[..d.trailer.len()], 2).expect("dirent stream");
    assert_eq!(dirents[0].name, "a");
    assert_eq!(dirents[1].name, "bb");

    // continuation token is now mapped to its dirdata shard
    assert_eq!(h.core.caches.rcache.get_cached(dir, 2).unwrap(), 0);
}

#[test]
fn statfs_round_trip() {
    let mut h = Harness::new(MemServer::default());
    h.mount();
    let body = proto::pvfs_statfs_upcall { fs_id: FS_ID, pad: 0 };
    let tag = h.upcall(Opcode::Statfs, body.as_bytes(), &[], &[]);
    let d = h.pump_until_downcall(tag);
    assert_eq!(d.status, 0);
    let block_size = i64::from_le_bytes(d.body[0..8].try_into().unwrap());
    let blocks_avail = i64::from_le_bytes(d.body[16..24].try_into().unwrap());
    assert_eq!(block_size, 4096);
    assert_eq!(blocks_avail, 900_000);
}

#[test]
fn perf_count_returns_counter_text() {
    let mut h = Harness::new(MemServer::default());
    h.mount();
    let body = proto::pvfs_perf_count_upcall {
        kind: proto::PerfCountKind::Ncache as u32,
        pad: 0,
    };
    let tag = h.upcall(Opcode::PerfCount, body.as_bytes(), &[], &[]);
    let d = h.pump_until_downcall(tag);
    assert_eq!(d.status, 0);
    let text = String::from_utf8_lossy(&d.trailer);
    assert!(text.contains("NCACHE_HITS"), "got: {text}");
}

#[test]
fn param_tunes_ncache_timeout() {
    let mut h = Harness::new(MemServer::default());
    h.mount();

    let body = proto::pvfs_param_upcall {
        cmd: proto::ParamCmd::Set as u32,
        param: proto::ParamId::NcacheTimeoutMsecs as u32,
        value: 12_000,
    };
    let tag = h.upcall(Opcode::Param, body.as_bytes(), &[], &[]);
    assert_eq!(h.pump_until_downcall(tag).status, 0);

    let body = proto::pvfs_param_upcall {
        cmd: proto::ParamCmd::Get as u32,
        param: proto::ParamId::NcacheTimeoutMsecs as u32,
        value: 0,
    };
    let tag = h.upcall(Opcode::Param, body.as_bytes(), &[], &[]);
    let d = h.pump_until_downcall(tag);
    assert_eq!(d.status, 0);
    let value = i64::from_le_bytes(d.body[0..8].try_into().unwrap());
    assert_eq!(value, 12_000);
}

#[test]
fn unknown_opcode_gets_enosys() {
    let mut h = Harness::new(MemServer::default());
    h.mount();
    let header = pvfs_upcall_header {
        magic: PVFS_DEV_MAGIC,
        proto_version: PVFS_DEV_PROTO_VERSION,
        tag: 999,
        op: 0xdead,
        uid: 1000,
        gid: 1000,
        pid: 4242,
    };
    h.dev.push_upcall(header.as_bytes().to_vec());
    let d = h.pump_until_downcall(999);
    assert_eq!(PvfsError::from_wire_status(d.status), Some(PvfsError::ENOSYS));
}
