//! PVFS error codes.
//!
//! Errors cross the kernel/user boundary as a 32-bit integer carrying two
//! banks: errno-mapped codes (the first 60 POSIX errno values get stable
//! PVFS codes) and a small set of PVFS-native codes.  The encoding is a
//! wire contract shared with the kernel module and the servers, so the
//! bit layout here must never change.

use std::fmt;
use std::io;

/// Set on every encoded PVFS error value.
pub const PVFS_ERROR_BIT: i32 = 1 << 30;

/// Set (together with [`PVFS_ERROR_BIT`]) on PVFS-native codes that have
/// no errno equivalent.
pub const PVFS_NON_ERRNO_ERROR_BIT: i32 = 1 << 29;

/// Mask covering the errno-mapped code bank (7 bits of code).
const ERRNO_CODE_MASK: i32 = 0x7f;

/// Bits an error class (BMI, trove, flow, ...) may occupy.  The client
/// core never sets these but must preserve them when relaying server
/// errors back to the kernel.
pub const PVFS_ERROR_CLASS_BITS: i32 = 7 << 7;

const fn errno_coded(code: i32) -> i32 {
    code | PVFS_ERROR_BIT
}

const fn native_coded(code: i32) -> i32 {
    code | PVFS_ERROR_BIT | PVFS_NON_ERRNO_ERROR_BIT
}

/// A PVFS error value in its on-wire encoding.
///
/// Stored positive; the downcall status field carries the negated value.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PvfsError(pub i32);

impl PvfsError {
    // Native codes (no errno equivalent).
    pub const ECANCEL: PvfsError = PvfsError(native_coded(1));
    pub const EDEVINIT: PvfsError = PvfsError(native_coded(2));
    pub const EDETAIL: PvfsError = PvfsError(native_coded(3));
    pub const EHOSTNTFD: PvfsError = PvfsError(native_coded(4));
    pub const EADDRNTFD: PvfsError = PvfsError(native_coded(5));
    pub const ENORECVR: PvfsError = PvfsError(native_coded(6));
    pub const ETRYAGAIN: PvfsError = PvfsError(native_coded(7));
    pub const ENOTPVFS: PvfsError = PvfsError(native_coded(8));
    pub const ESECURITY: PvfsError = PvfsError(native_coded(9));

    // Errno-mapped codes, in their declared order.
    pub const EPERM: PvfsError = PvfsError(errno_coded(1));
    pub const ENOENT: PvfsError = PvfsError(errno_coded(2));
    pub const EINTR: PvfsError = PvfsError(errno_coded(3));
    pub const EIO: PvfsError = PvfsError(errno_coded(4));
    pub const ENXIO: PvfsError = PvfsError(errno_coded(5));
    pub const EBADF: PvfsError = PvfsError(errno_coded(6));
    pub const EAGAIN: PvfsError = PvfsError(errno_coded(7));
    pub const ENOMEM: PvfsError = PvfsError(errno_coded(8));
    pub const EFAULT: PvfsError = PvfsError(errno_coded(9));
    pub const EBUSY: PvfsError = PvfsError(errno_coded(10));
    pub const EEXIST: PvfsError = PvfsError(errno_coded(11));
    pub const ENODEV: PvfsError = PvfsError(errno_coded(12));
    pub const ENOTDIR: PvfsError = PvfsError(errno_coded(13));
    pub const EISDIR: PvfsError = PvfsError(errno_coded(14));
    pub const EINVAL: PvfsError = PvfsError(errno_coded(15));
    pub const EMFILE: PvfsError = PvfsError(errno_coded(16));
    pub const EFBIG: PvfsError = PvfsError(errno_coded(17));
    pub const ENOSPC: PvfsError = PvfsError(errno_coded(18));
    pub const EROFS: PvfsError = PvfsError(errno_coded(19));
    pub const EMLINK: PvfsError = PvfsError(errno_coded(20));
    pub const EPIPE: PvfsError = PvfsError(errno_coded(21));
    pub const EDEADLK: PvfsError = PvfsError(errno_coded(22));
    pub const ENAMETOOLONG: PvfsError = PvfsError(errno_coded(23));
    pub const ENOLCK: PvfsError = PvfsError(errno_coded(24));
    pub const ENOSYS: PvfsError = PvfsError(errno_coded(25));
    pub const ENOTEMPTY: PvfsError = PvfsError(errno_coded(26));
    pub const ELOOP: PvfsError = PvfsError(errno_coded(27));
    pub const EWOULDBLOCK: PvfsError = PvfsError(errno_coded(28));
    pub const ENOMSG: PvfsError = PvfsError(errno_coded(29));
    pub const EUNATCH: PvfsError = PvfsError(errno_coded(30));
    pub const EBADR: PvfsError = PvfsError(errno_coded(31));
    pub const EDEADLOCK: PvfsError = PvfsError(errno_coded(32));
    pub const ENODATA: PvfsError = PvfsError(errno_coded(33));
    pub const ETIME: PvfsError = PvfsError(errno_coded(34));
    pub const ENONET: PvfsError = PvfsError(errno_coded(35));
    pub const EREMOTE: PvfsError = PvfsError(errno_coded(36));
    pub const ECOMM: PvfsError = PvfsError(errno_coded(37));
    pub const EPROTO: PvfsError = PvfsError(errno_coded(38));
    pub const EBADMSG: PvfsError = PvfsError(errno_coded(39));
    pub const EOVERFLOW: PvfsError = PvfsError(errno_coded(40));
    pub const ERESTART: PvfsError = PvfsError(errno_coded(41));
    pub const EMSGSIZE: PvfsError = PvfsError(errno_coded(42));
    pub const EPROTOTYPE: PvfsError = PvfsError(errno_coded(43));
    pub const ENOPROTOOPT: PvfsError = PvfsError(errno_coded(44));
    pub const EPROTONOSUPPORT: PvfsError = PvfsError(errno_coded(45));
    pub const EOPNOTSUPP: PvfsError = PvfsError(errno_coded(46));
    pub const EADDRINUSE: PvfsError = PvfsError(errno_coded(47));
    pub const EADDRNOTAVAIL: PvfsError = PvfsError(errno_coded(48));
    pub const ENETDOWN: PvfsError = PvfsError(errno_coded(49));
    pub const ENETUNREACH: PvfsError = PvfsError(errno_coded(50));
    pub const ENETRESET: PvfsError = PvfsError(errno_coded(51));
    pub const ENOBUFS: PvfsError = PvfsError(errno_coded(52));
    pub const ETIMEDOUT: PvfsError = PvfsError(errno_coded(53));
    pub const ECONNREFUSED: PvfsError = PvfsError(errno_coded(54));
    pub const EHOSTDOWN: PvfsError = PvfsError(errno_coded(55));
    pub const EHOSTUNREACH: PvfsError = PvfsError(errno_coded(56));
    pub const EALREADY: PvfsError = PvfsError(errno_coded(57));
    pub const EACCES: PvfsError = PvfsError(errno_coded(58));
    pub const ECONNRESET: PvfsError = PvfsError(errno_coded(59));
    pub const ERANGE: PvfsError = PvfsError(errno_coded(60));

    /// Highest errno-mapped code plus one.
    pub const ERRNO_MAX: i32 = 61;

    /// True if the value carries the PVFS error bit at all.
    pub fn is_pvfs_error(self) -> bool {
        self.0 & PVFS_ERROR_BIT != 0
    }

    /// True for the PVFS-native bank.
    pub fn is_native(self) -> bool {
        self.is_pvfs_error() && self.0 & PVFS_NON_ERRNO_ERROR_BIT != 0
    }

    /// The bare code with bank and class bits stripped.  Both banks keep
    /// their code in the low 7 bits.
    pub fn code(self) -> i32 {
        self.0 & ERRNO_CODE_MASK
    }

    /// The class bits (BMI, trove, ...) a server may have tagged on.
    pub fn class(self) -> i32 {
        self.0 & PVFS_ERROR_CLASS_BITS
    }

    /// Map a host errno value into the errno-coded bank.  Values without
    /// a stable mapping collapse to EINVAL, matching the original
    /// client's behavior for unknown errnos.
    pub fn from_errno(errno: i32) -> PvfsError {
        match errno {
            libc::EPERM => Self::EPERM,
            libc::ENOENT => Self::ENOENT,
            libc::EINTR => Self::EINTR,
            libc::EIO => Self::EIO,
            libc::ENXIO => Self::ENXIO,
            libc::EBADF => Self::EBADF,
            libc::EAGAIN => Self::EAGAIN,
            libc::ENOMEM => Self::ENOMEM,
            libc::EFAULT => Self::EFAULT,
            libc::EBUSY => Self::EBUSY,
            libc::EEXIST => Self::EEXIST,
            libc::ENODEV => Self::ENODEV,
            libc::ENOTDIR => Self::ENOTDIR,
            libc::EISDIR => Self::EISDIR,
            libc::EINVAL => Self::EINVAL,
            libc::EMFILE => Self::EMFILE,
            libc::EFBIG => Self::EFBIG,
            libc::ENOSPC => Self::ENOSPC,
            libc::EROFS => Self::EROFS,
            libc::EMLINK => Self::EMLINK,
            libc::EPIPE => Self::EPIPE,
            libc::EDEADLK => Self::EDEADLK,
            libc::ENAMETOOLONG => Self::ENAMETOOLONG,
            libc::ENOLCK => Self::ENOLCK,
            libc::ENOSYS => Self::ENOSYS,
            libc::ENOTEMPTY => Self::ENOTEMPTY,
            libc::ELOOP => Self::ELOOP,
            libc::ENOMSG => Self::ENOMSG,
            libc::EUNATCH => Self::EUNATCH,
            libc::EBADR => Self::EBADR,
            libc::ENODATA => Self::ENODATA,
            libc::ETIME => Self::ETIME,
            libc::ENONET => Self::ENONET,
            libc::EREMOTE => Self::EREMOTE,
            libc::ECOMM => Self::ECOMM,
            libc::EPROTO => Self::EPROTO,
            libc::EBADMSG => Self::EBADMSG,
            libc::EOVERFLOW => Self::EOVERFLOW,
            libc::ERESTART => Self::ERESTART,
            libc::EMSGSIZE => Self::EMSGSIZE,
            libc::EPROTOTYPE => Self::EPROTOTYPE,
            libc::ENOPROTOOPT => Self::ENOPROTOOPT,
            libc::EPROTONOSUPPORT => Self::EPROTONOSUPPORT,
            libc::EOPNOTSUPP => Self::EOPNOTSUPP,
            libc::EADDRINUSE => Self::EADDRINUSE,
            libc::EADDRNOTAVAIL => Self::EADDRNOTAVAIL,
            libc::ENETDOWN => Self::ENETDOWN,
            libc::ENETUNREACH => Self::ENETUNREACH,
            libc::ENETRESET => Self::ENETRESET,
            libc::ENOBUFS => Self::ENOBUFS,
            libc::ETIMEDOUT => Self::ETIMEDOUT,
            libc::ECONNREFUSED => Self::ECONNREFUSED,
            libc::EHOSTDOWN => Self::EHOSTDOWN,
            libc::EHOSTUNREACH => Self::EHOSTUNREACH,
            libc::EALREADY => Self::EALREADY,
            libc::EACCES => Self::EACCES,
            libc::ECONNRESET => Self::ECONNRESET,
            libc::ERANGE => Self::ERANGE,
            _ => Self::EINVAL,
        }
    }

    /// Map back to a host errno value.  Native codes fold onto the
    /// closest errno the VFS understands.
    pub fn to_errno(self) -> i32 {
        if self.is_native() {
            return match self {
                Self::ECANCEL => libc::EINTR,
                Self::EDEVINIT => libc::ENODEV,
                Self::EHOSTNTFD | Self::EADDRNTFD => libc::EHOSTUNREACH,
                Self::ENORECVR => libc::EIO,
                Self::ETRYAGAIN => libc::EAGAIN,
                Self::ENOTPVFS => libc::ENODEV,
                Self::ESECURITY => libc::EPERM,
                _ => libc::EINVAL,
            };
        }
        const MAP: [i32; 61] = [
            0,
            libc::EPERM,
            libc::ENOENT,
            libc::EINTR,
            libc::EIO,
            libc::ENXIO,
            libc::EBADF,
            libc::EAGAIN,
            libc::ENOMEM,
            libc::EFAULT,
            libc::EBUSY,
            libc::EEXIST,
            libc::ENODEV,
            libc::ENOTDIR,
            libc::EISDIR,
            libc::EINVAL,
            libc::EMFILE,
            libc::EFBIG,
            libc::ENOSPC,
            libc::EROFS,
            libc::EMLINK,
            libc::EPIPE,
            libc::EDEADLK,
            libc::ENAMETOOLONG,
            libc::ENOLCK,
            libc::ENOSYS,
            libc::ENOTEMPTY,
            libc::ELOOP,
            libc::EWOULDBLOCK,
            libc::ENOMSG,
            libc::EUNATCH,
            libc::EBADR,
            libc::EDEADLK,
            libc::ENODATA,
            libc::ETIME,
            libc::ENONET,
            libc::EREMOTE,
            libc::ECOMM,
            libc::EPROTO,
            libc::EBADMSG,
            libc::EOVERFLOW,
            libc::ERESTART,
            libc::EMSGSIZE,
            libc::EPROTOTYPE,
            libc::ENOPROTOOPT,
            libc::EPROTONOSUPPORT,
            libc::EOPNOTSUPP,
            libc::EADDRINUSE,
            libc::EADDRNOTAVAIL,
            libc::ENETDOWN,
            libc::ENETUNREACH,
            libc::ENETRESET,
            libc::ENOBUFS,
            libc::ETIMEDOUT,
            libc::ECONNREFUSED,
            libc::EHOSTDOWN,
            libc::EHOSTUNREACH,
            libc::EALREADY,
            libc::EACCES,
            libc::ECONNRESET,
            libc::ERANGE,
        ];
        let code = self.code();
        if (1..Self::ERRNO_MAX).contains(&code) {
            MAP[code as usize]
        } else {
            libc::EINVAL
        }
    }

    /// Map an I/O error from the device or key file.
    pub fn from_io(err: &io::Error) -> PvfsError {
        match err.raw_os_error() {
            Some(errno) => Self::from_errno(errno),
            None => Self::EIO,
        }
    }

    /// The value a downcall status field carries.
    pub fn to_wire_status(self) -> i32 {
        -self.0
    }

    /// Decode a (negative) downcall/completion status field.  Zero is
    /// not an error and returns `None`.
    pub fn from_wire_status(status: i32) -> Option<PvfsError> {
        if status == 0 {
            None
        } else {
            Some(PvfsError(-status))
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::ECANCEL => "ECANCEL",
            Self::EDEVINIT => "EDEVINIT",
            Self::EDETAIL => "EDETAIL",
            Self::EHOSTNTFD => "EHOSTNTFD",
            Self::EADDRNTFD => "EADDRNTFD",
            Self::ENORECVR => "ENORECVR",
            Self::ETRYAGAIN => "ETRYAGAIN",
            Self::ENOTPVFS => "ENOTPVFS",
            Self::ESECURITY => "ESECURITY",
            Self::EPERM => "EPERM",
            Self::ENOENT => "ENOENT",
            Self::EINTR => "EINTR",
            Self::EIO => "EIO",
            Self::EBUSY => "EBUSY",
            Self::EEXIST => "EEXIST",
            Self::ENODEV => "ENODEV",
            Self::ENOTDIR => "ENOTDIR",
            Self::EISDIR => "EISDIR",
            Self::EINVAL => "EINVAL",
            Self::ENOMSG => "ENOMSG",
            Self::ETIME => "ETIME",
            Self::ENOSYS => "ENOSYS",
            Self::EACCES => "EACCES",
            _ => "",
        }
    }
}

/// Shorthand for results on the client core paths.
pub type PvfsResult<T> = Result<T, PvfsError>;

impl fmt::Debug for PvfsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = self.name();
        if name.is_empty() {
            write!(f, "PvfsError({:#x})", self.0)
        } else {
            write!(f, "PvfsError({})", name)
        }
    }
}

impl fmt::Display for PvfsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = self.name();
        if !name.is_empty() {
            f.write_str(name)
        } else if self.is_native() {
            write!(f, "PVFS native error {}", self.code())
        } else {
            write!(f, "PVFS errno error {}", self.code())
        }
    }
}

impl std::error::Error for PvfsError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bank_bits() {
        assert!(PvfsError::ENOENT.is_pvfs_error());
        assert!(!PvfsError::ENOENT.is_native());
        assert!(PvfsError::ECANCEL.is_native());
        assert_eq!(PvfsError::ENOENT.code(), 2);
        assert_eq!(PvfsError::ECANCEL.code(), 1);
        assert_eq!(PvfsError::ESECURITY.code(), 9);
    }

    #[test]
    fn errno_round_trip() {
        for errno in [
            libc::EPERM,
            libc::ENOENT,
            libc::EIO,
            libc::EINVAL,
            libc::ETIME,
            libc::ERANGE,
            libc::EACCES,
        ] {
            assert_eq!(PvfsError::from_errno(errno).to_errno(), errno);
        }
    }

    #[test]
    fn wire_status_round_trip() {
        let e = PvfsError::ENOENT;
        let status = e.to_wire_status();
        assert!(status < 0);
        assert_eq!(PvfsError::from_wire_status(status), Some(e));
        assert_eq!(PvfsError::from_wire_status(0), None);
    }

    #[test]
    fn native_fold_to_errno() {
        assert_eq!(PvfsError::ESECURITY.to_errno(), libc::EPERM);
        assert_eq!(PvfsError::ECANCEL.to_errno(), libc::EINTR);
    }

    #[test]
    fn encoding_is_stable() {
        // Wire contract: these exact values cross the device boundary.
        assert_eq!(PvfsError::ENOENT.0, 2 | (1 << 30));
        assert_eq!(PvfsError::ECANCEL.0, 1 | (1 << 30) | (1 << 29));
        assert_eq!(PvfsError::EDEVINIT.0, 2 | (1 << 30) | (1 << 29));
    }
}
