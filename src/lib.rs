//! PVFS2/OrangeFS client-side runtime core.
//!
//! The layer between the kernel upcall stream (a character device
//! delivering VFS requests) and the system interface that talks to the
//! servers: the upcall dispatcher and its operation manager, the client
//! caches (attributes, names, readdir tokens, capabilities) on a shared
//! timeout-cache substrate, the completion contexts and worker
//! backends, and the credential/capability machinery.
//!
//! The wire RPC encoding, the server storage engine, the kernel module
//! and the network transport live elsewhere; this crate touches them
//! only through the device protocol ([`proto`]) and the system
//! interface boundary ([`sysint::ServerOps`]).

#![warn(rust_2018_idioms)]

pub mod cache;
pub mod context;
pub mod dev;
pub mod dispatch;
pub mod error;
pub mod hints;
pub mod manager;
pub mod perf;
pub mod proto;
pub mod security;
pub mod supervisor;
pub mod sysint;
pub mod tcache;
pub mod types;

pub use crate::cache::{Acache, Capcache, Ncache, Rcache};
pub use crate::context::{Completion, CompletionContext, ContextSet, OpId, UserToken};
pub use crate::dispatch::{ClientCore, Caches, CoreConfig};
pub use crate::error::{PvfsError, PvfsResult};
pub use crate::hints::HintSet;
pub use crate::manager::{Manager, Posted, Target, WorkerKind};
pub use crate::sysint::ServerOps;
pub use crate::types::{Capability, Credential, Handle, ObjectAttr, ObjectRef};
