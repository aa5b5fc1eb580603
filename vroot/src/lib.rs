//! vroot — a user-space virtual-root engine.
//!
//! vroot makes an unmodified, dynamically linked program observe a
//! synthetic root filesystem assembled from real host directories. An
//! interposition shim (not part of this crate) routes the program's
//! file-system and exec calls into the engine; the engine translates
//! every virtual pathname to a host pathname under a declarative rule
//! set, rewrites argv/envp on exec (explicit ld.so startup, emulator
//! prepending for foreign-CPU binaries), and simulates privileged
//! ownership changes for unprivileged builds.
//!
//! # Subsystems
//!
//! ```text
//! vroot
//! ├── session    session config + per-thread context
//! ├── paths      path component lists, cleanup primitives
//! ├── ruletree   memory-mapped rule database (reader + builder)
//! ├── mapping    resolver, rule engine, reverse mapper, procfs, union dirs
//! ├── exec       binary inspection, argv/envp rewriting, script handling
//! ├── vperm      virtual uid/gid/mode simulation + daemon RPC
//! ├── fdpath     fd → virtual path registry for the *at() family
//! ├── chroot     virtual chroot prefix
//! └── net        network address rules
//! ```
//!
//! The engine is synchronous and runs on the caller's thread; the only
//! blocking IPC is the vperm mutation socket served by the session
//! daemon.
//!
//! # Entry
//!
//! Everything hangs off a [`Session`], opened from the environment or an
//! explicit [`session::SessionConfig`]:
//!
//! ```no_run
//! use vroot::Session;
//! use vroot::mapping::fnclass;
//!
//! let session = Session::from_env()?;
//! let res = session.map_path("sh", "open", fnclass::OPEN, "/bin/ls", false);
//! println!("{:?}", res.path());
//! # Ok::<(), vroot::error::SessionError>(())
//! ```

pub mod chroot;
pub mod error;
pub mod exec;
pub mod fdpath;
pub mod logging;
pub mod mapping;
pub mod net;
pub mod paths;
pub mod ruletree;
pub mod session;
pub mod vperm;

pub use error::{ExecError, MappingError, RuleTreeError, SessionError, VpermError};
pub use mapping::MappingResult;
pub use session::Session;
