//! On-disk layout of a session directory.
//!
//! A session lives under `$SBOX_SESSION_DIR`:
//!
//! ```text
//! {root}/
//! ├── ruletree.bin      # memory-mapped rule database
//! ├── proc/             # staged replacements for /proc/self/exe
//! │   └── X.{depth}/    # one tree per path depth
//! ├── union/            # lazily materialized union directories
//! └── vperm.sock        # inode-stat mutation socket served by the daemon
//! ```
//!
//! The daemon creates the directory and writes the rule tree; every
//! sandboxed process opens the same layout read-only (apart from the
//! staging trees, which any process may extend).

use std::path::{Path, PathBuf};

/// Well-known names inside a session directory.
pub mod dirs {
    /// The rule tree file.
    pub const RULE_TREE: &str = "ruletree.bin";

    /// Staging area for synthetic /proc entries.
    pub const PROC: &str = "proc";

    /// Staging area for union directories.
    pub const UNION: &str = "union";

    /// The vperm RPC socket.
    pub const VPERM_SOCKET: &str = "vperm.sock";
}

/// Path layout of one session directory.
#[derive(Clone, Debug)]
pub struct SessionLayout {
    root: PathBuf,
}

impl SessionLayout {
    /// Create a layout rooted at the given session directory.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The session directory itself.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The rule tree file: `{root}/ruletree.bin`.
    pub fn rule_tree_file(&self) -> PathBuf {
        self.root.join(dirs::RULE_TREE)
    }

    /// Root of the /proc staging area: `{root}/proc`.
    pub fn proc_dir(&self) -> PathBuf {
        self.root.join(dirs::PROC)
    }

    /// Staging tree for logical-exe paths with `depth` components:
    /// `{root}/proc/X.{depth}`.
    ///
    /// Keying by depth keeps `readlink()` on the staged symlink returning
    /// exactly the logical path, whatever its length.
    pub fn proc_depth_dir(&self, depth: usize) -> PathBuf {
        self.proc_dir().join(format!("X.{depth}"))
    }

    /// Root of the union-dir staging area: `{root}/union`.
    pub fn union_dir(&self) -> PathBuf {
        self.root.join(dirs::UNION)
    }

    /// The vperm RPC socket: `{root}/vperm.sock`.
    pub fn vperm_socket(&self) -> PathBuf {
        self.root.join(dirs::VPERM_SOCKET)
    }

    /// Create the session directory and its staging subdirectories.
    pub fn prepare(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(self.proc_dir())?;
        std::fs::create_dir_all(self.union_dir())?;
        Ok(())
    }
}
