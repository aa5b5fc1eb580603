//! Definitions shared between the vroot engine, the `vroot-show` CLI and
//! the session daemon: the on-disk layout of a session directory, the
//! environment-variable contract, and the engine's log levels.
//!
//! This crate exists so the daemon (which builds the rule tree and serves
//! inode-stat mutations) and the engine (which only reads the tree) agree
//! on names without depending on each other.

pub mod env;
pub mod layout;
pub mod levels;

pub use layout::SessionLayout;
pub use levels::LogLevel;
