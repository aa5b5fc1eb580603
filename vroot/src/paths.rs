//! Path component lists.
//!
//! Every path that flows through the mapping engine is handled as a
//! [`PathList`]: an ordered vector of components plus `absolute` /
//! `trailing_slash` flags. Components remember what the resolver has
//! learned about them (symlink or not, and the link target), so repeated
//! walks over the same prefix don't readlink twice.
//!
//! Splitting drops empty components (doubled slashes); joining emits a
//! leading `/` iff absolute and a trailing `/` iff the flag is set.
//! Removing `.` components may set the trailing-slash flag (a path
//! ending in `/.` names the directory itself, same as a trailing slash).
//! `..` removal is not a lexical operation — it needs the resolver and
//! lives in [`crate::mapping::resolution`].

use std::fmt;

/// What is known about one component's symlink status.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum LinkState {
    /// Not yet checked against the host filesystem.
    #[default]
    Unknown,
    /// readlink() said this is not a symlink.
    NotSymlink,
    /// A symlink; the textual link target is cached.
    Symlink(String),
}

/// One path component.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Component {
    pub name: String,
    pub link: LinkState,
}

impl Component {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            link: LinkState::Unknown,
        }
    }

    pub fn is_dot(&self) -> bool {
        self.name == "."
    }

    pub fn is_dotdot(&self) -> bool {
        self.name == ".."
    }

    pub fn known_not_symlink(&self) -> bool {
        self.link == LinkState::NotSymlink
    }
}

/// Lexical cleanliness of a path (`is-clean` of the spec).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Cleanliness {
    Clean,
    /// Contains `.` components only; trivially cleanable.
    HasDots,
    /// Contains `..`; cleanup may require path resolution.
    HasDotDots,
}

/// An ordered list of path components with path-level flags.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PathList {
    components: Vec<Component>,
    pub absolute: bool,
    pub trailing_slash: bool,
    /// Set when the list holds a host path; `..` cleanup then uses
    /// realpath() instead of recursing through the mapper.
    pub host_path: bool,
}

impl PathList {
    /// Split a path string into components. Empty components from doubled
    /// slashes are dropped; a trailing slash only sets the flag.
    pub fn split(path: &str) -> Self {
        let absolute = path.starts_with('/');
        let mut trailing_slash = false;
        let mut components = Vec::new();

        for (i, part) in path.split('/').enumerate() {
            if part.is_empty() {
                // leading slash handled by `absolute`; an empty last part
                // is the trailing slash; doubled slashes are dropped.
                if i > 0 && components.len() + (absolute as usize) > 0 {
                    trailing_slash = true;
                }
                continue;
            }
            trailing_slash = false;
            components.push(Component::new(part));
        }
        // "//" and "/" have no components; they are "/" with no trailing flag
        if components.is_empty() {
            trailing_slash = false;
        }

        Self {
            components,
            absolute,
            trailing_slash,
            host_path: false,
        }
    }

    pub fn len(&self) -> usize {
        self.components.len()
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }

    pub fn components(&self) -> &[Component] {
        &self.components
    }

    pub fn components_mut(&mut self) -> &mut [Component] {
        &mut self.components
    }

    pub fn push(&mut self, c: Component) {
        self.components.push(c);
    }

    pub fn remove(&mut self, idx: usize) -> Component {
        self.components.remove(idx)
    }

    /// Lexical check for `.` / `..` components.
    pub fn cleanliness(&self) -> Cleanliness {
        let mut found_dot = false;
        for c in &self.components {
            if c.is_dotdot() {
                return Cleanliness::HasDotDots;
            }
            if c.is_dot() {
                found_dot = true;
            }
        }
        if found_dot {
            Cleanliness::HasDots
        } else {
            Cleanliness::Clean
        }
    }

    /// Strip every `.` component. If the last original component was a
    /// dot, the path keeps naming the directory: set the trailing slash.
    pub fn remove_dots(&mut self) {
        if self.components.last().is_some_and(Component::is_dot) {
            self.trailing_slash = true;
        }
        self.components.retain(|c| !c.is_dot());
    }

    /// Render the components `[0..=last]` as an absolute path string.
    /// Used by the resolver to map prefixes one component at a time.
    pub fn prefix_string(&self, last: usize) -> String {
        let mut buf = String::new();
        if self.absolute {
            buf.push('/');
        }
        for (i, c) in self.components.iter().take(last + 1).enumerate() {
            if i > 0 {
                buf.push('/');
            }
            buf.push_str(&c.name);
        }
        if buf.is_empty() {
            buf.push('/');
        }
        buf
    }

    /// Clone the components `[0..len]` into a new list carrying the same
    /// flags (minus the trailing slash, which belongs to the last
    /// component of the full path only).
    pub fn prefix_list(&self, len: usize) -> PathList {
        PathList {
            components: self.components[..len].to_vec(),
            absolute: self.absolute,
            trailing_slash: false,
            host_path: self.host_path,
        }
    }

    /// Remove components `[0..prefix_len]` and splice `new_prefix`'s
    /// components in their place. Flags of `self` stay, except that
    /// absoluteness follows the new prefix.
    pub fn replace_prefix(&mut self, prefix_len: usize, new_prefix: PathList) {
        let tail = self.components.split_off(prefix_len);
        self.components = new_prefix.components;
        self.components.extend(tail);
        self.absolute = new_prefix.absolute;
    }

    /// Append all components of `other`.
    pub fn append(&mut self, other: PathList) {
        self.components.extend(other.components);
    }

    /// Mark every component as known-not-symlink (e.g. after the list was
    /// produced by realpath or the resolver).
    pub fn mark_all_not_symlink(&mut self) {
        for c in &mut self.components {
            c.link = LinkState::NotSymlink;
        }
    }
}

impl fmt::Display for PathList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.components.is_empty() {
            // "/." and "/" both end up here
            return if self.absolute { write!(f, "/") } else { Ok(()) };
        }
        if self.absolute {
            write!(f, "/")?;
        }
        for (i, c) in self.components.iter().enumerate() {
            if i > 0 {
                write!(f, "/")?;
            }
            write!(f, "{}", c.name)?;
        }
        if self.trailing_slash {
            write!(f, "/")?;
        }
        Ok(())
    }
}

/// The basename of a path string ("" stays "", no trailing-slash games).
pub fn basename(path: &str) -> &str {
    match path.rfind('/') {
        Some(idx) => &path[idx + 1..],
        None => path,
    }
}

/// The directory part of an absolute path string ("/" for top-level names).
pub fn dirname(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) => "/",
        Some(idx) => &path[..idx],
        None => ".",
    }
}
