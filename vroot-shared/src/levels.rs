//! Engine log levels.
//!
//! The engine distinguishes nine levels; rule files refer to them by
//! name (e.g. an exec policy's `log_level` field). They are folded onto
//! `tracing`'s five levels for emission, but the numeric ordering is part
//! of the engine's configuration surface and is kept as-is.

/// Log levels, ordered from most to least severe.
///
/// The discriminants match the engine's historical numbering; the gaps
/// are intentional.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u32)]
pub enum LogLevel {
    Error = 1,
    Warning = 2,
    /// Network rule decisions.
    Network = 3,
    Notice = 4,
    Info = 5,
    Debug = 8,
    /// Per-component tracing of the path resolver.
    Noise = 9,
    Noise2 = 10,
    Noise3 = 11,
}

impl LogLevel {
    /// Parse a level name as used in rule files. Case-insensitive.
    pub fn from_name(name: &str) -> Option<Self> {
        let level = match name.to_ascii_lowercase().as_str() {
            "error" => Self::Error,
            "warning" => Self::Warning,
            "net" | "network" => Self::Network,
            "notice" => Self::Notice,
            "info" => Self::Info,
            "debug" => Self::Debug,
            "noise" => Self::Noise,
            "noise2" => Self::Noise2,
            "noise3" => Self::Noise3,
            _ => return None,
        };
        Some(level)
    }

    /// The canonical name of this level.
    pub fn name(self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Warning => "warning",
            Self::Network => "network",
            Self::Notice => "notice",
            Self::Info => "info",
            Self::Debug => "debug",
            Self::Noise => "noise",
            Self::Noise2 => "noise2",
            Self::Noise3 => "noise3",
        }
    }

    /// The `tracing` level this folds onto.
    pub fn tracing_level(self) -> tracing::Level {
        match self {
            Self::Error => tracing::Level::ERROR,
            Self::Warning => tracing::Level::WARN,
            Self::Network | Self::Notice | Self::Info => tracing::Level::INFO,
            Self::Debug => tracing::Level::DEBUG,
            Self::Noise | Self::Noise2 | Self::Noise3 => tracing::Level::TRACE,
        }
    }
}
