//! Level-dispatched logging.
//!
//! The engine's nine levels (see [`vroot_shared::levels`]) fold onto the
//! five `tracing` levels. Rule files and exec policies name levels as
//! strings; [`log_at`] dispatches a preformatted message at the right
//! tracing level.
//!
//! Three line formats are a stable contract consumed by the external log
//! post-processor and must not be reworded:
//!
//! ```text
//! mapped: <func> '<virtual>' -> '<host>'[ (readonly)]
//! pass: <func> '<virtual>'[ (readonly)]
//! disabled(<why>): <func> '<path>'
//! ```

use vroot_shared::LogLevel;

/// Emit `msg` at the tracing level `level` folds onto.
pub fn log_at(level: LogLevel, msg: &str) {
    match level {
        LogLevel::Error => tracing::error!("{msg}"),
        LogLevel::Warning => tracing::warn!("{msg}"),
        LogLevel::Network | LogLevel::Notice | LogLevel::Info => tracing::info!("{msg}"),
        LogLevel::Debug => tracing::debug!("{msg}"),
        LogLevel::Noise | LogLevel::Noise2 | LogLevel::Noise3 => tracing::trace!("{msg}"),
    }
}

/// The ` (readonly)` / ` (readonly-if-not-root)` suffix for result lines.
pub fn readonly_suffix(flags: u32) -> &'static str {
    use crate::ruletree::fsrule::flags as rf;

    if flags & rf::READONLY_FS_IF_NOT_ROOT != 0 {
        " (readonly-if-not-root)"
    } else if flags & (rf::READONLY | rf::READONLY_FS_ALWAYS) != 0 {
        " (readonly)"
    } else {
        ""
    }
}

/// Log one mapping result in the stable format.
pub fn log_mapping_result(
    level: LogLevel,
    func_name: &str,
    virtual_path: &str,
    host_path: &str,
    flags: u32,
) {
    let readonly = readonly_suffix(flags);
    if virtual_path == host_path {
        log_at(level, &format!("pass: {func_name} '{virtual_path}'{readonly}"));
    } else {
        log_at(
            level,
            &format!("mapped: {func_name} '{virtual_path}' -> '{host_path}'{readonly}"),
        );
    }
}

/// Log a pass-through caused by disabled mapping. `why` is `E` for the
/// environment switch or the reentrancy-counter value.
pub fn log_mapping_disabled(why: &str, func_name: &str, path: &str) {
    tracing::info!("disabled({why}): {func_name} '{path}'");
}
