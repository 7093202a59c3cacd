//! Error reporting hooks for the dictionary.
//!
//! The dictionary has exactly two outward-facing side effects: a fatal
//! report when an insert's probe distance exceeds the hard ceiling (a
//! corruption safety net that never fires on healthy tables), and an
//! internal warning when a structural change happens under a live
//! lightweight cursor whose owner supplied no invalidation flag. Both are
//! routed through this trait so embedders can wire them into their own
//! diagnostics instead of a process-wide sink.

use std::fmt;

/// Receives the dictionary's fatal errors and internal warnings.
pub trait Reporter {
    /// Report an unrecoverable internal error. Implementations must not
    /// return; the table is in no state to continue.
    fn fatal(&self, msg: fmt::Arguments<'_>) -> !;

    /// Report a suspicious-but-survivable condition.
    fn internal_warning(&self, msg: fmt::Arguments<'_>);
}

/// Default [`Reporter`] backed by the `log` crate.
///
/// Fatal errors are logged at `error` level and then panic; warnings go to
/// `warn`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogReporter;

impl Reporter for LogReporter {
    fn fatal(&self, msg: fmt::Arguments<'_>) -> ! {
        log::error!("{msg}");
        panic!("{msg}");
    }

    fn internal_warning(&self, msg: fmt::Arguments<'_>) {
        log::warn!("{msg}");
    }
}
