//! Watch control port
//!
//! The sync manager suspends local change notifications while a full
//! reconciliation runs, so that files it downloads are not echoed back as
//! local changes.

/// Pause/resume handle for the local watch source
///
/// Calls are reference counted: every `pause()` must be matched by exactly
/// one `resume()`, and notifications flow again only when the count returns
/// to zero.
pub trait IWatchControl: Send + Sync {
    fn pause(&self);
    fn resume(&self);
}
