//! Builder-style option types for session operations and delta encoding.

use crate::svndiff::SvndiffVersion;
use crate::{Depth, PropChange, PropertyList, Revnum};

/// Default number of target bytes covered by one generated delta window.
pub const DELTA_WINDOW_SIZE: usize = 102_400;

#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, Debug, PartialEq, Eq)]
/// How text deltas are generated and encoded for transport.
pub struct SvndiffOptions {
    /// svndiff format version to emit.
    pub version: SvndiffVersion,
    /// zlib level for svndiff1 (`0..=9`).
    pub zlib_level: u32,
    /// Maximum target bytes per generated window.
    pub window_size: usize,
}

impl Default for SvndiffOptions {
    fn default() -> Self {
        Self {
            version: SvndiffVersion::V0,
            zlib_level: 5,
            window_size: DELTA_WINDOW_SIZE,
        }
    }
}

impl SvndiffOptions {
    /// Sets the svndiff version.
    #[must_use]
    pub fn with_version(mut self, version: SvndiffVersion) -> Self {
        self.version = version;
        self
    }

    /// Sets the zlib level used by svndiff1.
    #[must_use]
    pub fn with_zlib_level(mut self, zlib_level: u32) -> Self {
        self.zlib_level = zlib_level;
        self
    }

    /// Sets the window size used by delta generation (at least one byte).
    #[must_use]
    pub fn with_window_size(mut self, window_size: usize) -> Self {
        self.window_size = window_size.max(1);
        self
    }
}

#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, Debug, PartialEq, Eq)]
/// Options for [`crate::RaSession::do_update`].
pub struct UpdateOptions {
    /// Update target, relative to the session anchor (`""` for the anchor).
    pub target: String,
    /// Revision to update to; `None` means HEAD.
    pub rev: Option<Revnum>,
    /// Update depth.
    pub depth: Depth,
    /// Whether added nodes carry copy-from information.
    pub send_copyfrom_args: bool,
    /// Whether to treat unrelated nodes at the same path as replacements.
    pub ignore_ancestry: bool,
}

impl UpdateOptions {
    /// Creates update options for a target at a given depth.
    pub fn new(target: impl Into<String>, depth: Depth) -> Self {
        Self {
            target: target.into(),
            rev: None,
            depth,
            send_copyfrom_args: true,
            ignore_ancestry: false,
        }
    }

    /// Sets the revision to update to.
    #[must_use]
    pub fn with_rev(mut self, rev: Revnum) -> Self {
        self.rev = Some(rev);
        self
    }

    /// Sends plain adds instead of copy-based adds.
    #[must_use]
    pub fn without_copyfrom_args(mut self) -> Self {
        self.send_copyfrom_args = false;
        self
    }

    /// Ignores node ancestry when comparing.
    #[must_use]
    pub fn ignore_ancestry(mut self) -> Self {
        self.ignore_ancestry = true;
        self
    }
}

#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, Debug, PartialEq, Eq)]
/// Options for [`crate::RaSession::do_switch`].
pub struct SwitchOptions {
    /// Switch target, relative to the session anchor.
    pub target: String,
    /// Repository path the target is switched to.
    pub switch_path: String,
    /// Revision to switch to; `None` means HEAD.
    pub rev: Option<Revnum>,
    /// Switch depth.
    pub depth: Depth,
    /// Whether added nodes carry copy-from information.
    pub send_copyfrom_args: bool,
    /// Whether to treat unrelated nodes at the same path as replacements.
    pub ignore_ancestry: bool,
}

impl SwitchOptions {
    /// Creates switch options.
    pub fn new(target: impl Into<String>, switch_path: impl Into<String>, depth: Depth) -> Self {
        Self {
            target: target.into(),
            switch_path: switch_path.into(),
            rev: None,
            depth,
            send_copyfrom_args: true,
            ignore_ancestry: false,
        }
    }

    /// Sets the revision to switch to.
    #[must_use]
    pub fn with_rev(mut self, rev: Revnum) -> Self {
        self.rev = Some(rev);
        self
    }

    /// Sends plain adds instead of copy-based adds.
    #[must_use]
    pub fn without_copyfrom_args(mut self) -> Self {
        self.send_copyfrom_args = false;
        self
    }

    /// Ignores node ancestry when comparing.
    #[must_use]
    pub fn ignore_ancestry(mut self) -> Self {
        self.ignore_ancestry = true;
        self
    }
}

#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, Debug, PartialEq, Eq)]
/// Options for [`crate::RaSession::do_status`].
pub struct StatusOptions {
    /// Status target, relative to the session anchor.
    pub target: String,
    /// Revision to compare against; `None` means HEAD.
    pub rev: Option<Revnum>,
    /// Status depth.
    pub depth: Depth,
}

impl StatusOptions {
    /// Creates status options for a target at a given depth.
    pub fn new(target: impl Into<String>, depth: Depth) -> Self {
        Self {
            target: target.into(),
            rev: None,
            depth,
        }
    }

    /// Sets the revision to compare against.
    #[must_use]
    pub fn with_rev(mut self, rev: Revnum) -> Self {
        self.rev = Some(rev);
        self
    }
}

#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, Debug, PartialEq, Eq)]
/// Options for [`crate::RaSession::replay`].
pub struct ReplayOptions {
    /// Revision to replay.
    pub revision: Revnum,
    /// Paths below this revision are sent as full adds.
    pub low_water_mark: Revnum,
    /// Whether to send text deltas.
    pub send_deltas: bool,
}

impl ReplayOptions {
    /// Creates replay options for a revision.
    pub fn new(revision: Revnum) -> Self {
        Self {
            revision,
            low_water_mark: 0,
            send_deltas: true,
        }
    }

    /// Sets the low-water mark.
    #[must_use]
    pub fn with_low_water_mark(mut self, low_water_mark: Revnum) -> Self {
        self.low_water_mark = low_water_mark;
        self
    }

    /// Sets whether text deltas are sent.
    #[must_use]
    pub fn with_send_deltas(mut self, send_deltas: bool) -> Self {
        self.send_deltas = send_deltas;
        self
    }
}

#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, Debug, PartialEq, Eq)]
/// Which revision properties to request for `log` operations.
pub enum LogRevProps {
    /// Request all revision properties.
    All,
    /// Request only a specific set of revision property names.
    Custom(Vec<String>),
}

#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, Debug, PartialEq, Eq)]
/// Options for [`crate::RaSession::log`] and [`crate::RaSession::log_iter`].
pub struct LogOptions {
    /// Target paths, relative to the session anchor. Empty means the anchor itself.
    pub target_paths: Vec<String>,
    /// Start revision (inclusive). `None` means HEAD.
    pub start_rev: Option<Revnum>,
    /// End revision (inclusive). `None` means revision 0.
    pub end_rev: Option<Revnum>,
    /// Whether to include changed paths in each log entry.
    pub changed_paths: bool,
    /// Whether to stop at copies instead of following history across them.
    pub strict_node: bool,
    /// Maximum number of entries to return (`0` means unlimited).
    pub limit: u64,
    /// Which revision properties to request.
    pub revprops: LogRevProps,
    /// Capacity of the queue between the log worker and its consumer.
    pub queue_capacity: usize,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            target_paths: Vec::new(),
            start_rev: None,
            end_rev: None,
            changed_paths: true,
            strict_node: false,
            limit: 0,
            revprops: LogRevProps::All,
            queue_capacity: 16,
        }
    }
}

impl LogOptions {
    /// Convenience constructor for a revision range.
    pub fn between(start_rev: Revnum, end_rev: Revnum) -> Self {
        Self {
            start_rev: Some(start_rev),
            end_rev: Some(end_rev),
            ..Self::default()
        }
    }

    /// Restricts the log to the given paths.
    #[must_use]
    pub fn with_target_paths(mut self, target_paths: Vec<String>) -> Self {
        self.target_paths = target_paths;
        self
    }

    /// Limits the number of entries.
    #[must_use]
    pub fn with_limit(mut self, limit: u64) -> Self {
        self.limit = limit;
        self
    }

    /// Stops at copies.
    #[must_use]
    pub fn strict_node(mut self) -> Self {
        self.strict_node = true;
        self
    }

    /// Omits changed paths from entries.
    #[must_use]
    pub fn without_changed_paths(mut self) -> Self {
        self.changed_paths = false;
        self
    }

    /// Selects which revision properties are returned.
    #[must_use]
    pub fn with_revprops(mut self, revprops: LogRevProps) -> Self {
        self.revprops = revprops;
        self
    }

    /// Sets the worker queue capacity (at least one entry).
    #[must_use]
    pub fn with_queue_capacity(mut self, queue_capacity: usize) -> Self {
        self.queue_capacity = queue_capacity.max(1);
        self
    }
}

#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, Debug, Default, PartialEq, Eq)]
/// Options for [`crate::RaSession::lock`].
pub struct LockOptions {
    /// Optional lock comment.
    pub comment: Option<String>,
    /// Whether to steal an existing lock.
    pub steal_lock: bool,
    /// The caller's revision of the path; locking fails if the path changed
    /// after it.
    pub current_rev: Option<Revnum>,
}

impl LockOptions {
    /// Creates default lock options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the lock comment.
    #[must_use]
    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }

    /// Steals an existing lock.
    #[must_use]
    pub fn steal_lock(mut self) -> Self {
        self.steal_lock = true;
        self
    }

    /// Sets the out-of-date check revision.
    #[must_use]
    pub fn with_current_rev(mut self, current_rev: Revnum) -> Self {
        self.current_rev = Some(current_rev);
        self
    }
}

#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, Debug, Default, PartialEq, Eq)]
/// Options for [`crate::RaSession::unlock`].
pub struct UnlockOptions {
    /// Lock token to release.
    pub token: Option<String>,
    /// Whether to break a lock held by someone else.
    pub break_lock: bool,
}

impl UnlockOptions {
    /// Creates default unlock options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the lock token.
    #[must_use]
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Breaks the lock regardless of owner.
    #[must_use]
    pub fn break_lock(mut self) -> Self {
        self.break_lock = true;
        self
    }
}

#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, Debug, PartialEq, Eq)]
/// A lock token to present during commit.
pub struct CommitLockToken {
    /// Path relative to the session anchor.
    pub path: String,
    /// Lock token.
    pub token: String,
}

impl CommitLockToken {
    /// Creates a lock token entry.
    pub fn new(path: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            token: token.into(),
        }
    }
}

#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, Debug, PartialEq, Eq)]
/// Options for [`crate::RaSession::commit_editor`].
pub struct CommitOptions {
    /// Commit log message.
    pub log_message: String,
    /// Lock tokens to present for locked paths.
    pub lock_tokens: Vec<CommitLockToken>,
    /// Whether to keep the presented locks after commit.
    pub keep_locks: bool,
    /// Additional revision properties.
    pub rev_props: PropertyList,
}

impl CommitOptions {
    /// Creates commit options with a log message.
    pub fn new(log_message: impl Into<String>) -> Self {
        Self {
            log_message: log_message.into(),
            lock_tokens: Vec::new(),
            keep_locks: false,
            rev_props: PropertyList::new(),
        }
    }

    /// Sets lock tokens.
    #[must_use]
    pub fn with_lock_tokens(mut self, lock_tokens: Vec<CommitLockToken>) -> Self {
        self.lock_tokens = lock_tokens;
        self
    }

    /// Keeps locks after commit.
    #[must_use]
    pub fn keep_locks(mut self) -> Self {
        self.keep_locks = true;
        self
    }

    /// Sets additional revision properties.
    #[must_use]
    pub fn with_rev_props(mut self, rev_props: PropertyList) -> Self {
        self.rev_props = rev_props;
        self
    }
}

#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, Debug, Default, PartialEq, Eq)]
/// Post-commit bookkeeping for one path on a [`crate::CommitQueue`].
pub struct QueueItemOptions {
    /// Also bump every entry below the path.
    pub recurse: bool,
    /// Working-copy property changes to apply to the path's entry.
    pub wcprop_changes: Vec<PropChange>,
    /// Forget the path's lock token.
    pub remove_lock: bool,
    /// Take the path out of its changelist.
    pub remove_changelist: bool,
    /// MD5 digest of the committed text (files).
    pub digest: Option<[u8; 16]>,
}

impl QueueItemOptions {
    /// Creates options that only bump the path's revision.
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies the update to descendants as well.
    #[must_use]
    pub fn recurse(mut self) -> Self {
        self.recurse = true;
        self
    }

    /// Sets working-copy property changes.
    #[must_use]
    pub fn with_wcprop_changes(mut self, wcprop_changes: Vec<PropChange>) -> Self {
        self.wcprop_changes = wcprop_changes;
        self
    }

    /// Removes the lock token.
    #[must_use]
    pub fn remove_lock(mut self) -> Self {
        self.remove_lock = true;
        self
    }

    /// Removes the changelist.
    #[must_use]
    pub fn remove_changelist(mut self) -> Self {
        self.remove_changelist = true;
        self
    }

    /// Records the committed text's MD5 digest.
    #[must_use]
    pub fn with_digest(mut self, digest: [u8; 16]) -> Self {
        self.digest = Some(digest);
        self
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn svndiff_options_default_to_v0_and_standard_window() {
        let opts = SvndiffOptions::default();
        assert_eq!(opts.version, SvndiffVersion::V0);
        assert_eq!(opts.zlib_level, 5);
        assert_eq!(opts.window_size, DELTA_WINDOW_SIZE);
        assert_eq!(opts.with_window_size(0).window_size, 1);
    }

    #[test]
    fn log_options_between_keeps_defaults() {
        let opts = LogOptions::between(5, 1).with_limit(2).strict_node();
        assert_eq!(opts.start_rev, Some(5));
        assert_eq!(opts.end_rev, Some(1));
        assert_eq!(opts.limit, 2);
        assert!(opts.strict_node);
        assert!(opts.changed_paths);
        assert_eq!(opts.revprops, LogRevProps::All);
    }

    #[test]
    fn update_options_builders() {
        let opts = UpdateOptions::new("trunk", Depth::Files)
            .with_rev(3)
            .without_copyfrom_args();
        assert_eq!(opts.rev, Some(3));
        assert!(!opts.send_copyfrom_args);
        assert_eq!(opts.depth, Depth::Files);
    }
}
