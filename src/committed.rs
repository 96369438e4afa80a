//! Post-commit working-copy bookkeeping.
//!
//! After the repository accepted a commit, every committed path's entry
//! needs the new revision, the commit date and author, and whatever
//! property, lock and checksum changes the commit implies. The
//! [`CommitQueue`] collects those updates while the commit runs and applies
//! them once, in queue order, when the revision is known.

use std::cell::RefCell;
use std::rc::Rc;

use chrono::DateTime;

use crate::error::ERR_ENTRY_NOT_FOUND;
use crate::options::QueueItemOptions;
use crate::wc::{Schedule, WcAdmin, WcEntry};
use crate::{Revnum, SvnError, path};

/// Shared handle to the working copy a queued path belongs to.
pub type WcContext = Rc<RefCell<dyn WcAdmin>>;

struct QueuedItem {
    path: String,
    wc: WcContext,
    options: QueueItemOptions,
}

/// A path whose bookkeeping failed during [`CommitQueue::process`].
#[derive(Debug)]
pub struct CommitFailure {
    /// The queued path.
    pub path: String,
    /// Why its entry could not be updated.
    pub error: SvnError,
}

/// Result of [`CommitQueue::process`].
///
/// Failures do not roll back entries that were already updated.
#[derive(Debug, Default)]
pub struct ProcessOutcome {
    /// Queued paths whose entries were updated, in queue order.
    pub processed: Vec<String>,
    /// Queued paths whose update failed.
    pub failures: Vec<CommitFailure>,
}

impl ProcessOutcome {
    /// Returns `true` if every queued path was updated.
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Collects committed paths and finalizes their working-copy entries once.
#[derive(Default)]
pub struct CommitQueue {
    items: Vec<QueuedItem>,
    processed: bool,
}

impl std::fmt::Debug for CommitQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommitQueue")
            .field("paths", &self.items.iter().map(|item| item.path.as_str()).collect::<Vec<_>>())
            .field("processed", &self.processed)
            .finish()
    }
}

impl CommitQueue {
    /// Creates an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of queued paths.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Returns `true` if nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Returns `true` once [`process`](Self::process) has run.
    pub fn is_processed(&self) -> bool {
        self.processed
    }

    fn ensure_open(&self) -> Result<(), SvnError> {
        if self.processed {
            Err(SvnError::Protocol("commit queue already processed".into()))
        } else {
            Ok(())
        }
    }

    /// Queues the bookkeeping for `path` in working copy `wc`.
    ///
    /// Nothing is read or written until [`process`](Self::process).
    pub fn queue(
        &mut self,
        path: &str,
        wc: &WcContext,
        options: QueueItemOptions,
    ) -> Result<(), SvnError> {
        self.ensure_open()?;
        let path = path::validate_rel_dir_path(path)?;
        tracing::trace!(path = %path, recurse = options.recurse, "queued committed path");
        self.items.push(QueuedItem {
            path,
            wc: Rc::clone(wc),
            options,
        });
        Ok(())
    }

    /// Applies the queued updates for revision `revnum`, committed at `date`
    /// (RFC 3339) by `author`.
    ///
    /// Entries are processed in queue order. A failure is logged and
    /// recorded in the outcome; processing continues with the next path.
    /// The queue can be processed only once.
    pub fn process(
        &mut self,
        revnum: Revnum,
        date: &str,
        author: &str,
    ) -> Result<ProcessOutcome, SvnError> {
        self.ensure_open()?;
        if revnum < 0 {
            return Err(SvnError::Protocol(format!(
                "cannot finalize a commit as revision {revnum}"
            )));
        }
        DateTime::parse_from_rfc3339(date)
            .map_err(|err| SvnError::Protocol(format!("invalid commit date '{date}': {err}")))?;
        self.processed = true;

        let mut outcome = ProcessOutcome::default();
        for item in self.items.drain(..) {
            match finalize(&item, revnum, date, author) {
                Ok(()) => outcome.processed.push(item.path),
                Err(error) => {
                    tracing::warn!(
                        path = %item.path,
                        error = %error,
                        "post-commit bookkeeping failed"
                    );
                    outcome.failures.push(CommitFailure { path: item.path, error });
                }
            }
        }
        tracing::debug!(
            revnum,
            processed = outcome.processed.len(),
            failed = outcome.failures.len(),
            "commit queue processed"
        );
        Ok(outcome)
    }
}

fn finalize(item: &QueuedItem, revnum: Revnum, date: &str, author: &str) -> Result<(), SvnError> {
    let mut wc = item
        .wc
        .try_borrow_mut()
        .map_err(|_| SvnError::Protocol("working copy is borrowed elsewhere".into()))?;
    let Some(mut entry) = wc.entry(&item.path)? else {
        return Err(SvnError::engine(
            ERR_ENTRY_NOT_FOUND,
            format!("'{}' is not under version control", item.path),
        ));
    };
    if entry.schedule == Schedule::Delete {
        return wc.remove_entry(&item.path);
    }

    let descendants = if item.options.recurse {
        wc.descendants(&item.path)?
    } else {
        Vec::new()
    };

    stamp(&mut entry, revnum, date, author);
    for change in &item.options.wcprop_changes {
        change.apply_to(&mut entry.wcprops);
    }
    if item.options.remove_lock {
        entry.lock_token = None;
    }
    if item.options.remove_changelist {
        entry.changelist = None;
    }
    if let Some(digest) = item.options.digest {
        entry.checksum = Some(hex::encode(digest));
    }
    wc.set_entry(&item.path, entry)?;

    for below in descendants {
        // Already gone with a deleted parent.
        let Some(mut child) = wc.entry(&below)? else {
            continue;
        };
        if child.schedule == Schedule::Delete {
            wc.remove_entry(&below)?;
            continue;
        }
        stamp(&mut child, revnum, date, author);
        wc.set_entry(&below, child)?;
    }
    Ok(())
}

fn stamp(entry: &mut WcEntry, revnum: Revnum, date: &str, author: &str) {
    entry.revision = revnum;
    entry.schedule = Schedule::Normal;
    entry.cmt_rev = Some(revnum);
    entry.cmt_date = Some(date.to_string());
    entry.cmt_author = Some(author.to_string());
}

/// Finalizes a single committed path.
///
/// Shorthand for a one-entry [`CommitQueue`]; the path's failure, if any,
/// is returned as the error.
pub fn process_committed(
    path: &str,
    wc: &WcContext,
    options: QueueItemOptions,
    revnum: Revnum,
    date: &str,
    author: &str,
) -> Result<(), SvnError> {
    let mut queue = CommitQueue::new();
    queue.queue(path, wc, options)?;
    let outcome = queue.process(revnum, date, author)?;
    match outcome.failures.into_iter().next() {
        Some(failure) => Err(failure.error),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::tree::Tree;
    use crate::txdelta::md5_hex;
    use crate::wc::MemWcAdmin;
    use crate::PropChange;

    const DATE: &str = "2024-05-01T12:00:00.000000Z";

    fn wc() -> (Rc<RefCell<MemWcAdmin>>, WcContext) {
        let mut tree = Tree::new();
        tree.put_file("README", "hello").unwrap();
        tree.put_file("src/lib.rs", "fn x() {}").unwrap();
        tree.put_file("src/old.rs", "").unwrap();
        let admin = Rc::new(RefCell::new(MemWcAdmin::checkout("mem://r", "trunk", 3, &tree)));
        let ctx: WcContext = admin.clone();
        (admin, ctx)
    }

    fn entry(admin: &Rc<RefCell<MemWcAdmin>>, path: &str) -> Option<WcEntry> {
        admin.borrow().entry(path).unwrap()
    }

    #[test]
    fn process_stamps_queued_paths_in_order() {
        let (admin, ctx) = wc();
        {
            let mut wc = admin.borrow_mut();
            let mut readme = wc.entry("README").unwrap().unwrap();
            readme.lock_token = Some("opaquelocktoken:1".into());
            readme.changelist = Some("docs".into());
            wc.set_entry("README", readme).unwrap();
        }

        let mut queue = CommitQueue::new();
        queue
            .queue(
                "README",
                &ctx,
                QueueItemOptions::new()
                    .remove_lock()
                    .remove_changelist()
                    .with_wcprop_changes(vec![PropChange::set("svn:entry:committed-rev", "4")])
                    .with_digest([0u8; 16]),
            )
            .unwrap();
        queue.queue("src", &ctx, QueueItemOptions::new().recurse()).unwrap();
        assert_eq!(queue.len(), 2);

        let outcome = queue.process(4, DATE, "alice").unwrap();
        assert!(outcome.is_complete());
        assert_eq!(outcome.processed, vec!["README".to_string(), "src".to_string()]);

        let readme = entry(&admin, "README").unwrap();
        assert_eq!(readme.revision, 4);
        assert_eq!(readme.cmt_author.as_deref(), Some("alice"));
        assert_eq!(readme.cmt_date.as_deref(), Some(DATE));
        assert_eq!(readme.lock_token, None);
        assert_eq!(readme.changelist, None);
        assert_eq!(readme.checksum.as_deref(), Some("00000000000000000000000000000000"));
        assert_eq!(readme.wcprops.get("svn:entry:committed-rev").unwrap(), b"4");

        assert_eq!(entry(&admin, "src/lib.rs").unwrap().revision, 4);
        assert_eq!(entry(&admin, "").unwrap().revision, 3);
    }

    #[test]
    fn processing_twice_is_refused() {
        let (admin, ctx) = wc();
        let mut queue = CommitQueue::new();
        queue.queue("README", &ctx, QueueItemOptions::new()).unwrap();
        queue.process(4, DATE, "alice").unwrap();

        let err = queue.process(5, DATE, "bob").unwrap_err();
        assert!(matches!(err, SvnError::Protocol(ref msg) if msg.contains("already processed")));
        assert_eq!(entry(&admin, "README").unwrap().revision, 4);
        assert_eq!(entry(&admin, "README").unwrap().cmt_author.as_deref(), Some("alice"));

        let err = queue.queue("src", &ctx, QueueItemOptions::new()).unwrap_err();
        assert!(matches!(err, SvnError::Protocol(_)));
    }

    #[test]
    fn failures_do_not_stop_later_entries() {
        let (admin, ctx) = wc();
        let mut queue = CommitQueue::new();
        queue.queue("missing", &ctx, QueueItemOptions::new()).unwrap();
        queue.queue("README", &ctx, QueueItemOptions::new()).unwrap();
        let outcome = queue.process(4, DATE, "alice").unwrap();
        assert_eq!(outcome.processed, vec!["README".to_string()]);
        assert_eq!(outcome.failures.len(), 1);
        assert_eq!(outcome.failures[0].path, "missing");
        assert_eq!(outcome.failures[0].error.engine_code(), Some(ERR_ENTRY_NOT_FOUND));
        assert_eq!(entry(&admin, "README").unwrap().revision, 4);
    }

    #[test]
    fn deleted_entries_are_removed() {
        let (admin, ctx) = wc();
        {
            let mut wc = admin.borrow_mut();
            let old = WcEntry {
                schedule: Schedule::Delete,
                ..wc.entry("src/old.rs").unwrap().unwrap()
            };
            wc.set_entry("src/old.rs", old).unwrap();
        }
        let mut queue = CommitQueue::new();
        queue.queue("src", &ctx, QueueItemOptions::new().recurse()).unwrap();
        queue.process(4, DATE, "alice").unwrap();
        assert_eq!(entry(&admin, "src/old.rs"), None);
        assert_eq!(entry(&admin, "src").unwrap().revision, 4);
    }

    #[test]
    fn bad_arguments_leave_the_queue_usable() {
        let (_admin, ctx) = wc();
        let mut queue = CommitQueue::new();
        assert!(matches!(
            queue.queue("/abs", &ctx, QueueItemOptions::new()),
            Err(SvnError::InvalidPath(_))
        ));
        queue.queue("README", &ctx, QueueItemOptions::new()).unwrap();
        assert!(queue.process(4, "yesterday", "alice").is_err());
        assert!(queue.process(-1, DATE, "alice").is_err());
        assert!(!queue.is_processed());
        assert!(queue.process(4, DATE, "alice").unwrap().is_complete());
    }

    #[test]
    fn process_committed_reports_the_failure() {
        let (admin, ctx) = wc();
        let digest: [u8; 16] = hex::decode(md5_hex(b"hello")).unwrap().try_into().unwrap();
        let options = QueueItemOptions::new().with_digest(digest);
        process_committed("README", &ctx, options, 7, DATE, "carol").unwrap();
        let readme = entry(&admin, "README").unwrap();
        assert_eq!(readme.revision, 7);
        assert_eq!(readme.checksum, Some(md5_hex(b"hello")));

        let err =
            process_committed("nope", &ctx, QueueItemOptions::new(), 8, DATE, "carol").unwrap_err();
        assert_eq!(err.engine_code(), Some(ERR_ENTRY_NOT_FOUND));
    }
}
