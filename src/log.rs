//! Revision history walks.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::thread::JoinHandle;

use tokio::sync::mpsc;

use crate::callbacks::Callbacks;
use crate::error::ERR_FS_NOT_FOUND;
use crate::options::{LogOptions, LogRevProps};
use crate::repos::Repository;
use crate::session::BusyGuard;
use crate::{ChangeAction, ChangedPath, LogEntry, NodeKind, Revnum, SvnError, path};

/// A path whose history is being followed, valid up to `upto`.
#[derive(Debug)]
struct Tracked {
    path: String,
    upto: Revnum,
}

type Changes = BTreeMap<String, ChangedPath>;

/// Walks the history of a set of repository paths and yields log entries.
///
/// The walk always runs from the youngest revision of the range down, so
/// that copies can be followed back to their sources. Ascending ranges are
/// collected first and then delivered oldest first.
pub(crate) struct LogWalker {
    repo: Arc<dyn Repository>,
    tracked: Vec<Tracked>,
    next_rev: Revnum,
    oldest: Revnum,
    ascending: Option<VecDeque<(Revnum, Changes)>>,
    limit: u64,
    sent: u64,
    changed_paths: bool,
    revprops: LogRevProps,
    strict_node: bool,
    done: bool,
}

impl std::fmt::Debug for LogWalker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogWalker")
            .field("tracked", &self.tracked)
            .field("next_rev", &self.next_rev)
            .field("oldest", &self.oldest)
            .field("sent", &self.sent)
            .field("done", &self.done)
            .finish_non_exhaustive()
    }
}

impl LogWalker {
    /// Prepares a walk over `targets` (repository paths).
    pub(crate) fn new(
        repo: Arc<dyn Repository>,
        targets: Vec<String>,
        options: &LogOptions,
    ) -> Result<Self, SvnError> {
        let head = repo.latest_revnum()?;
        let start = options.start_rev.unwrap_or(head);
        let end = options.end_rev.unwrap_or(0);
        for rev in [start, end] {
            if !(0..=head).contains(&rev) {
                return Err(SvnError::engine(ERR_FS_NOT_FOUND, format!("no such revision {rev}")));
            }
        }
        let youngest = start.max(end);
        for target in &targets {
            if repo.check_path(target, youngest)? == NodeKind::None {
                return Err(SvnError::engine(
                    ERR_FS_NOT_FOUND,
                    format!("path '{target}' not found in revision {youngest}"),
                ));
            }
        }

        let mut walker = Self {
            repo,
            tracked: targets
                .into_iter()
                .map(|path| Tracked { path, upto: youngest })
                .collect(),
            next_rev: youngest,
            oldest: start.min(end),
            ascending: None,
            limit: options.limit,
            sent: 0,
            changed_paths: options.changed_paths,
            revprops: options.revprops.clone(),
            strict_node: options.strict_node,
            done: false,
        };
        if start < end {
            let mut found = VecDeque::new();
            while let Some(hit) = walker.next_match()? {
                found.push_front(hit);
            }
            walker.ascending = Some(found);
        }
        tracing::debug!(start, end, limit = options.limit, "log walk prepared");
        Ok(walker)
    }

    /// Finds the next (older) revision that touched a tracked path, and
    /// moves tracked paths across copies.
    fn next_match(&mut self) -> Result<Option<(Revnum, Changes)>, SvnError> {
        while !self.tracked.is_empty() && self.next_rev >= self.oldest.max(1) {
            let rev = self.next_rev;
            self.next_rev -= 1;
            let changes = self.repo.changed_paths(rev)?;
            let mut hit = false;
            let mut still_tracked = Vec::with_capacity(self.tracked.len());
            for tracked in std::mem::take(&mut self.tracked) {
                if rev > tracked.upto {
                    still_tracked.push(tracked);
                    continue;
                }
                let touched = changes
                    .keys()
                    .any(|changed| path::is_ancestor(&tracked.path, changed));
                let origin = changes
                    .iter()
                    .filter(|(changed, change)| {
                        path::is_ancestor(changed, &tracked.path)
                            && matches!(change.action, ChangeAction::Added | ChangeAction::Replaced)
                    })
                    .max_by_key(|(changed, _)| changed.len());
                hit |= touched || origin.is_some();
                let Some((changed, change)) = origin else {
                    still_tracked.push(tracked);
                    continue;
                };
                match &change.copy_from {
                    Some(from) if !self.strict_node => {
                        let rest = path::skip_ancestor(changed, &tracked.path).unwrap_or_default();
                        tracing::trace!(
                            path = %tracked.path,
                            rev,
                            from = %from.path,
                            "following copy"
                        );
                        still_tracked.push(Tracked {
                            path: path::join(&from.path, rest),
                            upto: from.rev,
                        });
                    }
                    _ => tracing::trace!(path = %tracked.path, rev, "history ends"),
                }
            }
            self.tracked = still_tracked;
            if hit {
                return Ok(Some((rev, changes)));
            }
        }
        Ok(None)
    }

    fn entry(&self, rev: Revnum, changes: Changes) -> Result<LogEntry, SvnError> {
        let mut rev_props = self.repo.rev_props(rev)?;
        if let LogRevProps::Custom(names) = &self.revprops {
            rev_props.retain(|name, _| names.contains(name));
        }
        Ok(LogEntry {
            rev,
            changed_paths: if self.changed_paths { changes } else { Changes::new() },
            rev_props,
            has_children: false,
        })
    }
}

impl Iterator for LogWalker {
    type Item = Result<LogEntry, SvnError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || (self.limit > 0 && self.sent >= self.limit) {
            self.done = true;
            return None;
        }
        let found = if let Some(queue) = self.ascending.as_mut() {
            Ok(queue.pop_front())
        } else {
            self.next_match()
        };
        match found {
            Ok(Some((rev, changes))) => {
                self.sent += 1;
                Some(self.entry(rev, changes))
            }
            Ok(None) => {
                self.done = true;
                None
            }
            Err(err) => {
                self.done = true;
                Some(Err(err))
            }
        }
    }
}

enum LogMessage {
    Entry(LogEntry),
    Done,
    Failed(SvnError),
}

/// Log entries produced by a background worker thread.
///
/// The worker stays at most the queue capacity ahead of the consumer.
/// `next` blocks the calling thread. Called from inside a tokio runtime it
/// yields a [`SvnError::Protocol`] instead of blocking, and the iterator can
/// be resumed from a blocking thread. Dropping the iterator early stops the
/// worker.
pub struct LogIter {
    rx: mpsc::Receiver<LogMessage>,
    worker: Option<JoinHandle<()>>,
    busy: Option<BusyGuard>,
    finished: bool,
}

impl std::fmt::Debug for LogIter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogIter")
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}

fn run_worker(mut walker: LogWalker, tx: mpsc::Sender<LogMessage>, callbacks: Callbacks) {
    let mut sent = 0u64;
    let last = loop {
        if let Err(err) = callbacks.check_cancel() {
            break LogMessage::Failed(err);
        }
        match walker.next() {
            Some(Ok(entry)) => {
                if tx.blocking_send(LogMessage::Entry(entry)).is_err() {
                    tracing::debug!(sent, "log consumer went away");
                    return;
                }
                sent += 1;
            }
            Some(Err(err)) => break LogMessage::Failed(err),
            None => break LogMessage::Done,
        }
    };
    if tx.blocking_send(last).is_err() {
        tracing::debug!(sent, "log consumer went away before the end");
        return;
    }
    tracing::debug!(sent, "log worker finished");
}

impl LogIter {
    pub(crate) fn spawn(
        walker: LogWalker,
        capacity: usize,
        callbacks: Callbacks,
        busy: BusyGuard,
    ) -> Result<Self, SvnError> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let worker = std::thread::Builder::new()
            .name("svn-log".into())
            .spawn(move || run_worker(walker, tx, callbacks))?;
        Ok(Self {
            rx,
            worker: Some(worker),
            busy: Some(busy),
            finished: false,
        })
    }

    /// Returns `true` once the last entry (or error) has been delivered.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    fn finish(&mut self) {
        self.finished = true;
        self.busy = None;
        if let Some(worker) = self.worker.take()
            && worker.join().is_err()
        {
            tracing::warn!("log worker panicked");
        }
    }
}

impl Iterator for LogIter {
    type Item = Result<LogEntry, SvnError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        if tokio::runtime::Handle::try_current().is_ok() {
            return Some(Err(SvnError::Protocol(
                "log iterator cannot block inside an async runtime".into(),
            )));
        }
        match self.rx.blocking_recv() {
            Some(LogMessage::Entry(entry)) => Some(Ok(entry)),
            Some(LogMessage::Done) => {
                self.finish();
                None
            }
            Some(LogMessage::Failed(err)) => {
                self.finish();
                Some(Err(err))
            }
            None => {
                self.finish();
                Some(Err(SvnError::Protocol("log worker stopped without finishing".into())))
            }
        }
    }
}

impl Drop for LogIter {
    fn drop(&mut self) {
        if !self.finished {
            tracing::debug!("log iterator dropped before the end");
            self.rx.close();
        }
    }
}
