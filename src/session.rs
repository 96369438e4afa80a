//! Repository access sessions.
//!
//! An [`RaSession`] is one logical connection to a [`Repository`]. The
//! connection runs one operation at a time: starting an operation sets the
//! session's busy flag and fails with [`SvnError::Busy`] if it is already
//! set. Operations that hand back a handle ([`Reporter`], commit
//! [`Editor`], [`LogIter`]) keep the flag until that handle is finished,
//! aborted or dropped.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::callbacks::Callbacks;
use crate::editor::{BatonId, Editor, EditorSink};
use crate::error::{
    ERR_FS_NOT_FOUND, ERR_FS_TXN_OUT_OF_DATE, ERR_NODE_UNEXPECTED_KIND, ERR_RA_NOT_AUTHORIZED,
};
use crate::log::{LogIter, LogWalker};
use crate::options::{
    CommitOptions, LockOptions, LogOptions, LogRevProps, ReplayOptions, StatusOptions,
    SwitchOptions, UnlockOptions, UpdateOptions,
};
use crate::repos::{CopyMap, Repository, Transaction, node_in};
use crate::reporter::{Report, ReportCommand, ReportSink, Reporter};
use crate::tree::{DriveOptions, Node, Tree, TreeEditor, drive_tree_delta};
use crate::window::DeltaWindow;
use crate::{
    Capability, ChangeAction, CommitInfo, CopyFrom, Depth, Lock, LogEntry, NodeKind,
    PROP_REVISION_AUTHOR, PROP_REVISION_LOG, Revnum, SvnError, normalize_revnum, path,
};

/// Holds a session's busy flag; clears it when dropped.
#[derive(Debug)]
pub(crate) struct BusyGuard {
    flag: Arc<AtomicBool>,
    op: &'static str,
}

impl BusyGuard {
    fn try_acquire(flag: &Arc<AtomicBool>, op: &'static str) -> Result<Self, SvnError> {
        match flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => {
                tracing::trace!(op, "session acquired");
                Ok(Self {
                    flag: Arc::clone(flag),
                    op,
                })
            }
            Err(_) => {
                tracing::debug!(op, "session busy");
                Err(SvnError::Busy(op))
            }
        }
    }
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
        tracing::trace!(op = self.op, "session released");
    }
}

/// A session against one repository, anchored at a repository path.
///
/// Paths passed to session operations are relative to the anchor. Paths in
/// results ([`Lock::path`], changed paths, locations) are repository paths.
pub struct RaSession {
    repo: Arc<dyn Repository>,
    anchor: String,
    capabilities: BTreeSet<Capability>,
    busy: Arc<AtomicBool>,
    username: Option<String>,
    callbacks: Callbacks,
}

impl std::fmt::Debug for RaSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RaSession")
            .field("uuid", &self.repo.uuid())
            .field("anchor", &self.anchor)
            .field("capabilities", &self.capabilities)
            .field("busy", &self.is_busy())
            .field("username", &self.username)
            .finish()
    }
}

impl RaSession {
    /// Opens a session on `repo` anchored at `anchor`, which must be a
    /// directory in HEAD. Capabilities are read once, here.
    pub fn open(repo: Arc<dyn Repository>, anchor: &str) -> Result<Self, SvnError> {
        let anchor = path::validate_rel_dir_path(anchor)?;
        let head = repo.latest_revnum()?;
        match repo.check_path(&anchor, head)? {
            NodeKind::Dir => {}
            NodeKind::None => {
                return Err(SvnError::engine(
                    ERR_FS_NOT_FOUND,
                    format!("session anchor '{anchor}' not found in r{head}"),
                ));
            }
            kind => {
                return Err(SvnError::engine(
                    ERR_NODE_UNEXPECTED_KIND,
                    format!("session anchor '{anchor}' is a {kind}"),
                ));
            }
        }
        let capabilities = repo.capabilities();
        tracing::debug!(
            uuid = repo.uuid(),
            anchor = %anchor,
            capabilities = ?capabilities.iter().map(|cap| cap.as_wire_word()).collect::<Vec<_>>(),
            "session opened"
        );
        Ok(Self {
            repo,
            anchor,
            capabilities,
            busy: Arc::new(AtomicBool::new(false)),
            username: None,
            callbacks: Callbacks::default(),
        })
    }

    /// Sets the user operations run as (commit author, lock owner).
    #[must_use]
    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    /// Sets the hooks handed to every edit this session drives.
    #[must_use]
    pub fn with_callbacks(mut self, callbacks: Callbacks) -> Self {
        self.callbacks = callbacks;
        self
    }

    /// The repository path this session is anchored at.
    pub fn anchor(&self) -> &str {
        &self.anchor
    }

    /// The repository UUID.
    pub fn uuid(&self) -> &str {
        self.repo.uuid()
    }

    /// The repository root URL.
    pub fn repos_root_url(&self) -> &str {
        self.repo.root_url()
    }

    /// The user operations run as.
    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    /// Capabilities negotiated when the session was opened.
    pub fn capabilities(&self) -> &BTreeSet<Capability> {
        &self.capabilities
    }

    /// Returns `true` if the engine announced `capability`.
    pub fn has_capability(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }

    /// Returns `true` while an operation occupies the session.
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    fn require(&self, capability: Capability) -> Result<(), SvnError> {
        if self.has_capability(capability) {
            Ok(())
        } else {
            Err(SvnError::UnsupportedCapability(capability))
        }
    }

    fn acquire(&self, op: &'static str) -> Result<BusyGuard, SvnError> {
        BusyGuard::try_acquire(&self.busy, op)
    }

    fn repo_path(&self, rel: &str) -> Result<String, SvnError> {
        let rel = path::validate_rel_dir_path(rel)?;
        Ok(path::join(&self.anchor, &rel))
    }

    fn resolve_rev(&self, rev: Option<Revnum>) -> Result<Revnum, SvnError> {
        let head = self.repo.latest_revnum()?;
        match normalize_revnum(rev) {
            None => Ok(head),
            Some(rev) if rev <= head => Ok(rev),
            Some(rev) => Err(SvnError::engine(ERR_FS_NOT_FOUND, format!("no such revision {rev}"))),
        }
    }

    /// Returns the youngest revision.
    pub fn latest_revnum(&self) -> Result<Revnum, SvnError> {
        let _busy = self.acquire("get-latest-rev")?;
        self.repo.latest_revnum()
    }

    /// Returns the kind of `path` in `rev` (HEAD if `None`).
    pub fn check_path(&self, path: &str, rev: Option<Revnum>) -> Result<NodeKind, SvnError> {
        let _busy = self.acquire("check-path")?;
        let full = self.repo_path(path)?;
        let rev = self.resolve_rev(rev)?;
        self.repo.check_path(&full, rev)
    }

    fn report_driver<'a>(
        &self,
        request: ReportRequest<'_>,
        sink: Box<dyn EditorSink + 'a>,
    ) -> Result<Reporter<'a>, SvnError> {
        let busy = self.acquire(request.op)?;
        let target = path::validate_rel_dir_path(request.target)?;
        let source = match request.source {
            Some(source) => path::validate_rel_dir_path(source)?,
            None => path::join(&self.anchor, &target),
        };
        if request.depth != Depth::Infinity {
            self.require(Capability::Depth)?;
        }
        let rev = self.resolve_rev(request.rev)?;
        let driver = ReportDriver {
            op: request.op,
            repo: Arc::clone(&self.repo),
            anchor: self.anchor.clone(),
            capabilities: self.capabilities.clone(),
            callbacks: self.callbacks.clone(),
            target,
            source,
            rev,
            depth: request.depth,
            send_copyfrom_args: request.send_copyfrom_args,
            send_deltas: request.send_deltas,
            report: Report::new(),
            sink: Some(sink),
        };
        tracing::debug!(op = request.op, rev, target = %driver.target, "report started");
        Ok(Reporter::from_parts(Box::new(driver), Some(busy)))
    }

    /// Starts an update: describe the working copy through the returned
    /// [`Reporter`]; `finish` then drives `sink` with the changes that bring
    /// it to the requested revision.
    pub fn do_update<'a>(
        &self,
        options: &UpdateOptions,
        sink: impl EditorSink + 'a,
    ) -> Result<Reporter<'a>, SvnError> {
        let request = ReportRequest {
            op: "update",
            target: &options.target,
            source: None,
            rev: options.rev,
            depth: options.depth,
            send_copyfrom_args: options.send_copyfrom_args,
            send_deltas: true,
        };
        self.report_driver(request, Box::new(sink))
    }

    /// Starts a switch of the target to `options.switch_path`.
    pub fn do_switch<'a>(
        &self,
        options: &SwitchOptions,
        sink: impl EditorSink + 'a,
    ) -> Result<Reporter<'a>, SvnError> {
        let request = ReportRequest {
            op: "switch",
            target: &options.target,
            source: Some(&options.switch_path),
            rev: options.rev,
            depth: options.depth,
            send_copyfrom_args: options.send_copyfrom_args,
            send_deltas: true,
        };
        self.report_driver(request, Box::new(sink))
    }

    /// Starts a status check: like an update, but files carry empty text
    /// deltas, so the consumer learns what changed and not how.
    pub fn do_status<'a>(
        &self,
        options: &StatusOptions,
        sink: impl EditorSink + 'a,
    ) -> Result<Reporter<'a>, SvnError> {
        let request = ReportRequest {
            op: "status",
            target: &options.target,
            source: None,
            rev: options.rev,
            depth: options.depth,
            send_copyfrom_args: false,
            send_deltas: false,
        };
        self.report_driver(request, Box::new(sink))
    }

    /// Drives `sink` with the changes revision `options.revision` made below
    /// the anchor.
    ///
    /// Copies from revisions older than the low-water mark are sent as plain
    /// adds.
    pub fn replay(&self, options: &ReplayOptions, sink: impl EditorSink) -> Result<(), SvnError> {
        let _busy = self.acquire("replay")?;
        if options.low_water_mark > 0 {
            self.require(Capability::PartialReplay)?;
        }
        let rev = self.resolve_rev(Some(options.revision))?;
        let anchored = |rev: Revnum| -> Result<Tree, SvnError> {
            Ok(self.repo.tree_at(rev)?.subtree(&self.anchor).unwrap_or_default())
        };
        let before = if rev > 0 { anchored(rev - 1)? } else { Tree::new() };
        let after = anchored(rev)?;

        let mut copies = CopyMap::new();
        for (changed, change) in self.repo.changed_paths(rev)? {
            let (Some(rel), Some(from)) =
                (path::skip_ancestor(&self.anchor, &changed), change.copy_from)
            else {
                continue;
            };
            if rel.is_empty() || from.rev < options.low_water_mark {
                continue;
            }
            let node = self.repo.copy_source(&from)?;
            copies.insert(rel.to_string(), (from, node));
        }

        let mut drive = DriveOptions::new()
            .with_base_rev(Some((rev - 1).max(0)))
            .with_send_deltas(options.send_deltas);
        drive.copies = copies;
        tracing::debug!(rev, anchor = %self.anchor, "replaying revision");
        let mut editor = Editor::with_callbacks(sink, self.callbacks.clone());
        drive_tree_delta(&mut editor, &before, &after, &drive)
    }

    /// Returns an editor that builds a commit against HEAD.
    ///
    /// The commit happens when the edit is closed; `on_commit` then receives
    /// the new revision's [`CommitInfo`]. Aborting (or dropping) the editor
    /// discards the transaction. The session stays busy until then.
    pub fn commit_editor<'a>(
        &'a self,
        options: &CommitOptions,
        on_commit: impl FnMut(&CommitInfo) -> Result<(), SvnError> + 'a,
    ) -> Result<Editor<'a>, SvnError> {
        let busy = self.acquire("commit")?;
        if !options.rev_props.is_empty() {
            self.require(Capability::CommitRevProps)?;
        }
        let head = self.repo.latest_revnum()?;
        let base = self.repo.tree_at(head)?.subtree(&self.anchor).ok_or_else(|| {
            SvnError::engine(ERR_FS_NOT_FOUND, format!("'{}' not found in r{head}", self.anchor))
        })?;

        let mut txn = Transaction::new(head, self.anchor.clone(), base.clone());
        txn.rev_props = options.rev_props.clone();
        txn.set_rev_prop(PROP_REVISION_LOG, options.log_message.as_str());
        if let Some(user) = &self.username {
            txn.set_rev_prop(PROP_REVISION_AUTHOR, user.as_str());
        }
        for token in &options.lock_tokens {
            txn.lock_tokens.insert(self.repo_path(&token.path)?, token.token.clone());
        }
        txn.keep_locks = options.keep_locks;

        let repo: &'a dyn Repository = self.repo.as_ref();
        let sink = CommitSink {
            repo,
            inner: TreeEditor::new(base).with_copy_source(repo),
            txn: Some(txn),
            batons: BTreeMap::new(),
            on_commit: Box::new(on_commit),
            committed: false,
        };
        tracing::debug!(base_rev = head, anchor = %self.anchor, "commit transaction started");
        Ok(Editor::from_parts(Box::new(sink), self.callbacks.clone(), Some(busy)))
    }

    fn log_walker(&self, options: &LogOptions) -> Result<LogWalker, SvnError> {
        if matches!(options.revprops, LogRevProps::Custom(_)) {
            self.require(Capability::LogRevProps)?;
        }
        let targets = if options.target_paths.is_empty() {
            vec![self.anchor.clone()]
        } else {
            options
                .target_paths
                .iter()
                .map(|target| self.repo_path(target))
                .collect::<Result<Vec<_>, _>>()?
        };
        LogWalker::new(Arc::clone(&self.repo), targets, options)
    }

    /// Delivers log entries to `receiver`, newest first unless the range is
    /// ascending. An error from `receiver` stops the walk and surfaces as
    /// [`SvnError::Callback`].
    pub fn log(
        &self,
        options: &LogOptions,
        mut receiver: impl FnMut(LogEntry) -> Result<(), SvnError>,
    ) -> Result<(), SvnError> {
        let _busy = self.acquire("log")?;
        let walker = self.log_walker(options)?;
        for entry in walker {
            self.callbacks.check_cancel()?;
            receiver(entry?).map_err(SvnError::callback)?;
        }
        Ok(())
    }

    /// Streams log entries from a background worker.
    ///
    /// The session stays busy until the iterator is exhausted or dropped.
    pub fn log_iter(&self, options: &LogOptions) -> Result<LogIter, SvnError> {
        let busy = self.acquire("log")?;
        let walker = self.log_walker(options)?;
        LogIter::spawn(walker, options.queue_capacity, self.callbacks.clone(), busy)
    }

    /// Locks the file at `path` for the session user.
    pub fn lock(&self, path: &str, options: &LockOptions) -> Result<Lock, SvnError> {
        let _busy = self.acquire("lock")?;
        let owner = self.username.as_deref().ok_or_else(|| {
            SvnError::engine(ERR_RA_NOT_AUTHORIZED, "locking requires an authenticated user")
        })?;
        let full = path::join(&self.anchor, &path::validate_rel_path(path)?);
        let lock = self.repo.lock(&full, owner, options)?;
        tracing::debug!(path = %full, owner, "path locked");
        Ok(lock)
    }

    /// Releases the lock on `path`.
    pub fn unlock(&self, path: &str, options: &UnlockOptions) -> Result<(), SvnError> {
        let _busy = self.acquire("unlock")?;
        let full = path::join(&self.anchor, &path::validate_rel_path(path)?);
        self.repo.unlock(&full, options)?;
        tracing::debug!(path = %full, "path unlocked");
        Ok(())
    }

    /// Returns the lock on `path`, if any.
    pub fn get_lock(&self, path: &str) -> Result<Option<Lock>, SvnError> {
        let _busy = self.acquire("get-lock")?;
        let full = path::join(&self.anchor, &path::validate_rel_path(path)?);
        self.repo.get_lock(&full)
    }

    /// Returns the locks on and below `path`, limited by `depth`.
    pub fn get_locks(&self, path: &str, depth: Depth) -> Result<Vec<Lock>, SvnError> {
        let _busy = self.acquire("get-locks")?;
        let full = self.repo_path(path)?;
        self.repo.get_locks(&full, depth)
    }

    /// Traces `path@peg_rev` back through its copy history and returns the
    /// repository path it had in each of `location_revs`.
    ///
    /// Revisions in which the node did not exist, and revisions younger than
    /// `peg_rev`, have no entry in the result.
    pub fn get_locations(
        &self,
        path: &str,
        peg_rev: Revnum,
        location_revs: &[Revnum],
    ) -> Result<BTreeMap<Revnum, String>, SvnError> {
        let _busy = self.acquire("get-locations")?;
        let mut current = self.repo_path(path)?;
        let mut rev = self.resolve_rev(Some(peg_rev))?;
        if self.repo.check_path(&current, rev)? == NodeKind::None {
            return Err(SvnError::engine(
                ERR_FS_NOT_FOUND,
                format!("path '{current}' doesn't exist in revision {rev}"),
            ));
        }

        let mut wanted: Vec<Revnum> = location_revs
            .iter()
            .copied()
            .filter(|wanted| (0..=rev).contains(wanted))
            .collect();
        wanted.sort_unstable_by(|a, b| b.cmp(a));
        wanted.dedup();

        let mut out = BTreeMap::new();
        let mut pending = wanted.into_iter().peekable();
        loop {
            let (appeared, previous) = self.previous_location(&current, rev)?;
            while let Some(wanted) = pending.next_if(|wanted| *wanted >= appeared) {
                out.insert(wanted, current.clone());
            }
            let Some((prev_path, prev_rev)) = previous else {
                break;
            };
            while pending.next_if(|wanted| *wanted > prev_rev).is_some() {}
            current = prev_path;
            rev = prev_rev;
        }
        Ok(out)
    }

    /// Finds where the node at `path@rev` came into being: the revision it
    /// appeared at `path`, and its copy source if it was copied.
    fn previous_location(
        &self,
        path: &str,
        rev: Revnum,
    ) -> Result<(Revnum, Option<(String, Revnum)>), SvnError> {
        for r in (1..=rev).rev() {
            let changes = self.repo.changed_paths(r)?;
            let origin = changes
                .iter()
                .filter(|(changed, change)| {
                    path::is_ancestor(changed, path)
                        && matches!(change.action, ChangeAction::Added | ChangeAction::Replaced)
                })
                .max_by_key(|(changed, _)| changed.len());
            if let Some((changed, change)) = origin {
                let previous = change.copy_from.as_ref().map(|from| {
                    let rest = path::skip_ancestor(changed, path).unwrap_or_default();
                    (path::join(&from.path, rest), from.rev)
                });
                return Ok((r, previous));
            }
        }
        Ok((0, None))
    }
}

/// Parameters shared by the report-driven operations.
struct ReportRequest<'r> {
    op: &'static str,
    target: &'r str,
    /// Repository path to bring the target to; the target's own path if `None`.
    source: Option<&'r str>,
    rev: Option<Revnum>,
    depth: Depth,
    send_copyfrom_args: bool,
    send_deltas: bool,
}

/// Turns a finished report into an edit.
struct ReportDriver<'a> {
    op: &'static str,
    repo: Arc<dyn Repository>,
    anchor: String,
    capabilities: BTreeSet<Capability>,
    callbacks: Callbacks,
    /// Anchor-relative target of the operation.
    target: String,
    /// Repository path the target is brought to.
    source: String,
    rev: Revnum,
    depth: Depth,
    send_copyfrom_args: bool,
    send_deltas: bool,
    report: Report,
    sink: Option<Box<dyn EditorSink + 'a>>,
}

fn shaped(node: Node, start_empty: bool, depth: Depth) -> Node {
    if start_empty {
        node.pruned(Depth::Empty)
    } else {
        node.pruned(depth)
    }
}

/// Puts `node` at `at` (anchor-relative), or removes what is there.
fn place(tree: &mut Tree, at: &str, node: Option<Node>) -> Result<(), SvnError> {
    if at.is_empty() {
        return match node {
            Some(Node::Dir(dir)) => {
                tree.root = dir;
                Ok(())
            }
            Some(Node::File(_)) => Err(SvnError::engine(
                ERR_NODE_UNEXPECTED_KIND,
                "the edit root must be a directory",
            )),
            None => Err(SvnError::engine(ERR_FS_NOT_FOUND, "the edit root does not exist")),
        };
    }
    tree.remove(at);
    if let Some(node) = node {
        tree.insert(at, node)?;
    }
    Ok(())
}

impl ReportDriver<'_> {
    fn link_source(&self, url: &str) -> Result<String, SvnError> {
        let root = self.repo.root_url();
        let rest = url
            .strip_prefix(root)
            .filter(|rest| rest.is_empty() || rest.starts_with('/'))
            .ok_or_else(|| {
                SvnError::InvalidPath(format!("'{url}' is not in repository '{root}'"))
            })?;
        path::validate_rel_dir_path(rest.trim_start_matches('/'))
    }

    /// Where anchor-relative `at` lives in the repository after the edit.
    fn target_repo_path(&self, at: &str) -> Option<String> {
        path::skip_ancestor(&self.target, at).map(|rest| path::join(&self.source, rest))
    }

    /// Builds the client's tree from the report and the tree it should end
    /// up with, both relative to the anchor.
    fn trees(&self) -> Result<(Tree, Tree, Revnum), SvnError> {
        let full = self.repo.tree_at(self.rev)?;
        let anchored = full.subtree(&self.anchor).ok_or_else(|| {
            SvnError::engine(
                ERR_FS_NOT_FOUND,
                format!("'{}' not found in revision {}", self.anchor, self.rev),
            )
        })?;

        let mut target = anchored.clone();
        let wanted = node_in(&full, &self.source).map(|node| node.pruned(self.depth));
        if wanted.is_none() && self.target.is_empty() {
            return Err(SvnError::engine(
                ERR_FS_NOT_FOUND,
                format!("'{}' not found in revision {}", self.source, self.rev),
            ));
        }
        place(&mut target, &self.target, wanted)?;

        let mut client = anchored;
        let mut base_rev = self.rev;
        let reported_root = path::join(&self.anchor, &self.target);
        for command in &self.report.commands {
            match command {
                ReportCommand::SetPath {
                    path: rel,
                    rev,
                    start_empty,
                    depth,
                    ..
                } => {
                    let at = path::join(&self.target, rel);
                    let node = self.repo.node_at(&path::join(&reported_root, rel), *rev)?;
                    if rel.is_empty() {
                        base_rev = *rev;
                    }
                    place(&mut client, &at, node.map(|node| shaped(node, *start_empty, *depth)))?;
                    self.narrow(&mut target, &at, *depth)?;
                }
                ReportCommand::LinkPath {
                    path: rel,
                    url,
                    rev,
                    start_empty,
                    depth,
                    ..
                } => {
                    let at = path::join(&self.target, rel);
                    let node = self.repo.node_at(&self.link_source(url)?, *rev)?;
                    place(&mut client, &at, node.map(|node| shaped(node, *start_empty, *depth)))?;
                    self.narrow(&mut target, &at, *depth)?;
                }
                ReportCommand::DeletePath { path: rel } => {
                    client.remove(&path::join(&self.target, rel));
                }
                ReportCommand::FinishReport | ReportCommand::AbortReport => {}
            }
        }
        Ok((client, target, base_rev))
    }

    /// Keeps the target no deeper than the depth the client reported for `at`.
    fn narrow(&self, target: &mut Tree, at: &str, depth: Depth) -> Result<(), SvnError> {
        if depth >= self.depth {
            return Ok(());
        }
        let narrowed = match node_in(target, at) {
            Some(node @ Node::Dir(_)) => node.pruned(depth),
            _ => return Ok(()),
        };
        place(target, at, Some(narrowed))
    }

    /// Copy history for nodes the client lacks, at the top of each added subtree.
    fn copies(&self, client: &Tree, target: &Tree) -> Result<CopyMap, SvnError> {
        let mut copies = CopyMap::new();
        for at in target.paths() {
            if client.kind(&at) != NodeKind::None
                || client.kind(path::dirname(&at)) != NodeKind::Dir
            {
                continue;
            }
            let Some(repo_path) = self.target_repo_path(&at) else {
                continue;
            };
            if let Some(from) = self.copied_from(&repo_path)? {
                let node = self.repo.copy_source(&from)?;
                copies.insert(at, (from, node));
            }
        }
        Ok(copies)
    }

    fn copied_from(&self, repo_path: &str) -> Result<Option<CopyFrom>, SvnError> {
        for rev in (1..=self.rev).rev() {
            if let Some(change) = self.repo.changed_paths(rev)?.get(repo_path)
                && matches!(change.action, ChangeAction::Added | ChangeAction::Replaced)
            {
                return Ok(change.copy_from.clone());
            }
        }
        Ok(None)
    }
}

impl ReportSink for ReportDriver<'_> {
    fn command(&mut self, command: ReportCommand) -> Result<(), SvnError> {
        if let ReportCommand::SetPath { depth, .. } | ReportCommand::LinkPath { depth, .. } =
            &command
            && *depth != Depth::Infinity
            && !self.capabilities.contains(&Capability::Depth)
        {
            return Err(SvnError::UnsupportedCapability(Capability::Depth));
        }
        self.report.push(command);
        Ok(())
    }

    fn finish(&mut self) -> Result<(), SvnError> {
        self.report.finish();
        self.report.validate()?;
        let sink = self
            .sink
            .take()
            .ok_or_else(|| SvnError::Protocol("report already driven".into()))?;
        let (client, target, base_rev) = self.trees()?;
        let mut options = DriveOptions::new()
            .with_target_rev(Some(self.rev))
            .with_base_rev(Some(base_rev))
            .with_send_deltas(self.send_deltas);
        if self.send_copyfrom_args {
            options.copies = self.copies(&client, &target)?;
        }
        tracing::debug!(op = self.op, rev = self.rev, base_rev, "driving report edit");
        let mut editor = Editor::from_parts(sink, self.callbacks.clone(), None);
        drive_tree_delta(&mut editor, &client, &target, &options)
    }

    fn abort(&mut self) -> Result<(), SvnError> {
        self.report.push(ReportCommand::AbortReport);
        self.sink = None;
        Ok(())
    }
}

/// Consumer side of a commit: applies the edit to a transaction tree and
/// commits it when the edit closes.
struct CommitSink<'a> {
    repo: &'a dyn Repository,
    inner: TreeEditor<'a>,
    txn: Option<Transaction>,
    /// Open batons: anchor-relative path and the base revision they were opened at.
    batons: BTreeMap<BatonId, (String, Option<Revnum>)>,
    on_commit: Box<dyn FnMut(&CommitInfo) -> Result<(), SvnError> + 'a>,
    committed: bool,
}

impl CommitSink<'_> {
    fn txn(&mut self) -> Result<&mut Transaction, SvnError> {
        self.txn
            .as_mut()
            .ok_or_else(|| SvnError::Protocol("commit transaction already finished".into()))
    }

    /// Fails if the node at anchor-relative `at` changed after `base_rev`.
    fn check_current(&mut self, at: &str, base_rev: Option<Revnum>) -> Result<(), SvnError> {
        let Some(base_rev) = base_rev else {
            return Ok(());
        };
        let txn = self.txn()?;
        let full = path::join(&txn.anchor, at);
        let txn_base = txn.base_rev;
        let created = self.repo.created_rev(&full, txn_base)?;
        if created > base_rev {
            return Err(SvnError::engine(
                ERR_FS_TXN_OUT_OF_DATE,
                format!("'{full}' is out of date: changed in r{created}, base is r{base_rev}"),
            ));
        }
        Ok(())
    }

    fn record_copy(&mut self, at: &str, copy_from: Option<&CopyFrom>) -> Result<(), SvnError> {
        if let Some(from) = copy_from {
            let node = self.repo.copy_source(from)?;
            self.txn()?.copies.insert(at.to_string(), (from.clone(), node));
        }
        Ok(())
    }
}

impl EditorSink for CommitSink<'_> {
    fn open_root(&mut self, root: BatonId, base_rev: Option<Revnum>) -> Result<(), SvnError> {
        self.inner.open_root(root, base_rev)?;
        self.batons.insert(root, (String::new(), base_rev));
        Ok(())
    }

    fn delete_entry(
        &mut self,
        parent: BatonId,
        path: &str,
        rev: Option<Revnum>,
    ) -> Result<(), SvnError> {
        self.check_current(path, rev)?;
        self.inner.delete_entry(parent, path, rev)
    }

    fn add_directory(
        &mut self,
        parent: BatonId,
        child: BatonId,
        path: &str,
        copy_from: Option<&CopyFrom>,
    ) -> Result<(), SvnError> {
        self.inner.add_directory(parent, child, path, copy_from)?;
        self.record_copy(path, copy_from)?;
        self.batons.insert(child, (path.to_string(), None));
        Ok(())
    }

    fn open_directory(
        &mut self,
        parent: BatonId,
        child: BatonId,
        path: &str,
        base_rev: Option<Revnum>,
    ) -> Result<(), SvnError> {
        self.inner.open_directory(parent, child, path, base_rev)?;
        self.batons.insert(child, (path.to_string(), base_rev));
        Ok(())
    }

    fn change_dir_prop(
        &mut self,
        dir: BatonId,
        name: &str,
        value: Option<&[u8]>,
    ) -> Result<(), SvnError> {
        if let Some((at, base_rev)) = self.batons.get(&dir).cloned() {
            self.check_current(&at, base_rev)?;
        }
        self.inner.change_dir_prop(dir, name, value)
    }

    fn close_directory(&mut self, dir: BatonId) -> Result<(), SvnError> {
        self.inner.close_directory(dir)?;
        self.batons.remove(&dir);
        Ok(())
    }

    fn absent_directory(&mut self, parent: BatonId, path: &str) -> Result<(), SvnError> {
        self.inner.absent_directory(parent, path)
    }

    fn add_file(
        &mut self,
        parent: BatonId,
        file: BatonId,
        path: &str,
        copy_from: Option<&CopyFrom>,
    ) -> Result<(), SvnError> {
        self.inner.add_file(parent, file, path, copy_from)?;
        self.record_copy(path, copy_from)?;
        self.batons.insert(file, (path.to_string(), None));
        Ok(())
    }

    fn open_file(
        &mut self,
        parent: BatonId,
        file: BatonId,
        path: &str,
        base_rev: Option<Revnum>,
    ) -> Result<(), SvnError> {
        self.check_current(path, base_rev)?;
        self.inner.open_file(parent, file, path, base_rev)?;
        self.batons.insert(file, (path.to_string(), base_rev));
        Ok(())
    }

    fn apply_textdelta(
        &mut self,
        file: BatonId,
        base_checksum: Option<&str>,
    ) -> Result<(), SvnError> {
        self.inner.apply_textdelta(file, base_checksum)
    }

    fn textdelta_window(&mut self, file: BatonId, window: &DeltaWindow) -> Result<(), SvnError> {
        self.inner.textdelta_window(file, window)
    }

    fn textdelta_end(&mut self, file: BatonId) -> Result<Option<String>, SvnError> {
        self.inner.textdelta_end(file)
    }

    fn change_file_prop(
        &mut self,
        file: BatonId,
        name: &str,
        value: Option<&[u8]>,
    ) -> Result<(), SvnError> {
        self.inner.change_file_prop(file, name, value)
    }

    fn close_file(&mut self, file: BatonId, text_checksum: Option<&str>) -> Result<(), SvnError> {
        self.inner.close_file(file, text_checksum)?;
        self.batons.remove(&file);
        Ok(())
    }

    fn absent_file(&mut self, parent: BatonId, path: &str) -> Result<(), SvnError> {
        self.inner.absent_file(parent, path)
    }

    fn close_edit(&mut self) -> Result<(), SvnError> {
        let mut txn = self
            .txn
            .clone()
            .ok_or_else(|| SvnError::Protocol("commit transaction already finished".into()))?;
        txn.tree = self.inner.tree().clone();
        let info = self.repo.commit(txn)?;
        self.inner.close_edit()?;
        self.txn = None;
        self.committed = true;
        tracing::debug!(new_rev = info.new_rev, "commit finished");
        (self.on_commit)(&info).map_err(SvnError::callback)
    }

    fn abort_edit(&mut self) -> Result<(), SvnError> {
        self.batons.clear();
        if self.committed {
            return Ok(());
        }
        if self.txn.take().is_some() {
            tracing::debug!("commit transaction discarded");
        }
        self.inner.abort_edit()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;
    use crate::repos::MemRepository;
    use crate::tree::CopySource;
    use crate::transport::{CommandRecorder, EditorCommand};
    use crate::txdelta::md5_hex;
    use crate::window::DeltaWindow;
    use crate::{CommitLockToken, PROP_REVISION_DATE};

    fn repo() -> Arc<MemRepository> {
        let repo = MemRepository::new().with_root_url("mem://test/repo");
        repo.commit_with("alice", "import", |txn| {
            txn.tree.put_file("trunk/README", "hello\n")?;
            txn.tree.put_file("trunk/lib/a.c", "int a;\n")?;
            txn.tree.mkdir_p("branches")
        })
        .unwrap();
        repo.commit_with("alice", "edit readme", |txn| {
            txn.tree.put_file("trunk/README", "hello, world\n")
        })
        .unwrap();
        Arc::new(repo)
    }

    fn session(repo: &Arc<MemRepository>) -> RaSession {
        let repo: Arc<dyn Repository> = repo.clone();
        RaSession::open(repo, "").unwrap().with_username("alice")
    }

    fn checkout(repo: &Arc<MemRepository>, rev: Revnum) -> Tree {
        repo.tree_at(rev).unwrap()
    }

    #[test]
    fn update_brings_a_working_tree_to_head() {
        let repo = repo();
        let session = session(&repo);
        let mut consumer = TreeEditor::new(checkout(&repo, 1));
        {
            let mut reporter = session
                .do_update(&UpdateOptions::new("", Depth::Infinity), &mut consumer)
                .unwrap();
            assert!(session.is_busy());
            reporter.set_path("", 1, false, None, Depth::Infinity).unwrap();
            reporter.finish().unwrap();
        }
        assert!(!session.is_busy());
        assert_eq!(consumer.target_revision(), Some(2));
        assert_eq!(consumer.into_tree(), checkout(&repo, 2));
    }

    #[test]
    fn update_honours_mixed_revisions_and_deleted_paths() {
        let repo = repo();
        let session = session(&repo);
        let mut working = checkout(&repo, 2);
        working.remove("trunk/lib");
        let mut consumer = TreeEditor::new(working);
        {
            let mut reporter = session
                .do_update(&UpdateOptions::new("", Depth::Infinity).with_rev(2), &mut consumer)
                .unwrap();
            reporter.set_path("", 2, false, None, Depth::Infinity).unwrap();
            reporter.delete_path("trunk/lib").unwrap();
            reporter.finish().unwrap();
        }
        assert_eq!(consumer.into_tree(), checkout(&repo, 2));
    }

    #[test]
    fn update_target_limits_the_edit() {
        let repo = repo();
        let session = session(&repo);
        let mut recorder = CommandRecorder::new();
        {
            let mut reporter = session
                .do_update(&UpdateOptions::new("trunk", Depth::Infinity), &mut recorder)
                .unwrap();
            reporter.set_path("", 1, false, None, Depth::Infinity).unwrap();
            reporter.finish().unwrap();
        }
        let opened: Vec<_> = recorder
            .commands()
            .iter()
            .filter_map(|cmd| match cmd {
                EditorCommand::OpenDir { path, .. } | EditorCommand::OpenFile { path, .. } => {
                    Some(path.as_str())
                }
                _ => None,
            })
            .collect();
        assert_eq!(opened, vec!["trunk", "trunk/README"]);
    }

    #[test]
    fn status_sends_empty_deltas() {
        let repo = repo();
        let session = session(&repo);
        let mut recorder = CommandRecorder::new();
        {
            let mut reporter = session
                .do_status(&StatusOptions::new("", Depth::Infinity), &mut recorder)
                .unwrap();
            reporter.set_path("", 1, false, None, Depth::Infinity).unwrap();
            reporter.finish().unwrap();
        }
        let chunks: Vec<_> = recorder
            .commands()
            .iter()
            .filter_map(|cmd| match cmd {
                EditorCommand::TextDeltaChunk { chunk, .. } => Some(chunk.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(chunks, vec![b"SVN\0".to_vec()]);
    }

    #[test]
    fn switch_moves_the_target_to_another_path() {
        let repo = repo();
        let trunk = repo.copy_source(&CopyFrom::new("trunk", 2)).unwrap();
        repo.commit_with("bob", "branch", |txn| {
            txn.copy(CopyFrom::new("trunk", 2), trunk, "branches/b1")?;
            txn.tree.put_file("branches/b1/NOTES", "branch notes\n")
        })
        .unwrap();

        let session = session(&repo);
        let mut working = checkout(&repo, 2);
        let mut consumer = TreeEditor::new(working.clone());
        {
            let mut reporter = session
                .do_switch(
                    &SwitchOptions::new("trunk", "branches/b1", Depth::Infinity),
                    &mut consumer,
                )
                .unwrap();
            reporter.set_path("", 2, false, None, Depth::Infinity).unwrap();
            reporter.finish().unwrap();
        }
        working.remove("trunk");
        working
            .insert("trunk", repo.copy_source(&CopyFrom::new("branches/b1", 3)).unwrap())
            .unwrap();
        assert_eq!(consumer.into_tree().get("trunk"), working.get("trunk"));
    }

    #[test]
    fn update_sends_copies_with_history() {
        let repo = repo();
        let trunk = repo.copy_source(&CopyFrom::new("trunk", 2)).unwrap();
        repo.commit_with("bob", "branch", |txn| {
            txn.copy(CopyFrom::new("trunk", 2), trunk, "branches/b1")
        })
        .unwrap();

        let session = session(&repo);
        let mut recorder = CommandRecorder::new();
        {
            let mut reporter = session
                .do_update(&UpdateOptions::new("", Depth::Infinity), &mut recorder)
                .unwrap();
            reporter.set_path("", 2, false, None, Depth::Infinity).unwrap();
            reporter.finish().unwrap();
        }
        assert!(recorder.commands().iter().any(|cmd| matches!(
            cmd,
            EditorCommand::AddDir { path, copy_from: Some(from), .. }
                if path == "branches/b1" && *from == CopyFrom::new("trunk", 2)
        )));

        let source: &MemRepository = &repo;
        let mut consumer = TreeEditor::new(checkout(&repo, 2)).with_copy_source(source);
        {
            let mut reporter = session
                .do_update(&UpdateOptions::new("", Depth::Infinity), &mut consumer)
                .unwrap();
            reporter.set_path("", 2, false, None, Depth::Infinity).unwrap();
            reporter.finish().unwrap();
        }
        assert_eq!(consumer.into_tree(), checkout(&repo, 3));
    }

    #[test]
    fn start_empty_reports_get_full_contents() {
        let repo = repo();
        let session = session(&repo);
        let mut consumer = TreeEditor::new(Tree::new());
        {
            let mut reporter = session
                .do_update(&UpdateOptions::new("", Depth::Infinity), &mut consumer)
                .unwrap();
            reporter.set_path("", 0, true, None, Depth::Infinity).unwrap();
            reporter.finish().unwrap();
        }
        assert_eq!(consumer.into_tree(), checkout(&repo, 2));
    }

    #[test]
    fn shallow_depth_needs_the_capability() {
        let repo: Arc<dyn Repository> =
            Arc::new(MemRepository::new().with_capabilities([Capability::Svndiff1]));
        let session = RaSession::open(repo, "").unwrap();
        let err = session
            .do_update(&UpdateOptions::new("", Depth::Files), CommandRecorder::new())
            .unwrap_err();
        assert!(matches!(err, SvnError::UnsupportedCapability(Capability::Depth)));
        assert!(!session.is_busy());

        let mut reporter = session
            .do_update(&UpdateOptions::new("", Depth::Infinity), CommandRecorder::new())
            .unwrap();
        let err = reporter.set_path("", 0, false, None, Depth::Empty).unwrap_err();
        assert!(matches!(err, SvnError::UnsupportedCapability(Capability::Depth)));
        reporter.abort().unwrap();
        assert!(!session.is_busy());
    }

    #[test]
    fn busy_flag_serializes_operations() {
        let repo = repo();
        let session = session(&repo);
        let mut reporter = session
            .do_update(&UpdateOptions::new("", Depth::Infinity), CommandRecorder::new())
            .unwrap();
        assert!(matches!(session.latest_revnum(), Err(SvnError::Busy("get-latest-rev"))));
        assert!(matches!(
            session.commit_editor(&CommitOptions::new("x"), |_: &CommitInfo| Ok(())),
            Err(SvnError::Busy("commit"))
        ));
        reporter.abort().unwrap();
        assert_eq!(session.latest_revnum().unwrap(), 2);
    }

    #[test]
    fn failed_report_releases_the_session() {
        let repo = repo();
        let session = session(&repo);
        let mut reporter = session
            .do_update(&UpdateOptions::new("", Depth::Infinity), CommandRecorder::new())
            .unwrap();
        reporter.set_path("", 1, false, None, Depth::Infinity).unwrap();
        reporter
            .link_path("ext", "svn://elsewhere/repo", 1, false, None, Depth::Infinity)
            .unwrap();
        assert!(matches!(reporter.finish(), Err(SvnError::InvalidPath(_))));
        assert!(!session.is_busy());
    }

    #[test]
    fn commit_editor_commits_on_close() {
        let repo = repo();
        let session = session(&repo);
        let seen = Rc::new(RefCell::new(None));
        {
            let seen = Rc::clone(&seen);
            let mut editor = session
                .commit_editor(&CommitOptions::new("add docs"), move |info: &CommitInfo| {
                    *seen.borrow_mut() = Some(info.clone());
                    Ok(())
                })
                .unwrap();
            assert!(session.is_busy());
            let mut root = editor.open_root(Some(2)).unwrap();
            let mut trunk = root.open_directory("trunk", Some(2)).unwrap();
            let mut file = trunk.add_file("trunk/DOCS", None).unwrap();
            let mut handler = file.apply_textdelta(None).unwrap();
            handler.send(Some(&DeltaWindow::insertion(b"docs\n".to_vec()))).unwrap();
            handler.finish().unwrap();
            file.close(Some(md5_hex(b"docs\n").as_str())).unwrap();
            trunk.close().unwrap();
            root.close().unwrap();
            editor.close().unwrap();
        }
        assert!(!session.is_busy());
        let info = seen.borrow().clone().unwrap();
        assert_eq!(info.new_rev, 3);
        assert_eq!(info.author.as_deref(), Some("alice"));
        assert_eq!(repo.tree_at(3).unwrap().file("trunk/DOCS").unwrap().contents, b"docs\n");
        let props = repo.rev_props(3).unwrap();
        assert_eq!(props.get(PROP_REVISION_LOG).unwrap(), b"add docs");
        assert!(props.contains_key(PROP_REVISION_DATE));
    }

    #[test]
    fn commit_editor_rejects_out_of_date_files() {
        let repo = repo();
        let session = session(&repo);
        let mut editor = session
            .commit_editor(&CommitOptions::new("stale"), |_: &CommitInfo| Ok(()))
            .unwrap();
        let mut root = editor.open_root(Some(1)).unwrap();
        let mut trunk = root.open_directory("trunk", Some(1)).unwrap();
        let err = trunk.open_file("trunk/README", Some(1)).unwrap_err();
        assert_eq!(err.engine_code(), Some(ERR_FS_TXN_OUT_OF_DATE));
        editor.abort().unwrap();
        assert!(!session.is_busy());
        assert_eq!(repo.latest_revnum().unwrap(), 2);
    }

    #[test]
    fn dropping_a_commit_editor_discards_the_transaction() {
        let repo = repo();
        let session = session(&repo);
        {
            let mut editor = session
                .commit_editor(&CommitOptions::new("never"), |_: &CommitInfo| Ok(()))
                .unwrap();
            let mut root = editor.open_root(None).unwrap();
            root.delete_entry("branches", None).unwrap();
        }
        assert!(!session.is_busy());
        assert_eq!(repo.latest_revnum().unwrap(), 2);
    }

    #[test]
    fn commit_presents_lock_tokens() {
        let repo = repo();
        let session = session(&repo);
        let lock = session.lock("trunk/README", &LockOptions::new()).unwrap();
        assert_eq!(session.get_lock("trunk/README").unwrap(), Some(lock.clone()));

        let options = CommitOptions::new("locked edit")
            .with_lock_tokens(vec![CommitLockToken::new("trunk/README", lock.token.clone())]);
        let mut editor = session.commit_editor(&options, |_: &CommitInfo| Ok(())).unwrap();
        let mut root = editor.open_root(Some(2)).unwrap();
        let mut trunk = root.open_directory("trunk", Some(2)).unwrap();
        let mut file = trunk.open_file("trunk/README", Some(2)).unwrap();
        file.change_prop("svn:eol-style", Some(b"native")).unwrap();
        file.close(None).unwrap();
        trunk.close().unwrap();
        root.close().unwrap();
        editor.close().unwrap();
        drop(editor);

        assert_eq!(session.get_lock("trunk/README").unwrap(), None);
        assert_eq!(
            repo.changed_paths(3).unwrap()["trunk/README"].action,
            ChangeAction::Modified
        );
    }

    #[test]
    fn commit_callback_errors_are_callback_errors() {
        let repo = repo();
        let session = session(&repo);
        let mut editor = session
            .commit_editor(&CommitOptions::new("x"), |_: &CommitInfo| {
                Err(SvnError::Protocol("receiver failed".into()))
            })
            .unwrap();
        let mut root = editor.open_root(None).unwrap();
        root.add_directory("tags", None).unwrap().close().unwrap();
        root.close().unwrap();
        assert!(matches!(editor.close(), Err(SvnError::Callback(_))));
        editor.abort().unwrap();
        assert_eq!(repo.latest_revnum().unwrap(), 3);
    }

    #[test]
    fn replay_reproduces_a_revision() {
        let repo = repo();
        let session = session(&repo);
        let mut consumer = TreeEditor::new(checkout(&repo, 1));
        session.replay(&ReplayOptions::new(2), &mut consumer).unwrap();
        assert_eq!(consumer.into_tree(), checkout(&repo, 2));

        let trunk = repo.copy_source(&CopyFrom::new("trunk", 2)).unwrap();
        repo.commit_with("bob", "branch", |txn| {
            txn.copy(CopyFrom::new("trunk", 2), trunk, "branches/b1")
        })
        .unwrap();
        let mut recorder = CommandRecorder::new();
        session
            .replay(&ReplayOptions::new(3).with_low_water_mark(3), &mut recorder)
            .unwrap();
        assert!(recorder.commands().iter().any(|cmd| matches!(
            cmd,
            EditorCommand::AddDir { path, copy_from: None, .. } if path == "branches/b1"
        )));
    }

    #[test]
    fn get_locations_follows_copies() {
        let repo = repo();
        let trunk = repo.copy_source(&CopyFrom::new("trunk", 1)).unwrap();
        repo.commit_with("bob", "old branch", |txn| {
            txn.copy(CopyFrom::new("trunk", 1), trunk, "branches/old")
        })
        .unwrap();

        let session = session(&repo);
        let locations = session.get_locations("branches/old/README", 3, &[0, 1, 2, 3]).unwrap();
        assert_eq!(
            locations,
            BTreeMap::from([
                (1, "trunk/README".to_string()),
                (3, "branches/old/README".to_string()),
            ])
        );
        let err = session.get_locations("branches/missing", 3, &[1]).unwrap_err();
        assert_eq!(err.engine_code(), Some(ERR_FS_NOT_FOUND));
    }

    #[test]
    fn lock_requires_a_user() {
        let repo: Arc<dyn Repository> = repo();
        let session = RaSession::open(repo, "trunk").unwrap();
        let err = session.lock("README", &LockOptions::new()).unwrap_err();
        assert_eq!(err.engine_code(), Some(ERR_RA_NOT_AUTHORIZED));
        assert!(session.get_locks("", Depth::Infinity).unwrap().is_empty());
    }

    #[test]
    fn open_rejects_missing_anchors() {
        let repo: Arc<dyn Repository> = repo();
        let err = RaSession::open(Arc::clone(&repo), "nowhere").unwrap_err();
        assert_eq!(err.engine_code(), Some(ERR_FS_NOT_FOUND));
        let err = RaSession::open(repo, "trunk/README").unwrap_err();
        assert_eq!(err.engine_code(), Some(ERR_NODE_UNEXPECTED_KIND));
    }
}
