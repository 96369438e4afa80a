//! The storage engine a session talks to, and an in-memory implementation.
//!
//! A [`Repository`] keeps one immutable [`Tree`] per revision together with
//! its revision properties and the paths it changed. Commits arrive as a
//! [`Transaction`]: the tree under an anchor as the committer saw it, the
//! tree they want, and the copies they made.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, SecondsFormat, Utc};
use md5::{Digest, Md5};

use crate::error::{
    ERR_FS_BAD_LOCK_TOKEN, ERR_FS_NO_SUCH_LOCK, ERR_FS_NOT_FOUND, ERR_FS_PATH_ALREADY_LOCKED,
    ERR_FS_TXN_OUT_OF_DATE, ERR_NODE_UNEXPECTED_KIND,
};
use crate::options::{LockOptions, UnlockOptions};
use crate::tree::{CopySource, DirNode, Node, Tree};
use crate::{
    Capability, ChangeAction, ChangedPath, CommitInfo, CopyFrom, Depth, Lock, NodeKind,
    PROP_REVISION_AUTHOR, PROP_REVISION_DATE, PROP_REVISION_LOG, PropertyList, Revnum, SvnError,
    path,
};

/// Copies recorded in a transaction, keyed by anchor-relative destination.
pub type CopyMap = BTreeMap<String, (CopyFrom, Node)>;

/// Versioned storage behind an [`RaSession`](crate::RaSession).
///
/// Paths are repository-relative (no leading `/`, `""` is the root).
pub trait Repository: CopySource + Send + Sync {
    /// Repository UUID.
    fn uuid(&self) -> &str;

    /// URL of the repository root; `link_path` URLs must lie below it.
    fn root_url(&self) -> &str;

    /// Capabilities this engine supports.
    fn capabilities(&self) -> BTreeSet<Capability>;

    /// The youngest revision.
    fn latest_revnum(&self) -> Result<Revnum, SvnError>;

    /// The whole tree of revision `rev`.
    fn tree_at(&self, rev: Revnum) -> Result<Tree, SvnError>;

    /// The node at `path` in `rev`, if any. The root is returned as a directory.
    fn node_at(&self, path: &str, rev: Revnum) -> Result<Option<Node>, SvnError> {
        let tree = self.tree_at(rev)?;
        Ok(node_in(&tree, path))
    }

    /// The kind of `path` in `rev`.
    fn check_path(&self, path: &str, rev: Revnum) -> Result<NodeKind, SvnError> {
        Ok(self.tree_at(rev)?.kind(path))
    }

    /// The revision in which the node at `path@rev` last changed.
    fn created_rev(&self, path: &str, rev: Revnum) -> Result<Revnum, SvnError>;

    /// Revision properties of `rev`.
    fn rev_props(&self, rev: Revnum) -> Result<PropertyList, SvnError>;

    /// Paths changed by `rev`.
    fn changed_paths(&self, rev: Revnum) -> Result<BTreeMap<String, ChangedPath>, SvnError>;

    /// Commits `txn` as a new revision.
    fn commit(&self, txn: Transaction) -> Result<CommitInfo, SvnError>;

    /// Locks the file at `path` for `owner`.
    fn lock(&self, path: &str, owner: &str, options: &LockOptions) -> Result<Lock, SvnError>;

    /// Releases the lock on `path`.
    fn unlock(&self, path: &str, options: &UnlockOptions) -> Result<(), SvnError>;

    /// The lock on `path`, if any.
    fn get_lock(&self, path: &str) -> Result<Option<Lock>, SvnError>;

    /// Locks on `path` and below it, limited by `depth`.
    fn get_locks(&self, path: &str, depth: Depth) -> Result<Vec<Lock>, SvnError>;
}

/// Returns the node at `path`, treating `""` as the root directory.
pub(crate) fn node_in(tree: &Tree, path: &str) -> Option<Node> {
    if path.is_empty() {
        Some(Node::Dir(tree.root.clone()))
    } else {
        tree.get(path).cloned()
    }
}

/// A pending commit.
#[derive(Clone, Debug)]
pub struct Transaction {
    /// Revision the committer based their changes on.
    pub base_rev: Revnum,
    /// Repository path every other path in the transaction is relative to.
    pub anchor: String,
    /// The anchor subtree in `base_rev`.
    pub base: Tree,
    /// The anchor subtree the committer wants.
    pub tree: Tree,
    /// Copy-based adds.
    pub copies: CopyMap,
    /// Revision properties for the new revision.
    pub rev_props: PropertyList,
    /// Lock tokens the committer holds, keyed by repository path.
    pub lock_tokens: BTreeMap<String, String>,
    /// Keep the presented locks after the commit.
    pub keep_locks: bool,
}

impl Transaction {
    /// Starts a transaction on `base`, the anchor subtree of `base_rev`.
    pub fn new(base_rev: Revnum, anchor: impl Into<String>, base: Tree) -> Self {
        Self {
            base_rev,
            anchor: anchor.into(),
            tree: base.clone(),
            base,
            copies: CopyMap::new(),
            rev_props: PropertyList::new(),
            lock_tokens: BTreeMap::new(),
            keep_locks: false,
        }
    }

    /// Copies `node` (the content of `from`) to `to`, replacing anything there.
    pub fn copy(&mut self, from: CopyFrom, node: Node, to: &str) -> Result<(), SvnError> {
        let to = path::validate_rel_path(to)?;
        self.tree.remove(&to);
        self.tree.insert(&to, node.clone())?;
        self.copies.insert(to, (from, node));
        Ok(())
    }

    /// Sets a revision property on the revision this transaction creates.
    pub fn set_rev_prop(&mut self, name: impl Into<String>, value: impl Into<Vec<u8>>) {
        self.rev_props.insert(name.into(), value.into());
    }

    /// Paths the transaction changes, relative to the anchor.
    pub fn changes(&self) -> BTreeMap<String, ChangedPath> {
        tree_changes(&self.base, &self.tree, &self.copies)
    }
}

/// Computes the changed-path list that turns `base` into `new`.
///
/// A copied subtree is listed once at its root; changes made inside the
/// copy are listed relative to the copy source.
pub fn tree_changes(base: &Tree, new: &Tree, copies: &CopyMap) -> BTreeMap<String, ChangedPath> {
    let mut out = BTreeMap::new();
    if base.root.props != new.root.props {
        out.insert(
            String::new(),
            changed(ChangeAction::Modified, None, NodeKind::Dir, false, true),
        );
    }
    diff_dir(&base.root, &new.root, "", copies, &mut out);
    out
}

fn changed(
    action: ChangeAction,
    copy_from: Option<CopyFrom>,
    node_kind: NodeKind,
    text_mods: bool,
    prop_mods: bool,
) -> ChangedPath {
    ChangedPath {
        action,
        copy_from,
        node_kind,
        text_mods,
        prop_mods,
    }
}

fn diff_dir(
    base: &DirNode,
    new: &DirNode,
    dir: &str,
    copies: &CopyMap,
    out: &mut BTreeMap<String, ChangedPath>,
) {
    for (name, old) in &base.entries {
        if !new.entries.contains_key(name) {
            out.insert(
                path::join(dir, name),
                changed(ChangeAction::Deleted, None, old.kind(), false, false),
            );
        }
    }
    for (name, node) in &new.entries {
        let child = path::join(dir, name);
        diff_node(base.entries.get(name), node, &child, copies, out);
    }
}

fn node_mods(old: &Node, new: &Node) -> (bool, bool) {
    let text = match (old, new) {
        (Node::File(old), Node::File(new)) => old.contents != new.contents,
        _ => false,
    };
    (text, old.props() != new.props())
}

fn diff_node(
    old: Option<&Node>,
    new: &Node,
    at: &str,
    copies: &CopyMap,
    out: &mut BTreeMap<String, ChangedPath>,
) {
    let copy = copies.get(at);
    if copy.is_none()
        && let Some(old) = old.filter(|old| old.kind() == new.kind())
    {
        if old == new {
            return;
        }
        let (text_mods, prop_mods) = node_mods(old, new);
        if text_mods || prop_mods {
            out.insert(
                at.to_string(),
                changed(ChangeAction::Modified, None, new.kind(), text_mods, prop_mods),
            );
        }
        if let (Node::Dir(old), Node::Dir(new)) = (old, new) {
            diff_dir(old, new, at, copies, out);
        }
        return;
    }

    let action = if old.is_some() {
        ChangeAction::Replaced
    } else {
        ChangeAction::Added
    };
    let (copy_from, basis) = match copy {
        Some((from, node)) => (Some(from.clone()), Some(node)),
        None => (None, None),
    };
    let (text_mods, prop_mods) = match (basis, new) {
        (Some(basis), _) => node_mods(basis, new),
        (None, Node::File(file)) => (true, !file.props.is_empty()),
        (None, Node::Dir(dir)) => (false, !dir.props.is_empty()),
    };
    out.insert(
        at.to_string(),
        changed(action, copy_from, new.kind(), text_mods, prop_mods),
    );
    if let Node::Dir(new) = new {
        let empty = DirNode::default();
        let basis = match basis {
            Some(Node::Dir(dir)) => dir,
            _ => &empty,
        };
        diff_dir(basis, new, at, copies, out);
    }
}

/// Formats a timestamp the way revision and lock dates are stored.
pub fn format_date(date: DateTime<Utc>) -> String {
    date.to_rfc3339_opts(SecondsFormat::Micros, true)
}

#[derive(Clone, Debug)]
struct Revision {
    tree: Tree,
    props: PropertyList,
    changes: BTreeMap<String, ChangedPath>,
}

#[derive(Debug)]
struct RepoState {
    revisions: Vec<Revision>,
    locks: BTreeMap<String, Lock>,
}

impl RepoState {
    fn revision(&self, rev: Revnum) -> Result<&Revision, SvnError> {
        usize::try_from(rev)
            .ok()
            .and_then(|idx| self.revisions.get(idx))
            .ok_or_else(|| SvnError::engine(ERR_FS_NOT_FOUND, format!("no such revision {rev}")))
    }

    fn head(&self) -> Revnum {
        Revnum::try_from(self.revisions.len()).unwrap_or(Revnum::MAX) - 1
    }

    fn check_lock_tokens(
        &self,
        txn: &Transaction,
        changes: &BTreeMap<String, ChangedPath>,
    ) -> Result<(), SvnError> {
        for (rel, change) in changes {
            let full = path::join(&txn.anchor, rel);
            let recursive = matches!(change.action, ChangeAction::Deleted | ChangeAction::Replaced);
            for (locked, lock) in &self.locks {
                let hit = if recursive {
                    path::is_ancestor(&full, locked)
                } else {
                    *locked == full
                };
                if !hit {
                    continue;
                }
                match txn.lock_tokens.get(locked) {
                    Some(token) if *token == lock.token => {}
                    Some(_) => {
                        return Err(SvnError::engine(
                            ERR_FS_BAD_LOCK_TOKEN,
                            format!("lock token for '{locked}' does not match"),
                        ));
                    }
                    None => {
                        return Err(SvnError::engine(
                            ERR_FS_BAD_LOCK_TOKEN,
                            format!(
                                "cannot verify lock on path '{locked}'; \
                                 no matching lock-token available"
                            ),
                        ));
                    }
                }
            }
        }
        Ok(())
    }

    fn check_out_of_date(
        &self,
        txn: &Transaction,
        changes: &BTreeMap<String, ChangedPath>,
    ) -> Result<(), SvnError> {
        let head = self.head();
        for rev in (txn.base_rev + 1)..=head {
            let later = &self.revision(rev)?.changes;
            for rel in changes.keys() {
                let full = path::join(&txn.anchor, rel);
                if later
                    .keys()
                    .any(|other| path::is_ancestor(&full, other) || path::is_ancestor(other, &full))
                {
                    return Err(SvnError::engine(
                        ERR_FS_TXN_OUT_OF_DATE,
                        format!("'{full}' is out of date (changed in r{rev})"),
                    ));
                }
            }
        }
        Ok(())
    }
}

fn apply_change(
    head: &mut Tree,
    txn: &Transaction,
    rel: &str,
    change: &ChangedPath,
) -> Result<(), SvnError> {
    let full = path::join(&txn.anchor, rel);
    match change.action {
        ChangeAction::Deleted => {
            head.remove(&full);
        }
        ChangeAction::Added | ChangeAction::Replaced => {
            let node = txn.tree.get(rel).cloned().ok_or_else(|| {
                SvnError::engine(ERR_FS_NOT_FOUND, format!("'{rel}' missing from transaction"))
            })?;
            head.remove(&full);
            head.insert(&full, node)?;
        }
        ChangeAction::Modified => {
            let node = node_in(&txn.tree, rel).ok_or_else(|| {
                SvnError::engine(ERR_FS_NOT_FOUND, format!("'{rel}' missing from transaction"))
            })?;
            match node {
                Node::File(file) => {
                    head.insert(&full, Node::File(file))?;
                }
                Node::Dir(dir) => {
                    let current = node_in(head, &full)
                        .map(|node| node.props().clone())
                        .unwrap_or_default();
                    for name in current.keys().filter(|name| !dir.props.contains_key(*name)) {
                        head.set_prop(&full, name, None)?;
                    }
                    for (name, value) in dir.props {
                        head.set_prop(&full, &name, Some(value))?;
                    }
                }
            }
        }
    }
    Ok(())
}

/// Repository held entirely in memory.
///
/// Revision 0 is an empty root directory.
#[derive(Debug)]
pub struct MemRepository {
    uuid: String,
    root_url: String,
    capabilities: BTreeSet<Capability>,
    state: Mutex<RepoState>,
    lock_seq: AtomicU64,
}

impl Default for MemRepository {
    fn default() -> Self {
        Self::new()
    }
}

impl MemRepository {
    /// Creates a repository at revision 0 with every capability.
    pub fn new() -> Self {
        let created = format_date(Utc::now());
        let uuid = opaque_uuid(&format!("repository {created}"));
        let mut props = PropertyList::new();
        props.insert(PROP_REVISION_DATE.to_string(), created.into_bytes());
        Self {
            root_url: format!("mem://{uuid}"),
            uuid,
            capabilities: [
                Capability::Depth,
                Capability::MergeInfo,
                Capability::LogRevProps,
                Capability::AbsentEntries,
                Capability::CommitRevProps,
                Capability::PartialReplay,
                Capability::Svndiff1,
                Capability::AcceptsSvndiff2,
            ]
            .into_iter()
            .collect(),
            state: Mutex::new(RepoState {
                revisions: vec![Revision {
                    tree: Tree::new(),
                    props,
                    changes: BTreeMap::new(),
                }],
                locks: BTreeMap::new(),
            }),
            lock_seq: AtomicU64::new(0),
        }
    }

    /// Sets the root URL.
    #[must_use]
    pub fn with_root_url(mut self, root_url: impl Into<String>) -> Self {
        self.root_url = root_url.into().trim_end_matches('/').to_string();
        self
    }

    /// Restricts the announced capabilities.
    #[must_use]
    pub fn with_capabilities(mut self, capabilities: impl IntoIterator<Item = Capability>) -> Self {
        self.capabilities = capabilities.into_iter().collect();
        self
    }

    fn state(&self) -> Result<std::sync::MutexGuard<'_, RepoState>, SvnError> {
        self.state
            .lock()
            .map_err(|_| SvnError::Protocol("repository lock poisoned".into()))
    }

    /// Commits a change to the whole repository built by `edit`.
    ///
    /// `edit` receives a transaction based on HEAD and anchored at the root.
    pub fn commit_with(
        &self,
        author: &str,
        message: &str,
        edit: impl FnOnce(&mut Transaction) -> Result<(), SvnError>,
    ) -> Result<CommitInfo, SvnError> {
        let head = self.latest_revnum()?;
        let mut txn = Transaction::new(head, "", self.tree_at(head)?);
        txn.set_rev_prop(PROP_REVISION_AUTHOR, author);
        txn.set_rev_prop(PROP_REVISION_LOG, message);
        edit(&mut txn)?;
        self.commit(txn)
    }
}

fn opaque_uuid(seed: &str) -> String {
    let digest = hex::encode(Md5::digest(seed.as_bytes()));
    format!(
        "{}-{}-{}-{}-{}",
        &digest[..8],
        &digest[8..12],
        &digest[12..16],
        &digest[16..20],
        &digest[20..32]
    )
}

impl CopySource for MemRepository {
    fn copy_source(&self, from: &CopyFrom) -> Result<Node, SvnError> {
        self.node_at(&from.path, from.rev)?.ok_or_else(|| {
            SvnError::engine(
                ERR_FS_NOT_FOUND,
                format!("path '{}' not found in revision {}", from.path, from.rev),
            )
        })
    }
}

impl Repository for MemRepository {
    fn uuid(&self) -> &str {
        &self.uuid
    }

    fn root_url(&self) -> &str {
        &self.root_url
    }

    fn capabilities(&self) -> BTreeSet<Capability> {
        self.capabilities.clone()
    }

    fn latest_revnum(&self) -> Result<Revnum, SvnError> {
        Ok(self.state()?.head())
    }

    fn tree_at(&self, rev: Revnum) -> Result<Tree, SvnError> {
        Ok(self.state()?.revision(rev)?.tree.clone())
    }

    fn node_at(&self, path: &str, rev: Revnum) -> Result<Option<Node>, SvnError> {
        let state = self.state()?;
        Ok(node_in(&state.revision(rev)?.tree, path))
    }

    fn check_path(&self, path: &str, rev: Revnum) -> Result<NodeKind, SvnError> {
        let state = self.state()?;
        Ok(state.revision(rev)?.tree.kind(path))
    }

    fn created_rev(&self, path: &str, rev: Revnum) -> Result<Revnum, SvnError> {
        let state = self.state()?;
        if state.revision(rev)?.tree.kind(path) == NodeKind::None {
            return Err(SvnError::engine(
                ERR_FS_NOT_FOUND,
                format!("path '{path}' not found in revision {rev}"),
            ));
        }
        for r in (1..=rev).rev() {
            let changes = &state.revision(r)?.changes;
            let touched = changes.iter().any(|(changed, change)| {
                path::is_ancestor(path, changed)
                    || (path::is_ancestor(changed, path)
                        && matches!(change.action, ChangeAction::Added | ChangeAction::Replaced))
            });
            if touched {
                return Ok(r);
            }
        }
        Ok(0)
    }

    fn rev_props(&self, rev: Revnum) -> Result<PropertyList, SvnError> {
        Ok(self.state()?.revision(rev)?.props.clone())
    }

    fn changed_paths(&self, rev: Revnum) -> Result<BTreeMap<String, ChangedPath>, SvnError> {
        Ok(self.state()?.revision(rev)?.changes.clone())
    }

    fn commit(&self, txn: Transaction) -> Result<CommitInfo, SvnError> {
        let mut state = self.state()?;
        let head = state.head();
        if txn.base_rev > head || txn.base_rev < 0 {
            return Err(SvnError::engine(
                ERR_FS_NOT_FOUND,
                format!("no such revision {}", txn.base_rev),
            ));
        }
        let changes = txn.changes();
        state.check_out_of_date(&txn, &changes)?;
        state.check_lock_tokens(&txn, &changes)?;

        let mut tree = state.revision(head)?.tree.clone();
        for (rel, change) in &changes {
            apply_change(&mut tree, &txn, rel, change)?;
        }

        let date = format_date(Utc::now());
        let mut props = txn.rev_props.clone();
        props.insert(PROP_REVISION_DATE.to_string(), date.clone().into_bytes());
        let author = props
            .get(PROP_REVISION_AUTHOR)
            .map(|value| String::from_utf8_lossy(value).into_owned());
        let full_changes = changes
            .into_iter()
            .map(|(rel, change)| (path::join(&txn.anchor, &rel), change))
            .collect();
        state.revisions.push(Revision {
            tree,
            props,
            changes: full_changes,
        });
        if !txn.keep_locks {
            for (locked, token) in &txn.lock_tokens {
                if state.locks.get(locked).is_some_and(|lock| lock.token == *token) {
                    state.locks.remove(locked);
                }
            }
        }
        let new_rev = state.head();
        tracing::debug!(new_rev, anchor = %txn.anchor, "committed revision");
        Ok(CommitInfo {
            new_rev,
            date: Some(date),
            author,
            post_commit_err: None,
        })
    }

    fn lock(&self, path: &str, owner: &str, options: &LockOptions) -> Result<Lock, SvnError> {
        let path = path::validate_rel_path(path)?;
        let mut state = self.state()?;
        let head = state.head();
        match state.revision(head)?.tree.kind(&path) {
            NodeKind::File => {}
            NodeKind::None => {
                return Err(SvnError::engine(
                    ERR_FS_NOT_FOUND,
                    format!("path '{path}' doesn't exist in HEAD revision"),
                ));
            }
            kind => {
                return Err(SvnError::engine(
                    ERR_NODE_UNEXPECTED_KIND,
                    format!("cannot lock '{path}': it is a {kind}"),
                ));
            }
        }
        if let Some(current) = options.current_rev {
            drop(state);
            let created = self.created_rev(&path, head)?;
            if created > current {
                return Err(SvnError::engine(
                    ERR_FS_TXN_OUT_OF_DATE,
                    format!("path '{path}' is out of date (changed in r{created})"),
                ));
            }
            state = self.state()?;
        }
        if let Some(existing) = state.locks.get(&path)
            && !options.steal_lock
        {
            return Err(SvnError::engine(
                ERR_FS_PATH_ALREADY_LOCKED,
                format!("path '{path}' is already locked by user '{}'", existing.owner),
            ));
        }

        let now = Utc::now();
        let seq = self.lock_seq.fetch_add(1, Ordering::Relaxed);
        let lock = Lock {
            path: path.clone(),
            token: format!(
                "opaquelocktoken:{}",
                opaque_uuid(&format!("{}:{path}:{seq}:{}", self.uuid, format_date(now)))
            ),
            owner: owner.to_string(),
            comment: options.comment.clone(),
            is_dav_comment: false,
            creation_date: format_date(now),
            expiration_date: None,
        };
        state.locks.insert(path, lock.clone());
        Ok(lock)
    }

    fn unlock(&self, path: &str, options: &UnlockOptions) -> Result<(), SvnError> {
        let path = path::validate_rel_path(path)?;
        let mut state = self.state()?;
        let Some(lock) = state.locks.get(&path) else {
            return Err(SvnError::engine(
                ERR_FS_NO_SUCH_LOCK,
                format!("no lock on path '{path}'"),
            ));
        };
        if !options.break_lock && options.token.as_deref() != Some(lock.token.as_str()) {
            return Err(SvnError::engine(
                ERR_FS_BAD_LOCK_TOKEN,
                format!("cannot unlock path '{path}': token mismatch"),
            ));
        }
        state.locks.remove(&path);
        Ok(())
    }

    fn get_lock(&self, path: &str) -> Result<Option<Lock>, SvnError> {
        let path = path::validate_rel_path(path)?;
        Ok(self.state()?.locks.get(&path).cloned())
    }

    fn get_locks(&self, path: &str, depth: Depth) -> Result<Vec<Lock>, SvnError> {
        let path = path::validate_rel_dir_path(path)?;
        let state = self.state()?;
        let head = &state.revision(state.head())?.tree;
        let locks = state
            .locks
            .values()
            .filter(|lock| match path::skip_ancestor(&path, &lock.path) {
                None => false,
                Some("") => true,
                Some(rest) => match depth {
                    Depth::Empty => false,
                    Depth::Files => !rest.contains('/') && head.kind(&lock.path) == NodeKind::File,
                    Depth::Immediates => !rest.contains('/'),
                    Depth::Infinity => true,
                },
            })
            .cloned()
            .collect();
        Ok(locks)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::tree::FileNode;

    fn seeded() -> MemRepository {
        let repo = MemRepository::new();
        repo.commit_with("alice", "import", |txn| {
            txn.tree.put_file("trunk/README", "hello\n")?;
            txn.tree.put_file("trunk/src/main.c", "int main;\n")?;
            txn.tree.mkdir_p("branches")
        })
        .unwrap();
        repo
    }

    #[test]
    fn commits_record_trees_props_and_changes() {
        let repo = seeded();
        assert_eq!(repo.latest_revnum().unwrap(), 1);
        assert_eq!(repo.check_path("trunk/README", 1).unwrap(), NodeKind::File);
        assert_eq!(repo.check_path("trunk/README", 0).unwrap(), NodeKind::None);

        let props = repo.rev_props(1).unwrap();
        assert_eq!(props.get(PROP_REVISION_AUTHOR).unwrap(), b"alice");
        assert!(props.contains_key(PROP_REVISION_DATE));

        let changes = repo.changed_paths(1).unwrap();
        assert_eq!(changes["trunk"].action, ChangeAction::Added);
        assert_eq!(changes["trunk/README"].node_kind, NodeKind::File);
        assert!(changes["trunk/README"].text_mods);
        assert!(repo.changed_paths(7).is_err());
    }

    #[test]
    fn copies_are_listed_once_with_history() {
        let repo = seeded();
        let trunk = repo.copy_source(&CopyFrom::new("trunk", 1)).unwrap();
        repo.commit_with("bob", "branch", |txn| {
            txn.copy(CopyFrom::new("trunk", 1), trunk, "branches/b1")?;
            txn.tree.put_file("branches/b1/NEW", "new")
        })
        .unwrap();

        let changes = repo.changed_paths(2).unwrap();
        assert_eq!(changes.len(), 2);
        assert_eq!(changes["branches/b1"].copy_from, Some(CopyFrom::new("trunk", 1)));
        assert_eq!(changes["branches/b1/NEW"].action, ChangeAction::Added);
        assert_eq!(repo.created_rev("branches/b1/README", 2).unwrap(), 2);
        assert_eq!(repo.created_rev("trunk/README", 2).unwrap(), 1);
    }

    #[test]
    fn stale_transactions_are_out_of_date() {
        let repo = seeded();
        let base = repo.tree_at(1).unwrap();
        repo.commit_with("alice", "edit", |txn| txn.tree.put_file("trunk/README", "v2\n"))
            .unwrap();

        let mut stale = Transaction::new(1, "", base.clone());
        stale.tree.put_file("trunk/README", "v2 too\n").unwrap();
        let err = repo.commit(stale).unwrap_err();
        assert_eq!(err.engine_code(), Some(ERR_FS_TXN_OUT_OF_DATE));

        let mut unrelated = Transaction::new(1, "", base);
        unrelated.tree.put_file("trunk/src/main.c", "int main(void);\n").unwrap();
        let info = repo.commit(unrelated).unwrap();
        assert_eq!(info.new_rev, 3);
        let head = repo.tree_at(3).unwrap();
        assert_eq!(head.file("trunk/README").unwrap(), &FileNode::new("v2\n"));
        assert_eq!(head.file("trunk/src/main.c").unwrap().contents, b"int main(void);\n");
    }

    #[test]
    fn locks_guard_commits() {
        let repo = seeded();
        let lock = repo
            .lock("trunk/README", "alice", &LockOptions::new().with_comment("mine"))
            .unwrap();
        assert!(lock.token.starts_with("opaquelocktoken:"));

        let err = repo.lock("trunk/README", "bob", &LockOptions::new()).unwrap_err();
        assert_eq!(err.engine_code(), Some(ERR_FS_PATH_ALREADY_LOCKED));

        let err = repo
            .commit_with("bob", "no token", |txn| txn.tree.put_file("trunk/README", "x"))
            .unwrap_err();
        assert_eq!(err.engine_code(), Some(ERR_FS_BAD_LOCK_TOKEN));

        // Deleting a parent needs the tokens of locks below it.
        let err = repo
            .commit_with("bob", "rm", |txn| {
                txn.tree.remove("trunk");
                Ok(())
            })
            .unwrap_err();
        assert_eq!(err.engine_code(), Some(ERR_FS_BAD_LOCK_TOKEN));

        repo.commit_with("alice", "with token", |txn| {
            txn.lock_tokens.insert("trunk/README".into(), lock.token.clone());
            txn.tree.put_file("trunk/README", "x")
        })
        .unwrap();
        assert_eq!(repo.get_lock("trunk/README").unwrap(), None);
    }

    #[test]
    fn unlock_checks_tokens_unless_breaking() {
        let repo = seeded();
        let lock = repo.lock("trunk/README", "alice", &LockOptions::new()).unwrap();
        let err = repo
            .unlock("trunk/README", &UnlockOptions::new().with_token("bogus"))
            .unwrap_err();
        assert_eq!(err.engine_code(), Some(ERR_FS_BAD_LOCK_TOKEN));
        repo.unlock("trunk/README", &UnlockOptions::new().with_token(lock.token))
            .unwrap();
        let err = repo.unlock("trunk/README", &UnlockOptions::new().break_lock()).unwrap_err();
        assert_eq!(err.engine_code(), Some(ERR_FS_NO_SUCH_LOCK));
    }

    #[test]
    fn get_locks_follows_depth() {
        let repo = seeded();
        repo.lock("trunk/README", "alice", &LockOptions::new()).unwrap();
        repo.lock("trunk/src/main.c", "alice", &LockOptions::new()).unwrap();

        let paths = |depth| -> Vec<String> {
            repo.get_locks("trunk", depth)
                .unwrap()
                .into_iter()
                .map(|lock| lock.path)
                .collect()
        };
        assert!(paths(Depth::Empty).is_empty());
        assert_eq!(paths(Depth::Files), vec!["trunk/README".to_string()]);
        assert_eq!(paths(Depth::Infinity).len(), 2);
        assert!(repo.lock("trunk", "alice", &LockOptions::new()).is_err());
    }
}
