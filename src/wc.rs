//! Working-copy metadata and the crawl that describes it to a reporter.

use std::collections::BTreeMap;

use crate::error::ERR_ENTRY_NOT_FOUND;
use crate::reporter::Reporter;
use crate::tree::{Node, Tree};
use crate::{Depth, NodeKind, PropertyList, Revnum, SvnError, path};

/// How a working-copy entry is scheduled for the next commit.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum Schedule {
    /// No pending change.
    #[default]
    Normal,
    /// Scheduled for addition.
    Add,
    /// Scheduled for deletion.
    Delete,
    /// Scheduled for replacement.
    Replace,
}

/// Metadata the working copy keeps for one versioned path.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WcEntry {
    /// Node kind.
    pub kind: NodeKind,
    /// Base revision.
    pub revision: Revnum,
    /// Repository path the entry is checked out from.
    pub repos_path: String,
    /// Pending change.
    pub schedule: Schedule,
    /// A checkout or update of this directory did not complete.
    pub incomplete: bool,
    /// The entry is versioned but gone from disk.
    pub missing: bool,
    /// Depth of a directory entry.
    pub depth: Depth,
    /// Working-copy (cached server) properties.
    pub wcprops: PropertyList,
    /// Token of a lock held on the path.
    pub lock_token: Option<String>,
    /// Changelist the entry belongs to.
    pub changelist: Option<String>,
    /// MD5 of the base text (files).
    pub checksum: Option<String>,
    /// Revision of the last commit.
    pub cmt_rev: Option<Revnum>,
    /// Date of the last commit.
    pub cmt_date: Option<String>,
    /// Author of the last commit.
    pub cmt_author: Option<String>,
}

impl WcEntry {
    fn new(kind: NodeKind, repos_path: impl Into<String>, revision: Revnum) -> Self {
        Self {
            kind,
            revision,
            repos_path: repos_path.into(),
            schedule: Schedule::Normal,
            incomplete: false,
            missing: false,
            depth: Depth::Infinity,
            wcprops: PropertyList::new(),
            lock_token: None,
            changelist: None,
            checksum: None,
            cmt_rev: None,
            cmt_date: None,
            cmt_author: None,
        }
    }

    /// A directory checked out from `repos_path@revision`.
    pub fn dir(repos_path: impl Into<String>, revision: Revnum) -> Self {
        Self::new(NodeKind::Dir, repos_path, revision)
    }

    /// A file checked out from `repos_path@revision`.
    pub fn file(repos_path: impl Into<String>, revision: Revnum) -> Self {
        Self::new(NodeKind::File, repos_path, revision)
    }
}

/// Storage for working-copy metadata.
///
/// Paths are relative to the working-copy root (`""`).
pub trait WcAdmin {
    /// URL of the repository root the working copy belongs to.
    fn repos_root_url(&self) -> &str;

    /// Returns the entry for `path`.
    fn entry(&self, path: &str) -> Result<Option<WcEntry>, SvnError>;

    /// Returns the direct children of directory `dir`, sorted by path.
    fn entries(&self, dir: &str) -> Result<Vec<(String, WcEntry)>, SvnError>;

    /// Creates or replaces the entry for `path`. The parent must exist.
    fn set_entry(&mut self, path: &str, entry: WcEntry) -> Result<(), SvnError>;

    /// Removes `path` and everything below it.
    fn remove_entry(&mut self, path: &str) -> Result<(), SvnError>;

    /// Returns every path below `path`, parents before children.
    fn descendants(&self, path: &str) -> Result<Vec<String>, SvnError>;
}

/// In-memory [`WcAdmin`].
#[derive(Clone, Debug)]
pub struct MemWcAdmin {
    root_url: String,
    entries: BTreeMap<String, WcEntry>,
}

impl MemWcAdmin {
    /// Creates a working copy whose root directory has entry `root`.
    pub fn new(root_url: impl Into<String>, root: WcEntry) -> Self {
        Self {
            root_url: root_url.into(),
            entries: BTreeMap::from([(String::new(), root)]),
        }
    }

    /// Creates the metadata of a checkout of `repos_path@rev`, whose
    /// contents are `tree`.
    pub fn checkout(
        root_url: impl Into<String>,
        repos_path: &str,
        rev: Revnum,
        tree: &Tree,
    ) -> Self {
        let mut admin = Self::new(root_url, WcEntry::dir(repos_path, rev));
        for at in tree.paths() {
            let Some(node) = tree.get(&at) else {
                continue;
            };
            let repos = path::join(repos_path, &at);
            let entry = match node {
                Node::Dir(_) => WcEntry::dir(repos, rev),
                Node::File(file) => WcEntry {
                    checksum: Some(file.checksum()),
                    ..WcEntry::file(repos, rev)
                },
            };
            admin.entries.insert(at, entry);
        }
        admin
    }

    /// Number of entries, the root included.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Always `false`: the root entry cannot be removed.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl WcAdmin for MemWcAdmin {
    fn repos_root_url(&self) -> &str {
        &self.root_url
    }

    fn entry(&self, path: &str) -> Result<Option<WcEntry>, SvnError> {
        let path = path::validate_rel_dir_path(path)?;
        Ok(self.entries.get(&path).cloned())
    }

    fn entries(&self, dir: &str) -> Result<Vec<(String, WcEntry)>, SvnError> {
        let dir = path::validate_rel_dir_path(dir)?;
        Ok(self
            .entries
            .iter()
            .filter(|(at, _)| path::is_child_of(&dir, at))
            .map(|(at, entry)| (at.clone(), entry.clone()))
            .collect())
    }

    fn set_entry(&mut self, path: &str, entry: WcEntry) -> Result<(), SvnError> {
        let path = path::validate_rel_dir_path(path)?;
        if !path.is_empty() {
            let parent = path::dirname(&path);
            match self.entries.get(parent) {
                Some(parent) if parent.kind == NodeKind::Dir => {}
                _ => {
                    return Err(SvnError::engine(
                        ERR_ENTRY_NOT_FOUND,
                        format!("'{parent}' is not a versioned directory"),
                    ));
                }
            }
        }
        self.entries.insert(path, entry);
        Ok(())
    }

    fn remove_entry(&mut self, path: &str) -> Result<(), SvnError> {
        let path = path::validate_rel_path(path)?;
        if self.entries.remove(&path).is_none() {
            return Err(SvnError::engine(
                ERR_ENTRY_NOT_FOUND,
                format!("'{path}' is not under version control"),
            ));
        }
        self.entries.retain(|at, _| !path::is_ancestor(&path, at));
        Ok(())
    }

    fn descendants(&self, path: &str) -> Result<Vec<String>, SvnError> {
        let path = path::validate_rel_dir_path(path)?;
        Ok(self
            .entries
            .keys()
            .filter(|at| *at != &path && path::is_ancestor(&path, at))
            .cloned()
            .collect())
    }
}

/// Describes the working copy in `admin` to `reporter` and finishes the
/// report.
///
/// The root is reported at its revision (start-empty if incomplete). Below
/// it, only entries that differ from what their parent implies are
/// reported: other revisions, locks, depths and incomplete directories with
/// `set_path`, switched entries with `link_path`, missing entries with
/// `delete_path`. Entries scheduled for addition are not in the repository
/// and are skipped. On error the reporter is aborted.
pub fn crawl_revisions(admin: &dyn WcAdmin, reporter: &mut Reporter<'_>) -> Result<(), SvnError> {
    match report_working_copy(admin, reporter) {
        Ok(reported) => {
            tracing::debug!(reported, "working copy crawled");
            reporter.finish()
        }
        Err(err) => {
            if let Err(abort_err) = reporter.abort() {
                tracing::warn!(error = %abort_err, "aborting report after a failed crawl");
            }
            Err(err)
        }
    }
}

fn report_working_copy(
    admin: &dyn WcAdmin,
    reporter: &mut Reporter<'_>,
) -> Result<usize, SvnError> {
    let root = admin
        .entry("")?
        .ok_or_else(|| SvnError::engine(ERR_ENTRY_NOT_FOUND, "working copy root has no entry"))?;
    reporter.set_path("", root.revision, root.incomplete, root.lock_token.as_deref(), root.depth)?;
    let mut reported = 1;
    if root.depth != Depth::Empty {
        report_dir(admin, reporter, "", &root, &mut reported)?;
    }
    Ok(reported)
}

fn repos_url(root_url: &str, repos_path: &str) -> String {
    if repos_path.is_empty() {
        root_url.to_string()
    } else {
        format!("{}/{repos_path}", root_url.trim_end_matches('/'))
    }
}

fn report_dir(
    admin: &dyn WcAdmin,
    reporter: &mut Reporter<'_>,
    dir: &str,
    parent: &WcEntry,
    reported: &mut usize,
) -> Result<(), SvnError> {
    for (at, entry) in admin.entries(dir)? {
        if matches!(entry.schedule, Schedule::Add) {
            continue;
        }
        if entry.missing {
            reporter.delete_path(&at)?;
            *reported += 1;
            continue;
        }
        let expected = path::join(&parent.repos_path, path::basename(&at));
        if entry.repos_path != expected {
            reporter.link_path(
                &at,
                &repos_url(admin.repos_root_url(), &entry.repos_path),
                entry.revision,
                entry.incomplete,
                entry.lock_token.as_deref(),
                entry.depth,
            )?;
            *reported += 1;
        } else if entry.revision != parent.revision
            || entry.incomplete
            || entry.lock_token.is_some()
            || (entry.kind == NodeKind::Dir && entry.depth != Depth::Infinity)
        {
            reporter.set_path(
                &at,
                entry.revision,
                entry.incomplete,
                entry.lock_token.as_deref(),
                entry.depth,
            )?;
            *reported += 1;
        }
        if entry.kind == NodeKind::Dir && entry.depth != Depth::Empty {
            report_dir(admin, reporter, &at, &entry, reported)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use std::sync::Arc;

    use super::*;
    use crate::options::UpdateOptions;
    use crate::reporter::{Report, ReportCommand};
    use crate::repos::{MemRepository, Repository};
    use crate::tree::TreeEditor;
    use crate::RaSession;

    fn working_tree() -> Tree {
        let mut tree = Tree::new();
        tree.put_file("README", "hello").unwrap();
        tree.put_file("src/main.c", "int main;").unwrap();
        tree.mkdir_p("docs").unwrap();
        tree
    }

    fn crawl(admin: &MemWcAdmin) -> Vec<ReportCommand> {
        let mut report = Report::new();
        {
            let mut reporter = Reporter::new(&mut report);
            crawl_revisions(admin, &mut reporter).unwrap();
        }
        report.commands
    }

    fn set_path(path: &str, rev: Revnum, start_empty: bool) -> ReportCommand {
        ReportCommand::SetPath {
            path: path.into(),
            rev,
            start_empty,
            lock_token: None,
            depth: Depth::Infinity,
        }
    }

    #[test]
    fn uniform_working_copy_reports_only_the_root() {
        let admin = MemWcAdmin::checkout("mem://r", "trunk", 4, &working_tree());
        assert_eq!(crawl(&admin), vec![set_path("", 4, false), ReportCommand::FinishReport]);
    }

    #[test]
    fn mixed_revisions_switches_and_missing_entries_are_reported() {
        let mut admin = MemWcAdmin::checkout("mem://r/", "trunk", 4, &working_tree());
        let mut root = admin.entry("").unwrap().unwrap();
        root.incomplete = true;
        admin.set_entry("", root).unwrap();
        admin.set_entry("README", WcEntry::file("trunk/README", 2)).unwrap();
        admin.set_entry("docs", WcEntry::dir("branches/b/docs", 3)).unwrap();
        admin
            .set_entry(
                "src/main.c",
                WcEntry {
                    missing: true,
                    ..WcEntry::file("trunk/src/main.c", 4)
                },
            )
            .unwrap();
        admin
            .set_entry("NEW", WcEntry { schedule: Schedule::Add, ..WcEntry::file("trunk/NEW", 0) })
            .unwrap();

        assert_eq!(
            crawl(&admin),
            vec![
                set_path("", 4, true),
                set_path("README", 2, false),
                ReportCommand::LinkPath {
                    path: "docs".into(),
                    url: "mem://r/branches/b/docs".into(),
                    rev: 3,
                    start_empty: false,
                    lock_token: None,
                    depth: Depth::Infinity,
                },
                ReportCommand::DeletePath { path: "src/main.c".into() },
                ReportCommand::FinishReport,
            ]
        );
    }

    #[test]
    fn missing_root_aborts_the_report() {
        let mut admin = MemWcAdmin::checkout("mem://r", "", 1, &working_tree());
        admin.entries.clear();
        let mut report = Report::new();
        {
            let mut reporter = Reporter::new(&mut report);
            let err = crawl_revisions(&admin, &mut reporter).unwrap_err();
            assert_eq!(err.engine_code(), Some(ERR_ENTRY_NOT_FOUND));
            assert!(!reporter.is_active());
        }
        assert_eq!(report.commands, vec![ReportCommand::AbortReport]);
    }

    #[test]
    fn set_entry_needs_a_versioned_parent() {
        let mut admin = MemWcAdmin::checkout("mem://r", "", 1, &working_tree());
        let err = admin.set_entry("nowhere/file", WcEntry::file("nowhere/file", 1)).unwrap_err();
        assert_eq!(err.engine_code(), Some(ERR_ENTRY_NOT_FOUND));
        let err = admin.set_entry("README/x", WcEntry::file("README/x", 1)).unwrap_err();
        assert_eq!(err.engine_code(), Some(ERR_ENTRY_NOT_FOUND));
    }

    #[test]
    fn descendants_and_removal() {
        let mut admin = MemWcAdmin::checkout("mem://r", "", 1, &working_tree());
        assert_eq!(admin.descendants("src").unwrap(), vec!["src/main.c".to_string()]);
        assert_eq!(admin.descendants("").unwrap().len(), admin.len() - 1);
        admin.remove_entry("src").unwrap();
        assert_eq!(admin.entry("src/main.c").unwrap(), None);
        assert!(admin.remove_entry("src").is_err());
    }

    #[test]
    fn crawl_drives_an_update_to_head() {
        let repo = MemRepository::new();
        repo.commit_with("alice", "import", |txn| {
            txn.tree.put_file("trunk/README", "v1")?;
            txn.tree.put_file("trunk/lib/x", "x")
        })
        .unwrap();
        repo.commit_with("alice", "edit", |txn| {
            txn.tree.put_file("trunk/README", "v2")?;
            txn.tree.remove("trunk/lib");
            Ok(())
        })
        .unwrap();
        let repo = Arc::new(repo);
        let trunk_r1 = repo.tree_at(1).unwrap().subtree("trunk").unwrap();

        let dyn_repo: Arc<dyn Repository> = repo.clone();
        let session = RaSession::open(dyn_repo, "trunk").unwrap();
        let mut admin = MemWcAdmin::checkout(repo.root_url(), "trunk", 1, &trunk_r1);
        admin
            .set_entry("lib", WcEntry { missing: true, ..WcEntry::dir("trunk/lib", 1) })
            .unwrap();

        let mut working = trunk_r1.clone();
        working.remove("lib");
        let mut consumer = TreeEditor::new(working);
        {
            let mut reporter = session
                .do_update(&UpdateOptions::new("", Depth::Infinity), &mut consumer)
                .unwrap();
            crawl_revisions(&admin, &mut reporter).unwrap();
        }
        assert_eq!(consumer.into_tree(), repo.tree_at(2).unwrap().subtree("trunk").unwrap());
    }
}
