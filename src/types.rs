//! Public data types shared by the editor, reporter and session layers.

use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

use crate::SvnError;

/// A revision number.
///
/// Real revisions are non-negative. [`INVALID_REVNUM`] (or any negative
/// value) means "unspecified"; APIs model that as `None`.
pub type Revnum = i64;

/// The "unspecified revision" marker.
pub const INVALID_REVNUM: Revnum = -1;

/// Maps a possibly-negative revision to `None`.
pub fn normalize_revnum(rev: Option<Revnum>) -> Option<Revnum> {
    rev.filter(|rev| *rev >= 0)
}

/// A Subversion property list (`name -> raw bytes`).
///
/// Property values can be binary; callers should treat the value as opaque
/// bytes unless they know it is UTF-8.
pub type PropertyList = BTreeMap<String, Vec<u8>>;

/// A single property change (name + new value).
///
/// `value == None` is a tombstone: the property is deleted.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PropChange {
    /// Property name.
    pub name: String,
    /// New property value (raw bytes), or `None` to delete.
    pub value: Option<Vec<u8>>,
}

impl PropChange {
    /// A change setting `name` to `value`.
    pub fn set(name: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            value: Some(value.into()),
        }
    }

    /// A change deleting `name`.
    pub fn delete(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: None,
        }
    }

    /// Applies this change to `props`.
    pub fn apply_to(&self, props: &mut PropertyList) {
        match &self.value {
            Some(value) => {
                props.insert(self.name.clone(), value.clone());
            }
            None => {
                props.remove(&self.name);
            }
        }
    }
}

/// Copy source for a copy-based add.
///
/// Either both the path and revision are known, or the add is a plain add
/// (`Option<CopyFrom>::None`).
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CopyFrom {
    /// Repository-relative source path.
    pub path: String,
    /// Source revision.
    pub rev: Revnum,
}

impl CopyFrom {
    /// Creates a copy source.
    pub fn new(path: impl Into<String>, rev: Revnum) -> Self {
        Self {
            path: path.into(),
            rev,
        }
    }

    /// Builds a copy source from separately supplied parts.
    ///
    /// Both absent yields `None`; exactly one present is a caller error.
    pub fn from_parts(path: Option<&str>, rev: Option<Revnum>) -> Result<Option<Self>, SvnError> {
        match (path, normalize_revnum(rev)) {
            (None, None) => Ok(None),
            (Some(path), Some(rev)) => Ok(Some(Self::new(
                crate::path::validate_rel_dir_path(path)?,
                rev,
            ))),
            (Some(_), None) => Err(SvnError::Protocol(
                "copyfrom path given without copyfrom revision".into(),
            )),
            (None, Some(_)) => Err(SvnError::Protocol(
                "copyfrom revision given without copyfrom path".into(),
            )),
        }
    }
}

/// A server-held exclusive lock on a repository path.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Lock {
    /// Repository-relative path (no leading `/`) that is locked.
    pub path: String,
    /// Opaque lock token.
    pub token: String,
    /// Lock owner.
    pub owner: String,
    /// Optional lock comment.
    pub comment: Option<String>,
    /// Whether the comment was supplied by a DAV client.
    pub is_dav_comment: bool,
    /// Creation date (RFC 3339).
    pub creation_date: String,
    /// Expiration date (RFC 3339), if the lock expires.
    pub expiration_date: Option<String>,
}

/// The result of a successful commit.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommitInfo {
    /// The new committed revision number.
    pub new_rev: Revnum,
    /// Commit date (RFC 3339), if known.
    pub date: Option<String>,
    /// Commit author, if known.
    pub author: Option<String>,
    /// Post-commit error, if any.
    pub post_commit_err: Option<String>,
}

/// A log entry.
///
/// Revision properties are always delivered as a full map; `svn:author`,
/// `svn:date` and `svn:log` are available through the accessors.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogEntry {
    /// Revision number.
    pub rev: Revnum,
    /// Changed paths, keyed by repository path (empty if not requested).
    pub changed_paths: BTreeMap<String, ChangedPath>,
    /// Revision properties.
    pub rev_props: PropertyList,
    /// Whether this entry has merged child entries.
    pub has_children: bool,
}

impl LogEntry {
    fn rev_prop_str(&self, name: &str) -> Option<String> {
        self.rev_props
            .get(name)
            .map(|value| String::from_utf8_lossy(value).into_owned())
    }

    /// The `svn:author` revision property.
    pub fn author(&self) -> Option<String> {
        self.rev_prop_str(PROP_REVISION_AUTHOR)
    }

    /// The `svn:date` revision property.
    pub fn date(&self) -> Option<String> {
        self.rev_prop_str(PROP_REVISION_DATE)
    }

    /// The `svn:log` revision property.
    pub fn message(&self) -> Option<String> {
        self.rev_prop_str(PROP_REVISION_LOG)
    }
}

/// Revision property holding the commit author.
pub const PROP_REVISION_AUTHOR: &str = "svn:author";
/// Revision property holding the commit date.
pub const PROP_REVISION_DATE: &str = "svn:date";
/// Revision property holding the commit message.
pub const PROP_REVISION_LOG: &str = "svn:log";

/// A single path change entry within a [`LogEntry`].
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChangedPath {
    /// Change action.
    pub action: ChangeAction,
    /// Copy source, if this change was made by a copy.
    pub copy_from: Option<CopyFrom>,
    /// Node kind of the changed path.
    pub node_kind: NodeKind,
    /// Whether text was modified.
    pub text_mods: bool,
    /// Whether props were modified.
    pub prop_mods: bool,
}

/// The kind of change recorded for a path in a revision.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ChangeAction {
    /// `A`
    Added,
    /// `D`
    Deleted,
    /// `M`
    Modified,
    /// `R`
    Replaced,
}

impl ChangeAction {
    /// The single-letter action code.
    pub fn as_char(self) -> char {
        match self {
            Self::Added => 'A',
            Self::Deleted => 'D',
            Self::Modified => 'M',
            Self::Replaced => 'R',
        }
    }
}

/// The kind of a node in the repository.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum NodeKind {
    /// No node exists at the requested path/revision.
    None,
    /// A file node.
    File,
    /// A directory node.
    Dir,
    /// An unknown kind.
    Unknown,
}

impl NodeKind {
    /// Returns a stable string representation.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::File => "file",
            Self::Dir => "dir",
            Self::Unknown => "unknown",
        }
    }
}

impl Display for NodeKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Subversion depth value.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Ord, PartialOrd)]
pub enum Depth {
    /// Exclude entries (the target itself only).
    Empty,
    /// Include file children.
    Files,
    /// Include immediate children (files and dirs) but not recurse.
    Immediates,
    /// Fully recursive.
    #[default]
    Infinity,
}

impl Depth {
    /// Returns the protocol word for this depth.
    pub fn as_word(self) -> &'static str {
        match self {
            Self::Empty => "empty",
            Self::Files => "files",
            Self::Immediates => "immediates",
            Self::Infinity => "infinity",
        }
    }

    /// Parses a protocol depth word.
    pub fn from_word(word: &str) -> Option<Self> {
        match word {
            "empty" => Some(Self::Empty),
            "files" => Some(Self::Files),
            "immediates" => Some(Self::Immediates),
            "infinity" => Some(Self::Infinity),
            _ => None,
        }
    }
}

/// A capability an engine may announce when a session is opened.
///
/// Capabilities are queried once per session and gate optional features at
/// runtime.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Ord, PartialOrd)]
pub enum Capability {
    /// Support for depth other than `infinity` in reports.
    Depth,
    /// Support for mergeinfo queries.
    MergeInfo,
    /// Support for requesting custom revision properties from `log`.
    LogRevProps,
    /// Support for `absent-dir` / `absent-file` editor calls.
    AbsentEntries,
    /// Support for setting revision properties during commit.
    CommitRevProps,
    /// Support for partial replay (replay below a low-water mark).
    PartialReplay,
    /// Support for svndiff1 deltas.
    Svndiff1,
    /// Support for svndiff2 deltas.
    AcceptsSvndiff2,
}

impl Capability {
    /// Returns the protocol word for this capability.
    pub fn as_wire_word(self) -> &'static str {
        match self {
            Self::Depth => "depth",
            Self::MergeInfo => "mergeinfo",
            Self::LogRevProps => "log-revprops",
            Self::AbsentEntries => "absent-entries",
            Self::CommitRevProps => "commit-revprops",
            Self::PartialReplay => "partial-replay",
            Self::Svndiff1 => "svndiff1",
            Self::AcceptsSvndiff2 => "accepts-svndiff2",
        }
    }
}
