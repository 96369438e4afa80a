//! In-memory versioned trees, an editor consumer that applies edits to one,
//! and a producer that drives an editor with the difference of two trees.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::editor::{BatonId, DirectoryEditor, Editor, EditorSink, FileEditor};
use crate::error::{
    ERR_ENTRY_NOT_FOUND, ERR_FS_ALREADY_EXISTS, ERR_FS_NOT_FOUND, ERR_NODE_UNEXPECTED_KIND,
};
use crate::txdelta::{DeltaGenerator, TextDeltaApplier, md5_hex, send_delta};
use crate::window::DeltaWindow;
use crate::{CopyFrom, Depth, NodeKind, PropertyList, Revnum, SvnError, path};

/// A directory: properties plus named entries.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct DirNode {
    /// Directory properties.
    pub props: PropertyList,
    /// Entries by name.
    pub entries: BTreeMap<String, Node>,
}

/// A file: properties plus contents.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct FileNode {
    /// File properties.
    pub props: PropertyList,
    /// File contents.
    pub contents: Vec<u8>,
}

impl FileNode {
    /// Creates a file with the given contents and no properties.
    pub fn new(contents: impl Into<Vec<u8>>) -> Self {
        Self {
            props: PropertyList::new(),
            contents: contents.into(),
        }
    }

    /// Hex MD5 of the contents.
    pub fn checksum(&self) -> String {
        md5_hex(&self.contents)
    }
}

/// A node in a [`Tree`].
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Node {
    /// A directory.
    Dir(DirNode),
    /// A file.
    File(FileNode),
}

impl Node {
    /// The node kind.
    pub fn kind(&self) -> NodeKind {
        match self {
            Self::Dir(_) => NodeKind::Dir,
            Self::File(_) => NodeKind::File,
        }
    }

    /// The node's properties.
    pub fn props(&self) -> &PropertyList {
        match self {
            Self::Dir(dir) => &dir.props,
            Self::File(file) => &file.props,
        }
    }

    fn props_mut(&mut self) -> &mut PropertyList {
        match self {
            Self::Dir(dir) => &mut dir.props,
            Self::File(file) => &mut file.props,
        }
    }

    /// Returns a copy of this node limited to `depth`.
    pub fn pruned(&self, depth: Depth) -> Node {
        match self {
            Self::File(_) => self.clone(),
            Self::Dir(dir) => Self::Dir(prune_dir(dir, depth)),
        }
    }
}

fn prune_dir(dir: &DirNode, depth: Depth) -> DirNode {
    let entries = match depth {
        Depth::Empty => BTreeMap::new(),
        Depth::Files => dir
            .entries
            .iter()
            .filter(|(_, node)| matches!(node, Node::File(_)))
            .map(|(name, node)| (name.clone(), node.clone()))
            .collect(),
        Depth::Immediates => dir
            .entries
            .iter()
            .map(|(name, node)| (name.clone(), node.pruned(Depth::Empty)))
            .collect(),
        Depth::Infinity => dir.entries.clone(),
    };
    DirNode {
        props: dir.props.clone(),
        entries,
    }
}

/// A versioned tree rooted at a directory.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Tree {
    /// The root directory.
    pub root: DirNode,
}

impl Tree {
    /// Creates an empty tree.
    pub fn new() -> Self {
        Self::default()
    }

    /// Wraps a directory node as a tree.
    pub fn from_dir(root: DirNode) -> Self {
        Self { root }
    }

    /// Looks up a node. The empty path is the root, which is not a [`Node`];
    /// use [`kind`](Self::kind) or [`root`](Self::root) for it.
    pub fn get(&self, path: &str) -> Option<&Node> {
        let path = path::validate_rel_dir_path_ref(path).ok()?;
        if path.is_empty() {
            return None;
        }
        let mut dir = &self.root;
        let mut parts = path.split('/').peekable();
        while let Some(name) = parts.next() {
            let node = dir.entries.get(name)?;
            if parts.peek().is_none() {
                return Some(node);
            }
            match node {
                Node::Dir(child) => dir = child,
                Node::File(_) => return None,
            }
        }
        None
    }

    fn get_mut(&mut self, path: &str) -> Option<&mut Node> {
        let (parent, name) = split_parent(path);
        self.dir_mut(parent)?.entries.get_mut(name)
    }

    /// Looks up a directory; `""` is the root.
    pub fn dir(&self, path: &str) -> Option<&DirNode> {
        if path.is_empty() {
            return Some(&self.root);
        }
        match self.get(path)? {
            Node::Dir(dir) => Some(dir),
            Node::File(_) => None,
        }
    }

    fn dir_mut(&mut self, path: &str) -> Option<&mut DirNode> {
        let mut dir = &mut self.root;
        if path.is_empty() {
            return Some(dir);
        }
        for name in path.split('/') {
            match dir.entries.get_mut(name)? {
                Node::Dir(child) => dir = child,
                Node::File(_) => return None,
            }
        }
        Some(dir)
    }

    /// Looks up a file.
    pub fn file(&self, path: &str) -> Option<&FileNode> {
        match self.get(path)? {
            Node::File(file) => Some(file),
            Node::Dir(_) => None,
        }
    }

    /// Returns the kind of the node at `path` ([`NodeKind::None`] if absent).
    pub fn kind(&self, path: &str) -> NodeKind {
        if path.is_empty() {
            return NodeKind::Dir;
        }
        self.get(path).map_or(NodeKind::None, Node::kind)
    }

    /// Inserts `node` at `path`, replacing whatever was there. The parent
    /// directory must exist.
    pub fn insert(&mut self, path: &str, node: Node) -> Result<Option<Node>, SvnError> {
        let path = path::validate_rel_path(path)?;
        let (parent, name) = split_parent(&path);
        let dir = self.dir_mut(parent).ok_or_else(|| {
            SvnError::engine(ERR_FS_NOT_FOUND, format!("parent directory of '{path}' not found"))
        })?;
        Ok(dir.entries.insert(name.to_string(), node))
    }

    /// Creates directory `path` and any missing parents.
    pub fn mkdir_p(&mut self, path: &str) -> Result<(), SvnError> {
        let path = path::validate_rel_dir_path(path)?;
        let mut dir = &mut self.root;
        if path.is_empty() {
            return Ok(());
        }
        for name in path.split('/') {
            let node = dir
                .entries
                .entry(name.to_string())
                .or_insert_with(|| Node::Dir(DirNode::default()));
            match node {
                Node::Dir(child) => dir = child,
                Node::File(_) => {
                    return Err(SvnError::engine(
                        ERR_NODE_UNEXPECTED_KIND,
                        format!("'{name}' in '{path}' is a file"),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Writes a file at `path`, creating parent directories.
    pub fn put_file(&mut self, path: &str, contents: impl Into<Vec<u8>>) -> Result<(), SvnError> {
        let path = path::validate_rel_path(&path)?;
        self.mkdir_p(path::dirname(&path))?;
        let props = match self.get(&path) {
            Some(Node::File(file)) => file.props.clone(),
            _ => PropertyList::new(),
        };
        self.insert(
            &path,
            Node::File(FileNode {
                props,
                contents: contents.into(),
            }),
        )?;
        Ok(())
    }

    /// Removes and returns the node at `path`.
    pub fn remove(&mut self, path: &str) -> Option<Node> {
        let path = path::validate_rel_path(path).ok()?;
        let (parent, name) = split_parent(&path);
        self.dir_mut(parent)?.entries.remove(name)
    }

    /// Sets (`Some`) or deletes (`None`) a property on the node at `path`.
    pub fn set_prop(
        &mut self,
        path: &str,
        name: &str,
        value: Option<Vec<u8>>,
    ) -> Result<(), SvnError> {
        let path = path::validate_rel_dir_path(path)?;
        let props = if path.is_empty() {
            &mut self.root.props
        } else {
            self.get_mut(&path)
                .ok_or_else(|| {
                    SvnError::engine(ERR_FS_NOT_FOUND, format!("path '{path}' not found"))
                })?
                .props_mut()
        };
        match value {
            Some(value) => props.insert(name.to_string(), value),
            None => props.remove(name),
        };
        Ok(())
    }

    /// Returns every path in the tree (root excluded), parents first.
    pub fn paths(&self) -> Vec<String> {
        let mut out = Vec::new();
        collect_paths(&self.root, "", &mut out);
        out
    }

    /// Returns a copy of the subtree at `path` as its own tree.
    pub fn subtree(&self, path: &str) -> Option<Tree> {
        self.dir(path).map(|dir| Tree::from_dir(dir.clone()))
    }
}

fn split_parent(path: &str) -> (&str, &str) {
    (path::dirname(path), path::basename(path))
}

fn collect_paths(dir: &DirNode, prefix: &str, out: &mut Vec<String>) {
    for (name, node) in &dir.entries {
        let child = path::join(prefix, name);
        out.push(child.clone());
        if let Node::Dir(sub) = node {
            collect_paths(sub, &child, out);
        }
    }
}

/// Resolves the node a copy-based add copies from.
pub trait CopySource {
    /// Returns the node at `from.path` in revision `from.rev`.
    fn copy_source(&self, from: &CopyFrom) -> Result<Node, SvnError>;
}

/// An [`EditorSink`] that applies an edit to a [`Tree`].
///
/// Aborting the edit restores the tree to its state at `open_root`.
pub struct TreeEditor<'s> {
    tree: Tree,
    snapshot: Option<Tree>,
    paths: HashMap<BatonId, String>,
    appliers: HashMap<BatonId, TextDeltaApplier>,
    absent: BTreeSet<String>,
    copy_source: Option<&'s dyn CopySource>,
    target_rev: Option<Revnum>,
}

impl std::fmt::Debug for TreeEditor<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TreeEditor")
            .field("open_batons", &self.paths.len())
            .field("target_rev", &self.target_rev)
            .finish()
    }
}

impl<'s> TreeEditor<'s> {
    /// Creates a consumer editing `tree`.
    pub fn new(tree: Tree) -> Self {
        Self {
            tree,
            snapshot: None,
            paths: HashMap::new(),
            appliers: HashMap::new(),
            absent: BTreeSet::new(),
            copy_source: None,
            target_rev: None,
        }
    }

    /// Resolves copy-based adds through `source`.
    #[must_use]
    pub fn with_copy_source(mut self, source: &'s dyn CopySource) -> Self {
        self.copy_source = Some(source);
        self
    }

    /// The tree as edited so far.
    pub fn tree(&self) -> &Tree {
        &self.tree
    }

    /// Consumes the editor and returns the tree.
    pub fn into_tree(self) -> Tree {
        self.tree
    }

    /// Paths reported absent during the edit.
    pub fn absent_paths(&self) -> &BTreeSet<String> {
        &self.absent
    }

    /// The target revision announced by the producer.
    pub fn target_revision(&self) -> Option<Revnum> {
        self.target_rev
    }

    fn path_of(&self, baton: BatonId) -> Result<&str, SvnError> {
        self.paths
            .get(&baton)
            .map(String::as_str)
            .ok_or_else(|| SvnError::Protocol(format!("unknown baton {baton}")))
    }

    fn add_node(
        &mut self,
        baton: BatonId,
        path: &str,
        copy_from: Option<&CopyFrom>,
        empty: Node,
    ) -> Result<(), SvnError> {
        if self.tree.get(path).is_some() {
            return Err(SvnError::engine(ERR_FS_ALREADY_EXISTS, format!("'{path}' already exists")));
        }
        let node = match copy_from {
            None => empty,
            Some(from) => {
                let source = self.copy_source.ok_or_else(|| {
                    SvnError::engine(
                        ERR_FS_NOT_FOUND,
                        format!("no copy source for '{}@{}'", from.path, from.rev),
                    )
                })?;
                let node = source.copy_source(from)?;
                if node.kind() != empty.kind() {
                    return Err(SvnError::engine(
                        ERR_NODE_UNEXPECTED_KIND,
                        format!("copy source '{}' is a {}", from.path, node.kind()),
                    ));
                }
                node
            }
        };
        self.tree.insert(path, node)?;
        self.paths.insert(baton, path.to_string());
        Ok(())
    }

    fn open_node(&mut self, baton: BatonId, path: &str, kind: NodeKind) -> Result<(), SvnError> {
        match self.tree.kind(path) {
            NodeKind::None => {
                return Err(SvnError::engine(ERR_FS_NOT_FOUND, format!("'{path}' not found")));
            }
            actual if actual != kind => {
                return Err(SvnError::engine(
                    ERR_NODE_UNEXPECTED_KIND,
                    format!("'{path}' is a {actual}, expected a {kind}"),
                ));
            }
            _ => {}
        }
        self.paths.insert(baton, path.to_string());
        Ok(())
    }

    fn change_prop(
        &mut self,
        baton: BatonId,
        name: &str,
        value: Option<&[u8]>,
    ) -> Result<(), SvnError> {
        let path = self.path_of(baton)?.to_string();
        self.tree.set_prop(&path, name, value.map(<[u8]>::to_vec))
    }
}

impl EditorSink for TreeEditor<'_> {
    fn set_target_revision(&mut self, rev: Revnum) -> Result<(), SvnError> {
        self.target_rev = Some(rev);
        Ok(())
    }

    fn open_root(&mut self, root: BatonId, _base_rev: Option<Revnum>) -> Result<(), SvnError> {
        self.snapshot = Some(self.tree.clone());
        self.paths.insert(root, String::new());
        Ok(())
    }

    fn delete_entry(
        &mut self,
        _parent: BatonId,
        path: &str,
        _rev: Option<Revnum>,
    ) -> Result<(), SvnError> {
        self.tree
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| {
                SvnError::engine(
                    ERR_ENTRY_NOT_FOUND,
                    format!("'{path}' is not under version control"),
                )
            })
    }

    fn add_directory(
        &mut self,
        _parent: BatonId,
        child: BatonId,
        path: &str,
        copy_from: Option<&CopyFrom>,
    ) -> Result<(), SvnError> {
        self.add_node(child, path, copy_from, Node::Dir(DirNode::default()))
    }

    fn open_directory(
        &mut self,
        _parent: BatonId,
        child: BatonId,
        path: &str,
        _base_rev: Option<Revnum>,
    ) -> Result<(), SvnError> {
        self.open_node(child, path, NodeKind::Dir)
    }

    fn change_dir_prop(
        &mut self,
        dir: BatonId,
        name: &str,
        value: Option<&[u8]>,
    ) -> Result<(), SvnError> {
        self.change_prop(dir, name, value)
    }

    fn close_directory(&mut self, dir: BatonId) -> Result<(), SvnError> {
        self.paths.remove(&dir);
        Ok(())
    }

    fn absent_directory(&mut self, _parent: BatonId, path: &str) -> Result<(), SvnError> {
        self.absent.insert(path.to_string());
        Ok(())
    }

    fn add_file(
        &mut self,
        _parent: BatonId,
        file: BatonId,
        path: &str,
        copy_from: Option<&CopyFrom>,
    ) -> Result<(), SvnError> {
        self.add_node(file, path, copy_from, Node::File(FileNode::default()))
    }

    fn open_file(
        &mut self,
        _parent: BatonId,
        file: BatonId,
        path: &str,
        _base_rev: Option<Revnum>,
    ) -> Result<(), SvnError> {
        self.open_node(file, path, NodeKind::File)
    }

    fn apply_textdelta(
        &mut self,
        file: BatonId,
        base_checksum: Option<&str>,
    ) -> Result<(), SvnError> {
        let path = self.path_of(file)?.to_string();
        let base = self
            .tree
            .file(&path)
            .map(|node| node.contents.clone())
            .unwrap_or_default();
        let applier = TextDeltaApplier::new(path, base);
        applier.check_base_checksum(base_checksum)?;
        self.appliers.insert(file, applier);
        Ok(())
    }

    fn textdelta_window(&mut self, file: BatonId, window: &DeltaWindow) -> Result<(), SvnError> {
        self.appliers
            .get_mut(&file)
            .ok_or_else(|| SvnError::Protocol(format!("no text delta open for baton {file}")))?
            .apply(window)
    }

    fn textdelta_end(&mut self, file: BatonId) -> Result<Option<String>, SvnError> {
        let applier = self
            .appliers
            .remove(&file)
            .ok_or_else(|| SvnError::Protocol(format!("no text delta open for baton {file}")))?;
        let path = self.path_of(file)?.to_string();
        let (text, checksum) = applier.finish();
        match self.tree.get_mut(&path) {
            Some(Node::File(node)) => node.contents = text,
            _ => return Err(SvnError::engine(ERR_FS_NOT_FOUND, format!("file '{path}' not found"))),
        }
        Ok(Some(checksum))
    }

    fn change_file_prop(
        &mut self,
        file: BatonId,
        name: &str,
        value: Option<&[u8]>,
    ) -> Result<(), SvnError> {
        self.change_prop(file, name, value)
    }

    fn close_file(&mut self, file: BatonId, text_checksum: Option<&str>) -> Result<(), SvnError> {
        let path = self.path_of(file)?.to_string();
        if let Some(expected) = text_checksum
            && let Some(node) = self.tree.file(&path)
        {
            let actual = node.checksum();
            if !actual.eq_ignore_ascii_case(expected) {
                return Err(SvnError::ChecksumMismatch {
                    path,
                    expected: expected.to_string(),
                    actual,
                });
            }
        }
        self.paths.remove(&file);
        Ok(())
    }

    fn absent_file(&mut self, _parent: BatonId, path: &str) -> Result<(), SvnError> {
        self.absent.insert(path.to_string());
        Ok(())
    }

    fn close_edit(&mut self) -> Result<(), SvnError> {
        self.snapshot = None;
        Ok(())
    }

    fn abort_edit(&mut self) -> Result<(), SvnError> {
        if let Some(snapshot) = self.snapshot.take() {
            self.tree = snapshot;
        }
        self.paths.clear();
        self.appliers.clear();
        Ok(())
    }
}

/// Options for [`drive_tree_delta`].
#[derive(Clone, Debug, Default)]
pub struct DriveOptions {
    /// Revision announced with `set_target_revision`.
    pub target_rev: Option<Revnum>,
    /// Base revision passed to `open_root` and to opened children.
    pub base_rev: Option<Revnum>,
    /// Send text deltas; otherwise changed files get an empty delta stream.
    pub send_deltas: bool,
    /// Delta window generation.
    pub generator: DeltaGenerator,
    /// Added paths that were copied: the copy source and its node, which is
    /// used as the delta base.
    pub copies: BTreeMap<String, (CopyFrom, Node)>,
}

impl DriveOptions {
    /// Options sending full text deltas.
    pub fn new() -> Self {
        Self {
            send_deltas: true,
            ..Self::default()
        }
    }

    /// Sets the target revision.
    #[must_use]
    pub fn with_target_rev(mut self, rev: Option<Revnum>) -> Self {
        self.target_rev = rev;
        self
    }

    /// Sets the base revision.
    #[must_use]
    pub fn with_base_rev(mut self, rev: Option<Revnum>) -> Self {
        self.base_rev = rev;
        self
    }

    /// Sets whether text deltas are sent.
    #[must_use]
    pub fn with_send_deltas(mut self, send_deltas: bool) -> Self {
        self.send_deltas = send_deltas;
        self
    }

    /// Sets the delta generator.
    #[must_use]
    pub fn with_generator(mut self, generator: DeltaGenerator) -> Self {
        self.generator = generator;
        self
    }
}

/// Drives `editor` with the changes that turn `source` into `target`.
///
/// Deletions are sent before additions within each directory. On failure the
/// edit is aborted before the error is returned.
pub fn drive_tree_delta(
    editor: &mut Editor<'_>,
    source: &Tree,
    target: &Tree,
    options: &DriveOptions,
) -> Result<(), SvnError> {
    let res = drive_edit(editor, source, target, options);
    if res.is_err()
        && editor.is_open()
        && let Err(err) = editor.abort()
    {
        tracing::debug!(error = %err, "abort after failed drive also failed");
    }
    res
}

fn drive_edit(
    editor: &mut Editor<'_>,
    source: &Tree,
    target: &Tree,
    options: &DriveOptions,
) -> Result<(), SvnError> {
    if let Some(rev) = options.target_rev {
        editor.set_target_revision(rev)?;
    }
    if options.send_deltas {
        editor.set_progress_total(Some(text_bytes(&source.root, &target.root, "", options)));
    }
    let mut root = editor.open_root(options.base_rev)?;
    drive_dir(&mut root, &source.root, &target.root, options)?;
    root.close()?;
    editor.close()
}

fn drive_props(
    source: &PropertyList,
    target: &PropertyList,
    mut change: impl FnMut(&str, Option<&[u8]>) -> Result<(), SvnError>,
) -> Result<(), SvnError> {
    for name in source.keys().filter(|name| !target.contains_key(*name)) {
        change(name, None)?;
    }
    for (name, value) in target {
        if source.get(name) != Some(value) {
            change(name, Some(value))?;
        }
    }
    Ok(())
}

fn drive_dir(
    dir: &mut DirectoryEditor<'_>,
    source: &DirNode,
    target: &DirNode,
    options: &DriveOptions,
) -> Result<(), SvnError> {
    drive_props(&source.props, &target.props, |name, value| dir.change_prop(name, value))?;

    let dir_path = dir.path().to_string();
    for (name, node) in &source.entries {
        let child_path = path::join(&dir_path, name);
        let replaced = match target.entries.get(name) {
            None => true,
            Some(new) => new.kind() != node.kind() || options.copies.contains_key(&child_path),
        };
        if replaced {
            dir.delete_entry(&child_path, options.base_rev)?;
        }
    }

    for (name, node) in &target.entries {
        let child_path = path::join(&dir_path, name);
        let base = source.entries.get(name).filter(|old| old.kind() == node.kind());
        let copy = options.copies.get(&child_path);
        match (base, copy, node) {
            (Some(old), None, _) if old == node => {}
            (Some(Node::Dir(old)), None, Node::Dir(new)) => {
                let mut child = dir.open_directory(&child_path, options.base_rev)?;
                drive_dir(&mut child, old, new, options)?;
                child.close()?;
            }
            (Some(Node::File(old)), None, Node::File(new)) => {
                let mut child = dir.open_file(&child_path, options.base_rev)?;
                drive_file(&mut child, old, new, false, options)?;
            }
            (_, copy, Node::Dir(new)) => {
                let (copy_from, copied) = split_copy(copy);
                let empty = DirNode::default();
                let copied = match copied {
                    Some(Node::Dir(dir)) => dir,
                    _ => &empty,
                };
                let mut child = dir.add_directory(&child_path, copy_from)?;
                drive_dir(&mut child, copied, new, options)?;
                child.close()?;
            }
            (_, copy, Node::File(new)) => {
                let (copy_from, copied) = split_copy(copy);
                let empty = FileNode::default();
                let copied = match copied {
                    Some(Node::File(file)) => file,
                    _ => &empty,
                };
                let is_copy = copy_from.is_some();
                let mut child = dir.add_file(&child_path, copy_from)?;
                drive_file(&mut child, copied, new, !is_copy, options)?;
            }
        }
    }
    Ok(())
}

/// Target bytes of every file text the drive below `dir_path` will send.
fn text_bytes(source: &DirNode, target: &DirNode, dir_path: &str, options: &DriveOptions) -> u64 {
    let mut total = 0;
    for (name, node) in &target.entries {
        let child_path = path::join(dir_path, name);
        let base = source.entries.get(name).filter(|old| old.kind() == node.kind());
        let copy = options.copies.get(&child_path);
        total += match (base, copy.map(|(_, copied)| copied), node) {
            (Some(Node::Dir(old)), None, Node::Dir(new)) => {
                text_bytes(old, new, &child_path, options)
            }
            (Some(Node::File(old)), None, Node::File(new)) if old.contents != new.contents => {
                new.contents.len() as u64
            }
            (Some(_), None, _) => 0,
            (_, Some(Node::Dir(copied)), Node::Dir(new)) => {
                text_bytes(copied, new, &child_path, options)
            }
            (_, _, Node::Dir(new)) => text_bytes(&DirNode::default(), new, &child_path, options),
            (_, Some(Node::File(copied)), Node::File(new)) if copied.contents == new.contents => 0,
            (_, _, Node::File(new)) => new.contents.len() as u64,
        };
    }
    total
}

fn split_copy(copy: Option<&(CopyFrom, Node)>) -> (Option<CopyFrom>, Option<&Node>) {
    match copy {
        Some((from, node)) => (Some(from.clone()), Some(node)),
        None => (None, None),
    }
}

fn drive_file(
    file: &mut FileEditor<'_>,
    source: &FileNode,
    target: &FileNode,
    plain_add: bool,
    options: &DriveOptions,
) -> Result<(), SvnError> {
    drive_props(&source.props, &target.props, |name, value| file.change_prop(name, value))?;

    let mut checksum = None;
    if plain_add || source.contents != target.contents {
        let base_checksum = (!plain_add).then(|| source.checksum());
        let mut handler = file.apply_textdelta(base_checksum.as_deref())?;
        if options.send_deltas {
            send_delta(&mut handler, &options.generator, &source.contents, &target.contents)?;
            checksum = Some(target.checksum());
        } else {
            handler.finish()?;
        }
    }
    file.close(checksum.as_deref())
}
