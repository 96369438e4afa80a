//! The tree-delta editor.
//!
//! A producer describes a set of tree changes by walking an [`Editor`]:
//! `open_root` yields the root [`DirectoryEditor`], directories yield child
//! directories and [`FileEditor`]s, and files stream their text through a
//! [`TxDeltaHandler`]. Every call is checked against the baton state machine
//! and then forwarded to an [`EditorSink`], the consumer.
//!
//! Rules enforced here:
//!
//! - at most one child baton is open under a directory at a time;
//! - a baton can only be closed once none of its children is open;
//! - every call on a closed baton, or on any baton after the edit was closed
//!   or aborted, fails with [`SvnError::Protocol`];
//! - `abort` is accepted from any open baton and ends the whole edit.
//!
//! Protocol violations leave the state untouched. If the sink itself fails,
//! the call has no effect on the baton state either; the producer is expected
//! to abort the edit.

use std::cell::RefCell;
use std::fmt::{Display, Formatter};
use std::rc::Rc;

use crate::callbacks::{Callbacks, Notification, NotifyAction, ProgressTracker};
use crate::session::BusyGuard;
use crate::txdelta::{DeltaTarget, TxDeltaHandler};
use crate::window::DeltaWindow;
use crate::{CopyFrom, NodeKind, Revnum, SvnError, normalize_revnum, path};

/// Identifies one open directory or file baton within an edit.
///
/// Ids are generational: once a baton is closed its id never becomes valid
/// again, even if its slot is reused.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct BatonId {
    index: u32,
    generation: u32,
}

impl BatonId {
    /// Slot index in the edit's baton arena.
    pub fn index(self) -> u32 {
        self.index
    }

    /// Generation of the slot when this baton was opened.
    pub fn generation(self) -> u32 {
        self.generation
    }
}

impl Display for BatonId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.index, self.generation)
    }
}

/// The consumer side of an edit.
///
/// Batons are handed to the sink by id; the sink sees a call sequence that
/// has already been validated against the protocol.
pub trait EditorSink {
    /// Announces the revision the edit brings the tree to.
    fn set_target_revision(&mut self, rev: Revnum) -> Result<(), SvnError> {
        let _ = rev;
        Ok(())
    }

    /// Opens the edit root.
    fn open_root(&mut self, root: BatonId, base_rev: Option<Revnum>) -> Result<(), SvnError>;

    /// Deletes the entry `path` below `parent`.
    fn delete_entry(
        &mut self,
        parent: BatonId,
        path: &str,
        rev: Option<Revnum>,
    ) -> Result<(), SvnError>;

    /// Adds directory `path` below `parent`.
    fn add_directory(
        &mut self,
        parent: BatonId,
        child: BatonId,
        path: &str,
        copy_from: Option<&CopyFrom>,
    ) -> Result<(), SvnError>;

    /// Opens existing directory `path` below `parent`.
    fn open_directory(
        &mut self,
        parent: BatonId,
        child: BatonId,
        path: &str,
        base_rev: Option<Revnum>,
    ) -> Result<(), SvnError>;

    /// Sets (`Some`) or deletes (`None`) a directory property.
    fn change_dir_prop(
        &mut self,
        dir: BatonId,
        name: &str,
        value: Option<&[u8]>,
    ) -> Result<(), SvnError>;

    /// Closes a directory.
    fn close_directory(&mut self, dir: BatonId) -> Result<(), SvnError>;

    /// Marks directory `path` below `parent` as present but inaccessible.
    fn absent_directory(&mut self, parent: BatonId, path: &str) -> Result<(), SvnError> {
        let _ = (parent, path);
        Ok(())
    }

    /// Adds file `path` below `parent`.
    fn add_file(
        &mut self,
        parent: BatonId,
        file: BatonId,
        path: &str,
        copy_from: Option<&CopyFrom>,
    ) -> Result<(), SvnError>;

    /// Opens existing file `path` below `parent`.
    fn open_file(
        &mut self,
        parent: BatonId,
        file: BatonId,
        path: &str,
        base_rev: Option<Revnum>,
    ) -> Result<(), SvnError>;

    /// Starts a text delta for `file`.
    fn apply_textdelta(&mut self, file: BatonId, base_checksum: Option<&str>)
    -> Result<(), SvnError>;

    /// Receives the next window of the text delta started for `file`.
    fn textdelta_window(&mut self, file: BatonId, window: &DeltaWindow) -> Result<(), SvnError>;

    /// Ends the text delta for `file`, returning the new text's checksum if
    /// the sink computed one.
    fn textdelta_end(&mut self, file: BatonId) -> Result<Option<String>, SvnError>;

    /// Sets (`Some`) or deletes (`None`) a file property.
    fn change_file_prop(
        &mut self,
        file: BatonId,
        name: &str,
        value: Option<&[u8]>,
    ) -> Result<(), SvnError>;

    /// Closes a file. `text_checksum` is the producer's checksum of the full
    /// new text, if it has one.
    fn close_file(&mut self, file: BatonId, text_checksum: Option<&str>) -> Result<(), SvnError>;

    /// Marks file `path` below `parent` as present but inaccessible.
    fn absent_file(&mut self, parent: BatonId, path: &str) -> Result<(), SvnError> {
        let _ = (parent, path);
        Ok(())
    }

    /// Finishes the edit.
    fn close_edit(&mut self) -> Result<(), SvnError>;

    /// Abandons the edit.
    fn abort_edit(&mut self) -> Result<(), SvnError>;
}

impl<S: EditorSink + ?Sized> EditorSink for &mut S {
    fn set_target_revision(&mut self, rev: Revnum) -> Result<(), SvnError> {
        (**self).set_target_revision(rev)
    }

    fn open_root(&mut self, root: BatonId, base_rev: Option<Revnum>) -> Result<(), SvnError> {
        (**self).open_root(root, base_rev)
    }

    fn delete_entry(
        &mut self,
        parent: BatonId,
        path: &str,
        rev: Option<Revnum>,
    ) -> Result<(), SvnError> {
        (**self).delete_entry(parent, path, rev)
    }

    fn add_directory(
        &mut self,
        parent: BatonId,
        child: BatonId,
        path: &str,
        copy_from: Option<&CopyFrom>,
    ) -> Result<(), SvnError> {
        (**self).add_directory(parent, child, path, copy_from)
    }

    fn open_directory(
        &mut self,
        parent: BatonId,
        child: BatonId,
        path: &str,
        base_rev: Option<Revnum>,
    ) -> Result<(), SvnError> {
        (**self).open_directory(parent, child, path, base_rev)
    }

    fn change_dir_prop(
        &mut self,
        dir: BatonId,
        name: &str,
        value: Option<&[u8]>,
    ) -> Result<(), SvnError> {
        (**self).change_dir_prop(dir, name, value)
    }

    fn close_directory(&mut self, dir: BatonId) -> Result<(), SvnError> {
        (**self).close_directory(dir)
    }

    fn absent_directory(&mut self, parent: BatonId, path: &str) -> Result<(), SvnError> {
        (**self).absent_directory(parent, path)
    }

    fn add_file(
        &mut self,
        parent: BatonId,
        file: BatonId,
        path: &str,
        copy_from: Option<&CopyFrom>,
    ) -> Result<(), SvnError> {
        (**self).add_file(parent, file, path, copy_from)
    }

    fn open_file(
        &mut self,
        parent: BatonId,
        file: BatonId,
        path: &str,
        base_rev: Option<Revnum>,
    ) -> Result<(), SvnError> {
        (**self).open_file(parent, file, path, base_rev)
    }

    fn apply_textdelta(
        &mut self,
        file: BatonId,
        base_checksum: Option<&str>,
    ) -> Result<(), SvnError> {
        (**self).apply_textdelta(file, base_checksum)
    }

    fn textdelta_window(&mut self, file: BatonId, window: &DeltaWindow) -> Result<(), SvnError> {
        (**self).textdelta_window(file, window)
    }

    fn textdelta_end(&mut self, file: BatonId) -> Result<Option<String>, SvnError> {
        (**self).textdelta_end(file)
    }

    fn change_file_prop(
        &mut self,
        file: BatonId,
        name: &str,
        value: Option<&[u8]>,
    ) -> Result<(), SvnError> {
        (**self).change_file_prop(file, name, value)
    }

    fn close_file(&mut self, file: BatonId, text_checksum: Option<&str>) -> Result<(), SvnError> {
        (**self).close_file(file, text_checksum)
    }

    fn absent_file(&mut self, parent: BatonId, path: &str) -> Result<(), SvnError> {
        (**self).absent_file(parent, path)
    }

    fn close_edit(&mut self) -> Result<(), SvnError> {
        (**self).close_edit()
    }

    fn abort_edit(&mut self) -> Result<(), SvnError> {
        (**self).abort_edit()
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum TextState {
    Untouched,
    Streaming,
    Done,
}

#[derive(Debug)]
struct BatonRecord {
    kind: NodeKind,
    path: String,
    parent: Option<BatonId>,
    active_child: Option<BatonId>,
    added: bool,
    text: TextState,
    props_changed: bool,
}

#[derive(Debug, Default)]
struct Slot {
    generation: u32,
    record: Option<BatonRecord>,
}

#[derive(Debug, Default)]
struct BatonArena {
    slots: Vec<Slot>,
    free: Vec<u32>,
    live: usize,
}

impl BatonArena {
    fn insert(&mut self, record: BatonRecord) -> BatonId {
        self.live += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.record = Some(record);
            return BatonId {
                index,
                generation: slot.generation,
            };
        }
        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 0,
            record: Some(record),
        });
        BatonId {
            index,
            generation: 0,
        }
    }

    fn get(&self, id: BatonId) -> Option<&BatonRecord> {
        self.slots
            .get(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.record.as_ref())
    }

    fn get_mut(&mut self, id: BatonId) -> Option<&mut BatonRecord> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.record.as_mut())
    }

    fn remove(&mut self, id: BatonId) -> Option<BatonRecord> {
        let slot = self
            .slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)?;
        let record = slot.record.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
        self.live -= 1;
        Some(record)
    }

    fn clear(&mut self) {
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if slot.record.take().is_some() {
                slot.generation = slot.generation.wrapping_add(1);
                self.free.push(index as u32);
            }
        }
        self.live = 0;
    }

    fn first_open_path(&self) -> Option<&str> {
        if self.live == 0 {
            return None;
        }
        self.slots
            .iter()
            .find_map(|slot| slot.record.as_ref().map(|record| record.path.as_str()))
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum EditPhase {
    Pending,
    Open,
    Closed,
    Aborted,
}

enum ChildOpen<'c> {
    AddDirectory(Option<&'c CopyFrom>),
    OpenDirectory(Option<Revnum>),
    AddFile(Option<&'c CopyFrom>),
    OpenFile(Option<Revnum>),
}

impl ChildOpen<'_> {
    fn kind(&self) -> NodeKind {
        match self {
            Self::AddDirectory(_) | Self::OpenDirectory(_) => NodeKind::Dir,
            Self::AddFile(_) | Self::OpenFile(_) => NodeKind::File,
        }
    }

    fn is_add(&self) -> bool {
        matches!(self, Self::AddDirectory(_) | Self::AddFile(_))
    }

    fn name(&self) -> &'static str {
        match self {
            Self::AddDirectory(_) => "add_directory",
            Self::OpenDirectory(_) => "open_directory",
            Self::AddFile(_) => "add_file",
            Self::OpenFile(_) => "open_file",
        }
    }
}

struct EditState<'a> {
    sink: Box<dyn EditorSink + 'a>,
    batons: BatonArena,
    phase: EditPhase,
    target_rev: Option<Revnum>,
    callbacks: Callbacks,
    progress: ProgressTracker,
    busy: Option<BusyGuard>,
}

type SharedEdit<'a> = Rc<RefCell<EditState<'a>>>;

impl<'a> EditState<'a> {
    fn ensure_active(&self) -> Result<(), SvnError> {
        match self.phase {
            EditPhase::Pending | EditPhase::Open => Ok(()),
            EditPhase::Closed => Err(SvnError::Protocol("edit already closed".into())),
            EditPhase::Aborted => Err(SvnError::Protocol("edit already aborted".into())),
        }
    }

    fn record(&self, id: BatonId) -> Result<&BatonRecord, SvnError> {
        self.ensure_active()?;
        self.batons
            .get(id)
            .ok_or_else(|| SvnError::Protocol(format!("baton {id} is already closed")))
    }

    fn record_mut(&mut self, id: BatonId) -> Result<&mut BatonRecord, SvnError> {
        self.ensure_active()?;
        self.batons
            .get_mut(id)
            .ok_or_else(|| SvnError::Protocol(format!("baton {id} is already closed")))
    }

    /// Looks up `id` and checks that none of its children is open.
    fn idle_record(&self, id: BatonId, op: &str) -> Result<&BatonRecord, SvnError> {
        let record = self.record(id)?;
        if let Some(child) = record.active_child {
            let child_path = self
                .batons
                .get(child)
                .map(|child| child.path.as_str())
                .unwrap_or_default();
            return Err(SvnError::Protocol(format!(
                "cannot {op} on '{}': child '{child_path}' is still open",
                record.path
            )));
        }
        Ok(record)
    }

    fn child_path(&self, parent: BatonId, path: &str, op: &str) -> Result<String, SvnError> {
        let record = self.idle_record(parent, op)?;
        let path = path::validate_rel_path(path)?;
        if !path::is_child_of(&record.path, &path) {
            return Err(SvnError::InvalidPath(format!(
                "'{path}' is not a direct child of '{}'",
                record.path
            )));
        }
        Ok(path)
    }

    fn notify(&self, path: &str, action: NotifyAction, kind: NodeKind) -> Result<(), SvnError> {
        self.callbacks.notify(&Notification {
            path: path.to_string(),
            action,
            kind,
            revision: self.target_rev,
        })
    }

    fn open_child(
        &mut self,
        parent: BatonId,
        path: &str,
        how: ChildOpen<'_>,
    ) -> Result<(BatonId, String), SvnError> {
        let path = self.child_path(parent, path, how.name())?;
        if let ChildOpen::AddDirectory(Some(copy_from)) | ChildOpen::AddFile(Some(copy_from)) =
            &how
        {
            path::validate_rel_dir_path(&copy_from.path)?;
            if copy_from.rev < 0 {
                return Err(SvnError::Protocol(format!(
                    "copy source '{}' has no revision",
                    copy_from.path
                )));
            }
        }
        self.callbacks.check_cancel()?;
        if how.is_add() {
            self.notify(&path, NotifyAction::Added, how.kind())?;
        }

        let id = self.batons.insert(BatonRecord {
            kind: how.kind(),
            path: path.clone(),
            parent: Some(parent),
            active_child: None,
            added: how.is_add(),
            text: TextState::Untouched,
            props_changed: false,
        });
        let res = match how {
            ChildOpen::AddDirectory(copy_from) => {
                self.sink.add_directory(parent, id, &path, copy_from)
            }
            ChildOpen::OpenDirectory(rev) => {
                self.sink
                    .open_directory(parent, id, &path, normalize_revnum(rev))
            }
            ChildOpen::AddFile(copy_from) => self.sink.add_file(parent, id, &path, copy_from),
            ChildOpen::OpenFile(rev) => {
                self.sink.open_file(parent, id, &path, normalize_revnum(rev))
            }
        };
        if let Err(err) = res {
            self.batons.remove(id);
            return Err(err);
        }
        if let Some(record) = self.batons.get_mut(parent) {
            record.active_child = Some(id);
        }
        tracing::trace!(baton = %id, path = %path, "opened baton");
        Ok((id, path))
    }

    fn close_baton(&mut self, id: BatonId, text_checksum: Option<&str>) -> Result<(), SvnError> {
        let record = self.idle_record(id, "close")?;
        if record.text == TextState::Streaming {
            return Err(SvnError::Protocol(format!(
                "cannot close '{}': its text delta is not finished",
                record.path
            )));
        }
        let kind = record.kind;
        let action = match (record.added, record.text, record.props_changed) {
            (true, _, _) => None,
            (false, TextState::Done, _) => Some(NotifyAction::Updated),
            (false, _, true) => Some(NotifyAction::PropsChanged),
            _ => None,
        };
        let path = record.path.clone();

        self.callbacks.check_cancel()?;
        if let Some(action) = action {
            self.notify(&path, action, kind)?;
        }
        match kind {
            NodeKind::File => self.sink.close_file(id, text_checksum)?,
            _ => self.sink.close_directory(id)?,
        }

        if let Some(record) = self.batons.remove(id)
            && let Some(parent) = record.parent
            && let Some(parent) = self.batons.get_mut(parent)
        {
            parent.active_child = None;
        }
        tracing::trace!(baton = %id, path = %path, "closed baton");
        Ok(())
    }

    fn change_prop(
        &mut self,
        id: BatonId,
        name: &str,
        value: Option<&[u8]>,
    ) -> Result<(), SvnError> {
        let kind = self.record(id)?.kind;
        if name.is_empty() {
            return Err(SvnError::Protocol("property name is empty".into()));
        }
        match kind {
            NodeKind::File => self.sink.change_file_prop(id, name, value)?,
            _ => self.sink.change_dir_prop(id, name, value)?,
        }
        self.record_mut(id)?.props_changed = true;
        Ok(())
    }

    fn abort(&mut self) -> Result<(), SvnError> {
        self.ensure_active()?;
        self.phase = EditPhase::Aborted;
        self.batons.clear();
        self.busy = None;
        tracing::debug!("edit aborted");
        self.sink.abort_edit()
    }
}

/// Handle for one edit.
///
/// Dropping the handle while the edit is still open aborts the edit.
pub struct Editor<'a> {
    state: SharedEdit<'a>,
}

impl std::fmt::Debug for Editor<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let phase = self.state.try_borrow().map(|state| state.phase).ok();
        f.debug_struct("Editor").field("phase", &phase).finish()
    }
}

impl<'a> Editor<'a> {
    /// Starts an edit driving `sink`.
    pub fn new(sink: impl EditorSink + 'a) -> Self {
        Self::with_callbacks(sink, Callbacks::default())
    }

    /// Starts an edit driving `sink`, polling `callbacks` for cancellation
    /// and reporting progress and notifications to them.
    pub fn with_callbacks(sink: impl EditorSink + 'a, callbacks: Callbacks) -> Self {
        Self::from_parts(Box::new(sink), callbacks, None)
    }

    pub(crate) fn from_parts(
        sink: Box<dyn EditorSink + 'a>,
        callbacks: Callbacks,
        busy: Option<BusyGuard>,
    ) -> Self {
        let progress = callbacks.progress_tracker();
        tracing::debug!("edit started");
        Self {
            state: Rc::new(RefCell::new(EditState {
                sink,
                batons: BatonArena::default(),
                phase: EditPhase::Pending,
                target_rev: None,
                callbacks,
                progress,
                busy,
            })),
        }
    }

    /// Announces the target revision. Only legal before [`open_root`](Self::open_root).
    pub fn set_target_revision(&mut self, rev: Revnum) -> Result<(), SvnError> {
        let mut state = self.state.borrow_mut();
        state.ensure_active()?;
        if state.phase != EditPhase::Pending {
            return Err(SvnError::Protocol(
                "set_target_revision must precede open_root".into(),
            ));
        }
        let Some(rev) = normalize_revnum(Some(rev)) else {
            return Err(SvnError::Protocol(format!("invalid target revision {rev}")));
        };
        state.sink.set_target_revision(rev)?;
        state.target_rev = Some(rev);
        Ok(())
    }

    /// Opens the root directory of the edit. Legal exactly once.
    pub fn open_root(&mut self, base_rev: Option<Revnum>) -> Result<DirectoryEditor<'a>, SvnError> {
        let id = {
            let mut state = self.state.borrow_mut();
            state.ensure_active()?;
            if state.phase != EditPhase::Pending {
                return Err(SvnError::Protocol("open_root called twice".into()));
            }
            state.callbacks.check_cancel()?;
            let id = state.batons.insert(BatonRecord {
                kind: NodeKind::Dir,
                path: String::new(),
                parent: None,
                active_child: None,
                added: false,
                text: TextState::Untouched,
                props_changed: false,
            });
            if let Err(err) = state.sink.open_root(id, normalize_revnum(base_rev)) {
                state.batons.remove(id);
                return Err(err);
            }
            state.phase = EditPhase::Open;
            tracing::trace!(baton = %id, "opened root");
            id
        };
        Ok(DirectoryEditor {
            state: Rc::clone(&self.state),
            id,
            path: String::new(),
        })
    }

    /// Finishes the edit. Every directory and file must be closed.
    pub fn close(&mut self) -> Result<(), SvnError> {
        let mut state = self.state.borrow_mut();
        state.ensure_active()?;
        if let Some(path) = state.batons.first_open_path() {
            return Err(SvnError::Protocol(format!(
                "cannot close edit: '{path}' is still open"
            )));
        }
        state.callbacks.check_cancel()?;
        state.sink.close_edit()?;
        state.phase = EditPhase::Closed;
        state.busy = None;
        tracing::debug!(bytes = state.progress.transferred(), "edit closed");
        Ok(())
    }

    /// Abandons the edit, whatever batons are still open.
    pub fn abort(&mut self) -> Result<(), SvnError> {
        self.state.borrow_mut().abort()
    }

    /// Returns `true` until the edit is closed or aborted.
    pub fn is_open(&self) -> bool {
        self.state
            .try_borrow()
            .is_ok_and(|state| state.ensure_active().is_ok())
    }

    /// Sets the total number of text bytes this edit will stream, passed to
    /// the progress sink with every report.
    pub fn set_progress_total(&mut self, total: Option<u64>) {
        if let Ok(mut state) = self.state.try_borrow_mut() {
            state.progress.set_total(total);
        }
    }

    /// The target revision announced for this edit.
    pub fn target_revision(&self) -> Option<Revnum> {
        self.state
            .try_borrow()
            .ok()
            .and_then(|state| state.target_rev)
    }
}

impl Drop for Editor<'_> {
    fn drop(&mut self) {
        let Ok(mut state) = self.state.try_borrow_mut() else {
            return;
        };
        if state.ensure_active().is_ok() {
            tracing::warn!("editor dropped while the edit was open; aborting");
            if let Err(err) = state.abort() {
                tracing::warn!(error = %err, "abort of dropped edit failed");
            }
        }
    }
}

/// Handle for one open directory.
pub struct DirectoryEditor<'a> {
    state: SharedEdit<'a>,
    id: BatonId,
    path: String,
}

impl std::fmt::Debug for DirectoryEditor<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectoryEditor")
            .field("id", &self.id)
            .field("path", &self.path)
            .finish()
    }
}

impl<'a> DirectoryEditor<'a> {
    /// The baton id of this directory.
    pub fn id(&self) -> BatonId {
        self.id
    }

    /// The edit-relative path of this directory (`""` for the root).
    pub fn path(&self) -> &str {
        &self.path
    }

    fn open_dir_child(
        &mut self,
        path: &str,
        how: ChildOpen<'_>,
    ) -> Result<DirectoryEditor<'a>, SvnError> {
        let (id, path) = self.state.borrow_mut().open_child(self.id, path, how)?;
        Ok(DirectoryEditor {
            state: Rc::clone(&self.state),
            id,
            path,
        })
    }

    fn open_file_child(
        &mut self,
        path: &str,
        how: ChildOpen<'_>,
    ) -> Result<FileEditor<'a>, SvnError> {
        let (id, path) = self.state.borrow_mut().open_child(self.id, path, how)?;
        Ok(FileEditor {
            state: Rc::clone(&self.state),
            id,
            path,
        })
    }

    /// Adds a child directory, optionally as a copy.
    pub fn add_directory(
        &mut self,
        path: &str,
        copy_from: Option<CopyFrom>,
    ) -> Result<DirectoryEditor<'a>, SvnError> {
        self.open_dir_child(path, ChildOpen::AddDirectory(copy_from.as_ref()))
    }

    /// Opens an existing child directory.
    pub fn open_directory(
        &mut self,
        path: &str,
        base_rev: Option<Revnum>,
    ) -> Result<DirectoryEditor<'a>, SvnError> {
        self.open_dir_child(path, ChildOpen::OpenDirectory(base_rev))
    }

    /// Adds a child file, optionally as a copy.
    pub fn add_file(
        &mut self,
        path: &str,
        copy_from: Option<CopyFrom>,
    ) -> Result<FileEditor<'a>, SvnError> {
        self.open_file_child(path, ChildOpen::AddFile(copy_from.as_ref()))
    }

    /// Opens an existing child file.
    pub fn open_file(
        &mut self,
        path: &str,
        base_rev: Option<Revnum>,
    ) -> Result<FileEditor<'a>, SvnError> {
        self.open_file_child(path, ChildOpen::OpenFile(base_rev))
    }

    /// Deletes a child entry.
    pub fn delete_entry(&mut self, path: &str, rev: Option<Revnum>) -> Result<(), SvnError> {
        let mut state = self.state.borrow_mut();
        let path = state.child_path(self.id, path, "delete_entry")?;
        state.callbacks.check_cancel()?;
        state.notify(&path, NotifyAction::Deleted, NodeKind::Unknown)?;
        state.sink.delete_entry(self.id, &path, normalize_revnum(rev))?;
        tracing::trace!(path = %path, "deleted entry");
        Ok(())
    }

    /// Reports a child directory that exists but cannot be sent.
    pub fn absent_directory(&mut self, path: &str) -> Result<(), SvnError> {
        let mut state = self.state.borrow_mut();
        let path = state.child_path(self.id, path, "absent_directory")?;
        state.notify(&path, NotifyAction::Absent, NodeKind::Dir)?;
        state.sink.absent_directory(self.id, &path)
    }

    /// Reports a child file that exists but cannot be sent.
    pub fn absent_file(&mut self, path: &str) -> Result<(), SvnError> {
        let mut state = self.state.borrow_mut();
        let path = state.child_path(self.id, path, "absent_file")?;
        state.notify(&path, NotifyAction::Absent, NodeKind::File)?;
        state.sink.absent_file(self.id, &path)
    }

    /// Sets (`Some`) or deletes (`None`) a property of this directory.
    pub fn change_prop(&mut self, name: &str, value: Option<&[u8]>) -> Result<(), SvnError> {
        self.state.borrow_mut().change_prop(self.id, name, value)
    }

    /// Closes this directory. Fails while a child is still open.
    pub fn close(&mut self) -> Result<(), SvnError> {
        self.state.borrow_mut().close_baton(self.id, None)
    }

    /// Aborts the whole edit.
    pub fn abort(&mut self) -> Result<(), SvnError> {
        self.state.borrow_mut().abort()
    }
}

/// Handle for one open file.
pub struct FileEditor<'a> {
    state: SharedEdit<'a>,
    id: BatonId,
    path: String,
}

impl std::fmt::Debug for FileEditor<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileEditor")
            .field("id", &self.id)
            .field("path", &self.path)
            .finish()
    }
}

impl<'a> FileEditor<'a> {
    /// The baton id of this file.
    pub fn id(&self) -> BatonId {
        self.id
    }

    /// The edit-relative path of this file.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Starts the text delta for this file.
    ///
    /// Legal once per file; the content flows through the returned handler.
    pub fn apply_textdelta(
        &mut self,
        base_checksum: Option<&str>,
    ) -> Result<TxDeltaHandler<'a>, SvnError> {
        {
            let mut state = self.state.borrow_mut();
            let record = state.record(self.id)?;
            if record.text != TextState::Untouched {
                return Err(SvnError::Protocol(format!(
                    "apply_textdelta already called for '{}'",
                    record.path
                )));
            }
            state.callbacks.check_cancel()?;
            state.sink.apply_textdelta(self.id, base_checksum)?;
            state.record_mut(self.id)?.text = TextState::Streaming;
        }
        Ok(TxDeltaHandler::new(Box::new(FileDeltaStream {
            state: Rc::clone(&self.state),
            file: self.id,
        })))
    }

    /// Sets (`Some`) or deletes (`None`) a property of this file.
    pub fn change_prop(&mut self, name: &str, value: Option<&[u8]>) -> Result<(), SvnError> {
        self.state.borrow_mut().change_prop(self.id, name, value)
    }

    /// Closes this file. `text_checksum` is the hex MD5 of the full new text.
    pub fn close(&mut self, text_checksum: Option<&str>) -> Result<(), SvnError> {
        self.state.borrow_mut().close_baton(self.id, text_checksum)
    }

    /// Aborts the whole edit.
    pub fn abort(&mut self) -> Result<(), SvnError> {
        self.state.borrow_mut().abort()
    }
}

struct FileDeltaStream<'a> {
    state: SharedEdit<'a>,
    file: BatonId,
}

impl FileDeltaStream<'_> {
    fn check_streaming(state: &EditState<'_>, file: BatonId) -> Result<(), SvnError> {
        let record = state.record(file)?;
        if record.text != TextState::Streaming {
            return Err(SvnError::Protocol(format!(
                "no text delta in progress for '{}'",
                record.path
            )));
        }
        Ok(())
    }
}

impl DeltaTarget for FileDeltaStream<'_> {
    fn window(&mut self, window: &DeltaWindow) -> Result<(), SvnError> {
        let mut state = self.state.borrow_mut();
        Self::check_streaming(&state, self.file)?;
        state.callbacks.check_cancel()?;
        state.sink.textdelta_window(self.file, window)?;
        state.progress.add(window.tview_len as u64);
        Ok(())
    }

    fn end(&mut self) -> Result<Option<String>, SvnError> {
        let mut state = self.state.borrow_mut();
        Self::check_streaming(&state, self.file)?;
        let checksum = state.sink.textdelta_end(self.file)?;
        state.record_mut(self.file)?.text = TextState::Done;
        Ok(checksum)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    use super::*;

    #[derive(Default)]
    struct Log(Vec<String>);

    impl EditorSink for Log {
        fn set_target_revision(&mut self, rev: Revnum) -> Result<(), SvnError> {
            self.0.push(format!("target {rev}"));
            Ok(())
        }

        fn open_root(&mut self, _root: BatonId, base_rev: Option<Revnum>) -> Result<(), SvnError> {
            self.0.push(format!("open_root {base_rev:?}"));
            Ok(())
        }

        fn delete_entry(
            &mut self,
            _: BatonId,
            path: &str,
            _: Option<Revnum>,
        ) -> Result<(), SvnError> {
            self.0.push(format!("delete {path}"));
            Ok(())
        }

        fn add_directory(
            &mut self,
            _: BatonId,
            _: BatonId,
            path: &str,
            _: Option<&CopyFrom>,
        ) -> Result<(), SvnError> {
            self.0.push(format!("add_dir {path}"));
            Ok(())
        }

        fn open_directory(
            &mut self,
            _: BatonId,
            _: BatonId,
            path: &str,
            _: Option<Revnum>,
        ) -> Result<(), SvnError> {
            self.0.push(format!("open_dir {path}"));
            Ok(())
        }

        fn change_dir_prop(
            &mut self,
            _: BatonId,
            name: &str,
            _: Option<&[u8]>,
        ) -> Result<(), SvnError> {
            self.0.push(format!("dir_prop {name}"));
            Ok(())
        }

        fn close_directory(&mut self, _: BatonId) -> Result<(), SvnError> {
            self.0.push("close_dir".into());
            Ok(())
        }

        fn add_file(
            &mut self,
            _: BatonId,
            _: BatonId,
            path: &str,
            _: Option<&CopyFrom>,
        ) -> Result<(), SvnError> {
            self.0.push(format!("add_file {path}"));
            Ok(())
        }

        fn open_file(
            &mut self,
            _: BatonId,
            _: BatonId,
            path: &str,
            _: Option<Revnum>,
        ) -> Result<(), SvnError> {
            self.0.push(format!("open_file {path}"));
            Ok(())
        }

        fn apply_textdelta(&mut self, _: BatonId, _: Option<&str>) -> Result<(), SvnError> {
            self.0.push("apply_textdelta".into());
            Ok(())
        }

        fn textdelta_window(&mut self, _: BatonId, window: &DeltaWindow) -> Result<(), SvnError> {
            self.0.push(format!("window {}", window.tview_len));
            Ok(())
        }

        fn textdelta_end(&mut self, _: BatonId) -> Result<Option<String>, SvnError> {
            self.0.push("textdelta_end".into());
            Ok(None)
        }

        fn change_file_prop(
            &mut self,
            _: BatonId,
            name: &str,
            _: Option<&[u8]>,
        ) -> Result<(), SvnError> {
            self.0.push(format!("file_prop {name}"));
            Ok(())
        }

        fn close_file(&mut self, _: BatonId, checksum: Option<&str>) -> Result<(), SvnError> {
            self.0.push(format!("close_file {checksum:?}"));
            Ok(())
        }

        fn close_edit(&mut self) -> Result<(), SvnError> {
            self.0.push("close_edit".into());
            Ok(())
        }

        fn abort_edit(&mut self) -> Result<(), SvnError> {
            self.0.push("abort_edit".into());
            Ok(())
        }
    }

    fn assert_protocol<T: std::fmt::Debug>(res: Result<T, SvnError>) {
        let err = res.unwrap_err();
        assert!(matches!(err, SvnError::Protocol(_)), "unexpected error: {err:?}");
    }

    #[test]
    fn second_child_while_first_is_open_is_rejected() {
        let mut log = Log::default();
        {
            let mut editor = Editor::new(&mut log);
            let mut root = editor.open_root(None).unwrap();
            let mut trunk = root.add_directory("trunk", None).unwrap();

            assert_protocol(root.add_directory("branches", None));
            assert_protocol(root.add_file("README", None));
            assert_protocol(root.delete_entry("tags", None));
            assert_protocol(root.close());
            // Properties may still change while a child is open.
            root.change_prop("svn:ignore", Some(b"target")).unwrap();

            trunk.close().unwrap();
            let mut branches = root.add_directory("branches", None).unwrap();
            branches.close().unwrap();
            root.close().unwrap();
            editor.close().unwrap();
        }

        assert_eq!(
            log.0,
            vec![
                "open_root None",
                "add_dir trunk",
                "dir_prop svn:ignore",
                "close_dir",
                "add_dir branches",
                "close_dir",
                "close_dir",
                "close_edit",
            ]
        );
    }

    #[test]
    fn closed_batons_reject_every_call() {
        let mut editor = Editor::new(Log::default());
        let mut root = editor.open_root(Some(3)).unwrap();
        let mut file = root.add_file("a.txt", None).unwrap();
        file.close(None).unwrap();

        assert_protocol(file.apply_textdelta(None));
        assert_protocol(file.change_prop("p", None));
        assert_protocol(file.close(None));

        root.close().unwrap();
        assert_protocol(root.add_directory("x", None));
        assert_protocol(root.open_file("a.txt", Some(3)));
        assert_protocol(root.change_prop("p", None));
        assert_protocol(root.close());
        editor.close().unwrap();

        assert_protocol(editor.open_root(None));
        assert_protocol(editor.close());
        assert_protocol(editor.abort());
        assert!(!editor.is_open());
    }

    #[test]
    fn abort_from_nested_file_ends_the_edit() {
        let mut log = Log::default();
        {
            let mut editor = Editor::new(&mut log);
            let mut root = editor.open_root(None).unwrap();
            let mut dir = root.open_directory("trunk", Some(1)).unwrap();
            let mut file = dir.open_file("trunk/main.c", Some(1)).unwrap();
            let mut handler = file.apply_textdelta(None).unwrap();

            file.abort().unwrap();
            assert!(!editor.is_open());
            assert_protocol(handler.send(Some(&DeltaWindow::insertion(b"x".to_vec()))));
            assert_protocol(dir.close());
            assert_protocol(root.abort());
            assert_protocol(editor.close());
        }
        assert_eq!(log.0.last().unwrap(), "abort_edit");
        assert_eq!(log.0.iter().filter(|c| *c == "abort_edit").count(), 1);
    }

    #[test]
    fn child_paths_must_be_direct_children() {
        let mut editor = Editor::new(Log::default());
        let mut root = editor.open_root(None).unwrap();
        let err = root.add_directory("trunk/src", None).unwrap_err();
        assert!(matches!(err, SvnError::InvalidPath(_)));
        let err = root.add_file("/README", None).unwrap_err();
        assert!(matches!(err, SvnError::InvalidPath(_)));

        let mut trunk = root.add_directory("trunk//", None).unwrap();
        assert_eq!(trunk.path(), "trunk");
        let err = trunk.add_file("README", None).unwrap_err();
        assert!(matches!(err, SvnError::InvalidPath(_)));
        trunk.add_file("trunk/README", None).unwrap().close(None).unwrap();
        trunk.close().unwrap();
        root.close().unwrap();
        editor.close().unwrap();
    }

    #[test]
    fn text_delta_must_finish_before_close() {
        let mut log = Log::default();
        {
            let mut editor = Editor::new(&mut log);
            let mut root = editor.open_root(None).unwrap();
            let mut file = root.add_file("f", None).unwrap();
            let mut handler = file.apply_textdelta(None).unwrap();
            assert_protocol(file.apply_textdelta(None));

            handler.send(Some(&DeltaWindow::insertion(b"abc".to_vec()))).unwrap();
            assert_protocol(file.close(None));
            handler.finish().unwrap();
            assert_protocol(file.apply_textdelta(None));
            file.close(Some("x")).unwrap();
            root.close().unwrap();
            editor.close().unwrap();
        }

        assert_eq!(
            log.0,
            vec![
                "open_root None",
                "add_file f",
                "apply_textdelta",
                "window 3",
                "textdelta_end",
                "close_file Some(\"x\")",
                "close_dir",
                "close_edit",
            ]
        );
    }

    #[test]
    fn target_revision_only_before_open_root() {
        let mut log = Log::default();
        {
            let mut editor = Editor::new(&mut log);
            editor.set_target_revision(7).unwrap();
            assert_protocol(editor.set_target_revision(-1));
            assert_eq!(editor.target_revision(), Some(7));
            let mut root = editor.open_root(None).unwrap();
            assert_protocol(editor.set_target_revision(8));
            assert_protocol(editor.open_root(None));
            root.close().unwrap();
            editor.close().unwrap();
        }
        assert_eq!(log.0[0], "target 7");
    }

    #[test]
    fn empty_edit_closes_without_root() {
        let mut log = Log::default();
        Editor::new(&mut log).close().unwrap();
        assert_eq!(log.0, vec!["close_edit"]);
    }

    #[test]
    fn dropping_open_editor_aborts() {
        let mut log = Log::default();
        {
            let mut editor = Editor::new(&mut log);
            let _root = editor.open_root(None).unwrap();
        }
        assert_eq!(log.0, vec!["open_root None", "abort_edit"]);
    }

    #[test]
    fn cancellation_is_polled_at_baton_boundaries() {
        let cancelled = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&cancelled);
        let callbacks = Callbacks::new().with_cancel(move || flag.load(Ordering::SeqCst));

        let mut editor = Editor::with_callbacks(Log::default(), callbacks);
        let mut root = editor.open_root(None).unwrap();
        let mut file = root.add_file("f", None).unwrap();
        let mut handler = file.apply_textdelta(None).unwrap();

        cancelled.store(true, Ordering::SeqCst);
        let err = handler.send(Some(&DeltaWindow::insertion(b"x".to_vec()))).unwrap_err();
        assert!(err.is_cancelled());
        assert!(root.add_directory("d", None).is_err());
        editor.abort().unwrap();
    }

    #[test]
    fn notifications_follow_the_walk() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let callbacks = Callbacks::new().with_notify(move |n: &Notification| {
            sink.lock().unwrap().push((n.path.clone(), n.action));
            Ok(())
        });

        let mut editor = Editor::with_callbacks(Log::default(), callbacks);
        let mut root = editor.open_root(None).unwrap();
        root.delete_entry("old", None).unwrap();
        root.absent_file("secret").unwrap();
        let mut file = root.open_file("changed", None).unwrap();
        file.apply_textdelta(None).unwrap().finish().unwrap();
        file.close(None).unwrap();
        let mut dir = root.open_directory("props", None).unwrap();
        dir.change_prop("k", Some(b"v")).unwrap();
        dir.close().unwrap();
        root.add_file("new", None).unwrap().close(None).unwrap();
        root.close().unwrap();
        editor.close().unwrap();

        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                ("old".to_string(), NotifyAction::Deleted),
                ("secret".to_string(), NotifyAction::Absent),
                ("changed".to_string(), NotifyAction::Updated),
                ("props".to_string(), NotifyAction::PropsChanged),
                ("new".to_string(), NotifyAction::Added),
            ]
        );
    }

    #[test]
    fn failing_notify_surfaces_as_callback_error() {
        let callbacks = Callbacks::new()
            .with_notify(|_: &Notification| Err(SvnError::Protocol("stop".into())));
        let mut editor = Editor::with_callbacks(Log::default(), callbacks);
        let mut root = editor.open_root(None).unwrap();
        let err = root.add_directory("d", None).unwrap_err();
        assert!(matches!(err, SvnError::Callback(_)));
        // Nothing was opened, so the root can still be closed.
        root.close().unwrap();
        editor.close().unwrap();
    }

    #[test]
    fn arena_ids_are_not_reused_after_close() {
        let mut editor = Editor::new(Log::default());
        let mut root = editor.open_root(None).unwrap();
        let mut first = root.add_file("a", None).unwrap();
        let first_id = first.id();
        first.close(None).unwrap();
        let second = root.add_file("b", None).unwrap();
        assert_eq!(second.id().index(), first_id.index());
        assert_ne!(second.id(), first_id);
        assert_protocol(first.change_prop("p", None));
        editor.abort().unwrap();
    }
}
