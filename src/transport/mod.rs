//! Carrying an edit across a process or network boundary.
//!
//! An edit is flattened into [`EditorCommand`]s, where batons are named by
//! string tokens (`d<index>.<generation>` for directories,
//! `f<index>.<generation>` for files) and text deltas travel as svndiff
//! chunks. [`CommandRecorder`] turns sink calls into commands,
//! [`replay_commands`] turns commands back into calls on an [`Editor`], and
//! [`wire`] gives commands their `ra_svn` byte form.
//!
//! [`Editor`]: crate::Editor

mod channel;
mod item;
mod recorder;
mod replay;
pub mod wire;

pub use channel::{ChannelOutput, DriveStatus, channel_editor, drive_channel};
pub use item::{SvnItem, encode_item, parse_item};
pub use recorder::{ChannelEditor, CommandOutput, CommandRecorder, CommandWriter};
pub use replay::{CommandReplayer, replay_commands};

use crate::{BatonId, CopyFrom, Revnum};

/// Token naming directory baton `id` on the wire.
pub fn dir_token(id: BatonId) -> String {
    format!("d{id}")
}

/// Token naming file baton `id` on the wire.
pub fn file_token(id: BatonId) -> String {
    format!("f{id}")
}

/// One editor call in transportable form.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EditorCommand {
    /// Announces the target revision.
    TargetRev {
        /// Target revision number.
        rev: Revnum,
    },
    /// Opens the root directory.
    OpenRoot {
        /// Optional base revision.
        rev: Option<Revnum>,
        /// Root token.
        token: String,
    },
    /// Deletes an entry.
    DeleteEntry {
        /// Edit-relative path.
        path: String,
        /// Revision the entry is expected to be at.
        rev: Option<Revnum>,
        /// Parent directory token.
        dir_token: String,
    },
    /// Adds a directory.
    AddDir {
        /// Edit-relative path.
        path: String,
        /// Parent directory token.
        parent_token: String,
        /// Child directory token.
        child_token: String,
        /// Optional copy source.
        copy_from: Option<CopyFrom>,
    },
    /// Opens an existing directory.
    OpenDir {
        /// Edit-relative path.
        path: String,
        /// Parent directory token.
        parent_token: String,
        /// Child directory token.
        child_token: String,
        /// Base revision.
        rev: Option<Revnum>,
    },
    /// Changes a directory property.
    ChangeDirProp {
        /// Directory token.
        dir_token: String,
        /// Property name.
        name: String,
        /// Property value (raw bytes), or `None` to delete.
        value: Option<Vec<u8>>,
    },
    /// Closes a directory.
    CloseDir {
        /// Directory token.
        dir_token: String,
    },
    /// Marks a directory as absent.
    AbsentDir {
        /// Edit-relative path.
        path: String,
        /// Parent directory token.
        parent_token: String,
    },
    /// Adds a file.
    AddFile {
        /// Edit-relative path.
        path: String,
        /// Parent directory token.
        dir_token: String,
        /// File token.
        file_token: String,
        /// Optional copy source.
        copy_from: Option<CopyFrom>,
    },
    /// Opens an existing file.
    OpenFile {
        /// Edit-relative path.
        path: String,
        /// Parent directory token.
        dir_token: String,
        /// File token.
        file_token: String,
        /// Base revision.
        rev: Option<Revnum>,
    },
    /// Begins a text delta stream for a file.
    ApplyTextDelta {
        /// File token.
        file_token: String,
        /// Optional base checksum.
        base_checksum: Option<String>,
    },
    /// A piece of the svndiff stream.
    TextDeltaChunk {
        /// File token.
        file_token: String,
        /// Raw svndiff bytes.
        chunk: Vec<u8>,
    },
    /// Marks the end of the delta stream.
    TextDeltaEnd {
        /// File token.
        file_token: String,
    },
    /// Changes a file property.
    ChangeFileProp {
        /// File token.
        file_token: String,
        /// Property name.
        name: String,
        /// Property value (raw bytes), or `None` to delete.
        value: Option<Vec<u8>>,
    },
    /// Closes a file.
    CloseFile {
        /// File token.
        file_token: String,
        /// Optional text checksum.
        text_checksum: Option<String>,
    },
    /// Marks a file as absent.
    AbsentFile {
        /// Edit-relative path.
        path: String,
        /// Parent directory token.
        parent_token: String,
    },
    /// Closes the edit successfully.
    CloseEdit,
    /// Aborts the edit.
    AbortEdit,
}

impl EditorCommand {
    /// The `ra_svn` command word.
    pub fn name(&self) -> &'static str {
        match self {
            Self::TargetRev { .. } => "target-rev",
            Self::OpenRoot { .. } => "open-root",
            Self::DeleteEntry { .. } => "delete-entry",
            Self::AddDir { .. } => "add-dir",
            Self::OpenDir { .. } => "open-dir",
            Self::ChangeDirProp { .. } => "change-dir-prop",
            Self::CloseDir { .. } => "close-dir",
            Self::AbsentDir { .. } => "absent-dir",
            Self::AddFile { .. } => "add-file",
            Self::OpenFile { .. } => "open-file",
            Self::ApplyTextDelta { .. } => "apply-textdelta",
            Self::TextDeltaChunk { .. } => "textdelta-chunk",
            Self::TextDeltaEnd { .. } => "textdelta-end",
            Self::ChangeFileProp { .. } => "change-file-prop",
            Self::CloseFile { .. } => "close-file",
            Self::AbsentFile { .. } => "absent-file",
            Self::CloseEdit => "close-edit",
            Self::AbortEdit => "abort-edit",
        }
    }

    /// Returns `true` for the two commands that end an edit.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::CloseEdit | Self::AbortEdit)
    }
}
