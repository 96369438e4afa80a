use std::collections::HashMap;

use crate::editor::{BatonId, EditorSink};
use crate::svndiff::SvndiffEncoder;
use crate::window::DeltaWindow;
use crate::{CopyFrom, Revnum, SvnError, SvndiffOptions};

use super::{EditorCommand, dir_token, file_token};

/// Where a [`CommandWriter`] puts the commands it produces.
pub trait CommandOutput {
    /// Takes one command. An error fails the sink call that produced it.
    fn emit(&mut self, command: EditorCommand) -> Result<(), SvnError>;
}

impl CommandOutput for Vec<EditorCommand> {
    fn emit(&mut self, command: EditorCommand) -> Result<(), SvnError> {
        self.push(command);
        Ok(())
    }
}

/// An [`EditorSink`] that turns every call into an [`EditorCommand`].
///
/// Text delta windows are svndiff-encoded; each window becomes one
/// `TextDeltaChunk`. A delta with no windows still produces a chunk holding
/// the svndiff header, so the receiver sees an empty text rather than no
/// delta at all.
#[derive(Debug)]
pub struct CommandWriter<O> {
    options: SvndiffOptions,
    encoders: HashMap<BatonId, SvndiffEncoder>,
    output: O,
}

/// Records an edit into memory.
pub type CommandRecorder = CommandWriter<Vec<EditorCommand>>;

/// Forwards an edit over a channel; see [`channel_editor`](super::channel_editor).
pub type ChannelEditor = CommandWriter<super::ChannelOutput>;

impl CommandWriter<Vec<EditorCommand>> {
    /// Creates a recorder writing svndiff0.
    pub fn new() -> Self {
        Self::with_output(Vec::new())
    }

    /// Commands recorded so far.
    pub fn commands(&self) -> &[EditorCommand] {
        &self.output
    }

    /// Consumes the recorder, returning the recorded commands.
    pub fn into_commands(self) -> Vec<EditorCommand> {
        self.output
    }
}

impl Default for CommandWriter<Vec<EditorCommand>> {
    fn default() -> Self {
        Self::new()
    }
}

impl<O: CommandOutput> CommandWriter<O> {
    /// Creates a writer emitting into `output`.
    pub fn with_output(output: O) -> Self {
        Self {
            options: SvndiffOptions::default(),
            encoders: HashMap::new(),
            output,
        }
    }

    /// Sets the svndiff encoding used for text deltas.
    #[must_use]
    pub fn with_svndiff(mut self, options: SvndiffOptions) -> Self {
        self.options = options;
        self
    }

    /// The output commands go to.
    pub fn output(&self) -> &O {
        &self.output
    }

    fn emit(&mut self, command: EditorCommand) -> Result<(), SvnError> {
        self.output.emit(command)
    }
}

impl<O: CommandOutput> EditorSink for CommandWriter<O> {
    fn set_target_revision(&mut self, rev: Revnum) -> Result<(), SvnError> {
        self.emit(EditorCommand::TargetRev { rev })
    }

    fn open_root(&mut self, root: BatonId, base_rev: Option<Revnum>) -> Result<(), SvnError> {
        self.emit(EditorCommand::OpenRoot {
            rev: base_rev,
            token: dir_token(root),
        })
    }

    fn delete_entry(
        &mut self,
        parent: BatonId,
        path: &str,
        rev: Option<Revnum>,
    ) -> Result<(), SvnError> {
        self.emit(EditorCommand::DeleteEntry {
            path: path.to_string(),
            rev,
            dir_token: dir_token(parent),
        })
    }

    fn add_directory(
        &mut self,
        parent: BatonId,
        child: BatonId,
        path: &str,
        copy_from: Option<&CopyFrom>,
    ) -> Result<(), SvnError> {
        self.emit(EditorCommand::AddDir {
            path: path.to_string(),
            parent_token: dir_token(parent),
            child_token: dir_token(child),
            copy_from: copy_from.cloned(),
        })
    }

    fn open_directory(
        &mut self,
        parent: BatonId,
        child: BatonId,
        path: &str,
        base_rev: Option<Revnum>,
    ) -> Result<(), SvnError> {
        self.emit(EditorCommand::OpenDir {
            path: path.to_string(),
            parent_token: dir_token(parent),
            child_token: dir_token(child),
            rev: base_rev,
        })
    }

    fn change_dir_prop(
        &mut self,
        dir: BatonId,
        name: &str,
        value: Option<&[u8]>,
    ) -> Result<(), SvnError> {
        self.emit(EditorCommand::ChangeDirProp {
            dir_token: dir_token(dir),
            name: name.to_string(),
            value: value.map(<[u8]>::to_vec),
        })
    }

    fn close_directory(&mut self, dir: BatonId) -> Result<(), SvnError> {
        self.emit(EditorCommand::CloseDir {
            dir_token: dir_token(dir),
        })
    }

    fn absent_directory(&mut self, parent: BatonId, path: &str) -> Result<(), SvnError> {
        self.emit(EditorCommand::AbsentDir {
            path: path.to_string(),
            parent_token: dir_token(parent),
        })
    }

    fn add_file(
        &mut self,
        parent: BatonId,
        file: BatonId,
        path: &str,
        copy_from: Option<&CopyFrom>,
    ) -> Result<(), SvnError> {
        self.emit(EditorCommand::AddFile {
            path: path.to_string(),
            dir_token: dir_token(parent),
            file_token: file_token(file),
            copy_from: copy_from.cloned(),
        })
    }

    fn open_file(
        &mut self,
        parent: BatonId,
        file: BatonId,
        path: &str,
        base_rev: Option<Revnum>,
    ) -> Result<(), SvnError> {
        self.emit(EditorCommand::OpenFile {
            path: path.to_string(),
            dir_token: dir_token(parent),
            file_token: file_token(file),
            rev: base_rev,
        })
    }

    fn apply_textdelta(
        &mut self,
        file: BatonId,
        base_checksum: Option<&str>,
    ) -> Result<(), SvnError> {
        let encoder = SvndiffEncoder::new(&self.options)?;
        self.emit(EditorCommand::ApplyTextDelta {
            file_token: file_token(file),
            base_checksum: base_checksum.map(str::to_string),
        })?;
        self.encoders.insert(file, encoder);
        Ok(())
    }

    fn textdelta_window(&mut self, file: BatonId, window: &DeltaWindow) -> Result<(), SvnError> {
        let encoder = self
            .encoders
            .get_mut(&file)
            .ok_or_else(|| SvnError::Protocol(format!("no text delta open for baton {file}")))?;
        let chunk = encoder.encode(window)?;
        self.emit(EditorCommand::TextDeltaChunk {
            file_token: file_token(file),
            chunk,
        })
    }

    fn textdelta_end(&mut self, file: BatonId) -> Result<Option<String>, SvnError> {
        let encoder = self
            .encoders
            .remove(&file)
            .ok_or_else(|| SvnError::Protocol(format!("no text delta open for baton {file}")))?;
        let header = encoder.finish();
        if !header.is_empty() {
            self.emit(EditorCommand::TextDeltaChunk {
                file_token: file_token(file),
                chunk: header,
            })?;
        }
        self.emit(EditorCommand::TextDeltaEnd {
            file_token: file_token(file),
        })?;
        Ok(None)
    }

    fn change_file_prop(
        &mut self,
        file: BatonId,
        name: &str,
        value: Option<&[u8]>,
    ) -> Result<(), SvnError> {
        self.emit(EditorCommand::ChangeFileProp {
            file_token: file_token(file),
            name: name.to_string(),
            value: value.map(<[u8]>::to_vec),
        })
    }

    fn close_file(&mut self, file: BatonId, text_checksum: Option<&str>) -> Result<(), SvnError> {
        self.emit(EditorCommand::CloseFile {
            file_token: file_token(file),
            text_checksum: text_checksum.map(str::to_string),
        })
    }

    fn absent_file(&mut self, parent: BatonId, path: &str) -> Result<(), SvnError> {
        self.emit(EditorCommand::AbsentFile {
            path: path.to_string(),
            parent_token: dir_token(parent),
        })
    }

    fn close_edit(&mut self) -> Result<(), SvnError> {
        self.emit(EditorCommand::CloseEdit)
    }

    fn abort_edit(&mut self) -> Result<(), SvnError> {
        self.encoders.clear();
        self.emit(EditorCommand::AbortEdit)
    }
}
