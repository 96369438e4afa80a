use std::collections::HashMap;

use crate::editor::{DirectoryEditor, Editor, FileEditor};
use crate::svndiff::SvndiffDecoder;
use crate::txdelta::TxDeltaHandler;
use crate::SvnError;

use super::EditorCommand;

struct ReplayFile<'a> {
    editor: FileEditor<'a>,
    delta: Option<(TxDeltaHandler<'a>, SvndiffDecoder)>,
}

/// Applies [`EditorCommand`]s to an [`Editor`], one at a time.
///
/// Tokens are resolved to the directory and file handles they were opened
/// as; every call still goes through the editor's protocol checks.
pub struct CommandReplayer<'e, 'a> {
    editor: &'e mut Editor<'a>,
    dirs: HashMap<String, DirectoryEditor<'a>>,
    files: HashMap<String, ReplayFile<'a>>,
    done: bool,
}

impl std::fmt::Debug for CommandReplayer<'_, '_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandReplayer")
            .field("open_dirs", &self.dirs.len())
            .field("open_files", &self.files.len())
            .field("done", &self.done)
            .finish()
    }
}

impl<'e, 'a> CommandReplayer<'e, 'a> {
    /// Creates a replayer driving `editor`.
    pub fn new(editor: &'e mut Editor<'a>) -> Self {
        Self {
            editor,
            dirs: HashMap::new(),
            files: HashMap::new(),
            done: false,
        }
    }

    /// Returns `true` once a `close-edit` or `abort-edit` was applied.
    pub fn is_done(&self) -> bool {
        self.done
    }

    fn dir(&mut self, token: &str) -> Result<&mut DirectoryEditor<'a>, SvnError> {
        self.dirs
            .get_mut(token)
            .ok_or_else(|| SvnError::Protocol(format!("unknown directory token '{token}'")))
    }

    fn file(&mut self, token: &str) -> Result<&mut ReplayFile<'a>, SvnError> {
        self.files
            .get_mut(token)
            .ok_or_else(|| SvnError::Protocol(format!("unknown file token '{token}'")))
    }

    fn check_new_token(&self, token: &str) -> Result<(), SvnError> {
        if self.dirs.contains_key(token) || self.files.contains_key(token) {
            return Err(SvnError::Protocol(format!("token '{token}' is already in use")));
        }
        Ok(())
    }

    /// Applies one command.
    pub fn apply(&mut self, command: EditorCommand) -> Result<(), SvnError> {
        if self.done {
            return Err(SvnError::Protocol(format!(
                "'{}' received after the edit ended",
                command.name()
            )));
        }
        tracing::trace!(command = command.name(), "replaying editor command");
        match command {
            EditorCommand::TargetRev { rev } => self.editor.set_target_revision(rev)?,
            EditorCommand::OpenRoot { rev, token } => {
                self.check_new_token(&token)?;
                let root = self.editor.open_root(rev)?;
                self.dirs.insert(token, root);
            }
            EditorCommand::DeleteEntry {
                path,
                rev,
                dir_token,
            } => self.dir(&dir_token)?.delete_entry(&path, rev)?,
            EditorCommand::AddDir {
                path,
                parent_token,
                child_token,
                copy_from,
            } => {
                self.check_new_token(&child_token)?;
                let child = self.dir(&parent_token)?.add_directory(&path, copy_from)?;
                self.dirs.insert(child_token, child);
            }
            EditorCommand::OpenDir {
                path,
                parent_token,
                child_token,
                rev,
            } => {
                self.check_new_token(&child_token)?;
                let child = self.dir(&parent_token)?.open_directory(&path, rev)?;
                self.dirs.insert(child_token, child);
            }
            EditorCommand::ChangeDirProp {
                dir_token,
                name,
                value,
            } => self.dir(&dir_token)?.change_prop(&name, value.as_deref())?,
            EditorCommand::CloseDir { dir_token } => {
                self.dir(&dir_token)?.close()?;
                self.dirs.remove(&dir_token);
            }
            EditorCommand::AbsentDir { path, parent_token } => {
                self.dir(&parent_token)?.absent_directory(&path)?;
            }
            EditorCommand::AddFile {
                path,
                dir_token,
                file_token,
                copy_from,
            } => {
                self.check_new_token(&file_token)?;
                let editor = self.dir(&dir_token)?.add_file(&path, copy_from)?;
                self.files.insert(file_token, ReplayFile { editor, delta: None });
            }
            EditorCommand::OpenFile {
                path,
                dir_token,
                file_token,
                rev,
            } => {
                self.check_new_token(&file_token)?;
                let editor = self.dir(&dir_token)?.open_file(&path, rev)?;
                self.files.insert(file_token, ReplayFile { editor, delta: None });
            }
            EditorCommand::ApplyTextDelta {
                file_token,
                base_checksum,
            } => {
                let file = self.file(&file_token)?;
                let handler = file.editor.apply_textdelta(base_checksum.as_deref())?;
                file.delta = Some((handler, SvndiffDecoder::new()));
            }
            EditorCommand::TextDeltaChunk { file_token, chunk } => {
                let file = self.file(&file_token)?;
                let (handler, decoder) = file.delta.as_mut().ok_or_else(|| {
                    SvnError::Protocol(format!(
                        "textdelta-chunk for '{file_token}' before apply-textdelta"
                    ))
                })?;
                decoder.push(&chunk)?;
                while let Some(window) = decoder.next_window()? {
                    handler.send(Some(&window))?;
                }
            }
            EditorCommand::TextDeltaEnd { file_token } => {
                let file = self.file(&file_token)?;
                let (handler, decoder) = file.delta.take().ok_or_else(|| {
                    SvnError::Protocol(format!(
                        "textdelta-end for '{file_token}' before apply-textdelta"
                    ))
                })?;
                decoder.finish()?;
                handler.finish()?;
            }
            EditorCommand::ChangeFileProp {
                file_token,
                name,
                value,
            } => self.file(&file_token)?.editor.change_prop(&name, value.as_deref())?,
            EditorCommand::CloseFile {
                file_token,
                text_checksum,
            } => {
                self.file(&file_token)?.editor.close(text_checksum.as_deref())?;
                self.files.remove(&file_token);
            }
            EditorCommand::AbsentFile { path, parent_token } => {
                self.dir(&parent_token)?.absent_file(&path)?;
            }
            EditorCommand::CloseEdit => {
                self.editor.close()?;
                self.done = true;
            }
            EditorCommand::AbortEdit => {
                self.done = true;
                self.editor.abort()?;
            }
        }
        Ok(())
    }

    /// Aborts the edit if it is still open.
    pub fn abort(&mut self) {
        self.done = true;
        self.files.clear();
        self.dirs.clear();
        if self.editor.is_open()
            && let Err(err) = self.editor.abort()
        {
            tracing::debug!(error = %err, "abort during replay failed");
        }
    }
}

/// Replays `commands` against `editor`.
///
/// On any error the edit is aborted before the error is returned. A command
/// sequence that ends without `close-edit` or `abort-edit` is a protocol
/// error.
pub fn replay_commands(
    editor: &mut Editor<'_>,
    commands: impl IntoIterator<Item = EditorCommand>,
) -> Result<(), SvnError> {
    let mut replayer = CommandReplayer::new(editor);
    for command in commands {
        if let Err(err) = replayer.apply(command) {
            replayer.abort();
            return Err(err);
        }
    }
    if !replayer.is_done() {
        replayer.abort();
        return Err(SvnError::Protocol(
            "command stream ended without close-edit".into(),
        ));
    }
    Ok(())
}
