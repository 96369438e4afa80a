use tokio::sync::mpsc;

use crate::editor::Editor;
use crate::SvnError;

use super::recorder::{ChannelEditor, CommandOutput, CommandWriter};
use super::{CommandReplayer, EditorCommand};

/// Sending half of an editor channel.
///
/// Sends block the producing thread while the channel is full, so the
/// producer must not run on an async runtime thread.
#[derive(Debug)]
pub struct ChannelOutput {
    tx: mpsc::Sender<EditorCommand>,
}

impl CommandOutput for ChannelOutput {
    fn emit(&mut self, command: EditorCommand) -> Result<(), SvnError> {
        self.tx
            .blocking_send(command)
            .map_err(|_| SvnError::Protocol("editor channel closed by the receiver".into()))
    }
}

/// How a channel-driven edit ended.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DriveStatus {
    /// The sender closed the edit.
    Completed,
    /// The sender aborted the edit.
    Aborted,
}

/// Creates an [`EditorSink`](crate::EditorSink) that forwards every call
/// as an [`EditorCommand`] over a bounded channel of `capacity` commands.
pub fn channel_editor(capacity: usize) -> (ChannelEditor, mpsc::Receiver<EditorCommand>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (CommandWriter::with_output(ChannelOutput { tx }), rx)
}

/// Receives commands from `rx` and replays them against `editor` until the
/// edit ends.
///
/// If the channel closes before `close-edit` or `abort-edit` arrives, or a
/// command fails, the edit is aborted and the error returned. The returned
/// future holds editor handles and is not `Send`; drive it with `block_on` or
/// on a local task set.
pub async fn drive_channel(
    mut rx: mpsc::Receiver<EditorCommand>,
    editor: &mut Editor<'_>,
) -> Result<DriveStatus, SvnError> {
    let mut replayer = CommandReplayer::new(editor);
    let mut received = 0u64;
    loop {
        let Some(command) = rx.recv().await else {
            replayer.abort();
            tracing::debug!(received, "editor channel closed mid-edit");
            return Err(SvnError::Protocol(
                "editor channel closed before close-edit".into(),
            ));
        };
        received += 1;
        let status = match command {
            EditorCommand::CloseEdit => Some(DriveStatus::Completed),
            EditorCommand::AbortEdit => Some(DriveStatus::Aborted),
            _ => None,
        };
        if let Err(err) = replayer.apply(command) {
            replayer.abort();
            return Err(err);
        }
        if let Some(status) = status {
            tracing::debug!(received, ?status, "channel edit finished");
            return Ok(status);
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use std::future::Future;

    use super::*;
    use crate::tree::{DriveOptions, Tree, TreeEditor, drive_tree_delta};

    fn run_async<T>(f: impl Future<Output = T>) -> T {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap()
            .block_on(f)
    }

    fn sample() -> Tree {
        let mut tree = Tree::new();
        tree.put_file("trunk/README", "hello").unwrap();
        tree.put_file("trunk/big", vec![b'x'; 300_000]).unwrap();
        tree.mkdir_p("branches").unwrap();
        tree
    }

    #[test]
    fn channel_carries_an_edit_between_threads() {
        let target = sample();
        let (sink, rx) = channel_editor(2);
        let expected = target.clone();
        let producer = std::thread::spawn(move || {
            let mut sink = sink;
            let mut editor = Editor::new(&mut sink);
            drive_tree_delta(&mut editor, &Tree::new(), &target, &DriveOptions::new())
        });

        let mut consumer = TreeEditor::new(Tree::new());
        let status = {
            let mut editor = Editor::new(&mut consumer);
            run_async(drive_channel(rx, &mut editor)).unwrap()
        };
        producer.join().unwrap().unwrap();
        assert_eq!(status, DriveStatus::Completed);
        assert_eq!(consumer.into_tree(), expected);
    }

    #[test]
    fn producer_abort_is_reported() {
        let (sink, rx) = channel_editor(4);
        let producer = std::thread::spawn(move || {
            let mut editor = Editor::new(sink);
            let mut root = editor.open_root(None)?;
            root.add_directory("half", None)?;
            editor.abort()
        });

        let mut consumer = TreeEditor::new(sample());
        let status = {
            let mut editor = Editor::new(&mut consumer);
            run_async(drive_channel(rx, &mut editor)).unwrap()
        };
        producer.join().unwrap().unwrap();
        assert_eq!(status, DriveStatus::Aborted);
        assert_eq!(consumer.into_tree(), sample());
    }

    #[test]
    fn dropped_sender_aborts_the_consumer() {
        let (tx, rx) = mpsc::channel(4);
        tx.blocking_send(EditorCommand::OpenRoot {
            rev: None,
            token: "d0.0".into(),
        })
        .unwrap();
        drop(tx);

        let mut consumer = TreeEditor::new(sample());
        {
            let mut editor = Editor::new(&mut consumer);
            let err = run_async(drive_channel(rx, &mut editor)).unwrap_err();
            assert!(matches!(err, SvnError::Protocol(_)));
            assert!(!editor.is_open());
        }
        assert_eq!(consumer.into_tree(), sample());
    }
}
