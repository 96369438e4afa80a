//! Subversion's tree-delta protocol core.
//!
//! This crate implements the call contracts Subversion uses to move tree
//! changes between a producer and a consumer: the baton-based tree
//! [`Editor`], streamed text deltas ([`DeltaWindow`], [`TxDeltaHandler`],
//! svndiff), the [`Reporter`] that describes a working copy so a counterpart
//! can compute an update, and the post-commit [`CommitQueue`].
//!
//! Around that core it provides an in-memory storage engine
//! ([`MemRepository`]), a repository access session ([`RaSession`]) with a
//! one-operation-at-a-time busy flag, and a transport layer that flattens
//! edits into `ra_svn` commands.
//!
//! ## Getting started
//!
//! ```rust
//! use svn_delta::{DeltaWindow, Editor, Tree, TreeEditor, md5_hex};
//!
//! fn main() -> svn_delta::Result<()> {
//!     let mut consumer = TreeEditor::new(Tree::new());
//!     {
//!         let mut editor = Editor::new(&mut consumer);
//!         let mut root = editor.open_root(None)?;
//!         let mut trunk = root.add_directory("trunk", None)?;
//!         let mut readme = trunk.add_file("trunk/README", None)?;
//!         let mut handler = readme.apply_textdelta(None)?;
//!         handler.send(Some(&DeltaWindow::insertion(b"hello".to_vec())))?;
//!         handler.finish()?;
//!         readme.close(Some(md5_hex(b"hello").as_str()))?;
//!         trunk.close()?;
//!         root.close()?;
//!         editor.close()?;
//!     }
//!     let tree = consumer.into_tree();
//!     assert_eq!(tree.file("trunk/README").map(|f| f.contents.as_slice()), Some(&b"hello"[..]));
//!     Ok(())
//! }
//! ```
//!
//! ## Features
//!
//! - `serde`: enables `Serialize`/`Deserialize` for public data types.
//!
//! ## Threads
//!
//! Editor and reporter handles are `!Send`: an edit is driven from one
//! thread. To carry an edit between threads, flatten it with
//! [`transport::channel_editor`] and consume it with
//! [`transport::drive_channel`].

#![deny(unsafe_code)]

mod callbacks;
mod committed;
mod editor;
mod error;
mod log;
mod options;
pub mod path;
mod reporter;
mod repos;
mod session;
mod svndiff;
mod tree;
mod txdelta;
mod types;
mod wc;
mod window;

pub mod transport;

pub use callbacks::{
    CancelCheck, Callbacks, Notification, NotifyAction, NotifyHandler, ProgressSink,
};
pub use committed::{CommitFailure, CommitQueue, ProcessOutcome, WcContext, process_committed};
pub use editor::{BatonId, DirectoryEditor, Editor, EditorSink, FileEditor};
pub use error::{
    ERR_CANCELLED, ERR_ENTRY_NOT_FOUND, ERR_FS_ALREADY_EXISTS, ERR_FS_BAD_LOCK_TOKEN,
    ERR_FS_NO_SUCH_LOCK, ERR_FS_NOT_FOUND, ERR_FS_PATH_ALREADY_LOCKED, ERR_FS_TXN_OUT_OF_DATE,
    ERR_NODE_UNEXPECTED_KIND, ERR_RA_NOT_AUTHORIZED, EngineError, EngineErrorItem, SvnError,
};
/// Convenience alias for results returned by this crate.
pub type Result<T> = std::result::Result<T, SvnError>;
pub use log::LogIter;
pub use options::{
    CommitLockToken, CommitOptions, DELTA_WINDOW_SIZE, LockOptions, LogOptions, LogRevProps,
    QueueItemOptions, ReplayOptions, StatusOptions, SvndiffOptions, SwitchOptions, UnlockOptions,
    UpdateOptions,
};
pub use reporter::{Report, ReportCommand, ReportSink, Reporter};
pub use repos::{CopyMap, MemRepository, Repository, Transaction, format_date, tree_changes};
pub use session::RaSession;
pub use svndiff::{SvndiffDecoder, SvndiffEncoder, SvndiffVersion};
pub use tree::{
    CopySource, DirNode, DriveOptions, FileNode, Node, Tree, TreeEditor, drive_tree_delta,
};
pub use txdelta::{DeltaGenerator, TextDeltaApplier, TxDeltaHandler, md5_hex, send_delta};
pub use types::{
    Capability, ChangeAction, ChangedPath, CommitInfo, CopyFrom, Depth, INVALID_REVNUM, Lock,
    LogEntry, NodeKind, PROP_REVISION_AUTHOR, PROP_REVISION_DATE, PROP_REVISION_LOG, PropChange,
    PropertyList, Revnum, normalize_revnum,
};
pub use wc::{MemWcAdmin, Schedule, WcAdmin, WcEntry, crawl_revisions};
pub use window::{DeltaAction, DeltaOp, DeltaWindow};
