//! Caller-supplied hooks invoked while an edit or report is in progress.
//!
//! All hooks are plain trait objects. Errors returned from a hook surface to
//! the caller as [`SvnError::Callback`]; cancellations surface as
//! [`SvnError::Cancelled`].

use std::sync::Arc;

use crate::{NodeKind, Revnum, SvnError};

/// Polled by long-running operations to find out whether to stop.
pub trait CancelCheck: Send + Sync {
    /// Returns `true` if the current operation should unwind.
    fn is_cancelled(&self) -> bool;
}

impl<F> CancelCheck for F
where
    F: Fn() -> bool + Send + Sync,
{
    fn is_cancelled(&self) -> bool {
        self()
    }
}

/// Receives transfer progress.
///
/// `transferred` never decreases across calls for one operation; `total` is
/// `None` when the size is unknown.
pub trait ProgressSink: Send + Sync {
    /// Called after each chunk of content is handed on.
    fn on_progress(&self, transferred: u64, total: Option<u64>);
}

impl<F> ProgressSink for F
where
    F: Fn(u64, Option<u64>) + Send + Sync,
{
    fn on_progress(&self, transferred: u64, total: Option<u64>) {
        self(transferred, total)
    }
}

/// What happened to a path during an editor-driven tree walk.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum NotifyAction {
    /// The path was added.
    Added,
    /// The path was deleted.
    Deleted,
    /// The path's text changed (properties may have changed too).
    Updated,
    /// Only the path's properties changed.
    PropsChanged,
    /// The path is present but inaccessible (absent).
    Absent,
}

/// A structured tree-walk event.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Notification {
    /// Edit-relative path.
    pub path: String,
    /// What happened.
    pub action: NotifyAction,
    /// Node kind, when known.
    pub kind: NodeKind,
    /// Target revision of the edit, when known.
    pub revision: Option<Revnum>,
}

/// Receives [`Notification`]s.
pub trait NotifyHandler: Send + Sync {
    /// Called once per event. Returning an error stops the walk.
    fn on_notify(&self, notification: &Notification) -> Result<(), SvnError>;
}

impl<F> NotifyHandler for F
where
    F: Fn(&Notification) -> Result<(), SvnError> + Send + Sync,
{
    fn on_notify(&self, notification: &Notification) -> Result<(), SvnError> {
        self(notification)
    }
}

/// The hook set carried by an edit, a report, or a session.
#[derive(Clone, Default)]
pub struct Callbacks {
    cancel: Option<Arc<dyn CancelCheck>>,
    progress: Option<Arc<dyn ProgressSink>>,
    notify: Option<Arc<dyn NotifyHandler>>,
}

impl std::fmt::Debug for Callbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Callbacks")
            .field("cancel", &self.cancel.is_some())
            .field("progress", &self.progress.is_some())
            .field("notify", &self.notify.is_some())
            .finish()
    }
}

impl Callbacks {
    /// Creates an empty hook set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the cancellation check.
    #[must_use]
    pub fn with_cancel(mut self, cancel: impl CancelCheck + 'static) -> Self {
        self.cancel = Some(Arc::new(cancel));
        self
    }

    /// Sets the progress sink.
    #[must_use]
    pub fn with_progress(mut self, progress: impl ProgressSink + 'static) -> Self {
        self.progress = Some(Arc::new(progress));
        self
    }

    /// Sets the notification handler.
    #[must_use]
    pub fn with_notify(mut self, notify: impl NotifyHandler + 'static) -> Self {
        self.notify = Some(Arc::new(notify));
        self
    }

    /// Fails with [`SvnError::Cancelled`] if the cancellation check fires.
    pub fn check_cancel(&self) -> Result<(), SvnError> {
        match &self.cancel {
            Some(cancel) if cancel.is_cancelled() => Err(SvnError::Cancelled),
            _ => Ok(()),
        }
    }

    /// Delivers a notification, wrapping handler failures.
    pub fn notify(&self, notification: &Notification) -> Result<(), SvnError> {
        match &self.notify {
            Some(notify) => notify.on_notify(notification).map_err(SvnError::callback),
            None => Ok(()),
        }
    }

    pub(crate) fn progress_tracker(&self) -> ProgressTracker {
        ProgressTracker {
            sink: self.progress.clone(),
            transferred: 0,
            total: None,
        }
    }
}

/// Accumulates byte counts and reports running totals to a [`ProgressSink`].
#[derive(Clone, Default)]
pub(crate) struct ProgressTracker {
    sink: Option<Arc<dyn ProgressSink>>,
    transferred: u64,
    total: Option<u64>,
}

impl ProgressTracker {
    pub(crate) fn set_total(&mut self, total: Option<u64>) {
        self.total = total;
    }

    pub(crate) fn add(&mut self, bytes: u64) {
        self.transferred = self.transferred.saturating_add(bytes);
        if let Some(sink) = &self.sink {
            sink.on_progress(self.transferred, self.total);
        }
    }

    pub(crate) fn transferred(&self) -> u64 {
        self.transferred
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;

    #[test]
    fn check_cancel_reports_cancellation() {
        let flag = Arc::new(AtomicBool::new(false));
        let seen = Arc::clone(&flag);
        let callbacks = Callbacks::new().with_cancel(move || seen.load(Ordering::SeqCst));

        callbacks.check_cancel().unwrap();
        flag.store(true, Ordering::SeqCst);
        let err = callbacks.check_cancel().unwrap_err();
        assert!(err.is_cancelled());
    }

    #[test]
    fn notify_errors_are_wrapped_as_callback_errors() {
        let callbacks = Callbacks::new()
            .with_notify(|_: &Notification| Err(SvnError::Protocol("sink full".into())));
        let err = callbacks
            .notify(&Notification {
                path: "trunk".into(),
                action: NotifyAction::Added,
                kind: NodeKind::Dir,
                revision: None,
            })
            .unwrap_err();
        assert!(matches!(err, SvnError::Callback(_)));
    }

    #[test]
    fn progress_is_cumulative() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let callbacks = Callbacks::new().with_progress(move |done: u64, total: Option<u64>| {
            sink.lock().unwrap().push((done, total));
        });

        let mut tracker = callbacks.progress_tracker();
        tracker.set_total(Some(10));
        tracker.add(3);
        tracker.add(0);
        tracker.add(7);
        assert_eq!(tracker.transferred(), 10);
        assert_eq!(
            *seen.lock().unwrap(),
            vec![(3, Some(10)), (3, Some(10)), (10, Some(10))]
        );
    }
}
