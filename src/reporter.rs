//! Describing a working copy's state so a counterpart can compute an edit.

use crate::session::BusyGuard;
use crate::{Depth, Revnum, SvnError, normalize_revnum, path};

#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, Debug, PartialEq, Eq)]
/// Client-to-server report commands used by operations like `update`/`switch`.
pub enum ReportCommand {
    /// Adds or updates a path in the report.
    SetPath {
        /// Path relative to the report target.
        path: String,
        /// Revision to report for this path.
        rev: Revnum,
        /// Whether this path should start empty.
        start_empty: bool,
        /// Optional lock token to include.
        lock_token: Option<String>,
        /// Requested depth.
        depth: Depth,
    },
    /// Deletes a path in the report.
    DeletePath {
        /// Path relative to the report target.
        path: String,
    },
    /// Links a path to a URL in the report.
    LinkPath {
        /// Path relative to the report target.
        path: String,
        /// URL to link to.
        url: String,
        /// Revision to report for this link.
        rev: Revnum,
        /// Whether this path should start empty.
        start_empty: bool,
        /// Optional lock token to include.
        lock_token: Option<String>,
        /// Requested depth.
        depth: Depth,
    },
    /// Terminates the report successfully.
    FinishReport,
    /// Aborts the report.
    AbortReport,
}

impl ReportCommand {
    /// The `ra_svn` command word.
    pub fn name(&self) -> &'static str {
        match self {
            Self::SetPath { .. } => "set-path",
            Self::DeletePath { .. } => "delete-path",
            Self::LinkPath { .. } => "link-path",
            Self::FinishReport => "finish-report",
            Self::AbortReport => "abort-report",
        }
    }
}

#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, Debug, Default, PartialEq, Eq)]
/// A sequence of [`ReportCommand`] values.
pub struct Report {
    /// Commands in the report. Reports must end with `finish-report` or
    /// `abort-report`.
    pub commands: Vec<ReportCommand>,
}

impl Report {
    /// Creates an empty report.
    pub fn new() -> Self {
        Self {
            commands: Vec::new(),
        }
    }

    /// Appends a command to the report.
    pub fn push(&mut self, cmd: ReportCommand) -> &mut Self {
        self.commands.push(cmd);
        self
    }

    /// Appends a `finish-report` terminator.
    pub fn finish(&mut self) -> &mut Self {
        self.commands.push(ReportCommand::FinishReport);
        self
    }

    /// Returns `true` once the report ends with `finish-report`.
    pub fn is_finished(&self) -> bool {
        matches!(self.commands.last(), Some(ReportCommand::FinishReport))
    }

    /// Checks that the report opens with `set-path ""`, ends with
    /// `finish-report`, and carries no command after its terminator.
    pub fn validate(&self) -> Result<(), SvnError> {
        match self.commands.first() {
            Some(ReportCommand::SetPath { path, .. }) if path.is_empty() => {}
            Some(other) => {
                return Err(SvnError::Protocol(format!(
                    "report must start with set-path on the target, not {}",
                    other.name()
                )));
            }
            None => return Err(SvnError::Protocol("report is empty".into())),
        }
        let Some(end) = self
            .commands
            .iter()
            .position(|cmd| matches!(cmd, ReportCommand::FinishReport | ReportCommand::AbortReport))
        else {
            return Err(SvnError::Protocol(
                "report did not end with finish-report/abort-report".into(),
            ));
        };
        if end + 1 != self.commands.len() {
            return Err(SvnError::Protocol(
                "report continues after its terminator".into(),
            ));
        }
        if self.commands[end] == ReportCommand::AbortReport {
            return Err(SvnError::Protocol("report was aborted".into()));
        }
        Ok(())
    }
}

/// Receives the commands of a [`Reporter`].
pub trait ReportSink {
    /// Takes one `set-path`, `delete-path` or `link-path` command.
    fn command(&mut self, command: ReportCommand) -> Result<(), SvnError>;

    /// The report is complete; compute and deliver the result.
    fn finish(&mut self) -> Result<(), SvnError>;

    /// The report is abandoned.
    fn abort(&mut self) -> Result<(), SvnError>;
}

impl ReportSink for Report {
    fn command(&mut self, command: ReportCommand) -> Result<(), SvnError> {
        self.push(command);
        Ok(())
    }

    fn finish(&mut self) -> Result<(), SvnError> {
        Report::finish(self);
        self.validate()
    }

    fn abort(&mut self) -> Result<(), SvnError> {
        self.push(ReportCommand::AbortReport);
        Ok(())
    }
}

impl<S: ReportSink + ?Sized> ReportSink for &mut S {
    fn command(&mut self, command: ReportCommand) -> Result<(), SvnError> {
        (**self).command(command)
    }

    fn finish(&mut self) -> Result<(), SvnError> {
        (**self).finish()
    }

    fn abort(&mut self) -> Result<(), SvnError> {
        (**self).abort()
    }
}

struct ReporterState<'a> {
    sink: Box<dyn ReportSink + 'a>,
    // Held until finish or abort returns.
    _busy: Option<BusyGuard>,
}

/// Builds a report one call at a time.
///
/// Paths are relative to the report target; the first call must describe
/// the target itself (`set_path("", ...)`). [`finish`](Self::finish) and
/// [`abort`](Self::abort) end the report; every call after that fails with
/// [`SvnError::Protocol`].
pub struct Reporter<'a> {
    state: Option<ReporterState<'a>>,
    started: bool,
}

impl std::fmt::Debug for Reporter<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reporter")
            .field("finished", &self.state.is_none())
            .field("started", &self.started)
            .finish()
    }
}

impl<'a> Reporter<'a> {
    /// Creates a reporter forwarding to `sink`.
    pub fn new(sink: impl ReportSink + 'a) -> Self {
        Self::from_parts(Box::new(sink), None)
    }

    pub(crate) fn from_parts(sink: Box<dyn ReportSink + 'a>, busy: Option<BusyGuard>) -> Self {
        Self {
            state: Some(ReporterState { sink, _busy: busy }),
            started: false,
        }
    }

    /// Returns `true` until the report is finished or aborted.
    pub fn is_active(&self) -> bool {
        self.state.is_some()
    }

    fn sink(&mut self) -> Result<&mut (dyn ReportSink + 'a), SvnError> {
        match self.state.as_mut() {
            Some(state) => Ok(state.sink.as_mut()),
            None => Err(SvnError::Protocol("reporter already finished".into())),
        }
    }

    fn forward(&mut self, path: &str, command: ReportCommand) -> Result<(), SvnError> {
        let first = !self.started;
        let sink = self.sink()?;
        if first && !path.is_empty() {
            return Err(SvnError::Protocol(format!(
                "the first report call must describe the target, not '{path}'"
            )));
        }
        sink.command(command)?;
        self.started = true;
        Ok(())
    }

    /// Reports that `path` is at `rev`.
    ///
    /// With `start_empty`, children of `path` not reported separately are
    /// treated as missing.
    pub fn set_path(
        &mut self,
        path: &str,
        rev: Revnum,
        start_empty: bool,
        lock_token: Option<&str>,
        depth: Depth,
    ) -> Result<(), SvnError> {
        self.sink()?;
        let path = path::validate_rel_dir_path(path)?;
        let rev = report_rev(&path, rev)?;
        tracing::trace!(path = %path, rev, start_empty, depth = depth.as_word(), "report set-path");
        self.forward(
            &path.clone(),
            ReportCommand::SetPath {
                path,
                rev,
                start_empty,
                lock_token: lock_token.map(str::to_string),
                depth,
            },
        )
    }

    /// Reports that `path` is missing.
    pub fn delete_path(&mut self, path: &str) -> Result<(), SvnError> {
        self.sink()?;
        let path = path::validate_rel_path(path)?;
        tracing::trace!(path = %path, "report delete-path");
        self.forward(&path.clone(), ReportCommand::DeletePath { path })
    }

    /// Reports that `path` comes from `url` at `rev`.
    pub fn link_path(
        &mut self,
        path: &str,
        url: &str,
        rev: Revnum,
        start_empty: bool,
        lock_token: Option<&str>,
        depth: Depth,
    ) -> Result<(), SvnError> {
        self.sink()?;
        let path = path::validate_rel_dir_path(path)?;
        if url.is_empty() {
            return Err(SvnError::InvalidPath("link_path URL is empty".into()));
        }
        let rev = report_rev(&path, rev)?;
        tracing::trace!(path = %path, url, rev, "report link-path");
        self.forward(
            &path.clone(),
            ReportCommand::LinkPath {
                path,
                url: url.to_string(),
                rev,
                start_empty,
                lock_token: lock_token.map(str::to_string),
                depth,
            },
        )
    }

    /// Completes the report. The counterpart computes its edit now.
    pub fn finish(&mut self) -> Result<(), SvnError> {
        let started = self.started;
        let Some(mut state) = self.state.take() else {
            return Err(SvnError::Protocol("reporter already finished".into()));
        };
        if !started {
            let err = SvnError::Protocol("report finished without describing the target".into());
            if let Err(abort_err) = state.sink.abort() {
                tracing::debug!(error = %abort_err, "abort of empty report failed");
            }
            return Err(err);
        }
        let res = state.sink.finish();
        tracing::debug!(ok = res.is_ok(), "report finished");
        res
    }

    /// Abandons the report.
    pub fn abort(&mut self) -> Result<(), SvnError> {
        let Some(mut state) = self.state.take() else {
            return Err(SvnError::Protocol("reporter already finished".into()));
        };
        tracing::debug!("report aborted");
        state.sink.abort()
    }
}

impl Drop for Reporter<'_> {
    fn drop(&mut self) {
        if let Some(mut state) = self.state.take() {
            tracing::warn!("reporter dropped before finish; aborting");
            if let Err(err) = state.sink.abort() {
                tracing::warn!(error = %err, "abort of dropped report failed");
            }
        }
    }
}

fn report_rev(path: &str, rev: Revnum) -> Result<Revnum, SvnError> {
    normalize_revnum(Some(rev))
        .ok_or_else(|| SvnError::Protocol(format!("report for '{path}' has no revision")))
}
