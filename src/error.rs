use thiserror::Error;

use crate::Capability;

/// Error code used by the engine to signal a user-requested cancellation.
pub const ERR_CANCELLED: u64 = 200015;
/// Error code for a path that does not exist in the requested revision.
pub const ERR_FS_NOT_FOUND: u64 = 160013;
/// Error code for an item that is out of date with respect to the transaction base.
pub const ERR_FS_TXN_OUT_OF_DATE: u64 = 160028;
/// Error code for an attempt to add a node that already exists.
pub const ERR_FS_ALREADY_EXISTS: u64 = 160020;
/// Error code for a path locked by someone else.
pub const ERR_FS_PATH_ALREADY_LOCKED: u64 = 160035;
/// Error code for a path that is not locked.
pub const ERR_FS_NO_SUCH_LOCK: u64 = 160040;
/// Error code for a lock token that does not match the lock on the path.
pub const ERR_FS_BAD_LOCK_TOKEN: u64 = 160037;
/// Error code for an operation that needs an authenticated user.
pub const ERR_RA_NOT_AUTHORIZED: u64 = 170001;
/// Error code for a working-copy entry that could not be found.
pub const ERR_ENTRY_NOT_FOUND: u64 = 150000;
/// Error code for a node kind that does not match the requested operation.
pub const ERR_NODE_UNEXPECTED_KIND: u64 = 145001;

#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[non_exhaustive]
#[derive(Clone, Debug, PartialEq, Eq)]
/// One link of an engine error chain.
pub struct EngineErrorItem {
    /// Subversion error code.
    pub code: u64,
    /// Human-readable error message.
    pub message: Option<String>,
    /// Source file on the engine side, if provided.
    pub file: Option<String>,
    /// Source line on the engine side, if provided.
    pub line: Option<u64>,
}

impl EngineErrorItem {
    /// Creates a chain link with a code and message.
    pub fn new(code: u64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: Some(message.into()),
            file: None,
            line: None,
        }
    }
}

#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[non_exhaustive]
#[derive(Clone, Debug, PartialEq, Eq)]
/// A structured failure reported by the storage engine or transport.
///
/// `chain` is ordered outermost first; the last item is the root cause.
pub struct EngineError {
    /// High-level context for the failure (for example, the operation name).
    pub context: Option<String>,
    /// The full error chain.
    pub chain: Vec<EngineErrorItem>,
}

impl EngineError {
    /// Creates a single-link engine error.
    pub fn new(code: u64, message: impl Into<String>) -> Self {
        Self {
            context: None,
            chain: vec![EngineErrorItem::new(code, message)],
        }
    }

    /// Wraps `cause` in a new outer link, keeping the existing chain intact.
    pub fn wrap(cause: EngineError, code: u64, message: impl Into<String>) -> Self {
        let mut chain = Vec::with_capacity(cause.chain.len() + 1);
        chain.push(EngineErrorItem::new(code, message));
        chain.extend(cause.chain);
        Self {
            context: cause.context,
            chain,
        }
    }

    /// Attaches additional context to this error.
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    /// Returns the code of the outermost link.
    pub fn code(&self) -> Option<u64> {
        self.chain.first().map(|item| item.code)
    }

    /// Returns the full chain, outermost first.
    pub fn chain(&self) -> &[EngineErrorItem] {
        &self.chain
    }

    /// Returns the innermost link.
    pub fn root_cause(&self) -> Option<&EngineErrorItem> {
        self.chain.last()
    }

    /// Returns `true` if any link in the chain carries `code`.
    pub fn has_code(&self, code: u64) -> bool {
        self.chain.iter().any(|item| item.code == code)
    }

    /// Returns a single-line, human-readable message.
    pub fn message_summary(&self) -> String {
        let mut messages = Vec::new();
        for err in &self.chain {
            if let Some(message) = err.message.as_deref()
                && !message.is_empty()
            {
                messages.push(message);
            }
        }
        if messages.is_empty() {
            "unknown error".to_string()
        } else {
            messages.join("; ")
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(ctx) = self.context.as_deref()
            && !ctx.is_empty()
        {
            write!(f, "{ctx}: ")?;
        }
        write!(f, "{}", self.message_summary())
    }
}

#[derive(Debug, Error)]
#[non_exhaustive]
/// Errors returned by this crate.
pub enum SvnError {
    /// A path failed validation (for example, a leading `/` where a relative
    /// path is required).
    #[error("invalid path: {0}")]
    InvalidPath(String),
    /// A protocol call was made out of order or on a closed handle.
    #[error("protocol error: {0}")]
    Protocol(String),
    /// Another operation currently occupies the connection.
    #[error("connection busy: cannot start {0} while another operation is in progress")]
    Busy(&'static str),
    /// The operation was cancelled by the caller's cancellation check.
    #[error("operation cancelled")]
    Cancelled,
    /// The storage engine or transport reported a failure.
    #[error("engine error: {0}")]
    Engine(EngineError),
    /// A checksum did not match the expected value.
    #[error("checksum mismatch for '{path}': expected {expected}, actual {actual}")]
    ChecksumMismatch {
        /// Path of the text whose checksum was verified.
        path: String,
        /// Expected checksum (hex MD5).
        expected: String,
        /// Computed checksum (hex MD5).
        actual: String,
    },
    /// The connected engine does not support a requested capability.
    #[error("unsupported capability: {}", .0.as_wire_word())]
    UnsupportedCapability(Capability),
    /// Caller-supplied callback logic returned an error.
    #[error("callback failed: {0}")]
    Callback(Box<SvnError>),
    /// An I/O error occurred.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl SvnError {
    /// Creates an [`SvnError::Engine`] with a single chain link.
    pub fn engine(code: u64, message: impl Into<String>) -> Self {
        Self::Engine(EngineError::new(code, message))
    }

    /// Wraps an error raised by caller-supplied callback logic.
    ///
    /// Cancellations pass through unchanged so callers can still detect them
    /// with a plain match.
    pub fn callback(err: SvnError) -> Self {
        match err {
            SvnError::Cancelled | SvnError::Callback(_) => err,
            other => SvnError::Callback(Box::new(other)),
        }
    }

    /// Returns `true` if this error (or anything it wraps) is a cancellation.
    pub fn is_cancelled(&self) -> bool {
        match self {
            SvnError::Cancelled => true,
            SvnError::Callback(inner) => inner.is_cancelled(),
            SvnError::Engine(err) => err.has_code(ERR_CANCELLED),
            _ => false,
        }
    }

    /// Returns the engine error code, if this is an engine error.
    pub fn engine_code(&self) -> Option<u64> {
        match self {
            SvnError::Engine(err) => err.code(),
            _ => None,
        }
    }
}
