use std::backtrace::Backtrace;
use std::error::Error as StdError;
use std::fmt;

use tracing_error::SpanTrace;

/// What went wrong, independent of which driver noticed.
///
/// Registry code branches on the kind (a missing link is routine, a missing
/// blob under an existing link is not), never on messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageErrorKind {
    /// Nothing exists at the path.
    NotFound,

    /// The path is malformed: empty, absolute, `..`, or forbidden characters.
    InvalidPath,

    /// The process may not touch the path.
    PermissionDenied,

    /// Disk or network I/O failed. Possibly transient.
    Io,

    /// The backend cannot serve requests right now.
    ServiceUnavailable,

    /// The request contradicts the stored state, e.g. an offset past the end
    /// of a file or a write onto a directory.
    InvalidRequest,

    /// A writer was used after commit or cancel.
    AlreadyFinished,

    /// Anything else.
    Other,
}

impl StorageErrorKind {
    /// Whether retrying the same request might succeed.
    ///
    /// Drivers never retry on their own; this is a hint for callers that do.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Io | Self::ServiceUnavailable)
    }
}

impl fmt::Display for StorageErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::NotFound => "not found",
            Self::InvalidPath => "invalid path",
            Self::PermissionDenied => "permission denied",
            Self::Io => "I/O error",
            Self::ServiceUnavailable => "service unavailable",
            Self::InvalidRequest => "invalid request",
            Self::AlreadyFinished => "writer already finished",
            Self::Other => "other error",
        })
    }
}

impl From<std::io::ErrorKind> for StorageErrorKind {
    fn from(kind: std::io::ErrorKind) -> Self {
        use std::io::ErrorKind;
        match kind {
            ErrorKind::NotFound => Self::NotFound,
            ErrorKind::PermissionDenied => Self::PermissionDenied,
            ErrorKind::InvalidInput => Self::InvalidRequest,
            _ => Self::Io,
        }
    }
}

#[derive(Debug)]
struct Traces {
    backtrace: Backtrace,
    span_trace: SpanTrace,
}

impl Traces {
    fn capture() -> Box<Self> {
        Box::new(Traces {
            backtrace: Backtrace::capture(),
            span_trace: SpanTrace::capture(),
        })
    }
}

/// An error from a storage driver.
///
/// Carries the [`StorageErrorKind`], the driver name, the path involved and
/// the span trace at the point of failure, so a failed registry operation can
/// be traced back through the async call stack.
///
/// ```rust
/// use storage_driver::{StorageError, StorageErrorKind};
///
/// let error = StorageError::builder("memory", StorageErrorKind::NotFound, "no such file")
///     .path("v2/blobs/sha256/ab/abcd/data")
///     .context("get content")
///     .build();
/// assert!(error.is_not_found());
/// assert_eq!(error.path(), Some("v2/blobs/sha256/ab/abcd/data"));
/// ```
#[derive(Debug)]
pub struct StorageError {
    kind: StorageErrorKind,
    engine: &'static str,
    path: Option<String>,
    context: Option<String>,
    source: Box<dyn StdError + Send + Sync + 'static>,
    traces: Box<Traces>,
}

impl StdError for StorageError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        Some(self.source.as_ref())
    }
}

impl StorageError {
    /// An error with no path or context attached.
    pub fn new<E>(engine: &'static str, kind: StorageErrorKind, error: E) -> Self
    where
        E: Into<Box<dyn StdError + Send + Sync + 'static>>,
    {
        Self::builder(engine, kind, error).build()
    }

    /// A `NotFound` error for `path`.
    pub fn not_found(engine: &'static str, path: impl Into<String>) -> Self {
        let path = path.into();
        let message = format!("Path not found: {path}");
        Self::builder(engine, StorageErrorKind::NotFound, message)
            .path(path)
            .build()
    }

    /// Classify an `io::Error` by its kind.
    pub fn io(engine: &'static str, path: impl Into<String>, error: std::io::Error) -> Self {
        Self::builder(engine, error.kind().into(), error)
            .path(path)
            .build()
    }

    /// Start building an error with a path or context.
    pub fn builder<E>(engine: &'static str, kind: StorageErrorKind, error: E) -> StorageErrorBuilder
    where
        E: Into<Box<dyn StdError + Send + Sync + 'static>>,
    {
        StorageErrorBuilder {
            kind,
            engine,
            source: error.into(),
            path: None,
            context: None,
        }
    }

    /// A closure for `map_err` that wraps any error with a fixed kind.
    ///
    /// ```rust
    /// use storage_driver::{StorageError, StorageErrorKind};
    ///
    /// fn open() -> Result<std::fs::File, StorageError> {
    ///     std::fs::File::open("startedat")
    ///         .map_err(StorageError::with("local", StorageErrorKind::Io))
    /// }
    /// ```
    pub fn with<E>(
        engine: &'static str,
        kind: StorageErrorKind,
    ) -> impl FnOnce(E) -> StorageError + Send + Sync
    where
        E: Into<Box<dyn StdError + Send + Sync + 'static>>,
    {
        move |error: E| StorageError::new(engine, kind, error)
    }

    /// The error kind.
    pub fn kind(&self) -> StorageErrorKind {
        self.kind
    }

    /// Shorthand for `kind() == NotFound`.
    pub fn is_not_found(&self) -> bool {
        self.kind == StorageErrorKind::NotFound
    }

    /// Name of the driver which failed.
    pub fn engine(&self) -> &'static str {
        self.engine
    }

    /// The path involved, if any.
    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    /// What the driver was doing, if recorded.
    pub fn context(&self) -> Option<&str> {
        self.context.as_deref()
    }

    /// Backtrace, captured when `RUST_BACKTRACE` is set.
    pub fn backtrace(&self) -> &Backtrace {
        &self.traces.backtrace
    }

    /// Tracing spans active when the error was created.
    pub fn span_trace(&self) -> &SpanTrace {
        &self.traces.span_trace
    }
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Storage error [{}] from {}", self.kind, self.engine)?;
        if let Some(path) = &self.path {
            write!(f, " (path: {path})")?;
        }
        if let Some(context) = &self.context {
            write!(f, " ({context})")?;
        }
        write!(f, ": {}", self.source)
    }
}

/// Builder for a [`StorageError`] with optional path and context.
#[derive(Debug)]
pub struct StorageErrorBuilder {
    kind: StorageErrorKind,
    engine: &'static str,
    source: Box<dyn StdError + Send + Sync + 'static>,
    path: Option<String>,
    context: Option<String>,
}

impl StorageErrorBuilder {
    /// Attach the path.
    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Attach context.
    pub fn context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    /// Capture traces and finish.
    pub fn build(self) -> StorageError {
        StorageError {
            kind: self.kind,
            engine: self.engine,
            path: self.path,
            context: self.context,
            source: self.source,
            traces: Traces::capture(),
        }
    }
}
