// Copyright 2026 refetch Project Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::{
    backtrace::Backtrace,
    fmt::{Debug, Display},
    sync::Arc,
    time::Duration,
};

/// ErrorKind is all kinds of Error of refetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Transport failure while talking to the remote source.
    Network,
    /// The remote source answered with a non-success status.
    ///
    /// The status code can be retrieved with [`Error::http_status`].
    Http,
    /// The response body cannot be parsed.
    Parse,
    /// A single fetch attempt exceeded its timeout.
    Timeout,
    /// The operation was superseded by a newer one or its owner went away.
    Cancelled,
    /// Invalid configuration.
    Config,
    /// A spawned task or a fetch function panicked.
    Join,
    /// Error raised by user code that does not fit the other kinds.
    External,
}

impl ErrorKind {
    /// Convert self into static str.
    pub fn into_static(self) -> &'static str {
        self.into()
    }

    /// Whether a failed fetch of this kind may be attempted again.
    ///
    /// Transport failures, timeouts and errors returned by user code are retried. A panicked task is not.
    pub fn is_retryable(self) -> bool {
        match self {
            ErrorKind::Network | ErrorKind::Http | ErrorKind::Timeout | ErrorKind::External => true,
            ErrorKind::Parse | ErrorKind::Cancelled | ErrorKind::Config | ErrorKind::Join => false,
        }
    }
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.into_static())
    }
}

impl From<ErrorKind> for &'static str {
    fn from(v: ErrorKind) -> &'static str {
        match v {
            ErrorKind::Network => "Network error",
            ErrorKind::Http => "HTTP error",
            ErrorKind::Parse => "Parse error",
            ErrorKind::Timeout => "Timeout",
            ErrorKind::Cancelled => "Cancelled",
            ErrorKind::Config => "Config error",
            ErrorKind::Join => "Join error",
            ErrorKind::External => "External error",
        }
    }
}

/// Non-success status code answered by the remote source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("status code {0}")]
pub struct HttpStatus(pub u16);

/// Error is the error struct returned by all refetch functions.
///
/// Errors are cheap to clone: the source and the backtrace are shared. This matters because one failed fetch is
/// handed to every deduplicated waiter and is also kept in the cache entry.
///
/// ## Display
///
/// - Via `Display`, the error is printed in a single line:
///
/// ```shell
/// HTTP error, context: { key: ["posts",1], status: 503 } => non-success status, source: status code 503
/// ```
///
/// - Via `Debug`, the error is printed in multiple lines with the context, source and backtrace (if captured).
///
/// - Via `{:#?}`, the conventional struct-style representation is used.
pub struct Error {
    kind: ErrorKind,
    message: String,

    context: Vec<(&'static str, String)>,

    source: Option<Arc<anyhow::Error>>,
    backtrace: Option<Arc<Backtrace>>,
}

impl Debug for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if f.alternate() {
            let mut de = f.debug_struct("Error");
            de.field("kind", &self.kind);
            de.field("message", &self.message);
            de.field("context", &self.context);
            de.field("source", &self.source);
            de.field("backtrace", &self.backtrace);
            return de.finish();
        }

        write!(f, "{}", self.kind)?;
        if !self.message.is_empty() {
            write!(f, " => {}", self.message)?;
        }
        writeln!(f)?;

        if !self.context.is_empty() {
            writeln!(f)?;
            writeln!(f, "Context:")?;
            for (k, v) in self.context.iter() {
                writeln!(f, "  {k}: {v}")?;
            }
        }

        if let Some(source) = &self.source {
            writeln!(f)?;
            writeln!(f, "Source:")?;
            writeln!(f, "  {source:#}")?;
        }

        if let Some(backtrace) = &self.backtrace {
            writeln!(f)?;
            writeln!(f, "Backtrace:")?;
            writeln!(f, "{backtrace}")?;
        }

        Ok(())
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.kind)?;

        if !self.context.is_empty() {
            write!(f, ", context: {{ ")?;
            let mut iter = self.context.iter().peekable();
            while let Some((k, v)) = iter.next() {
                write!(f, "{k}: {v}")?;
                if iter.peek().is_some() {
                    write!(f, ", ")?;
                }
            }
            write!(f, " }}")?;
        }

        if !self.message.is_empty() {
            write!(f, " => {}", self.message)?;
        }

        if let Some(source) = &self.source {
            write!(f, ", source: {source}")?;
        }

        Ok(())
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.as_ref().map(|v| v.as_ref().as_ref())
    }
}

impl Clone for Error {
    fn clone(&self) -> Self {
        Self {
            kind: self.kind,
            message: self.message.clone(),
            context: self.context.clone(),
            source: self.source.clone(),
            backtrace: self.backtrace.clone(),
        }
    }
}

impl Error {
    /// Create a new error.
    ///
    /// If the error needs to carry a source error, please use `with_source` method.
    ///
    /// ```rust
    /// # use refetch_common::error::{Error, ErrorKind};
    /// let io_error = std::io::Error::other("connection reset");
    /// Error::new(ErrorKind::Network, "request failed").with_source(io_error);
    /// ```
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            context: Vec::new(),
            source: None,
            backtrace: Some(Arc::new(Backtrace::capture())),
        }
    }

    /// Add more context in error.
    pub fn with_context(mut self, key: &'static str, value: impl ToString) -> Self {
        self.context.push((key, value.to_string()));
        self
    }

    /// Set source for error.
    ///
    /// # Notes
    ///
    /// If the source has been set, we will raise a panic here in debug builds.
    pub fn with_source(mut self, source: impl Into<anyhow::Error>) -> Self {
        debug_assert!(self.source.is_none(), "the source error has been set");
        self.source = Some(Arc::new(source.into()));
        self
    }

    /// Get the error kind.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Get the error message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Get the error context.
    pub fn context(&self) -> &[(&'static str, String)] {
        &self.context
    }

    /// Get the error backtrace.
    pub fn backtrace(&self) -> Option<&Backtrace> {
        self.backtrace.as_deref()
    }

    /// Get the error source.
    pub fn source(&self) -> Option<&anyhow::Error> {
        self.source.as_deref()
    }

    /// Downcast the reference of the source error to a specific error type reference.
    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.source.as_deref().and_then(|e| e.downcast_ref::<E>())
    }

    /// Whether the failed operation may be attempted again. See [`ErrorKind::is_retryable`].
    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }

    /// The status code carried by an [`ErrorKind::Http`] error.
    pub fn http_status(&self) -> Option<u16> {
        self.downcast_ref::<HttpStatus>().map(|status| status.0)
    }
}

/// Result type for refetch.
pub type Result<T> = std::result::Result<T, Error>;

/// Helper methods for Error.
impl Error {
    /// Helper for creating an [`ErrorKind::Network`] error from a transport failure.
    pub fn network(source: impl Into<anyhow::Error>) -> Self {
        Error::new(ErrorKind::Network, "transport failure").with_source(source)
    }

    /// Helper for creating an [`ErrorKind::Http`] error with the given status code.
    pub fn http(status: u16) -> Self {
        Error::new(ErrorKind::Http, "non-success status")
            .with_context("status", status)
            .with_source(HttpStatus(status))
    }

    /// Helper for creating an [`ErrorKind::Parse`] error.
    pub fn parse(source: impl Into<anyhow::Error>) -> Self {
        Error::new(ErrorKind::Parse, "malformed response body").with_source(source)
    }

    /// Helper for creating an [`ErrorKind::Timeout`] error.
    pub fn timeout(timeout: Duration) -> Self {
        Error::new(ErrorKind::Timeout, "fetch attempt timed out").with_context("timeout", format!("{timeout:?}"))
    }

    /// Helper for creating an [`ErrorKind::Cancelled`] error.
    pub fn cancelled(reason: impl Into<String>) -> Self {
        Error::new(ErrorKind::Cancelled, reason)
    }

    /// Helper for creating an [`ErrorKind::Config`] error for an invalid option.
    pub fn config(option: &'static str, reason: impl Into<String>) -> Self {
        Error::new(ErrorKind::Config, reason).with_context("option", option)
    }

    /// Helper for wrapping an arbitrary user error as [`ErrorKind::External`].
    pub fn external(source: impl Into<anyhow::Error>) -> Self {
        Error::new(ErrorKind::External, "").with_source(source)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::parse(e)
    }
}
