//! Task error type and severity classification.
//!
//! Worker retry loops only care about severity: `Info` and `Warn` sleep and
//! retry, `Fatal` fails the task immediately. HTTP and curl failures are
//! classified here so the remote layer and the agenda share one policy.

use std::fmt;

/// How a failed attempt should be treated by the retry loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Informational; retry after the backoff delay.
    Info,
    /// Transient failure (5xx, reset, timeout); retry after the backoff delay.
    Warn,
    /// Non-retryable; fail the task.
    Fatal,
}

/// Error carried out of a task execution.
#[derive(Debug)]
pub struct TaskError {
    severity: Severity,
    message: String,
}

impl TaskError {
    pub fn fatal(message: impl Into<String>) -> Self {
        Self { severity: Severity::Fatal, message: message.into() }
    }

    pub fn warn(message: impl Into<String>) -> Self {
        Self { severity: Severity::Warn, message: message.into() }
    }

    pub fn info(message: impl Into<String>) -> Self {
        Self { severity: Severity::Info, message: message.into() }
    }

    /// Local syscall failure with a context string. Always fatal.
    pub fn io(context: impl Into<String>, err: std::io::Error) -> Self {
        Self { severity: Severity::Fatal, message: format!("{}: {}", context.into(), err) }
    }

    pub fn severity(&self) -> Severity {
        self.severity
    }
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for TaskError {}

pub type TaskResult<T> = Result<T, TaskError>;

/// Classify an HTTP status for retry decisions. 404 is not handled here:
/// HEAD callers map it to `found = false` before classification.
pub fn classify_http_status(code: u32) -> Severity {
    match code {
        500..=599 => Severity::Warn,
        _ => Severity::Fatal,
    }
}

/// Classify a curl error: connection-level trouble is retryable, everything
/// else (bad URL, SSL config, write aborts) is not.
pub fn classify_curl_error(e: &curl::Error) -> Severity {
    if e.is_operation_timedout()
        || e.is_couldnt_connect()
        || e.is_couldnt_resolve_host()
        || e.is_couldnt_resolve_proxy()
        || e.is_recv_error()
        || e.is_send_error()
        || e.is_got_nothing()
        || e.is_partial_file()
    {
        return Severity::Warn;
    }
    Severity::Fatal
}

impl From<curl::Error> for TaskError {
    fn from(e: curl::Error) -> Self {
        Self { severity: classify_curl_error(&e), message: format!("curl: {}", e) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_5xx_is_retryable() {
        assert_eq!(classify_http_status(500), Severity::Warn);
        assert_eq!(classify_http_status(503), Severity::Warn);
    }

    #[test]
    fn http_4xx_is_fatal() {
        assert_eq!(classify_http_status(403), Severity::Fatal);
        assert_eq!(classify_http_status(400), Severity::Fatal);
    }

    #[test]
    fn io_errors_are_fatal() {
        let err = TaskError::io(
            "failed to open /nope",
            std::io::Error::new(std::io::ErrorKind::NotFound, "gone"),
        );
        assert_eq!(err.severity(), Severity::Fatal);
        assert!(err.to_string().contains("/nope"));
    }
}
