/// Engine Error Taxonomy
///
/// Every failure the engine surfaces is classified into one of four kinds,
/// because the kind decides what happens next:
/// - Retryable: transient RPC failure, DB deadlock, realtime tx timeout.
///   Retried with bounded exponential backoff.
/// - NonRetryableUser: constraint violations and handler failures. Abort the
///   transaction, terminate with a structured report.
/// - NonRetryableEngine: schema/build mismatch, invalid checkpoint,
///   corrupted shadow data. Terminate.
/// - Unrecoverable: deep reorg, crash-recovery mismatch, foreign writes.
///   Terminate and refuse automatic restart.
///
/// Exit codes: 0 clean, 1 fatal, 75 (EX_TEMPFAIL) on deep reorg.

use std::fmt;
use std::time::{Duration, Instant};

pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Retryable,
    NonRetryableUser,
    NonRetryableEngine,
    Unrecoverable,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Retryable => "retryable",
            ErrorKind::NonRetryableUser => "user",
            ErrorKind::NonRetryableEngine => "engine",
            ErrorKind::Unrecoverable => "unrecoverable",
        }
    }
}

/// Where in the event stream a failure happened. Attached to handler and
/// store errors so the fatal report can point at the offending event.
#[derive(Debug, Clone)]
pub struct EventContext {
    pub name: String,
    pub chain_id: u64,
    pub block_number: u64,
    pub checkpoint: String,
}

/// Source position of a failing user handler, when the handler supplied one.
#[derive(Debug, Clone)]
pub struct CodeFrame {
    pub file: String,
    pub line: u32,
    pub column: u32,
    pub snippet: Option<String>,
}

#[derive(Debug, Clone)]
pub struct EngineError {
    kind: ErrorKind,
    message: String,
    context: Option<EventContext>,
    code_frame: Option<CodeFrame>,
    deep_reorg: bool,
}

impl EngineError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Retryable, message)
    }

    pub fn user(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NonRetryableUser, message)
    }

    pub fn engine(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NonRetryableEngine, message)
    }

    pub fn unrecoverable(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unrecoverable, message)
    }

    /// A reorg reached below the unfinalized ring. The engine cannot rebuild
    /// the fork ancestor from memory, so it refuses to touch the store and
    /// exits with EX_TEMPFAIL for the supervisor to decide.
    pub fn deep_reorg(chain_id: u64, message: impl Into<String>) -> Self {
        let mut err = Self::new(
            ErrorKind::Unrecoverable,
            format!("deep reorg on chain {}: {}", chain_id, message.into()),
        );
        err.deep_reorg = true;
        err
    }

    fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            context: None,
            code_frame: None,
            deep_reorg: false,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn is_retryable(&self) -> bool {
        self.kind == ErrorKind::Retryable
    }

    pub fn is_deep_reorg(&self) -> bool {
        self.deep_reorg
    }

    pub fn context(&self) -> Option<&EventContext> {
        self.context.as_ref()
    }

    pub fn with_context(mut self, context: EventContext) -> Self {
        if self.context.is_none() {
            self.context = Some(context);
        }
        self
    }

    pub fn with_code_frame(mut self, frame: CodeFrame) -> Self {
        self.code_frame = Some(frame);
        self
    }

    /// Process exit code per the shutdown contract.
    pub fn exit_code(&self) -> i32 {
        if self.deep_reorg {
            75
        } else {
            1
        }
    }

    /// Emit the single structured fatal log line.
    pub fn log_fatal(&self) {
        let (file, line) = match &self.code_frame {
            Some(frame) => (frame.file.clone(), frame.line),
            None => (String::new(), 0),
        };
        match &self.context {
            Some(ctx) => tracing::error!(
                kind = self.kind.as_str(),
                event = %ctx.name,
                chain = ctx.chain_id,
                block = ctx.block_number,
                checkpoint = %ctx.checkpoint,
                frame_file = %file,
                frame_line = line,
                "{}",
                self.message
            ),
            None => tracing::error!(
                kind = self.kind.as_str(),
                frame_file = %file,
                frame_line = line,
                "{}",
                self.message
            ),
        }
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.kind.as_str(), self.message)?;
        if let Some(ctx) = &self.context {
            write!(
                f,
                " (event={} chain={} block={} checkpoint={})",
                ctx.name, ctx.chain_id, ctx.block_number, ctx.checkpoint
            )?;
        }
        if let Some(frame) = &self.code_frame {
            write!(f, " at {}:{}:{}", frame.file, frame.line, frame.column)?;
            if let Some(snippet) = &frame.snippet {
                write!(f, "\n{}", snippet)?;
            }
        }
        Ok(())
    }
}

impl std::error::Error for EngineError {}

impl From<sqlx::Error> for EngineError {
    fn from(err: sqlx::Error) -> Self {
        if let Some(db_err) = err.as_database_error() {
            let code = db_err.code().map(|c| c.to_string()).unwrap_or_default();
            // 40001 = serialization_failure, 40P01 = deadlock_detected
            if code == "40001" || code == "40P01" {
                return EngineError::retryable(format!("database conflict ({}): {}", code, db_err));
            }
            // Class 23 = integrity constraint violation (unique, not-null, fk)
            if code.starts_with("23") {
                return EngineError::user(format!("constraint violation ({}): {}", code, db_err));
            }
            return EngineError::engine(format!("database error ({}): {}", code, db_err));
        }
        match err {
            sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => {
                EngineError::retryable(format!("database connection error: {}", err))
            }
            sqlx::Error::RowNotFound => {
                EngineError::user(format!("required record not found: {}", err))
            }
            other => EngineError::engine(format!("database error: {}", other)),
        }
    }
}

/// Exponential backoff schedule bounded in total elapsed time.
///
/// `next_delay` returns None once the deadline passes; callers give up and
/// surface the last error.
pub struct Backoff {
    delay: Duration,
    max_delay: Duration,
    deadline: Instant,
}

impl Backoff {
    pub fn new(base: Duration, max_delay: Duration, max_elapsed: Duration) -> Self {
        Self {
            delay: base,
            max_delay,
            deadline: Instant::now() + max_elapsed,
        }
    }

    pub fn next_delay(&mut self) -> Option<Duration> {
        if Instant::now() >= self.deadline {
            return None;
        }
        let current = self.delay;
        self.delay = (self.delay * 2).min(self.max_delay);
        Some(current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(EngineError::user("boom").exit_code(), 1);
        assert_eq!(EngineError::engine("boom").exit_code(), 1);
        assert_eq!(EngineError::deep_reorg(1, "too old").exit_code(), 75);
    }

    #[test]
    fn test_deep_reorg_is_unrecoverable() {
        let err = EngineError::deep_reorg(137, "ancestor below ring");
        assert_eq!(err.kind(), ErrorKind::Unrecoverable);
        assert!(err.is_deep_reorg());
        assert!(err.message().contains("chain 137"));
    }

    #[test]
    fn test_context_attaches_once() {
        let ctx = EventContext {
            name: "ERC20:Transfer".to_string(),
            chain_id: 1,
            block_number: 42,
            checkpoint: "0".repeat(10),
        };
        let other = EventContext {
            name: "other".to_string(),
            chain_id: 2,
            block_number: 1,
            checkpoint: String::new(),
        };
        let err = EngineError::user("handler failed")
            .with_context(ctx)
            .with_context(other);
        assert_eq!(err.context().unwrap().name, "ERC20:Transfer");
        let rendered = err.to_string();
        assert!(rendered.contains("event=ERC20:Transfer"));
        assert!(rendered.contains("[user]"));
    }

    #[test]
    fn test_backoff_doubles_and_expires() {
        let mut backoff = Backoff::new(
            Duration::from_millis(10),
            Duration::from_millis(40),
            Duration::from_secs(60),
        );
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(10)));
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(20)));
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(40)));
        // Capped at max_delay
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(40)));

        let mut expired = Backoff::new(
            Duration::from_millis(10),
            Duration::from_millis(40),
            Duration::from_millis(0),
        );
        assert_eq!(expired.next_delay(), None);
    }
}
