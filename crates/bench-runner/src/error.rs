use std::io;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("malformed template (unbalanced '$' delimiters): {input}")]
    MalformedTemplate { input: String },

    #[error("undefined variable '{name}' in template: {input}")]
    UndefinedVariable { name: String, input: String },

    #[error("run file missing required fields:\n{}", bullet_list(fields))]
    MissingRequiredField { fields: Vec<String> },

    #[error("invalid run file at line {line}: {message}")]
    InvalidRunFile { line: usize, message: String },

    #[error("invalid sampling interval for event '{event}': {value}")]
    InvalidSamplingInterval { event: String, value: String },

    #[error("unknown event code '{code}' (expected 1, 2, 3, 4 or all)")]
    UnknownEventCode { code: String },

    #[error("timing capture failed for {}: {reason}", path.display())]
    TimingCaptureFailed { path: PathBuf, reason: String },

    #[error("command exceeded {timeout:?}: {command}")]
    Timeout { command: String, timeout: Duration },

    #[error("failed to {action} {}", path.display())]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to launch command: {command}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },
}

impl HarnessError {
    /// Errors that lose a single measurement rather than invalidating the
    /// configuration.
    pub fn is_iteration_failure(&self) -> bool {
        matches!(
            self,
            HarnessError::Timeout { .. } | HarnessError::TimingCaptureFailed { .. }
        )
    }
}

fn bullet_list(items: &[String]) -> String {
    items
        .iter()
        .map(|p| format!("  - {}", p))
        .collect::<Vec<_>>()
        .join("\n")
}
