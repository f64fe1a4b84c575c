//! Point-to-point transfer collaborator used by the workers

use crate::registry::Target;
use crate::seeds::Seed;

/// Result of a single transfer attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferOutcome {
    Success,
    Failure {
        /// Exit code of the transfer command, if it ran to completion
        code: Option<i32>,
        message: String,
    },
}

impl TransferOutcome {
    pub fn failure(code: Option<i32>, message: impl Into<String>) -> Self {
        TransferOutcome::Failure {
            code,
            message: message.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, TransferOutcome::Success)
    }
}

impl std::fmt::Display for TransferOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            TransferOutcome::Success => write!(f, "success"),
            TransferOutcome::Failure {
                code: Some(code),
                message,
            } => write!(f, "failed (exit code {code}): {message}"),
            TransferOutcome::Failure {
                code: None,
                message,
            } => write!(f, "failed: {message}"),
        }
    }
}

/// Moves the file between two hosts.
///
/// Implementations must not panic on failure: every problem, including failing to start the
/// underlying process, is reported as [`TransferOutcome::Failure`].
pub trait Transport: Send + Sync + 'static {
    fn transfer(
        &self,
        seed: &Seed,
        target: &Target,
    ) -> impl std::future::Future<Output = TransferOutcome> + Send;

    fn is_reachable(&self, host: &str) -> impl std::future::Future<Output = bool> + Send;
}
