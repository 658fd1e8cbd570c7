use std::time::Duration;

use crate::error::{FailureKind, HandlerError};

/// Substrings (lower-case) that mark a failure message as transient.
pub const RETRYABLE_PATTERNS: [&str; 9] = [
    "timeout",
    "temporar",
    "network",
    "rate limit",
    "429",
    "5xx",
    "503",
    "session is expired",
    "unauthorized",
];

const BASE_DELAY_MS: u64 = 1000;
const MIN_EXPONENT: u32 = 1;
const MAX_EXPONENT: u32 = 6;

/// Delay before a retryable failure may be claimed again:
/// `1000ms * 2^clamp(attempt, 1, 6)`.
pub fn backoff_delay(attempt_count: u32) -> Duration {
    let exponent = attempt_count.clamp(MIN_EXPONENT, MAX_EXPONENT);
    Duration::from_millis(BASE_DELAY_MS * 2u64.pow(exponent))
}

/// Case-insensitive substring match against [`RETRYABLE_PATTERNS`].
pub fn is_retryable_message(message: &str) -> bool {
    let message = message.to_lowercase();
    RETRYABLE_PATTERNS
        .iter()
        .any(|pattern| message.contains(pattern))
}

/// An explicit marker on the error wins; otherwise the message decides.
pub fn classify(err: &HandlerError) -> FailureKind {
    match err.kind() {
        Some(kind) => kind,
        None if is_retryable_message(err.message()) => FailureKind::Retryable,
        None => FailureKind::Fatal,
    }
}
