//! Deadline-bounded execution of a single future.
//!
//! `bounded_call` races the operation against a timer. Whichever finishes
//! first decides the outcome; the other future is dropped by `select!`, so a
//! timed-out network exchange is cancelled rather than left running.

use std::future::Future;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("operation exceeded its {}ms deadline", .deadline.as_millis())]
pub struct DeadlineExceeded {
    pub deadline: Duration,
}

/// Run `operation` for at most `deadline`.
///
/// On timeout the operation future is dropped before this function returns.
/// An operation that completes in the same poll as the timer wins.
pub async fn bounded_call<F>(deadline: Duration, operation: F) -> Result<F::Output, DeadlineExceeded>
where
    F: Future,
{
    tokio::select! {
        biased;
        output = operation => Ok(output),
        () = tokio::time::sleep(deadline) => Err(DeadlineExceeded { deadline }),
    }
}
