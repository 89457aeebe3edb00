use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::error::ServiceError;

/// Request-scoped deadline and cancellation signal. Every storage and
/// network call made on behalf of a request goes through [`RequestContext::run`].
#[derive(Debug, Clone)]
pub struct RequestContext {
    deadline: Option<Instant>,
    cancel: CancellationToken,
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::background()
    }
}

impl RequestContext {
    /// No deadline, never cancelled unless `cancel` is called.
    pub fn background() -> Self {
        Self {
            deadline: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            deadline: Some(Instant::now() + timeout),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Fail fast if the request is already cancelled or past its deadline.
    pub fn check(&self) -> Result<(), ServiceError> {
        if self.cancel.is_cancelled() {
            return Err(ServiceError::Cancelled);
        }
        if matches!(self.deadline, Some(deadline) if Instant::now() >= deadline) {
            return Err(ServiceError::DeadlineExceeded);
        }
        Ok(())
    }

    /// Drive `fut` until it completes, the request is cancelled, or the
    /// deadline passes.
    pub async fn run<F, T, E>(&self, fut: F) -> Result<T, ServiceError>
    where
        F: Future<Output = Result<T, E>>,
        ServiceError: From<E>,
    {
        self.check()?;
        let result = match self.deadline {
            Some(deadline) => tokio::select! {
                _ = self.cancel.cancelled() => return Err(ServiceError::Cancelled),
                _ = tokio::time::sleep_until(deadline) => {
                    return Err(ServiceError::DeadlineExceeded)
                }
                result = fut => result,
            },
            None => tokio::select! {
                _ = self.cancel.cancelled() => return Err(ServiceError::Cancelled),
                result = fut => result,
            },
        };
        result.map_err(ServiceError::from)
    }
}
