//! Default call timeouts for remote services.
//!
//! [`TimedRemote`] wraps a remote-service handle with a positive
//! default timeout that call-issuing code applies to every dialog that
//! does not override it. The wrapper carries no clock of its own;
//! deadlines come from `tokio::time`.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{MeshwireError, Result};

/// A remote-service handle paired with a default call timeout.
#[derive(Debug)]
pub struct TimedRemote<S> {
    service: Arc<S>,
    default_timeout: Duration,
}

impl<S> Clone for TimedRemote<S> {
    fn clone(&self) -> Self {
        Self {
            service: self.service.clone(),
            default_timeout: self.default_timeout,
        }
    }
}

impl<S> TimedRemote<S> {
    /// Wrap a service with a default timeout.
    ///
    /// # Errors
    ///
    /// `InvalidTimeout` if the duration is zero. (Negative durations
    /// are unrepresentable in `Duration`.)
    pub fn new(service: Arc<S>, default_timeout: Duration) -> Result<Self> {
        if default_timeout.is_zero() {
            return Err(MeshwireError::InvalidTimeout);
        }
        Ok(Self {
            service,
            default_timeout,
        })
    }

    /// The default timeout applied to calls without an explicit one.
    #[inline]
    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// The wrapped service handle.
    #[inline]
    pub fn service(&self) -> &Arc<S> {
        &self.service
    }

    /// Run a call future under the default timeout.
    ///
    /// # Errors
    ///
    /// `DialogTimeout` if the deadline elapses first; otherwise the
    /// call's own result.
    pub async fn call<F, T>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        self.call_with_timeout(self.default_timeout, fut).await
    }

    /// Run a call future under an explicit timeout.
    pub async fn call_with_timeout<F, T>(&self, timeout: Duration, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        match tokio::time::timeout(timeout, fut).await {
            Ok(result) => result,
            Err(_elapsed) => Err(MeshwireError::DialogTimeout),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_timeout_rejected() {
        let result = TimedRemote::new(Arc::new(()), Duration::ZERO);

        assert!(matches!(result, Err(MeshwireError::InvalidTimeout)));
    }

    #[test]
    fn test_positive_timeout_accepted() {
        let timed = TimedRemote::new(Arc::new(()), Duration::from_millis(1)).unwrap();

        assert_eq!(timed.default_timeout(), Duration::from_millis(1));
    }

    #[tokio::test]
    async fn test_call_within_deadline() {
        let timed = TimedRemote::new(Arc::new(()), Duration::from_secs(5)).unwrap();

        let value = timed.call(async { Ok(42) }).await.unwrap();

        assert_eq!(value, 42);
    }

    #[tokio::test]
    async fn test_call_past_deadline_times_out() {
        let timed = TimedRemote::new(Arc::new(()), Duration::from_millis(10)).unwrap();

        let result: Result<()> = timed
            .call(async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(())
            })
            .await;

        assert!(matches!(result, Err(MeshwireError::DialogTimeout)));
    }
}
