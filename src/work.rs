/*!
 * The unit-of-work contract between the governor and the caller's upstream client
 */

use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;

use crate::error::GovernorError;
use pacekeeper_core_resilience::{ErrorKind, RateLimitHeaders, UpstreamError};

/// Timing and pacing metadata from one upstream response
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResponseMeta {
    pub latency: Duration,
    pub status: Option<u16>,
    pub rate_limit: Option<RateLimitHeaders>,
    pub retry_after: Option<Duration>,
}

impl ResponseMeta {
    pub fn new(latency: Duration) -> Self {
        Self {
            latency,
            ..Default::default()
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    /// Attach rate-limit headers parsed from name/value pairs
    pub fn with_headers<'a, I>(mut self, pairs: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let headers = RateLimitHeaders::from_pairs(pairs);
        if self.retry_after.is_none() {
            self.retry_after = headers.retry_after;
        }
        if !headers.is_empty() {
            self.rate_limit = Some(headers);
        }
        self
    }

    pub fn with_rate_limit(mut self, headers: RateLimitHeaders) -> Self {
        if self.retry_after.is_none() {
            self.retry_after = headers.retry_after;
        }
        self.rate_limit = Some(headers);
        self
    }

    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self
    }
}

/// A successful unit of work
#[derive(Debug, Clone)]
pub struct WorkSuccess<T> {
    pub value: T,
    pub meta: ResponseMeta,
}

impl<T> WorkSuccess<T> {
    pub fn new(value: T, meta: ResponseMeta) -> Self {
        Self { value, meta }
    }
}

/// A failed unit of work
#[derive(Debug, Clone)]
pub struct WorkFailure {
    pub message: String,
    pub meta: ResponseMeta,
    /// Explicit classification; derived from status or message when absent
    pub kind: Option<ErrorKind>,
}

impl WorkFailure {
    pub fn new(message: impl Into<String>, meta: ResponseMeta) -> Self {
        Self {
            message: message.into(),
            meta,
            kind: None,
        }
    }

    pub fn with_kind(mut self, kind: ErrorKind) -> Self {
        self.kind = Some(kind);
        self
    }

    /// Classified kind: explicit, else by status, else by message pattern
    pub fn kind(&self) -> ErrorKind {
        self.kind
            .or_else(|| self.meta.status.and_then(ErrorKind::from_status))
            .unwrap_or_else(|| ErrorKind::from_message(&self.message))
    }

    /// Convert to the error type the recovery loop understands
    pub fn to_upstream_error(&self) -> UpstreamError {
        UpstreamError {
            kind: self.kind(),
            message: self.message.clone(),
            status: self.meta.status,
            retry_after: self.meta.retry_after,
        }
    }
}

/// One item of a batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkItem<I> {
    /// Caller-chosen key; results are reported under it
    pub key: String,
    pub payload: I,
}

impl<I> WorkItem<I> {
    pub fn new(key: impl Into<String>, payload: I) -> Self {
        Self {
            key: key.into(),
            payload,
        }
    }
}

/// Final outcome of one item
#[derive(Debug)]
pub struct ItemResult<T> {
    pub value: std::result::Result<T, GovernorError>,
    /// Upstream attempts across every dispatch of the item
    pub attempts: u32,
    /// Summed upstream latency
    pub total_latency: Duration,
}

impl<T> ItemResult<T> {
    pub fn is_success(&self) -> bool {
        self.value.is_ok()
    }

    /// Failure reason, if the item failed
    pub fn error(&self) -> Option<&GovernorError> {
        self.value.as_ref().err()
    }
}

/// Performs one unit of work against the upstream
///
/// # Example
/// ```no_run
/// use async_trait::async_trait;
/// use pacekeeper::work::{ResponseMeta, Work, WorkFailure, WorkSuccess};
/// use std::time::Duration;
///
/// struct WarrantyLookup;
///
/// #[async_trait]
/// impl Work<String, String> for WarrantyLookup {
///     async fn perform(&self, serial: &String) -> Result<WorkSuccess<String>, WorkFailure> {
///         let meta = ResponseMeta::new(Duration::from_millis(120)).with_status(200);
///         Ok(WorkSuccess::new(format!("warranty for {}", serial), meta))
///     }
/// }
/// ```
#[async_trait]
pub trait Work<I, T>: Send + Sync {
    async fn perform(&self, item: &I) -> std::result::Result<WorkSuccess<T>, WorkFailure>;
}

/// [`Work`] adapter for a closure returning a future
pub struct FnWork<F>(F);

/// Adapt a closure into a [`Work`] implementation
///
/// The returned future may not borrow the item; clone what it needs first.
pub fn work_fn<F>(f: F) -> FnWork<F> {
    FnWork(f)
}

#[async_trait]
impl<I, T, F, Fut> Work<I, T> for FnWork<F>
where
    I: Sync + 'static,
    T: Send + 'static,
    F: Fn(&I) -> Fut + Send + Sync,
    Fut: Future<Output = std::result::Result<WorkSuccess<T>, WorkFailure>> + Send,
{
    async fn perform(&self, item: &I) -> std::result::Result<WorkSuccess<T>, WorkFailure> {
        (self.0)(item).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_kind_precedence() {
        let by_status = WorkFailure::new("weird", ResponseMeta::default().with_status(429));
        assert_eq!(by_status.kind(), ErrorKind::RateLimit);

        let by_message = WorkFailure::new("socket hang up", ResponseMeta::default());
        assert_eq!(by_message.kind(), ErrorKind::Network);

        let explicit = WorkFailure::new("socket hang up", ResponseMeta::default().with_status(500))
            .with_kind(ErrorKind::Timeout);
        assert_eq!(explicit.kind(), ErrorKind::Timeout);
    }

    #[test]
    fn test_headers_feed_retry_after() {
        let meta = ResponseMeta::new(Duration::from_millis(40))
            .with_status(429)
            .with_headers([("Retry-After", "10"), ("X-RateLimit-Limit", "100")]);

        assert_eq!(meta.retry_after, Some(Duration::from_secs(10)));
        assert_eq!(meta.rate_limit.as_ref().and_then(|h| h.limit), Some(100));

        let err = WorkFailure::new("slow down", meta).to_upstream_error();
        assert_eq!(err.kind, ErrorKind::RateLimit);
        assert_eq!(err.retry_after, Some(Duration::from_secs(10)));
        assert_eq!(err.status, Some(429));
    }

    #[tokio::test]
    async fn test_work_fn_adapter() {
        let work = work_fn(|n: &u32| {
            let n = *n;
            async move {
                if n % 2 == 0 {
                    Ok(WorkSuccess::new(n * 10, ResponseMeta::default()))
                } else {
                    Err(WorkFailure::new("odd input", ResponseMeta::default().with_status(400)))
                }
            }
        });

        let ok = Work::<u32, u32>::perform(&work, &4).await.unwrap();
        assert_eq!(ok.value, 40);
        let err = Work::<u32, u32>::perform(&work, &3).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ClientError);
    }
}
