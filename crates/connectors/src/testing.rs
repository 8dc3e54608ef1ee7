//! Failure-injecting connector wrapper for exercising the pipeline's
//! degraded paths (stale fallback, error aggregation) without a flaky
//! network.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use crate::{Connector, FetchRequest};
use weir_common::model::{Rowset, SourceDescriptor};
use weir_error::{ErrorCode, Result, WeirError};

/// Wraps a connector and fails the next N fetches with a chosen error kind,
/// then delegates. Counts every fetch it sees.
pub struct FlakyConnector {
    inner: Arc<dyn Connector>,
    fail_next: AtomicU32,
    code: ErrorCode,
    retry_after_ms: Option<u64>,
    fetches: AtomicUsize,
}

impl FlakyConnector {
    pub fn new(inner: Arc<dyn Connector>, code: ErrorCode) -> Self {
        Self {
            inner,
            fail_next: AtomicU32::new(0),
            code,
            retry_after_ms: None,
            fetches: AtomicUsize::new(0),
        }
    }

    pub fn with_retry_after_ms(mut self, ms: u64) -> Self {
        self.retry_after_ms = Some(ms);
        self
    }

    pub fn fail_next(&self, count: u32) {
        self.fail_next.store(count, Ordering::SeqCst);
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for FlakyConnector {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn describe(&self) -> SourceDescriptor {
        self.inner.describe()
    }

    async fn fetch(&self, request: FetchRequest<'_>) -> Result<Rowset> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if self.fail_next.load(Ordering::SeqCst) > 0 {
            self.fail_next.fetch_sub(1, Ordering::SeqCst);
            let mut err = WeirError::new(
                self.code,
                format!("injected {} from '{}'", self.code, self.name()),
            )
            .with_source(self.name().to_string());
            if let Some(ms) = self.retry_after_ms {
                err = err.with_retry_after_ms(ms);
            }
            return Err(err);
        }
        self.inner.fetch(request).await
    }
}
