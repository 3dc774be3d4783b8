//! Dataset fetchers: turn a descriptor into the bytes to land.
//!
//! Parsing of any particular upstream lives behind the [`Fetcher`] trait.
//! The default [`HttpFetcher`] simply GETs the descriptor's `source_url`.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::StatusCode;
use tracing::debug;
use url::Url;

use datafeed_core::DatasetDescriptor;

use crate::error::PipelineError;

/// One object's worth of fetched content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedPart {
    /// Appended to a `fileprefix` target; ignored for `filename` targets.
    /// Must be derived from the content's identity so redelivery overwrites.
    pub suffix: String,
    pub bytes: Bytes,
}

impl FetchedPart {
    /// A single part for a `filename` target.
    pub fn whole(bytes: impl Into<Bytes>) -> Self {
        Self {
            suffix: String::new(),
            bytes: bytes.into(),
        }
    }

    pub fn named(suffix: impl Into<String>, bytes: impl Into<Bytes>) -> Self {
        Self {
            suffix: suffix.into(),
            bytes: bytes.into(),
        }
    }
}

#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, descriptor: &DatasetDescriptor) -> Result<Vec<FetchedPart>, PipelineError>;
}

/// GETs `source_url` and returns the body as a single part.
#[derive(Debug, Clone, Default)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

/// Statuses worth a redelivery; any other non-2xx will fail the same way again.
fn is_retryable_status(status: StatusCode) -> bool {
    status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS || status == StatusCode::REQUEST_TIMEOUT
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, descriptor: &DatasetDescriptor) -> Result<Vec<FetchedPart>, PipelineError> {
        let invalid = |reason: String| PipelineError::InvalidFetch {
            dataset: descriptor.id.clone(),
            reason,
        };
        let source = descriptor
            .source_url
            .as_deref()
            .ok_or_else(|| invalid("no source url and no registered fetcher".into()))?;
        let url = Url::parse(source).map_err(|e| invalid(format!("bad source url '{source}': {e}")))?;

        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| PipelineError::Fetch {
                dataset: descriptor.id.clone(),
                reason: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            let reason = format!("GET {url} returned {status}");
            return Err(if is_retryable_status(status) {
                PipelineError::Fetch {
                    dataset: descriptor.id.clone(),
                    reason,
                }
            } else {
                invalid(reason)
            });
        }

        let body = response.bytes().await.map_err(|e| PipelineError::Fetch {
            dataset: descriptor.id.clone(),
            reason: format!("reading body: {e}"),
        })?;
        debug!(dataset = %descriptor.id, bytes = body.len(), "fetched");
        Ok(vec![FetchedPart::whole(body)])
    }
}

/// Fetchers keyed by dataset id, with a fallback for everything else.
#[derive(Clone)]
pub struct FetcherRegistry {
    fetchers: HashMap<String, Arc<dyn Fetcher>>,
    fallback: Arc<dyn Fetcher>,
}

impl Default for FetcherRegistry {
    fn default() -> Self {
        Self::new(Arc::new(HttpFetcher::new()))
    }
}

impl FetcherRegistry {
    pub fn new(fallback: Arc<dyn Fetcher>) -> Self {
        Self {
            fetchers: HashMap::new(),
            fallback,
        }
    }

    /// Register a fetcher for one dataset (builder style).
    pub fn register(mut self, dataset_id: impl Into<String>, fetcher: Arc<dyn Fetcher>) -> Self {
        self.fetchers.insert(dataset_id.into(), fetcher);
        self
    }

    pub fn has_custom(&self, dataset_id: &str) -> bool {
        self.fetchers.contains_key(dataset_id)
    }

    pub fn get(&self, dataset_id: &str) -> Arc<dyn Fetcher> {
        self.fetchers
            .get(dataset_id)
            .cloned()
            .unwrap_or_else(|| self.fallback.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use datafeed_core::ObjectTarget;

    struct Fixed(&'static str);

    #[async_trait]
    impl Fetcher for Fixed {
        async fn fetch(&self, _d: &DatasetDescriptor) -> Result<Vec<FetchedPart>, PipelineError> {
            Ok(vec![FetchedPart::whole(self.0)])
        }
    }

    fn descriptor(url: Option<&str>) -> DatasetDescriptor {
        DatasetDescriptor::new("COUNTY_NAMES", url.map(String::from), "landing", ObjectTarget::Exact("NAMES".into()))
            .unwrap()
    }

    #[tokio::test]
    async fn registry_prefers_registered_fetcher() {
        let registry = FetcherRegistry::default().register("COUNTY_NAMES", Arc::new(Fixed("a,b\n1,2\n")));
        assert!(registry.has_custom("COUNTY_NAMES"));
        let parts = registry.get("COUNTY_NAMES").fetch(&descriptor(None)).await.unwrap();
        assert_eq!(parts, vec![FetchedPart::whole("a,b\n1,2\n")]);
    }

    #[tokio::test]
    async fn http_fetcher_needs_a_url() {
        let err = HttpFetcher::new().fetch(&descriptor(None)).await.unwrap_err();
        assert!(matches!(err, PipelineError::InvalidFetch { .. }));
    }

    #[tokio::test]
    async fn http_fetcher_rejects_unparseable_url() {
        let err = HttpFetcher::new().fetch(&descriptor(Some("not a url"))).await.unwrap_err();
        assert!(err.to_string().contains("bad source url"));
    }

    #[test]
    fn server_errors_are_retryable_client_errors_are_not() {
        assert!(is_retryable_status(StatusCode::SERVICE_UNAVAILABLE));
        assert!(is_retryable_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(!is_retryable_status(StatusCode::NOT_FOUND));
    }
}
