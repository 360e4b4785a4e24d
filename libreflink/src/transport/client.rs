//! Report delivery from workers to the aggregator.

use std::time::Duration;

use hyper::client::HttpConnector;
use hyper::header::CONTENT_TYPE;
use hyper::{Body, Client, Method, Request, Uri};
use tracing::{debug, instrument};

use crate::error::{ReflinkError, Result};
use crate::types::CatalogReport;

/// Posts catalog reports to `<aggregator>/update`.
///
/// Each delivery is a single attempt bounded by `timeout`; the next pass's
/// report supersedes a failed one.
pub struct ReportClient {
    endpoint: Uri,
    timeout: Duration,
    http: Client<HttpConnector>,
}

impl ReportClient {
    /// Client posting to `<aggregator_url>/update` within `timeout`.
    pub fn new(aggregator_url: &str, timeout: Duration) -> Result<Self> {
        let endpoint = format!("{}/update", aggregator_url.trim_end_matches('/'))
            .parse::<Uri>()
            .map_err(|e| ReflinkError::Config(format!("invalid aggregator_url {aggregator_url:?}: {e}")))?;
        Ok(Self {
            endpoint,
            timeout,
            http: Client::new(),
        })
    }

    /// Full URL reports are posted to.
    pub fn endpoint(&self) -> &Uri {
        &self.endpoint
    }

    #[instrument(skip(self, report), fields(endpoint = %self.endpoint, entries = report.entries.len()))]
    pub async fn send(&self, report: &CatalogReport) -> Result<()> {
        let body = serde_json::to_vec(report).map_err(ReflinkError::internal)?;
        let request = Request::builder()
            .method(Method::POST)
            .uri(self.endpoint.clone())
            .header(CONTENT_TYPE, "application/json")
            .body(Body::from(body))
            .map_err(ReflinkError::transport)?;

        let response = tokio::time::timeout(self.timeout, self.http.request(request))
            .await
            .map_err(|_| ReflinkError::Transport(format!("report timed out after {:?}", self.timeout)))?
            .map_err(ReflinkError::transport)?;
        let status = response.status();
        if !status.is_success() {
            return Err(ReflinkError::Transport(format!("aggregator answered {status}")));
        }
        debug!("report delivered");
        Ok(())
    }
}
