//! Catalog HTTP server.
//!
//! | Method | Path | Response |
//! |--------|------|----------|
//! | `POST` | `/update` | ingest a [`CatalogReport`] (aggregator only) |
//! | `GET` | `/catalog.json`, `/getDumps.json` | `{"dumps":[{"name","type"}]}` |
//! | `GET` | `/catalog.csv`, `/getDumps.csv` | `name,type` lines |
//! | `GET` | `/healthz` | `ok` |
//!
//! Unknown paths answer 404, known paths with the wrong method 405, and
//! unreadable report bodies 400.

use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use chrono::Utc;
use hyper::body::HttpBody;
use hyper::header::{ALLOW, CONTENT_TYPE};
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use tracing::{debug, info, warn};

use crate::aggregator::AggregatorCache;
use crate::catalog::{render_csv, render_json};
use crate::error::{ReflinkError, Result};
use crate::types::CatalogReport;

/// Largest report body accepted.
pub const MAX_REPORT_BYTES: usize = 16 * 1024 * 1024;

/// State shared by every request handler.
pub struct CatalogServer {
    cache: Arc<AggregatorCache>,
    /// Whether `POST /update` is served.  Workers serving their own catalog
    /// do not ingest reports.
    accept_reports: bool,
}

enum Route {
    Update,
    Json,
    Csv,
    Health,
}

impl CatalogServer {
    /// Serves the catalog views and ingests reports.
    pub fn aggregator(cache: Arc<AggregatorCache>) -> Self {
        Self {
            cache,
            accept_reports: true,
        }
    }

    /// Read-only server over a worker's own catalog.
    pub fn read_only(cache: Arc<AggregatorCache>) -> Self {
        Self {
            cache,
            accept_reports: false,
        }
    }

    /// The cache behind the views.
    pub fn cache(&self) -> &Arc<AggregatorCache> {
        &self.cache
    }

    /// Route one request.  Never fails; errors become status codes.
    pub async fn handle(&self, req: Request<Body>) -> Response<Body> {
        let route = match req.uri().path() {
            "/update" if self.accept_reports => Route::Update,
            "/catalog.json" | "/getDumps.json" => Route::Json,
            "/catalog.csv" | "/getDumps.csv" => Route::Csv,
            "/healthz" => Route::Health,
            _ => return text(StatusCode::NOT_FOUND, "not found\n"),
        };
        let expected = match route {
            Route::Update => Method::POST,
            _ => Method::GET,
        };
        if req.method() != expected {
            let mut response = text(StatusCode::METHOD_NOT_ALLOWED, "method not allowed\n");
            if let Ok(value) = expected.as_str().parse() {
                response.headers_mut().insert(ALLOW, value);
            }
            return response;
        }

        match route {
            Route::Update => self.ingest(req).await,
            Route::Json => rendered(
                "application/json",
                render_json(&self.cache.merged_view(Utc::now())),
            ),
            Route::Csv => rendered(
                "text/csv; charset=utf-8",
                render_csv(&self.cache.merged_view(Utc::now())),
            ),
            Route::Health => text(StatusCode::OK, "ok\n"),
        }
    }

    async fn ingest(&self, req: Request<Body>) -> Response<Body> {
        let body = match read_limited(req.into_body(), MAX_REPORT_BYTES).await {
            Ok(body) => body,
            Err(e) => {
                debug!(error = %e, "rejecting report body");
                return text(StatusCode::BAD_REQUEST, "unreadable report\n");
            }
        };
        let report: CatalogReport = match serde_json::from_slice(&body) {
            Ok(report) => report,
            Err(e) => {
                debug!(error = %e, "rejecting malformed report");
                return text(StatusCode::BAD_REQUEST, "malformed report\n");
            }
        };
        if report.provider_id.is_empty() {
            return text(StatusCode::BAD_REQUEST, "report without source\n");
        }
        self.cache.record(report, Utc::now());
        text(StatusCode::OK, "")
    }
}

/// Bind `addr` and return the bound address plus the server future.
///
/// The future completes once `shutdown` resolves and in-flight requests have
/// drained.
pub fn bind(
    addr: SocketAddr,
    server: Arc<CatalogServer>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<(SocketAddr, impl Future<Output = Result<()>> + Send)> {
    let make = make_service_fn(move |_conn| {
        let server = Arc::clone(&server);
        async move {
            Ok::<_, Infallible>(service_fn(move |req| {
                let server = Arc::clone(&server);
                async move { Ok::<_, Infallible>(server.handle(req).await) }
            }))
        }
    });
    let http = Server::try_bind(&addr)
        .map_err(ReflinkError::transport)?
        .serve(make);
    let local = http.local_addr();
    info!(addr = %local, "catalog server listening");
    let running = http.with_graceful_shutdown(shutdown);
    Ok((local, async move {
        running.await.map_err(ReflinkError::transport)
    }))
}

async fn read_limited(mut body: Body, limit: usize) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    while let Some(chunk) = body.data().await {
        let chunk = chunk.map_err(ReflinkError::transport)?;
        if buf.len() + chunk.len() > limit {
            return Err(ReflinkError::InvalidArgument(format!(
                "body exceeds {limit} bytes"
            )));
        }
        buf.extend_from_slice(&chunk);
    }
    Ok(buf)
}

fn text(status: StatusCode, body: &'static str) -> Response<Body> {
    with_type(status, "text/plain; charset=utf-8", body)
}

fn rendered(content_type: &'static str, body: Result<Vec<u8>>) -> Response<Body> {
    match body {
        Ok(body) => with_type(StatusCode::OK, content_type, body),
        Err(e) => {
            warn!(error = %e, "rendering catalog failed");
            text(StatusCode::INTERNAL_SERVER_ERROR, "internal error\n")
        }
    }
}

fn with_type(status: StatusCode, content_type: &'static str, body: impl Into<Body>) -> Response<Body> {
    let mut response = Response::new(body.into());
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, hyper::header::HeaderValue::from_static(content_type));
    response
}
