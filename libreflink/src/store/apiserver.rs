//! [`ClusterStore`] backed by the Kubernetes API server.
//!
//! Talks plain HTTP to an API endpoint that handles authentication itself,
//! normally a `kubectl proxy` sidecar on `127.0.0.1:8001`.  Responses are
//! decoded into the wire types of [`super::wire`] and converted into typed
//! records before they leave this module.

use std::time::Duration;

use async_trait::async_trait;
use hyper::body::Bytes;
use hyper::client::HttpConnector;
use hyper::header::CONTENT_TYPE;
use hyper::{Body, Client, Method, Request, StatusCode, Uri};
use serde::de::DeserializeOwned;
use tracing::{debug, instrument};

use crate::error::{ReflinkError, Result};
use crate::store::ClusterStore;
use crate::store::wire::{
    List, Pv, Pvc, StatusPatch, VolumeSnapshot, VolumeSnapshotContent,
};
use crate::types::{ClaimRecord, SnapshotContentRecord, SnapshotRequest, VolumeRecord};

const SNAPSHOT_API: &str = "/apis/snapshot.storage.k8s.io/v1";
const JSON: &str = "application/json";
const MERGE_PATCH: &str = "application/merge-patch+json";

/// Upper bound on a single API call.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Kubernetes API client limited to the provisioner's resources.
pub struct ApiServerStore {
    /// Base URL without trailing slash, e.g. `http://127.0.0.1:8001`.
    base: String,
    http: Client<HttpConnector>,
}

impl ApiServerStore {
    /// Client for the API server at `base`.
    pub fn new(base: impl Into<String>) -> Result<Self> {
        let base = base.into().trim_end_matches('/').to_owned();
        base.parse::<Uri>()
            .map_err(|e| ReflinkError::Config(format!("invalid api_server {base:?}: {e}")))?;
        Ok(Self {
            base,
            http: Client::new(),
        })
    }

    /// Probe the API server; used once at startup, where failure is fatal.
    pub async fn ping(&self) -> Result<()> {
        let (status, body) = self.send(Method::GET, "/version", None).await?;
        if status.is_success() {
            Ok(())
        } else {
            Err(status_error("version", "", status, &body))
        }
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<(&'static str, Vec<u8>)>,
    ) -> Result<(StatusCode, Bytes)> {
        let uri: Uri = format!("{}{}", self.base, path)
            .parse()
            .map_err(ReflinkError::store)?;
        let mut builder = Request::builder().method(method.clone()).uri(uri);
        let body = match body {
            Some((content_type, bytes)) => {
                builder = builder.header(CONTENT_TYPE, content_type);
                Body::from(bytes)
            }
            None => Body::empty(),
        };
        let request = builder.body(body).map_err(ReflinkError::store)?;

        let call = async {
            let response = self.http.request(request).await.map_err(ReflinkError::store)?;
            let status = response.status();
            let bytes = hyper::body::to_bytes(response.into_body())
                .await
                .map_err(ReflinkError::store)?;
            Ok::<_, ReflinkError>((status, bytes))
        };
        let (status, bytes) = tokio::time::timeout(REQUEST_TIMEOUT, call)
            .await
            .map_err(|_| ReflinkError::Store(format!("{method} {path} timed out")))??;
        debug!(%method, %path, %status, "api call");
        Ok((status, bytes))
    }

    async fn get_list<T: DeserializeOwned>(&self, kind: &str, path: &str) -> Result<Vec<T>> {
        let (status, body) = self.send(Method::GET, path, None).await?;
        if !status.is_success() {
            return Err(status_error(kind, "", status, &body));
        }
        let list: List<T> = serde_json::from_slice(&body)
            .map_err(|e| ReflinkError::Decode(format!("{kind} list: {e}")))?;
        Ok(list.items)
    }

    async fn expect_success(
        &self,
        kind: &str,
        name: &str,
        method: Method,
        path: &str,
        body: Option<(&'static str, Vec<u8>)>,
    ) -> Result<()> {
        let (status, response) = self.send(method, path, body).await?;
        if status.is_success() {
            Ok(())
        } else {
            Err(status_error(kind, name, status, &response))
        }
    }
}

/// Map an unsuccessful API response onto the crate's error taxonomy.
fn status_error(kind: &str, name: &str, status: StatusCode, body: &[u8]) -> ReflinkError {
    match status {
        StatusCode::CONFLICT => ReflinkError::AlreadyExists {
            kind: kind.to_owned(),
            name: name.to_owned(),
        },
        StatusCode::NOT_FOUND => ReflinkError::NotFound {
            kind: kind.to_owned(),
            name: name.to_owned(),
        },
        _ => ReflinkError::Store(format!(
            "{kind} {name}: {status}: {}",
            String::from_utf8_lossy(body).trim()
        )),
    }
}

fn json_body<T: serde::Serialize>(content_type: &'static str, value: &T) -> Result<Option<(&'static str, Vec<u8>)>> {
    let bytes = serde_json::to_vec(value).map_err(ReflinkError::internal)?;
    Ok(Some((content_type, bytes)))
}

#[async_trait]
impl ClusterStore for ApiServerStore {
    #[instrument(skip(self))]
    async fn list_claims(&self) -> Result<Vec<ClaimRecord>> {
        let items: Vec<Pvc> = self
            .get_list("PersistentVolumeClaim", "/api/v1/persistentvolumeclaims")
            .await?;
        Ok(items.into_iter().map(ClaimRecord::from).collect())
    }

    #[instrument(skip(self))]
    async fn list_volumes(&self) -> Result<Vec<VolumeRecord>> {
        let items: Vec<Pv> = self
            .get_list("PersistentVolume", "/api/v1/persistentvolumes")
            .await?;
        Ok(items.into_iter().map(VolumeRecord::from).collect())
    }

    #[instrument(skip(self))]
    async fn list_snapshot_requests(
        &self,
        namespace: Option<&str>,
    ) -> Result<Vec<SnapshotRequest>> {
        let path = match namespace {
            Some(ns) => format!("{SNAPSHOT_API}/namespaces/{ns}/volumesnapshots"),
            None => format!("{SNAPSHOT_API}/volumesnapshots"),
        };
        let items: Vec<VolumeSnapshot> = self.get_list("VolumeSnapshot", &path).await?;
        Ok(items.into_iter().map(SnapshotRequest::from).collect())
    }

    #[instrument(skip(self))]
    async fn list_snapshot_contents(&self) -> Result<Vec<SnapshotContentRecord>> {
        let items: Vec<VolumeSnapshotContent> = self
            .get_list(
                "VolumeSnapshotContent",
                &format!("{SNAPSHOT_API}/volumesnapshotcontents"),
            )
            .await?;
        Ok(items.into_iter().map(SnapshotContentRecord::from).collect())
    }

    #[instrument(skip(self, volume), fields(name = %volume.name))]
    async fn create_volume(&self, volume: &VolumeRecord) -> Result<()> {
        self.expect_success(
            "PersistentVolume",
            &volume.name,
            Method::POST,
            "/api/v1/persistentvolumes",
            json_body(JSON, &Pv::from(volume))?,
        )
        .await
    }

    #[instrument(skip(self))]
    async fn delete_volume(&self, name: &str) -> Result<()> {
        self.expect_success(
            "PersistentVolume",
            name,
            Method::DELETE,
            &format!("/api/v1/persistentvolumes/{name}"),
            None,
        )
        .await
    }

    #[instrument(skip(self, content), fields(name = %content.name))]
    async fn create_snapshot_content(&self, content: &SnapshotContentRecord) -> Result<()> {
        self.expect_success(
            "VolumeSnapshotContent",
            &content.name,
            Method::POST,
            &format!("{SNAPSHOT_API}/volumesnapshotcontents"),
            json_body(JSON, &VolumeSnapshotContent::from(content))?,
        )
        .await
    }

    #[instrument(skip(self, request), fields(request = %request.identity()))]
    async fn update_snapshot_request_status(&self, request: &SnapshotRequest) -> Result<()> {
        self.expect_success(
            "VolumeSnapshot",
            &request.name,
            Method::PATCH,
            &format!(
                "{SNAPSHOT_API}/namespaces/{}/volumesnapshots/{}/status",
                request.namespace, request.name
            ),
            json_body(MERGE_PATCH, &StatusPatch::from(request))?,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use std::convert::Infallible;
    use std::net::SocketAddr;
    use std::sync::{Arc, Mutex};

    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Response, Server};

    use super::*;

    type Seen = Arc<Mutex<Vec<(Method, String, String)>>>;

    /// Serve canned responses and record every request.
    async fn fake_api(status: StatusCode, body: &'static str) -> (SocketAddr, Seen) {
        let seen: Seen = Arc::default();
        let recorder = Arc::clone(&seen);
        let make = make_service_fn(move |_| {
            let recorder = Arc::clone(&recorder);
            async move {
                Ok::<_, Infallible>(service_fn(move |req: Request<Body>| {
                    let recorder = Arc::clone(&recorder);
                    async move {
                        let method = req.method().clone();
                        let path = req.uri().path().to_owned();
                        let bytes = hyper::body::to_bytes(req.into_body()).await.unwrap();
                        recorder.lock().unwrap().push((
                            method,
                            path,
                            String::from_utf8_lossy(&bytes).into_owned(),
                        ));
                        Ok::<_, Infallible>(
                            Response::builder().status(status).body(Body::from(body)).unwrap(),
                        )
                    }
                }))
            }
        });
        let server = Server::bind(&"127.0.0.1:0".parse().unwrap()).serve(make);
        let addr = server.local_addr();
        tokio::spawn(server);
        (addr, seen)
    }

    #[tokio::test]
    async fn lists_decode_into_records() {
        let (addr, seen) = fake_api(
            StatusCode::OK,
            r#"{"items":[{"metadata":{"name":"c1","namespace":"ns"},"spec":{"dataSource":{"kind":"","name":"dataset-x"}},"status":{"phase":"Pending"}}]}"#,
        )
        .await;
        let store = ApiServerStore::new(format!("http://{addr}/")).unwrap();
        let claims = store.list_claims().await.unwrap();
        assert_eq!(claims.len(), 1);
        assert_eq!(claims[0].data_source.as_ref().unwrap().name, "dataset-x");
        assert_eq!(seen.lock().unwrap()[0].1, "/api/v1/persistentvolumeclaims");
    }

    #[tokio::test]
    async fn conflict_maps_to_already_exists() {
        let (addr, _) = fake_api(StatusCode::CONFLICT, "{}").await;
        let store = ApiServerStore::new(format!("http://{addr}")).unwrap();
        let volume = VolumeRecord::from(
            serde_json::from_str::<Pv>(r#"{"metadata":{"name":"v1"}}"#).unwrap(),
        );
        let err = store.create_volume(&volume).await.unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn status_update_is_merge_patch() {
        let (addr, seen) = fake_api(StatusCode::OK, "{}").await;
        let store = ApiServerStore::new(format!("http://{addr}")).unwrap();
        let request = SnapshotRequest {
            namespace: "ns".into(),
            name: "snap".into(),
            bound_content_name: Some("snapcontent-1".into()),
            ready_to_use: true,
            ..Default::default()
        };
        store.update_snapshot_request_status(&request).await.unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen[0].0, Method::PATCH);
        assert_eq!(
            seen[0].1,
            "/apis/snapshot.storage.k8s.io/v1/namespaces/ns/volumesnapshots/snap/status"
        );
        assert!(seen[0].2.contains("boundVolumeSnapshotContentName"));
    }

    #[tokio::test]
    async fn server_error_is_store_error() {
        let (addr, _) = fake_api(StatusCode::INTERNAL_SERVER_ERROR, "boom").await;
        let store = ApiServerStore::new(format!("http://{addr}")).unwrap();
        let err = store.list_volumes().await.unwrap_err();
        assert!(matches!(err, ReflinkError::Store(ref msg) if msg.contains("boom")));
    }
}
