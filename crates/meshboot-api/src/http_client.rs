//! HTTP implementation of [`ControlPlane`].
//!
//! One short-lived HTTP/1.1 connection per call: connect, handshake, send,
//! collect the body. Calls are bounded by a per-request timeout; a timed
//! out call is reported as a transport error so callers treat it like any
//! other unreachable node.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::{Method, Request};
use http_body_util::{BodyExt, Full};
use hyper_util::rt::TokioIo;
use meshboot_core::ConfigEntry;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, trace};

use crate::client::{ClientProvider, ControlPlane};
use crate::error::{ApiError, ApiResult};
use crate::types::{
    AclPolicy, AclToken, AgentTokenKind, AgentTokenRequest, CatalogNode, Namespace, Partition,
    Peering, PeeringEstablishRequest, PeeringTokenRequest, PeeringTokenResponse, ServiceHealth,
    Tenancy,
};

/// Default per-request timeout.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

const TOKEN_HEADER: &str = "x-consul-token";
const USER_AGENT: &str = concat!("meshboot/", env!("CARGO_PKG_VERSION"));

/// Control-plane handle speaking the HTTP API of one node.
#[derive(Debug, Clone)]
pub struct HttpControlPlane {
    address: String,
    token: String,
    timeout: Duration,
}

impl HttpControlPlane {
    pub fn new(address: &str, token: &str) -> Self {
        Self {
            address: address.to_string(),
            token: token.to_string(),
            timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Issue one request and return the raw response body of a 2xx reply.
    async fn request(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<Vec<u8>>,
    ) -> ApiResult<Bytes> {
        let uri = build_uri(path, query);
        let address = self.address.as_str();

        let exchange = async {
            let stream = tokio::net::TcpStream::connect(address)
                .await
                .map_err(|e| ApiError::transport(address, e.to_string()))?;

            let io = TokioIo::new(stream);
            let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
                .await
                .map_err(|e| ApiError::transport(address, e.to_string()))?;

            // Drive the connection in the background.
            tokio::spawn(async move {
                let _ = conn.await;
            });

            let mut builder = Request::builder()
                .method(method.clone())
                .uri(&uri)
                .header("host", address)
                .header("user-agent", USER_AGENT);
            if !self.token.is_empty() {
                builder = builder.header(TOKEN_HEADER, &self.token);
            }
            if body.is_some() {
                builder = builder.header("content-type", "application/json");
            }
            let req = builder
                .body(Full::new(Bytes::from(body.unwrap_or_default())))
                .map_err(|e| ApiError::Encode(e.to_string()))?;

            let resp = sender
                .send_request(req)
                .await
                .map_err(|e| ApiError::transport(address, e.to_string()))?;
            let status = resp.status();
            let bytes = resp
                .into_body()
                .collect()
                .await
                .map_err(|e| ApiError::transport(address, e.to_string()))?
                .to_bytes();

            if !status.is_success() {
                let text = String::from_utf8_lossy(&bytes).trim().to_string();
                debug!(%method, %uri, %address, status = status.as_u16(), body = %text, "request rejected");
                return Err(ApiError::status(status.as_u16(), address, text));
            }
            trace!(%method, %uri, %address, status = status.as_u16(), "request ok");
            Ok(bytes)
        };

        match tokio::time::timeout(self.timeout, exchange).await {
            Ok(result) => result,
            Err(_) => Err(ApiError::transport(
                address,
                format!("request {method} {uri} timed out after {:?}", self.timeout),
            )),
        }
    }

    async fn get<T: DeserializeOwned>(&self, path: &str, query: &[(&str, String)]) -> ApiResult<T> {
        let bytes = self.request(Method::GET, path, query, None).await?;
        decode(&bytes)
    }

    async fn send<B: Serialize + ?Sized>(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: &B,
    ) -> ApiResult<Bytes> {
        let body = serde_json::to_vec(body).map_err(|e| ApiError::Encode(e.to_string()))?;
        self.request(method, path, query, Some(body)).await
    }

    async fn send_json<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: &B,
    ) -> ApiResult<T> {
        let bytes = self.send(method, path, query, body).await?;
        decode(&bytes)
    }
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> ApiResult<T> {
    serde_json::from_slice(bytes).map_err(|e| ApiError::Decode(e.to_string()))
}

/// Map a 404 (or "ACL not found") to `None`.
fn optional<T>(result: ApiResult<T>) -> ApiResult<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e),
    }
}

fn build_uri(path: &str, query: &[(&str, String)]) -> String {
    if query.is_empty() {
        return path.to_string();
    }
    let pairs: Vec<String> = query
        .iter()
        .map(|(k, v)| format!("{k}={}", encode_component(v)))
        .collect();
    format!("{path}?{}", pairs.join("&"))
}

/// Percent-encode a path segment or query value.
fn encode_component(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' | b'*' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

/// Percent-encode a slash-separated key, keeping the slashes.
fn encode_path(value: &str) -> String {
    value
        .split('/')
        .map(encode_component)
        .collect::<Vec<_>>()
        .join("/")
}

#[async_trait]
impl ControlPlane for HttpControlPlane {
    async fn leader(&self) -> ApiResult<String> {
        self.get("/v1/status/leader", &[]).await
    }

    async fn acl_bootstrap(&self) -> ApiResult<AclToken> {
        let bytes = self
            .request(Method::PUT, "/v1/acl/bootstrap", &[], None)
            .await?;
        decode(&bytes)
    }

    async fn token_read_self(&self) -> ApiResult<AclToken> {
        self.get("/v1/acl/token/self", &[]).await
    }

    async fn policy_read_by_name(
        &self,
        name: &str,
        tenancy: &Tenancy,
    ) -> ApiResult<Option<AclPolicy>> {
        let path = format!("/v1/acl/policy/name/{}", encode_component(name));
        optional(self.get(&path, &tenancy.query()).await)
    }

    async fn policy_create(&self, policy: &AclPolicy) -> ApiResult<AclPolicy> {
        self.send_json(Method::PUT, "/v1/acl/policy", &[], policy)
            .await
    }

    async fn policy_update(&self, policy: &AclPolicy) -> ApiResult<AclPolicy> {
        let path = format!("/v1/acl/policy/{}", encode_component(&policy.id));
        self.send_json(Method::PUT, &path, &[], policy).await
    }

    async fn token_list(&self, tenancy: &Tenancy) -> ApiResult<Vec<AclToken>> {
        self.get("/v1/acl/tokens", &tenancy.query()).await
    }

    async fn token_create(&self, token: &AclToken) -> ApiResult<AclToken> {
        self.send_json(Method::PUT, "/v1/acl/token", &[], token)
            .await
    }

    async fn token_update(&self, token: &AclToken) -> ApiResult<AclToken> {
        let path = format!("/v1/acl/token/{}", encode_component(&token.accessor_id));
        self.send_json(Method::PUT, &path, &[], token).await
    }

    async fn catalog_nodes(&self, partition: &str) -> ApiResult<Vec<CatalogNode>> {
        self.get("/v1/catalog/nodes", &Tenancy::partition(partition).query())
            .await
    }

    async fn catalog_services(&self, tenancy: &Tenancy) -> ApiResult<BTreeMap<String, Vec<String>>> {
        self.get("/v1/catalog/services", &tenancy.query()).await
    }

    async fn health_service(&self, name: &str, tenancy: &Tenancy) -> ApiResult<Vec<ServiceHealth>> {
        let path = format!("/v1/health/service/{}", encode_component(name));
        self.get(&path, &tenancy.query()).await
    }

    async fn config_entries_list(&self, kind: &str, tenancy: &Tenancy) -> ApiResult<Vec<ConfigEntry>> {
        let path = format!("/v1/config/{}", encode_component(kind));
        // An empty kind lists as `null`.
        let entries: Option<Vec<ConfigEntry>> = self.get(&path, &tenancy.query()).await?;
        Ok(entries.unwrap_or_default())
    }

    async fn config_entry_set(&self, entry: &ConfigEntry) -> ApiResult<()> {
        self.send(Method::PUT, "/v1/config", &[], entry).await?;
        Ok(())
    }

    async fn config_entry_delete(&self, kind: &str, name: &str, tenancy: &Tenancy) -> ApiResult<()> {
        let path = format!(
            "/v1/config/{}/{}",
            encode_component(kind),
            encode_component(name)
        );
        self.request(Method::DELETE, &path, &tenancy.query(), None)
            .await?;
        Ok(())
    }

    async fn partitions_list(&self) -> ApiResult<Vec<Partition>> {
        self.get("/v1/partitions", &[]).await
    }

    async fn partition_create(&self, name: &str) -> ApiResult<()> {
        let body = Partition {
            name: name.to_string(),
            description: "created by meshboot".to_string(),
        };
        self.send(Method::PUT, "/v1/partition", &[], &body).await?;
        Ok(())
    }

    async fn partition_delete(&self, name: &str) -> ApiResult<()> {
        let path = format!("/v1/partition/{}", encode_component(name));
        self.request(Method::DELETE, &path, &[], None).await?;
        Ok(())
    }

    async fn namespaces_list(&self, partition: &str) -> ApiResult<Vec<Namespace>> {
        self.get("/v1/namespaces", &Tenancy::partition(partition).query())
            .await
    }

    async fn namespace_create(&self, partition: &str, name: &str) -> ApiResult<()> {
        let body = Namespace {
            name: name.to_string(),
            partition: partition.to_string(),
            description: "created by meshboot".to_string(),
        };
        self.send(Method::PUT, "/v1/namespace", &[], &body).await?;
        Ok(())
    }

    async fn namespace_delete(&self, partition: &str, name: &str) -> ApiResult<()> {
        let path = format!("/v1/namespace/{}", encode_component(name));
        self.request(
            Method::DELETE,
            &path,
            &Tenancy::partition(partition).query(),
            None,
        )
        .await?;
        Ok(())
    }

    async fn peering_read(&self, peer: &str, partition: &str) -> ApiResult<Option<Peering>> {
        let path = format!("/v1/peering/{}", encode_component(peer));
        optional(self.get(&path, &Tenancy::partition(partition).query()).await)
    }

    async fn peering_generate_token(&self, peer: &str, partition: &str) -> ApiResult<String> {
        let resp: PeeringTokenResponse = self
            .send_json(
                Method::POST,
                "/v1/peering/token",
                &Tenancy::partition(partition).query(),
                &PeeringTokenRequest { peer_name: peer },
            )
            .await?;
        Ok(resp.peering_token)
    }

    async fn peering_establish(&self, peer: &str, token: &str, partition: &str) -> ApiResult<()> {
        self.send(
            Method::POST,
            "/v1/peering/establish",
            &Tenancy::partition(partition).query(),
            &PeeringEstablishRequest {
                peer_name: peer,
                peering_token: token,
            },
        )
        .await?;
        Ok(())
    }

    async fn kv_put(&self, key: &str, value: &str, datacenter: Option<&str>) -> ApiResult<()> {
        let path = format!("/v1/kv/{}", encode_path(key));
        let query: Vec<(&str, String)> = datacenter
            .map(|dc| vec![("dc", dc.to_string())])
            .unwrap_or_default();
        self.request(
            Method::PUT,
            &path,
            &query,
            Some(value.as_bytes().to_vec()),
        )
        .await?;
        Ok(())
    }

    async fn agent_update_token(&self, kind: AgentTokenKind, token: &str) -> ApiResult<()> {
        let path = format!("/v1/agent/token/{kind}");
        self.send(Method::PUT, &path, &[], &AgentTokenRequest { token })
            .await?;
        Ok(())
    }
}

/// [`ClientProvider`] producing [`HttpControlPlane`] handles.
#[derive(Debug, Clone)]
pub struct HttpClientProvider {
    timeout: Duration,
}

impl HttpClientProvider {
    pub fn new() -> Self {
        Self {
            timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl Default for HttpClientProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientProvider for HttpClientProvider {
    fn client(&self, address: &str, token: &str) -> Arc<dyn ControlPlane> {
        Arc::new(HttpControlPlane::new(address, token).with_timeout(self.timeout))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serve exactly one canned response and hand back the raw request head.
    async fn serve_once(status: &str, body: &'static str) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let status = status.to_string();
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut head = Vec::new();
            let mut buf = [0u8; 1024];
            while !head.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                head.extend_from_slice(&buf[..n]);
            }
            let response = format!(
                "HTTP/1.1 {status}\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                body.len()
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            String::from_utf8_lossy(&head).to_string()
        });
        (address, handle)
    }

    #[test]
    fn uri_encodes_query_values() {
        assert_eq!(build_uri("/v1/acl/tokens", &[]), "/v1/acl/tokens");
        assert_eq!(
            build_uri(
                "/v1/catalog/services",
                &[("partition", "ap 1".to_string()), ("ns", "*".to_string())]
            ),
            "/v1/catalog/services?partition=ap%201&ns=*"
        );
        assert_eq!(encode_path("meshboot/ready"), "meshboot/ready");
    }

    #[tokio::test]
    async fn leader_is_decoded_and_token_sent() {
        let (address, server) = serve_once("200 OK", "\"10.0.1.11:8300\"").await;
        let client = HttpControlPlane::new(&address, "root-secret");

        assert_eq!(client.leader().await.unwrap(), "10.0.1.11:8300");

        let head = server.await.unwrap();
        assert!(head.starts_with("GET /v1/status/leader HTTP/1.1"));
        assert!(head.to_lowercase().contains("x-consul-token: root-secret"));
    }

    #[tokio::test]
    async fn error_status_carries_body() {
        let (address, server) = serve_once("403 Forbidden", "ACL not found").await;
        let client = HttpControlPlane::new(&address, "stale");

        let err = client.token_read_self().await.unwrap_err();
        assert_eq!(err.status_code(), Some(403));
        assert!(err.is_not_found());
        server.await.unwrap();
    }

    #[tokio::test]
    async fn missing_peering_reads_as_none() {
        let (address, server) = serve_once("404 Not Found", "").await;
        let client = HttpControlPlane::new(&address, "root-secret");

        assert!(client.peering_read("dc2", "").await.unwrap().is_none());
        server.await.unwrap();
    }

    #[tokio::test]
    async fn refused_connection_is_transport_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        drop(listener);

        let client = HttpControlPlane::new(&address, "");
        let err = client.leader().await.unwrap_err();
        assert!(err.is_transport());
    }
}
