//! Backend HTTP Client
//!
//! Speaks HTTP/1.1 with hyper over tokio, with rustls for HTTPS.
//! Endpoints:
//!
//! | Method | Path           | Purpose                         |
//! |--------|----------------|---------------------------------|
//! | GET    | `/vpn/servers` | Server catalog                  |
//! | POST   | `/vpn/assign`  | Tunnel config for one server    |
//! | PATCH  | `/usage`       | Report session data usage       |
//! | GET    | `/health`      | Backend liveness                |
//!
//! Requests carry a Bearer token when one is configured, and every
//! call is bounded by the client timeout.

use std::sync::Arc;
use std::time::Duration;

use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE, HOST, USER_AGENT};
use hyper::{Method, Request, StatusCode};
use hyper_util::rt::TokioIo;
use rustls::ClientConfig;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tracing::debug;
use url::Url;

use async_trait::async_trait;
use mvpn_core::{AssignmentError, ServerAssignmentClient, ServerDescriptor};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Backend client errors
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Backend returned status {0}")]
    Status(u16),

    #[error("Body read error: {0}")]
    Body(String),

    #[error("JSON error: {0}")]
    Json(String),

    #[error("Request timeout")]
    Timeout,

    #[error("Not authorized (check the access token)")]
    Unauthorized,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AssignRequest<'a> {
    server_id: &'a str,
}

#[derive(Deserialize)]
struct AssignResponse {
    config: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct UsageReport {
    data_used: u64,
}

/// Control plane HTTP client
pub struct ApiClient {
    base_url: Url,
    token: Option<String>,
    timeout: Duration,
    user_agent: String,
}

impl ApiClient {
    /// Create a client for the given base URL, e.g. `https://api.example.com`
    pub fn new(base_url: &str) -> Result<Self, ApiError> {
        // a trailing slash keeps Url::join from eating path segments
        let mut base = base_url.to_string();
        if !base.ends_with('/') {
            base.push('/');
        }
        let base_url = Url::parse(&base).map_err(|e| ApiError::InvalidUrl(e.to_string()))?;
        if base_url.host_str().is_none() {
            return Err(ApiError::InvalidUrl("no host in URL".to_string()));
        }

        Ok(Self {
            base_url,
            token: None,
            timeout: DEFAULT_TIMEOUT,
            user_agent: format!("mvpn/{}", env!("CARGO_PKG_VERSION")),
        })
    }

    /// Attach a Bearer token to every request
    pub fn with_token(mut self, token: &str) -> Self {
        self.token = Some(token.to_string());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Fetch the server catalog
    pub async fn servers(&self) -> Result<Vec<ServerDescriptor>, ApiError> {
        let (status, body) = self.request(Method::GET, "vpn/servers", None).await?;
        decode(status, &body)
    }

    /// Request a tunnel config for one server. Returns the raw text.
    pub async fn assign(&self, server_id: &str) -> Result<String, ApiError> {
        let payload = serde_json::to_vec(&AssignRequest { server_id })
            .map_err(|e| ApiError::Json(e.to_string()))?;
        let (status, body) = self.request(Method::POST, "vpn/assign", Some(payload)).await?;
        let response: AssignResponse = decode(status, &body)?;
        Ok(response.config)
    }

    /// Report bytes moved through the current session
    pub async fn report_usage(&self, data_used: u64) -> Result<(), ApiError> {
        let payload =
            serde_json::to_vec(&UsageReport { data_used }).map_err(|e| ApiError::Json(e.to_string()))?;
        let (status, _body) = self.request(Method::PATCH, "usage", Some(payload)).await?;
        check_status(status)
    }

    /// Whether the backend answers its health check
    pub async fn health(&self) -> bool {
        matches!(
            self.request(Method::GET, "health", None).await,
            Ok((status, _)) if status.is_success()
        )
    }

    fn endpoint(&self, path: &str) -> Result<Url, ApiError> {
        self.base_url
            .join(path)
            .map_err(|e| ApiError::InvalidUrl(e.to_string()))
    }

    async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<Vec<u8>>,
    ) -> Result<(StatusCode, Vec<u8>), ApiError> {
        let url = self.endpoint(path)?;
        timeout(self.timeout, self.dispatch(method, url, body))
            .await
            .map_err(|_| ApiError::Timeout)?
    }

    async fn dispatch(
        &self,
        method: Method,
        url: Url,
        body: Option<Vec<u8>>,
    ) -> Result<(StatusCode, Vec<u8>), ApiError> {
        let host = url
            .host_str()
            .ok_or_else(|| ApiError::InvalidUrl("no host in URL".to_string()))?
            .to_string();
        let port = url.port_or_known_default().unwrap_or(80);
        let is_https = url.scheme() == "https";

        debug!("{} {}", method, url);

        let mut builder = Request::builder()
            .method(method)
            .uri(url.as_str())
            .header(USER_AGENT, &self.user_agent)
            .header(HOST, &host)
            .header(ACCEPT, "application/json");
        if let Some(token) = &self.token {
            builder = builder.header(AUTHORIZATION, format!("Bearer {token}"));
        }
        let request = match body {
            Some(data) => builder
                .header(CONTENT_TYPE, "application/json")
                .body(Full::new(Bytes::from(data))),
            None => builder.body(Full::new(Bytes::new())),
        }
        .map_err(|e| ApiError::Http(e.to_string()))?;

        let stream = TcpStream::connect((host.as_str(), port))
            .await
            .map_err(|e| ApiError::ConnectionFailed(e.to_string()))?;

        let response = if is_https {
            let mut root_store = rustls::RootCertStore::empty();
            root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            let tls_config = ClientConfig::builder()
                .with_root_certificates(root_store)
                .with_no_client_auth();
            let connector = TlsConnector::from(Arc::new(tls_config));
            let server_name = rustls::pki_types::ServerName::try_from(host.clone())
                .map_err(|_| ApiError::Tls("invalid server name".to_string()))?;
            let tls_stream = connector
                .connect(server_name, stream)
                .await
                .map_err(|e| ApiError::Tls(e.to_string()))?;
            send(TokioIo::new(tls_stream), request).await?
        } else {
            send(TokioIo::new(stream), request).await?
        };

        let status = response.status();
        let collected = response
            .into_body()
            .collect()
            .await
            .map_err(|e| ApiError::Body(e.to_string()))?;
        Ok((status, collected.to_bytes().to_vec()))
    }
}

async fn send<S>(
    io: TokioIo<S>,
    request: Request<Full<Bytes>>,
) -> Result<hyper::Response<hyper::body::Incoming>, ApiError>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
        .await
        .map_err(|e| ApiError::Http(e.to_string()))?;

    tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!("Connection closed with error: {}", e);
        }
    });

    sender
        .send_request(request)
        .await
        .map_err(|e| ApiError::Http(e.to_string()))
}

fn check_status(status: StatusCode) -> Result<(), ApiError> {
    if status == StatusCode::UNAUTHORIZED {
        return Err(ApiError::Unauthorized);
    }
    if !status.is_success() {
        return Err(ApiError::Status(status.as_u16()));
    }
    Ok(())
}

fn decode<T: DeserializeOwned>(status: StatusCode, body: &[u8]) -> Result<T, ApiError> {
    check_status(status)?;
    serde_json::from_slice(body).map_err(|e| ApiError::Json(e.to_string()))
}

#[async_trait]
impl ServerAssignmentClient for ApiClient {
    async fn list(&self) -> Result<Vec<ServerDescriptor>, AssignmentError> {
        self.servers().await.map_err(into_assignment_error)
    }

    async fn assign(&self, server_id: &str) -> Result<String, AssignmentError> {
        ApiClient::assign(self, server_id).await.map_err(|e| match e {
            ApiError::Status(404) => AssignmentError::UnknownServer(server_id.to_string()),
            other => into_assignment_error(other),
        })
    }
}

fn into_assignment_error(err: ApiError) -> AssignmentError {
    match err {
        ApiError::Timeout => AssignmentError::Timeout,
        other => AssignmentError::Backend(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_endpoint_joins_cleanly() {
        let client = ApiClient::new("http://127.0.0.1:8000").unwrap();
        assert_eq!(
            client.endpoint("vpn/servers").unwrap().as_str(),
            "http://127.0.0.1:8000/vpn/servers"
        );

        // a base with a path keeps it
        let client = ApiClient::new("https://api.example.com/v1").unwrap();
        assert_eq!(
            client.endpoint("vpn/assign").unwrap().as_str(),
            "https://api.example.com/v1/vpn/assign"
        );
    }

    #[test]
    fn test_rejects_hostless_url() {
        assert!(matches!(
            ApiClient::new("not a url"),
            Err(ApiError::InvalidUrl(_))
        ));
    }

    #[test]
    fn test_assign_request_wire_shape() {
        let payload = serde_json::to_value(AssignRequest {
            server_id: "eu-west-1",
        })
        .unwrap();
        assert_eq!(payload, json!({ "serverId": "eu-west-1" }));
    }

    #[test]
    fn test_usage_report_wire_shape() {
        let payload = serde_json::to_value(UsageReport { data_used: 123 }).unwrap();
        assert_eq!(payload, json!({ "dataUsed": 123 }));
    }

    #[test]
    fn test_assign_response_parses() {
        let raw = r#"{ "config": "[Interface]\nPrivateKey = x\n" }"#;
        let response: AssignResponse = serde_json::from_str(raw).unwrap();
        assert!(response.config.starts_with("[Interface]"));
    }

    #[test]
    fn test_server_catalog_parses() {
        let raw = r#"[
            { "id": "us-east-1", "region": "US East", "ip": "1.2.3.4", "status": "online" },
            { "id": "eu-west-1", "region": "EU West", "ip": "5.6.7.8", "status": "offline" }
        ]"#;
        let servers: Vec<ServerDescriptor> =
            decode(StatusCode::OK, raw.as_bytes()).unwrap();

        assert_eq!(servers.len(), 2);
        assert_eq!(servers[0].id, "us-east-1");
        assert!(servers[0].status.is_online());
        assert!(!servers[1].status.is_online());
    }

    #[test]
    fn test_status_mapping() {
        assert!(matches!(
            check_status(StatusCode::UNAUTHORIZED),
            Err(ApiError::Unauthorized)
        ));
        assert!(matches!(
            check_status(StatusCode::INTERNAL_SERVER_ERROR),
            Err(ApiError::Status(500))
        ));
        assert!(check_status(StatusCode::OK).is_ok());
    }

    #[tokio::test]
    async fn test_servers_against_local_backend() {
        let client = ApiClient::new("http://127.0.0.1:8000")
            .unwrap()
            .with_timeout(Duration::from_secs(2));

        // This test requires a running backend
        match client.servers().await {
            Ok(servers) => assert!(!servers.is_empty()),
            Err(e) => println!("Network test skipped: {}", e),
        }
    }
}
