//! Backend HTTP surface
//!
//! Only the two session calls are typed. Everything else goes through
//! [`Backend::call`], which never fails: transport or status errors come back
//! as a response without data.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::{PoisonError, RwLock};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use crate::crypto::{Address, SignatureBytes};
use crate::transport::SESSION_HEADER;

/// Request timeout for every backend call
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Backend errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ApiError {
    /// No HTTP endpoint configured
    #[error("Unknown endpoint: no API URL configured")]
    UnknownEndpoint,

    /// Network or client failure
    #[error("Transport failure: {0}")]
    Transport(String),

    /// Backend answered with an error status
    #[error("Backend returned {status}: {body}")]
    Status {
        /// HTTP status code
        status: u16,
        /// Response body, if readable
        body: String,
    },

    /// Response did not have the expected shape
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

/// Result type for backend operations
pub type ApiResult<T> = Result<T, ApiError>;

/// HTTP method for untyped calls
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Method {
    /// GET
    Get,
    /// POST
    Post,
    /// PUT
    Put,
}

/// Challenge hash issued by `POST /session`
#[derive(Clone, PartialEq, Eq)]
pub struct SessionHash(pub Vec<u8>);

impl SessionHash {
    /// `0x`-prefixed hex
    pub fn to_hex(&self) -> String {
        format!("0x{}", hex::encode(&self.0))
    }
}

impl std::fmt::Debug for SessionHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SessionHash({})", self.to_hex())
    }
}

impl Serialize for SessionHash {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for SessionHash {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let digits = s.strip_prefix("0x").unwrap_or(&s);
        hex::decode(digits)
            .map(SessionHash)
            .map_err(serde::de::Error::custom)
    }
}

/// Body of `PUT /session`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifySessionRequest {
    /// The challenge hash being answered
    pub hash: SessionHash,
    /// Address that signed it
    pub signer: Address,
    /// Personal signature over the hash bytes
    pub signature: SignatureBytes,
}

#[derive(Deserialize)]
struct CreateSessionResponse {
    hash: SessionHash,
}

#[derive(Deserialize)]
struct VerifySessionResponse {
    token: String,
}

/// Result of an untyped call
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CallResponse {
    /// Response body, `None` on any failure
    pub data: Option<Value>,
}

/// What the session engine needs from the backend
#[async_trait]
pub trait Backend: Send + Sync {
    /// Point the backend at a base URL, or unset it
    fn set_endpoint(&self, _endpoint: Option<&str>) {}

    /// `POST /session`: request a fresh challenge hash
    async fn create_session(&self) -> ApiResult<SessionHash>;

    /// `PUT /session`: exchange a signed challenge for a token
    async fn verify_session(&self, request: &VerifySessionRequest) -> ApiResult<String>;

    /// Untyped resource call, authenticated when `token` is given
    async fn call(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
        token: Option<&str>,
    ) -> CallResponse;
}

/// reqwest-backed [`Backend`]
pub struct HttpBackend {
    http: reqwest::Client,
    base_url: RwLock<Option<String>>,
}

impl HttpBackend {
    /// Create a backend with no endpoint configured
    pub fn new() -> ApiResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| ApiError::Transport(e.to_string()))?;

        Ok(Self {
            http,
            base_url: RwLock::new(None),
        })
    }

    fn url(&self, path: &str) -> ApiResult<String> {
        let base = self.base_url.read().unwrap_or_else(PoisonError::into_inner);
        let base = base.as_deref().ok_or(ApiError::UnknownEndpoint)?;
        Ok(format!(
            "{}/{}",
            base.trim_end_matches('/'),
            path.trim_start_matches('/')
        ))
    }

    async fn read_json<T: serde::de::DeserializeOwned>(resp: reqwest::Response) -> ApiResult<T> {
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ApiError::Status {
                status: status.as_u16(),
                body,
            });
        }

        resp.json()
            .await
            .map_err(|e| ApiError::InvalidResponse(e.to_string()))
    }
}

#[async_trait]
impl Backend for HttpBackend {
    fn set_endpoint(&self, endpoint: Option<&str>) {
        *self.base_url.write().unwrap_or_else(PoisonError::into_inner) =
            endpoint.map(str::to_string);
    }

    async fn create_session(&self) -> ApiResult<SessionHash> {
        let resp = self
            .http
            .post(self.url("session")?)
            .send()
            .await
            .map_err(|e| ApiError::Transport(e.to_string()))?;

        let created: CreateSessionResponse = Self::read_json(resp).await?;
        Ok(created.hash)
    }

    async fn verify_session(&self, request: &VerifySessionRequest) -> ApiResult<String> {
        let resp = self
            .http
            .put(self.url("session")?)
            .json(request)
            .send()
            .await
            .map_err(|e| ApiError::Transport(e.to_string()))?;

        let verified: VerifySessionResponse = Self::read_json(resp).await?;
        Ok(verified.token)
    }

    async fn call(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
        token: Option<&str>,
    ) -> CallResponse {
        let url = match self.url(path) {
            Ok(url) => url,
            Err(e) => {
                warn!(path, error = %e, "call skipped");
                return CallResponse::default();
            }
        };

        let mut request = match method {
            Method::Get => self.http.get(&url),
            Method::Post => self.http.post(&url),
            Method::Put => self.http.put(&url),
        };
        if let Some(token) = token {
            request = request.header(SESSION_HEADER, token);
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        let result = match request.send().await {
            Ok(resp) => Self::read_json::<Value>(resp).await,
            Err(e) => Err(ApiError::Transport(e.to_string())),
        };

        match result {
            Ok(data) => CallResponse { data: Some(data) },
            Err(e) => {
                debug!(?method, path, error = %e, "call failed");
                CallResponse::default()
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Device;

    #[test]
    fn test_verify_request_json_shape() {
        let device = Device::generate();
        let hash = SessionHash(vec![0xaa; 32]);
        let request = VerifySessionRequest {
            signature: device.sign(&hash.0).unwrap(),
            signer: device.address(),
            hash,
        };

        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["hash"], format!("0x{}", "aa".repeat(32)));
        assert_eq!(json["signer"], device.address().to_hex());
        assert_eq!(
            serde_json::from_value::<VerifySessionRequest>(json).unwrap(),
            request
        );
    }

    #[test]
    fn test_session_hash_accepts_unprefixed_hex() {
        let hash: SessionHash = serde_json::from_str("\"0102\"").unwrap();
        assert_eq!(hash.0, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_http_backend_without_endpoint() {
        let backend = HttpBackend::new().unwrap();

        assert_eq!(backend.create_session().await, Err(ApiError::UnknownEndpoint));
        let response = backend.call(Method::Get, "account", None, None).await;
        assert_eq!(response.data, None);
    }

    #[test]
    fn test_url_joining() {
        let backend = HttpBackend::new().unwrap();
        backend.set_endpoint(Some("https://api.example.org/v1/"));

        assert_eq!(
            backend.url("/session").unwrap(),
            "https://api.example.org/v1/session"
        );
    }

    #[tokio::test]
    async fn test_http_backend_unreachable_call_is_silent() {
        let backend = HttpBackend::new().unwrap();
        // Port 9 (discard) is closed on test machines
        backend.set_endpoint(Some("http://127.0.0.1:9"));

        let response = backend.call(Method::Get, "account", None, Some("t")).await;
        assert!(response.data.is_none());
        assert!(matches!(
            backend.create_session().await,
            Err(ApiError::Transport(_))
        ));
    }
}
