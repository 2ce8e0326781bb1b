//! HTTP remote implementation.
//!
//! [`RestRemote`] maps the three remote verbs onto a PostgREST-style API.
//! The actual HTTP client is abstracted via a trait to allow different
//! implementations (reqwest, hyper, etc.).
//!
//! | verb   | request                                                   |
//! |--------|-----------------------------------------------------------|
//! | upsert | `POST {endpoint}/{table}`, `Prefer: resolution=merge-duplicates` |
//! | patch  | `PATCH {endpoint}/{table}?id=eq.{id}`                      |
//! | delete | `DELETE {endpoint}/{table}?id=eq.{id}`                     |

use crate::error::{SyncError, SyncResult};
use crate::remote::RemoteStore;
use async_trait::async_trait;
use tallydb_sync_protocol::{Credential, Row};
use tracing::debug;

/// HTTP method used by the remote.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    /// `POST`
    Post,
    /// `PATCH`
    Patch,
    /// `DELETE`
    Delete,
}

impl HttpMethod {
    /// The method name.
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Post => "POST",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Delete => "DELETE",
        }
    }
}

/// An outgoing request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    /// Method.
    pub method: HttpMethod,
    /// Absolute URL including the query string.
    pub url: String,
    /// Header name/value pairs.
    pub headers: Vec<(String, String)>,
    /// JSON body.
    pub body: Option<Vec<u8>>,
}

impl HttpRequest {
    /// Returns the first header named `name`, ignoring case.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// A received response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    /// Status code.
    pub status: u16,
    /// Body bytes.
    pub body: Vec<u8>,
}

impl HttpResponse {
    /// Creates a response with an empty body.
    pub fn status(status: u16) -> Self {
        Self {
            status,
            body: Vec::new(),
        }
    }
}

/// HTTP client abstraction.
///
/// Implement this trait to provide the actual HTTP transport. An `Err` is
/// a transport failure (no response) and is always retried.
#[async_trait]
pub trait HttpClient: Send + Sync {
    /// Sends a request.
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, String>;
}

/// PostgREST-style remote store.
pub struct RestRemote<C: HttpClient> {
    client: C,
    api_key: Option<String>,
}

impl<C: HttpClient> RestRemote<C> {
    /// Creates a remote over `client`.
    pub fn new(client: C) -> Self {
        Self {
            client,
            api_key: None,
        }
    }

    /// Sends an `apikey` header with every request, as hosted PostgREST
    /// gateways require.
    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    /// The underlying client.
    pub fn client(&self) -> &C {
        &self.client
    }

    fn request(
        &self,
        credential: &Credential,
        method: HttpMethod,
        table: &str,
        id: Option<&str>,
        body: Option<&Row>,
    ) -> SyncResult<HttpRequest> {
        let mut url = format!("{}/{}", credential.endpoint.trim_end_matches('/'), table);
        if let Some(id) = id {
            url.push_str("?id=eq.");
            url.push_str(&encode_query_value(id));
        }

        let mut headers = vec![(
            "Authorization".to_string(),
            format!("Bearer {}", credential.token),
        )];
        if let Some(api_key) = &self.api_key {
            headers.push(("apikey".to_string(), api_key.clone()));
        }
        if method == HttpMethod::Post {
            headers.push((
                "Prefer".to_string(),
                "resolution=merge-duplicates,return=minimal".to_string(),
            ));
        } else {
            headers.push(("Prefer".to_string(), "return=minimal".to_string()));
        }

        let body = match body {
            Some(row) => {
                headers.push(("Content-Type".to_string(), "application/json".to_string()));
                Some(
                    serde_json::to_vec(row)
                        .map_err(|e| SyncError::rejected(None, format!("unencodable row: {e}")))?,
                )
            }
            None => None,
        };

        Ok(HttpRequest {
            method,
            url,
            headers,
            body,
        })
    }

    async fn send(&self, request: HttpRequest) -> SyncResult<()> {
        let method = request.method;
        debug!(method = method.as_str(), url = %request.url, "remote request");
        let response = self
            .client
            .send(request)
            .await
            .map_err(SyncError::transport_retryable)?;
        classify(method, &response)
    }
}

#[async_trait]
impl<C: HttpClient> RemoteStore for RestRemote<C> {
    async fn upsert(
        &self,
        credential: &Credential,
        table: &str,
        id: &str,
        data: &Row,
    ) -> SyncResult<()> {
        let mut row = data.clone();
        row.insert("id".into(), serde_json::Value::String(id.to_string()));
        let request = self.request(credential, HttpMethod::Post, table, None, Some(&row))?;
        self.send(request).await
    }

    async fn patch(
        &self,
        credential: &Credential,
        table: &str,
        id: &str,
        data: &Row,
    ) -> SyncResult<()> {
        let request = self.request(credential, HttpMethod::Patch, table, Some(id), Some(data))?;
        self.send(request).await
    }

    async fn delete(&self, credential: &Credential, table: &str, id: &str) -> SyncResult<()> {
        let request = self.request(credential, HttpMethod::Delete, table, Some(id), None)?;
        self.send(request).await
    }
}

/// Maps a response status to the engine's failure classes.
fn classify(method: HttpMethod, response: &HttpResponse) -> SyncResult<()> {
    let status = response.status;
    let message = || {
        let body = String::from_utf8_lossy(&response.body);
        let body: String = body.chars().take(200).collect();
        if body.is_empty() {
            format!("HTTP {status}")
        } else {
            format!("HTTP {status}: {body}")
        }
    };

    match status {
        200..=299 => Ok(()),
        404 if method == HttpMethod::Delete => Ok(()),
        401 => Err(SyncError::Unauthorized(message())),
        409 => Err(SyncError::Conflict(message())),
        408 | 429 | 500..=599 => Err(SyncError::transport_retryable(message())),
        _ => Err(SyncError::rejected(Some(status), message())),
    }
}

/// Percent-encodes everything outside the unreserved set.
fn encode_query_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'_' | b'.' | b'~') {
            out.push(byte as char);
        } else {
            out.push_str(&format!("%{byte:02X}"));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorClass;
    use parking_lot::Mutex;
    use serde_json::json;

    struct TestClient {
        responses: Mutex<Vec<Result<HttpResponse, String>>>,
        requests: Mutex<Vec<HttpRequest>>,
    }

    impl TestClient {
        fn new(responses: Vec<Result<HttpResponse, String>>) -> Self {
            Self {
                responses: Mutex::new(responses),
                requests: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl HttpClient for TestClient {
        async fn send(&self, request: HttpRequest) -> Result<HttpResponse, String> {
            self.requests.lock().push(request);
            let mut responses = self.responses.lock();
            if responses.is_empty() {
                Ok(HttpResponse::status(204))
            } else {
                responses.remove(0)
            }
        }
    }

    fn credential() -> Credential {
        Credential::new("https://db.example.com/rest/v1/", "secret")
    }

    #[tokio::test]
    async fn upsert_request_shape() {
        let remote = RestRemote::new(TestClient::new(vec![])).with_api_key("anon");
        let data = json!({"amount_cents": 500}).as_object().cloned().unwrap();
        remote
            .upsert(&credential(), "transactions", "a1", &data)
            .await
            .unwrap();

        let requests = remote.client().requests.lock();
        let request = &requests[0];
        assert_eq!(request.method, HttpMethod::Post);
        assert_eq!(request.url, "https://db.example.com/rest/v1/transactions");
        assert_eq!(request.header("authorization"), Some("Bearer secret"));
        assert_eq!(request.header("apikey"), Some("anon"));
        assert!(request
            .header("prefer")
            .unwrap()
            .contains("resolution=merge-duplicates"));
        let body: serde_json::Value =
            serde_json::from_slice(request.body.as_ref().unwrap()).unwrap();
        assert_eq!(body, json!({"id": "a1", "amount_cents": 500}));
    }

    #[tokio::test]
    async fn patch_and_delete_filter_by_id() {
        let remote = RestRemote::new(TestClient::new(vec![]));
        let data = json!({"merchant": "Cafe"}).as_object().cloned().unwrap();
        remote
            .patch(&credential(), "transactions", "a 1", &data)
            .await
            .unwrap();
        remote
            .delete(&credential(), "transactions", "a1")
            .await
            .unwrap();

        let requests = remote.client().requests.lock();
        assert_eq!(requests[0].method, HttpMethod::Patch);
        assert_eq!(
            requests[0].url,
            "https://db.example.com/rest/v1/transactions?id=eq.a%201"
        );
        assert_eq!(requests[1].method, HttpMethod::Delete);
        assert!(requests[1].body.is_none());
    }

    #[tokio::test]
    async fn status_classification() {
        let cases: Vec<(Result<HttpResponse, String>, Option<ErrorClass>)> = vec![
            (Ok(HttpResponse::status(201)), None),
            (Ok(HttpResponse::status(401)), Some(ErrorClass::Unauthorized)),
            (Ok(HttpResponse::status(409)), Some(ErrorClass::Conflict)),
            (Ok(HttpResponse::status(429)), Some(ErrorClass::Retryable)),
            (Ok(HttpResponse::status(503)), Some(ErrorClass::Retryable)),
            (Ok(HttpResponse::status(403)), Some(ErrorClass::Fatal)),
            (Ok(HttpResponse::status(404)), Some(ErrorClass::Fatal)),
            (Err("connection refused".into()), Some(ErrorClass::Retryable)),
        ];
        let data = json!({"amount_cents": 1}).as_object().cloned().unwrap();

        for (response, expected) in cases {
            let remote = RestRemote::new(TestClient::new(vec![response]));
            let result = remote.upsert(&credential(), "transactions", "1", &data).await;
            assert_eq!(result.err().map(|e| e.class()), expected);
        }
    }

    #[tokio::test]
    async fn delete_of_missing_record_succeeds() {
        let remote = RestRemote::new(TestClient::new(vec![Ok(HttpResponse::status(404))]));
        remote
            .delete(&credential(), "transactions", "gone")
            .await
            .unwrap();
    }

    #[test]
    fn error_messages_include_body() {
        let response = HttpResponse {
            status: 409,
            body: b"duplicate key value".to_vec(),
        };
        let err = classify(HttpMethod::Post, &response).unwrap_err();
        assert_eq!(err.to_string(), "conflict: HTTP 409: duplicate key value");
    }
}
