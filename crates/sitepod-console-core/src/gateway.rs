//! Generic JSON request wrapper used by every console feature.
//!
//! The gateway reads the session token fresh on every call and never writes
//! session state. A 401 is returned to the caller like any other failure.

use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use uuid::Uuid;

use crate::config::{ConsoleClientConfig, join_path};
use crate::session::SessionReader;
use crate::transport::{
    CONTENT_TYPE_JSON, HEADER_CONTENT_TYPE, HEADER_REQUEST_ID, HttpMethod, HttpRequest,
    HttpTransport,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestErrorKind {
    Network,
    Http,
    Decode,
    Encode,
}

impl RequestErrorKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::Http => "http",
            Self::Decode => "decode",
            Self::Encode => "encode",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct RequestError {
    pub kind: RequestErrorKind,
    pub status: Option<u16>,
    pub message: String,
}

impl RequestError {
    fn new(kind: RequestErrorKind, status: Option<u16>, message: impl Into<String>) -> Self {
        Self {
            kind,
            status,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn is_unauthorized(&self) -> bool {
        self.status == Some(401)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RequestOptions {
    pub method: HttpMethod,
    pub body: Option<Value>,
}

impl RequestOptions {
    #[must_use]
    pub fn method(method: HttpMethod) -> Self {
        Self { method, body: None }
    }

    pub fn with_body<B>(mut self, body: &B) -> Result<Self, RequestError>
    where
        B: Serialize + ?Sized,
    {
        let value = serde_json::to_value(body).map_err(|error| {
            RequestError::new(
                RequestErrorKind::Encode,
                None,
                format!("failed to serialize request body: {error}"),
            )
        })?;
        self.body = Some(value);
        Ok(self)
    }
}

#[derive(Clone)]
pub struct RequestGateway {
    api_base: String,
    session: SessionReader,
    transport: Arc<dyn HttpTransport>,
}

impl std::fmt::Debug for RequestGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestGateway")
            .field("api_base", &self.api_base)
            .finish_non_exhaustive()
    }
}

impl RequestGateway {
    #[must_use]
    pub fn new(
        config: &ConsoleClientConfig,
        session: SessionReader,
        transport: Arc<dyn HttpTransport>,
    ) -> Self {
        Self {
            api_base: config.api_base(),
            session,
            transport,
        }
    }

    #[must_use]
    pub fn endpoint(&self, path: &str) -> String {
        join_path(&self.api_base, path)
    }

    pub async fn get<T>(&self, path: &str) -> Result<T, RequestError>
    where
        T: DeserializeOwned,
    {
        self.request(path, RequestOptions::default()).await
    }

    pub async fn post<T, B>(&self, path: &str, body: &B) -> Result<T, RequestError>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        let options = RequestOptions::method(HttpMethod::Post).with_body(body)?;
        self.request(path, options).await
    }

    pub async fn put<T, B>(&self, path: &str, body: &B) -> Result<T, RequestError>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        let options = RequestOptions::method(HttpMethod::Put).with_body(body)?;
        self.request(path, options).await
    }

    pub async fn delete<T>(&self, path: &str) -> Result<T, RequestError>
    where
        T: DeserializeOwned,
    {
        self.request(path, RequestOptions::method(HttpMethod::Delete))
            .await
    }

    /// One round trip. The shape of `T` is trusted; only decoding can fail.
    pub async fn request<T>(&self, path: &str, options: RequestOptions) -> Result<T, RequestError>
    where
        T: DeserializeOwned,
    {
        let data = self.request_value(path, options).await?;
        serde_json::from_value(data).map_err(|error| {
            RequestError::new(
                RequestErrorKind::Decode,
                None,
                format!("failed to decode response from {path}: {error}"),
            )
        })
    }

    /// Untyped variant: parsed JSON, the raw text as a JSON string when the
    /// body is not JSON, or `{}` for an empty body.
    pub async fn request_value(
        &self,
        path: &str,
        options: RequestOptions,
    ) -> Result<Value, RequestError> {
        let request_id = format!("req_{}", Uuid::new_v4().simple());
        let mut request = HttpRequest::new(options.method, self.endpoint(path))
            .header(HEADER_REQUEST_ID, request_id.as_str());

        match options.body.filter(|body| !body.is_null()) {
            Some(body) => {
                let encoded = serde_json::to_string(&body).map_err(|error| {
                    RequestError::new(
                        RequestErrorKind::Encode,
                        None,
                        format!("failed to serialize request body: {error}"),
                    )
                })?;
                request = request.json_body(encoded);
            }
            None => request = request.header(HEADER_CONTENT_TYPE, CONTENT_TYPE_JSON),
        }

        // Read at call time so a logout between two calls is always observed.
        if let Some(token) = self.session.token() {
            request = request.bearer(&token);
        }

        let method = options.method;
        let response = self.transport.send(request).await.map_err(|error| {
            tracing::warn!(
                request_id = %request_id,
                method = %method,
                path,
                error = %error,
                "api request failed"
            );
            RequestError::new(RequestErrorKind::Network, None, error.to_string())
        })?;

        let data = parse_body(&response.body);
        if !response.is_success() {
            let message = derive_error_message(response.status, data.as_ref());
            tracing::debug!(
                request_id = %request_id,
                method = %method,
                path,
                status = response.status,
                "api request rejected"
            );
            return Err(RequestError::new(
                RequestErrorKind::Http,
                Some(response.status),
                message,
            ));
        }

        tracing::debug!(
            request_id = %request_id,
            method = %method,
            path,
            status = response.status,
            "api request succeeded"
        );
        Ok(data.unwrap_or_else(|| Value::Object(serde_json::Map::new())))
    }
}

/// `None` for an empty body; otherwise JSON, falling back to the raw text.
#[must_use]
pub fn parse_body(text: &str) -> Option<Value> {
    if text.is_empty() {
        return None;
    }
    Some(serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string())))
}

/// Collapses the backend's error shapes into one message, in priority order:
/// `error`, `message`, the raw text body, then `HTTP <status>`.
#[must_use]
pub fn derive_error_message(status: u16, data: Option<&Value>) -> String {
    let derived = match data {
        Some(Value::Object(fields)) => fields
            .get("error")
            .and_then(error_field_text)
            .or_else(|| fields.get("message").and_then(non_empty_str)),
        Some(Value::String(text)) => Some(text.as_str()).filter(|text| !text.is_empty()),
        _ => None,
    };
    derived.map_or_else(|| format!("HTTP {status}"), ToString::to_string)
}

fn non_empty_str(value: &Value) -> Option<&str> {
    value.as_str().filter(|text| !text.is_empty())
}

// `error` is usually a string, but some endpoints nest `{code, message}`.
fn error_field_text(value: &Value) -> Option<&str> {
    non_empty_str(value).or_else(|| value.get("message").and_then(non_empty_str))
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;
    use serde_json::json;

    use super::*;
    use crate::auth::User;
    use crate::session::SessionManager;
    use crate::storage::MemoryStore;
    use crate::transport::testing::ScriptedTransport;

    fn config() -> ConsoleClientConfig {
        ConsoleClientConfig::new("http://sitepod.test").expect("config")
    }

    fn setup(transport: &Arc<ScriptedTransport>) -> (SessionManager, RequestGateway) {
        let config = config();
        let session = SessionManager::restore(
            config.clone(),
            Arc::new(MemoryStore::new()),
            transport.clone(),
        );
        let gateway = RequestGateway::new(&config, session.reader(), transport.clone());
        (session, gateway)
    }

    fn member() -> User {
        User {
            id: "u_1".to_string(),
            email: "dev@sitepod.dev".to_string(),
            is_anonymous: false,
            is_admin: false,
        }
    }

    #[derive(Debug, Deserialize, PartialEq)]
    struct Health {
        status: String,
    }

    #[test]
    fn error_message_priority() {
        let cases = [
            (400, r#"{"error":"bad input"}"#, "bad input"),
            (403, r#"{"message":"nope"}"#, "nope"),
            (500, "plain failure", "plain failure"),
            (409, r#"{"error":"dup","message":"ignored"}"#, "dup"),
            (422, r#"{"error":"","message":"fallback to message"}"#, "fallback to message"),
            (502, r#"{"error":{"code":"upstream","message":"nested"}}"#, "nested"),
            (404, r#"{"detail":"unknown"}"#, "HTTP 404"),
            (500, "[1,2]", "HTTP 500"),
        ];
        for (status, body, expected) in cases {
            let data = parse_body(body);
            assert_eq!(
                derive_error_message(status, data.as_ref()),
                expected,
                "body {body}"
            );
        }

        let empty = derive_error_message(503, parse_body("").as_ref());
        assert!(empty.contains("503"), "{empty}");
    }

    #[test]
    fn text_error_bodies_are_surfaced_verbatim() {
        assert_eq!(
            derive_error_message(500, parse_body("plain failure\n").as_ref()),
            "plain failure\n"
        );
        assert_eq!(derive_error_message(500, parse_body("   ").as_ref()), "   ");
        assert_eq!(
            derive_error_message(400, parse_body(r#"{"error":" spaced "}"#).as_ref()),
            " spaced "
        );
    }

    #[test]
    fn parse_body_keeps_raw_text() {
        assert_eq!(parse_body(""), None);
        assert_eq!(parse_body(r#"{"a":1}"#), Some(json!({"a": 1})));
        assert_eq!(parse_body("oops"), Some(json!("oops")));
    }

    #[tokio::test]
    async fn request_sends_json_content_type_and_no_auth_when_signed_out() {
        let transport = Arc::new(ScriptedTransport::new().respond(200, r#"{"status":"ok"}"#));
        let (_session, gateway) = setup(&transport);

        let health: Health = gateway.get("/health").await.expect("health");
        assert_eq!(health.status, "ok");

        let request = &transport.requests()[0];
        assert_eq!(request.url, "http://sitepod.test/api/v1/health");
        assert_eq!(request.method, HttpMethod::Get);
        assert_eq!(request.header_value("content-type"), Some("application/json"));
        assert_eq!(request.header_value("authorization"), None);
        assert!(
            request
                .header_value("x-request-id")
                .is_some_and(|id| id.starts_with("req_"))
        );
        assert_eq!(request.body, None);
    }

    #[tokio::test]
    async fn token_is_read_fresh_on_every_call() {
        let transport = Arc::new(
            ScriptedTransport::new()
                .respond(200, "{}")
                .respond(200, "{}"),
        );
        let (session, gateway) = setup(&transport);
        session.set_token("tok_live", member()).expect("set token");

        let _: Value = gateway.get("/projects").await.expect("first call");
        session.logout();
        let _: Value = gateway.get("/projects").await.expect("second call");

        let requests = transport.requests();
        assert_eq!(
            requests[0].header_value("authorization"),
            Some("Bearer tok_live")
        );
        assert_eq!(requests[1].header_value("authorization"), None);
    }

    #[tokio::test]
    async fn post_serializes_body() {
        let transport = Arc::new(ScriptedTransport::new().respond(201, r#"{"id":"rel_1"}"#));
        let (_session, gateway) = setup(&transport);

        let created: Value = gateway
            .post(
                "/release",
                &json!({"project_id": "p_1", "image_id": "img_1", "environment": "prod"}),
            )
            .await
            .expect("release");
        assert_eq!(created, json!({"id": "rel_1"}));

        let request = &transport.requests()[0];
        assert_eq!(request.method, HttpMethod::Post);
        let sent: Value =
            serde_json::from_str(request.body.as_deref().expect("body")).expect("json");
        assert_eq!(sent["environment"], "prod");
    }

    #[tokio::test]
    async fn null_body_is_not_sent() {
        let transport = Arc::new(ScriptedTransport::new().respond(200, "{}"));
        let (_session, gateway) = setup(&transport);

        let options = RequestOptions::method(HttpMethod::Put)
            .with_body(&Value::Null)
            .expect("options");
        let _: Value = gateway.request("/noop", options).await.expect("put");
        assert_eq!(transport.requests()[0].body, None);
    }

    #[tokio::test]
    async fn empty_success_body_becomes_empty_object() {
        let transport = Arc::new(ScriptedTransport::new().respond(204, ""));
        let (_session, gateway) = setup(&transport);

        let value: Value = gateway.delete("/domains/example.com").await.expect("delete");
        assert_eq!(value, json!({}));
        assert_eq!(transport.requests()[0].method, HttpMethod::Delete);
    }

    #[tokio::test]
    async fn plain_text_success_body_is_returned_as_string() {
        let transport = Arc::new(ScriptedTransport::new().respond(200, "pong"));
        let (_session, gateway) = setup(&transport);

        let value: String = gateway.get("/ping").await.expect("ping");
        assert_eq!(value, "pong");
    }

    #[tokio::test]
    async fn non_2xx_is_normalized() {
        let transport = Arc::new(
            ScriptedTransport::new()
                .respond(400, r#"{"error":"bad input"}"#)
                .respond(403, r#"{"message":"nope"}"#)
                .respond(500, "plain failure")
                .respond(503, ""),
        );
        let (_session, gateway) = setup(&transport);

        let mut messages = Vec::new();
        for _ in 0..4 {
            let error = gateway
                .get::<Value>("/projects")
                .await
                .expect_err("should fail");
            assert_eq!(error.kind, RequestErrorKind::Http);
            messages.push((error.status, error.to_string()));
        }
        assert_eq!(messages[0], (Some(400), "bad input".to_string()));
        assert_eq!(messages[1], (Some(403), "nope".to_string()));
        assert_eq!(messages[2], (Some(500), "plain failure".to_string()));
        assert_eq!(messages[3].0, Some(503));
        assert!(messages[3].1.contains("503"));
    }

    #[tokio::test]
    async fn unauthorized_does_not_touch_the_session() {
        let transport =
            Arc::new(ScriptedTransport::new().respond(401, r#"{"error":"token expired"}"#));
        let (session, gateway) = setup(&transport);
        session.set_token("tok_old", member()).expect("set token");

        let error = gateway
            .get::<Value>("/projects")
            .await
            .expect_err("unauthorized");
        assert!(error.is_unauthorized());
        assert!(session.is_authenticated());
        assert_eq!(session.token().as_deref(), Some("tok_old"));
    }

    #[tokio::test]
    async fn network_and_decode_failures_have_their_own_kind() {
        let transport = Arc::new(
            ScriptedTransport::new()
                .fail("connection reset")
                .respond(200, r#"{"unexpected":true}"#),
        );
        let (_session, gateway) = setup(&transport);

        let network = gateway.get::<Health>("/health").await.expect_err("network");
        assert_eq!(network.kind, RequestErrorKind::Network);
        assert_eq!(network.status, None);
        assert!(network.to_string().contains("connection reset"));

        let decode = gateway.get::<Health>("/health").await.expect_err("decode");
        assert_eq!(decode.kind, RequestErrorKind::Decode);
    }
}
