//! In-process fake upstream used by unit tests.

use std::collections::HashMap;

use axum::Router;
use axum::extract::Query;
use axum::http::header::{AUTHORIZATION, CONTENT_TYPE};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use serde_json::Value;
use url::Url;

/// `Authorization` header value for guest/guest.
pub const GUEST_AUTH: &str = "Basic Z3Vlc3Q6Z3Vlc3Q=";

#[derive(Debug, Clone)]
enum Reply {
    Json(Value),
    Raw(&'static str),
    Bytes(Vec<u8>),
    Status(StatusCode),
    EchoQuery,
}

/// Canned responses keyed by path.
#[derive(Debug, Clone, Default)]
pub struct FakeUpstream {
    routes: Vec<(String, Reply)>,
    auth: Option<String>,
}

impl FakeUpstream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn json(mut self, path: &str, body: Value) -> Self {
        self.routes.push((path.to_string(), Reply::Json(body)));
        self
    }

    pub fn raw(mut self, path: &str, body: &'static str) -> Self {
        self.routes.push((path.to_string(), Reply::Raw(body)));
        self
    }

    pub fn bytes(mut self, path: &str, body: Vec<u8>) -> Self {
        self.routes.push((path.to_string(), Reply::Bytes(body)));
        self
    }

    pub fn status(mut self, path: &str, status: StatusCode) -> Self {
        self.routes.push((path.to_string(), Reply::Status(status)));
        self
    }

    /// Respond with the received query parameters as a JSON object.
    pub fn echo_query(mut self, path: &str) -> Self {
        self.routes.push((path.to_string(), Reply::EchoQuery));
        self
    }

    /// Reject requests whose `Authorization` header differs from `header`.
    pub fn require_auth(mut self, header: &str) -> Self {
        self.auth = Some(header.to_string());
        self
    }

    pub fn router(self) -> Router {
        let mut router = Router::new();
        for (path, reply) in self.routes {
            let auth = self.auth.clone();
            let handler = move |headers: HeaderMap, Query(params): Query<HashMap<String, String>>| {
                let reply = reply.clone();
                let auth = auth.clone();
                async move { respond(reply, auth, headers, params).await }
            };
            router = router.route(&path, get(handler));
        }
        router
    }

    /// Serve on an ephemeral local port and return the base URL.
    pub async fn start(self) -> Url {
        serve(self.router()).await
    }
}

async fn respond(
    reply: Reply,
    auth: Option<String>,
    headers: HeaderMap,
    params: HashMap<String, String>,
) -> Response {
    if let Some(expected) = auth {
        let sent = headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok());
        if sent != Some(expected.as_str()) {
            return StatusCode::UNAUTHORIZED.into_response();
        }
    }

    match reply {
        Reply::Json(body) => Json(body).into_response(),
        Reply::Raw(body) => ([(CONTENT_TYPE, "application/json")], body).into_response(),
        Reply::Bytes(body) => ([(CONTENT_TYPE, "application/bert")], body).into_response(),
        Reply::Status(status) => status.into_response(),
        Reply::EchoQuery => Json(serde_json::json!(params)).into_response(),
    }
}

pub async fn serve(router: Router) -> Url {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    Url::parse(&format!("http://{}", addr)).unwrap()
}
