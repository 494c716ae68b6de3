//! Internal HTTP server.
//!
//! A loopback axum server shared by every feature that needs an HTTP
//! surface (the `http-input` executor above all). Routes register and
//! deregister dynamically; the server starts on the first registration
//! and shuts down when the route refcount reaches zero. Duplicate
//! `(method, path)` registration is an error. When a secret key is
//! configured, [`InternalHttpServer::require_auth`] wraps handlers with a
//! bearer-token check.

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use futures::future::BoxFuture;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::Mutex;

use skein_core::config::InternalHttpSettings;

use crate::error::{Result, ServerError};

/// Minimal request view handed to route handlers.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: String,
    pub path: String,
    pub headers: HashMap<String, String>,
    pub body: Bytes,
}

impl HttpRequest {
    pub fn json(&self) -> Option<Value> {
        serde_json::from_slice(&self.body).ok()
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }
}

/// Handler response: a status code and JSON body.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Value,
}

impl HttpResponse {
    pub fn ok(body: Value) -> Self {
        Self { status: 200, body }
    }

    pub fn error(status: u16, code: &str) -> Self {
        Self {
            status,
            body: json!({"error": code}),
        }
    }
}

pub type RouteHandler = Arc<dyn Fn(HttpRequest) -> BoxFuture<'static, HttpResponse> + Send + Sync>;

/// Token returned by route registration, used to deregister.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteHandle {
    pub method: String,
    pub path: String,
}

type RouteMap = HashMap<(String, String), RouteHandler>;

struct ServerState {
    task: Option<tokio::task::JoinHandle<()>>,
    bound_addr: Option<SocketAddr>,
    usage_count: usize,
}

pub struct InternalHttpServer {
    config: InternalHttpSettings,
    routes: Arc<Mutex<RouteMap>>,
    state: Mutex<ServerState>,
}

impl InternalHttpServer {
    pub fn new(config: InternalHttpSettings) -> Arc<Self> {
        Arc::new(Self {
            config,
            routes: Arc::new(Mutex::new(HashMap::new())),
            state: Mutex::new(ServerState {
                task: None,
                bound_addr: None,
                usage_count: 0,
            }),
        })
    }

    pub fn config(&self) -> &InternalHttpSettings {
        &self.config
    }

    /// Address the server is bound to, once running.
    pub async fn bound_addr(&self) -> Option<SocketAddr> {
        self.state.lock().await.bound_addr
    }

    pub async fn is_running(&self) -> bool {
        self.state.lock().await.task.is_some()
    }

    async fn ensure_started(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.task.is_some() {
            return Ok(());
        }
        let port = self
            .config
            .port
            .ok_or_else(|| ServerError::Http("internal HTTP server port is not configured".into()))?;

        let listener = tokio::net::TcpListener::bind((self.config.host.as_str(), port))
            .await
            .map_err(|e| ServerError::Http(format!("bind failed: {e}")))?;
        state.bound_addr = listener.local_addr().ok();

        let routes = self.routes.clone();
        let app = axum::Router::new()
            .fallback(dispatch)
            .with_state(routes);
        state.task = Some(tokio::spawn(async move {
            if let Err(error) = axum::serve(listener, app).await {
                tracing::error!(%error, "internal http server stopped");
            }
        }));
        tracing::debug!(addr = ?state.bound_addr, "internal http server started");
        Ok(())
    }

    async fn shutdown_if_idle(&self) {
        let mut state = self.state.lock().await;
        if state.usage_count != 0 {
            return;
        }
        if let Some(task) = state.task.take() {
            task.abort();
        }
        state.bound_addr = None;
    }

    /// Register a route, starting the server on first use.
    pub async fn register_route(
        &self,
        method: &str,
        path: &str,
        handler: RouteHandler,
    ) -> Result<RouteHandle> {
        let key = (method.to_ascii_uppercase(), path.to_string());
        {
            let mut routes = self.routes.lock().await;
            if routes.contains_key(&key) {
                return Err(ServerError::Http(format!(
                    "route already registered: {} {}",
                    key.0, key.1
                )));
            }
            self.ensure_started().await?;
            routes.insert(key.clone(), handler);
        }
        self.state.lock().await.usage_count += 1;
        Ok(RouteHandle {
            method: key.0,
            path: key.1,
        })
    }

    /// Remove a route; the server stops once nothing is registered.
    pub async fn deregister_route(&self, handle: &RouteHandle) -> Result<()> {
        let key = (handle.method.to_ascii_uppercase(), handle.path.clone());
        {
            let mut routes = self.routes.lock().await;
            if routes.remove(&key).is_none() {
                return Err(ServerError::Http(format!(
                    "route not registered: {} {}",
                    key.0, key.1
                )));
            }
        }
        {
            let mut state = self.state.lock().await;
            state.usage_count = state.usage_count.saturating_sub(1);
        }
        self.shutdown_if_idle().await;
        Ok(())
    }

    /// Wrap a handler with bearer-token auth against the configured secret.
    /// Without a secret the handler passes through unchanged.
    pub fn require_auth(self: &Arc<Self>, handler: RouteHandler) -> RouteHandler {
        let server = self.clone();
        Arc::new(move |request: HttpRequest| {
            let server = server.clone();
            let handler = handler.clone();
            Box::pin(async move {
                if let Some(secret) = &server.config.secret_key {
                    let expected = format!("Bearer {secret}");
                    if request.header("authorization") != Some(expected.as_str()) {
                        return HttpResponse::error(401, "unauthorized");
                    }
                }
                handler(request).await
            })
        })
    }
}

async fn dispatch(
    State(routes): State<Arc<Mutex<RouteMap>>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let key = (method.to_string().to_ascii_uppercase(), uri.path().to_string());
    let handler = { routes.lock().await.get(&key).cloned() };
    let Some(handler) = handler else {
        return (StatusCode::NOT_FOUND, "Not Found").into_response();
    };

    let mut header_map = HashMap::new();
    for (name, value) in headers.iter() {
        if let Ok(value) = value.to_str() {
            header_map.insert(name.as_str().to_ascii_lowercase(), value.to_string());
        }
    }
    let request = HttpRequest {
        method: key.0,
        path: key.1,
        headers: header_map,
        body,
    };

    let response = handler(request).await;
    let status = StatusCode::from_u16(response.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, axum::Json(response.body)).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn echo_handler() -> RouteHandler {
        Arc::new(|request: HttpRequest| {
            Box::pin(async move {
                let body = request.json().unwrap_or(Value::Null);
                HttpResponse::ok(json!({"echo": body}))
            })
        })
    }

    fn test_server(secret: Option<&str>) -> Arc<InternalHttpServer> {
        InternalHttpServer::new(InternalHttpSettings {
            host: "127.0.0.1".into(),
            port: Some(0),
            secret_key: secret.map(str::to_string),
        })
    }

    #[tokio::test]
    async fn duplicate_registration_is_an_error() {
        let server = test_server(None);
        let handle = server
            .register_route("POST", "/input", echo_handler())
            .await
            .unwrap();
        let err = server
            .register_route("post", "/input", echo_handler())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("already registered"));
        server.deregister_route(&handle).await.unwrap();
    }

    #[tokio::test]
    async fn refcount_shuts_down_when_empty() {
        let server = test_server(None);
        let h1 = server
            .register_route("POST", "/a", echo_handler())
            .await
            .unwrap();
        let h2 = server
            .register_route("POST", "/b", echo_handler())
            .await
            .unwrap();
        assert!(server.is_running().await);
        server.deregister_route(&h1).await.unwrap();
        assert!(server.is_running().await);
        server.deregister_route(&h2).await.unwrap();
        assert!(!server.is_running().await);

        let err = server.deregister_route(&h2).await.unwrap_err();
        assert!(err.to_string().contains("not registered"));
    }

    #[tokio::test]
    async fn serves_registered_routes_over_tcp() {
        let server = test_server(None);
        let handle = server
            .register_route("POST", "/input", echo_handler())
            .await
            .unwrap();
        let addr = server.bound_addr().await.unwrap();

        let client = reqwest::Client::new();
        let resp = client
            .post(format!("http://{addr}/input"))
            .json(&json!({"text": "hi"}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["echo"]["text"], "hi");

        let resp = client
            .post(format!("http://{addr}/missing"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 404);

        server.deregister_route(&handle).await.unwrap();
    }

    #[tokio::test]
    async fn bearer_auth_guards_routes() {
        let server = test_server(Some("s3cret"));
        let handler = server.require_auth(echo_handler());
        let handle = server
            .register_route("POST", "/input", handler)
            .await
            .unwrap();
        let addr = server.bound_addr().await.unwrap();
        let client = reqwest::Client::new();

        let resp = client
            .post(format!("http://{addr}/input"))
            .json(&json!({"text": "x"}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 401);

        let resp = client
            .post(format!("http://{addr}/input"))
            .header("Authorization", "Bearer s3cret")
            .json(&json!({"text": "x"}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);

        server.deregister_route(&handle).await.unwrap();
    }
}
