/*
 * Copyright (c) 2026 Mohamad Al-Zawahreh (dba Sovereign Systems).
 *
 * HTTP Serving Lifecycle.
 *
 * Listening happens in two phases. While the guest entry point runs,
 * `http_listen` only records a pending token in the `HttpRegistry`. Once
 * the entry point has returned and the guest stack is empty, the runner
 * hands the store, the instance and the token to a `Dispatcher` and the
 * listener starts. Every request then calls into the guest from a clean
 * frame, one at a time, behind a single lock.
 *
 * LICENSE: DUAL-LICENSED (AGPLv3 or COMMERCIAL).
 */

use crate::bridge::{BridgeError, ValueBridge};
use crate::gc;
use crate::host::HostState;
use crate::router::{RouteMatch, RouteTable, SharedRoutes};
use crate::store::StoreError;
use crate::value::{Object, Value};
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{header, HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Redirect, Response};
use axum::Router;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread::JoinHandle;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{error, info, warn};
use wasmtime::{AsContextMut, Instance, RootScope, Store};

pub const TEXT: &str = "text/plain; charset=utf-8";
pub const HTML: &str = "text/html; charset=utf-8";
pub const JSON: &str = "application/json";
/// `contentType` sentinel that turns a response into a redirect.
pub const REDIRECT: &str = "redirect";

const FORM: &str = "application/x-www-form-urlencoded";

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("unknown server id {0}")]
    UnknownServer(i32),
    #[error("listen was already requested in this execution")]
    AlreadyListening,
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("listener runtime: {0}")]
    Runtime(#[from] std::io::Error),
    #[error("listener thread panicked")]
    Panicked,
}

// =============================================================================
// Phase 1: Registration (inside guest execution)
// =============================================================================

/// Recorded intent to listen; consumed once after the entry point returns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingListen {
    pub server: usize,
    pub address: String,
}

#[derive(Debug, Default)]
pub struct HttpRegistry {
    servers: Vec<SharedRoutes>,
    pending: Option<PendingListen>,
}

impl HttpRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_server(&mut self) -> i32 {
        self.servers.push(RouteTable::shared());
        (self.servers.len() - 1) as i32
    }

    fn server(&self, id: i32) -> Result<&SharedRoutes, ServerError> {
        usize::try_from(id)
            .ok()
            .and_then(|i| self.servers.get(i))
            .ok_or(ServerError::UnknownServer(id))
    }

    pub fn add_route(
        &mut self,
        server: i32,
        method: &str,
        pattern: &str,
        handler: &str,
    ) -> Result<(), ServerError> {
        self.server(server)?.write().add(method, pattern, handler);
        Ok(())
    }

    /// Records the pending token. Never binds.
    pub fn listen(&mut self, server: i32, address: &str) -> Result<(), ServerError> {
        self.server(server)?;
        if self.pending.is_some() {
            return Err(ServerError::AlreadyListening);
        }
        self.pending = Some(PendingListen {
            server: server as usize,
            address: normalize_address(address),
        });
        Ok(())
    }

    pub fn pending(&self) -> Option<&PendingListen> {
        self.pending.as_ref()
    }

    /// Consumes the token together with the routes it refers to.
    pub fn take_pending(&mut self) -> Option<(PendingListen, SharedRoutes)> {
        let pending = self.pending.take()?;
        let routes = self.servers.get(pending.server)?.clone();
        Some((pending, routes))
    }
}

/// `8080` and `:8080` listen on every interface; anything else is used
/// as given.
pub fn normalize_address(address: &str) -> String {
    let address = address.trim();
    if !address.is_empty() && address.bytes().all(|b| b.is_ascii_digit()) {
        format!("0.0.0.0:{}", address)
    } else if let Some(port) = address.strip_prefix(':') {
        format!("0.0.0.0:{}", port)
    } else {
        address.to_string()
    }
}

// =============================================================================
// Responses
// =============================================================================

pub fn response_value(body: String, content_type: &str) -> Value {
    let mut obj = Object::new();
    obj.insert("body", Value::String(body));
    obj.insert("contentType", Value::from(content_type));
    Value::Object(obj)
}

pub fn redirect_value(url: String) -> Value {
    let mut obj = Object::new();
    obj.insert("body", Value::from(""));
    obj.insert("contentType", Value::from(REDIRECT));
    obj.insert("redirectUrl", Value::String(url));
    Value::Object(obj)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HttpReply {
    Body { body: String, content_type: String },
    Redirect { url: String },
}

/// Why a request became a 500. Only ever logged.
#[derive(Error, Debug)]
pub enum HandlerFailure {
    #[error("handler export `{name}` unavailable: {message}")]
    Export { name: String, message: String },
    #[error("handler trapped: {0}")]
    Trap(String),
    #[error("handler returned an error value: {0}")]
    GuestError(String),
    #[error("malformed response: {0}")]
    Malformed(String),
    #[error("bridge: {0}")]
    Bridge(#[from] BridgeError),
    #[error("transaction: {0}")]
    Transaction(#[from] StoreError),
}

/// Reads a handler result as a response.
pub fn interpret(result: &Value) -> Result<HttpReply, HandlerFailure> {
    if result.is_error() {
        let message = result
            .as_object()
            .and_then(|o| o.get("message"))
            .map(Value::to_display_string)
            .unwrap_or_default();
        return Err(HandlerFailure::GuestError(message));
    }
    let obj = result
        .as_object()
        .ok_or_else(|| HandlerFailure::Malformed(format!("expected object, got {}", result.kind())))?;
    let field = |name: &str| -> Result<String, HandlerFailure> {
        match obj.get(name) {
            Some(Value::String(s)) => Ok(s.clone()),
            Some(other) => Err(HandlerFailure::Malformed(format!(
                "{} must be a string, got {}",
                name,
                other.kind()
            ))),
            None => Err(HandlerFailure::Malformed(format!("missing {}", name))),
        }
    };
    let content_type = field("contentType")?;
    if content_type == REDIRECT {
        return Ok(HttpReply::Redirect {
            url: field("redirectUrl")?,
        });
    }
    Ok(HttpReply::Body {
        body: field("body")?,
        content_type,
    })
}

// =============================================================================
// Requests
// =============================================================================

/// Transport-independent view of an inbound request.
#[derive(Debug, Clone, Default)]
pub struct RequestParts {
    pub method: String,
    pub path: String,
    pub query: Option<String>,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

fn form_object(encoded: &[u8]) -> Object {
    url::form_urlencoded::parse(encoded)
        .map(|(k, v)| (k.into_owned(), Value::String(v.into_owned())))
        .collect()
}

/// `{path, method, query, form}`. Path parameters overwrite colliding
/// query keys; only urlencoded bodies populate `form`.
pub fn build_request(route: &RouteMatch, req: &RequestParts) -> Value {
    let mut query = req
        .query
        .as_deref()
        .map(|q| form_object(q.as_bytes()))
        .unwrap_or_default();
    for (name, value) in &route.params {
        query.insert(name.clone(), Value::String(value.clone()));
    }
    let is_form = req
        .content_type
        .as_deref()
        .is_some_and(|ct| ct.trim_start().starts_with(FORM));
    let form = if is_form {
        form_object(&req.body)
    } else {
        Object::new()
    };
    let mut obj = Object::new();
    obj.insert("path", Value::from(req.path.as_str()));
    obj.insert("method", Value::from(req.method.as_str()));
    obj.insert("query", Value::Object(query));
    obj.insert("form", Value::Object(form));
    Value::Object(obj)
}

// =============================================================================
// Phase 2: Dispatch (after guest execution)
// =============================================================================

/// The guest instance and its store, reentered once per request.
pub struct GuestSession<B: ValueBridge> {
    pub store: Store<HostState<B>>,
    pub instance: Instance,
}

impl<B: ValueBridge> GuestSession<B> {
    fn call_handler(&mut self, name: &str, request: &Value) -> Result<Value, HandlerFailure> {
        let func = self
            .instance
            .get_typed_func::<B::Guest, B::Guest>(&mut self.store, name)
            .map_err(|e| HandlerFailure::Export {
                name: name.to_string(),
                message: e.to_string(),
            })?;
        let mut scope = RootScope::new(&mut self.store);
        let arg = B::to_guest(&mut scope.as_context_mut(), request)?;
        let out = func
            .call(&mut scope, arg)
            .map_err(|e| HandlerFailure::Trap(format!("{:#}", e)))?;
        Ok(B::to_host(&mut scope.as_context_mut(), out)?)
    }

    /// One request inside one transaction. Any failure rolls back.
    pub fn invoke(&mut self, route: &RouteMatch, req: &RequestParts) -> Result<HttpReply, HandlerFailure> {
        self.store.data().db.begin()?;
        let request = build_request(route, req);
        let reply = self
            .call_handler(&route.handler, &request)
            .and_then(|result| interpret(&result))
            .and_then(|reply| {
                self.store.data().db.commit()?;
                Ok(reply)
            });
        match reply {
            Ok(reply) => {
                gc::after_request(&mut self.store);
                Ok(reply)
            }
            Err(failure) => {
                if let Err(e) = self.store.data().db.rollback() {
                    warn!(error = %e, "rollback failed");
                }
                Err(failure)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HttpOutcome {
    Reply(HttpReply),
    NotFound,
    Failed,
}

pub struct Dispatcher<B: ValueBridge> {
    session: Mutex<GuestSession<B>>,
    routes: SharedRoutes,
}

impl<B: ValueBridge> Dispatcher<B> {
    pub fn new(session: GuestSession<B>, routes: SharedRoutes) -> Self {
        Dispatcher {
            session: Mutex::new(session),
            routes,
        }
    }

    pub fn routes(&self) -> &SharedRoutes {
        &self.routes
    }

    /// Runs on a blocking thread. Requests queue on the session lock.
    pub fn handle(&self, req: &RequestParts) -> HttpOutcome {
        let found = self.routes.read().resolve(&req.method, &req.path);
        let Some(route) = found else {
            return HttpOutcome::NotFound;
        };
        let mut session = self.session.lock();
        match session.invoke(&route, req) {
            Ok(reply) => HttpOutcome::Reply(reply),
            Err(failure) => {
                error!(
                    handler = %route.handler,
                    method = %req.method,
                    path = %req.path,
                    "{}",
                    failure
                );
                HttpOutcome::Failed
            }
        }
    }
}

fn into_response(outcome: HttpOutcome) -> Response {
    match outcome {
        HttpOutcome::Reply(HttpReply::Body { body, content_type }) => {
            ([(header::CONTENT_TYPE, content_type)], body).into_response()
        }
        HttpOutcome::Reply(HttpReply::Redirect { url }) => Redirect::to(&url).into_response(),
        HttpOutcome::NotFound => (StatusCode::NOT_FOUND, "Not Found").into_response(),
        HttpOutcome::Failed => {
            (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error").into_response()
        }
    }
}

async fn dispatch<B: ValueBridge>(
    State(dispatcher): State<Arc<Dispatcher<B>>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let parts = RequestParts {
        method: method.as_str().to_string(),
        path: uri.path().to_string(),
        query: uri.query().map(str::to_string),
        content_type: headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
        body: body.to_vec(),
    };
    match tokio::task::spawn_blocking(move || dispatcher.handle(&parts)).await {
        Ok(outcome) => into_response(outcome),
        Err(e) => {
            error!(error = %e, "request task failed");
            into_response(HttpOutcome::Failed)
        }
    }
}

// =============================================================================
// Listener
// =============================================================================

/// A dispatcher bound to the address from the pending token.
pub struct Server<B: ValueBridge> {
    dispatcher: Arc<Dispatcher<B>>,
    address: String,
}

impl<B: ValueBridge> Server<B> {
    pub fn new(dispatcher: Dispatcher<B>, address: String) -> Self {
        Server {
            dispatcher: Arc::new(dispatcher),
            address,
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher<B>> {
        &self.dispatcher
    }

    /// Binds synchronously and serves on a background runtime.
    pub fn spawn(self) -> Result<ServerHandle, ServerError> {
        let listener = std::net::TcpListener::bind(&self.address).map_err(|source| {
            ServerError::Bind {
                addr: self.address.clone(),
                source,
            }
        })?;
        listener.set_nonblocking(true)?;
        let addr = listener.local_addr()?;
        for (method, pattern, handler) in self.dispatcher.routes().read().routes() {
            info!(%method, %pattern, %handler, "route");
        }
        info!(%addr, "listening");

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()?;
        let (tx, rx) = oneshot::channel::<()>();
        let app = Router::new()
            .fallback(dispatch::<B>)
            .with_state(self.dispatcher);
        let thread = std::thread::Builder::new()
            .name("sable-http".to_string())
            .spawn(move || -> Result<(), ServerError> {
                runtime.block_on(async move {
                    let listener = tokio::net::TcpListener::from_std(listener)?;
                    axum::serve(listener, app)
                        .with_graceful_shutdown(async {
                            let _ = rx.await;
                        })
                        .await?;
                    Ok::<(), ServerError>(())
                })
            })?;
        Ok(ServerHandle {
            addr,
            shutdown: Some(tx),
            thread: Some(thread),
        })
    }

    /// Serves until the process exits.
    pub fn serve_forever(self) -> Result<(), ServerError> {
        self.spawn()?.wait()
    }
}

pub struct ServerHandle {
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    thread: Option<JoinHandle<Result<(), ServerError>>>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stops accepting, lets in-flight requests finish, and joins.
    pub fn shutdown(mut self) -> Result<(), ServerError> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        self.join()
    }

    pub fn wait(mut self) -> Result<(), ServerError> {
        self.join()
    }

    fn join(&mut self) -> Result<(), ServerError> {
        match self.thread.take() {
            Some(thread) => thread.join().map_err(|_| ServerError::Panicked)?,
            None => Ok(()),
        }
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn route(handler: &str, params: &[(&str, &str)]) -> RouteMatch {
        RouteMatch {
            handler: handler.to_string(),
            pattern: String::new(),
            params: params
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    #[test]
    fn test_second_listen_rejected() {
        let mut reg = HttpRegistry::new();
        let id = reg.create_server();
        reg.listen(id, "8080").unwrap();
        assert!(matches!(reg.listen(id, "9090"), Err(ServerError::AlreadyListening)));
        assert_eq!(reg.pending().unwrap().address, "0.0.0.0:8080");
    }

    #[test]
    fn test_unknown_server_rejected() {
        let mut reg = HttpRegistry::new();
        assert!(matches!(
            reg.add_route(3, "GET", "/", "h"),
            Err(ServerError::UnknownServer(3))
        ));
        assert!(reg.listen(-1, ":80").is_err());
    }

    #[test]
    fn test_take_pending_consumes_token_and_keeps_later_routes() {
        let mut reg = HttpRegistry::new();
        let id = reg.create_server();
        reg.add_route(id, "GET", "/a", "a").unwrap();
        reg.listen(id, "127.0.0.1:0").unwrap();
        reg.add_route(id, "GET", "/b", "b").unwrap();
        let (pending, routes) = reg.take_pending().expect("token");
        assert_eq!(pending.address, "127.0.0.1:0");
        assert_eq!(routes.read().len(), 2);
        assert!(reg.take_pending().is_none(), "consumed exactly once");
    }

    #[test]
    fn test_normalize_address() {
        assert_eq!(normalize_address("3000"), "0.0.0.0:3000");
        assert_eq!(normalize_address(":3000"), "0.0.0.0:3000");
        assert_eq!(normalize_address("localhost:1"), "localhost:1");
    }

    #[test]
    fn test_interpret_body_and_redirect() {
        let reply = interpret(&response_value("hi".into(), TEXT)).unwrap();
        assert_eq!(
            reply,
            HttpReply::Body {
                body: "hi".into(),
                content_type: TEXT.into()
            }
        );
        let reply = interpret(&redirect_value("/next".into())).unwrap();
        assert_eq!(reply, HttpReply::Redirect { url: "/next".into() });
    }

    #[test]
    fn test_interpret_rejects_bad_shapes() {
        assert!(matches!(
            interpret(&Value::Integer(1)),
            Err(HandlerFailure::Malformed(_))
        ));
        assert!(matches!(
            interpret(&Value::error("db down", None)),
            Err(HandlerFailure::GuestError(m)) if m == "db down"
        ));
        let mut missing_body = Object::new();
        missing_body.insert("contentType", Value::from(HTML));
        assert!(interpret(&Value::Object(missing_body)).is_err());
        let mut no_url = Object::new();
        no_url.insert("body", Value::from(""));
        no_url.insert("contentType", Value::from(REDIRECT));
        assert!(interpret(&Value::Object(no_url)).is_err());
    }

    #[test]
    fn test_build_request_merges_params_over_query() {
        let req = RequestParts {
            method: "POST".into(),
            path: "/items/abc".into(),
            query: Some("id=zzz&q=a+b".into()),
            content_type: Some("application/x-www-form-urlencoded; charset=utf-8".into()),
            body: b"name=sable&n=%31".to_vec(),
        };
        let v = build_request(&route("item", &[("id", "abc")]), &req);
        insta::assert_snapshot!(
            crate::json::stringify(&v).unwrap(),
            @r#"{"path":"/items/abc","method":"POST","query":{"id":"abc","q":"a b"},"form":{"name":"sable","n":"1"}}"#
        );
    }

    #[test]
    fn test_non_form_body_leaves_form_empty() {
        let req = RequestParts {
            method: "POST".into(),
            path: "/".into(),
            content_type: Some(JSON.into()),
            body: br#"{"a":1}"#.to_vec(),
            ..Default::default()
        };
        let v = build_request(&route("h", &[]), &req);
        let form = v.as_object().unwrap().get("form").unwrap();
        assert!(form.as_object().unwrap().is_empty());
    }
}
