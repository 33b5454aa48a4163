//! HTTP API for provisioning and listing inbounds

use crate::error::{json_error_response, ApiErrorCode};
use crate::provision::Provisioner;
use crate::restart::RestartCoordinator;
use http_body_util::{BodyExt, Full, Limited};
use hyper::body::{Bytes, Incoming};
use hyper::header::{AUTHORIZATION, CONTENT_TYPE, HOST};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

/// Largest request body accepted
const MAX_BODY_BYTES: usize = 64 * 1024;

/// Response envelope shared by every `/api` route
#[derive(Debug, Serialize)]
pub struct Msg<T: Serialize> {
    pub success: bool,
    pub msg: String,
    pub obj: Option<T>,
}

impl<T: Serialize> Msg<T> {
    pub fn ok(msg: impl Into<String>, obj: Option<T>) -> Self {
        Self {
            success: true,
            msg: msg.into(),
            obj,
        }
    }
}

/// Body of `POST /api/add_user`
#[derive(Debug, Deserialize, PartialEq, Eq)]
pub struct AddUserRequest {
    pub remark: String,
    /// Quota in GiB, 0 for unlimited
    #[serde(default)]
    pub total: u64,
}

impl AddUserRequest {
    /// Parse a JSON or `application/x-www-form-urlencoded` body
    pub fn parse(content_type: &str, body: &[u8]) -> Result<Self, String> {
        if content_type.starts_with("application/x-www-form-urlencoded") {
            return Self::parse_form(body);
        }
        serde_json::from_slice(body).map_err(|e| format!("invalid JSON body: {}", e))
    }

    fn parse_form(body: &[u8]) -> Result<Self, String> {
        let body = std::str::from_utf8(body).map_err(|_| "form body is not UTF-8".to_string())?;
        let mut remark = None;
        let mut total: u64 = 0;

        for pair in body.split('&').filter(|p| !p.is_empty()) {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            let value = value.replace('+', " ");
            let value = urlencoding::decode(&value)
                .map_err(|_| format!("invalid percent-encoding in '{}'", key))?;
            match key {
                "remark" => remark = Some(value.into_owned()),
                "total" => {
                    total = value
                        .trim()
                        .parse()
                        .map_err(|_| format!("invalid total '{}'", value))?
                }
                _ => {}
            }
        }

        Ok(Self {
            remark: remark.ok_or_else(|| "missing field 'remark'".to_string())?,
            total,
        })
    }
}

/// Shared state for request handlers
pub struct ApiState {
    pub provisioner: Provisioner,
    pub coordinator: Arc<RestartCoordinator>,
    pub auth_token: String,
}

pub struct ApiServer {
    bind_addr: SocketAddr,
    state: Arc<ApiState>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ApiServer {
    pub fn new(
        bind_addr: SocketAddr,
        state: Arc<ApiState>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            bind_addr,
            state,
            shutdown_rx,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.serve(listener).await
    }

    /// Accept connections on an already bound listener until shutdown
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        let addr = listener.local_addr()?;
        info!(%addr, "API server listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let state = Arc::clone(&self.state);
                            tokio::spawn(async move {
                                if let Err(e) = serve_connection(stream, state).await {
                                    debug!(addr = %addr, error = %e, "API connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept API connection");
                        }
                    }
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("API server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn serve_connection(
    stream: tokio::net::TcpStream,
    state: Arc<ApiState>,
) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);
    let service = service_fn(move |req| {
        let state = Arc::clone(&state);
        async move { handle_request(req, state).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("API connection error: {}", e))?;

    Ok(())
}

fn json_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum and static header")
}

fn text_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum")
}

fn msg_response<T: Serialize>(msg: Msg<T>) -> Response<Full<Bytes>> {
    match serde_json::to_string(&msg) {
        Ok(body) => json_response(StatusCode::OK, body),
        Err(e) => json_error_response(ApiErrorCode::InternalError, e.to_string()),
    }
}

fn check_auth(req: &Request<Incoming>, expected_token: &str) -> bool {
    req.headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|auth| auth.strip_prefix("Bearer "))
        .map(|token| token == expected_token)
        .unwrap_or(false)
}

/// Host the client used to reach the panel
fn request_host(req: &Request<Incoming>) -> String {
    req.headers()
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned)
        .or_else(|| req.uri().authority().map(|a| a.to_string()))
        .unwrap_or_default()
}

async fn handle_request(
    req: Request<Incoming>,
    state: Arc<ApiState>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    debug!(%method, %path, "API request");

    let response = match (&method, path.as_str()) {
        (&Method::GET, "/health") => text_response(StatusCode::OK, "ok"),

        (&Method::GET, "/version") => {
            let version_info = serde_json::json!({
                "name": PKG_NAME,
                "version": VERSION,
            });
            json_response(StatusCode::OK, version_info.to_string())
        }

        (_, p) if p.starts_with("/api/") => {
            if !check_auth(&req, &state.auth_token) {
                warn!(path = %p, "Unauthorized API request");
                return Ok(json_error_response(ApiErrorCode::Unauthorized, "unauthorized"));
            }
            handle_api(req, &method, p, &state).await
        }

        _ => json_error_response(ApiErrorCode::NotFound, "not found"),
    };

    Ok(response)
}

async fn handle_api(
    req: Request<Incoming>,
    method: &Method,
    path: &str,
    state: &ApiState,
) -> Response<Full<Bytes>> {
    match (method, path) {
        (&Method::GET, "/api/list_users") | (&Method::POST, "/api/list_users") => {
            info!("Listing inbounds");
            match state.provisioner.list_inbounds() {
                Ok(inbounds) => msg_response(Msg::ok("", Some(inbounds))),
                Err(e) => {
                    error!(error = %e, "Failed to list inbounds");
                    json_error_response(ApiErrorCode::InternalError, e.to_string())
                }
            }
        }

        (&Method::GET, "/api/num_users") | (&Method::POST, "/api/num_users") => {
            match state.provisioner.count_inbounds() {
                Ok(count) => msg_response(Msg::<()>::ok(count.to_string(), None)),
                Err(e) => {
                    error!(error = %e, "Failed to count inbounds");
                    json_error_response(ApiErrorCode::InternalError, e.to_string())
                }
            }
        }

        (&Method::POST, "/api/add_user") => add_user(req, state).await,

        (&Method::GET, "/api/restart_status") => {
            msg_response(Msg::ok("", Some(state.coordinator.stats())))
        }

        _ => json_error_response(ApiErrorCode::NotFound, "not found"),
    }
}

async fn add_user(req: Request<Incoming>, state: &ApiState) -> Response<Full<Bytes>> {
    let host = request_host(&req);
    let content_type = req
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/json")
        .to_string();

    let body = match Limited::new(req.into_body(), MAX_BODY_BYTES).collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            return json_error_response(
                ApiErrorCode::InvalidRequest,
                format!("failed to read body: {}", e),
            )
        }
    };

    let request = match AddUserRequest::parse(&content_type, &body) {
        Ok(request) => request,
        Err(msg) => return json_error_response(ApiErrorCode::InvalidRequest, msg),
    };

    match state
        .provisioner
        .provision_and_describe(&request.remark, request.total, &host)
    {
        Ok(share_link) => msg_response(Msg::<()>::ok(share_link, None)),
        Err(e) => {
            warn!(remark = %request.remark, error = %e, "Provisioning failed");
            json_error_response(ApiErrorCode::from(&e), e.to_string())
        }
    }
}
