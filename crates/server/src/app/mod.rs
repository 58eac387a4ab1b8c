mod abuse;
mod admin;
mod matchmaker;
mod registry;
mod relay;

use crate::config::ServerConfig;
use crate::metrics::Metrics;
use crate::security::limiter::{RateLimiter, RateScope};
use crate::util::{generate_id, peer_ip};
use carousel_proto::{CodecError, Frame, FrameType, PROTOCOL_VERSION};
use carousel_storage::{RouteRecord, Storage, StorageError, connect};
use chrono::Utc;
use pingora::apps::{HttpServerApp, HttpServerOptions, ReusedHttpStream};
use pingora::http::ResponseHeader;
use pingora::protocols::http::ServerSession;
use pingora::protocols::http::v2::server::H2Options;
use pingora::server::ShutdownWatch;
use serde_json::{Value, json};
use std::collections::{HashMap, HashSet};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration as StdDuration;
use tokio::select;
use tokio::sync::{Notify, RwLock, mpsc};
use tokio::time::interval;
use tracing::{debug, error, info, warn};

const LANDING_PAGE: &str = "<!DOCTYPE html>\n<html lang=\"en\">\n<head>\n<meta charset=\"utf-8\" />\n<title>Carousel</title>\n<style>body{font-family:-apple-system,BlinkMacSystemFont,'Segoe UI',sans-serif;background:#10131a;color:#f4f6fb;margin:0;display:flex;align-items:center;justify-content:center;height:100vh;}main{max-width:460px;text-align:center;padding:2rem;background:rgba(22,27,38,0.9);border-radius:18px;box-shadow:0 12px 32px rgba(8,10,16,0.5);}h1{font-size:2.1rem;margin-bottom:0.5rem;}p{margin:0.75rem 0;color:#b9c2d8;}a{color:#4cc2ff;text-decoration:none;}a:hover{text-decoration:underline;}</style>\n</head>\n<body>\n<main>\n<h1>Carousel</h1>\n<p>Signaling and matchmaking for random peer-to-peer video chat.</p>\n<p><a href=\"/healthz\">Health</a> &middot; <a href=\"/readyz\">Readiness</a></p>\n</main>\n</body>\n</html>\n";

const OUTBOUND_CHANNEL_CAPACITY: usize = 128;

#[derive(Debug)]
pub enum ServerError {
    Storage,
    Codec,
    Invalid,
    Io,
}

impl Display for ServerError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Storage => write!(f, "storage failure"),
            Self::Codec => write!(f, "codec failure"),
            Self::Invalid => write!(f, "invalid request"),
            Self::Io => write!(f, "io failure"),
        }
    }
}

impl Error for ServerError {}

impl From<StorageError> for ServerError {
    fn from(_: StorageError) -> Self {
        ServerError::Storage
    }
}

impl From<CodecError> for ServerError {
    fn from(_: CodecError) -> Self {
        ServerError::Codec
    }
}

pub struct AppState {
    pub config: ServerConfig,
    pub storage: Arc<Storage>,
    pub metrics: Arc<Metrics>,
    pub connections: RwLock<HashMap<String, ConnectionEntry>>,
    pub banned_ips: RwLock<HashSet<String>>,
    pub rate_limits: Arc<RateLimiter>,
    pub instance_id: String,
}

pub struct ConnectionEntry {
    pub sender: mpsc::Sender<Frame>,
    pub ip: String,
    pub close: Arc<Notify>,
    next_sequence: AtomicU64,
    last_next_ms: AtomicU64,
}

impl ConnectionEntry {
    pub fn new(sender: mpsc::Sender<Frame>, ip: String, close: Arc<Notify>) -> Self {
        ConnectionEntry {
            sender,
            ip,
            close,
            next_sequence: AtomicU64::new(1),
            last_next_ms: AtomicU64::new(0),
        }
    }

    pub fn next_sequence(&self) -> u64 {
        self.next_sequence.fetch_add(1, Ordering::SeqCst)
    }

    /// Millisecond stamp of the most recent `next`, zero when none yet.
    pub fn last_next_millis(&self) -> u64 {
        self.last_next_ms.load(Ordering::SeqCst)
    }

    pub fn record_next(&self, now_ms: u64) {
        self.last_next_ms.store(now_ms, Ordering::SeqCst);
    }
}

#[derive(Debug)]
enum ApiError {
    Unauthorized,
    BadRequest(String),
    NotFound,
    Internal,
}

impl ApiError {
    fn status(&self) -> u16 {
        match self {
            Self::Unauthorized => 401,
            Self::BadRequest(_) => 400,
            Self::NotFound => 404,
            Self::Internal => 500,
        }
    }

    fn title(&self) -> &'static str {
        match self {
            Self::Unauthorized => "Unauthorized",
            Self::BadRequest(_) => "BadRequest",
            Self::NotFound => "NotFound",
            Self::Internal => "InternalError",
        }
    }
}

pub struct CarouselApp {
    pub state: Arc<AppState>,
}

impl CarouselApp {
    pub fn new(state: Arc<AppState>) -> Self {
        CarouselApp { state }
    }

    pub async fn init(config: ServerConfig) -> Result<Arc<AppState>, ServerError> {
        let storage = Arc::new(connect(&config.redis_url).await?);
        storage.readiness().await?;
        let metrics = Arc::new(Metrics::new());
        let rate_limits = Arc::new(RateLimiter::new(&config.rate_limit));
        let banned_seed = storage.ban_members().await?;
        info!(banned = banned_seed.len(), "ban cache seeded");
        let state = Arc::new(AppState {
            storage,
            metrics,
            connections: RwLock::new(HashMap::new()),
            banned_ips: RwLock::new(banned_seed),
            rate_limits,
            instance_id: generate_id("instance"),
            config,
        });
        registry::spawn_fanout(Arc::clone(&state));
        Ok(state)
    }
}

impl HttpServerApp for CarouselApp {
    fn process_new_http<'life0, 'life1, 'async_trait>(
        self: &'life0 Arc<Self>,
        session: ServerSession,
        shutdown: &'life1 ShutdownWatch,
    ) -> Pin<Box<dyn Future<Output = Option<ReusedHttpStream>> + Send + 'async_trait>>
    where
        'life0: 'async_trait,
        'life1: 'async_trait,
        Self: 'async_trait,
    {
        Box::pin(async move { self.handle_session(session, shutdown).await })
    }

    fn h2_options(&self) -> Option<H2Options> {
        None
    }

    fn server_options(&self) -> Option<&HttpServerOptions> {
        None
    }
}

impl CarouselApp {
    async fn handle_session(
        self: &Arc<Self>,
        mut session: ServerSession,
        shutdown: &ShutdownWatch,
    ) -> Option<ReusedHttpStream> {
        match session.read_request().await {
            Ok(true) => {}
            Ok(false) => return None,
            Err(err) => {
                error!("failed to read request: {}", err);
                return None;
            }
        }
        let path = session.req_header().uri.path().to_string();
        let method = session.req_header().method.to_string();
        if path == "/connect" {
            return self.process_connect(session, shutdown).await;
        }
        if let Some(retry_after) = self.check_rate_limit(&session, RateScope::Http).await {
            self.state.metrics.mark_http_rate_limited();
            if let Err(err) = self.respond_rate_limited(session, retry_after).await {
                error!("rate limit response failed: {}", err);
            }
            return None;
        }
        match (method.as_str(), path.as_str()) {
            ("GET", "/") | ("GET", "/index.html") => {
                let _ = self
                    .respond_text(&mut session, 200, "text/html; charset=utf-8", LANDING_PAGE)
                    .await;
            }
            ("GET", "/healthz") => {
                let healthy = self.state.storage.readiness().await.is_ok();
                let (status, body) = if healthy { (200, "ok") } else { (503, "degraded") };
                let _ = self
                    .respond_text(&mut session, status, "text/plain", body)
                    .await;
            }
            ("GET", "/readyz") => {
                let ready = self.state.storage.readiness().await.is_ok();
                let (status, body) = if ready { (200, "ready") } else { (503, "degraded") };
                let _ = self
                    .respond_text(&mut session, status, "text/plain", body)
                    .await;
            }
            ("GET", "/metrics") => {
                if !self.authorize_admin(&session) {
                    let _ = self.respond_api_error(&mut session, ApiError::Unauthorized).await;
                } else {
                    let payload = self.state.metrics.encode_prometheus();
                    let _ = self
                        .respond_text(&mut session, 200, "text/plain; version=0.0.4", &payload)
                        .await;
                }
            }
            ("GET", "/ice") => {
                if let Err(err) = self.handle_ice(&mut session).await {
                    let _ = self.respond_api_error(&mut session, err).await;
                }
            }
            ("GET", "/admin/stats") => {
                if let Err(err) = self.handle_admin_stats(&mut session).await {
                    let _ = self.respond_api_error(&mut session, err).await;
                }
            }
            ("GET", "/admin/reports") => {
                if let Err(err) = self.handle_admin_reports(&mut session).await {
                    let _ = self.respond_api_error(&mut session, err).await;
                }
            }
            ("GET", "/admin/bans") => {
                if let Err(err) = self.handle_admin_bans(&mut session).await {
                    let _ = self.respond_api_error(&mut session, err).await;
                }
            }
            ("POST", "/admin/ban") => {
                if let Err(err) = self.handle_admin_ban(&mut session).await {
                    let _ = self.respond_api_error(&mut session, err).await;
                }
            }
            ("POST", "/admin/unban") => {
                if let Err(err) = self.handle_admin_unban(&mut session).await {
                    let _ = self.respond_api_error(&mut session, err).await;
                }
            }
            ("POST", "/admin/clear-reports") => {
                if let Err(err) = self.handle_admin_clear_reports(&mut session).await {
                    let _ = self.respond_api_error(&mut session, err).await;
                }
            }
            _ => {
                let _ = self.respond_api_error(&mut session, ApiError::NotFound).await;
            }
        }
        session.finish().await.ok()?;
        None
    }

    async fn process_connect(
        self: &Arc<Self>,
        mut session: ServerSession,
        shutdown: &ShutdownWatch,
    ) -> Option<ReusedHttpStream> {
        if let Some(retry_after) = self.check_rate_limit(&session, RateScope::Connect).await {
            self.state.metrics.mark_connect_rate_limited();
            if let Err(err) = self.respond_rate_limited(session, retry_after).await {
                error!("connect rate limit response failed: {}", err);
            }
            return None;
        }
        if !self.origin_allowed(&session) {
            let _ = self
                .respond_problem(&mut session, 403, "Forbidden", Some("origin not allowed"))
                .await;
            let _ = session.finish().await;
            return None;
        }
        let ip = Self::client_ip(&session);
        if abuse::is_banned(&self.state, &ip).await {
            info!(ip = %ip, "admission rejected for banned address");
            let _ = self
                .respond_problem(&mut session, 403, "Forbidden", Some("address is banned"))
                .await;
            let _ = session.finish().await;
            return None;
        }

        let mut response = ResponseHeader::build_no_case(200, None).ok()?;
        response
            .append_header("content-type", "application/octet-stream")
            .ok()?;
        response.append_header("cache-control", "no-store").ok()?;
        session
            .write_response_header(Box::new(response))
            .await
            .ok()?;

        let connection_id = generate_id("connection");
        let (tx_out, mut rx_out) = mpsc::channel::<Frame>(OUTBOUND_CHANNEL_CAPACITY);
        let close = Arc::new(Notify::new());
        {
            let mut connections = self.state.connections.write().await;
            connections.insert(
                connection_id.clone(),
                ConnectionEntry::new(tx_out, ip.clone(), Arc::clone(&close)),
            );
        }
        self.state.metrics.incr_connections();
        let route = RouteRecord {
            connection_id: connection_id.clone(),
            instance: self.state.instance_id.clone(),
            ip: ip.clone(),
            since: Utc::now(),
        };
        if let Err(err) = self
            .state
            .storage
            .register_route(&route, self.state.config.presence_ttl_seconds)
            .await
        {
            warn!(connection = %connection_id, error = %err, "route register failed");
        }
        info!(connection = %connection_id, ip = %ip, "connection admitted");

        let ack_sequence = self.next_sequence_for(&connection_id).await;
        let ack = Frame::new(
            ack_sequence,
            FrameType::Ack,
            json!({
                "connection_id": connection_id,
                "protocol_version": PROTOCOL_VERSION,
            }),
        );
        if let Err(err) = self.write_frame(&mut session, ack).await {
            error!(connection = %connection_id, error = %err, "admission ack failed");
            self.cleanup_connection(&connection_id).await;
            return None;
        }

        let mut buffer: Vec<u8> = Vec::new();
        let mut shutdown_rx = shutdown.clone();
        // refresh at half the route TTL so an otherwise-live connection can
        // never look stale to the queue validators on other instances
        let mut keepalive = interval(self.state.config.route_refresh_interval());
        // consume the immediate first tick; the route is freshly registered
        keepalive.tick().await;

        'session_loop: loop {
            select! {
                inbound = session.read_request_body() => {
                    match inbound {
                        Ok(Some(chunk)) => {
                            if chunk.is_empty() {
                                continue;
                            }
                            buffer.extend_from_slice(chunk.as_ref());
                            if let Err(err) = self
                                .consume_frames(&mut session, &connection_id, &mut buffer)
                                .await
                            {
                                error!(connection = %connection_id, error = %err, "frame processing failure");
                                break 'session_loop;
                            }
                        }
                        Ok(None) => break 'session_loop,
                        Err(err) => {
                            debug!(connection = %connection_id, "read failure: {}", err);
                            break 'session_loop;
                        }
                    }
                }
                outbound = rx_out.recv() => {
                    match outbound {
                        Some(frame) => {
                            if let Err(err) = self.write_frame(&mut session, frame).await {
                                error!(connection = %connection_id, error = %err, "outbound send failed");
                                break 'session_loop;
                            }
                        }
                        None => break 'session_loop,
                    }
                }
                _ = close.notified() => {
                    // flush whatever is already queued (the banned notice rides
                    // ahead of the close signal) before tearing down
                    while let Ok(frame) = rx_out.try_recv() {
                        if self.write_frame(&mut session, frame).await.is_err() {
                            break;
                        }
                    }
                    break 'session_loop;
                }
                _ = keepalive.tick() => {
                    let refreshed = RouteRecord {
                        connection_id: connection_id.clone(),
                        instance: self.state.instance_id.clone(),
                        ip: ip.clone(),
                        since: route.since,
                    };
                    if let Err(err) = self
                        .state
                        .storage
                        .register_route(&refreshed, self.state.config.presence_ttl_seconds)
                        .await
                    {
                        warn!(connection = %connection_id, error = %err, "route refresh failed");
                    }
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_ok() {
                        if let Ok(Some(_)) = self.state.storage.pair_partner(&connection_id).await {
                            let sequence = self.next_sequence_for(&connection_id).await;
                            let farewell =
                                Frame::new(sequence, FrameType::PartnerDisconnected, Value::Null);
                            let _ = self.write_frame(&mut session, farewell).await;
                        }
                        break 'session_loop;
                    }
                }
            }
        }

        self.cleanup_connection(&connection_id).await;
        session.finish().await.ok()?;
        None
    }

    async fn consume_frames(
        &self,
        session: &mut ServerSession,
        connection_id: &str,
        buffer: &mut Vec<u8>,
    ) -> Result<(), ServerError> {
        loop {
            match Frame::decode(buffer) {
                Ok((frame, consumed)) => {
                    buffer.drain(0..consumed);
                    self.dispatch_event(connection_id, frame).await;
                }
                Err(CodecError::UnexpectedEof) => return Ok(()),
                Err(err) => {
                    error!(connection = %connection_id, "decode failure: {}", err);
                    let sequence = self.next_sequence_for(connection_id).await;
                    let notice = Frame::new(
                        sequence,
                        FrameType::Error,
                        json!({"message": "malformed frame"}),
                    );
                    let _ = self.write_frame(session, notice).await;
                    return Err(ServerError::Codec);
                }
            }
        }
    }

    /// Inbound events for one connection run here sequentially; that
    /// serialization is the only ordering the matchmaker relies on.
    async fn dispatch_event(&self, connection_id: &str, frame: Frame) {
        self.state.metrics.mark_ingress();
        let result = match frame.frame_type {
            FrameType::Join => matchmaker::join(&self.state, connection_id).await,
            FrameType::Next => matchmaker::next(&self.state, connection_id).await,
            FrameType::Leave => matchmaker::leave(&self.state, connection_id).await,
            FrameType::Signal => {
                relay::forward_signal(&self.state, connection_id, &frame.payload).await
            }
            FrameType::Report => abuse::report(&self.state, connection_id, &frame.payload).await,
            other => {
                debug!(connection = %connection_id, frame = ?other, "ignoring non-client frame type");
                Ok(())
            }
        };
        if let Err(err) = result {
            error!(connection = %connection_id, error = %err, "event handler failed");
            registry::deliver_error(&self.state, connection_id, "internal error").await;
        }
    }

    async fn cleanup_connection(&self, connection_id: &str) {
        let removed = {
            let mut connections = self.state.connections.write().await;
            connections.remove(connection_id)
        };
        if let Some(entry) = removed {
            self.state.metrics.decr_connections();
            info!(connection = %connection_id, ip = %entry.ip, "connection closed");
        }
        if let Err(err) = self.state.storage.clear_route(connection_id).await {
            warn!(connection = %connection_id, error = %err, "route cleanup failed");
        }
        if let Err(err) = matchmaker::on_disconnect(&self.state, connection_id).await {
            warn!(connection = %connection_id, error = %err, "disconnect cleanup failed");
        }
    }

    async fn next_sequence_for(&self, connection_id: &str) -> u64 {
        let connections = self.state.connections.read().await;
        connections
            .get(connection_id)
            .map(|entry| entry.next_sequence())
            .unwrap_or(0)
    }

    async fn write_frame(
        &self,
        session: &mut ServerSession,
        frame: Frame,
    ) -> Result<(), ServerError> {
        let encoded = frame.encode()?;
        session
            .write_response_body(encoded.into(), false)
            .await
            .map_err(|_| ServerError::Io)?;
        self.state.metrics.mark_egress();
        Ok(())
    }

    async fn respond_text(
        &self,
        session: &mut ServerSession,
        status: u16,
        content_type: &str,
        body: &str,
    ) -> Result<(), ServerError> {
        let mut response =
            ResponseHeader::build_no_case(status, None).map_err(|_| ServerError::Invalid)?;
        response
            .append_header("content-type", content_type)
            .map_err(|_| ServerError::Invalid)?;
        session
            .write_response_header(Box::new(response))
            .await
            .map_err(|_| ServerError::Io)?;
        session
            .write_response_body(body.to_string().into_bytes().into(), true)
            .await
            .map_err(|_| ServerError::Io)?;
        Ok(())
    }

    async fn respond_json(
        &self,
        session: &mut ServerSession,
        status: u16,
        payload: Value,
        content_type: &str,
    ) -> Result<(), ServerError> {
        let mut response =
            ResponseHeader::build_no_case(status, None).map_err(|_| ServerError::Invalid)?;
        response
            .append_header("content-type", content_type)
            .map_err(|_| ServerError::Invalid)?;
        response
            .append_header("cache-control", "no-store")
            .map_err(|_| ServerError::Invalid)?;
        session
            .write_response_header(Box::new(response))
            .await
            .map_err(|_| ServerError::Io)?;
        session
            .write_response_body(payload.to_string().into_bytes().into(), true)
            .await
            .map_err(|_| ServerError::Io)?;
        Ok(())
    }

    async fn respond_api_error(
        &self,
        session: &mut ServerSession,
        error: ApiError,
    ) -> Result<(), ServerError> {
        let status = error.status();
        let title = error.title();
        let detail = match &error {
            ApiError::Unauthorized => Some("authorization required"),
            ApiError::BadRequest(reason) => Some(reason.as_str()),
            ApiError::NotFound => Some("resource not found"),
            ApiError::Internal => Some("internal server error"),
        };
        let mut body = json!({
            "type": "about:blank",
            "title": title,
            "status": status,
        });
        if let Some(message) = detail
            && let Some(obj) = body.as_object_mut()
        {
            obj.insert("detail".to_string(), json!(message));
        }
        self.respond_json(session, status, body, "application/problem+json")
            .await
    }

    async fn respond_problem(
        &self,
        session: &mut ServerSession,
        status: u16,
        title: &str,
        detail: Option<&str>,
    ) -> Result<(), ServerError> {
        let mut body = json!({
            "type": "about:blank",
            "title": title,
            "status": status,
        });
        if let Some(message) = detail
            && let Some(obj) = body.as_object_mut()
        {
            obj.insert("detail".to_string(), json!(message));
        }
        self.respond_json(session, status, body, "application/problem+json")
            .await
    }

    async fn respond_rate_limited(
        &self,
        mut session: ServerSession,
        retry_after: StdDuration,
    ) -> Result<(), ServerError> {
        let mut response =
            ResponseHeader::build_no_case(429, None).map_err(|_| ServerError::Invalid)?;
        response
            .append_header("content-type", "application/problem+json")
            .map_err(|_| ServerError::Invalid)?;
        let retry_secs = retry_after.as_secs().max(1);
        response
            .append_header("retry-after", retry_secs.to_string())
            .map_err(|_| ServerError::Invalid)?;
        session
            .write_response_header(Box::new(response))
            .await
            .map_err(|_| ServerError::Io)?;
        let body = json!({
            "type": "about:blank",
            "title": "Too Many Requests",
            "status": 429,
        })
        .to_string();
        session
            .write_response_body(body.into_bytes().into(), true)
            .await
            .map_err(|_| ServerError::Io)?;
        session.finish().await.map_err(|_| ServerError::Io)?;
        Ok(())
    }

    async fn read_body(session: &mut ServerSession) -> Result<Vec<u8>, ApiError> {
        let mut body = Vec::new();
        loop {
            match session.read_request_body().await {
                Ok(Some(chunk)) => body.extend_from_slice(&chunk),
                Ok(None) => break,
                Err(_) => return Err(ApiError::Internal),
            }
        }
        Ok(body)
    }

    fn authorize_admin(&self, session: &ServerSession) -> bool {
        let Some(expected) = self.state.config.admin_token.as_deref() else {
            return false;
        };
        let header = session
            .req_header()
            .headers
            .get("authorization")
            .and_then(|value| value.to_str().ok());
        let bearer = match header {
            Some(value) => value.trim(),
            None => return false,
        };
        let token = bearer.strip_prefix("Bearer ").unwrap_or(bearer).trim();
        !token.is_empty() && token == expected
    }

    fn origin_allowed(&self, session: &ServerSession) -> bool {
        if self.state.config.allowed_origins.is_empty() {
            return true;
        }
        let origin = session
            .req_header()
            .headers
            .get("origin")
            .and_then(|value| value.to_str().ok());
        match origin {
            Some(value) => self
                .state
                .config
                .allowed_origins
                .iter()
                .any(|allowed| allowed == value),
            None => false,
        }
    }

    fn client_ip(session: &ServerSession) -> String {
        session
            .client_addr()
            .map(|addr| peer_ip(&addr.to_string()))
            .unwrap_or_else(|| "unknown".to_string())
    }

    async fn check_rate_limit(
        &self,
        session: &ServerSession,
        scope: RateScope,
    ) -> Option<StdDuration> {
        let identity = Self::client_ip(session);
        let decision = self.state.rate_limits.check(scope, &identity).await;
        if decision.allowed {
            None
        } else {
            Some(
                decision
                    .retry_after
                    .unwrap_or_else(|| StdDuration::from_secs(1)),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry() -> (ConnectionEntry, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(8);
        (
            ConnectionEntry::new(tx, "198.51.100.1".to_string(), Arc::new(Notify::new())),
            rx,
        )
    }

    #[test]
    fn connection_sequence_is_monotonic() {
        let (entry, _rx) = entry();
        assert_eq!(entry.next_sequence(), 1);
        assert_eq!(entry.next_sequence(), 2);
        assert_eq!(entry.next_sequence(), 3);
    }

    #[test]
    fn next_stamp_starts_unset() {
        let (entry, _rx) = entry();
        assert_eq!(entry.last_next_millis(), 0);
        entry.record_next(1_700_000_000_000);
        assert_eq!(entry.last_next_millis(), 1_700_000_000_000);
    }

    #[test]
    fn api_error_status_mapping() {
        assert_eq!(ApiError::Unauthorized.status(), 401);
        assert_eq!(ApiError::BadRequest("x".to_string()).status(), 400);
        assert_eq!(ApiError::NotFound.status(), 404);
        assert_eq!(ApiError::Internal.status(), 500);
        assert_eq!(ApiError::NotFound.title(), "NotFound");
    }
}
