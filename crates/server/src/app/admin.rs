use super::{ApiError, CarouselApp, abuse};
use pingora::protocols::http::ServerSession;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::info;

#[derive(Deserialize)]
struct BanRequest {
    ip: String,
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Deserialize)]
struct UnbanRequest {
    ip: String,
}

#[derive(Deserialize, Default)]
struct ClearReportsRequest {
    #[serde(default)]
    ip: Option<String>,
}

impl CarouselApp {
    /// STUN/TURN configuration for clients, assembled from the environment.
    pub(super) async fn handle_ice(&self, session: &mut ServerSession) -> Result<(), ApiError> {
        let mut servers: Vec<Value> = self
            .state
            .config
            .stun_urls
            .iter()
            .map(|url| json!({"urls": url}))
            .collect();
        if let Some(turn) = self.state.config.turn.as_ref() {
            servers.push(json!({
                "urls": turn.url,
                "username": turn.username,
                "credential": turn.credential,
            }));
        }
        self.respond_json(session, 200, json!({"iceServers": servers}), "application/json")
            .await
            .map_err(|_| ApiError::Internal)
    }

    pub(super) async fn handle_admin_stats(
        &self,
        session: &mut ServerSession,
    ) -> Result<(), ApiError> {
        if !self.authorize_admin(session) {
            return Err(ApiError::Unauthorized);
        }
        let queue_depth = self
            .state
            .storage
            .queue_len()
            .await
            .map_err(|_| ApiError::Internal)?;
        let active_pairs = self
            .state
            .storage
            .pair_count()
            .await
            .map_err(|_| ApiError::Internal)?;
        let local_connections = {
            let connections = self.state.connections.read().await;
            connections.len()
        };
        let body = json!({
            "instance": self.state.instance_id,
            "queue_depth": queue_depth,
            "active_pairs": active_pairs,
            "local_connections": local_connections,
            "counters": self.state.metrics.snapshot(),
        });
        self.respond_json(session, 200, body, "application/json")
            .await
            .map_err(|_| ApiError::Internal)
    }

    pub(super) async fn handle_admin_reports(
        &self,
        session: &mut ServerSession,
    ) -> Result<(), ApiError> {
        if !self.authorize_admin(session) {
            return Err(ApiError::Unauthorized);
        }
        let subjects = self
            .state
            .storage
            .reported_ips()
            .await
            .map_err(|_| ApiError::Internal)?;
        let mut entries = Vec::with_capacity(subjects.len());
        for ip in subjects {
            let reports = self
                .state
                .storage
                .reports_for(&ip)
                .await
                .map_err(|_| ApiError::Internal)?;
            entries.push(json!({
                "subject_ip": ip,
                "count": reports.len(),
                "reports": reports,
            }));
        }
        self.respond_json(session, 200, json!({"reports": entries}), "application/json")
            .await
            .map_err(|_| ApiError::Internal)
    }

    pub(super) async fn handle_admin_bans(
        &self,
        session: &mut ServerSession,
    ) -> Result<(), ApiError> {
        if !self.authorize_admin(session) {
            return Err(ApiError::Unauthorized);
        }
        let bans = self
            .state
            .storage
            .ban_list()
            .await
            .map_err(|_| ApiError::Internal)?;
        self.respond_json(session, 200, json!({"bans": bans}), "application/json")
            .await
            .map_err(|_| ApiError::Internal)
    }

    pub(super) async fn handle_admin_ban(
        &self,
        session: &mut ServerSession,
    ) -> Result<(), ApiError> {
        if !self.authorize_admin(session) {
            return Err(ApiError::Unauthorized);
        }
        let body = Self::read_body(session).await?;
        let request: BanRequest = serde_json::from_slice(&body)
            .map_err(|_| ApiError::BadRequest("expected {\"ip\", \"reason\"?}".to_string()))?;
        let ip = request.ip.trim();
        if ip.is_empty() {
            return Err(ApiError::BadRequest("ip must be non-empty".to_string()));
        }
        let reason = request
            .reason
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .unwrap_or("banned by administrator");
        abuse::ban(&self.state, ip, reason)
            .await
            .map_err(|_| ApiError::Internal)?;
        info!(ip = %ip, "administrative ban applied");
        self.respond_json(session, 200, json!({"banned": ip}), "application/json")
            .await
            .map_err(|_| ApiError::Internal)
    }

    pub(super) async fn handle_admin_unban(
        &self,
        session: &mut ServerSession,
    ) -> Result<(), ApiError> {
        if !self.authorize_admin(session) {
            return Err(ApiError::Unauthorized);
        }
        let body = Self::read_body(session).await?;
        let request: UnbanRequest = serde_json::from_slice(&body)
            .map_err(|_| ApiError::BadRequest("expected {\"ip\"}".to_string()))?;
        let ip = request.ip.trim();
        if ip.is_empty() {
            return Err(ApiError::BadRequest("ip must be non-empty".to_string()));
        }
        abuse::unban(&self.state, ip)
            .await
            .map_err(|_| ApiError::Internal)?;
        info!(ip = %ip, "administrative unban applied");
        self.respond_json(session, 200, json!({"unbanned": ip}), "application/json")
            .await
            .map_err(|_| ApiError::Internal)
    }

    pub(super) async fn handle_admin_clear_reports(
        &self,
        session: &mut ServerSession,
    ) -> Result<(), ApiError> {
        if !self.authorize_admin(session) {
            return Err(ApiError::Unauthorized);
        }
        let body = Self::read_body(session).await?;
        let request: ClearReportsRequest = if body.is_empty() {
            ClearReportsRequest::default()
        } else {
            serde_json::from_slice(&body)
                .map_err(|_| ApiError::BadRequest("expected {\"ip\"?}".to_string()))?
        };
        let cleared = match request.ip.as_deref().map(str::trim) {
            Some(ip) if !ip.is_empty() => {
                self.state
                    .storage
                    .clear_reports(ip)
                    .await
                    .map_err(|_| ApiError::Internal)?;
                1
            }
            _ => self
                .state
                .storage
                .clear_all_reports()
                .await
                .map_err(|_| ApiError::Internal)?,
        };
        self.respond_json(session, 200, json!({"cleared": cleared}), "application/json")
            .await
            .map_err(|_| ApiError::Internal)
    }
}
