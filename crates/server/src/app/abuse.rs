use super::{AppState, ServerError, registry};
use carousel_proto::{ControlEnvelope, Frame, FrameType, ReportRequest};
use carousel_storage::{BANS_CHANNEL, BanRecord, ReportRecord};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn};

/// Report count within one TTL window that triggers an automatic ban.
pub const AUTO_BAN_THRESHOLD: usize = 5;

const AUTO_BAN_REASON: &str = "auto-ban: >=5 reports in 24h";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BanAction {
    Ban,
    Unban,
}

/// Cluster notice on the `bans` channel. `origin` lets the publishing
/// instance skip the force-close it already performed synchronously.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BanNotice {
    pub action: BanAction,
    pub ip: String,
    pub reason: String,
    pub origin: String,
}

/// Admission check against the process-local cache.
pub async fn is_banned(state: &Arc<AppState>, ip: &str) -> bool {
    state.banned_ips.read().await.contains(ip)
}

/// Files a report from `reporter` against its current partner. Validation
/// failures answer with an `error` event; a complete report is acknowledged
/// and may tip the subject over the automatic ban threshold.
pub async fn report(
    state: &Arc<AppState>,
    reporter: &str,
    payload: &ControlEnvelope,
) -> Result<(), ServerError> {
    let request = match ReportRequest::try_from(payload).and_then(|request| {
        request.validate()?;
        Ok(request)
    }) {
        Ok(request) => request,
        Err(_) => {
            registry::deliver_error(state, reporter, "invalid report").await;
            return Ok(());
        }
    };
    let partner = state.storage.pair_partner(reporter).await?;
    if partner.as_deref() != Some(request.peer.as_str()) {
        registry::deliver_error(state, reporter, "report requires an active pair").await;
        return Ok(());
    }
    let Some(subject_route) = state.storage.read_route(&request.peer).await? else {
        registry::deliver_error(state, reporter, "peer is no longer connected").await;
        return Ok(());
    };
    let reporter_ip = {
        let connections = state.connections.read().await;
        match connections.get(reporter) {
            Some(entry) => entry.ip.clone(),
            None => return Ok(()),
        }
    };
    let record = ReportRecord {
        reporter: reporter.to_string(),
        reporter_ip,
        subject_ip: subject_route.ip.clone(),
        reason: request.reason,
        reported_at: Utc::now(),
    };
    let count = state.storage.report_append(&record).await?;
    state.metrics.mark_report();
    info!(
        reporter = %reporter,
        subject_ip = %record.subject_ip,
        count,
        "report filed"
    );
    registry::deliver(
        state,
        reporter,
        FrameType::ReportSubmitted,
        json!({"success": true}),
    )
    .await;
    if count >= AUTO_BAN_THRESHOLD {
        ban(state, &record.subject_ip, AUTO_BAN_REASON).await?;
    }
    Ok(())
}

/// Bans an address: authoritative set + metadata, local cache, forced close
/// of resident connections, then a cluster notice for the other instances.
pub async fn ban(state: &Arc<AppState>, ip: &str, reason: &str) -> Result<(), ServerError> {
    let record = BanRecord {
        ip: ip.to_string(),
        reason: reason.to_string(),
        banned_at: Utc::now(),
    };
    state.storage.ban_add(&record).await?;
    {
        let mut cache = state.banned_ips.write().await;
        cache.insert(ip.to_string());
    }
    state.metrics.mark_ban();
    info!(ip = %ip, reason = %reason, "address banned");
    force_close_ip(state, ip, reason).await;
    publish_notice(
        state,
        BanNotice {
            action: BanAction::Ban,
            ip: ip.to_string(),
            reason: reason.to_string(),
            origin: state.instance_id.clone(),
        },
    )
    .await;
    Ok(())
}

/// Lifts a ban. Connections already admitted from that address stay up.
pub async fn unban(state: &Arc<AppState>, ip: &str) -> Result<(), ServerError> {
    state.storage.ban_remove(ip).await?;
    {
        let mut cache = state.banned_ips.write().await;
        cache.remove(ip);
    }
    info!(ip = %ip, "address unbanned");
    publish_notice(
        state,
        BanNotice {
            action: BanAction::Unban,
            ip: ip.to_string(),
            reason: String::new(),
            origin: state.instance_id.clone(),
        },
    )
    .await;
    Ok(())
}

/// Applies a notice from the `bans` channel: cache update on every
/// instance, force-close only where the notice did not originate.
pub async fn apply_ban_notice(state: &Arc<AppState>, notice: BanNotice) {
    match notice.action {
        BanAction::Ban => {
            {
                let mut cache = state.banned_ips.write().await;
                cache.insert(notice.ip.clone());
            }
            if notice.origin != state.instance_id {
                force_close_ip(state, &notice.ip, &notice.reason).await;
            }
        }
        BanAction::Unban => {
            let mut cache = state.banned_ips.write().await;
            cache.remove(&notice.ip);
        }
    }
}

/// Delivers `banned` to every local connection from `ip`, then signals
/// their session loops to tear down.
async fn force_close_ip(state: &Arc<AppState>, ip: &str, reason: &str) {
    let targets: Vec<_> = {
        let connections = state.connections.read().await;
        connections
            .iter()
            .filter(|(_, entry)| entry.ip == ip)
            .map(|(id, entry)| {
                (
                    id.clone(),
                    entry.sender.clone(),
                    entry.next_sequence(),
                    Arc::clone(&entry.close),
                )
            })
            .collect()
    };
    for (connection_id, sender, sequence, close) in targets {
        let frame = Frame::new(sequence, FrameType::Banned, json!({"reason": reason}));
        let _ = sender.send(frame).await;
        close.notify_one();
        info!(connection = %connection_id, ip = %ip, "connection force-closed by ban");
    }
}

async fn publish_notice(state: &Arc<AppState>, notice: BanNotice) {
    match serde_json::to_string(&notice) {
        Ok(payload) => {
            if let Err(err) = state.storage.publish(BANS_CHANNEL, &payload).await {
                warn!(ip = %notice.ip, error = %err, "ban notice publish failed");
            }
        }
        Err(err) => warn!(ip = %notice.ip, error = %err, "ban notice encode failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ban_notice_roundtrip() {
        let notice = BanNotice {
            action: BanAction::Ban,
            ip: "203.0.113.9".to_string(),
            reason: AUTO_BAN_REASON.to_string(),
            origin: "instance-1".to_string(),
        };
        let json = serde_json::to_string(&notice).unwrap();
        assert!(json.contains("\"action\":\"ban\""));
        let decoded: BanNotice = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, notice);
    }

    #[test]
    fn unban_notice_roundtrip() {
        let notice = BanNotice {
            action: BanAction::Unban,
            ip: "203.0.113.9".to_string(),
            reason: String::new(),
            origin: "instance-2".to_string(),
        };
        let decoded: BanNotice =
            serde_json::from_str(&serde_json::to_string(&notice).unwrap()).unwrap();
        assert_eq!(decoded.action, BanAction::Unban);
    }
}
