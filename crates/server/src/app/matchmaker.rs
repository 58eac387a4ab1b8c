use super::{AppState, ServerError, registry};
use carousel_proto::FrameType;
use chrono::Utc;
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::{debug, warn};

/// Minimum spacing between `next` requests from one connection.
const NEXT_COOLDOWN_MS: u64 = 1_000;
/// Cap on discarded pops per match attempt, bounding spin on a corrupted
/// queue.
const POP_VALID_ATTEMPTS: usize = 50;

/// `join`: pair with the longest-waiting eligible peer or enter the queue.
/// A connection that is already paired stays untouched.
pub async fn join(state: &Arc<AppState>, connection_id: &str) -> Result<(), ServerError> {
    if state.storage.pair_partner(connection_id).await?.is_some() {
        return Ok(());
    }
    state.storage.queue_remove(connection_id).await?;
    match_or_wait(state, connection_id, None).await
}

/// `next`: rate-limited partner rotation. Dissolves the current pair,
/// notifies both sides, requeues the partner ahead of re-matching the
/// caller; a waiting caller is moved to the tail instead of no-opping.
pub async fn next(state: &Arc<AppState>, connection_id: &str) -> Result<(), ServerError> {
    let now_ms = Utc::now().timestamp_millis().max(0) as u64;
    let allowed = {
        let connections = state.connections.read().await;
        match connections.get(connection_id) {
            Some(entry) => {
                if cooldown_active(entry.last_next_millis(), now_ms, NEXT_COOLDOWN_MS) {
                    false
                } else {
                    entry.record_next(now_ms);
                    true
                }
            }
            None => return Ok(()),
        }
    };
    if !allowed {
        debug!(connection = %connection_id, "next inside cooldown window");
        registry::deliver_error(state, connection_id, "cooldown").await;
        return Ok(());
    }

    if let Some((_, partner)) = state.storage.pair_dissolve(connection_id).await? {
        state.metrics.mark_dissolved();
        registry::deliver(state, connection_id, FrameType::PartnerDisconnected, Value::Null).await;
        registry::deliver(state, &partner, FrameType::PartnerDisconnected, Value::Null).await;
        // requeue the partner first so it is eligible for future arrivals,
        // but keep it out of this rotation's own match attempt
        if state.storage.route_exists(&partner).await? {
            enqueue(state, &partner).await;
        }
        match_or_wait(state, connection_id, Some(&partner)).await
    } else {
        state.storage.queue_remove(connection_id).await?;
        match_or_wait(state, connection_id, None).await
    }
}

/// `leave`: dissolve any pair, requeue the surviving partner, drop out of
/// the queue and acknowledge.
pub async fn leave(state: &Arc<AppState>, connection_id: &str) -> Result<(), ServerError> {
    if let Some((_, partner)) = state.storage.pair_dissolve(connection_id).await? {
        state.metrics.mark_dissolved();
        registry::deliver(state, connection_id, FrameType::PartnerDisconnected, Value::Null).await;
        registry::deliver(state, &partner, FrameType::PartnerDisconnected, Value::Null).await;
        if state.storage.route_exists(&partner).await? {
            enqueue(state, &partner).await;
        }
    }
    state.storage.queue_remove(connection_id).await?;
    registry::deliver(state, connection_id, FrameType::Left, Value::Null).await;
    Ok(())
}

/// Terminal cleanup after a disconnect. Nothing is delivered to the dead
/// connection; the surviving partner gets an immediate re-match attempt
/// instead of a bare requeue. Safe to run more than once.
pub async fn on_disconnect(state: &Arc<AppState>, connection_id: &str) -> Result<(), ServerError> {
    if let Some((_, partner)) = state.storage.pair_dissolve(connection_id).await? {
        state.metrics.mark_dissolved();
        registry::deliver(state, &partner, FrameType::PartnerDisconnected, Value::Null).await;
        if state.storage.route_exists(&partner).await? {
            match_or_wait(state, &partner, None).await?;
        }
    }
    state.storage.queue_remove(connection_id).await?;
    Ok(())
}

/// The shared match step: destructive pop of a validated waiter, or the
/// queue tail. The popping side of a fresh pair is the initiator.
/// `skip` carries a just-dissolved partner so a rotation never re-pairs
/// the same two peers within the same operation.
async fn match_or_wait(
    state: &Arc<AppState>,
    connection_id: &str,
    skip: Option<&str>,
) -> Result<(), ServerError> {
    if let Some(other) = pop_valid(state, connection_id, skip).await? {
        state.storage.pair_bind(connection_id, &other).await?;
        state.metrics.mark_match();
        registry::deliver(
            state,
            connection_id,
            FrameType::Paired,
            json!({"peer": other, "initiator": true}),
        )
        .await;
        registry::deliver(
            state,
            &other,
            FrameType::Paired,
            json!({"peer": connection_id, "initiator": false}),
        )
        .await;
    } else {
        enqueue(state, connection_id).await;
    }
    Ok(())
}

/// Pops queue heads until one is a live connection other than the caller.
/// Pops are destructive, so two racing matchers can never both claim the
/// same waiter; stale ids are discarded here instead of at enqueue time.
async fn pop_valid(
    state: &Arc<AppState>,
    exclude: &str,
    skip: Option<&str>,
) -> Result<Option<String>, ServerError> {
    let mut requeue: Option<String> = None;
    let picked = 'pop: {
        for _ in 0..POP_VALID_ATTEMPTS {
            let Some(candidate) = state.storage.queue_pop().await? else {
                break 'pop None;
            };
            if candidate == exclude {
                continue;
            }
            if Some(candidate.as_str()) == skip {
                // hold the skipped waiter aside and put it back afterwards
                requeue = Some(candidate);
                continue;
            }
            if !state.storage.route_exists(&candidate).await? {
                state.metrics.mark_stale_discard();
                debug!(connection = %candidate, "discarded stale queue entry");
                continue;
            }
            break 'pop Some(candidate);
        }
        warn!(
            attempts = POP_VALID_ATTEMPTS,
            "queue validation exhausted; treating queue as empty"
        );
        None
    };
    if let Some(held) = requeue {
        if let Err(err) = state.storage.queue_push(&held).await {
            warn!(connection = %held, error = %err, "requeue of skipped waiter failed");
        }
    }
    Ok(picked)
}

/// Best-effort enqueue: store errors are logged and swallowed, and the
/// `waiting` notice only follows a successful append.
async fn enqueue(state: &Arc<AppState>, connection_id: &str) {
    if let Err(err) = state.storage.queue_push(connection_id).await {
        warn!(connection = %connection_id, error = %err, "enqueue failed");
        return;
    }
    registry::deliver(state, connection_id, FrameType::Waiting, Value::Null).await;
}

fn cooldown_active(last_ms: u64, now_ms: u64, cooldown_ms: u64) -> bool {
    last_ms != 0 && now_ms.saturating_sub(last_ms) < cooldown_ms
}


#[cfg(test)]
mod flow_tests {
    use super::*;
    use crate::app::{ConnectionEntry, abuse, relay};
    use crate::config::{RateLimitConfig, RateLimitSettings, ServerConfig};
    use crate::metrics::Metrics;
    use crate::security::limiter::RateLimiter;
    use crate::util::generate_id;
    use carousel_proto::{BannedNotice, ControlEnvelope, Frame, PairedNotice, SignalEnvelope};
    use carousel_storage::{RouteRecord, connect};
    use std::collections::{HashMap, HashSet};
    use std::time::Duration as StdDuration;
    use tokio::sync::{Notify, RwLock, mpsc};

    async fn test_state() -> Option<Arc<AppState>> {
        let url = match std::env::var("CAROUSEL_TEST_REDIS_URL") {
            Ok(value) => value,
            Err(_) => {
                eprintln!("skipping: CAROUSEL_TEST_REDIS_URL not set");
                return None;
            }
        };
        let storage = Arc::new(connect(&url).await.expect("redis connection"));
        let settings = RateLimitSettings {
            burst: 1_000,
            window: StdDuration::from_secs(1),
            penalty: StdDuration::from_secs(1),
        };
        let config = ServerConfig {
            bind: "127.0.0.1:0".to_string(),
            tls_cert: None,
            tls_key: None,
            redis_url: url,
            admin_token: None,
            allowed_origins: Vec::new(),
            stun_urls: Vec::new(),
            turn: None,
            presence_ttl_seconds: 30,
            rate_limit: RateLimitConfig {
                http: settings.clone(),
                connect: settings,
            },
        };
        let rate_limits = Arc::new(RateLimiter::new(&config.rate_limit));
        Some(Arc::new(AppState {
            storage,
            metrics: Arc::new(Metrics::new()),
            connections: RwLock::new(HashMap::new()),
            banned_ips: RwLock::new(HashSet::new()),
            rate_limits,
            instance_id: generate_id("test-instance"),
            config,
        }))
    }

    async fn attach(
        state: &Arc<AppState>,
        connection_id: &str,
        ip: &str,
    ) -> mpsc::Receiver<Frame> {
        let (tx, rx) = mpsc::channel(64);
        state.connections.write().await.insert(
            connection_id.to_string(),
            ConnectionEntry::new(tx, ip.to_string(), Arc::new(Notify::new())),
        );
        state
            .storage
            .register_route(
                &RouteRecord {
                    connection_id: connection_id.to_string(),
                    instance: state.instance_id.clone(),
                    ip: ip.to_string(),
                    since: Utc::now(),
                },
                30,
            )
            .await
            .expect("route registration");
        rx
    }

    async fn detach(state: &Arc<AppState>, connection_id: &str) {
        state.connections.write().await.remove(connection_id);
        let _ = state.storage.clear_route(connection_id).await;
    }

    async fn recv(rx: &mut mpsc::Receiver<Frame>) -> Frame {
        tokio::time::timeout(StdDuration::from_secs(2), rx.recv())
            .await
            .expect("timely frame")
            .expect("open channel")
    }

    fn assert_quiet(rx: &mut mpsc::Receiver<Frame>) {
        assert!(rx.try_recv().is_err(), "unexpected pending frame");
    }

    #[tokio::test]
    async fn matchmaking_flow_end_to_end() -> Result<(), Box<dyn std::error::Error>> {
        let Some(state) = test_state().await else {
            return Ok(());
        };
        // start from an empty waiting pool
        while state.storage.queue_pop().await?.is_some() {}

        let suffix = Utc::now().timestamp_nanos_opt().unwrap_or_default();
        let a = format!("it-a-{}", suffix);
        let b = format!("it-b-{}", suffix);
        let c = format!("it-c-{}", suffix);
        let ip_a = "198.51.100.1";
        let ip_b = "198.51.100.2";
        let mut rx_a = attach(&state, &a, ip_a).await;
        let mut rx_b = attach(&state, &b, ip_b).await;

        // first joiner waits; a repeated join keeps a single queue slot
        join(&state, &a).await?;
        assert_eq!(recv(&mut rx_a).await.frame_type, FrameType::Waiting);
        join(&state, &a).await?;
        assert_eq!(recv(&mut rx_a).await.frame_type, FrameType::Waiting);
        let entries = state.storage.queue_entries().await?;
        assert_eq!(entries.iter().filter(|id| **id == a).count(), 1);

        // second joiner pairs instantly; the mover is the initiator
        join(&state, &b).await?;
        let paired_b = PairedNotice::try_from(&recv(&mut rx_b).await.payload)?;
        assert_eq!(paired_b.peer, a);
        assert!(paired_b.initiator);
        let paired_a = PairedNotice::try_from(&recv(&mut rx_a).await.payload)?;
        assert_eq!(paired_a.peer, b);
        assert!(!paired_a.initiator);

        // pair symmetry, and neither side stays queued
        assert_eq!(state.storage.pair_partner(&a).await?.as_deref(), Some(b.as_str()));
        assert_eq!(state.storage.pair_partner(&b).await?.as_deref(), Some(a.as_str()));
        assert!(state.storage.queue_entries().await?.iter().all(|id| *id != a && *id != b));

        // joining while paired is a no-op
        join(&state, &a).await?;
        assert_quiet(&mut rx_a);
        assert_eq!(state.storage.pair_partner(&a).await?.as_deref(), Some(b.as_str()));

        // the relay rewrites the source and passes the blob through verbatim
        let blob = serde_json::json!({"sdp": "v=0"});
        let outbound: ControlEnvelope = (&SignalEnvelope {
            peer: b.clone(),
            signal: blob.clone(),
        })
            .try_into()?;
        relay::forward_signal(&state, &a, &outbound).await?;
        let relayed = recv(&mut rx_b).await;
        assert_eq!(relayed.frame_type, FrameType::Signal);
        let envelope = SignalEnvelope::try_from(&relayed.payload)?;
        assert_eq!(envelope.peer, a);
        assert_eq!(envelope.signal, blob);

        // a signal naming anyone but the current partner vanishes
        let spoofed: ControlEnvelope = (&SignalEnvelope {
            peer: "somebody-else".to_string(),
            signal: blob.clone(),
        })
            .try_into()?;
        relay::forward_signal(&state, &a, &spoofed).await?;
        assert_quiet(&mut rx_b);

        // rotation: both sides told, partner requeued, caller waits because
        // the dissolved partner is not an instant candidate again
        next(&state, &a).await?;
        assert_eq!(recv(&mut rx_a).await.frame_type, FrameType::PartnerDisconnected);
        assert_eq!(recv(&mut rx_b).await.frame_type, FrameType::PartnerDisconnected);
        assert_eq!(recv(&mut rx_b).await.frame_type, FrameType::Waiting);
        assert_eq!(recv(&mut rx_a).await.frame_type, FrameType::Waiting);
        assert_eq!(state.storage.queue_entries().await?, vec![b.clone(), a.clone()]);
        assert!(state.storage.pair_partner(&a).await?.is_none());

        // a second rotation inside the cooldown window only yields an error
        next(&state, &a).await?;
        let cooldown = recv(&mut rx_a).await;
        assert_eq!(cooldown.frame_type, FrameType::Error);
        assert_eq!(cooldown.payload.properties["message"], "cooldown");
        assert_eq!(state.storage.queue_entries().await?, vec![b.clone(), a.clone()]);

        // a third arrival matches the queue head in FIFO order
        let mut rx_c = attach(&state, &c, "198.51.100.3").await;
        join(&state, &c).await?;
        let paired_c = PairedNotice::try_from(&recv(&mut rx_c).await.payload)?;
        assert_eq!(paired_c.peer, b);
        let paired_b = PairedNotice::try_from(&recv(&mut rx_b).await.payload)?;
        assert_eq!(paired_b.peer, c);
        assert_eq!(state.storage.queue_entries().await?, vec![a.clone()]);

        // disconnect: the survivor is re-matched immediately, the dead side
        // gets nothing, and a second cleanup run changes nothing
        detach(&state, &c).await;
        on_disconnect(&state, &c).await?;
        assert_eq!(recv(&mut rx_b).await.frame_type, FrameType::PartnerDisconnected);
        let rematched_b = PairedNotice::try_from(&recv(&mut rx_b).await.payload)?;
        assert_eq!(rematched_b.peer, a);
        assert!(rematched_b.initiator);
        let rematched_a = PairedNotice::try_from(&recv(&mut rx_a).await.payload)?;
        assert_eq!(rematched_a.peer, b);
        on_disconnect(&state, &c).await?;
        assert_quiet(&mut rx_a);
        assert_quiet(&mut rx_b);
        assert_eq!(state.storage.pair_partner(&a).await?.as_deref(), Some(b.as_str()));

        // reporting: partner mismatch and bad payloads answer with errors
        let mismatch: ControlEnvelope = (&carousel_proto::ReportRequest {
            peer: "somebody-else".to_string(),
            reason: "spam".to_string(),
        })
            .try_into()?;
        abuse::report(&state, &b, &mismatch).await?;
        assert_eq!(recv(&mut rx_b).await.frame_type, FrameType::Error);
        let empty_reason: ControlEnvelope = (&carousel_proto::ReportRequest {
            peer: b.clone(),
            reason: String::new(),
        })
            .try_into()?;
        abuse::report(&state, &a, &empty_reason).await?;
        assert_eq!(recv(&mut rx_a).await.frame_type, FrameType::Error);

        // four reports are acknowledged without a ban, the fifth trips it
        state.storage.clear_reports(ip_b).await?;
        let complaint: ControlEnvelope = (&carousel_proto::ReportRequest {
            peer: b.clone(),
            reason: "inappropriate".to_string(),
        })
            .try_into()?;
        for _ in 0..4 {
            abuse::report(&state, &a, &complaint).await?;
            assert_eq!(recv(&mut rx_a).await.frame_type, FrameType::ReportSubmitted);
        }
        assert!(!state.banned_ips.read().await.contains(ip_b));
        abuse::report(&state, &a, &complaint).await?;
        assert_eq!(recv(&mut rx_a).await.frame_type, FrameType::ReportSubmitted);
        let banned = recv(&mut rx_b).await;
        assert_eq!(banned.frame_type, FrameType::Banned);
        let notice = BannedNotice::try_from(&banned.payload)?;
        assert!(notice.reason.starts_with("auto-ban"));
        assert!(state.banned_ips.read().await.contains(ip_b));
        assert!(state.storage.ban_members().await?.contains(ip_b));

        // unban restores admission without touching live connections
        abuse::unban(&state, ip_b).await?;
        assert!(!state.banned_ips.read().await.contains(ip_b));
        state.storage.clear_reports(ip_b).await?;

        // leave: pair dissolved, partner requeued, caller acknowledged
        leave(&state, &a).await?;
        assert_eq!(recv(&mut rx_a).await.frame_type, FrameType::PartnerDisconnected);
        assert_eq!(recv(&mut rx_a).await.frame_type, FrameType::Left);
        assert_eq!(recv(&mut rx_b).await.frame_type, FrameType::PartnerDisconnected);
        assert_eq!(recv(&mut rx_b).await.frame_type, FrameType::Waiting);

        // a final leave returns the system to its initial state
        leave(&state, &b).await?;
        assert_eq!(recv(&mut rx_b).await.frame_type, FrameType::Left);
        assert!(state.storage.queue_entries().await?.iter().all(|id| *id != a && *id != b));
        assert!(state.storage.pair_partner(&a).await?.is_none());
        assert!(state.storage.pair_partner(&b).await?.is_none());

        detach(&state, &a).await;
        detach(&state, &b).await;
        Ok(())
    }
}
