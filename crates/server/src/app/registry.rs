use super::{AppState, abuse};
use carousel_proto::{ControlEnvelope, Frame, FrameType};
use carousel_storage::{BANS_CHANNEL, EVENTS_CHANNEL, StorageError};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration as StdDuration;
use tracing::{info, warn};

const RESUBSCRIBE_DELAY_SECS: u64 = 2;

/// Event addressed to a connection that may live on any instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryEnvelope {
    pub target: String,
    pub frame_type: FrameType,
    pub properties: Value,
}

/// Delivers an event to a connection: straight onto the local outbound
/// channel when the target is resident, otherwise across the bus for the
/// owning instance to pick up.
pub async fn deliver(state: &Arc<AppState>, target: &str, frame_type: FrameType, properties: Value) {
    let local = {
        let connections = state.connections.read().await;
        connections
            .get(target)
            .map(|entry| (entry.sender.clone(), entry.next_sequence()))
    };
    if let Some((sender, sequence)) = local {
        let frame = Frame {
            sequence,
            frame_type,
            payload: ControlEnvelope { properties },
        };
        if sender.send(frame).await.is_err() {
            warn!(connection = %target, "local delivery channel closed");
        }
        return;
    }
    let envelope = DeliveryEnvelope {
        target: target.to_string(),
        frame_type,
        properties,
    };
    match serde_json::to_string(&envelope) {
        Ok(payload) => {
            if let Err(err) = state.storage.publish(EVENTS_CHANNEL, &payload).await {
                warn!(connection = %target, error = %err, "event fan-out publish failed");
            } else {
                state.metrics.mark_fanout_published();
            }
        }
        Err(err) => {
            warn!(connection = %target, error = %err, "event fan-out encode failed");
        }
    }
}

pub async fn deliver_error(state: &Arc<AppState>, target: &str, message: &str) {
    deliver(
        state,
        target,
        FrameType::Error,
        json!({"message": message}),
    )
    .await;
}

/// Background subscriber for cross-instance traffic: delivery envelopes on
/// the events channel, cache invalidation and remote force-close on the
/// bans channel. Reconnects with a fixed delay when the subscription drops.
pub fn spawn_fanout(state: Arc<AppState>) {
    tokio::spawn(async move {
        loop {
            match subscribe_and_pump(&state).await {
                Ok(()) => warn!("fan-out subscription ended; resubscribing"),
                Err(err) => warn!(error = %err, "fan-out subscription failed; retrying"),
            }
            tokio::time::sleep(StdDuration::from_secs(RESUBSCRIBE_DELAY_SECS)).await;
        }
    });
}

async fn subscribe_and_pump(state: &Arc<AppState>) -> Result<(), StorageError> {
    let mut subscriber = state.storage.subscriber().await?;
    subscriber
        .subscribe(EVENTS_CHANNEL)
        .await
        .map_err(|_| StorageError::Redis)?;
    subscriber
        .subscribe(BANS_CHANNEL)
        .await
        .map_err(|_| StorageError::Redis)?;
    info!(instance = %state.instance_id, "fan-out subscriber attached");
    let mut stream = subscriber.on_message();
    while let Some(message) = stream.next().await {
        let channel = message.get_channel_name().to_string();
        let payload: String = match message.get_payload() {
            Ok(payload) => payload,
            Err(err) => {
                warn!(channel = %channel, error = %err, "unreadable bus payload");
                continue;
            }
        };
        match channel.as_str() {
            EVENTS_CHANNEL => handle_delivery(state, &payload).await,
            BANS_CHANNEL => handle_ban_notice(state, &payload).await,
            _ => {}
        }
    }
    Ok(())
}

async fn handle_delivery(state: &Arc<AppState>, payload: &str) {
    let envelope: DeliveryEnvelope = match serde_json::from_str(payload) {
        Ok(envelope) => envelope,
        Err(err) => {
            warn!(error = %err, "malformed delivery envelope");
            return;
        }
    };
    let local = {
        let connections = state.connections.read().await;
        connections
            .get(&envelope.target)
            .map(|entry| (entry.sender.clone(), entry.next_sequence()))
    };
    // not resident here; the owning instance handles it
    let Some((sender, sequence)) = local else {
        return;
    };
    state.metrics.mark_fanout_received();
    let frame = Frame {
        sequence,
        frame_type: envelope.frame_type,
        payload: ControlEnvelope {
            properties: envelope.properties,
        },
    };
    if sender.send(frame).await.is_err() {
        warn!(connection = %envelope.target, "fan-out delivery channel closed");
    }
}

async fn handle_ban_notice(state: &Arc<AppState>, payload: &str) {
    match serde_json::from_str::<abuse::BanNotice>(payload) {
        Ok(notice) => abuse::apply_ban_notice(state, notice).await,
        Err(err) => warn!(error = %err, "malformed ban notice"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delivery_envelope_roundtrip() {
        let envelope = DeliveryEnvelope {
            target: "conn-remote".to_string(),
            frame_type: FrameType::Paired,
            properties: json!({"peer": "conn-local", "initiator": false}),
        };
        let payload = serde_json::to_string(&envelope).unwrap();
        let decoded: DeliveryEnvelope = serde_json::from_str(&payload).unwrap();
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn delivery_envelope_preserves_null_properties() {
        let envelope = DeliveryEnvelope {
            target: "conn-remote".to_string(),
            frame_type: FrameType::Waiting,
            properties: Value::Null,
        };
        let decoded: DeliveryEnvelope =
            serde_json::from_str(&serde_json::to_string(&envelope).unwrap()).unwrap();
        assert!(decoded.properties.is_null());
        assert_eq!(decoded.frame_type, FrameType::Waiting);
    }
}
