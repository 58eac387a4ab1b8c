use super::{AppState, ServerError, registry};
use carousel_proto::{ControlEnvelope, FrameType, SignalEnvelope};
use serde_json::json;
use std::sync::Arc;
use tracing::debug;

/// Forwards an opaque signaling blob to the sender's current partner.
///
/// Only the outer shape is inspected; the blob passes through verbatim.
/// Malformed, oversized, spoofed or stale signals are dropped without a
/// client response. No state is mutated on this path.
pub async fn forward_signal(
    state: &Arc<AppState>,
    sender: &str,
    payload: &ControlEnvelope,
) -> Result<(), ServerError> {
    let envelope = match SignalEnvelope::try_from(payload) {
        Ok(envelope) => envelope,
        Err(err) => {
            debug!(connection = %sender, error = %err, "malformed signal dropped");
            state.metrics.mark_signal_dropped();
            return Ok(());
        }
    };
    if let Err(err) = envelope.validate() {
        debug!(connection = %sender, error = %err, "invalid signal dropped");
        state.metrics.mark_signal_dropped();
        return Ok(());
    }
    // point-in-time partner check; a pair dissolved after this races
    // harmlessly into a delivery the peer's UI discards
    let partner = state.storage.pair_partner(sender).await?;
    if partner.as_deref() != Some(envelope.peer.as_str()) {
        debug!(
            connection = %sender,
            claimed = %envelope.peer,
            "signal for non-partner dropped"
        );
        state.metrics.mark_signal_dropped();
        return Ok(());
    }
    registry::deliver(
        state,
        &envelope.peer,
        FrameType::Signal,
        json!({
            "peer": sender,
            "signal": envelope.signal,
        }),
    )
    .await;
    state.metrics.mark_signal_relayed();
    Ok(())
}
