use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Default)]
pub struct Metrics {
    connections_active: AtomicU64,
    events_ingress: AtomicU64,
    events_egress: AtomicU64,
    matches_made: AtomicU64,
    pairs_dissolved: AtomicU64,
    signals_relayed: AtomicU64,
    signals_dropped: AtomicU64,
    queue_stale_discarded: AtomicU64,
    reports_filed: AtomicU64,
    bans_issued: AtomicU64,
    fanout_published: AtomicU64,
    fanout_received: AtomicU64,
    http_rate_limited: AtomicU64,
    connect_rate_limited: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr_connections(&self) {
        self.connections_active.fetch_add(1, Ordering::SeqCst);
    }

    pub fn decr_connections(&self) {
        self.connections_active.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn mark_ingress(&self) {
        self.events_ingress.fetch_add(1, Ordering::SeqCst);
    }

    pub fn mark_egress(&self) {
        self.events_egress.fetch_add(1, Ordering::SeqCst);
    }

    pub fn mark_match(&self) {
        self.matches_made.fetch_add(1, Ordering::SeqCst);
    }

    pub fn mark_dissolved(&self) {
        self.pairs_dissolved.fetch_add(1, Ordering::SeqCst);
    }

    pub fn mark_signal_relayed(&self) {
        self.signals_relayed.fetch_add(1, Ordering::SeqCst);
    }

    pub fn mark_signal_dropped(&self) {
        self.signals_dropped.fetch_add(1, Ordering::SeqCst);
    }

    pub fn mark_stale_discard(&self) {
        self.queue_stale_discarded.fetch_add(1, Ordering::SeqCst);
    }

    pub fn mark_report(&self) {
        self.reports_filed.fetch_add(1, Ordering::SeqCst);
    }

    pub fn mark_ban(&self) {
        self.bans_issued.fetch_add(1, Ordering::SeqCst);
    }

    pub fn mark_fanout_published(&self) {
        self.fanout_published.fetch_add(1, Ordering::SeqCst);
    }

    pub fn mark_fanout_received(&self) {
        self.fanout_received.fetch_add(1, Ordering::SeqCst);
    }

    pub fn mark_http_rate_limited(&self) {
        self.http_rate_limited.fetch_add(1, Ordering::SeqCst);
    }

    pub fn mark_connect_rate_limited(&self) {
        self.connect_rate_limited.fetch_add(1, Ordering::SeqCst);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connections_active: self.connections_active.load(Ordering::SeqCst),
            events_ingress: self.events_ingress.load(Ordering::SeqCst),
            events_egress: self.events_egress.load(Ordering::SeqCst),
            matches_made: self.matches_made.load(Ordering::SeqCst),
            pairs_dissolved: self.pairs_dissolved.load(Ordering::SeqCst),
            signals_relayed: self.signals_relayed.load(Ordering::SeqCst),
            signals_dropped: self.signals_dropped.load(Ordering::SeqCst),
            queue_stale_discarded: self.queue_stale_discarded.load(Ordering::SeqCst),
            reports_filed: self.reports_filed.load(Ordering::SeqCst),
            bans_issued: self.bans_issued.load(Ordering::SeqCst),
            fanout_published: self.fanout_published.load(Ordering::SeqCst),
            fanout_received: self.fanout_received.load(Ordering::SeqCst),
            http_rate_limited: self.http_rate_limited.load(Ordering::SeqCst),
            connect_rate_limited: self.connect_rate_limited.load(Ordering::SeqCst),
        }
    }

    pub fn encode_prometheus(&self) -> String {
        let snapshot = self.snapshot();
        format!(
            "# TYPE carousel_connections_active gauge\ncarousel_connections_active {}\n# TYPE carousel_events_ingress counter\ncarousel_events_ingress {}\n# TYPE carousel_events_egress counter\ncarousel_events_egress {}\n# TYPE carousel_matches_made counter\ncarousel_matches_made {}\n# TYPE carousel_pairs_dissolved counter\ncarousel_pairs_dissolved {}\n# TYPE carousel_signals_relayed counter\ncarousel_signals_relayed {}\n# TYPE carousel_signals_dropped counter\ncarousel_signals_dropped {}\n# TYPE carousel_queue_stale_discarded counter\ncarousel_queue_stale_discarded {}\n# TYPE carousel_reports_filed counter\ncarousel_reports_filed {}\n# TYPE carousel_bans_issued counter\ncarousel_bans_issued {}\n# TYPE carousel_fanout_published counter\ncarousel_fanout_published {}\n# TYPE carousel_fanout_received counter\ncarousel_fanout_received {}\n# TYPE carousel_http_rate_limited counter\ncarousel_http_rate_limited {}\n# TYPE carousel_connect_rate_limited counter\ncarousel_connect_rate_limited {}\n",
            snapshot.connections_active,
            snapshot.events_ingress,
            snapshot.events_egress,
            snapshot.matches_made,
            snapshot.pairs_dissolved,
            snapshot.signals_relayed,
            snapshot.signals_dropped,
            snapshot.queue_stale_discarded,
            snapshot.reports_filed,
            snapshot.bans_issued,
            snapshot.fanout_published,
            snapshot.fanout_received,
            snapshot.http_rate_limited,
            snapshot.connect_rate_limited,
        )
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub connections_active: u64,
    pub events_ingress: u64,
    pub events_egress: u64,
    pub matches_made: u64,
    pub pairs_dissolved: u64,
    pub signals_relayed: u64,
    pub signals_dropped: u64,
    pub queue_stale_discarded: u64,
    pub reports_filed: u64,
    pub bans_issued: u64,
    pub fanout_published: u64,
    pub fanout_received: u64,
    pub http_rate_limited: u64,
    pub connect_rate_limited: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prometheus_encoding_reflects_counters() {
        let metrics = Metrics::new();
        metrics.incr_connections();
        metrics.mark_match();
        metrics.mark_match();
        let encoded = metrics.encode_prometheus();
        assert!(encoded.contains("carousel_connections_active 1"));
        assert!(encoded.contains("carousel_matches_made 2"));
    }

    #[test]
    fn snapshot_tracks_gauge_decrement() {
        let metrics = Metrics::new();
        metrics.incr_connections();
        metrics.incr_connections();
        metrics.decr_connections();
        assert_eq!(metrics.snapshot().connections_active, 1);
    }
}
