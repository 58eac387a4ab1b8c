use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::Arc;
use tokio::sync::Mutex;

const QUEUE_KEY: &str = "queue";
const PAIRS_KEY: &str = "pairs";
const BANNED_IPS_KEY: &str = "banned_ips";
const REPORTED_IPS_KEY: &str = "reported_ips";

/// Report lists expire this long after their latest append.
pub const REPORT_TTL_SECONDS: i64 = 86_400;

/// Cross-instance event delivery envelopes.
pub const EVENTS_CHANNEL: &str = "carousel:events";
/// Ban set mutations (cache invalidation + remote force-close).
pub const BANS_CHANNEL: &str = "carousel:bans";

#[derive(Debug)]
pub enum StorageError {
    Redis,
    Serialization,
    Missing,
}

impl Display for StorageError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Redis => write!(f, "redis failure"),
            Self::Serialization => write!(f, "serialization failure"),
            Self::Missing => write!(f, "missing record"),
        }
    }
}

impl Error for StorageError {}

/// Cluster-wide liveness record for one connection, written by the owning
/// instance under a short TTL and refreshed while the session is alive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteRecord {
    pub connection_id: String,
    pub instance: String,
    pub ip: String,
    pub since: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportRecord {
    pub reporter: String,
    pub reporter_ip: String,
    pub subject_ip: String,
    pub reason: String,
    pub reported_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BanRecord {
    pub ip: String,
    pub reason: String,
    pub banned_at: DateTime<Utc>,
}

fn route_key(connection_id: &str) -> String {
    format!("route:{}", connection_id)
}

fn reports_key(ip: &str) -> String {
    format!("reports:{}", ip)
}

fn ban_details_key(ip: &str) -> String {
    format!("ban_details:{}", ip)
}

pub struct Storage {
    client: redis::Client,
    redis: Arc<Mutex<redis::aio::MultiplexedConnection>>,
}

/// Establishes connectivity to the shared state store.
pub async fn connect(redis_url: &str) -> Result<Storage, StorageError> {
    let client = redis::Client::open(redis_url).map_err(|_| StorageError::Redis)?;
    let connection = client
        .get_multiplexed_async_connection()
        .await
        .map_err(|_| StorageError::Redis)?;
    Ok(Storage {
        client,
        redis: Arc::new(Mutex::new(connection)),
    })
}

impl Storage {
    /// Lightweight liveness probe.
    pub async fn readiness(&self) -> Result<(), StorageError> {
        let mut conn = self.redis.lock().await;
        let _: String = redis::cmd("PING")
            .query_async(&mut *conn)
            .await
            .map_err(|_| StorageError::Redis)?;
        Ok(())
    }

    // --- waiting queue ---

    /// Appends a connection id to the queue tail, removing any prior
    /// occurrence first. The remove+push pair is not atomic; a duplicate
    /// surviving the window is discarded by the validating pop.
    pub async fn queue_push(&self, connection_id: &str) -> Result<(), StorageError> {
        let mut conn = self.redis.lock().await;
        let _: () = redis::cmd("LREM")
            .arg(QUEUE_KEY)
            .arg(0)
            .arg(connection_id)
            .query_async(&mut *conn)
            .await
            .map_err(|_| StorageError::Redis)?;
        let _: () = redis::cmd("RPUSH")
            .arg(QUEUE_KEY)
            .arg(connection_id)
            .query_async(&mut *conn)
            .await
            .map_err(|_| StorageError::Redis)?;
        Ok(())
    }

    /// Removes every occurrence of a connection id. Idempotent.
    pub async fn queue_remove(&self, connection_id: &str) -> Result<(), StorageError> {
        let mut conn = self.redis.lock().await;
        let _: () = redis::cmd("LREM")
            .arg(QUEUE_KEY)
            .arg(0)
            .arg(connection_id)
            .query_async(&mut *conn)
            .await
            .map_err(|_| StorageError::Redis)?;
        Ok(())
    }

    /// Destructively pops the queue head. Destructive so that two racing
    /// matchers can never hand the same waiter to both callers.
    pub async fn queue_pop(&self) -> Result<Option<String>, StorageError> {
        let mut conn = self.redis.lock().await;
        redis::cmd("LPOP")
            .arg(QUEUE_KEY)
            .query_async::<Option<String>>(&mut *conn)
            .await
            .map_err(|_| StorageError::Redis)
    }

    pub async fn queue_len(&self) -> Result<usize, StorageError> {
        let mut conn = self.redis.lock().await;
        redis::cmd("LLEN")
            .arg(QUEUE_KEY)
            .query_async::<usize>(&mut *conn)
            .await
            .map_err(|_| StorageError::Redis)
    }

    pub async fn queue_entries(&self) -> Result<Vec<String>, StorageError> {
        let mut conn = self.redis.lock().await;
        redis::cmd("LRANGE")
            .arg(QUEUE_KEY)
            .arg(0)
            .arg(-1)
            .query_async::<Vec<String>>(&mut *conn)
            .await
            .map_err(|_| StorageError::Redis)
    }

    // --- pair registry ---

    /// Writes both directions of a pair in a single hash update.
    pub async fn pair_bind(&self, a: &str, b: &str) -> Result<(), StorageError> {
        let mut conn = self.redis.lock().await;
        let _: () = redis::cmd("HSET")
            .arg(PAIRS_KEY)
            .arg(a)
            .arg(b)
            .arg(b)
            .arg(a)
            .query_async(&mut *conn)
            .await
            .map_err(|_| StorageError::Redis)?;
        Ok(())
    }

    pub async fn pair_partner(&self, connection_id: &str) -> Result<Option<String>, StorageError> {
        let mut conn = self.redis.lock().await;
        redis::cmd("HGET")
            .arg(PAIRS_KEY)
            .arg(connection_id)
            .query_async::<Option<String>>(&mut *conn)
            .await
            .map_err(|_| StorageError::Redis)
    }

    /// Deletes both sides of the pair containing `connection_id`, returning
    /// the dissolved pair. Both fields go in one HDEL, so neither side can
    /// observe a half-deleted pair afterwards.
    pub async fn pair_dissolve(
        &self,
        connection_id: &str,
    ) -> Result<Option<(String, String)>, StorageError> {
        let mut conn = self.redis.lock().await;
        let partner: Option<String> = redis::cmd("HGET")
            .arg(PAIRS_KEY)
            .arg(connection_id)
            .query_async(&mut *conn)
            .await
            .map_err(|_| StorageError::Redis)?;
        let Some(partner) = partner else {
            return Ok(None);
        };
        let _: () = redis::cmd("HDEL")
            .arg(PAIRS_KEY)
            .arg(connection_id)
            .arg(&partner)
            .query_async(&mut *conn)
            .await
            .map_err(|_| StorageError::Redis)?;
        Ok(Some((connection_id.to_string(), partner)))
    }

    pub async fn pair_count(&self) -> Result<usize, StorageError> {
        let mut conn = self.redis.lock().await;
        let fields: usize = redis::cmd("HLEN")
            .arg(PAIRS_KEY)
            .query_async(&mut *conn)
            .await
            .map_err(|_| StorageError::Redis)?;
        Ok(fields / 2)
    }

    // --- connection routes ---

    /// Registers a liveness record for a connection under a TTL.
    pub async fn register_route(
        &self,
        record: &RouteRecord,
        ttl_seconds: i64,
    ) -> Result<(), StorageError> {
        let payload = serde_json::to_string(record).map_err(|_| StorageError::Serialization)?;
        let mut conn = self.redis.lock().await;
        let _: () = redis::cmd("SETEX")
            .arg(route_key(&record.connection_id))
            .arg(ttl_seconds.max(1) as usize)
            .arg(payload)
            .query_async(&mut *conn)
            .await
            .map_err(|_| StorageError::Redis)?;
        Ok(())
    }

    pub async fn read_route(
        &self,
        connection_id: &str,
    ) -> Result<Option<RouteRecord>, StorageError> {
        let mut conn = self.redis.lock().await;
        let value: Option<String> = redis::cmd("GET")
            .arg(route_key(connection_id))
            .query_async(&mut *conn)
            .await
            .map_err(|_| StorageError::Redis)?;
        match value {
            Some(json) => serde_json::from_str(&json)
                .map(Some)
                .map_err(|_| StorageError::Serialization),
            None => Ok(None),
        }
    }

    /// Cluster-wide presence check used to discard stale queue entries.
    pub async fn route_exists(&self, connection_id: &str) -> Result<bool, StorageError> {
        let mut conn = self.redis.lock().await;
        redis::cmd("EXISTS")
            .arg(route_key(connection_id))
            .query_async::<bool>(&mut *conn)
            .await
            .map_err(|_| StorageError::Redis)
    }

    pub async fn clear_route(&self, connection_id: &str) -> Result<(), StorageError> {
        let mut conn = self.redis.lock().await;
        let _: () = redis::cmd("DEL")
            .arg(route_key(connection_id))
            .query_async(&mut *conn)
            .await
            .map_err(|_| StorageError::Redis)?;
        Ok(())
    }

    // --- ban set ---

    pub async fn ban_add(&self, record: &BanRecord) -> Result<(), StorageError> {
        let mut conn = self.redis.lock().await;
        let _: () = redis::cmd("SADD")
            .arg(BANNED_IPS_KEY)
            .arg(&record.ip)
            .query_async(&mut *conn)
            .await
            .map_err(|_| StorageError::Redis)?;
        let _: () = redis::cmd("HSET")
            .arg(ban_details_key(&record.ip))
            .arg("reason")
            .arg(&record.reason)
            .arg("timestamp")
            .arg(record.banned_at.to_rfc3339())
            .query_async(&mut *conn)
            .await
            .map_err(|_| StorageError::Redis)?;
        Ok(())
    }

    pub async fn ban_remove(&self, ip: &str) -> Result<(), StorageError> {
        let mut conn = self.redis.lock().await;
        let _: () = redis::cmd("SREM")
            .arg(BANNED_IPS_KEY)
            .arg(ip)
            .query_async(&mut *conn)
            .await
            .map_err(|_| StorageError::Redis)?;
        let _: () = redis::cmd("DEL")
            .arg(ban_details_key(ip))
            .query_async(&mut *conn)
            .await
            .map_err(|_| StorageError::Redis)?;
        Ok(())
    }

    pub async fn ban_members(&self) -> Result<HashSet<String>, StorageError> {
        let mut conn = self.redis.lock().await;
        let members: Vec<String> = redis::cmd("SMEMBERS")
            .arg(BANNED_IPS_KEY)
            .query_async(&mut *conn)
            .await
            .map_err(|_| StorageError::Redis)?;
        Ok(members.into_iter().collect())
    }

    pub async fn ban_details(&self, ip: &str) -> Result<Option<BanRecord>, StorageError> {
        let mut conn = self.redis.lock().await;
        let fields: Vec<(String, String)> = redis::cmd("HGETALL")
            .arg(ban_details_key(ip))
            .query_async(&mut *conn)
            .await
            .map_err(|_| StorageError::Redis)?;
        if fields.is_empty() {
            return Ok(None);
        }
        let mut reason = String::new();
        let mut banned_at = Utc::now();
        for (field, value) in fields {
            match field.as_str() {
                "reason" => reason = value,
                "timestamp" => {
                    banned_at = DateTime::parse_from_rfc3339(&value)
                        .map_err(|_| StorageError::Serialization)?
                        .with_timezone(&Utc);
                }
                _ => {}
            }
        }
        Ok(Some(BanRecord {
            ip: ip.to_string(),
            reason,
            banned_at,
        }))
    }

    pub async fn ban_list(&self) -> Result<Vec<BanRecord>, StorageError> {
        let members = self.ban_members().await?;
        let mut records = Vec::with_capacity(members.len());
        for ip in members {
            match self.ban_details(&ip).await? {
                Some(record) => records.push(record),
                None => records.push(BanRecord {
                    ip,
                    reason: String::new(),
                    banned_at: Utc::now(),
                }),
            }
        }
        records.sort_by(|a, b| a.ip.cmp(&b.ip));
        Ok(records)
    }

    // --- report log ---

    /// Appends a report to the subject's list, resets the window TTL and
    /// returns the new list length.
    pub async fn report_append(&self, record: &ReportRecord) -> Result<usize, StorageError> {
        let payload = serde_json::to_string(record).map_err(|_| StorageError::Serialization)?;
        let key = reports_key(&record.subject_ip);
        let mut conn = self.redis.lock().await;
        let length: usize = redis::cmd("RPUSH")
            .arg(&key)
            .arg(payload)
            .query_async(&mut *conn)
            .await
            .map_err(|_| StorageError::Redis)?;
        let _: () = redis::cmd("EXPIRE")
            .arg(&key)
            .arg(REPORT_TTL_SECONDS)
            .query_async(&mut *conn)
            .await
            .map_err(|_| StorageError::Redis)?;
        let _: () = redis::cmd("SADD")
            .arg(REPORTED_IPS_KEY)
            .arg(&record.subject_ip)
            .query_async(&mut *conn)
            .await
            .map_err(|_| StorageError::Redis)?;
        Ok(length)
    }

    pub async fn reports_for(&self, ip: &str) -> Result<Vec<ReportRecord>, StorageError> {
        let mut conn = self.redis.lock().await;
        let entries: Vec<String> = redis::cmd("LRANGE")
            .arg(reports_key(ip))
            .arg(0)
            .arg(-1)
            .query_async(&mut *conn)
            .await
            .map_err(|_| StorageError::Redis)?;
        let mut records = Vec::with_capacity(entries.len());
        for entry in entries {
            records.push(serde_json::from_str(&entry).map_err(|_| StorageError::Serialization)?);
        }
        Ok(records)
    }

    /// Subject IPs with a live report list. Entries whose list expired are
    /// pruned from the index as a side effect.
    pub async fn reported_ips(&self) -> Result<Vec<String>, StorageError> {
        let members: Vec<String> = {
            let mut conn = self.redis.lock().await;
            redis::cmd("SMEMBERS")
                .arg(REPORTED_IPS_KEY)
                .query_async(&mut *conn)
                .await
                .map_err(|_| StorageError::Redis)?
        };
        let mut live = Vec::with_capacity(members.len());
        for ip in members {
            let mut conn = self.redis.lock().await;
            let exists: bool = redis::cmd("EXISTS")
                .arg(reports_key(&ip))
                .query_async(&mut *conn)
                .await
                .map_err(|_| StorageError::Redis)?;
            if exists {
                live.push(ip);
            } else {
                let _: () = redis::cmd("SREM")
                    .arg(REPORTED_IPS_KEY)
                    .arg(&ip)
                    .query_async(&mut *conn)
                    .await
                    .map_err(|_| StorageError::Redis)?;
            }
        }
        live.sort();
        Ok(live)
    }

    pub async fn clear_reports(&self, ip: &str) -> Result<(), StorageError> {
        let mut conn = self.redis.lock().await;
        let _: () = redis::cmd("DEL")
            .arg(reports_key(ip))
            .query_async(&mut *conn)
            .await
            .map_err(|_| StorageError::Redis)?;
        let _: () = redis::cmd("SREM")
            .arg(REPORTED_IPS_KEY)
            .arg(ip)
            .query_async(&mut *conn)
            .await
            .map_err(|_| StorageError::Redis)?;
        Ok(())
    }

    pub async fn clear_all_reports(&self) -> Result<usize, StorageError> {
        let subjects = self.reported_ips().await?;
        let cleared = subjects.len();
        for ip in subjects {
            self.clear_reports(&ip).await?;
        }
        Ok(cleared)
    }

    // --- pub/sub bus ---

    pub async fn publish(&self, channel: &str, payload: &str) -> Result<(), StorageError> {
        let mut conn = self.redis.lock().await;
        let _: () = redis::cmd("PUBLISH")
            .arg(channel)
            .arg(payload)
            .query_async(&mut *conn)
            .await
            .map_err(|_| StorageError::Redis)?;
        Ok(())
    }

    /// Opens a dedicated subscriber connection. Pub/sub connections cannot
    /// multiplex commands, so this is separate from the shared handle.
    pub async fn subscriber(&self) -> Result<redis::aio::PubSub, StorageError> {
        self.client
            .get_async_pubsub()
            .await
            .map_err(|_| StorageError::Redis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use futures_util::StreamExt;
    use std::time::Duration as StdDuration;

    #[test]
    fn key_builders() {
        assert_eq!(route_key("conn-1"), "route:conn-1");
        assert_eq!(reports_key("203.0.113.9"), "reports:203.0.113.9");
        assert_eq!(ban_details_key("203.0.113.9"), "ban_details:203.0.113.9");
    }

    #[test]
    fn report_record_roundtrip() {
        let record = ReportRecord {
            reporter: "conn-a".to_string(),
            reporter_ip: "198.51.100.1".to_string(),
            subject_ip: "203.0.113.9".to_string(),
            reason: "abuse".to_string(),
            reported_at: Utc::now(),
        };
        let json = serde_json::to_string(&record).unwrap();
        let decoded: ReportRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, record);
    }

    #[test]
    fn route_record_roundtrip() {
        let record = RouteRecord {
            connection_id: "conn-a".to_string(),
            instance: "instance-1".to_string(),
            ip: "198.51.100.1".to_string(),
            since: Utc::now(),
        };
        let json = serde_json::to_string(&record).unwrap();
        let decoded: RouteRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, record);
    }

    async fn test_storage() -> Option<Storage> {
        let url = match std::env::var("CAROUSEL_TEST_REDIS_URL") {
            Ok(value) => value,
            Err(_) => {
                eprintln!("skipping: CAROUSEL_TEST_REDIS_URL not set");
                return None;
            }
        };
        Some(connect(&url).await.expect("redis connection"))
    }

    #[tokio::test]
    async fn queue_is_fifo_and_deduplicated() -> Result<(), Box<dyn std::error::Error>> {
        let Some(storage) = test_storage().await else {
            return Ok(());
        };
        while storage.queue_pop().await?.is_some() {}
        let suffix = Utc::now().timestamp_nanos_opt().unwrap_or_default();
        let a = format!("qa-{}", suffix);
        let b = format!("qb-{}", suffix);
        storage.queue_push(&a).await?;
        storage.queue_push(&b).await?;
        // re-push moves to the tail instead of duplicating
        storage.queue_push(&a).await?;
        let entries = storage.queue_entries().await?;
        assert_eq!(entries.iter().filter(|e| **e == a).count(), 1);
        let first = storage.queue_pop().await?;
        assert_eq!(first.as_deref(), Some(b.as_str()));
        let second = storage.queue_pop().await?;
        assert_eq!(second.as_deref(), Some(a.as_str()));
        storage.queue_remove(&a).await?;
        storage.queue_remove(&b).await?;
        Ok(())
    }

    #[tokio::test]
    async fn pair_bind_is_symmetric_and_dissolves_atomically()
    -> Result<(), Box<dyn std::error::Error>> {
        let Some(storage) = test_storage().await else {
            return Ok(());
        };
        let suffix = Utc::now().timestamp_nanos_opt().unwrap_or_default();
        let a = format!("pa-{}", suffix);
        let b = format!("pb-{}", suffix);
        storage.pair_bind(&a, &b).await?;
        assert_eq!(storage.pair_partner(&a).await?.as_deref(), Some(b.as_str()));
        assert_eq!(storage.pair_partner(&b).await?.as_deref(), Some(a.as_str()));
        let dissolved = storage.pair_dissolve(&b).await?.expect("pair present");
        assert_eq!(dissolved, (b.clone(), a.clone()));
        assert!(storage.pair_partner(&a).await?.is_none());
        assert!(storage.pair_partner(&b).await?.is_none());
        assert!(storage.pair_dissolve(&a).await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn route_records_roundtrip_and_expire_by_ttl()
    -> Result<(), Box<dyn std::error::Error>> {
        let Some(storage) = test_storage().await else {
            return Ok(());
        };
        let suffix = Utc::now().timestamp_nanos_opt().unwrap_or_default();
        let record = RouteRecord {
            connection_id: format!("rt-{}", suffix),
            instance: "test-instance".to_string(),
            ip: "198.51.100.7".to_string(),
            since: Utc::now(),
        };
        storage.register_route(&record, 30).await?;
        assert!(storage.route_exists(&record.connection_id).await?);
        let loaded = storage
            .read_route(&record.connection_id)
            .await?
            .expect("route present");
        assert_eq!(loaded.ip, record.ip);
        storage.clear_route(&record.connection_id).await?;
        assert!(!storage.route_exists(&record.connection_id).await?);
        Ok(())
    }

    #[tokio::test]
    async fn ban_set_and_report_log_roundtrip() -> Result<(), Box<dyn std::error::Error>> {
        let Some(storage) = test_storage().await else {
            return Ok(());
        };
        let suffix = Utc::now().timestamp_nanos_opt().unwrap_or_default();
        let ip = format!("203.0.113.{}", suffix % 250);
        let ban = BanRecord {
            ip: ip.clone(),
            reason: "test ban".to_string(),
            banned_at: Utc::now() - Duration::seconds(1),
        };
        storage.ban_add(&ban).await?;
        assert!(storage.ban_members().await?.contains(&ip));
        let details = storage.ban_details(&ip).await?.expect("details present");
        assert_eq!(details.reason, "test ban");
        storage.ban_remove(&ip).await?;
        assert!(!storage.ban_members().await?.contains(&ip));
        assert!(storage.ban_details(&ip).await?.is_none());

        storage.clear_reports(&ip).await?;
        for index in 0..3 {
            let count = storage
                .report_append(&ReportRecord {
                    reporter: format!("conn-{}", index),
                    reporter_ip: "198.51.100.1".to_string(),
                    subject_ip: ip.clone(),
                    reason: "spam".to_string(),
                    reported_at: Utc::now(),
                })
                .await?;
            assert_eq!(count, index + 1);
        }
        let reports = storage.reports_for(&ip).await?;
        assert_eq!(reports.len(), 3);
        assert!(storage.reported_ips().await?.contains(&ip));
        storage.clear_reports(&ip).await?;
        assert!(storage.reports_for(&ip).await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn publish_reaches_subscriber() -> Result<(), Box<dyn std::error::Error>> {
        let Some(storage) = test_storage().await else {
            return Ok(());
        };
        let suffix = Utc::now().timestamp_nanos_opt().unwrap_or_default();
        let channel = format!("carousel:test:{}", suffix);
        let mut subscriber = storage.subscriber().await?;
        subscriber.subscribe(&channel).await?;
        storage.publish(&channel, "hello").await?;
        let message = tokio::time::timeout(StdDuration::from_secs(5), async {
            subscriber.on_message().next().await
        })
        .await?
        .expect("message");
        let payload: String = message.get_payload()?;
        assert_eq!(payload, "hello");
        Ok(())
    }
}
