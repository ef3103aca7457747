use std::collections::HashMap;
use std::sync::Arc;

use agora_x402::sha256_hex;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;

/// Cached response for one `{scope, actor, idempotency key}` triple.
#[derive(Debug, Clone)]
pub struct IdempotencyRecord {
    pub request_hash: String,
    pub status: u16,
    pub body: Vec<u8>,
    pub headers: Vec<(String, String)>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub enum IdempotencyLookup {
    Miss,
    Replay(IdempotencyRecord),
    Conflict,
}

/// Replay-safe request cache. A key re-seen with the same request hash
/// replays the stored response byte-for-byte; a different hash is a conflict.
/// Entries expire after the configured TTL and are pruned lazily on access.
#[derive(Clone, Default)]
pub struct IdempotencyStore {
    entries: Arc<Mutex<HashMap<String, IdempotencyRecord>>>,
}

impl IdempotencyStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lookup(
        &self,
        scope: &str,
        actor: &str,
        key: &str,
        request_hash: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> IdempotencyLookup {
        let entry_key = entry_key(scope, actor, key);

        let mut entries = self.entries.lock().await;
        entries.retain(|_, record| now - record.created_at < ttl);

        match entries.get(&entry_key) {
            None => IdempotencyLookup::Miss,
            Some(record) if record.request_hash == request_hash => {
                IdempotencyLookup::Replay(record.clone())
            }
            Some(_) => IdempotencyLookup::Conflict,
        }
    }

    pub async fn save(&self, scope: &str, actor: &str, key: &str, record: IdempotencyRecord) {
        let entry_key = entry_key(scope, actor, key);
        let mut entries = self.entries.lock().await;
        entries.insert(entry_key, record);
    }
}

/// Request hash used for conflict detection: SHA-256 over the raw body bytes.
#[must_use]
pub fn request_hash(body: &[u8]) -> String {
    sha256_hex(body)
}

fn entry_key(scope: &str, actor: &str, key: &str) -> String {
    format!("{scope}\n{actor}\n{key}")
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};

    use super::{IdempotencyLookup, IdempotencyRecord, IdempotencyStore, request_hash};

    const SCOPE: &str = "marketplace:runs:write";

    fn record(hash: &str, now: chrono::DateTime<Utc>) -> IdempotencyRecord {
        IdempotencyRecord {
            request_hash: hash.to_string(),
            status: 201,
            body: br#"{"run":{"id":"run_1"}}"#.to_vec(),
            headers: vec![("content-type".to_string(), "application/json".to_string())],
            created_at: now,
        }
    }

    #[tokio::test]
    async fn replays_matching_request_hash_and_conflicts_on_mismatch() {
        let store = IdempotencyStore::new();
        let now = Utc::now();
        let ttl = Duration::hours(24);
        let hash = request_hash(b"{\"action\":\"swap\"}");

        let miss = store
            .lookup(SCOPE, "0xoperator", "key-1", &hash, ttl, now)
            .await;
        assert!(matches!(miss, IdempotencyLookup::Miss));

        store
            .save(SCOPE, "0xoperator", "key-1", record(&hash, now))
            .await;

        let replay = store
            .lookup(SCOPE, "0xoperator", "key-1", &hash, ttl, now)
            .await;
        match replay {
            IdempotencyLookup::Replay(stored) => {
                assert_eq!(stored.status, 201);
                assert_eq!(stored.body, br#"{"run":{"id":"run_1"}}"#.to_vec());
            }
            other => panic!("expected replay, got {other:?}"),
        }

        let other_hash = request_hash(b"{\"action\":\"stake\"}");
        let conflict = store
            .lookup(SCOPE, "0xoperator", "key-1", &other_hash, ttl, now)
            .await;
        assert!(matches!(conflict, IdempotencyLookup::Conflict));
    }

    #[tokio::test]
    async fn keys_are_scoped_per_actor() {
        let store = IdempotencyStore::new();
        let now = Utc::now();
        let ttl = Duration::hours(24);
        let hash = request_hash(b"body");

        store
            .save(SCOPE, "0xoperator", "key-1", record(&hash, now))
            .await;

        let other = store
            .lookup(SCOPE, "0xrival", "key-1", &hash, ttl, now)
            .await;
        assert!(matches!(other, IdempotencyLookup::Miss));
    }

    #[tokio::test]
    async fn expired_records_are_pruned_on_lookup() {
        let store = IdempotencyStore::new();
        let now = Utc::now();
        let ttl = Duration::hours(24);
        let hash = request_hash(b"body");

        store
            .save(SCOPE, "0xoperator", "key-1", record(&hash, now))
            .await;

        let later = now + Duration::hours(25);
        let lookup = store
            .lookup(SCOPE, "0xoperator", "key-1", &hash, ttl, later)
            .await;
        assert!(matches!(lookup, IdempotencyLookup::Miss));
        assert!(store.entries.lock().await.is_empty());
    }
}
