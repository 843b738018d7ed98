//! etcd window store for `courier` (companion crate).
//! Bring your own `etcd_client::Client`; window logs are stored as JSON under a prefix and
//! committed with revision-guarded transactions.
//!
//! Wrap the store in [`courier::rate_limit::store::OptimisticCounterStore`] to get an atomic
//! counter store shared by every process that points at the same etcd cluster and prefix.

use async_trait::async_trait;
use courier::error::StoreError;
use courier::rate_limit::store::{Versioned, WindowLog, WindowStore};
use etcd_client::{Compare, CompareOp, PutOptions, Txn, TxnOp};
use std::time::Duration;

/// Rejected key prefix.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PrefixError {
    #[error("prefix cannot be empty")]
    Empty,
    #[error("prefix cannot contain control characters")]
    ControlCharacter,
}

#[derive(Clone)]
pub struct EtcdWindowStore {
    prefix: String,
    client: etcd_client::Client,
}

impl std::fmt::Debug for EtcdWindowStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EtcdWindowStore")
            .field("prefix", &self.prefix)
            .field("client", &"<etcd_client::Client>")
            .finish()
    }
}

impl EtcdWindowStore {
    /// Create a store using an existing etcd client; limiter keys map to `prefix/<key>`.
    ///
    /// # Errors
    /// Returns `Err` if the prefix is empty or contains control characters.
    pub fn new(
        prefix: impl Into<String>,
        client: etcd_client::Client,
    ) -> Result<Self, PrefixError> {
        let prefix: String = prefix.into();
        let prefix = prefix.trim().trim_end_matches('/').to_string();

        if prefix.is_empty() {
            return Err(PrefixError::Empty);
        }
        if prefix.chars().any(|c| c.is_control()) {
            return Err(PrefixError::ControlCharacter);
        }

        Ok(Self { prefix, client })
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn etcd_key(&self, key: &str) -> String {
        format!("{}/{}", self.prefix, key)
    }
}

fn unavailable(err: etcd_client::Error) -> StoreError {
    StoreError::unavailable(err)
}

/// Lease TTL in whole seconds that outlives `ttl`.
fn lease_seconds(ttl: Duration) -> i64 {
    i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX).saturating_add(1)
}

#[async_trait]
impl WindowStore for EtcdWindowStore {
    async fn load(&self, key: &str) -> Result<Option<Versioned<WindowLog>>, StoreError> {
        let mut client = self.client.clone();
        let etcd_key = self.etcd_key(key);
        let resp = client.get(etcd_key.as_str(), None).await.map_err(unavailable)?;

        let Some(kv) = resp.kvs().first() else {
            return Ok(None);
        };
        let value: WindowLog = serde_json::from_slice(kv.value()).map_err(|e| {
            StoreError::Corrupt(format!("window log at '{}' is not valid JSON: {}", etcd_key, e))
        })?;
        let version = u64::try_from(kv.mod_revision()).map_err(|_| {
            StoreError::Corrupt(format!("negative mod_revision for '{}'", etcd_key))
        })?;
        Ok(Some(Versioned { value, version }))
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<u64>,
        log: &WindowLog,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let mut client = self.client.clone();
        let etcd_key = self.etcd_key(key);
        let body = serde_json::to_vec(log)
            .map_err(|e| StoreError::Corrupt(format!("cannot encode window log: {}", e)))?;

        let guard = match expected {
            Some(version) => {
                let revision = i64::try_from(version).map_err(|_| {
                    StoreError::Corrupt(format!("revision {} out of range", version))
                })?;
                Compare::mod_revision(etcd_key.as_str(), CompareOp::Equal, revision)
            }
            None => Compare::create_revision(etcd_key.as_str(), CompareOp::Equal, 0),
        };
        // Each write renews the key's lease, so idle buckets disappear from etcd.
        let lease =
            client.lease_grant(lease_seconds(ttl), None).await.map_err(unavailable)?.id();
        let put = PutOptions::new().with_lease(lease);
        let txn = Txn::new()
            .when(vec![guard])
            .and_then(vec![TxnOp::put(etcd_key.as_str(), body, Some(put))]);

        let resp = client.txn(txn).await.map_err(unavailable)?;
        if !resp.succeeded() {
            tracing::trace!(
                target: "courier::etcd",
                key = %etcd_key,
                ?expected,
                "revision moved; transaction not applied"
            );
        }
        Ok(resp.succeeded())
    }
}
