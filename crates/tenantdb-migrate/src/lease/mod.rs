//! Distributed lease over a managed schema.
//!
//! Before touching a schema, an instance must hold the lease row for it in
//! the control table. Acquisition is a two-step protocol against the
//! executor:
//!
//! 1. Try to insert a fresh lease row. A uniqueness conflict means some
//!    row (live or stale) already exists.
//! 2. Row-lock the existing row, then conditionally update it: the update
//!    succeeds only if the row is expired or already owned by this
//!    instance. The row lock serializes competing takeover attempts so
//!    exactly one of N concurrent instances wins.
//!
//! When the holder is live, acquisition retries with exponential backoff up
//! to a bounded attempt count and then fails with the holder's identity,
//! rather than spinning until the caller gives up.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::adapter::{Lease, SchemaExecutor};
use crate::error::{MigrateError, Result};

/// Bounded retry policy for lease acquisition.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total acquisition attempts before giving up.
    pub max_attempts: u32,
    /// Sleep before the second attempt.
    pub initial_backoff: Duration,
    /// Backoff growth factor between attempts.
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(200),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Backoff to sleep after the given zero-based attempt.
    fn backoff(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.powi(attempt as i32);
        self.initial_backoff.mul_f64(factor)
    }
}

/// Acquires and renews leases for one instance.
///
/// The owner identity is a random UUID per manager plus the host name, so
/// log lines and `LeaseDenied` errors name the competing instance.
pub struct LeaseManager {
    executor: Arc<dyn SchemaExecutor>,
    admin_schema: String,
    owner_id: Uuid,
    owner_host: String,
    ttl: chrono::Duration,
    retry: RetryPolicy,
}

impl LeaseManager {
    pub fn new(
        executor: Arc<dyn SchemaExecutor>,
        admin_schema: impl Into<String>,
        ttl: Duration,
        retry: RetryPolicy,
    ) -> Self {
        let owner_host = sysinfo::System::host_name().unwrap_or_else(|| "unknown-host".into());
        Self {
            executor,
            admin_schema: admin_schema.into(),
            owner_id: Uuid::new_v4(),
            owner_host,
            ttl: chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::seconds(60)),
            retry,
        }
    }

    pub fn owner_id(&self) -> Uuid {
        self.owner_id
    }

    fn fresh_lease(&self, schema: &str) -> Lease {
        Lease {
            schema_name: schema.to_string(),
            owner_host: self.owner_host.clone(),
            owner_id: self.owner_id,
            lease_until: Utc::now() + self.ttl,
        }
    }

    /// Acquire the lease for `schema`, retrying per the policy while a
    /// competitor holds it.
    pub async fn acquire(&self, schema: &str) -> Result<LeaseGuard> {
        let mut attempt = 0u32;
        loop {
            let lease = self.fresh_lease(schema);
            if self
                .executor
                .try_insert_lease(&self.admin_schema, &lease)
                .await?
            {
                info!(schema, owner = %self.owner_id, "lease acquired (fresh row)");
                return Ok(self.guard(lease));
            }
            if self
                .executor
                .try_takeover_lease(&self.admin_schema, &lease)
                .await?
            {
                info!(schema, owner = %self.owner_id, "lease acquired (takeover)");
                return Ok(self.guard(lease));
            }

            let holder = self.executor.read_lease(&self.admin_schema, schema).await?;
            attempt += 1;
            if attempt >= self.retry.max_attempts {
                let (holder_name, until) = match holder {
                    Some(l) => (l.owner_host, l.lease_until),
                    None => ("unknown".to_string(), Utc::now()),
                };
                return Err(MigrateError::LeaseDenied {
                    schema: schema.to_string(),
                    holder: holder_name,
                    until,
                });
            }
            let backoff = self.retry.backoff(attempt - 1);
            debug!(
                schema,
                attempt,
                backoff_ms = backoff.as_millis() as u64,
                "lease held by another instance, backing off"
            );
            tokio::time::sleep(backoff).await;
        }
    }

    fn guard(&self, lease: Lease) -> LeaseGuard {
        LeaseGuard {
            executor: Arc::clone(&self.executor),
            admin_schema: self.admin_schema.clone(),
            schema: lease.schema_name.clone(),
            owner_id: self.owner_id,
            owner_host: self.owner_host.clone(),
            ttl: self.ttl,
            renewed_at: Utc::now(),
        }
    }
}

/// A held lease. Renew it at least every half TTL while working; release
/// it when done. Dropping the guard without releasing leaves the row to
/// expire on its own, which the takeover path handles.
pub struct LeaseGuard {
    executor: Arc<dyn SchemaExecutor>,
    admin_schema: String,
    schema: String,
    owner_id: Uuid,
    owner_host: String,
    ttl: chrono::Duration,
    renewed_at: DateTime<Utc>,
}

impl std::fmt::Debug for LeaseGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaseGuard")
            .field("schema", &self.schema)
            .field("owner_id", &self.owner_id)
            .field("renewed_at", &self.renewed_at)
            .finish()
    }
}

impl LeaseGuard {
    pub fn schema(&self) -> &str {
        &self.schema
    }

    pub fn owner_id(&self) -> Uuid {
        self.owner_id
    }

    /// Push the expiry forward a full TTL. Failure is fatal to the run:
    /// it means the row was taken over and this instance no longer owns
    /// the schema.
    pub async fn renew(&mut self) -> Result<()> {
        let lease = Lease {
            schema_name: self.schema.clone(),
            owner_host: self.owner_host.clone(),
            owner_id: self.owner_id,
            lease_until: Utc::now() + self.ttl,
        };
        if self
            .executor
            .try_takeover_lease(&self.admin_schema, &lease)
            .await?
        {
            self.renewed_at = Utc::now();
            debug!(schema = %self.schema, "lease renewed");
            Ok(())
        } else {
            let holder = self
                .executor
                .read_lease(&self.admin_schema, &self.schema)
                .await?;
            let (holder_name, until) = match holder {
                Some(l) => (l.owner_host, l.lease_until),
                None => ("unknown".to_string(), Utc::now()),
            };
            warn!(schema = %self.schema, holder = %holder_name, "lease lost");
            Err(MigrateError::LeaseDenied {
                schema: self.schema.clone(),
                holder: holder_name,
                until,
            })
        }
    }

    /// Renew only if more than half the TTL has elapsed since the last
    /// renewal. Cheap enough to call between every object.
    pub async fn maybe_renew(&mut self) -> Result<()> {
        if Utc::now() - self.renewed_at >= self.ttl / 2 {
            self.renew().await?;
        }
        Ok(())
    }

    /// Delete the lease row. Returns false if the row was no longer ours,
    /// which can happen after an expiry and takeover.
    pub async fn release(self) -> Result<bool> {
        let released = self
            .executor
            .release_lease(&self.admin_schema, &self.schema, self.owner_id)
            .await?;
        if released {
            info!(schema = %self.schema, "lease released");
        } else {
            warn!(schema = %self.schema, "lease row was not ours at release");
        }
        Ok(released)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::MemoryAdapter;

    fn manager(executor: Arc<dyn SchemaExecutor>, ttl: Duration) -> LeaseManager {
        LeaseManager::new(
            executor,
            "fhir_admin",
            ttl,
            RetryPolicy {
                max_attempts: 3,
                initial_backoff: Duration::from_millis(5),
                multiplier: 2.0,
            },
        )
    }

    #[tokio::test]
    async fn test_acquire_release() {
        let adapter: Arc<dyn SchemaExecutor> = Arc::new(MemoryAdapter::new());
        let mgr = manager(Arc::clone(&adapter), Duration::from_secs(60));
        let guard = mgr.acquire("FHIRDATA").await.unwrap();
        assert_eq!(guard.schema(), "FHIRDATA");
        assert!(guard.release().await.unwrap());
        assert!(adapter
            .read_lease("fhir_admin", "FHIRDATA")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_second_instance_denied_while_lease_live() {
        let adapter: Arc<dyn SchemaExecutor> = Arc::new(MemoryAdapter::new());
        let first = manager(Arc::clone(&adapter), Duration::from_secs(60));
        let second = manager(Arc::clone(&adapter), Duration::from_secs(60));

        let _held = first.acquire("FHIRDATA").await.unwrap();
        let err = second.acquire("FHIRDATA").await.unwrap_err();
        match err {
            MigrateError::LeaseDenied { schema, .. } => assert_eq!(schema, "FHIRDATA"),
            other => panic!("expected LeaseDenied, got {other}"),
        }
    }

    #[tokio::test]
    async fn test_takeover_after_expiry() {
        let adapter: Arc<dyn SchemaExecutor> = Arc::new(MemoryAdapter::new());
        let first = manager(Arc::clone(&adapter), Duration::from_millis(50));
        let second = manager(Arc::clone(&adapter), Duration::from_secs(60));

        let _abandoned = first.acquire("FHIRDATA").await.unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;

        let guard = second.acquire("FHIRDATA").await.unwrap();
        let row = adapter
            .read_lease("fhir_admin", "FHIRDATA")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.owner_id, guard.owner_id());
    }

    #[tokio::test]
    async fn test_renew_extends_expiry() {
        let adapter: Arc<dyn SchemaExecutor> = Arc::new(MemoryAdapter::new());
        let mgr = manager(Arc::clone(&adapter), Duration::from_secs(60));
        let mut guard = mgr.acquire("FHIRDATA").await.unwrap();

        let before = adapter
            .read_lease("fhir_admin", "FHIRDATA")
            .await
            .unwrap()
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        guard.renew().await.unwrap();
        let after = adapter
            .read_lease("fhir_admin", "FHIRDATA")
            .await
            .unwrap()
            .unwrap();
        assert!(after.lease_until > before.lease_until);
    }

    #[tokio::test]
    async fn test_renew_fails_after_takeover() {
        let adapter: Arc<dyn SchemaExecutor> = Arc::new(MemoryAdapter::new());
        let first = manager(Arc::clone(&adapter), Duration::from_millis(30));
        let second = manager(Arc::clone(&adapter), Duration::from_secs(60));

        let mut guard = first.acquire("FHIRDATA").await.unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        let _stolen = second.acquire("FHIRDATA").await.unwrap();

        assert!(matches!(
            guard.renew().await,
            Err(MigrateError::LeaseDenied { .. })
        ));
    }

    #[test]
    fn test_backoff_growth() {
        let policy = RetryPolicy {
            max_attempts: 4,
            initial_backoff: Duration::from_millis(100),
            multiplier: 2.0,
        };
        assert_eq!(policy.backoff(0), Duration::from_millis(100));
        assert_eq!(policy.backoff(1), Duration::from_millis(200));
        assert_eq!(policy.backoff(2), Duration::from_millis(400));
    }
}
