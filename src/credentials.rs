//! Tenant ESP credentials and the per-provider validity rules that feed the
//! selection engine (see `database/seed.go`'s `isValidProvider` for the
//! original per-field shape this is grounded on).

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// The closed set of email service providers this relay supports.
///
/// `Ord` is derived so a `BTreeMap<Provider, _>` iterates in a fixed,
/// deterministic order -- the selection engine's weighted draw relies on
/// that order being stable across calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Provider {
    SendGrid,
    Postmark,
    SocketLabs,
    SparkPost,
}

impl Provider {
    pub const ALL: [Provider; 4] = [Provider::SendGrid, Provider::Postmark, Provider::SocketLabs, Provider::SparkPost];

    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::SendGrid => "sendgrid",
            Provider::Postmark => "postmark",
            Provider::SocketLabs => "socketlabs",
            Provider::SparkPost => "sparkpost",
        }
    }

    pub fn from_str_loose(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "sendgrid" => Some(Provider::SendGrid),
            "postmark" => Some(Provider::Postmark),
            "socketlabs" => Some(Provider::SocketLabs),
            "sparkpost" => Some(Provider::SparkPost),
            _ => None,
        }
    }
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Opaque per-provider secret bundle. Field presence (not content) is all
/// the selection engine inspects; adapters read the fields they need.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EspCredential {
    pub esp_id: i64,
    pub provider: Provider,
    pub api_key: Option<String>,
    pub server_id: Option<String>,
    pub account_id: Option<String>,
    pub configured_weight: i32,
    pub sending_domains: Vec<String>,
}

impl EspCredential {
    /// Per-provider minimum-field rule, matching `isValidProvider` in the
    /// original weighting job: each ESP requires a distinct set of fields
    /// before it is eligible to receive any routed traffic.
    pub fn is_valid(&self) -> bool {
        match self.provider {
            Provider::SendGrid | Provider::Postmark | Provider::SparkPost => {
                self.api_key.as_deref().is_some_and(|k| !k.is_empty())
            }
            Provider::SocketLabs => {
                self.server_id.as_deref().is_some_and(|s| !s.is_empty())
                    && self.api_key.as_deref().is_some_and(|k| !k.is_empty())
            }
        }
    }
}

/// A tenant's full set of ESP credentials, keyed by provider.
#[derive(Debug, Clone, Default)]
pub struct TenantCredentials {
    pub tenant: i64,
    pub by_provider: BTreeMap<Provider, EspCredential>,
}

impl TenantCredentials {
    pub fn valid_providers(&self) -> Vec<Provider> {
        self.by_provider
            .iter()
            .filter(|(_, c)| c.is_valid())
            .map(|(p, _)| *p)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sendgrid_requires_api_key() {
        let cred = EspCredential {
            provider: Provider::SendGrid,
            api_key: None,
            ..Default::default()
        };
        assert!(!cred.is_valid());

        let cred = EspCredential {
            provider: Provider::SendGrid,
            api_key: Some("SG.xxx".into()),
            ..Default::default()
        };
        assert!(cred.is_valid());
    }

    #[test]
    fn socketlabs_requires_server_id_and_key() {
        let cred = EspCredential {
            provider: Provider::SocketLabs,
            api_key: Some("key".into()),
            server_id: None,
            ..Default::default()
        };
        assert!(!cred.is_valid());

        let cred = EspCredential {
            provider: Provider::SocketLabs,
            api_key: Some("key".into()),
            server_id: Some("12345".into()),
            ..Default::default()
        };
        assert!(cred.is_valid());
    }

    #[test]
    fn deterministic_ordering() {
        let mut map: BTreeMap<Provider, i32> = BTreeMap::new();
        map.insert(Provider::SparkPost, 1);
        map.insert(Provider::SendGrid, 2);
        map.insert(Provider::Postmark, 3);
        map.insert(Provider::SocketLabs, 4);
        let order: Vec<_> = map.keys().copied().collect();
        assert_eq!(
            order,
            vec![Provider::SendGrid, Provider::Postmark, Provider::SocketLabs, Provider::SparkPost]
        );
    }
}

impl Default for Provider {
    fn default() -> Self {
        Provider::SendGrid
    }
}

/// Fetches a tenant's ESP credentials from `email_service_providers`.
/// Re-fetched per message per §5 -- not cached by this trait's contract;
/// see [`CachedCredentialsStore`] for the opt-in bounded TTL layer.
#[async_trait::async_trait]
pub trait CredentialsStore: Send + Sync {
    async fn get(&self, tenant: i64) -> Result<TenantCredentials, crate::error::RelayError>;
}

/// `sqlx`-backed Postgres implementation, grounded on `database/db.go`'s
/// connection-pool-per-process pattern, translated to a passed-in `PgPool`
/// instead of a global/`once.Do` singleton (§9 redesign hint).
pub struct PostgresCredentialsStore {
    pool: sqlx::PgPool,
}

impl PostgresCredentialsStore {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl CredentialsStore for PostgresCredentialsStore {
    async fn get(&self, tenant: i64) -> Result<TenantCredentials, crate::error::RelayError> {
        let rows: Vec<(i64, String, Option<String>, Option<String>, Option<String>, i32, Vec<String>)> = sqlx::query_as(
            r#"
            SELECT esp_id, provider_name, api_key, server_id, account_id, weight, sending_domains
            FROM email_service_providers
            WHERE user_id = $1
            "#,
        )
        .bind(tenant)
        .fetch_all(&self.pool)
        .await?;

        let mut by_provider = BTreeMap::new();
        for (esp_id, provider_name, api_key, server_id, account_id, weight, sending_domains) in rows {
            if let Some(provider) = Provider::from_str_loose(&provider_name) {
                by_provider.insert(
                    provider,
                    EspCredential {
                        esp_id,
                        provider,
                        api_key,
                        server_id,
                        account_id,
                        configured_weight: weight,
                        sending_domains,
                    },
                );
            }
        }
        Ok(TenantCredentials { tenant, by_provider })
    }
}

/// In-memory implementation used by tests and `local`-style development.
#[derive(Default)]
pub struct MemoryCredentialsStore {
    tenants: std::sync::RwLock<BTreeMap<i64, TenantCredentials>>,
}

impl MemoryCredentialsStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, credentials: TenantCredentials) {
        self.tenants.write().unwrap().insert(credentials.tenant, credentials);
    }
}

#[async_trait::async_trait]
impl CredentialsStore for MemoryCredentialsStore {
    async fn get(&self, tenant: i64) -> Result<TenantCredentials, crate::error::RelayError> {
        Ok(self.tenants.read().unwrap().get(&tenant).cloned().unwrap_or(TenantCredentials { tenant, by_provider: BTreeMap::new() }))
    }
}

/// Opt-in bounded per-tenant TTL cache (~30s) in front of any
/// `CredentialsStore`, per the §5/§9 redesign hint. Not wired into the
/// default dispatch path -- callers opt in explicitly by constructing one.
/// The teacher's dependency stack has no caching crate, so this is a small
/// hand-rolled `RwLock<HashMap>` with stamped expiry rather than e.g. `moka`.
pub struct CachedCredentialsStore<S> {
    inner: S,
    ttl: std::time::Duration,
    cache: std::sync::RwLock<std::collections::HashMap<i64, (std::time::Instant, TenantCredentials)>>,
}

impl<S: CredentialsStore> CachedCredentialsStore<S> {
    pub fn new(inner: S, ttl: std::time::Duration) -> Self {
        Self { inner, ttl, cache: std::sync::RwLock::new(std::collections::HashMap::new()) }
    }
}

#[async_trait::async_trait]
impl<S: CredentialsStore> CredentialsStore for CachedCredentialsStore<S> {
    async fn get(&self, tenant: i64) -> Result<TenantCredentials, crate::error::RelayError> {
        if let Some((stamped_at, cached)) = self.cache.read().unwrap().get(&tenant) {
            if stamped_at.elapsed() < self.ttl {
                return Ok(cached.clone());
            }
        }
        let fresh = self.inner.get(tenant).await?;
        self.cache.write().unwrap().insert(tenant, (std::time::Instant::now(), fresh.clone()));
        Ok(fresh)
    }
}
