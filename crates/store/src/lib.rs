//! podtap store: read-only cluster access behind one trait, plus the
//! bounded-retry policy used for read-after-write visibility lag.

#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::ReplicaSet;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use kube::api::{Api, ListParams};
use kube::core::{ApiResource, DynamicObject, GroupVersionKind};
use kube::Client;
use rand::Rng;
use tracing::{debug, warn};

use podtap_model::Instrumentation;

/// A failed read against the cluster (transport or decode), not "absent".
#[derive(Debug, Clone, thiserror::Error)]
#[error("reading {kind} {namespace}/{name}: {message}")]
pub struct ReadError {
    pub kind: &'static str,
    pub namespace: String,
    pub name: String,
    pub message: String,
}

impl ReadError {
    fn new(kind: &'static str, namespace: &str, name: &str, message: impl ToString) -> Self {
        Self {
            kind,
            namespace: namespace.to_string(),
            name: name.to_string(),
            message: message.to_string(),
        }
    }
}

/// Read-capable object store the engine depends on. Absent objects are
/// `Ok(None)`; `Err` is reserved for transport/decode failures.
#[async_trait]
pub trait ClusterReader: Send + Sync {
    async fn instrumentation(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Instrumentation>, ReadError>;

    async fn instrumentations(&self, namespace: &str) -> Result<Vec<Instrumentation>, ReadError>;

    async fn config_map(&self, namespace: &str, name: &str)
        -> Result<Option<ConfigMap>, ReadError>;

    async fn secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>, ReadError>;

    async fn replica_set(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ReplicaSet>, ReadError>;

    async fn job(&self, namespace: &str, name: &str) -> Result<Option<Job>, ReadError>;
}

/// Bounded exponential backoff with jitter, tuned to absorb the window
/// between an object's creation and its visibility to readers.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    pub initial: Duration,
    pub factor: f64,
    pub jitter: f64,
    pub cap: Duration,
    pub attempts: u32,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(10),
            factor: 1.5,
            jitter: 0.1,
            cap: Duration::from_secs(2),
            attempts: 20,
        }
    }
}

/// Re-run `lookup` until it yields a value, the attempt budget runs out, or
/// it fails. Sleeps via tokio, so dropping the future aborts the schedule.
pub async fn retry_until_visible<T, F, Fut>(
    policy: &Backoff,
    mut lookup: F,
) -> Result<Option<T>, ReadError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>, ReadError>>,
{
    let attempts = policy.attempts.max(1);
    let mut delay = policy.initial;
    for attempt in 0..attempts {
        if let Some(found) = lookup().await? {
            if attempt > 0 {
                debug!(attempt, "object became visible after retry");
            }
            return Ok(Some(found));
        }
        if attempt + 1 == attempts {
            break;
        }
        let jittered = delay.mul_f64(1.0 + policy.jitter * rand::thread_rng().gen_range(0.0..1.0));
        tokio::time::sleep(jittered).await;
        delay = Duration::min(delay.mul_f64(policy.factor), policy.cap);
    }
    Ok(None)
}

/// Log-and-omit wrapper for owner-chain reads: retries while the object is
/// invisible, warns once when the budget runs out or the read fails.
pub async fn lookup_with_retry<T, F, Fut>(
    policy: &Backoff,
    kind: &'static str,
    namespace: &str,
    name: &str,
    lookup: F,
) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>, ReadError>>,
{
    match retry_until_visible(policy, lookup).await {
        Ok(Some(found)) => Some(found),
        Ok(None) => {
            warn!(kind, namespace, name, "owner not visible after retries; omitting");
            None
        }
        Err(e) => {
            warn!(kind, namespace, name, error = %e, "owner lookup failed; omitting");
            None
        }
    }
}

/// Live implementation over a kube client. The profile kind is served as a
/// dynamic object; built-in kinds go through typed APIs.
#[derive(Clone)]
pub struct KubeReader {
    client: Client,
    profile_resource: ApiResource,
}

impl KubeReader {
    pub fn new(client: Client) -> Self {
        let gvk =
            GroupVersionKind::gvk(podtap_model::GROUP, podtap_model::VERSION, podtap_model::KIND);
        Self {
            client,
            profile_resource: ApiResource::from_gvk(&gvk),
        }
    }

    pub async fn try_default() -> Result<Self, ReadError> {
        let client = Client::try_default()
            .await
            .map_err(|e| ReadError::new("Client", "", "", e))?;
        Ok(Self::new(client))
    }

    fn profiles(&self, namespace: &str) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), namespace, &self.profile_resource)
    }

    fn decode_profile(obj: DynamicObject, namespace: &str) -> Result<Instrumentation, ReadError> {
        let name = obj.metadata.name.clone().unwrap_or_default();
        let value = serde_json::to_value(obj)
            .map_err(|e| ReadError::new(podtap_model::KIND, namespace, &name, e))?;
        serde_json::from_value(value)
            .map_err(|e| ReadError::new(podtap_model::KIND, namespace, &name, e))
    }
}

#[async_trait]
impl ClusterReader for KubeReader {
    async fn instrumentation(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Instrumentation>, ReadError> {
        let found = self
            .profiles(namespace)
            .get_opt(name)
            .await
            .map_err(|e| ReadError::new(podtap_model::KIND, namespace, name, e))?;
        found
            .map(|obj| Self::decode_profile(obj, namespace))
            .transpose()
    }

    async fn instrumentations(&self, namespace: &str) -> Result<Vec<Instrumentation>, ReadError> {
        let list = self
            .profiles(namespace)
            .list(&ListParams::default())
            .await
            .map_err(|e| ReadError::new(podtap_model::KIND, namespace, "", e))?;
        list.items
            .into_iter()
            .map(|obj| Self::decode_profile(obj, namespace))
            .collect()
    }

    async fn config_map(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ConfigMap>, ReadError> {
        Api::<ConfigMap>::namespaced(self.client.clone(), namespace)
            .get_opt(name)
            .await
            .map_err(|e| ReadError::new("ConfigMap", namespace, name, e))
    }

    async fn secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>, ReadError> {
        Api::<Secret>::namespaced(self.client.clone(), namespace)
            .get_opt(name)
            .await
            .map_err(|e| ReadError::new("Secret", namespace, name, e))
    }

    async fn replica_set(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ReplicaSet>, ReadError> {
        Api::<ReplicaSet>::namespaced(self.client.clone(), namespace)
            .get_opt(name)
            .await
            .map_err(|e| ReadError::new("ReplicaSet", namespace, name, e))
    }

    async fn job(&self, namespace: &str, name: &str) -> Result<Option<Job>, ReadError> {
        Api::<Job>::namespaced(self.client.clone(), namespace)
            .get_opt(name)
            .await
            .map_err(|e| ReadError::new("Job", namespace, name, e))
    }
}

type Key = (String, String);

fn key_of(namespace: &str, name: &str) -> Key {
    (namespace.to_string(), name.to_string())
}

fn meta_key(meta: &k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta) -> Key {
    (
        meta.namespace.clone().unwrap_or_default(),
        meta.name.clone().unwrap_or_default(),
    )
}

/// In-memory reader for tests and offline runs. Counts lookups so tests can
/// assert memoization behavior.
#[derive(Default)]
pub struct MemReader {
    instrumentations: HashMap<Key, Instrumentation>,
    config_maps: HashMap<Key, ConfigMap>,
    secrets: HashMap<Key, Secret>,
    replica_sets: HashMap<Key, ReplicaSet>,
    jobs: HashMap<Key, Job>,
    lookups: AtomicU64,
}

impl MemReader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_instrumentation(mut self, inst: Instrumentation) -> Self {
        let key = key_of(inst.namespace(), inst.name());
        self.instrumentations.insert(key, inst);
        self
    }

    pub fn with_config_map(mut self, cm: ConfigMap) -> Self {
        self.config_maps.insert(meta_key(&cm.metadata), cm);
        self
    }

    pub fn with_secret(mut self, secret: Secret) -> Self {
        self.secrets.insert(meta_key(&secret.metadata), secret);
        self
    }

    pub fn with_replica_set(mut self, rs: ReplicaSet) -> Self {
        self.replica_sets.insert(meta_key(&rs.metadata), rs);
        self
    }

    pub fn with_job(mut self, job: Job) -> Self {
        self.jobs.insert(meta_key(&job.metadata), job);
        self
    }

    /// Total reads served, across all kinds.
    pub fn lookups(&self) -> u64 {
        self.lookups.load(Ordering::Relaxed)
    }

    fn bump(&self) {
        self.lookups.fetch_add(1, Ordering::Relaxed);
    }
}

#[async_trait]
impl ClusterReader for MemReader {
    async fn instrumentation(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Instrumentation>, ReadError> {
        self.bump();
        Ok(self.instrumentations.get(&key_of(namespace, name)).cloned())
    }

    async fn instrumentations(&self, namespace: &str) -> Result<Vec<Instrumentation>, ReadError> {
        self.bump();
        let mut found: Vec<_> = self
            .instrumentations
            .values()
            .filter(|inst| inst.namespace() == namespace)
            .cloned()
            .collect();
        found.sort_by(|a, b| a.name().cmp(b.name()));
        Ok(found)
    }

    async fn config_map(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ConfigMap>, ReadError> {
        self.bump();
        Ok(self.config_maps.get(&key_of(namespace, name)).cloned())
    }

    async fn secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>, ReadError> {
        self.bump();
        Ok(self.secrets.get(&key_of(namespace, name)).cloned())
    }

    async fn replica_set(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ReplicaSet>, ReadError> {
        self.bump();
        Ok(self.replica_sets.get(&key_of(namespace, name)).cloned())
    }

    async fn job(&self, namespace: &str, name: &str) -> Result<Option<Job>, ReadError> {
        self.bump();
        Ok(self.jobs.get(&key_of(namespace, name)).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[tokio::test(start_paused = true)]
    async fn retry_sees_object_after_visibility_lag() {
        let calls = AtomicU32::new(0);
        let policy = Backoff::default();
        let got = retry_until_visible(&policy, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 3 {
                    Ok(None)
                } else {
                    Ok(Some("visible"))
                }
            }
        })
        .await
        .expect("no read error");
        assert_eq!(got, Some("visible"));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_gives_up_after_attempt_budget() {
        let calls = AtomicU32::new(0);
        let policy = Backoff {
            attempts: 5,
            ..Backoff::default()
        };
        let got: Option<&str> = retry_until_visible(&policy, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok(None) }
        })
        .await
        .expect("no read error");
        assert_eq!(got, None);
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn retry_propagates_read_errors_immediately() {
        let calls = AtomicU32::new(0);
        let policy = Backoff::default();
        let got: Result<Option<&str>, ReadError> = retry_until_visible(&policy, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(ReadError::new("ReplicaSet", "apps", "web-1234", "boom")) }
        })
        .await;
        assert!(got.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn mem_reader_counts_lookups() {
        let reader = MemReader::new();
        assert_eq!(reader.config_map("apps", "missing").await.unwrap(), None);
        assert_eq!(reader.config_map("apps", "missing").await.unwrap(), None);
        assert_eq!(reader.lookups(), 2);
    }
}
