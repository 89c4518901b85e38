//! Environment Ledger: ordered env management for one container, including
//! resolution of indirect values through ConfigMaps and Secrets.

use std::collections::HashMap;

use k8s_openapi::api::core::v1::{EnvVar, EnvVarSource, Pod};
use tracing::warn;

use podtap_store::ClusterReader;

use crate::error::InjectSkip;
use crate::util::{containers, containers_mut, env_mut, env_of, plain_var};

/// Per-invocation memoized ConfigMap/Secret lookups. Each external object is
/// fetched at most once per invocation; an absent object or a failed read is
/// remembered as unavailable and not retried until the next invocation.
pub struct KvCache<'a> {
    reader: &'a dyn ClusterReader,
    namespace: String,
    config_maps: HashMap<String, Option<HashMap<String, String>>>,
    secrets: HashMap<String, Option<HashMap<String, String>>>,
}

enum KvLookup {
    Value(String),
    KeyMissing,
    ObjectMissing,
}

impl<'a> KvCache<'a> {
    pub fn new(reader: &'a dyn ClusterReader, namespace: &str) -> Self {
        Self {
            reader,
            namespace: namespace.to_string(),
            config_maps: HashMap::new(),
            secrets: HashMap::new(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    async fn config_map_slot(&mut self, name: &str) -> Option<&HashMap<String, String>> {
        if !self.config_maps.contains_key(name) {
            let fetched = match self.reader.config_map(&self.namespace, name).await {
                Ok(found) => found.map(|cm| cm.data.unwrap_or_default().into_iter().collect()),
                Err(e) => {
                    warn!(error = %e, "config map read failed; treating as unavailable");
                    None
                }
            };
            self.config_maps.insert(name.to_string(), fetched);
        }
        self.config_maps.get(name).and_then(|slot| slot.as_ref())
    }

    async fn secret_slot(&mut self, name: &str) -> Option<&HashMap<String, String>> {
        if !self.secrets.contains_key(name) {
            let fetched = match self.reader.secret(&self.namespace, name).await {
                Ok(found) => found.map(|secret| {
                    let mut entries: HashMap<String, String> = secret
                        .data
                        .unwrap_or_default()
                        .into_iter()
                        .map(|(k, v)| (k, String::from_utf8_lossy(&v.0).into_owned()))
                        .collect();
                    for (k, v) in secret.string_data.unwrap_or_default() {
                        entries.insert(k, v);
                    }
                    entries
                }),
                Err(e) => {
                    warn!(error = %e, "secret read failed; treating as unavailable");
                    None
                }
            };
            self.secrets.insert(name.to_string(), fetched);
        }
        self.secrets.get(name).and_then(|slot| slot.as_ref())
    }

    async fn config_map_key(&mut self, name: &str, key: &str) -> KvLookup {
        match self.config_map_slot(name).await {
            None => KvLookup::ObjectMissing,
            Some(data) => match data.get(key) {
                Some(value) => KvLookup::Value(value.clone()),
                None => KvLookup::KeyMissing,
            },
        }
    }

    async fn secret_key(&mut self, name: &str, key: &str) -> KvLookup {
        match self.secret_slot(name).await {
            None => KvLookup::ObjectMissing,
            Some(data) => match data.get(key) {
                Some(value) => KvLookup::Value(value.clone()),
                None => KvLookup::KeyMissing,
            },
        }
    }

    /// Merge every key of the named ConfigMap into `out`, prefix applied.
    /// Returns false when the object is unavailable.
    async fn import_config_map(
        &mut self,
        name: &str,
        prefix: &str,
        out: &mut HashMap<String, String>,
    ) -> bool {
        match self.config_map_slot(name).await {
            None => false,
            Some(data) => {
                for (k, v) in data {
                    out.insert(format!("{prefix}{k}"), v.clone());
                }
                true
            }
        }
    }

    async fn import_secret(
        &mut self,
        name: &str,
        prefix: &str,
        out: &mut HashMap<String, String>,
    ) -> bool {
        match self.secret_slot(name).await {
            None => false,
            Some(data) => {
                for (k, v) in data {
                    out.insert(format!("{prefix}{k}"), v.clone());
                }
                true
            }
        }
    }
}

/// Ordered env management scoped to one container of the pod. Order matters:
/// some entries interpolate earlier entries by name.
pub struct EnvLedger {
    index: usize,
    inherited: HashMap<String, String>,
}

impl EnvLedger {
    /// Ledger for `containers[index]`. `envFrom` bulk imports are resolved
    /// up front: later imports override earlier ones, the per-import prefix
    /// is applied before merging.
    pub async fn new(pod: &Pod, index: usize, cache: &mut KvCache<'_>) -> Result<Self, InjectSkip> {
        let container = containers(pod).get(index).ok_or(InjectSkip::NoContainers)?;
        let mut inherited = HashMap::new();
        for source in container.env_from.as_deref().unwrap_or(&[]) {
            let prefix = source.prefix.as_deref().unwrap_or("");
            if let Some(cm_ref) = &source.config_map_ref {
                let name = cm_ref.name.as_deref().unwrap_or("");
                let imported = cache.import_config_map(name, prefix, &mut inherited).await;
                if !imported && !cm_ref.optional.unwrap_or(false) {
                    return Err(InjectSkip::MissingRef {
                        var: "envFrom import".into(),
                        kind: "ConfigMap",
                        namespace: cache.namespace().into(),
                        name: name.into(),
                    });
                }
            } else if let Some(secret_ref) = &source.secret_ref {
                let name = secret_ref.name.as_deref().unwrap_or("");
                let imported = cache.import_secret(name, prefix, &mut inherited).await;
                if !imported && !secret_ref.optional.unwrap_or(false) {
                    return Err(InjectSkip::MissingRef {
                        var: "envFrom import".into(),
                        kind: "Secret",
                        namespace: cache.namespace().into(),
                        name: name.into(),
                    });
                }
            }
        }
        Ok(Self { index, inherited })
    }

    pub fn index(&self) -> usize {
        self.index
    }

    fn entries<'p>(&self, pod: &'p Pod) -> &'p [EnvVar] {
        containers(pod)
            .get(self.index)
            .map(env_of)
            .unwrap_or(&[])
    }

    fn entries_mut<'p>(&self, pod: &'p mut Pod) -> &'p mut Vec<EnvVar> {
        env_mut(&mut containers_mut(pod)[self.index])
    }

    /// Present either directly in the container's list or via a bulk import.
    pub fn exists(&self, pod: &Pod, name: &str) -> bool {
        self.entries(pod).iter().any(|e| e.name == name) || self.inherited.contains_key(name)
    }

    pub fn append(&self, pod: &mut Pod, name: &str, value: &str) {
        self.append_var(pod, plain_var(name, value));
    }

    pub fn append_var(&self, pod: &mut Pod, var: EnvVar) {
        self.entries_mut(pod).push(var);
    }

    pub fn prepend_var(&self, pod: &mut Pod, var: EnvVar) {
        self.entries_mut(pod).insert(0, var);
    }

    pub fn append_if_not_exists(&self, pod: &mut Pod, name: &str, value: &str) {
        if !self.exists(pod, name) {
            self.append(pod, name, value);
        }
    }

    pub fn append_var_if_not_exists(&self, pod: &mut Pod, var: EnvVar) {
        if !self.exists(pod, &var.name) {
            self.append_var(pod, var);
        }
    }

    pub fn prepend_var_if_not_exists(&self, pod: &mut Pod, var: EnvVar) {
        if !self.exists(pod, &var.name) {
            self.prepend_var(pod, var);
        }
    }

    /// Replace the matching entry in place, else append.
    pub fn set_or_append(&self, pod: &mut Pod, var: EnvVar) {
        let entries = self.entries_mut(pod);
        match entries.iter().position(|e| e.name == var.name) {
            Some(i) => entries[i] = var,
            None => entries.push(var),
        }
    }

    /// Existing entry (resolved), bulk-imported value, or a fresh empty
    /// placeholder, in that order.
    pub async fn get_or_make(
        &self,
        pod: &Pod,
        name: &str,
        cache: &mut KvCache<'_>,
    ) -> Result<EnvVar, InjectSkip> {
        let var = match self.entries(pod).iter().find(|e| e.name == name) {
            Some(found) => found.clone(),
            None => match self.inherited.get(name) {
                Some(value) => plain_var(name, value),
                None => plain_var(name, ""),
            },
        };
        self.resolve(var, cache).await
    }

    /// Every listed var already present on the container must be resolvable.
    pub async fn validate(
        &self,
        pod: &Pod,
        names: &[&str],
        cache: &mut KvCache<'_>,
    ) -> Result<(), InjectSkip> {
        for name in names {
            if let Some(var) = self.entries(pod).iter().find(|e| e.name == *name) {
                self.resolve(var.clone(), cache).await?;
            }
        }
        Ok(())
    }

    async fn resolve(&self, var: EnvVar, cache: &mut KvCache<'_>) -> Result<EnvVar, InjectSkip> {
        let has_direct_value = var.value.as_deref().map_or(false, |v| !v.is_empty());
        if has_direct_value || var.value_from.is_none() {
            return Ok(var);
        }
        let Some(source) = var.value_from.as_ref() else {
            return Ok(var);
        };
        resolve_indirect(&var.name, source, cache).await
    }

    /// Concatenate `value` onto the entry (resolving it first), never
    /// doubling the separator at the boundary.
    pub async fn concat_or_append(
        &self,
        pod: &mut Pod,
        name: &str,
        value: &str,
        sep: &str,
        cache: &mut KvCache<'_>,
    ) -> Result<(), InjectSkip> {
        let mut var = self.get_or_make(pod, name, cache).await?;
        let joined = concat_checked(var.value.as_deref().unwrap_or(""), value, sep);
        var.value = Some(joined);
        var.value_from = None;
        self.set_or_append(pod, var);
        Ok(())
    }

    /// Reorder the named entry to the end of the list so that any entry it
    /// interpolates by name is defined before it.
    pub fn move_to_end(&self, pod: &mut Pod, name: &str) {
        let entries = self.entries_mut(pod);
        if let Some(i) = entries.iter().position(|e| e.name == name) {
            let var = entries.remove(i);
            entries.push(var);
        }
    }
}

async fn resolve_indirect(
    name: &str,
    source: &EnvVarSource,
    cache: &mut KvCache<'_>,
) -> Result<EnvVar, InjectSkip> {
    if let Some(selector) = &source.config_map_key_ref {
        let object = selector.name.as_deref().unwrap_or("");
        let optional = selector.optional.unwrap_or(false);
        match cache.config_map_key(object, &selector.key).await {
            KvLookup::Value(value) => Ok(plain_var(name, &value)),
            KvLookup::KeyMissing if !optional => Err(InjectSkip::MissingKey {
                var: name.into(),
                kind: "ConfigMap",
                namespace: cache.namespace().into(),
                name: object.into(),
                key: selector.key.clone(),
            }),
            KvLookup::ObjectMissing if !optional => Err(InjectSkip::MissingRef {
                var: name.into(),
                kind: "ConfigMap",
                namespace: cache.namespace().into(),
                name: object.into(),
            }),
            _ => Ok(plain_var(name, "")),
        }
    } else if let Some(selector) = &source.secret_key_ref {
        let object = selector.name.as_deref().unwrap_or("");
        let optional = selector.optional.unwrap_or(false);
        match cache.secret_key(object, &selector.key).await {
            KvLookup::Value(value) => Ok(plain_var(name, &value)),
            KvLookup::KeyMissing if !optional => Err(InjectSkip::MissingKey {
                var: name.into(),
                kind: "Secret",
                namespace: cache.namespace().into(),
                name: object.into(),
                key: selector.key.clone(),
            }),
            KvLookup::ObjectMissing if !optional => Err(InjectSkip::MissingRef {
                var: name.into(),
                kind: "Secret",
                namespace: cache.namespace().into(),
                name: object.into(),
            }),
            _ => Ok(plain_var(name, "")),
        }
    } else {
        Err(InjectSkip::UnsupportedSource {
            var: name.into(),
            field: unsupported_field(source),
        })
    }
}

fn unsupported_field(source: &EnvVarSource) -> &'static str {
    if source.field_ref.is_some() {
        "fieldRef"
    } else {
        "resourceFieldRef"
    }
}

/// Join two strings with `sep`, eliding a duplicated separator at the
/// boundary; an empty operand yields the other one unchanged.
pub fn concat_checked(a: &str, b: &str, sep: &str) -> String {
    if a.is_empty() {
        return b.to_string();
    }
    if b.is_empty() {
        return a.to_string();
    }
    if a.ends_with(sep) {
        if let Some(trimmed) = b.strip_prefix(sep) {
            return format!("{a}{trimmed}");
        }
        return format!("{a}{b}");
    }
    if b.starts_with(sep) {
        return format!("{a}{b}");
    }
    format!("{a}{sep}{b}")
}

/// Left fold of [`concat_checked`] over all parts.
pub fn concat_all(sep: &str, parts: &[&str]) -> String {
    parts
        .iter()
        .fold(String::new(), |acc, part| concat_checked(&acc, part, sep))
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{
        ConfigMap, ConfigMapEnvSource, ConfigMapKeySelector, Container, EnvFromSource,
        ObjectFieldSelector, PodSpec, Secret, SecretKeySelector,
    };
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use k8s_openapi::ByteString;
    use podtap_store::MemReader;
    use std::collections::BTreeMap;

    fn pod_with_env(env: Vec<EnvVar>) -> Pod {
        Pod {
            spec: Some(PodSpec {
                containers: vec![Container {
                    name: "app".into(),
                    env: Some(env),
                    ..Default::default()
                }],
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn config_map(namespace: &str, name: &str, data: &[(&str, &str)]) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                namespace: Some(namespace.into()),
                name: Some(name.into()),
                ..Default::default()
            },
            data: Some(
                data.iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            ),
            ..Default::default()
        }
    }

    fn names(pod: &Pod) -> Vec<String> {
        env_of(&containers(pod)[0])
            .iter()
            .map(|e| e.name.clone())
            .collect()
    }

    #[test]
    fn concat_elides_duplicate_separator() {
        assert_eq!(concat_checked("x:", "y", ":"), "x:y");
        assert_eq!(concat_checked("x:", ":y", ":"), "x:y");
        assert_eq!(concat_checked("x", ":y", ":"), "x:y");
        assert_eq!(concat_checked("x", "y", ":"), "x:y");
    }

    #[test]
    fn concat_with_empty_operand_is_identity() {
        assert_eq!(concat_checked("x", "", ":"), "x");
        assert_eq!(concat_checked("", "y", ":"), "y");
        assert_eq!(concat_checked("", "", ":"), "");
    }

    #[test]
    fn concat_all_folds_left() {
        assert_eq!(concat_all(":", &["a", "", "b:", ":c"]), "a:b:c");
    }

    #[tokio::test]
    async fn append_if_not_exists_is_idempotent() {
        let reader = MemReader::new();
        let mut cache = KvCache::new(&reader, "apps");
        let mut pod = pod_with_env(vec![]);
        let ledger = EnvLedger::new(&pod, 0, &mut cache).await.expect("ledger");

        ledger.append_if_not_exists(&mut pod, "FOO", "one");
        ledger.append_if_not_exists(&mut pod, "FOO", "two");
        let env = env_of(&containers(&pod)[0]);
        assert_eq!(env.len(), 1);
        assert_eq!(env[0].value.as_deref(), Some("one"));
    }

    #[tokio::test]
    async fn set_or_append_replaces_in_place() {
        let reader = MemReader::new();
        let mut cache = KvCache::new(&reader, "apps");
        let mut pod = pod_with_env(vec![plain_var("A", "1"), plain_var("B", "2")]);
        let ledger = EnvLedger::new(&pod, 0, &mut cache).await.expect("ledger");

        ledger.set_or_append(&mut pod, plain_var("A", "replaced"));
        assert_eq!(names(&pod), vec!["A", "B"]);
        assert_eq!(
            env_of(&containers(&pod)[0])[0].value.as_deref(),
            Some("replaced")
        );
    }

    #[tokio::test]
    async fn move_to_end_reorders_the_aggregate() {
        let reader = MemReader::new();
        let mut cache = KvCache::new(&reader, "apps");
        let mut pod = pod_with_env(vec![plain_var("AGG", "x"), plain_var("OTHER", "y")]);
        let ledger = EnvLedger::new(&pod, 0, &mut cache).await.expect("ledger");

        ledger.move_to_end(&mut pod, "AGG");
        assert_eq!(names(&pod), vec!["OTHER", "AGG"]);
    }

    #[tokio::test]
    async fn get_or_make_resolves_config_map_reference() {
        let reader = MemReader::new()
            .with_config_map(config_map("apps", "app-conf", &[("region", "eu-1")]));
        let mut cache = KvCache::new(&reader, "apps");
        let pod = pod_with_env(vec![EnvVar {
            name: "REGION".into(),
            value: None,
            value_from: Some(EnvVarSource {
                config_map_key_ref: Some(ConfigMapKeySelector {
                    name: Some("app-conf".into()),
                    key: "region".into(),
                    optional: None,
                }),
                ..Default::default()
            }),
        }]);
        let ledger = EnvLedger::new(&pod, 0, &mut cache).await.expect("ledger");
        let var = ledger
            .get_or_make(&pod, "REGION", &mut cache)
            .await
            .expect("resolve");
        assert_eq!(var.value.as_deref(), Some("eu-1"));
    }

    #[tokio::test]
    async fn missing_key_is_an_error_unless_optional() {
        let reader = MemReader::new().with_config_map(config_map("apps", "app-conf", &[]));
        let mut cache = KvCache::new(&reader, "apps");
        let selector = |optional| EnvVar {
            name: "REGION".into(),
            value: None,
            value_from: Some(EnvVarSource {
                config_map_key_ref: Some(ConfigMapKeySelector {
                    name: Some("app-conf".into()),
                    key: "region".into(),
                    optional,
                }),
                ..Default::default()
            }),
        };

        let pod = pod_with_env(vec![selector(None)]);
        let ledger = EnvLedger::new(&pod, 0, &mut cache).await.expect("ledger");
        let err = ledger
            .get_or_make(&pod, "REGION", &mut cache)
            .await
            .expect_err("mandatory key");
        assert!(matches!(err, InjectSkip::MissingKey { ref key, .. } if key == "region"));

        let pod = pod_with_env(vec![selector(Some(true))]);
        let var = ledger
            .get_or_make(&pod, "REGION", &mut cache)
            .await
            .expect("optional key");
        assert_eq!(var.value.as_deref(), Some(""));
    }

    #[tokio::test]
    async fn unsupported_sources_name_the_exact_field() {
        let reader = MemReader::new();
        let mut cache = KvCache::new(&reader, "apps");
        let pod = pod_with_env(vec![EnvVar {
            name: "POD_IP".into(),
            value: None,
            value_from: Some(EnvVarSource {
                field_ref: Some(ObjectFieldSelector {
                    field_path: "status.podIP".into(),
                    api_version: None,
                }),
                ..Default::default()
            }),
        }]);
        let ledger = EnvLedger::new(&pod, 0, &mut cache).await.expect("ledger");
        let err = ledger
            .validate(&pod, &["POD_IP"], &mut cache)
            .await
            .expect_err("fieldRef is unsupported");
        assert!(
            matches!(err, InjectSkip::UnsupportedSource { ref var, field } if var == "POD_IP" && field == "fieldRef")
        );
    }

    #[tokio::test]
    async fn env_from_imports_apply_prefix_and_override_order() {
        let reader = MemReader::new()
            .with_config_map(config_map("apps", "first", &[("SHARED", "from-first")]))
            .with_secret(Secret {
                metadata: ObjectMeta {
                    namespace: Some("apps".into()),
                    name: Some("second".into()),
                    ..Default::default()
                },
                data: Some(BTreeMap::from([(
                    "SHARED".to_string(),
                    ByteString(b"from-second".to_vec()),
                )])),
                ..Default::default()
            });
        let mut cache = KvCache::new(&reader, "apps");
        let mut pod = pod_with_env(vec![]);
        {
            let container = &mut containers_mut(&mut pod)[0];
            container.env_from = Some(vec![
                EnvFromSource {
                    config_map_ref: Some(ConfigMapEnvSource {
                        name: Some("first".into()),
                        optional: None,
                    }),
                    prefix: Some("CFG_".into()),
                    ..Default::default()
                },
                EnvFromSource {
                    secret_ref: Some(k8s_openapi::api::core::v1::SecretEnvSource {
                        name: Some("second".into()),
                        optional: None,
                    }),
                    prefix: Some("CFG_".into()),
                    ..Default::default()
                },
            ]);
        }
        let ledger = EnvLedger::new(&pod, 0, &mut cache).await.expect("ledger");
        assert!(ledger.exists(&pod, "CFG_SHARED"));
        let var = ledger
            .get_or_make(&pod, "CFG_SHARED", &mut cache)
            .await
            .expect("resolve");
        assert_eq!(var.value.as_deref(), Some("from-second"));
    }

    #[tokio::test]
    async fn secret_reference_resolves_through_cache_once() {
        let reader = MemReader::new();
        let mut cache = KvCache::new(&reader, "apps");
        let var = |name: &str| EnvVar {
            name: name.into(),
            value: None,
            value_from: Some(EnvVarSource {
                secret_key_ref: Some(SecretKeySelector {
                    name: Some("gone".into()),
                    key: "token".into(),
                    optional: Some(true),
                }),
                ..Default::default()
            }),
        };
        let pod = pod_with_env(vec![var("A"), var("B")]);
        let ledger = EnvLedger::new(&pod, 0, &mut cache).await.expect("ledger");
        ledger.get_or_make(&pod, "A", &mut cache).await.expect("optional");
        ledger.get_or_make(&pod, "B", &mut cache).await.expect("optional");
        // one fetch for the shared missing secret, memoized for the invocation
        assert_eq!(reader.lookups(), 1);
    }

    #[tokio::test]
    async fn concat_or_append_accumulates_without_doubled_separators() {
        let reader = MemReader::new();
        let mut cache = KvCache::new(&reader, "apps");
        let mut pod = pod_with_env(vec![plain_var("PATHISH", "x:")]);
        let ledger = EnvLedger::new(&pod, 0, &mut cache).await.expect("ledger");
        ledger
            .concat_or_append(&mut pod, "PATHISH", "y", ":", &mut cache)
            .await
            .expect("concat");
        assert_eq!(
            env_of(&containers(&pod)[0])[0].value.as_deref(),
            Some("x:y")
        );
    }
}
