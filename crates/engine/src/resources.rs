//! Resource Attribute Deriver: semantic identity attributes for a
//! (namespace, pod, container) triple, with three precedence tiers and an
//! ownership-chain walk.

use std::collections::{BTreeMap, BTreeSet};

use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;

use podtap_model::Instrumentation;
use podtap_store::{lookup_with_retry, Backoff, ClusterReader};

use crate::markers::RESOURCE_ATTRIBUTE_PREFIX;
use crate::sdk::ENV_OTEL_RESOURCE_ATTRIBUTES;
use crate::util::{annotation, containers, env_of, label};

pub const SERVICE_NAME: &str = "service.name";
pub const SERVICE_VERSION: &str = "service.version";
pub const SERVICE_NAMESPACE: &str = "service.namespace";
pub const SERVICE_INSTANCE_ID: &str = "service.instance.id";
pub const K8S_NAMESPACE_NAME: &str = "k8s.namespace.name";
pub const K8S_CONTAINER_NAME: &str = "k8s.container.name";
pub const K8S_POD_NAME: &str = "k8s.pod.name";
pub const K8S_POD_UID: &str = "k8s.pod.uid";
pub const K8S_NODE_NAME: &str = "k8s.node.name";
pub const K8S_REPLICASET_NAME: &str = "k8s.replicaset.name";
pub const K8S_REPLICASET_UID: &str = "k8s.replicaset.uid";
pub const K8S_DEPLOYMENT_NAME: &str = "k8s.deployment.name";
pub const K8S_DEPLOYMENT_UID: &str = "k8s.deployment.uid";
pub const K8S_STATEFULSET_NAME: &str = "k8s.statefulset.name";
pub const K8S_STATEFULSET_UID: &str = "k8s.statefulset.uid";
pub const K8S_DAEMONSET_NAME: &str = "k8s.daemonset.name";
pub const K8S_DAEMONSET_UID: &str = "k8s.daemonset.uid";
pub const K8S_JOB_NAME: &str = "k8s.job.name";
pub const K8S_JOB_UID: &str = "k8s.job.uid";
pub const K8S_CRONJOB_NAME: &str = "k8s.cronjob.name";
pub const K8S_CRONJOB_UID: &str = "k8s.cronjob.uid";

// Interpolation source variables, fed from the live pod identity once it is
// scheduled. Attributes unknown at admission time reference these by name.
pub const ENV_POD_NAME: &str = "OTEL_RESOURCE_ATTRIBUTES_POD_NAME";
pub const ENV_POD_UID: &str = "OTEL_RESOURCE_ATTRIBUTES_POD_UID";
pub const ENV_NODE_NAME: &str = "OTEL_RESOURCE_ATTRIBUTES_NODE_NAME";

// Workload grouping labels, consulted when the profile opts in.
pub const LABEL_APP_NAME: &str = "app.kubernetes.io/name";
pub const LABEL_APP_VERSION: &str = "app.kubernetes.io/version";
pub const LABEL_APP_PART_OF: &str = "app.kubernetes.io/part-of";

/// Derives the attribute map the Common SDK Configurator merges into the
/// aggregate attribute variable.
pub struct AttributeDeriver<'a> {
    reader: &'a dyn ClusterReader,
    backoff: Backoff,
}

impl<'a> AttributeDeriver<'a> {
    pub fn new(reader: &'a dyn ClusterReader, backoff: Backoff) -> Self {
        Self { reader, backoff }
    }

    /// Attribute keys pinned by the container's pre-existing aggregate
    /// attribute entry. These are inviolable: nothing below may override them.
    pub fn declared_keys(pod: &Pod, index: usize) -> BTreeSet<String> {
        let mut keys = BTreeSet::new();
        let Some(container) = containers(pod).get(index) else {
            return keys;
        };
        let Some(existing) = env_of(container)
            .iter()
            .find(|e| e.name == ENV_OTEL_RESOURCE_ATTRIBUTES)
        else {
            return keys;
        };
        for pair in existing.value.as_deref().unwrap_or("").split(',') {
            if let Some((key, _)) = pair.trim().split_once('=') {
                keys.insert(key.to_string());
            }
        }
        keys
    }

    /// Builds the map in tiers: profile-declared statics, live identity (with
    /// the ownership chain), then explicit per-key workload overrides.
    pub async fn resource_map(
        &self,
        inst: &Instrumentation,
        namespace: &str,
        pod: &Pod,
        index: usize,
    ) -> BTreeMap<String, String> {
        let declared = Self::declared_keys(pod, index);
        let mut out = BTreeMap::new();

        for (key, value) in &inst.spec.resource.attributes {
            if !declared.contains(key) {
                out.insert(key.clone(), value.clone());
            }
        }

        let container_name = containers(pod)
            .get(index)
            .map(|c| c.name.clone())
            .unwrap_or_default();
        let pod_name = pod.metadata.name.clone().unwrap_or_default();
        let mut identity = BTreeMap::new();
        identity.insert(K8S_NAMESPACE_NAME.to_string(), namespace.to_string());
        identity.insert(K8S_CONTAINER_NAME.to_string(), container_name.clone());
        // possibly empty when the pod comes from a controller template; the
        // configurator substitutes the interpolation placeholder later
        identity.insert(K8S_POD_NAME.to_string(), pod_name.clone());
        identity.insert(
            K8S_POD_UID.to_string(),
            pod.metadata.uid.clone().unwrap_or_default(),
        );
        identity.insert(
            K8S_NODE_NAME.to_string(),
            pod.spec
                .as_ref()
                .and_then(|s| s.node_name.clone())
                .unwrap_or_default(),
        );
        let pod_segment = if pod_name.is_empty() {
            format!("$({ENV_POD_NAME})")
        } else {
            pod_name
        };
        identity.insert(
            SERVICE_INSTANCE_ID.to_string(),
            service_instance_id(namespace, &pod_segment, &container_name),
        );
        self.owner_attributes(
            inst.spec.resource.add_k8s_uid_attributes,
            namespace,
            pod,
            &mut identity,
        )
        .await;
        for (key, value) in identity {
            if !declared.contains(&key) && !value.is_empty() {
                out.insert(key, value);
            }
        }

        // explicit per-attribute-key overrides on the workload itself; the
        // service name attribute is owned by the service-name derivation
        for (key, value) in resource_annotations(pod) {
            if key == SERVICE_NAME || declared.contains(&key) {
                continue;
            }
            out.insert(key, value);
        }

        if !declared.contains(SERVICE_NAMESPACE) && !out.contains_key(SERVICE_NAMESPACE) {
            if inst.spec.resource.use_labels_for_resource_attributes {
                let part_of = label(&pod.metadata, LABEL_APP_PART_OF);
                if !part_of.is_empty() {
                    out.insert(SERVICE_NAMESPACE.to_string(), part_of.to_string());
                }
            }
        }

        out
    }

    /// Walks the ownership chain upward, one bounded-retry lookup per hop.
    /// A ReplicaSet's parent (typically a Deployment) and a Job's parent
    /// (typically a CronJob) are resolved one level further.
    async fn owner_attributes(
        &self,
        uid: bool,
        namespace: &str,
        pod: &Pod,
        out: &mut BTreeMap<String, String>,
    ) {
        let mut queue: Vec<OwnerReference> =
            pod.metadata.owner_references.clone().unwrap_or_default();
        while let Some(owner) = queue.pop() {
            match owner.kind.to_ascii_lowercase().as_str() {
                "replicaset" => {
                    out.insert(K8S_REPLICASET_NAME.to_string(), owner.name.clone());
                    if uid {
                        out.insert(K8S_REPLICASET_UID.to_string(), owner.uid.clone());
                    }
                    let found = lookup_with_retry(
                        &self.backoff,
                        "ReplicaSet",
                        namespace,
                        &owner.name,
                        || self.reader.replica_set(namespace, &owner.name),
                    )
                    .await;
                    if let Some(rs) = found {
                        queue.extend(rs.metadata.owner_references.unwrap_or_default());
                    }
                }
                "job" => {
                    out.insert(K8S_JOB_NAME.to_string(), owner.name.clone());
                    if uid {
                        out.insert(K8S_JOB_UID.to_string(), owner.uid.clone());
                    }
                    let found = lookup_with_retry(
                        &self.backoff,
                        "Job",
                        namespace,
                        &owner.name,
                        || self.reader.job(namespace, &owner.name),
                    )
                    .await;
                    if let Some(job) = found {
                        queue.extend(job.metadata.owner_references.unwrap_or_default());
                    }
                }
                "deployment" => {
                    out.insert(K8S_DEPLOYMENT_NAME.to_string(), owner.name.clone());
                    if uid {
                        out.insert(K8S_DEPLOYMENT_UID.to_string(), owner.uid.clone());
                    }
                }
                "statefulset" => {
                    out.insert(K8S_STATEFULSET_NAME.to_string(), owner.name.clone());
                    if uid {
                        out.insert(K8S_STATEFULSET_UID.to_string(), owner.uid.clone());
                    }
                }
                "daemonset" => {
                    out.insert(K8S_DAEMONSET_NAME.to_string(), owner.name.clone());
                    if uid {
                        out.insert(K8S_DAEMONSET_UID.to_string(), owner.uid.clone());
                    }
                }
                "cronjob" => {
                    out.insert(K8S_CRONJOB_NAME.to_string(), owner.name.clone());
                    if uid {
                        out.insert(K8S_CRONJOB_UID.to_string(), owner.uid.clone());
                    }
                }
                _ => {}
            }
        }
    }
}

/// `resource.podtap.io/<key>` annotations on the workload.
fn resource_annotations(pod: &Pod) -> Vec<(String, String)> {
    pod.metadata
        .annotations
        .as_ref()
        .map(|annotations| {
            annotations
                .iter()
                .filter_map(|(key, value)| {
                    key.strip_prefix(RESOURCE_ATTRIBUTE_PREFIX)
                        .filter(|suffix| !suffix.is_empty())
                        .map(|suffix| (suffix.to_string(), value.clone()))
                })
                .collect()
        })
        .unwrap_or_default()
}

/// `<namespace>.<pod>.<container>`; skipped when any segment is empty.
fn service_instance_id(namespace: &str, pod_name: &str, container_name: &str) -> String {
    if namespace.is_empty() || pod_name.is_empty() || container_name.is_empty() {
        return String::new();
    }
    [namespace, pod_name, container_name].join(".")
}

/// Service name, in fixed priority: explicit override, grouping label (when
/// enabled), owning controller from most specific rollout-style kind down to
/// the bare pod name, and the container name as the last resort.
pub fn service_name(
    inst: &Instrumentation,
    pod: &Pod,
    attributes: &BTreeMap<String, String>,
    index: usize,
) -> String {
    let override_key = format!("{RESOURCE_ATTRIBUTE_PREFIX}{SERVICE_NAME}");
    let explicit = annotation(&pod.metadata, &override_key);
    if !explicit.is_empty() {
        return explicit.to_string();
    }
    if inst.spec.resource.use_labels_for_resource_attributes {
        let named = label(&pod.metadata, LABEL_APP_NAME);
        if !named.is_empty() {
            return named.to_string();
        }
    }
    for key in [
        K8S_DEPLOYMENT_NAME,
        K8S_STATEFULSET_NAME,
        K8S_DAEMONSET_NAME,
        K8S_JOB_NAME,
        K8S_CRONJOB_NAME,
        K8S_POD_NAME,
    ] {
        if let Some(value) = attributes.get(key) {
            if !value.is_empty() {
                return value.clone();
            }
        }
    }
    containers(pod)
        .get(index)
        .map(|c| c.name.clone())
        .unwrap_or_default()
}

/// Service version: grouping-version label (when enabled), else the tag of
/// the container image. A "tag" containing `/` means the colon delimited a
/// registry port, so the version stays undetermined.
pub fn service_version(inst: &Instrumentation, pod: &Pod, index: usize) -> Option<String> {
    if inst.spec.resource.use_labels_for_resource_attributes {
        let version = label(&pod.metadata, LABEL_APP_VERSION);
        if !version.is_empty() {
            return Some(version.to_string());
        }
    }
    let image = containers(pod).get(index)?.image.as_deref().unwrap_or("");
    match image.rsplit_once(':') {
        Some((_, tag)) if !tag.is_empty() && !tag.contains('/') => Some(tag.to_string()),
        _ => None,
    }
}

/// Renders the map as the `key=value,key=value` aggregate string, sorted by
/// key for a stable, repeatable result.
pub fn render_attributes(attributes: &BTreeMap<String, String>) -> String {
    attributes
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}
