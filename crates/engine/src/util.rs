//! Accessors over the optional fields of pod specs.

use k8s_openapi::api::core::v1::{Container, EnvVar, Pod, PodSpec, Volume, VolumeMount};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

pub(crate) fn spec_mut(pod: &mut Pod) -> &mut PodSpec {
    pod.spec.get_or_insert_with(PodSpec::default)
}

pub(crate) fn containers(pod: &Pod) -> &[Container] {
    pod.spec
        .as_ref()
        .map(|s| s.containers.as_slice())
        .unwrap_or(&[])
}

pub(crate) fn containers_mut(pod: &mut Pod) -> &mut Vec<Container> {
    &mut spec_mut(pod).containers
}

pub(crate) fn init_containers(pod: &Pod) -> &[Container] {
    pod.spec
        .as_ref()
        .and_then(|s| s.init_containers.as_deref())
        .unwrap_or(&[])
}

pub(crate) fn init_containers_mut(pod: &mut Pod) -> &mut Vec<Container> {
    spec_mut(pod).init_containers.get_or_insert_with(Vec::new)
}

pub(crate) fn volumes(pod: &Pod) -> &[Volume] {
    pod.spec
        .as_ref()
        .and_then(|s| s.volumes.as_deref())
        .unwrap_or(&[])
}

pub(crate) fn volumes_mut(pod: &mut Pod) -> &mut Vec<Volume> {
    spec_mut(pod).volumes.get_or_insert_with(Vec::new)
}

pub(crate) fn env_of(container: &Container) -> &[EnvVar] {
    container.env.as_deref().unwrap_or(&[])
}

pub(crate) fn env_mut(container: &mut Container) -> &mut Vec<EnvVar> {
    container.env.get_or_insert_with(Vec::new)
}

pub(crate) fn mounts_mut(container: &mut Container) -> &mut Vec<VolumeMount> {
    container.volume_mounts.get_or_insert_with(Vec::new)
}

pub(crate) fn annotation<'a>(meta: &'a ObjectMeta, key: &str) -> &'a str {
    meta.annotations
        .as_ref()
        .and_then(|a| a.get(key))
        .map(String::as_str)
        .unwrap_or("")
}

pub(crate) fn label<'a>(meta: &'a ObjectMeta, key: &str) -> &'a str {
    meta.labels
        .as_ref()
        .and_then(|l| l.get(key))
        .map(String::as_str)
        .unwrap_or("")
}

pub(crate) fn plain_var(name: &str, value: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.to_string()),
        value_from: None,
    }
}
