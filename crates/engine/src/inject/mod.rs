//! Per-language injectors. Each one owns its language's environment hook,
//! the shared agent volume, and the init step that populates it from the
//! distribution image.

pub(crate) mod apache;
pub(crate) mod dotnet;
pub(crate) mod golang;
pub(crate) mod java;
pub(crate) mod nginx;
pub(crate) mod nodejs;
pub(crate) mod python;

use k8s_openapi::api::core::v1::{
    Container, EmptyDirVolumeSource, EnvVar, EphemeralVolumeSource,
    PersistentVolumeClaimTemplate, Pod, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

use crate::env::EnvLedger;
use crate::select::Language;
use crate::util::{containers, init_containers, init_containers_mut, mounts_mut, volumes, volumes_mut};

/// Prefix shared by every injected volume, init step, and sidecar; also the
/// signal that a pod has been instrumented before.
pub(crate) const INSTR_PREFIX: &str = "podtap-instr";

/// Volume and init-step name for one language.
pub(crate) fn lang_volume(language: Language) -> String {
    format!("{INSTR_PREFIX}-{}", language.as_str())
}

/// Mount point of the language's shared volume inside the containers.
pub(crate) fn lang_mount_path(language: Language) -> String {
    format!("/{INSTR_PREFIX}-{}", language.as_str())
}

/// Prior injection is detected by the presence of any podtap-named init step
/// or sidecar.
pub(crate) fn already_injected(pod: &Pod) -> bool {
    init_containers(pod)
        .iter()
        .chain(containers(pod).iter())
        .any(|c| c.name.starts_with(INSTR_PREFIX))
}

pub(crate) fn has_init_container(pod: &Pod, name: &str) -> bool {
    init_containers(pod).iter().any(|c| c.name == name)
}

/// The shared agent volume: a claim template wins over a bounded EmptyDir.
pub(crate) fn instr_volume(
    name: &str,
    claim: Option<&PersistentVolumeClaimTemplate>,
    size_limit: Option<&Quantity>,
) -> Volume {
    if let Some(template) = claim {
        Volume {
            name: name.to_string(),
            ephemeral: Some(EphemeralVolumeSource {
                volume_claim_template: Some(template.clone()),
            }),
            ..Default::default()
        }
    } else {
        Volume {
            name: name.to_string(),
            empty_dir: Some(EmptyDirVolumeSource {
                size_limit: size_limit.cloned(),
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

/// Re-declaring an already-present volume is a no-op, matched by name.
pub(crate) fn add_volume_if_absent(pod: &mut Pod, volume: Volume) {
    if !volumes(pod).iter().any(|v| v.name == volume.name) {
        volumes_mut(pod).push(volume);
    }
}

pub(crate) fn mount(name: &str, path: &str, read_only: bool) -> VolumeMount {
    VolumeMount {
        name: name.to_string(),
        mount_path: path.to_string(),
        read_only: read_only.then_some(true),
        ..Default::default()
    }
}

/// Re-declaring an already-present mount is a no-op, matched by name.
pub(crate) fn add_mount_if_absent(container: &mut Container, name: &str, path: &str, read_only: bool) {
    let mounts = mounts_mut(container);
    if !mounts.iter().any(|m| m.name == name) {
        mounts.push(mount(name, path, read_only));
    }
}

/// Language-spec env entries, applied only where absent.
pub(crate) fn append_spec_env(ledger: &EnvLedger, pod: &mut Pod, env: &[EnvVar]) {
    for var in env {
        ledger.append_var_if_not_exists(pod, var.clone());
    }
}

/// Init steps run with the security context of the container they serve.
pub(crate) fn propagate_security_context(pod: &mut Pod, app_index: usize, init_names: &[String]) {
    let context = containers(pod)
        .get(app_index)
        .and_then(|c| c.security_context.clone());
    for init in init_containers_mut(pod) {
        if init_names.iter().any(|name| *name == init.name) {
            init.security_context = context.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::PodSpec;

    #[test]
    fn volume_declaration_is_idempotent_by_name() {
        let mut pod = Pod {
            spec: Some(PodSpec::default()),
            ..Default::default()
        };
        add_volume_if_absent(&mut pod, instr_volume("podtap-instr-java", None, None));
        add_volume_if_absent(&mut pod, instr_volume("podtap-instr-java", None, None));
        assert_eq!(volumes(&pod).len(), 1);
    }

    #[test]
    fn claim_template_wins_over_empty_dir() {
        let template = PersistentVolumeClaimTemplate::default();
        let volume = instr_volume("v", Some(&template), Some(&Quantity("200Mi".into())));
        assert!(volume.ephemeral.is_some());
        assert!(volume.empty_dir.is_none());

        let bounded = instr_volume("v", None, Some(&Quantity("200Mi".into())));
        assert_eq!(
            bounded.empty_dir.and_then(|e| e.size_limit),
            Some(Quantity("200Mi".into()))
        );
    }

    #[test]
    fn sidecar_or_init_presence_marks_prior_injection() {
        let mut pod = Pod {
            spec: Some(PodSpec {
                containers: vec![Container {
                    name: "app".into(),
                    ..Default::default()
                }],
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(!already_injected(&pod));
        init_containers_mut(&mut pod).push(Container {
            name: "podtap-instr-java".into(),
            ..Default::default()
        });
        assert!(already_injected(&pod));
    }
}
