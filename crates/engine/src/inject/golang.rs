//! Go instrumentation: a privileged eBPF agent sidecar rather than an init
//! step, targeting exactly one application container.

use k8s_openapi::api::core::v1::{
    Capabilities, Container, HostPathVolumeSource, Pod, SecurityContext, Volume,
};

use podtap_model::GoSpec;

use crate::error::InjectSkip;
use crate::select::Language;
use crate::util::{containers, containers_mut, env_of, plain_var, spec_mut};

use super::{add_volume_if_absent, lang_volume, mount};

pub(crate) const ENV_TARGET_EXE: &str = "OTEL_GO_AUTO_TARGET_EXE";

const KERNEL_DEBUG_VOLUME: &str = "podtap-instr-kernel-debug";
const KERNEL_DEBUG_PATH: &str = "/sys/kernel/debug";

/// Appends the agent sidecar and returns its container index.
pub(crate) fn inject(
    spec: &GoSpec,
    pod: &mut Pod,
    target_exe: &str,
) -> Result<usize, InjectSkip> {
    let sidecar_name = lang_volume(Language::Go);
    if containers(pod).iter().any(|c| c.name == sidecar_name) {
        return Err(InjectSkip::AlreadySet {
            what: format!("agent sidecar {sidecar_name}"),
        });
    }

    // the agent attaches to the target process across container boundaries
    spec_mut(pod).share_process_namespace = Some(true);
    add_volume_if_absent(
        pod,
        Volume {
            name: KERNEL_DEBUG_VOLUME.to_string(),
            host_path: Some(HostPathVolumeSource {
                path: KERNEL_DEBUG_PATH.to_string(),
                type_: None,
            }),
            ..Default::default()
        },
    );

    let mut env = spec.env.clone();
    if !target_exe.is_empty() && !env.iter().any(|e| e.name == ENV_TARGET_EXE) {
        env.push(plain_var(ENV_TARGET_EXE, target_exe));
    }

    containers_mut(pod).push(Container {
        name: sidecar_name,
        image: Some(spec.image.clone()),
        env: Some(env),
        resources: Some(spec.resources.clone()),
        security_context: Some(SecurityContext {
            privileged: Some(true),
            run_as_user: Some(0),
            capabilities: Some(Capabilities {
                add: Some(vec!["SYS_PTRACE".into()]),
                drop: None,
            }),
            ..Default::default()
        }),
        volume_mounts: Some(vec![mount(KERNEL_DEBUG_VOLUME, KERNEL_DEBUG_PATH, false)]),
        ..Default::default()
    });
    Ok(containers(pod).len() - 1)
}

/// After the common configuration ran, the sidecar must know its target
/// executable; without one the whole Go injection is reverted.
pub(crate) fn has_target_exe(pod: &Pod, sidecar_index: usize) -> bool {
    containers(pod)
        .get(sidecar_index)
        .map(|sidecar| env_of(sidecar).iter().any(|e| e.name == ENV_TARGET_EXE))
        .unwrap_or(false)
}
