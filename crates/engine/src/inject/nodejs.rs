//! Node.js SDK injection: `NODE_OPTIONS --require` hook plus the shared
//! volume and copy init step.

use k8s_openapi::api::core::v1::{Container, Pod};

use podtap_model::{InstrumentationSpec, NodeJsSpec};

use crate::env::{EnvLedger, KvCache};
use crate::error::InjectSkip;
use crate::select::Language;
use crate::util::{containers_mut, init_containers_mut};

use super::{
    add_mount_if_absent, add_volume_if_absent, append_spec_env, has_init_container, instr_volume,
    lang_mount_path, lang_volume, mount,
};

pub(crate) const ENV_NODE_OPTIONS: &str = "NODE_OPTIONS";

pub(crate) async fn inject(
    spec: &NodeJsSpec,
    inst: &InstrumentationSpec,
    pod: &mut Pod,
    index: usize,
    ledger: &EnvLedger,
    cache: &mut KvCache<'_>,
) -> Result<(), InjectSkip> {
    ledger.validate(pod, &[ENV_NODE_OPTIONS], cache).await?;
    append_spec_env(ledger, pod, &spec.env);

    let volume = lang_volume(Language::NodeJs);
    let path = lang_mount_path(Language::NodeJs);
    let require_argument = format!("--require {path}/autoinstrumentation.js");
    ledger
        .concat_or_append(pod, ENV_NODE_OPTIONS, &require_argument, " ", cache)
        .await?;

    add_mount_if_absent(&mut containers_mut(pod)[index], &volume, &path, false);

    if !has_init_container(pod, &volume) {
        add_volume_if_absent(
            pod,
            instr_volume(
                &volume,
                spec.volume_claim_template.as_ref(),
                spec.volume_size_limit.as_ref(),
            ),
        );
        init_containers_mut(pod).push(Container {
            name: volume.clone(),
            image: Some(spec.image.clone()),
            command: Some(vec!["cp".into(), "-a".into(), "/autoinstrumentation/.".into(), format!("{path}/")]),
            resources: Some(spec.resources.clone()),
            volume_mounts: Some(vec![mount(&volume, &path, false)]),
            image_pull_policy: inst.image_pull_policy.clone(),
            ..Default::default()
        });
    }
    Ok(())
}
