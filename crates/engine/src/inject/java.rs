//! Java agent injection: `JAVA_TOOL_OPTIONS` hook, shared agent volume, one
//! copy init step, plus one init step per extension image.

use k8s_openapi::api::core::v1::{Container, Pod};

use podtap_model::{InstrumentationSpec, JavaSpec};

use crate::env::{EnvLedger, KvCache};
use crate::error::InjectSkip;
use crate::select::Language;
use crate::util::containers_mut;

use super::{
    add_mount_if_absent, add_volume_if_absent, append_spec_env, has_init_container, instr_volume,
    lang_mount_path, lang_volume, mount,
};

pub(crate) const ENV_JAVA_TOOL_OPTIONS: &str = "JAVA_TOOL_OPTIONS";

pub(crate) async fn inject(
    spec: &JavaSpec,
    inst: &InstrumentationSpec,
    pod: &mut Pod,
    index: usize,
    ledger: &EnvLedger,
    cache: &mut KvCache<'_>,
) -> Result<(), InjectSkip> {
    ledger.validate(pod, &[ENV_JAVA_TOOL_OPTIONS], cache).await?;
    append_spec_env(ledger, pod, &spec.env);

    let volume = lang_volume(Language::Java);
    let path = lang_mount_path(Language::Java);
    let mut jvm_argument = format!("-javaagent:{path}/javaagent.jar");
    if !spec.extensions.is_empty() {
        jvm_argument.push_str(&format!(" -Dotel.javaagent.extensions={path}/extensions"));
    }
    ledger
        .concat_or_append(pod, ENV_JAVA_TOOL_OPTIONS, &jvm_argument, " ", cache)
        .await?;

    add_mount_if_absent(&mut containers_mut(pod)[index], &volume, &path, false);

    // volume and init steps are shared by every instrumented container
    if !has_init_container(pod, &volume) {
        add_volume_if_absent(
            pod,
            instr_volume(
                &volume,
                spec.volume_claim_template.as_ref(),
                spec.volume_size_limit.as_ref(),
            ),
        );
        let inits = crate::util::init_containers_mut(pod);
        inits.push(Container {
            name: volume.clone(),
            image: Some(spec.image.clone()),
            command: Some(vec![
                "cp".into(),
                "/javaagent.jar".into(),
                format!("{path}/javaagent.jar"),
            ]),
            resources: Some(spec.resources.clone()),
            volume_mounts: Some(vec![mount(&volume, &path, false)]),
            image_pull_policy: inst.image_pull_policy.clone(),
            ..Default::default()
        });
        for (i, extension) in spec.extensions.iter().enumerate() {
            inits.push(Container {
                name: format!("{volume}-ext-{i}"),
                image: Some(extension.image.clone()),
                command: Some(vec![
                    "cp".into(),
                    "-r".into(),
                    format!("{}/.", extension.dir),
                    format!("{path}/extensions"),
                ]),
                resources: Some(spec.resources.clone()),
                volume_mounts: Some(vec![mount(&volume, &path, false)]),
                ..Default::default()
            });
        }
    }
    Ok(())
}

/// Init-step names this injector creates, for security-context propagation.
pub(crate) fn init_names(spec: &JavaSpec) -> Vec<String> {
    let volume = lang_volume(Language::Java);
    let mut names = vec![volume.clone()];
    names.extend((0..spec.extensions.len()).map(|i| format!("{volume}-ext-{i}")));
    names
}
