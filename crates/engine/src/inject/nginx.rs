//! Nginx injection. Like Apache, configured through files: a clone init step
//! snapshots the shipped configuration, an agent init step renders the
//! module config, and the application container loads the agent library.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Container, Pod};

use podtap_model::NginxSpec;

use crate::env::{EnvLedger, KvCache};
use crate::error::InjectSkip;
use crate::select::Language;
use crate::util::{containers, containers_mut, init_containers_mut, mounts_mut};

use super::{
    add_mount_if_absent, add_volume_if_absent, append_spec_env, has_init_container, instr_volume,
    lang_volume, mount,
};

const AGENT_DIR: &str = "/opt/podtap-webserver/agent";
const SOURCE_CONF_DIR: &str = "/opt/podtap-webserver/source-conf";
const DEFAULT_CONFIG_FILE: &str = "/etc/nginx/nginx.conf";

const ENV_LD_LIBRARY_PATH: &str = "LD_LIBRARY_PATH";

pub(crate) async fn inject(
    spec: &NginxSpec,
    endpoint: &str,
    pod: &mut Pod,
    index: usize,
    attributes: &BTreeMap<String, String>,
    ledger: &EnvLedger,
    cache: &mut KvCache<'_>,
) -> Result<(), InjectSkip> {
    if containers(pod).get(index).is_none() {
        return Err(InjectSkip::NoContainers);
    }
    ledger.validate(pod, &[ENV_LD_LIBRARY_PATH], cache).await?;
    append_spec_env(ledger, pod, &spec.env);

    let volume = lang_volume(Language::Nginx);
    let conf_volume = format!("{volume}-conf");
    let config_file = if spec.config_file.is_empty() {
        DEFAULT_CONFIG_FILE
    } else {
        spec.config_file.as_str()
    };
    let config_dir = config_file.rsplit_once('/').map(|(dir, _)| dir).unwrap_or("/etc/nginx");

    let clone_name = format!("{volume}-clone");
    if !has_init_container(pod, &clone_name) {
        add_volume_if_absent(
            pod,
            instr_volume(&conf_volume, None, spec.volume_size_limit.as_ref()),
        );
        let mut clone = containers(pod)[index].clone();
        clone.name = clone_name.clone();
        clone.command = Some(vec!["/bin/sh".into(), "-c".into()]);
        clone.args = Some(vec![format!("cp -r {config_dir}/* {SOURCE_CONF_DIR}")]);
        clone.resources = None;
        mounts_mut(&mut clone).push(mount(&conf_volume, SOURCE_CONF_DIR, false));
        init_containers_mut(pod).push(clone);

        let container = &mut containers_mut(pod)[index];
        if let Some(mounts) = container.volume_mounts.as_mut() {
            mounts.retain(|m| !m.mount_path.contains(config_dir));
        }
        add_mount_if_absent(container, &volume, AGENT_DIR, false);
        add_mount_if_absent(container, &conf_volume, config_dir, false);
    }

    if !has_init_container(pod, &volume) {
        add_volume_if_absent(pod, instr_volume(&volume, None, spec.volume_size_limit.as_ref()));
        init_containers_mut(pod).push(Container {
            name: volume.clone(),
            image: Some(spec.image.clone()),
            command: Some(vec!["/bin/sh".into(), "-c".into()]),
            args: Some(vec![agent_setup_script(endpoint, attributes, config_file)]),
            env: Some(spec.attrs.clone()),
            resources: Some(spec.resources.clone()),
            volume_mounts: Some(vec![
                mount(&volume, AGENT_DIR, false),
                mount(&conf_volume, SOURCE_CONF_DIR, false),
            ]),
            ..Default::default()
        });
    }

    // the module's shared objects must be on the loader path of the server
    ledger
        .concat_or_append(
            pod,
            ENV_LD_LIBRARY_PATH,
            &format!("{AGENT_DIR}/sdk_lib/lib"),
            ":",
            cache,
        )
        .await?;
    Ok(())
}

pub(crate) fn init_names() -> Vec<String> {
    let volume = lang_volume(Language::Nginx);
    vec![format!("{volume}-clone"), volume]
}

/// Opaque templated body of the agent init step: copies the agent, renders
/// the module configuration, and prepends the load directive to the
/// snapshotted main config file.
fn agent_setup_script(
    endpoint: &str,
    attributes: &BTreeMap<String, String>,
    config_file: &str,
) -> String {
    let file_name = config_file.rsplit_once('/').map(|(_, f)| f).unwrap_or("nginx.conf");
    let conf = format!("{SOURCE_CONF_DIR}/podtap_agent.conf");
    let mut script = format!(
        "cp -r /opt/opentelemetry/. {AGENT_DIR}/ && \
         echo 'NginxModuleEnabled ON;' > {conf} && \
         echo 'NginxModuleOtelSpanExporter otlp;' >> {conf} && \
         echo 'NginxModuleOtelExporterEndpoint {endpoint};' >> {conf}"
    );
    for (key, value) in attributes {
        script.push_str(&format!(
            " && echo 'NginxModuleResourceAttribute {key}={value};' >> {conf}"
        ));
    }
    script.push_str(&format!(
        " && sed -i \"1s|^|load_module {AGENT_DIR}/WebServerModule/Nginx/ngx_http_opentelemetry_module.so;\\n|\" {SOURCE_CONF_DIR}/{file_name}"
    ));
    script
}
