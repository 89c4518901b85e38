//! Apache httpd injection. The server is configured through files rather
//! than env vars: a clone init step snapshots the shipped configuration, an
//! agent init step materializes the module config into a shared conf volume.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Container, Pod};

use podtap_model::ApacheHttpdSpec;

use crate::env::EnvLedger;
use crate::error::InjectSkip;
use crate::select::Language;
use crate::util::{containers, containers_mut, init_containers_mut, mounts_mut};

use super::{
    add_mount_if_absent, add_volume_if_absent, append_spec_env, has_init_container, instr_volume,
    lang_volume, mount,
};

const AGENT_DIR: &str = "/opt/podtap-webserver/agent";
const SOURCE_CONF_DIR: &str = "/opt/podtap-webserver/source-conf";
const DEFAULT_CONFIG_PATH: &str = "/usr/local/apache2/conf";
const DEFAULT_VERSION: &str = "2.4";

const ENV_AGENT_CONF: &str = "OTEL_APACHE_AGENT_CONF";

pub(crate) async fn inject(
    spec: &ApacheHttpdSpec,
    endpoint: &str,
    pod: &mut Pod,
    index: usize,
    attributes: &BTreeMap<String, String>,
    ledger: &EnvLedger,
) -> Result<(), InjectSkip> {
    if containers(pod).get(index).is_none() {
        return Err(InjectSkip::NoContainers);
    }
    append_spec_env(ledger, pod, &spec.env);

    let volume = lang_volume(Language::ApacheHttpd);
    let conf_volume = format!("{volume}-conf");
    let config_path = if spec.config_path.is_empty() {
        DEFAULT_CONFIG_PATH
    } else {
        spec.config_path.as_str()
    };

    // snapshot the server's own configuration before the conf volume shadows it
    let clone_name = format!("{volume}-clone");
    if !has_init_container(pod, &clone_name) {
        add_volume_if_absent(
            pod,
            instr_volume(&conf_volume, None, spec.volume_size_limit.as_ref()),
        );
        let mut clone = containers(pod)[index].clone();
        clone.name = clone_name.clone();
        clone.command = Some(vec!["/bin/sh".into(), "-c".into()]);
        clone.args = Some(vec![format!("cp -r {config_path}/* {SOURCE_CONF_DIR}")]);
        // the copy step must not hold the application's reservations
        clone.resources = None;
        mounts_mut(&mut clone).push(mount(&conf_volume, SOURCE_CONF_DIR, false));
        init_containers_mut(pod).push(clone);

        let container = &mut containers_mut(pod)[index];
        // a volume-provided conf mount would overwrite the rewritten one
        if let Some(mounts) = container.volume_mounts.as_mut() {
            mounts.retain(|m| !m.mount_path.contains(config_path));
        }
        add_mount_if_absent(container, &volume, AGENT_DIR, false);
        add_mount_if_absent(container, &conf_volume, config_path, false);
    }

    if !has_init_container(pod, &volume) {
        add_volume_if_absent(pod, instr_volume(&volume, None, spec.volume_size_limit.as_ref()));
        let version = if spec.version.is_empty() {
            DEFAULT_VERSION
        } else {
            spec.version.as_str()
        };
        init_containers_mut(pod).push(Container {
            name: volume.clone(),
            image: Some(spec.image.clone()),
            command: Some(vec!["/bin/sh".into(), "-c".into()]),
            args: Some(vec![agent_setup_script(version, endpoint, attributes)]),
            env: Some(spec.attrs.clone()),
            resources: Some(spec.resources.clone()),
            volume_mounts: Some(vec![
                mount(&volume, AGENT_DIR, false),
                mount(&conf_volume, SOURCE_CONF_DIR, false),
            ]),
            ..Default::default()
        });
    }

    ledger.append_if_not_exists(pod, ENV_AGENT_CONF, SOURCE_CONF_DIR);
    Ok(())
}

pub(crate) fn init_names() -> Vec<String> {
    let volume = lang_volume(Language::ApacheHttpd);
    vec![format!("{volume}-clone"), volume]
}

/// Opaque templated body of the agent init step: copies the agent, renders
/// the module configuration with the derived attributes, and splices the
/// include into the snapshotted server configuration.
fn agent_setup_script(
    version: &str,
    endpoint: &str,
    attributes: &BTreeMap<String, String>,
) -> String {
    let module_suffix = if version.starts_with("2.2") { "22" } else { "" };
    let conf = format!("{SOURCE_CONF_DIR}/podtap_agent.conf");
    let mut script = format!(
        "cp -r /opt/opentelemetry/. {AGENT_DIR}/ && \
         echo 'LoadModule otel_apache_module {AGENT_DIR}/WebServerModule/Apache/libmod_apache_otel{module_suffix}.so' > {conf} && \
         echo 'ApacheModuleOtelSpanExporter otlp' >> {conf} && \
         echo 'ApacheModuleOtelExporterEndpoint {endpoint}' >> {conf}"
    );
    for (key, value) in attributes {
        script.push_str(&format!(
            " && echo 'ApacheModuleResourceAttribute {key}={value}' >> {conf}"
        ));
    }
    script.push_str(&format!(
        " && echo 'Include {SOURCE_CONF_DIR}/podtap_agent.conf' >> {SOURCE_CONF_DIR}/httpd.conf"
    ));
    script
}
