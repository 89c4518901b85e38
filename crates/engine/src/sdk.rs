//! Common SDK configuration, applied to the container selected as the
//! telemetry producer's agent: service name, exporter wiring, identity
//! interpolation sources, the aggregate attribute variable, propagators and
//! sampler.

use k8s_openapi::api::core::v1::{EnvVar, EnvVarSource, ObjectFieldSelector, Pod};

use podtap_model::Instrumentation;

use crate::env::{EnvLedger, KvCache};
use crate::error::InjectSkip;
use crate::exporter;
use crate::resources::{
    self, AttributeDeriver, ENV_NODE_NAME, ENV_POD_NAME, ENV_POD_UID, K8S_NODE_NAME, K8S_POD_NAME,
    K8S_POD_UID, SERVICE_VERSION,
};

pub(crate) const ENV_OTEL_SERVICE_NAME: &str = "OTEL_SERVICE_NAME";
pub(crate) const ENV_OTEL_EXPORTER_OTLP_ENDPOINT: &str = "OTEL_EXPORTER_OTLP_ENDPOINT";
pub const ENV_OTEL_RESOURCE_ATTRIBUTES: &str = "OTEL_RESOURCE_ATTRIBUTES";
pub(crate) const ENV_OTEL_PROPAGATORS: &str = "OTEL_PROPAGATORS";
pub(crate) const ENV_OTEL_TRACES_SAMPLER: &str = "OTEL_TRACES_SAMPLER";
pub(crate) const ENV_OTEL_TRACES_SAMPLER_ARG: &str = "OTEL_TRACES_SAMPLER_ARG";

fn downward_var(name: &str, field_path: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: None,
        value_from: Some(EnvVarSource {
            field_ref: Some(ObjectFieldSelector {
                field_path: field_path.to_string(),
                api_version: None,
            }),
            ..Default::default()
        }),
    }
}

/// `agent_index` is the container carrying the SDK configuration;
/// `producer_index` is the one producing the telemetry. They coincide except
/// for sidecar-agent languages.
#[allow(clippy::too_many_arguments)]
pub(crate) async fn configure(
    inst: &Instrumentation,
    namespace: &str,
    pod: &mut Pod,
    ledger: &EnvLedger,
    agent_index: usize,
    producer_index: usize,
    deriver: &AttributeDeriver<'_>,
    cache: &mut KvCache<'_>,
) -> Result<(), InjectSkip> {
    let declared = AttributeDeriver::declared_keys(pod, producer_index);
    let mut attributes = deriver
        .resource_map(inst, namespace, pod, producer_index)
        .await;

    // service name first: it must see inferred controller names, not the
    // interpolation placeholders added below
    if !ledger.exists(pod, ENV_OTEL_SERVICE_NAME) {
        let name = resources::service_name(inst, pod, &attributes, producer_index);
        ledger.append(pod, ENV_OTEL_SERVICE_NAME, &name);
    }

    if !inst.spec.exporter.endpoint.is_empty() {
        ledger.append_if_not_exists(
            pod,
            ENV_OTEL_EXPORTER_OTLP_ENDPOINT,
            &inst.spec.exporter.endpoint,
        );
    }
    if let Some(tls) = &inst.spec.exporter.tls {
        exporter::configure_tls(tls, pod, ledger, agent_index);
    }

    // identity values unknown at admission time become interpolation targets
    // bound to downward-API source variables
    if !declared.contains(K8S_POD_NAME)
        && attributes.get(K8S_POD_NAME).map_or(true, |v| v.is_empty())
    {
        ledger.append_var_if_not_exists(pod, downward_var(ENV_POD_NAME, "metadata.name"));
        attributes.insert(K8S_POD_NAME.to_string(), format!("$({ENV_POD_NAME})"));
    }
    if inst.spec.resource.add_k8s_uid_attributes
        && !declared.contains(K8S_POD_UID)
        && attributes.get(K8S_POD_UID).map_or(true, |v| v.is_empty())
    {
        ledger.append_var_if_not_exists(pod, downward_var(ENV_POD_UID, "metadata.uid"));
        attributes.insert(K8S_POD_UID.to_string(), format!("$({ENV_POD_UID})"));
    }
    if !declared.contains(K8S_NODE_NAME)
        && attributes.get(K8S_NODE_NAME).map_or(true, |v| v.is_empty())
    {
        ledger.append_var_if_not_exists(pod, downward_var(ENV_NODE_NAME, "spec.nodeName"));
        attributes.insert(K8S_NODE_NAME.to_string(), format!("$({ENV_NODE_NAME})"));
    }

    if !declared.contains(SERVICE_VERSION) && !attributes.contains_key(SERVICE_VERSION) {
        if let Some(version) = resources::service_version(inst, pod, producer_index) {
            attributes.insert(SERVICE_VERSION.to_string(), version);
        }
    }

    let rendered = resources::render_attributes(&attributes);
    if !rendered.is_empty() {
        ledger
            .concat_or_append(pod, ENV_OTEL_RESOURCE_ATTRIBUTES, &rendered, ",", cache)
            .await?;
    }

    if !inst.spec.propagators.is_empty() && !ledger.exists(pod, ENV_OTEL_PROPAGATORS) {
        let joined = inst
            .spec
            .propagators
            .iter()
            .map(|p| p.as_str())
            .collect::<Vec<_>>()
            .join(",");
        ledger.append(pod, ENV_OTEL_PROPAGATORS, &joined);
    }

    // sampler only when wholly absent: a user-set sampler or argument wins
    if let Some(sampler) = inst.spec.sampler.sampler_type {
        if !ledger.exists(pod, ENV_OTEL_TRACES_SAMPLER)
            && !ledger.exists(pod, ENV_OTEL_TRACES_SAMPLER_ARG)
        {
            ledger.append(pod, ENV_OTEL_TRACES_SAMPLER, sampler.as_str());
            if !inst.spec.sampler.argument.is_empty() {
                ledger.append(pod, ENV_OTEL_TRACES_SAMPLER_ARG, &inst.spec.sampler.argument);
            }
        }
    }

    // the aggregate interpolates earlier entries by name; every referenced
    // variable must be defined before it is read
    ledger.move_to_end(pod, ENV_OTEL_RESOURCE_ATTRIBUTES);
    Ok(())
}
