//! podtap model: instrumentation profile objects and engine feature flags.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{EnvVar, PersistentVolumeClaimTemplate, ResourceRequirements};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::{Deserialize, Serialize};

/// API coordinates of the stored profile kind.
pub const GROUP: &str = "podtap.io";
pub const VERSION: &str = "v1alpha1";
pub const KIND: &str = "Instrumentation";

/// A stored instrumentation profile, addressed by namespace/name.
///
/// Operators create these out of band; the engine only ever reads them.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Instrumentation {
    pub metadata: ObjectMeta,
    pub spec: InstrumentationSpec,
}

impl Instrumentation {
    pub fn name(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or("")
    }

    pub fn namespace(&self) -> &str {
        self.metadata.namespace.as_deref().unwrap_or("")
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InstrumentationSpec {
    pub exporter: Exporter,
    pub resource: ResourceConfig,
    pub propagators: Vec<Propagator>,
    pub sampler: Sampler,
    /// Entries applied (if absent) to every instrumented container, before
    /// any language-specific entries.
    pub env: Vec<EnvVar>,
    pub image_pull_policy: Option<String>,
    pub java: Option<JavaSpec>,
    pub nodejs: Option<NodeJsSpec>,
    pub python: Option<PythonSpec>,
    pub dotnet: Option<DotNetSpec>,
    pub go: Option<GoSpec>,
    pub apache_httpd: Option<ApacheHttpdSpec>,
    pub nginx: Option<NginxSpec>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Exporter {
    /// OTLP endpoint, e.g. `http://collector:4317`. Empty means "do not set".
    pub endpoint: String,
    pub tls: Option<TlsConfig>,
}

/// References to TLS material the exporter needs mounted into the workload.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TlsConfig {
    /// Secret holding client cert/key (and the CA unless `configMapName` is set).
    pub secret_name: String,
    /// Optional ConfigMap holding the CA certificate.
    pub config_map_name: String,
    /// CA file: key within the secret/configmap, or an absolute path.
    #[serde(rename = "ca_file")]
    pub ca_file: String,
    #[serde(rename = "cert_file")]
    pub cert_file: String,
    #[serde(rename = "key_file")]
    pub key_file: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ResourceConfig {
    /// Static attributes, lowest precedence tier.
    pub attributes: BTreeMap<String, String>,
    /// Also record unique-identifier attributes for the ownership chain.
    pub add_k8s_uid_attributes: bool,
    /// Let `app.kubernetes.io/*` workload labels feed service name/version/namespace.
    pub use_labels_for_resource_attributes: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Sampler {
    #[serde(rename = "type")]
    pub sampler_type: Option<SamplerType>,
    pub argument: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SamplerType {
    #[serde(rename = "always_on")]
    AlwaysOn,
    #[serde(rename = "always_off")]
    AlwaysOff,
    #[serde(rename = "traceidratio")]
    TraceIdRatio,
    #[serde(rename = "parentbased_always_on")]
    ParentBasedAlwaysOn,
    #[serde(rename = "parentbased_always_off")]
    ParentBasedAlwaysOff,
    #[serde(rename = "parentbased_traceidratio")]
    ParentBasedTraceIdRatio,
    #[serde(rename = "jaeger_remote")]
    JaegerRemote,
    #[serde(rename = "parentbased_jaeger_remote")]
    ParentBasedJaegerRemote,
    #[serde(rename = "xray")]
    XRay,
}

impl SamplerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SamplerType::AlwaysOn => "always_on",
            SamplerType::AlwaysOff => "always_off",
            SamplerType::TraceIdRatio => "traceidratio",
            SamplerType::ParentBasedAlwaysOn => "parentbased_always_on",
            SamplerType::ParentBasedAlwaysOff => "parentbased_always_off",
            SamplerType::ParentBasedTraceIdRatio => "parentbased_traceidratio",
            SamplerType::JaegerRemote => "jaeger_remote",
            SamplerType::ParentBasedJaegerRemote => "parentbased_jaeger_remote",
            SamplerType::XRay => "xray",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Propagator {
    #[serde(rename = "tracecontext")]
    TraceContext,
    #[serde(rename = "baggage")]
    Baggage,
    #[serde(rename = "b3")]
    B3,
    #[serde(rename = "b3multi")]
    B3Multi,
    #[serde(rename = "jaeger")]
    Jaeger,
    #[serde(rename = "xray")]
    XRay,
    #[serde(rename = "ottrace")]
    OtTrace,
    #[serde(rename = "none")]
    None,
}

impl Propagator {
    pub fn as_str(&self) -> &'static str {
        match self {
            Propagator::TraceContext => "tracecontext",
            Propagator::Baggage => "baggage",
            Propagator::B3 => "b3",
            Propagator::B3Multi => "b3multi",
            Propagator::Jaeger => "jaeger",
            Propagator::XRay => "xray",
            Propagator::OtTrace => "ottrace",
            Propagator::None => "none",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct JavaSpec {
    /// Distribution image the init step copies the agent from.
    pub image: String,
    pub volume_size_limit: Option<Quantity>,
    pub volume_claim_template: Option<PersistentVolumeClaimTemplate>,
    pub env: Vec<EnvVar>,
    pub resources: ResourceRequirements,
    /// Extra images contributing agent extension jars.
    pub extensions: Vec<JavaExtension>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct JavaExtension {
    pub image: String,
    /// Directory within the extension image to copy jars from.
    pub dir: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NodeJsSpec {
    pub image: String,
    pub volume_size_limit: Option<Quantity>,
    pub volume_claim_template: Option<PersistentVolumeClaimTemplate>,
    pub env: Vec<EnvVar>,
    pub resources: ResourceRequirements,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PythonSpec {
    pub image: String,
    pub volume_size_limit: Option<Quantity>,
    pub volume_claim_template: Option<PersistentVolumeClaimTemplate>,
    pub env: Vec<EnvVar>,
    pub resources: ResourceRequirements,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DotNetSpec {
    pub image: String,
    pub volume_size_limit: Option<Quantity>,
    pub volume_claim_template: Option<PersistentVolumeClaimTemplate>,
    pub env: Vec<EnvVar>,
    pub resources: ResourceRequirements,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GoSpec {
    pub image: String,
    pub env: Vec<EnvVar>,
    pub resources: ResourceRequirements,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ApacheHttpdSpec {
    pub image: String,
    pub volume_size_limit: Option<Quantity>,
    pub env: Vec<EnvVar>,
    /// Attributes rendered into the generated module configuration.
    pub attrs: Vec<EnvVar>,
    /// Server major.minor, drives module selection. Defaults to "2.4".
    pub version: String,
    /// Location of the shipped server configuration inside the image.
    pub config_path: String,
    pub resources: ResourceRequirements,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NginxSpec {
    pub image: String,
    pub volume_size_limit: Option<Quantity>,
    pub env: Vec<EnvVar>,
    pub attrs: Vec<EnvVar>,
    /// Main configuration file. Defaults to "/etc/nginx/nginx.conf".
    pub config_file: String,
    pub resources: ResourceRequirements,
}

/// Externally supplied switches consulted read-only by the orchestrator.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Flags {
    pub java: bool,
    pub nodejs: bool,
    pub python: bool,
    pub dotnet: bool,
    pub go: bool,
    pub apache_httpd: bool,
    pub nginx: bool,
    /// Allow explicit container targeting across several languages at once.
    pub multi_container: bool,
}

impl Default for Flags {
    fn default() -> Self {
        Self {
            java: true,
            nodejs: true,
            python: true,
            dotnet: true,
            go: false,
            apache_httpd: true,
            nginx: true,
            multi_container: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn profile_roundtrip_keeps_wire_names() {
        let raw = serde_json::json!({
            "metadata": { "name": "prof", "namespace": "apps" },
            "spec": {
                "exporter": {
                    "endpoint": "http://collector:4317",
                    "tls": { "secretName": "otlp-certs", "ca_file": "ca.crt" }
                },
                "sampler": { "type": "parentbased_traceidratio", "argument": "0.25" },
                "propagators": ["tracecontext", "b3"],
                "java": { "image": "ghcr.io/acme/java-agent:1.2.3" }
            }
        });
        let inst: Instrumentation = serde_json::from_value(raw).expect("deserialize");
        assert_eq!(inst.name(), "prof");
        assert_eq!(inst.namespace(), "apps");
        assert_eq!(
            inst.spec.sampler.sampler_type,
            Some(SamplerType::ParentBasedTraceIdRatio)
        );
        assert_eq!(inst.spec.propagators, vec![Propagator::TraceContext, Propagator::B3]);

        let back = serde_json::to_value(&inst).expect("serialize");
        assert_eq!(back["spec"]["sampler"]["type"], "parentbased_traceidratio");
        assert_eq!(back["spec"]["exporter"]["tls"]["ca_file"], "ca.crt");
    }

    #[test]
    fn flags_default_to_conservative_gates() {
        let flags = Flags::default();
        assert!(flags.java && flags.nodejs && flags.python && flags.dotnet);
        assert!(!flags.go, "go injection is opt-in");
        assert!(!flags.multi_container, "multi-container targeting is opt-in");
    }
}
