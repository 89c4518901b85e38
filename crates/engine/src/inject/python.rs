//! Python SDK injection: `PYTHONPATH` sandwich, OTLP protocol defaults, and
//! the shared volume with its copy init step.

use k8s_openapi::api::core::v1::{Container, Pod};

use podtap_model::{InstrumentationSpec, PythonSpec};

use crate::env::{concat_all, EnvLedger, KvCache};
use crate::error::InjectSkip;
use crate::select::Language;
use crate::util::{containers_mut, init_containers_mut, plain_var};

use super::{
    add_mount_if_absent, add_volume_if_absent, append_spec_env, has_init_container, instr_volume,
    lang_mount_path, lang_volume, mount,
};

pub(crate) const ENV_PYTHONPATH: &str = "PYTHONPATH";
const ENV_TRACES_EXPORTER: &str = "OTEL_TRACES_EXPORTER";
const ENV_METRICS_EXPORTER: &str = "OTEL_METRICS_EXPORTER";
const ENV_LOGS_EXPORTER: &str = "OTEL_LOGS_EXPORTER";
const ENV_TRACES_PROTOCOL: &str = "OTEL_EXPORTER_OTLP_TRACES_PROTOCOL";
const ENV_METRICS_PROTOCOL: &str = "OTEL_EXPORTER_OTLP_METRICS_PROTOCOL";

pub(crate) async fn inject(
    spec: &PythonSpec,
    inst: &InstrumentationSpec,
    pod: &mut Pod,
    index: usize,
    ledger: &EnvLedger,
    cache: &mut KvCache<'_>,
) -> Result<(), InjectSkip> {
    ledger.validate(pod, &[ENV_PYTHONPATH], cache).await?;
    append_spec_env(ledger, pod, &spec.env);

    let volume = lang_volume(Language::Python);
    let path = lang_mount_path(Language::Python);

    // the sitecustomize shim must come first on the path, the distribution
    // packages last, whatever the application already carries in between
    let shim = format!("{path}/opentelemetry/instrumentation/auto_instrumentation");
    let existing = ledger.get_or_make(pod, ENV_PYTHONPATH, cache).await?;
    let sandwiched = concat_all(
        ":",
        &[
            shim.as_str(),
            existing.value.as_deref().unwrap_or(""),
            path.as_str(),
        ],
    );
    ledger.set_or_append(pod, plain_var(ENV_PYTHONPATH, &sandwiched));

    ledger.append_if_not_exists(pod, ENV_TRACES_EXPORTER, "otlp");
    ledger.append_if_not_exists(pod, ENV_TRACES_PROTOCOL, "http/protobuf");
    ledger.append_if_not_exists(pod, ENV_METRICS_EXPORTER, "otlp");
    ledger.append_if_not_exists(pod, ENV_METRICS_PROTOCOL, "http/protobuf");
    ledger.append_if_not_exists(pod, ENV_LOGS_EXPORTER, "otlp");

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
