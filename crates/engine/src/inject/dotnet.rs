//! .NET SDK injection: CLR profiler hook with glibc/musl runtime selection.

use k8s_openapi::api::core::v1::{Container, Pod};

use podtap_model::{DotNetSpec, InstrumentationSpec};

use crate::env::{EnvLedger, KvCache};
use crate::error::InjectSkip;
use crate::select::Language;
use crate::util::{containers_mut, init_containers_mut};

use super::{
    add_mount_if_absent, add_volume_if_absent, append_spec_env, has_init_container, instr_volume,
    lang_mount_path, lang_volume, mount,
};

const ENV_CORECLR_ENABLE_PROFILING: &str = "CORECLR_ENABLE_PROFILING";
const ENV_CORECLR_PROFILER: &str = "CORECLR_PROFILER";
const ENV_CORECLR_PROFILER_PATH: &str = "CORECLR_PROFILER_PATH";
const ENV_DOTNET_STARTUP_HOOKS: &str = "DOTNET_STARTUP_HOOKS";
const ENV_DOTNET_ADDITIONAL_DEPS: &str = "DOTNET_ADDITIONAL_DEPS";
const ENV_DOTNET_SHARED_STORE: &str = "DOTNET_SHARED_STORE";
const ENV_DOTNET_AUTO_HOME: &str = "OTEL_DOTNET_AUTO_HOME";

const PROFILER_CLSID: &str = "{918728DD-259F-4A6A-AC2B-B85E1B658318}";

pub(crate) const RUNTIME_GLIBC: &str = "linux-x64";
pub(crate) const RUNTIME_MUSL: &str = "linux-musl-x64";

pub(crate) async fn inject(
    spec: &DotNetSpec,
    inst: &InstrumentationSpec,
    pod: &mut Pod,
    index: usize,
    runtime: &str,
    ledger: &EnvLedger,
    cache: &mut KvCache<'_>,
) -> Result<(), InjectSkip> {
    let runtime_dir = match runtime {
        "" | RUNTIME_GLIBC => RUNTIME_GLIBC,
        RUNTIME_MUSL => RUNTIME_MUSL,
        other => {
            return Err(InjectSkip::UnknownRuntime {
                value: other.to_string(),
            })
        }
    };

    // a pre-configured auto-instrumentation home means someone else already
    // wired this container; bail out before touching anything
    if ledger.exists(pod, ENV_DOTNET_AUTO_HOME) {
        return Err(InjectSkip::AlreadySet {
            what: format!("env var {ENV_DOTNET_AUTO_HOME}"),
        });
    }
    ledger
        .validate(
            pod,
            &[
                ENV_DOTNET_STARTUP_HOOKS,
                ENV_DOTNET_ADDITIONAL_DEPS,
                ENV_DOTNET_SHARED_STORE,
            ],
            cache,
        )
        .await?;
    append_spec_env(ledger, pod, &spec.env);

    let volume = lang_volume(Language::DotNet);
    let path = lang_mount_path(Language::DotNet);

    ledger.append_if_not_exists(pod, ENV_CORECLR_ENABLE_PROFILING, "1");
    ledger.append_if_not_exists(pod, ENV_CORECLR_PROFILER, PROFILER_CLSID);
    ledger.append_if_not_exists(
        pod,
        ENV_CORECLR_PROFILER_PATH,
        &format!("{path}/{runtime_dir}/OpenTelemetry.AutoInstrumentation.Native.so"),
    );
    ledger
        .concat_or_append(
            pod,
            ENV_DOTNET_STARTUP_HOOKS,
            &format!("{path}/net/OpenTelemetry.AutoInstrumentation.StartupHook.dll"),
            ":",
            cache,
        )
        .await?;
    ledger
        .concat_or_append(
            pod,
            ENV_DOTNET_ADDITIONAL_DEPS,
            &format!("{path}/AdditionalDeps"),
            ":",
            cache,
        )
        .await?;
    ledger
        .concat_or_append(pod, ENV_DOTNET_SHARED_STORE, &format!("{path}/store"), ":", cache)
        .await?;
    ledger.append(pod, ENV_DOTNET_AUTO_HOME, &path);

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
