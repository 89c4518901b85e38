//! Injection Orchestrator: resolves markers, selects languages and
//! containers, validates the assignment, and applies per-language injection
//! plus the common SDK configuration. Short-circuits on prior injection.

use k8s_openapi::api::core::v1::{Namespace, Pod};
use metrics::counter;
use tracing::{debug, warn};

use podtap_model::Flags;
use podtap_model::Instrumentation;
use podtap_store::{Backoff, ClusterReader};

use crate::env::{EnvLedger, KvCache};
use crate::error::{InjectSkip, MutateError};
use crate::inject;
use crate::markers::{self, effective_value};
use crate::resources::AttributeDeriver;
use crate::sdk;
use crate::select::{self, Language, Selection};
use crate::util::{annotation, containers};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Normal,
    Warning,
}

/// Event-recording sink used to surface rejected-but-non-fatal conditions
/// to the workload's owner (not merely to the operator's logs).
pub trait EventSink: Send + Sync {
    fn event(&self, pod: &Pod, severity: Severity, reason: &str, message: &str);
}

/// Default sink forwarding events to the log stream.
pub struct LogSink;

impl EventSink for LogSink {
    fn event(&self, pod: &Pod, severity: Severity, reason: &str, message: &str) {
        let name = pod.metadata.name.as_deref().unwrap_or("<template>");
        match severity {
            Severity::Normal => tracing::info!(pod = name, reason, "{message}"),
            Severity::Warning => tracing::warn!(pod = name, reason, "{message}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// At least one language was injected.
    Injected(Vec<Language>),
    AlreadyInjected,
    NotRequested,
    /// Languages were requested but every one of them was skipped.
    AllSkipped,
}

#[derive(Debug)]
pub struct Mutation {
    pub pod: Pod,
    pub outcome: Outcome,
}

pub struct PodMutator<'a> {
    reader: &'a dyn ClusterReader,
    events: &'a dyn EventSink,
    flags: Flags,
    backoff: Backoff,
}

impl<'a> PodMutator<'a> {
    pub fn new(reader: &'a dyn ClusterReader, events: &'a dyn EventSink, flags: Flags) -> Self {
        Self {
            reader,
            events,
            flags,
            backoff: Backoff::default(),
        }
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// One full decision for one pod. Fatal validation problems return the
    /// pod untouched alongside the combined error; per-language problems
    /// skip that language only.
    pub async fn mutate(&self, ns: &Namespace, pod: Pod) -> Result<Mutation, MutateError> {
        counter!("mutate_attempts", 1u64);
        let namespace: String = ns
            .metadata
            .name
            .clone()
            .or_else(|| pod.metadata.namespace.clone())
            .unwrap_or_default();
        let namespace = namespace.as_str();

        if annotation(&pod.metadata, markers::ANNOTATION_INJECTED) == "true"
            || inject::already_injected(&pod)
        {
            debug!(namespace, "pod already instrumented; skipping");
            return Ok(Mutation {
                pod,
                outcome: Outcome::AlreadyInjected,
            });
        }

        // resolve every language's profile reference; fatal problems are
        // collected so the caller sees all of them at once
        let mut fatal: Vec<MutateError> = Vec::new();
        let mut selections: Vec<Selection> = Vec::new();
        for language in Language::ALL {
            let value = effective_value(&ns.metadata, &pod.metadata, language.inject_annotation());
            if value.is_empty() || value.eq_ignore_ascii_case("false") {
                continue;
            }
            match self.resolve_profile(namespace, value).await {
                Err(e) => {
                    warn!(language = language.as_str(), error = %e, "failed to select an instrumentation profile");
                    fatal.push(e);
                }
                Ok(profile) => {
                    if !language.enabled(&self.flags) {
                        let message = format!(
                            "support for {} auto instrumentation is not enabled",
                            language.as_str()
                        );
                        warn!(language = language.as_str(), "{message}");
                        self.events.event(
                            &pod,
                            Severity::Warning,
                            "InstrumentationRequestRejected",
                            &message,
                        );
                        counter!("mutate_rejected", 1u64);
                        continue;
                    }
                    selections.push(Selection {
                        language,
                        profile,
                        containers: Vec::new(),
                    });
                }
            }
        }

        // declared exporter TLS material must exist, or the workload would
        // never start once mutated
        for selection in &selections {
            if let Some(tls) = &selection.profile.spec.exporter.tls {
                if !tls.secret_name.is_empty() {
                    match self.reader.secret(namespace, &tls.secret_name).await {
                        Ok(Some(_)) => {}
                        Ok(None) => fatal.push(MutateError::MissingDependency {
                            kind: "Secret",
                            namespace: namespace.to_string(),
                            name: tls.secret_name.clone(),
                        }),
                        Err(e) => fatal.push(e.into()),
                    }
                }
                if !tls.config_map_name.is_empty() {
                    match self.reader.config_map(namespace, &tls.config_map_name).await {
                        Ok(Some(_)) => {}
                        Ok(None) => fatal.push(MutateError::MissingDependency {
                            kind: "ConfigMap",
                            namespace: namespace.to_string(),
                            name: tls.config_map_name.clone(),
                        }),
                        Err(e) => fatal.push(e.into()),
                    }
                }
            }
        }
        if !fatal.is_empty() {
            counter!("mutate_rejected", 1u64);
            return Err(MutateError::combine(fatal));
        }
        if selections.is_empty() {
            debug!(namespace, "no instrumentation requested");
            return Ok(Mutation {
                pod,
                outcome: Outcome::NotRequested,
            });
        }

        if self.flags.multi_container {
            for selection in &mut selections {
                selection.containers =
                    select::container_names(&ns.metadata, &pod.metadata, selection.language);
            }
        }
        select::validate_assignment(&selections, self.flags.multi_container)?;

        let mut cache = KvCache::new(self.reader, namespace);
        let deriver = AttributeDeriver::new(self.reader, self.backoff);
        let mut injected: Vec<Language> = Vec::new();
        let mut pod = pod;
        for selection in &selections {
            let mut targets: Vec<usize> = if selection.containers.is_empty() {
                vec![0]
            } else {
                selection
                    .containers
                    .iter()
                    .map(|name| select::container_index(&pod, name))
                    .collect()
            };
            // the Go agent attaches to exactly one process
            if selection.language == Language::Go {
                targets.truncate(1);
            }
            for &target in &targets {
                let mut candidate = pod.clone();
                let applied = self
                    .apply_one(selection, ns, namespace, &mut candidate, target, &deriver, &mut cache)
                    .await;
                match applied {
                    Ok(()) => {
                        pod = candidate;
                        if !injected.contains(&selection.language) {
                            injected.push(selection.language);
                        }
                    }
                    Err(skip) => {
                        // that language stays out; everything else proceeds
                        warn!(
                            language = selection.language.as_str(),
                            container = target,
                            reason = %skip,
                            "skipping instrumentation injection"
                        );
                        self.events.event(
                            &pod,
                            Severity::Warning,
                            "InstrumentationSkipped",
                            &format!("{}: {skip}", selection.language.as_str()),
                        );
                        counter!("mutate_lang_skips", 1u64);
                    }
                }
            }
        }

        if injected.is_empty() {
            return Ok(Mutation {
                pod,
                outcome: Outcome::AllSkipped,
            });
        }
        pod.metadata
            .annotations
            .get_or_insert_with(Default::default)
            .insert(markers::ANNOTATION_INJECTED.to_string(), "true".to_string());
        counter!("mutate_ok", 1u64);
        Ok(Mutation {
            pod,
            outcome: Outcome::Injected(injected),
        })
    }

    /// One (language, container) application. Works on a candidate clone so
    /// a failure leaves the pod byte-for-byte unchanged.
    #[allow(clippy::too_many_arguments)]
    async fn apply_one(
        &self,
        selection: &Selection,
        ns: &Namespace,
        namespace: &str,
        pod: &mut Pod,
        index: usize,
        deriver: &AttributeDeriver<'_>,
        cache: &mut KvCache<'_>,
    ) -> Result<(), InjectSkip> {
        if containers(pod).is_empty() {
            return Err(InjectSkip::NoContainers);
        }
        let inst = &selection.profile;
        let spec = &inst.spec;
        let ledger = EnvLedger::new(pod, index, cache).await?;

        let mut agent_index = index;
        let security_context_inits: Vec<String> = match selection.language {
            Language::Java => {
                let Some(java) = &spec.java else {
                    return Err(InjectSkip::ProfileNotApplicable { language: "java" });
                };
                inject::java::inject(java, spec, pod, index, &ledger, cache).await?;
                inject::java::init_names(java)
            }
            Language::NodeJs => {
                let Some(nodejs) = &spec.nodejs else {
                    return Err(InjectSkip::ProfileNotApplicable { language: "nodejs" });
                };
                inject::nodejs::inject(nodejs, spec, pod, index, &ledger, cache).await?;
                vec![inject::lang_volume(Language::NodeJs)]
            }
            Language::Python => {
                let Some(python) = &spec.python else {
                    return Err(InjectSkip::ProfileNotApplicable { language: "python" });
                };
                inject::python::inject(python, spec, pod, index, &ledger, cache).await?;
                vec![inject::lang_volume(Language::Python)]
            }
            Language::DotNet => {
                let Some(dotnet) = &spec.dotnet else {
                    return Err(InjectSkip::ProfileNotApplicable { language: "dotnet" });
                };
                let runtime =
                    effective_value(&ns.metadata, &pod.metadata, markers::ANNOTATION_DOTNET_RUNTIME)
                        .to_string();
                inject::dotnet::inject(dotnet, spec, pod, index, &runtime, &ledger, cache).await?;
                vec![inject::lang_volume(Language::DotNet)]
            }
            Language::Go => {
                let Some(go) = &spec.go else {
                    return Err(InjectSkip::ProfileNotApplicable { language: "go" });
                };
                let target_exe =
                    effective_value(&ns.metadata, &pod.metadata, markers::ANNOTATION_GO_TARGET_EXE)
                        .to_string();
                agent_index = inject::golang::inject(go, pod, &target_exe)?;
                Vec::new()
            }
            Language::ApacheHttpd => {
                let Some(apache) = &spec.apache_httpd else {
                    return Err(InjectSkip::ProfileNotApplicable {
                        language: "apache-httpd",
                    });
                };
                let attributes = deriver.resource_map(inst, namespace, pod, index).await;
                inject::apache::inject(
                    apache,
                    &spec.exporter.endpoint,
                    pod,
                    index,
                    &attributes,
                    &ledger,
                )
                .await?;
                inject::apache::init_names()
            }
            Language::Nginx => {
                let Some(nginx) = &spec.nginx else {
                    return Err(InjectSkip::ProfileNotApplicable { language: "nginx" });
                };
                let attributes = deriver.resource_map(inst, namespace, pod, index).await;
                inject::nginx::inject(
                    nginx,
                    &spec.exporter.endpoint,
                    pod,
                    index,
                    &attributes,
                    &ledger,
                    cache,
                )
                .await?;
                inject::nginx::init_names()
            }
            Language::Sdk => Vec::new(),
        };

        // profile-level env entries, then the cross-language SDK settings,
        // both on the agent container
        let agent_ledger = if agent_index == index {
            ledger
        } else {
            EnvLedger::new(pod, agent_index, cache).await?
        };
        for var in &spec.env {
            agent_ledger.append_var_if_not_exists(pod, var.clone());
        }
        sdk::configure(
            inst,
            namespace,
            pod,
            &agent_ledger,
            agent_index,
            index,
            deriver,
            cache,
        )
        .await?;

        if selection.language == Language::Go && !inject::golang::has_target_exe(pod, agent_index) {
            return Err(InjectSkip::NoTargetExe);
        }

        if !security_context_inits.is_empty() {
            inject::propagate_security_context(pod, index, &security_context_inits);
        }
        Ok(())
    }

    /// "true" selects the namespace's unique profile; anything else is a
    /// direct reference, optionally namespace-qualified.
    async fn resolve_profile(
        &self,
        namespace: &str,
        value: &str,
    ) -> Result<Instrumentation, MutateError> {
        if value.eq_ignore_ascii_case("true") {
            let mut found = self.reader.instrumentations(namespace).await?;
            return match found.len() {
                0 => Err(MutateError::ProfileNotFound {
                    reference: format!("{namespace}/*"),
                }),
                1 => Ok(found.remove(0)),
                _ => Err(MutateError::AmbiguousProfile {
                    namespace: namespace.to_string(),
                }),
            };
        }
        let (ns, name) = match value.split_once('/') {
            Some((qualifier, name)) => (qualifier, name),
            None => (namespace, value),
        };
        match self.reader.instrumentation(ns, name).await? {
            Some(profile) => Ok(profile),
            None => Err(MutateError::ProfileNotFound {
                reference: format!("{ns}/{name}"),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::apps::v1::ReplicaSet;
    use k8s_openapi::api::core::v1::{Container, EnvVar, EnvVarSource, ObjectFieldSelector, PodSpec};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
    use podtap_model::{JavaSpec, PythonSpec, TlsConfig};
    use podtap_store::MemReader;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    use crate::sdk::ENV_OTEL_RESOURCE_ATTRIBUTES;
    use crate::util::{env_of, init_containers, volumes};

    struct RecordingSink(Mutex<Vec<(String, String)>>);

    impl RecordingSink {
        fn new() -> Self {
            Self(Mutex::new(Vec::new()))
        }

        fn reasons(&self) -> Vec<String> {
            self.0.lock().unwrap().iter().map(|(r, _)| r.clone()).collect()
        }
    }

    impl EventSink for RecordingSink {
        fn event(&self, _pod: &Pod, _severity: Severity, reason: &str, message: &str) {
            self.0
                .lock()
                .unwrap()
                .push((reason.to_string(), message.to_string()));
        }
    }

    fn namespace(name: &str) -> Namespace {
        Namespace {
            metadata: ObjectMeta {
                name: Some(name.into()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn annotations(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn workload_pod(marker_pairs: &[(&str, &str)]) -> Pod {
        Pod {
            metadata: ObjectMeta {
                namespace: Some("apps".into()),
                annotations: Some(annotations(marker_pairs)),
                owner_references: Some(vec![OwnerReference {
                    kind: "ReplicaSet".into(),
                    name: "web-6b7f".into(),
                    uid: "rs-uid-1".into(),
                    api_version: "apps/v1".into(),
                    ..Default::default()
                }]),
                ..Default::default()
            },
            spec: Some(PodSpec {
                containers: vec![Container {
                    name: "app".into(),
                    image: Some("registry.local/app:2.4.1".into()),
                    ..Default::default()
                }],
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn owned_replica_set() -> ReplicaSet {
        ReplicaSet {
            metadata: ObjectMeta {
                namespace: Some("apps".into()),
                name: Some("web-6b7f".into()),
                owner_references: Some(vec![OwnerReference {
                    kind: "Deployment".into(),
                    name: "web".into(),
                    uid: "dep-uid-1".into(),
                    api_version: "apps/v1".into(),
                    ..Default::default()
                }]),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn java_profile(name: &str) -> Instrumentation {
        let mut profile = Instrumentation {
            metadata: ObjectMeta {
                namespace: Some("apps".into()),
                name: Some(name.into()),
                ..Default::default()
            },
            ..Default::default()
        };
        profile.spec.exporter.endpoint = "http://collector:4317".into();
        profile.spec.java = Some(JavaSpec {
            image: "ghcr.io/acme/java-agent:1.2.3".into(),
            ..Default::default()
        });
        profile
    }

    fn env_value<'p>(pod: &'p Pod, index: usize, name: &str) -> Option<&'p str> {
        env_of(&containers(pod)[index])
            .iter()
            .find(|e| e.name == name)
            .and_then(|e| e.value.as_deref())
    }

    #[tokio::test]
    async fn bare_true_with_unique_profile_injects_java() {
        let reader = MemReader::new()
            .with_instrumentation(java_profile("prof"))
            .with_replica_set(owned_replica_set());
        let sink = RecordingSink::new();
        let mutator = PodMutator::new(&reader, &sink, Flags::default());
        let ns = namespace("apps");
        let pod = workload_pod(&[(markers::ANNOTATION_INJECT_JAVA, "true")]);

        let mutation = mutator.mutate(&ns, pod).await.expect("mutation succeeds");
        assert_eq!(mutation.outcome, Outcome::Injected(vec![Language::Java]));
        let pod = &mutation.pod;

        let inits = init_containers(pod);
        assert_eq!(inits.len(), 1);
        assert_eq!(inits[0].name, "podtap-instr-java");
        assert!(volumes(pod).iter().any(|v| v.name == "podtap-instr-java"));

        // service name comes from the owning Deployment through the ReplicaSet
        assert_eq!(env_value(pod, 0, "OTEL_SERVICE_NAME"), Some("web"));
        assert_eq!(
            env_value(pod, 0, "JAVA_TOOL_OPTIONS"),
            Some("-javaagent:/podtap-instr-java/javaagent.jar")
        );
        assert_eq!(
            env_value(pod, 0, "OTEL_EXPORTER_OTLP_ENDPOINT"),
            Some("http://collector:4317")
        );

        // the aggregate stays last so its interpolations are defined first
        let names: Vec<_> = env_of(&containers(pod)[0])
            .iter()
            .map(|e| e.name.as_str())
            .collect();
        assert_eq!(names.last(), Some(&ENV_OTEL_RESOURCE_ATTRIBUTES));
        let aggregate = env_value(pod, 0, ENV_OTEL_RESOURCE_ATTRIBUTES).unwrap_or("");
        assert!(aggregate.contains("k8s.deployment.name=web"));
        assert!(aggregate.contains("service.version=2.4.1"));

        assert_eq!(
            annotation(&pod.metadata, markers::ANNOTATION_INJECTED),
            "true"
        );
    }

    #[tokio::test]
    async fn two_profiles_in_namespace_is_ambiguous() {
        let reader = MemReader::new()
            .with_instrumentation(java_profile("prof-a"))
            .with_instrumentation(java_profile("prof-b"));
        let sink = RecordingSink::new();
        let mutator = PodMutator::new(&reader, &sink, Flags::default());
        let ns = namespace("apps");
        let pod = workload_pod(&[(markers::ANNOTATION_INJECT_JAVA, "true")]);

        let err = mutator.mutate(&ns, pod).await.expect_err("ambiguous");
        assert!(matches!(err, MutateError::AmbiguousProfile { .. }));
    }

    #[tokio::test]
    async fn second_run_detects_prior_injection() {
        let reader = MemReader::new()
            .with_instrumentation(java_profile("prof"))
            .with_replica_set(owned_replica_set());
        let sink = RecordingSink::new();
        let mutator = PodMutator::new(&reader, &sink, Flags::default());
        let ns = namespace("apps");
        let pod = workload_pod(&[(markers::ANNOTATION_INJECT_JAVA, "true")]);

        let first = mutator.mutate(&ns, pod).await.expect("first run");
        let second = mutator
            .mutate(&ns, first.pod.clone())
            .await
            .expect("second run");
        assert_eq!(second.outcome, Outcome::AlreadyInjected);
        assert_eq!(second.pod, first.pod);
    }

    #[tokio::test]
    async fn disabled_language_is_rejected_through_the_event_sink() {
        let reader = MemReader::new().with_instrumentation(java_profile("prof"));
        let sink = RecordingSink::new();
        let flags = Flags {
            java: false,
            ..Flags::default()
        };
        let mutator = PodMutator::new(&reader, &sink, flags);
        let ns = namespace("apps");
        let pod = workload_pod(&[(markers::ANNOTATION_INJECT_JAVA, "true")]);

        let mutation = mutator.mutate(&ns, pod).await.expect("no fatal error");
        assert_eq!(mutation.outcome, Outcome::NotRequested);
        assert_eq!(sink.reasons(), vec!["InstrumentationRequestRejected"]);
    }

    #[tokio::test]
    async fn missing_tls_material_blocks_the_whole_mutation() {
        let mut profile = java_profile("prof");
        profile.spec.exporter.tls = Some(TlsConfig {
            secret_name: "otlp-certs".into(),
            ..Default::default()
        });
        let reader = MemReader::new().with_instrumentation(profile);
        let sink = RecordingSink::new();
        let mutator = PodMutator::new(&reader, &sink, Flags::default());
        let ns = namespace("apps");
        let pod = workload_pod(&[(markers::ANNOTATION_INJECT_JAVA, "true")]);

        let err = mutator.mutate(&ns, pod).await.expect_err("missing secret");
        assert!(matches!(
            err,
            MutateError::MissingDependency { kind: "Secret", .. }
        ));
    }

    #[tokio::test]
    async fn several_languages_need_the_multi_container_gate() {
        let mut profile = java_profile("prof");
        profile.spec.python = Some(PythonSpec {
            image: "ghcr.io/acme/python-agent:0.9".into(),
            ..Default::default()
        });
        let reader = MemReader::new().with_instrumentation(profile);
        let sink = RecordingSink::new();
        let mutator = PodMutator::new(&reader, &sink, Flags::default());
        let ns = namespace("apps");
        let pod = workload_pod(&[
            (markers::ANNOTATION_INJECT_JAVA, "true"),
            (markers::ANNOTATION_INJECT_PYTHON, "true"),
        ]);

        let err = mutator.mutate(&ns, pod).await.expect_err("ambiguous targets");
        assert!(matches!(err, MutateError::MissingContainerNames));
    }

    #[tokio::test]
    async fn injector_preconditions_skip_without_partial_mutation() {
        let reader = MemReader::new()
            .with_instrumentation(java_profile("prof"))
            .with_replica_set(owned_replica_set());
        let sink = RecordingSink::new();
        let mutator = PodMutator::new(&reader, &sink, Flags::default());
        let ns = namespace("apps");
        let mut pod = workload_pod(&[(markers::ANNOTATION_INJECT_JAVA, "true")]);
        // JAVA_TOOL_OPTIONS fed by an unsupported indirect source
        if let Some(spec) = pod.spec.as_mut() {
            spec.containers[0].env = Some(vec![EnvVar {
                name: "JAVA_TOOL_OPTIONS".into(),
                value: None,
                value_from: Some(EnvVarSource {
                    field_ref: Some(ObjectFieldSelector {
                        field_path: "metadata.labels".into(),
                        api_version: None,
                    }),
                    ..Default::default()
                }),
            }]);
        }

        let original = pod.clone();
        let mutation = mutator.mutate(&ns, pod).await.expect("skips, not fails");
        assert_eq!(mutation.outcome, Outcome::AllSkipped);
        assert_eq!(mutation.pod, original);
        assert_eq!(sink.reasons(), vec!["InstrumentationSkipped"]);
    }

    #[tokio::test]
    async fn injected_marker_short_circuits_without_lookups() {
        let reader = MemReader::new().with_instrumentation(java_profile("prof"));
        let sink = RecordingSink::new();
        let mutator = PodMutator::new(&reader, &sink, Flags::default());
        let ns = namespace("apps");
        let mut pod = workload_pod(&[(markers::ANNOTATION_INJECT_JAVA, "true")]);
        pod.metadata
            .annotations
            .get_or_insert_with(Default::default)
            .insert(markers::ANNOTATION_INJECTED.into(), "true".into());

        let original = pod.clone();
        let mutation = mutator.mutate(&ns, pod).await.expect("short circuit");
        assert_eq!(mutation.outcome, Outcome::AlreadyInjected);
        assert_eq!(mutation.pod, original);
        assert_eq!(reader.lookups(), 0);
    }

    #[tokio::test]
    async fn init_steps_inherit_the_app_container_security_context() {
        let reader = MemReader::new()
            .with_instrumentation(java_profile("prof"))
            .with_replica_set(owned_replica_set());
        let sink = RecordingSink::new();
        let mutator = PodMutator::new(&reader, &sink, Flags::default());
        let ns = namespace("apps");
        let mut pod = workload_pod(&[(markers::ANNOTATION_INJECT_JAVA, "true")]);
        let context = k8s_openapi::api::core::v1::SecurityContext {
            run_as_user: Some(1000),
            ..Default::default()
        };
        if let Some(spec) = pod.spec.as_mut() {
            spec.containers[0].security_context = Some(context.clone());
        }

        let mutation = mutator.mutate(&ns, pod).await.expect("mutation succeeds");
        let inits = init_containers(&mutation.pod);
        assert_eq!(inits.len(), 1);
        assert_eq!(inits[0].security_context, Some(context));
    }

    fn go_profile(name: &str) -> Instrumentation {
        let mut profile = Instrumentation {
            metadata: ObjectMeta {
                namespace: Some("apps".into()),
                name: Some(name.into()),
                ..Default::default()
            },
            ..Default::default()
        };
        profile.spec.go = Some(podtap_model::GoSpec {
            image: "ghcr.io/acme/go-agent:0.3".into(),
            ..Default::default()
        });
        profile
    }

    #[tokio::test]
    async fn go_injection_without_target_exe_is_reverted() {
        let reader = MemReader::new()
            .with_instrumentation(go_profile("prof"))
            .with_replica_set(owned_replica_set());
        let sink = RecordingSink::new();
        let flags = Flags {
            go: true,
            ..Flags::default()
        };
        let mutator = PodMutator::new(&reader, &sink, flags);
        let ns = namespace("apps");
        let pod = workload_pod(&[(markers::ANNOTATION_INJECT_GO, "true")]);

        let original = pod.clone();
        let mutation = mutator.mutate(&ns, pod).await.expect("skips, not fails");
        assert_eq!(mutation.outcome, Outcome::AllSkipped);
        assert_eq!(mutation.pod, original);
    }

    #[tokio::test]
    async fn go_agent_runs_as_a_sidecar_with_its_own_config() {
        let reader = MemReader::new()
            .with_instrumentation(go_profile("prof"))
            .with_replica_set(owned_replica_set());
        let sink = RecordingSink::new();
        let flags = Flags {
            go: true,
            ..Flags::default()
        };
        let mutator = PodMutator::new(&reader, &sink, flags);
        let ns = namespace("apps");
        let pod = workload_pod(&[
            (markers::ANNOTATION_INJECT_GO, "true"),
            (markers::ANNOTATION_GO_TARGET_EXE, "/app/server"),
        ]);

        let mutation = mutator.mutate(&ns, pod).await.expect("mutation succeeds");
        assert_eq!(mutation.outcome, Outcome::Injected(vec![Language::Go]));
        let pod = &mutation.pod;
        let all = containers(pod);
        assert_eq!(all.len(), 2);
        assert_eq!(all[1].name, "podtap-instr-go");
        assert_eq!(
            pod.spec.as_ref().and_then(|s| s.share_process_namespace),
            Some(true)
        );
        // the SDK configuration lands on the sidecar, identity on the app
        assert_eq!(env_value(pod, 1, "OTEL_GO_AUTO_TARGET_EXE"), Some("/app/server"));
        assert_eq!(env_value(pod, 1, "OTEL_SERVICE_NAME"), Some("web"));
        assert_eq!(env_value(pod, 0, "OTEL_SERVICE_NAME"), None);
    }

    #[tokio::test]
    async fn explicit_reference_to_missing_profile_is_fatal() {
        let reader = MemReader::new();
        let sink = RecordingSink::new();
        let mutator = PodMutator::new(&reader, &sink, Flags::default());
        let ns = namespace("apps");
        let pod = workload_pod(&[(markers::ANNOTATION_INJECT_JAVA, "elsewhere/prof")]);

        let err = mutator.mutate(&ns, pod).await.expect_err("not found");
        match err {
            MutateError::ProfileNotFound { reference } => {
                assert_eq!(reference, "elsewhere/prof");
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
