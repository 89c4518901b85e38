//! Typed failure taxonomy: fatal validation errors that block the whole
//! mutation, and per-language skip reasons that do not.

use podtap_store::ReadError;

/// Fatal: the pod is returned unchanged and the caller decides whether that
/// blocks creation or only degrades to "run uninstrumented".
#[derive(Debug, thiserror::Error)]
pub enum MutateError {
    #[error("multiple instrumentation profiles available in namespace {namespace}; cannot pick one")]
    AmbiguousProfile { namespace: String },

    #[error("instrumentation profile {reference} not found")]
    ProfileNotFound { reference: String },

    /// Referenced exporter TLS material is absent; the mutated workload
    /// could never start, so nothing is mutated.
    #[error("required {kind} {namespace}/{name} does not exist")]
    MissingDependency {
        kind: &'static str,
        namespace: String,
        name: String,
    },

    #[error("container(s) targeted by more than one language: {}", .names.join(", "))]
    DuplicateContainer { names: Vec<String> },

    #[error("several languages participate; each one must name its target containers")]
    MissingContainerNames,

    #[error(transparent)]
    Lookup(#[from] ReadError),

    #[error("{}", render_all(.0))]
    Multiple(Vec<MutateError>),
}

impl MutateError {
    /// One error stays itself; several validation failures travel together.
    pub fn combine(mut errors: Vec<MutateError>) -> MutateError {
        if errors.len() == 1 {
            errors.remove(0)
        } else {
            MutateError::Multiple(errors)
        }
    }
}

fn render_all(errors: &[MutateError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Non-fatal, scoped to one language: the injection is skipped with a logged
/// reason and the remaining languages still proceed. The target container and
/// the pod are left exactly as they were.
#[derive(Debug, thiserror::Error)]
pub enum InjectSkip {
    #[error("{what} is already present")]
    AlreadySet { what: String },

    #[error("env var {var} takes its value from valueFrom.{field}, which is not supported")]
    UnsupportedSource { var: String, field: &'static str },

    #[error("key {key:?} not found in {kind} {namespace}/{name} (wanted by {var})")]
    MissingKey {
        var: String,
        kind: &'static str,
        namespace: String,
        name: String,
        key: String,
    },

    #[error("{kind} {namespace}/{name} not found (wanted by {var})")]
    MissingRef {
        var: String,
        kind: &'static str,
        namespace: String,
        name: String,
    },

    #[error("profile does not configure {language} instrumentation")]
    ProfileNotApplicable { language: &'static str },

    #[error("unknown runtime variant {value:?}")]
    UnknownRuntime { value: String },

    #[error("no resolvable target executable")]
    NoTargetExe,

    #[error("pod has no containers")]
    NoContainers,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn combine_keeps_single_errors_flat() {
        let err = MutateError::combine(vec![MutateError::MissingContainerNames]);
        assert!(matches!(err, MutateError::MissingContainerNames));
    }

    #[test]
    fn combined_errors_render_every_member() {
        let err = MutateError::combine(vec![
            MutateError::MissingDependency {
                kind: "Secret",
                namespace: "apps".into(),
                name: "otlp-certs".into(),
            },
            MutateError::MissingDependency {
                kind: "ConfigMap",
                namespace: "apps".into(),
                name: "otlp-ca".into(),
            },
        ]);
        let rendered = err.to_string();
        assert!(rendered.contains("Secret apps/otlp-certs"));
        assert!(rendered.contains("ConfigMap apps/otlp-ca"));
    }
}
