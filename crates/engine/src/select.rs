//! Instrumentation Selector: which languages participate and which
//! containers each one targets, validated before any mutation.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use podtap_model::{Flags, Instrumentation};

use crate::error::MutateError;
use crate::markers::{self, effective_value};
use crate::util::containers;

/// Closed set of supported language profiles, in stable application order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Language {
    Java,
    NodeJs,
    Python,
    DotNet,
    Go,
    ApacheHttpd,
    Nginx,
    Sdk,
}

impl Language {
    pub const ALL: [Language; 8] = [
        Language::Java,
        Language::NodeJs,
        Language::Python,
        Language::DotNet,
        Language::Go,
        Language::ApacheHttpd,
        Language::Nginx,
        Language::Sdk,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Language::Java => "java",
            Language::NodeJs => "nodejs",
            Language::Python => "python",
            Language::DotNet => "dotnet",
            Language::Go => "go",
            Language::ApacheHttpd => "apache-httpd",
            Language::Nginx => "nginx",
            Language::Sdk => "sdk",
        }
    }

    pub fn inject_annotation(&self) -> &'static str {
        match self {
            Language::Java => markers::ANNOTATION_INJECT_JAVA,
            Language::NodeJs => markers::ANNOTATION_INJECT_NODEJS,
            Language::Python => markers::ANNOTATION_INJECT_PYTHON,
            Language::DotNet => markers::ANNOTATION_INJECT_DOTNET,
            Language::Go => markers::ANNOTATION_INJECT_GO,
            Language::ApacheHttpd => markers::ANNOTATION_INJECT_APACHE_HTTPD,
            Language::Nginx => markers::ANNOTATION_INJECT_NGINX,
            Language::Sdk => markers::ANNOTATION_INJECT_SDK,
        }
    }

    pub fn container_annotation(&self) -> &'static str {
        match self {
            Language::Java => markers::ANNOTATION_JAVA_CONTAINER_NAMES,
            Language::NodeJs => markers::ANNOTATION_NODEJS_CONTAINER_NAMES,
            Language::Python => markers::ANNOTATION_PYTHON_CONTAINER_NAMES,
            Language::DotNet => markers::ANNOTATION_DOTNET_CONTAINER_NAMES,
            Language::Go => markers::ANNOTATION_GO_CONTAINER_NAMES,
            Language::ApacheHttpd => markers::ANNOTATION_APACHE_HTTPD_CONTAINER_NAMES,
            Language::Nginx => markers::ANNOTATION_NGINX_CONTAINER_NAMES,
            Language::Sdk => markers::ANNOTATION_SDK_CONTAINER_NAMES,
        }
    }

    /// The sdk-only profile has no feature gate; everything else does.
    pub fn enabled(&self, flags: &Flags) -> bool {
        match self {
            Language::Java => flags.java,
            Language::NodeJs => flags.nodejs,
            Language::Python => flags.python,
            Language::DotNet => flags.dotnet,
            Language::Go => flags.go,
            Language::ApacheHttpd => flags.apache_httpd,
            Language::Nginx => flags.nginx,
            Language::Sdk => true,
        }
    }
}

/// One participating language: its resolved profile and target containers.
/// An empty container list means "the workload's first container".
pub struct Selection {
    pub language: Language,
    pub profile: Instrumentation,
    pub containers: Vec<String>,
}

/// Container list for one language: the language-specific marker wins over
/// the global one. Empty names are dropped.
pub fn container_names(ns: &ObjectMeta, workload: &ObjectMeta, language: Language) -> Vec<String> {
    let own = effective_value(ns, workload, language.container_annotation());
    let chosen = if own.is_empty() {
        effective_value(ns, workload, markers::ANNOTATION_CONTAINER_NAMES)
    } else {
        own
    };
    chosen
        .split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(String::from)
        .collect()
}

/// Index of the named container, falling back to the first one.
pub fn container_index(pod: &Pod, name: &str) -> usize {
    containers(pod)
        .iter()
        .position(|c| c.name == name)
        .unwrap_or(0)
}

/// Rejects ambiguous or duplicated container targeting before any mutation.
pub fn validate_assignment(
    selections: &[Selection],
    multi_container: bool,
) -> Result<(), MutateError> {
    let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
    for selection in selections {
        for name in &selection.containers {
            *counts.entry(name.as_str()).or_default() += 1;
        }
    }
    let duplicates: Vec<String> = counts
        .iter()
        .filter(|(_, count)| **count > 1)
        .map(|(name, _)| name.to_string())
        .collect();
    if !duplicates.is_empty() {
        return Err(MutateError::DuplicateContainer { names: duplicates });
    }

    if selections.len() > 1 {
        // with several simultaneous languages the default-container fallback
        // is ambiguous: every language must name its containers explicitly
        if !multi_container {
            return Err(MutateError::MissingContainerNames);
        }
        if selections.iter().any(|s| s.containers.is_empty()) {
            return Err(MutateError::MissingContainerNames);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap as Map;

    fn selection(language: Language, names: &[&str]) -> Selection {
        Selection {
            language,
            profile: Instrumentation::default(),
            containers: names.iter().map(|n| n.to_string()).collect(),
        }
    }

    fn meta(pairs: &[(&str, &str)]) -> ObjectMeta {
        ObjectMeta {
            annotations: Some(
                pairs
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect::<Map<_, _>>(),
            ),
            ..Default::default()
        }
    }

    #[test]
    fn duplicate_containers_are_named_exactly() {
        let selections = vec![
            selection(Language::Java, &["app", "shared"]),
            selection(Language::Python, &["shared", "db"]),
        ];
        let err = validate_assignment(&selections, true).expect_err("duplicate");
        match err {
            MutateError::DuplicateContainer { names } => assert_eq!(names, vec!["shared"]),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn mixed_explicit_and_default_targeting_is_rejected() {
        let selections = vec![
            selection(Language::Java, &["app"]),
            selection(Language::Python, &[]),
        ];
        assert!(matches!(
            validate_assignment(&selections, true),
            Err(MutateError::MissingContainerNames)
        ));
    }

    #[test]
    fn several_languages_without_names_are_rejected() {
        let selections = vec![
            selection(Language::Java, &[]),
            selection(Language::Python, &[]),
        ];
        assert!(matches!(
            validate_assignment(&selections, true),
            Err(MutateError::MissingContainerNames)
        ));
    }

    #[test]
    fn single_language_may_fall_back_to_the_first_container() {
        let selections = vec![selection(Language::Java, &[])];
        assert!(validate_assignment(&selections, true).is_ok());
        assert!(validate_assignment(&selections, false).is_ok());
    }

    #[test]
    fn multi_language_needs_the_multi_container_gate() {
        let selections = vec![
            selection(Language::Java, &["a"]),
            selection(Language::Python, &["b"]),
        ];
        assert!(validate_assignment(&selections, true).is_ok());
        assert!(matches!(
            validate_assignment(&selections, false),
            Err(MutateError::MissingContainerNames)
        ));
    }

    #[test]
    fn language_specific_container_marker_wins_over_global() {
        let ns = meta(&[]);
        let workload = meta(&[
            (markers::ANNOTATION_CONTAINER_NAMES, "global-a,global-b"),
            (markers::ANNOTATION_JAVA_CONTAINER_NAMES, "java-app"),
        ]);
        assert_eq!(
            container_names(&ns, &workload, Language::Java),
            vec!["java-app"]
        );
        assert_eq!(
            container_names(&ns, &workload, Language::Python),
            vec!["global-a", "global-b"]
        );
    }

    #[test]
    fn container_lists_drop_empty_segments() {
        let ns = meta(&[]);
        let workload = meta(&[(markers::ANNOTATION_CONTAINER_NAMES, " app, ,db ")]);
        assert_eq!(
            container_names(&ns, &workload, Language::Sdk),
            vec!["app", "db"]
        );
    }
}
