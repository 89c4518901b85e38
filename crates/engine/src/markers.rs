//! Marker vocabulary and the namespace/workload precedence resolver.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use crate::util::annotation;

// Injection intent, per language. Values are "true", "false" or a profile
// reference, optionally namespace-qualified.
pub const ANNOTATION_INJECT_JAVA: &str = "instrumentation.podtap.io/inject-java";
pub const ANNOTATION_INJECT_NODEJS: &str = "instrumentation.podtap.io/inject-nodejs";
pub const ANNOTATION_INJECT_PYTHON: &str = "instrumentation.podtap.io/inject-python";
pub const ANNOTATION_INJECT_DOTNET: &str = "instrumentation.podtap.io/inject-dotnet";
pub const ANNOTATION_INJECT_GO: &str = "instrumentation.podtap.io/inject-go";
pub const ANNOTATION_INJECT_APACHE_HTTPD: &str = "instrumentation.podtap.io/inject-apache-httpd";
pub const ANNOTATION_INJECT_NGINX: &str = "instrumentation.podtap.io/inject-nginx";
pub const ANNOTATION_INJECT_SDK: &str = "instrumentation.podtap.io/inject-sdk";

// Container targeting: one global list, plus a per-language list that wins
// over the global one when both are present.
pub const ANNOTATION_CONTAINER_NAMES: &str = "instrumentation.podtap.io/container-names";
pub const ANNOTATION_JAVA_CONTAINER_NAMES: &str = "instrumentation.podtap.io/java-container-names";
pub const ANNOTATION_NODEJS_CONTAINER_NAMES: &str =
    "instrumentation.podtap.io/nodejs-container-names";
pub const ANNOTATION_PYTHON_CONTAINER_NAMES: &str =
    "instrumentation.podtap.io/python-container-names";
pub const ANNOTATION_DOTNET_CONTAINER_NAMES: &str =
    "instrumentation.podtap.io/dotnet-container-names";
pub const ANNOTATION_GO_CONTAINER_NAMES: &str = "instrumentation.podtap.io/go-container-names";
pub const ANNOTATION_APACHE_HTTPD_CONTAINER_NAMES: &str =
    "instrumentation.podtap.io/apache-httpd-container-names";
pub const ANNOTATION_NGINX_CONTAINER_NAMES: &str =
    "instrumentation.podtap.io/nginx-container-names";
pub const ANNOTATION_SDK_CONTAINER_NAMES: &str = "instrumentation.podtap.io/sdk-container-names";

// Supplementary, per language.
pub const ANNOTATION_DOTNET_RUNTIME: &str = "instrumentation.podtap.io/dotnet-runtime";
pub const ANNOTATION_GO_TARGET_EXE: &str = "instrumentation.podtap.io/go-target-exe";

/// Internal marker recording that injection already happened. Consulted for
/// idempotence, set once, never produced twice.
pub const ANNOTATION_INJECTED: &str = "podtap.io/injected";

/// One explicit resource-attribute override per key: `resource.podtap.io/<key>`.
pub const RESOURCE_ATTRIBUTE_PREFIX: &str = "resource.podtap.io/";

/// Effective value of a marker given its namespace- and workload-level
/// values. The same precedence applies to every marker, annotation- or
/// label-sourced alike.
pub fn effective_value<'a>(ns: &'a ObjectMeta, workload: &'a ObjectMeta, key: &str) -> &'a str {
    let ns_value = annotation(ns, key);
    let wl_value = annotation(workload, key);

    // an empty namespace value leaves the decision to the workload, whatever it says
    if ns_value.is_empty() {
        return wl_value;
    }
    if wl_value.is_empty() {
        return ns_value;
    }
    // an explicit profile reference or "false" at workload scope always wins
    if !wl_value.eq_ignore_ascii_case("true") {
        return wl_value;
    }
    // the workload opted in; a namespace-level "false" cannot retract that
    if ns_value.eq_ignore_ascii_case("false") {
        return wl_value;
    }
    // namespace carries "true" or a profile reference; either trumps a bare "true"
    ns_value
}
