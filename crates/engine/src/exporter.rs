//! Exporter TLS material: certificate env vars plus idempotent volume and
//! mount declarations on the telemetry-producing container.

use k8s_openapi::api::core::v1::{
    ConfigMapVolumeSource, Pod, SecretVolumeSource, Volume,
};

use podtap_model::TlsConfig;

use crate::env::EnvLedger;
use crate::inject::{add_mount_if_absent, add_volume_if_absent};
use crate::util::containers_mut;

pub(crate) const ENV_OTEL_EXPORTER_CERTIFICATE: &str = "OTEL_EXPORTER_OTLP_CERTIFICATE";
pub(crate) const ENV_OTEL_EXPORTER_CLIENT_CERTIFICATE: &str =
    "OTEL_EXPORTER_OTLP_CLIENT_CERTIFICATE";
pub(crate) const ENV_OTEL_EXPORTER_CLIENT_KEY: &str = "OTEL_EXPORTER_OTLP_CLIENT_KEY";

/// Kube object names cap at 63 characters.
pub(crate) fn truncate_name(name: &str) -> String {
    let mut out: String = name.chars().take(63).collect();
    while out.ends_with('-') {
        out.pop();
    }
    out
}

pub(crate) fn configure_tls(tls: &TlsConfig, pod: &mut Pod, ledger: &EnvLedger, index: usize) {
    let secret_volume = truncate_name(&format!("podtap-tls-secret-{}", tls.secret_name));
    let secret_path = format!("/podtap-tls-secret-{}", tls.secret_name);
    let config_map_volume = truncate_name(&format!("podtap-tls-configmap-{}", tls.config_map_name));
    let config_map_path = format!("/podtap-tls-configmap-{}", tls.config_map_name);

    if !tls.ca_file.is_empty() {
        // the CA may come from the dedicated ConfigMap instead of the secret
        let base = if tls.config_map_name.is_empty() {
            &secret_path
        } else {
            &config_map_path
        };
        let value = absolute_or_under(base, &tls.ca_file);
        ledger.append_if_not_exists(pod, ENV_OTEL_EXPORTER_CERTIFICATE, &value);
    }
    if !tls.cert_file.is_empty() {
        let value = absolute_or_under(&secret_path, &tls.cert_file);
        ledger.append_if_not_exists(pod, ENV_OTEL_EXPORTER_CLIENT_CERTIFICATE, &value);
    }
    if !tls.key_file.is_empty() {
        let value = absolute_or_under(&secret_path, &tls.key_file);
        ledger.append_if_not_exists(pod, ENV_OTEL_EXPORTER_CLIENT_KEY, &value);
    }

    if !tls.secret_name.is_empty() {
        add_volume_if_absent(
            pod,
            Volume {
                name: secret_volume.clone(),
                secret: Some(SecretVolumeSource {
                    secret_name: Some(tls.secret_name.clone()),
                    ..Default::default()
                }),
                ..Default::default()
            },
        );
        add_mount_if_absent(
            &mut containers_mut(pod)[index],
            &secret_volume,
            &secret_path,
            true,
        );
    }
    if !tls.config_map_name.is_empty() {
        add_volume_if_absent(
            pod,
            Volume {
                name: config_map_volume.clone(),
                config_map: Some(ConfigMapVolumeSource {
                    name: Some(tls.config_map_name.clone()),
                    ..Default::default()
                }),
                ..Default::default()
            },
        );
        add_mount_if_absent(
            &mut containers_mut(pod)[index],
            &config_map_volume,
            &config_map_path,
            true,
        );
    }
}

fn absolute_or_under(base: &str, file: &str) -> String {
    if file.starts_with('/') {
        file.to_string()
    } else {
        format!("{base}/{file}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_truncated_without_trailing_dash() {
        let long = format!("podtap-tls-secret-{}", "x".repeat(80));
        assert_eq!(truncate_name(&long).len(), 63);
        // the 63rd character lands on the dash, which must not survive
        let dashy = format!("{}-{}", "y".repeat(62), "tail");
        let truncated = truncate_name(&dashy);
        assert_eq!(truncated.len(), 62);
        assert!(!truncated.ends_with('-'));
    }

    #[test]
    fn absolute_paths_are_kept_verbatim() {
        assert_eq!(absolute_or_under("/mnt", "/etc/ssl/ca.crt"), "/etc/ssl/ca.crt");
        assert_eq!(absolute_or_under("/mnt", "ca.crt"), "/mnt/ca.crt");
    }
}
