//! podtap CLI: runs the injection engine against file-based manifests, the
//! same decision an admission path would take, printed instead of admitted.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{anyhow, Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use k8s_openapi::api::core::v1::{Namespace, Pod};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use tracing::{info, warn};

use podtap_engine::{Language, LogSink, Outcome, PodMutator};
use podtap_model::Flags;
use podtap_store::MemReader;

#[derive(Parser, Debug)]
#[command(name = "podtap", version, about = "podtap instrumentation injection")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Yaml)]
    output: Output,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output {
    Yaml,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Mutate a pod manifest the way the admission path would
    Mutate {
        /// Pod manifest (YAML)
        #[arg(long = "pod")]
        pod: PathBuf,
        /// Namespace manifest (YAML); overrides --ns
        #[arg(long = "namespace-file")]
        namespace_file: Option<PathBuf>,
        /// Namespace name when no manifest is given
        #[arg(long = "ns", default_value = "default")]
        namespace: String,
        /// Instrumentation profile manifest (YAML), repeatable
        #[arg(long = "profile")]
        profiles: Vec<PathBuf>,
        /// ConfigMap manifest consulted for indirect env values, repeatable
        #[arg(long = "config-map")]
        config_maps: Vec<PathBuf>,
        /// Secret manifest for indirect env values and TLS checks, repeatable
        #[arg(long = "secret")]
        secrets: Vec<PathBuf>,
        /// ReplicaSet manifest for ownership-chain derivation, repeatable
        #[arg(long = "replica-set")]
        replica_sets: Vec<PathBuf>,
        /// Job manifest for ownership-chain derivation, repeatable
        #[arg(long = "job")]
        jobs: Vec<PathBuf>,
        /// Allow Go sidecar injection
        #[arg(long = "enable-go", action = ArgAction::SetTrue)]
        enable_go: bool,
        /// Allow explicit multi-container targeting
        #[arg(long = "enable-multi-container", action = ArgAction::SetTrue)]
        enable_multi_container: bool,
    },
}

fn init_tracing() {
    let env = std::env::var("PODTAP_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("PODTAP_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid PODTAP_METRICS_ADDR; expected host:port");
        }
    }
}

fn load<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let raw =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_yaml::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match cli.command {
        Commands::Mutate {
            pod,
            namespace_file,
            namespace,
            profiles,
            config_maps,
            secrets,
            replica_sets,
            jobs,
            enable_go,
            enable_multi_container,
        } => {
            let pod: Pod = load(&pod)?;
            let ns: Namespace = match namespace_file {
                Some(path) => load(&path)?,
                None => Namespace {
                    metadata: ObjectMeta {
                        name: Some(namespace),
                        ..Default::default()
                    },
                    ..Default::default()
                },
            };

            let mut reader = MemReader::new();
            for path in &profiles {
                reader = reader.with_instrumentation(load(path)?);
            }
            for path in &config_maps {
                reader = reader.with_config_map(load(path)?);
            }
            for path in &secrets {
                reader = reader.with_secret(load(path)?);
            }
            for path in &replica_sets {
                reader = reader.with_replica_set(load(path)?);
            }
            for path in &jobs {
                reader = reader.with_job(load(path)?);
            }

            let flags = Flags {
                go: enable_go,
                multi_container: enable_multi_container,
                ..Flags::default()
            };
            let sink = LogSink;
            let mutator = PodMutator::new(&reader, &sink, flags);

            let mutation = mutator
                .mutate(&ns, pod)
                .await
                .map_err(|e| anyhow!("mutation rejected: {e}"))?;
            match &mutation.outcome {
                Outcome::Injected(languages) => {
                    let names: Vec<&str> = languages.iter().map(Language::as_str).collect();
                    info!(languages = ?names, "instrumentation injected");
                }
                Outcome::AlreadyInjected => info!("pod already instrumented; returned unchanged"),
                Outcome::NotRequested => info!("no instrumentation requested; returned unchanged"),
                Outcome::AllSkipped => {
                    warn!("every requested language was skipped; returned unchanged")
                }
            }
            match cli.output {
                Output::Yaml => print!("{}", serde_yaml::to_string(&mutation.pod)?),
                Output::Json => println!("{}", serde_json::to_string_pretty(&mutation.pod)?),
            }
        }
    }
    Ok(())
}
