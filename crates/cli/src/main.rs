use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use clap::{Parser, Subcommand, ValueEnum};
use mirador_cache::{Cache, SyncHandle};
use mirador_core::{Identity, LiteObj};
use mirador_kubehub::{MultiplexSource, WatchSource};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "miradorctl", version, about = "Query a locally mirrored, indexed view of cluster objects")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Kubernetes namespace; repeat to mirror several at once
    #[arg(long = "ns", global = true)]
    namespaces: Vec<String>,

    /// Seconds to wait for the initial listing
    #[arg(long = "timeout", global = true, default_value_t = 30)]
    timeout_secs: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output {
    Human,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List mirrored objects for a GVK key, e.g. "v1/Pod"
    Ls { gvk: String },
    /// Point lookup by name (uses --ns for namespaced kinds)
    Get { gvk: String, name: String },
    /// Query by index: field:<path>=<v>, label:<key>=<v> or annotation:<key>=<v>
    Lookup { gvk: String, selector: String },
}

fn init_tracing() {
    let env = std::env::var("MIRADOR_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("MIRADOR_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid MIRADOR_METRICS_ADDR; expected host:port");
        }
    }
}

/// One index query: which attribute to index on and the key to look up.
#[derive(Debug, Clone)]
enum Selector {
    Field { path: String, value: String },
    Label { key: String, value: String },
    Annotation { key: String, value: String },
}

impl Selector {
    fn parse(s: &str) -> Result<Self> {
        let (kind, rest) = s
            .split_once(':')
            .ok_or_else(|| anyhow!("selector must look like kind:key=value, got {:?}", s))?;
        let (key, value) = rest
            .split_once('=')
            .ok_or_else(|| anyhow!("selector must look like kind:key=value, got {:?}", s))?;
        let (key, value) = (key.to_string(), value.to_string());
        match kind {
            "field" => Ok(Self::Field { path: key, value }),
            "label" => Ok(Self::Label { key, value }),
            "annotation" => Ok(Self::Annotation { key, value }),
            other => bail!("unknown selector kind {:?} (expect field, label or annotation)", other),
        }
    }

    fn index_name(&self) -> String {
        match self {
            Self::Field { path, .. } => format!("field:{}", path),
            Self::Label { key, .. } => format!("label:{}", key),
            Self::Annotation { key, .. } => format!("annotation:{}", key),
        }
    }

    fn lookup_key(&self) -> &str {
        match self {
            Self::Field { value, .. }
            | Self::Label { value, .. }
            | Self::Annotation { value, .. } => value,
        }
    }

    /// Field paths the watch source must project for this index to work.
    fn field_paths(&self) -> Vec<String> {
        match self {
            Self::Field { path, .. } => vec![path.clone()],
            _ => Vec::new(),
        }
    }

    fn register(&self, cache: &Cache<LiteObj>) -> Result<()> {
        let name = self.index_name();
        match self {
            Self::Field { path, .. } => {
                let path = path.clone();
                cache.register_index(&name, move |o: &LiteObj| match o.field(&path) {
                    // an unset field keeps the object out of the index
                    Some(v) if !v.is_empty() => vec![v.to_string()],
                    _ => Vec::new(),
                })?;
            }
            Self::Label { key, .. } => {
                let key = key.clone();
                cache.register_index(&name, move |o: &LiteObj| {
                    o.label(&key).map(|v| vec![v.to_string()]).unwrap_or_default()
                })?;
            }
            Self::Annotation { key, .. } => {
                let key = key.clone();
                cache.register_index(&name, move |o: &LiteObj| {
                    o.annotation(&key).map(|v| vec![v.to_string()]).unwrap_or_default()
                })?;
            }
        }
        Ok(())
    }
}

/// Start mirroring `gvk` into `cache` and wait for the initial listing.
async fn start_mirror(
    cache: &Cache<LiteObj>,
    gvk: &str,
    namespaces: &[String],
    fields: Vec<String>,
    timeout: Duration,
) -> Result<SyncHandle> {
    let handle = match namespaces {
        [] => cache.start(WatchSource::new(gvk).project_fields(fields)).await?,
        [ns] => {
            cache
                .start(WatchSource::new(gvk).namespaced(ns.clone()).project_fields(fields))
                .await?
        }
        many => {
            let members = many
                .iter()
                .map(|ns| {
                    WatchSource::new(gvk).namespaced(ns.clone()).project_fields(fields.clone())
                })
                .collect();
            cache.start(MultiplexSource::new(members)).await?
        }
    };
    if !cache.wait_until_synced(timeout).await {
        bail!("timed out after {}s waiting for initial sync", timeout.as_secs());
    }
    Ok(handle)
}

fn print_objects(output: Output, mut objects: Vec<LiteObj>) -> Result<()> {
    use mirador_core::Keyed;
    objects.sort_by_key(|o| o.identity());
    match output {
        Output::Human => {
            for o in &objects {
                println!("{}", o.identity());
            }
        }
        Output::Json => println!("{}", serde_json::to_string_pretty(&objects)?),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let timeout = Duration::from_secs(cli.timeout_secs);

    match cli.command {
        Commands::Ls { gvk } => {
            info!(gvk = %gvk, ns = ?cli.namespaces, "ls invoked");
            let cache: Cache<LiteObj> = Cache::new();
            let handle = start_mirror(&cache, &gvk, &cli.namespaces, Vec::new(), timeout).await?;
            print_objects(cli.output, cache.list())?;
            handle.stop();
        }
        Commands::Get { gvk, name } => {
            info!(gvk = %gvk, name = %name, ns = ?cli.namespaces, "get invoked");
            if cli.namespaces.len() > 1 {
                bail!("get takes at most one --ns");
            }
            let id = match cli.namespaces.first() {
                Some(ns) => Identity::namespaced(ns.clone(), name),
                None => Identity::cluster(name),
            };
            let cache: Cache<LiteObj> = Cache::new();
            let handle = start_mirror(&cache, &gvk, &cli.namespaces, Vec::new(), timeout).await?;
            let found = cache.get(&id);
            handle.stop();
            match found {
                Some(obj) => match cli.output {
                    Output::Human => println!("{}", id),
                    Output::Json => println!("{}", serde_json::to_string_pretty(&obj)?),
                },
                None => {
                    eprintln!("not found: {}", id);
                    std::process::exit(1);
                }
            }
        }
        Commands::Lookup { gvk, selector } => {
            let selector = Selector::parse(&selector)?;
            info!(gvk = %gvk, index = %selector.index_name(), key = %selector.lookup_key(), "lookup invoked");
            let cache: Cache<LiteObj> = Cache::new();
            selector.register(&cache)?;
            let handle =
                start_mirror(&cache, &gvk, &cli.namespaces, selector.field_paths(), timeout)
                    .await?;
            let hits = cache.list_by_index(&selector.index_name(), selector.lookup_key())?;
            print_objects(cli.output, hits)?;
            handle.stop();
        }
    }
    Ok(())
}
