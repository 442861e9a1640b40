use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use pkg_constants::paths::{DEFAULT_CONFIG, DEFAULT_DATA_DIR};
use pkg_coord::{CoordManager, ManagerOptions, RegisterOptions};
use pkg_state::{CoordStore, EmbeddedConnector, EmbeddedStore, KvBackend, SlateBackend};
use pkg_types::config::{CoordConfigFile, load_config_file};
use pkg_types::lease::lease_hex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "coordctl", about = "Service registry, discovery and distributed locks")]
struct Cli {
    /// Path to YAML or JSON config file
    #[arg(long, short, default_value = DEFAULT_CONFIG)]
    config: String,

    /// Directory for the SlateDB-backed embedded store
    #[arg(long)]
    data_dir: Option<String>,

    /// Store endpoint (repeatable)
    #[arg(long = "endpoint")]
    endpoints: Vec<String>,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Register an instance and heartbeat until Ctrl-C
    Register {
        #[arg(long)]
        service: String,
        #[arg(long)]
        id: String,
        #[arg(long)]
        addr: String,
        /// Metadata as key=value (repeatable)
        #[arg(long = "meta", value_parser = parse_meta)]
        meta: Vec<(String, String)>,
        #[arg(long)]
        ttl: Option<i64>,
    },
    /// List the instances of a service
    Resolve { service: String },
    /// Print changes to a service until Ctrl-C
    Watch { service: String },
    /// Run contenders against one lock and print who got it when
    LockRace {
        #[arg(long)]
        key: String,
        #[arg(long, default_value_t = 3)]
        contenders: usize,
        #[arg(long, default_value_t = 200)]
        hold_ms: u64,
    },
    /// Dump keys with their revisions and lease bindings
    Inspect {
        #[arg(long, default_value = "/")]
        prefix: String,
    },
}

fn parse_meta(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((k, v)) if !k.is_empty() => Ok((k.to_string(), v.to_string())),
        _ => Err(format!("expected key=value, got '{}'", raw)),
    }
}

fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_json);

    // Load config file (returns defaults if file not found)
    let file_cfg: CoordConfigFile = load_config_file(&cli.config)?;
    info!("Config file: {}", cli.config);

    // Merge: CLI args > config file > defaults
    let mut options = ManagerOptions::default();
    options.merge_file(&file_cfg);
    if !cli.endpoints.is_empty() {
        options.endpoints = cli.endpoints.clone();
    }
    let data_dir = cli
        .data_dir
        .clone()
        .or(file_cfg.data_dir.clone())
        .unwrap_or_else(|| DEFAULT_DATA_DIR.to_string());

    info!("Starting coordctl");
    info!("  Endpoints: {}", options.endpoints.join(","));
    info!("  Data dir:  {}", data_dir);

    let backend = SlateBackend::open(&data_dir).await?;
    let store = EmbeddedStore::open(Arc::new(backend.clone()) as Arc<dyn KvBackend>).await?;

    let result = run(cli.command, options, store).await;
    if let Err(e) = backend.close().await {
        warn!(error = %e, "Failed to close store backend");
    }
    result
}

async fn run(command: Commands, options: ManagerOptions, store: Arc<EmbeddedStore>) -> anyhow::Result<()> {
    match command {
        Commands::Register {
            service,
            id,
            addr,
            meta,
            ttl,
        } => {
            let manager = start_manager(&options, &store).await?;
            let cancel = CancellationToken::new();
            let mut opts = RegisterOptions::default();
            if let Some(ttl) = ttl {
                opts = opts.with_ttl(ttl);
            }
            for (k, v) in meta {
                opts = opts.with_metadata(k, v);
            }
            manager.register(&cancel, &service, &id, &addr, opts).await?;
            println!("Registered {}/{} at {} (Ctrl-C to stop)", service, id, addr);

            tokio::signal::ctrl_c().await?;
            manager.deregister(&cancel, &service, &id).await?;
            println!("Deregistered {}/{}", service, id);
            manager.close().await?;
        }
        Commands::Resolve { service } => {
            let manager = start_manager(&options, &store).await?;
            let cancel = CancellationToken::new();
            let resolved = manager.resolve_service(&cancel, &service).await;
            manager.close().await?;

            let instances = match resolved {
                Ok(instances) => instances,
                Err(e) if e.is_discovery() => {
                    println!("(no instances of {})", service);
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            };
            println!("{:<24} {:<24} {:<18} {}", "ID", "ADDRESS", "LEASE", "METADATA");
            for instance in &instances {
                let mut metadata: Vec<String> = instance
                    .metadata
                    .iter()
                    .map(|(k, v)| format!("{}={}", k, v))
                    .collect();
                metadata.sort();
                println!(
                    "{:<24} {:<24} {:<18} {}",
                    instance.id,
                    instance.address,
                    instance.lease_id.map(lease_hex).unwrap_or_else(|| "-".into()),
                    metadata.join(",")
                );
            }
        }
        Commands::Watch { service } => {
            let manager = start_manager(&options, &store).await?;
            let cancel = CancellationToken::new();
            let mut events = manager.watch_service(&cancel, &service).await?;
            println!("Watching {} (Ctrl-C to stop)", service);
            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => break,
                    event = events.recv() => match event {
                        Some(event) => println!(
                            "{:<8} {:<24} {}",
                            event.event_type.to_string(),
                            event.instance.id,
                            event.instance.address,
                        ),
                        None => {
                            println!("(watch ended)");
                            break;
                        }
                    },
                }
            }
            cancel.cancel();
            manager.close().await?;
        }
        Commands::LockRace {
            key,
            contenders,
            hold_ms,
        } => lock_race(&options, &store, &key, contenders, hold_ms).await?,
        Commands::Inspect { prefix } => {
            let kvs = store.get_prefix(&prefix).await?;
            println!(
                "{:<48} {:>8} {:>8} {:<18} {}",
                "KEY", "CREATE", "MOD", "LEASE", "VALUE"
            );
            for kv in &kvs {
                println!(
                    "{:<48} {:>8} {:>8} {:<18} {}",
                    kv.key,
                    kv.create_revision,
                    kv.mod_revision,
                    kv.lease.map(lease_hex).unwrap_or_else(|| "-".into()),
                    String::from_utf8_lossy(&kv.value)
                );
            }
            if kvs.is_empty() {
                println!("(no keys under {})", prefix);
            }
        }
    }
    Ok(())
}

async fn start_manager(
    options: &ManagerOptions,
    store: &Arc<EmbeddedStore>,
) -> anyhow::Result<Arc<CoordManager>> {
    let connector = Arc::new(EmbeddedConnector::new(store.clone()));
    let manager = CoordManager::new(options.clone(), connector)?;
    manager
        .start(&CancellationToken::new())
        .await
        .context("failed to start coordination manager")?;
    Ok(manager)
}

/// One manager per contender, all on the same store, as separate processes
/// would be.
async fn lock_race(
    options: &ManagerOptions,
    store: &Arc<EmbeddedStore>,
    key: &str,
    contenders: usize,
    hold_ms: u64,
) -> anyhow::Result<()> {
    if contenders == 0 {
        bail!("--contenders must be at least 1");
    }
    let order = Arc::new(Mutex::new(Vec::with_capacity(contenders)));
    let started = Instant::now();

    let mut tasks = Vec::with_capacity(contenders);
    for n in 0..contenders {
        let manager = start_manager(options, store).await?;
        let order = order.clone();
        let key = key.to_string();
        tasks.push(tokio::spawn(async move {
            let cancel = CancellationToken::new();
            manager.lock(&cancel, &key, 0).await?;
            let waited = started.elapsed();
            order.lock().await.push((n, waited));
            info!(contender = n, waited_ms = waited.as_millis() as u64, "Holding lock");
            tokio::time::sleep(Duration::from_millis(hold_ms)).await;
            manager.unlock(&cancel, &key).await?;
            manager.close().await?;
            Ok::<_, pkg_coord::CoordError>(())
        }));
    }
    for task in tasks {
        task.await??;
    }

    println!("{:<6} {:<12} {}", "RANK", "CONTENDER", "ACQUIRED AFTER");
    for (rank, (n, waited)) in order.lock().await.iter().enumerate() {
        println!("{:<6} {:<12} {}ms", rank + 1, n, waited.as_millis());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn meta_pairs() {
        assert_eq!(
            parse_meta("zone=eu-1").unwrap(),
            ("zone".to_string(), "eu-1".to_string())
        );
        assert_eq!(parse_meta("empty=").unwrap(), ("empty".to_string(), String::new()));
        assert!(parse_meta("novalue").is_err());
        assert!(parse_meta("=x").is_err());
    }

    #[test]
    fn cli_parses_globals_and_subcommand() {
        let cli = Cli::try_parse_from([
            "coordctl",
            "--endpoint",
            "a:2379",
            "--endpoint",
            "b:2379",
            "lock-race",
            "--key",
            "job",
            "--contenders",
            "4",
        ])
        .unwrap();
        assert_eq!(cli.endpoints, vec!["a:2379", "b:2379"]);
        assert_eq!(cli.config, DEFAULT_CONFIG);
        match cli.command {
            Commands::LockRace {
                key,
                contenders,
                hold_ms,
            } => {
                assert_eq!(key, "job");
                assert_eq!(contenders, 4);
                assert_eq!(hold_ms, 200);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }
}
