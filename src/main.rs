use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use proxy_sieve::{
    database::StabilityStore,
    proxy::{ProxyParser, Scheme},
    Config, Pipeline,
};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// Multi-stage validator and ranker for public proxy endpoints
#[derive(Parser)]
#[command(name = "proxy-sieve")]
#[command(about = "Multi-stage validator and ranker for public proxy endpoints")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Stability database file path (overrides SIEVE_DB_PATH)
    #[arg(short, long, global = true)]
    database: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate candidates and write ranked outputs
    Run {
        /// Files containing URIs, lists or subscription blobs
        #[arg(required = true)]
        inputs: Vec<PathBuf>,
        /// Output directory
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Concurrent Stage 1 probes
        #[arg(short = 'n', long)]
        concurrency: Option<usize>,
        /// Global deadline for all probe stages in seconds
        #[arg(long)]
        deadline: Option<u64>,
        /// Skip the protocol handshake stage
        #[arg(long)]
        no_protocol_probe: bool,
        /// Skip the proxy-core stage
        #[arg(long)]
        no_core: bool,
        /// Path to an xray/v2ray binary
        #[arg(long)]
        core_path: Option<PathBuf>,
        /// Do not run the system ping
        #[arg(long)]
        no_icmp: bool,
        /// Skip the pre-flight and outage connectivity checks
        #[arg(long)]
        no_connectivity_check: bool,
        /// MaxMind country database
        #[arg(long)]
        geoip: Option<PathBuf>,
        /// Resolve countries through ip-api.com
        #[arg(long)]
        ip_api: bool,
        /// Also write xray_config.json with the top N candidates
        #[arg(long)]
        xray_config: Option<usize>,
        /// Also export a core config per candidate
        #[arg(long)]
        core_configs: bool,
        /// Print the run summary as JSON
        #[arg(long)]
        json: bool,
    },
    /// Parse and normalize candidates without probing
    Parse {
        /// Input file containing URIs, lists or subscription blobs
        input: PathBuf,
        /// Output file for normalized URIs
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Dump stability records as JSON
    History {
        /// Only records with at least this success streak
        #[arg(long, default_value = "0")]
        min_streak: u32,
        /// Show committed runs instead of records
        #[arg(long)]
        runs: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let mut config = Config::from_env();
    if let Some(database) = cli.database {
        config.database_path = database;
    }

    match cli.command {
        Commands::Run {
            inputs,
            output,
            concurrency,
            deadline,
            no_protocol_probe,
            no_core,
            core_path,
            no_icmp,
            no_connectivity_check,
            geoip,
            ip_api,
            xray_config,
            core_configs,
            json,
        } => {
            if let Some(dir) = output {
                config.output.output_dir = dir;
            }
            if let Some(n) = concurrency {
                config.reachability.concurrency = n.clamp(1, 1024);
            }
            if let Some(secs) = deadline {
                config.run_deadline = Some(Duration::from_secs(secs));
            }
            if no_protocol_probe {
                config.protocol_probe = false;
            }
            if no_core {
                config.core_validation = false;
            }
            if let Some(path) = core_path {
                config.core.core_path = Some(path);
            }
            if no_icmp {
                config.reachability.icmp_enabled = false;
            }
            if no_connectivity_check {
                config.connectivity_check = false;
            }
            if geoip.is_some() {
                config.geoip_database = geoip;
            }
            if ip_api {
                config.ip_api_lookup = true;
            }
            if let Some(top_n) = xray_config {
                config.output.write_xray_config = true;
                config.output.xray_top_n = top_n.max(1);
            }
            if core_configs {
                config.output.export_core_configs = true;
            }

            let mut contents = Vec::with_capacity(inputs.len());
            for path in &inputs {
                let content = std::fs::read_to_string(path)
                    .with_context(|| format!("failed to read {}", path.display()))?;
                contents.push(content);
            }

            let mut pipeline = Pipeline::open(config).await?;
            let summary = pipeline.run(&contents).await?;
            pipeline.store().close().await;

            if json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                println!("{}", summary);
            }
        }
        Commands::Parse { input, output } => {
            let outcome = ProxyParser::parse_file(&input)?;

            let mut per_scheme: BTreeMap<Scheme, usize> = BTreeMap::new();
            for candidate in &outcome.candidates {
                *per_scheme.entry(candidate.scheme).or_insert(0) += 1;
            }
            let rendered: Vec<String> = outcome
                .candidates
                .iter()
                .map(|c| ProxyParser::render(c, None))
                .collect();

            match output {
                Some(path) => {
                    let mut content = rendered.join("\n");
                    content.push('\n');
                    std::fs::write(&path, content)
                        .with_context(|| format!("failed to write {}", path.display()))?;
                    println!("Saved {} candidates to {:?}", rendered.len(), path);
                }
                None => {
                    for line in &rendered {
                        println!("{}", line);
                    }
                }
            }

            eprintln!(
                "Parsed {} candidates from {:?} ({} malformed, {} unsupported, {} duplicates)",
                outcome.candidates.len(),
                input,
                outcome.malformed,
                outcome.unsupported,
                outcome.duplicates
            );
            for (scheme, count) in per_scheme {
                eprintln!("  {:<10} {}", scheme, count);
            }
        }
        Commands::History { min_streak, runs } => {
            if !config.database_path.exists() {
                bail!("no stability database at {}", config.database_path.display());
            }
            let store = StabilityStore::open(&config.database_path).await?;
            if runs {
                println!("{}", serde_json::to_string_pretty(&store.runs().await?)?);
            } else {
                let records: Vec<_> = store
                    .list()
                    .await?
                    .into_iter()
                    .filter(|r| r.success_streak >= min_streak)
                    .collect();
                println!("{}", serde_json::to_string_pretty(&records)?);
            }
            store.close().await;
        }
    }

    Ok(())
}
