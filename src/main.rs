//! IP gate CLI: enrichment lookups and operator actions.

use anyhow::Result;
use clap::{Parser, Subcommand};
use ipgate::access::{sanitize_deny_countries, AccessEngine};
use ipgate::cache::CacheStore;
use ipgate::config::Config;
use ipgate::events::{EventLog, Severity};
use ipgate::geo::GeoResolver;
use ipgate::intel::ThreatAggregator;
use ipgate::pool::PoolResolver;
use ipgate::range::{expand, Expansion, NetworkPool};
use ipgate::rotation::LogRotator;
use std::io::Write;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "ipgate")]
#[command(about = "IP intelligence and access gating - ownership, geo consensus, reputation, log rotation")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "ipgate.yaml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'L', long, default_value = "info")]
    log_level: String,

    /// Print example configuration and exit
    #[arg(long)]
    print_config: bool,

    /// Validate configuration and exit
    #[arg(long)]
    validate: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Decide allow/block for an IP
    Check {
        ip: IpAddr,

        /// Country code to use instead of resolving one
        #[arg(long)]
        country: Option<String>,

        /// Edge-network country header value, if the request carried one
        #[arg(long)]
        edge: Option<String>,
    },

    /// Resolve the geo consensus for an IP
    Geo { ip: IpAddr },

    /// Aggregate threat intelligence for an IP
    Intel { ip: IpAddr },

    /// Resolve the network pool an IP belongs to
    Pool { ip: IpAddr },

    /// Enumerate the addresses of a CIDR or range
    Expand { pool: String },

    /// Rotate the event log now
    Rotate {
        /// Rotate even below the size threshold
        #[arg(long)]
        force: bool,
    },

    /// Purge cached enrichment results
    ClearCache {
        /// Only purge keys under this prefix (e.g. "geo:")
        #[arg(long)]
        prefix: Option<String>,
    },

    /// Manage rotated archives
    Archives {
        #[command(subcommand)]
        action: ArchiveAction,
    },

    /// Add an IP's pool (or an explicit pool) to the deny file
    Block { target: String },

    /// Save the country list, with self-lockout protection
    SetCountries {
        /// Two-letter country codes
        countries: Vec<String>,

        /// Operator's own IP, used to detect a self-lockout
        #[arg(long)]
        own_ip: Option<IpAddr>,
    },
}

#[derive(Subcommand, Debug)]
enum ArchiveAction {
    /// List archives, newest first
    List,
    /// Delete one archive by name
    Delete { name: String },
    /// Prepend an archive back into the active log
    Restore { name: String },
}

/// Everything the commands share.
struct Context {
    config: Arc<Config>,
    cache: Arc<CacheStore>,
    log: Arc<EventLog>,
    geo: Arc<GeoResolver>,
    intel: Arc<ThreatAggregator>,
}

impl Context {
    fn new(config: Config) -> Self {
        let config = Arc::new(config);
        let cache = Arc::new(CacheStore::new(config.paths.cache_file.clone(), 10_000));
        let log = Arc::new(EventLog::new(&config.paths.event_log));
        let geo = Arc::new(GeoResolver::new(&config.geo, cache.clone()));
        let intel = Arc::new(ThreatAggregator::new(&config, cache.clone()));

        Self {
            config,
            cache,
            log,
            geo,
            intel,
        }
    }

    fn engine(&self) -> AccessEngine {
        AccessEngine::new(
            self.config.clone(),
            self.geo.clone(),
            self.intel.clone(),
            self.log.clone(),
        )
    }

    fn pool_resolver(&self) -> PoolResolver {
        PoolResolver::new(&self.config.pool, self.cache.clone())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.print_config {
        println!("{}", Config::example());
        return Ok(());
    }

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(config = %args.config.display(), "Loading configuration");
    let config = Config::load(&args.config)?;

    if args.validate {
        info!("Configuration is valid");
        return Ok(());
    }

    let Some(command) = args.command else {
        anyhow::bail!("No command given; see --help");
    };

    let ctx = Context::new(config);

    match command {
        Command::Check { ip, country, edge } => {
            let engine = ctx.engine();
            let verdict = match country {
                Some(country) => Some(engine.decide(&ip, &country.to_ascii_uppercase()).await),
                None => engine.gate(&ip, edge.as_deref()).await,
            };

            match verdict {
                Some(v) if v.block => println!("block (reason {})", v.reason),
                Some(v) if v.preview => println!("allow [preview] (reason {})", v.reason),
                Some(v) => println!("allow (reason {})", v.reason),
                None => println!("allow (gate disabled)"),
            }
        }

        Command::Geo { ip } => {
            let consensus = ctx.geo.consensus(&ip, None).await;
            println!(
                "{} (confident: {})",
                consensus.country_code, consensus.confident
            );
            for (source, code) in &consensus.sources {
                println!("  {}: {}", source, code);
            }
        }

        Command::Intel { ip } => {
            let intel = ctx.intel.check(&ip).await;
            println!(
                "score {} (malicious: {})",
                intel.score, intel.is_malicious
            );
            println!("  abuse confidence: {}", intel.abuse_score);
            println!("  detections:       {}", intel.detection_count);
            println!("  dnsbl listed:     {}", intel.dnsbl_hit);
            println!("  community listed: {}", intel.community_hit);
            if !intel.sources.is_empty() {
                println!("  sources: {}", intel.sources.join(", "));
            }
        }

        Command::Pool { ip } => {
            let pool = ctx.pool_resolver().resolve_pool(&ip).await;
            println!("{}", pool);
        }

        Command::Expand { pool } => {
            let pool: NetworkPool = pool.parse()?;
            match expand(&pool) {
                Expansion::Complete(ips) => {
                    for ip in ips {
                        println!("{}", ip);
                    }
                }
                Expansion::Truncated { total } => {
                    println!("{} addresses; too large to expand", total);
                }
            }
        }

        Command::Rotate { force } => {
            let rotator = LogRotator::new(&ctx.log, &ctx.config.paths.archive_dir);
            let report = rotator.rotate(&ctx.config.rotation, force)?;

            if report.skipped {
                println!("skipped (another rotation ran moments ago)");
            } else if report.initialized {
                println!("created {}", ctx.config.paths.event_log.display());
            } else if let Some(archive) = &report.rotated_to {
                println!("rotated to {}", archive.display());
                if report.archives_pruned > 0 {
                    println!("pruned {} old archives", report.archives_pruned);
                }
                if report.entries_cleaned > 0 {
                    println!("removed {} aged entries", report.entries_cleaned);
                }
            } else if report.entries_cleaned > 0 {
                println!("removed {} aged entries", report.entries_cleaned);
            } else {
                println!("nothing to do");
            }
        }

        Command::ClearCache { prefix } => {
            let removed = match prefix {
                Some(prefix) => ctx.cache.delete_by_prefix(&prefix),
                None => {
                    let count = ctx.cache.len();
                    ctx.cache.clear();
                    count
                }
            };
            println!("purged {} cache entries", removed);
        }

        Command::Archives { action } => {
            let rotator = LogRotator::new(&ctx.log, &ctx.config.paths.archive_dir);
            match action {
                ArchiveAction::List => {
                    let archives = rotator.list_archives()?;
                    if archives.is_empty() {
                        println!("no archives");
                    }
                    for archive in archives {
                        println!("{}", archive.file_name().unwrap_or_default().to_string_lossy());
                    }
                }
                ArchiveAction::Delete { name } => {
                    rotator.delete_archive(&name)?;
                    println!("deleted {}", name);
                }
                ArchiveAction::Restore { name } => {
                    rotator.restore_archive(&name)?;
                    println!("restored {}", name);
                }
            }
        }

        Command::Block { target } => {
            let pool = match target.parse::<IpAddr>() {
                Ok(ip) => ctx.pool_resolver().resolve_pool(&ip).await,
                Err(_) => target.parse::<NetworkPool>()?,
            };

            let deny_file = &ctx.config.paths.deny_file;
            if let Some(parent) = deny_file.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let mut file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(deny_file)?;
            for cidr in pool.to_cidrs() {
                writeln!(file, "{}", cidr)?;
            }

            ctx.log.append(
                "ipgate",
                "",
                Severity::Notice,
                &format!("operator blocked pool {}", pool),
            )?;
            println!("blocked {}", pool);
        }

        Command::SetCountries { countries, own_ip } => {
            let countries: Vec<String> = countries
                .iter()
                .map(|c| c.trim().to_ascii_uppercase())
                .collect();

            let own_country = match own_ip {
                Some(ip) => {
                    let consensus = ctx.geo.consensus(&ip, None).await;
                    consensus.confident.then_some(consensus.country_code)
                }
                None => None,
            };

            let (kept, notice) = sanitize_deny_countries(
                ctx.config.settings.mode,
                &countries,
                own_country.as_deref(),
            );

            let mut updated = (*ctx.config).clone();
            updated.settings.countries = kept.clone();
            updated.validate()?;
            updated.save(&args.config)?;

            if let Some(notice) = notice {
                println!("warning: {}", notice);
            }
            println!("saved countries: {}", kept.join(", "));
        }
    }

    Ok(())
}
