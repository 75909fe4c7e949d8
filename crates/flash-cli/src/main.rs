use std::path::{Path, PathBuf};

use clap::{ArgAction, Args, Parser, Subcommand};
use color_eyre::eyre::{eyre, Context, Result};
use comfy_table::presets::UTF8_BORDERS_ONLY;
use comfy_table::Table;
use flash_data::registry::ThresholdSetting;
use flash_data::rpc::RpcClient;
use flash_data::store::Store;
use flash_data::Registry;
use flash_exec::{format_eth, EngineConfig};
use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::watch;
use tracing::{info, warn, Level};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone)]
struct AppContext {
    db_path: String,
    ws_url: Option<String>,
    rpc_url: Option<String>,
    relay_url: Option<String>,
    signer_key: Option<String>,
    identity_key: Option<String>,
}

#[derive(Parser, Debug)]
#[command(name = "flash-arb")]
#[command(about = "Flash-borrow cyclic arbitrage over constant-product pools")]
#[command(version)]
struct Cli {
    #[arg(long, short = 'v', action = ArgAction::Count, global = true)]
    verbose: u8,

    #[arg(long, short = 'q', global = true)]
    quiet: bool,

    #[arg(long, global = true, default_value = "data/flash.sqlite")]
    db_path: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the live engine until interrupted.
    Run(RunArgs),
    /// Read reserves once and print every profitable cycle.
    Scan(RegistryArgs),
    /// Load the registry and report what it defines.
    Validate(RegistryArgs),
    /// Show the submitted bundle audit log.
    Bundles(BundlesArgs),
    /// List blacklisted cycles, or lift one.
    Blacklist(BlacklistArgs),
}

#[derive(Args, Debug)]
struct RegistryArgs {
    #[arg(long)]
    registry: PathBuf,
}

#[derive(Args, Debug)]
struct RunArgs {
    #[arg(long)]
    registry: PathBuf,

    /// Simulate bundles but never send them.
    #[arg(long)]
    dry_run: bool,

    /// Stop after the first bundle outcome.
    #[arg(long)]
    single_shot: bool,
}

#[derive(Args, Debug)]
struct BundlesArgs {
    #[arg(long, default_value_t = 20)]
    limit: usize,
}

#[derive(Args, Debug)]
struct BlacklistArgs {
    /// Cycle id to remove from the blacklist.
    #[arg(long)]
    remove: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet)?;

    let ctx = AppContext {
        db_path: cli.db_path,
        ws_url: std::env::var("FLASH_WS_URL").ok(),
        rpc_url: std::env::var("FLASH_RPC_URL").ok(),
        relay_url: std::env::var("FLASH_RELAY_URL").ok(),
        signer_key: std::env::var("FLASH_SIGNER_KEY").ok(),
        identity_key: std::env::var("FLASH_IDENTITY_KEY").ok(),
    };

    match cli.command {
        Commands::Run(args) => handle_run(&ctx, args).await,
        Commands::Scan(args) => handle_scan(&ctx, args).await,
        Commands::Validate(args) => handle_validate(args),
        Commands::Bundles(args) => handle_bundles(&ctx, args),
        Commands::Blacklist(args) => handle_blacklist(&ctx, args),
    }
}

fn init_tracing(verbose: u8, quiet: bool) -> Result<()> {
    let level = if quiet {
        Level::WARN
    } else {
        match verbose {
            0 => Level::INFO,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        }
    };

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level.as_str()))
        .wrap_err("failed to initialize tracing filter")?;

    tracing_subscriber::fmt().with_env_filter(filter).init();
    Ok(())
}

fn required(value: &Option<String>, name: &str) -> Result<String> {
    value
        .clone()
        .ok_or_else(|| eyre!("{name} is required for this command"))
}

async fn handle_run(ctx: &AppContext, args: RunArgs) -> Result<()> {
    let registry = Registry::load(&args.registry)?;
    ensure_parent_dir(&ctx.db_path)?;

    let config = EngineConfig {
        ws_url: required(&ctx.ws_url, "FLASH_WS_URL")?,
        rpc_url: required(&ctx.rpc_url, "FLASH_RPC_URL")?,
        relay_url: required(&ctx.relay_url, "FLASH_RELAY_URL")?,
        signer_key: required(&ctx.signer_key, "FLASH_SIGNER_KEY")?,
        identity_key: ctx.identity_key.clone(),
        db_path: ctx.db_path.clone(),
        dry_run: args.dry_run,
        single_shot: args.single_shot,
    };
    if config.identity_key.is_none() {
        warn!("FLASH_IDENTITY_KEY not set, using a throwaway relay identity");
    }

    let (shutdown, _) = watch::channel(false);
    let interrupt = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, shutting down");
            interrupt.send_replace(true);
        }
    });

    flash_exec::run(registry, config, shutdown)
        .await
        .wrap_err("engine stopped with an error")?;
    info!("engine stopped");
    Ok(())
}

async fn handle_scan(ctx: &AppContext, args: RegistryArgs) -> Result<()> {
    let registry = Registry::load(&args.registry)?;
    let rpc_url = required(&ctx.rpc_url, "FLASH_RPC_URL")?;
    let rpc = RpcClient::new(&rpc_url)?;

    let pb = ProgressBar::new(registry.pools.len() as u64);
    pb.set_style(
        ProgressStyle::with_template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
            .wrap_err("failed to create progress style")?,
    );
    pb.set_message("reading reserves");

    let found = flash_exec::scan(&registry, &rpc, &pb)
        .await
        .wrap_err("scan failed")?;
    pb.finish_with_message("reserves loaded");

    if found.is_empty() {
        println!("No profitable cycles at the current block.");
        return Ok(());
    }

    let mut table = Table::new();
    table.load_preset(UTF8_BORDERS_ONLY);
    table.set_header(vec!["Cycle", "Hops", "Borrow", "Repay", "Gross Profit"]);
    for (cycle, result) in &found {
        let profit = if cycle.repay_token == registry.wrapped_native {
            format_eth(u128::try_from(result.profit_amount).unwrap_or(u128::MAX))
        } else {
            result.profit_amount.to_string()
        };
        table.add_row(vec![
            cycle.id.clone(),
            result.swap_hops().len().to_string(),
            result.borrow_amount.to_string(),
            result.repay_amount.to_string(),
            profit,
        ]);
    }
    println!("{table}");
    info!(opportunities = found.len(), "scan finished");
    Ok(())
}

fn handle_validate(args: RegistryArgs) -> Result<()> {
    let registry = Registry::load(&args.registry)?;
    let settings = &registry.settings;

    let mut table = Table::new();
    table.load_preset(UTF8_BORDERS_ONLY);
    table.set_header(vec!["Item", "Value"]);
    table.add_row(vec!["Tokens".to_string(), registry.tokens.len().to_string()]);
    table.add_row(vec!["Pools".to_string(), registry.pools.len().to_string()]);
    table.add_row(vec!["Cycles".to_string(), registry.cycles.len().to_string()]);
    table.add_row(vec!["Routers".to_string(), registry.routers.len().to_string()]);
    table.add_row(vec![
        "Wrapped native".to_string(),
        registry.wrapped_native.to_string(),
    ]);
    table.add_row(vec![
        "Executor".to_string(),
        settings
            .executor
            .map_or_else(|| "(unset)".to_string(), |executor| executor.to_string()),
    ]);
    table.add_row(vec![
        "Profit threshold".to_string(),
        match settings.profit_threshold {
            ThresholdSetting::AbsoluteWei(wei) => format_eth(wei),
            ThresholdSetting::GasMultiplePct(pct) => format!("{pct}% of gas cost"),
        },
    ]);
    table.add_row(vec![
        "Blacklist rule".to_string(),
        format!(
            "{}% failures after {} simulations",
            settings.fail_threshold_pct, settings.min_simulation_attempts
        ),
    ]);
    println!("{table}");

    let wrapped = registry
        .cycles
        .iter()
        .filter(|cycle| cycle.repay_token == registry.wrapped_native)
        .count();
    if wrapped < registry.cycles.len() {
        warn!(
            skipped = registry.cycles.len() - wrapped,
            "cycles not repaid in the wrapped native token will never be submitted"
        );
    }
    Ok(())
}

fn handle_bundles(ctx: &AppContext, args: BundlesArgs) -> Result<()> {
    let store = Store::new(&ctx.db_path).wrap_err("failed to open SQLite store")?;
    let bundles = store
        .recent_bundles(args.limit)
        .wrap_err("failed to query submitted bundles")?;
    if bundles.is_empty() {
        println!("No bundles submitted yet.");
        return Ok(());
    }

    let mut table = Table::new();
    table.load_preset(UTF8_BORDERS_ONLY);
    table.set_header(vec![
        "Bundle (truncated)",
        "Cycle",
        "Target Blocks",
        "Net Profit",
        "Submitted",
        "Outcome",
    ]);
    for (record, outcome) in bundles {
        let profit = record
            .profit_wei
            .parse::<u128>()
            .map(format_eth)
            .unwrap_or(record.profit_wei);
        let outcome = outcome.unwrap_or_else(|| "pending".to_string());
        let colored = format!("{}{}{}", color_outcome(&outcome), outcome, COLOR_RESET);
        table.add_row(vec![
            truncate_hash(&record.bundle_hash),
            record.cycle_id,
            format_blocks(&record.target_blocks),
            profit,
            format_timestamp(&record.submitted_at),
            colored,
        ]);
    }
    println!("{table}");
    Ok(())
}

fn handle_blacklist(ctx: &AppContext, args: BlacklistArgs) -> Result<()> {
    let store = Store::new(&ctx.db_path).wrap_err("failed to open SQLite store")?;

    if let Some(cycle_id) = args.remove {
        if store.unblacklist_cycle(&cycle_id)? {
            info!(cycle = %cycle_id, "cycle removed from blacklist");
        } else {
            return Err(eyre!("cycle {cycle_id} is not blacklisted"));
        }
        return Ok(());
    }

    let entries = store.blacklist().wrap_err("failed to query blacklist")?;
    if entries.is_empty() {
        println!("No blacklisted cycles.");
        return Ok(());
    }

    let mut table = Table::new();
    table.load_preset(UTF8_BORDERS_ONLY);
    table.set_header(vec!["Cycle", "Reason", "Failures", "Since"]);
    for entry in entries {
        table.add_row(vec![
            entry.cycle_id,
            entry.reason,
            format!("{}/{}", entry.failures, entry.simulations),
            format_timestamp(&entry.blacklisted_at),
        ]);
    }
    println!("{table}");
    Ok(())
}

fn color_outcome(outcome: &str) -> &'static str {
    match outcome {
        "confirmed" => "\x1b[32m", // Green
        "dropped" => "\x1b[31m",   // Red
        _ => "\x1b[33m",           // Yellow
    }
}

const COLOR_RESET: &str = "\x1b[0m";

fn truncate_hash(hash: &str) -> String {
    if hash.len() > 14 {
        format!("{}...{}", &hash[..10], &hash[hash.len() - 4..])
    } else {
        hash.to_string()
    }
}

fn format_blocks(blocks: &[u64]) -> String {
    match (blocks.first(), blocks.last()) {
        (Some(first), Some(last)) if first != last => format!("{first}-{last}"),
        (Some(first), _) => first.to_string(),
        _ => "-".to_string(),
    }
}

fn format_timestamp(value: &str) -> String {
    chrono::DateTime::parse_from_rfc3339(value)
        .map(|at| at.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|_| value.to_string())
}

fn ensure_parent_dir(db_path: &str) -> Result<()> {
    match Path::new(db_path).parent() {
        Some(parent) if !parent.as_os_str().is_empty() => std::fs::create_dir_all(parent)
            .wrap_err_with(|| format!("failed to create data directory {}", parent.display())),
        _ => Ok(()),
    }
}
