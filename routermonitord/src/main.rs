mod config;
mod display;
mod error;
mod inventory;
mod lock;
mod notify;
mod reconcile;
mod service;
mod source;
mod vendor;

use std::path::PathBuf;
use std::sync::Arc;
use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use shared::MacAddr;
use crate::config::{Config, ConfigWatcher};
use crate::inventory::{InventoryDb, InventoryHandle, SortKey};
use crate::lock::InstanceLock;
use crate::notify::ConfiguredNotifier;
use crate::reconcile::Reconciler;
use crate::service::{Backends, Service, ServiceExit, Shutdown};
use crate::source::{ClientSource, DhcpSource};
use crate::vendor::{MacVendorsClient, RateGate};

/// Watch a router's DHCP leases and keep an inventory of LAN clients
#[derive(Parser)]
#[command(name = "routermonitord", version)]
struct Cli {
    /// Config file
    #[arg(long, short, default_value = config::DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Sort key: hostname, ip, first_seen, expiry, mac, vendor, notes
    #[arg(long)]
    sort_by: Option<SortKey>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// List the inventory, optionally filtered by a substring
    List {
        search: Option<String>,
        #[arg(long)]
        json: bool,
    },
    /// List the DHCP server's current leases
    ListDhcp,
    /// Reconcile once and notify about changes
    Update,
    /// Reconcile periodically until stopped
    Service,
    /// Set the note on a client
    Note { mac: MacAddr, text: String },
    /// Remove a client from the inventory
    Delete { mac: MacAddr },
    /// Drop the inventory and rebuild it from the DHCP server
    CreateDb,
    /// Retry vendor lookups that previously found nothing
    RefreshVendors,
}

type AppReconciler = Reconciler<DhcpSource, MacVendorsClient>;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("routermonitord=info"))
        )
        .init();

    let watcher = ConfigWatcher::load(&cli.config)
        .with_context(|| format!("Failed to load config from {}", cli.config.display()))?;
    tracing::debug!("Loaded config from {}", cli.config.display());
    let config = watcher.config().clone();

    let sort = match cli.sort_by {
        Some(key) => key,
        None => config.sort_key()?,
    };
    let command = cli.command.unwrap_or(Command::List { search: None, json: false });

    // The live listing never touches the inventory
    if let Command::ListDhcp = command {
        return list_dhcp(&config, sort).await;
    }

    // Listing reads without the lock; everything else may write
    let read_only = matches!(command, Command::List { .. });
    let _lock = if read_only {
        None
    } else {
        Some(InstanceLock::acquire(config.lock_path())?)
    };

    let (db_path, table) = (&config.inventory.db_path, &config.inventory.table);
    let db = if read_only {
        InventoryDb::open_read_only(db_path, table)
    } else {
        InventoryDb::open(db_path, table)
    }
    .with_context(|| format!("Failed to open inventory at {}", db_path.display()))?;
    let store = InventoryHandle::spawn(db);

    let gate = Arc::new(RateGate::new(config.min_lookup_spacing()));
    let backends = build_backends(&config, &gate)?;
    let reconciler = Reconciler::new(backends.source, backends.vendors, store.clone());

    if let Command::Service = command {
        let build = Box::new(move |config: &Config| build_backends(config, &gate));
        let service = Service::new(watcher, reconciler, backends.notifier, build);

        let shutdown = Shutdown::new();
        let listener = service::listen_for_signals(shutdown.clone());
        let exit = service.run(shutdown.clone()).await;
        shutdown.request();
        let _ = listener.await;

        let exit = exit?;
        if let ServiceExit::Signalled(name) = &exit {
            tracing::warn!("Exiting after {}", name);
            std::process::exit(exit.exit_code());
        }
        return Ok(());
    }

    let result = run_command(command, &store, &reconciler, &backends.notifier, sort, &config).await;

    if let Err(e) = store.shutdown().await {
        tracing::error!("Failed to close inventory: {}", e);
    }
    result
}

async fn run_command(
    command: Command,
    store: &InventoryHandle,
    reconciler: &AppReconciler,
    notifier: &ConfiguredNotifier,
    sort: SortKey,
    config: &Config,
) -> Result<()> {
    match command {
        Command::List { search, json } => list(store, search.unwrap_or_default(), sort, json, config).await,
        Command::Update => update(reconciler, notifier).await,
        Command::Note { mac, text } => {
            store.set_note(mac, text).await?;
            println!("Note set for {}", mac);
            Ok(())
        }
        Command::Delete { mac } => {
            let entry = store.delete(mac).await?;
            println!("Deleted {} ({})", entry.mac, entry.hostname);
            Ok(())
        }
        Command::CreateDb => {
            if let Some(entries) = reconciler.bootstrap(true).await? {
                println!("Inventory created with {} clients", entries.len());
            }
            Ok(())
        }
        Command::RefreshVendors => {
            let updated = reconciler.refresh_missing_vendors().await?;
            println!("{} vendors found", updated.len());
            Ok(())
        }
        Command::ListDhcp | Command::Service => unreachable!("handled before the inventory is opened"),
    }
}

fn build_backends(
    config: &Config,
    gate: &Arc<RateGate>,
) -> Result<Backends<DhcpSource, MacVendorsClient, ConfiguredNotifier>> {
    gate.set_spacing(config.min_lookup_spacing());
    Ok(Backends {
        source: DhcpSource::from_config(&config.dhcp).context("Failed to set up DHCP source")?,
        vendors: MacVendorsClient::new(&config.vendor, gate.clone())
            .context("Failed to set up vendor lookup")?,
        notifier: ConfiguredNotifier::from_config(&config.notify)?,
    })
}

async fn list(store: &InventoryHandle, search: String, sort: SortKey, json: bool, config: &Config) -> Result<()> {
    if !store.table_exists().await? {
        bail!(
            "inventory table {} does not exist yet; run `update` or `create-db`",
            config.inventory.table
        );
    }

    let entries = store.find(search, sort).await?;
    if json {
        println!("{}", display::inventory_json(&entries)?);
    } else {
        print!("{}", display::inventory_table(&entries, config.vendor.field_width));
    }
    Ok(())
}

async fn list_dhcp(config: &Config, sort: SortKey) -> Result<()> {
    let source = DhcpSource::from_config(&config.dhcp).context("Failed to set up DHCP source")?;
    if !sort.applies_to_records() {
        tracing::warn!("Leases have no {} column; sorting by hostname", sort.as_str());
    }

    let snapshot = source
        .fetch_clients()
        .await
        .with_context(|| format!("Failed to read leases from {}", source.kind()))?;
    let mut records: Vec<_> = snapshot.into_values().collect();
    inventory::query::sort_records(&mut records, sort);

    print!("{}", display::snapshot_table(&records));
    Ok(())
}

async fn update(reconciler: &AppReconciler, notifier: &ConfiguredNotifier) -> Result<()> {
    if let Some(entries) = reconciler.bootstrap(false).await? {
        println!("Inventory created with {} clients", entries.len());
        return Ok(());
    }

    let events = reconciler.reconcile().await?;
    let sent = notify::dispatch(notifier, &events).await;
    tracing::info!("{} changes, {} notifications sent", events.len(), sent);
    Ok(())
}
