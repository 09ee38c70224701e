//! Berth CLI - Provision and reap challenge containers

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use serde_json::Value;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use berth::api;
use berth::challenge::MemoryCatalog;
use berth::cli::{parse_key_values, Args, SubCommand, SubjectArgs};
use berth::container::ContainerManager;
use berth::runtime::{DockerConnector, MemoryConnector};
use berth::settings::{JsonFileSettings, ManagerSettings, MemorySettings, SettingsStore};
use berth::store::{JsonFileStore, MemoryStore, SubjectKey};
use berth::{format_output, OutputFormat};

fn main() {
    let args = Args::parse();

    if let Err(e) = init_tracing(args.verbose) {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Error: failed to start async runtime: {}", e);
            std::process::exit(1);
        }
    };

    match runtime.block_on(run(args)) {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(e) => {
            eprintln!("Error: {:#}", e);
            std::process::exit(1);
        }
    }
}

fn init_tracing(verbose: bool) -> Result<()> {
    let default = if verbose { "berth=debug" } else { "berth=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init()
        .map_err(|e| anyhow!("Failed to initialize tracing: {}", e))
}

async fn build_manager(args: &Args) -> Result<ContainerManager> {
    let catalog = if args.catalog.exists() {
        MemoryCatalog::from_file(&args.catalog)
            .with_context(|| format!("loading catalog {}", args.catalog.display()))?
    } else {
        warn!(path = %args.catalog.display(), "challenge catalog not found, starting empty");
        MemoryCatalog::new()
    };

    let settings_file = JsonFileSettings::new(&args.settings);

    let manager = if args.dry_run {
        let entries = settings_file
            .load()
            .await
            .with_context(|| format!("loading settings {}", args.settings.display()))?;
        ContainerManager::new(
            Arc::new(MemoryConnector::new()),
            Arc::new(MemoryStore::new()),
            Arc::new(catalog),
        )
        .with_settings_store(Arc::new(MemorySettings::with_entries(entries)))
    } else {
        let store = JsonFileStore::open(&args.state)
            .with_context(|| format!("opening state file {}", args.state.display()))?;
        let mut connector = DockerConnector::new(args.timeout);
        if let Some(dir) = &args.tls_certs {
            connector = connector.with_tls(dir);
        }
        ContainerManager::new(
            Arc::new(connector),
            Arc::new(store),
            Arc::new(catalog),
        )
        .with_settings_store(Arc::new(settings_file))
    };

    Ok(manager)
}

fn subject(settings: &ManagerSettings, args: &SubjectArgs) -> Result<SubjectKey> {
    if settings.team_mode {
        let team = args
            .team
            .ok_or_else(|| anyhow!("team mode is enabled, pass --team"))?;
        Ok(SubjectKey::team(team, args.user))
    } else {
        if args.team.is_some() {
            warn!("team mode is disabled, ignoring --team");
        }
        Ok(SubjectKey::user(args.user))
    }
}

/// Print a response; returns false when it carries an error
fn emit(value: &Value, format: &OutputFormat) -> bool {
    let rendered = format_output(value, format);
    if value.get("error").is_some() {
        eprintln!("{}", rendered);
        false
    } else {
        println!("{}", rendered);
        true
    }
}

async fn run(args: Args) -> Result<bool> {
    let output_format = if args.json { OutputFormat::Json } else { OutputFormat::Human };
    let manager = build_manager(&args).await?;

    if let Err(e) = manager.initialize().await {
        if matches!(args.command, SubCommand::Serve) {
            return Err(e).context("initializing container manager");
        }
        warn!(error = %e, "container manager not connected");
    }
    if args.dry_run {
        info!("dry run: using the in-process runtime, nothing is persisted");
    }

    let settings = manager.settings();
    let response = match &args.command {
        SubCommand::Serve => {
            serve(&manager).await?;
            return Ok(true);
        }
        SubCommand::Request(s) => {
            api::request_container(&manager, s.challenge, &subject(&settings, s)?).await
        }
        SubCommand::Info(s) => api::view_info(&manager, s.challenge, &subject(&settings, s)?).await,
        SubCommand::Renew(s) => {
            api::renew_container(&manager, s.challenge, &subject(&settings, s)?).await
        }
        SubCommand::Stop(s) => {
            api::stop_container(&manager, s.challenge, &subject(&settings, s)?).await
        }
        SubCommand::ConnectType { challenge } => api::get_connect_type(&manager, *challenge).await,
        SubCommand::Kill { id } => api::kill_container(&manager, id).await,
        SubCommand::Purge => api::purge_all(&manager).await,
        SubCommand::Images => api::list_images(&manager).await,
        SubCommand::Containers => api::list_running_containers(&manager).await,
        SubCommand::Endpoints => api::list_running_endpoints(&manager).await,
        SubCommand::UpdateSettings { values } => {
            let blob: HashMap<String, String> = parse_key_values(values)
                .map_err(|e| anyhow!(e))?
                .into_iter()
                .collect();
            api::update_settings(&manager, &blob).await
        }
    };

    let ok = emit(&response, &output_format);
    manager.shutdown();
    Ok(ok)
}

/// Keep the sweeper alive until Ctrl+C
async fn serve(manager: &ContainerManager) -> Result<()> {
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();

    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })
    .map_err(|e| anyhow!("Failed to set Ctrl+C handler: {}", e))?;

    let endpoints = manager.list_running_endpoints();
    println!(
        "Serving {} endpoint(s): {} (Press Ctrl+C to stop)",
        endpoints.len(),
        endpoints.join(", ")
    );
    if !manager.sweeper_running() {
        println!("Automatic expiry is disabled");
    }

    while running.load(Ordering::SeqCst) {
        tokio::time::sleep(Duration::from_millis(250)).await;
    }

    manager.shutdown();
    println!("\nBerth stopped.");
    Ok(())
}
