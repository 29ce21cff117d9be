//! Collaboration coordinator binary
//!
//! `serve` runs the coordination endpoint, `connect` follows one context as
//! a client and logs what other users are doing.

use std::time::Duration;

use clap::Parser;
use tracing::{info, warn};

use collab_coordinator::cli::{Cli, Commands, ConfigSubcommand};
use collab_coordinator::config::{self, CollabConfig};
use collab_coordinator::error::{Error, Result};
use collab_coordinator::protocol::EntityRef;
use collab_coordinator::{
    logging, version, ConnectionState, CoordinationServer, Coordinator, CoordinatorEvent,
    ServerConfig, SessionConfig,
};

fn main() -> Result<()> {
    // Parse before logging so verbosity is known
    let cli = Cli::parse();

    match &cli.command {
        Commands::Version => {
            version::print_version();
            return Ok(());
        }
        Commands::Config { subcommand } => {
            logging::init_simple(tracing::Level::WARN)?;
            return handle_config_command(subcommand.clone());
        }
        _ => {}
    }

    let config_path = match &cli.command {
        Commands::Serve { config, .. } | Commands::Connect { config, .. } => config.clone(),
        _ => None,
    };

    let mut config =
        CollabConfig::load_layered(config_path.as_deref()).unwrap_or_else(|e| exit_with(e));
    apply_cli_overrides(&mut config, &cli.command);
    if let Err(e) = config.validate() {
        exit_with(e);
    }

    // Guards flush the log file on drop
    let _log_guards = logging::init_logging(&config.logging, cli.verbose, cli.quiet)?;

    let build = version::build_info();
    info!(
        version = %build.full_version(),
        target = %build.target,
        profile = %build.profile,
        "Starting collab-coordinator"
    );

    let runtime = build_runtime(&config)?;

    match cli.command {
        Commands::Serve { .. } => runtime.block_on(serve(config)),
        Commands::Connect { edit, .. } => runtime.block_on(connect(config, edit)),
        Commands::Version | Commands::Config { .. } => Ok(()),
    }
}

fn exit_with(e: Error) -> ! {
    eprint!("{}", e.format_for_terminal());
    std::process::exit(e.exit_code());
}

/// Flags win over file and environment
fn apply_cli_overrides(config: &mut CollabConfig, command: &Commands) {
    match command {
        Commands::Serve { bind, .. } => {
            if let Some(bind) = bind {
                config.server.bind_addr = bind.clone();
            }
        }
        Commands::Connect {
            url,
            user_id,
            name,
            context,
            ..
        } => {
            if let Some(url) = url {
                config.coordinator.url = url.clone();
            }
            if let Some(user_id) = user_id {
                config.identity.user_id = Some(user_id.clone());
            }
            if let Some(name) = name {
                config.identity.display_name = Some(name.clone());
            }
            if let Some(context) = context {
                config.coordinator.initial_context = Some(context.clone());
            }
        }
        Commands::Version | Commands::Config { .. } => {}
    }
}

/// One runtime for every command, sized by `[server].worker_threads`
fn build_runtime(config: &CollabConfig) -> Result<tokio::runtime::Runtime> {
    let worker_threads = match config.server.worker_threads {
        0 => num_cpus::get().min(8),
        n => n,
    };

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .worker_threads(worker_threads)
        .thread_name("collab")
        .build()
        .map_err(|e| Error::Internal(format!("Failed to create async runtime: {e}")))
}

/// Run the coordination server until Ctrl+C
async fn serve(config: CollabConfig) -> Result<()> {
    let server = CoordinationServer::bind(ServerConfig::from(&config.server)).await?;
    let handle = server.handle();
    let mut accept_loop = tokio::spawn(server.run());

    let result = tokio::select! {
        joined = &mut accept_loop => joined,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
            handle.shutdown();
            accept_loop.await
        }
    };

    let stats = handle.stats().await;
    info!(
        total_connections = stats.total_connections,
        active_connections = stats.active_connections,
        active_contexts = stats.active_contexts,
        "Server stopped"
    );

    result.map_err(|e| Error::Internal(format!("Accept loop failed: {e}")))?
}

/// Follow a context as a client until Ctrl+C
async fn connect(config: CollabConfig, edit: Option<EntityRef>) -> Result<()> {
    let identity = config.identity();
    info!(
        user_id = %identity.user_id,
        display_name = %identity.display_name,
        url = %config.coordinator.url,
        context = ?config.coordinator.initial_context,
        "Connecting"
    );

    let mut coordinator = Coordinator::new(SessionConfig::from(&config.coordinator), identity);
    let mut events = coordinator.start()?;

    let shutdown_signal = tokio::signal::ctrl_c();
    tokio::pin!(shutdown_signal);

    loop {
        tokio::select! {
            _ = &mut shutdown_signal => {
                info!("Shutdown signal received");
                break;
            }

            event = events.recv() => {
                let Some(event) = event else {
                    warn!("Coordinator stopped");
                    break;
                };
                match event {
                    CoordinatorEvent::ConnectionChanged(ConnectionState::Connected) => {
                        info!("Connected");
                        // The session re-announces intent on reconnect; only declare it once
                        if let Some(target) = &edit {
                            if coordinator.editing_intent().is_none() {
                                coordinator.start_editing(&target.entity_type, &target.entity_id);
                                info!(entity = %target, "Editing");
                            }
                        }
                    }
                    CoordinatorEvent::ConnectionChanged(state) => {
                        info!(state = %state, "Connection state changed");
                    }
                    CoordinatorEvent::Reconnecting { attempt, delay } => {
                        info!(attempt, delay_ms = delay.as_millis() as u64, "Reconnecting");
                    }
                    CoordinatorEvent::PresenceChanged => {
                        for entry in coordinator.presence_list() {
                            match &entry.editing {
                                Some(target) => info!(
                                    user_id = %entry.user_id,
                                    name = %entry.display_name,
                                    editing = %target,
                                    "Present"
                                ),
                                None => info!(
                                    user_id = %entry.user_id,
                                    name = %entry.display_name,
                                    "Present"
                                ),
                            }
                        }
                    }
                    CoordinatorEvent::EntityChanged(change) => {
                        info!(
                            entity_type = %change.entity_type,
                            entity_id = %change.entity_id,
                            change_kind = %change.change_kind,
                            author = ?change.author_user_id,
                            "Entity changed"
                        );
                    }
                    CoordinatorEvent::HeartbeatAck => {}
                }
            }
        }
    }

    coordinator.stop_editing();
    // Give the stop a chance to reach the wire before the close frame
    tokio::time::sleep(Duration::from_millis(50)).await;
    coordinator.shutdown().await;
    Ok(())
}

fn handle_config_command(subcommand: ConfigSubcommand) -> Result<()> {
    match subcommand {
        ConfigSubcommand::Show { config } => {
            let cfg = CollabConfig::load(config.as_deref())?;
            println!("{}", toml::to_string_pretty(&cfg)?);
        }
        ConfigSubcommand::Init { path, force } => {
            let path = config::init_config(path.as_deref(), force)?;
            println!("Configuration written to {}", path.display());
        }
        ConfigSubcommand::Validate { config } => match CollabConfig::load(config.as_deref()) {
            Ok(_) => println!("Configuration is valid."),
            Err(e) => exit_with(e),
        },
    }

    Ok(())
}
