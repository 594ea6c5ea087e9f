// SPDX-License-Identifier: GPL-2.0-only
use clap::Parser;
use keel_lib::agent::NodeAgent;
use keel_lib::bus::{Bus, LocalBus};
use keel_lib::config::{self, Config, Role};
use keel_lib::feed::ChangeFeed;
use keel_lib::orchestrator::Controller;
use keel_lib::runtime::{self, metadata::MetadataState};
use keel_lib::store::traits::StateStore;
use keel_lib::store::SqliteStore;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

mod api;
mod logging;
mod server;

#[derive(Parser)]
#[command(name = "keeld", about = "Keel daemon")]
struct Cli {
    /// Path to configuration file
    /// [default: $XDG_CONFIG_HOME/keel/keel.yaml]
    #[arg(long)]
    config: Option<String>,

    /// Path to database file
    /// [default: $XDG_STATE_HOME/keel/keel.db]
    #[arg(long)]
    db: Option<String>,
}

type RoleTask = (Role, JoinHandle<Result<(), String>>);

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    logging::init();

    let config_path = cli
        .config
        .map(std::path::PathBuf::from)
        .unwrap_or_else(config::default_config_path);

    let config = match Config::load(&config_path) {
        Ok(config) => {
            info!(config_path = %config_path.display(), "loaded configuration");
            config
        }
        Err(e) if e.is_not_found() => {
            info!("no config file found, using defaults");
            Config::default()
        }
        Err(e) => {
            error!(error = %e, path = %config_path.display(), "invalid configuration file");
            std::process::exit(1);
        }
    };

    let db_path = cli
        .db
        .map(std::path::PathBuf::from)
        .unwrap_or_else(config::default_db_path);

    let store = match SqliteStore::open_and_init(&db_path) {
        Ok(store) => {
            info!(db_path = %db_path.display(), "database initialized");
            Arc::new(store)
        }
        Err(e) => {
            error!(error = %e, db_path = %db_path.display(), "failed to initialize database");
            std::process::exit(1);
        }
    };
    let shared: Arc<dyn StateStore + Send + Sync> = store.clone();
    let bus: Arc<dyn Bus> = Arc::new(LocalBus::default());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut roles: Vec<Role> = Vec::new();
    for role in &config.roles {
        if !roles.contains(role) {
            roles.push(*role);
        }
    }

    let mut tasks: Vec<RoleTask> = Vec::new();
    let mut routes = None;
    for role in &roles {
        match role {
            Role::Feed => {
                let feed = ChangeFeed::new(store.clone(), bus.clone(), config.feed.clone());
                let rx = shutdown_rx.clone();
                // A fatal feed error takes the whole daemon down
                let tx = shutdown_tx.clone();
                tasks.push((
                    Role::Feed,
                    tokio::spawn(async move {
                        feed.run(rx).await.map_err(|e| {
                            let _ = tx.send(true);
                            e.to_string()
                        })
                    }),
                ));
            }
            Role::Orchestrator => {
                let controller =
                    Controller::new(store.clone(), bus.clone(), config.orchestrator.clone());
                let rx = shutdown_rx.clone();
                tasks.push((
                    Role::Orchestrator,
                    tokio::spawn(async move {
                        controller.run(rx).await;
                        Ok(())
                    }),
                ));
            }
            Role::Agent => {
                let runtime = match runtime::build_runtime(&config, shared.clone()) {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        error!(error = %e, kind = %config.runtime.kind, "failed to initialize vm runtime");
                        std::process::exit(1);
                    }
                };
                let agent = match NodeAgent::register(store.clone(), runtime, bus.clone(), &config)
                {
                    Ok(agent) => agent,
                    Err(e) => {
                        error!(error = %e, node = %config.node.name, "failed to register node");
                        std::process::exit(1);
                    }
                };
                routes = Some(agent.routes());

                let rx = shutdown_rx.clone();
                tasks.push((
                    Role::Agent,
                    tokio::spawn(async move {
                        agent.run(rx).await;
                        Ok(())
                    }),
                ));

                let node_range = match config.node.ip_range.parse() {
                    Ok(range) => range,
                    Err(e) => {
                        error!(error = %e, range = %config.node.ip_range, "invalid node range");
                        std::process::exit(1);
                    }
                };
                let metadata_state = Arc::new(MetadataState {
                    store: shared.clone(),
                    node_range,
                });
                let metadata_config = config.clone();
                let rx = shutdown_rx.clone();
                tasks.push((
                    Role::Agent,
                    tokio::spawn(async move {
                        server::run_metadata(&metadata_config, metadata_state, rx)
                            .await
                            .map_err(|e| format!("metadata endpoint: {e}"))
                    }),
                ));
            }
        }
    }

    {
        let tx = shutdown_tx.clone();
        tokio::spawn(async move {
            server::shutdown_signal().await;
            let _ = tx.send(true);
        });
    }

    let state = Arc::new(api::AppState {
        store: shared,
        roles: roles.iter().map(|r| r.to_string()).collect(),
        routes,
    });

    info!(roles = ?state.roles, "keeld starting");

    let mut failed = false;
    if let Err(e) = server::run(&config, state, shutdown_rx).await {
        error!(error = %e, "HTTP API failed");
        failed = true;
    }

    // Roles finish their current unit of work
    let _ = shutdown_tx.send(true);
    for (role, task) in tasks {
        match task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!(role = %role, error = %e, "role failed");
                failed = true;
            }
            Err(e) => {
                error!(role = %role, error = %e, "role task panicked");
                failed = true;
            }
        }
    }

    if failed {
        std::process::exit(1);
    }
    info!("keeld stopped");
}
