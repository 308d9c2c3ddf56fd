//! cograph CLI - sync server and graph tooling for collaborative knowledge graphs.

use std::path::{Path, PathBuf};
use std::process;

use clap::Parser;
use cograph::cli::{Cli, Commands, ConfigCommands, GraphCommands};
use cograph::client::ClientOptions;
use cograph::commands::{self, CommandResult};
use cograph::config::{self, ConfigOverrides, Resolved, ResolvedConfig, resolve_config};
use cograph::models::{Participant, Visibility};
use cograph::storage::Storage;
use cograph::{Error, Result, logging, server};

fn main() {
    let cli = Cli::parse();
    let human = cli.human_readable;

    if let Err(e) = run_command(cli.command, cli.config.as_deref(), human) {
        if human {
            eprintln!("Error: {}", e);
        } else {
            eprintln!("{}", serde_json::json!({ "error": e.to_string() }));
        }
        process::exit(1);
    }
}

fn run_command(command: Commands, config_arg: Option<&Path>, human: bool) -> Result<()> {
    let config_path = config::config_path(config_arg)?;

    match command {
        Commands::Serve {
            host,
            port,
            database,
            agent_url,
            no_layout,
        } => {
            let mut overrides = ConfigOverrides::new();
            if let Some(host) = host {
                overrides = overrides.with_host(host);
            }
            if let Some(port) = port {
                overrides = overrides.with_port(port);
            }
            if let Some(database) = database {
                overrides = overrides.with_database(database);
            }
            if let Some(url) = agent_url {
                overrides = overrides.with_agent_url(url);
            }
            overrides.disable_layout = no_layout;

            let mut resolved = resolve(&config_path, &overrides)?;
            let _guard = init_logging(&resolved)?;
            pick_port(&mut resolved)?;
            runtime()?.block_on(server::start_server(&resolved))
        }

        Commands::Graph { command } => {
            let resolved = resolve(&config_path, &ConfigOverrides::new())?;
            let mut storage = Storage::open(&resolved.database.value)?;
            match command {
                GraphCommands::Create {
                    title,
                    description,
                    creator,
                    public,
                } => {
                    let visibility = if public {
                        Visibility::Public
                    } else {
                        Visibility::Private
                    };
                    let result =
                        commands::graph_create(&mut storage, &title, description, &creator, visibility)?;
                    output(&result, human);
                }
                GraphCommands::List => output(&commands::graph_list(&storage)?, human),
                GraphCommands::Show { id } => output(&commands::graph_show(&storage, &id)?, human),
                GraphCommands::Delete { id } => {
                    output(&commands::graph_delete(&mut storage, &id)?, human)
                }
            }
            Ok(())
        }

        Commands::Layout {
            graph_id,
            dry_run,
            database,
        } => {
            let mut overrides = ConfigOverrides::new();
            if let Some(database) = database {
                overrides = overrides.with_database(database);
            }
            let resolved = resolve(&config_path, &overrides)?;
            let mut storage = Storage::open(&resolved.database.value)?;
            let result = commands::layout(&mut storage, &graph_id, &resolved.layout, dry_run)?;
            output(&result, human);
            Ok(())
        }

        Commands::Watch {
            graph_id,
            url,
            user,
            color,
        } => {
            let resolved = resolve(&config_path, &ConfigOverrides::new())?;
            let _guard = init_logging(&resolved)?;
            let participant = Participant {
                display_name: user.clone(),
                user_id: user,
                color,
            };
            let options = ClientOptions::new(&url, &graph_id, participant);
            runtime()?.block_on(commands::watch(options, human))
        }

        Commands::Config { command } => {
            match command {
                ConfigCommands::Show => {
                    output(&commands::config_show(&config_path, &ConfigOverrides::new())?, human)
                }
                ConfigCommands::Init { force } => {
                    output(&commands::config_init(&config_path, force)?, human)
                }
            }
            Ok(())
        }
    }
}

fn resolve(config_path: &Path, overrides: &ConfigOverrides) -> Result<ResolvedConfig> {
    let file = config::load(config_path)?;
    resolve_config(&file, overrides)
}

fn init_logging(
    resolved: &ResolvedConfig,
) -> Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    let file: Option<PathBuf> = resolved.log_file.as_ref().map(|f| f.value.clone());
    logging::init(
        &resolved.log_level.value,
        resolved.log_format.value,
        file.as_deref(),
    )
}

/// Move to the next free port when the configured one is taken.
fn pick_port(resolved: &mut ResolvedConfig) -> Result<()> {
    let wanted = resolved.port.value;
    let port = server::find_available_port(&resolved.host.value, wanted).ok_or_else(|| {
        Error::Other(format!(
            "No free port found at or above {} on {}",
            wanted, resolved.host.value
        ))
    })?;
    if port != wanted {
        tracing::warn!(wanted, port, "port in use; using next free port");
        resolved.port = Resolved::new(port, resolved.port.source.clone());
    }
    Ok(())
}

fn runtime() -> Result<tokio::runtime::Runtime> {
    Ok(tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?)
}

fn output<T: CommandResult>(result: &T, human: bool) {
    if human {
        println!("{}", result.to_human());
    } else {
        println!("{}", result.to_json());
    }
}
