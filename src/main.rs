use std::path::{Path, PathBuf};

use anyhow::{Result, bail};
use clap::{Parser, Subcommand};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

mod adapter;
mod api;
mod backlog;
mod config;
mod error;
mod media;
mod monitor;
mod queue;
mod scrobbler;
mod source;
mod supervisor;
mod timer;
mod trakt;
mod transition;

use crate::adapter::adapter_kinds;
use crate::backlog::{Backlog, BacklogStore, ClearOutcome};
use crate::config::{
    Config, default_config_path, default_data_dir, load_config, save_config, set_credentials,
};
use crate::trakt::TraktClient;

#[derive(Parser)]
#[command(
    name = "trakt-scrobbler",
    version,
    about = "Scrobble what your media players are playing to trakt.tv"
)]
struct Cli {
    #[arg(long, value_name = "PATH", global = true)]
    config_path: Option<PathBuf>,
    #[arg(long, value_name = "PATH", global = true, help = "Directory for backlog and caches")]
    data_dir: Option<PathBuf>,
    #[arg(long, global = true, help = "Log filter, e.g. debug or trakt_scrobbler=trace")]
    log_level: Option<String>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Monitor the configured players and scrobble until they all stop.
    Run,
    Backlog {
        #[command(subcommand)]
        command: BacklogCommand,
    },
    Auth {
        #[command(subcommand)]
        command: AuthCommand,
    },
    /// List adapter kinds and configured players.
    Players,
}

#[derive(Subcommand)]
enum BacklogCommand {
    /// Show watches waiting to be synced.
    List,
    /// Sync the backlog to trakt now.
    Clear,
    /// Drop the backlog without syncing.
    Purge,
}

#[derive(Subcommand)]
enum AuthCommand {
    SetToken {
        #[arg(long, help = "Trakt API client id")]
        client_id: String,
        #[arg(long, help = "OAuth access token")]
        token: Option<String>,
    },
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.log_level.as_deref());
    if let Err(err) = run(cli) {
        eprintln!("{err:#}");
        std::process::exit(1);
    }
}

fn init_tracing(level: Option<&str>) {
    let filter = level
        .and_then(|level| EnvFilter::try_new(level).ok())
        .or_else(|| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn run(cli: Cli) -> Result<()> {
    let config_path = cli.config_path.unwrap_or_else(default_config_path);
    let data_dir = cli.data_dir.unwrap_or_else(default_data_dir);
    match cli.command {
        Commands::Run => {
            let config = load_config(&config_path)?;
            supervisor::run(&config, &data_dir)?;
        }
        Commands::Backlog { command } => handle_backlog(command, &config_path, &data_dir)?,
        Commands::Auth { command } => match command {
            AuthCommand::SetToken { client_id, token } => {
                let mut config = load_config(&config_path)?;
                let token = match token {
                    Some(value) => value,
                    None => prompt_token()?,
                };
                set_credentials(&mut config, &client_id, &token);
                save_config(&config, &config_path)?;
                println!("Saved trakt credentials in {}", config_path.display());
            }
        },
        Commands::Players => {
            let config = load_config(&config_path)?;
            list_players(&config);
        }
    }
    Ok(())
}

fn handle_backlog(command: BacklogCommand, config_path: &Path, data_dir: &Path) -> Result<()> {
    let store = BacklogStore::open(data_dir)?;
    match command {
        BacklogCommand::List => {
            let backlog = store.read()?;
            if backlog.is_empty() {
                println!("Backlog is empty.");
            } else {
                println!("Backlog at {}:", store.path().display());
                print_backlog(&backlog);
            }
            let unknown = store.unknown_items()?;
            if !unknown.is_empty() {
                println!("{} items could not be matched on trakt.", unknown.len());
            }
        }
        BacklogCommand::Clear => {
            let config = load_config(config_path)?;
            let api = TraktClient::new(&config.trakt, data_dir)?;
            match store.clear(&api)? {
                ClearOutcome::Empty => println!("Backlog is empty."),
                ClearOutcome::Synced(sync) => {
                    println!("Added {} items to history.", sync.added_total());
                    if sync.not_found_total() > 0 {
                        println!("{} items were not found on trakt.", sync.not_found_total());
                    }
                    if !sync.invalid.is_empty() {
                        println!(
                            "Moved {} unknown items to {}.",
                            sync.invalid.len(),
                            data_dir.join("unknown_items.json").display()
                        );
                    }
                }
                ClearOutcome::Failed(err) => bail!("Failed to clear backlog: {err}"),
            }
        }
        BacklogCommand::Purge => {
            let purged = store.purge()?;
            println!("Purged {} items from the backlog.", purged.len());
        }
    }
    Ok(())
}

fn print_backlog(backlog: &Backlog) {
    if !backlog.movies.is_empty() {
        println!("Movies:");
        for entry in backlog.movies.values() {
            let media = &entry.media_info;
            println!(
                "  {}\t{:.2}%\t{}",
                display_title(&media.title, media.year),
                entry.watch.progress,
                entry.watch.updated_at.format("%Y-%m-%d %H:%M")
            );
        }
    }
    if backlog.shows.values().any(|show| show.episode_count() > 0) {
        println!("Episodes:");
        for show in backlog.shows.values() {
            for (season, episodes) in &show.seasons {
                for (episode, watch) in episodes {
                    println!(
                        "  {} S{season:02}E{episode:02}\t{:.2}%\t{}",
                        show.media_info.title,
                        watch.progress,
                        watch.updated_at.format("%Y-%m-%d %H:%M")
                    );
                }
            }
        }
    }
}

fn display_title(title: &str, year: Option<i32>) -> String {
    match year {
        Some(year) => format!("{title} ({year})"),
        None => title.to_string(),
    }
}

fn list_players(config: &Config) {
    println!("Adapters: {}", adapter_kinds().collect::<Vec<_>>().join(", "));
    if config.players.entries.is_empty() {
        println!("No players configured.");
        return;
    }
    for (name, player) in &config.players.entries {
        let monitored = if config.players.monitored.contains(name) {
            "monitored"
        } else {
            "idle"
        };
        println!(
            "{name}\t{}\t{}\t{monitored}",
            player.adapter,
            player.url.as_deref().unwrap_or("-")
        );
    }
}

fn prompt_token() -> Result<String> {
    let token = rpassword::prompt_password("Access token: ")?;
    if token.trim().is_empty() {
        bail!("Access token cannot be empty.");
    }
    Ok(token.trim().to_string())
}
