//! Daybook CLI
//!
//! Command-line interface for Daybook - a local-first diary, food log and
//! ideas list.

use std::fs::OpenOptions;
use std::sync::Mutex;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use daybook_core::{
    Config, Diary, DiaryEntry, DiaryPatch, Food, FoodEntry, FoodPatch, Idea, IdeaPatch, Ideas,
    Session, SyncClient,
};

mod commands;
mod editor;
mod output;

use output::{Output, OutputFormat};

#[derive(Parser)]
#[command(name = "daybook")]
#[command(about = "Daybook - Local-first diary, food log and ideas")]
#[command(version)]
#[command(propagate_version = true)]
struct Cli {
    /// Output as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Quiet mode - minimal output
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Store the credential used to sync
    Login {
        /// Bearer token
        #[arg(long)]
        token: String,
        /// Account id, used to notify your other devices
        #[arg(long)]
        user_id: Option<String>,
    },
    /// Forget the stored credential
    Logout,
    /// Diary entries
    Diary {
        #[command(subcommand)]
        command: DiaryCommands,
    },
    /// Food log
    Food {
        #[command(subcommand)]
        command: FoodCommands,
    },
    /// Ideas
    Ideas {
        #[command(subcommand)]
        command: IdeaCommands,
    },
    /// Pull and push every domain once
    Sync,
    /// Stay connected and pull whenever the server reports changes
    Watch,
    /// Show status (account, sync, pending changes)
    Status,
    /// Show or set configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand)]
enum DiaryCommands {
    /// Write a diary entry
    Add {
        /// Entry title
        title: String,
        /// Entry body (opens editor if not provided and stdin is a terminal)
        #[arg(short, long)]
        body: Option<String>,
    },
    /// List diary entries
    #[command(alias = "ls")]
    List,
    /// Show a diary entry
    Show {
        /// Entry ID (full or prefix)
        id: String,
    },
    /// Change a diary entry
    Edit {
        /// Entry ID (full or prefix)
        id: String,
        #[arg(short = 'T', long)]
        title: Option<String>,
        #[arg(short, long)]
        body: Option<String>,
    },
    /// Delete a diary entry
    #[command(alias = "delete")]
    Rm {
        /// Entry ID (full or prefix)
        id: String,
    },
}

#[derive(Subcommand)]
enum FoodCommands {
    /// Log something eaten or drunk
    Add {
        /// What it was
        name: String,
        /// What it cost
        #[arg(short, long)]
        price: Option<f64>,
    },
    /// List food entries
    #[command(alias = "ls")]
    List,
    /// Show a food entry
    Show {
        /// Entry ID (full or prefix)
        id: String,
    },
    /// Change a food entry
    Edit {
        /// Entry ID (full or prefix)
        id: String,
        #[arg(short, long)]
        name: Option<String>,
        #[arg(short, long)]
        price: Option<f64>,
    },
    /// Delete a food entry
    #[command(alias = "delete")]
    Rm {
        /// Entry ID (full or prefix)
        id: String,
    },
}

#[derive(Subcommand)]
enum IdeaCommands {
    /// Note an idea
    Add {
        /// Idea title
        title: String,
        #[arg(short, long)]
        description: Option<String>,
    },
    /// List ideas
    #[command(alias = "ls")]
    List,
    /// Show an idea
    Show {
        /// Idea ID (full or prefix)
        id: String,
    },
    /// Change an idea
    Edit {
        /// Idea ID (full or prefix)
        id: String,
        #[arg(short = 'T', long)]
        title: Option<String>,
        /// New description; pass "" to clear it
        #[arg(short, long)]
        description: Option<String>,
    },
    /// Delete an idea
    #[command(alias = "delete")]
    Rm {
        /// Idea ID (full or prefix)
        id: String,
    },
}

#[derive(Subcommand, Clone)]
enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Set a configuration value
    Set {
        /// Configuration key (server_url, sync_enabled, pull_warmup_ms, ...)
        key: String,
        /// Configuration value
        value: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let output = Output::new(OutputFormat::from_flags(cli.json, cli.quiet));

    // Commands that don't need a session
    if let Commands::Config { command } = &cli.command {
        return handle_config_command(command.clone(), &output);
    }

    let mut config = Config::load().context("Failed to load configuration")?;
    // Reads pull explicitly before running
    config.pull_on_ready = false;
    init_logging(&config);

    let session = Session::open_with_config(config)?;

    let is_write = matches!(
        &cli.command,
        Commands::Diary {
            command: DiaryCommands::Add { .. } | DiaryCommands::Edit { .. } | DiaryCommands::Rm { .. }
        } | Commands::Food {
            command: FoodCommands::Add { .. } | FoodCommands::Edit { .. } | FoodCommands::Rm { .. }
        } | Commands::Ideas {
            command: IdeaCommands::Add { .. } | IdeaCommands::Edit { .. } | IdeaCommands::Rm { .. }
        }
    );
    let is_read = matches!(
        &cli.command,
        Commands::Diary { .. } | Commands::Food { .. } | Commands::Ideas { .. }
    ) && !is_write;

    // Sync before read commands (to get latest data)
    if is_read {
        commands::sync::refresh(&session, &output).await;
    }

    let result = match cli.command {
        Commands::Config { .. } => unreachable!(), // Handled above
        Commands::Login { token, user_id } => {
            commands::auth::login(&session, token, user_id, &output)
        }
        Commands::Logout => commands::auth::logout(&session, &output),
        Commands::Diary { command } => handle_diary_command(command, session.diary(), &output),
        Commands::Food { command } => handle_food_command(command, session.food(), &output),
        Commands::Ideas { command } => handle_idea_command(command, session.ideas(), &output),
        Commands::Sync => commands::sync::sync(&session, &output).await,
        Commands::Watch => commands::watch::watch(&session, &output).await,
        Commands::Status => commands::status::show(&session, &output),
    };

    // Push changes before exit
    if is_write && result.is_ok() {
        commands::sync::flush_pending(&session, &output).await;
    }

    session.shutdown();
    result
}

fn handle_diary_command(
    command: DiaryCommands,
    client: &SyncClient<Diary>,
    output: &Output,
) -> Result<()> {
    use commands::entries;

    match command {
        DiaryCommands::Add { title, body } => {
            let body = match body {
                Some(body) => body,
                None if atty::is(atty::Stream::Stdin) && output.should_prompt() => {
                    editor::compose("", "Write your entry above. Lines starting with '# daybook:' are ignored.")?
                }
                None => String::new(),
            };
            entries::add(client, DiaryEntry { title, body }, output)
        }
        DiaryCommands::List => entries::list(client, output),
        DiaryCommands::Show { id } => entries::show(client, &id, output),
        DiaryCommands::Edit { id, title, body } => {
            if title.is_none() && body.is_none() {
                bail!("Nothing to change. Pass --title and/or --body.");
            }
            entries::edit(client, &id, DiaryPatch { title, body }, output)
        }
        DiaryCommands::Rm { id } => entries::remove(client, &id, output),
    }
}

fn handle_food_command(
    command: FoodCommands,
    client: &SyncClient<Food>,
    output: &Output,
) -> Result<()> {
    use commands::entries;

    match command {
        FoodCommands::Add { name, price } => entries::add(client, FoodEntry { name, price }, output),
        FoodCommands::List => entries::list(client, output),
        FoodCommands::Show { id } => entries::show(client, &id, output),
        FoodCommands::Edit { id, name, price } => {
            if name.is_none() && price.is_none() {
                bail!("Nothing to change. Pass --name and/or --price.");
            }
            entries::edit(client, &id, FoodPatch { name, price }, output)
        }
        FoodCommands::Rm { id } => entries::remove(client, &id, output),
    }
}

fn handle_idea_command(
    command: IdeaCommands,
    client: &SyncClient<Ideas>,
    output: &Output,
) -> Result<()> {
    use commands::entries;

    match command {
        IdeaCommands::Add { title, description } => {
            let description = description.filter(|d| !d.is_empty());
            entries::add(client, Idea { title, description }, output)
        }
        IdeaCommands::List => entries::list(client, output),
        IdeaCommands::Show { id } => entries::show(client, &id, output),
        IdeaCommands::Edit {
            id,
            title,
            description,
        } => {
            if title.is_none() && description.is_none() {
                bail!("Nothing to change. Pass --title and/or --description.");
            }
            entries::edit(client, &id, IdeaPatch { title, description }, output)
        }
        IdeaCommands::Rm { id } => entries::remove(client, &id, output),
    }
}

fn handle_config_command(command: Option<ConfigCommands>, output: &Output) -> Result<()> {
    match command {
        Some(ConfigCommands::Show) | None => commands::config::show(output),
        Some(ConfigCommands::Set { key, value }) => commands::config::set(key, value, output),
    }
}

/// Initialize logging
///
/// DAYBOOK_LOG sets the level for both crates (default: warn). Logs go to
/// config.log_file when set, otherwise stderr.
fn init_logging(config: &Config) {
    let log_level = std::env::var("DAYBOOK_LOG").unwrap_or_else(|_| "warn".to_string());
    let env_filter = EnvFilter::try_new(format!(
        "daybook_core={},daybook_cli={}",
        log_level, log_level
    ))
    .unwrap_or_else(|_| EnvFilter::new("warn"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false);

    // Ignore error if already initialized
    match &config.log_file {
        Some(path) => match OpenOptions::new().create(true).append(true).open(path) {
            Ok(file) => {
                let _ = builder.with_ansi(false).with_writer(Mutex::new(file)).try_init();
            }
            Err(e) => {
                eprintln!("Warning: Could not open log file {:?}: {}", path, e);
                let _ = builder.with_writer(std::io::stderr).try_init();
            }
        },
        None => {
            let _ = builder.with_writer(std::io::stderr).try_init();
        }
    }
}
