mod control;
mod daemon;
mod interactive;
mod listeners;

use std::path::PathBuf;

use anyhow::Result;
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use aigent_config::AppConfig;
use control::GoalTier;

#[derive(Debug, Parser)]
#[command(name = "aigent", version, about = "A persistent, memory-centric autonomous agent")]
struct Cli {
    /// Path to the agent's TOML config file.
    #[arg(long, global = true, default_value = "config/default.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the agent loop in the foreground, attached to an interactive REPL.
    Run,
    /// Supervise the agent loop as a background process.
    Daemon {
        #[command(subcommand)]
        command: DaemonCommands,
    },
    /// Print directive, iteration, goals and budget in one summary.
    Status,
    /// Pause planning at the start of the next iteration.
    Pause,
    /// Resume a paused agent.
    Resume,
    /// Inspect or replace the standing directive.
    Directive {
        #[command(subcommand)]
        command: DirectiveCommands,
    },
    /// Inspect or replace goals at a given time horizon.
    Goals {
        #[command(subcommand)]
        command: GoalsCommands,
    },
    /// Inspect or adjust the budget tracker.
    Budget {
        #[command(subcommand)]
        command: BudgetCommands,
    },
    /// List configured LLM providers across all router tiers.
    Providers,
    /// Read the append-only blob audit log.
    Blob {
        #[command(subcommand)]
        command: BlobCommands,
    },
    /// Send a chat message into the agent's inbox.
    Chat {
        message: String,
        #[arg(long, default_value = "cli")]
        channel: String,
    },
    /// Inspect the self-update boot protocol's on-disk markers.
    SelfUpdate {
        #[command(subcommand)]
        command: SelfUpdateCommands,
    },
}

#[derive(Debug, Subcommand)]
enum DaemonCommands {
    Start {
        #[arg(long)]
        force: bool,
    },
    Stop,
    Restart {
        #[arg(long)]
        force: bool,
    },
    Status,
}

#[derive(Debug, Subcommand)]
enum DirectiveCommands {
    Show,
    Set { text: String },
}

#[derive(Debug, Subcommand)]
enum GoalsCommands {
    Show,
    Set {
        #[arg(value_enum)]
        tier: GoalTier,
        items: Vec<String>,
    },
}

#[derive(Debug, Subcommand)]
enum BudgetCommands {
    Show,
    /// Creator-only: replace the monthly USD cap outright.
    OverrideCap { amount: f64 },
    /// Record a provider's out-of-band known balance (e.g. after topping up).
    SetBalance { provider: String, balance: f64 },
}

#[derive(Debug, Subcommand)]
enum BlobCommands {
    /// Show the most recent N events across all date partitions.
    Tail {
        #[arg(default_value_t = 20)]
        n: usize,
    },
    /// Show every event recorded on a given date (YYYY-MM-DD).
    Date { date: String },
}

#[derive(Debug, Subcommand)]
enum SelfUpdateCommands {
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    if std::env::var(daemon::DAEMON_PROCESS_ENV).ok().as_deref() == Some("1") {
        let config = AppConfig::load_from(&cli.config)?;
        return daemon::run_foreground(config, &cli.config, false).await;
    }

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            let config = AppConfig::load_from(&cli.config)?;
            let interactive = std::io::IsTerminal::is_terminal(&std::io::stdin());
            daemon::run_foreground(config, &cli.config, interactive).await
        }
        Commands::Daemon { command } => match command {
            DaemonCommands::Start { force } => daemon::daemon_start(&cli.config, force),
            DaemonCommands::Stop => daemon::daemon_stop(&cli.config),
            DaemonCommands::Restart { force } => {
                daemon::daemon_stop(&cli.config)?;
                daemon::daemon_start(&cli.config, force)
            }
            DaemonCommands::Status => daemon::daemon_status(&cli.config),
        },
        Commands::Status => {
            let config = AppConfig::load_from(&cli.config)?;
            control::status(&config).await
        }
        Commands::Pause => {
            let config = AppConfig::load_from(&cli.config)?;
            control::set_paused(&config, true).await
        }
        Commands::Resume => {
            let config = AppConfig::load_from(&cli.config)?;
            control::set_paused(&config, false).await
        }
        Commands::Directive { command } => {
            let config = AppConfig::load_from(&cli.config)?;
            match command {
                DirectiveCommands::Show => control::directive_show(&config).await,
                DirectiveCommands::Set { text } => control::directive_set(&config, text).await,
            }
        }
        Commands::Goals { command } => {
            let config = AppConfig::load_from(&cli.config)?;
            match command {
                GoalsCommands::Show => control::goals_show(&config).await,
                GoalsCommands::Set { tier, items } => control::goals_set(&config, tier, items).await,
            }
        }
        Commands::Budget { command } => {
            let config = AppConfig::load_from(&cli.config)?;
            match command {
                BudgetCommands::Show => control::budget_show(&config),
                BudgetCommands::OverrideCap { amount } => control::budget_override_cap(&config, amount),
                BudgetCommands::SetBalance { provider, balance } => {
                    control::budget_set_balance(&config, &provider, balance)
                }
            }
        }
        Commands::Providers => {
            let config = AppConfig::load_from(&cli.config)?;
            control::providers_list(&config);
            Ok(())
        }
        Commands::Blob { command } => {
            let config = AppConfig::load_from(&cli.config)?;
            match command {
                BlobCommands::Tail { n } => control::blob_tail(&config, n).await,
                BlobCommands::Date { date } => {
                    let date = NaiveDate::parse_from_str(&date, "%Y-%m-%d")?;
                    control::blob_date(&config, date).await
                }
            }
        }
        Commands::Chat { message, channel } => {
            let config = AppConfig::load_from(&cli.config)?;
            control::chat_send(&config, message, channel).await
        }
        Commands::SelfUpdate { command } => {
            let config = AppConfig::load_from(&cli.config)?;
            match command {
                SelfUpdateCommands::Status => control::self_update_status(&config, &cli.config),
            }
        }
    }
}
