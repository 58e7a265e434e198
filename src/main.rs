mod cli;
mod core;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "cpb", about = "CLIProxyAPI usage and settings bridge", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Output format
    #[arg(short, long, global = true)]
    format: Option<String>,

    /// Shorthand for --format json
    #[arg(short = 'j', long = "json", global = true)]
    json: bool,

    /// Pretty-print JSON output
    #[arg(long, global = true)]
    pretty: bool,

    /// Disable ANSI colors
    #[arg(long, global = true)]
    no_color: bool,

    /// Verbose logging to stderr
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one polling cycle and display usage, settings and health
    Status,
    /// Poll continuously and print every update until Ctrl-C
    Watch,
    /// Print one value from the latest snapshot by dotted path
    Get {
        /// Path such as `settings.debug` or `key_usage[k1].requests`
        path: String,
    },
    /// Write a remote setting, then refresh
    Set {
        /// Setting key (e.g. debug, request_retry)
        key: String,
        /// New value (on/off for toggles, an integer for numbers)
        value: String,
    },
    /// Trigger an action (clear_logs | refresh)
    Press {
        /// Button key
        button: String,
    },
    /// Dump config and coordinator state with secrets redacted
    Diagnostics,
    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Generate default config file
    Init,
    /// Validate config file
    Check {
        /// Also authenticate against the configured server
        #[arg(long)]
        probe: bool,
    },
    /// Print the effective config
    Show,
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("cpb={}", default_level)));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let output_opts = cli::output::OutputOptions {
        format: cli::output::OutputFormat::from_flags(cli.json, cli.format.as_deref()),
        pretty: cli.pretty,
        use_color: cli::output::detect_color(!cli.no_color),
        verbose: cli.verbose,
    };

    match cli.command {
        None | Some(Commands::Status) => cli::commands::status(&output_opts).await?,
        Some(Commands::Watch) => cli::commands::watch(&output_opts).await?,
        Some(Commands::Get { path }) => cli::commands::get(&path, &output_opts).await?,
        Some(Commands::Set { key, value }) => {
            cli::commands::set(&key, &value, &output_opts).await?
        }
        Some(Commands::Press { button }) => cli::commands::press(&button, &output_opts).await?,
        Some(Commands::Diagnostics) => cli::commands::diagnostics(&output_opts).await?,
        Some(Commands::Config { action }) => match action {
            ConfigAction::Init => cli::config_cmd::init(&output_opts)?,
            ConfigAction::Check { probe } => cli::config_cmd::check(probe, &output_opts).await?,
            ConfigAction::Show => cli::config_cmd::show(&output_opts)?,
        },
    }

    Ok(())
}
