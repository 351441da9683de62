mod burrow;

use clap::{Args, Parser, Subcommand};

use crate::burrow::app::AgentOverrides;

#[derive(Debug, Parser)]
#[command(
    name = "burrow",
    version,
    about = "Burrow - expose local services through a public relay"
)]
struct Cli {
    /// Path to burrow config file (.toml/.yaml/.yml). If omitted, uses BURROW_CONFIG; then auto-detects burrow.toml > burrow.yaml > burrow.yml from CWD; then falls back to the OS default path (Linux: /etc/burrow/burrow.toml; others: user config dir).
    #[arg(long, env = "BURROW_CONFIG", global = true)]
    config: Option<std::path::PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the public relay.
    Relay,
    /// Connect a local service to a relay.
    Agent(AgentArgs),
}

#[derive(Debug, Args)]
struct AgentArgs {
    /// Project name; becomes the public path segment.
    #[arg(long, short)]
    project: Option<String>,
    /// Local service address, e.g. `localhost:3000`.
    #[arg(long, short)]
    local_url: Option<String>,
    /// Relay WebSocket base URL, e.g. `wss://relay.example.com`.
    #[arg(long)]
    relay_url: Option<String>,
    /// http, https, tcp or auto.
    #[arg(long)]
    protocol: Option<String>,
    #[arg(long, short)]
    username: Option<String>,
    #[arg(long, env = "BURROW_PASSWORD", hide_env_values = true)]
    password: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Relay => burrow::app::run_relay(cli.config).await,
        Command::Agent(a) => {
            burrow::app::run_agent(
                cli.config,
                AgentOverrides {
                    relay_url: a.relay_url,
                    project: a.project,
                    local_url: a.local_url,
                    protocol: a.protocol,
                    username: a.username,
                    password: a.password,
                },
            )
            .await
        }
    }
}
