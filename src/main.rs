mod ferry;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(
    name = "ferry",
    version,
    about = "Ferry - expose local services through NAT via a reverse tunnel"
)]
struct Cli {
    /// Path to the config file (.toml/.yaml/.yml). If omitted, uses FERRY_CONFIG; then auto-detects ferry.toml > ferry.yaml > ferry.yml from CWD; then falls back to the OS default path (Linux: /etc/ferry/ferry.toml; others: user config dir).
    #[arg(long, global = true, env = "FERRY_CONFIG")]
    config: Option<std::path::PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the public tunnel server.
    Server,
    /// Run a tunnel client publishing proxies and visitors.
    Client,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let role = match cli.command {
        Command::Server => ferry::Role::Server,
        Command::Client => ferry::Role::Client,
    };
    ferry::run(role, cli.config).await
}
