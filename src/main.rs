mod aerelay;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(
    name = "aerelay",
    version,
    about = "aerelay - reverse-tunnel relay for hosts behind NAT"
)]
struct Cli {
    /// Path to the config file (.toml/.yaml/.yml). If omitted, uses AERELAY_CONFIG; then aerelay.toml > aerelay.yaml > aerelay.yml from the CWD; then the OS default path (Linux: /etc/aerelay/aerelay.toml; others: user config dir).
    #[arg(long, env = "AERELAY_CONFIG")]
    config: Option<std::path::PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    aerelay::run(cli.config).await
}
