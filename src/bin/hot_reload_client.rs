//! Editor-side client running against a local data directory. Connects to a
//! hot reload server and installs each pushed plugin under `<DATA_DIR>/plugins`.

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;

use hot_reload_lib::client::DEFAULT_SERVER_URL;
use hot_reload_lib::{Host, Installer, SocketClient};

#[derive(Debug, Parser)]
#[command(name = "hot-reload-client", version, about)]
struct Args {
    /// Server URL.
    #[arg(long, default_value = DEFAULT_SERVER_URL, env = "HOT_RELOAD_URL")]
    url: String,

    /// Host data directory (plugins and cache live under it).
    #[arg(long)]
    data_dir: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    hot_reload_lib::init_tracing();
    let args = Args::parse();

    tokio::fs::create_dir_all(&args.data_dir)
        .await
        .with_context(|| format!("could not create {}", args.data_dir.display()))?;

    let client = SocketClient::new(Installer::new(Host::local(&args.data_dir)));
    client.connect(&args.url).await;
    if !client.is_connected() {
        anyhow::bail!("not connected to {}", args.url);
    }

    tokio::signal::ctrl_c().await?;
    client.disconnect();
    Ok(())
}
