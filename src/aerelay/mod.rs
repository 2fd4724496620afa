pub mod app;
pub mod chat;
pub mod cipher;
pub mod client;
pub mod codec;
pub mod config;
pub mod host;
pub mod logging;
pub mod net;
pub mod pipe;
pub mod protocol;
pub mod server;
pub mod session;

pub async fn run(config_path: Option<std::path::PathBuf>) -> anyhow::Result<()> {
    app::run(config_path).await
}
