pub mod admin;
pub mod app;
pub mod config;
pub mod logging;
pub mod net;
pub mod telemetry;
pub mod tunnel;

pub use app::Role;

pub async fn run(role: Role, config_path: Option<std::path::PathBuf>) -> anyhow::Result<()> {
    app::run(role, config_path).await
}
