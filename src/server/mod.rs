pub mod health;
pub mod plugin;
pub mod protocol;
pub mod socket;

pub use health::HealthState;
pub use plugin::PluginState;
pub use socket::PluginSocket;

use anyhow::Context;
use tokio::net::UnixListener;
use tokio_util::sync::CancellationToken;

/// Serves the volume-plugin protocol until `shutdown` fires.
pub async fn serve_plugin(
    listener: UnixListener,
    state: PluginState,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    axum::serve(listener, plugin::router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("Plugin server error")
}
