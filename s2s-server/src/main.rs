use anyhow::Result;
use tracing_subscriber::EnvFilter;

use s2s_server::config::ServerConfig;
use s2s_server::server::Server;

#[tokio::main]
async fn main() -> Result<()> {
    s2s_server::tls::install_crypto_provider();
    // JSON logs in production (S2S_LOG_JSON=1), human-readable otherwise
    let json_logs = std::env::var("S2S_LOG_JSON").unwrap_or_default() == "1";
    let filter = EnvFilter::from_default_env().add_directive("s2s_server=info".parse()?);
    if json_logs {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .init();
    }

    let config = ServerConfig::load()?;
    tracing::info!("Starting S2S server on {}", config.listen_addr);
    tracing::info!("Serving domains: {}", config.domains.join(", "));
    if config.tls_enabled() {
        tracing::info!("STARTTLS enabled");
    } else if config.tls_required {
        tracing::warn!("TLS is required but no certificate is configured");
    }
    if config.dialback_workaround {
        tracing::info!("Dialback workaround enabled for trusted certificates");
    }

    Server::new(config).run().await
}
