use std::net::SocketAddr;
use std::time::Duration;

use keyrelay::keys::credentials_from_env;
use keyrelay::policy::StatusPolicy;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

const DEFAULT_PORT: u16 = 10_000;

fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok()?.trim().parse::<u64>().ok()
}

fn env_usize(name: &str) -> Option<usize> {
    std::env::var(name).ok()?.trim().parse::<usize>().ok()
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_status_list(name: &str, raw: &str) -> anyhow::Result<Vec<u16>> {
    let mut out = Vec::new();
    for token in raw.split(|c: char| c == ',' || c.is_whitespace()) {
        if token.is_empty() {
            continue;
        }
        let status = token
            .parse::<u16>()
            .ok()
            .filter(|status| (100..=599).contains(status))
            .ok_or_else(|| anyhow::anyhow!("invalid HTTP status in {name}: {token:?}"))?;
        out.push(status);
    }
    Ok(out)
}

fn config_from_env() -> anyhow::Result<keyrelay::AppConfig> {
    let mut cfg = keyrelay::AppConfig::default();

    if let Some(value) = env_usize("MAX_REQUEST_BYTES") {
        cfg.max_request_bytes = value;
    }
    if let Some(url) = env_string("UPSTREAM_BASE_URL") {
        cfg.upstream_base_url = url;
    }
    if let Some(ms) = env_u64("UPSTREAM_CONNECT_TIMEOUT_MS") {
        cfg.upstream_connect_timeout = Duration::from_millis(ms);
    }
    if let Some(ms) = env_u64("UPSTREAM_TIMEOUT_MS") {
        cfg.upstream_timeout = Duration::from_millis(ms);
    }
    if let Some(raw) = env_string("RETRY_STATUSES") {
        cfg.status_policy = StatusPolicy {
            retry_statuses: parse_status_list("RETRY_STATUSES", &raw)?,
        };
    }

    Ok(cfg)
}

fn listen_addr() -> anyhow::Result<SocketAddr> {
    if let Some(addr) = env_string("LISTEN_ADDR") {
        return Ok(addr.parse()?);
    }
    let port = match env_string("PORT") {
        Some(raw) => raw
            .parse::<u16>()
            .map_err(|e| anyhow::anyhow!("invalid PORT {raw:?}: {e}"))?,
        None => DEFAULT_PORT,
    };
    Ok(SocketAddr::from(([0, 0, 0, 0], port)))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let listen = listen_addr()?;
    let config = config_from_env()?;
    let vars = std::env::vars_os()
        .filter_map(|(name, value)| Some((name.into_string().ok()?, value.into_string().ok()?)));
    let credentials = credentials_from_env(vars);
    if credentials.is_empty() {
        tracing::warn!("no API_KEY_<n> variables set; /chat will answer 500");
    } else {
        let keys: Vec<&str> = credentials.iter().map(|c| c.id()).collect();
        tracing::info!(?keys, upstream = %config.upstream_base_url, "loaded API keys");
    }

    let app = keyrelay::app(keyrelay::AppState::new(config, credentials));

    let listener = TcpListener::bind(listen).await?;
    tracing::info!(%listen, "listening");
    axum::serve(listener, app).await?;

    Ok(())
}
