//! Callback host discovery.
//!
//! Workers reach the gateway at `<advertised host>:<port>`. The host is the
//! configured one when set, otherwise the machine hostname. Either way it
//! must resolve before the gateway starts publishing it.

use anyhow::Context;
use tracing::info;

const HOSTNAME_FILE: &str = "/etc/hostname";

/// Returns the host name embedded in callback URLs.
///
/// # Errors
///
/// Fails when no hostname can be determined or the chosen name does not
/// resolve.
pub async fn advertised_host(configured: Option<&str>) -> anyhow::Result<String> {
    let host = match configured.map(str::trim).filter(|h| !h.is_empty()) {
        Some(host) => host.to_string(),
        None => machine_hostname().await?,
    };
    ensure_resolvable(&host).await?;
    info!(host, "Advertising callback host");
    Ok(host)
}

async fn machine_hostname() -> anyhow::Result<String> {
    if let Ok(name) = std::env::var("HOSTNAME") {
        let name = name.trim();
        if !name.is_empty() {
            return Ok(name.to_string());
        }
    }
    let contents = tokio::fs::read_to_string(HOSTNAME_FILE)
        .await
        .with_context(|| format!("could not read {HOSTNAME_FILE}; set ADVERTISE_HOST"))?;
    let name = contents.trim();
    anyhow::ensure!(!name.is_empty(), "{HOSTNAME_FILE} is empty; set ADVERTISE_HOST");
    Ok(name.to_string())
}

/// Checks that `host` resolves to at least one address.
///
/// # Errors
///
/// Fails if the lookup errors or returns nothing.
pub async fn ensure_resolvable(host: &str) -> anyhow::Result<()> {
    let mut addrs = tokio::net::lookup_host((host, 0))
        .await
        .with_context(|| format!("advertised host {host} does not resolve"))?;
    anyhow::ensure!(
        addrs.next().is_some(),
        "advertised host {host} resolved to no addresses"
    );
    Ok(())
}
