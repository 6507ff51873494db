use anyhow::{bail, Result};
use std::time::Duration;

const DUCK_DNS_UPDATE_URL: &str = "https://www.duckdns.org/update";
const TIMEOUT: Duration = Duration::from_secs(10);

/// Tells DuckDNS the current public address of this host.
///
/// See <https://www.duckdns.org/install.jsp>.
pub async fn ping_duckdns(site: &str, token: &str) -> Result<()> {
    ping(DUCK_DNS_UPDATE_URL, site, token).await
}

async fn ping(endpoint: &str, site: &str, token: &str) -> Result<()> {
    let client = reqwest::Client::builder().timeout(TIMEOUT).build()?;
    let res = client
        .get(endpoint)
        .query(&[("domains", site), ("token", token)])
        .send()
        .await?;
    let status = res.status();
    if !(status.is_success() || status.is_redirection()) {
        bail!("unexpected status code {}", status.as_u16());
    }
    Ok(())
}
