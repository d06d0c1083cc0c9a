//! Startup egress diagnostics: one request through the configured proxy to
//! an IP-echo endpoint. Advisory only: a failed or mismatching probe never
//! blocks a session.

use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use url::Url;

use crate::proxy::ProxyRef;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Deserialize)]
struct EchoResponse {
    ip: String,
}

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("probe client rejected proxy configuration: {0}")]
    Proxy(#[source] reqwest::Error),
    #[error("probe client construction failed: {0}")]
    Client(#[source] reqwest::Error),
    #[error("probe request failed: {0}")]
    Request(#[source] reqwest::Error),
    #[error("probe endpoint answered {0}")]
    Status(reqwest::StatusCode),
}

/// Resolve the externally visible IP address through `proxy` (or directly).
pub async fn egress_ip(probe_url: &Url, proxy: Option<&ProxyRef>) -> Result<String, ProbeError> {
    let mut builder = reqwest::Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .timeout(REQUEST_TIMEOUT)
        .no_proxy();
    if let Some(proxy) = proxy {
        let proxy =
            reqwest::Proxy::all(proxy.connect_url().as_str()).map_err(ProbeError::Proxy)?;
        builder = builder.proxy(proxy);
    }
    let client = builder.build().map_err(ProbeError::Client)?;

    let response = client
        .get(probe_url.clone())
        .send()
        .await
        .map_err(ProbeError::Request)?;
    if !response.status().is_success() {
        return Err(ProbeError::Status(response.status()));
    }
    let body = response
        .json::<EchoResponse>()
        .await
        .map_err(ProbeError::Request)?;
    Ok(body.ip)
}

/// Whether the observed egress address plausibly belongs to the proxy.
/// Substring match on the declared host; many legitimate proxies egress
/// from a different address, so a mismatch is only ever a warning.
pub fn matches_proxy_host(ip: &str, proxy: &ProxyRef) -> bool {
    ip.contains(&proxy.host)
}
