//! Fans out one session per proxy (or a single direct session), each on its
//! own task. A failing session only ever takes itself down; its reconnect
//! loop is the sole retry mechanism.

use std::sync::Arc;

use futures_util::future;
use tracing::{info, warn};

use crate::config::Config;
use crate::identity::Identity;
use crate::jitter::{self, STARTUP_STAGGER_MS};
use crate::probe;
use crate::proxy::ProxyRef;
use crate::session::Session;

pub struct Supervisor {
    identity: Arc<Identity>,
    proxies: Vec<ProxyRef>,
    config: Arc<Config>,
}

impl Supervisor {
    pub fn new(identity: Identity, proxies: Vec<ProxyRef>, config: Config) -> Self {
        Self {
            identity: Arc::new(identity),
            proxies,
            config: Arc::new(config),
        }
    }

    /// One session per proxy; exactly one direct session when the list is
    /// empty.
    fn session_plan(&self) -> Vec<Option<ProxyRef>> {
        if self.proxies.is_empty() {
            vec![None]
        } else {
            self.proxies.iter().cloned().map(Some).collect()
        }
    }

    /// Start every planned session and park until externally interrupted.
    pub async fn run(self) {
        let plan = self.session_plan();
        info!(
            user = %self.identity.user_id,
            sessions = plan.len(),
            "starting sessions"
        );

        let mut handles = Vec::with_capacity(plan.len());
        for proxy in plan {
            let identity = Arc::clone(&self.identity);
            let config = Arc::clone(&self.config);
            handles.push(tokio::spawn(async move {
                if proxy.is_some() {
                    jitter::stagger(STARTUP_STAGGER_MS).await;
                }
                startup_probe(&config, proxy.as_ref()).await;
                Session::new(identity, proxy, config).run().await;
            }));
        }

        // Sessions reconnect forever, so this resolves only when the
        // process is interrupted.
        let _ = future::join_all(handles).await;
    }
}

/// Best-effort egress diagnostic, run once before a session's first
/// connect. Never retried here and never blocking: whatever the outcome,
/// the session proceeds to its own connect loop.
async fn startup_probe(config: &Config, proxy: Option<&ProxyRef>) {
    match probe::egress_ip(&config.probe_url, proxy).await {
        Ok(ip) => {
            info!(%ip, "egress address resolved");
            if let Some(proxy) = proxy {
                if !probe::matches_proxy_host(&ip, proxy) {
                    warn!(
                        %proxy,
                        %ip,
                        "egress address does not match proxy host; proxy may not be tunneling"
                    );
                }
            }
        }
        Err(err) => {
            warn!(error = %err, "egress probe failed; continuing with connection attempt");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn supervisor_with(proxies: Vec<ProxyRef>) -> Supervisor {
        let identity = Identity::new("abc123", Some("agent".to_string())).unwrap();
        Supervisor::new(identity, proxies, Config::default())
    }

    #[test]
    fn empty_proxy_set_yields_one_direct_session() {
        let plan = supervisor_with(Vec::new()).session_plan();
        assert_eq!(plan, vec![None]);
    }

    #[test]
    fn each_proxy_yields_its_own_session() {
        let proxies: Vec<ProxyRef> = [
            "http://127.0.0.1:3128",
            "socks5://127.0.0.1:1080",
            "https://127.0.0.1:3129",
        ]
        .iter()
        .map(|entry| entry.parse().unwrap())
        .collect();
        let plan = supervisor_with(proxies.clone()).session_plan();
        assert_eq!(plan.len(), 3);
        for (planned, proxy) in plan.iter().zip(&proxies) {
            assert_eq!(planned.as_ref(), Some(proxy));
        }
    }
}
