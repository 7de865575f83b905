//! Service-discovery publishing: the poller announces its scrape port
//! to the admin endpoint at startup and re-announces on every heartbeat
//! tick. The admin's expire_after is authoritative; the poller keeps no
//! state and simply re-POSTs, so an admin restart mid-cycle heals on
//! the next beat. Publish failures never terminate the poller.

use oxpoll_common::config::HttpsdConfig;
use serde::Serialize;
use std::time::Duration;
use tokio::sync::watch;

#[derive(Debug, Clone, Serialize)]
pub struct SdPayload {
    pub name: String,
    pub port: u16,
    pub tls: bool,
    pub tags: Vec<String>,
}

/// The publish URL derived from the admin block. A wildcard listen
/// address (`:PORT`) publishes as loopback.
pub fn make_publish_url(httpsd: &HttpsdConfig) -> String {
    let scheme = if httpsd.tls.is_some() { "https" } else { "http" };
    let listen = httpsd.listen.trim();
    let host_port = match listen.strip_prefix(':') {
        Some(port) => format!("127.0.0.1:{port}"),
        None => listen.to_string(),
    };
    format!("{scheme}://{host_port}/api/v1/sd")
}

pub struct Publisher {
    url: String,
    payload: SdPayload,
    auth: Option<(String, String)>,
    heart_beat: Duration,
    http: reqwest::Client,
}

impl Publisher {
    pub fn new(httpsd: &HttpsdConfig, payload: SdPayload) -> Self {
        Publisher {
            url: make_publish_url(httpsd),
            payload,
            auth: httpsd
                .auth_basic
                .as_ref()
                .map(|auth| (auth.username.clone(), auth.password.clone())),
            heart_beat: Duration::from_secs(httpsd.heart_beat.max(1)),
            http: reqwest::Client::new(),
        }
    }

    /// Registers at startup, then re-POSTs every heartbeat until
    /// shutdown.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut tick = tokio::time::interval(self.heart_beat);
        loop {
            tokio::select! {
                _ = tick.tick() => self.publish_once().await,
                _ = shutdown.changed() => break,
            }
        }
    }

    async fn publish_once(&self) {
        let mut request = self.http.post(&self.url).json(&self.payload);
        if let Some((username, password)) = &self.auth {
            request = request.basic_auth(username, Some(password));
        }
        match request.send().await {
            Ok(response) if response.status().is_success() => {
                tracing::debug!(url = %self.url, port = self.payload.port, "Published to service discovery");
            }
            Ok(response) => {
                tracing::warn!(url = %self.url, status = %response.status(), "Service discovery rejected publish");
            }
            Err(e) => {
                tracing::warn!(url = %self.url, error = %e, "Service discovery publish failed, will retry");
            }
        }
    }
}
