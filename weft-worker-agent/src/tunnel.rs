// Copyright 2024-2025 Weft Compute
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use crate::config::{TunnelConfig, TunnelMode};
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tracing::{info, warn};
use url::Url;

#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    #[error("Tunnel configuration error: {0}")]
    Config(String),
    #[error("Failed to start tunnel process: {0}")]
    Spawn(String),
    #[error("Tunnel did not produce a public URL within the deadline")]
    UrlCaptureTimeout,
}

/// A running (or configured-away) tunnel. Dropping the handle leaves the
/// child to be killed on process exit via `kill_on_drop`.
pub struct TunnelHandle {
    pub public_url: Url,
    child: Option<Child>,
}

impl TunnelHandle {
    pub async fn shutdown(mut self) {
        if let Some(mut child) = self.child.take() {
            let _ = child.kill().await;
        }
    }
}

/// Brings up the outbound tunnel and resolves the public URL the agent
/// will advertise. The tunnel itself is an opaque transport; the agent
/// only needs the URL (and keeps the child alive).
pub async fn establish(config: &TunnelConfig) -> Result<TunnelHandle, TunnelError> {
    match config.mode {
        TunnelMode::None => {
            let public_url = config.advertised_url.clone().ok_or_else(|| {
                TunnelError::Config("tunnel mode 'none' requires advertised_url".to_string())
            })?;
            info!(url = %public_url, "Tunnel disabled; advertising the local URL");
            Ok(TunnelHandle {
                public_url,
                child: None,
            })
        }
        TunnelMode::Named => {
            let public_url = config.advertised_url.clone().ok_or_else(|| {
                TunnelError::Config("tunnel mode 'named' requires advertised_url".to_string())
            })?;
            let child = spawn_tunnel(config)?;
            info!(url = %public_url, "Named tunnel started");
            Ok(TunnelHandle {
                public_url,
                child: Some(child),
            })
        }
        TunnelMode::Ephemeral => {
            let mut child = spawn_tunnel(config)?;
            let public_url = capture_url(&mut child, config).await?;
            info!(url = %public_url, "Ephemeral tunnel started");
            Ok(TunnelHandle {
                public_url,
                child: Some(child),
            })
        }
    }
}

fn spawn_tunnel(config: &TunnelConfig) -> Result<Child, TunnelError> {
    let (program, args) = config
        .command
        .split_first()
        .ok_or_else(|| TunnelError::Config("tunnel command is empty".to_string()))?;
    Command::new(program)
        .args(args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|err| TunnelError::Spawn(err.to_string()))
}

/// Scans the tunnel process output for the first https URL it prints.
/// Ephemeral tunnels (cloudflared and friends) announce their hostname
/// this way.
async fn capture_url(child: &mut Child, config: &TunnelConfig) -> Result<Url, TunnelError> {
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| TunnelError::Spawn("tunnel stdout not captured".to_string()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| TunnelError::Spawn("tunnel stderr not captured".to_string()))?;

    let scan = async {
        let mut stdout_lines = BufReader::new(stdout).lines();
        let mut stderr_lines = BufReader::new(stderr).lines();
        loop {
            let line = tokio::select! {
                line = stdout_lines.next_line() => line,
                line = stderr_lines.next_line() => line,
            };
            match line {
                Ok(Some(line)) => {
                    if let Some(url) = extract_https_url(&line) {
                        return Ok(url);
                    }
                }
                Ok(None) => {
                    warn!("Tunnel process closed its output before printing a URL");
                    return Err(TunnelError::UrlCaptureTimeout);
                }
                Err(err) => {
                    warn!(error = %err, "Failed reading tunnel output");
                    return Err(TunnelError::UrlCaptureTimeout);
                }
            }
        }
    };

    tokio::time::timeout(config.url_capture_timeout, scan)
        .await
        .map_err(|_| TunnelError::UrlCaptureTimeout)?
}

fn extract_https_url(line: &str) -> Option<Url> {
    let start = line.find("https://")?;
    let candidate: String = line[start..]
        .chars()
        .take_while(|c| !c.is_whitespace() && *c != '"' && *c != '|')
        .collect();
    Url::parse(&candidate).ok().filter(|url| url.host_str().is_some())
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;

    #[test]
    fn extracts_tunnel_urls_from_log_lines() {
        let line = "2025-01-01T00:00:00Z INF |  https://lucky-otter.trycloudflare.com  |";
        let url = extract_https_url(line).expect("URL must be found");
        assert_eq!(url.host_str(), Some("lucky-otter.trycloudflare.com"));

        assert!(extract_https_url("no url in this line").is_none());
    }

    #[test]
    async fn none_mode_requires_an_advertised_url() {
        let config = TunnelConfig {
            mode: TunnelMode::None,
            command: vec![],
            advertised_url: None,
            url_capture_timeout: std::time::Duration::from_secs(1),
        };
        assert!(matches!(
            establish(&config).await,
            Err(TunnelError::Config(_))
        ));
    }
}
