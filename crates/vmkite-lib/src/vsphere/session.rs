//! Authenticated vSphere session with keepalive
//!
//! This module provides a session that:
//! - Logs in once and fails fast on bad endpoints or credentials
//! - Checks the server clock on a fixed interval
//! - Logs in again when the check reports an expired session
//! - Caches the default datacenter and a finder scoped to it

use super::{ControlPlane, Datacenter, Fault, Finder, Login, VsphereError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, OnceCell, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use url::Url;

/// Endpoint and credentials for a vSphere login
#[derive(Clone, Serialize, Deserialize)]
pub struct ConnectionParams {
    pub host: String,
    pub user: String,
    pub password: String,
    /// Skip TLS certificate verification
    #[serde(default)]
    pub insecure: bool,
}

impl fmt::Debug for ConnectionParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionParams")
            .field("host", &self.host)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("insecure", &self.insecure)
            .finish()
    }
}

impl ConnectionParams {
    /// SDK endpoint, `https://{host}/sdk`. A host given with a scheme,
    /// e.g. `http://127.0.0.1:8989`, keeps it.
    pub fn sdk_url(&self) -> Result<Url, url::ParseError> {
        if self.host.contains("://") {
            Url::parse(&format!("{}/sdk", self.host.trim_end_matches('/')))
        } else {
            Url::parse(&format!("https://{}/sdk", self.host))
        }
    }

    fn login(&self) -> Result<Login, url::ParseError> {
        Ok(Login {
            url: self.sdk_url()?,
            user: self.user.clone(),
            password: self.password.clone(),
            insecure: self.insecure,
        })
    }
}

/// Configuration for the session keepalive
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Interval between liveness checks
    pub keepalive_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            keepalive_interval: Duration::from_secs(30),
        }
    }
}

/// Authentication state as seen by the keepalive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Authenticated,
    /// The session expired and logging in again failed; calls will surface
    /// their own errors until a later check succeeds
    Degraded,
}

/// Keepalive bookkeeping
#[derive(Debug, Clone, Serialize)]
pub struct KeepaliveStats {
    pub state: SessionState,
    pub checks: u64,
    pub reauthentications: u64,
    pub last_error: Option<String>,
    pub last_check_at: Option<DateTime<Utc>>,
}

impl Default for KeepaliveStats {
    fn default() -> Self {
        Self {
            state: SessionState::Authenticated,
            checks: 0,
            reauthentications: 0,
            last_error: None,
            last_check_at: None,
        }
    }
}

/// Result of one liveness check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepaliveOutcome {
    Alive,
    Reauthenticated,
    ReauthenticationFailed,
    /// A fault other than session expiry; ignored until the next check
    Failed,
}

/// An authenticated session shared by every control-plane call
pub struct Session<C: ControlPlane> {
    plane: Arc<C>,
    login: Login,
    finder: OnceCell<Finder<C>>,
    stats: Arc<RwLock<KeepaliveStats>>,
    shutdown_tx: broadcast::Sender<()>,
    keepalive: Option<JoinHandle<()>>,
}

impl<C: ControlPlane> Session<C> {
    /// Log in with the default keepalive interval
    pub async fn connect(plane: Arc<C>, params: &ConnectionParams) -> Result<Self, VsphereError> {
        Self::connect_with_config(plane, params, SessionConfig::default()).await
    }

    /// Log in and start the keepalive task
    pub async fn connect_with_config(
        plane: Arc<C>,
        params: &ConnectionParams,
        config: SessionConfig,
    ) -> Result<Self, VsphereError> {
        let login = params.login()?;

        plane
            .login(&login)
            .await
            .map_err(|source| VsphereError::Connect {
                endpoint: login.url.to_string(),
                source,
            })?;

        info!(
            endpoint = %login.url,
            user = %login.user,
            "Logged in to vSphere"
        );

        let stats = Arc::new(RwLock::new(KeepaliveStats::default()));
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let keepalive = tokio::spawn(keepalive_loop(
            plane.clone(),
            login.clone(),
            config.keepalive_interval,
            stats.clone(),
            shutdown_rx,
        ));

        Ok(Self {
            plane,
            login,
            finder: OnceCell::new(),
            stats,
            shutdown_tx,
            keepalive: Some(keepalive),
        })
    }

    pub fn plane(&self) -> &Arc<C> {
        &self.plane
    }

    /// SDK endpoint this session is logged in to
    pub fn endpoint(&self) -> &Url {
        &self.login.url
    }

    /// Finder scoped to the default datacenter, resolved on first use
    pub async fn finder(&self) -> Result<&Finder<C>, Fault> {
        self.finder
            .get_or_try_init(|| Finder::for_default_datacenter(self.plane.clone()))
            .await
    }

    /// The cached datacenter, if a lookup has resolved it yet
    pub fn datacenter(&self) -> Option<&Datacenter> {
        self.finder.get().map(Finder::datacenter)
    }

    pub async fn keepalive_stats(&self) -> KeepaliveStats {
        self.stats.read().await.clone()
    }

    /// Run a liveness check now, outside the keepalive schedule
    pub async fn check_now(&self) -> KeepaliveOutcome {
        check_liveness(self.plane.as_ref(), &self.login, &self.stats).await
    }

    /// Stop the keepalive and wait for it to finish
    pub async fn close(mut self) {
        let _ = self.shutdown_tx.send(());
        if let Some(handle) = self.keepalive.take() {
            let _ = handle.await;
        }
        info!(endpoint = %self.login.url, "Closed vSphere session");
    }
}

impl<C: ControlPlane> Drop for Session<C> {
    fn drop(&mut self) {
        if let Some(handle) = self.keepalive.take() {
            handle.abort();
        }
    }
}

async fn keepalive_loop<C: ControlPlane>(
    plane: Arc<C>,
    login: Login,
    period: Duration,
    stats: Arc<RwLock<KeepaliveStats>>,
    mut shutdown: broadcast::Receiver<()>,
) {
    debug!(
        interval_secs = period.as_secs(),
        "Starting session keepalive"
    );

    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                check_liveness(plane.as_ref(), &login, &stats).await;
            }
            _ = shutdown.recv() => {
                debug!("Stopping session keepalive");
                break;
            }
        }
    }
}

async fn check_liveness<C: ControlPlane>(
    plane: &C,
    login: &Login,
    stats: &RwLock<KeepaliveStats>,
) -> KeepaliveOutcome {
    let (outcome, error) = match plane.current_time().await {
        Ok(_) => (KeepaliveOutcome::Alive, None),
        Err(fault) if fault.is_not_authenticated() => {
            debug!(error = %fault, "Session keepalive error");
            match plane.login(login).await {
                Ok(()) => {
                    info!(endpoint = %login.url, "Session keepalive re-authenticated");
                    (KeepaliveOutcome::Reauthenticated, None)
                }
                Err(e) => {
                    warn!(error = %e, "Session keepalive failed to re-authenticate");
                    (KeepaliveOutcome::ReauthenticationFailed, Some(e.to_string()))
                }
            }
        }
        Err(fault) => {
            debug!(error = %fault, "Session keepalive error");
            (KeepaliveOutcome::Failed, Some(fault.to_string()))
        }
    };

    let mut stats = stats.write().await;
    stats.checks += 1;
    stats.last_check_at = Some(Utc::now());
    stats.last_error = error;
    match outcome {
        KeepaliveOutcome::Alive => stats.state = SessionState::Authenticated,
        KeepaliveOutcome::Reauthenticated => {
            stats.state = SessionState::Authenticated;
            stats.reauthentications += 1;
        }
        KeepaliveOutcome::ReauthenticationFailed => stats.state = SessionState::Degraded,
        KeepaliveOutcome::Failed => {}
    }

    outcome
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_config_default() {
        let config = SessionConfig::default();
        assert_eq!(config.keepalive_interval, Duration::from_secs(30));
    }

    #[test]
    fn test_sdk_url() {
        let params = ConnectionParams {
            host: "vcenter.example.com".to_string(),
            user: "vmkite@vsphere.local".to_string(),
            password: "hunter2".to_string(),
            insecure: true,
        };
        assert_eq!(
            params.sdk_url().unwrap().as_str(),
            "https://vcenter.example.com/sdk"
        );

        let local = ConnectionParams {
            host: "http://127.0.0.1:8989/".to_string(),
            ..params
        };
        assert_eq!(local.sdk_url().unwrap().as_str(), "http://127.0.0.1:8989/sdk");
    }

    #[test]
    fn test_connection_params_debug_redacts_password() {
        let params = ConnectionParams {
            host: "vcenter".to_string(),
            user: "vmkite".to_string(),
            password: "hunter2".to_string(),
            insecure: false,
        };
        let debug = format!("{:?}", params);
        assert!(!debug.contains("hunter2"));
        assert!(debug.contains("<redacted>"));
    }
}
