//! Environment classification: reachability, identity and platform.
//!
//! The classifier only observes. It never touches sync state; components
//! that care about changes subscribe to its watch channel.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info};

/// Source of the user's identity.
pub trait AuthProvider: Send + Sync {
    /// Returns true if a usable identity is present.
    fn is_authenticated(&self) -> bool;

    /// Returns the bearer token for remote calls.
    fn access_token(&self) -> Option<String>;
}

/// An [`AuthProvider`] holding a token in memory.
#[derive(Debug, Default)]
pub struct StaticAuth {
    token: RwLock<Option<String>>,
}

impl StaticAuth {
    /// Creates a provider with an optional token.
    pub fn new(token: Option<String>) -> Self {
        Self {
            token: RwLock::new(token),
        }
    }

    /// Creates an unauthenticated provider.
    pub fn guest() -> Self {
        Self::default()
    }

    /// Replaces the token.
    pub fn set_token(&self, token: impl Into<String>) {
        *self.token.write() = Some(token.into());
    }

    /// Removes the token.
    pub fn clear(&self) {
        *self.token.write() = None;
    }
}

impl AuthProvider for StaticAuth {
    fn is_authenticated(&self) -> bool {
        self.token.read().as_deref().is_some_and(|t| !t.is_empty())
    }

    fn access_token(&self) -> Option<String> {
        self.token.read().clone()
    }
}

/// Checks whether the remote store is reachable.
#[async_trait]
pub trait ConnectivityProbe: Send + Sync {
    /// Returns true if the remote answered.
    async fn check(&self) -> bool;
}

/// Authentication mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMode {
    /// Local-only use without an account.
    Guest,
    /// Signed in.
    Authenticated,
}

/// Host platform class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    /// Desktop operating system.
    Desktop,
    /// Phone or tablet.
    Mobile,
    /// Browser runtime.
    Web,
    /// Anything else.
    Other,
}

impl Platform {
    /// Platform of the running binary.
    pub fn current() -> Self {
        if cfg!(target_arch = "wasm32") {
            Platform::Web
        } else {
            match std::env::consts::OS {
                "linux" | "macos" | "windows" | "freebsd" => Platform::Desktop,
                "android" | "ios" => Platform::Mobile,
                _ => Platform::Other,
            }
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Platform::Desktop => "desktop",
            Platform::Mobile => "mobile",
            Platform::Web => "web",
            Platform::Other => "other",
        };
        f.write_str(name)
    }
}

/// A point-in-time view of the environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EnvironmentSnapshot {
    /// Whether the remote is reachable.
    pub online: bool,
    /// Authentication mode.
    pub auth: AuthMode,
    /// Host platform.
    pub platform: Platform,
}

impl EnvironmentSnapshot {
    /// Returns true if network sync may be attempted.
    pub fn can_sync(&self) -> bool {
        self.online && self.auth == AuthMode::Authenticated
    }
}

/// Reports reachability, authentication mode and platform.
///
/// Starts offline; becomes online through [`EnvironmentClassifier::set_online`]
/// or a successful [`EnvironmentClassifier::probe`].
pub struct EnvironmentClassifier {
    auth: Arc<dyn AuthProvider>,
    tx: watch::Sender<EnvironmentSnapshot>,
}

impl EnvironmentClassifier {
    /// Creates a classifier for the current platform.
    pub fn new(auth: Arc<dyn AuthProvider>) -> Self {
        Self::with_platform(auth, Platform::current())
    }

    /// Creates a classifier reporting a fixed platform.
    pub fn with_platform(auth: Arc<dyn AuthProvider>, platform: Platform) -> Self {
        let snapshot = EnvironmentSnapshot {
            online: false,
            auth: auth_mode(auth.as_ref()),
            platform,
        };
        let (tx, _) = watch::channel(snapshot);
        Self { auth, tx }
    }

    /// Current environment.
    pub fn snapshot(&self) -> EnvironmentSnapshot {
        *self.tx.borrow()
    }

    /// Returns true if the remote was last seen reachable.
    pub fn is_online(&self) -> bool {
        self.tx.borrow().online
    }

    /// Queries the auth provider directly.
    pub fn is_authenticated(&self) -> bool {
        self.auth.is_authenticated()
    }

    /// Current bearer token.
    pub fn access_token(&self) -> Option<String> {
        self.auth.access_token()
    }

    /// Returns true if network sync may be attempted right now.
    pub fn can_sync(&self) -> bool {
        self.is_online() && self.is_authenticated()
    }

    /// Records reachability. Returns true if it changed.
    pub fn set_online(&self, online: bool) -> bool {
        let changed = self.tx.send_if_modified(|snapshot| {
            let changed = snapshot.online != online;
            snapshot.online = online;
            changed
        });
        if changed {
            info!(online, "network reachability changed");
        }
        changed
    }

    /// Re-reads the auth provider after a login or logout. Returns true if
    /// the mode changed.
    pub fn refresh_auth(&self) -> bool {
        let mode = auth_mode(self.auth.as_ref());
        let changed = self.tx.send_if_modified(|snapshot| {
            let changed = snapshot.auth != mode;
            snapshot.auth = mode;
            changed
        });
        if changed {
            info!(?mode, "authentication mode changed");
        }
        changed
    }

    /// Runs a connectivity probe bounded by `timeout` and records the
    /// result. A timed-out probe counts as offline.
    pub async fn probe(&self, probe: &dyn ConnectivityProbe, timeout: Duration) -> bool {
        let online = tokio::time::timeout(timeout, probe.check())
            .await
            .unwrap_or(false);
        debug!(online, "connectivity probe finished");
        self.set_online(online);
        online
    }

    /// Subscribes to environment changes.
    pub fn subscribe(&self) -> watch::Receiver<EnvironmentSnapshot> {
        self.tx.subscribe()
    }
}

impl fmt::Debug for EnvironmentClassifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EnvironmentClassifier")
            .field("snapshot", &self.snapshot())
            .finish()
    }
}

fn auth_mode(auth: &dyn AuthProvider) -> AuthMode {
    if auth.is_authenticated() {
        AuthMode::Authenticated
    } else {
        AuthMode::Guest
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::future::pending;

    struct FixedProbe(bool);

    #[async_trait]
    impl ConnectivityProbe for FixedProbe {
        async fn check(&self) -> bool {
            self.0
        }
    }

    struct HangingProbe;

    #[async_trait]
    impl ConnectivityProbe for HangingProbe {
        async fn check(&self) -> bool {
            pending::<()>().await;
            true
        }
    }

    fn classifier(token: Option<&str>) -> (Arc<StaticAuth>, EnvironmentClassifier) {
        let auth = Arc::new(StaticAuth::new(token.map(str::to_string)));
        let env = EnvironmentClassifier::with_platform(auth.clone(), Platform::Desktop);
        (auth, env)
    }

    #[test]
    fn starts_offline() {
        let (_, env) = classifier(Some("token"));
        let snapshot = env.snapshot();
        assert!(!snapshot.online);
        assert_eq!(snapshot.auth, AuthMode::Authenticated);
        assert_eq!(snapshot.platform, Platform::Desktop);
        assert!(!env.can_sync());
    }

    #[test]
    fn can_sync_needs_both() {
        let (auth, env) = classifier(None);
        assert!(env.set_online(true));
        assert!(!env.set_online(true));
        assert!(!env.can_sync());

        auth.set_token("t");
        assert!(env.can_sync());
        assert!(env.refresh_auth());
        assert!(env.snapshot().can_sync());
    }

    #[tokio::test]
    async fn watchers_see_changes() {
        let (auth, env) = classifier(Some("t"));
        let mut rx = env.subscribe();

        env.set_online(true);
        rx.changed().await.unwrap();
        assert!(rx.borrow_and_update().online);

        auth.clear();
        env.refresh_auth();
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow_and_update().auth, AuthMode::Guest);
    }

    #[tokio::test]
    async fn probe_sets_reachability() {
        let (_, env) = classifier(Some("t"));
        assert!(env.probe(&FixedProbe(true), Duration::from_secs(1)).await);
        assert!(env.is_online());
        assert!(!env.probe(&FixedProbe(false), Duration::from_secs(1)).await);
        assert!(!env.is_online());
    }

    #[tokio::test(start_paused = true)]
    async fn probe_times_out_as_offline() {
        let (_, env) = classifier(Some("t"));
        env.set_online(true);
        assert!(!env.probe(&HangingProbe, Duration::from_secs(5)).await);
        assert!(!env.is_online());
    }

    #[test]
    fn empty_token_is_guest() {
        let auth = StaticAuth::new(Some(String::new()));
        assert!(!auth.is_authenticated());
        assert!(!StaticAuth::guest().is_authenticated());
    }
}
