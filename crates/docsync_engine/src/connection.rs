//! Connection state machine.
//!
//! Models the connectivity and sync lifecycle as an explicit finite-state
//! machine with a fixed transition table. Every accepted transition is
//! appended to a bounded history and pushed to subscribers in order.

use crate::config::BackoffConfig;
use crate::error::{SyncError, SyncResult};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Engine constructed, nothing attempted yet.
    Initializing,
    /// No connection.
    Disconnected,
    /// Connection attempt in progress.
    Connecting,
    /// Connected and idle.
    Connected,
    /// Sync in progress.
    Syncing,
    /// Last sync completed.
    Synced,
    /// Recoverable failure; a retry is scheduled.
    Error,
    /// Unrecoverable; only [`ConnectionMachine::reset`] leaves this state.
    Fatal,
}

impl ConnectionState {
    /// Every state, in declaration order.
    pub const ALL: [ConnectionState; 8] = [
        ConnectionState::Initializing,
        ConnectionState::Disconnected,
        ConnectionState::Connecting,
        ConnectionState::Connected,
        ConnectionState::Syncing,
        ConnectionState::Synced,
        ConnectionState::Error,
        ConnectionState::Fatal,
    ];

    /// Legal targets from this state.
    pub fn allowed_targets(&self) -> &'static [ConnectionState] {
        use ConnectionState::*;
        match self {
            Initializing => &[Disconnected, Connecting, Error, Fatal],
            Disconnected => &[Connecting, Error, Fatal],
            Connecting => &[Connected, Disconnected, Error, Fatal],
            Connected => &[Syncing, Disconnected, Error, Fatal],
            Syncing => &[Synced, Connected, Disconnected, Error, Fatal],
            Synced => &[Syncing, Disconnected, Error, Fatal],
            Error => &[Connecting, Disconnected, Fatal],
            Fatal => &[],
        }
    }

    /// Returns true if `to` is a legal target from this state.
    pub fn can_transition_to(&self, to: ConnectionState) -> bool {
        self.allowed_targets().contains(&to)
    }

    /// Returns true if the remote is reachable in this state.
    pub fn is_online(&self) -> bool {
        matches!(
            self,
            ConnectionState::Connected | ConnectionState::Syncing | ConnectionState::Synced
        )
    }

    /// Returns the lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Initializing => "initializing",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Syncing => "syncing",
            ConnectionState::Synced => "synced",
            ConnectionState::Error => "error",
            ConnectionState::Fatal => "fatal",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A recorded state with its context.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectionStateInfo {
    /// State entered.
    pub state: ConnectionState,
    /// When it was entered.
    pub timestamp: DateTime<Utc>,
    /// Error that caused the transition, if any.
    pub error: Option<String>,
    /// Consecutive errors at the time of the transition.
    pub retry_count: u32,
    /// When the next connection attempt is due.
    pub next_retry_at: Option<DateTime<Utc>>,
}

impl ConnectionStateInfo {
    fn new(state: ConnectionState, retry_count: u32) -> Self {
        Self {
            state,
            timestamp: Utc::now(),
            error: None,
            retry_count,
            next_retry_at: None,
        }
    }
}

/// Handle returned by [`ConnectionMachine::subscribe`].
pub type SubscriptionId = u64;

struct Inner {
    current: ConnectionStateInfo,
    history: VecDeque<ConnectionStateInfo>,
    retry_count: u32,
    subscribers: Vec<(SubscriptionId, mpsc::UnboundedSender<ConnectionStateInfo>)>,
    next_subscription: SubscriptionId,
}

impl Inner {
    fn fresh() -> Self {
        let current = ConnectionStateInfo::new(ConnectionState::Initializing, 0);
        Self {
            history: VecDeque::from([current.clone()]),
            current,
            retry_count: 0,
            subscribers: Vec::new(),
            next_subscription: 0,
        }
    }
}

/// The connection state machine.
///
/// # Invariants
///
/// - The current state only changes along an edge of the transition table.
/// - `Fatal` has no outgoing edges.
/// - History holds at most `history_limit` entries, oldest evicted first.
pub struct ConnectionMachine {
    backoff: BackoffConfig,
    history_limit: usize,
    inner: Mutex<Inner>,
}

impl ConnectionMachine {
    /// Creates a machine in `Initializing`.
    pub fn new(backoff: BackoffConfig, history_limit: usize) -> Self {
        Self {
            backoff,
            history_limit: history_limit.max(1),
            inner: Mutex::new(Inner::fresh()),
        }
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        self.inner.lock().current.state
    }

    /// Current state with context.
    pub fn info(&self) -> ConnectionStateInfo {
        self.inner.lock().current.clone()
    }

    /// Recorded transitions, oldest first.
    pub fn history(&self) -> Vec<ConnectionStateInfo> {
        self.inner.lock().history.iter().cloned().collect()
    }

    /// Consecutive errors since the last successful connection.
    pub fn retry_count(&self) -> u32 {
        self.inner.lock().retry_count
    }

    /// Returns true if the machine is in `Fatal`.
    pub fn is_fatal(&self) -> bool {
        self.state() == ConnectionState::Fatal
    }

    /// Moves to `to`.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::IllegalTransition`] if the edge is not in the
    /// transition table; the state is left unchanged.
    pub fn transition(&self, to: ConnectionState) -> SyncResult<ConnectionStateInfo> {
        let mut inner = self.inner.lock();
        let from = inner.current.state;
        if !from.can_transition_to(to) {
            warn!(%from, %to, "illegal connection transition");
            return Err(SyncError::IllegalTransition { from, to });
        }
        if to == ConnectionState::Connected {
            inner.retry_count = 0;
        }
        let info = ConnectionStateInfo::new(to, inner.retry_count);
        self.record(&mut inner, info.clone());
        Ok(info)
    }

    /// Records a connection error.
    ///
    /// Increments the retry counter and moves to `Error` with the next
    /// retry scheduled by backoff, or to `Fatal` once the counter reaches
    /// the configured maximum.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::IllegalTransition`] if the current state cannot
    /// move to the chosen target.
    pub fn error(&self, message: impl Into<String>) -> SyncResult<ConnectionStateInfo> {
        let message = message.into();
        let mut inner = self.inner.lock();
        let from = inner.current.state;
        let retry_count = inner.retry_count.saturating_add(1);
        let to = if retry_count >= self.backoff.max_retries {
            ConnectionState::Fatal
        } else {
            ConnectionState::Error
        };
        if !from.can_transition_to(to) {
            warn!(%from, %to, error = %message, "illegal connection transition");
            return Err(SyncError::IllegalTransition { from, to });
        }

        inner.retry_count = retry_count;
        let next_retry_at = (to == ConnectionState::Error).then(|| {
            let delay = self.backoff.delay_for_attempt(retry_count - 1);
            Utc::now() + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero())
        });
        let info = ConnectionStateInfo {
            error: Some(message),
            next_retry_at,
            ..ConnectionStateInfo::new(to, retry_count)
        };
        self.record(&mut inner, info.clone());
        Ok(info)
    }

    /// Time until the scheduled retry, if one is pending.
    pub fn next_retry_delay(&self) -> Option<Duration> {
        let at = self.inner.lock().current.next_retry_at?;
        Some((at - Utc::now()).to_std().unwrap_or(Duration::ZERO))
    }

    /// Enters `Syncing` from `Connected` or `Synced`. Returns false, without
    /// changing state, from any other state.
    pub fn begin_sync(&self) -> bool {
        let state = self.state();
        matches!(state, ConnectionState::Connected | ConnectionState::Synced)
            && self.transition(ConnectionState::Syncing).is_ok()
    }

    /// Leaves `Syncing` for `Synced` (or `Connected` when `completed` is
    /// false). No-op in any other state.
    pub fn finish_sync(&self, completed: bool) {
        if self.state() != ConnectionState::Syncing {
            return;
        }
        let to = if completed {
            ConnectionState::Synced
        } else {
            ConnectionState::Connected
        };
        let _ = self.transition(to);
    }

    /// Subscribes to transitions. The current state is delivered first.
    pub fn subscribe(&self) -> (SubscriptionId, mpsc::UnboundedReceiver<ConnectionStateInfo>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock();
        let id = inner.next_subscription;
        inner.next_subscription += 1;
        let _ = tx.send(inner.current.clone());
        inner.subscribers.push((id, tx));
        (id, rx)
    }

    /// Ends a subscription. Returns true if it existed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut inner = self.inner.lock();
        let before = inner.subscribers.len();
        inner.subscribers.retain(|(sub, _)| *sub != id);
        inner.subscribers.len() != before
    }

    /// Rebuilds the machine in `Initializing`, clearing the retry counter
    /// and history. Subscribers are kept and notified.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        let subscribers = std::mem::take(&mut inner.subscribers);
        let next_subscription = inner.next_subscription;
        *inner = Inner::fresh();
        inner.subscribers = subscribers;
        inner.next_subscription = next_subscription;
        let current = inner.current.clone();
        inner.subscribers.retain(|(_, tx)| tx.send(current.clone()).is_ok());
        debug!("connection machine reset");
    }

    fn record(&self, inner: &mut Inner, info: ConnectionStateInfo) {
        debug!(
            from = %inner.current.state,
            to = %info.state,
            retry_count = info.retry_count,
            "connection transition"
        );
        inner.current = info.clone();
        inner.history.push_back(info.clone());
        while inner.history.len() > self.history_limit {
            inner.history.pop_front();
        }
        inner.subscribers.retain(|(_, tx)| tx.send(info.clone()).is_ok());
    }
}

impl fmt::Debug for ConnectionMachine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("ConnectionMachine")
            .field("state", &inner.current.state)
            .field("retry_count", &inner.retry_count)
            .field("history_len", &inner.history.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use ConnectionState::*;

    fn machine() -> ConnectionMachine {
        ConnectionMachine::new(
            BackoffConfig::new(Duration::from_millis(100), Duration::from_secs(5), 3),
            50,
        )
    }

    #[test]
    fn starts_initializing() {
        let m = machine();
        assert_eq!(m.state(), Initializing);
        assert_eq!(m.history().len(), 1);
        assert_eq!(m.retry_count(), 0);
    }

    #[test]
    fn happy_path() {
        let m = machine();
        m.transition(Connecting).unwrap();
        m.transition(Connected).unwrap();
        assert!(m.begin_sync());
        m.finish_sync(true);
        assert_eq!(m.state(), Synced);
        assert!(m.begin_sync());
        m.finish_sync(false);
        assert_eq!(m.state(), Connected);
    }

    #[test]
    fn illegal_transition_leaves_state() {
        let m = machine();
        let err = m.transition(Synced).unwrap_err();
        assert!(matches!(
            err,
            SyncError::IllegalTransition {
                from: Initializing,
                to: Synced
            }
        ));
        assert_eq!(m.state(), Initializing);
    }

    #[test]
    fn errors_escalate_to_fatal() {
        let m = machine();
        m.transition(Connecting).unwrap();
        let info = m.error("refused").unwrap();
        assert_eq!(info.state, Error);
        assert_eq!(info.retry_count, 1);
        assert!(info.next_retry_at.is_some());
        assert!(m.next_retry_delay().is_some());

        m.transition(Connecting).unwrap();
        assert_eq!(m.error("refused").unwrap().state, Error);
        m.transition(Connecting).unwrap();
        let info = m.error("refused").unwrap();
        assert_eq!(info.state, Fatal);
        assert!(info.next_retry_at.is_none());

        for target in ConnectionState::ALL {
            assert!(m.transition(target).is_err());
        }
        assert!(m.error("again").is_err());
        assert!(!m.begin_sync());
    }

    #[test]
    fn connected_resets_retry_counter() {
        let m = machine();
        m.transition(Connecting).unwrap();
        m.error("timeout").unwrap();
        m.transition(Connecting).unwrap();
        assert_eq!(m.transition(Connected).unwrap().retry_count, 0);
        assert_eq!(m.retry_count(), 0);
    }

    #[test]
    fn reset_leaves_fatal() {
        let m = machine();
        m.transition(Fatal).unwrap();
        m.reset();
        assert_eq!(m.state(), Initializing);
        assert_eq!(m.history().len(), 1);
        m.transition(Connecting).unwrap();
    }

    #[test]
    fn history_is_bounded() {
        let m = ConnectionMachine::new(BackoffConfig::default(), 4);
        m.transition(Connecting).unwrap();
        m.transition(Connected).unwrap();
        for _ in 0..5 {
            m.transition(Syncing).unwrap();
            m.transition(Synced).unwrap();
        }
        let history = m.history();
        assert_eq!(history.len(), 4);
        assert_eq!(history.last().map(|i| i.state), Some(Synced));
    }

    #[tokio::test]
    async fn subscriber_gets_replay_then_transitions() {
        let m = machine();
        m.transition(Connecting).unwrap();
        let (id, mut rx) = m.subscribe();

        assert_eq!(rx.recv().await.unwrap().state, Connecting);
        m.transition(Connected).unwrap();
        assert_eq!(rx.recv().await.unwrap().state, Connected);

        assert!(m.unsubscribe(id));
        m.transition(Disconnected).unwrap();
        assert!(rx.recv().await.is_none());
    }

    #[test]
    fn dropped_receivers_are_pruned() {
        let m = machine();
        let (_, rx) = m.subscribe();
        drop(rx);
        m.transition(Connecting).unwrap();
        assert_eq!(m.inner.lock().subscribers.len(), 0);
    }

    fn any_state() -> impl Strategy<Value = ConnectionState> {
        proptest::sample::select(ConnectionState::ALL.to_vec())
    }

    proptest! {
        #[test]
        fn never_leaves_the_table(targets in proptest::collection::vec(any_state(), 1..100)) {
            let m = machine();
            for to in targets {
                let from = m.state();
                match m.transition(to) {
                    Ok(info) => {
                        prop_assert!(from.can_transition_to(to));
                        prop_assert_eq!(info.state, to);
                        prop_assert_eq!(m.state(), to);
                    }
                    Err(_) => {
                        prop_assert!(!from.can_transition_to(to));
                        prop_assert_eq!(m.state(), from);
                    }
                }
            }
        }

        #[test]
        fn errors_never_escape_the_table(ops in proptest::collection::vec(any::<bool>(), 1..60)) {
            let m = machine();
            for is_error in ops {
                let from = m.state();
                let result = if is_error {
                    m.error("boom")
                } else {
                    m.transition(Connecting)
                };
                if let Ok(info) = result {
                    prop_assert!(from.can_transition_to(info.state));
                }
                if from == Fatal {
                    prop_assert_eq!(m.state(), Fatal);
                }
            }
        }
    }

    #[test]
    fn fatal_has_no_edges() {
        assert!(Fatal.allowed_targets().is_empty());
        for state in ConnectionState::ALL {
            assert!(!state.allowed_targets().contains(&Initializing));
        }
    }
}
