//! Connection confirmation gate.
//!
//! Remote peers are unknown browsers, so resource access is gated on a
//! human decision: a peer's first contact creates a *pending* confirmation
//! request surfaced to the operator, and only an explicit approval promotes
//! the peer into the bounded active registry. Unresolved requests expire to
//! denied after a timeout; a denial is not permanent: the next request from
//! the same source opens a fresh prompt.
//!
//! All state is owned by the gate value and dies with the session. Timers
//! (per-request expiry, the staleness sweeper) are abortable tasks cancelled
//! on [`ConnectionGate::shutdown`].

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use crate::limit::RateLimiter;

/// Where a source currently stands with the gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessState {
    /// Confirmation is disabled; everything is allowed
    Disabled,
    /// A confirmation request is waiting on the operator
    Pending,
    /// The operator approved the source
    Confirmed,
    /// The operator denied the source, or the request expired
    Denied,
}

/// Events surfaced to the operator layer.
#[derive(Debug, Clone)]
pub enum GateEvent {
    /// A new peer asked for access and needs a decision
    ConfirmationRequested {
        /// Source address of the peer
        source: String,
        /// Identity string the peer declared (e.g. user agent)
        identity: String,
    },
    /// The operator resolved a pending request
    Resolved {
        /// Source address of the peer
        source: String,
        /// Whether access was granted
        approved: bool,
    },
    /// A pending request expired without a decision and was denied
    Expired {
        /// Source address of the peer
        source: String,
    },
}

/// A confirmation request waiting on (or already past) an operator decision.
#[derive(Debug, Clone)]
pub struct PendingConnection {
    /// Source address of the peer
    pub source: String,
    /// Identity string the peer declared
    pub identity: String,
    /// When the request was created
    pub requested_at: Instant,
}

/// A confirmed peer in the bounded active registry.
#[derive(Debug, Clone)]
pub struct ActiveConnection {
    /// Source address of the peer
    pub source: String,
    /// Identity string the peer declared
    pub identity: String,
    /// When the peer was approved
    pub connected_at: Instant,
}

/// Gate behavior knobs, fixed at construction.
#[derive(Debug, Clone)]
pub struct GateConfig {
    /// Whether confirmation is required at all
    pub enabled: bool,
    /// How long a pending request may wait before it is denied
    pub confirmation_timeout: Duration,
    /// Maximum size of the active registry
    pub registry_cap: usize,
    /// Active entries older than this are swept
    pub session_expiration: Duration,
    /// Interval between staleness sweeps
    pub sweep_interval: Duration,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            confirmation_timeout: Duration::from_secs(crate::CONFIRMATION_TIMEOUT_SECS),
            registry_cap: crate::MAX_ACTIVE_CONNECTIONS,
            session_expiration: Duration::from_secs(crate::DEFAULT_SESSION_EXPIRATION_SECS),
            sweep_interval: Duration::from_secs(crate::SWEEP_INTERVAL_SECS),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Resolution {
    Pending,
    Confirmed,
    Denied,
}

#[derive(Debug)]
struct PendingEntry {
    identity: String,
    requested_at: Instant,
    resolution: Resolution,
    generation: u64,
    timeout: Option<JoinHandle<()>>,
}

#[derive(Debug, Default)]
struct GateInner {
    pending: HashMap<String, PendingEntry>,
    active: HashMap<String, ActiveConnection>,
    // Insertion order of `active` keys; eviction never relies on map
    // iteration order.
    order: VecDeque<String>,
    next_generation: u64,
    sweeper: Option<JoinHandle<()>>,
}

/// The confirmation-request lifecycle for inbound peers.
///
/// Cheap to clone; all clones share the same state.
#[derive(Debug, Clone)]
pub struct ConnectionGate {
    config: GateConfig,
    limiter: Arc<RateLimiter>,
    inner: Arc<Mutex<GateInner>>,
    events: broadcast::Sender<GateEvent>,
    active_count: Arc<watch::Sender<usize>>,
}

impl ConnectionGate {
    /// Create a gate sharing bookkeeping with the session's rate limiter.
    #[must_use]
    pub fn new(config: GateConfig, limiter: Arc<RateLimiter>) -> Self {
        let (events, _) = broadcast::channel(64);
        let (active_count, _) = watch::channel(0);
        Self {
            config,
            limiter,
            inner: Arc::new(Mutex::new(GateInner::default())),
            events,
            active_count: Arc::new(active_count),
        }
    }

    /// Whether confirmation is required at all.
    #[must_use]
    pub const fn enabled(&self) -> bool {
        self.config.enabled
    }

    /// Register a request for access from `source`.
    ///
    /// With confirmation disabled this always allows. Otherwise a fresh
    /// pending entry is created unless one is already waiting (repeated
    /// requests coalesce into the existing prompt), and a timeout is armed
    /// that denies the request if the operator never answers.
    pub fn request_access(&self, source: &str, identity: &str) -> AccessState {
        if !self.config.enabled {
            return AccessState::Disabled;
        }

        let mut inner = self.lock();

        if inner.active.contains_key(source) {
            return AccessState::Confirmed;
        }

        if let Some(entry) = inner.pending.get(source) {
            if entry.resolution == Resolution::Pending {
                return AccessState::Pending;
            }
        }

        inner.next_generation += 1;
        let generation = inner.next_generation;

        let timeout = self.spawn_timeout(source.to_string(), generation);
        if let Some(previous) = inner.pending.insert(
            source.to_string(),
            PendingEntry {
                identity: identity.to_string(),
                requested_at: Instant::now(),
                resolution: Resolution::Pending,
                generation,
                timeout: Some(timeout),
            },
        ) {
            if let Some(handle) = previous.timeout {
                handle.abort();
            }
        }

        tracing::info!(source, identity, "confirmation requested");
        let _ = self.events.send(GateEvent::ConfirmationRequested {
            source: source.to_string(),
            identity: identity.to_string(),
        });

        AccessState::Pending
    }

    /// Resolve a pending request.
    ///
    /// Approval promotes the source into the active registry, evicting the
    /// oldest member first when the registry is full (the evicted peer's
    /// rate window and pending bookkeeping are cleared too). Returns `false`
    /// when there is no pending entry for the source.
    pub fn resolve(&self, source: &str, approve: bool) -> bool {
        if !self.config.enabled {
            return false;
        }

        let mut inner = self.lock();

        let Some(entry) = inner.pending.get_mut(source) else {
            return false;
        };
        if entry.resolution != Resolution::Pending {
            return false;
        }

        if let Some(handle) = entry.timeout.take() {
            handle.abort();
        }
        entry.resolution = if approve {
            Resolution::Confirmed
        } else {
            Resolution::Denied
        };
        let identity = entry.identity.clone();

        if approve {
            while inner.active.len() >= self.config.registry_cap {
                let Some(oldest) = inner.order.pop_front() else {
                    break;
                };
                self.evict(&mut inner, &oldest);
            }

            inner.active.insert(
                source.to_string(),
                ActiveConnection {
                    source: source.to_string(),
                    identity,
                    connected_at: Instant::now(),
                },
            );
            inner.order.push_back(source.to_string());
            let _ = self.active_count.send(inner.active.len());
        }

        tracing::info!(source, approve, "confirmation resolved");
        let _ = self.events.send(GateEvent::Resolved {
            source: source.to_string(),
            approved: approve,
        });
        true
    }

    /// Whether `source` may fetch protected resources right now.
    ///
    /// True when confirmation is disabled or the source has a confirmed
    /// registry entry; false otherwise, including for completely unknown
    /// sources.
    #[must_use]
    pub fn is_allowed(&self, source: &str) -> bool {
        if !self.config.enabled {
            return true;
        }
        self.lock().active.contains_key(source)
    }

    /// Current state of `source` from the gate's perspective.
    #[must_use]
    pub fn state(&self, source: &str) -> AccessState {
        if !self.config.enabled {
            return AccessState::Disabled;
        }
        let inner = self.lock();
        if inner.active.contains_key(source) {
            return AccessState::Confirmed;
        }
        match inner.pending.get(source).map(|e| e.resolution) {
            Some(Resolution::Pending) => AccessState::Pending,
            Some(Resolution::Confirmed) => AccessState::Confirmed,
            Some(Resolution::Denied) => AccessState::Denied,
            None => AccessState::Denied,
        }
    }

    /// Snapshot of requests still waiting on the operator.
    #[must_use]
    pub fn pending_requests(&self) -> Vec<PendingConnection> {
        self.lock()
            .pending
            .iter()
            .filter(|(_, e)| e.resolution == Resolution::Pending)
            .map(|(source, e)| PendingConnection {
                source: source.clone(),
                identity: e.identity.clone(),
                requested_at: e.requested_at,
            })
            .collect()
    }

    /// Number of peers in the active registry.
    #[must_use]
    pub fn active_connections(&self) -> usize {
        self.lock().active.len()
    }

    /// Subscribe to gate events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<GateEvent> {
        self.events.subscribe()
    }

    /// Subscribe to the active-connection count.
    #[must_use]
    pub fn subscribe_active_count(&self) -> watch::Receiver<usize> {
        self.active_count.subscribe()
    }

    /// Start the periodic staleness sweep.
    ///
    /// Active entries older than the session expiration are dropped, along
    /// with their rate windows. The task runs until [`shutdown`].
    ///
    /// [`shutdown`]: Self::shutdown
    pub fn start_sweeper(&self) {
        if !self.config.enabled {
            return;
        }

        let gate = self.clone();
        let interval = self.config.sweep_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                gate.sweep_stale();
            }
        });

        let mut inner = self.lock();
        if let Some(previous) = inner.sweeper.replace(handle) {
            previous.abort();
        }
    }

    /// Cancel all gate timers and clear state.
    ///
    /// Called during session teardown, before shared state is released, so
    /// no timer fires against a torn-down session.
    pub fn shutdown(&self) {
        let mut inner = self.lock();
        if let Some(handle) = inner.sweeper.take() {
            handle.abort();
        }
        for entry in inner.pending.values_mut() {
            if let Some(handle) = entry.timeout.take() {
                handle.abort();
            }
        }
        inner.pending.clear();
        inner.active.clear();
        inner.order.clear();
        let _ = self.active_count.send(0);
    }

    fn sweep_stale(&self) {
        let expiration = self.config.session_expiration;
        let mut inner = self.lock();

        let stale: Vec<String> = inner
            .active
            .iter()
            .filter(|(_, conn)| conn.connected_at.elapsed() >= expiration)
            .map(|(source, _)| source.clone())
            .collect();

        if stale.is_empty() {
            return;
        }

        for source in &stale {
            self.evict(&mut inner, source);
        }
        let GateInner { active, order, .. } = &mut *inner;
        order.retain(|s| active.contains_key(s));
        let count = inner.active.len();
        let _ = self.active_count.send(count);
        tracing::debug!(swept = stale.len(), remaining = count, "stale sweep");
    }

    fn evict(&self, inner: &mut GateInner, source: &str) {
        inner.active.remove(source);
        if let Some(mut entry) = inner.pending.remove(source) {
            if let Some(handle) = entry.timeout.take() {
                handle.abort();
            }
        }
        self.limiter.forget(source);
    }

    fn spawn_timeout(&self, source: String, generation: u64) -> JoinHandle<()> {
        let inner = Arc::clone(&self.inner);
        let events = self.events.clone();
        let timeout = self.config.confirmation_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let mut inner = inner.lock().expect("gate lock poisoned");
            if let Some(entry) = inner.pending.get_mut(&source) {
                if entry.generation == generation && entry.resolution == Resolution::Pending {
                    entry.resolution = Resolution::Denied;
                    entry.timeout = None;
                    tracing::info!(source, "confirmation request expired");
                    let _ = events.send(GateEvent::Expired { source: source.clone() });
                }
            }
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, GateInner> {
        self.inner.lock().expect("gate lock poisoned")
    }
}
