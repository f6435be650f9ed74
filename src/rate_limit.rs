//! Per-client sliding-window admission control.
//!
//! Every guarded operation class owns its own [`RateLimiter`], so a client hammering one class
//! of requests never eats into its quota (or lock) for another.
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::collection::CollectionName;
use crate::error::{Result, StoreError};

/// The classes of guarded operations, each with an independent quota.
///
/// Reads and writes of a collection are separate classes, so a client polling a collection
/// never uses up its quota for writing it.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OperationClass {
    /// reads of the `users` collection
    UsersRead,
    /// writes of the `users` collection
    UsersWrite,
    /// reads of the `guesses` collection
    GuessesRead,
    /// writes of the `guesses` collection
    GuessesWrite,
    /// reads of the `results` collection
    ResultsRead,
    /// writes of the `results` collection
    ResultsWrite,
    /// on-demand backups
    Backup,
    /// on-demand CSV exports
    Export,
    /// wiping every collection
    ClearAll,
    /// wiping guesses and results
    Restart,
    /// replacing every collection with a snapshot
    Restore,
    /// aggregate statistics
    Stats,
    /// derived reports and snapshot listings
    Read,
}

impl OperationClass {
    /// every operation class
    pub const ALL: [OperationClass; 13] = [
        OperationClass::UsersRead,
        OperationClass::UsersWrite,
        OperationClass::GuessesRead,
        OperationClass::GuessesWrite,
        OperationClass::ResultsRead,
        OperationClass::ResultsWrite,
        OperationClass::Backup,
        OperationClass::Export,
        OperationClass::ClearAll,
        OperationClass::Restart,
        OperationClass::Restore,
        OperationClass::Stats,
        OperationClass::Read,
    ];

    /// the quota applied to this class unless configured otherwise
    pub fn default_quota(&self) -> Quota {
        use OperationClass::*;
        match self {
            UsersRead | UsersWrite => Quota::new(50, Duration::from_secs(60)),
            GuessesRead | GuessesWrite => Quota::new(100, Duration::from_secs(60)),
            ResultsRead | ResultsWrite => Quota::new(50, Duration::from_secs(60)),
            Backup | Export => Quota::new(5, Duration::from_secs(300)),
            ClearAll | Restore => Quota::new(2, Duration::from_secs(3600)),
            Restart => Quota::new(5, Duration::from_secs(3600)),
            Stats | Read => Quota::new(60, Duration::from_secs(60)),
        }
    }

    /// the class guarding reads of collection `name`
    pub fn read_of(name: CollectionName) -> Self {
        match name {
            CollectionName::Users => OperationClass::UsersRead,
            CollectionName::Guesses => OperationClass::GuessesRead,
            CollectionName::Results => OperationClass::ResultsRead,
        }
    }

    /// the class guarding writes of collection `name`
    pub fn write_of(name: CollectionName) -> Self {
        match name {
            CollectionName::Users => OperationClass::UsersWrite,
            CollectionName::Guesses => OperationClass::GuessesWrite,
            CollectionName::Results => OperationClass::ResultsWrite,
        }
    }
}

impl fmt::Display for OperationClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OperationClass::UsersRead => "users-read",
            OperationClass::UsersWrite => "users-write",
            OperationClass::GuessesRead => "guesses-read",
            OperationClass::GuessesWrite => "guesses-write",
            OperationClass::ResultsRead => "results-read",
            OperationClass::ResultsWrite => "results-write",
            OperationClass::Backup => "backup",
            OperationClass::Export => "export",
            OperationClass::ClearAll => "clear-all",
            OperationClass::Restart => "restart",
            OperationClass::Restore => "restore",
            OperationClass::Stats => "stats",
            OperationClass::Read => "read",
        };
        f.write_str(s)
    }
}

/// At most `max_requests` admitted calls per client within any trailing `window`
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quota {
    /// admitted calls allowed within the window
    pub max_requests: usize,
    /// length of the trailing window
    pub window: Duration,
}

impl Quota {
    /// builder method to construct a new `Quota`
    pub fn new(max_requests: usize, window: Duration) -> Self {
        Quota {
            max_requests,
            window,
        }
    }
}

/// A sliding-window counter over the admitted request timestamps of every client.
///
/// The window moves continuously with the call time, so there is no burst at a reset edge.
/// Each client's timestamps sit behind their own map shard lock, which makes the
/// prune / check / record sequence atomic per client.
#[derive(Debug)]
pub struct RateLimiter {
    quota: Quota,
    windows: DashMap<String, VecDeque<Instant>>,
}

impl RateLimiter {
    /// creates a limiter admitting `max_requests` per client within any trailing `window`
    pub fn new(max_requests: usize, window: Duration) -> Self {
        RateLimiter::with_quota(Quota::new(max_requests, window))
    }

    /// creates a limiter enforcing `quota`
    pub fn with_quota(quota: Quota) -> Self {
        RateLimiter {
            quota,
            windows: DashMap::new(),
        }
    }

    /// the quota enforced by this limiter
    pub fn quota(&self) -> Quota {
        self.quota
    }

    /// admits or denies a call from `client` made now
    pub fn admit(&self, client: &str) -> bool {
        self.admit_at(client, Instant::now())
    }

    /// admits or denies a call from `client` made at `now`.
    ///
    /// Denied calls are not recorded, so they don't extend the client's lock-out.
    pub fn admit_at(&self, client: &str, now: Instant) -> bool {
        let window = self.quota.window;
        let mut timestamps = self.windows.entry(client.to_string()).or_default();
        timestamps.retain(|t| now.saturating_duration_since(*t) < window);

        if timestamps.len() < self.quota.max_requests {
            timestamps.push_back(now);
            true
        } else {
            false
        }
    }

    /// forgets clients whose every recorded call has left the window
    pub fn sweep_at(&self, now: Instant) {
        let window = self.quota.window;
        self.windows.retain(|_, timestamps| {
            timestamps
                .back()
                .map_or(false, |last| now.saturating_duration_since(*last) < window)
        });
    }

    /// number of clients with a recorded window
    pub fn tracked_clients(&self) -> usize {
        self.windows.len()
    }
}

/// One independent [`RateLimiter`] per [`OperationClass`]
#[derive(Debug)]
pub struct Limiters {
    limiters: BTreeMap<OperationClass, RateLimiter>,
}

impl Limiters {
    /// builds a limiter for every class, using `overrides` where given and the class default
    /// otherwise
    pub fn new(overrides: &BTreeMap<OperationClass, Quota>) -> Self {
        let limiters = OperationClass::ALL
            .iter()
            .map(|class| {
                let quota = overrides
                    .get(class)
                    .copied()
                    .unwrap_or_else(|| class.default_quota());
                (*class, RateLimiter::with_quota(quota))
            })
            .collect();
        Limiters { limiters }
    }

    /// admits a call of `class` from `client`
    ///
    /// # Errors
    /// returns [`StoreError::QuotaExceeded`] if the client used up its quota for `class`
    pub fn admit(&self, client: &str, class: OperationClass) -> Result<()> {
        if self.limiter(class).admit(client) {
            Ok(())
        } else {
            warn!("rate limit exceeded for {} on {}", client, class);
            Err(StoreError::QuotaExceeded {
                client: client.to_string(),
                class,
            })
        }
    }

    /// the limiter guarding `class`
    pub fn limiter(&self, class: OperationClass) -> &RateLimiter {
        // every class is inserted by the constructor
        &self.limiters[&class]
    }

    /// forgets idle clients in every limiter
    pub fn sweep(&self) {
        let now = Instant::now();
        for (class, limiter) in &self.limiters {
            limiter.sweep_at(now);
            debug!("{} limiter tracks {} clients", class, limiter.tracked_clients());
        }
    }
}

impl Default for Limiters {
    fn default() -> Self {
        Limiters::new(&BTreeMap::new())
    }
}
