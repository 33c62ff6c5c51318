use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;

use crate::engine::{Engine, OverlapPolicy};
use crate::limits::*;
use crate::notify::NotifyHub;
use crate::sweeper;
use crate::trigger::{self, RetryPolicy};

/// Per-venue engine settings shared by every venue a manager opens.
#[derive(Debug, Clone, Copy)]
pub struct VenueOptions {
    pub compact_threshold: u64,
    pub overlap_policy: OverlapPolicy,
    pub award_retry: RetryPolicy,
    pub sweep_every: Duration,
}

impl Default for VenueOptions {
    fn default() -> Self {
        Self {
            compact_threshold: 1000,
            overlap_policy: OverlapPolicy::Enforce,
            award_retry: RetryPolicy::default(),
            sweep_every: Duration::from_secs(30),
        }
    }
}

/// Manages per-venue engines. Each venue gets its own Engine + WAL + award
/// trigger + sweeper + compactor. Venue = database name from the pgwire
/// connection.
pub struct VenueManager {
    engines: DashMap<String, Arc<Engine>>,
    data_dir: PathBuf,
    options: VenueOptions,
}

impl VenueManager {
    pub fn new(data_dir: PathBuf, options: VenueOptions) -> Self {
        Self {
            engines: DashMap::new(),
            data_dir,
            options,
        }
    }

    /// Get or lazily open the engine for `venue`, replaying its WAL.
    ///
    /// Engines are keyed by the sanitized file stem, so names that map to the
    /// same WAL file share one engine.
    pub fn get_or_create(&self, venue: &str) -> std::io::Result<Arc<Engine>> {
        if venue.len() > MAX_VENUE_NAME_LEN {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "venue name too long",
            ));
        }
        // Only a plain file stem may reach the filesystem.
        let safe_name: String = venue
            .chars()
            .filter(|c| c.is_alphanumeric() || *c == '_' || *c == '-')
            .collect();
        if safe_name.is_empty() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "empty venue name",
            ));
        }
        if let Some(engine) = self.engines.get(&safe_name) {
            return Ok(engine.value().clone());
        }
        if self.engines.len() >= MAX_VENUES {
            return Err(std::io::Error::other("too many venues"));
        }

        // Two first connections may race here; the entry API keeps one engine.
        let entry = self.engines.entry(safe_name.clone());
        if let dashmap::mapref::entry::Entry::Occupied(existing) = &entry {
            return Ok(existing.get().clone());
        }
        let wal_path = self.data_dir.join(format!("{safe_name}.wal"));
        let notify = Arc::new(NotifyHub::new());
        let engine = Arc::new(Engine::new(wal_path, notify, self.options.overlap_policy)?);

        tokio::spawn(trigger::run_award_trigger(engine.clone(), self.options.award_retry));
        tokio::spawn(sweeper::run_sweeper(
            engine.clone(),
            self.options.sweep_every,
            self.options.award_retry,
        ));
        tokio::spawn(sweeper::run_compactor(engine.clone(), self.options.compact_threshold));

        entry.or_insert(engine.clone());
        metrics::gauge!(crate::observability::VENUES_ACTIVE).set(self.engines.len() as f64);
        tracing::info!("opened venue {venue} ({})", self.options.overlap_policy.label());
        Ok(engine)
    }
}
