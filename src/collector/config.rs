use std::time::Duration;

use crate::error::{HeraldError, HeraldResult};
use crate::grant::FixedCeilingPolicy;
use crate::store::PersistenceConfig;

/// Configuration for a [`DurableCollector`](super::DurableCollector).
#[derive(Debug, Clone)]
pub struct CollectorConfig {
    /// Longest grant a registration can hold.
    pub max_grant: Duration,
    /// Whether `GrantDuration::Unbounded` yields a grant that never expires.
    pub allow_unbounded: bool,
    /// Period between reaper scans.
    pub reaper_interval: Duration,
    /// Replay worker threads.
    pub replay_workers: usize,
    /// Replays that may wait for a worker.
    pub replay_queue_capacity: usize,
    /// Durable state location. `None` keeps everything in memory.
    pub persistence: Option<PersistenceConfig>,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            max_grant: Duration::from_secs(3600),
            allow_unbounded: true,
            reaper_interval: Duration::from_secs(5),
            replay_workers: 2,
            replay_queue_capacity: 1024,
            persistence: None,
        }
    }
}

impl CollectorConfig {
    /// In-memory defaults with persistence under `data_dir`.
    #[must_use]
    pub fn persistent(data_dir: impl Into<std::path::PathBuf>) -> Self {
        Self {
            persistence: Some(PersistenceConfig::new(data_dir)),
            ..Self::default()
        }
    }

    /// Validate configuration values.
    ///
    /// # Errors
    /// `InvalidConfig` on a zero ceiling, zero reaper interval or an invalid
    /// persistence section.
    pub fn validate(mut self) -> HeraldResult<Self> {
        if self.max_grant.is_zero() {
            return Err(HeraldError::InvalidConfig {
                reason: "max_grant must be > 0".to_string(),
            });
        }
        if self.reaper_interval.is_zero() {
            return Err(HeraldError::InvalidConfig {
                reason: "reaper_interval must be > 0".to_string(),
            });
        }
        if self.replay_workers == 0 {
            return Err(HeraldError::InvalidConfig {
                reason: "replay_workers must be >= 1".to_string(),
            });
        }
        if self.replay_queue_capacity == 0 {
            return Err(HeraldError::InvalidConfig {
                reason: "replay_queue_capacity must be >= 1".to_string(),
            });
        }
        self.persistence = self.persistence.map(PersistenceConfig::validate).transpose()?;
        Ok(self)
    }

    pub(crate) fn policy(&self) -> FixedCeilingPolicy {
        let policy = FixedCeilingPolicy::new(self.max_grant);
        if self.allow_unbounded {
            policy.allowing_unbounded()
        } else {
            policy
        }
    }
}
