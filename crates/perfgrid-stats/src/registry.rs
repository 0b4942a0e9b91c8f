//! Stats registry: per-worker profiles and worker selection.
//!
//! The registry is the only component callers talk to. It owns one
//! [`WorkerProfile`] per worker key plus the fleet-wide aggregate profile,
//! all behind a single mutex that is only ever held for in-memory work.
//!
//! # Lazy hydration
//!
//! The first `record` or `estimate` for an unknown key creates a zeroed
//! profile and schedules a load of the persisted record. The load is applied
//! only if the profile is still empty when it arrives: observations made in
//! memory in the meantime win over the stored snapshot.
//!
//! # Selection
//!
//! `select` ranks candidates by ascending estimate and then draws
//! `u ∈ [0, 1)`, picking rank `floor(max(u^p − 0.5, 0) · 2n)`. With the
//! default `p = 2` the best-ranked worker wins with probability
//! `sqrt(0.5 + 1/(2n))` (about 87% for two candidates, tending to 71% as `n`
//! grows) while every other worker keeps a small chance, so slow-looking
//! workers are re-measured instead of starved.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info, trace};

use perfgrid_state::{ProfileRecord, ProfileStore};

use crate::config::StatsConfig;
use crate::error::{StatsError, StatsResult};
use crate::pipeline::{Hydrator, ProfileSink, WriteBehind};
use crate::profile::{ProfileParams, Usage, WorkerProfile, validate_observation, validate_size};

/// Store key of the aggregate profile. Reserved: never a worker key.
pub const AGGREGATE_KEY: &str = "<all>";

struct ProfileTable {
    params: ProfileParams,
    profiles: HashMap<String, WorkerProfile>,
    aggregate: WorkerProfile,
    /// Unknown workers whose load was requested by `punish`. Their profile is
    /// created when a stored record arrives.
    awaiting: HashSet<String>,
}

impl ProfileTable {
    /// Get the profile for `key`, creating an empty one if needed.
    ///
    /// The flag is `true` when the profile was just created.
    fn entry(&mut self, key: &str) -> (&mut WorkerProfile, bool) {
        let params = self.params;
        let mut created = false;
        let profile = self
            .profiles
            .entry(key.to_string())
            .or_insert_with(|| {
                created = true;
                WorkerProfile::new(params)
            });
        (profile, created)
    }
}

/// Profile table shared between callers and the read loop.
struct SharedTable(Mutex<ProfileTable>);

impl SharedTable {
    fn lock(&self) -> MutexGuard<'_, ProfileTable> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ProfileSink for SharedTable {
    fn hydrate(&self, key: &str, record: Option<ProfileRecord>) {
        let mut guard = self.lock();
        let table = &mut *guard;
        let awaited = table.awaiting.remove(key);
        let Some(record) = record else {
            debug!(%key, "no persisted profile, starting fresh");
            return;
        };

        let profile = if key == AGGREGATE_KEY {
            &mut table.aggregate
        } else if awaited {
            table.entry(key).0
        } else if let Some(profile) = table.profiles.get_mut(key) {
            profile
        } else {
            debug!(%key, "worker dropped before its load arrived, snapshot ignored");
            return;
        };
        if profile.restore(&record) {
            info!(%key, samples = record.sample_count, "profile hydrated from store");
        } else {
            debug!(%key, "profile already has in-memory data, stored snapshot ignored");
        }
    }
}

pub struct StatsRegistry {
    config: StatsConfig,
    table: Arc<SharedTable>,
    writer: Option<WriteBehind>,
    loader: Option<Hydrator>,
    rng: Mutex<StdRng>,
}

impl StatsRegistry {
    /// In-memory registry: nothing is loaded or persisted.
    pub fn new(config: StatsConfig) -> StatsResult<Self> {
        config.validate()?;
        let params = config.profile_params();
        Ok(Self {
            table: Arc::new(SharedTable(Mutex::new(ProfileTable {
                params,
                profiles: HashMap::new(),
                aggregate: WorkerProfile::new(params),
                awaiting: HashSet::new(),
            }))),
            writer: None,
            loader: None,
            rng: Mutex::new(StdRng::from_entropy()),
            config,
        })
    }

    /// Registry backed by `store`.
    ///
    /// Spawns the write and read loops on the current tokio runtime and
    /// schedules a load of the aggregate profile.
    pub fn with_store(config: StatsConfig, store: Arc<dyn ProfileStore>) -> StatsResult<Self> {
        let mut registry = Self::new(config)?;
        let pipeline = registry.config.pipeline.clone();

        let sink: Arc<dyn ProfileSink> = registry.table.clone();
        registry.loader = Some(Hydrator::spawn(store.clone(), sink, pipeline.clone()));
        registry.writer = Some(WriteBehind::spawn(store, pipeline));
        registry.schedule_load(AGGREGATE_KEY);

        info!(alpha = registry.config.alpha, "stats registry started with persistence");
        Ok(registry)
    }

    /// Use a fixed RNG seed for reproducible selection.
    pub fn with_seed(self, seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            ..self
        }
    }

    pub fn config(&self) -> &StatsConfig {
        &self.config
    }

    fn schedule_load(&self, key: &str) {
        if let Some(loader) = &self.loader {
            loader.schedule(key);
        }
    }

    /// Fold a completed request into the worker's and the aggregate profile,
    /// then queue both snapshots for persistence.
    ///
    /// Snapshots are enqueued while the table lock is held, so the queue sees
    /// them in the same order the profiles changed.
    pub fn record(
        &self,
        key: &str,
        size: f64,
        usage: &Usage,
        elapsed: Duration,
    ) -> StatsResult<()> {
        if key == AGGREGATE_KEY {
            return Err(StatsError::InvalidObservation(format!(
                "{AGGREGATE_KEY} is reserved for the aggregate profile"
            )));
        }
        validate_observation(size, usage)?;

        let created = {
            let mut table = self.table.lock();
            let (profile, created) = table.entry(key);
            profile.bump(size, usage, elapsed)?;
            let worker = profile.to_record();
            table.aggregate.bump(size, usage, elapsed)?;
            if let Some(writer) = &self.writer {
                writer.enqueue(key, worker);
                writer.enqueue(AGGREGATE_KEY, table.aggregate.to_record());
            }
            created
        };

        if created {
            self.schedule_load(key);
        }
        trace!(%key, size, tokens = usage.total_tokens, ?elapsed, "observation recorded");
        Ok(())
    }

    /// Estimated per-token cost of running `size` on worker `key`.
    ///
    /// Falls back to the aggregate when the worker has no data, and to `0`
    /// when even the aggregate is empty. Sizes that are not positive and
    /// finite are rejected.
    pub fn estimate(&self, key: &str, size: f64) -> StatsResult<f64> {
        validate_size(size)?;
        let (estimate, created) = {
            let mut table = self.table.lock();
            if key == AGGREGATE_KEY {
                (table.aggregate.estimate(size), false)
            } else {
                let (profile, created) = table.entry(key);
                let own = profile.estimate(size);
                (own.or_else(|| table.aggregate.estimate(size)), created)
            }
        };
        if created {
            self.schedule_load(key);
        }
        Ok(estimate.unwrap_or(0.0))
    }

    /// Candidates as `(index, estimate)`, cheapest first.
    ///
    /// Ties keep their input order.
    pub fn rank<S: AsRef<str>>(
        &self,
        candidates: &[S],
        size: f64,
    ) -> StatsResult<Vec<(usize, f64)>> {
        let mut ranked = candidates
            .iter()
            .enumerate()
            .map(|(i, key)| Ok((i, self.estimate(key.as_ref(), size)?)))
            .collect::<StatsResult<Vec<(usize, f64)>>>()?;
        ranked.sort_by(|a, b| a.1.total_cmp(&b.1));
        Ok(ranked)
    }

    /// Pick a worker for a job of `size`; returns an index into `candidates`.
    ///
    /// Returns `None` only when `candidates` is empty.
    pub fn select<S: AsRef<str>>(
        &self,
        candidates: &[S],
        size: f64,
    ) -> StatsResult<Option<usize>> {
        let ranked = self.rank(candidates, size)?;
        if ranked.is_empty() {
            return Ok(None);
        }
        let u: f64 = self
            .rng
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .gen_range(0.0..1.0);
        let pick = skewed_pick(u, ranked.len(), self.config.selection_power);
        trace!(rank = pick, of = ranked.len(), "worker selected");
        Ok(Some(ranked[pick].0))
    }

    /// Put worker `key` in cooldown for `duration`.
    ///
    /// Unknown workers are left alone, but their stored profile is scheduled
    /// for loading.
    pub fn punish(&self, key: &str, duration: Duration) {
        let punished = {
            let mut table = self.table.lock();
            match table.profiles.get_mut(key) {
                Some(profile) => {
                    profile.punish(duration);
                    true
                }
                None => {
                    if self.loader.is_some() && key != AGGREGATE_KEY {
                        table.awaiting.insert(key.to_string());
                    }
                    false
                }
            }
        };
        if punished {
            debug!(%key, ?duration, "worker punished");
        } else if key != AGGREGATE_KEY {
            debug!(%key, "punish ignored for unknown worker");
            self.schedule_load(key);
        }
    }

    /// Punish with the configured default cooldown.
    pub fn punish_default(&self, key: &str) {
        self.punish(key, self.config.punish_duration());
    }

    /// Forget worker `key` in memory. Persisted state is untouched.
    pub fn drop_worker(&self, key: &str) -> bool {
        let removed = {
            let mut table = self.table.lock();
            table.awaiting.remove(key);
            table.profiles.remove(key).is_some()
        };
        if removed {
            info!(%key, "worker profile dropped");
        }
        removed
    }

    /// Observations folded into worker `key` (0 if unknown).
    pub fn samples(&self, key: &str) -> u64 {
        self.table
            .lock()
            .profiles
            .get(key)
            .map_or(0, WorkerProfile::sample_count)
    }

    pub fn profile(&self, key: &str) -> Option<WorkerProfile> {
        self.table.lock().profiles.get(key).cloned()
    }

    pub fn aggregate(&self) -> WorkerProfile {
        self.table.lock().aggregate.clone()
    }

    /// Keys of every worker with an in-memory profile, sorted.
    pub fn workers(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.table.lock().profiles.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Wait until every queued snapshot has reached the store.
    pub async fn flush(&self) {
        if let Some(writer) = &self.writer {
            writer.flush().await;
        }
    }

    /// Wait until every scheduled load has been applied.
    pub async fn wait_loaded(&self) {
        if let Some(loader) = &self.loader {
            loader.wait_idle().await;
        }
    }

    /// Stop the write loop after it drained everything queued so far.
    pub async fn stop(&mut self) {
        if let Some(writer) = &mut self.writer {
            writer.stop().await;
            info!("stats registry persistence stopped");
        }
    }
}

/// Rank picked for a uniform draw `u ∈ [0, 1)` among `len` candidates.
///
/// `floor(max(u^power − 0.5, 0) · 2 · len)`, clamped to the last rank.
pub fn skewed_pick(u: f64, len: usize, power: i32) -> usize {
    if len == 0 {
        return 0;
    }
    let skew = (u.powi(power) - 0.5).max(0.0);
    ((skew * (len * 2) as f64) as usize).min(len - 1)
}
