//! perfgrid-stats — performance profiling and load-aware worker selection.
//!
//! Learns how fast each worker processes requests of a given size and uses
//! those estimates to route new requests. Observations are folded into
//! per-worker profiles (EMA per size bucket) and a fleet-wide aggregate
//! profile that answers for workers with no data of their own.
//!
//! # Architecture
//!
//! ```text
//! StatsRegistry
//!   ├── ProfileTable (mutex; never held across I/O)
//!   │   ├── WorkerProfile per worker key
//!   │   │   └── SmoothedMetric per size bucket
//!   │   └── WorkerProfile aggregate ("<all>")
//!   ├── WriteBehind  : DedupQueue of snapshots → ProfileStore::put_profiles
//!   └── Hydrator     : DedupQueue of keys → ProfileStore::get_profile → table
//! ```
//!
//! Without a store the registry runs purely in memory and never persists.
//!
//! # Selection
//!
//! Candidates are ranked by estimated per-token cost. A power-skewed random
//! draw then favours the best rank while still sending occasional traffic to
//! the others, so stale estimates get refreshed.

pub mod config;
pub mod error;
pub mod metric;
pub mod pipeline;
pub mod profile;
pub mod queue;
pub mod registry;

pub use config::{PipelineConfig, StatsConfig};
pub use error::{StatsError, StatsResult};
pub use metric::SmoothedMetric;
pub use pipeline::{Hydrator, ProfileSink, WriteBehind};
pub use profile::{ProfileParams, Usage, WorkerProfile, size_bucket, validate_size};
pub use queue::DedupQueue;
pub use registry::{AGGREGATE_KEY, StatsRegistry, skewed_pick};
