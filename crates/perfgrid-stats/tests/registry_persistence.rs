//! End-to-end persistence: observations written by one registry are picked
//! up by the next one over the same redb file.

use std::sync::{Arc, Once};
use std::time::Duration;

use perfgrid_state::{ProfileStore, StateStore};
use perfgrid_stats::{AGGREGATE_KEY, StatsConfig, StatsRegistry, Usage, WriteBehind};

static TRACING_INIT: Once = Once::new();

fn init_tracing() {
    TRACING_INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init()
            .ok();
    });
}

fn observe(stats: &StatsRegistry, key: &str, size: f64, tokens: u64, secs: f64) {
    stats
        .record(key, size, &Usage::new(tokens), Duration::from_secs_f64(secs))
        .unwrap();
}

#[tokio::test]
async fn restarted_registry_sees_previous_profiles() {
    init_tracing();

    let dir = tempfile::tempdir().unwrap();
    let store = StateStore::open(&dir.path().join("stats.redb")).unwrap();

    let mut first =
        StatsRegistry::with_store(StatsConfig::default(), Arc::new(store.clone())).unwrap();
    observe(&first, "gpu-a", 1000.0, 500, 5.0);
    observe(&first, "gpu-a", 1000.0, 500, 10.0);
    observe(&first, "gpu-b", 4000.0, 2000, 8.0);

    let gpu_a = first.estimate("gpu-a", 1000.0).unwrap();
    let gpu_b = first.estimate("gpu-b", 4000.0).unwrap();
    let fleet = first.estimate("gpu-c", 1000.0).unwrap();
    first.stop().await;
    drop(first);

    let mut second =
        StatsRegistry::with_store(StatsConfig::default(), Arc::new(store.clone())).unwrap();
    second.wait_loaded().await;
    assert_eq!(second.aggregate().sample_count(), 3);
    assert_eq!(second.estimate("gpu-c", 1000.0).unwrap(), fleet);

    // Touch the workers so their loads get scheduled.
    second.estimate("gpu-a", 1000.0).unwrap();
    second.estimate("gpu-b", 4000.0).unwrap();
    second.wait_loaded().await;

    assert_eq!(second.samples("gpu-a"), 2);
    assert_eq!(second.samples("gpu-b"), 1);
    assert_eq!(second.estimate("gpu-a", 1000.0).unwrap(), gpu_a);
    assert_eq!(second.estimate("gpu-b", 4000.0).unwrap(), gpu_b);

    let ranked = second.rank(&["gpu-a", "gpu-b"], 1000.0).unwrap();
    assert!(ranked[0].1 <= ranked[1].1);

    second.stop().await;
}

#[tokio::test]
async fn snapshots_survive_reopening_the_file() {
    init_tracing();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("stats.redb");

    {
        let store: Arc<dyn ProfileStore> = Arc::new(StateStore::open(&path).unwrap());
        let stats = StatsRegistry::new(StatsConfig::default()).unwrap();
        observe(&stats, "w1", 1000.0, 500, 5.0);

        let mut writer = WriteBehind::spawn(store, StatsConfig::default().pipeline);
        writer.enqueue("w1", stats.profile("w1").unwrap().to_record());
        writer.enqueue(AGGREGATE_KEY, stats.aggregate().to_record());
        writer.stop().await;
    }

    let reopened = StateStore::open(&path).unwrap();
    assert_eq!(reopened.len().unwrap(), 2);
    let record = reopened.get_profile("w1").unwrap().unwrap();
    assert_eq!(record.sample_count, 1);
    assert_eq!(record.bucket_values.get(&32), Some(&0.01));
}
