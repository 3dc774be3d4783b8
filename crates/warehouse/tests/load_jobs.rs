use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use tokio::sync::Notify;

use datafeed_core::{AccessPolicy, ObjectUri, StageIdentities, TableRef};
use datafeed_storage::{LandingStore, ObjectInfo, ObjectLandingStore, StorageBackend, StorageError};
use datafeed_warehouse::{
    run_derived, GuardedWarehouse, InnerJoin, JobState, LoadJob, MarkerUpdate, Warehouse, WarehouseError,
};

const DATASET: &str = "census";

const INCOME_CSV: &str = "state,county,median_income\n01,001,58786\n01,003,55962\n01,005,34186\n";
const POPULATION_CSV: &str = "state,county,population\n01,001,55869\n01,003,223234\n02,013,3337\n";

struct Fixture {
    landing: Arc<ObjectLandingStore>,
    warehouse: Arc<Warehouse>,
    as_load: GuardedWarehouse,
    as_join: GuardedWarehouse,
}

fn fixture() -> Fixture {
    let ids = StageIdentities::default();
    let policy = Arc::new(AccessPolicy::least_privilege(&ids, "fetch-requests", "landed-objects", DATASET));
    let warehouse = Arc::new(Warehouse::new(StorageBackend::memory()));
    Fixture {
        landing: Arc::new(ObjectLandingStore::new(StorageBackend::memory())),
        as_load: GuardedWarehouse::new(warehouse.clone(), ids.load.clone(), policy.clone()),
        as_join: GuardedWarehouse::new(warehouse.clone(), ids.join.clone(), policy),
        warehouse,
    }
}

fn uri(name: &str) -> ObjectUri {
    ObjectUri {
        bucket: "landing".into(),
        object_name: name.into(),
    }
}

async fn land(fx: &Fixture, name: &str, body: &str) {
    fx.landing
        .put("landing", name, Bytes::copy_from_slice(body.as_bytes()))
        .await
        .unwrap();
}

async fn load(fx: &Fixture, table: &str, object: &str) -> Result<datafeed_warehouse::LoadOutcome, WarehouseError> {
    LoadJob::new(TableRef::new(DATASET, table), uri(object), Utc::now())
        .run(&fx.as_load, fx.landing.as_ref())
        .await
}

#[tokio::test]
async fn repeated_loads_yield_identical_fingerprint() {
    let fx = fixture();
    land(&fx, "SAIPE", INCOME_CSV).await;

    let mut fingerprints = Vec::new();
    for runs in [1, 2, 5] {
        for _ in 0..runs {
            let outcome = load(&fx, "HOUSEHOLD_INCOME", "SAIPE").await.unwrap();
            assert_eq!(outcome.row_count, 3);
            assert_eq!(outcome.marker, MarkerUpdate::Applied);
        }
        let table = TableRef::new(DATASET, "HOUSEHOLD_INCOME");
        fingerprints.push(fx.warehouse.table_fingerprint(&table).await.unwrap().unwrap());
    }
    assert!(fingerprints.windows(2).all(|w| w[0] == w[1]));

    let marker = fx
        .warehouse
        .marker(&TableRef::new(DATASET, "HOUSEHOLD_INCOME"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(marker.version(), 8);
    assert_eq!(marker.last_success.unwrap().fingerprint, fingerprints[0]);
}

/// Landing store whose first read captures the object, then waits for
/// `release` before returning it.
struct StallFirstRead {
    inner: Arc<ObjectLandingStore>,
    stalled: AtomicBool,
    captured: Notify,
    release: Notify,
}

#[async_trait]
impl LandingStore for StallFirstRead {
    async fn put(&self, bucket: &str, object_name: &str, bytes: Bytes) -> Result<ObjectInfo, StorageError> {
        self.inner.put(bucket, object_name, bytes).await
    }

    async fn get(&self, bucket: &str, object_name: &str) -> Result<Bytes, StorageError> {
        let bytes = self.inner.get(bucket, object_name).await?;
        if !self.stalled.swap(true, Ordering::SeqCst) {
            self.captured.notify_one();
            self.release.notified().await;
        }
        Ok(bytes)
    }

    async fn head(&self, bucket: &str, object_name: &str) -> Result<Option<ObjectInfo>, StorageError> {
        self.inner.head(bucket, object_name).await
    }

    async fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<ObjectInfo>, StorageError> {
        self.inner.list(bucket, prefix).await
    }
}

#[tokio::test]
async fn late_superseded_load_cannot_replace_newer_table() {
    let fx = fixture();
    let table = TableRef::new(DATASET, "HOUSEHOLD_INCOME");
    land(&fx, "SAIPE", INCOME_CSV).await;
    let landing = Arc::new(StallFirstRead {
        inner: fx.landing.clone(),
        stalled: AtomicBool::new(false),
        captured: Notify::new(),
        release: Notify::new(),
    });

    // The older attempt reads the three-row object, then stalls.
    let older = LoadJob::new(table.clone(), uri("SAIPE"), Utc::now());
    let handle = {
        let (job, warehouse, landing) = (older, fx.as_load.clone(), landing.clone());
        tokio::spawn(async move { job.run(&warehouse, landing.as_ref()).await })
    };
    landing.captured.notified().await;

    // New content lands and a newer attempt completes.
    land(&fx, "SAIPE", "state,county,median_income\n01,001,60000\n").await;
    let newer = LoadJob::new(table.clone(), uri("SAIPE"), Utc::now())
        .run(&fx.as_load, landing.as_ref())
        .await
        .unwrap();
    assert_eq!(newer.row_count, 1);
    assert_eq!(newer.marker, MarkerUpdate::Applied);

    landing.release.notify_one();
    let late = handle.await.unwrap().unwrap();
    assert_eq!(late.row_count, 3);
    assert!(matches!(late.marker, MarkerUpdate::Superseded { .. }));

    let marker = fx.warehouse.marker(&table).await.unwrap().unwrap();
    assert_eq!(marker.latest_attempt.job_id, newer.job_id);
    assert_eq!(marker.last_success.unwrap().row_count, 1);
    let snapshot = fx.as_join.read_completed(&table).await.unwrap();
    assert_eq!(snapshot.batch.num_rows(), 1);
    assert_eq!(fx.warehouse.table_fingerprint(&table).await.unwrap(), Some(newer.fingerprint));
}

#[tokio::test]
async fn prefix_load_stacks_every_part_in_name_order() {
    let fx = fixture();
    land(&fx, "county-02", "state,county,median_income\n02,013,71012\n").await;
    land(&fx, "county-01", "state,county,median_income\n01,001,58786\n01,003,55962\n").await;
    let table = TableRef::new(DATASET, "COUNTY_INCOME");
    let source = datafeed_warehouse::LoadSource::Prefix {
        bucket: "landing".into(),
        prefix: "county-".into(),
    };

    let first = LoadJob::new(table.clone(), source.clone(), Utc::now())
        .run(&fx.as_load, fx.landing.as_ref())
        .await
        .unwrap();
    assert_eq!(first.row_count, 3);
    let batch = fx.warehouse.read_table(&table).await.unwrap();
    let county = batch.column(1).as_any().downcast_ref::<arrow::array::Int64Array>().unwrap();
    assert_eq!(county.values().to_vec(), vec![1, 3, 13]);

    let again = LoadJob::new(table.clone(), source, Utc::now())
        .run(&fx.as_load, fx.landing.as_ref())
        .await
        .unwrap();
    assert_eq!(again.fingerprint, first.fingerprint);
}

#[tokio::test]
async fn empty_prefix_is_a_missing_source() {
    let fx = fixture();
    let source = datafeed_warehouse::LoadSource::Prefix {
        bucket: "landing".into(),
        prefix: "county-".into(),
    };
    let err = LoadJob::new(TableRef::new(DATASET, "COUNTY_INCOME"), source, Utc::now())
        .run(&fx.as_load, fx.landing.as_ref())
        .await
        .unwrap_err();
    assert!(matches!(err, WarehouseError::Storage(StorageError::NotFound(_))));
}

#[tokio::test]
async fn malformed_input_fails_every_attempt_and_marks_failed() {
    let fx = fixture();
    land(&fx, "BROKEN", "a,b\n1,2\n3\n").await;

    for _ in 0..2 {
        let err = load(&fx, "BROKEN", "BROKEN").await.unwrap_err();
        assert!(matches!(err, WarehouseError::Malformed(_)));
        assert!(!err.is_retryable());
    }
    let marker = fx.warehouse.marker(&TableRef::new(DATASET, "BROKEN")).await.unwrap().unwrap();
    assert_eq!(marker.latest_attempt.state, JobState::Failed);
    assert!(marker.last_success.is_none());
}

#[tokio::test]
async fn missing_source_object_is_an_error() {
    let fx = fixture();
    let err = load(&fx, "HOUSEHOLD_INCOME", "NOT_THERE").await.unwrap_err();
    assert!(matches!(err, WarehouseError::Storage(_)));
}

#[tokio::test]
async fn derived_join_reads_only_completed_inputs() {
    let fx = fixture();
    land(&fx, "SAIPE", INCOME_CSV).await;
    land(&fx, "POPULATION", POPULATION_CSV).await;

    let income = TableRef::new(DATASET, "HOUSEHOLD_INCOME");
    let population = TableRef::new(DATASET, "POPULATION");
    let derived = TableRef::new(DATASET, "income_with_population");
    let join = InnerJoin::new(vec!["state".into(), "county".into()]);

    load(&fx, "HOUSEHOLD_INCOME", "SAIPE").await.unwrap();
    let err = run_derived(&fx.as_join, "j1", &derived, &[income.clone(), population.clone()], &join)
        .await
        .unwrap_err();
    assert!(matches!(err, WarehouseError::NotReady(_)));

    load(&fx, "POPULATION", "POPULATION").await.unwrap();
    let outcome = run_derived(&fx.as_join, "j2", &derived, &[income.clone(), population.clone()], &join)
        .await
        .unwrap();
    assert_eq!(outcome.row_count, 2);
    assert_eq!(outcome.inputs, vec![(income, 1), (population, 1)]);

    let marker = fx.warehouse.marker(&derived).await.unwrap().unwrap();
    assert!(marker.is_completed());
    assert_eq!(marker.latest_attempt.job_id, "j2");
}

#[tokio::test]
async fn load_identity_cannot_write_landing_through_guard() {
    use datafeed_storage::GuardedLandingStore;

    let ids = StageIdentities::default();
    let policy = Arc::new(AccessPolicy::least_privilege(&ids, "fetch-requests", "landed-objects", DATASET));
    let fx = fixture();
    let guarded = GuardedLandingStore::new(fx.landing.clone(), ids.load.clone(), policy);
    let err = guarded.put("landing", "x", Bytes::from_static(b"1")).await.unwrap_err();
    assert!(matches!(err, StorageError::AccessDenied(_)));
}
