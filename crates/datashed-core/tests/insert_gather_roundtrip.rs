//! End-to-end tests over an in-memory object store: insert/gather
//! round-trips, registry fallback, cutoff selection, and the public error
//! taxonomy.

use std::collections::BTreeMap;
use std::sync::{Arc, Once};

use arrow::array::{Array, BooleanArray, Float64Array, Int64Array, StringArray, TimestampSecondArray};
use arrow::datatypes::{DataType, Field, Schema, TimeUnit};
use arrow::record_batch::RecordBatch;
use chrono::{DateTime, TimeZone, Utc};

use datashed_core::cache::FileCache;
use datashed_core::codec::{self, Compression, FileFormat};
use datashed_core::config::{self, Config};
use datashed_core::error::Error;
use datashed_core::gather::GatherOptions;
use datashed_core::insert::InsertOptions;
use datashed_core::metadata::{DatasetIndex, PartitionSize};
use datashed_core::object_store::{MemoryStore, ObjectStore};
use datashed_core::warehouse::Warehouse;

type TestResult = Result<(), Box<dyn std::error::Error>>;

static SETUP: Once = Once::new();

/// Install one configuration for the whole test binary: every store the
/// tests below address, on top of the built-in centralized list.
fn setup() {
    SETUP.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
        let mut cfg = Config::default();
        cfg.additional_stores = vec![
            ("research".to_string(), "ffs:s3://research-it/v1".to_string()),
            ("feeds-test".to_string(), "s3db:s3://feeds-test".to_string()),
        ];
        config::install(cfg);
    });
}

fn warehouse() -> (Arc<MemoryStore>, Warehouse) {
    setup();
    let memory = Arc::new(MemoryStore::new());
    let adapter: Arc<dyn ObjectStore> = memory.clone();
    let cache = Arc::new(FileCache::ephemeral(100_000_000).expect("ephemeral cache"));
    (memory, Warehouse::with_cache(adapter, cache))
}

fn utc(y: i32, m: u32, d: u32, h: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, m, d, h, 0, 0).single().expect("valid instant")
}

fn zoned_ts_field(name: &str) -> Field {
    Field::new(
        name,
        DataType::Timestamp(TimeUnit::Second, Some("UTC".into())),
        false,
    )
}

fn ts_batch(instants: &[DateTime<Utc>]) -> RecordBatch {
    let schema = Arc::new(Schema::new(vec![zoned_ts_field("ts")]));
    let seconds: Vec<i64> = instants.iter().map(DateTime::timestamp).collect();
    RecordBatch::try_new(
        schema,
        vec![Arc::new(TimestampSecondArray::from(seconds).with_timezone("UTC"))],
    )
    .expect("valid batch")
}

fn ts_index() -> InsertOptions {
    InsertOptions {
        index: Some(DatasetIndex::TimeSeries {
            key: "ts".to_string(),
            partition_size: PartitionSize::Day,
        }),
        ..InsertOptions::default()
    }
}

fn gathered_seconds(batch: &RecordBatch) -> Vec<i64> {
    let ts = batch
        .column(0)
        .as_any()
        .downcast_ref::<TimestampSecondArray>()
        .expect("zoned timestamps");
    (0..ts.len()).map(|i| ts.value(i)).collect()
}

#[tokio::test]
async fn insert_then_gather_sorts_and_dedups() -> TestResult {
    let (_, wh) = warehouse();

    // One duplicate row and out-of-order input.
    let rows = ts_batch(&[
        utc(2021, 1, 1, 1),
        utc(2021, 1, 1, 2),
        utc(2021, 1, 2, 1),
        utc(2021, 1, 1, 1),
    ]);
    wh.insert("research", "it_roundtrip", "load", &rows, &ts_index())
        .await?;

    let gathered = wh
        .gather(
            "it_roundtrip",
            "load",
            utc(2021, 1, 1, 0),
            utc(2021, 1, 2, 23),
            Some("research"),
            &GatherOptions::default(),
        )
        .await?;

    assert_eq!(
        gathered_seconds(&gathered.batch),
        vec![
            utc(2021, 1, 1, 1).timestamp(),
            utc(2021, 1, 1, 2).timestamp(),
            utc(2021, 1, 2, 1).timestamp(),
        ]
    );
    assert_eq!(gathered.descriptor.index_key(), "ts");
    assert_eq!(gathered.descriptor.file_format, FileFormat::Csv);
    Ok(())
}

#[tokio::test]
async fn repeated_inserts_merge_to_the_sorted_deduped_union() -> TestResult {
    let (_, wh) = warehouse();

    let t1 = ts_batch(&[utc(2021, 3, 1, 5), utc(2021, 3, 2, 5)]);
    let t2 = ts_batch(&[utc(2021, 3, 1, 5), utc(2021, 3, 1, 9), utc(2021, 3, 3, 5)]);
    wh.insert("research", "it_union", "load", &t1, &ts_index()).await?;
    wh.insert("research", "it_union", "load", &t2, &ts_index()).await?;
    // Idempotence: replaying an insert changes nothing.
    wh.insert("research", "it_union", "load", &t2, &ts_index()).await?;

    let gathered = wh
        .gather(
            "it_union",
            "load",
            utc(2021, 3, 1, 0),
            utc(2021, 3, 3, 23),
            Some("research"),
            &GatherOptions::default(),
        )
        .await?;

    assert_eq!(
        gathered_seconds(&gathered.batch),
        vec![
            utc(2021, 3, 1, 5).timestamp(),
            utc(2021, 3, 1, 9).timestamp(),
            utc(2021, 3, 2, 5).timestamp(),
            utc(2021, 3, 3, 5).timestamp(),
        ]
    );
    Ok(())
}

#[tokio::test]
async fn multi_column_roundtrip_preserves_values_and_order() -> TestResult {
    let (_, wh) = warehouse();

    let schema = Arc::new(Schema::new(vec![
        zoned_ts_field("ts"),
        Field::new("node", DataType::Utf8, false),
        Field::new("price", DataType::Float64, false),
    ]));
    let base = utc(2021, 6, 1, 0);
    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(
                TimestampSecondArray::from(vec![
                    base.timestamp() + 3600,
                    base.timestamp() + 3600,
                    base.timestamp() + 7200,
                ])
                .with_timezone("UTC"),
            ),
            Arc::new(StringArray::from(vec!["b", "a", "a"])),
            Arc::new(Float64Array::from(vec![2.5, 1.5, 3.5])),
        ],
    )?;

    wh.insert("research", "it_multi", "prices", &batch, &ts_index())
        .await?;

    let gathered = wh
        .gather(
            "it_multi",
            "prices",
            base,
            utc(2021, 6, 1, 23),
            Some("research"),
            &GatherOptions {
                workers: Some(1),
                ..GatherOptions::default()
            },
        )
        .await?;

    // Lexicographic over (ts, node, price): the two rows at +3600 order by
    // node.
    let nodes = gathered
        .batch
        .column(1)
        .as_any()
        .downcast_ref::<StringArray>()
        .expect("nodes");
    let prices = gathered
        .batch
        .column(2)
        .as_any()
        .downcast_ref::<Float64Array>()
        .expect("prices");
    assert_eq!(
        (0..3).map(|i| nodes.value(i)).collect::<Vec<_>>(),
        vec!["a", "b", "a"]
    );
    assert_eq!(prices.values(), &[1.5, 2.5, 3.5]);
    Ok(())
}

#[tokio::test]
async fn include_and_exclude_predicates_filter_rows() -> TestResult {
    let (_, wh) = warehouse();

    let schema = Arc::new(Schema::new(vec![
        zoned_ts_field("ts"),
        Field::new("node", DataType::Utf8, false),
    ]));
    let base = utc(2021, 7, 1, 0);
    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(
                TimestampSecondArray::from(vec![
                    base.timestamp() + 1,
                    base.timestamp() + 2,
                    base.timestamp() + 3,
                ])
                .with_timezone("UTC"),
            ),
            Arc::new(StringArray::from(vec!["a", "b", "a"])),
        ],
    )?;
    wh.insert("research", "it_pred", "load", &batch, &ts_index())
        .await?;

    let keep_a: datashed_core::gather::RowPredicate = Arc::new(|batch: &RecordBatch| {
        let nodes = batch
            .column_by_name("node")
            .and_then(|c| c.as_any().downcast_ref::<StringArray>().cloned())
            .expect("node column");
        Ok(BooleanArray::from(
            (0..nodes.len()).map(|i| nodes.value(i) == "a").collect::<Vec<_>>(),
        ))
    });

    let gathered = wh
        .gather(
            "it_pred",
            "load",
            base,
            utc(2021, 7, 1, 23),
            Some("research"),
            &GatherOptions {
                include: Some(keep_a.clone()),
                ..GatherOptions::default()
            },
        )
        .await?;
    assert_eq!(gathered.batch.num_rows(), 2);

    let gathered = wh
        .gather(
            "it_pred",
            "load",
            base,
            utc(2021, 7, 1, 23),
            Some("research"),
            &GatherOptions {
                exclude: Some(keep_a),
                ..GatherOptions::default()
            },
        )
        .await?;
    assert_eq!(gathered.batch.num_rows(), 1);
    Ok(())
}

#[tokio::test]
async fn gather_without_store_id_falls_back_through_the_registry() -> TestResult {
    let (_, wh) = warehouse();

    let rows = ts_batch(&[utc(2021, 2, 1, 1)]);
    wh.insert("research", "it_fallback", "load", &rows, &ts_index())
        .await?;

    // No store id: the centralized stores come first, hold nothing in this
    // adapter, and the walk lands on the additional store.
    let gathered = wh
        .gather(
            "it_fallback",
            "load",
            utc(2021, 2, 1, 0),
            utc(2021, 2, 1, 23),
            None,
            &GatherOptions::default(),
        )
        .await?;
    assert_eq!(gathered.batch.num_rows(), 1);

    let err = wh
        .gather(
            "it_fallback",
            "nowhere",
            utc(2021, 2, 1, 0),
            utc(2021, 2, 1, 23),
            None,
            &GatherOptions::default(),
        )
        .await
        .expect_err("no store has it");
    assert!(err.is_missing_data());
    Ok(())
}

#[tokio::test]
async fn cutoff_selection_honors_release_ordering() -> TestResult {
    let (memory, wh) = warehouse();

    // A read-only archive partition, stored the way the archive stores it:
    // CSV+gzip, day partition of target_start, unix-second integers.
    let target_start = utc(2021, 5, 1, 10);
    let (r1, r2, r3) = (
        utc(2021, 4, 28, 0).timestamp(),
        utc(2021, 4, 29, 0).timestamp(),
        utc(2021, 4, 30, 0).timestamp(),
    );
    let schema = Arc::new(Schema::new(vec![
        Field::new("release_date", DataType::Int64, false),
        Field::new("target_start", DataType::Int64, false),
        Field::new("target_end", DataType::Int64, false),
        Field::new("node_name", DataType::Utf8, false),
        Field::new("tag", DataType::Utf8, false),
    ]));
    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(Int64Array::from(vec![r1, r2, r3])),
            Arc::new(Int64Array::from(vec![target_start.timestamp(); 3])),
            Arc::new(Int64Array::from(vec![target_start.timestamp() + 3600; 3])),
            Arc::new(StringArray::from(vec!["n1"; 3])),
            Arc::new(StringArray::from(vec!["t1", "t2", "t3"])),
        ],
    )?;

    memory.seed(
        "feeds-test",
        "fc/prices/METADATA.json",
        serde_json::to_vec(&serde_json::json!({
            "column_order": ["release_date", "target_start", "target_end", "node_name", "tag"],
            "timezone": "UTC",
            "details": {
                "superkey": "release_date,target_start,target_end,node_name,tag"
            }
        }))?,
    );
    let day = utc(2021, 5, 1, 0).timestamp();
    memory.seed(
        "feeds-test",
        format!("fc/prices/year=2021/{day}.csv.gz").as_str(),
        codec::encode_batch(&batch, FileFormat::Csv, Some(Compression::Gz))?,
    );

    let wh = &wh;
    let released_at = |cutoff: DateTime<Utc>| async move {
        wh.gather(
            "fc",
            "prices",
            utc(2021, 5, 1, 0),
            utc(2021, 5, 1, 23),
            Some("feeds-test"),
            &GatherOptions {
                cutoff: Some(cutoff),
                ..GatherOptions::default()
            },
        )
        .await
    };

    // Cutoff between r1 and r2: the r1 release wins.
    let gathered = released_at(utc(2021, 4, 28, 12)).await?;
    assert_eq!(gathered.batch.num_rows(), 1);
    let dates = gathered
        .batch
        .column(0)
        .as_any()
        .downcast_ref::<Int64Array>()
        .expect("release dates");
    assert_eq!(dates.value(0), r1);

    // Cutoff at/after r3: the r3 release wins.
    let gathered = released_at(utc(2021, 5, 2, 0)).await?;
    let dates = gathered
        .batch
        .column(0)
        .as_any()
        .downcast_ref::<Int64Array>()
        .expect("release dates");
    assert_eq!(dates.value(0), r3);

    // Cutoff before every release: nothing survives.
    let err = released_at(utc(2021, 4, 27, 0)).await.expect_err("all too new");
    assert!(err.is_missing_data());
    Ok(())
}

#[tokio::test]
async fn cutoff_walk_skips_writable_stores() -> TestResult {
    let (memory, wh) = warehouse();

    // One release in the read-only archive, which ranks *behind* three
    // writable stores in the registry. A registry-wide cutoff gather must
    // pass over the writable stores (they hold no releases) and land here
    // instead of failing on the first writable store in rank order.
    let target_start = utc(2021, 5, 10, 10);
    let release = utc(2021, 5, 8, 0).timestamp();
    let schema = Arc::new(Schema::new(vec![
        Field::new("release_date", DataType::Int64, false),
        Field::new("target_start", DataType::Int64, false),
        Field::new("node_name", DataType::Utf8, false),
        Field::new("tag", DataType::Utf8, false),
    ]));
    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(Int64Array::from(vec![release])),
            Arc::new(Int64Array::from(vec![target_start.timestamp()])),
            Arc::new(StringArray::from(vec!["n1"])),
            Arc::new(StringArray::from(vec!["t1"])),
        ],
    )?;

    memory.seed(
        "feeds-test",
        "fcwalk/prices/METADATA.json",
        serde_json::to_vec(&serde_json::json!({
            "column_order": ["release_date", "target_start", "node_name", "tag"],
            "timezone": "UTC",
            "details": {
                "superkey": "release_date,target_start,node_name,tag"
            }
        }))?,
    );
    let day = utc(2021, 5, 10, 0).timestamp();
    memory.seed(
        "feeds-test",
        format!("fcwalk/prices/year=2021/{day}.csv.gz").as_str(),
        codec::encode_batch(&batch, FileFormat::Csv, Some(Compression::Gz))?,
    );

    let gathered = wh
        .gather(
            "fcwalk",
            "prices",
            utc(2021, 5, 10, 0),
            utc(2021, 5, 10, 23),
            None,
            &GatherOptions {
                cutoff: Some(utc(2021, 5, 9, 0)),
                ..GatherOptions::default()
            },
        )
        .await?;
    assert_eq!(gathered.batch.num_rows(), 1);
    Ok(())
}

#[tokio::test]
async fn cutoff_against_a_writable_archive_is_an_argument_error() -> TestResult {
    let (_, wh) = warehouse();

    let rows = ts_batch(&[utc(2021, 8, 1, 1)]);
    wh.insert("research", "it_cutoff", "load", &rows, &ts_index())
        .await?;

    let err = wh
        .gather(
            "it_cutoff",
            "load",
            utc(2021, 8, 1, 0),
            utc(2021, 8, 1, 23),
            Some("research"),
            &GatherOptions {
                cutoff: Some(utc(2021, 8, 2, 0)),
                ..GatherOptions::default()
            },
        )
        .await
        .expect_err("cutoff on writable");
    assert!(matches!(err, Error::Argument { .. }));
    Ok(())
}

#[tokio::test]
async fn empty_input_and_read_only_targets_are_schema_errors() -> TestResult {
    let (_, wh) = warehouse();

    let empty = RecordBatch::new_empty(Arc::new(Schema::new(vec![zoned_ts_field("ts")])));
    let err = wh
        .insert("research", "it_schema", "load", &empty, &ts_index())
        .await
        .expect_err("empty input");
    assert!(matches!(err, Error::Schema { .. }));

    let rows = ts_batch(&[utc(2021, 9, 1, 1)]);
    let err = wh
        .insert("feeds-test", "it_schema", "load", &rows, &ts_index())
        .await
        .expect_err("read-only target");
    assert!(matches!(err, Error::Schema { .. }));
    Ok(())
}

#[tokio::test]
async fn unzoned_index_column_is_a_schema_error() -> TestResult {
    let (_, wh) = warehouse();

    let schema = Arc::new(Schema::new(vec![Field::new("ts", DataType::Int64, false)]));
    let batch = RecordBatch::try_new(
        schema,
        vec![Arc::new(Int64Array::from(vec![1_600_000_000_i64]))],
    )?;

    let err = wh
        .insert("research", "it_unzoned", "load", &batch, &ts_index())
        .await
        .expect_err("unzoned index");
    assert!(matches!(err, Error::Schema { .. }));
    Ok(())
}

#[tokio::test]
async fn schema_is_locked_after_creation() -> TestResult {
    let (_, wh) = warehouse();

    let schema = Arc::new(Schema::new(vec![
        zoned_ts_field("ts"),
        Field::new("price", DataType::Float64, false),
    ]));
    let base = utc(2021, 10, 1, 0);
    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(TimestampSecondArray::from(vec![base.timestamp()]).with_timezone("UTC")),
            Arc::new(Float64Array::from(vec![1.0])),
        ],
    )?;
    wh.insert("research", "it_locked", "load", &batch, &ts_index())
        .await?;

    // Missing a declared column: rejected.
    let missing = ts_batch(&[base]);
    let err = wh
        .insert("research", "it_locked", "load", &missing, &ts_index())
        .await
        .expect_err("missing declared column");
    assert!(matches!(err, Error::Schema { .. }));

    // Incompatible observed type for a declared column: rejected.
    let schema = Arc::new(Schema::new(vec![
        zoned_ts_field("ts"),
        Field::new("price", DataType::Utf8, false),
    ]));
    let wrong = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(TimestampSecondArray::from(vec![base.timestamp()]).with_timezone("UTC")),
            Arc::new(StringArray::from(vec!["expensive"])),
        ],
    )?;
    let err = wh
        .insert("research", "it_locked", "load", &wrong, &ts_index())
        .await
        .expect_err("incompatible type");
    assert!(matches!(err, Error::Schema { .. }));
    Ok(())
}

#[tokio::test]
async fn list_datasets_enumerates_prefixes() -> TestResult {
    let (_, wh) = warehouse();

    let rows = ts_batch(&[utc(2021, 11, 1, 1)]);
    wh.insert("research", "it_list", "load", &rows, &ts_index()).await?;
    wh.insert("research", "it_list", "prices", &rows, &ts_index())
        .await?;

    let listing = wh.list_datasets(Some("it_list"), Some("research")).await?;
    assert_eq!(
        listing.get("it_list"),
        Some(&vec!["load".to_string(), "prices".to_string()])
    );

    let all = wh.list_datasets(None, Some("research")).await?;
    assert!(all.contains_key("it_list"));
    Ok(())
}

#[tokio::test]
async fn unknown_store_ids_are_config_errors() -> TestResult {
    let (_, wh) = warehouse();

    let rows = ts_batch(&[utc(2021, 12, 1, 1)]);
    let err = wh
        .insert("no-such-store", "it_cfg", "load", &rows, &ts_index())
        .await
        .expect_err("unknown id");
    assert!(matches!(err, Error::Config { .. }));

    // An ad-hoc URI in place of an id resolves without registration.
    wh.insert(
        "ffs:s3://adhoc-bucket/v1",
        "it_cfg",
        "load",
        &rows,
        &ts_index(),
    )
    .await?;
    Ok(())
}

#[tokio::test]
async fn gather_spanning_many_partitions_prunes_by_listing() -> TestResult {
    let (memory, wh) = warehouse();

    // Two weeks of day partitions requested, only three written: the
    // candidate count (14) exceeds the default worker budget (8), so the
    // engine prunes by listing instead of fetching absent keys.
    let rows = ts_batch(&[utc(2022, 1, 2, 5), utc(2022, 1, 7, 5), utc(2022, 1, 13, 5)]);
    wh.insert("research", "it_prune", "load", &rows, &ts_index())
        .await?;
    let fetches_after_insert = memory.total_gets();

    let gathered = wh
        .gather(
            "it_prune",
            "load",
            utc(2022, 1, 1, 0),
            utc(2022, 1, 14, 23),
            Some("research"),
            &GatherOptions::default(),
        )
        .await?;
    assert_eq!(gathered.batch.num_rows(), 3);

    // Only the three live partitions are fetched (the descriptor comes from
    // the process-wide JSON cache the insert populated); nothing is fetched
    // for the eleven absent days.
    assert_eq!(memory.total_gets() - fetches_after_insert, 3);
    Ok(())
}
