//! Criterion measurements of the compiled-command path: a lookup whose
//! binder and parser are already cached, against the same lookup with the
//! caches cleared before every call, over a seeded SQLite file.

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use rand::SeedableRng;
use rand::seq::SliceRandom;
use rand_chacha::ChaCha8Rng;
use sql_engine::prelude::*;
use std::path::PathBuf;
use std::sync::{Arc, LazyLock};
use std::time::{Duration, Instant};
use tokio::runtime::Runtime;

sql_engine::record! {
    #[derive(Debug, Default)]
    pub struct Row {
        pub id: i64,
        pub name: String,
        pub score: f64,
    }
}

const LOOKUP: &str = "SELECT id, name, score FROM bench WHERE id = @id";

struct Dataset {
    path: String,
    ids: Vec<i64>,
}

static TOKIO_RUNTIME: LazyLock<Runtime> = LazyLock::new(|| Runtime::new().expect("create tokio runtime"));

// Seed once so both variants read identical data.
static DATASET: LazyLock<Dataset> = LazyLock::new(|| {
    let rows = row_count();
    let path = PathBuf::from("benchmark_compiled_cache.db");
    if path.exists() {
        std::fs::remove_file(&path).expect("remove stale benchmark database");
    }
    let path = path.to_string_lossy().into_owned();
    TOKIO_RUNTIME
        .block_on(seed(&path, rows))
        .expect("seed benchmark database");

    let mut ids: Vec<i64> = (1..=rows).collect();
    let mut rng = ChaCha8Rng::seed_from_u64(1_234_567_890);
    ids.shuffle(&mut rng);
    Dataset { path, ids }
});

fn row_count() -> i64 {
    std::env::var("BENCH_ROWS")
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(500)
}

async fn seed(path: &str, rows: i64) -> Result<(), SqlEngineError> {
    let db = Database::connect(DatabaseType::Sqlite, path)?;
    let options = CallOptions::new();
    db.execute(
        "CREATE TABLE bench (id INTEGER PRIMARY KEY, name TEXT NOT NULL, score REAL NOT NULL)",
        &(),
        &options,
    )
    .await?;
    db.run_in_transaction(&options, |tx| {
        Box::pin(async move {
            for id in 1..=rows {
                let params = ParamList::new()
                    .add("id", id)
                    .add("name", format!("name-{id}"))
                    .add("score", id as f64 / 3.0);
                tx.execute("INSERT INTO bench (id, name, score) VALUES (@id, @name, @score)", &params)
                    .await?;
            }
            Ok(())
        })
    })
    .await
}

fn database() -> Database {
    let ctx = Arc::new(EngineContext::new(EngineOptions::default()).expect("default options"));
    let connector = connector_from_url(DatabaseType::Sqlite, &DATASET.path).expect("sqlite connector");
    Database::with_context(connector, ctx)
}

async fn lookups(db: &Database, ids: &[i64], cold: bool) -> Duration {
    let options = CallOptions::new();
    let start = Instant::now();
    for id in ids {
        if cold {
            db.context().clear();
        }
        let row: Option<Row> = db
            .fetch_one(LOOKUP, &ParamList::new().add("id", *id), &options)
            .await
            .expect("lookup");
        black_box(row);
    }
    start.elapsed()
}

fn bench_compiled_cache(c: &mut Criterion) {
    let ids = &DATASET.ids;
    let mut group = c.benchmark_group("compiled_cache");
    group.throughput(Throughput::Elements(ids.len() as u64));

    for (label, cold) in [("cached", false), ("cold", true)] {
        let db = database();
        group.bench_with_input(BenchmarkId::new("lookup", label), &cold, |b, &cold| {
            b.iter_custom(|iters| {
                TOKIO_RUNTIME.block_on(async {
                    let mut total = Duration::ZERO;
                    for _ in 0..iters {
                        total += lookups(&db, ids, cold).await;
                    }
                    total
                })
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_compiled_cache);
criterion_main!(benches);
