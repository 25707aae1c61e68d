//! Storage of completed test runs.
//!
//! A run is saved in two steps: the [`TestRun`] header, which yields the
//! run's id, then the sample batch keyed by that id. The steps fail
//! independently; a failed sample save leaves the saved header in place.

use crate::acquisition::SensorSample;
use crate::error::{RigError, RigResult};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

/// Identifier assigned to a saved run by its store.
pub type TestRunId = u64;

/// Summary of one completed automatic test.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestRun {
    /// `{label}_{YYYYMMDDHHMMSS}`
    pub name: String,
    /// Operator label
    pub label: String,
    /// Commanded velocity (units/s)
    pub velocity: f64,
    /// Commanded acceleration (units/s²)
    pub acceleration: f64,
    /// Start of the measured leg
    pub start_position: f64,
    /// End of the measured leg
    pub end_position: f64,
    /// Signed travel of the measured leg, `end - start`
    pub distance: f64,
    /// Span between the first and last sample, in seconds
    pub duration_secs: f64,
    /// Samples in the batch
    pub sample_count: usize,
}

/// Destination for test runs and their samples.
#[async_trait]
pub trait TestStore: Send + Sync {
    /// Save a run header and return its id.
    async fn save_test_run(&self, run: &TestRun) -> RigResult<TestRunId>;

    /// Save the samples of run `id`.
    async fn save_samples(&self, id: TestRunId, samples: &[SensorSample]) -> RigResult<()>;
}

/// In-process store, used in simulation and tests.
#[derive(Debug, Default)]
pub struct MemoryTestStore {
    runs: Mutex<Vec<(TestRunId, TestRun)>>,
    samples: Mutex<HashMap<TestRunId, Vec<SensorSample>>>,
    fail_runs: AtomicBool,
    fail_samples: AtomicBool,
}

impl MemoryTestStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make header saves fail.
    pub fn fail_runs(&self, fail: bool) {
        self.fail_runs.store(fail, Ordering::SeqCst);
    }

    /// Make sample saves fail.
    pub fn fail_samples(&self, fail: bool) {
        self.fail_samples.store(fail, Ordering::SeqCst);
    }

    /// Saved run headers in order.
    pub fn runs(&self) -> Vec<(TestRunId, TestRun)> {
        self.runs.lock().clone()
    }

    /// Samples saved for run `id`.
    pub fn samples(&self, id: TestRunId) -> Option<Vec<SensorSample>> {
        self.samples.lock().get(&id).cloned()
    }
}

#[async_trait]
impl TestStore for MemoryTestStore {
    async fn save_test_run(&self, run: &TestRun) -> RigResult<TestRunId> {
        if self.fail_runs.load(Ordering::SeqCst) {
            return Err(RigError::Persistence("test run rejected".to_string()));
        }
        let mut runs = self.runs.lock();
        let id = runs.len() as TestRunId + 1;
        runs.push((id, run.clone()));
        Ok(id)
    }

    async fn save_samples(&self, id: TestRunId, samples: &[SensorSample]) -> RigResult<()> {
        if self.fail_samples.load(Ordering::SeqCst) {
            return Err(RigError::Persistence(format!("samples for run {id} rejected")));
        }
        self.samples.lock().insert(id, samples.to_vec());
        Ok(())
    }
}

#[cfg(feature = "storage_csv")]
pub use csv_store::CsvTestStore;

#[cfg(feature = "storage_csv")]
mod csv_store {
    use super::{TestRun, TestRunId, TestStore};
    use crate::acquisition::SensorSample;
    use crate::error::{RigError, RigResult};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde::Serialize;
    use std::fs::OpenOptions;
    use std::path::{Path, PathBuf};
    use std::sync::Arc;
    use tracing::info;

    const RUNS_FILE: &str = "runs.csv";

    #[derive(Serialize)]
    struct RunRecord<'a> {
        id: TestRunId,
        name: &'a str,
        label: &'a str,
        velocity: f64,
        acceleration: f64,
        start_position: f64,
        end_position: f64,
        distance: f64,
        duration_secs: f64,
        sample_count: usize,
    }

    impl<'a> RunRecord<'a> {
        fn new(id: TestRunId, run: &'a TestRun) -> Self {
            Self {
                id,
                name: &run.name,
                label: &run.label,
                velocity: run.velocity,
                acceleration: run.acceleration,
                start_position: run.start_position,
                end_position: run.end_position,
                distance: run.distance,
                duration_secs: run.duration_secs,
                sample_count: run.sample_count,
            }
        }
    }

    fn storage_err(err: impl std::fmt::Display) -> RigError {
        RigError::Persistence(err.to_string())
    }

    /// CSV files under one directory: `runs.csv` plus `samples_<id>.csv` per run.
    #[derive(Debug, Clone)]
    pub struct CsvTestStore {
        dir: PathBuf,
        last_id: Arc<Mutex<TestRunId>>,
    }

    impl CsvTestStore {
        /// Store in `dir`, created if missing. Ids continue after existing runs.
        pub fn open(dir: impl AsRef<Path>) -> RigResult<Self> {
            let dir = dir.as_ref().to_path_buf();
            std::fs::create_dir_all(&dir).map_err(storage_err)?;

            let runs = dir.join(RUNS_FILE);
            let existing = if runs.exists() {
                csv::Reader::from_path(&runs)
                    .map_err(storage_err)?
                    .records()
                    .count() as TestRunId
            } else {
                0
            };
            info!(dir = %dir.display(), existing, "CSV test store open");
            Ok(Self {
                dir,
                last_id: Arc::new(Mutex::new(existing)),
            })
        }

        /// Directory holding the files.
        pub fn dir(&self) -> &Path {
            &self.dir
        }

        /// Path of the sample file for run `id`.
        pub fn samples_path(&self, id: TestRunId) -> PathBuf {
            self.dir.join(format!("samples_{id}.csv"))
        }
    }

    #[async_trait]
    impl TestStore for CsvTestStore {
        async fn save_test_run(&self, run: &TestRun) -> RigResult<TestRunId> {
            let path = self.dir.join(RUNS_FILE);
            let last_id = Arc::clone(&self.last_id);
            let run = run.clone();

            tokio::task::spawn_blocking(move || {
                let mut last_id = last_id.lock();
                let id = *last_id + 1;
                let fresh = !path.exists();
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&path)
                    .map_err(storage_err)?;
                let mut writer = csv::WriterBuilder::new()
                    .has_headers(fresh)
                    .from_writer(file);
                writer
                    .serialize(RunRecord::new(id, &run))
                    .map_err(storage_err)?;
                writer.flush().map_err(storage_err)?;
                *last_id = id;
                Ok(id)
            })
            .await?
        }

        async fn save_samples(&self, id: TestRunId, samples: &[SensorSample]) -> RigResult<()> {
            let path = self.samples_path(id);
            let samples = samples.to_vec();

            tokio::task::spawn_blocking(move || {
                let mut writer = csv::Writer::from_path(&path).map_err(storage_err)?;
                for sample in &samples {
                    writer.serialize(sample).map_err(storage_err)?;
                }
                writer.flush().map_err(storage_err)?;
                Ok(())
            })
            .await?
        }
    }
}
