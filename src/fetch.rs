use std::collections::HashSet;
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

use camino::Utf8PathBuf;
use rayon::ThreadPool;
use rayon::prelude::*;
use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info};

use crate::calendar::DateRange;
use crate::domain::{Stage, Variable, VariableSpec};
use crate::error::PipelineError;
use crate::fs_util::{extract_zip, gunzip, write_atomic};
use crate::store::{ArtifactKey, ArtifactStore, remove_if_exists};

/// Parameters of one per-variable, per-year bundle retrieval.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BundleRequest {
    #[serde(skip)]
    pub dataset: String,
    pub format: String,
    pub variable: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub statistic: Option<String>,
    pub year: String,
    pub month: Vec<String>,
    pub day: Vec<String>,
    pub version: String,
}

impl BundleRequest {
    /// Request for every day of `months` in `year`. Days past a month's end
    /// are ignored by the archive.
    pub fn new(spec: &VariableSpec, year: i32, months: &[u32], dataset: &str, version: &str) -> Self {
        Self {
            dataset: dataset.to_string(),
            format: "zip".to_string(),
            variable: spec.source_name.to_string(),
            statistic: spec.statistic.map(str::to_string),
            year: year.to_string(),
            month: months.iter().map(|month| format!("{month:02}")).collect(),
            day: (1..=31).map(|day| format!("{day:02}")).collect(),
            version: version.to_string(),
        }
    }
}

/// One unit of fetch work. Each shape names what it will produce so an
/// already-present result makes the fetch a no-op.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchRequest {
    /// A gzip-compressed file, stored decompressed under `key`.
    Compressed { url: String, key: ArtifactKey },
    /// A zip bundle covering `range` (one year) of `variable`, unpacked into
    /// `target_dir` and then deleted.
    Bundle {
        request: BundleRequest,
        variable: Variable,
        range: DateRange,
        archive_path: Utf8PathBuf,
        target_dir: Utf8PathBuf,
    },
}

impl FetchRequest {
    pub fn locator(&self) -> String {
        match self {
            FetchRequest::Compressed { url, .. } => url.clone(),
            FetchRequest::Bundle {
                request, variable, ..
            } => format!("{}:{}:{}", request.dataset, variable.column(), request.year),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOutcome {
    /// Destination already present; nothing was requested.
    Present,
    /// Retrieved; `files` artifacts were written.
    Fetched { files: usize },
}

/// Remote side of a fetch. Retries, if any, belong to implementations.
pub trait SourceClient: Send + Sync {
    fn fetch_url(&self, url: &str) -> Result<Vec<u8>, PipelineError>;
    fn retrieve_bundle(
        &self,
        request: &BundleRequest,
        destination: &Path,
    ) -> Result<(), PipelineError>;
}

#[derive(Clone)]
pub struct HttpSourceClient {
    client: Client,
    bundle_endpoint: String,
    api_key: Option<String>,
    poll_interval: Duration,
    max_wait: Duration,
}

/// Where a submitted bundle job stands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobState {
    Running,
    Done,
    Failed(String),
}

impl JobState {
    pub fn from_status(status: &Value) -> Self {
        match status.get("status").and_then(Value::as_str) {
            Some("successful") => JobState::Done,
            Some(end @ ("failed" | "rejected" | "dismissed")) => JobState::Failed(end.to_string()),
            _ => JobState::Running,
        }
    }
}

/// Polls `check` every `interval` until the job finishes or `max_wait` has
/// passed since the first poll.
pub fn wait_for_job<F>(
    locator: &str,
    interval: Duration,
    max_wait: Duration,
    mut check: F,
) -> Result<(), PipelineError>
where
    F: FnMut() -> Result<JobState, PipelineError>,
{
    let started = Instant::now();
    loop {
        match check()? {
            JobState::Done => return Ok(()),
            JobState::Failed(state) => {
                return Err(PipelineError::Fetch {
                    locator: locator.to_string(),
                    message: format!("job ended as {state}"),
                });
            }
            JobState::Running if started.elapsed() >= max_wait => {
                return Err(PipelineError::Fetch {
                    locator: locator.to_string(),
                    message: format!("job still running after {}s", max_wait.as_secs()),
                });
            }
            JobState::Running => {
                debug!(locator, "job running");
                thread::sleep(interval);
            }
        }
    }
}

impl HttpSourceClient {
    pub fn new(bundle_endpoint: &str, api_key: Option<String>) -> Result<Self, PipelineError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("agroclim/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| PipelineError::Config(err.to_string()))?,
        );
        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(600))
            .build()
            .map_err(|err| PipelineError::Config(err.to_string()))?;
        Ok(Self {
            client,
            bundle_endpoint: bundle_endpoint.trim_end_matches('/').to_string(),
            api_key: api_key.filter(|key| !key.trim().is_empty()),
            poll_interval: Duration::from_secs(5),
            max_wait: Duration::from_secs(6 * 60 * 60),
        })
    }

    /// Upper bound on how long one bundle job is polled before giving up.
    pub fn with_max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = max_wait;
        self
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.api_key {
            Some(key) => request.header("PRIVATE-TOKEN", key.trim()),
            None => request,
        }
    }

    fn send(&self, locator: &str, request: RequestBuilder) -> Result<Response, PipelineError> {
        let response = request.send().map_err(|err| PipelineError::Fetch {
            locator: locator.to_string(),
            message: err.to_string(),
        })?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response
                .text()
                .unwrap_or_else(|_| "request failed".to_string());
            return Err(PipelineError::FetchStatus {
                locator: locator.to_string(),
                status,
                message,
            });
        }
        Ok(response)
    }

    fn json(&self, locator: &str, request: RequestBuilder) -> Result<Value, PipelineError> {
        self.send(locator, request)?
            .json()
            .map_err(|err| PipelineError::Fetch {
                locator: locator.to_string(),
                message: err.to_string(),
            })
    }
}

impl SourceClient for HttpSourceClient {
    fn fetch_url(&self, url: &str) -> Result<Vec<u8>, PipelineError> {
        let response = self.send(url, self.client.get(url))?;
        let bytes = response.bytes().map_err(|err| PipelineError::Fetch {
            locator: url.to_string(),
            message: err.to_string(),
        })?;
        Ok(bytes.to_vec())
    }

    /// Submits the request as a job, waits for it, then downloads the result.
    fn retrieve_bundle(
        &self,
        request: &BundleRequest,
        destination: &Path,
    ) -> Result<(), PipelineError> {
        let locator = format!("{}/{}", request.dataset, request.year);
        let submit_url = format!(
            "{}/retrieve/v1/processes/{}/execution",
            self.bundle_endpoint, request.dataset
        );
        let job = self.json(
            &locator,
            self.authorized(self.client.post(&submit_url))
                .json(&serde_json::json!({ "inputs": request })),
        )?;
        let job_id = job
            .get("jobID")
            .and_then(Value::as_str)
            .ok_or_else(|| PipelineError::Fetch {
                locator: locator.clone(),
                message: "response carries no job id".to_string(),
            })?
            .to_string();

        let job_url = format!("{}/retrieve/v1/jobs/{job_id}", self.bundle_endpoint);
        wait_for_job(&locator, self.poll_interval, self.max_wait, || {
            let status = self.json(&locator, self.authorized(self.client.get(&job_url)))?;
            Ok(JobState::from_status(&status))
        })?;

        let results = self.json(
            &locator,
            self.authorized(self.client.get(format!("{job_url}/results"))),
        )?;
        let href = results
            .pointer("/asset/value/href")
            .and_then(Value::as_str)
            .ok_or_else(|| PipelineError::Fetch {
                locator: locator.clone(),
                message: "job results carry no download link".to_string(),
            })?;
        let mut response = self.send(&locator, self.client.get(href))?;
        write_atomic(destination, &mut response)
    }
}

/// Runs independent fetches on a bounded worker pool.
pub struct Fetcher<'a, S: ArtifactStore + ?Sized, C: SourceClient + ?Sized> {
    store: &'a S,
    client: &'a C,
    pool: ThreadPool,
}

impl<'a, S: ArtifactStore + ?Sized, C: SourceClient + ?Sized> Fetcher<'a, S, C> {
    pub fn new(store: &'a S, client: &'a C, concurrency: usize) -> Result<Self, PipelineError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(concurrency.max(1))
            .thread_name(|index| format!("fetch-{index}"))
            .build()
            .map_err(|err| PipelineError::Config(format!("fetch pool: {err}")))?;
        Ok(Self {
            store,
            client,
            pool,
        })
    }

    /// Fetches a single artifact; a no-op when its destination is present.
    pub fn fetch(&self, request: &FetchRequest) -> Result<FetchOutcome, PipelineError> {
        match request {
            FetchRequest::Compressed { url, key } => {
                if self.store.exists(key) {
                    return Ok(FetchOutcome::Present);
                }
                let compressed = self.client.fetch_url(url)?;
                let content = gunzip(&compressed).map_err(|err| PipelineError::Fetch {
                    locator: url.clone(),
                    message: err.to_string(),
                })?;
                let path = self.store.put(key, &content)?;
                debug!(%path, "fetched");
                Ok(FetchOutcome::Fetched { files: 1 })
            }
            FetchRequest::Bundle {
                request,
                variable,
                range,
                archive_path,
                target_dir,
            } => {
                if self.bundle_present(*variable, range) {
                    return Ok(FetchOutcome::Present);
                }
                self.client
                    .retrieve_bundle(request, archive_path.as_std_path())?;
                let extracted = extract_zip(archive_path.as_std_path(), target_dir.as_std_path());
                // the bundle is discarded whether or not it unpacked
                remove_if_exists(archive_path.as_std_path())?;
                let files = extracted?.len();
                info!(%variable, year = %request.year, files, "bundle unpacked");
                Ok(FetchOutcome::Fetched { files })
            }
        }
    }

    /// Fetches all requests concurrently. Requests with an already submitted
    /// locator are dropped so no destination is written twice at once.
    pub fn fetch_all(
        &self,
        requests: Vec<FetchRequest>,
    ) -> Vec<(FetchRequest, Result<FetchOutcome, PipelineError>)> {
        let mut seen = HashSet::new();
        let unique: Vec<FetchRequest> = requests
            .into_iter()
            .filter(|request| seen.insert(request.locator()))
            .collect();
        self.pool.install(|| {
            unique
                .into_par_iter()
                .map(|request| {
                    let result = self.fetch(&request);
                    (request, result)
                })
                .collect()
        })
    }

    fn bundle_present(&self, variable: Variable, range: &DateRange) -> bool {
        range
            .days()
            .all(|day| self.store.exists(&ArtifactKey::new(variable, Stage::Raw, day)))
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use assert_matches::assert_matches;
    use chrono::NaiveDate;

    use super::*;
    use crate::domain::VariableTable;
    use crate::store::FsStore;

    struct CountingClient {
        calls: AtomicUsize,
        fail: Mutex<Option<u16>>,
    }

    impl CountingClient {
        fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail: Mutex::new(None),
            }
        }
    }

    impl SourceClient for CountingClient {
        fn fetch_url(&self, url: &str) -> Result<Vec<u8>, PipelineError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(status) = *self.fail.lock().unwrap() {
                return Err(PipelineError::FetchStatus {
                    locator: url.to_string(),
                    status,
                    message: "not found".to_string(),
                });
            }
            use std::io::Write;
            let mut encoder =
                flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
            encoder.write_all(url.as_bytes()).unwrap();
            Ok(encoder.finish().unwrap())
        }

        fn retrieve_bundle(
            &self,
            _request: &BundleRequest,
            _destination: &Path,
        ) -> Result<(), PipelineError> {
            unreachable!("bundles are not requested in these tests")
        }
    }

    fn store() -> (tempfile::TempDir, FsStore) {
        let temp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        let store = FsStore::new_with_paths(
            root.join("staging"),
            root.join("out"),
            VariableTable::standard(),
        );
        (temp, store)
    }

    fn request(day: u32) -> FetchRequest {
        let date = NaiveDate::from_ymd_opt(2024, 5, day).unwrap();
        FetchRequest::Compressed {
            url: format!("https://example.org/{day}.tif.gz"),
            key: ArtifactKey::new(Variable::Prec, Stage::Raw, date),
        }
    }

    #[test]
    fn second_fetch_is_noop() {
        let (_temp, store) = store();
        let client = CountingClient::new();
        let fetcher = Fetcher::new(&store, &client, 2).unwrap();
        assert_eq!(
            fetcher.fetch(&request(1)).unwrap(),
            FetchOutcome::Fetched { files: 1 }
        );
        assert_eq!(fetcher.fetch(&request(1)).unwrap(), FetchOutcome::Present);
        assert_eq!(client.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn fetch_all_dedupes_and_decompresses() {
        let (_temp, store) = store();
        let client = CountingClient::new();
        let fetcher = Fetcher::new(&store, &client, 4).unwrap();
        let results = fetcher.fetch_all(vec![request(1), request(2), request(1), request(3)]);
        assert_eq!(results.len(), 3);
        assert!(results.iter().all(|(_, result)| result.is_ok()));
        assert_eq!(client.calls.load(Ordering::SeqCst), 3);

        let FetchRequest::Compressed { key, .. } = request(2) else {
            unreachable!()
        };
        let path = store.path(&key).unwrap();
        assert_eq!(fs::read(path).unwrap(), b"https://example.org/2.tif.gz");
    }

    #[test]
    fn failure_names_locator() {
        let (_temp, store) = store();
        let client = CountingClient::new();
        *client.fail.lock().unwrap() = Some(404);
        let fetcher = Fetcher::new(&store, &client, 1).unwrap();
        let err = fetcher.fetch(&request(4)).unwrap_err();
        assert_matches!(
            err,
            PipelineError::FetchStatus { ref locator, status: 404, .. } if locator.ends_with("4.tif.gz")
        );
    }

    #[test]
    fn bundle_request_shape() {
        let table = VariableTable::standard();
        let request = BundleRequest::new(
            table.get(Variable::TMax),
            2024,
            &[11, 12],
            "sis-agrometeorological-indicators",
            "1_1",
        );
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["variable"], "2m_temperature");
        assert_eq!(json["statistic"], "24_hour_maximum");
        assert_eq!(json["month"], serde_json::json!(["11", "12"]));
        assert_eq!(json["day"].as_array().unwrap().len(), 31);
        assert!(json.get("dataset").is_none());

        let srad = BundleRequest::new(table.get(Variable::SRad), 2024, &[1], "d", "1_1");
        assert!(serde_json::to_value(&srad).unwrap().get("statistic").is_none());
    }

    #[test]
    fn job_status_values() {
        let status = |value: &str| JobState::from_status(&serde_json::json!({ "status": value }));
        assert_eq!(status("accepted"), JobState::Running);
        assert_eq!(status("running"), JobState::Running);
        assert_eq!(status("successful"), JobState::Done);
        assert_eq!(status("dismissed"), JobState::Failed("dismissed".to_string()));
        assert_eq!(JobState::from_status(&serde_json::json!({})), JobState::Running);
    }

    #[test]
    fn job_that_never_finishes_times_out() {
        let mut polls = 0;
        let result = wait_for_job(
            "dataset/2024",
            Duration::from_millis(1),
            Duration::from_millis(20),
            || {
                polls += 1;
                Ok(JobState::Running)
            },
        );
        assert_matches!(result, Err(PipelineError::Fetch { message, .. }) if message.contains("still running"));
        assert!(polls >= 2);
    }

    #[test]
    fn job_finishing_before_deadline_succeeds() {
        let mut states = vec![JobState::Done, JobState::Running, JobState::Running];
        let result = wait_for_job(
            "dataset/2024",
            Duration::from_millis(1),
            Duration::from_secs(60),
            || Ok(states.pop().unwrap_or(JobState::Done)),
        );
        assert!(result.is_ok());
        assert!(states.is_empty());

        let failed = wait_for_job("dataset/2024", Duration::ZERO, Duration::ZERO, || {
            Ok(JobState::Failed("rejected".to_string()))
        });
        assert_matches!(failed, Err(PipelineError::Fetch { .. }));
    }
}
