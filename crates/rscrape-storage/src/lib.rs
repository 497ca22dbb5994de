//! HTTP fetch, media file placement and the batch downloader for rscrape.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use rscrape_core::SubmissionRecord;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tracing::{info, info_span, warn, Instrument};

pub const CRATE_NAME: &str = "rscrape-storage";

/// Client settings shared by the listing API and media downloads.
///
/// `read_timeout` bounds the idle time between reads, so a slow but steady body
/// keeps streaming. `request_timeout` caps the whole exchange and is left unset
/// for media.
#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub request_timeout: Option<Duration>,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(20),
            read_timeout: Duration::from_secs(20),
            request_timeout: None,
            user_agent: None,
        }
    }
}

impl HttpClientConfig {
    pub fn client_builder(&self) -> reqwest::ClientBuilder {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .connect_timeout(self.connect_timeout)
            .read_timeout(self.read_timeout);
        if let Some(timeout) = self.request_timeout {
            builder = builder.timeout(timeout);
        }
        if let Some(user_agent) = &self.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        builder
    }
}

#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("writing {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let client = config
            .client_builder()
            .build()
            .context("building reqwest client")?;
        Ok(Self { client })
    }

    async fn send(&self, url: &str) -> Result<reqwest::Response, FetchError> {
        let resp = self.client.get(url).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: resp.url().to_string(),
            });
        }
        Ok(resp)
    }

    /// Fetches the whole body into memory.
    pub async fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        async {
            let resp = self.send(url).await?;
            Ok::<_, FetchError>(resp.bytes().await?.to_vec())
        }
        .instrument(info_span!("http_fetch", url))
        .await
    }

    /// Streams the body chunk by chunk into `path`, returning the bytes written.
    ///
    /// The file is only created once the server answered with a success status.
    pub async fn fetch_to_file(&self, url: &str, path: &Path) -> Result<u64, FetchError> {
        async {
            let mut resp = self.send(url).await?;
            let io_err = |source| FetchError::Io {
                path: path.to_path_buf(),
                source,
            };
            let mut file = fs::File::create(path).await.map_err(io_err)?;
            let mut written = 0u64;
            while let Some(chunk) = resp.chunk().await? {
                file.write_all(&chunk).await.map_err(io_err)?;
                written += chunk.len() as u64;
            }
            file.flush().await.map_err(io_err)?;
            Ok::<_, FetchError>(written)
        }
        .instrument(info_span!("http_stream", url, path = %path.display()))
        .await
    }
}

/// Places downloaded media as `<label>_<basename>` under a root directory.
#[derive(Debug, Clone)]
pub struct MediaStore {
    root: PathBuf,
}

impl MediaStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, record: &SubmissionRecord) -> PathBuf {
        self.root.join(record.file_name())
    }

    pub async fn ensure_root(&self) -> std::io::Result<()> {
        fs::create_dir_all(&self.root).await
    }

    /// Writes `bytes` for `record`, replacing any file already at that name.
    pub async fn write_bytes(
        &self,
        record: &SubmissionRecord,
        bytes: &[u8],
    ) -> std::io::Result<PathBuf> {
        let path = self.path_for(record);
        fs::write(&path, bytes).await?;
        Ok(path)
    }
}

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("downloading {url}: {source}")]
    Fetch {
        url: String,
        #[source]
        source: FetchError,
    },
    #[error("writing {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("download task failed: {0}")]
    Task(#[from] JoinError),
}

#[derive(Debug, Clone)]
pub struct DownloadedFile {
    pub url: String,
    pub path: PathBuf,
    pub bytes: u64,
    pub elapsed: Duration,
}

#[derive(Debug, Clone, Default)]
pub struct DownloadReport {
    pub files: Vec<DownloadedFile>,
    pub total_bytes: u64,
    pub elapsed: Duration,
}

impl DownloadReport {
    fn push(&mut self, file: DownloadedFile) {
        self.total_bytes += file.bytes;
        self.files.push(file);
    }
}

/// Materializes harvested records on disk, one file per record.
#[derive(Debug, Clone)]
pub struct BatchDownloader {
    fetcher: HttpFetcher,
    store: MediaStore,
    in_flight: Option<Arc<Semaphore>>,
}

impl BatchDownloader {
    pub fn new(fetcher: HttpFetcher, store: MediaStore) -> Self {
        Self {
            fetcher,
            store,
            in_flight: None,
        }
    }

    /// Caps simultaneous concurrent downloads. `None` keeps one in-flight task per record.
    pub fn with_max_in_flight(mut self, limit: Option<usize>) -> Self {
        self.in_flight = limit.map(|n| Arc::new(Semaphore::new(n.max(1))));
        self
    }

    pub fn store(&self) -> &MediaStore {
        &self.store
    }

    async fn prepare(&self) -> Result<(), DownloadError> {
        self.store
            .ensure_root()
            .await
            .map_err(|source| DownloadError::Io {
                path: self.store.root().to_path_buf(),
                source,
            })
    }

    /// Downloads records one after another; the first failure ends the batch.
    pub async fn download_all(
        &self,
        records: &[SubmissionRecord],
    ) -> Result<DownloadReport, DownloadError> {
        self.prepare().await?;
        let batch_started = Instant::now();
        let mut report = DownloadReport::default();

        for record in records {
            let file_name = record.file_name();
            info!(file = %file_name, "downloading file");
            let started = Instant::now();

            let body = self
                .fetcher
                .fetch_bytes(&record.url)
                .await
                .map_err(|source| DownloadError::Fetch {
                    url: record.url.clone(),
                    source,
                })?;
            let path = self
                .store
                .write_bytes(record, &body)
                .await
                .map_err(|source| DownloadError::Io {
                    path: self.store.path_for(record),
                    source,
                })?;

            let elapsed = started.elapsed();
            info!(file = %file_name, elapsed_secs = elapsed.as_secs_f64(), "file downloaded");
            report.push(DownloadedFile {
                url: record.url.clone(),
                path,
                bytes: body.len() as u64,
                elapsed,
            });
        }

        report.elapsed = batch_started.elapsed();
        Ok(report)
    }

    /// Spawns one streaming task per record, then waits for every task.
    ///
    /// A failing task does not cancel its siblings; the first failure observed is
    /// returned once the whole group has finished.
    pub async fn download_all_concurrent(
        &self,
        records: &[SubmissionRecord],
    ) -> Result<DownloadReport, DownloadError> {
        self.prepare().await?;
        let batch_started = Instant::now();

        let mut tasks = JoinSet::new();
        for record in records.iter().cloned() {
            let fetcher = self.fetcher.clone();
            let path = self.store.path_for(&record);
            let limit = self.in_flight.clone();
            tasks.spawn(async move {
                let _permit = match limit {
                    Some(sem) => Some(sem.acquire_owned().await.expect("semaphore not closed")),
                    None => None,
                };
                stream_record(&fetcher, record, path).await
            });
        }

        let mut report = DownloadReport::default();
        let mut first_error: Option<DownloadError> = None;
        while let Some(joined) = tasks.join_next().await {
            let outcome = joined.map_err(DownloadError::from).and_then(|r| r);
            match outcome {
                Ok(file) => report.push(file),
                Err(err) => {
                    warn!(error = %err, remaining = tasks.len(), "download task failed");
                    first_error.get_or_insert(err);
                }
            }
        }

        if let Some(err) = first_error {
            return Err(err);
        }
        report.elapsed = batch_started.elapsed();
        Ok(report)
    }
}

async fn stream_record(
    fetcher: &HttpFetcher,
    record: SubmissionRecord,
    path: PathBuf,
) -> Result<DownloadedFile, DownloadError> {
    let file_name = record.file_name();
    info!(file = %file_name, "downloading file");
    let started = Instant::now();

    let bytes = fetcher
        .fetch_to_file(&record.url, &path)
        .await
        .map_err(|source| match source {
            FetchError::Io { path, source } => DownloadError::Io { path, source },
            other => DownloadError::Fetch {
                url: record.url.clone(),
                source: other,
            },
        })?;

    let elapsed = started.elapsed();
    info!(file = %file_name, bytes, elapsed_secs = elapsed.as_secs_f64(), "file downloaded");
    Ok(DownloadedFile {
        url: record.url,
        path,
        bytes,
        elapsed,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const LABEL: &str = "20170301_120000";

    async fn serve(server: &MockServer, route: &str, status: u16, body: &[u8]) {
        Mock::given(method("GET"))
            .and(path(route))
            .respond_with(ResponseTemplate::new(status).set_body_bytes(body.to_vec()))
            .mount(server)
            .await;
    }

    fn record(server: &MockServer, route: &str) -> SubmissionRecord {
        SubmissionRecord::new(format!("{}{}", server.uri(), route), LABEL)
    }

    fn downloader(root: &Path) -> BatchDownloader {
        let fetcher = HttpFetcher::new(HttpClientConfig::default()).expect("fetcher");
        BatchDownloader::new(fetcher, MediaStore::new(root))
    }

    async fn three_record_server() -> (MockServer, Vec<SubmissionRecord>) {
        let server = MockServer::start().await;
        serve(&server, "/media/a.jpg", 200, b"first").await;
        serve(&server, "/media/b.jpg", 500, b"boom").await;
        serve(&server, "/media/c.png", 200, b"third").await;
        let records = vec![
            record(&server, "/media/a.jpg"),
            record(&server, "/media/b.jpg"),
            record(&server, "/media/c.png"),
        ];
        (server, records)
    }

    #[tokio::test]
    async fn sequential_download_writes_named_files() {
        let server = MockServer::start().await;
        serve(&server, "/i/cat.jpg", 200, b"cat-bytes").await;
        serve(&server, "/i/dog.png", 200, b"dog-bytes").await;
        let dir = tempdir().expect("tempdir");

        let report = downloader(dir.path())
            .download_all(&[record(&server, "/i/cat.jpg"), record(&server, "/i/dog.png")])
            .await
            .expect("download");

        assert_eq!(report.files.len(), 2);
        assert_eq!(report.total_bytes, 18);
        let cat = std::fs::read(dir.path().join("20170301_120000_cat.jpg")).expect("cat file");
        let dog = std::fs::read(dir.path().join("20170301_120000_dog.png")).expect("dog file");
        assert_eq!(cat, b"cat-bytes");
        assert_eq!(dog, b"dog-bytes");
    }

    #[tokio::test]
    async fn sequential_failure_stops_the_batch() {
        let (_server, records) = three_record_server().await;
        let dir = tempdir().expect("tempdir");

        let err = downloader(dir.path())
            .download_all(&records)
            .await
            .expect_err("second record fails");

        match err {
            DownloadError::Fetch { url, source } => {
                assert!(url.ends_with("/media/b.jpg"));
                assert!(matches!(source, FetchError::HttpStatus { status: 500, .. }));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(dir.path().join("20170301_120000_a.jpg").exists());
        assert!(!dir.path().join("20170301_120000_b.jpg").exists());
        assert!(!dir.path().join("20170301_120000_c.png").exists());
    }

    #[tokio::test]
    async fn concurrent_failure_keeps_sibling_files() {
        let (_server, records) = three_record_server().await;
        let dir = tempdir().expect("tempdir");

        let err = downloader(dir.path())
            .download_all_concurrent(&records)
            .await
            .expect_err("second record fails");

        assert!(matches!(err, DownloadError::Fetch { .. }));
        assert_eq!(
            std::fs::read(dir.path().join("20170301_120000_a.jpg")).expect("a"),
            b"first"
        );
        assert_eq!(
            std::fs::read(dir.path().join("20170301_120000_c.png")).expect("c"),
            b"third"
        );
        assert!(!dir.path().join("20170301_120000_b.jpg").exists());
    }

    #[tokio::test]
    async fn concurrent_and_sequential_produce_the_same_files() {
        let server = MockServer::start().await;
        let large: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        serve(&server, "/m/one.jpg", 200, b"one").await;
        serve(&server, "/m/two.jpeg", 200, &large).await;
        serve(&server, "/m/three.png", 200, b"").await;
        let records = vec![
            record(&server, "/m/one.jpg"),
            record(&server, "/m/two.jpeg"),
            record(&server, "/m/three.png"),
        ];

        let seq_dir = tempdir().expect("tempdir");
        let con_dir = tempdir().expect("tempdir");
        downloader(seq_dir.path())
            .download_all(&records)
            .await
            .expect("sequential");
        let report = downloader(con_dir.path())
            .with_max_in_flight(None)
            .download_all_concurrent(&records)
            .await
            .expect("concurrent");
        assert_eq!(report.total_bytes, 3 + large.len() as u64);

        for record in &records {
            let name = record.file_name();
            let a = std::fs::read(seq_dir.path().join(&name)).expect("sequential file");
            let b = std::fs::read(con_dir.path().join(&name)).expect("concurrent file");
            assert_eq!(a, b, "{name} differs");
        }
    }

    #[tokio::test]
    async fn bounded_concurrency_still_downloads_everything() {
        let server = MockServer::start().await;
        let mut records = Vec::new();
        for i in 0..6 {
            let route = format!("/m/{i}.jpg");
            serve(&server, &route, 200, format!("body-{i}").as_bytes()).await;
            records.push(record(&server, &route));
        }
        let dir = tempdir().expect("tempdir");

        let report = downloader(dir.path())
            .with_max_in_flight(Some(2))
            .download_all_concurrent(&records)
            .await
            .expect("download");

        assert_eq!(report.files.len(), 6);
        for i in 0..6 {
            let body = std::fs::read(dir.path().join(format!("{LABEL}_{i}.jpg"))).expect("file");
            assert_eq!(body, format!("body-{i}").as_bytes());
        }
    }

    #[tokio::test]
    async fn streaming_error_status_creates_no_file() {
        let server = MockServer::start().await;
        serve(&server, "/gone.jpg", 404, b"").await;
        let dir = tempdir().expect("tempdir");
        let fetcher = HttpFetcher::new(HttpClientConfig::default()).expect("fetcher");
        let target = dir.path().join("gone.jpg");

        let err = fetcher
            .fetch_to_file(&format!("{}/gone.jpg", server.uri()), &target)
            .await
            .expect_err("404");

        assert!(matches!(err, FetchError::HttpStatus { status: 404, .. }));
        assert!(!target.exists());
    }

    #[tokio::test]
    async fn slow_media_is_not_cut_off_by_a_request_deadline() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/slow.gif"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_bytes(b"gif".to_vec())
                    .set_delay(Duration::from_millis(600)),
            )
            .mount(&server)
            .await;
        let url = format!("{}/slow.gif", server.uri());
        let dir = tempdir().expect("tempdir");

        let media = HttpFetcher::new(HttpClientConfig {
            read_timeout: Duration::from_secs(5),
            ..HttpClientConfig::default()
        })
        .expect("fetcher");
        let written = media
            .fetch_to_file(&url, &dir.path().join("slow.gif"))
            .await
            .expect("slow download completes");
        assert_eq!(written, 3);

        let capped = HttpFetcher::new(HttpClientConfig {
            request_timeout: Some(Duration::from_millis(100)),
            ..HttpClientConfig::default()
        })
        .expect("fetcher");
        let err = capped.fetch_bytes(&url).await.expect_err("deadline hit");
        assert!(matches!(err, FetchError::Request(ref e) if e.is_timeout()));
    }

    #[test]
    fn default_client_config_has_no_total_deadline() {
        assert_eq!(HttpClientConfig::default().request_timeout, None);
    }

    #[tokio::test]
    async fn store_overwrites_existing_file() {
        let dir = tempdir().expect("tempdir");
        let store = MediaStore::new(dir.path());
        let rec = SubmissionRecord::new("https://i.redd.it/x.png", LABEL);

        store.write_bytes(&rec, b"older, longer").await.expect("first");
        let path = store.write_bytes(&rec, b"newer").await.expect("second");

        assert_eq!(path, dir.path().join("20170301_120000_x.png"));
        assert_eq!(std::fs::read(path).expect("read"), b"newer");
    }

    #[tokio::test]
    async fn missing_output_directory_is_created() {
        let server = MockServer::start().await;
        serve(&server, "/a.jpg", 200, b"a").await;
        let dir = tempdir().expect("tempdir");
        let nested = dir.path().join("out").join("pics");

        downloader(&nested)
            .download_all_concurrent(&[record(&server, "/a.jpg")])
            .await
            .expect("download");

        assert!(nested.join("20170301_120000_a.jpg").exists());
    }
}
