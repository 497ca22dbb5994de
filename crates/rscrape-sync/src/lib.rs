//! Scrape pipeline orchestration: expand days, harvest submissions, download media.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rscrape_core::{DateRange, Extensions};
use rscrape_source::{
    ChannelPrompt, Harvest, Harvester, RedditCredentials, RedditSource, RedditSourceConfig,
    SubmissionSource, REDDIT_API_BASE, REDDIT_AUTH_URL, REDDIT_MAX_PAGE_SIZE,
};
use rscrape_storage::{BatchDownloader, DownloadReport, HttpClientConfig, HttpFetcher, MediaStore};
use serde::{Deserialize, Serialize};
use tracing::{info, info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "rscrape-sync";

pub const DEFAULT_USER_AGENT: &str = "rscrape/0.1";

/// Process-wide settings, built once at startup and handed to the pipeline.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ScrapeConfig {
    pub reddit: RedditCredentials,
    pub user_agent: String,
    pub extensions: Extensions,
    pub output_dir: PathBuf,
    pub http_timeout_secs: u64,
    pub auth_url: String,
    pub api_base: String,
    pub page_size: u32,
    /// Cap on simultaneous downloads in concurrent mode; unset means one task per record.
    pub max_in_flight: Option<usize>,
}

impl Default for ScrapeConfig {
    fn default() -> Self {
        Self {
            reddit: RedditCredentials::default(),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            extensions: Extensions::default(),
            output_dir: PathBuf::from("."),
            http_timeout_secs: 20,
            auth_url: REDDIT_AUTH_URL.to_string(),
            api_base: REDDIT_API_BASE.to_string(),
            page_size: REDDIT_MAX_PAGE_SIZE,
            max_in_flight: None,
        }
    }
}

impl ScrapeConfig {
    pub fn from_env() -> Self {
        Self::default().with_overrides(|key| std::env::var(key).ok())
    }

    /// Reads a YAML config file; `RSCRAPE_*` environment variables still win.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let config: Self =
            serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
        Ok(config.with_overrides(|key| std::env::var(key).ok()))
    }

    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(v) = lookup("RSCRAPE_CLIENT_ID") {
            self.reddit.client_id = v;
        }
        if let Some(v) = lookup("RSCRAPE_CLIENT_SECRET") {
            self.reddit.client_secret = v;
        }
        if let Some(v) = lookup("RSCRAPE_USERNAME") {
            self.reddit.username = v;
        }
        if let Some(v) = lookup("RSCRAPE_PASSWORD") {
            self.reddit.password = v;
        }
        if let Some(v) = lookup("RSCRAPE_USER_AGENT") {
            self.user_agent = v;
        }
        if let Some(v) = lookup("RSCRAPE_EXTENSIONS") {
            self.extensions = Extensions::new(v.split(',').map(|s| s.trim().to_string()));
        }
        if let Some(v) = lookup("RSCRAPE_OUTPUT_DIR") {
            self.output_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("RSCRAPE_HTTP_TIMEOUT_SECS").and_then(|v| v.parse().ok()) {
            self.http_timeout_secs = v;
        }
        if let Some(v) = lookup("RSCRAPE_MAX_IN_FLIGHT").and_then(|v| v.parse().ok()) {
            self.max_in_flight = Some(v);
        }
        self
    }

    /// Media client: connect and idle-read limits only, so long bodies may keep streaming.
    pub fn http_config(&self) -> HttpClientConfig {
        let timeout = Duration::from_secs(self.http_timeout_secs);
        HttpClientConfig {
            connect_timeout: timeout,
            read_timeout: timeout,
            request_timeout: None,
            user_agent: Some(self.user_agent.clone()),
        }
    }

    /// Listing API client: small JSON responses, so the whole request is capped too.
    pub fn reddit_config(&self) -> RedditSourceConfig {
        let http = HttpClientConfig {
            request_timeout: Some(Duration::from_secs(self.http_timeout_secs)),
            ..self.http_config()
        };
        let mut config = RedditSourceConfig::new(self.reddit.clone(), http);
        config.auth_url = self.auth_url.clone();
        config.api_base = self.api_base.clone();
        config.page_size = self.page_size;
        config
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadMode {
    Sequential,
    Concurrent,
}

impl fmt::Display for DownloadMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DownloadMode::Sequential => f.write_str("sequential"),
            DownloadMode::Concurrent => f.write_str("concurrent"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ScrapeRequest {
    pub channel: String,
    pub range: DateRange,
    pub mode: DownloadMode,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScrapeRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub channel: String,
    pub buckets: usize,
    pub harvested: usize,
    pub downloaded_files: usize,
    pub downloaded_bytes: u64,
    pub mode: DownloadMode,
    pub output_dir: String,
}

pub struct ScrapePipeline<S> {
    config: ScrapeConfig,
    harvester: Harvester<S>,
    downloader: BatchDownloader,
}

impl<S: SubmissionSource> ScrapePipeline<S> {
    pub fn new(config: ScrapeConfig, source: S) -> Result<Self> {
        let fetcher = HttpFetcher::new(config.http_config())?;
        let downloader = BatchDownloader::new(fetcher, MediaStore::new(config.output_dir.clone()))
            .with_max_in_flight(config.max_in_flight);
        let harvester = Harvester::new(source, config.extensions.clone());
        Ok(Self {
            config,
            harvester,
            downloader,
        })
    }

    /// Harvests the requested range without downloading anything.
    pub async fn harvest_only(
        &self,
        request: &ScrapeRequest,
        prompt: &mut dyn ChannelPrompt,
    ) -> Result<Harvest> {
        let buckets = request.range.buckets();
        self.harvester
            .harvest(&request.channel, &buckets, prompt)
            .await
            .with_context(|| format!("harvesting submissions from r/{}", request.channel))
    }

    pub async fn run_once(
        &self,
        request: &ScrapeRequest,
        prompt: &mut dyn ChannelPrompt,
    ) -> Result<ScrapeRunSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let span = info_span!("scrape_run", %run_id, mode = %request.mode);

        async {
            info!(
                channel = %request.channel,
                extensions = %self.config.extensions,
                begin = %request.range.begin(),
                end = %request.range.end(),
                "scraping submissions"
            );
            let harvest = self.harvest_only(request, prompt).await?;

            let download_started = Instant::now();
            info!(records = harvest.records.len(), "downloading started");
            let report: DownloadReport = match request.mode {
                DownloadMode::Sequential => self.downloader.download_all(&harvest.records).await,
                DownloadMode::Concurrent => {
                    self.downloader
                        .download_all_concurrent(&harvest.records)
                        .await
                }
            }
            .context("downloading media")?;
            info!(
                files = report.files.len(),
                bytes = report.total_bytes,
                elapsed_secs = download_started.elapsed().as_secs_f64(),
                "downloading completed"
            );

            Ok::<_, anyhow::Error>(ScrapeRunSummary {
                run_id,
                started_at,
                finished_at: Utc::now(),
                channel: harvest.channel,
                buckets: request.range.day_count(),
                harvested: harvest.records.len(),
                downloaded_files: report.files.len(),
                downloaded_bytes: report.total_bytes,
                mode: request.mode,
                output_dir: self.downloader.store().root().display().to_string(),
            })
        }
        .instrument(span)
        .await
    }
}

pub fn reddit_pipeline(config: ScrapeConfig) -> Result<ScrapePipeline<RedditSource>> {
    let source = RedditSource::new(config.reddit_config())?;
    ScrapePipeline::new(config, source)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rscrape_core::CalendarDate;
    use rscrape_source::{FixtureSource, ScriptedChannelPrompt, SourcePost};
    use std::collections::HashMap;
    use tempfile::tempdir;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    // 2016-02-28T00:00:00Z
    const FEB28: f64 = 1_456_617_600.0;
    const DAY: f64 = 86_400.0;

    fn leap_range() -> DateRange {
        DateRange::new(
            CalendarDate::new(2016, 2, 28).unwrap(),
            CalendarDate::new(2016, 3, 1).unwrap(),
        )
        .unwrap()
    }

    async fn media_server() -> MockServer {
        let server = MockServer::start().await;
        for (route, body) in [("/a.jpg", "alpha"), ("/b.png", "bravo"), ("/c.jpeg", "charlie")] {
            Mock::given(method("GET"))
                .and(path(route))
                .respond_with(ResponseTemplate::new(200).set_body_string(body))
                .mount(&server)
                .await;
        }
        server
    }

    fn fixture(server: &MockServer) -> FixtureSource {
        let url = |name: &str| format!("{}/{}", server.uri(), name);
        FixtureSource::default().with_channel(
            "wallpapers",
            vec![
                SourcePost::new(url("a.jpg"), FEB28 + 10.0),
                SourcePost::new(url("skip.gif"), FEB28 + 20.0),
                SourcePost::new(url("b.png"), FEB28 + DAY + 30.0),
                SourcePost::new(url("c.jpeg"), FEB28 + 2.0 * DAY + 40.0),
                SourcePost::new(url("late.jpg"), FEB28 + 3.0 * DAY),
            ],
        )
    }

    fn config_for(dir: &Path) -> ScrapeConfig {
        ScrapeConfig {
            output_dir: dir.to_path_buf(),
            ..ScrapeConfig::default()
        }
    }

    fn expected_files() -> [(&'static str, &'static [u8]); 3] {
        [
            ("20160228_000010_a.jpg", b"alpha"),
            ("20160229_000030_b.png", b"bravo"),
            ("20160301_000040_c.jpeg", b"charlie"),
        ]
    }

    #[tokio::test]
    async fn sequential_run_downloads_every_matching_post() {
        let server = media_server().await;
        let dir = tempdir().unwrap();
        let pipeline = ScrapePipeline::new(config_for(dir.path()), fixture(&server)).unwrap();
        let request = ScrapeRequest {
            channel: "wallpapers".into(),
            range: leap_range(),
            mode: DownloadMode::Sequential,
        };

        let summary = pipeline
            .run_once(&request, &mut ScriptedChannelPrompt::default())
            .await
            .unwrap();

        assert_eq!(summary.buckets, 3);
        assert_eq!(summary.harvested, 3);
        assert_eq!(summary.downloaded_files, 3);
        assert_eq!(summary.downloaded_bytes, 17);
        for (name, body) in expected_files() {
            assert_eq!(std::fs::read(dir.path().join(name)).unwrap(), body);
        }
    }

    #[tokio::test]
    async fn concurrent_run_recovers_from_a_bad_channel_name() {
        let server = media_server().await;
        let dir = tempdir().unwrap();
        let pipeline = ScrapePipeline::new(config_for(dir.path()), fixture(&server)).unwrap();
        let request = ScrapeRequest {
            channel: "walpapers".into(),
            range: leap_range(),
            mode: DownloadMode::Concurrent,
        };
        let mut prompt = ScriptedChannelPrompt::new(["wallpapers"]);

        let summary = pipeline.run_once(&request, &mut prompt).await.unwrap();

        assert_eq!(summary.channel, "wallpapers");
        assert_eq!(summary.mode, DownloadMode::Concurrent);
        assert_eq!(prompt.rejected(), ["walpapers".to_string()]);
        let mut names: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        names.sort();
        assert_eq!(
            names,
            expected_files().map(|(name, _)| name.to_string()).to_vec()
        );
    }

    #[tokio::test]
    async fn harvest_only_writes_nothing() {
        let server = media_server().await;
        let dir = tempdir().unwrap();
        let pipeline = ScrapePipeline::new(config_for(dir.path()), fixture(&server)).unwrap();
        let request = ScrapeRequest {
            channel: "wallpapers".into(),
            range: leap_range(),
            mode: DownloadMode::Sequential,
        };

        let harvest = pipeline
            .harvest_only(&request, &mut ScriptedChannelPrompt::default())
            .await
            .unwrap();

        assert_eq!(harvest.records.len(), 3);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn failed_download_fails_the_run() {
        let server = media_server().await;
        let dir = tempdir().unwrap();
        let source = FixtureSource::default().with_channel(
            "wallpapers",
            vec![SourcePost::new(format!("{}/missing.png", server.uri()), FEB28)],
        );
        let pipeline = ScrapePipeline::new(config_for(dir.path()), source).unwrap();
        let request = ScrapeRequest {
            channel: "wallpapers".into(),
            range: leap_range(),
            mode: DownloadMode::Sequential,
        };

        let err = pipeline
            .run_once(&request, &mut ScriptedChannelPrompt::default())
            .await
            .unwrap_err();
        assert!(format!("{err:#}").contains("downloading media"));
    }

    #[test]
    fn yaml_config_fills_defaults() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("rscrape.yaml");
        std::fs::write(
            &file,
            "reddit:\n  client_id: abc\n  username: someone\nextensions: ['.gif', '.png']\nmax_in_flight: 8\n",
        )
        .unwrap();

        let config: ScrapeConfig =
            serde_yaml::from_str(&std::fs::read_to_string(&file).unwrap()).unwrap();

        assert_eq!(config.reddit.client_id, "abc");
        assert_eq!(config.reddit.password, "");
        assert!(config.extensions.matches("x.gif"));
        assert!(!config.extensions.matches("x.jpg"));
        assert_eq!(config.max_in_flight, Some(8));
        assert_eq!(config.http_timeout_secs, 20);
        assert_eq!(config.output_dir, PathBuf::from("."));
        assert_eq!(config.api_base, REDDIT_API_BASE);
    }

    #[test]
    fn overrides_replace_file_values() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("RSCRAPE_PASSWORD", "from-env"),
            ("RSCRAPE_EXTENSIONS", ".webm, .mp4"),
            ("RSCRAPE_HTTP_TIMEOUT_SECS", "45"),
            ("RSCRAPE_MAX_IN_FLIGHT", "not-a-number"),
        ]);

        let config =
            ScrapeConfig::default().with_overrides(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.reddit.password, "from-env");
        assert_eq!(
            config.extensions.as_slice(),
            [".webm".to_string(), ".mp4".to_string()]
        );
        assert_eq!(config.http_config().read_timeout, Duration::from_secs(45));
        assert_eq!(config.http_config().request_timeout, None);
        assert_eq!(
            config.reddit_config().http.request_timeout,
            Some(Duration::from_secs(45))
        );
        assert_eq!(config.max_in_flight, None);
        assert_eq!(config.reddit_config().page_size, REDDIT_MAX_PAGE_SIZE);
    }

    #[test]
    fn missing_config_file_names_the_path() {
        let err = ScrapeConfig::load("/definitely/not/here.yaml").unwrap_err();
        assert!(err.to_string().contains("/definitely/not/here.yaml"));
    }

    #[test]
    fn summary_serializes_mode_in_lowercase() {
        let summary = ScrapeRunSummary {
            run_id: Uuid::nil(),
            started_at: Utc::now(),
            finished_at: Utc::now(),
            channel: "pics".into(),
            buckets: 1,
            harvested: 0,
            downloaded_files: 0,
            downloaded_bytes: 0,
            mode: DownloadMode::Concurrent,
            output_dir: ".".into(),
        };
        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["mode"], "concurrent");
    }
}
