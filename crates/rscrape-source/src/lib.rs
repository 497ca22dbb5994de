//! Submission source contracts, the Reddit and fixture sources, and the day-bucket harvester.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::fs;
use std::path::Path;
use std::time::Instant;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::header::LOCATION;
use reqwest::StatusCode;
use rscrape_core::{created_label, DateBucket, DateError, Extensions, HarvestResult, SubmissionRecord};
use rscrape_storage::HttpClientConfig;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, info_span, warn, Instrument};

pub const CRATE_NAME: &str = "rscrape-source";

pub const REDDIT_AUTH_URL: &str = "https://www.reddit.com/api/v1/access_token";
pub const REDDIT_API_BASE: &str = "https://oauth.reddit.com";
/// Reddit caps listing pages at 100 children.
pub const REDDIT_MAX_PAGE_SIZE: u32 = 100;

/// Subreddit names are letters, digits and underscores only.
pub fn is_valid_channel_name(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// A post as reported by a submission source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourcePost {
    pub url: String,
    pub created_utc: f64,
}

impl SourcePost {
    pub fn new(url: impl Into<String>, created_utc: f64) -> Self {
        Self {
            url: url.into(),
            created_utc,
        }
    }
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("channel r/{0} does not exist")]
    ChannelNotFound(String),
    #[error("channel r/{channel} redirected to {location:?}")]
    ChannelRedirect { channel: String, location: String },
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("malformed response: {0}")]
    Malformed(String),
}

impl SourceError {
    /// Errors meaning the channel name itself is wrong, as opposed to a transport failure.
    pub fn is_invalid_channel(&self) -> bool {
        matches!(
            self,
            SourceError::ChannelNotFound(_) | SourceError::ChannelRedirect { .. }
        )
    }
}

#[async_trait]
pub trait SubmissionSource: Send + Sync {
    type Session: Send + Sync;

    fn source_id(&self) -> &'static str;

    async fn authenticate(&self) -> Result<Self::Session, SourceError>;

    /// Every post in `channel` created inside `bucket`, in the source's own order.
    async fn query(
        &self,
        session: &Self::Session,
        channel: &str,
        bucket: &DateBucket,
    ) -> Result<Vec<SourcePost>, SourceError>;
}

#[derive(Clone, Default, Deserialize)]
#[serde(default)]
pub struct RedditCredentials {
    pub client_id: String,
    pub client_secret: String,
    pub username: String,
    pub password: String,
}

impl fmt::Debug for RedditCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedditCredentials")
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct RedditSourceConfig {
    pub credentials: RedditCredentials,
    pub auth_url: String,
    pub api_base: String,
    pub page_size: u32,
    pub http: HttpClientConfig,
}

impl RedditSourceConfig {
    pub fn new(credentials: RedditCredentials, http: HttpClientConfig) -> Self {
        Self {
            credentials,
            auth_url: REDDIT_AUTH_URL.to_string(),
            api_base: REDDIT_API_BASE.to_string(),
            page_size: REDDIT_MAX_PAGE_SIZE,
            http,
        }
    }
}

/// Access token plus the newest-first listing pulled so far for one channel.
///
/// Buckets of one harvest share the cache, so each listing page is fetched once.
#[derive(Debug)]
pub struct RedditSession {
    access_token: String,
    listing: Mutex<ListingCache>,
}

impl RedditSession {
    fn new(access_token: String) -> Self {
        Self {
            access_token,
            listing: Mutex::new(ListingCache::default()),
        }
    }
}

#[derive(Debug, Default)]
struct ListingCache {
    channel: String,
    posts: Vec<SourcePost>,
    after: Option<String>,
    oldest: Option<f64>,
    exhausted: bool,
}

impl ListingCache {
    fn for_channel(channel: &str) -> Self {
        Self {
            channel: channel.to_string(),
            ..Self::default()
        }
    }

    fn covers(&self, start: f64) -> bool {
        self.exhausted || self.oldest.is_some_and(|oldest| oldest < start)
    }

    fn absorb(&mut self, page: ListingData) {
        if page.children.is_empty() {
            self.exhausted = true;
        }
        for child in page.children {
            let post = child.data;
            self.oldest = Some(self.oldest.map_or(post.created_utc, |o| o.min(post.created_utc)));
            if let Some(url) = post.url {
                self.posts.push(SourcePost::new(url, post.created_utc));
            }
        }
        match page.after {
            Some(next) if !next.is_empty() => self.after = Some(next),
            _ => self.exhausted = true,
        }
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Listing {
    data: ListingData,
}

#[derive(Debug, Deserialize)]
struct ListingData {
    #[serde(default)]
    after: Option<String>,
    #[serde(default)]
    children: Vec<ListingChild>,
}

#[derive(Debug, Deserialize)]
struct ListingChild {
    data: ListingPost,
}

#[derive(Debug, Deserialize)]
struct ListingPost {
    #[serde(default)]
    url: Option<String>,
    created_utc: f64,
}

/// Reddit OAuth client walking `/r/{channel}/new` back through time.
///
/// Listings are newest first, so paging stops at the first post older than the
/// bucket. Reddit only exposes roughly the latest thousand posts per listing.
#[derive(Debug)]
pub struct RedditSource {
    client: reqwest::Client,
    config: RedditSourceConfig,
}

impl RedditSource {
    pub fn new(config: RedditSourceConfig) -> Result<Self> {
        let client = config
            .http
            .client_builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .context("building reddit client")?;
        Ok(Self { client, config })
    }

    fn listing_url(&self, channel: &str) -> String {
        format!(
            "{}/r/{}/new",
            self.config.api_base.trim_end_matches('/'),
            channel
        )
    }

    async fn fetch_page(
        &self,
        session: &RedditSession,
        channel: &str,
        after: Option<&str>,
    ) -> Result<ListingData, SourceError> {
        let page_size = self.config.page_size.clamp(1, REDDIT_MAX_PAGE_SIZE).to_string();
        let mut request = self
            .client
            .get(self.listing_url(channel))
            .bearer_auth(&session.access_token)
            .query(&[("limit", page_size.as_str()), ("raw_json", "1")]);
        if let Some(after) = after {
            request = request.query(&[("after", after)]);
        }

        let resp = request.send().await?;
        let status = resp.status();
        if status.is_redirection() {
            let location = resp
                .headers()
                .get(LOCATION)
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .to_string();
            return Err(SourceError::ChannelRedirect {
                channel: channel.to_string(),
                location,
            });
        }
        if status == StatusCode::NOT_FOUND {
            return Err(SourceError::ChannelNotFound(channel.to_string()));
        }
        if !status.is_success() {
            return Err(SourceError::HttpStatus {
                status: status.as_u16(),
                url: resp.url().to_string(),
            });
        }

        let listing: Listing = resp
            .json()
            .await
            .map_err(|e| SourceError::Malformed(format!("listing for r/{channel}: {e}")))?;
        Ok(listing.data)
    }
}

#[async_trait]
impl SubmissionSource for RedditSource {
    type Session = RedditSession;

    fn source_id(&self) -> &'static str {
        "reddit"
    }

    async fn authenticate(&self) -> Result<RedditSession, SourceError> {
        let creds = &self.config.credentials;
        let resp = self
            .client
            .post(&self.config.auth_url)
            .basic_auth(&creds.client_id, Some(&creds.client_secret))
            .form(&[
                ("grant_type", "password"),
                ("username", creds.username.as_str()),
                ("password", creds.password.as_str()),
            ])
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            return Err(SourceError::Auth(format!("http status {status}")));
        }
        let token: TokenResponse = resp
            .json()
            .await
            .map_err(|e| SourceError::Malformed(format!("token response: {e}")))?;
        match (token.access_token, token.error) {
            (_, Some(error)) => Err(SourceError::Auth(error)),
            (Some(access_token), None) => Ok(RedditSession::new(access_token)),
            (None, None) => Err(SourceError::Auth("no access token issued".to_string())),
        }
    }

    async fn query(
        &self,
        session: &RedditSession,
        channel: &str,
        bucket: &DateBucket,
    ) -> Result<Vec<SourcePost>, SourceError> {
        if !is_valid_channel_name(channel) {
            return Err(SourceError::ChannelNotFound(channel.to_string()));
        }
        let start = bucket.start_epoch_seconds();
        let mut cache = session.listing.lock().await;
        if cache.channel != channel {
            *cache = ListingCache::for_channel(channel);
        }

        async {
            while !cache.covers(start) {
                let page = self
                    .fetch_page(session, channel, cache.after.as_deref())
                    .await?;
                cache.absorb(page);
                debug!(cached = cache.posts.len(), "listing page fetched");
            }
            Ok::<_, SourceError>(())
        }
        .instrument(info_span!("reddit_query", channel, day = %bucket.day()))
        .await?;

        Ok(cache
            .posts
            .iter()
            .filter(|post| bucket.contains(post.created_utc))
            .cloned()
            .collect())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FixtureDocument {
    pub channels: BTreeMap<String, Vec<SourcePost>>,
}

/// Offline source backed by a JSON document of posts per channel.
#[derive(Debug, Clone, Default)]
pub struct FixtureSource {
    channels: BTreeMap<String, Vec<SourcePost>>,
}

impl FixtureSource {
    pub fn new(document: FixtureDocument) -> Self {
        Self {
            channels: document.channels,
        }
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let document: FixtureDocument = read_json_file(path)?;
        Ok(Self::new(document))
    }

    pub fn with_channel(mut self, channel: impl Into<String>, posts: Vec<SourcePost>) -> Self {
        self.channels.insert(channel.into(), posts);
        self
    }
}

fn read_json_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

#[async_trait]
impl SubmissionSource for FixtureSource {
    type Session = ();

    fn source_id(&self) -> &'static str {
        "fixture"
    }

    async fn authenticate(&self) -> Result<(), SourceError> {
        Ok(())
    }

    async fn query(
        &self,
        _session: &(),
        channel: &str,
        bucket: &DateBucket,
    ) -> Result<Vec<SourcePost>, SourceError> {
        let posts = self
            .channels
            .get(channel)
            .ok_or_else(|| SourceError::ChannelNotFound(channel.to_string()))?;
        Ok(posts
            .iter()
            .filter(|post| bucket.contains(post.created_utc))
            .cloned()
            .collect())
    }
}

/// Supplies a new channel name after the source rejected one.
#[async_trait]
pub trait ChannelPrompt: Send {
    /// `Ok(None)` means no more input is available.
    async fn replacement_channel(&mut self, rejected: &str) -> Result<Option<String>>;
}

/// Replays a fixed list of replacement names.
#[derive(Debug, Clone, Default)]
pub struct ScriptedChannelPrompt {
    replies: VecDeque<String>,
    rejected: Vec<String>,
}

impl ScriptedChannelPrompt {
    pub fn new<I, S>(replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            replies: replies.into_iter().map(Into::into).collect(),
            rejected: Vec::new(),
        }
    }

    /// Channel names that triggered a prompt, in order.
    pub fn rejected(&self) -> &[String] {
        &self.rejected
    }
}

#[async_trait]
impl ChannelPrompt for ScriptedChannelPrompt {
    async fn replacement_channel(&mut self, rejected: &str) -> Result<Option<String>> {
        self.rejected.push(rejected.to_string());
        Ok(self.replies.pop_front())
    }
}

#[derive(Debug, Error)]
pub enum HarvestError {
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error("channel r/{channel} was rejected and no replacement was given")]
    PromptClosed { channel: String },
    #[error("reading replacement channel: {0:#}")]
    Prompt(anyhow::Error),
    #[error(transparent)]
    Timestamp(#[from] DateError),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Harvest {
    /// Channel name in effect at the end, after any replacements.
    pub channel: String,
    pub records: HarvestResult,
}

/// Pulls every linked post with a wanted extension from each day bucket.
pub struct Harvester<S> {
    source: S,
    extensions: Extensions,
}

impl<S: SubmissionSource> Harvester<S> {
    pub fn new(source: S, extensions: Extensions) -> Self {
        Self { source, extensions }
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub async fn harvest(
        &self,
        channel: &str,
        buckets: &[DateBucket],
        prompt: &mut dyn ChannelPrompt,
    ) -> Result<Harvest, HarvestError> {
        let started = Instant::now();
        info!(
            source = self.source.source_id(),
            channel,
            buckets = buckets.len(),
            "retrieving submissions"
        );

        let session = self.source.authenticate().await?;
        let mut channel = channel.to_string();
        let mut records = Vec::new();

        for bucket in buckets {
            let posts = loop {
                match self.source.query(&session, &channel, bucket).await {
                    Ok(posts) => break posts,
                    Err(err) if err.is_invalid_channel() => {
                        warn!(channel = %channel, error = %err, "channel rejected");
                        let replacement = prompt
                            .replacement_channel(&channel)
                            .await
                            .map_err(HarvestError::Prompt)?;
                        match replacement {
                            Some(next) => channel = next,
                            None => return Err(HarvestError::PromptClosed { channel }),
                        }
                    }
                    Err(err) => return Err(err.into()),
                }
            };

            let before = records.len();
            for post in posts {
                if self.extensions.matches(&post.url) {
                    let label = created_label(post.created_utc)?;
                    records.push(SubmissionRecord::new(post.url, label));
                }
            }
            info!(day = %bucket.day(), kept = records.len() - before, "bucket harvested");
        }

        info!(
            channel = %channel,
            records = records.len(),
            elapsed_secs = started.elapsed().as_secs_f64(),
            "retrieval of submissions complete"
        );
        Ok(Harvest { channel, records })
    }
}
