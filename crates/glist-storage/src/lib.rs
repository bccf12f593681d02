//! Catalog HTTP client, persisted resolution cache and cover image store.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use glist_core::{
    deserialize_null_as_empty, deserialize_opaque_id, CachedResolution, CatalogRecord,
};
use reqwest::StatusCode;
use serde::Deserialize;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "glist-storage";

pub const DEFAULT_CATALOG_BASE_URL: &str = "https://api.mobygames.com/v1";

/// Reserved key in the persisted cache holding the operator note.
pub const CACHE_NOTE_KEY: &str = "_";

pub const CACHE_NOTE: &str = "NOTE: If a game is wrong, you have two options. 1. Fix the game name in the source; 2. add/modify an 'override_id' field with the correct id.";

/// Write `bytes` to `path` through a sibling temp file and a rename, so readers
/// never observe a half-written file.
pub async fn write_file_atomically(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)
        .await
        .with_context(|| format!("creating directory {}", parent.display()))?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp file {}", temp_path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing temp file {}", temp_path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing temp file {}", temp_path.display()))?;
    drop(file);

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| {
            format!(
                "atomically renaming {} -> {}",
                temp_path.display(),
                path.display()
            )
        });
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitPolicy {
    /// Minimum spacing between the starts of two catalog calls.
    pub min_interval: Duration,
    /// Fixed sleep taken when a call comes in too early.
    pub backoff: Duration,
}

impl Default for RateLimitPolicy {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_secs(2),
            backoff: Duration::from_secs(1),
        }
    }
}

/// Call spacing for the catalog API.
///
/// A caller arriving before `min_interval` has passed since the previous call
/// started sleeps for the fixed `backoff` and then proceeds; it is never
/// rejected, and the remaining delay is not computed precisely.
#[derive(Debug)]
pub struct RateLimiter {
    policy: RateLimitPolicy,
    last_call: Mutex<Option<Instant>>,
}

impl RateLimiter {
    pub fn new(policy: RateLimitPolicy) -> Self {
        Self {
            policy,
            last_call: Mutex::new(None),
        }
    }

    pub fn policy(&self) -> RateLimitPolicy {
        self.policy
    }

    /// Wait for permission to start a call. Returns whether a backoff was taken.
    pub async fn acquire(&self) -> bool {
        let mut last_call = self.last_call.lock().await;
        let mut waited = false;
        if let Some(previous) = *last_call {
            if previous.elapsed() < self.policy.min_interval {
                info!(
                    backoff_ms = self.policy.backoff.as_millis() as u64,
                    "sleeping to respect catalog rate limit"
                );
                tokio::time::sleep(self.policy.backoff).await;
                waited = true;
            }
        }
        *last_call = Some(Instant::now());
        waited
    }
}

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("reading catalog api key {path}: {source}")]
    MissingApiKey {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing catalog api key {path}: {source}")]
    InvalidApiKey {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("catalog api key in {0} is empty")]
    EmptyApiKey(String),
    #[error("building catalog http client: {0}")]
    Client(#[source] reqwest::Error),
    #[error("catalog request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {path}")]
    HttpStatus { status: u16, path: String },
    #[error("catalog has no game with id {0}")]
    NotFound(String),
    #[error("decoding catalog response for {path}: {source}")]
    Decode {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

impl CatalogError {
    pub fn is_config(&self) -> bool {
        matches!(
            self,
            Self::MissingApiKey { .. } | Self::InvalidApiKey { .. } | Self::EmptyApiKey(_)
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// Lookup operations the resolver needs from the game catalog.
#[async_trait]
pub trait CatalogApi: Send + Sync {
    /// Matches in the catalog's own relevance order; may be empty.
    async fn search_by_title(&self, title: &str) -> Result<Vec<CatalogRecord>, CatalogError>;

    /// Fails with [`CatalogError::NotFound`] when the id is unknown upstream.
    async fn fetch_by_id(&self, id: &str) -> Result<CatalogRecord, CatalogError>;
}

#[derive(Debug, Clone)]
pub struct CatalogConfig {
    pub base_url: String,
    pub api_key_path: PathBuf,
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub rate_limit: RateLimitPolicy,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_CATALOG_BASE_URL.to_string(),
            api_key_path: PathBuf::from("moby.json"),
            timeout: Duration::from_secs(20),
            user_agent: None,
            rate_limit: RateLimitPolicy::default(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ApiKeyFile {
    api_key: String,
}

pub fn load_api_key(path: &Path) -> Result<String, CatalogError> {
    let display = path.display().to_string();
    let text = std::fs::read_to_string(path).map_err(|source| CatalogError::MissingApiKey {
        path: display.clone(),
        source,
    })?;
    let parsed: ApiKeyFile =
        serde_json::from_str(&text).map_err(|source| CatalogError::InvalidApiKey {
            path: display.clone(),
            source,
        })?;
    let key = parsed.api_key.trim().to_string();
    if key.is_empty() {
        return Err(CatalogError::EmptyApiKey(display));
    }
    Ok(key)
}

#[derive(Debug, Deserialize)]
struct WireGame {
    #[serde(deserialize_with = "deserialize_opaque_id")]
    game_id: String,
    title: String,
    #[serde(default, deserialize_with = "deserialize_null_as_empty")]
    description: String,
    #[serde(default)]
    sample_cover: Option<WireCover>,
}

#[derive(Debug, Deserialize)]
struct WireCover {
    #[serde(default)]
    image: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum WireSearch {
    Bare(Vec<WireGame>),
    Wrapped { games: Vec<WireGame> },
}

impl From<WireGame> for CatalogRecord {
    fn from(game: WireGame) -> Self {
        let cover_url = game
            .sample_cover
            .and_then(|c| c.image)
            .filter(|url| !url.trim().is_empty());
        CatalogRecord {
            catalog_id: game.game_id,
            title: game.title,
            description: game.description,
            cover_url,
        }
    }
}

pub fn parse_search_body(body: &[u8]) -> Result<Vec<CatalogRecord>, serde_json::Error> {
    let games = match serde_json::from_slice::<WireSearch>(body)? {
        WireSearch::Bare(games) => games,
        WireSearch::Wrapped { games } => games,
    };
    Ok(games.into_iter().map(CatalogRecord::from).collect())
}

pub fn parse_game_body(body: &[u8]) -> Result<CatalogRecord, serde_json::Error> {
    serde_json::from_slice::<WireGame>(body).map(CatalogRecord::from)
}

/// Rate-limited client over the catalog REST API.
#[derive(Debug)]
pub struct CatalogClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    limiter: RateLimiter,
}

impl CatalogClient {
    /// Loads the API key up front; a missing key file is a configuration error.
    pub fn new(config: CatalogConfig) -> Result<Self, CatalogError> {
        let api_key = load_api_key(&config.api_key_path)?;

        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build().map_err(CatalogError::Client)?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key,
            limiter: RateLimiter::new(config.rate_limit),
        })
    }

    async fn get(&self, path: &str, query: &[(&str, &str)]) -> Result<Vec<u8>, CatalogError> {
        self.limiter.acquire().await;

        let url = format!("{}{}", self.base_url, path);
        let span = info_span!("catalog_call", path);
        async {
            let resp = self
                .client
                .get(&url)
                .query(&[("api_key", self.api_key.as_str()), ("format", "normal")])
                .query(query)
                .send()
                .await
                .map_err(|e| CatalogError::Request(e.without_url()))?;

            let status = resp.status();
            if !status.is_success() {
                return Err(CatalogError::HttpStatus {
                    status: status.as_u16(),
                    path: path.to_string(),
                });
            }
            let body = resp
                .bytes()
                .await
                .map_err(|e| CatalogError::Request(e.without_url()))?;
            debug!(bytes = body.len(), "catalog response received");
            Ok(body.to_vec())
        }
        .instrument(span)
        .await
    }
}

#[async_trait]
impl CatalogApi for CatalogClient {
    async fn search_by_title(&self, title: &str) -> Result<Vec<CatalogRecord>, CatalogError> {
        let path = "/search";
        let body = self.get(path, &[("title", title)]).await?;
        parse_search_body(&body).map_err(|source| CatalogError::Decode {
            path: path.to_string(),
            source,
        })
    }

    async fn fetch_by_id(&self, id: &str) -> Result<CatalogRecord, CatalogError> {
        let path = format!("/games/{}", urlencoding::encode(id));
        let body = match self.get(&path, &[]).await {
            Ok(body) => body,
            Err(CatalogError::HttpStatus { status, .. })
                if status == StatusCode::NOT_FOUND.as_u16() =>
            {
                return Err(CatalogError::NotFound(id.to_string()));
            }
            Err(err) => return Err(err),
        };
        parse_game_body(&body).map_err(|source| CatalogError::Decode { path, source })
    }
}

/// Title → resolution map persisted as one JSON object.
#[derive(Debug, Clone)]
pub struct ResolutionCache {
    path: PathBuf,
    entries: BTreeMap<String, CachedResolution>,
}

impl ResolutionCache {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            entries: BTreeMap::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Merge the persisted file into memory. Never fails: a missing or
    /// unreadable file leaves the cache as it was and is logged.
    pub async fn load(&mut self) -> usize {
        let text = match fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "no resolution cache on disk yet");
                return 0;
            }
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "couldn't read resolution cache");
                return 0;
            }
        };

        let raw: BTreeMap<String, serde_json::Value> = match serde_json::from_str(&text) {
            Ok(raw) => raw,
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "couldn't parse resolution cache, starting empty");
                return 0;
            }
        };

        let mut loaded = 0usize;
        for (title, value) in raw {
            if title == CACHE_NOTE_KEY {
                continue;
            }
            match serde_json::from_value::<CachedResolution>(value) {
                Ok(entry) => {
                    self.entries.insert(title, entry);
                    loaded += 1;
                }
                Err(err) => warn!(%title, error = %err, "skipping malformed cache entry"),
            }
        }
        debug!(path = %self.path.display(), loaded, "resolution cache loaded");
        loaded
    }

    /// Overwrite the persisted file with the full in-memory map.
    pub async fn save(&self) -> anyhow::Result<()> {
        let mut out = serde_json::Map::new();
        out.insert(
            CACHE_NOTE_KEY.to_string(),
            serde_json::Value::String(CACHE_NOTE.to_string()),
        );
        for (title, entry) in &self.entries {
            out.insert(
                title.clone(),
                serde_json::to_value(entry).context("serializing cache entry")?,
            );
        }
        let bytes = serde_json::to_vec_pretty(&out).context("serializing resolution cache")?;
        write_file_atomically(&self.path, &bytes)
            .await
            .with_context(|| format!("saving resolution cache {}", self.path.display()))?;
        info!(path = %self.path.display(), entries = self.entries.len(), "resolution cache saved");
        Ok(())
    }

    pub fn lookup(&self, title: &str) -> Option<&CachedResolution> {
        self.entries.get(title)
    }

    pub fn insert(&mut self, title: &str, record: &CatalogRecord) -> &CachedResolution {
        self.entries
            .insert(title.to_string(), CachedResolution::from_record(record));
        &self.entries[title]
    }

    pub fn forget(&mut self, title: &str) -> Option<CachedResolution> {
        self.entries.remove(title)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &CachedResolution)> {
        self.entries.iter()
    }
}

/// File name a cover is cached under: the percent-decoded last path segment.
pub fn image_file_name(url: &str) -> Option<String> {
    let parsed = reqwest::Url::parse(url).ok()?;
    let segment = parsed.path_segments()?.last()?.to_string();
    let decoded = urlencoding::decode(&segment).ok()?.into_owned();
    let name = decoded.rsplit(|c| c == '/' || c == '\\').next()?.trim().to_string();
    if name.is_empty() || name == "." || name == ".." {
        None
    } else {
        Some(name)
    }
}

/// Cover image cache living next to the rendered pages.
#[derive(Debug, Clone)]
pub struct ImageStore {
    output_dir: PathBuf,
    images_dir: String,
    client: reqwest::Client,
}

impl ImageStore {
    pub fn new(output_dir: impl Into<PathBuf>, images_dir: impl Into<String>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .context("building image http client")?;
        Ok(Self {
            output_dir: output_dir.into(),
            images_dir: images_dir.into().trim_matches('/').to_string(),
            client,
        })
    }

    /// Download `url` unless a file with the same name is already cached.
    /// Returns the path relative to the output directory.
    pub async fn fetch_image(&self, url: &str) -> anyhow::Result<String> {
        let name = image_file_name(url).with_context(|| format!("no file name in image url {url}"))?;
        let relative = format!("{}/{}", self.images_dir, name);
        let absolute = self.output_dir.join(&self.images_dir).join(&name);

        if fs::try_exists(&absolute)
            .await
            .with_context(|| format!("checking image path {}", absolute.display()))?
        {
            return Ok(relative);
        }

        let bytes = self
            .client
            .get(url)
            .send()
            .await
            .and_then(|resp| resp.error_for_status())
            .with_context(|| format!("downloading {url}"))?
            .bytes()
            .await
            .with_context(|| format!("reading body of {url}"))?;
        write_file_atomically(&absolute, &bytes).await?;
        debug!(%url, path = %absolute.display(), "cover image cached");
        Ok(relative)
    }
}
