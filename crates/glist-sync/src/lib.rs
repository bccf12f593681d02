//! Sync pipeline: read each configured sheet, reconcile it against the
//! catalog, then write corrections back and render pages once every sheet
//! has resolved.

mod resolver;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use glist_adapters::{
    decode_rows, load_access_token, sheet_range, FixtureSheetStore, GoogleSheetsStore, KeysRowV1,
    RowSchema, ScheduleRowV1, SheetSchema, SheetStore,
};
use glist_core::{CatalogRecord, CellUpdate, SourceRow};
use glist_storage::{
    write_file_atomically, CatalogApi, CatalogClient, CatalogConfig, ImageStore, RateLimitPolicy,
    ResolutionCache, DEFAULT_CATALOG_BASE_URL,
};
use glist_web::{order_schedule, render_keys_page, render_schedule_page, KeyCard, ScheduleCard};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

pub use resolver::{ResolverEngine, SheetLayout, SheetReconciler};

pub const CRATE_NAME: &str = "glist-sync";

pub const DEFAULT_SCHEDULE_HEADING: &str = "Upcoming Games";
pub const DEFAULT_KEYS_HEADING: &str = "Available Keys";

#[derive(Debug, Clone, Deserialize)]
pub struct SheetRegistry {
    pub sheets: Vec<SheetConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SheetConfig {
    pub id: String,
    pub schema: SheetSchema,
    pub enabled: bool,
    pub sheet_name: String,
    /// Column span read from the sheet, e.g. `A:K`.
    pub range: String,
    /// Page file name, relative to the output directory.
    pub output: String,
    #[serde(default)]
    pub spreadsheet_id: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
}

impl SheetConfig {
    pub fn a1_range(&self) -> String {
        sheet_range(&self.sheet_name, &self.range)
    }

    fn heading(&self) -> &str {
        self.title.as_deref().unwrap_or(match self.schema {
            SheetSchema::Schedule => DEFAULT_SCHEDULE_HEADING,
            SheetSchema::Keys => DEFAULT_KEYS_HEADING,
        })
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub spreadsheet_id: Option<String>,
    pub sheet_fixture: Option<PathBuf>,
    pub google_token_path: PathBuf,
    pub catalog_base_url: String,
    pub catalog_key_path: PathBuf,
    pub cache_path: PathBuf,
    pub images_dir: String,
    pub output_dir: PathBuf,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub workspace_root: PathBuf,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let path_var = |name: &str, default: &str| {
            std::env::var(name)
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(default))
        };
        Self {
            spreadsheet_id: std::env::var("SPREADSHEET_ID")
                .ok()
                .filter(|v| !v.trim().is_empty()),
            sheet_fixture: std::env::var("GLIST_SHEET_FIXTURE")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from),
            google_token_path: path_var("GOOGLE_TOKEN_PATH", "token.json"),
            catalog_base_url: std::env::var("CATALOG_BASE_URL")
                .unwrap_or_else(|_| DEFAULT_CATALOG_BASE_URL.to_string()),
            catalog_key_path: path_var("CATALOG_KEY_PATH", "moby.json"),
            cache_path: path_var("RESOLUTION_CACHE_PATH", "games.json"),
            images_dir: std::env::var("IMAGES_DIR").unwrap_or_else(|_| "images".to_string()),
            output_dir: path_var("OUTPUT_DIR", "."),
            user_agent: std::env::var("GLIST_USER_AGENT")
                .unwrap_or_else(|_| "glist-bot/0.1".to_string()),
            http_timeout_secs: std::env::var("GLIST_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            workspace_root: path_var("GLIST_WORKSPACE_ROOT", "."),
        }
    }

    pub fn catalog_config(&self) -> CatalogConfig {
        CatalogConfig {
            base_url: self.catalog_base_url.clone(),
            api_key_path: self.catalog_key_path.clone(),
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            rate_limit: RateLimitPolicy::default(),
        }
    }

    pub fn registry_path(&self) -> PathBuf {
        self.workspace_root.join("sheets.yaml")
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SheetRunSummary {
    pub sheet_id: String,
    pub rows: usize,
    pub rows_resolved: usize,
    pub output: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub enabled_sheets: usize,
    pub sheets: Vec<SheetRunSummary>,
    pub cache_entries: usize,
}

impl SyncRunSummary {
    pub fn rows_resolved(&self) -> usize {
        self.sheets.iter().map(|s| s.rows_resolved).sum()
    }
}

pub struct SyncPipeline {
    config: SyncConfig,
    resolver: ResolverEngine,
    images: ImageStore,
    sheets: Option<Arc<dyn SheetStore>>,
}

impl SyncPipeline {
    /// Build the live pipeline. A missing or malformed catalog key fails here,
    /// before any network call.
    pub fn new(config: SyncConfig) -> Result<Self> {
        let catalog = CatalogClient::new(config.catalog_config())
            .context("configuring catalog client")?;
        let sheets: Option<Box<dyn SheetStore>> = config
            .sheet_fixture
            .clone()
            .map(|path| Box::new(FixtureSheetStore::new(path)) as Box<dyn SheetStore>);
        Self::from_parts(config, Box::new(catalog), sheets)
    }

    /// `sheets` of `None` means one Google Sheets store per configured sheet.
    pub fn from_parts(
        config: SyncConfig,
        catalog: Box<dyn CatalogApi>,
        sheets: Option<Box<dyn SheetStore>>,
    ) -> Result<Self> {
        let cache = ResolutionCache::new(config.cache_path.clone());
        let images = ImageStore::new(config.output_dir.clone(), config.images_dir.clone())?;
        Ok(Self {
            config,
            resolver: ResolverEngine::new(catalog, cache),
            images,
            sheets: sheets.map(Arc::from),
        })
    }

    pub fn resolver(&self) -> &ResolverEngine {
        &self.resolver
    }

    pub fn resolver_mut(&mut self) -> &mut ResolverEngine {
        &mut self.resolver
    }

    pub async fn load_sheet_registry(&self) -> Result<SheetRegistry> {
        let path = self.config.registry_path();
        let text = fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    fn google_store_for(&self, sheet: &SheetConfig) -> Result<Arc<dyn SheetStore>> {
        let spreadsheet_id = sheet
            .spreadsheet_id
            .clone()
            .or_else(|| self.config.spreadsheet_id.clone())
            .with_context(|| format!("no spreadsheet id configured for sheet {}", sheet.id))?;
        let token = load_access_token(&self.config.google_token_path)?;
        Ok(Arc::new(GoogleSheetsStore::new(spreadsheet_id, token)?))
    }

    fn store_for(&self, sheet: &SheetConfig) -> Result<Arc<dyn SheetStore>> {
        match &self.sheets {
            Some(store) => Ok(Arc::clone(store)),
            None => self.google_store_for(sheet),
        }
    }

    /// One full pass over every enabled sheet.
    ///
    /// Every sheet is resolved before anything is written: a catalog failure
    /// on any sheet leaves all sheets, pages and the cache file untouched.
    /// Corrections are then written back one batch per sheet, pages are
    /// rendered, and the resolution cache is saved last.
    pub async fn run_once(&mut self) -> Result<SyncRunSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let registry = self.load_sheet_registry().await?;
        let enabled: Vec<_> = registry.sheets.into_iter().filter(|s| s.enabled).collect();

        let loaded = self.resolver.cache_mut().load().await;
        info!(%run_id, sheets = enabled.len(), cached = loaded, "sync run starting");

        let mut planned = Vec::with_capacity(enabled.len());
        for sheet in &enabled {
            let store = self.store_for(sheet)?;
            let span = info_span!("plan", sheet = %sheet.id, schema = ?sheet.schema);
            let plan = plan_sheet(store.as_ref(), &mut self.resolver, sheet)
                .instrument(span)
                .await
                .with_context(|| format!("syncing sheet {}", sheet.id))?;
            planned.push((sheet, store, plan));
        }

        let mut sheets = Vec::with_capacity(planned.len());
        for (sheet, store, plan) in planned {
            let span = info_span!("publish", sheet = %sheet.id);
            let summary = self
                .publish(sheet, store.as_ref(), plan, started_at)
                .instrument(span)
                .await
                .with_context(|| format!("publishing sheet {}", sheet.id))?;
            sheets.push(summary);
        }

        self.resolver.cache().save().await?;

        Ok(SyncRunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            enabled_sheets: enabled.len(),
            sheets,
            cache_entries: self.resolver.cache().len(),
        })
    }

    async fn publish(
        &self,
        sheet: &SheetConfig,
        store: &dyn SheetStore,
        plan: SheetPlan,
        now: DateTime<Utc>,
    ) -> Result<SheetRunSummary> {
        match plan {
            SheetPlan::Schedule {
                grid,
                updates,
                rows,
            } => {
                let grid = if updates.is_empty() {
                    grid
                } else {
                    store.batch_update(&updates).await?;
                    info!(ranges = updates.len(), "corrections written back");
                    store.read_range(&sheet.a1_range()).await?
                };

                let order = order_schedule(decode_rows::<ScheduleRowV1>(&grid));
                let mut upcoming = Vec::with_capacity(order.upcoming.len());
                for row in &order.upcoming {
                    let image = self.cover_path(row.resolved.cover_url.as_deref()).await;
                    upcoming.push(ScheduleCard::new(row, image));
                }
                let mut completed = Vec::with_capacity(order.completed.len());
                for row in &order.completed {
                    let image = self.cover_path(row.resolved.cover_url.as_deref()).await;
                    completed.push(ScheduleCard::new(row, image));
                }

                let html = render_schedule_page(sheet.heading(), &upcoming, &completed, now)?;
                self.write_page(sheet, &html).await?;
                Ok(SheetRunSummary {
                    sheet_id: sheet.id.clone(),
                    rows,
                    rows_resolved: updates.len() / 2,
                    output: sheet.output.clone(),
                })
            }
            SheetPlan::Keys {
                resolved,
                new_entries,
            } => {
                let mut cards = Vec::with_capacity(resolved.len());
                for (row, record) in &resolved {
                    let image = self.cover_path(record.cover_url.as_deref()).await;
                    cards.push(KeyCard::new(row, record, image));
                }

                let html = render_keys_page(sheet.heading(), &cards, now)?;
                self.write_page(sheet, &html).await?;
                Ok(SheetRunSummary {
                    sheet_id: sheet.id.clone(),
                    rows: resolved.len(),
                    rows_resolved: new_entries,
                    output: sheet.output.clone(),
                })
            }
        }
    }

    /// A failed download only costs the card its cover.
    async fn cover_path(&self, url: Option<&str>) -> Option<String> {
        let url = url?;
        match self.images.fetch_image(url).await {
            Ok(path) => Some(path),
            Err(err) => {
                warn!(%url, error = ?err, "cover image unavailable");
                None
            }
        }
    }

    async fn write_page(&self, sheet: &SheetConfig, html: &str) -> Result<()> {
        let path = self.config.output_dir.join(&sheet.output);
        write_file_atomically(&path, html.as_bytes())
            .await
            .with_context(|| format!("writing page {}", path.display()))?;
        info!(path = %path.display(), "page written");
        Ok(())
    }
}

/// A sheet whose titles are all resolved and whose corrections are pending.
enum SheetPlan {
    Schedule {
        grid: Vec<Vec<String>>,
        updates: Vec<CellUpdate>,
        rows: usize,
    },
    Keys {
        resolved: Vec<(KeysRowV1, CatalogRecord)>,
        new_entries: usize,
    },
}

async fn plan_sheet(
    store: &dyn SheetStore,
    resolver: &mut ResolverEngine,
    sheet: &SheetConfig,
) -> Result<SheetPlan> {
    let grid = store.read_range(&sheet.a1_range()).await?;
    match sheet.schema {
        SheetSchema::Schedule => {
            let rows: Vec<SourceRow> = decode_rows::<ScheduleRowV1>(&grid)
                .iter()
                .map(RowSchema::source_row)
                .collect();
            let layout = SheetLayout::new(
                &sheet.sheet_name,
                ScheduleRowV1::METADATA_COLUMN.unwrap_or(ScheduleRowV1::DETECTED_ID),
            );
            let updates = SheetReconciler::new(resolver, layout)
                .reconcile(&rows)
                .await?;
            Ok(SheetPlan::Schedule {
                grid,
                updates,
                rows: rows.len(),
            })
        }
        SheetSchema::Keys => {
            let mut rows = decode_rows::<KeysRowV1>(&grid);
            rows.sort_by(|a, b| a.title.cmp(&b.title));

            let mut resolved = Vec::with_capacity(rows.len());
            let mut new_entries = 0usize;
            for row in rows {
                if resolver.cache().lookup(&row.title).is_none() {
                    new_entries += 1;
                }
                let record = resolver.resolve(&row.title, None).await?;
                resolved.push((row, record));
            }
            Ok(SheetPlan::Keys {
                resolved,
                new_entries,
            })
        }
    }
}

pub async fn run_sync_once_from_env() -> Result<SyncRunSummary> {
    let config = SyncConfig::from_env();
    let mut pipeline = SyncPipeline::new(config)?;
    pipeline.run_once().await
}
