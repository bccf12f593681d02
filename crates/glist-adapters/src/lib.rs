//! Sheet row schemas and the transports that read and write sheet ranges.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use glist_core::{
    column_index, quote_sheet_name, unquote_sheet_name, CellRefError, CellUpdate,
    ResolvedColumns, SourceRow,
};
use glist_storage::write_file_atomically;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, info};

pub const CRATE_NAME: &str = "glist-adapters";

pub const SHEETS_API_BASE: &str = "https://sheets.googleapis.com/v4/spreadsheets";

pub const GOOGLE_ACCESS_TOKEN_ENV: &str = "GOOGLE_ACCESS_TOKEN";

/// Sheet layouts the pipeline knows how to decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SheetSchema {
    Schedule,
    Keys,
}

impl SheetSchema {
    pub fn metadata_column(self) -> Option<usize> {
        match self {
            Self::Schedule => ScheduleRowV1::METADATA_COLUMN,
            Self::Keys => KeysRowV1::METADATA_COLUMN,
        }
    }
}

/// Named decoding of one sheet variant's positional cells.
pub trait RowSchema: Sized {
    const SCHEMA: SheetSchema;
    const VERSION: u32;
    /// First column of the `{detected_id, override_id, cover_url, description}`
    /// block, when the variant carries one.
    const METADATA_COLUMN: Option<usize>;

    /// Called only for rows with a non-empty title cell.
    fn decode(row_number: u32, cells: &[String]) -> Self;

    fn source_row(&self) -> SourceRow;
}

/// Decode a grid read from the sheet. Row 1 is the header and is skipped;
/// untitled rows are dropped but still count towards row numbering.
pub fn decode_rows<R: RowSchema>(grid: &[Vec<String>]) -> Vec<R> {
    grid.iter()
        .enumerate()
        .skip(1)
        .filter(|(_, cells)| cells.first().is_some_and(|t| !t.trim().is_empty()))
        .map(|(idx, cells)| R::decode(idx as u32 + 1, cells))
        .collect()
}

fn text_cell(cells: &[String], idx: usize) -> Option<String> {
    cells
        .get(idx)
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .map(ToString::to_string)
}

fn resolved_cells(cells: &[String], start: usize) -> ResolvedColumns {
    ResolvedColumns {
        detected_id: text_cell(cells, start),
        override_id: text_cell(cells, start + 1),
        cover_url: text_cell(cells, start + 2),
        description: text_cell(cells, start + 3),
    }
}

/// Upcoming-games schedule, columns A..K.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScheduleRowV1 {
    pub row_number: u32,
    pub title: String,
    /// `None` for streamer-chosen games.
    pub votes: Option<u32>,
    pub date_suggested: String,
    pub attribution: Option<String>,
    pub provider: Option<String>,
    pub notes: Option<String>,
    pub completed: Option<String>,
    pub resolved: ResolvedColumns,
}

impl ScheduleRowV1 {
    pub const TITLE: usize = 0;
    pub const VOTES: usize = 1;
    pub const DATE_SUGGESTED: usize = 2;
    pub const ATTRIBUTION: usize = 3;
    pub const PROVIDER: usize = 4;
    pub const NOTES: usize = 5;
    pub const COMPLETED: usize = 6;
    pub const DETECTED_ID: usize = 7;

    /// Vote counts above this are placeholders, not real votes.
    pub const MAX_VOTES: u32 = 1000;
    pub const DEFAULT_DATE_SUGGESTED: &'static str = "2000-01-01";
}

impl RowSchema for ScheduleRowV1 {
    const SCHEMA: SheetSchema = SheetSchema::Schedule;
    const VERSION: u32 = 1;
    const METADATA_COLUMN: Option<usize> = Some(Self::DETECTED_ID);

    fn decode(row_number: u32, cells: &[String]) -> Self {
        let votes = text_cell(cells, Self::VOTES)
            .and_then(|v| v.parse::<u32>().ok())
            .filter(|v| *v > 0 && *v <= Self::MAX_VOTES);
        Self {
            row_number,
            title: cells.get(Self::TITLE).cloned().unwrap_or_default(),
            votes,
            date_suggested: text_cell(cells, Self::DATE_SUGGESTED)
                .unwrap_or_else(|| Self::DEFAULT_DATE_SUGGESTED.to_string()),
            attribution: text_cell(cells, Self::ATTRIBUTION),
            provider: text_cell(cells, Self::PROVIDER),
            notes: text_cell(cells, Self::NOTES),
            completed: text_cell(cells, Self::COMPLETED),
            resolved: resolved_cells(cells, Self::DETECTED_ID),
        }
    }

    fn source_row(&self) -> SourceRow {
        SourceRow {
            row_number: self.row_number,
            title: self.title.clone(),
            resolved: self.resolved.clone(),
        }
    }
}

/// Redeemable key list, columns A..B. Carries no metadata block; titles are
/// resolved through the cache only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KeysRowV1 {
    pub row_number: u32,
    pub title: String,
    pub platform: String,
}

impl RowSchema for KeysRowV1 {
    const SCHEMA: SheetSchema = SheetSchema::Keys;
    const VERSION: u32 = 1;
    const METADATA_COLUMN: Option<usize> = None;

    fn decode(row_number: u32, cells: &[String]) -> Self {
        Self {
            row_number,
            title: cells.first().cloned().unwrap_or_default(),
            platform: text_cell(cells, 1).unwrap_or_default(),
        }
    }

    fn source_row(&self) -> SourceRow {
        SourceRow {
            row_number: self.row_number,
            title: self.title.clone(),
            resolved: ResolvedColumns::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum SheetError {
    #[error("reading google token {path}: {source}")]
    MissingToken {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing google token {path}: {source}")]
    InvalidToken {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("google token file {0} holds no access token")]
    EmptyToken(String),
    #[error("sheets request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {range}")]
    HttpStatus { status: u16, range: String },
    #[error("decoding sheet values for {range}: {source}")]
    Decode {
        range: String,
        #[source]
        source: serde_json::Error,
    },
    #[error(transparent)]
    CellRef(#[from] CellRefError),
    #[error("no sheet named {0}")]
    UnknownSheet(String),
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

/// Read/write access to the source-of-truth grid.
#[async_trait]
pub trait SheetStore: Send + Sync {
    async fn read_range(&self, range: &str) -> Result<Vec<Vec<String>>, SheetError>;

    /// Apply every update in one request; either all land or none do.
    async fn batch_update(&self, updates: &[CellUpdate]) -> Result<(), SheetError>;
}

/// `Schedule` + `A:K` → `Schedule!A:K`.
pub fn sheet_range(sheet_name: &str, columns: &str) -> String {
    format!("{}!{}", quote_sheet_name(sheet_name), columns)
}

fn split_range(range: &str) -> (String, Option<&str>) {
    match range.rsplit_once('!') {
        Some((sheet, span)) => (unquote_sheet_name(sheet), Some(span)),
        None => (unquote_sheet_name(range), None),
    }
}

/// Column bounds of an A1 span such as `A:K` or `B2:D40`; `None` as the upper
/// bound means open-ended.
fn column_span(span: &str) -> Option<(usize, Option<usize>)> {
    let mut parts = span.split(':');
    let letters = |s: &str| s.chars().take_while(char::is_ascii_alphabetic).collect::<String>();
    let start = column_index(&letters(parts.next()?))?;
    let end = parts.next().and_then(|p| column_index(&letters(p)));
    Some((start, end))
}

fn cell_text(value: &JsonValue) -> String {
    match value {
        JsonValue::String(s) => s.clone(),
        JsonValue::Null => String::new(),
        other => other.to_string(),
    }
}

#[derive(Debug, Deserialize)]
struct TokenFile {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    access_token: Option<String>,
}

/// Bearer token for the Sheets API: the environment wins over the token file.
pub fn load_access_token(path: &Path) -> Result<String, SheetError> {
    if let Ok(token) = std::env::var(GOOGLE_ACCESS_TOKEN_ENV) {
        if !token.trim().is_empty() {
            return Ok(token.trim().to_string());
        }
    }
    let display = path.display().to_string();
    let text = std::fs::read_to_string(path).map_err(|source| SheetError::MissingToken {
        path: display.clone(),
        source,
    })?;
    let parsed: TokenFile =
        serde_json::from_str(&text).map_err(|source| SheetError::InvalidToken {
            path: display.clone(),
            source,
        })?;
    parsed
        .token
        .or(parsed.access_token)
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .ok_or(SheetError::EmptyToken(display))
}

#[derive(Debug, Deserialize)]
struct WireValueRange {
    #[serde(default)]
    values: Vec<Vec<JsonValue>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct BatchUpdateBody<'a> {
    value_input_option: &'static str,
    data: &'a [CellUpdate],
}

/// Google Sheets v4 values API.
#[derive(Debug, Clone)]
pub struct GoogleSheetsStore {
    client: reqwest::Client,
    spreadsheet_id: String,
    access_token: String,
}

impl GoogleSheetsStore {
    pub fn new(
        spreadsheet_id: impl Into<String>,
        access_token: impl Into<String>,
    ) -> Result<Self, SheetError> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            spreadsheet_id: spreadsheet_id.into(),
            access_token: access_token.into(),
        })
    }

    fn values_url(&self, suffix: &str) -> String {
        format!(
            "{}/{}/values{}",
            SHEETS_API_BASE,
            urlencoding::encode(&self.spreadsheet_id),
            suffix
        )
    }
}

#[async_trait]
impl SheetStore for GoogleSheetsStore {
    async fn read_range(&self, range: &str) -> Result<Vec<Vec<String>>, SheetError> {
        let url = self.values_url(&format!("/{}", urlencoding::encode(range)));
        let resp = self
            .client
            .get(&url)
            .bearer_auth(&self.access_token)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(SheetError::HttpStatus {
                status: status.as_u16(),
                range: range.to_string(),
            });
        }
        let body = resp.bytes().await?;
        let wire: WireValueRange =
            serde_json::from_slice(&body).map_err(|source| SheetError::Decode {
                range: range.to_string(),
                source,
            })?;
        debug!(range, rows = wire.values.len(), "sheet range read");
        Ok(wire
            .values
            .iter()
            .map(|row| row.iter().map(cell_text).collect())
            .collect())
    }

    async fn batch_update(&self, updates: &[CellUpdate]) -> Result<(), SheetError> {
        if updates.is_empty() {
            return Ok(());
        }
        let resp = self
            .client
            .post(self.values_url(":batchUpdate"))
            .bearer_auth(&self.access_token)
            .json(&BatchUpdateBody {
                value_input_option: "RAW",
                data: updates,
            })
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(SheetError::HttpStatus {
                status: status.as_u16(),
                range: format!("batchUpdate ({} ranges)", updates.len()),
            });
        }
        info!(ranges = updates.len(), "sheet batch update applied");
        Ok(())
    }
}

/// Spreadsheet snapshot kept as JSON: sheet name → grid of cells.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixtureWorkbook {
    pub sheets: BTreeMap<String, Vec<Vec<String>>>,
}

impl FixtureWorkbook {
    pub fn read(&self, range: &str) -> Result<Vec<Vec<String>>, SheetError> {
        let (sheet, span) = split_range(range);
        let grid = self
            .sheets
            .get(&sheet)
            .ok_or_else(|| SheetError::UnknownSheet(sheet.clone()))?;
        let Some((start, end)) = span.and_then(column_span) else {
            return Ok(grid.clone());
        };
        Ok(grid
            .iter()
            .map(|row| {
                let stop = end.map_or(row.len(), |e| (e + 1).min(row.len()));
                row.get(start..stop).map(<[String]>::to_vec).unwrap_or_default()
            })
            .collect())
    }

    /// Validates every target before touching any cell.
    pub fn apply(&mut self, updates: &[CellUpdate]) -> Result<(), SheetError> {
        let targets = updates
            .iter()
            .map(CellUpdate::target)
            .collect::<Result<Vec<_>, _>>()?;

        for (target, update) in targets.into_iter().zip(updates) {
            let grid = self.sheets.entry(target.sheet.clone()).or_default();
            for (offset, values) in update.values.iter().enumerate() {
                let row_idx = target.row as usize - 1 + offset;
                if grid.len() <= row_idx {
                    grid.resize_with(row_idx + 1, Vec::new);
                }
                let row = &mut grid[row_idx];
                let needed = target.column + values.len();
                if row.len() < needed {
                    row.resize(needed, String::new());
                }
                for (col_offset, value) in values.iter().enumerate() {
                    row[target.column + col_offset] = value.clone();
                }
            }
        }
        Ok(())
    }
}

/// Offline transport backed by a [`FixtureWorkbook`] JSON file.
#[derive(Debug, Clone)]
pub struct FixtureSheetStore {
    path: PathBuf,
}

impl FixtureSheetStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn load(&self) -> anyhow::Result<FixtureWorkbook> {
        let text = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("reading {}", self.path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("parsing {}", self.path.display()))
    }
}

#[async_trait]
impl SheetStore for FixtureSheetStore {
    async fn read_range(&self, range: &str) -> Result<Vec<Vec<String>>, SheetError> {
        self.load().await?.read(range)
    }

    async fn batch_update(&self, updates: &[CellUpdate]) -> Result<(), SheetError> {
        if updates.is_empty() {
            return Ok(());
        }
        let mut workbook = self.load().await?;
        workbook.apply(updates)?;
        let bytes = serde_json::to_vec_pretty(&workbook).context("serializing fixture workbook")?;
        write_file_atomically(&self.path, &bytes).await?;
        info!(ranges = updates.len(), path = %self.path.display(), "fixture batch update applied");
        Ok(())
    }
}
