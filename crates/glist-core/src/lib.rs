//! Core domain model for the game list: catalog records, cached resolutions,
//! decoded sheet rows and the cell updates written back to the sheet.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "glist-core";

/// Catalog id recorded for titles the catalog could not match.
pub const UNKNOWN_CATALOG_ID: &str = "unknown";

/// Canonical metadata for one game.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogRecord {
    pub catalog_id: String,
    pub title: String,
    pub description: String,
    pub cover_url: Option<String>,
}

impl CatalogRecord {
    /// Record used when a title search comes back empty.
    pub fn placeholder(title: &str) -> Self {
        Self {
            catalog_id: UNKNOWN_CATALOG_ID.to_string(),
            title: title.to_string(),
            description: String::new(),
            cover_url: None,
        }
    }

    pub fn is_placeholder(&self) -> bool {
        self.catalog_id == UNKNOWN_CATALOG_ID
    }
}

/// Persisted resolution, keyed by the freeform title an operator typed.
///
/// `id` and `override_id` are equal once resolved. An operator may hand-edit
/// `override_id` in the persisted file to point at a different catalog entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedResolution {
    #[serde(deserialize_with = "deserialize_opaque_id")]
    pub id: String,
    #[serde(deserialize_with = "deserialize_opaque_id")]
    pub override_id: String,
    #[serde(default, deserialize_with = "deserialize_null_as_empty")]
    pub description: String,
    pub title: String,
    #[serde(default, alias = "cover")]
    pub cover_url: Option<String>,
}

impl CachedResolution {
    pub fn from_record(record: &CatalogRecord) -> Self {
        Self {
            id: record.catalog_id.clone(),
            override_id: record.catalog_id.clone(),
            description: record.description.clone(),
            title: record.title.clone(),
            cover_url: record.cover_url.clone(),
        }
    }

    pub fn to_record(&self) -> CatalogRecord {
        CatalogRecord {
            catalog_id: self.id.clone(),
            title: self.title.clone(),
            description: self.description.clone(),
            cover_url: self.cover_url.clone(),
        }
    }

    pub fn has_override(&self) -> bool {
        self.id != self.override_id
    }

    pub fn prior(&self) -> PriorIds {
        PriorIds::new(Some(self.id.clone()), Some(self.override_id.clone()))
    }
}

/// Ids previously stored for a title, as found in the sheet or the cache.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PriorIds {
    pub detected_id: Option<String>,
    pub override_id: Option<String>,
}

impl PriorIds {
    pub fn new(detected_id: Option<String>, override_id: Option<String>) -> Self {
        Self {
            detected_id,
            override_id,
        }
    }

    pub fn detected(&self) -> Option<&str> {
        non_empty(self.detected_id.as_deref())
    }

    pub fn overridden(&self) -> Option<&str> {
        non_empty(self.override_id.as_deref())
    }

    /// The id an operator asked for, when it differs from the detected one.
    pub fn override_target(&self) -> Option<&str> {
        let target = self.overridden()?;
        if self.detected() == Some(target) {
            None
        } else {
            Some(target)
        }
    }

    /// A missing override compares as the empty string.
    pub fn is_settled(&self) -> bool {
        match self.detected() {
            Some(detected) => detected == self.overridden().unwrap_or_default(),
            None => false,
        }
    }

    pub fn without_detected(&self) -> Self {
        Self {
            detected_id: None,
            override_id: self.override_id.clone(),
        }
    }
}

/// The four contiguous metadata cells every reconciled sheet carries.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedColumns {
    pub detected_id: Option<String>,
    pub override_id: Option<String>,
    pub cover_url: Option<String>,
    pub description: Option<String>,
}

impl ResolvedColumns {
    pub const WIDTH: usize = 4;

    pub fn from_record(record: &CatalogRecord) -> Self {
        Self {
            detected_id: Some(record.catalog_id.clone()),
            override_id: Some(record.catalog_id.clone()),
            cover_url: record.cover_url.clone(),
            description: Some(record.description.clone()),
        }
    }

    pub fn prior(&self) -> PriorIds {
        PriorIds::new(self.detected_id.clone(), self.override_id.clone())
    }

    /// Cell values in column order; absent values become empty cells.
    pub fn to_cells(&self) -> Vec<String> {
        [
            &self.detected_id,
            &self.override_id,
            &self.cover_url,
            &self.description,
        ]
        .into_iter()
        .map(|v| v.clone().unwrap_or_default())
        .collect()
    }
}

/// One titled sheet row, addressed by its 1-based row number in the range.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRow {
    pub row_number: u32,
    pub title: String,
    pub resolved: ResolvedColumns,
}

impl SourceRow {
    pub fn is_stale(&self) -> bool {
        !self.resolved.prior().is_settled()
    }

    pub fn prior(&self) -> PriorIds {
        self.resolved.prior()
    }
}

/// One range write in a batched update, shaped like a Sheets `ValueRange`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellUpdate {
    pub range: String,
    pub values: Vec<Vec<String>>,
}

impl CellUpdate {
    /// A single-row write starting at `start`.
    pub fn row(start: &CellRef, values: Vec<String>) -> Self {
        Self {
            range: start.to_string(),
            values: vec![values],
        }
    }

    pub fn target(&self) -> Result<CellRef, CellRefError> {
        CellRef::parse(&self.range)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CellRefError {
    #[error("range {0:?} has no sheet name")]
    MissingSheet(String),
    #[error("range {0:?} has no column letters")]
    MissingColumn(String),
    #[error("range {0:?} has no valid row number")]
    InvalidRow(String),
}

/// A single cell in A1 notation, e.g. `Schedule!H12`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CellRef {
    pub sheet: String,
    /// 0-based column index.
    pub column: usize,
    /// 1-based row number.
    pub row: u32,
}

impl CellRef {
    pub fn new(sheet: impl Into<String>, column: usize, row: u32) -> Self {
        Self {
            sheet: sheet.into(),
            column,
            row,
        }
    }

    pub fn parse(range: &str) -> Result<Self, CellRefError> {
        let (sheet, cell) = range
            .rsplit_once('!')
            .ok_or_else(|| CellRefError::MissingSheet(range.to_string()))?;
        let sheet = unquote_sheet_name(sheet);
        if sheet.is_empty() {
            return Err(CellRefError::MissingSheet(range.to_string()));
        }
        // Only the first cell of a multi-cell range is an anchor.
        let cell = cell.split(':').next().unwrap_or_default();
        let split = cell
            .find(|c: char| !c.is_ascii_alphabetic())
            .unwrap_or(cell.len());
        let (letters, digits) = cell.split_at(split);
        let column =
            column_index(letters).ok_or_else(|| CellRefError::MissingColumn(range.to_string()))?;
        let row = digits
            .parse::<u32>()
            .ok()
            .filter(|r| *r > 0)
            .ok_or_else(|| CellRefError::InvalidRow(range.to_string()))?;
        Ok(Self { sheet, column, row })
    }
}

impl fmt::Display for CellRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}!{}{}",
            quote_sheet_name(&self.sheet),
            column_letters(self.column),
            self.row
        )
    }
}

/// `0 -> A`, `25 -> Z`, `26 -> AA`.
pub fn column_letters(index: usize) -> String {
    let mut n = index + 1;
    let mut out = Vec::new();
    while n > 0 {
        let rem = (n - 1) % 26;
        out.push(b'A' + rem as u8);
        n = (n - 1) / 26;
    }
    out.reverse();
    String::from_utf8(out).unwrap_or_default()
}

pub fn column_index(letters: &str) -> Option<usize> {
    if letters.is_empty() {
        return None;
    }
    let mut n = 0usize;
    for ch in letters.chars() {
        if !ch.is_ascii_alphabetic() {
            return None;
        }
        let digit = (ch.to_ascii_uppercase() as u8 - b'A') as usize + 1;
        n = n.checked_mul(26)?.checked_add(digit)?;
    }
    Some(n - 1)
}

pub fn quote_sheet_name(name: &str) -> String {
    if name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        name.to_string()
    } else {
        format!("'{}'", name.replace('\'', "''"))
    }
}

pub fn unquote_sheet_name(name: &str) -> String {
    match name.strip_prefix('\'').and_then(|n| n.strip_suffix('\'')) {
        Some(inner) => inner.replace("''", "'"),
        None => name.to_string(),
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

/// Catalog ids come back as JSON numbers from the API but are stored as strings.
pub fn deserialize_opaque_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum IdRepr {
        Text(String),
        Unsigned(u64),
        Signed(i64),
    }

    Ok(match IdRepr::deserialize(deserializer)? {
        IdRepr::Text(s) => s,
        IdRepr::Unsigned(n) => n.to_string(),
        IdRepr::Signed(n) => n.to_string(),
    })
}

pub fn deserialize_null_as_empty<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}
