//! Static HTML pages rendered from reconciled sheet rows.

use anyhow::Context;
use askama::Template;
use chrono::{DateTime, Utc};
use glist_adapters::{KeysRowV1, ScheduleRowV1};
use glist_core::CatalogRecord;
use serde::Serialize;

pub const CRATE_NAME: &str = "glist-web";

/// Schedule rows split into what is still to be played and what is done.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScheduleOrder {
    pub upcoming: Vec<ScheduleRowV1>,
    pub completed: Vec<ScheduleRowV1>,
}

fn schedule_sort_key(row: &ScheduleRowV1) -> (u32, &str) {
    let rank = row.votes.map_or(999_999, |votes| 10_000 - votes);
    (rank, row.date_suggested.as_str())
}

/// Most-voted first (oldest suggestion breaks ties), alternating between
/// streamer-chosen and viewer-voted games, streamer pick first. Completed
/// games are pulled out and ordered by completion date.
pub fn order_schedule(mut rows: Vec<ScheduleRowV1>) -> ScheduleOrder {
    rows.sort_by(|a, b| schedule_sort_key(a).cmp(&schedule_sort_key(b)));
    let (voted, chosen): (Vec<_>, Vec<_>) = rows.into_iter().partition(|r| r.votes.is_some());

    let mut order = ScheduleOrder::default();
    let mut chosen = chosen.into_iter();
    let mut voted = voted.into_iter();
    loop {
        let picks = [chosen.next(), voted.next()];
        if picks.iter().all(Option::is_none) {
            break;
        }
        for row in picks.into_iter().flatten() {
            if row.completed.is_some() {
                order.completed.push(row);
            } else {
                order.upcoming.push(row);
            }
        }
    }
    order.completed.sort_by(|a, b| a.completed.cmp(&b.completed));
    order
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScheduleCard {
    pub heading: String,
    pub has_image: bool,
    pub image_path: String,
    pub completed: String,
    pub votes: u32,
    pub suggested_by: String,
    pub date_suggested: String,
    pub provider: String,
    pub description: String,
}

impl ScheduleCard {
    pub fn new(row: &ScheduleRowV1, image_path: Option<String>) -> Self {
        let heading = match &row.notes {
            Some(notes) => format!("{} - {}", row.title, notes),
            None => row.title.clone(),
        };
        Self {
            heading,
            has_image: image_path.is_some(),
            image_path: image_path.unwrap_or_default(),
            completed: row.completed.clone().unwrap_or_default(),
            votes: row.votes.unwrap_or(0),
            suggested_by: row
                .attribution
                .clone()
                .unwrap_or_else(|| "anonymous".to_string()),
            date_suggested: row.date_suggested.clone(),
            provider: row.provider.clone().unwrap_or_default(),
            description: row.resolved.description.clone().unwrap_or_default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KeyCard {
    pub title: String,
    pub platform: String,
    pub has_image: bool,
    pub image_path: String,
    pub description: String,
}

impl KeyCard {
    pub fn new(row: &KeysRowV1, record: &CatalogRecord, image_path: Option<String>) -> Self {
        Self {
            title: record.title.clone(),
            platform: row.platform.clone(),
            has_image: image_path.is_some(),
            image_path: image_path.unwrap_or_default(),
            description: record.description.clone(),
        }
    }
}

#[derive(Template)]
#[template(path = "schedule.html")]
struct SchedulePageTemplate<'a> {
    heading: &'a str,
    updated: String,
    upcoming: &'a [ScheduleCard],
    completed: &'a [ScheduleCard],
}

#[derive(Template)]
#[template(path = "keys.html")]
struct KeysPageTemplate<'a> {
    heading: &'a str,
    updated: String,
    cards: &'a [KeyCard],
}

/// e.g. `Oct 18, 2026 at 9:05:03`
pub fn format_updated(at: DateTime<Utc>) -> String {
    at.format("%b %-d, %Y at %-H:%M:%S").to_string()
}

pub fn render_schedule_page(
    heading: &str,
    upcoming: &[ScheduleCard],
    completed: &[ScheduleCard],
    updated_at: DateTime<Utc>,
) -> anyhow::Result<String> {
    SchedulePageTemplate {
        heading,
        updated: format_updated(updated_at),
        upcoming,
        completed,
    }
    .render()
    .context("rendering schedule page")
}

pub fn render_keys_page(
    heading: &str,
    cards: &[KeyCard],
    updated_at: DateTime<Utc>,
) -> anyhow::Result<String> {
    KeysPageTemplate {
        heading,
        updated: format_updated(updated_at),
        cards,
    }
    .render()
    .context("rendering keys page")
}
