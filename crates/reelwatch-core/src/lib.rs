//! Core domain model for Reelwatch.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "reelwatch-core";

/// A tracked film. `last_known_*` fields are a denormalized copy of the
/// most recent snapshot so list views never touch the history table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Film {
    pub id: i64,
    pub letterboxd_slug: String,
    pub display_name: String,
    pub year: Option<i32>,
    pub director: Option<String>,
    pub poster_url: Option<String>,
    pub is_tracked: bool,
    pub added_at: DateTime<Utc>,
    /// Set on every extraction attempt, including failed ones.
    pub last_scraped_at: Option<DateTime<Utc>>,
    pub last_known_average_rating: Option<f64>,
    pub last_known_rating_count: Option<i64>,
    pub display_order: i32,
}

/// One immutable observation of a film's rating pair. Appended only when
/// the pair changed since the previous observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RatingSnapshot {
    pub id: i64,
    pub film_id: i64,
    pub recorded_at: DateTime<Utc>,
    pub average_rating: f64,
    pub rating_count: i64,
}

/// Normalized handoff record from the scraper into the store. Every field
/// the page did not yield is simply absent; a record with no rating pair is
/// still a successful extraction (e.g. an unreleased film).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct FilmRecord {
    pub letterboxd_slug: String,
    pub display_name: Option<String>,
    pub year: Option<i32>,
    pub director: Option<String>,
    pub poster_url: Option<String>,
    pub average_rating: Option<f64>,
    pub rating_count: Option<i64>,
}

impl FilmRecord {
    pub fn new(slug: impl Into<String>) -> Self {
        Self {
            letterboxd_slug: slug.into(),
            ..Self::default()
        }
    }

    /// Both halves of the metric pair were recovered from the page.
    pub fn has_rating_pair(&self) -> bool {
        self.average_rating.is_some() && self.rating_count.is_some()
    }
}
