//! Film + snapshot persistence with change-detection apply.
//!
//! The store owns the snapshot dedup rule: a scraped rating pair is written
//! to history only when it differs from the film's denormalized latest pair
//! (or nothing was ever recorded for the film). Each apply runs as one
//! atomic unit of work per film, so a scheduled tick and an on-demand
//! trigger racing on the same film cannot double-write or lose an entry.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reelwatch_core::{Film, FilmRecord, RatingSnapshot};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use thiserror::Error;
use tracing::{debug, info};

pub const CRATE_NAME: &str = "reelwatch-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("film {0} not found")]
    NotFound(i64),
    #[error("film with slug {0} is already tracked")]
    DuplicateSlug(String),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

/// Outcome of one apply: whether the extraction succeeded and whether a new
/// history entry was written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ApplyReport {
    pub success: bool,
    pub snapshot_recorded: bool,
}

#[async_trait]
pub trait FilmStore: Send + Sync {
    async fn film_by_id(&self, id: i64) -> Result<Option<Film>, StoreError>;
    async fn film_by_slug(&self, slug: &str) -> Result<Option<Film>, StoreError>;
    /// All films, ordered by the manual ordering key.
    async fn all_films(&self) -> Result<Vec<Film>, StoreError>;
    /// Films with the tracking flag set, in manual order.
    async fn tracked_films(&self) -> Result<Vec<Film>, StoreError>;
    /// Register a new film from an initial extraction. Writes the initial
    /// snapshot in the same unit of work when the record carries a rating pair.
    async fn insert_film(&self, record: &FilmRecord) -> Result<Film, StoreError>;
    /// Removes the film and, by ownership, its entire snapshot history.
    async fn delete_film(&self, id: i64) -> Result<(), StoreError>;
    async fn set_tracked(&self, id: i64, tracked: bool) -> Result<Film, StoreError>;
    /// Rewrites the manual ordering keys to match the given id sequence.
    async fn reorder(&self, ordered_ids: &[i64]) -> Result<(), StoreError>;
    /// Snapshot history for one film, ascending by observation time.
    async fn snapshots_for(&self, film_id: i64) -> Result<Vec<RatingSnapshot>, StoreError>;
    /// Apply one extraction outcome. `None` marks a failed extraction and
    /// only bumps the last-attempt timestamp.
    async fn apply_extraction(
        &self,
        film_id: i64,
        record: Option<&FilmRecord>,
    ) -> Result<ApplyReport, StoreError>;
}

/// Change-detection predicate shared by the store implementations.
pub fn snapshot_due(film: &Film, average_rating: f64, rating_count: i64) -> bool {
    film.last_known_average_rating != Some(average_rating)
        || film.last_known_rating_count != Some(rating_count)
        || film.last_scraped_at.is_none()
}

/// Fold a successful extraction into the film row: descriptive fields the
/// record supplies overwrite stored values, the denormalized latest pair is
/// refreshed when the record carries both metrics, and the attempt timestamp
/// always advances. Returns whether a snapshot is due. Must be evaluated and
/// persisted inside one per-film unit of work.
fn apply_record(film: &mut Film, record: &FilmRecord, now: DateTime<Utc>) -> bool {
    if let Some(name) = &record.display_name {
        film.display_name = name.clone();
    }
    if record.year.is_some() {
        film.year = record.year;
    }
    if record.director.is_some() {
        film.director = record.director.clone();
    }
    if record.poster_url.is_some() {
        film.poster_url = record.poster_url.clone();
    }

    let mut recorded = false;
    if let (Some(avg), Some(count)) = (record.average_rating, record.rating_count) {
        recorded = snapshot_due(film, avg, count);
        film.last_known_average_rating = Some(avg);
        film.last_known_rating_count = Some(count);
    }
    film.last_scraped_at = Some(now);
    recorded
}

pub async fn run_migrations(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("../../migrations").run(pool).await?;
    Ok(())
}

const FILM_COLUMNS: &str = "id, letterboxd_slug, display_name, release_year, director, \
     poster_url, is_tracked, added_at, last_scraped_at, \
     last_known_average_rating, last_known_rating_count, display_order";

fn film_from_row(row: &PgRow) -> Result<Film, sqlx::Error> {
    Ok(Film {
        id: row.try_get("id")?,
        letterboxd_slug: row.try_get("letterboxd_slug")?,
        display_name: row.try_get("display_name")?,
        year: row.try_get("release_year")?,
        director: row.try_get("director")?,
        poster_url: row.try_get("poster_url")?,
        is_tracked: row.try_get("is_tracked")?,
        added_at: row.try_get("added_at")?,
        last_scraped_at: row.try_get("last_scraped_at")?,
        last_known_average_rating: row.try_get("last_known_average_rating")?,
        last_known_rating_count: row.try_get("last_known_rating_count")?,
        display_order: row.try_get("display_order")?,
    })
}

fn snapshot_from_row(row: &PgRow) -> Result<RatingSnapshot, sqlx::Error> {
    Ok(RatingSnapshot {
        id: row.try_get("id")?,
        film_id: row.try_get("film_id")?,
        recorded_at: row.try_get("recorded_at")?,
        average_rating: row.try_get("average_rating")?,
        rating_count: row.try_get("rating_count")?,
    })
}

/// Postgres-backed store. Per-film atomicity comes from a transaction that
/// row-locks the film before the read-compare-append-overwrite sequence.
#[derive(Debug, Clone)]
pub struct PgFilmStore {
    pool: PgPool,
}

impl PgFilmStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl FilmStore for PgFilmStore {
    async fn film_by_id(&self, id: i64) -> Result<Option<Film>, StoreError> {
        let row = sqlx::query(&format!("SELECT {FILM_COLUMNS} FROM films WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(film_from_row).transpose().map_err(Into::into)
    }

    async fn film_by_slug(&self, slug: &str) -> Result<Option<Film>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {FILM_COLUMNS} FROM films WHERE letterboxd_slug = $1"
        ))
        .bind(slug)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(film_from_row).transpose().map_err(Into::into)
    }

    async fn all_films(&self) -> Result<Vec<Film>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {FILM_COLUMNS} FROM films ORDER BY display_order, display_name"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(film_from_row).collect::<Result<_, _>>().map_err(Into::into)
    }

    async fn tracked_films(&self) -> Result<Vec<Film>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {FILM_COLUMNS} FROM films WHERE is_tracked ORDER BY display_order, display_name"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(film_from_row).collect::<Result<_, _>>().map_err(Into::into)
    }

    async fn insert_film(&self, record: &FilmRecord) -> Result<Film, StoreError> {
        let mut tx = self.pool.begin().await?;

        let existing = sqlx::query("SELECT id FROM films WHERE letterboxd_slug = $1")
            .bind(&record.letterboxd_slug)
            .fetch_optional(&mut *tx)
            .await?;
        if existing.is_some() {
            return Err(StoreError::DuplicateSlug(record.letterboxd_slug.clone()));
        }

        let next_order: i32 =
            sqlx::query("SELECT COALESCE(MAX(display_order), -1) + 1 AS next_order FROM films")
                .fetch_one(&mut *tx)
                .await?
                .try_get("next_order")?;

        let now = Utc::now();
        let display_name = record
            .display_name
            .clone()
            .unwrap_or_else(|| record.letterboxd_slug.clone());
        let has_pair = record.has_rating_pair();

        let row = sqlx::query(&format!(
            "INSERT INTO films (letterboxd_slug, display_name, release_year, director, \
                 poster_url, is_tracked, added_at, last_scraped_at, \
                 last_known_average_rating, last_known_rating_count, display_order) \
             VALUES ($1, $2, $3, $4, $5, TRUE, $6, $7, $8, $9, $10) \
             RETURNING {FILM_COLUMNS}"
        ))
        .bind(&record.letterboxd_slug)
        .bind(&display_name)
        .bind(record.year)
        .bind(&record.director)
        .bind(&record.poster_url)
        .bind(now)
        .bind(has_pair.then_some(now))
        .bind(record.average_rating.filter(|_| has_pair))
        .bind(record.rating_count.filter(|_| has_pair))
        .bind(next_order)
        .fetch_one(&mut *tx)
        .await?;
        let film = film_from_row(&row)?;

        if let (Some(avg), Some(count)) = (record.average_rating, record.rating_count) {
            sqlx::query(
                "INSERT INTO rating_snapshots (film_id, recorded_at, average_rating, rating_count) \
                 VALUES ($1, $2, $3, $4)",
            )
            .bind(film.id)
            .bind(now)
            .bind(avg)
            .bind(count)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        info!(film_id = film.id, slug = %film.letterboxd_slug, "registered film");
        Ok(film)
    }

    async fn delete_film(&self, id: i64) -> Result<(), StoreError> {
        let result = sqlx::query("DELETE FROM films WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(id));
        }
        Ok(())
    }

    async fn set_tracked(&self, id: i64, tracked: bool) -> Result<Film, StoreError> {
        let row = sqlx::query(&format!(
            "UPDATE films SET is_tracked = $2 WHERE id = $1 RETURNING {FILM_COLUMNS}"
        ))
        .bind(id)
        .bind(tracked)
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else {
            return Err(StoreError::NotFound(id));
        };
        Ok(film_from_row(&row)?)
    }

    async fn reorder(&self, ordered_ids: &[i64]) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        for (position, id) in ordered_ids.iter().enumerate() {
            sqlx::query("UPDATE films SET display_order = $2 WHERE id = $1")
                .bind(id)
                .bind(position as i32)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn snapshots_for(&self, film_id: i64) -> Result<Vec<RatingSnapshot>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, film_id, recorded_at, average_rating, rating_count \
             FROM rating_snapshots WHERE film_id = $1 ORDER BY recorded_at, id",
        )
        .bind(film_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(snapshot_from_row)
            .collect::<Result<_, _>>()
            .map_err(Into::into)
    }

    async fn apply_extraction(
        &self,
        film_id: i64,
        record: Option<&FilmRecord>,
    ) -> Result<ApplyReport, StoreError> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(&format!(
            "SELECT {FILM_COLUMNS} FROM films WHERE id = $1 FOR UPDATE"
        ))
        .bind(film_id)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(row) = row else {
            return Err(StoreError::NotFound(film_id));
        };
        let film = film_from_row(&row)?;
        let now = Utc::now();

        let Some(record) = record else {
            // Failed extraction: staleness stays observable, nothing else moves.
            sqlx::query("UPDATE films SET last_scraped_at = $2 WHERE id = $1")
                .bind(film_id)
                .bind(now)
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;
            return Ok(ApplyReport {
                success: false,
                snapshot_recorded: false,
            });
        };

        let mut updated = film;
        let record_snapshot = apply_record(&mut updated, record, now);

        if record_snapshot {
            let (avg, count) = (
                updated.last_known_average_rating.unwrap_or_default(),
                updated.last_known_rating_count.unwrap_or_default(),
            );
            sqlx::query(
                "INSERT INTO rating_snapshots (film_id, recorded_at, average_rating, rating_count) \
                 VALUES ($1, $2, $3, $4)",
            )
            .bind(film_id)
            .bind(now)
            .bind(avg)
            .bind(count)
            .execute(&mut *tx)
            .await?;
            info!(film_id, avg, count, "rating changed, snapshot recorded");
        } else {
            debug!(film_id, "rating unchanged, no snapshot");
        }

        sqlx::query(
            "UPDATE films SET display_name = $2, release_year = $3, director = $4, \
                 poster_url = $5, last_known_average_rating = $6, \
                 last_known_rating_count = $7, last_scraped_at = $8 \
             WHERE id = $1",
        )
        .bind(film_id)
        .bind(&updated.display_name)
        .bind(updated.year)
        .bind(&updated.director)
        .bind(&updated.poster_url)
        .bind(updated.last_known_average_rating)
        .bind(updated.last_known_rating_count)
        .bind(updated.last_scraped_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(ApplyReport {
            success: true,
            snapshot_recorded: record_snapshot,
        })
    }
}

#[derive(Default)]
struct MemoryInner {
    films: BTreeMap<i64, Film>,
    snapshots: Vec<RatingSnapshot>,
    next_film_id: i64,
    next_snapshot_id: i64,
}

/// In-memory store for tests and local runs. One mutex over the whole map
/// gives the same per-film serialization the Postgres row lock provides.
#[derive(Default)]
pub struct MemoryFilmStore {
    inner: tokio::sync::Mutex<MemoryInner>,
}

impl MemoryFilmStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl FilmStore for MemoryFilmStore {
    async fn film_by_id(&self, id: i64) -> Result<Option<Film>, StoreError> {
        Ok(self.inner.lock().await.films.get(&id).cloned())
    }

    async fn film_by_slug(&self, slug: &str) -> Result<Option<Film>, StoreError> {
        Ok(self
            .inner
            .lock()
            .await
            .films
            .values()
            .find(|f| f.letterboxd_slug == slug)
            .cloned())
    }

    async fn all_films(&self) -> Result<Vec<Film>, StoreError> {
        let inner = self.inner.lock().await;
        let mut films: Vec<Film> = inner.films.values().cloned().collect();
        films.sort_by(|a, b| {
            a.display_order
                .cmp(&b.display_order)
                .then_with(|| a.display_name.cmp(&b.display_name))
        });
        Ok(films)
    }

    async fn tracked_films(&self) -> Result<Vec<Film>, StoreError> {
        Ok(self
            .all_films()
            .await?
            .into_iter()
            .filter(|f| f.is_tracked)
            .collect())
    }

    async fn insert_film(&self, record: &FilmRecord) -> Result<Film, StoreError> {
        let mut inner = self.inner.lock().await;
        if inner
            .films
            .values()
            .any(|f| f.letterboxd_slug == record.letterboxd_slug)
        {
            return Err(StoreError::DuplicateSlug(record.letterboxd_slug.clone()));
        }

        inner.next_film_id += 1;
        let id = inner.next_film_id;
        let now = Utc::now();
        let has_pair = record.has_rating_pair();
        let next_order = inner
            .films
            .values()
            .map(|f| f.display_order)
            .max()
            .map_or(0, |n| n + 1);

        let film = Film {
            id,
            letterboxd_slug: record.letterboxd_slug.clone(),
            display_name: record
                .display_name
                .clone()
                .unwrap_or_else(|| record.letterboxd_slug.clone()),
            year: record.year,
            director: record.director.clone(),
            poster_url: record.poster_url.clone(),
            is_tracked: true,
            added_at: now,
            last_scraped_at: has_pair.then_some(now),
            last_known_average_rating: record.average_rating.filter(|_| has_pair),
            last_known_rating_count: record.rating_count.filter(|_| has_pair),
            display_order: next_order,
        };
        inner.films.insert(id, film.clone());

        if let (Some(avg), Some(count)) = (record.average_rating, record.rating_count) {
            inner.next_snapshot_id += 1;
            let snapshot_id = inner.next_snapshot_id;
            inner.snapshots.push(RatingSnapshot {
                id: snapshot_id,
                film_id: id,
                recorded_at: now,
                average_rating: avg,
                rating_count: count,
            });
        }
        Ok(film)
    }

    async fn delete_film(&self, id: i64) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        if inner.films.remove(&id).is_none() {
            return Err(StoreError::NotFound(id));
        }
        inner.snapshots.retain(|s| s.film_id != id);
        Ok(())
    }

    async fn set_tracked(&self, id: i64, tracked: bool) -> Result<Film, StoreError> {
        let mut inner = self.inner.lock().await;
        let film = inner.films.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        film.is_tracked = tracked;
        Ok(film.clone())
    }

    async fn reorder(&self, ordered_ids: &[i64]) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        for (position, id) in ordered_ids.iter().enumerate() {
            if let Some(film) = inner.films.get_mut(id) {
                film.display_order = position as i32;
            }
        }
        Ok(())
    }

    async fn snapshots_for(&self, film_id: i64) -> Result<Vec<RatingSnapshot>, StoreError> {
        let inner = self.inner.lock().await;
        let mut out: Vec<RatingSnapshot> = inner
            .snapshots
            .iter()
            .filter(|s| s.film_id == film_id)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.recorded_at.cmp(&b.recorded_at).then(a.id.cmp(&b.id)));
        Ok(out)
    }

    async fn apply_extraction(
        &self,
        film_id: i64,
        record: Option<&FilmRecord>,
    ) -> Result<ApplyReport, StoreError> {
        let mut inner = self.inner.lock().await;
        let now = Utc::now();

        let Some(record) = record else {
            let film = inner
                .films
                .get_mut(&film_id)
                .ok_or(StoreError::NotFound(film_id))?;
            film.last_scraped_at = Some(now);
            return Ok(ApplyReport {
                success: false,
                snapshot_recorded: false,
            });
        };

        let record_snapshot = {
            let film = inner
                .films
                .get_mut(&film_id)
                .ok_or(StoreError::NotFound(film_id))?;
            apply_record(film, record, now)
        };

        if record_snapshot {
            inner.next_snapshot_id += 1;
            let snapshot_id = inner.next_snapshot_id;
            let (avg, count) = {
                let film = &inner.films[&film_id];
                (
                    film.last_known_average_rating.unwrap_or_default(),
                    film.last_known_rating_count.unwrap_or_default(),
                )
            };
            inner.snapshots.push(RatingSnapshot {
                id: snapshot_id,
                film_id,
                recorded_at: now,
                average_rating: avg,
                rating_count: count,
            });
        }

        Ok(ApplyReport {
            success: true,
            snapshot_recorded: record_snapshot,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record_with_rating(slug: &str, avg: f64, count: i64) -> FilmRecord {
        FilmRecord {
            letterboxd_slug: slug.to_string(),
            display_name: Some("Some Film".to_string()),
            year: Some(2024),
            director: Some("A. Director".to_string()),
            poster_url: None,
            average_rating: Some(avg),
            rating_count: Some(count),
        }
    }

    fn record_without_rating(slug: &str) -> FilmRecord {
        FilmRecord {
            letterboxd_slug: slug.to_string(),
            display_name: Some("Future Film".to_string()),
            year: Some(2031),
            ..FilmRecord::default()
        }
    }

    #[tokio::test]
    async fn registration_writes_initial_snapshot_and_latest_pair() {
        let store = MemoryFilmStore::new();
        let film = store
            .insert_film(&record_with_rating("some-film", 3.5, 100))
            .await
            .unwrap();
        assert_eq!(film.last_known_average_rating, Some(3.5));
        assert_eq!(film.last_known_rating_count, Some(100));
        assert!(film.last_scraped_at.is_some());
        assert_eq!(store.snapshots_for(film.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn registration_without_rating_leaves_latest_unset() {
        let store = MemoryFilmStore::new();
        let film = store
            .insert_film(&record_without_rating("future-film"))
            .await
            .unwrap();
        assert_eq!(film.last_known_average_rating, None);
        assert_eq!(film.last_scraped_at, None);
        assert!(store.snapshots_for(film.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn duplicate_slug_is_rejected() {
        let store = MemoryFilmStore::new();
        store
            .insert_film(&record_with_rating("some-film", 3.5, 100))
            .await
            .unwrap();
        let err = store
            .insert_film(&record_with_rating("some-film", 3.5, 100))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::DuplicateSlug(_)));
    }

    #[tokio::test]
    async fn identical_rating_pair_does_not_append_but_advances_timestamp() {
        let store = MemoryFilmStore::new();
        let film = store
            .insert_film(&record_with_rating("some-film", 3.5, 100))
            .await
            .unwrap();

        let report = store
            .apply_extraction(film.id, Some(&record_with_rating("some-film", 3.5, 100)))
            .await
            .unwrap();
        assert!(report.success);
        assert!(!report.snapshot_recorded);
        assert_eq!(store.snapshots_for(film.id).await.unwrap().len(), 1);

        let reloaded = store.film_by_id(film.id).await.unwrap().unwrap();
        assert!(reloaded.last_scraped_at >= film.last_scraped_at);
    }

    #[tokio::test]
    async fn changed_rating_pair_appends_exactly_one_entry() {
        let store = MemoryFilmStore::new();
        let film = store
            .insert_film(&record_with_rating("some-film", 3.5, 100))
            .await
            .unwrap();

        let report = store
            .apply_extraction(film.id, Some(&record_with_rating("some-film", 3.6, 120)))
            .await
            .unwrap();
        assert!(report.snapshot_recorded);

        let snapshots = store.snapshots_for(film.id).await.unwrap();
        assert_eq!(snapshots.len(), 2);
        assert_eq!(snapshots.last().unwrap().average_rating, 3.6);
        assert_eq!(snapshots.last().unwrap().rating_count, 120);

        let reloaded = store.film_by_id(film.id).await.unwrap().unwrap();
        assert_eq!(reloaded.last_known_average_rating, Some(3.6));
        assert_eq!(reloaded.last_known_rating_count, Some(120));
    }

    #[tokio::test]
    async fn first_success_records_even_when_latest_pair_matches() {
        // Pre-seeded latest values with no prior attempt still snapshot.
        let film = Film {
            id: 1,
            letterboxd_slug: "seeded".into(),
            display_name: "Seeded".into(),
            year: None,
            director: None,
            poster_url: None,
            is_tracked: true,
            added_at: Utc::now(),
            last_scraped_at: None,
            last_known_average_rating: Some(3.5),
            last_known_rating_count: Some(100),
            display_order: 0,
        };
        assert!(snapshot_due(&film, 3.5, 100));
    }

    #[tokio::test]
    async fn failure_touches_only_the_attempt_timestamp() {
        let store = MemoryFilmStore::new();
        let film = store
            .insert_film(&record_with_rating("some-film", 3.6, 120))
            .await
            .unwrap();

        let report = store.apply_extraction(film.id, None).await.unwrap();
        assert!(!report.success);
        assert!(!report.snapshot_recorded);

        let reloaded = store.film_by_id(film.id).await.unwrap().unwrap();
        assert_eq!(reloaded.display_name, film.display_name);
        assert_eq!(reloaded.last_known_average_rating, Some(3.6));
        assert_eq!(reloaded.last_known_rating_count, Some(120));
        assert_eq!(store.snapshots_for(film.id).await.unwrap().len(), 1);
        assert!(reloaded.last_scraped_at >= film.last_scraped_at);
    }

    #[tokio::test]
    async fn metric_less_success_leaves_latest_and_history_untouched() {
        let store = MemoryFilmStore::new();
        let film = store
            .insert_film(&record_with_rating("some-film", 3.5, 100))
            .await
            .unwrap();

        let mut record = record_without_rating("some-film");
        record.display_name = Some("Renamed Film".to_string());
        let report = store
            .apply_extraction(film.id, Some(&record))
            .await
            .unwrap();
        assert!(report.success);
        assert!(!report.snapshot_recorded);

        let reloaded = store.film_by_id(film.id).await.unwrap().unwrap();
        assert_eq!(reloaded.display_name, "Renamed Film");
        assert_eq!(reloaded.last_known_average_rating, Some(3.5));
        assert_eq!(store.snapshots_for(film.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn record_fields_left_empty_keep_stored_values() {
        let store = MemoryFilmStore::new();
        let film = store
            .insert_film(&record_with_rating("some-film", 3.5, 100))
            .await
            .unwrap();

        let record = FilmRecord {
            letterboxd_slug: "some-film".to_string(),
            average_rating: Some(3.5),
            rating_count: Some(100),
            ..FilmRecord::default()
        };
        store
            .apply_extraction(film.id, Some(&record))
            .await
            .unwrap();

        let reloaded = store.film_by_id(film.id).await.unwrap().unwrap();
        assert_eq!(reloaded.display_name, "Some Film");
        assert_eq!(reloaded.director.as_deref(), Some("A. Director"));
        assert_eq!(reloaded.year, Some(2024));
    }

    #[tokio::test]
    async fn apply_to_unknown_film_is_not_found() {
        let store = MemoryFilmStore::new();
        let err = store
            .apply_extraction(42, Some(&record_with_rating("x", 3.0, 1)))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(42)));
    }

    #[tokio::test]
    async fn delete_cascades_to_snapshots() {
        let store = MemoryFilmStore::new();
        let film = store
            .insert_film(&record_with_rating("some-film", 3.5, 100))
            .await
            .unwrap();
        store.delete_film(film.id).await.unwrap();
        assert!(store.film_by_id(film.id).await.unwrap().is_none());
        assert!(store.snapshots_for(film.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn reorder_rewrites_display_order() {
        let store = MemoryFilmStore::new();
        let a = store
            .insert_film(&record_with_rating("film-a", 3.0, 10))
            .await
            .unwrap();
        let b = store
            .insert_film(&FilmRecord {
                letterboxd_slug: "film-b".into(),
                display_name: Some("Film B".into()),
                average_rating: Some(4.0),
                rating_count: Some(20),
                ..FilmRecord::default()
            })
            .await
            .unwrap();

        store.reorder(&[b.id, a.id]).await.unwrap();
        let films = store.all_films().await.unwrap();
        assert_eq!(films[0].id, b.id);
        assert_eq!(films[1].id, a.id);
    }

    #[tokio::test]
    async fn untracked_films_are_excluded_from_the_tracked_set() {
        let store = MemoryFilmStore::new();
        let film = store
            .insert_film(&record_with_rating("some-film", 3.5, 100))
            .await
            .unwrap();
        assert_eq!(store.tracked_films().await.unwrap().len(), 1);

        let film = store.set_tracked(film.id, false).await.unwrap();
        assert!(!film.is_tracked);
        assert!(store.tracked_films().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn spec_scenario_identical_then_changed_then_failure() {
        let store = MemoryFilmStore::new();
        let film = store
            .insert_film(&record_with_rating("subject-x", 3.5, 100))
            .await
            .unwrap();

        // Identical pair: no new entry.
        let r1 = store
            .apply_extraction(film.id, Some(&record_with_rating("subject-x", 3.5, 100)))
            .await
            .unwrap();
        assert!(!r1.snapshot_recorded);
        assert_eq!(store.snapshots_for(film.id).await.unwrap().len(), 1);

        // Changed pair: exactly one new entry.
        let r2 = store
            .apply_extraction(film.id, Some(&record_with_rating("subject-x", 3.6, 120)))
            .await
            .unwrap();
        assert!(r2.snapshot_recorded);
        assert_eq!(store.snapshots_for(film.id).await.unwrap().len(), 2);
        let reloaded = store.film_by_id(film.id).await.unwrap().unwrap();
        assert_eq!(reloaded.last_known_average_rating, Some(3.6));

        // Fetch failure: nothing but the timestamp moves.
        let before = store.film_by_id(film.id).await.unwrap().unwrap();
        let r3 = store.apply_extraction(film.id, None).await.unwrap();
        assert!(!r3.success);
        let after = store.film_by_id(film.id).await.unwrap().unwrap();
        assert_eq!(after.last_known_average_rating, Some(3.6));
        assert_eq!(store.snapshots_for(film.id).await.unwrap().len(), 2);
        assert!(after.last_scraped_at >= before.last_scraped_at);
    }
}
