//! Letterboxd film page scraping: HTTP fetch + layered parse strategies.
//!
//! Real pages vary in structure, so every field is parsed by an ordered
//! list of strategies, each returning a partial record; the strategies are
//! merged in priority order, first-present-wins per field. A page with no
//! rating yet (unreleased film) is a valid partial success, not an error.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reelwatch_core::FilmRecord;
use scraper::{Html, Selector};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, info, warn};

pub const CRATE_NAME: &str = "reelwatch-scraper";

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

#[derive(Debug, Error)]
pub enum ScrapeError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("unexpected page shape: {0}")]
    Parse(String),
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: String,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(15),
            user_agent: "ReelwatchBot/0.1 (personal project monitoring film ratings)".to_string(),
        }
    }
}

/// Single-attempt fetcher. Failed fetches are retried on the next scheduled
/// cycle, never inside the call.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .user_agent(config.user_agent)
            .build()
            .context("building reqwest client")?;
        Ok(Self { client })
    }

    pub async fn fetch_text(&self, url: &str) -> Result<String, FetchError> {
        let resp = self.client.get(url).send().await?;
        let status = resp.status();
        let final_url = resp.url().to_string();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: final_url,
            });
        }
        Ok(resp.text().await?)
    }
}

#[async_trait]
pub trait FilmScraper: Send + Sync {
    async fn scrape(&self, slug: &str) -> Result<FilmRecord, ScrapeError>;
}

pub struct LetterboxdScraper {
    http: HttpFetcher,
    base_url: String,
}

impl LetterboxdScraper {
    pub fn new(http: HttpFetcher, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { http, base_url }
    }

    pub fn film_url(&self, slug: &str) -> String {
        format!("{}/film/{}/", self.base_url, slug)
    }
}

#[async_trait]
impl FilmScraper for LetterboxdScraper {
    async fn scrape(&self, slug: &str) -> Result<FilmRecord, ScrapeError> {
        let url = self.film_url(slug);
        info!(slug, %url, "scraping film page");
        let html = self.http.fetch_text(&url).await?;
        parse_film_page(slug, &html)
    }
}

/// Output of one parse strategy; fields it could not recover stay `None`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PartialRecord {
    pub display_name: Option<String>,
    pub year: Option<i32>,
    pub director: Option<String>,
    pub poster_url: Option<String>,
    pub average_rating: Option<f64>,
    pub rating_count: Option<i64>,
}

fn merge(dst: &mut PartialRecord, src: PartialRecord) {
    if dst.display_name.is_none() {
        dst.display_name = src.display_name;
    }
    if dst.year.is_none() {
        dst.year = src.year;
    }
    if dst.director.is_none() {
        dst.director = src.director;
    }
    if dst.poster_url.is_none() {
        dst.poster_url = src.poster_url;
    }
    if dst.average_rating.is_none() {
        dst.average_rating = src.average_rating;
    }
    if dst.rating_count.is_none() {
        dst.rating_count = src.rating_count;
    }
}

/// Parse a fetched film page into a normalized record.
pub fn parse_film_page(slug: &str, html: &str) -> Result<FilmRecord, ScrapeError> {
    let document = Html::parse_document(html);

    let mut partial = parse_primary_details(&document)?;
    merge(&mut partial, parse_meta_details(&document)?);
    merge(&mut partial, parse_tooltip_rating(&document)?);
    if partial.average_rating.is_none() || partial.rating_count.is_none() {
        debug!(slug, "rating tooltip incomplete, trying meta/ld+json fallback");
        merge(&mut partial, parse_annotation_rating(&document)?);
    }

    let display_name = partial.display_name.unwrap_or_else(|| {
        warn!(slug, "could not find display name, falling back to slug");
        slug.to_string()
    });
    if partial.average_rating.is_none() {
        warn!(slug, "average rating undetermined after all strategies");
    }
    if partial.rating_count.is_none() {
        warn!(slug, "rating count undetermined after all strategies");
    }

    Ok(FilmRecord {
        letterboxd_slug: slug.to_string(),
        display_name: Some(display_name),
        year: partial.year,
        director: partial.director,
        poster_url: partial.poster_url,
        average_rating: partial.average_rating,
        rating_count: partial.rating_count,
    })
}

/// Primary strategy: the structured headline/production-info markup.
fn parse_primary_details(document: &Html) -> Result<PartialRecord, ScrapeError> {
    let mut out = PartialRecord::default();
    out.display_name = select_first_text(document, "h1.headline-1.primaryname span.name")?;
    out.year = select_first_text(document, ".productioninfo .releasedate a")?
        .filter(|t| !t.is_empty() && t.chars().all(|c| c.is_ascii_digit()))
        .and_then(|t| t.parse().ok());
    out.director = select_first_text(
        document,
        ".productioninfo .credits .creatorlist a.contributor span.prettify",
    )?;
    Ok(out)
}

/// Fallback strategy: OpenGraph meta tags, with light textual cleanup of
/// the title ("Name (2024) - Letterboxd" -> name + year).
fn parse_meta_details(document: &Html) -> Result<PartialRecord, ScrapeError> {
    let mut out = PartialRecord::default();
    if let Some(raw_title) = select_first_attr(document, r#"meta[property="og:title"]"#, "content")?
    {
        let (name, year) = clean_meta_title(&raw_title);
        if !name.is_empty() {
            out.display_name = Some(name);
        }
        out.year = year;
    }
    out.poster_url = select_first_attr(document, r#"meta[property="og:image"]"#, "content")?;
    Ok(out)
}

/// Primary rating strategy: the visual rating anchor's tooltip text,
/// "Weighted average of X ... based on N ratings".
fn parse_tooltip_rating(document: &Html) -> Result<PartialRecord, ScrapeError> {
    let mut out = PartialRecord::default();
    let Some(tooltip) = select_first_attr(
        document,
        "span.average-rating a.display-rating",
        "data-original-title",
    )?
    else {
        return Ok(out);
    };
    out.average_rating = decimal_after(&tooltip, "Weighted average of ");
    out.rating_count = integer_after(&tooltip, "based on ");
    if out.average_rating.is_none() || out.rating_count.is_none() {
        warn!(tooltip, "rating tooltip present but not fully parseable");
    }
    Ok(out)
}

/// Fallback rating strategy: twitter:data2 "X out of 5" for the average and
/// the embedded ld+json aggregate block for the count. A present but
/// undecodable ld+json block aborts the call.
fn parse_annotation_rating(document: &Html) -> Result<PartialRecord, ScrapeError> {
    let mut out = PartialRecord::default();
    if let Some(content) = select_first_attr(document, r#"meta[name="twitter:data2"]"#, "content")?
    {
        if content.contains("out of 5") {
            out.average_rating = leading_decimal(&content);
        }
    }
    out.rating_count = parse_json_ld_rating_count(document)?;
    Ok(out)
}

fn parse_json_ld_rating_count(document: &Html) -> Result<Option<i64>, ScrapeError> {
    let sel = selector(r#"script[type="application/ld+json"]"#)?;
    let Some(node) = document.select(&sel).next() else {
        return Ok(None);
    };
    // The script body is wrapped in CDATA comment markers; cut down to the
    // outermost JSON object before decoding.
    let content = node.text().collect::<String>();
    let (Some(start), Some(end)) = (content.find('{'), content.rfind('}')) else {
        return Ok(None);
    };
    if end <= start {
        return Ok(None);
    }
    let value: JsonValue = serde_json::from_str(&content[start..=end])
        .map_err(|e| ScrapeError::Parse(format!("invalid ld+json block: {e}")))?;
    Ok(value
        .get("aggregateRating")
        .and_then(|agg| agg.get("ratingCount"))
        .and_then(json_i64))
}

fn json_i64(value: &JsonValue) -> Option<i64> {
    value
        .as_i64()
        .or_else(|| value.as_str().and_then(|s| s.parse().ok()))
}

fn selector(raw: &str) -> Result<Selector, ScrapeError> {
    Selector::parse(raw).map_err(|e| ScrapeError::Parse(e.to_string()))
}

fn select_first_text(document: &Html, raw: &str) -> Result<Option<String>, ScrapeError> {
    let sel = selector(raw)?;
    Ok(document
        .select(&sel)
        .next()
        .and_then(|n| text_or_none(n.text().collect::<String>())))
}

fn select_first_attr(
    document: &Html,
    raw: &str,
    attr: &str,
) -> Result<Option<String>, ScrapeError> {
    let sel = selector(raw)?;
    Ok(document
        .select(&sel)
        .next()
        .and_then(|n| n.value().attr(attr))
        .and_then(|s| text_or_none(s.to_string())))
}

fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.trim().to_string();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

/// Strip the " - Letterboxd" suffix and a trailing "(YYYY)" from a meta
/// title, recovering the bare name and the year when present.
fn clean_meta_title(raw: &str) -> (String, Option<i32>) {
    let mut name = raw.replace(" - Letterboxd", "").trim().to_string();
    let mut year = None;
    if name.ends_with(')') {
        if let Some(open) = name.rfind('(') {
            let inner = &name[open + 1..name.len() - 1];
            if inner.len() == 4 && inner.chars().all(|c| c.is_ascii_digit()) {
                year = inner.parse().ok();
                name.truncate(open);
                let end = name.trim_end().len();
                name.truncate(end);
            }
        }
    }
    (name, year)
}

/// First decimal number immediately following `marker`.
fn decimal_after(text: &str, marker: &str) -> Option<f64> {
    let (_, rest) = text.split_once(marker)?;
    let token: String = rest
        .trim_start()
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    let token = token.trim_end_matches('.');
    if token.is_empty() {
        None
    } else {
        token.parse().ok()
    }
}

/// First integer immediately following `marker`, thousands separators removed.
fn integer_after(text: &str, marker: &str) -> Option<i64> {
    let (_, rest) = text.split_once(marker)?;
    let token: String = rest
        .trim_start()
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == ',')
        .collect();
    let digits = token.replace(',', "");
    if digits.is_empty() {
        None
    } else {
        digits.parse().ok()
    }
}

fn leading_decimal(text: &str) -> Option<f64> {
    let token: String = text
        .trim_start()
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    let token = token.trim_end_matches('.');
    if token.is_empty() {
        None
    } else {
        token.parse().ok()
    }
}
