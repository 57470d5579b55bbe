//! Feed fetching + the persistence seam for CPS.
//!
//! The pipeline talks to the document store through the [`VenueStore`] /
//! [`ProgrammeStore`] / [`MetaStore`] traits. [`PgStore`] is the production
//! Postgres implementation; [`MemoryStore`] backs tests and demos.

use std::collections::BTreeMap;
use std::collections::HashSet;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cps_core::{Programme, Venue};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::info_span;

pub const CRATE_NAME: &str = "cps-storage";

pub const META_LAST_UPDATE: &str = "lastUpdateTime";
pub const META_SYNC_RUNNING: &str = "syncRunning";

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("feed request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
        }
    }
}

/// Seam for retrieving raw feed bodies, so the pipeline can be exercised
/// against canned XML in tests.
#[async_trait]
pub trait FeedFetcher: Send + Sync {
    async fn fetch_text(&self, url: &str) -> Result<String, FetchError>;
}

/// reqwest-backed fetcher. A single GET per call, no retries: a failed fetch
/// aborts the whole sync run.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl FeedFetcher for HttpFetcher {
    async fn fetch_text(&self, url: &str) -> Result<String, FetchError> {
        let span = info_span!("feed_fetch", url);
        let _guard = span.enter();

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

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait VenueStore: Send + Sync {
    async fn find_venue(&self, venue_id: &str) -> Result<Option<Venue>, StoreError>;
    async fn upsert_venue(&self, venue: &Venue) -> Result<(), StoreError>;
    /// Bulk "set deleted=true where venue_id not in touched"; returns the
    /// number of venues newly or still marked deleted by this call.
    async fn soft_delete_venues_absent(&self, touched: &[String]) -> Result<u64, StoreError>;
    async fn all_venues(&self) -> Result<Vec<Venue>, StoreError>;
    async fn set_venue_programmes(
        &self,
        venue_id: &str,
        programmes: &[String],
    ) -> Result<(), StoreError>;
}

#[async_trait]
pub trait ProgrammeStore: Send + Sync {
    async fn find_programme(&self, event_id: &str) -> Result<Option<Programme>, StoreError>;
    async fn upsert_programme(&self, programme: &Programme) -> Result<(), StoreError>;
    async fn soft_delete_programmes_absent(&self, seen: &[String]) -> Result<u64, StoreError>;
    /// Natural keys of non-deleted programmes referencing the venue.
    async fn programme_ids_for_venue(&self, venue_id: &str) -> Result<Vec<String>, StoreError>;
}

#[async_trait]
pub trait MetaStore: Send + Sync {
    async fn set_last_update(&self, at: DateTime<Utc>) -> Result<(), StoreError>;
    async fn last_update(&self) -> Result<Option<DateTime<Utc>>, StoreError>;
    /// Single-run lock on the metadata record. Returns false when another run
    /// already holds it.
    async fn try_acquire_run_lock(&self) -> Result<bool, StoreError>;
    async fn release_run_lock(&self) -> Result<(), StoreError>;
}

/// Convenience alias for the full persistence surface the pipeline needs.
pub trait Store: VenueStore + ProgrammeStore + MetaStore {}

impl<T: VenueStore + ProgrammeStore + MetaStore> Store for T {}

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPool::connect(database_url).await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }
}

fn venue_from_row(row: &PgRow) -> Result<Venue, sqlx::Error> {
    Ok(Venue {
        venue_id: row.try_get("venue_id")?,
        name: row.try_get("name")?,
        latitude: row.try_get("latitude")?,
        longitude: row.try_get("longitude")?,
        programmes: row.try_get("programmes")?,
        deleted: row.try_get("deleted")?,
    })
}

fn programme_from_row(row: &PgRow) -> Result<Programme, sqlx::Error> {
    Ok(Programme {
        event_id: row.try_get("event_id")?,
        title: row.try_get("title")?,
        venue_id: row.try_get("venue_id")?,
        dateline: row.try_get("dateline")?,
        duration: row.try_get("duration")?,
        price: row.try_get("price")?,
        description: row.try_get("description")?,
        presenter: row.try_get("presenter")?,
        programme_type: row.try_get("programme_type")?,
        language: row.try_get("language")?,
        remarks: row.try_get("remarks")?,
        url: row.try_get("url")?,
        enquiry: row.try_get("enquiry")?,
        likes: row.try_get("likes")?,
        submit_epoch: row.try_get("submit_epoch")?,
        deleted: row.try_get("deleted")?,
    })
}

#[async_trait]
impl VenueStore for PgStore {
    async fn find_venue(&self, venue_id: &str) -> Result<Option<Venue>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT venue_id, name, latitude, longitude, programmes, deleted
              FROM venues
             WHERE venue_id = $1
            "#,
        )
        .bind(venue_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(venue_from_row).transpose().map_err(Into::into)
    }

    async fn upsert_venue(&self, venue: &Venue) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO venues (venue_id, name, latitude, longitude, programmes, deleted)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (venue_id) DO UPDATE
               SET name = EXCLUDED.name,
                   latitude = EXCLUDED.latitude,
                   longitude = EXCLUDED.longitude,
                   programmes = EXCLUDED.programmes,
                   deleted = EXCLUDED.deleted
            "#,
        )
        .bind(&venue.venue_id)
        .bind(&venue.name)
        .bind(venue.latitude)
        .bind(venue.longitude)
        .bind(&venue.programmes)
        .bind(venue.deleted)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn soft_delete_venues_absent(&self, touched: &[String]) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE venues
               SET deleted = TRUE
             WHERE venue_id <> ALL($1)
            "#,
        )
        .bind(touched)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn all_venues(&self) -> Result<Vec<Venue>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT venue_id, name, latitude, longitude, programmes, deleted
              FROM venues
             ORDER BY venue_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(venue_from_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    async fn set_venue_programmes(
        &self,
        venue_id: &str,
        programmes: &[String],
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE venues
               SET programmes = $2
             WHERE venue_id = $1
            "#,
        )
        .bind(venue_id)
        .bind(programmes)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl ProgrammeStore for PgStore {
    async fn find_programme(&self, event_id: &str) -> Result<Option<Programme>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT event_id, title, venue_id, dateline, duration, price, description,
                   presenter, programme_type, language, remarks, url, enquiry,
                   likes, submit_epoch, deleted
              FROM programmes
             WHERE event_id = $1
            "#,
        )
        .bind(event_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref()
            .map(programme_from_row)
            .transpose()
            .map_err(Into::into)
    }

    async fn upsert_programme(&self, programme: &Programme) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO programmes (event_id, title, venue_id, dateline, duration, price,
                                    description, presenter, programme_type, language,
                                    remarks, url, enquiry, likes, submit_epoch, deleted)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            ON CONFLICT (event_id) DO UPDATE
               SET title = EXCLUDED.title,
                   venue_id = EXCLUDED.venue_id,
                   dateline = EXCLUDED.dateline,
                   duration = EXCLUDED.duration,
                   price = EXCLUDED.price,
                   description = EXCLUDED.description,
                   presenter = EXCLUDED.presenter,
                   programme_type = EXCLUDED.programme_type,
                   language = EXCLUDED.language,
                   remarks = EXCLUDED.remarks,
                   url = EXCLUDED.url,
                   enquiry = EXCLUDED.enquiry,
                   likes = EXCLUDED.likes,
                   submit_epoch = EXCLUDED.submit_epoch,
                   deleted = EXCLUDED.deleted
            "#,
        )
        .bind(&programme.event_id)
        .bind(&programme.title)
        .bind(&programme.venue_id)
        .bind(&programme.dateline)
        .bind(&programme.duration)
        .bind(&programme.price)
        .bind(&programme.description)
        .bind(&programme.presenter)
        .bind(&programme.programme_type)
        .bind(&programme.language)
        .bind(&programme.remarks)
        .bind(&programme.url)
        .bind(&programme.enquiry)
        .bind(programme.likes)
        .bind(programme.submit_epoch)
        .bind(programme.deleted)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn soft_delete_programmes_absent(&self, seen: &[String]) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE programmes
               SET deleted = TRUE
             WHERE event_id <> ALL($1)
            "#,
        )
        .bind(seen)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn programme_ids_for_venue(&self, venue_id: &str) -> Result<Vec<String>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT event_id
              FROM programmes
             WHERE venue_id = $1
               AND deleted = FALSE
             ORDER BY event_id
            "#,
        )
        .bind(venue_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| row.try_get("event_id"))
            .collect::<Result<Vec<_>, _>>()
            .map_err(Into::into)
    }
}

#[async_trait]
impl MetaStore for PgStore {
    async fn set_last_update(&self, at: DateTime<Utc>) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO sync_meta (key, value)
            VALUES ($1, $2)
            ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value
            "#,
        )
        .bind(META_LAST_UPDATE)
        .bind(at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn last_update(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT value FROM sync_meta WHERE key = $1
            "#,
        )
        .bind(META_LAST_UPDATE)
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else { return Ok(None) };
        let value: String = row.try_get("value")?;
        Ok(DateTime::parse_from_rfc3339(&value)
            .ok()
            .map(|dt| dt.with_timezone(&Utc)))
    }

    async fn try_acquire_run_lock(&self) -> Result<bool, StoreError> {
        // Atomic: the conditional DO UPDATE only fires when the flag is not
        // already set, so exactly one concurrent caller wins.
        let result = sqlx::query(
            r#"
            INSERT INTO sync_meta (key, value)
            VALUES ($1, 'true')
            ON CONFLICT (key) DO UPDATE
               SET value = 'true'
             WHERE sync_meta.value <> 'true'
            "#,
        )
        .bind(META_SYNC_RUNNING)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn release_run_lock(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO sync_meta (key, value)
            VALUES ($1, 'false')
            ON CONFLICT (key) DO UPDATE SET value = 'false'
            "#,
        )
        .bind(META_SYNC_RUNNING)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[derive(Debug, Default)]
struct MemoryInner {
    venues: BTreeMap<String, Venue>,
    programmes: BTreeMap<String, Programme>,
    meta: BTreeMap<String, String>,
    fail_venue_ids: HashSet<String>,
    fail_event_ids: HashSet<String>,
    fail_meta: bool,
}

/// In-memory store used by tests and demos. Supports injecting per-record
/// write failures to exercise the pipeline's skip-and-continue path.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn fail_venue_writes(&self, venue_id: &str) {
        self.inner
            .lock()
            .await
            .fail_venue_ids
            .insert(venue_id.to_string());
    }

    /// Makes `set_last_update` fail; the run-lock writes stay functional so a
    /// pipeline run can still execute around the broken metadata record.
    pub async fn fail_meta_writes(&self) {
        self.inner.lock().await.fail_meta = true;
    }

    pub async fn fail_programme_writes(&self, event_id: &str) {
        self.inner
            .lock()
            .await
            .fail_event_ids
            .insert(event_id.to_string());
    }

    /// Test/demo hook mimicking a user like action outside the pipeline.
    pub async fn add_like(&self, event_id: &str, delta: i64) -> Option<i64> {
        let mut inner = self.inner.lock().await;
        let programme = inner.programmes.get_mut(event_id)?;
        programme.likes += delta;
        Some(programme.likes)
    }
}

#[async_trait]
impl VenueStore for MemoryStore {
    async fn find_venue(&self, venue_id: &str) -> Result<Option<Venue>, StoreError> {
        Ok(self.inner.lock().await.venues.get(venue_id).cloned())
    }

    async fn upsert_venue(&self, venue: &Venue) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        if inner.fail_venue_ids.contains(&venue.venue_id) {
            return Err(StoreError::Unavailable(format!(
                "injected write failure for venue {}",
                venue.venue_id
            )));
        }
        inner.venues.insert(venue.venue_id.clone(), venue.clone());
        Ok(())
    }

    async fn soft_delete_venues_absent(&self, touched: &[String]) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock().await;
        let mut affected = 0;
        for venue in inner.venues.values_mut() {
            if !touched.contains(&venue.venue_id) {
                venue.deleted = true;
                affected += 1;
            }
        }
        Ok(affected)
    }

    async fn all_venues(&self) -> Result<Vec<Venue>, StoreError> {
        Ok(self.inner.lock().await.venues.values().cloned().collect())
    }

    async fn set_venue_programmes(
        &self,
        venue_id: &str,
        programmes: &[String],
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        if let Some(venue) = inner.venues.get_mut(venue_id) {
            venue.programmes = programmes.to_vec();
        }
        Ok(())
    }
}

#[async_trait]
impl ProgrammeStore for MemoryStore {
    async fn find_programme(&self, event_id: &str) -> Result<Option<Programme>, StoreError> {
        Ok(self.inner.lock().await.programmes.get(event_id).cloned())
    }

    async fn upsert_programme(&self, programme: &Programme) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        if inner.fail_event_ids.contains(&programme.event_id) {
            return Err(StoreError::Unavailable(format!(
                "injected write failure for programme {}",
                programme.event_id
            )));
        }
        inner
            .programmes
            .insert(programme.event_id.clone(), programme.clone());
        Ok(())
    }

    async fn soft_delete_programmes_absent(&self, seen: &[String]) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock().await;
        let mut affected = 0;
        for programme in inner.programmes.values_mut() {
            if !seen.contains(&programme.event_id) {
                programme.deleted = true;
                affected += 1;
            }
        }
        Ok(affected)
    }

    async fn programme_ids_for_venue(&self, venue_id: &str) -> Result<Vec<String>, StoreError> {
        Ok(self
            .inner
            .lock()
            .await
            .programmes
            .values()
            .filter(|p| p.venue_id == venue_id && !p.deleted)
            .map(|p| p.event_id.clone())
            .collect())
    }
}

#[async_trait]
impl MetaStore for MemoryStore {
    async fn set_last_update(&self, at: DateTime<Utc>) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        if inner.fail_meta {
            return Err(StoreError::Unavailable(
                "injected write failure for sync metadata".to_string(),
            ));
        }
        inner
            .meta
            .insert(META_LAST_UPDATE.to_string(), at.to_rfc3339());
        Ok(())
    }

    async fn last_update(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        Ok(self
            .inner
            .lock()
            .await
            .meta
            .get(META_LAST_UPDATE)
            .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
            .map(|dt| dt.with_timezone(&Utc)))
    }

    async fn try_acquire_run_lock(&self) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().await;
        if inner.meta.get(META_SYNC_RUNNING).map(String::as_str) == Some("true") {
            return Ok(false);
        }
        inner
            .meta
            .insert(META_SYNC_RUNNING.to_string(), "true".to_string());
        Ok(true)
    }

    async fn release_run_lock(&self) -> Result<(), StoreError> {
        self.inner
            .lock()
            .await
            .meta
            .insert(META_SYNC_RUNNING.to_string(), "false".to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn venue(id: &str) -> Venue {
        Venue {
            venue_id: id.to_string(),
            name: format!("Venue {id}"),
            latitude: None,
            longitude: None,
            programmes: vec![],
            deleted: false,
        }
    }

    fn programme(id: &str, venue_id: &str, deleted: bool) -> Programme {
        Programme {
            event_id: id.to_string(),
            title: format!("Programme {id}"),
            venue_id: venue_id.to_string(),
            dateline: None,
            duration: None,
            price: None,
            description: None,
            presenter: None,
            programme_type: None,
            language: None,
            remarks: None,
            url: None,
            enquiry: None,
            likes: 0,
            submit_epoch: None,
            deleted,
        }
    }

    #[tokio::test]
    async fn memory_store_upserts_and_finds() {
        let store = MemoryStore::new();
        store.upsert_venue(&venue("v1")).await.unwrap();
        let found = store.find_venue("v1").await.unwrap().unwrap();
        assert_eq!(found.name, "Venue v1");
        assert!(store.find_venue("v2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn soft_delete_marks_only_untouched_venues() {
        let store = MemoryStore::new();
        store.upsert_venue(&venue("v1")).await.unwrap();
        store.upsert_venue(&venue("v2")).await.unwrap();

        let affected = store
            .soft_delete_venues_absent(&["v1".to_string()])
            .await
            .unwrap();
        assert_eq!(affected, 1);
        assert!(!store.find_venue("v1").await.unwrap().unwrap().deleted);
        assert!(store.find_venue("v2").await.unwrap().unwrap().deleted);
    }

    #[tokio::test]
    async fn programme_ids_for_venue_excludes_deleted() {
        let store = MemoryStore::new();
        store
            .upsert_programme(&programme("p1", "v1", false))
            .await
            .unwrap();
        store
            .upsert_programme(&programme("p2", "v1", true))
            .await
            .unwrap();
        store
            .upsert_programme(&programme("p3", "v2", false))
            .await
            .unwrap();

        let ids = store.programme_ids_for_venue("v1").await.unwrap();
        assert_eq!(ids, vec!["p1".to_string()]);
    }

    #[tokio::test]
    async fn run_lock_is_exclusive_until_released() {
        let store = MemoryStore::new();
        assert!(store.try_acquire_run_lock().await.unwrap());
        assert!(!store.try_acquire_run_lock().await.unwrap());
        store.release_run_lock().await.unwrap();
        assert!(store.try_acquire_run_lock().await.unwrap());
    }

    #[tokio::test]
    async fn last_update_round_trips() {
        let store = MemoryStore::new();
        assert!(store.last_update().await.unwrap().is_none());
        let at = Utc::now();
        store.set_last_update(at).await.unwrap();
        let stored = store.last_update().await.unwrap().unwrap();
        assert_eq!(stored.timestamp(), at.timestamp());
    }

    #[tokio::test]
    async fn injected_write_failures_surface_as_store_errors() {
        let store = MemoryStore::new();
        store.fail_venue_writes("v1").await;
        let err = store.upsert_venue(&venue("v1")).await.unwrap_err();
        assert!(matches!(err, StoreError::Unavailable(_)));
        store.upsert_venue(&venue("v2")).await.unwrap();
    }

    #[tokio::test]
    async fn injected_meta_failure_breaks_last_update_but_not_the_lock() {
        let store = MemoryStore::new();
        store.fail_meta_writes().await;

        let err = store.set_last_update(Utc::now()).await.unwrap_err();
        assert!(matches!(err, StoreError::Unavailable(_)));

        assert!(store.try_acquire_run_lock().await.unwrap());
        store.release_run_lock().await.unwrap();
    }
}
