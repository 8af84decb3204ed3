use std::collections::BTreeMap;

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::SqlitePool;

use super::models::{stored_venue, ListingRow};
use super::to_millis;
use crate::error::{AppError, Result};
use crate::types::{Listing, ListingKey, Venue};

const SELECT_LISTING: &str = r#"
    SELECT venue, external_id, title, description, yes_price, no_price,
           volume, volume_24h, close_time, last_updated
    FROM listings
"#;

/// Keyed access to the `listings` table. Every write is an upsert on
/// `(venue, external_id)`; rows of other keys are never touched.
#[derive(Clone)]
pub struct ListingStore {
    pool: SqlitePool,
}

impl ListingStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Listings for `venue` written strictly after `since`.
    pub async fn fresh_for_venue(&self, venue: Venue, since: DateTime<Utc>) -> Result<Vec<Listing>> {
        let rows: Vec<ListingRow> = sqlx::query_as(&format!(
            "{SELECT_LISTING} WHERE venue = ? AND last_updated > ? ORDER BY external_id"
        ))
        .bind(venue.as_str())
        .bind(to_millis(since))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(ListingRow::into_listing).collect()
    }

    /// Everything persisted for `venue`, regardless of age.
    pub async fn all_for_venue(&self, venue: Venue) -> Result<Vec<Listing>> {
        let rows: Vec<ListingRow> =
            sqlx::query_as(&format!("{SELECT_LISTING} WHERE venue = ? ORDER BY external_id"))
                .bind(venue.as_str())
                .fetch_all(&self.pool)
                .await?;
        rows.into_iter().map(ListingRow::into_listing).collect()
    }

    pub async fn all(&self) -> Result<Vec<Listing>> {
        let rows: Vec<ListingRow> =
            sqlx::query_as(&format!("{SELECT_LISTING} ORDER BY venue, external_id"))
                .fetch_all(&self.pool)
                .await?;
        rows.into_iter().map(ListingRow::into_listing).collect()
    }

    pub async fn get(&self, key: &ListingKey) -> Result<Option<Listing>> {
        let row: Option<ListingRow> =
            sqlx::query_as(&format!("{SELECT_LISTING} WHERE venue = ? AND external_id = ?"))
                .bind(key.venue.as_str())
                .bind(&key.external_id)
                .fetch_optional(&self.pool)
                .await?;
        row.map(ListingRow::into_listing).transpose()
    }

    /// Insert-or-replace every listing in one transaction, so a failure part way
    /// through leaves the previous snapshot intact.
    pub async fn upsert_many(&self, listings: &[Listing]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for l in listings {
            sqlx::query(
                r#"
                INSERT INTO listings (
                    venue, external_id, title, description, yes_price, no_price,
                    volume, volume_24h, close_time, last_updated
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(venue, external_id) DO UPDATE SET
                    title = excluded.title,
                    description = excluded.description,
                    yes_price = excluded.yes_price,
                    no_price = excluded.no_price,
                    volume = excluded.volume,
                    volume_24h = excluded.volume_24h,
                    close_time = excluded.close_time,
                    last_updated = excluded.last_updated
                "#,
            )
            .bind(l.venue.as_str())
            .bind(&l.external_id)
            .bind(&l.title)
            .bind(&l.description)
            .bind(l.yes_price)
            .bind(l.no_price)
            .bind(l.volume.as_option())
            .bind(l.volume_24h.as_option())
            .bind(l.close_time.map(|t| t.to_rfc3339_opts(SecondsFormat::AutoSi, true)))
            .bind(to_millis(l.last_updated))
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Returns whether a row was removed.
    pub async fn delete(&self, key: &ListingKey) -> Result<bool> {
        let result = sqlx::query("DELETE FROM listings WHERE venue = ? AND external_id = ?")
            .bind(key.venue.as_str())
            .bind(&key.external_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn count_by_venue(&self) -> Result<BTreeMap<Venue, i64>> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT venue, COUNT(*) FROM listings GROUP BY venue")
                .fetch_all(&self.pool)
                .await?;
        rows.into_iter()
            .map(|(v, n)| match Venue::parse(&v) {
                Some(venue) => Ok((venue, n)),
                None => Err(AppError::CorruptRow(format!("listings stored under unknown venue {v:?}"))),
            })
            .collect()
    }
}
