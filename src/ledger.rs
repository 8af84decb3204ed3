//! Persistent, idempotent record of cross-venue duplicate links.

use sqlx::SqlitePool;
use tracing::{info, warn};

use crate::db::models::{JoinedLinkRow, LinkRow};
use crate::db::{from_millis, to_millis};
use crate::error::Result;
use crate::types::{DuplicateLink, JoinedRow};

#[derive(Clone)]
pub struct DuplicateLedger {
    pool: SqlitePool,
}

impl DuplicateLedger {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Persist `links`, returning only the ones that were not already stored
    /// (in either orientation). Same-venue pairs are skipped.
    pub async fn record(&self, links: &[DuplicateLink]) -> Result<Vec<DuplicateLink>> {
        let mut created = Vec::new();
        let mut tx = self.pool.begin().await?;
        for link in links {
            let link = DuplicateLink::canonical(link.a.clone(), link.b.clone(), link.score, link.created_at);
            if !link.is_cross_venue() {
                warn!(a = %link.a, b = %link.b, "Refusing same-venue duplicate link");
                continue;
            }
            let result = sqlx::query(
                r#"
                INSERT INTO duplicate_links (
                    venue_a, external_id_a, venue_b, external_id_b, score, created_at
                ) VALUES (?, ?, ?, ?, ?, ?)
                ON CONFLICT(venue_a, external_id_a, venue_b, external_id_b) DO NOTHING
                "#,
            )
            .bind(link.a.venue.as_str())
            .bind(&link.a.external_id)
            .bind(link.b.venue.as_str())
            .bind(&link.b.external_id)
            .bind(link.score)
            .bind(to_millis(link.created_at))
            .execute(&mut *tx)
            .await?;
            if result.rows_affected() > 0 {
                created.push(link);
            }
        }
        tx.commit().await?;

        if !created.is_empty() {
            info!(
                new_links = created.len(),
                offered = links.len(),
                "Recorded {} new duplicate links",
                created.len()
            );
        }
        Ok(created)
    }

    pub async fn links(&self) -> Result<Vec<DuplicateLink>> {
        let rows: Vec<LinkRow> = sqlx::query_as(
            r#"
            SELECT venue_a, external_id_a, venue_b, external_id_b, score, created_at
            FROM duplicate_links
            ORDER BY id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|row| {
                let (a, b) = row.keys()?;
                Ok(DuplicateLink { a, b, score: row.score, created_at: from_millis(row.created_at) })
            })
            .collect()
    }

    pub async fn count(&self) -> Result<i64> {
        let (n,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM duplicate_links")
            .fetch_one(&self.pool)
            .await?;
        Ok(n)
    }

    /// Every link with both sides' current quotes. A side whose listing row is
    /// missing comes back empty and the row is flagged incomplete.
    pub async fn joined_view(&self) -> Result<Vec<JoinedRow>> {
        let rows: Vec<JoinedLinkRow> = sqlx::query_as(
            r#"
            SELECT d.venue_a, d.external_id_a, d.venue_b, d.external_id_b, d.score,
                   a.title AS a_title, a.yes_price AS a_yes_price, a.no_price AS a_no_price,
                   a.volume AS a_volume, a.volume_24h AS a_volume_24h,
                   a.close_time AS a_close_time, a.last_updated AS a_last_updated,
                   b.title AS b_title, b.yes_price AS b_yes_price, b.no_price AS b_no_price,
                   b.volume AS b_volume, b.volume_24h AS b_volume_24h,
                   b.close_time AS b_close_time, b.last_updated AS b_last_updated
            FROM duplicate_links d
            LEFT JOIN listings a ON a.venue = d.venue_a AND a.external_id = d.external_id_a
            LEFT JOIN listings b ON b.venue = d.venue_b AND b.external_id = d.external_id_b
            ORDER BY d.score DESC, d.id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(JoinedLinkRow::into_joined).collect()
    }
}
