//! Row types for the `listings` and `duplicate_links` tables (see migrations/).

use super::from_millis;
use crate::error::{AppError, Result};
use crate::normalizer::parse_time;
use crate::types::{JoinedRow, Listing, ListingKey, QuoteSide, Venue, Volume};

#[derive(Debug, sqlx::FromRow)]
pub struct ListingRow {
    pub venue: String,
    pub external_id: String,
    pub title: String,
    pub description: String,
    pub yes_price: Option<f64>,
    pub no_price: Option<f64>,
    pub volume: Option<f64>,
    pub volume_24h: Option<f64>,
    pub close_time: Option<String>,
    pub last_updated: i64,
}

/// A venue column this build does not know is a corrupt store, not a filter.
pub fn stored_venue(raw: &str, external_id: &str) -> Result<Venue> {
    Venue::parse(raw).ok_or_else(|| {
        AppError::CorruptRow(format!("listing {external_id:?} has unknown venue {raw:?}"))
    })
}

impl ListingRow {
    pub fn into_listing(self) -> Result<Listing> {
        let venue = stored_venue(&self.venue, &self.external_id)?;
        Ok(Listing {
            venue,
            external_id: self.external_id,
            title: self.title,
            description: self.description,
            yes_price: self.yes_price,
            no_price: self.no_price,
            volume: Volume::from_option(self.volume),
            volume_24h: Volume::from_option(self.volume_24h),
            close_time: self.close_time.as_deref().and_then(parse_time),
            last_updated: from_millis(self.last_updated),
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
pub struct LinkRow {
    pub venue_a: String,
    pub external_id_a: String,
    pub venue_b: String,
    pub external_id_b: String,
    pub score: f64,
    pub created_at: i64,
}

impl LinkRow {
    pub fn keys(&self) -> Result<(ListingKey, ListingKey)> {
        let a = stored_venue(&self.venue_a, &self.external_id_a)?;
        let b = stored_venue(&self.venue_b, &self.external_id_b)?;
        Ok((
            ListingKey::new(a, self.external_id_a.clone()),
            ListingKey::new(b, self.external_id_b.clone()),
        ))
    }
}

/// One link LEFT JOINed against both listing rows. Side columns are NULL
/// when that listing row is gone.
#[derive(Debug, sqlx::FromRow)]
pub struct JoinedLinkRow {
    pub venue_a: String,
    pub external_id_a: String,
    pub venue_b: String,
    pub external_id_b: String,
    pub score: f64,
    pub a_title: Option<String>,
    pub a_yes_price: Option<f64>,
    pub a_no_price: Option<f64>,
    pub a_volume: Option<f64>,
    pub a_volume_24h: Option<f64>,
    pub a_close_time: Option<String>,
    pub a_last_updated: Option<i64>,
    pub b_title: Option<String>,
    pub b_yes_price: Option<f64>,
    pub b_no_price: Option<f64>,
    pub b_volume: Option<f64>,
    pub b_volume_24h: Option<f64>,
    pub b_close_time: Option<String>,
    pub b_last_updated: Option<i64>,
}

impl JoinedLinkRow {
    pub fn into_joined(self) -> Result<JoinedRow> {
        let a = ListingKey::new(stored_venue(&self.venue_a, &self.external_id_a)?, self.external_id_a);
        let b = ListingKey::new(stored_venue(&self.venue_b, &self.external_id_b)?, self.external_id_b);

        // A side exists iff its row matched; title and last_updated are NOT NULL in the table.
        let a_quote = match (self.a_title, self.a_last_updated) {
            (Some(title), Some(updated)) => Some(QuoteSide {
                title,
                yes_price: self.a_yes_price,
                no_price: self.a_no_price,
                volume: Volume::from_option(self.a_volume),
                volume_24h: Volume::from_option(self.a_volume_24h),
                close_time: self.a_close_time.as_deref().and_then(parse_time),
                last_updated: from_millis(updated),
            }),
            _ => None,
        };
        let b_quote = match (self.b_title, self.b_last_updated) {
            (Some(title), Some(updated)) => Some(QuoteSide {
                title,
                yes_price: self.b_yes_price,
                no_price: self.b_no_price,
                volume: Volume::from_option(self.b_volume),
                volume_24h: Volume::from_option(self.b_volume_24h),
                close_time: self.b_close_time.as_deref().and_then(parse_time),
                last_updated: from_millis(updated),
            }),
            _ => None,
        };

        let complete = a_quote.is_some() && b_quote.is_some();
        Ok(JoinedRow { a, b, score: self.score, a_quote, b_quote, complete })
    }
}
