//! Idempotent Postgres upsert of merged records.

use anyhow::{Context, Result};
use async_trait::async_trait;
use mnld_core::{slugify, BusinessStatus, EnrichmentOutcome, MergedRecord};
use mnld_pipeline::{ImportFailure, ImportReport, ImportSink};
use sqlx::{PgPool, Postgres, Row, Transaction};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "mnld-import";

/// Operator-owned columns. The update path must never name these; reruns
/// of the pipeline refresh data columns only.
pub const MODERATION_COLUMNS: &[&str] = &[
    "is_published",
    "verification_status",
    "is_featured",
    "featured_priority",
    "subscription_tier",
];

const FIND_BY_PLACE_ID_SQL: &str = r#"
SELECT id
  FROM lawyers
 WHERE google_place_id = $1
"#;

const FIND_BY_SLUG_SQL: &str = r#"
SELECT id
  FROM lawyers
 WHERE slug = $1
"#;

const INSERT_LAWYER_SQL: &str = r#"
INSERT INTO lawyers (
    firm_name, slug, state, state_code, city, address, phone, email, website,
    description, short_description, years_experience, founded_year, languages,
    awards, accreditations, business_hours, meta_title, meta_description,
    google_place_id, google_rating, google_review_count, google_maps_url,
    free_consultation, no_win_no_fee, home_visits_available,
    telehealth_available, accepts_legal_aid, external_data,
    profile_completeness_score,
    is_published, verification_status, is_featured, featured_priority, subscription_tier
) VALUES (
    $1, $2, $3, $4, $5, $6, $7, $8, $9,
    $10, $11, $12, $13, $14,
    $15, $16, $17, $18, $19,
    $20, $21, $22, $23,
    $24, $25, $26,
    $27, $28, $29,
    $30,
    FALSE, 'unverified', FALSE, 0, 'free'
)
RETURNING id
"#;

const UPDATE_LAWYER_SQL: &str = r#"
UPDATE lawyers SET
    firm_name = $1,
    slug = $2,
    state = $3,
    state_code = $4,
    city = $5,
    address = $6,
    phone = $7,
    email = $8,
    website = $9,
    description = $10,
    short_description = $11,
    years_experience = $12,
    founded_year = $13,
    languages = $14,
    awards = $15,
    accreditations = $16,
    business_hours = $17,
    meta_title = $18,
    meta_description = $19,
    google_place_id = $20,
    google_rating = $21,
    google_review_count = $22,
    google_maps_url = $23,
    free_consultation = $24,
    no_win_no_fee = $25,
    home_visits_available = $26,
    telehealth_available = $27,
    accepts_legal_aid = $28,
    external_data = $29,
    profile_completeness_score = $30,
    updated_at = NOW()
WHERE id = $31
"#;

#[derive(Debug, Error)]
enum RecordError {
    #[error("constraint violation: {0}")]
    Constraint(String),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

fn classify_record_error(err: sqlx::Error) -> RecordError {
    match &err {
        sqlx::Error::Database(db)
            if db.is_unique_violation()
                || db.is_foreign_key_violation()
                || db.is_check_violation() =>
        {
            RecordError::Constraint(db.message().to_string())
        }
        _ => RecordError::Database(err),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RowOutcome {
    Inserted,
    Updated,
    Skipped,
}

/// A closed business has no place in the directory; it is skipped rather
/// than inserted, and an existing row is left for the operator to retire.
pub fn should_skip(record: &MergedRecord) -> bool {
    record.candidate.business_status == BusinessStatus::Closed
        || record.slug.is_empty()
        || record.candidate.firm_name.is_empty()
}

/// Feature flags are only asserted when the website was actually read;
/// otherwise the stored value stays NULL (unknown), matching the scoring
/// model's unset-equals-false treatment without fabricating a negative.
fn feature_value(record: &MergedRecord, flag: bool) -> Option<bool> {
    if record.enrichment.outcome == EnrichmentOutcome::Fetched {
        Some(flag)
    } else {
        None
    }
}

pub struct ImportWriter {
    pool: PgPool,
}

impl ImportWriter {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPool::connect(database_url)
            .await
            .context("connecting to destination store")?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Startup probe. A run must not begin any phase against an
    /// unreachable destination store.
    pub async fn ensure_reachable(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .context("destination store unreachable")?;
        Ok(())
    }

    async fn find_existing(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        record: &MergedRecord,
    ) -> Result<Option<Uuid>, sqlx::Error> {
        // Place-id match takes precedence over slug so a renamed firm does
        // not get a second row.
        let row = sqlx::query(FIND_BY_PLACE_ID_SQL)
            .bind(&record.candidate.place_id)
            .fetch_optional(&mut **tx)
            .await?;
        if let Some(row) = row {
            return Ok(Some(row.try_get("id")?));
        }
        let row = sqlx::query(FIND_BY_SLUG_SQL)
            .bind(&record.slug)
            .fetch_optional(&mut **tx)
            .await?;
        match row {
            Some(row) => Ok(Some(row.try_get("id")?)),
            None => Ok(None),
        }
    }

    async fn import_one(&self, record: &MergedRecord) -> Result<RowOutcome, RecordError> {
        if should_skip(record) {
            return Ok(RowOutcome::Skipped);
        }

        let mut tx = self.pool.begin().await?;
        let existing = self.find_existing(&mut tx, record).await?;
        let lawyer_id = match existing {
            Some(id) => {
                self.update_lawyer(&mut tx, id, record)
                    .await
                    .map_err(classify_record_error)?;
                id
            }
            None => self
                .insert_lawyer(&mut tx, record)
                .await
                .map_err(classify_record_error)?,
        };
        self.replace_children(&mut tx, lawyer_id, record)
            .await
            .map_err(classify_record_error)?;
        tx.commit().await?;

        Ok(if existing.is_some() {
            RowOutcome::Updated
        } else {
            RowOutcome::Inserted
        })
    }

    async fn insert_lawyer(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        record: &MergedRecord,
    ) -> Result<Uuid, sqlx::Error> {
        let row = bind_data_columns(sqlx::query(INSERT_LAWYER_SQL), record)
            .fetch_one(&mut **tx)
            .await?;
        row.try_get("id")
    }

    async fn update_lawyer(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        lawyer_id: Uuid,
        record: &MergedRecord,
    ) -> Result<(), sqlx::Error> {
        bind_data_columns(sqlx::query(UPDATE_LAWYER_SQL), record)
            .bind(lawyer_id)
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    /// Child collections are pipeline-owned, so each import replaces them
    /// wholesale under the parent's transaction.
    async fn replace_children(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        lawyer_id: Uuid,
        record: &MergedRecord,
    ) -> Result<(), sqlx::Error> {
        sqlx::query("DELETE FROM lawyer_specializations WHERE lawyer_id = $1")
            .bind(lawyer_id)
            .execute(&mut **tx)
            .await?;
        for name in &record.enrichment.specializations {
            let spec_slug = slugify(name);
            let row = sqlx::query(
                r#"
                INSERT INTO specializations (name, slug)
                VALUES ($1, $2)
                ON CONFLICT (slug) DO UPDATE SET name = EXCLUDED.name
                RETURNING id
                "#,
            )
            .bind(name)
            .bind(&spec_slug)
            .fetch_one(&mut **tx)
            .await?;
            let spec_id: Uuid = row.try_get("id")?;
            sqlx::query(
                r#"
                INSERT INTO lawyer_specializations (lawyer_id, specialization_id)
                VALUES ($1, $2)
                ON CONFLICT DO NOTHING
                "#,
            )
            .bind(lawyer_id)
            .bind(spec_id)
            .execute(&mut **tx)
            .await?;
        }

        sqlx::query("DELETE FROM lawyer_service_areas WHERE lawyer_id = $1")
            .bind(lawyer_id)
            .execute(&mut **tx)
            .await?;
        for area in &record.service_areas {
            sqlx::query(
                r#"
                INSERT INTO lawyer_service_areas (lawyer_id, state, state_code, city, postcode, is_primary_location)
                VALUES ($1, $2, $3, $4, $5, $6)
                "#,
            )
            .bind(lawyer_id)
            .bind(&area.state)
            .bind(&area.state_code)
            .bind(&area.city)
            .bind(&area.postcode)
            .bind(area.is_primary)
            .execute(&mut **tx)
            .await?;
        }

        sqlx::query("DELETE FROM lawyer_team_members WHERE lawyer_id = $1")
            .bind(lawyer_id)
            .execute(&mut **tx)
            .await?;
        for (index, member) in record.enrichment.team_members.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO lawyer_team_members (lawyer_id, full_name, role, bio, photo_url, display_order)
                VALUES ($1, $2, $3, $4, $5, $6)
                "#,
            )
            .bind(lawyer_id)
            .bind(&member.full_name)
            .bind(&member.role)
            .bind(&member.bio)
            .bind(&member.photo_url)
            .bind(index as i32)
            .execute(&mut **tx)
            .await?;
        }

        Ok(())
    }
}

fn bind_data_columns<'q>(
    query: sqlx::query::Query<'q, Postgres, sqlx::postgres::PgArguments>,
    record: &'q MergedRecord,
) -> sqlx::query::Query<'q, Postgres, sqlx::postgres::PgArguments> {
    let candidate = &record.candidate;
    let enrichment = &record.enrichment;
    let business_hours = candidate
        .business_hours
        .as_ref()
        .and_then(|hours| serde_json::to_value(hours).ok());
    let external_data = serde_json::json!({
        "source": "places_text_search",
        "collected_at": candidate.collected_at,
        "business_status": candidate.business_status,
        "latitude": candidate.latitude,
        "longitude": candidate.longitude,
    });

    query
        .bind(&candidate.firm_name)
        .bind(&record.slug)
        .bind(&candidate.address_parts.state)
        .bind(&candidate.state_code)
        .bind(&candidate.city)
        .bind(&candidate.formatted_address)
        .bind(&candidate.phone)
        .bind(&record.contact_email)
        .bind(&candidate.website)
        .bind(&record.synthesis.description)
        .bind(&record.synthesis.short_description)
        .bind(enrichment.years_experience.map(|y| y as i32))
        .bind(enrichment.founded_year)
        .bind(&enrichment.languages)
        .bind(&enrichment.awards)
        .bind(&enrichment.accreditations)
        .bind(business_hours)
        .bind(&record.synthesis.meta_title)
        .bind(&record.synthesis.meta_description)
        .bind(&candidate.place_id)
        .bind(candidate.rating)
        .bind(candidate.review_count.map(|n| n as i32))
        .bind(&candidate.maps_url)
        .bind(feature_value(record, enrichment.features.free_consultation))
        .bind(feature_value(record, enrichment.features.no_win_no_fee))
        .bind(feature_value(record, enrichment.features.home_visits))
        .bind(feature_value(record, enrichment.features.telehealth))
        .bind(feature_value(record, enrichment.features.legal_aid))
        .bind(external_data)
        .bind(record.profile_completeness_score as i32)
}

#[async_trait]
impl ImportSink for ImportWriter {
    async fn import_all(&self, records: &[MergedRecord]) -> Result<ImportReport> {
        let mut report = ImportReport::default();
        for record in records {
            match self.import_one(record).await {
                Ok(RowOutcome::Inserted) => report.inserted += 1,
                Ok(RowOutcome::Updated) => report.updated += 1,
                Ok(RowOutcome::Skipped) => {
                    info!(slug = record.slug.as_str(), "skipping record");
                    report.skipped += 1;
                }
                Err(err) => {
                    warn!(
                        slug = record.slug.as_str(),
                        firm = record.candidate.firm_name.as_str(),
                        error = %err,
                        "record import failed; continuing batch"
                    );
                    report.failed += 1;
                    report.errors.push(ImportFailure {
                        slug: record.slug.clone(),
                        firm_name: record.candidate.firm_name.clone(),
                        reason: err.to_string(),
                    });
                }
            }
        }
        info!(
            inserted = report.inserted,
            updated = report.updated,
            skipped = report.skipped,
            failed = report.failed,
            "import batch finished"
        );
        Ok(report)
    }
}
