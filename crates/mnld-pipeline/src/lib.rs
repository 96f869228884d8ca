//! Merge, synthesis, completeness scoring and phase orchestration.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mnld_core::{
    slugify, CandidateRecord, EnrichmentOutcome, EnrichmentRecord, MergedRecord, ServiceArea,
    Synthesis,
};
use mnld_sources::{CandidateSource, Enricher, SearchTarget};
use mnld_storage::RunStore;
use serde::{Deserialize, Serialize};
use strsim::jaro_winkler;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "mnld-pipeline";

pub const SHORT_DESCRIPTION_MAX_CHARS: usize = 200;
pub const META_TITLE_MAX_CHARS: usize = 60;
pub const META_DESCRIPTION_MAX_CHARS: usize = 160;

/// Description must reach this length before it earns its score weight,
/// and before an enrichment-provided description displaces the template.
pub const DESCRIPTION_MIN_CHARS: usize = 100;

// ---------------------------------------------------------------------------
// Collection plan
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct CollectionPlan {
    pub cities: Vec<CityPlan>,
    pub search_terms: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CityPlan {
    pub city: String,
    pub state_code: String,
    #[serde(default)]
    pub latitude: Option<f64>,
    #[serde(default)]
    pub longitude: Option<f64>,
    #[serde(default)]
    pub radius_m: Option<f64>,
}

impl CityPlan {
    pub fn target(&self) -> SearchTarget {
        SearchTarget {
            city: self.city.clone(),
            state_code: self.state_code.clone(),
            latitude: self.latitude,
            longitude: self.longitude,
            radius_m: self.radius_m,
        }
    }
}

pub fn load_plan(path: &Path) -> Result<CollectionPlan> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    let plan: CollectionPlan =
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    if plan.cities.is_empty() {
        anyhow::bail!("{}: no cities configured", path.display());
    }
    if plan.search_terms.is_empty() {
        anyhow::bail!("{}: no search terms configured", path.display());
    }
    Ok(plan)
}

// ---------------------------------------------------------------------------
// Phases and snapshots
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Search,
    Enrich,
    Synthesize,
    Import,
}

impl Phase {
    pub fn snapshot_name(self) -> &'static str {
        match self {
            Phase::Search => "01_search",
            Phase::Enrich => "02_enriched",
            Phase::Synthesize => "03_final",
            Phase::Import => "04_import",
        }
    }
}

pub const SUMMARY_SNAPSHOT: &str = "summary";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryFailure {
    pub city: String,
    pub state_code: String,
    pub term: String,
    pub pages_fetched: usize,
    pub failed_pages: usize,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchSnapshot {
    pub candidates: Vec<CandidateRecord>,
    pub failed_queries: Vec<QueryFailure>,
    /// Hits dropped because their place id was already collected under
    /// another search term.
    pub duplicate_hits: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnrichSnapshot {
    pub records: Vec<EnrichmentRecord>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FinalSnapshot {
    pub records: Vec<MergedRecord>,
    pub possible_duplicates: Vec<DuplicateReviewItem>,
}

// ---------------------------------------------------------------------------
// Completeness scoring
// ---------------------------------------------------------------------------

/// Fixed category weights. They sum to exactly 100 when every category is
/// satisfied; `completeness_score` is pure over its inputs.
pub mod weights {
    pub const BASE_CONTACT: u8 = 20;
    pub const DESCRIPTION: u8 = 5;
    pub const YEARS_EXPERIENCE: u8 = 5;
    pub const SPECIALIZATIONS: u8 = 5;
    pub const TEAM: u8 = 5;
    pub const SERVICE_FEATURES: u8 = 10;
    pub const REVIEWS_MANY: u8 = 15;
    pub const REVIEWS_SOME: u8 = 10;
    pub const CASE_STUDIES: u8 = 10;
    pub const AWARDS: u8 = 5;
    pub const PROFILE_IMAGE: u8 = 10;
    pub const VERIFIED: u8 = 10;
}

pub const REVIEWS_MANY_MIN: u32 = 3;

/// Child-collection state the scorer cannot read off the record itself.
/// Reviews and case studies live in operator-owned tables; at collection
/// time the review count comes from the search source and case studies
/// are zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelatedState {
    pub review_count: u32,
    pub case_study_count: u32,
    pub verified: bool,
}

pub fn completeness_score(record: &MergedRecord, related: &RelatedState) -> u8 {
    let candidate = &record.candidate;
    let enrichment = &record.enrichment;
    let mut score = 0u8;

    // Contact surface owned by the search source: name, address, phone,
    // website. Email is enrichment-owned and scored nowhere else.
    let base_complete = !candidate.firm_name.is_empty()
        && candidate.formatted_address.is_some()
        && candidate.phone.is_some()
        && candidate.website.is_some();
    if base_complete {
        score += weights::BASE_CONTACT;
    }

    if record.synthesis.description.chars().count() >= DESCRIPTION_MIN_CHARS {
        score += weights::DESCRIPTION;
    }
    if enrichment.years_experience.is_some() {
        score += weights::YEARS_EXPERIENCE;
    }
    if !enrichment.specializations.is_empty() {
        score += weights::SPECIALIZATIONS;
    }
    if !enrichment.team_members.is_empty() {
        score += weights::TEAM;
    }
    if enrichment.features.any() {
        score += weights::SERVICE_FEATURES;
    }

    if related.review_count >= REVIEWS_MANY_MIN {
        score += weights::REVIEWS_MANY;
    } else if related.review_count > 0 {
        score += weights::REVIEWS_SOME;
    }
    if related.case_study_count > 0 {
        score += weights::CASE_STUDIES;
    }
    if !enrichment.awards.is_empty() {
        score += weights::AWARDS;
    }
    if record.profile_image_url.is_some() {
        score += weights::PROFILE_IMAGE;
    }
    if related.verified {
        score += weights::VERIFIED;
    }

    score
}

// ---------------------------------------------------------------------------
// Description synthesis
// ---------------------------------------------------------------------------

/// Compose description, short description and SEO metadata from the fields
/// actually present on the record. Never invents facts; always yields
/// non-empty text via the name/city/state fallback.
pub fn synthesize(candidate: &CandidateRecord, enrichment: &EnrichmentRecord) -> Synthesis {
    let description = match &enrichment.description {
        Some(text) if text.chars().count() >= DESCRIPTION_MIN_CHARS => text.clone(),
        _ => generate_description(candidate, enrichment),
    };
    Synthesis {
        description,
        short_description: generate_short_description(candidate, enrichment),
        meta_title: generate_meta_title(candidate),
        meta_description: generate_meta_description(candidate, enrichment),
    }
}

fn state_label(candidate: &CandidateRecord) -> String {
    candidate
        .address_parts
        .state
        .clone()
        .unwrap_or_else(|| candidate.state_code.clone())
}

fn feature_phrases(enrichment: &EnrichmentRecord) -> Vec<&'static str> {
    let mut phrases = Vec::new();
    if enrichment.features.no_win_no_fee {
        phrases.push("no win, no fee arrangements");
    }
    if enrichment.features.free_consultation {
        phrases.push("free initial consultations");
    }
    if enrichment.features.home_visits {
        phrases.push("home and hospital visits");
    }
    if enrichment.features.telehealth {
        phrases.push("virtual consultations");
    }
    if enrichment.features.legal_aid {
        phrases.push("legal aid assistance");
    }
    phrases
}

fn join_natural(items: &[String]) -> String {
    match items.len() {
        0 => String::new(),
        1 => items[0].clone(),
        2 => format!("{} and {}", items[0], items[1]),
        _ => format!(
            "{}, and {}",
            items[..items.len() - 1].join(", "),
            items[items.len() - 1]
        ),
    }
}

fn generate_description(candidate: &CandidateRecord, enrichment: &EnrichmentRecord) -> String {
    let mut paragraphs = Vec::new();
    paragraphs.push(intro_paragraph(candidate, enrichment));
    paragraphs.push(specializations_paragraph(enrichment));
    paragraphs.push(experience_paragraph(enrichment));
    paragraphs.push(features_paragraph(enrichment));
    paragraphs.push(call_to_action(candidate, enrichment));
    paragraphs.join("\n\n")
}

fn intro_paragraph(candidate: &CandidateRecord, enrichment: &EnrichmentRecord) -> String {
    let mut adjectives: Vec<&str> = Vec::new();
    match enrichment.years_experience {
        Some(years) if years > 20 => adjectives.push("highly experienced"),
        Some(years) if years > 10 => adjectives.push("experienced"),
        _ => {}
    }
    match candidate.rating {
        Some(rating) if rating >= 4.5 => adjectives.push("top-rated"),
        Some(rating) if rating >= 4.0 => adjectives.push("well-regarded"),
        _ => {}
    }
    if !enrichment.awards.is_empty() {
        adjectives.push("award-winning");
    }
    let adjective = if adjectives.is_empty() {
        "dedicated".to_string()
    } else {
        adjectives[..adjectives.len().min(2)].join(", ")
    };

    let mut intro = format!(
        "{} is a {} medical negligence law firm",
        candidate.firm_name, adjective
    );
    let state = state_label(candidate);
    if !candidate.city.is_empty() && !state.is_empty() {
        intro.push_str(&format!(" serving {}, {}", candidate.city, state));
    } else if !candidate.city.is_empty() {
        intro.push_str(&format!(" based in {}", candidate.city));
    } else if !state.is_empty() {
        intro.push_str(&format!(" serving {state}"));
    }
    intro.push('.');

    if let Some(years) = enrichment.years_experience {
        if let Some(founded) = enrichment.founded_year {
            intro.push_str(&format!(
                " Since {founded}, we have been dedicated to representing victims of medical malpractice."
            ));
        } else {
            intro.push_str(&format!(
                " With over {years} years of experience, we have successfully represented numerous medical negligence victims."
            ));
        }
    }
    intro
}

fn specializations_paragraph(enrichment: &EnrichmentRecord) -> String {
    if enrichment.specializations.is_empty() {
        return "We handle all types of medical negligence and malpractice cases, providing \
                expert legal representation for victims of medical errors."
            .to_string();
    }
    let lowered: Vec<String> = enrichment
        .specializations
        .iter()
        .map(|s| s.to_lowercase())
        .collect();
    format!(
        "Our practice areas include {}. We understand the complex medical and legal issues \
         involved in these cases and work diligently to secure the compensation our clients \
         deserve for their injuries and suffering.",
        join_natural(&lowered)
    )
}

fn experience_paragraph(enrichment: &EnrichmentRecord) -> String {
    let mut parts: Vec<String> = Vec::new();
    if !enrichment.awards.is_empty() {
        let award_text = if enrichment.awards.len() == 1 {
            enrichment.awards[0].clone()
        } else {
            format!(
                "{} professional awards and recognitions",
                enrichment.awards.len()
            )
        };
        parts.push(format!("We have received {award_text}"));
    }
    if !enrichment.accreditations.is_empty() {
        parts.push(
            "Our lawyers hold specialist accreditations in personal injury and medical \
             negligence law"
                .to_string(),
        );
    }
    if enrichment.team_members.len() > 1 {
        parts.push(format!(
            "Our team of {} dedicated legal professionals brings diverse expertise to every case",
            enrichment.team_members.len()
        ));
    }
    if parts.is_empty() {
        return "Our experienced legal team is dedicated to providing exceptional \
                representation for medical negligence victims. We stay current with the latest \
                developments in medical malpractice law to best serve our clients."
            .to_string();
    }
    format!("{}.", parts.join(". "))
}

fn features_paragraph(enrichment: &EnrichmentRecord) -> String {
    let phrases = feature_phrases(enrichment);
    if phrases.is_empty() {
        return "We are committed to providing accessible, compassionate legal services to \
                medical negligence victims. Our client-focused approach ensures you receive \
                the personal attention and expert representation your case deserves."
            .to_string();
    }
    let owned: Vec<String> = phrases.iter().map(|p| p.to_string()).collect();
    format!(
        "We understand that pursuing a medical negligence claim can be daunting, which is why \
         we offer {}. Our compassionate approach means we take the time to understand your \
         situation and guide you through every step of the legal process.",
        join_natural(&owned)
    )
}

fn call_to_action(candidate: &CandidateRecord, enrichment: &EnrichmentRecord) -> String {
    let mut cta =
        "If you or a loved one has been a victim of medical negligence, don't wait to seek \
         legal advice. "
            .to_string();
    if enrichment.features.free_consultation {
        cta.push_str(&format!(
            "Contact {} today for a free, confidential consultation. ",
            candidate.firm_name
        ));
    } else {
        cta.push_str(&format!(
            "Contact {} today to discuss your case. ",
            candidate.firm_name
        ));
    }
    cta.push_str(
        "We'll review your situation, explain your legal options, and help you understand \
         your rights. ",
    );
    if candidate.city.is_empty() {
        cta.push_str(
            "Let our experienced medical negligence lawyers fight for the justice and \
             compensation you deserve.",
        );
    } else {
        cta.push_str(&format!(
            "Let our experienced {} medical negligence lawyers fight for the justice and \
             compensation you deserve.",
            candidate.city
        ));
    }
    cta
}

fn generate_short_description(
    candidate: &CandidateRecord,
    enrichment: &EnrichmentRecord,
) -> String {
    let mut parts: Vec<String> = Vec::new();
    if let Some(years) = enrichment.years_experience {
        parts.push(format!("{years}+ years experience"));
    }
    let specialization = enrichment
        .specializations
        .first()
        .map(|s| s.to_lowercase())
        .unwrap_or_else(|| "medical negligence".to_string());
    parts.push(specialization);

    let location = if candidate.city.is_empty() {
        candidate.state_code.clone()
    } else {
        candidate.city.clone()
    };
    if !location.is_empty() {
        parts.push(format!("in {location}"));
    }

    let mut highlights = Vec::new();
    if enrichment.features.no_win_no_fee {
        highlights.push("No Win No Fee");
    }
    if enrichment.features.free_consultation {
        highlights.push("Free Consultation");
    }
    if !highlights.is_empty() {
        parts.push(highlights.join(" | "));
    }

    let short = format!("{} - {}.", candidate.firm_name, parts.join(", "));
    truncate_at_sentence(&short, SHORT_DESCRIPTION_MAX_CHARS)
}

fn generate_meta_title(candidate: &CandidateRecord) -> String {
    let title = if candidate.firm_name.chars().count() > 30 {
        format!("Medical Negligence Lawyers {}", candidate.city)
    } else {
        format!(
            "{} - {} {}",
            candidate.firm_name, candidate.city, candidate.state_code
        )
    };
    cap_with_ellipsis(title.trim(), META_TITLE_MAX_CHARS)
}

fn generate_meta_description(
    candidate: &CandidateRecord,
    enrichment: &EnrichmentRecord,
) -> String {
    let mut parts = vec![candidate.firm_name.clone()];
    if !candidate.city.is_empty() {
        parts.push(format!("in {}", candidate.city));
    }
    if let Some(years) = enrichment.years_experience {
        parts.push(format!("{years}+ yrs exp"));
    }
    let mut meta = parts.join(" | ");

    let mut highlights = Vec::new();
    if enrichment.features.no_win_no_fee {
        highlights.push("No win no fee");
    }
    if enrichment.features.free_consultation {
        highlights.push("Free consultation");
    }
    if !highlights.is_empty() {
        meta.push_str(". ");
        meta.push_str(&highlights.join(", "));
    }
    meta.push_str(". Call today.");
    cap_with_ellipsis(&meta, META_DESCRIPTION_MAX_CHARS)
}

/// Bound `text` to `max_chars`, cutting at the last sentence end inside the
/// limit, or failing that at a word boundary. Never cuts mid-word.
pub fn truncate_at_sentence(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let prefix: String = text.chars().take(max_chars).collect();
    if let Some(idx) = prefix.rfind(['.', '!', '?']) {
        return prefix[..=idx].to_string();
    }
    match prefix.rfind(' ') {
        Some(idx) => prefix[..idx].trim_end().to_string(),
        None => prefix,
    }
}

fn cap_with_ellipsis(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let prefix: String = text.chars().take(max_chars.saturating_sub(3)).collect();
    let cut = prefix.rfind(' ').unwrap_or(prefix.len());
    format!("{}...", prefix[..cut].trim_end())
}

// ---------------------------------------------------------------------------
// Merge + slugs
// ---------------------------------------------------------------------------

/// Candidate ⊕ enrichment ⊕ synthesis. Field preference is
/// enrichment-first: values the website provided win over search-source
/// values, and synthesized text fills whatever remains.
pub fn merge_record(
    candidate: CandidateRecord,
    enrichment: EnrichmentRecord,
    synthesis: Synthesis,
    slug: String,
) -> MergedRecord {
    let contact_email = enrichment.contact_email.clone();
    let service_areas = vec![ServiceArea {
        state: candidate.address_parts.state.clone(),
        state_code: candidate.state_code.clone(),
        city: candidate.city.clone(),
        postcode: candidate.address_parts.postcode.clone(),
        is_primary: true,
    }];
    MergedRecord {
        candidate,
        enrichment,
        synthesis,
        slug,
        contact_email,
        profile_image_url: None,
        service_areas,
        profile_completeness_score: 0,
    }
}

pub fn base_slug(candidate: &CandidateRecord) -> String {
    if candidate.city.is_empty() {
        slugify(&candidate.firm_name)
    } else {
        slugify(&format!("{} {}", candidate.firm_name, candidate.city))
    }
}

/// Issues run-unique slugs, suffixing `-2`, `-3`, … on collision.
#[derive(Debug, Default)]
pub struct SlugAssigner {
    issued: HashSet<String>,
}

impl SlugAssigner {
    pub fn assign(&mut self, base: &str) -> String {
        let base = if base.is_empty() { "listing" } else { base };
        if self.issued.insert(base.to_string()) {
            return base.to_string();
        }
        let mut n = 2usize;
        loop {
            let candidate = format!("{base}-{n}");
            if self.issued.insert(candidate.clone()) {
                return candidate;
            }
            n += 1;
        }
    }
}

// ---------------------------------------------------------------------------
// Cross-identifier near-duplicate flagging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub struct NearDuplicateConfig {
    pub review_threshold: f64,
}

impl Default for NearDuplicateConfig {
    fn default() -> Self {
        Self {
            review_threshold: 0.90,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DuplicateReviewItem {
    pub place_id_a: String,
    pub place_id_b: String,
    pub firm_a: String,
    pub firm_b: String,
    pub confidence: f64,
}

/// Flags candidates that look like the same real-world firm listed under
/// two different place ids. Report-only: nothing is merged or suppressed
/// on a similarity guess.
pub struct NearDuplicateDetector {
    config: NearDuplicateConfig,
}

impl NearDuplicateDetector {
    pub fn new(config: NearDuplicateConfig) -> Self {
        Self { config }
    }

    pub fn normalize_fragment(input: &str) -> String {
        input
            .to_ascii_lowercase()
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { ' ' })
            .collect::<String>()
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn similarity(a: &CandidateRecord, b: &CandidateRecord) -> f64 {
        let name_a = Self::normalize_fragment(&a.firm_name);
        let name_b = Self::normalize_fragment(&b.firm_name);
        let key_a = Self::normalize_fragment(&format!("{} {}", a.firm_name, a.city));
        let key_b = Self::normalize_fragment(&format!("{} {}", b.firm_name, b.city));
        (jaro_winkler(&name_a, &name_b) * 0.7) + (jaro_winkler(&key_a, &key_b) * 0.3)
    }

    pub fn scan(&self, candidates: &[CandidateRecord]) -> Vec<DuplicateReviewItem> {
        let mut items = Vec::new();
        for i in 0..candidates.len() {
            for j in (i + 1)..candidates.len() {
                if candidates[i].place_id == candidates[j].place_id {
                    continue;
                }
                let score = Self::similarity(&candidates[i], &candidates[j]);
                if score >= self.config.review_threshold {
                    items.push(DuplicateReviewItem {
                        place_id_a: candidates[i].place_id.clone(),
                        place_id_b: candidates[j].place_id.clone(),
                        firm_a: candidates[i].firm_name.clone(),
                        firm_b: candidates[j].firm_name.clone(),
                        confidence: score,
                    });
                }
            }
        }
        items
    }
}

// ---------------------------------------------------------------------------
// Import sink contract
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportFailure {
    pub slug: String,
    pub firm_name: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImportReport {
    pub inserted: usize,
    pub updated: usize,
    pub skipped: usize,
    pub failed: usize,
    pub errors: Vec<ImportFailure>,
}

/// Destination-store writer. Implementations must be idempotent per record
/// and must never touch moderation fields on update.
#[async_trait]
pub trait ImportSink: Send + Sync {
    async fn import_all(&self, records: &[MergedRecord]) -> Result<ImportReport>;
}

// ---------------------------------------------------------------------------
// Run summary
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub resumed_from_search: bool,
    pub candidates: usize,
    pub duplicate_hits: usize,
    pub failed_queries: usize,
    pub websites_missing: usize,
    pub websites_unreachable: usize,
    pub records: usize,
    pub by_city: BTreeMap<String, usize>,
    pub completeness_buckets: BTreeMap<String, usize>,
    pub possible_duplicates: usize,
    pub import: Option<ImportReport>,
}

pub fn completeness_bucket(score: u8) -> &'static str {
    match score {
        0..=19 => "00-19",
        20..=39 => "20-39",
        40..=59 => "40-59",
        60..=79 => "60-79",
        _ => "80-100",
    }
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

/// Runs the four phases in sequence, sealing a snapshot after each one.
/// `--resume` starts from the newest sealed search snapshot so the most
/// rate-limited source is never re-queried.
pub struct Pipeline {
    store: RunStore,
    plan: CollectionPlan,
    source: Arc<dyn CandidateSource>,
    enricher: Arc<dyn Enricher>,
    sink: Option<Arc<dyn ImportSink>>,
    duplicates: NearDuplicateDetector,
}

impl Pipeline {
    pub fn new(
        store: RunStore,
        plan: CollectionPlan,
        source: Arc<dyn CandidateSource>,
        enricher: Arc<dyn Enricher>,
        sink: Option<Arc<dyn ImportSink>>,
    ) -> Self {
        Self {
            store,
            plan,
            source,
            enricher,
            sink,
            duplicates: NearDuplicateDetector::new(NearDuplicateConfig::default()),
        }
    }

    pub async fn run(&self, resume: bool) -> Result<RunSummary> {
        let started_at = Utc::now();

        let (run_id, search, resumed) = match self.locate_resume(resume).await? {
            Some((run_id, search)) => (run_id, search, true),
            None => {
                let run_id = RunStore::new_run_id(started_at);
                let search = self.run_search(&run_id).await?;
                (run_id, search, false)
            }
        };

        let enriched = self.run_enrich(&run_id, &search).await?;
        let synthesized = self.run_synthesize(&run_id, &search, &enriched).await?;
        let import = self.run_import(&run_id, &synthesized).await?;

        let summary = build_summary(
            &run_id,
            started_at,
            Utc::now(),
            resumed,
            &search,
            &enriched,
            &synthesized,
            import,
        );
        self.store
            .write_snapshot(&run_id, SUMMARY_SNAPSHOT, &summary)
            .await?;
        info!(
            run_id = run_id.as_str(),
            records = summary.records,
            failed_queries = summary.failed_queries,
            "run complete"
        );
        Ok(summary)
    }

    async fn locate_resume(&self, resume: bool) -> Result<Option<(String, SearchSnapshot)>> {
        if !resume {
            return Ok(None);
        }
        match self
            .store
            .latest_complete(Phase::Search.snapshot_name())
            .await?
        {
            Some(run_id) => {
                let search: SearchSnapshot = self
                    .store
                    .read_snapshot(&run_id, Phase::Search.snapshot_name())
                    .await?;
                info!(
                    run_id = run_id.as_str(),
                    candidates = search.candidates.len(),
                    "resuming from sealed search snapshot"
                );
                Ok(Some((run_id, search)))
            }
            None => {
                warn!("resume requested but no sealed search snapshot exists; searching from scratch");
                Ok(None)
            }
        }
    }

    async fn run_search(&self, run_id: &str) -> Result<SearchSnapshot> {
        let mut snapshot = SearchSnapshot::default();
        let mut seen: HashSet<String> = HashSet::new();

        for city in &self.plan.cities {
            let target = city.target();
            for term in &self.plan.search_terms {
                let outcome = self.source.search(&target, term).await;
                if outcome.failed_pages > 0 {
                    snapshot.failed_queries.push(QueryFailure {
                        city: city.city.clone(),
                        state_code: city.state_code.clone(),
                        term: term.clone(),
                        pages_fetched: outcome.pages_fetched,
                        failed_pages: outcome.failed_pages,
                        reason: outcome.last_error.clone(),
                    });
                }
                for candidate in outcome.candidates {
                    if seen.insert(candidate.place_id.clone()) {
                        snapshot.candidates.push(candidate);
                    } else {
                        snapshot.duplicate_hits += 1;
                    }
                }
            }
            info!(
                city = city.city.as_str(),
                collected = snapshot.candidates.len(),
                "city searched"
            );
        }

        if !snapshot.failed_queries.is_empty() {
            warn!(
                failed = snapshot.failed_queries.len(),
                "some search queries lost pages; continuing with what was collected"
            );
        }

        self.store
            .write_snapshot(run_id, Phase::Search.snapshot_name(), &snapshot)
            .await?;
        self.store
            .mark_complete(run_id, Phase::Search.snapshot_name())
            .await?;
        Ok(snapshot)
    }

    async fn run_enrich(&self, run_id: &str, search: &SearchSnapshot) -> Result<EnrichSnapshot> {
        let mut snapshot = EnrichSnapshot::default();
        for (index, candidate) in search.candidates.iter().enumerate() {
            info!(
                firm = candidate.firm_name.as_str(),
                item = index + 1,
                total = search.candidates.len(),
                "enriching"
            );
            snapshot.records.push(self.enricher.enrich(candidate).await);
        }

        self.store
            .write_snapshot(run_id, Phase::Enrich.snapshot_name(), &snapshot)
            .await?;
        self.store
            .mark_complete(run_id, Phase::Enrich.snapshot_name())
            .await?;
        Ok(snapshot)
    }

    async fn run_synthesize(
        &self,
        run_id: &str,
        search: &SearchSnapshot,
        enriched: &EnrichSnapshot,
    ) -> Result<FinalSnapshot> {
        let by_place: HashMap<&str, &EnrichmentRecord> = enriched
            .records
            .iter()
            .map(|record| (record.place_id.as_str(), record))
            .collect();

        let mut snapshot = FinalSnapshot::default();
        let mut slugs = SlugAssigner::default();

        for candidate in &search.candidates {
            let enrichment = by_place
                .get(candidate.place_id.as_str())
                .map(|record| (*record).clone())
                .unwrap_or_else(|| {
                    EnrichmentRecord::empty(&candidate.place_id, EnrichmentOutcome::Unreachable)
                });
            let synthesis = synthesize(candidate, &enrichment);
            let slug = slugs.assign(&base_slug(candidate));
            let mut record = merge_record(candidate.clone(), enrichment, synthesis, slug);
            let related = RelatedState {
                review_count: candidate.review_count.unwrap_or(0),
                case_study_count: 0,
                verified: false,
            };
            record.profile_completeness_score = completeness_score(&record, &related);
            snapshot.records.push(record);
        }

        snapshot.possible_duplicates = self.duplicates.scan(&search.candidates);
        if !snapshot.possible_duplicates.is_empty() {
            info!(
                flagged = snapshot.possible_duplicates.len(),
                "possible cross-identifier duplicates flagged for review"
            );
        }

        self.store
            .write_snapshot(run_id, Phase::Synthesize.snapshot_name(), &snapshot)
            .await?;
        self.store
            .mark_complete(run_id, Phase::Synthesize.snapshot_name())
            .await?;
        Ok(snapshot)
    }

    async fn run_import(
        &self,
        run_id: &str,
        synthesized: &FinalSnapshot,
    ) -> Result<Option<ImportReport>> {
        let Some(sink) = &self.sink else {
            info!("no import sink configured; skipping import phase");
            return Ok(None);
        };
        let report = sink
            .import_all(&synthesized.records)
            .await
            .context("import phase")?;
        self.store
            .write_snapshot(run_id, Phase::Import.snapshot_name(), &report)
            .await?;
        self.store
            .mark_complete(run_id, Phase::Import.snapshot_name())
            .await?;
        Ok(Some(report))
    }
}

#[allow(clippy::too_many_arguments)]
fn build_summary(
    run_id: &str,
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
    resumed: bool,
    search: &SearchSnapshot,
    enriched: &EnrichSnapshot,
    synthesized: &FinalSnapshot,
    import: Option<ImportReport>,
) -> RunSummary {
    let mut by_city = BTreeMap::new();
    let mut completeness_buckets = BTreeMap::new();
    for record in &synthesized.records {
        *by_city.entry(record.candidate.city.clone()).or_insert(0) += 1;
        *completeness_buckets
            .entry(completeness_bucket(record.profile_completeness_score).to_string())
            .or_insert(0) += 1;
    }

    RunSummary {
        run_id: run_id.to_string(),
        started_at,
        finished_at,
        resumed_from_search: resumed,
        candidates: search.candidates.len(),
        duplicate_hits: search.duplicate_hits,
        failed_queries: search.failed_queries.len(),
        websites_missing: enriched
            .records
            .iter()
            .filter(|r| r.outcome == EnrichmentOutcome::NoWebsite)
            .count(),
        websites_unreachable: enriched
            .records
            .iter()
            .filter(|r| r.outcome == EnrichmentOutcome::Unreachable)
            .count(),
        records: synthesized.records.len(),
        by_city,
        completeness_buckets,
        possible_duplicates: synthesized.possible_duplicates.len(),
        import,
    }
}

/// Markdown digest of the latest run summaries, for the CLI `report`
/// command.
pub async fn report_markdown(store: &RunStore, runs: usize) -> Result<String> {
    let run_ids = store.run_ids().await?;
    let mut lines = vec!["# MNLD Collection Report".to_string(), String::new()];

    for run_id in run_ids.into_iter().take(runs.max(1)) {
        lines.push(format!("## Run `{run_id}`"));
        match store
            .read_snapshot::<RunSummary>(&run_id, SUMMARY_SNAPSHOT)
            .await
        {
            Ok(summary) => {
                lines.push(format!("- candidates: {}", summary.candidates));
                lines.push(format!("- records synthesized: {}", summary.records));
                lines.push(format!(
                    "- duplicate hits dropped: {}",
                    summary.duplicate_hits
                ));
                lines.push(format!("- failed queries: {}", summary.failed_queries));
                lines.push(format!(
                    "- websites missing/unreachable: {}/{}",
                    summary.websites_missing, summary.websites_unreachable
                ));
                if let Some(import) = &summary.import {
                    lines.push(format!(
                        "- import: {} inserted, {} updated, {} skipped, {} failed",
                        import.inserted, import.updated, import.skipped, import.failed
                    ));
                }
                for (city, count) in &summary.by_city {
                    lines.push(format!("  - {city}: {count}"));
                }
            }
            Err(_) => {
                lines.push("- no summary (incomplete run)".to_string());
            }
        }
        lines.push(String::new());
    }

    Ok(lines.join("\n"))
}
