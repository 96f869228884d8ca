//! Canonical domain model for the MNLD collection pipeline.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "mnld-core";

/// Operating status reported by the places source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BusinessStatus {
    Operating,
    Closed,
    #[default]
    Unknown,
}

impl BusinessStatus {
    pub fn from_api(raw: &str) -> Self {
        match raw {
            "OPERATIONAL" => BusinessStatus::Operating,
            "CLOSED_TEMPORARILY" | "CLOSED_PERMANENTLY" => BusinessStatus::Closed,
            _ => BusinessStatus::Unknown,
        }
    }
}

/// Address components split out of the source's single formatted string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct AddressParts {
    pub street: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub postcode: Option<String>,
    pub country: Option<String>,
}

/// Weekday -> opening-hours text, e.g. "monday" -> "9:00 AM - 5:00 PM".
pub type BusinessHours = BTreeMap<String, String>;

/// One search hit from the places source. Immutable once collected;
/// `place_id` is the stable dedup key for the lifetime of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateRecord {
    pub place_id: String,
    pub firm_name: String,
    pub formatted_address: Option<String>,
    pub address_parts: AddressParts,
    /// City the search query targeted, not necessarily the address city.
    pub city: String,
    pub state_code: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub phone: Option<String>,
    pub website: Option<String>,
    pub rating: Option<f64>,
    pub review_count: Option<u32>,
    pub business_hours: Option<BusinessHours>,
    pub business_status: BusinessStatus,
    pub maps_url: Option<String>,
    pub collected_at: DateTime<Utc>,
}

/// Client-service signals extracted from a firm's website.
/// Absence of evidence stays `false`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct FeatureFlags {
    pub no_win_no_fee: bool,
    pub free_consultation: bool,
    pub home_visits: bool,
    pub telehealth: bool,
    pub legal_aid: bool,
}

impl FeatureFlags {
    pub fn any(&self) -> bool {
        self.no_win_no_fee
            || self.free_consultation
            || self.home_visits
            || self.telehealth
            || self.legal_aid
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeamMember {
    pub full_name: String,
    pub role: Option<String>,
    pub bio: Option<String>,
    pub photo_url: Option<String>,
}

/// How the enrichment pass ended for a candidate. `NoWebsite` and
/// `Unreachable` are ordinary outcomes, not errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnrichmentOutcome {
    Fetched,
    NoWebsite,
    Unreachable,
}

/// Signals scraped from a candidate's website. One-to-one with a
/// `CandidateRecord` via `place_id`; every field may be absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichmentRecord {
    pub place_id: String,
    pub outcome: EnrichmentOutcome,
    pub description: Option<String>,
    pub short_description: Option<String>,
    pub specializations: Vec<String>,
    pub team_members: Vec<TeamMember>,
    pub years_experience: Option<u32>,
    pub founded_year: Option<i32>,
    pub languages: Vec<String>,
    pub awards: Vec<String>,
    pub accreditations: Vec<String>,
    pub features: FeatureFlags,
    pub contact_email: Option<String>,
    pub meta_title: Option<String>,
    pub meta_description: Option<String>,
}

impl EnrichmentRecord {
    pub fn empty(place_id: impl Into<String>, outcome: EnrichmentOutcome) -> Self {
        Self {
            place_id: place_id.into(),
            outcome,
            description: None,
            short_description: None,
            specializations: Vec::new(),
            team_members: Vec::new(),
            years_experience: None,
            founded_year: None,
            languages: Vec::new(),
            awards: Vec::new(),
            accreditations: Vec::new(),
            features: FeatureFlags::default(),
            contact_email: None,
            meta_title: None,
            meta_description: None,
        }
    }
}

/// Text generated by the synthesizer. Always fully populated, even for a
/// candidate whose enrichment came back empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Synthesis {
    pub description: String,
    pub short_description: String,
    pub meta_title: String,
    pub meta_description: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceArea {
    pub state: Option<String>,
    pub state_code: String,
    pub city: String,
    pub postcode: Option<String>,
    pub is_primary: bool,
}

/// The unit persisted by the import writer: candidate + enrichment +
/// synthesized text, with a run-unique slug and completeness score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergedRecord {
    pub candidate: CandidateRecord,
    pub enrichment: EnrichmentRecord,
    pub synthesis: Synthesis,
    pub slug: String,
    pub contact_email: Option<String>,
    pub profile_image_url: Option<String>,
    pub service_areas: Vec<ServiceArea>,
    pub profile_completeness_score: u8,
}

/// Lowercase, collapse runs of non-alphanumerics to single dashes.
pub fn slugify(input: &str) -> String {
    input
        .trim()
        .to_ascii_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slugify_collapses_punctuation_and_case() {
        assert_eq!(slugify("Acme Lawyers Pty. Ltd."), "acme-lawyers-pty-ltd");
        assert_eq!(slugify("  O'Brien & Partners  "), "o-brien-partners");
        assert_eq!(slugify("---"), "");
    }

    #[test]
    fn business_status_maps_api_values() {
        assert_eq!(BusinessStatus::from_api("OPERATIONAL"), BusinessStatus::Operating);
        assert_eq!(BusinessStatus::from_api("CLOSED_PERMANENTLY"), BusinessStatus::Closed);
        assert_eq!(BusinessStatus::from_api("CLOSED_TEMPORARILY"), BusinessStatus::Closed);
        assert_eq!(BusinessStatus::from_api(""), BusinessStatus::Unknown);
    }

    #[test]
    fn feature_flags_default_to_absent() {
        let flags = FeatureFlags::default();
        assert!(!flags.any());
        let flags = FeatureFlags {
            legal_aid: true,
            ..FeatureFlags::default()
        };
        assert!(flags.any());
    }
}
