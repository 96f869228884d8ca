//! External sources: places text-search + firm-website enrichment.

use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mnld_core::{
    AddressParts, BusinessHours, BusinessStatus, CandidateRecord, EnrichmentOutcome,
    EnrichmentRecord, FeatureFlags, TeamMember,
};
use mnld_storage::PacedClient;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::{debug, info, warn};

pub const CRATE_NAME: &str = "mnld-sources";

pub const PLACES_SEARCH_URL: &str = "https://places.googleapis.com/v1/places:searchText";

/// Pagination ceiling per (city, term) query, guarding against a runaway
/// continuation token.
pub const MAX_PAGES_PER_QUERY: usize = 5;

/// Likely-informative sub-pages fetched per website beyond the homepage.
pub const MAX_SUBPAGES: usize = 3;

const PLACES_FIELD_MASK: &str = "places.id,places.displayName,places.formattedAddress,\
places.nationalPhoneNumber,places.internationalPhoneNumber,places.websiteUri,places.rating,\
places.userRatingCount,places.regularOpeningHours,places.location,places.businessStatus,\
places.googleMapsUri,nextPageToken";

const SPECIALIZATION_KEYWORDS: &[&str] = &[
    "medical negligence",
    "medical malpractice",
    "clinical negligence",
    "surgical error",
    "misdiagnosis",
    "birth injury",
    "medication error",
    "hospital negligence",
    "anaesthesia error",
    "emergency room error",
    "nursing home abuse",
    "dental negligence",
    "obstetric negligence",
];

const ACCREDITATION_KEYWORDS: &[&str] = &[
    "accredited specialist",
    "law society",
    "lawyers alliance",
    "plaintiff lawyers",
    "admitted to practice",
];

const SUBPAGE_HINTS: &[&str] = &[
    "about",
    "our-firm",
    "our-team",
    "who-we-are",
    "team",
    "people",
    "contact",
];

/// One city/term search context, with optional geographic bias.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchTarget {
    pub city: String,
    pub state_code: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub radius_m: Option<f64>,
}

/// Result of paginating one (city, term) query. Failed pages never poison
/// the candidates already collected.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchOutcome {
    pub candidates: Vec<CandidateRecord>,
    pub pages_fetched: usize,
    pub failed_pages: usize,
    pub last_error: Option<String>,
}

#[async_trait]
pub trait CandidateSource: Send + Sync {
    async fn search(&self, target: &SearchTarget, term: &str) -> SearchOutcome;
}

#[async_trait]
pub trait Enricher: Send + Sync {
    async fn enrich(&self, candidate: &CandidateRecord) -> EnrichmentRecord;
}

/// Places text-search client. Follows the continuation token up to
/// `MAX_PAGES_PER_QUERY`, normalizing each hit into a `CandidateRecord`.
pub struct PlacesSearchSource {
    http: Arc<PacedClient>,
    api_key: String,
    max_pages: usize,
}

impl PlacesSearchSource {
    pub fn new(http: Arc<PacedClient>, api_key: impl Into<String>) -> Self {
        Self {
            http,
            api_key: api_key.into(),
            max_pages: MAX_PAGES_PER_QUERY,
        }
    }

    fn request_body(&self, target: &SearchTarget, term: &str, page_token: Option<&str>) -> JsonValue {
        let mut body = serde_json::json!({
            "textQuery": format!("{} {} {}", term, target.city, target.state_code),
            "pageSize": 20,
            "languageCode": "en",
        });
        if let (Some(lat), Some(lng)) = (target.latitude, target.longitude) {
            body["locationBias"] = serde_json::json!({
                "circle": {
                    "center": { "latitude": lat, "longitude": lng },
                    "radius": target.radius_m.unwrap_or(50_000.0),
                }
            });
        }
        if let Some(token) = page_token {
            body["pageToken"] = JsonValue::String(token.to_string());
        }
        body
    }
}

#[async_trait]
impl CandidateSource for PlacesSearchSource {
    async fn search(&self, target: &SearchTarget, term: &str) -> SearchOutcome {
        let mut outcome = SearchOutcome::default();
        let mut page_token: Option<String> = None;
        let collected_at = Utc::now();
        let headers = [
            ("X-Goog-Api-Key", self.api_key.as_str()),
            ("X-Goog-FieldMask", PLACES_FIELD_MASK),
        ];

        for _ in 0..self.max_pages {
            let body = self.request_body(target, term, page_token.as_deref());
            let resp = match self.http.post_json(PLACES_SEARCH_URL, &headers, &body).await {
                Ok(resp) => resp,
                Err(err) => {
                    warn!(
                        city = target.city.as_str(),
                        term,
                        error = %err,
                        "search page failed, keeping pages already collected"
                    );
                    outcome.failed_pages += 1;
                    outcome.last_error = Some(err.to_string());
                    break;
                }
            };

            let page: JsonValue = match serde_json::from_slice(&resp.body) {
                Ok(page) => page,
                Err(err) => {
                    warn!(city = target.city.as_str(), term, error = %err, "unparseable search page");
                    outcome.failed_pages += 1;
                    outcome.last_error = Some(format!("unparseable page: {err}"));
                    break;
                }
            };

            outcome.pages_fetched += 1;
            if let Some(places) = page.get("places").and_then(|v| v.as_array()) {
                for place in places {
                    match normalize_place(place, &target.city, &target.state_code, collected_at) {
                        Some(candidate) => outcome.candidates.push(candidate),
                        None => debug!(city = target.city.as_str(), term, "skipping malformed place"),
                    }
                }
            }

            page_token = page
                .get("nextPageToken")
                .and_then(|v| v.as_str())
                .filter(|t| !t.is_empty())
                .map(ToString::to_string);
            if page_token.is_none() {
                break;
            }
        }

        outcome
    }
}

/// Map one raw place object to a candidate. Requires a stable id and a
/// display name; every other field degrades to explicit absence.
pub fn normalize_place(
    place: &JsonValue,
    city: &str,
    state_code: &str,
    collected_at: DateTime<Utc>,
) -> Option<CandidateRecord> {
    let place_id = place.get("id").and_then(|v| v.as_str())?.to_string();
    let firm_name = place
        .get("displayName")
        .and_then(|d| d.get("text"))
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())?
        .to_string();

    let formatted_address = place
        .get("formattedAddress")
        .and_then(|v| v.as_str())
        .map(ToString::to_string);
    let address_parts = formatted_address
        .as_deref()
        .map(parse_address)
        .unwrap_or_default();

    let phone = place
        .get("internationalPhoneNumber")
        .or_else(|| place.get("nationalPhoneNumber"))
        .and_then(|v| v.as_str())
        .and_then(clean_phone);

    let business_hours = place
        .get("regularOpeningHours")
        .and_then(|h| h.get("weekdayDescriptions"))
        .and_then(|v| v.as_array())
        .and_then(|descs| {
            let lines: Vec<&str> = descs.iter().filter_map(|d| d.as_str()).collect();
            parse_business_hours(&lines)
        });

    Some(CandidateRecord {
        place_id,
        firm_name,
        formatted_address,
        address_parts,
        city: city.to_string(),
        state_code: state_code.to_string(),
        latitude: place
            .get("location")
            .and_then(|l| l.get("latitude"))
            .and_then(|v| v.as_f64()),
        longitude: place
            .get("location")
            .and_then(|l| l.get("longitude"))
            .and_then(|v| v.as_f64()),
        phone,
        website: place
            .get("websiteUri")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .map(ToString::to_string),
        rating: place.get("rating").and_then(|v| v.as_f64()),
        review_count: place
            .get("userRatingCount")
            .and_then(|v| v.as_u64())
            .map(|n| n as u32),
        business_hours,
        business_status: place
            .get("businessStatus")
            .and_then(|v| v.as_str())
            .map(BusinessStatus::from_api)
            .unwrap_or_default(),
        maps_url: place
            .get("googleMapsUri")
            .and_then(|v| v.as_str())
            .map(ToString::to_string),
        collected_at,
    })
}

/// Split "street..., city, STATE 2000, Australia" into components.
pub fn parse_address(formatted: &str) -> AddressParts {
    let parts: Vec<&str> = formatted.split(',').map(str::trim).collect();
    let mut out = AddressParts::default();
    if parts.len() < 2 {
        return out;
    }

    out.country = Some(parts[parts.len() - 1].to_string()).filter(|s| !s.is_empty());

    let state_postcode: Vec<&str> = parts[parts.len() - 2].split_whitespace().collect();
    if state_postcode.len() >= 2 {
        out.state = Some(state_postcode[0].to_string());
        out.postcode = Some(state_postcode[1].to_string());
    }

    if parts.len() >= 3 {
        out.city = Some(parts[parts.len() - 3].to_string()).filter(|s| !s.is_empty());
    }
    if parts.len() >= 4 {
        out.street = Some(parts[..parts.len() - 3].join(", ")).filter(|s| !s.is_empty());
    }
    out
}

/// Normalize a phone number to +61 form.
pub fn clean_phone(raw: &str) -> Option<String> {
    let cleaned: String = raw
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '+')
        .collect();
    if cleaned.is_empty() || cleaned == "+" {
        return None;
    }
    if let Some(rest) = cleaned.strip_prefix('0') {
        Some(format!("+61{rest}"))
    } else if !cleaned.starts_with('+') {
        Some(format!("+61{cleaned}"))
    } else {
        Some(cleaned)
    }
}

const WEEKDAYS: &[&str] = &[
    "monday",
    "tuesday",
    "wednesday",
    "thursday",
    "friday",
    "saturday",
    "sunday",
];

/// "Monday: 9:00 AM – 5:00 PM" lines into a weekday map.
pub fn parse_business_hours(lines: &[&str]) -> Option<BusinessHours> {
    let mut hours = BusinessHours::new();
    for line in lines {
        let lower = line.to_lowercase();
        for day in WEEKDAYS {
            if lower.starts_with(day) {
                let value = line
                    .split_once(':')
                    .map(|(_, rest)| rest.trim())
                    .filter(|v| !v.is_empty())
                    .unwrap_or("closed");
                hours.insert((*day).to_string(), value.to_string());
            }
        }
    }
    if hours.is_empty() {
        None
    } else {
        Some(hours)
    }
}

struct ExtractionRules {
    no_win_no_fee: Regex,
    free_consultation: Regex,
    home_visits: Regex,
    telehealth: Regex,
    legal_aid: Regex,
    years_experience: Regex,
    founded: Regex,
    email: Regex,
    languages: Regex,
    team_class: Regex,
    member_class: Regex,
    role_class: Regex,
    award_class: Regex,
    about_class: Regex,
    hero_class: Regex,
}

impl ExtractionRules {
    fn new() -> anyhow::Result<Self> {
        Ok(Self {
            no_win_no_fee: Regex::new(r"(?i)no\s*win,?\s*no\s*fee")?,
            free_consultation: Regex::new(r"(?i)(?:free|complimentary)\s*(?:initial\s*)?consultation")?,
            home_visits: Regex::new(r"(?i)home\s*(?:and\s*hospital\s*)?visits?|visit\s*you\s*at\s*home")?,
            telehealth: Regex::new(r"(?i)telehealth|video\s*consultation|zoom\s*meeting")?,
            legal_aid: Regex::new(r"(?i)legal\s*aid")?,
            years_experience: Regex::new(r"(?i)(\d+)\s*\+?\s*years?(?:\s+of)?\s+experience")?,
            founded: Regex::new(r"(?i)\b(?:since|established|founded)\s*(?:in\s*)?(\d{4})\b")?,
            email: Regex::new(r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}")?,
            languages: Regex::new(
                r"(?i)\b(mandarin|cantonese|arabic|vietnamese|greek|italian|spanish|hindi|punjabi|korean)\b",
            )?,
            team_class: Regex::new(r"(?i)team|staff|lawyer|attorney|partner")?,
            member_class: Regex::new(r"(?i)member|profile|bio|card")?,
            role_class: Regex::new(r"(?i)title|role|position")?,
            award_class: Regex::new(r"(?i)award|recognition|achievement")?,
            about_class: Regex::new(r"(?i)about|intro|overview")?,
            hero_class: Regex::new(r"(?i)hero|tagline|intro|lead")?,
        })
    }
}

/// Scrapes a candidate's website (homepage + a few likely sub-pages) into
/// an `EnrichmentRecord`. A candidate without a website, or whose site
/// cannot be fetched or is not HTML, yields an empty record — enrichment
/// never fails a batch.
pub struct WebsiteEnricher {
    http: Arc<PacedClient>,
    rules: ExtractionRules,
    reference_year: i32,
}

impl WebsiteEnricher {
    pub fn new(http: Arc<PacedClient>, reference_year: i32) -> anyhow::Result<Self> {
        Ok(Self {
            http,
            rules: ExtractionRules::new().context("compiling extraction rules")?,
            reference_year,
        })
    }
}

#[async_trait]
impl Enricher for WebsiteEnricher {
    async fn enrich(&self, candidate: &CandidateRecord) -> EnrichmentRecord {
        let Some(website) = candidate.website.as_deref().filter(|w| !w.is_empty()) else {
            return EnrichmentRecord::empty(&candidate.place_id, EnrichmentOutcome::NoWebsite);
        };

        let home = match self.http.get(website).await {
            Ok(resp) if resp.is_html() => resp,
            Ok(resp) => {
                info!(
                    firm = candidate.firm_name.as_str(),
                    content_type = resp.content_type.as_deref().unwrap_or("unknown"),
                    "website is not html"
                );
                return EnrichmentRecord::empty(&candidate.place_id, EnrichmentOutcome::Unreachable);
            }
            Err(err) => {
                warn!(firm = candidate.firm_name.as_str(), error = %err, "website unreachable");
                return EnrichmentRecord::empty(&candidate.place_id, EnrichmentOutcome::Unreachable);
            }
        };

        let base_url = home.final_url.clone();
        let mut pages = vec![(base_url.clone(), home.text())];

        // Sub-page failures are silently skipped; the homepage alone is
        // enough to produce a usable record.
        for link in subpage_links(&pages[0].1, &base_url) {
            match self.http.get(&link).await {
                Ok(resp) if resp.is_html() => pages.push((resp.final_url.clone(), resp.text())),
                Ok(_) => {}
                Err(err) => debug!(url = link.as_str(), error = %err, "sub-page fetch failed"),
            }
        }

        extract_from_pages(&candidate.place_id, &pages, self.reference_year, &self.rules)
    }
}

/// Links on the homepage that look like about/team/contact pages, resolved
/// against the final homepage URL and bounded to the same host.
fn subpage_links(homepage_html: &str, base_url: &str) -> Vec<String> {
    let document = Html::parse_document(homepage_html);
    let Ok(anchor) = Selector::parse("a[href]") else {
        return Vec::new();
    };
    let base_host = host_of(base_url);

    let mut links = Vec::new();
    for element in document.select(&anchor) {
        let Some(href) = element.value().attr("href") else {
            continue;
        };
        let lower = href.to_ascii_lowercase();
        if !SUBPAGE_HINTS.iter().any(|hint| lower.contains(hint)) {
            continue;
        }
        let Some(resolved) = resolve_href(base_url, href) else {
            continue;
        };
        if host_of(&resolved) != base_host {
            continue;
        }
        if resolved != base_url && !links.contains(&resolved) {
            links.push(resolved);
        }
        if links.len() >= MAX_SUBPAGES {
            break;
        }
    }
    links
}

fn host_of(url: &str) -> Option<String> {
    let rest = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))?;
    let host = rest.split(['/', '?', '#']).next()?;
    let host = host.split('@').next_back()?;
    let host = host.split(':').next()?;
    if host.is_empty() {
        None
    } else {
        Some(host.to_ascii_lowercase())
    }
}

fn origin_of(url: &str) -> Option<String> {
    let scheme_end = url.find("://")?;
    let host = host_of(url)?;
    Some(format!("{}://{}", &url[..scheme_end], host))
}

/// Resolve an href against a base URL. Fragments, mailto/tel links and
/// unsupported schemes resolve to nothing.
fn resolve_href(base_url: &str, href: &str) -> Option<String> {
    let href = href.trim();
    if href.is_empty()
        || href.starts_with('#')
        || href.starts_with("mailto:")
        || href.starts_with("tel:")
        || href.starts_with("javascript:")
    {
        return None;
    }
    if href.starts_with("http://") || href.starts_with("https://") {
        return Some(href.to_string());
    }
    if let Some(rest) = href.strip_prefix("//") {
        let scheme = base_url.split("://").next()?;
        return Some(format!("{scheme}://{rest}"));
    }
    let origin = origin_of(base_url)?;
    if href.starts_with('/') {
        return Some(format!("{origin}{href}"));
    }
    // Relative path: resolve against the base URL's directory.
    let path_start = origin.len();
    let base_path = &base_url[path_start..];
    let dir = match base_path.rfind('/') {
        Some(idx) => &base_path[..=idx],
        None => "/",
    };
    Some(format!("{origin}{dir}{href}"))
}

fn extract_from_pages(
    place_id: &str,
    pages: &[(String, String)],
    reference_year: i32,
    rules: &ExtractionRules,
) -> EnrichmentRecord {
    let mut record = EnrichmentRecord::empty(place_id, EnrichmentOutcome::Fetched);
    let documents: Vec<(&str, Html)> = pages
        .iter()
        .map(|(url, html)| (url.as_str(), Html::parse_document(html)))
        .collect();
    let texts: Vec<String> = documents
        .iter()
        .map(|(_, doc)| doc.root_element().text().collect::<Vec<_>>().join(" "))
        .collect();
    let combined = texts.join(" ");

    record.features = FeatureFlags {
        no_win_no_fee: rules.no_win_no_fee.is_match(&combined),
        free_consultation: rules.free_consultation.is_match(&combined),
        home_visits: rules.home_visits.is_match(&combined),
        telehealth: rules.telehealth.is_match(&combined),
        legal_aid: rules.legal_aid.is_match(&combined),
    };

    record.founded_year = rules
        .founded
        .captures(&combined)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse::<i32>().ok())
        .filter(|year| (1950..=reference_year).contains(year));

    record.years_experience = rules
        .years_experience
        .captures(&combined)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse::<u32>().ok())
        .filter(|years| *years <= 100)
        .or_else(|| {
            record
                .founded_year
                .map(|year| (reference_year - year) as u32)
        });

    let lower = combined.to_lowercase();
    record.specializations = SPECIALIZATION_KEYWORDS
        .iter()
        .filter(|keyword| lower.contains(*keyword))
        .map(|keyword| title_case(keyword))
        .collect();

    let mut languages: Vec<String> = Vec::new();
    for capture in rules.languages.captures_iter(&combined) {
        if let Some(m) = capture.get(1) {
            let lang = title_case(m.as_str());
            if !languages.contains(&lang) {
                languages.push(lang);
            }
        }
    }
    record.languages = languages;

    record.contact_email = rules
        .email
        .find_iter(&combined)
        .map(|m| m.as_str().to_string())
        .find(|email| {
            let lower = email.to_lowercase();
            !["example", "test", "noreply", "no-reply"]
                .iter()
                .any(|needle| lower.contains(needle))
        });

    record.accreditations = extract_accreditations(&combined);

    if let Some((_, homepage)) = documents.first() {
        record.meta_title = select_first_text(homepage, "title")
            .or_else(|| select_meta_content(homepage, "meta[property=\"og:title\"]"));
        record.meta_description = select_meta_content(homepage, "meta[name=\"description\"]")
            .or_else(|| select_meta_content(homepage, "meta[property=\"og:description\"]"));
        record.short_description = record
            .meta_description
            .clone()
            .filter(|d| d.len() >= 50)
            .or_else(|| extract_tagline(homepage, rules));
    }

    record.description = extract_description(&documents, rules);

    for (url, doc) in &documents {
        for member in extract_team_members(doc, url, rules) {
            if record.team_members.len() >= 10 {
                break;
            }
            if !record
                .team_members
                .iter()
                .any(|existing| existing.full_name == member.full_name)
            {
                record.team_members.push(member);
            }
        }
        for award in extract_awards(doc, rules) {
            if record.awards.len() >= 10 {
                break;
            }
            if !record.awards.contains(&award) {
                record.awards.push(award);
            }
        }
    }

    record
}

fn title_case(input: &str) -> String {
    input
        .split_whitespace()
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn extract_accreditations(text: &str) -> Vec<String> {
    let lower = text.to_lowercase();
    let mut out = Vec::new();
    for sentence in lower.split('.') {
        let sentence = sentence.trim();
        if sentence.len() < 20 || sentence.len() > 200 {
            continue;
        }
        if ACCREDITATION_KEYWORDS
            .iter()
            .any(|keyword| sentence.contains(keyword))
        {
            let mut chars = sentence.chars();
            let capitalized = match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                None => continue,
            };
            if !out.contains(&capitalized) {
                out.push(capitalized);
            }
        }
        if out.len() >= 5 {
            break;
        }
    }
    out
}

fn select_first_text(document: &Html, selector: &str) -> Option<String> {
    let sel = Selector::parse(selector).ok()?;
    document
        .select(&sel)
        .next()
        .and_then(|n| text_or_none(n.text().collect::<String>()))
}

fn select_meta_content(document: &Html, selector: &str) -> Option<String> {
    let sel = Selector::parse(selector).ok()?;
    document
        .select(&sel)
        .next()
        .and_then(|n| n.value().attr("content"))
        .and_then(|s| text_or_none(s.to_string()))
}

fn text_or_none(value: String) -> Option<String> {
    let trimmed = clean_text(&value);
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

fn clean_text(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn class_matches(element: &ElementRef<'_>, pattern: &Regex) -> bool {
    let value = element.value();
    value
        .attr("class")
        .map(|c| pattern.is_match(c))
        .unwrap_or(false)
        || value.attr("id").map(|i| pattern.is_match(i)).unwrap_or(false)
}

/// About/intro blocks across all pages, joined and capped at 1000 chars.
fn extract_description(documents: &[(&str, Html)], rules: &ExtractionRules) -> Option<String> {
    let mut parts: Vec<String> = Vec::new();

    for (_, document) in documents {
        let Ok(blocks) = Selector::parse("div, section, article, main") else {
            continue;
        };
        for element in document.select(&blocks) {
            let name = element.value().name();
            let is_about = matches!(name, "article" | "main") || class_matches(&element, &rules.about_class);
            if !is_about {
                continue;
            }
            let text = clean_text(&element.text().collect::<Vec<_>>().join(" "));
            if text.len() > 100 && text.len() < 2000 && !parts.contains(&text) {
                parts.push(text);
            }
            if parts.len() >= 3 {
                break;
            }
        }
        if parts.len() >= 3 {
            break;
        }
    }

    if parts.is_empty() {
        return None;
    }
    Some(cap_at_word(&parts.join(" "), 1000))
}

/// Cut `text` to at most `max` chars, never mid-word, appending an
/// ellipsis when anything was dropped.
fn cap_at_word(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let prefix: String = text.chars().take(max).collect();
    let cut = prefix.rfind(' ').unwrap_or(prefix.len());
    format!("{}...", prefix[..cut].trim_end())
}

fn extract_tagline(document: &Html, rules: &ExtractionRules) -> Option<String> {
    let headings = Selector::parse("h1, h2").ok()?;
    for element in document.select(&headings) {
        if !class_matches(&element, &rules.hero_class) {
            continue;
        }
        if let Some(text) = text_or_none(element.text().collect::<String>()) {
            if (50..=200).contains(&text.len()) {
                return Some(text);
            }
        }
    }
    let paragraphs = Selector::parse("p").ok()?;
    document
        .select(&paragraphs)
        .take(5)
        .filter_map(|p| text_or_none(p.text().collect::<String>()))
        .find(|text| (50..=300).contains(&text.len()))
}

const NAME_STOPWORDS: &[&str] = &[
    "contact", "call", "today", "enquire", "click", "read", "learn", "more", "team", "our",
];

fn looks_like_person_name(name: &str) -> bool {
    let words = name.split_whitespace().count();
    if !(2..=5).contains(&words) || name.len() > 60 {
        return false;
    }
    if name
        .split_whitespace()
        .any(|word| NAME_STOPWORDS.contains(&word.to_lowercase().as_str()))
    {
        return false;
    }
    name.chars()
        .all(|c| c.is_alphabetic() || c.is_whitespace() || c == '\'' || c == '-' || c == '.')
}

/// Heuristic team block detection: team-like sections containing member
/// cards with a heading for the name.
fn extract_team_members(document: &Html, base_url: &str, rules: &ExtractionRules) -> Vec<TeamMember> {
    let mut members = Vec::new();
    let Ok(sections) = Selector::parse("div, section") else {
        return members;
    };
    let Ok(cards) = Selector::parse("div, article") else {
        return members;
    };
    let Ok(headings) = Selector::parse("h2, h3, h4, h5") else {
        return members;
    };
    let Ok(labels) = Selector::parse("[class]") else {
        return members;
    };
    let Ok(paragraphs) = Selector::parse("p") else {
        return members;
    };
    let Ok(images) = Selector::parse("img[src]") else {
        return members;
    };

    for section in document.select(&sections) {
        if !class_matches(&section, &rules.team_class) {
            continue;
        }
        for card in section.select(&cards) {
            if !class_matches(&card, &rules.member_class) {
                continue;
            }
            let Some(full_name) = card
                .select(&headings)
                .next()
                .and_then(|h| text_or_none(h.text().collect::<String>()))
                .filter(|name| looks_like_person_name(name))
            else {
                continue;
            };

            let role = card
                .select(&labels)
                .find(|el| class_matches(el, &rules.role_class))
                .and_then(|el| text_or_none(el.text().collect::<String>()))
                .filter(|r| r.len() <= 80);
            let bio = card
                .select(&paragraphs)
                .next()
                .and_then(|p| text_or_none(p.text().collect::<String>()))
                .map(|b| cap_at_word(&b, 500));
            let photo_url = card
                .select(&images)
                .next()
                .and_then(|img| img.value().attr("src"))
                .and_then(|src| resolve_href(base_url, src));

            if members
                .iter()
                .any(|m: &TeamMember| m.full_name == full_name)
            {
                continue;
            }
            members.push(TeamMember {
                full_name,
                role,
                bio,
                photo_url,
            });
            if members.len() >= 10 {
                return members;
            }
        }
    }
    members
}

fn extract_awards(document: &Html, rules: &ExtractionRules) -> Vec<String> {
    let mut awards = Vec::new();
    let Ok(sections) = Selector::parse("div, section, ul") else {
        return awards;
    };
    let Ok(items) = Selector::parse("li, p, h3, h4") else {
        return awards;
    };

    for section in document.select(&sections) {
        if !class_matches(&section, &rules.award_class) {
            continue;
        }
        for item in section.select(&items) {
            if let Some(text) = text_or_none(item.text().collect::<String>()) {
                if text.len() > 10 && text.len() < 200 && !awards.contains(&text) {
                    awards.push(text);
                }
            }
            if awards.len() >= 10 {
                return awards;
            }
        }
    }
    awards
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn collected_at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).single().unwrap()
    }

    fn rules() -> ExtractionRules {
        ExtractionRules::new().expect("rules compile")
    }

    #[test]
    fn normalize_place_maps_a_full_result() {
        let place = serde_json::json!({
            "id": "ChIJabc123",
            "displayName": { "text": "Acme Lawyers" },
            "formattedAddress": "Level 3, 10 Example St, Sydney, NSW 2000, Australia",
            "internationalPhoneNumber": "+61 2 9999 0000",
            "websiteUri": "https://acme.example",
            "rating": 4.6,
            "userRatingCount": 38,
            "businessStatus": "OPERATIONAL",
            "googleMapsUri": "https://maps.example/acme",
            "location": { "latitude": -33.86, "longitude": 151.21 },
            "regularOpeningHours": {
                "weekdayDescriptions": [
                    "Monday: 9:00 AM – 5:00 PM",
                    "Saturday: Closed"
                ]
            }
        });

        let candidate = normalize_place(&place, "Sydney", "NSW", collected_at()).expect("candidate");
        assert_eq!(candidate.place_id, "ChIJabc123");
        assert_eq!(candidate.firm_name, "Acme Lawyers");
        assert_eq!(candidate.phone.as_deref(), Some("+61299990000"));
        assert_eq!(candidate.rating, Some(4.6));
        assert_eq!(candidate.review_count, Some(38));
        assert_eq!(candidate.business_status, BusinessStatus::Operating);
        assert_eq!(candidate.address_parts.state.as_deref(), Some("NSW"));
        assert_eq!(candidate.address_parts.postcode.as_deref(), Some("2000"));
        assert_eq!(candidate.address_parts.city.as_deref(), Some("Sydney"));
        let hours = candidate.business_hours.expect("hours");
        assert_eq!(hours.get("monday").map(String::as_str), Some("9:00 AM – 5:00 PM"));
    }

    #[test]
    fn normalize_place_tolerates_missing_optionals() {
        let place = serde_json::json!({
            "id": "ChIJminimal",
            "displayName": { "text": "Bare Minimum Legal" }
        });
        let candidate = normalize_place(&place, "Perth", "WA", collected_at()).expect("candidate");
        assert_eq!(candidate.rating, None);
        assert_eq!(candidate.website, None);
        assert_eq!(candidate.phone, None);
        assert_eq!(candidate.business_status, BusinessStatus::Unknown);
        assert_eq!(candidate.business_hours, None);
    }

    #[test]
    fn normalize_place_rejects_missing_identity() {
        let no_id = serde_json::json!({ "displayName": { "text": "No Id" } });
        assert!(normalize_place(&no_id, "Sydney", "NSW", collected_at()).is_none());

        let no_name = serde_json::json!({ "id": "x", "displayName": { "text": "  " } });
        assert!(normalize_place(&no_name, "Sydney", "NSW", collected_at()).is_none());
    }

    #[test]
    fn phone_numbers_normalize_to_e164_australia() {
        assert_eq!(clean_phone("(02) 9999 0000").as_deref(), Some("+61299990000"));
        assert_eq!(clean_phone("+61 2 9999 0000").as_deref(), Some("+61299990000"));
        assert_eq!(clean_phone("2 9999 0000").as_deref(), Some("+61299990000"));
        assert_eq!(clean_phone(""), None);
    }

    #[test]
    fn feature_flags_and_experience_extracted_from_page_text() {
        let html = r#"<html><body>
            <main>We offer no win, no fee representation and a free initial consultation.
            Our firm has been serving clients since 1998 with over 25 years of experience
            in medical negligence and birth injury claims. We speak Greek and Mandarin.
            Contact us at enquiries@acme.example or noreply@acme.example.</main>
        </body></html>"#;
        let pages = vec![("https://acme.example/".to_string(), html.to_string())];
        let record = extract_from_pages("p1", &pages, 2026, &rules());

        assert!(record.features.no_win_no_fee);
        assert!(record.features.free_consultation);
        assert!(!record.features.telehealth);
        assert_eq!(record.years_experience, Some(25));
        assert_eq!(record.founded_year, Some(1998));
        assert_eq!(record.contact_email.as_deref(), Some("enquiries@acme.example"));
        assert!(record
            .specializations
            .contains(&"Medical Negligence".to_string()));
        assert!(record.specializations.contains(&"Birth Injury".to_string()));
        assert_eq!(
            record.languages,
            vec!["Greek".to_string(), "Mandarin".to_string()]
        );
        assert_eq!(record.outcome, EnrichmentOutcome::Fetched);
    }

    #[test]
    fn founded_year_backfills_years_of_experience() {
        let html = "<html><body><main>Proudly established 2006, serving all of NSW with \
                    dedicated medical negligence work for local families and patients.</main></body></html>";
        let pages = vec![("https://x.example/".to_string(), html.to_string())];
        let record = extract_from_pages("p1", &pages, 2026, &rules());
        assert_eq!(record.founded_year, Some(2006));
        assert_eq!(record.years_experience, Some(20));
    }

    #[test]
    fn team_members_detected_from_team_sections() {
        let html = r#"<html><body>
          <section class="our-team">
            <div class="team-member">
              <h3>Jane Citizen</h3>
              <span class="role">Principal Lawyer</span>
              <p>Jane leads the medical negligence practice.</p>
              <img src="/img/jane.jpg">
            </div>
            <div class="team-member">
              <h3>Contact Us Today</h3>
            </div>
            <div class="team-member">
              <h3>Sam O'Brien</h3>
              <p>Sam is a senior associate.</p>
            </div>
          </section>
        </body></html>"#;
        let document = Html::parse_document(html);
        let members = extract_team_members(&document, "https://acme.example/about", &rules());
        assert_eq!(members.len(), 2);
        assert_eq!(members[0].full_name, "Jane Citizen");
        assert_eq!(members[0].role.as_deref(), Some("Principal Lawyer"));
        assert_eq!(
            members[0].photo_url.as_deref(),
            Some("https://acme.example/img/jane.jpg")
        );
        assert_eq!(members[1].full_name, "Sam O'Brien");
    }

    #[test]
    fn subpage_links_stay_on_host_and_are_bounded() {
        let html = r#"<html><body>
          <a href="/about-us">About</a>
          <a href="https://acme.example/our-team">Team</a>
          <a href="https://other.example/about">Elsewhere</a>
          <a href="/contact">Contact</a>
          <a href="/about-us">About again</a>
          <a href="/team/jane">Jane</a>
        </body></html>"#;
        let links = subpage_links(html, "https://acme.example/");
        assert_eq!(
            links,
            vec![
                "https://acme.example/about-us".to_string(),
                "https://acme.example/our-team".to_string(),
                "https://acme.example/contact".to_string(),
            ]
        );
    }

    #[test]
    fn hrefs_resolve_against_base() {
        assert_eq!(
            resolve_href("https://acme.example/a/b", "c.html").as_deref(),
            Some("https://acme.example/a/c.html")
        );
        assert_eq!(
            resolve_href("https://acme.example", "/about").as_deref(),
            Some("https://acme.example/about")
        );
        assert_eq!(resolve_href("https://acme.example", "#top"), None);
        assert_eq!(resolve_href("https://acme.example", "mailto:x@y.z"), None);
        assert_eq!(
            resolve_href("https://acme.example", "//cdn.example/x").as_deref(),
            Some("https://cdn.example/x")
        );
    }

    #[test]
    fn meta_and_tagline_feed_short_description() {
        let html = r#"<html><head>
            <title>Acme Lawyers - Sydney</title>
            <meta name="description" content="Acme Lawyers is a Sydney medical negligence firm offering no win no fee representation.">
          </head><body><p>tiny</p></body></html>"#;
        let pages = vec![("https://acme.example/".to_string(), html.to_string())];
        let record = extract_from_pages("p1", &pages, 2026, &rules());
        assert_eq!(record.meta_title.as_deref(), Some("Acme Lawyers - Sydney"));
        assert!(record
            .short_description
            .as_deref()
            .unwrap()
            .starts_with("Acme Lawyers is a Sydney"));
    }

    #[test]
    fn description_capped_at_word_boundary() {
        let long = "word ".repeat(400);
        let capped = cap_at_word(&long, 1000);
        assert!(capped.len() <= 1004);
        assert!(capped.ends_with("..."));
        assert!(!capped.trim_end_matches("...").ends_with(char::is_whitespace));
        assert_eq!(cap_at_word("short text", 1000), "short text");
    }

    #[test]
    fn search_request_carries_query_bias_and_token() {
        let http = Arc::new(
            PacedClient::new(mnld_storage::PacedClientConfig::default()).expect("client"),
        );
        let source = PlacesSearchSource::new(http, "test-key");
        let target = SearchTarget {
            city: "Sydney".to_string(),
            state_code: "NSW".to_string(),
            latitude: Some(-33.87),
            longitude: Some(151.21),
            radius_m: None,
        };

        let body = source.request_body(&target, "medical negligence lawyer", Some("tok-2"));
        assert_eq!(body["textQuery"], "medical negligence lawyer Sydney NSW");
        assert_eq!(body["pageToken"], "tok-2");
        assert_eq!(body["locationBias"]["circle"]["center"]["latitude"], -33.87);
        assert_eq!(body["locationBias"]["circle"]["radius"], 50_000.0);

        let unbiased = SearchTarget {
            latitude: None,
            longitude: None,
            ..target
        };
        let body = source.request_body(&unbiased, "medical negligence lawyer", None);
        assert!(body.get("locationBias").is_none());
        assert!(body.get("pageToken").is_none());
    }
}
