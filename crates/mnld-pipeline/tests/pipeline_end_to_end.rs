//! End-to-end pipeline runs against stub sources and an in-memory sink.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use mnld_core::{
    AddressParts, BusinessStatus, CandidateRecord, EnrichmentOutcome, EnrichmentRecord,
    MergedRecord,
};
use mnld_pipeline::{
    weights, CityPlan, CollectionPlan, FinalSnapshot, ImportFailure, ImportReport, ImportSink,
    Phase, Pipeline,
};
use mnld_sources::{CandidateSource, Enricher, SearchOutcome, SearchTarget};
use mnld_storage::RunStore;
use tempfile::tempdir;

fn acme_candidate(place_id: &str, firm_name: &str) -> CandidateRecord {
    CandidateRecord {
        place_id: place_id.to_string(),
        firm_name: firm_name.to_string(),
        formatted_address: Some("1 Example St, Sydney, NSW 2000, Australia".to_string()),
        address_parts: AddressParts {
            street: Some("1 Example St".to_string()),
            city: Some("Sydney".to_string()),
            state: Some("NSW".to_string()),
            postcode: Some("2000".to_string()),
            country: Some("Australia".to_string()),
        },
        city: "Sydney".to_string(),
        state_code: "NSW".to_string(),
        latitude: None,
        longitude: None,
        phone: Some("+61299990000".to_string()),
        website: Some("https://acme.example".to_string()),
        rating: None,
        review_count: None,
        business_hours: None,
        business_status: BusinessStatus::Operating,
        maps_url: None,
        collected_at: Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).single().unwrap(),
    }
}

fn sydney_plan() -> CollectionPlan {
    CollectionPlan {
        cities: vec![CityPlan {
            city: "Sydney".to_string(),
            state_code: "NSW".to_string(),
            latitude: None,
            longitude: None,
            radius_m: None,
        }],
        search_terms: vec![
            "medical negligence lawyer".to_string(),
            "medical malpractice lawyer".to_string(),
        ],
    }
}

struct StubSource {
    candidates: Vec<CandidateRecord>,
    calls: AtomicUsize,
}

impl StubSource {
    fn new(candidates: Vec<CandidateRecord>) -> Self {
        Self {
            candidates,
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl CandidateSource for StubSource {
    async fn search(&self, _target: &SearchTarget, _term: &str) -> SearchOutcome {
        self.calls.fetch_add(1, Ordering::SeqCst);
        SearchOutcome {
            candidates: self.candidates.clone(),
            pages_fetched: 1,
            failed_pages: 0,
            last_error: None,
        }
    }
}

struct UnreachableEnricher;

#[async_trait]
impl Enricher for UnreachableEnricher {
    async fn enrich(&self, candidate: &CandidateRecord) -> EnrichmentRecord {
        EnrichmentRecord::empty(&candidate.place_id, EnrichmentOutcome::Unreachable)
    }
}

#[derive(Debug, Clone)]
struct StoredRow {
    slug: String,
    is_published: bool,
    score: u8,
}

/// In-memory stand-in for the destination store: upsert by place id, slug
/// uniqueness enforced, moderation fields preserved on update.
#[derive(Default)]
struct MemorySink {
    rows: Mutex<HashMap<String, StoredRow>>,
}

impl MemorySink {
    fn publish(&self, place_id: &str) {
        let mut rows = self.rows.lock().unwrap();
        rows.get_mut(place_id).expect("row exists").is_published = true;
    }

    fn snapshot(&self) -> HashMap<String, StoredRow> {
        self.rows.lock().unwrap().clone()
    }
}

#[async_trait]
impl ImportSink for MemorySink {
    async fn import_all(&self, records: &[MergedRecord]) -> anyhow::Result<ImportReport> {
        let mut report = ImportReport::default();
        let mut rows = self.rows.lock().unwrap();
        for record in records {
            let place_id = record.candidate.place_id.clone();
            if let Some(existing) = rows.get_mut(&place_id) {
                existing.slug = record.slug.clone();
                existing.score = record.profile_completeness_score;
                // is_published untouched: operator-owned.
                report.updated += 1;
                continue;
            }
            let slug_taken = rows.values().any(|row| row.slug == record.slug);
            if slug_taken {
                report.failed += 1;
                report.errors.push(ImportFailure {
                    slug: record.slug.clone(),
                    firm_name: record.candidate.firm_name.clone(),
                    reason: "duplicate key value violates unique constraint".to_string(),
                });
                continue;
            }
            rows.insert(
                place_id,
                StoredRow {
                    slug: record.slug.clone(),
                    is_published: false,
                    score: record.profile_completeness_score,
                },
            );
            report.inserted += 1;
        }
        Ok(report)
    }
}

#[tokio::test]
async fn unreachable_website_still_yields_a_complete_unpublished_listing() {
    let dir = tempdir().expect("tempdir");
    let store = RunStore::new(dir.path());
    let source = Arc::new(StubSource::new(vec![acme_candidate("place-acme", "Acme Lawyers")]));
    let sink = Arc::new(MemorySink::default());

    let pipeline = Pipeline::new(
        store.clone(),
        sydney_plan(),
        source.clone(),
        Arc::new(UnreachableEnricher),
        Some(sink.clone()),
    );
    let summary = pipeline.run(false).await.expect("run");

    // Two search terms returned the same place id: one survives.
    assert_eq!(source.calls.load(Ordering::SeqCst), 2);
    assert_eq!(summary.candidates, 1);
    assert_eq!(summary.duplicate_hits, 1);
    assert_eq!(summary.records, 1);
    assert_eq!(summary.websites_unreachable, 1);

    let final_snapshot: FinalSnapshot = store
        .read_snapshot(&summary.run_id, Phase::Synthesize.snapshot_name())
        .await
        .expect("final snapshot");
    let record = &final_snapshot.records[0];
    assert!(!record.synthesis.description.is_empty());
    assert!(!record.synthesis.short_description.is_empty());
    assert_eq!(record.slug, "acme-lawyers-sydney");
    // Base contact is complete and the synthesized description clears its
    // threshold; every enrichment-dependent category stays unawarded.
    assert_eq!(
        record.profile_completeness_score,
        weights::BASE_CONTACT + weights::DESCRIPTION
    );

    let import = summary.import.expect("import ran");
    assert_eq!(import.inserted, 1);
    assert_eq!(import.failed, 0);

    let rows = sink.snapshot();
    assert_eq!(rows.len(), 1);
    assert!(!rows["place-acme"].is_published);
}

#[tokio::test]
async fn resume_reuses_the_sealed_search_snapshot_without_requerying() {
    let dir = tempdir().expect("tempdir");
    let store = RunStore::new(dir.path());

    let first_source = Arc::new(StubSource::new(vec![acme_candidate("place-acme", "Acme Lawyers")]));
    let pipeline = Pipeline::new(
        store.clone(),
        sydney_plan(),
        first_source.clone(),
        Arc::new(UnreachableEnricher),
        None,
    );
    let first = pipeline.run(false).await.expect("first run");
    assert_eq!(first_source.calls.load(Ordering::SeqCst), 2);

    // A fresh pipeline with a source that must not be consulted.
    let second_source = Arc::new(StubSource::new(Vec::new()));
    let pipeline = Pipeline::new(
        store.clone(),
        sydney_plan(),
        second_source.clone(),
        Arc::new(UnreachableEnricher),
        None,
    );
    let resumed = pipeline.run(true).await.expect("resumed run");

    assert_eq!(second_source.calls.load(Ordering::SeqCst), 0);
    assert!(resumed.resumed_from_search);
    assert_eq!(resumed.run_id, first.run_id);
    assert_eq!(resumed.records, first.records);

    let final_snapshot: FinalSnapshot = store
        .read_snapshot(&resumed.run_id, Phase::Synthesize.snapshot_name())
        .await
        .expect("final snapshot");
    assert_eq!(final_snapshot.records[0].slug, "acme-lawyers-sydney");
}

#[tokio::test]
async fn second_import_updates_in_place_and_preserves_moderation() {
    let dir = tempdir().expect("tempdir");
    let store = RunStore::new(dir.path());
    let source = Arc::new(StubSource::new(vec![acme_candidate("place-acme", "Acme Lawyers")]));
    let sink = Arc::new(MemorySink::default());

    let pipeline = Pipeline::new(
        store.clone(),
        sydney_plan(),
        source,
        Arc::new(UnreachableEnricher),
        Some(sink.clone()),
    );
    let first = pipeline.run(false).await.expect("first run");
    assert_eq!(first.import.as_ref().expect("import").inserted, 1);

    // Operator publishes the listing between runs.
    sink.publish("place-acme");

    let second = pipeline.run(true).await.expect("second run");
    let import = second.import.expect("import");
    assert_eq!(import.inserted, 0);
    assert_eq!(import.updated, 1);

    let rows = sink.snapshot();
    assert_eq!(rows.len(), 1);
    assert!(rows["place-acme"].is_published, "moderation state must survive reruns");
}

#[tokio::test]
async fn identical_base_slugs_import_without_uniqueness_failures() {
    let dir = tempdir().expect("tempdir");
    let store = RunStore::new(dir.path());
    let source = Arc::new(StubSource::new(vec![
        acme_candidate("place-1", "Acme Lawyers"),
        acme_candidate("place-2", "Acme Lawyers"),
    ]));
    let sink = Arc::new(MemorySink::default());

    let pipeline = Pipeline::new(
        store,
        sydney_plan(),
        source,
        Arc::new(UnreachableEnricher),
        Some(sink.clone()),
    );
    let summary = pipeline.run(false).await.expect("run");

    assert_eq!(summary.records, 2);
    // Two different firms with the same name in the same city are also a
    // cross-identifier duplicate candidate for operator review.
    assert_eq!(summary.possible_duplicates, 1);

    let import = summary.import.expect("import");
    assert_eq!(import.inserted, 2);
    assert_eq!(import.failed, 0);

    let rows = sink.snapshot();
    let mut slugs: Vec<String> = rows.values().map(|row| row.slug.clone()).collect();
    slugs.sort();
    assert_eq!(slugs, vec!["acme-lawyers-sydney", "acme-lawyers-sydney-2"]);
}
