use std::fs;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use cetl_core::{ExistingContacts, SchemaProfile, StructuredContact};
use cetl_storage::{ContactStore, InsertOutcome, MemoryContactStore, ProfileKeys, StoreError};
use cetl_sync::{EtlConfig, FileStatus, IngestPipeline};
use tempfile::tempdir;

const CONFIG: &str = r#"
source_directory: incoming
tags: [e2e]
deduplication:
  company_name_threshold: THRESHOLD
  audit_exact_duplicates: true
data_source_profiles:
  default:
    promotion_rules:
      company_name: [Company]
      url: [Website]
      phone_number: [Company Phone]
"#;

const LEADS: &str = "Company,Website,Company Phone\n\
Acme Inc,acme.com,555-1234\n\
Acme Inc,acme.com,555-1234\n\
Beta LLC,beta.io,555-9999\n";

fn pipeline(root: &Path, threshold: u32, store: Arc<dyn ContactStore>) -> IngestPipeline {
    let yaml = CONFIG.replace("THRESHOLD", &threshold.to_string());
    let config = EtlConfig::from_yaml_str(&yaml, "test").expect("config");
    IngestPipeline::new(config.settings(root), config.source_profiles(), store)
}

fn write_source(root: &Path, name: &str, content: &str) {
    let dir = root.join("incoming");
    fs::create_dir_all(&dir).expect("incoming dir");
    fs::write(dir.join(name), content).expect("source file");
}

fn csv_files(dir: &Path) -> Vec<String> {
    let mut files = fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .map(|e| e.file_name().to_string_lossy().to_string())
                .filter(|n| n.ends_with(".csv"))
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();
    files.sort();
    files
}

#[tokio::test]
async fn unique_rows_load_and_intra_file_duplicate_is_dropped() {
    let root = tempdir().expect("tempdir");
    write_source(root.path(), "leads.csv", LEADS);
    let store = Arc::new(MemoryContactStore::new());

    let summary = pipeline(root.path(), 90, store.clone())
        .run_once()
        .await
        .expect("run");

    assert_eq!(summary.files.len(), 1);
    let file = &summary.files[0];
    assert_eq!(file.status, FileStatus::Completed);
    assert_eq!(file.counts.rows, 3);
    assert_eq!(file.counts.intra_file_duplicates, 1);
    assert_eq!(file.counts.loaded, 2);
    assert_eq!(file.counts.needs_review, 0);

    let names: Vec<_> = store
        .contacts()
        .await
        .into_iter()
        .map(|c| (c.company_name, c.phone_number))
        .collect();
    assert_eq!(
        names,
        vec![
            ("Acme Inc".to_string(), Some("5551234".to_string())),
            ("Beta LLC".to_string(), Some("5559999".to_string())),
        ]
    );
    let profiles = store.profiles().await;
    assert_eq!(profiles.len(), 1);
    assert_eq!(profiles[0].contact_count, 2);
    assert_eq!(profiles[0].json_keys, vec!["Company", "Company Phone", "Website"]);

    let dropped = csv_files(&root.path().join("dropped_duplicates"));
    assert_eq!(dropped.len(), 1);
    assert!(dropped[0].starts_with("duplicates_leads_"));
    let body = fs::read_to_string(root.path().join("dropped_duplicates").join(&dropped[0]))
        .expect("dropped");
    assert!(body.contains("dropped_intra_file_duplicate"));
    assert!(csv_files(&root.path().join("review")).is_empty());

    assert!(csv_files(&root.path().join("incoming")).is_empty());
    assert!(root.path().join("processed").join("leads.csv").exists());
    assert!(Path::new(&summary.reports_dir).join("ingest_summary.json").exists());
    assert!(Path::new(&summary.reports_dir).join("ingest_brief.md").exists());
}

#[tokio::test]
async fn similar_stored_company_is_held_for_review() {
    let root = tempdir().expect("tempdir");
    write_source(root.path(), "leads.csv", LEADS);
    let store = Arc::new(MemoryContactStore::new());
    store.seed("ACME INC.", Some("5550000")).await;

    let summary = pipeline(root.path(), 85, store.clone())
        .run_once()
        .await
        .expect("run");

    let file = &summary.files[0];
    assert_eq!(file.counts.needs_review, 1);
    assert_eq!(file.counts.loaded, 1);

    let stored: Vec<_> = store.contacts().await.into_iter().map(|c| c.company_name).collect();
    assert_eq!(stored, vec!["ACME INC.", "Beta LLC"]);

    let review_dir = root.path().join("review");
    let review = csv_files(&review_dir);
    assert_eq!(review.len(), 1);
    let mut reader = csv::Reader::from_path(review_dir.join(&review[0])).expect("review csv");
    let headers = reader.headers().expect("headers").clone();
    let rows: Vec<_> = reader.records().map(|r| r.expect("row")).collect();
    assert_eq!(rows.len(), 1);
    let col = |name: &str| headers.iter().position(|h| h == name).expect("column");
    assert_eq!(&rows[0][col("disposition")], "needs_review");
    assert_eq!(&rows[0][col("matched_existing_key")], "ACME INC.");
    assert_eq!(&rows[0][col("company_name")], "Acme Inc");
    let score: f64 = rows[0][col("score")].parse().expect("score");
    assert!(score >= 85.0);
}

#[tokio::test]
async fn later_files_see_contacts_loaded_by_earlier_ones() {
    let root = tempdir().expect("tempdir");
    write_source(root.path(), "a_first.csv", "Company,Company Phone\nAcme Inc,555-1234\n");
    write_source(root.path(), "b_second.csv", "Company;Company Phone\nAcme Holdings;(555) 1234\n");
    let store = Arc::new(MemoryContactStore::new());

    let summary = pipeline(root.path(), 90, store.clone())
        .run_once()
        .await
        .expect("run");

    assert_eq!(summary.files[0].counts.loaded, 1);
    assert_eq!(summary.files[1].counts.rejected_existing_phone, 1);
    assert_eq!(summary.totals.loaded, 1);
    assert_eq!(store.contacts().await.len(), 1);

    let audit = csv_files(&root.path().join("dropped_duplicates"));
    assert_eq!(audit.len(), 1);
    assert!(audit[0].starts_with("existing_b_second_"));
    // both files share one column set
    assert_eq!(store.profiles().await.len(), 1);
}

#[tokio::test]
async fn rows_without_company_go_to_invalid_sink() {
    let root = tempdir().expect("tempdir");
    write_source(
        root.path(),
        "leads.csv",
        "Company,Website,Company Phone\n,,555-0001\n,widgets.co.uk,555-0002\n",
    );
    let store = Arc::new(MemoryContactStore::new());

    let summary = pipeline(root.path(), 90, store.clone())
        .run_once()
        .await
        .expect("run");

    assert_eq!(summary.totals.invalid, 1);
    assert_eq!(summary.totals.loaded, 1);
    assert_eq!(store.contacts().await[0].company_name, "Widgets");
    assert_eq!(csv_files(&root.path().join("invalid_records")).len(), 1);
}

#[tokio::test]
async fn header_only_file_is_skipped_and_left_in_place() {
    let root = tempdir().expect("tempdir");
    write_source(root.path(), "empty.csv", "Company,Company Phone\n");
    let store = Arc::new(MemoryContactStore::new());

    let summary = pipeline(root.path(), 90, store)
        .run_once()
        .await
        .expect("run");

    assert_eq!(summary.files[0].status, FileStatus::Skipped);
    assert!(root.path().join("incoming").join("empty.csv").exists());
}

#[tokio::test]
async fn unavailable_store_aborts_before_any_file_moves() {
    let root = tempdir().expect("tempdir");
    write_source(root.path(), "leads.csv", LEADS);
    let store = Arc::new(MemoryContactStore::offline());

    let result = pipeline(root.path(), 90, store).run_once().await;

    assert!(result.is_err());
    assert!(root.path().join("incoming").join("leads.csv").exists());
    assert!(!root.path().join("processed").exists());
}

/// Memory store that loses the insert race for one phone number.
struct ContestedPhoneStore {
    inner: MemoryContactStore,
    contested: &'static str,
}

#[async_trait]
impl ContactStore for ContestedPhoneStore {
    async fn get_or_create_profile(&self, keys: &ProfileKeys) -> Result<SchemaProfile, StoreError> {
        self.inner.get_or_create_profile(keys).await
    }

    async fn existing_contacts(&self) -> Result<ExistingContacts, StoreError> {
        self.inner.existing_contacts().await
    }

    async fn insert_contact(
        &self,
        contact: &StructuredContact,
    ) -> Result<InsertOutcome, StoreError> {
        if contact.phone_number.as_deref() == Some(self.contested) {
            return Ok(InsertOutcome::DuplicatePhone);
        }
        self.inner.insert_contact(contact).await
    }
}

#[tokio::test]
async fn insert_conflict_is_dropped_and_run_continues() {
    let root = tempdir().expect("tempdir");
    write_source(root.path(), "leads.csv", LEADS);
    write_source(root.path(), "more.csv", "Company,Company Phone\nGamma Ltd,555-7777\n");
    let store = Arc::new(ContestedPhoneStore {
        inner: MemoryContactStore::new(),
        contested: "5559999",
    });

    let summary = pipeline(root.path(), 90, store.clone())
        .run_once()
        .await
        .expect("run");

    let leads = &summary.files[0];
    assert_eq!(leads.status, FileStatus::Completed);
    assert_eq!(leads.counts.loaded, 1);
    assert_eq!(leads.counts.duplicate_at_load, 1);
    assert!(root.path().join("processed").join("leads.csv").exists());
    assert_eq!(summary.files[1].counts.loaded, 1);
    assert_eq!(summary.totals.duplicate_at_load, 1);

    let dropped_dir = root.path().join("dropped_duplicates");
    let bodies: Vec<String> = csv_files(&dropped_dir)
        .iter()
        .map(|name| fs::read_to_string(dropped_dir.join(name)).expect("dropped"))
        .collect();
    let late: Vec<&String> = bodies
        .iter()
        .filter(|b| b.contains("duplicate_at_load"))
        .collect();
    assert_eq!(late.len(), 1);
    assert!(late[0].contains("Beta LLC"));
    assert!(late[0].contains("5559999"));

    let stored: Vec<_> = store
        .inner
        .contacts()
        .await
        .into_iter()
        .map(|c| c.company_name)
        .collect();
    assert_eq!(stored, vec!["Acme Inc", "Gamma Ltd"]);
}

#[tokio::test]
async fn sink_failure_fails_file_before_anything_loads() {
    let root = tempdir().expect("tempdir");
    write_source(root.path(), "leads.csv", LEADS);
    let store = Arc::new(MemoryContactStore::new());
    store.seed("ACME INC.", Some("5550000")).await;
    // a regular file where the review directory should be
    fs::write(root.path().join("review"), "not a directory").expect("blocker");

    let summary = pipeline(root.path(), 85, store.clone())
        .run_once()
        .await
        .expect("run");

    let file = &summary.files[0];
    assert_eq!(file.status, FileStatus::Failed);
    assert!(file.error.is_some());
    assert_eq!(file.counts.needs_review, 1);
    assert_eq!(file.counts.loaded, 0);
    assert!(root.path().join("incoming").join("leads.csv").exists());
    assert!(!root.path().join("processed").join("leads.csv").exists());
    assert_eq!(store.contacts().await.len(), 1);

    // once the sink is writable the rerun loads Beta without matching it against itself
    fs::remove_file(root.path().join("review")).expect("unblock");
    let rerun = pipeline(root.path(), 85, store.clone())
        .run_once()
        .await
        .expect("rerun");
    let file = &rerun.files[0];
    assert_eq!(file.status, FileStatus::Completed);
    assert_eq!(file.counts.loaded, 1);
    assert_eq!(file.counts.needs_review, 1);
    assert_eq!(file.counts.rejected_existing_phone, 0);
    assert!(root.path().join("processed").join("leads.csv").exists());
}

#[tokio::test]
async fn non_utf8_file_is_skipped_and_left_in_place() {
    let root = tempdir().expect("tempdir");
    let incoming = root.path().join("incoming");
    fs::create_dir_all(&incoming).expect("incoming dir");
    fs::write(incoming.join("latin1.csv"), b"Company,Company Phone\nM\xfcller GmbH,555-4242\n")
        .expect("source file");
    let store = Arc::new(MemoryContactStore::new());

    let summary = pipeline(root.path(), 90, store.clone())
        .run_once()
        .await
        .expect("run");

    let file = &summary.files[0];
    assert_eq!(file.status, FileStatus::Skipped);
    assert!(file.error.as_deref().unwrap_or_default().contains("UTF-8"));
    assert!(incoming.join("latin1.csv").exists());
    assert!(store.contacts().await.is_empty());
}
