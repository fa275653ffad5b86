//! Ingest pipeline orchestration: profiling, promotion, de-duplication and loading.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use cetl_adapters::{
    build_draft, discover_source_files, extract_file, RecordContext, SourceProfile,
    SourceProfileConfig, SourceProfiles,
};
use cetl_core::{
    first_wins, ContactDraft, Disposition, ExistingContacts, PromotionRuleSet, RawRecord,
    SchemaProfile, StructuredContact, TagSet, FUZZY_COMPANY_MATCH, MISSING_COMPANY_NAME,
};
use cetl_storage::{
    ContactStore, InsertOutcome, PgContactStore, ProfileKeys, SinkDirectories, SinkKind, SinkRow,
    SinkWriter, StoreError,
};
use chrono::{DateTime, Utc};
use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "cetl-sync";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("deduplication.company_name_threshold must be within 0..=100, got {0}")]
    Threshold(f64),
    #[error("DATABASE_URL is not configured")]
    MissingDatabaseUrl,
}

/// Process-level settings taken from the environment.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub database_url: Option<String>,
    pub config_path: PathBuf,
    pub workspace_root: PathBuf,
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        Self {
            database_url: std::env::var("DATABASE_URL").ok().filter(|v| !v.trim().is_empty()),
            config_path: std::env::var("CETL_CONFIG")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("config.yaml")),
            workspace_root: std::env::var("CETL_WORKSPACE_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(".")),
        }
    }

    pub fn database_url(&self) -> Result<&str, ConfigError> {
        self.database_url
            .as_deref()
            .ok_or(ConfigError::MissingDatabaseUrl)
    }

    pub fn config_file(&self) -> PathBuf {
        resolve_path(&self.workspace_root, &self.config_path)
    }

    pub fn load_etl_config(&self) -> Result<EtlConfig, ConfigError> {
        EtlConfig::load(&self.config_file())
    }
}

fn resolve_path(root: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        root.join(path)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeduplicationConfig {
    #[serde(default = "default_threshold")]
    pub company_name_threshold: f64,
    #[serde(default = "default_true")]
    pub enable_fuzzy_matching: bool,
    /// Also write exact cross-store phone duplicates to a sink file.
    #[serde(default)]
    pub audit_exact_duplicates: bool,
}

impl Default for DeduplicationConfig {
    fn default() -> Self {
        Self {
            company_name_threshold: default_threshold(),
            enable_fuzzy_matching: true,
            audit_exact_duplicates: false,
        }
    }
}

fn default_threshold() -> f64 {
    90.0
}

fn default_true() -> bool {
    true
}

fn default_processed() -> PathBuf {
    PathBuf::from("processed")
}

fn default_review() -> PathBuf {
    PathBuf::from("review")
}

fn default_dropped() -> PathBuf {
    PathBuf::from("dropped_duplicates")
}

fn default_invalid() -> PathBuf {
    PathBuf::from("invalid_records")
}

fn default_reports() -> PathBuf {
    PathBuf::from("reports")
}

/// The YAML configuration file.
#[derive(Debug, Clone, Deserialize)]
pub struct EtlConfig {
    #[serde(default)]
    pub log_file: Option<PathBuf>,
    pub source_directory: PathBuf,
    #[serde(default = "default_processed")]
    pub processed_directory: PathBuf,
    #[serde(default = "default_review")]
    pub review_directory: PathBuf,
    #[serde(default = "default_dropped")]
    pub dropped_directory: PathBuf,
    #[serde(default = "default_invalid")]
    pub invalid_directory: PathBuf,
    #[serde(default = "default_reports")]
    pub reports_directory: PathBuf,
    #[serde(default)]
    pub tag: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub deduplication: DeduplicationConfig,
    #[serde(default, deserialize_with = "ordered_source_profiles")]
    pub data_source_profiles: Vec<SourceProfile>,
}

/// Keeps YAML declaration order, which decides profile selection.
fn ordered_source_profiles<'de, D>(deserializer: D) -> Result<Vec<SourceProfile>, D::Error>
where
    D: Deserializer<'de>,
{
    let mapping = serde_yaml::Mapping::deserialize(deserializer)?;
    mapping
        .into_iter()
        .map(|(name, value)| {
            let name = name
                .as_str()
                .ok_or_else(|| <D::Error as de::Error>::custom("profile names must be strings"))?
                .to_string();
            let profile: SourceProfileConfig = serde_yaml::from_value(value).map_err(|err| {
                <D::Error as de::Error>::custom(format!("profile {name}: {err}"))
            })?;
            Ok(SourceProfile {
                name,
                file_name_contains: profile.file_name_contains,
                rules: profile.promotion_rules,
            })
        })
        .collect()
}

impl EtlConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml_str(&text, &path.display().to_string())
    }

    pub fn from_yaml_str(text: &str, origin: &str) -> Result<Self, ConfigError> {
        let config: EtlConfig = serde_yaml::from_str(text).map_err(|source| ConfigError::Parse {
            path: origin.to_string(),
            source,
        })?;
        let threshold = config.deduplication.company_name_threshold;
        if !(0.0..=100.0).contains(&threshold) {
            return Err(ConfigError::Threshold(threshold));
        }
        Ok(config)
    }

    pub fn source_profiles(&self) -> SourceProfiles {
        SourceProfiles::new(self.data_source_profiles.clone())
    }

    /// Legacy `tag` first, then `tags`.
    pub fn batch_tags(&self) -> TagSet {
        TagSet::from_labels(self.tag.iter().chain(self.tags.iter()).cloned())
    }

    pub fn settings(&self, workspace_root: &Path) -> IngestSettings {
        let path = |p: &PathBuf| resolve_path(workspace_root, p);
        IngestSettings {
            source_directory: path(&self.source_directory),
            processed_directory: path(&self.processed_directory),
            reports_directory: path(&self.reports_directory),
            sinks: SinkDirectories {
                review: path(&self.review_directory),
                dropped: path(&self.dropped_directory),
                invalid: path(&self.invalid_directory),
            },
            tags: self.batch_tags(),
            dedup: DedupConfig {
                company_name_threshold: self.deduplication.company_name_threshold,
                fuzzy_enabled: self.deduplication.enable_fuzzy_matching,
            },
            audit_exact_duplicates: self.deduplication.audit_exact_duplicates,
        }
    }
}

/// Resolved, immutable settings for one run.
#[derive(Debug, Clone)]
pub struct IngestSettings {
    pub source_directory: PathBuf,
    pub processed_directory: PathBuf,
    pub reports_directory: PathBuf,
    pub sinks: SinkDirectories,
    pub tags: TagSet,
    pub dedup: DedupConfig,
    pub audit_exact_duplicates: bool,
}

/// Resolves the schema profile for a file's column set.
pub struct SchemaProfiler<'a> {
    store: &'a dyn ContactStore,
}

impl<'a> SchemaProfiler<'a> {
    pub fn new(store: &'a dyn ContactStore) -> Self {
        Self { store }
    }

    pub async fn profile<S: AsRef<str>>(&self, columns: &[S]) -> Result<SchemaProfile, StoreError> {
        let keys = ProfileKeys::from_columns(columns.iter().map(AsRef::<str>::as_ref));
        let profile = self.store.get_or_create_profile(&keys).await?;
        info!(
            profile_id = profile.id,
            hash = %profile.profile_hash,
            keys = profile.json_keys.len(),
            "schema profile"
        );
        Ok(profile)
    }
}

/// Rows of one file after first-occurrence-wins phone de-duplication.
#[derive(Debug, Clone, Default)]
pub struct IntraFileOutcome {
    pub kept: Vec<StructuredContact>,
    pub dropped: Vec<StructuredContact>,
}

/// Keeps the first record per phone number in file order; records without a phone are kept.
pub fn dedupe_within_file(records: Vec<StructuredContact>) -> IntraFileOutcome {
    let out = first_wins(records, |c| c.phone_number.clone());
    IntraFileOutcome {
        kept: out.kept,
        dropped: out.shadowed,
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DedupConfig {
    /// Inclusive, on the 0..=100 similarity scale.
    pub company_name_threshold: f64,
    pub fuzzy_enabled: bool,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            company_name_threshold: default_threshold(),
            fuzzy_enabled: true,
        }
    }
}

/// Immutable view of the stored contacts a file is classified against.
#[derive(Debug, Clone, Default)]
pub struct DedupSnapshot {
    phones: HashSet<String>,
    /// (as stored, normalized)
    company_names: Vec<(String, String)>,
}

impl DedupSnapshot {
    pub fn new(existing: ExistingContacts) -> Self {
        let mut snapshot = Self {
            phones: existing.phones.into_iter().collect(),
            company_names: Vec::with_capacity(existing.company_names.len()),
        };
        snapshot.push_names(existing.company_names);
        snapshot
    }

    fn push_names(&mut self, names: impl IntoIterator<Item = String>) {
        for name in names {
            let normalized = DedupEngine::normalize_key_fragment(&name);
            if !normalized.is_empty() {
                self.company_names.push((name, normalized));
            }
        }
    }

    /// A new snapshot that also contains `loaded`.
    pub fn extended_with(&self, loaded: &[StructuredContact]) -> Self {
        let mut next = self.clone();
        next.phones
            .extend(loaded.iter().filter_map(|c| c.phone_number.clone()));
        next.push_names(loaded.iter().map(|c| c.company_name.clone()));
        next
    }

    pub fn contains_phone(&self, phone: &str) -> bool {
        self.phones.contains(phone)
    }

    pub fn phone_count(&self) -> usize {
        self.phones.len()
    }

    pub fn company_name_count(&self) -> usize {
        self.company_names.len()
    }
}

/// Cross-store classifier: exact phone rejection, then fuzzy company-name review.
pub struct DedupEngine {
    config: DedupConfig,
}

impl DedupEngine {
    pub fn new(config: DedupConfig) -> Self {
        Self { config }
    }

    /// Lowercase, punctuation to spaces, tokens sorted and single-space joined.
    pub fn normalize_key_fragment(input: &str) -> String {
        let lowered = input
            .to_lowercase()
            .chars()
            .map(|c| if c.is_alphanumeric() { c } else { ' ' })
            .collect::<String>();
        let mut tokens = lowered.split_whitespace().collect::<Vec<_>>();
        tokens.sort_unstable();
        tokens.join(" ")
    }

    /// Indel similarity of two normalized keys on a 0..=100 scale:
    /// `100 * (len_a + len_b - indel) / (len_a + len_b)`, where `indel` counts the insertions
    /// and deletions (no substitutions) turning one key into the other.
    pub fn similarity(a: &str, b: &str) -> f64 {
        let a: Vec<char> = a.chars().collect();
        let b: Vec<char> = b.chars().collect();
        let total = a.len() + b.len();
        if total == 0 {
            return 100.0;
        }
        let indel = total - 2 * longest_common_subsequence(&a, &b);
        100.0 * (total - indel) as f64 / total as f64
    }

    /// Highest-scoring stored name for `company_name`; the earliest wins a tie.
    pub fn best_match<'s>(
        &self,
        company_name: &str,
        snapshot: &'s DedupSnapshot,
    ) -> Option<(&'s str, f64)> {
        let key = Self::normalize_key_fragment(company_name);
        if key.is_empty() {
            return None;
        }
        let mut best: Option<(&str, f64)> = None;
        for (stored, normalized) in &snapshot.company_names {
            let score = Self::similarity(&key, normalized);
            if best.map_or(true, |(_, s)| score > s) {
                best = Some((stored.as_str(), score));
            }
        }
        best
    }

    pub fn classify(&self, record: &StructuredContact, snapshot: &DedupSnapshot) -> Disposition {
        if let Some(phone) = &record.phone_number {
            if snapshot.contains_phone(phone) {
                return Disposition::RejectedExistingPhone {
                    phone_number: phone.clone(),
                };
            }
        }
        if !self.config.fuzzy_enabled {
            return Disposition::Unique;
        }
        match self.best_match(&record.company_name, snapshot) {
            Some((matched, score)) if score >= self.config.company_name_threshold => {
                Disposition::NeedsReview {
                    reason: FUZZY_COMPANY_MATCH.to_string(),
                    matched_existing_key: matched.to_string(),
                    score,
                }
            }
            _ => Disposition::Unique,
        }
    }
}

fn longest_common_subsequence(a: &[char], b: &[char]) -> usize {
    let mut row = vec![0usize; b.len() + 1];
    for &ca in a {
        let mut diagonal = 0;
        for (j, &cb) in b.iter().enumerate() {
            let above = row[j + 1];
            row[j + 1] = if ca == cb {
                diagonal + 1
            } else {
                above.max(row[j])
            };
            diagonal = above;
        }
    }
    row[b.len()]
}

/// Every row of a file, routed by disposition.
#[derive(Debug, Clone, Default)]
pub struct FileClassification {
    pub invalid: Vec<ContactDraft>,
    pub intra_file_duplicates: Vec<StructuredContact>,
    pub rejected_existing: Vec<(StructuredContact, Disposition)>,
    pub needs_review: Vec<(StructuredContact, Disposition)>,
    pub unique: Vec<StructuredContact>,
}

/// Promote, normalize, validate, de-duplicate within the file, then classify against `snapshot`.
pub fn classify_records(
    records: &[RawRecord],
    rules: &PromotionRuleSet,
    ctx: RecordContext<'_>,
    engine: &DedupEngine,
    snapshot: &DedupSnapshot,
) -> FileClassification {
    let mut out = FileClassification::default();
    let mut valid = Vec::with_capacity(records.len());
    for raw in records {
        match build_draft(raw, rules, ctx).into_contact() {
            Ok(contact) => valid.push(contact),
            Err(draft) => {
                warn!(row = raw.row_number, "record has no company name");
                out.invalid.push(draft);
            }
        }
    }

    let intra = dedupe_within_file(valid);
    for dup in &intra.dropped {
        debug!(
            row = dup.provenance.row_number,
            phone = ?dup.phone_number,
            "duplicate phone within file"
        );
    }
    out.intra_file_duplicates = intra.dropped;

    for contact in intra.kept {
        match engine.classify(&contact, snapshot) {
            Disposition::Unique => out.unique.push(contact),
            rejected @ Disposition::RejectedExistingPhone { .. } => {
                info!(
                    row = contact.provenance.row_number,
                    phone = ?contact.phone_number,
                    "phone already stored, discarding"
                );
                out.rejected_existing.push((contact, rejected));
            }
            review => {
                warn!(
                    row = contact.provenance.row_number,
                    company = %contact.company_name,
                    matched = review.matched_existing_key().unwrap_or_default(),
                    score = review.score().unwrap_or_default(),
                    "potential duplicate company, holding for review"
                );
                out.needs_review.push((contact, review));
            }
        }
    }
    out
}

/// Persists unique contacts; a phone conflict at insert time is a late duplicate, not a failure.
pub struct Loader<'a> {
    store: &'a dyn ContactStore,
}

impl<'a> Loader<'a> {
    pub fn new(store: &'a dyn ContactStore) -> Self {
        Self { store }
    }

    pub async fn load(&self, contact: &StructuredContact) -> Result<InsertOutcome, StoreError> {
        let outcome = self.store.insert_contact(contact).await?;
        if outcome == InsertOutcome::DuplicatePhone {
            warn!(
                row = contact.provenance.row_number,
                phone = ?contact.phone_number,
                "phone committed concurrently, routing to dropped duplicates"
            );
        }
        Ok(outcome)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    Completed,
    Skipped,
    Failed,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DispositionCounts {
    pub rows: usize,
    pub invalid: usize,
    pub intra_file_duplicates: usize,
    pub rejected_existing_phone: usize,
    pub needs_review: usize,
    pub loaded: usize,
    pub duplicate_at_load: usize,
}

impl DispositionCounts {
    fn add(&mut self, other: &DispositionCounts) {
        self.rows += other.rows;
        self.invalid += other.invalid;
        self.intra_file_duplicates += other.intra_file_duplicates;
        self.rejected_existing_phone += other.rejected_existing_phone;
        self.needs_review += other.needs_review;
        self.loaded += other.loaded;
        self.duplicate_at_load += other.duplicate_at_load;
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FileReport {
    pub file_name: String,
    pub status: FileStatus,
    pub error: Option<String>,
    pub schema_profile_id: Option<i64>,
    pub source_profile: Option<String>,
    pub counts: DispositionCounts,
    pub sink_files: Vec<String>,
    pub processed_path: Option<String>,
}

impl FileReport {
    fn skipped(file_name: &str, reason: impl Into<String>) -> Self {
        Self {
            file_name: file_name.to_string(),
            status: FileStatus::Skipped,
            error: Some(reason.into()),
            schema_profile_id: None,
            source_profile: None,
            counts: DispositionCounts::default(),
            sink_files: Vec::new(),
            processed_path: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub files: Vec<FileReport>,
    pub totals: DispositionCounts,
    pub reports_dir: String,
}

struct FileOutcome {
    report: FileReport,
    loaded: Vec<StructuredContact>,
}

pub struct IngestPipeline {
    settings: IngestSettings,
    profiles: SourceProfiles,
    store: Arc<dyn ContactStore>,
    sinks: SinkWriter,
    engine: DedupEngine,
}

impl IngestPipeline {
    pub fn new(
        settings: IngestSettings,
        profiles: SourceProfiles,
        store: Arc<dyn ContactStore>,
    ) -> Self {
        let sinks = SinkWriter::new(settings.sinks.clone());
        let engine = DedupEngine::new(settings.dedup);
        Self {
            settings,
            profiles,
            store,
            sinks,
            engine,
        }
    }

    /// Processes every source file in order. Store failures abort the run; problems confined
    /// to one file are reported and leave that file in place. Withheld rows are written to
    /// their sinks before anything from the file is loaded, so a file left in place by a sink
    /// failure has no contacts in the store.
    pub async fn run_once(&self) -> Result<IngestRunSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();

        let existing = self
            .store
            .existing_contacts()
            .await
            .context("loading existing contacts for de-duplication")?;
        let mut snapshot = DedupSnapshot::new(existing);
        info!(
            %run_id,
            phones = snapshot.phone_count(),
            company_names = snapshot.company_name_count(),
            fuzzy = self.settings.dedup.fuzzy_enabled,
            threshold = self.settings.dedup.company_name_threshold,
            "loaded existing contacts"
        );

        let files = discover_source_files(&self.settings.source_directory)?;
        let mut reports = Vec::with_capacity(files.len());
        let mut totals = DispositionCounts::default();
        for path in files {
            let span = info_span!("ingest_file", %run_id, file = %path.display());
            let outcome = self.ingest_file(&path, &snapshot).instrument(span).await?;
            if !outcome.loaded.is_empty() {
                snapshot = snapshot.extended_with(&outcome.loaded);
            }
            totals.add(&outcome.report.counts);
            reports.push(outcome.report);
        }

        let reports_dir = self.settings.reports_directory.join(run_id.to_string());
        let summary = IngestRunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            files: reports,
            totals,
            reports_dir: reports_dir.display().to_string(),
        };
        self.write_reports(&summary, &reports_dir).await?;
        info!(
            %run_id,
            files = summary.files.len(),
            loaded = summary.totals.loaded,
            rejected_existing_phone = summary.totals.rejected_existing_phone,
            needs_review = summary.totals.needs_review,
            "ingest run finished"
        );
        Ok(summary)
    }

    async fn ingest_file(&self, path: &Path, snapshot: &DedupSnapshot) -> Result<FileOutcome> {
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| path.display().to_string());

        let extracted = match extract_file(path) {
            Ok(extracted) => extracted,
            Err(err) => {
                error!(error = %err, "could not extract file");
                return Ok(FileOutcome {
                    report: FileReport::skipped(&file_name, err.to_string()),
                    loaded: Vec::new(),
                });
            }
        };
        if extracted.records.is_empty() {
            warn!("file has no data rows");
            return Ok(FileOutcome {
                report: FileReport::skipped(&file_name, "no data rows"),
                loaded: Vec::new(),
            });
        }
        info!(rows = extracted.records.len(), "extracted file");

        let profile = SchemaProfiler::new(self.store.as_ref())
            .profile(extracted.headers.as_slice())
            .await
            .with_context(|| format!("resolving schema profile for {file_name}"))?;
        let selected = self.profiles.select(&file_name);
        info!(source_profile = selected.profile_name, "applying promotion rules");

        let stamp = Utc::now();
        let ctx = RecordContext {
            profile_id: profile.id,
            source_file: &file_name,
            tags: &self.settings.tags,
            ingested_at: stamp,
        };
        let classified =
            classify_records(&extracted.records, selected.rules, ctx, &self.engine, snapshot);
        let mut counts = DispositionCounts {
            rows: extracted.records.len(),
            invalid: classified.invalid.len(),
            intra_file_duplicates: classified.intra_file_duplicates.len(),
            rejected_existing_phone: classified.rejected_existing.len(),
            needs_review: classified.needs_review.len(),
            loaded: 0,
            duplicate_at_load: 0,
        };
        let mut report = FileReport {
            file_name: file_name.clone(),
            status: FileStatus::Completed,
            error: None,
            schema_profile_id: Some(profile.id),
            source_profile: Some(selected.profile_name.to_string()),
            counts: counts.clone(),
            sink_files: Vec::new(),
            processed_path: None,
        };

        let mut batches = vec![
            (
                SinkKind::Review,
                sink_rows(classified.needs_review.into_iter().map(into_draft))?,
            ),
            (
                SinkKind::Dropped,
                sink_rows(
                    classified
                        .intra_file_duplicates
                        .into_iter()
                        .map(|c| into_draft((c, Disposition::DroppedIntraFileDuplicate))),
                )?,
            ),
            (
                SinkKind::Invalid,
                sink_rows(classified.invalid.into_iter().map(|draft| {
                    let reason = MISSING_COMPANY_NAME.to_string();
                    (draft, Disposition::Invalid { reason })
                }))?,
            ),
        ];
        if self.settings.audit_exact_duplicates {
            batches.push((
                SinkKind::ExistingPhone,
                sink_rows(classified.rejected_existing.into_iter().map(into_draft))?,
            ));
        }
        match self.write_sinks(&file_name, stamp, &batches).await {
            Ok(written) => report.sink_files = written,
            Err(err) => {
                error!(
                    error = %format!("{err:#}"),
                    "could not write sink files; nothing loaded, leaving source file in place"
                );
                report.status = FileStatus::Failed;
                report.error = Some(format!("{err:#}"));
                return Ok(FileOutcome {
                    report,
                    loaded: Vec::new(),
                });
            }
        }

        let loader = Loader::new(self.store.as_ref());
        let mut loaded = Vec::with_capacity(classified.unique.len());
        let mut late = Vec::new();
        for contact in classified.unique {
            let row = contact.provenance.row_number;
            match loader
                .load(&contact)
                .await
                .with_context(|| format!("loading row {row} of {file_name}"))?
            {
                InsertOutcome::Inserted { .. } => loaded.push(contact),
                InsertOutcome::DuplicatePhone => late.push(contact),
            }
        }
        counts.loaded = loaded.len();
        counts.duplicate_at_load = late.len();
        report.counts = counts;
        info!(
            loaded = report.counts.loaded,
            invalid = report.counts.invalid,
            intra_file_duplicates = report.counts.intra_file_duplicates,
            rejected_existing_phone = report.counts.rejected_existing_phone,
            needs_review = report.counts.needs_review,
            duplicate_at_load = report.counts.duplicate_at_load,
            "file classified"
        );

        // contacts are committed from here on, so the file moves even if this sink fails
        let late_rows = sink_rows(
            late.into_iter()
                .map(|c| into_draft((c, Disposition::DuplicateAtLoad))),
        )?;
        match self
            .write_sinks(&file_name, stamp, &[(SinkKind::Dropped, late_rows)])
            .await
        {
            Ok(written) => report.sink_files.extend(written),
            Err(err) => {
                error!(
                    error = %format!("{err:#}"),
                    loaded = report.counts.loaded,
                    "could not write duplicate-at-load rows after loading"
                );
                report.error = Some(format!(
                    "{} contact(s) loaded but duplicate-at-load rows were not written: {err:#}",
                    report.counts.loaded
                ));
            }
        }

        match self.move_processed(path, &file_name).await {
            Ok(dest) => report.processed_path = Some(dest.display().to_string()),
            Err(err) => {
                error!(error = %format!("{err:#}"), "could not move processed file");
                let note = format!("{err:#}");
                report.error = Some(match report.error.take() {
                    Some(earlier) => format!("{earlier}; {note}"),
                    None => note,
                });
            }
        }
        Ok(FileOutcome { report, loaded })
    }

    async fn write_sinks(
        &self,
        file_name: &str,
        stamp: DateTime<Utc>,
        batches: &[(SinkKind, Vec<SinkRow>)],
    ) -> Result<Vec<String>> {
        let mut written = Vec::new();
        for (kind, rows) in batches {
            if let Some(path) = self.sinks.write(*kind, file_name, stamp, rows).await? {
                written.push(path.display().to_string());
            }
        }
        Ok(written)
    }

    async fn move_processed(&self, path: &Path, file_name: &str) -> Result<PathBuf> {
        let dir = &self.settings.processed_directory;
        fs::create_dir_all(dir)
            .await
            .with_context(|| format!("creating {}", dir.display()))?;
        let dest = dir.join(file_name);
        fs::rename(path, &dest)
            .await
            .with_context(|| format!("moving {} -> {}", path.display(), dest.display()))?;
        info!(dest = %dest.display(), "moved processed file");
        Ok(dest)
    }

    async fn write_reports(&self, summary: &IngestRunSummary, reports_dir: &Path) -> Result<()> {
        fs::create_dir_all(reports_dir)
            .await
            .with_context(|| format!("creating {}", reports_dir.display()))?;

        let json = serde_json::to_vec_pretty(summary).context("serializing ingest summary")?;
        fs::write(reports_dir.join("ingest_summary.json"), json)
            .await
            .context("writing ingest_summary.json")?;

        let mut status_counts: BTreeMap<String, usize> = BTreeMap::new();
        for file in &summary.files {
            *status_counts
                .entry(format!("{:?}", file.status).to_lowercase())
                .or_default() += 1;
        }
        let t = &summary.totals;
        let brief = format!(
            concat!(
                "# Contact Ingest Brief\n\n",
                "- Run ID: `{}`\n- Started: {}\n- Finished: {}\n- Files: {}\n\n",
                "## Records\n- rows read: {}\n- loaded: {}\n- invalid: {}\n",
                "- intra-file duplicates: {}\n- existing phone rejected: {}\n",
                "- held for review: {}\n- duplicate at load: {}\n\n## Files\n{}\n",
            ),
            summary.run_id,
            summary.started_at,
            summary.finished_at,
            status_counts
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect::<Vec<_>>()
                .join(", "),
            t.rows,
            t.loaded,
            t.invalid,
            t.intra_file_duplicates,
            t.rejected_existing_phone,
            t.needs_review,
            t.duplicate_at_load,
            summary
                .files
                .iter()
                .map(|f| {
                    let status =
                        format!("- {}: {:?}, loaded {}", f.file_name, f.status, f.counts.loaded);
                    match &f.error {
                        Some(err) => format!("{status} ({err})"),
                        None => status,
                    }
                })
                .collect::<Vec<_>>()
                .join("\n")
        );
        fs::write(reports_dir.join("ingest_brief.md"), brief)
            .await
            .context("writing ingest_brief.md")?;
        Ok(())
    }
}

fn into_draft(
    (contact, disposition): (StructuredContact, Disposition),
) -> (ContactDraft, Disposition) {
    (ContactDraft::from(contact), disposition)
}

fn sink_rows(
    items: impl IntoIterator<Item = (ContactDraft, Disposition)>,
) -> Result<Vec<SinkRow>, StoreError> {
    items
        .into_iter()
        .map(|(draft, disposition)| SinkRow::new(&draft, &disposition))
        .collect()
}

/// Connects to Postgres and runs one ingest over the configured source directory.
pub async fn run_ingest(env: &PipelineConfig, config: &EtlConfig) -> Result<IngestRunSummary> {
    let database_url = env.database_url()?;
    let store = PgContactStore::connect(database_url)
        .await
        .context("connecting to contact store")?;
    let pipeline = IngestPipeline::new(
        config.settings(&env.workspace_root),
        config.source_profiles(),
        Arc::new(store),
    );
    pipeline.run_once().await
}

/// Sink CSV files waiting in `dir`, sorted by name.
pub fn list_sink_files(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut files = std::fs::read_dir(dir)
        .with_context(|| format!("reading {}", dir.display()))?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|p| p.extension().map(|e| e == "csv").unwrap_or(false))
        .collect::<Vec<_>>();
    files.sort();
    Ok(files)
}
