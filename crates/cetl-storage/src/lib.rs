//! Profile hashing, atomic sink files and the contact store (Postgres + in-memory).

use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use cetl_core::{
    ContactDraft, Disposition, ExistingContacts, Provenance, SchemaProfile, StructuredContact,
    TagSet,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::Row;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "cetl-storage";

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Sorted, de-duplicated column names of a source file and their digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfileKeys {
    keys: Vec<String>,
    hash: String,
}

impl ProfileKeys {
    pub fn from_columns<S: AsRef<str>>(columns: impl IntoIterator<Item = S>) -> Self {
        let mut keys: Vec<String> = columns.into_iter().map(|c| c.as_ref().to_string()).collect();
        keys.sort();
        keys.dedup();

        // length-prefixed so that no two distinct key lists share an encoding
        let mut hasher = Sha256::new();
        for key in &keys {
            hasher.update((key.len() as u64).to_le_bytes());
            hasher.update(key.as_bytes());
        }
        let hash = hex::encode(hasher.finalize());
        Self { keys, hash }
    }

    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    pub fn hash(&self) -> &str {
        &self.hash
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(#[from] sqlx::Error),
    #[error("running migrations: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("profile {0} does not exist")]
    ProfileMissing(i64),
    #[error("serializing contact: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted { id: i64 },
    /// The phone number was committed by someone else first.
    DuplicatePhone,
}

#[async_trait]
pub trait ContactStore: Send + Sync {
    /// Returns the profile for `keys`, creating it with `contact_count = 0` when new.
    async fn get_or_create_profile(&self, keys: &ProfileKeys) -> Result<SchemaProfile, StoreError>;

    /// Phones and company names of every stored contact.
    async fn existing_contacts(&self) -> Result<ExistingContacts, StoreError>;

    /// Persists `contact` and increments its profile's `contact_count` as one unit.
    async fn insert_contact(
        &self,
        contact: &StructuredContact,
    ) -> Result<InsertOutcome, StoreError>;
}

#[derive(Debug, Clone)]
pub struct PgContactStore {
    pool: PgPool,
}

/// Row shape for `view-contacts`.
#[derive(Debug, Clone, Serialize)]
pub struct ContactSummary {
    pub id: i64,
    pub company_name: String,
    pub phone_number: Option<String>,
    pub industry: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Everything stored for one contact.
#[derive(Debug, Clone, Serialize)]
pub struct ContactAudit {
    pub id: i64,
    pub company_name: String,
    pub phone_number: Option<String>,
    pub url: Option<String>,
    pub industry: Option<String>,
    pub is_b2b: Option<bool>,
    pub customer_target_segments: Option<String>,
    pub profile_id: Option<i64>,
    pub status: String,
    pub tags: Vec<String>,
    pub source_file: Option<String>,
    pub last_used: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub additional_info: JsonValue,
}

/// Flat row shape for `export-contacts`: tags joined with `;`, extra columns as JSON text.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContactExportRow {
    pub id: i64,
    pub company_name: String,
    pub phone_number: Option<String>,
    pub url: Option<String>,
    pub industry: Option<String>,
    pub is_b2b: Option<bool>,
    pub customer_target_segments: Option<String>,
    pub profile_id: Option<i64>,
    pub status: String,
    pub tags: String,
    pub source_file: Option<String>,
    pub last_used: Option<String>,
    pub created_at: String,
    pub additional_info: String,
}

impl From<&ContactAudit> for ContactExportRow {
    fn from(contact: &ContactAudit) -> Self {
        Self {
            id: contact.id,
            company_name: contact.company_name.clone(),
            phone_number: contact.phone_number.clone(),
            url: contact.url.clone(),
            industry: contact.industry.clone(),
            is_b2b: contact.is_b2b,
            customer_target_segments: contact.customer_target_segments.clone(),
            profile_id: contact.profile_id,
            status: contact.status.clone(),
            tags: contact.tags.join(";"),
            source_file: contact.source_file.clone(),
            last_used: contact.last_used.map(|t| t.to_rfc3339()),
            created_at: contact.created_at.to_rfc3339(),
            additional_info: contact.additional_info.to_string(),
        }
    }
}

/// Renders contacts as CSV with a header row.
pub fn contacts_csv(contacts: &[ContactAudit]) -> anyhow::Result<Vec<u8>> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    for contact in contacts {
        writer
            .serialize(ContactExportRow::from(contact))
            .with_context(|| format!("serializing contact {}", contact.id))?;
    }
    writer
        .into_inner()
        .map_err(|err| anyhow::anyhow!("flushing contact export: {}", err.error()))
}

/// Rows removed by a store reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResetCounts {
    pub contacts: u64,
    pub profiles: u64,
}

const CONTACT_AUDIT_COLUMNS: &str = "id, company_name, phone_number, url, industry, is_b2b, \
     customer_target_segments, profile_id, status, tags, source_file, last_used, created_at, \
     additional_info";

impl PgContactStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        info!("connected to contact store");
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Creates the profile and contact tables and the phone uniqueness constraint.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("contact store schema is current");
        Ok(())
    }

    pub async fn recent_contacts(&self, limit: i64) -> Result<Vec<ContactSummary>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, company_name, phone_number, industry, created_at
              FROM contacts
             ORDER BY created_at DESC, id DESC
             LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(ContactSummary {
                id: row.try_get("id")?,
                company_name: row.try_get("company_name")?,
                phone_number: row.try_get("phone_number")?,
                industry: row.try_get("industry")?,
                created_at: row.try_get("created_at")?,
            });
        }
        Ok(out)
    }

    pub async fn profiles(&self) -> Result<Vec<SchemaProfile>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, profile_hash, json_keys, contact_count, created_at
              FROM contact_profiles
             ORDER BY contact_count DESC, id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(profile_from_row).collect()
    }

    pub async fn contact_audit(&self, id: i64) -> Result<Option<ContactAudit>, StoreError> {
        let sql = format!("SELECT {CONTACT_AUDIT_COLUMNS} FROM contacts WHERE id = $1");
        let row = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await?;
        row.as_ref().map(audit_from_row).transpose()
    }

    /// Every stored contact in id order.
    pub async fn all_contacts(&self) -> Result<Vec<ContactAudit>, StoreError> {
        let sql = format!("SELECT {CONTACT_AUDIT_COLUMNS} FROM contacts ORDER BY id");
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(audit_from_row).collect()
    }

    /// Deletes every contact and then every profile in one transaction.
    pub async fn reset(&self) -> Result<ResetCounts, StoreError> {
        let mut tx = self.pool.begin().await?;
        let contacts = sqlx::query("DELETE FROM contacts")
            .execute(&mut *tx)
            .await?
            .rows_affected();
        let profiles = sqlx::query("DELETE FROM contact_profiles")
            .execute(&mut *tx)
            .await?
            .rows_affected();
        tx.commit().await?;
        warn!(contacts, profiles, "contact store reset");
        Ok(ResetCounts { contacts, profiles })
    }

    pub async fn count_contacts(&self) -> Result<i64, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(id) FROM contacts")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    pub async fn count_by_phones(&self, phones: &[String]) -> Result<i64, StoreError> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(id) FROM contacts WHERE phone_number = ANY($1)")
                .bind(phones)
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }

    /// Marks matching contacts used and appends `tag`; contacts already carrying the tag are
    /// skipped.
    pub async fn mark_used(&self, phones: &[String], tag: &str) -> Result<u64, StoreError> {
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(
            r#"
            UPDATE contacts
               SET status = 'used',
                   last_used = NOW(),
                   updated_at = NOW(),
                   tags = array_append(tags, $2)
             WHERE phone_number = ANY($1)
               AND NOT ($2 = ANY(tags))
            "#,
        )
        .bind(phones)
        .bind(tag)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        info!(updated = result.rows_affected(), tag, "marked contacts used");
        Ok(result.rows_affected())
    }
}

fn audit_from_row(row: &PgRow) -> Result<ContactAudit, StoreError> {
    let Json(additional_info): Json<JsonValue> = row.try_get("additional_info")?;
    Ok(ContactAudit {
        id: row.try_get("id")?,
        company_name: row.try_get("company_name")?,
        phone_number: row.try_get("phone_number")?,
        url: row.try_get("url")?,
        industry: row.try_get("industry")?,
        is_b2b: row.try_get("is_b2b")?,
        customer_target_segments: row.try_get("customer_target_segments")?,
        profile_id: row.try_get("profile_id")?,
        status: row.try_get("status")?,
        tags: row.try_get("tags")?,
        source_file: row.try_get("source_file")?,
        last_used: row.try_get("last_used")?,
        created_at: row.try_get("created_at")?,
        additional_info,
    })
}

fn profile_from_row(row: &PgRow) -> Result<SchemaProfile, StoreError> {
    Ok(SchemaProfile {
        id: row.try_get("id")?,
        profile_hash: row.try_get("profile_hash")?,
        json_keys: row.try_get("json_keys")?,
        contact_count: row.try_get("contact_count")?,
        created_at: row.try_get("created_at")?,
    })
}

#[async_trait]
impl ContactStore for PgContactStore {
    async fn get_or_create_profile(&self, keys: &ProfileKeys) -> Result<SchemaProfile, StoreError> {
        // the no-op update makes RETURNING yield the existing row on conflict
        let row = sqlx::query(
            r#"
            INSERT INTO contact_profiles (profile_hash, json_keys)
            VALUES ($1, $2)
            ON CONFLICT (profile_hash) DO UPDATE SET profile_hash = EXCLUDED.profile_hash
            RETURNING id, profile_hash, json_keys, contact_count, created_at
            "#,
        )
        .bind(keys.hash())
        .bind(keys.keys())
        .fetch_one(&self.pool)
        .await?;
        let profile = profile_from_row(&row)?;
        debug!(profile_id = profile.id, hash = %profile.profile_hash, "resolved schema profile");
        Ok(profile)
    }

    async fn existing_contacts(&self) -> Result<ExistingContacts, StoreError> {
        let rows = sqlx::query("SELECT company_name, phone_number FROM contacts")
            .fetch_all(&self.pool)
            .await?;
        let mut existing = ExistingContacts::default();
        for row in rows {
            existing.company_names.push(row.try_get("company_name")?);
            if let Some(phone) = row.try_get::<Option<String>, _>("phone_number")? {
                existing.phones.push(phone);
            }
        }
        Ok(existing)
    }

    async fn insert_contact(
        &self,
        contact: &StructuredContact,
    ) -> Result<InsertOutcome, StoreError> {
        let mut tx = self.pool.begin().await?;
        let inserted = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO contacts (
                profile_id, company_name, url, phone_number, is_b2b, industry,
                customer_target_segments, additional_info, tags, source_file, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $11)
            RETURNING id
            "#,
        )
        .bind(contact.profile_id)
        .bind(&contact.company_name)
        .bind(&contact.url)
        .bind(&contact.phone_number)
        .bind(contact.is_b2b)
        .bind(&contact.industry)
        .bind(&contact.customer_target_segments)
        .bind(Json(&contact.additional_info))
        .bind(contact.tags.as_slice())
        .bind(&contact.provenance.source_file)
        .bind(contact.provenance.ingested_at)
        .fetch_one(&mut *tx)
        .await;

        let id = match inserted {
            Ok(id) => id,
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                tx.rollback().await?;
                return Ok(InsertOutcome::DuplicatePhone);
            }
            Err(err) => return Err(err.into()),
        };

        let updated = sqlx::query(
            "UPDATE contact_profiles SET contact_count = contact_count + 1 WHERE id = $1",
        )
        .bind(contact.profile_id)
        .execute(&mut *tx)
        .await?;
        if updated.rows_affected() == 0 {
            tx.rollback().await?;
            return Err(StoreError::ProfileMissing(contact.profile_id));
        }
        tx.commit().await?;
        Ok(InsertOutcome::Inserted { id })
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    profiles: Vec<SchemaProfile>,
    contacts: Vec<(i64, StructuredContact)>,
}

/// Process-local store with the same uniqueness and counting rules as the Postgres one.
#[derive(Debug, Default)]
pub struct MemoryContactStore {
    state: Mutex<MemoryState>,
    offline: bool,
}

impl MemoryContactStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store whose every call fails as unavailable.
    pub fn offline() -> Self {
        Self {
            offline: true,
            ..Self::default()
        }
    }

    /// Adds an already-stored contact outside of any profile.
    pub async fn seed(&self, company_name: &str, phone_number: Option<&str>) {
        let mut state = self.state.lock().await;
        let id = state.contacts.len() as i64 + 1;
        state.contacts.push((
            id,
            StructuredContact {
                company_name: company_name.to_string(),
                phone_number: phone_number.map(ToString::to_string),
                url: None,
                industry: None,
                is_b2b: None,
                customer_target_segments: None,
                additional_info: Default::default(),
                tags: TagSet::default(),
                profile_id: 0,
                provenance: Provenance {
                    source_file: "seed".to_string(),
                    row_number: 0,
                    ingested_at: Utc::now(),
                },
            },
        ));
    }

    pub async fn contacts(&self) -> Vec<StructuredContact> {
        let state = self.state.lock().await;
        state.contacts.iter().map(|(_, c)| c.clone()).collect()
    }

    pub async fn profiles(&self) -> Vec<SchemaProfile> {
        self.state.lock().await.profiles.clone()
    }

    fn check_online(&self) -> Result<(), StoreError> {
        if self.offline {
            Err(StoreError::Unavailable(sqlx::Error::PoolClosed))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl ContactStore for MemoryContactStore {
    async fn get_or_create_profile(&self, keys: &ProfileKeys) -> Result<SchemaProfile, StoreError> {
        self.check_online()?;
        let mut state = self.state.lock().await;
        if let Some(existing) = state.profiles.iter().find(|p| p.profile_hash == keys.hash()) {
            return Ok(existing.clone());
        }
        let profile = SchemaProfile {
            id: state.profiles.len() as i64 + 1,
            profile_hash: keys.hash().to_string(),
            json_keys: keys.keys().to_vec(),
            contact_count: 0,
            created_at: Utc::now(),
        };
        state.profiles.push(profile.clone());
        Ok(profile)
    }

    async fn existing_contacts(&self) -> Result<ExistingContacts, StoreError> {
        self.check_online()?;
        let state = self.state.lock().await;
        Ok(ExistingContacts {
            phones: state
                .contacts
                .iter()
                .filter_map(|(_, c)| c.phone_number.clone())
                .collect(),
            company_names: state
                .contacts
                .iter()
                .map(|(_, c)| c.company_name.clone())
                .collect(),
        })
    }

    async fn insert_contact(
        &self,
        contact: &StructuredContact,
    ) -> Result<InsertOutcome, StoreError> {
        self.check_online()?;
        let mut state = self.state.lock().await;
        if let Some(phone) = &contact.phone_number {
            if state
                .contacts
                .iter()
                .any(|(_, c)| c.phone_number.as_ref() == Some(phone))
            {
                return Ok(InsertOutcome::DuplicatePhone);
            }
        }
        let profile = state
            .profiles
            .iter_mut()
            .find(|p| p.id == contact.profile_id)
            .ok_or(StoreError::ProfileMissing(contact.profile_id))?;
        profile.contact_count += 1;
        let id = state.contacts.len() as i64 + 1;
        state.contacts.push((id, contact.clone()));
        Ok(InsertOutcome::Inserted { id })
    }
}

/// Terminal destinations for withheld records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SinkKind {
    Review,
    Dropped,
    Invalid,
    ExistingPhone,
}

impl SinkKind {
    fn file_prefix(self) -> &'static str {
        match self {
            SinkKind::Review => "review",
            SinkKind::Dropped => "duplicates",
            SinkKind::Invalid => "invalid",
            SinkKind::ExistingPhone => "existing",
        }
    }
}

/// One withheld record as written to a sink file.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SinkRow {
    pub disposition: String,
    pub reason: Option<String>,
    pub matched_existing_key: Option<String>,
    pub score: Option<f64>,
    pub source_file: String,
    pub row_number: usize,
    pub company_name: Option<String>,
    pub phone_number: Option<String>,
    pub url: Option<String>,
    pub industry: Option<String>,
    pub is_b2b: Option<bool>,
    pub customer_target_segments: Option<String>,
    pub tags: String,
    pub profile_id: i64,
    pub ingested_at: String,
    pub additional_info: String,
}

impl SinkRow {
    pub fn new(draft: &ContactDraft, disposition: &Disposition) -> Result<Self, StoreError> {
        Ok(Self {
            disposition: disposition.kind().to_string(),
            reason: disposition.reason().map(ToString::to_string),
            matched_existing_key: disposition.matched_existing_key().map(ToString::to_string),
            score: disposition.score(),
            source_file: draft.provenance.source_file.clone(),
            row_number: draft.provenance.row_number,
            company_name: draft.company_name.clone(),
            phone_number: draft.phone_number.clone(),
            url: draft.url.clone(),
            industry: draft.industry.clone(),
            is_b2b: draft.is_b2b,
            customer_target_segments: draft.customer_target_segments.clone(),
            tags: draft.tags.as_slice().join(";"),
            profile_id: draft.profile_id,
            ingested_at: draft.provenance.ingested_at.to_rfc3339(),
            additional_info: serde_json::to_string(&draft.additional_info)?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct SinkDirectories {
    pub review: PathBuf,
    pub dropped: PathBuf,
    pub invalid: PathBuf,
}

#[derive(Debug, Clone)]
pub struct SinkWriter {
    dirs: SinkDirectories,
}

impl SinkWriter {
    pub fn new(dirs: SinkDirectories) -> Self {
        Self { dirs }
    }

    pub fn directory(&self, kind: SinkKind) -> &Path {
        match kind {
            SinkKind::Review => &self.dirs.review,
            SinkKind::Dropped | SinkKind::ExistingPhone => &self.dirs.dropped,
            SinkKind::Invalid => &self.dirs.invalid,
        }
    }

    /// Writes `rows` as CSV via a temp file and atomic rename. Writes nothing for no rows.
    pub async fn write(
        &self,
        kind: SinkKind,
        source_file: &str,
        stamp: DateTime<Utc>,
        rows: &[SinkRow],
    ) -> anyhow::Result<Option<PathBuf>> {
        if rows.is_empty() {
            return Ok(None);
        }
        let mut writer = csv::Writer::from_writer(Vec::new());
        for row in rows {
            writer.serialize(row).context("serializing sink row")?;
        }
        let bytes = writer
            .into_inner()
            .map_err(|err| anyhow::anyhow!("flushing sink rows: {}", err.error()))?;

        let dir = self.directory(kind);
        fs::create_dir_all(dir)
            .await
            .with_context(|| format!("creating sink directory {}", dir.display()))?;

        let stem = Path::new(source_file)
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| source_file.to_string());
        let base = format!("{}_{}_{}", kind.file_prefix(), stem, stamp.format("%Y%m%d_%H%M%S"));
        let mut target = dir.join(format!("{base}.csv"));
        let mut n = 1;
        while fs::try_exists(&target)
            .await
            .with_context(|| format!("checking sink path {}", target.display()))?
        {
            target = dir.join(format!("{base}_{n}.csv"));
            n += 1;
        }

        let temp_path = dir.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp sink file {}", temp_path.display()))?;
        file.write_all(&bytes)
            .await
            .with_context(|| format!("writing temp sink file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp sink file {}", temp_path.display()))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &target).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| {
                format!(
                    "atomically renaming temp sink {} -> {}",
                    temp_path.display(),
                    target.display()
                )
            });
        }
        info!(kind = ?kind, rows = rows.len(), path = %target.display(), "wrote sink file");
        Ok(Some(target))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use tempfile::tempdir;

    fn contact(name: &str, phone: Option<&str>, profile_id: i64) -> StructuredContact {
        StructuredContact {
            company_name: name.to_string(),
            phone_number: phone.map(ToString::to_string),
            url: None,
            industry: None,
            is_b2b: Some(true),
            customer_target_segments: None,
            additional_info: BTreeMap::from([("City".to_string(), JsonValue::from("Oslo"))]),
            tags: TagSet::from_labels(["q3"]),
            profile_id,
            provenance: Provenance {
                source_file: "leads.csv".into(),
                row_number: 4,
                ingested_at: DateTime::parse_from_rfc3339("2026-02-24T12:00:00Z")
                    .expect("ts")
                    .with_timezone(&Utc),
            },
        }
    }

    #[test]
    fn sha256_hashing_is_stable() {
        assert_eq!(
            sha256_hex(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn profile_hash_ignores_order_and_repeats() {
        let a = ProfileKeys::from_columns(["A", "B"]);
        let b = ProfileKeys::from_columns(["B", "A", "A"]);
        assert_eq!(a, b);
        assert_eq!(a.keys(), &["A".to_string(), "B".to_string()]);

        let c = ProfileKeys::from_columns(["A", "B", "C"]);
        assert_ne!(a.hash(), c.hash());
        let joined = ProfileKeys::from_columns(["AB"]);
        assert_ne!(a.hash(), joined.hash());
    }

    #[tokio::test]
    async fn memory_store_profiles_are_created_once() {
        let store = MemoryContactStore::new();
        let keys = ProfileKeys::from_columns(["Company", "Website"]);
        let first = store.get_or_create_profile(&keys).await.expect("create");
        let again = store.get_or_create_profile(&keys).await.expect("lookup");
        assert_eq!(first, again);
        assert_eq!(first.contact_count, 0);
        assert_eq!(store.profiles().await.len(), 1);
    }

    #[tokio::test]
    async fn memory_store_enforces_unique_phone_and_counts() {
        let store = MemoryContactStore::new();
        let profile = store
            .get_or_create_profile(&ProfileKeys::from_columns(["Company"]))
            .await
            .expect("profile");

        let first = store
            .insert_contact(&contact("Acme", Some("555"), profile.id))
            .await
            .expect("insert");
        assert_eq!(first, InsertOutcome::Inserted { id: 1 });
        let clash = store
            .insert_contact(&contact("Acme Again", Some("555"), profile.id))
            .await
            .expect("insert");
        assert_eq!(clash, InsertOutcome::DuplicatePhone);
        store
            .insert_contact(&contact("No Phone", None, profile.id))
            .await
            .expect("insert");
        store
            .insert_contact(&contact("No Phone Either", None, profile.id))
            .await
            .expect("insert");

        assert_eq!(store.profiles().await[0].contact_count, 3);
        let existing = store.existing_contacts().await.expect("existing");
        assert_eq!(existing.phones, vec!["555".to_string()]);
        assert_eq!(existing.company_names.len(), 3);

        let missing = store.insert_contact(&contact("Orphan", Some("1"), 99)).await;
        assert!(matches!(missing, Err(StoreError::ProfileMissing(99))));
    }

    #[tokio::test]
    async fn offline_store_is_unavailable() {
        let store = MemoryContactStore::offline();
        let err = store.existing_contacts().await.expect_err("offline");
        assert!(matches!(err, StoreError::Unavailable(_)));
    }

    #[test]
    fn contact_export_flattens_tags_and_extra_columns() {
        let created_at = DateTime::parse_from_rfc3339("2026-02-24T12:00:00Z")
            .expect("ts")
            .with_timezone(&Utc);
        let audit = ContactAudit {
            id: 7,
            company_name: "Acme, Inc".into(),
            phone_number: Some("5551234".into()),
            url: None,
            industry: Some("Retail".into()),
            is_b2b: Some(false),
            customer_target_segments: None,
            profile_id: Some(2),
            status: "used".into(),
            tags: vec!["q3".into(), "used".into()],
            source_file: Some("leads.csv".into()),
            last_used: None,
            created_at,
            additional_info: serde_json::json!({"City": "Oslo"}),
        };
        let bytes = contacts_csv(std::slice::from_ref(&audit)).expect("csv");

        let mut reader = csv::Reader::from_reader(bytes.as_slice());
        let headers = reader.headers().expect("headers").clone();
        assert_eq!(&headers[0], "id");
        assert_eq!(headers.len(), 14);
        let record = reader.records().next().expect("row").expect("record");
        let get = |name: &str| {
            let idx = headers.iter().position(|h| h == name).expect("column");
            record.get(idx).expect("cell").to_string()
        };
        assert_eq!(get("company_name"), "Acme, Inc");
        assert_eq!(get("tags"), "q3;used");
        assert_eq!(get("is_b2b"), "false");
        assert_eq!(get("last_used"), "");
        assert_eq!(get("created_at"), "2026-02-24T12:00:00+00:00");
        assert_eq!(get("additional_info"), r#"{"City":"Oslo"}"#);

        assert!(contacts_csv(&[]).expect("empty").is_empty());
    }

    #[tokio::test]
    async fn sink_writes_csv_atomically_and_skips_empty() {
        let dir = tempdir().expect("tempdir");
        let writer = SinkWriter::new(SinkDirectories {
            review: dir.path().join("review"),
            dropped: dir.path().join("dropped"),
            invalid: dir.path().join("invalid"),
        });
        let stamp = Utc::now();
        let draft = ContactDraft::from(contact("Acme Inc", Some("5551234"), 1));
        let row = SinkRow::new(
            &draft,
            &Disposition::NeedsReview {
                reason: cetl_core::FUZZY_COMPANY_MATCH.into(),
                matched_existing_key: "ACME INC.".into(),
                score: 100.0,
            },
        )
        .expect("row");

        let none = writer
            .write(SinkKind::Review, "leads.csv", stamp, &[])
            .await
            .expect("empty");
        assert!(none.is_none());

        let first = writer
            .write(SinkKind::Review, "leads.csv", stamp, std::slice::from_ref(&row))
            .await
            .expect("write")
            .expect("path");
        let second = writer
            .write(SinkKind::Review, "leads.csv", stamp, std::slice::from_ref(&row))
            .await
            .expect("write")
            .expect("path");
        assert_ne!(first, second);
        assert!(first.starts_with(dir.path().join("review")));
        assert!(first
            .file_name()
            .expect("name")
            .to_string_lossy()
            .starts_with("review_leads_"));

        let mut reader = csv::Reader::from_path(&first).expect("reader");
        let headers = reader.headers().expect("headers").clone();
        let record = reader.records().next().expect("row").expect("record");
        let get = |name: &str| {
            let idx = headers.iter().position(|h| h == name).expect("column");
            record.get(idx).expect("cell").to_string()
        };
        assert_eq!(get("disposition"), "needs_review");
        assert_eq!(get("matched_existing_key"), "ACME INC.");
        assert_eq!(get("score"), "100.0");
        assert_eq!(get("tags"), "q3");
        assert_eq!(get("additional_info"), r#"{"City":"Oslo"}"#);
        assert_eq!(get("row_number"), "4");
    }
}
