//! Core domain model for contact ingestion: raw rows, schema profiles, promotion rules,
//! promoted contacts and their dispositions.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::hash::Hash;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

pub const CRATE_NAME: &str = "cetl-core";

pub const MISSING_COMPANY_NAME: &str = "missing_company_name";
pub const FUZZY_COMPANY_MATCH: &str = "fuzzy_company_match";

/// Result of an ordered-priority reduction: the first item seen for each key is kept,
/// every later item with an already-seen key is shadowed. Items without a key are always kept.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirstWins<T> {
    pub kept: Vec<T>,
    pub shadowed: Vec<T>,
}

/// Stable, order-preserving "first occurrence wins" over `items`.
///
/// Used for promotion candidate selection, tag de-duplication and intra-file phone
/// de-duplication.
pub fn first_wins<T, K, I, F>(items: I, mut key: F) -> FirstWins<T>
where
    I: IntoIterator<Item = T>,
    K: Eq + Hash,
    F: FnMut(&T) -> Option<K>,
{
    let mut seen = HashSet::new();
    let mut kept = Vec::new();
    let mut shadowed = Vec::new();
    for item in items {
        match key(&item) {
            Some(k) => {
                if seen.insert(k) {
                    kept.push(item)
                } else {
                    shadowed.push(item)
                }
            }
            None => kept.push(item),
        }
    }
    FirstWins { kept, shadowed }
}

/// Makes column names unique without dropping any: a repeated name gets a `.N` suffix
/// (`Notes`, `Notes.1`, `Notes.2`), skipping suffixed names that are already taken.
pub fn unique_column_names<S: AsRef<str>>(names: &[S]) -> Vec<String> {
    let mut taken: HashSet<String> = HashSet::new();
    let mut repeats: HashMap<&str, usize> = HashMap::new();
    let mut out = Vec::with_capacity(names.len());
    for name in names {
        let name = name.as_ref();
        let resolved = if taken.contains(name) {
            let counter = repeats.entry(name).or_insert(0);
            loop {
                *counter += 1;
                let candidate = format!("{name}.{counter}");
                if !taken.contains(&candidate) && !names.iter().any(|n| n.as_ref() == candidate) {
                    break candidate;
                }
            }
        } else {
            name.to_string()
        };
        taken.insert(resolved.clone());
        out.push(resolved);
    }
    out
}

/// One source row: ordered column name -> raw cell text. Lives only while its file is processed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawRecord {
    pub row_number: usize,
    cells: Vec<(String, String)>,
}

impl RawRecord {
    /// Builds a record from `(column, value)` pairs. Repeated column names are renamed with
    /// [`unique_column_names`], so every cell survives.
    pub fn from_cells(
        row_number: usize,
        cells: impl IntoIterator<Item = (String, String)>,
    ) -> Self {
        let (columns, values): (Vec<String>, Vec<String>) = cells.into_iter().unzip();
        let cells = unique_column_names(&columns).into_iter().zip(values).collect();
        Self { row_number, cells }
    }

    pub fn get(&self, column: &str) -> Option<&str> {
        self.cells
            .iter()
            .find(|(c, _)| c == column)
            .map(|(_, v)| v.as_str())
    }

    /// Value of `column` when present and not blank after trimming.
    pub fn non_blank(&self, column: &str) -> Option<&str> {
        self.get(column).filter(|v| !v.trim().is_empty())
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.cells.iter().map(|(c, _)| c.as_str())
    }

    pub fn cells(&self) -> &[(String, String)] {
        &self.cells
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }
}

/// Identity of a column-name shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaProfile {
    pub id: i64,
    pub profile_hash: String,
    pub json_keys: Vec<String>,
    pub contact_count: i64,
    pub created_at: DateTime<Utc>,
}

/// Structured columns a promotion rule may target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetField {
    CompanyName,
    Url,
    PhoneNumber,
    Industry,
    IsB2b,
    CustomerTargetSegments,
}

impl TargetField {
    pub const ALL: [TargetField; 6] = [
        TargetField::CompanyName,
        TargetField::Url,
        TargetField::PhoneNumber,
        TargetField::Industry,
        TargetField::IsB2b,
        TargetField::CustomerTargetSegments,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TargetField::CompanyName => "company_name",
            TargetField::Url => "url",
            TargetField::PhoneNumber => "phone_number",
            TargetField::Industry => "industry",
            TargetField::IsB2b => "is_b2b",
            TargetField::CustomerTargetSegments => "customer_target_segments",
        }
    }
}

impl fmt::Display for TargetField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Target field -> candidate source columns in priority order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PromotionRuleSet {
    rules: BTreeMap<TargetField, Vec<String>>,
}

impl PromotionRuleSet {
    pub fn new(rules: BTreeMap<TargetField, Vec<String>>) -> Self {
        Self { rules }
    }

    pub fn with_rule<S: Into<String>>(
        mut self,
        field: TargetField,
        candidates: impl IntoIterator<Item = S>,
    ) -> Self {
        self.rules
            .insert(field, candidates.into_iter().map(Into::into).collect());
        self
    }

    /// Candidates for `field`; empty when the field has no rule or a rule with no candidates.
    pub fn candidates(&self, field: TargetField) -> &[String] {
        self.rules.get(&field).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn iter(&self) -> impl Iterator<Item = (TargetField, &[String])> {
        self.rules.iter().map(|(f, c)| (*f, c.as_slice()))
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// Ordered, duplicate-free batch labels.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TagSet(Vec<String>);

impl TagSet {
    pub fn from_labels<S: Into<String>>(labels: impl IntoIterator<Item = S>) -> Self {
        let labels = labels
            .into_iter()
            .map(Into::into)
            .map(|l: String| l.trim().to_string())
            .filter(|l| !l.is_empty());
        Self(first_wins(labels, |l| Some(l.clone())).kept)
    }

    pub fn as_slice(&self) -> &[String] {
        &self.0
    }

    pub fn contains(&self, label: &str) -> bool {
        self.0.iter().any(|l| l == label)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Where a contact came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provenance {
    pub source_file: String,
    pub row_number: usize,
    pub ingested_at: DateTime<Utc>,
}

/// A normalized row whose company name may still be missing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContactDraft {
    pub company_name: Option<String>,
    pub phone_number: Option<String>,
    pub url: Option<String>,
    pub industry: Option<String>,
    pub is_b2b: Option<bool>,
    pub customer_target_segments: Option<String>,
    pub additional_info: BTreeMap<String, JsonValue>,
    pub tags: TagSet,
    pub profile_id: i64,
    pub provenance: Provenance,
}

impl ContactDraft {
    /// Promotes the draft to a contact; hands the draft back when no company name is present.
    pub fn into_contact(self) -> Result<StructuredContact, ContactDraft> {
        let company_name = match &self.company_name {
            Some(name) if !name.trim().is_empty() => name.clone(),
            _ => return Err(self),
        };
        Ok(StructuredContact {
            company_name,
            phone_number: self.phone_number,
            url: self.url,
            industry: self.industry,
            is_b2b: self.is_b2b,
            customer_target_segments: self.customer_target_segments,
            additional_info: self.additional_info,
            tags: self.tags,
            profile_id: self.profile_id,
            provenance: self.provenance,
        })
    }
}

/// Canonical output unit. Never mutated after construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructuredContact {
    pub company_name: String,
    pub phone_number: Option<String>,
    pub url: Option<String>,
    pub industry: Option<String>,
    pub is_b2b: Option<bool>,
    pub customer_target_segments: Option<String>,
    pub additional_info: BTreeMap<String, JsonValue>,
    pub tags: TagSet,
    pub profile_id: i64,
    pub provenance: Provenance,
}

impl From<StructuredContact> for ContactDraft {
    fn from(contact: StructuredContact) -> Self {
        Self {
            company_name: Some(contact.company_name),
            phone_number: contact.phone_number,
            url: contact.url,
            industry: contact.industry,
            is_b2b: contact.is_b2b,
            customer_target_segments: contact.customer_target_segments,
            additional_info: contact.additional_info,
            tags: contact.tags,
            profile_id: contact.profile_id,
            provenance: contact.provenance,
        }
    }
}

/// Classification outcome; exactly one per record and it decides routing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Disposition {
    Unique,
    DroppedIntraFileDuplicate,
    /// Phone number already stored; a certain duplicate, never loaded or reviewed.
    RejectedExistingPhone { phone_number: String },
    NeedsReview {
        reason: String,
        matched_existing_key: String,
        score: f64,
    },
    Invalid { reason: String },
    /// Unique-constraint conflict at insert time.
    DuplicateAtLoad,
}

impl Disposition {
    pub fn kind(&self) -> &'static str {
        match self {
            Disposition::Unique => "unique",
            Disposition::DroppedIntraFileDuplicate => "dropped_intra_file_duplicate",
            Disposition::RejectedExistingPhone { .. } => "rejected_existing_phone",
            Disposition::NeedsReview { .. } => "needs_review",
            Disposition::Invalid { .. } => "invalid",
            Disposition::DuplicateAtLoad => "duplicate_at_load",
        }
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            Disposition::NeedsReview { reason, .. } | Disposition::Invalid { reason } => {
                Some(reason.as_str())
            }
            _ => None,
        }
    }

    pub fn matched_existing_key(&self) -> Option<&str> {
        match self {
            Disposition::NeedsReview {
                matched_existing_key,
                ..
            } => Some(matched_existing_key.as_str()),
            Disposition::RejectedExistingPhone { phone_number } => Some(phone_number.as_str()),
            _ => None,
        }
    }

    pub fn score(&self) -> Option<f64> {
        match self {
            Disposition::NeedsReview { score, .. } => Some(*score),
            _ => None,
        }
    }

    pub fn is_unique(&self) -> bool {
        matches!(self, Disposition::Unique)
    }
}

/// Existing-store keys used for cross-store de-duplication.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExistingContacts {
    pub phones: Vec<String>,
    pub company_names: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_wins_keeps_order_and_keyless_items() {
        let items = vec![("555", 1), ("", 2), ("555", 3), ("999", 4), ("", 5)];
        let out = first_wins(items, |(k, _)| (!k.is_empty()).then(|| k.to_string()));
        assert_eq!(out.kept, vec![("555", 1), ("", 2), ("999", 4), ("", 5)]);
        assert_eq!(out.shadowed, vec![("555", 3)]);
    }

    #[test]
    fn first_wins_shadows_every_repeat_of_a_key() {
        let out = first_wins(vec!["a", "b", "a", "a", "b"], |s| Some(*s));
        assert_eq!(out.kept, vec!["a", "b"]);
        assert_eq!(out.shadowed, vec!["a", "a", "b"]);
    }

    #[test]
    fn raw_record_renames_repeated_headers() {
        let raw = RawRecord::from_cells(
            1,
            vec![
                ("Company".to_string(), "Acme".to_string()),
                ("Phone".to_string(), "  ".to_string()),
                ("Company".to_string(), "Other".to_string()),
            ],
        );
        assert_eq!(raw.len(), 3);
        assert_eq!(raw.get("Company"), Some("Acme"));
        assert_eq!(raw.get("Company.1"), Some("Other"));
        assert_eq!(raw.get("Phone"), Some("  "));
        assert_eq!(raw.non_blank("Phone"), None);
    }

    #[test]
    fn unique_column_names_skips_taken_suffixes() {
        let names = ["Notes", "Notes", "Notes.1", "Notes", "Id"];
        assert_eq!(
            unique_column_names(&names),
            vec!["Notes", "Notes.2", "Notes.1", "Notes.3", "Id"]
        );
    }

    #[test]
    fn tag_set_is_ordered_and_duplicate_free() {
        let tags = TagSet::from_labels(["b", "a", " b ", "", "c"]);
        assert_eq!(tags.as_slice(), &["b", "a", "c"]);
        assert!(tags.contains("a"));
    }

    #[test]
    fn rule_set_deserializes_typed_targets() {
        let rules: PromotionRuleSet = serde_json::from_str(
            r#"{"company_name": ["Company", "Company Name"], "is_b2b": []}"#,
        )
        .expect("rules");
        assert_eq!(
            rules.candidates(TargetField::CompanyName),
            &["Company".to_string(), "Company Name".to_string()]
        );
        assert!(rules.candidates(TargetField::IsB2b).is_empty());
        assert!(rules.candidates(TargetField::Url).is_empty());

        let unknown = serde_json::from_str::<PromotionRuleSet>(r#"{"nickname": ["X"]}"#);
        assert!(unknown.is_err());
    }

    #[test]
    fn draft_without_company_is_handed_back() {
        let draft = ContactDraft {
            company_name: Some("   ".into()),
            phone_number: Some("555".into()),
            url: None,
            industry: None,
            is_b2b: None,
            customer_target_segments: None,
            additional_info: BTreeMap::new(),
            tags: TagSet::default(),
            profile_id: 1,
            provenance: Provenance {
                source_file: "a.csv".into(),
                row_number: 1,
                ingested_at: Utc::now(),
            },
        };
        let back = draft.clone().into_contact().expect_err("invalid");
        assert_eq!(back, draft);
    }

    #[test]
    fn disposition_accessors() {
        let d = Disposition::NeedsReview {
            reason: FUZZY_COMPANY_MATCH.into(),
            matched_existing_key: "ACME INC.".into(),
            score: 100.0,
        };
        assert_eq!(d.kind(), "needs_review");
        assert_eq!(d.reason(), Some(FUZZY_COMPANY_MATCH));
        assert_eq!(d.matched_existing_key(), Some("ACME INC."));
        assert_eq!(d.score(), Some(100.0));
        assert!(!d.is_unique());
        assert!(Disposition::Unique.is_unique());
    }
}
