//! Source-file extraction, source-profile selection, field promotion and record normalization.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use cetl_core::{
    first_wins, unique_column_names, ContactDraft, PromotionRuleSet, Provenance, RawRecord,
    TagSet, TargetField,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, info, warn};

pub const CRATE_NAME: &str = "cetl-adapters";

/// Columns searched, in order, when collecting phone numbers from status-update CSVs.
pub const PHONE_LIST_COLUMNS: [&str; 2] = ["Company Phone", "Number"];

const DELIMITER_CANDIDATES: [u8; 4] = [b'\t', b';', b',', b'|'];
const SECOND_LEVEL_SUFFIXES: [&str; 7] = ["co", "com", "org", "net", "gov", "edu", "ac"];

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing {path}: {source}")]
    Csv {
        path: String,
        #[source]
        source: csv::Error,
    },
    #[error("{path} is not valid UTF-8 (first bad byte at offset {valid_up_to})")]
    Encoding { path: String, valid_up_to: usize },
    #[error("{path} has no header row")]
    EmptyHeader { path: String },
}

/// All rows of one source file. `headers` are the resolved column names every record carries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedFile {
    pub file_name: String,
    pub headers: Vec<String>,
    pub records: Vec<RawRecord>,
}

/// `*.csv` files directly under `dir`, sorted by file name. A missing directory yields none.
pub fn discover_source_files(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        warn!(dir = %dir.display(), "source directory not found");
        return Ok(Vec::new());
    }
    let mut files = fs::read_dir(dir)
        .with_context(|| format!("reading {}", dir.display()))?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            path.is_file()
                && path
                    .extension()
                    .map(|ext| ext.eq_ignore_ascii_case("csv"))
                    .unwrap_or(false)
        })
        .collect::<Vec<_>>();
    files.sort();
    info!(dir = %dir.display(), count = files.len(), "discovered source files");
    Ok(files)
}

pub fn extract_file(path: &Path) -> Result<ExtractedFile, ExtractError> {
    let bytes = fs::read(path).map_err(|source| ExtractError::Io {
        path: path.display().to_string(),
        source,
    })?;
    let content = String::from_utf8(bytes).map_err(|err| ExtractError::Encoding {
        path: path.display().to_string(),
        valid_up_to: err.utf8_error().valid_up_to(),
    })?;
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string());
    extract_from_str(&file_name, &content)
}

/// Parses delimited text with a header row. Every record gets the same columns: blank headers
/// and cells past the last header take positional `column_<n>` names, repeated names get a `.N`
/// suffix, and short rows are padded with blanks.
pub fn extract_from_str(file_name: &str, content: &str) -> Result<ExtractedFile, ExtractError> {
    let content = content.strip_prefix('\u{feff}').unwrap_or(content);
    let delimiter = sniff_delimiter(content);
    let csv_err = |source| ExtractError::Csv {
        path: file_name.to_string(),
        source,
    };

    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .has_headers(true)
        .flexible(true)
        .from_reader(content.as_bytes());

    let headers = reader
        .headers()
        .map_err(csv_err)?
        .iter()
        .map(|h| h.trim().to_string())
        .collect::<Vec<_>>();
    if headers.iter().all(|h| h.is_empty()) {
        return Err(ExtractError::EmptyHeader {
            path: file_name.to_string(),
        });
    }

    let rows = reader
        .records()
        .collect::<Result<Vec<_>, _>>()
        .map_err(csv_err)?;
    let width = rows.iter().map(|r| r.len()).fold(headers.len(), usize::max);
    let positional = (0..width)
        .map(|i| match headers.get(i) {
            Some(h) if !h.is_empty() => h.clone(),
            _ => format!("column_{}", i + 1),
        })
        .collect::<Vec<_>>();
    let columns = unique_column_names(&positional);

    let records = rows
        .iter()
        .enumerate()
        .map(|(index, row)| {
            let cells = columns
                .iter()
                .enumerate()
                .map(|(i, column)| (column.clone(), row.get(i).unwrap_or_default().to_string()));
            RawRecord::from_cells(index + 1, cells)
        })
        .collect::<Vec<_>>();

    debug!(
        file = file_name,
        delimiter = %(delimiter as char),
        rows = records.len(),
        "extracted rows"
    );
    Ok(ExtractedFile {
        file_name: file_name.to_string(),
        headers: columns,
        records,
    })
}

/// Picks the delimiter that yields the most consistent multi-field split over the first lines.
fn sniff_delimiter(content: &str) -> u8 {
    let sample_lines: Vec<&str> = content.lines().take(10).collect();
    let mut best = b',';
    let mut best_score = 0u64;

    for &delim in &DELIMITER_CANDIDATES {
        let counts: Vec<usize> = sample_lines
            .iter()
            .map(|line| {
                csv::ReaderBuilder::new()
                    .delimiter(delim)
                    .has_headers(false)
                    .flexible(true)
                    .from_reader(line.as_bytes())
                    .records()
                    .next()
                    .and_then(|r| r.ok())
                    .map(|r| r.len())
                    .unwrap_or(1)
            })
            .collect();

        let Some(&target) = counts.first() else {
            continue;
        };
        if target <= 1 {
            continue;
        }
        let consistent = counts.iter().filter(|&&c| c == target).count() as u64;
        let score = consistent * target as u64;
        if score > best_score {
            best_score = score;
            best = delim;
        }
    }

    best
}

/// Named promotion rules plus the file-name fragment that selects them.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SourceProfileConfig {
    #[serde(default)]
    pub file_name_contains: String,
    #[serde(default)]
    pub promotion_rules: PromotionRuleSet,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceProfile {
    pub name: String,
    pub file_name_contains: String,
    pub rules: PromotionRuleSet,
}

/// Rules chosen for a file.
#[derive(Debug, Clone, Copy)]
pub struct SelectedRules<'a> {
    pub profile_name: &'a str,
    pub rules: &'a PromotionRuleSet,
}

/// Source profiles in declaration order, resolved once at startup.
#[derive(Debug, Clone, Default)]
pub struct SourceProfiles {
    profiles: Vec<SourceProfile>,
    empty: PromotionRuleSet,
}

impl SourceProfiles {
    pub const DEFAULT_PROFILE: &'static str = "default";

    pub fn new(profiles: Vec<SourceProfile>) -> Self {
        Self {
            profiles,
            empty: PromotionRuleSet::default(),
        }
    }

    pub fn profiles(&self) -> &[SourceProfile] {
        &self.profiles
    }

    /// First profile whose non-empty `file_name_contains` occurs in `file_name`, then the
    /// `default` profile, then an empty rule set.
    pub fn select(&self, file_name: &str) -> SelectedRules<'_> {
        let matched = self
            .profiles
            .iter()
            .find(|p| {
                !p.file_name_contains.is_empty() && file_name.contains(&p.file_name_contains)
            })
            .or_else(|| {
                self.profiles
                    .iter()
                    .find(|p| p.name == Self::DEFAULT_PROFILE)
            });
        match matched {
            Some(profile) => SelectedRules {
                profile_name: &profile.name,
                rules: &profile.rules,
            },
            None => SelectedRules {
                profile_name: "none",
                rules: &self.empty,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromotedValue {
    pub source_column: String,
    pub value: String,
}

/// Promoted target fields plus every source column no rule consumed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Promotion {
    pub fields: BTreeMap<TargetField, PromotedValue>,
    pub residual: BTreeMap<String, JsonValue>,
}

impl Promotion {
    pub fn value(&self, field: TargetField) -> Option<&str> {
        self.fields.get(&field).map(|p| p.value.as_str())
    }

    pub fn consumed_columns(&self) -> BTreeSet<&str> {
        self.fields
            .values()
            .map(|p| p.source_column.as_str())
            .collect()
    }
}

/// Splits `raw` into promoted fields and a residual map. For each target the first candidate
/// column present with a non-blank value wins; a target with no winner stays absent.
pub fn promote(raw: &RawRecord, rules: &PromotionRuleSet) -> Promotion {
    // every present, non-blank candidate in rule order; the first offer per target wins
    let offers = rules.iter().flat_map(|(target, candidates)| {
        candidates
            .iter()
            .filter_map(move |column| {
                raw.non_blank(column).map(|value| (target, column, value))
            })
    });
    let winners = first_wins(offers, |(target, _, _)| Some(*target));
    let fields: BTreeMap<TargetField, PromotedValue> = winners
        .kept
        .into_iter()
        .map(|(target, column, value)| {
            (
                target,
                PromotedValue {
                    source_column: column.clone(),
                    value: value.to_string(),
                },
            )
        })
        .collect();

    let consumed: BTreeSet<&str> = fields
        .values()
        .map(|p: &PromotedValue| p.source_column.as_str())
        .collect();
    let residual = raw
        .cells()
        .iter()
        .filter(|(column, _)| !consumed.contains(column.as_str()))
        .map(|(column, value)| {
            let value = if value.trim().is_empty() {
                JsonValue::Null
            } else {
                JsonValue::String(value.clone())
            };
            (column.clone(), value)
        })
        .collect();

    Promotion { fields, residual }
}

/// Keeps digits and a leading `+`; no digits at all means absent.
pub fn normalize_phone(raw: &str) -> Option<String> {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        if ch.is_ascii_digit() {
            out.push(ch);
        } else if ch == '+' && out.is_empty() {
            out.push(ch);
        }
    }
    if out.chars().any(|c| c.is_ascii_digit()) {
        Some(out)
    } else {
        None
    }
}

pub fn normalize_text(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// yes/true/1 and no/false/0, case-insensitive; anything else is unknown.
pub fn parse_tristate(raw: Option<&str>) -> Option<bool> {
    match raw?.trim().to_ascii_lowercase().as_str() {
        "yes" | "true" | "1" => Some(true),
        "no" | "false" | "0" => Some(false),
        _ => None,
    }
}

/// Company name guessed from the registrable part of a URL's host:
/// `https://www.acme-tools.co.uk/about` -> `Acme Tools`.
pub fn company_name_from_url(url: &str) -> Option<String> {
    let trimmed = url.trim();
    let without_scheme = match trimmed.find("://") {
        Some(i) => &trimmed[i + 3..],
        None => trimmed,
    };
    let authority = without_scheme.split(['/', '?', '#']).next()?;
    let host = authority.rsplit('@').next()?;
    let host = host
        .split(':')
        .next()?
        .trim_end_matches('.')
        .to_ascii_lowercase();
    let host = host.strip_prefix("www.").unwrap_or(&host);

    let mut labels: Vec<&str> = host.split('.').filter(|l| !l.is_empty()).collect();
    if labels.len() < 2 {
        return None;
    }
    labels.pop();
    if labels.len() > 1 && labels.last().is_some_and(|l| SECOND_LEVEL_SUFFIXES.contains(l)) {
        labels.pop();
    }
    let name = labels.last()?;
    if name.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    title_case(name)
}

fn title_case(label: &str) -> Option<String> {
    let words = label
        .split(['-', '_'])
        .filter(|w| !w.is_empty())
        .map(|w| {
            let mut chars = w.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>();
    if words.is_empty() {
        None
    } else {
        Some(words.join(" "))
    }
}

/// Normalized promoted values, before a contact is validated.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NormalizedFields {
    pub company_name: Option<String>,
    pub phone_number: Option<String>,
    pub url: Option<String>,
    pub industry: Option<String>,
    pub is_b2b: Option<bool>,
    pub customer_target_segments: Option<String>,
}

/// Applies the phone, whitespace and boolean rules and fills a missing company name from the URL.
pub fn normalize(promotion: &Promotion) -> NormalizedFields {
    let text = |field| promotion.value(field).and_then(normalize_text);
    let url = text(TargetField::Url);
    let company_name = text(TargetField::CompanyName).or_else(|| {
        let derived = url.as_deref().and_then(company_name_from_url);
        if let Some(name) = &derived {
            debug!(company = %name, "derived company name from url");
        }
        derived
    });

    NormalizedFields {
        company_name,
        phone_number: promotion
            .value(TargetField::PhoneNumber)
            .and_then(normalize_phone),
        url,
        industry: text(TargetField::Industry),
        is_b2b: parse_tristate(promotion.value(TargetField::IsB2b)),
        customer_target_segments: text(TargetField::CustomerTargetSegments),
    }
}

/// Per-file values stamped onto every draft.
#[derive(Debug, Clone, Copy)]
pub struct RecordContext<'a> {
    pub profile_id: i64,
    pub source_file: &'a str,
    pub tags: &'a TagSet,
    pub ingested_at: DateTime<Utc>,
}

/// Promote, normalize and assemble one raw row.
pub fn build_draft(
    raw: &RawRecord,
    rules: &PromotionRuleSet,
    ctx: RecordContext<'_>,
) -> ContactDraft {
    let promotion = promote(raw, rules);
    let fields = normalize(&promotion);
    ContactDraft {
        company_name: fields.company_name,
        phone_number: fields.phone_number,
        url: fields.url,
        industry: fields.industry,
        is_b2b: fields.is_b2b,
        customer_target_segments: fields.customer_target_segments,
        additional_info: promotion.residual,
        tags: ctx.tags.clone(),
        profile_id: ctx.profile_id,
        provenance: Provenance {
            source_file: ctx.source_file.to_string(),
            row_number: raw.row_number,
            ingested_at: ctx.ingested_at,
        },
    }
}

/// Normalized phone numbers from a plain list (one per line) or from every CSV in a directory.
pub fn collect_phone_numbers(path: &Path) -> Result<BTreeSet<String>> {
    let mut phones = BTreeSet::new();
    if path.is_dir() {
        for file in discover_source_files(path)? {
            let extracted = match extract_file(&file) {
                Ok(extracted) => extracted,
                Err(err) => {
                    warn!(file = %file.display(), error = %err, "skipping unreadable file");
                    continue;
                }
            };
            let Some(column) = PHONE_LIST_COLUMNS
                .iter()
                .find(|c| extracted.headers.iter().any(|h| h.as_str() == **c))
            else {
                warn!(file = %file.display(), "no recognized phone number column");
                continue;
            };
            phones.extend(
                extracted
                    .records
                    .iter()
                    .filter_map(|r| r.get(column))
                    .filter_map(normalize_phone),
            );
        }
    } else {
        let text =
            fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        phones.extend(text.lines().filter_map(normalize_phone));
    }
    info!(path = %path.display(), count = phones.len(), "collected phone numbers");
    Ok(phones)
}
