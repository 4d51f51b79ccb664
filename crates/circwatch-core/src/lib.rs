//! Core domain model for circwatch: listing candidates, catalog entries and
//! the title identity used to deduplicate them.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};

pub const CRATE_NAME: &str = "circwatch-core";

/// One row scraped from the listing page, before any detail-page work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    pub date: String,
    pub title: String,
    pub link: String,
}

impl Candidate {
    pub fn new(date: impl Into<String>, title: impl Into<String>, link: impl Into<String>) -> Self {
        Self {
            date: date.into(),
            title: title.into(),
            link: link.into(),
        }
    }

    pub fn dedup_key(&self) -> String {
        normalize_title(&self.title)
    }
}

/// Download flag persisted as the literal `yes` / `no`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PdfStatus {
    Downloaded,
    #[default]
    NotDownloaded,
}

impl PdfStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PdfStatus::Downloaded => "yes",
            PdfStatus::NotDownloaded => "no",
        }
    }

    pub fn is_downloaded(self) -> bool {
        matches!(self, PdfStatus::Downloaded)
    }

    pub fn parse(value: &str) -> Self {
        if value.trim().eq_ignore_ascii_case("yes") {
            PdfStatus::Downloaded
        } else {
            PdfStatus::NotDownloaded
        }
    }
}

impl Serialize for PdfStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for PdfStatus {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(PdfStatus::parse(&raw))
    }
}

/// A recorded publication. Every field serializes as text so the same shape
/// feeds both the delimited catalog and the JSON new-entries artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Entry {
    pub id: String,
    pub date: String,
    pub title: String,
    pub link: String,
    pub pdf_link: String,
    pub pdf_filename: String,
    pub pdf_downloaded: PdfStatus,
    pub created_at: String,
    pub source_commit: String,
}

impl Entry {
    /// Degraded entry: nothing resolved, nothing downloaded.
    pub fn from_candidate(candidate: &Candidate) -> Self {
        Self {
            date: candidate.date.clone(),
            title: candidate.title.clone(),
            link: candidate.link.clone(),
            ..Default::default()
        }
    }

    pub fn dedup_key(&self) -> String {
        normalize_title(&self.title)
    }

    /// Stamps snapshot-merge provenance: id, creation time and commit.
    pub fn with_provenance(mut self, created_at: DateTime<Utc>, source_commit: Option<&str>) -> Self {
        self.id = entry_id(&self.date, &self.title, &self.link);
        self.created_at = format_created_at(created_at);
        self.source_commit = source_commit.unwrap_or_default().to_string();
        self
    }
}

/// Dedup key: surrounding whitespace trimmed, case folded.
///
/// Catalog loading and candidate filtering must both go through this.
pub fn normalize_title(title: &str) -> String {
    title.trim().to_lowercase()
}

/// Collapses every whitespace run (including newlines) to one space and trims.
pub fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Deterministic identifier over `date|title|link`.
pub fn entry_id(date: &str, title: &str, link: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("{date}|{title}|{link}").as_bytes());
    hex::encode(hasher.finalize())
}

pub fn format_created_at(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Secs, true)
}
