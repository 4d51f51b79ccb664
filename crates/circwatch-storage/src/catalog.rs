//! File-backed catalog persistence.
//!
//! Two policies share one [`CatalogRepository`] contract:
//!
//! - [`SnapshotMergeCatalog`] loads the whole catalog and buffers accepted
//!   entries in memory. On commit it emits the new batch as a JSON array, then
//!   rewrites the catalog atomically. A crash or failed write before that
//!   last step leaves the previous catalog untouched.
//! - [`AppendOnlyCatalog`] appends and flushes one row per accepted entry.
//!   A crash loses at most the in-flight entry.

use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

use circwatch_core::{Entry, PdfStatus};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::filename::safe_pdf_filename;
use crate::write_atomic;

pub const SNAPSHOT_DELIMITER: u8 = b'|';
pub const SNAPSHOT_HEADER: [&str; 9] = [
    "id",
    "date",
    "title",
    "link",
    "pdf_link",
    "pdf_filename",
    "pdf_downloaded",
    "created_at",
    "source_commit",
];
pub const APPEND_HEADER: [&str; 6] = [
    "date",
    "title",
    "link",
    "pdf_link",
    "pdf_filename",
    "pdf_downloaded",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PersistenceMode {
    #[default]
    SnapshotMerge,
    AppendOnly,
}

impl PersistenceMode {
    pub fn as_str(self) -> &'static str {
        match self {
            PersistenceMode::SnapshotMerge => "snapshot-merge",
            PersistenceMode::AppendOnly => "append-only",
        }
    }
}

impl std::str::FromStr for PersistenceMode {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "snapshot-merge" | "snapshot" => Ok(PersistenceMode::SnapshotMerge),
            "append-only" | "append" => Ok(PersistenceMode::AppendOnly),
            other => Err(format!("unknown persistence mode `{other}`")),
        }
    }
}

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("catalog io at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("catalog csv at {path}: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
    #[error("new-entries json at {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("{operation} is not supported by the {} catalog at {path}", .mode.as_str())]
    Unsupported {
        operation: &'static str,
        mode: PersistenceMode,
        path: PathBuf,
    },
}

impl CatalogError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        CatalogError::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    fn csv(path: &Path, source: csv::Error) -> Self {
        CatalogError::Csv {
            path: path.to_path_buf(),
            source,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogCommit {
    pub catalog_path: PathBuf,
    pub total_rows: usize,
    pub new_rows: usize,
    pub new_entries_path: Option<PathBuf>,
}

/// Persistence contract shared by both catalog policies.
pub trait CatalogRepository: Send {
    fn mode(&self) -> PersistenceMode;

    /// Reads every persisted entry. Called once, at run start.
    fn load_all(&mut self) -> Result<Vec<Entry>, CatalogError>;

    /// Records one accepted entry. Returns `false` when an entry with the same
    /// normalized title is already present and the row was refused.
    fn append_one(&mut self, entry: &Entry) -> Result<bool, CatalogError>;

    /// Replaces the persisted catalog with `entries`, in order. Only
    /// whole-file policies support this; append-only refuses it.
    fn rewrite_all(&mut self, entries: &[Entry]) -> Result<(), CatalogError>;

    /// Finishes the run's writes. Snapshot-merge rewrites the catalog with the
    /// loaded rows plus the accepted ones; append-only only flushes.
    fn commit(&mut self) -> Result<CatalogCommit, CatalogError>;
}

pub fn open_catalog(
    mode: PersistenceMode,
    catalog_path: impl Into<PathBuf>,
    new_entries_path: impl Into<PathBuf>,
    max_filename_chars: usize,
) -> Box<dyn CatalogRepository> {
    match mode {
        PersistenceMode::SnapshotMerge => Box::new(SnapshotMergeCatalog::new(
            catalog_path,
            new_entries_path,
            max_filename_chars,
        )),
        PersistenceMode::AppendOnly => Box::new(AppendOnlyCatalog::new(catalog_path)),
    }
}

#[derive(Debug)]
pub struct SnapshotMergeCatalog {
    path: PathBuf,
    new_entries_path: PathBuf,
    max_filename_chars: usize,
    existing: Vec<Entry>,
    added: Vec<Entry>,
    keys: HashSet<String>,
}

impl SnapshotMergeCatalog {
    pub fn new(
        path: impl Into<PathBuf>,
        new_entries_path: impl Into<PathBuf>,
        max_filename_chars: usize,
    ) -> Self {
        Self {
            path: path.into(),
            new_entries_path: new_entries_path.into(),
            max_filename_chars,
            existing: Vec::new(),
            added: Vec::new(),
            keys: HashSet::new(),
        }
    }

    fn write_catalog(&self, entries: &[Entry]) -> Result<(), CatalogError> {
        let mut writer = csv::WriterBuilder::new()
            .delimiter(SNAPSHOT_DELIMITER)
            .quote_style(csv::QuoteStyle::Necessary)
            .terminator(csv::Terminator::Any(b'\n'))
            .has_headers(false)
            .from_writer(Vec::new());
        writer
            .write_record(SNAPSHOT_HEADER)
            .map_err(|e| CatalogError::csv(&self.path, e))?;
        for entry in entries {
            writer
                .serialize(self.export_row(entry))
                .map_err(|e| CatalogError::csv(&self.path, e))?;
        }
        let bytes = writer
            .into_inner()
            .map_err(|e| CatalogError::io(&self.path, e.into_error()))?;
        write_atomic(&self.path, &bytes).map_err(|e| CatalogError::io(&self.path, e))
    }

    fn write_new_batch(&self) -> Result<(), CatalogError> {
        let rows: Vec<Entry> = self.added.iter().map(|e| self.export_row(e)).collect();
        let bytes = serde_json::to_vec_pretty(&rows).map_err(|source| CatalogError::Json {
            path: self.new_entries_path.clone(),
            source,
        })?;
        write_atomic(&self.new_entries_path, &bytes)
            .map_err(|e| CatalogError::io(&self.new_entries_path, e))
    }

    fn export_row(&self, entry: &Entry) -> Entry {
        let mut row = entry.clone();
        row.pdf_filename = safe_pdf_filename(&row.pdf_filename, "document.pdf", self.max_filename_chars);
        row
    }
}

impl CatalogRepository for SnapshotMergeCatalog {
    fn mode(&self) -> PersistenceMode {
        PersistenceMode::SnapshotMerge
    }

    fn load_all(&mut self) -> Result<Vec<Entry>, CatalogError> {
        if !self.path.exists() {
            info!(path = %self.path.display(), "catalog not found; starting empty");
            self.existing.clear();
            self.keys.clear();
            return Ok(Vec::new());
        }
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(SNAPSHOT_DELIMITER)
            .flexible(true)
            .from_path(&self.path)
            .map_err(|e| CatalogError::csv(&self.path, e))?;
        let mut entries = Vec::new();
        for row in reader.deserialize::<Entry>() {
            entries.push(row.map_err(|e| CatalogError::csv(&self.path, e))?);
        }
        self.keys = entries.iter().map(Entry::dedup_key).collect();
        self.existing = entries.clone();
        info!(path = %self.path.display(), rows = entries.len(), "loaded catalog");
        Ok(entries)
    }

    fn append_one(&mut self, entry: &Entry) -> Result<bool, CatalogError> {
        if !self.keys.insert(entry.dedup_key()) {
            warn!(title = %entry.title, "refusing duplicate title");
            return Ok(false);
        }
        self.added.push(entry.clone());
        Ok(true)
    }

    fn rewrite_all(&mut self, entries: &[Entry]) -> Result<(), CatalogError> {
        self.write_catalog(entries)?;
        self.keys = entries.iter().map(Entry::dedup_key).collect();
        self.existing = entries.to_vec();
        self.added.clear();
        Ok(())
    }

    // The batch goes first so a failed commit never leaves a rewritten
    // catalog behind.
    fn commit(&mut self) -> Result<CatalogCommit, CatalogError> {
        let mut all = self.existing.clone();
        all.extend(self.added.iter().cloned());
        self.write_new_batch()?;
        info!(path = %self.new_entries_path.display(), rows = self.added.len(), "wrote new entries");
        self.write_catalog(&all)?;
        info!(path = %self.path.display(), rows = all.len(), "wrote catalog");
        Ok(CatalogCommit {
            catalog_path: self.path.clone(),
            total_rows: all.len(),
            new_rows: self.added.len(),
            new_entries_path: Some(self.new_entries_path.clone()),
        })
    }
}

#[derive(Debug, Serialize)]
struct AppendRow<'a> {
    date: &'a str,
    title: &'a str,
    link: &'a str,
    pdf_link: &'a str,
    pdf_filename: &'a str,
    pdf_downloaded: PdfStatus,
}

impl<'a> From<&'a Entry> for AppendRow<'a> {
    fn from(entry: &'a Entry) -> Self {
        Self {
            date: &entry.date,
            title: &entry.title,
            link: &entry.link,
            pdf_link: &entry.pdf_link,
            pdf_filename: &entry.pdf_filename,
            pdf_downloaded: entry.pdf_downloaded,
        }
    }
}

pub struct AppendOnlyCatalog {
    path: PathBuf,
    writer: Option<csv::Writer<File>>,
    keys: HashSet<String>,
    loaded_rows: usize,
    appended: usize,
}

impl AppendOnlyCatalog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            writer: None,
            keys: HashSet::new(),
            loaded_rows: 0,
            appended: 0,
        }
    }

    fn open_writer(&self) -> Result<csv::Writer<File>, CatalogError> {
        let needs_header = fs::metadata(&self.path).map(|m| m.len() == 0).unwrap_or(true);
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| CatalogError::io(parent, e))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| CatalogError::io(&self.path, e))?;
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .terminator(csv::Terminator::Any(b'\n'))
            .from_writer(file);
        if needs_header {
            writer
                .write_record(APPEND_HEADER)
                .map_err(|e| CatalogError::csv(&self.path, e))?;
            writer.flush().map_err(|e| CatalogError::io(&self.path, e))?;
            info!(path = %self.path.display(), "created catalog with header");
        }
        Ok(writer)
    }

    fn writer(&mut self) -> Result<&mut csv::Writer<File>, CatalogError> {
        let writer = match self.writer.take() {
            Some(writer) => writer,
            None => self.open_writer()?,
        };
        Ok(self.writer.insert(writer))
    }
}

impl CatalogRepository for AppendOnlyCatalog {
    fn mode(&self) -> PersistenceMode {
        PersistenceMode::AppendOnly
    }

    fn load_all(&mut self) -> Result<Vec<Entry>, CatalogError> {
        if !self.path.exists() {
            info!(path = %self.path.display(), "catalog not found; will create one when appending");
            return Ok(Vec::new());
        }
        let mut reader = csv::ReaderBuilder::new()
            .flexible(true)
            .from_path(&self.path)
            .map_err(|e| CatalogError::csv(&self.path, e))?;
        let mut entries = Vec::new();
        for row in reader.deserialize::<Entry>() {
            entries.push(row.map_err(|e| CatalogError::csv(&self.path, e))?);
        }
        self.keys = entries.iter().map(Entry::dedup_key).collect();
        self.loaded_rows = entries.len();
        info!(path = %self.path.display(), titles = self.keys.len(), "loaded existing titles");
        Ok(entries)
    }

    fn append_one(&mut self, entry: &Entry) -> Result<bool, CatalogError> {
        if self.keys.contains(&entry.dedup_key()) {
            warn!(title = %entry.title, "refusing duplicate title");
            return Ok(false);
        }
        let path = self.path.clone();
        let writer = self.writer()?;
        writer
            .serialize(AppendRow::from(entry))
            .map_err(|e| CatalogError::csv(&path, e))?;
        writer.flush().map_err(|e| CatalogError::io(&path, e))?;
        self.keys.insert(entry.dedup_key());
        self.appended += 1;
        Ok(true)
    }

    fn rewrite_all(&mut self, _entries: &[Entry]) -> Result<(), CatalogError> {
        Err(CatalogError::Unsupported {
            operation: "rewrite_all",
            mode: PersistenceMode::AppendOnly,
            path: self.path.clone(),
        })
    }

    fn commit(&mut self) -> Result<CatalogCommit, CatalogError> {
        if let Some(writer) = self.writer.as_mut() {
            writer.flush().map_err(|e| CatalogError::io(&self.path, e))?;
        }
        Ok(CatalogCommit {
            catalog_path: self.path.clone(),
            total_rows: self.loaded_rows + self.appended,
            new_rows: self.appended,
            new_entries_path: None,
        })
    }
}
