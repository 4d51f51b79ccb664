//! Sync pipeline orchestration: one batch pass over the listing page, with
//! per-candidate dedup, document resolution, optional download and
//! persistence.

pub mod config;
pub mod dedup;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use circwatch_adapters::{
    AdapterError, BrowserOptions, BrowserPageLoader, HttpPageLoader, ListingExtraction, ListingExtractor, Page, PageKind, PageLoader,
    PdfResolver, RenderedPage, Resolution,
};
use circwatch_core::{Candidate, Entry, PdfStatus};
use circwatch_storage::{
    open_catalog, safe_pdf_filename, CatalogError, CatalogRepository, DownloadOutcome, Downloader,
    HttpClientConfig, HttpFetcher, PersistenceMode,
};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

pub use config::{ConfigOverlay, KnownTitlePolicy, Renderer, SyncConfig};
pub use dedup::DedupStore;

pub const CRATE_NAME: &str = "circwatch-sync";

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("loading listing page {url}: {source}")]
    ListingLoad {
        url: String,
        #[source]
        source: AdapterError,
    },
    #[error("No entries found on {url}: {source}")]
    Extraction {
        url: String,
        #[source]
        source: AdapterError,
    },
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error("configuration: {0}")]
    Config(String),
}

/// Terminal state of one examined candidate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "kebab-case")]
pub enum CandidateOutcome {
    Skipped {
        title: String,
    },
    Recorded {
        title: String,
        resolved: bool,
        downloaded: bool,
    },
    Refreshed {
        title: String,
        resolved: bool,
        downloaded: bool,
    },
}

impl CandidateOutcome {
    fn counts(&self) -> (bool, bool) {
        match self {
            CandidateOutcome::Skipped { .. } => (false, false),
            CandidateOutcome::Recorded {
                resolved,
                downloaded,
                ..
            }
            | CandidateOutcome::Refreshed {
                resolved,
                downloaded,
                ..
            } => (*resolved, *downloaded),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub mode: PersistenceMode,
    pub listing_url: String,
    pub candidates: usize,
    pub skipped: usize,
    pub recorded: usize,
    pub refreshed: usize,
    pub resolved: usize,
    pub downloaded: usize,
    pub catalog_path: PathBuf,
    pub catalog_rows: usize,
    pub new_entries_path: Option<PathBuf>,
    pub outcomes: Vec<CandidateOutcome>,
}

/// What a detail-page visit produced. Both fields stay empty when the page
/// failed to load or no document was found.
#[derive(Debug, Default)]
struct DetailResult {
    pdf_link: Option<String>,
    download: Option<DownloadOutcome>,
}

impl DetailResult {
    fn fetched(&self) -> bool {
        self.download.as_ref().is_some_and(DownloadOutcome::fetched)
    }

    /// The written file, if this visit actually fetched one.
    fn fetched_path(&self) -> Option<&std::path::Path> {
        self.download
            .as_ref()
            .filter(|d| d.fetched())
            .map(DownloadOutcome::path)
    }
}

pub struct SyncPipeline {
    config: SyncConfig,
    loader: Arc<dyn PageLoader>,
    downloader: Option<Downloader>,
    extractor: ListingExtractor,
    resolver: PdfResolver,
    running: Mutex<()>,
}

impl SyncPipeline {
    pub fn new(config: SyncConfig) -> Result<Self> {
        let http = Arc::new(HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
        })?);
        let loader = HttpPageLoader::new(
            http.clone(),
            Duration::from_secs(config.page_timeout_secs),
            config.frame_depth,
        );
        let downloader = config.download.then(|| {
            Downloader::new(http, config.download_dir.clone(), config.max_filename_chars)
                .with_existing_policy(config.existing_files)
                .with_referer(config.listing_url.clone())
        });
        Ok(Self {
            resolver: PdfResolver::for_downloads(config.download),
            config,
            loader: Arc::new(loader),
            downloader,
            extractor: ListingExtractor::default(),
            running: Mutex::new(()),
        })
    }

    /// Builds the pipeline with the configured renderer. When no browser can
    /// be started the plain HTTP loader from [`SyncPipeline::new`] is kept.
    pub async fn from_config(config: SyncConfig) -> Result<Self> {
        let renderer = config.renderer;
        let options = BrowserOptions {
            executable: config.browser_executable.clone(),
            timeout: Duration::from_secs(config.page_timeout_secs),
            frame_depth: config.frame_depth,
        };
        let pipeline = Self::new(config)?;
        if renderer == Renderer::Http {
            return Ok(pipeline);
        }
        match BrowserPageLoader::launch(options).await {
            Ok(browser) => Ok(pipeline.with_loader(Arc::new(browser))),
            Err(err) => {
                warn!(error = %err, "browser unavailable; falling back to plain http pages");
                Ok(pipeline)
            }
        }
    }

    /// Replaces the page loader, e.g. with a rendering backend or a test fake.
    pub fn with_loader(mut self, loader: Arc<dyn PageLoader>) -> Self {
        self.loader = loader;
        self
    }

    pub async fn run_once(&self) -> Result<SyncRunSummary, SyncError> {
        let catalog = open_catalog(
            self.config.mode,
            &self.config.catalog_path,
            &self.config.new_entries_path,
            self.config.max_filename_chars,
        );
        self.run_once_with_catalog(catalog).await
    }

    /// Runs one pass against a caller-supplied catalog.
    pub async fn run_once_with_catalog(
        &self,
        catalog: Box<dyn CatalogRepository>,
    ) -> Result<SyncRunSummary, SyncError> {
        let run_id = Uuid::new_v4();
        let span = info_span!("sync_run", %run_id, mode = self.config.mode.as_str());
        self.run_inner(run_id, catalog).instrument(span).await
    }

    async fn run_inner(
        &self,
        run_id: Uuid,
        mut catalog: Box<dyn CatalogRepository>,
    ) -> Result<SyncRunSummary, SyncError> {
        let started_at = Utc::now();
        let listing_url = self.config.listing_url.as_str();
        info!(url = listing_url, "loading listing page");

        let rendered = self
            .loader
            .load(listing_url, PageKind::Listing)
            .await
            .map_err(|source| {
                warn!(url = listing_url, error = %source, "No entries found");
                SyncError::ListingLoad {
                    url: listing_url.to_string(),
                    source,
                }
            })?;
        let extraction = extract_candidates(&self.extractor, &rendered, self.config.max_entries)
            .map_err(|source| {
                warn!(url = listing_url, error = %source, "No entries found");
                SyncError::Extraction {
                    url: listing_url.to_string(),
                    source,
                }
            })?;
        info!(
            tier = ?extraction.tier,
            count = extraction.candidates.len(),
            "extracted candidates"
        );

        let existing = catalog.load_all()?;
        let mut dedup = DedupStore::load(&existing);
        info!(rows = existing.len(), titles = dedup.len(), "loaded catalog");

        let mut outcomes = Vec::with_capacity(extraction.candidates.len());
        for candidate in &extraction.candidates {
            let outcome = self
                .process_candidate(candidate, catalog.as_mut(), &mut dedup)
                .await?;
            outcomes.push(outcome);
        }

        let commit = catalog.commit()?;
        let finished_at = Utc::now();

        let mut summary = SyncRunSummary {
            run_id,
            started_at,
            finished_at,
            mode: self.config.mode,
            listing_url: listing_url.to_string(),
            candidates: extraction.candidates.len(),
            skipped: 0,
            recorded: 0,
            refreshed: 0,
            resolved: 0,
            downloaded: 0,
            catalog_path: commit.catalog_path,
            catalog_rows: commit.total_rows,
            new_entries_path: commit.new_entries_path,
            outcomes: Vec::new(),
        };
        for outcome in &outcomes {
            match outcome {
                CandidateOutcome::Skipped { .. } => summary.skipped += 1,
                CandidateOutcome::Recorded { .. } => summary.recorded += 1,
                CandidateOutcome::Refreshed { .. } => summary.refreshed += 1,
            }
            let (resolved, downloaded) = outcome.counts();
            summary.resolved += usize::from(resolved);
            summary.downloaded += usize::from(downloaded);
        }
        summary.outcomes = outcomes;

        info!(
            candidates = summary.candidates,
            skipped = summary.skipped,
            recorded = summary.recorded,
            refreshed = summary.refreshed,
            downloaded = summary.downloaded,
            "sync complete"
        );
        Ok(summary)
    }

    async fn process_candidate(
        &self,
        candidate: &Candidate,
        catalog: &mut dyn CatalogRepository,
        dedup: &mut DedupStore,
    ) -> Result<CandidateOutcome, SyncError> {
        let title = candidate.title.clone();

        if dedup.contains(&title) {
            let refresh = self.config.known_titles == KnownTitlePolicy::Refresh
                && self.downloader.is_some();
            if !refresh {
                info!(title = %title, "SKIP (exists)");
                return Ok(CandidateOutcome::Skipped { title });
            }
            info!(title = %title, "REFRESH (exists)");
            let detail = self.visit_detail(candidate).await;
            return Ok(CandidateOutcome::Refreshed {
                title,
                resolved: detail.pdf_link.is_some(),
                downloaded: detail.fetched(),
            });
        }

        info!(title = %title, "NEW");
        let detail = self.visit_detail(candidate).await;
        let entry = self.build_entry(candidate, &detail);
        let resolved = !entry.pdf_link.is_empty();
        let downloaded = entry.pdf_downloaded.is_downloaded();

        if catalog.append_one(&entry)? {
            info!(
                title = %title,
                pdf_downloaded = entry.pdf_downloaded.as_str(),
                "recorded entry"
            );
        } else {
            warn!(title = %title, "catalog refused duplicate title");
        }
        dedup.add(&title);

        Ok(CandidateOutcome::Recorded {
            title,
            resolved,
            downloaded,
        })
    }

    /// Loads the detail page, resolves its document and downloads it when
    /// enabled. Every failure here degrades the candidate instead of the run.
    async fn visit_detail(&self, candidate: &Candidate) -> DetailResult {
        if candidate.link.is_empty() {
            warn!(title = %candidate.title, "entry has no detail link");
            return DetailResult::default();
        }

        let rendered = match self.loader.load(&candidate.link, PageKind::Detail).await {
            Ok(rendered) => rendered,
            Err(err) => {
                warn!(url = %candidate.link, error = %err, "opening detail page failed");
                return DetailResult::default();
            }
        };
        let resolution = match resolve_document(&self.resolver, &rendered) {
            Ok(Some(resolution)) => resolution,
            Ok(None) => {
                warn!(url = %candidate.link, "no pdf found on the entry page");
                return DetailResult::default();
            }
            Err(err) => {
                warn!(url = %candidate.link, error = %err, "detail page could not be parsed");
                return DetailResult::default();
            }
        };
        let pdf_url = resolution.url.to_string();
        info!(tier = resolution.tier, url = %pdf_url, "found pdf");

        let Some(downloader) = &self.downloader else {
            return DetailResult {
                pdf_link: Some(pdf_url),
                download: None,
            };
        };
        let file_name = downloader.file_name_for(&pdf_url, &candidate.title);
        let download = match downloader.download(&pdf_url, &file_name).await {
            Ok(outcome) => {
                info!(path = %outcome.path().display(), "download ok");
                Some(outcome)
            }
            Err(err) => {
                warn!(url = %pdf_url, error = %err, "download failed");
                None
            }
        };
        DetailResult {
            pdf_link: Some(pdf_url),
            download,
        }
    }

    fn build_entry(&self, candidate: &Candidate, detail: &DetailResult) -> Entry {
        let mut entry = Entry::from_candidate(candidate);
        entry.pdf_link = detail.pdf_link.clone().unwrap_or_default();
        if detail.fetched() {
            entry.pdf_downloaded = PdfStatus::Downloaded;
        }

        match self.config.mode {
            PersistenceMode::SnapshotMerge => {
                entry.pdf_filename = detail
                    .fetched_path()
                    .and_then(|path| path.file_name())
                    .map(|name| name.to_string_lossy().into_owned())
                    .unwrap_or_else(|| {
                        safe_pdf_filename(
                            &candidate.title,
                            "document",
                            self.config.max_filename_chars,
                        )
                    });
                entry.with_provenance(Utc::now(), self.config.source_commit.as_deref())
            }
            PersistenceMode::AppendOnly => {
                entry.pdf_filename = detail
                    .fetched_path()
                    .map(|path| path.display().to_string())
                    .unwrap_or_default();
                entry
            }
        }
    }

    /// Runs a pass unless one is already in flight.
    async fn run_scheduled(&self) {
        let Ok(_guard) = self.running.try_lock() else {
            warn!("previous sync still running; skipping this tick");
            return;
        };
        match self.run_once().await {
            Ok(summary) => info!(
                run_id = %summary.run_id,
                recorded = summary.recorded,
                "scheduled sync finished"
            ),
            Err(err) => warn!(error = %err, "scheduled sync failed"),
        }
    }
}

// `scraper::Html` is not `Send`, so parsing stays inside these synchronous
// helpers and never lives across an await point.
fn extract_candidates(
    extractor: &ListingExtractor,
    rendered: &RenderedPage,
    max_count: usize,
) -> Result<ListingExtraction, AdapterError> {
    let page = Page::from_rendered(rendered)?;
    extractor.extract(&page, max_count)
}

fn resolve_document(
    resolver: &PdfResolver,
    rendered: &RenderedPage,
) -> Result<Option<Resolution>, AdapterError> {
    let page = Page::from_rendered(rendered)?;
    Ok(resolver.resolve(&page))
}

/// Cron scheduler that runs an independent batch pass on every tick.
pub async fn build_scheduler(pipeline: Arc<SyncPipeline>) -> Result<JobScheduler> {
    let cron = pipeline.config.scheduler_cron.clone();
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
        let pipeline = pipeline.clone();
        Box::pin(async move {
            pipeline.run_scheduled().await;
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(sched)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use circwatch_storage::ExistingFilePolicy;
    use std::collections::HashMap;
    use std::fs;
    use std::path::Path;
    use tempfile::{tempdir, TempDir};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const LISTING: &str = "https://regulator.example/circulars";

    /// In-memory loader: URLs map to HTML, anything else times out.
    #[derive(Default)]
    struct FakeLoader {
        pages: HashMap<String, String>,
    }

    impl FakeLoader {
        fn page(mut self, url: &str, html: impl Into<String>) -> Self {
            self.pages.insert(url.to_string(), html.into());
            self
        }
    }

    #[async_trait]
    impl PageLoader for FakeLoader {
        async fn load(&self, url: &str, _kind: PageKind) -> Result<RenderedPage, AdapterError> {
            self.pages
                .get(url)
                .map(|html| RenderedPage::new(url, html.clone()))
                .ok_or_else(|| AdapterError::Timeout {
                    url: url.to_string(),
                    after: Duration::from_secs(45),
                })
        }
    }

    fn listing_html(titles: &[&str]) -> String {
        let rows: String = titles
            .iter()
            .enumerate()
            .map(|(i, title)| {
                format!(
                    "<tr><td>Oct {}, 2025</td><td><a href=\"/circulars/{}.html\">{title}</a></td></tr>",
                    20 - i,
                    slug(title)
                )
            })
            .collect();
        format!("<html><body><table><tbody>{rows}</tbody></table></body></html>")
    }

    fn slug(title: &str) -> String {
        title.to_lowercase().replace(' ', "-")
    }

    fn detail_url(title: &str) -> String {
        format!("https://regulator.example/circulars/{}.html", slug(title))
    }

    fn detail_html(pdf_url: &str) -> String {
        format!("<html><body><iframe src=\"{pdf_url}\"></iframe></body></html>")
    }

    fn config(dir: &Path, mode: PersistenceMode) -> SyncConfig {
        SyncConfig::from_overlay(ConfigOverlay {
            listing_url: Some(LISTING.to_string()),
            mode: Some(mode),
            catalog_path: Some(dir.join("catalog.csv")),
            new_entries_path: Some(dir.join("new_entries.json")),
            download_dir: Some(dir.join("pdfs")),
            source_commit: Some("abc123".to_string()),
            ..Default::default()
        })
        .unwrap()
    }

    fn pipeline(config: SyncConfig, loader: FakeLoader) -> SyncPipeline {
        SyncPipeline::new(config).unwrap().with_loader(Arc::new(loader))
    }

    fn snapshot_rows(path: &Path) -> Vec<Vec<String>> {
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(b'|')
            .from_path(path)
            .unwrap();
        reader
            .records()
            .map(|r| r.unwrap().iter().map(str::to_string).collect())
            .collect()
    }

    fn seeded_snapshot(dir: &TempDir, titles: &[&str]) {
        let entries: Vec<Entry> = titles
            .iter()
            .map(|title| {
                Entry::from_candidate(&Candidate::new("Oct 1, 2025", *title, detail_url(title)))
                    .with_provenance(Utc::now(), None)
            })
            .collect();
        let mut catalog = circwatch_storage::SnapshotMergeCatalog::new(
            dir.path().join("catalog.csv"),
            dir.path().join("unused.json"),
            150,
        );
        catalog.rewrite_all(&entries).unwrap();
    }

    #[tokio::test]
    async fn known_titles_are_skipped_and_only_new_ones_recorded() {
        let dir = tempdir().unwrap();
        seeded_snapshot(&dir, &["Circular A"]);
        let loader = FakeLoader::default()
            .page(LISTING, listing_html(&["Circular A", "Circular B"]))
            .page(
                &detail_url("Circular B"),
                detail_html("https://regulator.example/docs/b.pdf"),
            );

        let summary = pipeline(config(dir.path(), PersistenceMode::SnapshotMerge), loader)
            .run_once()
            .await
            .unwrap();

        assert_eq!(summary.candidates, 2);
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.recorded, 1);
        assert_eq!(summary.resolved, 1);
        assert_eq!(summary.catalog_rows, 2);

        let batch: Vec<Entry> =
            serde_json::from_str(&fs::read_to_string(dir.path().join("new_entries.json")).unwrap())
                .unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].title, "Circular B");
        assert_eq!(batch[0].pdf_link, "https://regulator.example/docs/b.pdf");
        assert_eq!(batch[0].pdf_filename, "Circular B.pdf");
        assert_eq!(batch[0].pdf_downloaded, PdfStatus::NotDownloaded);
        assert_eq!(batch[0].source_commit, "abc123");
        assert_eq!(batch[0].id.len(), 64);

        let rows = snapshot_rows(&dir.path().join("catalog.csv"));
        let titles: Vec<&str> = rows.iter().map(|r| r[2].as_str()).collect();
        assert_eq!(titles, ["Circular A", "Circular B"]);
    }

    #[tokio::test]
    async fn second_run_against_unchanged_listing_adds_nothing() {
        let dir = tempdir().unwrap();
        let loader = FakeLoader::default()
            .page(LISTING, listing_html(&["Circular A", "circular a ", "Circular B"]));
        let pipeline = pipeline(config(dir.path(), PersistenceMode::SnapshotMerge), loader);

        let first = pipeline.run_once().await.unwrap();
        assert_eq!(first.recorded, 2);
        assert_eq!(first.skipped, 1);

        let second = pipeline.run_once().await.unwrap();
        assert_eq!(second.recorded, 0);
        assert_eq!(second.skipped, 3);
        assert_eq!(second.catalog_rows, 2);

        let rows = snapshot_rows(&dir.path().join("catalog.csv"));
        assert_eq!(rows.len(), 2);
        let batch = fs::read_to_string(dir.path().join("new_entries.json")).unwrap();
        assert_eq!(batch.trim(), "[]");
    }

    #[tokio::test]
    async fn detail_timeout_still_records_a_degraded_entry() {
        let dir = tempdir().unwrap();
        let loader = FakeLoader::default().page(LISTING, listing_html(&["Circular C"]));

        let summary = pipeline(config(dir.path(), PersistenceMode::SnapshotMerge), loader)
            .run_once()
            .await
            .unwrap();

        assert_eq!(summary.recorded, 1);
        assert_eq!(summary.resolved, 0);
        let rows = snapshot_rows(&dir.path().join("catalog.csv"));
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0][2], "Circular C");
        assert_eq!(rows[0][4], "");
        assert_eq!(rows[0][6], "no");
    }

    #[tokio::test]
    async fn empty_listing_aborts_without_touching_files() {
        let dir = tempdir().unwrap();
        let loader = FakeLoader::default()
            .page(LISTING, "<html><body><p>Under maintenance</p></body></html>");

        let err = pipeline(config(dir.path(), PersistenceMode::SnapshotMerge), loader)
            .run_once()
            .await
            .unwrap_err();

        assert!(matches!(err, SyncError::Extraction { .. }));
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn unreachable_listing_is_a_run_failure() {
        let dir = tempdir().unwrap();
        let err = pipeline(
            config(dir.path(), PersistenceMode::AppendOnly),
            FakeLoader::default(),
        )
        .run_once()
        .await
        .unwrap_err();

        assert!(matches!(err, SyncError::ListingLoad { .. }));
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn append_only_downloads_overwrite_and_flush_rows() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/docs/circular-d.pdf"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"%PDF-fresh".to_vec()))
            .mount(&server)
            .await;
        let pdf_url = format!("{}/docs/circular-d.pdf", server.uri());

        let dir = tempdir().unwrap();
        let pdfs = dir.path().join("pdfs");
        fs::create_dir_all(&pdfs).unwrap();
        fs::write(pdfs.join("circular-d.pdf"), b"stale").unwrap();

        let loader = FakeLoader::default()
            .page(LISTING, listing_html(&["Circular D", "Circular E"]))
            .page(&detail_url("Circular D"), detail_html(&pdf_url));

        let summary = pipeline(config(dir.path(), PersistenceMode::AppendOnly), loader)
            .run_once()
            .await
            .unwrap();

        assert_eq!(summary.recorded, 2);
        assert_eq!(summary.downloaded, 1);
        assert!(summary.new_entries_path.is_none());
        assert_eq!(fs::read(pdfs.join("circular-d.pdf")).unwrap(), b"%PDF-fresh");
        let leftovers: Vec<_> = fs::read_dir(&pdfs)
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".part"))
            .collect();
        assert!(leftovers.is_empty());

        let text = fs::read_to_string(dir.path().join("catalog.csv")).unwrap();
        let mut lines = text.lines();
        assert_eq!(
            lines.next(),
            Some("date,title,link,pdf_link,pdf_filename,pdf_downloaded")
        );
        let first = lines.next().unwrap();
        assert!(first.contains("Circular D"));
        assert!(first.ends_with(",yes"));
        assert!(first.contains(&pdfs.join("circular-d.pdf").display().to_string()));
        let second = lines.next().unwrap();
        assert!(second.contains("Circular E"));
        assert!(second.ends_with(",,,no"));
        assert!(!dir.path().join("new_entries.json").exists());
    }

    #[tokio::test]
    async fn failed_download_is_recorded_as_not_downloaded() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        let pdf_url = format!("{}/docs/missing.pdf", server.uri());

        let dir = tempdir().unwrap();
        let loader = FakeLoader::default()
            .page(LISTING, listing_html(&["Circular F"]))
            .page(&detail_url("Circular F"), detail_html(&pdf_url));

        let summary = pipeline(config(dir.path(), PersistenceMode::AppendOnly), loader)
            .run_once()
            .await
            .unwrap();

        assert_eq!(summary.resolved, 1);
        assert_eq!(summary.downloaded, 0);
        let text = fs::read_to_string(dir.path().join("catalog.csv")).unwrap();
        let row = text.lines().nth(1).unwrap();
        assert!(row.contains(&pdf_url));
        assert!(row.ends_with(",,no"));
    }

    #[tokio::test]
    async fn refresh_policy_redownloads_known_titles_without_new_rows() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/docs/g.pdf"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"%PDF-g".to_vec()))
            .expect(2)
            .mount(&server)
            .await;
        let pdf_url = format!("{}/docs/g.pdf", server.uri());

        let dir = tempdir().unwrap();
        let mut config = config(dir.path(), PersistenceMode::AppendOnly);
        config.known_titles = KnownTitlePolicy::Refresh;
        config.existing_files = ExistingFilePolicy::Overwrite;
        let loader = FakeLoader::default()
            .page(LISTING, listing_html(&["Circular G"]))
            .page(&detail_url("Circular G"), detail_html(&pdf_url));
        let pipeline = pipeline(config, loader);

        let first = pipeline.run_once().await.unwrap();
        assert_eq!(first.recorded, 1);

        let second = pipeline.run_once().await.unwrap();
        assert_eq!(second.recorded, 0);
        assert_eq!(second.refreshed, 1);
        assert_eq!(second.downloaded, 1);
        assert_eq!(second.catalog_rows, 1);

        let text = fs::read_to_string(dir.path().join("catalog.csv")).unwrap();
        assert_eq!(text.lines().count(), 2);
    }

    #[tokio::test]
    async fn keep_policy_records_an_existing_file_as_not_downloaded() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"%PDF-new".to_vec()))
            .expect(0)
            .mount(&server)
            .await;
        let pdf_url = format!("{}/other/view.pdf", server.uri());

        let dir = tempdir().unwrap();
        let pdfs = dir.path().join("pdfs");
        fs::create_dir_all(&pdfs).unwrap();
        fs::write(pdfs.join("view.pdf"), b"unrelated bytes").unwrap();

        let mut config = config(dir.path(), PersistenceMode::AppendOnly);
        config.existing_files = ExistingFilePolicy::Keep;
        let loader = FakeLoader::default()
            .page(LISTING, listing_html(&["Circular H"]))
            .page(&detail_url("Circular H"), detail_html(&pdf_url));

        let summary = pipeline(config, loader).run_once().await.unwrap();

        assert_eq!(summary.resolved, 1);
        assert_eq!(summary.downloaded, 0);
        assert_eq!(fs::read(pdfs.join("view.pdf")).unwrap(), b"unrelated bytes");
        let text = fs::read_to_string(dir.path().join("catalog.csv")).unwrap();
        let row = text.lines().nth(1).unwrap();
        assert!(row.contains(&pdf_url));
        assert!(row.ends_with(",,no"), "{row}");
    }

    #[tokio::test]
    async fn keep_policy_snapshot_row_uses_title_name_when_nothing_was_fetched() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"%PDF-new".to_vec()))
            .expect(0)
            .mount(&server)
            .await;
        let pdf_url = format!("{}/docs/view.pdf", server.uri());

        let dir = tempdir().unwrap();
        let pdfs = dir.path().join("pdfs");
        fs::create_dir_all(&pdfs).unwrap();
        fs::write(pdfs.join("view.pdf"), b"older").unwrap();

        let mut config = config(dir.path(), PersistenceMode::SnapshotMerge);
        config.existing_files = ExistingFilePolicy::Keep;
        let loader = FakeLoader::default()
            .page(LISTING, listing_html(&["Circular I"]))
            .page(&detail_url("Circular I"), detail_html(&pdf_url));

        let summary = pipeline(config, loader).run_once().await.unwrap();

        assert_eq!(summary.downloaded, 0);
        let rows = snapshot_rows(&dir.path().join("catalog.csv"));
        assert_eq!(rows[0][5], "Circular I.pdf");
        assert_eq!(rows[0][6], "no");
    }

    #[tokio::test]
    async fn snapshot_commit_failure_leaves_prior_catalog_untouched() {
        let dir = tempdir().unwrap();
        seeded_snapshot(&dir, &["Circular A"]);
        let catalog_path = dir.path().join("catalog.csv");
        let before = fs::read(&catalog_path).unwrap();

        // The batch export's parent is a regular file, so it cannot be written.
        let blocker = dir.path().join("blocker");
        fs::write(&blocker, b"").unwrap();
        let mut config = config(dir.path(), PersistenceMode::SnapshotMerge);
        config.new_entries_path = blocker.join("new_entries.json");
        let loader =
            FakeLoader::default().page(LISTING, listing_html(&["Circular A", "Circular J"]));

        let err = pipeline(config, loader).run_once().await.unwrap_err();

        assert!(matches!(err, SyncError::Catalog(_)), "{err}");
        assert_eq!(fs::read(&catalog_path).unwrap(), before);
    }

    /// Delegates to a real catalog and fails every append after the first `ok`.
    struct FailingAfter {
        inner: Box<dyn CatalogRepository>,
        ok: usize,
        path: PathBuf,
    }

    impl CatalogRepository for FailingAfter {
        fn mode(&self) -> PersistenceMode {
            self.inner.mode()
        }

        fn load_all(&mut self) -> Result<Vec<Entry>, CatalogError> {
            self.inner.load_all()
        }

        fn append_one(&mut self, entry: &Entry) -> Result<bool, CatalogError> {
            if self.ok == 0 {
                return Err(CatalogError::Io {
                    path: self.path.clone(),
                    source: std::io::Error::other("disk full"),
                });
            }
            self.ok -= 1;
            self.inner.append_one(entry)
        }

        fn rewrite_all(&mut self, entries: &[Entry]) -> Result<(), CatalogError> {
            self.inner.rewrite_all(entries)
        }

        fn commit(&mut self) -> Result<circwatch_storage::CatalogCommit, CatalogError> {
            self.inner.commit()
        }
    }

    #[tokio::test]
    async fn append_only_rows_flushed_before_a_failed_append_survive() {
        let dir = tempdir().unwrap();
        let config = config(dir.path(), PersistenceMode::AppendOnly);
        let catalog_path = config.catalog_path.clone();
        let catalog = FailingAfter {
            inner: open_catalog(
                config.mode,
                &config.catalog_path,
                &config.new_entries_path,
                config.max_filename_chars,
            ),
            ok: 2,
            path: catalog_path.clone(),
        };
        let loader = FakeLoader::default().page(
            LISTING,
            listing_html(&["Circular K", "Circular L", "Circular M"]),
        );

        let err = pipeline(config, loader)
            .run_once_with_catalog(Box::new(catalog))
            .await
            .unwrap_err();

        assert!(matches!(err, SyncError::Catalog(CatalogError::Io { .. })), "{err}");
        let text = fs::read_to_string(&catalog_path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[1].contains("Circular K"));
        assert!(lines[2].contains("Circular L"));
        assert!(!text.contains("Circular M"));
    }

    #[tokio::test]
    async fn browser_renderer_falls_back_to_http_pages() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/circulars"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/html; charset=utf-8")
                    .set_body_string(listing_html(&["Circular N"])),
            )
            .mount(&server)
            .await;

        let dir = tempdir().unwrap();
        let mut config = config(dir.path(), PersistenceMode::AppendOnly);
        config.listing_url = format!("{}/circulars", server.uri());
        config.download = false;
        config.renderer = Renderer::Browser;
        config.browser_executable = Some(dir.path().join("no-such-chromium"));

        let summary = SyncPipeline::from_config(config)
            .await
            .unwrap()
            .run_once()
            .await
            .unwrap();

        assert_eq!(summary.recorded, 1);
        assert_eq!(summary.outcomes.len(), 1);
    }
}
