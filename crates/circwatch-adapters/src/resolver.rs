//! Document-URL resolution on detail pages.
//!
//! [`PdfResolver`] runs an ordered chain of [`ResolutionTier`]s and stops at
//! the first one that yields a URL. Each tier only reads the page through
//! [`Page`], so tiers are testable against plain HTML strings.

use tracing::{debug, warn};
use url::Url;

use crate::page::{attr, element_text, Page};
use crate::AdapterError;

const PDF_MARKER: &str = ".pdf";

const TARGETED_SELECTORS: [&str; 8] = [
    "iframe[src$='.pdf']",
    "iframe[src*='.pdf']",
    "embed[src$='.pdf']",
    "embed[src*='.pdf']",
    "object[data$='.pdf']",
    "object[data*='.pdf']",
    "a[href$='.pdf']",
    "a[href*='.pdf']",
];
const TARGETED_ATTRS: [&str; 3] = ["src", "href", "data"];
const SCANNED_ATTRS: [&str; 4] = ["src", "href", "data", "data-src"];
const EMBED_SELECTOR: &str = "iframe[src], embed[src], object[data]";

/// One resolution heuristic.
pub trait ResolutionTier: Send + Sync {
    fn name(&self) -> &'static str;

    fn attempt(&self, page: &Page) -> Result<Option<Url>, AdapterError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub url: Url,
    pub tier: &'static str,
}

pub struct PdfResolver {
    tiers: Vec<Box<dyn ResolutionTier>>,
}

impl PdfResolver {
    pub fn new(tiers: Vec<Box<dyn ResolutionTier>>) -> Self {
        Self { tiers }
    }

    /// Targeted selectors, exhaustive attribute scan, viewer parameters.
    pub fn standard() -> Self {
        Self::new(base_tiers())
    }

    /// The standard chain plus frame traversal and the anchor heuristic.
    pub fn extended() -> Self {
        let mut tiers = base_tiers();
        tiers.push(Box::new(FrameTraversalTier::new(base_tiers())));
        tiers.push(Box::new(AnchorHeuristicTier));
        Self::new(tiers)
    }

    pub fn for_downloads(download_capable: bool) -> Self {
        if download_capable {
            Self::extended()
        } else {
            Self::standard()
        }
    }

    pub fn tier_names(&self) -> Vec<&'static str> {
        self.tiers.iter().map(|t| t.name()).collect()
    }

    /// First tier to produce a URL wins. `None` means no document was found,
    /// which is not an error.
    pub fn resolve(&self, page: &Page) -> Option<Resolution> {
        for tier in &self.tiers {
            match tier.attempt(page) {
                Ok(Some(url)) => {
                    let url = unwrap_viewer(url);
                    debug!(tier = tier.name(), url = %url, "resolved document");
                    return Some(Resolution {
                        url,
                        tier: tier.name(),
                    });
                }
                Ok(None) => {}
                Err(err) => warn!(tier = tier.name(), error = %err, "resolution tier failed"),
            }
        }
        None
    }
}

fn base_tiers() -> Vec<Box<dyn ResolutionTier>> {
    vec![
        Box::new(TargetedSelectorTier),
        Box::new(AttributeScanTier),
        Box::new(ViewerParameterTier),
    ]
}

fn contains_pdf(value: &str) -> bool {
    value.to_ascii_lowercase().contains(PDF_MARKER)
}

fn accept(page: &Page, value: &str) -> Option<Url> {
    page.resolve(value)
        .filter(|u| matches!(u.scheme(), "http" | "https"))
}

/// A viewer address such as `/web/?file=/docs/a.pdf` is replaced by the
/// document it wraps.
fn unwrap_viewer(url: Url) -> Url {
    let wrapped = url
        .query_pairs()
        .find(|(k, v)| k == "file" && contains_pdf(v))
        .and_then(|(_, v)| url.join(&v).ok())
        .filter(|u| matches!(u.scheme(), "http" | "https"));
    wrapped.unwrap_or(url)
}

/// Embedding elements and anchors whose address mentions `.pdf`.
pub struct TargetedSelectorTier;

impl ResolutionTier for TargetedSelectorTier {
    fn name(&self) -> &'static str {
        "targeted-selector"
    }

    fn attempt(&self, page: &Page) -> Result<Option<Url>, AdapterError> {
        for selector in TARGETED_SELECTORS {
            let Some(element) = page.first(selector)? else {
                continue;
            };
            for name in TARGETED_ATTRS {
                if let Some(value) = attr(element, name).filter(|v| contains_pdf(v)) {
                    if let Some(url) = accept(page, value) {
                        return Ok(Some(url));
                    }
                }
            }
        }
        Ok(None)
    }
}

/// Every element, every src/href/data-like attribute, case-insensitive.
pub struct AttributeScanTier;

impl ResolutionTier for AttributeScanTier {
    fn name(&self) -> &'static str {
        "attribute-scan"
    }

    fn attempt(&self, page: &Page) -> Result<Option<Url>, AdapterError> {
        for element in page.select("*")? {
            for name in SCANNED_ATTRS {
                if let Some(value) = attr(element, name).filter(|v| contains_pdf(v)) {
                    if let Some(url) = accept(page, value) {
                        return Ok(Some(url));
                    }
                }
            }
        }
        Ok(None)
    }
}

/// Viewer/proxy embeds carrying the document in a `file=` parameter, or in a
/// `src=` parameter for pdf.js style viewers.
pub struct ViewerParameterTier;

impl ResolutionTier for ViewerParameterTier {
    fn name(&self) -> &'static str {
        "viewer-parameter"
    }

    fn attempt(&self, page: &Page) -> Result<Option<Url>, AdapterError> {
        for element in page.select(EMBED_SELECTOR)? {
            let Some(src) = attr(element, "src").or_else(|| attr(element, "data")) else {
                continue;
            };
            let Some(viewer) = page.resolve(src) else {
                continue;
            };
            let lower = src.to_ascii_lowercase();
            let viewer_like = lower.contains("pdfjs") || lower.contains("viewer");
            let found = viewer
                .query_pairs()
                .filter(|(k, _)| k == "file" || (viewer_like && k == "src"))
                .map(|(_, v)| v.into_owned())
                .find(|v| contains_pdf(v));
            if let Some(decoded) = found {
                if let Some(url) = accept(page, &decoded) {
                    return Ok(Some(url));
                }
            }
        }
        Ok(None)
    }
}

/// Applies the inner tiers inside every sub-frame; a frame whose own address
/// is a `.pdf` is accepted as is.
pub struct FrameTraversalTier {
    inner: Vec<Box<dyn ResolutionTier>>,
}

impl FrameTraversalTier {
    pub fn new(inner: Vec<Box<dyn ResolutionTier>>) -> Self {
        Self { inner }
    }

    fn search(&self, frames: &[Page]) -> Result<Option<Url>, AdapterError> {
        for frame in frames {
            if frame.url().path().to_ascii_lowercase().ends_with(PDF_MARKER) {
                return Ok(Some(frame.url().clone()));
            }
            for tier in &self.inner {
                if let Some(url) = tier.attempt(frame)? {
                    return Ok(Some(url));
                }
            }
            if let Some(url) = self.search(frame.frames())? {
                return Ok(Some(url));
            }
        }
        Ok(None)
    }
}

impl ResolutionTier for FrameTraversalTier {
    fn name(&self) -> &'static str {
        "frame-traversal"
    }

    fn attempt(&self, page: &Page) -> Result<Option<Url>, AdapterError> {
        self.search(page.frames())
    }
}

/// Anchors ending in `.pdf`, or mentioning `.pdf` with view/pdf link text.
pub struct AnchorHeuristicTier;

impl ResolutionTier for AnchorHeuristicTier {
    fn name(&self) -> &'static str {
        "anchor-heuristic"
    }

    fn attempt(&self, page: &Page) -> Result<Option<Url>, AdapterError> {
        for anchor in page.select("a[href]")? {
            let Some(href) = attr(anchor, "href") else {
                continue;
            };
            let href_lower = href.to_ascii_lowercase();
            let text = element_text(anchor).to_lowercase();
            let looks_like_pdf = href_lower.ends_with(PDF_MARKER)
                || (href_lower.contains(PDF_MARKER) && (text.contains("view") || text.contains("pdf")));
            if looks_like_pdf {
                if let Some(url) = accept(page, href) {
                    return Ok(Some(url));
                }
            }
        }
        Ok(None)
    }
}
