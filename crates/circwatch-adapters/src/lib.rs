//! Page capability, listing extraction and document-URL resolution.

pub mod browser;
pub mod listing;
pub mod loader;
pub mod page;
pub mod resolver;

use std::time::Duration;

use circwatch_storage::FetchError;
use thiserror::Error;

pub use browser::{BrowserOptions, BrowserPageLoader};
pub use listing::{ListingExtraction, ListingExtractor, ListingTier};
pub use loader::{frame_sources, HttpPageLoader, PageKind, PageLoader, RenderedPage};
pub use page::Page;
pub use resolver::{
    AnchorHeuristicTier, AttributeScanTier, FrameTraversalTier, PdfResolver, Resolution,
    ResolutionTier, TargetedSelectorTier, ViewerParameterTier,
};

pub const CRATE_NAME: &str = "circwatch-adapters";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("invalid selector {selector}: {reason}")]
    Selector { selector: String, reason: String },
    #[error("invalid url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("no entries found on {url}")]
    NoCandidates { url: String },
    #[error("loading {url} timed out after {after:?}")]
    Timeout { url: String, after: Duration },
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("browser: {0}")]
    Browser(String),
}
