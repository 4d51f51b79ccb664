//! Page loading seam. The pipeline only sees [`RenderedPage`] snapshots, so a
//! browser-backed loader can stand in for [`HttpPageLoader`] without touching
//! extraction or resolution.

use std::collections::{HashSet, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use circwatch_storage::HttpFetcher;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::page::{attr, Page};
use crate::AdapterError;

/// Owned snapshot of a loaded page and its sub-frames (flattened, in
/// discovery order). Frames never carry frames of their own.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderedPage {
    pub url: String,
    pub html: String,
    #[serde(default)]
    pub frames: Vec<RenderedPage>,
}

impl RenderedPage {
    pub fn new(url: impl Into<String>, html: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            html: html.into(),
            frames: Vec::new(),
        }
    }

    pub fn with_frame(mut self, frame: RenderedPage) -> Self {
        self.frames.push(frame);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageKind {
    Listing,
    Detail,
}

#[async_trait]
pub trait PageLoader: Send + Sync {
    async fn load(&self, url: &str, kind: PageKind) -> Result<RenderedPage, AdapterError>;
}

/// Loads pages with plain HTTP fetches. Detail pages also pull in their
/// `iframe`/`frame` documents, breadth first, up to `frame_depth` levels.
#[derive(Debug, Clone)]
pub struct HttpPageLoader {
    http: Arc<HttpFetcher>,
    timeout: Duration,
    frame_depth: usize,
}

impl HttpPageLoader {
    pub fn new(http: Arc<HttpFetcher>, timeout: Duration, frame_depth: usize) -> Self {
        Self {
            http,
            timeout,
            frame_depth,
        }
    }

    async fn load_tree(&self, url: &str, kind: PageKind) -> Result<RenderedPage, AdapterError> {
        let resp = self.http.fetch_bytes(url, None).await?;
        let mut root = RenderedPage::new(resp.final_url.clone(), resp.text());
        if kind == PageKind::Detail {
            expand_frames(&mut root, self.frame_depth, |frame_url| {
                self.fetch_frame(frame_url, url)
            })
            .await;
        }
        Ok(root)
    }

    async fn fetch_frame(&self, frame_url: String, referer: &str) -> RenderedPage {
        match self.http.fetch_bytes(&frame_url, Some(referer)).await {
            Ok(resp) if resp.is_html() => RenderedPage::new(resp.final_url.clone(), resp.text()),
            Ok(resp) => RenderedPage::new(resp.final_url, String::new()),
            Err(err) => {
                warn!(frame = %frame_url, error = %err, "frame fetch failed");
                RenderedPage::new(frame_url, String::new())
            }
        }
    }
}

/// Loads the frames under `root`, breadth first, up to `frame_depth` levels,
/// and appends them to `root.frames` in discovery order. Frames whose address
/// ends in `.pdf` are recorded without being loaded.
pub(crate) async fn expand_frames<F, Fut>(root: &mut RenderedPage, frame_depth: usize, mut load_frame: F)
where
    F: FnMut(String) -> Fut,
    Fut: Future<Output = RenderedPage>,
{
    if frame_depth == 0 {
        return;
    }
    let mut seen: HashSet<String> = HashSet::from([root.url.clone()]);
    let mut queue: VecDeque<(String, usize)> = frame_sources(&root.url, &root.html)
        .into_iter()
        .map(|src| (src, 1))
        .collect();

    while let Some((frame_url, depth)) = queue.pop_front() {
        if !seen.insert(frame_url.clone()) {
            continue;
        }
        if frame_url.to_ascii_lowercase().ends_with(".pdf") {
            root.frames.push(RenderedPage::new(frame_url, String::new()));
            continue;
        }
        let frame = load_frame(frame_url).await;
        if depth < frame_depth {
            queue.extend(
                frame_sources(&frame.url, &frame.html)
                    .into_iter()
                    .map(|src| (src, depth + 1)),
            );
        }
        root.frames.push(frame);
    }
    debug!(url = %root.url, frames = root.frames.len(), "expanded frames");
}

#[async_trait]
impl PageLoader for HttpPageLoader {
    async fn load(&self, url: &str, kind: PageKind) -> Result<RenderedPage, AdapterError> {
        match tokio::time::timeout(self.timeout, self.load_tree(url, kind)).await {
            Ok(result) => result,
            Err(_) => Err(AdapterError::Timeout {
                url: url.to_string(),
                after: self.timeout,
            }),
        }
    }
}

/// Absolute addresses of the `iframe`/`frame` elements on a page.
pub fn frame_sources(url: &str, html: &str) -> Vec<String> {
    if html.trim().is_empty() {
        return Vec::new();
    }
    let Ok(page) = Page::parse(url, html) else {
        return Vec::new();
    };
    let Ok(frames) = page.select("iframe[src], frame[src]") else {
        return Vec::new();
    };
    frames
        .into_iter()
        .filter_map(|el| attr(el, "src"))
        .filter_map(|src| page.resolve(src))
        .filter(|u| matches!(u.scheme(), "http" | "https"))
        .map(String::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use circwatch_storage::HttpClientConfig;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn html(body: &str) -> ResponseTemplate {
        ResponseTemplate::new(200)
            .insert_header("content-type", "text/html")
            .set_body_string(body.to_string())
    }

    fn loader(timeout: Duration) -> HttpPageLoader {
        let http = Arc::new(HttpFetcher::new(HttpClientConfig::default()).unwrap());
        HttpPageLoader::new(http, timeout, 2)
    }

    #[test]
    fn frame_sources_resolve_relative_addresses() {
        let srcs = frame_sources(
            "https://example.gov/detail/1.html",
            r#"<iframe src="viewer.html?file=/a.pdf"></iframe><iframe src="https://cdn.example.gov/b.html"></iframe><iframe src="javascript:void(0)"></iframe>"#,
        );
        assert_eq!(
            srcs,
            vec![
                "https://example.gov/detail/viewer.html?file=/a.pdf".to_string(),
                "https://cdn.example.gov/b.html".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn detail_pages_pull_in_nested_frames() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/detail.html"))
            .respond_with(html(r#"<iframe src="/outer.html"></iframe>"#))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/outer.html"))
            .respond_with(html(r#"<iframe src="/docs/inner.pdf"></iframe>"#))
            .mount(&server)
            .await;

        let page = loader(Duration::from_secs(10))
            .load(&format!("{}/detail.html", server.uri()), PageKind::Detail)
            .await
            .unwrap();

        let frame_urls: Vec<_> = page.frames.iter().map(|f| f.url.as_str()).collect();
        assert_eq!(
            frame_urls,
            vec![
                format!("{}/outer.html", server.uri()),
                format!("{}/docs/inner.pdf", server.uri()),
            ]
        );
        assert!(page.frames[1].html.is_empty());
    }

    #[tokio::test]
    async fn listing_pages_skip_frames() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/listing.html"))
            .respond_with(html(r#"<iframe src="/ad.html"></iframe>"#))
            .mount(&server)
            .await;

        let page = loader(Duration::from_secs(10))
            .load(&format!("{}/listing.html", server.uri()), PageKind::Listing)
            .await
            .unwrap();
        assert!(page.frames.is_empty());
    }

    #[tokio::test]
    async fn slow_pages_time_out() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/slow.html"))
            .respond_with(html("<p>late</p>").set_delay(Duration::from_millis(800)))
            .mount(&server)
            .await;

        let err = loader(Duration::from_millis(100))
            .load(&format!("{}/slow.html", server.uri()), PageKind::Detail)
            .await
            .unwrap_err();
        assert!(matches!(err, AdapterError::Timeout { .. }));
    }
}
