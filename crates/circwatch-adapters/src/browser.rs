//! Headless Chromium loader for pages whose content is filled in client side.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::error::CdpError;
use futures_util::StreamExt;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::loader::{expand_frames, PageKind, PageLoader, RenderedPage};
use crate::AdapterError;

#[derive(Debug, Clone)]
pub struct BrowserOptions {
    /// Chromium binary; auto-detected when `None`.
    pub executable: Option<PathBuf>,
    /// Bound on each page or frame render.
    pub timeout: Duration,
    pub frame_depth: usize,
}

impl Default for BrowserOptions {
    fn default() -> Self {
        Self {
            executable: None,
            timeout: Duration::from_secs(45),
            frame_depth: 2,
        }
    }
}

/// Renders every page in a fresh tab of one shared headless browser, then
/// renders its frames the same way.
pub struct BrowserPageLoader {
    browser: Browser,
    handler: JoinHandle<()>,
    timeout: Duration,
    frame_depth: usize,
}

impl BrowserPageLoader {
    pub async fn launch(options: BrowserOptions) -> Result<Self, AdapterError> {
        let mut builder = BrowserConfig::builder()
            .no_sandbox()
            .request_timeout(options.timeout);
        if let Some(executable) = &options.executable {
            builder = builder.chrome_executable(executable);
        }
        let config = builder.build().map_err(AdapterError::Browser)?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| AdapterError::Browser(format!("launching browser: {e}")))?;
        let handler = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(err) = event {
                    debug!(error = %err, "browser handler stopped");
                    break;
                }
            }
        });
        info!("headless browser started");

        Ok(Self {
            browser,
            handler,
            timeout: options.timeout,
            frame_depth: options.frame_depth,
        })
    }

    async fn render(&self, url: &str) -> Result<RenderedPage, AdapterError> {
        let page = self
            .browser
            .new_page("about:blank")
            .await
            .map_err(|e| AdapterError::Browser(format!("opening tab: {e}")))?;

        let rendered = tokio::time::timeout(self.timeout, async {
            page.goto(url).await?;
            page.wait_for_navigation().await?;
            let html = page.content().await?;
            let final_url = page.url().await?.unwrap_or_else(|| url.to_string());
            Ok::<_, CdpError>(RenderedPage::new(final_url, html))
        })
        .await;

        // Tabs are not closed on drop.
        if let Err(err) = page.close().await {
            debug!(url, error = %err, "closing tab failed");
        }

        match rendered {
            Ok(Ok(page)) => Ok(page),
            Ok(Err(err)) => Err(AdapterError::Browser(format!("rendering {url}: {err}"))),
            Err(_) => Err(AdapterError::Timeout {
                url: url.to_string(),
                after: self.timeout,
            }),
        }
    }

    async fn render_frame(&self, frame_url: String) -> RenderedPage {
        match self.render(&frame_url).await {
            Ok(frame) => frame,
            Err(err) => {
                warn!(frame = %frame_url, error = %err, "frame render failed");
                RenderedPage::new(frame_url, String::new())
            }
        }
    }
}

#[async_trait]
impl PageLoader for BrowserPageLoader {
    async fn load(&self, url: &str, kind: PageKind) -> Result<RenderedPage, AdapterError> {
        let mut root = self.render(url).await?;
        if kind == PageKind::Detail {
            expand_frames(&mut root, self.frame_depth, |frame_url| {
                self.render_frame(frame_url)
            })
            .await;
        }
        Ok(root)
    }
}

impl Drop for BrowserPageLoader {
    fn drop(&mut self) {
        self.handler.abort();
    }
}
