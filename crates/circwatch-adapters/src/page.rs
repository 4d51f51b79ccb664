//! Document capability over a parsed page: selector queries, attribute and
//! text reads, sibling lookups and sub-frames.

use circwatch_core::collapse_whitespace;
use scraper::{ElementRef, Html, Selector};
use url::Url;

use crate::loader::RenderedPage;
use crate::AdapterError;

/// A parsed page plus the frames that were loaded with it.
pub struct Page {
    url: Url,
    html: Html,
    frames: Vec<Page>,
}

impl Page {
    pub fn parse(url: &str, html: &str) -> Result<Self, AdapterError> {
        let url = Url::parse(url).map_err(|e| AdapterError::InvalidUrl {
            url: url.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self {
            url,
            html: Html::parse_document(html),
            frames: Vec::new(),
        })
    }

    pub fn from_rendered(rendered: &RenderedPage) -> Result<Self, AdapterError> {
        let mut page = Self::parse(&rendered.url, &rendered.html)?;
        page.frames = rendered
            .frames
            .iter()
            .map(Self::from_rendered)
            .collect::<Result<_, _>>()?;
        Ok(page)
    }

    pub fn with_frames(mut self, frames: Vec<Page>) -> Self {
        self.frames = frames;
        self
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn frames(&self) -> &[Page] {
        &self.frames
    }

    pub fn select(&self, selector: &str) -> Result<Vec<ElementRef<'_>>, AdapterError> {
        let sel = parse_selector(selector)?;
        Ok(self.html.select(&sel).collect())
    }

    pub fn first(&self, selector: &str) -> Result<Option<ElementRef<'_>>, AdapterError> {
        let sel = parse_selector(selector)?;
        Ok(self.html.select(&sel).next())
    }

    /// Joins `href` against this page's own address.
    pub fn resolve(&self, href: &str) -> Option<Url> {
        let href = href.trim();
        if href.is_empty() {
            return None;
        }
        self.url.join(href).ok()
    }
}

pub(crate) fn parse_selector(selector: &str) -> Result<Selector, AdapterError> {
    Selector::parse(selector).map_err(|e| AdapterError::Selector {
        selector: selector.to_string(),
        reason: e.to_string(),
    })
}

pub fn select_within<'a>(
    element: ElementRef<'a>,
    selector: &str,
) -> Result<Vec<ElementRef<'a>>, AdapterError> {
    let sel = parse_selector(selector)?;
    Ok(element.select(&sel).collect())
}

/// Whitespace-normalized text content.
pub fn element_text(element: ElementRef<'_>) -> String {
    collapse_whitespace(&element.text().collect::<String>())
}

pub fn attr<'a>(element: ElementRef<'a>, name: &str) -> Option<&'a str> {
    element.value().attr(name).map(str::trim).filter(|v| !v.is_empty())
}

/// Text of the node immediately before `element`, text node or element.
pub fn previous_sibling_text(element: ElementRef<'_>) -> String {
    let Some(prev) = element.prev_sibling() else {
        return String::new();
    };
    if let Some(text) = prev.value().as_text() {
        return collapse_whitespace(text);
    }
    ElementRef::wrap(prev).map(element_text).unwrap_or_default()
}

/// Text of the element sibling preceding `element`'s parent.
pub fn parent_previous_element_text(element: ElementRef<'_>) -> String {
    element
        .parent()
        .into_iter()
        .flat_map(|parent| parent.prev_siblings())
        .find_map(ElementRef::wrap)
        .map(element_text)
        .unwrap_or_default()
}
