//! Listing-page extraction: the first table wins; generic content-area
//! anchors are the fallback.

use std::collections::HashSet;

use circwatch_core::Candidate;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::page::{
    attr, element_text, parent_previous_element_text, previous_sibling_text, select_within, Page,
};
use crate::AdapterError;

pub const FALLBACK_ANCHOR_SELECTOR: &str =
    "div#content a, div.listing a, ul li a, div.content a, div#main a";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ListingTier {
    Table,
    Anchors,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListingExtraction {
    pub tier: ListingTier,
    pub candidates: Vec<Candidate>,
}

#[derive(Debug, Clone)]
pub struct ListingExtractor {
    fallback_selector: String,
}

impl Default for ListingExtractor {
    fn default() -> Self {
        Self {
            fallback_selector: FALLBACK_ANCHOR_SELECTOR.to_string(),
        }
    }
}

impl ListingExtractor {
    pub fn with_fallback_selector(selector: impl Into<String>) -> Self {
        Self {
            fallback_selector: selector.into(),
        }
    }

    /// Ordered candidates, newest first as rendered, at most `max_count`.
    /// An empty result from both tiers is an error.
    pub fn extract(&self, page: &Page, max_count: usize) -> Result<ListingExtraction, AdapterError> {
        let mut extraction = match self.from_table(page)? {
            rows if !rows.is_empty() => ListingExtraction {
                tier: ListingTier::Table,
                candidates: rows,
            },
            _ => ListingExtraction {
                tier: ListingTier::Anchors,
                candidates: self.from_anchors(page)?,
            },
        };
        if extraction.candidates.is_empty() {
            return Err(AdapterError::NoCandidates {
                url: page.url().to_string(),
            });
        }
        debug!(
            tier = ?extraction.tier,
            found = extraction.candidates.len(),
            "extracted listing candidates"
        );
        extraction.candidates.truncate(max_count);
        Ok(extraction)
    }

    fn from_table(&self, page: &Page) -> Result<Vec<Candidate>, AdapterError> {
        let Some(table) = page.first("table")? else {
            return Ok(Vec::new());
        };
        let mut rows = select_within(table, "tbody tr")?;
        if rows.is_empty() {
            rows = select_within(table, "tr")?;
        }

        let mut out = Vec::new();
        for row in rows {
            let cells = select_within(row, "td")?;
            let Some(first_cell) = cells.first() else {
                continue;
            };
            let date = element_text(*first_cell);
            let second_cell_text = || cells.get(1).map(|c| element_text(*c)).unwrap_or_default();

            let (title, link) = match select_within(row, "a")?.into_iter().next() {
                Some(anchor) => {
                    let link = attr(anchor, "href")
                        .and_then(|href| page.resolve(href))
                        .map(String::from)
                        .unwrap_or_default();
                    let text = element_text(anchor);
                    let title = if text.is_empty() { second_cell_text() } else { text };
                    (title, link)
                }
                None => (second_cell_text(), String::new()),
            };
            if title.is_empty() {
                continue;
            }
            out.push(Candidate::new(date, title, link));
        }
        Ok(out)
    }

    fn from_anchors(&self, page: &Page) -> Result<Vec<Candidate>, AdapterError> {
        let mut seen: HashSet<(String, String)> = HashSet::new();
        let mut out = Vec::new();
        for anchor in page.select(&self.fallback_selector)? {
            let title = element_text(anchor);
            if title.is_empty() {
                continue;
            }
            let link = attr(anchor, "href")
                .and_then(|href| page.resolve(href))
                .map(String::from)
                .unwrap_or_default();
            if !seen.insert((title.clone(), link.clone())) {
                continue;
            }
            let mut date = previous_sibling_text(anchor);
            if date.is_empty() {
                date = parent_previous_element_text(anchor);
            }
            out.push(Candidate::new(date, title, link));
        }
        Ok(out)
    }
}
