//! Filename derivation and sanitization for downloaded documents.

use std::path::Path;

use url::Url;

/// Exclusive upper bound on a derived file name, `.pdf` suffix included.
pub const DEFAULT_MAX_FILENAME_CHARS: usize = 150;

const FALLBACK_STEM: &str = "document";
const PDF_SUFFIX: &str = ".pdf";

/// Sanitizes `raw` into a filesystem-safe name that always ends in `.pdf`.
///
/// Characters illegal on common filesystems (`/ \ : * ? " < > |`) and control
/// characters become `_`, and whitespace runs collapse to a single space. The
/// stem is cut so the whole name, suffix included, stays shorter than
/// `max_filename_chars`. An empty result falls back to `fallback`, then to
/// `document`.
pub fn safe_pdf_filename(raw: &str, fallback: &str, max_filename_chars: usize) -> String {
    let stem_budget = max_filename_chars
        .saturating_sub(PDF_SUFFIX.len() + 1)
        .max(1);
    sanitize_name(raw, stem_budget)
        .or_else(|| sanitize_name(fallback, stem_budget))
        .unwrap_or_else(|| format!("{FALLBACK_STEM}{PDF_SUFFIX}"))
}

/// Picks the local name for a resolved document URL: the URL's own file name
/// when it has an extension, otherwise the entry title plus `.pdf`.
pub fn choose_pdf_filename(pdf_url: &str, title: &str, max_filename_chars: usize) -> String {
    match url_file_name(pdf_url) {
        Some(name) if name.contains('.') => safe_pdf_filename(&name, title, max_filename_chars),
        _ => safe_pdf_filename(title, FALLBACK_STEM, max_filename_chars),
    }
}

fn url_file_name(pdf_url: &str) -> Option<String> {
    let parsed = Url::parse(pdf_url).ok()?;
    let decoded = urlencoding::decode(parsed.path()).ok()?;
    let name = Path::new(decoded.as_ref()).file_name()?.to_str()?.to_string();
    (!name.trim().is_empty()).then_some(name)
}

fn sanitize_name(raw: &str, stem_budget: usize) -> Option<String> {
    let mut replaced = String::with_capacity(raw.len());
    let mut in_illegal_run = false;
    for ch in raw.chars() {
        let mapped = match ch {
            c if c.is_whitespace() => ' ',
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        };
        if mapped == '_' && ch != '_' {
            if !in_illegal_run {
                replaced.push('_');
            }
            in_illegal_run = true;
        } else {
            replaced.push(mapped);
            in_illegal_run = false;
        }
    }

    let collapsed = replaced.split_whitespace().collect::<Vec<_>>().join(" ");
    // Keep an existing suffix as written (`.PDF` stays `.PDF`).
    let (stem, suffix) = if collapsed.to_ascii_lowercase().ends_with(PDF_SUFFIX) {
        collapsed.split_at(collapsed.len() - PDF_SUFFIX.len())
    } else {
        (collapsed.as_str(), PDF_SUFFIX)
    };
    let truncated: String = stem.chars().take(stem_budget).collect();
    let stem = truncated.trim();
    (!stem.is_empty()).then(|| format!("{stem}{suffix}"))
}
