// src/fetch/mod.rs

/// JSON listing endpoints: numbered pages and `next_page` chains.
pub mod api;
/// Verbatim downloads and archive extraction.
pub mod files;
/// HTML directory-index crawling.
pub mod urls;
