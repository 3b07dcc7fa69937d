// src/process/mod.rs
pub mod metrics;
pub mod normalize;
pub mod table;

pub use normalize::normalize_text;
pub use table::{concat_fragments, CsvFormat, Encoding, Table};
