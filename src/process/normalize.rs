use anyhow::{Context, Result};
use arrow::{
    array::{Array, ArrayRef, StringArray},
    record_batch::RecordBatch,
};
use deunicode::deunicode;
use std::{fmt::Write, sync::Arc};

/// Punctuation removed from every normalized cell.
pub const PUNCTUATION: &str = "!\"#$%&'()*+/;?@[]^_`{|}~";

/// Normalize one text cell:
///  1) transliterate to ASCII
///  2) drop `PUNCTUATION`
///  3) escape control and non-ASCII remnants (`\t`, `\n`, `\r`, `\xNN`, `\uNNNN`)
///  4) drop the escape marker itself, backslashes included
///
/// The output only holds printable ASCII outside `PUNCTUATION` and `\`, so
/// normalizing twice is the same as normalizing once.
pub fn normalize_text(raw: &str) -> String {
    let ascii = deunicode(raw);
    let mut out = String::with_capacity(ascii.len());
    for c in ascii.chars() {
        if PUNCTUATION.contains(c) {
            continue;
        }
        match c {
            '\\' => {}
            '\t' => out.push('t'),
            '\n' => out.push('n'),
            '\r' => out.push('r'),
            c if (c as u32) < 0x20 || c as u32 == 0x7f => {
                let _ = write!(out, "x{:02x}", c as u32);
            }
            c if (c as u32) < 0x80 => out.push(c),
            c if (c as u32) < 0x100 => {
                let _ = write!(out, "x{:02x}", c as u32);
            }
            c if (c as u32) < 0x10000 => {
                let _ = write!(out, "u{:04x}", c as u32);
            }
            c => {
                let _ = write!(out, "U{:08x}", c as u32);
            }
        }
    }
    out
}

/// Apply `normalize_text` to every non-null cell of every UTF-8 column.
/// Columns of other types pass through unchanged.
pub fn normalize_batch(batch: &RecordBatch) -> Result<RecordBatch> {
    let cols: Vec<ArrayRef> = batch
        .columns()
        .iter()
        .map(|arr| match arr.as_any().downcast_ref::<StringArray>() {
            Some(sarr) => {
                let normalized: StringArray =
                    sarr.iter().map(|opt| opt.map(normalize_text)).collect();
                Arc::new(normalized) as ArrayRef
            }
            None => arr.clone(),
        })
        .collect();

    RecordBatch::try_new(batch.schema(), cols).context("rebuilding normalized batch")
}
