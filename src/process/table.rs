use anyhow::{anyhow, Context, Result};
use arrow::{
    array::{new_null_array, Array, ArrayRef, StringArray},
    compute::concat_batches,
    csv::{ReaderBuilder, WriterBuilder},
    datatypes::{DataType, Field, Schema, SchemaRef},
    record_batch::{RecordBatch, RecordBatchOptions},
};
use glob::glob;
use std::{
    borrow::Cow,
    fs::{self, File},
    io::Cursor,
    path::{Path, PathBuf},
    sync::Arc,
};
use tracing::{debug, info, warn};

use crate::process::normalize::normalize_batch;

const BATCH_SIZE: usize = 64 * 1024;

/// Text encoding of a delimited source file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Encoding {
    Utf8,
    /// ISO-8859-1: every byte is the code point of the same value.
    Latin1,
}

#[derive(Clone, Copy, Debug)]
pub struct CsvFormat {
    pub delimiter: u8,
    pub encoding: Encoding,
}

impl Default for CsvFormat {
    fn default() -> Self {
        Self {
            delimiter: b',',
            encoding: Encoding::Utf8,
        }
    }
}

impl CsvFormat {
    pub fn semicolon(encoding: Encoding) -> Self {
        Self {
            delimiter: b';',
            encoding,
        }
    }
}

fn decode(bytes: &[u8], encoding: Encoding) -> Result<Cow<'_, str>> {
    match encoding {
        Encoding::Utf8 => std::str::from_utf8(bytes)
            .map(Cow::Borrowed)
            .context("input is not valid UTF-8"),
        Encoding::Latin1 => Ok(Cow::Owned(bytes.iter().map(|&b| b as char).collect())),
    }
}

fn utf8_schema(names: &[String]) -> Schema {
    Schema::new(
        names
            .iter()
            .map(|n| Field::new(n, DataType::Utf8, true))
            .collect::<Vec<_>>(),
    )
}

/// An in-memory table of nullable string columns.
#[derive(Clone, Debug)]
pub struct Table {
    batch: RecordBatch,
}

impl Table {
    pub fn empty() -> Self {
        Self {
            batch: RecordBatch::new_empty(Arc::new(Schema::empty())),
        }
    }

    /// Build a table from column names and string rows. Rows shorter than the
    /// header are padded with nulls.
    pub fn from_rows(names: &[&str], rows: &[Vec<Option<&str>>]) -> Result<Self> {
        let owned: Vec<String> = names.iter().map(|s| s.to_string()).collect();
        let schema = Arc::new(utf8_schema(&owned));
        let cols: Vec<ArrayRef> = (0..names.len())
            .map(|i| {
                let arr: StringArray = rows.iter().map(|r| r.get(i).copied().flatten()).collect();
                Arc::new(arr) as ArrayRef
            })
            .collect();
        let batch = RecordBatch::try_new_with_options(
            schema,
            cols,
            &RecordBatchOptions::new().with_row_count(Some(rows.len())),
        )?;
        Ok(Self { batch })
    }

    /// Parse delimited text with a header line. Every column is read as text.
    pub fn from_csv_bytes(bytes: &[u8], format: CsvFormat) -> Result<Self> {
        let text = decode(bytes, format.encoding)?;
        if text.trim().is_empty() {
            return Ok(Self::empty());
        }

        let mut header_reader = csv::ReaderBuilder::new()
            .delimiter(format.delimiter)
            .has_headers(true)
            .from_reader(text.as_bytes());
        let names: Vec<String> = header_reader
            .headers()
            .context("reading CSV header")?
            .iter()
            .map(|h| h.trim().to_string())
            .collect();
        let schema: SchemaRef = Arc::new(utf8_schema(&names));

        let reader = ReaderBuilder::new(schema.clone())
            .with_header(true)
            .with_delimiter(format.delimiter)
            .with_quote(b'"')
            .with_batch_size(BATCH_SIZE)
            .build(Cursor::new(text.as_bytes()))
            .context("creating CSV reader")?;

        let mut batches = Vec::new();
        for batch in reader {
            batches.push(batch.context("reading CSV batch")?);
        }
        let batch = concat_batches(&schema, &batches).context("joining CSV batches")?;
        Ok(Self { batch })
    }

    pub fn read_csv(path: &Path, format: CsvFormat) -> Result<Self> {
        let bytes = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
        Self::from_csv_bytes(&bytes, format).with_context(|| format!("parsing {}", path.display()))
    }

    /// Stack tables vertically. The result carries the union of all column
    /// names in first-seen order; cells of columns a fragment lacks are null.
    pub fn concat(tables: &[Table]) -> Result<Self> {
        let mut names: Vec<String> = Vec::new();
        for t in tables {
            for name in t.column_names() {
                if !names.iter().any(|n| n == name) {
                    names.push(name.to_string());
                }
            }
        }
        let schema: SchemaRef = Arc::new(utf8_schema(&names));
        let total: usize = tables.iter().map(Table::num_rows).sum();
        if names.is_empty() {
            let batch = RecordBatch::try_new_with_options(
                schema,
                vec![],
                &RecordBatchOptions::new().with_row_count(Some(total)),
            )?;
            return Ok(Self { batch });
        }

        let aligned = tables
            .iter()
            .map(|t| t.align_to(&schema))
            .collect::<Result<Vec<_>>>()?;
        let batch = concat_batches(&schema, &aligned).context("concatenating tables")?;
        Ok(Self { batch })
    }

    fn align_to(&self, schema: &SchemaRef) -> Result<RecordBatch> {
        let rows = self.num_rows();
        let cols = schema
            .fields()
            .iter()
            .map(|f| match self.batch.column_by_name(f.name()) {
                Some(col) if col.data_type() == &DataType::Utf8 => Ok(col.clone()),
                Some(col) => Err(anyhow!(
                    "column {} is {:?}, expected text",
                    f.name(),
                    col.data_type()
                )),
                None => Ok(new_null_array(&DataType::Utf8, rows)),
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(RecordBatch::try_new_with_options(
            schema.clone(),
            cols,
            &RecordBatchOptions::new().with_row_count(Some(rows)),
        )?)
    }

    pub fn num_rows(&self) -> usize {
        self.batch.num_rows()
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.batch
            .schema_ref()
            .fields()
            .iter()
            .map(|f| f.name().as_str())
            .collect()
    }

    pub fn column(&self, name: &str) -> Option<&StringArray> {
        self.batch
            .column_by_name(name)
            .and_then(|c| c.as_any().downcast_ref::<StringArray>())
    }

    /// Cells of `name`, `None` for nulls. Errors when the column is missing.
    pub fn values(&self, name: &str) -> Result<Vec<Option<&str>>> {
        let col = self
            .column(name)
            .ok_or_else(|| anyhow!("missing column `{}`", name))?;
        Ok(col.iter().collect())
    }

    /// Text-normalize every string cell, see `normalize_text`.
    pub fn normalized(&self) -> Result<Self> {
        Ok(Self {
            batch: normalize_batch(&self.batch)?,
        })
    }

    /// Write as UTF-8 CSV with a header line. Returns the file size.
    pub fn write_csv(&self, path: &Path) -> Result<u64> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
        let mut writer = WriterBuilder::new().with_header(true).build(file);
        writer
            .write(&self.batch)
            .with_context(|| format!("writing {}", path.display()))?;
        drop(writer);
        let size = fs::metadata(path)?.len();
        debug!(path = %path.display(), rows = self.num_rows(), bytes = size, "table written");
        Ok(size)
    }
}

/// Fragment files in `dir` matching `pattern`, sorted by file name.
pub fn list_fragments(dir: &Path, pattern: &str) -> Result<Vec<PathBuf>> {
    let full = format!("{}/{}", dir.display(), pattern);
    let mut paths = Vec::new();
    for entry in glob(&full).with_context(|| format!("invalid glob pattern {}", full))? {
        match entry {
            Ok(p) if p.is_file() => paths.push(p),
            Ok(_) => {}
            Err(e) => warn!("cannot read glob entry: {:?}", e),
        }
    }
    paths.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
    Ok(paths)
}

/// Read every fragment of `dir` (sorted by file name) and concatenate them.
pub fn concat_fragments(dir: &Path, pattern: &str, format: CsvFormat) -> Result<Table> {
    let paths = list_fragments(dir, pattern)?;
    let mut tables = Vec::with_capacity(paths.len());
    for p in &paths {
        let t = Table::read_csv(p, format)?;
        info!(file = %p.display(), rows = t.num_rows(), "fragment loaded");
        tables.push(t);
    }
    Table::concat(&tables)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use proptest::test_runner::Config;
    use tempfile::tempdir;

    fn ids(t: &Table) -> Vec<Option<String>> {
        t.values("id")
            .unwrap()
            .into_iter()
            .map(|v| v.map(str::to_string))
            .collect()
    }

    #[test]
    fn test_two_fragments_keep_order() {
        let tmp = tempdir().unwrap();
        fs::write(tmp.path().join("b.csv"), "id,name\n3,Cy\n").unwrap();
        fs::write(tmp.path().join("a.csv"), "id,name\n1,Ada\n2,Bob\n").unwrap();

        let t = concat_fragments(tmp.path(), "*.csv", CsvFormat::default()).unwrap();
        assert_eq!(t.num_rows(), 3);
        assert_eq!(t.column_names(), vec!["id", "name"]);
        assert_eq!(
            ids(&t),
            vec![Some("1".into()), Some("2".into()), Some("3".into())]
        );
        assert_eq!(t.values("name").unwrap(), vec![Some("Ada"), Some("Bob"), Some("Cy")]);
    }

    #[test]
    fn test_concat_takes_column_union() {
        let a = Table::from_rows(&["id", "name"], &[vec![Some("1"), Some("Ada")]]).unwrap();
        let b = Table::from_rows(
            &["id", "city"],
            &[vec![Some("2"), Some("Lyon")], vec![Some("3"), None]],
        )
        .unwrap();
        let c = Table::from_rows(&["zip"], &[]).unwrap();

        let t = Table::concat(&[a.clone(), b.clone(), c.clone()]).unwrap();
        assert_eq!(t.num_rows(), a.num_rows() + b.num_rows() + c.num_rows());
        assert_eq!(t.column_names(), vec!["id", "name", "city", "zip"]);
        assert_eq!(t.values("name").unwrap(), vec![Some("Ada"), None, None]);
        assert_eq!(t.values("city").unwrap(), vec![None, Some("Lyon"), None]);
        assert_eq!(t.values("zip").unwrap(), vec![None, None, None]);
    }

    #[test]
    fn test_concat_of_nothing_is_empty() {
        let t = Table::concat(&[]).unwrap();
        assert_eq!(t.num_rows(), 0);
        assert!(t.column_names().is_empty());
    }

    #[test]
    fn test_latin1_semicolon_source() {
        // "Société" in ISO-8859-1
        let bytes = b"id;titre\nW1;Soci\xe9t\xe9 La Joie\n";
        let t = Table::from_csv_bytes(bytes, CsvFormat::semicolon(Encoding::Latin1)).unwrap();
        assert_eq!(t.values("titre").unwrap(), vec![Some("Soci\u{e9}t\u{e9} La Joie")]);
    }

    #[test]
    fn test_invalid_utf8_is_an_error() {
        let bytes = b"id\n\xff\n";
        assert!(Table::from_csv_bytes(bytes, CsvFormat::default()).is_err());
    }

    #[test]
    fn test_write_csv_round_trip_with_quotes() {
        let tmp = tempdir().unwrap();
        let t = Table::from_rows(
            &["id", "titre"],
            &[vec![Some("1"), Some("a,b")], vec![Some("2"), None]],
        )
        .unwrap();
        let path = tmp.path().join("out").join("base.csv");
        let size = t.write_csv(&path).unwrap();
        let text = fs::read_to_string(&path).unwrap();
        assert_eq!(size as usize, text.len());
        assert_eq!(text, "id,titre\n1,\"a,b\"\n2,\n");
    }

    #[test]
    fn test_normalized_table() {
        let t = Table::from_rows(&["titre"], &[vec![Some("Fête (été)")], vec![None]]).unwrap();
        let n = t.normalized().unwrap();
        assert_eq!(n.values("titre").unwrap(), vec![Some("Fete ete"), None]);
    }

    type Fragment = (Vec<String>, Vec<Vec<Option<String>>>);

    /// Distinct column names drawn from a small alphabet, so fragments overlap.
    fn fragment() -> impl Strategy<Value = Fragment> {
        prop::collection::btree_set("[a-e]", 1..4).prop_flat_map(|names| {
            let names: Vec<String> = names.into_iter().collect();
            let width = names.len();
            let rows = prop::collection::vec(
                prop::collection::vec(prop::option::of("[a-z0-9]{0,3}"), width),
                0..5,
            );
            (Just(names), rows)
        })
    }

    fn to_table((names, rows): &Fragment) -> Table {
        let names: Vec<&str> = names.iter().map(String::as_str).collect();
        let rows: Vec<Vec<Option<&str>>> = rows
            .iter()
            .map(|r| r.iter().map(|c| c.as_deref()).collect())
            .collect();
        Table::from_rows(&names, &rows).unwrap()
    }

    proptest! {
        #![proptest_config(Config::with_cases(128))]
        #[test]
        fn concat_keeps_every_row_and_column(fragments in prop::collection::vec(fragment(), 0..5)) {
            let tables: Vec<Table> = fragments.iter().map(to_table).collect();
            let out = Table::concat(&tables).unwrap();

            let expected_rows: usize = fragments.iter().map(|(_, rows)| rows.len()).sum();
            prop_assert_eq!(out.num_rows(), expected_rows);

            let columns = out.column_names();
            let mut union: Vec<&str> = Vec::new();
            for (names, _) in &fragments {
                for n in names {
                    if !union.contains(&n.as_str()) {
                        union.push(n.as_str());
                    }
                }
            }
            prop_assert_eq!(&columns, &union);

            // each fragment lands at its offset, nulls where it lacks a column
            let mut offset = 0;
            for (names, rows) in &fragments {
                for col in &columns {
                    let cells = out.values(col).unwrap();
                    let slice = &cells[offset..offset + rows.len()];
                    match names.iter().position(|n| n == col) {
                        Some(i) => {
                            let want: Vec<Option<&str>> = rows.iter().map(|r| r[i].as_deref()).collect();
                            prop_assert_eq!(slice, want.as_slice());
                        }
                        None => prop_assert!(slice.iter().all(Option::is_none)),
                    }
                }
                offset += rows.len();
            }
        }
    }
}
