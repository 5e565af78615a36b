//! Key=value metadata blocks and the plain-text output writers.
//!
//! All on-disk text artifacts share one format: lines starting with `##` are
//! free-text headers, lines starting with `#` carry `key = value` metadata,
//! everything else is data.

use std::collections::BTreeMap;
use std::fmt::Display;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;

use crate::errors::Result;

pub type MetadataMap = BTreeMap<String, String>;

/// Render a metadata map as `<prefix> key = value` lines.
pub fn metadata_lines(meta: &MetadataMap, prefix: &str) -> String {
    let mut out = String::new();
    for (k, v) in meta {
        if prefix.is_empty() {
            out.push_str(&format!("{k} = {v}\n"));
        } else {
            out.push_str(&format!("{prefix} {k} = {v}\n"));
        }
    }
    out
}

/// Append (or create) a metadata block in a file such as `info.dat`.
///
/// The free-text header goes first as `## ...` lines, then the map.
pub fn write_metadata_block(
    path: &Path,
    meta: &MetadataMap,
    header_text: &str,
    append: bool,
) -> Result<()> {
    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .append(append)
        .truncate(!append)
        .open(path)?;
    for line in header_text.lines() {
        writeln!(file, "## {line}")?;
    }
    file.write_all(metadata_lines(meta, "#").as_bytes())?;
    writeln!(file)?;
    Ok(())
}

/// Writer for single-column time series (`*.series` files).
#[derive(Default, Clone)]
pub struct DataSeriesWriter {
    header: String,
}

impl DataSeriesWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_meta<V: Display>(&mut self, key: &str, val: V) {
        self.header.push_str(&format!("# {key} = {val}\n"));
    }

    pub fn add_metadata_map(&mut self, meta: &MetadataMap) {
        self.header.push_str(&metadata_lines(meta, "#"));
    }

    pub fn add_header_text(&mut self, text: &str) {
        for line in text.lines() {
            self.header.push_str(&format!("## {line}\n"));
        }
    }

    pub fn write_to_file(&self, path: &Path, data: &[f64]) -> Result<()> {
        let mut file = File::create(path)?;
        file.write_all(self.header.as_bytes())?;
        for v in data {
            writeln!(file, "{v:.14e}")?;
        }
        Ok(())
    }
}

/// Writer for `index → value` tables (`*.values` files).
///
/// Rows are tab-separated so downstream tooling can read them as TSV.
#[derive(Default, Clone)]
pub struct IntDoubleMapWriter {
    header: String,
}

impl IntDoubleMapWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_meta<V: Display>(&mut self, key: &str, val: V) {
        self.header.push_str(&format!("# {key} = {val}\n"));
    }

    pub fn add_metadata_map(&mut self, meta: &MetadataMap) {
        self.header.push_str(&metadata_lines(meta, "#"));
    }

    pub fn add_header_text(&mut self, text: &str) {
        for line in text.lines() {
            self.header.push_str(&format!("## {line}\n"));
        }
    }

    pub fn write_to_file(&self, path: &Path, data: &BTreeMap<usize, f64>) -> Result<()> {
        let mut file = File::create(path)?;
        file.write_all(self.header.as_bytes())?;
        let mut wtr = csv::WriterBuilder::new()
            .delimiter(b'\t')
            .has_headers(false)
            .from_writer(file);
        for (k, v) in data {
            wtr.write_record(&[k.to_string(), format!("{v:.10e}")])
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        }
        wtr.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metadata_lines_are_sorted_and_prefixed() {
        let mut meta = MetadataMap::new();
        meta.insert("beta".into(), "1".into());
        meta.insert("L".into(), "4".into());
        let s = metadata_lines(&meta, "#");
        // BTreeMap: "L" sorts before "beta"
        assert_eq!(s, "# L = 4\n# beta = 1\n");
    }
}
