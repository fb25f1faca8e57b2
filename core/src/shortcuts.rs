use std::collections::HashMap;
use std::io::Read;

use anyhow::{Context, Result, bail};

use crate::cleaning::stem;

const BUILTIN_SHORTCUTS: &str = include_str!("../data/shortcuts.csv");

/// Authored mapping from cleaned ingredient names to reference ids.
///
/// Shortcuts override search for common generic terms where the dataset's top
/// hit is misleading. They are authored data, not a cache, and never expire.
#[derive(Debug, Clone, Default)]
pub struct ShortcutTable {
    entries: HashMap<String, i64>,
}

impl ShortcutTable {
    /// The table shipped with the crate.
    pub fn builtin() -> Result<Self> {
        Self::from_csv(BUILTIN_SHORTCUTS.as_bytes()).context("Invalid built-in shortcut table")
    }

    /// Parse `cleaned_name,reference_id[,description]` rows.
    pub fn from_csv<R: Read>(reader: R) -> Result<Self> {
        let mut rdr = csv::ReaderBuilder::new()
            .flexible(true)
            .trim(csv::Trim::All)
            .from_reader(reader);

        let headers = rdr.headers().context("Failed to read CSV headers")?.clone();
        let col =
            |name: &str| -> Option<usize> { headers.iter().position(|h| h.eq_ignore_ascii_case(name)) };
        let idx_name = col("cleaned_name").context("Missing 'cleaned_name' column")?;
        let idx_id = col("reference_id").context("Missing 'reference_id' column")?;

        let mut entries = HashMap::new();
        for (line_num, result) in rdr.records().enumerate() {
            let record =
                result.with_context(|| format!("Failed to parse shortcut row {}", line_num + 2))?;
            let name = record.get(idx_name).unwrap_or("").trim();
            if name.is_empty() {
                continue;
            }
            let id: i64 = record
                .get(idx_id)
                .unwrap_or("")
                .parse()
                .with_context(|| format!("Invalid reference_id for shortcut '{name}'"))?;
            if entries.insert(normalize_key(name), id).is_some() {
                bail!("Duplicate shortcut '{name}'");
            }
        }
        Ok(Self { entries })
    }

    #[must_use]
    pub fn from_pairs<'a>(pairs: impl IntoIterator<Item = (&'a str, i64)>) -> Self {
        Self {
            entries: pairs
                .into_iter()
                .map(|(k, v)| (normalize_key(k), v))
                .collect(),
        }
    }

    #[must_use]
    pub fn get(&self, cleaned: &str) -> Option<i64> {
        self.entries.get(&normalize_key(cleaned)).copied()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn normalize_key(name: &str) -> String {
    name.split_whitespace()
        .map(|t| stem(&t.to_lowercase()).to_string())
        .collect::<Vec<_>>()
        .join(" ")
}
