use std::collections::HashMap;
use std::io::Read;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::{Context, Result, bail};
use rusqlite::{Connection, OpenFlags, OptionalExtension, params, params_from_iter};

use crate::cleaning::{significant_tokens, stem};
use crate::models::{Micronutrient, ReferenceRecord};
use crate::shortcuts::ShortcutTable;

/// Nutrient ids of the four macros in the provisioned dataset.
pub const NUTRIENT_ENERGY: i64 = 1008;
pub const NUTRIENT_PROTEIN: i64 = 1003;
pub const NUTRIENT_FAT: i64 = 1004;
pub const NUTRIENT_CARBS: i64 = 1005;

/// Categories whose rows are never offered as candidates.
const EXCLUDED_CATEGORIES: &[&str] = &["Baby Foods", "Infant Formula"];

/// Read-only lookups over the canonical nutrition dataset.
///
/// "Not found" is `Ok(None)` / an empty list, never an error.
pub trait ReferenceStore: Send + Sync {
    fn lookup_by_shortcut(&self, key: &str) -> Result<Option<ReferenceRecord>>;
    fn lookup_by_id(&self, id: i64) -> Result<Option<ReferenceRecord>>;
    fn find_exact(&self, cleaned: &str) -> Result<Option<ReferenceRecord>>;
    /// AND over significant tokens, relaxing to OR when AND finds nothing.
    fn search_candidates(&self, cleaned: &str, limit: usize) -> Result<Vec<ReferenceRecord>>;
}

pub struct ReferenceDb {
    conn: Mutex<Connection>,
    shortcuts: ShortcutTable,
}

impl ReferenceDb {
    /// Open a provisioned dataset read-only.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .with_context(|| format!("Failed to open reference database: {}", path.display()))?;
        Ok(Self {
            conn: Mutex::new(conn),
            shortcuts: ShortcutTable::builtin()?,
        })
    }

    /// Build an in-memory dataset from records. Used by tests and tooling.
    pub fn from_records(records: &[ReferenceRecord]) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::create_schema(&conn)?;
        Self::insert_records(&conn, records)?;
        Ok(Self {
            conn: Mutex::new(conn),
            shortcuts: ShortcutTable::builtin()?,
        })
    }

    /// Write a dataset file from records (provisioning).
    pub fn provision(path: &Path, records: &[ReferenceRecord]) -> Result<()> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to create reference database: {}", path.display()))?;
        Self::create_schema(&conn)?;
        Self::insert_records(&conn, records)?;
        Ok(())
    }

    #[must_use]
    pub fn with_shortcuts(mut self, shortcuts: ShortcutTable) -> Self {
        self.shortcuts = shortcuts;
        self
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn create_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS reference_foods (
                id INTEGER PRIMARY KEY,
                description TEXT NOT NULL,
                common_name TEXT,
                category TEXT
            );

            CREATE TABLE IF NOT EXISTS nutrients (
                nutrient_id INTEGER PRIMARY KEY,
                name TEXT NOT NULL,
                unit TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS food_nutrients (
                food_id INTEGER NOT NULL REFERENCES reference_foods(id),
                nutrient_id INTEGER NOT NULL REFERENCES nutrients(nutrient_id),
                amount REAL NOT NULL,
                PRIMARY KEY (food_id, nutrient_id)
            );

            CREATE INDEX IF NOT EXISTS idx_reference_foods_category ON reference_foods(category);
            CREATE INDEX IF NOT EXISTS idx_food_nutrients_food ON food_nutrients(food_id);

            INSERT OR IGNORE INTO nutrients (nutrient_id, name, unit) VALUES
                (1008, 'Energy', 'kcal'),
                (1003, 'Protein', 'g'),
                (1004, 'Total Fat', 'g'),
                (1005, 'Carbohydrate', 'g');",
        )?;
        Ok(())
    }

    fn insert_records(conn: &Connection, records: &[ReferenceRecord]) -> Result<()> {
        let tx = conn.unchecked_transaction()?;
        let mut micro_ids: HashMap<(String, String), i64> = HashMap::new();
        let mut next_micro_id: i64 = 2000;
        for r in records {
            tx.execute(
                "INSERT OR REPLACE INTO reference_foods (id, description, common_name, category)
                 VALUES (?1, ?2, ?3, ?4)",
                params![r.id, r.canonical_name, r.common_name, r.category],
            )?;
            let macros = [
                (NUTRIENT_ENERGY, Some(r.calories_per_100g)),
                (NUTRIENT_PROTEIN, r.protein_per_100g),
                (NUTRIENT_FAT, r.fat_per_100g),
                (NUTRIENT_CARBS, r.carbs_per_100g),
            ];
            for (nutrient_id, amount) in macros {
                if let Some(amount) = amount {
                    tx.execute(
                        "INSERT OR REPLACE INTO food_nutrients (food_id, nutrient_id, amount) VALUES (?1, ?2, ?3)",
                        params![r.id, nutrient_id, amount],
                    )?;
                }
            }
            for m in &r.micronutrients {
                let key = (m.name.clone(), m.unit.clone());
                let nutrient_id = if let Some(id) = micro_ids.get(&key) {
                    *id
                } else {
                    let existing: Option<i64> = tx
                        .query_row(
                            "SELECT nutrient_id FROM nutrients WHERE name = ?1 AND unit = ?2",
                            params![m.name, m.unit],
                            |row| row.get(0),
                        )
                        .optional()?;
                    let id = if let Some(id) = existing {
                        id
                    } else {
                        next_micro_id += 1;
                        tx.execute(
                            "INSERT INTO nutrients (nutrient_id, name, unit) VALUES (?1, ?2, ?3)",
                            params![next_micro_id, m.name, m.unit],
                        )?;
                        next_micro_id
                    };
                    micro_ids.insert(key, id);
                    id
                };
                tx.execute(
                    "INSERT OR REPLACE INTO food_nutrients (food_id, nutrient_id, amount) VALUES (?1, ?2, ?3)",
                    params![r.id, nutrient_id, m.amount_per_100g],
                )?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn load_record(conn: &Connection, id: i64) -> Result<Option<ReferenceRecord>> {
        let mut stmt = conn.prepare(
            "SELECT id, description, common_name, category FROM reference_foods WHERE id = ?1",
        )?;
        let mut rows = stmt.query(params![id])?;
        let Some(row) = rows.next()? else {
            return Ok(None);
        };
        let mut record = ReferenceRecord {
            id: row.get(0)?,
            canonical_name: row.get(1)?,
            common_name: row.get(2)?,
            category: row.get(3)?,
            calories_per_100g: 0.0,
            protein_per_100g: None,
            carbs_per_100g: None,
            fat_per_100g: None,
            micronutrients: Vec::new(),
        };
        drop(rows);

        let mut stmt = conn.prepare(
            "SELECT n.nutrient_id, n.name, n.unit, fnu.amount
             FROM food_nutrients fnu JOIN nutrients n ON fnu.nutrient_id = n.nutrient_id
             WHERE fnu.food_id = ?1
             ORDER BY n.nutrient_id",
        )?;
        let nutrients = stmt
            .query_map(params![id], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, f64>(3)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        for (nutrient_id, name, unit, amount) in nutrients {
            match nutrient_id {
                NUTRIENT_ENERGY => record.calories_per_100g = amount,
                NUTRIENT_PROTEIN => record.protein_per_100g = Some(amount),
                NUTRIENT_FAT => record.fat_per_100g = Some(amount),
                NUTRIENT_CARBS => record.carbs_per_100g = Some(amount),
                _ => record.micronutrients.push(Micronutrient {
                    name,
                    unit,
                    amount_per_100g: amount,
                }),
            }
        }
        Ok(Some(record))
    }

    /// Rows never offered as a match for an adult's meal log.
    fn eligible_clause() -> String {
        let excluded = EXCLUDED_CATEGORIES
            .iter()
            .map(|c| format!("'{c}'"))
            .collect::<Vec<_>>()
            .join(", ");
        format!(
            "COALESCE(f.category, '') NOT IN ({excluded})
               AND LOWER(f.description) NOT LIKE '%infant formula%'"
        )
    }

    fn search_ids(conn: &Connection, tokens: &[String], joiner: &str, limit: usize) -> Result<Vec<i64>> {
        let patterns: Vec<String> = tokens
            .iter()
            .map(|t| {
                let escaped = stem(t)
                    .replace('\\', "\\\\")
                    .replace('%', "\\%")
                    .replace('_', "\\_");
                format!("%{escaped}%")
            })
            .collect();
        let clause = (1..=patterns.len())
            .map(|n| {
                format!(
                    "(LOWER(f.description) LIKE ?{n} ESCAPE '\\' OR LOWER(COALESCE(f.common_name, '')) LIKE ?{n} ESCAPE '\\')"
                )
            })
            .collect::<Vec<_>>()
            .join(joiner);
        let sql = format!(
            "SELECT f.id FROM reference_foods f
             WHERE ({clause}) AND {}
             ORDER BY length(f.description), f.id
             LIMIT {limit}",
            Self::eligible_clause()
        );
        let mut stmt = conn.prepare(&sql)?;
        let ids = stmt
            .query_map(params_from_iter(patterns.iter()), |row| row.get(0))?
            .collect::<Result<Vec<i64>, _>>()?;
        Ok(ids)
    }
}

impl ReferenceStore for ReferenceDb {
    fn lookup_by_shortcut(&self, key: &str) -> Result<Option<ReferenceRecord>> {
        let Some(id) = self.shortcuts.get(key) else {
            return Ok(None);
        };
        let record = self.lookup_by_id(id)?;
        if record.is_none() {
            tracing::warn!(shortcut = key, reference_id = id, "Shortcut points at a missing reference row");
        }
        Ok(record)
    }

    fn lookup_by_id(&self, id: i64) -> Result<Option<ReferenceRecord>> {
        let conn = self.conn();
        Self::load_record(&conn, id)
    }

    fn find_exact(&self, cleaned: &str) -> Result<Option<ReferenceRecord>> {
        let needle = cleaned.trim().to_lowercase();
        if needle.is_empty() {
            return Ok(None);
        }
        let conn = self.conn();
        let id: Option<i64> = {
            let mut stmt = conn.prepare(&format!(
                "SELECT f.id FROM reference_foods f
                 WHERE (LOWER(f.description) = ?1 OR LOWER(COALESCE(f.common_name, '')) = ?1)
                   AND {}
                 ORDER BY f.id LIMIT 1",
                Self::eligible_clause()
            ))?;
            let mut rows = stmt.query(params![needle])?;
            match rows.next()? {
                Some(row) => Some(row.get(0)?),
                None => None,
            }
        };
        match id {
            Some(id) => Self::load_record(&conn, id),
            None => Ok(None),
        }
    }

    fn search_candidates(&self, cleaned: &str, limit: usize) -> Result<Vec<ReferenceRecord>> {
        let tokens = significant_tokens(cleaned);
        if tokens.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }
        let conn = self.conn();
        let mut ids = Self::search_ids(&conn, &tokens, " AND ", limit)?;
        if ids.is_empty() && tokens.len() > 1 {
            tracing::debug!(cleaned, "AND search empty, relaxing to OR");
            ids = Self::search_ids(&conn, &tokens, " OR ", limit)?;
        }
        let mut records = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(record) = Self::load_record(&conn, id)? {
                records.push(record);
            }
        }
        Ok(records)
    }
}

/// Parse a provisioning CSV into records.
///
/// Required header: `id,description,calories`. Optional: `common_name`,
/// `category`, `protein`, `carbs`, `fat`. Any other column named
/// `Name (unit)` is read as a micronutrient per 100 g.
pub fn parse_reference_csv<R: Read>(reader: R) -> Result<Vec<ReferenceRecord>> {
    let mut rdr = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(reader);

    let headers = rdr.headers().context("Failed to read CSV headers")?.clone();
    let col =
        |name: &str| -> Option<usize> { headers.iter().position(|h| h.eq_ignore_ascii_case(name)) };

    let idx_id = col("id").context("Missing 'id' column")?;
    let idx_desc = col("description").context("Missing 'description' column")?;
    let idx_cal = col("calories").context("Missing 'calories' column")?;
    let idx_common = col("common_name");
    let idx_category = col("category");
    let idx_protein = col("protein");
    let idx_carbs = col("carbs");
    let idx_fat = col("fat");

    let known = [
        Some(idx_id),
        Some(idx_desc),
        Some(idx_cal),
        idx_common,
        idx_category,
        idx_protein,
        idx_carbs,
        idx_fat,
    ];
    let micro_cols: Vec<(usize, String, String)> = headers
        .iter()
        .enumerate()
        .filter(|(i, _)| !known.contains(&Some(*i)))
        .filter_map(|(i, h)| {
            let (name, rest) = h.split_once('(')?;
            let unit = rest.strip_suffix(')')?;
            Some((i, name.trim().to_string(), unit.trim().to_string()))
        })
        .collect();

    let mut records = Vec::new();
    for (line_num, result) in rdr.records().enumerate() {
        let record = result.with_context(|| format!("Failed to parse CSV row {}", line_num + 2))?;

        let text = |idx: Option<usize>| -> Option<String> {
            idx.and_then(|i| record.get(i))
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        };
        let number = |idx: Option<usize>| -> Option<f64> {
            idx.and_then(|i| record.get(i))
                .and_then(|v| v.trim().parse::<f64>().ok())
        };

        let Some(description) = text(Some(idx_desc)) else {
            continue;
        };
        let id: i64 = record
            .get(idx_id)
            .unwrap_or("")
            .trim()
            .parse()
            .with_context(|| format!("Invalid id on row {}", line_num + 2))?;
        let Some(calories) = number(Some(idx_cal)) else {
            bail!("Missing calories for '{description}' on row {}", line_num + 2);
        };

        records.push(ReferenceRecord {
            id,
            canonical_name: description,
            common_name: text(idx_common),
            category: text(idx_category),
            calories_per_100g: calories,
            protein_per_100g: number(idx_protein),
            carbs_per_100g: number(idx_carbs),
            fat_per_100g: number(idx_fat),
            micronutrients: micro_cols
                .iter()
                .filter_map(|(i, name, unit)| {
                    number(Some(*i)).map(|amount| Micronutrient {
                        name: name.clone(),
                        unit: unit.clone(),
                        amount_per_100g: amount,
                    })
                })
                .collect(),
        });
    }
    Ok(records)
}
