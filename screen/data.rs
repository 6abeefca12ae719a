//! # Data Loading and Output
//!
//! Reads the tab-separated wide response matrix and the optional item declaration file,
//! and writes the per-person screening table.
//!
//! - Strict schema: the matrix starts with `person_id`, `age` and `reference`, optionally
//!   followed by `eligible`; every remaining column is an item. The declaration file has
//!   `item_id`, `type` and optionally `categories`.
//! - Failures are assumed to be user-input errors and name the offending row and column.
//! - Cells are parsed as numbers only; whether a number is a valid category is decided
//!   by the vectorizer, never here.

use crate::classify::PersonOutcome;
use crate::vectorize::{ItemDeclaration, ItemKind, WideMatrix, WideRow};
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use thiserror::Error;

const MISSING_TOKENS: [&str; 4] = ["", "NA", ".", "NaN"];
const NOT_AVAILABLE: &str = "NA";

#[derive(Error, Debug)]
pub enum DataError {
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),
    #[error("Malformed tab-separated input: {0}")]
    CsvError(#[from] csv::Error),
    #[error(
        "The required column '{0}' was not found in the input file. Please check spelling and case."
    )]
    ColumnNotFound(&'static str),
    #[error("Expected column '{expected}' at position {position}, found '{found}'.")]
    UnexpectedColumn {
        position: usize,
        expected: &'static str,
        found: String,
    },
    #[error("Row {row}, column '{column}': could not parse '{value}' as {expected}.")]
    InvalidValue {
        row: usize,
        column: String,
        value: String,
        expected: &'static str,
    },
    #[error("Row {row}: missing value in required column '{column}'.")]
    MissingValue { row: usize, column: &'static str },
}

fn is_missing(cell: &str) -> bool {
    MISSING_TOKENS.contains(&cell.trim())
}

fn parse_flag(cell: &str, row: usize, column: &str) -> Result<bool, DataError> {
    match cell.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" => Ok(true),
        "0" | "false" | "no" => Ok(false),
        _ => Err(DataError::InvalidValue {
            row,
            column: column.to_string(),
            value: cell.to_string(),
            expected: "a flag (1/0/true/false/yes/no)",
        }),
    }
}

fn parse_number(cell: &str, row: usize, column: &str) -> Result<Option<f64>, DataError> {
    if is_missing(cell) {
        return Ok(None);
    }
    cell.trim()
        .parse::<f64>()
        .map(Some)
        .map_err(|_| DataError::InvalidValue {
            row,
            column: column.to_string(),
            value: cell.to_string(),
            expected: "a number",
        })
}

fn tsv_reader(path: &Path) -> Result<csv::Reader<File>, DataError> {
    Ok(csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .has_headers(true)
        .flexible(false)
        .from_reader(File::open(path)?))
}

/// Loads the wide person-by-item matrix.
pub fn load_wide_matrix(path: &Path) -> Result<WideMatrix, DataError> {
    let mut reader = tsv_reader(path)?;
    let headers: Vec<String> = reader.headers()?.iter().map(|h| h.trim().to_string()).collect();

    for (position, expected) in ["person_id", "age", "reference"].into_iter().enumerate() {
        match headers.get(position) {
            None => return Err(DataError::ColumnNotFound(expected)),
            Some(found) if found != expected => {
                return Err(DataError::UnexpectedColumn {
                    position: position + 1,
                    expected,
                    found: found.clone(),
                });
            }
            Some(_) => {}
        }
    }
    let has_eligible = headers.get(3).is_some_and(|h| h == "eligible");
    let first_item = if has_eligible { 4 } else { 3 };
    let item_ids = headers[first_item..].to_vec();

    let mut rows = Vec::new();
    for (i, record) in reader.records().enumerate() {
        let record = record?;
        // Header is line 1.
        let row = i + 2;
        let person_id = record[0].trim().to_string();
        if is_missing(&person_id) {
            return Err(DataError::MissingValue {
                row,
                column: "person_id",
            });
        }
        let age = parse_number(&record[1], row, "age")?.unwrap_or(f64::NAN);
        let reference = parse_flag(&record[2], row, "reference")?;
        let eligible = if has_eligible {
            parse_flag(&record[3], row, "eligible")?
        } else {
            true
        };
        let values = item_ids
            .iter()
            .enumerate()
            .map(|(j, item)| parse_number(&record[first_item + j], row, item))
            .collect::<Result<Vec<_>, _>>()?;
        rows.push(WideRow {
            person_id,
            age,
            reference,
            eligible,
            values,
        });
    }
    log::info!(
        "Loaded {} persons and {} items from '{}'.",
        rows.len(),
        item_ids.len(),
        path.display()
    );
    Ok(WideMatrix { item_ids, rows })
}

/// Loads item declarations: `item_id`, `type` (`binary` or `polytomous`) and an optional
/// `categories` count.
pub fn load_item_declarations(path: &Path) -> Result<Vec<ItemDeclaration>, DataError> {
    let mut reader = tsv_reader(path)?;
    let headers: Vec<String> = reader.headers()?.iter().map(|h| h.trim().to_string()).collect();
    let column = |name: &'static str| headers.iter().position(|h| h == name);
    let id_col = column("item_id").ok_or(DataError::ColumnNotFound("item_id"))?;
    let type_col = column("type").ok_or(DataError::ColumnNotFound("type"))?;
    let categories_col = column("categories");

    let mut declarations = Vec::new();
    for (i, record) in reader.records().enumerate() {
        let record = record?;
        let row = i + 2;
        let kind = match record[type_col].trim().to_ascii_lowercase().as_str() {
            "binary" => ItemKind::Binary,
            "polytomous" | "ordinal" => ItemKind::Polytomous,
            other => {
                return Err(DataError::InvalidValue {
                    row,
                    column: "type".to_string(),
                    value: other.to_string(),
                    expected: "'binary' or 'polytomous'",
                });
            }
        };
        let categories = match categories_col.map(|c| &record[c]) {
            Some(cell) if !is_missing(cell) => {
                Some(cell.trim().parse::<u8>().map_err(|_| DataError::InvalidValue {
                    row,
                    column: "categories".to_string(),
                    value: cell.to_string(),
                    expected: "a category count between 2 and 255",
                })?)
            }
            _ => None,
        };
        declarations.push(ItemDeclaration {
            id: record[id_col].trim().to_string(),
            kind,
            categories,
        });
    }
    Ok(declarations)
}

fn opt_float(value: Option<f64>) -> String {
    match value {
        Some(v) if v.is_finite() => format!("{v:.6}"),
        _ => NOT_AVAILABLE.to_string(),
    }
}

fn opt_display<T: ToString>(value: Option<T>) -> String {
    value.map_or_else(|| NOT_AVAILABLE.to_string(), |v| v.to_string())
}

/// Writes the per-person screening table. Undefined values are written as `NA`.
pub fn write_person_outcomes<W: Write>(writer: W, outcomes: &[PersonOutcome]) -> Result<(), DataError> {
    let mut out = csv::WriterBuilder::new()
        .delimiter(b'\t')
        .from_writer(writer);
    out.write_record([
        "person_id",
        "population",
        "fold_status",
        "fit_weight",
        "lz",
        "avg_logpost",
        "quintile",
        "flagged",
        "meets_inclusion",
        "exclusion_reason",
    ])?;
    for o in outcomes {
        out.write_record([
            o.person_id.clone(),
            opt_display(o.population),
            o.source.label().to_string(),
            opt_float(o.fit_weight),
            opt_float(o.lz()),
            opt_float(o.avg_logpost()),
            opt_display(o.quintile),
            opt_display(o.flagged),
            o.meets_inclusion().to_string(),
            opt_display(o.exclusion.as_ref()),
        ])?;
    }
    out.flush()?;
    Ok(())
}

pub fn write_person_outcomes_to_path(path: &Path, outcomes: &[PersonOutcome]) -> Result<(), DataError> {
    let file = BufWriter::new(File::create(path)?);
    write_person_outcomes(file, outcomes)?;
    log::info!("Wrote {} person outcomes to '{}'.", outcomes.len(), path.display());
    Ok(())
}
