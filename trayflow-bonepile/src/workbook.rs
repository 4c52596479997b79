//! In-memory workbook model.
//!
//! A workbook is an ordered list of named sheets of string cells. Parsing
//! works on this model only, so tests can build workbooks without xlsx bytes.

use calamine::{open_workbook_from_rs, Data, Reader, Xlsx};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io::Cursor;
use trayflow_core::{ContentHash, ParseFailure};

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Sheet {
    pub name: String,
    pub rows: Vec<Vec<String>>,
}

impl Sheet {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            rows: Vec::new(),
        }
    }

    pub fn with_row<I, S>(mut self, cells: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.rows.push(cells.into_iter().map(Into::into).collect());
        self
    }

    /// Fingerprint of the sheet's cells.
    ///
    /// Rows are joined with `|`, terminated by a newline, and followed by the
    /// row count.
    pub fn content_hash(&self) -> ContentHash {
        let mut hasher = Sha256::new();
        for row in &self.rows {
            hasher.update(row.join("|").as_bytes());
            hasher.update(b"\n");
        }
        hasher.update(self.rows.len().to_string().as_bytes());
        let mut hash = [0u8; 32];
        hash.copy_from_slice(&hasher.finalize());
        hash
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Workbook {
    pub sheets: Vec<Sheet>,
}

impl Workbook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sheet(mut self, sheet: Sheet) -> Self {
        self.sheets.push(sheet);
        self
    }

    pub fn sheet(&self, name: &str) -> Option<&Sheet> {
        self.sheets.iter().find(|s| s.name == name)
    }

    pub fn sheet_names(&self) -> Vec<&str> {
        self.sheets.iter().map(|s| s.name.as_str()).collect()
    }

    /// Read an xlsx byte stream.
    pub fn from_xlsx_bytes(bytes: &[u8]) -> Result<Self, ParseFailure> {
        let mut xlsx: Xlsx<_> =
            open_workbook_from_rs(Cursor::new(bytes.to_vec())).map_err(|e: calamine::XlsxError| {
                ParseFailure::Unreadable {
                    reason: e.to_string(),
                }
            })?;

        let mut sheets = Vec::new();
        for name in xlsx.sheet_names() {
            let range = xlsx
                .worksheet_range(&name)
                .map_err(|e| ParseFailure::Unreadable {
                    reason: format!("sheet {name}: {e}"),
                })?;
            let rows = range
                .rows()
                .map(|row| row.iter().map(cell_text).collect())
                .collect();
            sheets.push(Sheet { name, rows });
        }
        Ok(Self { sheets })
    }
}

fn cell_text(cell: &Data) -> String {
    match cell {
        Data::Empty => String::new(),
        Data::String(s) => s.trim().to_string(),
        Data::Float(f) => f.to_string(),
        Data::Int(i) => i.to_string(),
        other => other.to_string(),
    }
}
