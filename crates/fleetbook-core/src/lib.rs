//! Core record model and duplicate-key identity for fleetbook.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use chrono::{NaiveDate, NaiveDateTime};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "fleetbook-core";

/// Joins document id and description into a [`DuplicateKey`].
pub const KEY_SEPARATOR: &str = "|";

/// First header cell of every tabular target; used to detect initialized sheets.
pub const HEADER_MARKER: &str = "INVOICE";

const DATE_FORMATS: [&str; 5] = ["%Y-%m-%d", "%d/%m/%Y", "%d-%m-%Y", "%d.%m.%Y", "%Y/%m/%d"];
const DATETIME_FORMATS: [&str; 3] = ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S%.f"];

/// The nine canonical columns, in the order every table and sheet uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Column {
    Invoice,
    Date,
    Vehicle,
    Description,
    Quantity,
    UnitCost,
    Total,
    Supplier,
    Owner,
}

impl Column {
    pub const ALL: [Column; 9] = [
        Column::Invoice,
        Column::Date,
        Column::Vehicle,
        Column::Description,
        Column::Quantity,
        Column::UnitCost,
        Column::Total,
        Column::Supplier,
        Column::Owner,
    ];

    pub fn header(self) -> &'static str {
        match self {
            Column::Invoice => "INVOICE",
            Column::Date => "DATE",
            Column::Vehicle => "VEHICLE",
            Column::Description => "DESCRIPTION",
            Column::Quantity => "QUANTITY",
            Column::UnitCost => "UNIT_COST",
            Column::Total => "TOTAL",
            Column::Supplier => "SUPPLIER",
            Column::Owner => "OWNER",
        }
    }

    /// Case-insensitive, whitespace-tolerant header lookup.
    pub fn from_header(header: &str) -> Option<Column> {
        let wanted = header.trim();
        Column::ALL
            .into_iter()
            .find(|c| c.header().eq_ignore_ascii_case(wanted))
    }
}

pub fn header_row() -> Vec<String> {
    Column::ALL.iter().map(|c| c.header().to_string()).collect()
}

/// Identity used to detect re-extractions of the same physical line item.
///
/// Equality is byte-exact: no trimming and no case folding.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DuplicateKey(String);

impl DuplicateKey {
    pub fn from_parts(document_id: &str, description: &str) -> Self {
        let mut key = String::with_capacity(document_id.len() + description.len() + 1);
        key.push_str(document_id);
        key.push_str(KEY_SEPARATOR);
        key.push_str(description);
        Self(key)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DuplicateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Date of a record. Text that is not a recognizable calendar date is kept
/// verbatim so it survives rewrites of the local tables.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "Option<String>", into = "Option<String>")]
pub enum RecordDate {
    Calendar(NaiveDate),
    Unparsed(String),
    #[default]
    Missing,
}

impl RecordDate {
    pub fn parse(text: &str) -> Self {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return RecordDate::Missing;
        }
        for format in DATE_FORMATS {
            if let Ok(date) = NaiveDate::parse_from_str(trimmed, format) {
                return RecordDate::Calendar(date);
            }
        }
        for format in DATETIME_FORMATS {
            if let Ok(ts) = NaiveDateTime::parse_from_str(trimmed, format) {
                return RecordDate::Calendar(ts.date());
            }
        }
        RecordDate::Unparsed(text.to_string())
    }

    pub fn calendar(&self) -> Option<NaiveDate> {
        match self {
            RecordDate::Calendar(date) => Some(*date),
            _ => None,
        }
    }

    pub fn as_cell(&self) -> String {
        match self {
            RecordDate::Calendar(date) => date.format("%Y-%m-%d").to_string(),
            RecordDate::Unparsed(raw) => raw.clone(),
            RecordDate::Missing => String::new(),
        }
    }

    /// Newest calendar date first; anything without a calendar date sorts last.
    pub fn newest_first(a: &RecordDate, b: &RecordDate) -> Ordering {
        match (a.calendar(), b.calendar()) {
            (Some(x), Some(y)) => y.cmp(&x),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        }
    }
}

impl From<Option<String>> for RecordDate {
    fn from(value: Option<String>) -> Self {
        value.map(|v| RecordDate::parse(&v)).unwrap_or_default()
    }
}

impl From<RecordDate> for Option<String> {
    fn from(value: RecordDate) -> Self {
        match value {
            RecordDate::Missing => None,
            other => Some(other.as_cell()),
        }
    }
}

/// One approved line item of a supplier document.
///
/// `total` is authoritative; `quantity * unit_cost` is never re-derived on write.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Record {
    pub document_id: String,
    pub date: RecordDate,
    pub vehicle: String,
    pub description: String,
    pub quantity: Option<f64>,
    pub unit_cost: Option<Decimal>,
    pub total: Option<Decimal>,
    pub supplier: String,
    pub owner: String,
}

impl Record {
    pub fn key(&self) -> DuplicateKey {
        DuplicateKey::from_parts(&self.document_id, &self.description)
    }

    /// Build a record from text cells. Columns the lookup does not know about
    /// become empty values.
    pub fn from_cells<F>(mut lookup: F) -> Self
    where
        F: FnMut(Column) -> Option<String>,
    {
        let mut text = |column: Column| lookup(column).unwrap_or_default();
        Self {
            document_id: text(Column::Invoice),
            date: RecordDate::parse(&text(Column::Date)),
            vehicle: text(Column::Vehicle),
            description: text(Column::Description),
            quantity: parse_quantity(&text(Column::Quantity)),
            unit_cost: parse_money(&text(Column::UnitCost)),
            total: parse_money(&text(Column::Total)),
            supplier: text(Column::Supplier),
            owner: text(Column::Owner),
        }
    }

    pub fn cell(&self, column: Column) -> String {
        match column {
            Column::Invoice => self.document_id.clone(),
            Column::Date => self.date.as_cell(),
            Column::Vehicle => self.vehicle.clone(),
            Column::Description => self.description.clone(),
            Column::Quantity => self.quantity.map(format_quantity).unwrap_or_default(),
            Column::UnitCost => self.unit_cost.map(format_money).unwrap_or_default(),
            Column::Total => self.total.map(format_money).unwrap_or_default(),
            Column::Supplier => self.supplier.clone(),
            Column::Owner => self.owner.clone(),
        }
    }

    /// All nine cells in canonical column order.
    pub fn to_cells(&self) -> Vec<String> {
        Column::ALL.iter().map(|c| self.cell(*c)).collect()
    }

    /// Edit-time helper: derive a missing unit cost from total / quantity.
    pub fn fill_unit_cost(&mut self) {
        if self.unit_cost.is_some() {
            return;
        }
        let (Some(quantity), Some(total)) = (self.quantity, self.total) else {
            return;
        };
        if quantity <= 0.0 {
            return;
        }
        if let Some(quantity) = Decimal::from_f64_retain(quantity) {
            if let Some(unit) = total.checked_div(quantity) {
                self.unit_cost = Some(unit.round_dp(2));
            }
        }
    }
}

pub fn parse_quantity(text: &str) -> Option<f64> {
    let cleaned = text.trim().replace(',', "");
    if cleaned.is_empty() {
        return None;
    }
    cleaned.parse::<f64>().ok().filter(|q| q.is_finite())
}

/// Parses a money cell to two fractional digits. Thousands separators are ignored.
pub fn parse_money(text: &str) -> Option<Decimal> {
    let cleaned = text.trim().replace([',', ' '], "");
    if cleaned.is_empty() {
        return None;
    }
    Decimal::from_str(&cleaned)
        .or_else(|_| Decimal::from_scientific(&cleaned))
        .ok()
        .map(|d| d.round_dp(2))
}

pub fn format_money(value: Decimal) -> String {
    format!("{:.2}", value.round_dp(2))
}

pub fn format_quantity(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        value.to_string()
    }
}
