// src/export.rs

use crate::reconcile::DiagnosedLineItem;
use serde::Deserialize;
use std::io::Write;
use std::path::{Path, PathBuf};
use time::macros::format_description;
use tracing::info;

/// Where the status column sits: first for review layouts, last for clean
/// archive exports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusColumn {
    #[default]
    First,
    Last,
}

/// One export column. `editable` marks the raw fields a reviewer may
/// overwrite; derived and status columns are read-only and recomputed from
/// the raws on every pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Column {
    pub header: &'static str,
    pub editable: bool,
}

const STATUS: Column = Column {
    header: "status",
    editable: false,
};

const BODY: [Column; 9] = [
    Column { header: "name", editable: true },
    Column { header: "category", editable: true },
    Column { header: "quantity", editable: true },
    Column { header: "unit_price", editable: true },
    Column { header: "line_total", editable: true },
    Column { header: "computed_total", editable: false },
    Column { header: "implied_quantity", editable: false },
    Column { header: "implied_unit_price", editable: false },
    Column { header: "note", editable: false },
];

/// Column schema in presentation order for the given layout.
pub fn column_layout(placement: StatusColumn) -> Vec<Column> {
    let mut columns = Vec::with_capacity(BODY.len() + 1);
    if placement == StatusColumn::First {
        columns.push(STATUS);
    }
    columns.extend_from_slice(&BODY);
    if placement == StatusColumn::Last {
        columns.push(STATUS);
    }
    columns
}

fn fmt_num(value: Option<f64>) -> String {
    value.map(|v| format!("{v:.2}")).unwrap_or_default()
}

fn row_values(item: &DiagnosedLineItem, placement: StatusColumn) -> Vec<String> {
    let body = [
        item.raw.name.clone(),
        item.raw.category.clone().unwrap_or_default(),
        item.raw.quantity_raw.clone().unwrap_or_default(),
        item.raw.unit_price_raw.clone().unwrap_or_default(),
        item.raw.line_total_raw.clone().unwrap_or_default(),
        fmt_num(item.computed_total),
        fmt_num(item.implied_quantity),
        fmt_num(item.implied_unit_price),
        item.note.clone().unwrap_or_default(),
    ];

    let mut values = Vec::with_capacity(body.len() + 1);
    if placement == StatusColumn::First {
        values.push(item.status.as_str().to_string());
    }
    values.extend(body);
    if placement == StatusColumn::Last {
        values.push(item.status.as_str().to_string());
    }
    values
}

/// Write the diagnosed table as CSV to any writer.
pub fn write_csv<W: Write>(
    out: W,
    items: &[DiagnosedLineItem],
    placement: StatusColumn,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut wtr = csv::Writer::from_writer(out);

    wtr.write_record(column_layout(placement).iter().map(|c| c.header))?;
    for item in items {
        wtr.write_record(row_values(item, placement))?;
    }
    wtr.flush()?;
    Ok(())
}

/// Export to `<out_dir>/order_audit_YYYYMMDD_HHMMSS.csv` and return the path.
pub fn export_csv(
    items: &[DiagnosedLineItem],
    out_dir: impl AsRef<Path>,
    placement: StatusColumn,
) -> Result<PathBuf, Box<dyn std::error::Error>> {
    let out_dir = out_dir.as_ref();
    std::fs::create_dir_all(out_dir)?;

    let stamp = time::OffsetDateTime::now_utc()
        .format(format_description!("[year][month][day]_[hour][minute][second]"))?;
    let path = out_dir.join(format!("order_audit_{stamp}.csv"));

    let file = std::fs::File::create(&path)?;
    write_csv(file, items, placement)?;

    info!(path = %path.display(), rows = items.len(), "CSV exported");
    Ok(path)
}
