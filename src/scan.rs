// src/scan.rs

use std::fs;
use std::path::Path;
use tracing::{info, warn};

/// One sheet photo picked up from disk, ready to ingest.
#[derive(Debug)]
pub struct SheetFile {
    pub filename: String,
    pub mime: &'static str,
    pub data: Vec<u8>,
}

fn sheet_mime(path: &Path) -> Option<&'static str> {
    match path.extension()?.to_str()?.to_ascii_lowercase().as_str() {
        "jpg" | "jpeg" => Some("image/jpeg"),
        "png" => Some("image/png"),
        _ => None,
    }
}

/// Collect every sheet photo in a directory, in filename order. Unreadable
/// files are logged and skipped; they never abort the scan.
pub fn scan_dir(dir: impl AsRef<Path>) -> Result<Vec<SheetFile>, Box<dyn std::error::Error>> {
    let dir = dir.as_ref();
    let mut paths: Vec<_> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|p| p.is_file())
        .collect();
    paths.sort();

    let mut sheets = Vec::new();
    for path in paths {
        let Some(mime) = sheet_mime(&path) else {
            continue;
        };
        let filename = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_string();

        match fs::read(&path) {
            Ok(data) => {
                info!(filename = %filename, bytes = data.len(), "Found sheet photo");
                sheets.push(SheetFile {
                    filename,
                    mime,
                    data,
                });
            }
            Err(e) => {
                warn!(filename = %filename, error = %e, "Could not read file, skipping");
            }
        }
    }

    info!(count = sheets.len(), dir = %dir.display(), "Scan complete");
    Ok(sheets)
}
