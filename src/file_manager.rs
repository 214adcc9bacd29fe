// src/file_manager.rs - G-code file registry
use crate::store::{JobStore, StoreError};
use croma_shared::print_job::FileRecord;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncBufReadExt, BufReader};

const GCODE_EXTENSIONS: [&str; 3] = ["gcode", "gco", "g"];
/// Slicers put their time estimate in the header.
const HEADER_SCAN_LINES: usize = 200;

#[derive(Debug, Clone)]
pub struct FileManager {
    directory: PathBuf,
}

impl FileManager {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }

    pub fn is_gcode(path: &Path) -> bool {
        path.extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| GCODE_EXTENSIONS.iter().any(|known| ext.eq_ignore_ascii_case(known)))
    }

    /// Registers every G-code file in the directory (creating it if needed) and returns
    /// the records sorted by name. Files already known by path keep their record.
    pub async fn scan(&self, store: &dyn JobStore) -> Result<Vec<FileRecord>, StoreError> {
        fs::create_dir_all(&self.directory).await?;
        let mut entries = fs::read_dir(&self.directory).await?;
        let mut records = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if !entry.file_type().await?.is_file() || !Self::is_gcode(&path) {
                continue;
            }
            let Some(name) = path.file_name().and_then(|n| n.to_str()).map(str::to_string) else {
                continue;
            };
            let estimate = match declared_duration(&path).await {
                Ok(estimate) => estimate,
                Err(e) => {
                    tracing::warn!(file = %path.display(), error = %e, "Could not read G-code header");
                    None
                }
            };
            records.push(store.register_file(&name, &path, estimate)?);
        }
        records.sort_by(|a, b| a.name.cmp(&b.name));
        tracing::info!(directory = %self.directory.display(), files = records.len(), "Scanned G-code directory");
        Ok(records)
    }
}

/// Print time declared by the slicer as a `;TIME:<seconds>` header comment.
pub async fn declared_duration(path: &Path) -> std::io::Result<Option<u64>> {
    let file = fs::File::open(path).await?;
    let mut lines = BufReader::new(file).lines();
    let mut scanned = 0;
    while let Some(line) = lines.next_line().await? {
        if let Some(value) = line.trim().strip_prefix(";TIME:") {
            return Ok(value.trim().parse::<f64>().ok().map(|secs| secs.max(0.0).round() as u64));
        }
        scanned += 1;
        if scanned >= HEADER_SCAN_LINES {
            break;
        }
    }
    Ok(None)
}
