//! Cumulative CSV report, append-only.

use crate::metrics::table::escape_field;
use crate::model::ReportRow;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

pub const REPORT_HEADER: &str = "File,Count,Avg_Sqrt_Area";

#[derive(Debug, Clone)]
pub struct ReportWriter {
    path: PathBuf,
}

impl ReportWriter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one row, writing the header first only if this call created the file.
    pub fn append(&self, row: &ReportRow) -> io::Result<()> {
        let (mut file, created) = self.open()?;
        let mut buf = String::new();
        if created {
            buf.push_str(REPORT_HEADER);
            buf.push('\n');
        }
        buf.push_str(&format!(
            "{},{},{}\n",
            escape_field(&row.file),
            row.count,
            row.avg_sqrt_area
        ));
        file.write_all(buf.as_bytes())?;
        file.flush()
    }

    fn open(&self) -> io::Result<(File, bool)> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        match OpenOptions::new()
            .append(true)
            .create_new(true)
            .open(&self.path)
        {
            Ok(f) => Ok((f, true)),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                Ok((OpenOptions::new().append(true).open(&self.path)?, false))
            }
            Err(e) => Err(e),
        }
    }
}
