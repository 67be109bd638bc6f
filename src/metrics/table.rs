//! Minimal rectangular table used for result artifacts.
//!
//! The engine writes one `.xlsx` workbook per image; CSV exports are accepted
//! too. Artifacts are small, so the whole sheet is held in memory as strings
//! and numeric columns are parsed on demand.

use super::MetricsError;
use calamine::{open_workbook, Data, Reader, Xlsx};
use rust_xlsxwriter::Workbook;
use std::borrow::Cow;
use std::io;
use std::path::Path;

/// On-disk layout of an artifact, chosen by file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactFormat {
    Xlsx,
    Csv,
}

impl ArtifactFormat {
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("xlsx") => ArtifactFormat::Xlsx,
            _ => ArtifactFormat::Csv,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Table {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl Table {
    pub fn read(path: &Path) -> Result<Self, MetricsError> {
        match ArtifactFormat::from_path(path) {
            ArtifactFormat::Xlsx => Self::read_xlsx(path),
            ArtifactFormat::Csv => {
                let text =
                    std::fs::read_to_string(path).map_err(|source| MetricsError::Io {
                        path: path.to_path_buf(),
                        source,
                    })?;
                Self::parse(&text)
            }
        }
    }

    /// First worksheet; the first non-blank row is the header.
    fn read_xlsx(path: &Path) -> Result<Self, MetricsError> {
        let spreadsheet = |e: calamine::XlsxError| MetricsError::Spreadsheet {
            path: path.to_path_buf(),
            message: e.to_string(),
        };
        let mut workbook: Xlsx<_> = open_workbook(path).map_err(spreadsheet)?;
        let range = match workbook.worksheet_range_at(0) {
            Some(range) => range.map_err(spreadsheet)?,
            None => return Err(MetricsError::Empty),
        };

        let mut rows = range
            .rows()
            .map(|cells| cells.iter().map(cell_text).collect::<Vec<_>>())
            .filter(|cells| cells.iter().any(|c| !c.trim().is_empty()));
        let headers = match rows.next() {
            Some(header) => header.into_iter().map(|h| h.trim().to_string()).collect(),
            None => return Err(MetricsError::Empty),
        };
        Ok(Self {
            headers,
            rows: rows.collect(),
        })
    }

    /// Parse CSV text. Quoted fields may span lines.
    pub fn parse(text: &str) -> Result<Self, MetricsError> {
        let text = text.strip_prefix('\u{feff}').unwrap_or(text);
        let mut records = split_records(text)?.into_iter();

        let headers: Vec<String> = match records.next() {
            Some((_, header)) => header.into_iter().map(|h| h.trim().to_string()).collect(),
            None => return Err(MetricsError::Empty),
        };

        let mut rows = Vec::new();
        for (line, fields) in records {
            // A short row usually means the engine is still flushing the file.
            if fields.len() != headers.len() {
                return Err(MetricsError::Ragged {
                    line,
                    expected: headers.len(),
                    found: fields.len(),
                });
            }
            rows.push(fields);
        }
        Ok(Self { headers, rows })
    }

    /// Parse every cell of a column as `f64`.
    pub fn numeric_column(&self, index: usize) -> Result<Vec<f64>, MetricsError> {
        self.rows
            .iter()
            .enumerate()
            .map(|(row_idx, row)| {
                let raw = row.get(index).map(|c| c.trim()).unwrap_or_default();
                raw.parse::<f64>()
                    .ok()
                    .filter(|v| !v.is_nan())
                    .ok_or_else(|| MetricsError::NotNumeric {
                        column: self.headers[index].clone(),
                        // +2: 1-based, plus the header line
                        row: row_idx + 2,
                        value: raw.to_string(),
                    })
            })
            .collect()
    }

    /// Replace the named column (case-insensitive) or append it as a new one.
    pub fn set_column(&mut self, name: &str, values: &[f64]) {
        debug_assert_eq!(values.len(), self.rows.len());
        let existing = self
            .headers
            .iter()
            .position(|h| h.eq_ignore_ascii_case(name));
        let idx = match existing {
            Some(idx) => idx,
            None => {
                self.headers.push(name.to_string());
                self.headers.len() - 1
            }
        };
        for (row, v) in self.rows.iter_mut().zip(values) {
            if row.len() <= idx {
                row.resize(idx + 1, String::new());
            }
            row[idx] = v.to_string();
        }
    }

    pub fn to_csv(&self) -> String {
        let mut out = String::new();
        push_record(&mut out, self.headers.iter().map(String::as_str));
        for row in &self.rows {
            push_record(&mut out, row.iter().map(String::as_str));
        }
        out
    }

    /// Write the table back in the format implied by `path`.
    pub fn write(&self, path: &Path) -> io::Result<()> {
        match ArtifactFormat::from_path(path) {
            ArtifactFormat::Xlsx => self.write_xlsx(path).map_err(io::Error::other),
            ArtifactFormat::Csv => std::fs::write(path, self.to_csv()),
        }
    }

    fn write_xlsx(&self, path: &Path) -> Result<(), rust_xlsxwriter::XlsxError> {
        let mut workbook = Workbook::new();
        let sheet = workbook.add_worksheet();
        for (col, header) in self.headers.iter().enumerate() {
            sheet.write_string(0, col as u16, header.as_str())?;
        }
        for (r, row) in self.rows.iter().enumerate() {
            let r = (r + 1) as u32;
            for (c, cell) in row.iter().enumerate() {
                let c = c as u16;
                match cell.trim().parse::<f64>() {
                    Ok(v) if v.is_finite() => {
                        sheet.write_number(r, c, v)?;
                    }
                    _ if cell.is_empty() => {}
                    _ => {
                        sheet.write_string(r, c, cell.as_str())?;
                    }
                }
            }
        }
        workbook.save(path)
    }
}

fn cell_text(cell: &Data) -> String {
    match cell {
        Data::Empty => String::new(),
        Data::String(s) => s.clone(),
        Data::Float(f) => f.to_string(),
        Data::Int(i) => i.to_string(),
        Data::Bool(b) => b.to_string(),
        other => other.to_string(),
    }
}

fn push_record<'a>(out: &mut String, fields: impl Iterator<Item = &'a str>) {
    for (i, field) in fields.enumerate() {
        if i > 0 {
            out.push(',');
        }
        out.push_str(&escape_field(field));
    }
    out.push('\n');
}

/// Quote a field if it contains a delimiter, quote or line break.
pub fn escape_field(field: &str) -> Cow<'_, str> {
    if field.contains([',', '"', '\n', '\r']) {
        Cow::Owned(format!("\"{}\"", field.replace('"', "\"\"")))
    } else {
        Cow::Borrowed(field)
    }
}

/// Split CSV text into records, each tagged with the line it starts on.
///
/// Commas and line breaks inside quotes belong to the field, `""` is an
/// escaped quote. Blank lines are skipped. An unterminated quote is reported
/// as [`MetricsError::UnterminatedQuote`].
pub fn split_records(text: &str) -> Result<Vec<(usize, Vec<String>)>, MetricsError> {
    struct Pending {
        fields: Vec<String>,
        current: String,
        quoted: bool,
    }

    impl Pending {
        fn finish(&mut self, start: usize, out: &mut Vec<(usize, Vec<String>)>) {
            self.fields.push(std::mem::take(&mut self.current));
            let blank = !self.quoted && self.fields.len() == 1 && self.fields[0].trim().is_empty();
            if blank {
                self.fields.clear();
            } else {
                out.push((start, std::mem::take(&mut self.fields)));
            }
            self.quoted = false;
        }
    }

    let mut out = Vec::new();
    let mut pending = Pending {
        fields: Vec::new(),
        current: String::new(),
        quoted: false,
    };
    let mut in_quotes = false;
    let mut line = 1;
    let mut start = 1;
    let mut chars = text.chars().peekable();

    while let Some(ch) = chars.next() {
        match ch {
            '"' if in_quotes => {
                if chars.peek() == Some(&'"') {
                    pending.current.push('"');
                    chars.next();
                } else {
                    in_quotes = false;
                }
            }
            '"' => {
                in_quotes = true;
                pending.quoted = true;
            }
            ',' if !in_quotes => pending.fields.push(std::mem::take(&mut pending.current)),
            '\n' => {
                line += 1;
                if in_quotes {
                    pending.current.push('\n');
                } else {
                    pending.finish(start, &mut out);
                    start = line;
                }
            }
            '\r' if !in_quotes => {}
            _ => pending.current.push(ch),
        }
    }

    if in_quotes {
        return Err(MetricsError::UnterminatedQuote { line: start });
    }
    if pending.quoted || !pending.current.is_empty() || !pending.fields.is_empty() {
        pending.finish(start, &mut out);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_handles_quotes_and_escapes() {
        let records = split_records(r#"1,"a, b","say ""hi""",,x"#).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].0, 1);
        assert_eq!(records[0].1, vec!["1", "a, b", r#"say "hi""#, "", "x"]);
    }

    #[test]
    fn quoted_line_break_stays_in_the_field() {
        let t = Table::parse("Label,Area\n\"cell\nA\",4\nB,9\n").unwrap();
        assert_eq!(t.rows, vec![vec!["cell\nA", "4"], vec!["B", "9"]]);
        assert_eq!(t.numeric_column(1).unwrap(), vec![4.0, 9.0]);
    }

    #[test]
    fn records_remember_their_starting_line() {
        let records = split_records("h1,h2\n\"a\nb\",1\n\nc,2\n").unwrap();
        let lines: Vec<usize> = records.iter().map(|(l, _)| *l).collect();
        assert_eq!(lines, vec![1, 2, 5]);
    }

    #[test]
    fn unterminated_quote_is_reported() {
        let err = Table::parse("Label,Area\n\"still writing,4\n").unwrap_err();
        assert!(matches!(err, MetricsError::UnterminatedQuote { line: 2 }));
    }

    #[test]
    fn parse_skips_bom_and_blank_lines() {
        let t = Table::parse("\u{feff}Area, Circularity \r\n4,1\r\n\r\n9,0.5\r\n").unwrap();
        assert_eq!(t.headers, vec!["Area", "Circularity"]);
        assert_eq!(t.rows.len(), 2);
        assert_eq!(t.numeric_column(1).unwrap(), vec![1.0, 0.5]);
    }

    #[test]
    fn truncated_row_is_ragged() {
        let err = Table::parse("Area,Circularity\n4,1\n9").unwrap_err();
        assert!(matches!(
            err,
            MetricsError::Ragged {
                line: 3,
                expected: 2,
                found: 1
            }
        ));
    }

    #[test]
    fn empty_text_has_no_header() {
        assert!(matches!(Table::parse("  \n\n"), Err(MetricsError::Empty)));
    }

    #[test]
    fn non_numeric_cell_reports_column_and_row() {
        let t = Table::parse("Area\n4\nabc\n").unwrap();
        match t.numeric_column(0).unwrap_err() {
            MetricsError::NotNumeric { column, row, value } => {
                assert_eq!(column, "Area");
                assert_eq!(row, 3);
                assert_eq!(value, "abc");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn set_column_replaces_case_insensitively() {
        let mut t = Table::parse("Area,sqrt_real_area\n4,0\n").unwrap();
        t.set_column("Sqrt_Real_Area", &[2.0]);
        assert_eq!(t.headers.len(), 2);
        assert_eq!(t.rows[0][1], "2");
        t.set_column("Extra", &[1.5]);
        assert_eq!(t.headers.last().map(String::as_str), Some("Extra"));
    }

    #[test]
    fn written_csv_reads_back_unchanged() {
        let t = Table {
            headers: vec!["Name".into(), "Area".into()],
            rows: vec![
                vec!["a,b".into(), "1".into()],
                vec!["two\nlines \"quoted\"".into(), "2".into()],
            ],
        };
        let csv = t.to_csv();
        assert!(csv.starts_with("Name,Area\n\"a,b\",1\n"));
        assert_eq!(Table::parse(&csv).unwrap(), t);
    }

    #[test]
    fn format_follows_extension() {
        assert_eq!(ArtifactFormat::from_path(Path::new("a.XLSX")), ArtifactFormat::Xlsx);
        assert_eq!(ArtifactFormat::from_path(Path::new("a.csv")), ArtifactFormat::Csv);
    }

    #[test]
    fn workbook_written_and_read_back() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("img1.xlsx");
        let t = Table::parse("Label,Area,Circularity\nA,4,1\nB,16,0.25\n").unwrap();
        t.write(&path).unwrap();

        let back = Table::read(&path).unwrap();
        assert_eq!(back.headers, vec!["Label", "Area", "Circularity"]);
        assert_eq!(back.rows[0][0], "A");
        assert_eq!(back.numeric_column(1).unwrap(), vec![4.0, 16.0]);
        assert_eq!(back.numeric_column(2).unwrap(), vec![1.0, 0.25]);
    }

    #[test]
    fn truncated_workbook_is_a_spreadsheet_error() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("partial.xlsx");
        std::fs::write(&path, b"PK\x03\x04 not yet complete").unwrap();
        assert!(matches!(
            Table::read(&path),
            Err(MetricsError::Spreadsheet { .. })
        ));
    }
}
