//! File intake: size and format validation, content hashing and text extraction.

use regex::Regex;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use tokio::task::JoinError;

use calamine::{Data, Reader, open_workbook_auto_from_rs};

use super::error::PipelineError;
use crate::stores::compute_content_hash;

/// How the text of a source file was obtained.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SourceFormat {
    /// Plain or markdown text, including OCR output.
    Text,
    /// Comma, semicolon or tab separated values.
    Delimited,
    /// PDF with a text layer.
    Pdf,
    /// Spreadsheet workbook.
    Spreadsheet,
    /// CAD drawing exchange file.
    Cad,
}

/// A validated file with its extracted text.
#[derive(Clone, Debug)]
pub struct SourceDocument {
    /// Path as submitted.
    pub path: PathBuf,
    /// Detected format.
    pub format: SourceFormat,
    /// Raw size in bytes.
    pub size: u64,
    /// SHA-256 of the raw bytes.
    pub content_hash: String,
    /// Extracted text with `\n` line endings.
    pub text: String,
}

const IMAGE_EXTENSIONS: [&str; 7] = ["png", "jpg", "jpeg", "tif", "tiff", "bmp", "gif"];

/// Validate and read `path`. Fails fast with a validation error; nothing is persisted.
pub async fn load_source(path: &Path, max_bytes: u64) -> Result<SourceDocument, PipelineError> {
    let metadata = tokio::fs::metadata(path).await.map_err(|error| {
        PipelineError::validation(
            format!("cannot read {}: {error}", path.display()),
            "check that the file exists and is readable by the service",
        )
    })?;
    if !metadata.is_file() {
        return Err(PipelineError::validation(
            format!("{} is not a regular file", path.display()),
            "submit a single document file, not a directory",
        ));
    }
    if metadata.len() > max_bytes {
        return Err(PipelineError::validation(
            format!(
                "{} is {} bytes, above the {max_bytes} byte ceiling",
                path.display(),
                metadata.len()
            ),
            "split the document or raise MAX_FILE_BYTES",
        ));
    }

    let bytes = tokio::fs::read(path).await.map_err(|error| {
        PipelineError::validation(
            format!("cannot read {}: {error}", path.display()),
            "check file permissions",
        )
    })?;
    if bytes.is_empty() {
        return Err(PipelineError::validation(
            format!("{} is empty", path.display()),
            "submit a document with content",
        ));
    }

    let extension = path
        .extension()
        .map(|ext| ext.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    let format = detect_format(&extension, &bytes)?;
    let content_hash = compute_content_hash(&bytes);
    let size = bytes.len() as u64;

    let text = tokio::task::spawn_blocking(move || extract_text(format, &bytes))
        .await
        .map_err(|error| extraction_failure(path, error))??;

    let text = text.replace("\r\n", "\n").replace('\r', "\n");
    if text.trim().is_empty() {
        return Err(PipelineError::validation(
            format!("no extractable text in {}", path.display()),
            "the file looks like a scan without a text layer; run OCR and submit the text export",
        ));
    }

    tracing::debug!(path = %path.display(), ?format, size, chars = text.len(), "Loaded source document");
    Ok(SourceDocument {
        path: path.to_path_buf(),
        format,
        size,
        content_hash,
        text,
    })
}

/// Extractor panics come from malformed input, so they are reported as validation failures.
fn extraction_failure(path: &Path, error: JoinError) -> PipelineError {
    if error.is_panic() {
        PipelineError::validation(
            format!("{} could not be parsed", path.display()),
            "the file is damaged or uses an unsupported encoding; re-export it, or run OCR and submit the text export",
        )
    } else {
        PipelineError::Internal(format!("extraction task failed: {error}"))
    }
}

/// File extensions recognised without sniffing the content.
pub const SUPPORTED_EXTENSIONS: [&str; 13] = [
    "txt", "text", "md", "markdown", "csv", "tsv", "pdf", "xlsx", "xlsm", "xls", "xlsb", "ods",
    "dxf",
];

/// Whether `path` carries one of [`SUPPORTED_EXTENSIONS`].
pub fn has_supported_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
        .is_some_and(|ext| SUPPORTED_EXTENSIONS.contains(&ext.as_str()))
}

fn detect_format(extension: &str, bytes: &[u8]) -> Result<SourceFormat, PipelineError> {
    match extension {
        "txt" | "text" | "md" | "markdown" => Ok(SourceFormat::Text),
        "csv" | "tsv" => Ok(SourceFormat::Delimited),
        "pdf" => Ok(SourceFormat::Pdf),
        "xlsx" | "xlsm" | "xls" | "xlsb" | "ods" => Ok(SourceFormat::Spreadsheet),
        "dxf" => Ok(SourceFormat::Cad),
        ext if IMAGE_EXTENSIONS.contains(&ext) => Err(PipelineError::validation(
            format!("raster image (.{ext}) has no text layer"),
            "run OCR on the scan and submit the resulting text or PDF",
        )),
        _ if bytes.starts_with(b"%PDF") => Ok(SourceFormat::Pdf),
        _ if std::str::from_utf8(bytes).is_ok() => Ok(SourceFormat::Text),
        ext => Err(PipelineError::validation(
            format!("unsupported file format `.{ext}`"),
            "submit text, PDF, spreadsheet or DXF exports",
        )),
    }
}

fn extract_text(format: SourceFormat, bytes: &[u8]) -> Result<String, PipelineError> {
    match format {
        SourceFormat::Text | SourceFormat::Delimited => {
            Ok(String::from_utf8_lossy(bytes).into_owned())
        }
        SourceFormat::Pdf => pdf_extract::extract_text_from_mem(bytes).map_err(|error| {
            PipelineError::validation(
                format!("could not extract PDF text: {error}"),
                "export the PDF with a text layer or run OCR first",
            )
        }),
        SourceFormat::Spreadsheet => extract_workbook(bytes),
        SourceFormat::Cad => Ok(extract_dxf(&String::from_utf8_lossy(bytes))),
    }
}

/// Render every sheet as a heading followed by ` | ` separated rows.
fn extract_workbook(bytes: &[u8]) -> Result<String, PipelineError> {
    let mut workbook = open_workbook_auto_from_rs(Cursor::new(bytes.to_vec())).map_err(|error| {
        PipelineError::validation(
            format!("could not open workbook: {error}"),
            "save the workbook as .xlsx and resubmit",
        )
    })?;

    let mut out = String::new();
    for sheet_name in workbook.sheet_names().to_vec() {
        let Ok(range) = workbook.worksheet_range(&sheet_name) else {
            continue;
        };
        out.push_str(&format!("# {sheet_name}\n"));
        for row in range.rows() {
            let cells: Vec<String> = row.iter().map(cell_text).collect();
            if cells.iter().all(|cell| cell.is_empty()) {
                continue;
            }
            out.push_str(&cells.join(" | "));
            out.push('\n');
        }
        out.push('\n');
    }
    Ok(out)
}

fn cell_text(cell: &Data) -> String {
    match cell {
        Data::Empty => String::new(),
        Data::String(text) => text.trim().to_string(),
        Data::Float(value) => {
            if value.fract() == 0.0 && value.abs() < 1e15 {
                format!("{value:.0}")
            } else {
                value.to_string()
            }
        }
        Data::Int(value) => value.to_string(),
        Data::Bool(value) => value.to_string(),
        Data::DateTime(value) => value.to_string(),
        _ => String::new(),
    }
}

static MTEXT_FORMAT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\\[ACFHQTWfhpqltw][^;\\]*;|\\[LlOoKk]|[{}]").expect("mtext pattern is valid")
});

/// Collect TEXT and MTEXT contents from a DXF group-code stream.
fn extract_dxf(source: &str) -> String {
    let lines: Vec<&str> = source.lines().map(str::trim).collect();
    let mut out = Vec::new();
    let mut entity = "";
    let mut mtext = String::new();

    for pair in lines.chunks(2) {
        let [code, value] = pair else {
            break;
        };
        match *code {
            "0" => {
                if !mtext.is_empty() {
                    out.push(std::mem::take(&mut mtext));
                }
                entity = value;
            }
            "1" | "3" if entity == "MTEXT" => mtext.push_str(value),
            "1" if entity == "TEXT" || entity == "ATTRIB" => out.push(value.to_string()),
            _ => {}
        }
    }
    if !mtext.is_empty() {
        out.push(mtext);
    }

    out.iter()
        .map(|text| {
            let text = text.replace("\\P", "\n");
            MTEXT_FORMAT.replace_all(&text, "").trim().to_string()
        })
        .filter(|text| !text.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::error::ErrorCategory;

    #[tokio::test]
    async fn extractor_panics_are_reported_as_invalid_input() {
        let joined = tokio::task::spawn_blocking(|| -> Result<String, PipelineError> {
            panic!("broken cross-reference table")
        })
        .await
        .expect_err("task panicked");
        let error = extraction_failure(Path::new("plan.pdf"), joined);
        assert_eq!(error.category(), ErrorCategory::Validation);
        assert!(error.to_string().contains("plan.pdf"));
        assert!(error.suggestion().contains("OCR"));
    }

    #[tokio::test]
    async fn oversized_files_fail_validation() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("big.txt");
        tokio::fs::write(&path, "x".repeat(64)).await.expect("write");

        let error = load_source(&path, 16).await.expect_err("too big");
        assert!(matches!(error, PipelineError::Validation { .. }));
    }

    #[tokio::test]
    async fn missing_and_empty_files_fail_validation() {
        let dir = tempfile::tempdir().expect("tempdir");
        let missing = load_source(&dir.path().join("absent.txt"), 1024).await;
        assert!(matches!(missing, Err(PipelineError::Validation { .. })));

        let empty = dir.path().join("empty.txt");
        tokio::fs::write(&empty, "").await.expect("write");
        assert!(matches!(
            load_source(&empty, 1024).await,
            Err(PipelineError::Validation { .. })
        ));
    }

    #[tokio::test]
    async fn scans_are_rejected_with_ocr_hint() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("scan.png");
        tokio::fs::write(&path, [0x89, b'P', b'N', b'G']).await.expect("write");

        let error = load_source(&path, 1024).await.expect_err("scan");
        assert!(error.suggestion().contains("OCR"));
    }

    #[tokio::test]
    async fn text_files_are_hashed_and_normalised() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("note.txt");
        tokio::fs::write(&path, "line one\r\nline two\r\n").await.expect("write");

        let source = load_source(&path, 1024).await.expect("load");
        assert_eq!(source.text, "line one\nline two\n");
        assert_eq!(source.format, SourceFormat::Text);
        assert_eq!(source.content_hash.len(), 64);
    }

    #[test]
    fn dxf_text_entities_are_collected() {
        let dxf = "0\nSECTION\n2\nENTITIES\n0\nTEXT\n8\n0\n1\nSHEET A-101 GROUND FLOOR PLAN\n0\nMTEXT\n3\nWall type W1:\\P\n1\n{\\fArial|b0;200 mm brick}\n0\nENDSEC\n";
        let text = extract_dxf(dxf);
        assert_eq!(text, "SHEET A-101 GROUND FLOOR PLAN\nWall type W1:\n200 mm brick");
    }
}
