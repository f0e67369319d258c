use crate::error::{Error, Result};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;

/// Deadline for external converters (soffice, pdftotext, OCR).
const CONVERT_TIMEOUT_SECS: u64 = 120;

/// Locates a binary on PATH.
pub fn which(binary: &str) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(binary))
        .find(|candidate| candidate.is_file())
}

/// The headless office binary used for document conversion, if any.
pub fn soffice_binary() -> Option<PathBuf> {
    which("soffice")
        .or_else(|| which("libreoffice"))
        .or_else(|| which("soffice.bin"))
}

async fn run_with_timeout(mut cmd: Command) -> Result<std::process::Output> {
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
    let child = cmd.spawn()?;
    let output = tokio::time::timeout(
        std::time::Duration::from_secs(CONVERT_TIMEOUT_SECS),
        child.wait_with_output(),
    )
    .await
    .map_err(|_| Error::Internal("external converter timed out".into()))??;
    Ok(output)
}

/// Extracts plain text from a document on disk.
///
/// Supported: PDF, DOCX, DOC, RTF, ODT, TXT, HTML. PDF falls back from
/// embedded-text extraction (`pdftotext`) to OCR (`ocrmypdf`) when the PDF has
/// no text layer. Returns `None` when nothing useful could be extracted.
pub async fn extract_text(path: &Path) -> Result<Option<String>> {
    if !tokio::fs::try_exists(path).await.unwrap_or(false) {
        return Err(Error::NotFound(format!("file not found: {}", path.display())));
    }

    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase())
        .unwrap_or_default();

    let text = match ext.as_str() {
        "txt" | "md" | "csv" => {
            let bytes = tokio::fs::read(path).await?;
            Some(String::from_utf8_lossy(&bytes).into_owned())
        }
        "html" | "htm" => {
            let bytes = tokio::fs::read(path).await?;
            let raw = String::from_utf8_lossy(&bytes).into_owned();
            // scraper's DOM is not Send, so parsing stays on a worker thread
            let extracted = tokio::task::spawn_blocking(move || html_to_text(&raw))
                .await
                .map_err(|e| Error::Internal(format!("html parse task failed: {}", e)))?;
            Some(extracted)
        }
        "pdf" => extract_pdf_text(path).await?,
        "docx" | "doc" | "rtf" | "odt" => extract_via_soffice(path).await?,
        other => {
            tracing::info!(ext = other, path = %path.display(), "unsupported document type");
            None
        }
    };

    Ok(text.map(|t| t.trim().to_string()).filter(|t| !t.is_empty()))
}

/// Collapses an HTML document to its visible text.
fn html_to_text(raw: &str) -> String {
    let document = scraper::Html::parse_document(raw);
    let skip = scraper::Selector::parse("script, style, noscript").expect("static selector");
    let skipped: std::collections::HashSet<_> = document
        .select(&skip)
        .flat_map(|el| el.descendants().map(|n| n.id()))
        .collect();

    let mut out = String::new();
    for node in document.tree.nodes() {
        if skipped.contains(&node.id()) {
            continue;
        }
        if let scraper::Node::Text(text) = node.value() {
            let trimmed = text.trim();
            if !trimmed.is_empty() {
                if !out.is_empty() {
                    out.push('\n');
                }
                out.push_str(trimmed);
            }
        }
    }
    out
}

/// PDF extraction: embedded text first, OCR as a fallback.
async fn extract_pdf_text(path: &Path) -> Result<Option<String>> {
    if let Some(pdftotext) = which("pdftotext") {
        let mut cmd = Command::new(pdftotext);
        cmd.arg("-layout").arg(path).arg("-");
        match run_with_timeout(cmd).await {
            Ok(output) if output.status.success() => {
                let text = String::from_utf8_lossy(&output.stdout).into_owned();
                if !text.trim().is_empty() {
                    return Ok(Some(text));
                }
            }
            Ok(output) => {
                tracing::warn!(
                    path = %path.display(),
                    stderr = %crate::utils::safe_preview(&String::from_utf8_lossy(&output.stderr), 500),
                    "pdftotext failed"
                );
            }
            Err(e) => tracing::warn!(path = %path.display(), error = %e, "pdftotext failed"),
        }
    }

    // No text layer: OCR when available
    if let Some(ocrmypdf) = which("ocrmypdf") {
        let sidecar = path.with_extension("ocr.txt");
        let mut cmd = Command::new(ocrmypdf);
        cmd.arg("--skip-text")
            .arg("--sidecar")
            .arg(&sidecar)
            .arg(path)
            .arg("-");
        match run_with_timeout(cmd).await {
            Ok(output) if output.status.success() => {
                let text = tokio::fs::read_to_string(&sidecar).await.unwrap_or_default();
                let _ = tokio::fs::remove_file(&sidecar).await;
                if !text.trim().is_empty() {
                    return Ok(Some(text));
                }
            }
            Ok(_) | Err(_) => {
                let _ = tokio::fs::remove_file(&sidecar).await;
                tracing::warn!(path = %path.display(), "OCR fallback failed");
            }
        }
    } else {
        tracing::info!(path = %path.display(), "no OCR binary available for text-less PDF");
    }

    Ok(None)
}

/// Office formats are extracted by converting to txt with the headless
/// office suite.
async fn extract_via_soffice(path: &Path) -> Result<Option<String>> {
    let Some(soffice) = soffice_binary() else {
        tracing::warn!(path = %path.display(), "soffice not found in PATH, cannot extract text");
        return Ok(None);
    };

    let outdir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut cmd = Command::new(soffice);
    cmd.arg("--headless")
        .arg("--convert-to")
        .arg("txt:Text")
        .arg("--outdir")
        .arg(outdir)
        .arg(path);

    let output = run_with_timeout(cmd).await?;
    if !output.status.success() {
        tracing::warn!(
            path = %path.display(),
            stderr = %crate::utils::safe_preview(&String::from_utf8_lossy(&output.stderr), 500),
            "soffice txt conversion failed"
        );
        return Ok(None);
    }

    let produced = outdir.join(path.file_stem().unwrap_or_default()).with_extension("txt");
    match tokio::fs::read(&produced).await {
        Ok(bytes) => {
            let text = String::from_utf8_lossy(&bytes).into_owned();
            let _ = tokio::fs::remove_file(&produced).await;
            Ok(Some(text))
        }
        Err(_) => Ok(None),
    }
}

/// Outcome of a preview-PDF conversion attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PreviewOutcome {
    /// Path of the produced (or pre-existing) PDF.
    Ok(PathBuf),
    Failed(String),
    SkippedNoSoffice,
}

/// Produces a PDF preview for a stored document. PDFs are their own preview;
/// other formats go through `soffice --convert-to pdf`.
pub async fn generate_pdf_preview(path: &Path) -> PreviewOutcome {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase())
        .unwrap_or_default();
    if ext == "pdf" {
        return PreviewOutcome::Ok(path.to_path_buf());
    }

    let Some(soffice) = soffice_binary() else {
        return PreviewOutcome::SkippedNoSoffice;
    };

    let outdir = path.parent().unwrap_or_else(|| Path::new(".")).to_path_buf();
    let mut cmd = Command::new(soffice);
    cmd.arg("--headless")
        .arg("--convert-to")
        .arg("pdf")
        .arg("--outdir")
        .arg(&outdir)
        .arg(path);

    match run_with_timeout(cmd).await {
        Ok(output) => {
            let produced = outdir.join(path.file_stem().unwrap_or_default()).with_extension("pdf");
            if output.status.success() && produced.is_file() {
                PreviewOutcome::Ok(produced)
            } else {
                PreviewOutcome::Failed(
                    crate::utils::safe_preview(&String::from_utf8_lossy(&output.stderr), 500),
                )
            }
        }
        Err(e) => PreviewOutcome::Failed(e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn txt_extraction_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc.txt");
        std::fs::write(&path, "Условия доставки\nраздел 2").unwrap();

        let text = extract_text(&path).await.unwrap().unwrap();
        assert!(text.contains("Условия доставки"));
    }

    #[tokio::test]
    async fn missing_file_is_not_found() {
        let res = extract_text(Path::new("/no/such/file.txt")).await;
        assert!(matches!(res, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn html_extraction_strips_markup_and_scripts() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("page.html");
        std::fs::write(
            &path,
            "<html><head><script>var x=1;</script></head><body><h1>Прайс</h1><p>Розы — 500</p></body></html>",
        )
        .unwrap();

        let text = extract_text(&path).await.unwrap().unwrap();
        assert!(text.contains("Прайс"));
        assert!(text.contains("Розы"));
        assert!(!text.contains("var x"));
    }

    #[tokio::test]
    async fn unknown_extension_yields_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.bin");
        std::fs::write(&path, [0u8, 1, 2]).unwrap();
        assert!(extract_text(&path).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn empty_file_yields_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.txt");
        std::fs::write(&path, "   \n ").unwrap();
        assert!(extract_text(&path).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn pdf_preview_of_pdf_is_itself() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc.pdf");
        std::fs::write(&path, b"%PDF-1.4").unwrap();
        assert_eq!(generate_pdf_preview(&path).await, PreviewOutcome::Ok(path));
    }
}
