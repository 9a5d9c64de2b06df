//! Manual ingestion: pushed URLs, uploaded text, text files and PDFs.

use std::collections::BTreeMap;
use std::path::Path;

use tracing::{debug, info, instrument};
use url::Url;

use tramit_crawler::Crawler;
use tramit_shared::{DocType, Document, Result, TramitError};

use crate::store::DocumentStore;

/// Fetch `url` with the crawler's client and safety checks, then store its
/// main content as a web document.
#[instrument(skip_all, fields(url = %url))]
pub async fn ingest_url(
    store: &DocumentStore,
    crawler: &Crawler,
    url: &Url,
) -> Result<(Document, usize)> {
    let page = crawler.fetch_page(url).await?;
    let title = page
        .title
        .as_deref()
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .unwrap_or(url.as_str());

    let added = store
        .add_document(title, &page.main_content, DocType::Web, Some(url.as_str()))
        .await?;
    info!(doc_id = %added.0.id, chunks = added.1, "URL ingested");
    Ok(added)
}

/// Store already-extracted text (pasted content, PDF or OCR output).
pub async fn ingest_text(
    store: &DocumentStore,
    title: &str,
    text: &str,
    doc_type: DocType,
) -> Result<(Document, usize)> {
    let title = title.trim();
    if title.is_empty() {
        return Err(TramitError::validation("document title is empty"));
    }
    store.add_document(title, text, doc_type, None).await
}

/// Store the file at `path`: a `.pdf` has its text layer extracted, anything
/// else is read as UTF-8 text. The title defaults to the file stem; the file
/// name is kept in the document metadata.
#[instrument(skip_all, fields(path = %path.display()))]
pub async fn ingest_file(
    store: &DocumentStore,
    path: &Path,
    title: Option<&str>,
    doc_type: DocType,
) -> Result<(Document, usize)> {
    let text = if is_pdf(path) {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| TramitError::io(path, e))?;
        pdf_text(bytes).await?
    } else {
        tokio::fs::read_to_string(path)
            .await
            .map_err(|e| TramitError::io(path, e))?
    };

    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());
    let title = title.map(str::trim).filter(|t| !t.is_empty()).unwrap_or(&stem);

    let mut metadata = BTreeMap::new();
    if let Some(name) = path.file_name() {
        metadata.insert("file".to_string(), name.to_string_lossy().into_owned());
    }

    let added = store
        .add_document_with_metadata(title, &text, doc_type, None, metadata)
        .await?;
    info!(doc_id = %added.0.id, chunks = added.1, "file ingested");
    Ok(added)
}

fn is_pdf(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("pdf"))
}

/// Text of every page, in order. Runs on the blocking pool; a panic inside
/// the PDF parser is reported as a parse error.
async fn pdf_text(bytes: Vec<u8>) -> Result<String> {
    let text = tokio::task::spawn_blocking(move || pdf_extract::extract_text_from_mem(&bytes))
        .await
        .map_err(|e| TramitError::parse(format!("PDF extraction aborted: {e}")))?
        .map_err(|e| TramitError::parse(format!("failed to extract PDF text: {e}")))?;
    debug!(chars = text.chars().count(), "PDF text extracted");
    Ok(text)
}
