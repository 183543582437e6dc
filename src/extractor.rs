//! Plain-text extraction from user-picked source files.

use std::path::Path;

use crate::engine::DocumentReader;
use crate::error::{Error, Result};

pub struct FileDocumentReader;

impl DocumentReader for FileDocumentReader {
    async fn read(&self, path: &Path) -> Result<String> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .unwrap_or_default();

        match ext.as_str() {
            "txt" | "md" => Ok(tokio::fs::read_to_string(path).await?),
            "pdf" => {
                // pdf-extract is CPU-bound, keep it off the runtime threads.
                let bytes = tokio::fs::read(path).await?;
                tokio::task::spawn_blocking(move || {
                    pdf_extract::extract_text_from_mem(&bytes)
                        .map_err(|e| Error::Extract(e.to_string()))
                })
                .await
                .map_err(|e| Error::Extract(e.to_string()))?
            }
            other => Err(Error::UnsupportedFileType(other.to_string())),
        }
    }
}
