//! Seams to the native collaborators. The inference engine, vector store,
//! and memory monitor have no pure-Rust implementation in this crate; the
//! resource fetcher and document reader do (`fetcher`, `extractor`).

use std::path::{Path, PathBuf};

use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::db::{Model, Role};
use crate::Result;

/// Incremental text deltas produced by a generation call. The orchestrator
/// pulls from this stream; producers never call back into it.
pub type TokenStream = BoxStream<'static, Result<String>>;

/// One turn of conversation as handed to the inference engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: Role,
    pub content: String,
}

impl ChatTurn {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// On-device LLM runtime.
pub trait InferenceEngine: Send + Sync {
    /// Load the model's weights and tokenizer. Implementations must be safe
    /// to call with a different model already loaded.
    fn load(&self, model: &Model) -> impl std::future::Future<Output = Result<()>> + Send;

    /// Start a generation over the given turns and return the token stream.
    fn generate(
        &self,
        turns: Vec<ChatTurn>,
    ) -> impl std::future::Future<Output = Result<TokenStream>> + Send;

    /// Request that an in-flight generation stop. Fire-and-forget; the
    /// stream ends on its own once the engine honors the request.
    fn interrupt(&self);

    fn unload(&self) -> impl std::future::Future<Output = Result<()>> + Send;
}

/// Downloads model resources into app storage and removes them again.
pub trait ResourceFetcher: Send + Sync {
    /// Fetch a single resource, reporting progress in [0.0, 1.0].
    fn fetch(
        &self,
        uri: &str,
        on_progress: impl FnMut(f64) + Send,
    ) -> impl std::future::Future<Output = Result<PathBuf>> + Send;

    fn fetch_many(
        &self,
        uris: &[&str],
    ) -> impl std::future::Future<Output = Result<Vec<PathBuf>>> + Send;

    fn remove_many(&self, uris: &[&str]) -> impl std::future::Future<Output = Result<()>> + Send;
}

/// Embedding index over source chunks. Chunks are tagged with the owning
/// source's row id so deletion can drop them all at once.
pub trait VectorStore: Send + Sync {
    fn add(
        &self,
        text: &str,
        document_id: i64,
    ) -> impl std::future::Future<Output = Result<()>> + Send;

    fn delete_document(
        &self,
        document_id: i64,
    ) -> impl std::future::Future<Output = Result<()>> + Send;

    /// Top-k most similar chunks among the given documents.
    fn search(
        &self,
        query: &str,
        document_ids: &[i64],
        top_k: usize,
    ) -> impl std::future::Future<Output = Result<Vec<String>>> + Send;
}

/// Extracts plain text from a user-picked file.
pub trait DocumentReader: Send + Sync {
    fn read(&self, path: &Path) -> impl std::future::Future<Output = Result<String>> + Send;
}

/// Process memory probe, sampled during benchmark runs. Object-safe so the
/// orchestrator can hold it as `Arc<dyn MemoryMonitor>`.
pub trait MemoryMonitor: Send + Sync {
    fn resident_memory_gb(&self) -> f64;
}
