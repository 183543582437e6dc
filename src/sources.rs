//! Source registry: user documents indexed for retrieval, linked per chat.

use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::db::{Database, Role, Source};
use crate::engine::{DocumentReader, InferenceEngine, VectorStore};
use crate::error::Result;
use crate::generator::Generator;
use crate::splitter::{self, CHUNK_OVERLAP, CHUNK_SIZE};

#[derive(Debug, Clone)]
pub struct SourceEntry {
    pub source: Source,
    /// True while the source's chunks are still being indexed.
    pub is_processing: bool,
}

pub struct NewSource {
    pub name: String,
    pub file_type: String,
    pub size_bytes: Option<i64>,
}

#[derive(Debug)]
pub enum AddSourceOutcome {
    Added(Source),
    /// The file held no extractable text.
    EmptyDocument,
    Failed,
}

pub struct SourceRegistry<R> {
    db: Arc<Database>,
    reader: R,
    inner: Mutex<Vec<SourceEntry>>,
}

impl<R: DocumentReader> SourceRegistry<R> {
    pub fn new(db: Arc<Database>, reader: R) -> Self {
        Self {
            db,
            reader,
            inner: Mutex::new(Vec::new()),
        }
    }

    pub fn load_sources(&self) -> Result<()> {
        let sources = self.db.list_sources()?;
        *self.inner.lock().unwrap() = sources
            .into_iter()
            .map(|source| SourceEntry {
                source,
                is_processing: false,
            })
            .collect();
        Ok(())
    }

    pub fn sources(&self) -> Vec<SourceEntry> {
        self.inner.lock().unwrap().clone()
    }

    /// Extract, persist, and index a new source. The entry appears in the
    /// list as processing while its chunks are added to the store; if any
    /// chunk fails, the row, the entry, and any indexed chunks are rolled
    /// back.
    pub async fn add_source(
        &self,
        meta: NewSource,
        path: &Path,
        store: &impl VectorStore,
    ) -> AddSourceOutcome {
        let text = match self.reader.read(path).await {
            Ok(text) => text,
            Err(e) => {
                log::error!("reading source {} failed: {e}", meta.name);
                return AddSourceOutcome::Failed;
            }
        };
        if text.trim().is_empty() {
            return AddSourceOutcome::EmptyDocument;
        }

        let source = match self
            .db
            .insert_source(&meta.name, &meta.file_type, meta.size_bytes)
        {
            Ok(source) => source,
            Err(e) => {
                log::error!("persisting source {} failed: {e}", meta.name);
                return AddSourceOutcome::Failed;
            }
        };
        self.inner.lock().unwrap().push(SourceEntry {
            source: source.clone(),
            is_processing: true,
        });

        for chunk in splitter::split_text(&text, CHUNK_SIZE, CHUNK_OVERLAP) {
            if let Err(e) = store.add(&chunk, source.id).await {
                log::error!("indexing source {} failed: {e}", source.name);
                self.roll_back(&source, store).await;
                return AddSourceOutcome::Failed;
            }
        }

        let mut inner = self.inner.lock().unwrap();
        if let Some(entry) = inner.iter_mut().find(|e| e.source.id == source.id) {
            entry.is_processing = false;
        }
        AddSourceOutcome::Added(source)
    }

    async fn roll_back(&self, source: &Source, store: &impl VectorStore) {
        if let Err(e) = store.delete_document(source.id).await {
            log::warn!("rollback: deleting chunks of {} failed: {e}", source.name);
        }
        if let Err(e) = self.db.delete_source(source.id) {
            log::warn!("rollback: deleting row of {} failed: {e}", source.name);
        }
        self.inner
            .lock()
            .unwrap()
            .retain(|e| e.source.id != source.id);
    }

    /// Remove a source everywhere: announce the removal to every linked
    /// chat, drop its chunks from the store, delete the row, and refresh
    /// the orchestrator's transcript so an open chat shows the notice.
    pub async fn delete_source<E: InferenceEngine>(
        &self,
        source: &Source,
        store: &impl VectorStore,
        generator: &Generator<E>,
    ) -> Result<()> {
        self.db.delete_source_from_chats(source.id, &source.name)?;
        store.delete_document(source.id).await?;
        self.db.delete_source(source.id)?;
        self.load_sources()?;
        generator.refresh_active_messages()
    }

    pub fn rename_source(&self, source_id: i64, name: &str) -> Result<()> {
        self.db.rename_source(source_id, name)?;
        self.load_sources()
    }

    /// Flip a source's availability in a chat, leaving an `event` notice in
    /// the transcript. Returns the new state.
    pub fn toggle_source(&self, chat_id: i64, source: &Source) -> Result<bool> {
        let enabled = self.db.is_source_linked(chat_id, source.id)?;
        if enabled {
            self.db.unlink_source(chat_id, source.id)?;
            let notice = format!(
                "Source \"{}\" is no longer available in this chat.",
                source.name
            );
            self.db
                .persist_message(chat_id, Role::Event, &notice, None, None, None)?;
            Ok(false)
        } else {
            self.db.link_source(chat_id, source.id)?;
            let notice = format!("Source \"{}\" is now available in this chat.", source.name);
            self.db
                .persist_message(chat_id, Role::Event, &notice, None, None, None)?;
            Ok(true)
        }
    }
}
