//! Persistence and generation-orchestration core for an on-device LLM chat
//! assistant: SQLite-backed chats, messages, sources, and benchmarks, plus
//! the registries and the generation orchestrator that drive them. The
//! native inference engine, embedding index, and memory probe plug in
//! through the traits in [`engine`].

pub mod catalog;
pub mod chats;
pub mod context;
pub mod db;
pub mod engine;
pub mod error;
pub mod extractor;
pub mod fetcher;
pub mod generator;
pub mod models;
pub mod sources;
pub mod splitter;

pub use db::Database;
pub use error::{Error, Result};

use std::path::Path;
use std::sync::Arc;

/// Open the app database, creating the directory and schema as needed, and
/// reconcile the built-in model catalog.
pub fn open(app_dir: &Path) -> Result<Arc<Database>> {
    std::fs::create_dir_all(app_dir)?;
    let db = Database::new(&app_dir.join("pocketllm.db"))?;
    db.sync_builtin_models(catalog::BUILTIN_MODELS)?;
    Ok(Arc::new(db))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::ModelOrigin;

    #[test]
    fn open_creates_the_database_and_seeds_builtins() {
        let dir = std::env::temp_dir().join("pocketllm-open-test");
        std::fs::remove_dir_all(&dir).ok();

        let db = open(&dir).unwrap();

        let models = db.list_models().unwrap();
        let builtins = models
            .iter()
            .filter(|m| m.origin == ModelOrigin::BuiltIn)
            .count();
        assert_eq!(builtins, catalog::BUILTIN_MODELS.len());

        std::fs::remove_dir_all(&dir).ok();
    }
}
