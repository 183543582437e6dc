//! Model registry: the in-memory model list plus download lifecycle,
//! backed by the `models` table and a resource fetcher.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::db::{Database, Model, ModelOrigin};
use crate::engine::ResourceFetcher;
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadStatus {
    Downloading { progress: u8 },
    Downloaded,
}

#[derive(Default)]
struct ModelCache {
    models: Vec<Model>,
    download_states: HashMap<i64, DownloadStatus>,
}

/// Collapses fractional progress into integer percent steps so the cache
/// is only touched when the visible number changes.
struct PercentTracker {
    last: i64,
}

impl PercentTracker {
    fn new() -> Self {
        Self { last: -1 }
    }

    fn update(&mut self, fraction: f64) -> Option<u8> {
        let pct = (fraction.clamp(0.0, 1.0) * 100.0).floor() as i64;
        if pct == self.last {
            None
        } else {
            self.last = pct;
            Some(pct as u8)
        }
    }
}

pub struct ModelRegistry<F> {
    db: Arc<Database>,
    fetcher: F,
    inner: Mutex<ModelCache>,
}

impl<F: ResourceFetcher> ModelRegistry<F> {
    pub fn new(db: Arc<Database>, fetcher: F) -> Self {
        Self {
            db,
            fetcher,
            inner: Mutex::new(ModelCache::default()),
        }
    }

    pub fn load_models(&self) -> Result<()> {
        let models = self.db.list_models()?;
        self.inner.lock().unwrap().models = models;
        Ok(())
    }

    pub fn models(&self) -> Vec<Model> {
        self.inner.lock().unwrap().models.clone()
    }

    pub fn downloaded_models(&self) -> Vec<Model> {
        self.inner
            .lock()
            .unwrap()
            .models
            .iter()
            .filter(|m| m.is_downloaded)
            .cloned()
            .collect()
    }

    /// Transient download state, or `Downloaded` for models whose persisted
    /// flag is already set.
    pub fn download_status(&self, model_id: i64) -> Option<DownloadStatus> {
        let inner = self.inner.lock().unwrap();
        if let Some(status) = inner.download_states.get(&model_id) {
            return Some(*status);
        }
        inner
            .models
            .iter()
            .find(|m| m.id == model_id && m.is_downloaded)
            .map(|_| DownloadStatus::Downloaded)
    }

    fn set_status(&self, model_id: i64, status: DownloadStatus) {
        self.inner
            .lock()
            .unwrap()
            .download_states
            .insert(model_id, status);
    }

    /// Download a model's weights, tokenizer, and tokenizer config, then
    /// mark it downloaded. On failure the transient state is left where the
    /// download stopped and the error is returned to the caller.
    pub async fn download_model(&self, model_id: i64) -> Result<()> {
        let model = self.db.get_model(model_id)?;
        log::info!("downloading model {}", model.name);
        self.set_status(model_id, DownloadStatus::Downloading { progress: 0 });

        let result = async {
            let mut tracker = PercentTracker::new();
            self.fetcher
                .fetch(&model.weights_uri, |fraction| {
                    if let Some(progress) = tracker.update(fraction) {
                        self.set_status(model_id, DownloadStatus::Downloading { progress });
                    }
                })
                .await?;
            self.fetcher
                .fetch_many(&[
                    model.tokenizer_uri.as_str(),
                    model.tokenizer_config_uri.as_str(),
                ])
                .await?;
            Ok(())
        }
        .await;

        if let Err(e) = result {
            log::error!("download of {} failed: {e}", model.name);
            return Err(e);
        }

        self.db.set_model_downloaded(model_id, true)?;
        self.load_models()?;
        self.set_status(model_id, DownloadStatus::Downloaded);
        Ok(())
    }

    /// Delete the model's fetched files, leaving the row in place. Local
    /// models own their files; nothing is removed for them.
    pub async fn remove_model_files(&self, model_id: i64) -> Result<()> {
        let model = self.db.get_model(model_id)?;
        if model.origin.has_fetched_files() {
            self.fetcher
                .remove_many(&[
                    model.weights_uri.as_str(),
                    model.tokenizer_uri.as_str(),
                    model.tokenizer_config_uri.as_str(),
                ])
                .await?;
        }
        self.db.set_model_downloaded(model_id, false)?;
        self.inner
            .lock()
            .unwrap()
            .download_states
            .remove(&model_id);
        self.load_models()
    }

    /// Remove the model entirely: fetched files first, then the row.
    pub async fn remove_model(&self, model_id: i64) -> Result<()> {
        self.remove_model_files(model_id).await?;
        self.db.delete_model(model_id)?;
        self.load_models()
    }

    /// Rename a model and swap its tokenizer resources. For models with
    /// fetched files the old tokenizer files are removed and the new ones
    /// fetched before the row is updated, so a failed fetch leaves the
    /// stored uris pointing at files that exist.
    pub async fn edit_model(
        &self,
        model_id: i64,
        name: &str,
        tokenizer_uri: &str,
        tokenizer_config_uri: &str,
    ) -> Result<()> {
        let model = self.db.get_model(model_id)?;
        let resources_changed =
            tokenizer_uri != model.tokenizer_uri || tokenizer_config_uri != model.tokenizer_config_uri;

        if model.origin.has_fetched_files() && model.is_downloaded && resources_changed {
            self.fetcher
                .remove_many(&[
                    model.tokenizer_uri.as_str(),
                    model.tokenizer_config_uri.as_str(),
                ])
                .await?;
            self.fetcher
                .fetch_many(&[tokenizer_uri, tokenizer_config_uri])
                .await?;
        }

        self.db
            .update_model_resources(model_id, tokenizer_uri, tokenizer_config_uri, name)?;
        self.load_models()
    }

    /// Register a model whose files already live on disk.
    pub fn add_local_model(
        &self,
        name: &str,
        weights_path: &str,
        tokenizer_path: &str,
        tokenizer_config_path: &str,
    ) -> Result<i64> {
        let id = self.db.insert_model(
            name,
            ModelOrigin::Local,
            true,
            weights_path,
            tokenizer_path,
            tokenizer_config_path,
            None,
            None,
        )?;
        self.load_models()?;
        Ok(id)
    }

    /// Register a model by its remote uris; files are fetched on demand.
    pub fn add_remote_model(
        &self,
        name: &str,
        weights_uri: &str,
        tokenizer_uri: &str,
        tokenizer_config_uri: &str,
    ) -> Result<i64> {
        let id = self.db.insert_model(
            name,
            ModelOrigin::Remote,
            false,
            weights_uri,
            tokenizer_uri,
            tokenizer_config_uri,
            None,
            None,
        )?;
        self.load_models()?;
        Ok(id)
    }
}
