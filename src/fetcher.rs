//! HTTP resource fetcher: streams model weights and tokenizer files into a
//! local cache directory.

use std::path::{Path, PathBuf};

use futures::StreamExt;
use tokio::io::AsyncWriteExt;

use crate::engine::ResourceFetcher;
use crate::error::{Error, Result};

pub struct HttpResourceFetcher {
    client: reqwest::Client,
    cache_dir: PathBuf,
}

impl HttpResourceFetcher {
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            client: reqwest::Client::new(),
            cache_dir: cache_dir.into(),
        }
    }

    /// Cache path for a uri, derived from its last path segment.
    pub fn local_path(&self, uri: &str) -> Result<PathBuf> {
        let name = uri
            .rsplit('/')
            .next()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| Error::Fetch(format!("uri has no file name: {uri}")))?;
        Ok(self.cache_dir.join(name))
    }

    async fn download(
        &self,
        uri: &str,
        dest: &Path,
        mut on_progress: impl FnMut(f64) + Send,
    ) -> Result<()> {
        let response = self.client.get(uri).send().await?.error_for_status()?;
        let total = response.content_length();

        tokio::fs::create_dir_all(&self.cache_dir).await?;
        // Write to a temp name so a cache hit never sees a partial file.
        let partial = dest.with_extension("partial");
        let mut file = tokio::fs::File::create(&partial).await?;

        let mut downloaded: u64 = 0;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            downloaded += chunk.len() as u64;
            if let Some(total) = total {
                if total > 0 {
                    on_progress(downloaded as f64 / total as f64);
                }
            }
        }
        file.flush().await?;
        drop(file);

        tokio::fs::rename(&partial, dest).await?;
        on_progress(1.0);
        Ok(())
    }
}

impl ResourceFetcher for HttpResourceFetcher {
    async fn fetch(&self, uri: &str, mut on_progress: impl FnMut(f64) + Send) -> Result<PathBuf> {
        let dest = self.local_path(uri)?;
        if tokio::fs::try_exists(&dest).await? {
            log::debug!("cache hit for {uri}");
            on_progress(1.0);
            return Ok(dest);
        }
        log::info!("downloading {uri}");
        self.download(uri, &dest, &mut on_progress).await?;
        Ok(dest)
    }

    async fn fetch_many(&self, uris: &[&str]) -> Result<Vec<PathBuf>> {
        let mut paths = Vec::with_capacity(uris.len());
        for uri in uris {
            paths.push(self.fetch(uri, |_| {}).await?);
        }
        Ok(paths)
    }

    async fn remove_many(&self, uris: &[&str]) -> Result<()> {
        for uri in uris {
            let path = self.local_path(uri)?;
            match tokio::fs::remove_file(&path).await {
                Ok(()) => log::info!("removed {}", path.display()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}
