//! Tool-capable model catalogue.
//!
//! OpenRouter's model listing is fetched once an hour at most; between
//! fetches a small JSON cache on disk answers. The catalogue is filtered
//! to base models (variant ids carry a `:` separator), deduplicated, and
//! sorted deterministically for presentation.

use std::collections::HashSet;
use std::error::Error;
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::debug;

use crate::api::{ModelInfo, ModelsResponse};
use crate::utils::url::construct_api_url;

/// Only models that can drive the tool widgets are worth listing.
const MODELS_QUERY: &str = "supported_parameters=tools,tool_choice";

const CACHE_TTL: Duration = Duration::from_secs(60 * 60);
const CACHE_FILE: &str = "models.json";

pub async fn fetch_models(
    client: &reqwest::Client,
    base_url: &str,
) -> Result<Vec<ModelInfo>, Box<dyn Error>> {
    let models_url = format!("{}?{}", construct_api_url(base_url, "models"), MODELS_QUERY);
    let response = client
        .get(models_url)
        .header("Content-Type", "application/json")
        .send()
        .await?;

    if !response.status().is_success() {
        let status = response.status();
        let error_text = response
            .text()
            .await
            .unwrap_or_else(|_| "Unknown error".to_string());
        return Err(format!("API request failed with status {status}: {error_text}").into());
    }

    Ok(response.json::<ModelsResponse>().await?.data)
}

/// Drop variant ids, dedupe by id, sort by display name then id.
pub fn prepare_catalogue(models: Vec<ModelInfo>) -> Vec<ModelInfo> {
    let mut seen = HashSet::new();
    let mut catalogue: Vec<ModelInfo> = models
        .into_iter()
        .filter(|model| !model.id.contains(':'))
        .filter(|model| seen.insert(model.id.clone()))
        .collect();
    catalogue.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
    catalogue
}

#[derive(Serialize, Deserialize)]
struct CacheEnvelope {
    fetched_at: DateTime<Utc>,
    data: Vec<ModelInfo>,
}

pub struct ModelCatalogue {
    cache_path: PathBuf,
    ttl: Duration,
}

impl ModelCatalogue {
    pub fn new() -> Self {
        Self {
            cache_path: default_cache_path(),
            ttl: CACHE_TTL,
        }
    }

    pub fn with_cache_path(cache_path: PathBuf, ttl: Duration) -> Self {
        Self { cache_path, ttl }
    }

    /// Answer from the cache when fresh, otherwise fetch, prepare, and
    /// refresh the cache.
    pub async fn load(
        &self,
        client: &reqwest::Client,
        base_url: &str,
    ) -> Result<Vec<ModelInfo>, Box<dyn Error>> {
        if let Some(cached) = self.read_fresh_cache() {
            debug!(count = cached.len(), "model catalogue served from cache");
            return Ok(cached);
        }

        let catalogue = prepare_catalogue(fetch_models(client, base_url).await?);
        if let Err(err) = self.write_cache(&catalogue) {
            // A failed cache write only costs the next call a refetch.
            debug!(error = %err, "model cache write failed");
        }
        Ok(catalogue)
    }

    fn read_fresh_cache(&self) -> Option<Vec<ModelInfo>> {
        let contents = fs::read_to_string(&self.cache_path).ok()?;
        let envelope: CacheEnvelope = serde_json::from_str(&contents).ok()?;
        let age = Utc::now().signed_duration_since(envelope.fetched_at);
        let ttl = chrono::Duration::from_std(self.ttl).ok()?;
        if age < chrono::Duration::zero() || age >= ttl {
            return None;
        }
        Some(envelope.data)
    }

    fn write_cache(&self, catalogue: &[ModelInfo]) -> Result<(), Box<dyn Error>> {
        let parent = self
            .cache_path
            .parent()
            .filter(|dir| !dir.as_os_str().is_empty());
        if let Some(dir) = parent {
            fs::create_dir_all(dir)?;
        }

        let envelope = CacheEnvelope {
            fetched_at: Utc::now(),
            data: catalogue.to_vec(),
        };
        let contents = serde_json::to_string(&envelope)?;
        let mut temp_file = match parent {
            Some(dir) => NamedTempFile::new_in(dir)?,
            None => NamedTempFile::new()?,
        };
        temp_file.write_all(contents.as_bytes())?;
        temp_file
            .persist(&self.cache_path)
            .map_err(|err| -> Box<dyn Error> { Box::new(err) })?;
        Ok(())
    }
}

impl Default for ModelCatalogue {
    fn default() -> Self {
        Self::new()
    }
}

fn default_cache_path() -> PathBuf {
    let proj_dirs = ProjectDirs::from("org", "permacommons", "tickertalk")
        .expect("Failed to determine cache directory");
    proj_dirs.cache_dir().join(CACHE_FILE)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model(id: &str, name: &str) -> ModelInfo {
        ModelInfo {
            id: id.to_string(),
            name: name.to_string(),
        }
    }

    #[test]
    fn catalogue_filters_variants_dedupes_and_sorts() {
        let models = vec![
            model("openai/gpt-4-turbo", "GPT-4 Turbo"),
            model("anthropic/claude-3.5-sonnet:beta", "Claude 3.5 Sonnet (beta)"),
            model("anthropic/claude-3.5-sonnet", "Claude 3.5 Sonnet"),
            model("openai/gpt-4-turbo", "GPT-4 Turbo"),
            model("mistralai/mistral-large", "Mistral Large"),
        ];

        let catalogue = prepare_catalogue(models);
        let ids: Vec<_> = catalogue.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(
            ids,
            [
                "anthropic/claude-3.5-sonnet",
                "openai/gpt-4-turbo",
                "mistralai/mistral-large",
            ]
        );
    }

    #[test]
    fn catalogue_preparation_is_deterministic() {
        let models = vec![
            model("b/two", "Two"),
            model("a/one", "One"),
            model("c/three", "Three"),
        ];
        let first = prepare_catalogue(models.clone());
        let second = prepare_catalogue(models);
        assert_eq!(first, second);
    }

    #[test]
    fn fresh_cache_is_served_and_stale_cache_is_not() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cache_path = dir.path().join("models.json");
        let catalogue = ModelCatalogue::with_cache_path(cache_path.clone(), CACHE_TTL);

        let data = vec![model("a/one", "One")];
        catalogue.write_cache(&data).expect("cache write");
        assert_eq!(catalogue.read_fresh_cache(), Some(data.clone()));

        // Age the envelope past the TTL.
        let stale = CacheEnvelope {
            fetched_at: Utc::now() - chrono::Duration::hours(2),
            data,
        };
        fs::write(&cache_path, serde_json::to_string(&stale).expect("encode"))
            .expect("write stale");
        assert_eq!(catalogue.read_fresh_cache(), None);
    }

    #[tokio::test]
    async fn load_fetches_when_cache_is_cold() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.expect("accept");
            let mut buffer = vec![0_u8; 16 * 1024];
            let _ = stream.read(&mut buffer).await;
            let body = r#"{"data":[
                {"id":"b/two","name":"Two"},
                {"id":"a/one","name":"One"},
                {"id":"a/one:free","name":"One (free)"}
            ]}"#;
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len(),
            );
            stream.write_all(response.as_bytes()).await.expect("write");
        });

        let dir = tempfile::tempdir().expect("tempdir");
        let catalogue = ModelCatalogue::with_cache_path(dir.path().join("models.json"), CACHE_TTL);
        let models = catalogue
            .load(&reqwest::Client::new(), &format!("http://{addr}"))
            .await
            .expect("load");

        let ids: Vec<_> = models.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, ["a/one", "b/two"]);
        // The fetch refreshed the cache.
        assert_eq!(catalogue.read_fresh_cache(), Some(models));
    }
}
