//! Worker bundle (ZIP) builder and content-hash cache (spec §4.3).

use crate::error::{MessError, Result};
use parking_lot::Mutex;
use sha2::{Digest as _, Sha256};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::Arc;

pub struct BuiltBundle {
    pub version: String,
    pub bytes: Vec<u8>,
}

/// Builds and memoizes the worker ZIP per server URL.
///
/// A losing racer discards its own build and adopts the winner's bytes, so
/// every caller observing a given URL sees exactly one version (spec §4.3,
/// §8 property 8). The embedded base archive stands in for the real worker
/// binary this crate's Non-goals exclude — see DESIGN.md.
pub struct BotBundle {
    base_zip: Vec<u8>,
    cache: Mutex<HashMap<String, Arc<BuiltBundle>>>,
}

impl BotBundle {
    pub fn new(base_zip: Vec<u8>) -> Self {
        BotBundle {
            base_zip,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn get_bot_zip(&self, server_url: &str) -> Result<Arc<BuiltBundle>> {
        if let Some(existing) = self.cache.lock().get(server_url) {
            return Ok(existing.clone());
        }

        let built = Arc::new(self.build(server_url)?);

        let mut cache = self.cache.lock();
        let winner = cache.entry(server_url.to_string()).or_insert_with(|| built.clone());
        Ok(winner.clone())
    }

    fn build(&self, server_url: &str) -> Result<BuiltBundle> {
        let reader = std::io::Cursor::new(&self.base_zip);
        let mut source = zip::ZipArchive::new(reader)
            .map_err(|e| MessError::Internal(anyhow::anyhow!("base bundle unreadable: {e}")))?;

        let mut entries: Vec<(String, Vec<u8>)> = Vec::with_capacity(source.len() + 1);
        for i in 0..source.len() {
            let mut file = source
                .by_index(i)
                .map_err(|e| MessError::Internal(anyhow::anyhow!("base bundle entry: {e}")))?;
            let mut content = Vec::new();
            file.read_to_end(&mut content)?;
            entries.push((file.name().to_string(), content));
        }

        let config_json = serde_json::to_vec(&serde_json::json!({ "server": server_url }))?;
        entries.push(("config/config.json".to_string(), config_json));

        entries.sort_by(|a, b| a.0.cmp(&b.0));

        let mut hasher = Sha256::new();
        for (name, content) in &entries {
            hasher.update(name.len().to_string().as_bytes());
            hasher.update(name.as_bytes());
            hasher.update(content.len().to_string().as_bytes());
            hasher.update(content);
        }
        let version = hex::encode(hasher.finalize());

        let mut buffer = Vec::new();
        {
            let mut writer = zip::ZipWriter::new(std::io::Cursor::new(&mut buffer));
            let options = zip::write::FileOptions::default()
                .compression_method(zip::CompressionMethod::Deflated);
            for (name, content) in &entries {
                writer
                    .start_file(name, options)
                    .map_err(|e| MessError::Internal(anyhow::anyhow!("zip write: {e}")))?;
                writer.write_all(content)?;
            }
            writer
                .finish()
                .map_err(|e| MessError::Internal(anyhow::anyhow!("zip finish: {e}")))?;
        }

        Ok(BuiltBundle {
            version,
            bytes: buffer,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_base_zip() -> Vec<u8> {
        let mut buffer = Vec::new();
        {
            let writer = zip::ZipWriter::new(std::io::Cursor::new(&mut buffer));
            writer.finish().unwrap();
        }
        buffer
    }

    #[test]
    fn repeated_calls_are_stable() {
        let bundle = BotBundle::new(empty_base_zip());
        let first = bundle.get_bot_zip("https://example.com").unwrap();
        let second = bundle.get_bot_zip("https://example.com").unwrap();
        assert_eq!(first.version, second.version);
        assert_eq!(first.bytes, second.bytes);
    }

    #[test]
    fn different_urls_differ() {
        let bundle = BotBundle::new(empty_base_zip());
        let a = bundle.get_bot_zip("https://a.example.com").unwrap();
        let b = bundle.get_bot_zip("https://b.example.com").unwrap();
        assert_ne!(a.version, b.version);
    }
}
