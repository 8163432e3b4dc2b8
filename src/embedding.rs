//! Embedding backends and the in-memory vector plumbing used by the
//! scoring engine. The engine only ever sees the `Embedder` trait;
//! the default backend is a local fastembed model, with a
//! deterministic hashing backend for offline runs and tests.

use std::collections::{HashMap, VecDeque};
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::Mutex;

use anyhow::Result;
use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};
use text_splitter::{ChunkConfig, TextSplitter};
use tiktoken_rs::{CoreBPE, cl100k_base};

/// Vector width of every backend; matches the `float[384]` columns.
pub const EMBEDDING_DIM: usize = 384;
/// Token ceiling for a single embedding call.
const MAX_EMBED_TOKENS: usize = 1280;
/// Embed-call cache size for the hot scoring path.
const EMBED_CACHE_SIZE: usize = 500;

pub trait Embedder: Send + Sync {
    fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

/// fastembed-backed default (BGE small, 384 dims).
pub struct ModelEmbedder {
    model: TextEmbedding,
    splitter: TextSplitter<CoreBPE>,
}

impl ModelEmbedder {
    pub fn new() -> Result<ModelEmbedder> {
        let model = TextEmbedding::try_new(
            InitOptions::new(EmbeddingModel::BGESmallENV15).with_show_download_progress(true),
        )?;
        let tokenizer = cl100k_base()?;
        let splitter = TextSplitter::new(ChunkConfig::new(MAX_EMBED_TOKENS).with_sizer(tokenizer));
        Ok(ModelEmbedder { model, splitter })
    }
}

impl Embedder for ModelEmbedder {
    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        // Long bodies are cut down to the first token-budget chunk;
        // the head of a note is what names and frames it.
        let head = self.splitter.chunks(text).next().unwrap_or(text);
        let mut vectors = self.model.embed(vec![head], None)?;
        vectors
            .pop()
            .ok_or_else(|| anyhow::anyhow!("embedding model returned no vector"))
    }
}

/// Deterministic, offline embedder: character trigrams hashed into a
/// fixed-width vector, L2 normalized. Token overlap produces cosine
/// similarity, which is what the scoring tests need; no model
/// download, no randomness.
pub struct HashEmbedder;

impl Embedder for HashEmbedder {
    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut vector = vec![0.0f32; EMBEDDING_DIM];
        let normalized: String = text
            .to_lowercase()
            .chars()
            .map(|c| if c.is_alphanumeric() { c } else { ' ' })
            .collect();
        for word in normalized.split_whitespace() {
            let padded = format!("^{}$", word);
            let chars: Vec<char> = padded.chars().collect();
            for window in chars.windows(3) {
                let mut hasher = DefaultHasher::new();
                window.hash(&mut hasher);
                let bucket = (hasher.finish() % EMBEDDING_DIM as u64) as usize;
                vector[bucket] += 1.0;
            }
        }
        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut vector {
                *v /= norm;
            }
        }
        Ok(vector)
    }
}

/// Pick a backend by config name.
pub fn embedder_for(kind: &str) -> Result<Box<dyn Embedder>> {
    match kind {
        "hash" => Ok(Box::new(HashEmbedder)),
        _ => Ok(Box::new(ModelEmbedder::new()?)),
    }
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|v| v * v).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

/// Stable-enough content hash for staleness checks on derived
/// embedding rows.
pub fn content_hash(text: &str) -> String {
    let mut hasher = DefaultHasher::new();
    text.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

/// Small LRU over embed calls so scoring one write does not re-embed
/// the same content repeatedly.
pub struct EmbedCache {
    inner: Mutex<EmbedCacheInner>,
}

struct EmbedCacheInner {
    map: HashMap<String, Vec<f32>>,
    order: VecDeque<String>,
}

impl Default for EmbedCache {
    fn default() -> Self {
        EmbedCache {
            inner: Mutex::new(EmbedCacheInner {
                map: HashMap::new(),
                order: VecDeque::new(),
            }),
        }
    }
}

impl EmbedCache {
    /// Embed through the cache; errors from the backend pass through
    /// uncached.
    pub fn embed(&self, embedder: &dyn Embedder, text: &str) -> Result<Vec<f32>> {
        let key = content_hash(text);
        {
            let inner = self.inner.lock().unwrap();
            if let Some(hit) = inner.map.get(&key) {
                return Ok(hit.clone());
            }
        }
        let vector = embedder.embed(text)?;
        let mut inner = self.inner.lock().unwrap();
        if !inner.map.contains_key(&key) {
            inner.order.push_back(key.clone());
            inner.map.insert(key, vector.clone());
            while inner.order.len() > EMBED_CACHE_SIZE {
                if let Some(evicted) = inner.order.pop_front() {
                    inner.map.remove(&evicted);
                }
            }
        }
        Ok(vector)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_hash_embedder_is_deterministic() {
        let a = HashEmbedder.embed("Turbopump delivery delayed").unwrap();
        let b = HashEmbedder.embed("Turbopump delivery delayed").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), EMBEDDING_DIM);
    }

    #[test]
    fn test_shared_tokens_raise_similarity() {
        let e = HashEmbedder;
        let content = e.embed("Turbopump delivery delayed this week").unwrap();
        let matching = e.embed("Turbopump Turbopump projects rocket engine").unwrap();
        let unrelated = e.embed("gardening compost watering schedule").unwrap();
        assert!(cosine_similarity(&content, &matching) > 0.3);
        assert!(
            cosine_similarity(&content, &matching) > cosine_similarity(&content, &unrelated)
        );
    }

    #[test]
    fn test_cosine_edge_cases() {
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[0.0, 0.0]), 0.0);
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
    }

    struct CountingEmbedder(AtomicUsize);

    impl Embedder for CountingEmbedder {
        fn embed(&self, _text: &str) -> Result<Vec<f32>> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(vec![1.0; EMBEDDING_DIM])
        }
    }

    #[test]
    fn test_embed_cache_hits() {
        let cache = EmbedCache::default();
        let backend = CountingEmbedder(AtomicUsize::new(0));
        cache.embed(&backend, "same text").unwrap();
        cache.embed(&backend, "same text").unwrap();
        cache.embed(&backend, "other text").unwrap();
        assert_eq!(backend.0.load(Ordering::SeqCst), 2);
    }
}
