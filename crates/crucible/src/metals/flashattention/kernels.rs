//! Process-wide cache of generated kernel source, keyed by variant.
//!
//! Emission is deterministic, so the first request per cache key pays the
//! string build and everyone after shares the `Arc`. Setting
//! `CRUCIBLE_DUMP_METAL_SOURCE_DIR` writes each freshly emitted source to
//! disk for offline inspection.

use std::{
    fs,
    path::Path,
    sync::{Arc, Mutex, OnceLock},
};

use rustc_hash::FxHashMap;

use crate::metals::flashattention::{stages::FlashAttentionStage, variants::FlashVariant};

static SOURCE_CACHE: OnceLock<Mutex<FxHashMap<String, Arc<str>>>> = OnceLock::new();

/// Metal source for the given specialization, emitted once per process.
pub fn kernel_source(variant: FlashVariant) -> Arc<str> {
    let cache = SOURCE_CACHE.get_or_init(|| Mutex::new(FxHashMap::default()));
    let key = variant.cache_key();
    let mut map = cache.lock().expect("kernel source cache mutex poisoned");
    if let Some(source) = map.get(&key) {
        return Arc::clone(source);
    }
    let source: Arc<str> = FlashAttentionStage::new(variant).emit_source().into();
    dump_source(&key, &source);
    map.insert(key, Arc::clone(&source));
    source
}

fn dump_source(key: &str, source: &str) {
    let dir = match crucible_env::DUMP_METAL_SOURCE_DIR.get() {
        Ok(Some(dir)) => dir,
        Ok(None) => return,
        Err(err) => {
            tracing::warn!(%err, "ignoring invalid source dump directory");
            return;
        }
    };
    let path = Path::new(&dir).join(format!("{key}.metal"));
    if let Err(err) = fs::write(&path, source) {
        tracing::warn!(path = %path.display(), %err, "failed to dump generated kernel source");
    }
}
