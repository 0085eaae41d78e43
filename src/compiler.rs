//! Grammar compiler with a shared, size-bounded cache.
//!
//! Every `compile_*` entry point converts its input to a [`Grammar`], then
//! compiles it on the compiler's own rayon pool. Results are cached by a
//! (kind, source) key in an LRU bounded by the compiled grammars' memory
//! footprint. Concurrent requests for the same key are coalesced: one
//! thread compiles, the others wait for it.

use std::num::NonZeroUsize;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use lru::LruCache;
use rustc_hash::FxHashSet;

use crate::compiled_grammar::CompiledGrammar;
use crate::grammar::Grammar;
use crate::json_schema::JsonSchemaOptions;
use crate::tokenizer::TokenizerInfo;

/// What produced the cache key's source text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum SourceKind {
    Grammar,
    JsonSchema,
    BuiltinJson,
    Regex,
    StructuralTag,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    kind: SourceKind,
    source: String,
}

struct CacheEntry {
    compiled: Arc<CompiledGrammar>,
    size: usize,
}

struct CacheState {
    entries: LruCache<CacheKey, CacheEntry>,
    used_bytes: usize,
    /// Keys currently being compiled by some thread.
    in_flight: FxHashSet<CacheKey>,
    /// Bumped by `clear_cache`; compilations started under an older
    /// generation do not populate the cache.
    generation: u64,
}

/// Compiles grammars against one tokenizer and caches the results.
///
/// `Send + Sync`; share it behind an `Arc` across request threads.
pub struct GrammarCompiler {
    tokenizer_info: Arc<TokenizerInfo>,
    /// `None` if the pool could not be built; compilation then runs on the
    /// global rayon pool.
    pool: Option<rayon::ThreadPool>,
    cache_enabled: bool,
    max_memory_bytes: Option<usize>,
    state: Mutex<CacheState>,
    in_flight_done: Condvar,
}

impl GrammarCompiler {
    /// - `max_threads`: worker threads used for token-mask pre-computation.
    /// - `cache_enabled`: when false, every call compiles from scratch.
    /// - `max_memory_bytes`: cache budget; `None` is unlimited. The budget is
    ///   soft: a single grammar larger than it is still cached.
    pub fn new(
        tokenizer_info: Arc<TokenizerInfo>,
        max_threads: usize,
        cache_enabled: bool,
        max_memory_bytes: Option<usize>,
    ) -> Self {
        let threads = NonZeroUsize::new(max_threads).map_or(1, NonZeroUsize::get);
        let pool = match rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("grammar-compiler-{i}"))
            .build()
        {
            Ok(pool) => Some(pool),
            Err(err) => {
                tracing::warn!(%err, threads, "failed to build compiler thread pool, using the global pool");
                None
            }
        };

        Self {
            tokenizer_info,
            pool,
            cache_enabled,
            max_memory_bytes,
            state: Mutex::new(CacheState {
                entries: LruCache::unbounded(),
                used_bytes: 0,
                in_flight: FxHashSet::default(),
                generation: 0,
            }),
            in_flight_done: Condvar::new(),
        }
    }

    pub fn tokenizer_info(&self) -> Arc<TokenizerInfo> {
        Arc::clone(&self.tokenizer_info)
    }

    /// Compile an already-built grammar. Cached by its EBNF text.
    pub fn compile_grammar(&self, grammar: &Grammar) -> crate::Result<Arc<CompiledGrammar>> {
        let key = CacheKey {
            kind: SourceKind::Grammar,
            source: grammar.to_string(),
        };
        self.get_or_compile(key, || Ok(grammar.clone()))
    }

    /// Convert a JSON Schema and compile it. Conversion errors are returned
    /// before any compilation work.
    pub fn compile_json_schema(
        &self,
        schema: &str,
        options: &JsonSchemaOptions,
    ) -> crate::Result<Arc<CompiledGrammar>> {
        let key = CacheKey {
            kind: SourceKind::JsonSchema,
            source: format!("{options:?}\n{schema}"),
        };
        self.get_or_compile(key, || Grammar::from_json_schema(schema, options))
    }

    pub fn compile_builtin_json_grammar(&self) -> crate::Result<Arc<CompiledGrammar>> {
        let key = CacheKey {
            kind: SourceKind::BuiltinJson,
            source: String::new(),
        };
        self.get_or_compile(key, || Ok(Grammar::builtin_json_grammar()))
    }

    pub fn compile_regex(&self, pattern: &str) -> crate::Result<Arc<CompiledGrammar>> {
        let key = CacheKey {
            kind: SourceKind::Regex,
            source: pattern.to_string(),
        };
        self.get_or_compile(key, || Grammar::from_regex(pattern))
    }

    pub fn compile_structural_tag(&self, json: &str) -> crate::Result<Arc<CompiledGrammar>> {
        let key = CacheKey {
            kind: SourceKind::StructuralTag,
            source: json.to_string(),
        };
        self.get_or_compile(key, || Grammar::from_structural_tag(json))
    }

    /// Total memory footprint of the cached compiled grammars.
    pub fn cache_size_bytes(&self) -> usize {
        self.lock_state().used_bytes
    }

    /// The cache budget; `None` is unlimited.
    pub fn cache_limit_bytes(&self) -> Option<usize> {
        self.max_memory_bytes
    }

    /// Drop every cached grammar. Compilations already running finish but
    /// their results are not cached.
    pub fn clear_cache(&self) {
        let mut state = self.lock_state();
        state.entries.clear();
        state.used_bytes = 0;
        state.generation += 1;
        tracing::debug!(generation = state.generation, "grammar cache cleared");
    }

    fn lock_state(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Run the expensive part on the compiler's pool.
    fn compile_now(&self, grammar: Grammar) -> crate::Result<Arc<CompiledGrammar>> {
        let grammar = Arc::new(grammar);
        let tokenizer_info = Arc::clone(&self.tokenizer_info);
        let compiled = match &self.pool {
            Some(pool) => pool.install(|| CompiledGrammar::new(grammar, tokenizer_info)),
            None => CompiledGrammar::new(grammar, tokenizer_info),
        }?;
        Ok(Arc::new(compiled))
    }

    fn get_or_compile(
        &self,
        key: CacheKey,
        build: impl FnOnce() -> crate::Result<Grammar>,
    ) -> crate::Result<Arc<CompiledGrammar>> {
        if !self.cache_enabled {
            return self.compile_now(build()?);
        }

        let mut state = self.lock_state();
        loop {
            if let Some(entry) = state.entries.get(&key) {
                tracing::debug!(kind = ?key.kind, "grammar cache hit");
                return Ok(Arc::clone(&entry.compiled));
            }
            if !state.in_flight.contains(&key) {
                break;
            }
            state = self
                .in_flight_done
                .wait(state)
                .unwrap_or_else(|e| e.into_inner());
        }
        state.in_flight.insert(key.clone());
        let generation = state.generation;
        drop(state);

        // Releases the in-flight slot even if compilation panics.
        let guard = InFlightGuard { compiler: self, key: &key };
        let result = build().and_then(|grammar| self.compile_now(grammar));

        if let Ok(compiled) = &result {
            let mut state = self.lock_state();
            if state.generation == generation {
                self.insert(&mut state, key.clone(), Arc::clone(compiled));
            } else {
                tracing::debug!(kind = ?key.kind, "cache cleared during compilation, result not cached");
            }
        }
        drop(guard);
        result
    }

    /// Insert with LRU eviction down to the budget.
    fn insert(&self, state: &mut CacheState, key: CacheKey, compiled: Arc<CompiledGrammar>) {
        let size = compiled.memory_size_bytes();
        if let Some(limit) = self.max_memory_bytes {
            while state.used_bytes + size > limit {
                let Some((evicted, entry)) = state.entries.pop_lru() else {
                    break;
                };
                state.used_bytes -= entry.size;
                tracing::debug!(kind = ?evicted.kind, bytes = entry.size, "evicted compiled grammar");
            }
            if size > limit {
                tracing::warn!(size, limit, "compiled grammar is larger than the cache limit, caching it anyway");
            }
        }
        if let Some(old) = state.entries.put(key, CacheEntry { compiled, size }) {
            state.used_bytes -= old.size;
        }
        state.used_bytes += size;
    }
}

struct InFlightGuard<'a> {
    compiler: &'a GrammarCompiler,
    key: &'a CacheKey,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.compiler.lock_state().in_flight.remove(self.key);
        self.compiler.in_flight_done.notify_all();
    }
}
