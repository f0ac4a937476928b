//! Grammar constraint lifecycle: build, cache, and retire the canonical
//! compiled grammar across conversation turns.
//!
//! The cache owns at most one canonical compiled handle. Per-turn sampler
//! chains never receive the canonical instance itself; the engine clones it
//! into each chain, and the chain frees the clone on drop. The cache is
//! generic over the handle type so the build policy can be exercised with a
//! fake compiler in tests.

use ingot_grammar::{extract_tool_names, generic_tool_grammar, parse_tools, typed_tool_grammar};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Grammar activation mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GrammarMode {
    /// Constraint active from the first sampled token; forces JSON output.
    Strict,
    /// Constraint dormant until the `{` trigger appears; the model may
    /// produce free text instead.
    Lazy,
}

impl GrammarMode {
    /// The mode tried when compilation in this mode fails.
    pub fn alternate(self) -> Self {
        match self {
            GrammarMode::Strict => GrammarMode::Lazy,
            GrammarMode::Lazy => GrammarMode::Strict,
        }
    }

    /// Lowercase name for logs.
    pub fn as_str(self) -> &'static str {
        match self {
            GrammarMode::Strict => "strict",
            GrammarMode::Lazy => "lazy",
        }
    }
}

/// Trigger pattern supplied to lazy grammar compilation.
pub const LAZY_TRIGGER_PATTERN: &str = "\\{";

/// Canonical-grammar cache keyed on the raw catalog text.
#[derive(Debug)]
pub struct GrammarCache<G> {
    mode: GrammarMode,
    use_typed: bool,
    canonical: Option<G>,
    cached_catalog: String,
    dirty: bool,
}

impl<G> GrammarCache<G> {
    /// Create an empty cache with the given preferred mode.
    pub fn new(mode: GrammarMode, use_typed: bool) -> Self {
        Self {
            mode,
            use_typed,
            canonical: None,
            cached_catalog: String::new(),
            dirty: true,
        }
    }

    /// Preferred activation mode.
    pub fn mode(&self) -> GrammarMode {
        self.mode
    }

    /// The canonical compiled grammar, when the last build succeeded.
    pub fn canonical(&self) -> Option<&G> {
        self.canonical.as_ref()
    }

    /// Mutable access for resetting the canonical grammar's streaming state
    /// between turns.
    pub fn canonical_mut(&mut self) -> Option<&mut G> {
        self.canonical.as_mut()
    }

    /// Force a rebuild on the next [`GrammarCache::update_if_needed`].
    pub fn invalidate(&mut self) {
        self.dirty = true;
    }

    /// Drop the canonical grammar and forget the cached catalog (tool
    /// calling disabled or catalog retired).
    pub fn clear(&mut self) {
        self.canonical = None;
        self.cached_catalog.clear();
        self.dirty = true;
    }

    /// Rebuild the canonical grammar iff the catalog text changed or
    /// [`GrammarCache::invalidate`] was called.
    ///
    /// Build policy: typed grammar first (unless disabled), generic
    /// fallback second, each tried in the preferred mode and then in the
    /// alternate mode. The catalog text is cached even when every attempt
    /// fails, so a bad catalog does not trigger a retry storm; tool calling
    /// then continues without constraints and the stream detector alone
    /// recognizes calls.
    pub fn update_if_needed<F>(&mut self, catalog: &str, mut compile: F)
    where
        F: FnMut(&str, GrammarMode) -> Option<G>,
    {
        if !self.dirty && catalog == self.cached_catalog {
            if self.canonical.is_some() {
                debug!("reusing cached grammar constraint");
            }
            return;
        }

        info!(mode = self.mode.as_str(), typed = self.use_typed, "building grammar constraint");
        self.canonical = None;

        let typed = if self.use_typed {
            typed_tool_grammar(&parse_tools(catalog))
        } else {
            String::new()
        };
        let generic = generic_tool_grammar(&extract_tool_names(catalog));

        let attempts = [
            (&typed, self.mode, "typed"),
            (&generic, self.mode, "generic"),
            (&typed, self.mode.alternate(), "typed"),
            (&generic, self.mode.alternate(), "generic"),
        ];
        for (grammar, mode, kind) in attempts {
            if grammar.is_empty() {
                continue;
            }
            if let Some(handle) = compile(grammar, mode) {
                info!(kind, mode = mode.as_str(), "grammar constraint compiled");
                self.canonical = Some(handle);
                break;
            }
            debug!(kind, mode = mode.as_str(), "grammar compilation attempt failed");
        }

        self.cached_catalog = catalog.to_string();
        self.dirty = false;

        if self.canonical.is_none() {
            warn!("all grammar attempts failed - tool calling continues without constraints");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    const CATALOG: &str = r#"[{"type":"function","function":{"name":"t","parameters":{"type":"object","properties":{"q":{"type":"string"}},"required":["q"]}}}]"#;

    #[test]
    fn builds_typed_in_preferred_mode_first() {
        let mut cache: GrammarCache<String> = GrammarCache::new(GrammarMode::Strict, true);
        let attempts = RefCell::new(Vec::new());
        cache.update_if_needed(CATALOG, |g, mode| {
            attempts.borrow_mut().push((g.to_string(), mode));
            Some(g.to_string())
        });

        let attempts = attempts.into_inner();
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].1, GrammarMode::Strict);
        // Typed grammars carry per-tool call rules.
        assert!(attempts[0].0.contains("call-0"));
        assert!(cache.canonical().is_some());
    }

    #[test]
    fn falls_back_generic_then_alternate_mode() {
        let mut cache: GrammarCache<u32> = GrammarCache::new(GrammarMode::Lazy, true);
        let attempts = RefCell::new(Vec::new());
        cache.update_if_needed(CATALOG, |g, mode| {
            let is_typed = g.contains("call-0");
            attempts.borrow_mut().push((is_typed, mode));
            // Only generic + strict compiles.
            (!is_typed && mode == GrammarMode::Strict).then_some(7)
        });

        let attempts = attempts.into_inner();
        assert_eq!(
            attempts,
            vec![
                (true, GrammarMode::Lazy),
                (false, GrammarMode::Lazy),
                (true, GrammarMode::Strict),
                (false, GrammarMode::Strict),
            ]
        );
        assert_eq!(cache.canonical(), Some(&7));
    }

    #[test]
    fn update_is_noop_for_identical_catalog() {
        let mut cache: GrammarCache<u32> = GrammarCache::new(GrammarMode::Strict, true);
        let calls = RefCell::new(0);
        let mut run = |cache: &mut GrammarCache<u32>, catalog: &str| {
            cache.update_if_needed(catalog, |_, _| {
                *calls.borrow_mut() += 1;
                Some(1)
            });
        };

        run(&mut cache, CATALOG);
        let after_first = *calls.borrow();
        run(&mut cache, CATALOG);
        assert_eq!(*calls.borrow(), after_first, "byte-identical catalog must not rebuild");

        // A changed catalog rebuilds.
        let other = CATALOG.replace('t', "u");
        run(&mut cache, &other);
        assert!(*calls.borrow() > after_first);
    }

    #[test]
    fn invalidate_forces_rebuild() {
        let mut cache: GrammarCache<u32> = GrammarCache::new(GrammarMode::Strict, true);
        let calls = RefCell::new(0);
        for _ in 0..2 {
            cache.update_if_needed(CATALOG, |_, _| {
                *calls.borrow_mut() += 1;
                Some(1)
            });
        }
        assert_eq!(*calls.borrow(), 1);

        cache.invalidate();
        cache.update_if_needed(CATALOG, |_, _| {
            *calls.borrow_mut() += 1;
            Some(1)
        });
        assert_eq!(*calls.borrow(), 2);
    }

    #[test]
    fn failure_is_cached_to_avoid_retry_storms() {
        let mut cache: GrammarCache<u32> = GrammarCache::new(GrammarMode::Strict, true);
        let calls = RefCell::new(0);
        for _ in 0..3 {
            cache.update_if_needed(CATALOG, |_, _| {
                *calls.borrow_mut() += 1;
                None
            });
        }
        // Four attempts (typed/generic x strict/lazy) exactly once.
        assert_eq!(*calls.borrow(), 4);
        assert!(cache.canonical().is_none());
    }

    #[test]
    fn clear_retires_the_canonical_grammar() {
        let mut cache: GrammarCache<u32> = GrammarCache::new(GrammarMode::Strict, true);
        cache.update_if_needed(CATALOG, |_, _| Some(1));
        assert!(cache.canonical().is_some());

        cache.clear();
        assert!(cache.canonical().is_none());

        // After clear, the same catalog builds again.
        let calls = RefCell::new(0);
        cache.update_if_needed(CATALOG, |_, _| {
            *calls.borrow_mut() += 1;
            Some(1)
        });
        assert_eq!(*calls.borrow(), 1);
    }

    #[test]
    fn untyped_cache_skips_typed_attempts() {
        let mut cache: GrammarCache<u32> = GrammarCache::new(GrammarMode::Strict, false);
        let attempts = RefCell::new(Vec::new());
        cache.update_if_needed(CATALOG, |g, mode| {
            attempts.borrow_mut().push((g.contains("call-0"), mode));
            None
        });
        let attempts = attempts.into_inner();
        assert_eq!(
            attempts,
            vec![(false, GrammarMode::Strict), (false, GrammarMode::Lazy)]
        );
    }
}
