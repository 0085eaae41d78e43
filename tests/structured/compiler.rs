//! GrammarCompiler caching and sharing across threads.

use std::sync::Arc;

use pie_grammar::{
    get_max_recursion_depth, set_max_recursion_depth, Grammar, GrammarCompiler, GrammarMatcher,
    JsonSchemaOptions, MatcherOptions, Setting, TokenizerInfo, VocabType,
};
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn make_compiler(cache_enabled: bool, limit: Option<usize>) -> GrammarCompiler {
    init_tracing();
    let vocab: Vec<String> = ["a", "b", "1", "{", "}", "\"", ":", " "]
        .iter()
        .map(|s| s.to_string())
        .collect();
    let tok = TokenizerInfo::new(&vocab, VocabType::Raw, None, Setting::Set(vec![]), false).unwrap();
    GrammarCompiler::new(Arc::new(tok), 4, cache_enabled, limit)
}

#[test]
fn test_every_entry_point_is_cached() {
    let c = make_compiler(true, None);
    let g = Grammar::from_ebnf("root ::= \"a\"+", "root").unwrap();
    let opts = JsonSchemaOptions::default();
    let tag = r#"{"triggers": ["<"], "tags": [{"begin": "<x>", "regex": "[ab]", "end": ">"}]}"#;

    let first = [
        c.compile_grammar(&g).unwrap(),
        c.compile_json_schema(r#"{"type": "boolean"}"#, &opts).unwrap(),
        c.compile_builtin_json_grammar().unwrap(),
        c.compile_regex("a|b").unwrap(),
        c.compile_structural_tag(tag).unwrap(),
    ];
    let size = c.cache_size_bytes();
    assert_eq!(size, first.iter().map(|cg| cg.memory_size_bytes()).sum::<usize>());

    let second = [
        c.compile_grammar(&g).unwrap(),
        c.compile_json_schema(r#"{"type": "boolean"}"#, &opts).unwrap(),
        c.compile_builtin_json_grammar().unwrap(),
        c.compile_regex("a|b").unwrap(),
        c.compile_structural_tag(tag).unwrap(),
    ];
    for (a, b) in first.iter().zip(&second) {
        assert!(Arc::ptr_eq(a, b));
    }
    assert_eq!(c.cache_size_bytes(), size);
}

#[test]
fn test_reparsed_grammar_hits_the_cache() {
    let c = make_compiler(true, None);
    let g = Grammar::from_ebnf("root ::= ((\"a\" | \"b\") \"1\")+ (\"{\" \"}\")?", "root").unwrap();
    let reparsed = Grammar::from_ebnf(&g.to_string(), "root").unwrap();
    assert_eq!(reparsed.to_string(), g.to_string());
    assert!(Arc::ptr_eq(
        &c.compile_grammar(&g).unwrap(),
        &c.compile_grammar(&reparsed).unwrap()
    ));
}

#[test]
fn test_schema_options_are_part_of_the_key() {
    let c = make_compiler(true, None);
    let schema = r#"{"type": "object", "properties": {"a": {"type": "integer"}}}"#;
    let loose = c.compile_json_schema(schema, &JsonSchemaOptions::default()).unwrap();
    let compact = JsonSchemaOptions {
        any_whitespace: false,
        ..JsonSchemaOptions::default()
    };
    let tight = c.compile_json_schema(schema, &compact).unwrap();
    assert!(!Arc::ptr_eq(&loose, &tight));
}

#[test]
fn test_cache_limit_evicts_least_recently_used() {
    let unbounded = make_compiler(true, None);
    let size = unbounded.compile_regex("a+").unwrap().memory_size_bytes();
    // Same shape, same footprint.
    assert_eq!(unbounded.compile_regex("b+").unwrap().memory_size_bytes(), size);
    assert_eq!(unbounded.compile_regex("1+").unwrap().memory_size_bytes(), size);

    let c = make_compiler(true, Some(2 * size));
    assert_eq!(c.cache_limit_bytes(), Some(2 * size));
    let a = c.compile_regex("a+").unwrap();
    let b = c.compile_regex("b+").unwrap();
    assert_eq!(c.cache_size_bytes(), 2 * size);

    // Touch "a+" so that "b+" is the eviction candidate.
    assert!(Arc::ptr_eq(&a, &c.compile_regex("a+").unwrap()));
    c.compile_regex("1+").unwrap();
    assert_eq!(c.cache_size_bytes(), 2 * size);
    assert!(Arc::ptr_eq(&a, &c.compile_regex("a+").unwrap()));
    assert!(!Arc::ptr_eq(&b, &c.compile_regex("b+").unwrap()));
}

#[test]
fn test_clear_cache_and_disabled_cache() {
    let c = make_compiler(true, None);
    c.compile_regex("ab").unwrap();
    assert!(c.cache_size_bytes() > 0);
    c.clear_cache();
    assert_eq!(c.cache_size_bytes(), 0);

    let d = make_compiler(false, Some(1));
    let x = d.compile_regex("ab").unwrap();
    let y = d.compile_regex("ab").unwrap();
    assert!(!Arc::ptr_eq(&x, &y));
    assert_eq!(d.cache_size_bytes(), 0);
}

#[test]
fn test_shared_across_threads() {
    let c = Arc::new(make_compiler(true, None));
    let patterns = ["a+", "b+", "(ab)+", "a+"];
    let compiled: Vec<_> = std::thread::scope(|s| {
        let handles: Vec<_> = (0..16)
            .map(|i| {
                let c = Arc::clone(&c);
                let pattern = patterns[i % patterns.len()];
                s.spawn(move || {
                    let cg = c.compile_regex(pattern).unwrap();
                    let mut m = GrammarMatcher::new(Arc::clone(&cg), MatcherOptions::default());
                    assert!(m.accept_string(&pattern.replace(&['(', ')', '+'][..], "")));
                    assert!(m.can_terminate());
                    (pattern, cg)
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    for (pattern, cg) in &compiled {
        let cached = c.compile_regex(pattern).unwrap();
        assert!(Arc::ptr_eq(cg, &cached), "{pattern}");
    }
}

#[test]
fn test_max_recursion_depth_setting() {
    let before = get_max_recursion_depth();
    // Setting the current value back is observable without disturbing
    // matchers built concurrently by other tests.
    set_max_recursion_depth(before);
    assert_eq!(get_max_recursion_depth(), before);

    let c = make_compiler(true, None);
    let g = Grammar::from_ebnf("root ::= \"{\" root \"}\" | \"1\"", "root").unwrap();
    let compiled = c.compile_grammar(&g).unwrap();
    let mut m = GrammarMatcher::new(Arc::clone(&compiled), options_with_depth(4));
    assert!(m.accept_string("{{1}}"));
    let mut m = GrammarMatcher::new(compiled, options_with_depth(4));
    assert!(!m.accept_string(&"{".repeat(20)));
}

fn options_with_depth(depth: usize) -> MatcherOptions {
    MatcherOptions {
        max_recursion_depth: Setting::Set(depth),
        ..MatcherOptions::default()
    }
}
