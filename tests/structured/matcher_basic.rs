//! Basic matcher operations: token acceptance, bitmask, rollback,
//! jump-forward, reset, termination.

use std::sync::Arc;

use pie_grammar::{
    bitmask, Grammar, GrammarCompiler, GrammarMatcher, MatcherOptions, Setting, TokenizerInfo,
    VocabType,
};

fn make_compiler(vocab: &[&str]) -> GrammarCompiler {
    let encoded: Vec<String> = vocab.iter().map(|s| s.to_string()).collect();
    let tok = TokenizerInfo::new(&encoded, VocabType::Raw, None, Setting::Set(vec![]), false).unwrap();
    GrammarCompiler::new(Arc::new(tok), 2, true, None)
}

fn make_matcher_with(ebnf: &str, vocab: &[&str], options: MatcherOptions) -> GrammarMatcher {
    let grammar = Grammar::from_ebnf(ebnf, "root").unwrap();
    let compiled = make_compiler(vocab).compile_grammar(&grammar).unwrap();
    GrammarMatcher::new(compiled, options)
}

/// Build a matcher with a given vocabulary.
fn make_matcher(ebnf: &str, vocab: &[&str]) -> GrammarMatcher {
    make_matcher_with(ebnf, vocab, MatcherOptions::default())
}

/// Build a matcher with explicit stop tokens.
fn make_matcher_with_stop(ebnf: &str, vocab: &[&str], stop_ids: Vec<u32>) -> GrammarMatcher {
    let options = MatcherOptions {
        override_stop_tokens: Setting::Set(stop_ids),
        ..MatcherOptions::default()
    };
    make_matcher_with(ebnf, vocab, options)
}

fn next_mask(m: &mut GrammarMatcher) -> Vec<u32> {
    let vocab_size = m.compiled_grammar().tokenizer_info().vocab_size();
    let mut bm = vec![0u32; bitmask::get_bitmask_size(vocab_size)];
    assert!(m.fill_next_token_bitmask(&mut bm, 0));
    bm
}

fn allowed(m: &mut GrammarMatcher) -> Vec<usize> {
    let vocab_size = m.compiled_grammar().tokenizer_info().vocab_size();
    let bm = next_mask(m);
    (0..vocab_size).filter(|&i| bitmask::get_bit(&bm, i)).collect()
}

// ---------------------------------------------------------------------------
// Token acceptance
// ---------------------------------------------------------------------------

#[test]
fn test_token_acceptance_sequence() {
    let mut m = make_matcher(r#"root ::= "hello" " " "world""#, &["hello", " ", "world", "x"]);
    assert!(m.accept_token(0));
    assert!(m.accept_token(1));
    assert!(m.accept_token(2));
    assert!(m.can_terminate());
}

#[test]
fn test_token_rejection_leaves_state() {
    let mut m = make_matcher(r#"root ::= "hello""#, &["hello", "world"]);
    assert!(!m.accept_token(1));
    assert!(m.accept_token(0));
    assert!(m.can_terminate());
}

#[test]
fn test_token_spanning_rules() {
    let ebnf = "root ::= key \"=\" value\nkey ::= [a-z]+\nvalue ::= [0-9]+";
    let mut m = make_matcher(ebnf, &["ab", "b=1", "=", "12", "=x"]);
    assert!(m.accept_token(0));
    assert!(!m.accept_token(4));
    assert!(m.accept_token(1));
    assert!(m.accept_token(3));
    assert!(m.can_terminate());
}

#[test]
fn test_out_of_range_token() {
    let mut m = make_matcher(r#"root ::= "a""#, &["a"]);
    assert!(!m.accept_token(7));
    assert!(m.accept_token(0));
}

// ---------------------------------------------------------------------------
// Bitmask generation
// ---------------------------------------------------------------------------

#[test]
fn test_bitmask_after_partial_accept() {
    let mut m = make_matcher(r#"root ::= "abc""#, &["a", "ab", "abc", "b", "bc", "c"]);
    assert_eq!(allowed(&mut m), vec![0, 1, 2]);
    assert!(m.accept_token(0));
    assert_eq!(allowed(&mut m), vec![3, 4]);
}

#[test]
fn test_bitmask_many_tokens() {
    let vocab = ["t", "tr", "true", "f", "fa", "false", "n", "nu", "null", "x", "truex"];
    let mut m = make_matcher(r#"root ::= "true" | "false" | "null""#, &vocab);
    assert_eq!(allowed(&mut m), (0..=8).collect::<Vec<_>>());
}

#[test]
fn test_bitmask_through_nested_rules() {
    let ebnf = r#"
root ::= "[" items "]"
items ::= item ("," item)*
item ::= [0-9]+ | "\"" [a-z]* "\""
"#;
    let vocab = ["[", "]", ",", "1", "12", "\"", "\"ab\"", "a", "1]", "[1,"];
    let mut m = make_matcher(ebnf, &vocab);
    assert_eq!(allowed(&mut m), vec![0, 9]);
    assert!(m.accept_token(0));
    assert_eq!(allowed(&mut m), vec![3, 4, 5, 6, 8]);
    assert!(m.accept_token(4));
    assert_eq!(allowed(&mut m), vec![1, 2, 3, 4, 8]);
}

#[test]
fn test_bitmask_equals_accept_token() {
    let ebnf = r#"
root ::= greeting " " name "!"?
greeting ::= "hi" | "hello"
name ::= [A-Z] [a-z]*
"#;
    let vocab = ["h", "hi", "hello", " ", " A", "Ann", "nn", "!", "hi B", "x", "ello B"];
    let mut m = make_matcher(ebnf, &vocab);
    for step in [1usize, 3, 5, 7] {
        let bm = next_mask(&mut m);
        for token in 0..vocab.len() {
            let accepted = m.accept_token(token as u32);
            assert_eq!(accepted, bitmask::get_bit(&bm, token), "token {token} at step {step}");
            if accepted {
                assert!(m.rollback(1));
            }
        }
        assert!(m.accept_token(step as u32));
    }
}

#[test]
fn test_bitmask_batch_rows() {
    let mut m = make_matcher(r#"root ::= "ab" | "cd""#, &["ab", "cd", "ef"]);
    let row_len = bitmask::get_bitmask_size(3);
    let mut buf = vec![u32::MAX; row_len * 2];
    assert!(m.fill_next_token_bitmask(&mut buf, 1));
    assert!(buf[..row_len].iter().all(|&w| w == u32::MAX));
    assert!(bitmask::get_bit(&buf[row_len..], 0));
    assert!(bitmask::get_bit(&buf[row_len..], 1));
    assert!(!bitmask::get_bit(&buf[row_len..], 2));
    assert!(!m.fill_next_token_bitmask(&mut buf, 2));
}

// ---------------------------------------------------------------------------
// Stop tokens and termination
// ---------------------------------------------------------------------------

#[test]
fn test_stop_tokens() {
    let mut m = make_matcher_with_stop(r#"root ::= "a" | "ab""#, &["a", "ab", "b", "<eos>"], vec![3]);
    assert_eq!(allowed(&mut m), vec![0, 1]);
    assert!(!m.accept_token(3));

    assert!(m.accept_token(0));
    assert_eq!(allowed(&mut m), vec![2, 3]);
    assert!(!m.is_terminated());
    assert!(m.accept_token(3));
    assert!(m.is_terminated());

    assert!(!m.accept_token(2));
    assert!(allowed(&mut m).is_empty());
}

#[test]
fn test_terminate_without_stop_token() {
    let options = MatcherOptions {
        terminate_without_stop_token: true,
        ..MatcherOptions::default()
    };
    let mut m = make_matcher_with(r#"root ::= "ab""#, &["a", "b"], options);
    assert!(!m.is_terminated());
    assert!(m.accept_token(0));
    assert!(m.accept_token(1));
    assert!(m.is_terminated());
}

#[test]
fn test_tokenizer_stop_tokens_are_defaults() {
    let encoded: Vec<String> = ["a", "</s>"].iter().map(|s| s.to_string()).collect();
    let tok = TokenizerInfo::new(&encoded, VocabType::Raw, None, Setting::Set(vec![1]), false).unwrap();
    let compiler = GrammarCompiler::new(Arc::new(tok), 1, true, None);
    let compiled = compiler.compile_regex("a+").unwrap();
    let mut m = GrammarMatcher::new(compiled, MatcherOptions::default());
    assert_eq!(m.stop_token_ids(), &[1]);
    assert!(m.accept_token(0));
    assert!(m.accept_token(1));
    assert!(m.is_terminated());
}

/// An override stop token that the tokenizer treats as ordinary text is only
/// allowed where the grammar can end.
#[test]
fn test_override_stop_token_that_is_also_text() {
    let mut m = make_matcher_with_stop(r#"root ::= [a-z<>]+ "!""#, &["a", "<eos>", "!"], vec![1]);
    assert_eq!(allowed(&mut m), vec![0]);
    assert!(!m.accept_token(1));

    assert!(m.accept_token(0));
    assert_eq!(allowed(&mut m), vec![0, 2]);
    assert!(!m.accept_token(1));

    assert!(m.accept_token(2));
    assert_eq!(allowed(&mut m), vec![1]);
    assert!(m.accept_token(1));
    assert!(m.is_terminated());
}

// ---------------------------------------------------------------------------
// Rollback
// ---------------------------------------------------------------------------

/// Accepting tokens then rolling back `k` must leave the matcher exactly
/// where it was after the first `n - k` tokens.
#[test]
fn test_rollback_restores_masks() {
    let vocab = ["{", "}", "\"a\"", ":", "1", " ", ",", "[", "]"];
    let compiled = make_compiler(&vocab).compile_builtin_json_grammar().unwrap();
    let tokens = [7u32, 4, 6, 5, 0, 2, 3, 4, 1, 8];

    let mut m = GrammarMatcher::new(Arc::clone(&compiled), MatcherOptions::default());
    let mut snapshots = vec![(next_mask(&mut m), m.can_terminate())];
    for &t in &tokens {
        assert!(m.accept_token(t), "token {t}");
        snapshots.push((next_mask(&mut m), m.can_terminate()));
    }
    assert!(m.can_terminate());

    for k in 1..=tokens.len() {
        let mut m = GrammarMatcher::new(Arc::clone(&compiled), MatcherOptions::default());
        for &t in &tokens {
            assert!(m.accept_token(t));
        }
        assert!(m.rollback(k));
        let expected = &snapshots[tokens.len() - k];
        assert_eq!(&(next_mask(&mut m), m.can_terminate()), expected, "rollback {k}");
        // The remaining tokens are accepted again.
        for &t in &tokens[tokens.len() - k..] {
            assert!(m.accept_token(t));
        }
        assert!(m.can_terminate());
    }
}

#[test]
fn test_rollback_stop_token() {
    let mut m = make_matcher_with_stop(r#"root ::= "a"+"#, &["a", "<eos>"], vec![1]);
    assert!(m.accept_token(0));
    assert!(m.accept_token(1));
    assert!(m.is_terminated());
    assert!(m.rollback(1));
    assert!(!m.is_terminated());
    assert!(m.accept_token(0));
}

#[test]
fn test_rollback_limits() {
    let options = MatcherOptions {
        max_rollback_tokens: 2,
        ..MatcherOptions::default()
    };
    let mut m = make_matcher_with("root ::= [a-z]*", &["a", "b", "c"], options);
    for t in 0..3 {
        assert!(m.accept_token(t));
    }
    assert!(!m.rollback(3));
    assert!(m.rollback(2));
    assert!(!m.rollback(1));
    assert_eq!(allowed(&mut m), vec![0, 1, 2]);
}

// ---------------------------------------------------------------------------
// Jump forward, reset, recursion
// ---------------------------------------------------------------------------

#[test]
fn test_jump_forward_string() {
    let mut m = make_matcher(r#"root ::= "hello" " world" [0-9]"#, &["he", "x"]);
    assert_eq!(m.find_jump_forward_string(), "hello world");
    assert!(m.accept_token(0));
    assert_eq!(m.find_jump_forward_string(), "llo world");
    // Querying does not advance the matcher.
    assert_eq!(m.find_jump_forward_string(), "llo world");
    assert!(m.accept_string("llo world5"));
    assert_eq!(m.find_jump_forward_string(), "");
}

#[test]
fn test_jump_forward_through_rules() {
    let ebnf = "root ::= \"<\" tag \">\" tag\ntag ::= \"name\" [0-9]";
    let mut m = make_matcher(ebnf, &["<"]);
    assert_eq!(m.find_jump_forward_string(), "<name");
    assert!(m.accept_string("<name1"));
    assert_eq!(m.find_jump_forward_string(), ">name");
}

#[test]
fn test_reset() {
    let mut m = make_matcher_with_stop(r#"root ::= "ab""#, &["a", "b", "<eos>"], vec![2]);
    let initial = allowed(&mut m);
    assert!(m.accept_token(0));
    assert!(m.accept_token(1));
    assert!(m.accept_token(2));
    m.reset();
    assert!(!m.is_terminated());
    assert_eq!(allowed(&mut m), initial);
    assert!(!m.rollback(1));
}

#[test]
fn test_recursion_depth_option() {
    let ebnf = "root ::= \"(\" root \")\" | \"x\"";
    let deep = format!("{}x{}", "(".repeat(40), ")".repeat(40));

    let mut m = make_matcher(ebnf, &["("]);
    assert!(m.accept_string(&deep));
    assert!(m.can_terminate());

    let options = MatcherOptions {
        max_recursion_depth: Setting::Set(3),
        ..MatcherOptions::default()
    };
    let mut m = make_matcher_with(ebnf, &["("], options);
    assert!(m.accept_string("((x))"));
    m.reset();
    assert!(!m.accept_string(&deep));
}
