//! Regex grammars matched end to end.

use std::sync::Arc;

use pie_grammar::{
    bitmask, regex::regex_to_ebnf, Error, GrammarCompiler, GrammarMatcher, MatcherOptions,
    Setting, TokenizerInfo, VocabType,
};

fn make_compiler(vocab: &[&str]) -> GrammarCompiler {
    let encoded: Vec<String> = vocab.iter().map(|s| s.to_string()).collect();
    let tok = TokenizerInfo::new(&encoded, VocabType::Raw, None, Setting::Set(vec![]), false).unwrap();
    GrammarCompiler::new(Arc::new(tok), 1, true, None)
}

fn is_regex_accept_string(pattern: &str, input: &str) -> bool {
    let compiled = make_compiler(&["dummy"]).compile_regex(pattern).unwrap();
    let mut m = GrammarMatcher::new(compiled, MatcherOptions::default());
    if !input.is_empty() && !m.accept_string(input) {
        return false;
    }
    m.can_terminate()
}

#[test]
fn test_literal_and_classes() {
    assert!(is_regex_accept_string("abc", "abc"));
    assert!(!is_regex_accept_string("abc", "ab"));
    assert!(is_regex_accept_string("[a-c]+x", "abcax"));
    assert!(!is_regex_accept_string("[a-c]+x", "x"));
    assert!(is_regex_accept_string("[^0-9]+", "héllo"));
    assert!(!is_regex_accept_string("[^0-9]+", "h3"));
}

#[test]
fn test_escapes() {
    assert!(is_regex_accept_string(r"\d{3}-\d{4}", "555-1234"));
    assert!(!is_regex_accept_string(r"\d{3}-\d{4}", "55-1234"));
    assert!(is_regex_accept_string(r"\w+\s\w+", "hello world"));
    assert!(is_regex_accept_string(r"a\.b", "a.b"));
    assert!(!is_regex_accept_string(r"a\.b", "axb"));
}

#[test]
fn test_alternation_and_groups() {
    let pattern = "(cat|dog)s?( and (cat|dog)s?)*";
    assert!(is_regex_accept_string(pattern, "cats"));
    assert!(is_regex_accept_string(pattern, "dog and cats and dog"));
    assert!(!is_regex_accept_string(pattern, "cats and"));
    assert!(!is_regex_accept_string(pattern, "cow"));
}

#[test]
fn test_bounded_repetition() {
    assert!(!is_regex_accept_string("x{2,3}", "x"));
    assert!(is_regex_accept_string("x{2,3}", "xx"));
    assert!(is_regex_accept_string("x{2,3}", "xxx"));
    assert!(!is_regex_accept_string("x{2,3}", "xxxx"));
    assert!(is_regex_accept_string("(ab){2}", "abab"));
}

#[test]
fn test_dot_excludes_newline() {
    assert!(is_regex_accept_string("a.c", "a😀c"));
    assert!(!is_regex_accept_string("a.c", "a\nc"));
}

#[test]
fn test_empty_pattern() {
    assert!(is_regex_accept_string("", ""));
    assert!(!is_regex_accept_string("", "a"));
}

#[test]
fn test_email_like_pattern() {
    let pattern = r"[a-z0-9._]+@[a-z0-9]+\.(com|org)";
    assert!(is_regex_accept_string(pattern, "john.doe@example.com"));
    assert!(!is_regex_accept_string(pattern, "john@example.net"));
    assert!(!is_regex_accept_string(pattern, "@example.com"));
}

#[test]
fn test_regex_bitmask() {
    let vocab = ["1", "12", "123", "a", "-", "1-"];
    let compiled = make_compiler(&vocab).compile_regex(r"\d+(-\d+)?").unwrap();
    let mut m = GrammarMatcher::new(compiled, MatcherOptions::default());
    let mut bm = vec![0u32; bitmask::get_bitmask_size(vocab.len())];

    m.fill_next_token_bitmask(&mut bm, 0);
    let allowed: Vec<usize> = (0..vocab.len()).filter(|&i| bitmask::get_bit(&bm, i)).collect();
    assert_eq!(allowed, vec![0, 1, 2, 5]);

    assert!(m.accept_token(5));
    m.fill_next_token_bitmask(&mut bm, 0);
    let allowed: Vec<usize> = (0..vocab.len()).filter(|&i| bitmask::get_bit(&bm, i)).collect();
    assert_eq!(allowed, vec![0, 1, 2]);
}

#[test]
fn test_regex_to_ebnf_text() {
    assert_eq!(regex_to_ebnf("ab+").unwrap(), "root ::= \"a\" \"b\"+\n");
}

#[test]
fn test_unsupported_regex() {
    let compiler = make_compiler(&["dummy"]);
    for pattern in ["(ab", "(?=a)", r"\bx", "a**"] {
        assert!(
            matches!(compiler.compile_regex(pattern), Err(Error::GrammarSyntax(_))),
            "{pattern}"
        );
    }
}
