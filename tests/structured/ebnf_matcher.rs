//! EBNF grammar acceptance/rejection via the GrammarMatcher.

use std::sync::Arc;

use pie_grammar::{
    CompiledGrammar, Grammar, GrammarCompiler, GrammarMatcher, MatcherOptions, Setting,
    TokenizerInfo, VocabType,
};

fn compiler() -> GrammarCompiler {
    let vocab: Vec<String> = vec!["dummy".into()];
    let tok = TokenizerInfo::new(&vocab, VocabType::Raw, None, Setting::Set(vec![]), false).unwrap();
    GrammarCompiler::new(Arc::new(tok), 1, false, None)
}

fn accepts(compiled: Arc<CompiledGrammar>, input: &str) -> bool {
    let mut m = GrammarMatcher::new(compiled, MatcherOptions::default());
    if !input.is_empty() && !m.accept_string(input) {
        return false;
    }
    m.can_terminate()
}

/// Does the grammar accept the whole string?
fn is_grammar_accept_string(grammar_ebnf: &str, input: &str) -> bool {
    let grammar = Grammar::from_ebnf(grammar_ebnf, "root").unwrap();
    is_grammar_accept_string_g(&grammar, input)
}

fn is_grammar_accept_string_g(grammar: &Grammar, input: &str) -> bool {
    accepts(compiler().compile_grammar(grammar).unwrap(), input)
}

const JSON_GRAMMAR: &str = r#"
root ::= value
value ::= object | array | string | number | "true" | "false" | "null"
object ::= "{" ws (pair ("," ws pair)*)? ws "}"
pair ::= ws string ws ":" ws value
array ::= "[" ws (value ("," ws value)*)? ws "]"
string ::= "\"" char* "\""
char ::= [^"\\] | "\\" escape
escape ::= "\"" | "\\" | "/" | "b" | "f" | "n" | "r" | "t" | "u" [0-9a-fA-F] [0-9a-fA-F] [0-9a-fA-F] [0-9a-fA-F]
number ::= integer fraction? exponent?
integer ::= "-"? ("0" | [1-9] [0-9]*)
fraction ::= "." [0-9]+
exponent ::= [eE] [+-]? [0-9]+
ws ::= [ \t\n\r]*
"#;

#[test]
fn test_json_accepted() {
    for input in [
        r#"{"name": "John", "age": 30}"#,
        r#"[1, 2.5, -3e10, true, false, null]"#,
        r#"{"nested": {"list": [{"a": "é\n"}]}}"#,
        r#""just a string""#,
        "0",
        "{}",
        "[ ]",
    ] {
        assert!(is_grammar_accept_string(JSON_GRAMMAR, input), "{input}");
    }
}

#[test]
fn test_json_rejected() {
    for input in [
        r#"{"name": "John""#,
        r#"{name: 1}"#,
        "01",
        "[1,]",
        r#""unterminated"#,
        "tru",
        "",
    ] {
        assert!(!is_grammar_accept_string(JSON_GRAMMAR, input), "{input}");
    }
}

#[test]
fn test_repetition_bounds() {
    let g = "root ::= \"a\"{2,4}";
    assert!(!is_grammar_accept_string(g, "a"));
    assert!(is_grammar_accept_string(g, "aa"));
    assert!(is_grammar_accept_string(g, "aaaa"));
    assert!(!is_grammar_accept_string(g, "aaaaa"));

    let g = "root ::= [0-9]{3} \"-\" [0-9]{2,}";
    assert!(is_grammar_accept_string(g, "123-45"));
    assert!(is_grammar_accept_string(g, "123-456789"));
    assert!(!is_grammar_accept_string(g, "12-45"));
    assert!(!is_grammar_accept_string(g, "123-4"));
}

#[test]
fn test_optional_and_star() {
    let g = r#"root ::= "a"? "b"* "c"+"#;
    assert!(is_grammar_accept_string(g, "c"));
    assert!(is_grammar_accept_string(g, "abbccc"));
    assert!(is_grammar_accept_string(g, "bc"));
    assert!(!is_grammar_accept_string(g, "aab"));
    assert!(!is_grammar_accept_string(g, "ab"));
}

#[test]
fn test_nullable_rules() {
    let g = r#"
root ::= a b "x"
a ::= "" | "a"
b ::= c*
c ::= "c"
"#;
    assert!(is_grammar_accept_string(g, "x"));
    assert!(is_grammar_accept_string(g, "acx"));
    assert!(is_grammar_accept_string(g, "cccx"));
    assert!(!is_grammar_accept_string(g, "cax"));
}

#[test]
fn test_recursive_rules() {
    let right = "root ::= \"a\" root | \"b\"";
    assert!(is_grammar_accept_string(right, "aaab"));
    assert!(!is_grammar_accept_string(right, "aaa"));

    let balanced = "root ::= \"(\" root \")\" root | \"\"";
    assert!(is_grammar_accept_string(balanced, ""));
    assert!(is_grammar_accept_string(balanced, "(()())()"));
    assert!(!is_grammar_accept_string(balanced, "(()"));
    assert!(!is_grammar_accept_string(balanced, "())"));
}

#[test]
fn test_utf8_char_classes() {
    let g = "root ::= [\u{4e00}-\u{9fff}]+ [!]";
    assert!(is_grammar_accept_string(g, "中文!"));
    assert!(!is_grammar_accept_string(g, "abc!"));

    let g = "root ::= [^a]*";
    assert!(is_grammar_accept_string(g, "héllo😀"));
    assert!(!is_grammar_accept_string(g, "bab"));
}

#[test]
fn test_lookahead_does_not_restrict_language() {
    let g = "root ::= item \";\"\nitem ::= [a-z]+ (=\";\")";
    assert!(is_grammar_accept_string(g, "abc;"));
    assert!(!is_grammar_accept_string(g, "abc"));
}

#[test]
fn test_union_accepts_either_language() {
    let a = Grammar::from_ebnf("root ::= \"cat\" | \"dog\"", "root").unwrap();
    let b = Grammar::from_ebnf("root ::= [0-9]+", "root").unwrap();
    let u = Grammar::union(&[a.clone(), b.clone()]).unwrap();

    for input in ["cat", "dog", "42", "cow", "", "cat42"] {
        let expected =
            is_grammar_accept_string_g(&a, input) || is_grammar_accept_string_g(&b, input);
        assert_eq!(is_grammar_accept_string_g(&u, input), expected, "{input}");
    }
}

#[test]
fn test_concat_accepts_joined_strings() {
    let a = Grammar::from_ebnf("root ::= \"x\" item\nitem ::= [a-c]", "root").unwrap();
    let b = Grammar::from_ebnf("root ::= item+\nitem ::= [0-9]", "root").unwrap();
    let c = Grammar::concat(&[a, b]).unwrap();

    assert!(is_grammar_accept_string_g(&c, "xa1"));
    assert!(is_grammar_accept_string_g(&c, "xc123"));
    assert!(!is_grammar_accept_string_g(&c, "xa"));
    assert!(!is_grammar_accept_string_g(&c, "1xa"));
}

#[test]
fn test_builtin_json_grammar() {
    let compiled = compiler().compile_builtin_json_grammar().unwrap();
    assert!(accepts(Arc::clone(&compiled), r#"{"a": [1, {"b": null}]}"#));
    assert!(!accepts(Arc::clone(&compiled), r#"{"a": }"#));
    // No whitespace after the top-level value.
    assert!(!accepts(compiled, "1 "));
}

#[test]
fn test_syntax_errors_surface_before_compilation() {
    let err = Grammar::from_ebnf("root ::= (\"a\"", "root").unwrap_err();
    assert!(matches!(err, pie_grammar::Error::GrammarSyntax(_)));
    let err = Grammar::from_ebnf("root ::= undefined_rule", "root").unwrap_err();
    assert!(matches!(err, pie_grammar::Error::GrammarSyntax(_)));
}
