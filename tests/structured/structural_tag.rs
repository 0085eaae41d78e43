//! Structural tags: free text with grammar-constrained tagged regions.

use std::sync::Arc;

use pie_grammar::{
    Error, GrammarCompiler, GrammarMatcher, MatcherOptions, Setting, StructuralTag, TokenizerInfo,
    VocabType,
};

fn make_compiler() -> GrammarCompiler {
    let vocab: Vec<String> = vec!["dummy".into()];
    let tok = TokenizerInfo::new(&vocab, VocabType::Raw, None, Setting::Set(vec![]), false).unwrap();
    GrammarCompiler::new(Arc::new(tok), 2, true, None)
}

fn matcher(tag_json: &str) -> GrammarMatcher {
    let compiled = make_compiler().compile_structural_tag(tag_json).unwrap();
    GrammarMatcher::new(compiled, MatcherOptions::default())
}

fn is_accept_string(tag_json: &str, input: &str) -> bool {
    let mut m = matcher(tag_json);
    if !input.is_empty() && !m.accept_string(input) {
        return false;
    }
    m.can_terminate()
}

const WEATHER: &str = r#"{
    "triggers": ["<function="],
    "tags": [
        {
            "begin": "<function=get_weather>",
            "schema": {"type": "object", "properties": {"city": {"type": "string"}}, "required": ["city"]},
            "end": "</function>"
        },
        {"begin": "<function=add>", "regex": "[0-9]+\\+[0-9]+", "end": "</function>"}
    ]
}"#;

#[test]
fn test_free_text_only() {
    assert!(is_accept_string(WEATHER, ""));
    assert!(is_accept_string(WEATHER, "The weather is nice < today."));
    assert!(is_accept_string(WEATHER, "<func without the sign"));
}

#[test]
fn test_tagged_regions() {
    let text = r#"Let me check. <function=get_weather>{"city": "Paris"}</function> Done."#;
    assert!(is_accept_string(WEATHER, text));

    let text = "a <function=add>1+2</function> b <function=add>30+4</function>";
    assert!(is_accept_string(WEATHER, text));
}

#[test]
fn test_trigger_commits_to_a_tag() {
    let mut m = matcher(WEATHER);
    assert!(m.accept_string("hi <function="));
    assert!(!m.can_terminate());
    assert!(!m.accept_string("unknown>"));
    assert!(m.accept_string("add>"));
    assert!(!m.accept_string("x"));
    assert!(m.accept_string("7+8</function>"));
    assert!(m.can_terminate());
}

#[test]
fn test_tag_content_is_checked() {
    let text = r#"<function=get_weather>{"town": "Paris"}</function>"#;
    assert!(!is_accept_string(WEATHER, text));
    let text = r#"<function=get_weather>{"city": "Paris"}"#;
    assert!(!is_accept_string(WEATHER, text));
}

#[test]
fn test_at_least_one() {
    let json = r#"{
        "triggers": ["<t>"],
        "tags": [{"begin": "<t>", "ebnf": "root ::= [a-z]+", "end": "</t>"}],
        "at_least_one": true
    }"#;
    assert!(!is_accept_string(json, ""));
    assert!(!is_accept_string(json, "just text"));
    assert!(is_accept_string(json, "text <t>abc</t>"));
    assert!(is_accept_string(json, "<t>abc</t> and more text"));
}

#[test]
fn test_stop_after_first() {
    let json = r#"{
        "triggers": ["<t>"],
        "tags": [{"begin": "<t>", "ebnf": "root ::= [a-z]+", "end": "</t>"}],
        "stop_after_first": true
    }"#;
    assert!(is_accept_string(json, "text"));
    assert!(is_accept_string(json, "text <t>abc</t>"));
    assert!(!is_accept_string(json, "text <t>abc</t> more"));
}

#[test]
fn test_parse_and_errors() {
    let tag = StructuralTag::from_json(WEATHER).unwrap();
    assert_eq!(tag.tags.len(), 2);

    let compiler = make_compiler();
    assert!(matches!(
        compiler.compile_structural_tag("{not json"),
        Err(Error::InvalidJson(_))
    ));
    assert!(matches!(
        compiler.compile_structural_tag(r#"{"triggers": [], "tags": []}"#),
        Err(Error::InvalidStructuralTag(_))
    ));
    assert!(matches!(
        compiler.compile_structural_tag(
            r#"{"triggers": ["<a"], "tags": [{"begin": "<a>", "regex": "(", "end": ""}]}"#
        ),
        Err(Error::GrammarSyntax(_))
    ));
}
