//! JSON Schema → Grammar conversion and acceptance.

use std::sync::Arc;

use pie_grammar::{
    bitmask, Error, Grammar, GrammarCompiler, GrammarMatcher, JsonSchemaOptions, MatcherOptions,
    Setting, TokenizerInfo, VocabType,
};

fn make_compiler(vocab: &[&str]) -> GrammarCompiler {
    let encoded: Vec<String> = vocab.iter().map(|s| s.to_string()).collect();
    let tok = TokenizerInfo::new(&encoded, VocabType::Raw, None, Setting::Set(vec![]), false).unwrap();
    GrammarCompiler::new(Arc::new(tok), 2, true, None)
}

fn is_schema_accept_string(schema: &str, options: &JsonSchemaOptions, input: &str) -> bool {
    let compiled = make_compiler(&["dummy"])
        .compile_json_schema(schema, options)
        .unwrap();
    let mut m = GrammarMatcher::new(compiled, MatcherOptions::default());
    if !input.is_empty() && !m.accept_string(input) {
        return false;
    }
    m.can_terminate()
}

fn compact() -> JsonSchemaOptions {
    JsonSchemaOptions {
        any_whitespace: false,
        ..JsonSchemaOptions::default()
    }
}

#[test]
fn test_integer_schema() {
    let schema = r#"{"type": "integer"}"#;
    let opts = JsonSchemaOptions::default();
    assert!(is_schema_accept_string(schema, &opts, "123"));
    assert!(is_schema_accept_string(schema, &opts, "-7"));
    assert!(is_schema_accept_string(schema, &opts, "0"));
    assert!(!is_schema_accept_string(schema, &opts, "abc"));
    assert!(!is_schema_accept_string(schema, &opts, "1.5"));
    assert!(!is_schema_accept_string(schema, &opts, "007"));
}

#[test]
fn test_integer_range() {
    let schema = r#"{"type": "integer", "minimum": -5, "maximum": 120}"#;
    let opts = compact();
    for ok in ["-5", "0", "99", "120"] {
        assert!(is_schema_accept_string(schema, &opts, ok), "{ok}");
    }
    for bad in ["-6", "121", "1000"] {
        assert!(!is_schema_accept_string(schema, &opts, bad), "{bad}");
    }
}

#[test]
fn test_object_with_required_and_optional() {
    let schema = r#"{
        "type": "object",
        "properties": {
            "name": {"type": "string"},
            "age": {"type": "integer"}
        },
        "required": ["name"]
    }"#;
    let opts = compact();
    assert!(is_schema_accept_string(schema, &opts, r#"{"name": "Ann", "age": 31}"#));
    assert!(is_schema_accept_string(schema, &opts, r#"{"name": "Ann"}"#));
    assert!(!is_schema_accept_string(schema, &opts, r#"{"age": 31}"#));
    // Strict mode forbids unknown properties.
    assert!(!is_schema_accept_string(schema, &opts, r#"{"name": "Ann", "x": 1}"#));
    // The compact layout fixes the separators.
    assert!(!is_schema_accept_string(schema, &opts, r#"{"name":"Ann"}"#));
}

#[test]
fn test_any_whitespace_layout() {
    let schema = r#"{"type": "object", "properties": {"a": {"type": "integer"}}, "required": ["a"]}"#;
    let opts = JsonSchemaOptions::default();
    assert!(is_schema_accept_string(schema, &opts, r#"{"a":1}"#));
    assert!(is_schema_accept_string(schema, &opts, "{ \"a\" :\n 1 }"));
    assert!(!is_schema_accept_string(schema, &opts, r#"{"a": "1"}"#));
}

#[test]
fn test_indented_layout() {
    let schema = r#"{"type": "object", "properties": {"a": {"type": "boolean"}}, "required": ["a"]}"#;
    let opts = JsonSchemaOptions {
        any_whitespace: false,
        indent: Some(2),
        ..JsonSchemaOptions::default()
    };
    assert!(is_schema_accept_string(schema, &opts, "{\n  \"a\": true\n}"));
    assert!(!is_schema_accept_string(schema, &opts, r#"{"a": true}"#));
}

#[test]
fn test_enum_and_const() {
    let opts = compact();
    let schema = r#"{"enum": ["red", "green", 3, null]}"#;
    for ok in [r#""red""#, r#""green""#, "3", "null"] {
        assert!(is_schema_accept_string(schema, &opts, ok), "{ok}");
    }
    assert!(!is_schema_accept_string(schema, &opts, r#""blue""#));

    let schema = r#"{"const": {"k": [1, 2]}}"#;
    // Constants are rendered as compact JSON text.
    assert!(is_schema_accept_string(schema, &opts, r#"{"k":[1,2]}"#));
    assert!(!is_schema_accept_string(schema, &opts, r#"{"k": [1, 2]}"#));
}

#[test]
fn test_string_constraints() {
    let opts = compact();
    let schema = r#"{"type": "string", "minLength": 2, "maxLength": 3}"#;
    assert!(!is_schema_accept_string(schema, &opts, r#""a""#));
    assert!(is_schema_accept_string(schema, &opts, r#""ab""#));
    assert!(is_schema_accept_string(schema, &opts, r#""abc""#));
    assert!(!is_schema_accept_string(schema, &opts, r#""abcd""#));

    let schema = r#"{"type": "string", "pattern": "^[A-Z]{2}[0-9]+$"}"#;
    assert!(is_schema_accept_string(schema, &opts, r#""AB12""#));
    assert!(!is_schema_accept_string(schema, &opts, r#""Ab12""#));
}

#[test]
fn test_array_items() {
    let opts = compact();
    let schema = r#"{"type": "array", "items": {"type": "integer"}, "minItems": 1, "maxItems": 2}"#;
    assert!(!is_schema_accept_string(schema, &opts, "[]"));
    assert!(is_schema_accept_string(schema, &opts, "[1]"));
    assert!(is_schema_accept_string(schema, &opts, "[1, 2]"));
    assert!(!is_schema_accept_string(schema, &opts, "[1, 2, 3]"));
    assert!(!is_schema_accept_string(schema, &opts, r#"["x"]"#));
}

#[test]
fn test_recursive_ref() {
    let schema = r##"{
        "$defs": {"node": {
            "type": "object",
            "properties": {"next": {"anyOf": [{"$ref": "#/$defs/node"}, {"type": "null"}]}},
            "required": ["next"]
        }},
        "$ref": "#/$defs/node"
    }"##;
    let opts = compact();
    assert!(is_schema_accept_string(schema, &opts, r#"{"next": null}"#));
    assert!(is_schema_accept_string(schema, &opts, r#"{"next": {"next": {"next": null}}}"#));
    assert!(!is_schema_accept_string(schema, &opts, r#"{"next": {}}"#));
}

#[test]
fn test_invalid_schemas() {
    let compiler = make_compiler(&["dummy"]);
    let opts = JsonSchemaOptions::default();
    assert!(matches!(
        compiler.compile_json_schema("{not json", &opts),
        Err(Error::InvalidJson(_))
    ));
    assert!(matches!(
        compiler.compile_json_schema(r#"{"type": "integer", "minimum": 3, "maximum": 1}"#, &opts),
        Err(Error::InvalidJsonSchema(_))
    ));
    assert!(matches!(
        Grammar::from_json_schema(r##"{"$ref": "#/nowhere"}"##, &opts),
        Err(Error::InvalidJsonSchema(_))
    ));
}

/// Token-level walk through `{ "a" : 1 }` with the builtin JSON grammar:
/// after the closing brace no token is allowed.
#[test]
fn test_builtin_json_token_walk() {
    let vocab = ["{", "}", "\"a\"", ":", "1", " "];
    let compiler = make_compiler(&vocab);
    let compiled = compiler.compile_builtin_json_grammar().unwrap();
    let mut m = GrammarMatcher::new(compiled, MatcherOptions::default());
    let mut mask = vec![0u32; bitmask::get_bitmask_size(vocab.len())];

    m.fill_next_token_bitmask(&mut mask, 0);
    assert!(bitmask::get_bit(&mask, 0));
    assert!(bitmask::get_bit(&mask, 2));
    assert!(bitmask::get_bit(&mask, 4));
    assert!(!bitmask::get_bit(&mask, 1));
    assert!(!bitmask::get_bit(&mask, 5));

    for token in [0, 5, 2, 5, 3, 5, 4, 5, 1] {
        assert!(m.accept_token(token), "token {token}");
    }
    assert!(m.can_terminate());
    m.fill_next_token_bitmask(&mut mask, 0);
    assert_eq!(bitmask::count_ones(&mask), 0);
}
