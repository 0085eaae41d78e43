//! Versioned JSON serialization of grammars, tokenizers and compiled
//! grammars.

use std::sync::Arc;

use pie_grammar::{
    bitmask, CompiledGrammar, Error, Grammar, GrammarCompiler, GrammarMatcher, MatcherOptions,
    Setting, TokenizerInfo, VocabType,
};

const VOCAB: [&str; 8] = ["{", "}", "\"a\"", ":", "1", " ", "[", "</s>"];

fn tokenizer() -> TokenizerInfo {
    let encoded: Vec<String> = VOCAB.iter().map(|s| s.to_string()).collect();
    TokenizerInfo::new(&encoded, VocabType::Raw, Some(10), Setting::Set(vec![7]), false).unwrap()
}

fn masks_along(compiled: Arc<CompiledGrammar>, tokens: &[u32]) -> Vec<Vec<u32>> {
    let mut m = GrammarMatcher::new(compiled, MatcherOptions::default());
    let mut out = Vec::new();
    for &t in tokens {
        let mut bm = vec![0u32; bitmask::get_bitmask_size(10)];
        m.fill_next_token_bitmask(&mut bm, 0);
        out.push(bm);
        assert!(m.accept_token(t), "token {t}");
    }
    out
}

#[test]
fn test_grammar_round_trip() {
    let g = Grammar::from_ebnf("root ::= item+ (=\"x\")\nitem ::= [a-z] | \"\\u00e9\"", "root").unwrap();
    let back = Grammar::deserialize_json(&g.serialize_json()).unwrap();
    assert_eq!(back, g);
    assert_eq!(back.to_string(), g.to_string());
}

#[test]
fn test_tokenizer_round_trip() {
    let info = tokenizer();
    let back = TokenizerInfo::deserialize_json(&info.serialize_json()).unwrap();
    assert_eq!(back.vocab_size(), 10);
    assert_eq!(back.stop_token_ids(), info.stop_token_ids());
    assert_eq!(back.decoded_vocab(), info.decoded_vocab());
}

#[test]
fn test_compiled_grammar_round_trip() {
    let tok = Arc::new(tokenizer());
    let compiler = GrammarCompiler::new(Arc::clone(&tok), 2, false, None);
    let compiled = compiler.compile_builtin_json_grammar().unwrap();

    let json = compiled.serialize_json();
    let back = Arc::new(CompiledGrammar::deserialize_json(&json, Arc::clone(&tok)).unwrap());
    assert_eq!(*back.grammar(), *compiled.grammar());
    assert_eq!(back.serialize_json(), json);

    // `{ "a":1}` then the stop token.
    let tokens = [0, 5, 2, 3, 4, 1, 7];
    assert_eq!(masks_along(back, &tokens), masks_along(compiled, &tokens));
}

#[test]
fn test_compiled_grammar_with_rebuilt_tokenizer() {
    let tok = Arc::new(tokenizer());
    let compiled = GrammarCompiler::new(Arc::clone(&tok), 1, false, None)
        .compile_regex("[0-9]+")
        .unwrap();
    let rebuilt = Arc::new(TokenizerInfo::deserialize_json(&tok.serialize_json()).unwrap());
    assert!(CompiledGrammar::deserialize_json(&compiled.serialize_json(), rebuilt).is_ok());
}

#[test]
fn test_compiled_grammar_rejects_other_tokenizer() {
    let compiled = GrammarCompiler::new(Arc::new(tokenizer()), 1, false, None)
        .compile_regex("[0-9]+")
        .unwrap();
    let encoded: Vec<String> = vec!["1".into(), "2".into()];
    let other = Arc::new(
        TokenizerInfo::new(&encoded, VocabType::Raw, None, Setting::Set(vec![]), false).unwrap(),
    );
    let err = CompiledGrammar::deserialize_json(&compiled.serialize_json(), other).unwrap_err();
    assert!(matches!(err, Error::DeserializeFormat(_)), "{err:?}");
}

#[test]
fn test_deserialize_errors() {
    assert!(matches!(Grammar::deserialize_json("not json"), Err(Error::InvalidJson(_))));
    assert!(matches!(
        Grammar::deserialize_json(r#"{"version": "v0", "rules": []}"#),
        Err(Error::DeserializeVersion(_))
    ));
    assert!(matches!(
        Grammar::deserialize_json(r#"{"version": "v1", "rules": 3}"#),
        Err(Error::DeserializeFormat(_))
    ));
    assert!(matches!(
        TokenizerInfo::deserialize_json(r#"{"version": "v1"}"#),
        Err(Error::DeserializeFormat(_))
    ));
}
