//! Grammar-constrained decoding for LLM token generation.
//!
//! Output is constrained to a formal language given as EBNF, a regular
//! expression, a JSON Schema or a structural tag description. A grammar is
//! compiled once per tokenizer into per-rule DFAs plus pre-computed token
//! masks; a matcher then tracks one generation and yields, before every
//! sampling step, the bitmask of tokens that keep the output valid.
//!
//! # Usage
//!
//! 1. **Describe the vocabulary** with [`TokenizerInfo`]
//! 2. **Compile** with a [`GrammarCompiler`] (cached, shareable across threads)
//! 3. **Create a matcher** per generation
//! 4. **Loop**: `fill_next_token_bitmask` → mask logits → sample → `accept_token`
//!
//! ```rust
//! use std::sync::Arc;
//! use pie_grammar::{bitmask, GrammarCompiler, GrammarMatcher, MatcherOptions, Setting};
//! use pie_grammar::{TokenizerInfo, VocabType};
//!
//! let vocab: Vec<String> = vec!["yes".into(), "no".into(), "maybe".into(), "</s>".into()];
//! let tokenizer = Arc::new(
//!     TokenizerInfo::new(&vocab, VocabType::Raw, None, Setting::Set(vec![3]), false).unwrap(),
//! );
//! let compiler = GrammarCompiler::new(tokenizer, 1, true, None);
//! let compiled = compiler.compile_regex("yes|no").unwrap();
//!
//! let mut matcher = GrammarMatcher::new(compiled, MatcherOptions::default());
//! let mut mask = vec![0u32; bitmask::get_bitmask_size(vocab.len())];
//! matcher.fill_next_token_bitmask(&mut mask, 0);
//! assert!(bitmask::get_bit(&mask, 0));
//! assert!(!bitmask::get_bit(&mask, 2));
//!
//! let mut logits = vec![0.5f32, 0.25, 2.0, 0.0];
//! bitmask::apply_token_bitmask_inplace(&mut logits, &mask);
//! assert_eq!(logits[2], f32::NEG_INFINITY);
//!
//! assert!(matcher.accept_token(0));
//! assert!(matcher.accept_token(3));
//! assert!(matcher.is_terminated());
//! ```

pub mod bitmask;
pub mod compiled_grammar;
pub mod compiler;
pub mod config;
pub mod error;
pub(crate) mod fsm;
pub mod grammar;
pub mod json_schema;
pub mod matcher;
pub mod regex;
pub mod structural_tag;
pub mod tokenizer;

pub use compiled_grammar::CompiledGrammar;
pub use compiler::GrammarCompiler;
pub use config::{get_max_recursion_depth, set_max_recursion_depth, Setting};
pub use error::{Error, Result};
pub use grammar::Grammar;
pub use json_schema::JsonSchemaOptions;
pub use matcher::{GrammarMatcher, MatcherOptions};
pub use structural_tag::StructuralTag;
pub use tokenizer::{TokenizerInfo, VocabType};
