//! Grammar matcher: DFA-based pushdown automaton + token acceptance + bitmask generation.
//!
//! `GrammarMatcher` is the main runtime entry point. It:
//! - Accepts tokens/strings byte-by-byte via a DFA-based stack parser
//! - Generates token bitmasks (which tokens are valid next)
//! - Supports rollback for speculative decoding
//! - Supports jump-forward decoding (finding deterministic prefixes)

mod single_dfa;
mod stack_parser;

use std::collections::VecDeque;
use std::fmt::Write as _;
use std::sync::Arc;

use crate::bitmask;
use crate::compiled_grammar::CompiledGrammar;
use crate::config::{self, Setting};
use crate::fsm::{DfaTable, StateId};
use crate::grammar::RuleId;
use crate::tokenizer::TokenizerInfo;

use single_dfa::SingleDfaEngine;
use stack_parser::{StackParser, NO_PARENT};

/// Upper bound on a single jump-forward string, in bytes. Grammars whose
/// forced run never ends (an empty language) would otherwise loop forever.
const MAX_JUMP_FORWARD_BYTES: usize = 4096;

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

/// Per-matcher configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatcherOptions {
    /// `Unset` uses the tokenizer's stop tokens; `Set(vec![])` disables stop
    /// tokens entirely.
    pub override_stop_tokens: Setting<Vec<u32>>,
    /// Report termination as soon as the grammar reaches an accepting position.
    pub terminate_without_stop_token: bool,
    /// Tokens kept for [`GrammarMatcher::rollback`].
    pub max_rollback_tokens: usize,
    /// `Unset` reads [`config::get_max_recursion_depth`] at construction.
    pub max_recursion_depth: Setting<usize>,
}

impl Default for MatcherOptions {
    fn default() -> Self {
        Self {
            override_stop_tokens: Setting::Unset,
            terminate_without_stop_token: false,
            max_rollback_tokens: usize::MAX,
            max_recursion_depth: Setting::Unset,
        }
    }
}

// ---------------------------------------------------------------------------
// Parser Engine
// ---------------------------------------------------------------------------

/// Two-variant engine that eliminates all `if single_dfa_mode` dual-path code.
enum ParserEngine {
    /// Single-DFA fast path: raw byte_table lookups.
    SingleDfa(SingleDfaEngine),
    /// Stack parser: DFA-based pushdown automaton for multi-rule grammars.
    Stack(StackParser),
}

/// One entry per accepted token or string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HistoryEntry {
    Bytes(usize),
    StopToken,
}

/// Reusable scratch buffers for `fill_next_token_bitmask`.
#[derive(Default)]
struct FillScratch {
    /// Distinct (rule, DFA state) pairs among the current states.
    seen_states: Vec<(u16, u16)>,
    /// Merged uncertain token indices into the sorted vocabulary.
    candidates: Vec<u32>,
    /// Bytes the parser has been probed with beyond the committed position.
    active_prefix: Vec<u8>,
    /// A prefix known to be rejected; candidates starting with it are skipped.
    dead_prefix: Vec<u8>,
}

// ---------------------------------------------------------------------------
// Grammar Matcher
// ---------------------------------------------------------------------------

/// Grammar-guided token matcher.
///
/// Wraps a parser engine with token-level operations: accept/reject
/// tokens, generate next-token bitmasks, rollback, and jump-forward decoding.
pub struct GrammarMatcher {
    engine: ParserEngine,
    compiled: Arc<CompiledGrammar>,
    tokenizer_info: Arc<TokenizerInfo>,
    /// Token IDs that signal end of generation.
    stop_token_ids: Vec<u32>,
    history: VecDeque<HistoryEntry>,
    /// Whether a stop token has been accepted.
    stop_token_accepted: bool,
    terminate_without_stop_token: bool,
    max_rollback_tokens: usize,
    max_recursion_depth: usize,
    scratch: FillScratch,
}

impl GrammarMatcher {
    pub fn new(compiled: Arc<CompiledGrammar>, options: MatcherOptions) -> Self {
        let tokenizer_info = compiled.tokenizer_info();
        let stop_token_ids = options
            .override_stop_tokens
            .unwrap_or_else(|| tokenizer_info.stop_token_ids().to_vec());
        let max_recursion_depth = options
            .max_recursion_depth
            .unwrap_or_else(config::get_max_recursion_depth);

        let engine = if compiled.is_single_dfa {
            ParserEngine::SingleDfa(SingleDfaEngine::new(&compiled))
        } else {
            ParserEngine::Stack(StackParser::new(Arc::clone(&compiled), max_recursion_depth))
        };

        Self {
            engine,
            compiled,
            tokenizer_info,
            stop_token_ids,
            history: VecDeque::new(),
            stop_token_accepted: false,
            terminate_without_stop_token: options.terminate_without_stop_token,
            max_rollback_tokens: options.max_rollback_tokens,
            max_recursion_depth,
            scratch: FillScratch::default(),
        }
    }

    /// Accept a token by its ID. Returns true if the token was valid; on
    /// false the matcher is unchanged.
    pub fn accept_token(&mut self, token_id: u32) -> bool {
        if self.stop_token_accepted {
            tracing::debug!(token_id, "token rejected: matcher already terminated");
            return false;
        }
        if token_id as usize >= self.tokenizer_info.vocab_size() {
            tracing::debug!(token_id, "token rejected: id outside the vocabulary");
            return false;
        }

        if self.stop_token_ids.contains(&token_id) {
            if !self.can_terminate() {
                tracing::debug!(token_id, "stop token rejected: grammar cannot end here");
                return false;
            }
            self.stop_token_accepted = true;
            self.push_history(HistoryEntry::StopToken);
            return true;
        }

        // Tokenizer stop tokens outside the matcher's own set are never text.
        if self.tokenizer_info.is_special(token_id) || self.tokenizer_info.stop_token_ids().contains(&token_id) {
            tracing::debug!(token_id, "token rejected: special or stop token");
            return false;
        }

        let bytes = self.tokenizer_info.decoded_token_at(token_id);
        if !advance_engine(&mut self.engine, &self.compiled, bytes) {
            return false;
        }
        let len = bytes.len();
        self.push_history(HistoryEntry::Bytes(len));
        true
    }

    /// Accept a string. Returns true if the entire string was valid. The
    /// string counts as one token for rollback.
    pub fn accept_string(&mut self, text: &str) -> bool {
        self.accept_bytes(text.as_bytes())
    }

    /// Byte-level form of [`GrammarMatcher::accept_string`].
    pub fn accept_bytes(&mut self, bytes: &[u8]) -> bool {
        if self.stop_token_accepted {
            return false;
        }
        if !advance_engine(&mut self.engine, &self.compiled, bytes) {
            return false;
        }
        self.push_history(HistoryEntry::Bytes(bytes.len()));
        true
    }

    /// Push a history entry and drop the oldest ones past the rollback horizon.
    fn push_history(&mut self, entry: HistoryEntry) {
        self.history.push_back(entry);
        while self.history.len() > self.max_rollback_tokens {
            let dropped = self.history.pop_front();
            if let (Some(HistoryEntry::Bytes(_)), ParserEngine::SingleDfa(e)) = (dropped, &mut self.engine) {
                e.history.pop_front();
            }
        }
    }

    /// Fill row `batch_index` of `buf` with the tokens allowed next.
    ///
    /// Rows are `get_bitmask_size(vocab_size)` words long. Returns false,
    /// writing nothing, when the buffer has no such row. A terminated matcher
    /// writes an all-zero row.
    ///
    /// Strategy:
    /// 1. OR the pre-computed accepted masks of the distinct current states.
    /// 2. Trie walk over the merged uncertain tokens, probing the real parser
    ///    and sharing work between tokens with a common prefix.
    pub fn fill_next_token_bitmask(&mut self, buf: &mut [u32], batch_index: usize) -> bool {
        let vocab_size = self.tokenizer_info.vocab_size();
        let Some(row) = bitmask::bitmask_row(buf, vocab_size, batch_index) else {
            return false;
        };
        bitmask::clear_bitmask(row);
        if self.stop_token_accepted {
            return true;
        }

        match &mut self.engine {
            ParserEngine::SingleDfa(e) => e.fill_bitmask(&self.compiled, row),
            ParserEngine::Stack(p) => {
                fill_bitmask_stack(p, &self.compiled, &self.tokenizer_info, row, &mut self.scratch)
            }
        }

        // Stop ids may also be ordinary text to the tokenizer, but the matcher
        // only ever accepts them as stop tokens.
        let can_terminate = self.can_terminate();
        for &stop_id in &self.stop_token_ids {
            if (stop_id as usize) >= vocab_size {
                continue;
            }
            if can_terminate {
                bitmask::set_bit(row, stop_id as usize);
            } else {
                bitmask::clear_bit(row, stop_id as usize);
            }
        }
        true
    }

    /// Undo the last `num_tokens` accepted tokens (stop token included).
    /// Returns false, changing nothing, when more tokens are requested than
    /// the rollback horizon or the recorded history allows.
    pub fn rollback(&mut self, num_tokens: usize) -> bool {
        if num_tokens > self.max_rollback_tokens || num_tokens > self.history.len() {
            tracing::debug!(
                num_tokens,
                available = self.history.len(),
                "rollback rejected"
            );
            return false;
        }

        for _ in 0..num_tokens {
            match self.history.pop_back() {
                Some(HistoryEntry::StopToken) => self.stop_token_accepted = false,
                Some(HistoryEntry::Bytes(len)) => match &mut self.engine {
                    ParserEngine::SingleDfa(e) => e.rollback_one(),
                    ParserEngine::Stack(p) => p.pop_last_states(len),
                },
                None => break,
            }
        }
        true
    }

    /// The longest string the grammar forces from here, or empty when the
    /// next byte is not determined. The matcher state is unchanged.
    pub fn find_jump_forward_string(&mut self) -> String {
        if self.stop_token_accepted {
            return String::new();
        }

        let bytes = match &mut self.engine {
            ParserEngine::SingleDfa(e) => e.find_jump_forward(&self.compiled, MAX_JUMP_FORWARD_BYTES),
            ParserEngine::Stack(p) => {
                let start_pos = p.position();
                let mut result = Vec::new();

                while result.len() < MAX_JUMP_FORWARD_BYTES && !p.is_completed() {
                    let Some(byte) = forced_byte(p, &self.compiled) else {
                        break;
                    };
                    if !p.advance(byte) {
                        break;
                    }
                    result.push(byte);
                }

                let advanced = p.position() - start_pos;
                p.pop_last_states(advanced);
                result
            }
        };
        utf8_prefix(bytes)
    }

    /// Whether the matcher has finished: a stop token was accepted, or, with
    /// `terminate_without_stop_token`, the grammar can end here.
    pub fn is_terminated(&self) -> bool {
        self.stop_token_accepted || (self.terminate_without_stop_token && self.can_terminate())
    }

    /// Whether the grammar can terminate at the current position.
    pub fn can_terminate(&self) -> bool {
        match &self.engine {
            ParserEngine::SingleDfa(e) => e.is_completed(&self.compiled),
            ParserEngine::Stack(p) => p.is_completed(),
        }
    }

    /// Reset to initial state.
    pub fn reset(&mut self) {
        match &mut self.engine {
            ParserEngine::SingleDfa(e) => e.reset(&self.compiled),
            ParserEngine::Stack(p) => p.reset(),
        }
        self.history.clear();
        self.stop_token_accepted = false;
    }

    pub fn stop_token_ids(&self) -> &[u32] {
        &self.stop_token_ids
    }

    pub fn compiled_grammar(&self) -> Arc<CompiledGrammar> {
        Arc::clone(&self.compiled)
    }

    /// Human-readable dump of the parser state, for debugging.
    pub fn debug_print_internal_state(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "terminated: {}, can_terminate: {}, history: {} tokens, max_recursion_depth: {}",
            self.is_terminated(),
            self.can_terminate(),
            self.history.len(),
            self.max_recursion_depth,
        );
        let grammar = &self.compiled.normalized;
        match &self.engine {
            ParserEngine::SingleDfa(e) => {
                let _ = writeln!(
                    out,
                    "single DFA: rule `{}` state {}",
                    grammar.rule(RuleId(e.rule_idx as u32)).name,
                    e.state
                );
            }
            ParserEngine::Stack(p) => {
                let (states, returns) = p.arena_sizes();
                let _ = writeln!(
                    out,
                    "stack parser: position {}, {} states and {} return entries stored",
                    p.position(),
                    states,
                    returns
                );
                for s in p.current_states() {
                    let mask = self.compiled.mask(s.rule_id, s.dfa_state);
                    let ret = if s.return_level == NO_PARENT {
                        "root".to_string()
                    } else {
                        s.return_level.to_string()
                    };
                    let _ = writeln!(
                        out,
                        "  rule `{}` state {} (entered at {}, depth {}): {} accepted, {} uncertain",
                        grammar.rule(RuleId(s.rule_id as u32)).name,
                        s.dfa_state,
                        ret,
                        s.depth,
                        mask.num_accepted(),
                        mask.uncertain.len(),
                    );
                }
            }
        }
        out
    }
}

fn advance_engine(engine: &mut ParserEngine, compiled: &CompiledGrammar, bytes: &[u8]) -> bool {
    match engine {
        ParserEngine::SingleDfa(e) => e.advance_bytes(compiled, bytes),
        ParserEngine::Stack(p) => p.advance_bytes(bytes),
    }
}

/// Fill the row using the stack parser (multi-rule path).
fn fill_bitmask_stack(
    parser: &mut StackParser,
    compiled: &CompiledGrammar,
    tokenizer_info: &TokenizerInfo,
    row: &mut [u32],
    scratch: &mut FillScratch,
) {
    scratch.seen_states.clear();
    scratch.candidates.clear();

    for state in parser.current_states() {
        let key = (state.rule_id, state.dfa_state);
        if scratch.seen_states.contains(&key) {
            continue;
        }
        scratch.seen_states.push(key);
        let mask = compiled.mask(state.rule_id, state.dfa_state);
        mask.apply_accepted(row);
        scratch.candidates.extend_from_slice(&mask.uncertain);
    }

    if scratch.candidates.is_empty() {
        return;
    }
    if scratch.seen_states.len() > 1 {
        scratch.candidates.sort_unstable();
        scratch.candidates.dedup();
    }
    fill_bitmask_trie_walk(parser, tokenizer_info, row, scratch);
}

/// Batch trie walk: check the candidate tokens in sorted order, probing the
/// parser byte by byte and keeping the probe levels shared with the
/// previous candidate.
fn fill_bitmask_trie_walk(
    parser: &mut StackParser,
    tokenizer_info: &TokenizerInfo,
    row: &mut [u32],
    scratch: &mut FillScratch,
) {
    let sorted = tokenizer_info.sorted_ids();
    let FillScratch {
        candidates,
        active_prefix,
        dead_prefix,
        ..
    } = scratch;
    active_prefix.clear();
    dead_prefix.clear();

    for &index in candidates.iter() {
        let token_id = sorted[index as usize];
        if bitmask::get_bit(row, token_id as usize) {
            continue;
        }
        let bytes = tokenizer_info.decoded_token_at(token_id);
        if !dead_prefix.is_empty() {
            if bytes.starts_with(&dead_prefix[..]) {
                continue;
            }
            dead_prefix.clear();
        }

        // Rewind probe levels to the common prefix
        let common = longest_common_prefix(bytes, &active_prefix[..]);
        parser.pop_last_states(active_prefix.len() - common);
        active_prefix.truncate(common);

        let mut dead = false;
        for (pos, &byte) in bytes.iter().enumerate().skip(common) {
            if !parser.advance(byte) {
                dead_prefix.extend_from_slice(&bytes[..=pos]);
                dead = true;
                break;
            }
            active_prefix.push(byte);
        }

        if !dead {
            bitmask::set_bit(row, token_id as usize);
        }
    }

    parser.pop_last_states(active_prefix.len());
    active_prefix.clear();
}

/// The single byte every current state agrees on, if any.
fn forced_byte(parser: &StackParser, compiled: &CompiledGrammar) -> Option<u8> {
    let mut forced = None;
    for state in parser.current_states() {
        // Predicted sub-rules and completed parents are states of their own.
        if !compiled.flags(state.rule_id, state.dfa_state).has_char_edges() {
            continue;
        }
        let dfa = &compiled.rule_dfas[state.rule_id as usize];
        let byte = deterministic_byte(&dfa.fsm, StateId(state.dfa_state as u32))?;
        match forced {
            None => forced = Some(byte),
            Some(b) if b == byte => {}
            Some(_) => return None,
        }
    }
    forced
}

/// The only byte with a transition out of `state`, if exactly one exists.
fn deterministic_byte(dfa: &DfaTable, state: StateId) -> Option<u8> {
    let mut result = None;
    for byte in 0..=255u8 {
        if dfa.next_state(state, byte).is_some() {
            if result.is_some() {
                return None;
            }
            result = Some(byte);
        }
    }
    result
}

/// Longest common prefix of two byte slices.
fn longest_common_prefix(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b.iter()).take_while(|(x, y)| x == y).count()
}

/// Decode the longest valid UTF-8 prefix; a forced run may stop inside a
/// multi-byte character.
fn utf8_prefix(bytes: Vec<u8>) -> String {
    match String::from_utf8(bytes) {
        Ok(s) => s,
        Err(err) => {
            let valid = err.utf8_error().valid_up_to();
            let mut bytes = err.into_bytes();
            bytes.truncate(valid);
            String::from_utf8(bytes).unwrap_or_default()
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
