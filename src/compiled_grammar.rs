//! Pre-compiled grammar with per-rule DFAs and adaptive token masks.
//!
//! `CompiledGrammar` pre-computes a token mask for every DFA state that can
//! scan bytes, so `fill_next_token_bitmask` only has to OR a handful of masks
//! and re-check the few tokens whose fate depends on the rule stack.

use std::sync::Arc;
use std::time::Instant;

use rayon::prelude::*;
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};

use crate::bitmask;
use crate::config::SERIALIZATION_VERSION;
use crate::fsm::{build_rule_dfas, Automaton, DfaTable, StateId};
use crate::grammar::normalize::normalize_grammar;
use crate::grammar::serialize::{from_versioned_json, to_json};
use crate::grammar::Grammar;
use crate::tokenizer::TokenizerInfo;
use crate::Error;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Packed per-state flags for fast branching while parsing (1 byte).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct StateFlags(pub(crate) u8);

impl StateFlags {
    pub(crate) const CHAR_EDGES: u8 = 1;
    pub(crate) const RULE_REF: u8 = 2;
    pub(crate) const ACCEPTING: u8 = 4;

    #[inline(always)]
    pub(crate) fn has_char_edges(self) -> bool {
        self.0 & Self::CHAR_EDGES != 0
    }
    #[inline(always)]
    pub(crate) fn has_rule_ref(self) -> bool {
        self.0 & Self::RULE_REF != 0
    }
    #[inline(always)]
    pub(crate) fn is_accepting(self) -> bool {
        self.0 & Self::ACCEPTING != 0
    }
}

/// Tokens that are definitely accepted from a DFA state.
///
/// Stored as a sorted id list when that is smaller than a full bitset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum AcceptedSet {
    Ids(Vec<u32>),
    Bits(Vec<u32>),
}

/// Pre-computed token mask for one (rule, DFA state) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct AdaptiveTokenMask {
    pub(crate) accepted: AcceptedSet,
    /// Ascending indices into `TokenizerInfo::sorted_ids` for tokens that
    /// leave the rule (or enter a sub-rule) part way through. They are
    /// re-checked against the full parser at runtime.
    pub(crate) uncertain: Vec<u32>,
}

impl AdaptiveTokenMask {
    fn empty() -> Self {
        Self {
            accepted: AcceptedSet::Ids(Vec::new()),
            uncertain: Vec::new(),
        }
    }

    fn new(mut accepted_ids: Vec<u32>, uncertain: Vec<u32>, vocab_size: usize) -> Self {
        let words = bitmask::get_bitmask_size(vocab_size);
        let accepted = if accepted_ids.len() < words {
            accepted_ids.sort_unstable();
            AcceptedSet::Ids(accepted_ids)
        } else {
            let mut bits = vec![0u32; words];
            for id in accepted_ids {
                bitmask::set_bit(&mut bits, id as usize);
            }
            AcceptedSet::Bits(bits)
        };
        Self { accepted, uncertain }
    }

    /// OR the accepted tokens into a bitmask row.
    #[inline]
    pub(crate) fn apply_accepted(&self, row: &mut [u32]) {
        match &self.accepted {
            AcceptedSet::Ids(ids) => {
                for &id in ids {
                    bitmask::set_bit(row, id as usize);
                }
            }
            AcceptedSet::Bits(bits) => bitmask::union_into(row, bits),
        }
    }

    pub(crate) fn num_accepted(&self) -> usize {
        match &self.accepted {
            AcceptedSet::Ids(ids) => ids.len(),
            AcceptedSet::Bits(bits) => bitmask::count_ones(bits),
        }
    }

    fn memory_size_bytes(&self) -> usize {
        let accepted = match &self.accepted {
            AcceptedSet::Ids(v) | AcceptedSet::Bits(v) => v.len() * 4,
        };
        accepted + self.uncertain.len() * 4 + std::mem::size_of::<Self>()
    }

    fn validate(&self, tokenizer_info: &TokenizerInfo) -> anyhow::Result<()> {
        let vocab_size = tokenizer_info.vocab_size();
        match &self.accepted {
            AcceptedSet::Ids(ids) => {
                if let Some(id) = ids.iter().find(|&&id| id as usize >= vocab_size) {
                    anyhow::bail!("accepted token {id} is outside the vocabulary");
                }
            }
            AcceptedSet::Bits(bits) => {
                if bits.len() != bitmask::get_bitmask_size(vocab_size) {
                    anyhow::bail!("accepted bitset has {} words", bits.len());
                }
            }
        }
        let num_sorted = tokenizer_info.sorted_ids().len();
        if self.uncertain.windows(2).any(|w| w[0] >= w[1])
            || self.uncertain.last().is_some_and(|&i| i as usize >= num_sorted)
        {
            anyhow::bail!("uncertain token list is not an ascending list of vocabulary indices");
        }
        Ok(())
    }
}

/// Token classification during pre-computation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TokenClass {
    Accepted,
    Rejected,
    Uncertain,
}

/// A grammar compiled against one tokenizer: per-rule DFAs plus per-state
/// token masks. Immutable and shared across matchers via `Arc`.
pub struct CompiledGrammar {
    /// The grammar as handed to the compiler.
    grammar: Arc<Grammar>,
    /// Normalized and optimized form that the DFAs are built from.
    pub(crate) normalized: Grammar,
    tokenizer_info: Arc<TokenizerInfo>,
    /// Per-rule DFAs, indexed by the normalized grammar's rule ids.
    pub(crate) rule_dfas: Vec<Automaton<DfaTable>>,
    /// Flat per-state flags; rule `r` starts at `state_offsets[r]`.
    state_flags: Vec<StateFlags>,
    state_offsets: Vec<u32>,
    /// Flat per-state masks, parallel to `state_flags`. States without byte
    /// transitions share one empty mask.
    masks: Vec<Arc<AdaptiveTokenMask>>,
    /// True when the root rule's DFA never references another rule.
    pub(crate) is_single_dfa: bool,
}

impl std::fmt::Debug for CompiledGrammar {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledGrammar")
            .field("rules", &self.rule_dfas.len())
            .field("states", &self.state_flags.len())
            .field("is_single_dfa", &self.is_single_dfa)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Construction
// ---------------------------------------------------------------------------

impl CompiledGrammar {
    /// Compile `grammar` against `tokenizer_info`.
    ///
    /// Mask pre-computation runs on the current rayon pool; callers that
    /// want a bounded pool should invoke this inside `ThreadPool::install`.
    pub(crate) fn new(grammar: Arc<Grammar>, tokenizer_info: Arc<TokenizerInfo>) -> crate::Result<Self> {
        let started = Instant::now();
        let (normalized, rule_dfas) = lower(&grammar)?;
        let (state_flags, state_offsets) = compute_state_flags(&rule_dfas);
        let masks = precompute_token_masks(&rule_dfas, &tokenizer_info, &state_offsets, state_flags.len());

        let compiled = Self::assemble(grammar, normalized, tokenizer_info, rule_dfas, state_flags, state_offsets, masks);
        tracing::debug!(
            rules = compiled.rule_dfas.len(),
            states = compiled.state_flags.len(),
            single_dfa = compiled.is_single_dfa,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "compiled grammar"
        );
        Ok(compiled)
    }

    fn assemble(
        grammar: Arc<Grammar>,
        normalized: Grammar,
        tokenizer_info: Arc<TokenizerInfo>,
        rule_dfas: Vec<Automaton<DfaTable>>,
        state_flags: Vec<StateFlags>,
        state_offsets: Vec<u32>,
        masks: Vec<Arc<AdaptiveTokenMask>>,
    ) -> Self {
        let root = normalized.root_id().0 as usize;
        let root_dfa = &rule_dfas[root];
        let is_single_dfa = (0..root_dfa.fsm.num_states())
            .all(|s| root_dfa.fsm.rule_edges(StateId(s as u32)).is_empty());
        Self {
            grammar,
            normalized,
            tokenizer_info,
            rule_dfas,
            state_flags,
            state_offsets,
            masks,
            is_single_dfa,
        }
    }

    /// The grammar this was compiled from (the same `Arc` the compiler received).
    pub fn grammar(&self) -> Arc<Grammar> {
        Arc::clone(&self.grammar)
    }

    pub fn tokenizer_info(&self) -> Arc<TokenizerInfo> {
        Arc::clone(&self.tokenizer_info)
    }

    /// Approximate heap footprint. Shared masks are counted once; the
    /// tokenizer is not counted since it is shared with the compiler.
    pub fn memory_size_bytes(&self) -> usize {
        let mut seen = FxHashSet::default();
        let masks: usize = self
            .masks
            .iter()
            .filter(|m| seen.insert(Arc::as_ptr(m)))
            .map(|m| m.memory_size_bytes())
            .sum();
        let dfas: usize = self
            .rule_dfas
            .iter()
            .map(|d| d.fsm.memory_size_bytes() + d.ends.len())
            .sum();
        let grammars = (self.grammar.num_exprs() + self.normalized.num_exprs()) * 32
            + (self.grammar.num_rules() + self.normalized.num_rules()) * 48;
        masks
            + dfas
            + grammars
            + self.state_flags.len()
            + self.state_offsets.len() * 4
            + self.masks.len() * std::mem::size_of::<Arc<AdaptiveTokenMask>>()
    }

    #[inline(always)]
    fn flat_index(&self, rule_id: u16, dfa_state: u16) -> usize {
        self.state_offsets[rule_id as usize] as usize + dfa_state as usize
    }

    #[inline(always)]
    pub(crate) fn flags(&self, rule_id: u16, dfa_state: u16) -> StateFlags {
        self.state_flags[self.flat_index(rule_id, dfa_state)]
    }

    #[inline(always)]
    pub(crate) fn mask(&self, rule_id: u16, dfa_state: u16) -> &AdaptiveTokenMask {
        &self.masks[self.flat_index(rule_id, dfa_state)]
    }

    pub(crate) fn root_rule(&self) -> u16 {
        self.normalized.root_id().0 as u16
    }
}

/// Normalize, optimize and build one DFA per rule.
fn lower(grammar: &Grammar) -> crate::Result<(Grammar, Vec<Automaton<DfaTable>>)> {
    let normalized = normalize_grammar(grammar)?.optimize()?;
    let rule_dfas = build_rule_dfas(&normalized).map_err(Error::syntax)?;
    Ok((normalized, rule_dfas))
}

/// Flat per-state flags and the per-rule offsets into them.
fn compute_state_flags(rule_dfas: &[Automaton<DfaTable>]) -> (Vec<StateFlags>, Vec<u32>) {
    let mut flags = Vec::new();
    let mut offsets = Vec::with_capacity(rule_dfas.len());
    for dfa in rule_dfas {
        offsets.push(flags.len() as u32);
        for s in 0..dfa.fsm.num_states() {
            let state = StateId(s as u32);
            let mut bits = 0u8;
            if dfa.fsm.has_char_edges(state) {
                bits |= StateFlags::CHAR_EDGES;
            }
            if !dfa.fsm.rule_edges(state).is_empty() {
                bits |= StateFlags::RULE_REF;
            }
            if dfa.is_end(state) {
                bits |= StateFlags::ACCEPTING;
            }
            flags.push(StateFlags(bits));
        }
    }
    (flags, offsets)
}

// ---------------------------------------------------------------------------
// Adaptive token mask pre-computation
// ---------------------------------------------------------------------------

/// Classify a token against a DFA state.
///
/// - `Accepted`: all bytes are consumed by byte transitions of this rule and
///   the walk ends somewhere the parser stays alive without new predictions.
/// - `Rejected`: the walk dies and nothing on the path could have handed the
///   remaining bytes to a parent or a sub-rule.
/// - `Uncertain`: the rule stack decides.
fn classify_token(dfa: &Automaton<DfaTable>, start: StateId, token: &[u8]) -> TokenClass {
    let mut cur = start;
    let mut may_leave = false;
    for &byte in token {
        may_leave |= dfa.is_end(cur) || !dfa.fsm.rule_edges(cur).is_empty();
        match dfa.fsm.next_state(cur, byte) {
            Some(next) => cur = next,
            None if may_leave => return TokenClass::Uncertain,
            None => return TokenClass::Rejected,
        }
    }
    if dfa.fsm.has_char_edges(cur) || dfa.is_end(cur) {
        TokenClass::Accepted
    } else {
        TokenClass::Uncertain
    }
}

/// Mask for a single DFA state over the whole sorted vocabulary.
///
/// A rejected token rejects every token it prefixes (they die on the same
/// byte), so the walk jumps over its trie subtree.
fn compute_state_mask(dfa: &Automaton<DfaTable>, state: StateId, tokenizer_info: &TokenizerInfo) -> AdaptiveTokenMask {
    let sorted = tokenizer_info.sorted_ids();
    let trie_end = tokenizer_info.trie_subtree_end();
    let mut accepted = Vec::new();
    let mut uncertain = Vec::new();

    let mut i = 0;
    while i < sorted.len() {
        let token_id = sorted[i];
        match classify_token(dfa, state, tokenizer_info.decoded_token_at(token_id)) {
            TokenClass::Accepted => {
                accepted.push(token_id);
                i += 1;
            }
            TokenClass::Uncertain => {
                uncertain.push(i as u32);
                i += 1;
            }
            TokenClass::Rejected => i = (trie_end[i] as usize).max(i + 1),
        }
    }
    AdaptiveTokenMask::new(accepted, uncertain, tokenizer_info.vocab_size())
}

/// Pre-compute masks for every state with byte transitions.
///
/// Structurally identical DFAs (common in schema grammars where string and
/// whitespace rules repeat) share their masks. The per-state work is spread
/// over the current rayon pool.
fn precompute_token_masks(
    rule_dfas: &[Automaton<DfaTable>],
    tokenizer_info: &TokenizerInfo,
    state_offsets: &[u32],
    num_states: usize,
) -> Vec<Arc<AdaptiveTokenMask>> {
    // First rule index carrying each distinct DFA.
    let mut canonical: FxHashMap<&Automaton<DfaTable>, usize> = FxHashMap::default();
    let owner: Vec<usize> = rule_dfas
        .iter()
        .enumerate()
        .map(|(r, dfa)| *canonical.entry(dfa).or_insert(r))
        .collect();

    let tasks: Vec<(usize, u32)> = owner
        .iter()
        .enumerate()
        .filter(|&(r, &o)| r == o)
        .flat_map(|(r, _)| {
            let dfa = &rule_dfas[r];
            (0..dfa.fsm.num_states() as u32)
                .filter(move |&s| dfa.fsm.has_char_edges(StateId(s)))
                .map(move |s| (r, s))
        })
        .collect();

    let computed: Vec<(usize, Arc<AdaptiveTokenMask>)> = tasks
        .par_iter()
        .map(|&(r, s)| {
            let mask = compute_state_mask(&rule_dfas[r], StateId(s), tokenizer_info);
            (state_offsets[r] as usize + s as usize, Arc::new(mask))
        })
        .collect();

    let empty = Arc::new(AdaptiveTokenMask::empty());
    let mut masks = vec![empty; num_states];
    for (index, mask) in computed {
        masks[index] = mask;
    }
    for (r, &o) in owner.iter().enumerate() {
        if r != o {
            let (src, dst) = (state_offsets[o] as usize, state_offsets[r] as usize);
            for s in 0..rule_dfas[r].fsm.num_states() {
                masks[dst + s] = Arc::clone(&masks[src + s]);
            }
        }
    }
    masks
}

// ---------------------------------------------------------------------------
// Serialization
// ---------------------------------------------------------------------------

#[derive(Serialize, Deserialize)]
struct CompiledGrammarRepr {
    version: String,
    /// The source grammar in its own serialized form.
    grammar: String,
    tokenizer_fingerprint: u64,
    masks: Vec<AdaptiveTokenMask>,
    /// For each flat state, an index into `masks`.
    state_masks: Vec<u32>,
}

impl CompiledGrammar {
    /// Serialize to a versioned JSON string. The tokenizer itself is not
    /// included, only a fingerprint of it.
    pub fn serialize_json(&self) -> String {
        let mut index_of: FxHashMap<*const AdaptiveTokenMask, u32> = FxHashMap::default();
        let mut masks = Vec::new();
        let state_masks = self
            .masks
            .iter()
            .map(|m| {
                *index_of.entry(Arc::as_ptr(m)).or_insert_with(|| {
                    masks.push(AdaptiveTokenMask::clone(m));
                    (masks.len() - 1) as u32
                })
            })
            .collect();
        to_json(&CompiledGrammarRepr {
            version: SERIALIZATION_VERSION.to_string(),
            grammar: self.grammar.serialize_json(),
            tokenizer_fingerprint: self.tokenizer_info.fingerprint(),
            masks,
            state_masks,
        })
    }

    /// Inverse of [`CompiledGrammar::serialize_json`].
    ///
    /// The DFAs are rebuilt from the embedded grammar; the token masks are
    /// taken from the payload. A payload produced for a different tokenizer
    /// is reported as `DeserializeFormat`.
    pub fn deserialize_json(json: &str, tokenizer_info: Arc<TokenizerInfo>) -> crate::Result<Self> {
        let repr: CompiledGrammarRepr = from_versioned_json(json)?;
        if repr.tokenizer_fingerprint != tokenizer_info.fingerprint() {
            return Err(Error::DeserializeFormat(
                "compiled grammar was produced for a different tokenizer".into(),
            ));
        }
        let grammar = Grammar::deserialize_json(&repr.grammar).map_err(|e| match e {
            Error::DeserializeVersion(_) | Error::DeserializeFormat(_) => e,
            other => Error::DeserializeFormat(other.to_string()),
        })?;
        let (normalized, rule_dfas) =
            lower(&grammar).map_err(|e| Error::DeserializeFormat(e.to_string()))?;
        let (state_flags, state_offsets) = compute_state_flags(&rule_dfas);

        if repr.state_masks.len() != state_flags.len() {
            return Err(Error::DeserializeFormat(format!(
                "expected {} state masks, found {}",
                state_flags.len(),
                repr.state_masks.len()
            )));
        }
        for mask in &repr.masks {
            mask.validate(&tokenizer_info)
                .map_err(|e| Error::DeserializeFormat(format!("{e:#}")))?;
        }
        let shared: Vec<Arc<AdaptiveTokenMask>> = repr.masks.into_iter().map(Arc::new).collect();
        let masks = repr
            .state_masks
            .iter()
            .map(|&i| {
                shared.get(i as usize).cloned().ok_or_else(|| {
                    Error::DeserializeFormat(format!("mask index {i} out of range"))
                })
            })
            .collect::<crate::Result<Vec<_>>>()?;

        Ok(Self::assemble(
            Arc::new(grammar),
            normalized,
            tokenizer_info,
            rule_dfas,
            state_flags,
            state_offsets,
            masks,
        ))
    }
}
