//! Finite state machine construction and conversion.
//!
//! Provides a mutable `NfaGraph` for construction, an immutable `DfaTable`
//! for matching, and subset construction between the two. Every grammar
//! rule gets its own automaton; references to other rules stay as
//! `RuleRef` edges that the stack parser expands at match time.
//!
//! Edge types:
//! - `CharRange { min, max }`: byte range transition `[min, max]`
//! - `Epsilon`: free transition (NFA only)
//! - `RuleRef(RuleId)`: reference to another grammar rule

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use anyhow::{bail, Result};
use rustc_hash::{FxHashMap, FxHashSet};

use crate::grammar::{Expr, ExprId, Grammar, RuleId};

/// Sentinel in the byte table for "no transition".
pub(crate) const NO_TRANSITION: u16 = 0xFFFF;

/// Largest repetition count that is unrolled into the enclosing automaton.
const MAX_INLINED_REPEAT: u32 = 32;

/// A state index in an FSM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct StateId(pub u32);

/// An edge in the FSM.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) enum FsmEdge {
    /// Transition on a byte in `[min, max]` (inclusive).
    CharRange { min: u8, max: u8, target: StateId },
    /// Free (epsilon) transition.
    Epsilon(StateId),
    /// After the referenced rule matches, continue at `target`.
    RuleRef { rule: RuleId, target: StateId },
}

/// A mutable finite state machine in adjacency-list form.
///
/// Used during construction; convert to `DfaTable` for matching.
#[derive(Debug, Clone, Default)]
pub(crate) struct NfaGraph {
    edges: Vec<Vec<FsmEdge>>,
}

impl NfaGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_state(&mut self) -> StateId {
        let id = StateId(self.edges.len() as u32);
        self.edges.push(Vec::new());
        id
    }

    pub fn num_states(&self) -> usize {
        self.edges.len()
    }

    pub fn add_edge(&mut self, from: StateId, edge: FsmEdge) {
        self.edges[from.0 as usize].push(edge);
    }

    pub fn add_char_edge(&mut self, from: StateId, min: u8, max: u8, target: StateId) {
        self.add_edge(from, FsmEdge::CharRange { min, max, target });
    }

    pub fn add_epsilon(&mut self, from: StateId, target: StateId) {
        self.add_edge(from, FsmEdge::Epsilon(target));
    }

    pub fn add_rule_ref(&mut self, from: StateId, rule: RuleId, target: StateId) {
        self.add_edge(from, FsmEdge::RuleRef { rule, target });
    }

    pub fn edges(&self, state: StateId) -> &[FsmEdge] {
        &self.edges[state.0 as usize]
    }

    /// Epsilon closure of a set of states (BFS).
    pub fn epsilon_closure(&self, states: &BTreeSet<StateId>) -> BTreeSet<StateId> {
        let mut closure = states.clone();
        let mut queue: VecDeque<StateId> = states.iter().copied().collect();

        while let Some(s) = queue.pop_front() {
            for edge in &self.edges[s.0 as usize] {
                if let FsmEdge::Epsilon(target) = edge {
                    if closure.insert(*target) {
                        queue.push_back(*target);
                    }
                }
            }
        }
        closure
    }

    /// Convert to the compact, table-driven representation. Only meaningful
    /// for deterministic graphs: overlapping byte ranges keep the last edge.
    pub fn to_compact(&self) -> DfaTable {
        let num_states = self.edges.len();
        let mut rule_edges = Vec::new();
        let mut rule_offsets = Vec::with_capacity(num_states + 1);
        let mut byte_table = vec![NO_TRANSITION; num_states * 256];
        let mut has_char_edges = vec![false; num_states];

        for (s, state_edges) in self.edges.iter().enumerate() {
            rule_offsets.push(rule_edges.len() as u32);
            for edge in state_edges {
                match edge {
                    FsmEdge::CharRange { min, max, target } => {
                        has_char_edges[s] = true;
                        for b in *min..=*max {
                            byte_table[s * 256 + b as usize] = target.0 as u16;
                        }
                    }
                    FsmEdge::RuleRef { rule, target } => rule_edges.push((*rule, *target)),
                    FsmEdge::Epsilon(_) => {}
                }
            }
        }
        rule_offsets.push(rule_edges.len() as u32);

        DfaTable {
            rule_edges,
            rule_offsets,
            byte_table,
            has_char_edges,
        }
    }
}

/// Immutable compact DFA.
///
/// Byte transitions live in a 256-entry row per state; rule-reference edges
/// are stored flat, indexed by per-state offsets.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct DfaTable {
    rule_edges: Vec<(RuleId, StateId)>,
    rule_offsets: Vec<u32>,
    /// `byte_table[state * 256 + byte]` → target state, `NO_TRANSITION` if none.
    byte_table: Vec<u16>,
    has_char_edges: Vec<bool>,
}

impl DfaTable {
    pub fn num_states(&self) -> usize {
        self.rule_offsets.len() - 1
    }

    /// Rule-reference edges leaving `state`.
    pub fn rule_edges(&self, state: StateId) -> &[(RuleId, StateId)] {
        let s = state.0 as usize;
        let start = self.rule_offsets[s] as usize;
        let end = self.rule_offsets[s + 1] as usize;
        &self.rule_edges[start..end]
    }

    pub fn has_char_edges(&self, state: StateId) -> bool {
        self.has_char_edges[state.0 as usize]
    }

    #[inline(always)]
    pub fn byte_table(&self) -> &[u16] {
        &self.byte_table
    }

    #[inline(always)]
    pub fn next_state(&self, from: StateId, value: u8) -> Option<StateId> {
        let target = self.byte_table[from.0 as usize * 256 + value as usize];
        (target != NO_TRANSITION).then_some(StateId(target as u32))
    }

    pub fn memory_size_bytes(&self) -> usize {
        self.rule_edges.len() * std::mem::size_of::<(RuleId, StateId)>()
            + self.rule_offsets.len() * 4
            + self.byte_table.len() * 2
            + self.has_char_edges.len()
    }
}

/// An FSM with designated start and accepting states.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct Automaton<F> {
    pub fsm: F,
    pub start: StateId,
    /// `ends[i]` is true if state `i` is accepting.
    pub ends: Vec<bool>,
}

impl<F> Automaton<F> {
    pub fn is_end(&self, state: StateId) -> bool {
        self.ends.get(state.0 as usize).copied().unwrap_or(false)
    }
}

impl Automaton<NfaGraph> {
    /// NFA simulation.
    #[cfg(test)]
    pub fn accepts(&self, input: &[u8]) -> bool {
        let mut current = self.fsm.epsilon_closure(&BTreeSet::from([self.start]));

        for &byte in input {
            let mut next = BTreeSet::new();
            for &state in &current {
                for edge in self.fsm.edges(state) {
                    if let FsmEdge::CharRange { min, max, target } = edge {
                        if (*min..=*max).contains(&byte) {
                            next.insert(*target);
                        }
                    }
                }
            }
            if next.is_empty() {
                return false;
            }
            current = self.fsm.epsilon_closure(&next);
        }

        current.iter().any(|s| self.is_end(*s))
    }

    /// Subset construction. Rule-reference edges on the same rule are merged,
    /// so the result is deterministic on bytes and on rule completions.
    pub fn to_dfa(&self) -> Result<Automaton<NfaGraph>> {
        let mut dfa = NfaGraph::new();
        let mut dfa_ends = Vec::new();
        let mut state_map: FxHashMap<BTreeSet<StateId>, StateId> = FxHashMap::default();
        let mut worklist: VecDeque<BTreeSet<StateId>> = VecDeque::new();

        let mut intern = |set: BTreeSet<StateId>,
                          dfa: &mut NfaGraph,
                          worklist: &mut VecDeque<BTreeSet<StateId>>|
         -> Result<StateId> {
            if let Some(&existing) = state_map.get(&set) {
                return Ok(existing);
            }
            if dfa.num_states() + 1 >= NO_TRANSITION as usize {
                bail!("rule automaton exceeds {} states", NO_TRANSITION);
            }
            let id = dfa.add_state();
            dfa_ends.push(set.iter().any(|s| self.is_end(*s)));
            state_map.insert(set.clone(), id);
            worklist.push_back(set);
            Ok(id)
        };

        let start_set = self.fsm.epsilon_closure(&BTreeSet::from([self.start]));
        let dfa_start = intern(start_set, &mut dfa, &mut worklist)?;

        let mut index = 0u32;
        while let Some(nfa_states) = worklist.pop_front() {
            // States are interned in worklist order.
            let dfa_state = StateId(index);
            index += 1;

            for (min, max, targets) in self.collect_intervals(&nfa_states) {
                let target_set = self.fsm.epsilon_closure(&targets);
                let target = intern(target_set, &mut dfa, &mut worklist)?;
                dfa.add_char_edge(dfa_state, min, max, target);
            }

            let mut by_rule: BTreeMap<RuleId, BTreeSet<StateId>> = BTreeMap::new();
            for &nfa_state in &nfa_states {
                for edge in self.fsm.edges(nfa_state) {
                    if let FsmEdge::RuleRef { rule, target } = edge {
                        by_rule.entry(*rule).or_default().insert(*target);
                    }
                }
            }
            for (rule, targets) in by_rule {
                let target_set = self.fsm.epsilon_closure(&targets);
                let target = intern(target_set, &mut dfa, &mut worklist)?;
                dfa.add_rule_ref(dfa_state, rule, target);
            }
        }

        Ok(Automaton {
            fsm: dfa,
            start: dfa_start,
            ends: dfa_ends,
        })
    }

    /// Split the char-range edges leaving `nfa_states` into non-overlapping
    /// intervals, each mapped to the union of targets reachable on it.
    fn collect_intervals(&self, nfa_states: &BTreeSet<StateId>) -> Vec<(u8, u8, BTreeSet<StateId>)> {
        let mut ranges: Vec<(u8, u8, StateId)> = Vec::new();
        for &state in nfa_states {
            for edge in self.fsm.edges(state) {
                if let FsmEdge::CharRange { min, max, target } = edge {
                    ranges.push((*min, *max, *target));
                }
            }
        }
        if ranges.is_empty() {
            return Vec::new();
        }

        let mut points: BTreeSet<u16> = BTreeSet::new();
        for &(min, max, _) in &ranges {
            points.insert(min as u16);
            points.insert(max as u16 + 1);
        }
        let points: Vec<u16> = points.into_iter().collect();

        let mut merged: Vec<(u8, u8, BTreeSet<StateId>)> = Vec::new();
        for pair in points.windows(2) {
            let (start, end) = (pair[0], pair[1] - 1);
            let targets: BTreeSet<StateId> = ranges
                .iter()
                .filter(|&&(min, max, _)| min as u16 <= start && end <= max as u16)
                .map(|&(_, _, t)| t)
                .collect();
            if targets.is_empty() {
                continue;
            }
            if let Some(last) = merged.last_mut() {
                if last.2 == targets && last.1 as u16 + 1 == start {
                    last.1 = end as u8;
                    continue;
                }
            }
            merged.push((start as u8, end as u8, targets));
        }
        merged
    }

    pub fn to_compact(&self) -> Automaton<DfaTable> {
        Automaton {
            fsm: self.fsm.to_compact(),
            start: self.start,
            ends: self.ends.clone(),
        }
    }
}

impl Automaton<DfaTable> {
    #[cfg(test)]
    pub fn accepts(&self, input: &[u8]) -> bool {
        let mut state = self.start;
        for &byte in input {
            match self.fsm.next_state(state, byte) {
                Some(next) => state = next,
                None => return false,
            }
        }
        self.is_end(state)
    }
}

// ─── UTF-8 byte-level construction for character classes ─────────────

fn effective_ranges(negated: bool, ranges: &[(u32, u32)]) -> Vec<(u32, u32)> {
    if negated {
        complement_codepoint_ranges(ranges)
    } else {
        ranges.to_vec()
    }
}

/// All Unicode scalar values NOT in `ranges`.
fn complement_codepoint_ranges(ranges: &[(u32, u32)]) -> Vec<(u32, u32)> {
    let mut sorted = ranges.to_vec();
    sorted.sort_unstable_by_key(|&(lo, _)| lo);
    let mut merged: Vec<(u32, u32)> = Vec::new();
    for (lo, hi) in sorted {
        if let Some(last) = merged.last_mut() {
            if lo <= last.1.saturating_add(1) {
                last.1 = last.1.max(hi);
                continue;
            }
        }
        merged.push((lo, hi));
    }

    let mut complement = Vec::new();
    let mut next: u32 = 0;
    for &(lo, hi) in &merged {
        if lo > next {
            complement.push((next, lo - 1));
        }
        next = next.max(hi.saturating_add(1));
    }
    if next <= 0x10FFFF {
        complement.push((next, 0x10FFFF));
    }
    complement
}

/// Byte paths from `start` to `end` for every scalar value in `[lo, hi]`.
/// Surrogates are skipped.
fn add_codepoint_range(fsm: &mut NfaGraph, lo: u32, hi: u32, start: StateId, end: StateId) {
    const SPANS: [(u32, u32); 5] = [
        (0x0, 0x7F),
        (0x80, 0x7FF),
        (0x800, 0xD7FF),
        (0xE000, 0xFFFF),
        (0x10000, 0x10FFFF),
    ];
    for (span_lo, span_hi) in SPANS {
        let (a, b) = (lo.max(span_lo), hi.min(span_hi));
        if a > b {
            continue;
        }
        let (Some(a), Some(b)) = (char::from_u32(a), char::from_u32(b)) else {
            continue;
        };
        let (mut lo_buf, mut hi_buf) = ([0u8; 4], [0u8; 4]);
        let lo_bytes = a.encode_utf8(&mut lo_buf).as_bytes();
        let hi_bytes = b.encode_utf8(&mut hi_buf).as_bytes();
        add_utf8_byte_range(fsm, lo_bytes, hi_bytes, 0, start, end);
    }
}

/// Paths for all equal-length UTF-8 sequences between `lo` and `hi`,
/// splitting on the byte at `depth`.
fn add_utf8_byte_range(
    fsm: &mut NfaGraph,
    lo: &[u8],
    hi: &[u8],
    depth: usize,
    start: StateId,
    end: StateId,
) {
    if depth + 1 == lo.len() {
        fsm.add_char_edge(start, lo[depth], hi[depth], end);
        return;
    }

    if lo[depth] == hi[depth] {
        let mid = fsm.add_state();
        fsm.add_char_edge(start, lo[depth], lo[depth], mid);
        add_utf8_byte_range(fsm, lo, hi, depth + 1, mid, end);
        return;
    }

    // lo[depth] followed by lo's suffix up to 0xBF...
    let s = fsm.add_state();
    fsm.add_char_edge(start, lo[depth], lo[depth], s);
    let mut upper = lo.to_vec();
    upper[depth + 1..].fill(0xBF);
    add_utf8_byte_range(fsm, lo, &upper, depth + 1, s, end);

    // every byte strictly between, with any continuation
    if lo[depth] + 1 < hi[depth] {
        let s = fsm.add_state();
        fsm.add_char_edge(start, lo[depth] + 1, hi[depth] - 1, s);
        let mut lower = lo.to_vec();
        let mut upper = hi.to_vec();
        lower[depth + 1..].fill(0x80);
        upper[depth + 1..].fill(0xBF);
        add_utf8_byte_range(fsm, &lower, &upper, depth + 1, s, end);
    }

    // hi[depth] followed by 0x80... up to hi's suffix
    let s = fsm.add_state();
    fsm.add_char_edge(start, hi[depth], hi[depth], s);
    let mut lower = hi.to_vec();
    lower[depth + 1..].fill(0x80);
    add_utf8_byte_range(fsm, &lower, hi, depth + 1, s, end);
}

// ─── Grammar → per-rule NFAs ─────────────────────────────────────────

/// Whether an expression contains only byte-level operations and references
/// to rules already known to be inlineable.
fn is_inlineable(grammar: &Grammar, expr_id: ExprId, known: &FxHashSet<RuleId>) -> bool {
    match grammar.get_expr(expr_id) {
        Expr::EmptyString
        | Expr::ByteString { .. }
        | Expr::CharacterClass { .. }
        | Expr::CharacterClassStar { .. } => true,
        Expr::RuleRef { rule } => known.contains(rule),
        Expr::Repeat { rule, min, max } => {
            known.contains(rule) && max.unwrap_or(*min).max(*min) <= MAX_INLINED_REPEAT
        }
        Expr::Sequence { items } | Expr::Choices { items } => {
            items.iter().all(|e| is_inlineable(grammar, *e, known))
        }
    }
}

/// Rules whose bodies can be built directly into the referencing automaton.
/// Recursive rules and rules with a lookahead never qualify.
fn find_inlineable_rules(grammar: &Grammar) -> FxHashSet<RuleId> {
    let mut inlineable = FxHashSet::default();
    loop {
        let mut changed = false;
        for (i, rule) in grammar.rules().iter().enumerate() {
            let rid = RuleId(i as u32);
            if rule.lookahead.is_none()
                && !inlineable.contains(&rid)
                && is_inlineable(grammar, rule.body, &inlineable)
            {
                inlineable.insert(rid);
                changed = true;
            }
        }
        if !changed {
            return inlineable;
        }
    }
}

struct NfaBuilder<'a> {
    grammar: &'a Grammar,
    inlineable: &'a FxHashSet<RuleId>,
    fsm: NfaGraph,
}

impl NfaBuilder<'_> {
    /// Wire `start → end` through a loop state so repetitions never re-enter
    /// states shared with sibling alternatives.
    fn star(&mut self, start: StateId, end: StateId, body: impl Fn(&mut Self, StateId, StateId)) {
        let hub = self.fsm.add_state();
        let back = self.fsm.add_state();
        self.fsm.add_epsilon(start, hub);
        self.fsm.add_epsilon(hub, end);
        body(self, hub, back);
        self.fsm.add_epsilon(back, hub);
    }

    /// `min` mandatory then `max - min` optional copies of `body`.
    fn repeat(
        &mut self,
        min: u32,
        max: Option<u32>,
        start: StateId,
        end: StateId,
        body: impl Fn(&mut Self, StateId, StateId),
    ) {
        let mut prev = start;
        for _ in 0..min {
            let next = self.fsm.add_state();
            body(self, prev, next);
            prev = next;
        }
        match max {
            None => self.star(prev, end, body),
            Some(max) => {
                for _ in min..max {
                    let next = self.fsm.add_state();
                    self.fsm.add_epsilon(prev, end);
                    body(self, prev, next);
                    prev = next;
                }
                self.fsm.add_epsilon(prev, end);
            }
        }
    }

    fn build(&mut self, expr_id: ExprId, start: StateId, end: StateId) {
        let grammar = self.grammar;
        match grammar.get_expr(expr_id) {
            Expr::EmptyString => self.fsm.add_epsilon(start, end),

            Expr::ByteString { bytes } => {
                let mut prev = start;
                for (i, &byte) in bytes.iter().enumerate() {
                    let next = if i + 1 == bytes.len() {
                        end
                    } else {
                        self.fsm.add_state()
                    };
                    self.fsm.add_char_edge(prev, byte, byte, next);
                    prev = next;
                }
                if bytes.is_empty() {
                    self.fsm.add_epsilon(start, end);
                }
            }

            Expr::CharacterClass { negated, ranges } => {
                for (lo, hi) in effective_ranges(*negated, ranges) {
                    add_codepoint_range(&mut self.fsm, lo, hi, start, end);
                }
            }

            Expr::CharacterClassStar { negated, ranges } => {
                let ranges = effective_ranges(*negated, ranges);
                self.star(start, end, |b, from, to| {
                    for &(lo, hi) in &ranges {
                        add_codepoint_range(&mut b.fsm, lo, hi, from, to);
                    }
                });
            }

            Expr::RuleRef { rule } if self.inlineable.contains(rule) => {
                self.build(grammar.rule(*rule).body, start, end);
            }
            Expr::RuleRef { rule } => self.fsm.add_rule_ref(start, *rule, end),

            Expr::Sequence { items } => {
                let mut prev = start;
                for (i, &eid) in items.iter().enumerate() {
                    let next = if i + 1 == items.len() {
                        end
                    } else {
                        self.fsm.add_state()
                    };
                    self.build(eid, prev, next);
                    prev = next;
                }
                if items.is_empty() {
                    self.fsm.add_epsilon(start, end);
                }
            }

            Expr::Choices { items } => {
                for &eid in items {
                    self.build(eid, start, end);
                }
            }

            Expr::Repeat { rule, min, max } => {
                let rule = *rule;
                if self.inlineable.contains(&rule)
                    && max.unwrap_or(*min).max(*min) <= MAX_INLINED_REPEAT
                {
                    let body = grammar.rule(rule).body;
                    self.repeat(*min, *max, start, end, |b, from, to| b.build(body, from, to));
                } else {
                    self.repeat(*min, *max, start, end, |b, from, to| {
                        b.fsm.add_rule_ref(from, rule, to)
                    });
                }
            }
        }
    }
}

/// Per-rule NFAs, indexed by rule id.
pub(crate) fn build_rule_nfas(grammar: &Grammar) -> Vec<Automaton<NfaGraph>> {
    let inlineable = find_inlineable_rules(grammar);

    grammar
        .rules()
        .iter()
        .map(|rule| {
            let mut builder = NfaBuilder {
                grammar,
                inlineable: &inlineable,
                fsm: NfaGraph::new(),
            };
            let start = builder.fsm.add_state();
            let end = builder.fsm.add_state();
            builder.build(rule.body, start, end);

            let mut ends = vec![false; builder.fsm.num_states()];
            ends[end.0 as usize] = true;
            Automaton {
                fsm: builder.fsm,
                start,
                ends,
            }
        })
        .collect()
}

/// Per-rule compact DFAs, indexed by rule id.
pub(crate) fn build_rule_dfas(grammar: &Grammar) -> Result<Vec<Automaton<DfaTable>>> {
    if grammar.num_rules() >= u16::MAX as usize {
        bail!("grammar has {} rules, more than {} are not supported", grammar.num_rules(), u16::MAX - 1);
    }
    build_rule_nfas(grammar)
        .iter()
        .zip(grammar.rules())
        .map(|(nfa, rule)| {
            let dfa = nfa
                .to_dfa()
                .map_err(|e| e.context(format!("while building automaton for rule `{}`", rule.name)))?;
            Ok(dfa.to_compact())
        })
        .collect()
}
