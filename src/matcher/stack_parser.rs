//! DFA-based pushdown automaton (stack parser).
//!
//! `StackParser` drives per-rule DFA transitions with a pushdown stack. The
//! DFA encodes all intra-rule transitions, so predict/complete cycles are only
//! needed at rule boundaries (rule-reference edges and accepting states).
//!
//! The parser keeps one *level* per consumed byte. A level holds the states
//! that can scan the next byte and the return entries recorded while it was
//! built; a state points back at the level where its rule was entered, which
//! lets alternative parses share their ancestors.

use std::hash::{Hash, Hasher};
use std::sync::Arc;

use rustc_hash::FxHashSet;
use smallvec::SmallVec;

use crate::compiled_grammar::CompiledGrammar;
use crate::fsm::StateId;

// ---------------------------------------------------------------------------
// Stack state
// ---------------------------------------------------------------------------

pub(super) const NO_PARENT: u32 = u32::MAX;

/// Position within one rule's DFA.
///
/// Identity is (rule, DFA state, return level). `depth` counts the rule
/// expansions above this state and is carried along but never compared: the
/// first path to reach a state decides its depth.
#[derive(Debug, Clone, Copy)]
pub(super) struct StackState {
    pub(super) rule_id: u16,
    pub(super) dfa_state: u16,
    /// Level where this rule was entered (`NO_PARENT` for the root).
    pub(super) return_level: u32,
    pub(super) depth: u32,
}

impl PartialEq for StackState {
    #[inline(always)]
    fn eq(&self, other: &Self) -> bool {
        self.rule_id == other.rule_id
            && self.dfa_state == other.dfa_state
            && self.return_level == other.return_level
    }
}

impl Eq for StackState {}

impl Hash for StackState {
    #[inline(always)]
    fn hash<H: Hasher>(&self, state: &mut H) {
        let bits = (self.rule_id as u64)
            | ((self.dfa_state as u64) << 16)
            | ((self.return_level as u64) << 32);
        bits.hash(state);
    }
}

// ---------------------------------------------------------------------------
// SmallDedup: linear scan for small sets, FxHashSet above threshold
// ---------------------------------------------------------------------------

const SMALL_DEDUP_THRESHOLD: usize = 12;

pub(super) struct SmallDedup<T: Eq + Hash + Copy> {
    vec: Vec<T>,
    set: Option<FxHashSet<T>>,
}

impl<T: Eq + Hash + Copy> Default for SmallDedup<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Eq + Hash + Copy> SmallDedup<T> {
    pub(super) fn new() -> Self {
        Self { vec: Vec::new(), set: None }
    }

    fn clear(&mut self) {
        self.vec.clear();
        if let Some(ref mut set) = self.set {
            set.clear();
        }
    }

    fn insert(&mut self, item: T) -> bool {
        if let Some(ref mut set) = self.set {
            if set.insert(item) {
                self.vec.push(item);
                return true;
            }
            return false;
        }

        if self.vec.iter().any(|x| *x == item) {
            return false;
        }
        self.vec.push(item);

        if self.vec.len() >= SMALL_DEDUP_THRESHOLD {
            self.set = Some(self.vec.iter().copied().collect());
        }
        true
    }
}

// ---------------------------------------------------------------------------
// Stack parser
// ---------------------------------------------------------------------------

pub(super) struct StackParser {
    compiled: Arc<CompiledGrammar>,
    /// Rule expansions nested deeper than this are not predicted.
    max_depth: u32,
    /// Flat arena of scanable states across all levels.
    state_arena: Vec<StackState>,
    /// Start offset of each level in `state_arena`.
    state_offsets: Vec<usize>,
    /// Flat arena of return entries: (expected_rule_id, parent_state_after_advance).
    return_arena: Vec<(u16, StackState)>,
    /// Start offset of each level in `return_arena`.
    return_offsets: Vec<usize>,
    /// Whether the root rule can end at each level.
    is_completed: Vec<bool>,
    // Reusable scratch buffers
    buf_queue: Vec<StackState>,
    buf_visited: SmallDedup<StackState>,
    buf_scanable: Vec<StackState>,
    buf_return: Vec<(u16, StackState)>,
}

impl StackParser {
    pub(super) fn new(compiled: Arc<CompiledGrammar>, max_depth: usize) -> Self {
        let mut parser = Self {
            compiled,
            max_depth: max_depth.min(u32::MAX as usize) as u32,
            state_arena: Vec::with_capacity(128),
            state_offsets: Vec::with_capacity(32),
            return_arena: Vec::with_capacity(64),
            return_offsets: Vec::with_capacity(32),
            is_completed: Vec::with_capacity(32),
            buf_queue: Vec::new(),
            buf_visited: SmallDedup::new(),
            buf_scanable: Vec::new(),
            buf_return: Vec::new(),
        };
        parser.init();
        parser
    }

    /// Build level 0 by expanding the root rule.
    fn init(&mut self) {
        self.state_arena.clear();
        self.state_offsets.clear();
        self.return_arena.clear();
        self.return_offsets.clear();
        self.is_completed.clear();

        let mut queue = std::mem::take(&mut self.buf_queue);
        let mut visited = std::mem::take(&mut self.buf_visited);
        let mut scanable = std::mem::take(&mut self.buf_scanable);
        let mut returns = std::mem::take(&mut self.buf_return);
        queue.clear();
        visited.clear();
        scanable.clear();
        returns.clear();
        let mut accept_stop = false;

        let root = self.compiled.root_rule();
        self.expand_rule(root, NO_PARENT, 0, &mut queue, &mut visited);
        self.process_queue(&mut queue, &mut visited, &mut scanable, &mut returns, &mut accept_stop);

        self.push_level(&scanable, &returns, accept_stop);
        self.restore_buffers(queue, visited, scanable, returns);
    }

    /// Advance the parser by one byte. Returns false, leaving the parser
    /// untouched, when no parse survives the byte.
    pub(super) fn advance(&mut self, ch: u8) -> bool {
        let state_start = match self.state_offsets.last() {
            Some(&start) => start,
            None => return false,
        };

        let mut queue = std::mem::take(&mut self.buf_queue);
        let mut visited = std::mem::take(&mut self.buf_visited);
        let mut scanable = std::mem::take(&mut self.buf_scanable);
        let mut returns = std::mem::take(&mut self.buf_return);
        queue.clear();
        visited.clear();
        scanable.clear();
        returns.clear();

        self.scan_states(&self.state_arena[state_start..], ch, &mut queue, &mut visited, &mut scanable);

        let mut accept_stop = false;
        if !queue.is_empty() {
            self.process_queue(&mut queue, &mut visited, &mut scanable, &mut returns, &mut accept_stop);
        }

        // A level with nothing to scan is only useful if the input may end here.
        let alive = !scanable.is_empty() || accept_stop;
        if alive {
            self.push_level(&scanable, &returns, accept_stop);
        }
        self.restore_buffers(queue, visited, scanable, returns);
        alive
    }

    /// Advance through all bytes in a slice. On failure, rolls back any partial
    /// progress and returns false.
    pub(super) fn advance_bytes(&mut self, bytes: &[u8]) -> bool {
        let start = self.position();
        for &byte in bytes {
            if !self.advance(byte) {
                self.pop_last_states(self.position() - start);
                return false;
            }
        }
        true
    }

    fn push_level(&mut self, scanable: &[StackState], returns: &[(u16, StackState)], accept_stop: bool) {
        self.state_offsets.push(self.state_arena.len());
        self.state_arena.extend_from_slice(scanable);
        self.return_offsets.push(self.return_arena.len());
        self.return_arena.extend_from_slice(returns);
        self.is_completed.push(accept_stop);
    }

    fn restore_buffers(
        &mut self,
        mut queue: Vec<StackState>,
        mut visited: SmallDedup<StackState>,
        mut scanable: Vec<StackState>,
        mut returns: Vec<(u16, StackState)>,
    ) {
        queue.clear();
        visited.clear();
        scanable.clear();
        returns.clear();
        self.buf_queue = queue;
        self.buf_visited = visited;
        self.buf_scanable = scanable;
        self.buf_return = returns;
    }

    /// Scan phase: advance each state by one byte via its DFA.
    ///
    /// Successors that can only scan go straight to `scanable`; everything
    /// else needs predict/complete processing and goes to `queue`.
    fn scan_states(
        &self,
        states: &[StackState],
        ch: u8,
        queue: &mut Vec<StackState>,
        visited: &mut SmallDedup<StackState>,
        scanable: &mut Vec<StackState>,
    ) {
        for &state in states {
            let dfa = &self.compiled.rule_dfas[state.rule_id as usize];
            if let Some(next_dfa) = dfa.fsm.next_state(StateId(state.dfa_state as u32), ch) {
                let next = StackState {
                    dfa_state: next_dfa.0 as u16,
                    ..state
                };
                if !visited.insert(next) {
                    continue;
                }
                let flags = self.compiled.flags(next.rule_id, next.dfa_state);
                if flags.has_char_edges() && !flags.has_rule_ref() && !flags.is_accepting() {
                    scanable.push(next);
                } else {
                    queue.push(next);
                }
            }
        }
    }

    /// Run predict/complete until fixed point.
    ///
    /// Tracks which rules completed at the current level so that when a
    /// nullable rule is predicted again (deduped by `visited`), the new parent
    /// is advanced immediately.
    fn process_queue(
        &self,
        queue: &mut Vec<StackState>,
        visited: &mut SmallDedup<StackState>,
        scanable: &mut Vec<StackState>,
        returns: &mut Vec<(u16, StackState)>,
        accept_stop: &mut bool,
    ) {
        let current_level = self.state_offsets.len() as u32;
        let mut completed_here: SmallVec<[u16; 8]> = SmallVec::new();

        let mut idx = 0;
        while idx < queue.len() {
            let state = queue[idx];
            idx += 1;

            let flags = self.compiled.flags(state.rule_id, state.dfa_state);

            // Predict
            if flags.has_rule_ref() && state.depth < self.max_depth {
                let dfa = &self.compiled.rule_dfas[state.rule_id as usize];
                for &(rule, target) in dfa.fsm.rule_edges(StateId(state.dfa_state as u32)) {
                    let child = rule.0 as u16;
                    let parent_after = StackState {
                        dfa_state: target.0 as u16,
                        ..state
                    };
                    returns.push((child, parent_after));

                    if !self.expand_rule(child, current_level, state.depth + 1, queue, visited)
                        && completed_here.contains(&child)
                        && visited.insert(parent_after)
                    {
                        queue.push(parent_after);
                    }
                }
            }

            // Complete
            if flags.is_accepting() {
                if state.return_level == current_level && !completed_here.contains(&state.rule_id) {
                    completed_here.push(state.rule_id);
                }
                self.complete(&state, queue, visited, returns, accept_stop);
            }

            if flags.has_char_edges() {
                scanable.push(state);
            }
        }
    }

    /// A rule finished: advance every parent waiting for it.
    fn complete(
        &self,
        state: &StackState,
        queue: &mut Vec<StackState>,
        visited: &mut SmallDedup<StackState>,
        returns: &[(u16, StackState)],
        accept_stop: &mut bool,
    ) {
        if state.return_level == NO_PARENT {
            *accept_stop = true;
            return;
        }

        let level = state.return_level as usize;
        let waiting = if level == self.state_offsets.len() {
            returns
        } else {
            self.returns_at(level)
        };
        for &(expected_rule, parent_after) in waiting {
            if expected_rule == state.rule_id && visited.insert(parent_after) {
                queue.push(parent_after);
            }
        }
    }

    /// Return entries recorded while building committed level `level`.
    fn returns_at(&self, level: usize) -> &[(u16, StackState)] {
        let start = self.return_offsets[level];
        let end = self
            .return_offsets
            .get(level + 1)
            .copied()
            .unwrap_or(self.return_arena.len());
        &self.return_arena[start..end]
    }

    /// Add a rule's DFA start state to the queue. Returns true if the state
    /// was new.
    fn expand_rule(
        &self,
        rule_id: u16,
        return_level: u32,
        depth: u32,
        queue: &mut Vec<StackState>,
        visited: &mut SmallDedup<StackState>,
    ) -> bool {
        let dfa = &self.compiled.rule_dfas[rule_id as usize];
        let state = StackState {
            rule_id,
            dfa_state: dfa.start.0 as u16,
            return_level,
            depth,
        };
        if visited.insert(state) {
            queue.push(state);
            true
        } else {
            false
        }
    }

    /// Whether the root rule can end at the current position.
    pub(super) fn is_completed(&self) -> bool {
        self.is_completed.last().copied().unwrap_or(false)
    }

    /// The states that can scan the next byte.
    pub(super) fn current_states(&self) -> &[StackState] {
        match self.state_offsets.last() {
            Some(&start) => &self.state_arena[start..],
            None => &[],
        }
    }

    /// Number of bytes consumed.
    pub(super) fn position(&self) -> usize {
        self.state_offsets.len().saturating_sub(1)
    }

    /// Pop the last `count` byte levels. Level 0 is never popped.
    pub(super) fn pop_last_states(&mut self, count: usize) {
        for _ in 0..count.min(self.position()) {
            if let (Some(start), Some(rstart)) = (self.state_offsets.pop(), self.return_offsets.pop()) {
                self.state_arena.truncate(start);
                self.return_arena.truncate(rstart);
                self.is_completed.pop();
            }
        }
    }

    pub(super) fn reset(&mut self) {
        self.init();
    }

    /// Total states and return entries held across all levels.
    pub(super) fn arena_sizes(&self) -> (usize, usize) {
        (self.state_arena.len(), self.return_arena.len())
    }
}
