//! Single-DFA fast path engine.
//!
//! When the root rule's DFA references no other rule, the whole grammar is
//! one DFA and this engine replaces the stack parser with raw
//! `byte_table[state * 256 + byte]` lookups.

use std::collections::VecDeque;

use crate::compiled_grammar::CompiledGrammar;
use crate::fsm::{StateId, NO_TRANSITION};

pub(super) struct SingleDfaEngine {
    pub(super) rule_idx: usize,
    pub(super) state: u16,
    /// State before each accepted token, oldest first.
    pub(super) history: VecDeque<u16>,
}

impl SingleDfaEngine {
    pub(super) fn new(compiled: &CompiledGrammar) -> Self {
        let rule_idx = compiled.root_rule() as usize;
        Self {
            rule_idx,
            state: compiled.rule_dfas[rule_idx].start.0 as u16,
            history: VecDeque::new(),
        }
    }

    /// Advance through all bytes. On success, pushes the previous state to
    /// history; on failure, returns false without modifying state.
    pub(super) fn advance_bytes(&mut self, compiled: &CompiledGrammar, bytes: &[u8]) -> bool {
        let bt = compiled.rule_dfas[self.rule_idx].fsm.byte_table();
        let mut state = self.state as usize;
        for &byte in bytes {
            let next = bt[state * 256 + byte as usize];
            if next == NO_TRANSITION {
                return false;
            }
            state = next as usize;
        }
        self.history.push_back(self.state);
        self.state = state as u16;
        true
    }

    pub(super) fn is_completed(&self, compiled: &CompiledGrammar) -> bool {
        compiled.rule_dfas[self.rule_idx].is_end(StateId(self.state as u32))
    }

    /// Undo the most recent token.
    pub(super) fn rollback_one(&mut self) {
        if let Some(prev) = self.history.pop_back() {
            self.state = prev;
        }
    }

    pub(super) fn reset(&mut self, compiled: &CompiledGrammar) {
        self.state = compiled.rule_dfas[self.rule_idx].start.0 as u16;
        self.history.clear();
    }

    /// Bytes forced by the DFA from the current state, stopping at the first
    /// accepting state or branch.
    pub(super) fn find_jump_forward(&self, compiled: &CompiledGrammar, limit: usize) -> Vec<u8> {
        let dfa = &compiled.rule_dfas[self.rule_idx];
        let mut result = Vec::new();
        let mut state = StateId(self.state as u32);
        while result.len() < limit && !dfa.is_end(state) {
            let Some(byte) = super::deterministic_byte(&dfa.fsm, state) else {
                break;
            };
            let Some(next) = dfa.fsm.next_state(state, byte) else {
                break;
            };
            result.push(byte);
            state = next;
        }
        result
    }

    /// Fill the row from the pre-computed mask of the current state.
    ///
    /// Without rule references, a token that runs past an accepting state has
    /// nowhere to go, so the mask's uncertain tokens are all rejected.
    pub(super) fn fill_bitmask(&self, compiled: &CompiledGrammar, row: &mut [u32]) {
        compiled
            .mask(self.rule_idx as u16, self.state)
            .apply_accepted(row);
    }
}
