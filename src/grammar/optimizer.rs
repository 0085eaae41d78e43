use std::collections::VecDeque;

use rustc_hash::FxHashSet;

use super::builder::GrammarBuilder;
use super::{Expr, ExprId, Grammar, RuleId};

impl Grammar {
    /// Optimize the grammar by inlining single-use rules and eliminating dead code.
    pub(crate) fn optimize(&self) -> crate::Result<Grammar> {
        self.eliminate_dead_rules()?
            .inline_single_use_rules()?
            .eliminate_dead_rules()
    }

    /// Remove rules that are not reachable from the root rule.
    pub(crate) fn eliminate_dead_rules(&self) -> crate::Result<Grammar> {
        let reachable = self.find_reachable_rules();
        if reachable.len() == self.rules.len() {
            return Ok(self.clone());
        }
        let keep: Vec<bool> = (0..self.rules.len())
            .map(|i| reachable.contains(&RuleId(i as u32)))
            .collect();
        Rewriter::new(self, keep, vec![false; self.rules.len()]).run()
    }

    /// Inline rules that are referenced exactly once via `RuleRef` (not `Repeat`).
    ///
    /// The inlined rules remain in the grammar but become dead code,
    /// removable by a subsequent `eliminate_dead_rules()` call.
    pub(crate) fn inline_single_use_rules(&self) -> crate::Result<Grammar> {
        let mut ref_counts = vec![0u32; self.rules.len()];
        let mut repeat_rules: FxHashSet<RuleId> = FxHashSet::default();

        // Count references reachable from rule bodies and lookaheads; arena
        // slots that nothing points at do not count.
        let mut stack: Vec<ExprId> = self
            .rules
            .iter()
            .flat_map(|r| std::iter::once(r.body).chain(r.lookahead.as_ref().map(|la| la.expr)))
            .collect();
        while let Some(id) = stack.pop() {
            let expr = self.get_expr(id);
            match expr {
                Expr::RuleRef { rule } => ref_counts[rule.0 as usize] += 1,
                Expr::Repeat { rule, .. } => {
                    repeat_rules.insert(*rule);
                    ref_counts[rule.0 as usize] += 1;
                }
                _ => stack.extend_from_slice(expr.children()),
            }
        }

        let inline: Vec<bool> = self
            .rules
            .iter()
            .enumerate()
            .map(|(i, rule)| {
                let id = RuleId(i as u32);
                id != self.root_rule
                    && ref_counts[i] == 1
                    && !repeat_rules.contains(&id)
                    && rule.lookahead.is_none()
            })
            .collect();

        if !inline.contains(&true) {
            return Ok(self.clone());
        }
        Rewriter::new(self, vec![true; self.rules.len()], inline).run()
    }

    fn find_reachable_rules(&self) -> FxHashSet<RuleId> {
        let mut reachable = FxHashSet::default();
        let mut queue = VecDeque::new();

        reachable.insert(self.root_rule);
        queue.push_back(self.root_rule);

        while let Some(rule_id) = queue.pop_front() {
            let rule = &self.rules[rule_id.0 as usize];
            self.collect_rule_refs(rule.body, &mut reachable, &mut queue);
            if let Some(ref la) = rule.lookahead {
                self.collect_rule_refs(la.expr, &mut reachable, &mut queue);
            }
        }

        reachable
    }

    fn collect_rule_refs(
        &self,
        expr_id: ExprId,
        reachable: &mut FxHashSet<RuleId>,
        queue: &mut VecDeque<RuleId>,
    ) {
        let expr = self.get_expr(expr_id);
        if let Some(rule) = expr.referenced_rule() {
            if reachable.insert(rule) {
                queue.push_back(rule);
            }
        }
        for &child in expr.children() {
            self.collect_rule_refs(child, reachable, queue);
        }
    }
}

/// Copies the kept rules into a fresh arena, splicing the bodies of inlined
/// rules in place of their single reference.
struct Rewriter<'a> {
    grammar: &'a Grammar,
    keep: Vec<bool>,
    inline: Vec<bool>,
    remap: Vec<Option<RuleId>>,
    in_progress: FxHashSet<RuleId>,
    builder: GrammarBuilder,
}

impl<'a> Rewriter<'a> {
    fn new(grammar: &'a Grammar, keep: Vec<bool>, inline: Vec<bool>) -> Self {
        Self {
            grammar,
            keep,
            inline,
            remap: vec![None; grammar.num_rules()],
            in_progress: FxHashSet::default(),
            builder: GrammarBuilder::new(),
        }
    }

    fn run(mut self) -> crate::Result<Grammar> {
        let grammar = self.grammar;
        for (i, rule) in grammar.rules().iter().enumerate() {
            if self.keep[i] {
                self.remap[i] = Some(self.builder.add_rule(&rule.name));
            }
        }

        for (i, rule) in grammar.rules().iter().enumerate() {
            let Some(new_id) = self.remap[i] else {
                continue;
            };
            self.in_progress.insert(RuleId(i as u32));
            let body = self.copy(rule.body);
            self.builder.set_rule_body(new_id, body);
            if let Some(la) = &rule.lookahead {
                let expr = self.copy(la.expr);
                self.builder.set_rule_lookahead(new_id, expr, la.is_exact);
            }
            self.in_progress.remove(&RuleId(i as u32));
        }

        let Some(root) = self.remap[grammar.root_id().0 as usize] else {
            return Err(crate::Error::GrammarSyntax("root rule was removed".into()));
        };
        self.builder.build_with_root(root)
    }

    fn mapped(&self, rule: RuleId) -> RuleId {
        // Only reachable rules are referenced from kept bodies.
        self.remap[rule.0 as usize].unwrap_or(rule)
    }

    fn copy(&mut self, id: ExprId) -> ExprId {
        let grammar = self.grammar;
        match grammar.get_expr(id) {
            Expr::RuleRef { rule }
                if self.inline[rule.0 as usize] && !self.in_progress.contains(rule) =>
            {
                let rule = *rule;
                self.in_progress.insert(rule);
                let body = self.copy(grammar.rule(rule).body);
                self.in_progress.remove(&rule);
                body
            }
            Expr::RuleRef { rule } => {
                let rule = self.mapped(*rule);
                self.builder.add_rule_ref(rule)
            }
            Expr::Repeat { rule, min, max } => {
                let rule = self.mapped(*rule);
                self.builder.add_repeat(rule, *min, *max)
            }
            Expr::Sequence { items } => {
                let items = items.iter().map(|&e| self.copy(e)).collect();
                self.builder.add_sequence(items)
            }
            Expr::Choices { items } => {
                let items = items.iter().map(|&e| self.copy(e)).collect();
                self.builder.add_choices(items)
            }
            leaf => self.builder.add_expr(leaf.clone()),
        }
    }
}
