//! Grammar normalization for the automaton builder.
//!
//! Transforms a grammar into canonical form where:
//! - Every rule body is `Choices(alts)` or a leaf expression
//! - Each alternative in Choices is `Sequence(elems)` or a leaf
//! - Each element of a Sequence is a leaf: ByteString, CharacterClass,
//!   CharacterClassStar, RuleRef, Repeat, or EmptyString
//!
//! Nested sequences are spliced into their parent; nested choices inside a
//! sequence are hoisted into auxiliary rules named after the enclosing rule.

use super::builder::GrammarBuilder;
use super::{Expr, ExprId, Grammar, RuleId};

/// Normalize a grammar into canonical form. Rule ids of the input are kept.
pub(crate) fn normalize_grammar(grammar: &Grammar) -> crate::Result<Grammar> {
    let mut builder = GrammarBuilder::new();
    for rule in grammar.rules() {
        builder.add_rule(&rule.name);
    }

    for (i, rule) in grammar.rules().iter().enumerate() {
        let id = RuleId(i as u32);
        let mut cx = Normalizer {
            grammar,
            builder: &mut builder,
            rule_name: &rule.name,
        };
        let body = cx.expr(rule.body);
        let lookahead = rule.lookahead.as_ref().map(|la| (cx.expr(la.expr), la.is_exact));

        builder.set_rule_body(id, body);
        if let Some((expr, is_exact)) = lookahead {
            builder.set_rule_lookahead(id, expr, is_exact);
        }
    }

    builder.build_with_root(grammar.root_id())
}

struct Normalizer<'a> {
    grammar: &'a Grammar,
    builder: &'a mut GrammarBuilder,
    rule_name: &'a str,
}

impl Normalizer<'_> {
    fn expr(&mut self, id: ExprId) -> ExprId {
        let grammar = self.grammar;
        match grammar.get_expr(id) {
            Expr::Sequence { items } => {
                let mut elems = Vec::with_capacity(items.len());
                for &item in items {
                    self.sequence_element(item, &mut elems);
                }
                match elems.as_slice() {
                    [] => self.builder.add_empty_string(),
                    _ => self.builder.add_sequence(elems),
                }
            }
            Expr::Choices { items } => {
                let mut alts = Vec::with_capacity(items.len());
                for &item in items {
                    let target = self.singleton_target(item);
                    let normalized = match grammar.get_expr(target) {
                        Expr::Choices { .. } => self.expr(target),
                        _ => self.expr(item),
                    };
                    // Choices([A, Choices([B, C])]) → Choices([A, B, C])
                    match self.builder.peek_expr(normalized) {
                        Expr::Choices { items: inner } => alts.extend_from_slice(inner),
                        _ => alts.push(normalized),
                    }
                }
                self.builder.add_choices(alts)
            }
            leaf => self.builder.add_expr(leaf.clone()),
        }
    }

    /// Follow one-element sequences and choices down to what they wrap.
    fn singleton_target(&self, mut id: ExprId) -> ExprId {
        loop {
            match self.grammar.get_expr(id) {
                Expr::Sequence { items } | Expr::Choices { items } if items.len() == 1 => {
                    id = items[0];
                }
                _ => return id,
            }
        }
    }

    fn sequence_element(&mut self, id: ExprId, out: &mut Vec<ExprId>) {
        let grammar = self.grammar;
        match grammar.get_expr(id) {
            Expr::Sequence { items } => {
                for &item in items {
                    self.sequence_element(item, out);
                }
            }
            Expr::Choices { items } if items.len() == 1 => self.sequence_element(items[0], out),
            Expr::Choices { .. } => {
                let aux = self.builder.add_rule_unique(&format!("{}_group", self.rule_name));
                let body = self.expr(id);
                self.builder.set_rule_body(aux, body);
                out.push(self.builder.add_rule_ref(aux));
            }
            Expr::EmptyString => {}
            _ => out.push(self.expr(id)),
        }
    }
}
