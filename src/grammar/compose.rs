//! Union and concatenation of grammars.
//!
//! The inputs are imported side by side into a fresh builder under a new
//! `root` rule; clashing rule names get numeric suffixes.

use super::builder::GrammarBuilder;
use super::{ExprId, Grammar};

impl Grammar {
    /// A grammar accepting any string accepted by one of `grammars`.
    /// The union of nothing accepts nothing.
    pub fn union(grammars: &[Grammar]) -> crate::Result<Grammar> {
        compose(grammars, |b, refs| match refs.is_empty() {
            true => b.add_character_class(false, Vec::new()),
            false => {
                let alts = refs.into_iter().map(|r| b.add_sequence(vec![r])).collect();
                b.add_choices(alts)
            }
        })
    }

    /// A grammar accepting the concatenation of strings accepted by each of
    /// `grammars`, in order. The concatenation of nothing accepts only `""`.
    pub fn concat(grammars: &[Grammar]) -> crate::Result<Grammar> {
        compose(grammars, |b, refs| match refs.is_empty() {
            true => b.add_empty_string(),
            false => {
                let seq = b.add_sequence(refs);
                b.add_choices(vec![seq])
            }
        })
    }
}

fn compose(
    grammars: &[Grammar],
    body: impl FnOnce(&mut GrammarBuilder, Vec<ExprId>) -> ExprId,
) -> crate::Result<Grammar> {
    let mut b = GrammarBuilder::new();
    let root = b.add_rule("root");
    let refs: Vec<ExprId> = grammars
        .iter()
        .map(|g| {
            let sub_root = b.import_grammar(g);
            b.add_rule_ref(sub_root)
        })
        .collect();
    let root_body = body(&mut b, refs);
    b.set_rule_body(root, root_body);
    b.build_with_root(root)
}
