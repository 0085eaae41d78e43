use anyhow::bail;
use rustc_hash::FxHashMap;

use super::{Expr, ExprId, Grammar, Lookahead, Rule, RuleId};

const UNSET_BODY: ExprId = ExprId(u32::MAX);

/// Programmatic grammar construction.
///
/// # Example
/// ```
/// use pie_grammar::grammar::builder::GrammarBuilder;
///
/// let mut b = GrammarBuilder::new();
/// let root = b.add_rule("root");
/// let hello = b.add_byte_string(b"hello");
/// b.set_rule_body(root, hello);
/// let grammar = b.build("root").unwrap();
/// assert_eq!(grammar.num_rules(), 1);
/// ```
#[derive(Debug, Clone, Default)]
pub struct GrammarBuilder {
    pub(crate) rules: Vec<Rule>,
    pub(crate) exprs: Vec<Expr>,
    names: FxHashMap<String, RuleId>,
}

impl GrammarBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a new rule with no body yet. Returns the rule id.
    /// The body must be set later with `set_rule_body`.
    pub fn add_rule(&mut self, name: &str) -> RuleId {
        let id = RuleId(self.rules.len() as u32);
        self.rules.push(Rule {
            name: name.to_string(),
            body: UNSET_BODY,
            lookahead: None,
        });
        self.names.entry(name.to_string()).or_insert(id);
        id
    }

    /// Add a rule whose name is derived from `base`, suffixed until it is
    /// unused.
    pub fn add_rule_unique(&mut self, base: &str) -> RuleId {
        let name = self.unique_rule_name(base);
        self.add_rule(&name)
    }

    /// `base` if no rule has that name yet, else `base_1`, `base_2`, ...
    pub fn unique_rule_name(&self, base: &str) -> String {
        if !self.names.contains_key(base) {
            return base.to_string();
        }
        let mut i = 1usize;
        loop {
            let candidate = format!("{base}_{i}");
            if !self.names.contains_key(&candidate) {
                return candidate;
            }
            i += 1;
        }
    }

    /// Set the body expression of a rule.
    pub fn set_rule_body(&mut self, rule: RuleId, body: ExprId) {
        self.rules[rule.0 as usize].body = body;
    }

    /// Set a lookahead assertion on a rule.
    pub fn set_rule_lookahead(&mut self, rule: RuleId, expr: ExprId, is_exact: bool) {
        self.rules[rule.0 as usize].lookahead = Some(Lookahead { expr, is_exact });
    }

    /// Add an expression to the arena and return its id.
    pub fn add_expr(&mut self, expr: Expr) -> ExprId {
        let id = ExprId(self.exprs.len() as u32);
        self.exprs.push(expr);
        id
    }

    pub fn add_empty_string(&mut self) -> ExprId {
        self.add_expr(Expr::EmptyString)
    }

    pub fn add_byte_string(&mut self, bytes: &[u8]) -> ExprId {
        self.add_expr(Expr::ByteString { bytes: bytes.to_vec() })
    }

    pub fn add_character_class(&mut self, negated: bool, ranges: Vec<(u32, u32)>) -> ExprId {
        self.add_expr(Expr::CharacterClass { negated, ranges })
    }

    /// Add a character class star expression (`[...]*`).
    pub fn add_character_class_star(&mut self, negated: bool, ranges: Vec<(u32, u32)>) -> ExprId {
        self.add_expr(Expr::CharacterClassStar { negated, ranges })
    }

    pub fn add_rule_ref(&mut self, rule: RuleId) -> ExprId {
        self.add_expr(Expr::RuleRef { rule })
    }

    pub fn add_sequence(&mut self, items: Vec<ExprId>) -> ExprId {
        self.add_expr(Expr::Sequence { items })
    }

    pub fn add_choices(&mut self, items: Vec<ExprId>) -> ExprId {
        self.add_expr(Expr::Choices { items })
    }

    pub fn add_repeat(&mut self, rule: RuleId, min: u32, max: Option<u32>) -> ExprId {
        self.add_expr(Expr::Repeat { rule, min, max })
    }

    pub(crate) fn peek_expr(&self, id: ExprId) -> &Expr {
        &self.exprs[id.0 as usize]
    }

    /// Look up a rule by name.
    pub fn find_rule(&self, name: &str) -> Option<RuleId> {
        self.names.get(name).copied()
    }

    /// Number of rules added so far.
    pub fn num_rules(&self) -> usize {
        self.rules.len()
    }

    /// Copy every rule and expression of `grammar` into this builder, renaming
    /// rules that clash with existing names. Returns the new id of the
    /// grammar's root rule.
    pub fn import_grammar(&mut self, grammar: &Grammar) -> RuleId {
        let rule_base = self.rules.len() as u32;
        let expr_base = self.exprs.len() as u32;
        let shift_rule = |r: RuleId| RuleId(r.0 + rule_base);
        let shift_expr = |e: ExprId| ExprId(e.0 + expr_base);

        for rule in grammar.rules() {
            let id = self.add_rule_unique(&rule.name);
            self.rules[id.0 as usize].body = shift_expr(rule.body);
            self.rules[id.0 as usize].lookahead = rule.lookahead.as_ref().map(|la| Lookahead {
                expr: shift_expr(la.expr),
                is_exact: la.is_exact,
            });
        }
        for expr in &grammar.exprs {
            let shifted = match expr {
                Expr::RuleRef { rule } => Expr::RuleRef { rule: shift_rule(*rule) },
                Expr::Repeat { rule, min, max } => Expr::Repeat {
                    rule: shift_rule(*rule),
                    min: *min,
                    max: *max,
                },
                Expr::Sequence { items } => Expr::Sequence {
                    items: items.iter().map(|&e| shift_expr(e)).collect(),
                },
                Expr::Choices { items } => Expr::Choices {
                    items: items.iter().map(|&e| shift_expr(e)).collect(),
                },
                leaf => leaf.clone(),
            };
            self.exprs.push(shifted);
        }
        shift_rule(grammar.root_rule)
    }

    /// Build the grammar, resolving the root rule by name.
    pub fn build(self, root_rule_name: &str) -> crate::Result<Grammar> {
        let root = self.find_rule(root_rule_name).ok_or_else(|| {
            crate::Error::GrammarSyntax(format!("root rule '{root_rule_name}' not found"))
        })?;
        self.build_with_root(root)
    }

    /// Build the grammar with an explicit root id.
    pub fn build_with_root(self, root: RuleId) -> crate::Result<Grammar> {
        let grammar = Grammar {
            rules: self.rules,
            exprs: self.exprs,
            root_rule: root,
        };
        validate(&grammar).map_err(crate::Error::syntax)?;
        Ok(grammar)
    }
}

/// Check that every rule has a body and every id resolves inside the arena.
pub(crate) fn validate(grammar: &Grammar) -> anyhow::Result<()> {
    let num_rules = grammar.rules.len();
    let num_exprs = grammar.exprs.len();
    if grammar.root_rule.0 as usize >= num_rules {
        bail!("root rule id {} out of range", grammar.root_rule.0);
    }
    for rule in &grammar.rules {
        if rule.body == UNSET_BODY {
            bail!("rule '{}' has no body", rule.name);
        }
        if rule.body.0 as usize >= num_exprs {
            bail!("rule '{}' has dangling body id {}", rule.name, rule.body.0);
        }
        if let Some(la) = &rule.lookahead {
            if la.expr.0 as usize >= num_exprs {
                bail!("rule '{}' has dangling lookahead id {}", rule.name, la.expr.0);
            }
        }
    }
    for (i, expr) in grammar.exprs.iter().enumerate() {
        if let Some(rule) = expr.referenced_rule() {
            if rule.0 as usize >= num_rules {
                bail!("expression {i} references missing rule {}", rule.0);
            }
        }
        if let Expr::Repeat { min, max: Some(max), .. } = expr {
            if max < min {
                bail!("expression {i} has repeat bounds {{{min},{max}}}");
            }
        }
        for child in expr.children() {
            // Children are always allocated before their parent, which also
            // rules out cycles inside a single rule body.
            if child.0 as usize >= i {
                bail!("expression {i} has forward or dangling child {}", child.0);
            }
        }
    }
    Ok(())
}
