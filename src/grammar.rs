//! Context-free grammar representation.
//!
//! A `Grammar` is an immutable arena of rules and expressions. Grammars are
//! values: every transformation (normalization, optimization, union, concat)
//! returns a new grammar and leaves its inputs untouched. Share them with
//! `Arc<Grammar>`.

pub mod builder;
pub mod compose;
pub mod ebnf;
pub(crate) mod normalize;
pub(crate) mod optimizer;
pub mod serialize;

use std::fmt;

use serde::{Deserialize, Serialize};

/// Index into the grammar's rule list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RuleId(pub u32);

/// Index into the grammar's expression arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExprId(pub u32);

/// A grammar rule: a named production with a body expression.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    pub name: String,
    pub body: ExprId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lookahead: Option<Lookahead>,
}

/// A lookahead assertion attached to a rule.
///
/// Carried through parsing, printing and serialization. The matcher does not
/// enforce it, so a rule with a lookahead matches a superset of its strict
/// language.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lookahead {
    pub expr: ExprId,
    pub is_exact: bool,
}

/// A grammar expression node.
///
/// Expressions are stored in an arena (`Grammar.exprs`) and referenced by `ExprId`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Expr {
    /// The empty string `""`.
    EmptyString,

    /// A literal byte string (UTF-8 encoded).
    ByteString { bytes: Vec<u8> },

    /// A character class matching Unicode codepoint ranges, e.g. `[a-z0-9]`.
    /// When `negated` is true, matches any codepoint NOT in the ranges.
    CharacterClass {
        negated: bool,
        /// Inclusive ranges of Unicode codepoints: `(lower, upper)`.
        ranges: Vec<(u32, u32)>,
    },

    /// Kleene star of a character class, e.g. `[a-z]*`.
    CharacterClassStar {
        negated: bool,
        ranges: Vec<(u32, u32)>,
    },

    /// A reference to another rule.
    RuleRef { rule: RuleId },

    /// An ordered sequence of expressions (concatenation).
    Sequence { items: Vec<ExprId> },

    /// A choice between expressions (alternation / union).
    Choices { items: Vec<ExprId> },

    /// Bounded repetition of a rule: `rule{min, max}`.
    /// `max = None` means unbounded.
    Repeat {
        rule: RuleId,
        min: u32,
        max: Option<u32>,
    },
}

impl Expr {
    /// Rule referenced by this node, if any.
    pub fn referenced_rule(&self) -> Option<RuleId> {
        match self {
            Expr::RuleRef { rule } | Expr::Repeat { rule, .. } => Some(*rule),
            _ => None,
        }
    }

    /// Child expressions of a sequence or choice.
    pub fn children(&self) -> &[ExprId] {
        match self {
            Expr::Sequence { items } | Expr::Choices { items } => items,
            _ => &[],
        }
    }
}

/// An immutable context-free grammar.
///
/// Constructed via `GrammarBuilder`, `Grammar::from_ebnf()` or one of the
/// other front ends (JSON Schema, regex, structural tags).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Grammar {
    pub(crate) rules: Vec<Rule>,
    pub(crate) exprs: Vec<Expr>,
    pub(crate) root_rule: RuleId,
}

impl Grammar {
    /// Get the root rule id.
    pub fn root_id(&self) -> RuleId {
        self.root_rule
    }

    /// Get a rule by id.
    pub fn rule(&self, id: RuleId) -> &Rule {
        &self.rules[id.0 as usize]
    }

    /// Get an expression by id.
    pub fn get_expr(&self, id: ExprId) -> &Expr {
        &self.exprs[id.0 as usize]
    }

    /// Number of rules in the grammar.
    pub fn num_rules(&self) -> usize {
        self.rules.len()
    }

    /// Number of expressions in the grammar.
    pub fn num_exprs(&self) -> usize {
        self.exprs.len()
    }

    /// Iterate over all rules.
    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    /// Get the root rule.
    pub fn root(&self) -> &Rule {
        self.rule(self.root_rule)
    }

    /// Look up a rule by name.
    pub fn find_rule(&self, name: &str) -> Option<RuleId> {
        self.rules
            .iter()
            .position(|r| r.name == name)
            .map(|i| RuleId(i as u32))
    }

    /// The fixed JSON value grammar (RFC 8259).
    pub fn builtin_json_grammar() -> Grammar {
        // The text is a compile-time constant that the parser tests cover.
        match Grammar::from_ebnf(BUILTIN_JSON_EBNF, "root") {
            Ok(grammar) => grammar,
            Err(err) => unreachable!("builtin JSON grammar is malformed: {err}"),
        }
    }
}

pub(crate) const BUILTIN_JSON_EBNF: &str = r#"
root ::= value
value ::= object | array | string | number | "true" | "false" | "null"
object ::= "{" ws (pair ("," ws pair)*)? ws "}"
pair ::= ws string ws ":" ws value
array ::= "[" ws (value ("," ws value)*)? ws "]"
string ::= "\"" char* "\""
char ::= [^"\\\u0000-\u001f] | "\\" escape
escape ::= "\"" | "\\" | "/" | "b" | "f" | "n" | "r" | "t" | "u" [0-9a-fA-F] [0-9a-fA-F] [0-9a-fA-F] [0-9a-fA-F]
number ::= integer fraction? exponent?
integer ::= "-"? ("0" | [1-9] [0-9]*)
fraction ::= "." [0-9]+
exponent ::= [eE] [+-]? [0-9]+
ws ::= [ \t\n\r]*
"#;

impl fmt::Display for Grammar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, rule) in self.rules.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{} ::= ", rule.name)?;
            self.fmt_expr(f, rule.body)?;
            if let Some(ref la) = rule.lookahead {
                write!(f, " (= ")?;
                self.fmt_expr(f, la.expr)?;
                write!(f, ")")?;
            }
        }
        Ok(())
    }
}

impl Grammar {
    fn fmt_expr(&self, f: &mut fmt::Formatter<'_>, id: ExprId) -> fmt::Result {
        match self.get_expr(id) {
            Expr::EmptyString => write!(f, "\"\""),
            Expr::ByteString { bytes } => {
                write!(f, "\"")?;
                for chunk in bytes.utf8_chunks() {
                    for c in chunk.valid().chars() {
                        Self::fmt_string_char(f, c)?;
                    }
                    for &b in chunk.invalid() {
                        write!(f, "\\x{:02x}", b)?;
                    }
                }
                write!(f, "\"")
            }
            Expr::CharacterClass { negated, ranges } => {
                Self::fmt_char_class(f, *negated, ranges)
            }
            Expr::CharacterClassStar { negated, ranges } => {
                Self::fmt_char_class(f, *negated, ranges)?;
                write!(f, "*")
            }
            Expr::RuleRef { rule } => {
                write!(f, "{}", self.rules[rule.0 as usize].name)
            }
            Expr::Sequence { items } => {
                write!(f, "(")?;
                for (i, &eid) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, " ")?;
                    }
                    self.fmt_expr(f, eid)?;
                }
                write!(f, ")")
            }
            Expr::Choices { items } => {
                write!(f, "(")?;
                for (i, &eid) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, " | ")?;
                    }
                    self.fmt_expr(f, eid)?;
                }
                write!(f, ")")
            }
            Expr::Repeat { rule, min, max } => {
                let name = &self.rules[rule.0 as usize].name;
                match max {
                    Some(max) => write!(f, "{}{{{},{}}}", name, min, max),
                    None => write!(f, "{}{{{},}}", name, min),
                }
            }
        }
    }

    fn fmt_string_char(f: &mut fmt::Formatter<'_>, c: char) -> fmt::Result {
        match c {
            '\\' => write!(f, "\\\\"),
            '"' => write!(f, "\\\""),
            '\n' => write!(f, "\\n"),
            '\r' => write!(f, "\\r"),
            '\t' => write!(f, "\\t"),
            c if c.is_control() && (c as u32) <= 0xffff => write!(f, "\\u{:04x}", c as u32),
            c => write!(f, "{}", c),
        }
    }

    fn fmt_char_class(f: &mut fmt::Formatter<'_>, negated: bool, ranges: &[(u32, u32)]) -> fmt::Result {
        write!(f, "[")?;
        if negated {
            write!(f, "^")?;
        }
        for &(lo, hi) in ranges {
            Self::fmt_char_class_char(f, lo)?;
            if lo != hi {
                write!(f, "-")?;
                Self::fmt_char_class_char(f, hi)?;
            }
        }
        write!(f, "]")
    }

    fn fmt_char_class_char(f: &mut fmt::Formatter<'_>, cp: u32) -> fmt::Result {
        match cp {
            0x5c => write!(f, "\\\\"),         // backslash
            0x5d => write!(f, "\\]"),           // ]
            0x5e => write!(f, "\\^"),           // ^
            0x2d => write!(f, "\\-"),           // -
            0x09 => write!(f, "\\t"),
            0x0a => write!(f, "\\n"),
            0x0d => write!(f, "\\r"),
            0x20..=0x7e => match char::from_u32(cp) {
                Some(c) => write!(f, "{}", c),
                None => write!(f, "\\u{:04x}", cp),
            },
            cp if cp <= 0xffff => write!(f, "\\u{:04x}", cp),
            cp => write!(f, "\\U{:08x}", cp),
        }
    }
}
