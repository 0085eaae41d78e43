//! Structural tags: free text interleaved with tagged, grammar-constrained
//! regions.
//!
//! ```json
//! {
//!   "triggers": ["<function="],
//!   "tags": [
//!     {"begin": "<function=get_weather>", "schema": {"type": "object"}, "end": "</function>"}
//!   ],
//!   "at_least_one": false,
//!   "stop_after_first": false
//! }
//! ```
//!
//! Free text is matched by an Aho-Corasick automaton over the triggers, one
//! rule per automaton state. Completing a trigger inside free text commits
//! to one of the tagged regions that begin with it, so a trigger can only
//! appear as the start of a complete region.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use serde::Deserialize;
use serde_json::Value;

use crate::grammar::builder::GrammarBuilder;
use crate::grammar::{ExprId, Grammar, RuleId};
use crate::json_schema::JsonSchemaOptions;
use crate::Error;

/// What a tagged region must contain.
#[derive(Debug, Clone, PartialEq)]
pub enum TagContent {
    JsonSchema(Value),
    Ebnf(String),
    Regex(String),
}

/// One tagged region: `begin`, content, `end`.
#[derive(Debug, Clone, PartialEq)]
pub struct Tag {
    pub begin: String,
    pub content: TagContent,
    pub end: String,
}

/// A validated structural tag description.
#[derive(Debug, Clone, PartialEq)]
pub struct StructuralTag {
    pub triggers: Vec<String>,
    pub tags: Vec<Tag>,
    /// Require at least one tagged region.
    pub at_least_one: bool,
    /// End the output right after the first tagged region.
    pub stop_after_first: bool,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct StructuralTagRepr {
    triggers: Vec<String>,
    #[serde(alias = "structures")]
    tags: Vec<TagRepr>,
    #[serde(default)]
    at_least_one: bool,
    #[serde(default)]
    stop_after_first: bool,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct TagRepr {
    begin: String,
    #[serde(default)]
    schema: Option<Value>,
    #[serde(default)]
    ebnf: Option<String>,
    #[serde(default)]
    regex: Option<String>,
    end: String,
}

impl StructuralTag {
    /// Parse and validate a structural tag description.
    pub fn from_json(json: &str) -> crate::Result<Self> {
        let value: Value = serde_json::from_str(json).map_err(Error::json)?;
        let repr: StructuralTagRepr = serde_json::from_value(value)
            .map_err(|e| Error::InvalidStructuralTag(e.to_string()))?;

        let invalid = |msg: String| Error::InvalidStructuralTag(msg);
        if repr.triggers.is_empty() {
            return Err(invalid("at least one trigger is required".into()));
        }
        if let Some(i) = repr.triggers.iter().position(String::is_empty) {
            return Err(invalid(format!("trigger {i} is empty")));
        }

        let mut tags = Vec::with_capacity(repr.tags.len());
        for (i, tag) in repr.tags.into_iter().enumerate() {
            if tag.begin.is_empty() {
                return Err(invalid(format!("tag {i} has an empty begin")));
            }
            if !repr.triggers.iter().any(|t| tag.begin.starts_with(t.as_str())) {
                return Err(invalid(format!(
                    "begin {:?} of tag {i} does not start with any trigger",
                    tag.begin
                )));
            }
            let content = match (tag.schema, tag.ebnf, tag.regex) {
                (Some(schema), None, None) => TagContent::JsonSchema(schema),
                (None, Some(ebnf), None) => TagContent::Ebnf(ebnf),
                (None, None, Some(regex)) => TagContent::Regex(regex),
                _ => {
                    return Err(invalid(format!(
                        "tag {i} needs exactly one of \"schema\", \"ebnf\" or \"regex\""
                    )))
                }
            };
            tags.push(Tag {
                begin: tag.begin,
                content,
                end: tag.end,
            });
        }

        Ok(StructuralTag {
            triggers: repr.triggers,
            tags,
            at_least_one: repr.at_least_one,
            stop_after_first: repr.stop_after_first,
        })
    }

    /// Build the grammar for this description.
    pub fn to_grammar(&self) -> crate::Result<Grammar> {
        let contents = self
            .tags
            .iter()
            .map(|tag| match &tag.content {
                TagContent::JsonSchema(schema) => {
                    Grammar::from_json_schema_value(schema, &JsonSchemaOptions::default())
                }
                TagContent::Ebnf(ebnf) => Grammar::from_ebnf(ebnf, "root"),
                TagContent::Regex(regex) => Grammar::from_regex(regex),
            })
            .collect::<crate::Result<Vec<_>>>()?;

        let automaton = TriggerAutomaton::new(&self.triggers);
        let mut b = GrammarBuilder::new();
        let root = b.add_rule("root");

        // Each tag is dispatched from the shortest trigger its begin starts
        // with; longer ones are never completed first.
        let mut by_trigger: Vec<Vec<usize>> = vec![Vec::new(); self.triggers.len()];
        for (i, tag) in self.tags.iter().enumerate() {
            let trigger = self
                .triggers
                .iter()
                .enumerate()
                .filter(|(_, t)| tag.begin.starts_with(t.as_str()))
                .min_by_key(|(_, t)| t.len())
                .map(|(k, _)| k);
            if let Some(k) = trigger {
                by_trigger[k].push(i);
            }
        }

        let mut dispatch = Vec::with_capacity(self.triggers.len());
        for (k, tag_ids) in by_trigger.iter().enumerate() {
            if tag_ids.is_empty() {
                dispatch.push(None);
                continue;
            }
            let rule = b.add_rule_unique("tag_dispatch");
            let mut alts = Vec::with_capacity(tag_ids.len());
            for &i in tag_ids {
                let tag = &self.tags[i];
                let content_root = b.import_grammar(&contents[i]);
                let mut items = Vec::with_capacity(3);
                let rest = &tag.begin[self.triggers[k].len()..];
                if !rest.is_empty() {
                    items.push(b.add_byte_string(rest.as_bytes()));
                }
                items.push(b.add_rule_ref(content_root));
                if !tag.end.is_empty() {
                    items.push(b.add_byte_string(tag.end.as_bytes()));
                }
                alts.push(b.add_sequence(items));
            }
            let body = b.add_choices(alts);
            b.set_rule_body(rule, body);
            dispatch.push(Some(rule));
        }

        let entry = match (self.at_least_one, self.stop_after_first) {
            (false, false) => {
                let text = automaton.add_rules(&mut b, "free_text");
                automaton.set_bodies(&mut b, &text, true, Some(text[0]), &dispatch);
                text[0]
            }
            (at_least_one, true) => {
                let text = automaton.add_rules(&mut b, "free_text");
                automaton.set_bodies(&mut b, &text, !at_least_one, None, &dispatch);
                text[0]
            }
            (true, false) => {
                let before = automaton.add_rules(&mut b, "leading_text");
                let after = automaton.add_rules(&mut b, "free_text");
                automaton.set_bodies(&mut b, &before, false, Some(after[0]), &dispatch);
                automaton.set_bodies(&mut b, &after, true, Some(after[0]), &dispatch);
                before[0]
            }
        };

        let entry_ref = b.add_rule_ref(entry);
        let seq = b.add_sequence(vec![entry_ref]);
        let body = b.add_choices(vec![seq]);
        b.set_rule_body(root, body);
        b.build_with_root(root)
    }
}

impl Grammar {
    /// Grammar for free text interleaved with tagged regions, described by
    /// a structural tag JSON document.
    ///
    /// Fails with `Error::InvalidJson` if `json` is not JSON,
    /// `Error::InvalidStructuralTag` if the description is malformed and
    /// `Error::InvalidJsonSchema` if an embedded schema is rejected.
    pub fn from_structural_tag(json: &str) -> crate::Result<Grammar> {
        StructuralTag::from_json(json)?.to_grammar()
    }
}

/// Aho-Corasick automaton over the trigger strings, by char.
struct TriggerAutomaton {
    children: Vec<BTreeMap<char, usize>>,
    fail: Vec<usize>,
    /// Trigger completed on entering the node, if any.
    completes: Vec<Option<usize>>,
}

impl TriggerAutomaton {
    fn new(triggers: &[String]) -> Self {
        let mut children: Vec<BTreeMap<char, usize>> = vec![BTreeMap::new()];
        let mut terminal: Vec<Option<usize>> = vec![None];
        for (k, trigger) in triggers.iter().enumerate() {
            let mut node = 0;
            for c in trigger.chars() {
                node = match children[node].get(&c) {
                    Some(&next) => next,
                    None => {
                        children.push(BTreeMap::new());
                        terminal.push(None);
                        let next = children.len() - 1;
                        children[node].insert(c, next);
                        next
                    }
                };
            }
            terminal[node].get_or_insert(k);
        }

        let mut automaton = TriggerAutomaton {
            fail: vec![0; children.len()],
            completes: terminal,
            children,
        };
        let mut queue: VecDeque<usize> = automaton.children[0].values().copied().collect();
        while let Some(node) = queue.pop_front() {
            let edges: Vec<(char, usize)> =
                automaton.children[node].iter().map(|(&c, &n)| (c, n)).collect();
            for (c, next) in edges {
                let fail = if node == 0 { 0 } else { automaton.goto(automaton.fail[node], c) };
                automaton.fail[next] = fail;
                if automaton.completes[next].is_none() {
                    automaton.completes[next] = automaton.completes[fail];
                }
                queue.push_back(next);
            }
        }
        automaton
    }

    fn goto(&self, mut node: usize, c: char) -> usize {
        loop {
            if let Some(&next) = self.children[node].get(&c) {
                return next;
            }
            if node == 0 {
                return 0;
            }
            node = self.fail[node];
        }
    }

    /// Chars with a transition other than back to the root from `node`.
    fn explicit_chars(&self, mut node: usize) -> BTreeSet<char> {
        let mut chars = BTreeSet::new();
        loop {
            chars.extend(self.children[node].keys().copied());
            if node == 0 {
                return chars;
            }
            node = self.fail[node];
        }
    }

    /// One rule per free-text state. Nodes that complete a trigger are not
    /// states and map to the root rule, which they never reference.
    fn add_rules(&self, b: &mut GrammarBuilder, name: &str) -> Vec<RuleId> {
        let first = b.add_rule_unique(name);
        let mut rules = vec![first; self.children.len()];
        for (node, rule) in rules.iter_mut().enumerate().skip(1) {
            if self.completes[node].is_none() {
                *rule = b.add_rule_unique(name);
            }
        }
        rules
    }

    /// `after_tag` is the state entered after a tagged region; `None` ends
    /// the output.
    fn set_bodies(
        &self,
        b: &mut GrammarBuilder,
        rules: &[RuleId],
        allow_end: bool,
        after_tag: Option<RuleId>,
        dispatch: &[Option<RuleId>],
    ) {
        for node in 0..self.children.len() {
            if self.completes[node].is_some() {
                continue;
            }
            let mut alts: Vec<ExprId> = Vec::new();
            if allow_end {
                let empty = b.add_empty_string();
                alts.push(b.add_sequence(vec![empty]));
            }

            let explicit = self.explicit_chars(node);
            let other = b.add_character_class(
                true,
                explicit.iter().map(|&c| (c as u32, c as u32)).collect(),
            );
            let restart = b.add_rule_ref(rules[0]);
            alts.push(b.add_sequence(vec![other, restart]));

            for c in explicit {
                let next = self.goto(node, c);
                let mut buf = [0u8; 4];
                let mut items = Vec::with_capacity(3);
                match self.completes[next] {
                    Some(k) => {
                        let Some(tag_rule) = dispatch[k] else {
                            continue;
                        };
                        items.push(b.add_byte_string(c.encode_utf8(&mut buf).as_bytes()));
                        items.push(b.add_rule_ref(tag_rule));
                        if let Some(after) = after_tag {
                            items.push(b.add_rule_ref(after));
                        }
                    }
                    None => {
                        items.push(b.add_byte_string(c.encode_utf8(&mut buf).as_bytes()));
                        items.push(b.add_rule_ref(rules[next]));
                    }
                }
                alts.push(b.add_sequence(items));
            }

            let body = b.add_choices(alts);
            b.set_rule_body(rules[node], body);
        }
    }
}
