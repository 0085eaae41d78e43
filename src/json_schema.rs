//! JSON Schema to grammar converter.
//!
//! Converts a JSON Schema into an EBNF grammar string, then parses it
//! into a `Grammar`. The generated grammar constrains output to JSON text
//! matching the schema.
//!
//! # Supported features
//! - Types: string, integer, number, boolean, null, array, object
//! - Constraints: enum, const, minLength/maxLength, minimum/maximum,
//!   exclusiveMinimum/exclusiveMaximum, pattern, format
//! - Arrays: items, prefixItems, minItems/maxItems
//! - Objects: properties, required, additionalProperties, maxProperties
//! - Composition: $ref (any local JSON pointer, recursion allowed), anyOf,
//!   oneOf, single-element allOf
//! - Formatting: indent, separators, any_whitespace, max_whitespace
//!
//! Bounded `number` schemas are matched conservatively: every accepted
//! text satisfies the bounds, but values with an exponent and fractions
//! within one unit of a non-integer bound are not produced.

use anyhow::{anyhow, bail, Result};
use rustc_hash::{FxHashMap, FxHashSet};
use serde_json::{Map, Value};

use crate::grammar::ebnf::parse_ebnf;
use crate::grammar::Grammar;
use crate::regex::{ebnf_string, regex_to_ebnf_body, render_class};

/// Options for JSON schema to grammar conversion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JsonSchemaOptions {
    /// Allow arbitrary whitespace between JSON elements. When set, `indent`
    /// is ignored and `separators` only contribute their non-blank part.
    pub any_whitespace: bool,
    /// Indent level (number of spaces). None = single line.
    pub indent: Option<usize>,
    /// Custom separators: (item_separator, key_value_separator).
    pub separators: Option<(String, String)>,
    /// If true, unspecified `additionalProperties` and `items` are treated
    /// as `false`.
    pub strict_mode: bool,
    /// Upper bound on each whitespace run when `any_whitespace` is set.
    pub max_whitespace: Option<usize>,
    /// Log the generated EBNF at debug level.
    pub debug_dump: bool,
}

impl Default for JsonSchemaOptions {
    fn default() -> Self {
        Self {
            any_whitespace: true,
            indent: None,
            separators: None,
            strict_mode: true,
            max_whitespace: None,
            debug_dump: false,
        }
    }
}

impl Grammar {
    /// Grammar for JSON text matching `schema`.
    ///
    /// Fails with `Error::InvalidJson` if `schema` is not JSON and with
    /// `Error::InvalidJsonSchema` if it uses unsupported or contradictory
    /// constructs.
    pub fn from_json_schema(schema: &str, options: &JsonSchemaOptions) -> crate::Result<Grammar> {
        let value: Value = serde_json::from_str(schema).map_err(crate::Error::json)?;
        Grammar::from_json_schema_value(&value, options)
    }

    /// Same as [`Grammar::from_json_schema`] for an already parsed schema.
    pub fn from_json_schema_value(
        schema: &Value,
        options: &JsonSchemaOptions,
    ) -> crate::Result<Grammar> {
        let ebnf = json_schema_to_ebnf(schema, options)?;
        if options.debug_dump {
            tracing::debug!("EBNF generated from JSON schema:\n{}", ebnf);
        }
        parse_ebnf(&ebnf, "root").map_err(crate::Error::schema)
    }
}

/// Convert a parsed JSON Schema to an EBNF grammar string rooted at `root`.
pub fn json_schema_to_ebnf(schema: &Value, options: &JsonSchemaOptions) -> crate::Result<String> {
    SchemaConverter::new(schema, options)
        .convert()
        .map_err(crate::Error::schema)
}

static TRUE_SCHEMA: Value = Value::Bool(true);

const JSON_NUMBER: &str =
    "\"-\"? (\"0\" | [1-9] [0-9]*) (\".\" [0-9]+)? ([eE] [+-]? [0-9]+)?";

/// How punctuation between JSON tokens is rendered.
enum Layout {
    /// A `ws` rule around every token; separators keep only their
    /// non-blank part.
    AnyWhitespace { item: String, kv: String },
    /// Exactly the separators given, plus newlines and indentation when
    /// `indent` is set.
    Fixed {
        item: String,
        kv: String,
        indent: Option<usize>,
    },
}

impl Layout {
    fn new(options: &JsonSchemaOptions) -> Self {
        let (item, kv) = match &options.separators {
            Some((item, kv)) => (item.clone(), kv.clone()),
            None if options.indent.is_some() => (",".to_string(), ": ".to_string()),
            None if options.any_whitespace => (",".to_string(), ":".to_string()),
            None => (", ".to_string(), ": ".to_string()),
        };
        if options.any_whitespace {
            Layout::AnyWhitespace {
                item: item.trim().to_string(),
                kv: kv.trim().to_string(),
            }
        } else {
            Layout::Fixed {
                item,
                kv,
                indent: options.indent,
            }
        }
    }

    fn indent_of(&self, depth: usize) -> Option<String> {
        match self {
            Layout::Fixed {
                indent: Some(n), ..
            } => Some(format!("\n{}", " ".repeat(n * depth))),
            _ => None,
        }
    }

    fn open(&self, bracket: char, depth: usize) -> String {
        match (self, self.indent_of(depth + 1)) {
            (Layout::AnyWhitespace { .. }, _) => format!("{} ws", ebnf_string(&bracket.to_string())),
            (_, Some(newline)) => ebnf_string(&format!("{bracket}{newline}")),
            (_, None) => ebnf_string(&bracket.to_string()),
        }
    }

    fn close(&self, bracket: char, depth: usize) -> String {
        match (self, self.indent_of(depth)) {
            (Layout::AnyWhitespace { .. }, _) => format!("ws {}", ebnf_string(&bracket.to_string())),
            (_, Some(newline)) => ebnf_string(&format!("{newline}{bracket}")),
            (_, None) => ebnf_string(&bracket.to_string()),
        }
    }

    fn empty(&self, open: char, close: char) -> String {
        match self {
            Layout::AnyWhitespace { .. } => format!(
                "{} ws {}",
                ebnf_string(&open.to_string()),
                ebnf_string(&close.to_string())
            ),
            Layout::Fixed { .. } => ebnf_string(&format!("{open}{close}")),
        }
    }

    fn item_sep(&self, depth: usize) -> String {
        match (self, self.indent_of(depth + 1)) {
            (Layout::AnyWhitespace { item, .. }, _) => format!("ws {} ws", ebnf_string(item)),
            (Layout::Fixed { item, .. }, Some(newline)) => {
                ebnf_string(&format!("{}{newline}", item.trim_end()))
            }
            (Layout::Fixed { item, .. }, None) => ebnf_string(item),
        }
    }

    fn kv_sep(&self) -> String {
        match self {
            Layout::AnyWhitespace { kv, .. } => format!("ws {} ws", ebnf_string(kv)),
            Layout::Fixed { kv, .. } => ebnf_string(kv),
        }
    }

    /// Separators for the untyped value rule, which never indents.
    fn flat(&self) -> (String, String, String, String, String, String) {
        match self {
            Layout::AnyWhitespace { .. } => (
                self.open('{', 0),
                self.close('}', 0),
                self.open('[', 0),
                self.close(']', 0),
                self.item_sep(0),
                self.kv_sep(),
            ),
            Layout::Fixed { item, kv, .. } => (
                ebnf_string("{"),
                ebnf_string("}"),
                ebnf_string("["),
                ebnf_string("]"),
                ebnf_string(item),
                ebnf_string(kv),
            ),
        }
    }
}

struct SchemaConverter<'a> {
    root_schema: &'a Value,
    options: &'a JsonSchemaOptions,
    layout: Layout,
    rules: Vec<(String, String)>,
    used_names: FxHashSet<String>,
    /// `$ref` target and layout depth to the rule generated for it.
    refs: FxHashMap<(String, usize), String>,
    any_value: Option<String>,
    json_string: Option<String>,
    json_char: Option<String>,
}

impl<'a> SchemaConverter<'a> {
    fn new(root_schema: &'a Value, options: &'a JsonSchemaOptions) -> Self {
        let used_names = ["root", "ws"].iter().map(|s| s.to_string()).collect();
        Self {
            root_schema,
            options,
            layout: Layout::new(options),
            rules: Vec::new(),
            used_names,
            refs: FxHashMap::default(),
            any_value: None,
            json_string: None,
            json_char: None,
        }
    }

    fn convert(mut self) -> Result<String> {
        let root_expr = self.visit(self.root_schema, 0, "#")?;
        self.rules.insert(0, ("root".to_string(), root_expr));
        if matches!(self.layout, Layout::AnyWhitespace { .. }) {
            let ws = match self.options.max_whitespace {
                Some(max) => format!("[ \\t\\n\\r]{{0,{max}}}"),
                None => "[ \\t\\n\\r]*".to_string(),
            };
            self.rules.push(("ws".to_string(), ws));
        }

        let mut out = String::new();
        for (name, body) in &self.rules {
            out.push_str(&format!("{} ::= {}\n", name, body));
        }
        Ok(out)
    }

    fn fresh_name(&mut self, base: &str) -> String {
        let mut base: String = base
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect();
        if !base.starts_with(|c: char| c.is_ascii_alphabetic()) {
            base.insert_str(0, "r_");
        }
        let mut name = base.clone();
        let mut counter = 0;
        while self.used_names.contains(&name) {
            counter += 1;
            name = format!("{}_{}", base, counter);
        }
        self.used_names.insert(name.clone());
        name
    }

    fn visit(&mut self, schema: &Value, depth: usize, path: &str) -> Result<String> {
        match schema {
            Value::Bool(true) => Ok(self.any_value()),
            Value::Bool(false) => bail!("{path}: schema `false` accepts no value"),
            Value::Object(obj) => self.visit_object_schema(obj, depth, path),
            other => bail!("{path}: expected a schema object or boolean, found {other}"),
        }
    }

    fn visit_object_schema(
        &mut self,
        obj: &Map<String, Value>,
        depth: usize,
        path: &str,
    ) -> Result<String> {
        if let Some(reference) = obj.get("$ref") {
            let reference = reference
                .as_str()
                .ok_or_else(|| anyhow!("{path}: $ref must be a string"))?;
            return self.visit_ref(reference, depth);
        }

        if let Some(value) = obj.get("const") {
            return Ok(json_literal(value));
        }

        if let Some(values) = obj.get("enum") {
            let values = values
                .as_array()
                .ok_or_else(|| anyhow!("{path}: enum must be an array"))?;
            if values.is_empty() {
                bail!("{path}: enum must not be empty");
            }
            return Ok(alternatives(values.iter().map(json_literal).collect()));
        }

        for key in ["anyOf", "oneOf"] {
            if let Some(options) = obj.get(key) {
                let options = options
                    .as_array()
                    .filter(|a| !a.is_empty())
                    .ok_or_else(|| anyhow!("{path}: {key} must be a non-empty array"))?;
                let alts = options
                    .iter()
                    .enumerate()
                    .map(|(i, s)| self.visit(s, depth, &format!("{path}/{key}/{i}")))
                    .collect::<Result<Vec<_>>>()?;
                return Ok(alternatives(alts));
            }
        }

        if let Some(all_of) = obj.get("allOf") {
            match all_of.as_array().map(Vec::as_slice) {
                Some([single]) => return self.visit(single, depth, &format!("{path}/allOf/0")),
                _ => bail!("{path}: allOf is only supported with a single schema"),
            }
        }

        match obj.get("type") {
            Some(Value::String(t)) => self.visit_typed(obj, t, depth, path),
            Some(Value::Array(types)) => {
                let mut alts = Vec::with_capacity(types.len());
                for t in types {
                    let t = t
                        .as_str()
                        .ok_or_else(|| anyhow!("{path}: type entries must be strings"))?;
                    alts.push(self.visit_typed(obj, t, depth, path)?);
                }
                if alts.is_empty() {
                    bail!("{path}: type array must not be empty");
                }
                Ok(alternatives(alts))
            }
            Some(other) => bail!("{path}: unexpected type value {other}"),
            None => {
                let has = |keys: &[&str]| keys.iter().any(|k| obj.contains_key(*k));
                if has(&["properties", "required", "additionalProperties", "maxProperties", "minProperties"]) {
                    self.visit_object(obj, depth, path)
                } else if has(&["items", "prefixItems", "minItems", "maxItems"]) {
                    self.visit_array(obj, depth, path)
                } else if has(&["pattern", "minLength", "maxLength", "format"]) {
                    self.visit_string(obj, path)
                } else if has(&["minimum", "maximum", "exclusiveMinimum", "exclusiveMaximum"]) {
                    self.visit_number(obj, path)
                } else {
                    Ok(self.any_value())
                }
            }
        }
    }

    fn visit_typed(
        &mut self,
        obj: &Map<String, Value>,
        type_name: &str,
        depth: usize,
        path: &str,
    ) -> Result<String> {
        match type_name {
            "string" => self.visit_string(obj, path),
            "integer" => self.visit_integer(obj, path),
            "number" => self.visit_number(obj, path),
            "boolean" => Ok("(\"true\" | \"false\")".to_string()),
            "null" => Ok("\"null\"".to_string()),
            "array" => self.visit_array(obj, depth, path),
            "object" => self.visit_object(obj, depth, path),
            other => bail!("{path}: unknown type {other:?}"),
        }
    }

    fn visit_ref(&mut self, reference: &str, depth: usize) -> Result<String> {
        let key_depth = match self.layout.indent_of(0) {
            Some(_) => depth,
            None => 0,
        };
        let key = (reference.to_string(), key_depth);
        if let Some(name) = self.refs.get(&key) {
            return Ok(name.clone());
        }

        let pointer = reference
            .strip_prefix('#')
            .ok_or_else(|| anyhow!("only local $ref targets are supported, found {reference:?}"))?;
        let root = self.root_schema;
        let target = root
            .pointer(pointer)
            .ok_or_else(|| anyhow!("$ref {reference:?} does not resolve"))?;

        let base = pointer.rsplit('/').next().filter(|s| !s.is_empty()).unwrap_or("root");
        let name = self.fresh_name(base);
        self.refs.insert(key, name.clone());
        let body = self.visit(target, depth, reference)?;
        self.rules.push((name.clone(), body));
        Ok(name)
    }

    /// Rule matching any JSON value, created on first use.
    fn any_value(&mut self) -> String {
        if let Some(name) = &self.any_value {
            return name.clone();
        }
        let name = self.fresh_name("any_value");
        self.any_value = Some(name.clone());
        let string = self.json_string();
        let number = self.fresh_name("json_number");
        self.rules.push((number.clone(), JSON_NUMBER.to_string()));

        let (obj_open, obj_close, arr_open, arr_close, sep, kv) = self.layout.flat();
        let pair = format!("{string} {kv} {name}");
        let object = format!("{obj_open} ({pair} ({sep} {pair})*)? {obj_close}");
        let array = format!("{arr_open} ({name} ({sep} {name})*)? {arr_close}");
        self.rules.push((
            name.clone(),
            format!("{object} | {array} | {string} | {number} | \"true\" | \"false\" | \"null\""),
        ));
        name
    }

    /// Rule matching any JSON string, created on first use.
    fn json_string(&mut self) -> String {
        if let Some(name) = &self.json_string {
            return name.clone();
        }
        let name = self.fresh_name("json_string");
        self.json_string = Some(name.clone());
        let char_rule = self.json_char();
        self.rules
            .push((name.clone(), format!("\"\\\"\" {char_rule}* \"\\\"\"")));
        name
    }

    fn json_char(&mut self) -> String {
        if let Some(name) = &self.json_char {
            return name.clone();
        }
        let name = self.fresh_name("json_char");
        self.json_char = Some(name.clone());
        let unescaped = render_class(true, &[(0x00, 0x1F), (0x22, 0x22), (0x5C, 0x5C)]);
        self.rules.push((
            name.clone(),
            format!("{unescaped} | \"\\\\\" ([\"\\\\/bfnrt] | \"u\" [0-9a-fA-F]{{4}})"),
        ));
        name
    }

    fn visit_string(&mut self, obj: &Map<String, Value>, path: &str) -> Result<String> {
        let format_pattern = obj
            .get("format")
            .and_then(Value::as_str)
            .and_then(format_to_regex);
        let pattern = match format_pattern {
            Some(p) => Some(p),
            None => obj.get("pattern").map(|p| {
                p.as_str()
                    .ok_or_else(|| anyhow!("{path}: pattern must be a string"))
            }).transpose()?,
        };
        if let Some(pattern) = pattern {
            let body = regex_to_ebnf_body(pattern)?;
            return Ok(format!("\"\\\"\" ({body}) \"\\\"\""));
        }

        let min_len = obj.get("minLength").and_then(Value::as_u64).unwrap_or(0);
        let max_len = obj.get("maxLength").and_then(Value::as_u64);
        if (min_len, max_len) == (0, None) {
            return Ok(self.json_string());
        }
        if max_len.is_some_and(|max| max < min_len) {
            bail!("{path}: minLength is greater than maxLength");
        }

        let char_rule = self.json_char();
        Ok(match repeat(&char_rule, min_len, max_len) {
            Some(chars) => format!("\"\\\"\" {chars} \"\\\"\""),
            None => "\"\\\"\\\"\"".to_string(),
        })
    }

    fn visit_integer(&mut self, obj: &Map<String, Value>, path: &str) -> Result<String> {
        let (lo, hi) = integer_bounds(obj, path)?;
        if let (Some(lo), Some(hi)) = (lo, hi) {
            if lo > hi {
                bail!("{path}: no integer satisfies the minimum and maximum");
            }
        }
        if (lo, hi) == (None, None) {
            return Ok("\"-\"? (\"0\" | [1-9] [0-9]*)".to_string());
        }
        regex_to_ebnf_body(&integer_regex(lo, hi))
    }

    fn visit_number(&mut self, obj: &Map<String, Value>, path: &str) -> Result<String> {
        let (lo, hi) = integer_bounds(obj, path)?;
        if (lo, hi) == (None, None) {
            return Ok(JSON_NUMBER.to_string());
        }

        let mut parts = Vec::new();
        if lo.zip(hi).map_or(true, |(lo, hi)| lo <= hi) {
            parts.push(integer_regex(lo, hi));
        }
        // Non-negative integer part k covers [k, k + 1).
        let frac_lo = lo.map_or(0, |lo| lo.max(0));
        let frac_hi = hi.map(|hi| hi - 1);
        if frac_hi.map_or(true, |hi| frac_lo <= hi) {
            parts.push(format!("{}\\.[0-9]+", integer_regex(Some(frac_lo), frac_hi)));
        }
        // Negative integer part -k covers (-k - 1, -k].
        if lo.map_or(true, |lo| lo <= -1) && hi.map_or(true, |hi| hi >= 0) {
            parts.push("-0\\.[0-9]+".to_string());
        }
        let neg_lo = hi.map_or(1, |hi| hi.saturating_neg().max(1));
        let neg_hi = lo.map(|lo| lo.saturating_neg().saturating_sub(1));
        if neg_hi.map_or(true, |hi| neg_lo <= hi) {
            parts.push(format!(
                "-{}\\.[0-9]+",
                integer_regex(Some(neg_lo), neg_hi)
            ));
        }

        if parts.is_empty() {
            bail!("{path}: no number satisfies the minimum and maximum");
        }
        regex_to_ebnf_body(&regex_alternatives(parts))
    }

    fn visit_array(&mut self, obj: &Map<String, Value>, depth: usize, path: &str) -> Result<String> {
        let prefix: &[Value] = match obj.get("prefixItems") {
            Some(Value::Array(items)) => items,
            Some(_) => bail!("{path}: prefixItems must be an array"),
            None => &[],
        };
        let additional: Option<&Value> = match obj.get("items") {
            Some(Value::Bool(false)) => None,
            Some(schema) => Some(schema),
            None if self.options.strict_mode => None,
            None => Some(&TRUE_SCHEMA),
        };
        let min_items = obj.get("minItems").and_then(Value::as_u64).unwrap_or(0);
        let max_items = obj.get("maxItems").and_then(Value::as_u64);
        let n = prefix.len() as u64;

        if max_items.is_some_and(|max| max < min_items) {
            bail!("{path}: minItems is greater than maxItems");
        }
        if max_items.is_some_and(|max| max < n) {
            bail!("{path}: maxItems is smaller than the number of prefixItems");
        }
        if additional.is_none() && min_items > n {
            bail!("{path}: minItems requires more items than the schema allows");
        }

        let extra_min = min_items.saturating_sub(n);
        let extra_max = match additional {
            None => Some(0),
            Some(_) => max_items.map(|max| max - n),
        };

        let mut elements = Vec::with_capacity(prefix.len());
        for (i, item) in prefix.iter().enumerate() {
            elements.push(self.visit(item, depth + 1, &format!("{path}/prefixItems/{i}"))?);
        }
        let extra = match additional {
            Some(schema) if extra_max != Some(0) => {
                Some(self.visit(schema, depth + 1, &format!("{path}/items"))?)
            }
            _ => None,
        };

        let sep = self.layout.item_sep(depth);
        let (body, may_be_empty) = match extra {
            None if elements.is_empty() => return Ok(self.layout.empty('[', ']')),
            None => (elements.join(&format!(" {sep} ")), false),
            Some(extra) if elements.is_empty() => {
                let rest = repeat(
                    &format!("{sep} {extra}"),
                    extra_min.saturating_sub(1),
                    extra_max.map(|max| max - 1),
                );
                let body = match rest {
                    Some(rest) => format!("{extra} {rest}"),
                    None => extra,
                };
                (body, extra_min == 0)
            }
            Some(extra) => {
                let mut body = elements.join(&format!(" {sep} "));
                if let Some(rest) = repeat(&format!("{sep} {extra}"), extra_min, extra_max) {
                    body = format!("{body} {rest}");
                }
                (body, false)
            }
        };
        Ok(self.container('[', ']', depth, &body, may_be_empty))
    }

    fn visit_object(&mut self, obj: &Map<String, Value>, depth: usize, path: &str) -> Result<String> {
        let empty_props = Map::new();
        let properties = match obj.get("properties") {
            Some(Value::Object(props)) => props,
            Some(_) => bail!("{path}: properties must be an object"),
            None => &empty_props,
        };
        let required: Vec<&str> = match obj.get("required") {
            Some(Value::Array(keys)) => keys
                .iter()
                .map(|k| k.as_str().ok_or_else(|| anyhow!("{path}: required entries must be strings")))
                .collect::<Result<_>>()?,
            Some(_) => bail!("{path}: required must be an array"),
            None => Vec::new(),
        };
        let additional: Option<&Value> = match obj.get("additionalProperties") {
            Some(Value::Bool(false)) => None,
            Some(Value::Bool(true)) => Some(&TRUE_SCHEMA),
            Some(schema @ Value::Object(_)) => Some(schema),
            Some(other) => bail!("{path}: unexpected additionalProperties {other}"),
            None if self.options.strict_mode => None,
            None => Some(&TRUE_SCHEMA),
        };

        let min_props = obj.get("minProperties").and_then(Value::as_u64).unwrap_or(0);
        if let Some(max) = obj.get("maxProperties").and_then(Value::as_u64) {
            if min_props > max {
                bail!("{path}: minProperties is greater than maxProperties");
            }
            if required.len() as u64 > max {
                bail!("{path}: more required properties than maxProperties allows");
            }
            if max == 0 {
                return Ok(self.layout.empty('{', '}'));
            }
        }

        let kv = self.layout.kv_sep();
        let mut pairs: Vec<(String, bool)> = Vec::new();
        for (key, schema) in properties {
            let value = self.visit(schema, depth + 1, &format!("{path}/properties/{key}"))?;
            let pair = format!("{} {kv} {value}", json_literal(&Value::String(key.clone())));
            pairs.push((pair, required.contains(&key.as_str())));
        }
        for key in required.iter().filter(|k| !properties.contains_key(**k)) {
            let value = self.any_value();
            let pair = format!("{} {kv} {value}", json_literal(&Value::String(key.to_string())));
            pairs.push((pair, true));
        }
        let extra_pair = match additional {
            Some(schema) => {
                let key = self.json_string();
                let value = self.visit(schema, depth + 1, &format!("{path}/additionalProperties"))?;
                Some(format!("{key} {kv} {value}"))
            }
            None => None,
        };

        let sep = self.layout.item_sep(depth);
        // Properties from index `i` on, after at least one has been written.
        let tail = |i: usize| -> String {
            let mut parts: Vec<String> = pairs[i..]
                .iter()
                .map(|(pair, required)| {
                    if *required {
                        format!("{sep} {pair}")
                    } else {
                        format!("({sep} {pair})?")
                    }
                })
                .collect();
            if let Some(extra) = &extra_pair {
                parts.push(format!("({sep} {extra})*"));
            }
            parts.join(" ")
        };

        let mut alts = Vec::new();
        for (i, (pair, required)) in pairs.iter().enumerate() {
            let rest = tail(i + 1);
            alts.push(if rest.is_empty() { pair.clone() } else { format!("{pair} {rest}") });
            if *required {
                break;
            }
        }
        let all_optional = pairs.iter().all(|(_, required)| !required);
        if all_optional {
            if let Some(extra) = &extra_pair {
                alts.push(format!("{extra} ({sep} {extra})*"));
            }
        }

        if alts.is_empty() {
            return Ok(self.layout.empty('{', '}'));
        }
        let body = alternatives(alts);
        Ok(self.container('{', '}', depth, &body, all_optional && min_props == 0))
    }

    fn container(&self, open: char, close: char, depth: usize, body: &str, may_be_empty: bool) -> String {
        let full = format!(
            "{} {} {}",
            self.layout.open(open, depth),
            body,
            self.layout.close(close, depth)
        );
        if may_be_empty {
            format!("({} | {})", full, self.layout.empty(open, close))
        } else {
            full
        }
    }
}

fn alternatives(mut alts: Vec<String>) -> String {
    if alts.len() == 1 {
        return alts.swap_remove(0);
    }
    format!("({})", alts.join(" | "))
}

/// `(expr){min,max}` in EBNF, or `None` when at most zero repetitions.
fn repeat(expr: &str, min: u64, max: Option<u64>) -> Option<String> {
    let suffix = match (min, max) {
        (_, Some(0)) => return None,
        (0, None) => "*".to_string(),
        (1, None) => "+".to_string(),
        (0, Some(1)) => "?".to_string(),
        (min, None) => format!("{{{min},}}"),
        (min, Some(max)) if min == max => format!("{{{min}}}"),
        (min, Some(max)) => format!("{{{min},{max}}}"),
    };
    Some(format!("({expr}){suffix}"))
}

/// The EBNF literal for the compact JSON text of `value`.
fn json_literal(value: &Value) -> String {
    ebnf_string(&value.to_string())
}

/// Integer bounds implied by minimum/maximum and their exclusive forms.
fn integer_bounds(obj: &Map<String, Value>, path: &str) -> Result<(Option<i64>, Option<i64>)> {
    let number = |key: &str| -> Result<Option<f64>> {
        match obj.get(key) {
            None => Ok(None),
            Some(v) => v
                .as_f64()
                .filter(|v| v.is_finite() && v.abs() < 9.0e18)
                .map(Some)
                .ok_or_else(|| anyhow!("{path}: {key} must be a number within the i64 range")),
        }
    };
    let lo = [
        number("minimum")?.map(|v| v.ceil() as i64),
        number("exclusiveMinimum")?.map(|v| v.floor() as i64 + 1),
    ]
    .into_iter()
    .flatten()
    .max();
    let hi = [
        number("maximum")?.map(|v| v.floor() as i64),
        number("exclusiveMaximum")?.map(|v| v.ceil() as i64 - 1),
    ]
    .into_iter()
    .flatten()
    .min();
    Ok((lo, hi))
}

fn regex_alternatives(mut parts: Vec<String>) -> String {
    if parts.len() == 1 {
        return parts.swap_remove(0);
    }
    format!("(?:{})", parts.join("|"))
}

/// A regex matching exactly the decimal integers in `[min, max]`.
fn integer_regex(min: Option<i64>, max: Option<i64>) -> String {
    match (min, max) {
        (None, None) => "-?(?:0|[1-9][0-9]*)".to_string(),
        (Some(lo), Some(hi)) => {
            let mut parts = Vec::new();
            if lo < 0 {
                let neg_lo = if hi < 0 { hi.unsigned_abs() } else { 1 };
                parts.push(format!("-{}", nonneg_range(neg_lo, lo.unsigned_abs())));
            }
            if hi >= 0 {
                parts.push(nonneg_range(lo.max(0) as u64, hi as u64));
            }
            regex_alternatives(parts)
        }
        (Some(lo), None) if lo >= 0 => nonneg_at_least(lo as u64),
        (Some(lo), None) => regex_alternatives(vec![
            format!("-{}", nonneg_range(1, lo.unsigned_abs())),
            nonneg_at_least(0),
        ]),
        (None, Some(hi)) if hi >= 0 => {
            regex_alternatives(vec!["-[1-9][0-9]*".to_string(), nonneg_range(0, hi as u64)])
        }
        (None, Some(hi)) => format!("-{}", nonneg_at_least(hi.unsigned_abs())),
    }
}

fn digits(n: u64) -> Vec<u8> {
    n.to_string().bytes().map(|b| b - b'0').collect()
}

/// Non-negative integers in `[lo, hi]` without leading zeros.
fn nonneg_range(lo: u64, hi: u64) -> String {
    let (lo_digits, hi_digits) = (digits(lo), digits(hi));
    if lo_digits.len() == hi_digits.len() {
        return same_length_range(&lo_digits, &hi_digits);
    }

    let mut parts = vec![same_length_range(&lo_digits, &vec![9; lo_digits.len()])];
    for len in lo_digits.len() + 1..hi_digits.len() {
        parts.push(format!("[1-9][0-9]{{{}}}", len - 1));
    }
    let mut floor = vec![0; hi_digits.len()];
    floor[0] = 1;
    parts.push(same_length_range(&floor, &hi_digits));
    regex_alternatives(parts)
}

fn nonneg_at_least(lo: u64) -> String {
    if lo == 0 {
        return "(?:0|[1-9][0-9]*)".to_string();
    }
    let lo_digits = digits(lo);
    regex_alternatives(vec![
        same_length_range(&lo_digits, &vec![9; lo_digits.len()]),
        format!("[1-9][0-9]{{{},}}", lo_digits.len()),
    ])
}

/// Digit strings of one length between `lo` and `hi` inclusive.
fn same_length_range(lo: &[u8], hi: &[u8]) -> String {
    let Some((&lo_first, lo_rest)) = lo.split_first() else {
        return String::new();
    };
    let Some((&hi_first, hi_rest)) = hi.split_first() else {
        return String::new();
    };
    if lo_rest.is_empty() {
        return digit_class(lo_first, hi_first);
    }
    if lo_first == hi_first {
        return format!("{}{}", lo_first, same_length_range(lo_rest, hi_rest));
    }
    let rest = lo_rest.len();
    if lo_rest.iter().all(|&d| d == 0) && hi_rest.iter().all(|&d| d == 9) {
        return format!("{}[0-9]{{{}}}", digit_class(lo_first, hi_first), rest);
    }

    let mut parts = vec![format!(
        "{}{}",
        lo_first,
        same_length_range(lo_rest, &vec![9; rest])
    )];
    if lo_first + 1 < hi_first {
        parts.push(format!(
            "{}[0-9]{{{}}}",
            digit_class(lo_first + 1, hi_first - 1),
            rest
        ));
    }
    parts.push(format!(
        "{}{}",
        hi_first,
        same_length_range(&vec![0; rest], hi_rest)
    ));
    regex_alternatives(parts)
}

fn digit_class(lo: u8, hi: u8) -> String {
    if lo == hi {
        lo.to_string()
    } else {
        format!("[{}-{}]", lo, hi)
    }
}

/// Map a JSON Schema format name to a regex pattern.
/// Unknown formats return None and are ignored, as JSON Schema allows.
fn format_to_regex(format: &str) -> Option<&'static str> {
    Some(match format {
        "date" => r"\d{4}-(0[1-9]|1[0-2])-(0[1-9]|[1-2]\d|3[01])",
        "time" => r"([01]\d|2[0-3]):[0-5]\d:([0-5]\d|60)(\.\d+)?(Z|[+-]([01]\d|2[0-3]):[0-5]\d)",
        "date-time" => {
            r"\d{4}-(0[1-9]|1[0-2])-(0[1-9]|[1-2]\d|3[01])T([01]\d|2[0-3]):[0-5]\d:([0-5]\d|60)(\.\d+)?(Z|[+-]([01]\d|2[0-3]):[0-5]\d)"
        }
        "email" => {
            r"[a-zA-Z0-9.!#$%&'*+/=?^_`{|}~-]+@[a-zA-Z0-9]([a-zA-Z0-9-]*[a-zA-Z0-9])?(\.[a-zA-Z0-9]([a-zA-Z0-9-]*[a-zA-Z0-9])?)*"
        }
        "uuid" => r"[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}",
        "ipv4" => r"((25[0-5]|2[0-4]\d|[01]?\d\d?)\.){3}(25[0-5]|2[0-4]\d|[01]?\d\d?)",
        "hostname" => {
            r"[a-zA-Z0-9]([a-zA-Z0-9-]*[a-zA-Z0-9])?(\.[a-zA-Z0-9]([a-zA-Z0-9-]*[a-zA-Z0-9])?)*"
        }
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use serde_json::json;

    fn ebnf(schema: Value, options: &JsonSchemaOptions) -> String {
        json_schema_to_ebnf(&schema, options).unwrap()
    }

    #[test]
    fn test_integer_range_regexes() {
        assert_eq!(nonneg_range(0, 9), "[0-9]");
        assert_eq!(nonneg_range(5, 25), "(?:[5-9]|(?:1[0-9]|2[0-5]))");
        assert_eq!(nonneg_range(10, 99), "[1-9][0-9]{1}");
        assert_eq!(integer_regex(Some(-5), Some(5)), "(?:-[1-5]|[0-5])");
        assert_eq!(integer_regex(Some(-20), Some(-10)), "-(?:1[0-9]|20)");
        assert_eq!(integer_regex(Some(7), None), "(?:[7-9]|[1-9][0-9]{1,})");
        assert_eq!(integer_regex(None, Some(-3)), "-(?:[3-9]|[1-9][0-9]{1,})");
    }

    #[test]
    fn test_bounds_from_exclusive_keywords() {
        let obj = json!({"exclusiveMinimum": 0, "maximum": 10.5});
        let bounds = integer_bounds(obj.as_object().unwrap(), "#").unwrap();
        assert_eq!(bounds, (Some(1), Some(10)));
    }

    #[test]
    fn test_strict_object_without_properties_is_empty() {
        let out = ebnf(json!({"type": "object"}), &JsonSchemaOptions::default());
        assert!(out.starts_with("root ::= \"{\" ws \"}\"\n"), "{out}");
    }

    #[test]
    fn test_compact_layout_without_whitespace_rule() {
        let options = JsonSchemaOptions {
            any_whitespace: false,
            ..Default::default()
        };
        let out = ebnf(
            json!({"type": "object", "properties": {"a": {"type": "integer"}}, "required": ["a"]}),
            &options,
        );
        assert!(out.contains(r#""{" "\"a\"" ": " "-"? ("0" | [1-9] [0-9]*) "}""#), "{out}");
        assert!(!out.contains("ws ::="));
    }

    #[test]
    fn test_max_whitespace_bounds_ws_rule() {
        let options = JsonSchemaOptions {
            max_whitespace: Some(2),
            ..Default::default()
        };
        let out = ebnf(json!({"type": "null"}), &options);
        assert!(out.ends_with("ws ::= [ \\t\\n\\r]{0,2}\n"), "{out}");
    }

    #[test]
    fn test_recursive_ref_reuses_rule() {
        let schema = json!({
            "$defs": {"node": {"type": "object", "properties": {
                "next": {"anyOf": [{"$ref": "#/$defs/node"}, {"type": "null"}]}
            }}},
            "$ref": "#/$defs/node"
        });
        let out = ebnf(schema, &JsonSchemaOptions::default());
        assert_eq!(out.matches("node ::=").count(), 1, "{out}");
        assert!(Grammar::from_json_schema_value(&json!({"$ref": "#"}), &Default::default()).is_ok());
    }

    #[test]
    fn test_errors() {
        let options = JsonSchemaOptions::default();
        assert!(matches!(
            Grammar::from_json_schema("{not json", &options),
            Err(Error::InvalidJson(_))
        ));
        for schema in [
            r#"{"type": "foo"}"#,
            r##"{"$ref": "#/$defs/missing"}"##,
            r#"{"type": "integer", "minimum": 5, "maximum": 1}"#,
            r#"{"type": "string", "pattern": "(?=x)"}"#,
            r#"{"enum": []}"#,
            "false",
            "3",
        ] {
            let err = Grammar::from_json_schema(schema, &options).unwrap_err();
            assert!(matches!(err, Error::InvalidJsonSchema(_)), "{schema}: {err:?}");
        }
    }

    #[test]
    fn test_complex_schema_parses() {
        let schema = json!({
            "type": "object",
            "properties": {
                "name": {"type": "string", "minLength": 1, "maxLength": 8},
                "age": {"type": "integer", "minimum": 0, "maximum": 150},
                "score": {"type": "number", "minimum": -1, "maximum": 1},
                "tags": {"type": "array", "items": {"type": "string"}, "maxItems": 3},
                "pair": {"type": "array", "prefixItems": [{"type": "boolean"}, {"const": 1}]},
                "when": {"type": "string", "format": "date"},
                "kind": {"enum": ["a", "b", null]}
            },
            "required": ["name"],
            "additionalProperties": false
        });
        for options in [
            JsonSchemaOptions::default(),
            JsonSchemaOptions { any_whitespace: false, indent: Some(2), ..Default::default() },
            JsonSchemaOptions { any_whitespace: false, strict_mode: false, ..Default::default() },
        ] {
            let grammar = Grammar::from_json_schema_value(&schema, &options).unwrap();
            assert_eq!(grammar.root().name, "root");
        }
    }
}
