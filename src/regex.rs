//! Regex-to-grammar converter.
//!
//! Converts a regular expression pattern to an EBNF grammar string,
//! then parses it into a `Grammar`. Follows JavaScript regex semantics.
//!
//! # Supported features
//! - Literals (any Unicode), character classes `[a-z]`, negated `[^...]`
//! - Quantifiers: `*`, `+`, `?`, `{n}`, `{n,}`, `{n,m}`, lazy forms
//! - Groups: `(...)`, `(?:...)`, `(?<name>...)`
//! - Alternation: `|`
//! - Escapes: `\d`, `\w`, `\s`, `\D`, `\W`, `\S`, `\uXXXX`, `\u{XXXXX}`, `\xHH`
//! - Any char: `.` (everything except line breaks)
//! - Anchors: a leading `^` and a trailing `$` are accepted and ignored
//!
//! # Unsupported (errors)
//! - Lookahead/lookbehind: `(?=...)`, `(?!...)`, `(?<=...)`, `(?<!...)`
//! - Backreferences: `\1`, `\k<name>`
//! - Unicode properties: `\p{...}`, `\P{...}`
//! - Word boundaries: `\b`, `\B`

use anyhow::{anyhow, bail, Result};

use crate::grammar::Grammar;

const DIGIT: &[(u32, u32)] = &[(0x30, 0x39)];
const WORD: &[(u32, u32)] = &[(0x30, 0x39), (0x41, 0x5A), (0x5F, 0x5F), (0x61, 0x7A)];
const SPACE: &[(u32, u32)] = &[
    (0x09, 0x0D),
    (0x20, 0x20),
    (0xA0, 0xA0),
    (0x2028, 0x2029),
    (0xFEFF, 0xFEFF),
];
const LINE_BREAKS: &[(u32, u32)] = &[(0x0A, 0x0A), (0x0D, 0x0D), (0x2028, 0x2029)];

impl Grammar {
    /// Grammar matching exactly the strings the pattern matches in full.
    ///
    /// # Example
    /// ```
    /// use pie_grammar::grammar::Grammar;
    ///
    /// let grammar = Grammar::from_regex("[a-z]+@example\\.com").unwrap();
    /// assert_eq!(grammar.root().name, "root");
    /// ```
    pub fn from_regex(pattern: &str) -> crate::Result<Grammar> {
        let ebnf = regex_to_ebnf(pattern)?;
        Grammar::from_ebnf(&ebnf, "root")
    }
}

/// Convert a regex pattern to an EBNF grammar string.
///
/// Returns a string like `root ::= [a-z]+\n`.
pub fn regex_to_ebnf(pattern: &str) -> crate::Result<String> {
    let body = regex_to_ebnf_body(pattern).map_err(crate::Error::syntax)?;
    Ok(format!("root ::= {}\n", body))
}

/// The EBNF expression for `pattern`, without a rule around it.
pub(crate) fn regex_to_ebnf_body(pattern: &str) -> Result<String> {
    RegexConverter::new(pattern)
        .convert()
        .map_err(|e| e.context(format!("while converting regex {pattern:?}")))
}

/// A converted sequence element. Literals are kept apart so that runs of
/// them merge into one string.
enum Piece {
    Literal(String),
    Expr(String),
}

impl Piece {
    fn into_ebnf(self) -> String {
        match self {
            Piece::Literal(s) => ebnf_string(&s),
            Piece::Expr(e) => e,
        }
    }
}

struct RegexConverter {
    input: Vec<char>,
    pos: usize,
}

impl RegexConverter {
    fn new(pattern: &str) -> Self {
        Self {
            input: pattern.chars().collect(),
            pos: 0,
        }
    }

    fn peek(&self) -> Option<char> {
        self.input.get(self.pos).copied()
    }

    fn peek_at(&self, delta: usize) -> Option<char> {
        self.input.get(self.pos + delta).copied()
    }

    fn next(&mut self) -> Result<char> {
        let c = self.peek().ok_or_else(|| anyhow!("unexpected end of pattern"))?;
        self.pos += 1;
        Ok(c)
    }

    fn eat(&mut self, c: char) -> bool {
        if self.peek() == Some(c) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, c: char) -> Result<()> {
        if !self.eat(c) {
            bail!("expected '{}' at position {}", c, self.pos);
        }
        Ok(())
    }

    fn convert(&mut self) -> Result<String> {
        self.eat('^');
        let result = self.parse_alternation()?;
        match self.peek() {
            None => Ok(result),
            Some(')') => bail!("unmatched ')' at position {}", self.pos),
            Some(c) => bail!("unexpected '{}' at position {}", c, self.pos),
        }
    }

    /// `a|b|c`
    fn parse_alternation(&mut self) -> Result<String> {
        let mut alternatives = vec![self.parse_sequence()?];
        while self.eat('|') {
            alternatives.push(self.parse_sequence()?);
        }
        if alternatives.len() == 1 {
            return Ok(alternatives.swap_remove(0));
        }
        Ok(format!("({})", alternatives.join(" | ")))
    }

    fn at_trailing_anchor(&self) -> bool {
        self.peek() == Some('$') && self.pos + 1 == self.input.len()
    }

    fn parse_sequence(&mut self) -> Result<String> {
        let mut pieces: Vec<Piece> = Vec::new();

        loop {
            match self.peek() {
                None | Some('|') | Some(')') => break,
                Some('$') if self.at_trailing_anchor() => {
                    self.pos += 1;
                    break;
                }
                _ => {}
            }
            let piece = self.parse_quantified_atom()?;
            match (pieces.last_mut(), piece) {
                (Some(Piece::Literal(prev)), Piece::Literal(s)) => prev.push_str(&s),
                (_, piece) => pieces.push(piece),
            }
        }

        if pieces.is_empty() {
            return Ok("\"\"".to_string());
        }
        Ok(pieces
            .into_iter()
            .map(Piece::into_ebnf)
            .collect::<Vec<_>>()
            .join(" "))
    }

    fn parse_quantified_atom(&mut self) -> Result<Piece> {
        let atom = self.parse_atom()?;
        let quantifier = match self.peek() {
            Some(q @ ('*' | '+' | '?')) => {
                self.pos += 1;
                q.to_string()
            }
            Some('{') if self.peek_at(1).is_some_and(|c| c.is_ascii_digit()) => {
                match self.parse_repetition()? {
                    (min, Some(max)) if max == min => format!("{{{min}}}"),
                    (min, Some(max)) => format!("{{{min},{max}}}"),
                    (min, None) => format!("{{{min},}}"),
                }
            }
            _ => return Ok(atom),
        };
        self.eat('?');
        if matches!(self.peek(), Some('*' | '+' | '?')) {
            bail!("consecutive quantifiers at position {}", self.pos);
        }
        Ok(Piece::Expr(format!("{}{}", atom_for_quantifier(atom), quantifier)))
    }

    fn parse_atom(&mut self) -> Result<Piece> {
        let pos = self.pos;
        match self.next()? {
            '(' => self.parse_group(),
            '[' => self.parse_char_class(),
            '.' => Ok(Piece::Expr(render_class(true, LINE_BREAKS))),
            '\\' => self.parse_escape(),
            c @ ('*' | '+' | '?') => bail!("nothing to repeat before '{}' at position {}", c, pos),
            c @ ('^' | '$') => bail!("anchor '{}' at position {} is only supported at the ends", c, pos),
            c => Ok(Piece::Literal(c.to_string())),
        }
    }

    fn parse_group(&mut self) -> Result<Piece> {
        if self.eat('?') {
            match self.next()? {
                ':' => {}
                '<' if matches!(self.peek(), Some('=' | '!')) => {
                    bail!("lookbehind assertions are not supported");
                }
                '<' => {
                    while !self.eat('>') {
                        if self.peek().is_none() {
                            bail!("unterminated group name");
                        }
                        self.pos += 1;
                    }
                }
                '=' | '!' => bail!("lookahead assertions are not supported"),
                c => bail!("unsupported group modifier '?{}'", c),
            }
        }

        let inner = self.parse_alternation()?;
        if !self.eat(')') {
            bail!("unmatched '(' before position {}", self.pos);
        }
        Ok(Piece::Expr(format!("({})", inner)))
    }

    fn parse_char_class(&mut self) -> Result<Piece> {
        let negated = self.eat('^');
        let mut ranges: Vec<(u32, u32)> = Vec::new();
        let mut first = true;

        loop {
            let c = self
                .peek()
                .ok_or_else(|| anyhow!("unclosed character class"))?;
            if c == ']' && !first {
                self.pos += 1;
                break;
            }
            first = false;

            let lo = match self.class_atom()? {
                ClassAtom::Set(set) => {
                    ranges.extend(set);
                    continue;
                }
                ClassAtom::Char(lo) => lo,
            };
            if self.peek() == Some('-') && !matches!(self.peek_at(1), Some(']') | None) {
                self.pos += 1;
                let hi = match self.class_atom()? {
                    ClassAtom::Char(hi) => hi,
                    ClassAtom::Set(_) => bail!("character class shorthand cannot end a range"),
                };
                if hi < lo {
                    bail!("range out of order in character class at position {}", self.pos);
                }
                ranges.push((lo, hi));
            } else {
                ranges.push((lo, lo));
            }
        }

        Ok(Piece::Expr(render_class(negated, &ranges)))
    }

    fn class_atom(&mut self) -> Result<ClassAtom> {
        let c = self.next()?;
        if c != '\\' {
            return Ok(ClassAtom::Char(c as u32));
        }
        let e = self.next()?;
        Ok(match e {
            'd' => ClassAtom::Set(DIGIT.to_vec()),
            'D' => ClassAtom::Set(complement(DIGIT)),
            'w' => ClassAtom::Set(WORD.to_vec()),
            'W' => ClassAtom::Set(complement(WORD)),
            's' => ClassAtom::Set(SPACE.to_vec()),
            'S' => ClassAtom::Set(complement(SPACE)),
            'b' => ClassAtom::Char(0x08),
            'p' | 'P' => bail!("unicode property escapes (\\p, \\P) are not supported"),
            other => ClassAtom::Char(self.escaped_char(other)?),
        })
    }

    /// Codepoint for a single-character escape whose letter was just read.
    fn escaped_char(&mut self, e: char) -> Result<u32> {
        Ok(match e {
            'n' => 0x0A,
            'r' => 0x0D,
            't' => 0x09,
            'f' => 0x0C,
            'v' => 0x0B,
            '0' => 0x00,
            'x' => self.read_hex(2)?,
            'u' if self.eat('{') => {
                let mut cp = 0u32;
                let mut digits = 0;
                while !self.eat('}') {
                    let c = self.next()?;
                    let d = c
                        .to_digit(16)
                        .ok_or_else(|| anyhow!("invalid hex digit '{}' in \\u{{...}}", c))?;
                    cp = cp.checked_mul(16).map(|v| v + d).filter(|&v| v <= 0x10FFFF).ok_or_else(
                        || anyhow!("\\u{{...}} escape is out of the Unicode range"),
                    )?;
                    digits += 1;
                }
                if digits == 0 {
                    bail!("empty \\u{{}} escape");
                }
                cp
            }
            'u' => self.read_hex(4)?,
            c => c as u32,
        })
    }

    fn parse_escape(&mut self) -> Result<Piece> {
        let e = self.next()?;
        let class = |ranges: &[(u32, u32)], negated: bool| Piece::Expr(render_class(negated, ranges));
        match e {
            'd' => Ok(class(DIGIT, false)),
            'D' => Ok(class(DIGIT, true)),
            'w' => Ok(class(WORD, false)),
            'W' => Ok(class(WORD, true)),
            's' => Ok(class(SPACE, false)),
            'S' => Ok(class(SPACE, true)),
            'b' | 'B' => bail!("word boundaries (\\b, \\B) are not supported"),
            'p' | 'P' => bail!("unicode property escapes (\\p, \\P) are not supported"),
            '1'..='9' | 'k' => bail!("backreferences are not supported"),
            other => {
                let cp = self.escaped_char(other)?;
                let c = char::from_u32(cp).ok_or_else(|| anyhow!("invalid codepoint U+{:04X}", cp))?;
                Ok(Piece::Literal(c.to_string()))
            }
        }
    }

    fn parse_repetition(&mut self) -> Result<(u32, Option<u32>)> {
        self.expect('{')?;
        let min = self.read_int()?;
        let max = if self.eat(',') {
            if self.peek() == Some('}') {
                None
            } else {
                Some(self.read_int()?)
            }
        } else {
            Some(min)
        };
        self.expect('}')?;
        if let Some(max) = max {
            if max < min {
                bail!("numbers out of order in {{{},{}}} quantifier", min, max);
            }
        }
        Ok((min, max))
    }

    fn read_int(&mut self) -> Result<u32> {
        let start = self.pos;
        let mut n: u32 = 0;
        while let Some(d) = self.peek().and_then(|c| c.to_digit(10)) {
            n = n
                .checked_mul(10)
                .and_then(|n| n.checked_add(d))
                .ok_or_else(|| anyhow!("repetition count too large"))?;
            self.pos += 1;
        }
        if self.pos == start {
            bail!("expected integer in repetition at position {}", self.pos);
        }
        Ok(n)
    }

    fn read_hex(&mut self, count: usize) -> Result<u32> {
        let mut v = 0u32;
        for _ in 0..count {
            let c = self.next()?;
            let d = c.to_digit(16).ok_or_else(|| anyhow!("expected hex digit, found '{}'", c))?;
            v = v * 16 + d;
        }
        Ok(v)
    }
}

enum ClassAtom {
    Char(u32),
    Set(Vec<(u32, u32)>),
}

/// Literal runs of more than one char must be grouped before a quantifier
/// applies to them.
fn atom_for_quantifier(atom: Piece) -> String {
    match atom {
        Piece::Literal(s) if s.chars().count() > 1 => format!("({})", ebnf_string(&s)),
        other => other.into_ebnf(),
    }
}

fn complement(ranges: &[(u32, u32)]) -> Vec<(u32, u32)> {
    let mut out = Vec::new();
    let mut next = 0u32;
    for &(lo, hi) in ranges {
        if lo > next {
            out.push((next, lo - 1));
        }
        next = hi + 1;
    }
    if next <= 0x10FFFF {
        out.push((next, 0x10FFFF));
    }
    out
}

/// Render a character class in EBNF syntax.
pub(crate) fn render_class(negated: bool, ranges: &[(u32, u32)]) -> String {
    let mut out = String::from("[");
    if negated {
        out.push('^');
    }
    for &(lo, hi) in ranges {
        push_class_char(&mut out, lo);
        if hi != lo {
            out.push('-');
            push_class_char(&mut out, hi);
        }
    }
    out.push(']');
    out
}

fn push_class_char(out: &mut String, cp: u32) {
    match char::from_u32(cp) {
        Some(c @ ('\\' | ']' | '^' | '-' | '[')) => {
            out.push('\\');
            out.push(c);
        }
        Some(c) if !c.is_control() && !c.is_whitespace() || c == ' ' => out.push(c),
        _ if cp <= 0xFFFF => out.push_str(&format!("\\u{:04x}", cp)),
        _ => out.push_str(&format!("\\U{:08x}", cp)),
    }
}

/// Quote `s` as an EBNF string literal.
pub(crate) fn ebnf_string(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c.is_control() => out.push_str(&format!("\\u{:04x}", c as u32)),
            c => out.push(c),
        }
    }
    out.push('"');
    out
}
