//! EBNF parser: parses EBNF grammar strings into `Grammar`.
//!
//! Supports:
//! - String literals with UTF-8 and escape sequences
//! - Character classes with Unicode ranges, negation
//! - Rule references
//! - Sequences, choices (|), grouping with parentheses
//! - Quantifiers: *, +, ?, {n}, {n,m}, {n,}
//! - Lookahead assertions: (= ...)
//! - Comments: # to end of line

use anyhow::{anyhow, bail, Result};

use super::builder::GrammarBuilder;
use super::{Expr, ExprId, Grammar, RuleId};

// ─── UTF-8 / Escape helpers ──────────────────────────────────────────

fn hex_value(c: u8) -> Option<u32> {
    (c as char).to_digit(16)
}

fn fixed_hex(data: &[u8], digits: usize, what: &str) -> Result<u32> {
    if data.len() < digits {
        bail!("invalid {what} escape: need {digits} hex digits");
    }
    data[..digits].iter().try_fold(0u32, |acc, &c| {
        hex_value(c)
            .map(|d| acc * 16 + d)
            .ok_or_else(|| anyhow!("invalid hex digit in {what} escape"))
    })
}

/// Parse an escape sequence starting at `\`. Returns (codepoint, bytes_consumed).
fn parse_escape(data: &[u8], extra_escapes: &[u8]) -> Result<(u32, usize)> {
    if data.len() < 2 || data[0] != b'\\' {
        bail!("expected escape sequence");
    }
    if extra_escapes.contains(&data[1]) {
        return Ok((data[1] as u32, 2));
    }
    let simple = match data[1] {
        b'\'' | b'"' | b'?' | b'\\' | b'/' => Some(data[1] as u32),
        b'a' => Some(0x07),
        b'b' => Some(0x08),
        b'f' => Some(0x0C),
        b'n' => Some(0x0A),
        b'r' => Some(0x0D),
        b't' => Some(0x09),
        b'v' => Some(0x0B),
        b'0' => Some(0x00),
        b'e' => Some(0x1B),
        _ => None,
    };
    if let Some(cp) = simple {
        return Ok((cp, 2));
    }
    match data[1] {
        b'x' => {
            let len = data[2..].iter().take_while(|&&c| hex_value(c).is_some()).count();
            if len == 0 {
                bail!("invalid \\x escape: no hex digits");
            }
            let cp = fixed_hex(&data[2..], len.min(8), "\\x")?;
            Ok((cp, 2 + len.min(8)))
        }
        b'u' => Ok((fixed_hex(&data[2..], 4, "\\u")?, 6)),
        b'U' => Ok((fixed_hex(&data[2..], 8, "\\U")?, 10)),
        other => bail!("invalid escape sequence: \\{}", other as char),
    }
}

/// Parse next UTF-8 char or escape sequence. Returns (codepoint, bytes_consumed).
fn parse_next_utf8_or_escaped(data: &[u8], extra_escapes: &[u8]) -> Result<(u32, usize)> {
    let Some(&first) = data.first() else {
        bail!("unexpected end of input");
    };
    if first == b'\\' {
        return parse_escape(data, extra_escapes);
    }
    let len = match first {
        0x00..=0x7F => 1,
        0xC0..=0xDF => 2,
        0xE0..=0xEF => 3,
        0xF0..=0xF7 => 4,
        _ => bail!("invalid UTF-8 lead byte 0x{first:02x}"),
    };
    let chunk = data.get(..len).ok_or_else(|| anyhow!("truncated UTF-8 sequence"))?;
    let c = std::str::from_utf8(chunk)
        .ok()
        .and_then(|s| s.chars().next())
        .ok_or_else(|| anyhow!("invalid UTF-8 sequence"))?;
    Ok((c as u32, len))
}

/// Characters that may be backslash-escaped inside `[...]` to mean themselves.
const CHAR_CLASS_ESCAPES: &[u8] = b"^$\\.*+?()[]{}|/-";

// ─── Token types ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
enum TokenType {
    RuleName,
    Identifier,
    StringLiteral,
    LBracket,
    RBracket,
    Caret,
    CharInCharClass(u32),
    Dash,
    Assign,
    LParen,
    RParen,
    LBrace,
    RBrace,
    Pipe,
    Star,
    Plus,
    Question,
    LookaheadLParen,
    IntegerLiteral(i64),
    Comma,
    EndOfFile,
}

#[derive(Debug, Clone)]
struct Token {
    ty: TokenType,
    /// Decoded text for string literals, the name for identifiers.
    value: String,
    line: usize,
    col: usize,
}

// ─── Lexer ───────────────────────────────────────────────────────────

struct Lexer<'a> {
    input: &'a [u8],
    pos: usize,
    line: usize,
    col: usize,
}

impl<'a> Lexer<'a> {
    fn new(input: &'a str) -> Self {
        Self {
            input: input.as_bytes(),
            pos: 0,
            line: 1,
            col: 1,
        }
    }

    fn peek(&self) -> Option<u8> {
        self.input.get(self.pos).copied()
    }

    fn peek_at(&self, delta: usize) -> Option<u8> {
        self.input.get(self.pos + delta).copied()
    }

    fn advance(&mut self) {
        if let Some(b) = self.peek() {
            if b == b'\n' || (b == b'\r' && self.peek_at(1) != Some(b'\n')) {
                self.line += 1;
                self.col = 1;
            } else {
                self.col += 1;
            }
            self.pos += 1;
        }
    }

    fn advance_n(&mut self, n: usize) {
        for _ in 0..n {
            self.advance();
        }
    }

    fn token(&self, ty: TokenType, line: usize, col: usize) -> Token {
        Token { ty, value: String::new(), line, col }
    }

    fn skip_whitespace_and_comments(&mut self) {
        loop {
            match self.peek() {
                Some(b' ' | b'\t' | b'\n' | b'\r') => self.advance(),
                Some(b'#') => {
                    while let Some(b) = self.peek() {
                        if b == b'\n' || b == b'\r' {
                            break;
                        }
                        self.advance();
                    }
                }
                _ => break,
            }
        }
    }

    fn err(&self, msg: &str) -> anyhow::Error {
        anyhow!("EBNF lexer error at line {}, column {}: {}", self.line, self.col, msg)
    }

    fn is_name_char(c: u8, is_first: bool) -> bool {
        c == b'_'
            || c == b'-'
            || c == b'.'
            || c.is_ascii_alphabetic()
            || (!is_first && c.is_ascii_digit())
    }

    fn lex_identifier(&mut self) -> String {
        let start = self.pos;
        let mut first = true;
        while let Some(c) = self.peek() {
            if !Self::is_name_char(c, first) {
                break;
            }
            self.advance();
            first = false;
        }
        String::from_utf8_lossy(&self.input[start..self.pos]).into_owned()
    }

    fn lex_string(&mut self) -> Result<Token> {
        let (line, col) = (self.line, self.col);
        self.advance(); // opening "

        let mut value = String::new();
        loop {
            match self.peek() {
                None | Some(b'\n') | Some(b'\r') => {
                    return Err(self.err("unterminated string literal"));
                }
                Some(b'"') => break,
                Some(_) => {
                    let (cp, len) = parse_next_utf8_or_escaped(&self.input[self.pos..], &[])
                        .map_err(|e| self.err(&e.to_string()))?;
                    let c = char::from_u32(cp)
                        .ok_or_else(|| self.err(&format!("invalid codepoint: U+{:04X}", cp)))?;
                    self.advance_n(len);
                    value.push(c);
                }
            }
        }
        self.advance(); // closing "

        Ok(Token { ty: TokenType::StringLiteral, value, line, col })
    }

    fn lex_char_class(&mut self, tokens: &mut Vec<Token>) -> Result<()> {
        tokens.push(self.token(TokenType::LBracket, self.line, self.col));
        self.advance();

        if self.peek() == Some(b'^') {
            tokens.push(self.token(TokenType::Caret, self.line, self.col));
            self.advance();
        }

        loop {
            let (line, col) = (self.line, self.col);
            match self.peek() {
                None => return Err(self.err("unterminated character class")),
                Some(b']') => break,
                Some(b'\r' | b'\n') => {
                    return Err(self.err("character class should not contain newline"));
                }
                Some(b'-') => {
                    tokens.push(self.token(TokenType::Dash, line, col));
                    self.advance();
                }
                Some(_) => {
                    let (cp, len) =
                        parse_next_utf8_or_escaped(&self.input[self.pos..], CHAR_CLASS_ESCAPES)
                            .map_err(|e| self.err(&e.to_string()))?;
                    self.advance_n(len);
                    tokens.push(self.token(TokenType::CharInCharClass(cp), line, col));
                }
            }
        }

        tokens.push(self.token(TokenType::RBracket, self.line, self.col));
        self.advance();
        Ok(())
    }

    fn lex_integer(&mut self) -> Result<Token> {
        let (line, col) = (self.line, self.col);
        let mut num: i64 = 0;
        while let Some(c) = self.peek().filter(u8::is_ascii_digit) {
            num = num * 10 + (c - b'0') as i64;
            self.advance();
            if num > 1_000_000_000_000_000 {
                return Err(self.err("integer too large"));
            }
        }
        Ok(self.token(TokenType::IntegerLiteral(num), line, col))
    }

    fn tokenize(&mut self) -> Result<Vec<Token>> {
        let mut tokens = Vec::new();

        loop {
            self.skip_whitespace_and_comments();
            let (line, col) = (self.line, self.col);

            let simple = match self.peek() {
                None => {
                    tokens.push(self.token(TokenType::EndOfFile, line, col));
                    break;
                }
                Some(b'(') if self.peek_at(1) == Some(b'=') => {
                    self.advance();
                    Some(TokenType::LookaheadLParen)
                }
                Some(b'(') => Some(TokenType::LParen),
                Some(b')') => Some(TokenType::RParen),
                Some(b'{') => Some(TokenType::LBrace),
                Some(b'}') => Some(TokenType::RBrace),
                Some(b'|') => Some(TokenType::Pipe),
                Some(b',') => Some(TokenType::Comma),
                Some(b'*') => Some(TokenType::Star),
                Some(b'+') => Some(TokenType::Plus),
                Some(b'?') => Some(TokenType::Question),
                Some(b':') => {
                    if self.peek_at(1) != Some(b':') || self.peek_at(2) != Some(b'=') {
                        return Err(self.err("unexpected character ':'"));
                    }
                    self.advance_n(2);
                    Some(TokenType::Assign)
                }
                _ => None,
            };
            if let Some(ty) = simple {
                self.advance();
                tokens.push(self.token(ty, line, col));
                continue;
            }

            match self.peek() {
                Some(b'"') => tokens.push(self.lex_string()?),
                Some(b'[') => self.lex_char_class(&mut tokens)?,
                Some(c) if Self::is_name_char(c, true) => {
                    let name = self.lex_identifier();
                    tokens.push(Token { ty: TokenType::Identifier, value: name, line, col });
                }
                Some(c) if c.is_ascii_digit() => tokens.push(self.lex_integer()?),
                Some(c) => {
                    return Err(self.err(&format!("unexpected character: '{}'", c as char)));
                }
                None => unreachable!("end of input handled above"),
            }
        }

        mark_rule_names(&mut tokens)?;
        Ok(tokens)
    }
}

/// Identifiers directly before `::=` are rule names; they must start a line.
fn mark_rule_names(tokens: &mut [Token]) -> Result<()> {
    for i in 0..tokens.len() {
        if tokens[i].ty != TokenType::Assign {
            continue;
        }
        if i == 0 {
            bail!(
                "EBNF parser error at line {}, column {}: ::= should not be the first token",
                tokens[i].line, tokens[i].col
            );
        }
        if tokens[i - 1].ty != TokenType::Identifier {
            bail!(
                "EBNF parser error at line {}, column {}: ::= should be preceded by an identifier",
                tokens[i - 1].line, tokens[i - 1].col
            );
        }
        if i >= 2 && tokens[i - 2].line == tokens[i - 1].line {
            bail!(
                "EBNF parser error at line {}, column {}: rule name should be at the beginning of the line",
                tokens[i - 1].line, tokens[i - 1].col
            );
        }
        tokens[i - 1].ty = TokenType::RuleName;
    }
    Ok(())
}

// ─── Parser ──────────────────────────────────────────────────────────

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    builder: GrammarBuilder,
    cur_rule_name: String,
}

impl Parser {
    fn new(tokens: Vec<Token>) -> Self {
        Self {
            tokens,
            pos: 0,
            builder: GrammarBuilder::new(),
            cur_rule_name: String::new(),
        }
    }

    fn peek(&self) -> &Token {
        // The lexer always terminates the stream with EndOfFile and the
        // parser never consumes past it.
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn peek_ty(&self) -> &TokenType {
        &self.peek().ty
    }

    fn consume(&mut self) {
        if self.pos + 1 < self.tokens.len() {
            self.pos += 1;
        }
    }

    fn expect(&mut self, expected: &TokenType, msg: &str) -> Result<()> {
        if std::mem::discriminant(self.peek_ty()) != std::mem::discriminant(expected) {
            return Err(self.parse_error(msg));
        }
        self.consume();
        Ok(())
    }

    fn parse_error(&self, msg: &str) -> anyhow::Error {
        let tok = self.peek();
        anyhow!("EBNF parser error at line {}, column {}: {}", tok.line, tok.col, msg)
    }

    /// Collect all rule names up front so rules can reference each other in
    /// any order.
    fn init_rule_names(&mut self, root_rule_name: &str) -> Result<()> {
        for tok in &self.tokens {
            if tok.ty != TokenType::RuleName {
                continue;
            }
            if self.builder.find_rule(&tok.value).is_some() {
                bail!(
                    "EBNF parser error at line {}, column {}: rule \"{}\" defined multiple times",
                    tok.line, tok.col, tok.value
                );
            }
            self.builder.add_rule(&tok.value);
        }
        if self.builder.find_rule(root_rule_name).is_none() {
            bail!("EBNF parser error: root rule \"{}\" not found", root_rule_name);
        }
        Ok(())
    }

    fn class_char(&self) -> Option<u32> {
        match self.peek_ty() {
            TokenType::CharInCharClass(cp) => Some(*cp),
            TokenType::Dash => Some(b'-' as u32),
            _ => None,
        }
    }

    fn parse_char_class(&mut self) -> Result<ExprId> {
        self.expect(&TokenType::LBracket, "expected [")?;

        let negated = *self.peek_ty() == TokenType::Caret;
        if negated {
            self.consume();
        }

        let mut ranges: Vec<(u32, u32)> = Vec::new();
        while *self.peek_ty() != TokenType::RBracket {
            let lo = self
                .class_char()
                .ok_or_else(|| self.parse_error("unexpected token in character class"))?;
            self.consume();

            let dash_then_char = *self.peek_ty() == TokenType::Dash
                && matches!(
                    self.tokens.get(self.pos + 1).map(|t| &t.ty),
                    Some(TokenType::CharInCharClass(_)) | Some(TokenType::Dash)
                );
            if !dash_then_char {
                ranges.push((lo, lo));
                continue;
            }
            self.consume(); // dash
            let hi = self
                .class_char()
                .ok_or_else(|| self.parse_error("expected range upper bound"))?;
            self.consume();
            if lo > hi {
                return Err(self.parse_error("invalid character class: lower bound > upper bound"));
            }
            ranges.push((lo, hi));
        }

        self.expect(&TokenType::RBracket, "expected ]")?;
        Ok(self.builder.add_character_class(negated, ranges))
    }

    fn parse_string(&mut self) -> Result<ExprId> {
        if *self.peek_ty() != TokenType::StringLiteral {
            return Err(self.parse_error("expected string literal"));
        }
        let value = std::mem::take(&mut self.tokens[self.pos].value);
        self.consume();

        if value.is_empty() {
            Ok(self.builder.add_empty_string())
        } else {
            Ok(self.builder.add_byte_string(value.as_bytes()))
        }
    }

    fn parse_rule_ref(&mut self) -> Result<ExprId> {
        let name = self.peek().value.clone();
        match self.builder.find_rule(&name) {
            Some(rule) => {
                self.consume();
                Ok(self.builder.add_rule_ref(rule))
            }
            None => Err(self.parse_error(&format!("rule \"{}\" is not defined", name))),
        }
    }

    fn parse_element(&mut self) -> Result<ExprId> {
        match self.peek_ty() {
            TokenType::LParen => {
                self.consume();
                if *self.peek_ty() == TokenType::RParen {
                    self.consume();
                    return Ok(self.builder.add_empty_string());
                }
                let expr = self.parse_choices()?;
                self.expect(&TokenType::RParen, "expected )")?;
                Ok(expr)
            }
            TokenType::LBracket => self.parse_char_class(),
            TokenType::StringLiteral => self.parse_string(),
            TokenType::Identifier => self.parse_rule_ref(),
            other => {
                let msg = format!("expected element, got {:?}", other);
                Err(self.parse_error(&msg))
            }
        }
    }

    fn parse_integer(&mut self) -> Result<u32> {
        match *self.peek_ty() {
            TokenType::IntegerLiteral(n) => {
                let n = u32::try_from(n).map_err(|_| self.parse_error("repetition bound too large"))?;
                self.consume();
                Ok(n)
            }
            _ => Err(self.parse_error("expected integer")),
        }
    }

    /// `{n}`, `{n,}` or `{n,m}`; the upper bound is `None` when open.
    fn parse_repetition_range(&mut self) -> Result<(u32, Option<u32>)> {
        self.expect(&TokenType::LBrace, "expected {")?;
        let lower = self.parse_integer()?;

        match self.peek_ty() {
            TokenType::RBrace => {
                self.consume();
                Ok((lower, Some(lower)))
            }
            TokenType::Comma => {
                self.consume();
                if *self.peek_ty() == TokenType::RBrace {
                    self.consume();
                    return Ok((lower, None));
                }
                let upper = self.parse_integer()?;
                if upper < lower {
                    return Err(self.parse_error("lower bound is larger than upper bound"));
                }
                self.expect(&TokenType::RBrace, "expected }")?;
                Ok((lower, Some(upper)))
            }
            _ => Err(self.parse_error("expected ',' or '}' in repetition range")),
        }
    }

    /// The rule an expression stands for: a plain rule reference is reused,
    /// anything else is hoisted into a fresh auxiliary rule.
    fn wrap_in_rule(&mut self, expr_id: ExprId) -> RuleId {
        if let Expr::RuleRef { rule } = self.builder.peek_expr(expr_id) {
            return *rule;
        }
        // Rule bodies are always choices so that printing them reparses to
        // the same shape.
        let body = if matches!(self.builder.peek_expr(expr_id), Expr::Choices { .. }) {
            expr_id
        } else {
            let seq = self.builder.add_sequence(vec![expr_id]);
            self.builder.add_choices(vec![seq])
        };
        let aux_rule = self.builder.add_rule_unique(&self.cur_rule_name);
        self.builder.set_rule_body(aux_rule, body);
        aux_rule
    }

    fn apply_quantifier(&mut self, expr_id: ExprId, min: u32, max: Option<u32>) -> ExprId {
        if (min, max) == (0, None) {
            if let Expr::CharacterClass { negated, ranges } = self.builder.peek_expr(expr_id) {
                let (negated, ranges) = (*negated, ranges.clone());
                return self.builder.add_character_class_star(negated, ranges);
            }
        }
        let rule = self.wrap_in_rule(expr_id);
        self.builder.add_repeat(rule, min, max)
    }

    fn parse_element_with_quantifier(&mut self) -> Result<ExprId> {
        let expr = self.parse_element()?;

        let (min, max) = match self.peek_ty() {
            TokenType::Star => (0, None),
            TokenType::Plus => (1, None),
            TokenType::Question => (0, Some(1)),
            TokenType::LBrace => {
                let (min, max) = self.parse_repetition_range()?;
                return Ok(self.apply_quantifier(expr, min, max));
            }
            _ => return Ok(expr),
        };
        self.consume();
        Ok(self.apply_quantifier(expr, min, max))
    }

    fn parse_sequence(&mut self) -> Result<ExprId> {
        let mut elements = Vec::new();
        loop {
            let element = self.parse_element_with_quantifier()?;
            // A group with a single alternative is spliced into the sequence.
            match self.builder.peek_expr(element) {
                Expr::Choices { items } if items.len() == 1 => match self.builder.peek_expr(items[0]) {
                    Expr::Sequence { items } => elements.extend_from_slice(items),
                    _ => elements.push(items[0]),
                },
                _ => elements.push(element),
            }
            if matches!(
                self.peek_ty(),
                TokenType::Pipe
                    | TokenType::RParen
                    | TokenType::LookaheadLParen
                    | TokenType::RuleName
                    | TokenType::EndOfFile
            ) {
                break;
            }
        }
        Ok(self.builder.add_sequence(elements))
    }

    fn parse_choices(&mut self) -> Result<ExprId> {
        let mut choices = Vec::new();
        loop {
            let seq = self.parse_sequence()?;
            // An alternative that is only a group contributes its alternatives.
            match self.builder.peek_expr(seq) {
                Expr::Sequence { items } if items.len() == 1 => match self.builder.peek_expr(items[0]) {
                    Expr::Choices { items } => choices.extend_from_slice(items),
                    _ => choices.push(seq),
                },
                _ => choices.push(seq),
            }
            if *self.peek_ty() != TokenType::Pipe {
                break;
            }
            self.consume();
        }
        Ok(self.builder.add_choices(choices))
    }

    fn parse_rule(&mut self) -> Result<()> {
        if *self.peek_ty() != TokenType::RuleName {
            return Err(self.parse_error("expected rule name"));
        }
        let name = self.peek().value.clone();
        let rule_id = self
            .builder
            .find_rule(&name)
            .ok_or_else(|| self.parse_error(&format!("rule \"{}\" was not registered", name)))?;
        self.cur_rule_name = name;
        self.consume();

        self.expect(&TokenType::Assign, "expected ::=")?;
        let body = self.parse_choices()?;
        self.builder.set_rule_body(rule_id, body);

        if *self.peek_ty() == TokenType::LookaheadLParen {
            self.consume();
            let la_expr = self.parse_choices()?;
            self.expect(&TokenType::RParen, "expected )")?;
            self.builder.set_rule_lookahead(rule_id, la_expr, false);
        }

        Ok(())
    }

    fn parse(mut self, root_rule_name: &str) -> Result<Grammar> {
        self.init_rule_names(root_rule_name)?;

        while *self.peek_ty() != TokenType::EndOfFile {
            self.parse_rule()?;
        }

        Ok(self.builder.build(root_rule_name)?)
    }
}

// ─── Public API ──────────────────────────────────────────────────────

pub(crate) fn parse_ebnf(source: &str, root_rule_name: &str) -> Result<Grammar> {
    let tokens = Lexer::new(source).tokenize()?;
    Parser::new(tokens).parse(root_rule_name)
}

impl Grammar {
    /// Parse an EBNF grammar string.
    ///
    /// # Example
    /// ```
    /// use pie_grammar::grammar::Grammar;
    ///
    /// let grammar = Grammar::from_ebnf(r#"root ::= "hello" | "world""#, "root").unwrap();
    /// assert_eq!(grammar.num_rules(), 1);
    /// ```
    pub fn from_ebnf(source: &str, root_rule_name: &str) -> crate::Result<Grammar> {
        parse_ebnf(source, root_rule_name).map_err(crate::Error::syntax)
    }
}
