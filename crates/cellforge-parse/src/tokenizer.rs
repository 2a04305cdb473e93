//! Single-pass tokenizer for worksheet formulas.
//!
//! One walk over the source text classifies every byte: string literals are
//! consumed whole (so text that *looks* like a reference inside quotes never
//! leaks out as one), quoted sheet prefixes attach to the reference token
//! they qualify, and multi-character comparison operators are folded. Every
//! token carries its byte span in the original formula, which the
//! sub-expression machinery relies on for byte-exact extraction.

use std::error::Error;
use std::fmt::{self, Display};

/// Characters that terminate an accumulating operand token.
///
/// `:` is deliberately absent: `A1:B2` and `$H:$H` accumulate into a single
/// range operand.
const TOKEN_ENDERS: &str = ",;) +-*/^&=><%(";

#[inline]
fn is_token_ender(c: u8) -> bool {
    TOKEN_ENDERS.as_bytes().contains(&c)
}

/// Tokenizer failure: unterminated string, unmatched parenthesis.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenizerError {
    pub message: String,
    pub pos: usize,
}

impl Display for TokenizerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tokenizer error at {}: {}", self.pos, self.message)
    }
}

impl Error for TokenizerError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TokenType {
    Operand,
    Func,
    Paren,
    Sep,
    OpPrefix,
    OpInfix,
    OpPostfix,
    Whitespace,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TokenSubType {
    None,
    Text,
    Number,
    Logical,
    Error,
    Range,
    Open,
    Close,
}

/// One token of a formula, with its byte span in the source.
#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub value: String,
    pub token_type: TokenType,
    pub subtype: TokenSubType,
    pub start: usize,
    pub end: usize,
}

impl Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{:?}/{:?} {}>", self.token_type, self.subtype, self.value)
    }
}

impl Token {
    fn new(
        value: String,
        token_type: TokenType,
        subtype: TokenSubType,
        start: usize,
        end: usize,
    ) -> Self {
        Token {
            value,
            token_type,
            subtype,
            start,
            end,
        }
    }

    /// Classify an accumulated operand by its text.
    fn operand(source: &str, start: usize, end: usize) -> Self {
        let value = &source[start..end];
        let subtype = if value.starts_with('"') {
            TokenSubType::Text
        } else if value.starts_with('#') {
            TokenSubType::Error
        } else if value.eq_ignore_ascii_case("TRUE") || value.eq_ignore_ascii_case("FALSE") {
            TokenSubType::Logical
        } else if value.parse::<f64>().is_ok() {
            TokenSubType::Number
        } else {
            TokenSubType::Range
        };
        Token::new(value.to_string(), TokenType::Operand, subtype, start, end)
    }

    pub fn is_operator(&self) -> bool {
        matches!(
            self.token_type,
            TokenType::OpPrefix | TokenType::OpInfix | TokenType::OpPostfix
        )
    }

    /// True for tokens the parser skips entirely.
    pub fn is_whitespace(&self) -> bool {
        self.token_type == TokenType::Whitespace
    }
}

/// Tokenizes a formula in a single pass.
pub struct Tokenizer {
    formula: String,
    pub items: Vec<Token>,
    open_parens: Vec<usize>,
    offset: usize,
    token_start: usize,
    token_end: usize,
}

static ERROR_CODES: &[&str] = &[
    "#NULL!", "#DIV/0!", "#VALUE!", "#REF!", "#NAME?", "#NUM!", "#N/A",
];

impl Tokenizer {
    /// Tokenize `formula`. A leading `=` is accepted and skipped.
    pub fn new(formula: &str) -> Result<Self, TokenizerError> {
        let mut t = Tokenizer {
            formula: formula.to_string(),
            items: Vec::with_capacity(formula.len() / 3 + 4),
            open_parens: Vec::with_capacity(8),
            offset: 0,
            token_start: 0,
            token_end: 0,
        };
        t.run()?;
        Ok(t)
    }

    /// The tokens, consuming the tokenizer.
    pub fn into_tokens(self) -> Vec<Token> {
        self.items
    }

    #[inline]
    fn byte_at(&self, pos: usize) -> Option<u8> {
        self.formula.as_bytes().get(pos).copied()
    }

    #[inline]
    fn has_pending(&self) -> bool {
        self.token_end > self.token_start
    }

    #[inline]
    fn reset_pending(&mut self) {
        self.token_start = self.offset;
        self.token_end = self.offset;
    }

    fn flush_pending(&mut self) {
        if self.has_pending() {
            let tok = Token::operand(&self.formula, self.token_start, self.token_end);
            self.items.push(tok);
        }
        self.reset_pending();
    }

    fn run(&mut self) -> Result<(), TokenizerError> {
        if self.formula.starts_with('=') {
            self.offset = 1;
        }
        self.reset_pending();

        while self.offset < self.formula.len() {
            let b = self.formula.as_bytes()[self.offset];

            // '+'/'-' inside scientific notation extends the number.
            if (b == b'+' || b == b'-') && self.pending_is_scientific_base() {
                self.offset += 1;
                self.token_end = self.offset;
                continue;
            }

            if is_token_ender(b) && self.has_pending() && b != b'(' {
                self.flush_pending();
            }

            match b {
                b'"' => self.consume_string()?,
                b'\'' => self.consume_quoted_sheet()?,
                b'#' => self.consume_error_literal()?,
                b' ' | b'\t' | b'\n' | b'\r' => self.consume_whitespace(),
                b'+' | b'-' | b'*' | b'/' | b'^' | b'&' | b'=' | b'>' | b'<' | b'%' => {
                    self.consume_operator()
                }
                b'(' => self.consume_open_paren(),
                b')' => self.consume_close_paren()?,
                b',' | b';' => self.consume_separator(),
                _ => {
                    if !self.has_pending() {
                        self.reset_pending();
                    }
                    self.offset += 1;
                    self.token_end = self.offset;
                }
            }
        }

        self.flush_pending();

        if !self.open_parens.is_empty() {
            return Err(TokenizerError {
                message: "unmatched opening parenthesis".to_string(),
                pos: self.open_parens[self.open_parens.len() - 1],
            });
        }
        Ok(())
    }

    fn pending_is_scientific_base(&self) -> bool {
        if !self.has_pending() {
            return false;
        }
        let slice = &self.formula.as_bytes()[self.token_start..self.token_end];
        if slice.len() < 2 || !slice[0].is_ascii_digit() {
            return false;
        }
        let last = slice[slice.len() - 1];
        if last != b'E' && last != b'e' {
            return false;
        }
        let mut dot = false;
        slice[1..slice.len() - 1].iter().all(|&c| match c {
            b'0'..=b'9' => true,
            b'.' if !dot => {
                dot = true;
                true
            }
            _ => false,
        })
    }

    /// `"..."` with `""` escapes becomes a single Text operand.
    fn consume_string(&mut self) -> Result<(), TokenizerError> {
        self.flush_pending();
        let start = self.offset;
        self.offset += 1;
        loop {
            match self.byte_at(self.offset) {
                Some(b'"') => {
                    self.offset += 1;
                    if self.byte_at(self.offset) == Some(b'"') {
                        self.offset += 1; // escaped quote
                    } else {
                        break;
                    }
                }
                Some(_) => self.offset += 1,
                None => {
                    return Err(TokenizerError {
                        message: "unterminated string literal".to_string(),
                        pos: start,
                    });
                }
            }
        }
        self.items
            .push(Token::operand(&self.formula, start, self.offset));
        self.reset_pending();
        Ok(())
    }

    /// `'Sheet name'` joins the pending token: it is the quoted prefix of a
    /// reference like `'My Sheet'!A1`.
    fn consume_quoted_sheet(&mut self) -> Result<(), TokenizerError> {
        if !self.has_pending() {
            self.reset_pending();
        }
        let start = self.offset;
        self.offset += 1;
        loop {
            match self.byte_at(self.offset) {
                Some(b'\'') => {
                    self.offset += 1;
                    if self.byte_at(self.offset) == Some(b'\'') {
                        self.offset += 1;
                    } else {
                        break;
                    }
                }
                Some(_) => self.offset += 1,
                None => {
                    return Err(TokenizerError {
                        message: "unterminated quoted sheet name".to_string(),
                        pos: start,
                    });
                }
            }
        }
        self.token_end = self.offset;
        Ok(())
    }

    /// Error literals (`#N/A`, `#DIV/0!`, …) are matched against the known
    /// code table so `/` inside them is not taken as division.
    fn consume_error_literal(&mut self) -> Result<(), TokenizerError> {
        self.flush_pending();
        let rest = &self.formula[self.offset..];
        for code in ERROR_CODES {
            if rest.starts_with(code) {
                let start = self.offset;
                self.offset += code.len();
                self.items
                    .push(Token::operand(&self.formula, start, self.offset));
                self.reset_pending();
                return Ok(());
            }
        }
        Err(TokenizerError {
            message: format!("unrecognised error literal at '{rest}'"),
            pos: self.offset,
        })
    }

    fn consume_whitespace(&mut self) {
        self.flush_pending();
        let start = self.offset;
        while matches!(self.byte_at(self.offset), Some(b' ' | b'\t' | b'\n' | b'\r')) {
            self.offset += 1;
        }
        self.items.push(Token::new(
            self.formula[start..self.offset].to_string(),
            TokenType::Whitespace,
            TokenSubType::None,
            start,
            self.offset,
        ));
        self.reset_pending();
    }

    fn consume_operator(&mut self) {
        self.flush_pending();
        let start = self.offset;
        let b = self.formula.as_bytes()[self.offset];
        self.offset += 1;
        // Fold >=, <=, <>
        if (b == b'>' || b == b'<') && self.byte_at(self.offset) == Some(b'=') {
            self.offset += 1;
        } else if b == b'<' && self.byte_at(self.offset) == Some(b'>') {
            self.offset += 1;
        }
        let value = self.formula[start..self.offset].to_string();

        let token_type = if value == "%" {
            TokenType::OpPostfix
        } else if matches!(value.as_str(), "+" | "-") && self.prev_ends_operand() {
            TokenType::OpInfix
        } else if matches!(value.as_str(), "+" | "-") {
            TokenType::OpPrefix
        } else {
            TokenType::OpInfix
        };
        self.items.push(Token::new(
            value,
            token_type,
            TokenSubType::None,
            start,
            self.offset,
        ));
        self.reset_pending();
    }

    /// True when the previous non-whitespace token can end an operand, which
    /// makes a following `+`/`-` infix rather than a sign.
    fn prev_ends_operand(&self) -> bool {
        self.items
            .iter()
            .rev()
            .find(|t| !t.is_whitespace())
            .is_some_and(|t| {
                matches!(t.token_type, TokenType::Operand | TokenType::OpPostfix)
                    || t.subtype == TokenSubType::Close
            })
    }

    fn consume_open_paren(&mut self) {
        // An identifier immediately before '(' is a function name.
        let start;
        let func = self.has_pending();
        if func {
            start = self.token_start;
        } else {
            start = self.offset;
        }
        self.offset += 1;
        let value = self.formula[start..self.offset].to_string();
        let token_type = if func { TokenType::Func } else { TokenType::Paren };
        self.open_parens.push(start);
        self.items.push(Token::new(
            value,
            token_type,
            TokenSubType::Open,
            start,
            self.offset,
        ));
        self.reset_pending();
    }

    fn consume_close_paren(&mut self) -> Result<(), TokenizerError> {
        self.flush_pending();
        if self.open_parens.pop().is_none() {
            return Err(TokenizerError {
                message: "unmatched closing parenthesis".to_string(),
                pos: self.offset,
            });
        }
        let start = self.offset;
        self.offset += 1;
        self.items.push(Token::new(
            ")".to_string(),
            TokenType::Paren,
            TokenSubType::Close,
            start,
            self.offset,
        ));
        self.reset_pending();
        Ok(())
    }

    fn consume_separator(&mut self) {
        self.flush_pending();
        let start = self.offset;
        let value = (self.formula.as_bytes()[start] as char).to_string();
        self.offset += 1;
        self.items.push(Token::new(
            value,
            TokenType::Sep,
            TokenSubType::None,
            start,
            self.offset,
        ));
        self.reset_pending();
    }
}
