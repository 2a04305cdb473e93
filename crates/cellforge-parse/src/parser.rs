//! Precedence-climbing parser producing a formula AST.
//!
//! The tokenizer keeps whole references (including `Sheet!A1:B2` and
//! open-ended `$A:$A` spans) as single operands, so reference parsing here
//! is a plain text split rather than grammar work.

use std::error::Error;
use std::fmt::{self, Display};

use cellforge_common::{ErrorKind, col_to_index, index_to_col, split_sheet};

use crate::tokenizer::{Token, TokenSubType, TokenType, Tokenizer};

#[derive(Debug, Clone, PartialEq)]
pub struct ParserError {
    pub message: String,
    pub position: Option<usize>,
}

impl ParserError {
    fn new<S: Into<String>>(message: S, position: Option<usize>) -> Self {
        ParserError {
            message: message.into(),
            position,
        }
    }
}

impl Display for ParserError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.position {
            Some(pos) => write!(f, "parse error at {pos}: {}", self.message),
            None => write!(f, "parse error: {}", self.message),
        }
    }
}

impl Error for ParserError {}

/// A reference to cells outside the formula's own cell.
///
/// Columns and rows are 1-based. `ColRange` is the open-ended whole-column
/// form (`A:A`, `A:C`); bounded ranges always carry both corners.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RefKind {
    Cell {
        sheet: Option<String>,
        col: u32,
        row: u32,
    },
    Range {
        sheet: Option<String>,
        start_col: u32,
        start_row: u32,
        end_col: u32,
        end_row: u32,
    },
    ColRange {
        sheet: Option<String>,
        start_col: u32,
        end_col: u32,
    },
}

impl RefKind {
    /// Parse a reference operand like `B2`, `$A$1:$C$9`, `data!$H:$H`,
    /// `'My Sheet'!A1`. Returns `None` when the text is not a reference
    /// (then it is a name the evaluator will reject with `#NAME?`).
    pub fn parse(text: &str) -> Option<RefKind> {
        let (sheet, rest) = split_sheet(text);
        match rest.split_once(':') {
            None => {
                let (col, row) = parse_cell_part(rest)?;
                Some(RefKind::Cell { sheet, col, row })
            }
            Some((a, b)) => {
                // Whole-column span: both parts are column-only.
                if let (Some(c1), Some(c2)) = (parse_col_part(a), parse_col_part(b)) {
                    let (start_col, end_col) = if c1 <= c2 { (c1, c2) } else { (c2, c1) };
                    return Some(RefKind::ColRange {
                        sheet,
                        start_col,
                        end_col,
                    });
                }
                let (c1, r1) = parse_cell_part(a)?;
                // The second corner may carry its own (identical) sheet
                // prefix, as in `Sheet1!A1:Sheet1!B2`.
                let (_, b_rest) = split_sheet(b);
                let (c2, r2) = parse_cell_part(b_rest)?;
                Some(RefKind::Range {
                    sheet,
                    start_col: c1.min(c2),
                    start_row: r1.min(r2),
                    end_col: c1.max(c2),
                    end_row: r1.max(r2),
                })
            }
        }
    }

    pub fn sheet(&self) -> Option<&str> {
        match self {
            RefKind::Cell { sheet, .. }
            | RefKind::Range { sheet, .. }
            | RefKind::ColRange { sheet, .. } => sheet.as_deref(),
        }
    }

    /// Normalised textual form without sheet prefix (`B2`, `A1:C9`, `A:C`).
    pub fn local_text(&self) -> String {
        match self {
            RefKind::Cell { col, row, .. } => format!("{}{row}", index_to_col(*col)),
            RefKind::Range {
                start_col,
                start_row,
                end_col,
                end_row,
                ..
            } => format!(
                "{}{start_row}:{}{end_row}",
                index_to_col(*start_col),
                index_to_col(*end_col)
            ),
            RefKind::ColRange {
                start_col, end_col, ..
            } => format!("{}:{}", index_to_col(*start_col), index_to_col(*end_col)),
        }
    }
}

/// Strip `$` anchors and split `B12` into `(col, row)`.
fn parse_cell_part(part: &str) -> Option<(u32, u32)> {
    let cleaned: String = part.chars().filter(|c| *c != '$').collect();
    let letters: String = cleaned.chars().take_while(|c| c.is_ascii_alphabetic()).collect();
    let digits = &cleaned[letters.len()..];
    if letters.is_empty() || digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let col = col_to_index(&letters)?;
    let row: u32 = digits.parse().ok().filter(|r| *r >= 1)?;
    Some((col, row))
}

/// Column-only part of a whole-column reference (`$A`, `C`).
fn parse_col_part(part: &str) -> Option<u32> {
    let cleaned: String = part.chars().filter(|c| *c != '$').collect();
    if cleaned.is_empty() || !cleaned.bytes().all(|b| b.is_ascii_alphabetic()) {
        return None;
    }
    col_to_index(&cleaned)
}

/// Formula AST.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Number(f64),
    Text(String),
    Bool(bool),
    Error(ErrorKind),
    Ref(RefKind),
    /// An identifier that is not a recognisable reference; evaluates to
    /// `#NAME?`.
    Name(String),
    Unary {
        op: String,
        expr: Box<Expr>,
    },
    Binary {
        op: String,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Func {
        name: String,
        args: Vec<Expr>,
        /// Byte span of the whole call (`NAME(` through `)`) in the source
        /// formula text, used for byte-exact sub-expression extraction.
        span: (usize, usize),
    },
}

impl Expr {
    /// Depth-first walk over this expression and all children.
    pub fn walk<'a>(&'a self, visit: &mut dyn FnMut(&'a Expr)) {
        visit(self);
        match self {
            Expr::Unary { expr, .. } => expr.walk(visit),
            Expr::Binary { left, right, .. } => {
                left.walk(visit);
                right.walk(visit);
            }
            Expr::Func { args, .. } => {
                for a in args {
                    a.walk(visit);
                }
            }
            _ => {}
        }
    }

    /// True when the expression contains no function call, only refs,
    /// literals, and operators. The level-0 fast path is restricted to
    /// these.
    pub fn is_simple(&self) -> bool {
        let mut simple = true;
        self.walk(&mut |e| {
            if matches!(e, Expr::Func { .. }) {
                simple = false;
            }
        });
        simple
    }
}

/// Parse a formula (leading `=` optional) into an AST.
pub fn parse_formula(text: &str) -> Result<Expr, ParserError> {
    let tokens: Vec<Token> = Tokenizer::new(text)
        .map_err(|e| ParserError::new(e.message, Some(e.pos)))?
        .into_tokens()
        .into_iter()
        .filter(|t| !t.is_whitespace())
        .collect();
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.parse_expr(0)?;
    if parser.pos != parser.tokens.len() {
        return Err(ParserError::new(
            format!("unexpected token '{}'", parser.tokens[parser.pos].value),
            Some(parser.tokens[parser.pos].start),
        ));
    }
    Ok(expr)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

fn infix_precedence(op: &str) -> Option<u8> {
    match op {
        "^" => Some(5),
        "*" | "/" => Some(4),
        "+" | "-" => Some(3),
        "&" => Some(2),
        "=" | "<>" | ">" | "<" | ">=" | "<=" => Some(1),
        _ => None,
    }
}

const PREFIX_PRECEDENCE: u8 = 7;

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn bump(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn parse_expr(&mut self, min_prec: u8) -> Result<Expr, ParserError> {
        let mut lhs = self.parse_prefix()?;

        loop {
            // Postfix percent binds tighter than any infix operator.
            if let Some(tok) = self.peek()
                && tok.token_type == TokenType::OpPostfix
            {
                self.pos += 1;
                lhs = Expr::Unary {
                    op: "%".to_string(),
                    expr: Box::new(lhs),
                };
                continue;
            }

            let Some(tok) = self.peek() else { break };
            if tok.token_type != TokenType::OpInfix {
                break;
            }
            let op = tok.value.clone();
            let Some(prec) = infix_precedence(&op) else {
                break;
            };
            if prec < min_prec {
                break;
            }
            self.pos += 1;
            let rhs = self.parse_expr(prec + 1)?;
            lhs = Expr::Binary {
                op,
                left: Box::new(lhs),
                right: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn parse_prefix(&mut self) -> Result<Expr, ParserError> {
        let Some(tok) = self.bump() else {
            return Err(ParserError::new("unexpected end of formula", None));
        };
        match tok.token_type {
            TokenType::OpPrefix => {
                let inner = self.parse_expr(PREFIX_PRECEDENCE)?;
                Ok(Expr::Unary {
                    op: tok.value,
                    expr: Box::new(inner),
                })
            }
            TokenType::Paren if tok.subtype == TokenSubType::Open => {
                let inner = self.parse_expr(0)?;
                self.expect_close()?;
                Ok(inner)
            }
            TokenType::Func => self.parse_call(tok),
            TokenType::Operand => Ok(Self::operand_to_expr(&tok)),
            _ => Err(ParserError::new(
                format!("unexpected token '{}'", tok.value),
                Some(tok.start),
            )),
        }
    }

    fn parse_call(&mut self, open: Token) -> Result<Expr, ParserError> {
        // Token value is `NAME(`; drop the paren.
        let name = open.value[..open.value.len() - 1].to_ascii_uppercase();
        let mut args = Vec::new();

        // Empty argument list: `NAME()`
        if let Some(tok) = self.peek()
            && tok.subtype == TokenSubType::Close
        {
            let close = self.bump().unwrap();
            return Ok(Expr::Func {
                name,
                args,
                span: (open.start, close.end),
            });
        }

        loop {
            // An omitted argument (`IF(a,,b)`) parses as Empty text.
            if let Some(tok) = self.peek()
                && tok.token_type == TokenType::Sep
            {
                args.push(Expr::Text(String::new()));
                self.pos += 1;
                continue;
            }
            args.push(self.parse_expr(0)?);
            let Some(tok) = self.bump() else {
                return Err(ParserError::new("unterminated function call", None));
            };
            match (tok.token_type, tok.subtype) {
                (TokenType::Sep, _) => {
                    // Trailing omitted argument: `IF(a,b,)`.
                    if let Some(next) = self.peek()
                        && next.subtype == TokenSubType::Close
                    {
                        args.push(Expr::Text(String::new()));
                    }
                    continue;
                }
                (TokenType::Paren, TokenSubType::Close) => {
                    return Ok(Expr::Func {
                        name,
                        args,
                        span: (open.start, tok.end),
                    });
                }
                _ => {
                    return Err(ParserError::new(
                        format!("unexpected token '{}' in argument list", tok.value),
                        Some(tok.start),
                    ));
                }
            }
        }
    }

    fn expect_close(&mut self) -> Result<(), ParserError> {
        match self.bump() {
            Some(t) if t.subtype == TokenSubType::Close => Ok(()),
            Some(t) => Err(ParserError::new(
                format!("expected ')', found '{}'", t.value),
                Some(t.start),
            )),
            None => Err(ParserError::new("expected ')'", None)),
        }
    }

    fn operand_to_expr(tok: &Token) -> Expr {
        match tok.subtype {
            TokenSubType::Number => Expr::Number(tok.value.parse().unwrap_or(0.0)),
            TokenSubType::Text => {
                let inner = &tok.value[1..tok.value.len() - 1];
                Expr::Text(inner.replace("\"\"", "\""))
            }
            TokenSubType::Logical => Expr::Bool(tok.value.eq_ignore_ascii_case("TRUE")),
            TokenSubType::Error => Expr::Error(
                ErrorKind::from_code(&tok.value).unwrap_or(ErrorKind::Value),
            ),
            _ => match RefKind::parse(&tok.value) {
                Some(reference) => Expr::Ref(reference),
                None => Expr::Name(tok.value.clone()),
            },
        }
    }
}
