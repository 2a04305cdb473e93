pub mod parser;
pub mod tokenizer;

pub use parser::{Expr, ParserError, RefKind, parse_formula};
pub use tokenizer::{Token, TokenSubType, TokenType, Tokenizer, TokenizerError};
