//! Sub-expression substitution.
//!
//! Before a composite formula reaches the evaluator, sub-expressions the
//! bulk optimiser already computed are replaced by their cached results.
//! Matching is textual and byte-exact: the cache key is the sub-expression
//! exactly as it appears in the source formula, whitespace and anchors
//! included, so extraction here must produce the identical slice.
//!
//! Substituted values are always spelled as string literals. `0` and `"0"`
//! compare differently (`IFERROR(x, 0)=0` is the canonical case), and a
//! cached result must keep the string-ness it had as a value.

use crate::cache::SubExprCache;

/// Function call heads whose results land in the sub-expression cache.
pub const SUBEXPR_HEADS: &[&str] = &[
    "SUMIFS(",
    "COUNTIFS(",
    "AVERAGEIFS(",
    "AVERAGE(",
    "INDEX(",
];

/// True when the formula contains at least one optimisable call head, i.e.
/// the substitution pass could do something for it.
pub fn has_optimisable_subexpr(formula: &str) -> bool {
    SUBEXPR_HEADS.iter().any(|head| find_head(formula, head, 0).is_some())
}

/// Rewrite `formula`, replacing every cached sub-expression with its
/// quoted literal value. Returns the rewritten text and the number of
/// substitutions performed (0 means the original text came back).
pub fn substitute(formula: &str, cache: &SubExprCache) -> (String, usize) {
    let mut text = formula.to_string();
    let mut hits = 0usize;

    for head in SUBEXPR_HEADS {
        let mut from = 0usize;
        loop {
            let Some(start) = find_head(&text, head, from) else {
                break;
            };
            let Some(end) = balanced_call_end(&text, start + head.len() - 1) else {
                // Malformed tail; nothing more to extract for this head.
                break;
            };
            let candidate = &text[start..end];
            match cache.get(candidate) {
                Some(value) => {
                    let literal = quote_literal(&value);
                    text.replace_range(start..end, &literal);
                    hits += 1;
                    from = start + literal.len();
                }
                None => {
                    // Leave the call in place; skip past its head so a
                    // nested occurrence can still be probed.
                    from = start + head.len();
                }
            }
        }
    }
    (text, hits)
}

/// Find the next occurrence of `head` at a word boundary, outside string
/// literals.
fn find_head(text: &str, head: &str, from: usize) -> Option<usize> {
    let bytes = text.as_bytes();
    let mut search_from = from;
    while let Some(rel) = text[search_from..].find(head) {
        let pos = search_from + rel;
        let boundary = pos == 0
            || !(bytes[pos - 1].is_ascii_alphanumeric()
                || bytes[pos - 1] == b'_'
                || bytes[pos - 1] == b'.');
        if boundary && !in_string_literal(text, pos) {
            return Some(pos);
        }
        search_from = pos + 1;
    }
    None
}

/// Whether `pos` lies inside a double-quoted string literal.
fn in_string_literal(text: &str, pos: usize) -> bool {
    let mut inside = false;
    for (i, b) in text.bytes().enumerate() {
        if i >= pos {
            break;
        }
        if b == b'"' {
            inside = !inside;
        }
    }
    inside
}

/// Given the byte offset of the opening `(`, return the offset one past
/// the matching `)`. Skips string literals.
fn balanced_call_end(text: &str, open_paren: usize) -> Option<usize> {
    let bytes = text.as_bytes();
    debug_assert_eq!(bytes[open_paren], b'(');
    let mut depth = 0i32;
    let mut in_string = false;
    for (i, &b) in bytes.iter().enumerate().skip(open_paren) {
        match b {
            b'"' => in_string = !in_string,
            b'(' if !in_string => depth += 1,
            b')' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(i + 1);
                }
            }
            _ => {}
        }
    }
    None
}

/// Spell a cached value for splicing into formula text. Values become
/// string literals (doubled embedded quotes) so their string-ness
/// propagates; canonical error codes stay bare so IFERROR and friends
/// still see an error and not text.
fn quote_literal(value: &str) -> String {
    if cellforge_common::ErrorKind::is_error_code(value) {
        return value.to_string();
    }
    format!("\"{}\"", value.replace('"', "\"\""))
}
