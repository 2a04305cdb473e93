//! Dependency-edge extraction.
//!
//! Walks the tokenizer's stream rather than a fully parsed AST so that a
//! formula the evaluator cannot yet parse still yields its references
//! (extraction must be tolerant; evaluation can fail later). String
//! literals never reach this code — the tokenizer consumed them whole.

use rustc_hash::FxHashSet;

use cellforge_common::{column_key, index_to_col, qualify};
use cellforge_parse::{RefKind, TokenSubType, Tokenizer};

/// Extract the deduplicated, normalised dependencies of a formula.
///
/// Output entries are either concrete full refs (`Sheet!A1`) or
/// whole-column sentinels (`COLUMN:Sheet!A`). Bounded ranges up to
/// `expansion_limit` cells expand into the individual cells; larger ones
/// degrade to one sentinel per column (endpoints always included so
/// direct-cell invalidation keeps working).
pub fn extract_refs(formula: &str, own_sheet: &str, expansion_limit: usize) -> Vec<String> {
    let Ok(tokenizer) = Tokenizer::new(formula) else {
        return Vec::new();
    };

    let mut seen: FxHashSet<String> = FxHashSet::default();
    let mut out = Vec::new();
    let mut push = |dep: String, out: &mut Vec<String>| {
        if seen.insert(dep.clone()) {
            out.push(dep);
        }
    };

    for token in tokenizer.into_tokens() {
        if token.subtype != TokenSubType::Range {
            continue;
        }
        let Some(reference) = RefKind::parse(&token.value) else {
            continue;
        };
        let sheet = reference.sheet().unwrap_or(own_sheet).to_string();
        match reference {
            RefKind::Cell { col, row, .. } => {
                push(qualify(&sheet, &format!("{}{row}", index_to_col(col))), &mut out);
            }
            RefKind::Range {
                start_col,
                start_row,
                end_col,
                end_row,
                ..
            } => {
                let cells =
                    (end_col - start_col + 1) as usize * (end_row - start_row + 1) as usize;
                if cells <= expansion_limit {
                    for col in start_col..=end_col {
                        for row in start_row..=end_row {
                            push(
                                qualify(&sheet, &format!("{}{row}", index_to_col(col))),
                                &mut out,
                            );
                        }
                    }
                } else {
                    // Endpoints, then one sentinel per column of the span.
                    push(
                        qualify(&sheet, &format!("{}{start_row}", index_to_col(start_col))),
                        &mut out,
                    );
                    push(
                        qualify(&sheet, &format!("{}{end_row}", index_to_col(end_col))),
                        &mut out,
                    );
                    for col in start_col..=end_col {
                        push(column_key(&sheet, &index_to_col(col)), &mut out);
                    }
                }
            }
            RefKind::ColRange {
                start_col, end_col, ..
            } => {
                for col in start_col..=end_col {
                    push(column_key(&sheet, &index_to_col(col)), &mut out);
                }
            }
        }
    }
    out
}
