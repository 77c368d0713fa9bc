//! Bind-marker scanning and rewriting.
//!
//! Callers write named markers in their dialect's style (`@id`, `:id`); the
//! native drivers want `@P1`, `$1`, `?1`, `?` or `:id`. The scanner walks the
//! script with a small state machine so that markers inside string literals,
//! quoted identifiers, comments and dollar-quoted bodies are left alone, as
//! are T-SQL `@@globals`, `::` casts and `:=` assignments.

mod lexer;

use std::collections::HashMap;

use lexer::{
    LexState, block_comment_closes_at, block_comment_opens_at, closes_dollar_tag, digits_end,
    dollar_tag_at, identifier_byte, identifier_end, line_comment_at,
};

use crate::provider::MarkerStyle;

/// A bind marker found outside literals and comments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarkerToken {
    /// Byte range of the marker, prefix included.
    pub start: usize,
    pub end: usize,
    pub kind: MarkerKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MarkerKind {
    /// `@name` / `:name` / `$name`, stored without the prefix.
    Named(String),
    /// `?`, `?N` or `$N`.
    Positional,
}

/// Markers and top-level statements of one script.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScriptScan {
    pub markers: Vec<MarkerToken>,
    pub statements: usize,
}

impl ScriptScan {
    #[must_use]
    pub fn marker_count(&self) -> usize {
        self.markers.len()
    }

    /// Distinct named markers in first-occurrence order.
    #[must_use]
    pub fn named(&self) -> Vec<&str> {
        let mut seen: Vec<&str> = Vec::new();
        for token in &self.markers {
            if let MarkerKind::Named(name) = &token.kind
                && !seen.iter().any(|s| s.eq_ignore_ascii_case(name))
            {
                seen.push(name);
            }
        }
        seen
    }

    #[must_use]
    pub fn is_multi_statement(&self) -> bool {
        self.statements > 1
    }
}

/// Script with native markers plus the bind order for anonymous markers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RewrittenScript {
    pub script: String,
    /// Parameter index for each marker occurrence; empty unless the native
    /// style binds by occurrence.
    pub bind_order: Vec<usize>,
}

/// Scan `sql` for markers whose prefix is one of `prefixes`, and count its
/// top-level statements.
#[must_use]
pub fn scan_script(sql: &str, prefixes: &[char]) -> ScriptScan {
    let bytes = sql.as_bytes();
    let mut scan = ScriptScan::default();
    let mut state = LexState::Code;
    let mut idx = 0;
    let mut statement_has_content = false;

    let accepts = |b: u8| prefixes.iter().any(|p| u32::from(b) == u32::from(*p));

    while idx < bytes.len() {
        let b = bytes[idx];
        match state {
            LexState::Code => match b {
                b'\'' => {
                    state = LexState::SingleQuoted;
                    statement_has_content = true;
                }
                b'"' => {
                    state = LexState::DoubleQuoted;
                    statement_has_content = true;
                }
                _ if line_comment_at(bytes, idx) => state = LexState::LineComment,
                _ if block_comment_opens_at(bytes, idx) => {
                    state = LexState::BlockComment(1);
                    idx += 1;
                }
                b';' => {
                    if statement_has_content {
                        scan.statements += 1;
                    }
                    statement_has_content = false;
                }
                b'$' => {
                    statement_has_content = true;
                    if let Some((tag, advance)) = dollar_tag_at(bytes, idx) {
                        state = LexState::DollarQuoted(tag);
                        idx = advance;
                    } else if let Some(end) = digits_end(bytes, idx + 1) {
                        scan.markers.push(positional(idx, end));
                        idx = end - 1;
                    } else if accepts(b)
                        && let Some(end) = identifier_end(bytes, idx + 1)
                    {
                        scan.markers.push(named(sql, idx, end));
                        idx = end - 1;
                    }
                }
                b'?' => {
                    statement_has_content = true;
                    let end = digits_end(bytes, idx + 1).unwrap_or(idx + 1);
                    scan.markers.push(positional(idx, end));
                    idx = end - 1;
                }
                b'@' | b':' => {
                    statement_has_content = true;
                    let next = bytes.get(idx + 1).copied();
                    let after_identifier = idx > 0 && identifier_byte(bytes[idx - 1]);
                    if next == Some(b) || (b == b':' && next == Some(b'=')) {
                        // `@@global`, `::cast`, `:=`
                        idx += 1;
                    } else if accepts(b)
                        && !after_identifier
                        && let Some(end) = identifier_end(bytes, idx + 1)
                    {
                        scan.markers.push(named(sql, idx, end));
                        idx = end - 1;
                    }
                }
                _ if !b.is_ascii_whitespace() => statement_has_content = true,
                _ => {}
            },
            LexState::SingleQuoted => {
                if b == b'\'' {
                    if bytes.get(idx + 1) == Some(&b'\'') {
                        idx += 1; // skip escaped quote
                    } else {
                        state = LexState::Code;
                    }
                }
            }
            LexState::DoubleQuoted => {
                if b == b'"' {
                    if bytes.get(idx + 1) == Some(&b'"') {
                        idx += 1; // skip escaped quote
                    } else {
                        state = LexState::Code;
                    }
                }
            }
            LexState::LineComment => {
                if b == b'\n' {
                    state = LexState::Code;
                }
            }
            LexState::BlockComment(depth) => {
                if block_comment_opens_at(bytes, idx) {
                    state = LexState::BlockComment(depth + 1);
                    idx += 1;
                } else if block_comment_closes_at(bytes, idx) {
                    idx += 1;
                    if depth == 1 {
                        state = LexState::Code;
                    } else {
                        state = LexState::BlockComment(depth - 1);
                    }
                }
            }
            LexState::DollarQuoted(ref tag) => {
                if b == b'$' && closes_dollar_tag(bytes, idx, tag) {
                    let tag_len = tag.len();
                    state = LexState::Code;
                    idx += tag_len + 1;
                }
            }
        }
        idx += 1;
    }

    if statement_has_content {
        scan.statements += 1;
    }
    scan
}

fn positional(start: usize, end: usize) -> MarkerToken {
    MarkerToken {
        start,
        end,
        kind: MarkerKind::Positional,
    }
}

fn named(sql: &str, start: usize, end: usize) -> MarkerToken {
    MarkerToken {
        start,
        end,
        kind: MarkerKind::Named(sql[start + 1..end].to_string()),
    }
}

/// Rewrite named markers that match one of `names` (case-insensitive) into
/// `style`. Markers that match no name are kept verbatim, which leaves
/// script-local variables such as T-SQL `@total` untouched.
#[must_use]
pub fn rewrite_markers(
    sql: &str,
    scan: &ScriptScan,
    style: MarkerStyle,
    names: &[&str],
) -> RewrittenScript {
    let lookup: HashMap<String, usize> = names
        .iter()
        .enumerate()
        .map(|(i, n)| (n.to_ascii_lowercase(), i))
        .collect();
    let mut out = String::with_capacity(sql.len() + 8);
    let mut bind_order = Vec::new();
    let mut cursor = 0;

    for token in &scan.markers {
        let MarkerKind::Named(name) = &token.kind else {
            continue;
        };
        let Some(&index) = lookup.get(&name.to_ascii_lowercase()) else {
            continue;
        };
        out.push_str(&sql[cursor..token.start]);
        out.push_str(&style.render(names[index], index + 1));
        if style.binds_by_occurrence() {
            bind_order.push(index);
        }
        cursor = token.end;
    }
    out.push_str(&sql[cursor..]);

    RewrittenScript {
        script: out,
        bind_order,
    }
}
