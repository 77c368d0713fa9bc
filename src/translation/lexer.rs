//! Byte-level lexing helpers for the marker scanner.

/// Where the scanner is while walking a script.
#[derive(Clone)]
pub(super) enum LexState {
    Code,
    SingleQuoted,
    DoubleQuoted,
    LineComment,
    /// Nesting depth.
    BlockComment(u32),
    DollarQuoted(String),
}

fn pair_at(bytes: &[u8], idx: usize, first: u8, second: u8) -> bool {
    bytes.get(idx) == Some(&first) && bytes.get(idx + 1) == Some(&second)
}

pub(super) fn line_comment_at(bytes: &[u8], idx: usize) -> bool {
    pair_at(bytes, idx, b'-', b'-')
}

pub(super) fn block_comment_opens_at(bytes: &[u8], idx: usize) -> bool {
    pair_at(bytes, idx, b'/', b'*')
}

pub(super) fn block_comment_closes_at(bytes: &[u8], idx: usize) -> bool {
    pair_at(bytes, idx, b'*', b'/')
}

/// `$tag$` opener at `start`: the tag and the index of its closing `$`.
/// `$1` is a positional marker, not a tag.
pub(super) fn dollar_tag_at(bytes: &[u8], start: usize) -> Option<(String, usize)> {
    let body = bytes.get(start + 1..)?;
    let len = body.iter().position(|b| *b == b'$')?;
    let tag = &body[..len];
    if tag.first().is_some_and(u8::is_ascii_digit) || !tag.iter().copied().all(identifier_byte) {
        return None;
    }
    let tag = String::from_utf8(tag.to_vec()).ok()?;
    Some((tag, start + 1 + len))
}

/// Whether the `$` at `idx` starts the closing `$tag$`.
pub(super) fn closes_dollar_tag(bytes: &[u8], idx: usize, tag: &str) -> bool {
    let end = idx + 1 + tag.len();
    bytes.get(idx + 1..end) == Some(tag.as_bytes()) && bytes.get(end) == Some(&b'$')
}

pub(super) fn identifier_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

/// End of a digit run beginning at `start`.
pub(super) fn digits_end(bytes: &[u8], start: usize) -> Option<usize> {
    let len = bytes.get(start..)?.iter().take_while(|b| b.is_ascii_digit()).count();
    (len > 0).then_some(start + len)
}

/// End of an identifier beginning at `start`.
pub(super) fn identifier_end(bytes: &[u8], start: usize) -> Option<usize> {
    let first = *bytes.get(start)?;
    if !(first.is_ascii_alphabetic() || first == b'_') {
        return None;
    }
    let len = bytes[start..].iter().copied().take_while(|b| identifier_byte(*b)).count();
    Some(start + len)
}
