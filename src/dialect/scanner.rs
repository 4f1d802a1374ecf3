//! Quote, comment and parenthesis aware SQL scanning.
//!
//! Every other SQL rewrite in this crate needs to know where the structural parts of
//! a statement are without being fooled by string literals, quoted identifiers,
//! comments or nested subqueries. The scanner does this in two steps:
//!
//! 1. [`mask`] produces a byte-for-byte copy of the statement in which the contents of
//!    literals, quoted identifiers and comments are blanked out. Quote characters stay
//!    in place so offsets and delimiters are preserved.
//! 2. Keyword searches then run over the masked copy, tracking parenthesis depth.
//!
//! Scanning never fails. Unterminated literals and comments extend to the end of input.

/// Lexical state while walking a statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Code,
    SingleQuoted,
    DoubleQuoted,
    Backtick,
    LineComment,
    BlockComment,
}

/// Keywords that make a projection-swapping COUNT rewrite unsafe.
const NON_SIMPLE_KEYWORDS: &[&str] = &[
    "DISTINCT",
    "GROUP BY",
    "UNION",
    "HAVING",
    "INTERSECT",
    "EXCEPT",
    "MINUS",
    "LIMIT",
    "OFFSET",
    "FETCH",
    "TOP",
];

/// Top-level keywords that cap or skip rows.
const ROW_LIMIT_KEYWORDS: &[&str] = &["LIMIT", "OFFSET", "FETCH", "TOP"];

/// Blank out literal, quoted-identifier and comment contents.
///
/// The result has the same length as `sql`. Only bytes inside literals or comments are
/// replaced (by spaces), so multi-byte characters are either kept whole or blanked whole.
pub(crate) fn mask(sql: &str) -> Vec<u8> {
    let bytes = sql.as_bytes();
    let mut out = bytes.to_vec();
    let mut state = State::Code;
    let mut i = 0;

    while i < bytes.len() {
        let b = bytes[i];
        let next = bytes.get(i + 1).copied();
        match state {
            State::Code => match b {
                b'\'' => state = State::SingleQuoted,
                b'"' => state = State::DoubleQuoted,
                b'`' => state = State::Backtick,
                b'-' if next == Some(b'-') => {
                    out[i] = b' ';
                    out[i + 1] = b' ';
                    i += 1;
                    state = State::LineComment;
                }
                b'/' if next == Some(b'*') => {
                    out[i] = b' ';
                    out[i + 1] = b' ';
                    i += 1;
                    state = State::BlockComment;
                }
                _ => {}
            },
            State::SingleQuoted => match b {
                b'\\' => {
                    out[i] = b' ';
                    if next.is_some() {
                        out[i + 1] = b' ';
                        i += 1;
                    }
                }
                b'\'' if next == Some(b'\'') => {
                    out[i] = b' ';
                    out[i + 1] = b' ';
                    i += 1;
                }
                b'\'' => state = State::Code,
                _ => out[i] = b' ',
            },
            State::DoubleQuoted | State::Backtick => {
                let quote = if state == State::DoubleQuoted {
                    b'"'
                } else {
                    b'`'
                };
                if b == quote && next == Some(quote) {
                    out[i] = b' ';
                    out[i + 1] = b' ';
                    i += 1;
                } else if b == quote {
                    state = State::Code;
                } else {
                    out[i] = b' ';
                }
            }
            State::LineComment => {
                if b == b'\n' {
                    state = State::Code;
                } else {
                    out[i] = b' ';
                }
            }
            State::BlockComment => {
                out[i] = b' ';
                if b == b'*' && next == Some(b'/') {
                    out[i + 1] = b' ';
                    i += 1;
                    state = State::Code;
                }
            }
        }
        i += 1;
    }

    out
}

/// Masked copy of `sql` as text. See [`mask`].
pub fn mask_literals(sql: &str) -> String {
    String::from_utf8_lossy(&mask(sql)).into_owned()
}

fn is_word_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

/// Match the (possibly multi-word) keyword at `start`, returning the end offset.
fn match_keyword_at(masked: &[u8], start: usize, words: &[&str]) -> Option<usize> {
    let mut pos = start;
    for (idx, word) in words.iter().enumerate() {
        if idx > 0 {
            let ws_start = pos;
            while pos < masked.len() && masked[pos].is_ascii_whitespace() {
                pos += 1;
            }
            if pos == ws_start {
                return None;
            }
        }
        let end = pos + word.len();
        if end > masked.len() || !masked[pos..end].eq_ignore_ascii_case(word.as_bytes()) {
            return None;
        }
        pos = end;
    }
    if pos < masked.len() && is_word_byte(masked[pos]) {
        return None;
    }
    Some(pos)
}

fn find_in_masked(masked: &[u8], keyword: &str) -> Option<usize> {
    let words: Vec<&str> = keyword.split_whitespace().collect();
    let first = words.first()?.as_bytes();
    let mut depth = 0usize;

    for i in 0..masked.len() {
        match masked[i] {
            b'(' => depth += 1,
            b')' => depth = depth.saturating_sub(1),
            b if depth == 0 && b.eq_ignore_ascii_case(&first[0]) => {
                if i > 0 && is_word_byte(masked[i - 1]) {
                    continue;
                }
                if match_keyword_at(masked, i, &words).is_some() {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

/// Byte offset of the first top-level occurrence of `keyword` in `sql`.
///
/// Top-level means outside parentheses, literals, quoted identifiers and comments.
/// Matching is case-insensitive and whole-word; the words of a multi-word keyword such
/// as `ORDER BY` may be separated by any run of whitespace.
///
/// ```
/// use sqlweave::dialect::find_top_level_keyword;
///
/// assert_eq!(find_top_level_keyword("SELECT * FROM t ORDER BY id", "ORDER BY"), Some(16));
/// assert_eq!(find_top_level_keyword("SELECT * FROM t WHERE x='ORDER BY'", "ORDER BY"), None);
/// ```
pub fn find_top_level_keyword(sql: &str, keyword: &str) -> Option<usize> {
    find_in_masked(&mask(sql), keyword)
}

/// Whether `keyword` occurs at the top level of `sql`.
pub fn contains_top_level_keyword(sql: &str, keyword: &str) -> bool {
    find_top_level_keyword(sql, keyword).is_some()
}

/// Remove trailing whitespace and statement terminators.
pub fn strip_terminator(sql: &str) -> &str {
    sql.trim_end().trim_end_matches(';').trim_end()
}

/// Split a statement at its top-level `ORDER BY`.
///
/// Returns the statement without the ordering clause and, if present, the clause
/// itself (starting with `ORDER BY`).
pub fn split_order_by(sql: &str) -> (&str, Option<&str>) {
    let sql = strip_terminator(sql);
    match find_top_level_keyword(sql, "ORDER BY") {
        Some(pos) => (sql[..pos].trim_end(), Some(sql[pos..].trim())),
        None => (sql.trim(), None),
    }
}

/// Whether a query's projection can be swapped for `COUNT(*)` without changing the
/// number of rows it describes.
pub fn is_simple_select(sql: &str) -> bool {
    let sql = strip_terminator(sql).trim_start();
    let masked = mask(sql);
    if find_in_masked(&masked, "SELECT") != Some(0) || find_in_masked(&masked, "FROM").is_none()
    {
        return false;
    }
    !NON_SIMPLE_KEYWORDS
        .iter()
        .any(|kw| find_in_masked(&masked, kw).is_some())
}

/// Whether the statement already limits its rows at the top level.
pub fn limits_rows(sql: &str) -> bool {
    let masked = mask(strip_terminator(sql));
    ROW_LIMIT_KEYWORDS
        .iter()
        .any(|kw| find_in_masked(&masked, kw).is_some())
}

/// Count top-level occurrences of a single byte (e.g. `?`) outside literals and comments.
pub(crate) fn count_unquoted(sql: &str, needle: u8) -> usize {
    mask(sql).iter().filter(|&&b| b == needle).count()
}
