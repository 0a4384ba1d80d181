//! Name normalization for cache keys
//!
//! Turns free-text customer/account names and structured codes into the
//! byte-exact keys used by the mapping cache and the temp identity
//! generator. Rules, in order:
//! - Placeholder tokens ("N/A", "null", "无", ...) map to the empty sentinel
//! - Unicode NFKC fold (full-width ASCII and punctuation to half-width)
//! - Bracket variants canonicalize to `(` `)`, with pairing repair
//! - All whitespace removed
//! - Upper-case canonical form

use unicode_normalization::UnicodeNormalization;

/// Key produced for empty or placeholder input.
pub const EMPTY_SENTINEL: &str = "";

/// Tokens that mean "no value" in hand-entered spreadsheets.
/// Compared after NFKC, whitespace removal and lower-casing.
const PLACEHOLDER_TOKENS: &[&str] = &[
    "",
    "n/a",
    "na",
    "#n/a",
    "none",
    "null",
    "nil",
    "nan",
    "-",
    "--",
    "---",
    "/",
    "?",
    "空",
    "无",
    "空白",
    "(空白)",
    "不详",
    "暂无",
];

const OPEN_BRACKETS: &[char] = &['(', '[', '{', '【', '〔', '〖', '〘', '«'];
const CLOSE_BRACKETS: &[char] = &[')', ']', '}', '】', '〕', '〗', '〙', '»'];

/// Invisible characters that survive `char::is_whitespace`.
const INVISIBLE: &[char] = &['\u{200B}', '\u{200C}', '\u{200D}', '\u{2060}', '\u{FEFF}'];

/// Result of normalizing a raw value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedName {
    /// Canonical lookup key. Equal to [`EMPTY_SENTINEL`] when `is_empty`.
    pub key: String,
    /// The input was empty or a placeholder token.
    pub is_empty: bool,
    /// Unmatched brackets were dropped to produce `key`.
    pub bracket_repaired: bool,
}

impl NormalizedName {
    fn empty() -> Self {
        Self {
            key: EMPTY_SENTINEL.to_string(),
            is_empty: true,
            bracket_repaired: false,
        }
    }

    /// Safe to use as a key for cache writes.
    pub fn is_trusted_key(&self) -> bool {
        !self.is_empty && !self.bracket_repaired
    }
}

/// Normalize a raw value into a lookup key.
///
/// Total and deterministic. Placeholder input yields [`EMPTY_SENTINEL`].
///
/// # Examples
///
/// ```
/// use company_resolver::normalize::normalize;
///
/// assert_eq!(normalize("  ABC 公司  "), "ABC公司");
/// assert_eq!(normalize("Ａｂｃ（上海）"), "ABC(上海)");
/// assert_eq!(normalize("null"), "");
/// ```
pub fn normalize(raw: &str) -> String {
    normalize_detailed(raw).key
}

/// Normalize and report what the normalizer had to do.
pub fn normalize_detailed(raw: &str) -> NormalizedName {
    // Full-width to half-width; also folds the ideographic space.
    let folded: String = raw.nfkc().collect();

    if is_placeholder(&folded) {
        return NormalizedName::empty();
    }

    let (bracketed, bracket_repaired) = normalize_brackets(&folded);

    let compact: String = bracketed
        .chars()
        .filter(|c| !c.is_whitespace() && !INVISIBLE.contains(c))
        .collect();
    let compact = drop_empty_pairs(compact);

    let key = compact.to_uppercase();
    if is_placeholder(&key) {
        return NormalizedName::empty();
    }

    NormalizedName {
        key,
        is_empty: false,
        bracket_repaired,
    }
}

/// Whether the value is empty or a known placeholder token.
pub fn is_placeholder(value: &str) -> bool {
    let compact: String = value
        .chars()
        .filter(|c| !c.is_whitespace() && !INVISIBLE.contains(c))
        .collect::<String>()
        .to_lowercase();
    PLACEHOLDER_TOKENS.contains(&compact.as_str())
}

/// Map every bracket variant to `(`/`)` and drop unmatched ones.
///
/// Returns the rewritten string and whether any bracket had to be dropped.
fn normalize_brackets(s: &str) -> (String, bool) {
    let mut out: Vec<char> = Vec::with_capacity(s.len());
    let mut open_positions: Vec<usize> = Vec::new();
    let mut repaired = false;

    for c in s.chars() {
        if OPEN_BRACKETS.contains(&c) {
            open_positions.push(out.len());
            out.push('(');
        } else if CLOSE_BRACKETS.contains(&c) {
            if open_positions.pop().is_some() {
                out.push(')');
            } else {
                repaired = true;
            }
        } else {
            out.push(c);
        }
    }

    if !open_positions.is_empty() {
        repaired = true;
        for pos in open_positions.into_iter().rev() {
            out.remove(pos);
        }
    }

    (out.into_iter().collect(), repaired)
}

fn drop_empty_pairs(mut s: String) -> String {
    while s.contains("()") {
        s = s.replace("()", "");
    }
    s
}

/// Whether the raw value contains unbalanced brackets.
pub fn has_unbalanced_brackets(raw: &str) -> bool {
    let folded: String = raw.nfkc().collect();
    normalize_brackets(&folded).1
}
