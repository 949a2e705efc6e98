//! Document numbering.
//!
//! Every classified document carries a code of the form `{TYPE}-{NNNN}`
//! (e.g. `OI-0001`). Codes are not persisted as a running counter: the next
//! sequence is always recomputed from the codes that currently exist, so a
//! deleted document's number becomes available again on the next upload.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::LazyLock;

static CODE_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([A-Za-z]{2})[-_ ]?(\d{4})$").expect("valid code pattern"));

static UNDERSCORE_RUNS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"_{2,}").expect("valid underscore pattern"));

/// Characters that are invalid in a path component on at least one of the
/// platforms the document root may live on (Windows shares included).
const INVALID_PATH_CHARS: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*'];

/// The fixed set of known document types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DocumentType {
    /// Operating instruction.
    Oi,
    /// Work instruction. Requires a machine name on upload.
    Wi,
}

impl DocumentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentType::Oi => "OI",
            DocumentType::Wi => "WI",
        }
    }

    /// Parse a type label, tolerating surrounding whitespace and any casing.
    pub fn parse(s: &str) -> Option<Self> {
        match normalize_type(s).as_str() {
            "OI" => Some(DocumentType::Oi),
            "WI" => Some(DocumentType::Wi),
            _ => None,
        }
    }
}

impl fmt::Display for DocumentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Trim and upper-case a type label. Blank input means "unclassified" and
/// yields an empty string.
pub fn normalize_type(s: &str) -> String {
    s.trim().to_uppercase()
}

pub fn is_known_type(t: &str) -> bool {
    DocumentType::parse(t).is_some()
}

/// Format a document code, or `None` unless the type is known and the
/// sequence is positive.
pub fn format_code(doc_type: &str, sequence: i64) -> Option<String> {
    let doc_type = DocumentType::parse(doc_type)?;
    if sequence <= 0 {
        return None;
    }
    Some(format!("{}-{:04}", doc_type.as_str(), sequence))
}

/// Parse `OI-0001` (also `OI0001`, `oi_0001`) into its type and sequence.
pub fn try_parse_code(code: &str) -> Option<(DocumentType, u32)> {
    let caps = CODE_PATTERN.captures(code.trim())?;
    let doc_type = DocumentType::parse(&caps[1])?;
    let sequence: u32 = caps[2].parse().ok()?;
    if sequence == 0 {
        return None;
    }
    Some((doc_type, sequence))
}

/// Next sequence for `doc_type`: the smallest positive sequence not taken by
/// any of `existing_codes` of that type. With a dense set this is one past the
/// highest; a gap left by a deleted document is handed out first.
///
/// Callers pass only the codes whose backing files still exist.
pub fn next_sequence<I, S>(existing_codes: I, doc_type: &str) -> u32
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let Some(wanted) = DocumentType::parse(doc_type) else {
        return 1;
    };

    let taken: BTreeSet<u32> = existing_codes
        .into_iter()
        .filter_map(|code| try_parse_code(code.as_ref()))
        .filter(|(t, _)| *t == wanted)
        .map(|(_, seq)| seq)
        .collect();

    let mut candidate = 1;
    for seq in taken {
        if seq != candidate {
            break;
        }
        candidate += 1;
    }
    candidate
}

/// Turn a document code into a safe directory name.
///
/// Strips characters that are invalid in path components, turns whitespace
/// into `_`, collapses runs of `_` and trims stray separators.
pub fn sanitize_code_dir(code: &str) -> String {
    let replaced: String = code
        .chars()
        .filter(|c| !INVALID_PATH_CHARS.contains(c) && !c.is_control())
        .map(|c| if c.is_whitespace() { '_' } else { c })
        .collect();

    let collapsed = UNDERSCORE_RUNS.replace_all(&replaced, "_");
    let trimmed = collapsed.trim_matches(|c| c == '_' || c == '.');

    if trimmed.is_empty() {
        "_".to_string()
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_type() {
        assert_eq!(normalize_type("  oi "), "OI");
        assert_eq!(normalize_type("   "), "");
        assert_eq!(normalize_type(""), "");
    }

    #[test]
    fn test_is_known_type() {
        assert!(is_known_type("OI"));
        assert!(is_known_type("wi"));
        assert!(!is_known_type("SOP"));
        assert!(!is_known_type(""));
    }

    #[test]
    fn test_format_code() {
        assert_eq!(format_code("oi", 1), Some("OI-0001".to_string()));
        assert_eq!(format_code("WI", 42), Some("WI-0042".to_string()));
        assert_eq!(format_code("OI", 0), None);
        assert_eq!(format_code("OI", -3), None);
        assert_eq!(format_code("XX", 1), None);
    }

    #[test]
    fn test_try_parse_code() {
        assert_eq!(try_parse_code("OI-0001"), Some((DocumentType::Oi, 1)));
        assert_eq!(try_parse_code("wi-0100"), Some((DocumentType::Wi, 100)));
        assert_eq!(try_parse_code("OI0007"), Some((DocumentType::Oi, 7)));
        assert_eq!(try_parse_code("OI-0000"), None);
        assert_eq!(try_parse_code("XX-0001"), None);
        assert_eq!(try_parse_code("OI-001"), None);
        assert_eq!(try_parse_code("OI-00012"), None);
        assert_eq!(try_parse_code("report"), None);
    }

    #[test]
    fn test_next_sequence_empty() {
        let none: Vec<&str> = Vec::new();
        assert_eq!(next_sequence(none, "OI"), 1);
    }

    #[test]
    fn test_next_sequence_ignores_other_types_and_garbage() {
        let codes = ["OI-0003", "WI-0009", "junk", "oi-0001"];
        assert_eq!(next_sequence(codes, "OI"), 4);
        assert_eq!(next_sequence(codes, "wi"), 10);
    }

    #[test]
    fn test_next_sequence_reuses_freed_top_number() {
        // OI-0003 was deleted; only the surviving codes are passed in.
        assert_eq!(next_sequence(["OI-0001", "OI-0002"], "OI"), 3);
    }

    #[test]
    fn test_next_sequence_fills_gap() {
        // OI-0002 was deleted while OI-0001 and OI-0003 survive.
        assert_eq!(next_sequence(["OI-0003", "OI-0001"], "OI"), 2);
        assert_eq!(next_sequence(["OI-0002", "OI-0003"], "OI"), 1);
    }

    #[test]
    fn test_next_sequence_duplicates() {
        assert_eq!(next_sequence(["OI-0001", "OI-0001", "OI0002"], "OI"), 3);
    }

    #[test]
    fn test_sanitize_code_dir() {
        assert_eq!(sanitize_code_dir("OI-0001"), "OI-0001");
        assert_eq!(sanitize_code_dir("OI:0001"), "OI0001");
        assert_eq!(sanitize_code_dir("  a  b__c "), "a_b_c");
        assert_eq!(sanitize_code_dir("../x"), "x");
        assert_eq!(sanitize_code_dir("???"), "_");
    }
}
