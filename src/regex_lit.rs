//! Regex literal backend (spec.md §4.1's regex-mode lexing feeds into
//! this at compile time; the VM calls through here at match time).
//!
//! Jactl regex literals support Java-style backreferences, which the
//! fast `regex` crate deliberately doesn't implement. Grounded on the
//! teacher's two-tier regex handling: `regex` is tried first since it's
//! the faster engine, falling back to `fancy-regex` only for patterns
//! that need backreferences or lookaround.

use fancy_regex::Regex as FancyRegex;
use regex::Regex as FastRegex;

enum Compiled {
    Fast(FastRegex),
    Fancy(FancyRegex),
}

fn needs_fancy(pattern: &str) -> bool {
    let bytes = pattern.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 1 < bytes.len() && bytes[i + 1].is_ascii_digit() {
            return true;
        }
        if bytes[i] == b'(' {
            let rest = &pattern[i..];
            if rest.starts_with("(?=") || rest.starts_with("(?!") || rest.starts_with("(?<=") || rest.starts_with("(?<!") {
                return true;
            }
        }
        i += 1;
    }
    false
}

fn compile(pattern: &str) -> Result<Compiled, String> {
    if needs_fancy(pattern) {
        FancyRegex::new(pattern).map(Compiled::Fancy).map_err(|e| e.to_string())
    } else {
        FastRegex::new(pattern).map(Compiled::Fast).map_err(|e| e.to_string())
    }
}

pub fn matches(subject: &str, pattern: &str) -> Result<bool, String> {
    match compile(pattern)? {
        Compiled::Fast(re) => Ok(re.is_match(subject)),
        Compiled::Fancy(re) => re.is_match(subject).map_err(|e| e.to_string()),
    }
}

/// Numbered capture groups from the first match, group 0 (the whole
/// match) included, for Jactl's implicit `$1`/`$2` capture-group
/// variables (spec.md §4.1).
pub fn captures(subject: &str, pattern: &str) -> Result<Option<Vec<Option<String>>>, String> {
    match compile(pattern)? {
        Compiled::Fast(re) => Ok(re.captures(subject).map(|caps| {
            caps.iter().map(|m| m.map(|m| m.as_str().to_string())).collect()
        })),
        Compiled::Fancy(re) => {
            let caps = re.captures(subject).map_err(|e| e.to_string())?;
            Ok(caps.map(|caps| caps.iter().map(|m| m.map(|m| m.as_str().to_string())).collect()))
        }
    }
}

pub fn replace_all(subject: &str, pattern: &str, replacement: &str) -> Result<String, String> {
    match compile(pattern)? {
        Compiled::Fast(re) => Ok(re.replace_all(subject, replacement).into_owned()),
        Compiled::Fancy(re) => re.replace_all(subject, replacement).map(|s| s.into_owned()).map_err(|e| e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simple_pattern_matches_without_fancy() {
        assert!(matches("hello world", "wor.d").unwrap());
    }

    #[test]
    fn backreference_pattern_uses_fancy_engine() {
        assert!(matches("abab", r"(ab)\1").unwrap());
        assert!(!matches("abcd", r"(ab)\1").unwrap());
    }

    #[test]
    fn captures_numbered_groups() {
        let caps = captures("2026-07-28", r"(\d+)-(\d+)-(\d+)").unwrap().unwrap();
        assert_eq!(caps[1].as_deref(), Some("2026"));
    }
}
