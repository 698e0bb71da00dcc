//! Glob-style key patterns.
//!
//! `*` matches any sequence of characters and is the only wildcard. Every
//! other character is matched literally, and `\` makes the next character
//! literal too (so `\*` is a plain asterisk). A pattern without any wildcard
//! gets one appended, so `foo` behaves like `foo*`. Matches are anchored to
//! the whole key.
//!
//! The same pattern is rendered for each backend: a regex source for the
//! in-process matcher, SQLite and PostgreSQL, and an escaped glob for a
//! Redis-compatible server.

use regex::{Regex, RegexBuilder};

/// A normalized key pattern split into literal segments around `*`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPattern {
    /// Literal text between wildcards. `n` segments means `n - 1` wildcards.
    segments: Vec<String>,
}

impl KeyPattern {
    pub fn new(pattern: &str) -> Self {
        let mut segments = vec![String::new()];
        let mut chars = pattern.chars();
        while let Some(c) = chars.next() {
            match c {
                '*' => segments.push(String::new()),
                '\\' => {
                    // A trailing backslash stands for itself
                    let literal = chars.next().unwrap_or('\\');
                    if let Some(last) = segments.last_mut() {
                        last.push(literal);
                    }
                }
                _ => {
                    if let Some(last) = segments.last_mut() {
                        last.push(c);
                    }
                }
            }
        }
        if segments.len() == 1 {
            segments.push(String::new());
        }
        KeyPattern { segments }
    }

    /// Anchored regex source, e.g. `foo.bar*` becomes `^foo\.bar.*$`.
    ///
    /// Understood by the `regex` crate and by PostgreSQL's `~` operator.
    pub fn regex_source(&self) -> String {
        let escaped: Vec<String> = self.segments.iter().map(|s| regex::escape(s)).collect();
        format!("^{}$", escaped.join(".*"))
    }

    /// Compile into an in-process matcher
    pub fn to_regex(&self) -> Result<Regex, regex::Error> {
        compile(&self.regex_source())
    }

    /// Redis glob with its own metacharacters escaped
    pub fn redis_glob(&self) -> String {
        let escaped: Vec<String> = self.segments.iter().map(|s| escape_glob(s)).collect();
        escaped.join("*")
    }
}

/// Compile a regex source produced by [`KeyPattern::regex_source`].
///
/// `.` must also match newlines, since keys are arbitrary strings.
pub fn compile(source: &str) -> Result<Regex, regex::Error> {
    RegexBuilder::new(source).dot_matches_new_line(true).build()
}

/// Escape `literal` so it can be embedded in a pattern and match only itself
pub fn escape(literal: &str) -> String {
    let mut out = String::with_capacity(literal.len());
    for c in literal.chars() {
        if matches!(c, '*' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

fn escape_glob(literal: &str) -> String {
    let mut out = String::with_capacity(literal.len());
    for c in literal.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matches(pattern: &str, key: &str) -> bool {
        KeyPattern::new(pattern).to_regex().unwrap().is_match(key)
    }

    #[test]
    fn test_trailing_wildcard() {
        assert!(matches("foo*", "foobar"));
        assert!(matches("foo*", "foo"));
        assert!(!matches("foo*", "barfoo"));
    }

    #[test]
    fn test_no_wildcard_is_prefix_match() {
        assert!(matches("foo", "foo"));
        assert!(matches("foo", "foobar"));
        assert!(!matches("foo", "xfoo"));
        assert_eq!(KeyPattern::new("foo").regex_source(), "^foo.*$");
    }

    #[test]
    fn test_inner_wildcards() {
        assert!(matches("a*c", "abc"));
        assert!(matches("a*c", "ac"));
        assert!(!matches("a*c", "abcd"));
        assert!(matches("*", ""));
        assert!(matches("user:*:name", "user:42:name"));
    }

    #[test]
    fn test_metacharacters_are_literal() {
        assert!(matches("a.c*", "a.cx"));
        assert!(!matches("a.c*", "abcx"));
        assert!(matches("(x)+*", "(x)+1"));
        assert!(!matches("x+*", "xxx"));
        assert!(matches("[ab]", "[ab]"));
        assert!(!matches("[ab]", "a"));
        assert!(matches("a?b", "a?b"));
        assert!(!matches("a?b", "axb"));
    }

    #[test]
    fn test_wildcard_spans_newlines() {
        assert!(matches("a*", "a\nb"));
    }

    #[test]
    fn test_empty_pattern_matches_everything() {
        assert_eq!(KeyPattern::new("").regex_source(), "^.*$");
        assert!(matches("", "anything"));
    }

    #[test]
    fn test_redis_glob() {
        assert_eq!(KeyPattern::new("bob:").redis_glob(), "bob:*");
        assert_eq!(KeyPattern::new("bob:a*").redis_glob(), "bob:a*");
        assert_eq!(KeyPattern::new("k?[x]\\\\").redis_glob(), "k\\?\\[x\\]\\\\*");
        assert_eq!(KeyPattern::new("a\\*b").redis_glob(), "a\\*b*");
    }

    #[test]
    fn test_escaped_wildcard_is_literal() {
        assert!(matches("a\\*b", "a*b"));
        assert!(matches("a\\*b", "a*bc"));
        assert!(!matches("a\\*b", "axb"));
        assert!(matches("a\\\\", "a\\x"));
        assert!(matches("a\\", "a\\"));
    }

    #[test]
    fn test_escape_round_trip() {
        let user = "we*ird\\name";
        let pattern = format!("{}:*", escape(user));
        assert!(matches(&pattern, "we*ird\\name:k"));
        assert!(!matches(&pattern, "weXird\\name:k"));
        assert!(!matches(&pattern, "weird\\name:k"));
    }
}
