//! Glob pattern matching for `scan`.

use regex::Regex;

use crate::error::{StorageError, StorageResult};

/// Compiled glob pattern supporting `*` (any run) and `?` (one character).
#[derive(Debug, Clone)]
pub struct GlobPattern {
    regex: Regex,
}

impl GlobPattern {
    /// Compiles a glob pattern.
    ///
    /// # Errors
    ///
    /// Returns an error if the translated expression fails to compile.
    pub fn new(pattern: &str) -> StorageResult<Self> {
        let mut expr = String::with_capacity(pattern.len() + 8);
        expr.push('^');
        let mut literal = String::new();
        for ch in pattern.chars() {
            match ch {
                '*' | '?' => {
                    expr.push_str(&regex::escape(&literal));
                    literal.clear();
                    expr.push_str(if ch == '*' { ".*" } else { "." });
                }
                other => literal.push(other),
            }
        }
        expr.push_str(&regex::escape(&literal));
        expr.push('$');

        let regex = Regex::new(&expr)
            .map_err(|e| StorageError::internal(format!("invalid scan pattern '{pattern}': {e}")))?;
        Ok(Self { regex })
    }

    /// Returns `true` if `key` matches the pattern.
    #[must_use]
    pub fn matches(&self, key: &str) -> bool {
        self.regex.is_match(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_star_matches_suffix() {
        let pattern = GlobPattern::new("audit:user:u1:*").unwrap();
        assert!(pattern.matches("audit:user:u1:00001:abc"));
        assert!(!pattern.matches("audit:user:u2:00001:abc"));
    }

    #[test]
    fn test_question_mark_matches_single_char() {
        let pattern = GlobPattern::new("token:?:x").unwrap();
        assert!(pattern.matches("token:a:x"));
        assert!(!pattern.matches("token:ab:x"));
    }

    #[test]
    fn test_regex_metacharacters_are_literal() {
        let pattern = GlobPattern::new("rate.limit[1]*").unwrap();
        assert!(pattern.matches("rate.limit[1]:ip"));
        assert!(!pattern.matches("rateXlimit[1]:ip"));
    }
}
