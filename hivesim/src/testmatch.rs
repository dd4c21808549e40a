use regex::Regex;

/// Matches suite and test names against the `HIVE_TEST_PATTERN` value.
/// The pattern is a `/`-separated list of regular expressions: the first
/// part applies to the suite name, the rest to the test name. Matching is
/// case insensitive.
#[derive(Clone, Debug)]
pub struct TestMatcher {
    pub suite: Regex,
    pub test: Regex,
    pub pattern: String,
}

impl TestMatcher {
    pub fn new(pattern: &str) -> Self {
        let parts = Self::split_regexp(pattern);
        let suite =
            Regex::new(&format!("(?i:{})", parts[0])).expect("Failed to compile suite regex");
        let test = if parts.len() > 1 {
            Regex::new(&format!("(?i:{})", parts[1..].join("/")))
                .expect("Failed to compile test regex")
        } else {
            Regex::new("").expect("Failed to compile empty regex")
        };
        Self { suite, test, pattern: pattern.to_string() }
    }

    pub fn match_test(&self, suite: &str, test: &str) -> bool {
        if !self.suite.is_match(suite) {
            return false;
        }
        if !test.is_empty() && !self.test.is_match(test) {
            return false;
        }
        true
    }

    /// Splits the pattern on unescaped `/` separators outside character
    /// classes and groups.
    fn split_regexp(pattern: &str) -> Vec<&str> {
        let mut rest = pattern;
        let mut parts = Vec::with_capacity(pattern.matches('/').count());
        let mut square_bracket_counter = 0;
        let mut parenthesis_counter = 0;
        let mut chars = rest.char_indices();
        while let Some((pos, c)) = chars.next() {
            match c {
                '[' => square_bracket_counter += 1,
                ']' => {
                    if square_bracket_counter > 0 {
                        square_bracket_counter -= 1;
                    }
                }
                '(' => {
                    if square_bracket_counter == 0 {
                        parenthesis_counter += 1;
                    }
                }
                ')' => {
                    if square_bracket_counter == 0 {
                        parenthesis_counter -= 1;
                    }
                }
                '\\' => {
                    chars.next();
                }
                '/' => {
                    if square_bracket_counter == 0 && parenthesis_counter == 0 {
                        parts.push(&rest[..pos]);
                        rest = &rest[pos + 1..];
                        chars = rest.char_indices();
                    }
                }
                _ => {}
            }
        }
        parts.push(rest);
        parts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_on_slashes() {
        assert_eq!(TestMatcher::split_regexp("suite/test"), vec!["suite", "test"]);
        assert_eq!(TestMatcher::split_regexp("suite/test/sub"), vec!["suite", "test", "sub"]);
        assert_eq!(TestMatcher::split_regexp("suite"), vec!["suite"]);
    }

    #[test]
    fn split_keeps_grouped_slashes() {
        assert_eq!(TestMatcher::split_regexp("suite/(a/b)"), vec!["suite", "(a/b)"]);
        assert_eq!(TestMatcher::split_regexp("suite/[a/b]"), vec!["suite", "[a/b]"]);
        assert_eq!(TestMatcher::split_regexp(r"suite/a\/b"), vec!["suite", r"a\/b"]);
    }

    #[test]
    fn split_handles_multibyte_characters() {
        assert_eq!(TestMatcher::split_regexp("café/test"), vec!["café", "test"]);
        assert_eq!(TestMatcher::split_regexp("über/straße/münze"), vec!["über", "straße", "münze"]);
        assert_eq!(TestMatcher::split_regexp(r"caf\é/test"), vec![r"caf\é", "test"]);

        let matcher = TestMatcher::new("café/test");
        assert!(matcher.match_test("Café", "test"));
        assert!(!matcher.match_test("cafe", "test"));
    }

    #[test]
    fn matches_tests() {
        let matcher = TestMatcher::new("sim/test");
        assert!(matcher.match_test("sim", "test"));
        assert!(matcher.match_test("Sim", "Test"));
        assert!(matcher.match_test("Sim", "TestTest"));
        assert!(!matcher.match_test("Sim", "Tst"));

        let matcher = TestMatcher::new("/test");
        assert!(matcher.match_test("sim", "test"));
        assert!(matcher.match_test("", "Test"));
        assert!(matcher.match_test("", "aTesta"));
        assert!(matcher.match_test("bob", "test"));
    }

    #[test]
    fn matches_suites() {
        let matcher = TestMatcher::new("sim");
        assert!(matcher.match_test("sim", ""));
        assert!(matcher.match_test("Sim", ""));
        assert!(matcher.match_test("Sim", "any test at all"));
        assert!(!matcher.match_test("other", ""));
    }
}
