//! Test case extraction from C++ test source.
//!
//! Declarations are found with regular expressions; each body is then
//! recovered with a brace-depth scan from the first `{` after the
//! declaration to its matching `}`.

use super::TestCase;
use crate::config::TestFramework;
use regex::{Captures, Regex};
use std::path::Path;

/// `TEST(Suite, Name)`
const GTEST_SIMPLE: &str = r"\bTEST\s*\(\s*([A-Za-z_]\w*)\s*,\s*([A-Za-z_]\w*)\s*\)";

/// `TEST_F(Fixture, Name)`
const GTEST_FIXTURE: &str = r"\bTEST_F\s*\(\s*([A-Za-z_]\w*)\s*,\s*([A-Za-z_]\w*)\s*\)";

/// `TEST_CASE("name")` or `TEST_CASE("name", "[tags]")`
const STRING_CASE: &str =
    r#"\bTEST_CASE\s*\(\s*"((?:[^"\\]|\\.)*)"\s*(?:,\s*"((?:[^"\\]|\\.)*)"\s*)?\)"#;

/// How a pattern's captures map to a suite and a test name
#[derive(Debug, Clone, Copy)]
enum Family {
    /// Capture 1 is the suite, capture 2 the name
    SuiteAndName,
    /// Capture 1 is the name, optional capture 2 holds tags
    NameAndTags,
}

/// A declaration found in the source, before its body is scanned
struct Declaration {
    start: usize,
    end: usize,
    suite: String,
    name: String,
}

/// Brace scanner state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scan {
    SeekingOpen,
    InBody { depth: usize },
}

/// Parses test source text into [`TestCase`] records.
pub struct TestCaseExtractor {
    patterns: Vec<(Regex, Family)>,
}

impl TestCaseExtractor {
    pub fn new(framework: TestFramework) -> Result<Self, regex::Error> {
        let patterns = match framework {
            TestFramework::Gtest => vec![
                (Regex::new(GTEST_SIMPLE)?, Family::SuiteAndName),
                (Regex::new(GTEST_FIXTURE)?, Family::SuiteAndName),
            ],
            TestFramework::Catch2 | TestFramework::Doctest => {
                vec![(Regex::new(STRING_CASE)?, Family::NameAndTags)]
            }
        };
        Ok(Self { patterns })
    }

    /// Every well-formed test case in `text`, in source order, plus the text
    /// around them (fixtures, helpers, `using` lines).
    ///
    /// A declaration whose braces never balance is dropped and the rest of
    /// the file is still processed. It takes everything up to the next
    /// declaration with it, so a truncated body never leaks into the
    /// support text.
    pub fn extract_with_support(&self, path: &Path, text: &str) -> (Vec<TestCase>, String) {
        let mut declarations = self.declarations(path, text);
        declarations.sort_by_key(|d| d.start);
        let starts: Vec<usize> = declarations.iter().map(|d| d.start).collect();

        let mut cases = Vec::new();
        let mut support = String::new();
        let mut consumed_until = 0;

        for (i, decl) in declarations.into_iter().enumerate() {
            // Declarations inside an extracted body belong to that body
            if decl.start < consumed_until {
                continue;
            }
            support.push_str(&text[consumed_until..decl.start]);

            match body_end(text, decl.end) {
                Some(end) => {
                    consumed_until = end;
                    let case = TestCase {
                        suite: decl.suite,
                        name: decl.name,
                        file: path.to_path_buf(),
                        body: text[decl.start..end].to_string(),
                    };
                    tracing::trace!("{}: extracted {:?}", path.display(), case.key());
                    cases.push(case);
                }
                None => {
                    tracing::warn!(
                        "{}: dropping {}.{}: unbalanced braces",
                        path.display(),
                        decl.suite,
                        decl.name
                    );
                    consumed_until = starts
                        .get(i + 1..)
                        .and_then(|rest| rest.iter().find(|&&s| s > decl.start))
                        .copied()
                        .unwrap_or(text.len());
                }
            }
        }
        support.push_str(&text[consumed_until.min(text.len())..]);

        (cases, support)
    }

    fn declarations(&self, path: &Path, text: &str) -> Vec<Declaration> {
        let mut found = Vec::new();
        for (regex, family) in &self.patterns {
            for caps in regex.captures_iter(text) {
                let Some(whole) = caps.get(0) else {
                    continue;
                };
                let (suite, name) = names_for(*family, &caps, path);
                found.push(Declaration {
                    start: whole.start(),
                    end: whole.end(),
                    suite,
                    name,
                });
            }
        }
        found
    }
}

fn names_for(family: Family, caps: &Captures<'_>, path: &Path) -> (String, String) {
    let group = |i: usize| caps.get(i).map(|m| m.as_str().to_string());
    match family {
        Family::SuiteAndName => (group(1).unwrap_or_default(), group(2).unwrap_or_default()),
        Family::NameAndTags => {
            let suite = group(2)
                .and_then(|tags| first_tag(&tags))
                .unwrap_or_else(|| file_suite(path));
            (suite, group(1).unwrap_or_default())
        }
    }
}

/// `"[math][fast]"` -> `math`
fn first_tag(tags: &str) -> Option<String> {
    let open = tags.find('[')?;
    let close = open + tags[open..].find(']')?;
    let tag = tags[open + 1..close].trim();
    (!tag.is_empty()).then(|| tag.to_string())
}

fn file_suite(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "default".to_string())
}

/// Byte offset just past the brace closing the body that starts after `from`.
///
/// Returns `None` when the declaration has no body or its braces never
/// balance.
fn body_end(text: &str, from: usize) -> Option<usize> {
    let mut state = Scan::SeekingOpen;

    for (offset, ch) in text[from..].char_indices() {
        state = match (state, ch) {
            (Scan::SeekingOpen, '{') => Scan::InBody { depth: 1 },
            // A declaration followed by `;` or `}` has no body of its own
            (Scan::SeekingOpen, ';' | '}') => return None,
            (Scan::SeekingOpen, _) => Scan::SeekingOpen,
            (Scan::InBody { depth }, '{') => Scan::InBody { depth: depth + 1 },
            (Scan::InBody { depth: 1 }, '}') => return Some(from + offset + 1),
            (Scan::InBody { depth }, '}') => Scan::InBody { depth: depth - 1 },
            (in_body, _) => in_body,
        };
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gtest() -> TestCaseExtractor {
        TestCaseExtractor::new(TestFramework::Gtest).unwrap()
    }

    fn extract(text: &str) -> Vec<TestCase> {
        gtest().extract_with_support(Path::new("calc_test.cc"), text).0
    }

    fn brace_balance(s: &str) -> i64 {
        s.chars()
            .map(|c| match c {
                '{' => 1,
                '}' => -1,
                _ => 0,
            })
            .sum()
    }

    #[test]
    fn test_simple_and_fixture_in_source_order() {
        let text = "TEST_F(CalcFixture, UsesFixture) {\n  EXPECT_TRUE(ready);\n}\n\nTEST(CalcTest, Adds) {\n  EXPECT_EQ(add(1, 2), 3);\n}\n";
        let cases = extract(text);

        assert_eq!(cases.len(), 2);
        assert_eq!(cases[0].key(), ("CalcFixture", "UsesFixture"));
        assert_eq!(cases[1].key(), ("CalcTest", "Adds"));
        assert_eq!(
            cases[1].body,
            "TEST(CalcTest, Adds) {\n  EXPECT_EQ(add(1, 2), 3);\n}"
        );
        assert_eq!(cases[0].file, Path::new("calc_test.cc"));
    }

    #[test]
    fn test_nested_braces() {
        let text = r#"TEST(Nested, Loops) {
    for (int i = 0; i < 3; ++i) {
        if (i % 2 == 0) {
            std::vector<int> v{1, 2, 3};
            EXPECT_EQ(v.size(), 3u);
        } else {
            [&]() { EXPECT_TRUE(true); }();
        }
    }
}
int trailing() { return 0; }
"#;
        let cases = extract(text);

        assert_eq!(cases.len(), 1);
        assert!(cases[0].body.starts_with("TEST(Nested, Loops) {"));
        assert!(cases[0].body.ends_with("    }\n}"));
        assert!(!cases[0].body.contains("trailing"));
        assert_eq!(brace_balance(&cases[0].body), 0);
    }

    #[test]
    fn test_unbalanced_case_dropped_rest_kept() {
        let text = "TEST(Good, First) {\n  EXPECT_EQ(1, 1);\n}\n\nTEST(Bad, Missing);\n\nTEST(Good, Second) {\n  EXPECT_EQ(2, 2);\n}\n";
        let cases = extract(text);

        let keys: Vec<_> = cases.iter().map(|c| c.key()).collect();
        assert_eq!(keys, vec![("Good", "First"), ("Good", "Second")]);
    }

    #[test]
    fn test_truncated_body_dropped() {
        let text = "TEST(Calc, Complete) {\n  EXPECT_EQ(1, 1);\n}\nTEST(Calc, Truncated) {\n  if (x) {\n    EXPECT_EQ(1, 1);\n";
        let cases = extract(text);

        assert_eq!(cases.len(), 1);
        assert_eq!(cases[0].name, "Complete");
    }

    #[test]
    fn test_declaration_inside_body_not_extracted_twice() {
        let text = "TEST(Outer, Case) {\n  const char* s = \"TEST(Inner, Case) { }\";\n}\n";
        let cases = extract(text);

        assert_eq!(cases.len(), 1);
        assert_eq!(cases[0].key(), ("Outer", "Case"));
    }

    #[test]
    fn test_bodies_always_balance() {
        let inputs = [
            "TEST(A, B) { { } }",
            "TEST(A, B) { { }",
            "TEST(A, B) } {",
            "TEST(A, B) {}} TEST(C, D) {{}}",
            "}}}} TEST(A, B) {{{ }} TEST(C, D) { } }",
            "TEST(A, B) { \"{\" }",
            "garbage { TEST(X, Y) ; } TEST(Z, W) {",
        ];
        for input in inputs {
            for case in extract(input) {
                assert_eq!(brace_balance(&case.body), 0, "input {:?}", input);
            }
        }
    }

    #[test]
    fn test_catch2_tags_and_file_suite() {
        let extractor = TestCaseExtractor::new(TestFramework::Catch2).unwrap();
        let text = "TEST_CASE(\"adds numbers\", \"[math][fast]\") {\n  CHECK(add(1, 2) == 3);\n}\nTEST_CASE(\"untagged\") {\n  REQUIRE(true);\n}\n";
        let (cases, _) = extractor.extract_with_support(Path::new("tests/calc_test.cpp"), text);

        assert_eq!(cases.len(), 2);
        assert_eq!(cases[0].key(), ("math", "adds numbers"));
        assert_eq!(cases[1].key(), ("calc_test", "untagged"));
    }

    #[test]
    fn test_gtest_patterns_ignore_test_case_macro() {
        let cases = extract("TEST_CASE(\"not gtest\") { }");
        assert!(cases.is_empty());
    }

    #[test]
    fn test_support_text_keeps_fixture() {
        let text = "#include <gtest/gtest.h>\n\nclass CalcFixture : public ::testing::Test {\n protected:\n  void SetUp() override { value = 2; }\n  int value;\n};\n\nTEST_F(CalcFixture, Works) {\n  EXPECT_EQ(value, 2);\n}\n\nstatic int helper() { return 1; }\n";
        let (cases, support) = gtest().extract_with_support(Path::new("calc_test.cc"), text);

        assert_eq!(cases.len(), 1);
        assert!(support.contains("class CalcFixture : public ::testing::Test {"));
        assert!(support.contains("static int helper()"));
        assert!(!support.contains("TEST_F"));
        assert!(!support.contains("EXPECT_EQ(value, 2)"));
    }

    #[test]
    fn test_support_text_skips_dropped_declaration() {
        let text = "int shared = 1;\nTEST(Calc, Truncated) {\n  if (x) {\nTEST(Calc, Fine) {\n}\n";
        let (_, support) = gtest().extract_with_support(Path::new("calc_test.cc"), text);

        assert_eq!(support.trim(), "int shared = 1;");
    }

    #[test]
    fn test_first_tag() {
        assert_eq!(first_tag("[math][fast]"), Some("math".to_string()));
        assert_eq!(first_tag("[]"), None);
        assert_eq!(first_tag("no tags"), None);
    }
}
