//! Prompt composition for test generation.

use crate::config::{Rules, TestFramework};

/// Build the test-generation prompt for one source unit.
///
/// Sections appear in a fixed order: role, output format, test counts,
/// positive/negative cases, edge cases to avoid, includes, methods to focus
/// on, extra guidance, then the code itself.
pub fn compose(
    source: &str,
    rules: &Rules,
    extra_guidance: Option<&str>,
    source_includes: &[String],
) -> String {
    let mut prompt = String::new();
    let fences = rules.output_format.markdown_code_fences;
    let lang = &rules.output_format.file_type;

    let role = rules.prompt_guidance.role_description.trim();
    if !role.is_empty() {
        prompt.push_str(role);
        prompt.push_str("\n\n");
    }

    prompt.push_str(&format!(
        "Generate ONLY the {} unit test code using the {} ({}) framework.\n\n",
        rules.language, rules.framework, rules.test_framework
    ));

    prompt.push_str("OUTPUT FORMAT:\n");
    if rules.output_format.extra_text {
        prompt.push_str("- Keep any explanation inside code comments\n");
    } else {
        prompt.push_str("- Return ONLY valid test code\n");
        prompt.push_str("- Do NOT include any explanatory text\n");
        prompt.push_str("- Do NOT include phrases like 'Here is', 'This test', etc.\n");
    }
    if rules.prompt_guidance.strict_formatting {
        prompt.push_str(&format!(
            "- Start directly with #include statements or {} macros\n",
            rules.naming.test_prefix
        ));
        prompt.push_str("- End with the last closing brace of the last test\n");
    }
    if fences {
        prompt.push_str(&format!("- Use markdown code fences (```{} and ```)\n", lang));
    } else {
        prompt.push_str("- Do NOT use markdown code fences\n");
    }
    if rules.output_format.example_in_prompt {
        prompt.push_str("- Follow this shape:\n");
        prompt.push_str(example_for(rules.test_framework));
    }

    prompt.push_str("\nREQUIREMENTS:\n");
    prompt.push_str(&format!(
        "- Use language standard: {}\n",
        rules.standards.cpp_standard
    ));
    let counts = &rules.test_case_rules;
    prompt.push_str(&format!(
        "- Include {} test cases per method\n",
        counts.per_method
    ));
    prompt.push_str(&format!("- Maximum total tests: {}\n", counts.total_tests));
    if rules.naming.descriptive_test_names {
        prompt.push_str("- Give every test a descriptive name\n");
    }
    if rules.naming.include_class_in_test_name {
        prompt.push_str("- Use the class under test as the test suite name\n");
    }
    if rules.assertions.complete_braces_required {
        prompt.push_str("- Every test body must have complete, balanced braces\n");
    }
    if !rules.assertions.preferred.is_empty() {
        prompt.push_str(&format!(
            "- Prefer these assertions: {}\n",
            rules.assertions.preferred.join(", ")
        ));
    }

    if counts.include_positive_case {
        prompt.push_str("- Include positive test cases\n");
    }
    if counts.include_negative_case {
        prompt.push_str("- Include negative test cases\n");
    }

    if !counts.avoid_edge_cases.is_empty() {
        prompt.push_str(&format!(
            "- Avoid these edge cases: {}\n",
            counts.avoid_edge_cases.join(", ")
        ));
    }

    if !source_includes.is_empty() {
        prompt.push_str("- Include the relevant headers from the original file\n");
        prompt.push_str(&format!(
            "- Additionally, include these imports from the original file: {}\n",
            source_includes.join(", ")
        ));
    }
    if !rules.includes.is_empty() {
        prompt.push_str(&format!(
            "- Also include these headers: {}\n",
            rules.includes.join(", ")
        ));
    }

    let methods = rules.methods_to_test.methods_to_test();
    if !methods.is_empty() {
        prompt.push_str(&format!("- Focus on testing: {}\n", methods.join(", ")));
    }

    if let Some(extra) = extra_guidance.map(str::trim).filter(|s| !s.is_empty()) {
        prompt.push_str("\nAdditional requirements:\n");
        prompt.push_str(extra);
        prompt.push('\n');
    }

    if rules.prompt_guidance.code_to_test_in_prompt {
        prompt.push_str("\nCode to test:\n");
        if fences {
            prompt.push_str(&format!("```{}\n", lang));
        }
        prompt.push_str(source);
        if fences {
            prompt.push_str("\n```");
        }
    }

    prompt.push_str(&format!(
        "\n\nOutput only the complete {} test file code:",
        rules.language
    ));
    if fences {
        prompt.push_str(&format!("\n```{}", lang));
    }

    prompt
}

fn example_for(framework: TestFramework) -> &'static str {
    match framework {
        TestFramework::Gtest => {
            "#include <gtest/gtest.h>\n#include \"widget.h\"\n\nTEST(WidgetTest, ReturnsSizeForValidInput) {\n    EXPECT_EQ(Widget(3).size(), 3);\n}\n"
        }
        TestFramework::Catch2 | TestFramework::Doctest => {
            "#include \"widget.h\"\n\nTEST_CASE(\"Widget returns size for valid input\") {\n    CHECK(Widget(3).size() == 3);\n}\n"
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MethodSource;

    const SOURCE: &str = "#include <vector>\nint add(int a, int b) { return a + b; }";

    fn position(prompt: &str, needle: &str) -> usize {
        prompt
            .find(needle)
            .unwrap_or_else(|| panic!("{:?} missing from prompt", needle))
    }

    #[test]
    fn test_sections_in_order() {
        let rules = Rules::default();
        let includes = vec!["#include <vector>".to_string()];
        let prompt = compose(SOURCE, &rules, Some("Use fixtures"), &includes);

        let order = [
            "You are an expert C++ programmer",
            "OUTPUT FORMAT:",
            "- Include 2 test cases per method",
            "- Maximum total tests: 4",
            "- Include positive test cases",
            "- Include negative test cases",
            "- Avoid these edge cases: INT_MIN, INT_MAX",
            "include these imports from the original file: #include <vector>",
            "- Also include these headers: #include <gtest/gtest.h>",
            "- Focus on testing: add, subtract",
            "Use fixtures",
            "Code to test:",
            "int add(int a, int b)",
        ];
        let positions: Vec<usize> = order.iter().map(|n| position(&prompt, n)).collect();
        assert!(
            positions.windows(2).all(|w| w[0] < w[1]),
            "sections out of order: {:?}",
            positions
        );
    }

    #[test]
    fn test_deterministic() {
        let rules = Rules::default();
        let a = compose(SOURCE, &rules, None, &[]);
        let b = compose(SOURCE, &rules, None, &[]);
        assert_eq!(a, b);
    }

    #[test]
    fn test_no_fences_by_default() {
        let prompt = compose(SOURCE, &Rules::default(), None, &[]);
        assert!(prompt.contains("Do NOT use markdown code fences"));
        assert!(!prompt.contains("```"));
    }

    #[test]
    fn test_fences_when_enabled() {
        let mut rules = Rules::default();
        rules.output_format.markdown_code_fences = true;
        let prompt = compose(SOURCE, &rules, None, &[]);
        assert!(prompt.contains("```cpp\n#include <vector>"));
        assert!(prompt.ends_with("```cpp"));
    }

    #[test]
    fn test_negative_cases_omitted_when_disabled() {
        let mut rules = Rules::default();
        rules.test_case_rules.include_negative_case = false;
        rules.test_case_rules.avoid_edge_cases.clear();
        let prompt = compose(SOURCE, &rules, None, &[]);
        assert!(prompt.contains("Include positive test cases"));
        assert!(!prompt.contains("Include negative test cases"));
        assert!(!prompt.contains("Avoid these edge cases"));
    }

    #[test]
    fn test_dynamic_methods() {
        let mut rules = Rules::default();
        rules.methods_to_test.source = MethodSource::Dynamic;
        let prompt = compose(SOURCE, &rules, None, &[]);
        assert!(prompt.contains("Focus on testing: all public methods, constructors"));
    }

    #[test]
    fn test_blank_extra_guidance_skipped() {
        let prompt = compose(SOURCE, &Rules::default(), Some("   "), &[]);
        assert!(!prompt.contains("Additional requirements"));
    }

    #[test]
    fn test_catch2_example() {
        let mut rules = Rules::default();
        rules.test_framework = TestFramework::Catch2;
        let prompt = compose(SOURCE, &rules, None, &[]);
        assert!(prompt.contains("TEST_CASE(\"Widget returns size"));
    }

    #[test]
    fn test_source_omitted_when_disabled() {
        let mut rules = Rules::default();
        rules.prompt_guidance.code_to_test_in_prompt = false;
        let prompt = compose(SOURCE, &rules, None, &[]);
        assert!(!prompt.contains("int add(int a, int b)"));
    }
}
