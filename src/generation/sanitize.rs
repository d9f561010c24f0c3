//! Turns free-form model output into a best-effort test source file.

/// Conversational filler models add despite being told not to.
/// Any line containing one of these is dropped.
const EXPLANATORY_PHRASES: &[&str] = &[
    "Here is the unit test code",
    "Here are the unit tests",
    "This test file includes",
    "The test file contains",
    "These tests cover",
    "The maximum total tests are",
    "as per the requirement",
    "This covers",
    "The tests include",
];

const FENCE: &str = "```";

/// Fence spellings removed from text that never opened a real code block
const STRAY_FENCES: &[&str] = &["```cpp", "```c++", "```"];

/// At least one must be present for the output to count as test code
const REQUIRED_MARKERS: &[&str] = &["#include", "TEST(", "TEST_F(", "TEST_CASE(", "EXPECT_", "ASSERT_"];

/// Result of sanitizing a model response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sanitized {
    pub code: String,
    /// Whether `code` looks like genuine test code
    pub ok: bool,
}

/// Strip prose and fences from `raw`, then validate what is left.
///
/// Applying this to its own output changes nothing.
pub fn sanitize(raw: &str) -> Sanitized {
    let filtered = drop_explanations(raw);
    let extracted = extract_code(&filtered);
    // Removing stray fences can splice text together; filter again so the
    // result is a fixed point.
    let code = trim_blank_lines(&drop_explanations(&extracted));
    let ok = is_valid_test_code(&code);
    Sanitized { code, ok }
}

/// Does `code` contain any marker of real test code?
pub fn is_valid_test_code(code: &str) -> bool {
    REQUIRED_MARKERS.iter().any(|marker| code.contains(marker))
}

fn drop_explanations(text: &str) -> String {
    text.lines()
        .filter(|line| !EXPLANATORY_PHRASES.iter().any(|p| line.contains(p)))
        .collect::<Vec<_>>()
        .join("\n")
}

fn is_fence_line(line: &str) -> bool {
    line.trim_start().starts_with(FENCE)
}

/// Keep only fenced lines if the text has fences, otherwise everything.
fn extract_code(text: &str) -> String {
    let mut inside = false;
    let mut saw_fence = false;
    let mut code_lines = Vec::new();

    for line in text.lines() {
        if is_fence_line(line) {
            saw_fence = true;
            inside = !inside;
            continue;
        }
        if inside {
            code_lines.push(line);
        }
    }

    if !saw_fence {
        tracing::debug!("No code fences found, using whole response");
        return strip_stray_fences(text);
    }

    tracing::debug!("Extracted {} fenced lines", code_lines.len());
    strip_stray_fences(&code_lines.join("\n"))
}

fn strip_stray_fences(text: &str) -> String {
    let mut result = text.to_string();
    while result.contains(FENCE) {
        for fence in STRAY_FENCES {
            result = result.replace(fence, "");
        }
    }
    result
}

fn trim_blank_lines(text: &str) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.iter().position(|l| !l.trim().is_empty());
    let end = lines.iter().rposition(|l| !l.trim().is_empty());

    match (start, end) {
        (Some(start), Some(end)) => lines[start..=end].join("\n"),
        _ => String::new(),
    }
}
