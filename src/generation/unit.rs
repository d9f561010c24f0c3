//! Source units: an implementation file plus its optional header.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Extensions of files that can anchor a source unit
pub const IMPLEMENTATION_EXTENSIONS: &[&str] = &["cpp", "cc", "c"];

/// Extensions of files that are merged into a unit as its header
pub const HEADER_EXTENSIONS: &[&str] = &["h", "hpp"];

/// Extensions replaced by `_test.cc` when naming a generated test file
const RENAMED_EXTENSIONS: &[&str] = &["cpp", "cc", "h", "hpp"];

const TEST_SUFFIX: &str = "_test.cc";

/// One implementation file and the header sharing its base name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceUnit {
    /// Implementation file path, relative to the codebase root
    pub path: PathBuf,
    pub implementation: String,
    pub header: Option<String>,
}

impl SourceUnit {
    /// Header first (if any), then the implementation, each labelled.
    pub fn combined_source(&self) -> String {
        let mut combined = String::new();
        if let Some(header) = self.header.as_deref().filter(|h| !h.is_empty()) {
            combined.push_str("// Header file content:\n");
            combined.push_str(header);
            combined.push_str("\n\n");
        }
        combined.push_str("// Implementation file content:\n");
        combined.push_str(&self.implementation);
        combined
    }

    /// Where this unit's generated tests go under `tests_dir`
    pub fn test_file_path(&self, tests_dir: &Path) -> PathBuf {
        tests_dir.join(test_file_name(&self.path))
    }
}

fn extension_of(path: &Path) -> Option<String> {
    path.extension()
        .map(|ext| ext.to_string_lossy().to_lowercase())
}

/// Group files sharing a base name into units.
///
/// Groups without an implementation file are skipped. Returned units are
/// ordered by path.
pub fn group_units(files: &BTreeMap<PathBuf, String>) -> Vec<SourceUnit> {
    let mut groups: BTreeMap<PathBuf, Vec<(&PathBuf, &String)>> = BTreeMap::new();
    for (path, content) in files {
        groups
            .entry(path.with_extension(""))
            .or_default()
            .push((path, content));
    }

    let mut units = Vec::new();
    for (base, members) in groups {
        let mut implementation: Option<(&PathBuf, &String)> = None;
        let mut header: Option<&String> = None;

        for (path, content) in members {
            let Some(ext) = extension_of(path) else {
                continue;
            };
            if IMPLEMENTATION_EXTENSIONS.contains(&ext.as_str()) {
                match implementation {
                    None => implementation = Some((path, content)),
                    Some((kept, _)) => tracing::warn!(
                        "Multiple implementation files for {}: keeping {}, ignoring {}",
                        base.display(),
                        kept.display(),
                        path.display()
                    ),
                }
            } else if HEADER_EXTENSIONS.contains(&ext.as_str()) && header.is_none() {
                header = Some(content);
            }
        }

        match implementation {
            Some((path, content)) => units.push(SourceUnit {
                path: path.clone(),
                implementation: content.clone(),
                header: header.cloned(),
            }),
            None => {
                tracing::debug!(
                    "Skipping group {}: no implementation file found",
                    base.display()
                );
            }
        }
    }

    units
}

/// `#include` directives in `code`, trimmed, first occurrence only.
pub fn extract_includes(code: &str) -> Vec<String> {
    let mut includes: Vec<String> = Vec::new();
    for line in code.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with("#include") && !includes.iter().any(|i| i == trimmed) {
            includes.push(trimmed.to_string());
        }
    }
    includes
}

/// Map `<dir>/<name>.<ext>` to `<dir>/<name>_test.cc`.
///
/// Unrecognized extensions keep the full filename and gain the suffix.
pub fn test_file_name(source: &Path) -> PathBuf {
    let file_name = source
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();

    // Extensions compare case-insensitively, as in grouping
    let renamed = match (source.file_stem(), extension_of(source)) {
        (Some(stem), Some(ext)) if RENAMED_EXTENSIONS.contains(&ext.as_str()) => {
            format!("{}{}", stem.to_string_lossy(), TEST_SUFFIX)
        }
        _ => format!("{}{}", file_name, TEST_SUFFIX),
    };

    match source.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.join(renamed),
        _ => PathBuf::from(renamed),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn files(entries: &[(&str, &str)]) -> BTreeMap<PathBuf, String> {
        entries
            .iter()
            .map(|(p, c)| (PathBuf::from(p), c.to_string()))
            .collect()
    }

    #[test]
    fn test_group_pairs_header_and_implementation() {
        let units = group_units(&files(&[
            ("models/User.cpp", "impl"),
            ("models/User.h", "header"),
        ]));
        assert_eq!(units.len(), 1);
        assert_eq!(units[0].path, PathBuf::from("models/User.cpp"));
        assert_eq!(units[0].header.as_deref(), Some("header"));
    }

    #[test]
    fn test_group_headerless_unit_is_valid() {
        let units = group_units(&files(&[("utils/math.cc", "impl")]));
        assert_eq!(units.len(), 1);
        assert_eq!(units[0].header, None);
    }

    #[test]
    fn test_group_skips_header_only() {
        let units = group_units(&files(&[("include/config.hpp", "header")]));
        assert!(units.is_empty());
    }

    #[test]
    fn test_group_keeps_directories_apart() {
        let units = group_units(&files(&[
            ("a/util.cpp", "a"),
            ("b/util.cpp", "b"),
            ("b/util.h", "bh"),
        ]));
        assert_eq!(units.len(), 2);
        assert_eq!(units[0].header, None);
        assert_eq!(units[1].header.as_deref(), Some("bh"));
    }

    #[test]
    fn test_combined_source_header_first() {
        let unit = SourceUnit {
            path: PathBuf::from("x.cpp"),
            implementation: "int f() { return 1; }".to_string(),
            header: Some("int f();".to_string()),
        };
        let combined = unit.combined_source();
        let header_at = combined.find("// Header file content:").unwrap();
        let impl_at = combined.find("// Implementation file content:").unwrap();
        assert!(header_at < impl_at);
        assert!(combined.ends_with("int f() { return 1; }"));
    }

    #[test]
    fn test_combined_source_without_header() {
        let unit = SourceUnit {
            path: PathBuf::from("x.cpp"),
            implementation: "int f();".to_string(),
            header: None,
        };
        assert!(!unit.combined_source().contains("Header file content"));
    }

    #[test]
    fn test_extract_includes() {
        let code = "#include <vector>\n  #include \"user.h\"\nint x;\n#include <vector>\n// #include <nope>";
        assert_eq!(
            extract_includes(code),
            vec!["#include <vector>", "#include \"user.h\""]
        );
    }

    #[test]
    fn test_test_file_name_known_extensions() {
        assert_eq!(test_file_name(Path::new("foo.cpp")), PathBuf::from("foo_test.cc"));
        assert_eq!(test_file_name(Path::new("foo.cc")), PathBuf::from("foo_test.cc"));
        assert_eq!(test_file_name(Path::new("foo.h")), PathBuf::from("foo_test.cc"));
        assert_eq!(test_file_name(Path::new("foo.hpp")), PathBuf::from("foo_test.cc"));
    }

    #[test]
    fn test_uppercase_extension_groups_and_renames() {
        let units = group_units(&files(&[("Foo.CPP", "impl"), ("Foo.H", "header")]));
        assert_eq!(units.len(), 1);
        assert_eq!(units[0].header.as_deref(), Some("header"));
        assert_eq!(
            units[0].test_file_path(Path::new("tests")),
            PathBuf::from("tests/Foo_test.cc")
        );
        assert_eq!(test_file_name(Path::new("lib/Bar.Hpp")), PathBuf::from("lib/Bar_test.cc"));
    }

    #[test]
    fn test_test_file_name_unknown_extension_appends() {
        assert_eq!(test_file_name(Path::new("foo.c")), PathBuf::from("foo.c_test.cc"));
        assert_eq!(test_file_name(Path::new("Makefile")), PathBuf::from("Makefile_test.cc"));
    }

    #[test]
    fn test_test_file_name_preserves_directories() {
        assert_eq!(
            test_file_name(Path::new("models/person/Person.cpp")),
            PathBuf::from("models/person/Person_test.cc")
        );
    }

    #[test]
    fn test_test_file_name_only_replaces_final_extension() {
        assert_eq!(
            test_file_name(Path::new("a.cc.cpp")),
            PathBuf::from("a.cc_test.cc")
        );
    }

    #[test]
    fn test_test_file_path_is_deterministic() {
        let unit = SourceUnit {
            path: PathBuf::from("utils/utils.cpp"),
            implementation: String::new(),
            header: None,
        };
        let tests_dir = Path::new("/out/tests");
        assert_eq!(unit.test_file_path(tests_dir), unit.test_file_path(tests_dir));
        assert_eq!(
            unit.test_file_path(tests_dir),
            PathBuf::from("/out/tests/utils/utils_test.cc")
        );
    }
}
