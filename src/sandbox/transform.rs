//! Source transforms applied to guest code before it is compiled.
//!
//! Transforms run in two places: once over the whole mounted tree when a
//! runtime is created (so failures surface before any guest code runs), and
//! per module as the loader reads sources. Both paths must produce the same
//! output, and transforming already-transformed source is a no-op.

use std::fmt;

use tracing::debug;

use crate::vfs::{path, OpenFlags, Volume};

/// Extensions treated as guest source.
pub const SOURCE_EXTENSIONS: &[&str] = &["js", "mjs", "cjs", "ts", "mts"];

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("failed to transform {filename}: {message}")]
pub struct TransformError {
    pub filename: String,
    pub message: String,
}

/// Rewrites guest source text.
pub trait SourceTransform: Send + Sync + fmt::Debug {
    /// Stable identifier, used as part of the transform cache key.
    fn id(&self) -> &str;

    fn handles(&self, filename: &str) -> bool {
        path::extension(filename).is_some_and(|ext| SOURCE_EXTENSIONS.contains(&ext))
    }

    fn transform_file(&self, filename: &str, source: &str) -> Result<String, TransformError>;

    /// Transform every source file in `volume` in place. Returns how many
    /// files changed.
    fn transform_tree(&self, volume: &Volume) -> Result<usize, TransformError> {
        let mut changed = 0;
        for file in volume.files() {
            if !self.handles(&file) {
                continue;
            }
            let source = volume.read_to_string(&file).map_err(|e| TransformError {
                filename: file.clone(),
                message: e.to_string(),
            })?;
            let output = self.transform_file(&file, &source)?;
            if output != source {
                volume
                    .write_file(&file, output.as_bytes(), OpenFlags::WRITE, 0o666)
                    .map_err(|e| TransformError {
                        filename: file.clone(),
                        message: e.to_string(),
                    })?;
                changed += 1;
            }
        }
        debug!(transform = self.id(), changed, "transformed source tree");
        Ok(changed)
    }
}

/// Leaves sources untouched.
#[derive(Debug, Default, Clone, Copy)]
pub struct Passthrough;

impl SourceTransform for Passthrough {
    fn id(&self) -> &str {
        "passthrough"
    }

    fn transform_file(&self, _filename: &str, source: &str) -> Result<String, TransformError> {
        Ok(source.to_string())
    }

    fn transform_tree(&self, _volume: &Volume) -> Result<usize, TransformError> {
        Ok(0)
    }
}

/// Strips a byte-order mark, normalizes line endings, and blanks out
/// type-only `import type` / `export type { .. }` statements.
///
/// Removed lines are replaced by empty lines so stack traces keep their line
/// numbers.
#[derive(Debug, Default, Clone, Copy)]
pub struct StripTypeImports;

impl StripTypeImports {
    fn starts_type_statement(line: &str) -> bool {
        let trimmed = line.trim_start();
        trimmed.starts_with("import type ")
            || trimmed.starts_with("import type{")
            || trimmed.starts_with("export type {")
            || trimmed.starts_with("export type{")
            || trimmed.starts_with("export type *")
    }

    fn ends_statement(line: &str, needs_from: bool) -> bool {
        let trimmed = line.trim_end();
        let has_from = trimmed.contains(" from ") || trimmed.contains("}from ");
        if needs_from {
            has_from
                && (trimmed.ends_with(';') || trimmed.ends_with('\'') || trimmed.ends_with('"'))
        } else {
            trimmed.ends_with(';') || trimmed.ends_with('}') || has_from
        }
    }
}

impl SourceTransform for StripTypeImports {
    fn id(&self) -> &str {
        "strip-type-imports"
    }

    fn transform_file(&self, filename: &str, source: &str) -> Result<String, TransformError> {
        let source = source.strip_prefix('\u{feff}').unwrap_or(source);
        let source = source.replace("\r\n", "\n");

        let mut output = Vec::new();
        let mut open: Option<(usize, bool)> = None;
        for (idx, line) in source.split('\n').enumerate() {
            if let Some((_, needs_from)) = open {
                if Self::ends_statement(line, needs_from) {
                    open = None;
                }
                output.push("");
                continue;
            }
            if Self::starts_type_statement(line) {
                let needs_from = line.trim_start().starts_with("import");
                if !Self::ends_statement(line, needs_from) {
                    open = Some((idx + 1, needs_from));
                }
                output.push("");
                continue;
            }
            output.push(line);
        }

        if let Some((line, _)) = open {
            return Err(TransformError {
                filename: filename.to_string(),
                message: format!("unterminated type-only statement starting at line {line}"),
            });
        }
        Ok(output.join("\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_strips_type_only_statements() {
        let source = "\u{feff}import type { A } from './a';\r\nimport { b } from './b';\r\nexport type { A };\r\nexport default b;\r\n";
        let output = StripTypeImports.transform_file("/src/index.ts", source).unwrap();
        assert_eq!(output, "\nimport { b } from './b';\n\nexport default b;\n");
    }

    #[test]
    fn test_multiline_import_keeps_line_numbers() {
        let source = "import type {\n  A,\n  B,\n} from './types';\nexport default 1;";
        let output = StripTypeImports.transform_file("/src/a.ts", source).unwrap();
        assert_eq!(output, "\n\n\n\nexport default 1;");
    }

    #[test]
    fn test_is_idempotent() {
        let source = "import type { A } from './a';\nexport const x = 1;\n";
        let once = StripTypeImports.transform_file("/a.ts", source).unwrap();
        let twice = StripTypeImports.transform_file("/a.ts", &once).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn test_unterminated_statement_fails() {
        let err = StripTypeImports
            .transform_file("/src/bad.ts", "import type {\n  A,\n")
            .unwrap_err();
        assert_eq!(err.filename, "/src/bad.ts");
        assert!(err.message.contains("line 1"));
    }

    #[test]
    fn test_transform_tree_rewrites_sources_only() {
        let volume = Volume::from_tree(&json!({
            "src": {
                "index.ts": "import type { T } from './t';\nexport default 1;",
                "data.json": "import type { nope }",
                "plain.js": "export default 2;"
            }
        }))
        .unwrap();
        assert_eq!(StripTypeImports.transform_tree(&volume).unwrap(), 1);
        assert_eq!(
            volume.read_to_string("/src/index.ts").unwrap(),
            "\nexport default 1;"
        );
        assert_eq!(
            volume.read_to_string("/src/data.json").unwrap(),
            "import type { nope }"
        );
        assert_eq!(StripTypeImports.transform_tree(&volume).unwrap(), 0);
    }

    #[test]
    fn test_handles() {
        assert!(Passthrough.handles("/src/a.ts"));
        assert!(!Passthrough.handles("/src/a.json"));
        assert!(!Passthrough.handles("/src/Makefile"));
    }
}
