//! Patterns: content-addressed recipe records.
//!
//! A pattern is a user-authored computation persisted as a fact whose
//! value is `{main, files, mainExport?}`. Its identity is the content
//! hash of that record with type-declaration files (`.d.ts`) filtered
//! out and the file set sorted by name, so formatting-neutral re-saves
//! land on the same id. Evaluation itself is delegated to the harness
//! that compiled the pattern; the runtime only stores, addresses, and
//! instantiates records.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::reference::{refer, Reference};

/// One source file of a pattern.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternFile {
    /// File name within the pattern.
    pub name: String,

    /// Full source text.
    pub contents: String,
}

impl PatternFile {
    /// Create a file entry.
    pub fn new(name: impl Into<String>, contents: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            contents: contents.into(),
        }
    }

    /// True for TypeScript declaration files, which carry no behaviour
    /// and are excluded from the content id.
    pub fn is_type_declaration(&self) -> bool {
        self.name.ends_with(".d.ts")
    }
}

/// A persisted recipe: entry point plus its file set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pattern {
    /// Name of the entry-point file.
    pub main: String,

    /// All files, declarations included (they ship, they just don't
    /// contribute to identity).
    pub files: Vec<PatternFile>,

    /// Optional export name within `main`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub main_export: Option<String>,
}

impl Pattern {
    /// Create a pattern from its entry point and files.
    pub fn new(main: impl Into<String>, files: Vec<PatternFile>) -> Self {
        Self {
            main: main.into(),
            files,
            main_export: None,
        }
    }

    /// Name the export to instantiate.
    pub fn with_main_export(mut self, export: impl Into<String>) -> Self {
        self.main_export = Some(export.into());
        self
    }

    /// Content id: hash of the normalised record — declaration files
    /// dropped, remaining files sorted by name.
    pub fn id(&self) -> Reference {
        let mut files: Vec<&PatternFile> = self
            .files
            .iter()
            .filter(|f| !f.is_type_declaration())
            .collect();
        files.sort_by(|a, b| a.name.cmp(&b.name));

        let normalised = serde_json::json!({
            "main": self.main,
            "files": files
                .iter()
                .map(|f| serde_json::json!({"name": f.name, "contents": f.contents}))
                .collect::<Vec<_>>(),
            "mainExport": self.main_export,
        });
        refer(&normalised)
    }

    /// The stored JSON form.
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// Parse the stored JSON form.
    pub fn from_value(value: &Value) -> Option<Self> {
        serde_json::from_value(value.clone()).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pattern() -> Pattern {
        Pattern::new(
            "main.ts",
            vec![
                PatternFile::new("main.ts", "export const f = (x) => x;"),
                PatternFile::new("util.ts", "export const id = (x) => x;"),
            ],
        )
    }

    #[test]
    fn test_id_stable_across_file_order() {
        let a = pattern();
        let mut b = pattern();
        b.files.reverse();
        assert_eq!(a.id(), b.id());
    }

    #[test]
    fn test_id_ignores_type_declarations() {
        let plain = pattern();
        let mut with_types = pattern();
        with_types
            .files
            .push(PatternFile::new("main.d.ts", "export declare const f: any;"));
        assert_eq!(plain.id(), with_types.id());
    }

    #[test]
    fn test_id_changes_with_contents() {
        let a = pattern();
        let mut b = pattern();
        b.files[0].contents.push_str(" // changed");
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_main_export_contributes_to_id() {
        let plain = pattern();
        let exported = pattern().with_main_export("sumAndFormat");
        assert_ne!(plain.id(), exported.id());
    }

    #[test]
    fn test_value_roundtrip() {
        let original = pattern().with_main_export("f");
        let value = original.to_value();
        assert!(value.get("mainExport").is_some());
        let back = Pattern::from_value(&value).unwrap();
        assert_eq!(back, original);
        assert_eq!(back.id(), original.id());
    }
}
