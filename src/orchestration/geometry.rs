//! Geometry parameter overrides on a copied detector tree.
//!
//! The detector description is treated as opaque text apart from the
//! `<constant name=".." value=".."/>` tags a variant rewrites. Either quote
//! style is accepted. Tags inside `<!-- -->` comments are left as written.

use regex::{Captures, Regex};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;
use std::sync::LazyLock;
use walkdir::WalkDir;

use crate::error::{Error, Result};
use crate::plog_trace;

/// Placeholders replaced by the root of the copied tree.
const DETECTOR_PATH_PLACEHOLDERS: [&str; 2] = ["${DETECTOR_PATH}", "{DETECTOR_PATH}"];

/// Applies named parameter overrides to a detector tree in place.
pub trait GeometryMutator: Send + Sync {
    /// Rewrite the tree rooted at `root` so every parameter in `params`
    /// takes its new value.
    ///
    /// # Errors
    ///
    /// Returns an error if the tree cannot be read or written, or if a
    /// parameter matches nothing in the tree.
    fn apply_overrides(&self, root: &Path, params: &BTreeMap<String, f64>) -> Result<()>;
}

/// A whole comment or one `<constant>` tag. A tag inside a comment is
/// consumed with the comment and never rewritten.
static CONSTANT_TAG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<!--.*?-->|<constant\b[^>]*>").unwrap());
static NAME_ATTR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"\bname\s*=\s*(?:"([^"]*)"|'([^']*)')"#).unwrap());
static VALUE_ATTR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"\bvalue\s*=\s*(?:"[^"]*"|'[^']*')"#).unwrap());

/// Default mutator: rewrites `<constant>` values in every `.xml` file and
/// points `{DETECTOR_PATH}` references at the copy.
#[derive(Debug, Clone)]
pub struct XmlConstantMutator {
    unit: String,
}

impl XmlConstantMutator {
    pub fn new(unit: &str) -> Self {
        Self {
            unit: unit.to_string(),
        }
    }

    fn format_value(&self, value: f64) -> String {
        if self.unit.is_empty() {
            format!("{:?}", value)
        } else {
            format!("{:?}*{}", value, self.unit)
        }
    }

    /// Rewrite one document. Returns the new text and the parameter names
    /// that matched a constant.
    pub fn rewrite(
        &self,
        text: &str,
        root: &Path,
        params: &BTreeMap<String, f64>,
    ) -> (String, BTreeSet<String>) {
        let mut matched = BTreeSet::new();
        let rewritten = CONSTANT_TAG_RE.replace_all(text, |caps: &Captures| {
            let tag = &caps[0];
            if tag.starts_with("<!--") {
                return tag.to_string();
            }
            let Some(name) = NAME_ATTR_RE
                .captures(tag)
                .and_then(|c| c.get(1).or_else(|| c.get(2)))
                .map(|m| m.as_str().to_string())
            else {
                return tag.to_string();
            };
            match params.get(&name) {
                Some(&value) if VALUE_ATTR_RE.is_match(tag) => {
                    let replacement = format!("value=\"{}\"", self.format_value(value));
                    matched.insert(name);
                    VALUE_ATTR_RE
                        .replace(tag, regex::NoExpand(&replacement))
                        .into_owned()
                }
                _ => tag.to_string(),
            }
        });

        let root = root.to_string_lossy();
        let mut out = rewritten.into_owned();
        for placeholder in DETECTOR_PATH_PLACEHOLDERS {
            if out.contains(placeholder) {
                out = out.replace(placeholder, &root);
            }
        }
        (out, matched)
    }
}

impl GeometryMutator for XmlConstantMutator {
    fn apply_overrides(&self, root: &Path, params: &BTreeMap<String, f64>) -> Result<()> {
        let mut matched = BTreeSet::new();

        for entry in WalkDir::new(root).follow_links(false) {
            let entry = entry?;
            let path = entry.path();
            if !entry.file_type().is_file()
                || path.extension().and_then(|e| e.to_str()) != Some("xml")
            {
                continue;
            }

            let text = fs::read_to_string(path)?;
            let (rewritten, hits) = self.rewrite(&text, root, params);
            if rewritten != text {
                plog_trace!("Rewrote {} ({} constants)", path.display(), hits.len());
                fs::write(path, rewritten)?;
            }
            matched.extend(hits);
        }

        let missing: Vec<&str> = params
            .keys()
            .filter(|name| !matched.contains(*name))
            .map(String::as_str)
            .collect();
        if !missing.is_empty() {
            return Err(Error::Validation(format!(
                "no <constant> named {} under {}",
                missing.join(", "),
                root.display()
            )));
        }
        Ok(())
    }
}
