//! Writing clone templates to disk.

use crate::pages::external_chunks;
use aioclone_common::{Error, Result};
use aioclone_template::{Template, SHARED_PARAMETERS};
use serde_json::{json, Value};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use url::Url;

/// How the template is laid out on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TemplateMode {
    /// One self-contained file.
    #[default]
    Nested,
    /// A root file plus one sibling file per asset or asset endpoint
    /// profile chunk, referenced through `templateLink`.
    Linked,
}

impl std::str::FromStr for TemplateMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "nested" => Ok(TemplateMode::Nested),
            "linked" => Ok(TemplateMode::Linked),
            other => Err(Error::Validation(format!(
                "Unknown template mode '{}'. Expected nested or linked.",
                other
            ))),
        }
    }
}

/// Where and how to write.
#[derive(Debug, Clone)]
pub struct WriteOptions {
    pub out_dir: PathBuf,
    pub bundle_name: String,
    pub mode: TemplateMode,
    /// Linked files are referenced by `uri` under this base instead of by
    /// `relativePath`.
    pub base_uri: Option<String>,
}

/// Paths produced by [`write_template`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WrittenFiles {
    pub root: PathBuf,
    pub linked: Vec<PathBuf>,
}

impl WrittenFiles {
    pub fn all(&self) -> impl Iterator<Item = &Path> {
        std::iter::once(self.root.as_path()).chain(self.linked.iter().map(PathBuf::as_path))
    }
}

/// Write `template` under `options.out_dir` as `<bundle>.json`, plus
/// `<bundle>/<kind>_<n>.json` siblings in linked mode.
pub fn write_template(template: &Template, options: &WriteOptions) -> Result<WrittenFiles> {
    let base_uri = options
        .base_uri
        .as_deref()
        .map(|raw| {
            Url::parse(raw).map_err(|e| {
                Error::Validation(format!("Linked template base URI '{}' is invalid: {}", raw, e))
            })
        })
        .transpose()?;

    fs::create_dir_all(&options.out_dir)?;
    let root_path = options
        .out_dir
        .join(format!("{}.json", options.bundle_name));

    let written = match options.mode {
        TemplateMode::Nested => {
            write_json(&root_path, &serde_json::to_value(template)?)?;
            WrittenFiles {
                root: root_path,
                linked: Vec::new(),
            }
        }
        TemplateMode::Linked => {
            let linked_dir = options.out_dir.join(&options.bundle_name);
            let mut root = template.clone();
            let mut linked = Vec::new();

            for chunk in external_chunks(template) {
                let Some(resource) = root.resources.get_mut(&chunk.key) else {
                    continue;
                };
                let relative = format!("{}/{}", options.bundle_name, chunk.file_name());
                let link = match &base_uri {
                    Some(base) => json!({
                        "uri": format!("{}/{}", base.as_str().trim_end_matches('/'), relative)
                    }),
                    None => json!({ "relativePath": relative }),
                };

                let inner = detach_inner_template(resource, link)?;
                if linked.is_empty() {
                    fs::create_dir_all(&linked_dir)?;
                }
                let path = linked_dir.join(chunk.file_name());
                write_json(&path, &inner)?;
                debug!("Wrote linked template {}", path.display());
                linked.push(path);
            }

            write_json(&root_path, &serde_json::to_value(&root)?)?;
            WrittenFiles {
                root: root_path,
                linked,
            }
        }
    };

    info!(
        "Wrote clone template to {} ({} linked file(s))",
        written.root.display(),
        written.linked.len()
    );
    Ok(written)
}

/// Replace the inner template of a nested deployment with `link` and return
/// the template. The deployment keeps forwarding the shared parameters and
/// the returned template keeps declaring them.
fn detach_inner_template(deployment: &mut Value, link: Value) -> Result<Value> {
    let properties = deployment
        .get_mut("properties")
        .and_then(Value::as_object_mut)
        .ok_or_else(|| Error::Validation("Nested deployment has no properties.".to_string()))?;

    let mut inner = properties
        .remove("template")
        .ok_or_else(|| Error::Validation("Nested deployment has no inner template.".to_string()))?;
    properties.insert("templateLink".to_string(), link);

    let values = properties
        .entry("parameters")
        .or_insert_with(|| json!({}));
    if let Some(values) = values.as_object_mut() {
        for name in SHARED_PARAMETERS {
            values
                .entry(name.to_string())
                .or_insert_with(|| json!({ "value": format!("[parameters('{}')]", name) }));
        }
    }

    if let Some(declared) = inner.get_mut("parameters").and_then(Value::as_object_mut) {
        for name in SHARED_PARAMETERS {
            declared
                .entry(name.to_string())
                .or_insert_with(|| json!({ "type": "string" }));
        }
    }
    Ok(inner)
}

fn write_json(path: &Path, value: &Value) -> Result<()> {
    let mut content = serde_json::to_string_pretty(value)?;
    content.push('\n');
    fs::write(path, content)?;
    Ok(())
}
