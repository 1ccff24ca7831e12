//! Path resolution between request arguments and session workspaces
//!
//! Two directions over a generic JSON tree:
//!
//! - **Inbound** (request → subprocess): string fields named in the server's
//!   `resolve_path_fields` are rewritten to workspace-absolute paths. Bare
//!   basenames land in the workspace; absolute paths already inside the
//!   workspace pass through; everything else is rejected as an escape.
//! - **Outbound** (subprocess → response): string fields named in
//!   `file_path_fields` that point at an existing file inside the workspace
//!   get a sibling `{field}_download_url`, and text content blocks that
//!   announce the file get a visible Markdown link appended. The original
//!   path is never stripped.
//!
//! The announcement heuristic is deliberately narrow: the path string
//! verbatim, or the basename followed on the same line by the word "saved"
//! (case-insensitive). Nothing broader is matched.

use std::path::Path;

use regex::Regex;
use serde_json::Value;
use url::Url;

use crate::config::ServerSpec;
use crate::error::BridgeError;
use crate::workspace::Workspace;

/// Rewrites paths for one request/response exchange against one workspace.
pub struct PathResolver<'a> {
    workspace: &'a Workspace,
    spec: &'a ServerSpec,
    base_url: &'a Url,
}

/// A file the outbound pass decided to expose as a download.
#[derive(Debug)]
struct ExposedFile {
    /// The path string exactly as the subprocess emitted it.
    raw: String,
    basename: String,
    url: String,
}

impl<'a> PathResolver<'a> {
    pub fn new(workspace: &'a Workspace, spec: &'a ServerSpec, base_url: &'a Url) -> Self {
        Self {
            workspace,
            spec,
            base_url,
        }
    }

    /// Download URL for a basename inside this resolver's workspace:
    /// `{base_url}/files/{job_uuid}/{basename}`.
    pub fn download_url(&self, basename: &str) -> String {
        format!(
            "{}/files/{}/{}",
            self.base_url.as_str().trim_end_matches('/'),
            self.workspace.id,
            basename
        )
    }

    // -- inbound ------------------------------------------------------------

    /// Rewrite every `resolve_path_fields` string in `params` to a
    /// workspace-absolute path.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::PathEscape`] when a value is absolute but
    /// outside the workspace, or contains a `..` component.
    pub fn resolve_inbound(&self, params: &mut Value) -> Result<(), BridgeError> {
        if self.spec.resolve_path_fields.is_empty() {
            return Ok(());
        }
        self.resolve_inbound_value(params)
    }

    fn resolve_inbound_value(&self, value: &mut Value) -> Result<(), BridgeError> {
        match value {
            Value::Object(map) => {
                let mut rewrites: Vec<(String, String)> = Vec::new();
                for (key, child) in map.iter() {
                    if let Value::String(raw) = child {
                        if self.spec.resolve_path_fields.iter().any(|f| f == key) {
                            if let Some(rewritten) = self.rewrite_inbound_path(raw)? {
                                rewrites.push((key.clone(), rewritten));
                            }
                        }
                    }
                }
                for (key, rewritten) in rewrites {
                    map.insert(key, Value::String(rewritten));
                }
                for child in map.values_mut() {
                    self.resolve_inbound_value(child)?;
                }
                Ok(())
            }
            Value::Array(items) => {
                for item in items.iter_mut() {
                    self.resolve_inbound_value(item)?;
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Apply the inbound rewrite rules to one path string. Returns
    /// `Ok(None)` when the value passes through unchanged.
    fn rewrite_inbound_path(&self, raw: &str) -> Result<Option<String>, BridgeError> {
        if raw.is_empty() {
            return Ok(None);
        }
        let path = Path::new(raw);

        // Simple basename: no directory separators at all.
        if !raw.contains(std::path::MAIN_SEPARATOR) && raw != ".." {
            let resolved = self.workspace.dir.join(raw);
            return Ok(Some(resolved.to_string_lossy().into_owned()));
        }

        if path.is_absolute() && self.workspace.contains_lexically(path) {
            return Ok(None);
        }

        Err(BridgeError::PathEscape(raw.to_string()))
    }

    // -- outbound -----------------------------------------------------------

    /// Annotate `result` with download URLs and visible Markdown links for
    /// every exposed file. Fields whose paths do not name an existing file
    /// inside the workspace are left untouched.
    pub fn annotate_outbound(&self, result: &mut Value) {
        if self.spec.file_path_fields.is_empty() {
            return;
        }
        let mut exposed = Vec::new();
        self.inject_download_urls(result, &mut exposed);
        if !exposed.is_empty() {
            self.append_markdown_links(result, &exposed);
        }
    }

    fn inject_download_urls(&self, value: &mut Value, exposed: &mut Vec<ExposedFile>) {
        match value {
            Value::Object(map) => {
                let mut additions: Vec<(String, String)> = Vec::new();
                for (key, child) in map.iter() {
                    if let Value::String(raw) = child {
                        if self.spec.file_path_fields.iter().any(|f| f == key) {
                            if let Some(file) = self.expose_file(raw) {
                                additions.push((format!("{key}_download_url"), file.url.clone()));
                                exposed.push(file);
                            }
                        }
                    }
                }
                for (key, url) in additions {
                    map.insert(key, Value::String(url));
                }
                for child in map.values_mut() {
                    self.inject_download_urls(child, exposed);
                }
            }
            Value::Array(items) => {
                for item in items.iter_mut() {
                    self.inject_download_urls(item, exposed);
                }
            }
            _ => {}
        }
    }

    /// Resolve an emitted path string against the workspace and build the
    /// download record when it names a real file inside it.
    fn expose_file(&self, raw: &str) -> Option<ExposedFile> {
        if raw.is_empty() {
            return None;
        }
        let path = Path::new(raw);
        let full = if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.workspace.dir.join(path)
        };
        if !self.workspace.contains_existing(&full) {
            return None;
        }
        let basename = full.file_name()?.to_string_lossy().into_owned();
        let url = self.download_url(&basename);
        Some(ExposedFile {
            raw: raw.to_string(),
            basename,
            url,
        })
    }

    fn append_markdown_links(&self, value: &mut Value, exposed: &[ExposedFile]) {
        match value {
            Value::Object(map) => {
                let is_text_block = map.get("type").and_then(Value::as_str) == Some("text");
                if is_text_block {
                    if let Some(Value::String(text)) = map.get_mut("text") {
                        for file in exposed {
                            if announces_file(text, file) && !text.contains(&file.url) {
                                text.push_str(&format!(
                                    "\n\n📎 {}: [{}]({})",
                                    file.basename, file.basename, file.url
                                ));
                            }
                        }
                    }
                }
                for child in map.values_mut() {
                    self.append_markdown_links(child, exposed);
                }
            }
            Value::Array(items) => {
                for item in items.iter_mut() {
                    self.append_markdown_links(item, exposed);
                }
            }
            _ => {}
        }
    }
}

/// The narrow announcement heuristic: the emitted path verbatim, or the
/// basename followed on the same line by the word "saved".
fn announces_file(text: &str, file: &ExposedFile) -> bool {
    if text.contains(&file.raw) {
        return true;
    }
    let pattern = format!(
        r"(?i){}[^\n]{{0,80}}\bsaved\b",
        regex::escape(&file.basename)
    );
    Regex::new(&pattern)
        .map(|re| re.is_match(text))
        .unwrap_or(false)
}
