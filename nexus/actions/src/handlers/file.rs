//! Filesystem action handlers.

use std::fs;

use serde_json::{json, Value};

use crate::executor::HandlerContext;
use crate::result::{ActionError, ActionOutput};

use super::{opt_str_param, resolve_path, str_param};

/// Reads a file and returns its content as output.
pub(crate) fn read_file(ctx: &HandlerContext, params: &Value) -> Result<ActionOutput, ActionError> {
    let path = resolve_path(ctx, str_param(params, "path")?);
    if !path.exists() {
        return Err(ActionError::NotFound(format!("File not found: {}", path.display())));
    }
    let content = fs::read_to_string(&path)?;
    let lines = content.lines().count();
    Ok(ActionOutput::new(
        content.clone(),
        json!({"path": path.display().to_string(), "size": content.len(), "lines": lines}),
    ))
}

/// Writes (overwrites) a file, verifying the write by reading it back.
pub(crate) fn write_file(ctx: &HandlerContext, params: &Value) -> Result<ActionOutput, ActionError> {
    let path = resolve_path(ctx, str_param(params, "path")?);
    let content = opt_str_param(params, "content").unwrap_or_default();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(&path, content)?;
    let readable = fs::read_to_string(&path).map(|c| c == content).unwrap_or(false);
    Ok(ActionOutput::new(
        format!("Written {} bytes to {}", content.len(), path.display()),
        json!({"path": path.display().to_string(), "size": content.len()}),
    )
    .verified(readable))
}

/// Replaces the first occurrence of `old` with `new`. Fails without writing
/// when `old` is absent.
pub(crate) fn edit_file(ctx: &HandlerContext, params: &Value) -> Result<ActionOutput, ActionError> {
    let path = resolve_path(ctx, str_param(params, "path")?);
    let old = str_param(params, "old")?;
    let new = opt_str_param(params, "new").unwrap_or_default();

    let content = fs::read_to_string(&path)?;
    let Some(pos) = content.find(old) else {
        let head: String = old.chars().take(50).collect();
        return Err(ActionError::ExecutionFailed(format!(
            "String not found in file: {head}..."
        )));
    };
    let mut edited = String::with_capacity(content.len());
    edited.push_str(&content[..pos]);
    edited.push_str(new);
    edited.push_str(&content[pos + old.len()..]);
    fs::write(&path, &edited)?;

    Ok(ActionOutput::new(
        format!("Edited {}: replaced 1 occurrence", path.display()),
        json!({"path": path.display().to_string()}),
    )
    .verified(true))
}

/// Deletes a file or directory tree.
pub(crate) fn delete_file(ctx: &HandlerContext, params: &Value) -> Result<ActionOutput, ActionError> {
    let path = resolve_path(ctx, str_param(params, "path")?);
    if path.is_file() {
        fs::remove_file(&path)?;
        Ok(ActionOutput::new(
            format!("Deleted file: {}", path.display()),
            json!({"path": path.display().to_string()}),
        )
        .verified(!path.exists()))
    } else if path.is_dir() {
        fs::remove_dir_all(&path)?;
        Ok(ActionOutput::new(
            format!("Deleted directory: {}", path.display()),
            json!({"path": path.display().to_string()}),
        )
        .verified(!path.exists()))
    } else {
        Err(ActionError::NotFound(format!("Path not found: {}", path.display())))
    }
}

/// Lists directory contents.
pub(crate) fn list_directory(ctx: &HandlerContext, params: &Value) -> Result<ActionOutput, ActionError> {
    let raw = opt_str_param(params, "path").unwrap_or(".");
    let path = resolve_path(ctx, raw);
    if !path.exists() {
        return Err(ActionError::NotFound(format!(
            "Directory not found: {}",
            path.display()
        )));
    }
    let mut items = Vec::new();
    for entry in fs::read_dir(&path)?.flatten() {
        let meta = entry.metadata()?;
        items.push(json!({
            "name": entry.file_name().to_string_lossy(),
            "type": if meta.is_dir() { "dir" } else { "file" },
            "size": if meta.is_file() { meta.len() } else { 0 },
        }));
    }
    items.sort_by(|a, b| a["name"].as_str().cmp(&b["name"].as_str()));
    let output = items
        .iter()
        .map(|i| format!("{}: {}", i["type"].as_str().unwrap_or(""), i["name"].as_str().unwrap_or("")))
        .collect::<Vec<_>>()
        .join("\n");
    Ok(ActionOutput::new(
        output,
        json!({"path": path.display().to_string(), "count": items.len(), "items": items}),
    ))
}

/// Creates a directory tree.
pub(crate) fn create_directory(ctx: &HandlerContext, params: &Value) -> Result<ActionOutput, ActionError> {
    let path = resolve_path(ctx, str_param(params, "path")?);
    fs::create_dir_all(&path)?;
    Ok(ActionOutput::new(
        format!("Created directory: {}", path.display()),
        json!({"path": path.display().to_string()}),
    )
    .verified(path.is_dir()))
}
