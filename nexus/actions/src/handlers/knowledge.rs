//! Knowledge-plane handlers: learning, querying, task creation, analysis.

use std::fs;

use regex::Regex;
use serde_json::{json, Value};

use crate::executor::HandlerContext;
use crate::result::{ActionError, ActionOutput};

use super::{opt_str_param, resolve_path, str_param};

/// Stores knowledge through the bridge, degrading to a dry note without one.
pub(crate) fn learn_knowledge(ctx: &HandlerContext, params: &Value) -> Result<ActionOutput, ActionError> {
    let content = str_param(params, "content")?;
    let source = opt_str_param(params, "source").unwrap_or("action");
    let kind = opt_str_param(params, "type").unwrap_or("general");
    let title = opt_str_param(params, "title").unwrap_or(content);
    let head: String = content.chars().take(100).collect();

    let Some(bridge) = &ctx.knowledge else {
        return Ok(ActionOutput::new(
            format!("Would learn: {head}"),
            json!({"content": content}),
        ));
    };
    let id = bridge
        .learn(source, kind, title, content, None, 0.7)
        .map_err(|e| ActionError::ExecutionFailed(e.to_string()))?;
    Ok(ActionOutput::new(
        format!("Learned: {head}"),
        json!({"id": id, "source": source}),
    )
    .verified(true))
}

/// Queries knowledge through the bridge.
pub(crate) fn query_knowledge(ctx: &HandlerContext, params: &Value) -> Result<ActionOutput, ActionError> {
    let query = str_param(params, "query")?;
    let Some(bridge) = &ctx.knowledge else {
        return Ok(ActionOutput::new(
            format!("Would query: {query}"),
            json!({"query": query}),
        ));
    };
    let results = bridge.query(query, 10);
    Ok(ActionOutput::new(
        format!("Query results for: {query}"),
        json!({"query": query, "count": results.len(), "results": results}),
    ))
}

/// Appends a task record to the tasks file.
pub(crate) fn create_task(ctx: &HandlerContext, params: &Value) -> Result<ActionOutput, ActionError> {
    let task = str_param(params, "task")?;
    let priority = opt_str_param(params, "priority").unwrap_or("MEDIUM");

    let mut tasks: Vec<Value> = fs::read(&ctx.tasks_file)
        .ok()
        .and_then(|bytes| serde_json::from_slice(&bytes).ok())
        .unwrap_or_default();
    let record = json!({
        "id": format!("task_{}", chrono::Utc::now().format("%Y%m%d%H%M%S%f")),
        "task": task,
        "priority": priority,
        "status": "pending",
        "created_at": chrono::Utc::now(),
    });
    tasks.push(record.clone());
    if let Some(parent) = ctx.tasks_file.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(&ctx.tasks_file, serde_json::to_vec_pretty(&tasks).map_err(|e| ActionError::ExecutionFailed(e.to_string()))?)?;

    Ok(ActionOutput::new(
        format!("Created task: {task}"),
        json!({"task": record}),
    )
    .verified(true))
}

/// Counts structural elements of a source file.
pub(crate) fn analyze_code(ctx: &HandlerContext, params: &Value) -> Result<ActionOutput, ActionError> {
    let path = resolve_path(ctx, str_param(params, "path")?);
    if !path.exists() {
        return Err(ActionError::NotFound(format!("File not found: {}", path.display())));
    }
    let content = fs::read_to_string(&path)?;

    let functions = count_matches(&content, r"(?m)^\s*(?:pub\s+)?(?:async\s+)?fn\s+\w+|^\s*def\s+\w+");
    let types = count_matches(&content, r"(?m)^\s*(?:pub\s+)?(?:struct|enum|trait|class)\s+\w+");
    let imports = count_matches(&content, r"(?m)^\s*(?:use\s|import\s|from\s)");
    let lines = content.lines().count();

    let analysis = json!({
        "path": path.display().to_string(),
        "lines": lines,
        "characters": content.len(),
        "functions": functions,
        "types": types,
        "imports": imports,
    });
    let output = format!(
        "Analysis of {}:\n  Lines: {lines}\n  Functions: {functions}\n  Types: {types}",
        path.display()
    );
    Ok(ActionOutput::new(output, analysis))
}

fn count_matches(content: &str, pattern: &str) -> usize {
    Regex::new(pattern).map_or(0, |re| re.find_iter(content).count())
}
