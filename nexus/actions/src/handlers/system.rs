//! System tooling handlers: packages, tests, git.

use std::process::Stdio;

use serde_json::{json, Value};
use tokio::process::Command;

use crate::executor::HandlerContext;
use crate::result::{ActionError, ActionOutput};

use super::{opt_str_param, str_param};

async fn run_in_root(ctx: &HandlerContext, program: &str, args: &[&str]) -> Result<std::process::Output, ActionError> {
    Command::new(program)
        .args(args)
        .current_dir(&ctx.project_root)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| ActionError::ExecutionFailed(format!("{program} unavailable: {e}")))
}

/// Installs a package via pip or npm.
pub(crate) async fn install_package(ctx: &HandlerContext, params: &Value) -> Result<ActionOutput, ActionError> {
    let package = str_param(params, "package")?;
    let manager = opt_str_param(params, "manager").unwrap_or("pip");
    let (program, args): (&str, Vec<&str>) = match manager {
        "pip" => ("pip", vec!["install", package]),
        "npm" => ("npm", vec!["install", package]),
        other => {
            return Err(ActionError::InvalidParam(format!(
                "Unknown package manager: {other}"
            )))
        }
    };
    let output = run_in_root(ctx, program, &args).await?;
    Ok(ActionOutput::new(
        String::from_utf8_lossy(&output.stdout).to_string(),
        json!({
            "package": package,
            "manager": manager,
            "success": output.status.success(),
        }),
    )
    .verified(output.status.success()))
}

/// Runs a test suite (pytest by default, unittest otherwise).
pub(crate) async fn run_tests(ctx: &HandlerContext, params: &Value) -> Result<ActionOutput, ActionError> {
    let path = opt_str_param(params, "path").unwrap_or("tests/");
    let framework = opt_str_param(params, "framework").unwrap_or("pytest");
    let args: Vec<&str> = if framework == "pytest" {
        vec!["-m", "pytest", path, "-v"]
    } else {
        vec!["-m", "unittest", "discover", path]
    };
    let output = run_in_root(ctx, "python3", &args).await?;
    Ok(ActionOutput::new(
        String::from_utf8_lossy(&output.stdout).to_string(),
        json!({
            "return_code": output.status.code().unwrap_or(-1),
            "stderr": String::from_utf8_lossy(&output.stderr),
        }),
    )
    .verified(output.status.success()))
}

/// `git status --short` in the project root.
pub(crate) async fn git_status(ctx: &HandlerContext, _params: &Value) -> Result<ActionOutput, ActionError> {
    let output = run_in_root(ctx, "git", &["status", "--short"]).await?;
    Ok(ActionOutput::new(
        String::from_utf8_lossy(&output.stdout).to_string(),
        json!({"return_code": output.status.code().unwrap_or(-1)}),
    ))
}

/// `git add` the given files then commit with the given message.
pub(crate) async fn git_commit(ctx: &HandlerContext, params: &Value) -> Result<ActionOutput, ActionError> {
    let message = opt_str_param(params, "message")
        .map_or_else(|| format!("Auto-commit by NEXUS at {}", chrono::Utc::now().to_rfc3339()), String::from);
    let files: Vec<String> = params
        .get("files")
        .and_then(Value::as_array)
        .map(|a| a.iter().filter_map(Value::as_str).map(String::from).collect())
        .unwrap_or_else(|| vec![".".into()]);

    let mut add_args = vec!["add".to_string()];
    add_args.extend(files.iter().cloned());
    let add_refs: Vec<&str> = add_args.iter().map(String::as_str).collect();
    run_in_root(ctx, "git", &add_refs).await?;

    let output = run_in_root(ctx, "git", &["commit", "-m", &message]).await?;
    Ok(ActionOutput::new(
        String::from_utf8_lossy(&output.stdout).to_string(),
        json!({"message": message, "success": output.status.success()}),
    )
    .verified(output.status.success()))
}
