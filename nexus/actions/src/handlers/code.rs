//! Code and script execution handlers.

use std::process::Stdio;

use serde_json::{json, Value};
use tokio::process::Command;

use crate::executor::HandlerContext;
use crate::result::{ActionError, ActionOutput};

use super::{opt_str_param, resolve_path, str_param};

/// Marker line prefix carrying the structured `result` value out of a Python
/// subprocess. The epilogue below prints it as the final stdout line; output
/// missing the marker degrades to plain stdout capture.
pub const RESULT_MARKER: &str = "__NEXUS_RESULT__:";

fn python_envelope(code: &str) -> String {
    format!(
        "{code}\n\n\
         import json as __nexus_json\n\
         import sys as __nexus_sys\n\
         __nexus_value = globals().get('result', 'Executed')\n\
         try:\n\
         \x20   __nexus_sys.stdout.write('\\n{RESULT_MARKER}' + __nexus_json.dumps(__nexus_value, default=str))\n\
         except Exception:\n\
         \x20   __nexus_sys.stdout.write('\\n{RESULT_MARKER}' + __nexus_json.dumps(str(__nexus_value)))\n"
    )
}

/// Executes Python code in a subprocess, recovering `result` via the marker
/// envelope.
pub(crate) async fn run_python(ctx: &HandlerContext, params: &Value) -> Result<ActionOutput, ActionError> {
    let code = if let Some(file) = opt_str_param(params, "file") {
        let path = resolve_path(ctx, file);
        std::fs::read_to_string(&path)?
    } else {
        str_param(params, "code")?.to_string()
    };

    let output = Command::new("python3")
        .arg("-c")
        .arg(python_envelope(&code))
        .current_dir(&ctx.project_root)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| ActionError::ExecutionFailed(format!("python3 unavailable: {e}")))?;

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    if !output.status.success() {
        let detail = if stderr.trim().is_empty() {
            format!("Python exited with {}", output.status)
        } else {
            stderr.trim().to_string()
        };
        return Err(ActionError::ExecutionFailed(detail));
    }

    let (plain, result_value) = split_result_marker(&stdout);
    Ok(ActionOutput::new(
        plain,
        json!({"result": result_value}),
    ))
}

fn split_result_marker(stdout: &str) -> (String, Value) {
    stdout.rfind(RESULT_MARKER).map_or_else(
        || (stdout.to_string(), Value::String("Executed".into())),
        |pos| {
            let payload = stdout[pos + RESULT_MARKER.len()..].trim();
            let value = serde_json::from_str(payload)
                .unwrap_or_else(|_| Value::String(payload.to_string()));
            (stdout[..pos].trim_end().to_string(), value)
        },
    )
}

/// Executes a shell command. The command has already passed the policy gate.
pub(crate) async fn run_shell(ctx: &HandlerContext, params: &Value) -> Result<ActionOutput, ActionError> {
    let command = str_param(params, "command")?;
    let cwd = opt_str_param(params, "cwd")
        .map_or_else(|| ctx.project_root.clone(), |c| resolve_path(ctx, c));

    let output = Command::new("sh")
        .arg("-c")
        .arg(command)
        .current_dir(cwd)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await?;

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    let code = output.status.code().unwrap_or(-1);
    if !output.status.success() {
        return Err(ActionError::ExecutionFailed(format!("Command failed: {}", stderr.trim())));
    }
    Ok(ActionOutput::new(
        stdout,
        json!({"return_code": code, "command": command}),
    ))
}

/// Runs a script file, choosing the interpreter by extension.
pub(crate) async fn run_script(ctx: &HandlerContext, params: &Value) -> Result<ActionOutput, ActionError> {
    let path = resolve_path(ctx, str_param(params, "path")?);
    if !path.exists() {
        return Err(ActionError::NotFound(format!("Script not found: {}", path.display())));
    }
    let args: Vec<String> = params
        .get("args")
        .and_then(Value::as_array)
        .map(|a| {
            a.iter()
                .filter_map(Value::as_str)
                .map(String::from)
                .collect()
        })
        .unwrap_or_default();

    let interpreter = match path.extension().and_then(|e| e.to_str()) {
        Some("py") => "python3",
        Some("js") => "node",
        _ => "bash",
    };

    let output = Command::new(interpreter)
        .arg(&path)
        .args(&args)
        .current_dir(&ctx.project_root)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| ActionError::ExecutionFailed(format!("{interpreter} unavailable: {e}")))?;

    Ok(ActionOutput::new(
        String::from_utf8_lossy(&output.stdout).to_string(),
        json!({
            "return_code": output.status.code().unwrap_or(-1),
            "stderr": String::from_utf8_lossy(&output.stderr),
        }),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn marker_splits_structured_result() {
        let stdout = format!("42\n{RESULT_MARKER}{}", "{\"answer\": 42}");
        let (plain, value) = split_result_marker(&stdout);
        assert_eq!(plain, "42");
        assert_eq!(value["answer"], 42);
    }

    #[test]
    fn missing_marker_degrades_to_plain_output() {
        let (plain, value) = split_result_marker("hello\n");
        assert_eq!(plain, "hello\n");
        assert_eq!(value, Value::String("Executed".into()));
    }
}
