//! Action handler implementations, grouped by category.

/// Browser-adjacent handlers.
pub mod browser;
/// Code and script execution handlers.
pub mod code;
/// Filesystem handlers.
pub mod file;
/// HTTP and search handlers.
pub mod http;
/// Knowledge-plane handlers.
pub mod knowledge;
/// System tooling handlers.
pub mod system;

use std::path::PathBuf;

use serde_json::Value;

use crate::executor::HandlerContext;
use crate::kind::ActionKind;
use crate::result::{ActionError, ActionOutput};

/// Routes one action to its handler. Policy checks have already run.
pub(crate) async fn dispatch(
    ctx: &HandlerContext,
    kind: ActionKind,
    params: &Value,
) -> Result<ActionOutput, ActionError> {
    match kind {
        ActionKind::ReadFile => file::read_file(ctx, params),
        ActionKind::WriteFile => file::write_file(ctx, params),
        ActionKind::EditFile => file::edit_file(ctx, params),
        ActionKind::DeleteFile => file::delete_file(ctx, params),
        ActionKind::ListDirectory => file::list_directory(ctx, params),
        ActionKind::CreateDirectory => file::create_directory(ctx, params),
        ActionKind::RunPython => code::run_python(ctx, params).await,
        ActionKind::RunShell => code::run_shell(ctx, params).await,
        ActionKind::RunScript => code::run_script(ctx, params).await,
        ActionKind::OpenBrowser => browser::open_browser(ctx, params).await,
        ActionKind::NavigateUrl => browser::navigate_url(ctx, params).await,
        ActionKind::TakeScreenshot => browser::take_screenshot(ctx, params),
        ActionKind::HttpGet => http::http_get(ctx, params).await,
        ActionKind::HttpPost => http::http_post(ctx, params).await,
        ActionKind::WebSearch => http::web_search(ctx, params),
        ActionKind::InstallPackage => system::install_package(ctx, params).await,
        ActionKind::RunTests => system::run_tests(ctx, params).await,
        ActionKind::GitStatus => system::git_status(ctx, params).await,
        ActionKind::GitCommit => system::git_commit(ctx, params).await,
        ActionKind::LearnKnowledge => knowledge::learn_knowledge(ctx, params),
        ActionKind::QueryKnowledge => knowledge::query_knowledge(ctx, params),
        ActionKind::CreateTask => knowledge::create_task(ctx, params),
        ActionKind::AnalyzeCode => knowledge::analyze_code(ctx, params),
    }
}

/// Fetches a required string parameter.
pub(crate) fn str_param<'a>(params: &'a Value, name: &'static str) -> Result<&'a str, ActionError> {
    params
        .get(name)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .ok_or(ActionError::MissingParam(name))
}

/// Fetches an optional string parameter.
pub(crate) fn opt_str_param<'a>(params: &'a Value, name: &str) -> Option<&'a str> {
    params.get(name).and_then(Value::as_str)
}

/// Resolves a possibly-relative path against the project root.
pub(crate) fn resolve_path(ctx: &HandlerContext, raw: &str) -> PathBuf {
    let path = PathBuf::from(raw);
    if path.is_absolute() {
        path
    } else {
        ctx.project_root.join(path)
    }
}
