//! Browser-adjacent handlers. Real browser automation is an external
//! collaborator; these degrade gracefully without one.

use serde_json::{json, Value};
use tokio::process::Command;

use crate::executor::HandlerContext;
use crate::result::{ActionError, ActionOutput};

use super::{opt_str_param, resolve_path, str_param};

fn target_url(ctx: &HandlerContext, params: &Value) -> Result<String, ActionError> {
    if let Some(file) = opt_str_param(params, "file") {
        let path = resolve_path(ctx, file);
        return Ok(format!("file://{}", path.display()));
    }
    Ok(str_param(params, "url")?.to_string())
}

/// Opens a URL or file with the platform opener.
pub(crate) async fn open_browser(ctx: &HandlerContext, params: &Value) -> Result<ActionOutput, ActionError> {
    let url = target_url(ctx, params)?;
    let opener = if cfg!(target_os = "macos") { "open" } else { "xdg-open" };
    let spawned = Command::new(opener).arg(&url).spawn();
    match spawned {
        Ok(_) => Ok(ActionOutput::new(
            format!("Opened browser: {url}"),
            json!({"url": url}),
        )),
        Err(e) => Err(ActionError::ExecutionFailed(format!(
            "system opener unavailable: {e}"
        ))),
    }
}

/// Fetches a URL and reports status and page title.
pub(crate) async fn navigate_url(ctx: &HandlerContext, params: &Value) -> Result<ActionOutput, ActionError> {
    let url = str_param(params, "url")?;
    let response = ctx
        .http
        .get(url)
        .send()
        .await
        .map_err(|e| ActionError::Http(e.to_string()))?;
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    let title = extract_title(&body);
    Ok(ActionOutput::new(
        format!("Navigated to: {url}\nTitle: {title}"),
        json!({"url": url, "status": status, "title": title}),
    )
    .verified(status < 400))
}

fn extract_title(body: &str) -> String {
    let lowered = body.to_lowercase();
    let Some(start) = lowered.find("<title") else {
        return String::new();
    };
    let Some(open_end) = body[start..].find('>').map(|i| start + i + 1) else {
        return String::new();
    };
    let Some(end) = lowered[open_end..].find("</title>").map(|i| open_end + i) else {
        return String::new();
    };
    body[open_end..end].trim().to_string()
}

/// Screenshot capture requires a browser runtime, which is out of process.
pub(crate) fn take_screenshot(_ctx: &HandlerContext, params: &Value) -> Result<ActionOutput, ActionError> {
    let url = str_param(params, "url")?;
    Err(ActionError::ExecutionFailed(format!(
        "screenshot capture requires a browser runtime (url: {url})"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn title_extraction_handles_attributes_and_absence() {
        assert_eq!(extract_title("<html><title lang=\"en\"> Hi </title></html>"), "Hi");
        assert_eq!(extract_title("<html><body/></html>"), "");
    }
}
