//! HTTP and search handlers.

use serde_json::{json, Map, Value};

use crate::executor::HandlerContext;
use crate::result::{ActionError, ActionOutput};

use super::str_param;

/// Response bodies are reported up to this many bytes.
const BODY_CAP: usize = 5000;

fn header_map(params: &Value) -> Map<String, Value> {
    params
        .get("headers")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default()
}

/// HTTP GET.
pub(crate) async fn http_get(ctx: &HandlerContext, params: &Value) -> Result<ActionOutput, ActionError> {
    let url = str_param(params, "url")?;
    let mut request = ctx.http.get(url);
    for (name, value) in header_map(params) {
        if let Some(value) = value.as_str() {
            request = request.header(&name, value);
        }
    }
    let response = request
        .send()
        .await
        .map_err(|e| ActionError::Http(e.to_string()))?;
    let status = response.status().as_u16();
    let body = response
        .text()
        .await
        .map_err(|e| ActionError::Http(e.to_string()))?;
    Ok(ActionOutput::new(
        shared_logging::truncate(&body, BODY_CAP),
        json!({"url": url, "status": status, "size": body.len()}),
    )
    .verified(status < 400))
}

/// HTTP POST with a JSON body.
pub(crate) async fn http_post(ctx: &HandlerContext, params: &Value) -> Result<ActionOutput, ActionError> {
    let url = str_param(params, "url")?;
    let body = params.get("data").cloned().unwrap_or_else(|| json!({}));
    let mut request = ctx.http.post(url).json(&body);
    for (name, value) in header_map(params) {
        if let Some(value) = value.as_str() {
            request = request.header(&name, value);
        }
    }
    let response = request
        .send()
        .await
        .map_err(|e| ActionError::Http(e.to_string()))?;
    let status = response.status().as_u16();
    let text = response
        .text()
        .await
        .map_err(|e| ActionError::Http(e.to_string()))?;
    Ok(ActionOutput::new(
        shared_logging::truncate(&text, BODY_CAP),
        json!({"url": url, "status": status}),
    )
    .verified(status < 400))
}

/// Web search. Without a search API credential this returns a deterministic
/// placeholder result set.
pub(crate) fn web_search(_ctx: &HandlerContext, params: &Value) -> Result<ActionOutput, ActionError> {
    let query = str_param(params, "query")?;
    let results = vec![json!({
        "title": format!("Result for: {query}"),
        "url": format!("https://example.com/search?q={query}"),
    })];
    Ok(ActionOutput::new(
        format!("Search results for: {query}"),
        json!({"query": query, "results": results}),
    ))
}
