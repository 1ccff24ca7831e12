//! Tool-list enrichment with the synthetic usage-guide tool
//!
//! Servers may carry a free-form `usage_guide` in the catalog. Any response
//! whose `result` is tools-shaped (carries a `tools` array) gets one
//! synthetic documentation tool appended; invoking that tool is answered
//! locally by the dispatcher and never reaches the subprocess.

use serde_json::{json, Value};

use crate::rpc::{JsonRpcRequest, METHOD_TOOLS_CALL};

/// Fixed, visually distinctive identifier of the synthetic tool.
pub const USAGE_TOOL_NAME: &str = "📖_usage_instructions";

/// Append the synthetic usage-guide tool to a tools-shaped result.
///
/// Returns true when the result carried a `tools` array (and was
/// therefore enriched); false leaves the value untouched.
pub fn enrich_tools_result(result: &mut Value, guide: &str) -> bool {
    let Some(tools) = result.get_mut("tools").and_then(Value::as_array_mut) else {
        return false;
    };
    tools.push(json!({
        "name": USAGE_TOOL_NAME,
        "description": guide,
        "inputSchema": { "type": "object", "properties": {} }
    }));
    true
}

/// True when the request invokes the synthetic usage-guide tool.
pub fn is_usage_tool_call(request: &JsonRpcRequest) -> bool {
    request.method == METHOD_TOOLS_CALL
        && request
            .params
            .as_ref()
            .and_then(|p| p.get("name"))
            .and_then(Value::as_str)
            == Some(USAGE_TOOL_NAME)
}

/// The locally produced `tools/call` result carrying the guide text.
pub fn usage_guide_result(guide: &str) -> Value {
    json!({
        "content": [{ "type": "text", "text": guide }],
        "isError": false
    })
}
