//! OpenAI-compatible Chat Completions wire format.
//!
//! The helpers here capture the logic shared by every provider that exposes
//! an OpenAI-compatible HTTP surface (OpenAI, Anthropic, Google Gemini, and
//! xAI all do). A provider client supplies a base URL, an API key, and a
//! model id; [`send_chat_request`] handles serialisation, classification of
//! HTTP failures into the crate error taxonomy, token accounting, and
//! extraction of native tool calls.
//!
//! # Message serialisation
//!
//! | [`Role`] variant | Wire representation |
//! |---|---|
//! | `System` | `{"role":"system","content":"..."}` |
//! | `User` | `{"role":"user","content":"..."}` |
//! | `Assistant` with tool_calls | `{"role":"assistant","content":null,"tool_calls":[...]}` |
//! | `Assistant` without tool_calls | `{"role":"assistant","content":"..."}` |
//! | `Tool { call_id }` | `{"role":"tool","tool_call_id":"<id>","content":"..."}` |
//!
//! An assistant message that carries tool calls always serialises its content
//! as JSON `null` — several providers reject the combination of a non-empty
//! content string and a `tool_calls` array on replayed history.

use crate::agentmesh::error::{ErrorKind, MeshError};
use crate::agentmesh::llm::{
    GenerateOptions, LlmResponse, Message, NativeToolCall, Role, StopReason, TokenUsage,
    ToolChoice, ToolDefinition,
};

/// Serialise a [`Message`] slice into the OpenAI wire form.
pub fn messages_to_wire(messages: &[Message]) -> Vec<serde_json::Value> {
    messages
        .iter()
        .map(|msg| match &msg.role {
            Role::System => serde_json::json!({
                "role": "system",
                "content": msg.content.as_ref()
            }),
            Role::User => serde_json::json!({
                "role": "user",
                "content": msg.content.as_ref()
            }),
            Role::Assistant => {
                if msg.tool_calls.is_empty() {
                    serde_json::json!({
                        "role": "assistant",
                        "content": msg.content.as_ref()
                    })
                } else {
                    let tool_calls: Vec<serde_json::Value> = msg
                        .tool_calls
                        .iter()
                        .map(|tc| {
                            serde_json::json!({
                                "id": tc.id,
                                "type": "function",
                                "function": {
                                    "name": tc.name,
                                    "arguments": serde_json::to_string(&tc.arguments)
                                        .unwrap_or_else(|_| "{}".to_string())
                                }
                            })
                        })
                        .collect();
                    serde_json::json!({
                        "role": "assistant",
                        "content": serde_json::Value::Null,
                        "tool_calls": tool_calls
                    })
                }
            }
            Role::Tool { call_id } => serde_json::json!({
                "role": "tool",
                "tool_call_id": call_id,
                "content": msg.content.as_ref()
            }),
        })
        .collect()
}

/// Serialise [`ToolDefinition`]s into the OpenAI `tools` array.
pub fn tools_to_wire(tools: &[ToolDefinition]) -> Vec<serde_json::Value> {
    tools
        .iter()
        .map(|t| {
            serde_json::json!({
                "type": "function",
                "function": {
                    "name": t.name,
                    "description": t.description,
                    "parameters": t.parameters_schema
                }
            })
        })
        .collect()
}

fn tool_choice_to_wire(choice: &ToolChoice) -> serde_json::Value {
    match choice {
        ToolChoice::Auto => serde_json::json!("auto"),
        ToolChoice::None => serde_json::json!("none"),
        ToolChoice::Required(name) => serde_json::json!({
            "type": "function",
            "function": { "name": name }
        }),
    }
}

/// Classify a provider error body, looking past the HTTP status where the
/// body names a more specific condition.
fn classify_error(status: u16, body: &str) -> ErrorKind {
    let kind = ErrorKind::from_http_status(status);
    if kind != ErrorKind::Unknown {
        // 400s about context length come back as generic bad-request codes;
        // the body is the only signal.
        return kind;
    }
    let lowered = body.to_lowercase();
    if lowered.contains("context_length") || lowered.contains("maximum context length") {
        ErrorKind::ContextLength
    } else if lowered.contains("rate limit") {
        ErrorKind::RateLimit
    } else {
        ErrorKind::Unknown
    }
}

/// Call the OpenAI-compatible Chat Completions endpoint.
///
/// Posts to `{base_url}/chat/completions` with an
/// `Authorization: Bearer {api_key}` header. The response is parsed into a
/// normalized [`LlmResponse`]; HTTP failures are classified via
/// [`ErrorKind::from_http_status`] plus a body sniff for context-length
/// rejections.
pub async fn send_chat_request(
    base_url: &str,
    api_key: &str,
    model: &str,
    messages: &[Message],
    tools: Option<&[ToolDefinition]>,
    options: &GenerateOptions,
    http_client: &reqwest::Client,
) -> Result<LlmResponse, MeshError> {
    let mut body = serde_json::json!({
        "model": model,
        "messages": messages_to_wire(messages),
    });

    if let Some(tools) = tools {
        if !tools.is_empty() {
            body["tools"] = serde_json::Value::Array(tools_to_wire(tools));
        }
    }
    if let Some(choice) = &options.tool_choice {
        body["tool_choice"] = tool_choice_to_wire(choice);
    }
    if options.json_mode {
        body["response_format"] = serde_json::json!({ "type": "json_object" });
    }
    if let Some(temperature) = options.temperature {
        body["temperature"] = serde_json::json!(temperature);
    }

    let url = format!("{}/chat/completions", base_url.trim_end_matches('/'));

    let resp = http_client
        .post(&url)
        .header("Authorization", format!("Bearer {}", api_key))
        .header("Content-Type", "application/json")
        .json(&body)
        .send()
        .await
        .map_err(|e| MeshError::with_source(ErrorKind::ServerError, "request failed", e))?;

    let status = resp.status().as_u16();
    let text = resp
        .text()
        .await
        .map_err(|e| MeshError::with_source(ErrorKind::ServerError, "body read failed", e))?;

    if !(200..300).contains(&status) {
        let kind = classify_error(status, &text);
        if log::log_enabled!(log::Level::Error) {
            log::error!("send_chat_request: HTTP {} from {}: {}", status, url, text);
        }
        return Err(MeshError::new(
            kind,
            format!("HTTP {} from {}", status, url),
        ));
    }

    let parsed: serde_json::Value = serde_json::from_str(&text)?;
    parse_chat_response(&parsed, model)
}

/// Parse a Chat Completions response body into an [`LlmResponse`].
pub fn parse_chat_response(
    parsed: &serde_json::Value,
    model: &str,
) -> Result<LlmResponse, MeshError> {
    let usage = parsed.get("usage").map(|usage_obj| {
        let input = usage_obj
            .get("prompt_tokens")
            .and_then(|v| v.as_u64())
            .unwrap_or(0) as usize;
        let output = usage_obj
            .get("completion_tokens")
            .and_then(|v| v.as_u64())
            .unwrap_or(0) as usize;
        let reasoning = usage_obj
            .get("completion_tokens_details")
            .and_then(|d| d.get("reasoning_tokens"))
            .and_then(|v| v.as_u64())
            .map(|v| v as usize);
        TokenUsage {
            input_tokens: input,
            output_tokens: output,
            total_tokens: input + output,
            reasoning_tokens: reasoning,
        }
    });

    let choice = parsed
        .get("choices")
        .and_then(|c| c.get(0))
        .ok_or_else(|| MeshError::new(ErrorKind::ProtocolError, "no choices in response"))?;

    let choice_msg = choice
        .get("message")
        .ok_or_else(|| MeshError::new(ErrorKind::ProtocolError, "choice without message"))?;

    let content = choice_msg
        .get("content")
        .and_then(|c| c.as_str())
        .unwrap_or("");

    let tool_calls: Vec<NativeToolCall> = choice_msg
        .get("tool_calls")
        .and_then(|tc| tc.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|tc| {
                    let id = tc.get("id")?.as_str()?.to_string();
                    let func = tc.get("function")?;
                    let name = func.get("name")?.as_str()?.to_string();
                    let args_str = func.get("arguments").and_then(|a| a.as_str()).unwrap_or("{}");
                    let arguments: serde_json::Value = serde_json::from_str(args_str)
                        .unwrap_or(serde_json::Value::Object(serde_json::Map::new()));
                    Some(NativeToolCall {
                        id,
                        name,
                        arguments,
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    let stop_reason = match choice.get("finish_reason").and_then(|f| f.as_str()) {
        Some("stop") => StopReason::EndTurn,
        Some("tool_calls") => StopReason::ToolUse,
        Some("length") => StopReason::Length,
        Some(other) => StopReason::Other(other.to_string()),
        None if !tool_calls.is_empty() => StopReason::ToolUse,
        None => StopReason::EndTurn,
    };

    Ok(LlmResponse {
        message: Message::assistant_with_tool_calls(content, tool_calls),
        stop_reason,
        usage,
        model: parsed
            .get("model")
            .and_then(|m| m.as_str())
            .unwrap_or(model)
            .to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agentmesh::llm::Message;

    #[test]
    fn test_assistant_with_tool_calls_serialises_null_content() {
        let msg = Message::assistant_with_tool_calls(
            "thinking out loud",
            vec![NativeToolCall {
                id: "call_1".to_string(),
                name: "echo/say".to_string(),
                arguments: serde_json::json!({"text": "hi"}),
            }],
        );
        let wire = messages_to_wire(&[msg]);
        assert!(wire[0]["content"].is_null());
        assert_eq!(wire[0]["tool_calls"][0]["id"], "call_1");
        assert_eq!(
            wire[0]["tool_calls"][0]["function"]["arguments"],
            "{\"text\":\"hi\"}"
        );
    }

    #[test]
    fn test_tool_message_keyed_by_call_id() {
        let wire = messages_to_wire(&[Message::tool_response("call_9", "ok")]);
        assert_eq!(wire[0]["role"], "tool");
        assert_eq!(wire[0]["tool_call_id"], "call_9");
        assert_eq!(wire[0]["content"], "ok");
    }

    #[test]
    fn test_parse_response_with_tool_calls() {
        let body = serde_json::json!({
            "model": "gpt-4.1",
            "choices": [{
                "finish_reason": "tool_calls",
                "message": {
                    "role": "assistant",
                    "content": null,
                    "tool_calls": [{
                        "id": "call_1",
                        "type": "function",
                        "function": {"name": "echo/say", "arguments": "{\"text\":\"hi\"}"}
                    }]
                }
            }],
            "usage": {"prompt_tokens": 12, "completion_tokens": 3}
        });
        let response = parse_chat_response(&body, "gpt-4.1").unwrap();
        assert_eq!(response.stop_reason, StopReason::ToolUse);
        assert_eq!(response.message.tool_calls.len(), 1);
        assert_eq!(response.message.tool_calls[0].name, "echo/say");
        assert_eq!(response.usage.as_ref().unwrap().total_tokens, 15);
    }

    #[test]
    fn test_classify_context_length_from_body() {
        let kind = classify_error(400, "This model's maximum context length is 128000 tokens");
        assert_eq!(kind, ErrorKind::ContextLength);
    }

    #[test]
    fn test_parse_response_without_choices_is_protocol_error() {
        let body = serde_json::json!({"usage": {}});
        let err = parse_chat_response(&body, "m").unwrap_err();
        assert_eq!(err.kind, ErrorKind::ProtocolError);
    }
}
