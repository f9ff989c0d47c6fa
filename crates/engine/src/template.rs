// Placeholder resolution for block inputs.
//
// `{{name}}` resolves against workflow variables first, then environment
// variables. An unresolved placeholder passes through literally; this is
// documented behavior, not an error.

use crate::context::ExecutionContext;
use serde_json::Value;

/// Resolve placeholders in an arbitrary JSON value, recursing through
/// objects and arrays. Non-string leaves are returned unchanged.
pub fn resolve_value(value: &Value, ctx: &ExecutionContext) -> Value {
    match value {
        Value::String(s) => resolve_string(s, ctx),
        Value::Array(items) => Value::Array(items.iter().map(|v| resolve_value(v, ctx)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), resolve_value(v, ctx)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Resolve placeholders in one string. A string that is exactly one
/// placeholder resolves to the variable's JSON value; otherwise matches are
/// substituted with their string rendering inside the surrounding text.
pub fn resolve_string(text: &str, ctx: &ExecutionContext) -> Value {
    if let Some(name) = whole_placeholder(text) {
        if let Some(value) = lookup(name, ctx) {
            return value;
        }
        return Value::String(text.to_string());
    }

    let mut result = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find("{{") {
        let after = &rest[start + 2..];
        match after.find("}}") {
            Some(end) => {
                let name = after[..end].trim();
                result.push_str(&rest[..start]);
                match lookup(name, ctx) {
                    Some(value) => result.push_str(&render(&value)),
                    None => result.push_str(&rest[start..start + 2 + end + 2]),
                }
                rest = &after[end + 2..];
            }
            None => break,
        }
    }
    result.push_str(rest);
    Value::String(result)
}

/// Resolve every value of a block's input map.
pub fn resolve_inputs(
    inputs: &serde_json::Map<String, Value>,
    ctx: &ExecutionContext,
) -> serde_json::Map<String, Value> {
    inputs
        .iter()
        .map(|(k, v)| (k.clone(), resolve_value(v, ctx)))
        .collect()
}

fn whole_placeholder(text: &str) -> Option<&str> {
    let trimmed = text.trim();
    let inner = trimmed.strip_prefix("{{")?.strip_suffix("}}")?;
    // reject strings containing more than one placeholder, e.g. "{{a}}{{b}}"
    if inner.contains("{{") || inner.contains("}}") {
        return None;
    }
    Some(inner.trim())
}

fn lookup(name: &str, ctx: &ExecutionContext) -> Option<Value> {
    if let Some(value) = ctx.workflow_variables.get(name) {
        return Some(value.clone());
    }
    ctx.environment_variables
        .get(name)
        .map(|v| Value::String(v.clone()))
}

fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ExecutionId, TriggerKind, WorkflowDefinition, WorkflowId};
    use serde_json::json;
    use std::collections::HashMap;

    fn context_with(vars: &[(&str, Value)], env: &[(&str, &str)]) -> ExecutionContext {
        let workflow = WorkflowDefinition {
            id: WorkflowId::new("wf"),
            name: "t".to_string(),
            blocks: vec![],
            edges: vec![],
        };
        let mut ctx = ExecutionContext::new(
            ExecutionId::new(),
            &workflow,
            "user",
            TriggerKind::Manual,
            Value::Null,
            env.iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<HashMap<_, _>>(),
        );
        for (name, value) in vars {
            ctx.set_variable(*name, value.clone());
        }
        ctx
    }

    #[test]
    fn workflow_variables_win_over_environment() {
        let ctx = context_with(&[("region", json!("eu-west"))], &[("region", "us-east")]);
        assert_eq!(resolve_string("{{region}}", &ctx), json!("eu-west"));
    }

    #[test]
    fn environment_is_the_fallback() {
        let ctx = context_with(&[], &[("api_key", "secret")]);
        assert_eq!(resolve_string("{{api_key}}", &ctx), json!("secret"));
    }

    #[test]
    fn unresolved_placeholder_passes_through_literally() {
        let ctx = context_with(&[], &[]);
        assert_eq!(resolve_string("{{missing}}", &ctx), json!("{{missing}}"));
        assert_eq!(
            resolve_string("prefix {{missing}} suffix", &ctx),
            json!("prefix {{missing}} suffix")
        );
    }

    #[test]
    fn whole_placeholder_keeps_json_type() {
        let ctx = context_with(&[("items", json!([1, 2, 3]))], &[]);
        assert_eq!(resolve_string("{{items}}", &ctx), json!([1, 2, 3]));
    }

    #[test]
    fn embedded_placeholder_renders_as_text() {
        let ctx = context_with(&[("count", json!(3))], &[]);
        assert_eq!(
            resolve_string("processed {{count}} rows", &ctx),
            json!("processed 3 rows")
        );
    }

    #[test]
    fn resolution_recurses_through_objects_and_arrays() {
        let ctx = context_with(&[("name", json!("cascade"))], &[]);
        let input = json!({"outer": {"inner": "{{name}}"}, "list": ["{{name}}", 7]});
        assert_eq!(
            resolve_value(&input, &ctx),
            json!({"outer": {"inner": "cascade"}, "list": ["cascade", 7]})
        );
    }
}
