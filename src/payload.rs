//! Chat completion payloads and the endpoint-specific rewrites applied before forwarding.
//!
//! Only the fields the gateway reasons about are typed; everything else rides along untouched in
//! the flattened `extra` map.
use crate::auth::CallerIdentity;
use crate::resolver::ResolvedEndpoint;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value, json};
use tracing::debug;

/// Model families that reject `max_tokens` and `system` messages.
const O1_FAMILY_PREFIX: &str = "o1-";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatCompletionPayload {
    pub model: String,
    /// Legacy token limit, the only one most deployments understand.
    #[serde(default, deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<Value>,
    #[serde(default, deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    pub max_completion_tokens: Option<Value>,
    #[serde(default, deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    pub user: Option<Value>,
    /// Gateway-side metadata, never forwarded.
    #[serde(default, skip_serializing)]
    pub metadata: Option<Value>,
    /// Messages and every other field, forwarded as received.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Keeps an explicit `null` as `Some(Value::Null)`; only a missing key becomes `None`.
fn present<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

impl ChatCompletionPayload {
    /// Re-roles a leading `system` message as `user`. Messages that are not objects are left
    /// alone for the upstream to judge.
    fn demote_leading_system_message(&mut self) {
        if let Some(Value::Array(messages)) = self.extra.get_mut("messages")
            && let Some(Value::Object(first)) = messages.first_mut()
            && first.get("role").and_then(Value::as_str) == Some("system")
        {
            first.insert("role".to_string(), Value::String("user".to_string()));
        }
    }
}

/// A completion request after parsing, with its metadata split off.
#[derive(Debug, Clone)]
pub struct ProxyRequest {
    pub payload: ChatCompletionPayload,
    pub metadata: Option<Value>,
    pub caller: CallerIdentity,
    pub bypass_access_check: bool,
}

impl ProxyRequest {
    pub fn new(
        mut payload: ChatCompletionPayload,
        caller: CallerIdentity,
        bypass_access_check: bool,
    ) -> Self {
        let metadata = payload.metadata.take();
        Self {
            payload,
            metadata,
            caller,
            bypass_access_check,
        }
    }

    pub fn requested_model_id(&self) -> &str {
        &self.payload.model
    }
}

fn is_o1_family(model: &str) -> bool {
    model
        .get(..O1_FAMILY_PREFIX.len())
        .is_some_and(|head| head.eq_ignore_ascii_case(O1_FAMILY_PREFIX))
}

/// Rewrites `payload` for the endpoint in `resolved`. The steps run in a fixed order; later steps
/// see the model name produced by earlier ones.
pub fn adapt(
    mut payload: ChatCompletionPayload,
    resolved: &ResolvedEndpoint,
    caller: &CallerIdentity,
) -> ChatCompletionPayload {
    let endpoint = &resolved.endpoint;

    if let Some(prefix) = &endpoint.settings.prefix_id
        && let Some(bare) = payload.model.strip_prefix(&format!("{prefix}."))
    {
        debug!("Stripping prefix {} from model {}", prefix, payload.model);
        payload.model = bare.to_string();
    }

    if is_o1_family(&payload.model) {
        if let Some(limit) = payload.max_tokens.take() {
            payload.max_completion_tokens = Some(limit);
        }
        payload.demote_leading_system_message();
    } else if !endpoint.is_public_vendor()
        && let Some(limit) = payload.max_completion_tokens.take()
    {
        payload.max_tokens = Some(limit);
    }

    if payload.max_tokens.is_some() && payload.max_completion_tokens.is_some() {
        payload.max_tokens = None;
    }

    if resolved.entry.pipeline {
        payload.user = Some(json!({
            "name": caller.name,
            "id": caller.id,
            "email": caller.email,
            "role": caller.role.as_str(),
        }));
    }

    payload
}
