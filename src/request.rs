use serde_json::Value;

/// Temperature sent upstream when the caller omits one.
pub const DEFAULT_TEMPERATURE: f64 = 0.7;

/// A validated inbound chat request.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<Value>,
    pub temperature: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvalidRequest {
    #[error("request body must be a JSON object")]
    NotAnObject,
    #[error("missing required field: model")]
    MissingModel,
    #[error("model must be a non-empty string")]
    InvalidModel,
    #[error("messages must be a non-empty array")]
    InvalidMessages,
    #[error("messages[{0}] must be an object")]
    InvalidMessage(usize),
    #[error("temperature must be a number")]
    InvalidTemperature,
}

impl TryFrom<Value> for ChatRequest {
    type Error = InvalidRequest;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        let Value::Object(mut map) = value else {
            return Err(InvalidRequest::NotAnObject);
        };

        let model = match map.remove("model") {
            None | Some(Value::Null) => return Err(InvalidRequest::MissingModel),
            Some(Value::String(model)) if !model.trim().is_empty() => model,
            Some(_) => return Err(InvalidRequest::InvalidModel),
        };

        let messages = match map.remove("messages") {
            Some(Value::Array(messages)) if !messages.is_empty() => messages,
            _ => return Err(InvalidRequest::InvalidMessages),
        };
        if let Some(idx) = messages.iter().position(|message| !message.is_object()) {
            return Err(InvalidRequest::InvalidMessage(idx));
        }

        let temperature = match map.remove("temperature") {
            None | Some(Value::Null) => DEFAULT_TEMPERATURE,
            Some(value) => value.as_f64().ok_or(InvalidRequest::InvalidTemperature)?,
        };

        Ok(Self {
            model,
            messages,
            temperature,
        })
    }
}
