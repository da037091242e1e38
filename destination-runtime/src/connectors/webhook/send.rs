use crate::destination::{ActionDefinition, BatchInput, ExecuteInput};
use crate::request::{RequestClient, RequestOptions};
use actionkit::{ActionError, FieldSchema, Fields, Payload};
use async_trait::async_trait;
use reqwest::Method;
use serde_json::{json, Value};

/// Sends the mapped `data` to `url`.
pub struct SendAction;

impl SendAction {
    fn options(payload: &Payload) -> Result<(String, RequestOptions), ActionError> {
        let url = payload
            .get("url")
            .and_then(Value::as_str)
            .ok_or_else(|| ActionError::payload_validation("The root value is missing the required field 'url'."))?
            .to_string();

        let method = payload.get("method").and_then(Value::as_str).unwrap_or("POST");
        let method = Method::from_bytes(method.to_ascii_uppercase().as_bytes()).map_err(|_| {
            ActionError::payload_validation(format!("Unsupported HTTP method '{}'.", method))
        })?;

        let mut options = RequestOptions::method(method);
        if let Some(Value::Object(headers)) = payload.get("headers") {
            for (name, value) in headers {
                let value = match value {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                options = options.header(name.clone(), value);
            }
        }
        Ok((url, options))
    }
}

#[async_trait]
impl ActionDefinition for SendAction {
    fn title(&self) -> &str {
        "Send"
    }

    fn description(&self) -> &str {
        "Send an HTTP request with the mapped data as its JSON body."
    }

    fn fields(&self) -> Fields {
        let mut fields = Fields::new();
        fields.insert(
            "url".to_string(),
            FieldSchema::string("URL")
                .description("URL to deliver data to.")
                .required(),
        );
        fields.insert(
            "method".to_string(),
            FieldSchema::string("Method")
                .required()
                .choices(vec![json!("POST"), json!("PUT"), json!("PATCH")])
                .default_mapping(json!("POST")),
        );
        fields.insert(
            "headers".to_string(),
            FieldSchema::object("Headers").description("Extra headers to send with the request."),
        );
        fields.insert(
            "data".to_string(),
            FieldSchema::object("Data")
                .description("Payload to deliver to the webhook URL.")
                .default_mapping(json!({"@path": "$."})),
        );
        fields.insert(
            "enable_batching".to_string(),
            FieldSchema::boolean("Batch Data").default_mapping(json!(false)),
        );
        fields.insert(
            "batch_size".to_string(),
            FieldSchema::integer("Batch Size").range(Some(1.0), Some(4000.0)),
        );
        fields
    }

    fn default_subscription(&self) -> Option<&str> {
        Some(r#"type = "track" or type = "identify" or type = "page" or type = "screen" or type = "group""#)
    }

    fn supports_batch(&self) -> bool {
        true
    }

    async fn perform(
        &self,
        request: &RequestClient,
        input: ExecuteInput<'_>,
    ) -> Result<Value, ActionError> {
        let (url, options) = Self::options(input.payload)?;
        let data = input.payload.get("data").cloned().unwrap_or(Value::Null);
        let response = request.request(&url, options.json(data)).await?;
        Ok(response.data())
    }

    async fn perform_batch(
        &self,
        request: &RequestClient,
        input: BatchInput<'_>,
    ) -> Result<Value, ActionError> {
        let first = input
            .payloads
            .first()
            .ok_or_else(|| ActionError::payload_validation("Batch is empty."))?;
        // The batch shares settings, not URLs; the first payload picks the target
        let (url, options) = Self::options(first)?;
        let body: Vec<Value> = input
            .payloads
            .iter()
            .map(|p| p.get("data").cloned().unwrap_or(Value::Null))
            .collect();
        let response = request.request(&url, options.json(Value::Array(body))).await?;
        Ok(response.data())
    }
}
