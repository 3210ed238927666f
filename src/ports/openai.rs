use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use tracing::error;

use super::{Classification, ClassificationRequest, Classifier, PortError};

const DEFAULT_URL: &str = "https://api.openai.com/v1";
const DEFAULT_MODEL: &str = "gpt-4o-mini";

/// Classifier that asks an OpenAI-compatible chat endpoint for a JSON verdict.
#[derive(Debug, Clone)]
pub struct OpenAiClassifier {
    client: Client,
    api_key: String,
    base_url: String,
    model: String,
}

impl OpenAiClassifier {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            api_key: api_key.into(),
            base_url: DEFAULT_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
        }
    }

    pub fn with_base_url(mut self, url: Option<String>) -> Self {
        if let Some(url) = url {
            self.base_url = url;
        }
        self
    }

    pub fn with_model(mut self, model: Option<String>) -> Self {
        if let Some(model) = model {
            self.model = model;
        }
        self
    }

    fn body(&self, request: &ClassificationRequest) -> Value {
        let system_prompt = r#"You evaluate a condition inside a WhatsApp chatbot.
Answer with a JSON object: {"result": boolean, "confidence": number between 0 and 1, "reasoning": string}."#;

        let user_msg = format!(
            "Condition: {}\nUser message: {}\nConversation variables: {}",
            request.prompt,
            request.message.as_deref().unwrap_or(""),
            Value::Object(request.variables.clone())
        );

        json!({
            "model": self.model,
            "temperature": 0,
            "messages": [
                {"role": "system", "content": system_prompt},
                {"role": "user", "content": user_msg},
            ],
            "response_format": {"type": "json_object"}
        })
    }
}

/// Pull the verdict out of a chat-completions response.
fn parse_classification(response: &Value) -> Result<Classification, PortError> {
    let content = response
        .pointer("/choices/0/message/content")
        .and_then(Value::as_str)
        .ok_or_else(|| PortError::Invalid("OpenAI response missing message content".into()))?;
    serde_json::from_str(content).map_err(|e| {
        error!("Failed to parse classification: {}", e);
        PortError::Invalid(format!("classification is not valid JSON: {e}"))
    })
}

#[async_trait]
impl Classifier for OpenAiClassifier {
    #[tracing::instrument(name = "openai_classify", skip(self, request))]
    async fn classify(&self, request: &ClassificationRequest) -> Result<Classification, PortError> {
        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));
        let resp = self
            .client
            .post(url)
            .bearer_auth(&self.api_key)
            .json(&self.body(request))
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    PortError::Timeout(format!("OpenAI request timed out: {e}"))
                } else {
                    PortError::Transport(format!("OpenAI request failed: {e}"))
                }
            })?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_else(|_| "<no body>".into());
            error!("OpenAI error: {}", text);
            return Err(PortError::Rejected {
                status: status.as_u16(),
                body: text,
            });
        }

        let json: Value = resp
            .json()
            .await
            .map_err(|e| PortError::Invalid(format!("Invalid OpenAI response: {e}")))?;
        parse_classification(&json)
    }

    fn name(&self) -> &'static str {
        "openai"
    }
}
