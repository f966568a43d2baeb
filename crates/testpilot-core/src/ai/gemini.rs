use super::{ChatModel, FunctionCall, FunctionDeclaration, ModelReply, Part, Speaker, TextGenerator, Turn};
use crate::config::Config;
use crate::error::ServiceError;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::debug;

const SERVICE: &str = "Gemini API";
const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
struct WirePart {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    function_call: Option<WireFunctionCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    function_response: Option<WireFunctionResponse>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
struct WireFunctionCall {
    name: String,
    #[serde(default)]
    args: Map<String, Value>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
struct WireFunctionResponse {
    name: String,
    response: Value,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
struct WireContent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    #[serde(default)]
    parts: Vec<WirePart>,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
struct WireTool {
    function_declarations: Vec<Value>,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<WireContent>,
    contents: Vec<WireContent>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<WireTool>,
}

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    #[serde(default)]
    content: WireContent,
}

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
struct PromptFeedback {
    #[serde(default)]
    block_reason: Option<String>,
}

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default)]
    prompt_feedback: Option<PromptFeedback>,
}

fn text_content(role: Option<&str>, text: &str) -> WireContent {
    WireContent {
        role: role.map(str::to_string),
        parts: vec![WirePart {
            text: Some(text.to_string()),
            ..WirePart::default()
        }],
    }
}

fn wire_part(part: &Part) -> WirePart {
    match part {
        Part::Text(text) => WirePart {
            text: Some(text.clone()),
            ..WirePart::default()
        },
        Part::Call(call) => WirePart {
            function_call: Some(WireFunctionCall {
                name: call.name.clone(),
                args: call.args.clone(),
            }),
            ..WirePart::default()
        },
        Part::Result { name, response } => WirePart {
            function_response: Some(WireFunctionResponse {
                name: name.clone(),
                response: response.clone(),
            }),
            ..WirePart::default()
        },
    }
}

fn build_request(
    system: &str,
    history: &[Turn],
    functions: &[FunctionDeclaration],
) -> GenerateRequest {
    let contents = history
        .iter()
        .map(|turn| WireContent {
            role: Some(
                match turn.speaker {
                    Speaker::User => "user",
                    Speaker::Model => "model",
                }
                .to_string(),
            ),
            parts: turn.parts.iter().map(wire_part).collect(),
        })
        .collect();

    let tools = if functions.is_empty() {
        Vec::new()
    } else {
        vec![WireTool {
            function_declarations: functions
                .iter()
                .map(|f| {
                    json!({
                        "name": f.name,
                        "description": f.description,
                        "parameters": f.parameters,
                    })
                })
                .collect(),
        }]
    };

    GenerateRequest {
        system_instruction: (!system.is_empty()).then(|| text_content(None, system)),
        contents,
        tools,
    }
}

fn parse_reply(response: GenerateResponse) -> Result<ModelReply, ServiceError> {
    let candidate = match response.candidates.into_iter().next() {
        Some(candidate) => candidate,
        None => {
            let reason = response
                .prompt_feedback
                .and_then(|f| f.block_reason)
                .unwrap_or_else(|| "no reason given".to_string());
            return Err(ServiceError::Decode {
                service: SERVICE,
                reason: format!("no candidates returned ({})", reason),
            });
        }
    };

    let mut reply = ModelReply::default();
    for part in candidate.content.parts {
        if let Some(text) = part.text {
            reply.text.push_str(&text);
        }
        if let Some(call) = part.function_call {
            reply.calls.push(FunctionCall {
                name: call.name,
                args: call.args,
            });
        }
    }
    Ok(reply)
}

/// Client for the `generateContent` endpoint.
#[derive(Clone)]
pub struct GeminiClient {
    client: Client,
    api_key: String,
    model: String,
    timeout_secs: u64,
}

impl GeminiClient {
    pub fn new(api_key: &str, config: &Config) -> Result<Self, ServiceError> {
        let client = Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| ServiceError::from_reqwest(SERVICE, config.request_timeout_secs, e))?;

        Ok(Self {
            client,
            api_key: api_key.to_string(),
            model: config.model_name().to_string(),
            timeout_secs: config.request_timeout().as_secs(),
        })
    }

    async fn send(&self, request: &GenerateRequest) -> Result<ModelReply, ServiceError> {
        let url = format!("{}/models/{}:generateContent", DEFAULT_BASE_URL, self.model);
        debug!(model = %self.model, turns = request.contents.len(), "Calling generateContent");

        let response = self
            .client
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .json(request)
            .send()
            .await
            .map_err(|e| ServiceError::from_reqwest(SERVICE, self.timeout_secs, e))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ServiceError::Status {
                service: SERVICE,
                status: status.as_u16(),
                body,
            });
        }

        let body: GenerateResponse = response
            .json()
            .await
            .map_err(|e| ServiceError::from_reqwest(SERVICE, self.timeout_secs, e))?;
        parse_reply(body)
    }
}

#[async_trait]
impl ChatModel for GeminiClient {
    async fn complete(
        &self,
        system: &str,
        history: &[Turn],
        functions: &[FunctionDeclaration],
    ) -> Result<ModelReply, ServiceError> {
        self.send(&build_request(system, history, functions)).await
    }
}

#[async_trait]
impl TextGenerator for GeminiClient {
    async fn generate(&self, prompt: &str) -> Result<String, ServiceError> {
        let reply = self.send(&build_request("", &[Turn::user(prompt)], &[])).await?;
        Ok(reply.text)
    }
}
