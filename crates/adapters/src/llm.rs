use std::io::{BufRead, BufReader};
use std::time::Duration;

use book_core::{
    BackendConfig, Config, GenerationError, GenerationRequest, SamplingParams, TextGenerator,
};
use log::{debug, warn};
use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::header::{self, HeaderValue};
use serde::{Deserialize, Serialize};

use crate::base_url::{check_base_url, ollama_base_url};
use crate::error::AdapterError;
use crate::retry::{call_with_retry, RetryConfig};

const OLLAMA_DEFAULT_URL: &str = "http://localhost:11434";

/// Wire protocol spoken by a backend profile.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackendKind {
    Ollama,
    OpenAiCompatible,
}

impl BackendKind {
    /// Maps an `interface_format` to a protocol and its default base URL.
    pub fn resolve(interface_format: &str) -> Result<(Self, &'static str), AdapterError> {
        let fmt = interface_format.trim().to_lowercase();
        match fmt.as_str() {
            "" | "ollama" => Ok((Self::Ollama, OLLAMA_DEFAULT_URL)),
            "openai" => Ok((Self::OpenAiCompatible, "https://api.openai.com/v1")),
            "deepseek" => Ok((Self::OpenAiCompatible, "https://api.deepseek.com/v1")),
            "grok" => Ok((Self::OpenAiCompatible, "https://api.x.ai/v1")),
            "lm studio" => Ok((Self::OpenAiCompatible, "http://localhost:1234/v1")),
            "openai compatible" | "openai-compatible" => Ok((Self::OpenAiCompatible, "")),
            other => Err(AdapterError::InvalidConfig(format!(
                "unknown interface_format: {other}"
            ))),
        }
    }
}

pub fn create_generator(
    config: &Config,
    profile_name: &str,
) -> Result<Box<dyn TextGenerator>, AdapterError> {
    let profile = config.get_backend_profile(profile_name).ok_or_else(|| {
        AdapterError::InvalidConfig(format!("unknown backend profile `{profile_name}`"))
    })?;
    create_generator_from_profile(profile)
}

pub fn create_generator_from_profile(
    profile: &BackendConfig,
) -> Result<Box<dyn TextGenerator>, AdapterError> {
    let (kind, default_url) = BackendKind::resolve(&profile.interface_format)?;
    match kind {
        BackendKind::Ollama => Ok(Box::new(OllamaAdapter::from_profile(profile, default_url)?)),
        BackendKind::OpenAiCompatible => Ok(Box::new(OpenAiLikeAdapter::from_profile(
            profile,
            default_url,
        )?)),
    }
}

/// Names of the models the backend serves.
pub fn list_models(profile: &BackendConfig) -> Result<Vec<String>, AdapterError> {
    let (kind, default_url) = BackendKind::resolve(&profile.interface_format)?;
    let client = build_client(profile.timeout)?;
    let retry = RetryConfig::default();

    match kind {
        BackendKind::Ollama => {
            let url = format!("{}/api/tags", resolve_ollama_url(&profile.base_url, default_url));
            call_with_retry(
                || {
                    let response = check_status(client.get(&url).send()?)?;
                    let tags: OllamaTags = response.json()?;
                    Ok(tags.models.into_iter().map(|model| model.name).collect())
                },
                &retry,
            )
        }
        BackendKind::OpenAiCompatible => {
            let base = resolve_openai_url(&profile.base_url, default_url)?;
            let url = format!("{base}/models");
            let api_key = optional_string(&profile.api_key);
            call_with_retry(
                || {
                    let request = authorize(client.get(&url), api_key.as_deref());
                    let response = check_status(request.send()?)?;
                    let models: OpenAiModels = response.json()?;
                    Ok(models.data.into_iter().map(|model| model.id).collect())
                },
                &retry,
            )
        }
    }
}

fn optional_string(value: &str) -> Option<String> {
    if value.trim().is_empty() {
        None
    } else {
        Some(value.trim().to_string())
    }
}

fn resolve_ollama_url(base_url: &str, default: &str) -> String {
    if base_url.trim().is_empty() {
        default.to_string()
    } else {
        ollama_base_url(base_url)
    }
}

fn resolve_openai_url(base_url: &str, default: &str) -> Result<String, AdapterError> {
    let raw = if base_url.trim().is_empty() {
        default
    } else {
        base_url
    };
    let url = check_base_url(raw);
    if url.is_empty() {
        return Err(AdapterError::InvalidConfig(
            "base_url must not be empty".to_string(),
        ));
    }
    Ok(url)
}

fn require_model(model_name: &str) -> Result<String, AdapterError> {
    let model = model_name.trim();
    if model.is_empty() {
        return Err(AdapterError::InvalidConfig(
            "model_name must not be empty".to_string(),
        ));
    }
    Ok(model.to_string())
}

fn build_client(timeout: u64) -> Result<Client, AdapterError> {
    Ok(Client::builder()
        .timeout(Duration::from_secs(timeout.max(1)))
        .build()?)
}

fn authorize(request: RequestBuilder, api_key: Option<&str>) -> RequestBuilder {
    match api_key {
        Some(key) => request.bearer_auth(key),
        None => request,
    }
}

fn check_status(response: Response) -> Result<Response, AdapterError> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status();
    let body = response.text().unwrap_or_default();
    Err(AdapterError::HttpStatus { status, body })
}

/// Ollama's native streaming completion endpoint.
pub struct OllamaAdapter {
    client: Client,
    url: String,
    model_name: String,
}

impl OllamaAdapter {
    fn from_profile(profile: &BackendConfig, default_url: &str) -> Result<Self, AdapterError> {
        Ok(Self {
            client: build_client(profile.timeout)?,
            url: format!(
                "{}/api/generate",
                resolve_ollama_url(&profile.base_url, default_url)
            ),
            model_name: require_model(&profile.model_name)?,
        })
    }

    fn generate_once(&self, prompt: &str, sampling: &SamplingParams) -> Result<String, AdapterError> {
        let body = OllamaGenerateRequest {
            model: &self.model_name,
            prompt,
            stream: true,
            options: OllamaOptions {
                temperature: sampling.temperature,
                top_p: sampling.top_p,
                num_predict: sampling.max_tokens,
            },
        };
        debug!(
            "ollama request to {} ({} prompt chars, num_predict {})",
            self.url,
            prompt.len(),
            sampling.max_tokens
        );
        let response = self
            .client
            .post(&self.url)
            .header(
                header::CONTENT_TYPE,
                HeaderValue::from_static("application/json"),
            )
            .json(&body)
            .send()?;
        let response = check_status(response)?;
        parse_ndjson_stream(BufReader::new(response))
    }
}

impl TextGenerator for OllamaAdapter {
    fn generate(&self, request: &GenerationRequest) -> Result<String, GenerationError> {
        Ok(self.generate_once(&request.prompt, &request.sampling)?)
    }
}

/// Any backend speaking the OpenAI chat-completions protocol.
pub struct OpenAiLikeAdapter {
    client: Client,
    url: String,
    api_key: Option<String>,
    model_name: String,
}

impl OpenAiLikeAdapter {
    fn from_profile(profile: &BackendConfig, default_url: &str) -> Result<Self, AdapterError> {
        let base = resolve_openai_url(&profile.base_url, default_url)?;
        Ok(Self {
            client: build_client(profile.timeout)?,
            url: format!("{base}/chat/completions"),
            api_key: optional_string(&profile.api_key),
            model_name: require_model(&profile.model_name)?,
        })
    }

    fn generate_once(&self, prompt: &str, sampling: &SamplingParams) -> Result<String, AdapterError> {
        let body = ChatCompletionRequest {
            model: &self.model_name,
            messages: vec![ChatMessageRequest {
                role: "user",
                content: prompt,
            }],
            max_tokens: (sampling.max_tokens > 0).then_some(sampling.max_tokens),
            temperature: sampling.temperature,
            top_p: sampling.top_p,
            stream: true,
        };
        let request = self.client.post(&self.url).header(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        let response = authorize(request, self.api_key.as_deref())
            .json(&body)
            .send()?;
        let response = check_status(response)?;
        parse_sse_stream(BufReader::new(response))
    }
}

impl TextGenerator for OpenAiLikeAdapter {
    fn generate(&self, request: &GenerationRequest) -> Result<String, GenerationError> {
        Ok(self.generate_once(&request.prompt, &request.sampling)?)
    }
}

/// Concatenates the `response` fragments of an Ollama NDJSON stream verbatim
/// until a line reports `done`.
pub fn parse_ndjson_stream<R: BufRead>(reader: R) -> Result<String, AdapterError> {
    let mut text = String::new();
    let mut done = false;

    for (index, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let chunk: OllamaChunk =
            serde_json::from_str(&line).map_err(|source| AdapterError::MalformedLine {
                line: index + 1,
                source,
            })?;
        if let Some(error) = chunk.error {
            return Err(AdapterError::Backend(error));
        }
        if let Some(fragment) = chunk.response {
            text.push_str(&fragment);
        }
        if chunk.done {
            done = true;
            break;
        }
    }

    if !done {
        warn!("ollama stream ended without a done marker");
    }
    if text.trim().is_empty() {
        return Err(AdapterError::EmptyResponse);
    }
    Ok(text)
}

/// Concatenates `choices[].delta.content` from an OpenAI-style server-sent
/// event stream until `[DONE]`.
pub fn parse_sse_stream<R: BufRead>(reader: R) -> Result<String, AdapterError> {
    let mut text = String::new();

    for (index, line) in reader.lines().enumerate() {
        let line = line?;
        let Some(data) = line.strip_prefix("data:") else {
            continue;
        };
        let data = data.trim();
        if data.is_empty() {
            continue;
        }
        if data == "[DONE]" {
            break;
        }
        let chunk: ChatStreamChunk =
            serde_json::from_str(data).map_err(|source| AdapterError::MalformedLine {
                line: index + 1,
                source,
            })?;
        if let Some(error) = chunk.error {
            return Err(AdapterError::Backend(error.message));
        }
        for choice in chunk.choices {
            let content = choice
                .delta
                .and_then(|delta| delta.content)
                .or_else(|| choice.message.and_then(|message| message.content));
            if let Some(content) = content {
                text.push_str(&content);
            }
        }
    }

    if text.trim().is_empty() {
        return Err(AdapterError::EmptyResponse);
    }
    Ok(text)
}

#[derive(Serialize)]
struct OllamaGenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    options: OllamaOptions,
}

#[derive(Serialize)]
struct OllamaOptions {
    temperature: f32,
    top_p: f32,
    num_predict: u32,
}

#[derive(Debug, Deserialize)]
struct OllamaChunk {
    #[serde(default)]
    response: Option<String>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OllamaTags {
    #[serde(default)]
    models: Vec<OllamaModel>,
}

#[derive(Debug, Deserialize)]
struct OllamaModel {
    name: String,
}

#[derive(Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessageRequest<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    temperature: f32,
    top_p: f32,
    stream: bool,
}

#[derive(Serialize)]
struct ChatMessageRequest<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatStreamChunk {
    #[serde(default)]
    choices: Vec<ChatStreamChoice>,
    #[serde(default)]
    error: Option<ChatStreamError>,
}

#[derive(Debug, Deserialize)]
struct ChatStreamChoice {
    #[serde(default)]
    delta: Option<ChatDelta>,
    #[serde(default)]
    message: Option<ChatDelta>,
}

#[derive(Debug, Deserialize)]
struct ChatDelta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatStreamError {
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct OpenAiModels {
    #[serde(default)]
    data: Vec<OpenAiModel>,
}

#[derive(Debug, Deserialize)]
struct OpenAiModel {
    id: String,
}
