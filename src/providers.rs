//! AI provider contract and adapters

use crate::error::CoreError;
use crate::types::{AiResponse, WorkKind, WorkerRequest};
use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// Failure categories every provider adapter maps its transport errors onto
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderFailure {
    Auth(String),
    RateLimited(String),
    Server(String),
    Client(String),
    Timeout,
}

impl ProviderFailure {
    /// Map an HTTP-style status code
    pub fn from_status(status: u16, body: impl Into<String>) -> Self {
        let body = body.into();
        match status {
            401 | 403 => ProviderFailure::Auth(body),
            429 => ProviderFailure::RateLimited(body),
            408 | 504 => ProviderFailure::Timeout,
            500..=599 => ProviderFailure::Server(body),
            _ => ProviderFailure::Client(format!("status {}: {}", status, body)),
        }
    }

    pub fn into_error(self, provider: &str) -> CoreError {
        let provider = provider.to_string();
        match self {
            ProviderFailure::Auth(message) => CoreError::ProviderAuth { provider, message },
            ProviderFailure::RateLimited(message) => {
                CoreError::ProviderRateLimited { provider, message }
            }
            ProviderFailure::Server(message) => CoreError::ProviderServer { provider, message },
            ProviderFailure::Client(message) => CoreError::ProviderClient { provider, message },
            ProviderFailure::Timeout => CoreError::ProviderTimeout { provider },
        }
    }
}

pub type ProviderResult = Result<AiResponse, ProviderFailure>;

/// Trait for interchangeable AI backends
#[async_trait]
pub trait AiProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn invoke(&self, request: &WorkerRequest) -> ProviderResult;
}

#[derive(Debug, Serialize)]
struct InvokeRequest<'a> {
    kind: WorkKind,
    prompt: &'a str,
    context: &'a [String],
    mode: &'static str,
}

#[derive(Debug, Deserialize)]
struct InvokeResponse {
    label: String,
    #[serde(default)]
    confidence: Option<f64>,
}

/// Provider reached over HTTP. Posts `{kind, prompt, context, mode}` to `<base_url>/invoke`.
pub struct HttpProvider {
    name: String,
    base_url: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl HttpProvider {
    pub fn new(
        name: impl Into<String>,
        base_url: impl Into<String>,
        api_key: Option<String>,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build provider HTTP client")?;
        Ok(Self {
            name: name.into(),
            base_url: base_url.into(),
            api_key,
            client,
        })
    }

    async fn call(&self, request: &WorkerRequest) -> anyhow::Result<reqwest::Response> {
        let body = InvokeRequest {
            kind: request.kind,
            prompt: &request.prompt,
            context: &request.context,
            mode: if request.use_chat_mode { "chat" } else { "completion" },
        };
        let mut builder = self
            .client
            .post(format!("{}/invoke", self.base_url.trim_end_matches('/')))
            .json(&body);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }
        builder
            .send()
            .await
            .with_context(|| format!("Failed to call provider {}", self.name))
    }
}

fn transport_failure(err: &anyhow::Error) -> ProviderFailure {
    match err.downcast_ref::<reqwest::Error>() {
        Some(e) if e.is_timeout() => ProviderFailure::Timeout,
        // Connection problems are transient from the caller's point of view
        _ => ProviderFailure::Server(format!("{:#}", err)),
    }
}

#[async_trait]
impl AiProvider for HttpProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(&self, request: &WorkerRequest) -> ProviderResult {
        let response = self.call(request).await.map_err(|e| transport_failure(&e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderFailure::from_status(status.as_u16(), body));
        }

        let parsed: InvokeResponse = response
            .json()
            .await
            .map_err(|e| ProviderFailure::Server(format!("unparseable response: {}", e)))?;

        tracing::debug!(provider = %self.name, label = %parsed.label, "Provider answered");

        Ok(AiResponse {
            label: parsed.label,
            confidence: parsed.confidence,
            provider: self.name.clone(),
        })
    }
}

/// What a [`ScriptedProvider`] answers once its queue is empty
#[derive(Debug, Clone)]
pub enum Fallback {
    /// Echo the prompt back with the given confidence
    Echo(f64),
    /// Repeat a fixed outcome
    Repeat(ProviderResult),
}

/// In-process provider answering from a script; counts every invocation
pub struct ScriptedProvider {
    name: String,
    script: Mutex<VecDeque<ProviderResult>>,
    fallback: Fallback,
    delay: Duration,
    calls: AtomicUsize,
}

impl ScriptedProvider {
    pub fn new(name: impl Into<String>, fallback: Fallback) -> Self {
        Self {
            name: name.into(),
            script: Mutex::new(VecDeque::new()),
            fallback,
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn echo(name: impl Into<String>) -> Self {
        Self::new(name, Fallback::Echo(0.9))
    }

    pub fn always(name: impl Into<String>, outcome: ProviderResult) -> Self {
        Self::new(name, Fallback::Repeat(outcome))
    }

    pub fn failing(name: impl Into<String>, failure: ProviderFailure) -> Self {
        Self::always(name, Err(failure))
    }

    /// Answer with `label` and `confidence` every time
    pub fn answering(name: impl Into<String>, label: &str, confidence: f64) -> Self {
        let name = name.into();
        let response = AiResponse {
            label: label.to_string(),
            confidence: Some(confidence),
            provider: name.clone(),
        };
        Self::always(name, Ok(response))
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Queue outcomes served before the fallback
    pub fn with_script(self, outcomes: impl IntoIterator<Item = ProviderResult>) -> Self {
        if let Ok(mut script) = self.script.lock() {
            script.extend(outcomes);
        }
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AiProvider for ScriptedProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(&self, request: &WorkerRequest) -> ProviderResult {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let scripted = self.script.lock().ok().and_then(|mut s| s.pop_front());
        match scripted {
            Some(outcome) => outcome,
            None => match &self.fallback {
                Fallback::Echo(confidence) => Ok(AiResponse {
                    label: request.prompt.clone(),
                    confidence: Some(*confidence),
                    provider: self.name.clone(),
                }),
                Fallback::Repeat(outcome) => outcome.clone(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(ProviderFailure::from_status(401, "x"), ProviderFailure::Auth("x".into()));
        assert_eq!(ProviderFailure::from_status(403, "x"), ProviderFailure::Auth("x".into()));
        assert_eq!(
            ProviderFailure::from_status(429, "slow down"),
            ProviderFailure::RateLimited("slow down".into())
        );
        assert_eq!(ProviderFailure::from_status(502, "x"), ProviderFailure::Server("x".into()));
        assert!(matches!(ProviderFailure::from_status(422, "x"), ProviderFailure::Client(_)));
        assert_eq!(ProviderFailure::from_status(504, ""), ProviderFailure::Timeout);
    }

    #[test]
    fn test_failure_into_error_keeps_provider() {
        let err = ProviderFailure::Auth("bad key".into()).into_error("edenai");
        assert_eq!(
            err,
            CoreError::ProviderAuth { provider: "edenai".into(), message: "bad key".into() }
        );
    }

    #[tokio::test]
    async fn test_scripted_provider_serves_script_then_fallback() {
        let provider = ScriptedProvider::echo("p")
            .with_script(vec![Err(ProviderFailure::RateLimited("busy".into()))]);
        let req = WorkerRequest::correction("болт м10", false);

        assert!(provider.invoke(&req).await.is_err());
        let ok = provider.invoke(&req).await.unwrap();
        assert_eq!(ok.label, "болт м10");
        assert_eq!(provider.calls(), 2);
    }
}
