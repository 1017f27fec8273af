//! Step invocation
//!
//! Routes an invocation by step kind: sync steps POST and wait, async steps
//! POST a dispatch carrying the work-item token and webhook callback URL,
//! and script steps run in-process on a blocking thread. Invocation errors
//! never propagate as `Err`; they are recorded as failed dispositions.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use mlua::{Lua, LuaSerdeExt};
use serde::Serialize;

use strand_domain::{HttpConfig, ScriptSpec, Step, StepKind};

/// Default HTTP invocation timeout
pub const DEFAULT_INVOKE_TIMEOUT: Duration = Duration::from_secs(30);

// =============================================================================
// Invoker Contract
// =============================================================================

/// Outcome of one invocation
#[derive(Debug, Clone, PartialEq)]
pub enum Disposition {
    /// The result is available now; sync and script steps end here
    Completed {
        outputs: BTreeMap<String, serde_json::Value>,
    },

    /// The invocation failed with a recordable error
    Failed { error: String },

    /// An async dispatch was accepted; completion arrives via webhook
    Dispatched,
}

/// Per-invocation context supplied by the flow engine
#[derive(Debug, Clone, Copy)]
pub struct InvokeContext<'a> {
    /// Projected inputs (for async fan-out, the item's bound inputs)
    pub inputs: &'a BTreeMap<String, serde_json::Value>,

    /// Work-item token; present for async dispatches
    pub token: Option<&'a str>,

    /// Webhook callback URL; present for async dispatches
    pub callback_url: Option<&'a str>,
}

/// Invokes steps on behalf of the flow engine.
///
/// Injected as an interface so tests and alternative transports can stand in
/// for the HTTP client.
#[async_trait]
pub trait StepInvoker: Send + Sync {
    async fn invoke(&self, step: &Step, ctx: InvokeContext<'_>) -> Disposition;
}

// =============================================================================
// HTTP Invoker
// =============================================================================

/// JSON body POSTed to step endpoints
#[derive(Debug, Serialize)]
struct InvokeBody<'a> {
    inputs: &'a BTreeMap<String, serde_json::Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    token: Option<&'a str>,

    #[serde(skip_serializing_if = "Option::is_none")]
    callback_url: Option<&'a str>,
}

/// Production invoker: reqwest for HTTP kinds, Lua for script kinds
pub struct HttpInvoker {
    client: reqwest::Client,
}

impl HttpInvoker {
    /// Create an invoker with its own connection pool
    #[must_use]
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    fn timeout(http: &HttpConfig) -> Duration {
        http.timeout_secs
            .map_or(DEFAULT_INVOKE_TIMEOUT, Duration::from_secs)
    }

    /// POST the body and parse a 2xx JSON object response as outputs
    async fn post_sync(
        &self,
        http: &HttpConfig,
        body: &InvokeBody<'_>,
    ) -> Result<BTreeMap<String, serde_json::Value>, String> {
        let response = self
            .client
            .post(&http.endpoint)
            .timeout(Self::timeout(http))
            .json(body)
            .send()
            .await
            .map_err(|e| format!("request to {} failed: {e}", http.endpoint))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| format!("reading response from {} failed: {e}", http.endpoint))?;

        if !status.is_success() {
            return Err(format!(
                "{} returned {status}: {}",
                http.endpoint,
                text.chars().take(200).collect::<String>()
            ));
        }

        if text.trim().is_empty() {
            return Ok(BTreeMap::new());
        }
        serde_json::from_str(&text)
            .map_err(|e| format!("{} returned non-object outputs: {e}", http.endpoint))
    }

    /// POST a dispatch and require a 2xx acknowledgement
    async fn post_dispatch(&self, http: &HttpConfig, body: &InvokeBody<'_>) -> Result<(), String> {
        let response = self
            .client
            .post(&http.endpoint)
            .timeout(Self::timeout(http))
            .json(body)
            .send()
            .await
            .map_err(|e| format!("dispatch to {} failed: {e}", http.endpoint))?;

        let status = response.status();
        if !status.is_success() {
            return Err(format!("{} rejected dispatch: {status}", http.endpoint));
        }
        Ok(())
    }
}

#[async_trait]
impl StepInvoker for HttpInvoker {
    async fn invoke(&self, step: &Step, ctx: InvokeContext<'_>) -> Disposition {
        match &step.kind {
            StepKind::Sync { http } => {
                let body = InvokeBody {
                    inputs: ctx.inputs,
                    token: None,
                    callback_url: None,
                };
                match self.post_sync(http, &body).await {
                    Ok(outputs) => Disposition::Completed { outputs },
                    Err(error) => Disposition::Failed { error },
                }
            }

            StepKind::Async { http } => {
                let body = InvokeBody {
                    inputs: ctx.inputs,
                    token: ctx.token,
                    callback_url: ctx.callback_url,
                };
                match self.post_dispatch(http, &body).await {
                    Ok(()) => Disposition::Dispatched,
                    Err(error) => Disposition::Failed { error },
                }
            }

            StepKind::Script { script } => {
                let script = script.clone();
                let inputs = ctx.inputs.clone();
                let joined = tokio::task::spawn_blocking(move || run_script(&script, &inputs))
                    .await
                    .map_err(|e| format!("script task panicked: {e}"));
                match joined {
                    Ok(Ok(outputs)) => Disposition::Completed { outputs },
                    Ok(Err(error)) | Err(error) => Disposition::Failed { error },
                }
            }
        }
    }
}

// =============================================================================
// Script Runtime
// =============================================================================

/// Compile a script source without running it.
///
/// Used by the catalog to reject broken scripts at registration time.
pub fn compile_script(spec: &ScriptSpec) -> Result<(), String> {
    let lua = Lua::new();
    lua.load(&spec.source)
        .into_function()
        .map(|_| ())
        .map_err(|e| e.to_string())
}

/// Execute a script in a fresh VM.
///
/// The input map is bound to an `inputs` global; the chunk's returned table
/// becomes the output map.
pub fn run_script(
    spec: &ScriptSpec,
    inputs: &BTreeMap<String, serde_json::Value>,
) -> Result<BTreeMap<String, serde_json::Value>, String> {
    let lua = Lua::new();

    let bound = lua.to_value(inputs).map_err(|e| e.to_string())?;
    lua.globals()
        .set("inputs", bound)
        .map_err(|e| e.to_string())?;

    let value: mlua::Value = lua.load(&spec.source).eval().map_err(|e| e.to_string())?;
    lua.from_value(value)
        .map_err(|e| format!("script did not return an output table: {e}"))
}

// =============================================================================
// Tests
// =============================================================================
