//! Model and account discovery through a throwaway CLI process.

use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use super::cli_protocol::ClaudeProtocol;
use crate::backends::channel::LaunchSpec;
use crate::backends::engine::{ControlRequest, EngineOptions, SessionEngine};
use crate::backends::error::BackendError;
use crate::backends::runtime::{DiagnosticLine, Fanout};
use crate::backends::types::{AccountInfo, BackendInfo, ModelInfo};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CliModel {
    value: String,
    #[serde(default)]
    display_name: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    supports_thinking: Option<bool>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CliAccount {
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    subscription_type: Option<String>,
}

/// Reads the `models` and `account` blocks of an `initialize` response.
pub fn parse_backend_info(payload: &Value) -> BackendInfo {
    let models = payload
        .get("models")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| serde_json::from_value::<CliModel>(item.clone()).ok())
                .map(|model| ModelInfo {
                    supports_thinking: model
                        .supports_thinking
                        .unwrap_or(!model.value.contains("haiku")),
                    display_name: model.display_name.unwrap_or_else(|| model.value.clone()),
                    description: model.description,
                    id: model.value,
                })
                .collect()
        })
        .unwrap_or_default();

    let account = payload
        .get("account")
        .and_then(|raw| serde_json::from_value::<CliAccount>(raw.clone()).ok())
        .filter(|account| account.email.is_some() || account.subscription_type.is_some())
        .map(|account| AccountInfo {
            email: account.email,
            plan: account.subscription_type,
        });

    BackendInfo { models, account }
}

/// Spawns `spec`, sends one `initialize` request and waits up to `timeout`
/// for its response. The process is always killed before returning; any
/// failure yields an empty result.
pub async fn run(
    spec: &LaunchSpec,
    timeout: Duration,
    errors: Arc<Fanout<BackendError>>,
    diagnostics: Arc<Fanout<DiagnosticLine>>,
) -> BackendInfo {
    let options = EngineOptions {
        session_id: format!("discovery-{}", Uuid::new_v4().simple()),
        handshake: None,
        handshake_timeout: timeout,
        event_buffer: 16,
    };

    let engine = match SessionEngine::start(
        spec,
        Arc::new(ClaudeProtocol),
        options,
        errors,
        diagnostics,
    )
    .await
    {
        Ok(engine) => engine,
        Err(err) => {
            log::warn!("[claude] Discovery could not start: {}", err);
            return BackendInfo::default();
        }
    };

    let response = engine
        .request(ControlRequest::Initialize { hooks: None }, Some(timeout))
        .await;
    engine.kill().await;

    match response {
        Ok(payload) => {
            let info = parse_backend_info(&payload);
            log::info!(
                "[claude] Discovered {} model(s){}",
                info.models.len(),
                if info.account.is_some() { " and account info" } else { "" }
            );
            info
        }
        Err(err) => {
            log::warn!("[claude] Discovery failed: {}", err);
            BackendInfo::default()
        }
    }
}
