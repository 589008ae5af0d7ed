//! `/api/meta`, `/metrics`, `/healthz`.

use axum::extract::State;
use axum::Json;
use serde::Serialize;

use stevedore_protocol::capabilities::{capabilities_for, ProviderCapabilities};
use stevedore_protocol::error::NormalizedErrorCode;
use stevedore_protocol::types::Provider;
use stevedore_scheduler::METRICS;

use crate::AppState;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetaResponse {
    version: &'static str,
    engine: EngineMeta,
    providers: Vec<ProviderMeta>,
    error_catalog: Vec<ErrorMeta>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct EngineMeta {
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ProviderMeta {
    provider: Provider,
    capabilities: &'static ProviderCapabilities,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ErrorMeta {
    code: NormalizedErrorCode,
    retryable: bool,
    recommended_action: &'static str,
}

pub async fn get_meta(State(state): State<AppState>) -> Json<MetaResponse> {
    let engine = match state.probe.verify().await {
        Ok(info) => EngineMeta {
            status: "ok",
            version: Some(info.version_string),
            detail: None,
        },
        Err(e) => EngineMeta {
            status: match &e {
                stevedore_engine::EngineError::Incompatible { .. } => "incompatible",
                _ => "missing",
            },
            version: None,
            detail: Some(e.to_string()),
        },
    };

    Json(MetaResponse {
        version: env!("CARGO_PKG_VERSION"),
        engine,
        providers: Provider::ALL
            .into_iter()
            .map(|provider| ProviderMeta {
                provider,
                capabilities: capabilities_for(provider),
            })
            .collect(),
        error_catalog: NormalizedErrorCode::ALL
            .into_iter()
            .map(|code| ErrorMeta {
                code,
                retryable: code.is_retryable(),
                recommended_action: code.recommended_action(),
            })
            .collect(),
    })
}

pub async fn get_metrics(State(state): State<AppState>) -> String {
    let mut out = METRICS.prometheus_format();
    out.push_str(&format!(
        r#"
# HELP stevedore_events_published_total Events published to the hub
# TYPE stevedore_events_published_total counter
stevedore_events_published_total {}

# HELP stevedore_events_dropped_total Events dropped on slow subscribers
# TYPE stevedore_events_dropped_total counter
stevedore_events_dropped_total {}

# HELP stevedore_event_subscribers Current subscriber count
# TYPE stevedore_event_subscribers gauge
stevedore_event_subscribers {}
"#,
        state.hub.published_total(),
        state.hub.dropped_total(),
        state.hub.subscriber_count(),
    ));
    out
}

pub async fn get_health() -> &'static str {
    "ok"
}
