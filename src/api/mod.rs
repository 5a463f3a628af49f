//! REST API module

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::get,
    Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::warn;

use crate::device::{DeviceStatus, MappingSnapshot, ModbusDevice};
use crate::error::WriteError;
use crate::mapping::{DataType, Value};
use crate::modbus::{ModbusReader, ReaderState};

/// API state shared across handlers
#[derive(Clone)]
pub struct ApiState {
    pub reader: Arc<ModbusReader>,
    pub metrics_handle: Option<PrometheusHandle>,
}

impl ApiState {
    pub fn new(reader: Arc<ModbusReader>) -> Self {
        Self {
            reader,
            metrics_handle: None,
        }
    }

    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics_handle = Some(handle);
        self
    }
}

/// Create the API router
pub fn create_router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(render_metrics))
        .route("/api/devices", get(list_devices))
        .route("/api/devices/:slave", get(get_device))
        .route(
            "/api/devices/:slave/mappings/:name",
            get(get_mapping).post(write_mapping),
        )
        .with_state(Arc::new(state))
}

/// Error body returned with non-2xx responses
#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: message.into(),
        }),
    )
}

/// Health check response
#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    reader: ReaderState,
}

async fn health(State(state): State<Arc<ApiState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        reader: state.reader.state(),
    })
}

async fn render_metrics(State(state): State<Arc<ApiState>>) -> Result<String, StatusCode> {
    state
        .metrics_handle
        .as_ref()
        .map(|handle| handle.render())
        .ok_or(StatusCode::NOT_FOUND)
}

/// Device list response
#[derive(Serialize)]
struct DeviceListResponse {
    devices: Vec<DeviceSummary>,
}

#[derive(Serialize)]
struct DeviceSummary {
    name: String,
    slave_address: u8,
    status: DeviceStatus,
    mapping_count: usize,
    group_count: usize,
    last_update: Option<String>,
}

async fn list_devices(State(state): State<Arc<ApiState>>) -> Json<DeviceListResponse> {
    let devices: Vec<DeviceSummary> = state
        .reader
        .devices()
        .iter()
        .map(|device| {
            let snapshot = device.snapshot();
            let last_update = snapshot
                .iter()
                .filter_map(|m| m.updated_at)
                .max()
                .map(|t| t.to_rfc3339());

            DeviceSummary {
                name: device.name().to_string(),
                slave_address: device.slave_address(),
                status: device.status(),
                mapping_count: snapshot.len(),
                group_count: device.groups().len(),
                last_update,
            }
        })
        .collect();

    Json(DeviceListResponse { devices })
}

/// Device detail response
#[derive(Serialize)]
struct DeviceResponse {
    name: String,
    slave_address: u8,
    status: DeviceStatus,
    mappings: Vec<MappingSnapshot>,
}

fn find_device(state: &ApiState, slave: u8) -> Result<Arc<ModbusDevice>, ApiError> {
    state.reader.device(slave).ok_or_else(|| {
        api_error(
            StatusCode::NOT_FOUND,
            format!("no device with slave address {}", slave),
        )
    })
}

async fn get_device(
    State(state): State<Arc<ApiState>>,
    Path(slave): Path<u8>,
) -> Result<Json<DeviceResponse>, ApiError> {
    let device = find_device(&state, slave)?;

    Ok(Json(DeviceResponse {
        name: device.name().to_string(),
        slave_address: device.slave_address(),
        status: device.status(),
        mappings: device.snapshot(),
    }))
}

async fn get_mapping(
    State(state): State<Arc<ApiState>>,
    Path((slave, name)): Path<(u8, String)>,
) -> Result<Json<MappingSnapshot>, ApiError> {
    let device = find_device(&state, slave)?;

    device
        .snapshot_of(&name)
        .map(Json)
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, format!("no mapping named '{}'", name)))
}

#[derive(Deserialize)]
struct WriteRequest {
    value: serde_json::Value,
}

async fn write_mapping(
    State(state): State<Arc<ApiState>>,
    Path((slave, name)): Path<(u8, String)>,
    Json(request): Json<WriteRequest>,
) -> Result<Json<MappingSnapshot>, ApiError> {
    let device = find_device(&state, slave)?;
    let mapping = device
        .mapping(&name)
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, format!("no mapping named '{}'", name)))?;

    let value = value_from_json(mapping.data_type(), &request.value).ok_or_else(|| {
        api_error(
            StatusCode::BAD_REQUEST,
            format!("mapping '{}' expects a {} value", name, mapping.data_type()),
        )
    })?;

    state
        .reader
        .write(slave, &name, &value)
        .await
        .map_err(|e| {
            warn!("Write to {} on slave {} failed: {}", name, slave, e);
            api_error(write_error_status(&e), e.to_string())
        })?;

    device
        .snapshot_of(&name)
        .map(Json)
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, format!("no mapping named '{}'", name)))
}

fn write_error_status(err: &WriteError) -> StatusCode {
    match err {
        WriteError::UnknownDevice(_) | WriteError::UnknownMapping(_) => StatusCode::NOT_FOUND,
        WriteError::NotWritable { .. } | WriteError::Encode(_) => StatusCode::BAD_REQUEST,
        WriteError::Transport { .. } => StatusCode::BAD_GATEWAY,
    }
}

/// Convert a JSON value into the type a mapping expects, rejecting out-of-range numbers
fn value_from_json(data_type: DataType, json: &serde_json::Value) -> Option<Value> {
    match data_type {
        DataType::Bool => json.as_bool().map(Value::Bool),
        DataType::Int16 => json
            .as_i64()
            .and_then(|v| i16::try_from(v).ok())
            .map(Value::Int16),
        DataType::UInt16 => json
            .as_u64()
            .and_then(|v| u16::try_from(v).ok())
            .map(Value::UInt16),
        DataType::Int32 => json
            .as_i64()
            .and_then(|v| i32::try_from(v).ok())
            .map(Value::Int32),
        DataType::UInt32 => json
            .as_u64()
            .and_then(|v| u32::try_from(v).ok())
            .map(Value::UInt32),
        DataType::Float => json.as_f64().map(|v| Value::Float(v as f32)),
        DataType::String => json.as_str().map(|s| Value::String(s.to_string())),
    }
}
