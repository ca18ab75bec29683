// Volume-plugin HTTP protocol
//
// Every verb is a POST with a JSON body; failures travel in the `Err` field
// of the response and are also flagged with a 500 status.

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use tower_http::trace::TraceLayer;

use super::protocol::{
    Capability, Handshake, PLUGIN_CONTENT_TYPE, PluginResponse, Volume, VolumeRequest,
};
use crate::driver::VolumeDriver;
use crate::metrics::PluginMetrics;
use crate::reconciler::Reconciler;

#[derive(Clone)]
pub struct PluginState {
    pub driver: Arc<VolumeDriver>,
    pub reconciler: Arc<Reconciler>,
    pub metrics: Option<Arc<PluginMetrics>>,
}

pub fn router(state: PluginState) -> Router {
    Router::new()
        .route("/Plugin.Activate", post(activate))
        .route("/VolumeDriver.Create", post(create))
        .route("/VolumeDriver.Remove", post(remove))
        .route("/VolumeDriver.Mount", post(mount))
        .route("/VolumeDriver.Unmount", post(unmount))
        .route("/VolumeDriver.Path", post(path))
        .route("/VolumeDriver.Get", post(get))
        .route("/VolumeDriver.List", post(list))
        .route("/VolumeDriver.Capabilities", post(capabilities))
        .route("/VolumeDriver.Attach", post(attach))
        .route("/VolumeDriver.Detach", post(detach))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn encode<T: serde::Serialize>(status: StatusCode, body: &T) -> Response {
    match serde_json::to_vec(body) {
        Ok(bytes) => (status, [(header::CONTENT_TYPE, PLUGIN_CONTENT_TYPE)], bytes).into_response(),
        Err(e) => {
            tracing::error!(error = %e, "Failed to encode response");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// An empty body is an empty request; some verbs are sent without one.
fn decode(body: &[u8]) -> Result<VolumeRequest, serde_json::Error> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(VolumeRequest::default());
    }
    serde_json::from_slice(body)
}

fn is_query(verb: &str) -> bool {
    matches!(verb, "get" | "list" | "path" | "capabilities")
}

async fn dispatch<F, Fut>(state: PluginState, verb: &'static str, body: Bytes, handler: F) -> Response
where
    F: FnOnce(PluginState, VolumeRequest) -> Fut,
    Fut: Future<Output = PluginResponse>,
{
    let started = Instant::now();

    let (name, response) = match decode(&body) {
        Ok(request) => {
            if is_query(verb) {
                tracing::debug!(name = %request.name, "{verb}.request");
            } else {
                tracing::info!(name = %request.name, options = ?request.opts, container = %request.id, "{verb}.request");
            }
            let name = request.name.clone();
            (name, handler(state.clone(), request).await)
        }
        Err(e) => (String::new(), PluginResponse::error(format!("Failed to decode request: {e}"))),
    };

    if response.is_err() {
        tracing::error!(name = %name, error = %response.err, "{verb}.response");
    } else if is_query(verb) {
        tracing::debug!(name = %name, "{verb}.response");
    } else {
        tracing::info!(name = %name, mountpoint = %response.mountpoint, "{verb}.response");
    }

    if let Some(metrics) = &state.metrics {
        metrics.record_request(verb, started.elapsed().as_secs_f64(), !response.is_err());
    }

    let status = if response.is_err() { StatusCode::INTERNAL_SERVER_ERROR } else { StatusCode::OK };
    encode(status, &response)
}

/// Records whose names cannot be mounted are still listed, without a mountpoint.
fn mountpoint_of(driver: &VolumeDriver, name: &str) -> String {
    driver.path(name).map(|path| path.to_string_lossy().into_owned()).unwrap_or_default()
}

fn empty_or_error<E: std::fmt::Display>(result: Result<(), E>) -> PluginResponse {
    match result {
        Ok(()) => PluginResponse::default(),
        Err(e) => PluginResponse::error(e),
    }
}

async fn activate() -> Response {
    encode(StatusCode::OK, &Handshake::default())
}

async fn create(State(state): State<PluginState>, body: Bytes) -> Response {
    dispatch(state, "create", body, |state, request| async move {
        empty_or_error(state.driver.create(&request.name, request.opts.unwrap_or_default()).await)
    })
    .await
}

async fn remove(State(state): State<PluginState>, body: Bytes) -> Response {
    dispatch(state, "remove", body, |state, request| async move {
        empty_or_error(state.driver.remove(&request.name).await)
    })
    .await
}

async fn mount(State(state): State<PluginState>, body: Bytes) -> Response {
    dispatch(state, "mount", body, |state, request| async move {
        match state.driver.mount(&request.name).await {
            Ok(path) => PluginResponse::mountpoint(path.to_string_lossy()),
            Err(e) => PluginResponse::error(e),
        }
    })
    .await
}

async fn unmount(State(state): State<PluginState>, body: Bytes) -> Response {
    dispatch(state, "unmount", body, |state, request| async move {
        state.driver.unmount(&request.name);
        PluginResponse::default()
    })
    .await
}

async fn path(State(state): State<PluginState>, body: Bytes) -> Response {
    dispatch(state, "path", body, |state, request| async move {
        match state.driver.path(&request.name) {
            Ok(path) => PluginResponse::mountpoint(path.to_string_lossy()),
            Err(e) => PluginResponse::error(e),
        }
    })
    .await
}

async fn get(State(state): State<PluginState>, body: Bytes) -> Response {
    dispatch(state, "get", body, |state, request| async move {
        match state.driver.get(&request.name).await {
            Ok(record) => {
                let mountpoint = mountpoint_of(&state.driver, &record.name);
                PluginResponse {
                    volume: Some(Volume::from_record(&record, mountpoint)),
                    ..Default::default()
                }
            }
            Err(e) => PluginResponse::error(e),
        }
    })
    .await
}

async fn list(State(state): State<PluginState>, body: Bytes) -> Response {
    dispatch(state, "list", body, |state, _request| async move {
        match state.driver.list().await {
            Ok(records) => {
                let volumes = records
                    .iter()
                    .map(|record| Volume::from_record(record, mountpoint_of(&state.driver, &record.name)))
                    .collect();
                PluginResponse { volumes: Some(volumes), ..Default::default() }
            }
            Err(e) => PluginResponse::error(e),
        }
    })
    .await
}

async fn capabilities(State(state): State<PluginState>, body: Bytes) -> Response {
    dispatch(state, "capabilities", body, |state, _request| async move {
        PluginResponse {
            capabilities: Some(Capability { scope: state.driver.capabilities().to_string() }),
            ..Default::default()
        }
    })
    .await
}

async fn attach(State(state): State<PluginState>, body: Bytes) -> Response {
    dispatch(state, "attach", body, |state, request| async move {
        empty_or_error(state.driver.attach(&request.name).await.map(|_| ()))
    })
    .await
}

async fn detach(State(state): State<PluginState>, body: Bytes) -> Response {
    dispatch(state, "detach", body, |state, request| async move {
        let target = match state.driver.path(&request.name) {
            Ok(target) => target,
            Err(e) => return PluginResponse::error(e),
        };
        match state.reconciler.release(&target).await {
            Ok(released) => {
                tracing::debug!(name = %request.name, released, "Detach handled");
                PluginResponse::default()
            }
            Err(e) => PluginResponse::error(e),
        }
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_empty_body() {
        assert_eq!(decode(b"").unwrap(), VolumeRequest::default());
        assert_eq!(decode(b" \n").unwrap(), VolumeRequest::default());
        assert_eq!(decode(b"{}").unwrap(), VolumeRequest::default());
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(decode(b"{\"Name\":").is_err());
        assert!(decode(b"[1,2]").is_err());
    }

    #[test]
    fn test_query_verbs() {
        assert!(is_query("get"));
        assert!(is_query("capabilities"));
        assert!(!is_query("mount"));
        assert!(!is_query("detach"));
    }
}
