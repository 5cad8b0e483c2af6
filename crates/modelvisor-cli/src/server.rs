//! Control surface and serve loop.
//!
//! The listener is torn down gracefully before a restart so the replacement
//! can bind the same address. If the replacement never answers, the
//! listener is bound again and this instance keeps serving.

use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use modelvisor_core::{ActivationOutcome, RestartOutcome};
use modelvisor_runtime::HardwareController;
use modelvisor_runtime::hardware::HEALTH_PATH;

use crate::error::HttpError;

/// Asks the serve loop to drop the listener and restart.
#[derive(Debug)]
pub struct RestartSignal {
    requested: AtomicBool,
    listener: CancellationToken,
}

impl RestartSignal {
    fn new(listener: CancellationToken) -> Self {
        Self {
            requested: AtomicBool::new(false),
            listener,
        }
    }

    pub fn request(&self) {
        self.requested.store(true, Ordering::SeqCst);
        self.listener.cancel();
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }
}

#[derive(Clone)]
struct AppState {
    hardware: Arc<HardwareController>,
    restart: Arc<RestartSignal>,
}

#[derive(Debug, Deserialize)]
struct ActivateRequest {
    gpus: Vec<i64>,
}

fn router(state: AppState) -> Router {
    Router::new()
        .route(HEALTH_PATH, get(healthz))
        .route("/v1/hardware", get(list_hardware))
        .route("/v1/hardware/activate", post(activate_hardware))
        .with_state(state)
}

async fn healthz() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn list_hardware(State(state): State<AppState>) -> Result<Json<Value>, HttpError> {
    let activated = state.hardware.inventory().await?;
    let devices = state.hardware.list().await?;
    Ok(Json(json!({
        "devices": devices,
        "activated": activated.iter().map(|r| r.software_id).collect::<Vec<_>>(),
        "restart_pending": state.hardware.is_restart_pending().await,
    })))
}

async fn activate_hardware(
    State(state): State<AppState>,
    Json(request): Json<ActivateRequest>,
) -> Result<Json<Value>, HttpError> {
    match state.hardware.set_activation(&request.gpus).await? {
        ActivationOutcome::NoChange => Ok(Json(json!({
            "message": "The hardware configuration is already up to date. No restart is required."
        }))),
        ActivationOutcome::RestartRequired(config) => {
            state.restart.request();
            Ok(Json(json!({
                "message": "The hardware configuration has been activated. The server will restart.",
                "activated_gpus": config.selected_device_indices,
            })))
        }
    }
}

/// Why [`serve`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServeExit {
    Shutdown,
    Replaced { pid: u32 },
}

/// Serve until `shutdown` is cancelled or a restart hands over to a
/// replacement instance.
pub async fn serve(
    hardware: Arc<HardwareController>,
    host: &str,
    port: u16,
    shutdown: &CancellationToken,
    quiet: bool,
) -> anyhow::Result<ServeExit> {
    loop {
        let listener = TcpListener::bind((host, port)).await?;
        let addr = listener.local_addr()?;
        if !quiet {
            println!("modelvisor listening on http://{addr}");
        }
        info!(%addr, "Control server listening");

        let restart = Arc::new(RestartSignal::new(shutdown.child_token()));
        let state = AppState {
            hardware: Arc::clone(&hardware),
            restart: Arc::clone(&restart),
        };
        axum::serve(listener, router(state))
            .with_graceful_shutdown(restart.listener.clone().cancelled_owned())
            .await?;

        if shutdown.is_cancelled() {
            return Ok(ServeExit::Shutdown);
        }
        if !restart.is_requested() {
            continue;
        }

        info!("Listener closed for restart");
        match hardware.restart(host, port).await {
            Ok(RestartOutcome::Replaced { pid }) => return Ok(ServeExit::Replaced { pid }),
            Ok(RestartOutcome::NotNeeded) => {}
            Err(e) => {
                error!(error = %e, "Restart failed");
                warn!("Re-binding the current instance");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use modelvisor_core::{ComputeDevice, DeviceKind, DeviceProbe, ProcessEnvironment};
    use modelvisor_db::{SqliteHardwareRepository, setup_test_database};
    use modelvisor_runtime::{InMemoryProcessBackend, RestartOptions, Restarter};
    use std::path::PathBuf;
    use std::time::Duration;

    struct TwoGpus;

    impl DeviceProbe for TwoGpus {
        fn enumerate(&self) -> Vec<ComputeDevice> {
            (0..2)
                .map(|i| ComputeDevice {
                    uuid: format!("GPU-{i}"),
                    name: format!("GPU {i}"),
                    kind: DeviceKind::Gpu,
                    hardware_id: i,
                    software_id: i,
                    discrete: true,
                    total_memory_mib: None,
                })
                .collect()
        }
    }

    async fn state() -> (AppState, Arc<RestartSignal>) {
        let pool = setup_test_database().await.unwrap();
        let restarter = Restarter::new(
            Arc::new(InMemoryProcessBackend::new()),
            RestartOptions::new(
                PathBuf::from("modelvisor"),
                PathBuf::from("/data"),
                PathBuf::from("/data/engines"),
            )
            .with_retry(1, Duration::from_millis(10)),
        );
        let hardware = Arc::new(HardwareController::new(
            Arc::new(SqliteHardwareRepository::new(pool)),
            Arc::new(TwoGpus),
            ProcessEnvironment::new(),
            restarter,
        ));
        let restart = Arc::new(RestartSignal::new(CancellationToken::new()));
        (
            AppState {
                hardware,
                restart: Arc::clone(&restart),
            },
            restart,
        )
    }

    async fn spawn_router(state: AppState) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router(state)).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn test_healthz() {
        let (state, _) = state().await;
        let base = spawn_router(state).await;
        let resp = reqwest::get(format!("{base}{HEALTH_PATH}")).await.unwrap();
        assert!(resp.status().is_success());
    }

    #[tokio::test]
    async fn test_activation_requests_restart_once() {
        let (state, restart) = state().await;
        let base = spawn_router(state).await;
        let client = reqwest::Client::new();

        let listing: Value = client
            .get(format!("{base}/v1/hardware"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(listing["devices"].as_array().unwrap().len(), 2);

        let resp = client
            .post(format!("{base}/v1/hardware/activate"))
            .json(&json!({ "gpus": [1] }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        assert!(restart.is_requested());
        assert!(restart.listener.is_cancelled());

        let again: Value = client
            .post(format!("{base}/v1/hardware/activate"))
            .json(&json!({ "gpus": [1] }))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert!(again["message"].as_str().unwrap().contains("No restart"));
    }

    #[tokio::test]
    async fn test_unknown_gpu_is_bad_request() {
        let (state, restart) = state().await;
        state.hardware.inventory().await.unwrap();
        let base = spawn_router(state).await;

        let resp = reqwest::Client::new()
            .post(format!("{base}/v1/hardware/activate"))
            .json(&json!({ "gpus": [42] }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["error"], "Invalid GPU index provided.");
        assert!(!restart.is_requested());
    }

    #[tokio::test]
    async fn test_serve_returns_on_shutdown() {
        let (state, _) = state().await;
        let shutdown = CancellationToken::new();
        let task = tokio::spawn({
            let shutdown = shutdown.clone();
            async move { serve(state.hardware, "127.0.0.1", 0, &shutdown, true).await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown.cancel();

        let exit = tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(exit, ServeExit::Shutdown);
    }
}
