use anyhow::{Context, Result};
use rollcall_core::{CommandEncoder, DistanceMatcher, FaceEncoder, NoEncoder};
use rollcall_hw::{FeedbackSink, NullSink, SerialSink, SignalMap, V4lOpener};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod api;
mod config;
mod db;
mod engine;
mod ledger;
mod signaler;
mod status;
mod store;
#[cfg(test)]
mod testing;

use config::Config;
use engine::{LoopDeps, LoopPhase};
use ledger::{AttendanceLedger, SqliteLedger};
use signaler::HardwareSignaler;
use status::StatusAggregator;
use store::EncodingStore;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "rollcalld starting");

    let config = Config::from_env()?;
    tracing::info!(
        db = %config.db_path.display(),
        camera = %config.camera_device,
        threshold = config.match_threshold,
        metric = ?config.distance_metric,
        timezone = ?config.timezone,
        "configuration loaded"
    );

    let store = Arc::new(
        EncodingStore::open(db::open(&config.db_path, config.busy_timeout())?, config.encoding_dim)
            .context("failed to load identities")?,
    );
    let ledger: Arc<dyn AttendanceLedger> =
        Arc::new(SqliteLedger::new(db::open(&config.db_path, config.busy_timeout())?));

    let signal_map = match &config.signal_map {
        Some(path) => SignalMap::load(path)
            .with_context(|| format!("failed to load signal map {}", path.display()))?,
        None => SignalMap::default(),
    };
    let sink: Box<dyn FeedbackSink> = match &config.feedback_device {
        Some(device) => {
            tracing::info!(device = %device, baud = config.feedback_baud, "feedback board enabled");
            Box::new(SerialSink::new(device.clone(), config.feedback_baud))
        }
        None => {
            tracing::info!("feedback board disabled");
            Box::new(NullSink)
        }
    };
    let (signaler, _feedback_thread) =
        HardwareSignaler::spawn(sink, signal_map, config.feedback_queue)
            .context("failed to spawn feedback thread")?;

    let encoder: Box<dyn FaceEncoder> = match &config.encoder_cmd {
        Some(cmd) => {
            let encoder = CommandEncoder::from_command_line(cmd)?.with_timeout(config.encoder_timeout);
            tracing::info!(
                program = %encoder.program(),
                timeout_ms = config.encoder_timeout.as_millis() as u64,
                "face encoder configured"
            );
            Box::new(encoder)
        }
        None => {
            tracing::warn!("ROLLCALL_ENCODER_CMD not set; recognition will report encoder errors");
            Box::new(NoEncoder)
        }
    };

    let deps = LoopDeps {
        opener: Box::new(V4lOpener::new(
            config.camera_device.clone(),
            config.frame_timeout,
        )),
        encoder,
        matcher: Box::new(DistanceMatcher::new(
            config.distance_metric,
            config.match_threshold,
        )),
        store: Arc::clone(&store),
        ledger: Arc::clone(&ledger),
        signaler: signaler.clone(),
        clock: config.timezone,
    };
    let (controller, _loop_thread) =
        engine::spawn_loop(deps, config.loop_settings()).context("failed to spawn recognition thread")?;

    if config.autostart {
        let state = controller.start().await?;
        if state.phase != LoopPhase::Running {
            tracing::warn!(state = ?state.phase, error = ?state.last_error, "autostart did not reach running");
        }
    }

    let status = StatusAggregator::new(
        controller.clone(),
        Arc::clone(&ledger),
        Arc::clone(&store),
        signaler,
        config.timezone,
    );
    let app = api::router(api::AppState {
        store,
        ledger,
        controller: controller.clone(),
        status,
        clock: config.timezone,
        enroll_samples: config.enroll_samples,
    });

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr))?;
    tracing::info!(addr = %config.listen_addr, "rollcalld ready");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("rollcalld shutting down");
        })
        .await
        .context("HTTP server error")?;

    // Let the in-flight frame finish before the process exits.
    controller.stop().await?;
    Ok(())
}
