use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use mimamori_guard::audio::{KeywordDetector, SpeechEngine};
use mimamori_guard::backend::{
    CloudAcceleratedBackend, GeometricBackend, LocalModelBackend, PoseBackend, SimulatedBackend,
};
use mimamori_guard::camera::OpenCvCamera;
use mimamori_guard::chain::BackendChain;
use mimamori_guard::config::Config;
use mimamori_guard::fusion::AlertEvent;
use mimamori_guard::monitor::{wall_clock, AlertSink, AudioSource, MonitoringSession};

const CONFIG_PATH: &str = "config.toml";
const ALERT_LOG_PATH: &str = "alerts.jsonl";

/// アラートをJSON Linesで追記するシンク
struct JsonlSink {
    file: std::fs::File,
}

impl JsonlSink {
    fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path.as_ref())
            .context("Failed to open alert log")?;
        Ok(Self { file })
    }
}

impl AlertSink for JsonlSink {
    fn deliver(&mut self, event: &AlertEvent) -> Result<()> {
        let line = serde_json::to_string(event)?;
        writeln!(self.file, "{}", line)?;
        Ok(())
    }
}

/// 音声認識モデル未設定時のプレースホルダ。音声監視は無効になる
struct DisabledMicrophone;

impl AudioSource for DisabledMicrophone {
    fn next_chunk(&mut self) -> Result<Option<Vec<f32>>> {
        Ok(None)
    }
}

struct NoSpeechEngine;

impl SpeechEngine for NoSpeechEngine {
    fn transcribe(&mut self, _samples: &[f32]) -> Result<String> {
        Ok(String::new())
    }
}

/// 利用可能なバックエンドを優先順に組み立てる
fn build_backends(config: &Config) -> Vec<Box<dyn PoseBackend>> {
    let mut backends: Vec<Box<dyn PoseBackend>> = Vec::new();

    if Path::new(&config.models.cloud_model).exists() {
        match CloudAcceleratedBackend::new(&config.models.cloud_model) {
            Ok(backend) => {
                info!(model = config.models.cloud_model.as_str(), "cloud-accelerated backend ready");
                backends.push(Box::new(backend));
            }
            Err(error) => warn!(%error, "cloud-accelerated backend unavailable"),
        }
    } else {
        info!(model = config.models.cloud_model.as_str(), "cloud model not found, skipping");
    }

    if Path::new(&config.models.local_model).exists() {
        match LocalModelBackend::new(&config.models.local_model) {
            Ok(backend) => {
                info!(model = config.models.local_model.as_str(), "local model backend ready");
                backends.push(Box::new(backend));
            }
            Err(error) => warn!(%error, "local model backend unavailable"),
        }
    } else {
        info!(model = config.models.local_model.as_str(), "local model not found, skipping");
    }

    backends.push(Box::new(GeometricBackend::new()));
    backends.push(Box::new(SimulatedBackend::new()));
    backends
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!(version = env!("GIT_VERSION"), "fall monitor starting");
    let config = Config::load_or_default(CONFIG_PATH);

    let backends = build_backends(&config);
    info!(count = backends.len(), "backend chain assembled");
    let chain = BackendChain::new(backends, config.chain.clone());

    let camera = OpenCvCamera::open(0)?;
    let (width, height) = camera.resolution();
    info!(width, height, "camera opened");

    let detector = KeywordDetector::new(NoSpeechEngine, &config.audio);
    info!("audio keyword detection disabled (no speech engine configured)");

    let sink = JsonlSink::open(ALERT_LOG_PATH)?;
    info!(path = ALERT_LOG_PATH, "alert log ready");

    let session = MonitoringSession::start(
        config,
        chain,
        camera,
        DisabledMicrophone,
        detector,
        sink,
        wall_clock(),
    );

    // カメラが止まるまで監視を続ける
    session.join();
    Ok(())
}
