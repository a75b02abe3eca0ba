//! 監視セッション
//!
//! 映像ワーカーと音声ワーカーを1本ずつ起動し、両方のリスクを
//! 融合エンジンへ流し込む。エンジンは Mutex で直列化され、
//! 2スレッドから同時に変更されることはない。

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Result;
use opencv::core::Mat;
use tracing::{info, warn};

use crate::audio::{KeywordDetector, SpeechEngine};
use crate::chain::{BackendChain, BackendStatus};
use crate::config::Config;
use crate::fusion::{AlertEvent, EngineState, FusionEngine, FusionError};
use crate::risk::{RiskEstimator, TimedPose};

/// リスク推定に使う姿勢履歴の長さ
const POSE_HISTORY: usize = 8;

/// フレーム供給源。カメララッパーやテスト用の合成ソースが実装する
pub trait FrameSource: Send {
    /// 次のフレーム。ストリーム終端で None
    fn next_frame(&mut self) -> Result<Option<Mat>>;
}

/// 音声チャンク供給源
pub trait AudioSource: Send {
    /// 次のPCMチャンク（モノラル f32）。ストリーム終端で None
    fn next_chunk(&mut self) -> Result<Option<Vec<f32>>>;
}

/// 発火したアラートの送り先
pub trait AlertSink: Send {
    fn deliver(&mut self, event: &AlertEvent) -> Result<()>;
}

/// 単調でない壁時計も注入できるようにしたクロック
pub type Clock = Arc<dyn Fn() -> f64 + Send + Sync>;

/// 現在時刻をエポック秒で返すデフォルトクロック
pub fn wall_clock() -> Clock {
    Arc::new(|| {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0)
    })
}

/// 実行中の監視セッション
///
/// ワーカーはソースの終端か `stop()` で停止する。処理中の1件は
/// やり切ってから止まるため、中途半端なアラートは出ない。
pub struct MonitoringSession {
    fusion: Arc<Mutex<FusionEngine>>,
    health: Arc<Mutex<Vec<BackendStatus>>>,
    stop_flag: Arc<AtomicBool>,
    health_reset: Arc<AtomicBool>,
    video_handle: Option<thread::JoinHandle<()>>,
    audio_handle: Option<thread::JoinHandle<()>>,
}

impl MonitoringSession {
    /// ワーカーを起動してセッションを開始する
    pub fn start<F, A, E, S>(
        config: Config,
        chain: BackendChain,
        frames: F,
        audio: A,
        detector: KeywordDetector<E>,
        sink: S,
        clock: Clock,
    ) -> Self
    where
        F: FrameSource + 'static,
        A: AudioSource + 'static,
        E: SpeechEngine + 'static,
        S: AlertSink + 'static,
    {
        let fusion = Arc::new(Mutex::new(FusionEngine::new(config.fusion.clone())));
        let health = Arc::new(Mutex::new(Vec::new()));
        let stop_flag = Arc::new(AtomicBool::new(false));
        let health_reset = Arc::new(AtomicBool::new(false));
        let sink: Arc<Mutex<dyn AlertSink>> = Arc::new(Mutex::new(sink));

        let video_handle = {
            let fusion = fusion.clone();
            let health = health.clone();
            let stop_flag = stop_flag.clone();
            let health_reset = health_reset.clone();
            let sink = sink.clone();
            let clock = clock.clone();
            let estimator = RiskEstimator::new(config.risk.clone());
            thread::spawn(move || {
                let worker = VideoWorker {
                    chain,
                    estimator,
                    fusion,
                    health,
                    sink,
                    stop_flag,
                    health_reset,
                    clock,
                };
                worker.run(frames);
            })
        };

        let audio_handle = {
            let fusion = fusion.clone();
            let stop_flag = stop_flag.clone();
            thread::spawn(move || {
                audio_worker(audio, detector, fusion, sink, stop_flag, clock);
            })
        };

        Self {
            fusion,
            health,
            stop_flag,
            health_reset,
            video_handle: Some(video_handle),
            audio_handle: Some(audio_handle),
        }
    }

    /// 全バックエンドの健全性ウィンドウをクリアする（操作コマンド）
    pub fn reset_backend_health(&self) {
        self.health_reset.store(true, Ordering::Release);
    }

    /// 停止を要求する。ワーカーは処理中の1件を終えてから止まる
    pub fn stop(&self) {
        self.stop_flag.store(true, Ordering::Release);
    }

    /// 停止を要求し、両ワーカーの終了を待つ
    pub fn shutdown(mut self) {
        self.stop();
        if let Some(handle) = self.video_handle.take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.audio_handle.take() {
            let _ = handle.join();
        }
        info!("monitoring session stopped");
    }

    /// ワーカーの終了を待つ（ソース終端まで動かす場合）
    pub fn join(mut self) {
        if let Some(handle) = self.video_handle.take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.audio_handle.take() {
            let _ = handle.join();
        }
    }

    /// バックエンド健全性の読み取り専用スナップショット
    pub fn health_snapshot(&self) -> Vec<BackendStatus> {
        self.health.lock().unwrap().clone()
    }

    /// 直近 n 件のアラート履歴のスナップショット
    pub fn recent_alerts(&self, n: usize) -> Vec<AlertEvent> {
        self.fusion.lock().unwrap().recent_alerts(n)
    }

    pub fn clear_alert_history(&self) {
        self.fusion.lock().unwrap().clear_history()
    }

    pub fn engine_state(&self) -> EngineState {
        self.fusion.lock().unwrap().state()
    }
}

/// 映像ワーカーの所有物一式
struct VideoWorker {
    chain: BackendChain,
    estimator: RiskEstimator,
    fusion: Arc<Mutex<FusionEngine>>,
    health: Arc<Mutex<Vec<BackendStatus>>>,
    sink: Arc<Mutex<dyn AlertSink>>,
    stop_flag: Arc<AtomicBool>,
    health_reset: Arc<AtomicBool>,
    clock: Clock,
}

impl VideoWorker {
    fn run<F: FrameSource>(mut self, mut frames: F) {
        let mut history: VecDeque<TimedPose> = VecDeque::with_capacity(POSE_HISTORY);

        while !self.stop_flag.load(Ordering::Acquire) {
            if self.health_reset.swap(false, Ordering::AcqRel) {
                self.chain.reset_health();
                info!("backend health reset by operator");
            }

            let frame = match frames.next_frame() {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(error) => {
                    warn!(%error, "frame source error, skipping frame");
                    continue;
                }
            };

            let pose = self.chain.detect(&frame);
            *self.health.lock().unwrap() = self.chain.snapshot();

            let now = (self.clock)();
            if history.len() == POSE_HISTORY {
                history.pop_front();
            }
            history.push_back(TimedPose::new(now, pose));

            let window: Vec<TimedPose> = history.iter().cloned().collect();
            let assessment = self.estimator.estimate(&window);

            let outcome = self.fusion.lock().unwrap().ingest_pose(assessment.score, now);
            deliver_if_fired(outcome, &self.sink);
        }
    }
}

fn audio_worker<A: AudioSource, E: SpeechEngine>(
    mut audio: A,
    mut detector: KeywordDetector<E>,
    fusion: Arc<Mutex<FusionEngine>>,
    sink: Arc<Mutex<dyn AlertSink>>,
    stop_flag: Arc<AtomicBool>,
    clock: Clock,
) {
    while !stop_flag.load(Ordering::Acquire) {
        let chunk = match audio.next_chunk() {
            Ok(Some(chunk)) => chunk,
            Ok(None) => break,
            Err(error) => {
                warn!(%error, "audio source error, skipping chunk");
                continue;
            }
        };

        if let Some(signal) = detector.on_audio_chunk(&chunk) {
            let now = clock();
            let outcome = fusion.lock().unwrap().ingest_audio(signal.confidence, now);
            deliver_if_fired(outcome, &sink);
        }
    }
}

fn deliver_if_fired(
    outcome: Result<Option<AlertEvent>, FusionError>,
    sink: &Arc<Mutex<dyn AlertSink>>,
) {
    match outcome {
        Ok(Some(event)) => {
            if let Err(error) = sink.lock().unwrap().deliver(&event) {
                warn!(%error, "alert sink failed");
            }
        }
        Ok(None) => {}
        // ClockSkew はエンジン側でログ済み。サンプルを捨てて続行
        Err(FusionError::ClockSkew { .. }) => {}
    }
}
