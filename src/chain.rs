//! バックエンドチェーンの制御
//!
//! 優先順位と健全性に基づいてバックエンドを順に試し、最初に
//! 信頼度の出た結果を返す。全滅してもフレームを落とさず、
//! ベストエフォート結果か合成ポーズを返す。

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::backend::completion::synthesize_default_pose;
use crate::backend::{DetectError, PoseBackend};
use crate::config::ChainConfig;
use crate::landmark::{BackendId, PoseResult};

/// 直近ウィンドウの成功率から導く健全性
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    /// まだ一度も試行していない
    Untried,
    /// 成功率が閾値以上
    Healthy,
    /// 成功率が中間帯
    Degraded,
    /// 成功率が下限未満。定期的な再試行以外はスキップ
    Disabled,
}

impl HealthState {
    /// 並べ替え用の順位。Untried は Healthy と同格に扱う
    fn rank(self) -> u8 {
        match self {
            HealthState::Untried | HealthState::Healthy => 0,
            HealthState::Degraded => 1,
            HealthState::Disabled => 2,
        }
    }
}

/// バックエンド1つ分の健全性トラッキング
struct BackendHealth {
    window: VecDeque<(bool, f32)>,
    window_size: usize,
    healthy_rate: f32,
    disabled_rate: f32,
    /// 累積試行数（ウィンドウ外も含む）
    total_attempts: u64,
    total_successes: u64,
    total_latency_ms: f64,
    /// Disabled 中にスキップした回数
    skips_while_disabled: u32,
}

impl BackendHealth {
    fn new(config: &ChainConfig) -> Self {
        Self {
            window: VecDeque::with_capacity(config.health_window),
            window_size: config.health_window,
            healthy_rate: config.healthy_rate,
            disabled_rate: config.disabled_rate,
            total_attempts: 0,
            total_successes: 0,
            total_latency_ms: 0.0,
            skips_while_disabled: 0,
        }
    }

    fn record(&mut self, success: bool, latency_ms: f32) {
        if self.window.len() == self.window_size {
            self.window.pop_front();
        }
        self.window.push_back((success, latency_ms));
        self.total_attempts += 1;
        if success {
            self.total_successes += 1;
        }
        self.total_latency_ms += latency_ms as f64;
        self.skips_while_disabled = 0;
    }

    fn success_rate(&self) -> f32 {
        if self.window.is_empty() {
            return 0.0;
        }
        let successes = self.window.iter().filter(|(ok, _)| *ok).count();
        successes as f32 / self.window.len() as f32
    }

    fn state(&self) -> HealthState {
        if self.window.is_empty() {
            return HealthState::Untried;
        }
        let rate = self.success_rate();
        if rate >= self.healthy_rate {
            HealthState::Healthy
        } else if rate < self.disabled_rate {
            HealthState::Disabled
        } else {
            HealthState::Degraded
        }
    }

    fn average_latency_ms(&self) -> f32 {
        if self.total_attempts == 0 {
            return 0.0;
        }
        (self.total_latency_ms / self.total_attempts as f64) as f32
    }

    fn reset(&mut self) {
        self.window.clear();
        self.skips_while_disabled = 0;
    }
}

/// 健全性スナップショット（監視・ログ出力用）
#[derive(Debug, Clone, Serialize)]
pub struct BackendStatus {
    pub id: BackendId,
    pub state: HealthState,
    pub success_rate: f32,
    pub attempts: u64,
    pub successes: u64,
    pub average_latency_ms: f32,
}

/// 複数バックエンドを束ねるチェーンコントローラ
pub struct BackendChain {
    backends: Vec<Box<dyn PoseBackend>>,
    health: Vec<BackendHealth>,
    config: ChainConfig,
    /// 指定時はこのバックエンドのみ使う（診断用）
    pinned: Option<BackendId>,
}

impl BackendChain {
    pub fn new(backends: Vec<Box<dyn PoseBackend>>, config: ChainConfig) -> Self {
        let health = backends.iter().map(|_| BackendHealth::new(&config)).collect();
        Self {
            backends,
            health,
            config,
            pinned: None,
        }
    }

    /// 診断用にバックエンドを固定する。None で解除
    pub fn pin_backend(&mut self, id: Option<BackendId>) {
        self.pinned = id;
    }

    /// 試行順を決める。健全な順、同格なら設定の優先順
    fn attempt_order(&mut self) -> Vec<usize> {
        let preference_rank = |id: BackendId| -> usize {
            self.config
                .backend_preference
                .iter()
                .position(|&p| p == id)
                .unwrap_or(usize::MAX)
        };

        let mut order: Vec<usize> = Vec::with_capacity(self.backends.len());
        for i in 0..self.backends.len() {
            let id = self.backends[i].id();
            if let Some(pinned) = self.pinned {
                if id != pinned {
                    continue;
                }
                order.push(i);
                continue;
            }
            if self.health[i].state() == HealthState::Disabled {
                // Disabled はN回に1回だけ再試行して回復を検知する
                self.health[i].skips_while_disabled += 1;
                if self.health[i].skips_while_disabled < self.config.disabled_retry_interval {
                    continue;
                }
            }
            order.push(i);
        }

        order.sort_by_key(|&i| {
            (
                self.health[i].state().rank(),
                preference_rank(self.backends[i].id()),
            )
        });
        order
    }

    /// 1フレーム分の姿勢検出
    ///
    /// 決して失敗しない。採用基準を満たす結果がなければ最善の
    /// 候補を `best_effort` 付きで、候補すらなければ合成ポーズを返す。
    pub fn detect(&mut self, frame: &opencv::core::Mat) -> PoseResult {
        let timeout = Duration::from_millis(self.config.backend_timeout_ms);
        let mut best: Option<PoseResult> = None;

        for i in self.attempt_order() {
            let id = self.backends[i].id();
            let started = Instant::now();
            let deadline = started + timeout;
            let outcome = self.backends[i].detect(frame, deadline);
            let latency = started.elapsed();
            let latency_ms = latency.as_secs_f32() * 1000.0;

            let candidate = match outcome {
                Ok(results) => {
                    let top = results
                        .into_iter()
                        .max_by(|a, b| {
                            a.overall_confidence
                                .partial_cmp(&b.overall_confidence)
                                .unwrap_or(std::cmp::Ordering::Equal)
                        });
                    // 返答が遅すぎた場合は結果があっても失敗扱い
                    if latency > timeout {
                        warn!(backend = id.name(), latency_ms, "backend exceeded time budget");
                        self.record(i, false, latency_ms);
                        top
                    } else {
                        match top {
                            Some(pose) => {
                                let accepted =
                                    pose.overall_confidence >= self.config.min_accept_confidence;
                                self.record(i, accepted, latency_ms);
                                if accepted {
                                    debug!(
                                        backend = id.name(),
                                        confidence = pose.overall_confidence,
                                        latency_ms,
                                        "pose accepted"
                                    );
                                    return pose;
                                }
                                Some(pose)
                            }
                            None => {
                                self.record(i, false, latency_ms);
                                None
                            }
                        }
                    }
                }
                Err(error) => {
                    match error {
                        DetectError::Timeout => {
                            warn!(backend = id.name(), latency_ms, "backend timed out")
                        }
                        DetectError::NoSignal => {
                            debug!(backend = id.name(), "backend found no pose")
                        }
                    }
                    self.record(i, false, latency_ms);
                    None
                }
            };

            if let Some(pose) = candidate {
                let better = best
                    .as_ref()
                    .map_or(true, |b| pose.overall_confidence > b.overall_confidence);
                if better {
                    best = Some(pose);
                }
            }
        }

        match best {
            Some(mut pose) => {
                pose.best_effort = true;
                warn!(
                    backend = pose.source_backend.name(),
                    confidence = pose.overall_confidence,
                    "chain exhausted, returning best-effort pose"
                );
                pose
            }
            None => {
                warn!("chain exhausted with no candidate, synthesizing default pose");
                let mut pose = PoseResult::new(
                    synthesize_default_pose((0.5, 0.5)),
                    0.0,
                    BackendId::Simulated,
                );
                pose.best_effort = true;
                pose
            }
        }
    }

    fn record(&mut self, index: usize, success: bool, latency_ms: f32) {
        let before = self.health[index].state();
        self.health[index].record(success, latency_ms);
        let after = self.health[index].state();
        if before != after {
            info!(
                backend = self.backends[index].id().name(),
                from = ?before,
                to = ?after,
                success_rate = self.health[index].success_rate(),
                "backend health transition"
            );
        }
    }

    /// 全バックエンドの健全性スナップショット
    pub fn snapshot(&self) -> Vec<BackendStatus> {
        self.backends
            .iter()
            .zip(self.health.iter())
            .map(|(backend, health)| BackendStatus {
                id: backend.id(),
                state: health.state(),
                success_rate: health.success_rate(),
                attempts: health.total_attempts,
                successes: health.total_successes,
                average_latency_ms: health.average_latency_ms(),
            })
            .collect()
    }

    /// 健全性ウィンドウをクリアして全バックエンドを Untried に戻す
    pub fn reset_health(&mut self) {
        for health in self.health.iter_mut() {
            health.reset();
        }
    }
}
