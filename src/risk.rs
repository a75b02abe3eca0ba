//! 姿勢からの転倒リスク推定
//!
//! 体幹の傾斜角と腰中点の下降速度から 0.0〜1.0 のスカラーを出す。
//! 両成分を個別に上限で抑えてから合算するため、どちらか片方が
//! スコアを支配することはない。

use serde::Serialize;

use crate::config::RiskConfig;
use crate::landmark::{LandmarkIndex, PoseResult};

/// タイムスタンプ付き検出結果。履歴ウィンドウの要素
#[derive(Debug, Clone)]
pub struct TimedPose {
    /// エポック秒
    pub timestamp: f64,
    pub pose: PoseResult,
}

impl TimedPose {
    pub fn new(timestamp: f64, pose: PoseResult) -> Self {
        Self { timestamp, pose }
    }

    fn hip_midpoint(&self, threshold: f32) -> Option<(f32, f32)> {
        self.pose
            .midpoint(LandmarkIndex::LeftHip, LandmarkIndex::RightHip, threshold)
    }
}

/// スコア帯の分類。外部シンクでの表示・通知の出し分けに使う
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Moderate,
    High,
    Critical,
}

impl RiskLevel {
    pub fn from_score(score: f32) -> Self {
        if score >= 0.85 {
            RiskLevel::Critical
        } else if score >= 0.6 {
            RiskLevel::High
        } else if score >= 0.3 {
            RiskLevel::Moderate
        } else {
            RiskLevel::Low
        }
    }
}

/// 推定の内訳付き結果
#[derive(Debug, Clone)]
pub struct RiskAssessment {
    /// 合算・減衰後の最終スコア (0.0〜1.0)
    pub score: f32,
    pub level: RiskLevel,
    /// 体幹の鉛直からの傾斜角（度）
    pub tilt_angle_deg: f32,
    /// 腰中点の下降速度（正規化座標/秒、下向きが正）
    pub downward_velocity: f32,
    pub angle_component: f32,
    pub velocity_component: f32,
}

impl RiskAssessment {
    fn zero() -> Self {
        Self {
            score: 0.0,
            level: RiskLevel::Low,
            tilt_angle_deg: 0.0,
            downward_velocity: 0.0,
            angle_component: 0.0,
            velocity_component: 0.0,
        }
    }
}

/// 転倒リスク推定器。状態を持たない純関数の束
pub struct RiskEstimator {
    config: RiskConfig,
}

impl RiskEstimator {
    pub fn new(config: RiskConfig) -> Self {
        Self { config }
    }

    /// 履歴ウィンドウからリスクを推定する
    ///
    /// `history` は時刻昇順。最新の検出の信頼度が閾値未満の場合、
    /// スコアをその信頼度で減衰させる。低信頼の検出だけで
    /// 高リスクアラートを出させないため。
    pub fn estimate(&self, history: &[TimedPose]) -> RiskAssessment {
        let Some(latest) = history.last() else {
            return RiskAssessment::zero();
        };

        let tilt_angle_deg = self.tilt_angle(&latest.pose).unwrap_or(0.0);
        let angle_component = self.angle_component(tilt_angle_deg);

        let downward_velocity = self.hip_velocity(history).unwrap_or(0.0);
        let velocity_component = self.velocity_component(downward_velocity);

        let mut score = (angle_component + velocity_component).clamp(0.0, 1.0);
        let confidence = latest.pose.overall_confidence;
        if confidence < self.config.damping_confidence {
            score *= confidence;
        }

        RiskAssessment {
            score,
            level: RiskLevel::from_score(score),
            tilt_angle_deg,
            downward_velocity,
            angle_component,
            velocity_component,
        }
    }

    /// 肩中点→腰中点ベクトルの鉛直からの傾き（度）
    fn tilt_angle(&self, pose: &PoseResult) -> Option<f32> {
        let threshold = self.config.visibility_threshold;
        let (sx, sy) = pose.midpoint(
            LandmarkIndex::LeftShoulder,
            LandmarkIndex::RightShoulder,
            threshold,
        )?;
        let (hx, hy) = pose.midpoint(LandmarkIndex::LeftHip, LandmarkIndex::RightHip, threshold)?;

        // 画像座標はyが下向き。直立なら dy > 0、横倒れなら dx が支配的
        let dx = (hx - sx).abs();
        let dy = (hy - sy).abs();
        Some(dx.atan2(dy).to_degrees())
    }

    /// 閾値〜飽和角を 0〜1 に正規化し、重みを掛ける
    fn angle_component(&self, angle_deg: f32) -> f32 {
        let span = self.config.angle_saturation_deg - self.config.angle_threshold_deg;
        if span <= 0.0 {
            return 0.0;
        }
        let normalized = ((angle_deg - self.config.angle_threshold_deg) / span).clamp(0.0, 1.0);
        normalized * self.config.angle_weight
    }

    /// ウィンドウ両端の腰中点から下降速度を求める
    fn hip_velocity(&self, history: &[TimedPose]) -> Option<f32> {
        let threshold = self.config.visibility_threshold;
        let mut points = history
            .iter()
            .filter_map(|t| t.hip_midpoint(threshold).map(|(_, y)| (t.timestamp, y)));
        let first = points.next()?;
        let last = points.last()?;

        let dt = last.0 - first.0;
        if dt <= 0.0 {
            return None;
        }
        // 下向き（y増加）のみリスクとして扱う
        Some(((last.1 - first.1) as f64 / dt).max(0.0) as f32)
    }

    fn velocity_component(&self, velocity: f32) -> f32 {
        let span = self.config.velocity_saturation - self.config.velocity_floor;
        if span <= 0.0 {
            return 0.0;
        }
        let normalized = ((velocity - self.config.velocity_floor) / span).clamp(0.0, 1.0);
        normalized * self.config.velocity_weight
    }
}
