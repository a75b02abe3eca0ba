//! 視覚・音声リスクの融合とアラート判定
//!
//! 両モダリティのリスクを統合し、閾値超過でアラートを発火する。
//! 同種アラートはクールダウン間隔内では再発火しない。エンジンの
//! 状態は単一のセッションが所有し、プロセスグローバルにはしない。

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::FusionConfig;

/// アラートに添付する直近サンプル数
const SUPPORTING_SAMPLES: usize = 8;

/// 融合エンジンへの入力1件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskSample {
    /// エポック秒
    pub timestamp: f64,
    pub pose_risk: f32,
    pub audio_risk: f32,
}

/// アラートの種別
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    /// 視覚リスクが支配的で、音声は閾値未満
    Fall,
    /// 重み付け後の音声リスクが視覚を上回る
    Distress,
    /// 視覚が支配的だが音声も同ティックで閾値を超えている
    Combined,
}

impl AlertKind {
    const COUNT: usize = 3;

    fn index(self) -> usize {
        match self {
            AlertKind::Fall => 0,
            AlertKind::Distress => 1,
            AlertKind::Combined => 2,
        }
    }

    /// 外部シンク向けの定型メッセージ
    pub fn message(self) -> &'static str {
        match self {
            AlertKind::Fall => "Fall detected by pose analysis",
            AlertKind::Distress => "Distress call detected",
            AlertKind::Combined => "Fall detected with simultaneous distress call",
        }
    }
}

/// 発火したアラート。生成後は不変で、外部シンクへそのまま渡せる
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertEvent {
    pub timestamp: f64,
    pub kind: AlertKind,
    /// 発火時点の統合リスク
    pub confidence: f32,
    pub message: String,
    /// 発火直前の文脈となるサンプル（新しい順ではなく時刻昇順）
    pub supporting_samples: Vec<RiskSample>,
}

/// 融合エンジンの状態
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    /// 最初のサンプルを受け取る前
    Idle,
    /// 通常の監視状態
    Armed,
    /// 直近のアラートからクールダウン間隔内
    Cooldown,
}

#[derive(Debug, Error, Clone, Copy, PartialEq)]
pub enum FusionError {
    /// 許容を超えて過去に遡ったタイムスタンプ。サンプルは破棄される
    #[error("sample timestamp {timestamp:.3} regressed behind {last:.3} beyond tolerance")]
    ClockSkew { timestamp: f64, last: f64 },
}

/// 視覚・音声リスクの融合エンジン
///
/// 状態の変更は `ingest` 系の呼び出しのみ。複数ワーカーから使う
/// 場合は呼び出し側で直列化する（セッションが Mutex で包む）。
pub struct FusionEngine {
    config: FusionConfig,
    samples: VecDeque<RiskSample>,
    history: VecDeque<AlertEvent>,
    /// 処理済みサンプルの最新タイムスタンプ
    last_timestamp: Option<f64>,
    /// 種別ごとの最終発火時刻
    last_emitted: [Option<f64>; AlertKind::COUNT],
    /// 反対モダリティの補完用に覚えておく直近値
    last_pose: Option<(f64, f32)>,
    last_audio: Option<(f64, f32)>,
}

impl FusionEngine {
    pub fn new(config: FusionConfig) -> Self {
        Self {
            config,
            samples: VecDeque::new(),
            history: VecDeque::new(),
            last_timestamp: None,
            last_emitted: [None; AlertKind::COUNT],
            last_pose: None,
            last_audio: None,
        }
    }

    /// 両モダリティのリスクを1ティック分取り込む
    ///
    /// 統合リスクは `max(pose_risk, audio_risk * audio_weight)`。
    /// 重み付け後も音声が視覚を上回れば `Distress`。視覚優位の
    /// ときは `Fall`、ただし音声も同ティックで閾値を超えていれば
    /// 同時トリガーとして `Combined` を1件だけ出す。
    pub fn ingest(
        &mut self,
        pose_risk: f32,
        audio_risk: f32,
        now: f64,
    ) -> Result<Option<AlertEvent>, FusionError> {
        let effective = self.check_timestamp(now)?;

        let pose_risk = pose_risk.clamp(0.0, 1.0);
        let audio_risk = audio_risk.clamp(0.0, 1.0);
        self.record_sample(RiskSample {
            timestamp: effective,
            pose_risk,
            audio_risk,
        });

        let weighted_audio = audio_risk * self.config.audio_weight;
        let combined = pose_risk.max(weighted_audio);
        if combined < self.config.alert_threshold {
            return Ok(None);
        }

        let kind = if weighted_audio > pose_risk {
            AlertKind::Distress
        } else if weighted_audio >= self.config.alert_threshold {
            AlertKind::Combined
        } else {
            AlertKind::Fall
        };

        if let Some(last) = self.last_emitted[kind.index()] {
            if effective - last < self.config.cooldown_seconds as f64 {
                debug!(
                    kind = ?kind,
                    since_last = effective - last,
                    "alert suppressed by cooldown"
                );
                return Ok(None);
            }
        }

        self.last_emitted[kind.index()] = Some(effective);
        let event = AlertEvent {
            timestamp: effective,
            kind,
            confidence: combined,
            message: kind.message().to_string(),
            supporting_samples: self
                .samples
                .iter()
                .rev()
                .take(SUPPORTING_SAMPLES)
                .rev()
                .cloned()
                .collect(),
        };
        info!(
            kind = ?kind,
            confidence = combined,
            timestamp = effective,
            "alert fired"
        );

        if self.config.history_capacity > 0 {
            while self.history.len() >= self.config.history_capacity {
                self.history.pop_front();
            }
            self.history.push_back(event.clone());
        }
        Ok(Some(event))
    }

    /// 視覚ワーカーからの取り込み。音声は覚えている直近値で補完する
    pub fn ingest_pose(
        &mut self,
        pose_risk: f32,
        now: f64,
    ) -> Result<Option<AlertEvent>, FusionError> {
        self.last_pose = Some((now, pose_risk));
        let audio = self.fresh_value(self.last_audio, now);
        self.ingest(pose_risk, audio, now)
    }

    /// 音声ワーカーからの取り込み。視覚は覚えている直近値で補完する
    pub fn ingest_audio(
        &mut self,
        audio_risk: f32,
        now: f64,
    ) -> Result<Option<AlertEvent>, FusionError> {
        self.last_audio = Some((now, audio_risk));
        let pose = self.fresh_value(self.last_pose, now);
        self.ingest(pose, audio_risk, now)
    }

    /// 新鮮な間だけ反対モダリティの値を使う。古ければ 0.0
    fn fresh_value(&self, remembered: Option<(f64, f32)>, now: f64) -> f32 {
        match remembered {
            Some((at, value)) if now - at <= self.config.modality_freshness as f64 => value,
            _ => 0.0,
        }
    }

    /// 逆行タイムスタンプの検査
    ///
    /// 許容内の小さな逆行は最新時刻に丸めてバッファの時刻順を守る。
    /// 許容超過は破棄してエラーを返す。
    fn check_timestamp(&mut self, now: f64) -> Result<f64, FusionError> {
        let effective = match self.last_timestamp {
            Some(last) if now < last => {
                if last - now > self.config.clock_skew_tolerance as f64 {
                    warn!(timestamp = now, last, "sample dropped for clock skew");
                    return Err(FusionError::ClockSkew { timestamp: now, last });
                }
                last
            }
            _ => now,
        };
        self.last_timestamp = Some(effective);
        Ok(effective)
    }

    /// リングバッファへ追加。同時刻のサンプルは最大値でマージする
    fn record_sample(&mut self, sample: RiskSample) {
        if let Some(last) = self.samples.back_mut() {
            if last.timestamp == sample.timestamp {
                last.pose_risk = last.pose_risk.max(sample.pose_risk);
                last.audio_risk = last.audio_risk.max(sample.audio_risk);
                return;
            }
        }
        if self.config.sample_capacity == 0 {
            return;
        }
        while self.samples.len() >= self.config.sample_capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    pub fn state(&self) -> EngineState {
        let Some(now) = self.last_timestamp else {
            return EngineState::Idle;
        };
        let cooling = self
            .last_emitted
            .iter()
            .flatten()
            .any(|&at| now - at < self.config.cooldown_seconds as f64);
        if cooling {
            EngineState::Cooldown
        } else {
            EngineState::Armed
        }
    }

    /// 直近 n 件のアラート履歴（古い順）
    pub fn recent_alerts(&self, n: usize) -> Vec<AlertEvent> {
        let skip = self.history.len().saturating_sub(n);
        self.history.iter().skip(skip).cloned().collect()
    }

    pub fn clear_history(&mut self) {
        self.history.clear();
    }

    /// 直近のリスクサンプル数（診断用）
    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> FusionEngine {
        FusionEngine::new(FusionConfig::default())
    }

    #[test]
    fn test_starts_idle_then_arms() {
        let mut engine = engine();
        assert_eq!(engine.state(), EngineState::Idle);
        engine.ingest(0.1, 0.0, 0.0).unwrap();
        assert_eq!(engine.state(), EngineState::Armed);
    }

    #[test]
    fn test_below_threshold_no_alert() {
        let mut engine = engine();
        assert!(engine.ingest(0.6, 0.6, 0.0).unwrap().is_none());
        // 0.6 も 0.54 も閾値 0.7 未満
        assert!(engine.recent_alerts(10).is_empty());
    }

    #[test]
    fn test_pose_dominant_is_fall() {
        let mut engine = engine();
        let event = engine.ingest(0.9, 0.2, 0.0).unwrap().unwrap();
        assert_eq!(event.kind, AlertKind::Fall);
        assert!((event.confidence - 0.9).abs() < 1e-6);
        assert_eq!(engine.state(), EngineState::Cooldown);
    }

    #[test]
    fn test_tie_break_favors_distress() {
        let mut engine = engine();
        // combined = max(0.8, 0.9*0.9=0.81) = 0.81 → 音声が支配
        let event = engine.ingest(0.8, 0.9, 0.0).unwrap().unwrap();
        assert_eq!(event.kind, AlertKind::Distress);
        assert!((event.confidence - 0.81).abs() < 1e-6);
    }

    #[test]
    fn test_simultaneous_trigger_fires_one_combined() {
        let mut engine = engine();
        // pose 0.9 が優位、audio も 0.9*0.9=0.81 で閾値超え
        let event = engine.ingest(0.9, 0.9, 0.0).unwrap().unwrap();
        assert_eq!(event.kind, AlertKind::Combined);
        assert!((event.confidence - 0.9).abs() < 1e-6);
        assert_eq!(engine.recent_alerts(10).len(), 1);
    }

    #[test]
    fn test_audio_dominant_stays_distress_even_with_pose_triggered() {
        let mut engine = engine();
        // 両方閾値超えでも、重み付け後の音声 0.81 > pose 0.75 なら Distress
        let event = engine.ingest(0.75, 0.9, 0.0).unwrap().unwrap();
        assert_eq!(event.kind, AlertKind::Distress);
    }

    #[test]
    fn test_cooldown_idempotence() {
        let mut engine = engine();
        let mut events = Vec::new();
        // combined 0.95 を 0.5 秒刻みで 10 秒間流す
        let mut t = 0.0;
        while t < 10.0 {
            if let Some(event) = engine.ingest(0.95, 0.0, t).unwrap() {
                events.push(event);
            }
            t += 0.5;
        }
        // t≈0 と t≈5 のちょうど2回
        assert_eq!(events.len(), 2);
        assert!((events[0].timestamp - 0.0).abs() < 1e-9);
        assert!((events[1].timestamp - 5.0).abs() < 1e-9);
    }

    #[test]
    fn test_cooldown_is_per_kind() {
        let mut engine = engine();
        let fall = engine.ingest(0.9, 0.0, 0.0).unwrap();
        assert_eq!(fall.unwrap().kind, AlertKind::Fall);
        // 別種（Distress）はクールダウン中でも発火する
        let distress = engine.ingest(0.0, 0.9, 1.0).unwrap();
        assert_eq!(distress.unwrap().kind, AlertKind::Distress);
        // 同種（Fall）は抑制される
        assert!(engine.ingest(0.9, 0.0, 2.0).unwrap().is_none());
    }

    #[test]
    fn test_samples_recorded_during_cooldown() {
        let mut engine = engine();
        engine.ingest(0.95, 0.0, 0.0).unwrap();
        let before = engine.sample_count();
        engine.ingest(0.95, 0.0, 1.0).unwrap();
        assert_eq!(engine.sample_count(), before + 1);
    }

    #[test]
    fn test_clock_skew_drops_sample() {
        let mut engine = engine();
        engine.ingest(0.1, 0.0, 10.0).unwrap();
        // 許容 0.5 秒を超えた逆行は破棄
        let result = engine.ingest(0.95, 0.0, 9.0);
        assert_eq!(
            result,
            Err(FusionError::ClockSkew { timestamp: 9.0, last: 10.0 })
        );
        // エンジン状態は影響を受けない
        assert_eq!(engine.sample_count(), 1);
        assert!(engine.recent_alerts(10).is_empty());
    }

    #[test]
    fn test_small_skew_tolerated() {
        let mut engine = engine();
        engine.ingest(0.1, 0.0, 10.0).unwrap();
        // 許容内の逆行は最新時刻に丸めて受け入れる
        assert!(engine.ingest(0.2, 0.0, 9.8).is_ok());
    }

    #[test]
    fn test_modality_memory_and_freshness() {
        let mut engine = engine();
        // 音声 0.8 → 0.72 で Distress 発火
        let event = engine.ingest_audio(0.8, 0.0).unwrap().unwrap();
        assert_eq!(event.kind, AlertKind::Distress);

        // 1秒後の視覚サンプル: 音声の記憶 0.8 も閾値超えのため Combined
        let event = engine.ingest_pose(0.9, 1.0).unwrap().unwrap();
        assert_eq!(event.kind, AlertKind::Combined);
        let last = event.supporting_samples.last().unwrap();
        assert!((last.audio_risk - 0.8).abs() < 1e-6);

        // 新鮮さの地平線（2秒）を過ぎると音声は 0 扱い
        engine.ingest_pose(0.1, 10.0).unwrap();
        // 直近サンプルを後続アラートで確認
        let event = engine.ingest_pose(0.95, 11.0).unwrap().unwrap();
        let last = event.supporting_samples.last().unwrap();
        assert_eq!(last.audio_risk, 0.0);
    }

    #[test]
    fn test_same_timestamp_samples_merge() {
        let mut engine = engine();
        engine.ingest(0.3, 0.0, 1.0).unwrap();
        engine.ingest(0.1, 0.5, 1.0).unwrap();
        assert_eq!(engine.sample_count(), 1);
    }

    #[test]
    fn test_sample_buffer_bounded() {
        let mut config = FusionConfig::default();
        config.sample_capacity = 10;
        let mut engine = FusionEngine::new(config);
        for i in 0..100 {
            engine.ingest(0.1, 0.0, i as f64).unwrap();
        }
        assert_eq!(engine.sample_count(), 10);
    }

    #[test]
    fn test_history_bounded_and_clearable() {
        let mut config = FusionConfig::default();
        config.history_capacity = 3;
        config.cooldown_seconds = 1.0;
        let mut engine = FusionEngine::new(config);
        for i in 0..10 {
            engine.ingest(0.95, 0.0, i as f64 * 2.0).unwrap();
        }
        assert_eq!(engine.recent_alerts(10).len(), 3);

        engine.clear_history();
        assert!(engine.recent_alerts(10).is_empty());
    }

    #[test]
    fn test_recent_alerts_returns_last_n_in_order() {
        let mut config = FusionConfig::default();
        config.cooldown_seconds = 1.0;
        let mut engine = FusionEngine::new(config);
        for i in 0..5 {
            engine.ingest(0.95, 0.0, i as f64 * 2.0).unwrap();
        }

        let last_two = engine.recent_alerts(2);
        assert_eq!(last_two.len(), 2);
        assert!((last_two[0].timestamp - 6.0).abs() < 1e-9);
        assert!((last_two[1].timestamp - 8.0).abs() < 1e-9);
        // 件数超過の要求は全件を返す
        assert_eq!(engine.recent_alerts(100).len(), 5);
    }

    #[test]
    fn test_zero_capacity_buffers_stay_empty() {
        let mut config = FusionConfig::default();
        config.sample_capacity = 0;
        config.history_capacity = 0;
        let mut engine = FusionEngine::new(config);

        // バッファ容量0でもアラート自体は発火する
        let event = engine.ingest(0.95, 0.0, 0.0).unwrap();
        assert!(event.is_some());
        assert_eq!(engine.sample_count(), 0);
        assert!(engine.recent_alerts(10).is_empty());
    }

    #[test]
    fn test_alert_event_serde_round_trip() {
        let mut engine = engine();
        engine.ingest(0.2, 0.3, 0.0).unwrap();
        let event = engine.ingest(0.9, 0.4, 1.0).unwrap().unwrap();

        let json = serde_json::to_string(&event).unwrap();
        let back: AlertEvent = serde_json::from_str(&json).unwrap();

        assert_eq!(back.kind, event.kind);
        assert_eq!(back.timestamp, event.timestamp);
        assert_eq!(back.message, event.message);
        assert!((back.confidence - event.confidence).abs() < 1e-6);
        assert_eq!(back.supporting_samples, event.supporting_samples);
    }

    #[test]
    fn test_rearms_after_cooldown() {
        let mut engine = engine();
        engine.ingest(0.95, 0.0, 0.0).unwrap();
        assert_eq!(engine.state(), EngineState::Cooldown);
        engine.ingest(0.1, 0.0, 6.0).unwrap();
        assert_eq!(engine.state(), EngineState::Armed);
    }
}
