use anyhow::Result;
use serde::Deserialize;
use std::fs;
use std::path::Path;

use crate::landmark::BackendId;

#[derive(Debug, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub chain: ChainConfig,
    #[serde(default)]
    pub risk: RiskConfig,
    #[serde(default)]
    pub fusion: FusionConfig,
    #[serde(default)]
    pub audio: AudioConfig,
    #[serde(default)]
    pub models: ModelConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChainConfig {
    /// バックエンドの優先順位（先頭が最優先）
    #[serde(default = "default_backend_preference")]
    pub backend_preference: Vec<BackendId>,
    /// この信頼度以上の結果を採用する
    #[serde(default = "default_min_accept_confidence")]
    pub min_accept_confidence: f32,
    /// バックエンド1回あたりの時間予算（ミリ秒）
    #[serde(default = "default_backend_timeout_ms")]
    pub backend_timeout_ms: u64,
    /// 成功率の評価ウィンドウ（直近の試行回数）
    #[serde(default = "default_health_window")]
    pub health_window: usize,
    /// 成功率がこれ以上で Healthy
    #[serde(default = "default_healthy_rate")]
    pub healthy_rate: f32,
    /// 成功率がこれ未満で Disabled
    #[serde(default = "default_disabled_rate")]
    pub disabled_rate: f32,
    /// Disabled バックエンドを再試行する間隔（スキップ回数）
    #[serde(default = "default_disabled_retry_interval")]
    pub disabled_retry_interval: u32,
}

fn default_backend_preference() -> Vec<BackendId> { BackendId::ALL.to_vec() }
fn default_min_accept_confidence() -> f32 { 0.35 }
fn default_backend_timeout_ms() -> u64 { 200 }
fn default_health_window() -> usize { 20 }
fn default_healthy_rate() -> f32 { 0.7 }
fn default_disabled_rate() -> f32 { 0.3 }
fn default_disabled_retry_interval() -> u32 { 20 }

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            backend_preference: default_backend_preference(),
            min_accept_confidence: default_min_accept_confidence(),
            backend_timeout_ms: default_backend_timeout_ms(),
            health_window: default_health_window(),
            healthy_rate: default_healthy_rate(),
            disabled_rate: default_disabled_rate(),
            disabled_retry_interval: default_disabled_retry_interval(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RiskConfig {
    /// 体幹傾斜がこの角度（度）を超えるとリスク加算
    #[serde(default = "default_angle_threshold_deg")]
    pub angle_threshold_deg: f32,
    /// 傾斜がこの角度（度）でリスク成分が飽和する
    #[serde(default = "default_angle_saturation_deg")]
    pub angle_saturation_deg: f32,
    /// 腰中点の下方向速度の下限（正規化座標/秒）
    #[serde(default = "default_velocity_floor")]
    pub velocity_floor: f32,
    /// 下方向速度がこの値で成分が飽和する
    #[serde(default = "default_velocity_saturation")]
    pub velocity_saturation: f32,
    /// 傾斜成分の重み
    #[serde(default = "default_angle_weight")]
    pub angle_weight: f32,
    /// 速度成分の重み
    #[serde(default = "default_velocity_weight")]
    pub velocity_weight: f32,
    /// この信頼度未満の検出はスコアを信頼度で減衰する
    #[serde(default = "default_damping_confidence")]
    pub damping_confidence: f32,
    /// ランドマーク有効判定の可視性閾値
    #[serde(default = "default_visibility_threshold")]
    pub visibility_threshold: f32,
}

fn default_angle_threshold_deg() -> f32 { 45.0 }
fn default_angle_saturation_deg() -> f32 { 90.0 }
fn default_velocity_floor() -> f32 { 0.1 }
fn default_velocity_saturation() -> f32 { 1.0 }
fn default_angle_weight() -> f32 { 0.6 }
fn default_velocity_weight() -> f32 { 0.4 }
fn default_damping_confidence() -> f32 { 0.35 }
fn default_visibility_threshold() -> f32 { 0.3 }

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            angle_threshold_deg: default_angle_threshold_deg(),
            angle_saturation_deg: default_angle_saturation_deg(),
            velocity_floor: default_velocity_floor(),
            velocity_saturation: default_velocity_saturation(),
            angle_weight: default_angle_weight(),
            velocity_weight: default_velocity_weight(),
            damping_confidence: default_damping_confidence(),
            visibility_threshold: default_visibility_threshold(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct FusionConfig {
    /// 同種アラートの最小間隔（秒）
    #[serde(default = "default_cooldown_seconds")]
    pub cooldown_seconds: f32,
    /// 統合リスクがこの値以上でアラート発火
    #[serde(default = "default_alert_threshold")]
    pub alert_threshold: f32,
    /// 音声リスクの重み（視覚より誤検出しやすいため弱める）
    #[serde(default = "default_audio_weight")]
    pub audio_weight: f32,
    /// リスクサンプルのリングバッファ容量
    #[serde(default = "default_sample_capacity")]
    pub sample_capacity: usize,
    /// アラート履歴の上限（超過時は古い順に破棄）
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,
    /// 逆行タイムスタンプの許容量（秒）。超過サンプルは破棄
    #[serde(default = "default_clock_skew_tolerance")]
    pub clock_skew_tolerance: f32,
    /// 反対モダリティの記憶が有効な期間（秒）
    #[serde(default = "default_modality_freshness")]
    pub modality_freshness: f32,
}

fn default_cooldown_seconds() -> f32 { 5.0 }
fn default_alert_threshold() -> f32 { 0.7 }
fn default_audio_weight() -> f32 { 0.9 }
fn default_sample_capacity() -> usize { 256 }
fn default_history_capacity() -> usize { 200 }
fn default_clock_skew_tolerance() -> f32 { 0.5 }
fn default_modality_freshness() -> f32 { 2.0 }

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            cooldown_seconds: default_cooldown_seconds(),
            alert_threshold: default_alert_threshold(),
            audio_weight: default_audio_weight(),
            sample_capacity: default_sample_capacity(),
            history_capacity: default_history_capacity(),
            clock_skew_tolerance: default_clock_skew_tolerance(),
            modality_freshness: default_modality_freshness(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct AudioConfig {
    /// 検出対象の救援キーワード（小文字で照合）
    #[serde(default = "default_keywords")]
    pub keywords: Vec<String>,
    /// 振幅最大値がこの値未満のチャンクは無音として無視
    #[serde(default = "default_silence_floor")]
    pub silence_floor: f32,
    /// 連続検出がこの回数に達してから信号を出す
    #[serde(default = "default_debounce_chunks")]
    pub debounce_chunks: u32,
}

fn default_keywords() -> Vec<String> {
    ["help", "help me", "救命", "救命啊", "助けて"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}
fn default_silence_floor() -> f32 { 0.01 }
fn default_debounce_chunks() -> u32 { 1 }

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            keywords: default_keywords(),
            silence_floor: default_silence_floor(),
            debounce_chunks: default_debounce_chunks(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ModelConfig {
    /// クラウドコンパイル済みモデル（ONNX）のパス
    #[serde(default = "default_cloud_model")]
    pub cloud_model: String,
    /// ローカル標準モデル（ONNX）のパス
    #[serde(default = "default_local_model")]
    pub local_model: String,
}

fn default_cloud_model() -> String { "models/pose_npu.onnx".to_string() }
fn default_local_model() -> String { "models/pose_local.onnx".to_string() }

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            cloud_model: default_cloud_model(),
            local_model: default_local_model(),
        }
    }
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// ファイルがなければデフォルト設定を返す
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Self {
        Self::load(path).unwrap_or_default()
    }
}
