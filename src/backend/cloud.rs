use std::path::Path;
use std::time::Instant;

use anyhow::{Context, Result};
use ndarray::ArrayViewD;
use opencv::core::Mat;
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use ort::value::Tensor;
use tracing::debug;

use super::completion::{complete_landmarks, MotionHistory};
use super::strategy::{preprocess_tensor, Strategy};
use super::{frame_is_usable, DetectError, PoseBackend};
use crate::landmark::{BackendId, Landmark, LandmarkIndex, PoseResult};

/// クラウドコンパイル済み（NPU最適化）モデルの入力サイズ
const INPUT_SIZE: i32 = 256;
/// このバックエンドが結果を採用する信頼度の下限
const CONFIDENCE_FLOOR: f32 = 0.5;
/// 補完時の可視性閾値
const VISIBILITY_FLOOR: f32 = 0.3;

/// NPU向けにコンパイルされた姿勢推定モデルを使う最優先バックエンド
///
/// 出力テンソルは人物ごとに [33, 4] (x, y, z, visibility)。
/// 可視性チャネルを持たない派生モデル（[33, 3]）も第2抽出パスで受ける。
pub struct CloudAcceleratedBackend {
    session: Session,
    history: MotionHistory,
}

impl CloudAcceleratedBackend {
    pub fn new<P: AsRef<Path>>(model_path: P) -> Result<Self> {
        let session = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .commit_from_file(model_path.as_ref())
            .context("Failed to load cloud-compiled pose model")?;

        Ok(Self {
            session,
            history: MotionHistory::new(),
        })
    }

    /// 1ストラテジー分の推論。失敗や想定外の形は None
    fn infer(&mut self, frame: &Mat) -> Option<Vec<[Landmark; LandmarkIndex::COUNT]>> {
        let tensor = preprocess_tensor(frame, INPUT_SIZE).ok()?;
        let input = Tensor::from_array(tensor).ok()?;
        let outputs = self.session.run(ort::inputs!["image" => input]).ok()?;

        let output: ArrayViewD<f32> = outputs["landmarks"].try_extract_array().ok()?;
        parse_landmark_tensor(&output)
    }
}

/// [persons, 33, 4] または [persons, 33, 3] 形式の出力をパースする
///
/// 第1パス: (x, y, z, visibility)
/// 第2パス: (x, y, score) — zなし、scoreを可視性として扱う
fn parse_landmark_tensor(output: &ArrayViewD<f32>) -> Option<Vec<[Landmark; LandmarkIndex::COUNT]>> {
    let shape = output.shape();
    // 先頭のバッチ次元は潰して [persons, 33, ch] として扱う
    let (persons, points, channels) = match shape {
        [p, n, c] => (*p, *n, *c),
        [1, p, n, c] => (*p, *n, *c),
        _ => return None,
    };
    if points != LandmarkIndex::COUNT || !(3..=4).contains(&channels) {
        return None;
    }

    let flat = output.to_shape((persons, points, channels)).ok()?;
    let mut results = Vec::with_capacity(persons);
    for p in 0..persons {
        let mut landmarks = [Landmark::default(); LandmarkIndex::COUNT];
        for i in 0..points {
            let x = flat[[p, i, 0]];
            let y = flat[[p, i, 1]];
            let (z, visibility) = if channels == 4 {
                (flat[[p, i, 2]], flat[[p, i, 3]])
            } else {
                (0.0, flat[[p, i, 2]])
            };
            if !x.is_finite() || !y.is_finite() || !visibility.is_finite() {
                return None;
            }
            landmarks[i] =
                Landmark::new_3d(x.clamp(0.0, 1.0), y.clamp(0.0, 1.0), z, visibility.clamp(0.0, 1.0));
        }
        results.push(landmarks);
    }
    Some(results)
}

impl PoseBackend for CloudAcceleratedBackend {
    fn id(&self) -> BackendId {
        BackendId::PrimaryCloudAccelerated
    }

    fn detect(&mut self, frame: &Mat, deadline: Instant) -> Result<Vec<PoseResult>, DetectError> {
        if !frame_is_usable(frame) {
            return Err(DetectError::NoSignal);
        }

        let mut best: Option<[Landmark; LandmarkIndex::COUNT]> = None;
        let mut best_confidence = 0.0f32;

        for strategy in Strategy::ORDER {
            if Instant::now() >= deadline {
                return Err(DetectError::Timeout);
            }
            let prepared = match strategy.apply(frame) {
                Ok(m) => m,
                Err(_) => continue,
            };
            let Some(candidates) = self.infer(&prepared) else {
                continue;
            };

            for landmarks in candidates {
                let confidence = mean_visibility(&landmarks);
                if confidence > best_confidence {
                    best_confidence = confidence;
                    best = Some(landmarks);
                }
            }

            if best_confidence >= CONFIDENCE_FLOOR {
                debug!(strategy = strategy.name(), confidence = best_confidence, "cloud backend accepted");
                break;
            }
        }

        let mut landmarks = best.ok_or(DetectError::NoSignal)?;
        complete_landmarks(&mut landmarks, &self.history, (0.5, 0.5), VISIBILITY_FLOOR);
        self.history.push(&landmarks, VISIBILITY_FLOOR);

        Ok(vec![PoseResult::new(
            landmarks,
            best_confidence,
            BackendId::PrimaryCloudAccelerated,
        )])
    }
}

pub(crate) fn mean_visibility(landmarks: &[Landmark; LandmarkIndex::COUNT]) -> f32 {
    let sum: f32 = landmarks.iter().map(|l| l.visibility).sum();
    sum / LandmarkIndex::COUNT as f32
}
