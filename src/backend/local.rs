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

/// MoveNet系ローカルモデルの入力サイズ
const INPUT_SIZE: i32 = 192;
/// ローカルモデルが出力する COCO 17 キーポイント数
const COCO_POINTS: usize = 17;
/// このバックエンドが結果を採用する信頼度の下限
const CONFIDENCE_FLOOR: f32 = 0.4;
/// 補完時の可視性閾値
const VISIBILITY_FLOOR: f32 = 0.3;

/// COCO 17点 → 33点スキーマへの対応表
///
/// 対応しない16点（目の内外角・口・指・かかと等）は補完アルゴリズムが埋める。
const COCO_TO_SCHEMA: [LandmarkIndex; COCO_POINTS] = [
    LandmarkIndex::Nose,
    LandmarkIndex::LeftEye,
    LandmarkIndex::RightEye,
    LandmarkIndex::LeftEar,
    LandmarkIndex::RightEar,
    LandmarkIndex::LeftShoulder,
    LandmarkIndex::RightShoulder,
    LandmarkIndex::LeftElbow,
    LandmarkIndex::RightElbow,
    LandmarkIndex::LeftWrist,
    LandmarkIndex::RightWrist,
    LandmarkIndex::LeftHip,
    LandmarkIndex::RightHip,
    LandmarkIndex::LeftKnee,
    LandmarkIndex::RightKnee,
    LandmarkIndex::LeftAnkle,
    LandmarkIndex::RightAnkle,
];

/// CPUで動く標準ローカルモデル（MoveNet）のバックエンド
///
/// 出力は [1, 1, 17, 3] (y, x, confidence)。17点を33点スキーマへ
/// 写像し、残りは補完で埋める。
pub struct LocalModelBackend {
    session: Session,
    history: MotionHistory,
}

impl LocalModelBackend {
    pub fn new<P: AsRef<Path>>(model_path: P) -> Result<Self> {
        let session = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .commit_from_file(model_path.as_ref())
            .context("Failed to load local pose model")?;

        Ok(Self {
            session,
            history: MotionHistory::new(),
        })
    }

    fn infer(&mut self, frame: &Mat) -> Option<[Landmark; LandmarkIndex::COUNT]> {
        let tensor = preprocess_tensor(frame, INPUT_SIZE).ok()?;
        let input = Tensor::from_array(tensor).ok()?;
        let outputs = self
            .session
            .run(ort::inputs!["serving_default_input_0" => input])
            .ok()?;

        let output: ArrayViewD<f32> = outputs["StatefulPartitionedCall_0"]
            .try_extract_array()
            .ok()?;
        map_coco_output(&output)
    }
}

/// [1, 1, 17, 3] (y, x, confidence) を33点スキーマへ写像する
fn map_coco_output(output: &ArrayViewD<f32>) -> Option<[Landmark; LandmarkIndex::COUNT]> {
    if output.shape() != [1, 1, COCO_POINTS, 3] {
        return None;
    }

    let mut landmarks = [Landmark::default(); LandmarkIndex::COUNT];
    for (i, &target) in COCO_TO_SCHEMA.iter().enumerate() {
        let y = output[[0, 0, i, 0]];
        let x = output[[0, 0, i, 1]];
        let confidence = output[[0, 0, i, 2]];
        if !x.is_finite() || !y.is_finite() || !confidence.is_finite() {
            return None;
        }
        landmarks[target as usize] =
            Landmark::new(x.clamp(0.0, 1.0), y.clamp(0.0, 1.0), confidence.clamp(0.0, 1.0));
    }
    Some(landmarks)
}

/// 写像された17点の平均信頼度（未対応の16点は含めない）
fn mapped_confidence(landmarks: &[Landmark; LandmarkIndex::COUNT]) -> f32 {
    let sum: f32 = COCO_TO_SCHEMA
        .iter()
        .map(|&idx| landmarks[idx as usize].visibility)
        .sum();
    sum / COCO_POINTS as f32
}

impl PoseBackend for LocalModelBackend {
    fn id(&self) -> BackendId {
        BackendId::StandardLocal
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
            let Some(landmarks) = self.infer(&prepared) else {
                continue;
            };

            let confidence = mapped_confidence(&landmarks);
            if confidence > best_confidence {
                best_confidence = confidence;
                best = Some(landmarks);
            }
            if best_confidence >= CONFIDENCE_FLOOR {
                debug!(strategy = strategy.name(), confidence = best_confidence, "local backend accepted");
                break;
            }
        }

        let mut landmarks = best.ok_or(DetectError::NoSignal)?;
        complete_landmarks(&mut landmarks, &self.history, (0.5, 0.5), VISIBILITY_FLOOR);
        self.history.push(&landmarks, VISIBILITY_FLOOR);

        Ok(vec![PoseResult::new(
            landmarks,
            best_confidence,
            BackendId::StandardLocal,
        )])
    }
}
