use std::time::Instant;

use anyhow::Result;
use opencv::{
    core::{AlgorithmHint, Mat, Point, Rect, Size, Vector, BORDER_DEFAULT},
    imgproc,
    prelude::*,
};
use tracing::debug;

use super::completion::{complete_landmarks, MotionHistory};
use super::strategy::{to_gray, Strategy};
use super::{frame_is_usable, DetectError, PoseBackend};
use crate::landmark::{BackendId, Landmark, LandmarkIndex, PoseResult};

/// 人体とみなす輪郭の最小面積（ピクセル）
const MIN_CONTOUR_AREA: f64 = 1000.0;
/// 輪郭から直接合成した点の可視性
const ANCHOR_VISIBILITY: f32 = 0.8;
/// 補完時の可視性閾値
const VISIBILITY_FLOOR: f32 = 0.3;

/// バウンディングボックス内の相対位置に置くアンカー点
///
/// 輪郭からの人体シルエット近似。頭頂に鼻、肩線、腰線、膝、足首。
const ANCHOR_POINTS: [(LandmarkIndex, f32, f32); 9] = [
    (LandmarkIndex::Nose, 0.5, 0.1),
    (LandmarkIndex::LeftShoulder, 0.4, 0.3),
    (LandmarkIndex::RightShoulder, 0.6, 0.3),
    (LandmarkIndex::LeftHip, 0.42, 0.6),
    (LandmarkIndex::RightHip, 0.58, 0.6),
    (LandmarkIndex::LeftKnee, 0.42, 0.8),
    (LandmarkIndex::RightKnee, 0.58, 0.8),
    (LandmarkIndex::LeftAnkle, 0.42, 1.0),
    (LandmarkIndex::RightAnkle, 0.58, 1.0),
];

/// モデル不要の幾何学的フォールバック
///
/// エッジ抽出 → 最大輪郭 → バウンディングボックスから
/// ヒューリスティックにランドマークを合成する。精度は粗いが
/// モデルが一切使えない環境でもフレームを落とさない。
pub struct GeometricBackend {
    history: MotionHistory,
}

impl GeometricBackend {
    pub fn new() -> Self {
        Self {
            history: MotionHistory::new(),
        }
    }

    /// 最大輪郭のバウンディングボックスを探す
    fn find_subject(&self, frame: &Mat) -> Result<Option<Rect>> {
        let gray = to_gray(frame)?;
        let mut blurred = Mat::default();
        imgproc::gaussian_blur(
            &gray,
            &mut blurred,
            Size::new(5, 5),
            0.0,
            0.0,
            BORDER_DEFAULT,
            AlgorithmHint::ALGO_HINT_DEFAULT,
        )?;
        let mut edges = Mat::default();
        imgproc::canny(&blurred, &mut edges, 50.0, 150.0, 3, false)?;

        let mut contours: Vector<Vector<Point>> = Vector::new();
        imgproc::find_contours(
            &edges,
            &mut contours,
            imgproc::RETR_EXTERNAL,
            imgproc::CHAIN_APPROX_SIMPLE,
            Point::new(0, 0),
        )?;

        let mut best: Option<(f64, Rect)> = None;
        for contour in contours.iter() {
            let area = imgproc::contour_area(&contour, false)?;
            if area < MIN_CONTOUR_AREA {
                continue;
            }
            if best.as_ref().map_or(true, |(a, _)| area > *a) {
                best = Some((area, imgproc::bounding_rect(&contour)?));
            }
        }
        Ok(best.map(|(_, rect)| rect))
    }
}

impl Default for GeometricBackend {
    fn default() -> Self {
        Self::new()
    }
}

/// バウンディングボックスからアンカー点を合成する
fn landmarks_from_bbox(rect: Rect, frame_width: f32, frame_height: f32) -> [Landmark; LandmarkIndex::COUNT] {
    let mut landmarks = [Landmark::default(); LandmarkIndex::COUNT];
    for (index, rx, ry) in ANCHOR_POINTS {
        let x = (rect.x as f32 + rx * rect.width as f32) / frame_width;
        let y = (rect.y as f32 + ry * rect.height as f32) / frame_height;
        landmarks[index as usize] =
            Landmark::new(x.clamp(0.0, 1.0), y.clamp(0.0, 1.0), ANCHOR_VISIBILITY);
    }
    landmarks
}

impl PoseBackend for GeometricBackend {
    fn id(&self) -> BackendId {
        BackendId::GeometricFallback
    }

    fn detect(&mut self, frame: &Mat, deadline: Instant) -> Result<Vec<PoseResult>, DetectError> {
        if !frame_is_usable(frame) {
            return Err(DetectError::NoSignal);
        }
        let size = frame.size().map_err(|_| DetectError::NoSignal)?;
        let (w, h) = (size.width as f32, size.height as f32);

        // エッジ抽出を内蔵しているため前処理はrawとコントラスト強調のみ
        for strategy in [Strategy::Raw, Strategy::ContrastEnhanced] {
            if Instant::now() >= deadline {
                return Err(DetectError::Timeout);
            }
            let prepared = match strategy.apply(frame) {
                Ok(m) => m,
                Err(_) => continue,
            };
            let Ok(Some(rect)) = self.find_subject(&prepared) else {
                continue;
            };

            let mut landmarks = landmarks_from_bbox(rect, w, h);
            let center = (
                (rect.x as f32 + rect.width as f32 / 2.0) / w,
                (rect.y as f32 + rect.height as f32 / 2.0) / h,
            );
            complete_landmarks(&mut landmarks, &self.history, center, VISIBILITY_FLOOR);
            self.history.push(&landmarks, VISIBILITY_FLOOR);

            let confidence = super::cloud::mean_visibility(&landmarks);
            debug!(strategy = strategy.name(), confidence, "geometric backend matched contour");
            return Ok(vec![PoseResult::new(
                landmarks,
                confidence,
                BackendId::GeometricFallback,
            )]);
        }

        Err(DetectError::NoSignal)
    }
}
