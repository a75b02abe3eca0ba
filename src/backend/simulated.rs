use std::time::Instant;

use opencv::{core::Mat, imgproc, prelude::*};

use super::strategy::to_gray;
use super::{frame_is_usable, DetectError, PoseBackend};
use crate::landmark::{BackendId, Landmark, LandmarkIndex, PoseResult};

use super::completion::ANATOMICAL_OFFSETS;

/// 合成ポーズの可視性
const SIMULATED_VISIBILITY: f32 = 0.75;
/// 合成ポーズの信頼度。実検出より常に低く扱わせる
const SIMULATED_CONFIDENCE: f32 = 0.5;

/// 最終手段のシミュレーションバックエンド
///
/// 輝度重心を体中心とみなし、標準配置の33点を合成する。
/// 乱数を使わないため同じフレームには常に同じ結果を返す。
/// 失敗しないので、チェーンの末尾に置けば検出が完全に
/// 途切れることはない。
pub struct SimulatedBackend;

impl SimulatedBackend {
    pub fn new() -> Self {
        Self
    }

    /// 輝度重心。フレームが真っ黒ならフレーム中心
    fn centroid(&self, frame: &Mat) -> (f32, f32) {
        let Ok(gray) = to_gray(frame) else {
            return (0.5, 0.5);
        };
        let Ok(size) = gray.size() else {
            return (0.5, 0.5);
        };
        let Ok(m) = imgproc::moments(&gray, false) else {
            return (0.5, 0.5);
        };
        if m.m00.abs() < f64::EPSILON {
            return (0.5, 0.5);
        }
        let cx = (m.m10 / m.m00) as f32 / size.width as f32;
        let cy = (m.m01 / m.m00) as f32 / size.height as f32;
        (cx.clamp(0.0, 1.0), cy.clamp(0.0, 1.0))
    }
}

impl Default for SimulatedBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl PoseBackend for SimulatedBackend {
    fn id(&self) -> BackendId {
        BackendId::Simulated
    }

    fn detect(&mut self, frame: &Mat, _deadline: Instant) -> Result<Vec<PoseResult>, DetectError> {
        let center = if frame_is_usable(frame) {
            self.centroid(frame)
        } else {
            (0.5, 0.5)
        };

        let mut landmarks = [Landmark::default(); LandmarkIndex::COUNT];
        for (i, (dx, dy)) in ANATOMICAL_OFFSETS.iter().enumerate() {
            landmarks[i] = Landmark::new(
                (center.0 + dx).clamp(0.0, 1.0),
                (center.1 + dy).clamp(0.0, 1.0),
                SIMULATED_VISIBILITY,
            );
        }

        Ok(vec![PoseResult::new(
            landmarks,
            SIMULATED_CONFIDENCE,
            BackendId::Simulated,
        )])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opencv::core::{Rect, Scalar};
    use std::time::Duration;

    fn deadline() -> Instant {
        Instant::now() + Duration::from_millis(100)
    }

    #[test]
    fn test_always_succeeds_even_on_empty_frame() {
        let mut backend = SimulatedBackend::new();
        let frame = Mat::default();
        let results = backend.detect(&frame, deadline()).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].source_backend, BackendId::Simulated);
        assert_eq!(results[0].overall_confidence, SIMULATED_CONFIDENCE);
    }

    #[test]
    fn test_deterministic_on_same_frame() {
        let mut backend = SimulatedBackend::new();
        let frame = Mat::new_rows_cols_with_default(
            480,
            640,
            opencv::core::CV_8UC3,
            Scalar::all(60.0),
        )
        .unwrap();
        let a = backend.detect(&frame, deadline()).unwrap();
        let b = backend.detect(&frame, deadline()).unwrap();
        for (la, lb) in a[0].landmarks.iter().zip(b[0].landmarks.iter()) {
            assert_eq!(la.x, lb.x);
            assert_eq!(la.y, lb.y);
        }
    }

    #[test]
    fn test_pose_follows_bright_region() {
        // 左上だけ明るいフレーム: 重心は中心より左上に寄る
        let mut frame = Mat::new_rows_cols_with_default(
            480,
            640,
            opencv::core::CV_8UC3,
            Scalar::all(0.0),
        )
        .unwrap();
        imgproc::rectangle(
            &mut frame,
            Rect::new(0, 0, 160, 120),
            Scalar::new(255.0, 255.0, 255.0, 0.0),
            -1,
            imgproc::LINE_8,
            0,
        )
        .unwrap();

        let mut backend = SimulatedBackend::new();
        let results = backend.detect(&frame, deadline()).unwrap();
        let mid = results[0].midpoint(LandmarkIndex::LeftHip, LandmarkIndex::RightHip, 0.3);
        let (x, _) = mid.unwrap();
        assert!(x < 0.5, "got x={}", x);
    }

    #[test]
    fn test_all_points_visible() {
        let mut backend = SimulatedBackend::new();
        let frame = Mat::new_rows_cols_with_default(
            480,
            640,
            opencv::core::CV_8UC3,
            Scalar::all(128.0),
        )
        .unwrap();
        let results = backend.detect(&frame, deadline()).unwrap();
        for lm in results[0].landmarks.iter() {
            assert_eq!(lm.visibility, SIMULATED_VISIBILITY);
        }
    }
}
