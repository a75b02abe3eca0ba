use crate::landmark::{Landmark, LandmarkIndex};

/// 解剖学的に妥当な33点の標準配置（体中心からのオフセット）
///
/// 直立姿勢を仮定した最終手段の合成値。頭部が上、足が下。
pub const ANATOMICAL_OFFSETS: [(f32, f32); LandmarkIndex::COUNT] = [
    (0.00, -0.25),  // Nose
    (-0.02, -0.26), // LeftEyeInner
    (-0.04, -0.26), // LeftEye
    (-0.06, -0.26), // LeftEyeOuter
    (0.02, -0.26),  // RightEyeInner
    (0.04, -0.26),  // RightEye
    (0.06, -0.26),  // RightEyeOuter
    (-0.08, -0.24), // LeftEar
    (0.08, -0.24),  // RightEar
    (-0.03, -0.22), // MouthLeft
    (0.03, -0.22),  // MouthRight
    (-0.15, -0.05), // LeftShoulder
    (0.15, -0.05),  // RightShoulder
    (-0.18, 0.05),  // LeftElbow
    (0.18, 0.05),   // RightElbow
    (-0.20, 0.15),  // LeftWrist
    (0.20, 0.15),   // RightWrist
    (-0.22, 0.18),  // LeftPinky
    (0.22, 0.18),   // RightPinky
    (-0.21, 0.17),  // LeftIndex
    (0.21, 0.17),   // RightIndex
    (-0.20, 0.16),  // LeftThumb
    (0.20, 0.16),   // RightThumb
    (-0.10, 0.15),  // LeftHip
    (0.10, 0.15),   // RightHip
    (-0.12, 0.35),  // LeftKnee
    (0.12, 0.35),   // RightKnee
    (-0.10, 0.55),  // LeftAnkle
    (0.10, 0.55),   // RightAnkle
    (-0.11, 0.58),  // LeftHeel
    (0.11, 0.58),   // RightHeel
    (-0.09, 0.60),  // LeftFootIndex
    (0.09, 0.60),   // RightFootIndex
];

const HISTORY_DEPTH: usize = 4;
/// 履歴位置を画像中心へ引き寄せる割合
const CENTER_DECAY: f32 = 0.2;
/// 対称ミラーで合成した点の可視性係数
const MIRROR_VISIBILITY: f32 = 0.6;
/// 履歴から合成した点の可視性係数
const HISTORY_VISIBILITY: f32 = 0.5;
/// 解剖学的デフォルトの可視性
const DEFAULT_VISIBILITY: f32 = 0.25;

/// ランドマークごとの固定長リング履歴
///
/// 直近フレームの位置から短期予測を行う。容量固定なので
/// 長時間稼働でもメモリは増えない。
pub struct MotionHistory {
    // (x, y, visibility) を landmark id ごとにリング保持
    ring: [[(f32, f32, f32); HISTORY_DEPTH]; LandmarkIndex::COUNT],
    len: [usize; LandmarkIndex::COUNT],
    head: [usize; LandmarkIndex::COUNT],
}

impl MotionHistory {
    pub fn new() -> Self {
        Self {
            ring: [[(0.0, 0.0, 0.0); HISTORY_DEPTH]; LandmarkIndex::COUNT],
            len: [0; LandmarkIndex::COUNT],
            head: [0; LandmarkIndex::COUNT],
        }
    }

    /// 可視性が閾値以上のランドマークだけを履歴に積む
    pub fn push(&mut self, landmarks: &[Landmark; LandmarkIndex::COUNT], floor: f32) {
        for (i, lm) in landmarks.iter().enumerate() {
            if lm.visibility >= floor {
                self.ring[i][self.head[i]] = (lm.x, lm.y, lm.visibility);
                self.head[i] = (self.head[i] + 1) % HISTORY_DEPTH;
                self.len[i] = (self.len[i] + 1).min(HISTORY_DEPTH);
            }
        }
    }

    /// 直近2点からの線形外挿。履歴1点ならその位置をそのまま返す
    pub fn predict(&self, index: LandmarkIndex) -> Option<(f32, f32, f32)> {
        let i = index as usize;
        match self.len[i] {
            0 => None,
            1 => {
                let last = self.ring[i][(self.head[i] + HISTORY_DEPTH - 1) % HISTORY_DEPTH];
                Some(last)
            }
            _ => {
                let last = self.ring[i][(self.head[i] + HISTORY_DEPTH - 1) % HISTORY_DEPTH];
                let prev = self.ring[i][(self.head[i] + HISTORY_DEPTH - 2) % HISTORY_DEPTH];
                Some((
                    last.0 + (last.0 - prev.0),
                    last.1 + (last.1 - prev.1),
                    last.2,
                ))
            }
        }
    }

    pub fn reset(&mut self) {
        self.len = [0; LandmarkIndex::COUNT];
        self.head = [0; LandmarkIndex::COUNT];
    }
}

impl Default for MotionHistory {
    fn default() -> Self {
        Self::new()
    }
}

/// 欠損ランドマークを補完して33点を保証する
///
/// 優先順位:
/// 1. 対側の検出点を体軸で鏡映
/// 2. 前フレーム位置を画像中心へ減衰させた予測
/// 3. 解剖学的デフォルト配置
///
/// 戻り値は補完された点の数。
pub fn complete_landmarks(
    landmarks: &mut [Landmark; LandmarkIndex::COUNT],
    history: &MotionHistory,
    center: (f32, f32),
    floor: f32,
) -> usize {
    let axis_x = torso_axis_x(landmarks, floor).unwrap_or(center.0);
    let mut filled = 0;

    // 鏡映は補完前のスナップショットを参照する。補完で作った点を
    // さらに鏡映のソースにすると誤差が伝播するため
    let snapshot = *landmarks;

    for i in 0..LandmarkIndex::COUNT {
        if landmarks[i].visibility >= floor {
            continue;
        }
        let index = LandmarkIndex::from_index(i).expect("index in range");

        // 1. 対側ミラー
        if let Some(mirror) = index.mirror() {
            let partner = &snapshot[mirror as usize];
            if partner.visibility >= floor {
                landmarks[i] = Landmark::new_3d(
                    (2.0 * axis_x - partner.x).clamp(0.0, 1.0),
                    partner.y.clamp(0.0, 1.0),
                    partner.z,
                    partner.visibility * MIRROR_VISIBILITY,
                );
                filled += 1;
                continue;
            }
        }

        // 2. 履歴予測（中心へ減衰）
        if let Some((px, py, pvis)) = history.predict(index) {
            landmarks[i] = Landmark::new(
                (px + (center.0 - px) * CENTER_DECAY).clamp(0.0, 1.0),
                (py + (center.1 - py) * CENTER_DECAY).clamp(0.0, 1.0),
                pvis * HISTORY_VISIBILITY,
            );
            filled += 1;
            continue;
        }

        // 3. 解剖学的デフォルト
        let (dx, dy) = ANATOMICAL_OFFSETS[i];
        landmarks[i] = Landmark::new(
            (center.0 + dx).clamp(0.0, 1.0),
            (center.1 + dy).clamp(0.0, 1.0),
            DEFAULT_VISIBILITY,
        );
        filled += 1;
    }

    filled
}

/// 体軸のX座標（肩中点と腰中点の平均）。どちらも取れなければ None
fn torso_axis_x(landmarks: &[Landmark; LandmarkIndex::COUNT], floor: f32) -> Option<f32> {
    let pair_mid = |a: LandmarkIndex, b: LandmarkIndex| -> Option<f32> {
        let l = &landmarks[a as usize];
        let r = &landmarks[b as usize];
        if l.visibility >= floor && r.visibility >= floor {
            Some((l.x + r.x) / 2.0)
        } else {
            None
        }
    };

    let shoulders = pair_mid(LandmarkIndex::LeftShoulder, LandmarkIndex::RightShoulder);
    let hips = pair_mid(LandmarkIndex::LeftHip, LandmarkIndex::RightHip);
    match (shoulders, hips) {
        (Some(s), Some(h)) => Some((s + h) / 2.0),
        (Some(s), None) => Some(s),
        (None, Some(h)) => Some(h),
        (None, None) => None,
    }
}

/// 中心位置だけから33点すべてを合成する（チェーン枯渇時の最終フォールバック）
pub fn synthesize_default_pose(center: (f32, f32)) -> [Landmark; LandmarkIndex::COUNT] {
    let mut landmarks = [Landmark::default(); LandmarkIndex::COUNT];
    for (i, (dx, dy)) in ANATOMICAL_OFFSETS.iter().enumerate() {
        landmarks[i] = Landmark::new(
            (center.0 + dx).clamp(0.0, 1.0),
            (center.1 + dy).clamp(0.0, 1.0),
            DEFAULT_VISIBILITY,
        );
    }
    landmarks
}

#[cfg(test)]
mod tests {
    use super::*;

    const FLOOR: f32 = 0.3;

    fn empty_landmarks() -> [Landmark; LandmarkIndex::COUNT] {
        [Landmark::default(); LandmarkIndex::COUNT]
    }

    #[test]
    fn test_completion_fills_all_points() {
        let mut lm = empty_landmarks();
        let history = MotionHistory::new();
        let filled = complete_landmarks(&mut lm, &history, (0.5, 0.5), FLOOR);
        assert_eq!(filled, 33);
        for (i, l) in lm.iter().enumerate() {
            assert!(l.visibility > 0.0, "landmark {} not filled", i);
            assert!((0.0..=1.0).contains(&l.x), "x out of range at {}", i);
            assert!((0.0..=1.0).contains(&l.y), "y out of range at {}", i);
        }
    }

    #[test]
    fn test_visible_points_untouched() {
        let mut lm = empty_landmarks();
        lm[LandmarkIndex::Nose as usize] = Landmark::new(0.42, 0.31, 0.95);
        let history = MotionHistory::new();
        complete_landmarks(&mut lm, &history, (0.5, 0.5), FLOOR);
        let nose = &lm[LandmarkIndex::Nose as usize];
        assert_eq!(nose.x, 0.42);
        assert_eq!(nose.y, 0.31);
        assert_eq!(nose.visibility, 0.95);
    }

    #[test]
    fn test_symmetry_mirror_preferred() {
        let mut lm = empty_landmarks();
        // 体軸が定まるように両肩・両腰を配置
        lm[LandmarkIndex::LeftShoulder as usize] = Landmark::new(0.4, 0.3, 0.9);
        lm[LandmarkIndex::RightShoulder as usize] = Landmark::new(0.6, 0.3, 0.9);
        lm[LandmarkIndex::LeftHip as usize] = Landmark::new(0.42, 0.55, 0.9);
        lm[LandmarkIndex::RightHip as usize] = Landmark::new(0.58, 0.55, 0.9);
        // 左膝のみ検出、右膝は欠損
        lm[LandmarkIndex::LeftKnee as usize] = Landmark::new(0.40, 0.7, 0.8);

        let history = MotionHistory::new();
        complete_landmarks(&mut lm, &history, (0.5, 0.5), FLOOR);

        let right_knee = &lm[LandmarkIndex::RightKnee as usize];
        // 体軸x=0.5 → 鏡映で x = 2*0.5 - 0.40 = 0.60
        assert!((right_knee.x - 0.60).abs() < 1e-5, "got x={}", right_knee.x);
        assert!((right_knee.y - 0.7).abs() < 1e-5);
        assert!((right_knee.visibility - 0.8 * MIRROR_VISIBILITY).abs() < 1e-5);
    }

    #[test]
    fn test_history_used_when_no_mirror() {
        let mut prev = empty_landmarks();
        // 鼻（正中線、ミラー不可）を前フレームで検出
        prev[LandmarkIndex::Nose as usize] = Landmark::new(0.3, 0.2, 0.9);
        let mut history = MotionHistory::new();
        history.push(&prev, FLOOR);

        let mut lm = empty_landmarks();
        complete_landmarks(&mut lm, &history, (0.5, 0.5), FLOOR);

        let nose = &lm[LandmarkIndex::Nose as usize];
        // 0.3 + (0.5-0.3)*0.2 = 0.34
        assert!((nose.x - 0.34).abs() < 1e-5, "got x={}", nose.x);
        assert!((nose.y - (0.2 + 0.3 * 0.2)).abs() < 1e-5);
        assert!((nose.visibility - 0.9 * HISTORY_VISIBILITY).abs() < 1e-5);
    }

    #[test]
    fn test_prediction_extrapolates_motion() {
        let mut history = MotionHistory::new();
        let mut frame = empty_landmarks();
        frame[LandmarkIndex::Nose as usize] = Landmark::new(0.30, 0.50, 0.9);
        history.push(&frame, FLOOR);
        frame[LandmarkIndex::Nose as usize] = Landmark::new(0.35, 0.50, 0.9);
        history.push(&frame, FLOOR);

        let (px, py, _) = history.predict(LandmarkIndex::Nose).unwrap();
        assert!((px - 0.40).abs() < 1e-5, "got px={}", px);
        assert!((py - 0.50).abs() < 1e-5);
    }

    #[test]
    fn test_history_ring_bounded() {
        let mut history = MotionHistory::new();
        let mut frame = empty_landmarks();
        for i in 0..100 {
            frame[LandmarkIndex::Nose as usize] =
                Landmark::new(0.01 * (i % 50) as f32, 0.5, 0.9);
            history.push(&frame, FLOOR);
        }
        // 容量固定: 最新値ベースの予測が返る
        assert!(history.predict(LandmarkIndex::Nose).is_some());
    }

    #[test]
    fn test_default_pose_is_anatomical() {
        let lm = synthesize_default_pose((0.5, 0.5));
        let nose = lm[LandmarkIndex::Nose as usize];
        let ankle = lm[LandmarkIndex::LeftAnkle as usize];
        // 頭は中心より上、足首は下
        assert!(nose.y < 0.5);
        assert!(ankle.y > 0.5);
    }

    #[test]
    fn test_reset_clears_history() {
        let mut history = MotionHistory::new();
        let mut frame = empty_landmarks();
        frame[LandmarkIndex::Nose as usize] = Landmark::new(0.3, 0.2, 0.9);
        history.push(&frame, FLOOR);
        history.reset();
        assert!(history.predict(LandmarkIndex::Nose).is_none());
    }
}
