use serde::{Deserialize, Serialize};

/// MediaPipe Pose 互換の 33 ランドマークインデックス
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(usize)]
pub enum LandmarkIndex {
    Nose = 0,
    LeftEyeInner = 1,
    LeftEye = 2,
    LeftEyeOuter = 3,
    RightEyeInner = 4,
    RightEye = 5,
    RightEyeOuter = 6,
    LeftEar = 7,
    RightEar = 8,
    MouthLeft = 9,
    MouthRight = 10,
    LeftShoulder = 11,
    RightShoulder = 12,
    LeftElbow = 13,
    RightElbow = 14,
    LeftWrist = 15,
    RightWrist = 16,
    LeftPinky = 17,
    RightPinky = 18,
    LeftIndex = 19,
    RightIndex = 20,
    LeftThumb = 21,
    RightThumb = 22,
    LeftHip = 23,
    RightHip = 24,
    LeftKnee = 25,
    RightKnee = 26,
    LeftAnkle = 27,
    RightAnkle = 28,
    LeftHeel = 29,
    RightHeel = 30,
    LeftFootIndex = 31,
    RightFootIndex = 32,
}

impl LandmarkIndex {
    pub const COUNT: usize = 33;

    pub fn from_index(index: usize) -> Option<Self> {
        use LandmarkIndex::*;
        const TABLE: [LandmarkIndex; LandmarkIndex::COUNT] = [
            Nose, LeftEyeInner, LeftEye, LeftEyeOuter, RightEyeInner, RightEye,
            RightEyeOuter, LeftEar, RightEar, MouthLeft, MouthRight,
            LeftShoulder, RightShoulder, LeftElbow, RightElbow, LeftWrist,
            RightWrist, LeftPinky, RightPinky, LeftIndex, RightIndex,
            LeftThumb, RightThumb, LeftHip, RightHip, LeftKnee, RightKnee,
            LeftAnkle, RightAnkle, LeftHeel, RightHeel, LeftFootIndex,
            RightFootIndex,
        ];
        TABLE.get(index).copied()
    }

    /// 対側（左右反転）のインデックス。正中線上の点（鼻）は None
    pub fn mirror(self) -> Option<Self> {
        use LandmarkIndex::*;
        let m = match self {
            Nose => return None,
            LeftEyeInner => RightEyeInner,
            LeftEye => RightEye,
            LeftEyeOuter => RightEyeOuter,
            RightEyeInner => LeftEyeInner,
            RightEye => LeftEye,
            RightEyeOuter => LeftEyeOuter,
            LeftEar => RightEar,
            RightEar => LeftEar,
            MouthLeft => MouthRight,
            MouthRight => MouthLeft,
            LeftShoulder => RightShoulder,
            RightShoulder => LeftShoulder,
            LeftElbow => RightElbow,
            RightElbow => LeftElbow,
            LeftWrist => RightWrist,
            RightWrist => LeftWrist,
            LeftPinky => RightPinky,
            RightPinky => LeftPinky,
            LeftIndex => RightIndex,
            RightIndex => LeftIndex,
            LeftThumb => RightThumb,
            RightThumb => LeftThumb,
            LeftHip => RightHip,
            RightHip => LeftHip,
            LeftKnee => RightKnee,
            RightKnee => LeftKnee,
            LeftAnkle => RightAnkle,
            RightAnkle => LeftAnkle,
            LeftHeel => RightHeel,
            RightHeel => LeftHeel,
            LeftFootIndex => RightFootIndex,
            RightFootIndex => LeftFootIndex,
        };
        Some(m)
    }
}

/// 単一ランドマーク（正規化画像座標）
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Landmark {
    /// 正規化されたX座標 (0.0〜1.0)
    pub x: f32,
    /// 正規化されたY座標 (0.0〜1.0)
    pub y: f32,
    /// 奥行き（腰中点基準の相対値、単眼では概算）
    pub z: f32,
    /// 可視性スコア (0.0〜1.0)
    pub visibility: f32,
}

impl Landmark {
    pub fn new(x: f32, y: f32, visibility: f32) -> Self {
        Self { x, y, z: 0.0, visibility }
    }

    pub fn new_3d(x: f32, y: f32, z: f32, visibility: f32) -> Self {
        Self { x, y, z, visibility }
    }

    /// 可視性が閾値以上か
    pub fn is_visible(&self, threshold: f32) -> bool {
        self.visibility >= threshold
    }
}

impl Default for Landmark {
    fn default() -> Self {
        Self { x: 0.0, y: 0.0, z: 0.0, visibility: 0.0 }
    }
}

/// 姿勢検出バックエンドの識別子。宣言順がデフォルトの優先順位
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendId {
    PrimaryCloudAccelerated,
    StandardLocal,
    GeometricFallback,
    Simulated,
}

impl BackendId {
    pub const ALL: [BackendId; 4] = [
        BackendId::PrimaryCloudAccelerated,
        BackendId::StandardLocal,
        BackendId::GeometricFallback,
        BackendId::Simulated,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            BackendId::PrimaryCloudAccelerated => "primary_cloud_accelerated",
            BackendId::StandardLocal => "standard_local",
            BackendId::GeometricFallback => "geometric_fallback",
            BackendId::Simulated => "simulated",
        }
    }
}

/// 33ランドマークからなる検出結果。生成後は不変
#[derive(Debug, Clone, PartialEq)]
pub struct PoseResult {
    pub landmarks: [Landmark; LandmarkIndex::COUNT],
    /// 全体信頼度 (0.0〜1.0)
    pub overall_confidence: f32,
    /// この結果を生成したバックエンド
    pub source_backend: BackendId,
    /// 閾値未満だが最善として返された結果
    pub best_effort: bool,
}

impl PoseResult {
    pub fn new(
        landmarks: [Landmark; LandmarkIndex::COUNT],
        overall_confidence: f32,
        source_backend: BackendId,
    ) -> Self {
        Self {
            landmarks,
            overall_confidence: overall_confidence.clamp(0.0, 1.0),
            source_backend,
            best_effort: false,
        }
    }

    pub fn get(&self, index: LandmarkIndex) -> &Landmark {
        &self.landmarks[index as usize]
    }

    /// 全ランドマークの平均可視性
    pub fn average_visibility(&self) -> f32 {
        let sum: f32 = self.landmarks.iter().map(|l| l.visibility).sum();
        sum / LandmarkIndex::COUNT as f32
    }

    /// 左右の対になる点の中点。両方が閾値以上の場合のみ
    pub fn midpoint(
        &self,
        left: LandmarkIndex,
        right: LandmarkIndex,
        threshold: f32,
    ) -> Option<(f32, f32)> {
        let l = self.get(left);
        let r = self.get(right);
        if l.is_visible(threshold) && r.is_visible(threshold) {
            Some(((l.x + r.x) / 2.0, (l.y + r.y) / 2.0))
        } else {
            None
        }
    }
}
