use std::time::Instant;

use opencv::core::Mat;
use thiserror::Error;

use crate::landmark::{BackendId, PoseResult};

pub mod cloud;
pub mod completion;
pub mod geometric;
pub mod local;
pub mod simulated;
pub mod strategy;

pub use cloud::CloudAcceleratedBackend;
pub use completion::{complete_landmarks, MotionHistory};
pub use geometric::GeometricBackend;
pub use local::LocalModelBackend;
pub use simulated::SimulatedBackend;

/// バックエンド検出の失敗。どちらもチェーン側で回復され、致命的にはならない
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum DetectError {
    /// 全ストラテジーを試しても姿勢が得られなかった
    #[error("no pose signal from any strategy")]
    NoSignal,
    /// 時間予算を超過した
    #[error("backend exceeded its time budget")]
    Timeout,
}

/// 姿勢検出バックエンドの共通インターフェース
///
/// 実装は内部で複数のストラテジーを順に試し、`deadline` を跨ぐ前に
/// 打ち切る（協調的キャンセル）。成功時は必ず33点そろった
/// `PoseResult` を返すこと。内部エラーは `NoSignal` に変換し、
/// パニックさせない。
pub trait PoseBackend: Send {
    fn id(&self) -> BackendId;

    fn detect(&mut self, frame: &Mat, deadline: Instant) -> Result<Vec<PoseResult>, DetectError>;
}

/// フレームが処理可能かの共通チェック
pub(crate) fn frame_is_usable(frame: &Mat) -> bool {
    use opencv::prelude::MatTraitConst;
    !frame.empty()
}
