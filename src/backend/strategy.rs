use anyhow::Result;
use ndarray::Array4;
use opencv::{
    core::{AlgorithmHint, Mat, Size, BORDER_DEFAULT, CV_32FC3},
    imgproc,
    prelude::*,
};

/// 1バックエンド内で順に試す前処理ストラテジー
///
/// 照明・遮蔽の悪いフレームでは単一の前処理だと2〜3割のフレームで
/// 検出に失敗するため、宣言順に試して最初に信頼度の出た結果を使う。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// 入力フレームそのまま
    Raw,
    /// 半分に縮小（ノイズの多い高解像度フレーム向け）
    Downscaled,
    /// ヒストグラム平坦化によるコントラスト強調（低照度向け）
    ContrastEnhanced,
    /// 平滑化＋エッジ抽出（強い背景テクスチャ向け）
    EdgeAssisted,
}

impl Strategy {
    pub const ORDER: [Strategy; 4] = [
        Strategy::Raw,
        Strategy::Downscaled,
        Strategy::ContrastEnhanced,
        Strategy::EdgeAssisted,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Strategy::Raw => "raw",
            Strategy::Downscaled => "downscaled",
            Strategy::ContrastEnhanced => "contrast_enhanced",
            Strategy::EdgeAssisted => "edge_assisted",
        }
    }

    /// ストラテジーを適用したBGRフレームを返す
    pub fn apply(&self, frame: &Mat) -> Result<Mat> {
        match self {
            Strategy::Raw => Ok(frame.clone()),
            Strategy::Downscaled => downscale_half(frame),
            Strategy::ContrastEnhanced => equalize_contrast(frame),
            Strategy::EdgeAssisted => edge_map(frame),
        }
    }
}

fn downscale_half(frame: &Mat) -> Result<Mat> {
    let size = frame.size()?;
    let target = Size::new((size.width / 2).max(1), (size.height / 2).max(1));
    let mut resized = Mat::default();
    imgproc::resize(frame, &mut resized, target, 0.0, 0.0, imgproc::INTER_AREA)?;
    Ok(resized)
}

fn equalize_contrast(frame: &Mat) -> Result<Mat> {
    let gray = to_gray(frame)?;
    let mut equalized = Mat::default();
    imgproc::equalize_hist(&gray, &mut equalized)?;
    let mut bgr = Mat::default();
    imgproc::cvt_color(
        &equalized,
        &mut bgr,
        imgproc::COLOR_GRAY2BGR,
        0,
        AlgorithmHint::ALGO_HINT_DEFAULT,
    )?;
    Ok(bgr)
}

fn edge_map(frame: &Mat) -> Result<Mat> {
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
    let mut bgr = Mat::default();
    imgproc::cvt_color(
        &edges,
        &mut bgr,
        imgproc::COLOR_GRAY2BGR,
        0,
        AlgorithmHint::ALGO_HINT_DEFAULT,
    )?;
    Ok(bgr)
}

pub(crate) fn to_gray(frame: &Mat) -> Result<Mat> {
    let mut gray = Mat::default();
    imgproc::cvt_color(
        frame,
        &mut gray,
        imgproc::COLOR_BGR2GRAY,
        0,
        AlgorithmHint::ALGO_HINT_DEFAULT,
    )?;
    Ok(gray)
}

/// BGRフレームをモデル入力テンソルに変換
///
/// - BGR -> RGB
/// - input_size x input_size にリサイズ
/// - [1, input_size, input_size, 3] の f32 テンソル (0.0-1.0)
pub fn preprocess_tensor(frame: &Mat, input_size: i32) -> Result<Array4<f32>> {
    let mut rgb = Mat::default();
    imgproc::cvt_color(
        frame,
        &mut rgb,
        imgproc::COLOR_BGR2RGB,
        0,
        AlgorithmHint::ALGO_HINT_DEFAULT,
    )?;

    let mut resized = Mat::default();
    imgproc::resize(
        &rgb,
        &mut resized,
        Size::new(input_size, input_size),
        0.0,
        0.0,
        imgproc::INTER_LINEAR,
    )?;

    let mut float_mat = Mat::default();
    resized.convert_to(&mut float_mat, CV_32FC3, 1.0 / 255.0, 0.0)?;

    let n = input_size as usize;
    let mut tensor = Array4::<f32>::zeros((1, n, n, 3));
    for y in 0..input_size {
        for x in 0..input_size {
            let pixel = float_mat.at_2d::<opencv::core::Vec3f>(y, x)?;
            tensor[[0, y as usize, x as usize, 0]] = pixel[0];
            tensor[[0, y as usize, x as usize, 1]] = pixel[1];
            tensor[[0, y as usize, x as usize, 2]] = pixel[2];
        }
    }

    Ok(tensor)
}
