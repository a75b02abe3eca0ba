//! 音声による救援キーワード検出
//!
//! 音声認識モデル自体は外部コラボレータ。このモジュールは
//! 無音ゲート、キーワード照合、デバウンスのトリガロジックを持つ。

use anyhow::Result;
use tracing::{debug, warn};

use crate::config::AudioConfig;

/// キーワード照合で信号を出すときの信頼度
///
/// 認識モデルは単語単位のスコアを返さないため固定値。
/// 視覚リスクより弱い重みで融合される前提の値
const KEYWORD_CONFIDENCE: f32 = 0.85;

/// 音声認識エンジンの抽象。外部コラボレータ境界
pub trait SpeechEngine: Send {
    /// 1チャンク分のサンプル（モノラル f32、-1.0〜1.0）を文字列化する
    fn transcribe(&mut self, samples: &[f32]) -> Result<String>;
}

/// 救援キーワードの検出信号
#[derive(Debug, Clone, PartialEq)]
pub struct DistressSignal {
    /// 0.0〜1.0
    pub confidence: f32,
    pub matched_keyword: String,
}

/// キーワード検出アダプタ
///
/// 無音チャンクは認識にかけずに捨てる。連続 `debounce_chunks`
/// 回の一致で初めて信号を出す。
pub struct KeywordDetector<E> {
    engine: E,
    keywords: Vec<String>,
    silence_floor: f32,
    debounce_chunks: u32,
    consecutive_matches: u32,
}

impl<E: SpeechEngine> KeywordDetector<E> {
    pub fn new(engine: E, config: &AudioConfig) -> Self {
        Self {
            engine,
            keywords: config.keywords.iter().map(|k| k.to_lowercase()).collect(),
            silence_floor: config.silence_floor,
            debounce_chunks: config.debounce_chunks.max(1),
            consecutive_matches: 0,
        }
    }

    /// 1チャンク分の音声を処理し、条件を満たせば信号を返す
    pub fn on_audio_chunk(&mut self, samples: &[f32]) -> Option<DistressSignal> {
        let peak = peak_amplitude(samples);
        if peak < self.silence_floor {
            self.consecutive_matches = 0;
            return None;
        }

        // 認識精度を揃えるためピークを 1.0 に正規化してから渡す
        let normalized_samples: Vec<f32> = samples.iter().map(|s| s / peak).collect();
        let transcript = match self.engine.transcribe(&normalized_samples) {
            Ok(text) => text,
            Err(error) => {
                warn!(%error, "speech engine failed, dropping chunk");
                return None;
            }
        };

        let normalized = transcript.to_lowercase();
        let matched = self
            .keywords
            .iter()
            .find(|keyword| normalized.contains(keyword.as_str()));

        match matched {
            Some(keyword) => {
                self.consecutive_matches += 1;
                debug!(
                    keyword = keyword.as_str(),
                    streak = self.consecutive_matches,
                    "distress keyword heard"
                );
                if self.consecutive_matches >= self.debounce_chunks {
                    self.consecutive_matches = 0;
                    Some(DistressSignal {
                        confidence: KEYWORD_CONFIDENCE,
                        matched_keyword: keyword.clone(),
                    })
                } else {
                    None
                }
            }
            None => {
                self.consecutive_matches = 0;
                None
            }
        }
    }

}

fn peak_amplitude(samples: &[f32]) -> f32 {
    samples.iter().fold(0.0f32, |acc, s| acc.max(s.abs()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    /// 呼び出しごとにスクリプトの文字列を返すテスト用エンジン
    struct FakeEngine {
        script: Vec<Result<String>>,
        cursor: usize,
        calls: usize,
    }

    impl FakeEngine {
        fn new(script: Vec<Result<String>>) -> Self {
            Self { script, cursor: 0, calls: 0 }
        }
    }

    impl SpeechEngine for FakeEngine {
        fn transcribe(&mut self, _samples: &[f32]) -> Result<String> {
            self.calls += 1;
            let step = self.script.get_mut(self.cursor);
            self.cursor += 1;
            match step {
                Some(s) => std::mem::replace(s, Ok(String::new())),
                None => Ok(String::new()),
            }
        }
    }

    fn loud_chunk() -> Vec<f32> {
        vec![0.5; 1600]
    }

    fn quiet_chunk() -> Vec<f32> {
        vec![0.001; 1600]
    }

    fn detector(script: Vec<Result<String>>) -> KeywordDetector<FakeEngine> {
        KeywordDetector::new(FakeEngine::new(script), &AudioConfig::default())
    }

    #[test]
    fn test_keyword_emits_signal() {
        let mut det = detector(vec![Ok("please help me".to_string())]);
        let signal = det.on_audio_chunk(&loud_chunk()).unwrap();
        assert_eq!(signal.matched_keyword, "help");
        assert!((signal.confidence - KEYWORD_CONFIDENCE).abs() < 1e-6);
    }

    #[test]
    fn test_match_is_case_insensitive() {
        let mut det = detector(vec![Ok("HELP!".to_string())]);
        assert!(det.on_audio_chunk(&loud_chunk()).is_some());
    }

    #[test]
    fn test_cjk_keyword_matched() {
        let mut det = detector(vec![Ok("誰か助けて".to_string())]);
        let signal = det.on_audio_chunk(&loud_chunk()).unwrap();
        assert_eq!(signal.matched_keyword, "助けて");
    }

    #[test]
    fn test_unrelated_speech_is_ignored() {
        let mut det = detector(vec![Ok("nice weather today".to_string())]);
        assert!(det.on_audio_chunk(&loud_chunk()).is_none());
    }

    #[test]
    fn test_silence_skips_engine() {
        let mut det = detector(vec![Ok("help".to_string())]);
        assert!(det.on_audio_chunk(&quiet_chunk()).is_none());
        assert_eq!(det.engine.calls, 0);
    }

    #[test]
    fn test_debounce_requires_consecutive_matches() {
        let mut config = AudioConfig::default();
        config.debounce_chunks = 2;
        let engine = FakeEngine::new(vec![
            Ok("help".to_string()),
            Ok("help".to_string()),
            Ok("help".to_string()),
        ]);
        let mut det = KeywordDetector::new(engine, &config);

        // 1回目は保留、2回目で発火
        assert!(det.on_audio_chunk(&loud_chunk()).is_none());
        assert!(det.on_audio_chunk(&loud_chunk()).is_some());
        // 発火後はストリークがリセットされる
        assert!(det.on_audio_chunk(&loud_chunk()).is_none());
    }

    #[test]
    fn test_non_match_resets_streak() {
        let mut config = AudioConfig::default();
        config.debounce_chunks = 2;
        let engine = FakeEngine::new(vec![
            Ok("help".to_string()),
            Ok("hello".to_string()),
            Ok("help".to_string()),
        ]);
        let mut det = KeywordDetector::new(engine, &config);

        assert!(det.on_audio_chunk(&loud_chunk()).is_none());
        assert!(det.on_audio_chunk(&loud_chunk()).is_none());
        // 途切れたので再カウント
        assert!(det.on_audio_chunk(&loud_chunk()).is_none());
    }

    #[test]
    fn test_silence_resets_streak() {
        let mut config = AudioConfig::default();
        config.debounce_chunks = 2;
        let engine = FakeEngine::new(vec![Ok("help".to_string()), Ok("help".to_string())]);
        let mut det = KeywordDetector::new(engine, &config);

        assert!(det.on_audio_chunk(&loud_chunk()).is_none());
        assert!(det.on_audio_chunk(&quiet_chunk()).is_none());
        assert!(det.on_audio_chunk(&loud_chunk()).is_none());
    }

    #[test]
    fn test_samples_normalized_before_transcription() {
        struct PeakProbe {
            seen: f32,
        }
        impl SpeechEngine for PeakProbe {
            fn transcribe(&mut self, samples: &[f32]) -> Result<String> {
                self.seen = samples.iter().fold(0.0f32, |a, s| a.max(s.abs()));
                Ok(String::new())
            }
        }

        let mut det = KeywordDetector::new(PeakProbe { seen: 0.0 }, &AudioConfig::default());
        det.on_audio_chunk(&[0.25; 100]);
        assert!((det.engine.seen - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_engine_error_drops_chunk() {
        let mut det = detector(vec![Err(anyhow!("model not loaded")), Ok("help".to_string())]);
        assert!(det.on_audio_chunk(&loud_chunk()).is_none());
        assert!(det.on_audio_chunk(&loud_chunk()).is_some());
    }
}
