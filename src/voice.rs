//! Speech-to-text for Telegram voice notes using whisper-rs.

use std::path::Path;
use std::process::{Command, Stdio};
use std::sync::Arc;

use tracing::{debug, info};
use whisper_rs::{FullParams, SamplingStrategy, WhisperContext, WhisperContextParameters};

/// Loaded Whisper model. Cheap to clone.
#[derive(Clone)]
pub struct Transcriber {
    ctx: Arc<WhisperContext>,
}

impl Transcriber {
    /// Load a Whisper model from a .bin file.
    pub fn new(model_path: &Path) -> Result<Self, String> {
        info!("Loading Whisper model from {:?}", model_path);

        if !model_path.exists() {
            return Err(format!("Model file not found: {:?}", model_path));
        }

        let ctx = WhisperContext::new_with_params(
            model_path.to_str().ok_or("Invalid model path")?,
            WhisperContextParameters::default(),
        )
        .map_err(|e| format!("Failed to load Whisper model: {e}"))?;

        info!("Whisper model loaded");
        Ok(Self { ctx: Arc::new(ctx) })
    }

    /// Transcribe an OGG Opus voice note. Blocking; call from a blocking task.
    pub fn transcribe(&self, ogg_data: &[u8]) -> Result<String, String> {
        debug!("Transcribing {} bytes of audio", ogg_data.len());
        let pcm = ogg_to_pcm(ogg_data)?;

        let mut state = self
            .ctx
            .create_state()
            .map_err(|e| format!("Failed to create Whisper state: {e}"))?;

        let mut params = FullParams::new(SamplingStrategy::Greedy { best_of: 1 });
        params.set_language(Some("auto"));
        params.set_translate(false);
        params.set_no_timestamps(true);
        params.set_print_progress(false);

        state
            .full(params, &pcm)
            .map_err(|e| format!("Whisper transcription failed: {e}"))?;

        let segments: Vec<String> = state
            .as_iter()
            .filter_map(|segment| segment.to_str().ok().map(|s| s.trim().to_string()))
            .filter(|s| !s.is_empty())
            .collect();
        let text = segments.join(" ");
        info!("Transcribed {} segment(s), {} chars", segments.len(), text.chars().count());
        Ok(text)
    }
}

/// Convert OGG Opus audio to 16 kHz mono f32 samples with ffmpeg.
fn ogg_to_pcm(ogg_data: &[u8]) -> Result<Vec<f32>, String> {
    // ffmpeg needs seekable input for OGG
    let input_path = std::env::temp_dir().join(format!("aigate_voice_{}.ogg", uuid::Uuid::new_v4()));
    std::fs::write(&input_path, ogg_data).map_err(|e| format!("Failed to write temp input: {e}"))?;

    let output = Command::new("ffmpeg")
        .arg("-i")
        .arg(&input_path)
        .args(["-ar", "16000", "-ac", "1", "-f", "s16le", "-acodec", "pcm_s16le", "-y", "pipe:1"])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output();
    let _ = std::fs::remove_file(&input_path);
    let output = output.map_err(|e| format!("Failed to run ffmpeg: {e}"))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(format!("ffmpeg failed: {}", stderr));
    }

    let samples = pcm_s16le_to_f32(&output.stdout);
    debug!("Converted to {} samples", samples.len());
    Ok(samples)
}

fn pcm_s16le_to_f32(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(2)
        .map(|chunk| i16::from_le_bytes([chunk[0], chunk[1]]) as f32 / 32768.0)
        .collect()
}
