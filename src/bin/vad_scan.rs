/// Offline speech segmentation of a WAV file
/// Prints the speech segments the capture VAD would find
use anyhow::{bail, Context, Result};
use mrcp_media::vad::{VadConfig, VadDetector, VadEvent, WebRtcModel};

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let Some(path) = std::env::args().nth(1) else {
        bail!("usage: vad_scan <file.wav> [start_threshold] [min_silence_ms]");
    };
    let mut reader = hound::WavReader::open(&path).with_context(|| format!("failed to open {}", path))?;
    let spec = reader.spec();
    if spec.channels != 1 || spec.bits_per_sample != 16 || spec.sample_format != hound::SampleFormat::Int {
        bail!("{} must be mono 16-bit PCM, got {:?}", path, spec);
    }

    let mut config = VadConfig {
        sample_rate: spec.sample_rate,
        frame_samples: spec.sample_rate as usize / 50 * 3,
        ..Default::default()
    };
    if let Some(threshold) = std::env::args().nth(2) {
        config.start_threshold = threshold.parse().context("start_threshold must be a number")?;
    }
    if let Some(silence) = std::env::args().nth(3) {
        config.min_silence_ms = silence.parse().context("min_silence_ms must be an integer")?;
    }

    let model = WebRtcModel::new(config.sample_rate, config.webrtc_mode)?;
    let mut vad = VadDetector::new(config.clone(), Box::new(model))?;

    println!("🎤 Scanning {} ({}Hz)", path, spec.sample_rate);

    let samples = reader.samples::<i16>().collect::<Result<Vec<_>, _>>()?;
    let rate = spec.sample_rate as f64;
    let mut start = None;
    let mut segments = 0;

    for frame in samples.chunks(config.frame_samples) {
        let pcm: Vec<u8> = frame.iter().flat_map(|s| s.to_le_bytes()).collect();
        match vad.process_frame(&pcm) {
            Some(VadEvent::SpeechStart { sample }) => start = Some(sample),
            Some(VadEvent::SpeechEnd { sample }) => {
                if let Some(begin) = start.take() {
                    segments += 1;
                    println!(
                        "  segment {:>3}: {:>8.2}s - {:>8.2}s",
                        segments,
                        begin as f64 / rate,
                        sample as f64 / rate
                    );
                }
            }
            None => {}
        }
    }

    if let Some(begin) = start {
        segments += 1;
        println!("  segment {:>3}: {:>8.2}s - (end of file)", segments, begin as f64 / rate);
    }

    let stats = vad.energy_stats();
    println!(
        "✅ {} segment(s); rms avg {:.4}, min {:.4}, max {:.4}",
        segments,
        stats.average(),
        stats.min(),
        stats.max()
    );
    Ok(())
}
