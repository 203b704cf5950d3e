//! Capture a few seconds of audio from the first wearable found and write
//! it out as a WAV file.
//!
//! Usage: `capture [seconds] [output.wav]`

use anyhow::{bail, Context, Result};
use std::time::Duration;
use tracing::info;
use wearlink::backend::BtleBackend;
use wearlink::protocol::AUDIO_SERVICE_UUID;
use wearlink::{ConnectionManager, DeviceScanner, Transport, TransportConfig};

#[tokio::main]
async fn main() -> Result<()> {
    let config = TransportConfig::default();
    let _logging = wearlink::logging::init_logging(&config.log);

    let mut args = std::env::args().skip(1);
    let seconds: u64 = args
        .next()
        .map(|s| s.parse())
        .transpose()
        .context("seconds must be a number")?
        .unwrap_or(10);
    let output = args.next().unwrap_or_else(|| "capture.wav".to_string());

    let backend = std::sync::Arc::new(
        BtleBackend::new()
            .await
            .context("bluetooth adapter unavailable")?,
    ) as std::sync::Arc<dyn wearlink::platform::BleBackend>;

    info!("scanning for wearables");
    let scanner = DeviceScanner::new(backend.clone());
    let mut session = scanner
        .start(
            vec![AUDIO_SERVICE_UUID],
            Duration::from_millis(config.scan_timeout_ms),
        )
        .await?;
    let Some(device) = session.next_device().await else {
        bail!("no wearable found");
    };
    session.stop().await;
    info!(id = %device.id, name = %device.name, rssi = device.rssi, "using device");

    let manager = std::sync::Arc::new(ConnectionManager::new(backend, config));
    let transport = Transport::new(device.id.clone(), manager);
    transport.connect().await?;

    if let Some(level) = transport.battery_level().await {
        info!(percent = level, "battery");
    }

    let mut stream = transport.start_audio_stream().await?;
    info!(
        codec = ?stream.codec(),
        sample_rate = stream.sample_rate(),
        seconds,
        "recording"
    );

    let sample_rate = stream.sample_rate();
    let mut pcm = Vec::new();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(seconds);
    loop {
        let buffer = tokio::select! {
            _ = tokio::time::sleep_until(deadline) => break,
            buffer = stream.next_buffer() => buffer,
        };
        match buffer {
            Some(buffer) => pcm.extend_from_slice(&buffer.to_le_bytes()),
            None => break,
        }
        while let Some(diagnostic) = stream.try_next_diagnostic() {
            info!(?diagnostic, "stream diagnostic");
        }
    }
    transport.dispose().await;

    if pcm.is_empty() {
        bail!("no audio received");
    }
    let mut wav = wav_header(pcm.len() as u32, sample_rate, 1, 16);
    wav.extend_from_slice(&pcm);
    std::fs::write(&output, &wav).with_context(|| format!("writing {output}"))?;
    info!(file = %output, bytes = pcm.len(), "capture written");
    Ok(())
}

/// Standard 44-byte RIFF/WAVE header for 16-bit linear PCM.
fn wav_header(data_len: u32, sample_rate: u32, channels: u16, bits_per_sample: u16) -> Vec<u8> {
    let byte_rate = sample_rate * channels as u32 * bits_per_sample as u32 / 8;
    let block_align = channels * bits_per_sample / 8;
    let mut header = Vec::with_capacity(44);
    header.extend_from_slice(b"RIFF");
    header.extend_from_slice(&(36 + data_len).to_le_bytes());
    header.extend_from_slice(b"WAVE");
    header.extend_from_slice(b"fmt ");
    header.extend_from_slice(&16u32.to_le_bytes());
    header.extend_from_slice(&1u16.to_le_bytes()); // PCM
    header.extend_from_slice(&channels.to_le_bytes());
    header.extend_from_slice(&sample_rate.to_le_bytes());
    header.extend_from_slice(&byte_rate.to_le_bytes());
    header.extend_from_slice(&block_align.to_le_bytes());
    header.extend_from_slice(&bits_per_sample.to_le_bytes());
    header.extend_from_slice(b"data");
    header.extend_from_slice(&data_len.to_le_bytes());
    header
}
