use std::io::{self, BufRead};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Mutex, PoisonError};

use anyhow::Result;
use clap::Parser;
use log::{info, warn};

use ble_capture::buffer::{BufferConfig, ByteOrder, SampleBuffer, CHANNEL_LABELS};
use ble_capture::capture_client::{CaptureOptions, SessionController};
use ble_capture::parse::{decode_samples, is_data_frame};
use ble_capture::protocol::{
    DEFAULT_NAME_PREFIX, DEFAULT_NOTIFY_CHARACTERISTIC, DEFAULT_WRITE_CHARACTERISTIC,
};
use ble_capture::types::{CaptureMode, SampleBatch, Status};

/// Capture live EEG/ECG telemetry from a BLE biosignal sensor.
///
/// Type `q` + Enter (or close stdin) to stop.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// Advertised-name prefix of the device (case-insensitive).
    #[arg(long, default_value = DEFAULT_NAME_PREFIX)]
    prefix: String,

    /// Service UUID; the first discovered service when omitted.
    #[arg(long, default_value = "")]
    service: String,

    /// Notify (telemetry) characteristic UUID.
    #[arg(long, default_value_t = DEFAULT_NOTIFY_CHARACTERISTIC.to_string())]
    notify: String,

    /// Write (control) characteristic UUID.
    #[arg(long, default_value_t = DEFAULT_WRITE_CHARACTERISTIC.to_string())]
    write: String,

    /// Signal to request from the device: EEG or ECG.
    #[arg(long, default_value_t = CaptureMode::Eeg)]
    mode: CaptureMode,

    /// Byte order of the 24-bit EEG samples: lsb24 or msb24.
    #[arg(long, default_value_t = ByteOrder::Lsb24)]
    byte_order: ByteOrder,

    /// Print each data event as a JSON line instead of a summary line.
    #[arg(long)]
    json: bool,
}

#[derive(Default)]
struct Tally {
    notifications: AtomicU64,
    data_frames: AtomicU64,
}

fn print_batch(batch: &SampleBatch, json: bool) {
    if json {
        match serde_json::to_string(batch) {
            Ok(line) => println!("{line}"),
            Err(e) => warn!("could not serialise batch: {e}"),
        }
        return;
    }

    let first: Vec<String> = batch
        .raw
        .as_deref()
        .and_then(decode_samples)
        .map(|channels| {
            channels
                .iter()
                .map(|ch| ch.first().map_or_else(|| "-".into(), |s| format!("{s:+}")))
                .collect()
        })
        .unwrap_or_default();
    println!(
        "[{:7}] {:4} B  total={:8} B  samples={:3}  ch={}  first=[{}]",
        batch.frame_type.as_str(),
        batch.last_packet_bytes,
        batch.total_bytes,
        batch.samples,
        batch.channels,
        first.join(", ")
    );
}

fn main() -> Result<()> {
    // ── Logging ───────────────────────────────────────────────────────────────
    // RUST_LOG=ble_capture=debug for per-phase detail.
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let options = CaptureOptions {
        name_prefix: args.prefix,
        service_uuid: args.service,
        notify_uuid: args.notify,
        write_uuid: args.write,
        mode: args.mode,
        ..Default::default()
    };
    info!("capturing {} from \"{}*\"", options.mode, options.name_prefix);

    // Either a terminal status or a quit command ends the run.
    let (done_tx, done_rx) = mpsc::channel::<()>();

    let status_done = done_tx.clone();
    let on_status = move |status: Status| {
        info!("status: {status}");
        if status.is_terminal() {
            let _ = status_done.send(());
        }
    };

    let tally = Arc::new(Tally::default());
    let data_tally = Arc::clone(&tally);
    let buffer = Arc::new(Mutex::new(SampleBuffer::new(BufferConfig {
        byte_order: args.byte_order,
        ..Default::default()
    })));
    let data_buffer = Arc::clone(&buffer);
    let json = args.json;
    let on_data = move |batch: SampleBatch| {
        data_tally.notifications.fetch_add(1, Ordering::Relaxed);
        if let Some(raw) = batch.raw.as_deref() {
            if is_data_frame(raw) {
                data_tally.data_frames.fetch_add(1, Ordering::Relaxed);
            }
            lock(&data_buffer).push_packet(raw);
        }
        print_batch(&batch, json);
    };

    let mut controller = SessionController::new();
    if !controller.start(options, on_status, on_data) {
        anyhow::bail!("capture session could not be started");
    }

    // Stdin is read on its own thread; `q` or EOF requests a stop.
    std::thread::spawn(move || {
        for line in io::stdin().lock().lines() {
            match line {
                Ok(l) if l.trim() == "q" => break,
                Ok(_) => {}
                Err(_) => break,
            }
        }
        let _ = done_tx.send(());
    });

    let _ = done_rx.recv();
    info!("stopping …");
    controller.stop();

    let notifications = tally.notifications.load(Ordering::Relaxed);
    let data_frames = tally.data_frames.load(Ordering::Relaxed);
    info!(
        "{} byte(s) in {notifications} notification(s), {data_frames} data frame(s), \
         {} filler/other, final state {:?}",
        controller.total_bytes(),
        notifications.saturating_sub(data_frames),
        controller.state()
    );
    report_last_second(&lock(&buffer));
    Ok(())
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Mean of each EEG channel over the newest second of buffered signal.
fn report_last_second(buffer: &SampleBuffer) {
    let second = buffer.config().sample_rate_hz as usize;
    info!("{:.1} s of EEG buffered", buffer.buffered().as_secs_f64());
    let Some(window) = buffer.take_window(second).filter(|_| second > 0) else {
        return;
    };
    for (label, lane) in CHANNEL_LABELS.iter().zip(&window) {
        let mean = lane.iter().map(|&v| f64::from(v)).sum::<f64>() / second as f64;
        info!("  {label:>5}: mean {mean:+.1} over the last second");
    }
}
