use std::io::BufRead;
use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;
use clap::Parser;
use log::warn;

use voicelink::audio::AudioCapture;
use voicelink::detector::CommandDetector;
use voicelink::message::{parse_message, DeviceMessage};
use voicelink::model::{Classifier, NativeModel};
use voicelink::reassembly::{ChunkReassembler, ExpiryPolicy};
use voicelink::transport::{find_device_port, SerialLink};
use voicelink::{BYTES_PER_SAMPLE, STEP_SAMPLES};

#[derive(Parser)]
#[command(name = "voicelink")]
#[command(about = "Serial link and live voice-command detection for the recorder device")]
struct Args {
    /// Serial port; discovered by USB description when omitted
    #[arg(short, long)]
    port: Option<String>,

    /// Serial baud rate
    #[arg(short, long, default_value = "115200")]
    baud: u32,

    /// USB product description matched during port discovery
    #[arg(long, default_value = "USB Serial")]
    device: String,

    /// Path to the native inference library
    #[arg(short, long, default_value = "./libinference.so")]
    model: PathBuf,

    /// Hand stalled partial transfers to the shell instead of dropping them
    #[arg(long)]
    flush_partial: bool,

    /// Run without a serial device (microphone only)
    #[arg(long)]
    no_device: bool,

    /// Show scores continuously
    #[arg(long)]
    verbose: bool,
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    println!("voicelink - recorder link and command detection");
    println!("===============================================");
    println!("Model: {}", args.model.display());

    let model = NativeModel::load(&args.model)?;
    let mut detector = CommandDetector::new(model)?;
    println!("Categories: {}", detector.categories().join(", "));

    let link = if args.no_device {
        None
    } else {
        let port = match &args.port {
            Some(p) => p.clone(),
            None => find_device_port(&args.device)?,
        };
        Some(SerialLink::open(&port, args.baud)?)
    };

    let policy = if args.flush_partial {
        ExpiryPolicy::FlushPartial
    } else {
        ExpiryPolicy::Drop
    };
    let mut reassembler = ChunkReassembler::new(policy);

    let keys = spawn_key_reader();
    print_help(detector.categories());

    let mut mic: Option<AudioCapture> = None;
    let mut selected_label: Option<String> = None;
    // Samples received since the last device report, to cross-check the
    // announced total.
    let mut pending_samples: usize = 0;

    loop {
        while let Ok(key) = keys.try_recv() {
            match key {
                'q' => {
                    reassembler.clear();
                    println!("Stopping.");
                    return Ok(());
                }
                'h' => print_help(detector.categories()),
                'm' => {
                    if mic.take().is_some() {
                        detector.reset();
                        println!("Microphone stopped.");
                    } else {
                        match AudioCapture::new() {
                            Ok(capture) => {
                                detector.reset();
                                mic = Some(capture);
                                println!("Microphone live, listening...");
                            }
                            Err(e) => eprintln!("Cannot start microphone: {e:#}"),
                        }
                    }
                }
                d if d.is_ascii_digit() => {
                    let index = d.to_digit(10).unwrap() as usize;
                    match detector.categories().get(index) {
                        Some(label) => {
                            println!("Selected label '{label}'.");
                            selected_label = Some(label.clone());
                        }
                        None => println!("No label {index}; press h for the list."),
                    }
                }
                other => println!("Unknown command '{other}'; press h for help."),
            }
        }

        if let Some(link) = &link {
            while let Some(frame) = link.try_read() {
                match reassembler.accept(frame.cmd, &frame.payload, Instant::now()) {
                    Ok(Some(payload)) => handle_message(
                        frame.cmd,
                        &payload,
                        &mut detector,
                        mic.is_none(),
                        &mut pending_samples,
                        args.verbose,
                    ),
                    Ok(None) => {}
                    Err(e) => warn!("bad chunk for cmd {:#04x}: {e}", frame.cmd),
                }
            }

            for expired in reassembler.poll_expired(Instant::now()) {
                match &selected_label {
                    Some(label) => println!(
                        "Stalled transfer (cmd {:#04x}): keeping {} bytes ({}/{} chunks) under '{label}'",
                        expired.cmd,
                        expired.partial.len(),
                        expired.received,
                        expired.total,
                    ),
                    // No label context, nothing sensible to tag it with.
                    None => println!(
                        "Stalled transfer (cmd {:#04x}): discarding {} bytes, no label selected",
                        expired.cmd,
                        expired.partial.len(),
                    ),
                }
            }
        }

        if let Some(capture) = &mic {
            while let Some(block) = capture.try_read() {
                tick(&mut detector, &block, args.verbose);
            }
        }

        // Small sleep to avoid busy loop
        thread::sleep(Duration::from_millis(10));
    }
}

fn handle_message<C: Classifier>(
    cmd: u8,
    payload: &[u8],
    detector: &mut CommandDetector<C>,
    feed_detector: bool,
    pending_samples: &mut usize,
    verbose: bool,
) {
    let message = match parse_message(cmd, payload) {
        Ok(message) => message,
        Err(e) => {
            warn!("unusable payload for cmd {cmd:#04x}: {e}");
            return;
        }
    };

    match message {
        DeviceMessage::AudioRecording { samples } => {
            *pending_samples += samples.len();
            // Device audio drives the detector unless the local microphone
            // owns the window.
            if feed_detector {
                for block in samples.chunks(STEP_SAMPLES) {
                    tick(detector, block, verbose);
                }
            }
        }
        DeviceMessage::RecordingDone { report } => {
            let received = *pending_samples;
            *pending_samples = 0;
            if received == report.total_samples as usize {
                println!(
                    "Recording complete: {} samples ({} bytes)",
                    report.total_samples,
                    report.total_samples as usize * BYTES_PER_SAMPLE,
                );
            } else {
                println!(
                    "Recording incomplete: device sent {} samples, received {received}",
                    report.total_samples,
                );
            }
            print_device_scores(report.scores.as_deref(), detector.categories());
        }
        DeviceMessage::StreamReport { report } => {
            if verbose {
                println!("Stream snippet: {} samples", report.total_samples);
            }
            print_device_scores(report.scores.as_deref(), detector.categories());
        }
        DeviceMessage::Unknown { cmd, payload } => {
            warn!("unknown command {cmd:#04x} with {} bytes", payload.len());
        }
    }
}

fn tick<C: Classifier>(detector: &mut CommandDetector<C>, block: &[i16], verbose: bool) {
    match detector.push(block) {
        Ok(Some(detection)) => {
            if verbose {
                println!();
            }
            println!(
                ">>> Detected: {} (score: {:.4}) <<<",
                detection.label, detection.score
            );
        }
        Ok(None) => {
            if verbose {
                if let Some(scores) = detector.last_scores() {
                    print!("\rScore: {:.3}", scores.top());
                    let _ = std::io::Write::flush(&mut std::io::stdout());
                }
            }
        }
        // Recoverable: this tick is skipped, the debounce state stands.
        Err(e) => warn!("inference tick skipped: {e}"),
    }
}

fn print_device_scores(scores: Option<&[f32]>, categories: &[String]) {
    let Some(scores) = scores else { return };
    if scores.len() != categories.len() {
        warn!(
            "device reported {} scores for {} categories",
            scores.len(),
            categories.len()
        );
        return;
    }
    let listing: Vec<String> = categories
        .iter()
        .zip(scores)
        .map(|(label, score)| format!("{label}: {score:.4}"))
        .collect();
    println!("Device scores: {}", listing.join(", "));
}

fn print_help(categories: &[String]) {
    println!();
    println!("Commands:");
    for (i, label) in categories.iter().enumerate() {
        println!(" {i} - select label '{label}'");
    }
    println!(" m - start/stop microphone inference");
    println!(" h - this help");
    println!(" q - quit");
    println!();
}

/// Keyboard input on its own thread so the poll loop never blocks on
/// stdin. One character per line; the Enter key flushes it through.
fn spawn_key_reader() -> Receiver<char> {
    let (sender, receiver) = mpsc::channel();
    thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else { break };
            if let Some(key) = line.trim().chars().next() {
                if sender.send(key).is_err() {
                    break;
                }
            }
        }
    });
    receiver
}
