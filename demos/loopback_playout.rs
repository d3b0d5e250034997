//! Example: Capture-to-playout loop on software cards.
//!
//! A generator thread feeds a loopback input card with a moving test pattern
//! and cadenced audio. Captured frames are forwarded into the playout queues
//! of a second loopback card, whose output is clocked from the main thread at
//! 29.97 fps. Counters are printed once per second.
//!
//! Run with: `RUST_LOG=replay_pipeline=debug cargo run --example loopback_playout`

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};

use replay_pipeline::{
    capture::{CaptureAdapter, CaptureOptions},
    loopback::{LoopbackAudioPacket, LoopbackCard, LoopbackInputFrame},
    playout::{PlayoutOptions, PlayoutScheduler},
    AudioCadence, AudioFormat, DisplayMode, Error,
};

fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("replay_pipeline=info")),
        )
        .init();

    let exit_loop = Arc::new(AtomicBool::new(false));
    let exit_loop_clone = exit_loop.clone();
    ctrlc::set_handler(move || {
        exit_loop_clone.store(true, Ordering::Relaxed);
    })
    .expect("Error setting Ctrl-C handler");

    let mode = DisplayMode::by_index(1)?;
    let frame_period = Duration::from_secs_f64(1.0 / mode.frame_rate().as_f64());
    println!("Looping {} ({}x{})", mode.name, mode.width, mode.height);

    let input_card = LoopbackCard::new();
    let output_card = LoopbackCard::new();

    let mut capture = CaptureAdapter::open(
        &input_card,
        &CaptureOptions::builder().display_mode(mode).build()?,
    )?;
    let mut playout = PlayoutScheduler::open(
        &output_card,
        &PlayoutOptions::builder().display_mode(mode).build()?,
    )?;

    let captured_video = capture.take_video_output().expect("video output");
    let captured_audio = capture.take_audio_output().expect("audio output");
    let playout_video = playout.take_video_input().expect("video input");
    let playout_audio = playout.take_audio_input().expect("audio input");

    let video_forwarder = thread::spawn(move || {
        while let Ok(frame) = captured_video.get() {
            if playout_video.put(frame).is_err() {
                break;
            }
        }
    });
    let audio_forwarder = thread::spawn(move || {
        while let Ok(packet) = captured_audio.get() {
            if playout_audio.put(packet).is_err() {
                break;
            }
        }
    });

    let generator = {
        let input = input_card.input().clone();
        let exit_loop = exit_loop.clone();
        thread::spawn(move || {
            let mut cadence = AudioCadence::new(AudioFormat::SYSTEM.sample_rate, mode.frame_rate())
                .expect("valid frame rate");
            let mut shade = 0u8;
            while !exit_loop.load(Ordering::Relaxed) {
                let video = LoopbackInputFrame::yuv(mode.width, mode.height, shade);
                let audio = LoopbackAudioPacket::filled(cadence.next_packet_frames(), 0);
                input.deliver(Some(video), Some(audio));
                shade = shade.wrapping_add(1);
                thread::sleep(frame_period);
            }
        })
    };

    let start = Instant::now();
    let mut last_report = Instant::now();
    while !exit_loop.load(Ordering::Relaxed) && start.elapsed() < Duration::from_secs(30) {
        let tick_start = Instant::now();
        output_card.output().tick();

        if let Err(e) = playout.check() {
            eprintln!("Playout fault: {e}");
            break;
        }
        if let Err(e) = capture.check() {
            eprintln!("Capture fault: {e}");
            break;
        }

        if last_report.elapsed() >= Duration::from_secs(1) {
            let p = playout.stats();
            let c = capture.stats();
            println!(
                "captured {:>5}  scheduled {:>5}  fresh {:>5}  repeated {:>4}  audio {:>8}",
                c.frames_captured,
                p.frame_counter,
                p.fresh_frames,
                p.repeated_frames,
                p.audio_frames_submitted
            );
            last_report = Instant::now();
        }

        if let Some(rest) = frame_period.checked_sub(tick_start.elapsed()) {
            thread::sleep(rest);
        }
    }

    exit_loop.store(true, Ordering::Relaxed);
    // Playout goes first so forwarders blocked on a full queue see the peer die.
    drop(playout);
    let _ = generator.join();
    drop(capture);
    let _ = video_forwarder.join();
    let _ = audio_forwarder.join();

    println!("Done.");
    Ok(())
}
