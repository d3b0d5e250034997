//! Scenario tests for playout and capture running against the loopback card.

use std::time::Duration;

use crate::{
    capture::{CaptureAdapter, CaptureOptions},
    convert::NativePixelFormat,
    device::CompletionResult,
    error::{Error, ErrorCategory},
    frames::{AudioFormat, AudioPacket, Frame, PixelFormat},
    handoff,
    loopback::{LoopbackCard, LoopbackInputFrame},
    playout::{PlayoutOptions, PlayoutScheduler, PlayoutState},
    timing::DisplayMode,
};

const TINY: DisplayMode = DisplayMode {
    name: "tiny 29.97",
    time_scale: 30000,
    frame_duration: 1001,
    mode_code: 0,
    width: 4,
    height: 2,
};

fn tiny_frame(fill: u8) -> Frame {
    Frame::from_owned(4, 2, PixelFormat::CbYCrY8422, 8, vec![fill; 16]).unwrap()
}

fn video_only() -> PlayoutOptions {
    PlayoutOptions::builder()
        .display_mode(TINY)
        .audio(false)
        .build()
        .unwrap()
}

#[test]
fn test_playout_repeats_last_frame_when_queue_runs_dry() {
    let options = PlayoutOptions::builder()
        .display_mode(TINY)
        .video_queue_capacity(4)
        .audio_queue_capacity(4)
        .build()
        .unwrap();
    let (tx, rx) = handoff::bounded(options.video_queue_capacity);
    for i in 1..=4 {
        tx.put(tiny_frame(i)).unwrap();
    }
    let (audio_tx, audio_rx) = handoff::bounded(options.audio_queue_capacity);
    for n in [1601, 1602, 1601, 1602] {
        audio_tx
            .put(AudioPacket::silent(AudioFormat::SYSTEM, n))
            .unwrap();
    }

    let card = LoopbackCard::new();
    let playout = PlayoutScheduler::open_with_inputs(&card, &options, rx, Some(audio_rx)).unwrap();
    assert_eq!(playout.state(), PlayoutState::Playing);
    assert_eq!(card.output().audio_accepted().len(), 6404 * 4);

    for _ in 0..6 {
        assert!(card.output().tick());
    }

    let scheduled = card.output().scheduled();
    assert_eq!(scheduled.len(), 10);
    for (i, record) in scheduled.iter().enumerate() {
        let expected = (i as u8 + 1).min(4);
        assert_eq!(record.data, vec![expected; 16], "frame {i}");
    }
    let times: Vec<i64> = scheduled.iter().map(|r| r.display_time).collect();
    assert_eq!(times, (0..10).map(|n| n * 1001).collect::<Vec<_>>());
    assert!(scheduled.iter().all(|r| r.duration == 1001 && r.time_scale == 30000));

    let stats = playout.stats();
    assert_eq!(stats.frame_counter, 10);
    assert_eq!(stats.fresh_frames, 4);
    assert_eq!(stats.repeated_frames, 6);
    assert_eq!(stats.no_content, 0);
    assert_eq!(stats.audio_frames_submitted, 6404 + 6406);
    assert!(playout.check().is_ok());
    drop(tx);
    drop(audio_tx);
}

#[test]
fn test_mis_sized_frame_is_contract_violation() {
    let card = LoopbackCard::new();
    let mut playout = PlayoutScheduler::open(&card, &video_only()).unwrap();
    let frames = playout.take_video_input().unwrap();
    frames
        .put(Frame::from_owned(2, 1, PixelFormat::CbYCrY8422, 4, vec![0x77; 4]).unwrap())
        .unwrap();
    card.output().tick();

    let err = playout.check().unwrap_err();
    assert_eq!(err.category(), ErrorCategory::ContractViolation);
    assert!(err.to_string().contains("2x1"), "{err}");
    assert!(card
        .output()
        .scheduled()
        .iter()
        .all(|r| !r.data.contains(&0x77)));
}

#[test]
fn test_empty_frame_is_rejected_without_panicking() {
    let card = LoopbackCard::new();
    let mut playout = PlayoutScheduler::open(&card, &video_only()).unwrap();
    let frames = playout.take_video_input().unwrap();
    frames
        .put(Frame::new(0, 2, PixelFormat::CbYCrY8422))
        .unwrap();
    card.output().tick();

    assert!(matches!(playout.check(), Err(Error::ContractViolation(_))));
    assert_eq!(playout.stats().frame_counter, 4);
}

#[test]
fn test_zero_frame_audio_packet_does_not_stall_render() {
    let card = LoopbackCard::with_audio_buffer(8000, 0);
    let options = PlayoutOptions::builder()
        .display_mode(TINY)
        .build()
        .unwrap();
    let mut playout = PlayoutScheduler::open(&card, &options).unwrap();
    let audio = playout.take_audio_input().unwrap();

    audio
        .put(AudioPacket::silent(AudioFormat::SYSTEM, 0))
        .unwrap();
    let mut packet = AudioPacket::silent(AudioFormat::SYSTEM, 1000);
    packet.data_mut().fill(0x22);
    audio.put(packet).unwrap();
    card.output().tick();

    assert_eq!(playout.stats().audio_frames_submitted, 6404 + 1000);
    let accepted = card.output().audio_accepted();
    assert!(accepted[6404 * 4..].iter().all(|&b| b == 0x22));
    assert!(playout.check().is_ok());
}

#[test]
fn test_playout_without_any_content_still_schedules() {
    let card = LoopbackCard::new();
    let mut playout = PlayoutScheduler::open(&card, &video_only()).unwrap();
    assert_eq!(playout.stats().no_content, 4);
    assert_eq!(card.output().pending_frames(), 4);

    let frames = playout.take_video_input().unwrap();
    frames.put(tiny_frame(9)).unwrap();
    card.output().tick();

    let last = card.output().scheduled().pop().unwrap();
    assert_eq!(last.data, vec![9; 16]);
    assert_eq!(last.display_time, 4 * 1001);
    assert!(playout.check().is_ok());
}

#[test]
fn test_playout_converts_bgra_for_argb_device() {
    let options = PlayoutOptions::builder()
        .display_mode(TINY)
        .pixel_format(PixelFormat::BGRAn8)
        .native_format(NativePixelFormat::Argb8Bit)
        .audio(false)
        .preroll_frames(1)
        .build()
        .unwrap();
    let (tx, rx) = handoff::bounded(1);
    let pixels: Vec<u8> = [1u8, 2, 3, 4].repeat(8);
    tx.put(Frame::from_owned(4, 2, PixelFormat::BGRAn8, 16, pixels).unwrap())
        .unwrap();

    let card = LoopbackCard::new();
    let _playout = PlayoutScheduler::open_with_inputs(&card, &options, rx, None).unwrap();
    let first = &card.output().scheduled()[0];
    assert_eq!(&first.data[..8], &[4, 3, 2, 1, 4, 3, 2, 1]);
}

#[test]
fn test_completion_results_are_counted_not_fatal() {
    let card = LoopbackCard::new();
    let playout = PlayoutScheduler::open(&card, &video_only()).unwrap();
    card.output()
        .queue_completion_result(CompletionResult::DisplayedLate);
    card.output().queue_completion_result(CompletionResult::Dropped);
    card.output().queue_completion_result(CompletionResult::Flushed);
    for _ in 0..4 {
        card.output().tick();
    }

    let stats = playout.stats();
    assert_eq!(stats.displayed_late, 1);
    assert_eq!(stats.dropped, 1);
    assert_eq!(stats.flushed, 1);
    assert_eq!(stats.frame_counter, 8);
    assert!(playout.check().is_ok());
}

#[test]
fn test_schedule_failure_in_callback_is_latched() {
    let card = LoopbackCard::new();
    let playout = PlayoutScheduler::open(&card, &video_only()).unwrap();
    card.output().fail("schedule_video_frame");
    card.output().tick();

    match playout.check() {
        Err(err @ Error::DeviceFault { call, .. }) => {
            assert_eq!(*call, "schedule_video_frame");
            assert_eq!(err.category(), ErrorCategory::ContractViolation);
        }
        other => panic!("unexpected result: {other:?}"),
    }
    // The observer is inert now; further completions are ignored.
    card.output().tick();
    assert_eq!(playout.stats().frame_counter, 4);
}

#[test]
fn test_playout_teardown_order() {
    let card = LoopbackCard::new();
    let options = PlayoutOptions::builder()
        .display_mode(TINY)
        .build()
        .unwrap();
    let playout = PlayoutScheduler::open(&card, &options).unwrap();
    assert!(card.output().is_playing());
    drop(playout);

    let calls = card.output().calls();
    let tail = &calls[calls.len() - 4..];
    assert_eq!(
        tail,
        &[
            "stop_scheduled_playback",
            "disable_audio_output",
            "disable_video_output",
            "clear_observers",
        ]
    );
    assert!(!card.output().has_observers());
}

#[test]
fn test_failed_configuration_cleans_up() {
    let card = LoopbackCard::new();
    card.output().fail("enable_video_output");
    let err = PlayoutScheduler::open(&card, &video_only()).unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Configuration);
    assert!(err.to_string().contains("enable_video_output"), "{err}");

    let calls = card.output().calls();
    assert!(!calls.contains(&"disable_video_output"));
    assert_eq!(calls.last(), Some(&"clear_observers"));
}

#[test]
fn test_low_latency_rejection_is_not_fatal() {
    let card = LoopbackCard::new();
    card.output().fail("set_config_flag");
    let playout = PlayoutScheduler::open(&card, &video_only()).unwrap();
    assert_eq!(playout.state(), PlayoutState::Playing);
    assert!(!card.output().low_latency());
}

#[test]
fn test_missing_card() {
    let card = LoopbackCard::new();
    let options = PlayoutOptions::builder()
        .card_index(2)
        .audio(false)
        .build()
        .unwrap();
    let err = PlayoutScheduler::open(&card, &options).unwrap_err();
    assert!(matches!(
        err,
        Error::DeviceNotFound {
            index: 2,
            available: 1
        }
    ));
}

#[test]
fn test_audio_preroll_then_partial_acceptance() {
    let card = LoopbackCard::with_audio_buffer(8000, 1000);
    let options = PlayoutOptions::builder()
        .display_mode(TINY)
        .build()
        .unwrap();
    let mut playout = PlayoutScheduler::open(&card, &options).unwrap();
    assert_eq!(card.output().audio_buffered(), 6404);

    let audio = playout.take_audio_input().unwrap();
    let mut packet = AudioPacket::silent(AudioFormat::SYSTEM, 3000);
    packet.data_mut().fill(0x11);
    audio.put(packet).unwrap();

    // 1000 drained, 2596 of 3000 fit.
    card.output().tick();
    assert_eq!(playout.stats().audio_frames_submitted, 6404 + 2596);
    // 1000 more drained, the remaining 404 fit and the packet is done.
    card.output().tick();
    assert_eq!(playout.stats().audio_frames_submitted, 6404 + 3000);

    let accepted = card.output().audio_accepted();
    assert_eq!(accepted.len(), (6404 + 3000) * 4);
    assert!(accepted[..6404 * 4].iter().all(|&b| b == 0));
    assert!(accepted[6404 * 4..].iter().all(|&b| b == 0x11));
    assert!(playout.check().is_ok());
}

#[test]
fn test_audio_over_acceptance_is_contract_violation() {
    let card = LoopbackCard::new();
    let options = PlayoutOptions::builder()
        .display_mode(TINY)
        .build()
        .unwrap();
    let mut playout = PlayoutScheduler::open(&card, &options).unwrap();
    let audio = playout.take_audio_input().unwrap();

    card.output().over_accept_audio(true);
    audio
        .put(AudioPacket::silent(AudioFormat::SYSTEM, 1602))
        .unwrap();
    card.output().tick();

    let err = playout.check().unwrap_err();
    assert_eq!(err.category(), ErrorCategory::ContractViolation);
}

#[test]
fn test_audio_preroll_timeout() {
    let card = LoopbackCard::with_audio_buffer(0, 0);
    let options = PlayoutOptions::builder()
        .display_mode(TINY)
        .preroll_timeout(Duration::from_millis(50))
        .build()
        .unwrap();
    let err = PlayoutScheduler::open(&card, &options).unwrap_err();
    assert!(matches!(err, Error::PrerollTimeout(_)));

    let calls = card.output().calls();
    assert!(!calls.contains(&"start_scheduled_playback"));
    assert!(calls.contains(&"disable_audio_output"));
    assert!(calls.contains(&"disable_video_output"));
}

#[test]
fn test_capture_to_playout_loopback() {
    let input_card = LoopbackCard::new();
    let output_card = LoopbackCard::new();

    let capture_options = CaptureOptions::builder()
        .display_mode(TINY)
        .audio(false)
        .build()
        .unwrap();
    let mut capture = CaptureAdapter::open(&input_card, &capture_options).unwrap();
    let captured = capture.take_video_output().unwrap();

    let source = LoopbackInputFrame::yuv(4, 2, 0x42);
    assert!(input_card.input().deliver(Some(source.clone()), None));
    let frame = captured.get().unwrap();
    assert!(frame.is_borrowed());
    assert_eq!(source.outstanding_refs(), 1);

    let mut playout = PlayoutScheduler::open(&output_card, &video_only()).unwrap();
    let frames = playout.take_video_input().unwrap();
    frames.put(frame).unwrap();
    output_card.output().tick();

    let last = output_card.output().scheduled().pop().unwrap();
    assert_eq!(last.data, vec![0x42; 16]);
    // The playout keeps the frame for repeats; the device buffer is released
    // once the scheduler goes away.
    drop(playout);
    assert_eq!(source.outstanding_refs(), 0);
}
