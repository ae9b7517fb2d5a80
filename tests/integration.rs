//! Integration tests for audio-stream-client.
//!
//! Everything runs against the in-process `LoopbackServer` and `MockPolicy`.
//! Tests that require actual audio hardware are marked with `#[ignore]` and
//! should be run manually.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::time::{Duration, Instant};

use audio_stream_client::policy::{
    DeviceChange, InterruptEvent, InterruptForceType, InterruptHint, InterruptType, MockPolicy,
};
use audio_stream_client::server::LoopbackServer;
use audio_stream_client::{
    data_callback, event_callback, event_channel, AudioContext, AudioStreamParams, Capturer,
    CapturerInfo, ChangeSource, ContentType, DeviceInfo, DeviceType, ErrorKind, EventCallback,
    RecoveryConfig, RenderMode, RenderRate, Renderer, RendererInfo, SourceType, StateCommand,
    StreamConfig, StreamEvent, StreamState, StreamUsage, TransportClass,
};

type EventLog = Arc<Mutex<Vec<StreamEvent>>>;

fn setup() -> (AudioContext, LoopbackServer, MockPolicy) {
    setup_with(StreamConfig::default())
}

fn setup_with(config: StreamConfig) -> (AudioContext, LoopbackServer, MockPolicy) {
    let server = LoopbackServer::new();
    let policy = MockPolicy::new();
    let ctx = AudioContext::new(server.clone(), policy.clone()).with_config(config);
    (ctx, server, policy)
}

fn event_log() -> (EventCallback, EventLog) {
    let log = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&log);
    let callback = event_callback(move |event| sink.lock().unwrap().push(event));
    (callback, log)
}

fn error_events(log: &EventLog) -> usize {
    log.lock()
        .unwrap()
        .iter()
        .filter(|e| matches!(e, StreamEvent::Error { .. }))
        .count()
}

fn interrupts(log: &EventLog) -> Vec<InterruptEvent> {
    log.lock()
        .unwrap()
        .iter()
        .filter_map(|e| match e {
            StreamEvent::Interrupt(interrupt) => Some(*interrupt),
            _ => None,
        })
        .collect()
}

fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    condition()
}

fn forced(event_type: InterruptType, hint: InterruptHint, duck_volume: f32) -> InterruptEvent {
    InterruptEvent::new(event_type, InterruptForceType::Force, hint, duck_volume)
}

fn running_renderer(ctx: &AudioContext, log: EventCallback) -> Renderer {
    let renderer = Renderer::builder(ctx)
        .params(AudioStreamParams::cd_quality())
        .event_callback(log)
        .build()
        .unwrap();
    renderer.start().unwrap();
    renderer
}

/// 10ms of 48kHz stereo S16LE.
const TEN_MS: usize = 1920;

#[test]
fn test_normal_playback_scenario() {
    let (ctx, server, policy) = setup();
    let renderer = Renderer::builder(&ctx)
        .info(RendererInfo::new(ContentType::Music, StreamUsage::Media))
        .build()
        .unwrap();
    assert_eq!(renderer.state(), StreamState::New);

    renderer.set_params(AudioStreamParams::cd_quality()).unwrap();
    assert_eq!(renderer.state(), StreamState::Prepared);

    renderer.start().unwrap();
    assert_eq!(renderer.state(), StreamState::Running);
    let session = renderer.session_id().unwrap();
    assert!(policy.is_active(session));

    let data = vec![0u8; TEN_MS * 4];
    assert_eq!(renderer.write(&data).unwrap(), data.len());
    assert_eq!(renderer.frames_written(), 1920);

    renderer.stop().unwrap();
    assert_eq!(renderer.state(), StreamState::Stopped);
    assert!(!policy.is_active(session));

    renderer.release().unwrap();
    assert_eq!(renderer.state(), StreamState::Released);
    assert_eq!(server.released_count(), 1);
    assert!(!policy.has_interrupt_callback(session));

    // Releasing again is harmless.
    renderer.release().unwrap();
}

fn drive_to(renderer: &Renderer, target: StreamState) {
    let path: &[StreamState] = match target {
        StreamState::New => &[],
        StreamState::Prepared => &[StreamState::Prepared],
        StreamState::Running => &[StreamState::Prepared, StreamState::Running],
        StreamState::Paused => &[StreamState::Prepared, StreamState::Running, StreamState::Paused],
        StreamState::Stopped => &[StreamState::Prepared, StreamState::Running, StreamState::Stopped],
        StreamState::Released => &[StreamState::Prepared, StreamState::Released],
        other => panic!("{other} is not reachable by the application"),
    };
    for step in path {
        match step {
            StreamState::Prepared => renderer.set_params(AudioStreamParams::cd_quality()),
            StreamState::Running => renderer.start(),
            StreamState::Paused => renderer.pause(),
            StreamState::Stopped => renderer.stop(),
            StreamState::Released => renderer.release(),
            _ => unreachable!(),
        }
        .unwrap();
    }
    assert_eq!(renderer.state(), target);
}

fn apply(renderer: &Renderer, command: StateCommand) -> bool {
    match command {
        StateCommand::Prepare => renderer.set_params(AudioStreamParams::cd_quality()),
        StateCommand::Start => renderer.start(),
        StateCommand::Pause => renderer.pause(),
        StateCommand::Stop => renderer.stop(),
        StateCommand::Release => renderer.release(),
    }
    .is_ok()
}

#[test]
fn test_every_command_from_every_state_is_closed() {
    let states = [
        StreamState::New,
        StreamState::Prepared,
        StreamState::Running,
        StreamState::Paused,
        StreamState::Stopped,
        StreamState::Released,
    ];
    for from in states {
        for command in StateCommand::ALL {
            let (ctx, _server, _policy) = setup();
            let renderer = Renderer::builder(&ctx).build().unwrap();
            drive_to(&renderer, from);

            let ok = apply(&renderer, command);
            let after = renderer.state();
            match from.next(command) {
                Some(expected) => {
                    assert!(ok, "{command:?} from {from} failed");
                    assert_eq!(after, expected, "{command:?} from {from}");
                }
                None => {
                    assert_eq!(after, from, "{command:?} from {from} changed the state");
                }
            }
        }
    }
}

#[test]
fn test_unmapped_usage_cannot_start() {
    let (ctx, _server, policy) = setup();
    let renderer = Renderer::builder(&ctx)
        .info(RendererInfo::new(ContentType::Unknown, StreamUsage::Unknown))
        .params(AudioStreamParams::cd_quality())
        .build()
        .unwrap();
    let err = renderer.start().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidParam);
    assert_eq!(renderer.state(), StreamState::Prepared);
    assert_eq!(policy.activations(), 0);
}

#[test]
fn test_voice_modem_pause_only_releases_focus() {
    let (ctx, _server, policy) = setup();
    let renderer = Renderer::builder(&ctx)
        .info(RendererInfo::new(
            ContentType::Speech,
            StreamUsage::VoiceModemCommunication,
        ))
        .params(AudioStreamParams::cd_quality())
        .build()
        .unwrap();
    renderer.start().unwrap();
    let session = renderer.session_id().unwrap();
    assert!(policy.is_active(session));

    renderer.pause().unwrap();
    assert_eq!(renderer.state(), StreamState::Running);
    assert!(!policy.is_active(session));
}

#[test]
fn test_forced_pause_then_resume() {
    let (ctx, _server, policy) = setup();
    let (callback, log) = event_log();
    let renderer = running_renderer(&ctx, callback);
    let session = renderer.session_id().unwrap();

    assert!(policy.deliver_interrupt(
        session,
        forced(InterruptType::Begin, InterruptHint::Pause, 0.0)
    ));
    assert_eq!(renderer.state(), StreamState::Paused);
    assert!(renderer.is_force_paused());
    assert!(log.lock().unwrap().iter().any(|e| matches!(
        e,
        StreamEvent::StateChanged {
            state: StreamState::Paused,
            source: ChangeSource::System
        }
    )));
    let seen = interrupts(&log);
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].force_type, InterruptForceType::Force);
    assert_eq!(seen[0].hint, InterruptHint::Pause);

    policy.deliver_interrupt(session, forced(InterruptType::End, InterruptHint::Resume, 0.0));
    let seen = interrupts(&log);
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[1].force_type, InterruptForceType::Share);
    assert_eq!(seen[1].hint, InterruptHint::Resume);
    assert!(!renderer.is_force_paused());
    assert_eq!(renderer.state(), StreamState::Paused);

    renderer.start().unwrap();
    assert_eq!(renderer.state(), StreamState::Running);
}

#[test]
fn test_forced_resume_after_client_stop_is_dropped() {
    let (ctx, _server, policy) = setup();
    let (callback, log) = event_log();
    let renderer = running_renderer(&ctx, callback);
    let session = renderer.session_id().unwrap();

    policy.deliver_interrupt(session, forced(InterruptType::Begin, InterruptHint::Pause, 0.0));
    assert!(renderer.is_force_paused());
    renderer.stop().unwrap();
    assert!(!renderer.is_force_paused());

    policy.deliver_interrupt(session, forced(InterruptType::End, InterruptHint::Resume, 0.0));
    let seen = interrupts(&log);
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].hint, InterruptHint::Pause);
    assert_eq!(renderer.state(), StreamState::Stopped);
}

#[test]
fn test_resume_without_forced_pause_is_dropped() {
    let (ctx, _server, policy) = setup();
    let (callback, log) = event_log();
    let renderer = running_renderer(&ctx, callback);
    let session = renderer.session_id().unwrap();

    policy.deliver_interrupt(session, forced(InterruptType::End, InterruptHint::Resume, 0.0));
    policy.deliver_interrupt(session, forced(InterruptType::Begin, InterruptHint::None, 0.0));
    assert!(interrupts(&log).is_empty());
    assert_eq!(renderer.state(), StreamState::Running);
}

#[test]
fn test_shared_interrupt_is_forwarded_untouched() {
    let (ctx, _server, policy) = setup();
    let (callback, log) = event_log();
    let renderer = running_renderer(&ctx, callback);
    let event = InterruptEvent::new(
        InterruptType::Begin,
        InterruptForceType::Share,
        InterruptHint::Pause,
        0.0,
    );
    policy.deliver_interrupt(renderer.session_id().unwrap(), event);
    assert_eq!(interrupts(&log), vec![event]);
    assert_eq!(renderer.state(), StreamState::Running);
}

#[test]
fn test_forced_stop() {
    let (ctx, _server, policy) = setup();
    let (callback, log) = event_log();
    let renderer = running_renderer(&ctx, callback);
    policy.deliver_interrupt(
        renderer.session_id().unwrap(),
        forced(InterruptType::Begin, InterruptHint::Stop, 0.0),
    );
    assert_eq!(renderer.state(), StreamState::Stopped);
    assert_eq!(interrupts(&log).len(), 1);
}

#[test]
fn test_duck_twice_applies_factor_once() {
    let (ctx, server, policy) = setup();
    let (callback, log) = event_log();
    let renderer = running_renderer(&ctx, callback);
    let session = renderer.session_id().unwrap();
    renderer.set_volume(0.8).unwrap();

    policy.deliver_interrupt(session, forced(InterruptType::Begin, InterruptHint::Duck, 0.5));
    policy.deliver_interrupt(session, forced(InterruptType::Begin, InterruptHint::Duck, 0.5));
    assert!(renderer.is_ducked());
    assert!((renderer.volume() - 0.4).abs() < 1e-6);
    assert!((server.volume_of(session).unwrap() - 0.4).abs() < 1e-6);

    policy.deliver_interrupt(session, forced(InterruptType::End, InterruptHint::Unduck, 0.0));
    assert!(!renderer.is_ducked());
    assert!((renderer.volume() - 0.8).abs() < 1e-6);

    let before = interrupts(&log).len();
    policy.deliver_interrupt(session, forced(InterruptType::End, InterruptHint::Unduck, 0.0));
    assert_eq!(interrupts(&log).len(), before);
}

#[test]
fn test_failed_duck_is_not_notified() {
    let (ctx, server, policy) = setup();
    let (callback, log) = event_log();
    let renderer = running_renderer(&ctx, callback);
    server.faults().set_fail_set_volume(true);
    policy.deliver_interrupt(
        renderer.session_id().unwrap(),
        forced(InterruptType::Begin, InterruptHint::Duck, 0.5),
    );
    assert!(interrupts(&log).is_empty());
    assert!(!renderer.is_ducked());
}

#[test]
fn test_read_stall_reported_once() {
    let config = StreamConfig {
        read_timeout: Duration::from_millis(1),
        ..StreamConfig::default()
    };
    let (ctx, server, _policy) = setup_with(config);
    server.faults().set_stall_reads(true);

    let capturer = Capturer::builder(&ctx, CapturerInfo::new(SourceType::Mic))
        .params(AudioStreamParams::cd_quality())
        .build()
        .unwrap();
    capturer.start().unwrap();

    let mut buf = vec![0u8; TEN_MS];
    for _ in 0..150 {
        let err = capturer.read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
    }
    assert_eq!(server.stall_reports(), 1);
    assert_eq!(capturer.stats().read_timeouts, 150);
}

#[test]
fn test_capture_reads_server_data() {
    let (ctx, _server, _policy) = setup();
    let capturer = Capturer::builder(&ctx, CapturerInfo::new(SourceType::Mic))
        .params(AudioStreamParams::cd_quality())
        .build()
        .unwrap();
    assert_eq!(capturer.transport_class(), Some(TransportClass::Stream));
    capturer.start().unwrap();

    let mut buf = vec![0u8; TEN_MS];
    let read = capturer.read(&mut buf).unwrap();
    assert!(read > 0);
    assert!(capturer.frames_read() > 0);
    capturer.stop().unwrap();
    capturer.release().unwrap();
}

#[test]
fn test_low_latency_capture_delivers_data() {
    let (ctx, _server, _policy) = setup();
    let capturer = Capturer::builder(&ctx, CapturerInfo::new(SourceType::Mic))
        .low_latency(true)
        .params(AudioStreamParams::cd_quality())
        .build()
        .unwrap();
    assert_eq!(capturer.transport_class(), Some(TransportClass::Process));
    capturer.start().unwrap();

    let mut buf = vec![0u8; TEN_MS];
    let got_data = wait_until(Duration::from_secs(2), || {
        capturer.read(&mut buf).map(|n| n > 0).unwrap_or(false)
    });
    assert!(got_data);
    capturer.release().unwrap();
}

#[test]
fn test_callback_mode_conserves_spans() {
    let (ctx, server, _policy) = setup();
    let requests = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&requests);
    let renderer = Renderer::builder(&ctx)
        .render_mode(RenderMode::Callback)
        .on_write_data(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .params(AudioStreamParams::cd_quality())
        .build()
        .unwrap();
    assert!(renderer.write(&[0u8; 4]).is_err());
    renderer.start().unwrap();

    let total = renderer.buffer_queue_state().unwrap().total();
    let filled = wait_until(Duration::from_secs(3), || {
        if let Ok(mut desc) = renderer.get_buffer_desc() {
            let capacity = desc.capacity();
            desc.fill_from(&vec![0u8; capacity]);
            renderer.enqueue(desc).unwrap();
        }
        assert_eq!(renderer.buffer_queue_state().unwrap().total(), total);
        renderer.frames_written() >= 9_600
    });
    assert!(filled);
    assert!(requests.load(Ordering::SeqCst) >= 4);
    renderer.stop().unwrap();
    assert!(server.played_bytes() > 0);
}

/// A callback-mode renderer whose write callback refills the queue itself.
fn refilling_renderer(ctx: &AudioContext, low_latency: bool) -> Arc<Renderer> {
    let renderer = Arc::new(
        Renderer::builder(ctx)
            .info(RendererInfo::music().with_low_latency(low_latency))
            .render_mode(RenderMode::Callback)
            .params(AudioStreamParams::cd_quality())
            .build()
            .unwrap(),
    );
    let weak = Arc::downgrade(&renderer);
    renderer.set_write_callback(Some(data_callback(move |_| {
        let Some(renderer) = weak.upgrade() else {
            return;
        };
        if let Ok(mut desc) = renderer.get_buffer_desc() {
            let capacity = desc.capacity();
            desc.fill_from(&vec![0u8; capacity]);
            let _ = renderer.enqueue(desc);
        }
    })));
    renderer
}

fn stop_and_release_while_refilling(low_latency: bool) {
    let (ctx, _server, _policy) = setup();
    let renderer = refilling_renderer(&ctx, low_latency);
    let class = if low_latency { TransportClass::Process } else { TransportClass::Stream };
    assert_eq!(renderer.transport_class(), Some(class));
    renderer.start().unwrap();
    assert!(wait_until(Duration::from_secs(3), || renderer.frames_written() > 0));

    let (tx, rx) = mpsc::channel();
    let handle = Arc::clone(&renderer);
    std::thread::spawn(move || {
        let stopped = handle.stop().is_ok();
        let released = handle.release().is_ok();
        let _ = tx.send((stopped, released));
    });
    let (stopped, released) = rx
        .recv_timeout(Duration::from_secs(5))
        .expect("stop and release did not return");
    assert!(stopped);
    assert!(released);
    assert_eq!(renderer.state(), StreamState::Released);
}

#[test]
fn test_stop_while_callback_refills_stream_transport() {
    stop_and_release_while_refilling(false);
}

#[test]
fn test_stop_while_callback_refills_process_transport() {
    stop_and_release_while_refilling(true);
}

#[test]
fn test_release_from_inside_write_callback() {
    let (ctx, _server, _policy) = setup();
    let renderer = Arc::new(
        Renderer::builder(&ctx)
            .render_mode(RenderMode::Callback)
            .params(AudioStreamParams::cd_quality())
            .build()
            .unwrap(),
    );
    let (tx, rx) = mpsc::channel();
    let tx = Mutex::new(tx);
    let weak = Arc::downgrade(&renderer);
    renderer.set_write_callback(Some(data_callback(move |_| {
        if let Some(renderer) = weak.upgrade() {
            let released = renderer.release().is_ok();
            let _ = tx.lock().unwrap().send(released);
        }
    })));
    renderer.start().unwrap();

    let released = rx
        .recv_timeout(Duration::from_secs(5))
        .expect("release from the callback did not return");
    assert!(released);
    assert_eq!(renderer.state(), StreamState::Released);
}

#[test]
fn test_low_latency_position_is_monotonic() {
    let (ctx, _server, _policy) = setup();
    let renderer = Renderer::builder(&ctx)
        .info(RendererInfo::music().with_low_latency(true))
        .params(AudioStreamParams::cd_quality())
        .build()
        .unwrap();
    assert_eq!(renderer.transport_class(), Some(TransportClass::Process));
    renderer.start().unwrap();

    let mut last = renderer.audio_time().unwrap();
    for _ in 0..20 {
        renderer.write(&[0u8; TEN_MS]).unwrap();
        let now = renderer.audio_time().unwrap();
        assert!(now.frames >= last.frames);
        last = now;
    }
    assert!(renderer.frames_written() >= 20 * 480);
    renderer.release().unwrap();
}

#[test]
fn test_first_frame_mark_and_period_callbacks() {
    let (ctx, _server, _policy) = setup();
    let renderer = Renderer::builder(&ctx)
        .params(AudioStreamParams::cd_quality())
        .build()
        .unwrap();

    let first_frames = Arc::new(AtomicUsize::new(0));
    let marks = Arc::new(AtomicUsize::new(0));
    let periods = Arc::new(AtomicUsize::new(0));
    let (f, m, p) = (
        Arc::clone(&first_frames),
        Arc::clone(&marks),
        Arc::clone(&periods),
    );
    renderer.set_first_frame_callback(move |_| {
        f.fetch_add(1, Ordering::SeqCst);
    });
    renderer
        .set_mark_position(600, move |frame| {
            assert_eq!(frame, 600);
            m.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
    renderer
        .set_period_position(480, move |_| {
            p.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

    renderer.start().unwrap();
    for _ in 0..4 {
        renderer.write(&[0u8; TEN_MS]).unwrap();
    }
    assert_eq!(first_frames.load(Ordering::SeqCst), 1);
    assert_eq!(marks.load(Ordering::SeqCst), 1);
    assert_eq!(periods.load(Ordering::SeqCst), 4);

    renderer.stop().unwrap();
    renderer.start().unwrap();
    renderer.write(&[0u8; TEN_MS]).unwrap();
    assert_eq!(first_frames.load(Ordering::SeqCst), 2);
    assert_eq!(marks.load(Ordering::SeqCst), 1);
}

#[test]
fn test_switch_moves_running_stream() {
    let (ctx, server, policy) = setup();
    let (callback, log) = event_log();
    let renderer = running_renderer(&ctx, callback);
    renderer.set_volume(0.5).unwrap();
    renderer.write(&[0u8; TEN_MS * 2]).unwrap();
    let old = renderer.session_id().unwrap();
    assert!(wait_until(Duration::from_secs(1), || {
        renderer.audio_position().unwrap() > 0
    }));
    let before = renderer.audio_position().unwrap();
    let written = renderer.frames_written();

    renderer.switch_stream(true).unwrap();

    let new = renderer.session_id().unwrap();
    assert_ne!(new, old);
    assert_eq!(renderer.transport_class(), Some(TransportClass::Process));
    assert_eq!(renderer.state(), StreamState::Running);
    assert!(renderer.frames_written() >= written);
    assert!(renderer.audio_position().unwrap() >= before);
    assert_eq!(server.volume_of(new), Some(0.5));

    assert!(policy.is_active(new));
    assert!(!policy.is_active(old));
    assert!(policy.has_interrupt_callback(new));
    assert!(!policy.has_interrupt_callback(old));
    assert!(policy.tracker(new).is_some());

    assert!(log.lock().unwrap().iter().any(|e| matches!(
        e,
        StreamEvent::Switched {
            from: TransportClass::Stream,
            to: TransportClass::Process,
            ..
        }
    )));
    assert_eq!(error_events(&log), 0);

    renderer.write(&[0u8; TEN_MS]).unwrap();
    renderer.release().unwrap();
}

#[test]
fn test_switch_keeps_render_rate_and_offload() {
    let (ctx, server, _policy) = setup();
    let (callback, _log) = event_log();
    let renderer = running_renderer(&ctx, callback);
    let old = renderer.session_id().unwrap();
    renderer.set_render_rate(RenderRate::Double).unwrap();
    renderer.set_offload_mode(true).unwrap();
    assert_eq!(server.render_rate_of(old), Some(96_000));
    assert!(server.is_offloaded(old));

    renderer.switch_stream(true).unwrap();
    let new = renderer.session_id().unwrap();
    assert_eq!(renderer.render_rate(), RenderRate::Double);
    assert!(renderer.is_offload_mode());
    assert_eq!(server.render_rate_of(new), Some(96_000));

    // The process loop batches on its own; playback keeps flowing.
    let written = renderer.frames_written();
    renderer.write(&[0u8; TEN_MS * 4]).unwrap();
    assert!(wait_until(Duration::from_secs(2), || {
        renderer.frames_written() >= written + 4 * 480
    }));

    renderer.switch_stream(false).unwrap();
    let back = renderer.session_id().unwrap();
    assert!(server.is_offloaded(back));
    assert_eq!(server.render_rate_of(back), Some(96_000));
    renderer.release().unwrap();
}

#[test]
fn test_render_rate_applies_to_prepared_stream() {
    let (ctx, server, _policy) = setup();
    let renderer = Renderer::builder(&ctx)
        .params(AudioStreamParams::cd_quality())
        .build()
        .unwrap();
    renderer.set_render_rate(RenderRate::Half).unwrap();
    assert_eq!(renderer.render_rate(), RenderRate::Half);
    assert_eq!(server.render_rate_of(renderer.session_id().unwrap()), Some(24_000));
    assert!(!renderer.is_offload_mode());
    renderer.release().unwrap();
}

#[test]
fn test_switch_create_failure_keeps_old_transport() {
    let (ctx, server, _policy) = setup();
    let (callback, log) = event_log();
    let renderer = running_renderer(&ctx, callback);
    let old = renderer.session_id().unwrap();
    server.faults().set_fail_create_process(true);

    let err = renderer.switch_stream(true).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TransportFailure);
    assert_eq!(error_events(&log), 1);
    assert_eq!(renderer.session_id(), Some(old));
    assert_eq!(renderer.transport_class(), Some(TransportClass::Stream));
    assert_eq!(renderer.state(), StreamState::Running);
    assert_eq!(renderer.write(&[0u8; TEN_MS]).unwrap(), TEN_MS);
}

#[test]
fn test_switch_restart_failure_reports_once_and_stops() {
    let (ctx, server, _policy) = setup();
    let (callback, log) = event_log();
    let renderer = running_renderer(&ctx, callback);
    server.faults().set_fail_create_process(true);
    server.faults().set_fail_start(true);

    assert!(renderer.switch_stream(true).is_err());
    assert_eq!(error_events(&log), 1);
    assert_eq!(renderer.state(), StreamState::Stopped);
}

#[test]
fn test_switch_old_release_failure_keeps_old_transport_running() {
    let (ctx, server, _policy) = setup();
    let (callback, log) = event_log();
    let renderer = running_renderer(&ctx, callback);
    let old = renderer.session_id().unwrap();
    server.faults().set_fail_release(true);

    let err = renderer.switch_stream(true).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TransportFailure);
    assert_eq!(error_events(&log), 1);
    assert_eq!(renderer.state(), StreamState::Running);
    assert_eq!(renderer.transport_class(), Some(TransportClass::Stream));
    assert_eq!(renderer.session_id(), Some(old));
    assert_eq!(renderer.write(&[0u8; TEN_MS]).unwrap(), TEN_MS);

    server.faults().set_fail_release(false);
    renderer.release().unwrap();
}

#[test]
fn test_refused_switch_has_no_event() {
    let (ctx, _server, _policy) = setup();
    let (callback, log) = event_log();
    let renderer = running_renderer(&ctx, callback);
    let err = renderer.switch_stream(false).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidParam);
    assert_eq!(error_events(&log), 0);
    assert_eq!(renderer.state(), StreamState::Running);
}

#[test]
fn test_recovery_restores_focus() {
    let config = StreamConfig {
        recovery: RecoveryConfig {
            max_attempts: 10,
            retry_interval: Duration::from_millis(10),
        },
        ..StreamConfig::default()
    };
    let (ctx, server, policy) = setup_with(config);
    let (callback, log) = event_log();
    let renderer = running_renderer(&ctx, callback);
    let session = renderer.session_id().unwrap();

    server.faults().set_restore_failures(2);
    policy.simulate_service_died();
    assert!(!policy.is_active(session));
    policy.revive();

    let restored = wait_until(Duration::from_secs(3), || {
        log.lock()
            .unwrap()
            .iter()
            .any(|e| matches!(e, StreamEvent::Restored { attempts: 3 }))
    });
    assert!(restored);
    assert!(policy.is_active(session));
    assert!(policy.has_interrupt_callback(session));
    assert_eq!(server.restore_calls(), 1);
    assert_eq!(renderer.state(), StreamState::Running);
}

#[test]
fn test_exhausted_recovery_invalidates_stream() {
    let config = StreamConfig {
        recovery: RecoveryConfig {
            max_attempts: 2,
            retry_interval: Duration::from_millis(5),
        },
        ..StreamConfig::default()
    };
    let (ctx, server, policy) = setup_with(config);
    let (callback, log) = event_log();
    let renderer = running_renderer(&ctx, callback);
    server.faults().set_restore_failures(10);

    policy.simulate_service_died();
    assert!(wait_until(Duration::from_secs(3), || {
        renderer.state() == StreamState::Invalid
    }));
    assert!(log.lock().unwrap().iter().any(|e| matches!(
        e,
        StreamEvent::Error {
            kind: ErrorKind::ServiceDied,
            ..
        }
    )));
    policy.revive();
    renderer.release().unwrap();
    assert_eq!(renderer.state(), StreamState::Released);
}

#[test]
fn test_device_changes() {
    let (ctx, _server, policy) = setup();
    let (callback, log) = event_log();
    let renderer = running_renderer(&ctx, callback);
    let session = renderer.session_id().unwrap();

    let headset = DeviceInfo::new(7, "Headset", DeviceType::WiredHeadset);
    assert!(policy.change_device(session, DeviceChange::OutputChanged(headset.clone())));
    assert!(log.lock().unwrap().iter().any(
        |e| matches!(e, StreamEvent::DeviceChanged { device } if *device == headset)
    ));

    policy.change_device(session, DeviceChange::RecreateStream { low_latency: true });
    assert_eq!(renderer.transport_class(), Some(TransportClass::Process));
    assert_eq!(renderer.state(), StreamState::Running);
}

#[test]
fn test_pcm_dump_written_on_release() {
    use tempfile::tempdir;

    let dir = tempdir().unwrap();
    let path = dir.path().join("dump.wav");
    let config = StreamConfig {
        dump_path: Some(path.clone()),
        ..StreamConfig::default()
    };
    let (ctx, _server, _policy) = setup_with(config);
    let renderer = Renderer::builder(&ctx)
        .params(AudioStreamParams::cd_quality())
        .build()
        .unwrap();
    renderer.start().unwrap();
    renderer.write(&[0u8; TEN_MS * 2]).unwrap();
    renderer.stop().unwrap();
    renderer.release().unwrap();

    let bytes = std::fs::read(&path).unwrap();
    assert_eq!(&bytes[0..4], b"RIFF");
    assert_eq!(&bytes[8..12], b"WAVE");
    assert!(bytes.len() > 44);
}

#[tokio::test]
async fn test_event_channel_delivers_state_changes() {
    let (ctx, _server, _policy) = setup();
    let (callback, mut rx) = event_channel(16);
    let renderer = Renderer::builder(&ctx)
        .event_callback(callback)
        .params(AudioStreamParams::cd_quality())
        .build()
        .unwrap();
    renderer.start().unwrap();

    let mut states = Vec::new();
    while states.len() < 2 {
        let event = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        if let StreamEvent::StateChanged { state, .. } = event {
            states.push(state);
        }
    }
    assert_eq!(states, vec![StreamState::Prepared, StreamState::Running]);
}

#[cfg(feature = "device")]
#[test]
#[ignore = "requires an audio output device"]
fn test_device_server_playback() {
    use audio_stream_client::server::DeviceServer;

    let ctx = AudioContext::new(DeviceServer::new(), MockPolicy::new());
    let renderer = Renderer::builder(&ctx)
        .params(AudioStreamParams::cd_quality())
        .build()
        .unwrap();
    renderer.start().unwrap();
    for _ in 0..50 {
        renderer.write(&[0u8; TEN_MS]).unwrap();
    }
    renderer.stop().unwrap();
    renderer.release().unwrap();
}
