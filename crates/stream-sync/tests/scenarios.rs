use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use stream_sync::clock::AudioPlaybackClock;
use stream_sync::config::{FetchModeConfig, SyncConfig};
use stream_sync::error::SessionError;
use stream_sync::fetch_mode::{FetchModeController, QueueOccupancy};
use stream_sync::pacer::FramePacer;
use stream_sync::pcm::PcmBuffer;
use stream_sync::queue::{AudioSampleQueue, VideoFrameQueue};
use stream_sync::session::StreamPlayer;
use stream_sync::sim::{ManualVoiceFactory, SyntheticOpener, SyntheticScript};
use stream_sync::{FetchMode, SessionEndReason, StreamKind};

fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(3);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    false
}

#[test]
fn one_second_of_audio_releases_thirty_frames() {
    let config = SyncConfig {
        audio_tick: Duration::from_millis(5),
        ..SyncConfig::default()
    };
    let factory = ManualVoiceFactory::default();
    let voice = factory.handle();
    let clock = AudioPlaybackClock::spawn(Arc::new(factory), 44_100, 2, &config).unwrap();
    for _ in 0..10 {
        assert!(clock.enqueue(PcmBuffer::new(2, 44_100, vec![0; 4_410 * 2]), Duration::ZERO));
    }

    let frames = VideoFrameQueue::new(40);
    for i in 0..40u32 {
        frames.push(i);
    }
    let mut pacer = FramePacer::new(30.0);
    assert_eq!(pacer.tick(clock.current_playback_seconds(), &frames, |_| {}).released, 0);

    clock.play();
    assert!(wait_until(|| voice.queued() == 10));
    assert_eq!(voice.advance(44_100), 44_100);

    let progress = clock.current_playback_seconds();
    assert_eq!(progress, 1.0);
    let mut presented = Vec::new();
    let out = pacer.tick(progress, &frames, |f| presented.push(f));
    assert_eq!(out.released, 30);
    assert_eq!(presented, (0..30).collect::<Vec<_>>());

    // unchanged clock, nothing more
    assert_eq!(pacer.tick(clock.current_playback_seconds(), &frames, |_| {}).released, 0);
}

#[test]
fn overflowing_video_queue_keeps_newest_fifteen() {
    let q = VideoFrameQueue::new(15);
    for i in 1..=20u32 {
        q.push(i);
    }
    assert_eq!(q.len(), 15);
    assert_eq!(q.dropped_frames(), 5);
    let kept: Vec<u32> = std::iter::from_fn(|| q.pop()).collect();
    assert_eq!(kept, (6..=20).collect::<Vec<_>>());
}

#[test]
fn audio_queue_offer_times_out_when_full() {
    let q = AudioSampleQueue::new(2);
    let buf = || PcmBuffer::new(1, 1000, vec![0; 10]);
    assert!(q.offer(buf(), Duration::ZERO).is_ok());
    assert!(q.offer(buf(), Duration::ZERO).is_ok());
    let start = Instant::now();
    assert!(q.offer(buf(), Duration::from_millis(30)).is_err());
    let waited = start.elapsed();
    assert!(waited >= Duration::from_millis(30));
    assert!(waited < Duration::from_secs(1));
    assert_eq!(q.len(), 2);
}

#[test]
fn connect_gives_up_after_budget_and_delays() {
    let delay = Duration::from_millis(40);
    let opener = Arc::new(SyntheticOpener::test_pattern().with_script(SyntheticScript {
        fail_opens: u32::MAX,
        ..SyntheticScript::default()
    }));
    let config = SyncConfig {
        reconnect_attempts: 5,
        reconnect_delay: delay,
        ..SyncConfig::default()
    };
    let player = StreamPlayer::new(opener.clone(), Arc::new(ManualVoiceFactory::default()), config);

    let start = Instant::now();
    let err = player.start("http://example.invalid/live.flv", StreamKind::Auto).unwrap_err();
    let elapsed = start.elapsed();

    assert!(matches!(err, SessionError::Connect { attempts: 5, .. }));
    assert_eq!(opener.open_attempts(), 5);
    assert!(elapsed >= delay * 4, "gave up after {elapsed:?}");
    assert!(!player.is_active());
}

#[test]
fn flapping_source_spends_a_session_wide_budget() {
    let opener = Arc::new(SyntheticOpener::test_pattern().with_script(SyntheticScript {
        disconnect_after: Some(1),
        ..SyntheticScript::default()
    }));
    let config = SyncConfig {
        reconnect_attempts: 2,
        reconnect_delay: Duration::from_millis(10),
        audio_tick: Duration::from_millis(5),
        ..SyncConfig::default()
    };
    let player = StreamPlayer::new(opener.clone(), Arc::new(ManualVoiceFactory::default()), config);
    player.start("synthetic://pattern", StreamKind::Auto).unwrap();

    // every reopen delivers one unit and drops again
    assert!(wait_until(|| !player.is_active()));
    let status = player.status();
    assert_eq!(status.end_reason, Some(SessionEndReason::ConnectionLost));
    assert_eq!(status.reconnects, 2);
    assert_eq!(opener.open_attempts(), 3);
}

#[test]
fn full_audio_queue_blocks_audio_priority() {
    let mut controller = FetchModeController::new(FetchModeConfig::default());
    let t0 = Instant::now();
    controller.decide(
        QueueOccupancy {
            video_len: 0,
            audio_len: 0,
            audio_capacity: 24,
        },
        t0,
    );
    let mode = controller.decide(
        QueueOccupancy {
            video_len: 8,
            audio_len: 15,
            audio_capacity: 24,
        },
        t0 + Duration::from_secs(1),
    );
    assert_eq!(mode, FetchMode::Mixed);
}

#[test]
fn audio_priority_holds_for_debounce_then_yields() {
    let mut controller = FetchModeController::new(FetchModeConfig::default());
    let t0 = Instant::now();
    let saturated = QueueOccupancy {
        video_len: 10,
        audio_len: 2,
        audio_capacity: 24,
    };
    let drained = QueueOccupancy {
        video_len: 0,
        ..saturated
    };

    assert_eq!(controller.decide(saturated, t0), FetchMode::AudioPriority);
    assert_eq!(
        controller.decide(drained, t0 + Duration::from_millis(200)),
        FetchMode::AudioPriority
    );
    assert_eq!(controller.decide(drained, t0 + Duration::from_millis(600)), FetchMode::Mixed);
}

#[test]
fn audio_priority_is_bounded_by_max_dwell() {
    let mut controller = FetchModeController::new(FetchModeConfig::default());
    let t0 = Instant::now();
    let saturated = QueueOccupancy {
        video_len: 10,
        audio_len: 2,
        audio_capacity: 24,
    };
    assert_eq!(controller.decide(saturated, t0), FetchMode::AudioPriority);
    assert_eq!(
        controller.decide(saturated, t0 + Duration::from_millis(1500)),
        FetchMode::AudioPriority
    );
    assert_eq!(
        controller.decide(saturated, t0 + Duration::from_millis(2100)),
        FetchMode::Mixed
    );
}
