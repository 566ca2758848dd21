use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use raumklang::{
    DataFormat, DataSource, Engine, EngineConfig, Error, Fence, LoadStatus, MemoryLoader,
    NullBackend, PcmBuffer, PlayState, ResourceManagerConfig, Sound, SoundConfig, SoundFlags,
    SoundGroup, Vec3, Waveform,
};

const RATE: u32 = 48_000;

fn clip(frames: usize, value: impl Fn(usize) -> f32) -> PcmBuffer {
    PcmBuffer::new(1, RATE, (0..frames).map(value).collect()).unwrap()
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

/// An offline stereo config whose loader serves `ones` (100 frames of 1.0),
/// `ramp` (sample i == i) and `long` (96000 frames of 1.0).
fn config() -> EngineConfig {
    init_tracing();
    let loader = Arc::new(MemoryLoader::new());
    loader.insert("ones", clip(100, |_| 1.0));
    loader.insert("ramp", clip(1_000, |i| i as f32));
    loader.insert("long", clip(96_000, |_| 1.0));
    let resources = ResourceManagerConfig::default().with_loader(loader);
    EngineConfig::offline(2, RATE).with_resource_manager(resources)
}

fn engine() -> Engine {
    Engine::new(config()).unwrap()
}

fn render(engine: &Engine, frames: usize) -> Vec<f32> {
    let mut out = vec![0.0; frames * engine.channels()];
    assert_eq!(engine.read_pcm_frames(&mut out).unwrap(), frames);
    out
}

fn left(out: &[f32]) -> Vec<f32> {
    out.chunks_exact(2).map(|f| f[0]).collect()
}

fn close(a: f32, b: f32) -> bool {
    (a - b).abs() < 1e-4
}

#[test]
fn empty_engine_renders_silence() {
    let engine = engine();
    let out = render(&engine, 1_000);
    assert!(out.iter().all(|&s| s == 0.0));
    assert_eq!(engine.node_graph().node_count(), 1);
    assert_eq!(engine.time_in_pcm_frames(), 1_024);
}

#[test]
fn decoded_sound_plays_then_goes_silent() {
    let engine = engine();
    let sound = Sound::init_from_file(&engine, "ones", SoundFlags::DECODE, None, None).unwrap();
    assert_eq!(sound.play_state(), PlayState::Stopped);
    assert_eq!(sound.length_in_pcm_frames().unwrap(), 100);
    sound.start().unwrap();

    let out = render(&engine, 256);
    let l = left(&out);
    assert!(l[..100].iter().all(|&s| close(s, 1.0)));
    assert!(l[100..].iter().all(|&s| s == 0.0));
    assert!(sound.at_end());
    assert!(!sound.is_playing());
    assert_eq!(sound.time_in_pcm_frames(), 100);
}

#[test]
fn end_callback_fires_once_per_playthrough() {
    let engine = engine();
    let sound = Sound::init_from_file(&engine, "ones", SoundFlags::DECODE, None, None).unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    sound.set_end_callback(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    sound.start().unwrap();
    render(&engine, 256);
    assert_eq!(engine.dispatch_events(), 1);
    render(&engine, 256);
    assert_eq!(engine.dispatch_events(), 0);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // Starting a sound at its end rewinds it.
    sound.start().unwrap();
    assert!(!sound.at_end());
    let out = render(&engine, 64);
    assert!(close(out[0], 1.0));
    render(&engine, 192);
    engine.dispatch_events();
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[test]
fn looping_sound_never_ends() {
    let engine = engine();
    let sound = Sound::init_from_file(
        &engine,
        "ones",
        SoundFlags::DECODE | SoundFlags::LOOPING,
        None,
        None,
    )
    .unwrap();
    sound.start().unwrap();
    let out = render(&engine, 4_800);
    assert!(out.iter().all(|&s| close(s, 1.0)));
    assert_eq!(engine.dispatch_events(), 0);
    assert!(sound.is_playing());
    assert!(!sound.at_end());
}

#[test]
fn scheduled_stop_fades_to_silence() {
    let engine = engine();
    let sound = Sound::init_from_file(
        &engine,
        "long",
        SoundFlags::DECODE | SoundFlags::LOOPING,
        None,
        None,
    )
    .unwrap();
    sound.set_stop_time_with_fade_in_pcm_frames(144_000, 48_000);
    sound.start().unwrap();

    for _ in 0..25 {
        render(&engine, 4_800);
    }
    assert_eq!(engine.time_in_pcm_frames(), 120_000);
    assert_eq!(sound.current_fade_volume(), 0.5);
    assert_eq!(sound.play_state(), PlayState::Stopping);

    let mut last = Vec::new();
    for _ in 0..5 {
        last = render(&engine, 4_800);
    }
    assert_eq!(engine.time_in_pcm_frames(), 144_000);
    assert_eq!(sound.play_state(), PlayState::Stopped);
    assert!(last[last.len() - 2..].iter().all(|&s| s.abs() < 1e-3));
}

#[test]
fn stop_with_fade_ramps_down() {
    let engine = engine();
    let sound = Sound::init_from_file(
        &engine,
        "long",
        SoundFlags::DECODE | SoundFlags::LOOPING,
        None,
        None,
    )
    .unwrap();
    sound.start().unwrap();
    render(&engine, 640);

    sound.stop_with_fade_in_pcm_frames(640).unwrap();
    assert_eq!(sound.play_state(), PlayState::Stopping);
    let l = left(&render(&engine, 1_280));
    assert!(l[0] > 0.99);
    assert!(l[320] < 0.51 && l[320] > 0.49);
    assert!(l[640..].iter().all(|&s| s == 0.0));
    assert_eq!(sound.play_state(), PlayState::Stopped);

    // A later start plays at full volume again.
    sound.start().unwrap();
    let l = left(&render(&engine, 64));
    assert!(close(l[63], 1.0));
}

#[test]
fn fades_saturate_at_the_end_of_time() {
    let engine = engine();
    let sound = Sound::init_from_file(
        &engine,
        "long",
        SoundFlags::DECODE | SoundFlags::LOOPING,
        None,
        None,
    )
    .unwrap();
    sound.start().unwrap();
    render(&engine, 64);

    sound.stop_with_fade_in_pcm_frames(u64::MAX).unwrap();
    assert_eq!(sound.play_state(), PlayState::Stopping);
    assert!(left(&render(&engine, 64)).iter().all(|&s| close(s, 1.0)));
    assert_eq!(sound.play_state(), PlayState::Stopping);
    drop(sound);

    // Blocks straddling the top of the clock still stop on their frame.
    engine.set_time_in_pcm_frames(u64::MAX - 10);
    let late = Sound::init_from_file(
        &engine,
        "long",
        SoundFlags::DECODE | SoundFlags::LOOPING,
        None,
        None,
    )
    .unwrap();
    late.start().unwrap();
    late.stop_with_fade_in_pcm_frames(1_000).unwrap();
    let l = left(&render(&engine, 64));
    assert!(l[..9].iter().all(|&s| s > 0.98 && s <= 1.0));
    assert!(l[9..].iter().all(|&s| s == 0.0));
    assert_eq!(late.play_state(), PlayState::Stopped);
}

#[test]
fn scheduled_start_is_frame_accurate() {
    let engine = engine();
    let sound = Sound::init_from_file(&engine, "ramp", SoundFlags::DECODE, None, None).unwrap();
    sound.set_start_time_in_pcm_frames(100);
    sound.start().unwrap();
    assert_eq!(sound.play_state(), PlayState::PendingStart);

    let l = left(&render(&engine, 128));
    assert!(l[..100].iter().all(|&s| s == 0.0));
    assert_eq!(l[100], 0.0);
    assert!(close(l[101], 1.0));
    assert!(close(l[127], 27.0));
    assert_eq!(sound.play_state(), PlayState::Playing);
}

#[test]
fn seek_moves_the_cursor() {
    let engine = engine();
    let sound = Sound::init_from_file(&engine, "ramp", SoundFlags::DECODE, None, None).unwrap();
    sound.seek_to_pcm_frame(500).unwrap();
    sound.start().unwrap();
    let l = left(&render(&engine, 64));
    assert!(close(l[0], 500.0));
    assert_eq!(sound.cursor_in_pcm_frames().unwrap(), 563);
}

#[test]
fn group_stop_gates_members() {
    let engine = engine();
    let group = SoundGroup::init(&engine, None).unwrap();
    assert!(group.is_playing());
    let sound = Sound::init_from_data_source(
        &engine,
        Waveform::sine(1_000.0, RATE),
        SoundFlags::NO_SPATIALIZATION,
        Some(&group),
    )
    .unwrap();
    assert_eq!(sound.parent(), Some(group.id()));
    sound.start().unwrap();

    assert!(render(&engine, 256).iter().any(|&s| s != 0.0));
    group.stop().unwrap();
    assert!(render(&engine, 256).iter().all(|&s| s == 0.0));
    assert!(sound.is_playing());
    group.start().unwrap();
    assert!(render(&engine, 256).iter().any(|&s| s != 0.0));
}

#[test]
fn volumes_compose_down_the_tree() {
    let engine = engine();
    let group = SoundGroup::init(&engine, None).unwrap();
    group.set_volume(0.5);
    let sound = Sound::init_from_file(
        &engine,
        "long",
        SoundFlags::DECODE | SoundFlags::LOOPING,
        Some(&group),
        None,
    )
    .unwrap();
    sound.set_volume(0.5);
    sound.start().unwrap();
    engine.set_volume(0.5);

    let out = render(&engine, 64);
    assert!(out.iter().all(|&s| close(s, 0.125)));
}

#[test]
fn cycles_are_rejected_without_changes() {
    let engine = engine();
    let outer = SoundGroup::init(&engine, None).unwrap();
    let inner = SoundGroup::init(&engine, Some(&outer)).unwrap();

    assert_eq!(outer.attach(inner.id()), Err(Error::InvalidOperation));
    assert_eq!(outer.attach(outer.id()), Err(Error::InvalidOperation));
    assert_eq!(outer.parent(), Some(engine.endpoint()));
    assert_eq!(inner.parent(), Some(outer.id()));
    assert_eq!(engine.node_graph().children_of(outer.id()), vec![inner.id()]);
}

#[test]
fn spatialized_sound_is_attenuated_and_panned() {
    let engine = engine();
    let sound = Sound::init_from_file(
        &engine,
        "long",
        SoundFlags::DECODE | SoundFlags::LOOPING,
        None,
        None,
    )
    .unwrap();
    sound.set_position(Vec3::new(10.0, 0.0, 0.0));
    sound.start().unwrap();

    let out = render(&engine, 64);
    for frame in out.chunks_exact(2) {
        assert!(frame[0].abs() < 1e-6);
        assert!(close(frame[1], 0.1));
    }
    assert!((sound.direction_to_listener() - Vec3::new(-1.0, 0.0, 0.0)).length() < 1e-5);
}

#[test]
fn copies_share_decoded_data() {
    let engine = engine();
    let resources = engine.resource_manager();
    let first = Sound::init_from_file(&engine, "ones", SoundFlags::DECODE, None, None).unwrap();
    let second = Sound::init_copy(&engine, &first, SoundFlags::NONE, None).unwrap();
    assert_eq!(resources.entry_count(), 1);
    assert!(Arc::ptr_eq(
        first.resource().unwrap(),
        second.resource().unwrap()
    ));

    drop(first);
    assert_eq!(resources.entry_count(), 1);
    drop(second);
    assert_eq!(resources.entry_count(), 0);

    let direct =
        Sound::init_from_data_source(&engine, Waveform::sine(440.0, RATE), SoundFlags::NONE, None)
            .unwrap();
    assert_eq!(
        Sound::init_copy(&engine, &direct, SoundFlags::NONE, None).err(),
        Some(Error::InvalidOperation)
    );
    let streamed = Sound::init_from_file(&engine, "ones", SoundFlags::STREAM, None, None).unwrap();
    assert_eq!(
        Sound::init_copy(&engine, &streamed, SoundFlags::NONE, None).err(),
        Some(Error::InvalidOperation)
    );
}

#[test]
fn async_load_completes_fence() {
    let engine = engine();
    let fence = Arc::new(Fence::new());
    let sound = Sound::init_from_file(
        &engine,
        "ones",
        SoundFlags::DECODE | SoundFlags::ASYNC,
        None,
        Some(&fence),
    )
    .unwrap();
    assert!(fence.wait_timeout(1, Duration::from_secs(5)));
    assert_eq!(sound.resource().unwrap().status(), LoadStatus::Ready);
    assert_eq!(sound.length_in_pcm_frames().unwrap(), 100);

    sound.start().unwrap();
    let out = render(&engine, 64);
    assert!(close(out[0], 1.0));
}

#[test]
fn failed_async_load_surfaces_on_start() {
    let engine = engine();
    let fence = Arc::new(Fence::new());
    let sound = Sound::init_from_file(
        &engine,
        "missing",
        SoundFlags::DECODE | SoundFlags::ASYNC,
        None,
        Some(&fence),
    )
    .unwrap();
    assert!(fence.wait_timeout(1, Duration::from_secs(5)));
    assert_eq!(sound.start(), Err(Error::DoesNotExist));
    assert_eq!(sound.data_format().err(), Some(Error::DoesNotExist));

    let waited = Sound::init_from_file(
        &engine,
        "missing",
        SoundFlags::DECODE | SoundFlags::ASYNC | SoundFlags::WAIT_INIT,
        None,
        None,
    );
    assert_eq!(waited.err(), Some(Error::DoesNotExist));
    assert_eq!(
        Sound::init_from_file(&engine, "missing", SoundFlags::DECODE, None, None).err(),
        Some(Error::DoesNotExist)
    );
}

#[test]
fn streamed_sound_plays_through() {
    let engine = engine();
    let sound = Sound::init_from_file(&engine, "ramp", SoundFlags::STREAM, None, None).unwrap();
    sound.start().unwrap();

    let mut played = Vec::new();
    for _ in 0..200 {
        played.extend(left(&render(&engine, 64)));
        if sound.at_end() {
            break;
        }
        thread::sleep(Duration::from_millis(1));
    }
    assert!(sound.at_end());
    // Underruns render silence, so only check the samples that made it out
    // are in order.
    let heard: Vec<f32> = played.into_iter().filter(|&s| s != 0.0).collect();
    assert!(heard.windows(2).all(|w| w[1] > w[0]));
    assert!(close(*heard.last().unwrap(), 999.0));
}

#[test]
fn looping_stream_wraps_without_gaps() {
    let engine = engine();
    let sound = Sound::init_from_file(
        &engine,
        "ones",
        SoundFlags::STREAM | SoundFlags::LOOPING | SoundFlags::NO_SPATIALIZATION,
        None,
        None,
    )
    .unwrap();
    sound.start().unwrap();

    let mut played = Vec::new();
    for _ in 0..12 {
        thread::sleep(Duration::from_millis(20));
        played.extend(left(&render(&engine, 64)));
    }
    let first = played
        .iter()
        .position(|&s| s != 0.0)
        .expect("stream never produced audio");
    let gaps: Vec<usize> = (first..played.len())
        .filter(|&i| !close(played[i], 1.0))
        .collect();
    assert!(gaps.is_empty(), "gaps at {gaps:?}");
    assert!(played.len() - first > 300);
    assert!(sound.is_playing());
    assert!(!sound.at_end());
}

/// A source reporting `format` that never yields frames.
struct Shaped(DataFormat);

impl DataSource for Shaped {
    fn format(&self) -> DataFormat {
        self.0
    }

    fn read_frames(&mut self, _out: &mut [f32], _frames: usize) -> raumklang::Result<usize> {
        Err(Error::AtEnd)
    }

    fn seek_to_frame(&mut self, _frame: u64) -> raumklang::Result<()> {
        Ok(())
    }

    fn cursor(&self) -> u64 {
        0
    }

    fn length(&self) -> Option<u64> {
        Some(0)
    }
}

#[test]
fn unplayable_sources_are_rejected() {
    let engine = engine();
    for format in [DataFormat::f32(16, RATE), DataFormat::f32(1, 0)] {
        let sound = Sound::init_from_data_source(&engine, Shaped(format), SoundFlags::NONE, None);
        assert_eq!(sound.err(), Some(Error::InvalidArgs));
    }
    assert_eq!(engine.node_graph().node_count(), 1);
    let widest = Shaped(DataFormat::f32(8, RATE));
    assert!(Sound::init_from_data_source(&engine, widest, SoundFlags::NONE, None).is_ok());
}

#[test]
fn renders_never_see_half_applied_edits() {
    let engine = engine();
    let group = SoundGroup::init(&engine, None).unwrap();
    let sound = Sound::init_from_file(
        &engine,
        "long",
        SoundFlags::DECODE | SoundFlags::LOOPING | SoundFlags::NO_SPATIALIZATION,
        None,
        None,
    )
    .unwrap();
    sound.start().unwrap();

    const BLOCKS: usize = 500;
    let done = AtomicBool::new(false);
    let (silent, loud) = thread::scope(|scope| {
        let renderer = scope.spawn(|| {
            let (mut silent, mut loud) = (0, 0);
            for _ in 0..BLOCKS {
                let out = render(&engine, 64);
                if out.iter().all(|&s| s == 0.0) {
                    silent += 1;
                } else if out.iter().all(|&s| close(s, 1.0)) {
                    loud += 1;
                } else {
                    panic!("block mixes silence and signal: {out:?}");
                }
            }
            done.store(true, Ordering::Release);
            (silent, loud)
        });

        // Detached renders silence; under the endpoint or the group, 1.0.
        while !done.load(Ordering::Acquire) {
            sound.detach().unwrap();
            thread::yield_now();
            sound.attach(engine.endpoint()).unwrap();
            thread::yield_now();
            sound.attach(group.id()).unwrap();
            thread::yield_now();
            sound.attach(engine.endpoint()).unwrap();
        }
        renderer.join().unwrap()
    });
    assert_eq!(silent + loud, BLOCKS);
}

#[test]
fn inline_sounds_are_reclaimed() {
    let engine = engine();
    engine.play_sound("ones", None).unwrap();
    engine.play_sound("ones", None).unwrap();
    assert_eq!(engine.inline_sound_count(), 2);
    assert_eq!(engine.node_graph().node_count(), 3);

    let out = render(&engine, 256);
    assert!(close(out[0], 2.0));
    assert_eq!(engine.dispatch_events(), 2);
    assert_eq!(engine.inline_sound_count(), 0);
    assert_eq!(engine.node_graph().node_count(), 1);
    assert_eq!(engine.play_sound("missing", None), Err(Error::DoesNotExist));
}

#[test]
fn failed_inits_leave_nothing_behind() {
    let engine = engine();
    let resources = engine.resource_manager();
    let mono = SoundConfig::from_identity("ones")
        .with_flags(SoundFlags::DECODE)
        .with_channels_out(1);
    assert_eq!(
        Sound::init_ex(&engine, mono).err(),
        Some(Error::InvalidOperation)
    );
    assert_eq!(engine.node_graph().node_count(), 1);
    assert_eq!(resources.entry_count(), 0);
    assert!(resources.get("ones").is_none());

    let full = Engine::new(config().with_max_nodes(1)).unwrap();
    assert_eq!(
        Sound::init_from_file(&full, "ones", SoundFlags::DECODE, None, None).err(),
        Some(Error::OutOfMemory)
    );
    assert_eq!(full.resource_manager().entry_count(), 0);
    assert!(full.resource_manager().get("ones").is_none());
}

#[test]
fn offline_engine_cannot_start() {
    let engine = engine();
    assert_eq!(engine.start(), Err(Error::InvalidOperation));
    let mut odd = vec![0.0; 3];
    assert_eq!(engine.read_pcm_frames(&mut odd), Err(Error::InvalidArgs));
}

#[test]
fn graph_edits_race_the_render_thread() {
    init_tracing();
    let backend = NullBackend::new(2, RATE, 256);
    let rendered = backend.frame_counter();
    let config = EngineConfig::default()
        .with_channels(2)
        .with_sample_rate(RATE);
    let engine = Engine::with_backend(config, Box::new(backend)).unwrap();
    assert!(engine.is_running());

    // The command queue may briefly fill up while the renderer is between
    // periods; that is the only error tolerated here.
    let tolerate = |result: raumklang::Result<()>| match result {
        Ok(()) | Err(Error::Busy) => {}
        Err(e) => panic!("unexpected {e:?}"),
    };

    thread::scope(|scope| {
        for worker in 0..4 {
            let engine = &engine;
            scope.spawn(move || {
                for i in 0..25 {
                    let Ok(group) = SoundGroup::init(engine, None) else {
                        continue;
                    };
                    let tone = Waveform::sine(220.0 * (worker + 1) as f32, RATE);
                    let Ok(sound) =
                        Sound::init_from_data_source(engine, tone, SoundFlags::NONE, Some(&group))
                    else {
                        continue;
                    };
                    tolerate(sound.start());
                    sound.set_volume(i as f32 / 25.0);
                    tolerate(sound.detach());
                    tolerate(sound.attach(engine.endpoint()));
                    tolerate(group.attach(engine.endpoint()));
                    thread::sleep(Duration::from_millis(1));
                }
            });
        }
    });

    engine.stop().unwrap();
    assert!(!engine.is_running());
    engine.collect_garbage();
    assert_eq!(engine.node_graph().node_count(), 1);
    assert!(rendered.load(Ordering::Acquire) > 0);
    assert!(engine.render_epoch() > 0);

    // Stopped engines render on the caller's thread again.
    let out = render(&engine, 64);
    assert!(out.iter().all(|&s| s == 0.0));
}
