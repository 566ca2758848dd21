use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use raumklang::{Engine, EngineConfig, Sound, SoundFlags, SoundGroup, Vec3, Waveform};

const RATE: u32 = 48_000;

fn populate(engine: &Engine, group: &SoundGroup, count: usize) -> Vec<Sound> {
    (0..count)
        .map(|i| {
            let tone = Waveform::sine(110.0 * (i % 8 + 1) as f32, RATE).with_amplitude(0.1);
            let sound =
                Sound::init_from_data_source(engine, tone, SoundFlags::NONE, Some(group)).unwrap();
            sound.set_position(Vec3::new(i as f32 - count as f32 / 2.0, 0.0, -2.0));
            sound.start().unwrap();
            sound
        })
        .collect()
}

pub fn criterion_benchmark(c: &mut Criterion) {
    let mut render = c.benchmark_group("Engine::read_pcm_frames");
    for count in [1, 16, 128] {
        render.bench_with_input(BenchmarkId::from_parameter(count), &count, |b, &count| {
            let engine = Engine::new(EngineConfig::offline(2, RATE)).unwrap();
            let group = SoundGroup::init(&engine, None).unwrap();
            let _sounds = populate(&engine, &group, count);
            let mut out = vec![0.0f32; 2 * 480];

            b.iter(|| engine.read_pcm_frames(black_box(&mut out)).unwrap());
        });
    }
    render.finish();
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
