//! Performance benchmarks for the DSP module
//!
//! Run with: cargo bench -p xbar_dsp

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use xbar_dsp::{
    AudioStream, BundleArena, ElementaryMixer, PoolHandler, Ramp, RampShape, StreamInfo,
};

fn make_info(stream: &AudioStream, index: usize) -> StreamInfo {
    StreamInfo {
        index,
        id: stream.id(),
        name: stream.name().to_string(),
        channels: stream.channels(),
        assignments: stream.assignments().to_vec(),
    }
}

fn benchmark_mixer_run(c: &mut Criterion) {
    let mut group = c.benchmark_group("elementary_mixer");

    let frame_sizes = [64u32, 128, 256, 512];

    for frame in frame_sizes {
        group.throughput(Throughput::Elements(frame as u64));

        group.bench_function(format!("run_2in_2out_{}_frames", frame), |b| {
            let handler = PoolHandler::new();
            let mut arena = BundleArena::new(frame);
            let in0 =
                AudioStream::new("in0", 1, 2, frame, false, &handler, &mut arena).unwrap();
            let in1 =
                AudioStream::new("in1", 2, 2, frame, false, &handler, &mut arena).unwrap();
            let mut out =
                AudioStream::new("out", 3, 2, frame, false, &handler, &mut arena).unwrap();
            let inputs = [make_info(&in0, 0), make_info(&in1, 1)];
            let output = make_info(&out, 2);
            let mut mixer =
                ElementaryMixer::new("bench", &output, &inputs, frame, 48_000, None).unwrap();

            b.iter(|| {
                out.clear_bundled(&mut arena).unwrap();
                mixer.run(black_box(&mut arena)).unwrap();
            });
        });
    }

    group.finish();
}

fn benchmark_mixer_with_active_ramp(c: &mut Criterion) {
    c.bench_function("mixer_run_ramping", |b| {
        let frame = 64u32;
        let handler = PoolHandler::new();
        let mut arena = BundleArena::new(frame);
        let in0 = AudioStream::new("in0", 1, 2, frame, false, &handler, &mut arena).unwrap();
        let mut out = AudioStream::new("out", 2, 2, frame, false, &handler, &mut arena).unwrap();
        let inputs = [make_info(&in0, 0)];
        let output = make_info(&out, 1);
        let mut mixer =
            ElementaryMixer::new("bench", &output, &inputs, frame, 48_000, None).unwrap();

        b.iter(|| {
            // Re-arm a long ramp so the per-sample tile update stays active
            mixer.set_balance(1, 1.0, 0.0).unwrap();
            out.clear_bundled(&mut arena).unwrap();
            mixer.run(black_box(&mut arena)).unwrap();
        });
    });
}

fn benchmark_ramp_generation(c: &mut Criterion) {
    c.bench_function("ramp_values_64", |b| {
        let mut ramp = Ramp::new(48_000, 64);
        let mut data = vec![0.0f32; 64];

        b.iter(|| {
            ramp.set_timed_ramp(0.0, 1.0, 1000, RampShape::Linear).unwrap();
            ramp.ramp_values(black_box(&mut data)).unwrap();
        });
    });
}

criterion_group!(
    benches,
    benchmark_mixer_run,
    benchmark_mixer_with_active_ramp,
    benchmark_ramp_generation
);

criterion_main!(benches);
