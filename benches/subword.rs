use std::hint::black_box;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, SamplingMode, Throughput};
use nmtbuild::{SubwordConfig, SubwordLearner};

const STEMS: [&str; 8] = [
    "translat", "model", "parliament", "session", "decod", "train", "corpus", "vocabular",
];
const SUFFIXES: [&str; 6] = ["", "s", "ing", "ion", "ed", "er"];

fn build_pairs() -> Vec<(String, String)> {
    (0..4096)
        .map(|i| {
            let words: Vec<String> = (0..12)
                .map(|j| {
                    let stem = STEMS[(i * 7 + j) % STEMS.len()];
                    let suffix = SUFFIXES[(i + j * 3) % SUFFIXES.len()];
                    format!("{stem}{suffix}")
                })
                .collect();
            let source = words.join(" ");
            let target = words.iter().rev().cloned().collect::<Vec<_>>().join(" ");
            (source, target)
        })
        .collect()
}

fn bench_learning(c: &mut Criterion) {
    let pairs = build_pairs();
    let total_bytes: usize = pairs.iter().map(|(s, t)| s.len() + t.len()).sum();
    let cfg = SubwordConfig::builder()
        .symbols(500)
        .min_frequency(2)
        .show_progress(false)
        .build()
        .expect("configuration");

    let mut group = c.benchmark_group("learn_subword_model");
    group.throughput(Throughput::Bytes(total_bytes as u64));
    group.sampling_mode(SamplingMode::Flat);
    group.bench_function(BenchmarkId::from_parameter("pairs_4096"), |b| {
        b.iter(|| {
            let mut learner = SubwordLearner::new(cfg.clone()).expect("learner");
            for (source, target) in &pairs {
                learner.add_pair(source, target);
            }
            let model = learner.finish().expect("learning");
            let _ = black_box(model);
        });
    });

    let mut learner = SubwordLearner::new(cfg).expect("learner");
    for (source, target) in &pairs {
        learner.add_pair(source, target);
    }
    let model = learner.finish().expect("learning");
    group.bench_function(BenchmarkId::new("encode", "pairs_4096"), |b| {
        b.iter(|| {
            let mut encoder = model.encoder();
            for (source, _) in &pairs {
                black_box(encoder.encode_line(source));
            }
        });
    });
    group.finish();
}

criterion_group!(benches, bench_learning);
criterion_main!(benches);
