use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use mammorisk::config::ModelConfig;
use mammorisk::encoder::{FrozenEncoder, ImageEncoder};
use ndarray::Array2;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;

fn config_for(side: usize) -> ModelConfig {
    ModelConfig {
        image_height: side,
        image_width: side,
        ..ModelConfig::default()
    }
}

fn random_image(side: usize, rng: &mut StdRng) -> Array2<f64> {
    Array2::from_shape_simple_fn((side, side), || rng.gen_range(0.0..65_535.0))
}

fn benchmark_encoder(c: &mut Criterion) {
    let sides = [64_usize, 128, 256];
    let mut group = c.benchmark_group("encoder_forward");
    group.sample_size(20);
    for &side in &sides {
        let mut rng = StdRng::seed_from_u64(0x5EED + side as u64);
        let config = config_for(side);
        let encoder = ImageEncoder::new(&config, &mut rng);
        let image = random_image(side, &mut rng);
        group.throughput(Throughput::Elements((side * side) as u64));

        group.bench_with_input(BenchmarkId::new("single_view", side), &image, |b, input| {
            b.iter(|| {
                let embedding = encoder.encode(black_box(input));
                black_box(embedding).ok();
            });
        });

        let frozen = FrozenEncoder::new(encoder);
        let exam: Vec<Array2<f64>> = (0..4).map(|_| random_image(side, &mut rng)).collect();
        group.bench_with_input(BenchmarkId::new("four_views_parallel", side), &exam, |b, views| {
            b.iter(|| {
                let embeddings: Vec<_> = views.par_iter().map(|view| frozen.encode(black_box(view))).collect();
                black_box(embeddings);
            });
        });
    }
    group.finish();
}

criterion_group!(encoder_forward, benchmark_encoder);
criterion_main!(encoder_forward);
