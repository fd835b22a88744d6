use criterion::{criterion_group, criterion_main, Criterion};
use rally_core::{Variability, DEFAULT_DISTANCE_KM};
use rally_sim::{race_rng, race_time_minutes, CarPerformance, TrackCatalog};

fn bench_race_times(c: &mut Criterion) {
    let catalog = TrackCatalog::builtin();
    let factor = catalog.get("Desert Loop").map(|t| t.factor).unwrap_or(1.0);
    let field: Vec<CarPerformance> = (0..32)
        .map(|i| CarPerformance {
            speed_kmh: 180.0 + i as f64,
            durability: 0.6 + 0.01 * i as f64,
            acceleration: 0.9 - 0.01 * i as f64,
        })
        .collect();
    let mut rng = race_rng(Some(42));
    c.bench_function("time_32_car_field", |b| {
        b.iter(|| {
            for p in &field {
                let _ = race_time_minutes(
                    p,
                    factor,
                    DEFAULT_DISTANCE_KM,
                    Variability::default(),
                    &mut rng,
                );
            }
        })
    });
}

criterion_group!(benches, bench_race_times);
criterion_main!(benches);
