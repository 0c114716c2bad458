use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};

use ontosync::store::sparql;
use ontosync::{diff, Mapper, RegistrySnapshot, ServiceDescriptor, UnitRecord};

fn make_registry(units: usize, relabel_every: usize) -> RegistrySnapshot {
    let rooms = (units / 16).max(1);
    let mut records: Vec<UnitRecord> = (0..rooms)
        .map(|r| {
            let mut room = UnitRecord::new(format!("room-{r}"), "Location", format!("Room {r}"));
            for d in (r..units).step_by(rooms) {
                room = room.with_child(format!("dev-{d}"));
            }
            room
        })
        .collect();

    records.extend((0..units).map(|d| {
        let label = if relabel_every > 0 && d % relabel_every == 0 {
            format!("Device {d} (renamed)")
        } else {
            format!("Device {d}")
        };
        UnitRecord::new(format!("dev-{d}"), "Light", label)
            .in_location(format!("room-{}", d % rooms))
            .with_service(ServiceDescriptor::provider("PowerState"))
    }));

    RegistrySnapshot::from_units(records).unwrap()
}

fn bench_pipeline(c: &mut Criterion) {
    let mapper = Mapper::new();
    let old = make_registry(1_024, 0);
    let new = make_registry(1_024, 10);

    let mut group = c.benchmark_group("pipeline");
    group.throughput(Throughput::Elements(old.len() as u64));

    group.bench_function("diff_1k_units", |b| {
        b.iter(|| black_box(diff(black_box(&old), black_box(&new))));
    });

    let changes = diff(&old, &new);
    group.bench_function("map_change_set_10pct_updated", |b| {
        b.iter(|| black_box(mapper.map_change_set(black_box(&changes), &old)));
    });

    let outcome = mapper.map_change_set(&changes, &old);
    group.bench_function("render_updates", |b| {
        b.iter(|| {
            for batch in &outcome.batches {
                black_box(sparql::render_update(batch));
            }
        });
    });

    group.finish();
}

criterion_group!(benches, bench_pipeline);
criterion_main!(benches);
