use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use osmbin_core::model::{Bounds, LatLon, Node, Way};
use osmbin_core::{DataSet, DataSetOptions, FileTileDataSet, OsmBinDataSetV10, TileOptions};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::hint::black_box;
use tempfile::TempDir;

const NODES: i64 = 20_000;

fn populate(dataset: &dyn DataSet) {
    let mut rng = StdRng::seed_from_u64(7);
    for id in 1..=NODES {
        let (lat, lon) = (rng.random_range(52.3..52.7), rng.random_range(13.1..13.7));
        dataset.add_node(Node::new(id, 1, lat, lon)).unwrap();
    }
    for way_id in 1..=NODES / 10 {
        let start = (way_id - 1) * 10 + 1;
        dataset.add_way(Way::new(way_id, 1, (start..start + 10).collect())).unwrap();
    }
    dataset.flush().unwrap();
}

fn bench_queries(c: &mut Criterion) {
    let osmbin_dir = TempDir::new().unwrap();
    let osmbin = OsmBinDataSetV10::open(osmbin_dir.path(), DataSetOptions::default()).unwrap();
    populate(&osmbin);

    let tiles_dir = TempDir::new().unwrap();
    let tiles = FileTileDataSet::open(tiles_dir.path(), TileOptions::default()).unwrap();
    populate(&tiles);

    let datasets: [(&str, &dyn DataSet); 2] = [("osmbin", &osmbin), ("tiles", &tiles)];
    let bounds = Bounds::new(52.50, 13.38, 52.52, 13.42);
    let here = LatLon::new(52.5219, 13.4132);

    let mut group = c.benchmark_group("queries");
    for (name, dataset) in datasets {
        group.bench_with_input(BenchmarkId::new("get_nodes", name), &bounds, |b, bounds| {
            b.iter(|| black_box(dataset.get_nodes(bounds).unwrap()));
        });
        group.bench_with_input(BenchmarkId::new("get_ways", name), &bounds, |b, bounds| {
            b.iter(|| black_box(dataset.get_ways(bounds).unwrap()));
        });
        group.bench_with_input(BenchmarkId::new("nearest_node", name), &here, |b, &here| {
            b.iter(|| black_box(dataset.get_nearest_node(here, &|_| true).unwrap()));
        });
    }
    group.finish();
}

criterion_group!(benches, bench_queries);
criterion_main!(benches);
