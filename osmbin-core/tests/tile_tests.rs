use osmbin_core::model::{Bounds, EntityType, LatLon, Member, Node, Relation, Way};
use osmbin_core::{DataSet, FileTileDataSet, TileOptions};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use tempfile::TempDir;

fn open(dir: &Path) -> FileTileDataSet {
    FileTileDataSet::open(dir, TileOptions { tile_size: 0.5, save_queue_capacity: 4 }).unwrap()
}

fn populate(dataset: &FileTileDataSet) {
    dataset.add_node(Node::new(1, 1, 52.52, 13.40).with_tag("name", "Berlin")).unwrap();
    dataset.add_node(Node::new(2, 1, 52.53, 13.41)).unwrap();
    dataset.add_node(Node::new(3, 1, 48.14, 11.58).with_tag("name", "München")).unwrap();
    dataset.add_way(Way::new(10, 1, vec![1, 2]).with_tag("highway", "primary")).unwrap();
    dataset.add_way(Way::new(11, 1, vec![2, 3]).with_tag("highway", "motorway")).unwrap();
    dataset
        .add_relation(Relation::new(
            100,
            1,
            vec![Member::new(EntityType::Way, 11, ""), Member::new(EntityType::Node, 3, "")],
        ))
        .unwrap();
}

fn check(dataset: &FileTileDataSet) {
    let munich_node = dataset.get_node_by_id(3).unwrap().unwrap();
    assert_eq!(munich_node.tags.get("name").map(String::as_str), Some("München"));
    let mut ways: Vec<i64> = dataset.get_ways_for_node(2).unwrap().iter().map(|w| w.id).collect();
    ways.sort_unstable();
    assert_eq!(ways, vec![10, 11]);
    assert_eq!(dataset.get_relations_for_way(11).unwrap().len(), 1);
    assert_eq!(dataset.get_relations_for_node(3).unwrap().len(), 1);

    let munich = Bounds::new(48.0, 11.0, 48.5, 12.0);
    assert_eq!(dataset.get_nodes(&munich).unwrap().len(), 1);
    let ways: Vec<i64> = dataset.get_ways(&munich).unwrap().iter().map(|w| w.id).collect();
    assert_eq!(ways, vec![11]);
    assert_eq!(dataset.get_ways_by_tag(&Bounds::WORLD, "highway", None).unwrap().len(), 2);
    assert_eq!(dataset.get_ways_by_tag(&munich, "highway", Some("primary")).unwrap().len(), 0);
}

#[test]
fn test_reopen_keeps_everything() {
    let dir = TempDir::new().unwrap();
    let dataset = open(dir.path());
    populate(&dataset);
    check(&dataset);
    dataset.shutdown().unwrap();

    assert!(dir.path().join("tiles").join("index.bin").exists());
    let dataset = open(dir.path());
    check(&dataset);
}

#[test]
fn test_index_is_rebuilt_from_tiles() {
    let dir = TempDir::new().unwrap();
    let dataset = open(dir.path());
    populate(&dataset);
    dataset.shutdown().unwrap();

    fs::remove_file(dir.path().join("tiles").join("index.bin")).unwrap();
    let dataset = open(dir.path());
    check(&dataset);
}

#[test]
fn test_unflushed_index_is_not_trusted() {
    let dir = TempDir::new().unwrap();
    let dataset = open(dir.path());
    populate(&dataset);
    dataset.flush().unwrap();

    dataset.add_node(Node::new(4, 1, 52.54, 13.42)).unwrap();
    // the first change after a flush invalidates the saved index
    assert!(!dir.path().join("tiles").join("index.bin").exists());
    dataset.shutdown().unwrap();

    let dataset = open(dir.path());
    assert!(dataset.contains_node(4).unwrap());
}

#[test]
fn test_tile_size_mismatch_is_rejected() {
    let dir = TempDir::new().unwrap();
    open(dir.path()).shutdown().unwrap();
    assert!(FileTileDataSet::open(dir.path(), TileOptions::default()).is_err());
}

#[test]
fn test_emptied_tile_file_is_removed() {
    let dir = TempDir::new().unwrap();
    let dataset = open(dir.path());
    dataset.add_node(Node::new(1, 1, 10.1, 10.1)).unwrap();
    dataset.flush().unwrap();
    let key = dataset.tile_of(EntityType::Node, 1).unwrap();
    let file = dir.path().join("tiles").join(format!("{}_{}.tile", key.x, key.y));
    assert!(file.exists());

    assert!(dataset.remove_node(1).unwrap());
    dataset.flush().unwrap();
    assert!(!file.exists());
    assert!(dataset.populated_tiles().is_empty());
}

#[test]
fn test_nearest_node_across_tiles() {
    let dir = TempDir::new().unwrap();
    let dataset = open(dir.path());
    populate(&dataset);

    let near_munich = LatLon::new(48.2, 11.6);
    assert_eq!(dataset.get_nearest_node(near_munich, &|_| true).unwrap().unwrap().id, 3);
    let named_elsewhere = |n: &Node| n.tags.contains_key("name") && n.id != 3;
    let berlin = dataset.get_nearest_node(near_munich, &named_elsewhere).unwrap();
    assert_eq!(berlin.unwrap().id, 1);
    assert!(dataset.get_nearest_node(near_munich, &|_| false).unwrap().is_none());
}

#[test]
fn test_concurrent_writers() {
    let dir = TempDir::new().unwrap();
    let dataset = Arc::new(open(dir.path()));

    let handles: Vec<_> = (0..4)
        .map(|t| {
            let dataset = Arc::clone(&dataset);
            thread::spawn(move || {
                for i in 0..50 {
                    let id = t * 1000 + i;
                    let node = Node::new(id, 1, f64::from(t as i32), f64::from(i as i32) * 0.1);
                    dataset.add_node(node).unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    dataset.flush().unwrap();
    assert_eq!(dataset.get_nodes(&Bounds::WORLD).unwrap().len(), 200);
}
