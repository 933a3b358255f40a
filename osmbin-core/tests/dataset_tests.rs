use osmbin_core::model::{Bounds, EntityType, LatLon, Member, Node, Relation, Way};
use osmbin_core::{DataSet, DataSetOptions, OsmBinDataSetV10, StorageError};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use tempfile::TempDir;

fn open(dir: &Path) -> OsmBinDataSetV10 {
    OsmBinDataSetV10::open(dir, DataSetOptions::default()).unwrap()
}

fn ids<T>(items: &[T], id: impl Fn(&T) -> i64) -> Vec<i64> {
    let mut ids: Vec<i64> = items.iter().map(id).collect();
    ids.sort_unstable();
    ids
}

#[test]
fn test_alexanderplatz() {
    let dir = TempDir::new().unwrap();
    let dataset = open(dir.path());

    let alex = Node::new(1001, 1, 52.5219, 13.4132).with_tag("name", "Alexanderplatz");
    dataset.add_node(alex).unwrap();
    dataset.add_node(Node::new(1002, 1, 52.5225, 13.4150)).unwrap();
    dataset.add_way(Way::new(55, 1, vec![1001, 1002]).with_tag("highway", "pedestrian")).unwrap();

    let node = dataset.get_node_by_id(1001).unwrap().unwrap();
    assert_eq!(node.tags.get("name").map(String::as_str), Some("Alexanderplatz"));
    assert!((node.lat - 52.5219).abs() < 1e-7);

    let ways = dataset.get_ways_for_node(1001).unwrap();
    assert_eq!(ids(&ways, |w| w.id), vec![55]);
    let bbox = dataset.get_stored_way(55).unwrap().unwrap().bbox.unwrap();
    assert!(bbox.contains(52.5219, 13.4132) && bbox.contains(52.5225, 13.4150));

    let around = Bounds::new(52.52, 13.41, 52.523, 13.414);
    assert_eq!(ids(&dataset.get_nodes(&around).unwrap(), |n| n.id), vec![1001]);
    assert_eq!(ids(&dataset.get_ways(&around).unwrap(), |w| w.id), vec![55]);
    dataset.shutdown().unwrap();
}

#[test]
fn test_older_version_leaves_files_untouched() {
    let dir = TempDir::new().unwrap();
    let dataset = open(dir.path());
    dataset.add_node(Node::new(1, 2, 10.0, 20.0).with_tag("amenity", "bench")).unwrap();
    dataset.flush().unwrap();
    let before = fs::read(dir.path().join("nodes.obm")).unwrap();

    dataset.add_node(Node::new(1, 1, 11.0, 21.0)).unwrap();
    dataset.add_node(Node::new(1, 2, 11.0, 21.0)).unwrap();
    dataset.flush().unwrap();

    assert_eq!(fs::read(dir.path().join("nodes.obm")).unwrap(), before);
    assert_eq!(dataset.get_node_by_id(1).unwrap().unwrap().version, 2);
}

#[test]
fn test_back_references_stay_symmetric() {
    let dir = TempDir::new().unwrap();
    let dataset = open(dir.path());
    let mut rng = StdRng::seed_from_u64(42);

    for id in 1..=50 {
        let (lat, lon) = (rng.random_range(-1.0..1.0), rng.random_range(-1.0..1.0));
        dataset.add_node(Node::new(id, 1, lat, lon)).unwrap();
    }
    for version in 1..=3 {
        for way_id in 1..=20 {
            let len = rng.random_range(2..8);
            let node_ids = (0..len).map(|_| rng.random_range(1..=60)).collect();
            dataset.add_way(Way::new(way_id, version, node_ids)).unwrap();
        }
    }
    for node_id in [3, 17, 33] {
        dataset.remove_node(node_id).unwrap();
    }
    dataset.remove_way(7).unwrap();

    for node_id in 1..=60 {
        for way in dataset.get_ways_for_node(node_id).unwrap() {
            assert!(
                way.node_ids.contains(&node_id),
                "way {} does not list node {}",
                way.id,
                node_id
            );
        }
    }
    for way_id in 1..=20 {
        let Some(way) = dataset.get_way_by_id(way_id).unwrap() else {
            assert_eq!(way_id, 7);
            continue;
        };
        for node_id in way.node_ids {
            if dataset.contains_node(node_id).unwrap() {
                let listed = dataset.get_ways_for_node(node_id).unwrap();
                assert!(
                    listed.iter().any(|w| w.id == way_id),
                    "node {node_id} does not list way {way_id}"
                );
            }
        }
    }
}

#[test]
fn test_concurrent_writers_keep_back_references_symmetric() {
    let dir = TempDir::new().unwrap();
    let dataset = Arc::new(open(dir.path()));
    for id in 1..=40 {
        dataset.add_node(Node::new(id, 1, f64::from(id as i32) * 0.01, 0.5)).unwrap();
    }

    // each thread owns its own way and relation ids but shares the nodes
    let handles: Vec<_> = (0..4i64)
        .map(|t| {
            let dataset = Arc::clone(&dataset);
            thread::spawn(move || {
                let mut rng = StdRng::seed_from_u64(t as u64);
                for version in 1..=3 {
                    for w in 1..=10 {
                        let len = rng.random_range(2..6);
                        let node_ids = (0..len).map(|_| rng.random_range(1..=40)).collect();
                        dataset.add_way(Way::new(t * 100 + w, version, node_ids)).unwrap();
                        dataset.get_ways_for_node(rng.random_range(1..=40)).unwrap();
                    }
                    let members = (1..=3)
                        .map(|w| Member::new(EntityType::Way, t * 100 + w, "part"))
                        .collect();
                    dataset.add_relation(Relation::new(1000 + t, version, members)).unwrap();
                    dataset.get_relations_for_way(t * 100 + 1).unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    for node_id in 1..=40 {
        for way in dataset.get_ways_for_node(node_id).unwrap() {
            assert!(
                way.node_ids.contains(&node_id),
                "way {} does not list node {}",
                way.id,
                node_id
            );
        }
    }
    for t in 0..4i64 {
        for w in 1..=10 {
            let way = dataset.get_way_by_id(t * 100 + w).unwrap().unwrap();
            assert_eq!(way.version, 3);
            for node_id in way.node_ids {
                let listed = dataset.get_ways_for_node(node_id).unwrap();
                assert!(
                    listed.iter().any(|l| l.id == way.id),
                    "node {node_id} does not list way {}",
                    way.id
                );
            }
        }
        for w in 1..=3 {
            let relations = dataset.get_relations_for_way(t * 100 + w).unwrap();
            assert_eq!(ids(&relations, |r| r.id), vec![1000 + t]);
        }
    }
}

#[test]
fn test_relation_members_get_back_references() {
    let dir = TempDir::new().unwrap();
    let dataset = open(dir.path());
    dataset.add_node(Node::new(1, 1, 0.5, 0.5)).unwrap();
    dataset.add_node(Node::new(2, 1, 0.6, 0.6)).unwrap();
    dataset.add_way(Way::new(10, 1, vec![1, 2])).unwrap();
    let members = vec![
        Member::new(EntityType::Way, 10, "outer"),
        Member::new(EntityType::Node, 2, "admin_centre"),
    ];
    dataset.add_relation(Relation::new(100, 1, members).with_tag("type", "boundary")).unwrap();

    assert_eq!(ids(&dataset.get_relations_for_way(10).unwrap(), |r| r.id), vec![100]);
    assert_eq!(ids(&dataset.get_relations_for_node(2).unwrap(), |r| r.id), vec![100]);
    assert!(dataset.get_relations_for_node(1).unwrap().is_empty());
    // reached through way 10
    let around = Bounds::new(0.4, 0.4, 0.55, 0.55);
    assert_eq!(ids(&dataset.get_relations(&around).unwrap(), |r| r.id), vec![100]);

    let relation = dataset.get_relation_by_id(100).unwrap().unwrap();
    assert_eq!(relation.members[1].role, "admin_centre");

    // dropping the node member drops its back-reference only
    let members = vec![Member::new(EntityType::Way, 10, "outer")];
    dataset.add_relation(Relation::new(100, 2, members)).unwrap();
    assert!(dataset.get_relations_for_node(2).unwrap().is_empty());
    assert_eq!(dataset.get_relations_for_way(10).unwrap().len(), 1);

    assert!(dataset.remove_relation(100).unwrap());
    assert!(dataset.get_relations_for_way(10).unwrap().is_empty());
}

#[test]
fn test_tag_values_around_the_slot_width() {
    let dir = TempDir::new().unwrap();
    let dataset = open(dir.path());
    let sixteen = "abcdefghijklmnop";
    let seventeen = "abcdefghijklmnopq";
    let unicode = "Straße am Fluß über der Brücke";

    dataset
        .add_node(
            Node::new(1, 1, 0.0, 0.0)
                .with_tag("a", sixteen)
                .with_tag("b", seventeen)
                .with_tag("c", "")
                .with_tag("name", unicode),
        )
        .unwrap();

    let node = dataset.get_node_by_id(1).unwrap().unwrap();
    assert_eq!(node.tags.get("a").map(String::as_str), Some(sixteen));
    assert_eq!(node.tags.get("b").map(String::as_str), Some(seventeen));
    assert_eq!(node.tags.get("c").map(String::as_str), Some(""));
    assert_eq!(node.tags.get("name").map(String::as_str), Some(unicode));

    let world = Bounds::WORLD;
    assert_eq!(dataset.get_nodes_by_tag(&world, "b", Some(seventeen)).unwrap().len(), 1);

    // four 16-char values fill one record exactly, a 17th char spills into a second
    let three = |id| {
        Node::new(id, 1, 0.0, 0.0)
            .with_tag("a", sixteen)
            .with_tag("b", sixteen)
            .with_tag("c", sixteen)
    };
    dataset.add_node(three(2).with_tag("d", sixteen)).unwrap();
    dataset.add_node(three(3).with_tag("d", seventeen)).unwrap();
    let nodes = dataset.nodes_file().read();
    assert_eq!(nodes.store().read_element(2).unwrap().unwrap().records.len(), 1);
    assert_eq!(nodes.store().read_element(3).unwrap().unwrap().records.len(), 2);
    drop(nodes);
    let by_tag = dataset.get_nodes_by_tag(&world, "d", Some(sixteen)).unwrap();
    assert_eq!(ids(&by_tag, |n| n.id), vec![2]);
}

#[test]
fn test_bounding_box_edges_are_inclusive() {
    let dir = TempDir::new().unwrap();
    let dataset = open(dir.path());
    dataset.add_node(Node::new(1, 1, 1.0, 1.0)).unwrap();
    dataset.add_node(Node::new(2, 1, 2.0, 2.0)).unwrap();
    dataset.add_node(Node::new(3, 1, 2.0000001, 2.0)).unwrap();

    let nodes = dataset.get_nodes(&Bounds::new(1.0, 1.0, 2.0, 2.0)).unwrap();
    assert_eq!(ids(&nodes, |n| n.id), vec![1, 2]);
    assert_eq!(dataset.get_nodes(&Bounds::WORLD).unwrap().len(), 3);
}

#[test]
fn test_ids_beyond_32_bits_are_rejected() {
    let dir = TempDir::new().unwrap();
    let dataset = open(dir.path());
    let id = i64::from(i32::MAX) + 1;

    let err = dataset.add_node(Node::new(id, 1, 0.0, 0.0)).unwrap_err();
    assert_eq!(err.downcast_ref::<StorageError>(), Some(&StorageError::IdOverflow(id)));
    let err = dataset.add_way(Way::new(1, 1, vec![id])).unwrap_err();
    assert_eq!(err.downcast_ref::<StorageError>(), Some(&StorageError::IdOverflow(id)));
    assert!(!dataset.contains_way(1).unwrap());
}

#[test]
fn test_removed_node_refreshes_way_box() {
    let dir = TempDir::new().unwrap();
    let dataset = open(dir.path());
    dataset.add_node(Node::new(1, 1, 0.0, 0.0)).unwrap();
    dataset.add_node(Node::new(2, 1, 1.0, 1.0)).unwrap();
    dataset.add_way(Way::new(10, 1, vec![1, 2])).unwrap();

    assert!(dataset.remove_node(2).unwrap());
    assert!(!dataset.remove_node(2).unwrap());
    let stored = dataset.get_stored_way(10).unwrap().unwrap();
    assert_eq!(stored.way.node_ids, vec![1, 2]);
    assert!(dataset.ways_file().read().contains(10).unwrap());
    assert_eq!(stored.bbox, Some(Bounds::point(LatLon::new(0.0, 0.0))));

    assert!(dataset.remove_node(1).unwrap());
    assert_eq!(dataset.get_stored_way(10).unwrap().unwrap().bbox, None);
}

#[test]
fn test_nearest_node() {
    let dir = TempDir::new().unwrap();
    let dataset = open(dir.path());
    dataset.add_node(Node::new(1, 1, 48.1371, 11.5754).with_tag("amenity", "cafe")).unwrap();
    dataset.add_node(Node::new(2, 1, 48.1400, 11.5600)).unwrap();
    dataset.add_node(Node::new(3, 1, 40.0, -3.7)).unwrap();

    let here = LatLon::new(48.1380, 11.5700);
    assert_eq!(dataset.get_nearest_node(here, &|_| true).unwrap().unwrap().id, 1);
    let far = dataset.get_nearest_node(here, &|n| n.id == 3).unwrap().unwrap();
    assert_eq!(far.id, 3);
    assert!(dataset.get_nearest_node(here, &|_| false).unwrap().is_none());
}

#[test]
fn test_data_survives_reopen() {
    let dir = TempDir::new().unwrap();
    {
        let dataset = open(dir.path());
        dataset.add_node(Node::new(1, 1, 10.0, 10.0).with_tag("name", "first")).unwrap();
        dataset.add_node(Node::new(2, 1, 10.1, 10.1)).unwrap();
        dataset.add_way(Way::new(5, 1, vec![1, 2])).unwrap();
        dataset.shutdown().unwrap();
    }

    let dataset = open(dir.path());
    let node = dataset.get_node_by_id(1).unwrap().unwrap();
    assert_eq!(node.tags.get("name").map(String::as_str), Some("first"));
    assert_eq!(ids(&dataset.get_ways_for_node(2).unwrap(), |w| w.id), vec![5]);
    assert_eq!(dataset.get_nodes(&Bounds::new(9.9, 9.9, 10.05, 10.05)).unwrap().len(), 1);
}
