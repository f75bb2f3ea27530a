use concurrent_size::{RegistryError, SizeBst};

mod common;
use common::with_tree;

use std::sync::Arc;

#[test]
fn new() {
    with_tree::<usize, usize>(|tree| drop(tree()));
}

#[test]
fn insert() {
    with_tree::<usize, usize>(|tree| {
        let tree = tree();
        let handle = tree.handle().unwrap();
        let old = handle.insert(42, 0);
        assert!(old.is_none());
    });
}

#[test]
fn get_empty() {
    with_tree::<usize, usize>(|tree| {
        let tree = tree();
        let handle = tree.handle().unwrap();
        assert!(handle.get(&42).is_none());
        assert!(!handle.contains_key(&42));
    });
}

#[test]
fn remove_empty() {
    with_tree::<usize, usize>(|tree| {
        let tree = tree();
        let handle = tree.handle().unwrap();
        assert_eq!(handle.remove(&42), None);
        assert_eq!(handle.size(), 0);
    });
}

#[test]
fn insert_and_remove() {
    with_tree::<usize, usize>(|tree| {
        let tree = tree();
        let handle = tree.handle().unwrap();
        handle.insert(42, 0);
        assert_eq!(handle.remove(&42), Some(0));
        assert!(handle.get(&42).is_none());
        assert!(handle.is_empty());
    });
}

#[test]
fn insert_and_get() {
    with_tree::<usize, usize>(|tree| {
        let tree = tree();
        let handle = tree.handle().unwrap();
        handle.insert(42, 0);
        assert_eq!(handle.get(&42), Some(0));
        assert!(handle.contains_key(&42));
    });
}

#[test]
fn reinsert() {
    with_tree::<usize, usize>(|tree| {
        let tree = tree();
        let handle = tree.handle().unwrap();
        handle.insert(42, 0);
        let old = handle.insert(42, 1);
        assert_eq!(old, Some(0));
        assert_eq!(handle.get(&42), Some(1));
        assert_eq!(handle.size(), 1);
    });
}

#[test]
fn insert_if_absent() {
    with_tree::<usize, usize>(|tree| {
        let tree = tree();
        let handle = tree.handle().unwrap();
        assert_eq!(handle.insert_if_absent(42, 0), None);
        assert_eq!(handle.insert_if_absent(42, 1), Some(0));
        assert_eq!(handle.get(&42), Some(0));
        assert_eq!(handle.size(), 1);
    });
}

#[test]
fn remove_then_reinsert() {
    with_tree::<usize, usize>(|tree| {
        let tree = tree();
        let handle = tree.handle().unwrap();
        for round in 0..8 {
            assert_eq!(handle.insert_if_absent(1, round), None);
            assert_eq!(handle.size(), 1);
            assert_eq!(handle.remove(&1), Some(round));
            assert_eq!(handle.size(), 0);
        }
    });
}

#[test]
fn borrowed_keys() {
    with_tree::<String, usize>(|tree| {
        let tree = tree();
        let handle = tree.handle().unwrap();
        handle.insert("b".to_owned(), 2);
        handle.insert("a".to_owned(), 1);
        assert_eq!(handle.get("a"), Some(1));
        assert!(handle.contains_key("b"));
        assert_eq!(handle.remove("a"), Some(1));
        assert_eq!(handle.size(), 1);
    });
}

#[test]
fn ordered_iteration() {
    with_tree::<usize, usize>(|tree| {
        let mut tree = tree();
        {
            let handle = tree.handle().unwrap();
            for k in [5, 3, 8, 1, 4, 7, 9, 2, 6] {
                handle.insert(k, k * 10);
            }
            handle.remove(&4);
        }

        let keys: Vec<_> = tree.iter().map(|(&k, _)| k).collect();
        assert_eq!(keys, [1, 2, 3, 5, 6, 7, 8, 9]);
        assert!(tree.iter().all(|(&k, &v)| v == k * 10));
        assert_eq!(tree.len_quiescent(), 8);
    });
}

#[test]
fn sorted_inserts() {
    with_tree::<usize, usize>(|tree| {
        let mut tree = tree();
        {
            let handle = tree.handle().unwrap();
            for k in 0..1024 {
                assert_eq!(handle.insert(k, k), None);
            }
            for k in (0..1024).rev().step_by(2) {
                assert_eq!(handle.remove(&k), Some(k));
            }
            assert_eq!(handle.size(), 512);
        }

        assert!(tree.iter().map(|(&k, _)| k).eq((0..1024).step_by(2)));
    });
}

#[test]
fn handles_are_released() {
    let tree = SizeBst::<usize, usize>::with_max_threads(2);
    assert_eq!(tree.max_threads(), 2);

    let a = tree.handle().unwrap();
    let b = tree.handle().unwrap();
    assert_ne!(a.id(), b.id());

    match tree.handle() {
        Err(RegistryError::Exhausted { max_threads }) => assert_eq!(max_threads, 2),
        Ok(_) => panic!("registered a third handle"),
    }

    let id = a.id();
    drop(a);
    let c = tree.handle().unwrap();
    assert_eq!(c.id(), id);
}

#[test]
#[should_panic]
fn zero_threads() {
    let _ = SizeBst::<usize, usize>::with_max_threads(0);
}

#[test]
fn default_configuration() {
    let tree = SizeBst::<usize, usize>::default();
    assert!(tree.max_threads() >= 16);
    assert!(tree.max_threads().is_power_of_two());
}

#[test]
fn drops_values() {
    with_tree::<usize, Arc<()>>(|tree| {
        let value = Arc::new(());
        {
            let tree = tree();
            let handle = tree.handle().unwrap();
            for k in 0..64 {
                handle.insert(k, value.clone());
            }
            for k in 0..32 {
                handle.remove(&k);
            }
            for k in 32..48 {
                handle.insert(k, value.clone());
            }
        }
        assert_eq!(Arc::strong_count(&value), 1);
    });
}

#[test]
fn handle_is_send() {
    let tree = SizeBst::<usize, usize>::new();
    let handle = tree.handle().unwrap();
    std::thread::scope(|s| {
        s.spawn(move || {
            handle.insert(1, 1);
        });
    });
    assert_eq!(tree.handle().unwrap().get(&1), Some(1));
}
