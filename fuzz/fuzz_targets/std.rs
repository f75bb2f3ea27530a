#![no_main]

use libfuzzer_sys::fuzz_target;

use arbitrary::Arbitrary;
use concurrent_size::SizeBst;
use std::collections::BTreeMap;

#[derive(Debug, Arbitrary)]
enum Operation<K, V> {
    Insert(K, V),
    InsertIfAbsent(K, V),
    Remove(K),
    Get(K),
    Contains(K),
    Size,
    IsEmpty,
}

#[derive(Debug, Arbitrary)]
struct FuzzInput {
    operations: Vec<Operation<u16, u32>>,
}

fn fuzz_tree(input: FuzzInput) {
    let mut std_map = BTreeMap::new();
    let mut tree = SizeBst::with_max_threads(1);

    {
        let handle = tree.handle().unwrap();

        for op in input.operations {
            match op {
                Operation::Insert(k, v) => {
                    let std_result = std_map.insert(k, v);
                    let tree_result = handle.insert(k, v);
                    assert_eq!(std_result, tree_result);
                }
                Operation::InsertIfAbsent(k, v) => {
                    let std_result = match std_map.get(&k) {
                        Some(&current) => Some(current),
                        None => {
                            std_map.insert(k, v);
                            None
                        }
                    };
                    let tree_result = handle.insert_if_absent(k, v);
                    assert_eq!(std_result, tree_result);
                }
                Operation::Remove(k) => {
                    let std_result = std_map.remove(&k);
                    let tree_result = handle.remove(&k);
                    assert_eq!(std_result, tree_result);
                }
                Operation::Get(k) => {
                    let std_result = std_map.get(&k).copied();
                    let tree_result = handle.get(&k);
                    assert_eq!(std_result, tree_result);
                }
                Operation::Contains(k) => {
                    assert_eq!(std_map.contains_key(&k), handle.contains_key(&k));
                }
                Operation::Size => {
                    assert_eq!(std_map.len(), handle.size());
                }
                Operation::IsEmpty => {
                    assert_eq!(std_map.is_empty(), handle.is_empty());
                }
            }
        }

        assert_eq!(std_map.len(), handle.size());
    }

    // Final consistency checks
    assert!(std_map.iter().eq(tree.iter()));
    assert_eq!(std_map.len(), tree.len_quiescent());
}

fuzz_target!(|data: FuzzInput| {
    fuzz_tree(data);
});
