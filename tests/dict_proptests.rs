// Dictionary property tests.
//
// Property 1: an unordered dictionary behaves like std's HashMap.
//  - Model: HashMap<u64, u32>.
//  - Operations: insert (checking the returned prior value), remove
//    (checking the returned value), lookup, and an occasional clear.
//  - Invariant: after every operation the table's structural invariants
//    hold and len() matches the model.
//
// Property 2: an ordered dictionary answers nth_entry by insertion rank.
//  - Model: Vec<(u64, u32)> where replacement updates in place and
//    removal erases the pair.
//
// Property 3: robust iteration under random mutation delivers every
// entry that was present at the start and never removed, and never
// delivers any entry twice.
use std::collections::HashMap;
use std::collections::HashSet;

use proptest::prelude::*;
use robin_dict::DictOrder;
use robin_dict::Dictionary;
use robin_dict::HashKey;

fn key(k: u64) -> HashKey {
    HashKey::from(k)
}

proptest! {
    #[test]
    fn prop_unordered_matches_hashmap(
        ops in proptest::collection::vec((0u8..=3u8, 0u64..24u64, any::<u32>()), 1..200)
    ) {
        let mut dict: Dictionary<u32> = Dictionary::new(DictOrder::Unordered);
        let mut model: HashMap<u64, u32> = HashMap::new();

        for (op, k, v) in ops {
            match op {
                0 | 1 => {
                    let prior = dict.insert_key(key(k), v, None);
                    prop_assert_eq!(prior, model.insert(k, v));
                }
                2 => {
                    let removed = dict.remove_key(&key(k), None);
                    prop_assert_eq!(removed, model.remove(&k));
                }
                3 => {
                    // Rare full reset; lifetime counters survive it.
                    if k == 0 {
                        dict.clear();
                        model.clear();
                    } else {
                        prop_assert_eq!(dict.lookup_key(&key(k)).copied(), model.get(&k).copied());
                    }
                }
                _ => unreachable!(),
            }

            dict.assert_valid();
            prop_assert_eq!(dict.len(), model.len());
        }

        // Final sweep: every model entry is found, every other key is not.
        for k in 0..24u64 {
            prop_assert_eq!(dict.lookup_key(&key(k)).copied(), model.get(&k).copied());
        }
    }
}

proptest! {
    #[test]
    fn prop_ordered_nth_matches_insertion_order(
        ops in proptest::collection::vec((0u8..=2u8, 0u64..16u64, any::<u32>()), 1..100)
    ) {
        let mut dict: Dictionary<u32> = Dictionary::new(DictOrder::Ordered);
        let mut model: Vec<(u64, u32)> = Vec::new();

        for (op, k, v) in ops {
            match op {
                0 | 1 => {
                    dict.insert_key(key(k), v, None);
                    match model.iter_mut().find(|(mk, _)| *mk == k) {
                        Some(slot) => slot.1 = v,
                        None => model.push((k, v)),
                    }
                }
                2 => {
                    dict.remove_key(&key(k), None);
                    model.retain(|(mk, _)| *mk != k);
                }
                _ => unreachable!(),
            }

            dict.assert_valid();
            prop_assert_eq!(dict.len(), model.len());
        }

        for (n, (k, v)) in model.iter().enumerate() {
            let (bytes, value) = dict.nth_entry_with_key(n).expect("entry in range");
            let expected_key = key(*k);
            prop_assert_eq!(bytes, expected_key.bytes());
            prop_assert_eq!(*value, *v);
        }
        prop_assert_eq!(dict.nth_entry(model.len()), None);
    }
}

proptest! {
    #[test]
    fn prop_robust_iteration_delivers_survivors(
        initial in 1u64..40u64,
        ops in proptest::collection::vec((0u8..=2u8, 0u64..80u64), 0..120)
    ) {
        let mut dict: Dictionary<u32> = Dictionary::new(DictOrder::Unordered);
        for k in 0..initial {
            dict.insert_key(key(k), k as u32, None);
        }

        let mut ops = ops.into_iter();
        let mut iter = dict.make_robust_iter();
        let mut seen: HashSet<Vec<u8>> = HashSet::new();
        let mut removed: HashSet<Vec<u8>> = HashSet::new();
        let mut fresh = 0u64;

        while let Some((bytes, _)) = dict.robust_next(&mut iter) {
            let bytes = bytes.to_vec();
            prop_assert!(seen.insert(bytes), "entry delivered twice");

            match ops.next() {
                Some((0, target)) => {
                    let victim = key(target % (initial + fresh));
                    if dict.remove_key(&victim, None).is_some() {
                        removed.insert(victim.bytes().to_vec());
                    }
                }
                Some((1, _)) => {
                    dict.insert_key(key(10_000 + fresh), 0, None);
                    fresh += 1;
                }
                _ => {}
            }
        }

        dict.assert_valid();
        for k in 0..initial {
            let bytes = key(k).bytes().to_vec();
            if !removed.contains(&bytes) {
                prop_assert!(seen.contains(&bytes), "surviving entry was skipped");
            }
        }
    }
}
