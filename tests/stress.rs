//! Randomized mixed-workload stress test: many threads pushing, popping, and
//! inserting concurrently against one list, then a single-threaded drain
//! checking that no value was lost or duplicated.

use std::thread::scope;

use crossbeam_epoch::pin;
use rand::Rng;
use tail_list::TailList;

const THREADS: u64 = 8;
const OPS: u64 = 2000;
const SEEDS: u64 = 8;

#[test]
fn mixed_workload_conserves_values() {
    let list: TailList<u64> = TailList::new();

    // Seed a few well-known values for the inserters to aim at; they may be
    // popped at any point, in which case an insert legitimately fails.
    for i in 0..SEEDS {
        let guard = pin();
        list.push(i, &guard);
    }

    let results = scope(|scope| {
        let handles: Vec<_> = (0..THREADS)
            .map(|t| {
                let list = &list;
                scope.spawn(move || {
                    let mut rng = rand::thread_rng();
                    let mut pushed = Vec::new();
                    let mut inserted = Vec::new();
                    let mut popped = Vec::new();

                    for i in 0..OPS {
                        let guard = pin();
                        match rng.gen_range(0..4) {
                            0 | 1 => {
                                let value = (t + 1) * 1_000_000 + i;
                                list.push(value, &guard);
                                pushed.push(value);
                            }
                            2 => {
                                if let Some(v) = list.pop(&guard) {
                                    popped.push(v);
                                }
                            }
                            _ => {
                                let value = (t + 1) * 1_000_000 + 500_000 + i;
                                let target = rng.gen_range(0..SEEDS);
                                if list.insert_after(value, &target, &guard) {
                                    inserted.push(value);
                                }
                            }
                        }
                    }

                    (pushed, inserted, popped)
                })
            })
            .collect();

        handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .collect::<Vec<_>>()
    });

    let mut expected: Vec<u64> = (0..SEEDS).collect();
    let mut observed = Vec::new();
    for (pushed, inserted, popped) in results {
        expected.extend(pushed);
        expected.extend(inserted);
        observed.extend(popped);
    }

    // Drain what is left single-threaded.
    loop {
        let guard = pin();
        match list.pop(&guard) {
            Some(v) => observed.push(v),
            None => break,
        }
    }

    {
        let guard = pin();
        assert!(list.is_empty(&guard));
    }

    expected.sort_unstable();
    observed.sort_unstable();
    assert_eq!(expected, observed);
}

#[test]
fn pushers_and_poppers_terminate() {
    let list: TailList<u64> = TailList::new();

    let popped = scope(|scope| {
        let list = &list;
        let mut poppers = Vec::new();
        for t in 0..THREADS {
            scope.spawn(move || {
                for i in 0..OPS {
                    let guard = pin();
                    list.push(t * OPS + i, &guard);
                }
            });
            poppers.push(scope.spawn(move || {
                let mut popped = 0;
                for _ in 0..OPS {
                    let guard = pin();
                    if list.pop(&guard).is_some() {
                        popped += 1;
                    }
                }
                popped
            }));
        }
        poppers.into_iter().map(|h| h.join().unwrap()).sum::<u64>()
    });

    let guard = pin();
    let remaining = list.iter(&guard).count() as u64;
    assert_eq!(remaining, THREADS * OPS - popped);
}
