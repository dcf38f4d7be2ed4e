//! The count, scan and write passes of a parallel stream compaction.

use rayon::prelude::*;
use std::mem;

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Compaction<T> {
    /// The item count of each key.
    pub counts: Vec<u32>,
    /// The exclusive prefix sum of `counts`.
    pub offsets: Vec<usize>,
    /// The items of all keys, grouped by key in key order.
    pub items: Vec<T>,
}

/// Compacting the items emitted by `walk` for every key in `0..key_count`.
///
/// `walk(key, emit)` is run twice per key, first to count the items and then
/// to write them, so it must emit the same items in the same order each time.
pub fn compact<T, W>(
    key_count: usize,
    walk: W,
) -> Compaction<T>
where
    T: Copy + Default + Send,
    W: Fn(usize, &mut dyn FnMut(T)) + Sync,
{
    // Counting the items

    let counts = (0..key_count)
        .into_par_iter()
        .map(|key| {
            let mut count = 0;
            walk(key, &mut |_: T| count += 1);
            count
        })
        .collect::<Vec<u32>>();

    // Scanning the counts

    let (offsets, total) = scan_add_exclusive(&counts);

    // Writing the items

    let mut items = vec![T::default(); total];
    let mut chunks = Vec::with_capacity(key_count);
    let mut rest = items.as_mut_slice();
    counts.iter().for_each(|&count| {
        let (chunk, tail) = mem::take(&mut rest).split_at_mut(count as usize);
        chunks.push(chunk);
        rest = tail;
    });

    chunks.into_par_iter().enumerate().for_each(|(key, chunk)| {
        let mut slots = chunk.iter_mut();
        walk(key, &mut |item: T| {
            if let Some(slot) = slots.next() {
                *slot = item;
            }
        });
        debug_assert!(slots.next().is_none(), "The walk of key {key} diverged");
    });

    Compaction {
        counts,
        offsets,
        items,
    }
}

/// Scanning the values exclusively.
///
/// ## Returns
///
/// The scanned values and their total.
pub fn scan_add_exclusive(values: &[u32]) -> (Vec<usize>, usize) {
    let mut total = 0;
    let offsets = values
        .iter()
        .scan(&mut total, |state, &value| {
            let offset = **state;
            **state += value as usize;
            Some(offset)
        })
        .collect();

    (offsets, total)
}
