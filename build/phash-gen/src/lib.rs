// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::{collections::HashSet, hash::Hash};

use anyhow::{bail, Result};
use rand::prelude::*;
use rand_chacha::ChaCha20Rng;

use phash::Reduce;

////////////////////////////////////////////////////////////////////////////////

/// An owned perfect hash from keys to values. This `struct` is intended for
/// use in codegen, so it doesn't actually expose a way to retrieve items
/// from the table; `phash::PerfectHash` is intended for use at runtime.
pub struct OwnedPerfectHashMap<K, V> {
    pub m: K,
    pub values: Vec<Option<(K, V)>>,
}

impl<K, V> OwnedPerfectHashMap<K, V>
where
    K: Copy + Reduce + Hash + Eq,
{
    /// Checks if `m` creates a valid perfect hash with some number of slots.
    fn check(values: &[(K, V)], slots: usize, m: K) -> bool {
        assert!(slots >= values.len());

        let mut vs = values
            .iter()
            .map(|v| v.0.reduce(m) as usize % slots)
            .collect::<Vec<usize>>();
        vs.sort_unstable();
        vs.dedup();
        vs.len() == values.len()
    }

    /// Attempts to generate a perfect hash for the given input data.
    pub fn build(values: Vec<(K, V)>, random_key: impl Fn(&mut ChaCha20Rng) -> K) -> Result<Self> {
        if values.iter().map(|v| &v.0).collect::<HashSet<_>>().len()
            != values.len()
        {
            bail!("Cannot build a perfect hash with duplicate keys");
        }

        const TRY_COUNT: usize = 1_000;
        let mut rng = ChaCha20Rng::seed_from_u64(0x1de);
        for slots in values.len()..(2 * values.len() + 1) {
            for _ in 0..TRY_COUNT {
                let m = random_key(&mut rng);
                if Self::check(&values, slots, m) {
                    let mut out = (0..slots).map(|_| None).collect::<Vec<_>>();
                    for v in values.into_iter() {
                        let index = v.0.reduce(m) as usize % slots;
                        assert!(out[index].is_none());
                        out[index] = Some(v);
                    }
                    return Ok(Self { m, values: out });
                }
            }
        }

        bail!("Could not generate perfect hash");
    }
}

////////////////////////////////////////////////////////////////////////////////

/// A plain sorted lookup table, used as a fallback when the key set is too
/// small for a perfect hash to pay for itself.
pub struct OwnedSortedList<K, V> {
    pub values: Vec<(K, V)>,
}

impl<K, V> OwnedSortedList<K, V>
where
    K: Eq + Ord,
{
    pub fn build(mut values: Vec<(K, V)>) -> Result<Self> {
        values.sort_by(|x, y| x.0.cmp(&y.0));
        Ok(Self { values })
    }
}

////////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;

    fn hash_slots(values: Vec<u32>) -> usize {
        let values = values.into_iter().map(|v| (v, ())).collect();
        OwnedPerfectHashMap::build(values, |rng| rng.random())
            .unwrap()
            .values
            .len()
    }

    #[test]
    fn small_hash() {
        let values = vec![36, 51, 13, 14];
        assert_eq!(values.len(), hash_slots(values));
    }

    #[test]
    fn medium_hash() {
        let values =
            vec![36, 51, 85, 61, 31, 32, 33, 34, 72, 73, 95, 96];
        assert!(values.len() + 1 >= hash_slots(values));
    }

    #[test]
    fn tuple_hash() {
        let values: Vec<((u32, u32), ())> = vec![
            (2, 0b1),
            (3, 0b1),
            (4, 0b1),
            (5, 0b1),
            (5, 0b11),
            (8, 0b0),
            (9, 0b1),
            (9, 0b10),
        ]
        .into_iter()
        .map(|k| (k, ()))
        .collect();
        let out = OwnedPerfectHashMap::build(values, |rng| {
            (rng.random(), rng.random())
        });
        assert!(out.is_ok());
    }

    #[test]
    fn relative_primes() {
        let values = vec![5, 7];
        assert!(values.len() + 1 >= hash_slots(values));
    }
}
