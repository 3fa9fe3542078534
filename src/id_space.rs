//! The 32-bit image id space and its partitioning.
//!
//! An image id is spread over a terminal cell as the foreground color (up to
//! 24 bits) and an extra combining mark carrying the 4th byte. Which of those
//! channels are in use determines the *id space* of an id: five disjoint
//! classes of the 32-bit space, distinguished by which bytes must be
//! non-zero. Within a space, the byte not fixed by the encoding (the
//! *subspace byte*) can be constrained to a range, so that independent
//! applications sharing a terminal can allocate from disjoint pools.

use std::fmt;
use std::str::FromStr;

use rand::Rng;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::errors::{Errors, Result};

/// A half-open range `[begin, end)` of values for the subspace byte of an id.
///
/// The full range `[0, 256)` is the default and is written as the empty
/// string; any other subspace is written as `"begin:end"`. The singleton
/// `[0, 1)` is rejected: it would admit only a zero subspace byte, which
/// every id space reads as "byte not in use".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IDSubspace {
    begin: u16,
    end: u16,
}

impl Default for IDSubspace {
    fn default() -> Self {
        IDSubspace { begin: 0, end: 256 }
    }
}

impl IDSubspace {
    pub fn new(begin: u16, end: u16) -> Result<Self> {
        if end > 256 || begin >= end || (begin == 0 && end == 1) {
            return Err(Errors::InvalidSubspace(format!("{begin}:{end}")));
        }
        Ok(IDSubspace { begin, end })
    }

    pub fn begin(self) -> u16 {
        self.begin
    }

    pub fn end(self) -> u16 {
        self.end
    }

    pub fn num_byte_values(self) -> u32 {
        u32::from(self.end - self.begin)
    }

    pub fn num_nonzero_byte_values(self) -> u32 {
        self.num_byte_values() - u32::from(self.begin == 0)
    }

    pub fn all_byte_values(self) -> impl Iterator<Item = u8> {
        (self.begin..self.end).map(|b| b as u8)
    }

    pub fn all_nonzero_byte_values(self) -> impl Iterator<Item = u8> {
        (self.begin.max(1)..self.end).map(|b| b as u8)
    }

    pub fn contains_byte(self, b: u8) -> bool {
        self.begin <= u16::from(b) && u16::from(b) < self.end
    }

    /// A uniformly random non-zero byte value from the range.
    pub fn rand_nonzero_byte(self, rng: &mut impl Rng) -> u8 {
        rng.gen_range(self.begin.max(1)..self.end) as u8
    }

    /// Splits the range into `n` contiguous subspaces whose non-zero-value
    /// counts are as equal as possible. Every part is itself a legal
    /// subspace; `n` must not exceed `num_nonzero_byte_values()`.
    pub fn split(self, n: u32) -> Result<Vec<IDSubspace>> {
        let total = self.num_nonzero_byte_values();
        if n == 0 || n > total {
            return Err(Errors::InvalidSubspace(format!(
                "cannot split {self:?} into {n} parts"
            )));
        }
        let base = total / n;
        let rem = total % n;
        let mut parts = Vec::with_capacity(n as usize);
        let mut cur = self.begin;
        for i in 0..n {
            let quota = (base + u32::from(i < rem)) as u16;
            // The first part absorbs the zero byte on top of its quota.
            let end = cur + quota + u16::from(cur == 0);
            parts.push(IDSubspace { begin: cur, end });
            cur = end;
        }
        debug_assert_eq!(cur, self.end);
        Ok(parts)
    }
}

impl fmt::Display for IDSubspace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if (self.begin, self.end) == (0, 256) {
            Ok(())
        } else {
            write!(f, "{}:{}", self.begin, self.end)
        }
    }
}

impl FromStr for IDSubspace {
    type Err = Errors;

    fn from_str(s: &str) -> Result<Self> {
        if s.is_empty() {
            return Ok(IDSubspace::default());
        }
        let invalid = || Errors::InvalidSubspace(s.to_string());
        let (begin, end) = s.split_once(':').ok_or_else(invalid)?;
        let begin = begin.trim().parse().map_err(|_| invalid())?;
        let end = end.trim().parse().map_err(|_| invalid())?;
        IDSubspace::new(begin, end)
    }
}

impl Serialize for IDSubspace {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for IDSubspace {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// One of the five disjoint classes of the 32-bit id space.
///
/// `color_bits` is how many low bits of the id are carried by the foreground
/// color (0, 8 or 24); `use_3rd_diacritic` is whether the most significant
/// byte is carried by a third combining mark. The combination `(0, false)`
/// is rejected, it would describe the id zero alone.
///
/// Membership of an id is determined by which of its byte groups are
/// non-zero, so the five spaces never overlap and the space of an id can be
/// recovered from its bits alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IDSpace {
    color_bits: u8,
    use_3rd_diacritic: bool,
}

impl Default for IDSpace {
    fn default() -> Self {
        IDSpace {
            color_bits: 24,
            use_3rd_diacritic: true,
        }
    }
}

impl IDSpace {
    pub fn new(color_bits: u8, use_3rd_diacritic: bool) -> Result<Self> {
        match (color_bits, use_3rd_diacritic) {
            (0, true) | (8, _) | (24, _) => Ok(IDSpace {
                color_bits,
                use_3rd_diacritic,
            }),
            _ => Err(Errors::InvalidIdSpace(color_bits, use_3rd_diacritic)),
        }
    }

    pub fn color_bits(self) -> u8 {
        self.color_bits
    }

    pub fn use_3rd_diacritic(self) -> bool {
        self.use_3rd_diacritic
    }

    pub fn all_values() -> [IDSpace; 5] {
        [
            IDSpace { color_bits: 24, use_3rd_diacritic: true },
            IDSpace { color_bits: 8, use_3rd_diacritic: true },
            IDSpace { color_bits: 0, use_3rd_diacritic: true },
            IDSpace { color_bits: 24, use_3rd_diacritic: false },
            IDSpace { color_bits: 8, use_3rd_diacritic: false },
        ]
    }

    /// Short stable name, also used to derive database table names.
    pub fn name(self) -> &'static str {
        match (self.color_bits, self.use_3rd_diacritic) {
            (24, true) => "24bit_3rd",
            (8, true) => "8bit_3rd",
            (0, true) => "0bit_3rd",
            (24, false) => "24bit",
            (8, false) => "8bit",
            _ => unreachable!("constructor rejects other combinations"),
        }
    }

    pub fn contains(self, id: u32) -> bool {
        let high = id >> 24;
        let mid = (id >> 8) & 0xFFFF;
        let low = id & 0xFF;
        (high != 0) == self.use_3rd_diacritic
            && (mid != 0) == (self.color_bits == 24)
            && (low != 0) == (self.color_bits >= 8)
    }

    /// The unique space containing `id`. Fails for ids whose byte pattern
    /// matches no space (e.g. zero, or a zero low byte under non-zero
    /// middle bytes).
    pub fn from_id(id: u32) -> Result<IDSpace> {
        IDSpace::all_values()
            .into_iter()
            .find(|space| space.contains(id))
            .ok_or(Errors::UnknownIdSpace(id))
    }

    fn subspace_byte_shift(self) -> u32 {
        if self.use_3rd_diacritic { 24 } else { 0 }
    }

    /// `0xFF` shifted to the position of the subspace byte.
    pub fn subspace_byte_mask(self) -> u32 {
        0xFF << self.subspace_byte_shift()
    }

    /// The subspace byte range shifted to its position within the id.
    pub fn subspace_masked_range(self, subspace: IDSubspace) -> (u64, u64) {
        let shift = self.subspace_byte_shift();
        (
            u64::from(subspace.begin()) << shift,
            u64::from(subspace.end()) << shift,
        )
    }

    /// Non-zero choices for the variable bytes other than the subspace byte.
    fn free_combinations(self) -> u64 {
        match (self.color_bits, self.use_3rd_diacritic) {
            (24, true) => 0xFFFF * 0xFF,
            (8, true) => 0xFF,
            (24, false) => 0xFFFF,
            (0, true) | (8, false) => 1,
            _ => unreachable!("constructor rejects other combinations"),
        }
    }

    /// The number of legal ids within `subspace`.
    pub fn subspace_size(self, subspace: IDSubspace) -> u64 {
        u64::from(subspace.num_nonzero_byte_values()) * self.free_combinations()
    }

    pub fn contains_and_in_subspace(self, id: u32, subspace: IDSubspace) -> bool {
        let (begin, end) = self.subspace_masked_range(subspace);
        let masked = u64::from(id & self.subspace_byte_mask());
        self.contains(id) && begin <= masked && masked < end
    }

    /// Lazily enumerates every legal id exactly once.
    ///
    /// The subspace byte iterates slowest (ascending); within it the
    /// remaining variable bytes iterate ascending, middle word before low
    /// byte, so that sequential allocation disperses ids across the space.
    pub fn all_ids(self, subspace: IDSubspace) -> impl Iterator<Item = u32> {
        let shift = self.subspace_byte_shift();
        subspace
            .all_nonzero_byte_values()
            .flat_map(move |sb| self.ids_with_subspace_byte(u32::from(sb) << shift))
    }

    fn ids_with_subspace_byte(self, base: u32) -> Box<dyn Iterator<Item = u32>> {
        match (self.color_bits, self.use_3rd_diacritic) {
            (24, true) => Box::new((1..=0xFFFFu32).flat_map(move |mid| {
                (1..=0xFFu32).map(move |low| base | (mid << 8) | low)
            })),
            (8, true) => Box::new((1..=0xFFu32).map(move |low| base | low)),
            (24, false) => Box::new((1..=0xFFFFu32).map(move |mid| base | (mid << 8))),
            (0, true) | (8, false) => Box::new(std::iter::once(base)),
            _ => unreachable!("constructor rejects other combinations"),
        }
    }

    /// A uniformly random legal id: each variable byte is drawn
    /// independently from its non-zero domain, the subspace byte from
    /// `subspace`.
    pub fn gen_random_id(self, subspace: IDSubspace, rng: &mut impl Rng) -> u32 {
        let sb = u32::from(subspace.rand_nonzero_byte(rng)) << self.subspace_byte_shift();
        match (self.color_bits, self.use_3rd_diacritic) {
            (24, true) => sb | (rng.gen_range(1..=0xFFFFu32) << 8) | rng.gen_range(1..=0xFFu32),
            (8, true) => sb | rng.gen_range(1..=0xFFu32),
            (24, false) => sb | (rng.gen_range(1..=0xFFFFu32) << 8),
            (0, true) | (8, false) => sb,
            _ => unreachable!("constructor rejects other combinations"),
        }
    }
}

impl fmt::Display for IDSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    fn subspaces() -> Vec<IDSubspace> {
        [
            (0, 256),
            (1, 256),
            (0, 255),
            (1, 255),
            (255, 256),
            (0, 2),
            (0, 3),
            (0, 64),
            (1, 2),
            (1, 3),
            (1, 64),
            (100, 113),
        ]
        .into_iter()
        .map(|(b, e)| IDSubspace::new(b, e).unwrap())
        .collect()
    }

    #[test]
    fn subspace_rejects_bad_ranges() {
        for (begin, end) in [(0, 1), (0, 0), (10, 10), (10, 9), (10, 257), (256, 256)] {
            assert!(IDSubspace::new(begin, end).is_err(), "{begin}:{end}");
        }
    }

    #[test]
    fn subspace_string_round_trip() {
        assert_eq!("".parse::<IDSubspace>().unwrap(), IDSubspace::default());
        assert_eq!(IDSubspace::default().to_string(), "");
        for subspace in subspaces() {
            let round: IDSubspace = subspace.to_string().parse().unwrap();
            assert_eq!(round, subspace);
        }
        assert!("5".parse::<IDSubspace>().is_err());
        assert!("5:4".parse::<IDSubspace>().is_err());
        assert!("a:b".parse::<IDSubspace>().is_err());
    }

    #[test]
    fn subspace_byte_enumeration() {
        for subspace in subspaces() {
            let all: Vec<u8> = subspace.all_byte_values().collect();
            assert_eq!(all.len() as u32, subspace.num_byte_values());
            assert!(all.windows(2).all(|w| w[0] < w[1]));

            let nonzero: Vec<u8> = subspace.all_nonzero_byte_values().collect();
            assert_eq!(nonzero.len() as u32, subspace.num_nonzero_byte_values());
            assert!(!nonzero.contains(&0));
            if all.len() != nonzero.len() {
                assert_eq!(all[0], 0);
                assert_eq!(&all[1..], &nonzero[..]);
            }

            for b in 0..=255u8 {
                assert_eq!(subspace.contains_byte(b), all.contains(&b));
            }
        }
    }

    #[test]
    fn subspace_rand_nonzero_byte_covers_range() {
        let mut rng = rand::thread_rng();
        for subspace in [
            IDSubspace::new(0, 2).unwrap(),
            IDSubspace::new(1, 5).unwrap(),
            IDSubspace::new(255, 256).unwrap(),
        ] {
            let mut remaining: HashSet<u8> = subspace.all_nonzero_byte_values().collect();
            for _ in 0..2000 {
                let b = subspace.rand_nonzero_byte(&mut rng);
                assert!(b != 0 && subspace.contains_byte(b));
                remaining.remove(&b);
            }
            assert!(remaining.is_empty());
        }
    }

    #[test]
    fn subspace_split_is_contiguous_and_complete() {
        for subspace in subspaces() {
            for n in 1..=subspace.num_nonzero_byte_values().min(9) {
                let parts = subspace.split(n).unwrap();
                assert_eq!(parts.len() as u32, n);
                assert_eq!(parts[0].begin(), subspace.begin());
                assert_eq!(parts[parts.len() - 1].end(), subspace.end());
                for pair in parts.windows(2) {
                    assert_eq!(pair[0].end(), pair[1].begin());
                }
                let bytes: u32 = parts.iter().map(|p| p.num_byte_values()).sum();
                assert_eq!(bytes, subspace.num_byte_values());
                let nonzero: u32 = parts.iter().map(|p| p.num_nonzero_byte_values()).sum();
                assert_eq!(nonzero, subspace.num_nonzero_byte_values());
            }
        }
        assert!(IDSubspace::default().split(0).is_err());
        assert!(IDSubspace::new(1, 3).unwrap().split(3).is_err());
    }

    #[test]
    fn id_space_five_distinct_values() {
        let names: HashSet<&str> = IDSpace::all_values().iter().map(|s| s.name()).collect();
        assert_eq!(names.len(), 5);
        assert!(IDSpace::new(0, false).is_err());
        assert!(IDSpace::new(7, true).is_err());
        assert_eq!(IDSpace::default(), IDSpace::new(24, true).unwrap());
    }

    fn check_id(space: IDSpace, subspace: IDSubspace, id: u32) {
        assert!(id > 0);
        assert!(space.contains(id));
        assert!(space.contains_and_in_subspace(id, subspace));
        assert_eq!(IDSpace::from_id(id).unwrap(), space);
        let (begin, end) = space.subspace_masked_range(subspace);
        let masked = u64::from(id & space.subspace_byte_mask());
        assert!(begin <= masked && masked < end);
        for other in IDSpace::all_values() {
            if other != space {
                assert!(!other.contains(id), "{id:#x} in both {space} and {other}");
            }
        }
        if space.use_3rd_diacritic() {
            assert_ne!(id & 0xFF000000, 0);
        } else {
            assert_eq!(id & 0xFF000000, 0);
        }
        match space.color_bits() {
            0 => assert_eq!(id & 0x00FFFFFF, 0),
            8 => {
                assert_eq!(id & 0x00FFFF00, 0);
                assert_ne!(id & 0x000000FF, 0);
            }
            _ => assert_ne!(id & 0x00FFFF00, 0),
        }
    }

    #[test]
    fn all_ids_enumerates_each_id_once() {
        for space in IDSpace::all_values() {
            for subspace in subspaces() {
                let mut seen = HashSet::new();
                for id in space.all_ids(subspace).take(10000) {
                    check_id(space, subspace, id);
                    assert!(seen.insert(id), "{id:#x} repeated");
                }
                let size = space.subspace_size(subspace);
                if size < 10000 {
                    assert_eq!(seen.len() as u64, size);
                }
            }
        }
    }

    #[test]
    fn gen_random_id_stays_in_subspace() {
        let mut rng = rand::thread_rng();
        for space in IDSpace::all_values() {
            for subspace in subspaces() {
                let mut seen = HashSet::new();
                for _ in 0..2000 {
                    let id = space.gen_random_id(subspace, &mut rng);
                    check_id(space, subspace, id);
                    seen.insert(id);
                }
                let size = space.subspace_size(subspace);
                if size < 200 {
                    // Small subspaces should be covered entirely.
                    assert_eq!(seen.len() as u64, size);
                }
            }
        }
    }

    #[test]
    fn from_id_rejects_unclassifiable_ids() {
        assert!(IDSpace::from_id(0).is_err());
        // Non-zero middle bytes with a zero low byte match no space.
        assert!(IDSpace::from_id(0x00000100).is_err());
        assert!(IDSpace::from_id(0x01000100).is_err());
    }
}
