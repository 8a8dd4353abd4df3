use crate::error::ParseCpuSetError;
use libc::c_ulong;
use std::{
    fmt,
    hash::{Hash, Hasher},
    str::FromStr,
    sync::atomic::{AtomicUsize, Ordering::Relaxed},
};

const WORD_BITS: usize = c_ulong::BITS as usize;

/// Largest mask width that will ever be allocated.
///
/// Linux supports at most 8192 CPUs (`CONFIG_NR_CPUS`), so an index at or
/// above this value can never be accepted by the kernel.
pub const MAX_MASK_BITS: usize = 1 << 16;

// 0 means not detected yet
static PLATFORM_BITS: AtomicUsize = AtomicUsize::new(0);

/// Width in bits of the masks exchanged with the kernel.
///
/// This is detected once from the number of configured processors, and is
/// never smaller than the `CPU_SETSIZE` of the C library. It can grow later if
/// the kernel reports a wider mask.
pub fn platform_bits() -> usize {
    match PLATFORM_BITS.load(Relaxed) {
        0 => {
            let configured = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_CONF) };
            let configured = usize::try_from(configured).unwrap_or(0);
            let bits = round_to_words(configured.max(libc::CPU_SETSIZE as usize))
                .min(MAX_MASK_BITS);
            // fetch_max returns the previous value, which may have been
            // raised concurrently
            PLATFORM_BITS.fetch_max(bits, Relaxed).max(bits)
        }
        bits => bits,
    }
}

pub(crate) fn raise_platform_bits(bits: usize) {
    PLATFORM_BITS.fetch_max(bits.min(MAX_MASK_BITS), Relaxed);
}

fn words_for(bits: usize) -> usize {
    bits.div_ceil(WORD_BITS)
}

fn round_to_words(bits: usize) -> usize {
    words_for(bits) * WORD_BITS
}

/// An owned affinity mask.
///
/// Bit `i` set means that the target may run on logical CPU `i`. The memory
/// layout matches the kernel `cpumask` ABI, so the set can be handed directly
/// to `sched_getaffinity` and `sched_setaffinity`.
#[derive(Clone)]
pub struct CpuSet {
    words: Box<[c_ulong]>,
}

impl CpuSet {
    /// Creates an empty set of [`platform_bits`] width.
    pub fn new() -> CpuSet {
        CpuSet::with_capacity(platform_bits())
    }

    /// Creates an empty set able to hold at least `bits` CPUs.
    pub fn with_capacity(bits: usize) -> CpuSet {
        CpuSet {
            words: vec![0; words_for(bits)].into_boxed_slice(),
        }
    }

    pub fn from_cpus<I: IntoIterator<Item = usize>>(cpus: I) -> CpuSet {
        let mut set = CpuSet::new();
        set.extend(cpus);
        set
    }

    /// Number of CPUs the set can hold without growing.
    pub fn capacity(&self) -> usize {
        self.words.len() * WORD_BITS
    }

    /// Adds `cpu` to the set, growing it if needed. Returns `true` if the CPU
    /// was not present.
    ///
    /// # Panics
    ///
    /// Panics if `cpu` is not below [`MAX_MASK_BITS`].
    pub fn insert(&mut self, cpu: usize) -> bool {
        assert!(
            cpu < MAX_MASK_BITS,
            "cpu out of bounds: the cpu max is {} but the cpu is {}",
            MAX_MASK_BITS - 1,
            cpu
        );
        if cpu >= self.capacity() {
            self.grow(cpu + 1);
        }
        let (word, mask) = locate(cpu);
        let absent = self.words[word] & mask == 0;
        self.words[word] |= mask;
        absent
    }

    /// Removes `cpu` from the set. Returns `true` if the CPU was present.
    pub fn remove(&mut self, cpu: usize) -> bool {
        let (word, mask) = locate(cpu);
        match self.words.get_mut(word) {
            Some(w) => {
                let present = *w & mask != 0;
                *w &= !mask;
                present
            }
            None => false,
        }
    }

    pub fn contains(&self, cpu: usize) -> bool {
        let (word, mask) = locate(cpu);
        self.words.get(word).is_some_and(|&w| w & mask != 0)
    }

    pub fn clear(&mut self) {
        self.words.fill(0);
    }

    pub fn count(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|&w| w == 0)
    }

    /// Lowest CPU in the set.
    pub fn first(&self) -> Option<usize> {
        self.iter().next()
    }

    /// Iterates over the CPUs in the set in ascending order.
    pub fn iter(&self) -> Iter<'_> {
        Iter {
            words: &self.words,
            index: 0,
            current: self.words.first().copied().unwrap_or(0),
        }
    }

    /// Releases the set. Equivalent to dropping it.
    pub fn release(self) {}

    fn grow(&mut self, bits: usize) {
        let mut words = std::mem::take(&mut self.words).into_vec();
        words.resize(words_for(bits), 0);
        self.words = words.into_boxed_slice();
    }

    // words with all the trailing zero words removed
    fn significant_words(&self) -> &[c_ulong] {
        let len = self
            .words
            .iter()
            .rposition(|&w| w != 0)
            .map_or(0, |n| n + 1);
        &self.words[..len]
    }

    pub(crate) fn byte_len(&self) -> usize {
        size_of_val(&*self.words)
    }

    pub(crate) fn as_ptr(&self) -> *const libc::cpu_set_t {
        self.words.as_ptr().cast()
    }

    pub(crate) fn as_mut_ptr(&mut self) -> *mut libc::cpu_set_t {
        self.words.as_mut_ptr().cast()
    }
}

fn locate(cpu: usize) -> (usize, c_ulong) {
    (cpu / WORD_BITS, 1 << (cpu % WORD_BITS))
}

impl Default for CpuSet {
    fn default() -> CpuSet {
        CpuSet::new()
    }
}

// Sets of different widths compare equal if they contain the same CPUs.
impl PartialEq for CpuSet {
    fn eq(&self, other: &CpuSet) -> bool {
        self.significant_words() == other.significant_words()
    }
}

impl Eq for CpuSet {}

impl Hash for CpuSet {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.significant_words().hash(state);
    }
}

impl Extend<usize> for CpuSet {
    fn extend<I: IntoIterator<Item = usize>>(&mut self, cpus: I) {
        for cpu in cpus {
            self.insert(cpu);
        }
    }
}

impl FromIterator<usize> for CpuSet {
    fn from_iter<I: IntoIterator<Item = usize>>(cpus: I) -> CpuSet {
        CpuSet::from_cpus(cpus)
    }
}

impl<'a> IntoIterator for &'a CpuSet {
    type Item = usize;
    type IntoIter = Iter<'a>;

    fn into_iter(self) -> Iter<'a> {
        self.iter()
    }
}

#[derive(Debug, Clone)]
pub struct Iter<'a> {
    words: &'a [c_ulong],
    index: usize,
    current: c_ulong,
}

impl Iterator for Iter<'_> {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        loop {
            if self.current != 0 {
                let bit = self.current.trailing_zeros() as usize;
                // clear lowest set bit
                self.current &= self.current - 1;
                return Some(self.index * WORD_BITS + bit);
            }
            self.index += 1;
            self.current = *self.words.get(self.index)?;
        }
    }
}

/// Formats the set in list notation, such as `0-3,8,10-11`.
impl fmt::Display for CpuSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut cpus = self.iter().peekable();
        let mut separator = "";
        while let Some(start) = cpus.next() {
            let mut end = start;
            while cpus.next_if_eq(&(end + 1)).is_some() {
                end += 1;
            }
            if start == end {
                write!(f, "{separator}{start}")?;
            } else {
                write!(f, "{separator}{start}-{end}")?;
            }
            separator = ",";
        }
        Ok(())
    }
}

impl fmt::Debug for CpuSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CpuSet({self})")
    }
}

/// Parses list notation, such as `0-3,8,10-11`. An empty string gives an
/// empty set.
impl FromStr for CpuSet {
    type Err = ParseCpuSetError;

    fn from_str(s: &str) -> Result<CpuSet, ParseCpuSetError> {
        let mut set = CpuSet::new();
        for part in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (start, end) = match part.split_once('-') {
                Some((start, end)) => {
                    let start = parse_index(start.trim())?;
                    let end = parse_index(end.trim())?;
                    if start > end {
                        return Err(ParseCpuSetError::InvalidRange(part.to_string()));
                    }
                    (start, end)
                }
                None => {
                    let cpu = parse_index(part)?;
                    (cpu, cpu)
                }
            };
            if end >= MAX_MASK_BITS {
                return Err(ParseCpuSetError::OutOfRange(end));
            }
            set.extend(start..=end);
        }
        Ok(set)
    }
}

fn parse_index(s: &str) -> Result<usize, ParseCpuSetError> {
    s.parse()
        .map_err(|_| ParseCpuSetError::InvalidIndex(s.to_string()))
}

#[cfg(test)]
mod test {
    use super::*;
    use rand::prelude::*;
    use std::collections::BTreeSet;

    #[test]
    fn platform_width() {
        let bits = platform_bits();
        assert!(bits >= libc::CPU_SETSIZE as usize);
        assert_eq!(bits % WORD_BITS, 0);
        // the width only grows, possibly from another test running concurrently
        assert!(CpuSet::new().capacity() >= bits);
        assert!(CpuSet::new().byte_len() >= size_of::<libc::cpu_set_t>());
    }

    #[test]
    fn insert_remove() {
        let mut set = CpuSet::with_capacity(64);
        assert!(set.is_empty());
        assert!(set.insert(3));
        assert!(!set.insert(3));
        assert!(set.contains(3));
        assert!(!set.contains(4));
        assert!(!set.contains(100_000));
        assert!(set.remove(3));
        assert!(!set.remove(3));
        assert!(!set.remove(100_000));
        assert!(set.is_empty());
    }

    #[test]
    fn insert_grows() {
        let mut set = CpuSet::with_capacity(0);
        assert_eq!(set.capacity(), 0);
        assert_eq!(set.first(), None);
        set.insert(5000);
        assert!(set.capacity() > 5000);
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![5000]);
    }

    #[test]
    #[should_panic(expected = "cpu out of bounds")]
    fn insert_beyond_max() {
        CpuSet::new().insert(MAX_MASK_BITS);
    }

    #[test]
    fn equality_ignores_width() {
        let mut narrow = CpuSet::with_capacity(64);
        let mut wide = CpuSet::with_capacity(4096);
        narrow.insert(1);
        wide.insert(1);
        assert_eq!(narrow, wide);
        wide.insert(4000);
        assert_ne!(narrow, wide);
        assert_eq!(CpuSet::with_capacity(0), CpuSet::new());
    }

    #[test]
    fn random_against_btreeset() {
        let mut rng = rand::rng();
        for _ in 0..100 {
            let mut set = CpuSet::new();
            let mut reference = BTreeSet::new();
            for _ in 0..rng.random_range(0..200) {
                let cpu = rng.random_range(0..2048);
                if rng.random_bool(0.8) {
                    assert_eq!(set.insert(cpu), reference.insert(cpu));
                } else {
                    assert_eq!(set.remove(cpu), reference.remove(&cpu));
                }
            }
            assert_eq!(set.count(), reference.len());
            assert_eq!(set.first(), reference.first().copied());
            assert_eq!(
                set.iter().collect::<Vec<_>>(),
                reference.iter().copied().collect::<Vec<_>>()
            );
            let reparsed: CpuSet = set.to_string().parse().unwrap();
            assert_eq!(reparsed, set);
        }
    }

    #[test]
    fn display() {
        let set = CpuSet::from_cpus([0, 1, 2, 3, 8, 10, 11, 63, 64]);
        assert_eq!(set.to_string(), "0-3,8,10-11,63-64");
        assert_eq!(format!("{set:?}"), "CpuSet(0-3,8,10-11,63-64)");
        assert_eq!(CpuSet::new().to_string(), "");
    }

    #[test]
    fn parse() {
        let set: CpuSet = " 0-2, 5 ,7-7".parse().unwrap();
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![0, 1, 2, 5, 7]);
        assert!("".parse::<CpuSet>().unwrap().is_empty());
        assert_eq!(
            "3-1".parse::<CpuSet>(),
            Err(ParseCpuSetError::InvalidRange("3-1".to_string()))
        );
        assert_eq!(
            "1,x".parse::<CpuSet>(),
            Err(ParseCpuSetError::InvalidIndex("x".to_string()))
        );
        assert_eq!(
            "2-".parse::<CpuSet>(),
            Err(ParseCpuSetError::InvalidIndex("".to_string()))
        );
        assert_eq!(
            format!("0-{MAX_MASK_BITS}").parse::<CpuSet>(),
            Err(ParseCpuSetError::OutOfRange(MAX_MASK_BITS))
        );
    }
}
