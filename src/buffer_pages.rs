use std::fmt::{Debug, Formatter};
use crate::config::{BPAGE_SIZE, MAX_BPAGES};

/// A set of pages in a socket's receive buffer region, identified by their byte offsets
///  relative to the region's start.
///
/// This type serves two purposes:
/// * as the *result* of a receive, it lists the pages holding the received message in order.
///   All pages except the last are page aligned and hold exactly [BPAGE_SIZE] bytes of the
///   message, the last page holds the (possibly shorter) rest. The application owns these pages
///   until it hands them back.
/// * as an *input* to a receive, it lists pages that the application hands back to the
///   kernel for reuse. After that, the application must not touch them any more.
#[derive(Clone, Copy)]
pub struct BufferPageSet {
    count: u32,
    offsets: [u32; MAX_BPAGES],
}

impl Default for BufferPageSet {
    fn default() -> Self {
        Self::new()
    }
}

impl BufferPageSet {
    pub const fn new() -> BufferPageSet {
        BufferPageSet {
            count: 0,
            offsets: [0; MAX_BPAGES],
        }
    }

    pub fn from_offsets(offsets: &[u32]) -> BufferPageSet {
        let mut result = BufferPageSet::new();
        result.copy_from(offsets);
        result
    }

    /// Replace this set's content.
    ///
    /// Passing more than [MAX_BPAGES] offsets is a bug in the calling code, and this function
    ///  panics in that case.
    pub fn copy_from(&mut self, offsets: &[u32]) {
        assert!(offsets.len() <= MAX_BPAGES, "page set can hold at most {} pages, got {}", MAX_BPAGES, offsets.len());
        debug_assert!(!has_duplicates(offsets), "duplicate page offset in {:?}", offsets);

        self.offsets[..offsets.len()].copy_from_slice(offsets);
        self.offsets[offsets.len()..].fill(0);
        self.count = offsets.len() as u32;
    }

    pub fn offsets(&self) -> &[u32] {
        &self.offsets[..self.count as usize]
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn clear(&mut self) {
        self.copy_from(&[]);
    }

    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        self.offsets().iter().copied()
    }

    /// The `(offset, len)` fragments holding a message of `message_len` bytes that was received
    ///  into this page set.
    pub fn fragments(&self, message_len: usize) -> impl Iterator<Item = (u32, usize)> + '_ {
        let mut remaining = message_len;
        self.iter()
            .map(move |offset| {
                let len = remaining.min(BPAGE_SIZE);
                remaining -= len;
                (offset, len)
            })
            .filter(|(_, len)| *len > 0)
    }
}

fn has_duplicates(offsets: &[u32]) -> bool {
    offsets.iter().enumerate()
        .any(|(i, o)| offsets[..i].contains(o))
}

impl PartialEq for BufferPageSet {
    fn eq(&self, other: &Self) -> bool {
        self.offsets() == other.offsets()
    }
}
impl Eq for BufferPageSet {}

impl Debug for BufferPageSet {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "BufferPageSet{:?}", self.offsets())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_round_trip_all_sizes() {
        for n in 0..=MAX_BPAGES {
            let input = (0..n as u32)
                .map(|i| (i * 3 + 1) * BPAGE_SIZE as u32)
                .collect::<Vec<_>>();

            let mut pages = BufferPageSet::new();
            pages.copy_from(&input);

            assert_eq!(pages.count(), n as u32);
            assert_eq!(pages.offsets(), input.as_slice());
            assert_eq!(pages.is_empty(), n == 0);
        }
    }

    #[test]
    fn test_copy_from_replaces() {
        let mut pages = BufferPageSet::from_offsets(&[0, 65536, 131072]);
        pages.copy_from(&[196608]);
        assert_eq!(pages.offsets(), &[196608]);
        assert_eq!(pages, BufferPageSet::from_offsets(&[196608]));
    }

    #[test]
    #[should_panic]
    fn test_copy_from_too_many() {
        let offsets = vec![0u32; MAX_BPAGES + 1];
        BufferPageSet::new().copy_from(&offsets);
    }

    #[rstest]
    #[case::empty(vec![], vec![], true)]
    #[case::same(vec![1, 2], vec![1, 2], true)]
    #[case::different_order(vec![1, 2], vec![2, 1], false)]
    #[case::prefix(vec![1, 2], vec![1], false)]
    fn test_eq(#[case] a: Vec<u32>, #[case] b: Vec<u32>, #[case] expected: bool) {
        assert_eq!(BufferPageSet::from_offsets(&a) == BufferPageSet::from_offsets(&b), expected);
    }

    #[test]
    fn test_eq_ignores_stale_entries() {
        let mut a = BufferPageSet::from_offsets(&[7, 8, 9]);
        a.copy_from(&[7]);
        assert_eq!(a, BufferPageSet::from_offsets(&[7]));
    }

    #[rstest]
    #[case::empty_message(vec![0], 0, vec![])]
    #[case::tiny(vec![65536], 26, vec![(65536, 26)])]
    #[case::exactly_one_page(vec![0], BPAGE_SIZE, vec![(0, BPAGE_SIZE)])]
    #[case::tail(vec![0, 131072], BPAGE_SIZE + 10, vec![(0, BPAGE_SIZE), (131072, 10)])]
    fn test_fragments(#[case] offsets: Vec<u32>, #[case] message_len: usize, #[case] expected: Vec<(u32, usize)>) {
        let pages = BufferPageSet::from_offsets(&offsets);
        assert_eq!(pages.fragments(message_len).collect::<Vec<_>>(), expected);
    }
}
