//! Splitting large inserts into statements the backend will accept.
//!
//! A multi-row `INSERT` is bounded both by the number of bound parameters and
//! by statement size. [`split_batches`] cuts a run of items into consecutive
//! chunks that stay under both limits. Order is preserved and every item ends
//! up in exactly one chunk; an item that alone exceeds the byte target gets a
//! chunk of its own instead of being dropped.

use std::ops::Range;

/// Splits `sizes` into consecutive index ranges of at most `max_items` items
/// and (where possible) at most `max_bytes` bytes.
///
/// ```rust
/// use eventide::store::batch::split_batches;
///
/// let chunks = split_batches(&[10, 10, 50, 10], 3, 30);
/// assert_eq!(chunks, vec![0..2, 2..3, 3..4]);
/// ```
pub fn split_batches(sizes: &[usize], max_items: usize, max_bytes: usize) -> Vec<Range<usize>> {
    let max_items = max_items.max(1);
    let mut chunks = Vec::new();
    let mut start = 0;
    let mut bytes = 0;

    for (i, &size) in sizes.iter().enumerate() {
        let count = i - start;
        let over_bytes = count > 0 && bytes + size > max_bytes;
        if count == max_items || over_bytes {
            chunks.push(start..i);
            start = i;
            bytes = 0;
        }
        bytes += size;
    }

    if start < sizes.len() {
        chunks.push(start..sizes.len());
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_input() {
        assert!(split_batches(&[], 10, 100).is_empty());
    }

    #[test]
    fn test_item_limit() {
        let chunks = split_batches(&[1; 7], 3, usize::MAX);
        assert_eq!(chunks, vec![0..3, 3..6, 6..7]);
    }

    #[test]
    fn test_oversized_item_goes_alone() {
        let chunks = split_batches(&[5, 500, 5, 5], 10, 100);
        assert_eq!(chunks, vec![0..1, 1..2, 2..4]);
    }

    #[test]
    fn test_every_item_covered_once() {
        let sizes: Vec<usize> = (0..103).map(|i| (i * 37) % 90 + 1).collect();
        let chunks = split_batches(&sizes, 8, 200);

        let mut next = 0;
        for chunk in &chunks {
            assert_eq!(chunk.start, next);
            assert!(!chunk.is_empty());
            assert!(chunk.len() <= 8);
            let total: usize = sizes[chunk.clone()].iter().sum();
            assert!(total <= 200 || chunk.len() == 1);
            next = chunk.end;
        }
        assert_eq!(next, sizes.len());
    }
}
