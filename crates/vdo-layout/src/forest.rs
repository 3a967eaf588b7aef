#![forbid(unsafe_code)]
//! Block-map forest sizing.
//!
//! The block map is a forest of k-ary trees of fan-out
//! `BLOCK_MAP_ENTRIES_PER_PAGE` (812), divided across a fixed number of
//! roots. Leaf pages hold the logical-to-physical entries; interior
//! pages index the level below, folding upward until one page per root
//! remains.

use vdo_error::{Result, VdoError};
use vdo_types::BLOCK_MAP_ENTRIES_PER_PAGE;

/// Total pages (leaves plus interior, including the roots) needed to map
/// `logical_blocks` entries across `root_count` trees.
///
/// Monotone in `logical_blocks`.
#[must_use]
pub fn block_map_page_count(logical_blocks: u64, root_count: u64) -> u64 {
    debug_assert!(root_count > 0);
    let leaf_pages = logical_blocks.max(1).div_ceil(BLOCK_MAP_ENTRIES_PER_PAGE);

    // Leaves divide as evenly as possible across the roots; each tree
    // then folds its per-root page count up by the fan-out. The loop
    // always charges the final single page per root (the tree roots).
    let mut interior_pages = 0_u64;
    let mut level_size = leaf_pages.div_ceil(root_count);
    loop {
        level_size = level_size.div_ceil(BLOCK_MAP_ENTRIES_PER_PAGE);
        interior_pages += level_size * root_count;
        if level_size <= 1 {
            break;
        }
    }

    leaf_pages + interior_pages
}

/// The largest logical capacity whose block map still fits beside it.
///
/// Used when the caller requests "fill the device": finds the largest
/// `L >= 1` with `L + block_map_page_count(L) <= available_blocks`. The
/// closed-form seed `available - page_count(available)` lands at or
/// below the answer; a bounded walk makes it exact.
pub fn compute_logical_blocks(available_blocks: u64, root_count: u64) -> Result<u64> {
    let minimum = 1 + block_map_page_count(1, root_count);
    if available_blocks < minimum {
        return Err(VdoError::OutOfRange(format!(
            "{available_blocks} blocks cannot hold a block map and any logical space \
             (minimum {minimum})"
        )));
    }

    let mut logical = available_blocks - block_map_page_count(available_blocks, root_count);
    while logical > 1 && logical + block_map_page_count(logical, root_count) > available_blocks {
        logical -= 1;
    }
    while logical + 1 + block_map_page_count(logical + 1, root_count) <= available_blocks {
        logical += 1;
    }
    Ok(logical)
}

#[cfg(test)]
mod tests {
    use super::*;
    use vdo_types::DEFAULT_BLOCK_MAP_TREE_ROOT_COUNT;

    const ROOTS: u64 = DEFAULT_BLOCK_MAP_TREE_ROOT_COUNT;

    // Vectors computed from the fan-out definition: leaves =
    // ceil(L / 812), per-root levels fold by 812, roots always counted.
    #[test]
    fn page_count_vectors() {
        // Empty and single-entry maps still hold one leaf and the roots.
        assert_eq!(block_map_page_count(0, ROOTS), 61);
        assert_eq!(block_map_page_count(1, ROOTS), 61);
        assert_eq!(block_map_page_count(812, ROOTS), 61);
        assert_eq!(block_map_page_count(813, ROOTS), 62);
        // 1292 leaves, 22 per root, one interior level of the roots.
        assert_eq!(block_map_page_count(1_048_576, ROOTS), 1352);
        // 48720 leaves = exactly 812 per root: still one root level.
        assert_eq!(block_map_page_count(812 * 812 * ROOTS, ROOTS), 48_780);
        // One entry more adds a leaf and an interior level below the roots.
        assert_eq!(block_map_page_count(812 * 812 * ROOTS + 1, ROOTS), 48_901);
    }

    #[test]
    fn page_count_single_root() {
        assert_eq!(block_map_page_count(812, 1), 2);
        assert_eq!(block_map_page_count(812 * 812, 1), 813);
    }

    #[test]
    fn page_count_is_monotone() {
        let mut previous = 0;
        for logical in (0..3_000_000_u64).step_by(4099) {
            let pages = block_map_page_count(logical, ROOTS);
            assert!(
                pages >= previous,
                "page count decreased at logical={logical}"
            );
            previous = pages;
        }
    }

    #[test]
    fn logical_derivation_is_exact_maximum() {
        for available in [62_u64, 1000, 128_958, 1 << 22] {
            let logical = compute_logical_blocks(available, ROOTS).expect("derive");
            assert!(logical + block_map_page_count(logical, ROOTS) <= available);
            assert!(
                logical + 1 + block_map_page_count(logical + 1, ROOTS) > available,
                "derived logical {logical} is not maximal for {available}"
            );
        }
    }

    #[test]
    fn logical_derivation_rejects_tiny_regions() {
        assert!(matches!(
            compute_logical_blocks(61, ROOTS),
            Err(VdoError::OutOfRange(_))
        ));
        assert_eq!(compute_logical_blocks(62, ROOTS).expect("derive"), 1);
    }
}
