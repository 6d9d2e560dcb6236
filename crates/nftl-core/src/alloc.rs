//! Free physical block tracking.
//!
//! One bit per managed erase unit (set = free) plus a round-robin cursor.
//! Round-robin allocation spreads wear across the pool on the common path;
//! wear-aware placement happens only at mount time, when the scanner parks
//! the cursor on the least-worn free block it saw.

use nftl_types::Pbn;

#[derive(Debug, Clone)]
pub(crate) struct FreeMap {
    bits: Vec<u8>,
    nb_blocks: u16,
    cursor: u16,
}

impl FreeMap {
    /// All blocks free; the mount scan clears bits as it claims blocks.
    pub(crate) fn new_all_free(nb_blocks: u16) -> Self {
        Self {
            bits: vec![0xFF; usize::from(nb_blocks).div_ceil(8)],
            nb_blocks,
            cursor: 0,
        }
    }

    pub(crate) fn is_free(&self, pbn: Pbn) -> bool {
        debug_assert!(pbn.0 < self.nb_blocks);
        let byte = usize::from(pbn.0 / 8);
        let bit = pbn.0 % 8;
        (self.bits[byte] >> bit) & 1 == 1
    }

    pub(crate) fn set_free(&mut self, pbn: Pbn, free: bool) {
        debug_assert!(pbn.0 < self.nb_blocks);
        let byte = usize::from(pbn.0 / 8);
        let bit = pbn.0 % 8;
        if free {
            self.bits[byte] |= 1 << bit;
        } else {
            self.bits[byte] &= !(1 << bit);
        }
    }

    /// Park the round-robin cursor (mount-time wear preference).
    pub(crate) fn set_cursor(&mut self, pbn: Pbn) {
        debug_assert!(pbn.0 < self.nb_blocks);
        self.cursor = pbn.0;
    }

    /// Find the next free block scanning from the cursor, wrapping once.
    pub(crate) fn peek_next_free(&self) -> Option<Pbn> {
        let n = self.nb_blocks;
        (self.cursor..n)
            .chain(0..self.cursor)
            .map(Pbn)
            .find(|&pbn| self.is_free(pbn))
    }

    /// Claim the next free block and advance the cursor past it.
    pub(crate) fn take_next_free(&mut self) -> Option<Pbn> {
        let pbn = self.peek_next_free()?;
        self.set_free(pbn, false);
        self.cursor = (pbn.0 + 1) % self.nb_blocks;
        Some(pbn)
    }

    #[cfg(test)]
    #[expect(clippy::cast_possible_truncation)]
    pub(crate) fn free_count(&self) -> u16 {
        (0..self.nb_blocks).map(Pbn).filter(|&p| self.is_free(p)).count() as u16
    }
}
