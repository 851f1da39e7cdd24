// SPDX-License-Identifier: LGPL-3.0-only

pub mod bytes {
    use std::cmp::Ordering;

    #[must_use]
    pub fn all_zero(data: &[u8]) -> bool {
        data.iter().all(|b| *b == 0)
    }

    #[must_use]
    pub fn any_nonzero(data: &[u8]) -> bool {
        !all_zero(data)
    }

    pub fn clear(data: &mut [u8]) {
        data.fill(0);
    }

    /// `compare` orders two equal-length byte-slices as big-endian unsigned values.
    ///
    /// # Panics
    ///
    /// Panics on unequal lengths.
    #[must_use]
    pub fn compare(a: &[u8], b: &[u8]) -> Ordering {
        assert_eq!(a.len(), b.len());
        for i in 0..a.len() {
            match a[i].cmp(&b[i]) {
                Ordering::Equal => continue,
                unequal => return unequal,
            }
        }
        Ordering::Equal
    }

    /// `drop_value` produces a copy of `data` with every occurrence of `v` removed.
    #[must_use]
    pub fn drop_value(data: &[u8], v: u8) -> Vec<u8> {
        data.iter().copied().filter(|b| *b != v).collect()
    }
}

pub mod u32 {
    #[must_use]
    pub fn from_be(bytes: &[u8]) -> u32 {
        assert_eq!(4, bytes.len());
        u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
    }

    /// `nonzero` passes through any value except `0`, which becomes `None`.
    #[must_use]
    pub fn nonzero(value: u32) -> Option<u32> {
        if value == 0 {
            None
        } else {
            Some(value)
        }
    }
}

pub mod vec {
    #[must_use]
    pub fn unique<T: Ord>(mut src: Vec<T>) -> Vec<T> {
        src.sort_unstable();
        src.dedup();
        src
    }
}
