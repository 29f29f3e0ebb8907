use std::fmt;

use thiserror::Error;

use crate::bpf::{
    StackDelta, STACK_DELTA_BUCKET_LARGEST, STACK_DELTA_PAGE_BITS, STACK_DELTA_PAGE_MASK,
};

/// Most pages an executable can span, one per delta of the largest bucket.
pub const MAX_PAGES: u64 = 1 << STACK_DELTA_BUCKET_LARGEST;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PagesError {
    #[error("delta addresses are not sorted at index {0}")]
    Unsorted(usize),
    #[error("page 0x{0:x} has more than 65535 deltas")]
    TooManyDeltas(u64),
    #[error("address 0x{0:x} is more than 8388608 pages past the first delta")]
    SpanTooLarge(u64),
}

/// Number of stack deltas in each page of an executable, starting at
/// `first_page`. Pages without deltas in between are counted as 0.
#[derive(PartialEq, Eq, Default)]
pub struct PageDeltas {
    pub first_page: u64,
    pub counts: Vec<u16>,
}

impl fmt::Debug for PageDeltas {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("PageDeltas")
            .field("first_page", &format_args!("0x{:x}", self.first_page))
            .field("counts", &self.counts)
            .finish()
    }
}

/// Groups sorted delta addresses into 16 bit pages.
///
/// The kernel looks up the page of a program counter and binary searches the
/// deltas of that page only, using the low 16 bits of their addresses.
pub fn deltas_per_page(addresses: &[u64]) -> Result<PageDeltas, PagesError> {
    let Some(first) = addresses.first() else {
        return Ok(PageDeltas::default());
    };

    let first_page = first & STACK_DELTA_PAGE_MASK;
    let mut counts: Vec<u16> = Vec::new();
    let mut prev = *first;

    for (i, &address) in addresses.iter().enumerate() {
        if address < prev {
            return Err(PagesError::Unsorted(i));
        }
        prev = address;

        let page = address & STACK_DELTA_PAGE_MASK;
        let index = (page - first_page) >> STACK_DELTA_PAGE_BITS;
        if index >= MAX_PAGES {
            return Err(PagesError::SpanTooLarge(address));
        }
        let index = index as usize;
        if index >= counts.len() {
            counts.resize(index + 1, 0);
        }
        counts[index] = counts[index]
            .checked_add(1)
            .ok_or(PagesError::TooManyDeltas(page))?;
    }

    Ok(PageDeltas { first_page, counts })
}

/// Delta for `address`, keeping only the bits within its page.
pub fn stack_delta(address: u64, unwind_info: u16) -> StackDelta {
    StackDelta {
        addr_low: (address & !STACK_DELTA_PAGE_MASK) as u16,
        unwind_info,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bpf::STACK_DELTA_PAGE_SIZE;

    #[test]
    fn test_deltas_per_page() {
        assert_eq!(deltas_per_page(&[]).unwrap(), PageDeltas::default());
        assert_eq!(
            deltas_per_page(&[0x100]).unwrap(),
            PageDeltas {
                first_page: 0,
                counts: vec![1]
            }
        );

        let addresses = [0xf7527, 0xf7530, 0xfac00, 0xfac68, 0x1102f4, 0x1103f4];
        assert_eq!(
            deltas_per_page(&addresses).unwrap(),
            PageDeltas {
                first_page: 0xf0000,
                counts: vec![4, 0, 2]
            }
        );

        let addresses = [0x0, STACK_DELTA_PAGE_SIZE, 4 * STACK_DELTA_PAGE_SIZE];
        assert_eq!(
            deltas_per_page(&addresses).unwrap(),
            PageDeltas {
                first_page: 0,
                counts: vec![1, 1, 0, 0, 1]
            }
        );
    }

    #[test]
    fn test_every_delta_is_in_its_page() {
        let addresses: Vec<u64> = (0..2000).map(|i| 0x400000 + i * 0x95).collect();
        let pages = deltas_per_page(&addresses).unwrap();
        assert_eq!(
            pages.counts.iter().map(|&c| c as usize).sum::<usize>(),
            addresses.len()
        );

        let mut first_delta = 0;
        for (n, &count) in pages.counts.iter().enumerate() {
            let page = pages.first_page + ((n as u64) << STACK_DELTA_PAGE_BITS);
            for &address in &addresses[first_delta..first_delta + count as usize] {
                assert_eq!(address & STACK_DELTA_PAGE_MASK, page);
                let delta = stack_delta(address, 0);
                assert_eq!(page + delta.addr_low as u64, address);
            }
            first_delta += count as usize;
        }
    }

    #[test]
    fn test_invalid_input() {
        assert_eq!(
            deltas_per_page(&[0x20, 0x10]),
            Err(PagesError::Unsorted(1))
        );
        assert_eq!(
            deltas_per_page(&[0x0, 1 << 60]),
            Err(PagesError::SpanTooLarge(1 << 60))
        );
        let last = (MAX_PAGES - 1) << STACK_DELTA_PAGE_BITS;
        assert_eq!(
            deltas_per_page(&[0x0, last + 0x10]).unwrap().counts.len(),
            MAX_PAGES as usize
        );
        assert_eq!(
            deltas_per_page(&[0x0, last + STACK_DELTA_PAGE_SIZE]),
            Err(PagesError::SpanTooLarge(last + STACK_DELTA_PAGE_SIZE))
        );
        let crowded = vec![0x10000; u16::MAX as usize + 1];
        assert_eq!(
            deltas_per_page(&crowded),
            Err(PagesError::TooManyDeltas(0x10000))
        );
    }
}
