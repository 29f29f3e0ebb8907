use crate::bpf::BIT_WIDTH_PAGE;

/// An address prefix for a longest prefix match lookup: the upper `length`
/// bits of `key` are significant.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct Prefix {
    pub key: u64,
    pub length: u32,
}

impl Prefix {
    pub fn new(key: u64, length: u32) -> Self {
        Self { key, length }
    }

    /// Prefix matching exactly one address.
    pub fn address(key: u64) -> Self {
        Self {
            key,
            length: BIT_WIDTH_PAGE,
        }
    }
}

/// Calculate addresses for longest prefix match.
///
/// For a given inclusive address range, calculate all the prefix ranges to
/// ensure searching with Longest Prefix Match algorithm returns the precise
/// value we want. This is typically used in networking to select the right
/// subnet but we use it to store memory mappings.
pub fn summarize_address_range(low: u64, high: u64) -> Vec<Prefix> {
    let mut res = Vec::new();
    if low > high {
        return res;
    }
    if low == 0 && high == u64::MAX {
        res.push(Prefix::new(0, 0));
        return res;
    }

    let mut curr = low;
    loop {
        // Does not overflow, the whole address space was handled above.
        let remaining = high - curr + 1;
        let number_of_bits =
            std::cmp::min(curr.trailing_zeros(), (64 - remaining.leading_zeros()) - 1);
        res.push(Prefix::new(curr, BIT_WIDTH_PAGE - number_of_bits));

        let block_end = curr + ((1_u64 << number_of_bits) - 1);
        if block_end >= high {
            break;
        }
        curr = block_end + 1;
    }

    res
}
