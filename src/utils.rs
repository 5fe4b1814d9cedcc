use crate::host_page_size;

pub fn usize_is_multiple_of_host_page_size(bytes: usize) -> bool {
    bytes % host_page_size() == 0
}

pub fn round_usize_up_to_host_pages(bytes: usize) -> usize {
    let page_size = host_page_size();
    debug_assert!(page_size.is_power_of_two());
    bytes
        .checked_add(page_size - 1)
        .map(|val| val & !(page_size - 1))
        .unwrap_or_else(|| {
            panic!("{bytes} is too large to be rounded up to a multiple of the host page size")
        })
}

pub fn round_usize_down_to_host_pages(bytes: usize) -> usize {
    let page_size = host_page_size();
    debug_assert!(page_size.is_power_of_two());
    bytes & !(page_size - 1)
}

pub fn round_u64_up_to_host_pages(bytes: u64) -> u64 {
    let page_size = host_page_size() as u64;
    bytes
        .checked_add(page_size - 1)
        .map(|val| val & !(page_size - 1))
        .unwrap_or_else(|| {
            panic!("{bytes} is too large to be rounded up to a multiple of the host page size")
        })
}

pub fn round_u64_down_to_host_pages(bytes: u64) -> u64 {
    bytes & !(host_page_size() as u64 - 1)
}

/// Round `n` up to the next multiple of four. Frozen-binary records are
/// 4-byte aligned throughout.
pub fn align4(n: usize) -> usize {
    (n + 3) & !3
}

pub fn align4_u32(n: u32) -> u32 {
    (n + 3) & !3
}

/// Round `n` up to the next multiple of eight (link-data slots).
pub fn align8_u32(n: u32) -> u32 {
    (n + 7) & !7
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alignment_helpers() {
        assert_eq!(align4(0), 0);
        assert_eq!(align4(1), 4);
        assert_eq!(align4(4), 4);
        assert_eq!(align4(5), 8);
        assert_eq!(align8_u32(9), 16);
        let page = host_page_size();
        assert_eq!(round_usize_up_to_host_pages(1), page);
        assert_eq!(round_usize_down_to_host_pages(page + 1), page);
    }
}
