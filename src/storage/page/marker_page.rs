//! Reserved first page holding the dirty-shutdown markers.
//!
//! Layout: bytes `0..8` hold a random stamp written on create and on every
//! open; bytes `8..16` receive a copy of it on clean close. If the two differ
//! at the next open, the previous run did not shut down cleanly.

use crate::storage::PAGE_SIZE;
use rand::RngCore;

const CREATED_OFFSET: usize = 0;
const CLOSED_OFFSET: usize = 8;
const MARKER_LEN: usize = 8;

pub fn initial_raw() -> Box<[u8; PAGE_SIZE]> {
    let mut data = Box::new([0u8; PAGE_SIZE]);
    stamp_open(&mut data);
    data
}

pub fn stamp_open(data: &mut [u8; PAGE_SIZE]) {
    rand::thread_rng().fill_bytes(&mut data[CREATED_OFFSET..CREATED_OFFSET + MARKER_LEN]);
}

pub fn stamp_close(data: &mut [u8; PAGE_SIZE]) {
    data.copy_within(CREATED_OFFSET..CREATED_OFFSET + MARKER_LEN, CLOSED_OFFSET);
}

pub fn is_clean(data: &[u8; PAGE_SIZE]) -> bool {
    data[CREATED_OFFSET..CREATED_OFFSET + MARKER_LEN]
        == data[CLOSED_OFFSET..CLOSED_OFFSET + MARKER_LEN]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_page_is_not_clean() {
        let data = initial_raw();
        assert!(!is_clean(&data));
    }

    #[test]
    fn test_close_then_open_cycle() {
        let mut data = initial_raw();
        stamp_close(&mut data);
        assert!(is_clean(&data));

        stamp_open(&mut data);
        assert!(!is_clean(&data));

        stamp_close(&mut data);
        assert!(is_clean(&data));
    }
}
