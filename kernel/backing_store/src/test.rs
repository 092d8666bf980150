extern crate std;

use super::*;

#[test]
fn reserve_until_full() {
    let file = PagingFile::new(70);
    for expected in 0..70 {
        assert_eq!(file.reserve_block(), Some(BackingStoreLocation::Block(expected)));
    }
    assert_eq!(file.reserve_block(), None);
    assert_eq!(file.reserved_count(), 70);
}

#[test]
fn release_returns_block_to_pool() {
    let file = PagingFile::new(8);
    let a = file.reserve_block().unwrap();
    let b = file.reserve_block().unwrap();
    assert!(file.release_block(a));
    assert_eq!(file.reserved_count(), 1);
    // the lowest free block is handed out first
    assert_eq!(file.reserve_block(), Some(a));
    assert!(file.release_block(b));
    assert_eq!(file.reserved_count(), 1);
}

#[test]
fn sentinels_are_not_released() {
    let file = PagingFile::new(4);
    assert!(!file.release_block(BackingStoreLocation::NoBlock));
    assert!(!file.release_block(BackingStoreLocation::LookupNeeded));
}

#[test]
#[should_panic(expected = "BUG")]
fn double_release_is_fatal() {
    let file = PagingFile::new(4);
    let a = file.reserve_block().unwrap();
    file.release_block(a);
    file.release_block(a);
}
