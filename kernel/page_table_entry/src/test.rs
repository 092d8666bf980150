extern crate std;

use super::*;
use memory_structs::{Frame, PhysicalAddress};

fn frame(n: usize) -> Frame {
    Frame::containing_address(PhysicalAddress::new_canonical(n * 0x1000))
}

#[test]
fn valid_to_transition_keeps_protection() {
    let mut pte = PageTableEntry::new_valid(frame(7), PteFlags::new().writable(true));
    if let PageTableEntry::Valid { flags, .. } = &mut pte {
        flags.insert(PteFlags::DIRTY | PteFlags::ACCESSED);
    }
    let hw = pte.set_transition().unwrap();
    assert!(hw.is_dirty());
    match pte {
        PageTableEntry::Transition { frame: f, protection } => {
            assert_eq!(f, frame(7));
            assert!(protection.is_writable());
            assert!(!protection.is_dirty());
            assert!(!protection.is_valid());
        }
        other => panic!("unexpected state {:?}", other),
    }
    assert!(pte.is_resident());
    assert_eq!(pte.pointed_frame(), None);
    assert_eq!(pte.restore_from_transition(), Some(frame(7)));
    assert!(pte.flags().unwrap().is_valid());
}

#[test]
fn set_transition_on_non_valid_is_noop() {
    let mut pte = PageTableEntry::BackingStore(BackingStoreLocation::Block(3));
    assert!(pte.set_transition().is_none());
    assert_eq!(pte, PageTableEntry::BackingStore(BackingStoreLocation::Block(3)));
    assert!(!pte.is_resident());
}

#[test]
fn zero_returns_previous_state() {
    let mut pte = PageTableEntry::Shared {
        indirection: SharedIndirection::Clone(CloneId(4)),
        protection_override: None,
    };
    let old = pte.zero();
    assert!(pte.is_unused());
    assert_eq!(old, PageTableEntry::Shared {
        indirection: SharedIndirection::Clone(CloneId(4)),
        protection_override: None,
    });
}

#[test]
fn accessed_bit_is_cleared_once() {
    let mut pte = PageTableEntry::new_valid(frame(1), PteFlags::new());
    assert!(!pte.test_and_clear_accessed());
    if let PageTableEntry::Valid { flags, .. } = &mut pte {
        flags.insert(PteFlags::ACCESSED);
    }
    assert!(pte.test_and_clear_accessed());
    assert!(!pte.test_and_clear_accessed());
}
