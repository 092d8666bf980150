extern crate std;

use super::*;
use self::std::{sync::Mutex, vec, vec::Vec};

#[derive(Default)]
struct Recorder {
    ones: Mutex<Vec<VirtualAddress>>,
    batches: Mutex<Vec<Vec<VirtualAddress>>>,
    alls: Mutex<usize>,
}

impl TlbInvalidator for Recorder {
    fn flush_one(&self, vaddr: VirtualAddress, _all_cores: bool) {
        self.ones.lock().unwrap().push(vaddr);
    }
    fn flush_batch(&self, vaddrs: &[VirtualAddress], _all_cores: bool) {
        self.batches.lock().unwrap().push(vaddrs.to_vec());
    }
    fn flush_all(&self, _all_cores: bool) {
        *self.alls.lock().unwrap() += 1;
    }
}

fn va(n: usize) -> VirtualAddress {
    VirtualAddress::new_canonical(n * 0x1000)
}

#[test]
fn single_and_batched_flushes() {
    let rec = Recorder::default();
    let mut list = FlushList::new(4, true);
    list.flush(&rec);
    list.push(va(1));
    list.flush(&rec);
    list.push(va(2));
    list.push(va(3));
    list.flush(&rec);
    assert_eq!(*rec.ones.lock().unwrap(), vec![va(1)]);
    assert_eq!(*rec.batches.lock().unwrap(), vec![vec![va(2), va(3)]]);
    assert!(list.is_empty());
}

#[test]
fn try_push_refuses_when_full() {
    let rec = Recorder::default();
    let mut list = FlushList::new(2, false);
    assert!(list.try_push(va(1)).is_ok());
    assert!(list.try_push(va(2)).is_ok());
    assert_eq!(list.len(), 2);
    assert_eq!(list.try_push(va(3)), Err(va(3)));
    list.push_or_flush(va(4), &rec);
    assert_eq!(*rec.ones.lock().unwrap(), vec![va(4)]);
    assert_eq!(list.len(), 2);
}

#[test]
fn overflow_becomes_full_flush() {
    let rec = Recorder::default();
    let mut list = FlushList::new(2, true);
    for i in 0..5 {
        list.push(va(i));
    }
    assert!(!list.is_empty());
    list.flush(&rec);
    assert_eq!(*rec.alls.lock().unwrap(), 1);
    assert!(rec.batches.lock().unwrap().is_empty());
    assert!(list.is_empty());
}
