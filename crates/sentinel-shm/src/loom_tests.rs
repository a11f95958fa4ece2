#![cfg(all(test, feature = "loom"))]

use crate::mailbox::{MAILBOX_HEADER_SIZE, Mailbox};
use crate::region::HeapRegion;
use crate::reloc::{AddressSpace, Relocation};
use crate::slot::{SLOT_HEADER_SIZE, SlotStatus};
use crate::sync::{Ordering, thread};
use loom::sync::Arc;

// Loom atomics are larger than the plain ones; leave room for the headers.
const SLOT_SIZE: u32 = 512;

const LOCAL: Relocation = Relocation::identity(AddressSpace::Local, AddressSpace::Host);

fn mailbox(slot_count: u32) -> (Arc<HeapRegion>, Arc<Mailbox>) {
    assert!(MAILBOX_HEADER_SIZE.is_multiple_of(64));
    assert!(SLOT_HEADER_SIZE + 8 <= SLOT_SIZE as usize);
    let owner = Arc::new(HeapRegion::new_zeroed(Mailbox::required_size(SLOT_SIZE, slot_count)));
    let mailbox = unsafe { Mailbox::init(owner.region(), SLOT_SIZE, slot_count) }.unwrap();
    (owner, Arc::new(mailbox))
}

#[test]
fn blocking_call_handshake() {
    loom::model(|| {
        let (owner, mb) = mailbox(2);

        let consumer_mb = mb.clone();
        let consumer_owner = owner.clone();
        let consumer = thread::spawn(move || {
            let _keep = consumer_owner;
            let slot = consumer_mb.slot_at(consumer_mb.consumer_cursor());
            while slot.header.try_claim().is_err() {
                thread::yield_now();
            }
            let len = slot.header.verify().unwrap();
            let data = unsafe { slot.data_mut() };
            let arg = data[0];
            data[1] = arg + 1;
            slot.header.finish(true);
            consumer_mb.advance_consumer();
            len
        });

        let cursor = mb.reserve_cursor();
        let slot = mb.slot_at(cursor);
        slot.header.try_reserve().unwrap();
        unsafe { slot.data_mut()[0] = 41 };
        slot.header.post(2, LOCAL);

        while !slot.header.is_complete() {
            thread::yield_now();
        }
        assert_eq!(unsafe { slot.data()[1] }, 42);
        slot.header.release().unwrap();

        assert_eq!(consumer.join().unwrap(), 2);
        assert_eq!(slot.header.status(), Some(SlotStatus::Free));
        assert_eq!(mb.consumer_cursor(), SLOT_SIZE as u64);
    });
}

#[test]
fn recall_races_claim() {
    loom::model(|| {
        let (owner, mb) = mailbox(1);
        let slot = mb.slot(0);
        slot.header.try_reserve().unwrap();
        slot.header.post(0, LOCAL);

        let consumer_mb = mb.clone();
        let consumer_owner = owner.clone();
        let consumer = thread::spawn(move || {
            let _keep = consumer_owner;
            consumer_mb.slot(0).header.try_claim().is_ok()
        });

        let recalled = slot.header.recall();
        let claimed = consumer.join().unwrap();

        // Exactly one side wins the slot.
        assert_ne!(recalled, claimed);
        let expected = if recalled {
            SlotStatus::Composing
        } else {
            SlotStatus::Claimed
        };
        assert_eq!(slot.header.status(), Some(expected));
    });
}

#[test]
fn concurrent_producers_get_distinct_cursors() {
    loom::model(|| {
        let (owner, mb) = mailbox(2);

        let other_mb = mb.clone();
        let other_owner = owner.clone();
        let other = thread::spawn(move || {
            let _keep = other_owner;
            other_mb.reserve_cursor()
        });

        let mine = mb.reserve_cursor();
        let theirs = other.join().unwrap();
        assert_ne!(mb.index_of(mine), mb.index_of(theirs));
        assert_eq!(
            mb.header().producer_cursor.load(Ordering::Relaxed),
            2 * SLOT_SIZE as u64
        );
    });
}
