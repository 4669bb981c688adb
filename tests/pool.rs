use esox_sqlpool::{
    PoolError, Lease, ObjectPool, PoolConfiguration, PooledResource, ResourceFactory, PoolResult,
    create_object_pool,
};

use crossbeam::channel;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

#[derive(Debug, Clone)]
struct Slot {
    id: usize,
    primary: bool,
    key: Option<u32>,
    tag: bool,
    loan: u64,
}

impl PooledResource<u32> for Slot {
    fn is_primary(&self) -> bool {
        self.primary
    }

    fn matches(&self, key: &u32) -> bool {
        self.key == Some(*key)
    }

    fn tag(&self) -> bool {
        self.tag
    }

    fn set_tag(&mut self, tag: bool) {
        self.tag = tag;
    }

    fn loan(&self) -> u64 {
        self.loan
    }

    fn set_loan(&mut self, loan: u64) {
        self.loan = loan;
    }

    fn release_memory(&mut self) {
        self.key = None;
    }
}

#[derive(Default)]
struct Slots {
    made: AtomicUsize,
    live: AtomicUsize,
    peak: AtomicUsize,
}

impl Slots {
    fn make(&self, primary: bool) -> Slot {
        let live = self.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(live, Ordering::SeqCst);
        Slot {
            id: self.made.fetch_add(1, Ordering::SeqCst),
            primary,
            key: None,
            tag: false,
            loan: 0,
        }
    }
}

impl ResourceFactory<Slot> for Slots {
    fn make_object(&self) -> PoolResult<Slot> {
        Ok(self.make(false))
    }

    fn make_primary_object(&self) -> PoolResult<Slot> {
        Ok(self.make(true))
    }

    fn destroy_object(&self, _slot: Slot) -> PoolResult<()> {
        self.live.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }
}

fn pool(max_total: usize) -> (Arc<Slots>, Arc<dyn ObjectPool<u32, Slot>>) {
    let slots = Arc::new(Slots::default());
    let config = PoolConfiguration::new()
        .with_max_total(max_total)
        .without_eviction();
    let pool = create_object_pool::<u32, Slot>(slots.clone(), config).unwrap();
    (slots, Arc::from(pool))
}

#[test]
fn live_objects_never_exceed_max_total() {
    let (slots, pool) = pool(4);

    let workers: Vec<_> = (0..16u32)
        .map(|worker| {
            let pool = Arc::clone(&pool);
            thread::spawn(move || {
                for round in 0..200u32 {
                    let mut slot = if round % 10 == 0 {
                        pool.borrow_primary_object().unwrap()
                    } else {
                        pool.borrow_object(&((worker + round) % 5)).unwrap()
                    };
                    slot.key = Some(worker % 5);
                    pool.return_object(slot).unwrap();
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    assert!(slots.peak.load(Ordering::SeqCst) <= 4);
    let metrics = pool.metrics();
    assert_eq!(metrics.borrowed_objects, 0);
    assert_eq!(metrics.total_borrowed, 16 * 200);
    assert_eq!(metrics.total_borrowed, metrics.total_returned);
    pool.close();
    assert_eq!(slots.live.load(Ordering::SeqCst), 0);
}

#[test]
fn returned_object_goes_back_to_its_key() {
    let (_slots, pool) = pool(3);

    let mut first = pool.borrow_object(&1).unwrap();
    let mut second = pool.borrow_object(&2).unwrap();
    first.key = Some(1);
    second.key = Some(2);
    let second_id = second.id;
    pool.return_object(second).unwrap();
    pool.return_object(first).unwrap();

    let again = pool.borrow_object(&2).unwrap();
    assert_eq!(again.id, second_id);
    pool.return_object(again).unwrap();
}

#[test]
fn single_object_pool_serves_every_role() {
    let (slots, pool) = pool(1);

    let slot = pool.borrow_object(&9).unwrap();
    assert!(slot.is_primary());
    pool.return_object(slot).unwrap();
    let slot = pool.borrow_primary_object().unwrap();
    pool.return_object(slot).unwrap();

    assert_eq!(slots.made.load(Ordering::SeqCst), 1);
}

#[test]
fn writer_and_readers_do_not_contend() {
    let (_slots, pool) = pool(2);

    let writer = pool.borrow_primary_object().unwrap();
    let reader = pool
        .borrow_object_timeout(&1, Duration::from_millis(50))
        .unwrap();
    assert!(!reader.is_primary());

    assert_eq!(
        pool.borrow_primary_object_timeout(Duration::from_millis(20))
            .unwrap_err(),
        PoolError::PoolExhausted(Duration::from_millis(20))
    );
    assert_eq!(
        pool.borrow_object_timeout(&1, Duration::from_millis(20))
            .unwrap_err(),
        PoolError::PoolExhausted(Duration::from_millis(20))
    );

    pool.return_object(reader).unwrap();
    pool.return_object(writer).unwrap();
}

#[test]
fn closing_releases_blocked_borrowers() {
    let (slots, pool) = pool(2);
    let held = pool.borrow_object(&1).unwrap();

    let (started, waiting) = channel::bounded(1);
    let blocked = {
        let pool = Arc::clone(&pool);
        thread::spawn(move || {
            started.send(()).unwrap();
            pool.borrow_object(&2)
        })
    };
    waiting.recv().unwrap();
    thread::sleep(Duration::from_millis(20));

    pool.close();
    assert_eq!(blocked.join().unwrap().unwrap_err(), PoolError::PoolClosed);
    assert!(pool.is_closed());

    // Objects coming back after close are destroyed.
    pool.return_object(held).unwrap();
    assert_eq!(slots.live.load(Ordering::SeqCst), 0);
}

#[test]
fn double_return_is_rejected() {
    let (slots, pool) = pool(3);
    let slot = pool.borrow_object(&1).unwrap();
    let other = pool.borrow_object(&2).unwrap();
    let copy = slot.clone();

    pool.return_object(slot).unwrap();
    // Another object is still out, the copy must still be refused.
    assert!(matches!(pool.return_object(copy), Err(PoolError::Misuse(_))));
    pool.return_object(other).unwrap();

    let metrics = pool.metrics();
    assert_eq!(metrics.borrowed_objects, 0);
    assert_eq!(metrics.idle_objects, 2);
    pool.close();
    assert_eq!(slots.live.load(Ordering::SeqCst), 0);
}

#[test]
fn foreign_object_is_rejected_while_own_is_lent() {
    let (slots, pool) = pool(2);
    let own = pool.borrow_object(&1).unwrap();

    let mut foreign = slots.make(false);
    foreign.set_tag(true);
    assert!(matches!(pool.return_object(foreign), Err(PoolError::Misuse(_))));
    slots.live.fetch_sub(1, Ordering::SeqCst);

    pool.return_object(own).unwrap();
    assert_eq!(pool.metrics().idle_objects, 1);
    pool.close();
    assert_eq!(slots.live.load(Ordering::SeqCst), 0);
}

#[test]
fn lease_returns_on_drop() {
    let (_slots, pool) = pool(3);
    {
        let mut lease = Lease::new(&*pool, pool.borrow_object(&4).unwrap());
        lease.key = Some(4);
        assert_eq!(pool.metrics().borrowed_objects, 1);
    }
    assert_eq!(pool.metrics().borrowed_objects, 0);

    let lease = Lease::new(&*pool, pool.borrow_primary_object().unwrap());
    lease.release().unwrap();
    assert_eq!(pool.metrics().borrowed_objects, 0);
}
