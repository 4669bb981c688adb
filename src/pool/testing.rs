use super::{PooledResource, ResourceFactory};
use crate::errors::{PoolError, PoolResult};

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// A pooled object that can be cloned to fake double returns
#[derive(Debug, Clone)]
pub(crate) struct TestObject {
    pub id: usize,
    pub primary: bool,
    pub key: Option<u32>,
    pub tag: bool,
    pub loan: u64,
    pub memory_releases: usize,
}

impl PooledResource<u32> for TestObject {
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
        self.memory_releases += 1;
    }
}

#[derive(Default)]
pub(crate) struct TestFactory {
    made: AtomicUsize,
    destroyed: AtomicUsize,
    closed: AtomicUsize,
    failing: AtomicBool,
}

impl TestFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn made(&self) -> usize {
        self.made.load(Ordering::SeqCst)
    }

    pub fn destroyed(&self) -> usize {
        self.destroyed.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn live(&self) -> usize {
        self.made() - self.destroyed()
    }

    pub fn fail(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn make(&self, primary: bool) -> PoolResult<TestObject> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(PoolError::ResourceCreationFailed("factory is failing".into()));
        }
        let id = self.made.fetch_add(1, Ordering::SeqCst);
        Ok(TestObject {
            id,
            primary,
            key: None,
            tag: false,
            loan: 0,
            memory_releases: 0,
        })
    }
}

impl ResourceFactory<TestObject> for TestFactory {
    fn make_object(&self) -> PoolResult<TestObject> {
        self.make(false)
    }

    fn make_primary_object(&self) -> PoolResult<TestObject> {
        self.make(true)
    }

    fn destroy_object(&self, _object: TestObject) -> PoolResult<()> {
        self.destroyed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn close(&self) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}
