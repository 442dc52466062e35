// (c) 2020-2022 ZeroTier, Inc. -- currently propritery pending actual release and licensing. See LICENSE.md.

use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use parking_lot::Mutex;

/// Factory for objects placed in a Pool. Implementors supply fresh instances
/// and reset recycled ones so the pool never hands out stale state.
pub trait PoolFactory<O> {
    fn create(&self) -> O;
    fn reset(&self, obj: &mut O);
}

struct PoolInner<O, F: PoolFactory<O>> {
    factory: F,
    avail: Mutex<Vec<O>>,
    limit: usize,
}

/// A simple bounded object pool, analogous to the packet buffer pool that
/// backs `PacketBuffer` in the network hypervisor core.
pub struct Pool<O, F: PoolFactory<O>>(Arc<PoolInner<O, F>>);

impl<O, F: PoolFactory<O>> Clone for Pool<O, F> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<O, F: PoolFactory<O>> Pool<O, F> {
    pub fn new(limit: usize, factory: F) -> Self {
        Self(Arc::new(PoolInner { factory, avail: Mutex::new(Vec::with_capacity(limit)), limit }))
    }

    /// Get a pooled object, creating a new one if none are available. The
    /// returned guard automatically checks the object back into the pool
    /// (or drops it if the pool is already at capacity) when it is dropped.
    pub fn get(&self) -> Pooled<O, F> {
        let obj = self.0.avail.lock().pop().unwrap_or_else(|| self.0.factory.create());
        Pooled { obj: Some(obj), pool: self.0.clone() }
    }

    pub fn len(&self) -> usize {
        self.0.avail.lock().len()
    }
}

/// An object checked out of a [`Pool`]. Derefs transparently to `O`.
pub struct Pooled<O, F: PoolFactory<O>> {
    obj: Option<O>,
    pool: Arc<PoolInner<O, F>>,
}

impl<O, F: PoolFactory<O>> Deref for Pooled<O, F> {
    type Target = O;
    #[inline(always)]
    fn deref(&self) -> &O {
        self.obj.as_ref().unwrap()
    }
}

impl<O, F: PoolFactory<O>> DerefMut for Pooled<O, F> {
    #[inline(always)]
    fn deref_mut(&mut self) -> &mut O {
        self.obj.as_mut().unwrap()
    }
}

impl<O, F: PoolFactory<O>> Drop for Pooled<O, F> {
    fn drop(&mut self) {
        if let Some(mut obj) = self.obj.take() {
            self.pool.factory.reset(&mut obj);
            let mut avail = self.pool.avail.lock();
            if avail.len() < self.pool.limit {
                avail.push(obj);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct VecFactory;
    impl PoolFactory<Vec<u8>> for VecFactory {
        fn create(&self) -> Vec<u8> {
            Vec::with_capacity(1500)
        }
        fn reset(&self, obj: &mut Vec<u8>) {
            obj.clear();
        }
    }

    #[test]
    fn recycles_objects_instead_of_reallocating() {
        let pool: Pool<Vec<u8>, VecFactory> = Pool::new(4, VecFactory);
        {
            let mut a = pool.get();
            a.extend_from_slice(b"hello");
        }
        assert_eq!(pool.len(), 1);
        let b = pool.get();
        assert!(b.is_empty());
        assert_eq!(pool.len(), 0);
    }

    #[test]
    fn drops_excess_objects_beyond_the_limit() {
        let pool: Pool<Vec<u8>, VecFactory> = Pool::new(1, VecFactory);
        let a = pool.get();
        let b = pool.get();
        drop(a);
        drop(b);
        assert_eq!(pool.len(), 1);
    }
}
