use std::ops::{Deref, DerefMut};
use std::sync::Mutex;

/// Free list of heap allocated scratch records.
///
/// Records are fully overwritten on every [`ObjectPool::acquire`], so what a
/// previous user left behind is never observable.
pub struct ObjectPool<T> {
    free: Mutex<Vec<Box<T>>>,
    capacity: usize,
}

impl<T> ObjectPool<T> {
    /// `capacity` bounds how many idle records are kept around.
    pub fn new(capacity: usize) -> Self {
        Self {
            free: Mutex::new(Vec::with_capacity(capacity)),
            capacity,
        }
    }

    pub fn acquire(&self, value: T) -> Pooled<'_, T> {
        let recycled = self.free.lock().unwrap_or_else(|e| e.into_inner()).pop();
        let item = match recycled {
            Some(mut item) => {
                *item = value;
                item
            }
            None => Box::new(value),
        };

        Pooled {
            pool: self,
            item: Some(item),
        }
    }

    pub fn idle(&self) -> usize {
        self.free.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn release(&self, item: Box<T>) {
        let mut free = self.free.lock().unwrap_or_else(|e| e.into_inner());
        if free.len() < self.capacity {
            free.push(item);
        }
    }
}

/// A record borrowed from an [`ObjectPool`], returned to it on drop.
pub struct Pooled<'a, T> {
    pool: &'a ObjectPool<T>,
    item: Option<Box<T>>,
}

impl<T> Deref for Pooled<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Only taken in drop.
        self.item.as_deref().unwrap_or_else(|| unreachable!())
    }
}

impl<T> DerefMut for Pooled<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.item.as_deref_mut().unwrap_or_else(|| unreachable!())
    }
}

impl<T> Drop for Pooled<'_, T> {
    fn drop(&mut self) {
        if let Some(item) = self.item.take() {
            self.pool.release(item);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_records_are_recycled() {
        let pool = ObjectPool::new(2);
        {
            let a = pool.acquire(1_u64);
            let b = pool.acquire(2_u64);
            assert_eq!(*a + *b, 3);
            assert_eq!(pool.idle(), 0);
        }
        assert_eq!(pool.idle(), 2);

        let c = pool.acquire(7_u64);
        assert_eq!(*c, 7);
        assert_eq!(pool.idle(), 1);
    }

    #[test]
    fn test_capacity_bounds_idle_records() {
        let pool = ObjectPool::new(1);
        let a = pool.acquire([0_u8; 16]);
        let b = pool.acquire([1_u8; 16]);
        drop(a);
        drop(b);
        assert_eq!(pool.idle(), 1);
    }

    #[test]
    fn test_reuse_reinitialises() {
        let pool = ObjectPool::new(1);
        {
            let mut a = pool.acquire((1_u32, 2_u32));
            a.0 = 100;
        }
        let b = pool.acquire((3_u32, 4_u32));
        assert_eq!(*b, (3, 4));
    }
}
