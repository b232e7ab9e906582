//! Checkout/return object pools for the response hot path.
//!
//! A [`Pooled`] guard owns its object exclusively until dropped, so an object
//! can never be shared by two open response bodies.

use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, OnceLock};

/// Objects that can be returned to a pool
pub trait Reset {
    /// Clear per-use state before the object is handed out again
    fn reset(&mut self);
}

impl Reset for Vec<u8> {
    fn reset(&mut self) {
        self.clear();
    }
}

struct Shared<T> {
    free: Mutex<Vec<T>>,
    max_idle: usize,
}

/// Mutex-guarded free-list of reusable objects
pub struct Pool<T> {
    shared: Arc<Shared<T>>,
    make: fn() -> T,
}

impl<T: Reset> Pool<T> {
    /// Create a pool that builds new objects with `make` and keeps at most
    /// `max_idle` returned objects
    pub fn new(make: fn() -> T, max_idle: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                free: Mutex::new(Vec::new()),
                max_idle,
            }),
            make,
        }
    }

    /// Take an object out of the pool, building one when the pool is empty
    pub fn checkout(&self) -> Pooled<T> {
        let recycled = self.shared.free.lock().ok().and_then(|mut free| free.pop());
        let value = recycled.unwrap_or_else(self.make);
        Pooled {
            value: Some(value),
            shared: Arc::clone(&self.shared),
        }
    }

    /// Number of idle objects
    pub fn idle(&self) -> usize {
        self.shared.free.lock().map(|free| free.len()).unwrap_or(0)
    }
}

impl<T> Clone for Pool<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            make: self.make,
        }
    }
}

/// An object checked out of a [`Pool`]; reset and returned on drop
pub struct Pooled<T: Reset> {
    value: Option<T>,
    shared: Arc<Shared<T>>,
}

impl<T: Reset> Pooled<T> {
    /// Keep the object instead of returning it to the pool
    pub fn detach(mut self) -> T {
        // `value` is only None after drop or detach
        self.value.take().unwrap_or_else(|| unreachable!())
    }
}

impl<T: Reset> Deref for Pooled<T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.value.as_ref().unwrap_or_else(|| unreachable!())
    }
}

impl<T: Reset> DerefMut for Pooled<T> {
    fn deref_mut(&mut self) -> &mut T {
        self.value.as_mut().unwrap_or_else(|| unreachable!())
    }
}

impl<T: Reset> Drop for Pooled<T> {
    fn drop(&mut self) {
        if let Some(mut value) = self.value.take() {
            value.reset();
            if let Ok(mut free) = self.shared.free.lock() {
                if free.len() < self.shared.max_idle {
                    free.push(value);
                }
            }
        }
    }
}

impl<T: Reset + std::fmt::Debug> std::fmt::Debug for Pooled<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Pooled").field(&self.value).finish()
    }
}

/// Capacity given to fresh read buffers
pub const READ_BUFFER_CAPACITY: usize = 64 * 1024;

/// Buffers larger than this are dropped instead of pooled
const MAX_POOLED_BUFFER: usize = 1024 * 1024;

/// Read buffer that releases oversized allocations on reset
#[derive(Debug)]
pub struct ReadBuffer(pub Vec<u8>);

impl Reset for ReadBuffer {
    fn reset(&mut self) {
        self.0.clear();
        if self.0.capacity() > MAX_POOLED_BUFFER {
            self.0 = Vec::with_capacity(READ_BUFFER_CAPACITY);
        }
    }
}

/// Process-wide pool of response read buffers
pub fn buffer_pool() -> &'static Pool<ReadBuffer> {
    static POOL: OnceLock<Pool<ReadBuffer>> = OnceLock::new();
    POOL.get_or_init(|| Pool::new(|| ReadBuffer(Vec::with_capacity(READ_BUFFER_CAPACITY)), 64))
}
