//! Shared ACL transmit buffer pool ([Vol 4] Part E, Section 4.1.1).

use std::fmt::{Debug, Formatter};
use std::mem;
use std::sync::Arc;

use structbuf::StructBuf;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::SyncMutex;

/// Fixed-size pool of reusable ACL transmit buffers. Capacity equals the
/// controller's ACL buffer count, so taking one lease per submitted packet
/// and releasing it on acknowledgment keeps the controller's buffers from
/// overflowing.
pub(crate) struct Pool {
    sem: Arc<Semaphore>,
    bufs: SyncMutex<Vec<StructBuf>>,
    size: usize,
}

impl Pool {
    /// Creates a pool of `count` buffers of `size` bytes each.
    pub fn new(size: usize, count: usize) -> Arc<Self> {
        Arc::new(Self {
            sem: Arc::new(Semaphore::new(count)),
            bufs: SyncMutex::new(Vec::with_capacity(count)),
            size,
        })
    }

    /// Borrows one transmit buffer, waiting for the controller to drain a
    /// packet when all buffers are in use.
    pub async fn lease(self: &Arc<Self>) -> Lease {
        let permit = (Arc::clone(&self.sem).acquire_owned().await).expect("buffer pool closed");
        let buf = (self.bufs.lock().pop()).unwrap_or_else(|| StructBuf::new(self.size));
        Lease {
            buf,
            pool: Arc::clone(self),
            _permit: permit,
        }
    }
}

impl Debug for Pool {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        (f.debug_struct("Pool"))
            .field("size", &self.size)
            .field("available", &self.sem.available_permits())
            .finish()
    }
}

/// Exclusive loan of one pool buffer. Dropping the lease returns the buffer
/// and its credit to the pool on every exit path.
#[derive(Debug)]
pub(crate) struct Lease {
    buf: StructBuf,
    pool: Arc<Pool>,
    _permit: OwnedSemaphorePermit,
}

impl Lease {
    /// Returns the leased buffer.
    #[inline]
    pub fn buf(&mut self) -> &mut StructBuf {
        &mut self.buf
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        let mut buf = mem::take(&mut self.buf);
        buf.clear();
        self.pool.bufs.lock().push(buf);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn conservation() {
        let pool = Pool::new(31, 2);
        let a = pool.lease().await;
        let _b = pool.lease().await;
        // All buffers in use; the next lease must wait
        let waited = tokio::time::timeout(Duration::from_millis(20), pool.lease()).await;
        assert!(waited.is_err());
        drop(a);
        let _c = tokio::time::timeout(Duration::from_millis(20), pool.lease())
            .await
            .expect("freed buffer not reusable");
    }
}
