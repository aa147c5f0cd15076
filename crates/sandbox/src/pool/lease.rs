use std::sync::Arc;

use super::PoolManager;

/// Exclusive borrow of one pooled container.
///
/// Dropping the lease releases the container, so every exit path of the
/// borrower (early return, error, cancellation, panic) gives it back. A lease
/// dropped without [`release`](Self::release) may have left a program running
/// in the container, so it comes back tainted and gets replaced once idle.
#[must_use = "dropping a lease releases the container as tainted"]
pub struct Lease {
    pool: Arc<PoolManager>,
    id: String,
    image: String,
    released: bool,
}

impl Lease {
    pub(super) fn new(pool: Arc<PoolManager>, id: String, image: String) -> Self {
        Self {
            pool,
            id,
            image,
            released: false,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn image(&self) -> &str {
        &self.image
    }

    /// Flag the container as possibly dirty (e.g. killed at a deadline).
    /// It stays usable; the next health tick replaces it once idle.
    pub fn mark_tainted(&self) {
        self.pool.mark_tainted(&self.id);
    }

    pub fn release(mut self) {
        self.release_once();
    }

    fn release_once(&mut self) {
        if !self.released {
            self.released = true;
            self.pool.release_entry(&self.id);
        }
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if !self.released {
            self.mark_tainted();
        }
        self.release_once();
    }
}

impl std::fmt::Debug for Lease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease")
            .field("id", &self.id)
            .field("image", &self.image)
            .field("released", &self.released)
            .finish()
    }
}
