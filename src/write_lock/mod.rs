//! System-wide exclusive write lock
//!
//! Holders are identified by the value [`ClientRegistry::get_write_client`]
//! returns, normally the session id of the client process, so threads and
//! children of one session do not compete with each other.
//!
//! [`ClientRegistry::get_write_client`]: crate::registry::ClientRegistry::get_write_client

/// At most one write-mode client at a time
#[derive(Debug, Default)]
pub struct WriteLock {
    holder: Option<i32>,
}

impl WriteLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the lock for `holder` if it is free.
    ///
    /// Returns the holder after the call. A result different from `holder`
    /// means someone else owns the lock and nothing changed.
    pub fn try_lock(&mut self, holder: i32) -> i32 {
        match self.holder {
            Some(existing) => existing,
            None => {
                tracing::debug!("Write lock acquired by {}", holder);
                self.holder = Some(holder);
                holder
            }
        }
    }

    /// Release the lock regardless of who holds it
    pub fn unlock(&mut self) {
        if let Some(holder) = self.holder.take() {
            tracing::debug!("Write lock released by {}", holder);
        }
    }

    pub fn holder(&self) -> Option<i32> {
        self.holder
    }

    pub fn is_locked(&self) -> bool {
        self.holder.is_some()
    }
}
