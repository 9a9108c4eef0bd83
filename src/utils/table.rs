use crate::error::{Error, Result};
use crate::reactor::io::FdContext;

use parking_lot::RwLock;
use std::os::unix::io::RawFd;
use std::sync::Arc;

/// Descriptor-indexed table of registration records.
///
/// Slots are filled lazily on first registration and kept afterwards, even
/// once every event on the descriptor is cancelled. The backing vector
/// doubles until an fd landing past its end fits.
pub(crate) struct FdTable {
    slots: RwLock<Vec<Option<Arc<FdContext>>>>,
}

impl FdTable {
    pub(crate) fn new(capacity: usize) -> Self {
        let slots = (0..capacity.max(1)).map(|_| None).collect();

        Self {
            slots: RwLock::new(slots),
        }
    }

    /// Record for `fd`, if one was ever created.
    pub(crate) fn get(&self, fd: RawFd) -> Option<Arc<FdContext>> {
        let index = usize::try_from(fd).ok()?;

        self.slots.read().get(index)?.clone()
    }

    /// Record for `fd`, creating it (and growing the table) on first use.
    pub(crate) fn get_or_insert(&self, fd: RawFd) -> Result<Arc<FdContext>> {
        let index =
            usize::try_from(fd).map_err(|_| Error::InvalidArgument("negative file descriptor"))?;

        if let Some(context) = self.get(fd) {
            return Ok(context);
        }

        let mut slots = self.slots.write();

        if index >= slots.len() {
            let mut new_len = slots.len().max(1);
            while new_len <= index {
                new_len = new_len
                    .checked_mul(2)
                    .ok_or(Error::ResourceExhausted("fd table"))?;
            }

            let additional = new_len - slots.len();
            slots
                .try_reserve(additional)
                .map_err(|_| Error::ResourceExhausted("fd table"))?;
            slots.resize_with(new_len, || None);
        }

        // Another thread may have filled the slot between the two locks.
        let context = slots[index].get_or_insert_with(|| Arc::new(FdContext::new(fd)));

        Ok(Arc::clone(context))
    }

    /// Empties every slot and hands the records back, so their follow-ups
    /// can be dropped outside the table lock.
    pub(crate) fn drain(&self) -> Vec<Arc<FdContext>> {
        self.slots
            .write()
            .iter_mut()
            .filter_map(Option::take)
            .collect()
    }
}
