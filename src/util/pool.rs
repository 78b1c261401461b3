use parking_lot::Mutex;

/// Most lists a pool keeps around; extra returns are dropped.
pub const MAX_POOLED_LISTS: usize = 1024;

/// Scratch-list pool shared by session workers.
///
/// Sent-entity lists are produced every tick for every session and live for
/// up to `dirty_buffer_size` ticks, so recycling them avoids steady churn.
#[derive(Debug)]
pub struct ListPool<T> {
    lists: Mutex<Vec<Vec<T>>>,
    initial_capacity: usize,
}

impl<T> ListPool<T> {
    pub fn new(initial_capacity: usize) -> Self {
        Self {
            lists: Mutex::new(Vec::new()),
            initial_capacity,
        }
    }

    /// Take an empty list
    pub fn take(&self) -> Vec<T> {
        self.lists
            .lock()
            .pop()
            .unwrap_or_else(|| Vec::with_capacity(self.initial_capacity))
    }

    /// Return a list. It is cleared before reuse.
    pub fn give(&self, mut list: Vec<T>) {
        list.clear();
        let mut lists = self.lists.lock();
        if lists.len() < MAX_POOLED_LISTS {
            lists.push(list);
        }
    }

    pub fn pooled(&self) -> usize {
        self.lists.lock().len()
    }
}

impl<T> Default for ListPool<T> {
    fn default() -> Self {
        Self::new(256)
    }
}
