//! Fixed-shape record pools
//!
//! A [`Pool`] is a growable array of slots plus a free list. Entries are
//! addressed by slot index, which becomes the offset half of an
//! [`Address`](super::value::Address) into the owning segment. Freed slots are
//! reused before the array grows.

/// Largest slot index an address offset can name
pub const MAX_POOL_ENTRIES: usize = u16::MAX as usize + 1;

#[derive(Debug, Clone)]
pub struct Pool<T> {
    entries: Vec<Option<T>>,
    free_list: Vec<usize>,
    used: usize,
}

impl<T> Pool<T> {
    pub fn new() -> Self {
        Pool {
            entries: Vec::new(),
            free_list: Vec::new(),
            used: 0,
        }
    }

    /// Store `value` in a free slot, returning its index
    ///
    /// Returns `None` once every addressable slot is taken.
    pub fn alloc(&mut self, value: T) -> Option<usize> {
        let index = match self.free_list.pop() {
            Some(index) => index,
            None => {
                if self.entries.len() >= MAX_POOL_ENTRIES {
                    return None;
                }
                self.entries.push(None);
                self.entries.len() - 1
            }
        };
        self.entries[index] = Some(value);
        self.used += 1;
        Some(index)
    }

    /// Release a slot, returning what it held
    pub fn free(&mut self, index: usize) -> Option<T> {
        let value = self.entries.get_mut(index)?.take()?;
        self.free_list.push(index);
        self.used -= 1;
        Some(value)
    }

    pub fn is_valid(&self, index: usize) -> bool {
        matches!(self.entries.get(index), Some(Some(_)))
    }

    pub fn get(&self, index: usize) -> Option<&T> {
        self.entries.get(index)?.as_ref()
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut T> {
        self.entries.get_mut(index)?.as_mut()
    }

    /// Number of live entries
    pub fn len(&self) -> usize {
        self.used
    }

    pub fn is_empty(&self) -> bool {
        self.used == 0
    }

    /// Number of slots, live or free
    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    /// Iterate live entries with their slot index
    pub fn iter(&self) -> impl Iterator<Item = (usize, &T)> {
        self.entries
            .iter()
            .enumerate()
            .filter_map(|(i, e)| e.as_ref().map(|v| (i, v)))
    }

    /// Indices of all live entries
    pub fn live_indices(&self) -> Vec<usize> {
        self.iter().map(|(i, _)| i).collect()
    }
}

impl<T> Default for Pool<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_reuses_freed_slots() {
        let mut pool = Pool::new();
        let a = pool.alloc(1).unwrap();
        let b = pool.alloc(2).unwrap();
        assert_eq!((a, b), (0, 1));

        assert_eq!(pool.free(a), Some(1));
        assert!(!pool.is_valid(a));
        assert_eq!(pool.len(), 1);

        let c = pool.alloc(3).unwrap();
        assert_eq!(c, a);
        assert_eq!(pool.get(c), Some(&3));
        assert_eq!(pool.capacity(), 2);
    }

    #[test]
    fn test_double_free_is_none() {
        let mut pool = Pool::new();
        let a = pool.alloc("x").unwrap();
        assert!(pool.free(a).is_some());
        assert!(pool.free(a).is_none());
        assert!(pool.free(99).is_none());
    }

    #[test]
    fn test_iter_skips_free_slots() {
        let mut pool = Pool::new();
        for i in 0..4 {
            pool.alloc(i * 10);
        }
        pool.free(1);
        pool.free(2);
        assert_eq!(pool.live_indices(), vec![0, 3]);
    }
}
