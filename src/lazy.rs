use std::sync::{Arc, Mutex};

/// A value computed at most once until released. Concurrent callers block
/// on the first computation and share its result; a failed computation
/// leaves the cell empty so the next caller retries.
#[derive(Debug)]
pub struct Memo<T> {
    slot: Mutex<Option<Arc<T>>>,
}

impl<T> Default for Memo<T> {
    fn default() -> Self {
        Self {
            slot: Mutex::new(None),
        }
    }
}

impl<T> Memo<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_try_init<E>(&self, init: impl FnOnce() -> Result<T, E>) -> Result<Arc<T>, E> {
        let mut slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(value) = slot.as_ref() {
            return Ok(Arc::clone(value));
        }
        let value = Arc::new(init()?);
        *slot = Some(Arc::clone(&value));
        Ok(value)
    }

    pub fn get(&self) -> Option<Arc<T>> {
        self.slot.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn is_set(&self) -> bool {
        self.slot.lock().unwrap_or_else(|e| e.into_inner()).is_some()
    }

    /// Drops the held value; the next `get_or_try_init` recomputes.
    pub fn release(&self) -> Option<Arc<T>> {
        self.slot.lock().unwrap_or_else(|e| e.into_inner()).take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn computes_once_until_released() {
        let memo: Memo<String> = Memo::new();
        let calls = AtomicUsize::new(0);
        let init = || -> Result<String, ()> {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok("value".to_string())
        };

        let a = memo.get_or_try_init(init).unwrap();
        let b = memo.get_or_try_init(init).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        assert!(memo.release().is_some());
        assert!(!memo.is_set());
        memo.get_or_try_init(init).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn failure_leaves_cell_empty() {
        let memo: Memo<u32> = Memo::new();
        assert_eq!(memo.get_or_try_init(|| Err("boom")), Err("boom"));
        assert!(memo.get().is_none());
        assert_eq!(*memo.get_or_try_init(|| Ok::<_, &str>(7)).unwrap(), 7);
    }

    #[test]
    fn racing_callers_share_one_value() {
        let memo: Arc<Memo<usize>> = Arc::new(Memo::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let memo = Arc::clone(&memo);
                let calls = Arc::clone(&calls);
                std::thread::spawn(move || {
                    *memo
                        .get_or_try_init(|| Ok::<_, ()>(calls.fetch_add(1, Ordering::SeqCst)))
                        .unwrap()
                })
            })
            .collect();
        let values: Vec<usize> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(values.iter().all(|v| *v == 0));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
