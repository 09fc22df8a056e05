//! Write-once cells.

use std::fmt;
use tokio::sync::watch;

/// Returned by [`Ivar::fill`] when the cell already holds a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlreadyFilled;

impl fmt::Display for AlreadyFilled {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ivar already filled")
    }
}

impl std::error::Error for AlreadyFilled {}

/// A cell that is filled at most once and read any number of times.
///
/// Clones share the same cell. Readers that arrive before the fill wait for
/// it; readers that arrive after see the value immediately.
pub struct Ivar<T> {
    slot: watch::Sender<Option<T>>,
}

impl<T> Clone for Ivar<T> {
    fn clone(&self) -> Self {
        Self {
            slot: self.slot.clone(),
        }
    }
}

impl<T: Clone> Ivar<T> {
    pub fn new() -> Self {
        let (slot, _) = watch::channel(None);
        Self { slot }
    }

    /// Stores `value`. Only the first fill succeeds.
    pub fn fill(&self, value: T) -> Result<(), AlreadyFilled> {
        let mut value = Some(value);
        self.slot.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = value.take();
            true
        });
        match value {
            None => Ok(()),
            Some(_) => Err(AlreadyFilled),
        }
    }

    pub fn is_filled(&self) -> bool {
        self.slot.borrow().is_some()
    }

    pub fn try_read(&self) -> Option<T> {
        self.slot.borrow().clone()
    }

    /// Waits until the cell is filled and returns its value.
    pub async fn read(&self) -> T {
        let mut rx = self.slot.subscribe();
        loop {
            if let Some(value) = rx.borrow_and_update().as_ref() {
                return value.clone();
            }
            // The sender lives in `self`, so the channel cannot close.
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

impl<T: Clone> Default for Ivar<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for Ivar<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ivar")
            .field("filled", &self.slot.borrow().is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_second_fill_fails() {
        let ivar = Ivar::new();
        assert!(!ivar.is_filled());
        assert_eq!(ivar.fill(1), Ok(()));
        assert_eq!(ivar.fill(2), Err(AlreadyFilled));
        assert_eq!(ivar.try_read(), Some(1));
    }

    #[tokio::test]
    async fn test_read_after_fill_repeats_value() {
        let ivar = Ivar::new();
        ivar.fill("pong".to_string()).unwrap();
        assert_eq!(ivar.read().await, "pong");
        assert_eq!(ivar.read().await, "pong");
    }

    #[tokio::test]
    async fn test_readers_wait_for_fill() {
        let ivar: Ivar<u32> = Ivar::new();
        let readers: Vec<_> = (0..4)
            .map(|_| {
                let ivar = ivar.clone();
                tokio::spawn(async move { ivar.read().await })
            })
            .collect();

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(readers.iter().all(|r| !r.is_finished()));

        let writer = ivar.clone();
        writer.fill(42).unwrap();
        for reader in readers {
            assert_eq!(reader.await.unwrap(), 42);
        }
    }
}
