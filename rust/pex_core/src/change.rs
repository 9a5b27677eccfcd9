//! Before/after pair emitted by every update.

/// Result of one update: the value replaced and the value now current.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change<T> {
    pub old: T,
    pub current: T,
}

impl<T> Change<T> {
    pub fn new(old: T, current: T) -> Self {
        Self { old, current }
    }

    /// Map both sides, e.g. to project a view out of a data change.
    pub fn map<U>(self, mut f: impl FnMut(T) -> U) -> Change<U> {
        Change {
            old: f(self.old),
            current: f(self.current),
        }
    }
}

impl<T: PartialEq> Change<T> {
    /// Whether the update altered anything.
    pub fn changed(&self) -> bool {
        self.old != self.current
    }
}
