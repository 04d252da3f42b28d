use std::fmt;
use std::sync::atomic::{AtomicIsize, Ordering};

use serde::ser::{SerializeStruct, Serializer};
use serde::Serialize;
use serde_json::json;

/// A gauge that remembers its high-water mark.
#[derive(Default)]
pub struct Counter {
    current: AtomicIsize,
    max: AtomicIsize,
}

impl Counter {
    #[inline]
    pub fn new() -> Self {
        Counter::default()
    }

    #[inline]
    pub fn inc(&self) {
        self.incs(1);
    }

    #[inline]
    pub fn incs(&self, c: isize) {
        let prev = self.current.fetch_add(c, Ordering::SeqCst);
        self.max.fetch_max(prev + c, Ordering::SeqCst);
    }

    #[inline]
    pub fn dec(&self) {
        self.decs(1)
    }

    #[inline]
    pub fn decs(&self, c: isize) {
        self.current.fetch_sub(c, Ordering::SeqCst);
    }

    /// Overwrites the current value, raising the max if needed.
    #[inline]
    pub fn sets(&self, c: isize) {
        self.current.store(c, Ordering::SeqCst);
        self.max.fetch_max(c, Ordering::SeqCst);
    }

    #[inline]
    pub fn count(&self) -> isize {
        self.current.load(Ordering::SeqCst)
    }

    #[inline]
    pub fn max(&self) -> isize {
        self.max.load(Ordering::SeqCst)
    }

    #[inline]
    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "count": self.count(),
            "max": self.max()
        })
    }
}

impl Clone for Counter {
    fn clone(&self) -> Self {
        Counter { current: AtomicIsize::new(self.count()), max: AtomicIsize::new(self.max()) }
    }
}

impl fmt::Debug for Counter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, r#"{{ "count":{}, "max":{} }}"#, self.count(), self.max())
    }
}

impl Serialize for Counter {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut s = serializer.serialize_struct("Counter", 2)?;
        s.serialize_field("count", &self.count())?;
        s.serialize_field("max", &self.max())?;
        s.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter() {
        let c = Counter::new();
        c.inc();
        c.incs(4);
        c.dec();
        assert_eq!(c.count(), 4);
        assert_eq!(c.max(), 5);

        c.sets(2);
        assert_eq!(c.count(), 2);
        assert_eq!(c.max(), 5);
        c.sets(9);
        assert_eq!(c.max(), 9);

        let snapshot = c.clone();
        c.decs(9);
        assert_eq!(snapshot.count(), 9);
        assert_eq!(c.to_json(), json!({"count": 0, "max": 9}));
    }
}
