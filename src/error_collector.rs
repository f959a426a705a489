/// Ordered set of non-fatal problems, each message stored once with a numeric id.
///
/// ```rust
/// use edfplus_engine::ErrorCollector;
///
/// let mut errors = ErrorCollector::new();
/// assert!(!errors.is_signaled());
///
/// errors.add("Annotation blocks are not in chronological order", 5);
/// errors.add("Annotation blocks are not in chronological order", 5);
/// assert!(errors.is_signaled());
/// assert_eq!(errors.len(), 1);
/// assert!(errors.contains_id(5));
/// assert!(errors.contains_id_range(1, 10));
/// ```
#[derive(Debug, Clone, Default)]
pub struct ErrorCollector {
    entries: Vec<(String, i32)>,
}

impl ErrorCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `message`; a message already present keeps its first id.
    pub fn add(&mut self, message: impl Into<String>, id: i32) {
        let message = message.into();
        if !self.entries.iter().any(|(existing, _)| *existing == message) {
            self.entries.push((message, id));
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn is_signaled(&self) -> bool {
        !self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains_id(&self, id: i32) -> bool {
        self.entries.iter().any(|(_, entry_id)| *entry_id == id)
    }

    /// Whether any entry id lies in `min..=max`.
    pub fn contains_id_range(&self, min: i32, max: i32) -> bool {
        self.entries.iter().any(|(_, id)| (min..=max).contains(id))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, i32)> {
        self.entries.iter().map(|(message, id)| (message.as_str(), *id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insertion_order_and_clear() {
        let mut errors = ErrorCollector::new();
        errors.add("second", 2);
        errors.add("first", 1);
        errors.add("second", 7);

        let collected: Vec<_> = errors.iter().collect();
        assert_eq!(collected, vec![("second", 2), ("first", 1)]);
        assert!(!errors.contains_id(7));
        assert!(!errors.contains_id_range(3, 6));

        errors.clear();
        assert!(!errors.is_signaled());
    }
}
