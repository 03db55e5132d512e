//! Ordered log of dirty pages.

use std::collections::VecDeque;

use owfs_common::PageNumber;

/// Dirty pages, newest at the front and oldest at the back.
///
/// A page appears at most once; re-recording a page promotes it to the
/// front.
#[derive(Debug, Default)]
pub(crate) struct WriteLog {
    pages: VecDeque<PageNumber>,
}

impl WriteLog {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            pages: VecDeque::with_capacity(capacity),
        }
    }

    /// Records a write, moving the page to the front.
    pub fn record(&mut self, page: PageNumber) {
        self.remove(page);
        self.pages.push_front(page);
    }

    /// Queues a page to be flushed before every page already logged.
    pub fn push_oldest(&mut self, page: PageNumber) {
        self.remove(page);
        self.pages.push_back(page);
    }

    /// Returns the oldest entry.
    pub fn oldest(&self) -> Option<PageNumber> {
        self.pages.back().copied()
    }

    /// Removes the oldest entry.
    pub fn pop_oldest(&mut self) -> Option<PageNumber> {
        self.pages.pop_back()
    }

    pub fn remove(&mut self, page: PageNumber) {
        self.pages.retain(|&p| p != page);
    }

    pub fn contains(&self, page: PageNumber) -> bool {
        self.pages.contains(&page)
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(n: usize) -> PageNumber {
        PageNumber::new(n)
    }

    #[test]
    fn test_oldest_first() {
        let mut log = WriteLog::default();
        log.record(p(1));
        log.record(p(2));
        log.record(p(3));
        assert_eq!(log.pop_oldest(), Some(p(1)));
        assert_eq!(log.pop_oldest(), Some(p(2)));
        assert_eq!(log.pop_oldest(), Some(p(3)));
        assert!(log.is_empty());
    }

    #[test]
    fn test_rewrite_promotes_without_duplicating() {
        let mut log = WriteLog::with_capacity(4);
        log.record(p(1));
        log.record(p(2));
        log.record(p(1));
        assert_eq!(log.len(), 2);
        assert_eq!(log.oldest(), Some(p(2)));
    }

    #[test]
    fn test_push_oldest() {
        let mut log = WriteLog::default();
        log.record(p(4));
        log.record(p(5));
        log.push_oldest(p(9));
        assert_eq!(log.oldest(), Some(p(9)));
        assert!(log.contains(p(5)));

        log.remove(p(5));
        assert!(!log.contains(p(5)));
        assert_eq!(log.len(), 2);
    }
}
