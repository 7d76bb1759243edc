//! Eviction ordering for cached files.
//!
//! The cache pops the oldest file first; when two files share a modification
//! time the larger one goes first so an eviction frees more bytes.

use std::cmp::Ordering;
use std::path::PathBuf;
use std::time::SystemTime;

/// One cached regular file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub path: PathBuf,
    pub size: u64,
    pub mod_time: SystemTime,
}

impl Ord for FileEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; reverse the mtime comparison so the
        // oldest entry surfaces first, and prefer larger files on ties.
        other
            .mod_time
            .cmp(&self.mod_time)
            .then_with(|| self.size.cmp(&other.size))
            .then_with(|| self.path.cmp(&other.path))
    }
}

impl PartialOrd for FileEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BinaryHeap;
    use std::time::Duration;

    use super::*;

    fn entry(path: &str, size: u64, mod_time: SystemTime) -> FileEntry {
        FileEntry {
            path: PathBuf::from(path),
            size,
            mod_time,
        }
    }

    #[test]
    fn pops_oldest_first() {
        let now = SystemTime::now();
        let mut heap = BinaryHeap::new();
        heap.push(entry("file1.png", 100, now - Duration::from_secs(3600)));
        heap.push(entry("file2.png", 300, now - Duration::from_secs(3 * 3600)));
        heap.push(entry("file3.png", 200, now - Duration::from_secs(2 * 3600)));

        assert_eq!(heap.len(), 3);
        let order: Vec<_> = std::iter::from_fn(|| heap.pop())
            .map(|e| e.path)
            .collect();
        assert_eq!(
            order,
            [
                PathBuf::from("file2.png"),
                PathBuf::from("file3.png"),
                PathBuf::from("file1.png")
            ]
        );
    }

    #[test]
    fn same_timestamp_pops_largest_first() {
        let now = SystemTime::now();
        let mut heap = BinaryHeap::new();
        heap.push(entry("same1.png", 100, now));
        heap.push(entry("same2.png", 200, now));
        heap.push(entry("same3.png", 300, now));

        let order: Vec<_> = std::iter::from_fn(|| heap.pop())
            .map(|e| e.path)
            .collect();
        assert_eq!(
            order,
            [
                PathBuf::from("same3.png"),
                PathBuf::from("same2.png"),
                PathBuf::from("same1.png")
            ]
        );
    }
}
