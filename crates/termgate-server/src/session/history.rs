//! Rolling output history for replay on reattach.
//!
//! Holds the newest shell output as text. When the buffer grows past its cap
//! it drops the oldest bytes down to the trim size, so a reconnecting client
//! gets a recent scrollback without unbounded memory.

#[derive(Debug)]
pub struct HistoryBuffer {
    buf: String,
    cap: usize,
    trim_to: usize,
}

impl HistoryBuffer {
    /// `trim_to` is clamped to `cap`.
    pub fn new(cap: usize, trim_to: usize) -> Self {
        Self {
            buf: String::new(),
            cap,
            trim_to: trim_to.min(cap),
        }
    }

    pub fn push(&mut self, text: &str) {
        self.buf.push_str(text);
        if self.buf.len() > self.cap {
            let mut cut = self.buf.len() - self.trim_to;
            while !self.buf.is_char_boundary(cut) {
                cut += 1;
            }
            self.buf.drain(..cut);
        }
    }

    pub fn as_str(&self) -> &str {
        &self.buf
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_everything_under_cap() {
        let mut h = HistoryBuffer::new(10, 8);
        h.push("hello");
        h.push("abc");
        assert_eq!(h.as_str(), "helloabc");
    }

    #[test]
    fn trims_to_newest_bytes_past_cap() {
        let mut h = HistoryBuffer::new(10, 8);
        h.push("0123456789");
        assert_eq!(h.len(), 10);
        h.push("AB");
        assert_eq!(h.as_str(), "456789AB");
    }

    #[test]
    fn trim_respects_char_boundaries() {
        let mut h = HistoryBuffer::new(6, 4);
        h.push("ab\u{e9}\u{e9}\u{e9}");
        // 8 bytes; cutting at byte 4 would split an é
        assert!(h.len() <= 4);
        assert!(h.as_str().ends_with('\u{e9}'));
    }

    #[test]
    fn reference_sizes() {
        let mut h = HistoryBuffer::new(100 * 1024, 80 * 1024);
        let chunk = "x".repeat(1024);
        for _ in 0..101 {
            h.push(&chunk);
        }
        assert_eq!(h.len(), 80 * 1024);
    }

    #[test]
    fn zero_capacity() {
        let mut h = HistoryBuffer::new(0, 0);
        h.push("test");
        assert!(h.is_empty());
    }
}
