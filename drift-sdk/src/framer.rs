//! Line framing for the inbound byte stream.
//!
//! Bytes arrive in arbitrary chunks; a line ends at LF with an optional
//! preceding CR. Invalid UTF-8 is decoded lossily so a single bad byte never
//! stalls the connection.

/// Upper bound for one line including IRCv3 tags (8191 tag bytes + 512).
pub const MAX_LINE_BYTES: usize = 8191 + 512;

#[derive(Debug, Default)]
pub struct LineFramer {
    buf: Vec<u8>,
    /// Set while skipping the remainder of an oversized line.
    discarding: bool,
}

impl LineFramer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `bytes` and return every complete, non-empty line.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for chunk in bytes.split_inclusive(|&b| b == b'\n') {
            let complete = chunk.last() == Some(&b'\n');
            if self.discarding {
                if complete {
                    self.discarding = false;
                }
                continue;
            }
            self.buf.extend_from_slice(chunk);
            if complete {
                let mut line = std::mem::take(&mut self.buf);
                line.pop();
                if line.last() == Some(&b'\r') {
                    line.pop();
                }
                if line.len() > MAX_LINE_BYTES {
                    tracing::warn!(len = line.len(), "Discarding oversized line");
                } else if !line.is_empty() {
                    lines.push(String::from_utf8_lossy(&line).into_owned());
                }
            } else if self.buf.len() > MAX_LINE_BYTES {
                tracing::warn!(len = self.buf.len(), "Discarding oversized line");
                self.buf.clear();
                self.discarding = true;
            }
        }
        lines
    }

    /// Bytes buffered towards an incomplete line.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_crlf_and_bare_lf() {
        let mut f = LineFramer::new();
        let lines = f.push(b"PING :a\r\nPING :b\nPART #x\r\n");
        assert_eq!(lines, vec!["PING :a", "PING :b", "PART #x"]);
        assert_eq!(f.pending(), 0);
    }

    #[test]
    fn reassembles_across_chunks() {
        let mut f = LineFramer::new();
        assert!(f.push(b":srv 001 al").is_empty());
        assert!(f.push(b"ice :Welc").is_empty());
        assert_eq!(f.push(b"ome\r"), Vec::<String>::new());
        assert_eq!(f.push(b"\nPI"), vec![":srv 001 alice :Welcome"]);
        assert_eq!(f.pending(), 2);
    }

    #[test]
    fn skips_empty_lines() {
        let mut f = LineFramer::new();
        assert_eq!(f.push(b"\r\n\r\nPING x\r\n"), vec!["PING x"]);
    }

    #[test]
    fn invalid_utf8_is_lossy() {
        let mut f = LineFramer::new();
        let lines = f.push(b"PRIVMSG #c :caf\xe9\r\n");
        assert_eq!(lines.len(), 1);
        assert!(lines[0].starts_with("PRIVMSG #c :caf"));
    }

    #[test]
    fn oversized_line_is_dropped_and_stream_recovers() {
        let mut f = LineFramer::new();
        let junk = vec![b'a'; MAX_LINE_BYTES + 10];
        assert!(f.push(&junk).is_empty());
        assert!(f.push(b"more junk\r\n").is_empty());
        assert_eq!(f.push(b"PING ok\r\n"), vec!["PING ok"]);
    }

    #[test]
    fn oversized_complete_line_in_one_read_is_dropped() {
        let mut f = LineFramer::new();
        let mut bytes = b"PING before\r\n".to_vec();
        bytes.extend(std::iter::repeat_n(b'a', MAX_LINE_BYTES + 1));
        bytes.extend_from_slice(b"\r\nPING after\r\n");
        assert_eq!(f.push(&bytes), vec!["PING before", "PING after"]);

        let exact = vec![b'b'; MAX_LINE_BYTES];
        let mut line = exact.clone();
        line.extend_from_slice(b"\r\n");
        assert_eq!(f.push(&line), vec![String::from_utf8(exact).unwrap()]);
    }
}
