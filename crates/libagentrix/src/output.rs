use std::collections::VecDeque;

pub const DEFAULT_LOG_CAPACITY: usize = 200_000;

/// Byte-capped scrollback. Oldest bytes are evicted first and the front is
/// always kept on a UTF-8 character boundary.
#[derive(Debug)]
pub struct LogBuffer {
    bytes: VecDeque<u8>,
    capacity: usize,
    evicted: u64,
}

impl LogBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            bytes: VecDeque::with_capacity(capacity.min(64 * 1024)),
            capacity,
            evicted: 0,
        }
    }

    pub fn push(&mut self, chunk: &str) {
        self.bytes.extend(chunk.as_bytes());
        if self.bytes.len() <= self.capacity {
            return;
        }

        let mut cut = self.bytes.len() - self.capacity;
        while cut < self.bytes.len() && is_continuation(self.bytes[cut]) {
            cut += 1;
        }
        self.bytes.drain(..cut);
        self.evicted = self.evicted.saturating_add(cut as u64);
    }

    pub fn snapshot(&self) -> String {
        let (front, back) = self.bytes.as_slices();
        let mut buf = Vec::with_capacity(front.len() + back.len());
        buf.extend_from_slice(front);
        buf.extend_from_slice(back);
        String::from_utf8_lossy(&buf).into_owned()
    }

    /// Bytes currently held.
    pub fn retained(&self) -> usize {
        self.bytes.len()
    }

    /// Total bytes dropped from the front since creation.
    pub fn evicted(&self) -> u64 {
        self.evicted
    }
}

fn is_continuation(byte: u8) -> bool {
    byte & 0xC0 == 0x80
}

/// Incremental UTF-8 decoder for pty reads.
///
/// A multi-byte sequence split across two reads is held back until the rest
/// arrives. Bytes that can never form valid UTF-8 become U+FFFD.
#[derive(Debug, Default)]
pub struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    pub fn decode(&mut self, bytes: &[u8]) -> String {
        let mut input = std::mem::take(&mut self.pending);
        input.extend_from_slice(bytes);

        let mut out = String::with_capacity(input.len());
        let mut rest: &[u8] = &input;
        loop {
            match std::str::from_utf8(rest) {
                Ok(text) => {
                    out.push_str(text);
                    break;
                }
                Err(err) => {
                    let valid = err.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&rest[..valid]));
                    match err.error_len() {
                        Some(bad) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            rest = &rest[valid + bad..];
                        }
                        None => {
                            self.pending = rest[valid..].to_vec();
                            break;
                        }
                    }
                }
            }
        }
        out
    }

    /// Flush whatever is still held back, lossily.
    pub fn finish(&mut self) -> String {
        let pending = std::mem::take(&mut self.pending);
        String::from_utf8_lossy(&pending).into_owned()
    }
}
