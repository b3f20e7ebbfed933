#![forbid(unsafe_code)]

/// Reassembles newline-terminated lines from arbitrarily split byte chunks.
///
/// Splitting happens on raw bytes, so a chunk boundary inside a multi-byte
/// UTF-8 sequence is harmless: `\n` never occurs inside one.
#[derive(Debug, Default)]
pub struct LineAssembler {
    carry: Vec<u8>,
}

impl LineAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.carry.extend_from_slice(chunk);
        let Some(last_newline) = self.carry.iter().rposition(|b| *b == b'\n') else {
            return Vec::new();
        };
        let complete = self.carry.drain(..=last_newline).collect::<Vec<u8>>();
        complete[..last_newline]
            .split(|b| *b == b'\n')
            .map(line_from_bytes)
            .collect()
    }

    /// Returns the unterminated tail, if any, and resets the buffer.
    pub fn finish(&mut self) -> Option<String> {
        if self.carry.is_empty() {
            return None;
        }
        let tail = std::mem::take(&mut self.carry);
        Some(line_from_bytes(&tail))
    }

    pub fn pending_len(&self) -> usize {
        self.carry.len()
    }
}

fn line_from_bytes(bytes: &[u8]) -> String {
    let bytes = bytes.strip_suffix(b"\r").unwrap_or(bytes);
    String::from_utf8_lossy(bytes).into_owned()
}
