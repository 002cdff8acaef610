use bytes::{Bytes, BytesMut};

/// Ordered fragments of one recording pass.
///
/// Append-only while recording. [`finalize`](Self::finalize) concatenates
/// everything in arrival order and leaves the buffer empty, so a buffer
/// never carries data from one pass into the next.
#[derive(Debug, Default)]
pub struct ChunkBuffer {
    chunks: Vec<Bytes>,
    total: usize,
}

impl ChunkBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a fragment. Zero-length fragments are discarded.
    pub fn append(&mut self, chunk: Bytes) {
        if chunk.is_empty() {
            return;
        }
        self.total += chunk.len();
        self.chunks.push(chunk);
    }

    /// Number of retained fragments.
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Total bytes retained.
    pub fn byte_len(&self) -> usize {
        self.total
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Concatenate all fragments and clear the buffer.
    pub fn finalize(&mut self) -> Bytes {
        let chunks = std::mem::take(&mut self.chunks);
        let total = std::mem::take(&mut self.total);
        if chunks.len() == 1 {
            return chunks.into_iter().next().unwrap_or_default();
        }
        let mut out = BytesMut::with_capacity(total);
        for chunk in chunks {
            out.extend_from_slice(&chunk);
        }
        out.freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_concatenates_non_empty_fragments_in_order() {
        let fragments: [&[u8]; 6] = [b"ab", b"", b"cde", b"", b"", b"f"];
        let mut buf = ChunkBuffer::new();
        for f in fragments {
            buf.append(Bytes::copy_from_slice(f));
        }
        assert_eq!(buf.chunk_count(), 3);
        assert_eq!(buf.byte_len(), 6);
        assert_eq!(&buf.finalize()[..], b"abcdef");
    }

    #[test]
    fn test_only_empty_fragments() {
        let mut buf = ChunkBuffer::new();
        for _ in 0..4 {
            buf.append(Bytes::new());
        }
        assert!(buf.is_empty());
        assert!(buf.finalize().is_empty());
    }

    #[test]
    fn test_finalize_clears_buffer() {
        let mut buf = ChunkBuffer::new();
        buf.append(Bytes::from_static(b"first pass"));
        assert_eq!(&buf.finalize()[..], b"first pass");
        assert!(buf.is_empty());
        assert_eq!(buf.byte_len(), 0);

        buf.append(Bytes::from_static(b"second"));
        assert_eq!(&buf.finalize()[..], b"second");
    }

    #[test]
    fn test_many_fragments() {
        let mut buf = ChunkBuffer::new();
        let mut expected = Vec::new();
        for i in 0..100u8 {
            let len = (i % 4) as usize; // every fourth fragment is empty
            let frag = vec![i; len];
            expected.extend_from_slice(&frag);
            buf.append(Bytes::from(frag));
        }
        assert_eq!(buf.chunk_count(), 75);
        assert_eq!(&buf.finalize()[..], &expected[..]);
    }
}
