//! Recovers complete JPEG images from an unframed MJPEG byte stream.
//!
//! `rpicam-vid`'s MJPEG codec writes back-to-back JPEGs to its output pipe
//! with no container framing. Frames are recovered by scanning for the SOI
//! (`FF D8`) and EOI (`FF D9`) markers. Marker pairs may straddle chunk
//! reads, so the splitter buffers input and keeps a resume position instead
//! of rescanning from the start of the frame on every read.

use bytes::Bytes;

const SOI: [u8; 2] = [0xFF, 0xD8];
const EOI: [u8; 2] = [0xFF, 0xD9];

/// Incremental JPEG frame extractor.
///
/// Feed raw chunks with [`push`](Self::push), then drain complete frames
/// with [`next_frame`](Self::next_frame) until it returns `None`. Bytes
/// between frames are discarded; a frame that grows past `max_frame_bytes`
/// is treated as corrupt and dropped, resyncing on the next SOI marker.
pub struct JpegFrameSplitter {
    buf: Vec<u8>,
    scan_from: usize,
    max_frame_bytes: usize,
}

impl JpegFrameSplitter {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self {
            buf: Vec::new(),
            scan_from: 0,
            max_frame_bytes,
        }
    }

    /// Append a chunk read from the capture pipe.
    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Pop the next complete frame out of the buffer, if one has arrived.
    pub fn next_frame(&mut self) -> Option<Bytes> {
        // Align the buffer on an SOI marker, discarding anything before it.
        // The final byte is kept back: it could be the 0xFF of a marker whose
        // second byte arrives in the next chunk.
        let Some(start) = find_marker(&self.buf, &SOI) else {
            let keep_from = self.buf.len().saturating_sub(1);
            self.buf.drain(..keep_from);
            self.scan_from = 0;
            return None;
        };
        if start > 0 {
            self.buf.drain(..start);
            self.scan_from = 0;
        }

        let from = self.scan_from.max(SOI.len());
        if let Some(end) = find_marker_from(&self.buf, &EOI, from) {
            let frame: Vec<u8> = self.buf.drain(..end + EOI.len()).collect();
            self.scan_from = 0;
            return Some(Bytes::from(frame));
        }

        if self.buf.len() > self.max_frame_bytes {
            // No EOI within the size cap: drop this frame's SOI so the next
            // call resyncs on whatever SOI follows.
            self.buf.drain(..SOI.len());
            self.scan_from = 0;
            return None;
        }

        // Resume the EOI scan just before the buffered tail so a marker
        // straddling two reads is still found.
        self.scan_from = self.buf.len().saturating_sub(1).max(SOI.len());
        None
    }

    /// Bytes currently buffered (incomplete frame data).
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }
}

fn find_marker(buf: &[u8], marker: &[u8; 2]) -> Option<usize> {
    buf.windows(2).position(|w| w == marker)
}

fn find_marker_from(buf: &[u8], marker: &[u8; 2], from: usize) -> Option<usize> {
    if from >= buf.len() {
        return None;
    }
    buf[from..].windows(2).position(|w| w == marker).map(|p| p + from)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_jpeg(payload: &[u8]) -> Vec<u8> {
        let mut frame = vec![0xFF, 0xD8];
        frame.extend_from_slice(payload);
        frame.extend_from_slice(&[0xFF, 0xD9]);
        frame
    }

    #[test]
    fn test_single_frame_in_one_chunk() {
        let mut splitter = JpegFrameSplitter::new(1024);
        let frame = fake_jpeg(b"payload");

        splitter.push(&frame);
        assert_eq!(splitter.next_frame().as_deref(), Some(frame.as_slice()));
        assert!(splitter.next_frame().is_none());
    }

    #[test]
    fn test_frame_split_across_chunks() {
        let mut splitter = JpegFrameSplitter::new(1024);
        let frame = fake_jpeg(&[0x01; 100]);

        for chunk in frame.chunks(7) {
            splitter.push(chunk);
        }
        assert_eq!(splitter.next_frame().as_deref(), Some(frame.as_slice()));
    }

    #[test]
    fn test_two_frames_in_one_chunk() {
        let mut splitter = JpegFrameSplitter::new(1024);
        let first = fake_jpeg(b"first");
        let second = fake_jpeg(b"second");

        let mut joined = first.clone();
        joined.extend_from_slice(&second);
        splitter.push(&joined);

        assert_eq!(splitter.next_frame().as_deref(), Some(first.as_slice()));
        assert_eq!(splitter.next_frame().as_deref(), Some(second.as_slice()));
        assert!(splitter.next_frame().is_none());
    }

    #[test]
    fn test_garbage_before_frame_is_discarded() {
        let mut splitter = JpegFrameSplitter::new(1024);
        let frame = fake_jpeg(b"real");

        splitter.push(b"not jpeg data");
        assert!(splitter.next_frame().is_none());
        splitter.push(&frame);
        assert_eq!(splitter.next_frame().as_deref(), Some(frame.as_slice()));
    }

    #[test]
    fn test_eoi_marker_straddles_reads() {
        let mut splitter = JpegFrameSplitter::new(1024);
        let frame = fake_jpeg(b"split end");
        let (head, tail) = frame.split_at(frame.len() - 1);

        splitter.push(head);
        assert!(splitter.next_frame().is_none());
        splitter.push(tail);
        assert_eq!(splitter.next_frame().as_deref(), Some(frame.as_slice()));
    }

    #[test]
    fn test_interleaved_pops_and_pushes() {
        let mut splitter = JpegFrameSplitter::new(1024);
        let frames: Vec<Vec<u8>> = (0..3).map(|i| fake_jpeg(&[i as u8; 50])).collect();

        for frame in &frames {
            for chunk in frame.chunks(11) {
                splitter.push(chunk);
            }
            assert_eq!(splitter.next_frame().as_deref(), Some(frame.as_slice()));
            assert!(splitter.next_frame().is_none());
        }
    }

    #[test]
    fn test_oversized_frame_dropped_with_resync() {
        let mut splitter = JpegFrameSplitter::new(64);
        // SOI with no EOI, bigger than the cap
        let mut oversized = vec![0xFF, 0xD8];
        oversized.extend_from_slice(&[0x00; 100]);
        splitter.push(&oversized);
        assert!(splitter.next_frame().is_none());

        // A well-formed frame afterwards is still recovered
        let frame = fake_jpeg(b"ok");
        splitter.push(&frame);
        assert_eq!(splitter.next_frame().as_deref(), Some(frame.as_slice()));
    }

    #[test]
    fn test_garbage_only_does_not_accumulate() {
        let mut splitter = JpegFrameSplitter::new(1024);
        for _ in 0..100 {
            splitter.push(&[0x00; 32]);
            assert!(splitter.next_frame().is_none());
        }
        assert!(splitter.buffered() <= 33);
    }
}
