//! MJPEG streaming support for the camera feed.
//!
//! The video endpoint serves `multipart/x-mixed-replace` where each frame is
//! a separate JPEG part behind a boundary marker. Browsers handle the whole
//! thing natively: point `<img src="/video">` at the endpoint and each new
//! part replaces the previous image.
//!
//! Frames flow through a [`MjpegBroadcaster`]: the capture loop is the only
//! publisher, and every connected client holds its own subscription. A
//! client that falls behind skips frames and resumes at the newest one, so a
//! slow viewer never stalls the capture side or other clients.

use axum::{
    body::Body,
    http::{header, StatusCode},
    response::Response,
};
use bytes::Bytes;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;

/// Boundary string separating successive frames in the multipart response.
pub const MJPEG_BOUNDARY: &str = "frame";

/// A frame ready for MJPEG streaming.
#[derive(Clone)]
pub struct MjpegFrame {
    /// JPEG-encoded image data
    pub jpeg_data: Bytes,
    /// Frame sequence number (for debugging/logging)
    pub frame_number: u64,
}

/// Fan-out of captured frames to multiple HTTP clients.
///
/// When the capture source ends, the capture loop calls
/// [`close`](Self::close) and every subscriber's response body finishes
/// within one recv cycle. Subscribing after close yields an
/// immediately-ended stream.
pub struct MjpegBroadcaster {
    tx: std::sync::RwLock<Option<broadcast::Sender<MjpegFrame>>>,
}

impl MjpegBroadcaster {
    /// Create a new broadcaster with the given channel capacity.
    ///
    /// Capacity bounds how many frames a slow receiver can buffer before it
    /// starts skipping. 2-4 is plenty for a live feed.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx: std::sync::RwLock::new(Some(tx)),
        }
    }

    /// Publish a frame to all subscribers.
    ///
    /// Returns the number of receivers the frame reached; 0 with no
    /// subscribers or after close.
    pub fn publish(&self, frame: MjpegFrame) -> usize {
        let tx = self.tx.read().unwrap();
        match tx.as_ref() {
            Some(tx) => tx.send(frame).unwrap_or(0),
            None => 0,
        }
    }

    /// Create a subscriber that receives frames from this broadcaster.
    pub fn subscribe(&self) -> MjpegSubscriber {
        let tx = self.tx.read().unwrap();
        let rx = match tx.as_ref() {
            Some(tx) => tx.subscribe(),
            None => closed_receiver(),
        };
        MjpegSubscriber { rx }
    }

    /// End every subscriber's stream. Called once the capture source
    /// reports end-of-stream or a terminal error.
    pub fn close(&self) {
        let mut tx = self.tx.write().unwrap();
        *tx = None;
    }

    pub fn is_closed(&self) -> bool {
        self.tx.read().unwrap().is_none()
    }

    /// Get the current number of active subscribers.
    pub fn subscriber_count(&self) -> usize {
        let tx = self.tx.read().unwrap();
        tx.as_ref().map(|tx| tx.receiver_count()).unwrap_or(0)
    }
}

impl Default for MjpegBroadcaster {
    fn default() -> Self {
        Self::new(4)
    }
}

/// A receiver whose channel is already closed, for late subscribers.
fn closed_receiver() -> broadcast::Receiver<MjpegFrame> {
    let (tx, rx) = broadcast::channel(1);
    drop(tx);
    rx
}

/// Wrap one JPEG image as a self-contained multipart part: boundary line,
/// headers, blank line, the image bytes verbatim, trailing separator.
pub fn encode_part(jpeg_data: &[u8]) -> Bytes {
    let headers = format!(
        "--{MJPEG_BOUNDARY}\r\n\
         Content-Type: image/jpeg\r\n\
         Content-Length: {}\r\n\
         \r\n",
        jpeg_data.len()
    );

    let mut part = Vec::with_capacity(headers.len() + jpeg_data.len() + 2);
    part.extend_from_slice(headers.as_bytes());
    part.extend_from_slice(jpeg_data);
    part.extend_from_slice(b"\r\n");
    Bytes::from(part)
}

/// A subscriber to the MJPEG frame stream.
pub struct MjpegSubscriber {
    rx: broadcast::Receiver<MjpegFrame>,
}

impl MjpegSubscriber {
    /// Lazy, indefinite sequence of multipart chunks, one per frame.
    ///
    /// Ends only when the broadcaster closes. A lagged receiver yields an
    /// error item from the underlying channel, which is skipped here; the
    /// client just picks up at the next frame.
    pub fn into_part_stream(
        self,
    ) -> impl tokio_stream::Stream<Item = Result<Bytes, std::convert::Infallible>> {
        BroadcastStream::new(self.rx).filter_map(|result| match result {
            Ok(frame) => Some(Ok(encode_part(&frame.jpeg_data))),
            Err(_) => None,
        })
    }

    /// Convert this subscriber into an Axum response that streams MJPEG.
    pub fn into_response(self) -> Response {
        Response::builder()
            .status(StatusCode::OK)
            .header(
                header::CONTENT_TYPE,
                format!("multipart/x-mixed-replace; boundary={MJPEG_BOUNDARY}"),
            )
            .header(header::CACHE_CONTROL, "no-cache, no-store, must-revalidate")
            .header(header::PRAGMA, "no-cache")
            .body(Body::from_stream(self.into_part_stream()))
            .expect("Failed to build MJPEG response")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_stream::StreamExt;

    fn frame(payload: &'static [u8], n: u64) -> MjpegFrame {
        MjpegFrame {
            jpeg_data: Bytes::from_static(payload),
            frame_number: n,
        }
    }

    #[test]
    fn test_part_wraps_jpeg_bytes_exactly() {
        let jpeg = b"\xFF\xD8fake jpeg body\xFF\xD9";
        let part = encode_part(jpeg);

        let expected_prefix =
            format!("--frame\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n", jpeg.len());
        assert!(part.starts_with(expected_prefix.as_bytes()));
        assert!(part.ends_with(b"\r\n"));

        // The body between the blank line and the trailing separator is the
        // JPEG byte-for-byte.
        let body = &part[expected_prefix.len()..part.len() - 2];
        assert_eq!(body, jpeg);
    }

    #[test]
    fn test_publish_without_subscribers() {
        let broadcaster = MjpegBroadcaster::new(4);
        assert_eq!(broadcaster.publish(frame(b"test", 1)), 0);
    }

    #[test]
    fn test_subscriber_count() {
        let broadcaster = MjpegBroadcaster::new(4);
        assert_eq!(broadcaster.subscriber_count(), 0);

        let sub1 = broadcaster.subscribe();
        assert_eq!(broadcaster.subscriber_count(), 1);

        let _sub2 = broadcaster.subscribe();
        assert_eq!(broadcaster.subscriber_count(), 2);

        drop(sub1);
        assert_eq!(broadcaster.subscriber_count(), 1);
    }

    #[test]
    fn test_close_is_observable() {
        let broadcaster = MjpegBroadcaster::new(4);
        assert!(!broadcaster.is_closed());
        broadcaster.close();
        assert!(broadcaster.is_closed());
        assert_eq!(broadcaster.publish(frame(b"late", 1)), 0);
        assert_eq!(broadcaster.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_frames_arrive_in_capture_order_then_stream_ends() {
        let broadcaster = MjpegBroadcaster::new(4);
        let mut stream = Box::pin(broadcaster.subscribe().into_part_stream());

        broadcaster.publish(frame(b"F1", 1));
        broadcaster.publish(frame(b"F2", 2));
        broadcaster.publish(frame(b"F3", 3));
        broadcaster.close();

        for expected in [&b"F1"[..], b"F2", b"F3"] {
            let part = stream.next().await.expect("stream ended early").unwrap();
            assert_eq!(part, encode_part(expected));
        }
        // Close terminates the sequence within one recv cycle.
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_subscribe_after_close_yields_ended_stream() {
        let broadcaster = MjpegBroadcaster::new(4);
        broadcaster.close();
        let mut stream = Box::pin(broadcaster.subscribe().into_part_stream());
        assert!(stream.next().await.is_none());
    }
}
