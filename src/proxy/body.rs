//! Body adapters for both legs of an exchange.
//!
//! `RelayBody` carries the origin response to the client under a flush policy.
//! `UploadBody` carries the client request to the origin and reports when it
//! has been fully handed over.

use std::future::Future;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use http::header::{self, HeaderMap};
use http_body::{Body, Frame, SizeHint};
use pin_project::pin_project;
use tokio::sync::oneshot;
use tokio::time::{sleep, Sleep};

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Buffered bytes are written out once this much has accumulated.
const MAX_BUFFERED: usize = 64 * 1024;

/// When buffered response bytes are written to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushPolicy {
    /// Every chunk is passed on as soon as it arrives.
    Immediate,
    /// Chunks are coalesced, but never held longer than the interval.
    Interval(Duration),
}

impl FlushPolicy {
    /// A zero interval means flushing after every chunk.
    pub fn from_interval(interval: Duration) -> Self {
        if interval.is_zero() {
            FlushPolicy::Immediate
        } else {
            FlushPolicy::Interval(interval)
        }
    }

    /// Pick the policy for one response.
    ///
    /// Event streams and responses of unknown length are streamed chunk by
    /// chunk; everything else uses the configured interval.
    pub fn for_response(configured: FlushPolicy, headers: &HeaderMap) -> FlushPolicy {
        let event_stream = headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(';').next())
            .is_some_and(|media| media.trim().eq_ignore_ascii_case("text/event-stream"));

        if event_stream || !headers.contains_key(header::CONTENT_LENGTH) {
            FlushPolicy::Immediate
        } else {
            configured
        }
    }
}

/// Response body relayed from the origin to the client.
///
/// Data frames that arrive back to back are merged; buffered data is released
/// when the flush interval elapses, when the buffer is full, or before any
/// trailers and the end of the stream. Trailers pass through untouched.
#[pin_project]
pub struct RelayBody<B> {
    #[pin]
    inner: B,
    policy: FlushPolicy,
    buffer: BytesMut,
    flush_timer: Option<Pin<Box<Sleep>>>,
    deferred: Option<Frame<Bytes>>,
    inner_done: bool,
}

impl<B> RelayBody<B> {
    pub fn new(inner: B, policy: FlushPolicy) -> Self {
        Self {
            inner,
            policy,
            buffer: BytesMut::new(),
            flush_timer: None,
            deferred: None,
            inner_done: false,
        }
    }
}

impl<B> Body for RelayBody<B>
where
    B: Body<Data = Bytes>,
    B::Error: Into<BoxError>,
{
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, BoxError>>> {
        let mut this = self.project();

        loop {
            if this.buffer.is_empty() {
                if let Some(frame) = this.deferred.take() {
                    return Poll::Ready(Some(Ok(frame)));
                }
            }

            if *this.inner_done || this.deferred.is_some() {
                if this.buffer.is_empty() {
                    return Poll::Ready(None);
                }
                *this.flush_timer = None;
                return Poll::Ready(Some(Ok(Frame::data(this.buffer.split().freeze()))));
            }

            match this.inner.as_mut().poll_frame(cx) {
                Poll::Ready(Some(Ok(frame))) => match frame.into_data() {
                    Ok(data) => {
                        if *this.policy == FlushPolicy::Immediate && this.buffer.is_empty() {
                            return Poll::Ready(Some(Ok(Frame::data(data))));
                        }
                        this.buffer.extend_from_slice(&data);
                        if this.buffer.len() >= MAX_BUFFERED {
                            *this.flush_timer = None;
                            return Poll::Ready(Some(Ok(Frame::data(
                                this.buffer.split().freeze(),
                            ))));
                        }
                        if let FlushPolicy::Interval(interval) = *this.policy {
                            if this.flush_timer.is_none() {
                                *this.flush_timer = Some(Box::pin(sleep(interval)));
                            }
                        }
                    }
                    Err(frame) => {
                        // Trailers end the stream; buffered data goes first.
                        *this.deferred = Some(frame);
                    }
                },
                Poll::Ready(Some(Err(e))) => {
                    let error: BoxError = e.into();
                    tracing::warn!(error = %error, "Origin response body failed mid-stream");
                    this.buffer.clear();
                    *this.flush_timer = None;
                    return Poll::Ready(Some(Err(error)));
                }
                Poll::Ready(None) => {
                    *this.inner_done = true;
                }
                Poll::Pending => {
                    if this.buffer.is_empty() {
                        return Poll::Pending;
                    }
                    if let Some(timer) = this.flush_timer.as_mut() {
                        ready!(timer.as_mut().poll(cx));
                    }
                    *this.flush_timer = None;
                    return Poll::Ready(Some(Ok(Frame::data(this.buffer.split().freeze()))));
                }
            }
        }
    }

    fn is_end_stream(&self) -> bool {
        self.buffer.is_empty()
            && self.deferred.is_none()
            && (self.inner_done || self.inner.is_end_stream())
    }

    fn size_hint(&self) -> SizeHint {
        if self.inner_done {
            return SizeHint::with_exact(self.buffer.len() as u64);
        }
        let inner = self.inner.size_hint();
        let buffered = self.buffer.len() as u64;
        let mut hint = SizeHint::new();
        hint.set_lower(inner.lower() + buffered);
        if let Some(upper) = inner.upper() {
            hint.set_upper(upper + buffered);
        }
        hint
    }
}

/// Request body uploaded to the origin.
///
/// Signals once the last frame has been handed to the transport so the wait
/// for response headers can start. A body announced with
/// `Expect: 100-continue` is held back for the expect-continue window first.
#[pin_project]
pub struct UploadBody<B> {
    #[pin]
    inner: B,
    uploaded: Option<oneshot::Sender<()>>,
    hold: Option<Pin<Box<Sleep>>>,
}

impl<B: Body> UploadBody<B> {
    /// Wrap `inner`, returning the body and a receiver that resolves once the
    /// upload is complete (or abandoned).
    pub fn new(inner: B, expect_continue: Option<Duration>) -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        let uploaded = if inner.is_end_stream() {
            let _ = tx.send(());
            None
        } else {
            Some(tx)
        };
        let hold = expect_continue
            .filter(|_| uploaded.is_some())
            .map(|window| Box::pin(sleep(window)));

        (Self { inner, uploaded, hold }, rx)
    }
}

impl<B> Body for UploadBody<B>
where
    B: Body<Data = Bytes>,
{
    type Data = Bytes;
    type Error = B::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, B::Error>>> {
        let mut this = self.project();

        if let Some(hold) = this.hold.as_mut() {
            ready!(hold.as_mut().poll(cx));
            *this.hold = None;
        }

        let polled = ready!(this.inner.as_mut().poll_frame(cx));
        let finished = match &polled {
            None | Some(Err(_)) => true,
            Some(Ok(frame)) => frame.is_trailers() || this.inner.is_end_stream(),
        };
        if finished {
            if let Some(tx) = this.uploaded.take() {
                let _ = tx.send(());
            }
        }
        Poll::Ready(polled)
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;
    use http_body_util::{BodyExt, Full, StreamBody};
    use tokio::sync::mpsc;
    use tokio::time::Instant;

    type Chunk = Result<Frame<Bytes>, std::io::Error>;

    fn channel_body() -> (mpsc::Sender<Chunk>, StreamBody<ReceiverStream>) {
        let (tx, rx) = mpsc::channel(16);
        (tx, StreamBody::new(ReceiverStream(rx)))
    }

    struct ReceiverStream(mpsc::Receiver<Chunk>);

    impl futures_util::Stream for ReceiverStream {
        type Item = Chunk;
        fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Chunk>> {
            self.0.poll_recv(cx)
        }
    }

    #[test]
    fn policy_selection() {
        let configured = FlushPolicy::Interval(Duration::from_millis(10));

        let mut headers = HeaderMap::new();
        assert_eq!(FlushPolicy::for_response(configured, &headers), FlushPolicy::Immediate);

        headers.insert(header::CONTENT_LENGTH, HeaderValue::from_static("12"));
        assert_eq!(FlushPolicy::for_response(configured, &headers), configured);

        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("Text/Event-Stream; charset=utf-8"),
        );
        assert_eq!(FlushPolicy::for_response(configured, &headers), FlushPolicy::Immediate);

        assert_eq!(FlushPolicy::from_interval(Duration::ZERO), FlushPolicy::Immediate);
    }

    #[tokio::test(start_paused = true)]
    async fn interval_policy_releases_partial_data_after_interval() {
        let (tx, body) = channel_body();
        let mut relay = RelayBody::new(body, FlushPolicy::Interval(Duration::from_millis(10)));

        tx.send(Ok(Frame::data(Bytes::from_static(b"a")))).await.unwrap();
        tx.send(Ok(Frame::data(Bytes::from_static(b"b")))).await.unwrap();

        let start = Instant::now();
        let frame = relay.frame().await.unwrap().unwrap();
        assert_eq!(frame.into_data().unwrap(), Bytes::from_static(b"ab"));
        assert_eq!(start.elapsed(), Duration::from_millis(10));

        drop(tx);
        assert!(relay.frame().await.is_none());
    }

    #[tokio::test]
    async fn immediate_policy_passes_chunks_through() {
        let (tx, body) = channel_body();
        let mut relay = RelayBody::new(body, FlushPolicy::Immediate);

        tx.send(Ok(Frame::data(Bytes::from_static(b"one")))).await.unwrap();
        let frame = relay.frame().await.unwrap().unwrap();
        assert_eq!(frame.into_data().unwrap(), Bytes::from_static(b"one"));

        tx.send(Ok(Frame::data(Bytes::from_static(b"two")))).await.unwrap();
        let frame = relay.frame().await.unwrap().unwrap();
        assert_eq!(frame.into_data().unwrap(), Bytes::from_static(b"two"));
    }

    #[tokio::test]
    async fn trailers_follow_buffered_data() {
        let (tx, body) = channel_body();
        let mut relay = RelayBody::new(body, FlushPolicy::Interval(Duration::from_secs(60)));

        let mut trailers = HeaderMap::new();
        trailers.insert("x-trailer", HeaderValue::from_static("first trailer"));
        tx.send(Ok(Frame::data(Bytes::from_static(b"body")))).await.unwrap();
        tx.send(Ok(Frame::trailers(trailers))).await.unwrap();
        drop(tx);

        let collected = relay.collect().await.unwrap();
        let trailers = collected.trailers().cloned().unwrap();
        assert_eq!(trailers["x-trailer"], "first trailer");
        assert_eq!(collected.to_bytes(), Bytes::from_static(b"body"));
    }

    #[tokio::test]
    async fn full_buffer_is_released_without_waiting() {
        let (tx, body) = channel_body();
        let mut relay = RelayBody::new(body, FlushPolicy::Interval(Duration::from_secs(60)));

        tx.send(Ok(Frame::data(Bytes::from(vec![1u8; MAX_BUFFERED]))))
            .await
            .unwrap();
        let frame = relay.frame().await.unwrap().unwrap();
        assert_eq!(frame.into_data().unwrap().len(), MAX_BUFFERED);
    }

    #[tokio::test]
    async fn origin_error_is_surfaced() {
        let (tx, body) = channel_body();
        let mut relay = RelayBody::new(body, FlushPolicy::Immediate);

        tx.send(Err(std::io::Error::other("origin reset"))).await.unwrap();
        let err = relay.frame().await.unwrap().unwrap_err();
        assert_eq!(err.to_string(), "origin reset");
    }

    #[tokio::test]
    async fn empty_upload_signals_immediately() {
        let (body, uploaded) = UploadBody::new(http_body_util::Empty::<Bytes>::new(), None);
        assert!(body.is_end_stream());
        uploaded.await.unwrap();
    }

    #[tokio::test]
    async fn upload_signals_after_last_frame() {
        let (body, mut uploaded) = UploadBody::new(Full::new(Bytes::from_static(b"payload")), None);
        assert!(uploaded.try_recv().is_err());

        let collected = body.collect().await.unwrap().to_bytes();
        assert_eq!(collected, Bytes::from_static(b"payload"));
        uploaded.await.unwrap();
    }

    #[tokio::test]
    async fn upload_signals_when_last_data_frame_is_taken() {
        let (mut body, mut uploaded) =
            UploadBody::new(Full::new(Bytes::from_static(b"sized")), None);

        body.frame().await.unwrap().unwrap();
        assert!(body.is_end_stream());
        assert_eq!(uploaded.try_recv(), Ok(()));
    }

    #[tokio::test(start_paused = true)]
    async fn expect_continue_holds_body_for_window() {
        let (mut body, _uploaded) = UploadBody::new(
            Full::new(Bytes::from_static(b"payload")),
            Some(Duration::from_secs(1)),
        );

        let start = Instant::now();
        let frame = body.frame().await.unwrap().unwrap();
        assert_eq!(frame.into_data().unwrap(), Bytes::from_static(b"payload"));
        assert_eq!(start.elapsed(), Duration::from_secs(1));
    }
}
