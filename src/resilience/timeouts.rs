//! Timeout enforcement for client-facing bodies.
//!
//! # Responsibilities
//! - Bound how long a request body may take to arrive (read deadline)
//! - Bound how long a response may take to be written (write deadline)
//! - Turn an elapsed deadline into a body error so hyper aborts the connection
//!
//! # Design Decisions
//! - Deadlines are absolute instants fixed when the request head is read;
//!   progress on the body never extends them
//! - The deadline is checked before the inner body is polled

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use http_body::{Body, Frame, SizeHint};
use pin_project::pin_project;
use thiserror::Error;
use tokio::time::{sleep_until, Instant, Sleep};

use crate::proxy::body::BoxError;

/// Which deadline elapsed.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutError {
    #[error("request was not read before the read deadline")]
    Read,
    #[error("response was not written before the write deadline")]
    Write,
}

/// A body that fails once an absolute deadline has passed.
#[pin_project]
pub struct DeadlineBody<B> {
    #[pin]
    inner: B,
    #[pin]
    deadline: Sleep,
    kind: TimeoutError,
    expired: bool,
}

impl<B> DeadlineBody<B> {
    pub fn new(inner: B, deadline: Instant, kind: TimeoutError) -> Self {
        Self {
            inner,
            deadline: sleep_until(deadline),
            kind,
            expired: false,
        }
    }

    pub fn read(inner: B, deadline: Instant) -> Self {
        Self::new(inner, deadline, TimeoutError::Read)
    }

    pub fn write(inner: B, deadline: Instant) -> Self {
        Self::new(inner, deadline, TimeoutError::Write)
    }
}

impl<B> Body for DeadlineBody<B>
where
    B: Body,
    B::Error: Into<BoxError>,
{
    type Data = B::Data;
    type Error = BoxError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.project();
        if *this.expired || this.inner.is_end_stream() {
            return Poll::Ready(None);
        }

        if this.deadline.poll(cx).is_ready() {
            *this.expired = true;
            tracing::debug!(error = %this.kind, "Body deadline elapsed");
            return Poll::Ready(Some(Err((*this.kind).into())));
        }

        this.inner
            .poll_frame(cx)
            .map(|frame| frame.map(|result| result.map_err(Into::into)))
    }

    fn is_end_stream(&self) -> bool {
        self.expired || self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use http_body_util::{BodyExt, Full, StreamBody};
    use std::convert::Infallible;
    use std::pin::pin;
    use std::time::Duration;

    #[tokio::test]
    async fn ready_body_completes_before_deadline() {
        let deadline = Instant::now() + Duration::from_secs(5);
        let body = DeadlineBody::read(Full::new(Bytes::from_static(b"payload")), deadline);
        let collected = body.collect().await.unwrap().to_bytes();
        assert_eq!(collected, "payload");
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_body_fails_at_deadline() {
        let stalled = StreamBody::new(futures_util::stream::pending::<
            Result<Frame<Bytes>, Infallible>,
        >());
        let deadline = Instant::now() + Duration::from_secs(10);
        let mut body = pin!(DeadlineBody::write(stalled, deadline));

        let err = body.frame().await.unwrap().unwrap_err();
        assert_eq!(
            err.downcast_ref::<TimeoutError>(),
            Some(&TimeoutError::Write)
        );
        assert!(Instant::now() >= deadline);
        assert!(body.is_end_stream());
        assert!(body.frame().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn elapsed_deadline_wins_over_ready_data() {
        let deadline = Instant::now();
        tokio::time::advance(Duration::from_millis(1)).await;
        let mut body = pin!(DeadlineBody::read(
            Full::new(Bytes::from_static(b"late")),
            deadline,
        ));
        let err = body.frame().await.unwrap().unwrap_err();
        assert_eq!(err.downcast_ref::<TimeoutError>(), Some(&TimeoutError::Read));
    }

    #[tokio::test(start_paused = true)]
    async fn empty_body_ends_cleanly_past_deadline() {
        let deadline = Instant::now();
        tokio::time::advance(Duration::from_millis(1)).await;
        let mut body = pin!(DeadlineBody::write(
            http_body_util::Empty::<Bytes>::new(),
            deadline,
        ));
        assert!(body.frame().await.is_none());
    }
}
