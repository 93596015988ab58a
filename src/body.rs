//! Implementation of a HTTP body.

use std::io;
use std::pin::Pin;
use std::pin::pin;
use std::task::Context;
use std::task::Poll;
use std::task::ready;

use bytes::Bytes;
use bytes::BytesMut;
use futures::Stream;
use futures::StreamExt;
use http_body::Frame;
use http_body::SizeHint;
use pin_project_lite::pin_project;

/// Represents the supported HTTP body trait.
pub trait HttpBody: http_body::Body<Data = Bytes, Error = io::Error> + Send {
    /// Polls the next data frame as bytes.
    ///
    /// Returns end of stream after all data frames, thereby ignoring trailers.
    fn poll_next_data(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<io::Result<Bytes>>> {
        match ready!(self.poll_frame(cx)) {
            Some(Ok(frame)) => match frame.into_data().ok() {
                Some(data) => Poll::Ready(Some(Ok(data))),
                None => Poll::Ready(None),
            },
            Some(Err(e)) => Poll::Ready(Some(Err(e))),
            None => Poll::Ready(None),
        }
    }
}

/// A body whose content is already in memory.
///
/// Yields its bytes as a single data frame.
#[derive(Debug, Clone, Default)]
pub struct Buffered {
    /// The remaining data of the body.
    data: Option<Bytes>,
}

impl Buffered {
    /// Constructs a new buffered body from the given bytes.
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            data: Some(data.into()),
        }
    }

    /// Constructs an empty buffered body.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Gets the length of the remaining data.
    fn len(&self) -> u64 {
        self.data.as_ref().map(|d| d.len() as u64).unwrap_or(0)
    }
}

impl From<Bytes> for Buffered {
    fn from(data: Bytes) -> Self {
        Self::new(data)
    }
}

impl From<&'static str> for Buffered {
    fn from(data: &'static str) -> Self {
        Self::new(data)
    }
}

impl From<String> for Buffered {
    fn from(data: String) -> Self {
        Self::new(data)
    }
}

impl From<Vec<u8>> for Buffered {
    fn from(data: Vec<u8>) -> Self {
        Self::new(data)
    }
}

impl http_body::Body for Buffered {
    type Data = Bytes;
    type Error = io::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        _: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        Poll::Ready(
            self.get_mut()
                .data
                .take()
                .filter(|data| !data.is_empty())
                .map(|data| Ok(Frame::data(data))),
        )
    }

    fn is_end_stream(&self) -> bool {
        self.len() == 0
    }

    fn size_hint(&self) -> SizeHint {
        SizeHint::with_exact(self.len())
    }
}

impl HttpBody for Buffered {}

pin_project! {
    /// Represents a response body source.
    ///
    /// The body may come from the following sources:
    ///
    /// * The application handler, streamed as-is.
    /// * Memory, either read back from the entitystore or buffered while
    ///   computing a validator.
    #[project = ProjectedBodySource]
    enum BodySource<B> {
        /// The body is coming from the application handler.
        Upstream {
            // The underlying source for the body.
            #[pin]
            source: B
        },
        /// The body is already in memory.
        Buffered {
            // The underlying source for the body.
            #[pin]
            source: Buffered
        },
    }
}

pin_project! {
    /// Represents a response body.
    pub struct Body<B> {
        // The body source.
        #[pin]
        source: BodySource<B>
    }
}

impl<B> Body<B>
where
    B: HttpBody,
{
    /// Constructs a new body from a body produced by the application handler.
    pub fn from_upstream(upstream: B) -> Self {
        Self {
            source: BodySource::Upstream { source: upstream },
        }
    }

    /// Constructs a new body from bytes in memory.
    pub fn from_bytes(data: impl Into<Bytes>) -> Self {
        Self {
            source: BodySource::Buffered {
                source: Buffered::new(data),
            },
        }
    }

    /// Constructs an empty body.
    pub fn empty() -> Self {
        Self {
            source: BodySource::Buffered {
                source: Buffered::empty(),
            },
        }
    }

    /// Checks whether the body is already held in memory.
    pub fn is_buffered(&self) -> bool {
        matches!(self.source, BodySource::Buffered { .. })
    }

    /// Reads the entire body into memory.
    ///
    /// The body must be finite; an error reading any chunk is returned as-is.
    pub async fn collect(self) -> io::Result<Bytes> {
        let mut stream = pin!(self);
        let mut first: Option<Bytes> = None;
        let mut buf = BytesMut::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            match first.take() {
                None if buf.is_empty() => first = Some(chunk),
                Some(prev) => {
                    buf.extend_from_slice(&prev);
                    buf.extend_from_slice(&chunk);
                }
                None => buf.extend_from_slice(&chunk),
            }
        }

        // Avoid a copy when the body was a single chunk
        Ok(first.unwrap_or_else(|| buf.freeze()))
    }
}

impl<B> http_body::Body for Body<B>
where
    B: HttpBody,
{
    type Data = Bytes;
    type Error = io::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, io::Error>>> {
        match self.project().source.project() {
            ProjectedBodySource::Upstream { source } => source.poll_frame(cx),
            ProjectedBodySource::Buffered { source } => source.poll_frame(cx),
        }
    }

    fn is_end_stream(&self) -> bool {
        match &self.source {
            BodySource::Upstream { source } => source.is_end_stream(),
            BodySource::Buffered { source } => source.is_end_stream(),
        }
    }

    fn size_hint(&self) -> SizeHint {
        match &self.source {
            BodySource::Upstream { source } => source.size_hint(),
            BodySource::Buffered { source } => source.size_hint(),
        }
    }
}

impl<B> HttpBody for Body<B> where B: HttpBody + Send {}

/// An implementation of `Stream` for body.
///
/// This implementation only retrieves the data frames of the body.
///
/// Trailer frames are not read.
impl<B> Stream for Body<B>
where
    B: HttpBody,
{
    type Item = io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match self.project().source.project() {
            ProjectedBodySource::Upstream { source } => source.poll_next_data(cx),
            ProjectedBodySource::Buffered { source } => source.poll_next_data(cx),
        }
    }
}
