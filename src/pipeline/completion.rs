//! Observing the final status of a call.
//!
//! A gRPC status arrives either in the response headers (trailers-only
//! responses) or in the trailers after the last message. Stages that record the
//! outcome hook [`on_completion`] so unary and streaming calls are both seen at
//! exit, not when the headers go out.

use std::pin::Pin;
use std::task::{Context, Poll};

use http_body::{Body, Frame, SizeHint};
use tonic::{Code, Status};

use super::BoxBody;

type Callback = Box<dyn FnOnce(Code) + Send + 'static>;

/// Runs `on_complete` exactly once with the call's final status code.
///
/// Trailers-only and already-finished responses complete immediately. Otherwise
/// the body is wrapped and completes on its `grpc-status` trailer, on a body
/// error, at end of stream, or with `Cancelled` if it is dropped first.
pub(crate) fn on_completion<F>(
    response: http::Response<BoxBody>,
    on_complete: F,
) -> http::Response<BoxBody>
where
    F: FnOnce(Code) + Send + 'static,
{
    if let Some(status) = Status::from_header_map(response.headers()) {
        on_complete(status.code());
        return response;
    }

    if response.body().is_end_stream() {
        on_complete(Code::Ok);
        return response;
    }

    response.map(|body| {
        tonic::body::boxed(CompletionBody {
            inner: body,
            on_complete: Some(Box::new(on_complete)),
        })
    })
}

struct CompletionBody {
    inner: BoxBody,
    on_complete: Option<Callback>,
}

impl CompletionBody {
    fn complete(&mut self, code: Code) {
        if let Some(on_complete) = self.on_complete.take() {
            on_complete(code);
        }
    }
}

impl Body for CompletionBody {
    type Data = <BoxBody as Body>::Data;
    type Error = Status;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let polled = Pin::new(&mut self.inner).poll_frame(cx);

        match &polled {
            Poll::Ready(Some(Ok(frame))) => {
                if let Some(trailers) = frame.trailers_ref() {
                    let code = Status::from_header_map(trailers).map_or(Code::Ok, |s| s.code());
                    self.complete(code);
                }
            }
            Poll::Ready(Some(Err(status))) => self.complete(status.code()),
            Poll::Ready(None) => self.complete(Code::Ok),
            Poll::Pending => {}
        }

        polled
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

impl Drop for CompletionBody {
    fn drop(&mut self) {
        self.complete(Code::Cancelled);
    }
}
