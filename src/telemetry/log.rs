use std::task::{Context, Poll};

use http_body::{Body, Frame, SizeHint};
use pin_project_lite::pin_project;

use crate::http::Method;
use crate::*;

/// Per-request access log record. It travels with the response body and is
/// emitted when the stream finishes (or is abandoned), so the logged
/// duration covers the full transfer, not just the header write.
pub struct RequestLog {
	pub id: String,
	pub peer: IpAddr,
	pub method: Method,
	pub path: String,
	pub service: Option<String>,
	pub endpoint: Option<String>,
	pub status: Option<u16>,
	pub retry_attempt: Option<u8>,
	pub error: Option<String>,
	start: Instant,
	enabled: bool,
}

impl RequestLog {
	pub fn new(id: String, peer: IpAddr, method: Method, path: String, enabled: bool) -> RequestLog {
		RequestLog {
			id,
			peer,
			method,
			path,
			service: None,
			endpoint: None,
			status: None,
			retry_attempt: None,
			error: None,
			start: Instant::now(),
			enabled,
		}
	}

	pub fn start(&self) -> Instant {
		self.start
	}
}

impl Drop for RequestLog {
	fn drop(&mut self) {
		if !self.enabled {
			return;
		}
		info!(
			target: "request",
			id = %self.id,
			peer = %self.peer,
			method = %self.method,
			path = %self.path,
			service = self.service.as_deref().unwrap_or(""),
			endpoint = self.endpoint.as_deref().unwrap_or(""),
			status = self.status.unwrap_or(0),
			retry = self.retry_attempt.unwrap_or(0),
			error = self.error.as_deref().unwrap_or(""),
			duration_ms = self.start.elapsed().as_millis() as u64,
			"completed",
		);
	}
}

pin_project! {
	/// Carries the [`RequestLog`] until the response body is fully streamed.
	pub struct LogBody<B> {
		#[pin]
		inner: B,
		log: Option<RequestLog>,
	}
}

impl<B> LogBody<B> {
	pub fn new(inner: B, log: RequestLog) -> LogBody<B> {
		LogBody {
			inner,
			log: Some(log),
		}
	}
}

impl<B: Body> Body for LogBody<B> {
	type Data = B::Data;
	type Error = B::Error;

	fn poll_frame(
		self: Pin<&mut Self>,
		cx: &mut Context<'_>,
	) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
		let this = self.project();
		let res = std::task::ready!(this.inner.poll_frame(cx));
		if res.is_none() {
			// End of stream; emit now instead of waiting for the drop
			this.log.take();
		}
		Poll::Ready(res)
	}

	fn is_end_stream(&self) -> bool {
		self.inner.is_end_stream()
	}

	fn size_hint(&self) -> SizeHint {
		self.inner.size_hint()
	}
}
