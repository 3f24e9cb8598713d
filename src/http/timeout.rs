use std::future::Future;
use std::task::{Context, Poll, ready};

use http_body::{Body, SizeHint};
use pin_project_lite::pin_project;
use tokio::time::{Instant, Sleep, sleep_until};

use crate::*;

/// Deadline applied to the response body once headers are committed.
/// Expiry here truncates the stream; the status is already on the wire.
pub enum BodyTimeout {
	Deadline(Instant),
	None,
}

impl BodyTimeout {
	pub fn apply(self, r: crate::http::Response) -> crate::http::Response {
		r.map(|b| crate::http::Body::new(TimeoutBody::new(self, b)))
	}
}

pin_project! {
	pub struct TimeoutBody<B> {
		timeout: BodyTimeout,
		#[pin]
		sleep: Option<Sleep>,
		#[pin]
		body: B,
	}
}

impl<B> TimeoutBody<B> {
	pub fn new(timeout: BodyTimeout, body: B) -> Self {
		TimeoutBody {
			timeout,
			sleep: None,
			body,
		}
	}
}

impl<B> Body for TimeoutBody<B>
where
	B: Body,
	B::Error: Into<axum_core::BoxError>,
{
	type Data = B::Data;
	type Error = Box<dyn std::error::Error + Send + Sync>;

	fn poll_frame(
		self: Pin<&mut Self>,
		cx: &mut Context<'_>,
	) -> Poll<Option<Result<http_body::Frame<Self::Data>, Self::Error>>> {
		let mut this = self.project();

		if let BodyTimeout::Deadline(d) = this.timeout {
			// Start the `Sleep` if not active.
			let sleep_pinned = if let Some(some) = this.sleep.as_mut().as_pin_mut() {
				some
			} else {
				this.sleep.set(Some(sleep_until(*d)));
				this.sleep.as_mut().as_pin_mut().expect("sleep was just set")
			};

			if let Poll::Ready(()) = sleep_pinned.poll(cx) {
				return Poll::Ready(Some(Err(Box::new(TimeoutError(())))));
			}
		}

		let frame = ready!(this.body.poll_frame(cx));

		Poll::Ready(frame.transpose().map_err(Into::into).transpose())
	}

	fn is_end_stream(&self) -> bool {
		self.body.is_end_stream()
	}

	fn size_hint(&self) -> SizeHint {
		self.body.size_hint()
	}
}

/// Error for [`TimeoutBody`].
#[derive(Debug)]
pub struct TimeoutError(());

impl std::error::Error for TimeoutError {}

impl std::fmt::Display for TimeoutError {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "data was not received within the designated timeout")
	}
}

#[cfg(test)]
mod tests {
	use http_body_util::BodyExt;

	use super::*;
	use crate::http;

	#[tokio::test]
	async fn no_deadline_passes_body_through() {
		let resp = ::http::Response::new(http::Body::from("payload"));
		let resp = BodyTimeout::None.apply(resp);
		let bytes = resp.into_body().collect().await.unwrap().to_bytes();
		assert_eq!(bytes, Bytes::from_static(b"payload"));
	}

	#[tokio::test]
	async fn expired_deadline_truncates_body() {
		// A channel body that never produces data
		let (_tx, rx) = tokio::sync::mpsc::channel::<Result<Bytes, std::io::Error>>(1);
		let body = http::Body::from_stream(tokio_stream::wrappers::ReceiverStream::new(rx));
		let resp = ::http::Response::new(body);
		let deadline = Instant::now() + Duration::from_millis(20);
		let resp = BodyTimeout::Deadline(deadline).apply(resp);
		let err = resp.into_body().collect().await.unwrap_err();
		assert!(err.to_string().contains("timeout"));
	}
}
