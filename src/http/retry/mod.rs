use bytes::BytesMut;
use futures_util::{StreamExt, stream};
use http_body::Frame;
use http_body_util::{BodyExt, BodyStream, StreamBody};

use crate::http::{Body, Error, Method};
use crate::*;

/// Ceiling on how much of a request body we hold for replay. Anything
/// larger streams through unbuffered and is simply not retried.
pub const MAX_BUFFERED_BYTES: usize = 64 * 1024;

/// Methods safe to re-send after a transport failure. Everything else is
/// attempted exactly once.
pub fn is_idempotent(method: &Method) -> bool {
	matches!(
		*method,
		Method::GET | Method::HEAD | Method::PUT | Method::DELETE | Method::OPTIONS
	)
}

/// Read the body up to `limit` bytes. Within the limit the collected bytes
/// come back and can seed any number of attempts. Past it, the consumed
/// prefix is stitched back in front of the remainder so the request still
/// streams upstream untouched.
pub async fn try_buffer(mut body: Body, limit: usize) -> Result<Bytes, Body> {
	let mut frames: Vec<Frame<Bytes>> = Vec::new();
	let mut size = 0usize;
	loop {
		match body.frame().await {
			None => break,
			Some(Ok(frame)) => {
				if let Some(data) = frame.data_ref() {
					size += data.len();
				}
				frames.push(frame);
				if size > limit {
					let prefix = stream::iter(frames.into_iter().map(Ok::<_, Error>));
					let rest = BodyStream::new(body);
					return Err(Body::new(StreamBody::new(prefix.chain(rest))));
				}
			},
			Some(Err(err)) => {
				// Reading failed; hand back a body that replays what we read
				// and then surfaces the error to the forwarder.
				let prefix = stream::iter(frames.into_iter().map(Ok::<_, Error>));
				let tail = stream::once(async move { Err::<Frame<Bytes>, _>(err) });
				return Err(Body::new(StreamBody::new(prefix.chain(tail))));
			},
		}
	}
	let mut buf = BytesMut::with_capacity(size);
	for frame in frames {
		if let Ok(data) = frame.into_data() {
			buf.extend_from_slice(&data);
		}
	}
	Ok(buf.freeze())
}
