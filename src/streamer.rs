use crate::ai_sdk::DeltaStream;
use crate::cancel::OrCancelExt;
use crate::error::RequestError;
use crate::events::RequestEvents;
use crate::protocol::ChatEventKind;
use futures::StreamExt;
use tracing::debug;

/// Forwards `stream` as `streaming{chunk}` events and returns the full reply.
///
/// The `streaming{null}` sentinel is left to the caller, which owns the request's terminal
/// event. Cancellation observed at any chunk, or after the last one, yields
/// [`RequestError::Aborted`].
pub async fn stream_reply(
    mut stream: DeltaStream,
    events: &RequestEvents<'_>,
) -> Result<String, RequestError> {
    let cancel = events.cancel();
    let mut reply = String::new();
    let mut chunks = 0usize;

    while let Some(delta) = stream.next().or_cancel(cancel).await? {
        let delta = delta?;
        if delta.is_empty() {
            continue;
        }
        reply.push_str(&delta);
        chunks += 1;
        events.emit(ChatEventKind::Streaming { chunk: Some(delta) });
    }

    if cancel.is_cancelled() {
        return Err(RequestError::Aborted);
    }
    debug!(
        request_id = events.request_id(),
        chunks,
        reply_len = reply.len(),
        "Stream finished"
    );
    Ok(reply)
}
