//! Background task pulling from the merged child streams and pacing the
//! core actor.
//!
//! One pull, one `MessageReceived` event, one awaited reply. The reply is
//! the backpressure valve: the core withholds it while the incoming queue
//! sits above the resume threshold, which stalls the next pull.

use crate::core::CoreEvent;
use crate::taskseq::TaskSeq;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub(crate) fn spawn_poller(
    task_seq: TaskSeq,
    events: mpsc::UnboundedSender<CoreEvent>,
    stop_token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let (_, result) = tokio::select! {
                biased;
                _ = stop_token.cancelled() => break,
                next = task_seq.next() => next,
            };

            let (reply_tx, reply_rx) = oneshot::channel();
            if events
                .send(CoreEvent::MessageReceived {
                    message: result,
                    poller_reply: reply_tx,
                })
                .is_err()
            {
                break;
            }

            // Wait for the core to free a slot before the next pull.
            tokio::select! {
                biased;
                _ = stop_token.cancelled() => break,
                _ = reply_rx => {}
            }
        }
        debug!("poller stopped");
    })
}
