//! Aggregation of in-flight peer responses into quorum decisions.

use std::future::Future;
use std::time::Duration;

use futures::future::AbortHandle;
use futures::future::Abortable;
use futures::stream::FuturesUnordered;
use futures::stream::StreamExt;

use crate::error::CollectError;
use crate::NodeId;

/// The outcome of a single peer request: the peer's response, or the error which felled it.
pub(crate) type PeerResult<T> = Result<(NodeId, T), (NodeId, anyhow::Error)>;

/// Count the successful responses in a set of peer outcomes.
pub(crate) fn successes<T>(received: &[PeerResult<T>]) -> usize {
    received.iter().filter(|res| res.is_ok()).count()
}

/// Drive the given peer requests until `quorum` is satisfied by the responses received so far.
///
/// Resolves with every response received up to that point, including failures, so that the
/// caller may scan them (e.g. for higher terms). Resolves with an error if the deadline elapses
/// first, if there are no requests to drive, or if every request resolves without `quorum`
/// ever being satisfied.
#[tracing::instrument(level = "trace", skip(futures, quorum))]
pub(crate) async fn collect_until<T, Fut, Q>(
    futures: Vec<Fut>,
    ttl: Duration,
    quorum: Q,
) -> Result<Vec<PeerResult<T>>, CollectError>
where
    Fut: Future<Output = PeerResult<T>> + Send,
    Q: Fn(&[PeerResult<T>]) -> bool,
{
    if quorum(&[]) {
        return Ok(Vec::new());
    }
    if futures.is_empty() {
        return Err(CollectError::NoPeers);
    }

    let mut pending: FuturesUnordered<Fut> = futures.into_iter().collect();
    let mut received = Vec::with_capacity(pending.len());

    let deadline = tokio::time::sleep(ttl);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = &mut deadline => {
                tracing::debug!(received = received.len(), "deadline elapsed while collecting responses");
                return Err(CollectError::Timeout);
            }
            res = pending.next() => match res {
                Some(outcome) => {
                    received.push(outcome);
                    if quorum(&received) {
                        return Ok(received);
                    }
                }
                None => return Err(CollectError::InsufficientResponses),
            }
        }
    }
}

/// Collect responses until `needed` of them have arrived successfully.
pub(crate) async fn collect_majority<T, Fut>(
    futures: Vec<Fut>,
    needed: usize,
    ttl: Duration,
) -> Result<Vec<PeerResult<T>>, CollectError>
where
    Fut: Future<Output = PeerResult<T>> + Send,
{
    collect_until(futures, ttl, |received| successes(received) >= needed).await
}

/// Same as `collect_until`, with a handle through which the collection may be cancelled.
///
/// Cancelling drops every pending inner future and resolves the collection with
/// `CollectError::Cancelled`.
pub(crate) fn collect_until_cancellable<T, Fut, Q>(
    futures: Vec<Fut>,
    ttl: Duration,
    quorum: Q,
) -> (AbortHandle, impl Future<Output = Result<Vec<PeerResult<T>>, CollectError>>)
where
    Fut: Future<Output = PeerResult<T>> + Send,
    Q: Fn(&[PeerResult<T>]) -> bool,
{
    let (handle, reg) = AbortHandle::new_pair();
    let fut = Abortable::new(collect_until(futures, ttl, quorum), reg);
    let fut = async move {
        match fut.await {
            Ok(res) => res,
            Err(_aborted) => Err(CollectError::Cancelled),
        }
    };
    (handle, fut)
}
