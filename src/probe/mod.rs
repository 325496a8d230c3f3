//! Validation stages
//!
//! - Stage 1 [`reachability`]: ICMP + TCP connect
//! - Stage 2 [`protocol`]: TLS / websocket / silent-server / datagram probes
//! - Stage 3 [`core`]: end-to-end request through a local proxy core
//!
//! All stages fan out through [`run_bounded`].

pub mod core;
pub mod protocol;
pub mod reachability;

pub use self::core::{CoreConfig, CoreStats, CoreValidator};
pub use protocol::{ProbeKind, ProtocolConfig, ProtocolProber};
pub use reachability::{ReachabilityConfig, ReachabilityProber};

use futures::stream::{self, StreamExt};
use std::future::Future;
use tokio::time::Instant;
use tracing::warn;

/// Run `f` over `items` with at most `concurrency` futures in flight.
///
/// Results land in the slot of their input position. When `deadline` passes,
/// in-flight futures are dropped and their slots stay `None`.
pub async fn run_bounded<T, R, F, Fut>(
    items: Vec<T>,
    concurrency: usize,
    deadline: Option<Instant>,
    f: F,
) -> Vec<Option<R>>
where
    F: Fn(T) -> Fut,
    Fut: Future<Output = R>,
{
    let mut slots: Vec<Option<R>> = (0..items.len()).map(|_| None).collect();

    let work = stream::iter(items.into_iter().enumerate())
        .map(|(index, item)| {
            let fut = f(item);
            async move { (index, fut.await) }
        })
        .buffer_unordered(concurrency.max(1));
    futures::pin_mut!(work);

    loop {
        let next = match deadline {
            Some(deadline) if Instant::now() >= deadline => None,
            Some(deadline) => tokio::time::timeout_at(deadline, work.next())
                .await
                .unwrap_or(None),
            None => work.next().await,
        };

        match next {
            Some((index, result)) => slots[index] = Some(result),
            None => break,
        }
    }

    let unfinished = slots.iter().filter(|s| s.is_none()).count();
    if unfinished > 0 {
        warn!("run deadline reached with {} items unfinished", unfinished);
    }

    slots
}
