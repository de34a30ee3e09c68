use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::ClientError;

/// The single flag both periodic loops share so that at most one re-registration
/// runs at a time.
#[derive(Clone, Default)]
pub struct ReRegistrationGate {
    in_flight: Arc<AtomicBool>,
}

impl ReRegistrationGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomically claim the gate. Returns `None` if a re-registration is already running.
    pub fn try_acquire(&self) -> Option<GateGuard> {
        self.in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| GateGuard {
                in_flight: self.in_flight.clone(),
            })
    }

    pub fn is_held(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }
}

/// Releases the gate when dropped.
pub struct GateGuard {
    in_flight: Arc<AtomicBool>,
}

impl Drop for GateGuard {
    fn drop(&mut self) {
        self.in_flight.store(false, Ordering::Release);
    }
}

/// Run `tick` every `period` until it fails or `token` is cancelled.
///
/// The first tick fires one period after the loop starts. A tick only starts once the
/// previous one has resolved; ticks that come due in the meantime are skipped, as are
/// ticks that come due while a re-registration holds `gate`. Cancellation wins over a
/// pending tick and abandons an in-flight one.
///
/// Returns the error that stopped the loop, or `None` if it was cancelled.
pub async fn run_periodic<F, Fut>(
    name: &'static str,
    period: time::Duration,
    token: CancellationToken,
    gate: ReRegistrationGate,
    mut tick: F,
) -> Option<ClientError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(), ClientError>>,
{
    let period = period.max(time::Duration::from_millis(1));
    let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => {
                debug!("{} loop cancelled", name);
                return None;
            }
            _ = interval.tick() => {}
        }

        if gate.is_held() {
            debug!("{} tick dropped, re-registration in flight", name);
            continue;
        }

        let result = tokio::select! {
            biased;
            _ = token.cancelled() => {
                debug!("{} loop cancelled with a tick in flight", name);
                return None;
            }
            result = tick() => result,
        };

        if let Err(error) = result {
            warn!("{} loop stopped: {}", name, error);
            return Some(error);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::error::RequestError;

    #[test]
    fn test_gate_is_exclusive() {
        let gate = ReRegistrationGate::new();

        let guard = gate.try_acquire().expect("gate should be free");
        assert!(gate.is_held());
        assert!(gate.clone().try_acquire().is_none());

        drop(guard);
        assert!(!gate.is_held());
        assert!(gate.try_acquire().is_some());
    }

    #[tokio::test]
    async fn test_stops_on_first_failure() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = ticks.clone();

        let failure = run_periodic(
            "test",
            time::Duration::from_millis(10),
            CancellationToken::new(),
            ReRegistrationGate::new(),
            || {
                let counter = counter.clone();
                async move {
                    match counter.fetch_add(1, Ordering::SeqCst) {
                        0 | 1 => Ok(()),
                        _ => Err(ClientError::HeartbeatFailure(RequestError::ClientRejected(
                            http::StatusCode::UNAUTHORIZED,
                        ))),
                    }
                }
            },
        )
        .await;

        assert!(matches!(failure, Some(ClientError::HeartbeatFailure(_))));
        assert_eq!(ticks.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_cancellation_abandons_in_flight_tick() {
        let token = CancellationToken::new();
        let cancel = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(time::Duration::from_millis(50)).await;
            cancel.cancel();
        });

        let failure = run_periodic(
            "test",
            time::Duration::from_millis(10),
            token,
            ReRegistrationGate::new(),
            || async {
                tokio::time::sleep(time::Duration::from_secs(60)).await;
                Ok(())
            },
        )
        .await;

        assert!(failure.is_none());
    }

    #[tokio::test]
    async fn test_ticks_are_dropped_while_gate_is_held() {
        let gate = ReRegistrationGate::new();
        let guard = gate.try_acquire().expect("gate should be free");
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = ticks.clone();
        let token = CancellationToken::new();

        let handle = tokio::spawn(run_periodic(
            "test",
            time::Duration::from_millis(10),
            token.clone(),
            gate.clone(),
            move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            },
        ));

        tokio::time::sleep(time::Duration::from_millis(60)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 0);

        drop(guard);
        tokio::time::sleep(time::Duration::from_millis(60)).await;
        assert!(ticks.load(Ordering::SeqCst) > 0);

        token.cancel();
        assert!(handle.await.expect("loop panicked").is_none());
    }
}
