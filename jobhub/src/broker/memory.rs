//! Provides an in memory implementation of [`Broker`].
//!
//! Messages live only as long as the process. It is correct rather than fast and is primarily meant
//! for tests and single process setups.
use std::{
    cmp::{Ordering, Reverse},
    collections::{BinaryHeap, VecDeque},
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use async_trait::async_trait;
use tokio::{sync::Notify, time::Instant};

use crate::job::Lane;

use super::{Broker, BrokerError, Delivery, TaskRef};

/// An in memory implementation of [`Broker`].
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    state: Mutex<State>,
    notify: Notify,
}

#[derive(Default)]
struct State {
    lanes: [VecDeque<TaskRef>; 3],
    delayed: BinaryHeap<Reverse<Delayed>>,
    sequence: u64,
    closed: bool,
}

struct Delayed {
    visible_at: Instant,
    sequence: u64,
    lane: Lane,
    task: TaskRef,
}

impl PartialEq for Delayed {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Delayed {}

impl PartialOrd for Delayed {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Delayed {
    fn cmp(&self, other: &Self) -> Ordering {
        self.visible_at
            .cmp(&other.visible_at)
            .then(self.sequence.cmp(&other.sequence))
    }
}

impl State {
    fn promote_due(&mut self, now: Instant) {
        while self
            .delayed
            .peek()
            .is_some_and(|Reverse(delayed)| delayed.visible_at <= now)
        {
            if let Some(Reverse(delayed)) = self.delayed.pop() {
                self.lanes[delayed.lane.index()].push_back(delayed.task);
            }
        }
    }

    fn pop(&mut self) -> Option<Delivery> {
        Lane::ALL.into_iter().find_map(|lane| {
            self.lanes[lane.index()]
                .pop_front()
                .map(|task| Delivery { lane, task })
        })
    }

    fn next_visible_at(&self) -> Option<Instant> {
        self.delayed.peek().map(|Reverse(delayed)| delayed.visible_at)
    }
}

impl InMemoryBroker {
    /// Creates a new instance of [`InMemoryBroker`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Stops accepting messages. Any further publish or receive fails with [`BrokerError::Closed`].
    pub fn close(&self) {
        if let Ok(mut state) = self.inner.state.lock() {
            state.closed = true;
        }
        self.inner.notify.notify_waiters();
    }

    fn state(&self) -> Result<MutexGuard<'_, State>, BrokerError> {
        let state = self.inner.state.lock().map_err(|_| BrokerError::BadState)?;
        if state.closed {
            return Err(BrokerError::Closed);
        }
        Ok(state)
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn publish(
        &self,
        lane: Lane,
        task: TaskRef,
        delay: Option<Duration>,
    ) -> Result<(), BrokerError> {
        {
            let mut state = self.state()?;
            match delay {
                Some(delay) if !delay.is_zero() => {
                    state.sequence += 1;
                    let sequence = state.sequence;
                    state.delayed.push(Reverse(Delayed {
                        visible_at: Instant::now() + delay,
                        sequence,
                        lane,
                        task,
                    }));
                }
                _ => state.lanes[lane.index()].push_back(task),
            }
        }
        self.inner.notify.notify_one();
        Ok(())
    }

    async fn receive(&self, wait: Duration) -> Result<Option<Delivery>, BrokerError> {
        let deadline = Instant::now() + wait;
        loop {
            let next_visible_at = {
                let mut state = self.state()?;
                state.promote_due(Instant::now());
                if let Some(delivery) = state.pop() {
                    return Ok(Some(delivery));
                }
                state.next_visible_at()
            };
            if Instant::now() >= deadline {
                return Ok(None);
            }
            let wake_at = next_visible_at.map_or(deadline, |at| at.min(deadline));
            tokio::select! {
                _ = self.inner.notify.notified() => {},
                _ = tokio::time::sleep_until(wake_at) => {},
            }
        }
    }

    async fn pending(&self, lane: Lane) -> Result<usize, BrokerError> {
        let state = self.state()?;
        let delayed = state
            .delayed
            .iter()
            .filter(|Reverse(delayed)| delayed.lane == lane)
            .count();
        Ok(state.lanes[lane.index()].len() + delayed)
    }
}

#[cfg(test)]
mod test {
    use assert_matches::assert_matches;

    use super::*;
    use crate::{broker_test_suite, job::JobId};

    broker_test_suite!(for: InMemoryBroker::new());

    mod multi_thread {
        use super::*;

        broker_test_suite!(
            #[cfg_attr(miri, ignore)]
            attr: tokio::test(flavor = "multi_thread", worker_threads = 2),
            args: (),
            broker: InMemoryBroker::new()
        );
    }

    #[tokio::test]
    async fn closed_broker_rejects_messages() {
        let broker = InMemoryBroker::new();
        broker.close();

        let result = broker
            .publish(
                Lane::Default,
                TaskRef {
                    job_id: JobId::new(),
                    task_type: "echo".to_owned(),
                },
                None,
            )
            .await;

        assert_matches!(result, Err(BrokerError::Closed));
        assert_matches!(
            broker.receive(Duration::from_millis(1)).await,
            Err(BrokerError::Closed)
        );
    }

    #[tokio::test]
    async fn close_wakes_waiting_receivers() {
        let broker = InMemoryBroker::new();
        let receiver = tokio::spawn({
            let broker = broker.clone();
            async move { broker.receive(Duration::from_secs(30)).await }
        });
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        broker.close();

        let result = tokio::time::timeout(Duration::from_secs(1), receiver)
            .await
            .expect("receiver should wake up")
            .unwrap();
        assert_matches!(result, Err(BrokerError::Closed));
    }
}
