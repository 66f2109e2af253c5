//! Test suite for ensuring a correct implementation of a [`Broker`].
use std::time::Duration;

use crate::job::{JobId, Lane};

use super::*;

const WAIT: Duration = Duration::from_millis(200);

fn task(task_type: &str) -> TaskRef {
    TaskRef {
        job_id: JobId::new(),
        task_type: task_type.to_owned(),
    }
}

/// Create test suite for a [`Broker`] implementation.
///
/// # Example
///
/// ```
/// use jobhub::broker_test_suite;
/// use jobhub::broker::memory::InMemoryBroker;
/// broker_test_suite!(for: InMemoryBroker::new());
/// ```
///
/// Extra attributes, such as `#[ignore]` for brokers that need external services, go first:
///
/// ```ignore
/// use jobhub::broker_test_suite;
/// broker_test_suite!(
///     #[ignore = "requires redis"]
///     attr: tokio::test,
///     args: (),
///     broker: RedisBroker::connect(URL, "test").await.unwrap()
/// );
/// ```
#[macro_export]
macro_rules! broker_test_suite {
    (for: $broker:expr) => {
        $crate::broker_test_suite!(attr: tokio::test, args: (), broker: $broker);
    };
    ($(#[$extra:meta])* attr: $attr:meta, args: $args:tt, broker: $broker:expr) => {
        $crate::broker_test_suite!(@tests [$(#[$extra])*] $attr, $args, $broker,
            publish_and_receive,
            receive_times_out_when_empty,
            receive_in_priority_order,
            receive_in_fifo_order_within_lane,
            delayed_messages_are_invisible_until_due,
            only_one_receiver_gets_a_message,
            receive_wakes_on_publish,
            pending_counts_visible_and_delayed
        );
    };
    (@tests $extras:tt $attr:meta, $args:tt, $broker:expr, $($name:ident),+) => {
        $(
            $crate::broker_test_suite!(@one $extras $attr, $args, $broker, $name);
        )+
    };
    (@one [$(#[$extra:meta])*] $attr:meta, $args:tt, $broker:expr, $name:ident) => {
        #[$attr]
        $(#[$extra])*
        async fn $name $args {
            let broker = $broker;
            $crate::broker::testing::$name(broker).await;
        }
    };
}

#[doc(hidden)]
pub async fn publish_and_receive(broker: impl Broker) {
    let sent = task("echo");
    broker
        .publish(Lane::Default, sent.clone(), None)
        .await
        .unwrap();

    let delivery = broker.receive(WAIT).await.unwrap().unwrap();

    assert_eq!(delivery.lane, Lane::Default);
    assert_eq!(delivery.task, sent);
    assert!(broker.receive(Duration::from_millis(10)).await.unwrap().is_none());
}

#[doc(hidden)]
pub async fn receive_times_out_when_empty(broker: impl Broker) {
    let start = tokio::time::Instant::now();

    assert!(broker.receive(Duration::from_millis(50)).await.unwrap().is_none());
    assert!(start.elapsed() >= Duration::from_millis(40));
}

#[doc(hidden)]
pub async fn receive_in_priority_order(broker: impl Broker) {
    let low = task("low");
    let default = task("default");
    let high = task("high");
    broker.publish(Lane::Low, low.clone(), None).await.unwrap();
    broker
        .publish(Lane::Default, default.clone(), None)
        .await
        .unwrap();
    broker.publish(Lane::High, high.clone(), None).await.unwrap();

    let first = broker.receive(WAIT).await.unwrap().unwrap();
    let second = broker.receive(WAIT).await.unwrap().unwrap();
    let third = broker.receive(WAIT).await.unwrap().unwrap();

    assert_eq!((first.lane, first.task), (Lane::High, high));
    assert_eq!((second.lane, second.task), (Lane::Default, default));
    assert_eq!((third.lane, third.task), (Lane::Low, low));
}

#[doc(hidden)]
pub async fn receive_in_fifo_order_within_lane(broker: impl Broker) {
    let tasks = (0..4).map(|i| task(&format!("task-{i}"))).collect::<Vec<_>>();
    for task in &tasks {
        broker.publish(Lane::Low, task.clone(), None).await.unwrap();
    }

    for expected in tasks {
        let delivery = broker.receive(WAIT).await.unwrap().unwrap();
        assert_eq!(delivery.task, expected);
    }
}

#[doc(hidden)]
pub async fn delayed_messages_are_invisible_until_due(broker: impl Broker) {
    let delayed = task("delayed");
    broker
        .publish(
            Lane::High,
            delayed.clone(),
            Some(Duration::from_millis(300)),
        )
        .await
        .unwrap();

    assert!(broker.receive(Duration::from_millis(50)).await.unwrap().is_none());

    let delivery = broker
        .receive(Duration::from_secs(3))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(delivery.lane, Lane::High);
    assert_eq!(delivery.task, delayed);
}

#[doc(hidden)]
pub async fn only_one_receiver_gets_a_message(broker: impl Broker + 'static) {
    let broker = std::sync::Arc::new(broker);
    let receivers = (0..4)
        .map(|_| {
            let broker = broker.clone();
            tokio::spawn(async move { broker.receive(Duration::from_millis(300)).await })
        })
        .collect::<Vec<_>>();
    tokio::time::sleep(Duration::from_millis(20)).await;

    broker
        .publish(Lane::Default, task("once"), None)
        .await
        .unwrap();

    let mut received = 0;
    for receiver in receivers {
        if receiver.await.unwrap().unwrap().is_some() {
            received += 1;
        }
    }
    assert_eq!(received, 1);
}

#[doc(hidden)]
pub async fn receive_wakes_on_publish(broker: impl Broker + 'static) {
    let broker = std::sync::Arc::new(broker);
    let receiver = tokio::spawn({
        let broker = broker.clone();
        async move { broker.receive(Duration::from_secs(5)).await }
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    let start = tokio::time::Instant::now();

    broker
        .publish(Lane::Default, task("wake"), None)
        .await
        .unwrap();

    let delivery = receiver.await.unwrap().unwrap();
    assert!(delivery.is_some());
    assert!(start.elapsed() < Duration::from_secs(2));
}

#[doc(hidden)]
pub async fn pending_counts_visible_and_delayed(broker: impl Broker) {
    broker.publish(Lane::Low, task("a"), None).await.unwrap();
    broker
        .publish(Lane::Low, task("b"), Some(Duration::from_secs(60)))
        .await
        .unwrap();
    broker.publish(Lane::High, task("c"), None).await.unwrap();

    assert_eq!(broker.pending(Lane::Low).await.unwrap(), 2);
    assert_eq!(broker.pending(Lane::High).await.unwrap(), 1);
    assert_eq!(broker.pending(Lane::Default).await.unwrap(), 0);
}
