// End-to-end RPC behaviour against the in-memory broker.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use rabbitmq_rpc::rabbitmq::{
    ConnectionState, ExchangeSpec, ExchangeType, MemoryBroker, QueueSpec,
};
use rabbitmq_rpc::{
    ListenOptions, ListenerState, RabbitMQClient, RabbitMQError, RpcCall, Settings, StopOptions,
};

fn test_settings() -> Settings {
    Settings {
        retries_interval_ms: 10,
        connection_check_interval_ms: 10,
        rpc_timeout_ms: 5_000,
        ..Settings::default()
    }
}

fn client_with(settings: Settings) -> (MemoryBroker, RabbitMQClient) {
    let broker = MemoryBroker::new();
    let client = RabbitMQClient::with_broker(settings, Arc::new(broker.clone()));
    (broker, client)
}

fn client() -> (MemoryBroker, RabbitMQClient) {
    client_with(test_settings())
}

async fn eventually<F: Fn() -> bool>(condition: F) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[derive(Debug, Serialize, Deserialize)]
struct Number {
    n: i64,
}

async fn listen_doubler(client: &RabbitMQClient, queue: &str) -> rabbitmq_rpc::ListenerHandle {
    client
        .listen_procedure_call(ListenOptions::new(queue), |call| async move {
            let Number { n } = call.payload;
            if n < 0 {
                return Err(anyhow!("negative input {}", n));
            }
            Ok(Number { n: n * 2 })
        })
        .await
        .unwrap()
}

#[tokio::test]
async fn test_round_trip_returns_handler_result() {
    let (_broker, client) = client();
    let _listener = listen_doubler(&client, "math").await;

    let reply: Option<Value> = client
        .remote_procedure_call(RpcCall::new("math", "default", &Number { n: 21 }))
        .await
        .unwrap();

    assert_eq!(reply, Some(json!({"n": 42})));
    assert_eq!(client.connection_state(), ConnectionState::Connected);
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Greeting {
    name: String,
    wait_time_to_return: u64,
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Called {
    times_called: u32,
}

#[tokio::test]
async fn test_times_called_scenario() {
    let (_broker, client) = client();
    let counter = Arc::new(AtomicU32::new(0));

    let handler_counter = counter.clone();
    let _listener = client
        .listen_procedure_call(ListenOptions::new("greeter"), move |call| {
            let counter = handler_counter.clone();
            async move {
                let Greeting { wait_time_to_return, .. } = call.payload;
                tokio::time::sleep(Duration::from_millis(wait_time_to_return)).await;
                Ok::<_, anyhow::Error>(Called {
                    times_called: counter.fetch_add(1, Ordering::SeqCst) + 1,
                })
            }
        })
        .await
        .unwrap();

    let request = Greeting {
        name: "x".to_string(),
        wait_time_to_return: 0,
    };
    for expected in 1..=2 {
        let reply: Option<Called> = client
            .remote_procedure_call(RpcCall::new("greeter", "default", &request))
            .await
            .unwrap();
        assert_eq!(reply, Some(Called { times_called: expected }));
    }
    assert_eq!(counter.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_ignore_return_leaves_reply_unconsumed() {
    let (broker, client) = client();
    let _listener = listen_doubler(&client, "math").await;

    let reply: Option<Value> = client
        .remote_procedure_call(RpcCall::new("math", "default", &Number { n: 1 }).ignore_return(true))
        .await
        .unwrap();
    assert!(reply.is_none());

    eventually(|| broker.queue_len("math.return") == Some(1)).await;
    assert!(!client.vault().is_consuming("math.return"));
    assert_eq!(client.vault().pending_calls("math.return"), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_calls_get_their_own_reply() {
    let (broker, client) = client();
    let _listener = listen_doubler(&client, "math").await;

    let calls: Vec<_> = (0..25)
        .map(|n| {
            let client = client.clone();
            tokio::spawn(async move {
                let request = Number { n };
                let reply: Option<Number> = client
                    .remote_procedure_call(RpcCall::new("math", "default", &request))
                    .await
                    .unwrap();
                (n, reply.unwrap().n)
            })
        })
        .collect();

    for call in calls {
        let (n, doubled) = call.await.unwrap();
        assert_eq!(doubled, n * 2);
    }
    assert_eq!(client.vault().pending_calls("math.return"), 0);
    assert_eq!(broker.stats().connections_opened, 1);
    assert_eq!(broker.stats().requeued, 0);
}

#[derive(Debug, Serialize)]
struct Tally {
    // Cell is Send but not Sync
    count: std::cell::Cell<i64>,
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_reply_type_need_not_be_sync() {
    let (_broker, client) = client();
    let _listener = client
        .listen_procedure_call(ListenOptions::new("tally"), |call| async move {
            let Number { n } = call.payload;
            let tally = Tally {
                count: std::cell::Cell::new(n),
            };
            tally.count.set(tally.count.get() + 1);
            Ok::<_, anyhow::Error>(tally)
        })
        .await
        .unwrap();

    let reply: Option<Value> = client
        .remote_procedure_call(RpcCall::new("tally", "default", &Number { n: 41 }))
        .await
        .unwrap();
    assert_eq!(reply, Some(json!({"count": 42})));
}

#[tokio::test]
async fn test_null_reply_is_none() {
    let (_broker, client) = client();
    let _listener = client
        .listen_procedure_call(ListenOptions::new("lookup"), |_call: rabbitmq_rpc::ListenCall<Value>| async {
            Ok::<_, anyhow::Error>(None::<String>)
        })
        .await
        .unwrap();

    let reply: Option<String> = client
        .remote_procedure_call(RpcCall::new("lookup", "default", &json!({"id": 7})))
        .await
        .unwrap();
    assert!(reply.is_none());
}

#[tokio::test]
async fn test_stop_leaves_remaining_requests_queued() {
    let (broker, client) = client();

    // same topology the listener asserts, so requests can be queued first
    client
        .assert_exchange(&ExchangeSpec::new("jobs", ExchangeType::Topic).durable())
        .await
        .unwrap();
    client.assert_queue(&QueueSpec::durable("jobs")).await.unwrap();
    client.bind_queue("jobs", "jobs", "*").await.unwrap();
    for n in 0..3 {
        client.publish("jobs", "default", &Number { n }).await.unwrap();
    }
    assert_eq!(broker.queue_len("jobs"), Some(3));

    let handled = Arc::new(AtomicU32::new(0));
    let counter = handled.clone();
    let listener = client
        .listen_procedure_call(ListenOptions::new("jobs"), move |call| {
            let counter = counter.clone();
            async move {
                let Number { n } = call.payload;
                counter.fetch_add(1, Ordering::SeqCst);
                call.stop.stop(StopOptions::default());
                Ok::<_, anyhow::Error>(n)
            }
        })
        .await
        .unwrap();

    let stop = listener.stop_handle();
    tokio::time::timeout(Duration::from_secs(2), listener.join())
        .await
        .unwrap()
        .unwrap();

    assert_eq!(stop.state(), ListenerState::Stopped);
    assert_eq!(handled.load(Ordering::SeqCst), 1);
    assert_eq!(broker.queue_len("jobs"), Some(2));
    assert_eq!(client.connection_state(), ConnectionState::Connected);
}

#[tokio::test]
async fn test_disconnect_after_stop() {
    let (_broker, client) = client();
    let listener = listen_doubler(&client, "math").await;
    assert_eq!(listener.state(), ListenerState::Running);

    listener.stop(StopOptions {
        disconnect_after_stop: true,
    });
    let stop = listener.stop_handle();
    listener.join().await.unwrap();

    assert_eq!(stop.state(), ListenerState::Stopped);
    assert_eq!(client.connection_state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_exclusive_reply_channel_is_released() {
    let (broker, client) = client();
    let _listener = listen_doubler(&client, "math").await;

    let reply: Option<Number> = client
        .remote_procedure_call(
            RpcCall::new("math", "default", &Number { n: 5 }).exclusive_return_channel(true),
        )
        .await
        .unwrap();
    assert_eq!(reply.unwrap().n, 10);

    assert!(broker
        .queue_names()
        .iter()
        .all(|name| !name.starts_with("math.return.")));
    assert!(!client.vault().is_consuming("math.return"));
}

#[tokio::test]
async fn test_timeout_then_late_reply_is_discarded() {
    let (broker, client) = client();
    let _listener = client
        .listen_procedure_call(ListenOptions::new("slow"), |call| async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok::<Value, anyhow::Error>(call.payload)
        })
        .await
        .unwrap();

    let err = client
        .remote_procedure_call::<_, Value>(
            RpcCall::new("slow", "default", &json!("late")).timeout(Duration::from_millis(20)),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, RabbitMQError::TimeoutError(_)));
    assert_eq!(client.vault().pending_calls("slow.return"), 0);

    // requeued once for another consumer, then dropped
    eventually(|| broker.stats().nacked == 2).await;
    assert_eq!(broker.stats().requeued, 1);
    assert_eq!(broker.queue_len("slow.return"), Some(0));
}

#[tokio::test]
async fn test_handler_error_rejects_without_reply() {
    let (broker, client) = client();
    let listener = listen_doubler(&client, "math").await;

    let err = client
        .remote_procedure_call::<_, Number>(
            RpcCall::new("math", "default", &Number { n: -1 }).timeout(Duration::from_millis(50)),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, RabbitMQError::TimeoutError(_)));
    assert_eq!(broker.stats().nacked, 1);
    assert_eq!(broker.stats().requeued, 0);
    assert_eq!(broker.queue_len("math"), Some(0));
    assert_eq!(broker.queue_len("math.return"), Some(0));

    // the loop keeps serving
    assert_eq!(listener.state(), ListenerState::Running);
    let reply: Option<Number> = client
        .remote_procedure_call(RpcCall::new("math", "default", &Number { n: 4 }))
        .await
        .unwrap();
    assert_eq!(reply.unwrap().n, 8);
}

#[tokio::test]
async fn test_undecodable_and_panicking_requests_are_rejected() {
    let (broker, client) = client();
    let _listener = client
        .listen_procedure_call(ListenOptions::new("fragile"), |call| async move {
            let Number { n } = call.payload;
            if n == 13 {
                panic!("unlucky");
            }
            Ok::<_, anyhow::Error>(n)
        })
        .await
        .unwrap();

    client
        .publish("fragile", "default", &json!("not a number"))
        .await
        .unwrap();
    let err = client
        .remote_procedure_call::<_, i64>(
            RpcCall::new("fragile", "default", &Number { n: 13 }).timeout(Duration::from_millis(50)),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, RabbitMQError::TimeoutError(_)));
    assert_eq!(broker.stats().nacked, 2);

    let reply: Option<i64> = client
        .remote_procedure_call(RpcCall::new("fragile", "default", &Number { n: 3 }))
        .await
        .unwrap();
    assert_eq!(reply, Some(3));
}

#[tokio::test]
async fn test_routing_key_prefix_round_trip() {
    let (broker, client) = client_with(Settings {
        routing_key_prefix: Some("api".to_string()),
        ..test_settings()
    });
    let _listener = listen_doubler(&client, "math").await;

    assert_eq!(
        broker.bindings("math"),
        vec![("math".to_string(), "api.*".to_string())]
    );
    let reply: Option<Number> = client
        .remote_procedure_call(RpcCall::new("math", "default", &Number { n: 6 }))
        .await
        .unwrap();
    assert_eq!(reply.unwrap().n, 12);
}

#[tokio::test]
async fn test_no_reply_when_return_value_disabled() {
    let (broker, client) = client();
    let _listener = client
        .listen_procedure_call(
            ListenOptions::new("sink").return_value(false),
            |call: rabbitmq_rpc::ListenCall<Value>| async move { Ok::<_, anyhow::Error>(call.payload) },
        )
        .await
        .unwrap();

    client
        .remote_procedure_call::<_, Value>(RpcCall::new("sink", "default", &json!(1)).ignore_return(true))
        .await
        .unwrap();

    eventually(|| broker.stats().acked == 1).await;
    assert_eq!(broker.queue_len("sink.return"), Some(0));
}

#[tokio::test]
async fn test_assert_queue_twice_equals_once() {
    let (broker, client) = client();
    let first = client.assert_queue(&QueueSpec::durable("audit")).await.unwrap();
    let second = client.assert_queue(&QueueSpec::durable("audit")).await.unwrap();

    assert_eq!(first, second);
    assert_eq!(broker.queue_names(), vec!["audit".to_string()]);
}

#[tokio::test]
async fn test_reconnects_after_broker_drops_connection() {
    let (broker, client) = client();
    client.get_connection().await;

    broker.drop_connections().await;
    eventually(|| client.connection_state() == ConnectionState::Disconnected).await;

    let _listener = listen_doubler(&client, "math").await;
    let reply: Option<Number> = client
        .remote_procedure_call(RpcCall::new("math", "default", &Number { n: 1 }))
        .await
        .unwrap();
    assert_eq!(reply.unwrap().n, 2);
    assert_eq!(broker.stats().connections_opened, 2);
}
