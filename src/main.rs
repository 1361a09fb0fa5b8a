// src/main.rs
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use rabbitmq_rpc::config::load_settings;
use rabbitmq_rpc::logging::init_tracing;
use rabbitmq_rpc::{ListenOptions, RabbitMQClient, RpcCall, StopOptions};

const DEMO_QUEUE: &str = "rpc.demo";

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Greeting {
    name: String,
    wait_time_to_return: u64,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GreetingReply {
    greeting: String,
    times_called: u32,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // a config file takes precedence over the environment
    let settings = load_settings()?;
    init_tracing(&settings);

    let client = RabbitMQClient::new(settings);
    let times_called = Arc::new(AtomicU32::new(0));

    let listener = client
        .listen_procedure_call(ListenOptions::new(DEMO_QUEUE), move |call| {
            let times_called = times_called.clone();
            async move {
                let request: Greeting = call.payload;
                tokio::time::sleep(std::time::Duration::from_millis(request.wait_time_to_return)).await;
                Ok::<_, anyhow::Error>(GreetingReply {
                    greeting: format!("Hello, {}", request.name),
                    times_called: times_called.fetch_add(1, Ordering::SeqCst) + 1,
                })
            }
        })
        .await?;

    for name in ["producer", "consumer"] {
        let request = Greeting {
            name: name.to_string(),
            wait_time_to_return: 0,
        };
        let reply: Option<GreetingReply> = client
            .remote_procedure_call(RpcCall::new(DEMO_QUEUE, "default", &request))
            .await?;
        match reply {
            Some(reply) => info!(greeting = %reply.greeting, times_called = reply.times_called, "Got reply"),
            None => warn!("Listener returned no value"),
        }
    }

    info!("Listening on {}, press Ctrl-C to stop", DEMO_QUEUE);
    tokio::signal::ctrl_c().await?;

    listener.stop(StopOptions {
        disconnect_after_stop: true,
    });
    listener.join().await?;
    Ok(())
}
