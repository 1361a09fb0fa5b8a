// src/rabbitmq/connection.rs
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use tokio::sync::{watch, Mutex as AsyncMutex};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use super::broker::{BrokerPtr, ConnectionPtr};
use super::errors::Result;
use crate::config::Settings;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Owns the one broker connection shared by every channel.
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

struct Inner {
    broker: BrokerPtr,
    uri: String,
    reconnect_delay: Duration,
    check_interval: Duration,
    console_status: bool,
    // held for the whole connect loop, so late callers queue up behind it
    attempt: AsyncMutex<()>,
    // never held across an await
    connection: Mutex<Option<ConnectionPtr>>,
    state: watch::Sender<ConnectionState>,
}

impl Inner {
    /// The live connection, dropping a dead one from the slot.
    fn current(&self) -> Option<ConnectionPtr> {
        let mut slot = lock(&self.connection);
        match slot.as_ref() {
            Some(conn) if conn.is_connected() => Some(conn.clone()),
            Some(_) => {
                warn!("RabbitMQ connection was closed, reconnecting");
                *slot = None;
                None
            }
            None => None,
        }
    }
}

impl ConnectionManager {
    pub fn new(broker: BrokerPtr, settings: &Settings) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        ConnectionManager {
            inner: Arc::new(Inner {
                broker,
                uri: settings.url.clone(),
                reconnect_delay: settings.retries_interval(),
                check_interval: settings.connection_check_interval(),
                console_status: settings.console_status,
                attempt: AsyncMutex::new(()),
                connection: Mutex::new(None),
                state,
            }),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    /// Receives every state transition.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Returns the open connection, establishing it first if needed.
    ///
    /// Never fails: connection errors are logged and retried every
    /// `retries_interval` until the broker accepts. Callers arriving while
    /// an attempt is running wait for that attempt instead of starting one.
    pub async fn get_connection(&self) -> ConnectionPtr {
        if let Some(conn) = self.inner.current() {
            return conn;
        }

        let _attempt = self.inner.attempt.lock().await;
        if let Some(conn) = self.inner.current() {
            return conn;
        }

        self.inner.state.send_replace(ConnectionState::Connecting);
        let conn = self.establish_connection().await;
        *lock(&self.inner.connection) = Some(conn.clone());
        self.inner.state.send_replace(ConnectionState::Connected);

        spawn_watchdog(Arc::downgrade(&self.inner), conn.clone());
        conn
    }

    async fn establish_connection(&self) -> ConnectionPtr {
        let mut attempts: u64 = 0;

        loop {
            debug!("Attempting to connect to RabbitMQ");

            match self.inner.broker.connect(&self.inner.uri).await {
                Ok(conn) => {
                    info!(attempts = attempts + 1, "Successfully connected to RabbitMQ");
                    return conn;
                }
                Err(err) => {
                    attempts += 1;
                    if self.inner.console_status {
                        error!(
                            "RABBITMQ({}): Failed to connect, retry in {:?}: {}",
                            attempts, self.inner.reconnect_delay, err
                        );
                    } else {
                        debug!(attempts, error = %err, "Failed to connect to RabbitMQ");
                    }
                    sleep(self.inner.reconnect_delay).await;
                }
            }
        }
    }

    /// Closes the connection if there is one.
    ///
    /// Returns at once when no connection is open. A connect attempt that is
    /// still retrying keeps going for the callers waiting on it.
    pub async fn disconnect(&self) -> Result<()> {
        let conn = lock(&self.inner.connection).take();
        if let Some(conn) = conn {
            info!("Closing RabbitMQ connection");
            self.inner.state.send_replace(ConnectionState::Disconnected);
            conn.close().await?;
        }
        Ok(())
    }
}

/// Clears the slot when the broker drops `conn` behind our back.
fn spawn_watchdog(inner: Weak<Inner>, conn: ConnectionPtr) {
    tokio::spawn(async move {
        loop {
            let interval = match inner.upgrade() {
                Some(inner) => inner.check_interval,
                None => return,
            };
            sleep(interval).await;

            if conn.is_connected() {
                continue;
            }
            let Some(inner) = inner.upgrade() else {
                return;
            };
            let mut slot = lock(&inner.connection);
            if slot.as_ref().is_some_and(|current| Arc::ptr_eq(current, &conn)) {
                *slot = None;
                inner.state.send_replace(ConnectionState::Disconnected);
                warn!("RabbitMQ connection closed by the broker");
            }
            return;
        }
    });
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
