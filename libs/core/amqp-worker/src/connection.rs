//! Connection management
//!
//! Owns the broker connection of one worker and the channels bound on it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::instrument::WithSubscriber;
use tracing::{error, info, warn};
use url::Url;

use crate::broker::{Broker, BrokerConnection, ConnectionSignal};
use crate::channel::{BoundChannel, LossHandler};
use crate::error::WorkerError;

/// Append `heartbeat=<secs>` to the broker URL, replacing any existing value.
///
/// Other query parameters and the fragment are kept in order.
pub fn connection_url(broker_url: &str, heartbeat: Duration) -> Result<String, WorkerError> {
    let mut url = Url::parse(broker_url).map_err(|e| WorkerError::config(format!("Invalid broker URL: {}", e)))?;

    let params: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(key, _)| !key.eq_ignore_ascii_case("heartbeat"))
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect();
    url.query_pairs_mut()
        .clear()
        .extend_pairs(params)
        .append_pair("heartbeat", &heartbeat.as_secs().to_string());

    Ok(url.into())
}

/// Channels bound so far; once sealed for shutdown no more are accepted
#[derive(Default)]
struct ChannelSet {
    bound: Vec<Arc<BoundChannel>>,
    sealed: bool,
}

/// Connection of one worker and the channels it owns
pub struct ConnectionManager {
    broker: Arc<dyn Broker>,
    connection: Mutex<Option<Arc<dyn BrokerConnection>>>,
    channels: Mutex<ChannelSet>,
    /// Set once the broker reported the connection closed or failed
    lost: Arc<AtomicBool>,
    signal_task: Mutex<Option<JoinHandle<()>>>,
}

fn guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl ConnectionManager {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self {
            broker,
            connection: Mutex::new(None),
            channels: Mutex::new(ChannelSet::default()),
            lost: Arc::new(AtomicBool::new(false)),
            signal_task: Mutex::new(None),
        }
    }

    /// Open the connection and start logging its signals.
    ///
    /// `on_lost` runs when the broker closes or fails the connection on its own.
    pub(crate) async fn connect(
        &self,
        broker_url: &str,
        heartbeat: Duration,
        on_lost: LossHandler,
    ) -> Result<Arc<dyn BrokerConnection>, WorkerError> {
        let heartbeat_secs = heartbeat.as_secs();
        let url = connection_url(broker_url, heartbeat).inspect_err(|e| {
            error!(error = %e, heartbeat = heartbeat_secs, "Connection to broker failed");
        })?;

        let connection = match self.broker.connect(&url).await {
            Ok(connection) => connection,
            Err(e) => {
                error!(error = %e, heartbeat = heartbeat_secs, "Connection to broker failed");
                return Err(e);
            }
        };
        info!(heartbeat = heartbeat_secs, "Connected to broker");

        self.lost.store(false, Ordering::SeqCst);
        let signals = connection.signals();
        let task = tokio::spawn(watch_signals(signals, self.lost.clone(), on_lost).with_current_subscriber());
        if let Some(previous) = guard(&self.signal_task).replace(task) {
            previous.abort();
        }
        *guard(&self.connection) = Some(connection.clone());

        Ok(connection)
    }

    pub fn connection(&self) -> Option<Arc<dyn BrokerConnection>> {
        guard(&self.connection).clone()
    }

    /// Keep a freshly bound channel for shutdown.
    ///
    /// After [`seal`](Self::seal) the channel is handed back so the caller
    /// can close it.
    pub(crate) fn track(&self, channel: BoundChannel) -> Result<(), Arc<BoundChannel>> {
        let channel = Arc::new(channel);
        let mut channels = guard(&self.channels);
        if channels.sealed {
            return Err(channel);
        }
        channels.bound.push(channel);
        Ok(())
    }

    /// Refuse further channels and return the ones bound so far
    pub(crate) fn seal(&self) -> Vec<Arc<BoundChannel>> {
        let mut channels = guard(&self.channels);
        channels.sealed = true;
        channels.bound.clone()
    }

    pub fn channels(&self) -> Vec<Arc<BoundChannel>> {
        guard(&self.channels).bound.clone()
    }

    pub fn is_connected(&self) -> bool {
        guard(&self.connection).is_some() && !self.connection_lost()
    }

    /// Whether the broker already reported the connection closed
    pub fn connection_lost(&self) -> bool {
        self.lost.load(Ordering::SeqCst)
    }

    /// Close the connection, if one was opened. Channels are forgotten.
    pub async fn close(&self) -> Result<(), WorkerError> {
        guard(&self.channels).bound.clear();
        let connection = guard(&self.connection).take();
        let result = match connection {
            Some(connection) => connection.close().await,
            None => Ok(()),
        };
        // Give the watcher a moment to log the close signal, then stop it.
        let task = guard(&self.signal_task).take();
        if let Some(task) = task {
            tokio::task::yield_now().await;
            task.abort();
        }
        result
    }
}

async fn watch_signals(
    mut signals: broadcast::Receiver<ConnectionSignal>,
    lost: Arc<AtomicBool>,
    on_lost: LossHandler,
) {
    loop {
        match signals.recv().await {
            Ok(ConnectionSignal::Closed) => {
                info!("Connection closed");
                lost.store(true, Ordering::SeqCst);
                on_lost();
                break;
            }
            Ok(ConnectionSignal::Error(reason)) => {
                error!(error = %reason, "Connection closing because of an error");
                lost.store(true, Ordering::SeqCst);
                on_lost();
                break;
            }
            Ok(ConnectionSignal::Blocked(reason)) => {
                warn!(reason = %reason, "Connection blocked");
            }
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "Missed connection signals");
            }
            Err(RecvError::Closed) => break,
        }
    }
}
