//! Device Connection Manager
//!
//! Owns every known endpoint and its [`ConnectionState`]. Notifications are
//! decoded, timestamped for liveness, validated and fanned out to
//! subscribers. A silent endpoint is marked disconnected by the health check
//! and retried with bounded exponential backoff until it either produces data
//! again or the policy gives up and the endpoint is parked in `Failed`.
//!
//! All state lives behind one async mutex. Retry and notification tasks take a
//! generation number when spawned and re-check it under the lock before every
//! state change, so an explicit disconnect can never be overtaken by a stale
//! reconnect.

use futures_util::stream::{BoxStream, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::ConnectionConfig;
use crate::error::ConnectionError;
use crate::models::{
    ConnectionState, EndpointId, MetricKind, MonotonicClock, SensorEndpoint, SensorReading, SensorService,
};
use crate::protocol::MeasurementDecoder;
use crate::transport::Transport;
use crate::validation::ReadingValidator;

const EVENT_CAPACITY: usize = 256;
const READING_CAPACITY: usize = 4096;

/// Bounded exponential backoff
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl ReconnectPolicy {
    /// Delay before the given 1-based attempt
    ///
    /// The first attempt is immediate; attempt `k >= 2` waits
    /// `base * 2^(k-2)`, capped at `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let factor = 2u32.saturating_pow(attempt - 2);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

impl From<&ConnectionConfig> for ReconnectPolicy {
    fn from(config: &ConnectionConfig) -> Self {
        Self {
            max_attempts: config.max_reconnect_attempts,
            base_delay: config.reconnect_base_delay,
            max_delay: config.reconnect_max_delay,
        }
    }
}

/// Per-endpoint state-change notifications
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    Discovered(SensorEndpoint),
    StateChanged {
        endpoint: EndpointId,
        state: ConnectionState,
        /// Current reconnect attempt, 0 outside a retry sequence
        attempt: u32,
        reason: Option<ConnectionError>,
    },
    BatteryLevel {
        endpoint: EndpointId,
        percent: u8,
    },
    Forgotten(EndpointId),
}

#[derive(Debug)]
struct Entry {
    endpoint: SensorEndpoint,
    state: ConnectionState,
    last_data: Option<Instant>,
    attempt: u32,
    generation: u64,
    retry: Option<JoinHandle<()>>,
    pumps: Vec<JoinHandle<()>>,
}

impl Entry {
    fn new(endpoint: SensorEndpoint) -> Self {
        Self {
            endpoint,
            state: ConnectionState::Disconnected,
            last_data: None,
            attempt: 0,
            generation: 0,
            retry: None,
            pumps: Vec::new(),
        }
    }

    fn cancel_retry(&mut self) {
        if let Some(handle) = self.retry.take() {
            handle.abort();
        }
    }

    fn stop_pumps(&mut self) {
        for handle in self.pumps.drain(..) {
            handle.abort();
        }
    }
}

struct Shared<T: Transport> {
    transport: Arc<T>,
    config: ConnectionConfig,
    policy: ReconnectPolicy,
    wheel_circumference_m: f64,
    clock: MonotonicClock,
    endpoints: Mutex<HashMap<EndpointId, Entry>>,
    events: broadcast::Sender<ConnectionEvent>,
    readings: broadcast::Sender<SensorReading>,
}

/// Owns endpoints, their link state and the reconnection policy
pub struct ConnectionManager<T: Transport> {
    shared: Arc<Shared<T>>,
}

impl<T: Transport> Clone for ConnectionManager<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Transport> ConnectionManager<T> {
    pub fn new(transport: Arc<T>, config: ConnectionConfig, wheel_circumference_m: f64) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (readings, _) = broadcast::channel(READING_CAPACITY);
        let policy = ReconnectPolicy::from(&config);

        Self {
            shared: Arc::new(Shared {
                transport,
                config,
                policy,
                wheel_circumference_m,
                clock: MonotonicClock::new(),
                endpoints: Mutex::new(HashMap::new()),
                events,
                readings,
            }),
        }
    }

    pub fn transport(&self) -> Arc<T> {
        Arc::clone(&self.shared.transport)
    }

    pub fn policy(&self) -> ReconnectPolicy {
        self.shared.policy
    }

    /// Clock used to timestamp readings
    pub fn clock(&self) -> MonotonicClock {
        self.shared.clock
    }

    /// Scan for endpoints, registering each as it is observed
    ///
    /// The stream is lazy and open-ended; drop it to stop scanning.
    pub fn discover(&self) -> BoxStream<'static, SensorEndpoint> {
        let shared = Arc::clone(&self.shared);
        self.shared
            .transport
            .scan()
            .then(move |advertisement| {
                let shared = Arc::clone(&shared);
                async move { shared.register(advertisement.into_endpoint()).await }
            })
            .boxed()
    }

    /// Register an endpoint without scanning, e.g. one remembered from a previous run
    pub async fn register(&self, endpoint: SensorEndpoint) -> SensorEndpoint {
        self.shared.register(endpoint).await
    }

    /// Subscription for accepted readings from every endpoint
    pub fn subscribe_readings(&self) -> broadcast::Receiver<SensorReading> {
        self.shared.readings.subscribe()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.shared.events.subscribe()
    }

    pub async fn state(&self, id: &EndpointId) -> Option<ConnectionState> {
        self.shared.endpoints.lock().await.get(id).map(|entry| entry.state)
    }

    pub async fn endpoint(&self, id: &EndpointId) -> Option<SensorEndpoint> {
        self.shared
            .endpoints
            .lock()
            .await
            .get(id)
            .map(|entry| entry.endpoint.clone())
    }

    /// Every known endpoint with its current state
    pub async fn endpoints(&self) -> Vec<(SensorEndpoint, ConnectionState)> {
        let endpoints = self.shared.endpoints.lock().await;
        let mut list: Vec<_> = endpoints
            .values()
            .map(|entry| (entry.endpoint.clone(), entry.state))
            .collect();
        list.sort_by(|a, b| a.0.id.cmp(&b.0.id));
        list
    }

    /// Connected endpoints that accept fitness machine control
    pub async fn controllable_endpoints(&self) -> Vec<EndpointId> {
        self.endpoints()
            .await
            .into_iter()
            .filter(|(endpoint, state)| endpoint.is_controllable() && *state == ConnectionState::Connected)
            .map(|(endpoint, _)| endpoint.id)
            .collect()
    }

    /// Connect an endpoint: `connecting`, then `connected` or `failed`
    ///
    /// Also the only way out of `failed` after reconnection gave up.
    pub async fn connect(&self, id: &EndpointId) -> Result<(), ConnectionError> {
        let generation = {
            let mut endpoints = self.shared.endpoints.lock().await;
            let entry = endpoints
                .get_mut(id)
                .ok_or_else(|| ConnectionError::UnknownEndpoint(id.clone()))?;

            entry.cancel_retry();
            entry.stop_pumps();
            entry.generation += 1;
            entry.attempt = 0;
            self.shared.set_state(entry, ConnectionState::Connecting, None);
            entry.generation
        };

        info!(endpoint = %id, "Connecting");
        match self.shared.establish(id, generation).await {
            Ok(()) => Ok(()),
            Err(err) => {
                let mut endpoints = self.shared.endpoints.lock().await;
                if let Some(entry) = endpoints.get_mut(id) {
                    if entry.generation == generation {
                        self.shared.set_state(entry, ConnectionState::Failed, Some(err.clone()));
                    }
                }
                warn!(endpoint = %id, "Connect failed: {}", err);
                Err(err)
            }
        }
    }

    /// Drop the link and cancel any pending reconnection atomically
    pub async fn disconnect(&self, id: &EndpointId) -> Result<(), ConnectionError> {
        {
            let mut endpoints = self.shared.endpoints.lock().await;
            let entry = endpoints
                .get_mut(id)
                .ok_or_else(|| ConnectionError::UnknownEndpoint(id.clone()))?;

            entry.generation += 1;
            entry.cancel_retry();
            entry.stop_pumps();
            entry.attempt = 0;
            entry.last_data = None;
            self.shared.set_state(entry, ConnectionState::Disconnected, None);
        }

        info!(endpoint = %id, "Disconnected");
        if let Err(err) = self.shared.transport.disconnect(id).await {
            warn!(endpoint = %id, "Transport disconnect failed: {}", err);
        }
        Ok(())
    }

    /// Disconnect and remove the endpoint entirely
    pub async fn forget(&self, id: &EndpointId) -> Result<(), ConnectionError> {
        self.disconnect(id).await?;
        self.shared.endpoints.lock().await.remove(id);
        let _ = self.shared.events.send(ConnectionEvent::Forgotten(id.clone()));
        Ok(())
    }

    /// Disconnect every endpoint
    pub async fn disconnect_all(&self) {
        let ids: Vec<EndpointId> = self.shared.endpoints.lock().await.keys().cloned().collect();
        for id in ids {
            let _ = self.disconnect(&id).await;
        }
    }

    /// Mark silent connected endpoints as lost and start reconnecting them
    ///
    /// Returns the endpoints that were found stale.
    pub async fn check_liveness(&self) -> Vec<EndpointId> {
        let now = Instant::now();
        let mut stale = Vec::new();
        let mut endpoints = self.shared.endpoints.lock().await;

        for (id, entry) in endpoints.iter_mut() {
            if entry.state != ConnectionState::Connected {
                continue;
            }
            let silent_for = entry
                .last_data
                .map_or(Duration::MAX, |last| now.saturating_duration_since(last));
            if silent_for < self.shared.config.stale_after {
                continue;
            }

            warn!(endpoint = %id, ?silent_for, "No data received, starting reconnect");
            let reason = ConnectionError::ConnectionLost {
                endpoint: id.clone(),
                silent_for,
            };
            self.shared.set_state(entry, ConnectionState::Disconnected, Some(reason));
            entry.cancel_retry();
            entry.retry = Some(tokio::spawn(Arc::clone(&self.shared).reconnect(id.clone(), entry.generation)));
            stale.push(id.clone());
        }

        stale
    }

    /// Run [`check_liveness`](Self::check_liveness) on the configured interval
    pub fn spawn_health_check(&self) -> JoinHandle<()> {
        let manager = self.clone();
        let period = self.shared.config.health_check_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            loop {
                ticker.tick().await;
                manager.check_liveness().await;
            }
        })
    }
}

impl<T: Transport> Shared<T> {
    async fn register(&self, endpoint: SensorEndpoint) -> SensorEndpoint {
        let mut endpoints = self.endpoints.lock().await;
        let entry = endpoints
            .entry(endpoint.id.clone())
            .and_modify(|entry| {
                entry.endpoint.services.extend(endpoint.services.iter().copied());
                if endpoint.rssi.is_some() {
                    entry.endpoint.rssi = endpoint.rssi;
                }
            })
            .or_insert_with(|| Entry::new(endpoint));

        debug!(endpoint = %entry.endpoint.id, name = %entry.endpoint.name, "Endpoint observed");
        let _ = self.events.send(ConnectionEvent::Discovered(entry.endpoint.clone()));
        entry.endpoint.clone()
    }

    fn set_state(&self, entry: &mut Entry, state: ConnectionState, reason: Option<ConnectionError>) {
        entry.state = state;
        let _ = self.events.send(ConnectionEvent::StateChanged {
            endpoint: entry.endpoint.id.clone(),
            state,
            attempt: entry.attempt,
            reason,
        });
    }

    /// Transport connect plus subscriptions; moves the entry to `connected`
    async fn establish(self: &Arc<Self>, id: &EndpointId, generation: u64) -> Result<(), ConnectionError> {
        let connect_failed = |reason: String| ConnectionError::ConnectFailed {
            endpoint: id.clone(),
            reason,
        };

        self.transport
            .connect(id)
            .await
            .map_err(|err| connect_failed(err.to_string()))?;

        let services = {
            let endpoints = self.endpoints.lock().await;
            endpoints
                .get(id)
                .map(|entry| entry.endpoint.services.clone())
                .ok_or_else(|| ConnectionError::UnknownEndpoint(id.clone()))?
        };

        let mut subscriptions = Vec::new();
        for service in &services {
            let characteristic = service.measurement_characteristic();
            match self.transport.subscribe(id, characteristic).await {
                Ok(rx) => subscriptions.push((characteristic, rx)),
                Err(err) => debug!(endpoint = %id, %characteristic, "Subscribe skipped: {}", err),
            }
        }
        if subscriptions.is_empty() && !services.is_empty() {
            return Err(connect_failed("no measurement characteristic could be subscribed".to_string()));
        }

        let battery = if services.contains(&SensorService::Battery) {
            self.transport
                .read(id, SensorService::Battery.measurement_characteristic())
                .await
                .ok()
                .and_then(|bytes| crate::protocol::decode_battery_level(&bytes).ok())
        } else {
            None
        };

        let mut endpoints = self.endpoints.lock().await;
        let Some(entry) = endpoints.get_mut(id) else {
            return Err(ConnectionError::UnknownEndpoint(id.clone()));
        };
        if entry.generation != generation {
            // Disconnected while the link was coming up
            drop(endpoints);
            let _ = self.transport.disconnect(id).await;
            return Ok(());
        }

        entry.stop_pumps();
        for (characteristic, rx) in subscriptions {
            entry.pumps.push(tokio::spawn(Arc::clone(self).pump(
                id.clone(),
                characteristic,
                rx,
            )));
        }
        if let Some(percent) = battery {
            entry.endpoint.battery_level = Some(percent);
            let _ = self.events.send(ConnectionEvent::BatteryLevel {
                endpoint: id.clone(),
                percent,
            });
        }

        // Retry handle belongs to the caller when reconnecting; just detach it
        entry.retry.take();
        entry.attempt = 0;
        entry.last_data = Some(Instant::now());
        self.set_state(entry, ConnectionState::Connected, None);
        info!(endpoint = %id, "Connected");
        Ok(())
    }

    async fn pump(self: Arc<Self>, id: EndpointId, characteristic: Uuid, mut rx: mpsc::Receiver<Vec<u8>>) {
        let mut decoder = MeasurementDecoder::new(id.clone(), self.wheel_circumference_m);
        while let Some(bytes) = rx.recv().await {
            match decoder.decode(characteristic, &bytes, self.clock.now()) {
                Ok(readings) => {
                    for reading in readings {
                        self.on_reading(reading).await;
                    }
                }
                Err(err) => debug!(endpoint = %id, "Dropped notification: {}", err),
            }
        }
        debug!(endpoint = %id, %characteristic, "Notification stream closed");
    }

    /// Liveness first, then validation; a rejected value still proves the sensor is alive
    async fn on_reading(&self, reading: SensorReading) {
        {
            let mut endpoints = self.endpoints.lock().await;
            let Some(entry) = endpoints.get_mut(&reading.endpoint) else {
                return;
            };
            if entry.state == ConnectionState::Failed {
                return;
            }

            entry.last_data = Some(Instant::now());
            if entry.state != ConnectionState::Connected {
                info!(endpoint = %reading.endpoint, "Data resumed, reconnected");
                entry.cancel_retry();
                entry.attempt = 0;
                self.set_state(entry, ConnectionState::Connected, None);
            }

            if reading.metric == MetricKind::Battery {
                if let Ok(percent) = ReadingValidator::validate(reading.metric, reading.value) {
                    let percent = percent as u8;
                    entry.endpoint.battery_level = Some(percent);
                    let _ = self.events.send(ConnectionEvent::BatteryLevel {
                        endpoint: reading.endpoint.clone(),
                        percent,
                    });
                }
            }
        }

        if let Ok(reading) = ReadingValidator::validate_reading(reading) {
            let _ = self.readings.send(reading);
        }
    }

    async fn reconnect(self: Arc<Self>, id: EndpointId, generation: u64) {
        for attempt in 1..=self.policy.max_attempts {
            let delay = self.policy.delay_for(attempt);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            {
                let mut endpoints = self.endpoints.lock().await;
                let Some(entry) = endpoints.get_mut(&id) else {
                    return;
                };
                if entry.generation != generation || entry.state == ConnectionState::Connected {
                    return;
                }
                entry.attempt = attempt;
                self.set_state(entry, ConnectionState::Connecting, None);
            }

            info!(endpoint = %id, attempt, "Reconnect attempt");
            match self.establish(&id, generation).await {
                Ok(()) => return,
                Err(err) => {
                    warn!(endpoint = %id, attempt, "Reconnect attempt failed: {}", err);
                    let mut endpoints = self.endpoints.lock().await;
                    let Some(entry) = endpoints.get_mut(&id) else {
                        return;
                    };
                    if entry.generation != generation {
                        return;
                    }
                    self.set_state(entry, ConnectionState::Disconnected, Some(err));
                }
            }
        }

        let mut endpoints = self.endpoints.lock().await;
        if let Some(entry) = endpoints.get_mut(&id) {
            if entry.generation == generation && entry.state != ConnectionState::Connected {
                let reason = ConnectionError::ReconnectExhausted {
                    endpoint: id.clone(),
                    attempts: self.policy.max_attempts,
                };
                warn!(endpoint = %id, "{}", reason);
                entry.stop_pumps();
                entry.retry.take();
                self.set_state(entry, ConnectionState::Failed, Some(reason));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::uuids;
    use crate::transport::SimulatedTransport;

    #[test]
    fn test_backoff_schedule() {
        let policy = ReconnectPolicy::from(&ConnectionConfig::default());
        let delays: Vec<u64> = (1..=6).map(|k| policy.delay_for(k).as_millis() as u64).collect();
        assert_eq!(delays, vec![0, 500, 1000, 2000, 4000, 8000]);
        assert_eq!(policy.delay_for(12), Duration::from_secs(8));
    }

    async fn manager_with_strap() -> (ConnectionManager<SimulatedTransport>, SimulatedTransport, EndpointId) {
        let transport = SimulatedTransport::new();
        let id = EndpointId::new("hrm");
        transport
            .add_device(SensorEndpoint::new(id.clone(), "HRM-Pro").with_services([SensorService::HeartRate]))
            .await;
        let manager = ConnectionManager::new(Arc::new(transport.clone()), ConnectionConfig::default(), 2.105);
        (manager, transport, id)
    }

    #[tokio::test]
    async fn test_connect_unknown_endpoint() {
        let (manager, _, _) = manager_with_strap().await;
        let result = manager.connect(&EndpointId::new("nope")).await;
        assert!(matches!(result, Err(ConnectionError::UnknownEndpoint(_))));
    }

    #[tokio::test]
    async fn test_discover_registers_endpoints() {
        let (manager, _, id) = manager_with_strap().await;
        let mut discovered = manager.discover();
        let endpoint = discovered.next().await.unwrap();
        drop(discovered);

        assert_eq!(endpoint.id, id);
        assert_eq!(manager.state(&id).await, Some(ConnectionState::Disconnected));
    }

    #[tokio::test]
    async fn test_connect_and_stream_readings() {
        let (manager, transport, id) = manager_with_strap().await;
        manager.discover().next().await;
        let mut readings = manager.subscribe_readings();

        manager.connect(&id).await.unwrap();
        assert_eq!(manager.state(&id).await, Some(ConnectionState::Connected));

        transport.notify(&id, uuids::HEART_RATE_MEASUREMENT, &[0x00, 20]).await; // rejected
        transport.notify(&id, uuids::HEART_RATE_MEASUREMENT, &[0x00, 150]).await;

        let reading = readings.recv().await.unwrap();
        assert_eq!(reading.metric, MetricKind::HeartRate);
        assert_eq!(reading.value, 150.0);
    }

    #[tokio::test]
    async fn test_connect_failure_marks_failed() {
        let (manager, transport, id) = manager_with_strap().await;
        manager.register(transport_endpoint(&id)).await;
        transport.set_reachable(&id, false).await;

        assert!(manager.connect(&id).await.is_err());
        assert_eq!(manager.state(&id).await, Some(ConnectionState::Failed));
    }

    fn transport_endpoint(id: &EndpointId) -> SensorEndpoint {
        SensorEndpoint::new(id.clone(), "HRM-Pro").with_services([SensorService::HeartRate])
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_cancels_pending_retry() {
        let (manager, transport, id) = manager_with_strap().await;
        manager.register(transport_endpoint(&id)).await;
        manager.connect(&id).await.unwrap();
        transport.set_reachable(&id, false).await;

        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(manager.check_liveness().await, vec![id.clone()]);
        tokio::task::yield_now().await;

        manager.disconnect(&id).await.unwrap();
        let attempts_at_disconnect = transport.connect_attempts(&id).await.len();

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(transport.connect_attempts(&id).await.len(), attempts_at_disconnect);
        assert_eq!(manager.state(&id).await, Some(ConnectionState::Disconnected));
    }
}
