//! Platform wireless transport capability
//!
//! The engine never talks to a Bluetooth stack directly. Anything that can
//! scan, connect, and read/write/subscribe to characteristics by UUID can back
//! it. [`SimulatedTransport`] is the in-process implementation used by the CLI
//! and the test-suite.

use async_trait::async_trait;
use futures_util::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::TransportError;
use crate::models::{EndpointId, SensorEndpoint, SensorService};
use crate::protocol::ftms::{ControlPointResponse, ResultCode};
use crate::protocol::uuids;

/// Notification queue depth per subscription
const NOTIFY_CAPACITY: usize = 256;

/// One observed advertisement during a scan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Advertisement {
    pub id: EndpointId,
    pub name: String,
    pub services: Vec<Uuid>,
    pub rssi: Option<i16>,
}

impl Advertisement {
    /// Endpoint with every advertised service the engine understands
    pub fn into_endpoint(self) -> SensorEndpoint {
        let services: Vec<SensorService> = self.services.iter().filter_map(SensorService::from_uuid).collect();
        let mut endpoint = SensorEndpoint::new(self.id, self.name).with_services(services);
        endpoint.rssi = self.rssi;
        endpoint
    }
}

impl From<&SensorEndpoint> for Advertisement {
    fn from(endpoint: &SensorEndpoint) -> Self {
        Self {
            id: endpoint.id.clone(),
            name: endpoint.name.clone(),
            services: endpoint.services.iter().map(SensorService::uuid).collect(),
            rssi: endpoint.rssi,
        }
    }
}

/// Byte-level access to wireless endpoints
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Lazy, open-ended stream of advertisements; ends only when the caller drops it
    fn scan(&self) -> BoxStream<'static, Advertisement>;

    async fn connect(&self, endpoint: &EndpointId) -> Result<(), TransportError>;

    async fn disconnect(&self, endpoint: &EndpointId) -> Result<(), TransportError>;

    async fn read(&self, endpoint: &EndpointId, characteristic: Uuid) -> Result<Vec<u8>, TransportError>;

    async fn write(&self, endpoint: &EndpointId, characteristic: Uuid, data: &[u8]) -> Result<(), TransportError>;

    /// Notifications (or indications) for a characteristic until the link drops
    async fn subscribe(
        &self,
        endpoint: &EndpointId,
        characteristic: Uuid,
    ) -> Result<mpsc::Receiver<Vec<u8>>, TransportError>;
}

#[derive(Debug)]
struct SimulatedDevice {
    endpoint: SensorEndpoint,
    reachable: bool,
    connected: bool,
    silent: bool,
    values: HashMap<Uuid, Vec<u8>>,
    subscribers: HashMap<Uuid, Vec<mpsc::Sender<Vec<u8>>>>,
    /// `None` leaves control point writes unanswered
    control_result: Option<ResultCode>,
    control_writes: Vec<Vec<u8>>,
    connect_attempts: Vec<Instant>,
}

impl SimulatedDevice {
    fn new(endpoint: SensorEndpoint) -> Self {
        Self {
            endpoint,
            reachable: true,
            connected: false,
            silent: false,
            values: HashMap::new(),
            subscribers: HashMap::new(),
            control_result: Some(ResultCode::Success),
            control_writes: Vec::new(),
            connect_attempts: Vec::new(),
        }
    }

    fn deliver(&mut self, characteristic: Uuid, data: &[u8]) -> usize {
        let Some(senders) = self.subscribers.get_mut(&characteristic) else {
            return 0;
        };
        senders.retain(|tx| !tx.is_closed());
        senders
            .iter()
            .filter(|tx| tx.try_send(data.to_vec()).is_ok())
            .count()
    }
}

#[derive(Debug)]
struct SimulatedInner {
    devices: Mutex<HashMap<EndpointId, SimulatedDevice>>,
    advertisements: broadcast::Sender<Advertisement>,
}

/// In-process transport with scriptable devices
#[derive(Debug, Clone)]
pub struct SimulatedTransport {
    inner: Arc<SimulatedInner>,
}

impl Default for SimulatedTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedTransport {
    pub fn new() -> Self {
        let (advertisements, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(SimulatedInner {
                devices: Mutex::new(HashMap::new()),
                advertisements,
            }),
        }
    }

    /// Register a device and advertise it to running scans
    pub async fn add_device(&self, endpoint: SensorEndpoint) {
        let advertisement = Advertisement::from(&endpoint);
        self.inner
            .devices
            .lock()
            .await
            .insert(endpoint.id.clone(), SimulatedDevice::new(endpoint));
        let _ = self.inner.advertisements.send(advertisement);
    }

    /// Register a smart trainer supporting ERG, SIM and resistance control
    pub async fn add_trainer(&self, id: EndpointId, name: &str) {
        let endpoint = SensorEndpoint::new(id.clone(), name).with_services([
            SensorService::FitnessMachine,
            SensorService::CyclingPower,
        ]);
        self.add_device(endpoint).await;

        // Target settings: resistance (bit 2), power (bit 3), simulation (bit 13)
        let mut features = 0u32.to_le_bytes().to_vec();
        features.extend_from_slice(&((1u32 << 2) | (1 << 3) | (1 << 13)).to_le_bytes());
        self.set_value(&id, uuids::FITNESS_MACHINE_FEATURE, features).await;

        let range = |min: i16, max: i16, step: u16| {
            let mut bytes = min.to_le_bytes().to_vec();
            bytes.extend_from_slice(&max.to_le_bytes());
            bytes.extend_from_slice(&step.to_le_bytes());
            bytes
        };
        self.set_value(&id, uuids::SUPPORTED_POWER_RANGE, range(0, 2000, 1)).await;
        self.set_value(&id, uuids::SUPPORTED_RESISTANCE_LEVEL_RANGE, range(0, 1000, 10))
            .await;
    }

    /// Value returned by `read` for a characteristic
    pub async fn set_value(&self, id: &EndpointId, characteristic: Uuid, data: Vec<u8>) {
        if let Some(device) = self.inner.devices.lock().await.get_mut(id) {
            device.values.insert(characteristic, data);
        }
    }

    /// Unreachable devices fail every connect attempt
    pub async fn set_reachable(&self, id: &EndpointId, reachable: bool) {
        if let Some(device) = self.inner.devices.lock().await.get_mut(id) {
            device.reachable = reachable;
            if !reachable {
                device.connected = false;
                device.subscribers.clear();
            }
        }
    }

    /// A silent device stays connected but drops every notification
    pub async fn set_silent(&self, id: &EndpointId, silent: bool) {
        if let Some(device) = self.inner.devices.lock().await.get_mut(id) {
            device.silent = silent;
        }
    }

    /// Result code sent back for control point writes; `None` never answers
    pub async fn set_control_result(&self, id: &EndpointId, result: Option<ResultCode>) {
        if let Some(device) = self.inner.devices.lock().await.get_mut(id) {
            device.control_result = result;
        }
    }

    /// Push a notification; returns how many subscribers received it
    pub async fn notify(&self, id: &EndpointId, characteristic: Uuid, data: &[u8]) -> usize {
        let mut devices = self.inner.devices.lock().await;
        match devices.get_mut(id) {
            Some(device) if device.connected && !device.silent => device.deliver(characteristic, data),
            _ => 0,
        }
    }

    /// Every control point write, in order
    pub async fn control_writes(&self, id: &EndpointId) -> Vec<Vec<u8>> {
        self.inner
            .devices
            .lock()
            .await
            .get(id)
            .map(|device| device.control_writes.clone())
            .unwrap_or_default()
    }

    /// Instants of every connect attempt, in order
    pub async fn connect_attempts(&self, id: &EndpointId) -> Vec<Instant> {
        self.inner
            .devices
            .lock()
            .await
            .get(id)
            .map(|device| device.connect_attempts.clone())
            .unwrap_or_default()
    }

    pub async fn is_connected(&self, id: &EndpointId) -> bool {
        self.inner
            .devices
            .lock()
            .await
            .get(id)
            .is_some_and(|device| device.connected)
    }
}

#[async_trait]
impl Transport for SimulatedTransport {
    fn scan(&self) -> BoxStream<'static, Advertisement> {
        // Subscribe before listing so nothing registered in between is missed
        let live = self.inner.advertisements.subscribe();
        let inner = Arc::clone(&self.inner);

        let known = stream::once(async move {
            let devices = inner.devices.lock().await;
            let advertisements: Vec<Advertisement> = devices
                .values()
                .map(|device| Advertisement::from(&device.endpoint))
                .collect();
            stream::iter(advertisements)
        })
        .flatten();

        let live = stream::unfold(live, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(advertisement) => return Some((advertisement, rx)),
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });

        known.chain(live).boxed()
    }

    async fn connect(&self, endpoint: &EndpointId) -> Result<(), TransportError> {
        let mut devices = self.inner.devices.lock().await;
        let device = devices
            .get_mut(endpoint)
            .ok_or_else(|| TransportError::Unreachable(endpoint.clone()))?;

        device.connect_attempts.push(Instant::now());
        if !device.reachable {
            return Err(TransportError::Unreachable(endpoint.clone()));
        }
        device.connected = true;
        Ok(())
    }

    async fn disconnect(&self, endpoint: &EndpointId) -> Result<(), TransportError> {
        if let Some(device) = self.inner.devices.lock().await.get_mut(endpoint) {
            device.connected = false;
            device.subscribers.clear();
        }
        Ok(())
    }

    async fn read(&self, endpoint: &EndpointId, characteristic: Uuid) -> Result<Vec<u8>, TransportError> {
        let devices = self.inner.devices.lock().await;
        let device = devices
            .get(endpoint)
            .filter(|device| device.connected)
            .ok_or_else(|| TransportError::Unreachable(endpoint.clone()))?;

        device
            .values
            .get(&characteristic)
            .cloned()
            .ok_or_else(|| TransportError::CharacteristicNotFound {
                endpoint: endpoint.clone(),
                characteristic: characteristic.to_string(),
            })
    }

    async fn write(&self, endpoint: &EndpointId, characteristic: Uuid, data: &[u8]) -> Result<(), TransportError> {
        let mut devices = self.inner.devices.lock().await;
        let device = devices
            .get_mut(endpoint)
            .filter(|device| device.connected)
            .ok_or_else(|| TransportError::Unreachable(endpoint.clone()))?;

        if characteristic != uuids::FITNESS_MACHINE_CONTROL_POINT {
            return Err(TransportError::WriteFailed {
                endpoint: endpoint.clone(),
                reason: format!("characteristic {} is not writable", characteristic),
            });
        }

        device.control_writes.push(data.to_vec());
        if let (Some(result), Some(&opcode)) = (device.control_result, data.first()) {
            let response = ControlPointResponse {
                request_opcode: opcode,
                result,
            };
            device.deliver(characteristic, &response.encode());
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        endpoint: &EndpointId,
        characteristic: Uuid,
    ) -> Result<mpsc::Receiver<Vec<u8>>, TransportError> {
        let mut devices = self.inner.devices.lock().await;
        let device = devices
            .get_mut(endpoint)
            .filter(|device| device.connected)
            .ok_or_else(|| TransportError::Unreachable(endpoint.clone()))?;

        let (tx, rx) = mpsc::channel(NOTIFY_CAPACITY);
        device.subscribers.entry(characteristic).or_default().push(tx);
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn heart_rate_strap() -> SensorEndpoint {
        SensorEndpoint::new(EndpointId::new("hrm"), "HRM-Pro").with_services([SensorService::HeartRate])
    }

    #[tokio::test]
    async fn test_scan_lists_known_then_live_devices() {
        let transport = SimulatedTransport::new();
        transport.add_device(heart_rate_strap()).await;

        let mut scan = transport.scan();
        let first = scan.next().await.unwrap();
        assert_eq!(first.id, EndpointId::new("hrm"));

        transport.add_trainer(EndpointId::new("kickr"), "KICKR").await;
        let second = scan.next().await.unwrap();
        let endpoint = second.into_endpoint();
        assert!(endpoint.is_controllable());
    }

    #[tokio::test]
    async fn test_notifications_require_connection() {
        let transport = SimulatedTransport::new();
        let id = EndpointId::new("hrm");
        transport.add_device(heart_rate_strap()).await;

        assert!(transport.subscribe(&id, uuids::HEART_RATE_MEASUREMENT).await.is_err());

        transport.connect(&id).await.unwrap();
        let mut rx = transport.subscribe(&id, uuids::HEART_RATE_MEASUREMENT).await.unwrap();
        assert_eq!(transport.notify(&id, uuids::HEART_RATE_MEASUREMENT, &[0x00, 140]).await, 1);
        assert_eq!(rx.recv().await.unwrap(), vec![0x00, 140]);

        transport.set_silent(&id, true).await;
        assert_eq!(transport.notify(&id, uuids::HEART_RATE_MEASUREMENT, &[0x00, 141]).await, 0);

        transport.disconnect(&id).await.unwrap();
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_unreachable_connect_is_recorded() {
        let transport = SimulatedTransport::new();
        let id = EndpointId::new("hrm");
        transport.add_device(heart_rate_strap()).await;
        transport.set_reachable(&id, false).await;

        assert!(matches!(
            transport.connect(&id).await,
            Err(TransportError::Unreachable(_))
        ));
        assert_eq!(transport.connect_attempts(&id).await.len(), 1);
    }

    #[tokio::test]
    async fn test_control_point_auto_response() {
        let transport = SimulatedTransport::new();
        let id = EndpointId::new("kickr");
        transport.add_trainer(id.clone(), "KICKR").await;
        transport.connect(&id).await.unwrap();

        let mut indications = transport
            .subscribe(&id, uuids::FITNESS_MACHINE_CONTROL_POINT)
            .await
            .unwrap();
        transport
            .write(&id, uuids::FITNESS_MACHINE_CONTROL_POINT, &[0x05, 0xC8, 0x00])
            .await
            .unwrap();

        assert_eq!(indications.recv().await.unwrap(), vec![0x80, 0x05, 0x01]);
        assert_eq!(transport.control_writes(&id).await, vec![vec![0x05, 0xC8, 0x00]]);
    }
}
