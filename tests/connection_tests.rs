use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use trainlink::protocol::uuids;
use trainlink::{
    ConnectionConfig, ConnectionEvent, ConnectionManager, ConnectionState, EndpointId, ReconnectPolicy,
    SensorEndpoint, SensorService, SimulatedTransport,
};

/// Connection lifecycle tests against the simulated transport, on paused tokio time

#[cfg(test)]
mod connection_tests {
    use super::*;

    async fn setup() -> (ConnectionManager<SimulatedTransport>, SimulatedTransport, EndpointId) {
        let transport = SimulatedTransport::new();
        let id = EndpointId::new("hrm-pro");
        let endpoint = SensorEndpoint::new(id.clone(), "HRM-Pro").with_services([SensorService::HeartRate]);
        transport.add_device(endpoint.clone()).await;

        let manager = ConnectionManager::new(Arc::new(transport.clone()), ConnectionConfig::default(), 2.105);
        manager.register(endpoint).await;
        (manager, transport, id)
    }

    fn drain_states(events: &mut broadcast::Receiver<ConnectionEvent>) -> Vec<ConnectionState> {
        let mut states = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let ConnectionEvent::StateChanged { state, .. } = event {
                states.push(state);
            }
        }
        states
    }

    #[tokio::test(start_paused = true)]
    async fn test_silence_triggers_automatic_reconnect() {
        let (manager, transport, id) = setup().await;
        let mut events = manager.subscribe_events();
        let mut readings = manager.subscribe_readings();
        let _health = manager.spawn_health_check();

        manager.connect(&id).await.unwrap();
        for bpm in [120u8, 122, 125, 127, 130] {
            transport.notify(&id, uuids::HEART_RATE_MEASUREMENT, &[0x00, bpm]).await;
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
        for _ in 0..5 {
            readings.recv().await.unwrap();
        }

        transport.set_silent(&id, true).await;
        tokio::time::sleep(Duration::from_secs(21)).await;

        let states = drain_states(&mut events);
        assert_eq!(
            &states[..4],
            &[
                ConnectionState::Connecting,
                ConnectionState::Connected,
                ConnectionState::Disconnected,
                ConnectionState::Connecting,
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_endpoint_backs_off_then_fails() {
        let (manager, transport, id) = setup().await;
        let policy = ReconnectPolicy::from(&ConnectionConfig::default());
        let mut events = manager.subscribe_events();

        manager.connect(&id).await.unwrap();
        transport.set_reachable(&id, false).await;

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(manager.check_liveness().await, vec![id.clone()]);
        tokio::time::sleep(Duration::from_secs(60)).await;

        assert_eq!(manager.state(&id).await, Some(ConnectionState::Failed));

        // First entry is the original connect
        let attempts = transport.connect_attempts(&id).await;
        let retries = &attempts[1..];
        assert!(retries.len() as u32 <= policy.max_attempts);
        assert_eq!(retries.len() as u32, policy.max_attempts);

        let gaps: Vec<Duration> = retries.windows(2).map(|w| w[1] - w[0]).collect();
        for pair in gaps.windows(2) {
            assert!(pair[1] >= pair[0], "delays must not shrink: {:?}", gaps);
            assert!(
                pair[1] >= pair[0] * 2 || pair[1] == policy.max_delay,
                "delays must at least double until the cap: {:?}",
                gaps
            );
        }

        let exhausted = std::iter::from_fn(|| events.try_recv().ok()).any(|event| {
            matches!(
                event,
                ConnectionEvent::StateChanged {
                    state: ConnectionState::Failed,
                    reason: Some(trainlink::error::ConnectionError::ReconnectExhausted { .. }),
                    ..
                }
            )
        });
        assert!(exhausted);

        // Failed endpoints stay put until someone connects explicitly
        transport.set_reachable(&id, true).await;
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(manager.state(&id).await, Some(ConnectionState::Failed));
        manager.connect(&id).await.unwrap();
        assert_eq!(manager.state(&id).await, Some(ConnectionState::Connected));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_reading_keeps_endpoint_alive() {
        let (manager, transport, id) = setup().await;
        manager.connect(&id).await.unwrap();

        // 20 bpm fails validation but proves the strap is still talking
        for _ in 0..4 {
            tokio::time::sleep(Duration::from_secs(4)).await;
            transport.notify(&id, uuids::HEART_RATE_MEASUREMENT, &[0x00, 20]).await;
            tokio::task::yield_now().await;
            assert!(manager.check_liveness().await.is_empty());
        }
        assert_eq!(manager.state(&id).await, Some(ConnectionState::Connected));
    }

    #[tokio::test(start_paused = true)]
    async fn test_battery_level_reported_on_connect() {
        let transport = SimulatedTransport::new();
        let id = EndpointId::new("strap");
        let endpoint = SensorEndpoint::new(id.clone(), "Strap")
            .with_services([SensorService::HeartRate, SensorService::Battery]);
        transport.add_device(endpoint.clone()).await;
        transport.set_value(&id, uuids::BATTERY_LEVEL, vec![64]).await;

        let manager = ConnectionManager::new(Arc::new(transport.clone()), ConnectionConfig::default(), 2.105);
        manager.register(endpoint).await;
        let mut events = manager.subscribe_events();
        manager.connect(&id).await.unwrap();

        let battery = std::iter::from_fn(|| events.try_recv().ok()).find_map(|event| match event {
            ConnectionEvent::BatteryLevel { percent, .. } => Some(percent),
            _ => None,
        });
        assert_eq!(battery, Some(64));
        assert_eq!(manager.endpoint(&id).await.unwrap().battery_level, Some(64));
    }
}
