use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::TryRecvError;
use trainlink::error::SessionError;
use trainlink::protocol::ftms::ResultCode;
use trainlink::protocol::uuids;
use trainlink::{
    ControlTarget, Engine, EngineConfig, EndpointId, FlatPlan, IntensityTarget, MemorySink, SensorEndpoint,
    SensorService, SessionState, SimulatedTransport, TrainLinkError, WorkoutStep,
};

/// Engine host tests: actor, timers, trainer workers and persistence together

#[cfg(test)]
mod engine_tests {
    use super::*;

    struct Rig {
        engine: Engine<SimulatedTransport>,
        transport: SimulatedTransport,
        sink: MemorySink,
        trainer: EndpointId,
    }

    async fn rig_with_trainer() -> Rig {
        let transport = SimulatedTransport::new();
        let trainer = EndpointId::new("kickr");
        transport.add_trainer(trainer.clone(), "KICKR").await;

        let mut config = EngineConfig::default();
        config.athlete.ftp = Some(280);
        config.athlete.lthr = Some(170);
        let sink = MemorySink::new();
        let engine = Engine::with_sink(Arc::new(transport.clone()), config, Arc::new(sink.clone()));

        engine
            .connections()
            .register(
                SensorEndpoint::new(trainer.clone(), "KICKR")
                    .with_services([SensorService::FitnessMachine, SensorService::CyclingPower]),
            )
            .await;
        engine.connections().connect(&trainer).await.unwrap();
        // Let the actor see the connect and bring up the control worker
        tokio::time::sleep(Duration::from_millis(10)).await;

        Rig {
            engine,
            transport,
            sink,
            trainer,
        }
    }

    fn set_power(watts: i16) -> Vec<u8> {
        let mut bytes = vec![0x05];
        bytes.extend_from_slice(&watts.to_le_bytes());
        bytes
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_override_reissues_target_once() {
        let rig = rig_with_trainer().await;
        let mut notices = rig.engine.subscribe_control_notices();

        let plan = FlatPlan::from_steps(vec![
            WorkoutStep::timed("Sweet spot", 300).with_target(IntensityTarget::PercentFtp(90.0)),
            WorkoutStep::open_ended("Spin"),
        ]);
        rig.engine.start(Some(plan)).await.unwrap();
        assert_eq!(notices.recv().await.unwrap().target, ControlTarget::Power { watts: 252.0 });

        rig.engine.set_manual_override(true).await.unwrap();
        rig.engine.set_power_target(&rig.trainer, 180.0).await.unwrap();
        assert_eq!(notices.recv().await.unwrap().target, ControlTarget::Power { watts: 180.0 });

        rig.engine.set_manual_override(false).await.unwrap();
        let reissued = notices.recv().await.unwrap();
        assert_eq!(reissued.target, ControlTarget::Power { watts: 252.0 });
        assert!(reissued.result.is_ok());

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(matches!(notices.try_recv(), Err(TryRecvError::Empty)));

        let writes = rig.transport.control_writes(&rig.trainer).await;
        let plan_writes = writes.iter().filter(|w| **w == set_power(252)).count();
        assert_eq!(plan_writes, 2);
        assert_eq!(writes.last(), Some(&set_power(252)));

        rig.engine.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_override_cleared_during_pause_applies_on_resume() {
        let rig = rig_with_trainer().await;
        let plan = FlatPlan::from_steps(vec![WorkoutStep::timed("Tempo", 600).with_target(IntensityTarget::Watts(230.0))]);
        rig.engine.start(Some(plan)).await.unwrap();
        rig.engine.set_power_target(&rig.trainer, 180.0).await.unwrap();

        rig.engine.pause().await.unwrap();
        rig.engine.set_manual_override(false).await.unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;

        // The trainer keeps the manual value while paused
        let writes = rig.transport.control_writes(&rig.trainer).await;
        assert_eq!(writes.last(), Some(&set_power(180)));
        assert_eq!(writes.iter().filter(|w| **w == set_power(230)).count(), 1);

        rig.engine.resume().await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        let writes = rig.transport.control_writes(&rig.trainer).await;
        assert_eq!(writes.last(), Some(&set_power(230)));
        assert_eq!(writes.iter().filter(|w| **w == set_power(230)).count(), 2);

        rig.engine.finish().await.unwrap();
        assert!(matches!(
            rig.engine.set_manual_override(true).await,
            Err(TrainLinkError::Session(SessionError::IllegalTransition {
                state: SessionState::Finished,
                ..
            }))
        ));
        rig.engine.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_trainer_refusal_does_not_stop_recording() {
        let rig = rig_with_trainer().await;
        rig.transport
            .set_control_result(&rig.trainer, Some(ResultCode::OperationFailed))
            .await;
        let mut notices = rig.engine.subscribe_control_notices();

        let plan = FlatPlan::from_steps(vec![WorkoutStep::timed("Tempo", 60).with_target(IntensityTarget::Watts(230.0))]);
        rig.engine.start(Some(plan)).await.unwrap();

        let notice = notices.recv().await.unwrap();
        assert!(notice.result.is_err());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(rig.engine.session_state().await.unwrap(), Some(SessionState::Recording));
        rig.engine.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_readings_reach_snapshots() {
        let rig = rig_with_trainer().await;
        rig.engine.start(None).await.unwrap();

        // Speed, power
        let frame = [0x40, 0x00, 0xB8, 0x0B, 0xD2, 0x00];
        for _ in 0..3 {
            rig.transport.notify(&rig.trainer, uuids::INDOOR_BIKE_DATA, &frame).await;
            tokio::time::sleep(Duration::from_secs(1)).await;
        }

        let snapshot = rig.engine.snapshot().await.unwrap().unwrap();
        assert_eq!(snapshot.current(trainlink::MetricKind::Power), Some(210.0));
        assert!(snapshot.current(trainlink::MetricKind::Speed).unwrap() > 8.0);
        assert!(snapshot.work_kj > 0.0);
        rig.engine.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_resume_and_abort() {
        let rig = rig_with_trainer().await;
        rig.engine.start(None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5_500)).await;

        rig.engine.pause().await.unwrap();
        assert!(matches!(
            rig.engine.pause().await,
            Err(TrainLinkError::Session(SessionError::IllegalTransition { .. }))
        ));
        tokio::time::sleep(Duration::from_secs(5)).await;
        let paused = rig.engine.snapshot().await.unwrap().unwrap();
        assert_eq!(paused.elapsed, Duration::from_secs(5));

        rig.engine.resume().await.unwrap();
        rig.engine.abort().await.unwrap();
        assert_eq!(rig.engine.session_state().await.unwrap(), Some(SessionState::Aborted));

        let last = rig.sink.latest().await.unwrap();
        assert_eq!(last.state, SessionState::Aborted);
        assert!(last.advanced.is_none());

        // Aborting released the trainer with a reset
        tokio::time::sleep(Duration::from_millis(10)).await;
        let writes = rig.transport.control_writes(&rig.trainer).await;
        assert_eq!(writes.last(), Some(&vec![0x01]));
        rig.engine.shutdown().await;
    }
}
