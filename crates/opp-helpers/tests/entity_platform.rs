//! Entity platform setup, id assignment, polling and teardown

mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::{CapturedLogs, MockEntity, MockIntegration, TestOpp, UpdateTracker};
use opp_config_entries::ConfigEntry;
use opp_core::{Attributes, Context, EntityId};
use opp_helpers::{
    AddEntityError, CoordinatorEntity, DataUpdateCoordinator, Entity, EntityAddOutcome,
    PlatformConfig, PlatformError, Polling, UpdateError,
};
use tracing::Level;

fn added(entity_id: &str) -> Result<EntityAddOutcome, AddEntityError> {
    Ok(EntityAddOutcome::Added(entity_id.parse().unwrap()))
}

fn entities<const N: usize>(entities: [Arc<MockEntity>; N]) -> Vec<Arc<dyn Entity>> {
    entities
        .into_iter()
        .map(|entity| entity as Arc<dyn Entity>)
        .collect()
}

#[tokio::test]
async fn test_setup_adds_scheduled_entities() {
    let test = TestOpp::new();
    let integration = MockIntegration::new().with_entities(entities([
        Arc::new(MockEntity::new().with_name("Outdoor").with_state("12")),
        Arc::new(MockEntity::new().with_name("Indoor").with_state("21")),
    ]));
    let platform = test.platform("sensor", Arc::new(integration), PlatformConfig::new("mock"));

    assert!(platform.async_setup().await);
    assert!(platform.is_setup_complete());
    assert_eq!(platform.entity_ids(), vec!["sensor.outdoor", "sensor.indoor"]);
    test.assert_state("sensor.outdoor", "12");
    test.assert_state("sensor.indoor", "21");
}

#[tokio::test]
async fn test_duplicate_unique_id_is_rejected() {
    let (logs, _guard) = CapturedLogs::install();
    let test = TestOpp::new();
    let platform = test.platform(
        "sensor",
        Arc::new(MockIntegration::new()),
        PlatformConfig::new("mock"),
    );

    let results = platform
        .async_add_entities(
            entities([
                Arc::new(MockEntity::new().with_unique_id("abc").with_name("Kitchen")),
                Arc::new(MockEntity::new().with_unique_id("abc").with_name("Kitchen copy")),
                Arc::new(MockEntity::new().with_unique_id("def").with_name("Hall")),
            ]),
            false,
        )
        .await
        .unwrap();

    assert_eq!(results[0], added("sensor.kitchen"));
    assert!(matches!(
        &results[1],
        Err(AddEntityError::DuplicateUniqueId { unique_id, entity_id, .. })
            if unique_id == "abc" && entity_id == "sensor.kitchen"
    ));
    assert_eq!(results[2], added("sensor.hall"));
    assert_eq!(platform.entity_count(), 2);
    assert_eq!(
        logs.count(Level::ERROR, "Platform mock does not generate unique IDs. ID abc"),
        1
    );
}

#[tokio::test]
async fn test_explicit_entity_id_collision() {
    let test = TestOpp::new();
    let taken: EntityId = "sensor.taken".parse().unwrap();
    test.opp
        .states
        .set(&taken, "on", Attributes::new(), false, Context::new())
        .unwrap();
    let platform = test.platform(
        "sensor",
        Arc::new(MockIntegration::new()),
        PlatformConfig::new("mock"),
    );

    let results = platform
        .async_add_entities(
            entities([
                Arc::new(MockEntity::new().with_entity_id("sensor.outside")),
                Arc::new(MockEntity::new().with_entity_id("sensor.outside")),
                Arc::new(MockEntity::new().with_entity_id("sensor.taken")),
                Arc::new(MockEntity::new().with_entity_id("not an id")),
            ]),
            false,
        )
        .await
        .unwrap();

    assert_eq!(results[0], added("sensor.outside"));
    assert_eq!(
        results[1],
        Err(AddEntityError::DuplicateEntityId("sensor.outside".into()))
    );
    assert_eq!(
        results[2],
        Err(AddEntityError::DuplicateEntityId("sensor.taken".into()))
    );
    assert!(matches!(results[3], Err(AddEntityError::InvalidEntityId { .. })));
    test.assert_state("sensor.taken", "on");
}

#[tokio::test]
async fn test_generated_ids_never_collide() {
    let test = TestOpp::new();
    let platform = test.platform(
        "light",
        Arc::new(MockIntegration::new()),
        PlatformConfig::new("mock"),
    );

    let results = platform
        .async_add_entities(
            entities([
                Arc::new(MockEntity::new().with_name("Lamp")),
                Arc::new(MockEntity::new().with_name("Lamp")),
                Arc::new(MockEntity::new().with_unique_id("lamp-3").with_name("Lamp")),
            ]),
            false,
        )
        .await
        .unwrap();

    assert_eq!(
        results,
        vec![added("light.lamp"), added("light.lamp_2"), added("light.lamp_3")]
    );
}

#[tokio::test]
async fn test_entity_namespace_prefixes_generated_ids() {
    let test = TestOpp::new();
    let platform = test.platform(
        "binary_sensor",
        Arc::new(MockIntegration::new()),
        PlatformConfig::new("mock").with_entity_namespace("garage"),
    );
    assert_eq!(platform.entity_namespace(), Some("garage"));

    let results = platform
        .async_add_entities(
            entities([
                Arc::new(MockEntity::new().with_name("Door")),
                Arc::new(MockEntity::new().with_unique_id("window-1").with_name("Window")),
            ]),
            false,
        )
        .await
        .unwrap();

    assert_eq!(
        results,
        vec![
            added("binary_sensor.garage_door"),
            added("binary_sensor.garage_window"),
        ]
    );
}

#[tokio::test]
async fn test_registry_keeps_entity_id_across_reset() {
    let test = TestOpp::new();
    let platform = test.platform(
        "light",
        Arc::new(MockIntegration::new()),
        PlatformConfig::new("mock"),
    );

    let first = Arc::new(
        MockEntity::new()
            .with_unique_id("porch-1")
            .with_name("Porch Light")
            .with_state("on"),
    );
    let results = platform
        .async_add_entities(vec![first.clone() as Arc<dyn Entity>], false)
        .await
        .unwrap();
    assert_eq!(results, vec![added("light.porch_light")]);

    platform.async_reset().await;
    assert!(first.was_removed());
    assert_eq!(platform.entity_count(), 0);
    assert_eq!(test.state("light.porch_light"), None);

    let renamed = MockEntity::new()
        .with_unique_id("porch-1")
        .with_name("Front Door Light")
        .with_state("off");
    let results = platform
        .async_add_entities(entities([Arc::new(renamed)]), false)
        .await
        .unwrap();
    assert_eq!(results, vec![added("light.porch_light")]);
    test.assert_state("light.porch_light", "off");
}

#[tokio::test]
async fn test_disabled_entities_are_not_added() {
    let test = TestOpp::new();
    let platform = test.platform(
        "sensor",
        Arc::new(MockIntegration::new()),
        PlatformConfig::new("mock"),
    );
    assert!(platform.async_setup_entry(Arc::new(ConfigEntry::new("mock", "Mock"))).await);

    let results = platform
        .async_add_entities(
            entities([
                Arc::new(
                    MockEntity::new()
                        .with_unique_id("diag")
                        .with_name("Diagnostics")
                        .disabled_by_default(),
                ),
                Arc::new(MockEntity::new().with_unique_id("temp").with_name("Temperature")),
            ]),
            false,
        )
        .await
        .unwrap();

    assert_eq!(
        results[0],
        Ok(EntityAddOutcome::Disabled("sensor.diagnostics".parse().unwrap()))
    );
    assert_eq!(results[1], added("sensor.temperature"));
    assert_eq!(test.state("sensor.diagnostics"), None);
    assert!(test.opp.entity_registry.is_registered("sensor.diagnostics"));
}

#[tokio::test]
async fn test_pref_disable_new_entities() {
    let test = TestOpp::new();
    let platform = test.platform(
        "sensor",
        Arc::new(MockIntegration::new()),
        PlatformConfig::new("mock"),
    );
    let entry = ConfigEntry::new("mock", "Mock").with_pref_disable_new_entities(true);
    assert!(platform.async_setup_entry(Arc::new(entry)).await);

    let results = platform
        .async_add_entities(
            entities([
                Arc::new(MockEntity::new().with_unique_id("new").with_name("New")),
                Arc::new(MockEntity::new().with_name("Untracked")),
            ]),
            false,
        )
        .await
        .unwrap();

    assert_eq!(
        results,
        vec![
            Ok(EntityAddOutcome::Disabled("sensor.new".parse().unwrap())),
            added("sensor.untracked"),
        ]
    );
}

#[tokio::test]
async fn test_update_before_add_failure_is_isolated() {
    let (logs, _guard) = CapturedLogs::install();
    let test = TestOpp::new();
    let platform = test.platform(
        "sensor",
        Arc::new(MockIntegration::new()),
        PlatformConfig::new("mock"),
    );
    let broken = Arc::new(MockEntity::new().with_name("Broken").failing_update());
    let healthy = Arc::new(MockEntity::new().with_name("Healthy").with_state("ok"));

    let results = platform
        .async_add_entities(entities([broken.clone(), healthy.clone()]), true)
        .await
        .unwrap();

    assert_eq!(
        results[0],
        Err(AddEntityError::UpdateBeforeAdd(UpdateError::failed(
            "mock update failed"
        )))
    );
    assert_eq!(results[1], added("sensor.healthy"));
    assert_eq!(broken.update_count(), 1);
    assert_eq!(healthy.update_count(), 1);
    assert_eq!(test.state("sensor.broken"), None);
    assert!(logs.contains(Level::ERROR, "error on device update"));
}

#[tokio::test]
async fn test_sync_entities_update_one_at_a_time() {
    let test = TestOpp::new();
    let platform = test.platform(
        "switch",
        Arc::new(MockIntegration::new()),
        PlatformConfig::new("mock").with_scan_interval(Duration::from_secs(3600)),
    );
    let tracker = UpdateTracker::new();
    let switches: Vec<Arc<MockEntity>> = (0..3)
        .map(|i| {
            Arc::new(
                MockEntity::new()
                    .with_name(format!("Relay {i}"))
                    .polled()
                    .with_polling(Polling::Sync)
                    .with_update_delay(Duration::from_millis(20))
                    .with_tracker(tracker.clone()),
            )
        })
        .collect();

    platform
        .async_add_entities(
            switches.iter().map(|e| e.clone() as Arc<dyn Entity>).collect(),
            false,
        )
        .await
        .unwrap();
    assert_eq!(platform.parallel_updates_limit(), Some(1));

    platform.async_update_entity_states().await;
    assert!(switches.iter().all(|switch| switch.update_count() == 1));
    assert_eq!(tracker.max_concurrent(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_async_entities_update_concurrently() {
    let test = TestOpp::new();
    let platform = test.platform(
        "sensor",
        Arc::new(MockIntegration::new()),
        PlatformConfig::new("mock").with_scan_interval(Duration::from_secs(3600)),
    );
    let tracker = UpdateTracker::new();
    let sensors: Vec<Arc<dyn Entity>> = (0..3)
        .map(|i| {
            Arc::new(
                MockEntity::new()
                    .with_name(format!("Probe {i}"))
                    .polled()
                    .with_update_delay(Duration::from_secs(1))
                    .with_tracker(tracker.clone()),
            ) as Arc<dyn Entity>
        })
        .collect();

    platform.async_add_entities(sensors, false).await.unwrap();
    assert_eq!(platform.parallel_updates_limit(), None);

    platform.async_update_entity_states().await;
    assert_eq!(tracker.max_concurrent(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_parallel_updates_from_config() {
    let test = TestOpp::new();
    let platform = test.platform(
        "sensor",
        Arc::new(MockIntegration::new().with_parallel_updates(5)),
        PlatformConfig::new("mock")
            .with_parallel_updates(2)
            .with_scan_interval(Duration::from_secs(3600)),
    );
    let tracker = UpdateTracker::new();
    let sensors: Vec<Arc<dyn Entity>> = (0..4)
        .map(|i| {
            Arc::new(
                MockEntity::new()
                    .with_name(format!("Probe {i}"))
                    .polled()
                    .with_update_delay(Duration::from_secs(1))
                    .with_tracker(tracker.clone()),
            ) as Arc<dyn Entity>
        })
        .collect();

    platform.async_add_entities(sensors, false).await.unwrap();
    assert_eq!(platform.parallel_updates_limit(), Some(2));

    platform.async_update_entity_states().await;
    assert_eq!(tracker.max_concurrent(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_polling_writes_updated_state() {
    let test = TestOpp::new();
    let platform = test.platform(
        "sensor",
        Arc::new(MockIntegration::new()),
        PlatformConfig::new("mock").with_scan_interval(Duration::from_secs(10)),
    );
    let meter = Arc::new(MockEntity::new().with_name("Meter").with_state("1").polled());
    let passive = Arc::new(MockEntity::new().with_name("Passive").with_state("idle"));
    platform
        .async_add_entities(entities([meter.clone(), passive.clone()]), false)
        .await
        .unwrap();
    assert!(platform.has_polling());

    meter.set_state("2");
    tokio::time::sleep(Duration::from_secs(11)).await;
    test.assert_state("sensor.meter", "2");
    assert_eq!(meter.update_count(), 1);
    assert_eq!(passive.update_count(), 0);

    meter.set_available(false);
    tokio::time::sleep(Duration::from_secs(10)).await;
    test.assert_state("sensor.meter", "unavailable");
}

#[tokio::test(start_paused = true)]
async fn test_overlapping_poll_cycle_is_skipped() {
    let (logs, _guard) = CapturedLogs::install();
    let test = TestOpp::new();
    let platform = test.platform(
        "sensor",
        Arc::new(MockIntegration::new()),
        PlatformConfig::new("mock").with_scan_interval(Duration::from_secs(10)),
    );
    let slow = Arc::new(
        MockEntity::new()
            .with_name("Slow")
            .polled()
            .with_update_delay(Duration::from_secs(20)),
    );
    platform
        .async_add_entities(entities([slow.clone()]), false)
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_secs(25)).await;

    assert_eq!(slow.update_count(), 1);
    assert_eq!(
        logs.count(
            Level::WARN,
            "Updating mock sensor took longer than the scheduled update interval"
        ),
        1
    );
    assert!(logs.contains(Level::WARN, "Update of sensor.slow is taking over 10 seconds"));
}

#[tokio::test]
async fn test_pref_disable_polling() {
    let test = TestOpp::new();
    let platform = test.platform(
        "sensor",
        Arc::new(MockIntegration::new()),
        PlatformConfig::new("mock"),
    );
    let entry = ConfigEntry::new("mock", "Mock").with_pref_disable_polling(true);
    assert!(platform.async_setup_entry(Arc::new(entry)).await);

    platform
        .async_add_entities(entities([Arc::new(MockEntity::new().polled())]), false)
        .await
        .unwrap();
    assert_eq!(platform.entity_count(), 1);
    assert!(!platform.has_polling());
}

#[tokio::test]
async fn test_removing_last_polled_entity_stops_polling() {
    let test = TestOpp::new();
    let platform = test.platform(
        "sensor",
        Arc::new(MockIntegration::new()),
        PlatformConfig::new("mock"),
    );
    let polled = Arc::new(MockEntity::new().with_name("Polled").polled());
    let passive = Arc::new(MockEntity::new().with_name("Passive"));
    platform
        .async_add_entities(entities([polled.clone(), passive]), false)
        .await
        .unwrap();
    assert!(platform.has_polling());

    assert!(platform.async_remove_entity("sensor.polled").await);
    assert!(!platform.async_remove_entity("sensor.polled").await);
    assert!(polled.was_removed());
    assert!(!platform.has_polling());
    assert_eq!(platform.entity_ids(), vec!["sensor.passive"]);
    assert_eq!(test.state("sensor.polled"), None);
}

#[tokio::test]
async fn test_entity_removing_itself_stops_polling() {
    let test = TestOpp::new();
    let platform = test.platform(
        "sensor",
        Arc::new(MockIntegration::new()),
        PlatformConfig::new("mock"),
    );
    platform
        .async_add_entities(
            entities([Arc::new(MockEntity::new().with_name("Polled").polled())]),
            false,
        )
        .await
        .unwrap();
    assert!(platform.has_polling());

    platform.get_entity("sensor.polled").unwrap().async_remove().await;
    assert_eq!(platform.entity_count(), 0);
    assert!(!platform.has_polling());
}

#[tokio::test(start_paused = true)]
async fn test_add_entities_timeout_keeps_added_entities_polled() {
    let (logs, _guard) = CapturedLogs::install();
    let test = TestOpp::new();
    let platform = test.platform(
        "sensor",
        Arc::new(MockIntegration::new()),
        PlatformConfig::new("mock"),
    );

    let result = platform
        .async_add_entities(
            entities([
                Arc::new(MockEntity::new().with_name("Fast").with_state("1").polled()),
                Arc::new(
                    MockEntity::new()
                        .with_name("Stuck")
                        .with_added_delay(Duration::from_secs(3600)),
                ),
            ]),
            false,
        )
        .await;

    assert_eq!(
        result,
        Err(PlatformError::AddEntitiesTimeout {
            domain: "sensor".to_string(),
            platform: "mock".to_string(),
            timeout: Duration::from_secs(500),
        })
    );
    assert!(logs.contains(
        Level::WARN,
        "Timed out adding entities for domain sensor with platform mock"
    ));
    test.assert_state("sensor.fast", "1");
    assert!(platform.has_polling());
}

#[tokio::test(start_paused = true)]
async fn test_not_ready_retries_with_backoff() {
    let (logs, _guard) = CapturedLogs::install();
    let test = TestOpp::new();
    let integration = Arc::new(
        MockIntegration::new()
            .not_ready_for(3)
            .with_entities(entities([Arc::new(MockEntity::new().with_name("Late"))])),
    );
    let platform = test.platform("sensor", integration.clone(), PlatformConfig::new("mock"));

    assert!(!platform.async_setup().await);
    assert_eq!(platform.setup_tries(), 1);
    assert!(platform.has_pending_retry());

    tokio::time::sleep(Duration::from_secs(31)).await;
    assert_eq!(integration.setup_calls(), 2);
    assert_eq!(platform.setup_tries(), 2);

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(integration.setup_calls(), 3);
    assert_eq!(platform.setup_tries(), 3);

    tokio::time::sleep(Duration::from_secs(90)).await;
    assert_eq!(integration.setup_calls(), 4);
    assert!(platform.is_setup_complete());
    assert_eq!(platform.setup_tries(), 0);
    assert!(!platform.has_pending_retry());
    assert_eq!(platform.entity_ids(), vec!["sensor.late"]);

    assert!(logs.contains(Level::WARN, "Retrying in 30 seconds (attempt 1)"));
    assert!(logs.contains(Level::DEBUG, "Retrying in 60 seconds (attempt 2)"));
    assert!(logs.contains(Level::DEBUG, "Retrying in 90 seconds (attempt 3)"));
    assert_eq!(logs.count(Level::WARN, "not ready yet"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_retry_wait_is_capped() {
    let (logs, _guard) = CapturedLogs::install();
    let test = TestOpp::new();
    let integration = Arc::new(MockIntegration::new().not_ready_for(8));
    let platform = test.platform(
        "sensor",
        integration.clone(),
        PlatformConfig::new("mock").with_not_ready_base_wait(Duration::from_secs(1)),
    );

    assert!(!platform.async_setup().await);
    tokio::time::sleep(Duration::from_secs(40)).await;

    assert_eq!(integration.setup_calls(), 9);
    assert!(platform.is_setup_complete());
    assert_eq!(logs.count(Level::DEBUG, "Retrying in 6 seconds"), 3);
    assert!(logs.contains(Level::DEBUG, "Retrying in 6 seconds (attempt 8)"));
}

#[tokio::test(start_paused = true)]
async fn test_setup_timeout_is_retried() {
    let (logs, _guard) = CapturedLogs::install();
    let test = TestOpp::new();
    let integration = Arc::new(MockIntegration::new().with_setup_delay(Duration::from_secs(5)));
    let platform = test.platform(
        "sensor",
        integration,
        PlatformConfig::new("mock").with_setup_timeout(Duration::from_secs(1)),
    );

    assert!(!platform.async_setup().await);
    assert!(platform.has_pending_retry());
    assert_eq!(platform.setup_tries(), 1);
    assert!(logs.contains(Level::ERROR, "Setup of platform mock is taking longer than 1 seconds"));

    platform.async_reset().await;
    assert!(!platform.has_pending_retry());
    assert_eq!(platform.setup_tries(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_reset_cancels_retried_setup_in_flight() {
    let test = TestOpp::new();
    let integration = Arc::new(
        MockIntegration::new()
            .not_ready_for(1)
            .with_setup_delay(Duration::from_secs(5))
            .with_entities(entities([Arc::new(MockEntity::new().with_name("Late"))])),
    );
    let platform = test.platform("sensor", integration.clone(), PlatformConfig::new("mock"));

    assert!(!platform.async_setup().await);

    // The retry starts 30s later and its setup takes 5s
    tokio::time::sleep(Duration::from_secs(32)).await;
    assert_eq!(integration.setup_calls(), 2);
    assert!(platform.has_pending_retry());

    platform.async_reset().await;
    tokio::time::sleep(Duration::from_secs(10)).await;

    assert!(platform.entity_ids().is_empty());
    assert!(!platform.is_setup_complete());
    assert!(!platform.has_pending_retry());
    assert_eq!(platform.setup_tries(), 0);
    assert_eq!(test.state("sensor.late"), None);

    assert!(platform.async_setup().await);
    assert_eq!(platform.entity_ids(), vec!["sensor.late"]);
}

#[tokio::test(start_paused = true)]
async fn test_slow_setup_warns() {
    let (logs, _guard) = CapturedLogs::install();
    let test = TestOpp::new();
    let integration = Arc::new(MockIntegration::new().with_setup_delay(Duration::from_secs(3)));
    let mut config = PlatformConfig::new("mock");
    config.slow_setup_warning = Duration::from_secs(2);
    let platform = test.platform("sensor", integration, config);

    assert!(platform.async_setup().await);
    assert!(logs.contains(Level::WARN, "Setup of platform sensor.mock is taking over 2 seconds."));
}

#[tokio::test]
async fn test_setup_error_is_not_retried() {
    let (logs, _guard) = CapturedLogs::install();
    let test = TestOpp::new();
    let integration = Arc::new(MockIntegration::new().failing("bad credentials"));
    let platform = test.platform("sensor", integration, PlatformConfig::new("mock"));

    assert!(!platform.async_setup().await);
    assert!(!platform.has_pending_retry());
    assert_eq!(platform.setup_tries(), 0);
    assert!(logs.contains(
        Level::ERROR,
        "Error while setting up mock platform for sensor: bad credentials"
    ));
}

#[tokio::test]
async fn test_destroyed_platform_refuses_work() {
    let test = TestOpp::new();
    let platform = test.platform(
        "sensor",
        Arc::new(MockIntegration::new()),
        PlatformConfig::new("mock"),
    );
    platform.async_destroy().await;

    assert!(!platform.async_setup().await);
    assert_eq!(
        platform
            .async_add_entities(entities([Arc::new(MockEntity::new())]), false)
            .await,
        Err(PlatformError::Destroyed("sensor.mock".into()))
    );
}

#[tokio::test]
async fn test_coordinator_entity_follows_coordinator() {
    let test = TestOpp::new();
    let fail = Arc::new(AtomicBool::new(false));
    let reading = Arc::new(std::sync::atomic::AtomicU32::new(20));
    let coordinator = {
        let fail = fail.clone();
        let reading = reading.clone();
        DataUpdateCoordinator::new(&test.opp, "weather", None, move || {
            let result = if fail.load(Ordering::SeqCst) {
                Err(UpdateError::connection("station offline"))
            } else {
                Ok(reading.fetch_add(1, Ordering::SeqCst))
            };
            async move { result }
        })
    };
    let entity = CoordinatorEntity::new(coordinator.clone())
        .with_unique_id("outside-temp")
        .with_name("Outside Temperature")
        .with_unit("°C")
        .with_state(|value: &u32| Some(value.to_string()));

    let platform = test.platform(
        "sensor",
        Arc::new(MockIntegration::new()),
        PlatformConfig::new("weather"),
    );
    platform
        .async_add_entities(vec![Arc::new(entity) as Arc<dyn Entity>], false)
        .await
        .unwrap();
    assert!(!platform.has_polling());
    assert_eq!(coordinator.listener_count(), 1);
    test.assert_state("sensor.outside_temperature", "unknown");

    coordinator.async_refresh().await.unwrap();
    test.assert_state("sensor.outside_temperature", "20");
    let state = test.opp.states.get("sensor.outside_temperature").unwrap();
    assert_eq!(state.attributes["unit_of_measurement"], "°C");

    fail.store(true, Ordering::SeqCst);
    coordinator.async_refresh().await.unwrap();
    test.assert_state("sensor.outside_temperature", "unavailable");

    fail.store(false, Ordering::SeqCst);
    coordinator.async_refresh().await.unwrap();
    test.assert_state("sensor.outside_temperature", "21");

    platform.async_reset().await;
    assert_eq!(coordinator.listener_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_coordinator_entity_update_requests_refresh() {
    let test = TestOpp::new();
    let coordinator = DataUpdateCoordinator::new(&test.opp, "counter", None, || async {
        Ok::<_, UpdateError>(1u8)
    });
    let entity = CoordinatorEntity::new(coordinator.clone())
        .with_name("Counter")
        .with_state(|value: &u8| Some(value.to_string()));
    let platform = test.platform(
        "sensor",
        Arc::new(MockIntegration::new()),
        PlatformConfig::new("counter"),
    );

    platform
        .async_add_entities(vec![Arc::new(entity) as Arc<dyn Entity>], true)
        .await
        .unwrap();
    test.assert_state("sensor.counter", "1");
    assert_eq!(coordinator.data().as_deref(), Some(&1));
}
