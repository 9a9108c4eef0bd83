use spindle::SchedulerBuilder;
use spindle::config::{DEFAULT_STACK_SIZE, RuntimeConfig};

#[test]
fn test_partial_json_keeps_defaults() {
    let config: RuntimeConfig =
        serde_json::from_str(r#"{ "scheduler": { "threads": 4 }, "io": { "max_events": 32 } }"#)
            .unwrap();

    assert_eq!(config.scheduler.threads, 4);
    assert_eq!(config.scheduler.name, "spindle");
    assert!(!config.scheduler.use_caller);
    assert_eq!(config.fiber.stack_size, DEFAULT_STACK_SIZE);
    assert_eq!(config.io.max_events, 32);
    assert_eq!(config.io.initial_fd_capacity, 128);
}

#[test]
fn test_config_survives_json() {
    let mut config = RuntimeConfig::default();
    config.scheduler.name = "edge".to_string();
    config.scheduler.use_caller = true;
    config.fiber.stack_size = 64 * 1024;

    let json = serde_json::to_string(&config).unwrap();
    let back: RuntimeConfig = serde_json::from_str(&json).unwrap();

    assert_eq!(back, config);
}

#[test]
fn test_builder_applies_overrides() {
    let scheduler = SchedulerBuilder::from_config(RuntimeConfig::default())
        .threads(3)
        .name("built")
        .build();

    assert_eq!(scheduler.name(), "built");
    assert!(!scheduler.is_running());

    scheduler.start().unwrap();
    assert_eq!(scheduler.worker_ids().len(), 3);
    scheduler.stop();
}

#[test]
fn test_builder_creates_io_manager() {
    let io = SchedulerBuilder::from_config(RuntimeConfig::default())
        .threads(1)
        .name("built-io")
        .fd_capacity(1)
        .max_events(8)
        .build_io()
        .unwrap();

    assert_eq!(io.scheduler().name(), "built-io");
    assert_eq!(io.pending_event_count(), 0);
}
