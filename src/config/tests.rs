use std::time::Duration;

use clap::Parser;

use super::*;

#[test]
fn cli_overrides_take_highest_precedence() {
    let mut raw = RawSettings::default();
    raw.server.port = Some(4000);
    raw.logging.level = Some("info".to_string());

    let overrides = ServeOverrides {
        server_port: Some(4321),
        log_level: Some("debug".to_string()),
        ..Default::default()
    };

    raw.apply_serve_overrides(&overrides);
    let settings = Settings::from_raw(raw).expect("valid settings");

    assert_eq!(settings.server.addr.port(), 4321);
    assert_eq!(settings.logging.level, LevelFilter::DEBUG);
}

#[test]
fn defaults_run_memory_only() {
    let settings = Settings::from_raw(RawSettings::default()).expect("valid settings");
    assert!(settings.redis.url.is_none());
    assert!(settings.cache.enabled);
    assert_eq!(settings.cache.namespace, "gazette");
    assert_eq!(settings.redis.environment, RuntimeEnvironment::Development);
}

#[test]
fn cache_defaults_follow_the_cache_config() {
    let settings = Settings::from_raw(RawSettings::default()).expect("valid settings");
    let resolved = CacheConfig::from(&settings.cache);
    let defaults = CacheConfig::default();

    assert_eq!(resolved.enabled, defaults.enabled);
    assert_eq!(resolved.namespace, defaults.namespace);
    assert_eq!(resolved.memory_max_entries, defaults.memory_max_entries);
    assert_eq!(resolved.sweep_interval_seconds, defaults.sweep_interval_seconds);
    assert_eq!(
        resolved.response_body_limit_bytes,
        defaults.response_body_limit_bytes
    );
}

#[test]
fn blank_redis_url_disables_the_remote_tier() {
    let mut raw = RawSettings::default();
    raw.redis.url = Some("redis://cache:6379".to_string());
    raw.apply_serve_overrides(&ServeOverrides {
        redis_url: Some("   ".to_string()),
        ..Default::default()
    });

    let settings = Settings::from_raw(raw).expect("valid settings");
    assert!(settings.redis.url.is_none());
}

#[test]
fn production_environment_is_more_patient() {
    let mut raw = RawSettings::default();
    raw.redis.environment = Some("production".to_string());

    let settings = Settings::from_raw(raw).expect("valid settings");
    assert_eq!(
        settings.redis.connection.connect_timeout,
        Duration::from_secs(10)
    );
    assert_eq!(settings.redis.connection.retry.max_retries, 20);
}

#[test]
fn explicit_redis_tuning_overrides_environment_defaults() {
    let mut raw = RawSettings::default();
    raw.redis.connect_timeout_seconds = Some(5);
    raw.redis.max_retries = Some(7);

    let settings = Settings::from_raw(raw).expect("valid settings");
    assert_eq!(
        settings.redis.connection.connect_timeout,
        Duration::from_secs(5)
    );
    assert_eq!(settings.redis.connection.retry.max_retries, 7);
}

#[test]
fn unknown_environment_is_rejected() {
    let mut raw = RawSettings::default();
    raw.redis.environment = Some("staging".to_string());

    let err = Settings::from_raw(raw).expect_err("invalid environment");
    assert!(matches!(
        err,
        LoadError::Invalid {
            key: "redis.environment",
            ..
        }
    ));
}

#[test]
fn namespace_rejects_glob_characters() {
    let mut raw = RawSettings::default();
    raw.cache.namespace = Some("gaz*ette".to_string());
    assert!(Settings::from_raw(raw).is_err());
}

#[test]
fn cli_json_logging_enforces_format() {
    let mut raw = RawSettings::default();
    raw.apply_serve_overrides(&ServeOverrides {
        log_json: Some(true),
        ..Default::default()
    });

    let settings = Settings::from_raw(raw).expect("valid settings");
    assert!(matches!(settings.logging.format, LogFormat::Json));
}

#[test]
fn default_to_serve_command() {
    let args = CliArgs::parse_from(["gazette"]);
    let command = args
        .command
        .unwrap_or(Command::Serve(Box::<ServeArgs>::default()));
    assert!(matches!(command, Command::Serve(_)));
}

#[test]
fn parse_serve_arguments() {
    let args = CliArgs::parse_from([
        "gazette",
        "serve",
        "--redis-url",
        "redis://localhost:6379",
        "--cache-enabled",
        "false",
    ]);

    match args.command.expect("serve command") {
        Command::Serve(serve) => {
            assert_eq!(
                serve.overrides.redis_url.as_deref(),
                Some("redis://localhost:6379")
            );
            assert_eq!(serve.overrides.cache_enabled, Some(false));
        }
    }
}
