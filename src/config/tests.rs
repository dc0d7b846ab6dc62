use super::*;

#[test]
fn cli_overrides_take_highest_precedence() {
    let mut raw = RawSettings::default();
    raw.jobs.requery_concurrency = Some(2);
    raw.logging.level = Some("info".to_string());

    raw.apply_logging_overrides(&LoggingOverrides {
        log_level: Some("debug".to_string()),
        log_json: None,
    });
    raw.apply_worker_overrides(&WorkerArgs {
        jobs_requery_concurrency: Some(6),
        ..Default::default()
    });
    let settings = Settings::from_raw(raw).expect("valid settings");

    assert_eq!(settings.jobs.requery_concurrency.get(), 6);
    assert_eq!(settings.logging.level, LevelFilter::DEBUG);
}

#[test]
fn cache_defaults_match_documented_values() {
    let settings = Settings::from_raw(RawSettings::default()).expect("valid settings");

    assert!(settings.cache.enabled);
    assert!(settings.cache.query_caching_enabled);
    assert_eq!(settings.cache.default_cache_duration_seconds, 0);
    assert_eq!(settings.cache.sweep_throttle, Duration::from_secs(86_400));
    assert_eq!(settings.cache.path_query_param, "p");
    assert_eq!(settings.cache.page_trigger, "p");
    assert_eq!(settings.cache.resource_trigger, "cpresources");
    assert!(settings.cache.site_url.is_none());
    assert_eq!(settings.jobs.sweep_interval, Duration::from_secs(3_600));
}

#[test]
fn blank_site_url_means_none() {
    let mut raw = RawSettings::default();
    raw.cache.site_url = Some("   ".to_string());
    let settings = Settings::from_raw(raw).expect("valid settings");
    assert!(settings.cache.site_url.is_none());
}

#[test]
fn non_http_site_url_is_rejected() {
    let mut raw = RawSettings::default();
    raw.cache.site_url = Some("ftp://example.com".to_string());
    let err = Settings::from_raw(raw).expect_err("invalid scheme");
    assert!(matches!(err, LoadError::Invalid { key: "cache.site_url", .. }));
}

#[test]
fn empty_path_query_param_is_rejected() {
    let mut raw = RawSettings::default();
    raw.cache.path_query_param = Some(String::new());
    let err = Settings::from_raw(raw).expect_err("empty param");
    assert!(matches!(
        err,
        LoadError::Invalid {
            key: "cache.path_query_param",
            ..
        }
    ));
}

#[test]
fn zero_sweep_interval_is_rejected() {
    let mut raw = RawSettings::default();
    raw.jobs.sweep_interval_seconds = Some(0);
    assert!(Settings::from_raw(raw).is_err());
}

#[test]
fn cli_json_logging_enforces_format() {
    let mut raw = RawSettings::default();
    raw.apply_logging_overrides(&LoggingOverrides {
        log_level: None,
        log_json: Some(true),
    });
    let settings = Settings::from_raw(raw).expect("valid settings");

    assert!(matches!(settings.logging.format, LogFormat::Json));
}

#[test]
fn cache_settings_feed_cache_config() {
    let mut raw = RawSettings::default();
    raw.cache.site_url = Some("https://example.com".to_string());
    raw.cache.default_cache_duration_seconds = Some(120);
    let settings = Settings::from_raw(raw).expect("valid settings");

    let config = crate::cache::CacheConfig::from(&settings.cache);
    assert_eq!(config.default_duration(), Duration::from_secs(120));
    assert_eq!(
        config.transient_resource_marker().as_deref(),
        Some("https://example.com/cpresources/transforms")
    );
}

#[test]
fn no_subcommand_defaults_to_worker() {
    let args = CliArgs::parse_from(["tessera"]);
    assert!(args.command.is_none());
}

#[test]
fn parse_invalidate_arguments() {
    let args = CliArgs::parse_from([
        "tessera",
        "invalidate",
        "--database-url",
        "postgres://example",
        "--entity-id",
        "4",
        "--entity-id",
        "9",
        "--entity-type",
        "entry",
    ]);

    match args.command.expect("invalidate command") {
        Command::Invalidate(invalidate) => {
            assert_eq!(
                invalidate.database.database_url.as_deref(),
                Some("postgres://example")
            );
            assert_eq!(invalidate.entity_ids, vec![4, 9]);
            assert_eq!(invalidate.entity_types, vec!["entry".to_string()]);
            assert!(!invalidate.no_requery);
        }
        _ => panic!("wrong command parsed"),
    }
}

#[test]
fn invalidate_requires_a_target() {
    let result = CliArgs::try_parse_from(["tessera", "invalidate"]);
    assert!(result.is_err());
}

#[test]
fn parse_purge_without_ids() {
    let args = CliArgs::parse_from(["tessera", "purge"]);
    match args.command.expect("purge command") {
        Command::Purge(purge) => assert!(purge.entry_ids.is_empty()),
        _ => panic!("wrong command parsed"),
    }
}

#[test]
fn global_log_flags_follow_subcommand() {
    let args = CliArgs::parse_from(["tessera", "stats", "--log-level", "warn", "--json"]);
    assert_eq!(args.logging.log_level.as_deref(), Some("warn"));
    match args.command.expect("stats command") {
        Command::Stats(stats) => assert!(stats.json),
        _ => panic!("wrong command parsed"),
    }
}
