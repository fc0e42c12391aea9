// Logging configuration and structured event helpers

use recovery_engine::circuit_breaker::CircuitState;
use recovery_engine::config::{EngineConfig, LoggingSection};
use recovery_engine::logging::{init_logging, utils, ColorConfig, LogConfig, LogFormat};
use recovery_engine::policy::RecoveryStrategy;
use recovery_engine::taxonomy::{ErrorDetails, ErrorKind};
use std::path::Path;
use tracing::Level;

#[test]
fn test_log_config_levels_from_cli() {
    assert_eq!(LogConfig::from_cli(false, false, None).level, Level::INFO);
    assert_eq!(LogConfig::from_cli(true, false, None).level, Level::DEBUG);
    assert_eq!(LogConfig::from_cli(false, true, None).level, Level::ERROR);
}

#[test]
fn test_color_configuration() {
    let always = LogConfig::from_cli(false, false, Some("always".to_string()));
    assert_eq!(always.color, ColorConfig::Always);
    assert!(always.should_use_colors());

    let unknown = LogConfig::from_cli(false, false, Some("sometimes".to_string()));
    assert_eq!(unknown.color, ColorConfig::Auto);
}

#[test]
fn test_logging_section_conversion() {
    let section = LoggingSection {
        level: "warn".to_string(),
        format: LogFormat::Compact,
    };
    let config = section.to_log_config().unwrap();
    assert_eq!(config.level, Level::WARN);
    assert_eq!(config.format, LogFormat::Compact);
}

#[test]
fn test_invalid_log_level_rejected() {
    let result = EngineConfig::from_yaml("logging:\n  level: chatty\n");
    assert!(result.is_err());
}

#[test]
fn test_init_logging_is_idempotent() {
    let config = LogConfig::default().with_format(LogFormat::Json);
    assert!(init_logging(config.clone()).is_ok());
    assert!(init_logging(config).is_ok());
}

#[test]
fn test_event_helpers_do_not_panic_without_subscriber() {
    let details = ErrorDetails::builder(ErrorKind::DiskFull, "disk full").build();

    let span = utils::recovery_span("export", ErrorKind::DiskFull);
    let _entered = span.enter();
    utils::log_escalation("export", &details);
    utils::log_classification(&details, "export");
    utils::log_recovery_result("export", false, None, 2);
    utils::log_recovery_result("export", true, Some(RecoveryStrategy::Retry), 1);
    utils::log_circuit_transition("export", CircuitState::Closed, CircuitState::Open, 5);
    utils::log_circuit_transition("export", CircuitState::HalfOpen, CircuitState::Open, 6);
    utils::log_config_validation(Path::new("recovery.yaml"), true);
}
