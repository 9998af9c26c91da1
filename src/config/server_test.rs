use std::time::Duration;

use super::*;

#[test]
fn default_server_config_should_be_valid() {
    assert!(ServerConfig::default().validate().is_ok());
}

#[test]
fn pong_timeout_must_exceed_ping_interval() {
    let config = ServerConfig {
        ping_interval_in_ms: 1000,
        pong_timeout_in_ms: 1000,
        ..Default::default()
    };
    assert!(config.validate().is_err());
}

#[test]
fn zero_limits_should_be_rejected() {
    let cases = [
        ServerConfig {
            max_message_size: 0,
            ..Default::default()
        },
        ServerConfig {
            max_conns: 0,
            ..Default::default()
        },
        ServerConfig {
            subscriber_queue_capacity: 0,
            ..Default::default()
        },
        ServerConfig {
            drop_interval_in_ms: 0,
            ..Default::default()
        },
        ServerConfig {
            max_fall_behind_in_ms: 0,
            ..Default::default()
        },
    ];

    for case in cases {
        assert!(case.validate().is_err(), "{case:?} should be rejected");
    }
}

#[test]
fn tiny_message_byte_limits_should_be_rejected() {
    let config = ServerConfig {
        max_message_bytes: 100,
        ..Default::default()
    };
    assert!(config.validate().is_err());

    let config = ServerConfig {
        max_client_message_bytes: 8,
        ..Default::default()
    };
    assert!(config.validate().is_err());
}

#[test]
fn health_check_interval_tracks_tightest_deadline() {
    let config = ServerConfig {
        ping_interval_in_ms: 400,
        pong_timeout_in_ms: 1000,
        max_fall_behind_in_ms: 2000,
        ..Default::default()
    };
    assert_eq!(config.health_check_interval(), Duration::from_millis(100));

    let config = ServerConfig {
        ping_interval_in_ms: 8,
        pong_timeout_in_ms: 20,
        max_fall_behind_in_ms: 20,
        ..Default::default()
    };
    assert_eq!(config.health_check_interval(), Duration::from_millis(10));
}

#[test]
fn listen_addr_should_join_address_and_port() {
    let config = ServerConfig {
        listen_address: "127.0.0.1".into(),
        port: 0,
        ..Default::default()
    };
    assert_eq!(config.listen_addr(), "127.0.0.1:0");
}
