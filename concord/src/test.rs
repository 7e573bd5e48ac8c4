use test_log::test;

use concord_net::RequestKind;
use concord_rep::Mode;

use crate::config::TestConfig;

const SAMPLE: &str = r#"{
    "num_servers": 2,
    "consistency_level": "linearizability",
    "port_number": { "0": [5000, 5001, 5002], "1": [5010, 5011, 5012] },
    "clients": [
        { "client_number": 0, "server_number": 0,
          "requests": [ {"type": "set", "key": "a", "value": 3},
                        {"type": "sleep", "value": 100},
                        {"type": "get", "key": "a", "value": 0} ] },
        { "client_number": 1, "server_number": 1,
          "requests": [ {"type": "get", "key": "a"} ] }
    ]
}"#;

#[test]
fn test_config_parses() {
    let cfg: TestConfig = serde_json::from_str(SAMPLE).unwrap();
    cfg.validate().unwrap();
    assert_eq!(cfg.consistency_level, Mode::Linearizability);
    assert_eq!(cfg.ports(1).unwrap().peer_out(), 5011);
    assert_eq!(cfg.client_addr(0).unwrap().port(), 5002);
    assert_eq!(cfg.peer_addrs_except(0).unwrap(), vec![cfg.peer_addr(1).unwrap()]);
    assert_eq!(cfg.clients[0].requests[1].kind, RequestKind::Sleep);
}

#[test]
fn test_config_rejects_unknown_level() {
    let text = SAMPLE.replace("linearizability", "monotonic-reads");
    assert!(serde_json::from_str::<TestConfig>(&text).is_err());
}

#[test]
fn test_config_accepts_causal_level_in_file() {
    // The level parses; refusing it is the replica's job at startup.
    let text = SAMPLE.replace("linearizability", "causal");
    let cfg: TestConfig = serde_json::from_str(&text).unwrap();
    cfg.validate().unwrap();
    assert_eq!(cfg.consistency_level, Mode::Causal);
}

#[test]
fn test_config_rejects_server_count_mismatch() {
    let text = SAMPLE.replace("\"num_servers\": 2", "\"num_servers\": 3");
    let cfg: TestConfig = serde_json::from_str(&text).unwrap();
    assert!(cfg.validate().is_err());
}

#[test]
fn test_config_rejects_client_on_unknown_replica() {
    let text = SAMPLE.replace("\"server_number\": 1", "\"server_number\": 7");
    let cfg: TestConfig = serde_json::from_str(&text).unwrap();
    assert!(cfg.validate().is_err());
}
