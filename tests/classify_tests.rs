use slp_census::classify::{assess, DECOY_DESCRIPTION};
use slp_census::types::{OnlineMode, ServerStatus};

fn parse(json: &str) -> ServerStatus {
    serde_json::from_str(json).expect("valid status json")
}

#[test]
fn duplicate_uuid_is_fake() {
    let status = parse(
        r#"{"version":{"name":"1.20","protocol":763},"description":"A server",
            "players":{"max":20,"online":2,"sample":[
              {"name":"a","id":"069a79f4-44e9-4726-a5be-fca90e38aaf5"},
              {"name":"b","id":"069a79f4-44e9-4726-a5be-fca90e38aaf5"}]}}"#,
    );
    assert!(assess(&status).is_fake_sample);
}

#[test]
fn single_v4_uuid_is_genuine_online() {
    let status = parse(
        r#"{"version":{"name":"1.20","protocol":763},"description":"A server",
            "players":{"max":20,"online":1,"sample":[
              {"name":"Steve","id":"069a79f4-44e9-4726-a5be-fca90e38aaf5"}]}}"#,
    );
    let verdict = assess(&status);
    assert!(!verdict.is_fake_sample);
    assert_eq!(verdict.online_mode, OnlineMode::Online);
}

#[test]
fn decoy_description_wins_over_sample() {
    let json = serde_json::json!({
        "version": {"name": "1.20", "protocol": 763},
        "description": {"text": DECOY_DESCRIPTION},
        "players": {"max": 20, "online": 1, "sample": [
            {"name": "Steve", "id": "069a79f4-44e9-4726-a5be-fca90e38aaf5"}
        ]}
    });
    let status: ServerStatus = serde_json::from_value(json).unwrap();
    let verdict = assess(&status);
    assert!(verdict.is_fake_sample);
    assert_eq!(verdict.online_mode, OnlineMode::Unknown);
}

#[test]
fn no_players_field_is_unknown() {
    let status = parse(r#"{"version":{"name":"1.20","protocol":763},"description":"A server"}"#);
    let verdict = assess(&status);
    assert_eq!(verdict.online_mode, OnlineMode::Unknown);
    assert!(verdict.is_fake_sample);
}

#[test]
fn entry_without_id_is_fake() {
    let status = parse(
        r#"{"description":"x","players":{"max":1,"online":1,"sample":[{"name":"Steve"}]}}"#,
    );
    assert!(assess(&status).is_fake_sample);
}
