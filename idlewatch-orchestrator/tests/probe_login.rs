mod common;

use common::{FakeConnector, WorkerScript};
use idlewatch_common::{ActivityState, CredentialSet, ProbeError};
use idlewatch_orchestrator::probe::{ActivityProbe, ProbeConfig};
use std::sync::Arc;

fn attempt(host: &str, user: &str, password: &str) -> (String, String, String) {
    (host.to_string(), user.to_string(), password.to_string())
}

#[tokio::test]
async fn passwords_are_tried_in_order_until_one_works() {
    let connector = Arc::new(
        FakeConnector::new().worker("10.0.0.1", WorkerScript::busy().with_logins(&[("root", "b")])),
    );
    let credentials = Arc::new(CredentialSet::from_json(r#"{"root": ["a", "b", "c"]}"#).unwrap());
    let probe = ActivityProbe::new(connector.clone(), credentials, ProbeConfig::default());

    let session = probe.connect("bld-linux64-ec2-001", "10.0.0.1").await.unwrap();
    assert_eq!(
        connector.attempts(),
        vec![attempt("10.0.0.1", "root", "a"), attempt("10.0.0.1", "root", "b")]
    );

    let report = probe
        .last_activity("bld-linux64-ec2-001", session.as_ref())
        .await
        .unwrap();
    assert_eq!(report.state, ActivityState::IdleFor(0.0));
    assert!(!report.reboot_issued);
}

#[tokio::test]
async fn exhausted_credentials_mean_unreachable() {
    let connector = Arc::new(FakeConnector::new());
    let credentials = Arc::new(
        CredentialSet::from_json(r#"{"root": ["a"], "cltbld": ["c", "d"]}"#).unwrap(),
    );
    let probe = ActivityProbe::new(connector.clone(), credentials, ProbeConfig::default());

    let err = probe.connect("tst-linux64-ec2-001", "10.0.0.7").await.err();
    assert!(matches!(err, Some(ProbeError::Unreachable)));
    assert_eq!(
        connector.attempts(),
        vec![
            attempt("10.0.0.7", "root", "a"),
            attempt("10.0.0.7", "cltbld", "c"),
            attempt("10.0.0.7", "cltbld", "d"),
        ]
    );
}

#[tokio::test]
async fn master_host_comes_from_buildbot_tac() {
    let connector = Arc::new(FakeConnector::new().worker("10.0.0.1", WorkerScript::idle()));
    let probe = ActivityProbe::new(connector, common::credentials(), ProbeConfig::default());
    let session = probe.connect("bld-linux64-ec2-001", "10.0.0.1").await.unwrap();
    assert_eq!(
        probe.master_host(session.as_ref()).await.unwrap().as_deref(),
        Some(common::MASTER)
    );
}
