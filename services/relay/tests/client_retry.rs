//! The retrying client transport against a real relay: transparent busy
//! retries, budget exhaustion, and terminal errors.

use relay::{Relay, RelayConfig};
use relay_client::{CallOptions, ClientError, RelayClient, RetryPolicy};
use relay_protocol::error_codes;
use relay_test_utils::{MockClient, MockEditor};
use serde_json::json;
use std::time::Duration;

fn fast_policy(budget: Duration) -> RetryPolicy {
    RetryPolicy {
        initial_delay: Duration::from_millis(20),
        max_delay: Duration::from_millis(50),
        budget,
    }
}

#[tokio::test]
async fn busy_instance_is_retried_until_it_frees_up() {
    let relay = Relay::spawn(RelayConfig::for_tests()).await.unwrap();
    let mut editor = MockEditor::connect_registered(relay.addr(), "/p/A").await;
    let mut occupant = MockClient::connect(relay.addr()).await.unwrap();

    // Occupy the single in-flight slot, then release it shortly after.
    let occupant_task = tokio::spawn(async move {
        occupant.request("c0:r1", None, "slow", json!({})).await
    });
    let cmd = editor.expect_command().await;
    let editor_task = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        editor.reply_success(&cmd.id, json!({})).await;
        editor.spawn_echo()
    });

    let mut client =
        RelayClient::with_policy(relay.addr(), fast_policy(Duration::from_secs(10)));
    let data = client
        .call("echo", json!({ "after": "busy" }), CallOptions::default())
        .await
        .unwrap();
    assert_eq!(data, Some(json!({ "after": "busy" })));

    assert!(occupant_task.await.unwrap().success);
    editor_task.await.unwrap().stop().await;
    relay.shutdown();
}

#[tokio::test]
async fn retry_budget_exhaustion_surfaces_instance_busy() {
    let relay = Relay::spawn(RelayConfig::for_tests()).await.unwrap();
    let mut editor = MockEditor::connect_registered(relay.addr(), "/p/A").await;
    let mut occupant = MockClient::connect(relay.addr()).await.unwrap();

    let occupant_task = tokio::spawn(async move {
        occupant
            .request_with_timeout("c0:r1", None, "stall", json!({}), Some(4_000))
            .await
    });
    let _cmd = editor.expect_command().await;

    // The editor never finishes within the client's budget.
    let mut client =
        RelayClient::with_policy(relay.addr(), fast_policy(Duration::from_millis(300)));
    let err = client
        .call("echo", json!({}), CallOptions::default())
        .await
        .unwrap_err();
    match err {
        ClientError::Relay { code, .. } => assert_eq!(code, error_codes::INSTANCE_BUSY),
        other => panic!("expected the last transient error, got {other:?}"),
    }

    drop(occupant_task);
    drop(editor);
    relay.shutdown();
}

#[tokio::test]
async fn terminal_editor_error_is_not_retried() {
    let relay = Relay::spawn(RelayConfig::for_tests()).await.unwrap();
    let mut editor = MockEditor::connect_registered(relay.addr(), "/p/A").await;

    let addr = relay.addr();
    let client_task = tokio::spawn(async move {
        let mut client = RelayClient::with_policy(addr, fast_policy(Duration::from_secs(5)));
        client
            .call("explode", json!({}), CallOptions::default())
            .await
    });

    // Exactly one command arrives; the editor-supplied error is relayed
    // verbatim and the client does not retry.
    let cmd = editor.expect_command().await;
    editor
        .reply_error(&cmd.id, error_codes::INTERNAL_ERROR, "script exception")
        .await;
    editor
        .expect_no_command(Duration::from_millis(300))
        .await;

    match client_task.await.unwrap().unwrap_err() {
        ClientError::Relay { code, message } => {
            assert_eq!(code, error_codes::INTERNAL_ERROR);
            assert_eq!(message, "script exception");
        }
        other => panic!("expected Relay error, got {other:?}"),
    }
    relay.shutdown();
}

#[tokio::test]
async fn call_targets_an_explicit_instance() {
    let relay = Relay::spawn(RelayConfig::for_tests()).await.unwrap();
    let handle_a = MockEditor::connect_registered(relay.addr(), "/p/A")
        .await
        .spawn_echo();
    let handle_b = MockEditor::connect_registered(relay.addr(), "/p/B")
        .await
        .spawn_echo();

    let mut client = RelayClient::new(relay.addr());
    let data = client
        .call(
            "echo",
            json!({ "target": "B" }),
            CallOptions {
                instance_id: Some("/p/B".to_owned()),
                ..CallOptions::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(data, Some(json!({ "target": "B" })));
    assert_eq!(handle_b.commands_executed(), 1);
    assert_eq!(handle_a.commands_executed(), 0);

    let snapshot = client.list_instances().await.unwrap();
    assert_eq!(snapshot.len(), 2);

    client.set_default("/p/B").await.unwrap();
    let data = client
        .call("echo", json!({ "n": 2 }), CallOptions::default())
        .await
        .unwrap();
    assert_eq!(data, Some(json!({ "n": 2 })));
    assert_eq!(handle_b.commands_executed(), 2);

    handle_a.stop().await;
    handle_b.stop().await;
    relay.shutdown();
}
