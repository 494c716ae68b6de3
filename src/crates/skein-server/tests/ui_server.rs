//! UI bridge tests driving real workflows end to end over the packet
//! endpoint.

use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

use skein_core::config::Settings;
use skein_core::executor::ExecutorRegistry;
use skein_core::testing::StubProject;
use skein_core::{Message, StepType};
use skein_server::manager::proto::{Packet, PacketEnvelope};
use skein_server::{InMemoryEndpoint, Manager, UIServer};

fn input_settings() -> Settings {
    let mut settings: Settings = serde_json::from_value(json!({
        "workflows": {
            "main": {
                "nodes": [{
                    "name": "ask",
                    "type": "input",
                    "message": "Say something",
                }],
                "edges": [],
            },
        },
    }))
    .unwrap();
    settings.sync_workflow_names();
    settings
}

fn build_server() -> (Arc<UIServer>, Arc<InMemoryEndpoint>) {
    let project = Arc::new(StubProject::with_settings(input_settings()));
    let manager = Manager::new(project, ExecutorRegistry::with_builtins());
    let (server_endpoint, client_endpoint) = InMemoryEndpoint::pair();
    let server = UIServer::with_manager(manager, server_endpoint);
    (server, client_endpoint)
}

async fn recv(client: &Arc<InMemoryEndpoint>) -> PacketEnvelope {
    use skein_server::Endpoint;
    tokio::time::timeout(Duration::from_secs(5), client.recv())
        .await
        .expect("packet within timeout")
        .expect("endpoint open")
}

async fn send_user_input(client: &Arc<InMemoryEndpoint>, msg_id: u64, text: &str) {
    use skein_server::Endpoint;
    client
        .send(PacketEnvelope {
            msg_id,
            source_msg_id: None,
            payload: Packet::UserInput {
                message: Message::user(text),
            },
        })
        .await
        .unwrap();
}

/// Wait for the next RunnerReq packet, skipping status traffic.
async fn next_runner_req(client: &Arc<InMemoryEndpoint>) -> (Packet, bool) {
    loop {
        let envelope = recv(client).await;
        if let Packet::RunnerReq { input_required, .. } = &envelope.payload {
            let required = *input_required;
            return (envelope.payload, required);
        }
    }
}

fn req_step(packet: &Packet) -> &skein_core::Step {
    match packet {
        Packet::RunnerReq { step, .. } => step,
        other => panic!("expected RunnerReq, got {other:?}"),
    }
}

#[tokio::test]
async fn end_to_end_input_workflow_over_packets() {
    let (server, client) = build_server();
    server.start().await.unwrap();

    // Start the workflow through the command surface.
    send_user_input(&client, 1, "/run main").await;

    // The input node prompts; the bridge raises an input prompt.
    let (packet, input_required) = next_runner_req(&client).await;
    let step = req_step(&packet);
    assert_eq!(step.step_type, StepType::Prompt);
    assert!(input_required);
    assert_eq!(step.message.as_ref().unwrap().text, "Say something");

    let envelope = recv(&client).await;
    match &envelope.payload {
        Packet::InputPrompt { title, .. } => {
            assert_eq!(title.as_deref(), Some("Input"));
        }
        other => panic!("expected InputPrompt, got {other:?}"),
    }

    // Reply with the user's text.
    send_user_input(&client, 2, "hello bridge").await;

    // The reply is recorded and echoed; the node then asks for
    // confirmation (manual by default).
    let mut saw_input_step = false;
    let mut saw_echo = false;
    loop {
        let envelope = recv(&client).await;
        match &envelope.payload {
            Packet::RunnerReq { step, input_required, .. } => match step.step_type {
                StepType::InputMessage => {
                    saw_input_step = true;
                    assert_eq!(step.message.as_ref().unwrap().text, "hello bridge");
                }
                StepType::OutputMessage => {
                    saw_echo = true;
                    assert_eq!(step.message.as_ref().unwrap().text, "hello bridge");
                }
                StepType::PromptConfirm => {
                    assert!(input_required);
                    break;
                }
                _ => {}
            },
            _ => {}
        }
    }
    assert!(saw_input_step);
    assert!(saw_echo);

    // Empty input approves the final response.
    send_user_input(&client, 3, "").await;

    // The workflow reaches finished; the bridge clears the prompt and
    // publishes the final stack state.
    let mut finished = false;
    for _ in 0..50 {
        let envelope = recv(&client).await;
        if let Packet::UiState { runners, .. } = &envelope.payload {
            if runners
                .iter()
                .any(|r| r.status == skein_core::RunnerStatus::Finished)
            {
                finished = true;
                break;
            }
            if runners.is_empty() {
                // Frame already popped after finishing.
                finished = true;
                break;
            }
        }
    }
    assert!(finished);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn stop_request_unblocks_prompt_and_edit_history_reports_failure() {
    let (server, client) = build_server();
    server.start().await.unwrap();
    send_user_input(&client, 1, "/run main").await;

    // Wait until the prompt is up.
    let (_packet, input_required) = next_runner_req(&client).await;
    assert!(input_required);

    use skein_server::Endpoint;
    client
        .send(PacketEnvelope {
            msg_id: 2,
            source_msg_id: None,
            payload: Packet::StopReq,
        })
        .await
        .unwrap();

    // The runner winds down: a status packet reports the canceled state.
    let mut stopped = false;
    for _ in 0..50 {
        let envelope = recv(&client).await;
        if let Packet::UiState { runners, .. } = &envelope.payload {
            if runners
                .iter()
                .any(|r| r.status == skein_core::RunnerStatus::Stopped)
            {
                stopped = true;
                break;
            }
        }
    }
    assert!(stopped);

    // With no waiter and a stopped runner, plain input becomes an edit
    // history request; nothing was recorded yet, so it fails visibly.
    send_user_input(&client, 3, "replacement text").await;
    let mut reported = false;
    for _ in 0..50 {
        let envelope = recv(&client).await;
        if let Packet::TextMessage { text, .. } = &envelope.payload {
            if text.contains("Unable to edit history") {
                reported = true;
                break;
            }
        }
    }
    assert!(reported);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn unknown_command_reports_error() {
    let (server, client) = build_server();
    server.start().await.unwrap();

    send_user_input(&client, 1, "/bogus now").await;
    let mut reported = false;
    for _ in 0..10 {
        let envelope = recv(&client).await;
        if let Packet::TextMessage { text, .. } = &envelope.payload {
            assert_eq!(text, "Unknown command: /bogus");
            reported = true;
            break;
        }
    }
    assert!(reported);
    server.stop().await.unwrap();
}

#[tokio::test]
async fn help_lists_registered_commands() {
    let (server, client) = build_server();
    server.start().await.unwrap();

    send_user_input(&client, 1, "/help").await;
    let envelope = recv(&client).await;
    match &envelope.payload {
        Packet::TextMessage { text, .. } => {
            assert!(text.contains("/run <workflow> [text]"));
            assert!(text.contains("/stop"));
            assert!(text.contains("/restart"));
        }
        other => panic!("expected TextMessage, got {other:?}"),
    }
    server.stop().await.unwrap();
}

#[tokio::test]
async fn autocomplete_suggests_run_targets() {
    let (server, client) = build_server();
    server.start().await.unwrap();

    use skein_server::Endpoint;
    client
        .send(PacketEnvelope {
            msg_id: 1,
            source_msg_id: None,
            payload: Packet::AutocompleteReq {
                text: "/run ".into(),
                row: 0,
                col: 5,
            },
        })
        .await
        .unwrap();

    let envelope = recv(&client).await;
    match &envelope.payload {
        Packet::AutocompleteResp { items } => {
            assert_eq!(items.len(), 1);
            assert_eq!(items[0].title, "/run main - workflow");
            assert_eq!(items[0].insert_text, "/run main");
            assert_eq!(items[0].replace_start, 0);
        }
        other => panic!("expected AutocompleteResp, got {other:?}"),
    }
    server.stop().await.unwrap();
}

#[tokio::test]
async fn log_request_pages_buffered_records() {
    let (server, client) = build_server();
    server.start().await.unwrap();

    for i in 0..5 {
        server.log_buffer().push(skein_server::logging::LogRecord {
            logger_name: "test".into(),
            level: skein_server::logging::LogLevel::Info,
            level_name: "INFO".into(),
            message: format!("record-{i}"),
            created: chrono::Utc::now(),
        });
    }

    use skein_server::Endpoint;
    client
        .send(PacketEnvelope {
            msg_id: 9,
            source_msg_id: None,
            payload: Packet::LogReq {
                offset: 1,
                limit: Some(2),
            },
        })
        .await
        .unwrap();

    let envelope = recv(&client).await;
    assert_eq!(envelope.source_msg_id, Some(9));
    match &envelope.payload {
        Packet::LogResp {
            offset,
            total,
            entries,
        } => {
            assert_eq!(*offset, 1);
            assert_eq!(*total, 5);
            assert_eq!(entries.len(), 2);
            assert_eq!(entries[0].index, 1);
            assert_eq!(entries[0].record.message, "record-1");
        }
        other => panic!("expected LogResp, got {other:?}"),
    }
    server.stop().await.unwrap();
}
