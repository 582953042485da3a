use async_trait::async_trait;
use ensemble::agent::{Agent, AgentResult, FnAgent, InvokeOptions};
use ensemble::error::OrchestrationError;
use ensemble::event::{EventHandler, OrchestrationEvent};
use ensemble::handoff::{HandoffGraph, HandoffOrchestration};
use ensemble::message::{ChatHistory, ChatMessage, ContentItem, Role};
use ensemble::orchestration::{Orchestration, OrchestrationBuilder};
use ensemble::runtime::Runtime;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn started_runtime() -> Runtime {
    let runtime = Runtime::new();
    runtime.start().unwrap();
    runtime
}

/// An agent whose reply is computed from the history and the offered functions.
fn scripted<F>(name: &str, script: F) -> Arc<dyn Agent>
where
    F: Fn(&[ChatMessage], &InvokeOptions) -> ChatMessage + Send + Sync + 'static,
{
    Arc::new(FnAgent::new(name, move |history: Vec<ChatMessage>, options: InvokeOptions| {
        let reply: AgentResult<ChatMessage> = Ok(script(&history, &options));
        async move { reply }
    }))
}

fn call(function: &str, arguments: serde_json::Value) -> ChatMessage {
    ChatMessage::new(Role::Assistant, "").with_item(ContentItem::function_call(function, arguments))
}

fn support_graph() -> HandoffGraph {
    HandoffGraph::new()
        .add_many(
            "Triage",
            [
                ("Refund", "Transfer if the issue is refund related"),
                ("OrderStatus", "Transfer if the issue is about order status"),
            ],
        )
        .add("Refund", "Triage", "Transfer back if the issue is not refund related")
}

#[derive(Default)]
struct TransferLog {
    transfers: Mutex<Vec<(String, String)>>,
}

#[async_trait]
impl EventHandler for TransferLog {
    async fn on_orchestration_event(&self, event: &OrchestrationEvent) {
        if let OrchestrationEvent::HandoffTransferred { from, to, .. } = event {
            self.transfers.lock().unwrap().push((from.clone(), to.clone()));
        }
    }
}

#[tokio::test]
async fn test_transfer_moves_control_and_completion_ends_the_run() {
    let runtime = started_runtime();
    let offered = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&offered);
    let triage = scripted("Triage", move |_, options| {
        seen.lock()
            .unwrap()
            .extend(options.functions.iter().map(|f| f.name.clone()));
        call("transfer_to_Refund", json!({}))
    });
    let refund = scripted("Refund", |history, _| {
        let transferred = history
            .iter()
            .any(|m| m.role == Role::Tool && &*m.content == "Transferred to Refund");
        assert!(transferred);
        call("complete_task", json!({"task_summary": "Refund issued for order 42"}))
    });
    let status = scripted("OrderStatus", |_, _| ChatMessage::new(Role::Assistant, "unused"));
    let log = Arc::new(TransferLog::default());

    let result = HandoffOrchestration::new(vec![triage, refund, status], support_graph())
        .with_event_handler(log.clone())
        .invoke("I want my money back for order 42", &runtime, None)
        .await
        .unwrap();
    let summary = result.get(Some(Duration::from_secs(5))).await.unwrap();
    runtime.stop_when_idle().await.unwrap();

    assert_eq!(&*summary.content, "Refund issued for order 42");
    assert_eq!(summary.name.as_deref(), Some("Refund"));
    assert_eq!(
        *offered.lock().unwrap(),
        vec!["transfer_to_Refund", "transfer_to_OrderStatus", "complete_task"]
    );
    assert_eq!(
        *log.transfers.lock().unwrap(),
        vec![("Triage".to_string(), "Refund".to_string())]
    );
}

#[tokio::test]
async fn test_transfer_without_edge_is_an_invalid_handoff() {
    let runtime = started_runtime();
    let triage = scripted("Triage", |_, _| call("transfer_to_Refund", json!({})));
    let refund = scripted("Refund", |_, _| call("transfer_to_OrderStatus", json!({})));
    let status = scripted("OrderStatus", |_, _| call("complete_task", json!({})));

    let result = HandoffOrchestration::new(vec![triage, refund, status], support_graph())
        .invoke("refund please", &runtime, None)
        .await
        .unwrap();

    assert_eq!(
        result.get(None).await.unwrap_err(),
        OrchestrationError::InvalidHandoff {
            from: "Refund".into(),
            to: "OrderStatus".into()
        }
    );
    runtime.stop_when_idle().await.unwrap();
}

#[tokio::test]
async fn test_graph_must_only_name_members() {
    let runtime = started_runtime();
    let triage = scripted("Triage", |_, _| call("complete_task", json!({})));
    let graph = HandoffGraph::new().add("Triage", "Billing", "billing questions");

    let err = HandoffOrchestration::new(vec![triage], graph)
        .invoke("hello", &runtime, None)
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestrationError::Configuration(msg) if msg.contains("Billing")));
    runtime.stop_when_idle().await.unwrap();
}

#[tokio::test]
async fn test_plain_replies_keep_the_agent_active_until_the_turn_limit() {
    let runtime = started_runtime();
    let turns = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&turns);
    let chatty = scripted("Triage", move |_, _| {
        counter.fetch_add(1, Ordering::SeqCst);
        ChatMessage::new(Role::Assistant, "Let me think about that")
    });

    let result = HandoffOrchestration::new(vec![chatty], HandoffGraph::new())
        .with_max_turns(3)
        .invoke("hello", &runtime, None)
        .await
        .unwrap();

    assert_eq!(
        result.get(Some(Duration::from_secs(5))).await.unwrap_err(),
        OrchestrationError::TurnLimitExceeded(3)
    );
    runtime.stop_when_idle().await.unwrap();
    assert_eq!(turns.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_human_answers_are_fed_back_to_the_active_agent() {
    let runtime = started_runtime();
    let status = scripted("OrderStatus", |history, _| {
        let answered = history
            .iter()
            .any(|m| m.role == Role::User && &*m.content == "Order 42");
        if answered {
            call(
                "complete_task",
                json!({"task_summary": "Order 42 ships tomorrow"}),
            )
        } else {
            ChatMessage::new(Role::Assistant, "What is your order number?")
        }
    });
    let triage = scripted("Triage", |_, _| call("transfer_to_OrderStatus", json!({})));
    let questions = Arc::new(Mutex::new(Vec::new()));
    let asked = Arc::clone(&questions);

    let result = HandoffOrchestration::new(vec![triage, status], support_graph_without_refund())
        .with_human_response_function(move |history: &ChatHistory| {
            asked
                .lock()
                .unwrap()
                .push(history.last().unwrap().content.to_string());
            ChatMessage::user("Order 42")
        })
        .invoke("Where is my order?", &runtime, None)
        .await
        .unwrap();

    let summary = result.get(Some(Duration::from_secs(5))).await.unwrap();
    runtime.stop_when_idle().await.unwrap();

    assert_eq!(&*summary.content, "Order 42 ships tomorrow");
    assert_eq!(*questions.lock().unwrap(), vec!["What is your order number?"]);
}

fn support_graph_without_refund() -> HandoffGraph {
    HandoffGraph::new().add("Triage", "OrderStatus", "order status questions")
}

#[tokio::test]
async fn test_cycles_are_allowed() {
    let runtime = started_runtime();
    let bounces = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&bounces);
    let triage = scripted("Triage", move |_, _| {
        if counter.fetch_add(1, Ordering::SeqCst) == 0 {
            call("transfer_to_Refund", json!({}))
        } else {
            call("complete_task", json!({"task_summary": "Handled by triage"}))
        }
    });
    let refund = scripted("Refund", |_, _| call("transfer_to_Triage", json!({})));
    let status = scripted("OrderStatus", |_, _| ChatMessage::new(Role::Assistant, "unused"));

    let result = HandoffOrchestration::new(vec![triage, refund, status], support_graph())
        .invoke("It's not about a refund after all", &runtime, None)
        .await
        .unwrap();

    let summary = result.get(Some(Duration::from_secs(5))).await.unwrap();
    runtime.stop_when_idle().await.unwrap();
    assert_eq!(&*summary.content, "Handled by triage");
    assert_eq!(bounces.load(Ordering::SeqCst), 2);
}

#[derive(Default)]
struct DiscardLog {
    discarded: Mutex<Vec<String>>,
}

#[async_trait]
impl EventHandler for DiscardLog {
    async fn on_orchestration_event(&self, event: &OrchestrationEvent) {
        if let OrchestrationEvent::ReplyDiscarded { agent_name, .. } = event {
            self.discarded.lock().unwrap().push(agent_name.clone());
        }
    }
}

#[tokio::test]
async fn test_cancel_during_a_turn_stops_the_transfer() {
    let runtime = started_runtime();
    let triage: Arc<dyn Agent> = Arc::new(FnAgent::new(
        "Triage",
        |_history: Vec<ChatMessage>, _options: InvokeOptions| async move {
            tokio::time::sleep(Duration::from_millis(80)).await;
            let reply: AgentResult<ChatMessage> = Ok(call("transfer_to_Refund", json!({})));
            reply
        },
    ));
    let refund_turns = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&refund_turns);
    let refund = scripted("Refund", move |_, _| {
        counter.fetch_add(1, Ordering::SeqCst);
        call("complete_task", json!({"task_summary": "refunded"}))
    });
    let status = scripted("OrderStatus", |_, _| ChatMessage::new(Role::Assistant, "unused"));
    let log = Arc::new(DiscardLog::default());

    let result = HandoffOrchestration::new(vec![triage, refund, status], support_graph())
        .with_event_handler(log.clone())
        .invoke("refund please", &runtime, None)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(result.cancel());

    assert_eq!(
        result.get(Some(Duration::from_secs(2))).await.unwrap_err(),
        OrchestrationError::Cancelled
    );
    runtime.stop_when_idle().await.unwrap();
    assert_eq!(refund_turns.load(Ordering::SeqCst), 0);
    assert_eq!(*log.discarded.lock().unwrap(), vec!["Triage"]);
}
