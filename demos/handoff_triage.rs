// This demo routes a customer support request through a handoff graph.
// A triage agent transfers the conversation to a refund specialist, which asks
// the (scripted) customer for the order number and then completes the task.
//
// Agents are scripted, so no API keys are needed.
//
// Example usage:
// ```
// RUST_LOG=ensemble=info cargo run --example handoff_triage
// ```

use ensemble::agent::{Agent, AgentResult, FnAgent, InvokeOptions};
use ensemble::handoff::{HandoffGraph, HandoffOrchestration};
use ensemble::message::{ChatHistory, ChatMessage, ContentItem, Role};
use ensemble::orchestration::{Orchestration, OrchestrationBuilder};
use ensemble::runtime::Runtime;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

fn mentions(history: &[ChatMessage], role: Role, needle: &str) -> bool {
    history
        .iter()
        .any(|m| m.role == role && m.content.contains(needle))
}

fn call(function: &str, arguments: serde_json::Value) -> ChatMessage {
    ChatMessage::new(Role::Assistant, "").with_item(ContentItem::function_call(function, arguments))
}

fn scripted<F>(name: &str, description: &str, script: F) -> Arc<dyn Agent>
where
    F: Fn(&[ChatMessage], &InvokeOptions) -> ChatMessage + Send + Sync + 'static,
{
    Arc::new(
        FnAgent::new(name, move |history: Vec<ChatMessage>, options: InvokeOptions| {
            let reply: AgentResult<ChatMessage> = Ok(script(&history, &options));
            async move { reply }
        })
        .with_description(description),
    )
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    ensemble::init_logger();

    println!("=== Handoff Triage Demo ===\n");

    let triage = scripted(
        "TriageAgent",
        "A customer support agent that triages issues.",
        |history, options| {
            let offered: Vec<&str> = options.functions.iter().map(|f| f.name.as_str()).collect();
            println!("TriageAgent may call: {}", offered.join(", "));
            if mentions(history, Role::User, "refund") {
                call("transfer_to_RefundAgent", json!({}))
            } else {
                call("transfer_to_OrderStatusAgent", json!({}))
            }
        },
    );

    let refund = scripted(
        "RefundAgent",
        "A customer support agent that handles refunds.",
        |history, _| {
            if mentions(history, Role::User, "order 12345") {
                call(
                    "complete_task",
                    json!({"task_summary": "Refunded order 12345 for the damaged item."}),
                )
            } else {
                ChatMessage::new(Role::Assistant, "Could you tell me your order number?")
            }
        },
    );

    let order_status = scripted(
        "OrderStatusAgent",
        "A customer support agent that checks order status.",
        |_, _| {
            call(
                "complete_task",
                json!({"task_summary": "Order shipped yesterday."}),
            )
        },
    );

    let handoffs = HandoffGraph::new()
        .add_many(
            "TriageAgent",
            [
                ("RefundAgent", "Transfer to this agent if the issue is refund related"),
                (
                    "OrderStatusAgent",
                    "Transfer to this agent if the issue is order status related",
                ),
            ],
        )
        .add(
            "RefundAgent",
            "TriageAgent",
            "Transfer to this agent if the issue is not refund related",
        )
        .add(
            "OrderStatusAgent",
            "TriageAgent",
            "Transfer to this agent if the issue is not order status related",
        );

    let orchestration = HandoffOrchestration::new(vec![triage, refund, order_status], handoffs)
        .with_max_turns(10)
        .with_agent_response_callback(|message| {
            let sender = message.name.as_deref().unwrap_or("?");
            let calls: Vec<&str> = message.function_calls().map(|(_, name, _)| name).collect();
            if calls.is_empty() {
                println!("{}: {}", sender, message.content);
            } else {
                println!("{} calls {}", sender, calls.join(", "));
            }
        })
        .with_human_response_function(|history: &ChatHistory| {
            let question = history
                .last()
                .map(|m| m.content.to_string())
                .unwrap_or_default();
            println!("Agent asks: {}", question);
            let answer = "The item was damaged, it's order 12345.";
            println!("User: {}", answer);
            ChatMessage::user(answer)
        });

    let runtime = Runtime::new();
    runtime.start()?;

    let result = orchestration
        .invoke(
            "I'd like a refund for a damaged item I received.",
            &runtime,
            None,
        )
        .await?;
    let summary = result.get(Some(Duration::from_secs(30))).await?;
    println!("\n***** Task summary *****\n{}", summary.content);

    runtime.stop_when_idle().await?;
    Ok(())
}
