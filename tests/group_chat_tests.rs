use async_trait::async_trait;
use ensemble::agent::{Agent, FnAgent};
use ensemble::error::OrchestrationError;
use ensemble::event::{EventHandler, OrchestrationEvent};
use ensemble::group_chat::{
    GroupChatManager, GroupChatOrchestration, GroupChatPhase, GroupChatState,
    ModelDrivenGroupChatManager, RoundRobinGroupChatManager, StringResult,
};
use ensemble::message::{ChatHistory, ChatMessage};
use ensemble::orchestration::{Orchestration, OrchestrationBuilder};
use ensemble::runtime::Runtime;
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn started_runtime() -> Runtime {
    let runtime = Runtime::new();
    runtime.start().unwrap();
    runtime
}

/// Replies `"<name> #<turn>"` and logs every turn it takes.
fn speaker(name: &'static str, turns: Arc<Mutex<Vec<String>>>) -> Arc<dyn Agent> {
    Arc::new(FnAgent::text(name, move |_| {
        let mut turns = turns.lock().unwrap();
        turns.push(name.to_string());
        format!("{} #{}", name, turns.len())
    }))
}

/// Always picks a participant that does not exist.
struct RogueManager;

#[async_trait]
impl GroupChatManager for RogueManager {
    async fn select_next_agent(
        &self,
        _state: &GroupChatState,
        _participants: &[(String, String)],
    ) -> Result<StringResult, OrchestrationError> {
        Ok(StringResult::new("Mallory", "Mallory seems keen"))
    }
}

#[derive(Default)]
struct PhaseRecorder {
    phases: Mutex<Vec<GroupChatPhase>>,
}

#[async_trait]
impl EventHandler for PhaseRecorder {
    async fn on_orchestration_event(&self, event: &OrchestrationEvent) {
        if let OrchestrationEvent::GroupChatPhaseChanged { phase, .. } = event {
            self.phases.lock().unwrap().push(*phase);
        }
    }
}

#[tokio::test]
async fn test_round_robin_respects_max_rounds_and_starts_with_first_member() {
    let runtime = started_runtime();
    let turns = Arc::new(Mutex::new(Vec::new()));
    let members = vec![
        speaker("Writer", Arc::clone(&turns)),
        speaker("Reviewer", Arc::clone(&turns)),
    ];
    let manager = Arc::new(RoundRobinGroupChatManager::new().with_max_rounds(5));

    let result = GroupChatOrchestration::new(members, manager)
        .invoke("Write a slogan", &runtime, None)
        .await
        .unwrap();
    let last = result.get(Some(Duration::from_secs(5))).await.unwrap();
    runtime.stop_when_idle().await.unwrap();

    let turns = turns.lock().unwrap();
    assert_eq!(
        *turns,
        vec!["Writer", "Reviewer", "Writer", "Reviewer", "Writer"]
    );
    assert_eq!(&*last.content, "Writer #5");
}

#[tokio::test]
async fn test_unknown_participant_fails_the_run() {
    let runtime = started_runtime();
    let turns = Arc::new(Mutex::new(Vec::new()));

    let result = GroupChatOrchestration::new(
        vec![speaker("Writer", Arc::clone(&turns))],
        Arc::new(RogueManager),
    )
    .invoke("Write a slogan", &runtime, None)
    .await
    .unwrap();

    assert_eq!(
        result.get(None).await.unwrap_err(),
        OrchestrationError::UnknownParticipant("Mallory".into())
    );
    runtime.stop_when_idle().await.unwrap();
    assert!(turns.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_human_reply_is_appended_after_reviewer_speaks() {
    let runtime = started_runtime();
    let turns = Arc::new(Mutex::new(Vec::new()));
    let saw_user = Arc::new(Mutex::new(false));
    let flag = Arc::clone(&saw_user);
    let writer: Arc<dyn Agent> = Arc::new(FnAgent::text("Writer", move |history| {
        if history.iter().any(|m| &*m.content == "Make it shorter") {
            *flag.lock().unwrap() = true;
            "Short draft".to_string()
        } else {
            "Long draft".to_string()
        }
    }));
    let manager = RoundRobinGroupChatManager::new()
        .with_max_rounds(3)
        .with_user_input_when(|state| {
            state.history.last().and_then(|m| m.name.as_deref()) == Some("Reviewer")
        });
    let asked = Arc::new(Mutex::new(0usize));
    let counter = Arc::clone(&asked);

    let result = GroupChatOrchestration::new(
        vec![writer, speaker("Reviewer", Arc::clone(&turns))],
        Arc::new(manager),
    )
    .with_human_response_function(move |history: &ChatHistory| {
        *counter.lock().unwrap() += 1;
        assert_eq!(history.last().unwrap().name.as_deref(), Some("Reviewer"));
        ChatMessage::user("Make it shorter")
    })
    .invoke("Draft a tagline", &runtime, None)
    .await
    .unwrap();

    let last = result.get(Some(Duration::from_secs(5))).await.unwrap();
    runtime.stop_when_idle().await.unwrap();

    assert_eq!(&*last.content, "Short draft");
    assert!(*saw_user.lock().unwrap());
    assert_eq!(*asked.lock().unwrap(), 1);
}

#[tokio::test]
async fn test_user_input_without_handler_fails_the_run() {
    let runtime = started_runtime();
    let turns = Arc::new(Mutex::new(Vec::new()));
    let manager = RoundRobinGroupChatManager::new()
        .with_max_rounds(2)
        .with_user_input_when(|_| true);

    let result = GroupChatOrchestration::new(
        vec![speaker("Writer", Arc::clone(&turns))],
        Arc::new(manager),
    )
    .invoke("Hello", &runtime, None)
    .await
    .unwrap();

    assert_eq!(
        result.get(None).await.unwrap_err(),
        OrchestrationError::MissingHumanInputHandler
    );
    runtime.stop_when_idle().await.unwrap();
}

#[tokio::test]
async fn test_phases_are_reported() {
    let runtime = started_runtime();
    let turns = Arc::new(Mutex::new(Vec::new()));
    let recorder = Arc::new(PhaseRecorder::default());
    let manager = RoundRobinGroupChatManager::new().with_max_rounds(1);

    let result = GroupChatOrchestration::new(vec![speaker("Solo", turns)], Arc::new(manager))
        .with_event_handler(recorder.clone())
        .invoke("Hello", &runtime, None)
        .await
        .unwrap();
    result.get(None).await.unwrap();
    runtime.stop_when_idle().await.unwrap();

    assert_eq!(
        *recorder.phases.lock().unwrap(),
        vec![GroupChatPhase::SelectNext, GroupChatPhase::Terminated]
    );
}

#[tokio::test]
async fn test_model_driven_manager_follows_policy_agent() {
    let runtime = started_runtime();
    let turns = Arc::new(Mutex::new(Vec::new()));
    let policy: Arc<dyn Agent> = Arc::new(FnAgent::text("Mediator", |history| {
        let question = history.last().map(|m| m.content.to_string()).unwrap_or_default();
        let critic_spoke = history
            .iter()
            .any(|m| m.name.as_deref() == Some("Critic"));
        if question.contains("should end") {
            format!(r#"{{"result": {}, "reason": "critic has weighed in"}}"#, critic_spoke)
        } else if question.contains("select the next participant") {
            let writer_spoke = history.iter().any(|m| m.name.as_deref() == Some("Writer"));
            if writer_spoke {
                r#"Sure. {"result": " critic ", "reason": "needs review"}"#.to_string()
            } else {
                r#"{"result": "Writer", "reason": "needs a draft"}"#.to_string()
            }
        } else {
            r#"```json
{"result": "Consensus reached", "reason": "both agreed"}
```"#
                .to_string()
        }
    }));
    let manager = ModelDrivenGroupChatManager::new(policy, "Product tagline").with_max_rounds(10);

    let result = GroupChatOrchestration::new(
        vec![
            speaker("Writer", Arc::clone(&turns)),
            speaker("Critic", Arc::clone(&turns)),
        ],
        Arc::new(manager),
    )
    .invoke("Propose a tagline", &runtime, None)
    .await
    .unwrap();

    let last = result.get(Some(Duration::from_secs(5))).await.unwrap();
    runtime.stop_when_idle().await.unwrap();

    assert_eq!(&*last.content, "Consensus reached");
    assert_eq!(last.name.as_deref(), Some("Mediator"));
    assert_eq!(*turns.lock().unwrap(), vec!["Writer", "Critic"]);
}

#[tokio::test]
async fn test_unparseable_policy_reply_is_a_structured_output_error() {
    let runtime = started_runtime();
    let turns = Arc::new(Mutex::new(Vec::new()));
    let policy: Arc<dyn Agent> = Arc::new(FnAgent::text("Mediator", |_| "I'm not sure".into()));
    let manager = ModelDrivenGroupChatManager::new(policy, "anything");

    let result = GroupChatOrchestration::new(vec![speaker("Writer", turns)], Arc::new(manager))
        .invoke("Hi", &runtime, None)
        .await
        .unwrap();

    assert!(matches!(
        result.get(None).await,
        Err(OrchestrationError::StructuredOutput(_))
    ));
    runtime.stop_when_idle().await.unwrap();
}

#[tokio::test]
async fn test_member_named_like_the_manager_is_just_a_member() {
    let runtime = started_runtime();
    let turns = Arc::new(Mutex::new(Vec::new()));
    let members = vec![
        speaker("group_chat_manager", Arc::clone(&turns)),
        speaker("Reviewer", Arc::clone(&turns)),
    ];
    let manager = Arc::new(RoundRobinGroupChatManager::new().with_max_rounds(2));

    let result = GroupChatOrchestration::new(members, manager)
        .invoke("Discuss", &runtime, None)
        .await
        .unwrap();
    let last = result.get(Some(Duration::from_secs(5))).await.unwrap();
    runtime.stop_when_idle().await.unwrap();

    assert_eq!(*turns.lock().unwrap(), vec!["group_chat_manager", "Reviewer"]);
    assert_eq!(&*last.content, "Reviewer #2");
}
