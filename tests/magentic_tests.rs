use async_trait::async_trait;
use ensemble::agent::{Agent, FnAgent};
use ensemble::config::OrchestrationLimits;
use ensemble::error::OrchestrationError;
use ensemble::event::{EventHandler, OrchestrationEvent};
use ensemble::magentic::{
    LedgerEntry, MagenticContext, MagenticManager, MagenticOrchestration, PlanStep,
    ProgressLedger, StandardMagenticManager, TaskLedger, MANAGER_NAME,
};
use ensemble::message::ChatMessage;
use ensemble::orchestration::{Orchestration, OrchestrationBuilder};
use ensemble::runtime::Runtime;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn started_runtime() -> Runtime {
    let runtime = Runtime::new();
    runtime.start().unwrap();
    runtime
}

fn worker(turns: Arc<AtomicUsize>) -> Arc<dyn Agent> {
    Arc::new(
        FnAgent::text("Worker", move |_| {
            let n = turns.fetch_add(1, Ordering::SeqCst) + 1;
            format!("attempt {}", n)
        })
        .with_description("Does whatever it is told"),
    )
}

/// Manager with fixed judgements, recording what it was shown.
struct ScriptedManager {
    progressing: bool,
    next_speaker: String,
    plans: AtomicUsize,
    replans: AtomicUsize,
    notes_seen: Mutex<Vec<usize>>,
}

impl ScriptedManager {
    fn new(progressing: bool, next_speaker: &str) -> Self {
        Self {
            progressing,
            next_speaker: next_speaker.to_string(),
            plans: AtomicUsize::new(0),
            replans: AtomicUsize::new(0),
            notes_seen: Mutex::new(Vec::new()),
        }
    }

    fn ledger() -> TaskLedger {
        TaskLedger::new(
            vec!["Nothing is known yet".into()],
            vec![PlanStep::new("Try something").assigned_to("Worker")],
        )
    }
}

#[async_trait]
impl MagenticManager for ScriptedManager {
    async fn plan(&self, _context: &MagenticContext) -> Result<TaskLedger, OrchestrationError> {
        self.plans.fetch_add(1, Ordering::SeqCst);
        Ok(Self::ledger())
    }

    async fn replan(
        &self,
        _context: &MagenticContext,
        _previous: &TaskLedger,
    ) -> Result<TaskLedger, OrchestrationError> {
        self.replans.fetch_add(1, Ordering::SeqCst);
        Ok(Self::ledger())
    }

    async fn create_progress_ledger(
        &self,
        _context: &MagenticContext,
        ledger: &TaskLedger,
    ) -> Result<ProgressLedger, OrchestrationError> {
        self.notes_seen.lock().unwrap().push(ledger.progress.len());
        Ok(ProgressLedger {
            is_request_satisfied: LedgerEntry::new(false, "not yet"),
            is_in_loop: LedgerEntry::new(false, ""),
            is_progress_being_made: LedgerEntry::new(self.progressing, ""),
            next_speaker: LedgerEntry::new(self.next_speaker.clone(), "only choice"),
            instruction: LedgerEntry::new("Keep going".to_string(), ""),
        })
    }

    async fn prepare_final_answer(
        &self,
        _context: &MagenticContext,
        _ledger: &TaskLedger,
    ) -> Result<ChatMessage, OrchestrationError> {
        Ok(ChatMessage::assistant(MANAGER_NAME, "done"))
    }
}

#[derive(Default)]
struct LedgerLog {
    resets: Mutex<Vec<usize>>,
}

#[async_trait]
impl EventHandler for LedgerLog {
    async fn on_orchestration_event(&self, event: &OrchestrationEvent) {
        if let OrchestrationEvent::LedgerUpdated { reset_count, .. } = event {
            self.resets.lock().unwrap().push(*reset_count);
        }
    }
}

#[tokio::test]
async fn test_standard_manager_plans_dispatches_and_answers() {
    let runtime = started_runtime();
    let reasoner: Arc<dyn Agent> = Arc::new(FnAgent::text("Reasoner", |history| {
        let prompt = history.last().map(|m| m.content.to_string()).unwrap_or_default();
        let researched = history
            .iter()
            .any(|m| m.name.as_deref() == Some("Researcher"));
        if prompt.contains("write a short, ordered plan") {
            r#"{"facts": ["The question is about water"],
                "plan": [{"description": "Look up the boiling point", "assignee": "Researcher"}]}"#
                .to_string()
        } else if prompt.contains("Review the conversation so far") {
            format!(
                r#"{{"is_request_satisfied": {{"answer": {}, "reason": "checked"}},
                    "is_in_loop": {{"answer": false, "reason": ""}},
                    "is_progress_being_made": {{"answer": true, "reason": ""}},
                    "next_speaker": {{"answer": "Researcher", "reason": "knows facts"}},
                    "instruction": {{"answer": "Find the boiling point of water", "reason": ""}}}}"#,
                researched
            )
        } else {
            "Water boils at 100 C at sea level.".to_string()
        }
    }));
    let instructions = Arc::new(Mutex::new(Vec::new()));
    let heard = Arc::clone(&instructions);
    let researcher: Arc<dyn Agent> = Arc::new(
        FnAgent::text("Researcher", move |history| {
            let last = history.last().unwrap();
            heard
                .lock()
                .unwrap()
                .push((last.name.clone().unwrap_or_default(), last.content.to_string()));
            "100 degrees Celsius at 1 atm".to_string()
        })
        .with_description("Looks up facts"),
    );

    let result = MagenticOrchestration::new(
        vec![researcher],
        Arc::new(StandardMagenticManager::new(reasoner)),
    )
    .invoke("At what temperature does water boil?", &runtime, None)
    .await
    .unwrap();

    let answer = result.get(Some(Duration::from_secs(5))).await.unwrap();
    runtime.stop_when_idle().await.unwrap();

    assert_eq!(&*answer.content, "Water boils at 100 C at sea level.");
    assert_eq!(answer.name.as_deref(), Some(MANAGER_NAME));
    assert_eq!(
        *instructions.lock().unwrap(),
        vec![(
            MANAGER_NAME.to_string(),
            "Find the boiling point of water".to_string()
        )]
    );
}

#[tokio::test]
async fn test_stalls_trigger_replans_until_the_reset_limit() {
    let runtime = started_runtime();
    let turns = Arc::new(AtomicUsize::new(0));
    let manager = Arc::new(ScriptedManager::new(false, "Worker"));
    let log = Arc::new(LedgerLog::default());

    let result = MagenticOrchestration::new(vec![worker(Arc::clone(&turns))], manager.clone())
        .with_limits(OrchestrationLimits {
            max_stall_count: 1,
            max_reset_count: 1,
            ..OrchestrationLimits::default()
        })
        .with_event_handler(log.clone())
        .invoke("Solve it", &runtime, None)
        .await
        .unwrap();

    assert_eq!(
        result.get(Some(Duration::from_secs(5))).await.unwrap_err(),
        OrchestrationError::PlanningLimitExceeded(1)
    );
    runtime.stop_when_idle().await.unwrap();

    assert_eq!(manager.plans.load(Ordering::SeqCst), 1);
    assert_eq!(manager.replans.load(Ordering::SeqCst), 1);
    assert_eq!(turns.load(Ordering::SeqCst), 2);
    assert_eq!(*manager.notes_seen.lock().unwrap(), vec![0, 1, 0, 1]);
    assert_eq!(*log.resets.lock().unwrap(), vec![0, 1]);
}

#[tokio::test]
async fn test_round_ceiling_fails_the_run() {
    let runtime = started_runtime();
    let turns = Arc::new(AtomicUsize::new(0));
    let manager = Arc::new(ScriptedManager::new(true, "worker"));

    let result = MagenticOrchestration::new(vec![worker(Arc::clone(&turns))], manager.clone())
        .with_limits(OrchestrationLimits {
            max_magentic_rounds: 3,
            ..OrchestrationLimits::default()
        })
        .invoke("Never finishes", &runtime, None)
        .await
        .unwrap();

    assert_eq!(
        result.get(Some(Duration::from_secs(5))).await.unwrap_err(),
        OrchestrationError::PlanningLimitExceeded(3)
    );
    runtime.stop_when_idle().await.unwrap();

    assert_eq!(turns.load(Ordering::SeqCst), 3);
    assert_eq!(*manager.notes_seen.lock().unwrap(), vec![0, 1, 2]);
    assert_eq!(manager.replans.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_unknown_next_speaker_fails_the_run() {
    let runtime = started_runtime();
    let turns = Arc::new(AtomicUsize::new(0));
    let manager = Arc::new(ScriptedManager::new(true, "Nobody"));

    let result = MagenticOrchestration::new(vec![worker(Arc::clone(&turns))], manager)
        .invoke("Anything", &runtime, None)
        .await
        .unwrap();

    assert_eq!(
        result.get(None).await.unwrap_err(),
        OrchestrationError::UnknownParticipant("Nobody".into())
    );
    runtime.stop_when_idle().await.unwrap();
    assert_eq!(turns.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_malformed_plan_is_a_structured_output_error() {
    let runtime = started_runtime();
    let turns = Arc::new(AtomicUsize::new(0));
    let reasoner: Arc<dyn Agent> = Arc::new(FnAgent::text("Reasoner", |_| "no idea".into()));

    let result = MagenticOrchestration::new(
        vec![worker(turns)],
        Arc::new(StandardMagenticManager::new(reasoner)),
    )
    .invoke("Plan this", &runtime, None)
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
    let turns = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&turns);
    let member: Arc<dyn Agent> = Arc::new(FnAgent::text("magentic_manager", move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
        "on it".to_string()
    }));
    let manager = Arc::new(ScriptedManager::new(true, "magentic_manager"));

    let result = MagenticOrchestration::new(vec![member], manager)
        .with_limits(OrchestrationLimits {
            max_magentic_rounds: 1,
            ..OrchestrationLimits::default()
        })
        .invoke("Anything", &runtime, None)
        .await
        .unwrap();

    assert_eq!(
        result.get(Some(Duration::from_secs(5))).await.unwrap_err(),
        OrchestrationError::PlanningLimitExceeded(1)
    );
    runtime.stop_when_idle().await.unwrap();
    assert_eq!(turns.load(Ordering::SeqCst), 1);
}
