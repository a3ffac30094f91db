use chatflow::core::flow_graph::state::{ContactFlowState, MemoryStateStore, StateStore};
use chatflow::runtime::IdleSweeper;
use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;

async fn seed(states: &MemoryStateStore, contact: &str, flow: Option<&str>, idle_minutes: i64) {
    let mut state = ContactFlowState::idle(contact);
    state.flow = flow.map(str::to_string);
    state.current_step = flow.map(|_| "ask_rating".to_string());
    state.last_updated_at = Utc::now() - ChronoDuration::minutes(idle_minutes);
    states.save(&state).await.unwrap();
}

#[tokio::test]
async fn sweep_resets_only_stale_active_contacts() {
    let states = Arc::new(MemoryStateStore::new());
    seed(&states, "stale", Some("lead_generation"), 90).await;
    seed(&states, "fresh", Some("lead_generation"), 5).await;
    seed(&states, "idle-old", None, 90).await;

    let sweeper = IdleSweeper::new(
        states.clone(),
        Duration::from_secs(30 * 60),
        Duration::from_secs(60),
    );
    let reset = sweeper.run_once().await.unwrap();
    assert_eq!(reset, 1);

    assert!(states.load("stale").await.unwrap().is_idle());
    let fresh = states.load("fresh").await.unwrap();
    assert_eq!(fresh.flow.as_deref(), Some("lead_generation"));
    assert_eq!(fresh.current_step.as_deref(), Some("ask_rating"));
}

#[tokio::test]
async fn sweep_is_a_no_op_when_nothing_is_stale() {
    let states = Arc::new(MemoryStateStore::new());
    seed(&states, "fresh", Some("lead_generation"), 1).await;
    let sweeper = IdleSweeper::new(
        states.clone(),
        Duration::from_secs(30 * 60),
        Duration::from_secs(60),
    );
    assert_eq!(sweeper.run_once().await.unwrap(), 0);
    assert!(!states.load("fresh").await.unwrap().is_idle());
}
