use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;

use super::*;
use crate::test_utils::enable_logger;
use crate::test_utils::events;
use crate::test_utils::new_event_log;
use crate::test_utils::EventLog;
use crate::test_utils::TrackedPlugin;
use crate::Aggregate;
use crate::AgentConfig;
use crate::DatasyncConfig;
use crate::Error;
use crate::LifecycleError;
use crate::PluginHandle;
use crate::ResyncOrchestrator;

fn build_agent(
    aggregate: PluginHandle,
    config: AgentConfig,
) -> (Arc<Agent>, watch::Sender<()>) {
    let (close_tx, close_rx) = watch::channel(());
    let agent = AgentBuilder::new(config, close_rx)
        .aggregate(aggregate)
        .build()
        .unwrap()
        .ready()
        .unwrap();
    (agent, close_tx)
}

/// Aggregate `{A, B, C}` where C depends on B depends on A.
fn linear_chain(log: &EventLog) -> PluginHandle {
    let a = TrackedPlugin::new("a", log).plain_handle();
    let b = TrackedPlugin::new("b", log)
        .with_deps(vec![a])
        .plain_handle();
    let c = TrackedPlugin::new("c", log)
        .with_deps(vec![b])
        .plain_handle();
    Aggregate::new("agent").with(c).into_handle()
}

/// # Case 1: three-plugin linear dependency
///
/// Expected init order: A, B, C. Expected close order: C, B, A.
#[tokio::test]
async fn init_order_is_leaves_first_and_close_is_reversed() {
    enable_logger();
    let log = new_event_log();
    let (agent, _close_tx) = build_agent(linear_chain(&log), AgentConfig::default());

    agent.start().await.unwrap();
    assert_eq!(agent.state(), AgentState::Running);
    assert_eq!(events(&log), vec!["init:a", "init:b", "init:c"]);

    agent.stop().await.unwrap();
    assert_eq!(agent.state(), AgentState::Closed);
    assert_eq!(
        events(&log),
        vec!["init:a", "init:b", "init:c", "close:c", "close:b", "close:a"]
    );
}

/// # Case 2: second plugin fails init
///
/// A.close is invoked, B and C are never seen by close.
#[tokio::test]
async fn init_failure_rolls_back_the_initialized_prefix() {
    enable_logger();
    let log = new_event_log();
    let a = TrackedPlugin::new("a", &log).plain_handle();
    let b = TrackedPlugin::new("b", &log)
        .with_deps(vec![a])
        .failing_init()
        .plain_handle();
    let c = TrackedPlugin::new("c", &log)
        .with_deps(vec![b])
        .plain_handle();
    let aggregate = Aggregate::new("agent").with(c).into_handle();
    let (agent, _close_tx) = build_agent(aggregate, AgentConfig::default());

    let err = agent.start().await.unwrap_err();
    match err {
        Error::Lifecycle(LifecycleError::Init { plugin, .. }) => assert_eq!(plugin, "b"),
        other => panic!("expected an init error, got {}", other),
    }

    // b logged its attempt but is not closed; c was never initialized
    assert_eq!(events(&log), vec!["init:a", "init:b", "close:a"]);

    // the rollback already closed everything; stop is a recorded no-op
    agent.stop().await.unwrap();
    assert_eq!(events(&log), vec!["init:a", "init:b", "close:a"]);
}

/// # Case 3: startup timeout
///
/// One plugin sleeps past the budget. `start` returns the distinct timeout
/// error promptly; the offending plugin's close still runs after its init
/// returns, and later plugins are never initialized.
#[tokio::test(start_paused = true)]
async fn startup_timeout_rolls_back_after_the_inflight_init_returns() {
    enable_logger();
    let log = new_event_log();
    let a = TrackedPlugin::new("a", &log).plain_handle();
    let b = TrackedPlugin::new("b", &log)
        .with_deps(vec![a])
        .init_delay(Duration::from_secs(2))
        .plain_handle();
    let c = TrackedPlugin::new("c", &log)
        .with_deps(vec![b])
        .plain_handle();
    let aggregate = Aggregate::new("agent").with(c).into_handle();

    let config = AgentConfig {
        lifecycle: crate::LifecycleConfig {
            max_startup_time_ms: 100,
        },
        ..AgentConfig::default()
    };
    let (agent, _close_tx) = build_agent(aggregate, config);

    let begin = Instant::now();
    let err = agent.start().await.unwrap_err();
    assert!(matches!(
        err,
        Error::Lifecycle(LifecycleError::StartupTimeout(_))
    ));
    assert!(begin.elapsed() >= Duration::from_millis(100));
    assert!(begin.elapsed() < Duration::from_millis(200));

    // let the stalled init return and the detached rollback run
    let mut done = agent.done_signal();
    tokio::time::timeout(Duration::from_secs(5), done.wait_for(|finished| *finished))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(events(&log), vec!["init:a", "init:b", "close:b", "close:a"]);
}

/// After-init failures trigger a full reverse-order close.
#[tokio::test]
async fn after_init_failure_closes_everything_in_reverse() {
    enable_logger();
    let log = new_event_log();
    let a = TrackedPlugin::new("a", &log).plain_handle();
    let b = TrackedPlugin::new("b", &log)
        .with_deps(vec![a])
        .failing_after_init()
        .post_init_handle();
    let aggregate = Aggregate::new("agent").with(b).into_handle();
    let (agent, _close_tx) = build_agent(aggregate, AgentConfig::default());

    let err = agent.start().await.unwrap_err();
    match err {
        Error::Lifecycle(LifecycleError::PostInit { plugin, .. }) => assert_eq!(plugin, "b"),
        other => panic!("expected a post-init error, got {}", other),
    }

    assert_eq!(
        events(&log),
        vec!["init:a", "init:b", "after_init:b", "close:b", "close:a"]
    );
}

/// Plugins that offer after-init run it in init order, after every init.
#[tokio::test]
async fn after_init_runs_in_init_order() {
    enable_logger();
    let log = new_event_log();
    let a = TrackedPlugin::new("a", &log).post_init_handle();
    let b = TrackedPlugin::new("b", &log)
        .with_deps(vec![a])
        .post_init_handle();
    let aggregate = Aggregate::new("agent").with(b).into_handle();
    let (agent, _close_tx) = build_agent(aggregate, AgentConfig::default());

    agent.start().await.unwrap();

    assert_eq!(
        events(&log),
        vec!["init:a", "init:b", "after_init:a", "after_init:b"]
    );
    agent.stop().await.unwrap();
}

#[tokio::test]
async fn start_twice_is_rejected() {
    enable_logger();
    let log = new_event_log();
    let (agent, _close_tx) = build_agent(linear_chain(&log), AgentConfig::default());

    agent.start().await.unwrap();
    assert!(matches!(
        agent.start().await.unwrap_err(),
        Error::Lifecycle(LifecycleError::AlreadyStarted)
    ));
    agent.stop().await.unwrap();
}

/// Close errors are aggregated; the sweep still visits every plugin, and a
/// repeated stop returns the recorded aggregate without reinvoking anyone.
#[tokio::test]
async fn close_errors_are_aggregated_and_stop_is_idempotent() {
    enable_logger();
    let log = new_event_log();
    let a = TrackedPlugin::new("a", &log).failing_close().plain_handle();
    let b = TrackedPlugin::new("b", &log)
        .with_deps(vec![a])
        .plain_handle();
    let c = TrackedPlugin::new("c", &log)
        .with_deps(vec![b])
        .failing_close()
        .plain_handle();
    let aggregate = Aggregate::new("agent").with(c).into_handle();
    let (agent, _close_tx) = build_agent(aggregate, AgentConfig::default());

    agent.start().await.unwrap();

    let assert_aggregate = |err: Error| match err {
        Error::Lifecycle(LifecycleError::Close(errors)) => {
            assert_eq!(errors.0.len(), 2);
            assert_eq!(errors.0[0].0, "c");
            assert_eq!(errors.0[1].0, "a");
        }
        other => panic!("expected aggregated close errors, got {}", other),
    };

    assert_aggregate(agent.stop().await.unwrap_err());
    let events_after_first = events(&log);
    assert!(events_after_first.contains(&"close:b".to_string()));

    assert_aggregate(agent.stop().await.unwrap_err());
    // no plugin was reinvoked
    assert_eq!(events(&log), events_after_first);
}

/// The external close channel ends `run` the same way a signal would.
#[tokio::test(start_paused = true)]
async fn run_stops_on_the_external_close_channel() {
    enable_logger();
    let log = new_event_log();
    let (agent, close_tx) = build_agent(linear_chain(&log), AgentConfig::default());

    let runner = {
        let agent = agent.clone();
        tokio::spawn(async move { agent.run().await })
    };

    // allow the startup phases to finish before requesting the close
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(agent.state(), AgentState::Running);

    close_tx.send(()).unwrap();
    runner.await.unwrap().unwrap();

    assert_eq!(agent.state(), AgentState::Closed);
    assert_eq!(
        events(&log),
        vec!["init:a", "init:b", "init:c", "close:c", "close:b", "close:a"]
    );
}

/// Post-init completion triggers exactly one resync pulse per subject.
#[tokio::test]
async fn successful_start_pulses_the_resync_orchestrator() {
    enable_logger();
    let log = new_event_log();
    let orchestrator = Arc::new(ResyncOrchestrator::new(&DatasyncConfig::default()));
    let mut registration = orchestrator.register("probe");

    let pulsed = Arc::new(AtomicBool::new(false));
    let seen = pulsed.clone();
    tokio::spawn(async move {
        if let Some(started) = registration.recv().await {
            seen.store(true, Ordering::Release);
            started.ack();
        }
    });

    let (close_tx, close_rx) = watch::channel(());
    let agent = AgentBuilder::new(AgentConfig::default(), close_rx)
        .aggregate(linear_chain(&log))
        .orchestrator(orchestrator)
        .build()
        .unwrap()
        .ready()
        .unwrap();

    agent.start().await.unwrap();
    assert!(pulsed.load(Ordering::Acquire));

    drop(close_tx);
    agent.stop().await.unwrap();
}
