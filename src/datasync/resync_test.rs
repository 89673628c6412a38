use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use super::*;
use crate::test_utils::enable_logger;
use crate::DatasyncConfig;

fn orchestrator() -> ResyncOrchestrator {
    ResyncOrchestrator::new(&DatasyncConfig::default())
}

#[tokio::test]
async fn pulse_reaches_every_subject_and_awaits_ack() {
    enable_logger();
    let orchestrator = Arc::new(orchestrator());

    let mut flags = Vec::new();
    for subject in ["ifplugin", "l3plugin"] {
        let mut registration = orchestrator.register(subject);
        let flag = Arc::new(AtomicBool::new(false));
        flags.push(flag.clone());
        tokio::spawn(async move {
            while let Some(started) = registration.recv().await {
                flag.store(true, Ordering::Release);
                started.ack();
            }
        });
    }

    orchestrator.trigger_resync().await;

    for flag in flags {
        assert!(flag.load(Ordering::Acquire));
    }
}

/// A subject that never acks unblocks the pulse after the bounded wait.
#[tokio::test(start_paused = true)]
async fn missing_ack_unblocks_the_pulse_after_the_bound() {
    enable_logger();
    let orchestrator = Arc::new(orchestrator());
    let mut registration = orchestrator.register("silent");

    tokio::spawn(async move {
        while let Some(started) = registration.recv().await {
            // receive but never resolve the ack
            std::mem::forget(started);
        }
    });

    let begin = Instant::now();
    orchestrator.trigger_resync().await;

    assert!(begin.elapsed() >= Duration::from_secs(5));
}

/// A dropped registration is skipped without stalling the pulse.
#[tokio::test(start_paused = true)]
async fn dropped_registration_is_skipped() {
    enable_logger();
    let orchestrator = orchestrator();
    let registration = orchestrator.register("gone");
    drop(registration);

    let begin = Instant::now();
    orchestrator.trigger_resync().await;

    assert!(begin.elapsed() < Duration::from_secs(1));
}

/// Repeated pulses produce repeated started events.
#[tokio::test]
async fn repeated_pulses_are_delivered() {
    enable_logger();
    let orchestrator = Arc::new(orchestrator());
    let mut registration = orchestrator.register("ifplugin");

    let count = Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let seen = count.clone();
    tokio::spawn(async move {
        while let Some(started) = registration.recv().await {
            seen.fetch_add(1, Ordering::AcqRel);
            started.ack();
        }
    });

    orchestrator.trigger_resync().await;
    orchestrator.trigger_resync().await;

    assert_eq!(count.load(Ordering::Acquire), 2);
}

#[test]
#[should_panic(expected = "duplicate resync registration")]
fn duplicate_subject_panics() {
    let orchestrator = orchestrator();
    let _first = orchestrator.register("ifplugin");
    let _second = orchestrator.register("ifplugin");
}

#[tokio::test]
#[should_panic(expected = "after the first pulse")]
async fn registration_after_the_first_pulse_panics() {
    let orchestrator = orchestrator();
    orchestrator.trigger_resync().await;
    let _late = orchestrator.register("latecomer");
}
