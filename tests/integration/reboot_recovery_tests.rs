//! Integration tests for reboot recovery on `Client`.
//!
//! All tests inject a scripted dialer so connectivity failures are
//! deterministic.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use vmlink::connect::{Client, SshConfig};
use vmlink::models::reboot::RebootEvent;
use vmlink::LinkError;

use super::test_helpers::{ScriptedDialer, StalledDialer};

const JOB: &str = "mock-job";
const ADDRESS: &str = "127.0.0.1:59301";

fn client(dialer: &Arc<ScriptedDialer>, warn_ms: u64, kill_ms: u64) -> Client {
    let mut cli = Client::new(JOB, ADDRESS, SshConfig::default(), Arc::clone(dialer) as _);
    cli.set_warn_timeout(Duration::from_millis(warn_ms));
    cli.set_kill_timeout(Duration::from_millis(kill_ms));
    cli.set_retry_interval(Duration::from_millis(10));
    cli
}

#[tokio::test]
async fn kill_timeout_reached_after_reboot_request() {
    let dialer = ScriptedDialer::always_failing(Duration::from_secs(1));
    let mut cli = client(&dialer, 50, 100);

    let err = cli
        .dial_on_reboot(Instant::now())
        .await
        .expect_err("system never comes back");

    assert_eq!(
        err.to_string(),
        "kill-timeout reached after mock-job reboot request"
    );
    assert!(!cli.is_connected());
}

#[tokio::test]
async fn kill_timeout_abandons_a_stalled_dial() {
    let dialer = Arc::new(StalledDialer::default());
    let mut cli = Client::new(JOB, ADDRESS, SshConfig::default(), Arc::clone(&dialer) as _);
    cli.set_warn_timeout(Duration::from_millis(50));
    cli.set_kill_timeout(Duration::from_millis(100));

    let requested_at = Instant::now();
    let err = tokio::time::timeout(Duration::from_secs(3), cli.dial_on_reboot(requested_at))
        .await
        .expect("recovery must end at the kill timeout")
        .expect_err("dial never completes");

    assert!(matches!(err, LinkError::KillTimeout { ref job } if job == JOB));
    assert!(requested_at.elapsed() >= Duration::from_millis(100));
    assert_eq!(dialer.attempts(), 1);
    assert!(!cli.is_connected());
}

#[tokio::test]
async fn does_not_give_up_before_kill_timeout() {
    let dialer = ScriptedDialer::always_failing(Duration::from_millis(5));
    let mut cli = client(&dialer, 100, 300);

    let requested_at = Instant::now();
    let err = cli
        .dial_on_reboot(requested_at)
        .await
        .expect_err("system never comes back");

    assert!(matches!(err, LinkError::KillTimeout { ref job } if job == JOB));
    assert!(
        requested_at.elapsed() > Duration::from_millis(300),
        "gave up after only {:?}",
        requested_at.elapsed()
    );
    assert!(dialer.attempts() > 1, "failures must be retried");
}

#[tokio::test]
async fn elapsed_time_counts_from_the_request() {
    let dialer = ScriptedDialer::always_failing(Duration::ZERO);
    let mut cli = client(&dialer, 50, 100);

    // The reboot was requested long ago: the first failure is already fatal.
    let requested_at = Instant::now()
        .checked_sub(Duration::from_secs(1))
        .unwrap_or_else(Instant::now);
    let err = cli.dial_on_reboot(requested_at).await.expect_err("too late");

    assert!(matches!(err, LinkError::KillTimeout { .. }));
    assert_eq!(dialer.attempts(), 1);
}

#[tokio::test]
async fn reconnects_and_replaces_the_session() {
    let dialer = ScriptedDialer::new(&[true, false, false, true], false, Duration::ZERO);
    let mut cli = Client::connect(JOB, ADDRESS, SshConfig::default(), Arc::clone(&dialer) as _)
        .await
        .unwrap();
    cli.set_retry_interval(Duration::from_millis(10));
    assert_eq!(cli.run("uptime").await.unwrap(), "1:uptime");

    cli.dial_on_reboot(Instant::now()).await.unwrap();

    assert!(cli.is_connected());
    assert_eq!(dialer.attempts(), 4);
    assert_eq!(cli.run("uptime").await.unwrap(), "4:uptime");
    assert_eq!(
        dialer.sessions_dropped(),
        1,
        "the pre-reboot session must be discarded"
    );

    cli.close();
    assert!(!cli.is_connected());
    assert_eq!(dialer.sessions_dropped(), 2);
}

#[tokio::test]
async fn slow_reboot_emits_progress_then_reconnects() {
    let dialer = ScriptedDialer::new(&[false; 8], true, Duration::from_millis(10));
    let (tx, mut rx) = mpsc::channel(16);
    let mut cli = client(&dialer, 30, 5_000).with_events(tx);

    cli.dial_on_reboot(Instant::now()).await.unwrap();

    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    assert!(
        events
            .iter()
            .any(|e| matches!(e, RebootEvent::Slow { job, elapsed } if job == JOB && *elapsed > Duration::from_millis(30))),
        "expected a Slow event, got {events:?}"
    );
    assert_eq!(
        events.last(),
        Some(&RebootEvent::Reconnected {
            job: JOB.into(),
            attempts: 9
        })
    );
}

#[tokio::test]
async fn quick_reboot_emits_no_warning() {
    let dialer = ScriptedDialer::new(&[false, true], false, Duration::ZERO);
    let (tx, mut rx) = mpsc::channel(16);
    let mut cli = client(&dialer, 5_000, 10_000).with_events(tx);

    cli.dial_on_reboot(Instant::now()).await.unwrap();

    assert!(matches!(
        rx.try_recv(),
        Ok(RebootEvent::Reconnected { attempts: 2, .. })
    ));
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn cancellation_aborts_recovery_early() {
    let dialer = ScriptedDialer::always_failing(Duration::from_millis(20));
    let mut cli = client(&dialer, 30_000, 60_000);

    let ct = CancellationToken::new();
    let trigger = ct.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(150)).await;
        trigger.cancel();
    });

    let started = Instant::now();
    let err = cli
        .dial_on_reboot_until(Instant::now(), &ct)
        .await
        .expect_err("cancelled");

    assert!(matches!(err, LinkError::Cancelled(ref msg) if msg.contains(JOB)));
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[tokio::test]
async fn run_without_session_fails() {
    let dialer = ScriptedDialer::always_failing(Duration::ZERO);
    let cli = client(&dialer, 50, 100);

    let err = cli.run("true").await.expect_err("no session");
    assert!(matches!(err, LinkError::Exec(_)));
}

#[tokio::test]
async fn defaults_are_five_and_fifteen_minutes() {
    let dialer = ScriptedDialer::always_failing(Duration::ZERO);
    let cli = Client::new(JOB, ADDRESS, SshConfig::default(), dialer as _);

    assert_eq!(cli.warn_timeout(), Duration::from_secs(300));
    assert_eq!(cli.kill_timeout(), Duration::from_secs(900));
    assert_eq!(cli.job(), JOB);
    assert_eq!(cli.address(), ADDRESS);
}
