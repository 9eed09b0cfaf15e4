//! Group supervision tests: startup, fault propagation and teardown

mod helpers;

use std::time::{Duration, Instant};

use cellrig_core::{HarnessConfig, HarnessError, Signal};
use cellrig_poll::{consistently, value_fn};
use cellrig_process::{Group, GroupStyle, MemberSpec, TcpProbe};

use helpers::{
    crasher, init_tracing, marker_path, process_gone, read_pid, sleeper, slow_sleeper, test_config,
};

const WAIT: Duration = Duration::from_secs(10);

#[tokio::test]
async fn test_parallel_fault_tears_down_survivors() {
    init_tracing();

    let config = test_config();
    let group = Group::start_parallel(
        &config,
        vec![sleeper("api"), crasher("worker", 3, "1"), sleeper("cache")],
    )
    .await
    .expect("group should start");
    assert_eq!(group.style(), GroupStyle::Parallel);

    let started = Instant::now();
    let report = group.wait(WAIT).await.unwrap();

    let fault = report.fault.clone().expect("fault recorded");
    assert_eq!(fault.name, "worker");
    assert_eq!(fault.code, 3);
    assert_eq!(report.teardown_signal, Some(Signal::Terminate));
    assert_eq!(report.code("api"), Some(143));
    assert_eq!(report.code("cache"), Some(143));
    assert!(!report.escalated);
    assert!(started.elapsed() < Duration::from_secs(5));

    assert!(matches!(
        group.fault(),
        Some(HarnessError::MemberFault { ref member, code: 3 }) if member == "worker"
    ));
    assert!(report.check().is_err());
}

#[tokio::test]
async fn test_parallel_readiness_failure_kills_started_members() {
    init_tracing();

    let config = test_config();
    let pid_file = marker_path("api-pid");
    let err = Group::start_parallel(
        &config,
        vec![
            slow_sleeper("api", "0", &pid_file),
            MemberSpec::shell("broken", "sleep 0.3; echo nope; exit 4").ready_on_output("ready"),
        ],
    )
    .await
    .err()
    .expect("startup should fail");

    assert!(
        matches!(err, HarnessError::MemberFault { ref member, code: 4 } if member == "broken"),
        "{}",
        err
    );
    assert!(process_gone(read_pid(&pid_file)), "ready member must be killed and reaped");
}

#[tokio::test]
async fn test_parallel_member_death_during_startup_fails_start() {
    init_tracing();

    let config = test_config();
    let pid_file = marker_path("slow-pid");
    let started = Instant::now();

    let err = Group::start_parallel(
        &config,
        vec![
            crasher("worker", 3, "0.1"),
            slow_sleeper("slow", "3", &pid_file).readiness_timeout(Duration::from_secs(5)),
        ],
    )
    .await
    .err()
    .expect("startup should fail");

    assert!(
        matches!(err, HarnessError::MemberFault { ref member, code: 3 } if member == "worker"),
        "{}",
        err
    );
    assert!(started.elapsed() < Duration::from_secs(2), "took {:?}", started.elapsed());
    assert!(process_gone(read_pid(&pid_file)));
}

#[tokio::test]
async fn test_staged_member_death_during_startup_fails_start() {
    init_tracing();

    let config = test_config();
    let pid_file = marker_path("api-pid");
    let marker = marker_path("never-started");
    let started = Instant::now();

    let err = Group::start_staged(
        &config,
        vec![
            MemberSpec::shell("db", "echo db started; sleep 0.2; exit 3").ready_on_output("db started"),
            slow_sleeper("api", "3", &pid_file).readiness_timeout(Duration::from_secs(5)),
            MemberSpec::shell("web", format!("touch {}; exec sleep 30", marker.display())),
        ],
    )
    .await
    .err()
    .expect("startup should fail");

    assert!(
        matches!(err, HarnessError::MemberFault { ref member, code: 3 } if member == "db"),
        "{}",
        err
    );
    assert!(started.elapsed() < Duration::from_secs(2), "took {:?}", started.elapsed());
    assert!(process_gone(read_pid(&pid_file)));
    assert!(!marker.exists(), "later members must never be launched");
}

#[tokio::test]
async fn test_staged_tolerated_death_during_startup_is_ignored() {
    init_tracing();

    let config = test_config();
    let pid_file = marker_path("api-pid");
    let group = Group::start_staged(
        &config,
        vec![
            MemberSpec::shell("seed", "echo seeded; exit 0")
                .ready_on_output("seeded")
                .tolerate_exit(),
            slow_sleeper("api", "0.3", &pid_file),
        ],
    )
    .await
    .expect("tolerated exit must not fail startup");

    let report = group.stop(Signal::Terminate, WAIT).await.unwrap();
    assert!(report.fault.is_none());
    assert_eq!(report.code("seed"), Some(0));
    assert_eq!(report.code("api"), Some(143));
    let _ = std::fs::remove_file(&pid_file);
}

#[tokio::test]
async fn test_staged_fatal_exit_after_startup_tears_down() {
    init_tracing();

    let config = test_config();
    let group = Group::start_staged(
        &config,
        vec![
            sleeper("db"),
            MemberSpec::shell("api", "echo api started; sleep 1; exit 5").ready_on_output("api started"),
            sleeper("web"),
        ],
    )
    .await
    .expect("group should start");

    let report = group.wait(WAIT).await.unwrap();
    let fault = report.fault.clone().expect("fault recorded");
    assert_eq!(fault.name, "api");
    assert_eq!(fault.code, 5);
    assert_eq!(report.teardown_signal, Some(Signal::Terminate));
    assert_eq!(report.code("db"), Some(143));
    assert_eq!(report.code("web"), Some(143));
    assert!(matches!(group.fault(), Some(HarnessError::MemberFault { code: 5, .. })));
}

#[tokio::test]
async fn test_staged_readiness_timeout_stops_startup() {
    init_tracing();

    let config = test_config();
    let marker = marker_path("never-started");
    let started = Instant::now();

    let err = Group::start_staged(
        &config,
        vec![
            MemberSpec::shell("slow", "echo booting; exec sleep 30")
                .ready_on_output("ready")
                .readiness_timeout(Duration::from_millis(300)),
            MemberSpec::shell("next", format!("touch {}; exec sleep 30", marker.display())),
        ],
    )
    .await
    .err()
    .expect("startup should fail");

    match err {
        HarnessError::ReadinessTimeout { member, timeout, .. } => {
            assert_eq!(member, "slow");
            assert_eq!(timeout, Duration::from_millis(300));
        }
        other => panic!("expected readiness timeout, got {}", other),
    }
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(!marker.exists(), "second member must never be launched");
}

#[tokio::test]
async fn test_staged_starts_in_order() {
    init_tracing();

    let config = test_config();
    let log = marker_path("order");
    let member = |name: &str| {
        MemberSpec::shell(
            name,
            format!("echo {} >> {}; echo {} started; exec sleep 30", name, log.display(), name),
        )
        .ready_on_output(format!("{} started", name))
    };

    let group = Group::start_staged(&config, vec![member("db"), member("api"), member("web")])
        .await
        .unwrap();
    let names: Vec<&str> = group.members().iter().map(|m| m.name()).collect();
    assert_eq!(names, vec!["db", "api", "web"]);

    let report = group.stop(Signal::Interrupt, WAIT).await.unwrap();
    assert!(report.check().is_ok());
    assert_eq!(report.teardown_signal, Some(Signal::Interrupt));
    assert!(report.exits.iter().all(|exit| exit.code == 130));

    let order = std::fs::read_to_string(&log).unwrap();
    assert_eq!(order, "db\napi\nweb\n");
    let _ = std::fs::remove_file(&log);
}

#[tokio::test]
async fn test_first_teardown_signal_wins() {
    init_tracing();

    let config = test_config();
    let group = Group::start_parallel(&config, vec![sleeper("a"), sleeper("b")])
        .await
        .unwrap();

    group.signal(Signal::Interrupt);
    group.signal(Signal::Kill);
    group.signal(Signal::Terminate);

    let report = group.wait(WAIT).await.unwrap();
    assert_eq!(report.teardown_signal, Some(Signal::Interrupt));
    assert_eq!(report.code("a"), Some(130));
    assert_eq!(report.code("b"), Some(130));
    assert!(report.fault.is_none());
}

#[tokio::test]
async fn test_staged_tolerated_exit_keeps_group_running() {
    init_tracing();

    let config = test_config();
    let group = Group::start_staged(
        &config,
        vec![
            MemberSpec::shell("migrate", "echo migrated")
                .ready_on_output("migrated")
                .tolerate_exit(),
            sleeper("api"),
        ],
    )
    .await
    .unwrap();

    let fault_rx = group.subscribe_faults();
    consistently(value_fn(move || fault_rx.borrow().is_none()))
        .with_config(&config)
        .during(Duration::from_millis(200))
        .should(cellrig_poll::be_true())
        .await
        .unwrap();
    assert!(group.fault().is_none());

    let report = group.stop(Signal::Terminate, WAIT).await.unwrap();
    assert!(report.fault.is_none());
    assert_eq!(report.code("migrate"), Some(0));
    assert_eq!(report.code("api"), Some(143));
}

#[tokio::test]
async fn test_teardown_escalates_to_kill() {
    init_tracing();

    let config = HarnessConfig {
        teardown_grace_ms: 300,
        ..test_config()
    };
    let stubborn = MemberSpec::shell(
        "stubborn",
        "trap '' TERM; echo stubborn started; while true; do sleep 0.05; done",
    )
    .ready_on_output("stubborn started");

    let group = Group::start_parallel(&config, vec![stubborn]).await.unwrap();
    let report = group.stop(Signal::Terminate, WAIT).await.unwrap();

    assert!(report.escalated);
    assert_eq!(report.code("stubborn"), Some(137));
}

#[tokio::test]
async fn test_dropping_group_kills_members() {
    init_tracing();

    let config = test_config();
    let group = Group::start_parallel(&config, vec![sleeper("orphan")]).await.unwrap();
    let session = group.member("orphan").cloned().unwrap();

    drop(group);

    let code = session.wait(WAIT).await.unwrap();
    assert_eq!(code, 137);
}

#[tokio::test]
async fn test_tcp_readiness_waits_for_listener() {
    init_tracing();

    let config = test_config();
    let address = std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap();

    let listener = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        let listener = tokio::net::TcpListener::bind(address).await.unwrap();
        tokio::time::sleep(Duration::from_secs(30)).await;
        drop(listener);
    });

    let started = Instant::now();
    let group = Group::start_staged(
        &config,
        vec![MemberSpec::shell("db", "exec sleep 30").ready_on_probe(TcpProbe::new(address.to_string()))],
    )
    .await
    .expect("group should start once the port accepts");
    assert!(started.elapsed() >= Duration::from_millis(300));
    assert!(!group.member("db").unwrap().has_exited());

    let report = group.stop(Signal::Terminate, WAIT).await.unwrap();
    assert_eq!(report.code("db"), Some(143));
    listener.abort();
}

#[tokio::test]
async fn test_member_exit_fails_tcp_readiness_fast() {
    init_tracing();

    let config = test_config();
    let started = Instant::now();

    // Nothing listens on port 1
    let err = Group::start_staged(
        &config,
        vec![MemberSpec::shell("db", "sleep 0.1; exit 6")
            .ready_on_probe(TcpProbe::new("127.0.0.1:1"))
            .readiness_timeout(Duration::from_secs(5))],
    )
    .await
    .err()
    .expect("startup should fail");

    assert!(
        matches!(err, HarnessError::MemberFault { ref member, code: 6 } if member == "db"),
        "{}",
        err
    );
    assert!(started.elapsed() < Duration::from_secs(2), "took {:?}", started.elapsed());
}

#[tokio::test]
async fn test_dropping_group_during_teardown_kills_members() {
    init_tracing();

    // Long grace: only the drop can end the member in time
    let config = HarnessConfig {
        teardown_grace_ms: 30_000,
        ..test_config()
    };
    let stubborn = MemberSpec::shell(
        "stubborn",
        "trap '' TERM; echo stubborn started; while true; do sleep 0.05; done",
    )
    .ready_on_output("stubborn started");

    let group = Group::start_parallel(&config, vec![stubborn]).await.unwrap();
    let session = group.member("stubborn").cloned().unwrap();

    group.signal(Signal::Terminate);
    drop(group);

    let code = session.wait(Duration::from_secs(5)).await.unwrap();
    assert_eq!(code, 137);
}

#[tokio::test]
async fn test_duplicate_member_names_rejected() {
    init_tracing();

    let config = test_config();
    let err = Group::start_parallel(&config, vec![sleeper("twin"), sleeper("twin")])
        .await
        .err()
        .expect("duplicates rejected");
    assert!(matches!(err, HarnessError::Config(_)));
}
