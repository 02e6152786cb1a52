//! Respawn behaviour with real child processes

use command_server::server::InvokeOutcome;

use crate::common::*;

/// Long-running child that logs `start <pid>`, and `stop <pid>` slowly on SIGTERM
fn slow_stopping_script(log: &std::path::Path) -> String {
    format!(
        "trap 'sleep 0.2; echo stop $$ >> \"{log}\"; exit 0' TERM; \
         echo start $$ >> \"{log}\"; \
         while true; do sleep 0.05; done",
        log = log.display()
    )
}

fn events(lines: &[String]) -> Vec<(&str, &str)> {
    lines
        .iter()
        .filter_map(|line| line.split_once(' '))
        .collect()
}

#[tokio::test]
async fn test_sequential_invocations_rerun_the_command() {
    let tree = Tree::new();
    let log = tree.dir("runs.log");
    let server = serve_script(&tree, &tree.dir("foo"), &append_script(&log, "run")).await;
    let client = tree.client();

    for expected in 1..=3 {
        wait_for_count(&log, expected).await;
        assert_eq!(client.invoke(&tree.dir("foo/bar")).await, InvokeOutcome::Ok);
    }
    wait_for_count(&log, 4).await;
    server.stop().await;
}

#[tokio::test]
async fn test_running_child_is_stopped_before_the_next_starts() {
    let tree = Tree::new();
    let log = tree.dir("lifecycle.log");
    let server = serve_script(&tree, &tree.dir("foo"), &slow_stopping_script(&log)).await;
    wait_for_count(&log, 1).await;

    assert_eq!(tree.client().invoke(&tree.dir("foo")).await, InvokeOutcome::Ok);

    let lines = wait_for_lines(&log, |lines| lines.len() >= 3).await;
    let events = events(&lines);
    let kinds: Vec<&str> = events.iter().map(|(kind, _)| *kind).collect();
    assert_eq!(kinds, vec!["start", "stop", "start"]);
    assert_eq!(events[0].1, events[1].1);
    assert_ne!(events[1].1, events[2].1);
    server.stop().await;
}

#[tokio::test]
async fn test_concurrent_invocations_never_overlap() {
    let tree = Tree::new();
    let log = tree.dir("lifecycle.log");
    let server = serve_script(&tree, &tree.dir("foo"), &slow_stopping_script(&log)).await;
    wait_for_count(&log, 1).await;

    let first = tokio::spawn({
        let client = tree.client();
        let dir = tree.dir("foo/bar");
        async move { client.invoke(&dir).await }
    });
    let second = tokio::spawn({
        let client = tree.client();
        let dir = tree.dir("foo/bar/baz");
        async move { client.invoke(&dir).await }
    });
    assert_eq!(first.await.unwrap(), InvokeOutcome::Ok);
    assert_eq!(second.await.unwrap(), InvokeOutcome::Ok);

    // The middle child may be signalled before it logs either line, so
    // only the grouping is fixed: each child's lines form one unbroken run.
    let lines = wait_for_lines(&log, |lines| {
        lines.iter().any(|l| l.starts_with("stop"))
            && lines.last().is_some_and(|l| l.starts_with("start"))
    })
    .await;
    let mut finished: Vec<&str> = Vec::new();
    let mut current: Option<&str> = None;
    for (_, pid) in events(&lines) {
        if current != Some(pid) {
            assert!(!finished.contains(&pid), "overlapping lifecycles: {:?}", lines);
            finished.extend(current);
            current = Some(pid);
        }
    }
    assert!(lines.first().is_some_and(|l| l.starts_with("start")));
    assert!(lines.last().is_some_and(|l| l.starts_with("start")));
    server.stop().await;
}

#[tokio::test]
async fn test_command_exit_status_is_not_a_failure() {
    let tree = Tree::new();
    let foo = tree.dir("foo");
    let log = tree.dir("foo.log");
    let script = format!(
        "test -e '{flag}' || exit 3; echo run >> '{log}'",
        flag = tree.dir("enabled").display(),
        log = log.display()
    );
    let server = serve_script(&tree, &foo, &script).await;
    let client = tree.client();

    assert_eq!(client.invoke(&foo).await, InvokeOutcome::Ok);
    std::fs::write(tree.dir("enabled"), "").unwrap();
    assert_eq!(client.invoke(&foo).await, InvokeOutcome::Ok);
    wait_for_count(&log, 1).await;
    server.stop().await;
}

#[tokio::test]
async fn test_spawn_failure_keeps_server_alive() {
    let tree = Tree::new();
    let foo = tree.dir("foo");
    let log = tree.dir("foo.log");
    // The managed program is a link to sh that the test can take away
    let program = tree.dir("shell");
    let install = || std::os::unix::fs::symlink("/bin/sh", &program).unwrap();

    install();
    let argv = vec![
        program.display().to_string(),
        "-c".to_string(),
        append_script(&log, "run"),
    ];
    let server = try_serve(&tree, &foo, argv).await.expect("server start");
    let client = tree.client();
    wait_for_count(&log, 1).await;

    std::fs::remove_file(&program).unwrap();
    let outcome = client.invoke(&foo).await;
    assert!(matches!(outcome, InvokeOutcome::SpawnFailed(_)), "{:?}", outcome);
    assert!(outcome.to_string().starts_with("spawn failed:"));

    install();
    assert_eq!(client.invoke(&foo).await, InvokeOutcome::Ok);
    wait_for_count(&log, 2).await;
    server.stop().await;
}
