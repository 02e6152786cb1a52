//! Discovery: which server a client reaches from where

use command_server::server::InvokeOutcome;
use command_server::supervisor::ChildStatus;

use crate::common::*;

#[tokio::test]
async fn test_invoke_reaches_nearest_ancestor() {
    let tree = Tree::new();
    let foo_log = tree.dir("foo.log");
    let bar_log = tree.dir("bar.log");
    let foo = serve_script(&tree, &tree.dir("foo"), &append_script(&foo_log, "foo")).await;
    let bar = serve_script(&tree, &tree.dir("foo/bar"), &append_script(&bar_log, "bar")).await;
    wait_for_count(&foo_log, 1).await;
    wait_for_count(&bar_log, 1).await;

    let client = tree.client();
    assert_eq!(client.invoke(&tree.dir("foo/bar/baz")).await, InvokeOutcome::Ok);
    wait_for_count(&bar_log, 2).await;
    assert_eq!(read_lines(&foo_log).len(), 1);

    assert_eq!(client.invoke(&tree.dir("foo")).await, InvokeOutcome::Ok);
    wait_for_count(&foo_log, 2).await;
    assert_eq!(read_lines(&bar_log).len(), 2);

    bar.stop().await;
    foo.stop().await;
}

#[tokio::test]
async fn test_invoke_outside_tree_finds_nothing() {
    let tree = Tree::new();
    let log = tree.dir("foo.log");
    let server = serve_script(&tree, &tree.dir("foo"), &append_script(&log, "hello")).await;
    wait_for_count(&log, 1).await;

    let outcome = tree.client().invoke(&tree.dir("other")).await;

    assert_eq!(outcome, InvokeOutcome::NoServerRegistered);
    assert_eq!(outcome.to_string(), "no server registered");
    assert_eq!(read_lines(&log).len(), 1);
    server.stop().await;
}

#[tokio::test]
async fn test_second_server_in_same_directory_is_rejected() {
    let tree = Tree::new();
    let log = tree.dir("foo.log");
    let first = serve_script(&tree, &tree.dir("foo"), &append_script(&log, "first")).await;
    wait_for_count(&log, 1).await;

    let err = try_serve_script(&tree, &tree.dir("foo"), "true")
        .await
        .err()
        .expect("second server must not start");
    assert!(err.is_already_registered());

    // The first server is unaffected
    assert_eq!(tree.client().invoke(&tree.dir("foo")).await, InvokeOutcome::Ok);
    wait_for_count(&log, 2).await;
    first.stop().await;
}

#[tokio::test]
async fn test_restart_after_stop() {
    let tree = Tree::new();
    let old_log = tree.dir("old.log");
    let new_log = tree.dir("new.log");
    let client = tree.client();

    let old = serve_script(&tree, &tree.dir("foo"), &append_script(&old_log, "old")).await;
    wait_for_count(&old_log, 1).await;
    old.stop().await;

    assert_eq!(
        client.invoke(&tree.dir("foo/bar")).await,
        InvokeOutcome::NoServerRegistered
    );

    let new = serve_script(&tree, &tree.dir("foo"), &append_script(&new_log, "new")).await;
    wait_for_count(&new_log, 1).await;
    assert_eq!(client.invoke(&tree.dir("foo/bar")).await, InvokeOutcome::Ok);
    wait_for_count(&new_log, 2).await;
    assert_eq!(read_lines(&old_log).len(), 1);
    new.stop().await;
}

#[tokio::test]
async fn test_stale_record_does_not_block_new_server() {
    let tree = Tree::new();
    let registry = tree.registry();
    let foo = tree.dir("foo");

    // A record whose endpoint nobody listens on, as left by a crashed server
    registry
        .publish(&foo, &tree.dir("dead.sock"))
        .await
        .expect("publish stale record");
    assert_eq!(
        tree.client().invoke(&foo).await,
        InvokeOutcome::NoServerRegistered
    );

    let log = tree.dir("foo.log");
    let server = serve_script(&tree, &foo, &append_script(&log, "hello")).await;
    wait_for_count(&log, 1).await;
    assert_eq!(tree.client().invoke(&foo).await, InvokeOutcome::Ok);
    server.stop().await;
}

#[tokio::test]
async fn test_status_and_remote_stop() {
    let tree = Tree::new();
    let log = tree.dir("foo.log");
    let server = serve_script(&tree, &tree.dir("foo"), &append_script(&log, "hello")).await;
    wait_for_count(&log, 1).await;
    let client = tree.client();

    assert_eq!(client.invoke(&tree.dir("foo/bar")).await, InvokeOutcome::Ok);
    wait_for_count(&log, 2).await;

    let status = client
        .status(&tree.dir("foo/bar/baz"))
        .await
        .expect("status")
        .expect("server found");
    assert_eq!(status.directory, tree.dir("foo"));
    assert_eq!(status.invocations, 1);
    assert_eq!(status.pid, std::process::id());
    assert!(status.child_pid.is_some());
    assert!(matches!(
        status.child,
        Some(ChildStatus::Running) | Some(ChildStatus::ExitedWith(0))
    ));

    let stopped = client.stop(&tree.dir("foo")).await.expect("stop");
    assert!(stopped.is_some());
    server.stop().await;

    assert!(tree.registry().lookup(&tree.dir("foo")).unwrap().is_none());
}
