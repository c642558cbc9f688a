//! Node lifecycle: clean shutdown, idempotent finalize, liveness state.

mod common;

use std::time::Duration;

use common::{spawn_cluster, TEST_TIMEOUT};

/// Finalize must join both transport loops on every node without hanging,
/// and calling it again is a no-op.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn finalize_joins_the_loops_and_is_idempotent() -> anyhow::Result<()> {
    let cluster = spawn_cluster(1, 2).await?;
    tokio::time::timeout(TEST_TIMEOUT, cluster.finalize()).await??;
    tokio::time::timeout(TEST_TIMEOUT, cluster.finalize()).await??;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn healthy_cluster_reports_no_unreachable_peers() -> anyhow::Result<()> {
    let cluster = spawn_cluster(1, 1).await?;
    // Let a few heartbeat intervals elapse.
    tokio::time::sleep(Duration::from_millis(600)).await;
    for node in cluster.all() {
        assert!(node.unreachable_nodes().await.is_empty());
    }
    // Startup alone moves bytes: the barrier round-trips through the
    // scheduler.
    assert!(cluster.scheduler.transport().bytes_recv() > 0);
    assert!(cluster.workers[0].transport().bytes_sent() > 0);
    cluster.finalize().await
}
