use meshperf::correlate::Cell;
use meshperf::models::Pattern;
use meshperf_devkit::TestHarness;
use test_integration::{initiators, key};

#[tokio::test(start_paused = true)]
async fn test_fullmesh_latency_matrix() -> anyhow::Result<()> {
    let harness = TestHarness::new(Pattern::FullMesh, &["a", "b"], &["c"]);
    harness
        .remote
        .set_results(initiators(&[("a", 1.5), ("b", 2.5), ("c", 3.5)]));

    let outcome = harness.workflow().latency().await?;
    let corr = &outcome.correlation;

    // every host listens for two peers and initiates towards two
    for host in ["a", "b", "c"] {
        let scripts = harness.remote.dispatched_to(host);
        assert_eq!(scripts.len(), 2, "{host}");
        assert!(scripts.iter().all(|s| s.matches("ib_write_lat").count() == 2));
    }

    assert_eq!(corr.statistics.count, 6);
    assert_eq!(corr.statistics.mean, 2.5);
    assert_eq!(corr.matrix.value(&key("a"), &key("b")), Some(1.5));
    assert_eq!(corr.matrix.value(&key("c"), &key("a")), Some(3.5));
    assert_eq!(corr.matrix.cell(&key("a"), &key("a")), Cell::SelfPair);
    assert!(corr.per_source.is_none());
    assert!(corr.missing.is_empty());
    assert!(outcome.failed_hosts.is_empty());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_unreachable_host_leaves_a_gap() -> anyhow::Result<()> {
    let harness = TestHarness::new(Pattern::InCast, &["s1"], &["c1", "c2"]);
    harness.remote.set_results(initiators(&[("c1", 2.0), ("c2", 2.0)]));
    harness.remote.fail_fetch("c2");

    let outcome = harness.workflow().latency().await?;
    let corr = &outcome.correlation;

    assert!(outcome.failed_hosts.contains_key("c2"));
    assert_eq!(corr.matrix.value(&key("c1"), &key("s1")), Some(2.0));
    assert_eq!(corr.matrix.cell(&key("c2"), &key("s1")), Cell::Gap);
    assert_eq!(corr.missing.len(), 1);
    assert_eq!(corr.missing[0].initiator().host, "c2");
    assert!(corr.per_source.as_ref().unwrap().contains_key(&key("c1")));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_latency_run_purges_stale_reports_first() -> anyhow::Result<()> {
    let harness = TestHarness::new(Pattern::InCast, &["s1"], &["c1"]);
    harness.remote.stage_report("c1", "latency_incast_c_c1_mlx5_0_to_s9_mlx5_0_p20000.json", b"{}".to_vec());
    harness.remote.set_results(initiators(&[("c1", 4.0)]));

    let outcome = harness.workflow().latency().await?;

    // the stale s9 report never reaches the matrix
    assert_eq!(outcome.correlation.matrix.sources(), vec![key("c1")]);
    assert_eq!(outcome.correlation.matrix.targets(), vec![key("s1")]);
    Ok(())
}
