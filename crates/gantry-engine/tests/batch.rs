//! End-to-end tests of the batch compute service.

use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;

use gantry_engine::CompoundJob;
use gantry_engine::CompoundJobState;
use gantry_engine::Error;
use gantry_engine::JobEvent;
use gantry_engine::TerminationCause;
use gantry_engine::batch::BatchComputeService;
use gantry_engine::batch::BatchServiceHandle;
use gantry_engine::batch::StartTimeEstimateSpec;
use gantry_engine::config::BatchSchedulingAlgorithm;
use gantry_engine::config::BatchServiceConfig;
use gantry_sim::GB;
use gantry_sim::NodeSpec;
use gantry_sim::SimClock;
use pretty_assertions::assert_eq;
use tokio::sync::mpsc;

/// Makes a homogeneous cluster of `n` nodes with the given core count.
fn nodes(n: usize, cores: u64) -> Vec<NodeSpec> {
    (0..n)
        .map(|i| NodeSpec::new(format!("node{i}"), cores, 16 * GB, 100 * GB, 1e9))
        .collect()
}

/// Makes a configuration running the given scheduling algorithm.
fn config(algorithm: BatchSchedulingAlgorithm) -> BatchServiceConfig {
    BatchServiceConfig {
        scheduling_algorithm: algorithm,
        ..Default::default()
    }
}

/// Makes `-N`/`-c`/`-t` submission arguments.
fn args(nodes: u64, cores: u64, walltime: u64) -> HashMap<String, String> {
    HashMap::from([
        ("-N".to_string(), nodes.to_string()),
        ("-c".to_string(), cores.to_string()),
        ("-t".to_string(), walltime.to_string()),
    ])
}

/// Makes a compound job with one sleep action and a callback port.
fn sleep_job(
    name: &str,
    seconds: f64,
) -> (Arc<CompoundJob>, mpsc::UnboundedReceiver<JobEvent>) {
    let job = CompoundJob::new(name);
    job.add_sleep_action("work", seconds);
    let (tx, rx) = mpsc::unbounded_channel();
    job.push_callback_port(tx);
    (job, rx)
}

/// Receives the next done notification, asserting its job name.
async fn expect_done(rx: &mut mpsc::UnboundedReceiver<JobEvent>, name: &str) {
    match rx.recv().await.expect("a notification should arrive") {
        JobEvent::Done { job, .. } => assert_eq!(job.name(), name),
        JobEvent::Failed { job, cause, .. } => {
            panic!("job `{name}` failed unexpectedly: {cause} ({})", job.name())
        }
    }
}

/// Gets the queue snapshot entry of the given job.
async fn snapshot_entry(
    service: &BatchServiceHandle,
    name: &str,
) -> gantry_engine::batch::BatchQueueEntry {
    service
        .queue()
        .await
        .unwrap()
        .into_iter()
        .find(|e| e.job_name == name)
        .unwrap_or_else(|| panic!("job `{name}` should be in the queue snapshot"))
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn fcfs_head_of_queue_blocks_the_rest() {
    let clock = SimClock::new();
    let service = BatchComputeService::start(
        "batch",
        nodes(2, 4),
        &clock,
        config(BatchSchedulingAlgorithm::Fcfs),
    )
    .unwrap();

    let (a, mut rx_a) = sleep_job("A", 10.0);
    let (b, mut rx_b) = sleep_job("B", 10.0);
    service.submit_compound_job(&a, &args(2, 4, 10)).await.unwrap();
    service.submit_compound_job(&b, &args(1, 1, 10)).await.unwrap();

    // At t=1, A runs and B waits; the snapshot sorts by descending
    // arrival, ties by descending name.
    clock.sleep(1.0).await;
    let snapshot = service.queue().await.unwrap();
    assert_eq!(snapshot.len(), 2);
    assert_eq!(snapshot[0].job_name, "B");
    assert_eq!(snapshot[0].start, -1.0);
    assert_eq!(snapshot[1].job_name, "A");
    assert_eq!(snapshot[1].start, 0.0);

    expect_done(&mut rx_a, "A").await;
    assert!((clock.now() - 10.0).abs() < 0.01);
    assert_eq!(a.state(), CompoundJobState::Done);

    // B starts only once A has released the cluster.
    expect_done(&mut rx_b, "B").await;
    assert!((clock.now() - 20.0).abs() < 0.01);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn conservative_backfilling_compacts_on_early_completion() {
    let clock = SimClock::new();
    let service = BatchComputeService::start(
        "batch",
        nodes(4, 1),
        &clock,
        config(BatchSchedulingAlgorithm::ConservativeBf),
    )
    .unwrap();

    // A holds the whole cluster until its walltime of 10, but actually
    // finishes at 8.
    let (a, mut rx_a) = sleep_job("A", 8.0);
    let (b, mut rx_b) = sleep_job("B", 100.0);
    let (c, mut rx_c) = sleep_job("C", 5.0);

    service.submit_compound_job(&a, &args(4, 1, 10)).await.unwrap();
    clock.sleep(1.0).await;
    service.submit_compound_job(&b, &args(1, 1, 100)).await.unwrap();
    clock.sleep(1.0).await;
    service.submit_compound_job(&c, &args(3, 1, 5)).await.unwrap();

    expect_done(&mut rx_a, "A").await;
    assert!((clock.now() - 8.0).abs() < 0.01);

    // After compaction, B and C both started at t=8.
    clock.sleep(1.0).await;
    assert_eq!(snapshot_entry(&service, "B").await.start, 8.0);
    assert_eq!(snapshot_entry(&service, "C").await.start, 8.0);

    expect_done(&mut rx_c, "C").await;
    assert!((clock.now() - 13.0).abs() < 0.01);
    expect_done(&mut rx_b, "B").await;
    assert!((clock.now() - 108.0).abs() < 0.01);
}

/// Sets up the shadow topology: A holds 3 of 4 nodes until t=10, B needs
/// all 4 nodes (the shadow job), C fits in the free node but runs past the
/// shadow time.
async fn submit_shadow_topology(
    clock: &SimClock,
    service: &BatchServiceHandle,
) -> Arc<CompoundJob> {
    let (a, _rx_a) = sleep_job("A", 10.0);
    let (b, _rx_b) = sleep_job("B", 100.0);
    let (c, _rx_c) = sleep_job("C", 50.0);

    service.submit_compound_job(&a, &args(3, 1, 10)).await.unwrap();
    clock.sleep(1.0).await;
    service.submit_compound_job(&b, &args(4, 1, 100)).await.unwrap();
    clock.sleep(1.0).await;
    service.submit_compound_job(&c, &args(1, 1, 50)).await.unwrap();
    c
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn easy_backfilling_depth_one_refuses_harmful_backfill() {
    let clock = SimClock::new();
    let service = BatchComputeService::start(
        "batch",
        nodes(4, 1),
        &clock,
        config(BatchSchedulingAlgorithm::EasyBfDepth1),
    )
    .unwrap();

    submit_shadow_topology(&clock, &service).await;

    // C would push B's shadow time, so depth 1 holds it back.
    clock.sleep(3.0).await;
    assert_eq!(snapshot_entry(&service, "C").await.start, -1.0);
    assert_eq!(snapshot_entry(&service, "B").await.start, -1.0);

    service.stop(false, TerminationCause::ServiceTerminated).await.unwrap();
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn easy_backfilling_depth_zero_backfills_anyway() {
    let clock = SimClock::new();
    let service = BatchComputeService::start(
        "batch",
        nodes(4, 1),
        &clock,
        config(BatchSchedulingAlgorithm::EasyBfDepth0),
    )
    .unwrap();

    submit_shadow_topology(&clock, &service).await;

    // Depth 0 skips the shadow check: C starts as soon as it fits.
    clock.sleep(3.0).await;
    assert_eq!(snapshot_entry(&service, "C").await.start, 2.0);
    assert_eq!(snapshot_entry(&service, "B").await.start, -1.0);

    service.stop(false, TerminationCause::ServiceTerminated).await.unwrap();
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn core_level_reservations_share_nodes() {
    let clock = SimClock::new();
    let service = BatchComputeService::start(
        "batch",
        nodes(2, 4),
        &clock,
        config(BatchSchedulingAlgorithm::ConservativeBfCoreLevel),
    )
    .unwrap();

    // Two 2-core-per-node jobs fit side by side on the same nodes.
    let (a, mut rx_a) = sleep_job("A", 10.0);
    let (b, mut rx_b) = sleep_job("B", 10.0);
    service.submit_compound_job(&a, &args(2, 2, 10)).await.unwrap();
    service.submit_compound_job(&b, &args(2, 2, 10)).await.unwrap();

    clock.sleep(1.0).await;
    assert_eq!(snapshot_entry(&service, "A").await.start, 0.0);
    assert_eq!(snapshot_entry(&service, "B").await.start, 0.0);

    expect_done(&mut rx_a, "A").await;
    expect_done(&mut rx_b, "B").await;
    assert!((clock.now() - 10.0).abs() < 0.01);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn admission_errors_are_synchronous() {
    let clock = SimClock::new();
    let service = BatchComputeService::start(
        "batch",
        nodes(2, 4),
        &clock,
        config(BatchSchedulingAlgorithm::Fcfs),
    )
    .unwrap();

    let (job, _rx) = sleep_job("J", 1.0);

    // Missing and malformed required arguments.
    let mut missing = args(1, 1, 10);
    missing.remove("-t");
    assert!(matches!(
        service.submit_compound_job(&job, &missing).await,
        Err(Error::InvalidArgument(_))
    ));
    assert!(matches!(
        service.submit_compound_job(&job, &args(1, 0, 10)).await,
        Err(Error::InvalidArgument(_))
    ));

    // Unknown keys must name an action of the job.
    let mut unknown = args(1, 1, 10);
    unknown.insert("-x".to_string(), "1".to_string());
    assert!(matches!(
        service.submit_compound_job(&job, &unknown).await,
        Err(Error::InvalidArgument(_))
    ));
    let mut action_key = args(1, 1, 10);
    action_key.insert("work".to_string(), "whatever".to_string());
    service.submit_compound_job(&job, &action_key).await.unwrap();

    // Requests beyond the cluster's shape.
    let (big, _rx) = sleep_job("big", 1.0);
    assert!(matches!(
        service.submit_compound_job(&big, &args(3, 1, 10)).await,
        Err(Error::NotEnoughResources { .. })
    ));
    assert!(matches!(
        service.submit_compound_job(&big, &args(1, 5, 10)).await,
        Err(Error::NotEnoughResources { .. })
    ));

    // A job whose actions need more cores than requested.
    let wide = CompoundJob::new("wide");
    wide.add_compute_action("work", 1e9, 4, 0);
    assert!(matches!(
        service.submit_compound_job(&wide, &args(1, 2, 10)).await,
        Err(Error::NotEnoughResources { .. })
    ));

    // A job whose actions need more RAM than a node has.
    let hungry = CompoundJob::new("hungry");
    hungry.add_compute_action("work", 1e9, 1, 32 * GB);
    assert!(matches!(
        service.submit_compound_job(&hungry, &args(1, 1, 10)).await,
        Err(Error::NotEnoughResources { .. })
    ));

    // None of the rejected jobs entered the queue.
    let snapshot = service.queue().await.unwrap();
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0].job_name, "J");
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn padding_extends_the_walltime() {
    let clock = SimClock::new();
    let service = BatchComputeService::start(
        "batch",
        nodes(1, 1),
        &clock,
        BatchServiceConfig {
            rjms_padding_delay_seconds: 3,
            ..config(BatchSchedulingAlgorithm::Fcfs)
        },
    )
    .unwrap();

    // The action overruns its requested walltime of 1 second; the padded
    // alarm fires at start + 1 + 3.
    let (job, mut rx) = sleep_job("J", 100.0);
    service.submit_compound_job(&job, &args(1, 1, 1)).await.unwrap();

    clock.sleep(0.5).await;
    assert_eq!(snapshot_entry(&service, "J").await.walltime, 4);

    match rx.recv().await.unwrap() {
        JobEvent::Failed { cause, .. } => {
            assert_eq!(cause, Error::JobTimeout {
                job: "J".to_string()
            });
        }
        event => panic!("expected a failure notification, got {event:?}"),
    }
    assert!((clock.now() - 4.0).abs() < 0.01);
    assert_eq!(job.state(), CompoundJobState::Failed);
    assert_eq!(
        job.actions()[0].failure_cause(),
        Some(Error::JobTimeout {
            job: "J".to_string()
        })
    );
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn termination_of_pending_and_running_jobs() {
    let clock = SimClock::new();
    let service = BatchComputeService::start(
        "batch",
        nodes(1, 1),
        &clock,
        config(BatchSchedulingAlgorithm::Fcfs),
    )
    .unwrap();

    let (a, mut rx_a) = sleep_job("A", 100.0);
    let (b, _rx_b) = sleep_job("B", 100.0);
    service.submit_compound_job(&a, &args(1, 1, 200)).await.unwrap();
    service.submit_compound_job(&b, &args(1, 1, 200)).await.unwrap();

    clock.sleep(5.0).await;

    // B is pending; termination erases it from the queue.
    service.terminate_compound_job(&b).await.unwrap();
    assert_eq!(b.state(), CompoundJobState::Failed);
    assert_eq!(service.queue().await.unwrap().len(), 1);

    // A is running; termination stops its executor without a notification.
    service.terminate_compound_job(&a).await.unwrap();
    assert_eq!(a.state(), CompoundJobState::Failed);
    assert_eq!(
        a.actions()[0].failure_cause(),
        Some(Error::JobKilled {
            job: "A".to_string()
        })
    );
    assert!(rx_a.try_recv().is_err());
    assert_eq!(service.queue().await.unwrap().len(), 0);

    // Terminating a job the service does not know is refused.
    let (unknown, _rx) = sleep_job("unknown", 1.0);
    assert!(matches!(
        service.terminate_compound_job(&unknown).await,
        Err(Error::NotAllowed { .. })
    ));

    // The freed node is usable again.
    let (c, mut rx_c) = sleep_job("C", 1.0);
    service.submit_compound_job(&c, &args(1, 1, 10)).await.unwrap();
    expect_done(&mut rx_c, "C").await;
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn stopping_the_service_fails_all_jobs() {
    let clock = SimClock::new();
    let service = BatchComputeService::start(
        "batch",
        nodes(1, 1),
        &clock,
        config(BatchSchedulingAlgorithm::Fcfs),
    )
    .unwrap();

    let (a, mut rx_a) = sleep_job("A", 100.0);
    let (b, mut rx_b) = sleep_job("B", 100.0);
    service.submit_compound_job(&a, &args(1, 1, 200)).await.unwrap();
    service.submit_compound_job(&b, &args(1, 1, 200)).await.unwrap();

    clock.sleep(1.0).await;
    service
        .stop(true, TerminationCause::ServiceTerminated)
        .await
        .unwrap();

    for rx in [&mut rx_a, &mut rx_b] {
        match rx.recv().await.unwrap() {
            JobEvent::Failed { cause, .. } => {
                assert_eq!(cause, Error::ServiceIsDown {
                    service: "batch".to_string()
                });
            }
            event => panic!("expected a failure notification, got {event:?}"),
        }
    }

    // The service is gone.
    let (c, _rx_c) = sleep_job("C", 1.0);
    assert!(matches!(
        service.submit_compound_job(&c, &args(1, 1, 10)).await,
        Err(Error::ServiceIsDown { .. })
    ));
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn resource_information_tracks_the_cluster() {
    let clock = SimClock::new();
    let service = BatchComputeService::start(
        "batch",
        nodes(2, 4),
        &clock,
        config(BatchSchedulingAlgorithm::Fcfs),
    )
    .unwrap();

    let (a, _rx_a) = sleep_job("A", 50.0);
    service.submit_compound_job(&a, &args(1, 4, 100)).await.unwrap();
    clock.sleep(1.0).await;

    let hosts = service.resource_information("num_hosts").await.unwrap();
    assert_eq!(hosts["batch"], 2.0);

    let idle = service.resource_information("num_idle_cores").await.unwrap();
    assert_eq!(idle["node0"], 0.0);
    assert_eq!(idle["node1"], 4.0);

    let ram = service
        .resource_information("ram_availabilities")
        .await
        .unwrap();
    assert_eq!(ram["node0"], 0.0);
    assert_eq!(ram["node1"], (16 * GB) as f64);

    assert!(matches!(
        service.resource_information("flux_capacitance").await,
        Err(Error::InvalidArgument(_))
    ));
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn start_time_estimates_follow_the_reservations() {
    let clock = SimClock::new();
    let service = BatchComputeService::start(
        "batch",
        nodes(4, 1),
        &clock,
        config(BatchSchedulingAlgorithm::ConservativeBf),
    )
    .unwrap();

    let (a, _rx_a) = sleep_job("A", 10.0);
    service.submit_compound_job(&a, &args(4, 1, 10)).await.unwrap();

    let estimates = service
        .start_time_estimates(vec![
            StartTimeEstimateSpec {
                id: "later".to_string(),
                num_nodes: 2,
                cores_per_node: 1,
                duration: 5,
            },
            StartTimeEstimateSpec {
                id: "never".to_string(),
                num_nodes: 5,
                cores_per_node: 1,
                duration: 5,
            },
        ])
        .await
        .unwrap();

    assert_eq!(estimates["later"], 10.0);
    assert_eq!(estimates["never"], -1.0);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn estimates_are_not_available_from_fcfs() {
    let clock = SimClock::new();
    let service = BatchComputeService::start(
        "batch",
        nodes(2, 4),
        &clock,
        config(BatchSchedulingAlgorithm::Fcfs),
    )
    .unwrap();

    assert_eq!(
        service.start_time_estimates(Vec::new()).await,
        Err(Error::FunctionalityNotAvailable {
            service: "batch".to_string(),
            what: "start time estimates".to_string()
        })
    );
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn round_robin_host_selection_spreads_jobs() {
    let clock = SimClock::new();
    let service = BatchComputeService::start(
        "batch",
        nodes(3, 4),
        &clock,
        BatchServiceConfig {
            host_selection_algorithm: gantry_engine::config::HostSelectionAlgorithm::RoundRobin,
            ..config(BatchSchedulingAlgorithm::Fcfs)
        },
    )
    .unwrap();

    // Three one-core jobs land on three different nodes instead of piling
    // onto the first.
    for name in ["A", "B", "C"] {
        let (job, _rx) = sleep_job(name, 50.0);
        service.submit_compound_job(&job, &args(1, 1, 100)).await.unwrap();
    }

    clock.sleep(1.0).await;
    let idle = service.resource_information("num_idle_cores").await.unwrap();
    assert_eq!(idle["node0"], 3.0);
    assert_eq!(idle["node1"], 3.0);
    assert_eq!(idle["node2"], 3.0);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn workload_traces_are_replayed() {
    let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
    write!(
        file,
        r#"{{
            "jobs": [
                {{ "id": 1, "submit_time": 5.0, "runtime": 3.0, "requested_nodes": 1 }},
                {{ "id": 2, "submit_time": 6.0, "runtime": 3.0, "requested_nodes": 2 }}
            ]
        }}"#
    )
    .unwrap();

    let clock = SimClock::new();
    let service = BatchComputeService::start(
        "batch",
        nodes(2, 4),
        &clock,
        BatchServiceConfig {
            workload_trace_file: Some(file.path().to_path_buf()),
            simulate_computation_as_sleep: true,
            ..config(BatchSchedulingAlgorithm::Fcfs)
        },
    )
    .unwrap();

    // Job 1 submits at t=5 and runs on one node; job 2 needs both nodes and
    // waits for it.
    clock.sleep(6.5).await;
    assert_eq!(snapshot_entry(&service, "trace_job_1").await.start, 5.0);
    assert_eq!(snapshot_entry(&service, "trace_job_2").await.start, -1.0);

    // Everything has drained by t=12 (job 2 runs over [8, 11)).
    clock.sleep(6.0).await;
    assert_eq!(service.queue().await.unwrap().len(), 0);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn invalid_traces_abort_construction_unless_ignored() {
    let mut file = tempfile::Builder::new().suffix(".swf").tempfile().unwrap();
    writeln!(file, "1 0 5 100 0 -1 -1 0 120 -1 1 -1 -1 -1 -1 -1 -1 -1").unwrap();

    let clock = SimClock::new();
    let strict = BatchServiceConfig {
        workload_trace_file: Some(file.path().to_path_buf()),
        ignore_invalid_trace_jobs: false,
        ..config(BatchSchedulingAlgorithm::Fcfs)
    };
    assert!(matches!(
        BatchComputeService::start("batch", nodes(2, 4), &clock, strict),
        Err(Error::InvalidArgument(_))
    ));

    let lenient = BatchServiceConfig {
        workload_trace_file: Some(file.path().to_path_buf()),
        ignore_invalid_trace_jobs: true,
        ..config(BatchSchedulingAlgorithm::Fcfs)
    };
    BatchComputeService::start("batch", nodes(2, 4), &clock, lenient).unwrap();
}
