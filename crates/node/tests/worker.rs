mod common;

use std::time::{Duration, Instant};

use common::{mine, standard_policy, Parent, TestNode};
use stakd::worker::ActivationWorker;

fn wait_for(what: &str, mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !done() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn worker_runs_on_wake_and_stops() {
    let node = TestNode::new(standard_policy());
    let mut worker = ActivationWorker::spawn(node.context.clone()).expect("spawn");
    wait_for("first cycle", || worker.cycles() >= 1);

    let before = worker.cycles();
    worker.wake();
    wait_for("woken cycle", || worker.cycles() > before);

    worker.stop();
    let stopped = worker.cycles();
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(worker.cycles(), stopped);
}

#[test]
fn worker_coexists_with_block_processing() {
    let node = TestNode::new(standard_policy());
    let worker = ActivationWorker::spawn(node.context.clone()).expect("spawn");

    let mut parent = node.genesis();
    for _ in 0..5 {
        let block = mine(&node.params, parent, 1, Vec::new());
        node.context.process_block(&block).expect("block");
        worker.wake();
        parent = Parent::of(&block, parent.height + 1);
    }
    assert_eq!(node.tip_height(), 5);
    drop(worker);
}
