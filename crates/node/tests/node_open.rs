mod common;

use common::{mine, Parent};
use stakd::settings::{parse_args_from, CliAction, Settings};
use stakd::Node;

fn regtest_settings(dir: &std::path::Path) -> Settings {
    let args = vec![format!("-datadir={}", dir.display()), "-regtest".to_string()];
    match parse_args_from(args).expect("args") {
        CliAction::Run(settings) => settings,
        _ => panic!("expected run"),
    }
}

#[test]
fn chain_survives_close_and_reopen() {
    let dir = tempfile::tempdir().expect("tempdir");
    let settings = regtest_settings(dir.path());
    let params = settings.chain_params();

    let node = Node::open(&settings).expect("open");
    assert!(Node::open(&settings).is_err(), "data dir must be locked");

    let chain = node.context.chain();
    let mut parent = Parent {
        hash: chain.genesis_hash(),
        height: 0,
        time: params.genesis.time,
    };
    let mut last = None;
    for _ in 0..3 {
        let block = mine(&params, parent, 1, Vec::new());
        node.context.process_block(&block).expect("block");
        parent = Parent::of(&block, parent.height + 1);
        last = Some(block.hash());
    }
    node.close().expect("close");

    let reopened = Node::open(&settings).expect("reopen");
    let tip = reopened
        .context
        .chain()
        .tip()
        .expect("tip")
        .expect("active chain");
    assert_eq!(tip.height, 3);
    assert_eq!(Some(tip.hash), last);
    reopened.close().expect("close again");
}
