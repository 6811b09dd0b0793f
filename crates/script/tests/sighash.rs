use stakd_primitives::outpoint::OutPoint;
use stakd_primitives::transaction::{Transaction, TxIn, TxOut};
use stakd_script::sighash::{
    signature_hash, SighashType, SIGHASH_ALL, SIGHASH_ANYONECANPAY, SIGHASH_NONE, SIGHASH_ONE,
    SIGHASH_SINGLE,
};

fn two_in_one_out() -> Transaction {
    Transaction {
        version: 1,
        vin: vec![
            TxIn::new(OutPoint::new([1u8; 32], 0), vec![0x51]),
            TxIn::new(OutPoint::new([2u8; 32], 1), vec![0x52]),
        ],
        vout: vec![TxOut::new(10_000, vec![0x51])],
        lock_time: 0,
    }
}

#[test]
fn sighash_type_flags() {
    let combined = SighashType(SIGHASH_ALL | SIGHASH_ANYONECANPAY);
    assert_eq!(combined.base_type(), SIGHASH_ALL);
    assert!(combined.has_anyone_can_pay());

    let none = SighashType(SIGHASH_NONE);
    assert_eq!(none.base_type(), SIGHASH_NONE);
    assert!(!none.has_anyone_can_pay());

    let single = SighashType(SIGHASH_SINGLE | SIGHASH_ANYONECANPAY);
    assert_eq!(single.base_type(), SIGHASH_SINGLE);
    assert!(single.has_anyone_can_pay());
}

#[test]
fn single_without_matching_output_signs_one() {
    let tx = two_in_one_out();
    let hash = signature_hash(&tx, 1, &[0x51], SighashType(SIGHASH_SINGLE)).expect("sighash");
    assert_eq!(hash, SIGHASH_ONE);
}

#[test]
fn all_commits_to_outputs_none_does_not() {
    let tx = two_in_one_out();
    let mut changed = tx.clone();
    changed.vout[0].value += 1;

    let all = SighashType(SIGHASH_ALL);
    assert_ne!(
        signature_hash(&tx, 0, &[0x51], all).expect("sighash"),
        signature_hash(&changed, 0, &[0x51], all).expect("sighash")
    );

    let none = SighashType(SIGHASH_NONE);
    assert_eq!(
        signature_hash(&tx, 0, &[0x51], none).expect("sighash"),
        signature_hash(&changed, 0, &[0x51], none).expect("sighash")
    );
}

#[test]
fn anyone_can_pay_ignores_other_inputs() {
    let tx = two_in_one_out();
    let mut changed = tx.clone();
    changed.vin[1].prevout.index = 9;
    let kind = SighashType(SIGHASH_ALL | SIGHASH_ANYONECANPAY);
    assert_eq!(
        signature_hash(&tx, 0, &[0x51], kind).expect("sighash"),
        signature_hash(&changed, 0, &[0x51], kind).expect("sighash")
    );
}

#[test]
fn input_index_out_of_range() {
    let tx = two_in_one_out();
    assert!(signature_hash(&tx, 2, &[], SighashType(SIGHASH_ALL)).is_err());
}
