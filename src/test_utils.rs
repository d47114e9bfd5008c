use crate::{Tx, TxCredit, TxRecord};

/// Runs `f` inside a transaction prepared with exactly `credit`.
pub(crate) fn transact<R>(credit: TxCredit, f: impl FnOnce(&mut Tx) -> R) -> (R, TxRecord) {
    let mut tx = Tx::new();
    tx.prep(credit);
    tx.open();

    let result = f(&mut tx);

    (result, tx.close())
}
