// Trade lifecycle core: ledger, allocation, exits and fees
pub mod candle_buffer;
pub mod exit;
pub mod fees;
pub mod ledger;
pub mod order;
pub mod pair_locks;
pub mod trade;
pub mod wallet;

pub use candle_buffer::CandleBuffer;
pub use exit::{ExitContext, ExitDecision, ExitEvaluator, ExitRules, RoiTable};
pub use fees::{reconcile_fill, reconcile_order_fees, ExecutionRecord, FeeAdjustment};
pub use ledger::Ledger;
pub use order::{Fill, Order};
pub use pair_locks::{PairLock, PairLocks};
pub use trade::Trade;
pub use wallet::{
    available_stake, min_pair_stake, trade_stake_amount, validate_stake_amount, Balance,
    StakeConfig, Wallet,
};
