//! Stored-value ledger engine.
//!
//! Values hold a balance and/or a number of uses in a currency. Every change
//! to a Value is a [`Transaction`] made of steps: the engine resolves the
//! parties of a request, plans the steps with the pure functions in
//! [`planner`], and commits the plan atomically and idempotently.
//!
//! ```text
//! request -> replay check -> resolve parties -> plan -> (simulate | execute)
//! ```

pub use auth::Principal;
pub use clock::{Clock, Deadline, ManualClock, SystemClock};
pub use commands::{
    AttachCmd, CaptureCmd, ChainCmd, CheckoutCmd, CreateValueCmd, CreditCmd, DebitCmd,
    InternalParty, LightrailParty, Party, PendingSpec, ReverseCmd, StripeParty, TransferCmd,
    UpdateValueCmd, VoidCmd,
};
pub use currency::Currency;
pub use error::EngineError;
pub use gateway::{ChargeGateway, ChargeRequest, ChargeResult, PassThroughChargeGateway};
pub use ops::{
    Engine, EngineBuilder, EngineConfig, PendingConfig, ReportRow, ResolveOptions,
    SweepBatchReport, SweeperConfig, TransactionListFilter,
};
pub use rules::{ExpressionRuleEvaluator, Rule, RuleEvaluator};
pub use steps::{InternalStep, LightrailStep, StripeStep, TransactionStep};
pub use transactions::{
    LineItem, TaxOptions, TaxRoundingMode, Transaction, TransactionTotals, TransactionType,
};
pub use values::{GenericCodeOptions, PerContactOptions, Value};

pub mod auth;
pub mod clock;
pub mod codes;
pub mod commands;
pub mod contact_values;
pub mod contacts;
pub mod currency;
pub mod eligibility;
mod error;
pub mod gateway;
mod ops;
pub mod plan;
pub mod planner;
pub mod rules;
pub mod steps;
pub mod transactions;
pub mod values;

pub type ResultEngine<T> = Result<T, EngineError>;
