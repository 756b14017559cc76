use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use sea_orm::{DatabaseConnection, DbErr, SqlErr};

use crate::{
    EngineError, ResultEngine,
    auth::Principal,
    clock::{Clock, SystemClock},
    codes::CodeHasher,
    commands::PendingSpec,
    eligibility::EligibilityPolicy,
    gateway::{ChargeGateway, PassThroughChargeGateway},
    planner::PlanContext,
    rules::{ExpressionRuleEvaluator, RuleEvaluator},
};

mod execute;
mod resolve;
mod sweeper;
mod transactions;
mod values;

pub use resolve::ResolveOptions;
pub use sweeper::SweepBatchReport;
pub use transactions::{ReportRow, TransactionListFilter};

/// Run a block inside a DB transaction, committing on success and rolling back on error.
macro_rules! with_tx {
    ($self:expr, |$tx:ident| $body:expr) => {{
        let $tx = $self.database.begin().await?;
        let result = $body;
        match result {
            Ok(value) => {
                $tx.commit().await?;
                Ok(value)
            }
            Err(err) => Err(err),
        }
    }};
}

pub(crate) use with_tx;

/// How long pending transactions hold their amounts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PendingConfig {
    /// Used for `pending: true`.
    pub default_window: Duration,
    /// Explicit void dates further out than this are rejected.
    pub max_window: Duration,
}

impl Default for PendingConfig {
    fn default() -> Self {
        Self {
            default_window: Duration::days(7),
            max_window: Duration::days(14),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SweeperConfig {
    pub batch_size: u64,
    /// A batch stops once less than this is left before the deadline.
    pub safety_margin: Duration,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            batch_size: 500,
            safety_margin: Duration::seconds(10),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EngineConfig {
    pub eligibility: EligibilityPolicy,
    pub pending: PendingConfig,
    pub sweeper: SweeperConfig,
}

#[derive(Debug)]
pub struct Engine {
    database: DatabaseConnection,
    evaluator: Arc<dyn RuleEvaluator>,
    gateway: Arc<dyn ChargeGateway>,
    clock: Arc<dyn Clock>,
    code_hasher: CodeHasher,
    config: EngineConfig,
}

impl Engine {
    /// Return a builder for `Engine`. Help to build the struct.
    pub fn builder() -> EngineBuilder {
        EngineBuilder::default()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    fn plan_context<'a>(
        &'a self,
        principal: &'a Principal,
        transaction_id: &'a str,
        request_hash: &'a str,
        metadata: Option<&'a serde_json::Value>,
        now: DateTime<Utc>,
    ) -> PlanContext<'a> {
        PlanContext {
            transaction_id,
            request_hash,
            now,
            created_by: &principal.user_id,
            metadata,
            evaluator: self.evaluator.as_ref(),
            policy: self.config.eligibility,
        }
    }

    /// Void date for a request that asked to be pending.
    fn pending_void_date(
        &self,
        pending: Option<PendingSpec>,
        now: DateTime<Utc>,
    ) -> ResultEngine<Option<DateTime<Utc>>> {
        match pending {
            None | Some(PendingSpec::Flag(false)) => Ok(None),
            Some(PendingSpec::Flag(true)) => Ok(Some(now + self.config.pending.default_window)),
            Some(PendingSpec::Until(at)) => {
                if at <= now {
                    return Err(EngineError::InvalidRequest(
                        "pending void date must be in the future".to_string(),
                    ));
                }
                if at > now + self.config.pending.max_window {
                    return Err(EngineError::InvalidRequest(format!(
                        "pending void date must be within {} days",
                        self.config.pending.max_window.num_days()
                    )));
                }
                Ok(Some(at))
            }
        }
    }
}

/// Message of a unique or primary key violation, if `err` is one.
pub(crate) fn unique_violation(err: &DbErr) -> Option<String> {
    match err.sql_err() {
        Some(SqlErr::UniqueConstraintViolation(message)) => Some(message),
        _ => None,
    }
}

/// The builder for `Engine`
#[derive(Default)]
pub struct EngineBuilder {
    database: DatabaseConnection,
    evaluator: Option<Arc<dyn RuleEvaluator>>,
    gateway: Option<Arc<dyn ChargeGateway>>,
    clock: Option<Arc<dyn Clock>>,
    code_hasher: Option<CodeHasher>,
    config: EngineConfig,
}

impl EngineBuilder {
    /// Pass the required database
    pub fn database(mut self, db: DatabaseConnection) -> EngineBuilder {
        self.database = db;
        self
    }

    pub fn evaluator(mut self, evaluator: Arc<dyn RuleEvaluator>) -> EngineBuilder {
        self.evaluator = Some(evaluator);
        self
    }

    pub fn gateway(mut self, gateway: Arc<dyn ChargeGateway>) -> EngineBuilder {
        self.gateway = Some(gateway);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> EngineBuilder {
        self.clock = Some(clock);
        self
    }

    /// Secret keying code lookup hashes.
    pub fn code_secret(mut self, secret: impl AsRef<[u8]>) -> EngineBuilder {
        self.code_hasher = Some(CodeHasher::new(secret));
        self
    }

    pub fn config(mut self, config: EngineConfig) -> EngineBuilder {
        self.config = config;
        self
    }

    /// Construct `Engine`
    pub async fn build(self) -> ResultEngine<Engine> {
        if self.config.pending.default_window > self.config.pending.max_window {
            return Err(EngineError::InvalidRequest(
                "default pending window exceeds the maximum".to_string(),
            ));
        }
        if self.config.sweeper.batch_size == 0 {
            return Err(EngineError::InvalidRequest(
                "sweeper batch size must be > 0".to_string(),
            ));
        }
        Ok(Engine {
            database: self.database,
            evaluator: self
                .evaluator
                .unwrap_or_else(|| Arc::new(ExpressionRuleEvaluator)),
            gateway: self
                .gateway
                .unwrap_or_else(|| Arc::new(PassThroughChargeGateway)),
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
            code_hasher: self.code_hasher.unwrap_or_default(),
            config: self.config,
        })
    }
}
