//! Checkout: paying for a cart from several sources.
//!
//! Allocation order:
//!
//! 1. pretax Values, in resolver order
//! 2. tax per line item on what is left of it
//! 3. post-tax Values, in resolver order
//! 4. internal sources, in request order
//! 5. card sources, in request order
//!
//! Each Value walks the line items in order. A balance rule is evaluated per
//! line item against the running line state, so a Value applied later sees
//! what earlier Values already took. Values that are not eligible are
//! skipped rather than failing the checkout.

use chrono::{DateTime, Utc};
use rust_decimal::{Decimal, RoundingStrategy, prelude::ToPrimitive};
use serde_json::json;

use crate::{
    EngineError, ResultEngine,
    commands::{CheckoutCmd, InternalParty, StripeParty},
    eligibility::{EligibilityCheck, is_eligible},
    plan::{ChargeOperation, PlanStep, StripePlanStep, TransactionPlan},
    rules::RuleContext,
    steps::InternalStep,
    transactions::{
        LineItem, LineTotal, MarketplaceTotals, TaxRoundingMode, TransactionTotals,
        TransactionType,
    },
    values::Value,
};

use super::{PlanContext, ResolvedParty, value_step};

#[derive(Clone, Debug)]
struct Line {
    item: LineItem,
    subtotal: i64,
    taxable: i64,
    tax: i64,
    discount: i64,
    remainder: i64,
    seller_discount: Decimal,
}

impl Line {
    fn new(item: &LineItem) -> ResultEngine<Self> {
        if item.unit_price < 0 {
            return Err(EngineError::InvalidRequest(
                "unitPrice must be >= 0".to_string(),
            ));
        }
        if item.quantity <= 0 {
            return Err(EngineError::InvalidRequest(
                "quantity must be > 0".to_string(),
            ));
        }
        if item.tax_rate.is_some_and(|r| r < Decimal::ZERO) {
            return Err(EngineError::InvalidRequest(
                "taxRate must be >= 0".to_string(),
            ));
        }
        if item
            .marketplace_rate
            .is_some_and(|r| r < Decimal::ZERO || r > Decimal::ONE)
        {
            return Err(EngineError::InvalidRequest(
                "marketplaceRate must be between 0 and 1".to_string(),
            ));
        }
        let subtotal = item
            .unit_price
            .checked_mul(item.quantity)
            .ok_or_else(|| EngineError::InvalidRequest("line item overflows".to_string()))?;
        Ok(Self {
            item: item.clone(),
            subtotal,
            taxable: 0,
            tax: 0,
            discount: 0,
            remainder: subtotal,
            seller_discount: Decimal::ZERO,
        })
    }

    fn line_total(&self) -> LineTotal {
        let marketplace = self.item.marketplace_rate.map(|rate| {
            let commission = round(Decimal::from(self.subtotal) * rate, TaxRoundingMode::HalfEven);
            let gross = self.subtotal - commission;
            let seller_discount = round(self.seller_discount, TaxRoundingMode::HalfEven);
            (gross, seller_discount, gross - seller_discount)
        });
        LineTotal {
            subtotal: self.subtotal,
            taxable: self.taxable,
            tax: self.tax,
            discount: self.discount,
            payable: self.subtotal + self.tax - self.discount,
            remainder: self.remainder,
            seller_gross: marketplace.map(|m| m.0),
            seller_discount: marketplace.map(|m| m.1),
            seller_net: marketplace.map(|m| m.2),
        }
    }

    fn snapshot(&self) -> LineItem {
        let mut item = self.item.clone();
        item.line_total = Some(self.line_total());
        item
    }
}

fn round(amount: Decimal, mode: TaxRoundingMode) -> i64 {
    let strategy = match mode {
        TaxRoundingMode::HalfEven => RoundingStrategy::MidpointNearestEven,
        TaxRoundingMode::HalfUp => RoundingStrategy::MidpointAwayFromZero,
    };
    amount
        .round_dp_with_strategy(0, strategy)
        .to_i64()
        .unwrap_or(i64::MAX)
}

#[derive(Debug, Default)]
struct Paid {
    discount: i64,
    lightrail: i64,
    stripe: i64,
    internal: i64,
}

struct Checkout<'c, 'a> {
    ctx: &'c PlanContext<'a>,
    cmd: &'c CheckoutCmd,
    lines: Vec<Line>,
    steps: Vec<PlanStep>,
    paid: Paid,
}

impl Checkout<'_, '_> {
    fn remainder(&self) -> i64 {
        self.lines.iter().map(|l| l.remainder).sum()
    }

    fn rule_context(&self, index: usize, balance_change: i64, value: &Value) -> RuleContext {
        let items: Vec<LineItem> = self.lines.iter().map(Line::snapshot).collect();
        let current = serde_json::to_value(&items[index]).unwrap_or_default();
        let line_items = serde_json::to_value(&items).unwrap_or_default();
        let totals = json!({
            "subtotal": self.lines.iter().map(|l| l.subtotal).sum::<i64>(),
            "tax": self.lines.iter().map(|l| l.tax).sum::<i64>(),
            "discount": self.lines.iter().map(|l| l.discount).sum::<i64>(),
            "remainder": self.remainder(),
        });
        RuleContext::new(
            current,
            line_items,
            totals,
            balance_change,
            value.metadata.as_ref(),
            self.cmd.metadata.as_ref(),
        )
    }

    fn apply_value(&mut self, value: &Value) -> ResultEngine<()> {
        let check = EligibilityCheck::state(self.ctx.now, &self.cmd.currency, self.ctx.policy)
            .uses_draw(1);
        if let Err(ineligible) = is_eligible(value, &check) {
            tracing::debug!(value_id = %value.id, reason = ?ineligible.reason, "skipping value in checkout");
            return Ok(());
        }

        let mut available = value.balance;
        let mut drawn = 0_i64;
        let contributes = value.balance.is_some() || value.balance_rule.is_some();

        for index in 0..self.lines.len() {
            if !contributes || self.lines[index].remainder == 0 {
                continue;
            }
            let needs_context = value.redemption_rule.is_some() || value.balance_rule.is_some();
            let context = needs_context.then(|| self.rule_context(index, -drawn, value));

            if let (Some(rule), Some(context)) = (&value.redemption_rule, &context)
                && !self.ctx.evaluator.evaluate_redeemable(rule, context)?
            {
                continue;
            }

            let line_remainder = self.lines[index].remainder;
            let amount = match (&value.balance_rule, &context) {
                (Some(rule), Some(context)) => self
                    .ctx
                    .evaluator
                    .evaluate_balance(rule, context)?
                    .min(line_remainder),
                _ => available.unwrap_or(0).min(line_remainder),
            };
            if amount <= 0 {
                continue;
            }

            let line = &mut self.lines[index];
            line.remainder -= amount;
            if value.discount {
                line.discount += amount;
                line.seller_discount += Decimal::from(amount)
                    * value.discount_seller_liability.unwrap_or(Decimal::ZERO);
            }
            if let Some(left) = available.as_mut() {
                *left -= amount;
            }
            drawn += amount;
        }

        if drawn == 0 && !self.cmd.include_zero_balance {
            return Ok(());
        }
        let uses_change = (drawn > 0).then_some(-1);
        self.steps
            .push(PlanStep::Lightrail(value_step(value, Some(-drawn), uses_change)));
        if value.discount {
            self.paid.discount += drawn;
        } else {
            self.paid.lightrail += drawn;
        }
        Ok(())
    }

    fn apply_tax(&mut self) {
        let mode = self.cmd.tax.unwrap_or_default().rounding_mode;
        for line in &mut self.lines {
            line.taxable = line.remainder;
            line.tax = line
                .item
                .tax_rate
                .map_or(0, |rate| round(Decimal::from(line.taxable) * rate, mode));
            line.remainder += line.tax;
        }
    }

    /// Takes up to `amount` from the line remainders in order.
    fn draw(&mut self, amount: i64) -> i64 {
        let mut left = amount;
        for line in &mut self.lines {
            let take = left.min(line.remainder);
            line.remainder -= take;
            left -= take;
        }
        amount - left
    }

    fn apply_internal(&mut self, internal: &InternalParty) {
        let drawn = self.draw(internal.balance.max(0));
        if drawn == 0 && !self.cmd.include_zero_balance {
            return;
        }
        self.paid.internal += drawn;
        self.steps.push(PlanStep::Internal(InternalStep {
            internal_id: internal.internal_id.clone(),
            balance_before: internal.balance,
            balance_after: internal.balance - drawn,
            balance_change: -drawn,
        }));
    }

    fn apply_card(&mut self, card: &StripeParty, pending: bool) {
        let wanted = card
            .max_amount
            .map_or(self.remainder(), |cap| cap.min(self.remainder()));
        let drawn = self.draw(wanted.max(0));
        if drawn == 0 {
            return;
        }
        self.paid.stripe += drawn;
        self.steps.push(PlanStep::Stripe(StripePlanStep {
            operation: ChargeOperation::Charge {
                source: card.source.clone(),
                pending,
            },
            amount: drawn,
        }));
    }
}

/// Plans a checkout of `cmd.line_items` against `parties`.
///
/// Lightrail parties must already be deduplicated and in resolver order.
pub fn plan_checkout(
    ctx: &PlanContext<'_>,
    cmd: &CheckoutCmd,
    parties: &[ResolvedParty],
    pending_void_date: Option<DateTime<Utc>>,
) -> ResultEngine<TransactionPlan> {
    if cmd.line_items.is_empty() {
        return Err(EngineError::InvalidRequest(
            "checkout needs at least one line item".to_string(),
        ));
    }
    let lines = cmd
        .line_items
        .iter()
        .map(Line::new)
        .collect::<ResultEngine<Vec<_>>>()?;

    let mut checkout = Checkout {
        ctx,
        cmd,
        lines,
        steps: Vec::new(),
        paid: Paid::default(),
    };

    let values: Vec<&Value> = parties
        .iter()
        .filter_map(|p| match p {
            ResolvedParty::Lightrail(value) => Some(value),
            _ => None,
        })
        .collect();

    for value in values.iter().filter(|v| v.pretax) {
        checkout.apply_value(value)?;
    }
    checkout.apply_tax();
    for value in values.iter().filter(|v| !v.pretax) {
        checkout.apply_value(value)?;
    }
    for party in parties {
        if let ResolvedParty::Internal(internal) = party {
            checkout.apply_internal(internal);
        }
    }
    for party in parties {
        if let ResolvedParty::Stripe(card) = party {
            checkout.apply_card(card, pending_void_date.is_some());
        }
    }

    let remainder = checkout.remainder();
    if remainder > 0 && !cmd.allow_remainder {
        return Err(EngineError::InsufficientBalance(format!(
            "checkout {} is short by {remainder}",
            ctx.transaction_id
        )));
    }

    let line_items: Vec<LineItem> = checkout.lines.iter().map(Line::snapshot).collect();
    let subtotal: i64 = checkout.lines.iter().map(|l| l.subtotal).sum();
    let tax: i64 = checkout.lines.iter().map(|l| l.tax).sum();
    let marketplace = checkout
        .lines
        .iter()
        .any(|l| l.item.marketplace_rate.is_some())
        .then(|| {
            line_items
                .iter()
                .filter_map(|i| i.line_total.as_ref())
                .fold(MarketplaceTotals::default(), |mut acc, t| {
                    acc.seller_gross += t.seller_gross.unwrap_or(t.subtotal);
                    acc.seller_discount += t.seller_discount.unwrap_or(0);
                    acc.seller_net += t.seller_net.unwrap_or(t.subtotal);
                    acc
                })
        });
    let paid = &checkout.paid;
    let totals = TransactionTotals {
        subtotal: Some(subtotal),
        tax: Some(tax),
        discount: Some(paid.discount),
        discount_lightrail: Some(paid.discount),
        payable: Some(subtotal + tax - paid.discount),
        paid_lightrail: Some(paid.lightrail),
        paid_stripe: Some(paid.stripe),
        paid_internal: Some(paid.internal),
        remainder: Some(remainder),
        marketplace,
    };

    let mut plan = ctx.plan(TransactionType::Checkout, &cmd.currency);
    plan.steps = checkout.steps;
    plan.totals = Some(totals);
    plan.line_items = Some(line_items);
    plan.payment_sources = Some(cmd.sources.clone());
    plan.tax = Some(cmd.tax.unwrap_or_default());
    plan.pending_void_date = pending_void_date;
    Ok(plan)
}
