//! All-or-nothing execution of multi-leg order groups.
//!
//! Every spread goes to the broker as a group: either all legs fill within
//! the group timeout or the group is rolled back — still-open legs are
//! cancelled and already-filled legs are flattened with market orders. Group
//! descriptors are persisted before the first order goes out so a crash
//! mid-group can be reconciled on restart.

use crate::application::execution::pricing::smart_limit_price;
use crate::domain::errors::ExecutionError;
use crate::domain::market::bar_slice::BarSlice;
use crate::domain::market::instrument::Leg;
use crate::domain::ports::{EngineContext, OrderId, OrderState};
use crate::domain::trading::position::StrategyKind;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GroupStatus {
    Pending,
    Placing,
    Monitoring,
    Filled,
    Partial,
    Failed,
    RollingBack,
    RolledBack,
}

impl GroupStatus {
    /// A finished group is either fully filled or fully rolled back; no group
    /// ends its life partial.
    pub fn is_terminal(self) -> bool {
        matches!(self, GroupStatus::Filled | GroupStatus::RolledBack)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LegState {
    Unplaced,
    Working,
    Filled { avg_price: Decimal, quantity: i64 },
    Failed { reason: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupLeg {
    pub leg: Leg,
    pub order: Option<OrderId>,
    pub state: LegState,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderGroup {
    pub id: u64,
    pub strategy: StrategyKind,
    pub created_at: DateTime<Utc>,
    pub timeout_secs: u64,
    pub status: GroupStatus,
    pub legs: Vec<GroupLeg>,
    pub rollback_orders: Vec<OrderId>,
}

/// Persisted form (namespace `order_groups/<group_id>`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderGroupRecord {
    pub schema_version: u32,
    #[serde(flatten)]
    pub group: OrderGroup,
}

/// A successfully filled leg handed to the owning position.
#[derive(Debug, Clone)]
pub struct GroupFill {
    pub leg: Leg,
    pub avg_price: Decimal,
}

#[derive(Debug)]
pub enum ExecutionOutcome {
    Filled { group_id: u64, fills: Vec<GroupFill> },
    RolledBack { group_id: u64, reason: String },
}

impl ExecutionOutcome {
    pub fn group_id(&self) -> u64 {
        match self {
            ExecutionOutcome::Filled { group_id, .. }
            | ExecutionOutcome::RolledBack { group_id, .. } => *group_id,
        }
    }
}

fn group_key(id: u64) -> String {
    format!("order_groups/{id:010}")
}

pub struct AtomicExecutor {
    ctx: EngineContext,
    next_group_id: u64,
    completed: VecDeque<OrderGroup>,
    completed_cap: usize,
}

impl AtomicExecutor {
    pub fn new(ctx: EngineContext) -> Self {
        Self {
            ctx,
            next_group_id: 1,
            completed: VecDeque::new(),
            completed_cap: 256,
        }
    }

    pub fn completed_groups(&self) -> impl Iterator<Item = &OrderGroup> {
        self.completed.iter()
    }

    async fn persist(&self, group: &OrderGroup) -> Result<(), ExecutionError> {
        let record = OrderGroupRecord {
            schema_version: 1,
            group: group.clone(),
        };
        let value = serde_json::to_value(&record)
            .map_err(|e| ExecutionError::Broker(anyhow::anyhow!("serialize group: {e}")))?;
        self.ctx
            .store
            .put(&group_key(group.id), value)
            .await
            .map_err(ExecutionError::Broker)
    }

    fn retire(&mut self, group: OrderGroup) {
        if self.completed.len() == self.completed_cap {
            self.completed.pop_front();
        }
        self.completed.push_back(group);
    }

    /// Place a group of legs atomically. The monitoring loop polls the broker
    /// between cooperative suspension points until every leg terminates or
    /// the timeout elapses; any failed leg triggers rollback of the group.
    /// `force_market` skips smart limits for defensive flatten-now closes.
    pub async fn execute(
        &mut self,
        strategy: StrategyKind,
        legs: Vec<Leg>,
        slice: &BarSlice,
        timeout: Option<Duration>,
        force_market: bool,
    ) -> Result<ExecutionOutcome, ExecutionError> {
        if legs.is_empty() || legs.iter().any(|l| l.quantity == 0) {
            return Err(ExecutionError::OrderRejected {
                instrument: "-".to_string(),
                reason: "empty group or zero-quantity leg".to_string(),
            });
        }

        let timeout = timeout.unwrap_or(self.ctx.constants.order_group_timeout);
        let id = self.next_group_id;
        self.next_group_id += 1;

        let mut group = OrderGroup {
            id,
            strategy,
            created_at: self.ctx.clock.now(),
            timeout_secs: timeout.as_secs(),
            status: GroupStatus::Placing,
            legs: legs
                .into_iter()
                .map(|leg| GroupLeg {
                    leg,
                    order: None,
                    state: LegState::Unplaced,
                })
                .collect(),
            rollback_orders: Vec::new(),
        };

        // Durable descriptor goes down before the first order goes out.
        self.persist(&group).await?;
        info!(group = id, %strategy, legs = group.legs.len(), "placing atomic group");

        // Place every leg with its smart limit, falling back to market when
        // the quote is unusable.
        for i in 0..group.legs.len() {
            let leg = group.legs[i].leg.clone();
            let limit = if force_market {
                None
            } else {
                slice.bid_ask(&leg.instrument).and_then(|(bid, ask)| {
                    smart_limit_price(bid, ask, leg.is_buy(), leg.instrument.tick_size)
                })
            };
            match self.place_with_retry(&leg, limit).await {
                Ok(order) => {
                    debug!(group = id, order = %order, instrument = %leg.instrument,
                        qty = leg.quantity, ?limit, "leg placed");
                    group.legs[i].order = Some(order);
                    group.legs[i].state = LegState::Working;
                }
                Err(e) => {
                    error!(group = id, instrument = %leg.instrument, "leg placement failed: {e}");
                    group.legs[i].state = LegState::Failed {
                        reason: e.to_string(),
                    };
                    let reason = format!("placement failed for {}", leg.instrument);
                    self.rollback(&mut group, &reason).await;
                    self.persist(&group).await?;
                    let outcome = ExecutionOutcome::RolledBack {
                        group_id: id,
                        reason,
                    };
                    self.retire(group);
                    return Ok(outcome);
                }
            }
        }

        group.status = GroupStatus::Monitoring;
        self.persist(&group).await?;

        let outcome = self.monitor(&mut group, timeout).await;
        self.persist(&group).await?;
        self.retire(group);
        Ok(outcome)
    }

    /// Poll until every leg terminates. Filled-while-peer-failed and timeout
    /// both resolve through rollback.
    async fn monitor(&self, group: &mut OrderGroup, timeout: Duration) -> ExecutionOutcome {
        let started = tokio::time::Instant::now();

        loop {
            let mut any_failed = false;
            let mut all_terminal = true;

            for leg in group.legs.iter_mut() {
                if !matches!(leg.state, LegState::Working) {
                    continue;
                }
                let Some(order) = leg.order else { continue };
                match self.ctx.broker.query_order(order).await {
                    Ok(OrderState::Filled {
                        avg_price,
                        quantity,
                    }) => {
                        leg.state = LegState::Filled {
                            avg_price,
                            quantity,
                        };
                    }
                    Ok(OrderState::Canceled) => {
                        leg.state = LegState::Failed {
                            reason: "canceled".to_string(),
                        };
                        any_failed = true;
                    }
                    Ok(OrderState::Invalid) => {
                        leg.state = LegState::Failed {
                            reason: "invalid".to_string(),
                        };
                        any_failed = true;
                    }
                    Ok(OrderState::Submitted) | Ok(OrderState::PartiallyFilled { .. }) => {
                        all_terminal = false;
                    }
                    Err(e) => {
                        // Transient broker hiccup: keep polling, the timeout
                        // bounds us.
                        warn!(group = group.id, order = %order, "query failed: {e}");
                        all_terminal = false;
                    }
                }
            }

            if any_failed {
                group.status = GroupStatus::Partial;
                let reason = group
                    .legs
                    .iter()
                    .find_map(|l| match &l.state {
                        LegState::Failed { reason } => {
                            Some(format!("leg {} {}", l.leg.instrument, reason))
                        }
                        _ => None,
                    })
                    .unwrap_or_else(|| "leg failed".to_string());
                self.rollback(group, &reason).await;
                return ExecutionOutcome::RolledBack {
                    group_id: group.id,
                    reason,
                };
            }

            if all_terminal {
                group.status = GroupStatus::Filled;
                let fills = group
                    .legs
                    .iter()
                    .filter_map(|l| match l.state {
                        LegState::Filled { avg_price, .. } => Some(GroupFill {
                            leg: l.leg.clone(),
                            avg_price,
                        }),
                        _ => None,
                    })
                    .collect();
                info!(group = group.id, "all legs filled");
                return ExecutionOutcome::Filled {
                    group_id: group.id,
                    fills,
                };
            }

            if started.elapsed() >= timeout {
                let pending = group
                    .legs
                    .iter()
                    .filter(|l| matches!(l.state, LegState::Working))
                    .count();
                warn!(group = group.id, pending, "group timeout, rolling back");
                group.status = GroupStatus::Failed;
                let reason = format!("timeout with {pending} legs pending");
                self.rollback(group, &reason).await;
                return ExecutionOutcome::RolledBack {
                    group_id: group.id,
                    reason,
                };
            }

            tokio::time::sleep(self.ctx.constants.order_poll_interval).await;
        }
    }

    /// Cancel still-open orders, flatten filled legs with best-effort market
    /// orders, and mark the group rolled back. Idempotent: invoking it on a
    /// group already rolling back produces no additional orders.
    pub async fn rollback(&self, group: &mut OrderGroup, reason: &str) {
        if matches!(
            group.status,
            GroupStatus::RollingBack | GroupStatus::RolledBack
        ) {
            return;
        }
        group.status = GroupStatus::RollingBack;
        warn!(group = group.id, reason, "rolling back group");

        for leg in group.legs.iter_mut() {
            match &leg.state {
                LegState::Working => {
                    if let Some(order) = leg.order
                        && let Err(e) = self.ctx.broker.cancel(order).await
                    {
                        // Best effort: the broker may have already closed it.
                        warn!(group = group.id, order = %order, "rollback cancel failed: {e}");
                    }
                    leg.state = LegState::Failed {
                        reason: "canceled by rollback".to_string(),
                    };
                }
                LegState::Filled { quantity, .. } => {
                    let flatten_qty = -*quantity;
                    match self
                        .ctx
                        .broker
                        .place_market(&leg.leg.instrument, flatten_qty)
                        .await
                    {
                        Ok(order) => {
                            debug!(group = group.id, order = %order,
                                instrument = %leg.leg.instrument, qty = flatten_qty,
                                "flatten order placed");
                            group.rollback_orders.push(order);
                        }
                        Err(e) => {
                            // Rollback must complete even under partial broker
                            // failures; the remaining exposure surfaces through
                            // reconciliation.
                            error!(group = group.id, instrument = %leg.leg.instrument,
                                "flatten failed: {e}");
                        }
                    }
                }
                _ => {}
            }
        }

        group.status = GroupStatus::RolledBack;
    }

    async fn place_with_retry(
        &self,
        leg: &Leg,
        limit: Option<Decimal>,
    ) -> Result<OrderId, ExecutionError> {
        let mut attempt = 0u32;
        loop {
            let placed = match limit {
                Some(price) => {
                    self.ctx
                        .broker
                        .place_limit(&leg.instrument, leg.quantity, price)
                        .await
                }
                None => {
                    self.ctx
                        .broker
                        .place_market(&leg.instrument, leg.quantity)
                        .await
                }
            };
            match placed {
                Ok(order) => return Ok(order),
                Err(e) => {
                    attempt += 1;
                    if attempt > self.ctx.constants.execution_retries {
                        return Err(ExecutionError::Broker(e));
                    }
                    warn!(instrument = %leg.instrument, attempt, "placement retry: {e}");
                    tokio::time::sleep(self.ctx.constants.execution_retry_spacing).await;
                }
            }
        }
    }

    /// Reconcile persisted groups after a restart: groups that never reached
    /// a terminal state have their filled legs flattened and open orders
    /// cancelled. Also restores the group-id counter.
    pub async fn recover_on_start(&mut self) -> anyhow::Result<usize> {
        let entries = self.ctx.store.list("order_groups/").await?;
        let mut reconciled = 0;

        for (key, value) in entries {
            let record: OrderGroupRecord = match serde_json::from_value(value) {
                Ok(r) => r,
                Err(e) => {
                    error!(%key, "unreadable group record: {e}");
                    continue;
                }
            };
            let mut group = record.group;
            self.next_group_id = self.next_group_id.max(group.id + 1);
            if group.status.is_terminal() {
                continue;
            }

            info!(group = group.id, status = ?group.status, "reconciling in-flight group");

            // Refresh leg states from the broker before deciding.
            for leg in group.legs.iter_mut() {
                let Some(order) = leg.order else { continue };
                match self.ctx.broker.query_order(order).await {
                    Ok(OrderState::Filled {
                        avg_price,
                        quantity,
                    }) => {
                        leg.state = LegState::Filled {
                            avg_price,
                            quantity,
                        };
                    }
                    Ok(OrderState::Canceled) | Ok(OrderState::Invalid) => {
                        leg.state = LegState::Failed {
                            reason: "terminal at recovery".to_string(),
                        };
                    }
                    Ok(_) => leg.state = LegState::Working,
                    Err(e) => {
                        warn!(group = group.id, order = %order, "recovery query failed: {e}");
                        leg.state = LegState::Working;
                    }
                }
            }

            // Filled legs that never received their peer are flattened; open
            // orders are cancelled.
            self.rollback(&mut group, "crash recovery").await;
            self.persist(&group).await.map_err(|e| anyhow::anyhow!("{e}"))?;
            self.retire(group);
            reconciled += 1;
        }

        Ok(reconciled)
    }

    /// Periodic sweep for groups whose monitoring loop died: any persisted
    /// non-terminal group older than the sweep age is reconciled like a
    /// crashed group.
    pub async fn sweep_stale(&mut self, now: DateTime<Utc>) -> anyhow::Result<usize> {
        let max_age = self.ctx.constants.stale_group_sweep_age;
        let entries = self.ctx.store.list("order_groups/").await?;
        let mut swept = 0;

        for (_, value) in entries {
            let Ok(record) = serde_json::from_value::<OrderGroupRecord>(value) else {
                continue;
            };
            let mut group = record.group;
            if group.status.is_terminal() {
                continue;
            }
            let age = now.signed_duration_since(group.created_at);
            if age.num_seconds() < max_age.as_secs() as i64 {
                continue;
            }
            warn!(group = group.id, age_secs = age.num_seconds(), "sweeping stale group");
            self.rollback(&mut group, "stale group sweep").await;
            self.persist(&group).await.map_err(|e| anyhow::anyhow!("{e}"))?;
            self.retire(group);
            swept += 1;
        }

        Ok(swept)
    }
}
