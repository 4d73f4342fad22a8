//! ランごとのコスト台帳
//!
//! 残予算の確認と加算は1つのロック内で行い、呼び出し順に関係なく
//! 予算を超えて計上しない。

use crate::error::{Result, ShelfAiError};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use tracing::{debug, warn};

/// 浮動小数の誤差で境界ちょうどの計上を弾かないための許容値
const EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostEntry {
    pub tag: String,
    pub amount: f64,
}

#[derive(Debug, Default)]
struct Ledger {
    total: f64,
    entries: Vec<CostEntry>,
}

#[derive(Debug)]
pub struct CostTracker {
    budget: f64,
    ledger: Mutex<Ledger>,
}

impl CostTracker {
    pub fn new(budget: f64) -> Self {
        Self {
            budget,
            ledger: Mutex::new(Ledger::default()),
        }
    }

    pub fn budget(&self) -> f64 {
        self.budget
    }

    fn ledger(&self) -> std::sync::MutexGuard<'_, Ledger> {
        // 台帳の更新は単純な加算のみなので、poisonしても中身は整合している
        self.ledger.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// 予算内なら計上、超えるなら BudgetExceeded（計上しない）
    pub fn add_cost(&self, tag: &str, amount: f64) -> Result<()> {
        if amount < 0.0 || !amount.is_finite() {
            return Err(ShelfAiError::Config(format!("不正なコスト: {}", amount)));
        }

        let mut ledger = self.ledger();
        let remaining = self.budget - ledger.total;
        if amount > remaining + EPSILON {
            warn!(tag, amount, remaining, "予算超過のため計上を拒否");
            return Err(ShelfAiError::BudgetExceeded {
                requested: amount,
                remaining: remaining.max(0.0),
            });
        }

        ledger.total += amount;
        ledger.entries.push(CostEntry {
            tag: tag.to_string(),
            amount,
        });
        debug!(tag, amount, total = ledger.total, "コスト計上");
        Ok(())
    }

    pub fn remaining_budget(&self) -> f64 {
        (self.budget - self.ledger().total).max(0.0)
    }

    pub fn total_charged(&self) -> f64 {
        self.ledger().total
    }

    pub fn entries(&self) -> Vec<CostEntry> {
        self.ledger().entries.clone()
    }

    /// タグの前方一致で合計（例: "round-2/"）
    pub fn total_for(&self, prefix: &str) -> f64 {
        self.ledger()
            .entries
            .iter()
            .filter(|e| e.tag.starts_with(prefix))
            .map(|e| e.amount)
            .sum()
    }
}
