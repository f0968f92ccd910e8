// fraudwatch/src/features.rs
//
// FeatureComputer: transaction + entity snapshots → FeatureVector.
//
// Pure: no I/O, no mutation. Snapshots are taken before the transaction is
// committed, so every history feature describes the past only.
//
// Unseen-entity policy:
//   counts            → 0
//   distinct cards    → 1      (the current card)
//   means / max       → the current amount (ratios are exactly 1.0)
//   "new" flags       → true   (is_new_merchant_for_user)
//   region change     → false  (is_new_state)
//   time since last   → FeatureDefaults::gap_secs
// Ratio denominators are floored at `min_denominator`; any non-finite result
// is replaced by `sentinel`.

use chrono::{DateTime, Datelike, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::encoding::TargetEncodings;
use crate::events::Transaction;
use crate::state::entity::{AccountState, CardState, Horizons, MerchantState, UserState};

pub const FEATURE_SCHEMA_VERSION: u32 = 2;

/// Numeric features in model input order. Booleans encode as 0.0 / 1.0.
pub const NUMERIC_FEATURES: [&str; 31] = [
    "amt",
    "age",
    "is_amt_round_number",
    "distance_km",
    "city_pop",
    "cc_num_count_last_15m",
    "cc_num_count_last_1h",
    "cc_num_count_last_24h",
    "time_since_last_card_trans",
    "amt_vs_card_avg_ratio",
    "time_since_last_user_trans",
    "user_trans_count",
    "user_avg_amt_so_far",
    "user_max_amt_so_far",
    "amt_vs_user_avg_ratio",
    "is_over_user_max_amt",
    "user_avg_amt_last_5_trans",
    "user_merchant_trans_count",
    "is_new_merchant_for_user",
    "user_avg_amt_category_so_far",
    "amt_vs_user_category_avg",
    "is_new_state",
    "merchant_avg_amt_so_far",
    "amt_vs_merchant_avg_ratio",
    "merchant_card_count",
    "account_card_count",
    "merchant_encoded",
    "city_encoded",
    "state_encoded",
    "acct_num_encoded",
    "ssn_encoded",
];

pub const CATEGORICAL_FEATURES: [&str; 4] = ["category", "gender", "hour_of_day", "day_of_week"];

// ── Defaults ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureDefaults {
    pub age:             f64,
    pub distance_km:     f64,
    pub city_pop:        f64,
    pub gap_secs:        f64,
    pub min_denominator: f64,
    pub sentinel:        f64,
}

impl Default for FeatureDefaults {
    fn default() -> Self {
        Self {
            age:             45.0,
            distance_km:     76.0,
            city_pop:        2456.0,
            gap_secs:        30.0 * 24.0 * 60.0 * 60.0,
            min_denominator: 0.01,
            sentinel:        999_999.0,
        }
    }
}

// ── Vector ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureVector {
    // static
    pub amt:                          f64,
    pub age:                          f64,
    pub is_amt_round_number:          bool,
    pub distance_km:                  f64,
    pub city_pop:                     f64,
    pub category:                     String,
    pub gender:                       String,
    pub hour_of_day:                  u32,
    pub day_of_week:                  u32,
    // card
    pub cc_num_count_last_15m:        u64,
    pub cc_num_count_last_1h:         u64,
    pub cc_num_count_last_24h:        u64,
    pub time_since_last_card_trans:   f64,
    pub amt_vs_card_avg_ratio:        f64,
    // user
    pub time_since_last_user_trans:   f64,
    pub user_trans_count:             u64,
    pub user_avg_amt_so_far:          f64,
    pub user_max_amt_so_far:          f64,
    pub amt_vs_user_avg_ratio:        f64,
    pub is_over_user_max_amt:         bool,
    pub user_avg_amt_last_5_trans:    f64,
    pub user_merchant_trans_count:    u64,
    pub is_new_merchant_for_user:     bool,
    pub user_avg_amt_category_so_far: f64,
    pub amt_vs_user_category_avg:     f64,
    pub is_new_state:                 bool,
    // merchant
    pub merchant_avg_amt_so_far:      f64,
    pub amt_vs_merchant_avg_ratio:    f64,
    pub merchant_card_count:          u64,
    // account
    pub account_card_count:           u64,
    // target encodings
    pub merchant_encoded:             f64,
    pub city_encoded:                 f64,
    pub state_encoded:                f64,
    pub acct_num_encoded:             f64,
    pub ssn_encoded:                  f64,
}

fn flag(b: bool) -> f64 { if b { 1.0 } else { 0.0 } }

impl FeatureVector {
    pub fn numeric_index(name: &str) -> Option<usize> {
        NUMERIC_FEATURES.iter().position(|n| *n == name)
    }

    pub fn categorical_index(name: &str) -> Option<usize> {
        CATEGORICAL_FEATURES.iter().position(|n| *n == name)
    }

    /// Numeric values ordered as `NUMERIC_FEATURES`.
    pub fn numeric(&self) -> [f64; NUMERIC_FEATURES.len()] {
        [
            self.amt,
            self.age,
            flag(self.is_amt_round_number),
            self.distance_km,
            self.city_pop,
            self.cc_num_count_last_15m as f64,
            self.cc_num_count_last_1h as f64,
            self.cc_num_count_last_24h as f64,
            self.time_since_last_card_trans,
            self.amt_vs_card_avg_ratio,
            self.time_since_last_user_trans,
            self.user_trans_count as f64,
            self.user_avg_amt_so_far,
            self.user_max_amt_so_far,
            self.amt_vs_user_avg_ratio,
            flag(self.is_over_user_max_amt),
            self.user_avg_amt_last_5_trans,
            self.user_merchant_trans_count as f64,
            flag(self.is_new_merchant_for_user),
            self.user_avg_amt_category_so_far,
            self.amt_vs_user_category_avg,
            flag(self.is_new_state),
            self.merchant_avg_amt_so_far,
            self.amt_vs_merchant_avg_ratio,
            self.merchant_card_count as f64,
            self.account_card_count as f64,
            self.merchant_encoded,
            self.city_encoded,
            self.state_encoded,
            self.acct_num_encoded,
            self.ssn_encoded,
        ]
    }

    /// Categorical values ordered as `CATEGORICAL_FEATURES`.
    pub fn categorical(&self) -> [String; CATEGORICAL_FEATURES.len()] {
        [
            self.category.clone(),
            self.gender.clone(),
            self.hour_of_day.to_string(),
            self.day_of_week.to_string(),
        ]
    }
}

// ── Computer ──────────────────────────────────────────────────────────────────

pub struct FeatureComputer {
    defaults:  FeatureDefaults,
    horizons:  Horizons,
    encodings: Arc<TargetEncodings>,
}

impl FeatureComputer {
    pub fn new(defaults: FeatureDefaults, horizons: Horizons, encodings: Arc<TargetEncodings>) -> Self {
        Self { defaults, horizons, encodings }
    }

    pub fn defaults(&self) -> &FeatureDefaults { &self.defaults }

    pub fn compute(
        &self,
        tx:       &Transaction,
        card:     &CardState,
        user:     &UserState,
        merchant: &MerchantState,
        account:  &AccountState,
    ) -> FeatureVector {
        let d   = &self.defaults;
        let amt = tx.amount;
        let now = tx.timestamp;

        // static
        let age = tx.dob
            .map(|dob| (now.date_naive() - dob).num_days() as f64 / 365.25)
            .unwrap_or(d.age);
        let distance_km = match (tx.location, tx.merchant_location) {
            (Some(a), Some(b)) => a.haversine_km(&b),
            _                  => d.distance_km,
        };

        // user history
        let user_avg = user.amounts.mean_or(amt);
        let user_max = user.amounts.max_or(amt);
        let cat      = user.categories.get(&tx.category);
        let cat_avg  = cat.and_then(|c| c.mean());
        let visits   = user.merchants.get(&tx.merchant);
        let is_new_state = match (&user.last_region, &tx.state) {
            (Some(last), Some(cur)) => last != cur,
            _                       => false,
        };

        let merchant_avg = merchant.amounts.mean();

        FeatureVector {
            amt,
            age:                          self.finite(age),
            is_amt_round_number:          amt > 0.0 && amt % 1.0 == 0.0,
            distance_km:                  self.finite(distance_km),
            city_pop:                     tx.city_pop.unwrap_or(d.city_pop),
            category:                     tx.category.clone(),
            gender:                       tx.gender.clone().unwrap_or_else(|| "unknown".into()),
            hour_of_day:                  now.hour(),
            day_of_week:                  now.weekday().num_days_from_monday(),

            cc_num_count_last_15m:        card.burst_window.count_in(now, self.horizons.burst) as u64,
            cc_num_count_last_1h:         card.short_window.count_in(now, self.horizons.short) as u64,
            cc_num_count_last_24h:        card.long_window.count_in(now, self.horizons.long) as u64,
            time_since_last_card_trans:   self.gap(card.last_event, now),
            amt_vs_card_avg_ratio:        self.ratio(amt, card.amounts.mean()),

            time_since_last_user_trans:   self.gap(user.last_event, now),
            user_trans_count:             user.count(),
            user_avg_amt_so_far:          user_avg,
            user_max_amt_so_far:          user_max,
            amt_vs_user_avg_ratio:        self.ratio(amt, user.amounts.mean()),
            is_over_user_max_amt:         user.amounts.max().map_or(false, |m| amt > m),
            user_avg_amt_last_5_trans:    user.recent.mean().unwrap_or(amt),
            user_merchant_trans_count:    visits,
            is_new_merchant_for_user:     visits == 0,
            user_avg_amt_category_so_far: cat_avg.unwrap_or(amt),
            amt_vs_user_category_avg:     self.ratio(amt, cat_avg),
            is_new_state,

            merchant_avg_amt_so_far:      merchant_avg.unwrap_or(amt),
            amt_vs_merchant_avg_ratio:    self.ratio(amt, merchant_avg),
            merchant_card_count:          merchant.cards.distinct_with(&tx.card_id) as u64,

            account_card_count:           account.cards.distinct_with(&tx.card_id) as u64,

            merchant_encoded:             self.encodings.lookup("merchant", Some(&tx.merchant)),
            city_encoded:                 self.encodings.lookup("city", tx.city.as_deref()),
            state_encoded:                self.encodings.lookup("state", tx.state.as_deref()),
            acct_num_encoded:             self.encodings.lookup("acct_num", tx.account_id.as_deref()),
            ssn_encoded:                  self.encodings.lookup("ssn", Some(&tx.user_id)),
        }
    }

    /// `amt / mean` with the denominator floor; exactly 1.0 with no history.
    fn ratio(&self, amt: f64, mean: Option<f64>) -> f64 {
        match mean {
            None    => 1.0,
            Some(m) => self.finite(amt / m.max(self.defaults.min_denominator)),
        }
    }

    fn gap(&self, last: Option<DateTime<Utc>>, now: DateTime<Utc>) -> f64 {
        match last {
            // out-of-order arrival can put `last` after `now`
            Some(l) => ((now - l).num_milliseconds() as f64 / 1000.0).max(0.0),
            None    => self.defaults.gap_secs,
        }
    }

    fn finite(&self, x: f64) -> f64 {
        if x.is_finite() { x } else { self.defaults.sentinel }
    }
}
