// fraudwatch/src/state/entity.rs
//
// Per-entity state documents and the keys they live under.
//
//   card:<cc_num>        → CardState      (velocity windows, amount history)
//   user:<sha256(ssn)>   → UserState      (amount history, merchants, categories, region)
//   merchant:<name>      → MerchantState  (amount history, cards seen)
//   account:<acct_num>   → AccountState   (cards seen; only when acct_num is present)
//
// `apply` is the only mutation path; it folds one transaction into the
// document. The store guarantees it runs strictly after that transaction
// was scored, so a snapshot never contains the event being scored.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::events::Transaction;
use crate::state::window::{Expanding, KeyedStats, Rolling, Tally, TimeWindow, W_15MIN, W_1HR, W_24HR};

// ── Horizons ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Horizons {
    pub burst: Duration,
    pub short: Duration,
    pub long:  Duration,
}

impl Default for Horizons {
    fn default() -> Self {
        Self {
            burst: Duration::seconds(W_15MIN),
            short: Duration::seconds(W_1HR),
            long:  Duration::seconds(W_24HR),
        }
    }
}

// ── Keys ──────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityKind {
    Card,
    User,
    Merchant,
    Account,
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Card     => write!(f, "card"),
            Self::User     => write!(f, "user"),
            Self::Merchant => write!(f, "merchant"),
            Self::Account  => write!(f, "account"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityKey {
    pub kind: EntityKind,
    pub id:   String,
}

impl EntityKey {
    pub fn card(cc_num: &str) -> Self {
        Self { kind: EntityKind::Card, id: cc_num.to_string() }
    }

    /// Account holders are keyed by a digest of the SSN so the backing
    /// store never holds the raw identifier.
    pub fn user(ssn: &str) -> Self {
        let mut h = Sha256::new();
        h.update(b"fw_user:");
        h.update(ssn.as_bytes());
        Self { kind: EntityKind::User, id: hex::encode(&h.finalize()[..16]) }
    }

    pub fn merchant(name: &str) -> Self {
        Self { kind: EntityKind::Merchant, id: name.to_string() }
    }

    pub fn account(acct_num: &str) -> Self {
        Self { kind: EntityKind::Account, id: acct_num.to_string() }
    }

    pub fn for_transaction(tx: &Transaction) -> TxKeys {
        TxKeys {
            card:     Self::card(&tx.card_id),
            user:     Self::user(&tx.user_id),
            merchant: Self::merchant(&tx.merchant),
            account:  tx.account_id.as_deref().map(Self::account),
        }
    }
}

/// Every key one transaction touches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxKeys {
    pub card:     EntityKey,
    pub user:     EntityKey,
    pub merchant: EntityKey,
    pub account:  Option<EntityKey>,
}

impl TxKeys {
    /// Card first, account last when present.
    pub fn iter(&self) -> impl Iterator<Item = &EntityKey> {
        [&self.card, &self.user, &self.merchant].into_iter().chain(self.account.as_ref())
    }
}

impl std::fmt::Display for EntityKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

// ── Card ──────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CardState {
    #[serde(default)]
    pub burst_window: TimeWindow,
    pub short_window: TimeWindow,
    pub long_window:  TimeWindow,
    #[serde(default)]
    pub amounts:      Expanding,
    pub last_event:   Option<DateTime<Utc>>,
}

impl CardState {
    pub fn apply(&mut self, tx: &Transaction, h: &Horizons) {
        self.prune(tx.timestamp, h);
        self.burst_window.observe(tx.timestamp);
        self.short_window.observe(tx.timestamp);
        self.long_window.observe(tx.timestamp);
        self.amounts.observe(tx.amount);
        self.last_event = Some(self.last_event.map_or(tx.timestamp, |l| l.max(tx.timestamp)));
    }

    pub fn prune(&mut self, now: DateTime<Utc>, h: &Horizons) {
        self.burst_window.prune(now, h.burst);
        self.short_window.prune(now, h.short);
        self.long_window.prune(now, h.long);
    }
}

// ── User ──────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserState {
    pub amounts:      Expanding,
    pub recent:       Rolling,
    pub categories:   KeyedStats,
    pub merchants:    Tally,
    pub last_region:  Option<String>,
    pub last_event:   Option<DateTime<Utc>>,
}

impl UserState {
    pub fn apply(&mut self, tx: &Transaction) {
        self.amounts.observe(tx.amount);
        self.recent.observe(tx.amount);
        self.categories.observe(&tx.category, tx.amount);
        self.merchants.bump(&tx.merchant);
        if let Some(ref st) = tx.state {
            self.last_region = Some(st.clone());
        }
        self.last_event = Some(self.last_event.map_or(tx.timestamp, |l| l.max(tx.timestamp)));
    }

    pub fn count(&self) -> u64 { self.amounts.count }
}

// ── Merchant ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MerchantState {
    pub amounts: Expanding,
    #[serde(default)]
    pub cards:   Tally,
}

impl MerchantState {
    pub fn apply(&mut self, tx: &Transaction) {
        self.amounts.observe(tx.amount);
        self.cards.bump(&tx.card_id);
    }
}

// ── Account ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AccountState {
    pub cards: Tally,
}

impl AccountState {
    pub fn apply(&mut self, tx: &Transaction) {
        self.cards.bump(&tx.card_id);
    }
}

// ── Tagged document ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EntityState {
    Card(CardState),
    User(UserState),
    Merchant(MerchantState),
    Account(AccountState),
}

impl EntityState {
    pub fn empty(kind: EntityKind) -> Self {
        match kind {
            EntityKind::Card     => Self::Card(CardState::default()),
            EntityKind::User     => Self::User(UserState::default()),
            EntityKind::Merchant => Self::Merchant(MerchantState::default()),
            EntityKind::Account  => Self::Account(AccountState::default()),
        }
    }

    pub fn kind(&self) -> EntityKind {
        match self {
            Self::Card(_)     => EntityKind::Card,
            Self::User(_)     => EntityKind::User,
            Self::Merchant(_) => EntityKind::Merchant,
            Self::Account(_)  => EntityKind::Account,
        }
    }

    pub fn apply(&mut self, tx: &Transaction, h: &Horizons) {
        match self {
            Self::Card(c)     => c.apply(tx, h),
            Self::User(u)     => u.apply(tx),
            Self::Merchant(m) => m.apply(tx),
            Self::Account(a)  => a.apply(tx),
        }
    }

    /// Expire window entries relative to `now`. No-op for non-windowed kinds.
    pub fn prune(&mut self, now: DateTime<Utc>, h: &Horizons) {
        if let Self::Card(c) = self {
            c.prune(now, h);
        }
    }

    pub fn into_card(self) -> Option<CardState> {
        match self { Self::Card(c) => Some(c), _ => None }
    }

    pub fn into_user(self) -> Option<UserState> {
        match self { Self::User(u) => Some(u), _ => None }
    }

    pub fn into_merchant(self) -> Option<MerchantState> {
        match self { Self::Merchant(m) => Some(m), _ => None }
    }

    pub fn into_account(self) -> Option<AccountState> {
        match self { Self::Account(a) => Some(a), _ => None }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn tx(secs: i64, amt: f64, merchant: &str, state: &str) -> Transaction {
        Transaction {
            trans_num:         format!("t{secs}"),
            card_id:           "4000".into(),
            user_id:           "111-22-3333".into(),
            account_id:        None,
            merchant:          merchant.into(),
            category:          "grocery_pos".into(),
            amount:            amt,
            city:              None,
            state:             Some(state.into()),
            city_pop:          None,
            location:          None,
            merchant_location: None,
            timestamp:         Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap(),
            dob:               None,
            gender:            None,
        }
    }

    #[test]
    fn user_key_hides_ssn() {
        let k = EntityKey::user("111-22-3333");
        assert_eq!(k.kind, EntityKind::User);
        assert_eq!(k.id.len(), 32);
        assert!(!k.id.contains("111"));
        assert_eq!(k, EntityKey::user("111-22-3333"));
        assert_ne!(k, EntityKey::user("111-22-3334"));
        assert!(k.to_string().starts_with("user:"));
    }

    #[test]
    fn user_apply_accumulates() {
        let mut u = UserState::default();
        u.apply(&tx(0, 10.0, "a", "NY"));
        u.apply(&tx(60, 30.0, "a", "NJ"));
        assert_eq!(u.count(), 2);
        assert_eq!(u.amounts.mean(), Some(20.0));
        assert_eq!(u.amounts.max(), Some(30.0));
        assert_eq!(u.merchants.get("a"), 2);
        assert_eq!(u.last_region.as_deref(), Some("NJ"));
        assert_eq!(u.categories.get("grocery_pos").map(|e| e.count), Some(2));
    }

    #[test]
    fn card_apply_prunes_expired() {
        let h = Horizons::default();
        let mut c = CardState::default();
        c.apply(&tx(0, 1.0, "a", "NY"), &h);
        c.apply(&tx(600, 5.0, "a", "NY"), &h);
        c.apply(&tx(4000, 3.0, "a", "NY"), &h);
        assert_eq!(c.burst_window.len(), 1);
        assert_eq!(c.short_window.len(), 1);
        assert_eq!(c.long_window.len(), 3);
        assert_eq!(c.amounts.mean(), Some(3.0));
    }

    #[test]
    fn card_documents_without_burst_fields_still_load() {
        let json = r#"{"kind":"card","short_window":{"points":[]},"long_window":{"points":[]},"last_event":null}"#;
        let c = serde_json::from_str::<EntityState>(json).unwrap().into_card().unwrap();
        assert!(c.burst_window.is_empty());
        assert_eq!(c.amounts.count, 0);
    }

    #[test]
    fn merchant_and_account_track_distinct_cards() {
        let h = Horizons::default();
        let mut t = tx(0, 1.0, "a", "NY");
        t.account_id = Some("acct-9".into());
        let keys = EntityKey::for_transaction(&t);
        assert_eq!(keys.account, Some(EntityKey::account("acct-9")));
        assert_eq!(keys.iter().count(), 4);

        let mut merchant = EntityState::empty(EntityKind::Merchant);
        let mut account  = EntityState::empty(keys.account.as_ref().unwrap().kind);
        for card in ["4000", "4001", "4000"] {
            t.card_id = card.into();
            merchant.apply(&t, &h);
            account.apply(&t, &h);
        }
        assert_eq!(merchant.into_merchant().unwrap().cards.distinct(), 2);
        let account = account.into_account().unwrap();
        assert_eq!(account.cards.distinct(), 2);
        assert_eq!(account.cards.get("4000"), 2);

        t.account_id = None;
        assert_eq!(EntityKey::for_transaction(&t).iter().count(), 3);
    }

    #[test]
    fn document_round_trips_with_kind_tag() {
        let mut s = EntityState::empty(EntityKind::Merchant);
        s.apply(&tx(0, 42.0, "a", "NY"), &Horizons::default());
        let json = serde_json::to_string(&s).unwrap();
        assert!(json.contains(r#""kind":"merchant""#));
        let back: EntityState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, s);
    }
}
