// fraudwatch/src/lib.rs
//
// fraudwatch: real-time transaction fraud scoring over a stateful
// per-entity feature store.
//
//   source ──► Dispatcher (W workers) ──► Pipeline::process
//                                            │ snapshot_for × 3   (state::store)
//                                            │ FeatureComputer    (features)
//                                            │ ScoringEngine      (engine::scoring, model)
//                                            │ Notifier           (notify)
//                                            │ TransactionSink    (sinks)
//                                            └ commit × 3         (state::store)

pub mod config;
pub mod encoding;
pub mod engine;
pub mod error;
pub mod events;
pub mod features;
pub mod metrics;
pub mod model;
pub mod notify;
pub mod sinks;
pub mod source;
pub mod state;

pub use config::AppConfig;
pub use engine::dispatcher::{Dispatcher, Outcome, Pipeline};
pub use engine::scoring::ScoringEngine;
pub use events::{Decision, Label, Transaction};
pub use features::{FeatureComputer, FeatureVector};
pub use state::store::EntityStateStore;
