//! License Ledger - benefit accrual and referral payouts for license packages
//!
//! Runs as a daemon next to the payment and wallet services. It owns the
//! money side of a license program; everything else is a collaborator.
//!
//! ## Architecture
//!
//! - **Ledger**: Immutable entries, one per idempotency key (`db::ledger`)
//! - **Engines**: Daily accrual, referral commission, pool distribution (`services`)
//! - **Scheduler**: Daily batch with bounded parallelism (`scheduler`)
//! - **HTTP**: Manual triggers, collaborator intake and queries (`http`)
//!
//! ## Money Flow
//!
//! | Event | Entry | Amount |
//! |-------|-------|--------|
//! | Deposit confirmed | `deposit/license_purchase` | package price |
//! | Deposit confirmed, referrer exists | `commission/license_activation` | activation rate |
//! | Active day of a cycle | `earnings/daily_benefit` | daily rate |
//! | First 8 active days done | `commission/direct_referral` | direct rate |
//! | Pool cycle closed | `pool_bonus/pool_cycle` | share of pool rate |
//!
//! ## Storage Layout
//!
//! ```text
//! ~/.local/share/license-ledger/
//! ├── ledger.db       # SQLite: ledger, purchases, read models, pool plans
//! └── config.toml     # Configuration
//! ```

pub mod config;
pub mod error;
pub mod money;
pub mod cycle;
pub mod db;
pub mod services;
pub mod scheduler;
pub mod http;

// Re-exports
pub use config::Config;
pub use error::{EngineError, Ineligible};
pub use money::{Amount, Bps};
pub use cycle::CycleState;
pub use db::LedgerDb;
pub use services::Services;
pub use scheduler::{BatchSummary, Scheduler};
pub use http::HttpServer;
