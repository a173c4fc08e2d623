//! Shop Ledger - end-of-day settlement engine
//!
//! Stages a business day's completed orders into per item-location stock
//! deductions and payment totals, validates them against inventory, seals the
//! day exactly once, and keeps an append-only correction trail on sealed days.
//!
//! The entry points are [`LedgerEngine`] and [`CorrectionLog`], both generic
//! over a [`LedgerStore`]. [`db::DbState`] persists to SQLite and
//! [`MemoryStore`] keeps everything in process.

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer, Registry,
};

pub mod aggregator;
pub mod config;
pub mod corrections;
pub mod db;
pub mod diagnostics;
pub mod error;
pub mod ledger;
pub mod models;
pub mod stock_health;
pub mod store;

pub use aggregator::{build_staging, DefaultLocation, LocationResolver, StagedDay};
pub use config::EngineConfig;
pub use corrections::{CorrectionLog, CorrectionOutcome};
pub use error::{LedgerError, LedgerResult};
pub use ledger::{validate_commit, DayState, DayView, LedgerEngine, LedgerSummary};
pub use models::{
    AggregationIssue, Correction, InventoryRecord, LedgerEntry, LedgerField, LedgerOrder, Order,
    OrderLine, OrderStatus, PaymentMethod, PaymentTotals, StagingEntry, StockViolation,
};
pub use stock_health::{StockOutlook, StockStatus};
pub use store::{Inventory, LedgerStore, MemoryStore};

// ============================================================================
// Logging
// ============================================================================

/// Install the global tracing subscriber.
///
/// Console output always, plus a daily rolling file in `log_dir`, or in
/// [`diagnostics::get_log_dir`] when `None`. Old files are pruned first.
/// `RUST_LOG` overrides the default filter. The returned guard flushes the
/// file writer on drop, so hold it for the life of the process. Returns
/// `None` if the log directory cannot be created or a subscriber was already
/// installed.
pub fn init_logging(log_dir: Option<&Path>, json: bool) -> Option<WorkerGuard> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,shop_ledger=debug"));

    let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = Vec::new();
    layers.push(if json {
        fmt::layer().json().with_target(true).boxed()
    } else {
        fmt::layer().with_target(true).boxed()
    });

    let dir = log_dir.map_or_else(diagnostics::get_log_dir, Path::to_path_buf);
    let mut guard = None;
    diagnostics::prune_old_logs(&dir, diagnostics::MAX_LOG_FILES);
    match std::fs::create_dir_all(&dir) {
        Ok(()) => {
            let file_appender = tracing_appender::rolling::daily(&dir, diagnostics::LOG_FILE_PREFIX);
            let (non_blocking, file_guard) = tracing_appender::non_blocking(file_appender);
            layers.push(
                fmt::layer()
                    .with_writer(non_blocking)
                    .with_ansi(false)
                    .with_target(true)
                    .boxed(),
            );
            guard = Some(file_guard);
        }
        Err(e) => eprintln!("shop-ledger: cannot create log dir {}: {e}", dir.display()),
    }

    if tracing_subscriber::registry()
        .with(layers.with_filter(env_filter))
        .try_init()
        .is_err()
    {
        return None;
    }

    tracing::info!(log_dir = %dir.display(), "Shop ledger v{} logging initialized", env!("CARGO_PKG_VERSION"));
    guard
}
