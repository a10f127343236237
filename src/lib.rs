//! Drink dispenser credit gateway.
//!
//! Translates POS order events (drinks sold, lines deleted, quantities
//! reduced) into signed credits on a bar dispenser reached through an HTTP
//! middleware, and keeps a durable ledger of every credit so it can later be
//! reversed exactly once.

pub mod auth;
pub mod catalog;
pub mod config;
pub mod db;
pub mod dispatcher;
pub mod error;
pub mod gateway;
pub mod ledger;
pub mod logging;
pub mod resolver;
pub mod reversal;
pub mod service;

pub use auth::{ActorContext, EmployeeProfile, Role};
pub use catalog::{Catalog, MemoryCatalog, OrderLine, Product};
pub use config::GatewayConfig;
pub use db::DbState;
pub use dispatcher::{BatchResult, CreditDispatcher, ItemOutcome, LabeledCredit};
pub use error::{AuthError, DispenseError, GatewayError, LedgerError, ResolutionError};
pub use gateway::{CreditTarget, DeviceGateway, GatewayAck, GatewayStatus, HttpGateway, Sign};
pub use ledger::{CreditLedger, CreditStatus, LedgerEntry};
pub use reversal::{ReversalEngine, ReversalResult};
pub use service::{
    BatchOrderResult, DispenseKind, DispenseRequest, DispenseResult, DispenseService,
    GatewayHealth, OrderItem, RawCreditRequest,
};
