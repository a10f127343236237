//! Order-management entry points.
//!
//! `DispenseService` is what the POS calls: dispatch drinks and cocktails,
//! reverse credits when lines are deleted or reduced, and query the gateway.
//!
//! **Rules:**
//! - Every mutating entry point checks the actor first; a refused actor
//!   causes no catalog lookup, no gateway call and no ledger write.
//! - Resolution defects abort before the first gateway call.
//! - Gateway failures are reported inside the result, never as `Err`.
//! - A ledger write that fails after a dispatch is logged and swallowed.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::auth::{self, ActorContext};
use crate::catalog::{Catalog, Product};
use crate::config::GatewayConfig;
use crate::db::DbState;
use crate::dispatcher::{CreditDispatcher, ItemOutcome, LabeledCredit};
use crate::error::DispenseError;
use crate::gateway::{CreditTarget, DeviceGateway, Sign};
use crate::ledger::{CreditLedger, LedgerDraft};
use crate::resolver::{CocktailResolution, IngredientInfo, IngredientResolver};
use crate::reversal::{reduction_units, ReversalEngine, ReversalResult};

// ---------------------------------------------------------------------------
// Requests and results
// ---------------------------------------------------------------------------

/// A drink to dispatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispenseRequest {
    pub product_id: i64,
    pub quantity: u32,
    pub session_ref: String,
    #[serde(default)]
    pub order_line_ref: Option<String>,
}

impl DispenseRequest {
    pub fn new(product_id: i64, quantity: u32, session_ref: impl Into<String>) -> Self {
        Self {
            product_id,
            quantity,
            session_ref: session_ref.into(),
            order_line_ref: None,
        }
    }

    pub fn for_line(mut self, order_line_ref: impl Into<String>) -> Self {
        self.order_line_ref = Some(order_line_ref.into());
        self
    }

    /// A zero quantity means one unit.
    fn units(&self) -> u32 {
        self.quantity.max(1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DispenseKind {
    Simple,
    Cocktail,
    /// Dispenser drink served without the machine; nothing was sent.
    Direct,
}

/// Result of dispatching one product.
#[derive(Debug, Clone, Serialize)]
pub struct DispenseResult {
    pub success: bool,
    pub kind: DispenseKind,
    pub product_id: i64,
    pub product_name: String,
    pub quantity: u32,
    pub message: String,
    pub total: usize,
    pub success_count: usize,
    pub items: Vec<ItemOutcome>,
    /// Resolved ingredients (cocktails only).
    pub ingredients: Vec<IngredientInfo>,
}

/// One item of a POS order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderItem {
    pub product_id: i64,
    #[serde(default = "one")]
    pub quantity: u32,
    #[serde(default)]
    pub is_cocktail: bool,
    #[serde(default)]
    pub order_line_ref: Option<String>,
}

fn one() -> u32 {
    1
}

#[derive(Debug, Clone, Serialize)]
pub struct OrderItemResult {
    pub product_id: i64,
    pub success: bool,
    pub message: String,
    pub result: Option<DispenseResult>,
}

/// Result of dispatching a whole order.
#[derive(Debug, Clone, Serialize)]
pub struct BatchOrderResult {
    pub success: bool,
    pub message: String,
    pub items_processed: usize,
    pub distributed_count: usize,
    pub direct_count: usize,
    pub errored_count: usize,
    pub items: Vec<OrderItemResult>,
}

/// Middleware and serial-link health.
#[derive(Debug, Clone, Serialize)]
pub struct GatewayHealth {
    pub reachable: bool,
    pub device_connected: bool,
    pub port: Option<String>,
    pub baudrate: Option<u32>,
    pub message: String,
}

/// A manual credit send.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawCreditRequest {
    pub plu_code: String,
    #[serde(default = "one")]
    pub quantity: u32,
    #[serde(default)]
    pub product_name: String,
    pub session_ref: String,
    #[serde(default)]
    pub order_line_ref: Option<String>,
}

// ---------------------------------------------------------------------------
// Service
// ---------------------------------------------------------------------------

pub struct DispenseService {
    catalog: Arc<dyn Catalog>,
    resolver: IngredientResolver,
    dispatcher: Arc<CreditDispatcher>,
    ledger: CreditLedger,
    reversal: ReversalEngine,
}

impl DispenseService {
    pub fn new(
        config: &GatewayConfig,
        gateway: Arc<dyn DeviceGateway>,
        catalog: Arc<dyn Catalog>,
        db: Arc<DbState>,
    ) -> Self {
        let ledger = CreditLedger::new(db);
        let dispatcher = Arc::new(CreditDispatcher::new(gateway));
        let resolver =
            IngredientResolver::new(Arc::clone(&catalog), config.allow_placeholder_ingredients);
        Self {
            catalog,
            resolver,
            reversal: ReversalEngine::new(ledger.clone(), Arc::clone(&dispatcher)),
            dispatcher,
            ledger,
        }
    }

    pub fn ledger(&self) -> &CreditLedger {
        &self.ledger
    }

    fn product(&self, id: i64) -> Result<Product, DispenseError> {
        self.catalog
            .product(id)
            .ok_or(DispenseError::ProductNotFound(id))
    }

    // -- dispatch ----------------------------------------------------------

    /// Dispatch a simple drink: one credit for its own PLU.
    pub async fn dispatch_simple(
        &self,
        request: &DispenseRequest,
        actor: &ActorContext,
    ) -> Result<DispenseResult, DispenseError> {
        let server_no = auth::authorize(actor)?;
        let product = self.product(request.product_id)?;
        self.simple_flow(&product, request, server_no, actor).await
    }

    /// Dispatch a cocktail: one credit per resolved ingredient, one session.
    pub async fn dispatch_cocktail(
        &self,
        request: &DispenseRequest,
        actor: &ActorContext,
    ) -> Result<DispenseResult, DispenseError> {
        let server_no = auth::authorize(actor)?;
        let product = self.product(request.product_id)?;
        if !product.is_cocktail {
            return Err(DispenseError::NotCocktail(product.name));
        }
        self.cocktail_flow(&product, request, server_no, actor).await
    }

    /// Route a product to the right flow.
    pub async fn dispatch_product(
        &self,
        request: &DispenseRequest,
        actor: &ActorContext,
    ) -> Result<DispenseResult, DispenseError> {
        let server_no = auth::authorize(actor)?;
        let product = self.product(request.product_id)?;
        if !product.is_dispenser_drink {
            return Err(DispenseError::NotDispenserProduct(product.name));
        }
        if !product.needs_distributor {
            info!(product = %product.name, "direct drink, no dispenser action");
            return Ok(DispenseResult {
                success: true,
                kind: DispenseKind::Direct,
                product_id: product.id,
                message: format!("direct drink \"{}\", no dispenser action needed", product.name),
                product_name: product.name,
                quantity: request.units(),
                total: 0,
                success_count: 0,
                items: Vec::new(),
                ingredients: Vec::new(),
            });
        }
        if product.is_cocktail {
            self.cocktail_flow(&product, request, server_no, actor).await
        } else {
            self.simple_flow(&product, request, server_no, actor).await
        }
    }

    /// Dispatch every item of an order. Item failures are counted, not raised.
    pub async fn dispatch_order(
        &self,
        items: &[OrderItem],
        session_ref: &str,
        actor: &ActorContext,
    ) -> Result<BatchOrderResult, DispenseError> {
        let server_no = auth::authorize(actor)?;

        let mut results = Vec::with_capacity(items.len());
        let (mut distributed, mut direct, mut errored) = (0, 0, 0);

        for item in items {
            let request = DispenseRequest {
                product_id: item.product_id,
                quantity: item.quantity,
                session_ref: session_ref.to_string(),
                order_line_ref: item.order_line_ref.clone(),
            };
            let outcome = if item.is_cocktail {
                match self.product(item.product_id) {
                    Ok(product) => self.cocktail_flow(&product, &request, server_no, actor).await,
                    Err(e) => Err(e),
                }
            } else {
                self.dispatch_product(&request, actor).await
            };

            match outcome {
                Ok(result) => {
                    if !result.success {
                        errored += 1;
                    } else if result.kind == DispenseKind::Direct {
                        direct += 1;
                    } else {
                        distributed += 1;
                    }
                    results.push(OrderItemResult {
                        product_id: item.product_id,
                        success: result.success,
                        message: result.message.clone(),
                        result: Some(result),
                    });
                }
                Err(e) => {
                    warn!(product_id = item.product_id, error = %e, "order item not dispatched");
                    errored += 1;
                    results.push(OrderItemResult {
                        product_id: item.product_id,
                        success: false,
                        message: e.to_string(),
                        result: None,
                    });
                }
            }
        }

        let message = if items.is_empty() {
            "no items to process".to_string()
        } else if errored == 0 {
            format!("order processed: {distributed} dispensed, {direct} direct")
        } else {
            format!("{errored}/{} items failed", items.len())
        };
        info!(
            session = %session_ref,
            distributed,
            direct,
            errored,
            "order dispatch finished"
        );
        Ok(BatchOrderResult {
            success: errored == 0,
            message,
            items_processed: items.len(),
            distributed_count: distributed,
            direct_count: direct,
            errored_count: errored,
            items: results,
        })
    }

    /// Send one credit for an arbitrary PLU. The server number always comes
    /// from the actor.
    pub async fn send_raw_credit(
        &self,
        request: &RawCreditRequest,
        actor: &ActorContext,
    ) -> Result<ItemOutcome, DispenseError> {
        let server_no = auth::authorize(actor)?;
        let quantity = request.quantity.max(1);
        let target = CreditTarget::new(server_no, &request.plu_code, Sign::Plus, quantity)?;
        let label = if request.product_name.is_empty() {
            request.plu_code.clone()
        } else {
            request.product_name.clone()
        };
        info!(credit = %target, "manual credit send");
        let outcome = self
            .dispatcher
            .dispatch_one(LabeledCredit::new(target, label.clone()))
            .await;
        self.record_attempt(LedgerDraft {
            session_ref: request.session_ref.clone(),
            order_line_ref: request.order_line_ref.clone(),
            product_name: label,
            plu_no: request.plu_code.clone(),
            quantity,
            server_no,
            success: outcome.success,
            message: outcome.message.clone(),
            response_payload: outcome.response.clone(),
            ..self.draft_for(actor)
        });
        Ok(outcome)
    }

    async fn simple_flow(
        &self,
        product: &Product,
        request: &DispenseRequest,
        server_no: u32,
        actor: &ActorContext,
    ) -> Result<DispenseResult, DispenseError> {
        let plu = self.resolver.resolve_simple(product)?;
        let quantity = request.units();
        let target = CreditTarget::new(server_no, &plu.plu_code, Sign::Plus, quantity)?;

        info!(
            product = %product.name,
            plu = %plu.plu_code,
            quantity,
            server_no,
            "dispatching simple drink"
        );
        let outcome = self
            .dispatcher
            .dispatch_one(LabeledCredit::new(target, product.name.clone()))
            .await;

        self.record_attempt(LedgerDraft {
            session_ref: request.session_ref.clone(),
            order_line_ref: request.order_line_ref.clone(),
            product_name: product.name.clone(),
            plu_no: plu.plu_code.clone(),
            quantity,
            server_no,
            success: outcome.success,
            message: outcome.message.clone(),
            response_payload: outcome.response.clone(),
            ..self.draft_for(actor)
        });

        let message = if outcome.success {
            format!("\"{}\" dispatched (qty {quantity})", product.name)
        } else {
            format!("\"{}\" not dispatched: {}", product.name, outcome.message)
        };
        Ok(DispenseResult {
            success: outcome.success,
            kind: DispenseKind::Simple,
            product_id: product.id,
            product_name: product.name.clone(),
            quantity,
            message,
            total: 1,
            success_count: usize::from(outcome.success),
            items: vec![outcome],
            ingredients: Vec::new(),
        })
    }

    async fn cocktail_flow(
        &self,
        product: &Product,
        request: &DispenseRequest,
        server_no: u32,
        actor: &ActorContext,
    ) -> Result<DispenseResult, DispenseError> {
        let resolution = self.resolver.resolve_cocktail(product)?;
        let quantity = request.units();

        // Build every target before the first send so a bad PLU dispatches nothing.
        let credits = resolution
            .ingredients
            .iter()
            .map(|ingredient| {
                CreditTarget::new(server_no, &ingredient.plu_code, Sign::Plus, quantity).map(
                    |target| {
                        LabeledCredit::new(target, format!("{} - {}", product.name, ingredient.name))
                    },
                )
            })
            .collect::<Result<Vec<_>, _>>()?;

        info!(
            cocktail = %product.name,
            ingredients = credits.len(),
            quantity,
            server_no,
            "dispatching cocktail"
        );
        let batch = self.dispatcher.dispatch_batch(credits).await;

        let base = self.draft_for(actor);
        for (item, ingredient) in batch.items.iter().zip(&resolution.ingredients) {
            self.record_attempt(LedgerDraft {
                session_ref: request.session_ref.clone(),
                order_line_ref: request.order_line_ref.clone(),
                product_name: item.label.clone(),
                plu_no: ingredient.plu_code.clone(),
                quantity,
                server_no,
                success: item.success,
                message: item.message.clone(),
                response_payload: item.response.clone(),
                ..base.clone()
            });
        }

        let message = if batch.success {
            format!(
                "cocktail \"{}\" dispatched (qty {quantity}, {} ingredients)",
                product.name, batch.total
            )
        } else if batch.success_count > 0 {
            format!(
                "partial cocktail \"{}\": {}/{} ingredients sent",
                product.name, batch.success_count, batch.total
            )
        } else {
            format!("cocktail \"{}\" not dispatched: {}", product.name, batch.message)
        };
        if !batch.success {
            warn!(cocktail = %product.name, sent = batch.success_count, total = batch.total, "cocktail incomplete");
        }

        Ok(DispenseResult {
            success: batch.success,
            kind: DispenseKind::Cocktail,
            product_id: product.id,
            product_name: product.name.clone(),
            quantity,
            message,
            total: batch.total,
            success_count: batch.success_count,
            items: batch.items,
            ingredients: resolution.ingredients,
        })
    }

    // -- reversal ----------------------------------------------------------

    /// Reverse the credits of an order line. `quantity = None` reverses all
    /// of them (line deletion); otherwise the newest `quantity` units.
    pub async fn cancel_line(
        &self,
        line_ref: &str,
        quantity: Option<u32>,
        actor: &ActorContext,
    ) -> Result<ReversalResult, DispenseError> {
        auth::ensure_can_dispense(actor)?;
        let line = self
            .catalog
            .order_line(line_ref)
            .ok_or_else(|| DispenseError::LineNotFound(line_ref.to_string()))?;
        let product = self.product(line.product_id)?;
        if !product.needs_distributor {
            return Ok(ReversalResult::empty());
        }
        let ledger_actor = actor.ledger_actor();

        if product.is_cocktail {
            let resolution = self.resolver.resolve_cocktail(&product)?;
            return Ok(self
                .reversal
                .reverse_cocktail_line(
                    line_ref,
                    &resolution.ingredients,
                    quantity.map(|q| q as usize),
                    &ledger_actor,
                )
                .await?);
        }
        let result = match quantity {
            None => self.reversal.reverse_line_all(line_ref, &ledger_actor).await?,
            Some(q) => {
                self.reversal
                    .reverse_line_newest(line_ref, q as usize, &ledger_actor)
                    .await?
            }
        };
        Ok(result)
    }

    /// Reverse credits after a line's quantity went from `old_qty` to `new_qty`.
    pub async fn reduce_line_quantity(
        &self,
        line_ref: &str,
        old_qty: f64,
        new_qty: f64,
        actor: &ActorContext,
    ) -> Result<ReversalResult, DispenseError> {
        auth::ensure_can_dispense(actor)?;
        let units = reduction_units(old_qty, new_qty);
        if units == 0 {
            return Ok(ReversalResult::empty());
        }
        // More units than a line can hold simply means every credit of it.
        let units = u32::try_from(units).unwrap_or(u32::MAX);
        self.cancel_line(line_ref, Some(units), actor).await
    }

    /// Reverse a cocktail line ingredient by ingredient, re-resolving the
    /// ingredients now rather than trusting what was sent.
    pub async fn cancel_cocktail_line(
        &self,
        product_id: i64,
        line_ref: &str,
        quantity: Option<u32>,
        actor: &ActorContext,
    ) -> Result<ReversalResult, DispenseError> {
        auth::ensure_can_dispense(actor)?;
        let product = self.product(product_id)?;
        if !product.is_cocktail {
            return Err(DispenseError::NotCocktail(product.name));
        }
        let resolution = self.resolver.resolve_cocktail(&product)?;
        Ok(self
            .reversal
            .reverse_cocktail_line(
                line_ref,
                &resolution.ingredients,
                quantity.map(|q| q as usize),
                &actor.ledger_actor(),
            )
            .await?)
    }

    /// Reverse `units` newest credits of a PLU within a session.
    pub async fn cancel_plu_credits(
        &self,
        session_ref: &str,
        plu_no: &str,
        units: u32,
        product_name: &str,
        actor: &ActorContext,
    ) -> Result<ReversalResult, DispenseError> {
        auth::ensure_can_dispense(actor)?;
        info!(product = %product_name, plu = %plu_no, units, "manual credit cancellation");
        Ok(self
            .reversal
            .reverse_plu_in_session(plu_no, session_ref, units as usize, &actor.ledger_actor())
            .await?)
    }

    // -- queries -----------------------------------------------------------

    pub async fn check_gateway_status(&self) -> GatewayHealth {
        match self.dispatcher.gateway().status().await {
            Ok(status) => GatewayHealth {
                reachable: true,
                device_connected: status.connected,
                message: if status.connected {
                    "middleware connected to the dispenser".to_string()
                } else {
                    "middleware reachable but not connected to the serial port".to_string()
                },
                port: status.port,
                baudrate: status.baudrate,
            },
            Err(e) => GatewayHealth {
                reachable: false,
                device_connected: false,
                port: None,
                baudrate: None,
                message: e.to_string(),
            },
        }
    }

    /// Ingredients a cocktail would dispatch right now.
    pub fn cocktail_ingredients(&self, product_id: i64) -> Result<CocktailResolution, DispenseError> {
        let product = self.product(product_id)?;
        if !product.is_cocktail {
            return Err(DispenseError::NotCocktail(product.name));
        }
        Ok(self.resolver.resolve_cocktail(&product)?)
    }

    /// Sellable products that need the dispenser, by name.
    pub fn available_drinks(&self) -> Vec<Product> {
        let mut drinks: Vec<Product> = self
            .catalog
            .products()
            .into_iter()
            .filter(|p| p.is_dispenser_drink && p.needs_distributor && !p.is_ingredient_only)
            .collect();
        drinks.sort_by(|a, b| a.name.cmp(&b.name));
        drinks
    }

    // -- ledger ------------------------------------------------------------

    fn draft_for(&self, actor: &ActorContext) -> LedgerDraft {
        LedgerDraft {
            user_ref: actor.user_ref.clone(),
            employee_ref: actor.employee_ref.clone(),
            ..LedgerDraft::default()
        }
    }

    fn record_attempt(&self, draft: LedgerDraft) {
        if let Err(e) = self.ledger.record(&draft) {
            error!(
                plu = %draft.plu_no,
                success = draft.success,
                error = %e,
                "failed to record credit in ledger"
            );
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
