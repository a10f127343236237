//! Credit reversal.
//!
//! Compensates credits that were sent for order lines that were later
//! deleted or reduced. Each reversal sends a `-` credit mirroring the original
//! entry (same server, PLU and quantity), then cancels the original and
//! appends a linked cancellation record.
//!
//! **Rules:**
//! - Entries are reversed newest-first, one gateway session per entry.
//! - A failed reversal leaves the original `sent` and annotates it; no retry.
//! - An entry is claimed before dispatch and re-read under the claim, so a
//!   concurrent second reversal of the same entry is rejected without a
//!   second dispatch.

use serde::Serialize;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tracing::{error, info, warn};

use crate::dispatcher::{CreditDispatcher, LabeledCredit};
use crate::error::LedgerError;
use crate::gateway::{CreditTarget, Sign};
use crate::ledger::{CreditLedger, LedgerActor, LedgerEntry};
use crate::resolver::IngredientInfo;

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// Outcome of reversing one ledger entry.
#[derive(Debug, Clone, Serialize)]
pub struct ReversalOutcome {
    pub entry_id: i64,
    pub plu_no: String,
    pub quantity: u32,
    pub success: bool,
    pub message: String,
    /// Id of the linked cancellation record, when one was written.
    pub cancellation_id: Option<i64>,
}

/// Aggregate of a reversal request.
#[derive(Debug, Clone, Serialize)]
pub struct ReversalResult {
    /// No entry failed to reverse.
    pub success: bool,
    /// Number of entries selected for reversal.
    pub requested: usize,
    pub cancelled_count: usize,
    pub failed_count: usize,
    pub message: String,
    pub outcomes: Vec<ReversalOutcome>,
}

impl ReversalResult {
    fn from_outcomes(outcomes: Vec<ReversalOutcome>) -> Self {
        let requested = outcomes.len();
        let cancelled_count = outcomes.iter().filter(|o| o.success).count();
        let failed_count = requested - cancelled_count;
        let message = if requested == 0 {
            "no active credits to reverse".to_string()
        } else {
            format!("{cancelled_count}/{requested} credit(s) reversed")
        };
        Self {
            success: failed_count == 0,
            requested,
            cancelled_count,
            failed_count,
            message,
            outcomes,
        }
    }

    pub fn empty() -> Self {
        Self::from_outcomes(Vec::new())
    }

    /// Combine per-ingredient results into one.
    pub fn merge(results: impl IntoIterator<Item = ReversalResult>) -> Self {
        Self::from_outcomes(results.into_iter().flat_map(|r| r.outcomes).collect())
    }
}

/// Number of units a quantity change removes, `floor(old - new)`.
pub fn reduction_units(old_qty: f64, new_qty: f64) -> usize {
    if new_qty >= old_qty {
        return 0;
    }
    (old_qty - new_qty).floor() as usize
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Releases an entry claim when dropped.
struct Claim<'a> {
    claims: &'a Mutex<HashSet<i64>>,
    id: i64,
}

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        let mut claims = self.claims.lock().unwrap_or_else(|e| e.into_inner());
        claims.remove(&self.id);
    }
}

pub struct ReversalEngine {
    ledger: CreditLedger,
    dispatcher: Arc<CreditDispatcher>,
    in_flight: Mutex<HashSet<i64>>,
}

impl ReversalEngine {
    pub fn new(ledger: CreditLedger, dispatcher: Arc<CreditDispatcher>) -> Self {
        Self {
            ledger,
            dispatcher,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    fn claim(&self, id: i64) -> Option<Claim<'_>> {
        let mut claims = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        if !claims.insert(id) {
            return None;
        }
        Some(Claim {
            claims: &self.in_flight,
            id,
        })
    }

    /// Reverse every active entry of an order line (line deletion).
    pub async fn reverse_line_all(
        &self,
        line_ref: &str,
        actor: &LedgerActor,
    ) -> Result<ReversalResult, LedgerError> {
        let entries = self.ledger.find_active_for_line(line_ref)?;
        info!(line = %line_ref, count = entries.len(), "reversing all credits of line");
        Ok(self
            .reverse_entries(entries, actor, "reversed after order line deletion")
            .await)
    }

    /// Reverse the `floor(old - new)` newest entries of a line.
    pub async fn reverse_line_quantity(
        &self,
        line_ref: &str,
        old_qty: f64,
        new_qty: f64,
        actor: &LedgerActor,
    ) -> Result<ReversalResult, LedgerError> {
        let units = reduction_units(old_qty, new_qty);
        info!(line = %line_ref, old_qty, new_qty, units, "quantity reduction");
        self.reverse_line_newest(line_ref, units, actor).await
    }

    /// Reverse the `units` newest active entries of a line.
    pub async fn reverse_line_newest(
        &self,
        line_ref: &str,
        units: usize,
        actor: &LedgerActor,
    ) -> Result<ReversalResult, LedgerError> {
        if units == 0 {
            return Ok(ReversalResult::empty());
        }
        let mut entries = self.ledger.find_active_for_line(line_ref)?;
        entries.truncate(units);
        info!(line = %line_ref, selected = entries.len(), "reversing newest line credits");
        Ok(self
            .reverse_entries(entries, actor, "reversed after quantity reduction")
            .await)
    }

    /// Reverse up to `units` newest entries of a PLU within a session, for
    /// callers that have no line reference.
    pub async fn reverse_plu_in_session(
        &self,
        plu_no: &str,
        session_ref: &str,
        units: usize,
        actor: &LedgerActor,
    ) -> Result<ReversalResult, LedgerError> {
        let entries = self.ledger.find_active_for_plu(plu_no, session_ref, units)?;
        info!(
            plu = %plu_no,
            session = %session_ref,
            selected = entries.len(),
            "reversing session credits"
        );
        Ok(self
            .reverse_entries(entries, actor, "reversed on manual cancellation")
            .await)
    }

    /// Reverse a cocktail line ingredient by ingredient. `units` bounds the
    /// entries per ingredient; `None` reverses all of them.
    pub async fn reverse_cocktail_line(
        &self,
        line_ref: &str,
        ingredients: &[IngredientInfo],
        units: Option<usize>,
        actor: &LedgerActor,
    ) -> Result<ReversalResult, LedgerError> {
        let mut results = Vec::with_capacity(ingredients.len());
        for ingredient in ingredients {
            let entries = match units {
                Some(n) => self
                    .ledger
                    .find_active_for_line_plu(line_ref, &ingredient.plu_code, n)?,
                None => self
                    .ledger
                    .find_active_for_line(line_ref)?
                    .into_iter()
                    .filter(|e| e.plu_no == ingredient.plu_code)
                    .collect(),
            };
            results.push(
                self.reverse_entries(entries, actor, "cocktail ingredient reversed")
                    .await,
            );
        }
        let merged = ReversalResult::merge(results);
        info!(
            line = %line_ref,
            ingredients = ingredients.len(),
            cancelled = merged.cancelled_count,
            "cocktail reversal finished"
        );
        Ok(merged)
    }

    /// Reverse the given entries in order.
    pub async fn reverse_entries(
        &self,
        entries: Vec<LedgerEntry>,
        actor: &LedgerActor,
        reason: &str,
    ) -> ReversalResult {
        let mut outcomes = Vec::with_capacity(entries.len());
        for entry in entries {
            outcomes.push(self.reverse_one(&entry, actor, reason).await);
        }
        let result = ReversalResult::from_outcomes(outcomes);
        if result.failed_count > 0 {
            warn!(
                failed = result.failed_count,
                requested = result.requested,
                "partial reversal"
            );
        }
        result
    }

    async fn reverse_one(
        &self,
        entry: &LedgerEntry,
        actor: &LedgerActor,
        reason: &str,
    ) -> ReversalOutcome {
        let failed = |message: String| ReversalOutcome {
            entry_id: entry.id,
            plu_no: entry.plu_no.clone(),
            quantity: entry.quantity,
            success: false,
            message,
            cancellation_id: None,
        };

        let Some(_claim) = self.claim(entry.id) else {
            warn!(entry_id = entry.id, "credit already being reversed");
            return failed(
                LedgerError::InvalidTransition {
                    id: entry.id,
                    from: "sent (reversal in progress)".to_string(),
                    to: "cancelled",
                }
                .to_string(),
            );
        };

        // Re-read under the claim: another reversal may have finished meanwhile.
        let current = match self.ledger.get(entry.id) {
            Ok(current) => current,
            Err(e) => return failed(e.to_string()),
        };
        if !current.is_active() {
            let from = current
                .status
                .map(|s| s.to_string())
                .unwrap_or_else(|| "none".to_string());
            warn!(entry_id = entry.id, status = %from, "credit no longer active");
            return failed(
                LedgerError::InvalidTransition {
                    id: entry.id,
                    from,
                    to: "cancelled",
                }
                .to_string(),
            );
        }

        // Compensate the original credit: same server, PLU and quantity.
        let target = match CreditTarget::new(
            current.server_no,
            &current.plu_no,
            Sign::Plus,
            current.quantity,
        ) {
            Ok(t) => t.reversed(),
            Err(e) => {
                self.annotate(current.id, &e.to_string());
                return failed(e.to_string());
            }
        };

        let sent = self
            .dispatcher
            .dispatch_one(LabeledCredit::new(target, current.product_name.clone()))
            .await;
        if !sent.success {
            self.annotate(current.id, &sent.message);
            return failed(sent.message);
        }

        let cancellation_id = match self.ledger.record_reversal(&current, actor, &sent.response, reason) {
            Ok(record) => Some(record.id),
            Err(e) => {
                error!(entry_id = current.id, error = %e, "failed to record credit reversal");
                // The device already applied the reversal; at least retire the
                // original so it is never reversed a second time.
                if let Err(e) = self.ledger.mark_cancelled(current.id, &actor.user_ref, &sent.response) {
                    error!(entry_id = current.id, error = %e, "failed to cancel reversed credit");
                }
                None
            }
        };

        ReversalOutcome {
            entry_id: current.id,
            plu_no: current.plu_no.clone(),
            quantity: current.quantity,
            success: true,
            message: sent.message,
            cancellation_id,
        }
    }

    fn annotate(&self, id: i64, message: &str) {
        if let Err(e) = self.ledger.annotate_failure(id, message) {
            error!(entry_id = id, error = %e, "failed to annotate credit");
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
