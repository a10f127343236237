//! Credit ledger.
//!
//! Append-mostly audit trail of every credit dispatch attempt, stored in the
//! `credit_log` table. Rows are never deleted. Successful credits enter the
//! lifecycle as `sent`; failed attempts are kept for audit with no status and
//! are therefore never eligible for reversal.
//!
//! **Lifecycle:**
//! - `sent -> cancelled` (reversal engine, compare-and-set)
//! - `sent -> served`, `sent|served -> refunded` (external bookkeeping)
//!
//! Reversal lookups are newest-first by creation time, insertion id breaking
//! ties.

use chrono::{SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;
use std::fmt;
use std::sync::{Arc, MutexGuard};
use tracing::{info, warn};
use uuid::Uuid;

use crate::db::DbState;
use crate::error::LedgerError;

const ENTRY_COLUMNS: &str = "id, user_ref, employee_ref, session_ref, order_line_ref, product_name,
     plu_no, quantity, server_no, success, status, credit_id, is_cancellation, message,
     response_payload, cancelled_at, cancelled_by, cancellation_response, created_at";

/// Product-name prefix of the linked record written for each reversal.
pub const CANCELLATION_PREFIX: &str = "CANCELLATION - ";

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Closed set of credit lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CreditStatus {
    Sent,
    Served,
    Cancelled,
    Refunded,
}

impl CreditStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CreditStatus::Sent => "sent",
            CreditStatus::Served => "served",
            CreditStatus::Cancelled => "cancelled",
            CreditStatus::Refunded => "refunded",
        }
    }

    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "sent" => Some(CreditStatus::Sent),
            "served" => Some(CreditStatus::Served),
            "cancelled" => Some(CreditStatus::Cancelled),
            "refunded" => Some(CreditStatus::Refunded),
            _ => None,
        }
    }
}

impl fmt::Display for CreditStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One persisted dispatch attempt.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LedgerEntry {
    pub id: i64,
    pub user_ref: String,
    pub employee_ref: Option<String>,
    pub session_ref: String,
    /// Weak reference: the order line may no longer exist.
    pub order_line_ref: Option<String>,
    pub product_name: String,
    pub plu_no: String,
    pub quantity: u32,
    pub server_no: u32,
    pub success: bool,
    /// `None` for failed attempts.
    pub status: Option<CreditStatus>,
    pub credit_id: Option<String>,
    pub is_cancellation: bool,
    pub message: String,
    pub response_payload: String,
    pub cancelled_at: Option<String>,
    pub cancelled_by: Option<String>,
    pub cancellation_response: Option<String>,
    pub created_at: String,
}

impl LedgerEntry {
    pub fn is_active(&self) -> bool {
        self.status == Some(CreditStatus::Sent)
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let status: Option<String> = row.get(10)?;
        Ok(Self {
            id: row.get(0)?,
            user_ref: row.get(1)?,
            employee_ref: row.get(2)?,
            session_ref: row.get(3)?,
            order_line_ref: row.get(4)?,
            product_name: row.get(5)?,
            plu_no: row.get(6)?,
            quantity: row.get(7)?,
            server_no: row.get(8)?,
            success: row.get(9)?,
            status: status.as_deref().and_then(CreditStatus::parse),
            credit_id: row.get(11)?,
            is_cancellation: row.get(12)?,
            message: row.get(13)?,
            response_payload: row.get(14)?,
            cancelled_at: row.get(15)?,
            cancelled_by: row.get(16)?,
            cancellation_response: row.get(17)?,
            created_at: row.get(18)?,
        })
    }
}

/// Fields supplied by the caller when recording a dispatch attempt.
#[derive(Debug, Clone, Default)]
pub struct LedgerDraft {
    pub user_ref: String,
    pub employee_ref: Option<String>,
    pub session_ref: String,
    pub order_line_ref: Option<String>,
    pub product_name: String,
    pub plu_no: String,
    pub quantity: u32,
    pub server_no: u32,
    pub success: bool,
    pub message: String,
    pub response_payload: String,
}

// ---------------------------------------------------------------------------
// Ledger
// ---------------------------------------------------------------------------

/// Handle over the shared credit log.
#[derive(Clone)]
pub struct CreditLedger {
    db: Arc<DbState>,
}

impl CreditLedger {
    pub fn new(db: Arc<DbState>) -> Self {
        Self { db }
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, LedgerError> {
        self.db.conn.lock().map_err(|_| LedgerError::Poisoned)
    }

    /// Persist a dispatch attempt. Successful attempts enter as `sent` with a
    /// fresh credit id; failed ones carry no status.
    pub fn record(&self, draft: &LedgerDraft) -> Result<LedgerEntry, LedgerError> {
        let conn = self.conn()?;
        let (status, credit_id) = if draft.success {
            (Some(CreditStatus::Sent), Some(new_credit_id()))
        } else {
            (None, None)
        };
        let id = insert_entry(&conn, draft, status, credit_id.as_deref(), false, &now())?;
        info!(
            entry_id = id,
            plu = %draft.plu_no,
            quantity = draft.quantity,
            success = draft.success,
            "credit recorded"
        );
        load(&conn, id)
    }

    /// Active (`sent`, non-cancellation) entries of an order line, newest first.
    pub fn find_active_for_line(&self, order_line_ref: &str) -> Result<Vec<LedgerEntry>, LedgerError> {
        let conn = self.conn()?;
        query_entries(
            &conn,
            "WHERE order_line_ref = ?1 AND status = 'sent' AND is_cancellation = 0",
            params![order_line_ref],
            None,
        )
    }

    /// Active entries of an order line for one PLU, newest first, at most `limit`.
    pub fn find_active_for_line_plu(
        &self,
        order_line_ref: &str,
        plu_no: &str,
        limit: usize,
    ) -> Result<Vec<LedgerEntry>, LedgerError> {
        let conn = self.conn()?;
        query_entries(
            &conn,
            "WHERE order_line_ref = ?1 AND plu_no = ?2 AND status = 'sent' AND is_cancellation = 0",
            params![order_line_ref, plu_no],
            Some(limit),
        )
    }

    /// Active entries of a PLU within a session, newest first, at most `limit`.
    pub fn find_active_for_plu(
        &self,
        plu_no: &str,
        session_ref: &str,
        limit: usize,
    ) -> Result<Vec<LedgerEntry>, LedgerError> {
        let conn = self.conn()?;
        query_entries(
            &conn,
            "WHERE plu_no = ?1 AND session_ref = ?2 AND status = 'sent' AND is_cancellation = 0",
            params![plu_no, session_ref],
            Some(limit),
        )
    }

    /// Every entry of a session, newest first.
    pub fn entries_for_session(&self, session_ref: &str) -> Result<Vec<LedgerEntry>, LedgerError> {
        let conn = self.conn()?;
        query_entries(&conn, "WHERE session_ref = ?1", params![session_ref], None)
    }

    pub fn get(&self, id: i64) -> Result<LedgerEntry, LedgerError> {
        let conn = self.conn()?;
        load(&conn, id)
    }

    /// `sent -> cancelled`. Fails with `InvalidTransition` when the entry is
    /// no longer `sent`, which is how a concurrent second reversal is detected.
    pub fn mark_cancelled(
        &self,
        id: i64,
        cancelled_by: &str,
        response: &str,
    ) -> Result<(), LedgerError> {
        let conn = self.conn()?;
        cancel_entry(&conn, id, cancelled_by, response, &now())
    }

    /// Cancel `original` and append its linked cancellation record in one
    /// transaction. Returns the cancellation record.
    pub fn record_reversal(
        &self,
        original: &LedgerEntry,
        actor: &LedgerActor,
        response: &str,
        message: &str,
    ) -> Result<LedgerEntry, LedgerError> {
        let conn = self.conn()?;
        let ts = now();

        conn.execute_batch("BEGIN IMMEDIATE")?;

        let result = (|| -> Result<i64, LedgerError> {
            cancel_entry(&conn, original.id, &actor.user_ref, response, &ts)?;
            let draft = LedgerDraft {
                user_ref: actor.user_ref.clone(),
                employee_ref: actor.employee_ref.clone(),
                session_ref: original.session_ref.clone(),
                order_line_ref: original.order_line_ref.clone(),
                product_name: format!("{CANCELLATION_PREFIX}{}", original.product_name),
                plu_no: original.plu_no.clone(),
                quantity: original.quantity,
                server_no: original.server_no,
                success: true,
                message: message.to_string(),
                response_payload: response.to_string(),
            };
            insert_entry(
                &conn,
                &draft,
                Some(CreditStatus::Cancelled),
                original.credit_id.as_deref(),
                true,
                &ts,
            )
        })();

        match result {
            Ok(id) => {
                if let Err(e) = conn.execute_batch("COMMIT") {
                    let _ = conn.execute_batch("ROLLBACK");
                    return Err(e.into());
                }
                info!(
                    original_id = original.id,
                    cancellation_id = id,
                    plu = %original.plu_no,
                    "credit reversed"
                );
                load(&conn, id)
            }
            Err(e) => {
                let _ = conn.execute_batch("ROLLBACK");
                Err(e)
            }
        }
    }

    /// `sent -> served`.
    pub fn mark_served(&self, id: i64) -> Result<(), LedgerError> {
        let conn = self.conn()?;
        transition(&conn, id, &[CreditStatus::Sent], CreditStatus::Served)
    }

    /// `sent|served -> refunded`.
    pub fn mark_refunded(&self, id: i64) -> Result<(), LedgerError> {
        let conn = self.conn()?;
        transition(
            &conn,
            id,
            &[CreditStatus::Sent, CreditStatus::Served],
            CreditStatus::Refunded,
        )
    }

    /// Attach a failed-reversal message to an entry that stays `sent`.
    pub fn annotate_failure(&self, id: i64, message: &str) -> Result<(), LedgerError> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE credit_log SET message = ?1 WHERE id = ?2",
            params![format!("cancellation failed: {message}"), id],
        )?;
        if changed == 0 {
            return Err(LedgerError::NotFound(id));
        }
        warn!(entry_id = id, error = %message, "credit reversal failed");
        Ok(())
    }
}

/// Who performed a reversal, as stored on the linked record.
#[derive(Debug, Clone, Default)]
pub struct LedgerActor {
    pub user_ref: String,
    pub employee_ref: Option<String>,
}

// ---------------------------------------------------------------------------
// SQL helpers
// ---------------------------------------------------------------------------

fn now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Opaque correlation token, `CRED-` followed by eight uppercase hex digits.
fn new_credit_id() -> String {
    let hex = Uuid::new_v4().simple().to_string();
    format!("CRED-{}", hex[..8].to_uppercase())
}

fn insert_entry(
    conn: &Connection,
    draft: &LedgerDraft,
    status: Option<CreditStatus>,
    credit_id: Option<&str>,
    is_cancellation: bool,
    created_at: &str,
) -> Result<i64, LedgerError> {
    conn.execute(
        "INSERT INTO credit_log (
            user_ref, employee_ref, session_ref, order_line_ref, product_name,
            plu_no, quantity, server_no, success, status, credit_id,
            is_cancellation, message, response_payload, created_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
        params![
            draft.user_ref,
            draft.employee_ref,
            draft.session_ref,
            draft.order_line_ref,
            draft.product_name,
            draft.plu_no,
            draft.quantity,
            draft.server_no,
            draft.success,
            status.map(|s| s.as_str()),
            credit_id,
            is_cancellation,
            draft.message,
            draft.response_payload,
            created_at,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

fn load(conn: &Connection, id: i64) -> Result<LedgerEntry, LedgerError> {
    conn.query_row(
        &format!("SELECT {ENTRY_COLUMNS} FROM credit_log WHERE id = ?1"),
        params![id],
        LedgerEntry::from_row,
    )
    .optional()?
    .ok_or(LedgerError::NotFound(id))
}

/// Run a filtered query in reversal order (newest first).
fn query_entries(
    conn: &Connection,
    where_clause: &str,
    params: impl rusqlite::Params,
    limit: Option<usize>,
) -> Result<Vec<LedgerEntry>, LedgerError> {
    let limit = limit.map(|n| format!("LIMIT {n}")).unwrap_or_default();
    let sql = format!(
        "SELECT {ENTRY_COLUMNS} FROM credit_log {where_clause}
         ORDER BY created_at DESC, id DESC {limit}"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params, LedgerEntry::from_row)?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

fn cancel_entry(
    conn: &Connection,
    id: i64,
    cancelled_by: &str,
    response: &str,
    ts: &str,
) -> Result<(), LedgerError> {
    let changed = conn.execute(
        "UPDATE credit_log SET
            status = 'cancelled',
            cancelled_at = ?1,
            cancelled_by = ?2,
            cancellation_response = ?3
         WHERE id = ?4 AND status = 'sent'",
        params![ts, cancelled_by, response, id],
    )?;
    if changed == 0 {
        return Err(rejected_transition(conn, id, CreditStatus::Cancelled));
    }
    Ok(())
}

fn transition(
    conn: &Connection,
    id: i64,
    from: &[CreditStatus],
    to: CreditStatus,
) -> Result<(), LedgerError> {
    let allowed: Vec<String> = from.iter().map(|s| format!("'{}'", s.as_str())).collect();
    let changed = conn.execute(
        &format!(
            "UPDATE credit_log SET status = ?1 WHERE id = ?2 AND status IN ({})",
            allowed.join(", ")
        ),
        params![to.as_str(), id],
    )?;
    if changed == 0 {
        return Err(rejected_transition(conn, id, to));
    }
    info!(entry_id = id, status = %to, "credit status updated");
    Ok(())
}

/// Build the error for a compare-and-set that matched no row.
fn rejected_transition(conn: &Connection, id: i64, to: CreditStatus) -> LedgerError {
    let current: Result<Option<Option<String>>, _> = conn
        .query_row(
            "SELECT status FROM credit_log WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )
        .optional();
    match current {
        Ok(None) => LedgerError::NotFound(id),
        Ok(Some(status)) => LedgerError::InvalidTransition {
            id,
            from: status.unwrap_or_else(|| "none".to_string()),
            to: to.as_str(),
        },
        Err(e) => LedgerError::Storage(e),
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    fn ledger() -> CreditLedger {
        CreditLedger::new(Arc::new(db::open_in_memory().unwrap()))
    }

    fn draft(line: Option<&str>, plu: &str, success: bool) -> LedgerDraft {
        LedgerDraft {
            user_ref: "user-1".into(),
            employee_ref: Some("emp-1".into()),
            session_ref: "session-1".into(),
            order_line_ref: line.map(str::to_string),
            product_name: "Mojito".into(),
            plu_no: plu.into(),
            quantity: 1,
            server_no: 3,
            success,
            message: String::new(),
            response_payload: String::new(),
        }
    }

    /// Insert with an explicit timestamp to control ordering.
    fn record_at(ledger: &CreditLedger, draft: &LedgerDraft, created_at: &str) -> i64 {
        let conn = ledger.conn().unwrap();
        insert_entry(
            &conn,
            draft,
            Some(CreditStatus::Sent),
            Some(&new_credit_id()),
            false,
            created_at,
        )
        .unwrap()
    }

    fn actor() -> LedgerActor {
        LedgerActor {
            user_ref: "user-2".into(),
            employee_ref: None,
        }
    }

    #[test]
    fn test_record_success_and_failure() {
        let ledger = ledger();
        let ok = ledger.record(&draft(Some("L1"), "7", true)).unwrap();
        assert_eq!(ok.status, Some(CreditStatus::Sent));
        let credit_id = ok.credit_id.clone().unwrap();
        assert!(credit_id.starts_with("CRED-"));
        assert_eq!(credit_id.len(), 13);
        assert_eq!(credit_id, credit_id.to_uppercase());

        let failed = ledger.record(&draft(Some("L1"), "7", false)).unwrap();
        assert!(!failed.success);
        assert_eq!(failed.status, None);
        assert_eq!(failed.credit_id, None);

        let active = ledger.find_active_for_line("L1").unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, ok.id);
    }

    #[test]
    fn test_newest_first_and_bounded() {
        let ledger = ledger();
        let d = draft(Some("L1"), "7", true);
        let ids: Vec<i64> = (1..=5)
            .map(|i| record_at(&ledger, &d, &format!("2026-03-01T10:00:0{i}.000000Z")))
            .collect();

        let by_line = ledger.find_active_for_line("L1").unwrap();
        let got: Vec<i64> = by_line.iter().map(|e| e.id).collect();
        assert_eq!(got, ids.iter().rev().copied().collect::<Vec<_>>());

        let two = ledger.find_active_for_plu("7", "session-1", 2).unwrap();
        assert_eq!(two.iter().map(|e| e.id).collect::<Vec<_>>(), vec![ids[4], ids[3]]);

        let two_line = ledger.find_active_for_line_plu("L1", "7", 2).unwrap();
        assert_eq!(two_line.len(), 2);
        assert_eq!(two_line[0].id, ids[4]);
    }

    #[test]
    fn test_ordering_uses_created_at_before_id() {
        let ledger = ledger();
        let d = draft(Some("L1"), "7", true);
        let late = record_at(&ledger, &d, "2026-03-01T10:00:09.000000Z");
        let early = record_at(&ledger, &d, "2026-03-01T10:00:01.000000Z");
        let got = ledger.find_active_for_plu("7", "session-1", 1).unwrap();
        assert_eq!(got[0].id, late);
        assert_ne!(got[0].id, early);
    }

    #[test]
    fn test_same_timestamp_breaks_tie_on_id() {
        let ledger = ledger();
        let d = draft(Some("L1"), "7", true);
        let ts = "2026-03-01T10:00:00.000000Z";
        let first = record_at(&ledger, &d, ts);
        let second = record_at(&ledger, &d, ts);
        let got = ledger.find_active_for_line("L1").unwrap();
        assert_eq!(got[0].id, second);
        assert_eq!(got[1].id, first);
    }

    #[test]
    fn test_mark_cancelled_is_compare_and_set() {
        let ledger = ledger();
        let entry = ledger.record(&draft(Some("L1"), "7", true)).unwrap();
        ledger.mark_cancelled(entry.id, "user-2", "OK").unwrap();

        let reloaded = ledger.get(entry.id).unwrap();
        assert_eq!(reloaded.status, Some(CreditStatus::Cancelled));
        assert_eq!(reloaded.cancelled_by.as_deref(), Some("user-2"));
        assert!(reloaded.cancelled_at.is_some());

        let again = ledger.mark_cancelled(entry.id, "user-2", "OK");
        assert!(matches!(
            again,
            Err(LedgerError::InvalidTransition { from, to: "cancelled", .. }) if from == "cancelled"
        ));
        assert!(matches!(
            ledger.mark_cancelled(999, "user-2", ""),
            Err(LedgerError::NotFound(999))
        ));
    }

    #[test]
    fn test_failed_attempt_cannot_be_cancelled() {
        let ledger = ledger();
        let failed = ledger.record(&draft(Some("L1"), "7", false)).unwrap();
        assert!(matches!(
            ledger.mark_cancelled(failed.id, "user-2", ""),
            Err(LedgerError::InvalidTransition { from, .. }) if from == "none"
        ));
    }

    #[test]
    fn test_record_reversal_links_entries() {
        let ledger = ledger();
        let original = ledger.record(&draft(Some("L1"), "7", true)).unwrap();
        let cancellation = ledger
            .record_reversal(&original, &actor(), "OK", "line deleted")
            .unwrap();

        assert!(cancellation.is_cancellation);
        assert_eq!(cancellation.credit_id, original.credit_id);
        assert_eq!(cancellation.status, Some(CreditStatus::Cancelled));
        assert_eq!(cancellation.product_name, "CANCELLATION - Mojito");
        assert_eq!(cancellation.order_line_ref.as_deref(), Some("L1"));

        let reloaded = ledger.get(original.id).unwrap();
        assert_eq!(reloaded.status, Some(CreditStatus::Cancelled));
        assert_eq!(reloaded.credit_id, original.credit_id);
        assert_eq!(reloaded.quantity, original.quantity);
        assert_eq!(reloaded.plu_no, original.plu_no);
        assert_eq!(ledger.entries_for_session("session-1").unwrap().len(), 2);
        assert!(ledger.find_active_for_line("L1").unwrap().is_empty());
    }

    #[test]
    fn test_record_reversal_rolls_back_on_stale_entry() {
        let ledger = ledger();
        let original = ledger.record(&draft(Some("L1"), "7", true)).unwrap();
        ledger.mark_cancelled(original.id, "other", "").unwrap();

        let result = ledger.record_reversal(&original, &actor(), "OK", "dup");
        assert!(matches!(result, Err(LedgerError::InvalidTransition { .. })));
        assert_eq!(ledger.entries_for_session("session-1").unwrap().len(), 1);
    }

    #[test]
    fn test_record_reversal_rolls_back_on_failed_commit() {
        let ledger = ledger();
        let original = ledger.record(&draft(Some("L1"), "7", true)).unwrap();
        // A deferred foreign key is only checked at COMMIT, which then fails.
        ledger
            .conn()
            .unwrap()
            .execute_batch(
                "CREATE TABLE reversal_audit (
                     entry_id INTEGER REFERENCES credit_log(id) DEFERRABLE INITIALLY DEFERRED
                 );
                 CREATE TRIGGER audit_cancellations AFTER INSERT ON credit_log
                 WHEN NEW.is_cancellation = 1
                 BEGIN INSERT INTO reversal_audit VALUES (-1); END;",
            )
            .unwrap();

        let result = ledger.record_reversal(&original, &actor(), "OK", "line deleted");
        assert!(matches!(result, Err(LedgerError::Storage(_))));
        assert!(ledger.conn().unwrap().is_autocommit());
        assert!(ledger.get(original.id).unwrap().is_active());
        assert_eq!(ledger.entries_for_session("session-1").unwrap().len(), 1);

        let next = ledger.record(&draft(Some("L2"), "8", true)).unwrap();
        assert!(next.is_active());
    }

    #[test]
    fn test_served_and_refunded_transitions() {
        let ledger = ledger();
        let a = ledger.record(&draft(None, "7", true)).unwrap();
        ledger.mark_served(a.id).unwrap();
        assert_eq!(ledger.get(a.id).unwrap().status, Some(CreditStatus::Served));
        assert!(ledger.mark_cancelled(a.id, "u", "").is_err());
        ledger.mark_refunded(a.id).unwrap();
        assert_eq!(ledger.get(a.id).unwrap().status, Some(CreditStatus::Refunded));
        assert!(ledger.mark_served(a.id).is_err());

        let b = ledger.record(&draft(None, "8", true)).unwrap();
        ledger.mark_refunded(b.id).unwrap();
        assert_eq!(ledger.get(b.id).unwrap().status, Some(CreditStatus::Refunded));
    }

    #[test]
    fn test_annotate_failure_keeps_entry_active() {
        let ledger = ledger();
        let entry = ledger.record(&draft(Some("L1"), "7", true)).unwrap();
        ledger.annotate_failure(entry.id, "timeout").unwrap();
        let reloaded = ledger.get(entry.id).unwrap();
        assert!(reloaded.is_active());
        assert_eq!(reloaded.message, "cancellation failed: timeout");
        assert!(matches!(
            ledger.annotate_failure(404, "x"),
            Err(LedgerError::NotFound(404))
        ));
    }
}
