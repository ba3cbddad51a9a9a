//! Staged-transaction ledger for the capture session
//!
//! Converts "record a transaction" tool calls from the agent into staged
//! transactions awaiting user confirmation. Validation happens here, at the
//! boundary: a malformed call is acked with an error status and nothing is
//! staged, so the conversation continues uninterrupted.

use serde_json::json;

use crate::error::SessionError;
use crate::protocol::{ClientMessage, ToolCallRequest};

/// Opaque budget identifier owned by the host application
pub type BudgetId = u64;

/// A budget category known to the host application
#[derive(Debug, Clone)]
pub struct BudgetEntry {
    pub id: BudgetId,
    pub name: String,
}

/// Read-only catalog of budget categories, supplied by the caller at session
/// start. Never mutated by the pipeline.
#[derive(Debug, Clone, Default)]
pub struct BudgetCatalog {
    entries: Vec<BudgetEntry>,
}

impl BudgetCatalog {
    pub fn new(entries: Vec<BudgetEntry>) -> Self {
        Self { entries }
    }

    /// Case-insensitive exact name lookup
    pub fn resolve(&self, name: &str) -> Option<BudgetId> {
        self.entries
            .iter()
            .find(|entry| entry.name.eq_ignore_ascii_case(name))
            .map(|entry| entry.id)
    }
}

/// Where a staged transaction should land when confirmed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CategoryTarget {
    /// A matched budget category
    Budget(BudgetId),
    /// No category given, or no catalog match
    Daily,
    /// Explicitly left for the user to assign
    Unassigned,
}

/// A candidate ledger entry awaiting user confirmation, not yet persisted
#[derive(Debug, Clone, PartialEq)]
pub struct StagedTransaction {
    pub description: String,
    pub amount: f64,
    pub target: CategoryTarget,
}

/// Interprets tool calls and appends staged transactions
///
/// The staged list is append-only for the duration of a session and is
/// handed to the caller verbatim on finish or close.
#[derive(Debug, Default)]
pub struct ToolCallHandler {
    catalog: BudgetCatalog,
    staged: Vec<StagedTransaction>,
}

impl ToolCallHandler {
    pub fn new(catalog: BudgetCatalog) -> Self {
        Self {
            catalog,
            staged: Vec::new(),
        }
    }

    /// Validate and stage one tool call, producing the ack to send back.
    ///
    /// Accepted calls append exactly one staged transaction, in arrival
    /// order. Rejected calls stage nothing but still produce an ack so the
    /// agent knows the outcome.
    pub fn handle(&mut self, request: &ToolCallRequest) -> ClientMessage {
        if let Err(error) = validate(request) {
            log::warn!("Rejected tool call {}: {}", request.request_id, error);
            return ClientMessage::ToolResult {
                request_id: request.request_id.clone(),
                status: "error".to_string(),
                payload: Some(json!({ "reason": error.to_string() })),
            };
        }

        let target = match request.category.as_deref() {
            Some(name) => match self.catalog.resolve(name) {
                Some(id) => CategoryTarget::Budget(id),
                None => {
                    log::debug!("No budget match for category {:?}, staging as daily", name);
                    CategoryTarget::Daily
                }
            },
            None => CategoryTarget::Daily,
        };

        self.staged.push(StagedTransaction {
            description: request.description.trim().to_string(),
            amount: request.amount,
            target,
        });
        log::info!(
            "Staged transaction {} ({} total): {:?} {}",
            request.request_id,
            self.staged.len(),
            target,
            request.amount
        );

        ClientMessage::ToolResult {
            request_id: request.request_id.clone(),
            status: "ok".to_string(),
            payload: Some(json!({ "staged_count": self.staged.len() })),
        }
    }

    /// The staged transactions accumulated so far, in arrival order
    pub fn staged(&self) -> &[StagedTransaction] {
        &self.staged
    }

    /// Hand the accumulated list to the caller, consuming the handler
    pub fn into_staged(self) -> Vec<StagedTransaction> {
        self.staged
    }
}

/// Reject calls that cannot become a valid staged transaction
fn validate(request: &ToolCallRequest) -> Result<(), SessionError> {
    if request.description.trim().is_empty() {
        return Err(SessionError::MalformedToolCall(
            "description is empty".to_string(),
        ));
    }
    if !(request.amount > 0.0) {
        return Err(SessionError::MalformedToolCall(format!(
            "amount must be positive, got {}",
            request.amount
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(id: &str, description: &str, amount: f64, category: Option<&str>) -> ToolCallRequest {
        ToolCallRequest {
            request_id: id.to_string(),
            description: description.to_string(),
            amount,
            category: category.map(|c| c.to_string()),
        }
    }

    fn catalog() -> BudgetCatalog {
        BudgetCatalog::new(vec![
            BudgetEntry {
                id: 1,
                name: "Makan".to_string(),
            },
            BudgetEntry {
                id: 5,
                name: "Transportasi".to_string(),
            },
        ])
    }

    #[test]
    fn test_category_resolution_is_case_insensitive() {
        let mut handler = ToolCallHandler::new(catalog());
        handler.handle(&request("r1", "Nasi goreng", 20000.0, Some("makan")));
        handler.handle(&request("r2", "Ojek", 15000.0, Some("TRANSPORTASI")));

        assert_eq!(handler.staged()[0].target, CategoryTarget::Budget(1));
        assert_eq!(handler.staged()[1].target, CategoryTarget::Budget(5));
    }

    #[test]
    fn test_unknown_category_falls_back_to_daily() {
        let mut handler = ToolCallHandler::new(catalog());
        handler.handle(&request("r1", "Sepatu", 300000.0, Some("Belanja")));

        assert_eq!(handler.staged()[0].target, CategoryTarget::Daily);
    }

    #[test]
    fn test_absent_category_falls_back_to_daily() {
        let mut handler = ToolCallHandler::new(catalog());
        handler.handle(&request("r1", "Parkir", 2000.0, None));

        assert_eq!(handler.staged()[0].target, CategoryTarget::Daily);
    }

    #[test]
    fn test_negative_amount_rejected_with_error_ack() {
        let mut handler = ToolCallHandler::new(catalog());
        let ack = handler.handle(&request("r9", "Refund?", -500.0, None));

        assert!(handler.staged().is_empty());
        match ack {
            ClientMessage::ToolResult {
                request_id, status, ..
            } => {
                assert_eq!(request_id, "r9");
                assert_eq!(status, "error");
            }
            _ => panic!("Expected ToolResult"),
        }
    }

    #[test]
    fn test_zero_amount_rejected() {
        let mut handler = ToolCallHandler::new(catalog());
        handler.handle(&request("r1", "Gratis", 0.0, None));
        assert!(handler.staged().is_empty());
    }

    #[test]
    fn test_blank_description_rejected() {
        let mut handler = ToolCallHandler::new(catalog());
        let ack = handler.handle(&request("r1", "   ", 5000.0, None));

        assert!(handler.staged().is_empty());
        match ack {
            ClientMessage::ToolResult { status, .. } => assert_eq!(status, "error"),
            _ => panic!("Expected ToolResult"),
        }
    }

    #[test]
    fn test_accepted_call_acks_ok_with_request_id() {
        let mut handler = ToolCallHandler::new(catalog());
        let ack = handler.handle(&request("r1", "Ojek", 15000.0, Some("transportasi")));

        match ack {
            ClientMessage::ToolResult {
                request_id, status, ..
            } => {
                assert_eq!(request_id, "r1");
                assert_eq!(status, "ok");
            }
            _ => panic!("Expected ToolResult"),
        }
        assert_eq!(
            handler.staged(),
            &[StagedTransaction {
                description: "Ojek".to_string(),
                amount: 15000.0,
                target: CategoryTarget::Budget(5),
            }]
        );
    }

    #[test]
    fn test_staged_order_is_arrival_order() {
        let mut handler = ToolCallHandler::new(catalog());
        handler.handle(&request("r1", "Kopi", 25000.0, Some("makan")));
        handler.handle(&request("r2", "Bensin", 50000.0, None));
        handler.handle(&request("r3", "Bad", -1.0, None));
        handler.handle(&request("r4", "Ojek", 15000.0, Some("transportasi")));

        let descriptions: Vec<&str> = handler
            .staged()
            .iter()
            .map(|t| t.description.as_str())
            .collect();
        assert_eq!(descriptions, vec!["Kopi", "Bensin", "Ojek"]);
    }

    #[test]
    fn test_into_staged_hands_list_verbatim() {
        let mut handler = ToolCallHandler::new(catalog());
        handler.handle(&request("r1", "Kopi", 25000.0, None));

        let staged = handler.into_staged();
        assert_eq!(staged.len(), 1);
        assert_eq!(staged[0].description, "Kopi");
    }
}
