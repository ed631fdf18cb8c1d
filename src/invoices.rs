use async_trait::async_trait;
use dashmap::DashMap;
use ulid::Ulid;

#[derive(Debug, thiserror::Error)]
#[error("invoice ledger unavailable: {0}")]
pub struct LedgerError(pub String);

/// Financial records that depend on a booking. A booking with any of these
/// may be cancelled but never deleted.
#[async_trait]
pub trait InvoiceLedger: Send + Sync {
    async fn has_invoices(&self, booking_id: Ulid) -> Result<bool, LedgerError>;
}

#[derive(Default)]
pub struct InMemoryLedger {
    invoices: DashMap<Ulid, Vec<Ulid>>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an issued invoice against a booking; returns the invoice id.
    pub fn record_invoice(&self, booking_id: Ulid) -> Ulid {
        let invoice_id = Ulid::new();
        self.invoices.entry(booking_id).or_default().push(invoice_id);
        invoice_id
    }
}

#[async_trait]
impl InvoiceLedger for InMemoryLedger {
    async fn has_invoices(&self, booking_id: Ulid) -> Result<bool, LedgerError> {
        Ok(self
            .invoices
            .get(&booking_id)
            .is_some_and(|v| !v.is_empty()))
    }
}
