use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::model::{CustomerKind, CustomerSnapshot};

#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("identity store unavailable: {0}")]
    Unavailable(String),
    #[error("contact needs an email, a phone number or a name")]
    NoContact,
}

/// Contact details as supplied by the customer, not yet normalized.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactDetails {
    pub name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
}

/// Trimmed, lowercased email. `None` for blank input.
pub fn normalize_email(email: &str) -> Option<String> {
    let e = email.trim().to_lowercase();
    (!e.is_empty()).then_some(e)
}

/// Phone number with spaces, dashes and parentheses stripped. `None` for blank input.
pub fn normalize_phone(phone: &str) -> Option<String> {
    let p: String = phone
        .chars()
        .filter(|c| !matches!(c, ' ' | '-' | '(' | ')'))
        .collect();
    (!p.is_empty()).then_some(p)
}

#[async_trait]
pub trait IdentityResolver: Send + Sync {
    /// Resolve contact details to a stable identity. Idempotent per email;
    /// contacts without email get a fresh anonymous identity.
    async fn resolve(&self, contact: &ContactDetails) -> Result<CustomerSnapshot, IdentityError>;

    async fn get(&self, id: Ulid) -> Result<Option<CustomerSnapshot>, IdentityError>;
}

#[derive(Default)]
pub struct InMemoryDirectory {
    by_id: DashMap<Ulid, CustomerSnapshot>,
    by_email: DashMap<String, Ulid>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

#[async_trait]
impl IdentityResolver for InMemoryDirectory {
    async fn resolve(&self, contact: &ContactDetails) -> Result<CustomerSnapshot, IdentityError> {
        let email = contact.email.as_deref().and_then(normalize_email);
        let phone = contact.phone.as_deref().and_then(normalize_phone);
        let name = contact.name.trim().to_string();

        let Some(email) = email else {
            if phone.is_none() && name.is_empty() {
                return Err(IdentityError::NoContact);
            }
            let customer = CustomerSnapshot {
                id: Ulid::new(),
                kind: CustomerKind::Anonymous,
                name,
                email: None,
                phone,
            };
            self.by_id.insert(customer.id, customer.clone());
            return Ok(customer);
        };

        // The entry guard serializes concurrent first-time resolutions of one email.
        let entry = self.by_email.entry(email.clone()).or_insert_with(|| {
            let customer = CustomerSnapshot {
                id: Ulid::new(),
                kind: CustomerKind::Registered,
                name: name.clone(),
                email: Some(email.clone()),
                phone: phone.clone(),
            };
            let id = customer.id;
            self.by_id.insert(id, customer);
            id
        });
        let id = *entry.value();
        drop(entry);

        self.by_id
            .get(&id)
            .map(|c| c.value().clone())
            .ok_or_else(|| IdentityError::Unavailable(format!("dangling identity {id}")))
    }

    async fn get(&self, id: Ulid) -> Result<Option<CustomerSnapshot>, IdentityError> {
        Ok(self.by_id.get(&id).map(|c| c.value().clone()))
    }
}
