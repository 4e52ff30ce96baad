//! Tax, AppliedTax.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Tax {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub code: String,
    pub rate_percent: Decimal,
    pub applied_to_organization: bool,
}

/// `AppliedTax(taxable_type, taxable_id)` is polymorphic in the source
/// store; the domain decodes the discriminator into this tagged enum
/// (design note), rather than threading a raw string through
/// calculation code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Taxable {
    Fee(Uuid),
    Invoice(Uuid),
    AddOn(Uuid),
}

impl Taxable {
    pub fn type_tag(&self) -> &'static str {
        match self {
            Taxable::Fee(_) => "fee",
            Taxable::Invoice(_) => "invoice",
            Taxable::AddOn(_) => "add_on",
        }
    }

    pub fn id(&self) -> Uuid {
        match self {
            Taxable::Fee(id) | Taxable::Invoice(id) | Taxable::AddOn(id) => *id,
        }
    }

    pub fn from_parts(type_tag: &str, id: Uuid) -> Option<Taxable> {
        match type_tag {
            "fee" => Some(Taxable::Fee(id)),
            "invoice" => Some(Taxable::Invoice(id)),
            "add_on" => Some(Taxable::AddOn(id)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct AppliedTax {
    pub id: Uuid,
    pub tax_id: Uuid,
    pub taxable_type: String,
    pub taxable_id: Uuid,
}

impl AppliedTax {
    pub fn taxable(&self) -> Option<Taxable> {
        Taxable::from_parts(&self.taxable_type, self.taxable_id)
    }
}
