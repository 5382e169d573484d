//! Record validation: mandatory fields and business key checks.
//!
//! A record that fails here is never pushed or imported; the queue entry is
//! skipped with the error text as the reason.

use crate::entity::{Contract, Counterparty, CounterpartyKind, EntityBody, Order, Organization, Product};
use crate::error::ValidationError;

const INN10_WEIGHTS: [u32; 9] = [2, 4, 10, 3, 5, 9, 4, 6, 8];
const INN12_WEIGHTS_11: [u32; 10] = [7, 2, 4, 10, 3, 5, 9, 4, 6, 8];
const INN12_WEIGHTS_12: [u32; 11] = [3, 7, 2, 4, 10, 3, 5, 9, 4, 6, 8];

/// Validate a typed body before it crosses to the other side.
pub fn validate_body(body: &EntityBody) -> Result<(), ValidationError> {
    match body {
        EntityBody::Organization(o) => validate_organization(o),
        EntityBody::Counterparty(c) => validate_counterparty(c),
        EntityBody::Contract(c) => validate_contract(c),
        EntityBody::Product(p) => validate_product(p),
        EntityBody::Order(o) => validate_order(o),
    }
}

/// Check a Russian taxpayer number (INN): 10 digits for legal entities,
/// 12 for individuals, with control digits.
pub fn validate_tax_id(tax_id: &str) -> Result<(), ValidationError> {
    let malformed = || ValidationError::MalformedTaxId(tax_id.to_string());

    let digits: Vec<u32> = tax_id
        .chars()
        .map(|c| c.to_digit(10))
        .collect::<Option<Vec<_>>>()
        .ok_or_else(malformed)?;

    match digits.len() {
        10 => {
            if control_digit(&digits[..9], &INN10_WEIGHTS) != digits[9] {
                return Err(malformed());
            }
        }
        12 => {
            if control_digit(&digits[..10], &INN12_WEIGHTS_11) != digits[10]
                || control_digit(&digits[..11], &INN12_WEIGHTS_12) != digits[11]
            {
                return Err(malformed());
            }
        }
        _ => return Err(malformed()),
    }

    Ok(())
}

fn control_digit(digits: &[u32], weights: &[u32]) -> u32 {
    let sum: u32 = digits.iter().zip(weights).map(|(d, w)| d * w).sum();
    (sum % 11) % 10
}

fn require(value: &str, field: &'static str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Err(ValidationError::MissingField(field));
    }
    Ok(())
}

fn non_negative(value: i64, field: &'static str) -> Result<(), ValidationError> {
    if value < 0 {
        return Err(ValidationError::InvalidValue {
            field,
            reason: format!("must not be negative, got {value}"),
        });
    }
    Ok(())
}

fn validate_organization(o: &Organization) -> Result<(), ValidationError> {
    require(&o.name, "name")?;
    require(&o.tax_id, "tax_id")?;
    validate_tax_id(o.tax_id.trim())?;

    if let Some(kpp) = &o.kpp {
        if kpp.len() != 9 || !kpp.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(ValidationError::InvalidValue {
                field: "kpp",
                reason: format!("expected 9 alphanumeric characters, got {kpp:?}"),
            });
        }
    }
    Ok(())
}

fn validate_counterparty(c: &Counterparty) -> Result<(), ValidationError> {
    require(&c.name, "name")?;

    if let Some(tax_id) = c.tax_id.as_deref().map(str::trim).filter(|t| !t.is_empty()) {
        validate_tax_id(tax_id)?;
        let expected = match c.kind {
            CounterpartyKind::LegalEntity => 10,
            CounterpartyKind::Individual => 12,
        };
        if tax_id.len() != expected {
            return Err(ValidationError::MalformedTaxId(tax_id.to_string()));
        }
    }

    if let Some(email) = &c.email {
        if !email.contains('@') {
            return Err(ValidationError::InvalidValue {
                field: "email",
                reason: format!("not an address: {email:?}"),
            });
        }
    }
    Ok(())
}

fn validate_contract(c: &Contract) -> Result<(), ValidationError> {
    require(&c.number, "number")?;
    non_negative(c.amount_cents, "amount")?;

    if let Some(date) = &c.signed_on {
        if !is_iso_date(date) {
            return Err(ValidationError::InvalidValue {
                field: "signed_on",
                reason: format!("expected YYYY-MM-DD, got {date:?}"),
            });
        }
    }
    Ok(())
}

fn validate_product(p: &Product) -> Result<(), ValidationError> {
    require(&p.sku, "sku")?;
    require(&p.name, "name")?;
    non_negative(p.price_cents, "price")
}

fn validate_order(o: &Order) -> Result<(), ValidationError> {
    require(&o.number, "number")?;
    non_negative(o.total_cents, "total")?;

    for line in &o.lines {
        if line.quantity <= 0 {
            return Err(ValidationError::InvalidValue {
                field: "quantity",
                reason: format!("order line quantity must be positive, got {}", line.quantity),
            });
        }
        non_negative(line.price_cents, "line price")?;
    }
    Ok(())
}

fn is_iso_date(s: &str) -> bool {
    let bytes = s.as_bytes();
    if bytes.len() != 10 || bytes[4] != b'-' || bytes[7] != b'-' {
        return false;
    }
    let digits_ok = bytes
        .iter()
        .enumerate()
        .all(|(i, b)| i == 4 || i == 7 || b.is_ascii_digit());
    if !digits_ok {
        return false;
    }
    let month: u32 = s[5..7].parse().unwrap_or(0);
    let day: u32 = s[8..10].parse().unwrap_or(0);
    (1..=12).contains(&month) && (1..=31).contains(&day)
}
