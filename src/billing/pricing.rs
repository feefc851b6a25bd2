use std::str::FromStr;

use bigdecimal::{BigDecimal, Zero};
use tracing::warn;

use crate::config::FeeSchedule;
use crate::error::{BillingError, BillingResult};

use super::models::{attrs, LineItem, MembershipCategory, MembershipEntity, PriceResult};
use super::territory;

/// key: dues-pricing -> category rule tables
///
/// Pure and deterministic: the same entity attributes and fee schedule always
/// produce the same result. All I/O happens before or after this call.
pub fn resolve_price(
    entity: &MembershipEntity,
    fees: &FeeSchedule,
) -> BillingResult<PriceResult> {
    let category = entity.category().ok_or_else(|| {
        BillingError::pricing(format!(
            "unknown membership type {:?} for entity {}",
            entity.category_label(),
            entity.id()
        ))
    })?;

    match category {
        MembershipCategory::Distributor => distributor_price(entity, fees),
        MembershipCategory::Manufacturer => manufacturer_price(entity, fees),
        MembershipCategory::ServiceProvider => Ok(flat_price(
            "Service provider membership dues",
            "Annual service provider membership",
            &fees.service_provider,
            fees,
        )),
        MembershipCategory::Individual => Ok(flat_price(
            "Individual membership dues",
            "Annual individual membership",
            &fees.individual,
            fees,
        )),
    }
}

fn distributor_price(entity: &MembershipEntity, fees: &FeeSchedule) -> BillingResult<PriceResult> {
    let home = entity.attribute(attrs::HOME_STATE).unwrap_or_default();
    let lists = [
        entity.attribute(attrs::DOMESTIC_STATES).unwrap_or_default(),
        entity.attribute(attrs::PROVINCES).unwrap_or_default(),
        entity
            .attribute(attrs::NON_DOMESTIC_TERRITORIES)
            .unwrap_or_default(),
    ];
    let (billable, _excluded) = territory::partition_billable(&lists, home);

    let mut line_items = vec![
        LineItem {
            name: "Distributor membership dues".to_string(),
            quantity: 1,
            unit_price: fees.distributor_base.clone(),
            description: "Annual distributor base fee".to_string(),
            product_ref: fees.dues_product_ref.clone(),
        },
        LineItem {
            name: "Home territory".to_string(),
            quantity: 1,
            unit_price: BigDecimal::zero(),
            description: format!(
                "Home territory {} (not billed)",
                territory::normalize(home)
            ),
            product_ref: None,
        },
    ];
    if !billable.is_empty() {
        line_items.push(LineItem {
            name: "Additional territories".to_string(),
            quantity: billable.len() as i64,
            unit_price: fees.per_territory.clone(),
            description: format!("Billable territories: {}", billable.join(", ")),
            product_ref: fees.dues_product_ref.clone(),
        });
    }
    Ok(PriceResult::from_line_items(line_items))
}

fn manufacturer_price(entity: &MembershipEntity, fees: &FeeSchedule) -> BillingResult<PriceResult> {
    let (fee, description) = match entity.attribute(attrs::SALES_TIER) {
        None => {
            warn!(
                entity_id = entity.id(),
                entity_name = entity.name(),
                "manufacturer has no sales tier label; using default fee"
            );
            (
                fees.manufacturer_default.clone(),
                "Annual manufacturer membership (default tier)".to_string(),
            )
        }
        Some(label) => {
            let fee = parse_fee_label(label).ok_or_else(|| {
                BillingError::pricing(format!(
                    "unparsable sales tier label {label:?} for entity {}",
                    entity.id()
                ))
            })?;
            if fee <= BigDecimal::zero() {
                return Err(BillingError::pricing(format!(
                    "non-positive fee in sales tier label {label:?} for entity {}",
                    entity.id()
                )));
            }
            (fee, format!("Annual manufacturer membership, tier {label}"))
        }
    };
    Ok(PriceResult::from_line_items(vec![LineItem {
        name: "Manufacturer membership dues".to_string(),
        quantity: 1,
        unit_price: fee,
        description,
        product_ref: fees.dues_product_ref.clone(),
    }]))
}

fn flat_price(name: &str, description: &str, fee: &BigDecimal, fees: &FeeSchedule) -> PriceResult {
    PriceResult::from_line_items(vec![LineItem {
        name: name.to_string(),
        quantity: 1,
        unit_price: fee.clone(),
        description: description.to_string(),
        product_ref: fees.dues_product_ref.clone(),
    }])
}

/// Extract the leading dollar amount from a tier label such as
/// `"$5,000 (<$25M)"`: everything before the first `(`, with `$` and `,`
/// stripped. Returns None when the remainder is not a number.
pub fn parse_fee_label(label: &str) -> Option<BigDecimal> {
    let head = label.split('(').next().unwrap_or(label);
    let cleaned = head.replace(['$', ','], "");
    let cleaned = cleaned.trim();
    if cleaned.is_empty() {
        return None;
    }
    BigDecimal::from_str(cleaned).ok()
}
