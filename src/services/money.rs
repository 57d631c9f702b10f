use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};

use crate::errors::ServiceError;

/// Decimal places of the currency's minor unit (ISO 4217).
pub fn minor_unit_exponent(currency: &str) -> u32 {
    match currency.to_ascii_uppercase().as_str() {
        "BIF" | "CLP" | "DJF" | "GNF" | "ISK" | "JPY" | "KMF" | "KRW" | "PYG" | "RWF" | "UGX"
        | "VND" | "VUV" | "XAF" | "XOF" | "XPF" => 0,
        "BHD" | "IQD" | "JOD" | "KWD" | "LYD" | "OMR" | "TND" => 3,
        _ => 2,
    }
}

/// Converts a major-unit amount into integer minor units, rounding half
/// away from zero.
pub fn to_minor_units(amount: Decimal, currency: &str) -> Result<i64, ServiceError> {
    let scale = Decimal::from(10_i64.pow(minor_unit_exponent(currency)));
    (amount * scale)
        .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
        .to_i64()
        .ok_or_else(|| ServiceError::ValidationError(format!("amount {} is out of range", amount)))
}

/// Parses a configured float into an exact decimal.
pub fn decimal_from_f64(value: f64) -> Decimal {
    value.to_string().parse().unwrap_or(Decimal::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn converts_by_currency_exponent() {
        assert_eq!(to_minor_units(dec!(10.005), "usd").unwrap(), 1001);
        assert_eq!(to_minor_units(dec!(1500), "JPY").unwrap(), 1500);
        assert_eq!(to_minor_units(dec!(1.2345), "KWD").unwrap(), 1235);
        assert_eq!(to_minor_units(dec!(50), "NGN").unwrap(), 5000);
    }

    #[test]
    fn float_config_values_are_exact() {
        assert_eq!(decimal_from_f64(0.08), dec!(0.08));
        assert_eq!(decimal_from_f64(5.0), dec!(5));
    }
}
