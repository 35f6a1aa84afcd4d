//! Precision arithmetic for exchange-facing values
//!
//! The exchange rejects any order whose price or quantity carries more
//! decimal digits than the instrument declares, so every outbound numeric
//! goes through `truncate` (round toward zero, never up).

/// Truncate `value` to `decimals` decimal digits without rounding.
pub fn truncate(value: f64, decimals: u32) -> f64 {
    let factor = 10f64.powi(decimals as i32);
    // the product can land an ulp below an exact decimal boundary
    // (100.0 - 1.1 * 2.0 scales to 9779.999...); settle it first
    let scaled = (value * factor * 1e9).round() / 1e9;
    scaled.trunc() / factor
}

/// Quantity of the base asset a margin slice can buy at `price`.
///
/// Initial margin = quantity x price / leverage, so the quantity the slice
/// controls is `margin * leverage / price`, truncated to the instrument's
/// quantity precision.
pub fn order_quantity(
    margin_pct: f64,
    equity: f64,
    leverage: u32,
    price: f64,
    quantity_precision: u32,
) -> f64 {
    if price <= 0.0 {
        return 0.0;
    }
    let margin = (margin_pct * equity) / 100.0;
    let quantity = (margin * leverage as f64) / price;
    truncate(quantity, quantity_precision)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_rounds_down() {
        assert_eq!(truncate(1.23456, 3), 1.234);
        assert_eq!(truncate(1.23999, 2), 1.23);
        assert_eq!(truncate(97.0, 2), 97.0);
    }

    #[test]
    fn test_truncate_absorbs_representation_error() {
        // 100.0 - 1.1 * 2.0 is a hair under 97.8 in binary
        assert_eq!(truncate(100.0 - 1.1 * 2.0, 2), 97.8);
        assert_eq!(truncate(97.0 - 1.1 * 2.0, 2), 94.8);
    }

    #[test]
    fn test_truncate_zero_decimals() {
        assert_eq!(truncate(123.987, 0), 123.0);
    }

    #[test]
    fn test_truncate_is_idempotent() {
        // applying the instrument precision twice must be a no-op
        for &value in &[0.1, 1.23456789, 42.000001, 19999.994, 0.00000123] {
            for precision in 0..8 {
                let once = truncate(value, precision);
                assert_eq!(truncate(once, precision), once);
            }
        }
    }

    #[test]
    fn test_order_quantity_sizing() {
        // 10% of 1000 USDT at 5x leverage buys 500 USDT worth;
        // at price 100 that is 5 base units
        assert_eq!(order_quantity(10.0, 1000.0, 5, 100.0, 3), 5.0);
    }

    #[test]
    fn test_order_quantity_truncates_to_precision() {
        // 333.333... units truncated to 2 decimals
        let qty = order_quantity(10.0, 1000.0, 10, 3.0, 2);
        assert_eq!(qty, 333.33);
    }

    #[test]
    fn test_order_quantity_zero_price() {
        assert_eq!(order_quantity(10.0, 1000.0, 5, 0.0, 3), 0.0);
    }
}
