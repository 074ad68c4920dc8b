//! Unit text formatters and phase helpers for the metering points.

/// Cyclic phase sequence used to rotate a three-phase meter so that any
/// physical phase can be presented as logical L1.
const PHASE_ORDER: [&str; 5] = ["a", "b", "c", "a", "b"];

/// Physical phase letters shown as L1, L2 and L3 when `phase1` (1..=3) is
/// the configured reference phase.
pub fn phase_letters(phase1: i64) -> [&'static str; 3] {
    let p = phase1.clamp(1, 3) as usize - 1;
    [PHASE_ORDER[p], PHASE_ORDER[p + 1], PHASE_ORDER[p + 2]]
}

pub fn round1(v: f64) -> f64 {
    (v * 10.0).round() / 10.0
}

/// The meter reports energy in Wh, the bus wants kWh.
pub fn scale_energy(raw: f64) -> f64 {
    round1(raw / 1000.0)
}

pub fn unit_watt(v: f64) -> String {
    format!("{:.0}W", v)
}

pub fn unit_volt(v: f64) -> String {
    format!("{:.1}V", v)
}

pub fn unit_amp(v: f64) -> String {
    format!("{:.1}A", v)
}

pub fn unit_kwh(v: f64) -> String {
    format!("{:.2}kWh", v)
}

pub fn unit_product_id(v: f64) -> String {
    format!("0x{:X}", v as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_letters_permutations() {
        assert_eq!(phase_letters(1), ["a", "b", "c"]);
        assert_eq!(phase_letters(2), ["b", "c", "a"]);
        assert_eq!(phase_letters(3), ["c", "a", "b"]);
    }

    #[test]
    fn test_phase_letters_deterministic() {
        for p in 1..=3 {
            let first = phase_letters(p);
            assert_eq!(first, phase_letters(p));
            // Always a permutation of the three physical letters
            let mut sorted = first;
            sorted.sort();
            assert_eq!(sorted, ["a", "b", "c"]);
        }
    }

    #[test]
    fn test_scale_energy() {
        assert_eq!(scale_energy(4004.0), 4.0);
        assert_eq!(scale_energy(1234.0), 1.2);
        assert_eq!(scale_energy(1250.0), 1.3);
        assert_eq!(scale_energy(0.0), 0.0);
    }

    #[test]
    fn test_formatters() {
        assert_eq!(unit_watt(230.4), "230W");
        assert_eq!(unit_volt(229.96), "230.0V");
        assert_eq!(unit_amp(1.55), "1.6A");
        assert_eq!(unit_kwh(4.0), "4.00kWh");
        assert_eq!(unit_product_id(0xB034 as f64), "0xB034");
    }
}
