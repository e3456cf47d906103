//! Wall-clock helpers. Bus timestamps are epoch seconds as f64 to match
//! the envelope wire format.

/// Current wall-clock time as fractional epoch seconds.
pub fn epoch_secs() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn epoch_is_monotone_enough() {
        let a = epoch_secs();
        let b = epoch_secs();
        assert!(b >= a);
        assert!(a > 1.5e9, "clock should be past 2017");
    }
}
