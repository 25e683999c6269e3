//! Duration grammar for `MAX_UPTIME`: an optional sequence of `Nd Nh Nm Ns
//! Nms` components, or bare digits read as milliseconds.

/// Parse a duration string into milliseconds. Returns `None` on anything
/// that isn't a run of `<digits><unit>` components (or bare digits).
pub fn parse_duration(s: &str) -> Option<i64> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    if s.bytes().all(|b| b.is_ascii_digit()) {
        return s.parse::<i64>().ok();
    }

    const UNITS: [(&str, i64); 5] = [
        ("ms", 1),
        ("d", 86_400_000),
        ("h", 3_600_000),
        ("m", 60_000),
        ("s", 1_000),
    ];

    let mut rest = s;
    let mut total: i64 = 0;
    while !rest.is_empty() {
        let digits = rest.bytes().take_while(u8::is_ascii_digit).count();
        if digits == 0 {
            return None;
        }
        let (num, after_num) = rest.split_at(digits);
        let num: i64 = num.parse().ok()?;

        let (unit_len, mult) = UNITS
            .iter()
            .find_map(|(unit, mult)| after_num.starts_with(unit).then_some((unit.len(), *mult)))?;
        total += num * mult;
        rest = &after_num[unit_len..];
    }
    Some(total)
}
