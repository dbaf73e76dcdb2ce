//! Human-readable size strings.

use crate::SpecError;

/// Parse a memory/disk size such as `"4GiB"`, `"512m"` or `"1073741824"`.
///
/// Units are case-insensitive and always binary (`1k == 1024`). An empty or
/// all-whitespace string is zero.
pub fn parse_ram_size(input: &str) -> Result<u64, SpecError> {
    let s = input.trim();
    if s.is_empty() {
        return Ok(0);
    }

    let split = s
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(s.len());
    let (number, unit) = s.split_at(split);

    let value: f64 = number
        .parse()
        .map_err(|_| SpecError::InvalidSize(input.to_string()))?;
    if !value.is_finite() || value < 0.0 {
        return Err(SpecError::InvalidSize(input.to_string()));
    }

    let multiplier: u64 = match unit.trim().to_ascii_lowercase().as_str() {
        "" | "b" => 1,
        "k" | "kb" | "kib" => 1 << 10,
        "m" | "mb" | "mib" => 1 << 20,
        "g" | "gb" | "gib" => 1 << 30,
        "t" | "tb" | "tib" => 1 << 40,
        "p" | "pb" | "pib" => 1 << 50,
        _ => return Err(SpecError::InvalidSize(input.to_string())),
    };

    Ok((value * multiplier as f64) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("", 0)]
    #[case("0", 0)]
    #[case("1024", 1024)]
    #[case("4GiB", 4 << 30)]
    #[case("4g", 4 << 30)]
    #[case("512MB", 512 << 20)]
    #[case("1.5k", 1536)]
    #[case(" 20 GiB ", 20 << 30)]
    fn parses_sizes(#[case] input: &str, #[case] expected: u64) {
        assert_eq!(parse_ram_size(input).unwrap(), expected);
    }

    #[rstest]
    #[case("lots")]
    #[case("4 furlongs")]
    #[case("GiB")]
    #[case("-1g")]
    fn rejects_garbage(#[case] input: &str) {
        assert!(matches!(
            parse_ram_size(input),
            Err(SpecError::InvalidSize(_))
        ));
    }
}
