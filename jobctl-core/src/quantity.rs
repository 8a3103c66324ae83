//! Kubernetes resource quantity parsing
//!
//! Only the subset used for CPU and memory: a non-negative decimal number
//! followed by an optional SI or binary suffix (`500m`, `2`, `0.5`, `512Mi`,
//! `1G`). Metrics API values (`12345n`, `300u`) parse as well.

/// Parses a quantity into base units (cores for CPU, bytes for memory)
pub fn parse_quantity(raw: &str) -> Result<f64, String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err("quantity is empty".to_string());
    }

    let split = raw
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(raw.len());
    let (number, suffix) = raw.split_at(split);

    if number.is_empty() || number.matches('.').count() > 1 || number == "." {
        return Err(format!("'{}' is not a valid quantity", raw));
    }

    let value: f64 = number
        .parse()
        .map_err(|_| format!("'{}' is not a valid quantity", raw))?;

    let multiplier = match suffix {
        "" => 1.0,
        "n" => 1e-9,
        "u" => 1e-6,
        "m" => 1e-3,
        "k" => 1e3,
        "M" => 1e6,
        "G" => 1e9,
        "T" => 1e12,
        "P" => 1e15,
        "E" => 1e18,
        "Ki" => 1024.0,
        "Mi" => 1024.0_f64.powi(2),
        "Gi" => 1024.0_f64.powi(3),
        "Ti" => 1024.0_f64.powi(4),
        "Pi" => 1024.0_f64.powi(5),
        "Ei" => 1024.0_f64.powi(6),
        other => return Err(format!("unknown quantity suffix '{}'", other)),
    };

    Ok(value * multiplier)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cpu_quantities() {
        assert_eq!(parse_quantity("2").unwrap(), 2.0);
        assert_eq!(parse_quantity("500m").unwrap(), 0.5);
        assert_eq!(parse_quantity("0.25").unwrap(), 0.25);
        assert!((parse_quantity("250000000n").unwrap() - 0.25).abs() < 1e-12);
    }

    #[test]
    fn test_memory_quantities() {
        assert_eq!(parse_quantity("512Mi").unwrap(), 512.0 * 1024.0 * 1024.0);
        assert_eq!(parse_quantity("1G").unwrap(), 1e9);
        assert_eq!(parse_quantity("1024").unwrap(), 1024.0);
    }

    #[test]
    fn test_invalid_quantities() {
        assert!(parse_quantity("").is_err());
        assert!(parse_quantity("lots").is_err());
        assert!(parse_quantity("-1").is_err());
        assert!(parse_quantity("1.2.3").is_err());
        assert!(parse_quantity("12Qi").is_err());
        assert!(parse_quantity("Mi").is_err());
    }
}
