//! Prefix arithmetic for carving subnets out of a network block.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Computes the `netnum`-th sub-prefix of `prefix` that is `newbits` longer.
///
/// Works for both address families: `cidr_subnet("2600:1f18:abcd:ef00::/56", 8, 1)`
/// yields `"2600:1f18:abcd:ef01::/64"`.
///
/// # Errors
///
/// Returns a description of the problem if the prefix cannot be parsed, the
/// new prefix length exceeds the address width, or `netnum` does not fit in
/// `newbits` bits.
pub fn cidr_subnet(prefix: &str, newbits: u8, netnum: u64) -> Result<String, String> {
    let (addr, len) = prefix
        .split_once('/')
        .ok_or_else(|| format!("'{prefix}' is not in CIDR notation"))?;
    let addr: IpAddr = addr
        .parse()
        .map_err(|e| format!("'{prefix}' has an invalid address: {e}"))?;
    let len: u32 = len
        .parse()
        .map_err(|e| format!("'{prefix}' has an invalid prefix length: {e}"))?;

    let width = match addr {
        IpAddr::V4(_) => 32,
        IpAddr::V6(_) => 128,
    };
    if len > width {
        return Err(format!("'{prefix}' has a prefix longer than {width} bits"));
    }
    let new_len = len + u32::from(newbits);
    if new_len > width {
        return Err(format!(
            "cannot extend /{len} by {newbits} bits: exceeds {width}-bit address"
        ));
    }
    if newbits < 64 && netnum >> newbits != 0 {
        return Err(format!("netnum {netnum} does not fit in {newbits} bits"));
    }

    let shift = width - new_len;
    match addr {
        IpAddr::V4(v4) => {
            let base = u32::from(v4) & mask_u32(len);
            let net = u32::try_from(netnum)
                .map_err(|_| format!("netnum {netnum} does not fit in an IPv4 address"))?;
            let value = base | net.checked_shl(shift).unwrap_or(0);
            Ok(format!("{}/{new_len}", Ipv4Addr::from(value)))
        }
        IpAddr::V6(v6) => {
            let base = u128::from(v6) & mask_u128(len);
            let value = base | u128::from(netnum).checked_shl(shift).unwrap_or(0);
            Ok(format!("{}/{new_len}", Ipv6Addr::from(value)))
        }
    }
}

fn mask_u32(len: u32) -> u32 {
    if len == 0 { 0 } else { u32::MAX << (32 - len) }
}

fn mask_u128(len: u32) -> u128 {
    if len == 0 { 0 } else { u128::MAX << (128 - len) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ipv6_subnets_of_a_56() {
        let block = "2600:1f18:abcd:ef00::/56";
        assert_eq!(
            cidr_subnet(block, 8, 0).as_deref(),
            Ok("2600:1f18:abcd:ef00::/64")
        );
        assert_eq!(
            cidr_subnet(block, 8, 1).as_deref(),
            Ok("2600:1f18:abcd:ef01::/64")
        );
        assert_eq!(
            cidr_subnet(block, 8, 255).as_deref(),
            Ok("2600:1f18:abcd:efff::/64")
        );
    }

    #[test]
    fn test_ipv4_subnet() {
        assert_eq!(
            cidr_subnet("10.0.0.0/16", 8, 3).as_deref(),
            Ok("10.0.3.0/24")
        );
        assert_eq!(cidr_subnet("10.0.0.0/16", 0, 0).as_deref(), Ok("10.0.0.0/16"));
    }

    #[test]
    fn test_host_bits_are_masked() {
        assert_eq!(
            cidr_subnet("10.0.77.1/16", 8, 1).as_deref(),
            Ok("10.0.1.0/24")
        );
    }

    #[test]
    fn test_invalid_inputs() {
        assert!(cidr_subnet("2600::", 8, 0).is_err());
        assert!(cidr_subnet("10.0.0.0/16", 8, 256).is_err());
        assert!(cidr_subnet("10.0.0.0/30", 8, 0).is_err());
        assert!(cidr_subnet("nope/8", 1, 0).is_err());
    }
}
