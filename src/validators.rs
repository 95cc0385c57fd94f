//! Input validation for rule files and inventory data.
//!
//! This module centralizes the checks that keep generated iptables commands
//! syntactically and semantically well-formed: port ranges, guest interface
//! references, group and chain names, MAC addresses, bridge names.

/// Longest chain name iptables accepts.
pub const CHAIN_NAME_MAX: usize = 28;

/// Highest guest interface index (`net0`..`net31`).
pub const IFACE_MAX_INDEX: u32 = 31;

/// Longest security-group name such that `GROUP-<name>-OUT` still fits a
/// chain name.
pub const GROUP_NAME_MAX: usize = CHAIN_NAME_MAX - "GROUP-".len() - "-OUT".len();

/// Validates a single port number. Port 0 is reserved and rejected.
pub fn validate_port(port: u32) -> Result<u16, String> {
    if port == 0 || port > 65535 {
        Err(format!("port '{port}' must be between 1 and 65535"))
    } else {
        Ok(port as u16)
    }
}

/// Validates a `lo:hi` port range.
pub fn validate_port_range(start: u32, end: u32) -> Result<(u16, u16), String> {
    let start = validate_port(start)?;
    let end = validate_port(end)?;
    if start > end {
        Err(format!("invalid port range '{start}:{end}'"))
    } else {
        Ok((start, end))
    }
}

/// Validates a guest interface reference (`net0`..`net31`) and returns its
/// index.
pub fn validate_iface_ref(name: &str) -> Result<u32, String> {
    let index = name
        .strip_prefix("net")
        .and_then(|n| n.parse::<u32>().ok())
        .ok_or_else(|| format!("invalid interface name '{name}'"))?;
    if index > IFACE_MAX_INDEX {
        return Err(format!(
            "interface index out of range '{name}' (max net{IFACE_MAX_INDEX})"
        ));
    }
    Ok(index)
}

/// Validates a security-group name. The bound keeps the derived chain names
/// within the kernel's chain-name limit.
pub fn validate_group_name(name: &str) -> Result<(), String> {
    if name.is_empty() {
        return Err("group name cannot be empty".to_string());
    }
    if name.len() > GROUP_NAME_MAX {
        return Err(format!(
            "group name '{name}' too long (max {GROUP_NAME_MAX} chars)"
        ));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_'))
    {
        return Err(format!("group name '{name}' contains invalid characters"));
    }
    Ok(())
}

/// Validates a chain name against the kernel's constraints.
pub fn validate_chain_name(name: &str) -> Result<(), String> {
    if name.is_empty() {
        return Err("chain name cannot be empty".to_string());
    }
    if name.len() > CHAIN_NAME_MAX {
        return Err(format!(
            "chain name '{name}' too long (max {CHAIN_NAME_MAX} chars)"
        ));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        return Err(format!("chain name '{name}' contains invalid characters"));
    }
    Ok(())
}

/// Validates a MAC address in colon-separated form.
pub fn validate_macaddr(s: &str) -> Result<(), String> {
    let groups: Vec<&str> = s.split(':').collect();
    let valid = groups.len() == 6
        && groups
            .iter()
            .all(|g| g.len() == 2 && g.chars().all(|c| c.is_ascii_hexdigit()));
    if valid {
        Ok(())
    } else {
        Err(format!("invalid MAC address '{s}'"))
    }
}

/// Validates a bridge name per Linux interface-name constraints
/// (IFNAMSIZ - 1). Does NOT check that the bridge exists.
pub fn validate_bridge_name(name: &str) -> Result<(), String> {
    if name.is_empty() {
        return Err("bridge name cannot be empty".to_string());
    }
    if name.len() > 15 {
        return Err(format!("bridge name '{name}' too long (max 15 chars)"));
    }
    if name == "." || name == ".." {
        return Err(format!("invalid bridge name '{name}'"));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
    {
        return Err(format!("bridge name '{name}' contains invalid characters"));
    }
    Ok(())
}


#[cfg(test)]
mod property_tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn test_port_accepts_exactly_1_to_65535(port in any::<u32>()) {
            let result = validate_port(port);
            if (1..=65535).contains(&port) {
                prop_assert_eq!(result.unwrap() as u32, port);
            } else {
                prop_assert!(result.is_err());
            }
        }

        #[test]
        fn test_port_range_consistency(start in 1u32..=65535, end in 1u32..=65535) {
            let result = validate_port_range(start, end);
            if start <= end {
                prop_assert_eq!(result.unwrap(), (start as u16, end as u16));
            } else {
                prop_assert!(result.is_err());
            }
        }

        #[test]
        fn test_iface_ref_index_bound(index in 0u32..100) {
            let result = validate_iface_ref(&format!("net{index}"));
            if index <= IFACE_MAX_INDEX {
                prop_assert_eq!(result.unwrap(), index);
            } else {
                prop_assert!(result.is_err());
            }
        }

        #[test]
        fn test_group_name_keeps_chains_in_bounds(name in "[a-zA-Z0-9_-]{1,18}") {
            prop_assert!(validate_group_name(&name).is_ok());
            let in_chain = format!("GROUP-{}-IN", name);
            let out_chain = format!("GROUP-{}-OUT", name);
            prop_assert!(validate_chain_name(&in_chain).is_ok());
            prop_assert!(validate_chain_name(&out_chain).is_ok());
        }

        #[test]
        fn test_group_name_rejects_separator_chars(
            prefix in "[a-zA-Z0-9]{1,8}",
            bad in "[^a-zA-Z0-9_-]"
        ) {
            let combined = format!("{}{}", prefix, bad);
            prop_assert!(validate_group_name(&combined).is_err());
        }
    }
}
