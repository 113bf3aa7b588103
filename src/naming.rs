//! Deterministic naming: volume names, MAC addresses, and tap interface
//! names derived from the VM name and its IPv4 address.
//!
//! The `<vmName>_` prefix on volume names is the only link between a VM and
//! its storage — teardown scans pools for this prefix to find volumes to
//! reclaim. Everything here is pure and stateless.

use std::net::IpAddr;

use crate::error::ForgeError;

/// Name of the boot disk volume for a VM.
pub fn boot_volume(vm: &str) -> String {
    format!("{vm}_boot.qcow2")
}

/// Name of a data disk volume, keyed by its guest device (e.g. `vdb`).
pub fn data_volume(vm: &str, device: &str) -> String {
    format!("{vm}_data-{device}.qcow2")
}

/// Name of the cloud-init seed volume for a VM.
pub fn cloudinit_volume(vm: &str) -> String {
    format!("{vm}_cloudinit.iso")
}

/// The ownership prefix shared by all volumes created for a VM.
///
/// The trailing underscore is load-bearing: `myvm-backup_boot.qcow2` must
/// not match the prefix for `myvm`.
pub fn volume_prefix(vm: &str) -> String {
    format!("{vm}_")
}

/// Derive a stable MAC address from an IPv4 address: `be:ef:` followed by
/// the four octets in hex. A CIDR suffix (`/24`) is accepted and ignored.
/// IPv6 addresses are rejected.
pub fn mac_for_ip(ip: &str) -> Result<String, ForgeError> {
    let octets = ipv4_octets(ip)?;
    Ok(format!(
        "be:ef:{:02x}:{:02x}:{:02x}:{:02x}",
        octets[0], octets[1], octets[2], octets[3]
    ))
}

/// Derive the host-side tap interface name from an IPv4 address:
/// `vm` + 8 hex chars, 10 characters total — under the 15-char IFNAMSIZ cap.
pub fn tap_for_ip(ip: &str) -> Result<String, ForgeError> {
    let octets = ipv4_octets(ip)?;
    Ok(format!(
        "vm{:02x}{:02x}{:02x}{:02x}",
        octets[0], octets[1], octets[2], octets[3]
    ))
}

fn ipv4_octets(ip: &str) -> Result<[u8; 4], ForgeError> {
    let addr = ip.split('/').next().unwrap_or(ip);
    match addr.trim().parse::<IpAddr>() {
        Ok(IpAddr::V4(v4)) => Ok(v4.octets()),
        Ok(IpAddr::V6(_)) => Err(ForgeError::validation(format!(
            "IPv6 address '{ip}' is not supported for MAC/interface derivation"
        ))),
        Err(_) => Err(ForgeError::validation(format!(
            "invalid IP address: '{ip}'"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn volume_names_carry_vm_prefix() {
        assert_eq!(boot_volume("myvm"), "myvm_boot.qcow2");
        assert_eq!(data_volume("myvm", "vdb"), "myvm_data-vdb.qcow2");
        assert_eq!(cloudinit_volume("myvm"), "myvm_cloudinit.iso");
        assert_eq!(volume_prefix("myvm"), "myvm_");
    }

    #[test]
    fn mac_from_octets() {
        assert_eq!(mac_for_ip("10.20.30.40").unwrap(), "be:ef:0a:14:1e:28");
        assert_eq!(mac_for_ip("10.55.22.22").unwrap(), "be:ef:0a:37:16:16");
    }

    #[test]
    fn mac_ignores_cidr_suffix() {
        assert_eq!(
            mac_for_ip("10.20.30.40/24").unwrap(),
            mac_for_ip("10.20.30.40").unwrap()
        );
    }

    #[test]
    fn mac_rejects_ipv6() {
        assert!(mac_for_ip("fd00::1").is_err());
    }

    #[test]
    fn mac_rejects_garbage() {
        assert!(mac_for_ip("not-an-ip").is_err());
    }

    #[test]
    fn tap_name_is_ten_chars() {
        let tap = tap_for_ip("10.55.22.22").unwrap();
        assert_eq!(tap, "vm0a371616");
        assert_eq!(tap.len(), 10);
    }
}
