//! Cloud-init NoCloud seed generation — a pure function of the machine
//! spec: `spec → ISO bytes`. The seed carries `user-data`, `meta-data`, and
//! `network-config`, with the network matched to the derived MAC so the
//! guest configures the spec's static address.

use crate::config::MachineSpec;
use crate::error::ForgeError;
use crate::iso9660::{self, IsoFile};
use crate::naming;

/// Build the complete seed ISO for a spec. Returns `None`-equivalent only
/// via the caller: specs without a `cloud_init` section never reach here.
pub fn build_seed_iso(spec: &MachineSpec) -> Result<Vec<u8>, ForgeError> {
    let user_data = user_data(spec);
    let meta_data = meta_data(spec);
    let network_config = network_config(spec)?;

    Ok(iso9660::build_iso(
        "CIDATA",
        &[
            IsoFile {
                name: "meta-data",
                data: meta_data.as_bytes(),
            },
            IsoFile {
                name: "user-data",
                data: user_data.as_bytes(),
            },
            IsoFile {
                name: "network-config",
                data: network_config.as_bytes(),
            },
        ],
    ))
}

fn hostname(spec: &MachineSpec) -> &str {
    spec.cloud_init
        .as_ref()
        .and_then(|ci| ci.hostname.as_deref())
        .unwrap_or(&spec.name)
}

fn user_data(spec: &MachineSpec) -> String {
    let ci = spec.cloud_init.as_ref();

    if let Some(custom) = ci.and_then(|c| c.user_data.as_deref()) {
        return custom.to_string();
    }

    let mut out = String::from("#cloud-config\n");
    out.push_str(&format!("hostname: {}\n", hostname(spec)));
    out.push_str("preserve_hostname: false\n");
    if let Some(keys) = ci.map(|c| &c.ssh_keys).filter(|k| !k.is_empty()) {
        out.push_str("ssh_authorized_keys:\n");
        for key in keys {
            out.push_str(&format!("  - {key}\n"));
        }
    }
    out
}

fn meta_data(spec: &MachineSpec) -> String {
    format!(
        "instance-id: iid-{name}\nlocal-hostname: {host}\n",
        name = spec.name,
        host = hostname(spec)
    )
}

/// Netplan-style v2 network config pinned to the derived MAC.
fn network_config(spec: &MachineSpec) -> Result<String, ForgeError> {
    let mac = naming::mac_for_ip(&spec.network.ip)?;
    let address = if spec.network.ip.contains('/') {
        spec.network.ip.clone()
    } else {
        format!("{}/24", spec.network.ip)
    };

    let mut out = String::from("version: 2\nethernets:\n  eth0:\n");
    out.push_str(&format!("    match:\n      macaddress: \"{mac}\"\n"));
    out.push_str("    dhcp4: false\n");
    out.push_str(&format!("    addresses: [{address}]\n"));
    if let Some(gw) = &spec.network.gateway {
        out.push_str(&format!("    gateway4: {gw}\n"));
    }
    Ok(out)
}
