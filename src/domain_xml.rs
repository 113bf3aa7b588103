//! Libvirt domain XML generation — a pure function of the spec plus the
//! resolved volume paths and derived network identity.

use crate::config::MachineSpec;

/// Resolved inputs the XML needs beyond the spec itself.
pub struct DomainDisks {
    /// Path of the boot volume inside the VMs pool.
    pub boot_path: String,
    /// `(guest device, volume path)` per data disk, in spec order.
    pub data: Vec<(String, String)>,
    /// Path of the cloud-init seed ISO, if configured.
    pub seed_path: Option<String>,
}

/// Generate the domain XML for a VM.
pub fn render(spec: &MachineSpec, disks: &DomainDisks, mac: &str, tap: &str) -> String {
    let name = &spec.name;
    let memory_kib = spec.resources.memory_mb * 1024;
    let cpus = spec.resources.cpus;
    let bridge = &spec.network.bridge;
    let boot = &disks.boot_path;

    let mut device_xml = format!(
        r#"    <disk type='file' device='disk'>
      <driver name='qemu' type='qcow2'/>
      <source file='{boot}'/>
      <target dev='vda' bus='virtio'/>
    </disk>
"#
    );

    for (dev, path) in &disks.data {
        device_xml.push_str(&format!(
            r#"    <disk type='file' device='disk'>
      <driver name='qemu' type='qcow2'/>
      <source file='{path}'/>
      <target dev='{dev}' bus='virtio'/>
    </disk>
"#
        ));
    }

    if let Some(seed) = &disks.seed_path {
        device_xml.push_str(&format!(
            r#"    <disk type='file' device='cdrom'>
      <driver name='qemu' type='raw'/>
      <source file='{seed}'/>
      <target dev='sda' bus='sata'/>
      <readonly/>
    </disk>
"#
        ));
    }

    format!(
        r#"<domain type='kvm'>
  <name>{name}</name>
  <memory unit='KiB'>{memory_kib}</memory>
  <vcpu>{cpus}</vcpu>
  <os>
    <type arch='x86_64' machine='q35'>hvm</type>
    <boot dev='hd'/>
  </os>
  <features>
    <acpi/>
    <apic/>
  </features>
  <devices>
{device_xml}    <interface type='bridge'>
      <mac address='{mac}'/>
      <source bridge='{bridge}'/>
      <target dev='{tap}'/>
      <model type='virtio'/>
    </interface>
    <serial type='pty'>
      <target port='0'/>
    </serial>
    <console type='pty'>
      <target type='serial' port='0'/>
    </console>
  </devices>
</domain>
"#
    )
}
