//! End-to-end capability declaration: a device with PM, MSI-X, PCIe
//! Express and DSN capabilities should expose a config space in which
//! every standard capability is reachable by walking the linked list,
//! and the DSN capability carries the extended capability id.

use std::sync::Arc;

use vmux::caps;
use vmux::device::Device;
use vmux::dma::GuardedDmaTable;
use vmux_transport::{LoopbackTransport, PciBusType, PciIdentity, Transport};

const STD_CAP_BASE: u8 = 0x40;

struct BareDevice;

impl Device for BareDevice {
    fn declare(&mut self, transport: &mut dyn Transport, _dma: Arc<GuardedDmaTable>) -> vmux::Result<()> {
        let standard = caps::link_chain(
            STD_CAP_BASE,
            vec![caps::pm(), caps::msix(4, 3, 0, 3, 0x1000), caps::express()],
        );
        for blob in standard {
            transport.add_capability(blob)?;
        }
        transport.add_capability(caps::dsn(0xdeadbeefcafef00d))?;
        Ok(())
    }
}

fn identity() -> PciIdentity {
    PciIdentity {
        vendor_id: 0x1af4,
        device_id: 0x7abc,
        subsystem_vendor_id: 0,
        subsystem_id: 0,
        class_base: 2,
        class_subclass: 0,
        class_prog_if: 0,
        revision_id: 1,
    }
}

#[test]
fn declared_capability_chain_is_fully_walkable_and_dsn_id_matches() {
    let mut transport = LoopbackTransport::new(4096).unwrap();
    transport.realize(identity(), PciBusType::Express).unwrap();
    BareDevice.declare(&mut transport, GuardedDmaTable::new()).unwrap();

    let blobs = transport.declared_capabilities().to_vec();
    assert_eq!(blobs.len(), 4);

    // The standard caps are laid out back to back starting at
    // `STD_CAP_BASE`; reconstruct each one's config-space offset the same
    // way `link_chain` did when it set the next pointers, then walk the
    // chain purely by following those pointers.
    let mut offset = STD_CAP_BASE as usize;
    let mut offsets_by_id = std::collections::HashMap::new();
    for blob in &blobs[..3] {
        offsets_by_id.insert(offset, blob.clone());
        offset += blob.len();
    }

    let mut visited = Vec::new();
    let mut cursor = STD_CAP_BASE as usize;
    loop {
        let blob = offsets_by_id
            .get(&cursor)
            .unwrap_or_else(|| panic!("capability chain broken at offset {cursor:#x}"));
        visited.push(blob[0]);
        let next = blob[1] as usize;
        if next == 0 {
            break;
        }
        cursor = next;
    }

    assert_eq!(
        visited,
        vec![caps::cap_id::PM, caps::cap_id::MSIX, caps::cap_id::EXPRESS]
    );

    let dsn_blob = &blobs[3];
    let dsn_id = u16::from_le_bytes([dsn_blob[0], dsn_blob[1]]);
    assert_eq!(dsn_id, caps::ext_cap_id::DSN);
}
