//! Capability blob construction: PCI capability byte layout parsing is
//! treated as an opaque copy-and-append, never interpreted field by field.
//! Grounded in `original_source/src/caps.hpp`/`caps.cpp`'s `Capabilities`
//! class (`pm()`, `msix()`, `exp()`, `dsn()`): each builder returns an
//! opaque byte blob that `Transport::add_capability` records verbatim,
//! without this crate interpreting its internal layout beyond the
//! leading capability-ID byte every PCI capability shares.

/// Standard PCI capability IDs this device's capability chain builds.
/// Just identifiers for the opaque blobs below; this crate never parses
/// a capability's payload.
pub mod cap_id {
    pub const PM: u8 = 0x01;
    pub const MSIX: u8 = 0x11;
    pub const EXPRESS: u8 = 0x10;
}

/// Extended-config-space capability IDs.
pub mod ext_cap_id {
    pub const DSN: u16 = 0x0003;
}

/// Power management capability (PCI PM 1.2): id, next, pmc, pmcsr.
pub fn pm() -> Vec<u8> {
    vec![cap_id::PM, 0, 0x03, 0x00, 0x00, 0x00, 0x00, 0x00]
}

/// Links a sequence of standard (non-extended) capability blobs into a
/// walkable chain, starting at `base_offset` in config space. Each blob's
/// byte 1 (the "next" pointer every standard PCI capability shares) is
/// overwritten with the config-space offset of the following blob, or 0
/// for the last one. Blobs are otherwise untouched and kept in the given
/// order, matching how `add_caps` declares them.
pub fn link_chain(base_offset: u8, mut blobs: Vec<Vec<u8>>) -> Vec<Vec<u8>> {
    let mut offset = base_offset as usize;
    let offsets: Vec<usize> = blobs
        .iter()
        .map(|blob| {
            let this = offset;
            offset += blob.len();
            this
        })
        .collect();

    for (i, blob) in blobs.iter_mut().enumerate() {
        let next = offsets.get(i + 1).copied().unwrap_or(0);
        blob[1] = next as u8;
    }
    blobs
}

/// MSI-X capability: id, next, message-control, table-offset/bir,
/// pba-offset/bir. `table_size` is the (zero-based) vector count minus
/// one per the PCI spec, `table_bar`/`pba_bar` index which BAR backs
/// each structure.
pub fn msix(table_size: u16, table_bar: u8, table_offset: u32, pba_bar: u8, pba_offset: u32) -> Vec<u8> {
    let message_control = table_size.saturating_sub(1) & 0x07ff;
    let mut blob = vec![cap_id::MSIX, 0];
    blob.extend_from_slice(&message_control.to_le_bytes());
    blob.extend_from_slice(&((table_offset & !0x7) | table_bar as u32).to_le_bytes());
    blob.extend_from_slice(&((pba_offset & !0x7) | pba_bar as u32).to_le_bytes());
    blob
}

/// PCI Express capability, read-only from the guest's perspective.
pub fn express() -> Vec<u8> {
    vec![cap_id::EXPRESS, 0, 0x02, 0x00, 0x00, 0x00, 0x00, 0x00]
}

/// Device Serial Number, a read-only extended-config-space capability.
pub fn dsn(serial: u64) -> Vec<u8> {
    let mut blob = Vec::with_capacity(2 + 2 + 8);
    blob.extend_from_slice(&ext_cap_id::DSN.to_le_bytes());
    blob.extend_from_slice(&[0u8; 2]); // version + next pointer, opaque
    blob.extend_from_slice(&serial.to_le_bytes());
    blob
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_blob_leads_with_its_capability_id() {
        assert_eq!(pm()[0], cap_id::PM);
        assert_eq!(msix(4, 0, 0, 0, 0x1000)[0], cap_id::MSIX);
        assert_eq!(express()[0], cap_id::EXPRESS);
    }

    #[test]
    fn dsn_blob_carries_the_extended_capability_id() {
        let blob = dsn(0xdeadbeefcafef00d);
        let id = u16::from_le_bytes([blob[0], blob[1]]);
        assert_eq!(id, ext_cap_id::DSN);
    }

    #[test]
    fn link_chain_points_each_cap_at_the_next_ones_offset() {
        let blobs = link_chain(0x40, vec![pm(), msix(4, 0, 0, 0, 0x1000), express()]);
        let pm_len = blobs[0].len();
        let msix_len = blobs[1].len();

        assert_eq!(blobs[0][1] as usize, 0x40 + pm_len);
        assert_eq!(blobs[1][1] as usize, 0x40 + pm_len + msix_len);
        assert_eq!(blobs[2][1], 0);
    }

    #[test]
    fn link_chain_of_a_single_cap_terminates_immediately() {
        let blobs = link_chain(0x40, vec![pm()]);
        assert_eq!(blobs[0][1], 0);
    }
}
