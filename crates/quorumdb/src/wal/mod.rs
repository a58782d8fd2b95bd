// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 quorumdb contributors

//! Write-ahead log: a circular log of fixed-size prepare slots plus a dense
//! header ring.
//!
//! Every prepare occupies slot `op % SLOT_COUNT` in both regions: the full
//! message (header || body) in the prepare region, the header alone in the
//! header ring. `write_prepare` writes the body region first and the header
//! ring second, so after a crash:
//!
//! - ring valid + body valid + checksums match  -> clean slot
//! - ring valid + body torn/mismatched          -> torn slot (dirty)
//! - ring garbage + body valid                  -> header recovered from body
//! - both garbage                               -> faulty slot
//! - both zero                                  -> empty slot
//!
//! A valid header found in the wrong slot is treated as garbage: it can
//! only appear through misdirected writes.

pub mod journal;

pub use journal::{slot_for_op, Journal, SlotSet};

use crate::config::{HEADER_SIZE, MESSAGE_SIZE_MAX, SLOT_COUNT};
use crate::error::Result;
use crate::storage::{Storage, Zone};
use crate::wire::{Command, Header, Message};

/// Outcome of recovering one slot at open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlotRecovery {
    /// Never written (both regions zero).
    Empty,
    /// Header and body verified.
    Clean(Header),
    /// Trustworthy header, unusable body: repair the body.
    Torn(Header),
    /// Nothing trustworthy in the slot.
    Faulty,
}

/// Write a prepare into its slot: body region first, then the header ring.
/// The flush after each region keeps the torn-write classification above
/// truthful.
pub fn write_prepare(storage: &mut dyn Storage, message: &Message) -> Result<()> {
    let header = &message.header;
    assert_eq!(header.command, Command::Prepare);
    assert!(!header.is_blank());
    let slot = slot_for_op(header.op);

    let mut buf = vec![0u8; MESSAGE_SIZE_MAX];
    let wire = message.encode();
    buf[..wire.len()].copy_from_slice(&wire);
    storage.write(Zone::WalPrepares, slot * MESSAGE_SIZE_MAX as u64, &buf)?;
    storage.flush()?;

    storage.write(Zone::WalHeaders, slot * HEADER_SIZE as u64, &header.encode_le())?;
    storage.flush()?;
    Ok(())
}

/// Header-only write: used when a peer supplies a canonical header without
/// the body. The slot's body stays dirty until repaired.
pub fn repair_header(storage: &mut dyn Storage, header: &Header) -> Result<()> {
    assert_eq!(header.command, Command::Prepare);
    let slot = slot_for_op(header.op);
    storage.write(Zone::WalHeaders, slot * HEADER_SIZE as u64, &header.encode_le())?;
    storage.flush()?;
    Ok(())
}

/// Read and fully validate the prepare in `slot`. Returns `None` when the
/// slot does not hold a clean prepare for the expected op layout (torn,
/// faulty, empty, or stale).
pub fn read_prepare(storage: &mut dyn Storage, slot: u64) -> Result<Option<Message>> {
    assert!(slot < SLOT_COUNT);
    let mut buf = vec![0u8; MESSAGE_SIZE_MAX];
    if storage.read(Zone::WalPrepares, slot * MESSAGE_SIZE_MAX as u64, &mut buf).is_err() {
        return Ok(None);
    }
    let Some(header) = Header::decode_le(&buf[..HEADER_SIZE]) else {
        return Ok(None);
    };
    if !header.valid_checksum() || header.command != Command::Prepare {
        return Ok(None);
    }
    if slot_for_op(header.op) != slot {
        return Ok(None);
    }
    let body = &buf[HEADER_SIZE..header.size as usize];
    if !header.valid_checksum_body(body) {
        return Ok(None);
    }
    Ok(Some(Message::from_parts(header, body.to_vec())))
}

/// Recovery scan at open: classify every slot.
pub fn recover(storage: &mut dyn Storage) -> Result<Vec<SlotRecovery>> {
    let mut slots = Vec::with_capacity(SLOT_COUNT as usize);
    for slot in 0..SLOT_COUNT {
        slots.push(recover_slot(storage, slot)?);
    }
    let torn = slots.iter().filter(|s| matches!(s, SlotRecovery::Torn(_))).count();
    let faulty = slots.iter().filter(|s| matches!(s, SlotRecovery::Faulty)).count();
    if torn + faulty > 0 {
        log::warn!("[wal] recovery: {} torn, {} faulty slots", torn, faulty);
    }
    Ok(slots)
}

fn recover_slot(storage: &mut dyn Storage, slot: u64) -> Result<SlotRecovery> {
    let mut ring_buf = [0u8; HEADER_SIZE];
    let ring_ok = storage.read(Zone::WalHeaders, slot * HEADER_SIZE as u64, &mut ring_buf).is_ok();
    let ring_header = if ring_ok {
        Header::decode_le(&ring_buf)
            .filter(|h| h.valid_checksum())
            .filter(|h| h.command == Command::Prepare && slot_for_op(h.op) == slot)
    } else {
        None
    };
    let ring_zero = ring_ok && ring_buf.iter().all(|&b| b == 0);

    let mut body_buf = vec![0u8; MESSAGE_SIZE_MAX];
    let body_ok =
        storage.read(Zone::WalPrepares, slot * MESSAGE_SIZE_MAX as u64, &mut body_buf).is_ok();
    let body_zero = body_ok && body_buf.iter().all(|&b| b == 0);
    let prepare = if body_ok {
        Header::decode_le(&body_buf[..HEADER_SIZE])
            .filter(|h| h.valid_checksum())
            .filter(|h| h.command == Command::Prepare && slot_for_op(h.op) == slot)
            .filter(|h| h.valid_checksum_body(&body_buf[HEADER_SIZE..h.size as usize]))
    } else {
        None
    };

    Ok(match (ring_header, prepare) {
        (Some(ring), Some(body)) => {
            if ring.checksum == body.checksum {
                SlotRecovery::Clean(ring)
            } else {
                // Crash between the body write and the header write: the
                // ring names the op that was actually prepared; its body
                // has been overwritten.
                SlotRecovery::Torn(ring)
            }
        }
        (Some(ring), None) => SlotRecovery::Torn(ring),
        (None, Some(body)) => {
            // Header ring lost; the prepare itself carries a verified
            // header. Write it back so the ring converges.
            repair_header(storage, &body)?;
            log::debug!("[wal] slot {} header recovered from body (op={})", slot, body.op);
            SlotRecovery::Clean(body)
        }
        (None, None) => {
            if ring_zero && body_zero {
                SlotRecovery::Empty
            } else {
                SlotRecovery::Faulty
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::SimDisk;
    use crate::wire::Operation;

    fn prepare(op: u64, body: &[u8]) -> Message {
        let mut header = Header::new(1, Command::Prepare);
        header.op = op;
        header.operation = Operation::USER_MIN;
        Message::new(header, body.to_vec())
    }

    #[test]
    fn test_write_then_read() {
        let disk = SimDisk::new();
        let mut storage = disk.storage();
        let msg = prepare(3, b"transfer");
        write_prepare(&mut storage, &msg).expect("write");
        let read = read_prepare(&mut storage, slot_for_op(3)).expect("io").expect("clean");
        assert_eq!(read, msg);
    }

    #[test]
    fn test_recover_clean_and_empty() {
        let disk = SimDisk::new();
        let mut storage = disk.storage();
        write_prepare(&mut storage, &prepare(1, b"a")).expect("write");
        let slots = recover(&mut storage).expect("recover");
        assert!(matches!(&slots[1], SlotRecovery::Clean(h) if h.op == 1));
        assert_eq!(slots[2], SlotRecovery::Empty);
    }

    #[test]
    fn test_recover_torn_body() {
        let disk = SimDisk::new();
        let mut storage = disk.storage();
        let msg = prepare(4, b"payload");
        write_prepare(&mut storage, &msg).expect("write");
        // Corrupt the body tail only; the header ring entry stays valid.
        disk.corrupt(Zone::WalPrepares, 4 * MESSAGE_SIZE_MAX as u64 + HEADER_SIZE as u64, 8);
        let slots = recover(&mut storage).expect("recover");
        assert!(matches!(&slots[4], SlotRecovery::Torn(h) if h.op == 4));
    }

    #[test]
    fn test_recover_header_from_body() {
        let disk = SimDisk::new();
        let mut storage = disk.storage();
        let msg = prepare(5, b"payload");
        write_prepare(&mut storage, &msg).expect("write");
        disk.corrupt(Zone::WalHeaders, 5 * HEADER_SIZE as u64, HEADER_SIZE);
        let slots = recover(&mut storage).expect("recover");
        assert!(matches!(&slots[5], SlotRecovery::Clean(h) if h.op == 5));
        // The ring was healed in place.
        let slots = recover(&mut storage).expect("recover again");
        assert!(matches!(&slots[5], SlotRecovery::Clean(h) if h.op == 5));
    }

    #[test]
    fn test_recover_faulty_when_both_corrupt() {
        let disk = SimDisk::new();
        let mut storage = disk.storage();
        let msg = prepare(6, b"payload");
        write_prepare(&mut storage, &msg).expect("write");
        disk.corrupt(Zone::WalHeaders, 6 * HEADER_SIZE as u64, HEADER_SIZE);
        disk.corrupt(Zone::WalPrepares, 6 * MESSAGE_SIZE_MAX as u64, HEADER_SIZE);
        let slots = recover(&mut storage).expect("recover");
        assert_eq!(slots[6], SlotRecovery::Faulty);
    }

    #[test]
    fn test_garbage_in_unwritten_slot_is_faulty() {
        let disk = SimDisk::new();
        let mut storage = disk.storage();
        disk.corrupt(Zone::WalPrepares, 22 * MESSAGE_SIZE_MAX as u64, 64);
        let slots = recover(&mut storage).expect("recover");
        assert_eq!(slots[22], SlotRecovery::Faulty);
    }

    #[test]
    fn test_repair_header_then_body_still_dirty() {
        let disk = SimDisk::new();
        let mut storage = disk.storage();
        let msg = prepare(7, b"payload");
        repair_header(&mut storage, &msg.header).expect("repair header");
        let slots = recover(&mut storage).expect("recover");
        assert!(matches!(&slots[7], SlotRecovery::Torn(h) if h.op == 7));
        // Supplying the body completes the repair.
        write_prepare(&mut storage, &msg).expect("write");
        let slots = recover(&mut storage).expect("recover");
        assert!(matches!(&slots[7], SlotRecovery::Clean(h) if h.op == 7));
    }

    #[test]
    fn test_stale_op_in_slot_not_confused() {
        let disk = SimDisk::new();
        let mut storage = disk.storage();
        // Op 2 and later op 2 + SLOT_COUNT share slot 2.
        write_prepare(&mut storage, &prepare(2, b"old")).expect("write old");
        write_prepare(&mut storage, &prepare(2 + SLOT_COUNT, b"new")).expect("write new");
        let read = read_prepare(&mut storage, 2).expect("io").expect("clean");
        assert_eq!(read.header.op, 2 + SLOT_COUNT);
    }
}
