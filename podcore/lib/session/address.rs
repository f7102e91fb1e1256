use std::sync::Mutex;

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The first PCI slot handed out to hotplugged devices. Lower slots are
/// taken by the hypervisor's built-in devices.
const FIRST_PCI_SLOT: u32 = 3;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Monotonic PCI-slot and SCSI-id counters for one session.
///
/// This is the one piece of session state touched outside the hub consumer:
/// device provisioning tasks allocate addresses directly while they build
/// monitor sessions, so the counters sit behind their own mutex.
#[derive(Debug)]
pub struct AddressAllocator {
    /// The next free PCI slot.
    next_pci_slot: Mutex<u32>,

    /// The next free SCSI id.
    next_scsi_id: Mutex<u32>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl AddressAllocator {
    /// Creates a new allocator with all addresses free.
    pub fn new() -> Self {
        Self {
            next_pci_slot: Mutex::new(FIRST_PCI_SLOT),
            next_scsi_id: Mutex::new(0),
        }
    }

    /// Allocates the next PCI slot.
    pub fn next_pci_slot(&self) -> u32 {
        let mut slot = self.next_pci_slot.lock().unwrap();
        let allocated = *slot;
        *slot += 1;
        allocated
    }

    /// Allocates the next SCSI id.
    pub fn next_scsi_id(&self) -> u32 {
        let mut id = self.next_scsi_id.lock().unwrap();
        let allocated = *id;
        *id += 1;
        allocated
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Derives the guest device name for a SCSI id.
///
/// Ids map to base-26 letter suffixes the way disks are named under Linux:
/// 0 → "sda", 25 → "sdz", 26 → "sdaa", 27 → "sdab", and so on.
pub fn scsi_device_name(id: u32) -> String {
    let mut id = id;
    let mut suffix = Vec::new();

    loop {
        suffix.push(b'a' + (id % 26) as u8);
        id /= 26;
        if id == 0 {
            break;
        }
        id -= 1;
    }

    suffix.reverse();
    format!("sd{}", String::from_utf8_lossy(&suffix))
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Default for AddressAllocator {
    fn default() -> Self {
        Self::new()
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scsi_device_name_bijection() {
        assert_eq!(scsi_device_name(0), "sda");
        assert_eq!(scsi_device_name(1), "sdb");
        assert_eq!(scsi_device_name(25), "sdz");
        assert_eq!(scsi_device_name(26), "sdaa");
        assert_eq!(scsi_device_name(27), "sdab");
        assert_eq!(scsi_device_name(51), "sdaz");
        assert_eq!(scsi_device_name(52), "sdba");
        assert_eq!(scsi_device_name(701), "sdzz");
        assert_eq!(scsi_device_name(702), "sdaaa");
    }

    #[test]
    fn test_allocator_counters_are_independent_and_monotonic() {
        let allocator = AddressAllocator::new();
        assert_eq!(allocator.next_scsi_id(), 0);
        assert_eq!(allocator.next_scsi_id(), 1);
        let first_slot = allocator.next_pci_slot();
        assert_eq!(allocator.next_pci_slot(), first_slot + 1);
        // SCSI ids are unaffected by PCI allocations.
        assert_eq!(allocator.next_scsi_id(), 2);
    }
}
