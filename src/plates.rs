//! Plate families
//!
//! Every plate answers on one of eight consecutive addresses above its
//! family's base address, selected by jumpers on the board. Families differ
//! in whether they drive the ACK wire, which decides how the engine must
//! talk to them.

use std::collections::HashMap;

use once_cell::sync::Lazy;

/// Boards per family (board ids 0-7)
pub const BOARDS_PER_FAMILY: u8 = 8;

/// Command every plate answers with its own address
pub const CMD_GET_ADDRESS: u8 = 0x00;

/// Command every plate answers with its identity string
pub const CMD_GET_ID: u8 = 0x01;

/// A family of plates sharing an address range
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlateFamily {
    /// Short identifier (e.g., "relay")
    pub id: &'static str,
    /// Display name
    pub name: &'static str,
    /// Address of board 0
    pub base_address: u8,
    /// Whether the family drives ACK and appends verification bytes
    pub uses_ack: bool,
    /// Identity string returned by `CMD_GET_ID`
    pub id_string: &'static str,
}

impl PlateFamily {
    /// Whether `address` belongs to this family
    pub fn contains(&self, address: u8) -> bool {
        address >= self.base_address && address < self.base_address + BOARDS_PER_FAMILY
    }

    /// Bus address of a board, if the board id is in range
    pub fn address_of(&self, board: u8) -> Option<u8> {
        (board < BOARDS_PER_FAMILY).then(|| self.base_address + board)
    }
}

pub static DAQC: PlateFamily = PlateFamily {
    id: "daqc",
    name: "DAQCplate",
    base_address: 8,
    uses_ack: false,
    id_string: "Pi-Plate DAQC",
};

pub static MOTOR: PlateFamily = PlateFamily {
    id: "motor",
    name: "MOTORplate",
    base_address: 16,
    uses_ack: false,
    id_string: "Pi-Plate MOTOR",
};

pub static RELAY: PlateFamily = PlateFamily {
    id: "relay",
    name: "RELAYplate",
    base_address: 24,
    uses_ack: false,
    id_string: "Pi-Plate RELAY",
};

pub static DAQC2: PlateFamily = PlateFamily {
    id: "daqc2",
    name: "DAQC2plate",
    base_address: 32,
    uses_ack: true,
    id_string: "Pi-Plate DAQC2plate",
};

pub static THERMO: PlateFamily = PlateFamily {
    id: "thermo",
    name: "THERMOplate",
    base_address: 40,
    uses_ack: true,
    id_string: "Pi-Plate THERMOplate",
};

pub static TINKER: PlateFamily = PlateFamily {
    id: "tinker",
    name: "TINKERplate",
    base_address: 48,
    uses_ack: true,
    id_string: "Pi-Plate TINKERplate",
};

/// All known families, ordered by base address
pub static FAMILIES: [&PlateFamily; 6] = [&DAQC, &MOTOR, &RELAY, &DAQC2, &THERMO, &TINKER];

/// Registry of families by identifier
pub static FAMILY_REGISTRY: Lazy<HashMap<&'static str, &'static PlateFamily>> = Lazy::new(|| {
    let mut m = HashMap::new();
    for family in FAMILIES {
        m.insert(family.id, family);
    }
    m.insert("daqcplate", &DAQC);
    m.insert("motorplate", &MOTOR);
    m.insert("relayplate", &RELAY);
    m.insert("daqc2plate", &DAQC2);
    m.insert("thermoplate", &THERMO);
    m.insert("tinkerplate", &TINKER);
    m
});

/// Look up a family by identifier
pub fn get_family(name: &str) -> Option<&'static PlateFamily> {
    FAMILY_REGISTRY.get(name.to_lowercase().as_str()).copied()
}

/// Family owning a bus address
pub fn family_for_address(address: u8) -> Option<&'static PlateFamily> {
    FAMILIES.iter().copied().find(|f| f.contains(address))
}
